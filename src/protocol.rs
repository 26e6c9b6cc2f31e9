//! Wire messages exchanged with classification backends
//!
//! Video frames go out as raw binary messages with no envelope. Everything
//! else is JSON text carrying a `type` discriminator:
//!
//! - `landmarks_sequence`: one landmark batch (`OutboundMessage`)
//! - `offer` / `answer` / `candidate` / `join` / `leave`: peer negotiation for
//!   the alternate transport mode (`SignalingMessage`)
//! - anything the backend sends back (`BackendMessage`)

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::landmarks::LandmarkSample;

#[derive(Error, Debug)]
pub enum ProtocolParseError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a JSON object")]
    NotAnObject,

    #[error("message has no string 'type' field")]
    MissingType,

    #[error("unexpected message type '{0}'")]
    UnexpectedType(String),
}

/// Inbound JSON message from a backend
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl BackendMessage {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// Parse an inbound text message. Only JSON objects with a string `type`
/// field are accepted.
pub fn parse_inbound(text: &str) -> Result<BackendMessage, ProtocolParseError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(mut fields) = value else {
        return Err(ProtocolParseError::NotAnObject);
    };

    match fields.remove("type") {
        Some(Value::String(kind)) => Ok(BackendMessage { kind, fields }),
        _ => Err(ProtocolParseError::MissingType),
    }
}

/// JSON messages the client sends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundMessage {
    LandmarksSequence(LandmarkSequence),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandmarkSequence {
    pub sequence: Vec<LandmarkSample>,
    /// Window start, unix milliseconds
    pub timestamp: u64,
    pub frame_count: usize,
}

impl OutboundMessage {
    pub fn landmarks(sequence: Vec<LandmarkSample>, timestamp: u64) -> Self {
        let frame_count = sequence.len();
        OutboundMessage::LandmarksSequence(LandmarkSequence {
            sequence,
            timestamp,
            frame_count,
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalingKind {
    Join,
    Offer,
    Answer,
    Candidate,
    Leave,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u32>,
}

/// Peer negotiation message: `{ type, room_id, peer_id, offer | answer | candidate }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: SignalingKind,
    pub room_id: String,
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
}

impl SignalingMessage {
    fn bare(kind: SignalingKind, room_id: &str, peer_id: &str) -> Self {
        Self {
            kind,
            room_id: room_id.to_owned(),
            peer_id: peer_id.to_owned(),
            offer: None,
            answer: None,
            candidate: None,
        }
    }

    pub fn join(room_id: &str, peer_id: &str) -> Self {
        Self::bare(SignalingKind::Join, room_id, peer_id)
    }

    pub fn leave(room_id: &str, peer_id: &str) -> Self {
        Self::bare(SignalingKind::Leave, room_id, peer_id)
    }

    pub fn offer(room_id: &str, peer_id: &str, sdp: impl Into<String>) -> Self {
        Self {
            offer: Some(SessionDescription {
                sdp_type: "offer".into(),
                sdp: sdp.into(),
            }),
            ..Self::bare(SignalingKind::Offer, room_id, peer_id)
        }
    }

    pub fn answer(room_id: &str, peer_id: &str, sdp: impl Into<String>) -> Self {
        Self {
            answer: Some(SessionDescription {
                sdp_type: "answer".into(),
                sdp: sdp.into(),
            }),
            ..Self::bare(SignalingKind::Answer, room_id, peer_id)
        }
    }

    pub fn candidate(room_id: &str, peer_id: &str, candidate: IceCandidate) -> Self {
        Self {
            candidate: Some(candidate),
            ..Self::bare(SignalingKind::Candidate, room_id, peer_id)
        }
    }
}

impl TryFrom<&BackendMessage> for SignalingMessage {
    type Error = ProtocolParseError;

    fn try_from(message: &BackendMessage) -> Result<Self, Self::Error> {
        if !matches!(
            message.kind.as_str(),
            "join" | "offer" | "answer" | "candidate" | "leave"
        ) {
            return Err(ProtocolParseError::UnexpectedType(message.kind.clone()));
        }
        let value = serde_json::to_value(message)?;
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmarks::Landmark;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn test_landmarks_sequence_envelope() {
        let sample = LandmarkSample {
            timestamp_ms: 5,
            pose: vec![Landmark::new(0.5, 0.25, 0.0)],
            left_hand: vec![],
            right_hand: vec![],
        };
        let msg = OutboundMessage::landmarks(vec![sample], 1_700_000_000_000);
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "landmarks_sequence");
        assert_eq!(value["data"]["frame_count"], 1);
        assert_eq!(value["data"]["timestamp"], 1_700_000_000_000u64);
        assert_eq!(value["data"]["sequence"][0]["pose"][0]["x"], 0.5);
    }

    #[test]
    fn test_parse_inbound_prediction() {
        let msg = parse_inbound(r#"{"type":"prediction","label":"thank_you","confidence":0.91}"#)
            .unwrap();
        assert_eq!(msg.kind, "prediction");
        assert_eq!(msg.get("label"), Some(&json!("thank_you")));
        assert!(msg.get("type").is_none());
    }

    #[test]
    fn test_parse_inbound_rejects_malformed() {
        assert_matches!(parse_inbound("{oops"), Err(ProtocolParseError::Json(_)));
        assert_matches!(parse_inbound("[1,2,3]"), Err(ProtocolParseError::NotAnObject));
        assert_matches!(parse_inbound(r#"{"label":"x"}"#), Err(ProtocolParseError::MissingType));
        assert_matches!(parse_inbound(r#"{"type":7}"#), Err(ProtocolParseError::MissingType));
    }

    #[test]
    fn test_signaling_offer_shape() {
        let msg = SignalingMessage::offer("room-1", "client-a", "v=0");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "offer",
                "room_id": "room-1",
                "peer_id": "client-a",
                "offer": { "type": "offer", "sdp": "v=0" }
            })
        );
    }

    #[test]
    fn test_signaling_from_backend_candidate() {
        let inbound = parse_inbound(
            r#"{"type":"candidate","room_id":"r","peer_id":"backend",
                "candidate":{"candidate":"candidate:1 1 UDP 1 10.0.0.2 5000 typ host","sdpMLineIndex":0}}"#,
        )
        .unwrap();

        let msg = SignalingMessage::try_from(&inbound).unwrap();
        assert_eq!(msg.kind, SignalingKind::Candidate);
        assert_eq!(msg.candidate.unwrap().sdp_mline_index, Some(0));
    }

    #[test]
    fn test_signaling_rejects_other_types() {
        let inbound = parse_inbound(r#"{"type":"prediction"}"#).unwrap();
        assert_matches!(
            SignalingMessage::try_from(&inbound),
            Err(ProtocolParseError::UnexpectedType(_))
        );
    }
}

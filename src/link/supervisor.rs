//! Reconnection supervisor
//!
//! Watches registry state events and repairs links that dropped to `error`.
//! Per link it walks `Idle -> Scheduled -> Reconnecting -> Idle`, or ends in
//! `Failed` once the link's `retry_count` reaches `max_retries`.
//!
//! All supervisor state lives inside one task. Pending reconnects are plain
//! deadlines in that state, so aborting the task cancels every timer at once.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::backoff::BackoffPolicy;
use super::guards::AbortOnDrop;
use super::registry::ConnectionRegistry;
use super::{LinkError, LinkEvent, LinkId, LinkState};
use crate::config::ReconnectConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorStatus {
    /// Reconnect attempt `attempt` will start after `delay`
    Scheduled {
        link_id: LinkId,
        attempt: u32,
        delay: Duration,
    },
    Recovered {
        link_id: LinkId,
        attempts: u32,
    },
    /// Retries exhausted; published once per link
    Failed {
        link_id: LinkId,
        attempts: u32,
    },
}

impl SupervisorStatus {
    pub fn link_id(&self) -> LinkId {
        match self {
            Self::Scheduled { link_id, .. }
            | Self::Recovered { link_id, .. }
            | Self::Failed { link_id, .. } => *link_id,
        }
    }

    /// The permanent link error carried by `Failed`
    pub fn error(&self) -> Option<LinkError> {
        match *self {
            Self::Failed { link_id, attempts } => Some(LinkError::Exhausted { link_id, attempts }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Scheduled { due: Instant },
    Reconnecting,
    Failed,
}

#[derive(Debug)]
struct Tracked {
    phase: Phase,
    /// Reconnects started since the link was last healthy
    attempts: u32,
}

impl Default for Tracked {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            attempts: 0,
        }
    }
}

pub struct ReconnectSupervisor {
    registry: Arc<ConnectionRegistry>,
    policy: BackoffPolicy,
    max_retries: u32,
    monitor_interval: Duration,
    status_tx: broadcast::Sender<SupervisorStatus>,
    task: Mutex<Option<AbortOnDrop>>,
}

impl ReconnectSupervisor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        policy: BackoffPolicy,
        max_retries: u32,
        monitor_interval: Duration,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(64);
        Self {
            registry,
            policy,
            max_retries,
            monitor_interval,
            status_tx,
            task: Mutex::new(None),
        }
    }

    pub fn from_config(registry: Arc<ConnectionRegistry>, config: &ReconnectConfig) -> Self {
        Self::new(
            registry,
            BackoffPolicy::from(config),
            config.max_retries,
            Duration::from_millis(config.monitor_interval_ms),
        )
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SupervisorStatus> {
        self.status_tx.subscribe()
    }

    /// Spawn the supervising task. Events published after this call are seen.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let events = self.registry.subscribe_state();
        let worker = Worker {
            registry: Arc::clone(&self.registry),
            policy: self.policy.clone(),
            max_retries: self.max_retries,
            status_tx: self.status_tx.clone(),
            tracked: HashMap::new(),
        };
        let monitor_interval = self.monitor_interval.max(Duration::from_millis(1));

        *task = Some(AbortOnDrop::new(
            tokio::spawn(worker.run(events, monitor_interval)),
            "reconnect-supervisor",
        ));
        info!(
            max_retries = self.max_retries,
            monitor_ms = monitor_interval.as_millis() as u64,
            "Reconnect supervisor started"
        );
    }

    /// Abort the task and every pending reconnect. Calling it again is a no-op.
    pub fn stop(&self) {
        if let Some(mut task) = self.task.lock().take() {
            task.abort();
            info!("Reconnect supervisor stopped");
        }
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    registry: Arc<ConnectionRegistry>,
    policy: BackoffPolicy,
    max_retries: u32,
    status_tx: broadcast::Sender<SupervisorStatus>,
    tracked: HashMap<LinkId, Tracked>,
}

impl Worker {
    async fn run(mut self, mut events: broadcast::Receiver<LinkEvent>, monitor_interval: Duration) {
        let mut monitor = interval_at(Instant::now() + monitor_interval, monitor_interval);
        monitor.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Links that failed before we subscribed
        self.monitor_pass();

        loop {
            let next_due = self.next_due();
            tokio::select! {
                _ = monitor.tick() => self.monitor_pass(),
                event = events.recv() => match event {
                    Ok(event) => self.on_event(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Supervisor lagged behind link events, rescanning");
                        self.monitor_pass();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = wait_until(next_due) => self.fire_due(),
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.tracked
            .values()
            .filter_map(|t| match t.phase {
                Phase::Scheduled { due } => Some(due),
                _ => None,
            })
            .min()
    }

    fn on_event(&mut self, event: LinkEvent) {
        match event.current {
            LinkState::Error => self.on_error(event.link_id),
            LinkState::Connected => self.on_connected(event.link_id),
            LinkState::Disconnected => {
                if self.tracked.remove(&event.link_id).is_some() {
                    debug!(link_id = %event.link_id, "Link closed, dropping reconnect state");
                }
            }
            LinkState::Connecting | LinkState::Reconnecting => {}
        }
    }

    fn on_error(&mut self, link_id: LinkId) {
        let Some(link) = self.registry.link(link_id) else {
            self.tracked.remove(&link_id);
            return;
        };
        if !link.auto_reconnect || link.state != LinkState::Error {
            return;
        }

        let tracked = self.tracked.entry(link_id).or_default();
        if matches!(tracked.phase, Phase::Scheduled { .. } | Phase::Failed) {
            return;
        }

        if link.retry_count >= self.max_retries {
            tracked.phase = Phase::Failed;
            let status = SupervisorStatus::Failed {
                link_id,
                attempts: link.retry_count,
            };
            if let Some(err) = status.error() {
                error!(link_id = %link_id, url = %link.url, error = %err, "Giving up on link");
            }
            let _ = self.status_tx.send(status);
            return;
        }

        // Index by reconnects since the link was last healthy, so the first
        // retry waits the base delay whether the link dropped or never came up
        let delay = self.policy.delay(tracked.attempts);
        let due = Instant::now() + delay;
        if !self.registry.schedule_reconnect(link_id, due) {
            return;
        }

        tracked.phase = Phase::Scheduled { due };
        let attempt = tracked.attempts + 1;
        info!(
            link_id = %link_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnect scheduled"
        );
        let _ = self.status_tx.send(SupervisorStatus::Scheduled {
            link_id,
            attempt,
            delay,
        });
    }

    fn on_connected(&mut self, link_id: LinkId) {
        let Some(tracked) = self.tracked.remove(&link_id) else {
            return;
        };
        if tracked.attempts > 0 {
            info!(link_id = %link_id, attempts = tracked.attempts, "Link recovered");
            let _ = self.status_tx.send(SupervisorStatus::Recovered {
                link_id,
                attempts: tracked.attempts,
            });
        }
    }

    fn fire_due(&mut self) {
        let now = Instant::now();
        let due: Vec<LinkId> = self
            .tracked
            .iter()
            .filter(|(_, t)| matches!(t.phase, Phase::Scheduled { due } if due <= now))
            .map(|(id, _)| *id)
            .collect();

        for link_id in due {
            let Some(tracked) = self.tracked.get_mut(&link_id) else {
                continue;
            };
            tracked.phase = Phase::Reconnecting;
            tracked.attempts += 1;
            debug!(link_id = %link_id, attempt = tracked.attempts, "Reconnecting");

            if !self.registry.reconnect(link_id) {
                // Closed or moved on while we waited
                self.tracked.remove(&link_id);
            }
        }
    }

    /// Periodic scan: catch failures whose events were missed and forget
    /// links the registry no longer has.
    fn monitor_pass(&mut self) {
        let links = self.registry.links();
        self.tracked
            .retain(|id, _| links.iter().any(|link| link.id == *id));

        for link in links {
            match link.state {
                LinkState::Error => self.on_error(link.id),
                LinkState::Connected => self.on_connected(link.id),
                _ => {}
            }
        }
    }
}

async fn wait_until(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{MemoryConnector, RegistryConfig};
    use assert_matches::assert_matches;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            jitter: false,
        }
    }

    fn setup(max_retries: u32) -> (Arc<ConnectionRegistry>, Arc<MemoryConnector>, ReconnectSupervisor) {
        let connector = Arc::new(MemoryConnector::new());
        let registry = ConnectionRegistry::new(connector.clone(), RegistryConfig::default());
        let supervisor = ReconnectSupervisor::new(
            Arc::clone(&registry),
            policy(),
            max_retries,
            Duration::from_secs(5),
        );
        (registry, connector, supervisor)
    }

    fn drain(rx: &mut broadcast::Receiver<SupervisorStatus>) -> Vec<SupervisorStatus> {
        let mut out = Vec::new();
        while let Ok(status) = rx.try_recv() {
            out.push(status);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_exactly_once_after_max_retries() {
        let (registry, connector, supervisor) = setup(3);
        let mut status = supervisor.subscribe_status();
        supervisor.start();
        connector.set_accepting(false);

        let id = registry.open("mem://backend").unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        // Initial handshake plus two reconnects brings retry_count to 3
        assert_eq!(connector.attempts(), 3);
        let link = registry.link(id).unwrap();
        assert_eq!(link.state, LinkState::Error);
        assert_eq!(link.retry_count, 3);

        let statuses = drain(&mut status);
        let failed: Vec<_> = statuses
            .iter()
            .filter(|s| matches!(s, SupervisorStatus::Failed { .. }))
            .collect();
        assert_eq!(failed, vec![&SupervisorStatus::Failed { link_id: id, attempts: 3 }]);
        assert_matches!(
            failed[0].error(),
            Some(LinkError::Exhausted { attempts: 3, .. })
        );
        assert_eq!(failed[0].link_id(), id);

        // Monitoring passes never revive it
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 3);
        assert!(drain(&mut status).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_start_at_base() {
        let (registry, connector, supervisor) = setup(5);
        let mut status = supervisor.subscribe_status();
        supervisor.start();
        connector.set_accepting(false);

        let id = registry.open("mem://backend").unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        let delays: Vec<u64> = drain(&mut status)
            .into_iter()
            .filter_map(|s| match s {
                SupervisorStatus::Scheduled { link_id, delay, .. } if link_id == id => {
                    Some(delay.as_millis() as u64)
                }
                _ => None,
            })
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_policy_first_retry_waits_base_delay() {
        let connector = Arc::new(MemoryConnector::new());
        let registry = ConnectionRegistry::new(connector.clone(), RegistryConfig::default());
        let supervisor = ReconnectSupervisor::new(
            Arc::clone(&registry),
            BackoffPolicy {
                jitter: false,
                ..BackoffPolicy::default()
            },
            5,
            Duration::from_secs(5),
        );
        let mut status = supervisor.subscribe_status();
        supervisor.start();
        connector.set_accepting(false);

        let id = registry.open("mem://backend").unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;

        let statuses = drain(&mut status);
        let delays: Vec<u64> = statuses
            .iter()
            .filter_map(|s| match s {
                SupervisorStatus::Scheduled { delay, .. } => Some(delay.as_millis() as u64),
                _ => None,
            })
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000]);
        assert_eq!(connector.attempts(), 5);
        assert_matches!(
            statuses.last(),
            Some(SupervisorStatus::Failed { link_id, attempts: 5 }) if *link_id == id
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_link_recovers() {
        let (registry, connector, supervisor) = setup(5);
        let mut status = supervisor.subscribe_status();
        supervisor.start();

        let id = registry.open("mem://backend").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        connector.next_peer().unwrap().disconnect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.link(id).unwrap().state, LinkState::Reconnecting);
        assert!(registry.link(id).unwrap().next_retry_at.is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.link(id).unwrap().state, LinkState::Connected);
        assert_eq!(connector.attempts(), 2);

        let statuses = drain(&mut status);
        assert_matches!(
            statuses.as_slice(),
            [
                SupervisorStatus::Scheduled { attempt: 1, .. },
                SupervisorStatus::Recovered { attempts: 1, .. }
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_reconnect() {
        let (registry, connector, supervisor) = setup(5);
        supervisor.start();
        connector.set_accepting(false);

        let id = registry.open("mem://backend").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.link(id).unwrap().state, LinkState::Reconnecting);

        registry.close(id);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_reconnect_disabled_is_left_alone() {
        let (registry, connector, supervisor) = setup(5);
        supervisor.start();
        connector.set_accepting(false);

        let id = registry
            .open_with("mem://backend", crate::link::LinkOptions { auto_reconnect: false })
            .unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(registry.link(id).unwrap().state, LinkState::Error);
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_pass_picks_up_earlier_failures() {
        let (registry, connector, supervisor) = setup(5);
        connector.set_accepting(false);
        let id = registry.open("mem://backend").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.link(id).unwrap().state, LinkState::Error);

        connector.set_accepting(true);
        supervisor.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(registry.link(id).unwrap().state, LinkState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_cancels_timers() {
        let (registry, connector, supervisor) = setup(5);
        supervisor.start();
        connector.set_accepting(false);
        registry.open("mem://backend").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        supervisor.stop();
        supervisor.stop();
        assert!(!supervisor.is_running());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempts(), 1);
    }
}

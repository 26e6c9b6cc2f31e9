//! Frame scaling and JPEG encoding

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use thiserror::Error;

use super::FrameBudget;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("frame has no pixels")]
    EmptyFrame,

    #[error("JPEG encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),
}

/// Largest size fitting `max_width x max_height` with the same aspect ratio.
/// Never upscales.
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width <= max_width && height <= max_height {
        return (width, height);
    }

    let scale = f64::min(
        max_width as f64 / width as f64,
        max_height as f64 / height as f64,
    );
    let w = ((width as f64 * scale).round() as u32).clamp(1, max_width.max(1));
    let h = ((height as f64 * scale).round() as u32).clamp(1, max_height.max(1));
    (w, h)
}

/// Map a [0, 1] quality to the encoder's 1..=100 scale
pub fn jpeg_quality(quality: f32) -> u8 {
    (quality * 100.0).round().clamp(1.0, 100.0) as u8
}

/// Scale `frame` into the budget's bounds and encode it as JPEG
pub fn encode_frame(frame: &RgbImage, budget: &FrameBudget) -> Result<Bytes, EncodeError> {
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 {
        return Err(EncodeError::EmptyFrame);
    }

    let (w, h) = fit_within(width, height, budget.max_width, budget.max_height);
    let mut buf = Vec::with_capacity((w * h / 4) as usize);
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, jpeg_quality(budget.quality));

    if (w, h) == (width, height) {
        encoder.encode_image(frame)?;
    } else {
        let scaled = imageops::resize(frame, w, h, FilterType::Triangle);
        encoder.encode_image(&scaled)?;
    }

    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case((1280, 720), (640, 480), (640, 360))]
    #[case((480, 640), (640, 480), (360, 480))]
    #[case((320, 240), (640, 480), (320, 240))]
    #[case((1920, 1080), (320, 320), (320, 180))]
    fn test_fit_within(#[case] src: (u32, u32), #[case] max: (u32, u32), #[case] expected: (u32, u32)) {
        assert_eq!(fit_within(src.0, src.1, max.0, max.1), expected);
    }

    #[rstest]
    #[case(0.0, 1)]
    #[case(0.3, 30)]
    #[case(0.7, 70)]
    #[case(1.0, 100)]
    fn test_jpeg_quality(#[case] quality: f32, #[case] expected: u8) {
        assert_eq!(jpeg_quality(quality), expected);
    }

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    #[test]
    fn test_encode_downscales() {
        let budget = FrameBudget {
            max_width: 64,
            max_height: 48,
            ..Default::default()
        };
        let jpeg = encode_frame(&gradient(128, 96), &budget).unwrap();

        // SOI marker
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
    }

    #[test]
    fn test_lower_quality_is_smaller() {
        let frame = gradient(160, 120);
        let low = encode_frame(&frame, &FrameBudget { quality: 0.3, ..Default::default() }).unwrap();
        let high = encode_frame(&frame, &FrameBudget { quality: 0.9, ..Default::default() }).unwrap();
        assert!(low.len() < high.len());
    }

    #[test]
    fn test_empty_frame() {
        let empty = RgbImage::new(0, 0);
        assert!(matches!(
            encode_frame(&empty, &FrameBudget::default()),
            Err(EncodeError::EmptyFrame)
        ));
    }
}

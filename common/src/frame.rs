use chrono::{DateTime, Local, TimeZone};
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, ImageReader, RgbImage};
use std::io::Cursor;

/// A decoded camera frame with capture metadata.
///
/// Frames are immutable once built. The capture loop builds a fresh frame for
/// every successful read and shares it behind an `Arc`, so every reader sees
/// either the previous frame or the new one, never a mix.
#[derive(Debug, Clone)]
pub struct Frame {
    image: RgbImage,
    /// Frame counter value at capture time (1-based).
    seq: u64,
    /// Unix millis.
    captured_at_ms: i64,
}

impl Frame {
    pub fn new(image: RgbImage, seq: u64, captured_at_ms: i64) -> Self {
        Self {
            image,
            seq,
            captured_at_ms,
        }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Encode to JPEG at the given quality (1..=100).
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        let (width, height) = self.image.dimensions();
        if width == 0 || height == 0 {
            return Err(FrameError::Empty);
        }
        let mut buf = Vec::with_capacity(jpeg_size_hint(width, height));
        JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100))
            .encode_image(&self.image)
            .map_err(|e| FrameError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// File name for a persisted copy of this frame, e.g.
    /// `frame_20260218_093000_000010.jpg`. The timestamp is local time.
    pub fn capture_file_name(&self) -> String {
        let dt: DateTime<Local> = Local
            .timestamp_millis_opt(self.captured_at_ms)
            .single()
            .unwrap_or_else(Local::now);
        format!(
            "frame_{ts}_{seq:06}.jpg",
            ts = dt.format("%Y%m%d_%H%M%S"),
            seq = self.seq
        )
    }
}

/// Rough output size of a JPEG, about a quarter byte per pixel.
fn jpeg_size_hint(width: u32, height: u32) -> usize {
    width as usize * height as usize / 4
}

/// Decode a JPEG payload into an RGB8 pixel buffer.
pub fn decode_jpeg(jpeg_data: &[u8]) -> Result<RgbImage, FrameError> {
    if jpeg_data.is_empty() {
        return Err(FrameError::Empty);
    }
    let img = ImageReader::with_format(Cursor::new(jpeg_data), ImageFormat::Jpeg)
        .decode()
        .map_err(|e| FrameError::Decode(e.to_string()))?;
    Ok(img.to_rgb8())
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("failed to decode JPEG: {0}")]
    Decode(String),
    #[error("failed to encode JPEG: {0}")]
    Encode(String),
}

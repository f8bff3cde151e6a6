use camera_relay_common::config::CaptureConfig;
use camera_relay_common::frame::{Frame, FrameError};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Writes every `every`th captured frame to the capture directory.
#[derive(Debug, Clone)]
pub struct FrameArchive {
    dir: PathBuf,
    every: u64,
    quality: u8,
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("failed to create capture directory {0}: {1}")]
    CreateDir(String, std::io::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] FrameError),
    #[error("failed to write {0}: {1}")]
    Write(String, std::io::Error),
    #[error("encoder task failed: {0}")]
    Join(String),
}

impl FrameArchive {
    pub fn new(dir: impl Into<PathBuf>, every: u64, quality: u8) -> Self {
        Self {
            dir: dir.into(),
            every: every.max(1),
            quality,
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(&config.dir, config.save_every, config.save_quality)
    }

    /// Create the capture directory if it does not exist yet.
    pub async fn ensure_dir(&self) -> Result<(), ArchiveError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ArchiveError::CreateDir(self.dir.display().to_string(), e))?;
        debug!(dir = %self.dir.display(), "capture directory ready");
        Ok(())
    }

    /// Whether the frame with this (1-based) counter value gets persisted.
    pub fn should_persist(&self, frame_count: u64) -> bool {
        frame_count > 0 && frame_count % self.every == 0
    }

    /// Encode the frame and write it under a name derived from its capture
    /// time and sequence number. Existing files are never overwritten.
    pub async fn persist(&self, frame: Arc<Frame>) -> Result<PathBuf, ArchiveError> {
        let path = self.dir.join(frame.capture_file_name());
        let quality = self.quality;
        let jpeg = tokio::task::spawn_blocking(move || frame.encode_jpeg(quality))
            .await
            .map_err(|e| ArchiveError::Join(e.to_string()))??;

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| ArchiveError::Write(path.display().to_string(), e))?;
        file.write_all(&jpeg)
            .await
            .map_err(|e| ArchiveError::Write(path.display().to_string(), e))?;
        file.flush()
            .await
            .map_err(|e| ArchiveError::Write(path.display().to_string(), e))?;

        debug!(path = %path.display(), bytes = jpeg.len(), "wrote frame file");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camera_relay_common::frame::decode_jpeg;
    use image::{Rgb, RgbImage};

    fn frame(seq: u64) -> Arc<Frame> {
        let image = RgbImage::from_fn(40, 30, |x, y| Rgb([x as u8 * 6, y as u8 * 8, 90]));
        Arc::new(Frame::new(image, seq, 1_708_300_000_000))
    }

    #[test]
    fn cadence() {
        let archive = FrameArchive::new("unused", 10, 90);
        let persisted: Vec<u64> = (1..=35).filter(|&n| archive.should_persist(n)).collect();
        assert_eq!(persisted, vec![10, 20, 30]);
        assert!(!archive.should_persist(0));

        // save_every = 0 is clamped instead of dividing by zero
        let archive = FrameArchive::new("unused", 0, 90);
        assert!(archive.should_persist(1));
    }

    #[tokio::test]
    async fn ensure_dir_creates_nested_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("a/b/captures");
        let archive = FrameArchive::new(&dir, 10, 90);
        archive.ensure_dir().await.unwrap();
        assert!(dir.is_dir());
        // idempotent
        archive.ensure_dir().await.unwrap();
    }

    #[tokio::test]
    async fn persisted_file_decodes_to_same_dimensions() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = FrameArchive::new(tmp.path(), 10, 90);

        let path = archive.persist(frame(10)).await.unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("_000010.jpg"));

        let bytes = tokio::fs::read(&path).await.unwrap();
        let decoded = decode_jpeg(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (40, 30));
    }

    #[tokio::test]
    async fn never_overwrites_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = FrameArchive::new(tmp.path(), 10, 90);
        archive.persist(frame(10)).await.unwrap();
        let err = archive.persist(frame(10)).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Write(..)));
    }
}

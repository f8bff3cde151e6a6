use camera_relay_common::frame::Frame;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Holds the most recent frame.
///
/// Writers swap in a complete, immutable frame; readers clone the `Arc`.
/// The lock only covers the swap/clone, so a reader never sees a half-built
/// frame and never holds the lock while encoding.
#[derive(Default)]
pub struct FrameSlot {
    latest: Mutex<Option<Arc<Frame>>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current frame.
    pub async fn publish(&self, frame: impl Into<Arc<Frame>>) {
        let frame = frame.into();
        *self.latest.lock().await = Some(frame);
    }

    pub async fn latest(&self) -> Option<Arc<Frame>> {
        self.latest.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.latest.lock().await.take();
    }
}

/// State shared by the capture loop and the stream server.
pub struct RelayContext {
    pub slot: FrameSlot,
    /// Cancelled once on shutdown; every loop selects on it.
    pub shutdown: CancellationToken,
    frames: AtomicU64,
    reconnects: AtomicU64,
    viewers: AtomicUsize,
    started_at: Instant,
}

impl RelayContext {
    pub fn new() -> Arc<Self> {
        Self::with_shutdown(CancellationToken::new())
    }

    pub fn with_shutdown(shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            slot: FrameSlot::new(),
            shutdown,
            frames: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            viewers: AtomicUsize::new(0),
            started_at: Instant::now(),
        })
    }

    /// Count a successfully captured frame. Returns the new frame count,
    /// which doubles as the frame's sequence number.
    pub fn record_frame(&self) -> u64 {
        self.frames.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn frame_count(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn record_reconnect(&self) -> u64 {
        self.reconnects.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.load(Ordering::Relaxed)
    }

    /// Register a streaming viewer. The count drops when the guard does.
    pub fn viewer_guard(self: &Arc<Self>) -> ViewerGuard {
        let active = self.viewers.fetch_add(1, Ordering::Relaxed) + 1;
        ViewerGuard {
            ctx: Arc::clone(self),
            active,
        }
    }

    /// Captured frames per second since the context was created.
    pub fn throughput(&self) -> f64 {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.frame_count() as f64 / elapsed
        } else {
            0.0
        }
    }
}

pub struct ViewerGuard {
    ctx: Arc<RelayContext>,
    active: usize,
}

impl ViewerGuard {
    /// Number of viewers connected when this one joined, itself included.
    pub fn active(&self) -> usize {
        self.active
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        self.ctx.viewers.fetch_sub(1, Ordering::Relaxed);
    }
}

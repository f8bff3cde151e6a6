use camera_relay_common::frame::{decode_jpeg, Frame};
use chrono::Utc;
use image::RgbImage;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::archive::FrameArchive;
use crate::context::RelayContext;
use crate::reconnect::{Backoff, ReconnectPolicy};
use crate::upstream::{MjpegStream, Upstream, UpstreamError};

/// Why a single upstream session stopped.
enum SessionEnd {
    Cancelled,
    Ended,
    Failed(UpstreamError),
}

/// Pulls frames from the camera into the shared slot and archives every
/// `save_every`th one. Reconnects under `policy` until cancelled.
pub struct CaptureLoop {
    ctx: Arc<RelayContext>,
    upstream: Upstream,
    archive: FrameArchive,
    policy: ReconnectPolicy,
    /// Frames arriving faster than this are dropped undecoded.
    min_frame_interval: Duration,
}

impl CaptureLoop {
    pub fn new(
        ctx: Arc<RelayContext>,
        upstream: Upstream,
        archive: FrameArchive,
        policy: ReconnectPolicy,
        min_frame_interval: Duration,
    ) -> Self {
        Self {
            ctx,
            upstream,
            archive,
            policy,
            min_frame_interval,
        }
    }

    /// Run until shutdown. `initial` is the connection opened at startup.
    pub async fn run(self, initial: MjpegStream) {
        let mut backoff = self.policy.backoff();
        let mut last_published: Option<Instant> = None;
        let mut session = Some(initial);
        info!(url = %self.upstream.redacted_url(), "capture loop started");

        loop {
            let stream = match session.take() {
                Some(stream) => stream,
                None => {
                    let attempt = self.ctx.record_reconnect();
                    info!(attempt, "reconnecting to upstream");
                    let connected = tokio::select! {
                        _ = self.ctx.shutdown.cancelled() => break,
                        connected = self.upstream.connect() => connected,
                    };
                    match connected {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!(error = %e, attempt, "reconnect failed");
                            if !self.wait_before_retry(&mut backoff).await {
                                break;
                            }
                            continue;
                        }
                    }
                }
            };

            match self.pump(stream, &mut backoff, &mut last_published).await {
                SessionEnd::Cancelled => break,
                SessionEnd::Ended => {
                    warn!(frames = self.ctx.frame_count(), "upstream closed the stream, reconnecting")
                }
                SessionEnd::Failed(e) => {
                    warn!(error = %e, frames = self.ctx.frame_count(), "failed to grab frame, reconnecting")
                }
            }
            if !self.wait_before_retry(&mut backoff).await {
                break;
            }
        }

        self.ctx.slot.clear().await;
        info!(frames = self.ctx.frame_count(), "capture loop stopped");
    }

    /// Read frames from one upstream session until it ends, fails or the
    /// process shuts down.
    async fn pump(
        &self,
        mut stream: MjpegStream,
        backoff: &mut Backoff,
        last_published: &mut Option<Instant>,
    ) -> SessionEnd {
        loop {
            let next = tokio::select! {
                _ = self.ctx.shutdown.cancelled() => return SessionEnd::Cancelled,
                next = stream.next_jpeg() => next,
            };
            let jpeg = match next {
                Ok(Some(jpeg)) => jpeg,
                Ok(None) => return SessionEnd::Ended,
                Err(e) => return SessionEnd::Failed(e),
            };

            if let Some(prev) = *last_published {
                if prev.elapsed() < self.min_frame_interval {
                    trace!("frame dropped by rate cap");
                    continue;
                }
            }

            let captured_at_ms = Utc::now().timestamp_millis();
            let image = match tokio::task::spawn_blocking(move || decode_jpeg(&jpeg)).await {
                Ok(Ok(image)) => image,
                Ok(Err(e)) => {
                    debug!(error = %e, "skipping undecodable frame");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "decoder task failed");
                    continue;
                }
            };

            *last_published = Some(Instant::now());
            backoff.reset();
            self.publish(image, captured_at_ms).await;
        }
    }

    async fn publish(&self, image: RgbImage, captured_at_ms: i64) {
        let seq = self.ctx.record_frame();
        let frame = Arc::new(Frame::new(image, seq, captured_at_ms));
        self.ctx.slot.publish(Arc::clone(&frame)).await;

        if self.archive.should_persist(seq) {
            match self.archive.persist(frame).await {
                Ok(path) => info!(
                    path = %path.display(),
                    frames = seq,
                    fps = format!("{:.1}", self.ctx.throughput()),
                    "saved frame"
                ),
                Err(e) => warn!(error = %e, seq, "failed to save frame"),
            }
        }
    }

    /// Sleep for the policy's next delay. Returns `false` if the loop should
    /// stop, either because of shutdown or because the policy gave up.
    async fn wait_before_retry(&self, backoff: &mut Backoff) -> bool {
        let Some(delay) = backoff.next_delay() else {
            error!(
                attempts = backoff.attempts(),
                "reconnect attempts exhausted, shutting down"
            );
            self.ctx.shutdown.cancel();
            return false;
        };
        debug!(?delay, "waiting before reconnect");
        tokio::select! {
            _ = self.ctx.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

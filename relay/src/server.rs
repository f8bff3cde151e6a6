use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::context::{RelayContext, ViewerGuard};
use crate::mjpeg::{encode_part, stream_content_type};

/// How the stream server renders frames for viewers.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// JPEG quality for streamed frames.
    pub quality: u8,
    /// Delay between slot reads in each viewer loop.
    pub frame_interval: Duration,
    /// Base URL viewers use to reach this server, shown on the index page.
    pub public_url: String,
}

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

struct AppState {
    ctx: Arc<RelayContext>,
    settings: StreamSettings,
}

pub fn router(ctx: Arc<RelayContext>, settings: StreamSettings) -> Router {
    let state = Arc::new(AppState { ctx, settings });
    Router::new()
        .route("/", get(index))
        .route("/video_feed", get(video_feed))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the context's shutdown token fires.
pub async fn serve(
    listener: TcpListener,
    ctx: Arc<RelayContext>,
    settings: StreamSettings,
) -> std::io::Result<()> {
    let shutdown = ctx.shutdown.clone();
    axum::serve(listener, router(ctx, settings))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET / — status page embedding the live stream
async fn index(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(render_index(
        state.ctx.frame_count(),
        state.ctx.reconnect_count(),
        state.ctx.viewer_count(),
        &state.settings.public_url,
    ))
}

/// GET /video_feed — multipart/x-mixed-replace JPEG stream
async fn video_feed(State(state): State<Arc<AppState>>) -> Response {
    // Capacity 1: a slow viewer only ever has one part queued.
    let (tx, rx) = mpsc::channel::<Bytes>(1);
    let guard = state.ctx.viewer_guard();
    info!(viewers = guard.active(), "viewer connected");
    tokio::spawn(run_viewer(
        Arc::clone(&state.ctx),
        state.settings.clone(),
        tx,
        guard,
    ));

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    let headers = [
        (header::CONTENT_TYPE, stream_content_type()),
        (
            header::CACHE_CONTROL,
            "no-cache, no-store, must-revalidate".to_string(),
        ),
        (header::PRAGMA, "no-cache".to_string()),
    ];
    (headers, body).into_response()
}

/// Per-viewer loop: every tick, take the latest frame, encode it (once per
/// frame) and push it to the viewer. Ends on shutdown or when the viewer's
/// body has been dropped, i.e. the connection is gone.
async fn run_viewer(
    ctx: Arc<RelayContext>,
    settings: StreamSettings,
    tx: mpsc::Sender<Bytes>,
    guard: ViewerGuard,
) {
    let mut ticker = tokio::time::interval(settings.frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cached: Option<(u64, Bytes)> = None;

    let reason = loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break "shutdown",
            _ = tx.closed() => break "disconnected",
            _ = ticker.tick() => {}
        }

        // Empty slot: nothing to send, wait for the next tick.
        let Some(frame) = ctx.slot.latest().await else {
            continue;
        };

        let seq = frame.seq();
        let reuse = cached
            .as_ref()
            .filter(|(cached_seq, _)| *cached_seq == seq)
            .map(|(_, part)| part.clone());
        let part = match reuse {
            Some(part) => part,
            None => {
                let quality = settings.quality;
                match tokio::task::spawn_blocking(move || frame.encode_jpeg(quality)).await {
                    Ok(Ok(jpeg)) => {
                        let part = encode_part(&jpeg);
                        cached = Some((seq, part.clone()));
                        part
                    }
                    Ok(Err(e)) => {
                        debug!(error = %e, seq, "skipping frame that failed to encode");
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "encoder task failed");
                        continue;
                    }
                }
            }
        };

        tokio::select! {
            _ = ctx.shutdown.cancelled() => break "shutdown",
            sent = tx.send(part) => {
                if sent.is_err() {
                    break "disconnected";
                }
            }
        }
    };

    drop(guard);
    info!(reason, viewers = ctx.viewer_count(), "viewer stream closed");
}

fn render_index(frames: u64, reconnects: u64, viewers: usize, public_url: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Camera Relay Live Stream</title>
    <meta http-equiv="refresh" content="30">
    <style>
        body {{ font-family: Arial, sans-serif; text-align: center; background: #1a1a1a; color: white; }}
        img {{ max-width: 90%; border: 3px solid #4CAF50; border-radius: 10px; }}
        .stats {{ background: #333; padding: 10px; border-radius: 5px; margin: 10px; }}
        .status {{ color: #4CAF50; font-weight: bold; }}
    </style>
</head>
<body>
    <h1>Camera Relay</h1>
    <div class="stats">
        <p class="status">LIVE</p>
        <p>Frames captured: <span id="frameCount">{frames}</span></p>
        <p>Reconnects: {reconnects} &middot; Viewers: {viewers}</p>
        <p>Stream URL: <code>{public_url}/video_feed</code></p>
    </div>
    <img src="/video_feed" width="80%">
    <p>Page refreshes every 30 seconds.</p>
</body>
</html>
"#
    )
}

mod archive;
mod browser;
mod capture;
mod context;
mod mjpeg;
mod reconnect;
mod server;
mod upstream;

#[cfg(test)]
mod testutil;

use archive::FrameArchive;
use camera_relay_common::config::Config;
use capture::CaptureLoop;
use context::RelayContext;
use reconnect::ReconnectPolicy;
use server::StreamSettings;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use upstream::Upstream;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    std::process::exit(run(config, shutdown_signal()).await);
}

/// Start the relay and run it until `shutdown` resolves or the capture loop
/// gives up. Returns the process exit code: 0 after `shutdown`, 1 on any
/// startup failure or when reconnect attempts run out.
async fn run(config: Config, shutdown: impl Future<Output = ()>) -> i32 {
    let upstream = match Upstream::new(&config.upstream) {
        Ok(u) => u,
        Err(e) => {
            error!(error = %e, "invalid upstream configuration");
            return 1;
        }
    };

    info!(
        upstream = %upstream.redacted_url(),
        capture_dir = %config.capture.dir.display(),
        save_every = config.capture.save_every,
        host = config.server.host,
        port = config.server.port,
        "starting camera relay"
    );

    let archive = FrameArchive::from_config(&config.capture);
    if let Err(e) = archive.ensure_dir().await {
        error!(error = %e, "failed to prepare capture directory");
        return 1;
    }

    // The camera must be reachable at startup; later outages are retried.
    let initial = match upstream.connect().await {
        Ok(stream) => stream,
        Err(e) => {
            error!(
                error = %e,
                url = %upstream.redacted_url(),
                "failed to open upstream stream; check the camera is running, its address and the credentials"
            );
            return 1;
        }
    };

    let ctx = RelayContext::new();

    let capture = CaptureLoop::new(
        Arc::clone(&ctx),
        upstream,
        archive,
        ReconnectPolicy::from_config(&config.reconnect),
        Duration::from_millis(config.capture.min_frame_interval_ms),
    );
    let capture_task = tokio::spawn(capture.run(initial));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr, error = %e, "failed to bind stream server");
            ctx.shutdown.cancel();
            return 1;
        }
    };

    let public_url = config.server.public_url();
    info!(addr, url = public_url, "stream server listening");
    if config.server.open_browser {
        browser::open_in_background(public_url.clone());
    }

    let settings = StreamSettings {
        quality: config.server.stream_quality,
        frame_interval: Duration::from_millis(config.server.frame_interval_ms),
        public_url,
    };
    let server_task = tokio::spawn(server::serve(listener, Arc::clone(&ctx), settings));

    let by_signal = tokio::select! {
        _ = shutdown => true,
        _ = ctx.shutdown.cancelled() => false,
    };

    info!("stopping everything");
    ctx.shutdown.cancel();

    let grace = Duration::from_millis(config.shutdown.grace_period_ms);
    let drained = tokio::time::timeout(grace, async {
        if let Err(e) = capture_task.await {
            error!(error = %e, "capture task panicked");
        }
        match server_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "stream server failed"),
            Err(e) => error!(error = %e, "stream server task panicked"),
        }
    })
    .await;
    if drained.is_err() {
        warn!(?grace, "tasks still running after grace period, exiting anyway");
    }

    info!(frames = ctx.frame_count(), "shutdown complete");
    if by_signal {
        0
    } else {
        1
    }
}

async fn shutdown_signal() {
    tokio::select! {
        _ = ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
        _ = terminate() => {
            info!("received SIGTERM, shutting down");
        }
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for SIGINT");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "failed to listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

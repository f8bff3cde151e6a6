use std::process::{Command, ExitStatus};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("failed to run {0}: {1}")]
    Spawn(&'static str, std::io::Error),
    #[error("{0} exited with {1}")]
    Exit(&'static str, ExitStatus),
}

/// Open `url` in the default browser without blocking the caller.
///
/// Runs on its own thread since some launchers (xdg-open in particular) only
/// return once the browser exits.
pub fn open_in_background(url: String) {
    let spawned = std::thread::Builder::new()
        .name("browser-opener".to_string())
        .spawn(move || match open(&url) {
            Ok(via) => info!(url, via, "opened browser"),
            Err(e) => {
                warn!(error = %e, "could not open a browser");
                warn!("open {url} manually to watch the stream");
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "failed to spawn browser thread");
    }
}

/// Try the system default browser, then the platform's open command.
/// Returns which launcher worked.
pub fn open(url: &str) -> Result<&'static str, BrowserError> {
    match webbrowser::open(url) {
        Ok(()) => Ok("webbrowser"),
        Err(e) => {
            debug!(error = %e, "default browser launch failed, trying platform command");
            let (program, args) = platform_command(url);
            let status = Command::new(program)
                .args(&args)
                .status()
                .map_err(|e| BrowserError::Spawn(program, e))?;
            if status.success() {
                Ok(program)
            } else {
                Err(BrowserError::Exit(program, status))
            }
        }
    }
}

fn platform_command(url: &str) -> (&'static str, Vec<String>) {
    if cfg!(target_os = "windows") {
        // The empty string is the window title `start` expects first.
        (
            "cmd",
            vec!["/C".into(), "start".into(), String::new(), url.into()],
        )
    } else if cfg!(target_os = "macos") {
        ("open", vec![url.into()])
    } else {
        ("xdg-open", vec![url.into()])
    }
}

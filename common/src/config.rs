use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// MJPEG endpoint of the camera. May carry `user:pass@` credentials.
    pub url: String,
    /// Overrides the username embedded in `url`.
    pub username: Option<String>,
    /// Overrides the password embedded in `url`.
    pub password: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_capture_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_save_every")]
    pub save_every: u64,
    #[serde(default = "default_save_quality")]
    pub save_quality: u8,
    #[serde(default = "default_min_frame_interval")]
    pub min_frame_interval_ms: u64,
}

/// Reconnect policy for the upstream camera.
///
/// The defaults retry forever with a fixed 2 second delay. Raising
/// `max_delay_ms` above `initial_delay_ms` turns it into capped exponential
/// backoff.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Host name advertised on the index page and opened in the browser.
    pub public_host: Option<String>,
    #[serde(default = "default_stream_quality")]
    pub stream_quality: u8,
    #[serde(default = "default_frame_interval")]
    pub frame_interval_ms: u64,
    #[serde(default = "default_open_browser")]
    pub open_browser: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_grace_period")]
    pub grace_period_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            dir: default_capture_dir(),
            save_every: default_save_every(),
            save_quality: default_save_quality(),
            min_frame_interval_ms: default_min_frame_interval(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
            max_attempts: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_host: None,
            stream_quality: default_stream_quality(),
            frame_interval_ms: default_frame_interval(),
            open_browser: default_open_browser(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Host viewers should use to reach this server. A wildcard bind address
    /// is not routable, so it maps to loopback.
    pub fn advertised_host(&self) -> &str {
        match self.public_host.as_deref() {
            Some(host) => host,
            None if self.host == "0.0.0.0" || self.host == "::" => "127.0.0.1",
            None => &self.host,
        }
    }

    pub fn public_url(&self) -> String {
        format!("http://{}:{}", self.advertised_host(), self.port)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.upstream.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "upstream.url must be an http(s) URL, got {url:?}"
            )));
        }
        for (name, quality) in [
            ("capture.save_quality", self.capture.save_quality),
            ("server.stream_quality", self.server.stream_quality),
        ] {
            if !(1..=100).contains(&quality) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be within 1..=100, got {quality}"
                )));
            }
        }
        if self.upstream.password.is_some() && self.upstream.username.is_none() {
            return Err(ConfigError::Invalid(
                "upstream.password is set without upstream.username".into(),
            ));
        }
        if self.capture.save_every == 0 {
            return Err(ConfigError::Invalid("capture.save_every must be > 0".into()));
        }
        if self.server.frame_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "server.frame_interval_ms must be > 0".into(),
            ));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "reconnect.multiplier must be >= 1.0, got {}",
                self.reconnect.multiplier
            )));
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            warn!(
                initial_delay_ms = self.reconnect.initial_delay_ms,
                max_delay_ms = self.reconnect.max_delay_ms,
                "reconnect.max_delay_ms is below initial_delay_ms; delays are capped at max_delay_ms"
            );
        }
        if self.server.stream_quality > self.capture.save_quality {
            warn!(
                stream_quality = self.server.stream_quality,
                save_quality = self.capture.save_quality,
                "stream quality exceeds saved-frame quality"
            );
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_connect_timeout() -> u64 {
    10
}
fn default_read_timeout() -> u64 {
    10
}
fn default_capture_dir() -> PathBuf {
    PathBuf::from("captures")
}
fn default_save_every() -> u64 {
    10
}
fn default_save_quality() -> u8 {
    90
}
fn default_min_frame_interval() -> u64 {
    50
}
fn default_initial_delay() -> u64 {
    2000
}
fn default_max_delay() -> u64 {
    2000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    5000
}
fn default_stream_quality() -> u8 {
    80
}
fn default_frame_interval() -> u64 {
    50
}
fn default_open_browser() -> bool {
    true
}
fn default_grace_period() -> u64 {
    2000
}
fn default_log_level() -> String {
    "info".into()
}

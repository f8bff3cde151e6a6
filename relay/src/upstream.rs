use bytes::Bytes;
use camera_relay_common::config::UpstreamConfig;
use futures_util::{Stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info};

use crate::mjpeg::{boundary_from_content_type, MjpegParser};

/// Boundary assumed when the camera does not declare one.
const DEFAULT_BOUNDARY: &str = "frame";

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("invalid upstream URL: {0}")]
    InvalidUrl(String),
    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("no data from upstream for {0:?}")]
    ReadTimeout(Duration),
}

/// The remote MJPEG camera.
pub struct Upstream {
    client: reqwest::Client,
    url: Url,
    /// Set when credentials come from config rather than the URL itself.
    /// URL-embedded credentials are sent by reqwest as Basic auth.
    credentials: Option<(String, Option<String>)>,
    read_timeout: Duration,
}

impl Upstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let mut url = Url::parse(config.url.trim())
            .map_err(|e| UpstreamError::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(UpstreamError::InvalidUrl(format!(
                "unsupported scheme {:?}",
                url.scheme()
            )));
        }

        let credentials = match &config.username {
            Some(username) => {
                // Config wins over whatever the URL carries.
                let _ = url.set_username("");
                let _ = url.set_password(None);
                Some((username.clone(), config.password.clone()))
            }
            None => None,
        };

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(UpstreamError::Client)?;

        Ok(Self {
            client,
            url,
            credentials,
            read_timeout: Duration::from_secs(config.read_timeout_secs.max(1)),
        })
    }

    /// The upstream URL with any password masked, for logs.
    pub fn redacted_url(&self) -> String {
        redact(&self.url)
    }

    /// Open the MJPEG stream.
    pub async fn connect(&self) -> Result<MjpegStream, UpstreamError> {
        let mut request = self.client.get(self.url.clone());
        if let Some((username, password)) = &self.credentials {
            request = request.basic_auth(username, password.as_deref());
        }

        let response = request.send().await.map_err(UpstreamError::HttpConnect)?;
        if !response.status().is_success() {
            return Err(UpstreamError::HttpStatus(response.status().as_u16()));
        }

        info!(status = %response.status(), url = %self.redacted_url(), "connected to MJPEG stream");
        Ok(MjpegStream::from_response(response, self.read_timeout))
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// An open MJPEG response, yielding one JPEG payload at a time.
pub struct MjpegStream {
    body: ByteStream,
    parser: MjpegParser,
    pending: VecDeque<Bytes>,
    read_timeout: Duration,
    ended: bool,
}

impl MjpegStream {
    pub fn from_response(response: reqwest::Response, read_timeout: Duration) -> Self {
        let boundary = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(boundary_from_content_type)
            .unwrap_or_else(|| DEFAULT_BOUNDARY.to_string());
        debug!(boundary, "parsing multipart stream");

        Self {
            body: Box::pin(response.bytes_stream()),
            parser: MjpegParser::new(&boundary),
            pending: VecDeque::new(),
            read_timeout,
            ended: false,
        }
    }

    /// Next complete JPEG payload. `Ok(None)` means the upstream closed the
    /// stream.
    pub async fn next_jpeg(&mut self) -> Result<Option<Bytes>, UpstreamError> {
        loop {
            if let Some(jpeg) = self.pending.pop_front() {
                return Ok(Some(jpeg));
            }
            if self.ended {
                return Ok(None);
            }
            match tokio::time::timeout(self.read_timeout, self.body.next()).await {
                Err(_) => return Err(UpstreamError::ReadTimeout(self.read_timeout)),
                Ok(Some(Ok(chunk))) => self.pending.extend(self.parser.push(&chunk)),
                Ok(Some(Err(e))) => return Err(UpstreamError::HttpStream(e)),
                Ok(None) => {
                    self.ended = true;
                    self.pending.extend(self.parser.finish());
                }
            }
        }
    }
}

fn redact(url: &Url) -> String {
    let mut url = url.clone();
    if url.password().is_some() {
        let _ = url.set_password(Some("***"));
    }
    url.to_string()
}

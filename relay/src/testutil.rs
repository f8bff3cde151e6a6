//! Loopback fake camera shared by the async tests.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use camera_relay_common::frame::Frame;
use image::{Rgb, RgbImage};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A small JPEG whose colour depends on `seq`.
pub fn test_jpeg(seq: u64) -> Vec<u8> {
    let shade = (seq * 10 % 256) as u8;
    Frame::new(RgbImage::from_pixel(16, 12, Rgb([shade, 64, 200])), seq, 0)
        .encode_jpeg(90)
        .unwrap()
}

/// A part without Content-Length, the way Flask/OpenCV servers emit them.
pub fn unsized_part(jpeg: &[u8]) -> Bytes {
    let mut part = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

#[derive(Clone)]
struct CameraState {
    parts: Arc<Vec<Bytes>>,
    /// Serve the parts on every connection instead of only the first.
    repeat: bool,
    connections: Arc<AtomicUsize>,
    authorization: Arc<Mutex<Vec<Option<String>>>>,
}

pub struct FakeCamera {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    authorization: Arc<Mutex<Vec<Option<String>>>>,
}

impl FakeCamera {
    pub fn url(&self) -> String {
        format!("http://{}/video", self.addr)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn authorization_headers(&self) -> Vec<Option<String>> {
        self.authorization.lock().unwrap().clone()
    }
}

async fn video(State(state): State<CameraState>, headers: HeaderMap) -> Response {
    state.authorization.lock().unwrap().push(
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(String::from),
    );
    let previous = state.connections.fetch_add(1, Ordering::SeqCst);
    if previous > 0 && !state.repeat {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let parts: Vec<Result<Bytes, Infallible>> = state.parts.iter().cloned().map(Ok).collect();
    (
        [(
            header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )],
        Body::from_stream(futures_util::stream::iter(parts)),
    )
        .into_response()
}

/// Serve `parts` as one finite multipart response at `/video`.
pub async fn spawn_camera(parts: Vec<Bytes>, repeat: bool) -> FakeCamera {
    let connections = Arc::new(AtomicUsize::new(0));
    let authorization = Arc::new(Mutex::new(Vec::new()));
    let state = CameraState {
        parts: Arc::new(parts),
        repeat,
        connections: Arc::clone(&connections),
        authorization: Arc::clone(&authorization),
    };
    let app = Router::new().route("/video", get(video)).with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });

    FakeCamera {
        addr,
        connections,
        authorization,
    }
}

/// An address nothing listens on.
pub async fn dead_address() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

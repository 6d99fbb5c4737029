//! Request/response transport used by upload sessions.
//!
//! `Transport` is the seam between the upload state machine and the
//! network. [`HttpTransport`] implements it with `reqwest`; tests plug in
//! an in-memory server.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::Instant;
use tracing::trace;
use tusk_protocol::{Method, Request, Response};

use crate::error::TransportError;

/// Boxed future returned by [`Transport::execute`].
pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Response, TransportError>> + Send + 'a>>;

/// Executes a single protocol request.
///
/// Implementations report only network-level failures as errors; every
/// HTTP status, including 4xx/5xx, is returned as a [`Response`].
/// Dropping the returned future must abandon the request.
pub trait Transport: Send + Sync {
    fn execute(&self, request: Request) -> TransportFuture<'_>;
}

/// Bodies are handed to `reqwest` in pieces of this size.
const BODY_PIECE_SIZE: usize = 64 * 1024;

/// HTTP transport backed by a `reqwest` client.
///
/// The timeout is an idle timeout: a request fails once `timeout` passes
/// without the body advancing or the server answering. A long PATCH to a
/// slow server keeps going as long as bytes keep moving.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    idle_timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(map_reqwest_error)?;
        Ok(Self {
            http,
            idle_timeout: timeout,
        })
    }
}

/// When a request last made progress.
struct Activity {
    started: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn deadline(&self, idle: Duration) -> Instant {
        self.started + Duration::from_millis(self.last_ms.load(Ordering::Relaxed)) + idle
    }
}

impl Transport for HttpTransport {
    fn execute(&self, request: Request) -> TransportFuture<'_> {
        Box::pin(async move {
            let method = match request.method {
                Method::Post => reqwest::Method::POST,
                Method::Head => reqwest::Method::HEAD,
                Method::Patch => reqwest::Method::PATCH,
                Method::Delete => reqwest::Method::DELETE,
            };
            trace!(method = %request.method, url = %request.url, "sending request");

            let activity = Arc::new(Activity::new());
            let mut builder = self.http.request(method, &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = request.body {
                builder = builder.header(reqwest::header::CONTENT_LENGTH, body.len());
                if body.is_empty() {
                    builder = builder.body(Vec::<u8>::new());
                } else {
                    let tracker = Arc::clone(&activity);
                    let pieces = body
                        .into_pieces(BODY_PIECE_SIZE)
                        .inspect(move |_| tracker.touch());
                    builder = builder.body(reqwest::Body::wrap_stream(pieces));
                }
            }

            let send = builder.send();
            tokio::pin!(send);
            let resp = loop {
                let deadline = activity.deadline(self.idle_timeout);
                tokio::select! {
                    result = &mut send => break result.map_err(map_reqwest_error)?,
                    _ = tokio::time::sleep_until(deadline) => {
                        if activity.deadline(self.idle_timeout) <= Instant::now() {
                            return Err(TransportError::Timeout);
                        }
                    }
                }
            };
            let status = resp.status();
            let headers = resp
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();

            // Bodies only matter for error messages.
            let body = if status.is_success() || request.method == Method::Head {
                String::new()
            } else {
                tokio::time::timeout(self.idle_timeout, resp.text())
                    .await
                    .ok()
                    .and_then(Result::ok)
                    .unwrap_or_default()
            };

            Ok(Response {
                status: status.as_u16(),
                headers,
                body,
            })
        })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_builder() {
        TransportError::InvalidRequest(e.to_string())
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Io(e.to_string())
    }
}

//! In-memory tus server used by the session tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tusk_protocol::constants::{
    HEADER_CONTENT_TYPE, HEADER_LOCATION, HEADER_TUS_RESUMABLE, HEADER_UPLOAD_CHECKSUM,
    HEADER_UPLOAD_DEFER_LENGTH, HEADER_UPLOAD_LENGTH, HEADER_UPLOAD_METADATA,
    HEADER_UPLOAD_OFFSET, OFFSET_OCTET_STREAM, TUS_VERSION,
};
use tusk_protocol::{Method, Request, Response, decode_metadata};
use tusk_transfer::upload_checksum;

use crate::error::TransportError;
use crate::transport::{Transport, TransportFuture};

pub(crate) const ENDPOINT: &str = "http://mock.test/files/";

/// Misbehaviour injected into the next request of a given method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    /// Handle the request normally.
    Pass,
    /// Answer with this status without touching the upload.
    Status(u16),
    /// Fail before the server sees the request.
    Network,
    /// Apply the request, then lose the response.
    LostResponse,
    /// Store nothing and acknowledge one byte more than was sent.
    WrongOffset,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MockUpload {
    pub(crate) data: Vec<u8>,
    pub(crate) length: Option<u64>,
    /// Decoded `Upload-Metadata` sent at creation.
    pub(crate) metadata: BTreeMap<String, String>,
}

/// A request the server actually processed.
#[derive(Debug, Clone)]
pub(crate) struct Recorded {
    pub(crate) method: Method,
    pub(crate) url: String,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body_len: usize,
}

impl Recorded {
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Default)]
struct State {
    uploads: HashMap<String, MockUpload>,
    next_id: u64,
    faults: VecDeque<(Method, Fault)>,
    requests: Vec<Recorded>,
}

#[derive(Default)]
pub(crate) struct MockServer {
    state: Mutex<State>,
    patch_latency: Option<Duration>,
    response_latency: Option<Duration>,
}

impl MockServer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every PATCH waits this long before the server sees it.
    pub(crate) fn with_patch_latency(latency: Duration) -> Self {
        Self {
            patch_latency: Some(latency),
            ..Self::default()
        }
    }

    /// Every PATCH is applied at once but answered only after `latency`.
    pub(crate) fn with_response_latency(latency: Duration) -> Self {
        Self {
            response_latency: Some(latency),
            ..Self::default()
        }
    }

    pub(crate) fn fail_next(&self, method: Method, fault: Fault) {
        self.state.lock().unwrap().faults.push_back((method, fault));
    }

    pub(crate) fn fail_times(&self, method: Method, fault: Fault, times: usize) {
        for _ in 0..times {
            self.fail_next(method, fault);
        }
    }

    /// Creates an upload directly and returns its URL.
    pub(crate) fn seed(&self, data: &[u8], length: Option<u64>) -> String {
        let mut state = self.state.lock().unwrap();
        let url = next_url(&mut state);
        state.uploads.insert(
            url.clone(),
            MockUpload {
                data: data.to_vec(),
                length,
                metadata: BTreeMap::new(),
            },
        );
        url
    }

    pub(crate) fn upload(&self, url: &str) -> Option<MockUpload> {
        self.state.lock().unwrap().uploads.get(url).cloned()
    }

    pub(crate) fn requests(&self) -> Vec<Recorded> {
        self.state.lock().unwrap().requests.clone()
    }

    pub(crate) fn count(&self, method: Method) -> usize {
        self.requests().iter().filter(|r| r.method == method).count()
    }

    fn handle(&self, req: &Request, body: Vec<u8>) -> Result<Response, TransportError> {
        let mut state = self.state.lock().unwrap();

        let index = state.faults.iter().position(|(m, _)| *m == req.method);
        let fault = index
            .and_then(|i| state.faults.remove(i))
            .map(|(_, f)| f);
        if fault == Some(Fault::Network) {
            return Err(TransportError::Connect("connection reset".into()));
        }

        state.requests.push(Recorded {
            method: req.method,
            url: req.url.clone(),
            headers: req.headers.clone(),
            body_len: body.len(),
        });

        match fault {
            Some(Fault::Status(code)) => return Ok(Response::new(code)),
            Some(Fault::WrongOffset) => {
                let offset = header_u64(req, HEADER_UPLOAD_OFFSET).unwrap_or(0);
                let sent = body.len() as u64;
                return Ok(Response::new(204)
                    .with_header(HEADER_UPLOAD_OFFSET, (offset + sent + 1).to_string()));
            }
            _ => {}
        }

        if req.header_value(HEADER_TUS_RESUMABLE) != Some(TUS_VERSION) {
            return Ok(Response::new(412));
        }

        let resp = match req.method {
            Method::Post => create(&mut state, req),
            Method::Head => query(&state, req),
            Method::Patch => append(&mut state, req, &body),
            Method::Delete => match state.uploads.remove(&req.url) {
                Some(_) => Response::new(204),
                None => Response::new(404),
            },
        };

        if fault == Some(Fault::LostResponse) {
            return Err(TransportError::Io("response lost".into()));
        }
        Ok(resp)
    }
}

impl Transport for MockServer {
    fn execute(&self, mut request: Request) -> TransportFuture<'_> {
        Box::pin(async move {
            let body = match request.body.take() {
                Some(body) => body
                    .into_bytes()
                    .await
                    .map_err(|e| TransportError::Io(e.to_string()))?,
                None => Vec::new(),
            };
            let patch = request.method == Method::Patch;
            if patch && let Some(latency) = self.patch_latency {
                tokio::time::sleep(latency).await;
            }
            let resp = self.handle(&request, body)?;
            if patch && let Some(latency) = self.response_latency {
                tokio::time::sleep(latency).await;
            }
            Ok(resp)
        })
    }
}

fn next_url(state: &mut State) -> String {
    state.next_id += 1;
    format!("{ENDPOINT}{}", state.next_id)
}

fn header_u64(req: &Request, name: &str) -> Option<u64> {
    req.header_value(name).and_then(|v| v.parse().ok())
}

fn create(state: &mut State, req: &Request) -> Response {
    let length = match header_u64(req, HEADER_UPLOAD_LENGTH) {
        Some(len) => Some(len),
        None if req.header_value(HEADER_UPLOAD_DEFER_LENGTH) == Some("1") => None,
        None => return Response::new(400),
    };
    let metadata = match req.header_value(HEADER_UPLOAD_METADATA).map(decode_metadata) {
        Some(Ok(metadata)) => metadata,
        Some(Err(_)) => return Response::new(400),
        None => BTreeMap::new(),
    };
    let url = next_url(state);
    let id = url.rsplit('/').next().unwrap_or_default().to_string();
    state.uploads.insert(
        url,
        MockUpload {
            data: Vec::new(),
            length,
            metadata,
        },
    );
    Response::new(201)
        .with_header(HEADER_LOCATION, format!("/files/{id}"))
        .with_header(HEADER_UPLOAD_OFFSET, "0")
}

fn query(state: &State, req: &Request) -> Response {
    let Some(upload) = state.uploads.get(&req.url) else {
        return Response::new(404);
    };
    let resp = Response::new(200).with_header(HEADER_UPLOAD_OFFSET, upload.data.len().to_string());
    match upload.length {
        Some(len) => resp.with_header(HEADER_UPLOAD_LENGTH, len.to_string()),
        None => resp.with_header(HEADER_UPLOAD_DEFER_LENGTH, "1"),
    }
}

fn append(state: &mut State, req: &Request, body: &[u8]) -> Response {
    let Some(upload) = state.uploads.get_mut(&req.url) else {
        return Response::new(404);
    };
    if req.header_value(HEADER_CONTENT_TYPE) != Some(OFFSET_OCTET_STREAM) {
        return Response::new(415);
    }
    if header_u64(req, HEADER_UPLOAD_OFFSET) != Some(upload.data.len() as u64) {
        return Response::new(409);
    }
    if let Some(checksum) = req.header_value(HEADER_UPLOAD_CHECKSUM)
        && checksum != upload_checksum(body)
    {
        return Response::new(460);
    }
    if let Some(len) = header_u64(req, HEADER_UPLOAD_LENGTH) {
        upload.length = Some(len);
    }
    if let Some(len) = upload.length
        && upload.data.len() as u64 + body.len() as u64 > len
    {
        return Response::new(400);
    }
    upload.data.extend_from_slice(body);
    Response::new(204).with_header(HEADER_UPLOAD_OFFSET, upload.data.len().to_string())
}

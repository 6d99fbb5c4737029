//! Transport-neutral request and response types.

use std::fmt;
use std::io;

use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};

use crate::WireError;
use crate::constants::{HEADER_LOCATION, HEADER_UPLOAD_LENGTH, HEADER_UPLOAD_OFFSET};

/// HTTP methods used by the tus core protocol and its extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Creation extension: create a new upload resource.
    Post,
    /// Query the current offset of an upload.
    Head,
    /// Append bytes at an offset.
    Patch,
    /// Termination extension: discard an upload.
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request payload.
pub enum Body {
    /// Bytes already in memory.
    Bytes(Vec<u8>),
    /// Exactly `len` bytes, produced piece by piece while the request is sent.
    Stream {
        len: u64,
        pieces: BoxStream<'static, io::Result<Vec<u8>>>,
    },
}

impl Body {
    pub fn stream(len: u64, pieces: BoxStream<'static, io::Result<Vec<u8>>>) -> Self {
        Body::Stream { len, pieces }
    }

    pub fn len(&self) -> u64 {
        match self {
            Body::Bytes(data) => data.len() as u64,
            Body::Stream { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Splits the payload into pieces of at most `piece_size` bytes.
    pub fn into_pieces(self, piece_size: usize) -> BoxStream<'static, io::Result<Vec<u8>>> {
        match self {
            Body::Bytes(data) => {
                let piece_size = piece_size.max(1);
                let starts = (0..data.len()).step_by(piece_size);
                stream::iter(starts.map(move |at| {
                    let end = (at + piece_size).min(data.len());
                    Ok(data[at..end].to_vec())
                }))
                .boxed()
            }
            Body::Stream { pieces, .. } => pieces,
        }
    }

    /// Collects the whole payload. A stream yielding more or fewer bytes
    /// than announced is an error.
    pub async fn into_bytes(self) -> io::Result<Vec<u8>> {
        let expected = self.len();
        let data = match self {
            Body::Bytes(data) => data,
            Body::Stream { pieces, .. } => {
                pieces
                    .try_fold(Vec::new(), |mut acc, piece| async move {
                        acc.extend_from_slice(&piece);
                        Ok(acc)
                    })
                    .await?
            }
        };
        if data.len() as u64 != expected {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("body produced {} of {expected} bytes", data.len()),
            ));
        }
        Ok(data)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Bytes(data) => f.debug_tuple("Bytes").field(&data.len()).finish(),
            Body::Stream { len, .. } => f.debug_struct("Stream").field("len", len).finish(),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(data: Vec<u8>) -> Self {
        Body::Bytes(data)
    }
}

/// A single protocol request.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Body>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Appends a header, replacing an earlier value with the same name.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        lookup(&self.headers, name)
    }
}

/// A protocol response: status line and headers. Bodies are not used by
/// the tus core protocol, only kept for error reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        lookup(&self.headers, name)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parses `Upload-Offset`. `Ok(None)` when the header is absent.
    pub fn upload_offset(&self) -> Result<Option<u64>, WireError> {
        parse_u64(self, HEADER_UPLOAD_OFFSET)
    }

    /// Parses `Upload-Length`. `Ok(None)` when the header is absent.
    pub fn upload_length(&self) -> Result<Option<u64>, WireError> {
        parse_u64(self, HEADER_UPLOAD_LENGTH)
    }

    pub fn location(&self) -> Option<&str> {
        self.header(HEADER_LOCATION).filter(|l| !l.is_empty())
    }
}

fn lookup<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn parse_u64(resp: &Response, name: &'static str) -> Result<Option<u64>, WireError> {
    match resp.header(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| WireError::InvalidHeader {
                name,
                value: raw.to_string(),
            }),
    }
}

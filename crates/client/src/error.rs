//! Upload error taxonomy and status classification.

use tusk_protocol::Response;
use tusk_protocol::constants::{
    STATUS_CHECKSUM_MISMATCH, STATUS_CONFLICT, STATUS_FORBIDDEN, STATUS_GONE, STATUS_LOCKED,
    STATUS_NOT_FOUND, STATUS_UNAUTHORIZED,
};

/// Longest server body kept in an error message.
const MAX_BODY_IN_ERROR: usize = 256;

/// Errors surfaced by an upload session.
///
/// Every variant knows whether the retry policy applies to it; see
/// [`UploadError::is_retryable`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    /// Invalid construction inputs, bad credentials, or a creation request
    /// the server refused.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Connection reset, timeout, DNS failure.
    #[error("network error: {0}")]
    Network(String),

    /// `Upload-Offset` precondition did not match the server.
    #[error("offset conflict at {offset}")]
    Conflict { offset: u64 },

    /// The upload resource expired or was removed.
    #[error("upload resource gone: {url}")]
    ResourceGone { url: String },

    /// The server violated the offset-advance contract.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// 5xx or 423 Locked.
    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },

    /// The server rejected the chunk's `Upload-Checksum`.
    #[error("checksum mismatch for chunk at {offset}")]
    ChecksumMismatch { offset: u64 },

    /// Any other 4xx.
    #[error("request rejected with {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Operation not allowed in the session's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Reading the byte source failed.
    #[error("source error: {0}")]
    Source(String),
}

impl UploadError {
    /// Transient errors consume the retry policy; everything else is fatal.
    ///
    /// Conflicts are retryable but handled by an offset re-query rather than
    /// the delay list.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UploadError::Network(_)
                | UploadError::Server { .. }
                | UploadError::ChecksumMismatch { .. }
                | UploadError::Conflict { .. }
        )
    }
}

impl From<tusk_transfer::TransferError> for UploadError {
    fn from(e: tusk_transfer::TransferError) -> Self {
        UploadError::Source(e.to_string())
    }
}

impl From<tusk_protocol::WireError> for UploadError {
    fn from(e: tusk_protocol::WireError) -> Self {
        match e {
            tusk_protocol::WireError::InvalidHeader { .. } => UploadError::Protocol(e.to_string()),
            _ => UploadError::Configuration(e.to_string()),
        }
    }
}

/// Network-level failures reported by a [`crate::Transport`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(String),

    /// The request could not be built (bad URL, illegal header).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<TransportError> for UploadError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::InvalidRequest(msg) => UploadError::Configuration(msg),
            other => UploadError::Network(other.to_string()),
        }
    }
}

/// Which request a non-success response answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Create,
    Query,
    Chunk { offset: u64 },
    Terminate,
}

/// Maps a non-success response to an [`UploadError`].
pub(crate) fn classify(phase: Phase, url: &str, resp: &Response) -> UploadError {
    let status = resp.status;
    let body = truncate_body(&resp.body);

    match status {
        STATUS_UNAUTHORIZED | STATUS_FORBIDDEN => UploadError::Configuration(format!(
            "{} refused with {status}: {body}",
            phase_name(phase)
        )),
        STATUS_LOCKED => UploadError::Server { status, body },
        500..=599 => UploadError::Server { status, body },
        _ if phase == Phase::Create && (400..500).contains(&status) => UploadError::Configuration(
            format!("upload creation refused with {status}: {body}"),
        ),
        STATUS_NOT_FOUND | STATUS_GONE => UploadError::ResourceGone {
            url: url.to_string(),
        },
        STATUS_CONFLICT => match phase {
            Phase::Chunk { offset } => UploadError::Conflict { offset },
            _ => UploadError::Rejected { status, body },
        },
        STATUS_CHECKSUM_MISMATCH => match phase {
            Phase::Chunk { offset } => UploadError::ChecksumMismatch { offset },
            _ => UploadError::Rejected { status, body },
        },
        400..=499 => UploadError::Rejected { status, body },
        _ => UploadError::Protocol(format!(
            "unexpected status {status} for {}",
            phase_name(phase)
        )),
    }
}

fn phase_name(phase: Phase) -> &'static str {
    match phase {
        Phase::Create => "upload creation",
        Phase::Query => "offset query",
        Phase::Chunk { .. } => "chunk upload",
        Phase::Terminate => "termination",
    }
}

fn truncate_body(body: &str) -> String {
    let body = body.trim();
    match body.char_indices().nth(MAX_BODY_IN_ERROR) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "http://localhost:8180/files/abc";

    fn status(code: u16) -> Response {
        Response::new(code)
    }

    #[test]
    fn forbidden_creation_is_configuration() {
        let err = classify(Phase::Create, URL, &status(403));
        assert!(matches!(err, UploadError::Configuration(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn any_4xx_on_creation_is_configuration() {
        let err = classify(Phase::Create, URL, &status(413));
        assert!(matches!(err, UploadError::Configuration(_)));
    }

    #[test]
    fn unauthorized_chunk_is_configuration() {
        let err = classify(Phase::Chunk { offset: 10 }, URL, &status(401));
        assert!(matches!(err, UploadError::Configuration(_)));
    }

    #[test]
    fn gone_and_not_found_are_fatal() {
        for code in [404, 410] {
            let err = classify(Phase::Query, URL, &status(code));
            assert_eq!(err, UploadError::ResourceGone { url: URL.into() });
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn conflict_on_chunk_is_retryable() {
        let err = classify(Phase::Chunk { offset: 5 }, URL, &status(409));
        assert_eq!(err, UploadError::Conflict { offset: 5 });
        assert!(err.is_retryable());
    }

    #[test]
    fn server_errors_are_transient() {
        for code in [500, 502, 503, 423] {
            assert!(classify(Phase::Chunk { offset: 0 }, URL, &status(code)).is_retryable());
        }
    }

    #[test]
    fn checksum_mismatch_is_transient() {
        let err = classify(Phase::Chunk { offset: 7 }, URL, &status(460));
        assert_eq!(err, UploadError::ChecksumMismatch { offset: 7 });
        assert!(err.is_retryable());
    }

    #[test]
    fn other_4xx_rejected() {
        let err = classify(Phase::Chunk { offset: 0 }, URL, &status(400));
        assert!(matches!(err, UploadError::Rejected { status: 400, .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn protocol_errors_never_retryable() {
        assert!(!UploadError::Protocol("offset mismatch".into()).is_retryable());
    }

    #[test]
    fn long_bodies_truncated() {
        let mut resp = status(500);
        resp.body = "x".repeat(1000);
        match classify(Phase::Query, URL, &resp) {
            UploadError::Server { body, .. } => assert_eq!(body.len(), MAX_BODY_IN_ERROR + 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn transport_errors_map_to_network() {
        let err: UploadError = TransportError::Timeout.into();
        assert!(matches!(err, UploadError::Network(_)));
        let err: UploadError = TransportError::InvalidRequest("bad header".into()).into();
        assert!(matches!(err, UploadError::Configuration(_)));
    }
}

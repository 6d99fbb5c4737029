//! Public types for upload sessions.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use tusk_protocol::constants::{DEFAULT_REQUEST_TIMEOUT, DEFAULT_RETRY_DELAYS_MS};

use crate::error::UploadError;

/// Lifecycle state of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadState {
    /// Constructed, nothing sent yet.
    Idle,
    /// Creation request in flight.
    Creating,
    /// Querying the offset or sending chunks.
    Uploading,
    /// Stopped by the caller; can be resumed.
    Paused,
    /// Waiting out a backoff delay after a transient failure.
    Retrying,
    Succeeded,
    Failed,
    /// Discarded by the caller.
    Aborted,
}

impl UploadState {
    /// A run is currently driving the session.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            UploadState::Creating | UploadState::Uploading | UploadState::Retrying
        )
    }

    /// No further `start()` is accepted.
    pub fn is_final(&self) -> bool {
        matches!(self, UploadState::Succeeded | UploadState::Aborted)
    }
}

/// Notifications emitted by a session, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    StateChanged(UploadState),
    /// The server created the upload resource.
    Created { upload_url: String },
    /// Server-confirmed progress. `bytes_sent` strictly increases.
    Progress {
        bytes_sent: u64,
        bytes_total: Option<u64>,
    },
    /// A transient failure; the next attempt follows after `delay`.
    Retrying {
        attempt: u32,
        delay: Duration,
        error: UploadError,
    },
    Paused { offset: u64 },
    Succeeded { upload_url: String },
    Failed {
        error: UploadError,
        attempts: u32,
        offset: u64,
    },
    Aborted { offset: u64 },
}

/// How a single run of the session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Succeeded,
    Paused,
    Failed { error: UploadError, attempts: u32 },
    Aborted,
}

/// Maximum bytes per PATCH request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkSize {
    /// Everything that remains in one request.
    #[default]
    Unbounded,
    Bytes(u64),
}

impl ChunkSize {
    /// `0` means unbounded.
    pub fn bytes(n: u64) -> Self {
        if n == 0 {
            ChunkSize::Unbounded
        } else {
            ChunkSize::Bytes(n)
        }
    }

    pub fn as_option(&self) -> Option<u64> {
        match self {
            ChunkSize::Unbounded => None,
            ChunkSize::Bytes(n) => Some(*n),
        }
    }
}

/// Backoff delays consumed by consecutive transient failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_millis(&DEFAULT_RETRY_DELAYS_MS)
    }
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn from_millis(delays: &[u64]) -> Self {
        Self::new(delays.iter().copied().map(Duration::from_millis).collect())
    }

    /// No retries at all: the first transient failure is final.
    pub fn none() -> Self {
        Self::new(Vec::new())
    }

    /// Delay before retrying after the `failure`-th consecutive failure
    /// (0-based). `None` once the policy is exhausted.
    pub fn delay_for(&self, failure: u32) -> Option<Duration> {
        self.delays.get(failure as usize).copied()
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

/// Caller-supplied configuration for a session.
#[derive(Clone)]
pub struct UploadOptions {
    /// Where upload resources are created (POST target).
    pub endpoint: String,
    /// A previously created upload to resume instead of creating one.
    pub upload_url: Option<String>,
    pub chunk_size: ChunkSize,
    pub retry: RetryPolicy,
    /// Sent once, at creation, as `Upload-Metadata`.
    pub metadata: BTreeMap<String, String>,
    /// Sent with every request. Values are never logged.
    pub headers: BTreeMap<String, String>,
    /// Allow sources of unknown length (`Upload-Defer-Length`).
    pub allow_deferred_length: bool,
    /// Send `Upload-Checksum` with every chunk.
    pub checksums: bool,
    /// Issue a termination request when the session is discarded.
    pub terminate_on_discard: bool,
    /// Offset re-queries allowed after consecutive 409 responses.
    pub max_conflict_retries: u32,
    /// How long an HTTP request may go without progress before it fails.
    pub request_timeout: Duration,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            upload_url: None,
            chunk_size: ChunkSize::Unbounded,
            retry: RetryPolicy::default(),
            metadata: BTreeMap::new(),
            headers: BTreeMap::new(),
            allow_deferred_length: false,
            checksums: false,
            terminate_on_discard: false,
            max_conflict_retries: 3,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl UploadOptions {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn with_upload_url(mut self, url: impl Into<String>) -> Self {
        self.upload_url = Some(url.into());
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: ChunkSize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_deferred_length(mut self, allow: bool) -> Self {
        self.allow_deferred_length = allow;
        self
    }

    pub fn with_checksums(mut self, enabled: bool) -> Self {
        self.checksums = enabled;
        self
    }

    pub fn with_terminate_on_discard(mut self, enabled: bool) -> Self {
        self.terminate_on_discard = enabled;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

// Header values carry credentials.
impl fmt::Debug for UploadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header_names: Vec<&str> = self.headers.keys().map(String::as_str).collect();
        f.debug_struct("UploadOptions")
            .field("endpoint", &self.endpoint)
            .field("upload_url", &self.upload_url)
            .field("chunk_size", &self.chunk_size)
            .field("retry", &self.retry)
            .field("metadata", &self.metadata)
            .field("headers", &header_names)
            .field("allow_deferred_length", &self.allow_deferred_length)
            .field("checksums", &self.checksums)
            .field("terminate_on_discard", &self.terminate_on_discard)
            .field("max_conflict_retries", &self.max_conflict_retries)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Some(Duration::ZERO));
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_for(4), None);
        assert_eq!(policy.delays().len(), 4);
    }

    #[test]
    fn no_retry_policy() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.delay_for(0), None);
        assert!(policy.delays().is_empty());
    }

    #[test]
    fn chunk_size_zero_is_unbounded() {
        assert_eq!(ChunkSize::bytes(0), ChunkSize::Unbounded);
        assert_eq!(ChunkSize::bytes(5).as_option(), Some(5));
        assert_eq!(ChunkSize::Unbounded.as_option(), None);
    }

    #[test]
    fn state_classes() {
        assert!(UploadState::Retrying.is_active());
        assert!(!UploadState::Paused.is_active());
        assert!(UploadState::Aborted.is_final());
        assert!(!UploadState::Failed.is_final());
    }

    #[test]
    fn debug_redacts_header_values() {
        let opts = UploadOptions::new("http://localhost/files/")
            .with_header("Authorization", "Bearer secret-token");
        let printed = format!("{opts:?}");
        assert!(printed.contains("Authorization"));
        assert!(!printed.contains("secret-token"));
    }

    #[test]
    fn builder_sets_fields() {
        let opts = UploadOptions::new("http://localhost/files/")
            .with_chunk_size(ChunkSize::bytes(1024))
            .with_metadata("filename", "a.mp4")
            .with_checksums(true);
        assert_eq!(opts.chunk_size, ChunkSize::Bytes(1024));
        assert_eq!(opts.metadata["filename"], "a.mp4");
        assert!(opts.checksums);
        assert!(!opts.allow_deferred_length);
        assert_eq!(opts.max_conflict_retries, 3);
    }
}

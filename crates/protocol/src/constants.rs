use std::time::Duration;

/// Protocol version sent in every `Tus-Resumable` header.
pub const TUS_VERSION: &str = "1.0.0";

pub const HEADER_TUS_RESUMABLE: &str = "Tus-Resumable";
pub const HEADER_UPLOAD_OFFSET: &str = "Upload-Offset";
pub const HEADER_UPLOAD_LENGTH: &str = "Upload-Length";
pub const HEADER_UPLOAD_DEFER_LENGTH: &str = "Upload-Defer-Length";
pub const HEADER_UPLOAD_METADATA: &str = "Upload-Metadata";
pub const HEADER_UPLOAD_CHECKSUM: &str = "Upload-Checksum";
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_LOCATION: &str = "Location";

/// Content type required on every PATCH body.
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

pub const STATUS_FORBIDDEN: u16 = 403;
pub const STATUS_UNAUTHORIZED: u16 = 401;
pub const STATUS_NOT_FOUND: u16 = 404;
pub const STATUS_CONFLICT: u16 = 409;
pub const STATUS_GONE: u16 = 410;
pub const STATUS_LOCKED: u16 = 423;

/// Non-standard status used by tus servers when `Upload-Checksum` does not
/// match the received body.
pub const STATUS_CHECKSUM_MISMATCH: u16 = 460;

/// How long a single request may go without progress.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry delays in milliseconds used when the caller supplies none.
pub const DEFAULT_RETRY_DELAYS_MS: [u64; 4] = [0, 1000, 3000, 5000];

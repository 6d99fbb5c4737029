//! Byte sources and chunked reading for resumable uploads.
//!
//! A [`ByteSource`] is the "file" being uploaded. The upload session never
//! copies it; it asks [`ChunkReader`] for the next range whenever the server
//! confirms an offset. Ranges longer than [`MAX_BUFFERED_CHUNK`] are not read
//! up front but described as a [`Span`] and read piece by piece.

mod chunked;
mod progress;
mod source;

pub use chunked::{
    Chunk, ChunkReader, MAX_BUFFERED_CHUNK, STREAM_PIECE_SIZE, Span, UploadChecksum, read_exact_at,
    upload_checksum,
};
pub use progress::{SpeedCalculator, percent};
pub use source::{ByteSource, FileSource, MemorySource, StreamSource};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("source ended at {offset} but {expected} bytes were declared")]
    Truncated { offset: u64, expected: u64 },

    #[error("offset {offset} is past the end of the source ({len} bytes)")]
    OffsetOutOfRange { offset: u64, len: u64 },
}

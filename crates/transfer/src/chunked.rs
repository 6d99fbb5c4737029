use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};

use crate::TransferError;
use crate::source::ByteSource;

/// Chunks longer than this are streamed from the source instead of buffered.
pub const MAX_BUFFERED_CHUNK: u64 = 8 * 1024 * 1024;

/// Read size used while streaming a chunk.
pub const STREAM_PIECE_SIZE: u64 = 1024 * 1024;

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Incremental `Upload-Checksum` value for a chunk read in pieces.
#[derive(Default)]
pub struct UploadChecksum {
    hasher: Sha256,
}

impl UploadChecksum {
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// `sha256 <base64 digest>`.
    pub fn header_value(self) -> String {
        format!("sha256 {}", BASE64.encode(self.hasher.finalize()))
    }
}

/// Builds an `Upload-Checksum` header value: `sha256 <base64 digest>`.
pub fn upload_checksum(data: &[u8]) -> String {
    let mut checksum = UploadChecksum::default();
    checksum.update(data);
    checksum.header_value()
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// A contiguous byte range read from a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Byte offset of `data[0]` within the source.
    pub offset: u64,
    pub data: Vec<u8>,
    /// Set when the source has no bytes after this chunk.
    pub last: bool,
}

impl Chunk {
    /// Offset just past the end of this chunk.
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// A chunk's position in a source of known length, not yet read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub offset: u64,
    pub len: u64,
    /// Length of the whole source.
    pub total: u64,
}

impl Span {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    pub fn last(&self) -> bool {
        self.end() == self.total
    }

    /// `(offset, len)` pieces of at most [`STREAM_PIECE_SIZE`] bytes, in order.
    pub fn pieces(self) -> impl Iterator<Item = (u64, u64)> + Send + 'static {
        let end = self.end();
        (self.offset..end)
            .step_by(STREAM_PIECE_SIZE as usize)
            .map(move |at| (at, (end - at).min(STREAM_PIECE_SIZE)))
    }
}

/// Reads fixed-size chunks from a [`ByteSource`] at server-confirmed offsets.
#[derive(Debug, Clone, Copy)]
pub struct ChunkReader {
    chunk_size: Option<u64>,
}

impl ChunkReader {
    /// `None` means unbounded: one chunk holds everything that remains.
    pub fn new(chunk_size: Option<u64>) -> Self {
        Self {
            chunk_size: chunk_size.filter(|&c| c > 0),
        }
    }

    /// The chunk at `offset` when it is too long to buffer.
    ///
    /// `Ok(None)` means [`read_chunk`](Self::read_chunk) should be used:
    /// the chunk is small enough, or the source length is unknown.
    pub fn streamed_span(
        &self,
        source: &dyn ByteSource,
        offset: u64,
    ) -> Result<Option<Span>, TransferError> {
        let Some(total) = source.size() else {
            return Ok(None);
        };
        if offset > total {
            return Err(TransferError::OffsetOutOfRange { offset, len: total });
        }
        let remaining = total - offset;
        let len = self.chunk_size.map_or(remaining, |c| c.min(remaining));
        Ok((len > MAX_BUFFERED_CHUNK).then_some(Span { offset, len, total }))
    }

    /// Reads the chunk starting at `offset`.
    ///
    /// For sources of known length the chunk covers
    /// `[offset, offset + min(chunk_size, remaining))`. A source that ends
    /// before its declared length is reported as [`TransferError::Truncated`].
    /// For sources of unknown length a bounded chunk size is required; the
    /// chunk is marked `last` when the source runs dry.
    pub fn read_chunk(&self, source: &dyn ByteSource, offset: u64) -> Result<Chunk, TransferError> {
        match source.size() {
            Some(len) => {
                if offset > len {
                    return Err(TransferError::OffsetOutOfRange { offset, len });
                }
                let remaining = len - offset;
                let want = self.chunk_size.map_or(remaining, |c| c.min(remaining));
                let data = read_exact_at(source, offset, want, len)?;
                let last = offset + want == len;
                Ok(Chunk { offset, data, last })
            }
            None => {
                let want = self.chunk_size.ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "unbounded chunks need a source of known length",
                    )
                })?;
                let data = read_exactly(source, offset, want)?;
                let last = (data.len() as u64) < want;
                Ok(Chunk { offset, data, last })
            }
        }
    }
}

/// Reads exactly `len` bytes at `offset` from a source declared to hold
/// `total` bytes. A short read is reported as [`TransferError::Truncated`].
pub fn read_exact_at(
    source: &dyn ByteSource,
    offset: u64,
    len: u64,
    total: u64,
) -> Result<Vec<u8>, TransferError> {
    let data = read_exactly(source, offset, len)?;
    if (data.len() as u64) < len {
        return Err(TransferError::Truncated {
            offset: offset + data.len() as u64,
            expected: total,
        });
    }
    Ok(data)
}

fn read_exactly(source: &dyn ByteSource, offset: u64, want: u64) -> Result<Vec<u8>, TransferError> {
    let want = usize::try_from(want).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "chunk too large for memory")
    })?;
    let mut buf = vec![0u8; want];
    let n = source.read_at(offset, &mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use tracing::debug;

use crate::TransferError;

/// Addressable byte source being uploaded.
///
/// `read_at` fills `buf` starting at `offset` and returns the number of
/// bytes written. It returns fewer than `buf.len()` bytes only when the
/// data ends, and `0` at the end of data.
pub trait ByteSource: Send + Sync {
    /// Total length in bytes, if known up front.
    fn size(&self) -> Option<u64>;

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

// ---------------------------------------------------------------------------
// FileSource
// ---------------------------------------------------------------------------

/// A file on disk. Length and modification time are captured at open.
pub struct FileSource {
    file: Mutex<File>,
    path: PathBuf,
    size: u64,
    modified: Option<SystemTime>,
}

impl FileSource {
    pub fn open(path: &Path) -> Result<Self, TransferError> {
        let file = File::open(path)?;
        let metadata = file.metadata()?;
        if metadata.is_dir() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "source is a directory").into());
        }
        debug!(path = %path.display(), size = metadata.len(), "opened file source");
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            size: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn modified(&self) -> Option<SystemTime> {
        self.modified
    }

    /// File name component, used as the default `filename` metadata.
    pub fn file_name(&self) -> Option<String> {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }
}

impl ByteSource for FileSource {
    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("file source lock poisoned"))?;
        file.seek(SeekFrom::Start(offset))?;
        fill(&mut *file, buf)
    }
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

/// In-memory bytes.
pub struct MemorySource {
    data: Vec<u8>,
}

impl MemorySource {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }
}

impl ByteSource for MemorySource {
    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// StreamSource
// ---------------------------------------------------------------------------

/// A forward-only reader of unknown length (a pipe, stdin).
///
/// The bytes of the most recent read are retained so the same range can be
/// read again after a failed request. Reading before that range fails with
/// [`io::ErrorKind::Unsupported`].
pub struct StreamSource<R> {
    inner: Mutex<StreamState<R>>,
}

struct StreamState<R> {
    reader: R,
    window_start: u64,
    window: Vec<u8>,
    eof: bool,
}

impl<R: Read + Send> StreamSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: Mutex::new(StreamState {
                reader,
                window_start: 0,
                window: Vec::new(),
                eof: false,
            }),
        }
    }
}

impl<R: Read + Send> ByteSource for StreamSource<R> {
    fn size(&self) -> Option<u64> {
        None
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self
            .inner
            .lock()
            .map_err(|_| io::Error::other("stream source lock poisoned"))?;
        let window_end = state.window_start + state.window.len() as u64;
        if offset < state.window_start || offset > window_end {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!(
                    "stream cannot serve offset {offset} (buffered {}..{window_end})",
                    state.window_start
                ),
            ));
        }

        // Drop bytes before the requested offset; they were acknowledged.
        let skip = (offset - state.window_start) as usize;
        state.window.drain(..skip);
        state.window_start = offset;

        while state.window.len() < buf.len() && !state.eof {
            let have = state.window.len();
            let want = buf.len() - have;
            state.window.resize(have + want, 0);
            let StreamState { reader, window, .. } = &mut *state;
            let n = match fill(reader, &mut window[have..]) {
                Ok(n) => n,
                Err(e) => {
                    state.window.truncate(have);
                    return Err(e);
                }
            };
            state.window.truncate(have + n);
            if n < want {
                state.eof = true;
            }
        }

        let n = buf.len().min(state.window.len());
        buf[..n].copy_from_slice(&state.window[..n]);
        Ok(n)
    }
}

/// Reads until `buf` is full or the reader is exhausted.
fn fill<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn memory_source_reads_ranges() {
        let src = MemorySource::new(b"0123456789".to_vec());
        assert_eq!(src.size(), Some(10));

        let mut buf = [0u8; 4];
        assert_eq!(src.read_at(6, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"6789");

        assert_eq!(src.read_at(8, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"89");

        assert_eq!(src.read_at(10, &mut buf).unwrap(), 0);
        assert_eq!(src.read_at(99, &mut buf).unwrap(), 0);
    }

    #[test]
    fn file_source_reads_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.bin");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"AABBCCDDEE").unwrap();
        drop(f);

        let src = FileSource::open(&path).unwrap();
        assert_eq!(src.size(), Some(10));
        assert_eq!(src.file_name().as_deref(), Some("movie.bin"));
        assert!(src.modified().is_some());

        let mut buf = [0u8; 4];
        assert_eq!(src.read_at(4, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"CCDD");
        // Out-of-order reads are fine for files.
        assert_eq!(src.read_at(0, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"AABB");
    }

    #[test]
    fn file_source_missing_file() {
        let result = FileSource::open(Path::new("/nonexistent/tusk/file.bin"));
        assert!(matches!(result, Err(TransferError::Io(_))));
    }

    #[test]
    fn file_source_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(FileSource::open(dir.path()), Err(TransferError::Io(_))));
    }

    #[test]
    fn stream_source_rereads_last_window() {
        let src = StreamSource::new(&b"abcdefghij"[..]);
        assert_eq!(src.size(), None);

        let mut buf = [0u8; 4];
        assert_eq!(src.read_at(0, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");

        // Retry of the same range is served from the window.
        assert_eq!(src.read_at(0, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");

        // Partial acknowledgement: continue from the middle of the window.
        assert_eq!(src.read_at(2, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"cdef");

        assert_eq!(src.read_at(6, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"ghij");
        assert_eq!(src.read_at(10, &mut buf).unwrap(), 0);
    }

    #[test]
    fn stream_source_rejects_rewind() {
        let src = StreamSource::new(&b"abcdefghij"[..]);
        let mut buf = [0u8; 4];
        src.read_at(0, &mut buf).unwrap();
        src.read_at(4, &mut buf).unwrap();

        let err = src.read_at(0, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn stream_source_rejects_gap() {
        let src = StreamSource::new(&b"abcdefghij"[..]);
        let mut buf = [0u8; 2];
        let err = src.read_at(5, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}

//! Resumable chunked upload sessions.
//!
//! An [`UploadSession`] uploads one [`tusk_transfer::ByteSource`] to a
//! tus 1.0.0 server. It creates the upload resource, sends the bytes in
//! chunks at server-confirmed offsets, and can be paused and resumed.
//! Transient failures are retried with the delays from a [`RetryPolicy`].
//!
//! ```no_run
//! # async fn demo() -> Result<(), tusk_client::UploadError> {
//! use std::sync::Arc;
//! use tusk_client::{ChunkSize, UploadEvent, UploadOptions, UploadSession};
//! use tusk_transfer::MemorySource;
//!
//! let options = UploadOptions::new("http://localhost:1080/files/")
//!     .with_chunk_size(ChunkSize::bytes(5 * 1024 * 1024));
//! let mut session = UploadSession::with_http(Arc::new(MemorySource::new(vec![0; 1024])), options)?;
//! let mut events = session.take_events().expect("events");
//!
//! session.start()?;
//! while let Some(event) = events.recv().await {
//!     if let UploadEvent::Succeeded { upload_url } = event {
//!         println!("uploaded to {upload_url}");
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod error;
mod runner;
mod session;
pub mod store;
mod transport;
pub mod types;

#[cfg(test)]
mod mock;

pub use error::{TransportError, UploadError};
pub use session::UploadSession;
pub use store::{StoreError, UrlStore, fingerprint};
pub use transport::{HttpTransport, Transport, TransportFuture};
pub use types::{ChunkSize, RetryPolicy, RunOutcome, UploadEvent, UploadOptions, UploadState};

//! Wire vocabulary for the tus 1.0.0 resumable upload protocol.
//!
//! This crate knows nothing about sessions or retries. It defines the
//! header names and status codes the protocol uses, the abstract
//! request/response pair a transport moves around (with a [`Body`] that
//! may be streamed), and the `Upload-Metadata` codec.

pub mod constants;
pub mod http;
pub mod metadata;

pub use constants::TUS_VERSION;
pub use http::{Body, Method, Request, Response};
pub use metadata::{decode_metadata, encode_metadata};

/// Errors produced while building or reading tus headers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("invalid metadata key: {0:?}")]
    InvalidMetadataKey(String),

    #[error("invalid metadata value for {key}: {reason}")]
    InvalidMetadataValue { key: String, reason: String },

    #[error("invalid {name} header: {value:?}")]
    InvalidHeader { name: &'static str, value: String },
}

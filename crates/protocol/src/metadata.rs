//! `Upload-Metadata` header codec.
//!
//! The header is a comma-separated list of `key base64(value)` pairs.
//! A key with an empty value is sent alone.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::WireError;

/// Encodes metadata into an `Upload-Metadata` value.
///
/// Keys must be non-empty ASCII without spaces or commas.
pub fn encode_metadata(metadata: &BTreeMap<String, String>) -> Result<String, WireError> {
    let mut pairs = Vec::with_capacity(metadata.len());
    for (key, value) in metadata {
        validate_key(key)?;
        if value.is_empty() {
            pairs.push(key.clone());
        } else {
            pairs.push(format!("{key} {}", BASE64.encode(value.as_bytes())));
        }
    }
    Ok(pairs.join(","))
}

/// Decodes an `Upload-Metadata` value.
pub fn decode_metadata(header: &str) -> Result<BTreeMap<String, String>, WireError> {
    let mut out = BTreeMap::new();
    for pair in header.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let mut parts = pair.splitn(2, ' ');
        let key = parts.next().unwrap_or_default();
        validate_key(key)?;
        let value = match parts.next().map(str::trim) {
            None | Some("") => String::new(),
            Some(encoded) => {
                let bytes = BASE64
                    .decode(encoded)
                    .map_err(|e| WireError::InvalidMetadataValue {
                        key: key.to_string(),
                        reason: e.to_string(),
                    })?;
                String::from_utf8(bytes).map_err(|e| WireError::InvalidMetadataValue {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?
            }
        };
        out.insert(key.to_string(), value);
    }
    Ok(out)
}

fn validate_key(key: &str) -> Result<(), WireError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii() && !c.is_ascii_control() && c != ' ' && c != ',');
    if valid {
        Ok(())
    } else {
        Err(WireError::InvalidMetadataKey(key.to_string()))
    }
}

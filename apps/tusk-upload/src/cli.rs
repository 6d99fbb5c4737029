//! Command-line arguments. Flags override the configuration file.

use std::path::PathBuf;

use clap::Parser;

use crate::config::Config;

#[derive(Debug, Clone, Parser)]
#[command(name = "tusk-upload", version, about = "Resumable uploads to a tus server", long_about = None)]
pub struct Cli {
    /// File to upload.
    pub file: PathBuf,

    /// Configuration file (defaults to the per-user config).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Upload creation endpoint.
    #[arg(short, long)]
    pub endpoint: Option<String>,

    /// Bytes per request (0 = whole file).
    #[arg(long)]
    pub chunk_size: Option<u64>,

    /// Comma-separated retry delays in milliseconds.
    #[arg(long, value_delimiter = ',')]
    pub retry_delays: Option<Vec<u64>>,

    /// Extra metadata as `key=value`. Repeatable.
    #[arg(long = "meta", value_parser = parse_key_value)]
    pub metadata: Vec<(String, String)>,

    /// Send a checksum with every chunk.
    #[arg(long)]
    pub checksums: bool,

    /// Start a new upload even if an earlier one can be resumed.
    #[arg(long)]
    pub no_resume: bool,

    /// Discard the upload recorded for this file instead of uploading.
    #[arg(long)]
    pub discard: bool,
}

impl Cli {
    /// Applies flag overrides on top of the loaded configuration.
    pub fn apply(&self, config: &mut Config) {
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if let Some(delays) = &self.retry_delays {
            config.retry_delays_ms = delays.clone();
        }
        for (key, value) in &self.metadata {
            config.metadata.insert(key.clone(), value.clone());
        }
        if self.checksums {
            config.checksums = true;
        }
        if self.no_resume {
            config.resume = false;
        }
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got {s:?}")),
    }
}

//! Upload orchestrator: wires the file, the URL store and the session together.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tusk_client::{
    RunOutcome, UploadError, UploadEvent, UploadOptions, UploadSession, UrlStore, fingerprint,
};
use tusk_transfer::{ByteSource, FileSource, SpeedCalculator, percent};

use crate::cli::Cli;
use crate::config::Config;

/// Uploads (or discards) the file named on the command line.
pub async fn run(config: Config, cli: Cli) -> anyhow::Result<()> {
    let source = Arc::new(
        FileSource::open(&cli.file)
            .with_context(|| format!("cannot open {}", cli.file.display()))?,
    );
    let size = source.size().unwrap_or(0);
    let key = fingerprint(source.path(), size, source.modified(), &config.endpoint);

    let store = UrlStore::new(config.store_path()?)?;
    let options = build_options(&config, &source, authorization(&config.token_env));

    if cli.discard {
        return discard(&store, &key, source, options).await;
    }

    let options = match store.get(&key).filter(|_| config.resume) {
        Some(url) => {
            tracing::info!(upload_url = %url, "resuming earlier upload");
            options.with_upload_url(url)
        }
        None => options,
    };

    let mut session = UploadSession::with_http(source, options)?;
    let mut events = session
        .take_events()
        .context("upload events already taken")?;

    tracing::info!(file = %cli.file.display(), bytes = size, "upload starting");
    session.start()?;

    watch(&session, &mut events, &store, &key, size).await;

    match session.wait().await? {
        RunOutcome::Succeeded => Ok(()),
        RunOutcome::Paused => {
            tracing::info!(
                offset = session.offset(),
                "upload paused, run again to resume"
            );
            Ok(())
        }
        RunOutcome::Aborted => Ok(()),
        RunOutcome::Failed { error, attempts } => {
            anyhow::bail!("upload failed after {attempts} attempt(s): {error}")
        }
    }
}

/// Follows session events until the run ends. Ctrl-C pauses the upload.
async fn watch(
    session: &UploadSession,
    events: &mut mpsc::UnboundedReceiver<UploadEvent>,
    store: &UrlStore,
    key: &str,
    size: u64,
) {
    let mut speed = SpeedCalculator::default();

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, pausing upload");
                session.abort();
                continue;
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            UploadEvent::StateChanged(state) => {
                tracing::debug!(?state, "upload state changed");
            }
            UploadEvent::Created { upload_url } => {
                if let Err(e) = store.save(key, &upload_url) {
                    tracing::warn!(error = %e, "failed to remember upload URL");
                }
            }
            UploadEvent::Progress { bytes_sent, bytes_total } => {
                speed.record(bytes_sent);
                let total = bytes_total.unwrap_or(size);
                let eta = speed.eta(total.saturating_sub(bytes_sent));
                tracing::info!(
                    bytes_sent,
                    bytes_total = total,
                    percent = %format!("{:.2}", percent(bytes_sent, total)),
                    speed_kib = (speed.bytes_per_second() / 1024.0) as u64,
                    eta_secs = eta.map(|d| d.as_secs()),
                    "upload progress"
                );
            }
            UploadEvent::Retrying { attempt, delay, error } => {
                speed.reset();
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying upload"
                );
            }
            UploadEvent::Succeeded { upload_url } => {
                forget(store, key);
                tracing::info!(upload_url = %upload_url, "upload finished");
                break;
            }
            UploadEvent::Failed { error, .. } => {
                if matches!(error, UploadError::ResourceGone { .. }) {
                    forget(store, key);
                }
                break;
            }
            UploadEvent::Paused { .. } | UploadEvent::Aborted { .. } => break,
        }
    }
}

async fn discard(
    store: &UrlStore,
    key: &str,
    source: Arc<FileSource>,
    options: UploadOptions,
) -> anyhow::Result<()> {
    let Some(url) = store.get(key) else {
        tracing::info!("no recorded upload to discard");
        return Ok(());
    };

    let session = UploadSession::with_http(source, options.with_upload_url(url.clone()))?;
    session.discard().await?;
    forget(store, key);
    tracing::info!(upload_url = %url, "upload discarded");
    Ok(())
}

fn build_options(config: &Config, source: &FileSource, auth: Option<String>) -> UploadOptions {
    let mut options = config.upload_options();
    if !options.metadata.contains_key("filename")
        && let Some(name) = source.file_name()
    {
        options = options.with_metadata("filename", name);
    }
    if let Some(value) = auth {
        options = options.with_header("Authorization", value);
    }
    options
}

/// Bearer header value from the named environment variable.
fn authorization(token_env: &str) -> Option<String> {
    match std::env::var(token_env) {
        Ok(token) if !token.trim().is_empty() => {
            tracing::debug!(token_env, "using bearer token from environment");
            Some(format!("Bearer {}", token.trim()))
        }
        _ => None,
    }
}

fn forget(store: &UrlStore, key: &str) {
    if let Err(e) = store.remove(key) {
        tracing::warn!(error = %e, path = %store.path().display(), "failed to update upload store");
    }
}

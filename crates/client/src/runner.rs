//! The upload run loop: creation, offset queries, chunk sends and backoff.
//!
//! One [`Worker`] drives one run of a session. Every response is applied
//! under the status lock and only if the run has not been cancelled, so a
//! response that races `abort()` is discarded rather than applied.

use std::io;
use std::sync::{Arc, OnceLock};

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tusk_protocol::constants::{
    HEADER_CONTENT_TYPE, HEADER_UPLOAD_CHECKSUM, HEADER_UPLOAD_DEFER_LENGTH,
    HEADER_UPLOAD_LENGTH, HEADER_UPLOAD_METADATA, HEADER_UPLOAD_OFFSET, OFFSET_OCTET_STREAM,
};
use tusk_protocol::{Body, Method, Request, Response};
use tusk_transfer::{ByteSource, Chunk, Span, UploadChecksum, read_exact_at, upload_checksum};

use crate::error::{Phase, UploadError, classify};
use crate::session::{Shared, Status};
use crate::types::{RunOutcome, UploadEvent, UploadState};

/// Why a step did not complete.
enum Halt {
    Cancelled,
    Failed(UploadError),
}

impl From<UploadError> for Halt {
    fn from(e: UploadError) -> Self {
        Halt::Failed(e)
    }
}

/// What a successful step achieved.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Created,
    Queried,
    Sent,
    Done,
}

/// A chunk ready to be sent.
struct Payload {
    body: Body,
    end: u64,
    last: bool,
    checksum: Option<String>,
    /// Set when a streamed body could not read the source.
    source_error: Arc<OnceLock<UploadError>>,
}

pub(crate) struct Worker {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    generation: u64,
    need_query: bool,
}

impl Worker {
    pub(crate) fn new(
        shared: Arc<Shared>,
        cancel: CancellationToken,
        generation: u64,
        resuming: bool,
    ) -> Self {
        Self {
            shared,
            cancel,
            generation,
            need_query: resuming,
        }
    }

    /// Runs until success, failure, or cancellation and publishes the outcome.
    pub(crate) async fn run(mut self) {
        let wire = Arc::clone(&self.shared);
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => self.cancelled_outcome(),
            _guard = wire.wire.lock() => self.drive().await,
        };
        debug!(generation = self.generation, outcome = ?outcome, "upload run ended");
        self.shared.publish(self.generation, outcome);
    }

    async fn drive(&mut self) -> RunOutcome {
        let mut failures: u32 = 0;
        let mut conflicts: u32 = 0;

        loop {
            let result = self.step().await;
            let error = match result {
                Ok(Step::Done) => return RunOutcome::Succeeded,
                Ok(Step::Sent) => {
                    failures = 0;
                    conflicts = 0;
                    continue;
                }
                Ok(Step::Created | Step::Queried) => continue,
                Err(Halt::Cancelled) => return self.cancelled_outcome(),
                Err(Halt::Failed(error)) => error,
            };

            let attempts = failures + 1;
            if let UploadError::Conflict { offset } = error {
                conflicts += 1;
                if conflicts > self.shared.options.max_conflict_retries {
                    return self.fail(error, attempts);
                }
                debug!(offset, conflicts, "offset conflict, re-querying");
                self.need_query = true;
                continue;
            }

            if !error.is_retryable() {
                return self.fail(error, attempts);
            }
            let Some(delay) = self.shared.options.retry.delay_for(failures) else {
                return self.fail(error, attempts);
            };
            failures += 1;

            {
                let mut status = self.shared.lock();
                if self.cancel.is_cancelled() {
                    return self.cancelled_outcome_locked(&status);
                }
                self.shared.transition(&mut status, UploadState::Retrying);
                self.shared.emit(UploadEvent::Retrying {
                    attempt: attempts,
                    delay,
                    error: error.clone(),
                });
            }
            warn!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient upload failure, retrying"
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.cancelled_outcome(),
                _ = tokio::time::sleep(delay) => {}
            }

            let mut status = self.shared.lock();
            if self.cancel.is_cancelled() {
                return self.cancelled_outcome_locked(&status);
            }
            let next = if status.upload_url.is_some() {
                self.need_query = true;
                UploadState::Uploading
            } else {
                UploadState::Creating
            };
            self.shared.transition(&mut status, next);
        }
    }

    async fn step(&mut self) -> Result<Step, Halt> {
        let upload_url = self.shared.lock().upload_url.clone();
        match upload_url {
            None => self.create().await,
            Some(url) if self.need_query => {
                let step = self.query(&url).await?;
                self.need_query = false;
                Ok(step)
            }
            Some(url) => self.send_chunk(&url).await,
        }
    }

    async fn create(&mut self) -> Result<Step, Halt> {
        let Some(endpoint) = self.shared.endpoint.clone() else {
            let error = UploadError::Configuration("no endpoint to create the upload at".into());
            return Err(error.into());
        };
        let total = self.shared.lock().total;

        let mut req = self.shared.base_request(Method::Post, endpoint.as_str());
        req = match total {
            Some(len) => req.header(HEADER_UPLOAD_LENGTH, len.to_string()),
            None => req.header(HEADER_UPLOAD_DEFER_LENGTH, "1"),
        };
        if !self.shared.metadata_header.is_empty() {
            req = req.header(HEADER_UPLOAD_METADATA, self.shared.metadata_header.as_str());
        }

        let resp = self.request(req).await?;
        if !resp.is_success() {
            return Err(classify(Phase::Create, endpoint.as_str(), &resp).into());
        }
        let location = resp.location().ok_or_else(|| {
            UploadError::Protocol("creation response carries no Location header".into())
        })?;
        let upload_url = endpoint
            .join(location)
            .map_err(|e| UploadError::Protocol(format!("invalid Location {location:?}: {e}")))?
            .to_string();
        let offset = resp.upload_offset().map_err(UploadError::from)?.unwrap_or(0);

        let mut status = self.shared.lock();
        if self.cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        check_within_total(offset, status.total)?;
        status.upload_url = Some(upload_url.clone());
        status.offset = offset;
        self.shared.transition(&mut status, UploadState::Uploading);
        self.shared.emit(UploadEvent::Created {
            upload_url: upload_url.clone(),
        });
        info!(upload_url = %upload_url, offset, "upload created");
        self.shared.report_progress(&mut status);
        Ok(self.finish_if_complete(&mut status, Step::Created))
    }

    async fn query(&mut self, url: &str) -> Result<Step, Halt> {
        let req = self.shared.base_request(Method::Head, url);
        let resp = self.request(req).await?;
        if !resp.is_success() {
            return Err(classify(Phase::Query, url, &resp).into());
        }
        let offset = resp
            .upload_offset()
            .map_err(UploadError::from)?
            .ok_or_else(|| {
                UploadError::Protocol("offset query response carries no Upload-Offset".into())
            })?;
        let length = resp.upload_length().map_err(UploadError::from)?;

        let mut status = self.shared.lock();
        if self.cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        if offset < status.offset {
            return Err(UploadError::Protocol(format!(
                "server offset {offset} is behind the confirmed offset {}",
                status.offset
            ))
            .into());
        }
        match (status.total, length) {
            (Some(total), Some(len)) if total != len => {
                return Err(UploadError::Protocol(format!(
                    "server upload length {len} differs from source length {total}"
                ))
                .into());
            }
            (None, Some(len)) => status.total = Some(len),
            _ => {}
        }
        check_within_total(offset, status.total)?;

        debug!(upload_url = %url, offset, "offset confirmed by server");
        status.offset = offset;
        self.shared.transition(&mut status, UploadState::Uploading);
        self.shared.report_progress(&mut status);
        Ok(self.finish_if_complete(&mut status, Step::Queried))
    }

    async fn send_chunk(&mut self, url: &str) -> Result<Step, Halt> {
        let offset = self.shared.lock().offset;
        let payload = self.prepare(offset).await?;
        let deferred_last = self.shared.lock().total.is_none() && payload.last;
        let expected = payload.end;
        let size = payload.body.len();

        let mut req = self
            .shared
            .base_request(Method::Patch, url)
            .header(HEADER_UPLOAD_OFFSET, offset.to_string())
            .header(HEADER_CONTENT_TYPE, OFFSET_OCTET_STREAM);
        if let Some(checksum) = payload.checksum {
            req = req.header(HEADER_UPLOAD_CHECKSUM, checksum);
        }
        if deferred_last {
            req = req.header(HEADER_UPLOAD_LENGTH, expected.to_string());
        }
        let req = req.body(payload.body);

        let result = self.request(req).await;
        if result.is_err()
            && !self.cancel.is_cancelled()
            && let Some(error) = payload.source_error.get()
        {
            return Err(error.clone().into());
        }
        let resp = result?;
        if !resp.is_success() {
            return Err(classify(Phase::Chunk { offset }, url, &resp).into());
        }
        let acked = resp
            .upload_offset()
            .map_err(UploadError::from)?
            .ok_or_else(|| {
                UploadError::Protocol("chunk response carries no Upload-Offset".into())
            })?;
        if acked != expected {
            return Err(UploadError::Protocol(format!(
                "server acknowledged offset {acked} after sending [{offset}, {expected})"
            ))
            .into());
        }

        let mut status = self.shared.lock();
        if self.cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        status.offset = acked;
        if deferred_last {
            status.total = Some(acked);
        }
        debug!(offset = acked, bytes = size, total = ?status.total, "chunk acknowledged");
        self.shared.report_progress(&mut status);
        Ok(self.finish_if_complete(&mut status, Step::Sent))
    }

    /// Reads the chunk at `offset`, or sets it up to be streamed when it
    /// is too long to hold in memory.
    async fn prepare(&self, offset: u64) -> Result<Payload, Halt> {
        let source_error = Arc::new(OnceLock::new());
        let span = self
            .shared
            .reader
            .streamed_span(self.shared.source.as_ref(), offset)
            .map_err(UploadError::from)?;

        let Some(span) = span else {
            let chunk = self.read_chunk(offset).await?;
            let checksum = self
                .shared
                .options
                .checksums
                .then(|| upload_checksum(&chunk.data));
            return Ok(Payload {
                end: chunk.end(),
                last: chunk.last,
                checksum,
                body: Body::Bytes(chunk.data),
                source_error,
            });
        };

        let checksum = if self.shared.options.checksums {
            Some(self.checksum_span(span).await?)
        } else {
            None
        };
        debug!(offset, bytes = span.len, "streaming chunk from source");
        let body = stream_span(
            Arc::clone(&self.shared.source),
            span,
            Arc::clone(&source_error),
        );
        Ok(Payload {
            body,
            end: span.end(),
            last: span.last(),
            checksum,
            source_error,
        })
    }

    /// Hashes a streamed chunk ahead of sending it.
    async fn checksum_span(&self, span: Span) -> Result<String, Halt> {
        let source = Arc::clone(&self.shared.source);
        let hash = tokio::task::spawn_blocking(move || {
            let mut checksum = UploadChecksum::default();
            for (at, len) in span.pieces() {
                checksum.update(&read_exact_at(source.as_ref(), at, len, span.total)?);
            }
            Ok::<_, tusk_transfer::TransferError>(checksum.header_value())
        });
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Halt::Cancelled),
            hash = hash => match hash {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(UploadError::from(e).into()),
                Err(e) => Err(UploadError::Source(format!("checksum task failed: {e}")).into()),
            },
        }
    }

    /// Reads the next chunk off the runtime threads.
    async fn read_chunk(&self, offset: u64) -> Result<Chunk, Halt> {
        let source = Arc::clone(&self.shared.source);
        let reader = self.shared.reader;
        let read = tokio::task::spawn_blocking(move || reader.read_chunk(source.as_ref(), offset));
        match read.await {
            Ok(Ok(chunk)) => Ok(chunk),
            Ok(Err(e)) => Err(UploadError::from(e).into()),
            Err(e) => Err(UploadError::Source(format!("chunk read task failed: {e}")).into()),
        }
    }

    /// Executes a request unless the run is cancelled first.
    async fn request(&self, req: Request) -> Result<Response, Halt> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Halt::Cancelled),
            result = self.shared.transport.execute(req) => {
                result.map_err(|e| Halt::Failed(e.into()))
            }
        }
    }

    /// Moves to `Succeeded` when every byte is confirmed.
    fn finish_if_complete(&self, status: &mut Status, step: Step) -> Step {
        if status.total != Some(status.offset) {
            return step;
        }
        let upload_url = status.upload_url.clone().unwrap_or_default();
        self.shared.transition(status, UploadState::Succeeded);
        self.shared.emit(UploadEvent::Succeeded {
            upload_url: upload_url.clone(),
        });
        info!(upload_url = %upload_url, bytes = status.offset, "upload complete");
        Step::Done
    }

    fn fail(&self, error: UploadError, attempts: u32) -> RunOutcome {
        let mut status = self.shared.lock();
        if self.cancel.is_cancelled() {
            return self.cancelled_outcome_locked(&status);
        }
        self.shared.transition(&mut status, UploadState::Failed);
        self.shared.emit(UploadEvent::Failed {
            error: error.clone(),
            attempts,
            offset: status.offset,
        });
        warn!(attempts, offset = status.offset, error = %error, "upload failed");
        RunOutcome::Failed { error, attempts }
    }

    fn cancelled_outcome(&self) -> RunOutcome {
        let status = self.shared.lock();
        self.cancelled_outcome_locked(&status)
    }

    fn cancelled_outcome_locked(&self, status: &Status) -> RunOutcome {
        if status.state == UploadState::Aborted {
            RunOutcome::Aborted
        } else {
            RunOutcome::Paused
        }
    }
}

/// A body that reads `span` from the source one piece at a time.
fn stream_span(
    source: Arc<dyn ByteSource>,
    span: Span,
    source_error: Arc<OnceLock<UploadError>>,
) -> Body {
    let pieces = futures_util::stream::iter(span.pieces()).then(move |(at, len)| {
        let source = Arc::clone(&source);
        let source_error = Arc::clone(&source_error);
        async move {
            let read =
                tokio::task::spawn_blocking(move || read_exact_at(source.as_ref(), at, len, span.total));
            let error = match read.await {
                Ok(Ok(data)) => return Ok(data),
                Ok(Err(e)) => UploadError::from(e),
                Err(e) => UploadError::Source(format!("chunk read task failed: {e}")),
            };
            let message = error.to_string();
            let _ = source_error.set(error);
            Err(io::Error::other(message))
        }
    });
    Body::stream(span.len, pieces.boxed())
}

fn check_within_total(offset: u64, total: Option<u64>) -> Result<(), UploadError> {
    match total {
        Some(total) if offset > total => Err(UploadError::Protocol(format!(
            "server offset {offset} is beyond the upload length {total}"
        ))),
        _ => Ok(()),
    }
}

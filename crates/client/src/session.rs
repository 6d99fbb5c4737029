//! The caller-facing upload session handle.
//!
//! An [`UploadSession`] owns the upload's state machine. `start()` and
//! `abort()` return immediately; the work happens on a tokio task and is
//! reported through [`UploadEvent`]s. Runs are serialized: a new run waits
//! for the previous one to let go of the wire before sending anything.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tusk_protocol::constants::{HEADER_TUS_RESUMABLE, TUS_VERSION};
use tusk_protocol::{Method, Request, encode_metadata};
use tusk_transfer::{ByteSource, ChunkReader};

use crate::error::{Phase, UploadError, classify};
use crate::runner::Worker;
use crate::transport::{HttpTransport, Transport};
use crate::types::{ChunkSize, RunOutcome, UploadEvent, UploadOptions, UploadState};

/// Mutable progress of a session. Only changed under the status lock.
#[derive(Debug)]
pub(crate) struct Status {
    pub(crate) state: UploadState,
    pub(crate) offset: u64,
    pub(crate) upload_url: Option<String>,
    pub(crate) total: Option<u64>,
    /// Highest offset already reported in a `Progress` event.
    pub(crate) reported: u64,
}

/// State shared between the handle and its worker tasks.
pub(crate) struct Shared {
    pub(crate) source: Arc<dyn ByteSource>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) options: UploadOptions,
    pub(crate) reader: ChunkReader,
    pub(crate) endpoint: Option<reqwest::Url>,
    pub(crate) metadata_header: String,
    status: Mutex<Status>,
    events: mpsc::UnboundedSender<UploadEvent>,
    outcome: watch::Sender<Option<(u64, RunOutcome)>>,
    /// Held by whichever run is talking to the server.
    pub(crate) wire: tokio::sync::Mutex<()>,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn emit(&self, event: UploadEvent) {
        // A dropped receiver just means nobody is listening.
        let _ = self.events.send(event);
    }

    pub(crate) fn transition(&self, status: &mut Status, to: UploadState) {
        if status.state != to {
            debug!(from = ?status.state, to = ?to, "upload state changed");
            status.state = to;
            self.emit(UploadEvent::StateChanged(to));
        }
    }

    /// Emits `Progress` if the confirmed offset moved past the last report.
    pub(crate) fn report_progress(&self, status: &mut Status) {
        if status.offset > status.reported {
            status.reported = status.offset;
            self.emit(UploadEvent::Progress {
                bytes_sent: status.offset,
                bytes_total: status.total,
            });
        }
    }

    /// Records a run's outcome. An older run never overwrites a newer one.
    pub(crate) fn publish(&self, generation: u64, outcome: RunOutcome) {
        self.outcome.send_if_modified(|current| {
            if matches!(current, Some((g, _)) if *g > generation) {
                return false;
            }
            *current = Some((generation, outcome));
            true
        });
    }

    /// Headers every request carries: caller headers plus `Tus-Resumable`.
    pub(crate) fn base_request(&self, method: Method, url: &str) -> Request {
        let mut req = Request::new(method, url);
        for (name, value) in &self.options.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        req.header(HEADER_TUS_RESUMABLE, TUS_VERSION)
    }
}

#[derive(Default)]
struct RunSlot {
    generation: u64,
    cancel: Option<CancellationToken>,
}

/// A single resumable upload.
pub struct UploadSession {
    shared: Arc<Shared>,
    slot: Mutex<RunSlot>,
    events_rx: Option<mpsc::UnboundedReceiver<UploadEvent>>,
}

impl UploadSession {
    /// Creates an idle session.
    ///
    /// Fails with [`UploadError::Configuration`] when the endpoint (or the
    /// seeded upload URL) is not a valid absolute URL, or a metadata key
    /// cannot be encoded.
    pub fn new(
        source: Arc<dyn ByteSource>,
        transport: Arc<dyn Transport>,
        options: UploadOptions,
    ) -> Result<Self, UploadError> {
        let endpoint = if options.endpoint.is_empty() {
            None
        } else {
            Some(reqwest::Url::parse(&options.endpoint).map_err(|e| {
                UploadError::Configuration(format!("invalid endpoint {:?}: {e}", options.endpoint))
            })?)
        };

        match (&endpoint, &options.upload_url) {
            (None, None) => {
                return Err(UploadError::Configuration(
                    "an endpoint or an upload URL is required".into(),
                ));
            }
            (_, Some(url)) => {
                reqwest::Url::parse(url).map_err(|e| {
                    UploadError::Configuration(format!("invalid upload URL {url:?}: {e}"))
                })?;
            }
            _ => {}
        }

        let metadata_header = encode_metadata(&options.metadata)?;
        let reader = ChunkReader::new(options.chunk_size.as_option());
        let total = source.size();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outcome_tx, _) = watch::channel(None);

        Ok(Self {
            shared: Arc::new(Shared {
                status: Mutex::new(Status {
                    state: UploadState::Idle,
                    offset: 0,
                    upload_url: options.upload_url.clone(),
                    total,
                    reported: 0,
                }),
                source,
                transport,
                reader,
                endpoint,
                metadata_header,
                options,
                events: events_tx,
                outcome: outcome_tx,
                wire: tokio::sync::Mutex::new(()),
            }),
            slot: Mutex::new(RunSlot::default()),
            events_rx: Some(events_rx),
        })
    }

    /// Creates a session that talks HTTP through `reqwest`.
    pub fn with_http(
        source: Arc<dyn ByteSource>,
        options: UploadOptions,
    ) -> Result<Self, UploadError> {
        let transport = HttpTransport::new(options.request_timeout)?;
        Self::new(source, Arc::new(transport), options)
    }

    /// Takes the event receiver. Returns `None` if already taken.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<UploadEvent>> {
        self.events_rx.take()
    }

    /// Begins or resumes the upload.
    ///
    /// Without an upload URL the server is asked to create one; with one,
    /// the server's offset is queried first and sending continues from it.
    /// Calling `start()` on a running session does nothing. Must be called
    /// from within a tokio runtime.
    pub fn start(&self) -> Result<(), UploadError> {
        let mut slot = self.lock_slot();
        let mut status = self.shared.lock();

        if status.state.is_final() {
            return Err(UploadError::InvalidState(format!(
                "upload is {:?}",
                status.state
            )));
        }
        if status.state.is_active() {
            debug!("start() ignored: upload already running");
            return Ok(());
        }
        if status.total.is_none() {
            if !self.shared.options.allow_deferred_length {
                return Err(UploadError::Configuration(
                    "source length is unknown and deferred length is disabled".into(),
                ));
            }
            if self.shared.options.chunk_size == ChunkSize::Unbounded {
                return Err(UploadError::Configuration(
                    "source length is unknown; a bounded chunk size is required".into(),
                ));
            }
        }

        let cancel = CancellationToken::new();
        slot.generation += 1;
        slot.cancel = Some(cancel.clone());

        let resuming = status.upload_url.is_some();
        let next = if resuming {
            UploadState::Uploading
        } else {
            UploadState::Creating
        };
        self.shared.transition(&mut status, next);
        info!(
            resuming,
            offset = status.offset,
            total = ?status.total,
            "upload started"
        );

        let worker = Worker::new(Arc::clone(&self.shared), cancel, slot.generation, resuming);
        tokio::spawn(worker.run());
        Ok(())
    }

    /// Alias of [`start`](Self::start) for a paused session.
    pub fn resume(&self) -> Result<(), UploadError> {
        self.start()
    }

    /// Pauses the upload.
    ///
    /// Cancels the in-flight request or pending retry. The cancelled request
    /// is not a failure and nothing is retried. Idempotent.
    pub fn abort(&self) {
        let slot = self.lock_slot();
        let mut status = self.shared.lock();
        if !status.state.is_active() {
            return;
        }
        if let Some(cancel) = &slot.cancel {
            cancel.cancel();
        }
        self.shared.transition(&mut status, UploadState::Paused);
        self.shared.emit(UploadEvent::Paused {
            offset: status.offset,
        });
        info!(offset = status.offset, "upload paused");
    }

    /// Stops the upload for good.
    ///
    /// Like [`abort`](Self::abort) but the session moves to `Aborted` and
    /// cannot be started again. With `terminate_on_discard` the server is
    /// asked to delete the upload once any in-flight request has ended.
    pub async fn discard(&self) -> Result<(), UploadError> {
        let upload_url = {
            let slot = self.lock_slot();
            let mut status = self.shared.lock();
            match status.state {
                UploadState::Aborted => return Ok(()),
                UploadState::Succeeded => {
                    return Err(UploadError::InvalidState(
                        "upload already succeeded".into(),
                    ));
                }
                _ => {}
            }
            if let Some(cancel) = &slot.cancel {
                cancel.cancel();
            }
            self.shared.transition(&mut status, UploadState::Aborted);
            self.shared.emit(UploadEvent::Aborted {
                offset: status.offset,
            });
            info!(offset = status.offset, "upload discarded");
            status.upload_url.clone()
        };

        if !self.shared.options.terminate_on_discard {
            return Ok(());
        }
        let Some(url) = upload_url else {
            return Ok(());
        };

        let _wire = self.shared.wire.lock().await;
        let req = self.shared.base_request(Method::Delete, &url);
        let resp = self.shared.transport.execute(req).await?;
        if resp.is_success() || matches!(resp.status, 404 | 410) {
            debug!(upload_url = %url, "upload terminated");
            Ok(())
        } else {
            Err(classify(Phase::Terminate, &url, &resp))
        }
    }

    /// Waits for the most recently started run to end.
    pub async fn wait(&self) -> Result<RunOutcome, UploadError> {
        let generation = self.lock_slot().generation;
        if generation == 0 {
            return Err(UploadError::InvalidState("upload was never started".into()));
        }
        let mut rx = self.shared.outcome.subscribe();
        let published = (*rx
            .wait_for(|v| matches!(v, Some((g, _)) if *g >= generation))
            .await
            .map_err(|_| UploadError::InvalidState("session closed".into()))?)
        .clone();
        published
            .map(|(_, outcome)| outcome)
            .ok_or_else(|| UploadError::InvalidState("no outcome published".into()))
    }

    pub fn state(&self) -> UploadState {
        self.shared.lock().state
    }

    /// Last server-confirmed offset.
    pub fn offset(&self) -> u64 {
        self.shared.lock().offset
    }

    pub fn upload_url(&self) -> Option<String> {
        self.shared.lock().upload_url.clone()
    }

    /// Total length, once known.
    pub fn total_length(&self) -> Option<u64> {
        self.shared.lock().total
    }

    fn lock_slot(&self) -> MutexGuard<'_, RunSlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for UploadSession {
    fn drop(&mut self) {
        if let Some(cancel) = &self.lock_slot().cancel {
            cancel.cancel();
        }
    }
}

//! Multi-worker byte-range transfer of one quality tier.
//!
//! The resource is split into contiguous ranges (see [`plan`]), each range is
//! fetched by a worker straight into its offset of a pre-allocated
//! `<destination>.part` file, and the part file is renamed onto the
//! destination once every range is written.
//!
//! When the session expires (heartbeat tolerance exceeded, or the CDN refuses
//! a chunk) dispatch pauses, in-flight chunks drain, the session is renewed
//! through [`SessionRecovery`] and the remaining ranges resume against the new
//! session. Completed ranges are never fetched again.

pub mod plan;
mod source;
mod state;
mod worker;

pub use plan::ByteRange;
pub use source::{ByteStream, HttpRangeSource, RangeSource};
pub use state::{ChunkResult, DownloadTask, TaskStatus, TransferState};

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::DownloadError;
use crate::events::{EventSink, TransferEvent};
use crate::retry::{RetryAction, retry_with_backoff};
use crate::session::{QualityTier, SessionLease};
use worker::{WorkerContext, run_chunk};

/// Renews the session of a running transfer.
#[async_trait]
pub trait SessionRecovery: Send + Sync {
    /// Replace the expired session on the lease and return `tier` as offered
    /// by the new manifest. Must fail if the tier is gone or unavailable.
    async fn recover(&self, tier: &QualityTier) -> Result<QualityTier, DownloadError>;
}

/// `<destination>.<suffix>`
pub fn part_path(destination: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(destination.as_os_str());
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

pub struct ChunkedDownloader {
    source: Arc<dyn RangeSource>,
    config: EngineConfig,
    events: EventSink,
}

impl ChunkedDownloader {
    pub fn new(source: Arc<dyn RangeSource>, config: EngineConfig, events: EventSink) -> Self {
        Self {
            source,
            config,
            events,
        }
    }

    /// Fetch `tier` into `destination` with up to `worker_count` concurrent
    /// range requests. On failure the part file is removed and nothing is
    /// left at `destination`.
    pub async fn fetch(
        &self,
        lease: &Arc<SessionLease>,
        tier: &QualityTier,
        destination: &Path,
        worker_count: usize,
        recovery: &dyn SessionRecovery,
        token: &CancellationToken,
    ) -> Result<TransferState, DownloadError> {
        let part = part_path(destination, &self.config.part_suffix);
        let mut run = Run {
            lease,
            recovery,
            token,
            tier: tier.clone(),
            renegotiations: 0,
            window: self.config.renegotiation_window,
        };

        let result = self
            .fetch_into(&mut run, &part, worker_count.max(1))
            .await;

        match result {
            Ok(state) => {
                tokio::fs::rename(&part, destination).await?;
                info!(
                    kind = %tier.kind,
                    tier = %tier.id,
                    path = %destination.display(),
                    bytes = state.total_bytes(),
                    retries = state.retries(),
                    renegotiations = state.renegotiations(),
                    "Tier transfer complete"
                );
                self.events.emit(TransferEvent::TierCompleted {
                    kind: tier.kind,
                    path: destination.to_path_buf(),
                    bytes: state.total_bytes(),
                });
                Ok(state)
            }
            Err(err) => {
                if let Err(e) = tokio::fs::remove_file(&part).await
                    && e.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(path = %part.display(), error = %e, "Failed to remove partial file");
                }
                Err(err)
            }
        }
    }

    async fn fetch_into(
        &self,
        run: &mut Run<'_>,
        part: &Path,
        worker_count: usize,
    ) -> Result<TransferState, DownloadError> {
        let total = self.probe_length(run).await?;
        let ranges = plan::partition(total, worker_count, self.config.min_chunk_size);
        let workers = worker_count.min(ranges.len());

        if let Some(parent) = part.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::try_exists(part).await.unwrap_or(false) {
            warn!(path = %part.display(), "Overwriting stale partial file");
        }
        let file = tokio::fs::File::create(part).await?;
        file.set_len(total).await?;
        drop(file);

        info!(
            kind = %run.tier.kind,
            tier = %run.tier.id,
            total_bytes = total,
            chunks = ranges.len(),
            workers,
            "Starting chunked transfer"
        );
        self.events.emit(TransferEvent::TransferStarted {
            kind: run.tier.kind,
            total_bytes: total,
            chunks: ranges.len(),
        });

        let mut state = TransferState::new(total, ranges.len());
        let mut pending: VecDeque<DownloadTask> = ranges
            .into_iter()
            .enumerate()
            .map(|(index, range)| {
                DownloadTask::new(index, run.tier.url.clone(), range, part.to_path_buf())
            })
            .collect();

        // Workers stop on external cancellation or when the transfer aborts.
        let worker_token = run.token.child_token();
        let ctx = Arc::new(WorkerContext {
            source: Arc::clone(&self.source),
            lease: Arc::clone(run.lease),
            retry: self.config.chunk_retry.clone(),
            token: worker_token.clone(),
            events: self.events.clone(),
            kind: run.tier.kind,
        });

        let mut in_flight = FuturesUnordered::new();
        let mut expired_rx = run.lease.subscribe();
        let mut paused = false;
        let mut fatal: Option<DownloadError> = None;

        loop {
            if !paused && fatal.is_none() {
                while in_flight.len() < workers {
                    let Some(task) = pending.pop_front() else { break };
                    state.mark_in_flight(task.index);
                    in_flight.push(run_chunk(Arc::clone(&ctx), task));
                }
            }

            if in_flight.is_empty() {
                if let Some(err) = fatal {
                    return Err(err);
                }
                if run.token.is_cancelled() {
                    return Err(DownloadError::Cancelled);
                }
                if paused {
                    self.renegotiate(run).await?;
                    for task in pending.iter_mut() {
                        task.url = run.tier.url.clone();
                    }
                    paused = false;
                    continue;
                }
                if pending.is_empty() {
                    break;
                }
                continue;
            }

            tokio::select! {
                biased;

                _ = run.token.cancelled(), if fatal.is_none() => {
                    info!(kind = %run.tier.kind, "Transfer cancelled, draining in-flight chunks");
                    fatal = Some(DownloadError::Cancelled);
                    worker_token.cancel();
                }

                changed = expired_rx.changed(), if !paused && fatal.is_none() => {
                    if changed.is_ok() && *expired_rx.borrow_and_update() {
                        self.pause(run, &mut paused);
                    }
                }

                Some(result) = in_flight.next() => {
                    if let Err(err) = self.on_result(run, &mut state, &mut pending, &mut paused, result) {
                        if fatal.is_none() {
                            warn!(kind = %run.tier.kind, error = %err, "Aborting transfer");
                            fatal = Some(err);
                        }
                        worker_token.cancel();
                    }
                }
            }
        }

        if !state.is_complete() {
            return Err(DownloadError::Internal {
                reason: "dispatcher finished with incomplete chunks".to_string(),
            });
        }
        state.set_renegotiations(run.renegotiations);
        Ok(state)
    }

    fn pause(&self, run: &Run<'_>, paused: &mut bool) {
        if *paused {
            return;
        }
        *paused = true;
        let session_id = run.lease.current().id.clone();
        info!(session_id = %session_id, "Session expired, pausing dispatch");
        self.events.emit(TransferEvent::SessionExpired { session_id });
    }

    /// Fold a finished chunk into the transfer. `Err` aborts the transfer.
    fn on_result(
        &self,
        run: &Run<'_>,
        state: &mut TransferState,
        pending: &mut VecDeque<DownloadTask>,
        paused: &mut bool,
        result: ChunkResult,
    ) -> Result<(), DownloadError> {
        match &result.outcome {
            Ok(_) => {
                state.record(&result);
                debug!(
                    chunk = result.task.index,
                    range = %result.task.range,
                    retries = result.retries,
                    "Chunk complete"
                );
                self.events.emit(TransferEvent::Progress {
                    kind: run.tier.kind,
                    bytes_completed: state.bytes_completed(),
                    total_bytes: state.total_bytes(),
                    chunks_completed: state.chunks_completed(),
                    chunks_total: state.chunks_total(),
                });
                Ok(())
            }
            Err(DownloadError::SessionExpired { .. }) => {
                // A result from an already replaced session just goes back in
                // the queue; anything else means the current session is dead.
                let stale = result.generation < run.lease.generation();
                if !stale {
                    run.lease.mark_expired();
                    self.pause(run, paused);
                }
                let task = result.task;
                debug!(chunk = task.index, written = task.written, stale, "Requeueing chunk");
                state.mark_pending(task.index);
                pending.push_front(task);
                Ok(())
            }
            Err(_) => {
                state.record(&result);
                result.outcome.map(|_| ())
            }
        }
    }

    /// Swap in a fresh session. A second expiry shortly after a renewal is
    /// treated as fatal instead of looping, even if that renewal happened
    /// while an earlier tier of the resource was transferring.
    async fn renegotiate(&self, run: &mut Run<'_>) -> Result<(), DownloadError> {
        if let Some(at) = run.lease.renewed_at()
            && at.elapsed() < run.window
        {
            return Err(DownloadError::session_expired(format!(
                "expired again {:?} after renegotiation",
                at.elapsed()
            )));
        }

        let fresh = tokio::select! {
            biased;
            _ = run.token.cancelled() => return Err(DownloadError::Cancelled),
            fresh = run.recovery.recover(&run.tier) => fresh?,
        };

        run.tier = fresh;
        run.renegotiations += 1;

        let session = run.lease.current();
        info!(
            session_id = %session.id,
            generation = run.lease.generation(),
            "Resuming transfer on renewed session"
        );
        self.events.emit(TransferEvent::SessionRenewed {
            session_id: session.id.clone(),
            generation: run.lease.generation(),
        });
        Ok(())
    }

    /// Resource length, retrying transient failures and renewing the session
    /// if the CDN refuses the probe.
    async fn probe_length(&self, run: &mut Run<'_>) -> Result<u64, DownloadError> {
        loop {
            let session = run.lease.current();
            let url = run.tier.url.clone();
            let source = Arc::clone(&self.source);
            let probe = retry_with_backoff(&self.config.chunk_retry, run.token, |_| {
                let (source, session, url) = (Arc::clone(&source), Arc::clone(&session), url.clone());
                async move { RetryAction::from(source.content_length(&session, &url).await) }
            })
            .await;

            match probe {
                Err(err) if err.is_session_rejection() => {
                    debug!(error = %err, "Length probe rejected, renewing session");
                    self.renegotiate(run).await?;
                }
                other => return other,
            }
        }
    }
}

/// Per-call transfer context.
struct Run<'a> {
    lease: &'a Arc<SessionLease>,
    recovery: &'a dyn SessionRecovery,
    token: &'a CancellationToken,
    /// Current descriptor of the tier; its URL changes on renegotiation
    tier: QualityTier,
    renegotiations: u32,
    window: std::time::Duration,
}

use std::io::SeekFrom;
use std::sync::Arc;

use futures::StreamExt;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::source::RangeSource;
use super::state::{ChunkResult, DownloadTask};
use crate::error::DownloadError;
use crate::events::{EventSink, TransferEvent};
use crate::retry::RetryPolicy;
use crate::session::{MediaKind, Session, SessionLease};

/// Everything a chunk worker needs, shared by all workers of one tier.
pub(crate) struct WorkerContext {
    pub source: Arc<dyn RangeSource>,
    pub lease: Arc<SessionLease>,
    pub retry: RetryPolicy,
    pub token: CancellationToken,
    pub events: EventSink,
    pub kind: MediaKind,
}

/// Run one task until it completes, exhausts its retries, or is refused by
/// the platform. Session rejections are reported as `SessionExpired` so the
/// dispatcher can renegotiate; they never consume retries. A task refused
/// again on a renewed session is fatal.
pub(crate) async fn run_chunk(ctx: Arc<WorkerContext>, mut task: DownloadTask) -> ChunkResult {
    let mut retries = 0;
    loop {
        let generation = ctx.lease.generation();
        let finish = |task, outcome| ChunkResult {
            task,
            outcome,
            retries,
            generation,
        };

        if ctx.token.is_cancelled() {
            return finish(task, Err(DownloadError::Cancelled));
        }
        if ctx.lease.is_expired() {
            return finish(
                task,
                Err(DownloadError::session_expired("session expired before the request")),
            );
        }

        let session = ctx.lease.current();
        task.attempts += 1;
        let err = match fetch_range(&ctx, &session, &mut task).await {
            Ok(()) => {
                let bytes = task.range.len();
                return finish(task, Ok(bytes));
            }
            Err(err) => err,
        };

        if matches!(err, DownloadError::Cancelled) {
            return finish(task, Err(err));
        }
        if err.is_session_rejection() {
            debug!(chunk = task.index, generation, error = %err, "Chunk request rejected by the platform");
            let again = task.rejected_in.is_some_and(|earlier| earlier < generation);
            task.rejected_in = Some(generation);
            let index = task.index;
            if again {
                let reason = format!("still rejected after renegotiation: {err}");
                return finish(task, Err(DownloadError::chunk_fatal(index, reason)));
            }
            let reason = format!("chunk {index} rejected: {err}");
            return finish(task, Err(DownloadError::session_expired(reason)));
        }
        if !err.is_retryable() {
            let err = match err {
                DownloadError::ChunkFatal { .. } => err,
                other => DownloadError::chunk_fatal(task.index, other.to_string()),
            };
            return finish(task, Err(err));
        }
        if retries >= ctx.retry.max_retries {
            let reason = format!("gave up after {retries} retries: {err}");
            let index = task.index;
            return finish(task, Err(DownloadError::chunk_fatal(index, reason)));
        }

        warn!(
            chunk = task.index,
            attempt = retries + 1,
            max = ctx.retry.max_retries,
            written = task.written,
            delay_ms = ctx.retry.backoff(retries).as_millis() as u64,
            error = %err,
            "Retrying chunk after transient error"
        );
        ctx.events.emit(TransferEvent::ChunkRetry {
            kind: ctx.kind,
            index: task.index,
            attempt: retries + 1,
            reason: err.to_string(),
        });
        if let Err(cancelled) = ctx.retry.wait(retries, &ctx.token).await {
            return finish(task, Err(cancelled));
        }
        retries += 1;
    }
}

/// Stream the task's remaining range into its slot of the destination.
/// `task.written` only advances past bytes that were written and flushed.
async fn fetch_range(
    ctx: &WorkerContext,
    session: &Session,
    task: &mut DownloadTask,
) -> Result<(), DownloadError> {
    let remaining = task.remaining();
    if remaining.is_empty() {
        return Ok(());
    }

    let mut stream = tokio::select! {
        biased;
        _ = ctx.token.cancelled() => return Err(DownloadError::Cancelled),
        opened = ctx.source.open(session, &task.url, remaining, task.index) => opened?,
    };

    let mut file = OpenOptions::new().write(true).open(&task.destination).await?;
    file.seek(SeekFrom::Start(remaining.start)).await?;

    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.token.cancelled() => return Err(DownloadError::Cancelled),
            next = stream.next() => next,
        };
        let Some(frame) = next else { break };
        let bytes = frame?;

        let room = task.range.len() - task.written;
        if bytes.len() as u64 > room {
            return Err(DownloadError::chunk_fatal(
                task.index,
                format!("server sent more than the {} bytes requested", remaining.len()),
            ));
        }
        file.write_all(&bytes).await?;
        file.flush().await?;
        task.written += bytes.len() as u64;
    }

    if !task.is_complete() {
        return Err(DownloadError::chunk_transient(
            task.index,
            format!(
                "body ended after {} of {} bytes",
                task.written,
                task.range.len()
            ),
        ));
    }
    Ok(())
}

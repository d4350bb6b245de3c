use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::session::MediaKind;

/// Incremental transfer events for UI reporting.
///
/// Byte counts only ever grow for a given tier: `Progress` is emitted when a
/// chunk has been completely written, never for partial chunk bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// A delivery session was negotiated (or renegotiated) for the resource
    SessionNegotiated {
        resource_id: String,
        session_id: String,
        tiers: usize,
    },
    TierSelected {
        kind: MediaKind,
        tier_id: String,
        descriptor: String,
    },
    /// Byte ranges are planned and the destination is pre-allocated
    TransferStarted {
        kind: MediaKind,
        total_bytes: u64,
        chunks: usize,
    },
    Progress {
        kind: MediaKind,
        bytes_completed: u64,
        total_bytes: u64,
        chunks_completed: usize,
        chunks_total: usize,
    },
    /// A chunk hit a transient error and will be retried
    ChunkRetry {
        kind: MediaKind,
        index: usize,
        attempt: u32,
        reason: String,
    },
    /// Dispatch paused because the session expired
    SessionExpired { session_id: String },
    SessionRenewed { session_id: String, generation: u64 },
    TierCompleted {
        kind: MediaKind,
        path: PathBuf,
        bytes: u64,
    },
}

/// Sending half of an event channel. Dropped receivers are ignored: events are
/// advisory and must never fail a transfer.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<TransferEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<TransferEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Create a sink together with the receiver it feeds.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: TransferEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitting_after_receiver_dropped_is_harmless() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(TransferEvent::SessionExpired {
            session_id: "s1".into(),
        });
        EventSink::disabled().emit(TransferEvent::SessionExpired {
            session_id: "s1".into(),
        });
    }

    #[tokio::test]
    async fn events_arrive_in_order() {
        let (sink, mut rx) = EventSink::channel();
        for bytes_completed in [10, 20] {
            sink.emit(TransferEvent::Progress {
                kind: MediaKind::Video,
                bytes_completed,
                total_bytes: 20,
                chunks_completed: (bytes_completed / 10) as usize,
                chunks_total: 2,
            });
        }
        drop(sink);

        let mut seen = Vec::new();
        while let Some(TransferEvent::Progress { bytes_completed, .. }) = rx.recv().await {
            seen.push(bytes_completed);
        }
        assert_eq!(seen, [10, 20]);
    }
}

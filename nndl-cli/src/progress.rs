//! Renders engine events as per-tier progress bars.
//!
//! Each tier gets its own tracing span; `tracing-indicatif` draws a bar for
//! it while the span is open. Without the indicatif layer installed the
//! `pb_*` calls are no-ops and only the log lines remain.

use std::collections::HashMap;

use indicatif::{HumanBytes, ProgressStyle};
use nndl_engine::{MediaKind, TransferEvent};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{Span, debug, info, info_span, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

fn bar_style() -> Option<ProgressStyle> {
    ProgressStyle::default_bar()
        .template(
            "{span_child_prefix}{spinner:.yellow} [{bar:20.yellow/white}] {bytes}/{total_bytes} {msg}",
        )
        .ok()
        .map(|style| style.progress_chars("=> "))
}

struct TierBar {
    span: Span,
    label: String,
}

/// Consume the events of one resource until its coordinator is dropped.
pub async fn report(resource_id: String, mut events: UnboundedReceiver<TransferEvent>) {
    let style = bar_style();
    let mut bars: HashMap<MediaKind, TierBar> = HashMap::new();
    let mut selected: HashMap<MediaKind, String> = HashMap::new();

    while let Some(event) = events.recv().await {
        match event {
            TransferEvent::SessionNegotiated {
                session_id, tiers, ..
            } => {
                debug!(resource = %resource_id, session_id = %session_id, tiers, "Session ready");
            }
            TransferEvent::TierSelected {
                kind,
                tier_id,
                descriptor,
            } => {
                selected.insert(kind, format!("{tier_id} {descriptor}"));
            }
            TransferEvent::TransferStarted {
                kind,
                total_bytes,
                chunks,
            } => {
                let span = info_span!("tier", resource = %resource_id, %kind);
                let label = format!(
                    "{resource_id} {kind} {}",
                    selected.get(&kind).map(String::as_str).unwrap_or_default()
                );
                if let Some(style) = &style {
                    span.pb_set_style(style);
                }
                span.pb_set_length(total_bytes);
                span.pb_set_message(&label);
                // Entering once is what makes the layer draw the bar.
                drop(span.enter());
                debug!(resource = %resource_id, %kind, chunks, "Transfer started");
                bars.insert(kind, TierBar { span, label });
            }
            TransferEvent::Progress {
                kind,
                bytes_completed,
                ..
            } => {
                if let Some(bar) = bars.get(&kind) {
                    bar.span.pb_set_position(bytes_completed);
                }
            }
            TransferEvent::ChunkRetry {
                kind,
                index,
                attempt,
                reason,
            } => {
                debug!(resource = %resource_id, %kind, chunk = index, attempt, reason = %reason, "Chunk retry");
            }
            TransferEvent::SessionExpired { session_id } => {
                warn!(resource = %resource_id, session_id = %session_id, "Session expired, renewing");
                for bar in bars.values() {
                    bar.span
                        .pb_set_message(&format!("{} (renewing session)", bar.label));
                }
            }
            TransferEvent::SessionRenewed { session_id, .. } => {
                info!(resource = %resource_id, session_id = %session_id, "Session renewed");
                for bar in bars.values() {
                    bar.span.pb_set_message(&bar.label);
                }
            }
            TransferEvent::TierCompleted { kind, path, bytes } => {
                // Dropping the span closes its bar.
                bars.remove(&kind);
                info!(
                    resource = %resource_id,
                    %kind,
                    path = %path.display(),
                    size = %HumanBytes(bytes),
                    "Saved"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nndl_engine::EventSink;
    use std::path::PathBuf;

    #[test]
    fn bar_template_is_valid() {
        assert!(bar_style().is_some());
    }

    #[tokio::test]
    async fn report_ends_when_the_sink_is_dropped() {
        let (sink, rx) = EventSink::channel();
        let task = tokio::spawn(report("sm9".to_string(), rx));

        sink.emit(TransferEvent::TransferStarted {
            kind: MediaKind::Video,
            total_bytes: 10,
            chunks: 1,
        });
        sink.emit(TransferEvent::Progress {
            kind: MediaKind::Video,
            bytes_completed: 10,
            total_bytes: 10,
            chunks_completed: 1,
            chunks_total: 1,
        });
        sink.emit(TransferEvent::TierCompleted {
            kind: MediaKind::Video,
            path: PathBuf::from("sm9.mp4"),
            bytes: 10,
        });
        drop(sink);

        task.await.unwrap();
    }
}

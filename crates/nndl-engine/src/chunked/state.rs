use std::path::PathBuf;

use url::Url;

use super::plan::ByteRange;
use crate::error::DownloadError;

/// One byte range of a tier, written at its own offset of the destination.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub index: usize,
    pub url: Url,
    pub range: ByteRange,
    /// Pre-allocated file the range is written into
    pub destination: PathBuf,
    /// Bytes at the head of `range` already written and flushed
    pub written: u64,
    /// Attempts made so far, across session renewals
    pub attempts: u32,
    /// Session generation under which the platform last refused this task
    pub(crate) rejected_in: Option<u64>,
}

impl DownloadTask {
    pub fn new(index: usize, url: Url, range: ByteRange, destination: PathBuf) -> Self {
        Self {
            index,
            url,
            range,
            destination,
            written: 0,
            attempts: 0,
            rejected_in: None,
        }
    }

    /// File offset the next byte goes to.
    pub fn offset(&self) -> u64 {
        self.range.start + self.written
    }

    /// The part of the range still to be fetched.
    pub fn remaining(&self) -> ByteRange {
        ByteRange::new(self.offset(), self.range.end)
    }

    pub fn is_complete(&self) -> bool {
        self.written >= self.range.len()
    }
}

/// Outcome of running one task to the end of its retry budget.
#[derive(Debug)]
pub struct ChunkResult {
    pub task: DownloadTask,
    /// Bytes written for the task on success
    pub outcome: Result<u64, DownloadError>,
    /// Retries spent in this run
    pub retries: u32,
    /// Session generation the final attempt ran under
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    InFlight,
    Completed,
    Failed,
}

/// Aggregate state of one tier transfer. Only the dispatcher mutates it, from
/// completed [`ChunkResult`]s.
#[derive(Debug, Clone)]
pub struct TransferState {
    total_bytes: u64,
    bytes_completed: u64,
    statuses: Vec<TaskStatus>,
    retries: u32,
    renegotiations: u32,
}

impl TransferState {
    pub fn new(total_bytes: u64, chunks: usize) -> Self {
        Self {
            total_bytes,
            bytes_completed: 0,
            statuses: vec![TaskStatus::Pending; chunks],
            retries: 0,
            renegotiations: 0,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Bytes of fully written chunks. Never decreases.
    pub fn bytes_completed(&self) -> u64 {
        self.bytes_completed
    }

    pub fn chunks_total(&self) -> usize {
        self.statuses.len()
    }

    pub fn chunks_completed(&self) -> usize {
        self.statuses
            .iter()
            .filter(|s| **s == TaskStatus::Completed)
            .count()
    }

    pub fn status(&self, index: usize) -> Option<TaskStatus> {
        self.statuses.get(index).copied()
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn renegotiations(&self) -> u32 {
        self.renegotiations
    }

    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        self.bytes_completed as f64 / self.total_bytes as f64
    }

    pub fn is_complete(&self) -> bool {
        self.statuses.iter().all(|s| *s == TaskStatus::Completed)
    }

    pub fn is_terminal(&self) -> bool {
        self.is_complete() || self.statuses.contains(&TaskStatus::Failed)
    }

    pub(crate) fn mark_in_flight(&mut self, index: usize) {
        self.set(index, TaskStatus::InFlight);
    }

    pub(crate) fn mark_pending(&mut self, index: usize) {
        self.set(index, TaskStatus::Pending);
    }

    pub(crate) fn set_renegotiations(&mut self, count: u32) {
        self.renegotiations = count;
    }

    /// Fold a result into the aggregate. A chunk already marked complete is
    /// never counted twice.
    pub(crate) fn record(&mut self, result: &ChunkResult) {
        self.retries += result.retries;
        let index = result.task.index;
        match (&result.outcome, self.status(index)) {
            (_, Some(TaskStatus::Completed)) | (_, None) => {}
            (Ok(bytes), Some(_)) => {
                self.bytes_completed = (self.bytes_completed + bytes).min(self.total_bytes);
                self.set(index, TaskStatus::Completed);
            }
            (Err(_), Some(_)) => self.set(index, TaskStatus::Failed),
        }
    }

    fn set(&mut self, index: usize, status: TaskStatus) {
        if let Some(slot) = self.statuses.get_mut(index) {
            *slot = status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(index: usize, start: u64, end: u64) -> DownloadTask {
        DownloadTask::new(
            index,
            Url::parse("https://cdn.example/v.mp4").unwrap(),
            ByteRange::new(start, end),
            PathBuf::from("/tmp/v.mp4.part"),
        )
    }

    fn done(task: DownloadTask) -> ChunkResult {
        let bytes = task.range.len();
        ChunkResult {
            task,
            outcome: Ok(bytes),
            retries: 1,
            generation: 0,
        }
    }

    #[test]
    fn remaining_range_skips_written_bytes() {
        let mut t = task(0, 100, 200);
        t.written = 40;
        assert_eq!(t.offset(), 140);
        assert_eq!(t.remaining(), ByteRange::new(140, 200));
        assert!(!t.is_complete());
        t.written = 100;
        assert!(t.remaining().is_empty());
        assert!(t.is_complete());
    }

    #[test]
    fn progress_is_monotonic_and_never_double_counted() {
        let mut state = TransferState::new(300, 3);
        let mut seen = vec![state.bytes_completed()];

        state.mark_in_flight(1);
        state.record(&done(task(1, 100, 200)));
        seen.push(state.bytes_completed());

        state.record(&done(task(1, 100, 200)));
        seen.push(state.bytes_completed());

        state.record(&done(task(0, 0, 100)));
        state.record(&done(task(2, 200, 300)));
        seen.push(state.bytes_completed());

        assert_eq!(seen, [0, 100, 100, 300]);
        assert!(state.is_complete());
        assert_eq!(state.chunks_completed(), 3);
        assert_eq!(state.fraction(), 1.0);
    }

    #[test]
    fn failure_is_terminal() {
        let mut state = TransferState::new(200, 2);
        state.record(&ChunkResult {
            task: task(0, 0, 100),
            outcome: Err(DownloadError::chunk_fatal(0, "404")),
            retries: 0,
            generation: 0,
        });
        assert!(state.is_terminal());
        assert!(!state.is_complete());
        assert_eq!(state.status(0), Some(TaskStatus::Failed));
        assert_eq!(state.bytes_completed(), 0);
    }
}

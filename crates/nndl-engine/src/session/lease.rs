use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use super::Session;

/// Shared handle to the active session of one transfer.
///
/// Workers only read it: the current session (url/token) and whether it has
/// expired. The heartbeat keeper flips the expired flag and the coordinator
/// swaps in a renegotiated session; nobody else writes.
///
/// One lease spans every tier of a resource, so `renewed_at` is the last
/// renegotiation of the whole transfer.
#[derive(Debug)]
pub struct SessionLease {
    current: RwLock<Arc<Session>>,
    generation: AtomicU64,
    renewed_at: Mutex<Option<Instant>>,
    expired_tx: watch::Sender<bool>,
}

impl SessionLease {
    pub fn new(session: Session) -> Self {
        let (expired_tx, _) = watch::channel(false);
        Self {
            current: RwLock::new(Arc::new(session)),
            generation: AtomicU64::new(0),
            renewed_at: Mutex::new(None),
            expired_tx,
        }
    }

    pub fn current(&self) -> Arc<Session> {
        Arc::clone(&self.current.read())
    }

    /// Number of renegotiations so far. Lets a worker tell whether the
    /// session it failed with has already been replaced.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// When the current session was swapped in, `None` for the first one.
    pub fn renewed_at(&self) -> Option<Instant> {
        *self.renewed_at.lock()
    }

    pub fn is_expired(&self) -> bool {
        *self.expired_tx.borrow()
    }

    pub fn mark_expired(&self) {
        let changed = self.expired_tx.send_if_modified(|expired| {
            let was = *expired;
            *expired = true;
            !was
        });
        if changed {
            debug!(session_id = %self.current.read().id, "Session marked expired");
        }
    }

    /// Install a renegotiated session and clear the expired flag.
    pub fn replace(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        *self.current.write() = Arc::clone(&session);
        self.generation.fetch_add(1, Ordering::AcqRel);
        *self.renewed_at.lock() = Some(Instant::now());
        self.expired_tx.send_replace(false);
        session
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.expired_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MediaKind;
    use crate::session::test_support::{session, tier};

    #[tokio::test]
    async fn expiry_is_observed_by_subscribers_and_cleared_on_replace() {
        let lease = SessionLease::new(session("s1", vec![tier("v", MediaKind::Video, 720, 1, true)]));
        let mut rx = lease.subscribe();
        assert!(!lease.is_expired());
        assert!(lease.renewed_at().is_none());

        lease.mark_expired();
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
        assert!(lease.is_expired());

        let renewed = lease.replace(session("s2", vec![tier("v", MediaKind::Video, 720, 1, true)]));
        assert_eq!(renewed.id, "s2");
        assert_eq!(lease.current().id, "s2");
        assert_eq!(lease.generation(), 1);
        assert!(lease.renewed_at().is_some());
        assert!(!lease.is_expired());
    }

    #[test]
    fn marking_twice_is_harmless() {
        let lease = SessionLease::new(session("s1", vec![]));
        lease.mark_expired();
        lease.mark_expired();
        assert!(lease.is_expired());
        assert_eq!(lease.generation(), 0);
    }
}

//! Session keep-alive.
//!
//! A [`HeartbeatKeeper`] renews one session on a fixed interval from its own
//! task, independent of chunk I/O. Once the platform stops acknowledging
//! renewals for `missed_tolerance` consecutive ticks the keeper flags the
//! [`SessionLease`] as expired and exits; it never retries indefinitely.
//!
//! [`HeartbeatKeeper::stop`] is the only path that releases a session.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::HeartbeatConfig;
use crate::error::DownloadError;
use crate::session::{DeliveryApi, Session, SessionLease};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Idle,
    Active,
    Expired,
    Stopped,
}

pub struct HeartbeatKeeper {
    api: Arc<dyn DeliveryApi>,
    config: HeartbeatConfig,
    release_timeout: Duration,
    state_tx: Arc<watch::Sender<HeartbeatState>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Taken by the first `stop`
    lease: Mutex<Option<Arc<SessionLease>>>,
}

impl HeartbeatKeeper {
    /// A keeper for the lease's current session, in `Idle`.
    pub fn new(
        api: Arc<dyn DeliveryApi>,
        lease: Arc<SessionLease>,
        config: HeartbeatConfig,
        release_timeout: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(HeartbeatState::Idle);
        Self {
            api,
            config,
            release_timeout,
            state_tx: Arc::new(state_tx),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            lease: Mutex::new(Some(lease)),
        }
    }

    pub fn state(&self) -> HeartbeatState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<HeartbeatState> {
        self.state_tx.subscribe()
    }

    /// Begin renewing the lease's current session. The first heartbeat goes
    /// out one interval from now. A keeper can only be started once.
    pub fn start(&self) -> Result<(), DownloadError> {
        let lease = match (self.state(), self.lease.lock().clone()) {
            (HeartbeatState::Idle, Some(lease)) => lease,
            (state, _) => {
                return Err(DownloadError::Internal {
                    reason: format!("heartbeat keeper started from {state:?}"),
                });
            }
        };

        let session = lease.current();
        info!(
            session_id = %session.id,
            interval_secs = self.config.interval_for(session.heartbeat_interval).as_secs_f64(),
            tolerance = session.expiry.missed_tolerance,
            "Starting session heartbeat"
        );

        self.state_tx.send_replace(HeartbeatState::Active);
        let handle = tokio::spawn(run(
            Arc::clone(&self.api),
            lease,
            session,
            self.config.clone(),
            Arc::clone(&self.state_tx),
            self.cancel.child_token(),
        ));
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Stop renewing and release the session. Safe to call from any state and
    /// any number of times; only the first call releases.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let handle = self.task.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
            && e.is_panic()
        {
            warn!(error = %e, "Heartbeat task panicked");
        }

        let lease = self.lease.lock().take();
        if let Some(lease) = lease {
            release_session(self.api.as_ref(), &lease.current(), self.release_timeout).await;
        }

        self.state_tx.send_replace(HeartbeatState::Stopped);
    }
}

/// Best-effort session release. Failures are logged, never returned.
pub(crate) async fn release_session(api: &dyn DeliveryApi, session: &Session, timeout: Duration) {
    match tokio::time::timeout(timeout, api.release(session)).await {
        Ok(Ok(())) => info!(session_id = %session.id, "Delivery session released"),
        Ok(Err(e)) => warn!(session_id = %session.id, error = %e, "Failed to release delivery session"),
        Err(_) => warn!(
            session_id = %session.id,
            timeout_ms = timeout.as_millis() as u64,
            "Timed out releasing delivery session"
        ),
    }
}

async fn run(
    api: Arc<dyn DeliveryApi>,
    lease: Arc<SessionLease>,
    session: Arc<Session>,
    config: HeartbeatConfig,
    state_tx: Arc<watch::Sender<HeartbeatState>>,
    cancel: CancellationToken,
) {
    let interval = config.interval_for(session.heartbeat_interval);
    let tolerance = session.expiry.missed_tolerance.max(1);
    let ack_timeout = config.ack_timeout(interval);

    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut missed = 0u32;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = tokio::time::timeout(ack_timeout, api.heartbeat(&session)) => result,
        };

        let reason = match outcome {
            Ok(Ok(())) => {
                if missed > 0 {
                    debug!(session_id = %session.id, missed, "Heartbeat recovered");
                }
                missed = 0;
                trace!(session_id = %session.id, "Heartbeat acknowledged");
                continue;
            }
            Ok(Err(e)) if matches!(e, DownloadError::SessionExpired { .. }) => {
                // The platform says the session is gone; more ticks cannot help.
                missed = tolerance;
                e.to_string()
            }
            Ok(Err(e)) => {
                missed += 1;
                e.to_string()
            }
            Err(_) => {
                missed += 1;
                format!("no acknowledgement within {}ms", ack_timeout.as_millis())
            }
        };

        if missed < tolerance {
            warn!(
                session_id = %session.id,
                missed,
                tolerance,
                reason = %reason,
                "Heartbeat missed"
            );
            continue;
        }

        warn!(
            session_id = %session.id,
            missed,
            reason = %reason,
            "Heartbeat tolerance exceeded, session expired"
        );
        state_tx.send_replace(HeartbeatState::Expired);
        lease.mark_expired();
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::{session, tier};
    use crate::session::{AuthContext, ExpiryPolicy, Manifest, MediaKind, NegotiationRequest};
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Clone, Copy)]
    enum Mode {
        Ack,
        /// Fail this many heartbeats, then acknowledge
        FailFirst(u32),
        Hang,
    }

    struct FakeApi {
        mode: Mode,
        heartbeats: AtomicU32,
        releases: AtomicU32,
    }

    impl FakeApi {
        fn new(mode: Mode) -> Arc<Self> {
            Arc::new(Self {
                mode,
                heartbeats: AtomicU32::new(0),
                releases: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl DeliveryApi for FakeApi {
        async fn negotiate(&self, _: &NegotiationRequest) -> Result<Session, DownloadError> {
            unreachable!("keeper never negotiates")
        }

        async fn heartbeat(&self, _: &Session) -> Result<(), DownloadError> {
            let call = self.heartbeats.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                Mode::Ack => Ok(()),
                Mode::FailFirst(n) if call < n => Err(DownloadError::http_status(
                    StatusCode::BAD_GATEWAY,
                    "http://api/sessions/s1",
                    "heartbeat",
                )),
                Mode::FailFirst(_) => Ok(()),
                Mode::Hang => std::future::pending().await,
            }
        }

        async fn release(&self, _: &Session) -> Result<(), DownloadError> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn lease() -> Arc<SessionLease> {
        Arc::new(SessionLease::new(session(
            "s1",
            vec![tier("v", MediaKind::Video, 720, 1, true)],
        )))
    }

    fn keeper(api: Arc<FakeApi>, lease: &Arc<SessionLease>) -> HeartbeatKeeper {
        HeartbeatKeeper::new(
            api,
            Arc::clone(lease),
            HeartbeatConfig::default(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn session_without_an_interval_uses_the_configured_default() {
        let api = FakeApi::new(Mode::Ack);
        let silent = Session::new(
            "s1",
            "sm9",
            Manifest::new(vec![tier("v", MediaKind::Video, 720, 1, true)]).unwrap(),
            Duration::ZERO,
            ExpiryPolicy { missed_tolerance: 3 },
            Arc::new(AuthContext::default()),
        );
        let lease = Arc::new(SessionLease::new(silent));
        let keeper = keeper(api.clone(), &lease);
        keeper.start().unwrap();

        tokio::time::sleep(Duration::from_secs(15 * 2 + 1)).await;
        assert_eq!(keeper.state(), HeartbeatState::Active);
        assert_eq!(api.heartbeats.load(Ordering::SeqCst), 2);

        keeper.stop().await;
        assert_eq!(api.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledged_heartbeats_keep_the_session_active() {
        let api = FakeApi::new(Mode::Ack);
        let lease = lease();
        let keeper = keeper(api.clone(), &lease);
        keeper.start().unwrap();

        tokio::time::sleep(Duration::from_secs(15 * 10 + 1)).await;
        assert_eq!(keeper.state(), HeartbeatState::Active);
        assert_eq!(api.heartbeats.load(Ordering::SeqCst), 10);
        assert!(!lease.is_expired());
        keeper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn missed_heartbeats_expire_within_the_tolerance_window() {
        for mode in [Mode::FailFirst(u32::MAX), Mode::Hang] {
            let api = FakeApi::new(mode);
            let lease = lease();
            let keeper = keeper(api.clone(), &lease);
            let window = lease.current().expiry.window(lease.current().heartbeat_interval);

            let started = Instant::now();
            keeper.start().unwrap();
            let mut rx = keeper.subscribe();
            rx.wait_for(|state| *state == HeartbeatState::Expired)
                .await
                .unwrap();

            assert!(started.elapsed() <= window, "expired after {:?}", started.elapsed());
            assert!(lease.is_expired());
            assert_eq!(api.heartbeats.load(Ordering::SeqCst), 3);
            keeper.stop().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn an_ack_resets_the_miss_count() {
        let api = FakeApi::new(Mode::FailFirst(2));
        let lease = lease();
        let keeper = keeper(api.clone(), &lease);
        keeper.start().unwrap();

        tokio::time::sleep(Duration::from_secs(15 * 8 + 1)).await;
        assert_eq!(keeper.state(), HeartbeatState::Active);
        assert!(!lease.is_expired());
        keeper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_releases_once() {
        let api = FakeApi::new(Mode::Ack);
        let keeper = keeper(api.clone(), &lease());
        keeper.start().unwrap();

        keeper.stop().await;
        keeper.stop().await;
        assert_eq!(keeper.state(), HeartbeatState::Stopped);
        assert_eq!(api.releases.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(api.heartbeats.load(Ordering::SeqCst), 0);
        assert!(keeper.start().is_err());
    }

    #[tokio::test]
    async fn stop_from_idle_still_releases() {
        let api = FakeApi::new(Mode::Ack);
        let keeper = keeper(api.clone(), &lease());
        keeper.stop().await;
        assert_eq!(keeper.state(), HeartbeatState::Stopped);
        assert_eq!(api.releases.load(Ordering::SeqCst), 1);
        assert!(keeper.start().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_after_expiry_releases_and_settles_in_stopped() {
        let api = FakeApi::new(Mode::FailFirst(u32::MAX));
        let lease = lease();
        let keeper = keeper(api.clone(), &lease);
        keeper.start().unwrap();
        keeper
            .subscribe()
            .wait_for(|state| *state == HeartbeatState::Expired)
            .await
            .unwrap();

        keeper.stop().await;
        assert_eq!(keeper.state(), HeartbeatState::Stopped);
        assert_eq!(api.releases.load(Ordering::SeqCst), 1);
    }
}

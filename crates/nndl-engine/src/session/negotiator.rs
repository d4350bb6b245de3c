use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{DeliveryApi, NegotiationRequest, Session};
use crate::error::DownloadError;
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};

/// Exchanges a resource id and credentials for a delivery [`Session`].
///
/// Transient failures (network, 5xx) are retried with backoff; credential,
/// not-found and manifest errors surface immediately.
#[derive(Clone)]
pub struct SessionNegotiator {
    api: Arc<dyn DeliveryApi>,
    retry: RetryPolicy,
}

impl SessionNegotiator {
    pub fn new(api: Arc<dyn DeliveryApi>, retry: RetryPolicy) -> Self {
        Self { api, retry }
    }

    pub fn api(&self) -> &Arc<dyn DeliveryApi> {
        &self.api
    }

    pub async fn negotiate(
        &self,
        request: &NegotiationRequest,
        token: &CancellationToken,
    ) -> Result<Session, DownloadError> {
        let session = retry_with_backoff(&self.retry, token, move |_| async move {
            tokio::select! {
                _ = token.cancelled() => RetryAction::Fail(DownloadError::Cancelled),
                result = self.api.negotiate(request) => RetryAction::from(result),
            }
        })
        .await?;

        info!(
            resource_id = %request.resource_id,
            session_id = %session.id,
            tiers = session.manifest.len(),
            heartbeat_secs = session.heartbeat_interval.as_secs(),
            "Delivery session negotiated"
        );
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::{session, tier};
    use crate::session::{AuthContext, MediaKind};
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct FlakyApi {
        failures_before_success: u32,
        calls: AtomicU32,
        failure: fn() -> DownloadError,
    }

    #[async_trait]
    impl DeliveryApi for FlakyApi {
        async fn negotiate(&self, _: &NegotiationRequest) -> Result<Session, DownloadError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err((self.failure)())
            } else {
                Ok(session("s1", vec![tier("v", MediaKind::Video, 720, 1, true)]))
            }
        }

        async fn heartbeat(&self, _: &Session) -> Result<(), DownloadError> {
            Ok(())
        }

        async fn release(&self, _: &Session) -> Result<(), DownloadError> {
            Ok(())
        }
    }

    fn negotiator(api: Arc<FlakyApi>) -> SessionNegotiator {
        SessionNegotiator::new(
            api,
            RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                jitter: false,
            },
        )
    }

    fn request() -> NegotiationRequest {
        NegotiationRequest::new("sm9", Arc::new(AuthContext::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let api = Arc::new(FlakyApi {
            failures_before_success: 2,
            calls: AtomicU32::new(0),
            failure: || {
                DownloadError::http_status(StatusCode::SERVICE_UNAVAILABLE, "http://api", "negotiate")
            },
        });
        let session = negotiator(api.clone())
            .negotiate(&request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(session.id, "s1");
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn auth_errors_are_not_retried() {
        let api = Arc::new(FlakyApi {
            failures_before_success: 10,
            calls: AtomicU32::new(0),
            failure: || DownloadError::Auth {
                resource_id: "sm9".into(),
                reason: "cookie expired".into(),
            },
        });
        let err = negotiator(api.clone())
            .negotiate(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Auth { .. }));
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }
}

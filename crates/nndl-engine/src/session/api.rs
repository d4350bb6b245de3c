use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, trace};
use url::Url;

use super::{AuthContext, ExpiryPolicy, Manifest, MediaKind, QualityTier, Session, TierDescriptor};
use crate::config::HeartbeatConfig;
use crate::error::DownloadError;

/// What the negotiator sends to the platform.
#[derive(Debug, Clone)]
pub struct NegotiationRequest {
    pub resource_id: String,
    pub auth: Arc<AuthContext>,
    /// Quality hints; the platform may use them to order or trim the manifest
    pub video_hint: Option<String>,
    pub audio_hint: Option<String>,
}

impl NegotiationRequest {
    pub fn new(resource_id: impl Into<String>, auth: Arc<AuthContext>) -> Self {
        Self {
            resource_id: resource_id.into(),
            auth,
            video_hint: None,
            audio_hint: None,
        }
    }
}

/// Session endpoint of the delivery platform.
///
/// All three calls must be idempotent on the platform side so callers can
/// retry them freely.
#[async_trait]
pub trait DeliveryApi: Send + Sync {
    /// Exchange a resource id and credentials for a fresh session.
    async fn negotiate(&self, request: &NegotiationRequest) -> Result<Session, DownloadError>;

    /// Renew the session. `Ok` means the platform acknowledged it.
    async fn heartbeat(&self, session: &Session) -> Result<(), DownloadError>;

    /// Tell the platform the session is no longer needed.
    async fn release(&self, session: &Session) -> Result<(), DownloadError>;
}

#[derive(Debug, Serialize)]
struct WireNegotiation<'a> {
    resource_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    video_hint: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_hint: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct WireSession {
    id: String,
    heartbeat_interval_secs: Option<u64>,
    missed_heartbeat_tolerance: Option<u32>,
    token: Option<String>,
    #[serde(default)]
    tiers: Vec<WireTier>,
}

#[derive(Debug, Deserialize)]
struct WireTier {
    id: String,
    kind: MediaKind,
    #[serde(default)]
    bitrate: u64,
    width: Option<u32>,
    height: Option<u32>,
    sampling_rate: Option<u32>,
    label: Option<String>,
    url: String,
    is_available: bool,
}

impl TryFrom<WireTier> for QualityTier {
    type Error = DownloadError;

    fn try_from(tier: WireTier) -> Result<Self, Self::Error> {
        let url = Url::parse(&tier.url).map_err(|e| {
            DownloadError::manifest(format!("tier `{}` has invalid url: {e}", tier.id))
        })?;
        Ok(QualityTier {
            id: tier.id,
            kind: tier.kind,
            descriptor: TierDescriptor {
                bitrate: tier.bitrate,
                width: tier.width,
                height: tier.height,
                sampling_rate: tier.sampling_rate,
                label: tier.label,
            },
            url,
            available: tier.is_available,
        })
    }
}

/// JSON delivery endpoint speaking the `/sessions` protocol.
///
/// Method overrides (`_method=PUT` / `_method=DELETE`) ride on POST, which is
/// how the platform expects heartbeat and release calls.
pub struct HttpDeliveryApi {
    client: Client,
    endpoint: Url,
    params: Vec<(String, String)>,
    heartbeat: HeartbeatConfig,
}

impl HttpDeliveryApi {
    pub fn new(client: Client, endpoint: Url, heartbeat: HeartbeatConfig) -> Self {
        Self {
            client,
            endpoint,
            params: Vec::new(),
            heartbeat,
        }
    }

    /// Extra query parameters sent with every session call.
    pub fn with_params(mut self, params: Vec<(String, String)>) -> Self {
        self.params = params;
        self
    }

    fn sessions_url(&self, session_id: Option<&str>) -> Result<Url, DownloadError> {
        sessions_url(&self.endpoint, session_id)
    }

    async fn session_call(
        &self,
        session: &Session,
        method: &'static str,
        operation: &'static str,
    ) -> Result<(), DownloadError> {
        let url = self.sessions_url(Some(&session.id))?;
        let body = json!({ "session": session.renewal_payload.clone().unwrap_or(Value::Null) });

        let request = self
            .client
            .post(url.clone())
            .query(&[("_format", "json"), ("_method", method)])
            .query(&self.params)
            .json(&body);
        let response = session.auth.apply(request).send().await?;

        let status = response.status();
        if status.is_success() {
            trace!(session_id = %session.id, operation, "Session call acknowledged");
            return Ok(());
        }
        match status {
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(DownloadError::session_expired(
                format!("platform no longer knows session {} ({status})", session.id),
            )),
            _ => Err(DownloadError::http_status(status, url, operation)),
        }
    }
}

#[async_trait]
impl DeliveryApi for HttpDeliveryApi {
    async fn negotiate(&self, request: &NegotiationRequest) -> Result<Session, DownloadError> {
        let url = self.sessions_url(None)?;
        let body = json!({
            "session": WireNegotiation {
                resource_id: &request.resource_id,
                video_hint: request.video_hint.as_deref(),
                audio_hint: request.audio_hint.as_deref(),
            }
        });

        debug!(resource_id = %request.resource_id, url = %url, "Negotiating delivery session");
        let http_request = self
            .client
            .post(url.clone())
            .query(&[("_format", "json")])
            .query(&self.params)
            .json(&body);
        let response = request.auth.apply(http_request).send().await?;

        let status = response.status();
        match status {
            s if s.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(DownloadError::Auth {
                    resource_id: request.resource_id.clone(),
                    reason: format!("negotiation answered {status}"),
                });
            }
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                return Err(DownloadError::NotFound {
                    resource_id: request.resource_id.clone(),
                });
            }
            _ => return Err(DownloadError::http_status(status, url, "negotiate")),
        }

        let text = response.text().await?;
        let document: Value = serde_json::from_str(&text)
            .map_err(|e| DownloadError::manifest(format!("response is not JSON: {e}")))?;
        session_from_document(document, request, &self.heartbeat)
    }

    async fn heartbeat(&self, session: &Session) -> Result<(), DownloadError> {
        self.session_call(session, "PUT", "heartbeat").await
    }

    async fn release(&self, session: &Session) -> Result<(), DownloadError> {
        self.session_call(session, "DELETE", "release").await
    }
}

fn sessions_url(endpoint: &Url, session_id: Option<&str>) -> Result<Url, DownloadError> {
    let mut url = endpoint.clone();
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| DownloadError::invalid_url(endpoint.as_str(), "cannot be a base URL"))?;
        segments.pop_if_empty().push("sessions");
        if let Some(id) = session_id {
            segments.push(id);
        }
    }
    Ok(url)
}

/// Turn a negotiation response document into a [`Session`].
fn session_from_document(
    mut document: Value,
    request: &NegotiationRequest,
    defaults: &HeartbeatConfig,
) -> Result<Session, DownloadError> {
    let payload = document
        .pointer_mut("/data/session")
        .map(Value::take)
        .ok_or_else(|| DownloadError::manifest("missing data.session"))?;
    let wire: WireSession = serde_json::from_value(payload.clone())
        .map_err(|e| DownloadError::manifest(format!("invalid session document: {e}")))?;

    if wire.tiers.is_empty() {
        return Err(DownloadError::manifest("no quality tiers offered"));
    }
    let tiers = wire
        .tiers
        .into_iter()
        .map(QualityTier::try_from)
        .collect::<Result<Vec<_>, _>>()?;

    let heartbeat_interval = wire
        .heartbeat_interval_secs
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(defaults.default_interval);

    Ok(Session {
        id: wire.id,
        resource_id: request.resource_id.clone(),
        created_at: Instant::now(),
        heartbeat_interval,
        expiry: ExpiryPolicy {
            missed_tolerance: wire
                .missed_heartbeat_tolerance
                .unwrap_or(defaults.missed_tolerance),
        },
        manifest: Manifest::new(tiers)?,
        token: wire.token,
        auth: Arc::clone(&request.auth),
        renewal_payload: Some(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> NegotiationRequest {
        NegotiationRequest::new("sm9", Arc::new(AuthContext::default()))
    }

    #[test]
    fn parses_negotiation_document() {
        let document = json!({
            "data": { "session": {
                "id": "abc",
                "heartbeat_interval_secs": 40,
                "token": "t0k",
                "tiers": [
                    { "id": "archive_aac_64kbps", "kind": "audio", "bitrate": 64000,
                      "sampling_rate": 44100, "url": "https://cdn.example/a", "is_available": true },
                    { "id": "archive_h264_720p", "kind": "video", "bitrate": 2000000,
                      "width": 1280, "height": 720, "label": "720p",
                      "url": "https://cdn.example/v", "is_available": false }
                ]
            }}
        });

        let session = session_from_document(document, &request(), &HeartbeatConfig::default())
            .unwrap();
        assert_eq!(session.id, "abc");
        assert_eq!(session.heartbeat_interval, Duration::from_secs(40));
        assert_eq!(session.expiry.missed_tolerance, 3);
        assert_eq!(session.token.as_deref(), Some("t0k"));
        assert_eq!(session.manifest.len(), 2);
        assert!(!session.tier("archive_h264_720p").unwrap().available);
        assert_eq!(
            session.renewal_payload.as_ref().and_then(|p| p.get("id")),
            Some(&json!("abc"))
        );
    }

    #[test]
    fn falls_back_to_configured_heartbeat_interval() {
        let document = json!({
            "data": { "session": { "id": "x", "tiers": [
                { "id": "v", "kind": "video", "url": "https://cdn.example/v", "is_available": true }
            ]}}
        });
        let session = session_from_document(document, &request(), &HeartbeatConfig::default())
            .unwrap();
        assert_eq!(session.heartbeat_interval, Duration::from_secs(15));
    }

    #[test]
    fn empty_or_malformed_manifest_is_a_manifest_error() {
        let empty = json!({ "data": { "session": { "id": "x", "tiers": [] } } });
        let missing = json!({ "data": {} });
        let bad_url = json!({
            "data": { "session": { "id": "x", "tiers": [
                { "id": "v", "kind": "video", "url": "not a url", "is_available": true }
            ]}}
        });
        for document in [empty, missing, bad_url] {
            let err = session_from_document(document, &request(), &HeartbeatConfig::default())
                .unwrap_err();
            assert!(matches!(err, DownloadError::Manifest { .. }), "{err}");
        }
    }

    #[test]
    fn sessions_url_handles_trailing_slash() {
        let endpoint = Url::parse("https://api.example/v1/").unwrap();
        assert_eq!(
            sessions_url(&endpoint, None).unwrap().as_str(),
            "https://api.example/v1/sessions"
        );
        assert_eq!(
            sessions_url(&endpoint, Some("abc")).unwrap().as_str(),
            "https://api.example/v1/sessions/abc"
        );
        assert!(sessions_url(&Url::parse("data:text/plain,x").unwrap(), None).is_err());
    }
}

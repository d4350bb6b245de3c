//! Delivery sessions and the manifests they carry.
//!
//! A [`Session`] is the platform's time-limited authorization to fetch one
//! resource. It is created by the [`SessionNegotiator`], shared with workers
//! through a [`SessionLease`], kept alive by the heartbeat keeper and released
//! by the coordinator.

mod api;
mod lease;
mod negotiator;

pub use api::{DeliveryApi, HttpDeliveryApi, NegotiationRequest};
pub use lease::SessionLease;
pub use negotiator::SessionNegotiator;

use std::cmp::Reverse;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::DownloadError;

/// Kind of media a tier carries. Video sorts before audio, which is also the
/// order selected tiers are transferred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub const ALL: [MediaKind; 2] = [MediaKind::Video, MediaKind::Audio];

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bitrate/resolution description of a tier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierDescriptor {
    /// Bits per second
    pub bitrate: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Audio sampling rate in Hz
    pub sampling_rate: Option<u32>,
    /// Platform label, e.g. "1080p"
    pub label: Option<String>,
}

impl TierDescriptor {
    /// Ordering key, higher is better. Resolution dominates for video,
    /// sampling rate for audio, bitrate breaks ties.
    fn quality_key(&self) -> (u32, u32, u64) {
        (
            self.height.unwrap_or(0),
            self.sampling_rate.unwrap_or(0),
            self.bitrate,
        )
    }
}

impl fmt::Display for TierDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let (Some(w), Some(h)) = (self.width, self.height) {
            write!(f, "{w}x{h}")?;
            if let Some(label) = &self.label {
                write!(f, "({label})")?;
            }
        } else if let Some(rate) = self.sampling_rate {
            write!(f, "{:.1}kHz", rate as f64 / 1000.0)?;
        }
        write!(f, "@{}kbps", self.bitrate / 1000)
    }
}

/// One quality/format variant offered by the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityTier {
    pub id: String,
    pub kind: MediaKind,
    pub descriptor: TierDescriptor,
    pub url: Url,
    /// The platform may advertise a tier without granting access to it
    pub available: bool,
}

/// Tier list of one negotiation: unique ids, each kind ordered best first.
/// Immutable once built; renegotiation produces a new manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    tiers: Vec<QualityTier>,
}

impl Manifest {
    pub fn new(mut tiers: Vec<QualityTier>) -> Result<Self, DownloadError> {
        let mut seen = HashSet::with_capacity(tiers.len());
        for tier in &tiers {
            if !seen.insert(tier.id.as_str()) {
                return Err(DownloadError::manifest(format!(
                    "duplicate tier id `{}`",
                    tier.id
                )));
            }
        }

        // Stable, so equal tiers keep the platform's order.
        tiers.sort_by_key(|tier| (tier.kind, Reverse(tier.descriptor.quality_key())));
        Ok(Self { tiers })
    }

    pub fn tiers(&self) -> &[QualityTier] {
        &self.tiers
    }

    /// Tiers of one kind, best first.
    pub fn of_kind(&self, kind: MediaKind) -> impl Iterator<Item = &QualityTier> + '_ {
        self.tiers.iter().filter(move |tier| tier.kind == kind)
    }

    pub fn get(&self, id: &str) -> Option<&QualityTier> {
        self.tiers.iter().find(|tier| tier.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }
}

/// Caller credentials. Owned by the coordinator; sessions hold a shared
/// read-only reference that workers use for range requests.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    /// Raw `Cookie` header value
    pub cookies: Option<String>,
    /// Extra headers required by the platform
    pub headers: Vec<(String, String)>,
}

impl AuthContext {
    pub fn with_cookies(cookies: impl Into<String>) -> Self {
        Self {
            cookies: Some(cookies.into()),
            headers: Vec::new(),
        }
    }

    pub(crate) fn apply(&self, mut request: RequestBuilder) -> RequestBuilder {
        if let Some(cookies) = self.cookies.as_deref().filter(|c| !c.trim().is_empty()) {
            request = request.header(reqwest::header::COOKIE, cookies);
        }
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }
}

/// How long a session survives without acknowledged heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    /// Consecutive missed heartbeats after which the session is expired
    pub missed_tolerance: u32,
}

impl ExpiryPolicy {
    /// Upper bound on the time between the last acknowledged heartbeat and
    /// the session being declared expired.
    pub fn window(&self, interval: Duration) -> Duration {
        interval.saturating_mul(self.missed_tolerance.saturating_add(1))
    }
}

/// Time-limited delivery authorization for one resource.
#[derive(Debug, Clone)]
pub struct Session {
    /// Opaque platform token identifying the session
    pub id: String,
    pub resource_id: String,
    pub created_at: Instant,
    pub heartbeat_interval: Duration,
    pub expiry: ExpiryPolicy,
    pub manifest: Manifest,
    /// Bearer token for range requests, if the platform issues one
    pub token: Option<String>,
    pub auth: Arc<AuthContext>,
    /// Session document echoed back on heartbeat
    pub(crate) renewal_payload: Option<serde_json::Value>,
}

impl Session {
    /// A session created now, without a bearer token. Used by
    /// [`DeliveryApi`] implementations other than the HTTP one.
    pub fn new(
        id: impl Into<String>,
        resource_id: impl Into<String>,
        manifest: Manifest,
        heartbeat_interval: Duration,
        expiry: ExpiryPolicy,
        auth: Arc<AuthContext>,
    ) -> Self {
        Self {
            id: id.into(),
            resource_id: resource_id.into(),
            created_at: Instant::now(),
            heartbeat_interval,
            expiry,
            manifest,
            token: None,
            auth,
            renewal_payload: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn tier(&self, id: &str) -> Option<&QualityTier> {
        self.manifest.get(id)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Attach the session credentials to a request for media bytes.
    pub(crate) fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = self.auth.apply(request);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

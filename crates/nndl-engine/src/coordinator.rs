//! Per-resource orchestration: negotiate, select, keep alive, fetch, release.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use url::Url;

use crate::chunked::{ChunkedDownloader, HttpRangeSource, RangeSource, SessionRecovery};
use crate::config::EngineConfig;
use crate::error::DownloadError;
use crate::events::{EventSink, TransferEvent};
use crate::heartbeat::HeartbeatKeeper;
use crate::quality::{QualityConstraints, QualitySelector, Selection};
use crate::session::{
    AuthContext, DeliveryApi, HttpDeliveryApi, Manifest, MediaKind, NegotiationRequest,
    QualityTier, Session, SessionLease, SessionNegotiator,
};

/// One resource to fetch.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub resource_id: String,
    /// Output path. With both kinds enabled each tier goes to a sibling
    /// `<stem>.<kind>.<ext>` instead.
    pub destination: PathBuf,
    pub auth: Arc<AuthContext>,
    pub constraints: QualityConstraints,
    /// Return `AlreadyExists` without negotiating if every output is present
    pub skip_existing: bool,
    /// Overrides `EngineConfig::worker_count`
    pub worker_count: Option<usize>,
}

impl TransferRequest {
    pub fn new(resource_id: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            resource_id: resource_id.into(),
            destination: destination.into(),
            auth: Arc::new(AuthContext::default()),
            constraints: QualityConstraints::default(),
            skip_existing: false,
            worker_count: None,
        }
    }

    /// Output path of each enabled kind, in transfer order.
    pub fn outputs(&self) -> Vec<(MediaKind, PathBuf)> {
        let kinds: Vec<MediaKind> = self.constraints.enabled_kinds().collect();
        match kinds.as_slice() {
            [kind] => vec![(*kind, self.destination.clone())],
            _ => kinds
                .into_iter()
                .map(|kind| (kind, kind_path(&self.destination, kind)))
                .collect(),
        }
    }
}

/// `movie.mp4` -> `movie.video.mp4`
fn kind_path(destination: &Path, kind: MediaKind) -> PathBuf {
    let Some(stem) = destination.file_stem() else {
        let mut name = OsString::from(destination.as_os_str());
        name.push(".");
        name.push(kind.as_str());
        return PathBuf::from(name);
    };
    let mut name = stem.to_os_string();
    name.push(".");
    name.push(kind.as_str());
    if let Some(ext) = destination.extension() {
        name.push(".");
        name.push(ext);
    }
    destination.with_file_name(name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFile {
    pub kind: MediaKind,
    pub tier_id: String,
    pub path: PathBuf,
    pub bytes: u64,
}

/// Terminal status of one resource. Failures are the `Err` side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed {
        files: Vec<CompletedFile>,
        renegotiations: u32,
    },
    /// Every output already existed and `skip_existing` was set
    AlreadyExists { paths: Vec<PathBuf> },
    /// Both media kinds were disabled
    Skipped,
}

/// Runs transfers against one delivery platform. Holds no per-resource
/// state, so one coordinator can serve any number of concurrent `run` calls.
pub struct TransferCoordinator {
    negotiator: SessionNegotiator,
    selector: QualitySelector,
    downloader: ChunkedDownloader,
    source: Arc<dyn RangeSource>,
    config: EngineConfig,
    events: EventSink,
}

impl TransferCoordinator {
    pub fn new(
        api: Arc<dyn DeliveryApi>,
        source: Arc<dyn RangeSource>,
        config: EngineConfig,
    ) -> Self {
        Self::with_events(api, source, config, EventSink::disabled())
    }

    pub fn with_events(
        api: Arc<dyn DeliveryApi>,
        source: Arc<dyn RangeSource>,
        config: EngineConfig,
        events: EventSink,
    ) -> Self {
        Self {
            negotiator: SessionNegotiator::new(api, config.negotiation_retry.clone()),
            selector: QualitySelector,
            downloader: ChunkedDownloader::new(Arc::clone(&source), config.clone(), events.clone()),
            source,
            config,
            events,
        }
    }

    /// Coordinator speaking the JSON delivery API at `endpoint`, with range
    /// requests over the same client. `params` ride on every session call.
    pub fn http(
        client: Client,
        endpoint: Url,
        params: Vec<(String, String)>,
        config: EngineConfig,
    ) -> Self {
        let api = HttpDeliveryApi::new(client.clone(), endpoint, config.heartbeat.clone())
            .with_params(params);
        Self::new(
            Arc::new(api),
            Arc::new(HttpRangeSource::new(client)),
            config,
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Same coordinator reporting to another sink.
    pub fn reporting_to(&self, events: EventSink) -> Self {
        Self::with_events(
            Arc::clone(self.negotiator.api()),
            Arc::clone(&self.source),
            self.config.clone(),
            events,
        )
    }

    /// Fetch one resource. The session negotiated here is always released
    /// before returning, whatever the outcome.
    #[instrument(skip_all, fields(resource_id = %request.resource_id))]
    pub async fn run(
        &self,
        request: &TransferRequest,
        token: &CancellationToken,
    ) -> Result<TransferOutcome, DownloadError> {
        if request.constraints.nothing_enabled() {
            info!("Video and audio both disabled, nothing to fetch");
            return Ok(TransferOutcome::Skipped);
        }

        let outputs = request.outputs();
        if request.skip_existing && all_exist(&outputs).await {
            let paths: Vec<PathBuf> = outputs.into_iter().map(|(_, path)| path).collect();
            info!(paths = ?paths, "Destination already exists, skipping");
            return Ok(TransferOutcome::AlreadyExists { paths });
        }

        let negotiation = self.negotiation_request(request);
        let session = self.negotiator.negotiate(&negotiation, token).await?;
        self.announce(&session);

        let lease = Arc::new(SessionLease::new(session));
        let keeper = Mutex::new(Arc::new(self.keeper(&lease)));

        let result = self
            .transfer(request, &outputs, &lease, &keeper, &negotiation, token)
            .await;

        // Whichever keeper is current owns the live session.
        let current = Arc::clone(&*keeper.lock());
        current.stop().await;

        match result {
            Ok((files, renegotiations)) => {
                info!(files = files.len(), renegotiations, "Transfer finished");
                Ok(TransferOutcome::Completed {
                    files,
                    renegotiations,
                })
            }
            Err(e) => {
                error!(error = %e, "Transfer failed");
                Err(e)
            }
        }
    }

    /// Negotiate a session only to read its manifest, then release it.
    #[instrument(skip(self, auth, token))]
    pub async fn list_qualities(
        &self,
        resource_id: &str,
        auth: Arc<AuthContext>,
        token: &CancellationToken,
    ) -> Result<Manifest, DownloadError> {
        let request = NegotiationRequest::new(resource_id, auth);
        let session = self.negotiator.negotiate(&request, token).await?;
        let lease = Arc::new(SessionLease::new(session));
        let keeper = self.keeper(&lease);
        keeper.stop().await;
        Ok(lease.current().manifest.clone())
    }

    async fn transfer(
        &self,
        request: &TransferRequest,
        outputs: &[(MediaKind, PathBuf)],
        lease: &Arc<SessionLease>,
        keeper: &Mutex<Arc<HeartbeatKeeper>>,
        negotiation: &NegotiationRequest,
        token: &CancellationToken,
    ) -> Result<(Vec<CompletedFile>, u32), DownloadError> {
        let selection = self
            .selector
            .select(&lease.current().manifest, &request.constraints)?;
        for tier in selection.tiers() {
            info!(
                kind = %tier.kind,
                tier = %tier.id,
                descriptor = %tier.descriptor,
                "Quality tier selected"
            );
            self.events.emit(TransferEvent::TierSelected {
                kind: tier.kind,
                tier_id: tier.id.clone(),
                descriptor: tier.descriptor.to_string(),
            });
        }

        Arc::clone(&*keeper.lock()).start()?;

        let renewal = Renewal {
            coordinator: self,
            lease,
            keeper,
            negotiation,
            selection: Mutex::new(selection),
            token,
        };
        let workers = request.worker_count.unwrap_or(self.config.worker_count);

        let mut files = Vec::with_capacity(outputs.len());
        let mut renegotiations = 0;
        for (kind, path) in outputs {
            // Re-read per tier: a renewal during an earlier tier refreshes URLs.
            let tier = renewal.selected(*kind)?;
            let state = self
                .downloader
                .fetch(lease, &tier, path, workers, &renewal, token)
                .await?;
            renegotiations += state.renegotiations();
            files.push(CompletedFile {
                kind: *kind,
                tier_id: tier.id,
                path: path.clone(),
                bytes: state.total_bytes(),
            });
        }
        Ok((files, renegotiations))
    }

    fn negotiation_request(&self, request: &TransferRequest) -> NegotiationRequest {
        let mut negotiation =
            NegotiationRequest::new(request.resource_id.clone(), Arc::clone(&request.auth));
        negotiation.video_hint = request.constraints.hint(MediaKind::Video);
        negotiation.audio_hint = request.constraints.hint(MediaKind::Audio);
        negotiation
    }

    fn keeper(&self, lease: &Arc<SessionLease>) -> HeartbeatKeeper {
        HeartbeatKeeper::new(
            Arc::clone(self.negotiator.api()),
            Arc::clone(lease),
            self.config.heartbeat.clone(),
            self.config.release_timeout,
        )
    }

    fn announce(&self, session: &Session) {
        self.events.emit(TransferEvent::SessionNegotiated {
            resource_id: session.resource_id.clone(),
            session_id: session.id.clone(),
            tiers: session.manifest.len(),
        });
    }
}

async fn all_exist(outputs: &[(MediaKind, PathBuf)]) -> bool {
    for (_, path) in outputs {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return false;
        }
    }
    true
}

/// Session renewal for one `run`: swaps a fresh session into the lease and a
/// fresh keeper into the slot the coordinator stops at the end.
struct Renewal<'a> {
    coordinator: &'a TransferCoordinator,
    lease: &'a Arc<SessionLease>,
    keeper: &'a Mutex<Arc<HeartbeatKeeper>>,
    negotiation: &'a NegotiationRequest,
    selection: Mutex<Selection>,
    token: &'a CancellationToken,
}

impl Renewal<'_> {
    fn selected(&self, kind: MediaKind) -> Result<QualityTier, DownloadError> {
        self.selection
            .lock()
            .get(kind)
            .cloned()
            .ok_or_else(|| DownloadError::Internal {
                reason: format!("no {kind} tier in the selection"),
            })
    }
}

#[async_trait]
impl SessionRecovery for Renewal<'_> {
    async fn recover(&self, tier: &QualityTier) -> Result<QualityTier, DownloadError> {
        let expired = Arc::clone(&*self.keeper.lock());
        expired.stop().await;

        let session = self
            .coordinator
            .negotiator
            .negotiate(self.negotiation, self.token)
            .await?;
        self.coordinator.announce(&session);

        // Installed before revalidation so a rejected manifest is still
        // released by the final stop.
        let previous = self.selection.lock().clone();
        self.lease.replace(session);
        let keeper = Arc::new(self.coordinator.keeper(self.lease));
        *self.keeper.lock() = Arc::clone(&keeper);

        let current = self.lease.current();
        let selection = self
            .coordinator
            .selector
            .revalidate(&current.manifest, &previous)?;
        let fresh = selection
            .get(tier.kind)
            .cloned()
            .ok_or_else(|| DownloadError::QualityUnavailable {
                kind: tier.kind,
                requested: tier.id.clone(),
            })?;
        *self.selection.lock() = selection;

        keeper.start()?;
        debug!(
            session_id = %current.id,
            tier = %fresh.id,
            "Selection revalidated against renewed session"
        );
        Ok(fresh)
    }
}

// Session-based chunked media download engine
pub mod builder;
pub mod chunked;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod proxy;
pub mod quality;
pub mod retry;
pub mod session;

pub use builder::DownloaderConfigBuilder;
pub use chunked::{ChunkedDownloader, HttpRangeSource, RangeSource, SessionRecovery, TransferState};
pub use client::create_client;
pub use config::{DownloaderConfig, EngineConfig, HeartbeatConfig};
pub use coordinator::{CompletedFile, TransferCoordinator, TransferOutcome, TransferRequest};
pub use error::DownloadError;
pub use events::{EventSink, TransferEvent};
pub use heartbeat::{HeartbeatKeeper, HeartbeatState};
pub use proxy::{ProxyAuth, ProxyConfig, ProxyType};
pub use quality::{QualityConstraints, QualityRequest, QualitySelector, Selection};
pub use retry::RetryPolicy;
pub use session::{
    AuthContext, DeliveryApi, HttpDeliveryApi, Manifest, MediaKind, QualityTier, Session,
    SessionLease, SessionNegotiator,
};

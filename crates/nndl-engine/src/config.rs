use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::proxy::ProxyConfig;
use crate::retry::RetryPolicy;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// HTTP version preference for connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HttpVersionPreference {
    /// Let ALPN negotiate the best version (default)
    #[default]
    Auto,
    /// HTTP/2 with prior knowledge, no fallback to HTTP/1.1
    Http2Only,
    /// Force HTTP/1.1 only (disable HTTP/2)
    Http1Only,
}

/// Configurable options for the HTTP client shared by negotiation,
/// heartbeat and range requests.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Overall timeout for a single HTTP request. Zero disables it, which is
    /// what range requests want: a large chunk may legitimately take minutes.
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Read timeout (maximum time between receiving data chunks)
    pub read_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Custom HTTP headers for requests
    pub headers: HeaderMap,

    /// Custom query parameters appended to delivery API requests
    pub params: Vec<(String, String)>,

    /// Proxy configuration (optional)
    pub proxy: Option<ProxyConfig>,

    /// Whether to use system proxy settings if available
    pub use_system_proxy: bool,

    pub danger_accept_invalid_certs: bool,

    pub force_ipv4: bool,

    pub force_ipv6: bool,

    /// HTTP version preference (Auto, Http2Only, Http1Only)
    pub http_version: HttpVersionPreference,

    /// TCP keep-alive interval for long-lived range connections
    pub http2_keep_alive_interval: Option<Duration>,

    /// Maximum idle connections to keep per host.
    /// Every chunk worker holds one connection to the CDN host.
    pub pool_max_idle_per_host: usize,

    /// Duration to keep idle connections alive before closing
    pub pool_idle_timeout: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(0),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: DownloaderConfig::get_default_headers(),
            params: Vec::new(),
            proxy: None,
            use_system_proxy: true,
            danger_accept_invalid_certs: false,
            force_ipv4: false,
            force_ipv6: false,
            http_version: HttpVersionPreference::Auto,
            http2_keep_alive_interval: Some(Duration::from_secs(20)),
            pool_max_idle_per_host: 16,
            pool_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl DownloaderConfig {
    pub fn builder() -> crate::builder::DownloaderConfigBuilder {
        crate::builder::DownloaderConfigBuilder::new()
    }

    /// Merge user supplied headers on top of the default header set.
    pub fn with_config(config: DownloaderConfig) -> Self {
        let mut headers = DownloaderConfig::get_default_headers();

        // Custom headers take precedence over defaults for the same fields
        for (name, value) in config.headers.iter() {
            headers.insert(name.clone(), value.clone());
        }

        Self { headers, ..config }
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5,ja;q=0.3"),
        );
        default_headers
    }
}

/// Heartbeat policy. The platform may advertise its own interval and
/// tolerance in the session; these values fill in whatever it leaves out.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval used when the session does not advertise one
    pub default_interval: Duration,
    /// Number of consecutive missed acknowledgements after which the
    /// session is considered expired
    pub missed_tolerance: u32,
    /// Acknowledgement timeout as a fraction of the heartbeat interval
    pub ack_timeout_fraction: f64,
}

impl HeartbeatConfig {
    /// Period to renew at; a session advertising none (zero) gets the default.
    pub fn interval_for(&self, advertised: Duration) -> Duration {
        if advertised.is_zero() {
            self.default_interval.max(Duration::from_millis(1))
        } else {
            advertised
        }
    }

    pub fn ack_timeout(&self, interval: Duration) -> Duration {
        let fraction = self.ack_timeout_fraction.clamp(0.05, 1.0);
        interval.mul_f64(fraction).max(Duration::from_millis(1))
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            default_interval: Duration::from_secs(15),
            missed_tolerance: 3,
            ack_timeout_fraction: 1.0 / 3.0,
        }
    }
}

/// Engine policy constants.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of concurrent range workers per tier
    pub worker_count: usize,
    /// No chunk is made smaller than this, which caps the worker count for
    /// small resources
    pub min_chunk_size: u64,
    /// Backoff for transient chunk failures
    pub chunk_retry: RetryPolicy,
    /// Backoff for transient negotiation failures
    pub negotiation_retry: RetryPolicy,
    pub heartbeat: HeartbeatConfig,
    /// A second session expiry within this window after a renegotiation is fatal
    pub renegotiation_window: Duration,
    /// Upper bound on the best-effort session release call
    pub release_timeout: Duration,
    /// Extension appended to destinations while a transfer is in progress
    pub part_suffix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            min_chunk_size: 1024 * 1024,
            chunk_retry: RetryPolicy {
                max_retries: 5,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                jitter: false,
            },
            negotiation_retry: RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(10),
                jitter: false,
            },
            heartbeat: HeartbeatConfig::default(),
            renegotiation_window: Duration::from_secs(60),
            release_timeout: Duration::from_secs(5),
            part_suffix: "part".to_owned(),
        }
    }
}

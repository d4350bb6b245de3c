use reqwest::StatusCode;

use crate::session::MediaKind;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("credentials rejected for `{resource_id}`: {reason}")]
    Auth { resource_id: String, reason: String },

    #[error("resource `{resource_id}` not found or not accessible")]
    NotFound { resource_id: String },

    #[error("malformed delivery manifest: {reason}")]
    Manifest { reason: String },

    #[error("requested {kind} quality `{requested}` is not available")]
    QualityUnavailable { kind: MediaKind, requested: String },

    #[error("no {kind} quality is currently available")]
    NoQualityAvailable { kind: MediaKind },

    #[error("delivery session expired: {reason}")]
    SessionExpired { reason: String },

    #[error("chunk {index} failed transiently: {reason}")]
    ChunkTransient { index: usize, reason: String },

    #[error("chunk {index} failed: {reason}")]
    ChunkFatal { index: usize, reason: String },

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("proxy configuration error: {reason}")]
    ProxyConfiguration { reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl DownloadError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn proxy_configuration(reason: impl Into<String>) -> Self {
        Self::ProxyConfiguration {
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn manifest(reason: impl Into<String>) -> Self {
        Self::Manifest {
            reason: reason.into(),
        }
    }

    pub fn session_expired(reason: impl Into<String>) -> Self {
        Self::SessionExpired {
            reason: reason.into(),
        }
    }

    pub fn chunk_transient(index: usize, reason: impl Into<String>) -> Self {
        Self::ChunkTransient {
            index,
            reason: reason.into(),
        }
    }

    pub fn chunk_fatal(index: usize, reason: impl Into<String>) -> Self {
        Self::ChunkFatal {
            index,
            reason: reason.into(),
        }
    }

    /// Whether a fresh attempt of the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled => false,
            Self::Auth { .. }
            | Self::NotFound { .. }
            | Self::Manifest { .. }
            | Self::QualityUnavailable { .. }
            | Self::NoQualityAvailable { .. }
            | Self::SessionExpired { .. }
            | Self::ChunkFatal { .. }
            | Self::InvalidUrl { .. }
            | Self::ProxyConfiguration { .. }
            | Self::Configuration { .. } => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
            }
            Self::Network { source } => {
                source.is_connect()
                    || source.is_timeout()
                    || source.is_request()
                    || source.is_body()
                    || source.is_decode()
            }
            Self::ChunkTransient { .. } | Self::Io { .. } | Self::Internal { .. } => true,
        }
    }

    /// Whether the delivery platform refused the session credentials, which
    /// means the session has to be renegotiated before the request can succeed.
    pub fn is_session_rejection(&self) -> bool {
        match self {
            Self::SessionExpired { .. } => true,
            Self::HttpStatus { status, .. } => matches!(
                *status,
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::GONE
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retryable() {
        let err = DownloadError::http_status(StatusCode::BAD_GATEWAY, "http://cdn/x", "range fetch");
        assert!(err.is_retryable());
        assert!(!err.is_session_rejection());
    }

    #[test]
    fn forbidden_is_a_session_rejection_not_a_retry() {
        let err = DownloadError::http_status(StatusCode::FORBIDDEN, "http://cdn/x", "range fetch");
        assert!(!err.is_retryable());
        assert!(err.is_session_rejection());
    }

    #[test]
    fn taxonomy_errors_never_retry() {
        let errs = [
            DownloadError::Auth {
                resource_id: "sm9".into(),
                reason: "bad cookie".into(),
            },
            DownloadError::NotFound {
                resource_id: "sm9".into(),
            },
            DownloadError::manifest("no tiers"),
            DownloadError::QualityUnavailable {
                kind: MediaKind::Video,
                requested: "1080p".into(),
            },
            DownloadError::NoQualityAvailable {
                kind: MediaKind::Audio,
            },
            DownloadError::chunk_fatal(2, "416"),
        ];
        for err in errs {
            assert!(!err.is_retryable(), "{err} should not be retryable");
        }
        assert!(DownloadError::chunk_transient(0, "reset").is_retryable());
    }
}

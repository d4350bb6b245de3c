use std::sync::Arc;

use reqwest::Client;
use rustls::{ClientConfig, crypto::aws_lc_rs};
use rustls_platform_verifier::BuilderVerifierExt;
use tracing::{debug, info};

use crate::config::{DownloaderConfig, HttpVersionPreference};
use crate::error::DownloadError;

/// Create a reqwest Client with the provided configuration
pub fn create_client(config: &DownloaderConfig) -> Result<Client, DownloadError> {
    let provider = Arc::new(aws_lc_rs::default_provider());

    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| DownloadError::Configuration {
            reason: format!("TLS protocol versions: {e}"),
        })?
        .with_platform_verifier()
        .map_err(|e| DownloadError::Configuration {
            reason: format!("TLS platform verifier: {e}"),
        })?
        .with_no_client_auth();

    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(config.pool_idle_timeout)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .use_preconfigured_tls(tls_config)
        .danger_accept_invalid_certs(config.danger_accept_invalid_certs)
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        client_builder = client_builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    if !config.read_timeout.is_zero() {
        client_builder = client_builder.read_timeout(config.read_timeout);
    }

    if let Some(interval) = config.http2_keep_alive_interval {
        client_builder = client_builder.tcp_keepalive(interval);
    }

    match config.http_version {
        HttpVersionPreference::Auto => {}
        HttpVersionPreference::Http2Only => {
            client_builder = client_builder.http2_prior_knowledge();
        }
        HttpVersionPreference::Http1Only => {
            client_builder = client_builder.http1_only();
        }
    }

    if config.force_ipv4 {
        client_builder =
            client_builder.local_address(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
    } else if config.force_ipv6 {
        client_builder =
            client_builder.local_address(std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED));
    }

    if let Some(proxy_config) = &config.proxy {
        // Explicit proxy configuration takes precedence
        client_builder = client_builder.proxy(proxy_config.build()?);
        info!(
            proxy_url = %proxy_config.display_url(),
            proxy_type = ?proxy_config.proxy_type,
            "Using explicitly configured proxy"
        );
    } else if config.use_system_proxy {
        // reqwest picks up system proxy settings unless no_proxy() is called
        debug!("Using system proxy settings");
    } else {
        client_builder = client_builder.no_proxy();
        debug!("Proxy disabled");
    }

    client_builder.build().map_err(DownloadError::from)
}

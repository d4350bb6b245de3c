//! Outbound proxy shared by every request of a transfer. Negotiation,
//! heartbeats and range fetches all leave through the same client, so the
//! delivery platform sees one address per session.

use std::fmt;

use reqwest::Proxy;
use url::Url;

use crate::error::DownloadError;

#[derive(Debug, Clone, PartialEq, Eq, Copy, Default)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ProxyType {
    #[default]
    Http,
    Https,
    Socks5,
}

impl ProxyType {
    /// Type named by the URL scheme, `None` for a bare `host:port`.
    pub fn from_url(url: &str) -> Option<Self> {
        let (scheme, _) = url.split_once("://")?;
        match scheme.to_ascii_lowercase().as_str() {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            "socks5" | "socks5h" => Some(Self::Socks5),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ProxyAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyAuth")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// e.g. "http://proxy.example.com:8080" or "127.0.0.1:1080"
    pub url: String,
    pub proxy_type: ProxyType,
    pub auth: Option<ProxyAuth>,
}

impl ProxyConfig {
    /// Proxy of the type the URL scheme names, HTTP when it names none.
    pub fn from_url(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            proxy_type: ProxyType::from_url(&url).unwrap_or_default(),
            url,
            auth: None,
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(ProxyAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// The URL with embedded credentials masked, for logging.
    pub fn display_url(&self) -> String {
        match Url::parse(&self.url) {
            Ok(mut url) if !url.username().is_empty() || url.password().is_some() => {
                // Only fails for URLs that cannot carry credentials at all.
                let _ = url.set_username("***");
                let _ = url.set_password(None);
                url.to_string()
            }
            _ => self.url.clone(),
        }
    }

    pub fn build(&self) -> Result<Proxy, DownloadError> {
        let invalid = |e: reqwest::Error| {
            DownloadError::proxy_configuration(format!(
                "invalid {:?} proxy `{}`: {e}",
                self.proxy_type,
                self.display_url()
            ))
        };

        let mut proxy = match self.proxy_type {
            ProxyType::Http => Proxy::http(&self.url).map_err(invalid)?,
            ProxyType::Https => Proxy::https(&self.url).map_err(invalid)?,
            ProxyType::Socks5 => Proxy::all(socks5_url(&self.url)).map_err(invalid)?,
        };

        if let Some(auth) = &self.auth {
            proxy = proxy.basic_auth(&auth.username, &auth.password);
        }
        Ok(proxy)
    }
}

fn socks5_url(proxy_url: &str) -> String {
    if matches!(ProxyType::from_url(proxy_url), Some(ProxyType::Socks5)) {
        proxy_url.to_string()
    } else {
        format!("socks5://{proxy_url}")
    }
}

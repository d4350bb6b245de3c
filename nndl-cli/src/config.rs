//! Effective settings: the optional TOML file overlaid with command-line flags.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use nndl_engine::{
    AuthContext, DownloaderConfig, EngineConfig, ProxyAuth, ProxyConfig, ProxyType,
    QualityConstraints, QualityRequest,
};
use serde::Deserialize;
use tracing::{debug, error};
use url::Url;

use crate::cli::{Args, DownloadArgs};
use crate::error::{AppError, Result};

/// Contents of the configuration file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub endpoint: Option<String>,
    pub cookies: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub params: BTreeMap<String, String>,
    pub user_agent: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub proxy: Option<String>,
    pub proxy_type: Option<String>,
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,

    pub output_dir: Option<PathBuf>,
    pub extension: Option<String>,
    pub video_quality: Option<String>,
    pub audio_quality: Option<String>,
    pub force_high_quality: bool,
    pub max_bitrate: Option<u64>,
    pub skip_existing: bool,
    pub workers: Option<usize>,
    pub max_concurrent: Option<usize>,
    pub chunk_retries: Option<u32>,
    pub missed_heartbeats: Option<u32>,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| AppError::Config(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }
}

/// Connection and credential settings shared by every command.
#[derive(Debug)]
pub struct PlatformSettings {
    pub endpoint: Url,
    pub http: DownloaderConfig,
    pub engine: EngineConfig,
    pub auth: Arc<AuthContext>,
}

/// What `download` does with each resource.
#[derive(Debug)]
pub struct DownloadSettings {
    pub output_dir: PathBuf,
    pub extension: String,
    pub constraints: QualityConstraints,
    pub skip_existing: bool,
    pub workers: Option<usize>,
    pub max_concurrent: usize,
}

impl PlatformSettings {
    pub fn resolve(args: &Args, file: &AppConfig) -> Result<Self> {
        let endpoint = args
            .endpoint
            .as_deref()
            .or(file.endpoint.as_deref())
            .ok_or_else(|| {
                AppError::InvalidInput(
                    "no delivery endpoint; pass --endpoint or set `endpoint` in the config file"
                        .to_string(),
                )
            })?;
        let endpoint = Url::parse(endpoint)
            .map_err(|e| AppError::InvalidInput(format!("invalid endpoint `{endpoint}`: {e}")))?;

        let cookies = match &args.cookies_file {
            Some(path) => Some(std::fs::read_to_string(path)?.trim().to_string()),
            None => args.cookies.clone().or_else(|| file.cookies.clone()),
        };

        let mut headers: Vec<(String, String)> = file
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        headers.extend(parse_headers(&args.headers)?);

        let mut params: Vec<(String, String)> = file
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        params.extend(parse_params(&args.params)?);

        let mut builder = DownloaderConfig::builder();
        for (key, value) in params {
            builder = builder.with_param(key, value);
        }
        if let Some(agent) = args.user_agent.as_ref().or(file.user_agent.as_ref()) {
            builder = builder.with_user_agent(agent.clone());
        }
        if let Some(secs) = args.connect_timeout.or(file.connect_timeout_secs) {
            builder = builder.with_connect_timeout(Duration::from_secs(secs));
        }
        if let Some(proxy) = proxy_config(args, file)? {
            builder = builder.with_proxy(proxy);
        }

        let mut engine = EngineConfig::default();
        if let Some(retries) = file.chunk_retries {
            engine.chunk_retry.max_retries = retries;
        }
        if let Some(tolerance) = file.missed_heartbeats {
            engine.heartbeat.missed_tolerance = tolerance.max(1);
        }

        Ok(Self {
            endpoint,
            http: builder.build(),
            engine,
            auth: Arc::new(AuthContext { cookies, headers }),
        })
    }
}

impl DownloadSettings {
    pub fn resolve(args: &DownloadArgs, file: &AppConfig) -> Result<Self> {
        let video = match (&args.video_quality, &file.video_quality) {
            (Some(request), _) => request.clone(),
            (None, Some(text)) => parse_quality(text)?,
            (None, None) => QualityRequest::Auto,
        };
        let audio = match (&args.audio_quality, &file.audio_quality) {
            (Some(request), _) => request.clone(),
            (None, Some(text)) => parse_quality(text)?,
            (None, None) => QualityRequest::Auto,
        };

        let constraints = QualityConstraints {
            video,
            audio,
            video_enabled: !args.no_video,
            audio_enabled: !args.no_audio,
            force_high_quality: args.force_high_quality || file.force_high_quality,
            max_bitrate: args.max_bitrate.or(file.max_bitrate),
        };

        let workers = args.workers.or(file.workers);
        if workers == Some(0) {
            return Err(AppError::InvalidInput("--workers must be at least 1".to_string()));
        }

        Ok(Self {
            output_dir: args
                .output_dir
                .clone()
                .or_else(|| file.output_dir.clone())
                .unwrap_or_else(|| PathBuf::from(".")),
            extension: args
                .extension
                .clone()
                .or_else(|| file.extension.clone())
                .unwrap_or_else(|| "mp4".to_string()),
            constraints,
            skip_existing: args.skip_existing || file.skip_existing,
            workers,
            max_concurrent: args.max_concurrent.or(file.max_concurrent).unwrap_or(1).max(1),
        })
    }

    /// Output path of one resource, `<output_dir>/<resource_id>.<extension>`.
    pub fn destination(&self, resource_id: &str) -> PathBuf {
        let name: String = resource_id
            .chars()
            .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
            .collect();
        self.output_dir
            .join(format!("{name}.{}", self.extension.trim_start_matches('.')))
    }
}

fn proxy_config(args: &Args, file: &AppConfig) -> Result<Option<ProxyConfig>> {
    let Some(url) = args.proxy.clone().or_else(|| file.proxy.clone()) else {
        return Ok(None);
    };

    let proxy_type = match (args.proxy_type, &file.proxy_type) {
        (Some(kind), _) => kind,
        (None, Some(text)) => ProxyType::from_str(text, true)
            .map_err(|e| AppError::Config(format!("invalid proxy_type `{text}`: {e}")))?,
        (None, None) => ProxyType::from_url(&url).unwrap_or_default(),
    };

    let username = args.proxy_username.clone().or_else(|| file.proxy_username.clone());
    let password = args.proxy_password.clone().or_else(|| file.proxy_password.clone());
    let auth = username.map(|username| ProxyAuth {
        username,
        password: password.unwrap_or_default(),
    });

    Ok(Some(ProxyConfig {
        url,
        proxy_type,
        auth,
    }))
}

fn parse_quality(text: &str) -> Result<QualityRequest> {
    text.parse()
        .map_err(|e| AppError::Config(format!("invalid quality `{text}`: {e}")))
}

/// Parses "key=value" strings, splitting at the first '='.
pub fn parse_params(params: &[String]) -> Result<Vec<(String, String)>> {
    params
        .iter()
        .map(|param| {
            param
                .split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| {
                    error!("Invalid param format: {param}");
                    AppError::InvalidInput(format!("Invalid param format: {param}"))
                })
        })
        .collect()
}

/// Parses "Name: value" strings.
pub fn parse_headers(headers: &[String]) -> Result<Vec<(String, String)>> {
    headers
        .iter()
        .map(|header| {
            header
                .split_once(':')
                .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
                .filter(|(name, _)| !name.is_empty())
                .ok_or_else(|| AppError::InvalidInput(format!("Invalid header format: {header}")))
        })
        .collect()
}

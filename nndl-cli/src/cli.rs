use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use nndl_engine::{ProxyType, QualityRequest};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Delivery API endpoint
    #[arg(long, env = "NNDL_ENDPOINT", global = true)]
    pub endpoint: Option<String>,

    /// TOML configuration file; explicit flags take precedence over it
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Raw Cookie header sent to the platform
    #[arg(long, global = true)]
    pub cookies: Option<String>,

    /// Read the Cookie header from a file
    #[arg(long, global = true, conflicts_with = "cookies")]
    pub cookies_file: Option<PathBuf>,

    /// Extra header required by the platform, as "Name: value"
    #[arg(short = 'H', long = "header", global = true)]
    pub headers: Vec<String>,

    /// Extra query parameter for session calls, as key=value
    #[arg(long = "param", global = true)]
    pub params: Vec<String>,

    #[arg(long, global = true)]
    pub user_agent: Option<String>,

    /// Connection timeout in seconds
    #[arg(long, global = true)]
    pub connect_timeout: Option<u64>,

    /// Proxy URL (e.g. "http://proxy.example.com:8080")
    #[arg(long, global = true)]
    pub proxy: Option<String>,

    #[arg(long, value_enum, global = true)]
    pub proxy_type: Option<ProxyType>,

    #[arg(long, global = true, requires = "proxy")]
    pub proxy_username: Option<String>,

    #[arg(long, global = true, requires = "proxy_username")]
    pub proxy_password: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Errors only
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable progress bars
    #[arg(long, global = true)]
    pub no_progress: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download one or more resources
    Download(DownloadArgs),

    /// Print the quality tiers offered for a resource
    ListQualities {
        resource_id: String,
    },
}

#[derive(ClapArgs, Debug)]
pub struct DownloadArgs {
    /// Resource ids to download
    #[arg(required = true)]
    pub resource_ids: Vec<String>,

    /// Output directory
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Extension of output files
    #[arg(long)]
    pub extension: Option<String>,

    /// auto, highest, lowest or a tier id
    #[arg(long)]
    pub video_quality: Option<QualityRequest>,

    /// auto, highest, lowest or a tier id
    #[arg(long)]
    pub audio_quality: Option<QualityRequest>,

    #[arg(long)]
    pub no_video: bool,

    #[arg(long)]
    pub no_audio: bool,

    /// Fail instead of falling back when the top tier is unavailable
    #[arg(long)]
    pub force_high_quality: bool,

    /// Prefer tiers at or below this bitrate (bits per second)
    #[arg(long)]
    pub max_bitrate: Option<u64>,

    /// Skip resources whose output files already exist
    #[arg(long)]
    pub skip_existing: bool,

    /// Concurrent range workers per tier
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Resources downloaded in parallel
    #[arg(short = 'j', long)]
    pub max_concurrent: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_download_flags() {
        let args = Args::try_parse_from([
            "nndl",
            "download",
            "sm9",
            "sm10",
            "--video-quality",
            "video_720p",
            "--no-audio",
            "-j",
            "2",
            "--endpoint",
            "https://api.example/v1",
        ])
        .unwrap();

        let Commands::Download(download) = args.command else {
            panic!("expected download");
        };
        assert_eq!(download.resource_ids, ["sm9", "sm10"]);
        assert_eq!(
            download.video_quality,
            Some(QualityRequest::Id("video_720p".to_string()))
        );
        assert!(download.no_audio);
        assert_eq!(download.max_concurrent, Some(2));
        assert_eq!(args.endpoint.as_deref(), Some("https://api.example/v1"));
    }
}

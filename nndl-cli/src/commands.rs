use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use indicatif::HumanBytes;
use nndl_engine::{
    DownloadError, EventSink, Manifest, TransferCoordinator, TransferOutcome, TransferRequest,
    create_client,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{DownloadSettings, PlatformSettings};
use crate::error::{AppError, Result};
use crate::progress;

pub struct CommandExecutor {
    coordinator: TransferCoordinator,
    auth: Arc<nndl_engine::AuthContext>,
}

impl CommandExecutor {
    pub fn new(platform: PlatformSettings) -> Result<Self> {
        let client = create_client(&platform.http)?;
        let coordinator = TransferCoordinator::http(
            client,
            platform.endpoint,
            platform.http.params.clone(),
            platform.engine,
        );
        Ok(Self {
            coordinator,
            auth: platform.auth,
        })
    }

    /// Download every resource, up to `max_concurrent` at a time. One
    /// failure does not stop the others.
    pub async fn download(
        &self,
        resource_ids: &[String],
        settings: &DownloadSettings,
        token: &CancellationToken,
    ) -> Result<()> {
        let started = Instant::now();
        info!(
            resources = resource_ids.len(),
            max_concurrent = settings.max_concurrent,
            output_dir = %settings.output_dir.display(),
            "Starting downloads"
        );

        let results: Vec<(String, std::result::Result<TransferOutcome, DownloadError>)> =
            futures::stream::iter(resource_ids.iter().cloned())
                .map(|resource_id| async move {
                    let result = self.download_one(&resource_id, settings, token).await;
                    (resource_id, result)
                })
                .buffer_unordered(settings.max_concurrent)
                .collect()
                .await;

        let mut failed = 0;
        let mut bytes = 0;
        for (resource_id, result) in &results {
            match result {
                Ok(TransferOutcome::Completed { files, .. }) => {
                    bytes += files.iter().map(|f| f.bytes).sum::<u64>();
                }
                Ok(TransferOutcome::AlreadyExists { .. }) => {
                    info!(resource = %resource_id, "Already downloaded");
                }
                Ok(TransferOutcome::Skipped) => {
                    info!(resource = %resource_id, "Skipped, no media kind enabled");
                }
                Err(DownloadError::Cancelled) => {
                    failed += 1;
                    warn!(resource = %resource_id, "Cancelled");
                }
                Err(e) => {
                    failed += 1;
                    error!(resource = %resource_id, error = %e, "Download failed");
                }
            }
        }

        info!(
            total = results.len(),
            failed,
            size = %HumanBytes(bytes),
            elapsed_secs = started.elapsed().as_secs(),
            "Downloads finished"
        );
        if failed > 0 {
            return Err(AppError::Incomplete {
                failed,
                total: results.len(),
            });
        }
        Ok(())
    }

    async fn download_one(
        &self,
        resource_id: &str,
        settings: &DownloadSettings,
        token: &CancellationToken,
    ) -> std::result::Result<TransferOutcome, DownloadError> {
        let mut request = TransferRequest::new(resource_id, settings.destination(resource_id));
        request.auth = Arc::clone(&self.auth);
        request.constraints = settings.constraints.clone();
        request.skip_existing = settings.skip_existing;
        request.worker_count = settings.workers;

        let (events, rx) = EventSink::channel();
        let reporter = tokio::spawn(progress::report(resource_id.to_string(), rx));
        let coordinator = self.coordinator.reporting_to(events);

        let result = coordinator.run(&request, token).await;
        drop(coordinator);
        if let Err(e) = reporter.await {
            warn!(resource = %resource_id, error = %e, "Progress reporter failed");
        }
        result
    }

    pub async fn list_qualities(&self, resource_id: &str, token: &CancellationToken) -> Result<()> {
        let manifest = self
            .coordinator
            .list_qualities(resource_id, Arc::clone(&self.auth), token)
            .await?;
        print!("{}", render_manifest(&manifest));
        Ok(())
    }
}

fn render_manifest(manifest: &Manifest) -> String {
    let id_width = manifest
        .tiers()
        .iter()
        .map(|tier| tier.id.len())
        .max()
        .unwrap_or(0)
        .max(2);

    let mut out = format!("{:<id_width$}  {:<5}  {:<24}  AVAILABLE\n", "ID", "KIND", "QUALITY");
    for tier in manifest.tiers() {
        out.push_str(&format!(
            "{:<id_width$}  {:<5}  {:<24}  {}\n",
            tier.id,
            tier.kind.as_str(),
            tier.descriptor.to_string(),
            if tier.available { "yes" } else { "no" },
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use nndl_engine::session::TierDescriptor;
    use nndl_engine::{MediaKind, QualityTier};
    use url::Url;

    #[test]
    fn manifest_table_lists_every_tier() {
        let tier = |id: &str, kind, available| QualityTier {
            id: id.to_string(),
            kind,
            descriptor: TierDescriptor {
                bitrate: 192_000,
                sampling_rate: Some(48_000),
                ..TierDescriptor::default()
            },
            url: Url::parse("https://cdn.example/a.mp4").unwrap(),
            available,
        };
        let manifest = Manifest::new(vec![
            tier("audio_192", MediaKind::Audio, true),
            tier("audio_64_low", MediaKind::Audio, false),
        ])
        .unwrap();

        let table = render_manifest(&manifest);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ID"));
        assert!(lines[1].starts_with("audio_192     audio  48.0kHz@192kbps"));
        assert!(lines[1].ends_with("yes"));
        assert!(lines[2].ends_with("no"));
    }
}

//! Tier selection.
//!
//! Selection is a pure function of the manifest and the caller's
//! constraints: no hidden state, so the same inputs always yield the same
//! tiers. A renegotiated manifest is checked against an earlier
//! [`Selection`] with [`QualitySelector::revalidate`].

use std::fmt;

use tracing::{debug, warn};

use crate::error::DownloadError;
use crate::session::{Manifest, MediaKind, QualityTier};

/// What the caller asks for, per media kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum QualityRequest {
    /// Best available tier, falling back down the ladder
    #[default]
    Auto,
    /// The top tier or nothing
    Highest,
    /// The bottom tier or nothing
    Lowest,
    /// A specific tier id, matched case-insensitively
    Id(String),
}

impl QualityRequest {
    fn is_explicit(&self) -> bool {
        !matches!(self, QualityRequest::Auto)
    }
}

impl std::str::FromStr for QualityRequest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_lowercase().as_str() {
            "" => Err("quality request cannot be empty".to_string()),
            "auto" => Ok(QualityRequest::Auto),
            "highest" | "best" => Ok(QualityRequest::Highest),
            "lowest" | "worst" => Ok(QualityRequest::Lowest),
            _ => Ok(QualityRequest::Id(trimmed.to_string())),
        }
    }
}

impl fmt::Display for QualityRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityRequest::Auto => write!(f, "auto"),
            QualityRequest::Highest => write!(f, "highest"),
            QualityRequest::Lowest => write!(f, "lowest"),
            QualityRequest::Id(id) => write!(f, "{id}"),
        }
    }
}

/// User constraints applied to a manifest.
#[derive(Debug, Clone)]
pub struct QualityConstraints {
    pub video: QualityRequest,
    pub audio: QualityRequest,
    pub video_enabled: bool,
    pub audio_enabled: bool,
    /// Refuse to fall back when the top tier of a kind is unavailable.
    /// Overrides explicit per-kind requests.
    pub force_high_quality: bool,
    /// Bandwidth hint in bits per second for `Auto` selection
    pub max_bitrate: Option<u64>,
}

impl Default for QualityConstraints {
    fn default() -> Self {
        Self {
            video: QualityRequest::Auto,
            audio: QualityRequest::Auto,
            video_enabled: true,
            audio_enabled: true,
            force_high_quality: false,
            max_bitrate: None,
        }
    }
}

impl QualityConstraints {
    pub fn is_enabled(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Video => self.video_enabled,
            MediaKind::Audio => self.audio_enabled,
        }
    }

    pub fn request(&self, kind: MediaKind) -> &QualityRequest {
        match kind {
            MediaKind::Video => &self.video,
            MediaKind::Audio => &self.audio,
        }
    }

    /// Enabled kinds in transfer order.
    pub fn enabled_kinds(&self) -> impl Iterator<Item = MediaKind> + '_ {
        MediaKind::ALL
            .into_iter()
            .filter(move |kind| self.is_enabled(*kind))
    }

    /// True when there is nothing to fetch at all.
    pub fn nothing_enabled(&self) -> bool {
        !self.video_enabled && !self.audio_enabled
    }

    /// Hint passed to the platform at negotiation time, if the caller named
    /// a specific tier.
    pub fn hint(&self, kind: MediaKind) -> Option<String> {
        match self.request(kind) {
            QualityRequest::Id(id) if self.is_enabled(kind) => Some(id.clone()),
            _ => None,
        }
    }
}

/// Tiers chosen for one transfer, at most one per kind, video first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    tiers: Vec<QualityTier>,
}

impl Selection {
    pub fn tiers(&self) -> &[QualityTier] {
        &self.tiers
    }

    pub fn get(&self, kind: MediaKind) -> Option<&QualityTier> {
        self.tiers.iter().find(|tier| tier.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QualitySelector;

impl QualitySelector {
    pub fn select(
        &self,
        manifest: &Manifest,
        constraints: &QualityConstraints,
    ) -> Result<Selection, DownloadError> {
        let tiers = constraints
            .enabled_kinds()
            .map(|kind| select_kind(manifest, kind, constraints).cloned())
            .collect::<Result<Vec<_>, _>>()?;

        for tier in &tiers {
            debug!(
                kind = %tier.kind,
                tier = %tier.id,
                descriptor = %tier.descriptor,
                "Selected quality tier"
            );
        }
        Ok(Selection { tiers })
    }

    /// Resolve an earlier selection against a fresh manifest. Every tier id
    /// must still be present and available; the tiers are taken from the new
    /// manifest so their URLs are current.
    pub fn revalidate(
        &self,
        manifest: &Manifest,
        previous: &Selection,
    ) -> Result<Selection, DownloadError> {
        let tiers = previous
            .tiers
            .iter()
            .map(|old| match manifest.get(&old.id) {
                Some(tier) if tier.available && tier.kind == old.kind => Ok(tier.clone()),
                _ => Err(DownloadError::QualityUnavailable {
                    kind: old.kind,
                    requested: old.id.clone(),
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Selection { tiers })
    }
}

fn select_kind<'a>(
    manifest: &'a Manifest,
    kind: MediaKind,
    constraints: &QualityConstraints,
) -> Result<&'a QualityTier, DownloadError> {
    let ladder: Vec<&QualityTier> = manifest.of_kind(kind).collect();
    let (Some(&top), Some(&bottom)) = (ladder.first(), ladder.last()) else {
        return Err(DownloadError::NoQualityAvailable { kind });
    };

    let mut request = constraints.request(kind);
    if constraints.force_high_quality {
        if request.is_explicit() && *request != QualityRequest::Highest {
            warn!(
                %kind,
                requested = %request,
                "Ignoring explicit quality request because high quality is forced"
            );
        }
        request = &QualityRequest::Highest;
    }

    let unavailable = |id: &str| DownloadError::QualityUnavailable {
        kind,
        requested: id.to_string(),
    };

    match request {
        QualityRequest::Id(wanted) => ladder
            .iter()
            .find(|tier| tier.id.eq_ignore_ascii_case(wanted))
            .filter(|tier| tier.available)
            .copied()
            .ok_or_else(|| unavailable(wanted)),
        QualityRequest::Highest if top.available => Ok(top),
        QualityRequest::Highest => Err(unavailable(&top.id)),
        QualityRequest::Lowest if bottom.available => Ok(bottom),
        QualityRequest::Lowest => Err(unavailable(&bottom.id)),
        QualityRequest::Auto => {
            let mut available = ladder.iter().copied().filter(|tier| tier.available).peekable();
            let Some(best) = available.peek().copied() else {
                return Err(DownloadError::NoQualityAvailable { kind });
            };
            let Some(limit) = constraints.max_bitrate else {
                return Ok(best);
            };

            let mut lowest = best;
            for tier in available {
                if tier.descriptor.bitrate <= limit {
                    return Ok(tier);
                }
                lowest = tier;
            }
            debug!(%kind, limit, tier = %lowest.id, "No tier fits the bitrate hint, taking the lowest");
            Ok(lowest)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::tier;

    fn ladder() -> Manifest {
        Manifest::new(vec![
            tier("video_1080p", MediaKind::Video, 1080, 6_000_000, true),
            tier("video_720p", MediaKind::Video, 720, 2_000_000, true),
            tier("video_480p", MediaKind::Video, 480, 1_200_000, true),
            tier("video_360p", MediaKind::Video, 360, 600_000, true),
            tier("video_144p", MediaKind::Video, 144, 150_000, true),
            tier("audio_192", MediaKind::Audio, 48_000, 192_000, true),
            tier("audio_128", MediaKind::Audio, 48_000, 128_000, true),
            tier("audio_96", MediaKind::Audio, 44_100, 96_000, true),
            tier("audio_64", MediaKind::Audio, 44_100, 64_000, true),
            tier("audio_32", MediaKind::Audio, 22_050, 32_000, true),
        ])
        .unwrap()
    }

    fn with_unavailable(ids: &[&str]) -> Manifest {
        let tiers = ladder()
            .tiers()
            .iter()
            .cloned()
            .map(|mut t| {
                t.available = !ids.contains(&t.id.as_str());
                t
            })
            .collect();
        Manifest::new(tiers).unwrap()
    }

    fn ids(selection: &Selection) -> Vec<&str> {
        selection.tiers().iter().map(|t| t.id.as_str()).collect()
    }

    #[test]
    fn audio_disabled_selects_exactly_one_video_tier() {
        let constraints = QualityConstraints {
            audio_enabled: false,
            ..Default::default()
        };
        let selection = QualitySelector.select(&ladder(), &constraints).unwrap();
        assert_eq!(ids(&selection), ["video_1080p"]);
        assert!(selection.get(MediaKind::Audio).is_none());
    }

    #[test]
    fn default_selects_best_of_each_kind_video_first() {
        let selection = QualitySelector
            .select(&ladder(), &QualityConstraints::default())
            .unwrap();
        assert_eq!(ids(&selection), ["video_1080p", "audio_192"]);
    }

    #[test]
    fn default_falls_back_to_next_available() {
        let manifest = with_unavailable(&["video_1080p", "video_720p", "audio_192"]);
        let selection = QualitySelector
            .select(&manifest, &QualityConstraints::default())
            .unwrap();
        assert_eq!(ids(&selection), ["video_480p", "audio_128"]);
    }

    #[test]
    fn nothing_available_is_an_error() {
        let manifest = with_unavailable(&["audio_192", "audio_128", "audio_96", "audio_64", "audio_32"]);
        let err = QualitySelector
            .select(&manifest, &QualityConstraints::default())
            .unwrap_err();
        assert!(matches!(err, DownloadError::NoQualityAvailable { kind: MediaKind::Audio }));
    }

    #[test]
    fn enabled_kind_without_tiers_is_an_error() {
        let manifest = Manifest::new(vec![tier("v", MediaKind::Video, 720, 1, true)]).unwrap();
        let err = QualitySelector
            .select(&manifest, &QualityConstraints::default())
            .unwrap_err();
        assert!(matches!(err, DownloadError::NoQualityAvailable { kind: MediaKind::Audio }));
    }

    #[test]
    fn forced_unavailable_tier_never_downgrades() {
        let manifest = with_unavailable(&["video_720p"]);
        let constraints = QualityConstraints {
            video: QualityRequest::Id("video_720p".into()),
            audio_enabled: false,
            ..Default::default()
        };
        let err = QualitySelector.select(&manifest, &constraints).unwrap_err();
        assert!(matches!(
            err,
            DownloadError::QualityUnavailable { kind: MediaKind::Video, ref requested } if requested == "video_720p"
        ));

        let unknown = QualityConstraints {
            video: QualityRequest::Id("video_4k".into()),
            ..constraints
        };
        assert!(matches!(
            QualitySelector.select(&manifest, &unknown),
            Err(DownloadError::QualityUnavailable { .. })
        ));
    }

    #[test]
    fn forced_id_matches_case_insensitively() {
        let constraints = QualityConstraints {
            video: QualityRequest::Id("VIDEO_360P".into()),
            audio: "audio_64".parse().unwrap(),
            ..Default::default()
        };
        let selection = QualitySelector.select(&ladder(), &constraints).unwrap();
        assert_eq!(ids(&selection), ["video_360p", "audio_64"]);
    }

    #[test]
    fn force_high_quality_fails_when_top_is_unavailable() {
        let manifest = with_unavailable(&["video_1080p"]);
        let constraints = QualityConstraints {
            force_high_quality: true,
            ..Default::default()
        };
        let err = QualitySelector.select(&manifest, &constraints).unwrap_err();
        assert!(matches!(err, DownloadError::QualityUnavailable { kind: MediaKind::Video, .. }));
    }

    #[test]
    fn force_high_quality_overrides_explicit_requests() {
        let constraints = QualityConstraints {
            video: QualityRequest::Lowest,
            force_high_quality: true,
            ..Default::default()
        };
        let selection = QualitySelector.select(&ladder(), &constraints).unwrap();
        assert_eq!(ids(&selection), ["video_1080p", "audio_192"]);
    }

    #[test]
    fn lowest_requires_the_bottom_tier() {
        let constraints = QualityConstraints {
            video: QualityRequest::Lowest,
            audio_enabled: false,
            ..Default::default()
        };
        let selection = QualitySelector.select(&ladder(), &constraints).unwrap();
        assert_eq!(ids(&selection), ["video_144p"]);

        let manifest = with_unavailable(&["video_144p"]);
        assert!(QualitySelector.select(&manifest, &constraints).is_err());
    }

    #[test]
    fn bitrate_hint_picks_best_fitting_tier() {
        let constraints = QualityConstraints {
            max_bitrate: Some(1_500_000),
            audio_enabled: false,
            ..Default::default()
        };
        let selection = QualitySelector.select(&ladder(), &constraints).unwrap();
        assert_eq!(ids(&selection), ["video_480p"]);

        let tiny = QualityConstraints {
            max_bitrate: Some(1_000),
            ..constraints
        };
        let selection = QualitySelector.select(&ladder(), &tiny).unwrap();
        assert_eq!(ids(&selection), ["video_144p"]);
    }

    #[test]
    fn revalidate_uses_fresh_tiers_and_rejects_missing_ids() {
        let selection = QualitySelector
            .select(&ladder(), &QualityConstraints::default())
            .unwrap();

        let renewed = QualitySelector.revalidate(&ladder(), &selection).unwrap();
        assert_eq!(renewed, selection);

        let shrunk = Manifest::new(vec![tier("audio_192", MediaKind::Audio, 48_000, 192_000, true)])
            .unwrap();
        let err = QualitySelector.revalidate(&shrunk, &selection).unwrap_err();
        assert!(matches!(
            err,
            DownloadError::QualityUnavailable { ref requested, .. } if requested == "video_1080p"
        ));

        let withdrawn = with_unavailable(&["audio_192"]);
        assert!(QualitySelector.revalidate(&withdrawn, &selection).is_err());
    }

    #[test]
    fn parses_requests() {
        assert_eq!("auto".parse::<QualityRequest>().unwrap(), QualityRequest::Auto);
        assert_eq!("Best".parse::<QualityRequest>().unwrap(), QualityRequest::Highest);
        assert_eq!("worst".parse::<QualityRequest>().unwrap(), QualityRequest::Lowest);
        assert_eq!(
            " archive_h264_720p ".parse::<QualityRequest>().unwrap(),
            QualityRequest::Id("archive_h264_720p".into())
        );
        assert!("  ".parse::<QualityRequest>().is_err());
    }
}

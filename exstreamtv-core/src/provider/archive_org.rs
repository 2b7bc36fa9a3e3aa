// Archive.org resolution

use async_trait::async_trait;
use serde_json::Value;

use crate::models::MediaRef;

use super::error::{ResolveError, Result};
use super::{ResolvedSource, SourceResolver, SourceUriKind};

const METADATA_BASE: &str = "https://archive.org/metadata";
const DOWNLOAD_BASE: &str = "https://archive.org/download";

/// Resolves `MediaRef::ArchiveOrg` handles.
///
/// A handle is `identifier` or `identifier/file.ext`; with a bare identifier
/// the first playable file of the item is used.
pub struct ArchiveOrgResolver {
    client: reqwest::Client,
}

impl ArchiveOrgResolver {
    #[must_use]
    pub fn new(timeout_seconds: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_seconds))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for ArchiveOrgResolver {
    fn default() -> Self {
        Self::new(15)
    }
}

fn is_playable(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    [".mp4", ".mkv", ".avi", ".mpg", ".mpeg", ".ts", ".webm", ".ogv"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}

#[async_trait]
impl SourceResolver for ArchiveOrgResolver {
    fn kind(&self) -> &'static str {
        "archive_org"
    }

    async fn resolve(&self, media_ref: &MediaRef) -> Result<ResolvedSource> {
        let MediaRef::ArchiveOrg { handle } = media_ref else {
            return Err(ResolveError::Ambiguous(format!(
                "archive.org resolver given {} ref",
                media_ref.kind_str()
            )));
        };

        let (identifier, file) = match handle.split_once('/') {
            Some((id, f)) => (id.to_string(), Some(f.to_string())),
            None => (handle.clone(), None),
        };

        let response = self
            .client
            .get(format!("{METADATA_BASE}/{identifier}"))
            .send()
            .await
            .map_err(|e| ResolveError::from_http("archive_org", &e))?
            .error_for_status()
            .map_err(|e| ResolveError::from_http("archive_org", &e))?;
        let metadata: Value = response
            .json()
            .await
            .map_err(|e| ResolveError::from_http("archive_org", &e))?;

        let files = metadata["files"].as_array().cloned().unwrap_or_default();
        if files.is_empty() {
            return Err(ResolveError::NotFound(format!("archive.org item {identifier}")));
        }

        let chosen = match file {
            Some(name) => {
                let found = files.iter().any(|f| f["name"].as_str() == Some(name.as_str()));
                if !found {
                    return Err(ResolveError::NotFound(format!("{identifier}/{name}")));
                }
                name
            }
            None => {
                let mut playable: Vec<&str> = files
                    .iter()
                    .filter_map(|f| f["name"].as_str())
                    .filter(|n| is_playable(n))
                    .collect();
                playable.sort_unstable();
                match playable.first() {
                    Some(name) => (*name).to_string(),
                    None => {
                        return Err(ResolveError::Ambiguous(format!(
                            "archive.org item {identifier} has no playable file"
                        )))
                    }
                }
            }
        };

        let container = chosen.rsplit('.').next().map(str::to_ascii_lowercase);
        Ok(ResolvedSource {
            primary_uri: format!("{DOWNLOAD_BASE}/{identifier}/{chosen}"),
            kind: SourceUriKind::Http,
            duration_known: None,
            container_hint: container,
            video_codec: None,
            audio_codec: None,
            subtitles: Vec::new(),
            audio_streams: Vec::new(),
            picks: super::StreamPicks::default(),
            direct_play_candidate: false,
            expires_at: None,
        })
    }
}

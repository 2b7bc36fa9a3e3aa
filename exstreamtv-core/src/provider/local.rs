// Local file and filler resolution

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::models::MediaRef;

use super::error::{ResolveError, Result};
use super::{ResolvedSource, SourceResolver, SourceUriKind};

/// Resolves `MediaRef::Local` paths against the media root.
pub struct LocalFileResolver {
    media_root: PathBuf,
}

impl LocalFileResolver {
    #[must_use]
    pub fn new(media_root: impl Into<PathBuf>) -> Self {
        Self { media_root: media_root.into() }
    }

    fn absolute(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.media_root.join(p)
        }
    }
}

#[async_trait]
impl SourceResolver for LocalFileResolver {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn resolve(&self, media_ref: &MediaRef) -> Result<ResolvedSource> {
        let MediaRef::Local { path } = media_ref else {
            return Err(ResolveError::Ambiguous(format!(
                "local resolver given {} ref",
                media_ref.kind_str()
            )));
        };
        let full = self.absolute(path);
        let metadata = tokio::fs::metadata(&full)
            .await
            .map_err(|_| ResolveError::NotFound(full.display().to_string()))?;
        if !metadata.is_file() {
            return Err(ResolveError::NotFound(full.display().to_string()));
        }

        let container = full
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);

        Ok(ResolvedSource {
            primary_uri: full.display().to_string(),
            kind: SourceUriKind::File,
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

/// Resolves `MediaRef::Filler` presets: one subdirectory per preset, first
/// file in name order so restarts pick the same filler.
pub struct FillerResolver {
    filler_root: PathBuf,
}

impl FillerResolver {
    #[must_use]
    pub fn new(filler_root: impl Into<PathBuf>) -> Self {
        Self { filler_root: filler_root.into() }
    }
}

#[async_trait]
impl SourceResolver for FillerResolver {
    fn kind(&self) -> &'static str {
        "filler"
    }

    async fn resolve(&self, media_ref: &MediaRef) -> Result<ResolvedSource> {
        let MediaRef::Filler { preset } = media_ref else {
            return Err(ResolveError::Ambiguous(format!(
                "filler resolver given {} ref",
                media_ref.kind_str()
            )));
        };
        let dir = self.filler_root.join(preset);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|_| ResolveError::NotFound(dir.display().to_string()))?;

        let mut files: Vec<PathBuf> = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        let Some(first) = files.into_iter().next() else {
            return Err(ResolveError::NotFound(format!("empty filler preset {preset}")));
        };

        Ok(ResolvedSource {
            primary_uri: first.display().to_string(),
            kind: SourceUriKind::File,
            duration_known: None,
            container_hint: first
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_ascii_lowercase),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_local_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = LocalFileResolver::new(dir.path());
        let err = resolver
            .resolve(&MediaRef::Local { path: "ghost.mkv".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));
    }

    #[tokio::test]
    async fn local_file_resolves_with_container_hint() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("movie.mkv"), b"x").unwrap();
        let resolver = LocalFileResolver::new(dir.path());

        let resolved = resolver
            .resolve(&MediaRef::Local { path: "movie.mkv".into() })
            .await
            .unwrap();
        assert_eq!(resolved.kind, SourceUriKind::File);
        assert_eq!(resolved.container_hint.as_deref(), Some("mkv"));
        assert!(resolved.primary_uri.ends_with("movie.mkv"));
    }

    #[tokio::test]
    async fn filler_preset_picks_first_file_deterministically() {
        let dir = tempfile::tempdir().unwrap();
        let preset = dir.path().join("bumpers");
        std::fs::create_dir(&preset).unwrap();
        std::fs::write(preset.join("b.ts"), b"x").unwrap();
        std::fs::write(preset.join("a.ts"), b"x").unwrap();
        let resolver = FillerResolver::new(dir.path());

        let resolved = resolver
            .resolve(&MediaRef::Filler { preset: "bumpers".into() })
            .await
            .unwrap();
        assert!(resolved.primary_uri.ends_with("a.ts"));
    }

    #[tokio::test]
    async fn wrong_ref_kind_is_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = LocalFileResolver::new(dir.path());
        let err = resolver
            .resolve(&MediaRef::YouTube { handle: "abc".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Ambiguous(_)));
    }
}

// Resolver facade
//
// Routes a MediaRef to its kind's resolver, caches short-lived URLs with a
// TTL, and applies the subtitle/audio picks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tracing::{debug, warn};

use crate::clock::{Clock, SharedClock};
use crate::models::MediaRef;

use super::archive_org::ArchiveOrgResolver;
use super::config::ProvidersConfig;
use super::emby::EmbyResolver;
use super::error::{ResolveError, Result};
use super::jellyfin::JellyfinResolver;
use super::local::{FillerResolver, LocalFileResolver};
use super::picks::pick_streams;
use super::plex::PlexResolver;
use super::youtube::YouTubeResolver;
use super::{ResolvedSource, SourceResolver};

/// Single entry point for media resolution.
pub struct MediaResolver {
    resolvers: HashMap<&'static str, Arc<dyn SourceResolver>>,
    cache: Cache<String, ResolvedSource>,
    clock: SharedClock,
    preferred_language: Option<String>,
    max_audio_channels: u32,
}

impl MediaResolver {
    /// Assemble the facade from configuration; kinds without configuration
    /// simply have no resolver and fail with `NotFound`.
    #[must_use]
    pub fn from_config(
        config: &ProvidersConfig,
        max_audio_channels: u32,
        clock: SharedClock,
    ) -> Self {
        let mut resolvers: HashMap<&'static str, Arc<dyn SourceResolver>> = HashMap::new();
        resolvers.insert(
            "local",
            Arc::new(LocalFileResolver::new(&config.media_root)) as Arc<dyn SourceResolver>,
        );
        resolvers.insert(
            "filler",
            Arc::new(FillerResolver::new(&config.filler_root)) as Arc<dyn SourceResolver>,
        );
        resolvers.insert("archive_org", Arc::new(ArchiveOrgResolver::default()));
        if let Some(plex) = &config.plex {
            resolvers.insert("plex", Arc::new(PlexResolver::new(plex.clone())));
        }
        if let Some(jellyfin) = &config.jellyfin {
            resolvers.insert("jellyfin", Arc::new(JellyfinResolver::new(jellyfin.clone())));
        }
        if let Some(emby) = &config.emby {
            resolvers.insert("emby", Arc::new(EmbyResolver::new(emby.clone())));
        }
        if let Some(youtube) = &config.youtube {
            resolvers.insert("youtube", Arc::new(YouTubeResolver::new(youtube.clone())));
        }

        Self::new(
            resolvers,
            config.url_cache_seconds,
            config.preferred_language.clone(),
            max_audio_channels,
            clock,
        )
    }

    #[must_use]
    pub fn new(
        resolvers: HashMap<&'static str, Arc<dyn SourceResolver>>,
        url_cache_seconds: u64,
        preferred_language: Option<String>,
        max_audio_channels: u32,
        clock: SharedClock,
    ) -> Self {
        Self {
            resolvers,
            cache: Cache::builder()
                .max_capacity(4096)
                .time_to_live(Duration::from_secs(url_cache_seconds.max(1)))
                .build(),
            clock,
            preferred_language,
            max_audio_channels,
        }
    }

    /// Resolve a media reference to a playable source.
    ///
    /// `AuthExpired` from the backend triggers exactly one credential refresh
    /// and retry; every other failure classification is returned as-is.
    pub async fn resolve(&self, media_ref: &MediaRef) -> Result<ResolvedSource> {
        let key = cache_key(media_ref);

        if let Some(cached) = self.cache.get(&key).await {
            if !cached.is_expired(self.clock.wall_now()) {
                return Ok(cached);
            }
            debug!(media = %key, "Cached resolution expired, re-resolving");
            self.cache.invalidate(&key).await;
        }

        let resolver = self
            .resolvers
            .get(media_ref.kind_str())
            .ok_or_else(|| {
                ResolveError::NotFound(format!("no resolver for kind {}", media_ref.kind_str()))
            })?
            .clone();

        let mut resolved = match resolver.resolve(media_ref).await {
            Ok(r) => r,
            Err(ResolveError::AuthExpired(context)) => {
                warn!(media = %key, %context, "Auth expired, refreshing once");
                resolver.refresh_auth().await?;
                resolver.resolve(media_ref).await?
            }
            Err(e) => return Err(e),
        };

        resolved.picks = pick_streams(
            &resolved.subtitles,
            &resolved.audio_streams,
            self.preferred_language.as_deref(),
            self.max_audio_channels,
        );

        self.cache.insert(key, resolved.clone()).await;
        Ok(resolved)
    }

    /// Drop any cached resolution for the reference (used before retries that
    /// must see a fresh URL).
    pub async fn invalidate(&self, media_ref: &MediaRef) {
        self.cache.invalidate(&cache_key(media_ref)).await;
    }
}

fn cache_key(media_ref: &MediaRef) -> String {
    serde_json::to_string(media_ref).unwrap_or_else(|_| format!("{media_ref:?}"))
}

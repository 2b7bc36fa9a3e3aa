// Module: http
// Client-facing HTTP surface: IPTV, HDHomeRun emulation, health, metrics.

pub mod error;
pub mod hdhomerun;
pub mod health;
pub mod iptv;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use exstreamtv_core::playout::PlayoutTimeline;
use exstreamtv_core::service::{ChannelManager, ProcessPool, SessionManager};
use exstreamtv_core::Config;

use crate::lineup::{build_lineup, LineupEntry};

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub channels: Arc<ChannelManager>,
    pub sessions: Arc<SessionManager>,
    pub timeline: Arc<PlayoutTimeline>,
    pub pool: Arc<ProcessPool>,
    /// Absolute base for every advertised URL.
    pub base_url: String,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        channels: Arc<ChannelManager>,
        sessions: Arc<SessionManager>,
        timeline: Arc<PlayoutTimeline>,
        pool: Arc<ProcessPool>,
    ) -> Self {
        let base_url = resolve_base_url(&config);
        Self {
            config,
            channels,
            sessions,
            timeline,
            pool,
            base_url,
        }
    }

    /// The unified lineup view every client document projects from.
    #[must_use]
    pub fn lineup(&self) -> Vec<LineupEntry> {
        let runtimes = self.channels.list();
        let channels: Vec<_> = runtimes.iter().map(|r| r.channel().clone()).collect();
        build_lineup(channels.iter(), &self.base_url)
    }
}

/// Advertised base URL: explicit config wins, else local IP + port.
fn resolve_base_url(config: &Config) -> String {
    if !config.server.base_url.is_empty() {
        return config.server.base_url.trim_end_matches('/').to_string();
    }
    let ip = local_ip_address::local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string());
    format!("http://{}:{}", ip, config.server.http_port)
}

/// Create the HTTP router.
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health::health))
        .route("/metrics", get(health::prometheus_metrics))
        // IPTV surface
        .route("/iptv/channels.m3u", get(iptv::playlist))
        .route("/iptv/xmltv.xml", get(iptv::xmltv))
        .route("/iptv/channel/{number}", get(iptv::stream))
        // HDHomeRun emulation
        .route("/discover.json", get(hdhomerun::discover))
        .route("/hdhomerun/discover.json", get(hdhomerun::discover))
        .route("/lineup.json", get(hdhomerun::lineup))
        .route("/lineup_status.json", get(hdhomerun::lineup_status));

    // One fixed route per tuner, as real devices expose them.
    for tuner in 0..state.config.hdhomerun.tuner_count {
        router = router.route(
            &format!("/tuner{tuner}/stream"),
            get(hdhomerun::tuner_stream),
        );
    }

    router
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

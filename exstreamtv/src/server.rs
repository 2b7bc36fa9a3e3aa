//! Service assembly and lifecycle.
//!
//! Builds every owned service at startup, wires them together explicitly and
//! drives the bounded-grace shutdown sequence. There is no process-wide
//! state: tests assemble their own instances the same way.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use exstreamtv_api::http::{create_router, AppState};
use exstreamtv_core::clock::system_clock;
use exstreamtv_core::playout::PlayoutTimeline;
use exstreamtv_core::provider::MediaResolver;
use exstreamtv_core::repository::{AnchorRepository, ChannelRepository, ScheduleRepository, StateStore};
use exstreamtv_core::schedule::{CollectionSource, Collections};
use exstreamtv_core::service::{
    ChannelManager, CircuitBreaker, ProcessPool, RestartGovernor, RuntimeDeps, SessionManager,
};
use exstreamtv_core::source::ErrorScreenConfig;
use exstreamtv_core::Config;

/// Shutdown grace before remaining transcoders are force-killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// How often the unrecoverable-runtime watchdog looks at channel health.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

/// Exit code for an unrecoverable runtime (every channel failed, breaker open).
pub const EXIT_UNRECOVERABLE: i32 = 2;

pub struct Server {
    config: Arc<Config>,
}

impl Server {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Run until shutdown; returns the process exit code.
    pub async fn run(self) -> Result<i32> {
        let config = Arc::clone(&self.config);
        let clock = system_clock();

        // Persistence layer.
        let store = Arc::new(
            StateStore::new(&config.state.state_dir)
                .with_context(|| format!("opening state dir {}", config.state.state_dir))?,
        );
        let channel_repo = ChannelRepository::new(Arc::clone(&store));
        let schedule_repo = ScheduleRepository::new(Arc::clone(&store));
        let collections: Arc<Collections> = Arc::new(
            store
                .read("collections.json")
                .context("reading collections.json")?
                .unwrap_or_default(),
        );

        // Core services, owned here and passed explicitly.
        let timeline = Arc::new(PlayoutTimeline::new(
            AnchorRepository::new(Arc::clone(&store)),
            Arc::clone(&store),
            clock.clone(),
            config.playout.clone(),
        ));
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone(), clock.clone()));
        let governor = Arc::new(RestartGovernor::new(
            config.restart.clone(),
            breaker,
            clock.clone(),
        ));
        let pool = ProcessPool::new(config.pool.clone(), clock.clone());
        let _reaper = pool.spawn_reaper();
        let resolver = Arc::new(MediaResolver::from_config(
            &config.providers,
            config.transcode.max_audio_channels,
            clock.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            config.session.clone(),
            clock.clone(),
            Some(Arc::clone(&store)),
        ));
        let _sweeper = sessions.spawn_sweeper();

        let deps = Arc::new(RuntimeDeps {
            pool: Arc::clone(&pool),
            governor: Arc::clone(&governor),
            timeline: Arc::clone(&timeline),
            resolver,
            sessions: Arc::clone(&sessions),
            clock,
            playout: config.playout.clone(),
            transcode: config.transcode.clone(),
            pool_config: config.pool.clone(),
            error_screen: ErrorScreenConfig::default(),
        });
        let channels = Arc::new(ChannelManager::new(Arc::clone(&deps)));

        // Register and start every enabled channel.
        let enabled = channel_repo.load_enabled().context("loading channels")?;
        info!(count = enabled.len(), "Starting enabled channels");
        for channel in enabled {
            match schedule_repo.load_optional(&channel.id) {
                Ok(Some(schedule)) => {
                    let view: Arc<dyn CollectionSource> = Arc::clone(&collections) as Arc<dyn CollectionSource>;
                    if let Err(e) = timeline.register(&channel, &schedule, view) {
                        error!(channel = %channel.id, error = %e, "Failed to register playout");
                        continue;
                    }
                    channels.add_channel(channel);
                }
                Ok(None) => {
                    warn!(channel = %channel.id, "Channel has no schedule, skipping");
                }
                Err(e) => {
                    error!(channel = %channel.id, error = %e, "Failed to load schedule");
                }
            }
        }

        // HTTP boundary.
        let state = AppState::new(
            Arc::clone(&config),
            Arc::clone(&channels),
            Arc::clone(&sessions),
            Arc::clone(&timeline),
            Arc::clone(&pool),
        );
        let router = create_router(state);
        let listener = tokio::net::TcpListener::bind(config.http_address())
            .await
            .with_context(|| format!("binding {}", config.http_address()))?;
        info!(address = %config.http_address(), "HTTP server listening");

        // Unrecoverable-runtime watchdog: every channel Failed with its
        // breaker open means nothing will ever stream again.
        let (unrecoverable_tx, mut unrecoverable_rx) = tokio::sync::watch::channel(false);
        let watchdog_channels = Arc::clone(&channels);
        let watchdog = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WATCHDOG_INTERVAL);
            loop {
                ticker.tick().await;
                if watchdog_channels.all_failed_with_breaker_open() {
                    error!("All channels failed with open breakers, shutting down");
                    let _ = unrecoverable_tx.send(true);
                    break;
                }
            }
        });

        let server = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal() => {}
                _ = unrecoverable_rx.changed() => {}
            }
        });

        let served = server.await;
        watchdog.abort();
        let unrecoverable = channels.all_failed_with_breaker_open();

        // Cascade: refuse new sessions, stop runtimes, then force-kill
        // whatever survived the grace, and flush every anchor last.
        info!("Shutting down");
        sessions.stop_accepting();
        if tokio::time::timeout(SHUTDOWN_GRACE, channels.stop_all("shutdown"))
            .await
            .is_err()
        {
            warn!("Channels did not stop within grace, force-killing transcoders");
        }
        pool.kill_all().await;
        timeline.flush_all();

        served.context("http server error")?;
        Ok(if unrecoverable { EXIT_UNRECOVERABLE } else { 0 })
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("Shutdown signal received");
}

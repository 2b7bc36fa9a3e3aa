//! Logging for the streaming runtime.
//!
//! Runtime events are expected to carry their identity fields (channel,
//! session, pid). Long-lived tasks pin those fields once through the span
//! constructors below instead of repeating them on every event; one-shot
//! events (session opens, lease releases) attach them inline.

use tracing::Span;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::config::LoggingConfig;
use crate::models::ChannelId;

/// Dependencies whose debug chatter drowns the runtime's own events when a
/// bare level like `debug` is configured.
const QUIET_DEPS: &[&str] = &["hyper=warn", "reqwest=warn", "h2=warn"];

/// Initialize structured logging from configuration.
///
/// Format `json` is for production scraping, `pretty` for terminals; a file
/// path redirects either format (ANSI off). `RUST_LOG` overrides the
/// configured level entirely.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = build_filter(&config.level)?;
    let registry = tracing_subscriber::registry().with(filter);

    match (config.format.as_str(), config.file_path.as_deref()) {
        ("json", Some(path)) => {
            let layer = fmt::layer()
                .json()
                .with_span_list(true)
                .with_current_span(true)
                .with_target(true)
                .with_writer(open_log_file(path)?);
            registry.with(layer).init();
        }
        ("json", None) => {
            let layer = fmt::layer()
                .json()
                .with_span_list(true)
                .with_current_span(true)
                .with_target(true);
            registry.with(layer).init();
        }
        (_, Some(path)) => {
            let layer = fmt::layer()
                .compact()
                .with_ansi(false)
                .with_target(true)
                .with_writer(open_log_file(path)?);
            registry.with(layer).init();
        }
        (_, None) => {
            let layer = fmt::layer().pretty().with_target(true);
            registry.with(layer).init();
        }
    }
    Ok(())
}

/// Build the level filter: `RUST_LOG` wins; otherwise the configured level
/// plus directives quieting noisy HTTP internals.
fn build_filter(level: &str) -> anyhow::Result<EnvFilter> {
    if !matches!(
        level.to_lowercase().as_str(),
        "trace" | "debug" | "info" | "warn" | "warning" | "error"
    ) {
        anyhow::bail!("invalid logging.level '{level}'");
    }

    if let Ok(from_env) = EnvFilter::try_from_default_env() {
        return Ok(from_env);
    }
    let directives: Vec<String> = std::iter::once(level.to_lowercase())
        .chain(QUIET_DEPS.iter().map(ToString::to_string))
        .collect();
    let directives = directives.join(",");
    EnvFilter::try_new(&directives)
        .map_err(|e| anyhow::anyhow!("invalid log filter '{directives}': {e}"))
}

fn open_log_file(path: &str) -> anyhow::Result<std::sync::Arc<std::fs::File>> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(std::sync::Arc::new(file))
}

/// Root span of a channel runtime task.
///
/// Everything the task logs (playout transitions, source failures, restart
/// decisions applied to it) inherits the channel identity from here.
#[must_use]
pub fn channel_span(channel_id: &ChannelId, number: u32) -> Span {
    tracing::info_span!("channel", id = %channel_id, number)
}

/// Span over one leased transcoder's lifetime; its stderr lines and exit
/// events carry the pid without restating it.
#[must_use]
pub fn transcoder_span(channel_id: &ChannelId, pid: u32) -> Span {
    tracing::debug_span!("transcoder", channel = %channel_id, pid)
}

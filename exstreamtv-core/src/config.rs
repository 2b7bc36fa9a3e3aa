use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub hdhomerun: HdHomeRunConfig,
    pub pool: PoolConfig,
    pub restart: RestartConfig,
    pub breaker: BreakerConfig,
    pub playout: PlayoutConfig,
    pub session: SessionConfig,
    pub transcode: TranscodeConfig,
    pub logging: LoggingConfig,
    pub state: StateConfig,
    pub providers: crate::provider::ProvidersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    /// Base URL advertised in M3U/lineup documents. If empty, derived from
    /// the local IP and `http_port`.
    pub base_url: String,
    /// Enable the `/metrics` Prometheus endpoint.
    pub metrics_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 5004,
            base_url: String::new(),
            metrics_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HdHomeRunConfig {
    pub friendly_name: String,
    pub model_number: String,
    pub firmware_name: String,
    pub firmware_version: String,
    /// Exactly 8 hexadecimal characters.
    pub device_id: String,
    pub device_auth: String,
    pub tuner_count: u32,
}

impl Default for HdHomeRunConfig {
    fn default() -> Self {
        Self {
            friendly_name: "EXStreamTV".to_string(),
            model_number: "HDHR5-4K".to_string(),
            firmware_name: "hdhomerun5_atsc".to_string(),
            firmware_version: "20240101".to_string(),
            device_id: "10ABCDEF".to_string(),
            device_auth: "exstreamtv".to_string(),
            tuner_count: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Path to the ffmpeg binary.
    pub ffmpeg_path: String,
    /// Hard cap on concurrently live transcoder processes.
    pub max_processes: usize,
    /// Spawn-rate token bucket refill, per second.
    pub spawns_per_second: u32,
    /// Refuse spawns while system memory used-ratio is at or above this.
    pub memory_guard_threshold: f64,
    /// Minimum file descriptors that must remain available.
    pub fd_guard_reserve: u64,
    /// Zombie reaper interval (seconds).
    pub reaper_interval_seconds: u64,
    /// Revoke leases older than this many hours.
    pub long_run_hours: u64,
    /// Grace between revoke notice and forced kill (seconds).
    pub long_run_grace_seconds: u64,
    /// Utilization above which the containment bit is set.
    pub pressure_threshold: f64,
    /// Estimated RSS per transcoder, used for the memory capacity estimate (MB).
    pub process_memory_estimate_mb: u64,
    /// Estimated file descriptors consumed per transcoder.
    pub process_fd_estimate: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            max_processes: 150,
            spawns_per_second: 5,
            memory_guard_threshold: 0.85,
            fd_guard_reserve: 100,
            reaper_interval_seconds: 30,
            long_run_hours: 24,
            long_run_grace_seconds: 10,
            pressure_threshold: 0.80,
            process_memory_estimate_mb: 256,
            process_fd_estimate: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Global cap of allowed restarts in any rolling window.
    pub global_restarts_per_window: u32,
    /// Rolling window size (seconds).
    pub global_window_seconds: u64,
    /// Minimum spacing between allowed restarts of one channel (seconds).
    pub channel_cooldown_seconds: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            global_restarts_per_window: 10,
            global_window_seconds: 60,
            channel_cooldown_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failures within the window that trip the breaker.
    pub failure_threshold: u32,
    /// Failure accounting window (seconds).
    pub failure_window_seconds: u64,
    /// OPEN -> HALF_OPEN cooldown (seconds).
    pub cooldown_seconds: u64,
    /// A probe must stay up this long to close the breaker (seconds).
    pub probe_up_seconds: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_seconds: 300,
            cooldown_seconds: 120,
            probe_up_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayoutConfig {
    /// Persist anchors at least this often (seconds).
    pub anchor_flush_seconds: u64,
    /// Treat a source as stale after this long without bytes (seconds).
    pub health_stale_seconds: u64,
    /// Fan-out ring size (bytes).
    pub hub_ring_bytes: usize,
    /// Drop a subscriber once it falls this far behind (bytes).
    pub slow_subscriber_budget_bytes: usize,
    /// Tolerated clock drift when resuming an anchor (seconds).
    pub resume_drift_tolerance_seconds: f64,
}

impl Default for PlayoutConfig {
    fn default() -> Self {
        Self {
            anchor_flush_seconds: 30,
            health_stale_seconds: 180,
            hub_ring_bytes: 2 * 1024 * 1024,
            slow_subscriber_budget_bytes: 4 * 1024 * 1024,
            resume_drift_tolerance_seconds: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_sessions_per_channel: usize,
    /// Idle sessions are disconnected after this long (seconds).
    pub idle_timeout_seconds: u64,
    /// How often the idle sweeper runs (seconds).
    pub sweep_interval_seconds: u64,
    /// Force-close a session after this many recorded errors.
    pub max_errors_per_session: usize,
    /// Optional JSON-lines audit log of closed sessions.
    pub audit_log_path: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_channel: 50,
            idle_timeout_seconds: 300,
            sweep_interval_seconds: 60,
            max_errors_per_session: 10,
            audit_log_path: None,
        }
    }
}

/// Hardware acceleration encoder selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HwAccel {
    #[default]
    None,
    VideoToolbox,
    Nvenc,
    Qsv,
    Vaapi,
    Amf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    pub hwaccel: HwAccel,
    /// Allow stream copy when the item is direct-play friendly.
    pub allow_copy: bool,
    /// Target video bitrate for transcodes (kbps).
    pub video_bitrate_kbps: u32,
    /// Target audio bitrate (kbps).
    pub audio_bitrate_kbps: u32,
    /// Maximum audio channels before a downmix is requested.
    pub max_audio_channels: u32,
    /// VAAPI render device, when hwaccel = vaapi.
    pub vaapi_device: String,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            hwaccel: HwAccel::None,
            allow_copy: true,
            video_bitrate_kbps: 8000,
            audio_bitrate_kbps: 192,
            max_audio_channels: 2,
            vaapi_device: "/dev/dri/renderD128".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "json" or "pretty"
    pub format: String,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Directory holding channel definitions, schedules and anchors.
    pub state_dir: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            state_dir: "./state".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, config::FileFormat::Yaml));
            }
        }

        // EXSTREAMTV_SERVER_HTTP_PORT, EXSTREAMTV_POOL_MAX_PROCESSES, ...
        builder = builder.add_source(
            Environment::with_prefix("EXSTREAMTV")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Get HTTP bind address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Validate configuration at startup (fail fast on misconfigurations)
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("server.http_port must be between 1 and 65535, got 0".to_string());
        }

        if !is_valid_device_id(&self.hdhomerun.device_id) {
            errors.push(format!(
                "hdhomerun.device_id '{}' must be exactly 8 hexadecimal characters",
                self.hdhomerun.device_id
            ));
        }
        if self.hdhomerun.tuner_count == 0 {
            errors.push("hdhomerun.tuner_count must be greater than 0".to_string());
        }

        if self.pool.max_processes == 0 {
            errors.push("pool.max_processes must be greater than 0".to_string());
        }
        if self.pool.spawns_per_second == 0 {
            errors.push("pool.spawns_per_second must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.pool.memory_guard_threshold) {
            errors.push(format!(
                "pool.memory_guard_threshold ({}) must be within 0.0..=1.0",
                self.pool.memory_guard_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.pool.pressure_threshold) {
            errors.push(format!(
                "pool.pressure_threshold ({}) must be within 0.0..=1.0",
                self.pool.pressure_threshold
            ));
        }
        if self.pool.ffmpeg_path.is_empty() {
            errors.push("pool.ffmpeg_path must not be empty".to_string());
        }

        if self.restart.global_restarts_per_window == 0 {
            errors.push("restart.global_restarts_per_window must be greater than 0".to_string());
        }
        if self.restart.global_window_seconds == 0 {
            errors.push("restart.global_window_seconds must be greater than 0".to_string());
        }

        if self.breaker.failure_threshold == 0 {
            errors.push("breaker.failure_threshold must be greater than 0".to_string());
        }

        if self.playout.hub_ring_bytes == 0 {
            errors.push("playout.hub_ring_bytes must be greater than 0".to_string());
        }
        if self.playout.hub_ring_bytes % 188 != 0 {
            errors.push(format!(
                "playout.hub_ring_bytes ({}) must be a multiple of the 188-byte TS packet size",
                self.playout.hub_ring_bytes
            ));
        }

        if self.session.max_sessions_per_channel == 0 {
            errors.push("session.max_sessions_per_channel must be greater than 0".to_string());
        }

        if self.state.state_dir.is_empty() {
            errors.push("state.state_dir must not be empty".to_string());
        }

        match self.logging.format.as_str() {
            "json" | "pretty" => {}
            other => errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{other}'"
            )),
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// HDHomeRun DeviceID constraint: exactly 8 hexadecimal characters.
#[must_use]
pub fn is_valid_device_id(device_id: &str) -> bool {
    device_id.len() == 8 && device_id.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn device_id_must_be_8_hex_chars() {
        assert!(is_valid_device_id("10ABCDEF"));
        assert!(is_valid_device_id("deadbeef"));
        assert!(!is_valid_device_id("BADID"));
        assert!(!is_valid_device_id("10ABCDEF0"));
        assert!(!is_valid_device_id("10ABCDEG"));
        assert!(!is_valid_device_id(""));
    }

    #[test]
    fn invalid_device_id_fails_validation() {
        let mut config = Config::default();
        config.hdhomerun.device_id = "BADID".to_string();
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("8 hexadecimal")));
    }

    #[test]
    fn zero_port_fails_validation() {
        let mut config = Config::default();
        config.server.http_port = 0;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("http_port")));
    }

    #[test]
    fn hub_ring_must_align_to_ts_packets() {
        let mut config = Config::default();
        config.playout.hub_ring_bytes = 1000;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("188")));
    }

    #[test]
    fn validation_collects_all_errors() {
        let mut config = Config::default();
        config.server.http_port = 0;
        config.hdhomerun.device_id = "nope".to_string();
        config.pool.max_processes = 0;
        let errors = config.validate().unwrap_err();
        assert!(errors.len() >= 3);
    }
}

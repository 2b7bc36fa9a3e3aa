//! Process pool: the sole transcoder gatekeeper.
//!
//! Every external transcoder is spawned, tracked and reaped here. Nothing
//! else in the crate touches `tokio::process`. Admission runs a fixed guard
//! chain (memory, file descriptors, capacity, spawn-rate) and every live
//! process is represented by exactly one lease, released exactly once.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use parking_lot::Mutex;
use sysinfo::System;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SharedClock};
use crate::config::PoolConfig;
use crate::metrics;
use crate::models::{ChannelId, LeaseId};
use crate::source::TranscodeCommand;

/// Classified admission failures, in guard-check order.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AcquireError {
    #[error("system memory above guard threshold")]
    MemoryGuard,
    #[error("file descriptor reserve exhausted")]
    FdGuard,
    #[error("pool at capacity")]
    PoolFull,
    #[error("spawn rate limited")]
    RateLimited,
    #[error("spawn failed: {0}")]
    SpawnFailed(String),
}

impl AcquireError {
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MemoryGuard => "memory_guard",
            Self::FdGuard => "fd_guard",
            Self::PoolFull => "pool_full",
            Self::RateLimited => "rate_limited",
            Self::SpawnFailed(_) => "spawn_failed",
        }
    }
}

/// Pool-wide snapshot.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub live: usize,
    pub capacity: usize,
    pub utilization: f64,
    pub containment: bool,
    pub total_spawned: u64,
    pub total_denied: u64,
}

struct LeaseInner {
    id: LeaseId,
    channel_id: ChannelId,
    pid: u32,
    acquired_at: Instant,
    child: tokio::sync::Mutex<Option<Child>>,
    released: AtomicBool,
    revoke_tx: watch::Sender<bool>,
    /// Set when the long-run guard issues the revoke notice.
    revoked_at: Mutex<Option<Instant>>,
    rss_bytes: AtomicU64,
}

/// Byte stream of a leased transcoder.
pub type LeaseStdout = ChildStdout;
/// Diagnostic stream of a leased transcoder.
pub type LeaseStderr = ChildStderr;

/// Handle for one live transcoder process.
///
/// Dropping the handle does not kill the process; callers release through
/// [`ProcessPool::release`], which is idempotent.
#[derive(Debug)]
pub struct PoolLease {
    pub id: LeaseId,
    pub channel_id: ChannelId,
    pub pid: u32,
    /// MPEG-TS byte stream; taken once by the owning channel runtime.
    pub stdout: Option<ChildStdout>,
    /// Diagnostics; drained by the owner.
    pub stderr: Option<ChildStderr>,
    /// Flips to `true` when the long-run guard revokes this lease.
    pub revoke_rx: watch::Receiver<bool>,
}

/// Cached memory / fd samples, refreshed at a bounded rate so the admission
/// path never blocks on OS statistics.
struct ResourceSampler {
    system: Mutex<System>,
    sample: Mutex<ResourceSample>,
    refresh_interval: Duration,
}

#[derive(Debug, Clone, Copy)]
struct ResourceSample {
    taken_at: Instant,
    memory_used_ratio: f64,
    memory_available_mb: u64,
    fds_available: u64,
}

impl ResourceSampler {
    fn new(refresh_interval: Duration) -> Self {
        Self {
            system: Mutex::new(System::new()),
            sample: Mutex::new(ResourceSample {
                taken_at: Instant::now() - refresh_interval * 2,
                memory_used_ratio: 0.0,
                memory_available_mb: u64::MAX,
                fds_available: u64::MAX,
            }),
            refresh_interval,
        }
    }

    fn current(&self) -> ResourceSample {
        {
            let sample = self.sample.lock();
            if sample.taken_at.elapsed() < self.refresh_interval {
                return *sample;
            }
        }
        let mut system = self.system.lock();
        system.refresh_memory();
        let total = system.total_memory().max(1);
        let used = system.used_memory();
        let available_mb = system.available_memory() / (1024 * 1024);
        let fresh = ResourceSample {
            taken_at: Instant::now(),
            memory_used_ratio: used as f64 / total as f64,
            memory_available_mb: available_mb,
            fds_available: available_fds(),
        };
        *self.sample.lock() = fresh;
        fresh
    }
}

/// File descriptors still available to this process.
#[cfg(target_os = "linux")]
fn available_fds() -> u64 {
    let soft_limit = std::fs::read_to_string("/proc/self/limits")
        .ok()
        .and_then(|limits| {
            limits.lines().find(|l| l.starts_with("Max open files")).and_then(|line| {
                line.split_whitespace().nth(3).and_then(|v| v.parse::<u64>().ok())
            })
        })
        .unwrap_or(1024);
    let open = std::fs::read_dir("/proc/self/fd")
        .map(|entries| entries.count() as u64)
        .unwrap_or(0);
    soft_limit.saturating_sub(open)
}

#[cfg(not(target_os = "linux"))]
fn available_fds() -> u64 {
    u64::MAX
}

type SpawnLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Sole spawner and reaper of transcoder processes.
pub struct ProcessPool {
    config: PoolConfig,
    clock: SharedClock,
    leases: DashMap<LeaseId, Arc<LeaseInner>>,
    sampler: ResourceSampler,
    spawn_limiter: SpawnLimiter,
    containment: AtomicBool,
    total_spawned: AtomicU64,
    total_denied: AtomicU64,
}

impl ProcessPool {
    #[must_use]
    pub fn new(config: PoolConfig, clock: SharedClock) -> Arc<Self> {
        let per_second = std::num::NonZeroU32::new(config.spawns_per_second)
            .unwrap_or(nonzero!(1u32));
        Arc::new(Self {
            clock,
            sampler: ResourceSampler::new(Duration::from_secs(2)),
            spawn_limiter: RateLimiter::direct(Quota::per_second(per_second)),
            leases: DashMap::new(),
            containment: AtomicBool::new(false),
            total_spawned: AtomicU64::new(0),
            total_denied: AtomicU64::new(0),
            config,
        })
    }

    /// Effective capacity: the configured cap bounded by memory and fd
    /// budget estimates, all from the cached sample.
    fn capacity(&self, sample: ResourceSample) -> usize {
        let memory_budget =
            (sample.memory_available_mb / self.config.process_memory_estimate_mb.max(1)) as usize;
        let fd_budget = (sample.fds_available / self.config.process_fd_estimate.max(1)) as usize;
        self.config
            .max_processes
            .min(memory_budget.max(1))
            .min(fd_budget.max(1))
    }

    /// Admit and spawn a transcoder for a channel.
    ///
    /// Never waits: each guard answers from cached samples and a denial is
    /// returned immediately with its classification.
    pub async fn acquire(
        &self,
        channel_id: &ChannelId,
        command: &TranscodeCommand,
        env: &[(String, String)],
    ) -> Result<PoolLease, AcquireError> {
        let sample = self.sampler.current();

        if sample.memory_used_ratio >= self.config.memory_guard_threshold {
            return Err(self.deny(AcquireError::MemoryGuard));
        }
        if sample.fds_available < self.config.fd_guard_reserve {
            return Err(self.deny(AcquireError::FdGuard));
        }
        let capacity = self.capacity(sample);
        if self.leases.len() >= capacity {
            return Err(self.deny(AcquireError::PoolFull));
        }
        if self.spawn_limiter.check().is_err() {
            return Err(self.deny(AcquireError::RateLimited));
        }

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| self.deny(AcquireError::SpawnFailed(e.to_string())))?;
        let pid = child.id().unwrap_or(0);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (revoke_tx, revoke_rx) = watch::channel(false);
        let inner = Arc::new(LeaseInner {
            id: LeaseId::new(),
            channel_id: channel_id.clone(),
            pid,
            acquired_at: self.clock.now(),
            child: tokio::sync::Mutex::new(Some(child)),
            released: AtomicBool::new(false),
            revoke_tx,
            revoked_at: Mutex::new(None),
            rss_bytes: AtomicU64::new(0),
        });
        let lease_id = inner.id;
        self.leases.insert(lease_id, inner);
        self.total_spawned.fetch_add(1, Ordering::Relaxed);
        self.update_pressure();

        info!(channel = %channel_id, pid, lease = %lease_id, "Transcoder spawned");
        Ok(PoolLease {
            id: lease_id,
            channel_id: channel_id.clone(),
            pid,
            stdout,
            stderr,
            revoke_rx,
        })
    }

    fn deny(&self, err: AcquireError) -> AcquireError {
        self.total_denied.fetch_add(1, Ordering::Relaxed);
        metrics::pool::SPAWN_DENIED_TOTAL
            .with_label_values(&[err.reason()])
            .inc();
        debug!(reason = err.reason(), "Spawn denied");
        err
    }

    /// Release a lease: graceful stop, bounded escalation, then removal.
    ///
    /// Idempotent; the second and later calls return immediately.
    pub async fn release(&self, lease_id: LeaseId) {
        let Some(inner) = self.leases.get(&lease_id).map(|e| Arc::clone(e.value())) else {
            return;
        };
        if inner.released.swap(true, Ordering::SeqCst) {
            return;
        }

        Self::stop_child(&inner).await;
        self.leases.remove(&lease_id);
        self.update_pressure();
        info!(channel = %inner.channel_id, pid = inner.pid, lease = %lease_id, "Lease released");
    }

    /// Two-stage graceful escalation, then a hard kill: quit via stdin,
    /// wait 5s, quit again, wait 2s, kill.
    async fn stop_child(inner: &LeaseInner) {
        let mut guard = inner.child.lock().await;
        let Some(child) = guard.as_mut() else { return };

        let mut stdin = child.stdin.take();
        for grace in [Duration::from_secs(5), Duration::from_secs(2)] {
            if let Some(stdin) = stdin.as_mut() {
                let _ = stdin.write_all(b"q").await;
                let _ = stdin.flush().await;
            }
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => {
                    debug!(pid = inner.pid, ?status, "Transcoder exited");
                    *guard = None;
                    return;
                }
                Err(_) => {
                    warn!(pid = inner.pid, "Transcoder ignoring quit, escalating");
                }
            }
        }

        drop(stdin);
        if let Err(e) = child.kill().await {
            warn!(pid = inner.pid, error = %e, "Force kill failed");
        }
        *guard = None;
    }

    /// One reaper pass: synthesize releases for exited processes and run the
    /// long-run guard. Called periodically by [`Self::spawn_reaper`].
    pub async fn reap_once(&self) {
        let lease_ids: Vec<LeaseId> = self.leases.iter().map(|e| *e.key()).collect();
        for lease_id in lease_ids {
            let Some(inner) = self.leases.get(&lease_id).map(|e| Arc::clone(e.value())) else {
                continue;
            };

            // Zombie check: process gone but lease still held.
            let exited = {
                let mut guard = inner.child.lock().await;
                match guard.as_mut() {
                    Some(child) => child.try_wait().ok().flatten().is_some(),
                    None => true,
                }
            };
            if exited && !inner.released.load(Ordering::SeqCst) {
                warn!(channel = %inner.channel_id, pid = inner.pid, "Reaping zombie lease");
                self.release(lease_id).await;
                continue;
            }

            self.sample_rss(&inner);

            // Long-run guard: notice first, force kill after the grace.
            let age = self.clock.now().duration_since(inner.acquired_at);
            let limit = Duration::from_secs(self.config.long_run_hours * 3600);
            if age > limit {
                let overdue = {
                    let mut revoked_at = inner.revoked_at.lock();
                    match *revoked_at {
                        None => {
                            info!(
                                channel = %inner.channel_id,
                                pid = inner.pid,
                                "Long-run limit reached, revoking lease"
                            );
                            metrics::pool::LONG_RUN_REVOKED_TOTAL
                                .with_label_values(&[inner.channel_id.as_str()])
                                .inc();
                            let _ = inner.revoke_tx.send(true);
                            *revoked_at = Some(self.clock.now());
                            false
                        }
                        Some(at) => {
                            self.clock.now().duration_since(at)
                                > Duration::from_secs(self.config.long_run_grace_seconds)
                        }
                    }
                };
                if overdue {
                    warn!(channel = %inner.channel_id, pid = inner.pid, "Revoke grace expired, force releasing");
                    self.release(lease_id).await;
                }
            }
        }
        self.update_pressure();
    }

    fn sample_rss(&self, inner: &LeaseInner) {
        let mut system = self.sampler.system.lock();
        let pid = sysinfo::Pid::from_u32(inner.pid);
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
        if let Some(process) = system.process(pid) {
            inner.rss_bytes.store(process.memory(), Ordering::Relaxed);
        }
    }

    /// Start the background reaper task.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        let interval = Duration::from_secs(self.config.reaper_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                pool.reap_once().await;
            }
        })
    }

    fn update_pressure(&self) {
        let live = self.leases.len();
        let capacity = self.config.max_processes.max(1);
        let utilization = live as f64 / capacity as f64;
        metrics::pool::POOL_LIVE.set(live as i64);
        metrics::pool::POOL_UTILIZATION.set(utilization);
        self.containment
            .store(utilization > self.config.pressure_threshold, Ordering::Relaxed);
    }

    /// Containment bit: set while utilization exceeds the pressure threshold.
    #[must_use]
    pub fn containment(&self) -> bool {
        self.containment.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let live = self.leases.len();
        let capacity = self.config.max_processes.max(1);
        PoolStats {
            live,
            capacity,
            utilization: live as f64 / capacity as f64,
            containment: self.containment(),
            total_spawned: self.total_spawned.load(Ordering::Relaxed),
            total_denied: self.total_denied.load(Ordering::Relaxed),
        }
    }

    /// Kill every live process (process-wide shutdown, after the grace).
    pub async fn kill_all(&self) {
        let lease_ids: Vec<LeaseId> = self.leases.iter().map(|e| *e.key()).collect();
        for lease_id in lease_ids {
            self.release(lease_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;

    fn sleep_command(seconds: &str) -> TranscodeCommand {
        TranscodeCommand {
            program: "sleep".to_string(),
            args: vec![seconds.to_string()],
        }
    }

    fn pool_with(mutate: impl FnOnce(&mut PoolConfig)) -> Arc<ProcessPool> {
        let mut config = PoolConfig {
            spawns_per_second: 100,
            ..PoolConfig::default()
        };
        mutate(&mut config);
        ProcessPool::new(config, system_clock())
    }

    #[tokio::test]
    async fn acquire_and_release_tracks_live_count() {
        let pool = pool_with(|_| {});
        let lease = pool
            .acquire(&ChannelId::from("c1"), &sleep_command("30"), &[])
            .await
            .unwrap();
        assert_eq!(pool.stats().live, 1);
        assert!(lease.pid > 0);

        pool.release(lease.id).await;
        assert_eq!(pool.stats().live, 0);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let pool = pool_with(|_| {});
        let lease = pool
            .acquire(&ChannelId::from("c1"), &sleep_command("30"), &[])
            .await
            .unwrap();
        pool.release(lease.id).await;
        pool.release(lease.id).await;
        assert_eq!(pool.stats().live, 0);
        assert_eq!(pool.stats().total_spawned, 1);
    }

    #[tokio::test]
    async fn spawn_failure_is_classified() {
        let pool = pool_with(|_| {});
        let bad = TranscodeCommand {
            program: "/nonexistent/transcoder-binary".to_string(),
            args: vec![],
        };
        let err = pool.acquire(&ChannelId::from("c1"), &bad, &[]).await.unwrap_err();
        assert!(matches!(err, AcquireError::SpawnFailed(_)));
        assert_eq!(pool.stats().live, 0);
    }

    #[tokio::test]
    async fn memory_guard_denies_before_spawn() {
        let pool = pool_with(|c| c.memory_guard_threshold = 0.0);
        let err = pool
            .acquire(&ChannelId::from("c1"), &sleep_command("30"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::MemoryGuard));
        assert_eq!(pool.stats().total_spawned, 0);
    }

    #[tokio::test]
    async fn fd_guard_denies_when_reserve_unmet() {
        let pool = pool_with(|c| c.fd_guard_reserve = u64::MAX);
        let err = pool
            .acquire(&ChannelId::from("c1"), &sleep_command("30"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::FdGuard));
    }

    #[tokio::test]
    async fn capacity_cap_yields_pool_full() {
        let pool = pool_with(|c| {
            c.max_processes = 1;
            c.process_memory_estimate_mb = 1;
            c.process_fd_estimate = 1;
        });
        let _lease = pool
            .acquire(&ChannelId::from("c1"), &sleep_command("30"), &[])
            .await
            .unwrap();
        let err = pool
            .acquire(&ChannelId::from("c2"), &sleep_command("30"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::PoolFull));
        pool.kill_all().await;
    }

    #[tokio::test]
    async fn spawn_rate_limits_burst() {
        let pool = pool_with(|c| c.spawns_per_second = 1);
        let first = pool
            .acquire(&ChannelId::from("c1"), &sleep_command("30"), &[])
            .await
            .unwrap();
        let err = pool
            .acquire(&ChannelId::from("c2"), &sleep_command("30"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::RateLimited));
        pool.release(first.id).await;
    }

    #[tokio::test]
    async fn reaper_synthesizes_release_for_exited_process() {
        let pool = pool_with(|_| {});
        let lease = pool
            .acquire(&ChannelId::from("c1"), &sleep_command("0"), &[])
            .await
            .unwrap();
        // Give the short-lived process time to exit on its own.
        tokio::time::sleep(Duration::from_millis(300)).await;

        pool.reap_once().await;
        assert_eq!(pool.stats().live, 0);
        // The synthesized release still makes a later explicit one a no-op.
        pool.release(lease.id).await;
    }

    #[tokio::test]
    async fn long_run_guard_revokes_then_force_releases() {
        let pool = pool_with(|c| {
            c.long_run_hours = 0;
            c.long_run_grace_seconds = 0;
        });
        let mut lease = pool
            .acquire(&ChannelId::from("c3"), &sleep_command("30"), &[])
            .await
            .unwrap();

        pool.reap_once().await;
        assert!(*lease.revoke_rx.borrow_and_update(), "revoke notice expected");

        // Grace of zero: the next pass force-releases.
        pool.reap_once().await;
        assert_eq!(pool.stats().live, 0);
    }

    #[tokio::test]
    async fn containment_flips_under_pressure() {
        let pool = pool_with(|c| {
            c.max_processes = 1;
            c.pressure_threshold = 0.5;
        });
        assert!(!pool.containment());
        let lease = pool
            .acquire(&ChannelId::from("c1"), &sleep_command("30"), &[])
            .await
            .unwrap();
        assert!(pool.containment());
        pool.release(lease.id).await;
        assert!(!pool.containment());
    }

    #[tokio::test]
    async fn stats_count_spawns_and_denials() {
        let pool = pool_with(|c| c.memory_guard_threshold = 0.0);
        let _ = pool.acquire(&ChannelId::from("c1"), &sleep_command("30"), &[]).await;
        let stats = pool.stats();
        assert_eq!(stats.total_spawned, 0);
        assert_eq!(stats.total_denied, 1);
    }
}

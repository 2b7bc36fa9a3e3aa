//! Per-channel streaming runtime.
//!
//! One long-lived task per enabled channel owns the active source, the
//! fan-out hub and the restart logic. Bytes flow source stdout -> 188-byte
//! aligned chunks -> throttler -> broadcast hub -> subscribers. Planned item
//! transitions bypass the restart governor; failures never do.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn, Instrument};

use crate::clock::{Clock, SharedClock};
use crate::config::{PlayoutConfig, PoolConfig, TranscodeConfig};
use crate::logging;
use crate::metrics;
use crate::models::{Channel, ChannelId, FillerKind, PlayoutItem};
use crate::playout::PlayoutTimeline;
use crate::provider::MediaResolver;
use crate::service::breaker::{CircuitBreaker, CircuitState};
use crate::service::governor::{Decision, RestartCause, RestartGovernor};
use crate::service::pool::{PoolLease, ProcessPool};
use crate::service::session::SessionManager;
use crate::service::throttle::Throttler;
use crate::source::{build_command, ErrorScreenConfig, SourceError, SourceFailureKind};

/// MPEG-TS packet size; every hub chunk is a multiple of this.
pub const TS_PACKET: usize = 188;

/// Source read size (a whole number of TS packets).
const READ_CHUNK: usize = TS_PACKET * 348; // ~64 KiB

/// Deadline for a graceful in-place restart after a long-run revoke.
const REVOKE_BOUNDARY_DEADLINE: Duration = Duration::from_secs(30);

/// How often playback progress is pushed into the timeline.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelStatus {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Restarting = 3,
    Failed = 4,
}

impl ChannelStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Restarting,
            4 => Self::Failed,
            _ => Self::Stopped,
        }
    }
}

/// Everything a runtime needs from the rest of the system.
pub struct RuntimeDeps {
    pub pool: Arc<ProcessPool>,
    pub governor: Arc<RestartGovernor>,
    pub timeline: Arc<PlayoutTimeline>,
    pub resolver: Arc<MediaResolver>,
    pub sessions: Arc<SessionManager>,
    pub clock: SharedClock,
    pub playout: PlayoutConfig,
    pub transcode: TranscodeConfig,
    pub pool_config: PoolConfig,
    pub error_screen: ErrorScreenConfig,
}

impl RuntimeDeps {
    fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.governor.breaker()
    }
}

enum PlayOutcome {
    /// Source drained to EOF: a planned item transition.
    NaturalEnd,
    /// Stop requested.
    Stopped,
    /// Classified failure.
    Failed(SourceError),
    /// Long-run revoke honored (item boundary or deadline).
    Revoked,
}

pub struct ChannelRuntime {
    channel: Channel,
    deps: Arc<RuntimeDeps>,
    hub_tx: broadcast::Sender<Bytes>,
    /// Broadcast slot count; occupancy against it is the backpressure signal.
    hub_capacity: usize,
    status: AtomicU8,
    stop_tx: watch::Sender<bool>,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ChannelRuntime {
    #[must_use]
    pub fn new(channel: Channel, deps: Arc<RuntimeDeps>) -> Arc<Self> {
        let slots =
            (deps.playout.slow_subscriber_budget_bytes / READ_CHUNK).clamp(16, 4096);
        let (hub_tx, _) = broadcast::channel(slots);
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            channel,
            deps,
            hub_tx,
            hub_capacity: slots,
            status: AtomicU8::new(ChannelStatus::Stopped as u8),
            stop_tx,
            task: parking_lot::Mutex::new(None),
        })
    }

    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    #[must_use]
    pub fn id(&self) -> &ChannelId {
        &self.channel.id
    }

    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        ChannelStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, status: ChannelStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    /// Subscribe to the channel's byte stream.
    ///
    /// Returns immediately even mid-restart; the subscriber first sees
    /// whatever the hub emits next (error-screen bytes while degraded).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.hub_tx.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.hub_tx.receiver_count()
    }

    /// Start the runtime task. Idempotent while a task is live.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        self.stop_tx.send_replace(false);
        let runtime = Arc::clone(self);
        let stop_rx = self.stop_tx.subscribe();
        let span = logging::channel_span(&self.channel.id, self.channel.number);
        *task = Some(tokio::spawn(runtime.run(stop_rx).instrument(span)));
    }

    /// Stop the channel: close sessions, end the task. Idempotent.
    pub async fn request_stop(&self, reason: &str) {
        let already_stopping = self.stop_tx.send_replace(true);
        if already_stopping {
            return;
        }
        info!(channel = %self.channel.id, reason, "Channel stop requested");
        self.deps.sessions.close_channel(&self.channel.id);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.set_status(ChannelStatus::Stopped);
    }

    async fn run(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        // The enclosing channel span carries the channel identity fields.
        info!("Channel runtime started");
        let mut denied_backoff = new_backoff();

        loop {
            if *stop_rx.borrow() {
                break;
            }

            let now = self.deps.clock.wall_now();
            let located = self.deps.timeline.resume_offset(&self.channel.id, now);
            let (item, offset) = match located {
                Ok(x) => x,
                Err(e) => {
                    error!(error = %e, "No playable item");
                    self.set_status(ChannelStatus::Failed);
                    self.serve_error_screen(
                        Duration::from_secs(30),
                        "no scheduled content",
                        &mut stop_rx,
                    )
                    .await;
                    continue;
                }
            };

            // Dead air: hold the error screen for the gap, then move on.
            if item.filler_kind == FillerKind::DeadAir {
                let remaining = (item.duration_secs() - offset).max(1.0);
                self.serve_error_screen(
                    Duration::from_secs_f64(remaining.min(300.0)),
                    "off air",
                    &mut stop_rx,
                )
                .await;
                if *stop_rx.borrow() {
                    break;
                }
                let _ = self
                    .deps
                    .timeline
                    .advance(&self.channel.id, self.deps.clock.wall_now());
                continue;
            }

            self.set_status(ChannelStatus::Starting);
            match self.play_item(&item, offset, &mut stop_rx).await {
                PlayOutcome::NaturalEnd => {
                    denied_backoff = new_backoff();
                    // Planned transition: the governor is not consulted.
                    let _ = self
                        .deps
                        .timeline
                        .advance(&self.channel.id, self.deps.clock.wall_now());
                }
                PlayOutcome::Stopped => break,
                PlayOutcome::Revoked => {
                    self.set_status(ChannelStatus::Restarting);
                    let decision = self
                        .deps
                        .governor
                        .request_restart(&self.channel.id, RestartCause::LongRunRevoke);
                    if !decision.is_allowed() {
                        self.degraded_wait(&mut denied_backoff, &mut stop_rx).await;
                    }
                }
                PlayOutcome::Failed(source_error) => {
                    warn!(
                        kind = ?source_error.kind,
                        error = %source_error.message,
                        "Source failed"
                    );
                    match source_error.kind {
                        SourceFailureKind::PermanentForItem
                        | SourceFailureKind::PermanentForSource => {
                            // Unplayable item: advance, do not restart.
                            let _ = self
                                .deps
                                .timeline
                                .advance(&self.channel.id, self.deps.clock.wall_now());
                        }
                        SourceFailureKind::Transient => {
                            self.set_status(ChannelStatus::Restarting);
                            // A request against an open breaker is the
                            // half-open probe attempt once the cooldown
                            // elapses; label it as such.
                            let cause = if self.deps.breaker().state(&self.channel.id)
                                == CircuitState::Open
                            {
                                RestartCause::BreakerProbe
                            } else {
                                RestartCause::SourceFailed
                            };
                            let decision = self
                                .deps
                                .governor
                                .request_restart(&self.channel.id, cause);
                            match decision {
                                Decision::Allowed => {
                                    denied_backoff = new_backoff();
                                }
                                _denied => {
                                    self.set_status(ChannelStatus::Failed);
                                    self.degraded_wait(&mut denied_backoff, &mut stop_rx).await;
                                }
                            }
                        }
                    }
                }
            }
        }

        self.set_status(ChannelStatus::Stopped);
        info!("Channel runtime stopped");
    }

    /// Serve the error screen under backoff while restarts are denied.
    async fn degraded_wait(
        &self,
        backoff: &mut impl Iterator<Item = Duration>,
        stop_rx: &mut watch::Receiver<bool>,
    ) {
        let delay = backoff.next().unwrap_or(Duration::from_secs(30));
        self.serve_error_screen(delay, "channel restarting", stop_rx).await;
    }

    /// Play one item to its end. Returns how it ended.
    async fn play_item(
        &self,
        item: &PlayoutItem,
        offset: f64,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> PlayOutcome {
        let resolved = match self.deps.resolver.resolve(&item.media_ref).await {
            Ok(r) => r,
            Err(e) => return PlayOutcome::Failed(e.into()),
        };

        // Non-seekable live input: the offset cannot be applied, restart the
        // item's elapsed accounting from zero instead.
        let effective_offset = if resolved.kind.is_seekable() { offset } else { 0.0 };
        let command = build_command(
            &self.deps.pool_config.ffmpeg_path,
            &resolved,
            &self.deps.transcode,
            effective_offset,
            item.in_point,
        );

        let lease = match self.deps.pool.acquire(&self.channel.id, &command, &[]).await {
            Ok(lease) => lease,
            Err(e) => {
                // A failed start feeds the breaker.
                self.deps.breaker().record_failure(&self.channel.id);
                return PlayOutcome::Failed(SourceError::transient(e.to_string()));
            }
        };

        self.set_status(ChannelStatus::Running);
        let outcome = self
            .pump_source(lease, effective_offset, item.duration_secs(), stop_rx)
            .await;

        if matches!(outcome, PlayOutcome::Failed(_)) {
            self.deps.breaker().record_failure(&self.channel.id);
        }
        outcome
    }

    /// Drive bytes from a lease's stdout through throttle and hub until the
    /// source ends, fails, goes stale, is revoked, or the channel stops.
    async fn pump_source(
        &self,
        mut lease: PoolLease,
        start_offset: f64,
        item_duration: f64,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> PlayOutcome {
        let Some(mut stdout) = lease.stdout.take() else {
            self.deps.pool.release(lease.id).await;
            return PlayOutcome::Failed(SourceError::transient("source has no stdout"));
        };
        spawn_stderr_drain(self.channel.id.clone(), lease.pid, lease.stderr.take());

        let mut throttler = Throttler::new(self.channel.throttler);
        let mut revoke_rx = lease.revoke_rx.clone();
        let mut revoke_deadline: Option<tokio::time::Instant> = None;
        let stale_after = Duration::from_secs(self.deps.playout.health_stale_seconds);
        let started = self.deps.clock.now();
        let probe_window = self.deps.breaker().probe_window();
        let mut probe_reported = false;
        let mut last_progress = self.deps.clock.now();

        let mut pending = BytesMut::with_capacity(READ_CHUNK * 2);
        let mut read_buf = vec![0u8; READ_CHUNK];

        let outcome = loop {
            // A stable run past the probe window counts as a breaker success.
            if !probe_reported
                && self.deps.clock.now().duration_since(started) >= probe_window
            {
                self.deps.breaker().record_success(&self.channel.id);
                probe_reported = true;
            }

            if let Some(deadline) = revoke_deadline {
                if tokio::time::Instant::now() >= deadline {
                    info!("Revoke deadline reached before item boundary");
                    break PlayOutcome::Revoked;
                }
            }

            tokio::select! {
                biased;

                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break PlayOutcome::Stopped;
                    }
                }

                changed = revoke_rx.changed() => {
                    if changed.is_ok() && *revoke_rx.borrow() && revoke_deadline.is_none() {
                        info!("Lease revoked, restarting at next item boundary");
                        revoke_deadline =
                            Some(tokio::time::Instant::now() + REVOKE_BOUNDARY_DEADLINE);
                    }
                }

                read = tokio::time::timeout(stale_after, stdout.read(&mut read_buf)) => {
                    match read {
                        Err(_elapsed) => {
                            break PlayOutcome::Failed(SourceError::transient(format!(
                                "no bytes for {}s", stale_after.as_secs()
                            )));
                        }
                        Ok(Err(e)) => {
                            break PlayOutcome::Failed(SourceError::transient(e.to_string()));
                        }
                        Ok(Ok(0)) => {
                            // Natural EOF is an item boundary; a pending
                            // revoke is honored here.
                            break if revoke_deadline.is_some() {
                                PlayOutcome::Revoked
                            } else {
                                PlayOutcome::NaturalEnd
                            };
                        }
                        Ok(Ok(n)) => {
                            pending.extend_from_slice(&read_buf[..n]);
                            let aligned = pending.len() - pending.len() % TS_PACKET;
                            if aligned > 0 {
                                let chunk = pending.split_to(aligned).freeze();
                                throttler.acquire(chunk.len()).await;
                                self.broadcast(chunk);
                                self.relay_backpressure(&mut throttler);
                            }

                            if self.deps.clock.now().duration_since(last_progress)
                                >= PROGRESS_INTERVAL
                            {
                                last_progress = self.deps.clock.now();
                                let elapsed = start_offset
                                    + self.deps.clock.now().duration_since(started).as_secs_f64();
                                let _ = self.deps.timeline.record_progress(
                                    &self.channel.id,
                                    elapsed.min(item_duration),
                                );
                            }
                        }
                    }
                }
            }
        };

        // Flush whatever aligned tail is left before the source switches; a
        // sub-packet remainder is dropped so subscribers never see a torn
        // packet between two sources.
        let aligned = pending.len() - pending.len() % TS_PACKET;
        if aligned > 0 {
            self.broadcast(pending.split_to(aligned).freeze());
        }

        self.deps.pool.release(lease.id).await;
        outcome
    }

    fn broadcast(&self, chunk: Bytes) {
        let len = chunk.len() as u64;
        // No receivers is fine; always-on channels keep pumping.
        if self.hub_tx.send(chunk).is_ok() {
            metrics::channel::BYTES_OUT_TOTAL
                .with_label_values(&[&self.channel.number.to_string()])
                .inc_by(len);
        }
    }

    /// Feed the slowest subscriber's backlog into the throttler.
    ///
    /// `broadcast::Sender::len` is the queue depth as seen by the most
    /// lagged receiver, so a filling hub means downstream is not keeping up;
    /// adaptive mode stops banking credit until the hub drains again.
    fn relay_backpressure(&self, throttler: &mut Throttler) {
        match hub_backpressure(self.hub_tx.len(), self.hub_capacity) {
            Some(true) => throttler.mark_blocked(),
            Some(false) => throttler.mark_unblocked(),
            None => {}
        }
    }

    /// Plug the error-screen source into the hub for up to `window`.
    async fn serve_error_screen(
        &self,
        window: Duration,
        caption: &str,
        stop_rx: &mut watch::Receiver<bool>,
    ) {
        let caption = format!("channel {} - {}", self.channel.number, caption);
        let command = self
            .deps
            .error_screen
            .build_command(&self.deps.pool_config.ffmpeg_path, &caption);

        let lease = match self.deps.pool.acquire(&self.channel.id, &command, &[]).await {
            Ok(lease) => lease,
            Err(e) => {
                // Even the fallback could not start; keep the connection
                // open and idle out the window.
                debug!(error = %e, "Error screen unavailable");
                let _ = tokio::time::timeout(window, stop_rx.changed()).await;
                return;
            }
        };

        let mut lease = lease;
        let Some(mut stdout) = lease.stdout.take() else {
            self.deps.pool.release(lease.id).await;
            return;
        };
        spawn_stderr_drain(self.channel.id.clone(), lease.pid, lease.stderr.take());

        let mut throttler = Throttler::new(self.channel.throttler);
        let mut pending = BytesMut::with_capacity(READ_CHUNK * 2);
        let mut read_buf = vec![0u8; READ_CHUNK];
        let deadline = tokio::time::Instant::now() + window;

        let mut source_ended = false;
        loop {
            tokio::select! {
                biased;

                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() { break; }
                }
                _ = tokio::time::sleep_until(deadline) => break,
                read = stdout.read(&mut read_buf) => {
                    match read {
                        Ok(0) | Err(_) => {
                            source_ended = true;
                            break;
                        }
                        Ok(n) => {
                            pending.extend_from_slice(&read_buf[..n]);
                            let aligned = pending.len() - pending.len() % TS_PACKET;
                            if aligned > 0 {
                                let chunk = pending.split_to(aligned).freeze();
                                throttler.acquire(chunk.len()).await;
                                self.broadcast(chunk);
                                self.relay_backpressure(&mut throttler);
                            }
                        }
                    }
                }
            }
        }

        self.deps.pool.release(lease.id).await;

        // A fallback that dies early must not turn the caller into a spin
        // loop; idle out the remainder of the window.
        if source_ended && !*stop_rx.borrow() {
            let _ = tokio::time::timeout_at(deadline, stop_rx.changed()).await;
        }
    }
}

fn new_backoff() -> impl Iterator<Item = Duration> {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(1))
        .with_max_delay(Duration::from_secs(30))
        .without_max_times()
        .build()
}

/// Hysteresis over hub occupancy: blocked above half capacity, unblocked
/// below a quarter, unchanged in between.
fn hub_backpressure(queued: usize, capacity: usize) -> Option<bool> {
    if queued * 2 >= capacity {
        Some(true)
    } else if queued * 4 <= capacity {
        Some(false)
    } else {
        None
    }
}

fn spawn_stderr_drain(
    channel_id: ChannelId,
    pid: u32,
    stderr: Option<crate::service::pool::LeaseStderr>,
) {
    let Some(stderr) = stderr else { return };
    let span = logging::transcoder_span(&channel_id, pid);
    tokio::spawn(
        async move {
            use tokio::io::AsyncBufReadExt;
            let mut lines = tokio::io::BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("stderr: {}", line);
            }
        }
        .instrument(span),
    );
}

/// Owns every channel runtime; the boundary's lookup surface.
pub struct ChannelManager {
    runtimes: dashmap::DashMap<ChannelId, Arc<ChannelRuntime>>,
    by_number: dashmap::DashMap<u32, ChannelId>,
    deps: Arc<RuntimeDeps>,
}

impl ChannelManager {
    #[must_use]
    pub fn new(deps: Arc<RuntimeDeps>) -> Self {
        Self {
            runtimes: dashmap::DashMap::new(),
            by_number: dashmap::DashMap::new(),
            deps,
        }
    }

    /// Register a channel and start its runtime.
    pub fn add_channel(&self, channel: Channel) -> Arc<ChannelRuntime> {
        let runtime = ChannelRuntime::new(channel.clone(), Arc::clone(&self.deps));
        self.by_number.insert(channel.number, channel.id.clone());
        self.runtimes.insert(channel.id, Arc::clone(&runtime));
        runtime.start();
        runtime
    }

    #[must_use]
    pub fn get(&self, channel_id: &ChannelId) -> Option<Arc<ChannelRuntime>> {
        self.runtimes.get(channel_id).map(|e| Arc::clone(e.value()))
    }

    #[must_use]
    pub fn get_by_number(&self, number: u32) -> Option<Arc<ChannelRuntime>> {
        let id = self.by_number.get(&number).map(|e| e.value().clone())?;
        self.get(&id)
    }

    #[must_use]
    pub fn list(&self) -> Vec<Arc<ChannelRuntime>> {
        let mut runtimes: Vec<_> =
            self.runtimes.iter().map(|e| Arc::clone(e.value())).collect();
        runtimes.sort_by_key(|r| r.channel().number);
        runtimes
    }

    /// Unrecoverable runtime: every channel Failed with its breaker open.
    #[must_use]
    pub fn all_failed_with_breaker_open(&self) -> bool {
        let breaker = self.deps.governor.breaker();
        let runtimes = self.list();
        !runtimes.is_empty()
            && runtimes.iter().all(|r| {
                r.status() == ChannelStatus::Failed
                    && breaker.state(r.id())
                        == crate::service::breaker::CircuitState::Open
            })
    }

    /// Cascade stop for process shutdown.
    pub async fn stop_all(&self, reason: &str) {
        for runtime in self.list() {
            runtime.request_stop(reason).await;
        }
    }
}

//! Client session bookkeeping.
//!
//! Sharded by channel: one lock guards one channel's session table. Sessions
//! are never resurrected; a Disconnected session is dropped from the table
//! and only its audit line remains.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SharedClock};
use crate::config::SessionConfig;
use crate::metrics;
use crate::models::{ChannelId, Session, SessionId, SessionState};
use crate::repository::StateStore;

/// Why a session open was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionRejection {
    #[error("per-channel session cap reached")]
    PerChannelCap,
    #[error("server is shutting down")]
    ShuttingDown,
}

impl SessionRejection {
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            Self::PerChannelCap => "per_channel_cap",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

type Shard = Arc<Mutex<HashMap<SessionId, Session>>>;

pub struct SessionManager {
    config: SessionConfig,
    clock: SharedClock,
    shards: DashMap<ChannelId, Shard>,
    /// Session -> channel lookup for the by-id operations.
    index: DashMap<SessionId, ChannelId>,
    audit: Option<Arc<StateStore>>,
    accepting: AtomicBool,
}

impl SessionManager {
    #[must_use]
    pub fn new(config: SessionConfig, clock: SharedClock, audit: Option<Arc<StateStore>>) -> Self {
        Self {
            config,
            clock,
            shards: DashMap::new(),
            index: DashMap::new(),
            audit,
            accepting: AtomicBool::new(true),
        }
    }

    fn shard(&self, channel_id: &ChannelId) -> Shard {
        self.shards
            .entry(channel_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(HashMap::new())))
            .clone()
    }

    /// Open a session for a client connection.
    pub fn open(
        &self,
        channel_id: &ChannelId,
        client_addr: String,
        user_agent: String,
    ) -> Result<Session, SessionRejection> {
        if !self.accepting.load(Ordering::SeqCst) {
            metrics::channel::SESSIONS_REJECTED_TOTAL
                .with_label_values(&[SessionRejection::ShuttingDown.reason()])
                .inc();
            return Err(SessionRejection::ShuttingDown);
        }

        let shard = self.shard(channel_id);
        let mut sessions = shard.lock();
        if sessions.len() >= self.config.max_sessions_per_channel {
            metrics::channel::SESSIONS_REJECTED_TOTAL
                .with_label_values(&[SessionRejection::PerChannelCap.reason()])
                .inc();
            warn!(channel = %channel_id, cap = self.config.max_sessions_per_channel, "Session rejected at cap");
            return Err(SessionRejection::PerChannelCap);
        }

        let mut session = Session::new(
            channel_id.clone(),
            client_addr,
            user_agent,
            self.clock.wall_now(),
        );
        session.state = SessionState::Active;
        sessions.insert(session.session_id, session.clone());
        drop(sessions);

        self.index.insert(session.session_id, channel_id.clone());
        metrics::channel::SESSION_OPEN.inc();
        info!(channel = %channel_id, session = %session.session_id, addr = %session.client_addr, "Session opened");
        Ok(session)
    }

    /// Account bytes delivered to a session and refresh its activity clock.
    pub fn record_bytes(&self, session_id: &SessionId, n: u64) {
        let Some(channel_id) = self.index.get(session_id).map(|e| e.value().clone()) else {
            return;
        };
        let shard = self.shard(&channel_id);
        let mut sessions = shard.lock();
        if let Some(session) = sessions.get_mut(session_id) {
            session.bytes_sent += n;
            session.last_activity = self.clock.wall_now();
            session.state = SessionState::Active;
        }
    }

    /// Record a delivery error; force-closes the session past the error cap.
    pub fn record_error(&self, session_id: &SessionId, error: &str) {
        let Some(channel_id) = self.index.get(session_id).map(|e| e.value().clone()) else {
            return;
        };
        let shard = self.shard(&channel_id);
        let force_close = {
            let mut sessions = shard.lock();
            match sessions.get_mut(session_id) {
                Some(session) => {
                    // Bounded error history: oldest entries fall off.
                    if session.errors.len() >= self.config.max_errors_per_session {
                        session.errors.remove(0);
                    }
                    session.errors.push(error.to_string());
                    session.state = SessionState::Error;
                    session.errors.len() >= self.config.max_errors_per_session
                }
                None => false,
            }
        };
        if force_close {
            warn!(session = %session_id, "Session exceeded error budget, closing");
            self.close(session_id);
        }
    }

    /// Close and drop a session. Idempotent.
    pub fn close(&self, session_id: &SessionId) {
        let Some((_, channel_id)) = self.index.remove(session_id) else {
            return;
        };
        let shard = self.shard(&channel_id);
        let removed = shard.lock().remove(session_id);
        if let Some(mut session) = removed {
            session.state = SessionState::Disconnected;
            metrics::channel::SESSION_OPEN.dec();
            debug!(channel = %channel_id, session = %session_id, bytes = session.bytes_sent, "Session closed");
            self.audit_closed(&session);
        }
    }

    fn audit_closed(&self, session: &Session) {
        let Some(store) = &self.audit else { return };
        if let Some(path) = &self.config.audit_log_path {
            if let Err(e) = store.append_line(path, session) {
                debug!(error = %e, "Session audit write failed");
            }
        }
    }

    #[must_use]
    pub fn list_by_channel(&self, channel_id: &ChannelId) -> Vec<Session> {
        self.shards
            .get(channel_id)
            .map(|shard| shard.lock().values().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn open_count(&self, channel_id: &ChannelId) -> usize {
        self.shards
            .get(channel_id)
            .map(|shard| shard.lock().len())
            .unwrap_or(0)
    }

    /// Disconnect sessions idle past the timeout. Returns closed session ids.
    pub fn sweep_idle(&self) -> Vec<SessionId> {
        let now = self.clock.wall_now();
        let timeout = chrono::Duration::seconds(self.config.idle_timeout_seconds as i64);
        let mut expired = Vec::new();

        for entry in self.shards.iter() {
            let sessions = entry.value().lock();
            for (id, session) in sessions.iter() {
                if now - session.last_activity > timeout {
                    expired.push(*id);
                }
            }
        }
        for id in &expired {
            info!(session = %id, "Closing idle session");
            self.close(id);
        }
        expired
    }

    /// Start the periodic idle sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = Duration::from_secs(self.config.sweep_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.sweep_idle();
            }
        })
    }

    /// Stop admitting new sessions (process shutdown).
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Close every session of a channel (channel stop cascade).
    pub fn close_channel(&self, channel_id: &ChannelId) {
        let ids: Vec<SessionId> = self
            .shards
            .get(channel_id)
            .map(|shard| shard.lock().keys().copied().collect())
            .unwrap_or_default();
        for id in ids {
            self.close(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Utc;

    fn manager_with(mutate: impl FnOnce(&mut SessionConfig)) -> (Arc<ManualClock>, SessionManager) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut config = SessionConfig::default();
        mutate(&mut config);
        (clock.clone(), SessionManager::new(config, clock, None))
    }

    fn ch() -> ChannelId {
        ChannelId::from("c1")
    }

    #[test]
    fn open_close_roundtrip() {
        let (_clock, manager) = manager_with(|_| {});
        let session = manager.open(&ch(), "10.0.0.2:5100".into(), "VLC/3".into()).unwrap();
        assert_eq!(manager.open_count(&ch()), 1);

        manager.close(&session.session_id);
        assert_eq!(manager.open_count(&ch()), 0);
        // Second close is a no-op.
        manager.close(&session.session_id);
    }

    #[test]
    fn per_channel_cap_rejects() {
        let (_clock, manager) = manager_with(|c| c.max_sessions_per_channel = 2);
        manager.open(&ch(), "a".into(), "ua".into()).unwrap();
        manager.open(&ch(), "b".into(), "ua".into()).unwrap();
        let err = manager.open(&ch(), "c".into(), "ua".into()).unwrap_err();
        assert_eq!(err, SessionRejection::PerChannelCap);
        assert_eq!(manager.open_count(&ch()), 2);
    }

    #[test]
    fn cap_is_per_channel_not_global() {
        let (_clock, manager) = manager_with(|c| c.max_sessions_per_channel = 1);
        manager.open(&ChannelId::from("a"), "x".into(), "ua".into()).unwrap();
        assert!(manager.open(&ChannelId::from("b"), "y".into(), "ua".into()).is_ok());
    }

    #[test]
    fn record_bytes_updates_activity() {
        let (clock, manager) = manager_with(|_| {});
        let session = manager.open(&ch(), "a".into(), "ua".into()).unwrap();

        clock.advance(Duration::from_secs(100));
        manager.record_bytes(&session.session_id, 18_800);

        let sessions = manager.list_by_channel(&ch());
        assert_eq!(sessions[0].bytes_sent, 18_800);
        assert!(sessions[0].last_activity > session.last_activity);
    }

    #[test]
    fn idle_sessions_are_swept() {
        let (clock, manager) = manager_with(|c| c.idle_timeout_seconds = 300);
        let stale = manager.open(&ch(), "a".into(), "ua".into()).unwrap();
        clock.advance(Duration::from_secs(200));
        let fresh = manager.open(&ch(), "b".into(), "ua".into()).unwrap();

        clock.advance(Duration::from_secs(150));
        let swept = manager.sweep_idle();
        assert_eq!(swept, vec![stale.session_id]);
        assert_eq!(manager.open_count(&ch()), 1);
        assert_eq!(manager.list_by_channel(&ch())[0].session_id, fresh.session_id);
    }

    #[test]
    fn error_budget_force_closes() {
        let (_clock, manager) = manager_with(|c| c.max_errors_per_session = 3);
        let session = manager.open(&ch(), "a".into(), "ua".into()).unwrap();

        manager.record_error(&session.session_id, "write failed");
        manager.record_error(&session.session_id, "write failed");
        assert_eq!(manager.open_count(&ch()), 1);
        manager.record_error(&session.session_id, "write failed");
        assert_eq!(manager.open_count(&ch()), 0);
    }

    #[test]
    fn shutdown_rejects_new_sessions() {
        let (_clock, manager) = manager_with(|_| {});
        manager.stop_accepting();
        let err = manager.open(&ch(), "a".into(), "ua".into()).unwrap_err();
        assert_eq!(err, SessionRejection::ShuttingDown);
    }

    #[test]
    fn close_channel_cascades() {
        let (_clock, manager) = manager_with(|_| {});
        manager.open(&ch(), "a".into(), "ua".into()).unwrap();
        manager.open(&ch(), "b".into(), "ua".into()).unwrap();
        manager.close_channel(&ch());
        assert_eq!(manager.open_count(&ch()), 0);
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::{ChannelId, SessionId};

/// Client session lifecycle state. A disconnected session is never resurrected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Active,
    Idle,
    Error,
    Disconnected,
}

/// One client connection reading a channel's byte stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub channel_id: ChannelId,
    pub client_addr: String,
    pub user_agent: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub bytes_sent: u64,
    /// Bounded; oldest entries are dropped first.
    pub errors: Vec<String>,
    pub restart_count: u32,
}

impl Session {
    #[must_use]
    pub fn new(channel_id: ChannelId, client_addr: String, user_agent: String, now: DateTime<Utc>) -> Self {
        Self {
            session_id: SessionId::new(),
            channel_id,
            client_addr,
            user_agent,
            state: SessionState::Created,
            created_at: now,
            last_activity: now,
            bytes_sent: 0,
            errors: Vec::new(),
            restart_count: 0,
        }
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        !matches!(self.state, SessionState::Disconnected)
    }
}

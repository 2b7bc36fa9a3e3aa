//! Playout anchor persistence.

use std::sync::Arc;

use crate::error::Result;
use crate::models::{ChannelId, PlayoutAnchor};

use super::state::StateStore;

/// Stores one anchor document per channel.
///
/// Writes are at-least-once; every anchor carries a monotonic revision and a
/// reload ignores anything staler than what is already on disk.
#[derive(Debug, Clone)]
pub struct AnchorRepository {
    store: Arc<StateStore>,
}

impl AnchorRepository {
    #[must_use]
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    fn path(channel_id: &ChannelId) -> String {
        format!("anchors/{channel_id}.json")
    }

    pub fn load(&self, channel_id: &ChannelId) -> Result<Option<PlayoutAnchor>> {
        self.store.read(&Self::path(channel_id))
    }

    /// Persist the anchor unless a newer revision is already on disk.
    pub fn save(&self, anchor: &PlayoutAnchor) -> Result<()> {
        if let Some(existing) = self.load(&anchor.channel_id)? {
            if existing.revision > anchor.revision {
                tracing::debug!(
                    channel = %anchor.channel_id,
                    disk_revision = existing.revision,
                    anchor_revision = anchor.revision,
                    "Skipping stale anchor write"
                );
                return Ok(());
            }
        }
        self.store.write(&Self::path(&anchor.channel_id), anchor)
    }
}

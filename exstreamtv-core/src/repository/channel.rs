//! Channel and schedule records, read-only for the streaming core.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::models::{Channel, ChannelId, ProgramSchedule};

use super::state::StateStore;

/// Loads the channel lineup from `channels.json`.
#[derive(Debug, Clone)]
pub struct ChannelRepository {
    store: Arc<StateStore>,
}

impl ChannelRepository {
    #[must_use]
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// All channel records, in file order.
    pub fn load_all(&self) -> Result<Vec<Channel>> {
        Ok(self.store.read("channels.json")?.unwrap_or_default())
    }

    /// Enabled channels, sorted by display number.
    pub fn load_enabled(&self) -> Result<Vec<Channel>> {
        let mut channels: Vec<Channel> = self
            .load_all()?
            .into_iter()
            .filter(|c| c.enabled)
            .collect();
        channels.sort_by_key(|c| c.number);
        Ok(channels)
    }

    pub fn find_by_number(&self, number: u32) -> Result<Channel> {
        self.load_enabled()?
            .into_iter()
            .find(|c| c.number == number)
            .ok_or_else(|| Error::ChannelNotFound(format!("number {number}")))
    }
}

/// Loads one program schedule per channel from `schedules/<id>.json`.
#[derive(Debug, Clone)]
pub struct ScheduleRepository {
    store: Arc<StateStore>,
}

impl ScheduleRepository {
    #[must_use]
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    pub fn load(&self, channel_id: &ChannelId) -> Result<ProgramSchedule> {
        self.store
            .read(&format!("schedules/{channel_id}.json"))?
            .ok_or_else(|| Error::NoPlayout(channel_id.to_string()))
    }

    pub fn load_optional(&self, channel_id: &ChannelId) -> Result<Option<ProgramSchedule>> {
        self.store.read(&format!("schedules/{channel_id}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{StreamingMode, ThrottlerConfig};

    fn channel(id: &str, number: u32, enabled: bool) -> Channel {
        Channel {
            id: ChannelId::from(id),
            number,
            device_slot: format!("{number:08X}"),
            name: format!("Channel {number}"),
            group: String::new(),
            enabled,
            streaming_mode: StreamingMode::Both,
            transcode_profile: None,
            fallback_filler: None,
            throttler: ThrottlerConfig::default(),
            always_on: false,
        }
    }

    #[test]
    fn load_enabled_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path()).unwrap());
        store
            .write(
                "channels.json",
                &vec![channel("b", 9, true), channel("a", 2, true), channel("c", 5, false)],
            )
            .unwrap();

        let repo = ChannelRepository::new(store);
        let enabled = repo.load_enabled().unwrap();
        assert_eq!(enabled.len(), 2);
        assert_eq!(enabled[0].number, 2);
        assert_eq!(enabled[1].number, 9);
    }

    #[test]
    fn find_by_number_misses_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path()).unwrap());
        store
            .write("channels.json", &vec![channel("c", 5, false)])
            .unwrap();

        let repo = ChannelRepository::new(store);
        assert!(matches!(
            repo.find_by_number(5),
            Err(Error::ChannelNotFound(_))
        ));
    }

    #[test]
    fn missing_schedule_is_no_playout() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path()).unwrap());
        let repo = ScheduleRepository::new(store);
        assert!(matches!(
            repo.load(&ChannelId::from("ghost")),
            Err(Error::NoPlayout(_))
        ));
    }
}

//! Content selection strategies.
//!
//! Both strategies are pure over (configuration, persisted picker state,
//! context time); the only data they touch beyond their inputs is collection
//! membership.

pub mod balance;
pub mod timeslot;

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::models::MediaItem;

pub use balance::BalancePicker;
pub use timeslot::TimeSlotPicker;

/// Read-only view of collection membership.
pub trait CollectionSource: Send + Sync {
    /// Items of a named collection, in library order.
    fn items(&self, collection: &str) -> Vec<MediaItem>;
}

/// In-memory collection map (used at startup and in tests).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Collections {
    pub collections: HashMap<String, Vec<MediaItem>>,
}

impl CollectionSource for Collections {
    fn items(&self, collection: &str) -> Vec<MediaItem> {
        self.collections.get(collection).cloned().unwrap_or_default()
    }
}

/// What the picker chose for "now".
#[derive(Debug, Clone, PartialEq)]
pub enum Pick {
    Item(MediaItem),
    /// No content is scheduled; the channel runtime serves the error screen.
    DeadAir,
}

/// Persisted picker state, serialized alongside the channel anchor.
///
/// All strategy bookkeeping lives here so a picker can be rebuilt from disk
/// and produce the same sequence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PickerState {
    /// Balance: unix seconds of the last pick per source collection.
    pub last_picked_at: HashMap<String, i64>,
    /// Balance: consecutive picks per source collection.
    pub consecutive_count: HashMap<String, u32>,
    /// Per-collection cursor for shuffle-without-repeats sub-ordering.
    pub cursor: HashMap<String, usize>,
    /// Seed for reproducible in-cycle shuffles.
    pub shuffle_seed: u64,
    /// Advances on every randomized decision so replays stay deterministic.
    pub draw_counter: u64,
}

/// A strategy that selects the next media item for a channel.
pub trait NextItemPicker: Send + Sync {
    /// Pick what should play at `context_time`, mutating `state` bookkeeping.
    fn pick_next(
        &self,
        collections: &dyn CollectionSource,
        state: &mut PickerState,
        context_time: DateTime<Utc>,
    ) -> Pick;
}

/// Weekday bit in the Sunday=1 .. Saturday=64 convention.
#[must_use]
pub fn weekday_bit(time: DateTime<Utc>) -> u8 {
    match time.weekday() {
        Weekday::Sun => 1,
        Weekday::Mon => 2,
        Weekday::Tue => 4,
        Weekday::Wed => 8,
        Weekday::Thu => 16,
        Weekday::Fri => 32,
        Weekday::Sat => 64,
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn weekday_bits_follow_sunday_first_convention() {
        // 2025-06-01 is a Sunday.
        let sunday = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        assert_eq!(weekday_bit(sunday), 1);
        assert_eq!(weekday_bit(sunday + chrono::Duration::days(1)), 2);
        assert_eq!(weekday_bit(sunday + chrono::Duration::days(6)), 64);
    }
}

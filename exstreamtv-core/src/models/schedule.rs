use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use super::media::MediaItem;

/// One entry of a channel's program schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleItem {
    pub media: MediaItem,
    /// Override for the cycle order; defaults to list position.
    #[serde(default)]
    pub position: Option<u32>,
}

/// Ordered program schedule attached to a channel.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProgramSchedule {
    pub items: Vec<ScheduleItem>,
    /// Multi-part episode groups stay contiguous across restarts.
    pub keep_multi_part_episodes: bool,
    /// Reproducible per-cycle shuffle.
    pub shuffle: bool,
    /// Random offset into the cycle, applied only at cycle creation.
    pub random_start_point: bool,
    /// Content selection strategy; `None` plays the schedule in order.
    pub picker: Option<PickerConfig>,
}

/// Scheduler strategy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum PickerConfig {
    TimeSlot(TimeSlotSchedule),
    Balance(BalanceConfig),
}

/// Ordering of items inside a time slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SlotOrderMode {
    #[default]
    Ordered,
    Shuffle,
    Random,
}

/// What fills the time between a slot's content ending and the next slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SlotPaddingMode {
    /// Dead air; the channel runtime falls back to the error screen.
    #[default]
    None,
    /// Pick from the configured filler preset.
    Filler,
    /// Replay the slot content from the beginning.
    Loop,
    /// Start the next slot early.
    Next,
}

/// How a slot boundary treats an item that does not fit exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SlotFlexMode {
    /// Cut the current item at the boundary.
    #[default]
    None,
    /// Let the item overflow and compress the remaining slots.
    Extend,
    /// Skip items to fit. Never splits a multi-part group.
    Compress,
}

/// Day-of-week bitmask: Sunday=1, Monday=2, ..., Saturday=64.
pub const DAY_SUNDAY: u8 = 1;
pub const DAY_MONDAY: u8 = 2;
pub const DAY_TUESDAY: u8 = 4;
pub const DAY_WEDNESDAY: u8 = 8;
pub const DAY_THURSDAY: u8 = 16;
pub const DAY_FRIDAY: u8 = 32;
pub const DAY_SATURDAY: u8 = 64;
pub const DAY_ALL: u8 = 127;

/// A (startTime, duration, daysMask) window in a time-slot schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start_time: NaiveTime,
    pub duration_minutes: u32,
    pub collection: String,
    #[serde(default)]
    pub order_mode: SlotOrderMode,
    #[serde(default)]
    pub padding_mode: SlotPaddingMode,
    #[serde(default)]
    pub flex_mode: SlotFlexMode,
    #[serde(default = "default_days_mask")]
    pub days_of_week_mask: u8,
}

fn default_days_mask() -> u8 {
    DAY_ALL
}

impl TimeSlot {
    /// Whether this slot is active on the given weekday.
    ///
    /// `weekday_bit` uses the Sunday=1 .. Saturday=64 convention.
    #[must_use]
    pub fn active_on(&self, weekday_bit: u8) -> bool {
        self.days_of_week_mask & weekday_bit != 0
    }
}

/// Time-slot schedule: a set of slots plus the filler preset for padding.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TimeSlotSchedule {
    pub slots: Vec<TimeSlot>,
    pub filler_preset: Option<String>,
}

/// One weighted source for the balance strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentSource {
    pub collection: String,
    pub weight: f64,
    #[serde(default)]
    pub cooldown_minutes: u32,
    #[serde(default = "default_max_consecutive")]
    pub max_consecutive: u32,
}

fn default_max_consecutive() -> u32 {
    u32::MAX
}

/// Balance strategy configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BalanceConfig {
    pub sources: Vec<ContentSource>,
}

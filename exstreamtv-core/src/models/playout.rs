use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::ChannelId;
use super::media::MediaRef;

/// Why an item is in the playout cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FillerKind {
    /// Regular scheduled content.
    #[default]
    None,
    /// Gap filler inserted by a padding mode.
    Padding,
    /// Fallback filler configured on the channel.
    Fallback,
    /// Dead air: nothing scheduled. The runtime serves the error screen and
    /// the guide omits the window.
    DeadAir,
}

/// One ordered entry of a playout cycle. Immutable within the cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayoutItem {
    pub media_ref: MediaRef,
    pub title: String,
    /// Seconds into the media where playback starts.
    pub in_point: f64,
    /// Seconds into the media where playback stops.
    pub out_point: f64,
    /// Wall-clock time this item is expected to finish, from the cycle plan.
    pub finish_time_expected: DateTime<Utc>,
    #[serde(default)]
    pub filler_kind: FillerKind,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub episode: Option<String>,
    /// Items sharing a group id form one multi-part episode.
    #[serde(default)]
    pub multi_part_group: Option<String>,
}

impl PlayoutItem {
    /// Playable duration in seconds.
    #[must_use]
    pub fn duration_secs(&self) -> f64 {
        (self.out_point - self.in_point).max(0.0)
    }
}

/// Authoritative per-channel "where we are" record.
///
/// Persisted at least every flush interval and on every item transition; the
/// EPG is derived from this record, never from an independent timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayoutAnchor {
    pub channel_id: ChannelId,
    /// Wall-clock time the current playout cycle began.
    pub cycle_start_time: DateTime<Utc>,
    /// Wall-clock start of the currently playing item.
    pub current_item_start_time: DateTime<Utc>,
    /// Seconds consumed of the current item; monotonically increasing.
    pub elapsed_in_item: f64,
    /// Index into the cycle's ordered item list.
    pub item_index: usize,
    /// Seed for the cycle's reproducible shuffle.
    pub cycle_seed: u64,
    /// Monotonic write counter; reloads ignore stale revisions.
    pub revision: u64,
}

impl PlayoutAnchor {
    #[must_use]
    pub fn new(channel_id: ChannelId, cycle_start: DateTime<Utc>, cycle_seed: u64) -> Self {
        Self {
            channel_id,
            cycle_start_time: cycle_start,
            current_item_start_time: cycle_start,
            elapsed_in_item: 0.0,
            item_index: 0,
            cycle_seed,
            revision: 0,
        }
    }

    /// Advance the anchor to the next item at the given transition time.
    pub fn advance_to(&mut self, item_index: usize, at: DateTime<Utc>) {
        self.item_index = item_index;
        self.current_item_start_time = at;
        self.elapsed_in_item = 0.0;
        self.revision += 1;
    }

    /// Record progress within the current item.
    pub fn record_elapsed(&mut self, elapsed: f64) {
        if elapsed > self.elapsed_in_item {
            self.elapsed_in_item = elapsed;
        }
        self.revision += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn anchor() -> PlayoutAnchor {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
        PlayoutAnchor::new(ChannelId::from("c1"), start, 7)
    }

    #[test]
    fn advance_resets_elapsed_and_bumps_revision() {
        let mut a = anchor();
        a.record_elapsed(55.0);
        let rev = a.revision;
        let t = a.cycle_start_time + chrono::Duration::seconds(600);
        a.advance_to(1, t);
        assert_eq!(a.item_index, 1);
        assert_eq!(a.elapsed_in_item, 0.0);
        assert_eq!(a.current_item_start_time, t);
        assert!(a.revision > rev);
    }

    #[test]
    fn elapsed_is_monotonic() {
        let mut a = anchor();
        a.record_elapsed(30.0);
        a.record_elapsed(10.0);
        assert_eq!(a.elapsed_in_item, 30.0);
    }

    #[test]
    fn item_duration_from_in_out_points() {
        let item = PlayoutItem {
            media_ref: MediaRef::Local { path: "/m/x.mkv".into() },
            title: "X".into(),
            in_point: 10.0,
            out_point: 70.0,
            finish_time_expected: Utc.with_ymd_and_hms(2025, 3, 1, 8, 10, 0).unwrap(),
            filler_kind: FillerKind::None,
            description: None,
            episode: None,
            multi_part_group: None,
        };
        assert_eq!(item.duration_secs(), 60.0);
    }
}

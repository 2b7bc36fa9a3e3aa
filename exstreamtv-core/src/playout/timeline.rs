//! Per-channel playout timeline.
//!
//! Resolves "what should play at time T" and "where within that item", and
//! keeps the anchor consistent across restarts. The EPG is a projection of
//! this component; it never computes its own ordering.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::clock::{Clock, SharedClock};
use crate::config::PlayoutConfig;
use crate::error::{Error, Result};
use crate::models::{
    Channel, ChannelId, FillerKind, MediaRef, PlayoutAnchor, PlayoutItem, ProgramSchedule,
};
use crate::repository::{AnchorRepository, StateStore};
use crate::schedule::{
    BalancePicker, CollectionSource, NextItemPicker, Pick, PickerState, TimeSlotPicker,
};

use super::cycle::{build_cycle, plan_items};

/// Dead-air planning granularity: gaps are planned in windows of this size.
const GAP_PLAN_SECS: f64 = 300.0;

/// Upper bound on planned items per channel (picker-driven plans).
const MAX_PLANNED_ITEMS: usize = 500;

/// One programme of the derived guide window.
#[derive(Debug, Clone)]
pub struct Programme {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub item: PlayoutItem,
}

struct PickerHandle {
    picker: Box<dyn NextItemPicker>,
    collections: Arc<dyn CollectionSource>,
    state: PickerState,
}

struct ChannelPlayout {
    items: Vec<PlayoutItem>,
    anchor: PlayoutAnchor,
    picker: Option<PickerHandle>,
    /// Static cycles wrap; picker-driven plans extend instead.
    wraps: bool,
    last_flush: Instant,
    fallback_filler: Option<String>,
}

impl ChannelPlayout {
    fn item(&self, index: usize) -> Option<&PlayoutItem> {
        self.items.get(index)
    }

    fn total_cycle_secs(&self) -> f64 {
        self.items.iter().map(PlayoutItem::duration_secs).sum()
    }
}

/// Maintains what-plays-when for every registered channel.
pub struct PlayoutTimeline {
    channels: DashMap<ChannelId, Arc<Mutex<ChannelPlayout>>>,
    anchors: AnchorRepository,
    store: Arc<StateStore>,
    clock: SharedClock,
    config: PlayoutConfig,
}

impl PlayoutTimeline {
    #[must_use]
    pub fn new(
        anchors: AnchorRepository,
        store: Arc<StateStore>,
        clock: SharedClock,
        config: PlayoutConfig,
    ) -> Self {
        Self {
            channels: DashMap::new(),
            anchors,
            store,
            clock,
            config,
        }
    }

    /// Register a channel, resuming from a persisted anchor when one exists.
    pub fn register(
        &self,
        channel: &Channel,
        schedule: &ProgramSchedule,
        collections: Arc<dyn CollectionSource>,
    ) -> Result<()> {
        let now = self.clock.wall_now();
        let persisted = self.anchors.load(&channel.id)?;

        let (anchor, is_resume) = match persisted {
            Some(a) => {
                info!(channel = %channel.id, revision = a.revision, "Resuming playout from persisted anchor");
                (a, true)
            }
            None => {
                let seed = seed_from_wall(now, &channel.id);
                (PlayoutAnchor::new(channel.id.clone(), now, seed), false)
            }
        };

        let mut picker_state: PickerState = self
            .store
            .read(&format!("picker_state/{}.json", channel.id))?
            .unwrap_or_default();
        if picker_state.shuffle_seed == 0 {
            picker_state.shuffle_seed = anchor.cycle_seed;
        }

        let static_cycle = !schedule.items.is_empty();
        let mut playout = if static_cycle {
            let (items, start_index) = build_cycle(schedule, anchor.cycle_start_time, anchor.cycle_seed);
            let mut anchor = anchor;
            if !is_resume && start_index > 0 {
                anchor.item_index = start_index;
            }
            ChannelPlayout {
                items,
                anchor,
                picker: None,
                wraps: true,
                last_flush: self.clock.now(),
                fallback_filler: channel.fallback_filler.clone(),
            }
        } else {
            let picker: Box<dyn NextItemPicker> = match &schedule.picker {
                Some(crate::models::PickerConfig::TimeSlot(ts)) => {
                    Box::new(TimeSlotPicker::new(ts.clone()))
                }
                Some(crate::models::PickerConfig::Balance(b)) => {
                    Box::new(BalancePicker::new(b.clone()))
                }
                None => return Err(Error::NoPlayout(channel.id.to_string())),
            };
            ChannelPlayout {
                items: Vec::new(),
                anchor,
                picker: Some(PickerHandle {
                    picker,
                    collections,
                    state: picker_state,
                }),
                wraps: false,
                last_flush: self.clock.now(),
                fallback_filler: channel.fallback_filler.clone(),
            }
        };

        // Plan far enough ahead that locate() has something to walk.
        if !playout.wraps {
            Self::extend_plan(&mut playout, now + chrono::Duration::hours(1));
        }

        if playout.items.is_empty() && playout.wraps {
            return Err(Error::NoPlayout(channel.id.to_string()));
        }

        self.persist(&playout)?;
        self.channels
            .insert(channel.id.clone(), Arc::new(Mutex::new(playout)));
        Ok(())
    }

    pub fn deregister(&self, channel_id: &ChannelId) {
        self.channels.remove(channel_id);
    }

    fn entry(&self, channel_id: &ChannelId) -> Result<Arc<Mutex<ChannelPlayout>>> {
        self.channels
            .get(channel_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| Error::ChannelNotFound(channel_id.to_string()))
    }

    /// Resolve (item index, seconds into the item) at wall time `t`.
    ///
    /// Pure over the registered (schedule, anchor); does not mutate state.
    pub fn locate(&self, channel_id: &ChannelId, t: DateTime<Utc>) -> Result<(usize, f64)> {
        let entry = self.entry(channel_id)?;
        let playout = entry.lock();
        Ok(Self::walk(&playout, t))
    }

    fn walk(playout: &ChannelPlayout, t: DateTime<Utc>) -> (usize, f64) {
        let anchor = &playout.anchor;
        let mut offset =
            (t - anchor.current_item_start_time).num_milliseconds() as f64 / 1000.0;
        if offset < 0.0 {
            offset = 0.0;
        }

        let len = playout.items.len();
        if len == 0 {
            return (0, 0.0);
        }

        // Collapse whole laps for wrapping cycles before walking.
        if playout.wraps {
            let total = playout.total_cycle_secs();
            if total > 0.0 && offset >= total {
                offset %= total;
            }
        }

        let mut idx = anchor.item_index.min(len - 1);
        loop {
            let duration = playout.items[idx].duration_secs();
            if offset < duration || duration <= 0.0 {
                return (idx, offset.max(0.0));
            }
            offset -= duration;
            let next = idx + 1;
            if next >= len {
                if playout.wraps {
                    idx = 0;
                } else {
                    // Plan exhausted: clamp to the final item's start.
                    return (len - 1, 0.0);
                }
            } else {
                idx = next;
            }
        }
    }

    /// Move to the next item at a planned transition, updating and persisting
    /// the anchor.
    pub fn advance(&self, channel_id: &ChannelId, now: DateTime<Utc>) -> Result<PlayoutItem> {
        let entry = self.entry(channel_id)?;
        let mut playout = entry.lock();

        if !playout.wraps {
            Self::extend_plan(&mut playout, now + chrono::Duration::hours(1));
        }

        let len = playout.items.len();
        if len == 0 {
            return Err(Error::NoPlayout(channel_id.to_string()));
        }

        let next = if playout.anchor.item_index + 1 >= len {
            if playout.wraps {
                // New lap of the same cycle.
                0
            } else {
                len - 1
            }
        } else {
            playout.anchor.item_index + 1
        };

        playout.anchor.advance_to(next, now);
        debug!(channel = %channel_id, item = next, "Playout advanced");
        self.persist(&playout)?;
        playout.last_flush = self.clock.now();
        let item = playout
            .item(next)
            .cloned()
            .ok_or_else(|| Error::NoPlayout(channel_id.to_string()))?;
        Ok(item)
    }

    /// After an unexpected restart, resolve where to resume.
    ///
    /// Derived from `current_item_start_time + elapsed_in_item` plus the wall
    /// time that passed while the channel was down; the anchor is re-pinned to
    /// the located position.
    pub fn resume_offset(
        &self,
        channel_id: &ChannelId,
        now: DateTime<Utc>,
    ) -> Result<(PlayoutItem, f64)> {
        let entry = self.entry(channel_id)?;
        let mut playout = entry.lock();

        let wall_offset =
            (now - playout.anchor.current_item_start_time).num_milliseconds() as f64 / 1000.0;
        // Clock drift tolerance: never resume earlier than observed progress.
        let effective = if wall_offset + self.config.resume_drift_tolerance_seconds
            < playout.anchor.elapsed_in_item
        {
            playout.anchor.elapsed_in_item
        } else {
            wall_offset.max(0.0)
        };

        let target = playout.anchor.current_item_start_time
            + chrono::Duration::milliseconds((effective * 1000.0) as i64);
        let (idx, offset) = Self::walk(&playout, target);

        if idx != playout.anchor.item_index {
            let item_start = now - chrono::Duration::milliseconds((offset * 1000.0) as i64);
            playout.anchor.advance_to(idx, item_start);
        }
        playout.anchor.record_elapsed(offset);
        self.persist(&playout)?;
        playout.last_flush = self.clock.now();

        let item = playout
            .item(idx)
            .cloned()
            .ok_or_else(|| Error::NoPlayout(channel_id.to_string()))?;
        Ok((item, offset))
    }

    /// Record playback progress; flushes the anchor when the interval is due.
    pub fn record_progress(&self, channel_id: &ChannelId, elapsed_secs: f64) -> Result<()> {
        let entry = self.entry(channel_id)?;
        let mut playout = entry.lock();
        playout.anchor.record_elapsed(elapsed_secs);

        let due = self.clock.now().duration_since(playout.last_flush).as_secs()
            >= self.config.anchor_flush_seconds;
        if due {
            self.persist(&playout)?;
            playout.last_flush = self.clock.now();
        }
        Ok(())
    }

    /// Current item plus a copy of the anchor.
    pub fn current(&self, channel_id: &ChannelId) -> Result<(PlayoutItem, PlayoutAnchor)> {
        let entry = self.entry(channel_id)?;
        let playout = entry.lock();
        let item = playout
            .item(playout.anchor.item_index)
            .cloned()
            .ok_or_else(|| Error::NoPlayout(channel_id.to_string()))?;
        Ok((item, playout.anchor.clone()))
    }

    /// Guide window derived from the anchor: the current programme and
    /// everything after it within `horizon`.
    pub fn programme_window(
        &self,
        channel_id: &ChannelId,
        horizon: chrono::Duration,
    ) -> Result<Vec<Programme>> {
        let entry = self.entry(channel_id)?;
        let playout = entry.lock();
        let len = playout.items.len();
        if len == 0 {
            return Ok(Vec::new());
        }

        let end = playout.anchor.current_item_start_time + horizon;
        let mut programmes = Vec::new();
        let mut start = playout.anchor.current_item_start_time;
        let mut idx = playout.anchor.item_index.min(len - 1);

        while start < end {
            let Some(item) = playout.item(idx) else { break };
            let stop =
                start + chrono::Duration::milliseconds((item.duration_secs() * 1000.0) as i64);
            programmes.push(Programme { start, stop, item: item.clone() });
            start = stop;
            let next = idx + 1;
            if next >= len {
                if playout.wraps {
                    idx = 0;
                } else {
                    break;
                }
            } else {
                idx = next;
            }
        }
        Ok(programmes)
    }

    /// Persist the channel's anchor and picker state immediately.
    pub fn flush(&self, channel_id: &ChannelId) -> Result<()> {
        let entry = self.entry(channel_id)?;
        let mut playout = entry.lock();
        self.persist(&playout)?;
        playout.last_flush = self.clock.now();
        Ok(())
    }

    /// Persist every registered channel (used at shutdown).
    pub fn flush_all(&self) {
        for entry in self.channels.iter() {
            let playout = entry.value().lock();
            if let Err(e) = self.persist(&playout) {
                tracing::warn!(channel = %entry.key(), error = %e, "Failed to flush anchor");
            }
        }
    }

    fn persist(&self, playout: &ChannelPlayout) -> Result<()> {
        self.anchors.save(&playout.anchor)?;
        if let Some(handle) = &playout.picker {
            self.store.write(
                &format!("picker_state/{}.json", playout.anchor.channel_id),
                &handle.state,
            )?;
        }
        Ok(())
    }

    /// Extend a picker-driven plan until it covers `until`.
    fn extend_plan(playout: &mut ChannelPlayout, until: DateTime<Utc>) {
        let fallback = playout.fallback_filler.clone();
        let Some(handle) = playout.picker.as_mut() else { return };

        let mut projected = playout
            .items
            .last()
            .map_or(playout.anchor.cycle_start_time, |i| i.finish_time_expected);

        while projected < until && playout.items.len() < MAX_PLANNED_ITEMS {
            match handle
                .picker
                .pick_next(handle.collections.as_ref(), &mut handle.state, projected)
            {
                Pick::Item(media) => {
                    let planned = plan_items(vec![media], projected);
                    projected = planned
                        .last()
                        .map_or(projected, |i| i.finish_time_expected);
                    playout.items.extend(planned);
                }
                Pick::DeadAir => {
                    let stop = projected
                        + chrono::Duration::milliseconds((GAP_PLAN_SECS * 1000.0) as i64);
                    playout.items.push(PlayoutItem {
                        media_ref: MediaRef::Filler {
                            preset: fallback.clone().unwrap_or_default(),
                        },
                        title: String::new(),
                        in_point: 0.0,
                        out_point: GAP_PLAN_SECS,
                        finish_time_expected: stop,
                        filler_kind: FillerKind::DeadAir,
                        description: None,
                        episode: None,
                        multi_part_group: None,
                    });
                    projected = stop;
                }
            }
        }
    }
}

/// Cycle seed derived from the creation wall time and channel id.
fn seed_from_wall(now: DateTime<Utc>, channel_id: &ChannelId) -> u64 {
    use std::hash::{DefaultHasher, Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    now.timestamp_millis().hash(&mut hasher);
    channel_id.as_str().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{MediaItem, ScheduleItem, StreamingMode, ThrottlerConfig};
    use crate::schedule::Collections;
    use chrono::TimeZone;

    fn channel(id: &str) -> Channel {
        Channel {
            id: ChannelId::from(id),
            number: 5,
            device_slot: "00000005".into(),
            name: "Five".into(),
            group: String::new(),
            enabled: true,
            streaming_mode: StreamingMode::Both,
            transcode_profile: None,
            fallback_filler: None,
            throttler: ThrottlerConfig::default(),
            always_on: false,
        }
    }

    fn media(title: &str, duration: f64) -> MediaItem {
        MediaItem {
            media_ref: MediaRef::Local { path: format!("/m/{title}.mkv") },
            title: title.to_string(),
            duration_secs: Some(duration),
            video_codec: None,
            audio_codec: None,
            container: None,
            direct_play_friendly: false,
            description: None,
            episode: None,
            multi_part_group: None,
        }
    }

    fn schedule(items: &[(&str, f64)]) -> ProgramSchedule {
        ProgramSchedule {
            items: items
                .iter()
                .map(|(t, d)| ScheduleItem { media: media(t, *d), position: None })
                .collect(),
            ..Default::default()
        }
    }

    fn timeline(start: DateTime<Utc>) -> (tempfile::TempDir, PlayoutTimeline, Arc<ManualClock>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path()).unwrap());
        let clock = Arc::new(ManualClock::new(start));
        let tl = PlayoutTimeline::new(
            AnchorRepository::new(Arc::clone(&store)),
            store,
            clock.clone(),
            PlayoutConfig::default(),
        );
        (dir, tl, clock)
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 8, 0, 0).unwrap()
    }

    #[test]
    fn locate_walks_items_in_order() {
        let (_d, tl, clock) = timeline(start());
        tl.register(&channel("c1"), &schedule(&[("a", 600.0), ("b", 300.0)]), Arc::new(Collections::default()))
            .unwrap();

        let (idx, off) = tl.locate(&ChannelId::from("c1"), clock.wall_now()).unwrap();
        assert_eq!((idx, off), (0, 0.0));

        let (idx, off) = tl
            .locate(&ChannelId::from("c1"), start() + chrono::Duration::seconds(700))
            .unwrap();
        assert_eq!(idx, 1);
        assert!((off - 100.0).abs() < 0.01);
    }

    #[test]
    fn locate_wraps_whole_laps() {
        let (_d, tl, _c) = timeline(start());
        tl.register(&channel("c1"), &schedule(&[("a", 600.0), ("b", 300.0)]), Arc::new(Collections::default()))
            .unwrap();

        // 2 laps (1800s) + 650s -> item b, 50s in.
        let t = start() + chrono::Duration::seconds(2 * 900 + 650);
        let (idx, off) = tl.locate(&ChannelId::from("c1"), t).unwrap();
        assert_eq!(idx, 1);
        assert!((off - 50.0).abs() < 0.01);
    }

    #[test]
    fn advance_moves_anchor_and_persists() {
        let (_d, tl, _c) = timeline(start());
        let id = ChannelId::from("c1");
        tl.register(&channel("c1"), &schedule(&[("a", 600.0), ("b", 300.0)]), Arc::new(Collections::default()))
            .unwrap();

        let item = tl.advance(&id, start() + chrono::Duration::seconds(600)).unwrap();
        assert_eq!(item.title, "b");
        let (_, anchor) = tl.current(&id).unwrap();
        assert_eq!(anchor.item_index, 1);
        assert_eq!(anchor.elapsed_in_item, 0.0);
    }

    #[test]
    fn advance_wraps_to_cycle_start() {
        let (_d, tl, _c) = timeline(start());
        let id = ChannelId::from("c1");
        tl.register(&channel("c1"), &schedule(&[("a", 600.0), ("b", 300.0)]), Arc::new(Collections::default()))
            .unwrap();

        tl.advance(&id, start() + chrono::Duration::seconds(600)).unwrap();
        let item = tl.advance(&id, start() + chrono::Duration::seconds(900)).unwrap();
        assert_eq!(item.title, "a");
    }

    #[test]
    fn resume_offset_accounts_for_downtime() {
        let (_d, tl, _c) = timeline(start());
        let id = ChannelId::from("c2");
        tl.register(&channel("c2"), &schedule(&[("film", 3600.0)]), Arc::new(Collections::default()))
            .unwrap();
        tl.record_progress(&id, 347.0).unwrap();

        // Server restarts; 20 seconds pass.
        let now = start() + chrono::Duration::seconds(367);
        let (item, offset) = tl.resume_offset(&id, now).unwrap();
        assert_eq!(item.title, "film");
        assert!((offset - 367.0).abs() <= 2.0, "offset {offset} not within tolerance");
    }

    #[test]
    fn resume_never_rewinds_behind_observed_progress() {
        let (_d, tl, _c) = timeline(start());
        let id = ChannelId::from("c2");
        tl.register(&channel("c2"), &schedule(&[("film", 3600.0)]), Arc::new(Collections::default()))
            .unwrap();
        tl.record_progress(&id, 500.0).unwrap();

        // Wall clock reports less than the observed progress.
        let now = start() + chrono::Duration::seconds(100);
        let (_, offset) = tl.resume_offset(&id, now).unwrap();
        assert!(offset >= 500.0);
    }

    #[test]
    fn resume_past_item_end_advances_to_next() {
        let (_d, tl, _c) = timeline(start());
        let id = ChannelId::from("c2");
        tl.register(&channel("c2"), &schedule(&[("a", 600.0), ("b", 600.0)]), Arc::new(Collections::default()))
            .unwrap();
        tl.record_progress(&id, 590.0).unwrap();

        let now = start() + chrono::Duration::seconds(650);
        let (item, offset) = tl.resume_offset(&id, now).unwrap();
        assert_eq!(item.title, "b");
        assert!((offset - 50.0).abs() <= 2.0);
    }

    #[test]
    fn anchor_reload_matches_pre_persist_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path()).unwrap());
        let clock = Arc::new(ManualClock::new(start()));
        let id = ChannelId::from("c3");
        let sched = schedule(&[("a", 600.0), ("b", 600.0)]);

        {
            let tl = PlayoutTimeline::new(
                AnchorRepository::new(Arc::clone(&store)),
                Arc::clone(&store),
                clock.clone(),
                PlayoutConfig::default(),
            );
            tl.register(&channel("c3"), &sched, Arc::new(Collections::default())).unwrap();
            tl.advance(&id, start() + chrono::Duration::seconds(600)).unwrap();
            tl.flush(&id).unwrap();
        }

        // Fresh timeline over the same store resumes identically.
        let tl = PlayoutTimeline::new(
            AnchorRepository::new(Arc::clone(&store)),
            store,
            clock,
            PlayoutConfig::default(),
        );
        tl.register(&channel("c3"), &sched, Arc::new(Collections::default())).unwrap();
        let t = start() + chrono::Duration::seconds(700);
        let (idx, off) = tl.locate(&id, t).unwrap();
        assert_eq!(idx, 1);
        assert!((off - 100.0).abs() < 0.01);
    }

    #[test]
    fn programme_window_derives_from_anchor() {
        let (_d, tl, _c) = timeline(start());
        let id = ChannelId::from("c1");
        tl.register(&channel("c1"), &schedule(&[("a", 600.0), ("b", 300.0)]), Arc::new(Collections::default()))
            .unwrap();

        let window = tl.programme_window(&id, chrono::Duration::seconds(1200)).unwrap();
        assert!(window.len() >= 2);
        assert_eq!(window[0].item.title, "a");
        assert_eq!(window[0].start, start());
        assert_eq!(window[0].stop, start() + chrono::Duration::seconds(600));
        assert_eq!(window[1].item.title, "b");
        assert_eq!(window[1].start, window[0].stop);
    }

    #[test]
    fn shuffled_cycle_resumes_in_same_order_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path()).unwrap());
        let clock = Arc::new(ManualClock::new(start()));
        let id = ChannelId::from("c4");
        let mut sched = schedule(&[("a", 600.0), ("b", 600.0), ("c", 600.0), ("d", 600.0)]);
        sched.shuffle = true;

        let order_before: Vec<String>;
        {
            let tl = PlayoutTimeline::new(
                AnchorRepository::new(Arc::clone(&store)),
                Arc::clone(&store),
                clock.clone(),
                PlayoutConfig::default(),
            );
            tl.register(&channel("c4"), &sched, Arc::new(Collections::default())).unwrap();
            order_before = tl
                .programme_window(&id, chrono::Duration::seconds(2400))
                .unwrap()
                .iter()
                .map(|p| p.item.title.clone())
                .collect();
        }

        let tl = PlayoutTimeline::new(
            AnchorRepository::new(Arc::clone(&store)),
            store,
            clock,
            PlayoutConfig::default(),
        );
        tl.register(&channel("c4"), &sched, Arc::new(Collections::default())).unwrap();
        let order_after: Vec<String> = tl
            .programme_window(&id, chrono::Duration::seconds(2400))
            .unwrap()
            .iter()
            .map(|p| p.item.title.clone())
            .collect();
        assert_eq!(order_before, order_after);
    }
}

//! Time-slot scheduling strategy.

use chrono::{DateTime, NaiveTime, Timelike, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngExt, SeedableRng};
use tracing::warn;

use crate::models::{MediaItem, SlotFlexMode, SlotOrderMode, SlotPaddingMode, TimeSlot, TimeSlotSchedule};

use super::{weekday_bit, CollectionSource, NextItemPicker, Pick, PickerState};

/// Picks from the slot whose window contains the context time.
///
/// With no active slot the padding mode of the next upcoming slot decides
/// what fills the gap; `none` yields dead air.
pub struct TimeSlotPicker {
    schedule: TimeSlotSchedule,
}

impl TimeSlotPicker {
    #[must_use]
    pub fn new(schedule: TimeSlotSchedule) -> Self {
        Self { schedule }
    }

    /// The slot active at `time`, if any.
    fn active_slot(&self, time: DateTime<Utc>) -> Option<&TimeSlot> {
        let day_bit = weekday_bit(time);
        let now = time.time();
        self.schedule
            .slots
            .iter()
            .filter(|slot| slot.active_on(day_bit))
            .find(|slot| slot_contains(slot, now))
    }

    /// The next slot to start after `time`, today; wraps to the earliest slot.
    fn next_slot(&self, time: DateTime<Utc>) -> Option<&TimeSlot> {
        let day_bit = weekday_bit(time);
        let now = time.time();
        let todays: Vec<&TimeSlot> = self
            .schedule
            .slots
            .iter()
            .filter(|slot| slot.active_on(day_bit))
            .collect();
        todays
            .iter()
            .filter(|slot| slot.start_time > now)
            .min_by_key(|slot| slot.start_time)
            .or_else(|| todays.iter().min_by_key(|slot| slot.start_time))
            .copied()
    }

    fn pick_from_slot(
        &self,
        slot: &TimeSlot,
        collections: &dyn CollectionSource,
        state: &mut PickerState,
    ) -> Pick {
        pick_from_collection(&slot.collection, slot.order_mode, collections, state)
    }

    /// Apply the slot's flex mode to a pick made inside the slot window.
    fn apply_flex(
        &self,
        slot: &TimeSlot,
        context_time: DateTime<Utc>,
        pick: Pick,
        collections: &dyn CollectionSource,
        state: &mut PickerState,
    ) -> Pick {
        let mut item = match pick {
            Pick::Item(item) => item,
            Pick::DeadAir => return Pick::DeadAir,
        };
        let Some(remaining) = seconds_until_slot_end(slot, context_time.time()) else {
            return Pick::Item(item);
        };
        let duration = item.duration_secs.unwrap_or(0.0);
        if duration <= remaining {
            return Pick::Item(item);
        }

        match slot.flex_mode {
            // Overflow allowed; the following slots absorb the shift.
            SlotFlexMode::Extend => Pick::Item(item),
            // Cut at the boundary.
            SlotFlexMode::None => {
                item.duration_secs = Some(remaining);
                Pick::Item(item)
            }
            // Skip forward to something that fits. A multi-part group is
            // never abandoned mid-way; it overflows instead.
            SlotFlexMode::Compress => {
                if item.multi_part_group.is_some() {
                    warn!(
                        collection = %slot.collection,
                        "multi-part group exceeds slot, letting it overflow"
                    );
                    return Pick::Item(item);
                }
                let mut candidate = item;
                for _ in 0..collections.items(&slot.collection).len().max(1) {
                    let next =
                        pick_from_collection(&slot.collection, slot.order_mode, collections, state);
                    let Pick::Item(next_item) = next else { break };
                    if next_item.duration_secs.unwrap_or(0.0) <= remaining {
                        return Pick::Item(next_item);
                    }
                    candidate = next_item;
                }
                warn!(
                    collection = %slot.collection,
                    "no item fits the remaining slot time, cutting at boundary"
                );
                candidate.duration_secs = Some(remaining);
                Pick::Item(candidate)
            }
        }
    }
}

/// Seconds from `now` to the slot's end, honoring midnight wrap.
fn seconds_until_slot_end(slot: &TimeSlot, now: NaiveTime) -> Option<f64> {
    if !slot_contains(slot, now) {
        return None;
    }
    let start_secs = u64::from(slot.start_time.num_seconds_from_midnight());
    let end_secs = start_secs + u64::from(slot.duration_minutes) * 60;
    let now_secs = u64::from(now.num_seconds_from_midnight());
    let adjusted_now = if now_secs < start_secs && end_secs > 86_400 {
        now_secs + 86_400
    } else {
        now_secs
    };
    Some(end_secs.saturating_sub(adjusted_now) as f64)
}

fn slot_contains(slot: &TimeSlot, now: NaiveTime) -> bool {
    let start = slot.start_time;
    let start_secs = u64::from(start.num_seconds_from_midnight());
    let end_secs = start_secs + u64::from(slot.duration_minutes) * 60;
    let now_secs = u64::from(now.num_seconds_from_midnight());
    if end_secs <= 86_400 {
        now_secs >= start_secs && now_secs < end_secs
    } else {
        // Slot wraps past midnight.
        now_secs >= start_secs || now_secs < end_secs - 86_400
    }
}

/// Pick one item from a collection honoring the slot's sub-ordering.
///
/// `Ordered` and `Shuffle` walk a per-collection cursor so repeats only start
/// once the collection is exhausted; `Random` draws independently each call.
pub(crate) fn pick_from_collection(
    collection: &str,
    order_mode: SlotOrderMode,
    collections: &dyn CollectionSource,
    state: &mut PickerState,
) -> Pick {
    let items = collections.items(collection);
    if items.is_empty() {
        return Pick::DeadAir;
    }

    let picked: MediaItem = match order_mode {
        SlotOrderMode::Ordered => {
            let cursor = state.cursor.entry(collection.to_string()).or_insert(0);
            let item = items[*cursor % items.len()].clone();
            *cursor = (*cursor + 1) % items.len();
            item
        }
        SlotOrderMode::Shuffle => {
            // Reproducible permutation per pass through the collection.
            let cursor = *state.cursor.get(collection).unwrap_or(&0);
            let pass = cursor / items.len();
            let mut order: Vec<usize> = (0..items.len()).collect();
            let mut rng = StdRng::seed_from_u64(
                state.shuffle_seed ^ (pass as u64) ^ seed_for(collection),
            );
            order.shuffle(&mut rng);
            let item = items[order[cursor % items.len()]].clone();
            state.cursor.insert(collection.to_string(), cursor + 1);
            item
        }
        SlotOrderMode::Random => {
            let mut rng = StdRng::seed_from_u64(state.shuffle_seed ^ state.draw_counter);
            state.draw_counter += 1;
            items[rng.random_range(0..items.len())].clone()
        }
    };
    Pick::Item(picked)
}

fn seed_for(collection: &str) -> u64 {
    use std::hash::{DefaultHasher, Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    collection.hash(&mut hasher);
    hasher.finish()
}

impl NextItemPicker for TimeSlotPicker {
    fn pick_next(
        &self,
        collections: &dyn CollectionSource,
        state: &mut PickerState,
        context_time: DateTime<Utc>,
    ) -> Pick {
        if let Some(slot) = self.active_slot(context_time) {
            let pick = self.pick_from_slot(slot, collections, state);
            return self.apply_flex(slot, context_time, pick, collections, state);
        }

        // Gap: the upcoming slot's padding mode decides.
        let Some(next) = self.next_slot(context_time) else {
            return Pick::DeadAir;
        };
        match next.padding_mode {
            SlotPaddingMode::None => Pick::DeadAir,
            SlotPaddingMode::Filler => match &self.schedule.filler_preset {
                Some(preset) => {
                    pick_from_collection(preset, SlotOrderMode::Shuffle, collections, state)
                }
                None => {
                    warn!(slot_collection = %next.collection, "filler padding with no filler preset configured");
                    Pick::DeadAir
                }
            },
            // Loop replays the upcoming slot's content from the start.
            SlotPaddingMode::Loop => {
                state.cursor.insert(next.collection.clone(), 0);
                self.pick_from_slot(next, collections, state)
            }
            SlotPaddingMode::Next => self.pick_from_slot(next, collections, state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SlotFlexMode, DAY_ALL};
    use crate::schedule::test_support::media;
    use crate::schedule::Collections;
    use chrono::TimeZone;

    fn slot(start: (u32, u32), minutes: u32, collection: &str, padding: SlotPaddingMode) -> TimeSlot {
        TimeSlot {
            start_time: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
            duration_minutes: minutes,
            collection: collection.to_string(),
            order_mode: SlotOrderMode::Ordered,
            padding_mode: padding,
            flex_mode: SlotFlexMode::None,
            days_of_week_mask: DAY_ALL,
        }
    }

    fn collections() -> Collections {
        let mut c = Collections::default();
        c.collections.insert(
            "cartoons".into(),
            vec![media("ep1", 600.0), media("ep2", 600.0)],
        );
        c.collections.insert("news".into(), vec![media("bulletin", 300.0)]);
        c.collections.insert("bumpers".into(), vec![media("bumper", 30.0)]);
        c
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, h, m, 0).unwrap()
    }

    #[test]
    fn picks_from_active_slot() {
        let picker = TimeSlotPicker::new(TimeSlotSchedule {
            slots: vec![slot((8, 0), 120, "cartoons", SlotPaddingMode::None)],
            filler_preset: None,
        });
        let mut state = PickerState::default();

        match picker.pick_next(&collections(), &mut state, at(9, 0)) {
            Pick::Item(item) => assert_eq!(item.title, "ep1"),
            Pick::DeadAir => panic!("expected an item"),
        }
    }

    #[test]
    fn ordered_mode_walks_the_collection() {
        let picker = TimeSlotPicker::new(TimeSlotSchedule {
            slots: vec![slot((8, 0), 120, "cartoons", SlotPaddingMode::None)],
            filler_preset: None,
        });
        let mut state = PickerState::default();
        let c = collections();

        let titles: Vec<String> = (0..3)
            .map(|_| match picker.pick_next(&c, &mut state, at(9, 0)) {
                Pick::Item(item) => item.title,
                Pick::DeadAir => panic!("expected an item"),
            })
            .collect();
        assert_eq!(titles, vec!["ep1", "ep2", "ep1"]);
    }

    #[test]
    fn gap_with_padding_none_is_dead_air() {
        let picker = TimeSlotPicker::new(TimeSlotSchedule {
            slots: vec![
                slot((8, 0), 60, "cartoons", SlotPaddingMode::None),
                slot((12, 0), 60, "news", SlotPaddingMode::None),
            ],
            filler_preset: None,
        });
        let mut state = PickerState::default();
        assert_eq!(
            picker.pick_next(&collections(), &mut state, at(10, 0)),
            Pick::DeadAir
        );
    }

    #[test]
    fn gap_with_padding_filler_uses_preset() {
        let picker = TimeSlotPicker::new(TimeSlotSchedule {
            slots: vec![
                slot((8, 0), 60, "cartoons", SlotPaddingMode::None),
                slot((12, 0), 60, "news", SlotPaddingMode::Filler),
            ],
            filler_preset: Some("bumpers".into()),
        });
        let mut state = PickerState::default();
        match picker.pick_next(&collections(), &mut state, at(10, 0)) {
            Pick::Item(item) => assert_eq!(item.title, "bumper"),
            Pick::DeadAir => panic!("expected filler"),
        }
    }

    #[test]
    fn gap_with_padding_next_starts_next_slot_early() {
        let picker = TimeSlotPicker::new(TimeSlotSchedule {
            slots: vec![
                slot((8, 0), 60, "cartoons", SlotPaddingMode::None),
                slot((12, 0), 60, "news", SlotPaddingMode::Next),
            ],
            filler_preset: None,
        });
        let mut state = PickerState::default();
        match picker.pick_next(&collections(), &mut state, at(10, 0)) {
            Pick::Item(item) => assert_eq!(item.title, "bulletin"),
            Pick::DeadAir => panic!("expected the next slot's content"),
        }
    }

    #[test]
    fn empty_day_mask_never_produces_content() {
        let mut s = slot((8, 0), 60, "cartoons", SlotPaddingMode::Filler);
        s.days_of_week_mask = 0;
        let picker = TimeSlotPicker::new(TimeSlotSchedule {
            slots: vec![s],
            filler_preset: Some("bumpers".into()),
        });
        let mut state = PickerState::default();
        assert_eq!(
            picker.pick_next(&collections(), &mut state, at(9, 0)),
            Pick::DeadAir
        );
    }

    #[test]
    fn shuffle_is_reproducible_for_same_seed() {
        let schedule = TimeSlotSchedule {
            slots: vec![{
                let mut s = slot((0, 0), 1440, "cartoons", SlotPaddingMode::None);
                s.order_mode = SlotOrderMode::Shuffle;
                s
            }],
            filler_preset: None,
        };
        let picker = TimeSlotPicker::new(schedule);
        let c = collections();

        let run = |seed: u64| -> Vec<String> {
            let mut state = PickerState { shuffle_seed: seed, ..Default::default() };
            (0..4)
                .map(|_| match picker.pick_next(&c, &mut state, at(9, 0)) {
                    Pick::Item(item) => item.title,
                    Pick::DeadAir => panic!("expected an item"),
                })
                .collect()
        };
        assert_eq!(run(42), run(42));
    }

    #[test]
    fn flex_none_cuts_item_at_slot_boundary() {
        // 30 minutes left in the slot, items are 600s each: fits. Move the
        // context to 5 minutes before the end so a 600s item no longer fits.
        let picker = TimeSlotPicker::new(TimeSlotSchedule {
            slots: vec![slot((8, 0), 60, "cartoons", SlotPaddingMode::None)],
            filler_preset: None,
        });
        let mut state = PickerState::default();
        match picker.pick_next(&collections(), &mut state, at(8, 55)) {
            Pick::Item(item) => assert_eq!(item.duration_secs, Some(300.0)),
            Pick::DeadAir => panic!("expected an item"),
        }
    }

    #[test]
    fn flex_extend_lets_item_overflow() {
        let mut s = slot((8, 0), 60, "cartoons", SlotPaddingMode::None);
        s.flex_mode = SlotFlexMode::Extend;
        let picker = TimeSlotPicker::new(TimeSlotSchedule {
            slots: vec![s],
            filler_preset: None,
        });
        let mut state = PickerState::default();
        match picker.pick_next(&collections(), &mut state, at(8, 55)) {
            Pick::Item(item) => assert_eq!(item.duration_secs, Some(600.0)),
            Pick::DeadAir => panic!("expected an item"),
        }
    }

    #[test]
    fn flex_compress_skips_to_a_fitting_item() {
        let mut c = collections();
        c.collections.insert(
            "mixed".into(),
            vec![media("long", 600.0), media("short", 120.0)],
        );
        let mut s = slot((8, 0), 60, "mixed", SlotPaddingMode::None);
        s.flex_mode = SlotFlexMode::Compress;
        let picker = TimeSlotPicker::new(TimeSlotSchedule {
            slots: vec![s],
            filler_preset: None,
        });
        let mut state = PickerState::default();
        // 4 minutes remain: "long" does not fit, "short" does.
        match picker.pick_next(&c, &mut state, at(8, 56)) {
            Pick::Item(item) => assert_eq!(item.title, "short"),
            Pick::DeadAir => panic!("expected an item"),
        }
    }

    #[test]
    fn flex_compress_never_abandons_a_multi_part_group() {
        let mut c = Collections::default();
        let mut part = media("film-pt1", 600.0);
        part.multi_part_group = Some("film".into());
        c.collections.insert("films".into(), vec![part, media("short", 120.0)]);

        let mut s = slot((8, 0), 60, "films", SlotPaddingMode::None);
        s.flex_mode = SlotFlexMode::Compress;
        let picker = TimeSlotPicker::new(TimeSlotSchedule {
            slots: vec![s],
            filler_preset: None,
        });
        let mut state = PickerState::default();
        // The group item overflows rather than being skipped mid-way.
        match picker.pick_next(&c, &mut state, at(8, 56)) {
            Pick::Item(item) => {
                assert_eq!(item.title, "film-pt1");
                assert_eq!(item.duration_secs, Some(600.0));
            }
            Pick::DeadAir => panic!("expected an item"),
        }
    }

    #[test]
    fn slot_spanning_midnight_contains_late_and_early_times() {
        let s = slot((23, 0), 120, "cartoons", SlotPaddingMode::None);
        assert!(slot_contains(&s, NaiveTime::from_hms_opt(23, 30, 0).unwrap()));
        assert!(slot_contains(&s, NaiveTime::from_hms_opt(0, 30, 0).unwrap()));
        assert!(!slot_contains(&s, NaiveTime::from_hms_opt(2, 0, 0).unwrap()));
    }
}

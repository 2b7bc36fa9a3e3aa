//! Weighted balance scheduling strategy.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};

use crate::models::{BalanceConfig, ContentSource, SlotOrderMode};

use super::timeslot::pick_from_collection;
use super::{CollectionSource, NextItemPicker, Pick, PickerState};

/// Picks a source by weight, honoring per-source cooldowns and consecutive
/// caps, then an item from that source's collection.
pub struct BalancePicker {
    config: BalanceConfig,
}

impl BalancePicker {
    #[must_use]
    pub fn new(config: BalanceConfig) -> Self {
        Self { config }
    }

    /// Sources currently eligible under cooldown + max-consecutive.
    ///
    /// If nothing qualifies, constraints relax in order: max-consecutive
    /// first, then cooldown.
    fn eligible<'a>(
        &'a self,
        state: &PickerState,
        now: DateTime<Utc>,
    ) -> Vec<&'a ContentSource> {
        let cooldown_ok = |s: &ContentSource| {
            state.last_picked_at.get(&s.collection).is_none_or(|&last| {
                now.timestamp() - last >= i64::from(s.cooldown_minutes) * 60
            })
        };
        let consecutive_ok = |s: &ContentSource| {
            state.consecutive_count.get(&s.collection).copied().unwrap_or(0) < s.max_consecutive
        };

        let both: Vec<&ContentSource> = self
            .config
            .sources
            .iter()
            .filter(|s| cooldown_ok(s) && consecutive_ok(s))
            .collect();
        if !both.is_empty() {
            return both;
        }

        let cooldown_only: Vec<&ContentSource> =
            self.config.sources.iter().filter(|s| cooldown_ok(s)).collect();
        if !cooldown_only.is_empty() {
            return cooldown_only;
        }

        self.config.sources.iter().collect()
    }

    fn weighted_choice<'a>(
        sources: &[&'a ContentSource],
        state: &mut PickerState,
    ) -> Option<&'a ContentSource> {
        let total: f64 = sources.iter().map(|s| s.weight.max(0.0)).sum();
        if total <= 0.0 {
            return sources.first().copied();
        }
        let mut rng = StdRng::seed_from_u64(state.shuffle_seed ^ state.draw_counter);
        state.draw_counter += 1;
        let mut roll = rng.random_range(0.0..total);
        for source in sources {
            roll -= source.weight.max(0.0);
            if roll < 0.0 {
                return Some(source);
            }
        }
        sources.last().copied()
    }
}

impl NextItemPicker for BalancePicker {
    fn pick_next(
        &self,
        collections: &dyn CollectionSource,
        state: &mut PickerState,
        context_time: DateTime<Utc>,
    ) -> Pick {
        if self.config.sources.is_empty() {
            return Pick::DeadAir;
        }

        let eligible = self.eligible(state, context_time);
        let Some(source) = Self::weighted_choice(&eligible, state) else {
            return Pick::DeadAir;
        };

        let pick = pick_from_collection(
            &source.collection,
            SlotOrderMode::Shuffle,
            collections,
            state,
        );

        if matches!(pick, Pick::Item(_)) {
            state
                .last_picked_at
                .insert(source.collection.clone(), context_time.timestamp());
            let count = state.consecutive_count.entry(source.collection.clone()).or_insert(0);
            *count += 1;
            // Every other source's run is broken.
            let picked = source.collection.clone();
            for (collection, count) in state.consecutive_count.iter_mut() {
                if *collection != picked {
                    *count = 0;
                }
            }
        }
        pick
    }
}

//! Playout cycle construction.
//!
//! A cycle is the ordered, immutable list of [`PlayoutItem`]s a channel plays
//! through before wrapping. Shuffling is a reproducible permutation seeded per
//! cycle, so a restart rebuilds the identical order; multi-part episode groups
//! are permuted as single units and never split.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngExt, SeedableRng};

use crate::models::{FillerKind, MediaItem, PlayoutItem, ProgramSchedule};

/// Fallback duration for items whose length the library does not know.
const DEFAULT_ITEM_SECS: f64 = 1800.0;

/// Build a cycle from a schedule's ordered item list.
///
/// `random_start_point` is applied here and only here; a mid-cycle restart
/// resumes from the persisted anchor instead.
#[must_use]
pub fn build_cycle(
    schedule: &ProgramSchedule,
    cycle_start: DateTime<Utc>,
    seed: u64,
) -> (Vec<PlayoutItem>, usize) {
    let mut media: Vec<MediaItem> = schedule.items.iter().map(|s| s.media.clone()).collect();

    // Position overrides apply before any shuffle.
    let positions: Vec<Option<u32>> = schedule.items.iter().map(|s| s.position).collect();
    if positions.iter().any(Option::is_some) {
        let mut keyed: Vec<(u32, MediaItem)> = media
            .into_iter()
            .enumerate()
            .map(|(i, m)| (positions[i].unwrap_or(i as u32), m))
            .collect();
        keyed.sort_by_key(|(pos, _)| *pos);
        media = keyed.into_iter().map(|(_, m)| m).collect();
    }

    let units = group_units(media, schedule.keep_multi_part_episodes);

    let ordered_units = if schedule.shuffle {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut shuffled = units;
        shuffled.shuffle(&mut rng);
        shuffled
    } else {
        units
    };

    let flat: Vec<MediaItem> = ordered_units.into_iter().flatten().collect();
    let items = plan_items(flat, cycle_start);

    let start_index = if schedule.random_start_point && items.len() > 1 {
        // Derived from the same seed so a rebuilt cycle starts identically.
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1));
        rng.random_range(0..items.len())
    } else {
        0
    };

    (items, start_index)
}

/// Group consecutive items sharing a multi-part group id into single units.
fn group_units(media: Vec<MediaItem>, keep_groups: bool) -> Vec<Vec<MediaItem>> {
    if !keep_groups {
        return media.into_iter().map(|m| vec![m]).collect();
    }

    let mut units: Vec<Vec<MediaItem>> = Vec::new();
    for item in media {
        let same_group = units.last().is_some_and(|unit: &Vec<MediaItem>| {
            match (&unit.last().and_then(|m| m.multi_part_group.clone()), &item.multi_part_group) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        });
        if same_group {
            if let Some(unit) = units.last_mut() {
                unit.push(item);
                continue;
            }
        }
        units.push(vec![item]);
    }
    units
}

/// Turn a flat media list into timed playout items.
#[must_use]
pub fn plan_items(media: Vec<MediaItem>, cycle_start: DateTime<Utc>) -> Vec<PlayoutItem> {
    let mut at = cycle_start;
    media
        .into_iter()
        .map(|m| {
            let duration = m.duration_secs.unwrap_or(DEFAULT_ITEM_SECS);
            let finish = at + chrono::Duration::milliseconds((duration * 1000.0) as i64);
            let item = PlayoutItem {
                media_ref: m.media_ref,
                title: m.title,
                in_point: 0.0,
                out_point: duration,
                finish_time_expected: finish,
                filler_kind: FillerKind::None,
                description: m.description,
                episode: m.episode,
                multi_part_group: m.multi_part_group,
            };
            at = finish;
            item
        })
        .collect()
}

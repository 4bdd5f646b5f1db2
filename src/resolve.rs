use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::models::{
    AssetRow, ChannelRuntime, ResolvedEntry, ResolvedScheduleDay, SchedulableAsset, SchedulePlan,
    SyntheticPattern, VirtualRule,
};
use crate::plan_store;

/// Declared filler used wherever the lineup would otherwise be silent.
pub fn declared_filler() -> SchedulableAsset {
    SchedulableAsset::Synthetic {
        pattern: SyntheticPattern::ColorBars,
    }
}

/// Build the per-channel lineup for one broadcast day: tile the programming
/// day on the channel grid, layer active plans by priority, pick one
/// schedulable asset per slot, then coalesce runs of the same selection.
///
/// Deterministic for fixed inputs: random picks are seeded from
/// (channel id, date, slot index).
///
/// Returns a day with no entries when no plan is active on `date` — the
/// caller treats that as exhausted plan material, not as filler.
pub async fn build_resolved_day(
    pool: &SqlitePool,
    channel: &ChannelRuntime,
    date: NaiveDate,
) -> Result<ResolvedScheduleDay> {
    let (day_start_utc_ms, day_end_utc_ms) = channel
        .broadcast_day_window(date)
        .with_context(|| format!("no valid broadcast day window for {date}"))?;

    let plans = plan_store::active_plans_for(pool, &channel.id, channel.timezone, date).await?;

    if plans.is_empty() {
        debug!(channel = %channel.slug, %date, "no active plans for broadcast day");
        return Ok(ResolvedScheduleDay {
            channel_id: channel.id.clone(),
            date,
            day_start_utc_ms,
            day_end_utc_ms,
            entries: Vec::new(),
        });
    }

    let eligibility = load_referenced_assets(pool, &plans).await?;

    let grid_ms = channel.grid_minutes as i64 * 60_000;
    let slot_count = ((day_end_utc_ms - day_start_utc_ms) / grid_ms) as u32;
    let weekday = date.weekday();

    let mut selections: Vec<SchedulableAsset> = Vec::with_capacity(slot_count as usize);
    for slot_index in 0..slot_count {
        let minute_of_day = slot_index * channel.grid_minutes;

        let zone = plans
            .iter()
            .flat_map(|p| p.zones.iter())
            .find(|z| z.covers(minute_of_day, weekday));

        let selection = match zone {
            Some(zone) => {
                let picked = pick_from_zone(channel, date, slot_index, &zone.assets);
                if is_selectable(&picked, &eligibility) {
                    picked
                } else {
                    warn!(
                        channel = %channel.slug,
                        %date,
                        slot_index,
                        asset = %picked.identity(),
                        "selected asset is not eligible, substituting declared filler"
                    );
                    declared_filler()
                }
            }
            None => {
                // Coverage validation keeps plans whole, so this is either a
                // weekday none of the zones touch or DST surplus past 24:00
                debug!(channel = %channel.slug, %date, minute_of_day, "no zone covers slot, using declared filler");
                declared_filler()
            }
        };
        selections.push(selection);
    }

    // Coalesce consecutive slots referencing the same schedulable asset
    let mut entries: Vec<ResolvedEntry> = Vec::new();
    for (slot_index, selection) in selections.into_iter().enumerate() {
        let start_utc_ms = day_start_utc_ms + slot_index as i64 * grid_ms;
        let end_utc_ms = (start_utc_ms + grid_ms).min(day_end_utc_ms);
        match entries.last_mut() {
            Some(last) if last.asset.identity() == selection.identity() && last.end_utc_ms == start_utc_ms => {
                last.end_utc_ms = end_utc_ms;
            }
            _ => entries.push(ResolvedEntry {
                start_utc_ms,
                end_utc_ms,
                asset: selection,
            }),
        }
    }

    Ok(ResolvedScheduleDay {
        channel_id: channel.id.clone(),
        date,
        day_start_utc_ms,
        day_end_utc_ms,
        entries,
    })
}

/// One pick per slot. Single-asset zones are direct; larger sets use the
/// seeded PRNG so reruns of the same day resolve identically.
fn pick_from_zone(
    channel: &ChannelRuntime,
    date: NaiveDate,
    slot_index: u32,
    assets: &[SchedulableAsset],
) -> SchedulableAsset {
    match assets {
        [] => declared_filler(),
        [only] => only.clone(),
        many => {
            let mut rng = slot_rng(&channel.id, date, slot_index);
            many[rng.random_range(0..many.len())].clone()
        }
    }
}

pub fn slot_rng(channel_id: &str, date: NaiveDate, slot_index: u32) -> StdRng {
    let mut hasher = Sha256::new();
    hasher.update(channel_id.as_bytes());
    hasher.update(date.to_string().as_bytes());
    hasher.update(slot_index.to_le_bytes());
    let digest = hasher.finalize();
    let seed = u64::from_le_bytes(digest[..8].try_into().expect("digest is long enough"));
    StdRng::seed_from_u64(seed)
}

/// Fetch every physical asset referenced by the plans, keyed by name.
pub async fn load_referenced_assets(
    pool: &SqlitePool,
    plans: &[SchedulePlan],
) -> Result<HashMap<String, AssetRow>> {
    let mut map = HashMap::new();
    for plan in plans {
        for zone in &plan.zones {
            for asset in &zone.assets {
                for name in physical_names(asset) {
                    if !map.contains_key(&name) {
                        if let Some(row) = plan_store::get_asset_by_name(pool, &name).await? {
                            map.insert(name, row);
                        }
                    }
                }
            }
        }
    }
    Ok(map)
}

fn physical_names(asset: &SchedulableAsset) -> Vec<String> {
    match asset {
        SchedulableAsset::Asset { name } => vec![name.clone()],
        SchedulableAsset::Program { chain, .. } => chain.iter().flat_map(physical_names).collect(),
        SchedulableAsset::Virtual { rule, .. } => match rule {
            VirtualRule::ByDayOfWeek { candidates } | VirtualRule::Rotation { candidates } => candidates.clone(),
        },
        SchedulableAsset::Synthetic { .. } => Vec::new(),
    }
}

/// Whether a selection can air at all: direct references must be eligible,
/// composites need at least one playable element, synthetics always pass.
fn is_selectable(asset: &SchedulableAsset, eligibility: &HashMap<String, AssetRow>) -> bool {
    match asset {
        SchedulableAsset::Asset { name } => eligibility.get(name).map(AssetRow::eligible).unwrap_or(false),
        SchedulableAsset::Program { chain, .. } => chain.iter().any(|c| is_selectable(c, eligibility)),
        SchedulableAsset::Virtual { rule, .. } => match rule {
            VirtualRule::ByDayOfWeek { candidates } | VirtualRule::Rotation { candidates } => candidates
                .iter()
                .any(|name| eligibility.get(name).map(AssetRow::eligible).unwrap_or(false)),
        },
        SchedulableAsset::Synthetic { .. } => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_pool;
    use crate::models::{ALL_DAYS_MASK, Zone};
    use crate::plan_store::test_support::*;
    use chrono::NaiveTime;

    fn test_channel(id: &str) -> ChannelRuntime {
        ChannelRuntime {
            id: id.to_string(),
            slug: "one".into(),
            name: "One".into(),
            timezone: "UTC".parse().unwrap(),
            grid_minutes: 30,
            day_start: NaiveTime::parse_from_str("06:00", "%H:%M").unwrap(),
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn seed_assets(pool: &SqlitePool, names: &[&str]) {
        for name in names {
            plan_store::upsert_asset(pool, &asset_config(name, "30m")).await.unwrap();
        }
    }

    #[tokio::test]
    async fn empty_plan_set_yields_empty_day() {
        let (pool, _dir) = test_pool().await;
        let channel_id = plan_store::upsert_channel(&pool, &channel_config("one")).await.unwrap();
        let channel = test_channel(&channel_id);

        let day = build_resolved_day(&pool, &channel, date(2026, 8, 3)).await.unwrap();
        assert!(day.entries.is_empty());
        assert_eq!(day.day_end_utc_ms - day.day_start_utc_ms, 24 * 3600 * 1000);
    }

    #[tokio::test]
    async fn full_day_single_asset_coalesces_to_one_entry() {
        let (pool, _dir) = test_pool().await;
        let channel_id = plan_store::upsert_channel(&pool, &channel_config("one")).await.unwrap();
        seed_assets(&pool, &["movie"]).await;
        let plan = full_day_plan(&channel_id, "base", 0, vec![SchedulableAsset::Asset { name: "movie".into() }]);
        plan_store::upsert_plan(&pool, &plan, 30).await.unwrap();

        let channel = test_channel(&channel_id);
        let day = build_resolved_day(&pool, &channel, date(2026, 8, 3)).await.unwrap();

        assert_eq!(day.entries.len(), 1);
        assert_eq!(day.entries[0].start_utc_ms, day.day_start_utc_ms);
        assert_eq!(day.entries[0].end_utc_ms, day.day_end_utc_ms);
    }

    #[tokio::test]
    async fn higher_priority_plan_wins_the_slot() {
        let (pool, _dir) = test_pool().await;
        let channel_id = plan_store::upsert_channel(&pool, &channel_config("one")).await.unwrap();
        seed_assets(&pool, &["base-show", "special"]).await;

        let base = full_day_plan(&channel_id, "base", 0, vec![SchedulableAsset::Asset { name: "base-show".into() }]);
        plan_store::upsert_plan(&pool, &base, 30).await.unwrap();

        // Special plan overrides mornings only; rest of its day is filler
        let mut special = full_day_plan(&channel_id, "special", 10, vec![filler()]);
        special.zones = vec![
            zone(
                "morning",
                0,
                180,
                vec![SchedulableAsset::Asset { name: "special".into() }],
            ),
            zone("rest", 180, 1440, vec![SchedulableAsset::Asset { name: "base-show".into() }]),
        ];
        plan_store::upsert_plan(&pool, &special, 30).await.unwrap();

        let channel = test_channel(&channel_id);
        let day = build_resolved_day(&pool, &channel, date(2026, 8, 3)).await.unwrap();

        assert_eq!(day.entries.len(), 2);
        assert_eq!(day.entries[0].asset.identity(), "asset:special");
        assert_eq!(day.entries[0].end_utc_ms - day.entries[0].start_utc_ms, 3 * 3600 * 1000);
        assert_eq!(day.entries[1].asset.identity(), "asset:base-show");
    }

    #[tokio::test]
    async fn random_zone_selection_is_deterministic() {
        let (pool, _dir) = test_pool().await;
        let channel_id = plan_store::upsert_channel(&pool, &channel_config("one")).await.unwrap();
        seed_assets(&pool, &["a", "b", "c"]).await;
        let assets = vec![
            SchedulableAsset::Asset { name: "a".into() },
            SchedulableAsset::Asset { name: "b".into() },
            SchedulableAsset::Asset { name: "c".into() },
        ];
        let plan = full_day_plan(&channel_id, "mix", 0, assets);
        plan_store::upsert_plan(&pool, &plan, 30).await.unwrap();

        let channel = test_channel(&channel_id);
        let first = build_resolved_day(&pool, &channel, date(2026, 8, 3)).await.unwrap();
        let second = build_resolved_day(&pool, &channel, date(2026, 8, 3)).await.unwrap();

        let ids = |day: &ResolvedScheduleDay| {
            day.entries
                .iter()
                .map(|e| (e.start_utc_ms, e.asset.identity()))
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&first), ids(&second));
    }

    #[tokio::test]
    async fn ineligible_selection_is_replaced_with_filler() {
        let (pool, _dir) = test_pool().await;
        let channel_id = plan_store::upsert_channel(&pool, &channel_config("one")).await.unwrap();
        seed_assets(&pool, &["movie"]).await;
        plan_store::set_asset_state(&pool, "movie", "enriching", true).await.unwrap();

        let plan = full_day_plan(&channel_id, "base", 0, vec![SchedulableAsset::Asset { name: "movie".into() }]);
        plan_store::upsert_plan(&pool, &plan, 30).await.unwrap();

        let channel = test_channel(&channel_id);
        let day = build_resolved_day(&pool, &channel, date(2026, 8, 3)).await.unwrap();

        assert_eq!(day.entries.len(), 1);
        assert!(matches!(day.entries[0].asset, SchedulableAsset::Synthetic { .. }));
    }

    #[tokio::test]
    async fn uncovered_weekday_is_filled_not_skipped() {
        let (pool, _dir) = test_pool().await;
        let channel_id = plan_store::upsert_channel(&pool, &channel_config("one")).await.unwrap();
        seed_assets(&pool, &["weekend-movie"]).await;

        // Zones only cover Saturday; the plan itself is active every day
        let mut plan = full_day_plan(&channel_id, "weekend", 0, vec![filler()]);
        plan.zones = vec![Zone {
            id: String::new(),
            name: "sat".into(),
            from_minute: 0,
            to_minute: 1440,
            day_mask: crate::models::weekday_bit(chrono::Weekday::Sat),
            assets: vec![SchedulableAsset::Asset {
                name: "weekend-movie".into(),
            }],
        }];
        plan_store::upsert_plan(&pool, &plan, 30).await.unwrap();

        let channel = test_channel(&channel_id);
        // Monday: plan active but no covering zone — declared filler
        let monday = build_resolved_day(&pool, &channel, date(2026, 8, 3)).await.unwrap();
        assert_eq!(monday.entries.len(), 1);
        assert!(matches!(monday.entries[0].asset, SchedulableAsset::Synthetic { .. }));

        let saturday = build_resolved_day(&pool, &channel, date(2026, 8, 8)).await.unwrap();
        assert_eq!(saturday.entries[0].asset.identity(), "asset:weekend-movie");
    }

    #[test]
    fn slot_rng_differs_across_slots_and_channels() {
        let d = date(2026, 8, 3);
        let a: u64 = slot_rng("ch-a", d, 0).random();
        let b: u64 = slot_rng("ch-a", d, 1).random();
        let c: u64 = slot_rng("ch-b", d, 0).random();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn all_days_mask_is_seven_bits() {
        assert_eq!(ALL_DAYS_MASK.count_ones(), 7);
    }
}

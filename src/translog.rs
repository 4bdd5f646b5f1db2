use anyhow::Result;
use chrono::Datelike;
use rand::Rng;
use sqlx::SqlitePool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{
    AssetRef, ChannelRuntime, PlayMode, ResolvedScheduleDay, SchedulableAsset, SyntheticPattern,
    TransmissionLogEntry, VirtualRule,
};
use crate::plan_store;
use crate::resolve;

/// Expand a resolved schedule day into the physical-asset transmission log.
///
/// `carry_in_end_utc_ms` is the end of the previous day's final entry when it
/// runs past this day's start; coverage begins there so the carried block
/// stays a single record on the previous day's log.
///
/// Entries tile their source intervals exactly. The one sanctioned departure
/// from the grid is the final block of the day: when its material runs past
/// the broadcast-day boundary it is emitted as a single entry spanning the
/// boundary, never split.
pub async fn build_transmission_log(
    pool: &SqlitePool,
    channel: &ChannelRuntime,
    day: &ResolvedScheduleDay,
    carry_in_end_utc_ms: Option<i64>,
) -> Result<Vec<TransmissionLogEntry>> {
    let grid_ms = channel.grid_minutes as i64 * 60_000;
    let coverage_start = carry_in_end_utc_ms
        .filter(|c| *c > day.day_start_utc_ms)
        .unwrap_or(day.day_start_utc_ms);

    let mut log: Vec<TransmissionLogEntry> = Vec::new();

    for (index, resolved) in day.entries.iter().enumerate() {
        if resolved.end_utc_ms <= coverage_start {
            continue;
        }
        let start = resolved.start_utc_ms.max(coverage_start);
        let end = resolved.end_utc_ms;
        let is_final_block = index == day.entries.len() - 1;

        match &resolved.asset {
            SchedulableAsset::Asset { name } => {
                let (asset_ref, duration_ms) = resolve_library_asset(pool, name).await?;
                match asset_ref {
                    Some(asset) => {
                        // A final block whose material outlasts the day keeps
                        // its natural end and crosses the boundary whole.
                        let entry_end = if is_final_block && start + duration_ms > end {
                            start + duration_ms
                        } else {
                            end
                        };
                        log.push(entry(channel, day, start, entry_end, asset));
                    }
                    None => {
                        warn!(channel = %channel.slug, asset = %name, "asset missing or ineligible at expansion, using filler");
                        log.push(entry(channel, day, start, end, filler_ref()));
                    }
                }
            }
            SchedulableAsset::Synthetic { pattern } => {
                log.push(entry(channel, day, start, end, AssetRef::Synthetic { pattern: *pattern }));
            }
            SchedulableAsset::Program { name, play_mode, chain } => {
                expand_program(pool, channel, day, &mut log, name, *play_mode, chain, start, end, grid_ms).await?;
            }
            SchedulableAsset::Virtual { name, rule } => {
                let asset = resolve_virtual(pool, channel, day, name, rule).await?;
                log.push(entry(channel, day, start, end, asset));
            }
        }
    }

    Ok(log)
}

fn entry(
    channel: &ChannelRuntime,
    day: &ResolvedScheduleDay,
    start_utc_ms: i64,
    end_utc_ms: i64,
    asset: AssetRef,
) -> TransmissionLogEntry {
    TransmissionLogEntry {
        id: Uuid::new_v4().to_string(),
        channel_id: channel.id.clone(),
        start_utc_ms,
        end_utc_ms,
        asset,
        resolved_day: day.date,
    }
}

fn filler_ref() -> AssetRef {
    AssetRef::Synthetic {
        pattern: SyntheticPattern::ColorBars,
    }
}

/// Look up a library asset, returning its ref and duration only when
/// eligible.
async fn resolve_library_asset(pool: &SqlitePool, name: &str) -> Result<(Option<AssetRef>, i64)> {
    match plan_store::get_asset_by_name(pool, name).await? {
        Some(row) if row.eligible() => {
            let duration = row.duration_ms;
            Ok((
                Some(AssetRef::Library {
                    asset_id: row.id,
                    name: row.name,
                    uri: row.uri,
                }),
                duration,
            ))
        }
        _ => Ok((None, 0)),
    }
}

/// Expand a program's chain across [start, end). Each element occupies its
/// duration rounded up to the grid; the final element is truncated at the
/// interval end so the block hands off on time.
#[allow(clippy::too_many_arguments)]
async fn expand_program(
    pool: &SqlitePool,
    channel: &ChannelRuntime,
    day: &ResolvedScheduleDay,
    log: &mut Vec<TransmissionLogEntry>,
    name: &str,
    play_mode: PlayMode,
    chain: &[SchedulableAsset],
    start: i64,
    end: i64,
    grid_ms: i64,
) -> Result<()> {
    let cursor_key = format!("program:{}:{name}", channel.id);
    let mut cursor = plan_store::cursor_position(pool, &cursor_key).await?;
    let start_slot = ((start - day.day_start_utc_ms) / grid_ms).max(0) as u32;
    let mut rng = resolve::slot_rng(&channel.id, day.date, start_slot);

    let mut at = start;
    let mut consecutive_skips = 0usize;
    while at < end {
        let pick_index = match play_mode {
            PlayMode::Sequential => {
                let i = cursor;
                cursor += 1;
                (i.rem_euclid(chain.len() as i64)) as usize
            }
            PlayMode::Random => rng.random_range(0..chain.len()),
            // Manual holds the operator-set cursor without advancing
            PlayMode::Manual => (cursor.rem_euclid(chain.len() as i64)) as usize,
        };

        let element = &chain[pick_index];
        let (asset, duration_ms) = match element {
            SchedulableAsset::Asset { name } => resolve_library_asset(pool, name).await?,
            SchedulableAsset::Synthetic { pattern } => (Some(AssetRef::Synthetic { pattern: *pattern }), grid_ms),
            // Chains hold direct or synthetic references only (validated at
            // the plan write path); anything else degrades to filler
            other => {
                warn!(program = %name, element = %other.identity(), "unsupported chain element, using filler");
                (Some(filler_ref()), grid_ms)
            }
        };

        match asset {
            Some(asset) => {
                consecutive_skips = 0;
                let slot_len = round_up_to_grid(duration_ms.max(1), grid_ms);
                let element_end = (at + slot_len).min(end);
                log.push(entry(channel, day, at, element_end, asset));
                at = element_end;
            }
            None => {
                debug!(program = %name, element = pick_index, "chain element ineligible, skipping");
                consecutive_skips += 1;
                // A full fruitless cycle means nothing in the chain can air
                if consecutive_skips >= chain.len() {
                    warn!(program = %name, "no playable chain element, filling block with declared filler");
                    log.push(entry(channel, day, at, end, filler_ref()));
                    at = end;
                }
            }
        }
    }

    if play_mode == PlayMode::Sequential {
        plan_store::set_cursor_position(pool, &cursor_key, cursor).await?;
    }
    Ok(())
}

/// Resolve a virtual asset for this day, falling back across candidates
/// until an eligible one is found.
async fn resolve_virtual(
    pool: &SqlitePool,
    channel: &ChannelRuntime,
    day: &ResolvedScheduleDay,
    name: &str,
    rule: &VirtualRule,
) -> Result<AssetRef> {
    let (candidates, start_index, advance_cursor) = match rule {
        VirtualRule::ByDayOfWeek { candidates } => {
            let idx = day.date.weekday().num_days_from_monday() as usize % candidates.len();
            (candidates, idx, None)
        }
        VirtualRule::Rotation { candidates } => {
            let cursor_key = format!("virtual:{}:{name}", channel.id);
            let cursor = plan_store::cursor_position(pool, &cursor_key).await?;
            let idx = (cursor.rem_euclid(candidates.len() as i64)) as usize;
            (candidates, idx, Some((cursor_key, cursor + 1)))
        }
    };

    for offset in 0..candidates.len() {
        let candidate = &candidates[(start_index + offset) % candidates.len()];
        let (asset, _) = resolve_library_asset(pool, candidate).await?;
        if let Some(asset) = asset {
            if let Some((key, next)) = advance_cursor {
                plan_store::set_cursor_position(pool, &key, next).await?;
            }
            if offset > 0 {
                debug!(virtual_asset = %name, skipped = offset, "rotated past ineligible candidates");
            }
            return Ok(asset);
        }
    }

    warn!(virtual_asset = %name, "no eligible candidate, using declared filler");
    Ok(filler_ref())
}

fn round_up_to_grid(ms: i64, grid_ms: i64) -> i64 {
    let d = ms / grid_ms;
    let r = ms % grid_ms;
    let div_ceil = if (r > 0 && grid_ms > 0) || (r < 0 && grid_ms < 0) {
        d + 1
    } else {
        d
    };
    div_ceil * grid_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_pool;
    use crate::plan_store::test_support::*;
    use chrono::{NaiveDate, NaiveTime};

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

    async fn setup(pool: &SqlitePool, plan_assets: Vec<SchedulableAsset>) -> (ChannelRuntime, ResolvedScheduleDay) {
        let channel_id = plan_store::upsert_channel(pool, &channel_config("one")).await.unwrap();
        let plan = full_day_plan(&channel_id, "base", 0, plan_assets);
        plan_store::upsert_plan(pool, &plan, 30).await.unwrap();
        let channel = test_channel(&channel_id);
        let day = resolve::build_resolved_day(pool, &channel, date(2026, 8, 3)).await.unwrap();
        (channel, day)
    }

    fn assert_contiguous(log: &[TransmissionLogEntry]) {
        for pair in log.windows(2) {
            assert_eq!(pair[0].end_utc_ms, pair[1].start_utc_ms, "transmission log has a seam");
        }
    }

    #[tokio::test]
    async fn direct_asset_spans_its_whole_block() {
        let (pool, _dir) = test_pool().await;
        plan_store::upsert_asset(&pool, &asset_config("movie", "24h")).await.unwrap();
        let (channel, day) = setup(&pool, vec![SchedulableAsset::Asset { name: "movie".into() }]).await;

        let log = build_transmission_log(&pool, &channel, &day, None).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].start_utc_ms, day.day_start_utc_ms);
        assert_eq!(log[0].end_utc_ms, day.day_end_utc_ms);
        assert_eq!(log[0].resolved_day, day.date);
    }

    #[tokio::test]
    async fn sequential_program_advances_cursor_across_builds() {
        let (pool, _dir) = test_pool().await;
        for name in ["ep1", "ep2", "ep3"] {
            plan_store::upsert_asset(&pool, &asset_config(name, "30m")).await.unwrap();
        }
        let program = sequential_program("cartoons", &["ep1", "ep2", "ep3"]);
        let (channel, day) = setup(&pool, vec![program]).await;

        let log = build_transmission_log(&pool, &channel, &day, None).await.unwrap();
        assert_contiguous(&log);
        // 48 half-hour slots, each episode 30m: ep1 ep2 ep3 ep1 ...
        assert_eq!(log.len(), 48);
        assert!(log[0].asset.uri().contains("ep1"));
        assert!(log[1].asset.uri().contains("ep2"));
        assert!(log[2].asset.uri().contains("ep3"));
        assert!(log[3].asset.uri().contains("ep1"));

        // Cursor persisted: the next day picks up where this one stopped
        let next_day = resolve::build_resolved_day(&pool, &channel, date(2026, 8, 4)).await.unwrap();
        let next_log = build_transmission_log(&pool, &channel, &next_day, None).await.unwrap();
        // 48 airings consumed, 48 % 3 == 0, so the rotation restarts at ep1
        assert!(next_log[0].asset.uri().contains("ep1"));
    }

    #[tokio::test]
    async fn program_elements_round_up_to_the_grid() {
        let (pool, _dir) = test_pool().await;
        plan_store::upsert_asset(&pool, &asset_config("short", "22m")).await.unwrap();
        let program = sequential_program("shorts", &["short"]);
        let (channel, day) = setup(&pool, vec![program]).await;

        let log = build_transmission_log(&pool, &channel, &day, None).await.unwrap();
        assert_contiguous(&log);
        for e in &log {
            assert_eq!((e.start_utc_ms - day.day_start_utc_ms) % (30 * 60_000), 0);
        }
    }

    #[tokio::test]
    async fn final_block_crosses_the_boundary_as_one_entry() {
        let (pool, _dir) = test_pool().await;
        plan_store::upsert_asset(&pool, &asset_config("filler-show", "30m")).await.unwrap();
        plan_store::upsert_asset(&pool, &asset_config("late-movie", "2h")).await.unwrap();

        let channel_id = plan_store::upsert_channel(&pool, &channel_config("one")).await.unwrap();
        let mut plan = full_day_plan(&channel_id, "base", 0, vec![filler()]);
        plan.zones = vec![
            zone("most", 0, 1380, vec![SchedulableAsset::Asset { name: "filler-show".into() }]),
            // Last hour of the day: a 2-hour movie that must cross 06:00 whole
            zone("late", 1380, 1440, vec![SchedulableAsset::Asset { name: "late-movie".into() }]),
        ];
        plan_store::upsert_plan(&pool, &plan, 30).await.unwrap();

        let channel = test_channel(&channel_id);
        let day = resolve::build_resolved_day(&pool, &channel, date(2026, 8, 3)).await.unwrap();
        let log = build_transmission_log(&pool, &channel, &day, None).await.unwrap();

        let last = log.last().unwrap();
        assert!(last.asset.uri().contains("late-movie"));
        // Starts 1 hour before the boundary, ends 1 hour after it
        assert_eq!(last.start_utc_ms, day.day_end_utc_ms - 3600 * 1000);
        assert_eq!(last.end_utc_ms, day.day_end_utc_ms + 3600 * 1000);
        assert_contiguous(&log);
    }

    #[tokio::test]
    async fn carry_in_shifts_the_next_days_start() {
        let (pool, _dir) = test_pool().await;
        plan_store::upsert_asset(&pool, &asset_config("movie", "24h")).await.unwrap();
        let (channel, day) = setup(&pool, vec![SchedulableAsset::Asset { name: "movie".into() }]).await;

        let carry_end = day.day_start_utc_ms + 3600 * 1000;
        let log = build_transmission_log(&pool, &channel, &day, Some(carry_end)).await.unwrap();
        assert_eq!(log[0].start_utc_ms, carry_end);
    }

    #[tokio::test]
    async fn rotation_virtual_advances_per_airing() {
        let (pool, _dir) = test_pool().await;
        for name in ["m1", "m2"] {
            plan_store::upsert_asset(&pool, &asset_config(name, "2h")).await.unwrap();
        }
        let virtual_asset = SchedulableAsset::Virtual {
            name: "movie-slot".into(),
            rule: VirtualRule::Rotation {
                candidates: vec!["m1".into(), "m2".into()],
            },
        };
        let (channel, day) = setup(&pool, vec![virtual_asset]).await;

        let log1 = build_transmission_log(&pool, &channel, &day, None).await.unwrap();
        assert!(log1[0].asset.uri().contains("m1"));

        let day2 = resolve::build_resolved_day(&pool, &channel, date(2026, 8, 4)).await.unwrap();
        let log2 = build_transmission_log(&pool, &channel, &day2, None).await.unwrap();
        assert!(log2[0].asset.uri().contains("m2"));
    }

    #[tokio::test]
    async fn ineligible_chain_elements_are_skipped() {
        let (pool, _dir) = test_pool().await;
        for name in ["good", "bad"] {
            plan_store::upsert_asset(&pool, &asset_config(name, "30m")).await.unwrap();
        }
        plan_store::set_asset_state(&pool, "bad", "ready", false).await.unwrap();

        let program = sequential_program("mixed", &["bad", "good"]);
        let (channel, day) = setup(&pool, vec![program]).await;

        let log = build_transmission_log(&pool, &channel, &day, None).await.unwrap();
        assert_contiguous(&log);
        assert!(log.iter().all(|e| e.asset.uri().contains("good")));
    }
}

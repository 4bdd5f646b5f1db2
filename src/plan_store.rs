use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate, TimeZone};
use chrono_tz::Tz;
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::config::Config;
use crate::error::PlanValidationError;
use crate::models::{AssetRow, SchedulableAsset, SchedulePlan, SchedulePlanRow, Zone, ZoneRow};

const MINUTES_PER_DAY: u32 = 24 * 60;

// ── Validation ─────────────────────────────────────────────────────────

/// Validate a plan against the write-path invariants: name shape, date
/// monotonicity, cron syntax, zone alignment, zone overlap per weekday, and
/// full-day coverage for every weekday the plan's zones touch.
pub fn validate_plan(plan: &SchedulePlan, grid_minutes: u32) -> Result<(), PlanValidationError> {
    let name = plan.name.trim();
    if name.is_empty() {
        return Err(PlanValidationError::new("empty_name", "plan name must not be blank"));
    }

    if let (Some(start), Some(end)) = (plan.start_date, plan.end_date)
        && start > end
    {
        return Err(PlanValidationError::new(
            "date_range",
            format!("start_date {start} is after end_date {end}"),
        ));
    }

    if let Some(ref expr) = plan.day_filter {
        parse_day_filter(expr).map_err(|e| PlanValidationError::new("cron_syntax", e))?;
    }

    if plan.zones.is_empty() {
        return Err(PlanValidationError::new("no_zones", "plan must declare at least one zone"));
    }

    for zone in &plan.zones {
        if zone.from_minute >= zone.to_minute || zone.to_minute > MINUTES_PER_DAY {
            return Err(PlanValidationError::new(
                "zone_window",
                format!(
                    "zone '{}': window [{}, {}) is not a valid range within the day",
                    zone.name, zone.from_minute, zone.to_minute
                ),
            )
            .with_ids(vec![zone.id.clone()])
            .with_interval(zone.from_minute, zone.to_minute));
        }
        if zone.from_minute % grid_minutes != 0 || zone.to_minute % grid_minutes != 0 {
            return Err(PlanValidationError::new(
                "zone_grid",
                format!(
                    "zone '{}': window [{}, {}) is not aligned to the {}-minute grid",
                    zone.name, zone.from_minute, zone.to_minute, grid_minutes
                ),
            )
            .with_ids(vec![zone.id.clone()])
            .with_interval(zone.from_minute, zone.to_minute));
        }
        if zone.day_mask == 0 {
            return Err(PlanValidationError::new(
                "zone_days",
                format!("zone '{}': day mask is empty", zone.name),
            )
            .with_ids(vec![zone.id.clone()]));
        }
        if zone.assets.is_empty() {
            return Err(PlanValidationError::new(
                "zone_assets",
                format!("zone '{}': asset set is empty", zone.name),
            )
            .with_ids(vec![zone.id.clone()]));
        }
    }

    // Per-weekday overlap and coverage
    for day_bit in 0..7u8 {
        let mask = 1 << day_bit;
        let mut active: Vec<&Zone> = plan.zones.iter().filter(|z| z.day_mask & mask != 0).collect();
        if active.is_empty() {
            continue;
        }
        active.sort_by_key(|z| z.from_minute);

        let mut covered_to = 0u32;
        for zone in &active {
            if zone.from_minute < covered_to {
                let other = active
                    .iter()
                    .find(|z| z.id != zone.id && z.to_minute > zone.from_minute && z.from_minute < zone.to_minute)
                    .map(|z| z.id.clone());
                return Err(PlanValidationError::new(
                    "zone_overlap",
                    format!(
                        "zone '{}' overlaps another zone active on the same weekday",
                        zone.name
                    ),
                )
                .with_ids([Some(zone.id.clone()), other].into_iter().flatten().collect())
                .with_interval(zone.from_minute, covered_to.min(zone.to_minute)));
            }
            if zone.from_minute > covered_to {
                return Err(PlanValidationError::new(
                    "incomplete_coverage",
                    format!(
                        "zones leave [{covered_to}, {}) uncovered on weekday {day_bit}",
                        zone.from_minute
                    ),
                )
                .with_interval(covered_to, zone.from_minute));
            }
            covered_to = zone.to_minute;
        }
        if covered_to < MINUTES_PER_DAY {
            return Err(PlanValidationError::new(
                "incomplete_coverage",
                format!("zones leave [{covered_to}, {MINUTES_PER_DAY}) uncovered on weekday {day_bit}"),
            )
            .with_interval(covered_to, MINUTES_PER_DAY));
        }
    }

    Ok(())
}

/// Parse a 5-field cron day filter. Only the date and day-of-week fields are
/// honored; minute and hour fields are ignored by design.
pub fn parse_day_filter(expr: &str) -> Result<cron::Schedule, String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(format!(
            "invalid cron expression '{expr}': expected 5 fields (min hour dom mon dow)"
        ));
    }
    // The cron crate expects 7-field (sec min hour dom mon dow year)
    // expressions. Pin the time fields to midnight so only the date fields
    // decide which days match.
    let wrapped = format!("0 0 0 {} {} {} *", fields[2], fields[3], fields[4]);
    cron::Schedule::from_str(&wrapped).map_err(|e| format!("invalid cron expression '{expr}': {e}"))
}

/// Whether the filter matches `date` in the channel's timezone.
pub fn day_filter_matches(schedule: &cron::Schedule, tz: Tz, date: NaiveDate) -> bool {
    let Some(day_start) = tz
        .from_local_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight exists"))
        .earliest()
    else {
        return false;
    };
    let probe = day_start - chrono::Duration::seconds(1);
    match schedule.after(&probe).next() {
        Some(next) => next.with_timezone(&tz).date_naive() == date,
        None => false,
    }
}

// ── Channels ───────────────────────────────────────────────────────────

pub async fn upsert_channel(pool: &SqlitePool, channel: &crate::config::ChannelConfig) -> Result<String> {
    let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM channels WHERE slug = ?")
        .bind(&channel.slug)
        .fetch_optional(pool)
        .await
        .context("checking for existing channel")?;

    let id = if let Some((existing_id,)) = existing {
        sqlx::query(
            "UPDATE channels SET name = ?, timezone = ?, grid_minutes = ?, programming_day_start = ?,
             port = ?, enabled = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
             WHERE id = ?",
        )
        .bind(&channel.name)
        .bind(&channel.timezone)
        .bind(channel.grid_minutes.map(|g| g as i64))
        .bind(&channel.programming_day_start)
        .bind(channel.port as i64)
        .bind(channel.enabled)
        .bind(&existing_id)
        .execute(pool)
        .await
        .context("updating channel")?;

        debug!(slug = %channel.slug, id = %existing_id, "updated channel");
        existing_id
    } else {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO channels (id, slug, name, timezone, grid_minutes, programming_day_start, port, enabled)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&channel.slug)
        .bind(&channel.name)
        .bind(&channel.timezone)
        .bind(channel.grid_minutes.map(|g| g as i64))
        .bind(&channel.programming_day_start)
        .bind(channel.port as i64)
        .bind(channel.enabled)
        .execute(pool)
        .await
        .context("inserting channel")?;

        debug!(slug = %channel.slug, id = %id, "created channel");
        id
    };

    Ok(id)
}

pub async fn channel_id_by_slug(pool: &SqlitePool, slug: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT id FROM channels WHERE slug = ?")
        .bind(slug)
        .fetch_optional(pool)
        .await
        .context("querying channel by slug")?;
    Ok(row.map(|(id,)| id))
}

// ── Assets (content-store surface) ─────────────────────────────────────

pub async fn upsert_asset(pool: &SqlitePool, asset: &crate::config::AssetConfig) -> Result<String> {
    let duration_ms = crate::config::duration_ms(&asset.duration)
        .map_err(|e| anyhow::anyhow!("asset '{}': {e}", asset.name))?;

    let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM assets WHERE name = ?")
        .bind(&asset.name)
        .fetch_optional(pool)
        .await
        .context("checking for existing asset")?;

    let id = if let Some((existing_id,)) = existing {
        sqlx::query(
            "UPDATE assets SET uri = ?, duration_ms = ?, state = ?, approved_for_broadcast = ?,
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
             WHERE id = ?",
        )
        .bind(&asset.uri)
        .bind(duration_ms)
        .bind(&asset.state)
        .bind(asset.approved_for_broadcast)
        .bind(&existing_id)
        .execute(pool)
        .await
        .context("updating asset")?;
        existing_id
    } else {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO assets (id, name, uri, duration_ms, state, approved_for_broadcast)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&asset.name)
        .bind(&asset.uri)
        .bind(duration_ms)
        .bind(&asset.state)
        .bind(asset.approved_for_broadcast)
        .execute(pool)
        .await
        .context("inserting asset")?;
        id
    };

    Ok(id)
}

pub async fn get_asset_by_name(pool: &SqlitePool, name: &str) -> Result<Option<AssetRow>> {
    let asset = sqlx::query_as::<_, AssetRow>(
        "SELECT id, name, uri, duration_ms, state, approved_for_broadcast FROM assets WHERE name = ?",
    )
    .bind(name)
    .fetch_optional(pool)
    .await
    .context("querying asset by name")?;
    Ok(asset)
}

pub async fn get_asset_by_id(pool: &SqlitePool, id: &str) -> Result<Option<AssetRow>> {
    let asset = sqlx::query_as::<_, AssetRow>(
        "SELECT id, name, uri, duration_ms, state, approved_for_broadcast FROM assets WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("querying asset by id")?;
    Ok(asset)
}

/// Operator/enrichment write path used by tests and the CLI: downgrade or
/// restore an asset's lifecycle state.
pub async fn set_asset_state(
    pool: &SqlitePool,
    name: &str,
    state: &str,
    approved_for_broadcast: bool,
) -> Result<()> {
    sqlx::query(
        "UPDATE assets SET state = ?, approved_for_broadcast = ?,
         updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') WHERE name = ?",
    )
    .bind(state)
    .bind(approved_for_broadcast)
    .bind(name)
    .execute(pool)
    .await
    .context("updating asset state")?;
    Ok(())
}

// ── Plans ──────────────────────────────────────────────────────────────

fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Insert or update a plan (keyed by channel + case-insensitive name),
/// replacing its zones. Validates first; the write is rejected whole on any
/// violation.
pub async fn upsert_plan(pool: &SqlitePool, plan: &SchedulePlan, grid_minutes: u32) -> Result<String> {
    validate_plan(plan, grid_minutes).map_err(anyhow::Error::from)?;

    let key = name_key(&plan.name);
    let existing: Option<(String,)> =
        sqlx::query_as("SELECT id FROM schedule_plans WHERE channel_id = ? AND name_key = ?")
            .bind(&plan.channel_id)
            .bind(&key)
            .fetch_optional(pool)
            .await
            .context("checking for existing plan")?;

    let id = if let Some((existing_id,)) = existing {
        sqlx::query(
            "UPDATE schedule_plans SET name = ?, day_filter = ?, start_date = ?, end_date = ?,
             priority = ?, active = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
             WHERE id = ?",
        )
        .bind(plan.name.trim())
        .bind(&plan.day_filter)
        .bind(plan.start_date.map(|d| d.to_string()))
        .bind(plan.end_date.map(|d| d.to_string()))
        .bind(plan.priority as i64)
        .bind(plan.active)
        .bind(&existing_id)
        .execute(pool)
        .await
        .context("updating plan")?;

        debug!(plan = %plan.name, id = %existing_id, "updated plan");
        existing_id
    } else {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO schedule_plans (id, channel_id, name, name_key, day_filter, start_date, end_date, priority, active)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&plan.channel_id)
        .bind(plan.name.trim())
        .bind(&key)
        .bind(&plan.day_filter)
        .bind(plan.start_date.map(|d| d.to_string()))
        .bind(plan.end_date.map(|d| d.to_string()))
        .bind(plan.priority as i64)
        .bind(plan.active)
        .execute(pool)
        .await
        .context("inserting plan")?;

        debug!(plan = %plan.name, id = %id, "created plan");
        id
    };

    // Replace zones
    sqlx::query("DELETE FROM zones WHERE plan_id = ?")
        .bind(&id)
        .execute(pool)
        .await
        .context("clearing plan zones")?;

    for (position, zone) in plan.zones.iter().enumerate() {
        let zone_id = if zone.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            zone.id.clone()
        };
        let assets_json = serde_json::to_string(&zone.assets).context("serializing zone assets")?;
        sqlx::query(
            "INSERT INTO zones (id, plan_id, name, from_minute, to_minute, day_mask, position, assets)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&zone_id)
        .bind(&id)
        .bind(&zone.name)
        .bind(zone.from_minute as i64)
        .bind(zone.to_minute as i64)
        .bind(zone.day_mask as i64)
        .bind(position as i64)
        .bind(&assets_json)
        .execute(pool)
        .await
        .context("inserting zone")?;
    }

    Ok(id)
}

pub async fn delete_plan(pool: &SqlitePool, plan_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM schedule_plans WHERE id = ?")
        .bind(plan_id)
        .execute(pool)
        .await
        .context("deleting plan")?;
    Ok(result.rows_affected() > 0)
}

async fn load_zones(pool: &SqlitePool, plan_id: &str) -> Result<Vec<Zone>> {
    let rows = sqlx::query_as::<_, ZoneRow>(
        "SELECT id, plan_id, name, from_minute, to_minute, day_mask, position, assets
         FROM zones WHERE plan_id = ? ORDER BY position ASC",
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await
    .context("querying zones")?;

    rows.into_iter()
        .map(|row| {
            let assets: Vec<SchedulableAsset> =
                serde_json::from_str(&row.assets).context("parsing zone assets")?;
            Ok(Zone {
                id: row.id,
                name: row.name,
                from_minute: row.from_minute as u32,
                to_minute: row.to_minute as u32,
                day_mask: row.day_mask as u8,
                assets,
            })
        })
        .collect()
}

fn plan_from_row(row: SchedulePlanRow, zones: Vec<Zone>) -> SchedulePlan {
    SchedulePlan {
        id: row.id,
        channel_id: row.channel_id,
        name: row.name,
        day_filter: row.day_filter,
        start_date: row.start_date.and_then(|d| d.parse().ok()),
        end_date: row.end_date.and_then(|d| d.parse().ok()),
        priority: row.priority.max(0) as u32,
        active: row.active,
        zones,
    }
}

pub async fn get_plan(pool: &SqlitePool, plan_id: &str) -> Result<Option<SchedulePlan>> {
    let row = sqlx::query_as::<_, SchedulePlanRow>(
        "SELECT id, channel_id, name, day_filter, start_date, end_date, priority, active
         FROM schedule_plans WHERE id = ?",
    )
    .bind(plan_id)
    .fetch_optional(pool)
    .await
    .context("querying plan")?;

    match row {
        Some(row) => {
            let zones = load_zones(pool, &row.id).await?;
            Ok(Some(plan_from_row(row, zones)))
        }
        None => Ok(None),
    }
}

pub async fn list_plans(pool: &SqlitePool, channel_id: &str) -> Result<Vec<SchedulePlan>> {
    let rows = sqlx::query_as::<_, SchedulePlanRow>(
        "SELECT id, channel_id, name, day_filter, start_date, end_date, priority, active
         FROM schedule_plans WHERE channel_id = ? ORDER BY priority DESC, name ASC",
    )
    .bind(channel_id)
    .fetch_all(pool)
    .await
    .context("listing plans")?;

    let mut plans = Vec::with_capacity(rows.len());
    for row in rows {
        let zones = load_zones(pool, &row.id).await?;
        plans.push(plan_from_row(row, zones));
    }
    Ok(plans)
}

/// Plans active on `date`: active flag set, date within [start, end], and
/// the cron day filter (if any) matching. Ordered by descending priority,
/// then (name, id) for a stable layering order.
pub async fn active_plans_for(
    pool: &SqlitePool,
    channel_id: &str,
    tz: Tz,
    date: NaiveDate,
) -> Result<Vec<SchedulePlan>> {
    let mut plans = list_plans(pool, channel_id).await?;
    plans.retain(|plan| {
        if !plan.active {
            return false;
        }
        if let Some(start) = plan.start_date
            && date < start
        {
            return false;
        }
        if let Some(end) = plan.end_date
            && date > end
        {
            return false;
        }
        match plan.day_filter.as_deref() {
            Some(expr) => match parse_day_filter(expr) {
                Ok(schedule) => day_filter_matches(&schedule, tz, date),
                // Rejected at write time; treat as non-matching if it slips through
                Err(_) => false,
            },
            None => true,
        }
    });
    plans.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.id.cmp(&b.id))
    });
    Ok(plans)
}

/// The schedulable assets offered at a given minute of the programming day,
/// in plan-layering order.
pub async fn assets_for(
    pool: &SqlitePool,
    channel_id: &str,
    tz: Tz,
    date: NaiveDate,
    minute_of_day: u32,
) -> Result<Vec<SchedulableAsset>> {
    let plans = active_plans_for(pool, channel_id, tz, date).await?;
    let weekday = date.weekday();
    for plan in &plans {
        for zone in &plan.zones {
            if zone.covers(minute_of_day, weekday) {
                return Ok(zone.assets.clone());
            }
        }
    }
    Ok(Vec::new())
}

// ── Rotation cursors ───────────────────────────────────────────────────

pub async fn cursor_position(pool: &SqlitePool, cursor_key: &str) -> Result<i64> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT position FROM rotation_cursors WHERE cursor_key = ?")
        .bind(cursor_key)
        .fetch_optional(pool)
        .await
        .context("reading rotation cursor")?;
    Ok(row.map(|(p,)| p).unwrap_or(0))
}

pub async fn set_cursor_position(pool: &SqlitePool, cursor_key: &str, position: i64) -> Result<()> {
    sqlx::query(
        "INSERT INTO rotation_cursors (cursor_key, position) VALUES (?, ?)
         ON CONFLICT(cursor_key) DO UPDATE SET position = excluded.position",
    )
    .bind(cursor_key)
    .bind(position)
    .execute(pool)
    .await
    .context("writing rotation cursor")?;
    Ok(())
}

// ── Config sync ────────────────────────────────────────────────────────

/// Sync channels, assets, and plans from config to DB.
/// Entities no longer present in config are deleted (cascading to zones).
pub async fn sync_config_to_db(pool: &SqlitePool, config: &Config) -> Result<()> {
    // Channels
    let mut config_channel_ids = HashMap::new();
    for channel in &config.channel {
        let id = upsert_channel(pool, channel).await?;
        config_channel_ids.insert(channel.slug.clone(), id);
    }

    let db_channels: Vec<(String, String)> = sqlx::query_as("SELECT id, slug FROM channels")
        .fetch_all(pool)
        .await
        .context("listing channels for cleanup")?;
    for (id, slug) in &db_channels {
        if !config_channel_ids.values().any(|v| v == id) {
            sqlx::query("DELETE FROM channels WHERE id = ?")
                .bind(id)
                .execute(pool)
                .await
                .context("deleting orphaned channel")?;
            debug!(slug = %slug, "deleted orphaned channel");
        }
    }

    // Assets
    let mut config_asset_names = HashSet::new();
    for asset in &config.asset {
        config_asset_names.insert(asset.name.clone());
        upsert_asset(pool, asset).await?;
    }
    let db_assets: Vec<(String, String)> = sqlx::query_as("SELECT id, name FROM assets")
        .fetch_all(pool)
        .await
        .context("listing assets for cleanup")?;
    for (id, name) in &db_assets {
        if !config_asset_names.contains(name) {
            sqlx::query("DELETE FROM assets WHERE id = ?")
                .bind(id)
                .execute(pool)
                .await
                .context("deleting orphaned asset")?;
            debug!(name = %name, "deleted orphaned asset");
        }
    }

    // Plans
    let mut config_plan_keys = HashSet::new();
    for plan_config in &config.plan {
        let channel_id = config_channel_ids
            .get(&plan_config.channel)
            .ok_or_else(|| anyhow::anyhow!("plan '{}': unknown channel '{}'", plan_config.name, plan_config.channel))?;
        let plan = plan_config
            .to_domain(channel_id)
            .map_err(|e| anyhow::anyhow!("plan '{}': {e}", plan_config.name))?;
        config_plan_keys.insert((channel_id.clone(), name_key(&plan.name)));
        upsert_plan(pool, &plan, config.scheduling.grid_minutes).await?;
    }
    let db_plans: Vec<(String, String, String)> =
        sqlx::query_as("SELECT id, channel_id, name_key FROM schedule_plans")
            .fetch_all(pool)
            .await
            .context("listing plans for cleanup")?;
    for (id, channel_id, key) in &db_plans {
        if !config_plan_keys.contains(&(channel_id.clone(), key.clone())) {
            sqlx::query("DELETE FROM schedule_plans WHERE id = ?")
                .bind(id)
                .execute(pool)
                .await
                .context("deleting orphaned plan")?;
            debug!(plan = %key, "deleted orphaned plan");
        }
    }

    Ok(())
}

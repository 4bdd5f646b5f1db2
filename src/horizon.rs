use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::MasterClock;
use crate::models::{
    AssetRef, ChannelRuntime, ResolvedScheduleDay, SyntheticPattern, TransmissionLogEntry,
};
use crate::plan_store;
use crate::resolve;
use crate::translog;
use crate::window::{ExecutionEntry, ExecutionWindowStore};

/// The only sanctioned extension trigger. Consumer demand never extends the
/// window.
pub const REASON_CLOCK_PROGRESSION: &str = "clock_progression";

/// How many recent attempts a health report carries.
const ATTEMPT_HISTORY: usize = 8;

/// Ceiling on days walked in a single extension pass.
const MAX_DAYS_PER_PASS: u32 = 8;

#[derive(Debug, Clone)]
pub struct ExtensionAttempt {
    pub at_utc_ms: i64,
    pub success: bool,
    pub reason_code: &'static str,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HorizonHealthReport {
    pub channel_id: String,
    pub at_utc_ms: i64,
    pub exec_depth_ms: i64,
    pub execution_compliant: bool,
    pub extension_attempt_count: u64,
    pub extension_success_count: u64,
    pub recent_attempts: Vec<ExtensionAttempt>,
}

#[derive(Debug, Clone)]
pub struct HorizonSettings {
    pub min_execution_horizon_ms: i64,
    pub proactive_extend_threshold_ms: i64,
    pub epg_horizon_days: u32,
}

/// Rolling-window controller for one channel: keeps committed execution
/// entries at least `min_execution_horizon_ms` deep, extends proactively on
/// clock progression, and re-verifies asset eligibility as the window moves.
pub struct HorizonManager {
    channel: ChannelRuntime,
    pool: SqlitePool,
    window: Arc<ExecutionWindowStore>,
    clock: MasterClock,
    settings: HorizonSettings,
    resolved_days: BTreeMap<NaiveDate, ResolvedScheduleDay>,
    day_logs: BTreeMap<NaiveDate, Vec<TransmissionLogEntry>>,
    attempts: VecDeque<ExtensionAttempt>,
    attempt_count: u64,
    success_count: u64,
}

impl HorizonManager {
    pub fn new(
        channel: ChannelRuntime,
        pool: SqlitePool,
        window: Arc<ExecutionWindowStore>,
        clock: MasterClock,
        settings: HorizonSettings,
    ) -> Self {
        Self {
            channel,
            pool,
            window,
            clock,
            settings,
            resolved_days: BTreeMap::new(),
            day_logs: BTreeMap::new(),
            attempts: VecDeque::new(),
            attempt_count: 0,
            success_count: 0,
        }
    }

    /// The heartbeat. Runs on every tick, block completion, or prime
    /// completion; measures depth, extends when the threshold is crossed,
    /// and reports health. Never blocks on the engine and never panics the
    /// loop — failures become failed attempts and are retried next tick.
    pub async fn evaluate_once(&mut self) -> HorizonHealthReport {
        let now = self.clock.now_utc_ms();

        if let Err(e) = self.maintain_epg_horizon(now).await {
            warn!(channel = %self.channel.slug, error = %e, "EPG horizon maintenance failed");
        }

        let mut depth = self.depth_ms(now);
        let should_extend =
            depth < self.settings.min_execution_horizon_ms && depth <= self.settings.proactive_extend_threshold_ms;

        if should_extend {
            if let Err(e) = self.verify_committed_eligibility(now).await {
                warn!(channel = %self.channel.slug, error = %e, "eligibility re-verification failed");
            }
            self.extend_execution(now).await;
            depth = self.depth_ms(now);
        }

        self.evict_stale_days(now);

        let report = HorizonHealthReport {
            channel_id: self.channel.id.clone(),
            at_utc_ms: now,
            exec_depth_ms: depth,
            execution_compliant: depth >= self.settings.min_execution_horizon_ms,
            extension_attempt_count: self.attempt_count,
            extension_success_count: self.success_count,
            recent_attempts: self.attempts.iter().cloned().collect(),
        };
        if !report.execution_compliant {
            debug!(
                channel = %self.channel.slug,
                depth_ms = depth,
                min_ms = self.settings.min_execution_horizon_ms,
                "execution horizon below minimum"
            );
        }
        report
    }

    fn depth_ms(&self, now: i64) -> i64 {
        self.window
            .tail_end_utc_ms(&self.channel.id)
            .map(|tail| (tail - now).max(0))
            .unwrap_or(0)
    }

    /// Extend until the minimum depth is restored or plan material runs out.
    /// Each day-sized addition is one `ExtensionAttempt`.
    async fn extend_execution(&mut self, now: i64) {
        let mut days_walked = 0u32;
        while self.depth_ms(now) < self.settings.min_execution_horizon_ms && days_walked < MAX_DAYS_PER_PASS {
            days_walked += 1;
            match self.extend_step(now).await {
                Ok(added) if added > 0 => {
                    self.record_attempt(now, true, None);
                }
                Ok(_) => {
                    // No material on this date: walk forward handled inside
                    // extend_step; reaching here means the plan is exhausted
                    self.record_attempt(now, false, Some("plan_exhausted".to_string()));
                    warn!(
                        channel = %self.channel.slug,
                        fault = "planning",
                        "horizon_extension_failure: no further plan material"
                    );
                    return;
                }
                Err(e) => {
                    self.record_attempt(now, false, Some(e.to_string()));
                    error!(
                        channel = %self.channel.slug,
                        fault = "runtime",
                        error = %e,
                        "horizon_extension_failure"
                    );
                    return;
                }
            }
        }
    }

    /// One extension iteration: find the date at the window tail, slice the
    /// transmission log past the tail, admit the slice. Returns how many
    /// entries were committed.
    async fn extend_step(&mut self, now: i64) -> Result<usize> {
        let tail = self.window.tail_end_utc_ms(&self.channel.id);
        let from = tail.unwrap_or(now);

        let mut date = self
            .channel
            .broadcast_date_of(from)
            .ok_or_else(|| anyhow::anyhow!("no broadcast date for {from}"))?;

        // Walk forward past empty days up to the pass ceiling
        for _ in 0..MAX_DAYS_PER_PASS {
            let log = self.day_log(date).await?;
            let slice: Vec<TransmissionLogEntry> = match tail {
                Some(tail_ms) => log.iter().filter(|e| e.start_utc_ms >= tail_ms).cloned().collect(),
                // Cold prime: the first entry may already cover `now`; it is
                // admitted whole so join-in-progress keeps its real start
                None => log.iter().filter(|e| e.end_utc_ms > now).cloned().collect(),
            };

            if slice.is_empty() {
                let day_had_material = !log.is_empty();
                let next = date.succ_opt().ok_or_else(|| anyhow::anyhow!("calendar overflow"))?;
                if day_had_material {
                    date = next;
                    continue;
                }
                // An empty resolved day means no active plan: exhausted
                return Ok(0);
            }

            let entries = self.admit_slice(&slice).await?;
            let committed = self
                .window
                .add_entries(&self.channel.id, entries)
                .map_err(anyhow::Error::from)?;
            for entry in &committed {
                self.window.lock(&self.channel.id, &entry.id).map_err(anyhow::Error::from)?;
            }
            info!(
                channel = %self.channel.slug,
                %date,
                added = committed.len(),
                tail_utc_ms = self.window.tail_end_utc_ms(&self.channel.id),
                "execution window extended"
            );
            return Ok(committed.len());
        }

        Ok(0)
    }

    /// Convert a transmission-log slice into execution entries, re-checking
    /// eligibility at admission. Ineligible material is replaced with
    /// declared filler, loudly.
    async fn admit_slice(&self, slice: &[TransmissionLogEntry]) -> Result<Vec<ExecutionEntry>> {
        let mut entries = Vec::with_capacity(slice.len());
        for log_entry in slice {
            let mut entry = ExecutionEntry::from_transmission(log_entry);
            if let AssetRef::Library { asset_id, name, .. } = &entry.asset {
                let eligible = match plan_store::get_asset_by_id(&self.pool, asset_id).await? {
                    Some(row) => {
                        if let Some(reason) = row.ineligibility_reason() {
                            warn!(
                                asset_id = %asset_id,
                                channel_id = %self.channel.id,
                                reason = %reason,
                                "asset_ineligible: replacing with declared filler at admission"
                            );
                            false
                        } else {
                            true
                        }
                    }
                    None => {
                        warn!(
                            asset_id = %asset_id,
                            channel_id = %self.channel.id,
                            reason = "missing",
                            asset = %name,
                            "asset_ineligible: replacing with declared filler at admission"
                        );
                        false
                    }
                };
                if !eligible {
                    entry.asset = AssetRef::Synthetic {
                        pattern: SyntheticPattern::ColorBars,
                    };
                }
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Re-verify every committed entry still ahead of the clock. Entries
    /// whose asset lost eligibility since admission are substituted with
    /// declared filler in place, keeping interval and derivation.
    async fn verify_committed_eligibility(&self, now: i64) -> Result<()> {
        for entry in self.window.entries_from(&self.channel.id, now) {
            let AssetRef::Library { asset_id, .. } = &entry.asset else {
                continue;
            };
            let reason = match plan_store::get_asset_by_id(&self.pool, asset_id).await? {
                Some(row) => row.ineligibility_reason(),
                None => Some("missing".to_string()),
            };
            if let Some(reason) = reason {
                warn!(
                    asset_id = %asset_id,
                    channel_id = %self.channel.id,
                    reason = %reason,
                    entry = %entry.id,
                    "asset_ineligible: substituting declared filler in committed window"
                );
                let mut replacement = ExecutionEntry::from_transmission(&TransmissionLogEntry {
                    id: entry.transmission_log_ref.clone().unwrap_or_default(),
                    channel_id: entry.channel_id.clone(),
                    start_utc_ms: entry.start_utc_ms,
                    end_utc_ms: entry.end_utc_ms,
                    asset: AssetRef::Synthetic {
                        pattern: SyntheticPattern::ColorBars,
                    },
                    resolved_day: self.channel.broadcast_date_of(entry.start_utc_ms).unwrap_or_default(),
                });
                replacement.operator_override = entry.operator_override.clone();
                if entry.transmission_log_ref.is_none() {
                    replacement.transmission_log_ref = None;
                }
                let replaced = self
                    .window
                    .substitute_entry(&self.channel.id, &entry.id, replacement)
                    .map_err(anyhow::Error::from)?;
                self.window
                    .lock(&self.channel.id, &replaced.id)
                    .map_err(anyhow::Error::from)?;
            }
        }
        Ok(())
    }

    /// Keep resolved days cached out to the EPG horizon (guide-facing, days
    /// coarse). Extension reuses the same cache for its fine slicing.
    async fn maintain_epg_horizon(&mut self, now: i64) -> Result<()> {
        let Some(today) = self.channel.broadcast_date_of(now) else {
            return Ok(());
        };
        let mut date = today;
        for _ in 0..=self.settings.epg_horizon_days {
            if !self.resolved_days.contains_key(&date) {
                let day = resolve::build_resolved_day(&self.pool, &self.channel, date).await?;
                self.resolved_days.insert(date, day);
            }
            date = date.succ_opt().ok_or_else(|| anyhow::anyhow!("calendar overflow"))?;
        }
        Ok(())
    }

    /// Cached transmission log for a date, built with carry-in from the
    /// previous day's log so boundary-crossing blocks stay single entries.
    async fn day_log(&mut self, date: NaiveDate) -> Result<Vec<TransmissionLogEntry>> {
        if let Some(log) = self.day_logs.get(&date) {
            return Ok(log.clone());
        }
        if !self.resolved_days.contains_key(&date) {
            let day = resolve::build_resolved_day(&self.pool, &self.channel, date).await?;
            self.resolved_days.insert(date, day);
        }
        let day = self.resolved_days.get(&date).expect("inserted above").clone();

        let carry_in = date
            .pred_opt()
            .and_then(|prev| self.day_logs.get(&prev))
            .and_then(|prev_log| prev_log.last())
            .map(|last| last.end_utc_ms)
            .filter(|end| *end > day.day_start_utc_ms);

        let log = translog::build_transmission_log(&self.pool, &self.channel, &day, carry_in).await?;
        self.day_logs.insert(date, log.clone());
        Ok(log)
    }

    fn evict_stale_days(&mut self, now: i64) {
        let Some(today) = self.channel.broadcast_date_of(now) else {
            return;
        };
        let Some(cutoff) = today.pred_opt() else { return };
        self.resolved_days.retain(|d, _| *d >= cutoff);
        self.day_logs.retain(|d, _| *d >= cutoff);
    }

    fn record_attempt(&mut self, now: i64, success: bool, error_code: Option<String>) {
        self.attempt_count += 1;
        if success {
            self.success_count += 1;
        }
        self.attempts.push_back(ExtensionAttempt {
            at_utc_ms: now,
            success,
            reason_code: REASON_CLOCK_PROGRESSION,
            error_code,
        });
        while self.attempts.len() > ATTEMPT_HISTORY {
            self.attempts.pop_front();
        }
    }
}

/// Per-channel horizon ticker (>= 4 Hz). Publishes each health report for
/// the status surface; failures never kill the loop.
pub async fn horizon_loop(
    mut manager: HorizonManager,
    tick_ms: u64,
    health: tokio::sync::watch::Sender<Option<HorizonHealthReport>>,
    cancel: CancellationToken,
) {
    info!(channel = %manager.channel.slug, tick_ms, "horizon manager started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(channel = %manager.channel.slug, "horizon manager shutting down");
                return;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(tick_ms)) => {}
        }
        let report = manager.evaluate_once().await;
        let _ = health.send(Some(report));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_pool;
    use crate::models::SchedulableAsset;
    use crate::plan_store::test_support::*;
    use chrono::NaiveTime;

    const HOUR: i64 = 3600 * 1000;

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

    fn settings(min_ms: i64, threshold_ms: i64) -> HorizonSettings {
        HorizonSettings {
            min_execution_horizon_ms: min_ms,
            proactive_extend_threshold_ms: threshold_ms,
            epg_horizon_days: 2,
        }
    }

    /// Monday 2026-08-03 06:00:00 UTC.
    fn day_start_ms() -> i64 {
        crate::models::local_anchor_utc_ms(
            "UTC".parse().unwrap(),
            chrono::NaiveDate::from_ymd_opt(2026, 8, 3).unwrap(),
            NaiveTime::parse_from_str("06:00", "%H:%M").unwrap(),
        )
        .unwrap()
    }

    async fn seeded_manager(
        pool: &SqlitePool,
        clock: &MasterClock,
        min_ms: i64,
        threshold_ms: i64,
        episodes: &[&str],
    ) -> (HorizonManager, Arc<ExecutionWindowStore>, ChannelRuntime) {
        let channel_id = plan_store::upsert_channel(pool, &channel_config("one")).await.unwrap();
        for name in episodes {
            plan_store::upsert_asset(pool, &asset_config(name, "30m")).await.unwrap();
        }
        let program = sequential_program("rotation", episodes);
        let plan = full_day_plan(&channel_id, "base", 0, vec![program]);
        plan_store::upsert_plan(pool, &plan, 30).await.unwrap();

        let channel = test_channel(&channel_id);
        let window = Arc::new(ExecutionWindowStore::new());
        let manager = HorizonManager::new(
            channel.clone(),
            pool.clone(),
            window.clone(),
            clock.clone(),
            settings(min_ms, threshold_ms),
        );
        (manager, window, channel)
    }

    #[tokio::test]
    async fn cold_prime_fills_to_the_minimum() {
        let (pool, _dir) = test_pool().await;
        let clock = MasterClock::fixed(day_start_ms() + HOUR);
        let (mut manager, window, channel) =
            seeded_manager(&pool, &clock, 3 * HOUR, 3 * HOUR, &["e1", "e2", "e3"]).await;

        let report = manager.evaluate_once().await;
        assert!(report.execution_compliant);
        assert!(report.exec_depth_ms >= 3 * HOUR);
        assert_eq!(report.extension_success_count, 1);
        assert_eq!(report.recent_attempts[0].reason_code, "clock_progression");

        // Every instant of the minimum horizon is covered by exactly one entry
        let now = clock.now_utc_ms();
        for offset in (0..3 * HOUR).step_by(60_000) {
            let t = now + offset;
            let covering = window
                .all_entries(&channel.id)
                .iter()
                .filter(|e| e.covers(t))
                .count();
            assert_eq!(covering, 1, "instant {t} not singly covered");
        }

        // Adjacent entries are seamless and locked on commit
        let entries = window.all_entries(&channel.id);
        for pair in entries.windows(2) {
            assert_eq!(pair[0].end_utc_ms, pair[1].start_utc_ms);
        }
        assert!(entries.iter().all(|e| e.is_locked()));
    }

    #[tokio::test]
    async fn no_extension_when_depth_meets_the_minimum() {
        let (pool, _dir) = test_pool().await;
        let clock = MasterClock::fixed(day_start_ms());
        let (mut manager, window, channel) = seeded_manager(&pool, &clock, 3 * HOUR, 3 * HOUR, &["e1"]).await;

        // Prime, then tick again without clock movement: no second attempt
        let first = manager.evaluate_once().await;
        let attempts_after_prime = first.extension_attempt_count;
        let tail = window.tail_end_utc_ms(&channel.id);

        let second = manager.evaluate_once().await;
        assert_eq!(second.extension_attempt_count, attempts_after_prime);
        assert_eq!(window.tail_end_utc_ms(&channel.id), tail);
    }

    #[tokio::test]
    async fn extension_fires_at_min_minus_one_ms_but_not_at_min() {
        let (pool, _dir) = test_pool().await;
        let min = 3 * HOUR;
        let clock = MasterClock::fixed(day_start_ms());
        // threshold == min so the boundary probe is exact
        let (mut manager, window, channel) = seeded_manager(&pool, &clock, min, min, &["e1"]).await;

        manager.evaluate_once().await;
        let tail = window.tail_end_utc_ms(&channel.id).unwrap();

        // Exactly at min: no extension
        clock.advance_ms(tail - clock.now_utc_ms() - min);
        let report = manager.evaluate_once().await;
        assert_eq!(report.exec_depth_ms, min);
        assert_eq!(window.tail_end_utc_ms(&channel.id).unwrap(), tail);

        // One ms under min: extension fires
        clock.advance_ms(1);
        let report = manager.evaluate_once().await;
        assert!(report.exec_depth_ms >= min);
        assert!(window.tail_end_utc_ms(&channel.id).unwrap() > tail);
    }

    #[tokio::test]
    async fn clock_progression_triggers_exactly_one_attempt() {
        // min 3h, threshold 30m, initial depth 3h; advancing 2h31m leaves
        // 29m of depth, under the threshold: exactly one successful attempt
        let (pool, _dir) = test_pool().await;
        let clock = MasterClock::fixed(day_start_ms());
        let (mut manager, window, channel) =
            seeded_manager(&pool, &clock, 3 * HOUR, 30 * 60_000, &["e1", "e2"]).await;

        // Prime to exactly 3h by committing directly
        let log_slice: Vec<ExecutionEntry> = {
            let day = resolve::build_resolved_day(&pool, &channel, chrono::NaiveDate::from_ymd_opt(2026, 8, 3).unwrap())
                .await
                .unwrap();
            let log = translog::build_transmission_log(&pool, &channel, &day, None).await.unwrap();
            log.iter()
                .filter(|e| e.end_utc_ms <= day_start_ms() + 3 * HOUR)
                .map(ExecutionEntry::from_transmission)
                .collect()
        };
        window.add_entries(&channel.id, log_slice).unwrap();
        assert_eq!(window.tail_end_utc_ms(&channel.id).unwrap(), day_start_ms() + 3 * HOUR);

        // Above the threshold: tick does nothing
        clock.advance_ms(2 * HOUR);
        let report = manager.evaluate_once().await;
        assert_eq!(report.extension_attempt_count, 0);

        // Cross the threshold
        clock.advance_ms(31 * 60_000);
        let report = manager.evaluate_once().await;
        assert_eq!(report.extension_attempt_count, 1);
        assert_eq!(report.extension_success_count, 1);
        let attempt = report.recent_attempts.last().unwrap();
        assert!(attempt.success);
        assert_eq!(attempt.reason_code, "clock_progression");
        assert!(report.exec_depth_ms >= 3 * HOUR);
    }

    #[tokio::test]
    async fn exhausted_plans_classify_as_planning_fault() {
        let (pool, _dir) = test_pool().await;
        let channel_id = plan_store::upsert_channel(&pool, &channel_config("one")).await.unwrap();
        // No plans at all
        let channel = test_channel(&channel_id);
        let clock = MasterClock::fixed(day_start_ms());
        let window = Arc::new(ExecutionWindowStore::new());
        let mut manager = HorizonManager::new(
            channel,
            pool.clone(),
            window,
            clock,
            settings(3 * HOUR, 3 * HOUR),
        );

        let report = manager.evaluate_once().await;
        assert!(!report.execution_compliant);
        assert_eq!(report.extension_attempt_count, 1);
        assert_eq!(report.extension_success_count, 0);
        let attempt = report.recent_attempts.last().unwrap();
        assert_eq!(attempt.error_code.as_deref(), Some("plan_exhausted"));
    }

    #[tokio::test]
    async fn revoked_eligibility_substitutes_filler_in_the_committed_window() {
        // Scenario: entry E references asset A; A is downgraded to
        // state=enriching; at the next extension trigger E is replaced by
        // declared filler
        let (pool, _dir) = test_pool().await;
        let clock = MasterClock::fixed(day_start_ms());
        let (mut manager, window, channel) =
            seeded_manager(&pool, &clock, 3 * HOUR, 3 * HOUR, &["e1", "e2"]).await;

        manager.evaluate_once().await;
        let victim = window
            .all_entries(&channel.id)
            .into_iter()
            .find(|e| e.asset.uri().contains("e1"))
            .expect("an e1 entry exists");

        plan_store::set_asset_state(&pool, "e1", "enriching", true).await.unwrap();

        // Move the clock so the next tick crosses the extension threshold
        let tail = window.tail_end_utc_ms(&channel.id).unwrap();
        clock.advance_ms(tail - clock.now_utc_ms() - HOUR);
        manager.evaluate_once().await;

        let now = clock.now_utc_ms();
        let replaced = window.entry_at(&channel.id, victim.start_utc_ms.max(now));
        // Every remaining e1 slot ahead of the clock is now filler
        for entry in window.entries_from(&channel.id, now) {
            assert!(
                !entry.asset.uri().contains("e1"),
                "entry {} still references the revoked asset",
                entry.id
            );
        }
        // Substituted entries keep their derivation
        if let Some(entry) = replaced {
            assert!(entry.transmission_log_ref.is_some() || entry.is_operator_override());
        }
    }

    #[tokio::test]
    async fn cross_midnight_block_stays_one_entry_and_projects_into_both_days() {
        // Scenario: day start 06:00, a 2-hour block airing 05:00-07:00 UTC
        // stays a single execution entry and appears in both adjacent
        // broadcast-day projections
        let (pool, _dir) = test_pool().await;
        let channel_id = plan_store::upsert_channel(&pool, &channel_config("one")).await.unwrap();
        plan_store::upsert_asset(&pool, &asset_config("filler-show", "30m")).await.unwrap();
        plan_store::upsert_asset(&pool, &asset_config("late-movie", "2h")).await.unwrap();

        let mut plan = full_day_plan(&channel_id, "base", 0, vec![filler()]);
        plan.zones = vec![
            zone("most", 0, 1380, vec![SchedulableAsset::Asset { name: "filler-show".into() }]),
            zone("late", 1380, 1440, vec![SchedulableAsset::Asset { name: "late-movie".into() }]),
        ];
        plan_store::upsert_plan(&pool, &plan, 30).await.unwrap();

        let channel = test_channel(&channel_id);
        // Start late in the Aug 3 broadcast day so the horizon must cross
        // into Aug 4: 04:00 UTC on Aug 4 is 22h into the Aug 3 day
        let clock = MasterClock::fixed(day_start_ms() + 22 * HOUR);
        let window = Arc::new(ExecutionWindowStore::new());
        let mut manager = HorizonManager::new(
            channel.clone(),
            pool.clone(),
            window.clone(),
            clock.clone(),
            settings(3 * HOUR, 3 * HOUR),
        );

        manager.evaluate_once().await;

        // The late movie airs 05:00-07:00 UTC Aug 4, crossing the 06:00 boundary
        let boundary = day_start_ms() + 24 * HOUR;
        let movies: Vec<_> = window
            .all_entries(&channel.id)
            .into_iter()
            .filter(|e| e.asset.uri().contains("late-movie"))
            .collect();
        assert_eq!(movies.len(), 1, "the boundary-crossing block must be one entry");
        let movie = &movies[0];
        assert_eq!(movie.start_utc_ms, boundary - HOUR);
        assert_eq!(movie.end_utc_ms, boundary + HOUR);

        // Exactly one entry covers each minute across the straddle
        for offset in (-60i64..60).step_by(10) {
            let t = boundary + offset * 60_000;
            let covering = window
                .all_entries(&channel.id)
                .iter()
                .filter(|e| e.covers(t))
                .count();
            assert_eq!(covering, 1, "instant {t} not singly covered");
        }

        // Both adjacent broadcast-day projections include it, unsplit
        let (d1_start, d1_end) = channel
            .broadcast_day_window(chrono::NaiveDate::from_ymd_opt(2026, 8, 3).unwrap())
            .unwrap();
        let (d2_start, d2_end) = channel
            .broadcast_day_window(chrono::NaiveDate::from_ymd_opt(2026, 8, 4).unwrap())
            .unwrap();
        let in_day1 = window.project_broadcast_day(&channel.id, d1_start, d1_end);
        let in_day2 = window.project_broadcast_day(&channel.id, d2_start, d2_end);
        assert!(in_day1.iter().any(|e| e.id == movie.id));
        assert!(in_day2.iter().any(|e| e.id == movie.id));
    }
}

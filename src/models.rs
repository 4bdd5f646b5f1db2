use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Days of the week encoded as a bitmask, Monday = bit 0.
pub const ALL_DAYS_MASK: u8 = 0b0111_1111;

pub fn weekday_bit(day: chrono::Weekday) -> u8 {
    1 << day.num_days_from_monday()
}

/// Runtime identity of a channel, resolved from config + DB at startup.
#[derive(Debug, Clone)]
pub struct ChannelRuntime {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub timezone: Tz,
    pub grid_minutes: u32,
    pub day_start: NaiveTime,
}

impl ChannelRuntime {
    /// UTC window of the broadcast day anchored at `date`:
    /// [date @ day_start local, date+1 @ day_start local).
    pub fn broadcast_day_window(&self, date: NaiveDate) -> Option<(i64, i64)> {
        let start = local_anchor_utc_ms(self.timezone, date, self.day_start)?;
        let end = local_anchor_utc_ms(self.timezone, date.succ_opt()?, self.day_start)?;
        Some((start, end))
    }

    /// The broadcast date whose window contains `utc_ms`.
    pub fn broadcast_date_of(&self, utc_ms: i64) -> Option<NaiveDate> {
        let local = self
            .timezone
            .timestamp_millis_opt(utc_ms)
            .earliest()?
            .naive_local();
        let date = local.date();
        if local.time() < self.day_start {
            date.pred_opt()
        } else {
            Some(date)
        }
    }
}

/// Resolve a local wall-clock anchor to UTC milliseconds.
/// DST gaps resolve to the earliest valid instant, matching how scheduled
/// local times are handled elsewhere in the daemon.
pub fn local_anchor_utc_ms(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<i64> {
    tz.from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
}

pub fn utc_ms_to_datetime(utc_ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(utc_ms).unwrap_or_else(Utc::now)
}

/// ISO-8601 with milliseconds, Zulu. The one timestamp format used on the
/// evidence wire and in the spool.
pub fn format_utc_ms(utc_ms: i64) -> String {
    utc_ms_to_datetime(utc_ms)
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
}

// ── Plan-side model ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayMode {
    Random,
    Sequential,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyntheticPattern {
    TestPattern,
    ColorBars,
}

impl SyntheticPattern {
    pub fn uri(&self) -> &'static str {
        match self {
            SyntheticPattern::TestPattern => "synthetic:test-pattern",
            SyntheticPattern::ColorBars => "synthetic:color-bars",
        }
    }
}

/// Input-driven resolution rule for a virtual asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum VirtualRule {
    /// Candidate picked by the broadcast day's day-of-week (Mon = 0).
    ByDayOfWeek { candidates: Vec<String> },
    /// Candidates cycled per airing; the cursor persists across days.
    Rotation { candidates: Vec<String> },
}

/// The operator-facing airable unit. Zones hold these; the transmission log
/// resolves them down to physical assets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulableAsset {
    /// Direct reference to a physical asset, by content-store name.
    Asset { name: String },
    /// Ordered chain of direct/synthetic references with a play mode.
    Program {
        name: String,
        play_mode: PlayMode,
        chain: Vec<SchedulableAsset>,
    },
    /// Resolved to physical assets at transmission-log time.
    Virtual { name: String, rule: VirtualRule },
    /// Generated content; always eligible. Declared filler.
    Synthetic { pattern: SyntheticPattern },
}

impl SchedulableAsset {
    /// Stable identity used for slot coalescing and cursor keys.
    pub fn identity(&self) -> String {
        match self {
            SchedulableAsset::Asset { name } => format!("asset:{name}"),
            SchedulableAsset::Program { name, .. } => format!("program:{name}"),
            SchedulableAsset::Virtual { name, .. } => format!("virtual:{name}"),
            SchedulableAsset::Synthetic { pattern } => format!("synthetic:{}", pattern.uri()),
        }
    }
}

/// A half-open window [from_minute, to_minute) measured from the programming
/// day start, with a day-of-week mask and an asset set.
#[derive(Debug, Clone)]
pub struct Zone {
    pub id: String,
    pub name: String,
    pub from_minute: u32,
    pub to_minute: u32,
    pub day_mask: u8,
    pub assets: Vec<SchedulableAsset>,
}

impl Zone {
    pub fn covers(&self, minute: u32, day: chrono::Weekday) -> bool {
        self.day_mask & weekday_bit(day) != 0 && minute >= self.from_minute && minute < self.to_minute
    }
}

/// Operator-defined recurring intent for one channel.
#[derive(Debug, Clone)]
pub struct SchedulePlan {
    pub id: String,
    pub channel_id: String,
    pub name: String,
    pub day_filter: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub priority: u32,
    pub active: bool,
    pub zones: Vec<Zone>,
}

/// Raw plan row; zones are loaded separately.
#[derive(Debug, Clone, FromRow)]
pub struct SchedulePlanRow {
    pub id: String,
    pub channel_id: String,
    pub name: String,
    pub day_filter: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub priority: i64,
    pub active: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct ZoneRow {
    pub id: String,
    pub plan_id: String,
    pub name: String,
    pub from_minute: i64,
    pub to_minute: i64,
    pub day_mask: i64,
    pub position: i64,
    pub assets: String,
}

/// Physical asset row, the opaque content-store surface.
#[derive(Debug, Clone, FromRow)]
pub struct AssetRow {
    pub id: String,
    pub name: String,
    pub uri: String,
    pub duration_ms: i64,
    pub state: String,
    pub approved_for_broadcast: bool,
}

impl AssetRow {
    /// Eligibility predicate: `state=ready AND approved_for_broadcast=true`.
    pub fn eligible(&self) -> bool {
        self.state == "ready" && self.approved_for_broadcast
    }

    /// Reason string recorded when the predicate fails.
    pub fn ineligibility_reason(&self) -> Option<String> {
        if self.state != "ready" {
            Some("state!=ready".to_string())
        } else if !self.approved_for_broadcast {
            Some("approved_for_broadcast=false".to_string())
        } else {
            None
        }
    }
}

// ── Pipeline output model ──────────────────────────────────────────────

/// One coalesced interval of a resolved schedule day.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedEntry {
    pub start_utc_ms: i64,
    pub end_utc_ms: i64,
    pub asset: SchedulableAsset,
}

/// Per-channel per-broadcast-day lineup at the schedulable-asset level.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedScheduleDay {
    pub channel_id: String,
    pub date: NaiveDate,
    pub day_start_utc_ms: i64,
    pub day_end_utc_ms: i64,
    pub entries: Vec<ResolvedEntry>,
}

/// A physical playback target: either a library asset or generated content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssetRef {
    Library {
        asset_id: String,
        name: String,
        uri: String,
    },
    Synthetic {
        pattern: SyntheticPattern,
    },
}

impl AssetRef {
    pub fn uri(&self) -> &str {
        match self {
            AssetRef::Library { uri, .. } => uri,
            AssetRef::Synthetic { pattern } => pattern.uri(),
        }
    }

    pub fn library_asset_id(&self) -> Option<&str> {
        match self {
            AssetRef::Library { asset_id, .. } => Some(asset_id),
            AssetRef::Synthetic { .. } => None,
        }
    }
}

/// Grid-aligned physical-asset entry of a transmission log.
#[derive(Debug, Clone, Serialize)]
pub struct TransmissionLogEntry {
    pub id: String,
    pub channel_id: String,
    pub start_utc_ms: i64,
    pub end_utc_ms: i64,
    pub asset: AssetRef,
    /// Broadcast date of the resolved day this entry came from.
    pub resolved_day: NaiveDate,
}

/// Record attached to an entry placed by an operator rather than derived
/// from a transmission log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorOverride {
    pub operator: String,
    pub reason: String,
    pub created_utc_ms: i64,
}

// ── Evidence ───────────────────────────────────────────────────────────

/// Current version of the evidence envelope, on disk and on the wire.
pub const EVIDENCE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayloadType {
    BlockStart,
    SegmentStart,
    SegmentEnd,
    BlockFence,
    ChannelTerminated,
}

/// Append-only evidence record. One JSON object per line in the spool; the
/// identical shape streams to the reconciliation service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceEnvelope {
    pub schema_version: u32,
    pub channel_id: String,
    pub playout_session_id: String,
    /// Strictly monotonic, starts at 1, no gaps within a session.
    pub sequence: u64,
    pub event_uuid: String,
    pub emitted_utc: String,
    pub payload_type: PayloadType,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockStartPayload {
    pub execution_entry_id: String,
    pub asset_uri: String,
    pub start_utc_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentStartPayload {
    /// Absent for segments the engine injected without a planning origin.
    pub execution_entry_id: Option<String>,
    pub asset_uri: String,
    pub start_utc_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentEndPayload {
    pub end_utc_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockFencePayload {
    pub execution_entry_id: String,
    pub fence_utc_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelTerminatedPayload {
    pub reason: String,
    pub at_utc_ms: i64,
}

// ── AsRun ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, FromRow)]
pub struct AsRunRow {
    pub id: String,
    pub channel_id: String,
    pub session_id: String,
    pub execution_entry_id: Option<String>,
    pub broadcast_date: String,
    pub start_utc_ms: i64,
    pub end_utc_ms: i64,
    pub asset_uri: String,
    pub origin: String,
    pub truncated: bool,
    pub fenced: bool,
}

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::models::{
    ALL_DAYS_MASK, PlayMode, SchedulableAsset, SchedulePlan, SyntheticPattern, VirtualRule, Zone,
};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub core: CoreConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub evidence: EvidenceConfig,
    #[serde(default)]
    pub channel: Vec<ChannelConfig>,
    #[serde(default)]
    pub asset: Vec<AssetConfig>,
    #[serde(default)]
    pub plan: Vec<PlanConfig>,
}

#[derive(Debug, Deserialize)]
pub struct CoreConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_reconcile_listen")]
    pub reconcile_listen: String,
    /// Engine-facing evidence ingest listener.
    #[serde(default = "default_evidence_listen")]
    pub evidence_listen: String,
    #[serde(default = "default_engine_addr")]
    pub engine_addr: String,
    /// Reserved source every channel cuts to in emergency mode.
    #[serde(default = "default_emergency_source")]
    pub emergency_source: String,
}

fn default_version() -> u32 {
    1
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_listen() -> String {
    "127.0.0.1:8470".to_string()
}
fn default_reconcile_listen() -> String {
    "127.0.0.1:8471".to_string()
}
fn default_evidence_listen() -> String {
    "127.0.0.1:8473".to_string()
}
fn default_engine_addr() -> String {
    "127.0.0.1:8472".to_string()
}
fn default_emergency_source() -> String {
    "synthetic:color-bars".to_string()
}

#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "retrovue.db".to_string()
}

#[derive(Debug, Deserialize)]
pub struct SchedulingConfig {
    #[serde(default = "default_grid_minutes")]
    pub grid_minutes: u32,
    /// Broadcast-day anchor, HH:MM local.
    #[serde(default = "default_day_start")]
    pub programming_day_start: String,
    #[serde(default = "default_epg_horizon_days")]
    pub epg_horizon_days: u32,
    /// Target depth of committed execution entries.
    #[serde(default = "default_min_execution_horizon")]
    pub min_execution_horizon: String,
    /// Depth at which extension fires.
    #[serde(default = "default_extend_threshold")]
    pub proactive_extend_threshold: String,
    /// Horizon evaluation cadence (>= 4 Hz).
    #[serde(default = "default_horizon_tick")]
    pub horizon_tick: String,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            grid_minutes: default_grid_minutes(),
            programming_day_start: default_day_start(),
            epg_horizon_days: default_epg_horizon_days(),
            min_execution_horizon: default_min_execution_horizon(),
            proactive_extend_threshold: default_extend_threshold(),
            horizon_tick: default_horizon_tick(),
        }
    }
}

fn default_grid_minutes() -> u32 {
    30
}
fn default_day_start() -> String {
    "06:00".to_string()
}
fn default_epg_horizon_days() -> u32 {
    2
}
fn default_min_execution_horizon() -> String {
    "3h".to_string()
}
fn default_extend_threshold() -> String {
    "30m".to_string()
}
fn default_horizon_tick() -> String {
    "250ms".to_string()
}

#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Engine startup budget used in the boundary lead-time check.
    #[serde(default = "default_startup_latency")]
    pub startup_latency: String,
    /// Additional margin required before committing to a boundary.
    #[serde(default = "default_min_prefeed_lead_time")]
    pub min_prefeed_lead_time: String,
    #[serde(default = "default_teardown_grace")]
    pub teardown_grace_timeout: String,
    #[serde(default = "default_startup_convergence")]
    pub max_startup_convergence: String,
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            startup_latency: default_startup_latency(),
            min_prefeed_lead_time: default_min_prefeed_lead_time(),
            teardown_grace_timeout: default_teardown_grace(),
            max_startup_convergence: default_startup_convergence(),
            rpc_timeout: default_rpc_timeout(),
        }
    }
}

fn default_startup_latency() -> String {
    "2s".to_string()
}
fn default_min_prefeed_lead_time() -> String {
    "500ms".to_string()
}
fn default_teardown_grace() -> String {
    "10s".to_string()
}
fn default_startup_convergence() -> String {
    "30s".to_string()
}
fn default_rpc_timeout() -> String {
    "2s".to_string()
}

#[derive(Debug, Deserialize)]
pub struct EvidenceConfig {
    /// Spool directory, relative to data_dir unless absolute.
    #[serde(default = "default_spool_root")]
    pub spool_root: String,
    /// Cap on pending (appended minus acked) bytes. 0 = unlimited.
    #[serde(default)]
    pub max_spool_bytes: u64,
    #[serde(default = "default_flush_interval")]
    pub flush_interval: String,
    #[serde(default = "default_flush_records_max")]
    pub flush_records_max: usize,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            spool_root: default_spool_root(),
            max_spool_bytes: 0,
            flush_interval: default_flush_interval(),
            flush_records_max: default_flush_records_max(),
        }
    }
}

fn default_spool_root() -> String {
    "spool".to_string()
}

impl EvidenceConfig {
    pub fn spool_config(&self) -> Result<crate::spool::SpoolConfig, String> {
        Ok(crate::spool::SpoolConfig {
            max_spool_bytes: self.max_spool_bytes,
            flush_interval: std::time::Duration::from_millis(duration_ms(&self.flush_interval)? as u64),
            flush_records_max: self.flush_records_max,
        })
    }
}
fn default_flush_interval() -> String {
    "250ms".to_string()
}
fn default_flush_records_max() -> usize {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub slug: String,
    pub name: String,
    /// Engine output port for StartChannel. 0 lets the engine choose.
    #[serde(default)]
    pub port: u16,
    pub timezone: Option<String>,
    pub grid_minutes: Option<u32>,
    pub programming_day_start: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Content-store surface: physical assets synced into the assets table.
#[derive(Debug, Clone, Deserialize)]
pub struct AssetConfig {
    pub name: String,
    pub uri: String,
    /// Media duration (e.g. "25m", "1h30m").
    pub duration: String,
    #[serde(default = "default_asset_state")]
    pub state: String,
    #[serde(default = "default_approved")]
    pub approved_for_broadcast: bool,
}

fn default_asset_state() -> String {
    "ready".to_string()
}
fn default_approved() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanConfig {
    /// Channel slug this plan belongs to.
    pub channel: String,
    pub name: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_enabled")]
    pub active: bool,
    /// Standard 5-field cron; only date and day-of-week fields are honored.
    pub day_filter: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    #[serde(default)]
    pub zone: Vec<ZoneConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneConfig {
    pub name: String,
    /// Offset from the programming day start, HH:MM ("24:00" = day end).
    pub from: String,
    pub to: String,
    /// Day names ("mon".."sun"); empty = every day.
    #[serde(default)]
    pub days: Vec<String>,
    #[serde(default)]
    pub asset: Vec<ZoneAssetConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneAssetConfig {
    pub kind: String,
    pub name: Option<String>,
    pub play_mode: Option<String>,
    /// Program chain or virtual candidates, as asset names.
    /// "synthetic:test-pattern" / "synthetic:color-bars" are accepted.
    #[serde(default)]
    pub chain: Vec<String>,
    pub rule: Option<String>,
    #[serde(default)]
    pub candidates: Vec<String>,
    pub pattern: Option<String>,
}

impl Config {
    /// Resolve the database path (relative to data_dir if not absolute).
    pub fn db_path(&self) -> PathBuf {
        let db_path = Path::new(&self.database.path);
        if db_path.is_absolute() {
            db_path.to_path_buf()
        } else {
            self.core.data_dir.join(db_path)
        }
    }

    /// Resolve the spool root (relative to data_dir if not absolute).
    pub fn spool_root(&self) -> PathBuf {
        let root = Path::new(&self.evidence.spool_root);
        if root.is_absolute() {
            root.to_path_buf()
        } else {
            self.core.data_dir.join(root)
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(ConfigError::ReadFile)
        .context("reading config file")?;
    let config: Config = toml::from_str(&content).map_err(ConfigError::Parse)?;
    Ok(config)
}

/// Parse a humantime duration string into milliseconds.
pub fn duration_ms(s: &str) -> Result<i64, String> {
    humantime::parse_duration(s)
        .map(|d| d.as_millis() as i64)
        .map_err(|e| format!("invalid duration '{s}': {e}"))
}

/// Parse an HH:MM wall-clock time.
pub fn parse_hhmm(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s, "%H:%M").map_err(|_| format!("invalid time '{s}': expected HH:MM"))
}

/// Parse an HH:MM offset into minutes, allowing "24:00" as the day end.
pub fn parse_offset_minutes(s: &str) -> Result<u32, String> {
    if s == "24:00" {
        return Ok(24 * 60);
    }
    let t = parse_hhmm(s)?;
    use chrono::Timelike;
    Ok(t.hour() * 60 + t.minute())
}

pub fn parse_day_mask(days: &[String]) -> Result<u8, String> {
    if days.is_empty() {
        return Ok(ALL_DAYS_MASK);
    }
    let mut mask = 0u8;
    for day in days {
        let bit = match day.to_lowercase().as_str() {
            "monday" | "mon" => 0,
            "tuesday" | "tue" => 1,
            "wednesday" | "wed" => 2,
            "thursday" | "thu" => 3,
            "friday" | "fri" => 4,
            "saturday" | "sat" => 5,
            "sunday" | "sun" => 6,
            other => return Err(format!("unknown weekday '{other}'")),
        };
        mask |= 1 << bit;
    }
    Ok(mask)
}

impl ZoneAssetConfig {
    pub fn to_domain(&self) -> Result<SchedulableAsset, String> {
        match self.kind.as_str() {
            "asset" => {
                let name = self
                    .name
                    .as_ref()
                    .ok_or_else(|| "asset entry requires a 'name'".to_string())?;
                Ok(SchedulableAsset::Asset { name: name.clone() })
            }
            "program" => {
                let name = self
                    .name
                    .as_ref()
                    .ok_or_else(|| "program entry requires a 'name'".to_string())?;
                let play_mode = match self.play_mode.as_deref() {
                    Some("random") => PlayMode::Random,
                    Some("sequential") => PlayMode::Sequential,
                    Some("manual") => PlayMode::Manual,
                    Some(other) => return Err(format!("program '{name}': unknown play_mode '{other}'")),
                    None => return Err(format!("program '{name}': play_mode is required")),
                };
                if self.chain.is_empty() {
                    return Err(format!("program '{name}': chain must not be empty"));
                }
                let chain = self.chain.iter().map(|c| chain_element(c)).collect::<Result<_, _>>()?;
                Ok(SchedulableAsset::Program {
                    name: name.clone(),
                    play_mode,
                    chain,
                })
            }
            "virtual" => {
                let name = self
                    .name
                    .as_ref()
                    .ok_or_else(|| "virtual entry requires a 'name'".to_string())?;
                if self.candidates.is_empty() {
                    return Err(format!("virtual '{name}': candidates must not be empty"));
                }
                let rule = match self.rule.as_deref() {
                    Some("by_day_of_week") => VirtualRule::ByDayOfWeek {
                        candidates: self.candidates.clone(),
                    },
                    Some("rotation") => VirtualRule::Rotation {
                        candidates: self.candidates.clone(),
                    },
                    Some(other) => return Err(format!("virtual '{name}': unknown rule '{other}'")),
                    None => return Err(format!("virtual '{name}': rule is required")),
                };
                Ok(SchedulableAsset::Virtual {
                    name: name.clone(),
                    rule,
                })
            }
            "synthetic" => {
                let pattern = parse_pattern(self.pattern.as_deref())?;
                Ok(SchedulableAsset::Synthetic { pattern })
            }
            other => Err(format!("unknown zone asset kind '{other}'")),
        }
    }
}

fn chain_element(name: &str) -> Result<SchedulableAsset, String> {
    if let Some(rest) = name.strip_prefix("synthetic:") {
        let pattern = match rest {
            "test-pattern" => SyntheticPattern::TestPattern,
            "color-bars" => SyntheticPattern::ColorBars,
            other => return Err(format!("unknown synthetic pattern '{other}'")),
        };
        Ok(SchedulableAsset::Synthetic { pattern })
    } else {
        Ok(SchedulableAsset::Asset {
            name: name.to_string(),
        })
    }
}

fn parse_pattern(pattern: Option<&str>) -> Result<SyntheticPattern, String> {
    match pattern {
        Some("test_pattern") | Some("test-pattern") => Ok(SyntheticPattern::TestPattern),
        Some("color_bars") | Some("color-bars") | None => Ok(SyntheticPattern::ColorBars),
        Some(other) => Err(format!("unknown synthetic pattern '{other}'")),
    }
}

impl PlanConfig {
    /// Build the domain plan (without persistent ids) for validation and sync.
    pub fn to_domain(&self, channel_id: &str) -> Result<SchedulePlan, String> {
        let start_date = self
            .start_date
            .as_deref()
            .map(parse_date)
            .transpose()?;
        let end_date = self.end_date.as_deref().map(parse_date).transpose()?;

        let mut zones = Vec::new();
        for z in &self.zone {
            let from_minute = parse_offset_minutes(&z.from).map_err(|e| format!("zone '{}': {e}", z.name))?;
            let to_minute = parse_offset_minutes(&z.to).map_err(|e| format!("zone '{}': {e}", z.name))?;
            let day_mask = parse_day_mask(&z.days).map_err(|e| format!("zone '{}': {e}", z.name))?;
            let assets = z
                .asset
                .iter()
                .map(|a| a.to_domain())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| format!("zone '{}': {e}", z.name))?;
            zones.push(Zone {
                id: String::new(),
                name: z.name.clone(),
                from_minute,
                to_minute,
                day_mask,
                assets,
            });
        }

        Ok(SchedulePlan {
            id: String::new(),
            channel_id: channel_id.to_string(),
            name: self.name.clone(),
            day_filter: self.day_filter.clone(),
            start_date,
            end_date,
            priority: self.priority,
            active: self.active,
            zones,
        })
    }
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| format!("invalid date '{s}': expected YYYY-MM-DD"))
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.core.version != 1 {
        return Err(ConfigError::Validation(format!(
            "unsupported config version {} (this binary supports version 1)",
            config.core.version
        ))
        .into());
    }

    config
        .core
        .timezone
        .parse::<chrono_tz::Tz>()
        .map_err(|_| ConfigError::Validation(format!("unknown timezone '{}'", config.core.timezone)))?;

    // Scheduling parameters
    let sched = &config.scheduling;
    if sched.grid_minutes == 0 || 1440 % sched.grid_minutes != 0 {
        return Err(ConfigError::Validation(format!(
            "grid_minutes {} must divide a day evenly",
            sched.grid_minutes
        ))
        .into());
    }
    parse_hhmm(&sched.programming_day_start).map_err(ConfigError::Validation)?;
    for (key, value) in [
        ("min_execution_horizon", &sched.min_execution_horizon),
        ("proactive_extend_threshold", &sched.proactive_extend_threshold),
        ("horizon_tick", &sched.horizon_tick),
        ("startup_latency", &config.runtime.startup_latency),
        ("min_prefeed_lead_time", &config.runtime.min_prefeed_lead_time),
        ("teardown_grace_timeout", &config.runtime.teardown_grace_timeout),
        ("max_startup_convergence", &config.runtime.max_startup_convergence),
        ("rpc_timeout", &config.runtime.rpc_timeout),
        ("flush_interval", &config.evidence.flush_interval),
    ] {
        duration_ms(value).map_err(|e| ConfigError::Validation(format!("{key}: {e}")))?;
    }
    let tick = duration_ms(&sched.horizon_tick).unwrap_or(250);
    if tick > 250 {
        return Err(ConfigError::Validation(format!(
            "horizon_tick '{}' is slower than the 4 Hz minimum",
            sched.horizon_tick
        ))
        .into());
    }

    // Channels
    let mut channel_slugs = HashSet::new();
    for channel in &config.channel {
        if !channel_slugs.insert(channel.slug.clone()) {
            return Err(ConfigError::Validation(format!("duplicate channel slug: '{}'", channel.slug)).into());
        }
        if channel.slug.is_empty()
            || !channel
                .slug
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(ConfigError::Validation(format!(
                "channel '{}': slug '{}' must contain only lowercase letters, digits, and hyphens",
                channel.name, channel.slug
            ))
            .into());
        }
        if let Some(ref tz) = channel.timezone {
            tz.parse::<chrono_tz::Tz>()
                .map_err(|_| ConfigError::Validation(format!("channel '{}': unknown timezone '{tz}'", channel.slug)))?;
        }
        if let Some(ref start) = channel.programming_day_start {
            parse_hhmm(start)
                .map_err(|e| ConfigError::Validation(format!("channel '{}': {e}", channel.slug)))?;
        }
    }

    // Assets
    let mut asset_names = HashSet::new();
    for asset in &config.asset {
        if !asset_names.insert(asset.name.clone()) {
            return Err(ConfigError::Validation(format!("duplicate asset name: '{}'", asset.name)).into());
        }
        let dur = duration_ms(&asset.duration)
            .map_err(|e| ConfigError::Validation(format!("asset '{}': {e}", asset.name)))?;
        if dur <= 0 {
            return Err(ConfigError::Validation(format!(
                "asset '{}': duration must be positive",
                asset.name
            ))
            .into());
        }
    }

    // Plans: shape here, full semantic validation (overlap, coverage, cron)
    // happens again at the store write path.
    for plan in &config.plan {
        if !channel_slugs.contains(&plan.channel) {
            return Err(ConfigError::Validation(format!(
                "plan '{}': references unknown channel '{}'",
                plan.name, plan.channel
            ))
            .into());
        }
        let domain = plan
            .to_domain(&plan.channel)
            .map_err(|e| ConfigError::Validation(format!("plan '{}': {e}", plan.name)))?;
        crate::plan_store::validate_plan(&domain, config.scheduling.grid_minutes)
            .map_err(|e| ConfigError::Validation(format!("plan '{}': {e}", plan.name)))?;

        // Zone asset references must exist in the content store
        for zone in &domain.zones {
            for asset in &zone.assets {
                for name in referenced_asset_names(asset) {
                    if !asset_names.contains(&name) {
                        return Err(ConfigError::Validation(format!(
                            "plan '{}', zone '{}': references unknown asset '{name}'",
                            plan.name, zone.name
                        ))
                        .into());
                    }
                }
            }
        }
    }

    Ok(())
}

/// Physical asset names referenced by a schedulable asset (recursively).
fn referenced_asset_names(asset: &SchedulableAsset) -> Vec<String> {
    match asset {
        SchedulableAsset::Asset { name } => vec![name.clone()],
        SchedulableAsset::Program { chain, .. } => {
            chain.iter().flat_map(referenced_asset_names).collect()
        }
        SchedulableAsset::Virtual { rule, .. } => match rule {
            VirtualRule::ByDayOfWeek { candidates } | VirtualRule::Rotation { candidates } => {
                candidates.clone()
            }
        },
        SchedulableAsset::Synthetic { .. } => Vec::new(),
    }
}

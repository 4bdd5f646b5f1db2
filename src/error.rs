use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

/// Structured plan validation failure surfaced to the operator.
#[derive(Debug, Clone, Error)]
#[error("plan_validation_error [{code}]: {message}")]
pub struct PlanValidationError {
    pub code: &'static str,
    pub message: String,
    pub offending_ids: Vec<String>,
    /// Offending window in minutes from the programming day start, if the
    /// failure is interval-shaped (overlap, gap).
    pub offending_interval: Option<(u32, u32)>,
}

impl PlanValidationError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            offending_ids: Vec::new(),
            offending_interval: None,
        }
    }

    pub fn with_ids(mut self, ids: Vec<String>) -> Self {
        self.offending_ids = ids;
        self
    }

    pub fn with_interval(mut self, from: u32, to: u32) -> Self {
        self.offending_interval = Some((from, to));
        self
    }
}

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("clock_authority_violation: {0}")]
    AuthorityViolation(String),
}

/// Execution window admission failures. Each variant maps to one tagged
/// invariant code returned with the rejected batch.
#[derive(Debug, Clone, Error)]
pub enum WindowError {
    #[error(
        "INV-EXECUTIONENTRY-DERIVED-FROM-TRANSMISSIONLOG-001-VIOLATED: entry {entry_id} has neither a transmission log ref nor an operator override"
    )]
    DerivationViolation { entry_id: String },
    #[error("INV-EXECUTIONENTRY-NO-GAPS-001-VIOLATED: gap before {start_utc_ms} (window tail ends at {tail_end_utc_ms})")]
    Gap { tail_end_utc_ms: i64, start_utc_ms: i64 },
    #[error(
        "INV-EXECUTIONENTRY-SINGLE-AUTHORITY-AT-TIME-001-VIOLATED: entry {entry_id} overlaps committed coverage at {start_utc_ms}"
    )]
    Overlap { entry_id: String, start_utc_ms: i64 },
    #[error("entry {entry_id} is malformed: end {end_utc_ms} <= start {start_utc_ms}")]
    EmptyInterval {
        entry_id: String,
        start_utc_ms: i64,
        end_utc_ms: i64,
    },
    #[error("entry {entry_id} is locked; field writes are rejected")]
    Locked { entry_id: String },
    #[error("no committed entry with id {entry_id}")]
    UnknownEntry { entry_id: String },
    #[error("substitute for {entry_id} must keep the interval [{start_utc_ms}, {end_utc_ms})")]
    SubstituteIntervalMismatch {
        entry_id: String,
        start_utc_ms: i64,
        end_utc_ms: i64,
    },
}

impl WindowError {
    /// Tagged invariant code carried by batch rejections.
    pub fn invariant_code(&self) -> &'static str {
        match self {
            WindowError::DerivationViolation { .. } => {
                "INV-EXECUTIONENTRY-DERIVED-FROM-TRANSMISSIONLOG-001-VIOLATED"
            }
            WindowError::Gap { .. } => "INV-EXECUTIONENTRY-NO-GAPS-001-VIOLATED",
            WindowError::Overlap { .. } => "INV-EXECUTIONENTRY-SINGLE-AUTHORITY-AT-TIME-001-VIOLATED",
            WindowError::EmptyInterval { .. }
            | WindowError::Locked { .. }
            | WindowError::UnknownEntry { .. }
            | WindowError::SubstituteIntervalMismatch { .. } => "INV-EXECUTIONENTRY-MALFORMED",
        }
    }
}

/// Engine control-plane RPC failures as observed by the core.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("channel {channel_id} not started")]
    NotStarted { channel_id: String },
    #[error("no preview loaded for channel {channel_id}")]
    NoPreviewLoaded { channel_id: String },
    #[error("engine rejected {op}: {detail}")]
    Rejected { op: &'static str, detail: String },
    #[error("engine transport failed: {0}")]
    Transport(String),
    #[error("engine RPC timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

#[derive(Debug, Error)]
pub enum BoundaryError {
    #[error("boundary_transition_violation: {from} -> {to} is not a legal transition")]
    TransitionViolation { from: &'static str, to: &'static str },
    #[error(
        "startup_infeasibility: no feasible boundary within the convergence window ({window_ms}ms)"
    )]
    StartupInfeasibility { window_ms: i64 },
    #[error("boundary {boundary_utc_ms} violates the planning lead time (needs {required_lead_ms}ms)")]
    LeadTimeViolation {
        boundary_utc_ms: i64,
        required_lead_ms: i64,
    },
    #[error("engine RPC failed at boundary: {0}")]
    Engine(#[from] EngineError),
}

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("spool_full: {pending_bytes} pending bytes exceeds cap {max_spool_bytes}")]
    Full {
        pending_bytes: u64,
        max_spool_bytes: u64,
    },
    #[error("evidence_sequence_gap: expected {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },
    #[error("schema version mismatch: spool writes v{expected}, envelope is v{got}")]
    SchemaVersion { expected: u32, got: u32 },
    #[error("spool is closed")]
    Closed,
    #[error("spool io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("spool record is not valid JSON: {0}")]
    Corrupt(String),
}

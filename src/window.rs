use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::debug;
use uuid::Uuid;

use crate::error::WindowError;
use crate::models::{AssetRef, OperatorOverride, TransmissionLogEntry};

/// The runtime authority: the sole source of truth for what a channel airs
/// at any instant inside the horizon.
///
/// Fields are set once at generation and never written again; `locked` is
/// the only mutable bit and it only ever goes false -> true.
#[derive(Debug)]
pub struct ExecutionEntry {
    pub id: String,
    pub channel_id: String,
    pub start_utc_ms: i64,
    pub end_utc_ms: i64,
    pub asset: AssetRef,
    pub transmission_log_ref: Option<String>,
    pub operator_override: Option<OperatorOverride>,
    locked: AtomicBool,
}

impl ExecutionEntry {
    /// Derive an entry from a transmission log entry. Timestamps come from
    /// the planning pass, which itself runs on MasterClock time.
    pub fn from_transmission(entry: &TransmissionLogEntry) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            channel_id: entry.channel_id.clone(),
            start_utc_ms: entry.start_utc_ms,
            end_utc_ms: entry.end_utc_ms,
            asset: entry.asset.clone(),
            transmission_log_ref: Some(entry.id.clone()),
            operator_override: None,
            locked: AtomicBool::new(false),
        }
    }

    /// Operator-placed entry; carries its override record instead of a
    /// transmission log ref.
    pub fn with_override(
        channel_id: &str,
        start_utc_ms: i64,
        end_utc_ms: i64,
        asset: AssetRef,
        operator_override: OperatorOverride,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            channel_id: channel_id.to_string(),
            start_utc_ms,
            end_utc_ms,
            asset,
            transmission_log_ref: None,
            operator_override: Some(operator_override),
            locked: AtomicBool::new(false),
        }
    }

    pub fn is_operator_override(&self) -> bool {
        self.operator_override.is_some()
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub fn covers(&self, utc_ms: i64) -> bool {
        utc_ms >= self.start_utc_ms && utc_ms < self.end_utc_ms
    }
}

/// Committed execution entries per channel, in time order.
///
/// Writes are serialized per channel; committed entries are immutable, so
/// readers share them as `Arc`s without further locking.
#[derive(Default)]
pub struct ExecutionWindowStore {
    channels: RwLock<HashMap<String, Arc<ChannelWindow>>>,
}

#[derive(Default)]
struct ChannelWindow {
    entries: RwLock<Vec<Arc<ExecutionEntry>>>,
}

impl ExecutionWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, channel_id: &str) -> Arc<ChannelWindow> {
        if let Some(window) = self.channels.read().expect("window map poisoned").get(channel_id) {
            return window.clone();
        }
        let mut map = self.channels.write().expect("window map poisoned");
        map.entry(channel_id.to_string()).or_default().clone()
    }

    /// Commit a batch of entries. The whole batch is validated against the
    /// derivation, no-gap, and single-authority invariants before anything
    /// is appended; on violation the batch is rejected atomically with the
    /// tagged invariant error.
    pub fn add_entries(
        &self,
        channel_id: &str,
        batch: Vec<ExecutionEntry>,
    ) -> Result<Vec<Arc<ExecutionEntry>>, WindowError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let window = self.channel(channel_id);
        let mut entries = window.entries.write().expect("channel window poisoned");

        for entry in &batch {
            if entry.end_utc_ms <= entry.start_utc_ms {
                return Err(WindowError::EmptyInterval {
                    entry_id: entry.id.clone(),
                    start_utc_ms: entry.start_utc_ms,
                    end_utc_ms: entry.end_utc_ms,
                });
            }
            if entry.transmission_log_ref.is_none() && !entry.is_operator_override() {
                return Err(WindowError::DerivationViolation {
                    entry_id: entry.id.clone(),
                });
            }
        }

        // Contiguity within the batch
        for pair in batch.windows(2) {
            if pair[1].start_utc_ms > pair[0].end_utc_ms {
                return Err(WindowError::Gap {
                    tail_end_utc_ms: pair[0].end_utc_ms,
                    start_utc_ms: pair[1].start_utc_ms,
                });
            }
            if pair[1].start_utc_ms < pair[0].end_utc_ms {
                return Err(WindowError::Overlap {
                    entry_id: pair[1].id.clone(),
                    start_utc_ms: pair[1].start_utc_ms,
                });
            }
        }

        // Contiguity with the committed tail
        if let Some(tail) = entries.last() {
            let first = &batch[0];
            if first.start_utc_ms > tail.end_utc_ms {
                return Err(WindowError::Gap {
                    tail_end_utc_ms: tail.end_utc_ms,
                    start_utc_ms: first.start_utc_ms,
                });
            }
            if first.start_utc_ms < tail.end_utc_ms {
                return Err(WindowError::Overlap {
                    entry_id: first.id.clone(),
                    start_utc_ms: first.start_utc_ms,
                });
            }
        }

        let committed: Vec<Arc<ExecutionEntry>> = batch.into_iter().map(Arc::new).collect();
        entries.extend(committed.iter().cloned());
        debug!(channel = %channel_id, added = committed.len(), total = entries.len(), "execution entries committed");
        Ok(committed)
    }

    /// The single entry covering `utc_ms`, if any.
    pub fn entry_at(&self, channel_id: &str, utc_ms: i64) -> Option<Arc<ExecutionEntry>> {
        let window = self.channel(channel_id);
        let entries = window.entries.read().expect("channel window poisoned");
        let idx = entries.partition_point(|e| e.end_utc_ms <= utc_ms);
        entries.get(idx).filter(|e| e.covers(utc_ms)).cloned()
    }

    /// First entry starting strictly after `utc_ms` — the next boundary.
    pub fn next_entry_after(&self, channel_id: &str, utc_ms: i64) -> Option<Arc<ExecutionEntry>> {
        let window = self.channel(channel_id);
        let entries = window.entries.read().expect("channel window poisoned");
        let idx = entries.partition_point(|e| e.start_utc_ms <= utc_ms);
        entries.get(idx).cloned()
    }

    pub fn tail_end_utc_ms(&self, channel_id: &str) -> Option<i64> {
        let window = self.channel(channel_id);
        let entries = window.entries.read().expect("channel window poisoned");
        entries.last().map(|e| e.end_utc_ms)
    }

    /// Entries whose interval ends after `utc_ms`, in time order.
    pub fn entries_from(&self, channel_id: &str, utc_ms: i64) -> Vec<Arc<ExecutionEntry>> {
        let window = self.channel(channel_id);
        let entries = window.entries.read().expect("channel window poisoned");
        let idx = entries.partition_point(|e| e.end_utc_ms <= utc_ms);
        entries[idx..].to_vec()
    }

    /// Transition an entry to locked. Locked entries reject field writes;
    /// there are no field-write paths, so this is the commit point after
    /// which even substitution preserves the interval.
    pub fn lock(&self, channel_id: &str, entry_id: &str) -> Result<(), WindowError> {
        let window = self.channel(channel_id);
        let entries = window.entries.read().expect("channel window poisoned");
        match entries.iter().find(|e| e.id == entry_id) {
            Some(entry) => {
                entry.locked.store(true, Ordering::Release);
                Ok(())
            }
            None => Err(WindowError::UnknownEntry {
                entry_id: entry_id.to_string(),
            }),
        }
    }

    /// Read-only broadcast-day projection: every committed entry whose
    /// interval intersects [window_start, window_end). Entries straddling
    /// the window edges are returned whole — never split, never mutated.
    pub fn project_broadcast_day(
        &self,
        channel_id: &str,
        window_start_utc_ms: i64,
        window_end_utc_ms: i64,
    ) -> Vec<Arc<ExecutionEntry>> {
        let window = self.channel(channel_id);
        let entries = window.entries.read().expect("channel window poisoned");
        entries
            .iter()
            .filter(|e| e.start_utc_ms < window_end_utc_ms && e.end_utc_ms > window_start_utc_ms)
            .cloned()
            .collect()
    }

    /// Swap one committed entry for a replacement covering the identical
    /// interval. Used when an admitted asset loses eligibility: the slot
    /// keeps its derivation and timing, only the material changes.
    pub fn substitute_entry(
        &self,
        channel_id: &str,
        entry_id: &str,
        replacement: ExecutionEntry,
    ) -> Result<Arc<ExecutionEntry>, WindowError> {
        let window = self.channel(channel_id);
        let mut entries = window.entries.write().expect("channel window poisoned");
        let Some(idx) = entries.iter().position(|e| e.id == entry_id) else {
            return Err(WindowError::UnknownEntry {
                entry_id: entry_id.to_string(),
            });
        };
        let current = &entries[idx];
        if replacement.start_utc_ms != current.start_utc_ms || replacement.end_utc_ms != current.end_utc_ms {
            return Err(WindowError::SubstituteIntervalMismatch {
                entry_id: entry_id.to_string(),
                start_utc_ms: current.start_utc_ms,
                end_utc_ms: current.end_utc_ms,
            });
        }
        if replacement.transmission_log_ref.is_none() && !replacement.is_operator_override() {
            return Err(WindowError::DerivationViolation {
                entry_id: replacement.id.clone(),
            });
        }
        let committed = Arc::new(replacement);
        entries[idx] = committed.clone();
        debug!(channel = %channel_id, entry = %entry_id, replacement = %committed.id, "entry substituted");
        Ok(committed)
    }

    #[cfg(test)]
    pub fn all_entries(&self, channel_id: &str) -> Vec<Arc<ExecutionEntry>> {
        self.entries_from(channel_id, i64::MIN)
    }
}

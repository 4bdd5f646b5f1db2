use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::SpoolError;
use crate::models::{EVIDENCE_SCHEMA_VERSION, EvidenceEnvelope, format_utc_ms};

#[derive(Debug, Clone)]
pub struct SpoolConfig {
    /// Cap on pending (appended minus acked) bytes. 0 = unlimited.
    pub max_spool_bytes: u64,
    pub flush_interval: Duration,
    pub flush_records_max: usize,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            max_spool_bytes: 0,
            flush_interval: Duration::from_millis(250),
            flush_records_max: 50,
        }
    }
}

struct SpoolState {
    queue: Vec<String>,
    /// (sequence, line bytes) appended but not yet acked, oldest first.
    unacked: VecDeque<(u64, u64)>,
    pending_bytes: u64,
    last_sequence: u64,
    acked_sequence: u64,
    closed: bool,
    io_failed: bool,
}

struct SpoolShared {
    spool_path: PathBuf,
    ack_path: PathBuf,
    config: SpoolConfig,
    state: Mutex<SpoolState>,
    /// Wakes the writer thread when records queue up or on close.
    writer_wake: Condvar,
    /// Wakes producers waiting on a drain (flush barrier, capacity).
    producer_wake: Condvar,
}

/// Crash-safe append-only evidence spool:
/// `{spool_root}/{channel_id}/{session_id}.spool.jsonl` plus a companion
/// `.ack` file updated via tmp+rename.
///
/// One dedicated writer thread drains the in-memory queue; records hit disk
/// when `flush_records_max` queue up or `flush_interval` elapses, and on
/// shutdown. Reopening an existing spool resumes sequence and pending-byte
/// accounting from what survived on disk.
pub struct EvidenceSpool {
    shared: Arc<SpoolShared>,
    writer: Option<std::thread::JoinHandle<()>>,
}

impl EvidenceSpool {
    pub fn open(
        spool_root: &Path,
        channel_id: &str,
        session_id: &str,
        config: SpoolConfig,
    ) -> Result<Self, SpoolError> {
        let dir = spool_root.join(channel_id);
        std::fs::create_dir_all(&dir)?;
        let spool_path = dir.join(format!("{session_id}.spool.jsonl"));
        let ack_path = dir.join(format!("{session_id}.ack"));

        let acked_sequence = read_ack_file(&ack_path);

        // Resume bookkeeping from whatever survived a previous process
        let mut last_sequence = 0u64;
        let mut unacked = VecDeque::new();
        let mut pending_bytes = 0u64;
        for (envelope, line_bytes) in read_spool_records(&spool_path)? {
            last_sequence = last_sequence.max(envelope.sequence);
            if envelope.sequence > acked_sequence {
                pending_bytes += line_bytes;
                unacked.push_back((envelope.sequence, line_bytes));
            }
        }

        let shared = Arc::new(SpoolShared {
            spool_path,
            ack_path,
            config,
            state: Mutex::new(SpoolState {
                queue: Vec::new(),
                unacked,
                pending_bytes,
                last_sequence,
                acked_sequence,
                closed: false,
                io_failed: false,
            }),
            writer_wake: Condvar::new(),
            producer_wake: Condvar::new(),
        });

        let writer_shared = shared.clone();
        let writer = std::thread::Builder::new()
            .name(format!("spool-{channel_id}"))
            .spawn(move || writer_loop(writer_shared))
            .map_err(SpoolError::Io)?;

        info!(
            path = %shared.spool_path.display(),
            acked_sequence,
            last_sequence,
            "evidence spool opened"
        );

        Ok(Self {
            shared,
            writer: Some(writer),
        })
    }

    /// Append one envelope. Preconditions: the spool is open, the schema
    /// version matches, and the sequence continues the session exactly — a
    /// gap is an internal bug and fatal by contract.
    pub fn append(&self, envelope: &EvidenceEnvelope) -> Result<(), SpoolError> {
        self.append_inner(envelope, true)
    }

    /// Append bypassing the pending-byte cap. Reserved for the terminal
    /// CHANNEL_TERMINATED record that must land even on a full spool.
    pub fn append_unbounded(&self, envelope: &EvidenceEnvelope) -> Result<(), SpoolError> {
        self.append_inner(envelope, false)
    }

    fn append_inner(&self, envelope: &EvidenceEnvelope, enforce_cap: bool) -> Result<(), SpoolError> {
        if envelope.schema_version != EVIDENCE_SCHEMA_VERSION {
            return Err(SpoolError::SchemaVersion {
                expected: EVIDENCE_SCHEMA_VERSION,
                got: envelope.schema_version,
            });
        }
        let mut line = serde_json::to_string(envelope).map_err(|e| SpoolError::Corrupt(e.to_string()))?;
        line.push('\n');
        let line_bytes = line.len() as u64;

        let mut state = self.shared.state.lock().expect("spool state poisoned");
        if state.closed || state.io_failed {
            return Err(SpoolError::Closed);
        }
        let expected = state.last_sequence + 1;
        if envelope.sequence != expected {
            return Err(SpoolError::SequenceGap {
                expected,
                got: envelope.sequence,
            });
        }
        if enforce_cap
            && self.shared.config.max_spool_bytes > 0
            && state.pending_bytes + line_bytes > self.shared.config.max_spool_bytes
        {
            return Err(SpoolError::Full {
                pending_bytes: state.pending_bytes,
                max_spool_bytes: self.shared.config.max_spool_bytes,
            });
        }

        state.last_sequence = envelope.sequence;
        state.pending_bytes += line_bytes;
        state.unacked.push_back((envelope.sequence, line_bytes));
        state.queue.push(line);
        if state.queue.len() >= self.shared.config.flush_records_max {
            self.shared.writer_wake.notify_one();
        }
        Ok(())
    }

    /// Advance the persisted ack cursor. Only moves forward; the `.ack`
    /// file is rewritten via tmp+rename so readers never observe a torn
    /// write. Returns whether the cursor moved.
    pub fn update_ack(&self, sequence: u64, now_utc_ms: i64) -> Result<bool, SpoolError> {
        let mut state = self.shared.state.lock().expect("spool state poisoned");
        if sequence <= state.acked_sequence {
            return Ok(false);
        }
        write_ack_file(&self.shared.ack_path, sequence, now_utc_ms)?;
        state.acked_sequence = sequence;
        while let Some(&(seq, bytes)) = state.unacked.front() {
            if seq > sequence {
                break;
            }
            state.pending_bytes = state.pending_bytes.saturating_sub(bytes);
            state.unacked.pop_front();
        }
        self.shared.producer_wake.notify_all();
        debug!(sequence, pending_bytes = state.pending_bytes, "ack cursor advanced");
        Ok(true)
    }

    pub fn acked_sequence(&self) -> u64 {
        self.shared.state.lock().expect("spool state poisoned").acked_sequence
    }

    pub fn last_sequence(&self) -> u64 {
        self.shared.state.lock().expect("spool state poisoned").last_sequence
    }

    pub fn pending_bytes(&self) -> u64 {
        self.shared.state.lock().expect("spool state poisoned").pending_bytes
    }

    pub fn max_spool_bytes(&self) -> u64 {
        self.shared.config.max_spool_bytes
    }

    /// True once the writer thread gave up on a persistent IO failure; the
    /// session must terminate.
    pub fn is_failed(&self) -> bool {
        self.shared.state.lock().expect("spool state poisoned").io_failed
    }

    /// Block until everything queued so far is on disk.
    pub fn flush_blocking(&self) {
        let mut state = self.shared.state.lock().expect("spool state poisoned");
        while !state.queue.is_empty() && !state.io_failed {
            self.shared.writer_wake.notify_one();
            let (guard, _) = self
                .shared
                .producer_wake
                .wait_timeout(state, Duration::from_millis(50))
                .expect("spool state poisoned");
            state = guard;
        }
    }

    /// Every durable record with `sequence > from_sequence`, in order. A
    /// torn trailing line from a crash is ignored; it never re-sequences
    /// anything.
    pub fn replay_from(&self, from_sequence: u64) -> Result<Vec<EvidenceEnvelope>, SpoolError> {
        self.flush_blocking();
        let records = read_spool_records(&self.shared.spool_path)?;
        Ok(records
            .into_iter()
            .map(|(envelope, _)| envelope)
            .filter(|e| e.sequence > from_sequence)
            .collect())
    }

    pub fn spool_path(&self) -> &Path {
        &self.shared.spool_path
    }

    pub fn ack_path(&self) -> &Path {
        &self.shared.ack_path
    }

    /// Final drain and writer join.
    pub fn close(&mut self) {
        {
            let mut state = self.shared.state.lock().expect("spool state poisoned");
            if state.closed {
                return;
            }
            state.closed = true;
            self.shared.writer_wake.notify_all();
        }
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

impl Drop for EvidenceSpool {
    fn drop(&mut self) {
        self.close();
    }
}

fn writer_loop(shared: Arc<SpoolShared>) {
    loop {
        let batch = {
            let mut state = shared.state.lock().expect("spool state poisoned");
            while state.queue.is_empty() && !state.closed {
                let (guard, _) = shared
                    .writer_wake
                    .wait_timeout(state, shared.config.flush_interval)
                    .expect("spool state poisoned");
                state = guard;
                if !state.queue.is_empty() {
                    break;
                }
            }
            if state.queue.is_empty() && state.closed {
                return;
            }
            std::mem::take(&mut state.queue)
        };

        if let Err(e) = write_batch(&shared.spool_path, &batch) {
            warn!(error = %e, "spool write failed, retrying once");
            if let Err(e) = write_batch(&shared.spool_path, &batch) {
                error!(error = %e, path = %shared.spool_path.display(), "spool write failed persistently");
                let mut state = shared.state.lock().expect("spool state poisoned");
                state.io_failed = true;
                shared.producer_wake.notify_all();
                return;
            }
        }
        shared.producer_wake.notify_all();
    }
}

fn write_batch(path: &Path, batch: &[String]) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    for line in batch {
        file.write_all(line.as_bytes())?;
    }
    file.flush()?;
    file.sync_data()
}

/// Parse the spool file. A JSON error on the final line is treated as a torn
/// crash artifact and dropped; corruption anywhere else is an error.
fn read_spool_records(path: &Path) -> Result<Vec<(EvidenceEnvelope, u64)>, SpoolError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(SpoolError::Io(e)),
    };
    let lines: Vec<&str> = content.lines().collect();
    let mut records = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EvidenceEnvelope>(line) {
            Ok(envelope) => records.push((envelope, line.len() as u64 + 1)),
            Err(e) if idx == lines.len() - 1 => {
                warn!(path = %path.display(), error = %e, "ignoring torn trailing spool line");
            }
            Err(e) => return Err(SpoolError::Corrupt(format!("line {}: {e}", idx + 1))),
        }
    }
    Ok(records)
}

/// `.ack` file format, two LF lines:
/// ```text
/// acked_sequence=<uint64>
/// updated_utc=<ISO-8601>
/// ```
/// A missing or unreadable file reads as 0.
pub fn read_ack_file(path: &Path) -> u64 {
    let Ok(content) = std::fs::read_to_string(path) else {
        return 0;
    };
    content
        .lines()
        .find_map(|line| line.strip_prefix("acked_sequence="))
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

fn write_ack_file(path: &Path, sequence: u64, now_utc_ms: i64) -> Result<(), SpoolError> {
    let tmp = path.with_extension("ack.tmp");
    let body = format!("acked_sequence={sequence}\nupdated_utc={}\n", format_utc_ms(now_utc_ms));
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

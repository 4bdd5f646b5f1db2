use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::MasterClock;
use crate::error::SpoolError;
use crate::models::{
    BlockFencePayload, BlockStartPayload, ChannelTerminatedPayload, EVIDENCE_SCHEMA_VERSION,
    EvidenceEnvelope, PayloadType, SegmentEndPayload, SegmentStartPayload, format_utc_ms,
};
use crate::spool::EvidenceSpool;

/// Builds evidence envelopes for one playout session: schema version, v4
/// event uuid, ISO-8601 timestamp, fetch-add sequence starting at 1.
///
/// Emission is fire-and-forget for the producer: append to the spool, hand
/// to the transport. A full spool flips the emitter into degraded mode —
/// one CHANNEL_TERMINATED is recorded, then emissions are skipped (and
/// counted) until acks free capacity. Entry and exit are logged once per
/// transition; local emission never blocks.
pub struct EvidenceEmitter {
    channel_id: String,
    session_id: String,
    clock: MasterClock,
    spool: Arc<EvidenceSpool>,
    outbound: mpsc::UnboundedSender<EvidenceEnvelope>,
    /// Last allocated sequence.
    sequence: AtomicU64,
    degraded: AtomicBool,
}

impl EvidenceEmitter {
    pub fn new(
        channel_id: &str,
        session_id: &str,
        clock: MasterClock,
        spool: Arc<EvidenceSpool>,
    ) -> (Self, mpsc::UnboundedReceiver<EvidenceEnvelope>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let emitter = Self {
            channel_id: channel_id.to_string(),
            session_id: session_id.to_string(),
            clock,
            // Resume numbering from what already survives on disk
            sequence: AtomicU64::new(spool.last_sequence()),
            spool,
            outbound,
            degraded: AtomicBool::new(false),
        };
        (emitter, rx)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    pub fn emit_block_start(&self, payload: BlockStartPayload) -> Result<(), SpoolError> {
        self.emit(PayloadType::BlockStart, serde_json::to_value(payload).expect("payload serializes"))
    }

    pub fn emit_segment_start(&self, payload: SegmentStartPayload) -> Result<(), SpoolError> {
        self.emit(
            PayloadType::SegmentStart,
            serde_json::to_value(payload).expect("payload serializes"),
        )
    }

    pub fn emit_segment_end(&self, payload: SegmentEndPayload) -> Result<(), SpoolError> {
        self.emit(PayloadType::SegmentEnd, serde_json::to_value(payload).expect("payload serializes"))
    }

    pub fn emit_block_fence(&self, payload: BlockFencePayload) -> Result<(), SpoolError> {
        self.emit(PayloadType::BlockFence, serde_json::to_value(payload).expect("payload serializes"))
    }

    pub fn emit_channel_terminated(&self, payload: ChannelTerminatedPayload) -> Result<(), SpoolError> {
        self.emit(
            PayloadType::ChannelTerminated,
            serde_json::to_value(payload).expect("payload serializes"),
        )
    }

    fn envelope(&self, sequence: u64, payload_type: PayloadType, payload: serde_json::Value) -> EvidenceEnvelope {
        EvidenceEnvelope {
            schema_version: EVIDENCE_SCHEMA_VERSION,
            channel_id: self.channel_id.clone(),
            playout_session_id: self.session_id.clone(),
            sequence,
            event_uuid: Uuid::new_v4().to_string(),
            emitted_utc: format_utc_ms(self.clock.now_utc_ms()),
            payload_type,
            payload,
        }
    }

    fn emit(&self, payload_type: PayloadType, payload: serde_json::Value) -> Result<(), SpoolError> {
        if self.is_degraded() {
            // Capacity may have returned as acks advanced
            if self.spool.pending_bytes() < self.spool_cap_or_max() {
                self.degraded.store(false, Ordering::Release);
                info!(
                    channel = %self.channel_id,
                    session = %self.session_id,
                    "evidence spool capacity recovered, leaving degraded mode"
                );
            } else {
                // Skipped, not queued anywhere: the sequence stays gapless
                debug!(channel = %self.channel_id, ?payload_type, "degraded mode, evidence emission skipped");
                return Err(SpoolError::Full {
                    pending_bytes: self.spool.pending_bytes(),
                    max_spool_bytes: self.spool_cap_or_max(),
                });
            }
        }

        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        let envelope = self.envelope(sequence, payload_type, payload);

        match self.spool.append(&envelope) {
            Ok(()) => {
                let _ = self.outbound.send(envelope);
                Ok(())
            }
            Err(SpoolError::Full { pending_bytes, max_spool_bytes }) => {
                // The rejected sequence was never written; give it back.
                // Sound because each session has a single producer.
                self.sequence.fetch_sub(1, Ordering::AcqRel);
                self.enter_degraded();
                Err(SpoolError::Full {
                    pending_bytes,
                    max_spool_bytes,
                })
            }
            Err(e) => {
                error!(channel = %self.channel_id, error = %e, "evidence append failed");
                Err(e)
            }
        }
    }

    /// One-time degraded entry: log, then record the terminal envelope past
    /// the cap so the outage itself is durable.
    fn enter_degraded(&self) {
        if self.degraded.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(
            channel = %self.channel_id,
            session = %self.session_id,
            "spool_full: entering degraded evidence mode"
        );
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        let terminated = self.envelope(
            sequence,
            PayloadType::ChannelTerminated,
            serde_json::to_value(ChannelTerminatedPayload {
                reason: "spool_full".to_string(),
                at_utc_ms: self.clock.now_utc_ms(),
            })
            .expect("payload serializes"),
        );
        match self.spool.append_unbounded(&terminated) {
            Ok(()) => {
                let _ = self.outbound.send(terminated);
            }
            Err(e) => {
                error!(channel = %self.channel_id, error = %e, "failed to record CHANNEL_TERMINATED");
                self.sequence.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    fn spool_cap_or_max(&self) -> u64 {
        // 0 means unlimited; degraded mode is then unreachable
        match self.spool.max_spool_bytes() {
            0 => u64::MAX,
            cap => cap,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spool::SpoolConfig;
    use std::time::Duration;
    use tempfile::TempDir;

    fn spool(dir: &TempDir, cap: u64) -> Arc<EvidenceSpool> {
        Arc::new(
            EvidenceSpool::open(
                dir.path(),
                "ch-1",
                "sess-a",
                SpoolConfig {
                    max_spool_bytes: cap,
                    flush_interval: Duration::from_millis(20),
                    flush_records_max: 4,
                },
            )
            .unwrap(),
        )
    }

    fn segment_start(n: i64) -> SegmentStartPayload {
        SegmentStartPayload {
            execution_entry_id: Some(format!("entry-{n}")),
            asset_uri: "file:///m.ts".to_string(),
            start_utc_ms: n,
        }
    }

    #[test]
    fn sequences_start_at_one_and_are_gapless() {
        let dir = TempDir::new().unwrap();
        let spool = spool(&dir, 0);
        let clock = MasterClock::fixed(1_700_000_000_000);
        let (emitter, mut rx) = EvidenceEmitter::new("ch-1", "sess-a", clock, spool.clone());

        emitter.emit_block_start(BlockStartPayload {
            execution_entry_id: "e-1".into(),
            asset_uri: "file:///m.ts".into(),
            start_utc_ms: 0,
        })
        .unwrap();
        emitter.emit_segment_start(segment_start(1)).unwrap();
        emitter.emit_segment_end(SegmentEndPayload { end_utc_ms: 10 }).unwrap();

        let seqs: Vec<u64> = spool.replay_from(0).unwrap().iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        // Transport got the same envelopes, in order
        let mut wire = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            wire.push(envelope.sequence);
        }
        assert_eq!(wire, vec![1, 2, 3]);

        // Envelope shape
        let records = spool.replay_from(0).unwrap();
        assert_eq!(records[0].schema_version, 1);
        assert!(Uuid::parse_str(&records[0].event_uuid).is_ok());
        assert!(records[0].emitted_utc.ends_with('Z'));
    }

    #[test]
    fn full_spool_degrades_once_and_records_termination() {
        let dir = TempDir::new().unwrap();
        let spool = spool(&dir, 500);
        let clock = MasterClock::fixed(1_700_000_000_000);
        let (emitter, _rx) = EvidenceEmitter::new("ch-1", "sess-a", clock, spool.clone());

        // Fill past the cap
        let mut full_hit = false;
        for n in 0..10 {
            if emitter.emit_segment_start(segment_start(n)).is_err() {
                full_hit = true;
                break;
            }
        }
        assert!(full_hit);
        assert!(emitter.is_degraded());

        // The terminal record is the last durable one, past the cap
        let records = spool.replay_from(0).unwrap();
        let last = records.last().unwrap();
        assert_eq!(last.payload_type, PayloadType::ChannelTerminated);
        assert_eq!(last.payload["reason"], "spool_full");

        // Still gapless on disk
        let seqs: Vec<u64> = records.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, (1..=seqs.len() as u64).collect::<Vec<_>>());

        // Degraded emissions are skipped without consuming sequence numbers
        let before = emitter.last_sequence();
        let _ = emitter.emit_segment_start(segment_start(99));
        assert_eq!(emitter.last_sequence(), before);
    }

    #[test]
    fn degraded_mode_exits_when_acks_free_capacity() {
        let dir = TempDir::new().unwrap();
        let spool = spool(&dir, 500);
        let clock = MasterClock::fixed(1_700_000_000_000);
        let (emitter, _rx) = EvidenceEmitter::new("ch-1", "sess-a", clock, spool.clone());

        for n in 0..10 {
            if emitter.emit_segment_start(segment_start(n)).is_err() {
                break;
            }
        }
        assert!(emitter.is_degraded());
        let last = emitter.last_sequence();

        // Reconciliation acks everything durable; capacity returns
        spool.update_ack(last, 1_700_000_001_000).unwrap();
        emitter.emit_segment_start(segment_start(100)).unwrap();
        assert!(!emitter.is_degraded());
        assert_eq!(emitter.last_sequence(), last + 1);
    }

    #[test]
    fn emitter_resumes_sequence_from_an_existing_spool() {
        let dir = TempDir::new().unwrap();
        {
            let spool = spool(&dir, 0);
            let clock = MasterClock::fixed(1_700_000_000_000);
            let (emitter, _rx) = EvidenceEmitter::new("ch-1", "sess-a", clock, spool.clone());
            for n in 0..5 {
                emitter.emit_segment_start(segment_start(n)).unwrap();
            }
        }
        let spool = spool(&dir, 0);
        let clock = MasterClock::fixed(1_700_000_100_000);
        let (emitter, _rx) = EvidenceEmitter::new("ch-1", "sess-a", clock, spool.clone());
        emitter.emit_segment_end(SegmentEndPayload { end_utc_ms: 1 }).unwrap();
        assert_eq!(spool.replay_from(0).unwrap().last().unwrap().sequence, 6);
    }
}

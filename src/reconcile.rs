use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{
    AsRunRow, BlockFencePayload, ChannelRuntime, ChannelTerminatedPayload, EvidenceEnvelope,
    PayloadType, SegmentEndPayload, SegmentStartPayload,
};
use crate::transport::{WireMessage, send_message};

/// Segment the projection is currently inside, persisted with the session so
/// reconnects resume where the stream left off.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenSegment {
    execution_entry_id: Option<String>,
    asset_uri: String,
    start_utc_ms: i64,
}

/// Lookup from channel id to its runtime identity, for broadcast-day
/// attribution of AsRun rows.
pub type ChannelMap = Arc<HashMap<String, ChannelRuntime>>;

/// Reconciliation endpoint: ingests evidence streams, acknowledges
/// monotonically (never regressing), deduplicates by (session, sequence),
/// and projects AsRun records. The projection reads committed plan state
/// only — it never mutates, splits, or regenerates an execution entry.
pub async fn run_receiver(pool: SqlitePool, channels: ChannelMap, listener: TcpListener, cancel: CancellationToken) {
    let addr = listener.local_addr().map(|a| a.to_string()).unwrap_or_default();
    info!(addr = %addr, "reconciliation receiver listening");

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => {
                info!("reconciliation receiver shutting down");
                return;
            }
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "evidence stream connected");
                let pool = pool.clone();
                let channels = channels.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_stream(pool, channels, stream, cancel).await {
                        warn!(peer = %peer, error = %e, "evidence stream ended with error");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
            }
        }
    }
}

async fn handle_stream(
    pool: SqlitePool,
    channels: ChannelMap,
    stream: TcpStream,
    cancel: CancellationToken,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half).lines();

    // HELLO first
    let Some(line) = reader.next_line().await? else {
        return Ok(());
    };
    let hello: WireMessage = serde_json::from_str(&line).context("parsing hello")?;
    let WireMessage::Hello {
        channel_id,
        playout_session_id: session_id,
        first_sequence_available,
        last_sequence_emitted,
    } = hello
    else {
        anyhow::bail!("expected hello, got something else");
    };

    let mut acked = get_or_create_session(&pool, &session_id, &channel_id).await?;
    info!(
        channel = %channel_id,
        session = %session_id,
        acked,
        first_sequence_available,
        last_sequence_emitted,
        "evidence session resumed"
    );
    send_message(&mut write_half, &WireMessage::Ack { acked_sequence: acked }).await?;

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = reader.next_line() => line?,
        };
        let Some(line) = line else {
            debug!(session = %session_id, "evidence stream closed");
            return Ok(());
        };
        let message: WireMessage = match serde_json::from_str(&line) {
            Ok(m) => m,
            Err(e) => {
                warn!(session = %session_id, error = %e, "unparseable evidence line, dropping");
                continue;
            }
        };
        let WireMessage::Evidence { envelope } = message else {
            continue;
        };
        if envelope.playout_session_id != session_id {
            warn!(session = %session_id, got = %envelope.playout_session_id, "envelope for a different session, dropping");
            continue;
        }

        if envelope.sequence <= acked {
            // Duplicate delivery (at-least-once): re-ack, don't re-project
            send_message(&mut write_half, &WireMessage::Ack { acked_sequence: acked }).await?;
            continue;
        }
        if envelope.sequence > acked + 1 {
            // The sender replays from our ack, so a gap here is a protocol
            // fault on its side; never ack past it
            warn!(
                session = %session_id,
                expected = acked + 1,
                got = envelope.sequence,
                "sequence gap on evidence stream, withholding ack"
            );
            continue;
        }

        // Exactly the next record: dedup-store, project, then ack
        let fresh = store_event(&pool, &envelope).await?;
        if fresh {
            project(&pool, &channels, &channel_id, &session_id, &envelope).await?;
        }
        acked = envelope.sequence;
        set_session_ack(&pool, &session_id, acked).await?;
        send_message(&mut write_half, &WireMessage::Ack { acked_sequence: acked }).await?;
    }
}

// ── Projection ─────────────────────────────────────────────────────────

async fn project(
    pool: &SqlitePool,
    channels: &ChannelMap,
    channel_id: &str,
    session_id: &str,
    envelope: &EvidenceEnvelope,
) -> Result<()> {
    match envelope.payload_type {
        PayloadType::BlockStart => {
            debug!(session = %session_id, "block start");
        }
        PayloadType::SegmentStart => {
            let payload: SegmentStartPayload =
                serde_json::from_value(envelope.payload.clone()).context("segment start payload")?;
            // An unclosed previous segment was cut short by this one
            if let Some(open) = load_open_segment(pool, session_id).await? {
                close_segment(pool, channels, channel_id, session_id, &open, payload.start_utc_ms, true).await?;
            }
            save_open_segment(
                pool,
                session_id,
                Some(&OpenSegment {
                    execution_entry_id: payload.execution_entry_id.clone(),
                    asset_uri: payload.asset_uri.clone(),
                    start_utc_ms: payload.start_utc_ms,
                }),
            )
            .await?;
        }
        PayloadType::SegmentEnd => {
            let payload: SegmentEndPayload =
                serde_json::from_value(envelope.payload.clone()).context("segment end payload")?;
            match load_open_segment(pool, session_id).await? {
                Some(open) => {
                    close_segment(pool, channels, channel_id, session_id, &open, payload.end_utc_ms, false).await?;
                    save_open_segment(pool, session_id, None).await?;
                }
                None => {
                    warn!(session = %session_id, "segment end without an open segment, ignoring");
                }
            }
        }
        PayloadType::BlockFence => {
            let payload: BlockFencePayload =
                serde_json::from_value(envelope.payload.clone()).context("block fence payload")?;
            mark_fenced(pool, session_id, &payload.execution_entry_id).await?;
        }
        PayloadType::ChannelTerminated => {
            let payload: ChannelTerminatedPayload =
                serde_json::from_value(envelope.payload.clone()).context("channel terminated payload")?;
            if let Some(open) = load_open_segment(pool, session_id).await? {
                close_segment(pool, channels, channel_id, session_id, &open, payload.at_utc_ms, true).await?;
                save_open_segment(pool, session_id, None).await?;
            }
            info!(session = %session_id, reason = %payload.reason, "channel terminated");
        }
    }
    Ok(())
}

/// Write one AsRun row for a closed segment. Injected segments with no
/// planning origin are classified RUNTIME_RECOVERY; truncation means the
/// segment ended early (superseded or terminated).
async fn close_segment(
    pool: &SqlitePool,
    channels: &ChannelMap,
    channel_id: &str,
    session_id: &str,
    open: &OpenSegment,
    end_utc_ms: i64,
    truncated: bool,
) -> Result<()> {
    let origin = if open.execution_entry_id.is_some() {
        "planned"
    } else {
        "runtime_recovery"
    };
    // Attributed to the broadcast day the segment started in; a segment
    // crossing the boundary stays one record
    let broadcast_date = channels
        .get(channel_id)
        .and_then(|ch| ch.broadcast_date_of(open.start_utc_ms))
        .map(|d| d.to_string())
        .unwrap_or_else(|| crate::models::utc_ms_to_datetime(open.start_utc_ms).date_naive().to_string());

    sqlx::query(
        "INSERT INTO asrun (id, channel_id, session_id, execution_entry_id, broadcast_date,
         start_utc_ms, end_utc_ms, asset_uri, origin, truncated)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(channel_id)
    .bind(session_id)
    .bind(&open.execution_entry_id)
    .bind(&broadcast_date)
    .bind(open.start_utc_ms)
    .bind(end_utc_ms)
    .bind(&open.asset_uri)
    .bind(origin)
    .bind(truncated)
    .execute(pool)
    .await
    .context("inserting asrun row")?;

    debug!(
        session = %session_id,
        entry = ?open.execution_entry_id,
        origin,
        truncated,
        "asrun recorded"
    );
    Ok(())
}

// ── Session + event store ──────────────────────────────────────────────

async fn get_or_create_session(pool: &SqlitePool, session_id: &str, channel_id: &str) -> Result<u64> {
    sqlx::query(
        "INSERT INTO evidence_sessions (session_id, channel_id) VALUES (?, ?)
         ON CONFLICT(session_id) DO NOTHING",
    )
    .bind(session_id)
    .bind(channel_id)
    .execute(pool)
    .await
    .context("creating evidence session")?;

    let row: (i64,) = sqlx::query_as("SELECT last_acked_sequence FROM evidence_sessions WHERE session_id = ?")
        .bind(session_id)
        .fetch_one(pool)
        .await
        .context("reading session ack")?;
    Ok(row.0.max(0) as u64)
}

/// Persist the ack cursor; monotonic by construction (the caller only moves
/// forward, and the guard here keeps a racing writer from regressing it).
async fn set_session_ack(pool: &SqlitePool, session_id: &str, acked: u64) -> Result<()> {
    sqlx::query(
        "UPDATE evidence_sessions
         SET last_acked_sequence = MAX(last_acked_sequence, ?),
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
         WHERE session_id = ?",
    )
    .bind(acked as i64)
    .bind(session_id)
    .execute(pool)
    .await
    .context("persisting session ack")?;
    Ok(())
}

/// Store the raw event keyed (session, sequence). Returns false for a
/// duplicate.
async fn store_event(pool: &SqlitePool, envelope: &EvidenceEnvelope) -> Result<bool> {
    let body = serde_json::to_string(envelope).context("serializing envelope")?;
    let payload_type = serde_json::to_value(envelope.payload_type)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    let result = sqlx::query(
        "INSERT OR IGNORE INTO evidence_events (session_id, sequence, payload_type, body)
         VALUES (?, ?, ?, ?)",
    )
    .bind(&envelope.playout_session_id)
    .bind(envelope.sequence as i64)
    .bind(payload_type)
    .bind(body)
    .execute(pool)
    .await
    .context("storing evidence event")?;
    Ok(result.rows_affected() > 0)
}

async fn load_open_segment(pool: &SqlitePool, session_id: &str) -> Result<Option<OpenSegment>> {
    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT open_segment FROM evidence_sessions WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(pool)
            .await
            .context("loading open segment")?;
    Ok(row
        .and_then(|(json,)| json)
        .and_then(|json| serde_json::from_str(&json).ok()))
}

async fn save_open_segment(pool: &SqlitePool, session_id: &str, segment: Option<&OpenSegment>) -> Result<()> {
    let json = segment
        .map(serde_json::to_string)
        .transpose()
        .context("serializing open segment")?;
    sqlx::query("UPDATE evidence_sessions SET open_segment = ? WHERE session_id = ?")
        .bind(json)
        .bind(session_id)
        .execute(pool)
        .await
        .context("saving open segment")?;
    Ok(())
}

async fn mark_fenced(pool: &SqlitePool, session_id: &str, execution_entry_id: &str) -> Result<()> {
    sqlx::query("UPDATE asrun SET fenced = 1 WHERE session_id = ? AND execution_entry_id = ?")
        .bind(session_id)
        .bind(execution_entry_id)
        .execute(pool)
        .await
        .context("marking asrun fenced")?;
    Ok(())
}

/// AsRun rows for one broadcast day, in airing order.
pub async fn asrun_for_day(pool: &SqlitePool, channel_id: &str, broadcast_date: &str) -> Result<Vec<AsRunRow>> {
    let rows = sqlx::query_as::<_, AsRunRow>(
        "SELECT id, channel_id, session_id, execution_entry_id, broadcast_date,
         start_utc_ms, end_utc_ms, asset_uri, origin, truncated, fenced
         FROM asrun WHERE channel_id = ? AND broadcast_date = ?
         ORDER BY start_utc_ms ASC",
    )
    .bind(channel_id)
    .bind(broadcast_date)
    .fetch_all(pool)
    .await
    .context("querying asrun rows")?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_pool;
    use crate::models::EVIDENCE_SCHEMA_VERSION;
    use chrono::{NaiveDate, NaiveTime};
    use tokio::io::AsyncWriteExt;

    fn test_channel_map() -> ChannelMap {
        let channel = ChannelRuntime {
            id: "ch-1".into(),
            slug: "one".into(),
            name: "One".into(),
            timezone: "UTC".parse().unwrap(),
            grid_minutes: 30,
            day_start: NaiveTime::parse_from_str("06:00", "%H:%M").unwrap(),
        };
        Arc::new(HashMap::from([(channel.id.clone(), channel)]))
    }

    struct TestClient {
        write: tokio::net::tcp::OwnedWriteHalf,
        reader: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    }

    impl TestClient {
        async fn connect(addr: &str, session: &str, last_emitted: u64) -> (Self, u64) {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read_half, write_half) = stream.into_split();
            let mut client = Self {
                write: write_half,
                reader: BufReader::new(read_half).lines(),
            };
            client
                .send(&WireMessage::Hello {
                    channel_id: "ch-1".into(),
                    playout_session_id: session.into(),
                    first_sequence_available: 1,
                    last_sequence_emitted: last_emitted,
                })
                .await;
            let ack = client.read_ack().await;
            (client, ack)
        }

        async fn send(&mut self, message: &WireMessage) {
            let mut line = serde_json::to_string(message).unwrap();
            line.push('\n');
            self.write.write_all(line.as_bytes()).await.unwrap();
        }

        async fn read_ack(&mut self) -> u64 {
            loop {
                let line = self.reader.next_line().await.unwrap().unwrap();
                if let Ok(WireMessage::Ack { acked_sequence }) = serde_json::from_str(&line) {
                    return acked_sequence;
                }
            }
        }

        async fn send_evidence(&mut self, session: &str, sequence: u64, payload_type: PayloadType, payload: serde_json::Value) -> u64 {
            self.send(&WireMessage::Evidence {
                envelope: EvidenceEnvelope {
                    schema_version: EVIDENCE_SCHEMA_VERSION,
                    channel_id: "ch-1".into(),
                    playout_session_id: session.into(),
                    sequence,
                    event_uuid: Uuid::new_v4().to_string(),
                    emitted_utc: "2026-08-03T06:00:00.000Z".into(),
                    payload_type,
                    payload,
                },
            })
            .await;
            self.read_ack().await
        }
    }

    async fn spawn_receiver(pool: SqlitePool) -> (String, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let cancel = CancellationToken::new();
        tokio::spawn(run_receiver(pool, test_channel_map(), listener, cancel.clone()));
        (addr, cancel)
    }

    /// 06:00 UTC on 2026-08-03.
    fn day_start_ms() -> i64 {
        crate::models::local_anchor_utc_ms(
            "UTC".parse().unwrap(),
            NaiveDate::from_ymd_opt(2026, 8, 3).unwrap(),
            NaiveTime::parse_from_str("06:00", "%H:%M").unwrap(),
        )
        .unwrap()
    }

    fn seg_start(entry: Option<&str>, start: i64) -> serde_json::Value {
        serde_json::json!({
            "execution_entry_id": entry,
            "asset_uri": "file:///m.ts",
            "start_utc_ms": start,
        })
    }

    #[tokio::test]
    async fn closes_segment_pairs_into_asrun_rows() {
        let (pool, _dir) = test_pool().await;
        let (addr, cancel) = spawn_receiver(pool.clone()).await;
        let (mut client, ack) = TestClient::connect(&addr, "sess-a", 0).await;
        assert_eq!(ack, 0);

        let t0 = day_start_ms();
        let ack = client
            .send_evidence("sess-a", 1, PayloadType::SegmentStart, seg_start(Some("entry-1"), t0))
            .await;
        assert_eq!(ack, 1);
        let ack = client
            .send_evidence(
                "sess-a",
                2,
                PayloadType::SegmentEnd,
                serde_json::json!({ "end_utc_ms": t0 + 1_800_000 }),
            )
            .await;
        assert_eq!(ack, 2);
        let ack = client
            .send_evidence(
                "sess-a",
                3,
                PayloadType::BlockFence,
                serde_json::json!({ "execution_entry_id": "entry-1", "fence_utc_ms": t0 + 1_800_000 }),
            )
            .await;
        assert_eq!(ack, 3);

        let rows = asrun_for_day(&pool, "ch-1", "2026-08-03").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].execution_entry_id.as_deref(), Some("entry-1"));
        assert_eq!(rows[0].origin, "planned");
        assert!(!rows[0].truncated);
        assert!(rows[0].fenced);
        assert_eq!(rows[0].end_utc_ms - rows[0].start_utc_ms, 1_800_000);

        cancel.cancel();
    }

    #[tokio::test]
    async fn duplicates_are_deduplicated_and_reacked() {
        let (pool, _dir) = test_pool().await;
        let (addr, cancel) = spawn_receiver(pool.clone()).await;
        let (mut client, _) = TestClient::connect(&addr, "sess-a", 0).await;

        let t0 = day_start_ms();
        client
            .send_evidence("sess-a", 1, PayloadType::SegmentStart, seg_start(Some("entry-1"), t0))
            .await;
        client
            .send_evidence(
                "sess-a",
                2,
                PayloadType::SegmentEnd,
                serde_json::json!({ "end_utc_ms": t0 + 1000 }),
            )
            .await;

        // Redeliver both (at-least-once); the ack never regresses and no
        // second asrun row appears
        let ack = client
            .send_evidence("sess-a", 1, PayloadType::SegmentStart, seg_start(Some("entry-1"), t0))
            .await;
        assert_eq!(ack, 2);
        let ack = client
            .send_evidence(
                "sess-a",
                2,
                PayloadType::SegmentEnd,
                serde_json::json!({ "end_utc_ms": t0 + 1000 }),
            )
            .await;
        assert_eq!(ack, 2);

        let rows = asrun_for_day(&pool, "ch-1", "2026-08-03").await.unwrap();
        assert_eq!(rows.len(), 1);

        cancel.cancel();
    }

    #[tokio::test]
    async fn unplanned_segments_classify_as_runtime_recovery() {
        let (pool, _dir) = test_pool().await;
        let (addr, cancel) = spawn_receiver(pool.clone()).await;
        let (mut client, _) = TestClient::connect(&addr, "sess-a", 0).await;

        let t0 = day_start_ms();
        client
            .send_evidence("sess-a", 1, PayloadType::SegmentStart, seg_start(None, t0))
            .await;
        client
            .send_evidence(
                "sess-a",
                2,
                PayloadType::SegmentEnd,
                serde_json::json!({ "end_utc_ms": t0 + 5000 }),
            )
            .await;

        let rows = asrun_for_day(&pool, "ch-1", "2026-08-03").await.unwrap();
        assert_eq!(rows[0].origin, "runtime_recovery");
        assert!(rows[0].execution_entry_id.is_none());

        cancel.cancel();
    }

    #[tokio::test]
    async fn interrupted_segment_is_truncated_at_the_next_start() {
        let (pool, _dir) = test_pool().await;
        let (addr, cancel) = spawn_receiver(pool.clone()).await;
        let (mut client, _) = TestClient::connect(&addr, "sess-a", 0).await;

        let t0 = day_start_ms();
        client
            .send_evidence("sess-a", 1, PayloadType::SegmentStart, seg_start(Some("entry-1"), t0))
            .await;
        // Engine cut to a new segment without ending the first
        client
            .send_evidence("sess-a", 2, PayloadType::SegmentStart, seg_start(Some("entry-2"), t0 + 600_000))
            .await;
        client
            .send_evidence(
                "sess-a",
                3,
                PayloadType::ChannelTerminated,
                serde_json::json!({ "reason": "engine_stop", "at_utc_ms": t0 + 900_000 }),
            )
            .await;

        let rows = asrun_for_day(&pool, "ch-1", "2026-08-03").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].truncated);
        assert_eq!(rows[0].end_utc_ms, t0 + 600_000);
        assert!(rows[1].truncated);
        assert_eq!(rows[1].end_utc_ms, t0 + 900_000);

        cancel.cancel();
    }

    #[tokio::test]
    async fn sequence_gaps_withhold_the_ack() {
        let (pool, _dir) = test_pool().await;
        let (addr, cancel) = spawn_receiver(pool.clone()).await;
        let (mut client, _) = TestClient::connect(&addr, "sess-a", 0).await;

        let t0 = day_start_ms();
        let ack = client
            .send_evidence("sess-a", 1, PayloadType::SegmentStart, seg_start(Some("entry-1"), t0))
            .await;
        assert_eq!(ack, 1);

        // Jump to 5: no ack for it; the next in-order record still acks 2
        client
            .send(&WireMessage::Evidence {
                envelope: EvidenceEnvelope {
                    schema_version: EVIDENCE_SCHEMA_VERSION,
                    channel_id: "ch-1".into(),
                    playout_session_id: "sess-a".into(),
                    sequence: 5,
                    event_uuid: Uuid::new_v4().to_string(),
                    emitted_utc: "2026-08-03T06:00:00.000Z".into(),
                    payload_type: PayloadType::SegmentEnd,
                    payload: serde_json::json!({ "end_utc_ms": t0 + 1000 }),
                },
            })
            .await;
        let ack = client
            .send_evidence(
                "sess-a",
                2,
                PayloadType::SegmentEnd,
                serde_json::json!({ "end_utc_ms": t0 + 1000 }),
            )
            .await;
        assert_eq!(ack, 2);

        cancel.cancel();
    }

    #[tokio::test]
    async fn ack_survives_reconnect() {
        let (pool, _dir) = test_pool().await;
        let (addr, cancel) = spawn_receiver(pool.clone()).await;

        let t0 = day_start_ms();
        {
            let (mut client, ack) = TestClient::connect(&addr, "sess-a", 0).await;
            assert_eq!(ack, 0);
            client
                .send_evidence("sess-a", 1, PayloadType::SegmentStart, seg_start(Some("entry-1"), t0))
                .await;
        }
        // New connection for the same session resumes from the persisted ack
        let (_client, ack) = TestClient::connect(&addr, "sess-a", 1).await;
        assert_eq!(ack, 1);

        cancel.cancel();
    }
}

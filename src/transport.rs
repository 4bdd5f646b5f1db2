use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::MasterClock;
use crate::models::EvidenceEnvelope;
use crate::spool::EvidenceSpool;

const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Evidence stream wire messages, one JSON object per line in both
/// directions.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    Hello {
        channel_id: String,
        playout_session_id: String,
        first_sequence_available: u64,
        last_sequence_emitted: u64,
    },
    Ack {
        acked_sequence: u64,
    },
    Evidence {
        envelope: EvidenceEnvelope,
    },
}

pub async fn send_message(write: &mut OwnedWriteHalf, message: &WireMessage) -> std::io::Result<()> {
    let mut line = serde_json::to_string(message).expect("wire message serializes");
    line.push('\n');
    write.write_all(line.as_bytes()).await
}

/// Resumable streaming client: connect, HELLO, take the server's ack, replay
/// everything past it from the spool, then stream live records. Every ACK
/// received advances the spool's persisted cursor. Disconnects reconnect
/// with bounded backoff and resume from the latest persisted ack.
///
/// Delivery is at-least-once by design: replay and the live queue may
/// overlap after a reconnect, and the receiver deduplicates by
/// (session, sequence).
pub async fn run_transport(
    spool: Arc<EvidenceSpool>,
    clock: MasterClock,
    mut live: mpsc::UnboundedReceiver<EvidenceEnvelope>,
    addr: String,
    channel_id: String,
    session_id: String,
    cancel: CancellationToken,
) {
    info!(channel = %channel_id, session = %session_id, addr = %addr, "evidence transport started");
    let mut backoff = BACKOFF_INITIAL;

    loop {
        if cancel.is_cancelled() {
            return;
        }
        let stream = tokio::select! {
            _ = cancel.cancelled() => return,
            result = TcpStream::connect(&addr) => result,
        };
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                debug!(addr = %addr, error = %e, backoff_ms = backoff.as_millis() as u64, "reconciliation service unreachable");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(BACKOFF_MAX);
                continue;
            }
        };
        backoff = BACKOFF_INITIAL;

        match run_stream(&spool, &clock, &mut live, stream, &channel_id, &session_id, &cancel).await {
            Ok(()) => {
                info!(channel = %channel_id, "evidence transport finished");
                return;
            }
            Err(e) => {
                warn!(channel = %channel_id, error = %e, "evidence stream dropped, reconnecting");
            }
        }
    }
}

async fn run_stream(
    spool: &EvidenceSpool,
    clock: &MasterClock,
    live: &mut mpsc::UnboundedReceiver<EvidenceEnvelope>,
    stream: TcpStream,
    channel_id: &str,
    session_id: &str,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half).lines();

    send_message(
        &mut write_half,
        &WireMessage::Hello {
            channel_id: channel_id.to_string(),
            playout_session_id: session_id.to_string(),
            first_sequence_available: 1,
            last_sequence_emitted: spool.last_sequence(),
        },
    )
    .await?;

    // Initial ACK tells us where the server stands
    let acked = loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = reader.next_line() => line?,
        };
        let Some(line) = line else {
            anyhow::bail!("stream closed before initial ack");
        };
        match serde_json::from_str::<WireMessage>(&line)? {
            WireMessage::Ack { acked_sequence } => break acked_sequence,
            other => debug!(?other, "unexpected message before initial ack"),
        }
    };
    spool.update_ack(acked, clock.now_utc_ms())?;

    // Replay everything the server has not acknowledged
    let replay = spool.replay_from(acked)?;
    let replay_high = replay.last().map(|e| e.sequence).unwrap_or(acked);
    let replay_len = replay.len();
    for envelope in replay {
        send_message(&mut write_half, &WireMessage::Evidence { envelope }).await?;
    }
    if replay_len > 0 {
        info!(channel = %channel_id, from = acked + 1, to = replay_high, "replayed spooled evidence");
    }

    // Live streaming + ack consumption
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            envelope = live.recv() => {
                match envelope {
                    Some(envelope) => {
                        // Queued during a disconnect and already replayed
                        if envelope.sequence <= replay_high {
                            continue;
                        }
                        send_message(&mut write_half, &WireMessage::Evidence { envelope }).await?;
                    }
                    None => {
                        // Emitter is gone; flush acks until the server hangs up
                        debug!(channel = %channel_id, "live evidence channel closed");
                        return Ok(());
                    }
                }
            }
            line = reader.next_line() => {
                let Some(line) = line? else {
                    anyhow::bail!("server closed the stream");
                };
                match serde_json::from_str::<WireMessage>(&line)? {
                    WireMessage::Ack { acked_sequence } => {
                        spool.update_ack(acked_sequence, clock.now_utc_ms())?;
                    }
                    other => debug!(?other, "unexpected message on evidence stream"),
                }
            }
        }
    }
}

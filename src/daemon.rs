use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::channel::{ChannelEvent, ChannelManager, ChannelTiming};
use crate::clock::MasterClock;
use crate::config::{Config, duration_ms, parse_hhmm};
use crate::director::{ChannelHandle, ProgramDirector};
use crate::emitter::EvidenceEmitter;
use crate::engine::TcpEngineClient;
use crate::horizon::{HorizonManager, HorizonSettings, horizon_loop};
use crate::models::{
    BlockFencePayload, BlockStartPayload, ChannelRuntime, ChannelTerminatedPayload, PayloadType,
    SegmentEndPayload, SegmentStartPayload,
};
use crate::spool::{EvidenceSpool, SpoolConfig};
use crate::window::ExecutionWindowStore;
use crate::{db, plan_store, reconcile, server, transport};

/// Resolve a config channel into its runtime identity, applying per-channel
/// overrides over the scheduling defaults.
pub fn build_channel_runtime(
    config: &Config,
    channel: &crate::config::ChannelConfig,
    id: String,
) -> Result<ChannelRuntime> {
    let timezone = channel
        .timezone
        .as_deref()
        .unwrap_or(&config.core.timezone)
        .parse()
        .map_err(|_| anyhow::anyhow!("channel '{}': invalid timezone", channel.slug))?;
    let day_start = parse_hhmm(
        channel
            .programming_day_start
            .as_deref()
            .unwrap_or(&config.scheduling.programming_day_start),
    )
    .map_err(|e| anyhow::anyhow!("channel '{}': {e}", channel.slug))?;
    Ok(ChannelRuntime {
        id,
        slug: channel.slug.clone(),
        name: channel.name.clone(),
        timezone,
        grid_minutes: channel.grid_minutes.unwrap_or(config.scheduling.grid_minutes),
        day_start,
    })
}

pub async fn run(config: Config) -> Result<()> {
    let pool = db::create_pool(&config).await.context("creating database")?;
    info!(db_path = %config.db_path().display(), "database ready");

    plan_store::sync_config_to_db(&pool, &config)
        .await
        .context("syncing config to database")?;
    info!("config synced to database");

    let clock = MasterClock::system();
    let window = Arc::new(ExecutionWindowStore::new());
    let director = Arc::new(ProgramDirector::new(clock.clone()));
    let cancel = CancellationToken::new();
    let timing = ChannelTiming::from_config(&config.runtime)?;

    let horizon_settings = HorizonSettings {
        min_execution_horizon_ms: duration_ms(&config.scheduling.min_execution_horizon)
            .map_err(|e| anyhow::anyhow!(e))?,
        proactive_extend_threshold_ms: duration_ms(&config.scheduling.proactive_extend_threshold)
            .map_err(|e| anyhow::anyhow!(e))?,
        epg_horizon_days: config.scheduling.epg_horizon_days,
    };
    let tick_ms = duration_ms(&config.scheduling.horizon_tick).map_err(|e| anyhow::anyhow!(e))? as u64;

    let mut tasks = Vec::new();
    let mut channel_map = HashMap::new();

    for channel_cfg in config.channel.iter().filter(|c| c.enabled) {
        let id = plan_store::channel_id_by_slug(&pool, &channel_cfg.slug)
            .await?
            .ok_or_else(|| anyhow::anyhow!("channel '{}' missing after sync", channel_cfg.slug))?;
        let runtime = build_channel_runtime(&config, channel_cfg, id)?;
        channel_map.insert(runtime.id.clone(), runtime.clone());

        // Horizon ticker
        let manager = HorizonManager::new(
            runtime.clone(),
            pool.clone(),
            window.clone(),
            clock.clone(),
            horizon_settings.clone(),
        );
        let (health_tx, health_rx) = watch::channel(None);
        tasks.push(tokio::spawn(horizon_loop(manager, tick_ms, health_tx, cancel.clone())));

        // Boundary control loop
        let engine = Arc::new(TcpEngineClient::new(
            config.core.engine_addr.clone(),
            timing.rpc_timeout_ms,
        ));
        let (channel_manager, status_rx) = ChannelManager::new(
            runtime.clone(),
            engine,
            window.clone(),
            clock.clone(),
            timing.clone(),
            config.core.emergency_source.clone(),
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        director.register(ChannelHandle {
            runtime: runtime.clone(),
            events: events_tx.clone(),
            status: status_rx,
            health: health_rx,
        });
        tasks.push(tokio::spawn(channel_manager.run(events_rx, cancel.clone())));

        // Always-on network: bring the session up immediately
        let _ = events_tx.send(ChannelEvent::StartRequested {
            plan_handle: format!("plan-{}", runtime.slug),
            port: channel_cfg.port,
        });
    }
    let channel_map = Arc::new(channel_map);

    // Reconciliation service endpoint
    let reconcile_listener = TcpListener::bind(&config.core.reconcile_listen)
        .await
        .with_context(|| format!("binding reconciliation listener to {}", config.core.reconcile_listen))?;
    info!(listen = %config.core.reconcile_listen, "reconciliation receiver listening");
    tasks.push(tokio::spawn(reconcile::run_receiver(
        pool.clone(),
        channel_map.clone(),
        reconcile_listener,
        cancel.clone(),
    )));

    // Engine-facing evidence ingest, spooled and relayed to reconciliation
    let ingest_listener = TcpListener::bind(&config.core.evidence_listen)
        .await
        .with_context(|| format!("binding evidence ingest to {}", config.core.evidence_listen))?;
    info!(listen = %config.core.evidence_listen, "evidence ingest listening");
    let spool_root = config.spool_root();
    let spool_config = config.evidence.spool_config().map_err(|e| anyhow::anyhow!(e))?;
    tasks.push(tokio::spawn(evidence_ingest_loop(
        ingest_listener,
        spool_root,
        spool_config,
        config.core.reconcile_listen.clone(),
        clock.clone(),
        cancel.clone(),
    )));

    // Status server
    let router = server::build_router(server::AppState {
        director: director.clone(),
    });
    let listener = TcpListener::bind(&config.core.listen)
        .await
        .with_context(|| format!("binding to {}", config.core.listen))?;
    info!(listen = %config.core.listen, "status server listening");
    let server_cancel = cancel.clone();
    tasks.push(tokio::spawn(async move {
        let _ = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                server_cancel.cancelled().await;
            })
            .await;
    }));

    // Wait for shutdown signal
    wait_for_shutdown().await;
    info!("shutdown signal received");

    cancel.cancel();

    let shutdown_timeout = std::time::Duration::from_secs(10);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        for task in tasks {
            let _ = task.await;
        }
    })
    .await;

    pool.close().await;
    info!("shutdown complete");

    Ok(())
}

/// First line an engine sends on the ingest socket.
#[derive(Debug, Deserialize)]
struct IngestHello {
    channel_id: String,
    playout_session_id: String,
}

/// Every subsequent line: a raw playout event, pre-envelope.
#[derive(Debug, Deserialize)]
struct IngestEvent {
    payload_type: PayloadType,
    payload: serde_json::Value,
}

/// Accepts engine evidence connections. Each session gets its own spool,
/// emitter, and reconciliation transport; emission stays fire-and-forget
/// from the engine's point of view.
async fn evidence_ingest_loop(
    listener: TcpListener,
    spool_root: PathBuf,
    spool_config: SpoolConfig,
    reconcile_addr: String,
    clock: MasterClock,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => {
                info!("evidence ingest shutting down");
                return;
            }
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "ingest accept failed");
                continue;
            }
        };
        let spool_root = spool_root.clone();
        let spool_config = spool_config.clone();
        let reconcile_addr = reconcile_addr.clone();
        let clock = clock.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) =
                handle_ingest(stream, spool_root, spool_config, reconcile_addr, clock, cancel).await
            {
                warn!(peer = %peer, error = %e, "evidence ingest connection ended with error");
            }
        });
    }
}

async fn handle_ingest(
    stream: TcpStream,
    spool_root: PathBuf,
    spool_config: SpoolConfig,
    reconcile_addr: String,
    clock: MasterClock,
    cancel: CancellationToken,
) -> Result<()> {
    let mut reader = BufReader::new(stream).lines();

    let Some(line) = reader.next_line().await? else {
        return Ok(());
    };
    let hello: IngestHello = serde_json::from_str(&line).context("parsing ingest hello")?;
    info!(
        channel = %hello.channel_id,
        session = %hello.playout_session_id,
        "engine evidence session connected"
    );

    let spool = Arc::new(
        EvidenceSpool::open(&spool_root, &hello.channel_id, &hello.playout_session_id, spool_config)
            .map_err(anyhow::Error::from)?,
    );
    let (emitter, outbound) = EvidenceEmitter::new(
        &hello.channel_id,
        &hello.playout_session_id,
        clock.clone(),
        spool.clone(),
    );
    tokio::spawn(transport::run_transport(
        spool.clone(),
        clock,
        outbound,
        reconcile_addr,
        hello.channel_id.clone(),
        hello.playout_session_id.clone(),
        cancel.clone(),
    ));

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = reader.next_line() => line?,
        };
        let Some(line) = line else {
            info!(session = %hello.playout_session_id, "engine evidence session disconnected");
            return Ok(());
        };
        let event: IngestEvent = match serde_json::from_str(&line) {
            Ok(e) => e,
            Err(e) => {
                warn!(session = %hello.playout_session_id, error = %e, "unparseable ingest event, dropping");
                continue;
            }
        };
        let result = match event.payload_type {
            PayloadType::BlockStart => serde_json::from_value::<BlockStartPayload>(event.payload)
                .map_err(anyhow::Error::from)
                .and_then(|p| emitter.emit_block_start(p).map_err(anyhow::Error::from)),
            PayloadType::SegmentStart => serde_json::from_value::<SegmentStartPayload>(event.payload)
                .map_err(anyhow::Error::from)
                .and_then(|p| emitter.emit_segment_start(p).map_err(anyhow::Error::from)),
            PayloadType::SegmentEnd => serde_json::from_value::<SegmentEndPayload>(event.payload)
                .map_err(anyhow::Error::from)
                .and_then(|p| emitter.emit_segment_end(p).map_err(anyhow::Error::from)),
            PayloadType::BlockFence => serde_json::from_value::<BlockFencePayload>(event.payload)
                .map_err(anyhow::Error::from)
                .and_then(|p| emitter.emit_block_fence(p).map_err(anyhow::Error::from)),
            PayloadType::ChannelTerminated => serde_json::from_value::<ChannelTerminatedPayload>(event.payload)
                .map_err(anyhow::Error::from)
                .and_then(|p| emitter.emit_channel_terminated(p).map_err(anyhow::Error::from)),
        };
        if let Err(e) = result {
            // Degraded-mode skips land here too; emission never blocks the
            // engine, so log and carry on
            warn!(session = %hello.playout_session_id, error = %e, "evidence emission failed");
        }
        if spool.is_failed() {
            anyhow::bail!("evidence spool failed persistently, terminating session");
        }
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{ClockRole, MasterClock};
use crate::engine::EngineControl;
use crate::error::{BoundaryError, EngineError};
use crate::models::ChannelRuntime;
use crate::window::{ExecutionEntry, ExecutionWindowStore};

/// Boundary state of a channel. NONE, LIVE, and FAILED_TERMINAL are stable;
/// everything else is transient and arbitrated against teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryState {
    None,
    Planned,
    PreloadIssued,
    SwitchScheduled,
    SwitchIssued,
    Live,
    FailedTerminal,
}

impl BoundaryState {
    pub fn is_stable(self) -> bool {
        matches!(self, BoundaryState::None | BoundaryState::Live | BoundaryState::FailedTerminal)
    }

    pub fn name(self) -> &'static str {
        match self {
            BoundaryState::None => "NONE",
            BoundaryState::Planned => "PLANNED",
            BoundaryState::PreloadIssued => "PRELOAD_ISSUED",
            BoundaryState::SwitchScheduled => "SWITCH_SCHEDULED",
            BoundaryState::SwitchIssued => "SWITCH_ISSUED",
            BoundaryState::Live => "LIVE",
            BoundaryState::FailedTerminal => "FAILED_TERMINAL",
        }
    }

    /// The legal transition set. FAILED_TERMINAL is reachable from anywhere
    /// and absorbs everything.
    pub fn can_transition_to(self, to: BoundaryState) -> bool {
        use BoundaryState::*;
        if self == FailedTerminal {
            return false;
        }
        matches!(
            (self, to),
            (None, Planned)
                | (Planned, PreloadIssued)
                | (PreloadIssued, SwitchScheduled)
                | (SwitchScheduled, SwitchIssued)
                | (SwitchIssued, Live)
                | (Live, Planned)
                | (_, FailedTerminal)
        )
    }
}

/// Events delivered to a channel's control loop.
#[derive(Debug)]
pub enum ChannelEvent {
    /// Supervisor-initiated session start (always-on broadcast).
    StartRequested { plan_handle: String, port: u16 },
    ViewerJoined,
    ViewerLeft,
    BlockComplete,
    TeardownRequested { reason: String },
    Emergency { engaged: bool },
}

/// Snapshot published for the status surface after every state change.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub channel_id: String,
    pub slug: String,
    pub state: &'static str,
    /// True iff the boundary state is LIVE; health may be "up" regardless.
    pub live: bool,
    pub viewers: u32,
    pub session_id: Option<String>,
    pub teardown_pending: bool,
    pub emergency: bool,
}

#[derive(Debug, Clone)]
pub struct ChannelTiming {
    pub startup_latency_ms: i64,
    pub min_prefeed_lead_time_ms: i64,
    pub teardown_grace_timeout_ms: i64,
    pub max_startup_convergence_ms: i64,
    pub rpc_timeout_ms: u64,
}

impl ChannelTiming {
    pub fn from_config(runtime: &crate::config::RuntimeConfig) -> anyhow::Result<Self> {
        let ms = |s: &str| crate::config::duration_ms(s).map_err(|e| anyhow::anyhow!(e));
        Ok(Self {
            startup_latency_ms: ms(&runtime.startup_latency)?,
            min_prefeed_lead_time_ms: ms(&runtime.min_prefeed_lead_time)?,
            teardown_grace_timeout_ms: ms(&runtime.teardown_grace_timeout)?,
            max_startup_convergence_ms: ms(&runtime.max_startup_convergence)?,
            rpc_timeout_ms: ms(&runtime.rpc_timeout)? as u64,
        })
    }
}

struct PlayoutSession {
    id: String,
    convergence_deadline_utc_ms: i64,
}

struct PlannedBoundary {
    boundary_utc_ms: i64,
    entry: Arc<ExecutionEntry>,
    start_offset_ms: i64,
}

struct PendingTeardown {
    reason: String,
    requested_at_utc_ms: i64,
    deadline_utc_ms: i64,
}

/// Per-channel runtime controller: owns the boundary state machine, issues
/// engine RPCs with bounded timeouts, and arbitrates teardown against
/// transient states.
pub struct ChannelManager<E: EngineControl> {
    channel: ChannelRuntime,
    engine: Arc<E>,
    window: Arc<ExecutionWindowStore>,
    clock: MasterClock,
    timing: ChannelTiming,
    state: BoundaryState,
    session: Option<PlayoutSession>,
    boundary: Option<PlannedBoundary>,
    teardown: Option<PendingTeardown>,
    viewers: u32,
    emergency: bool,
    emergency_source: String,
    status_tx: watch::Sender<ChannelStatus>,
}

impl<E: EngineControl> ChannelManager<E> {
    pub fn new(
        channel: ChannelRuntime,
        engine: Arc<E>,
        window: Arc<ExecutionWindowStore>,
        clock: MasterClock,
        timing: ChannelTiming,
        emergency_source: String,
    ) -> (Self, watch::Receiver<ChannelStatus>) {
        let initial = ChannelStatus {
            channel_id: channel.id.clone(),
            slug: channel.slug.clone(),
            state: BoundaryState::None.name(),
            live: false,
            viewers: 0,
            session_id: None,
            teardown_pending: false,
            emergency: false,
        };
        let (status_tx, status_rx) = watch::channel(initial);
        (
            Self {
                channel,
                engine,
                window,
                clock,
                timing,
                state: BoundaryState::None,
                session: None,
                boundary: None,
                teardown: None,
                viewers: 0,
                emergency: false,
                emergency_source,
                status_tx,
            },
            status_rx,
        )
    }

    pub fn state(&self) -> BoundaryState {
        self.state
    }

    /// Live session authority: true iff the boundary state is LIVE.
    pub fn is_live(&self) -> bool {
        self.state == BoundaryState::Live
    }

    pub fn viewers(&self) -> u32 {
        self.viewers
    }

    pub fn teardown_pending(&self) -> bool {
        self.teardown.is_some()
    }

    pub fn has_boundary_timer(&self) -> bool {
        self.boundary.is_some()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.as_ref().map(|s| s.id.clone())
    }

    fn publish_status(&self) {
        let status = ChannelStatus {
            channel_id: self.channel.id.clone(),
            slug: self.channel.slug.clone(),
            state: self.state.name(),
            live: self.is_live(),
            viewers: self.viewers,
            session_id: self.session_id(),
            teardown_pending: self.teardown.is_some(),
            emergency: self.emergency,
        };
        self.status_tx.send_replace(status);
    }

    /// Guarded state transition. An illegal transition is a
    /// `boundary_transition_violation`: fatal, absorbing, timers cleared.
    pub fn transition(&mut self, to: BoundaryState) -> Result<(), BoundaryError> {
        if !self.state.can_transition_to(to) {
            let violation = BoundaryError::TransitionViolation {
                from: self.state.name(),
                to: to.name(),
            };
            error!(channel = %self.channel.slug, error = %violation, "illegal boundary transition");
            self.enter_failed_terminal("boundary_transition_violation");
            return Err(violation);
        }
        debug!(channel = %self.channel.slug, from = self.state.name(), to = to.name(), "boundary transition");
        self.state = to;
        self.publish_status();
        Ok(())
    }

    /// FAILED_TERMINAL entry: transition- and intent-absorbing. All transient
    /// timers (boundary, teardown grace) are cancelled on entry; health and
    /// cleanup keep running.
    fn enter_failed_terminal(&mut self, why: &str) {
        if self.state == BoundaryState::FailedTerminal {
            return;
        }
        error!(channel = %self.channel.slug, why, "channel entering FAILED_TERMINAL");
        self.state = BoundaryState::FailedTerminal;
        self.boundary = None;
        self.teardown = None;
        self.publish_status();
    }

    async fn engine_call<T>(
        &self,
        fut: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        match tokio::time::timeout(std::time::Duration::from_millis(self.timing.rpc_timeout_ms), fut).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout {
                timeout_ms: self.timing.rpc_timeout_ms,
            }),
        }
    }

    /// Create the playout session. Ungated: tune-in always creates a session
    /// if resources permit; boundary feasibility never blocks this.
    pub async fn start_session(&mut self, plan_handle: &str, port: u16) -> Result<(), BoundaryError> {
        if self.session.is_some() {
            return Ok(());
        }
        let now = self.clock.now_utc_ms();
        let session_id = Uuid::new_v4().to_string();

        let reply = self
            .engine_call(self.engine.start_channel(&self.channel.id, plan_handle, port))
            .await;
        if let Err(e) = reply {
            error!(channel = %self.channel.slug, error = %e, "StartChannel failed");
            self.enter_failed_terminal("engine_start_failed");
            return Err(BoundaryError::Engine(e));
        }

        // First LIVE start of the session locks the epoch; siblings sharing
        // the clock see it already locked, which is fine.
        if !self.clock.is_epoch_locked()
            && let Err(e) = self.clock.try_set_epoch_once(now, ClockRole::Live)
        {
            debug!(channel = %self.channel.slug, error = %e, "epoch already locked by a sibling channel");
        }

        self.session = Some(PlayoutSession {
            id: session_id.clone(),
            convergence_deadline_utc_ms: now + self.timing.max_startup_convergence_ms,
        });
        info!(channel = %self.channel.slug, session = %session_id, "playout session started");
        self.publish_status();
        Ok(())
    }

    fn required_lead_ms(&self) -> i64 {
        self.timing.startup_latency_ms + self.timing.min_prefeed_lead_time_ms
    }

    fn in_convergence_window(&self, now: i64) -> bool {
        self.session
            .as_ref()
            .map(|s| now <= s.convergence_deadline_utc_ms)
            .unwrap_or(false)
    }

    /// Choose the next boundary. Fresh sessions target a feasible instant
    /// inside the entry covering it (join in progress); live channels target
    /// the next entry start.
    pub fn plan_next_boundary(&mut self) -> Result<bool, BoundaryError> {
        if self.session.is_none() || self.teardown.is_some() || self.emergency {
            return Ok(false);
        }
        let now = self.clock.now_utc_ms();
        match self.state {
            BoundaryState::None => {
                // Earliest instant that satisfies the lead-time gate
                let boundary = now + self.required_lead_ms();
                let Some(entry) = self.window.entry_at(&self.channel.id, boundary) else {
                    // Horizon not primed that far yet; retried next tick and
                    // bounded by the convergence window
                    if !self.in_convergence_window(now) {
                        warn!(
                            channel = %self.channel.slug,
                            window_ms = self.timing.max_startup_convergence_ms,
                            "startup_infeasibility: no executable entry within the convergence window"
                        );
                        self.enter_failed_terminal("startup_infeasibility");
                        return Err(BoundaryError::StartupInfeasibility {
                            window_ms: self.timing.max_startup_convergence_ms,
                        });
                    }
                    return Ok(false);
                };
                let start_offset_ms = boundary - entry.start_utc_ms;
                self.boundary = Some(PlannedBoundary {
                    boundary_utc_ms: boundary,
                    entry,
                    start_offset_ms,
                });
                self.transition(BoundaryState::Planned)?;
                Ok(true)
            }
            BoundaryState::Live => {
                let Some(entry) = self.window.next_entry_after(&self.channel.id, now) else {
                    // Horizon will extend; nothing to plan yet
                    return Ok(false);
                };
                let boundary = entry.start_utc_ms;
                self.boundary = Some(PlannedBoundary {
                    boundary_utc_ms: boundary,
                    entry,
                    start_offset_ms: 0,
                });
                self.transition(BoundaryState::Planned)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Issue LoadPreview for the planned boundary. The lead-time gate is
    /// checked here, immediately before the first engine RPC for the
    /// boundary: during startup convergence an infeasible boundary is
    /// skipped (non-fatal); afterwards it is fatal.
    pub async fn issue_preload(&mut self) -> Result<(), BoundaryError> {
        if self.state != BoundaryState::Planned {
            return Ok(());
        }
        let now = self.clock.now_utc_ms();
        let Some(boundary) = self.boundary.as_ref() else {
            return Ok(());
        };

        if boundary.boundary_utc_ms < now + self.required_lead_ms() {
            let violation = BoundaryError::LeadTimeViolation {
                boundary_utc_ms: boundary.boundary_utc_ms,
                required_lead_ms: self.required_lead_ms(),
            };
            if self.in_convergence_window(now) {
                warn!(
                    channel = %self.channel.slug,
                    boundary_utc_ms = boundary.boundary_utc_ms,
                    "boundary infeasible during startup convergence, skipping"
                );
                // Drop back and let the next tick pick a later boundary
                self.boundary = None;
                self.state = BoundaryState::None;
                self.publish_status();
                return Ok(());
            }
            error!(channel = %self.channel.slug, error = %violation, "lead-time violation after convergence");
            self.enter_failed_terminal("plan_before_exec_violation");
            return Err(violation);
        }

        let uri = boundary.entry.asset.uri().to_string();
        let start_offset_ms = boundary.start_offset_ms;
        let hard_stop_time_ms = boundary.entry.end_utc_ms;

        self.transition(BoundaryState::PreloadIssued)?;
        match self
            .engine_call(
                self.engine
                    .load_preview(&self.channel.id, &uri, start_offset_ms, hard_stop_time_ms),
            )
            .await
        {
            Ok(reply) => {
                debug!(
                    channel = %self.channel.slug,
                    uri = %uri,
                    shadow_decode = ?reply.shadow_decode_started,
                    "preview ready"
                );
                self.transition(BoundaryState::SwitchScheduled)?;
                Ok(())
            }
            Err(e) => {
                error!(channel = %self.channel.slug, error = %e, "LoadPreview failed");
                self.enter_failed_terminal("preload_failed");
                Err(BoundaryError::Engine(e))
            }
        }
    }

    /// The boundary deadline, for the control loop's timer.
    pub fn next_deadline_utc_ms(&self) -> Option<i64> {
        let boundary = self
            .boundary
            .as_ref()
            .filter(|_| self.state == BoundaryState::SwitchScheduled)
            .map(|b| b.boundary_utc_ms);
        let grace = self.teardown.as_ref().map(|t| t.deadline_utc_ms);
        match (boundary, grace) {
            (Some(b), Some(g)) => Some(b.min(g)),
            (Some(b), None) => Some(b),
            (None, Some(g)) => Some(g),
            (None, None) => None,
        }
    }

    /// Mark the switch as issued at the boundary deadline.
    pub fn begin_switch(&mut self) -> Result<(), BoundaryError> {
        self.transition(BoundaryState::SwitchIssued)
    }

    /// Issue SwitchToLive and confirm the swap.
    pub async fn complete_switch(&mut self) -> Result<(), BoundaryError> {
        match self.engine_call(self.engine.switch_to_live(&self.channel.id)).await {
            Ok(reply) => {
                if reply.pts_contiguous == Some(false) {
                    warn!(channel = %self.channel.slug, "engine reported a PTS discontinuity at the seam");
                }
                let entry_id = self.boundary.as_ref().map(|b| b.entry.id.clone());
                self.boundary = None;
                self.transition(BoundaryState::Live)?;
                info!(channel = %self.channel.slug, entry = ?entry_id, "switched to live");

                // Teardown requested while we were transient: run it now
                if let Some(pending) = self.teardown.take() {
                    info!(channel = %self.channel.slug, reason = %pending.reason, "executing deferred teardown");
                    self.execute_teardown(&pending.reason).await;
                }
                Ok(())
            }
            Err(e) => {
                error!(channel = %self.channel.slug, error = %e, "SwitchToLive failed");
                self.enter_failed_terminal("switch_failed");
                Err(BoundaryError::Engine(e))
            }
        }
    }

    /// Teardown arbitration: stable states execute immediately; transient
    /// states mark it pending with a grace deadline. Reaching zero viewers
    /// requests teardown but never forces it mid-transition.
    pub async fn request_teardown(&mut self, reason: &str) {
        if self.state == BoundaryState::FailedTerminal {
            return;
        }
        if self.state.is_stable() {
            self.execute_teardown(reason).await;
            return;
        }
        if self.teardown.is_none() {
            let now = self.clock.now_utc_ms();
            info!(
                channel = %self.channel.slug,
                state = self.state.name(),
                reason,
                "teardown pending until the boundary settles"
            );
            self.teardown = Some(PendingTeardown {
                reason: reason.to_string(),
                requested_at_utc_ms: now,
                deadline_utc_ms: now + self.timing.teardown_grace_timeout_ms,
            });
            self.publish_status();
        }
    }

    /// End the session and return to NONE. This is session teardown, not a
    /// boundary transition, so it bypasses the boundary transition table.
    async fn execute_teardown(&mut self, reason: &str) {
        if let Err(e) = self.engine_call(self.engine.stop_channel(&self.channel.id)).await {
            // Stop is idempotent on the engine side; a failure here only
            // means we could not confirm it
            warn!(channel = %self.channel.slug, error = %e, "StopChannel failed during teardown");
        }
        info!(channel = %self.channel.slug, reason, "session torn down");
        self.session = None;
        self.boundary = None;
        self.teardown = None;
        self.state = BoundaryState::None;
        self.publish_status();
    }

    /// Grace expiry: still transient after the timeout forces terminal.
    fn check_teardown_grace(&mut self, now: i64) {
        if let Some(pending) = &self.teardown
            && now >= pending.deadline_utc_ms
            && !self.state.is_stable()
        {
            warn!(
                channel = %self.channel.slug,
                state = self.state.name(),
                requested_at = pending.requested_at_utc_ms,
                "teardown grace expired in a transient state"
            );
            self.enter_failed_terminal("teardown_grace_expired");
        }
    }

    /// Cut to the reserved emergency source through the normal boundary
    /// machine, compressed to an immediate switch.
    async fn engage_emergency(&mut self) -> Result<(), BoundaryError> {
        self.emergency = true;
        self.publish_status();
        if self.session.is_none() {
            return Ok(());
        }
        let uri = self.emergency_source.clone();
        // Emergency overrides whatever boundary was in flight
        if self.state != BoundaryState::Live && self.state != BoundaryState::None {
            self.boundary = None;
            self.state = BoundaryState::Live;
        }
        if self.state == BoundaryState::None {
            self.state = BoundaryState::Live;
        }
        self.transition(BoundaryState::Planned)?;
        self.transition(BoundaryState::PreloadIssued)?;
        match self
            .engine_call(self.engine.load_preview(&self.channel.id, &uri, 0, i64::MAX))
            .await
        {
            Ok(_) => {
                self.transition(BoundaryState::SwitchScheduled)?;
                self.transition(BoundaryState::SwitchIssued)?;
                match self.engine_call(self.engine.switch_to_live(&self.channel.id)).await {
                    Ok(_) => {
                        self.transition(BoundaryState::Live)?;
                        warn!(channel = %self.channel.slug, source = %uri, "emergency source live");
                        Ok(())
                    }
                    Err(e) => {
                        self.enter_failed_terminal("emergency_switch_failed");
                        Err(BoundaryError::Engine(e))
                    }
                }
            }
            Err(e) => {
                self.enter_failed_terminal("emergency_preload_failed");
                Err(BoundaryError::Engine(e))
            }
        }
    }

    pub async fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::StartRequested { plan_handle, port } => {
                if self.session.is_none() && self.state != BoundaryState::FailedTerminal {
                    let _ = self.start_session(&plan_handle, port).await;
                    self.drive().await;
                }
            }
            ChannelEvent::ViewerJoined => {
                self.viewers += 1;
                self.publish_status();
                if self.session.is_none() && self.state != BoundaryState::FailedTerminal {
                    let _ = self.start_session("plan-0", 0).await;
                }
            }
            ChannelEvent::ViewerLeft => {
                self.viewers = self.viewers.saturating_sub(1);
                self.publish_status();
                if self.viewers == 0 && self.session.is_some() {
                    self.request_teardown("viewer_count_zero").await;
                }
            }
            ChannelEvent::BlockComplete => {
                // Advances the machine the same way a tick does
                self.drive().await;
            }
            ChannelEvent::TeardownRequested { reason } => {
                self.request_teardown(&reason).await;
            }
            ChannelEvent::Emergency { engaged } => {
                if engaged {
                    let _ = self.engage_emergency().await;
                } else {
                    self.emergency = false;
                    self.publish_status();
                    // Normal planning resumes on the next tick
                }
            }
        }
    }

    /// One pass of the control loop: expire grace timers, plan boundaries,
    /// preload, and switch when the deadline arrives.
    pub async fn drive(&mut self) {
        let now = self.clock.now_utc_ms();
        self.check_teardown_grace(now);

        match self.state {
            BoundaryState::FailedTerminal => {}
            BoundaryState::None | BoundaryState::Live => {
                if self.teardown.is_some() {
                    // Stable with a pending teardown (arrived via an event
                    // race): execute it now
                    if let Some(pending) = self.teardown.take() {
                        self.execute_teardown(&pending.reason).await;
                    }
                    return;
                }
                match self.plan_next_boundary() {
                    Ok(true) => {
                        let _ = self.issue_preload().await;
                    }
                    Ok(false) => {}
                    Err(_) => {}
                }
            }
            BoundaryState::Planned => {
                let _ = self.issue_preload().await;
            }
            BoundaryState::SwitchScheduled => {
                if let Some(boundary_ms) = self.boundary.as_ref().map(|b| b.boundary_utc_ms)
                    && now >= boundary_ms
                {
                    if self.begin_switch().is_ok() {
                        let _ = self.complete_switch().await;
                    }
                }
            }
            // Waiting on an in-flight RPC future elsewhere in the loop
            BoundaryState::PreloadIssued | BoundaryState::SwitchIssued => {}
        }
    }

    /// Control loop: owns the channel until cancellation. Timers derive from
    /// MasterClock so deterministic tests drive the same code path.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<ChannelEvent>, cancel: CancellationToken) {
        info!(channel = %self.channel.slug, "channel manager started");
        loop {
            let deadline = self
                .next_deadline_utc_ms()
                .unwrap_or_else(|| self.clock.now_utc_ms() + 250);
            // Cloned so the wait future does not hold a borrow of `self`
            let clock = self.clock.clone();
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(channel = %self.channel.slug, "channel manager shutting down");
                    if self.session.is_some() {
                        self.execute_teardown("shutdown").await;
                    }
                    return;
                }
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => return,
                    }
                }
                _ = clock.wait_until_utc_ms(deadline, &cancel) => {
                    self.drive().await;
                }
            }
        }
    }
}

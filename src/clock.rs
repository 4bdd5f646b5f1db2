use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ClockError;

/// Sentinel for "epoch not set". Real epochs are non-negative UTC ms.
const EPOCH_UNSET: i64 = i64::MIN;

/// Maximum real sleep per wait iteration, so cancellation stays responsive.
const WAIT_CHUNK_MS: i64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockRole {
    Live,
    Preview,
}

/// Single authoritative source of "now" for a playout session.
///
/// Every timing decision in the core derives from this clock. The epoch is
/// set exactly once per session (compare-exchange, LIVE role only) and stays
/// locked until the supervisor starts a new session.
///
/// `MasterClock::fixed` is the deterministic test variant: time only moves
/// through `advance_ms`, and `wait_until_utc_ms` parks on a notifier instead
/// of sleeping.
#[derive(Clone)]
pub struct MasterClock {
    inner: Arc<Inner>,
}

struct Inner {
    fake: Option<FakeState>,
    epoch_utc_ms: AtomicI64,
    start: Instant,
}

struct FakeState {
    now_utc_ms: AtomicI64,
    initial_utc_ms: i64,
    notify: tokio::sync::Notify,
}

impl MasterClock {
    /// Wall-clock-backed clock for production.
    pub fn system() -> Self {
        Self {
            inner: Arc::new(Inner {
                fake: None,
                epoch_utc_ms: AtomicI64::new(EPOCH_UNSET),
                start: Instant::now(),
            }),
        }
    }

    /// Deterministic clock starting at `start_utc_ms`.
    pub fn fixed(start_utc_ms: i64) -> Self {
        Self {
            inner: Arc::new(Inner {
                fake: Some(FakeState {
                    now_utc_ms: AtomicI64::new(start_utc_ms),
                    initial_utc_ms: start_utc_ms,
                    notify: tokio::sync::Notify::new(),
                }),
                epoch_utc_ms: AtomicI64::new(EPOCH_UNSET),
                start: Instant::now(),
            }),
        }
    }

    pub fn is_fake(&self) -> bool {
        self.inner.fake.is_some()
    }

    pub fn now_utc_ms(&self) -> i64 {
        match &self.inner.fake {
            Some(f) => f.now_utc_ms.load(Ordering::Acquire),
            None => chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Milliseconds since clock construction; never goes backwards.
    pub fn monotonic_ms(&self) -> i64 {
        match &self.inner.fake {
            Some(f) => f.now_utc_ms.load(Ordering::Acquire) - f.initial_utc_ms,
            None => self.inner.start.elapsed().as_millis() as i64,
        }
    }

    /// Advance the deterministic clock and wake all waiters.
    ///
    /// Panics on a system clock: production code must never manufacture time.
    pub fn advance_ms(&self, delta_ms: i64) {
        let f = self
            .inner
            .fake
            .as_ref()
            .expect("advance_ms is only valid on a fixed clock");
        f.now_utc_ms.fetch_add(delta_ms, Ordering::AcqRel);
        f.notify.notify_waiters();
    }

    /// Cooperative wait until `deadline_utc_ms`. Returns `true` when the
    /// deadline was reached, `false` when cancelled first.
    pub async fn wait_until_utc_ms(&self, deadline_utc_ms: i64, cancel: &CancellationToken) -> bool {
        loop {
            match &self.inner.fake {
                Some(f) => {
                    // Register interest before re-checking so an advance
                    // between the check and the await is not missed.
                    let notified = f.notify.notified();
                    if self.now_utc_ms() >= deadline_utc_ms {
                        return true;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return false,
                        _ = notified => {}
                    }
                }
                None => {
                    let now = self.now_utc_ms();
                    if now >= deadline_utc_ms {
                        return true;
                    }
                    let chunk = (deadline_utc_ms - now).min(WAIT_CHUNK_MS).max(1) as u64;
                    tokio::select! {
                        _ = cancel.cancelled() => return false,
                        _ = tokio::time::sleep(std::time::Duration::from_millis(chunk)) => {}
                    }
                }
            }
        }
    }

    /// Single-shot epoch set. Succeeds only on the first call with
    /// `ClockRole::Live` in a session; everything else is an authority
    /// violation.
    pub fn try_set_epoch_once(&self, epoch_utc_ms: i64, role: ClockRole) -> Result<(), ClockError> {
        if role != ClockRole::Live {
            return Err(ClockError::AuthorityViolation(
                "only the LIVE role may set the session epoch".to_string(),
            ));
        }
        if epoch_utc_ms == EPOCH_UNSET {
            return Err(ClockError::AuthorityViolation("invalid epoch value".to_string()));
        }
        match self.inner.epoch_utc_ms.compare_exchange(
            EPOCH_UNSET,
            epoch_utc_ms,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                debug!(epoch_utc_ms, "session epoch locked");
                Ok(())
            }
            Err(current) => Err(ClockError::AuthorityViolation(format!(
                "epoch already locked at {current}"
            ))),
        }
    }

    /// Unlock the epoch. Valid only at a session boundary; the supervisor
    /// owns this call.
    pub fn reset_epoch_for_new_session(&self) {
        self.inner.epoch_utc_ms.store(EPOCH_UNSET, Ordering::Release);
        debug!("session epoch reset");
    }

    pub fn is_epoch_locked(&self) -> bool {
        self.inner.epoch_utc_ms.load(Ordering::Acquire) != EPOCH_UNSET
    }

    pub fn epoch_utc_ms(&self) -> Option<i64> {
        match self.inner.epoch_utc_ms.load(Ordering::Acquire) {
            EPOCH_UNSET => None,
            v => Some(v),
        }
    }
}

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::channel::{ChannelEvent, ChannelStatus};
use crate::clock::MasterClock;
use crate::horizon::HorizonHealthReport;
use crate::models::ChannelRuntime;

/// Everything the supervisor holds per channel: the event inlet and the
/// read-side of the status/health feeds. The managers themselves run in
/// their own tasks.
pub struct ChannelHandle {
    pub runtime: ChannelRuntime,
    pub events: mpsc::UnboundedSender<ChannelEvent>,
    pub status: watch::Receiver<ChannelStatus>,
    pub health: watch::Receiver<Option<HorizonHealthReport>>,
}

/// Owns the set of channel managers, the emergency-mode toggle, and the
/// session clock. Makes no per-channel scheduling decisions — it only
/// registers, routes events, and aggregates status.
pub struct ProgramDirector {
    clock: MasterClock,
    channels: RwLock<HashMap<String, ChannelHandle>>,
    emergency: AtomicBool,
}

impl ProgramDirector {
    pub fn new(clock: MasterClock) -> Self {
        Self {
            clock,
            channels: RwLock::new(HashMap::new()),
            emergency: AtomicBool::new(false),
        }
    }

    pub fn clock(&self) -> &MasterClock {
        &self.clock
    }

    pub fn register(&self, handle: ChannelHandle) {
        let id = handle.runtime.id.clone();
        info!(channel = %handle.runtime.slug, "channel registered with director");
        self.channels.write().expect("director registry poisoned").insert(id, handle);
    }

    /// Route an event to one channel, addressed by slug or id.
    pub fn send_event(&self, channel: &str, event: ChannelEvent) -> bool {
        let channels = self.channels.read().expect("director registry poisoned");
        let handle = channels
            .get(channel)
            .or_else(|| channels.values().find(|h| h.runtime.slug == channel));
        match handle {
            Some(handle) => handle.events.send(event).is_ok(),
            None => {
                warn!(channel = %channel, "event for unknown channel dropped");
                false
            }
        }
    }

    /// Global override to the reserved channel source, fanned out to every
    /// manager. Disengaging resumes normal planning.
    pub fn set_emergency(&self, engaged: bool) {
        let was = self.emergency.swap(engaged, Ordering::AcqRel);
        if was == engaged {
            return;
        }
        if engaged {
            warn!("emergency mode engaged");
        } else {
            info!("emergency mode disengaged");
        }
        let channels = self.channels.read().expect("director registry poisoned");
        for handle in channels.values() {
            let _ = handle.events.send(ChannelEvent::Emergency { engaged });
        }
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency.load(Ordering::Acquire)
    }

    /// Current status snapshot of every registered channel.
    pub fn statuses(&self) -> Vec<(ChannelStatus, Option<HorizonHealthReport>)> {
        let channels = self.channels.read().expect("director registry poisoned");
        let mut out: Vec<_> = channels
            .values()
            .map(|h| (h.status.borrow().clone(), h.health.borrow().clone()))
            .collect();
        out.sort_by(|a, b| a.0.slug.cmp(&b.0.slug));
        out
    }

    pub fn status_of(&self, slug_or_id: &str) -> Option<(ChannelStatus, Option<HorizonHealthReport>)> {
        let channels = self.channels.read().expect("director registry poisoned");
        channels
            .get(slug_or_id)
            .or_else(|| channels.values().find(|h| h.runtime.slug == slug_or_id))
            .map(|h| (h.status.borrow().clone(), h.health.borrow().clone()))
    }

    /// Session boundary: unlock the epoch for the next playout session.
    /// The only sanctioned caller of the clock reset.
    pub fn begin_new_session(&self) {
        self.clock.reset_epoch_for_new_session();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::BoundaryState;

    fn handle(slug: &str) -> (ChannelHandle, mpsc::UnboundedReceiver<ChannelEvent>) {
        let runtime = ChannelRuntime {
            id: format!("id-{slug}"),
            slug: slug.to_string(),
            name: slug.to_uppercase(),
            timezone: "UTC".parse().unwrap(),
            grid_minutes: 30,
            day_start: chrono::NaiveTime::parse_from_str("06:00", "%H:%M").unwrap(),
        };
        let (events, rx) = mpsc::unbounded_channel();
        let (_status_tx, status) = watch::channel(ChannelStatus {
            channel_id: runtime.id.clone(),
            slug: runtime.slug.clone(),
            state: BoundaryState::None.name(),
            live: false,
            viewers: 0,
            session_id: None,
            teardown_pending: false,
            emergency: false,
        });
        let (_health_tx, health) = watch::channel(None);
        (
            ChannelHandle {
                runtime,
                events,
                status,
                health,
            },
            rx,
        )
    }

    #[test]
    fn emergency_fans_out_to_all_channels_once() {
        let director = ProgramDirector::new(MasterClock::fixed(0));
        let (h1, mut rx1) = handle("one");
        let (h2, mut rx2) = handle("two");
        director.register(h1);
        director.register(h2);

        director.set_emergency(true);
        // Idempotent: engaging again does not refan
        director.set_emergency(true);
        assert!(director.is_emergency());

        assert!(matches!(rx1.try_recv().unwrap(), ChannelEvent::Emergency { engaged: true }));
        assert!(rx1.try_recv().is_err());
        assert!(matches!(rx2.try_recv().unwrap(), ChannelEvent::Emergency { engaged: true }));
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn events_route_by_slug_or_id() {
        let director = ProgramDirector::new(MasterClock::fixed(0));
        let (h, mut rx) = handle("one");
        director.register(h);

        assert!(director.send_event("one", ChannelEvent::ViewerJoined));
        assert!(director.send_event("id-one", ChannelEvent::ViewerLeft));
        assert!(!director.send_event("nope", ChannelEvent::ViewerJoined));
        assert!(matches!(rx.try_recv().unwrap(), ChannelEvent::ViewerJoined));
        assert!(matches!(rx.try_recv().unwrap(), ChannelEvent::ViewerLeft));
    }

    #[test]
    fn session_boundary_unlocks_the_epoch() {
        let clock = MasterClock::fixed(1_000);
        clock.try_set_epoch_once(1_000, crate::clock::ClockRole::Live).unwrap();
        let director = ProgramDirector::new(clock.clone());
        assert!(clock.is_epoch_locked());
        director.begin_new_session();
        assert!(!clock.is_epoch_locked());
    }
}

//! The pull interface between the simulation and a renderer.

use crate::metrics::MetricsSnapshot;
use crate::simulation::Frame;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Everything a renderer needs to draw one tick.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LiveView {
    pub frame: Frame,
    pub real: MetricsSnapshot,
    pub optimized: MetricsSnapshot,
}

/// A single-slot, last-value-wins mailbox for [LiveView]s.
///
/// The simulation publishes once per tick and the renderer pulls at its own pace. Views
/// that are never pulled are overwritten.
#[derive(Clone, Debug, Default)]
pub struct LiveFeed {
    slot: Arc<Mutex<Option<Arc<LiveView>>>>,
}

impl LiveFeed {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn publish(&self, view: LiveView) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(view));
    }

    /// The most recently published view, if any.
    pub fn latest(&self) -> Option<Arc<LiveView>> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

/// A request made to a running simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Stop,
    Reset,
}

const NONE: u8 = 0;
const STOP: u8 = 1;
const RESET: u8 = 2;

/// Stop and reset requests, observed by the simulation at the next tick boundary.
#[derive(Clone, Debug, Default)]
pub struct SimulationControl {
    pending: Arc<AtomicU8>,
}

impl SimulationControl {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn stop(&self) {
        self.pending.store(STOP, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.pending.store(RESET, Ordering::SeqCst);
    }

    /// Takes the pending request, if any. A later request replaces an earlier one.
    pub fn take(&self) -> Option<Command> {
        match self.pending.swap(NONE, Ordering::SeqCst) {
            STOP => Some(Command::Stop),
            RESET => Some(Command::Reset),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn control_requests_are_taken_once() {
        let control = SimulationControl::new();
        let remote = control.clone();
        assert_eq!(control.take(), None);
        remote.reset();
        remote.stop();
        assert_eq!(control.take(), Some(Command::Stop));
        assert_eq!(control.take(), None);
    }

    #[test]
    fn empty_feed() {
        let feed = LiveFeed::new();
        assert!(feed.latest().is_none());
        feed.clear();
        assert!(feed.latest().is_none());
    }
}

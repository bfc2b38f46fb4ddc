//! Controller input.
//!
//! Controllers only expose level state, so presses are reconstructed by
//! comparing each poll against the previous one per device. A button fires
//! on its released->pressed transition only.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::config::PadBindings;
use crate::input::InputArbiter;
use crate::trial::Response;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PadSnapshot {
    pub index: usize,
    pub buttons: Vec<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadAction {
    Abort,
    Respond(Response),
}

/// Source of controller state, sampled once per refresh tick.
pub trait GamepadSource: Send {
    fn poll(&mut self) -> Vec<PadSnapshot>;
}

/// For hosts without controller support.
pub struct NoGamepads;

impl GamepadSource for NoGamepads {
    fn poll(&mut self) -> Vec<PadSnapshot> {
        Vec::new()
    }
}

pub struct EdgeTracker {
    bindings: PadBindings,
    previous: HashMap<usize, Vec<bool>>,
}

impl EdgeTracker {
    pub fn new(bindings: PadBindings) -> Self {
        Self {
            bindings,
            previous: HashMap::new(),
        }
    }

    pub fn tracked_devices(&self) -> usize {
        self.previous.len()
    }

    /// Compares `pads` against the last poll and returns the actions whose
    /// buttons went down this tick. Devices missing from `pads` are dropped.
    pub fn scan(&mut self, pads: &[PadSnapshot]) -> Vec<(usize, PadAction)> {
        self.previous
            .retain(|index, _| pads.iter().any(|p| p.index == *index));

        let mut actions = Vec::new();
        for pad in pads {
            let before = self.previous.remove(&pad.index).unwrap_or_default();
            let rose = |buttons: &[usize]| {
                buttons.iter().any(|&b| {
                    let now = pad.buttons.get(b).copied().unwrap_or(false);
                    let was = before.get(b).copied().unwrap_or(false);
                    now && !was
                })
            };
            if rose(&self.bindings.abort) {
                actions.push((pad.index, PadAction::Abort));
            } else {
                if rose(&self.bindings.a) {
                    actions.push((pad.index, PadAction::Respond(Response::A)));
                }
                if rose(&self.bindings.b) {
                    actions.push((pad.index, PadAction::Respond(Response::B)));
                }
            }
            self.previous.insert(pad.index, pad.buttons.clone());
        }
        actions
    }
}

/// Background scanner feeding controller edges into the arbiter.
///
/// Runs independently of trial phases; its output only matters while a
/// trial holds the response slot.
pub struct ControllerPoller {
    stop: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl ControllerPoller {
    pub fn spawn(
        mut source: Box<dyn GamepadSource>,
        bindings: PadBindings,
        interval: Duration,
        arbiter: Arc<InputArbiter>,
    ) -> Self {
        let stop = CancelToken::new();
        let signal = stop.clone();
        let handle = thread::spawn(move || {
            let mut tracker = EdgeTracker::new(bindings);
            let mut ticks: u64 = 0;
            loop {
                let pads = source.poll();
                for (index, action) in tracker.scan(&pads) {
                    debug!(pad = index, ?action, "controller edge");
                    arbiter.dispatch_pad(action);
                }
                ticks += 1;
                if signal.wait_timeout(interval) {
                    break;
                }
            }
            debug!(ticks, "controller poller stopped");
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ControllerPoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

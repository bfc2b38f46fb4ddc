//! Input arbitration.
//!
//! Keyboard, pointer/touch and controller input all collapse into one
//! response channel (A/B) and one abort signal. Exactly one trial may own the
//! response channel at a time; emissions with no owner are dropped, never
//! queued. Aborts go to the owning trial when there is one and otherwise to
//! the session-wide fallback handler.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::config::{InputConfig, KeyBindings, PointerTarget};
use crate::gamepad::PadAction;
use crate::trial::Response;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialSignal {
    Response { response: Response, at: Instant },
    Abort,
}

/// Which primary press event the device delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerCapability {
    PointerEvents,
    TouchAndClick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressKind {
    PointerDown,
    TouchStart,
    Click,
}

/// Tells the raw keyboard layer what happened to a key press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDisposition {
    Ignored,
    Handled { suppress_default: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortRoute {
    Trial,
    Global,
    Unhandled,
}

pub type AbortHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug)]
struct Slot {
    generation: u64,
    sender: Sender<TrialSignal>,
}

pub struct InputArbiter {
    keys: KeyBindings,
    pointer_targets: Vec<PointerTarget>,
    capability: PointerCapability,
    listener: Mutex<Option<Slot>>,
    trial_abort: Mutex<Option<Slot>>,
    global_abort: Mutex<Option<AbortHandler>>,
    last_touch: Mutex<Option<String>>,
    generation: AtomicU64,
}

impl InputArbiter {
    pub fn new(config: &InputConfig) -> Self {
        Self {
            keys: config.keys.clone(),
            pointer_targets: config.pointer_targets.clone(),
            capability: config.pointer_capability,
            listener: Mutex::new(None),
            trial_abort: Mutex::new(None),
            global_abort: Mutex::new(None),
            last_touch: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn set_global_abort_handler(&self, handler: AbortHandler) {
        *lock(&self.global_abort) = Some(handler);
    }

    /// Installs `sender` as the response listener, replacing any previous
    /// one. Returns the generation needed to clear it again.
    pub fn set_response_listener(&self, sender: Sender<TrialSignal>) -> u64 {
        let generation = self.next_generation();
        *lock(&self.listener) = Some(Slot { generation, sender });
        generation
    }

    /// Clears the listener if `generation` still owns it.
    pub fn clear_response_listener(&self, generation: u64) {
        clear_slot(&self.listener, generation);
    }

    pub fn set_trial_abort_handler(&self, sender: Sender<TrialSignal>) -> u64 {
        let generation = self.next_generation();
        *lock(&self.trial_abort) = Some(Slot { generation, sender });
        generation
    }

    pub fn clear_trial_abort_handler(&self, generation: u64) {
        clear_slot(&self.trial_abort, generation);
    }

    pub fn has_listener(&self) -> bool {
        lock(&self.listener).is_some()
    }

    /// Claims both the response and abort slots for one trial.
    pub fn subscribe(&self) -> TrialSubscription<'_> {
        let (sender, receiver) = mpsc::channel();
        let listener_gen = self.set_response_listener(sender.clone());
        let abort_gen = self.set_trial_abort_handler(sender);
        TrialSubscription {
            arbiter: self,
            listener_gen,
            abort_gen,
            receiver,
            closed: false,
        }
    }

    /// Delivers a response to the current listener. Returns `false` when
    /// nobody is listening and the response was dropped.
    pub fn emit_response(&self, response: Response) -> bool {
        let mut slot = lock(&self.listener);
        let Some(current) = slot.as_ref() else {
            trace!(response = response.as_str(), "response dropped: no listener");
            return false;
        };
        let signal = TrialSignal::Response {
            response,
            at: Instant::now(),
        };
        if current.sender.send(signal).is_err() {
            *slot = None;
            return false;
        }
        true
    }

    pub fn handle_abort(&self) -> AbortRoute {
        {
            let mut slot = lock(&self.trial_abort);
            if let Some(current) = slot.as_ref() {
                if current.sender.send(TrialSignal::Abort).is_ok() {
                    debug!("abort routed to running trial");
                    return AbortRoute::Trial;
                }
                *slot = None;
            }
        }
        let handler = lock(&self.global_abort).clone();
        match handler {
            Some(handler) => {
                debug!("abort routed to session handler");
                handler();
                AbortRoute::Global
            }
            None => AbortRoute::Unhandled,
        }
    }

    pub fn on_key(&self, key: &str) -> KeyDisposition {
        if key.eq_ignore_ascii_case(&self.keys.abort) {
            self.handle_abort();
            return KeyDisposition::Handled {
                suppress_default: true,
            };
        }
        let response = if key.eq_ignore_ascii_case(&self.keys.a) {
            Response::A
        } else if key.eq_ignore_ascii_case(&self.keys.b) {
            Response::B
        } else {
            return KeyDisposition::Ignored;
        };
        let active = self.has_listener();
        self.emit_response(response);
        KeyDisposition::Handled {
            suppress_default: active,
        }
    }

    /// Handles a press on an on-screen target. Returns `true` if a response
    /// reached a listener.
    pub fn on_press(&self, target: &str, kind: PressKind) -> bool {
        let Some(response) = self
            .pointer_targets
            .iter()
            .find(|t| t.id == target)
            .map(|t| t.response)
        else {
            return false;
        };
        let counts = match (self.capability, kind) {
            (PointerCapability::PointerEvents, PressKind::PointerDown) => true,
            (PointerCapability::PointerEvents, _) => false,
            (PointerCapability::TouchAndClick, PressKind::TouchStart) => {
                *lock(&self.last_touch) = Some(target.to_string());
                true
            }
            (PointerCapability::TouchAndClick, PressKind::Click) => {
                // A click right after a touch on the same target is its synthesized twin.
                let previous = lock(&self.last_touch).take();
                previous.as_deref() != Some(target)
            }
            (PointerCapability::TouchAndClick, PressKind::PointerDown) => false,
        };
        counts && self.emit_response(response)
    }

    pub fn dispatch_pad(&self, action: PadAction) {
        match action {
            PadAction::Abort => {
                self.handle_abort();
            }
            PadAction::Respond(response) => {
                self.emit_response(response);
            }
        }
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn clear_slot(slot: &Mutex<Option<Slot>>, generation: u64) {
    let mut slot = lock(slot);
    if slot.as_ref().map(|s| s.generation) == Some(generation) {
        *slot = None;
    }
}

/// Ownership of the response and abort slots for the lifetime of one trial.
///
/// Dropping (or [`close`](Self::close)) releases both slots, after which new
/// input no longer reaches this trial.
pub struct TrialSubscription<'a> {
    arbiter: &'a InputArbiter,
    listener_gen: u64,
    abort_gen: u64,
    receiver: Receiver<TrialSignal>,
    closed: bool,
}

impl TrialSubscription<'_> {
    pub fn recv_timeout(&self, timeout: Duration) -> Result<TrialSignal, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<TrialSignal, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Releases both slots and returns whatever was still queued.
    pub fn close(&mut self) -> Vec<TrialSignal> {
        if !self.closed {
            self.arbiter.clear_response_listener(self.listener_gen);
            self.arbiter.clear_trial_abort_handler(self.abort_gen);
            self.closed = true;
        }
        self.receiver.try_iter().collect()
    }
}

impl Drop for TrialSubscription<'_> {
    fn drop(&mut self) {
        if !self.closed {
            self.arbiter.clear_response_listener(self.listener_gen);
            self.arbiter.clear_trial_abort_handler(self.abort_gen);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn arbiter() -> InputArbiter {
        InputArbiter::new(&InputConfig::default())
    }

    fn counting_handler(arbiter: &InputArbiter) -> Arc<AtomicUsize> {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        arbiter.set_global_abort_handler(Arc::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        hits
    }

    fn responses(sub: &TrialSubscription<'_>) -> Vec<Response> {
        let mut out = Vec::new();
        while let Ok(signal) = sub.try_recv() {
            if let TrialSignal::Response { response, .. } = signal {
                out.push(response);
            }
        }
        out
    }

    #[test]
    fn responses_without_listener_are_dropped_not_queued() {
        let arbiter = arbiter();
        assert!(!arbiter.emit_response(Response::A));
        let sub = arbiter.subscribe();
        assert!(responses(&sub).is_empty());
        assert!(arbiter.emit_response(Response::B));
        assert_eq!(responses(&sub), vec![Response::B]);
    }

    #[test]
    fn keys_map_case_insensitively() {
        let arbiter = arbiter();
        let sub = arbiter.subscribe();
        assert_eq!(
            arbiter.on_key("A"),
            KeyDisposition::Handled {
                suppress_default: true
            }
        );
        arbiter.on_key("b");
        assert_eq!(arbiter.on_key("x"), KeyDisposition::Ignored);
        assert_eq!(responses(&sub), vec![Response::A, Response::B]);
    }

    #[test]
    fn response_keys_only_suppress_default_while_listening() {
        let arbiter = arbiter();
        assert_eq!(
            arbiter.on_key("a"),
            KeyDisposition::Handled {
                suppress_default: false
            }
        );
    }

    #[test]
    fn abort_goes_to_trial_before_global() {
        let arbiter = arbiter();
        let global = counting_handler(&arbiter);
        let sub = arbiter.subscribe();
        assert_eq!(
            arbiter.on_key("Escape"),
            KeyDisposition::Handled {
                suppress_default: true
            }
        );
        assert_eq!(sub.try_recv(), Ok(TrialSignal::Abort));
        assert_eq!(global.load(Ordering::SeqCst), 0);
        drop(sub);
        assert_eq!(arbiter.handle_abort(), AbortRoute::Global);
        assert_eq!(global.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn abort_without_any_handler_is_unhandled() {
        assert_eq!(arbiter().handle_abort(), AbortRoute::Unhandled);
    }

    #[test]
    fn closing_subscription_releases_slots_and_drains() {
        let arbiter = arbiter();
        let mut sub = arbiter.subscribe();
        arbiter.emit_response(Response::A);
        arbiter.handle_abort();
        let drained = sub.close();
        assert_eq!(drained.len(), 2);
        assert!(!arbiter.has_listener());
        assert!(!arbiter.emit_response(Response::A));
    }

    #[test]
    fn stale_subscription_does_not_clear_newer_owner() {
        let arbiter = arbiter();
        let old = arbiter.subscribe();
        let new = arbiter.subscribe();
        drop(old);
        assert!(arbiter.has_listener());
        arbiter.emit_response(Response::B);
        assert_eq!(responses(&new), vec![Response::B]);
    }

    #[test]
    fn pointer_events_fire_on_pointer_down_only() {
        let arbiter = arbiter();
        let sub = arbiter.subscribe();
        assert!(arbiter.on_press("touch-a", PressKind::PointerDown));
        assert!(!arbiter.on_press("touch-a", PressKind::Click));
        assert!(!arbiter.on_press("touch-b", PressKind::TouchStart));
        assert!(!arbiter.on_press("elsewhere", PressKind::PointerDown));
        assert_eq!(responses(&sub), vec![Response::A]);
    }

    #[test]
    fn touch_fallback_suppresses_synthesized_click() {
        let config = InputConfig {
            pointer_capability: PointerCapability::TouchAndClick,
            ..InputConfig::default()
        };
        let arbiter = InputArbiter::new(&config);
        let sub = arbiter.subscribe();
        assert!(arbiter.on_press("touch-b", PressKind::TouchStart));
        assert!(!arbiter.on_press("touch-b", PressKind::Click));
        // Mouse-only click with no preceding touch counts.
        assert!(arbiter.on_press("touch-a", PressKind::Click));
        assert_eq!(responses(&sub), vec![Response::B, Response::A]);
    }

    #[test]
    fn pad_actions_route_like_other_sources() {
        let arbiter = arbiter();
        let global = counting_handler(&arbiter);
        arbiter.dispatch_pad(PadAction::Abort);
        assert_eq!(global.load(Ordering::SeqCst), 1);
        let sub = arbiter.subscribe();
        arbiter.dispatch_pad(PadAction::Respond(Response::A));
        assert_eq!(responses(&sub), vec![Response::A]);
    }
}

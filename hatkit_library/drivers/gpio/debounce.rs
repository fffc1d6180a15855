//! Edge debounce and callback dispatch
//!
//! Shared by every backend that delivers edge callbacks: the native GPIO
//! interrupt thread, the simulation event thread and the expander poller.
//! Per pin the gate moves `Disarmed -> Armed` when an edge is selected,
//! `Armed -> Pending(until)` when a matching edge arrives (the callback fires
//! on this transition) and back to `Armed` once the window has elapsed.

use std::collections::HashMap;
use std::time::Duration;

use super::{Edge, EdgeCallback, EdgeEvent};

/// Per-pin debounce state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    Disarmed,
    Armed,
    Pending { until: Duration },
}

#[derive(Debug, Clone)]
pub struct DebounceGate {
    state: DebounceState,
    edge: Option<Edge>,
    window: Duration,
}

impl Default for DebounceGate {
    fn default() -> Self {
        Self {
            state: DebounceState::Disarmed,
            edge: None,
            window: Duration::ZERO,
        }
    }
}

impl DebounceGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, edge: Edge) {
        self.edge = Some(edge);
        if self.state == DebounceState::Disarmed {
            self.state = DebounceState::Armed;
        }
    }

    pub fn disarm(&mut self) {
        self.edge = None;
        self.state = DebounceState::Disarmed;
    }

    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    pub fn state(&self) -> DebounceState {
        self.state
    }

    pub fn edge(&self) -> Option<Edge> {
        self.edge
    }

    /// Return to `Armed` once the pending window has elapsed
    pub fn expire(&mut self, now: Duration) {
        if let DebounceState::Pending { until } = self.state {
            if now >= until {
                self.state = DebounceState::Armed;
            }
        }
    }

    /// Feed a detected edge; returns true when the callback should fire
    pub fn on_edge(&mut self, rising: bool, now: Duration) -> bool {
        self.expire(now);
        match (self.state, self.edge) {
            (DebounceState::Armed, Some(edge)) if edge.matches(rising) => {
                if !self.window.is_zero() {
                    self.state = DebounceState::Pending {
                        until: now + self.window,
                    };
                }
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
struct PinEvents {
    gate: DebounceGate,
    callback: Option<EdgeCallback>,
}

/// Debounce gates and callbacks of every pin of one backend
///
/// Backends keep this behind a lock, take the returned callback out, and
/// invoke it after releasing every lock they hold.
#[derive(Debug, Default)]
pub struct EdgeDispatch {
    pins: HashMap<String, PinEvents>,
}

impl EdgeDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_edge(&mut self, pin: &str, edge: Option<Edge>) {
        let events = self.pins.entry(pin.to_string()).or_default();
        match edge {
            Some(edge) => events.gate.arm(edge),
            None => events.gate.disarm(),
        }
    }

    pub fn set_debounce(&mut self, pin: &str, window: Duration) {
        self.pins
            .entry(pin.to_string())
            .or_default()
            .gate
            .set_window(window);
    }

    pub fn set_callback(&mut self, pin: &str, callback: Option<EdgeCallback>) {
        self.pins.entry(pin.to_string()).or_default().callback = callback;
    }

    /// Forget everything about a pin (direction change)
    pub fn clear(&mut self, pin: &str) {
        self.pins.remove(pin);
    }

    pub fn edge(&self, pin: &str) -> Option<Edge> {
        self.pins.get(pin).and_then(|p| p.gate.edge())
    }

    pub fn state(&self, pin: &str) -> DebounceState {
        self.pins
            .get(pin)
            .map(|p| p.gate.state())
            .unwrap_or(DebounceState::Disarmed)
    }

    /// Pins with an armed gate
    pub fn armed_pins(&self) -> Vec<String> {
        self.pins
            .iter()
            .filter(|(_, p)| p.gate.edge().is_some())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Run an edge through the pin's gate
    ///
    /// Returns the callback to invoke and the event to pass it.
    pub fn on_edge(
        &mut self,
        pin: &str,
        rising: bool,
        now: Duration,
    ) -> Option<(EdgeCallback, EdgeEvent)> {
        let events = self.pins.get_mut(pin)?;
        if !events.gate.on_edge(rising, now) {
            return None;
        }
        let callback = events.callback.clone()?;
        Some((
            callback,
            EdgeEvent {
                pin: pin.to_string(),
                rising,
                timestamp: now,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_gate_transitions() {
        let mut gate = DebounceGate::new();
        assert!(!gate.on_edge(true, ms(0)));

        gate.arm(Edge::Rising);
        gate.set_window(ms(200));
        assert_eq!(gate.state(), DebounceState::Armed);

        assert!(gate.on_edge(true, ms(10)));
        assert_eq!(gate.state(), DebounceState::Pending { until: ms(210) });

        // Suppressed inside the window
        assert!(!gate.on_edge(true, ms(60)));

        gate.expire(ms(210));
        assert_eq!(gate.state(), DebounceState::Armed);
        assert!(!gate.on_edge(false, ms(220)));
        assert!(gate.on_edge(true, ms(230)));
    }

    #[test]
    fn test_zero_window_fires_every_edge() {
        let mut gate = DebounceGate::new();
        gate.arm(Edge::Both);
        assert!(gate.on_edge(true, ms(0)));
        assert!(gate.on_edge(false, ms(0)));
        assert_eq!(gate.state(), DebounceState::Armed);
    }

    fn count(_event: &EdgeEvent, context: &(dyn Any + Send + Sync)) {
        if let Some(counter) = context.downcast_ref::<AtomicUsize>() {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_dispatch_returns_callback_with_context() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut dispatch = EdgeDispatch::new();
        dispatch.set_edge("A_1", Some(Edge::Falling));
        dispatch.set_callback("A_1", Some(EdgeCallback::new(count, counter.clone())));

        assert!(dispatch.on_edge("A_1", true, ms(0)).is_none());
        let (callback, event) = dispatch.on_edge("A_1", false, ms(5)).unwrap();
        assert!(!event.rising);
        callback.invoke(&event);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        dispatch.clear("A_1");
        assert!(dispatch.on_edge("A_1", false, ms(10)).is_none());
        assert_eq!(dispatch.state("A_1"), DebounceState::Disarmed);
    }
}

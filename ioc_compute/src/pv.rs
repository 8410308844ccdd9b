//! Observable process-variable handles.
//!
//! A [`Pv`] is the in-process stand-in for a client-library PV: it
//! caches the latest value and connection state, derives alarm severity
//! from its limits, and notifies registered observers. Observers run on
//! the thread that posted the update — they must hand off non-trivial
//! work (the computed-PV engine hands off to its queue worker).
//!
//! Writes flow the other way: [`Pv::put`] delegates to the registered
//! write handler (the device controller), and the cached value only
//! changes when the authoritative readback is posted later.

use std::sync::{Arc, Mutex, MutexGuard};

use ioc_common::pv::{AlarmLimits, PvValue, Severity};
use tracing::trace;

/// Observer of value updates: `(pv name, new value, severity)`.
pub type ValueObserver = Arc<dyn Fn(&str, &PvValue, Severity) + Send + Sync>;

/// Observer of connection-state changes: `(pv name, connected)`.
pub type ConnectionObserver = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Write handler: returns `true` when the write was accepted.
pub type WriteHandler = Arc<dyn Fn(&PvValue) -> bool + Send + Sync>;

/// Consistent point-in-time view of a PV.
#[derive(Debug, Clone)]
pub struct PvSnapshot {
    pub value: PvValue,
    pub connected: bool,
    pub severity: Severity,
    pub limits: AlarmLimits,
}

struct PvState {
    value: PvValue,
    connected: bool,
    limits: AlarmLimits,
    severity: Severity,
    value_observers: Vec<Option<ValueObserver>>,
    connection_observers: Vec<Option<ConnectionObserver>>,
    write_handler: Option<WriteHandler>,
}

/// Cheaply cloneable PV handle. All clones view the same state.
#[derive(Clone)]
pub struct Pv {
    name: Arc<str>,
    state: Arc<Mutex<PvState>>,
}

impl Pv {
    /// Create a PV starting disconnected with the given initial value.
    pub fn new(name: &str, initial: PvValue, limits: AlarmLimits) -> Self {
        Self {
            name: Arc::from(name),
            state: Arc::new(Mutex::new(PvState {
                value: initial,
                connected: false,
                limits,
                severity: Severity::Invalid,
                value_observers: Vec::new(),
                connection_observers: Vec::new(),
                write_handler: None,
            })),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, PvState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Point-in-time view of value, connection state, severity, limits.
    pub fn snapshot(&self) -> PvSnapshot {
        let state = self.lock();
        PvSnapshot {
            value: state.value.clone(),
            connected: state.connected,
            severity: state.severity,
            limits: state.limits,
        }
    }

    pub fn value(&self) -> PvValue {
        self.lock().value.clone()
    }

    pub fn connected(&self) -> bool {
        self.lock().connected
    }

    pub fn severity(&self) -> Severity {
        self.lock().severity
    }

    pub fn limits(&self) -> AlarmLimits {
        self.lock().limits
    }

    /// Replace the alarm bands and re-derive severity from the cached
    /// value.
    pub fn set_limits(&self, limits: AlarmLimits) {
        let mut state = self.lock();
        state.limits = limits;
        if state.connected {
            state.severity = derive_severity(&state.value, &limits);
        }
    }

    /// Publish a new value. Observers are notified on the calling
    /// thread, outside the state lock.
    pub fn post(&self, value: PvValue) {
        let (observers, severity) = {
            let mut state = self.lock();
            state.severity = derive_severity(&value, &state.limits);
            state.value = value.clone();
            (state.value_observers.clone(), state.severity)
        };
        trace!(pv = self.name(), ?severity, "value posted");
        for observer in observers.into_iter().flatten() {
            observer(&self.name, &value, severity);
        }
    }

    /// Publish a connection-state change. A no-op when the state did
    /// not actually change.
    pub fn set_connected(&self, connected: bool) {
        let observers = {
            let mut state = self.lock();
            if state.connected == connected {
                return;
            }
            state.connected = connected;
            state.severity = if connected {
                derive_severity(&state.value, &state.limits)
            } else {
                Severity::Invalid
            };
            state.connection_observers.clone()
        };
        trace!(pv = self.name(), connected, "connection change");
        for observer in observers.into_iter().flatten() {
            observer(&self.name, connected);
        }
    }

    /// Write toward the device. Returns `false` when no handler is
    /// registered (read-only PV) or the handler rejected the value.
    pub fn put(&self, value: &PvValue) -> bool {
        let handler = self.lock().write_handler.clone();
        match handler {
            Some(handler) => handler(value),
            None => false,
        }
    }

    /// Install the device-side write handler.
    pub fn set_write_handler(&self, handler: WriteHandler) {
        self.lock().write_handler = Some(handler);
    }

    /// Register a value observer; the returned index can be passed to
    /// [`Pv::remove_value_observer`].
    pub fn add_value_observer(&self, observer: ValueObserver) -> usize {
        let mut state = self.lock();
        state.value_observers.push(Some(observer));
        state.value_observers.len() - 1
    }

    pub fn remove_value_observer(&self, index: usize) {
        let mut state = self.lock();
        if let Some(slot) = state.value_observers.get_mut(index) {
            *slot = None;
        }
    }

    /// Register a connection observer.
    pub fn add_connection_observer(&self, observer: ConnectionObserver) -> usize {
        let mut state = self.lock();
        state.connection_observers.push(Some(observer));
        state.connection_observers.len() - 1
    }
}

fn derive_severity(value: &PvValue, limits: &AlarmLimits) -> Severity {
    match value.as_f64() {
        Some(v) => limits.classify(v),
        // Arrays and strings carry no alarm bands.
        None => Severity::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn post_notifies_in_registration_order() {
        let pv = Pv::new("X:Current-Mon", PvValue::Float(0.0), AlarmLimits::unbounded());
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let log = Arc::clone(&log);
            pv.add_value_observer(Arc::new(move |_, _, _| {
                log.lock().unwrap().push(tag);
            }));
        }
        pv.post(PvValue::Float(1.0));
        assert_eq!(*log.lock().unwrap(), ["a", "b"]);
        assert_eq!(pv.value(), PvValue::Float(1.0));
    }

    #[test]
    fn severity_follows_limits() {
        let pv = Pv::new(
            "X:DiagCurrentDiff-Mon",
            PvValue::Float(0.0),
            AlarmLimits::symmetric(0.1, 0.5, 1.0),
        );
        pv.set_connected(true);
        pv.post(PvValue::Float(0.7));
        assert_eq!(pv.severity(), Severity::Minor);
        pv.post(PvValue::Float(2.0));
        assert_eq!(pv.severity(), Severity::Major);
        pv.post(PvValue::Float(0.0));
        assert_eq!(pv.severity(), Severity::None);
    }

    #[test]
    fn disconnect_marks_invalid_and_notifies_once() {
        let pv = Pv::new("X:Current-Mon", PvValue::Float(0.0), AlarmLimits::unbounded());
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        pv.add_connection_observer(Arc::new(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        pv.set_connected(true);
        pv.set_connected(true); // no change, no callback
        pv.set_connected(false);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(pv.severity(), Severity::Invalid);
    }

    #[test]
    fn put_requires_handler() {
        let pv = Pv::new("X:Current-SP", PvValue::Float(0.0), AlarmLimits::unbounded());
        assert!(!pv.put(&PvValue::Float(1.0)));
        pv.set_write_handler(Arc::new(|value| value.as_f64().is_some_and(|v| v >= 0.0)));
        assert!(pv.put(&PvValue::Float(1.0)));
        assert!(!pv.put(&PvValue::Float(-1.0)));
        // put never touches the cached value; only a posted readback does
        assert_eq!(pv.value(), PvValue::Float(0.0));
    }

    #[test]
    fn removed_observer_stays_silent() {
        let pv = Pv::new("X:Current-Mon", PvValue::Float(0.0), AlarmLimits::unbounded());
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let idx = pv.add_value_observer(Arc::new(move |_, _, _| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        pv.post(PvValue::Float(1.0));
        pv.remove_value_observer(idx);
        pv.post(PvValue::Float(2.0));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}

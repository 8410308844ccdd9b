//! The derived-PV engine.
//!
//! A [`ComputedPv`] owns an ordered list of source PV handles and a
//! [`Computer`] strategy. Source observers do O(1) work on the posting
//! thread; recomputation runs on the shared queue worker. Only updates
//! to the first source (the primary trigger) enqueue a recompute: when
//! several sources update together from one underlying scan cycle, the
//! primary's arrival triggers exactly one recomputation, and the other
//! sources are read at their newest cached values inside it.

use std::sync::{Arc, Mutex, Weak};

use ioc_common::pv::{AlarmLimits, PvValue, Severity};
use tracing::{debug, trace};

use crate::computer::Computer;
use crate::pv::Pv;
use crate::queue::QueueHandle;

/// Update event delivered to computed-PV observers.
#[derive(Debug, Clone)]
pub struct ComputedEvent {
    pub pvname: Arc<str>,
    pub value: PvValue,
    pub limits: AlarmLimits,
    pub severity: Severity,
}

/// Observer of computed-PV updates.
pub type ComputedObserver = Arc<dyn Fn(&ComputedEvent) + Send + Sync>;

struct ComputedState {
    value: Option<PvValue>,
    limits: AlarmLimits,
    observers: Vec<Option<ComputedObserver>>,
}

struct Inner {
    pvname: Arc<str>,
    computer: Arc<dyn Computer>,
    queue: QueueHandle,
    sources: Vec<Pv>,
    state: Mutex<ComputedState>,
}

/// A virtual PV whose value is a function of N underlying source PVs.
///
/// Created once per derived PV at IOC startup; lives for the process
/// lifetime.
#[derive(Clone)]
pub struct ComputedPv {
    inner: Arc<Inner>,
}

impl ComputedPv {
    /// Bind sources and start observing them.
    ///
    /// The order of `sources` is part of the contract with `computer`;
    /// index 0 is the primary trigger. When every source is already
    /// connected the initial alarm limits are computed synchronously.
    pub fn new(
        pvname: &str,
        computer: Arc<dyn Computer>,
        queue: QueueHandle,
        sources: Vec<Pv>,
    ) -> Self {
        let inner = Arc::new(Inner {
            pvname: Arc::from(pvname),
            computer,
            queue,
            sources,
            state: Mutex::new(ComputedState {
                value: None,
                limits: AlarmLimits::unbounded(),
                observers: Vec::new(),
            }),
        });
        let this = Self {
            inner: Arc::clone(&inner),
        };

        for (index, source) in inner.sources.iter().enumerate() {
            let weak: Weak<Inner> = Arc::downgrade(&inner);
            source.add_value_observer(Arc::new(move |name, value, _severity| {
                if let Some(inner) = weak.upgrade() {
                    Inner::value_update(&inner, index, name, value);
                }
            }));

            let weak: Weak<Inner> = Arc::downgrade(&inner);
            source.add_connection_observer(Arc::new(move |_, connected| {
                if let Some(inner) = weak.upgrade() {
                    Inner::connection_update(&inner, connected);
                }
            }));
        }

        if this.connected() {
            let limits = inner.computer.compute_limits(&this);
            inner.state.lock().unwrap_or_else(|e| e.into_inner()).limits = limits;
        }
        this
    }

    /// Derived PV name.
    pub fn name(&self) -> &str {
        &self.inner.pvname
    }

    /// Ordered source handles, for strategies.
    pub fn sources(&self) -> &[Pv] {
        &self.inner.sources
    }

    /// True iff every source PV is connected. The cached value is only
    /// meaningful while this holds.
    pub fn connected(&self) -> bool {
        self.inner.sources.iter().all(Pv::connected)
    }

    /// Latest computed value, if any computation has published yet.
    pub fn get(&self) -> Option<PvValue> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .value
            .clone()
    }

    /// Current alarm bands.
    pub fn limits(&self) -> AlarmLimits {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .limits
    }

    /// Delegate a client write to the strategy. The cached value is
    /// never touched here; it changes when the real PVs echo back
    /// through the next recomputation.
    pub fn put(&self, value: &PvValue) -> bool {
        self.inner.computer.compute_put(self, value)
    }

    /// Register an observer; observers receive every published update
    /// in registration order.
    pub fn add_observer(&self, observer: ComputedObserver) -> usize {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.observers.push(Some(observer));
        state.observers.len() - 1
    }

    pub fn remove_observer(&self, index: usize) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = state.observers.get_mut(index) {
            *slot = None;
        }
    }
}

impl Inner {
    /// Source value observer: runs on the posting thread, O(1).
    fn value_update(inner: &Arc<Inner>, index: usize, name: &str, value: &PvValue) {
        // Only the primary source triggers recomputation, and only
        // while every input can be trusted.
        if index != 0 {
            return;
        }
        let pv = ComputedPv {
            inner: Arc::clone(inner),
        };
        if !pv.connected() {
            return;
        }
        let name = name.to_string();
        let value = value.clone();
        let task_inner = Arc::clone(inner);
        let accepted = inner.queue.submit(move || {
            Inner::run_update(&task_inner, &name, &value);
        });
        if !accepted {
            trace!(pv = &*inner.pvname, "queue stopped; update dropped");
        }
    }

    /// Connection observer: on full recovery, recompute once and
    /// refresh limits; on loss, flag the cached value invalid.
    fn connection_update(inner: &Arc<Inner>, connected: bool) {
        let pv = ComputedPv {
            inner: Arc::clone(inner),
        };
        if connected && pv.connected() {
            debug!(pv = &*inner.pvname, "sources recovered; recomputing");
            let task_inner = Arc::clone(inner);
            inner.queue.submit(move || {
                let pv = ComputedPv {
                    inner: Arc::clone(&task_inner),
                };
                let limits = task_inner.computer.compute_limits(&pv);
                task_inner
                    .state
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .limits = limits;
                let primary = task_inner.sources[0].name().to_string();
                let value = task_inner.sources[0].value();
                Inner::run_update(&task_inner, &primary, &value);
            });
        } else if !connected {
            Inner::publish_invalid(inner);
        }
    }

    /// Recompute and publish. Queue-worker thread only.
    fn run_update(inner: &Arc<Inner>, updated: &str, value: &PvValue) {
        let pv = ComputedPv {
            inner: Arc::clone(inner),
        };
        let Some(update) = inner.computer.compute_update(&pv, updated, value) else {
            return;
        };

        let (event, observers) = {
            let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(limits) = update.limits {
                state.limits = limits;
            }
            state.value = Some(update.value.clone());
            let severity = match update.value.as_f64() {
                Some(v) => state.limits.classify(v),
                None => Severity::None,
            };
            (
                ComputedEvent {
                    pvname: Arc::clone(&inner.pvname),
                    value: update.value,
                    limits: state.limits,
                    severity,
                },
                state.observers.clone(),
            )
        };
        for observer in observers.into_iter().flatten() {
            observer(&event);
        }
    }

    /// A source dropped: surface the stale value as an invalid alarm
    /// rather than an exception.
    fn publish_invalid(inner: &Arc<Inner>) {
        let (event, observers) = {
            let state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
            let Some(value) = state.value.clone() else {
                return;
            };
            (
                ComputedEvent {
                    pvname: Arc::clone(&inner.pvname),
                    value,
                    limits: state.limits,
                    severity: Severity::Invalid,
                },
                state.observers.clone(),
            )
        };
        debug!(pv = &*inner.pvname, "source disconnected; value invalid");
        for observer in observers.into_iter().flatten() {
            observer(&event);
        }
    }
}

//! Strategy contract for derived-value computation.
//!
//! A computer is a stateless (or minimally-stateful) policy object. It
//! reads the current source values through the computed PV handed to it
//! and never mutates the computed PV directly; publication is the
//! engine's job, and writes to real PVs go through `compute_put`.

use ioc_common::pv::{AlarmLimits, PvValue};

use crate::computed::ComputedPv;

/// Result of one recomputation.
#[derive(Debug, Clone)]
pub struct ComputedUpdate {
    /// New derived value.
    pub value: PvValue,
    /// New alarm bands, when the computation also moves them.
    pub limits: Option<AlarmLimits>,
}

impl ComputedUpdate {
    pub fn value(value: PvValue) -> Self {
        Self {
            value,
            limits: None,
        }
    }
}

/// Capability set implemented by every derived-PV strategy.
///
/// The position of each source in the computed PV's ordered list is
/// part of the contract between the strategy and whoever wires the
/// computed PV up, so strategies expose their index constants.
pub trait Computer: Send + Sync {
    /// Recompute after a source update. Returning `None` suppresses
    /// publication.
    ///
    /// Runs on the queue worker thread, never on a source-PV observer
    /// thread. Source values are read on demand through
    /// [`ComputedPv::sources`]; the handles cache the latest value per
    /// PV, so inputs that updated together with the trigger are seen at
    /// their newest state.
    fn compute_update(
        &self,
        pv: &ComputedPv,
        updated: &str,
        value: &PvValue,
    ) -> Option<ComputedUpdate>;

    /// Propagate a client write to the underlying real PVs. The default
    /// rejects writes, since most derived PVs are monitors.
    fn compute_put(&self, pv: &ComputedPv, value: &PvValue) -> bool {
        let _ = (pv, value);
        false
    }

    /// Alarm bands for the derived PV, typically copied from a
    /// designated source.
    fn compute_limits(&self, pv: &ComputedPv) -> AlarmLimits;
}

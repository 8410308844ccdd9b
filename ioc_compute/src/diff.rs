//! Setpoint/readback difference strategy.
//!
//! Source order: `[setpoint, monitor]`. The derived value is
//! `monitor - setpoint`; publication is suppressed while either source
//! is disconnected, and the alarm bands are copied from the setpoint
//! source so the difference alarms on the same scale the setpoint is
//! configured with.

use ioc_common::pv::{AlarmLimits, PvValue};

use crate::computed::ComputedPv;
use crate::computer::{Computer, ComputedUpdate};

/// Index of the setpoint source (the primary trigger).
pub const SETPOINT: usize = 0;
/// Index of the measured-current source.
pub const MONITOR: usize = 1;

/// `DiagCurrentDiff-Mon` computer.
#[derive(Debug, Default)]
pub struct CurrentDiff;

impl Computer for CurrentDiff {
    fn compute_update(
        &self,
        pv: &ComputedPv,
        _updated: &str,
        _value: &PvValue,
    ) -> Option<ComputedUpdate> {
        let setpoint = pv.sources()[SETPOINT].snapshot();
        let monitor = pv.sources()[MONITOR].snapshot();
        if !setpoint.connected || !monitor.connected {
            return None;
        }
        let diff = monitor.value.as_f64()? - setpoint.value.as_f64()?;
        Some(ComputedUpdate::value(PvValue::Float(diff)))
    }

    fn compute_limits(&self, pv: &ComputedPv) -> AlarmLimits {
        pv.sources()[SETPOINT].limits()
    }
}

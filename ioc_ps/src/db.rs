//! Per-device PV database.
//!
//! Property names follow the `<device>:<property>` convention; the
//! database holds the property part only, and the application prefixes
//! the device name when registering handles with the server driver.

use ioc_common::csdev::{
    HARD_INTERLOCK_LABELS, OpModeTable, PWRSTATE_SEL_LABELS, PWRSTATE_STS_LABELS,
    SOFT_INTERLOCK_LABELS,
};
use ioc_common::db::{DbError, PvDatabase};
use ioc_common::pv::{AlarmLimits, PvDescriptor, PvValue};
use ioc_compute::PsStatusWord;

/// Elements in the ramp waveform PVs.
pub const WFM_POINTS: usize = 4000;

/// Current range configured for every supply served by this IOC, in
/// ampere. Per-type ranges would come from the device registry.
const CURRENT_RANGE: f64 = 10.0;

/// Alarm bands for the setpoint/readback difference, in ampere.
fn diff_limits() -> AlarmLimits {
    AlarmLimits::symmetric(0.05, 0.1, 0.5)
}

fn current_limits() -> AlarmLimits {
    AlarmLimits {
        hihi: CURRENT_RANGE,
        high: CURRENT_RANGE * 0.95,
        hilim: CURRENT_RANGE,
        lolim: -CURRENT_RANGE,
        low: -CURRENT_RANGE * 0.95,
        lolo: -CURRENT_RANGE,
    }
}

/// Build the PV set for one power supply. The operating-mode enum
/// labels come from the configured translation table so PVs and status
/// computation agree on index assignments.
pub fn device_db(version: &str, opmode: &OpModeTable) -> Result<PvDatabase, DbError> {
    let mut db = PvDatabase::new();

    db.insert(PvDescriptor::float("Current-SP", "A", 4, 0.0).with_limits(current_limits()))?;
    db.insert(
        PvDescriptor::float("Current-RB", "A", 4, 0.0)
            .with_limits(current_limits())
            .read_only(),
    )?;
    db.insert(
        PvDescriptor::float("CurrentRef-Mon", "A", 4, 0.0)
            .with_limits(current_limits())
            .read_only(),
    )?;
    db.insert(
        PvDescriptor::float("Current-Mon", "A", 4, 0.0)
            .with_limits(current_limits())
            .read_only(),
    )?;

    db.insert(PvDescriptor::enumerated("PwrState-Sel", PWRSTATE_SEL_LABELS, 0))?;
    db.insert(PvDescriptor::enumerated("PwrState-Sts", PWRSTATE_STS_LABELS, 0).read_only())?;
    db.insert(enum_pv("OpMode-Sel", opmode.sel_labels(), 0))?;
    db.insert(enum_pv("OpMode-Sts", opmode.sts_labels(), 0).read_only())?;

    db.insert(PvDescriptor::float_array("WfmData-SP", "A", WFM_POINTS))?;
    db.insert(PvDescriptor::float_array("WfmData-RB", "A", WFM_POINTS).read_only())?;

    // Interlock words are published as integers; the label lists are
    // served as separate constant PVs for client display.
    db.insert(int_pv("IntlkSoft-Mon"))?;
    db.insert(int_pv("IntlkHard-Mon"))?;
    db.insert(labels_pv("IntlkSoftLabels-Cte", SOFT_INTERLOCK_LABELS))?;
    db.insert(labels_pv("IntlkHardLabels-Cte", HARD_INTERLOCK_LABELS))?;

    // Command PV: each accepted write clears the latched interlocks and
    // bumps the execution counter.
    let mut reset = int_pv("Reset-Cmd");
    reset.read_only = false;
    db.insert(reset)?;

    db.insert(PvDescriptor::string("Version-Cte", version).read_only())?;

    // Computed diagnostics. The status word starts with the comm bits
    // raised: unknown state must never read as healthy.
    db.insert(
        PvDescriptor::float("DiagCurrentDiff-Mon", "A", 4, 0.0)
            .with_limits(diff_limits())
            .read_only(),
    )?;
    let mut status = int_pv("DiagStatus-Mon");
    status.initial = PvValue::Int(i64::from(
        (PsStatusWord::SOURCE_DISCONNECT | PsStatusWord::COMM_FAULT).bits(),
    ));
    db.insert(status)?;

    Ok(db)
}

fn enum_pv(name: &str, labels: &[String], initial: u16) -> PvDescriptor {
    let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
    PvDescriptor::enumerated(name, &labels, initial)
}

fn int_pv(name: &str) -> PvDescriptor {
    PvDescriptor {
        name: name.to_string(),
        ty: ioc_common::pv::PvType::Int,
        unit: String::new(),
        prec: 0,
        limits: AlarmLimits::unbounded(),
        enums: Vec::new(),
        count: 1,
        initial: PvValue::Int(0),
        read_only: true,
    }
}

fn labels_pv(name: &str, labels: &[&str]) -> PvDescriptor {
    PvDescriptor::string(name, &labels.join(";")).read_only()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_is_complete_and_valid() {
        let db = device_db("0.1.0", &OpModeTable::default()).unwrap();
        for name in [
            "Current-SP",
            "Current-RB",
            "CurrentRef-Mon",
            "Current-Mon",
            "PwrState-Sel",
            "PwrState-Sts",
            "OpMode-Sel",
            "OpMode-Sts",
            "WfmData-SP",
            "WfmData-RB",
            "IntlkSoft-Mon",
            "IntlkHard-Mon",
            "Reset-Cmd",
            "Version-Cte",
            "DiagCurrentDiff-Mon",
            "DiagStatus-Mon",
        ] {
            assert!(db.contains(name), "missing {name}");
        }
    }

    #[test]
    fn writability_split() {
        let db = device_db("0.1.0", &OpModeTable::default()).unwrap();
        assert!(!db.get("Current-SP").unwrap().read_only);
        assert!(!db.get("OpMode-Sel").unwrap().read_only);
        assert!(!db.get("WfmData-SP").unwrap().read_only);
        assert!(!db.get("Reset-Cmd").unwrap().read_only);
        assert!(db.get("Current-Mon").unwrap().read_only);
        assert!(db.get("DiagStatus-Mon").unwrap().read_only);
        assert!(db.get("Version-Cte").unwrap().read_only);
    }
}

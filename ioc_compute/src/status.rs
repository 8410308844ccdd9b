//! Power-supply status bitmask strategy.
//!
//! Aggregates the device's low-level PVs into one 8-bit fault word.
//! Policy is fail-on: unknown state is always reported as faulted,
//! never silently as healthy. A disconnected required source forces
//! the related bits and returns without evaluating downstream checks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use ioc_common::csdev::{OpModeTable, PwrStateSts};
use ioc_common::pv::{AlarmLimits, PvValue, Severity};
use tracing::debug;

use crate::computed::ComputedPv;
use crate::computer::{Computer, ComputedUpdate};
use crate::pv::PvSnapshot;

bitflags! {
    /// `DiagStatus-Mon` fault word. Bit positions are fixed by this
    /// implementation; clients must use the named constants.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PsStatusWord: u8 {
        /// A required source PV is disconnected.
        const SOURCE_DISCONNECT = 0x01;
        /// Communication with the device is not trustworthy.
        const COMM_FAULT        = 0x02;
        /// Power state is not On.
        const POWER_OFF         = 0x04;
        /// Reported operating mode disagrees with the selected one.
        const OPMODE_MISMATCH   = 0x08;
        /// Setpoint/readback difference out of tolerance (SlowRef only).
        const CURRENT_DIFF      = 0x10;
        /// Waveform deviates beyond the device-type tolerance (ramp only).
        const WFM_DIFF          = 0x20;
        /// A soft or hard interlock is raised.
        const INTERLOCK         = 0x40;
    }
}

/// Source indices expected by [`PsStatus`]. The wiring order of the
/// computed PV's sources must match.
pub mod source {
    /// `PwrState-Sts`, the primary trigger, posted every scan cycle.
    pub const PWRSTATE_STS: usize = 0;
    /// `OpMode-Sel`.
    pub const OPMODE_SEL: usize = 1;
    /// `OpMode-Sts`.
    pub const OPMODE_STS: usize = 2;
    /// `DiagCurrentDiff-Mon`; its alarm severity is what is checked.
    pub const CURRENT_DIFF: usize = 3;
    /// `WfmData-SP`.
    pub const WFM_SP: usize = 4;
    /// `WfmData-RB`.
    pub const WFM_RB: usize = 5;
    /// `IntlkSoft-Mon`.
    pub const INTLK_SOFT: usize = 6;
    /// `IntlkHard-Mon`.
    pub const INTLK_HARD: usize = 7;

    /// Number of sources.
    pub const COUNT: usize = 8;
}

/// Waveform-deviation tolerances by power-supply type, shared across
/// every status computer in the process.
///
/// The table lookup stands in for a (potentially expensive) naming-
/// service query, so resolved entries are cached per device type on
/// first use.
pub struct WfmToleranceCache {
    table: HashMap<String, f64>,
    cache: Mutex<HashMap<String, f64>>,
}

impl WfmToleranceCache {
    pub fn new(table: HashMap<String, f64>) -> Self {
        Self {
            table,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Tolerance for `pstype`.
    ///
    /// # Panics
    ///
    /// Panics on an unknown type, a programming-error-class failure:
    /// the device list referenced a type the tolerance table does not
    /// carry. The queue worker confines the panic to the one
    /// computation cycle.
    pub fn lookup(&self, pstype: &str) -> f64 {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tol) = cache.get(pstype) {
            return *tol;
        }
        let tol = match self.table.get(pstype) {
            Some(tol) => *tol,
            None => panic!("no waveform tolerance configured for power-supply type '{pstype}'"),
        };
        cache.insert(pstype.to_string(), tol);
        tol
    }
}

/// `DiagStatus-Mon` computer for one device.
pub struct PsStatus {
    pstype: String,
    opmode: Arc<OpModeTable>,
    tolerances: Arc<WfmToleranceCache>,
}

impl PsStatus {
    pub fn new(pstype: &str, opmode: Arc<OpModeTable>, tolerances: Arc<WfmToleranceCache>) -> Self {
        Self {
            pstype: pstype.to_string(),
            opmode,
            tolerances,
        }
    }

    fn word(word: PsStatusWord) -> Option<ComputedUpdate> {
        Some(ComputedUpdate::value(PvValue::Int(i64::from(word.bits()))))
    }
}

impl Computer for PsStatus {
    fn compute_update(
        &self,
        pv: &ComputedPv,
        _updated: &str,
        _value: &PvValue,
    ) -> Option<ComputedUpdate> {
        let sources = pv.sources();
        debug_assert_eq!(sources.len(), source::COUNT);
        let mut word = PsStatusWord::empty();

        // Power state. A dead primary means nothing downstream can be
        // trusted either.
        let pwr = sources[source::PWRSTATE_STS].snapshot();
        if !pwr.connected {
            word |= PsStatusWord::SOURCE_DISCONNECT | PsStatusWord::COMM_FAULT;
            return Self::word(word);
        }
        if pwr.value.as_enum() != Some(PwrStateSts::On as u16) {
            word |= PsStatusWord::POWER_OFF;
        }

        // Operating mode agreement, through the translation table.
        let sel = sources[source::OPMODE_SEL].snapshot();
        let sts = sources[source::OPMODE_STS].snapshot();
        if !sel.connected || !sts.connected {
            word |= PsStatusWord::SOURCE_DISCONNECT;
            return Self::word(word);
        }
        let sts_index = sts.value.as_enum();
        match (sel.value.as_enum(), sts_index) {
            (Some(sel_index), Some(sts_index))
                if self.opmode.expected_sts(sel_index) == Some(sts_index) => {}
            _ => word |= PsStatusWord::OPMODE_MISMATCH,
        }

        // Current difference: only meaningful holding a static setpoint.
        if sts_index.is_some_and(|s| self.opmode.is_slowref(s)) {
            let diff = sources[source::CURRENT_DIFF].snapshot();
            if !diff.connected || diff.severity != Severity::None {
                word |= PsStatusWord::CURRENT_DIFF;
            }
        }

        // Waveform agreement: only meaningful while ramping.
        if sts_index.is_some_and(|s| self.opmode.is_ramp(s)) {
            let tolerance = self.tolerances.lookup(&self.pstype);
            let wfm_sp = sources[source::WFM_SP].snapshot();
            let wfm_rb = sources[source::WFM_RB].snapshot();
            if !wfm_sp.connected || !wfm_rb.connected {
                word |= PsStatusWord::SOURCE_DISCONNECT | PsStatusWord::WFM_DIFF;
            } else if !waveforms_close(&wfm_sp, &wfm_rb, tolerance) {
                debug!(pv = pv.name(), tolerance, "waveform deviation");
                word |= PsStatusWord::WFM_DIFF;
            }
        }

        // Interlocks: an unreadable word counts as raised.
        for index in [source::INTLK_SOFT, source::INTLK_HARD] {
            let intlk = sources[index].snapshot();
            match (intlk.connected, intlk.value.as_f64()) {
                (true, Some(v)) if v == 0.0 => {}
                _ => word |= PsStatusWord::INTERLOCK,
            }
        }

        Self::word(word)
    }

    fn compute_limits(&self, _pv: &ComputedPv) -> AlarmLimits {
        // The fault word carries no analog alarm bands.
        AlarmLimits::unbounded()
    }
}

/// Element-wise closeness of two waveforms.
fn waveforms_close(a: &PvSnapshot, b: &PvSnapshot, tolerance: f64) -> bool {
    match (a.value.as_array(), b.value.as_array()) {
        (Some(a), Some(b)) => {
            a.len() == b.len()
                && a.iter()
                    .zip(b.iter())
                    .all(|(x, y)| (x - y).abs() <= tolerance)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pv::Pv;
    use crate::queue::TaskQueue;
    use ioc_common::csdev::OPMODE_SEL_LABELS;

    /// Sources wired in contract order, all connected and healthy:
    /// power on, OpMode SlowRef on both sides, zero diff, flat
    /// waveforms, clear interlocks.
    fn healthy_sources(opmode: &OpModeTable) -> Vec<Pv> {
        let slowref_sel = OPMODE_SEL_LABELS
            .iter()
            .position(|l| *l == "SlowRef")
            .unwrap() as u16;
        let slowref_sts = opmode.expected_sts(slowref_sel).unwrap();

        let pvs = vec![
            Pv::new(
                "PS-01:PwrState-Sts",
                PvValue::Enum(PwrStateSts::On as u16),
                AlarmLimits::unbounded(),
            ),
            Pv::new(
                "PS-01:OpMode-Sel",
                PvValue::Enum(slowref_sel),
                AlarmLimits::unbounded(),
            ),
            Pv::new(
                "PS-01:OpMode-Sts",
                PvValue::Enum(slowref_sts),
                AlarmLimits::unbounded(),
            ),
            Pv::new(
                "PS-01:DiagCurrentDiff-Mon",
                PvValue::Float(0.0),
                AlarmLimits::symmetric(0.05, 0.1, 0.5),
            ),
            Pv::new(
                "PS-01:WfmData-SP",
                PvValue::FloatArray(vec![0.0; 4]),
                AlarmLimits::unbounded(),
            ),
            Pv::new(
                "PS-01:WfmData-RB",
                PvValue::FloatArray(vec![0.0; 4]),
                AlarmLimits::unbounded(),
            ),
            Pv::new(
                "PS-01:IntlkSoft-Mon",
                PvValue::Int(0),
                AlarmLimits::unbounded(),
            ),
            Pv::new(
                "PS-01:IntlkHard-Mon",
                PvValue::Int(0),
                AlarmLimits::unbounded(),
            ),
        ];
        for pv in &pvs {
            pv.set_connected(true);
        }
        pvs
    }

    fn status_computer(opmode: &Arc<OpModeTable>) -> PsStatus {
        let mut table = HashMap::new();
        table.insert("fbp".to_string(), 0.5);
        PsStatus::new(
            "fbp",
            Arc::clone(opmode),
            Arc::new(WfmToleranceCache::new(table)),
        )
    }

    fn word_of(update: ComputedUpdate) -> PsStatusWord {
        match update.value {
            PvValue::Int(bits) => PsStatusWord::from_bits_truncate(bits as u8),
            other => panic!("status must be an int word, got {other:?}"),
        }
    }

    fn build(
        sources: Vec<Pv>,
        computer: PsStatus,
        queue: &TaskQueue,
    ) -> (ComputedPv, Arc<PsStatus>) {
        let computer = Arc::new(computer);
        let pv = ComputedPv::new(
            "PS-01:DiagStatus-Mon",
            Arc::clone(&computer) as Arc<dyn Computer>,
            queue.handle(),
            sources,
        );
        (pv, computer)
    }

    #[test]
    fn all_healthy_is_zero() {
        let queue = TaskQueue::start("status-test");
        let opmode = Arc::new(OpModeTable::default());
        let sources = healthy_sources(&opmode);
        let (pv, computer) = build(sources, status_computer(&opmode), &queue);

        let update = computer
            .compute_update(&pv, "PS-01:PwrState-Sts", &pv.sources()[0].value())
            .unwrap();
        assert_eq!(word_of(update), PsStatusWord::empty());
        queue.stop();
    }

    #[test]
    fn primary_disconnect_forces_comm_bits_and_short_circuits() {
        let queue = TaskQueue::start("status-test");
        let opmode = Arc::new(OpModeTable::default());
        let sources = healthy_sources(&opmode);
        sources[source::PWRSTATE_STS].set_connected(false);
        // Break something downstream too; it must not be evaluated.
        sources[source::INTLK_HARD].post(PvValue::Int(0xFF));
        let (pv, computer) = build(sources, status_computer(&opmode), &queue);

        let update = computer
            .compute_update(&pv, "PS-01:PwrState-Sts", &PvValue::Enum(0))
            .unwrap();
        assert_eq!(
            word_of(update),
            PsStatusWord::SOURCE_DISCONNECT | PsStatusWord::COMM_FAULT
        );
        queue.stop();
    }

    #[test]
    fn power_off_and_opmode_mismatch() {
        let queue = TaskQueue::start("status-test");
        let opmode = Arc::new(OpModeTable::default());
        let sources = healthy_sources(&opmode);
        sources[source::PWRSTATE_STS].post(PvValue::Enum(PwrStateSts::Off as u16));
        // Sts claims ramping while Sel asks for SlowRef.
        sources[source::OPMODE_STS].post(PvValue::Enum(6));
        let (pv, computer) = build(sources, status_computer(&opmode), &queue);

        let update = computer
            .compute_update(&pv, "PS-01:PwrState-Sts", &pv.sources()[0].value())
            .unwrap();
        let word = word_of(update);
        assert!(word.contains(PsStatusWord::POWER_OFF));
        assert!(word.contains(PsStatusWord::OPMODE_MISMATCH));
        queue.stop();
    }

    #[test]
    fn current_diff_checked_only_in_slowref() {
        let queue = TaskQueue::start("status-test");
        let opmode = Arc::new(OpModeTable::default());

        // In SlowRef: a minor-severity diff raises the bit.
        let sources = healthy_sources(&opmode);
        sources[source::CURRENT_DIFF].post(PvValue::Float(0.2));
        let (pv, computer) = build(sources, status_computer(&opmode), &queue);
        let word = word_of(
            computer
                .compute_update(&pv, "PS-01:PwrState-Sts", &pv.sources()[0].value())
                .unwrap(),
        );
        assert!(word.contains(PsStatusWord::CURRENT_DIFF));

        // Ramping: the same diff is ignored.
        let sources = healthy_sources(&opmode);
        sources[source::CURRENT_DIFF].post(PvValue::Float(0.2));
        sources[source::OPMODE_SEL].post(PvValue::Enum(3)); // RmpWfm
        sources[source::OPMODE_STS].post(PvValue::Enum(6)); // RmpWfm
        let (pv, computer) = build(sources, status_computer(&opmode), &queue);
        let word = word_of(
            computer
                .compute_update(&pv, "PS-01:PwrState-Sts", &pv.sources()[0].value())
                .unwrap(),
        );
        assert!(!word.contains(PsStatusWord::CURRENT_DIFF));
        queue.stop();
    }

    #[test]
    fn waveform_deviation_checked_only_while_ramping() {
        let queue = TaskQueue::start("status-test");
        let opmode = Arc::new(OpModeTable::default());
        let sources = healthy_sources(&opmode);
        sources[source::OPMODE_SEL].post(PvValue::Enum(3)); // RmpWfm
        sources[source::OPMODE_STS].post(PvValue::Enum(6)); // RmpWfm
        sources[source::WFM_RB].post(PvValue::FloatArray(vec![0.0, 2.0, 0.0, 0.0]));
        let (pv, computer) = build(sources, status_computer(&opmode), &queue);

        let word = word_of(
            computer
                .compute_update(&pv, "PS-01:PwrState-Sts", &pv.sources()[0].value())
                .unwrap(),
        );
        assert!(word.contains(PsStatusWord::WFM_DIFF));
        queue.stop();
    }

    #[test]
    fn interlock_or_unreadable_word_raises_bit() {
        let queue = TaskQueue::start("status-test");
        let opmode = Arc::new(OpModeTable::default());

        let sources = healthy_sources(&opmode);
        sources[source::INTLK_SOFT].post(PvValue::Int(0x04));
        let (pv, computer) = build(sources, status_computer(&opmode), &queue);
        let word = word_of(
            computer
                .compute_update(&pv, "PS-01:PwrState-Sts", &pv.sources()[0].value())
                .unwrap(),
        );
        assert!(word.contains(PsStatusWord::INTERLOCK));

        // Disconnected interlock source counts as faulted.
        let sources = healthy_sources(&opmode);
        sources[source::INTLK_HARD].set_connected(false);
        let (pv, computer) = build(sources, status_computer(&opmode), &queue);
        let word = word_of(
            computer
                .compute_update(&pv, "PS-01:PwrState-Sts", &pv.sources()[0].value())
                .unwrap(),
        );
        assert!(word.contains(PsStatusWord::INTERLOCK));
        queue.stop();
    }

    #[test]
    fn tolerance_cache_hits_after_first_lookup() {
        let mut table = HashMap::new();
        table.insert("fbp".to_string(), 0.5);
        let cache = WfmToleranceCache::new(table);
        assert_eq!(cache.lookup("fbp"), 0.5);
        assert_eq!(cache.lookup("fbp"), 0.5);
    }

    #[test]
    #[should_panic(expected = "no waveform tolerance configured")]
    fn unknown_pstype_is_a_programming_error() {
        let cache = WfmToleranceCache::new(HashMap::new());
        cache.lookup("fac");
    }
}

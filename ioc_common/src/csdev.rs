//! Control-system device enums and translation tables.
//!
//! Power state and operating mode are exposed as `-Sel`/`-Sts` enum PV
//! pairs whose index assignments come from a configurable table — the
//! values below are the shipped defaults, and `devices.toml` may replace
//! them. Status computations must go through [`OpModeTable`] rather than
//! comparing raw indices.

use bitflags::bitflags;
use serde::Deserialize;

// ─── Power State ────────────────────────────────────────────────────

/// `PwrState-Sel` labels, in index order.
pub const PWRSTATE_SEL_LABELS: &[&str] = &["Off", "On"];

/// `PwrState-Sts` labels, in index order.
pub const PWRSTATE_STS_LABELS: &[&str] = &["Off", "On", "Initializing"];

/// Selected power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PwrStateSel {
    Off = 0,
    On = 1,
}

impl PwrStateSel {
    pub fn from_index(index: u16) -> Option<Self> {
        match index {
            0 => Some(Self::Off),
            1 => Some(Self::On),
            _ => None,
        }
    }
}

/// Reported power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PwrStateSts {
    Off = 0,
    On = 1,
    Initializing = 2,
}

impl PwrStateSts {
    pub fn from_index(index: u16) -> Option<Self> {
        match index {
            0 => Some(Self::Off),
            1 => Some(Self::On),
            2 => Some(Self::Initializing),
            _ => None,
        }
    }
}

// ─── Operating Mode ─────────────────────────────────────────────────

/// `OpMode-Sel` labels, in index order.
pub const OPMODE_SEL_LABELS: &[&str] = &[
    "SlowRef",
    "SlowRefSync",
    "Cycle",
    "RmpWfm",
    "MigWfm",
    "FastRef",
];

/// `OpMode-Sts` labels, in index order. The status enum carries three
/// leading states the selection enum does not have.
pub const OPMODE_STS_LABELS: &[&str] = &[
    "Off",
    "Interlock",
    "Initializing",
    "SlowRef",
    "SlowRefSync",
    "Cycle",
    "RmpWfm",
    "MigWfm",
    "FastRef",
];

/// Translation table between `OpMode-Sel` and `OpMode-Sts` index spaces.
///
/// Loaded from `devices.toml` when present; [`OpModeTable::default`]
/// ships the standard assignment mapping each Sel label to the Sts label
/// of the same name. Derived indices for the SlowRef and ramp states are
/// resolved from labels once, at construction.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "OpModeTableRaw")]
pub struct OpModeTable {
    sel_labels: Vec<String>,
    sts_labels: Vec<String>,
    sel_to_sts: Vec<u16>,
    slowref_sts: Option<u16>,
    ramp_sts: Vec<u16>,
}

/// TOML shape of the table, before label resolution.
#[derive(Debug, Clone, Deserialize)]
struct OpModeTableRaw {
    sel_labels: Vec<String>,
    sts_labels: Vec<String>,
    sel_to_sts: Vec<u16>,
}

impl TryFrom<OpModeTableRaw> for OpModeTable {
    type Error = String;

    fn try_from(raw: OpModeTableRaw) -> Result<Self, Self::Error> {
        OpModeTable::new(raw.sel_labels, raw.sts_labels, raw.sel_to_sts)
    }
}

impl OpModeTable {
    /// Build and cross-check a table.
    ///
    /// # Errors
    ///
    /// Rejects a `sel_to_sts` map whose length differs from the Sel
    /// label list or that points outside the Sts label list.
    pub fn new(
        sel_labels: Vec<String>,
        sts_labels: Vec<String>,
        sel_to_sts: Vec<u16>,
    ) -> Result<Self, String> {
        if sel_to_sts.len() != sel_labels.len() {
            return Err(format!(
                "sel_to_sts has {} entries for {} Sel labels",
                sel_to_sts.len(),
                sel_labels.len()
            ));
        }
        if let Some(&bad) = sel_to_sts
            .iter()
            .find(|&&sts| usize::from(sts) >= sts_labels.len())
        {
            return Err(format!("sel_to_sts entry {bad} outside Sts label list"));
        }
        let index_of = |label: &str| -> Option<u16> {
            sts_labels
                .iter()
                .position(|l| l == label)
                .map(|i| i as u16)
        };
        let slowref_sts = index_of("SlowRef");
        let ramp_sts = ["RmpWfm", "MigWfm"]
            .iter()
            .filter_map(|l| index_of(l))
            .collect();
        Ok(Self {
            sel_labels,
            sts_labels,
            sel_to_sts,
            slowref_sts,
            ramp_sts,
        })
    }

    pub fn sel_labels(&self) -> &[String] {
        &self.sel_labels
    }

    pub fn sts_labels(&self) -> &[String] {
        &self.sts_labels
    }

    /// Sts index a healthy device reports after selecting `sel`.
    pub fn expected_sts(&self, sel: u16) -> Option<u16> {
        self.sel_to_sts.get(usize::from(sel)).copied()
    }

    /// True when `sts` is the static-setpoint state.
    pub fn is_slowref(&self, sts: u16) -> bool {
        self.slowref_sts == Some(sts)
    }

    /// True when `sts` is one of the waveform-ramp states.
    pub fn is_ramp(&self, sts: u16) -> bool {
        self.ramp_sts.contains(&sts)
    }
}

impl Default for OpModeTable {
    fn default() -> Self {
        let sel: Vec<String> = OPMODE_SEL_LABELS.iter().map(|s| s.to_string()).collect();
        let sts: Vec<String> = OPMODE_STS_LABELS.iter().map(|s| s.to_string()).collect();
        let map = sel
            .iter()
            .map(|label| {
                sts.iter()
                    .position(|l| l == label)
                    .map(|i| i as u16)
                    .unwrap_or(0)
            })
            .collect();
        // Label lists above always cross-resolve.
        Self::new(sel, sts, map).unwrap_or_else(|e| unreachable!("default table invalid: {e}"))
    }
}

// ─── Interlocks ─────────────────────────────────────────────────────

bitflags! {
    /// Soft interlock word reported by the controller firmware.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SoftInterlock: u32 {
        /// Heat-sink overtemperature.
        const HEATSINK_OVERTEMP   = 0x0000_0001;
        /// Inductor overtemperature.
        const INDUCTOR_OVERTEMP   = 0x0000_0002;
        /// Relay contact fault.
        const RELAY_FAULT         = 0x0000_0004;
        /// External interlock input asserted.
        const EXTERNAL            = 0x0000_0008;
        /// Rack door open.
        const RACK_DOOR_OPEN      = 0x0000_0010;
    }
}

bitflags! {
    /// Hard interlock word reported by the controller firmware.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HardInterlock: u32 {
        /// Load overcurrent.
        const LOAD_OVERCURRENT    = 0x0000_0001;
        /// Load overvoltage.
        const LOAD_OVERVOLTAGE    = 0x0000_0002;
        /// DC-link overvoltage.
        const DCLINK_OVERVOLTAGE  = 0x0000_0004;
        /// DC-link undervoltage.
        const DCLINK_UNDERVOLTAGE = 0x0000_0008;
        /// DC-link input relay fault.
        const DCLINK_RELAY_FAULT  = 0x0000_0010;
        /// Input fuse blown.
        const FUSE_FAULT          = 0x0000_0020;
        /// Gate-driver fault.
        const DRIVER_FAULT        = 0x0000_0040;
    }
}

/// Labels for the soft interlock bits, in bit order.
pub const SOFT_INTERLOCK_LABELS: &[&str] = &[
    "Heat-Sink Overtemperature",
    "Inductor Overtemperature",
    "Relay Fault",
    "External Interlock",
    "Rack Door Open",
];

/// Labels for the hard interlock bits, in bit order.
pub const HARD_INTERLOCK_LABELS: &[&str] = &[
    "Load Overcurrent",
    "Load Overvoltage",
    "DC-Link Overvoltage",
    "DC-Link Undervoltage",
    "DC-Link Relay Fault",
    "Fuse Fault",
    "Driver Fault",
];

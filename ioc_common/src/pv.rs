//! Typed process-variable descriptors, values and alarm limits.
//!
//! The PV "type" is a closed enum rather than a free-form string, and
//! every descriptor is validated at construction time: an enum PV must
//! carry labels, an array PV a positive element count, and limit bands
//! must be ordered.

use serde::Serialize;

// ─── Value Model ────────────────────────────────────────────────────

/// Closed set of PV value kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PvType {
    Float,
    Int,
    Enum,
    FloatArray,
    Str,
}

impl std::fmt::Display for PvType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Float => "float",
            Self::Int => "int",
            Self::Enum => "enum",
            Self::FloatArray => "float_array",
            Self::Str => "str",
        };
        f.write_str(s)
    }
}

/// A PV value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PvValue {
    Float(f64),
    Int(i64),
    Enum(u16),
    FloatArray(Vec<f64>),
    Str(String),
}

impl PvValue {
    /// Kind tag of this value.
    pub fn pv_type(&self) -> PvType {
        match self {
            Self::Float(_) => PvType::Float,
            Self::Int(_) => PvType::Int,
            Self::Enum(_) => PvType::Enum,
            Self::FloatArray(_) => PvType::FloatArray,
            Self::Str(_) => PvType::Str,
        }
    }

    /// Numeric view for scalar values; `None` for arrays and strings.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Enum(v) => Some(f64::from(*v)),
            Self::FloatArray(_) | Self::Str(_) => None,
        }
    }

    /// Enum index view.
    pub fn as_enum(&self) -> Option<u16> {
        match self {
            Self::Enum(v) => Some(*v),
            Self::Int(v) => u16::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Array view.
    pub fn as_array(&self) -> Option<&[f64]> {
        match self {
            Self::FloatArray(v) => Some(v),
            _ => None,
        }
    }
}

// ─── Alarm Model ────────────────────────────────────────────────────

/// Alarm severity ladder, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Value within all bands.
    #[default]
    None,
    /// Warning band exceeded.
    Minor,
    /// Alarm band exceeded.
    Major,
    /// Value cannot be trusted (source disconnected or stale).
    Invalid,
}

/// Six-field alarm/warning/display band:
/// upper alarm, upper warning, upper display, lower display, lower
/// warning, lower alarm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AlarmLimits {
    pub hihi: f64,
    pub high: f64,
    pub hilim: f64,
    pub lolim: f64,
    pub low: f64,
    pub lolo: f64,
}

impl AlarmLimits {
    /// Limits that never raise an alarm.
    pub const fn unbounded() -> Self {
        Self {
            hihi: f64::INFINITY,
            high: f64::INFINITY,
            hilim: f64::INFINITY,
            lolim: f64::NEG_INFINITY,
            low: f64::NEG_INFINITY,
            lolo: f64::NEG_INFINITY,
        }
    }

    /// Symmetric band around zero: display at ±`disp`, warning at
    /// ±`warn`, alarm at ±`alarm`.
    pub const fn symmetric(disp: f64, warn: f64, alarm: f64) -> Self {
        Self {
            hihi: alarm,
            high: warn,
            hilim: disp,
            lolim: -disp,
            low: -warn,
            lolo: -alarm,
        }
    }

    /// True when the upper fields are non-decreasing downward and lower
    /// fields non-increasing upward.
    pub fn is_ordered(&self) -> bool {
        self.hihi >= self.high && self.low >= self.lolo && self.hilim >= self.lolim
    }

    /// Severity of a scalar value against these bands.
    pub fn classify(&self, value: f64) -> Severity {
        if value >= self.hihi || value <= self.lolo {
            Severity::Major
        } else if value >= self.high || value <= self.low {
            Severity::Minor
        } else {
            Severity::None
        }
    }
}

impl Default for AlarmLimits {
    fn default() -> Self {
        Self::unbounded()
    }
}

// ─── Descriptors ────────────────────────────────────────────────────

/// Descriptor validation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("PV name cannot be empty")]
    EmptyName,

    #[error("PV '{name}': initial value kind {actual} does not match declared type {declared}")]
    TypeMismatch {
        name: String,
        declared: PvType,
        actual: PvType,
    },

    #[error("PV '{name}': enum type requires at least one label")]
    MissingEnumLabels { name: String },

    #[error("PV '{name}': initial enum index {index} outside label list of {len}")]
    EnumIndexOutOfRange {
        name: String,
        index: u16,
        len: usize,
    },

    #[error("PV '{name}': array element count must be positive")]
    BadArrayCount { name: String },

    #[error("PV '{name}': alarm limit bands out of order")]
    LimitsOutOfOrder { name: String },
}

/// A strongly-typed PV descriptor: name, type tag, constraints and
/// initial value. Collected into a [`PvDatabase`](crate::db::PvDatabase)
/// at IOC startup.
#[derive(Debug, Clone, Serialize)]
pub struct PvDescriptor {
    /// Property name, e.g. `Current-SP`.
    pub name: String,
    /// Value kind.
    pub ty: PvType,
    /// Engineering unit, empty when dimensionless.
    pub unit: String,
    /// Display precision for floats.
    pub prec: u8,
    /// Alarm bands.
    pub limits: AlarmLimits,
    /// Enum labels; only meaningful for [`PvType::Enum`].
    pub enums: Vec<String>,
    /// Element count; only meaningful for [`PvType::FloatArray`].
    pub count: usize,
    /// Value published before the first device update.
    pub initial: PvValue,
    /// Reject writes from clients.
    pub read_only: bool,
}

impl PvDescriptor {
    /// A scalar float PV.
    pub fn float(name: &str, unit: &str, prec: u8, initial: f64) -> Self {
        Self {
            name: name.to_string(),
            ty: PvType::Float,
            unit: unit.to_string(),
            prec,
            limits: AlarmLimits::unbounded(),
            enums: Vec::new(),
            count: 1,
            initial: PvValue::Float(initial),
            read_only: false,
        }
    }

    /// An enum PV with the given labels.
    pub fn enumerated(name: &str, labels: &[&str], initial: u16) -> Self {
        Self {
            name: name.to_string(),
            ty: PvType::Enum,
            unit: String::new(),
            prec: 0,
            limits: AlarmLimits::unbounded(),
            enums: labels.iter().map(|s| s.to_string()).collect(),
            count: 1,
            initial: PvValue::Enum(initial),
            read_only: false,
        }
    }

    /// A waveform PV of `count` float elements, initialized to zero.
    pub fn float_array(name: &str, unit: &str, count: usize) -> Self {
        Self {
            name: name.to_string(),
            ty: PvType::FloatArray,
            unit: unit.to_string(),
            prec: 4,
            limits: AlarmLimits::unbounded(),
            enums: Vec::new(),
            count,
            initial: PvValue::FloatArray(vec![0.0; count]),
            read_only: false,
        }
    }

    /// A string constant PV.
    pub fn string(name: &str, initial: &str) -> Self {
        Self {
            name: name.to_string(),
            ty: PvType::Str,
            unit: String::new(),
            prec: 0,
            limits: AlarmLimits::unbounded(),
            enums: Vec::new(),
            count: 1,
            initial: PvValue::Str(initial.to_string()),
            read_only: false,
        }
    }

    /// Set the alarm bands.
    pub fn with_limits(mut self, limits: AlarmLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Mark the PV read-only toward clients.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Validate internal consistency.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.name.is_empty() {
            return Err(DescriptorError::EmptyName);
        }
        if self.initial.pv_type() != self.ty {
            return Err(DescriptorError::TypeMismatch {
                name: self.name.clone(),
                declared: self.ty,
                actual: self.initial.pv_type(),
            });
        }
        if self.ty == PvType::Enum {
            if self.enums.is_empty() {
                return Err(DescriptorError::MissingEnumLabels {
                    name: self.name.clone(),
                });
            }
            if let PvValue::Enum(index) = &self.initial
                && usize::from(*index) >= self.enums.len()
            {
                return Err(DescriptorError::EnumIndexOutOfRange {
                    name: self.name.clone(),
                    index: *index,
                    len: self.enums.len(),
                });
            }
        }
        if self.ty == PvType::FloatArray && self.count == 0 {
            return Err(DescriptorError::BadArrayCount {
                name: self.name.clone(),
            });
        }
        if !self.limits.is_ordered() {
            return Err(DescriptorError::LimitsOutOfOrder {
                name: self.name.clone(),
            });
        }
        Ok(())
    }
}

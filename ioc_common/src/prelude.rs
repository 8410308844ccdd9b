//! Common re-exports for convenience.

pub use crate::config::{ConfigError, ConfigLoader, FullConfig, IocConfig, load_config_dir};
pub use crate::csdev::{HardInterlock, OpModeTable, PwrStateSel, PwrStateSts, SoftInterlock};
pub use crate::db::{DbError, PvDatabase};
pub use crate::pv::{AlarmLimits, PvDescriptor, PvType, PvValue, Severity};

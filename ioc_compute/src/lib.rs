//! Computed-PV aggregation engine.
//!
//! Maintains derived PVs whose values are pure functions of an ordered
//! list of underlying PVs. Recomputation is triggered by updates to the
//! *primary* source (index 0) and strictly serialized through a single
//! worker queue: at most one recomputation is in flight across every
//! computed PV sharing the queue, trading throughput for determinism.
//!
//! Thread affinity: source-PV observers fire on the thread that posted
//! the update and must only do O(1) work — the engine's own observer
//! just checks the primary index and hands the recomputation off to the
//! queue worker.
//!
//! # Module Structure
//!
//! - [`queue`] - Single-worker FIFO task queue with start/stop lifecycle
//! - [`pv`] - Observable process-variable handles
//! - [`computed`] - The derived-PV engine
//! - [`computer`] - Strategy contract for derived-value computation
//! - [`diff`] - Setpoint/readback difference strategy
//! - [`status`] - Power-supply status bitmask strategy

pub mod computed;
pub mod computer;
pub mod diff;
pub mod pv;
pub mod queue;
pub mod status;

pub use computed::{ComputedEvent, ComputedPv};
pub use computer::{Computer, ComputedUpdate};
pub use diff::CurrentDiff;
pub use pv::{Pv, PvSnapshot};
pub use queue::{QueueHandle, TaskQueue};
pub use status::{PsStatus, PsStatusWord, WfmToleranceCache};

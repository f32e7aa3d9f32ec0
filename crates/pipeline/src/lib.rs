//! Reactive core of the job tracker: the status counter trigger, the
//! drag-and-drop transition check and the runtime that delivers job write
//! snapshots to registered triggers.

pub mod aggregator;
pub mod change;
pub mod transition;
pub mod trigger;

pub use aggregator::{plan_adjustments, StatAdjustment, StatsStore, StatusAggregator};
pub use change::JobChange;
pub use transition::{evaluate_drop, plan_drop, PlannedMove};
pub use trigger::{
    ChangeFeed, ChangeReceiver, PathPattern, RetryPolicy, TriggerContext, TriggerRuntime,
    WriteTrigger,
};

/// Document path pattern every job write is published under.
pub const JOBS_PATTERN: &str = "jobs/{jobId}";

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::domain::{Job, JobStatus, UserId};
use tracing::debug;

use crate::{
    change::JobChange,
    trigger::{TriggerContext, WriteTrigger},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatAdjustment {
    pub status: JobStatus,
    pub delta: i64,
}

impl StatAdjustment {
    pub fn increment(status: JobStatus) -> Self {
        Self { status, delta: 1 }
    }

    pub fn decrement(status: JobStatus) -> Self {
        Self { status, delta: -1 }
    }
}

/// Counter adjustments implied by one job write, keyed to the owning user.
///
/// A delete takes one off the old status. Otherwise the old status (if any
/// and different) loses one and the new status gains one. Edits that leave
/// the status alone yield no adjustment. Returns `None` when neither
/// snapshot is present.
pub fn plan_adjustments(
    before: Option<&Job>,
    after: Option<&Job>,
) -> Option<(UserId, Vec<StatAdjustment>)> {
    let Some(after) = after else {
        let before = before?;
        return Some((
            before.owner.clone(),
            vec![StatAdjustment::decrement(before.status)],
        ));
    };

    let previous = before.map(|job| job.status);
    let mut adjustments = Vec::with_capacity(2);
    if let Some(previous) = previous.filter(|status| *status != after.status) {
        adjustments.push(StatAdjustment::decrement(previous));
    }
    if previous != Some(after.status) {
        adjustments.push(StatAdjustment::increment(after.status));
    }
    Some((after.owner.clone(), adjustments))
}

/// Counter storage the aggregator writes through.
#[async_trait]
pub trait StatsStore: Send + Sync {
    /// Applies every adjustment as one atomic batch, or none of them.
    /// Each adjustment is an in-place `count + delta`, creating the counter
    /// on first use.
    async fn apply_stat_adjustments(
        &self,
        owner: &UserId,
        adjustments: &[StatAdjustment],
    ) -> Result<()>;
}

/// Keeps the per-user, per-status counters in step with job writes.
pub struct StatusAggregator<S> {
    store: S,
}

impl<S: StatsStore> StatusAggregator<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn apply(&self, change: &JobChange) -> Result<()> {
        let Some((owner, adjustments)) =
            plan_adjustments(change.before.as_ref(), change.after.as_ref())
        else {
            return Ok(());
        };
        if adjustments.is_empty() {
            debug!(job_id = %change.job_id, "status unchanged; counters untouched");
            return Ok(());
        }

        self.store
            .apply_stat_adjustments(&owner, &adjustments)
            .await
            .with_context(|| {
                format!(
                    "failed to adjust status counters for job {} (owner {owner})",
                    change.job_id
                )
            })?;
        debug!(job_id = %change.job_id, %owner, ?adjustments, "status counters adjusted");
        Ok(())
    }
}

#[async_trait]
impl<S: StatsStore> WriteTrigger for StatusAggregator<S> {
    fn name(&self) -> &str {
        "update_job_stats"
    }

    async fn on_write(&self, change: &JobChange, _ctx: &TriggerContext) -> Result<()> {
        self.apply(change).await
    }
}

#[cfg(test)]
#[path = "tests/aggregator_tests.rs"]
mod tests;

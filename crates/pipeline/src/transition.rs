use std::future::Future;

use shared::{
    domain::{JobId, JobStatus, JobSummary},
    protocol::{DropEvent, DropIgnoredReason, DropOutcome},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMove {
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Decides what a drop means without touching anything.
pub fn plan_drop(jobs: &[JobSummary], event: &DropEvent) -> Result<PlannedMove, DropIgnoredReason> {
    let over = event.over.as_ref().ok_or(DropIgnoredReason::NoTarget)?;
    if over.id == event.active.id {
        return Err(DropIgnoredReason::DroppedOnSelf);
    }

    let target: JobStatus = over
        .id
        .parse()
        .map_err(|_| DropIgnoredReason::NotAStatus)?;
    let dragged = jobs
        .iter()
        .find(|job| job.id.as_str() == event.active.id)
        .ok_or(DropIgnoredReason::UnknownJob)?;
    if dragged.status == target {
        return Err(DropIgnoredReason::SameStatus);
    }

    Ok(PlannedMove {
        job_id: dragged.id.clone(),
        from: dragged.status,
        to: target,
    })
}

/// Handles the end of a drag on the pipeline board. When the drop names a
/// different status for a known job, `update_status` runs exactly once and
/// its error is returned as is; every other drop is a no-op.
pub async fn evaluate_drop<F, Fut, E>(
    jobs: &[JobSummary],
    event: &DropEvent,
    update_status: F,
) -> Result<DropOutcome, E>
where
    F: FnOnce(JobId, JobStatus) -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    let planned = match plan_drop(jobs, event) {
        Ok(planned) => planned,
        Err(reason) => return Ok(DropOutcome::Ignored { reason }),
    };

    update_status(planned.job_id.clone(), planned.to).await?;
    Ok(DropOutcome::Moved {
        job_id: planned.job_id,
        from: planned.from,
        to: planned.to,
    })
}

#[cfg(test)]
#[path = "tests/transition_tests.rs"]
mod tests;

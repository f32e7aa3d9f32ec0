use shared::domain::{Job, JobId, UserId};

/// Snapshot pair of a single job write: the record immediately before the
/// write (absent on create) and immediately after (absent on delete).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobChange {
    pub job_id: JobId,
    pub before: Option<Job>,
    pub after: Option<Job>,
}

impl JobChange {
    pub fn created(job: Job) -> Self {
        Self {
            job_id: job.id.clone(),
            before: None,
            after: Some(job),
        }
    }

    pub fn updated(before: Job, after: Job) -> Self {
        Self {
            job_id: after.id.clone(),
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn deleted(before: Job) -> Self {
        Self {
            job_id: before.id.clone(),
            before: Some(before),
            after: None,
        }
    }

    pub fn path(&self) -> String {
        format!("jobs/{}", self.job_id)
    }

    pub fn owner(&self) -> Option<&UserId> {
        self.after
            .as_ref()
            .or(self.before.as_ref())
            .map(|job| &job.owner)
    }
}

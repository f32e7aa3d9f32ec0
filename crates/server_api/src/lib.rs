use chrono::Utc;
use pipeline::{evaluate_drop, ChangeFeed, JobChange};
use shared::{
    domain::{Job, JobId, JobStatus, StatusCounts, UserId},
    error::{ApiError, ErrorCode},
    protocol::{CreateJobRequest, DropEvent, DropOutcome, LogoUploadResponse, UpdateJobRequest},
};
use storage::{NewJob, Storage};
use tracing::{debug, error, info};

pub const MAX_FIELD_BYTES: usize = 200;
pub const MAX_NOTES_BYTES: usize = 10_000;
pub const MAX_FILENAME_BYTES: usize = 180;

#[derive(Debug, Clone)]
pub struct LogoSettings {
    /// Base the object URLs are built from, e.g. `http://127.0.0.1:8443`.
    pub public_url: String,
    pub max_bytes: usize,
}

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub changes: ChangeFeed,
    pub logos: LogoSettings,
}

#[derive(Debug, Clone)]
pub enum LogoTarget {
    /// Upload made from the "add job" form, before the job has an id.
    NewJob { filename: String },
    /// Replacement logo for an existing job.
    Job(JobId),
}

pub async fn login(ctx: &ApiContext, username: &str) -> Result<UserId, ApiError> {
    let username = username.trim();
    if username.is_empty() {
        return Err(ApiError::validation("username cannot be empty"));
    }
    if username.len() > MAX_FIELD_BYTES {
        return Err(ApiError::validation("username is too long"));
    }
    ctx.storage.create_user(username).await.map_err(internal)
}

pub async fn create_job(
    ctx: &ApiContext,
    owner: &UserId,
    req: CreateJobRequest,
) -> Result<Job, ApiError> {
    let new_job = new_job(owner, req)?;
    let change = ctx
        .changes
        .publish_committed(async { ctx.storage.insert_job(new_job).await.map(Some) })
        .await
        .map_err(internal)?;
    let job = written_job(change)?;
    info!(job_id = %job.id, %owner, status = %job.status, "job created");
    Ok(job)
}

/// Trims and checks a create request. Blank optional fields are dropped.
pub fn new_job(owner: &UserId, req: CreateJobRequest) -> Result<NewJob, ApiError> {
    Ok(NewJob {
        owner: owner.clone(),
        title: required_text("title", &req.title)?,
        company: required_text("company", &req.company)?,
        status: req.status,
        logo_url: optional_text("logo_url", req.logo_url.as_deref(), MAX_NOTES_BYTES)?,
        notes: optional_text("notes", req.notes.as_deref(), MAX_NOTES_BYTES)?,
    })
}

pub async fn get_job(ctx: &ApiContext, owner: &UserId, job_id: &JobId) -> Result<Job, ApiError> {
    ensure_owned_job(ctx, owner, job_id).await
}

pub async fn list_jobs(ctx: &ApiContext, owner: &UserId) -> Result<Vec<Job>, ApiError> {
    ctx.storage
        .list_jobs_for_owner(owner)
        .await
        .map_err(internal)
}

pub async fn update_job(
    ctx: &ApiContext,
    owner: &UserId,
    job_id: &JobId,
    req: UpdateJobRequest,
) -> Result<Job, ApiError> {
    let mut job = ensure_owned_job(ctx, owner, job_id).await?;
    if let Some(title) = req.title.as_deref() {
        job.title = required_text("title", title)?;
    }
    if let Some(company) = req.company.as_deref() {
        job.company = required_text("company", company)?;
    }
    if let Some(status) = req.status {
        job.status = status;
    }
    if let Some(logo_url) = req.logo_url.as_deref() {
        job.logo_url = optional_text("logo_url", Some(logo_url), MAX_NOTES_BYTES)?;
    }
    if let Some(notes) = req.notes.as_deref() {
        job.notes = optional_text("notes", Some(notes), MAX_NOTES_BYTES)?;
    }

    let change = ctx
        .changes
        .publish_committed(ctx.storage.update_job(&job))
        .await
        .map_err(internal)?;
    written_job(change)
}

pub async fn update_job_status(
    ctx: &ApiContext,
    owner: &UserId,
    job_id: &JobId,
    status: JobStatus,
) -> Result<Job, ApiError> {
    ensure_owned_job(ctx, owner, job_id).await?;
    let change = ctx
        .changes
        .publish_committed(ctx.storage.update_job_status(job_id, status))
        .await
        .map_err(internal)?;
    written_job(change)
}

/// Applies a drag-and-drop completion from the pipeline board against the
/// owner's current jobs.
pub async fn move_job(
    ctx: &ApiContext,
    owner: &UserId,
    event: &DropEvent,
) -> Result<DropOutcome, ApiError> {
    let jobs = ctx
        .storage
        .list_job_summaries(owner)
        .await
        .map_err(internal)?;
    let outcome = evaluate_drop(&jobs, event, |job_id, status| async move {
        update_job_status(ctx, owner, &job_id, status)
            .await
            .map(|_| ())
    })
    .await?;

    match &outcome {
        DropOutcome::Moved { job_id, from, to } => {
            info!(%job_id, %owner, %from, %to, "job moved");
        }
        DropOutcome::Ignored { reason } => {
            debug!(active = %event.active.id, ?reason, "drop ignored");
        }
    }
    Ok(outcome)
}

pub async fn delete_job(ctx: &ApiContext, owner: &UserId, job_id: &JobId) -> Result<(), ApiError> {
    ensure_owned_job(ctx, owner, job_id).await?;
    ctx.changes
        .publish_committed(ctx.storage.delete_job(job_id))
        .await
        .map_err(internal)?
        .ok_or_else(job_vanished)?;
    info!(%job_id, %owner, "job deleted");
    Ok(())
}

pub async fn status_counts(ctx: &ApiContext, owner: &UserId) -> Result<StatusCounts, ApiError> {
    ctx.storage.status_counts(owner).await.map_err(internal)
}

pub async fn recount_stats(ctx: &ApiContext, owner: &UserId) -> Result<StatusCounts, ApiError> {
    let counts = ctx.storage.recount_stats(owner).await.map_err(internal)?;
    info!(%owner, total = counts.total(), "status counters rebuilt");
    Ok(counts)
}

pub async fn upload_logo(
    ctx: &ApiContext,
    owner: &UserId,
    target: LogoTarget,
    bytes: &[u8],
    mime_type: Option<&str>,
) -> Result<LogoUploadResponse, ApiError> {
    if bytes.is_empty() {
        return Err(ApiError::validation("logo body cannot be empty"));
    }
    if bytes.len() > ctx.logos.max_bytes {
        return Err(ApiError::validation(format!(
            "logo exceeds {} bytes",
            ctx.logos.max_bytes
        )));
    }

    let path = match target {
        LogoTarget::NewJob { filename } => {
            let filename = logo_filename(&filename)?;
            format!(
                "logos/{owner}_{}_{filename}",
                Utc::now().timestamp_millis()
            )
        }
        LogoTarget::Job(job_id) => {
            ensure_owned_job(ctx, owner, &job_id).await?;
            format!("logos/{job_id}")
        }
    };

    let mime_type = mime_type.map(str::trim).filter(|mime| !mime.is_empty());
    let size_bytes = ctx
        .storage
        .store_logo(&path, owner, bytes, mime_type)
        .await
        .map_err(|err| {
            error!(%path, error = %err, "logo upload failed");
            ApiError::new(ErrorCode::UploadFailed, "failed to store logo")
        })?;

    let url = format!("{}/{path}", ctx.logos.public_url.trim_end_matches('/'));
    Ok(LogoUploadResponse {
        path,
        url,
        size_bytes,
    })
}

async fn ensure_owned_job(
    ctx: &ApiContext,
    owner: &UserId,
    job_id: &JobId,
) -> Result<Job, ApiError> {
    let job = ctx
        .storage
        .get_job(job_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("job not found"))?;
    if &job.owner != owner {
        return Err(ApiError::forbidden("job belongs to another user"));
    }
    Ok(job)
}

/// A write that matched no row means the job vanished after the ownership check.
fn written_job(change: Option<JobChange>) -> Result<Job, ApiError> {
    change
        .ok_or_else(job_vanished)?
        .after
        .ok_or_else(|| ApiError::new(ErrorCode::Internal, "write produced no job"))
}

fn job_vanished() -> ApiError {
    ApiError::not_found("this job no longer exists")
}

fn required_text(field: &str, value: &str) -> Result<String, ApiError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ApiError::validation(format!("{field} is required")));
    }
    if value.len() > MAX_FIELD_BYTES {
        return Err(ApiError::validation(format!("{field} is too long")));
    }
    Ok(value.to_string())
}

/// Blank input clears the field.
fn optional_text(field: &str, value: Option<&str>, max: usize) -> Result<Option<String>, ApiError> {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    if value.len() > max {
        return Err(ApiError::validation(format!("{field} is too long")));
    }
    Ok(Some(value.to_string()))
}

/// Object keys end up in URLs, so anything outside `[A-Za-z0-9._-]` becomes `_`.
fn logo_filename(raw: &str) -> Result<String, ApiError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ApiError::validation("filename is required"));
    }
    if name.len() > MAX_FILENAME_BYTES {
        return Err(ApiError::validation("filename is too long"));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(ApiError::validation(
            "filename must not contain path separators",
        ));
    }
    Ok(name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect())
}

fn internal(err: anyhow::Error) -> ApiError {
    error!(error = %format!("{err:#}"), "request failed");
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

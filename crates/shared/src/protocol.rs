use serde::{Deserialize, Serialize};

use crate::domain::{Job, JobId, JobStatus, StatusCounts, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_id: UserId,
    pub token: String,
    pub expires_at: i64,
}

/// Fields of the "add job" form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub title: String,
    pub company: String,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Partial edit of a job. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateJobRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: JobStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DragItem {
    pub id: String,
}

impl DragItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Completion of a drag gesture on the pipeline board. `over` is the column
/// (or card) the item was released on, absent when dropped outside any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropEvent {
    pub active: DragItem,
    #[serde(default)]
    pub over: Option<DragItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropIgnoredReason {
    NoTarget,
    DroppedOnSelf,
    NotAStatus,
    UnknownJob,
    SameStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DropOutcome {
    Moved {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    Ignored {
        reason: DropIgnoredReason,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub counts: StatusCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoUploadResponse {
    pub path: String,
    pub url: String,
    pub size_bytes: u64,
}

/// Pushed over the live-query socket to the owner of the changed records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    JobChanged {
        owner: UserId,
        job_id: JobId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job: Option<Job>,
    },
    StatsUpdated {
        owner: UserId,
        counts: StatusCounts,
    },
}

impl ServerEvent {
    pub fn owner(&self) -> &UserId {
        match self {
            ServerEvent::JobChanged { owner, .. } | ServerEvent::StatsUpdated { owner, .. } => owner,
        }
    }
}

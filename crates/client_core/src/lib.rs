//! HTTP client for the job tracker server, including the board's drag-end
//! handling.

use anyhow::{anyhow, Context, Result};
use pipeline::evaluate_drop;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::{Job, JobId, JobStatus, JobSummary, StatusCounts, UserId},
    error::ApiError,
    protocol::{
        CreateJobRequest, DropEvent, DropOutcome, LoginRequest, LoginResponse,
        LogoUploadResponse, StatsResponse, UpdateJobRequest, UpdateStatusRequest,
    },
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not logged in")]
    NotLoggedIn,
    #[error("server rejected request ({status}): {}", .error.message)]
    Api { status: StatusCode, error: ApiError },
}

#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: UserId,
    pub token: String,
    pub expires_at: i64,
}

/// Where an uploaded logo is stored.
#[derive(Debug, Clone)]
pub enum LogoDestination {
    /// Logo picked in the "add job" form before the job exists.
    NewJob { filename: String },
    Job(JobId),
}

pub struct TrackerClient {
    http: Client,
    server_url: String,
    session: Mutex<Option<Session>>,
}

impl TrackerClient {
    pub fn new(server_url: &str) -> Result<Self> {
        let parsed = Url::parse(server_url)
            .with_context(|| format!("invalid server url '{server_url}'"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!("server url must be http or https: {server_url}"));
        }
        Ok(Self {
            http: Client::new(),
            server_url: server_url.trim_end_matches('/').to_string(),
            session: Mutex::new(None),
        })
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn session(&self) -> Option<Session> {
        self.session.lock().await.clone()
    }

    pub async fn login(&self, username: &str) -> Result<UserId> {
        let response = self
            .http
            .post(format!("{}/login", self.server_url))
            .json(&LoginRequest {
                username: username.to_string(),
            })
            .send()
            .await?;
        let body: LoginResponse = read_json(response).await?;
        info!(user_id = %body.user_id, "logged in");

        let user_id = body.user_id.clone();
        *self.session.lock().await = Some(Session {
            user_id: body.user_id,
            token: body.token,
            expires_at: body.expires_at,
        });
        Ok(user_id)
    }

    pub async fn logout(&self) {
        self.session.lock().await.take();
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        let request = self.authed(self.http.get(self.url("/jobs"))).await?;
        read_json(request.send().await?).await
    }

    pub async fn create_job(&self, req: &CreateJobRequest) -> Result<Job> {
        let request = self.authed(self.http.post(self.url("/jobs"))).await?;
        read_json(request.json(req).send().await?).await
    }

    pub async fn get_job(&self, job_id: &JobId) -> Result<Job> {
        let request = self
            .authed(self.http.get(self.url(&format!("/jobs/{job_id}"))))
            .await?;
        read_json(request.send().await?).await
    }

    pub async fn update_job(&self, job_id: &JobId, req: &UpdateJobRequest) -> Result<Job> {
        let request = self
            .authed(self.http.patch(self.url(&format!("/jobs/{job_id}"))))
            .await?;
        read_json(request.json(req).send().await?).await
    }

    pub async fn update_status(&self, job_id: &JobId, status: JobStatus) -> Result<Job> {
        let request = self
            .authed(self.http.put(self.url(&format!("/jobs/{job_id}/status"))))
            .await?;
        read_json(
            request
                .json(&UpdateStatusRequest { status })
                .send()
                .await?,
        )
        .await
    }

    pub async fn delete_job(&self, job_id: &JobId) -> Result<()> {
        let request = self
            .authed(self.http.delete(self.url(&format!("/jobs/{job_id}"))))
            .await?;
        check_status(request.send().await?).await?;
        Ok(())
    }

    pub async fn status_counts(&self) -> Result<StatusCounts> {
        let request = self.authed(self.http.get(self.url("/stats"))).await?;
        let body: StatsResponse = read_json(request.send().await?).await?;
        Ok(body.counts)
    }

    pub async fn recount_stats(&self) -> Result<StatusCounts> {
        let request = self
            .authed(self.http.post(self.url("/stats/recount")))
            .await?;
        let body: StatsResponse = read_json(request.send().await?).await?;
        Ok(body.counts)
    }

    pub async fn upload_logo(
        &self,
        destination: &LogoDestination,
        bytes: Vec<u8>,
        mime_type: Option<&str>,
    ) -> Result<LogoUploadResponse> {
        let request = self.authed(self.http.post(self.url("/logos"))).await?;
        let request = match destination {
            LogoDestination::NewJob { filename } => request.query(&[("filename", filename)]),
            LogoDestination::Job(job_id) => request.query(&[("job_id", job_id.as_str())]),
        };
        let request = match mime_type {
            Some(mime) => request.header(reqwest::header::CONTENT_TYPE, mime),
            None => request,
        };
        read_json(request.body(bytes).send().await?).await
    }

    /// Completes a drag on the pipeline board. Issues at most one status
    /// update, and only when the drop lands on a different status column.
    pub async fn handle_drag_end(
        &self,
        jobs: &[JobSummary],
        event: &DropEvent,
    ) -> Result<DropOutcome> {
        let outcome = evaluate_drop(jobs, event, |job_id, status| async move {
            self.update_status(&job_id, status).await.map(|_| ())
        })
        .await?;
        if let DropOutcome::Ignored { reason } = &outcome {
            debug!(active = %event.active.id, ?reason, "drop ignored");
        }
        Ok(outcome)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server_url)
    }

    async fn authed(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(ClientError::NotLoggedIn)?;
        Ok(request.bearer_auth(&session.token))
    }
}

/// Turns a non-2xx reply into [`ClientError::Api`] when the body carries an
/// `ApiError`, falling back to the plain HTTP status error.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let bytes = response.bytes().await?;
    match serde_json::from_slice::<ApiError>(&bytes) {
        Ok(error) => Err(ClientError::Api { status, error }.into()),
        Err(_) => Err(anyhow!("request failed with status {status}")),
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let response = check_status(response).await?;
    Ok(response.json().await?)
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

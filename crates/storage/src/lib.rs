use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipeline::{JobChange, StatAdjustment, StatsStore};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite, Transaction,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

use shared::domain::{Job, JobId, JobStatus, JobSummary, StatusCounts, UserId};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub owner: UserId,
    pub title: String,
    pub company: String,
    pub status: JobStatus,
    pub logo_url: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoredLogo {
    pub path: String,
    pub owner: UserId,
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

const JOB_COLUMNS: &str = "id, owner, title, company, status, logo_url, notes, created_at";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Returns the id for `username`, creating the user on first sight.
    pub async fn create_user(&self, username: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (id, username) VALUES (?, ?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(UserId::generate().0)
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<String, _>(0)))
    }

    pub async fn insert_job(&self, job: NewJob) -> Result<JobChange> {
        let job = Job {
            id: JobId::generate(),
            owner: job.owner,
            title: job.title,
            company: job.company,
            status: job.status,
            logo_url: job.logo_url,
            notes: job.notes,
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO jobs (id, owner, title, company, status, logo_url, notes, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.id.as_str())
        .bind(job.owner.as_str())
        .bind(&job.title)
        .bind(&job.company)
        .bind(job.status.as_str())
        .bind(job.logo_url.as_deref())
        .bind(job.notes.as_deref())
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .context("failed to insert job")?;
        Ok(JobChange::created(job))
    }

    pub async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(job_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Oldest first.
    pub async fn list_jobs_for_owner(&self, owner: &UserId) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE owner = ? ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(owner.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn list_job_summaries(&self, owner: &UserId) -> Result<Vec<JobSummary>> {
        let rows = sqlx::query("SELECT id, status FROM jobs WHERE owner = ?")
            .bind(owner.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| -> Result<JobSummary> {
                Ok(JobSummary {
                    id: JobId(r.try_get("id")?),
                    status: parse_status(r.try_get("status")?)?,
                })
            })
            .collect()
    }

    /// Overwrites the editable fields of `job`. `None` when the job no longer
    /// exists; the before-snapshot is read in the same transaction.
    pub async fn update_job(&self, job: &Job) -> Result<Option<JobChange>> {
        let mut tx = self.pool.begin().await?;
        let Some(before) = fetch_job(&mut tx, &job.id).await? else {
            return Ok(None);
        };
        sqlx::query(
            "UPDATE jobs SET title = ?, company = ?, status = ?, logo_url = ?, notes = ?
             WHERE id = ?",
        )
        .bind(&job.title)
        .bind(&job.company)
        .bind(job.status.as_str())
        .bind(job.logo_url.as_deref())
        .bind(job.notes.as_deref())
        .bind(job.id.as_str())
        .execute(&mut *tx)
        .await
        .context("failed to update job")?;
        let after = Job {
            id: before.id.clone(),
            owner: before.owner.clone(),
            created_at: before.created_at,
            ..job.clone()
        };
        tx.commit().await?;
        Ok(Some(JobChange::updated(before, after)))
    }

    pub async fn update_job_status(
        &self,
        job_id: &JobId,
        status: JobStatus,
    ) -> Result<Option<JobChange>> {
        let mut tx = self.pool.begin().await?;
        let Some(before) = fetch_job(&mut tx, job_id).await? else {
            return Ok(None);
        };
        sqlx::query("UPDATE jobs SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(job_id.as_str())
            .execute(&mut *tx)
            .await
            .context("failed to update job status")?;
        tx.commit().await?;
        let after = Job {
            status,
            ..before.clone()
        };
        Ok(Some(JobChange::updated(before, after)))
    }

    pub async fn delete_job(&self, job_id: &JobId) -> Result<Option<JobChange>> {
        let mut tx = self.pool.begin().await?;
        let Some(before) = fetch_job(&mut tx, job_id).await? else {
            return Ok(None);
        };
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(job_id.as_str())
            .execute(&mut *tx)
            .await
            .context("failed to delete job")?;
        tx.commit().await?;
        Ok(Some(JobChange::deleted(before)))
    }

    pub async fn status_counts(&self, owner: &UserId) -> Result<StatusCounts> {
        let rows = sqlx::query("SELECT status, count FROM user_stats WHERE owner = ?")
            .bind(owner.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| -> Result<(JobStatus, i64)> {
                Ok((parse_status(r.try_get("status")?)?, r.try_get("count")?))
            })
            .collect()
    }

    /// Rebuilds the owner's counters from the jobs table, discarding any
    /// drift left by repeated trigger deliveries.
    pub async fn recount_stats(&self, owner: &UserId) -> Result<StatusCounts> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM user_stats WHERE owner = ?")
            .bind(owner.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO user_stats (owner, status, count)
             SELECT owner, status, COUNT(*) FROM jobs WHERE owner = ? GROUP BY owner, status",
        )
        .bind(owner.as_str())
        .execute(&mut *tx)
        .await
        .context("failed to recount status counters")?;
        tx.commit().await?;
        self.status_counts(owner).await
    }

    /// Writes (or overwrites) the logo object at `path`.
    pub async fn store_logo(
        &self,
        path: &str,
        owner: &UserId,
        bytes: &[u8],
        mime_type: Option<&str>,
    ) -> Result<u64> {
        let size_bytes = i64::try_from(bytes.len()).unwrap_or(i64::MAX);
        sqlx::query(
            "INSERT INTO logos (path, owner, bytes, mime_type, size_bytes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, CURRENT_TIMESTAMP)
             ON CONFLICT(path) DO UPDATE SET
                 owner = excluded.owner,
                 bytes = excluded.bytes,
                 mime_type = excluded.mime_type,
                 size_bytes = excluded.size_bytes,
                 created_at = CURRENT_TIMESTAMP",
        )
        .bind(path)
        .bind(owner.as_str())
        .bind(bytes)
        .bind(mime_type)
        .bind(size_bytes)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to store logo '{path}'"))?;
        Ok(bytes.len() as u64)
    }

    pub async fn load_logo(&self, path: &str) -> Result<Option<StoredLogo>> {
        let row = sqlx::query(
            "SELECT path, owner, bytes, mime_type, size_bytes, created_at FROM logos WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredLogo {
            path: r.get::<String, _>(0),
            owner: UserId(r.get::<String, _>(1)),
            bytes: r.get::<Vec<u8>, _>(2),
            mime_type: r.get::<Option<String>, _>(3),
            size_bytes: r.get::<i64, _>(4).max(0) as u64,
            created_at: r.get::<DateTime<Utc>, _>(5),
        }))
    }
}

#[async_trait]
impl StatsStore for Storage {
    async fn apply_stat_adjustments(
        &self,
        owner: &UserId,
        adjustments: &[StatAdjustment],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for adjustment in adjustments {
            sqlx::query(
                "INSERT INTO user_stats (owner, status, count) VALUES (?1, ?2, MAX(?3, 0))
                 ON CONFLICT(owner, status) DO UPDATE SET count = MAX(user_stats.count + ?3, 0)",
            )
            .bind(owner.as_str())
            .bind(adjustment.status.as_str())
            .bind(adjustment.delta)
            .execute(&mut *tx)
            .await
            .with_context(|| {
                format!(
                    "failed to adjust counter {owner}/{} by {}",
                    adjustment.status, adjustment.delta
                )
            })?;
        }
        tx.commit().await.context("failed to commit counter batch")?;
        debug!(%owner, batch = adjustments.len(), "counter batch committed");
        Ok(())
    }
}

async fn fetch_job(tx: &mut Transaction<'_, Sqlite>, job_id: &JobId) -> Result<Option<Job>> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
        .bind(job_id.as_str())
        .fetch_optional(&mut **tx)
        .await?;
    row.as_ref().map(job_from_row).transpose()
}

fn job_from_row(r: &SqliteRow) -> Result<Job> {
    Ok(Job {
        id: JobId(r.try_get("id")?),
        owner: UserId(r.try_get("owner")?),
        title: r.try_get("title")?,
        company: r.try_get("company")?,
        status: parse_status(r.try_get("status")?)?,
        logo_url: r.try_get("logo_url")?,
        notes: r.try_get("notes")?,
        created_at: r.try_get("created_at")?,
    })
}

fn parse_status(raw: String) -> Result<JobStatus> {
    raw.parse::<JobStatus>()
        .context("stored job has a status outside the pipeline")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

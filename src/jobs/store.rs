//! Durable Job Records
//!
//! The record answers "does this job exist, and did it start?" after its
//! progress entry is gone. Terminal records are never rewritten.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tokio::task;

use super::{JobStatus, TrainingJob};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &TrainingJob) -> Result<()>;
    /// Pending -> Running. Returns false if the job was not pending.
    async fn mark_running(&self, id: &str) -> Result<bool>;
    /// Moves a non-terminal job to a terminal status. Returns false if the
    /// job is unknown or already terminal.
    async fn finish(&self, id: &str, status: JobStatus, message: Option<String>, detail: Option<Value>) -> Result<bool>;
    async fn get(&self, id: &str) -> Result<Option<TrainingJob>>;
    async fn count(&self, status: JobStatus) -> Result<i64>;
}

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, TrainingJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &TrainingJob) -> Result<()> {
        self.jobs.lock().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn mark_running(&self, id: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Running;
                job.started_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish(&self, id: &str, status: JobStatus, message: Option<String>, detail: Option<Value>) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(id) {
            Some(job) if !job.status.is_terminal() => {
                job.status = status;
                job.ended_at = Some(Utc::now());
                job.message = message;
                job.detail = detail;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<TrainingJob>> {
        Ok(self.jobs.lock().await.get(id).cloned())
    }

    async fn count(&self, status: JobStatus) -> Result<i64> {
        Ok(self.jobs.lock().await.values().filter(|j| j.status == status).count() as i64)
    }
}

/// SQLite-backed store; every operation opens its own connection on the
/// blocking pool
#[derive(Clone)]
pub struct SqliteJobStore {
    db_path: PathBuf,
}

fn parse_time(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    match raw {
        Some(s) => Ok(Some(DateTime::parse_from_rfc3339(&s)?.with_timezone(&Utc))),
        None => Ok(None),
    }
}

impl SqliteJobStore {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let path_clone = path.clone();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone)
                .with_context(|| format!("Failed to open job database {:?}", path_clone))?;
            conn.execute(
                r#"
                CREATE TABLE IF NOT EXISTS training_jobs (
                    id TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    ended_at TEXT,
                    message TEXT,
                    detail TEXT
                );
                "#,
                [],
            )?;
            conn.execute("CREATE INDEX IF NOT EXISTS idx_training_jobs_status ON training_jobs(status);", [])?;
            Ok::<_, anyhow::Error>(())
        })
        .await??;

        Ok(Self { db_path: path })
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, job: &TrainingJob) -> Result<()> {
        let path = self.db_path.clone();
        let job = job.clone();
        let detail = job.detail.as_ref().map(serde_json::to_string).transpose()?;

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            conn.execute(
                "INSERT INTO training_jobs (id, status, created_at, started_at, ended_at, message, detail)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    &job.id,
                    job.status.as_str(),
                    job.created_at.to_rfc3339(),
                    job.started_at.map(|t| t.to_rfc3339()),
                    job.ended_at.map(|t| t.to_rfc3339()),
                    &job.message,
                    &detail
                ],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    async fn mark_running(&self, id: &str) -> Result<bool> {
        let path = self.db_path.clone();
        let id = id.to_string();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE training_jobs SET status = 'running', started_at = ?1 WHERE id = ?2 AND status = 'pending'",
                params![&now, &id],
            )?;
            Ok::<_, anyhow::Error>(changed == 1)
        })
        .await?
    }

    async fn finish(&self, id: &str, status: JobStatus, message: Option<String>, detail: Option<Value>) -> Result<bool> {
        let path = self.db_path.clone();
        let id = id.to_string();
        let detail = detail.as_ref().map(serde_json::to_string).transpose()?;

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE training_jobs SET status = ?1, ended_at = ?2, message = ?3, detail = ?4
                 WHERE id = ?5 AND status IN ('pending', 'running')",
                params![status.as_str(), &now, &message, &detail, &id],
            )?;
            Ok::<_, anyhow::Error>(changed == 1)
        })
        .await?
    }

    async fn get(&self, id: &str) -> Result<Option<TrainingJob>> {
        let path = self.db_path.clone();
        let id = id.to_string();

        task::spawn_blocking(move || -> Result<Option<TrainingJob>> {
            let conn = Connection::open(&path)?;
            type Row = (String, String, String, Option<String>, Option<String>, Option<String>, Option<String>);
            let row: Option<Row> = conn
                .query_row(
                    "SELECT id, status, created_at, started_at, ended_at, message, detail
                     FROM training_jobs WHERE id = ?1",
                    params![&id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?, row.get(6)?)),
                )
                .optional()?;

            let Some((id, status, created_at, started_at, ended_at, message, detail)) = row else {
                return Ok(None);
            };
            Ok(Some(TrainingJob {
                id,
                status: JobStatus::from(status),
                created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
                started_at: parse_time(started_at)?,
                ended_at: parse_time(ended_at)?,
                message,
                detail: detail.map(|d| serde_json::from_str(&d)).transpose().context("Corrupt job detail")?,
            }))
        })
        .await?
    }

    async fn count(&self, status: JobStatus) -> Result<i64> {
        let path = self.db_path.clone();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM training_jobs WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )?;
            Ok::<_, anyhow::Error>(count)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::NamedTempFile;

    async fn lifecycle(store: &dyn JobStore) -> Result<()> {
        store.insert(&TrainingJob::pending("job-1")).await?;
        assert_eq!(store.get("job-1").await?.map(|j| j.status), Some(JobStatus::Pending));
        assert_eq!(store.count(JobStatus::Pending).await?, 1);

        assert!(store.mark_running("job-1").await?);
        assert!(!store.mark_running("job-1").await?);
        let running = store.get("job-1").await?.unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert!(running.started_at.is_some());

        let detail = json!({"modelPath": "models/model_job-1.json"});
        assert!(store.finish("job-1", JobStatus::Completed, None, Some(detail.clone())).await?);
        // terminal records stay as they are
        assert!(!store.finish("job-1", JobStatus::Error, Some("late".into()), None).await?);

        let done = store.get("job-1").await?.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.detail, Some(detail));
        assert!(done.message.is_none());
        assert!(done.ended_at.is_some());

        assert!(store.get("missing").await?.is_none());
        assert!(!store.finish("missing", JobStatus::Stopped, None, None).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_store_lifecycle() -> Result<()> {
        lifecycle(&MemoryJobStore::new()).await
    }

    #[tokio::test]
    async fn test_sqlite_store_lifecycle() -> Result<()> {
        let temp_file = NamedTempFile::new()?;
        let store = SqliteJobStore::new(temp_file.path()).await?;
        lifecycle(&store).await?;

        // a second handle sees the same records
        let reopened = SqliteJobStore::new(temp_file.path()).await?;
        assert_eq!(reopened.count(JobStatus::Completed).await?, 1);
        Ok(())
    }
}

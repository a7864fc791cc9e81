//! Training Service
//!
//! Owns the worker pool, the progress store and the durable job store.
//! Built once at startup and shared with the HTTP layer by `Arc`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task;
use tracing::{info, warn};
use uuid::Uuid;

use super::inference::{ModelError, Predictions, SavedRules, TrainedModel};
use super::progress::{
    CancellationFlag, ProgressSnapshot, ProgressStore, StopOutcome, STATUS_ERROR_PREFIX, STATUS_FINISHED,
    STATUS_STOPPED,
};
use super::queue::{JobObserver, JobResult, WorkerPool};
use super::store::{JobStore, SqliteJobStore};
use super::training::{model_path, run_training, TrainingParams, TrainingPlan, TrainingRequest};
use super::{JobOutcome, JobStatus, TrainingJob};
use crate::classifier::{default_factory, BeliefClassifier, ClassifierFactory};
use crate::config::ServiceConfig;

/// What a running job body can see
#[derive(Clone)]
pub struct JobContext {
    pub job_id: String,
    pub progress: Arc<ProgressStore>,
    pub cancel: CancellationFlag,
}

/// Durable record first, then the terminal snapshot: whoever sees the
/// progress entry disappear finds the final record.
struct ServiceObserver {
    store: Arc<dyn JobStore>,
    progress: Arc<ProgressStore>,
}

#[async_trait]
impl JobObserver for ServiceObserver {
    async fn on_started(&self, job_id: &str) {
        match self.store.mark_running(job_id).await {
            Ok(true) => info!(job_id, "🚀 Job running"),
            Ok(false) => warn!(job_id, "Job was not pending when a worker picked it up"),
            Err(e) => warn!(job_id, error = %e, "Failed to mark job running"),
        }
    }

    async fn on_finished(&self, job_id: &str, result: &JobResult) {
        let (status, message, detail, final_status) = match result {
            Ok(JobOutcome::Completed { detail }) => {
                (JobStatus::Completed, None, Some(detail.clone()), STATUS_FINISHED.to_string())
            }
            Ok(JobOutcome::Stopped { epoch }) => (
                JobStatus::Stopped,
                Some(format!("stopped by user before epoch {}", epoch)),
                None,
                STATUS_STOPPED.to_string(),
            ),
            Err(e) => (JobStatus::Error, Some(e.to_string()), None, format!("{}{}", STATUS_ERROR_PREFIX, e)),
        };
        if let Err(e) = self.store.finish(job_id, status, message, detail).await {
            warn!(job_id, error = %e, "Failed to record job result");
        }
        self.progress.finish(job_id, final_status);
        info!(job_id, status = %status, "Job finished");
    }
}

/// Durable record plus live progress, when there is any
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub job: TrainingJob,
    pub progress: Option<ProgressSnapshot>,
}

/// Job counts by durable status, plus entries with live progress
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub error: i64,
    pub stopped: i64,
    pub live: usize,
}

pub struct TrainingService {
    config: ServiceConfig,
    pool: WorkerPool,
    progress: Arc<ProgressStore>,
    store: Arc<dyn JobStore>,
    factory: ClassifierFactory,
}

impl TrainingService {
    /// Opens the SQLite job store from `config` and starts the workers
    pub async fn start(config: ServiceConfig) -> Result<Self> {
        let store = SqliteJobStore::new(&config.database_path)
            .await
            .with_context(|| format!("Failed to open job store at {:?}", config.database_path))?;
        Ok(Self::start_with(config, Arc::new(store), default_factory()))
    }

    /// Starts the workers on the current runtime with explicit parts
    pub fn start_with(config: ServiceConfig, store: Arc<dyn JobStore>, factory: ClassifierFactory) -> Self {
        let progress = Arc::new(ProgressStore::new());
        let observer = Arc::new(ServiceObserver { store: store.clone(), progress: progress.clone() });
        let pool = WorkerPool::start(config.workers, observer);
        Self { config, pool, progress, store, factory }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Queues an arbitrary job body and returns its id immediately
    pub async fn submit<F>(&self, job: F) -> Result<String>
    where
        F: FnOnce(&JobContext) -> Result<JobOutcome> + Send + 'static,
    {
        let job_id = Uuid::new_v4().to_string();
        let cancel = self.progress.register(&job_id);
        if let Err(e) = self.store.insert(&TrainingJob::pending(&job_id)).await {
            self.progress.finish(&job_id, format!("{}{}", STATUS_ERROR_PREFIX, e));
            return Err(e.context("Failed to record job"));
        }

        let ctx = JobContext { job_id: job_id.clone(), progress: self.progress.clone(), cancel };
        if let Err(e) = self.pool.submit(job_id.clone(), Box::new(move |_id: &str| job(&ctx))) {
            let message = e.to_string();
            let _ = self.store.finish(&job_id, JobStatus::Error, Some(message.clone()), None).await;
            self.progress.finish(&job_id, format!("{}{}", STATUS_ERROR_PREFIX, message));
            return Err(e);
        }
        info!(job_id = %job_id, "📥 Job enqueued");
        Ok(job_id)
    }

    /// Validates the request, then queues a training job
    pub async fn enqueue_training(&self, request: TrainingRequest) -> Result<String> {
        let plan = TrainingPlan::prepare(request)?;
        self.enqueue_plan(plan).await
    }

    pub async fn enqueue_plan(&self, plan: TrainingPlan) -> Result<String> {
        let factory = self.factory.clone();
        let models_dir = self.config.models_dir.clone();
        self.submit(move |ctx| run_training(plan, ctx, &factory, &models_dir)).await
    }

    pub fn request_stop(&self, job_id: &str) -> StopOutcome {
        self.progress.request_stop(job_id)
    }

    pub fn subscribe(&self, job_id: &str) -> Option<watch::Receiver<ProgressSnapshot>> {
        self.progress.subscribe(job_id)
    }

    pub fn progress(&self, job_id: &str) -> Option<ProgressSnapshot> {
        self.progress.snapshot(job_id)
    }

    pub async fn job(&self, job_id: &str) -> Result<Option<TrainingJob>> {
        self.store.get(job_id).await
    }

    /// `None` only for ids that were never submitted
    pub async fn lookup(&self, job_id: &str) -> Result<Option<JobView>> {
        let progress = self.progress(job_id);
        Ok(self.job(job_id).await?.map(|job| JobView { job, progress }))
    }

    /// Reads back the saved model of a completed job. `None` for ids that
    /// were never submitted.
    pub async fn trained_model(&self, job_id: &str) -> Result<Option<TrainedModel>> {
        let Some(job) = self.job(job_id).await? else {
            return Ok(None);
        };
        if job.status != JobStatus::Completed {
            return Err(ModelError::NotTrained { id: job_id.to_string(), status: job.status }.into());
        }

        let detail = job.detail.unwrap_or_default();
        let classes: Vec<String> =
            serde_json::from_value(detail["labelEncoder"].clone()).context("Job record has no label encoder")?;
        let columns: Vec<String> = serde_json::from_value(detail["columns"].clone()).unwrap_or_default();
        let params: Option<TrainingParams> = serde_json::from_value(detail["params"].clone()).ok();

        let path = model_path(&self.config.models_dir, job_id);
        let factory = self.factory.clone();
        let (n_classes, model_columns) = (classes.len(), columns.clone());
        let model = task::spawn_blocking(move || -> Result<Box<dyn BeliefClassifier>> {
            let mut model = factory(n_classes, model_columns);
            model.load(&path)?;
            Ok(model)
        })
        .await??;
        Ok(Some(TrainedModel { model, classes, columns, params }))
    }

    /// Predicts `features` with a completed job's model
    pub async fn predict(&self, job_id: &str, features: Vec<Vec<f64>>) -> Result<Option<Predictions>> {
        let Some(trained) = self.trained_model(job_id).await? else {
            return Ok(None);
        };
        let predictions = task::spawn_blocking(move || trained.predict(&features)).await??;
        Ok(Some(predictions))
    }

    /// Trained rules of a completed job, masses rounded
    pub async fn saved_rules(&self, job_id: &str) -> Result<Option<SavedRules>> {
        Ok(self.trained_model(job_id).await?.map(|trained| trained.saved_rules()))
    }

    pub async fn stats(&self) -> Result<JobStats> {
        Ok(JobStats {
            pending: self.store.count(JobStatus::Pending).await?,
            running: self.store.count(JobStatus::Running).await?,
            completed: self.store.count(JobStatus::Completed).await?,
            error: self.store.count(JobStatus::Error).await?,
            stopped: self.store.count(JobStatus::Stopped).await?,
            live: self.progress.len(),
        })
    }

    /// Waits until every submitted job is done
    pub async fn wait_idle(&self) {
        self.pool.join().await;
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::MemoryJobStore;
    use anyhow::bail;
    use serde_json::json;

    fn service() -> TrainingService {
        TrainingService::start_with(ServiceConfig::default(), Arc::new(MemoryJobStore::new()), default_factory())
    }

    #[tokio::test]
    async fn test_submit_records_outcomes() -> Result<()> {
        let service = service();
        let ok = service.submit(|ctx| Ok(JobOutcome::Completed { detail: json!({ "id": ctx.job_id }) })).await?;
        let failed = service.submit(|_ctx| -> Result<JobOutcome> { bail!("no rows") }).await?;
        service.wait_idle().await;

        let ok_job = service.job(&ok).await?.unwrap();
        assert_eq!(ok_job.status, JobStatus::Completed);
        assert_eq!(ok_job.detail, Some(json!({ "id": ok })));
        assert!(service.progress(&ok).is_none());

        let failed_job = service.job(&failed).await?.unwrap();
        assert_eq!(failed_job.status, JobStatus::Error);
        assert_eq!(failed_job.message.as_deref(), Some("no rows"));

        assert!(service.lookup("nope").await?.is_none());
        let stats = service.stats().await?;
        assert_eq!((stats.completed, stats.error, stats.pending, stats.live), (1, 1, 0, 0));
        assert_eq!(service.request_stop(&ok), StopOutcome::NotFound);
        service.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_subscriber_sees_error_status() -> Result<()> {
        let service = service();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let id = service
            .submit(move |_ctx| -> Result<JobOutcome> {
                let _ = release_rx.recv();
                bail!("bad masses")
            })
            .await?;
        let mut rx = service.subscribe(&id).unwrap();
        release_tx.send(()).unwrap();

        while !rx.borrow_and_update().is_terminal() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        assert_eq!(rx.borrow().status, "Error during training: bad masses");
        service.shutdown().await;
        Ok(())
    }
}

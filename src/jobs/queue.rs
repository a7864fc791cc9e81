//! FIFO job queue drained by a fixed pool of workers.
//!
//! Workers share one receiver behind an async mutex and run each job on the
//! blocking pool. A failing or panicking job is reported to the observer and
//! the worker moves on to the next item.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::any::Any;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info};

use super::{JobExecutionError, JobOutcome};

/// Job body; receives its own job id
pub type JobFn = Box<dyn FnOnce(&str) -> Result<JobOutcome> + Send + 'static>;

pub type JobResult = std::result::Result<JobOutcome, JobExecutionError>;

#[async_trait]
pub trait JobObserver: Send + Sync {
    async fn on_started(&self, _job_id: &str) {}

    async fn on_finished(&self, _job_id: &str, _result: &JobResult) {}
}

/// Observer that only logs
pub struct LoggingObserver;

#[async_trait]
impl JobObserver for LoggingObserver {
    async fn on_finished(&self, job_id: &str, result: &JobResult) {
        match result {
            Ok(JobOutcome::Completed { .. }) => info!(job_id, "✅ Job completed"),
            Ok(JobOutcome::Stopped { epoch }) => info!(job_id, epoch, "🛑 Job stopped"),
            Err(_) => {}
        }
    }
}

struct QueuedJob {
    id: String,
    run: JobFn,
}

pub struct WorkerPool {
    sender: Mutex<Option<mpsc::UnboundedSender<QueuedJob>>>,
    workers: AsyncMutex<Vec<JoinHandle<()>>>,
    /// Submitted items not yet done
    outstanding: Arc<watch::Sender<usize>>,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl WorkerPool {
    /// Spawns `size` workers on the current runtime
    pub fn start(size: usize, observer: Arc<dyn JobObserver>) -> Self {
        let size = size.max(1);
        let (tx, rx) = mpsc::unbounded_channel::<QueuedJob>();
        let receiver = Arc::new(AsyncMutex::new(rx));
        let (outstanding, _) = watch::channel(0usize);
        let outstanding = Arc::new(outstanding);

        let workers = (0..size)
            .map(|worker| {
                let receiver = receiver.clone();
                let observer = observer.clone();
                let outstanding = outstanding.clone();
                tokio::spawn(async move {
                    debug!(worker, "Worker started");
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(QueuedJob { id, run }) = next else {
                            break;
                        };

                        observer.on_started(&id).await;
                        let job_id = id.clone();
                        let result = match task::spawn_blocking(move || run(&job_id)).await {
                            Ok(Ok(outcome)) => Ok(outcome),
                            Ok(Err(e)) => Err(JobExecutionError::Failed(format!("{:#}", e))),
                            Err(join_error) if join_error.is_panic() => {
                                Err(JobExecutionError::Panicked(panic_message(join_error.into_panic())))
                            }
                            Err(join_error) => Err(JobExecutionError::Failed(join_error.to_string())),
                        };
                        if let Err(e) = &result {
                            error!(job_id = %id, worker, error = %e, "❌ Job failed");
                        }
                        observer.on_finished(&id, &result).await;
                        outstanding.send_modify(|n| *n = n.saturating_sub(1));
                    }
                    debug!(worker, "Worker stopped");
                })
            })
            .collect();

        info!(workers = size, "🏗️ Worker pool started");
        Self { sender: Mutex::new(Some(tx)), workers: AsyncMutex::new(workers), outstanding }
    }

    /// Enqueues a job without waiting
    pub fn submit(&self, job_id: impl Into<String>, run: JobFn) -> Result<()> {
        let sender = self.sender.lock().unwrap_or_else(|p| p.into_inner());
        let Some(tx) = sender.as_ref() else {
            bail!("worker pool is shut down");
        };
        self.outstanding.send_modify(|n| *n += 1);
        if tx.send(QueuedJob { id: job_id.into(), run }).is_err() {
            self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
            bail!("worker pool is shut down");
        }
        Ok(())
    }

    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Waits until every submitted item is done
    pub async fn join(&self) {
        let mut rx = self.outstanding.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Closes the queue, lets the workers drain it and waits for them
    pub async fn shutdown(&self) {
        let sender = self.sender.lock().unwrap_or_else(|p| p.into_inner()).take();
        drop(sender);
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for handle in workers {
            let _ = handle.await;
        }
        info!("Worker pool shut down");
    }
}

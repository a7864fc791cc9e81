//! Live progress of running jobs and their stop flags.
//!
//! Each job owns one `watch` channel: the worker overwrites the snapshot,
//! pollers wait on `changed()` instead of sleeping in a loop. The entry is
//! dropped together with the final snapshot, so a receiver always sees the
//! terminal status before the channel closes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::debug;

pub const STATUS_ENQUEUED: &str = "Task enqueued";
pub const STATUS_INITIALIZING: &str = "Initializing model...";
pub const STATUS_TRAINING: &str = "Training";
pub const STATUS_EVALUATION: &str = "evaluation";
pub const STATUS_FINISHED: &str = "Training finished ✅";
pub const STATUS_STOPPING: &str = "Stopping: training stopped by user";
pub const STATUS_STOPPED: &str = "Training stopped by user";
pub const STATUS_ERROR_PREFIX: &str = "Error during training: ";

const TERMINAL_PREFIXES: [&str; 3] = ["Training finished", "Error", "Training stopped"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub epoch: usize,
    #[serde(rename = "max")]
    pub max_epochs: usize,
    pub loss: f64,
    pub status: String,
    /// Seconds since training started
    pub time: f64,
    /// Estimated seconds left
    pub eta: f64,
}

impl ProgressSnapshot {
    pub fn with_status(status: impl Into<String>) -> Self {
        Self { epoch: 0, max_epochs: 0, loss: 0.0, status: status.into(), time: 0.0, eta: 0.0 }
    }

    pub fn enqueued() -> Self {
        Self::with_status(STATUS_ENQUEUED)
    }

    pub fn epoch(epoch: usize, max_epochs: usize, loss: f64, time: f64, eta: f64) -> Self {
        Self { epoch, max_epochs, loss, status: STATUS_TRAINING.to_string(), time, eta }
    }

    pub fn is_terminal(&self) -> bool {
        TERMINAL_PREFIXES.iter().any(|p| self.status.starts_with(p))
    }
}

/// Cooperative stop flag shared by the canceller and the training loop
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Requested,
    /// No live entry: the job is unknown or already terminal
    NotFound,
}

struct Entry {
    tx: watch::Sender<ProgressSnapshot>,
    cancel: CancellationFlag,
}

#[derive(Default)]
pub struct ProgressStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates the entry with the enqueued snapshot
    pub fn register(&self, job_id: &str) -> CancellationFlag {
        let cancel = CancellationFlag::new();
        let (tx, _rx) = watch::channel(ProgressSnapshot::enqueued());
        self.entries().insert(job_id.to_string(), Entry { tx, cancel: cancel.clone() });
        cancel
    }

    /// Overwrites the snapshot. Once a stop was requested the stopping
    /// status is kept. Returns false if the entry is gone.
    pub fn publish(&self, job_id: &str, mut snapshot: ProgressSnapshot) -> bool {
        let entries = self.entries();
        let Some(entry) = entries.get(job_id) else {
            return false;
        };
        if entry.cancel.is_cancelled() {
            snapshot.status = STATUS_STOPPING.to_string();
        }
        entry.tx.send_replace(snapshot);
        true
    }

    /// Replaces only the status text
    pub fn set_status(&self, job_id: &str, status: &str) -> bool {
        let entries = self.entries();
        let Some(entry) = entries.get(job_id) else {
            return false;
        };
        if !entry.cancel.is_cancelled() {
            entry.tx.send_modify(|s| s.status = status.to_string());
        }
        true
    }

    pub fn request_stop(&self, job_id: &str) -> StopOutcome {
        let entries = self.entries();
        match entries.get(job_id) {
            Some(entry) => {
                entry.cancel.cancel();
                entry.tx.send_modify(|s| s.status = STATUS_STOPPING.to_string());
                debug!(job_id, "Stop requested");
                StopOutcome::Requested
            }
            None => StopOutcome::NotFound,
        }
    }

    /// Writes the terminal snapshot and drops the entry
    pub fn finish(&self, job_id: &str, status: impl Into<String>) -> Option<ProgressSnapshot> {
        let status = status.into();
        let mut entries = self.entries();
        let entry = entries.remove(job_id)?;
        entry.tx.send_modify(|s| s.status = status);
        let last = entry.tx.borrow().clone();
        Some(last)
    }

    pub fn snapshot(&self, job_id: &str) -> Option<ProgressSnapshot> {
        self.entries().get(job_id).map(|e| e.tx.borrow().clone())
    }

    pub fn subscribe(&self, job_id: &str) -> Option<watch::Receiver<ProgressSnapshot>> {
        self.entries().get(job_id).map(|e| e.tx.subscribe())
    }

    pub fn cancellation(&self, job_id: &str) -> Option<CancellationFlag> {
        self.entries().get(job_id).map(|e| e.cancel.clone())
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_json_names() {
        let json = serde_json::to_value(ProgressSnapshot::epoch(3, 10, 0.25, 1.5, 3.5)).unwrap();
        assert_eq!(json["epoch"], 3);
        assert_eq!(json["max"], 10);
        assert_eq!(json["status"], "Training");
        assert_eq!(json["eta"], 3.5);
    }

    #[test]
    fn test_terminal_prefixes() {
        assert!(ProgressSnapshot::with_status(STATUS_FINISHED).is_terminal());
        assert!(ProgressSnapshot::with_status(STATUS_STOPPED).is_terminal());
        assert!(ProgressSnapshot::with_status(format!("{}boom", STATUS_ERROR_PREFIX)).is_terminal());
        assert!(!ProgressSnapshot::with_status(STATUS_STOPPING).is_terminal());
        assert!(!ProgressSnapshot::enqueued().is_terminal());
    }

    #[test]
    fn test_stop_keeps_stopping_status() {
        let store = ProgressStore::new();
        let flag = store.register("a");
        assert_eq!(store.snapshot("a").unwrap().status, STATUS_ENQUEUED);

        assert_eq!(store.request_stop("a"), StopOutcome::Requested);
        assert!(flag.is_cancelled());
        assert!(store.publish("a", ProgressSnapshot::epoch(1, 5, 0.1, 0.0, 0.0)));
        let snap = store.snapshot("a").unwrap();
        assert_eq!(snap.status, STATUS_STOPPING);
        assert_eq!(snap.epoch, 1);
    }

    #[test]
    fn test_finish_removes_entry_and_blocks_late_stop() {
        let store = ProgressStore::new();
        store.register("a");
        let final_snap = store.finish("a", STATUS_FINISHED).unwrap();
        assert!(final_snap.is_terminal());
        assert!(store.is_empty());
        assert_eq!(store.request_stop("a"), StopOutcome::NotFound);
        assert!(!store.publish("a", ProgressSnapshot::enqueued()));
        assert!(store.finish("a", STATUS_STOPPED).is_none());
    }

    #[tokio::test]
    async fn test_subscriber_sees_terminal_status() {
        let store = ProgressStore::new();
        store.register("a");
        let mut rx = store.subscribe("a").unwrap();

        store.publish("a", ProgressSnapshot::epoch(1, 2, 0.5, 0.1, 0.1));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().epoch, 1);

        store.finish("a", STATUS_FINISHED);
        // the last value stays readable after the sender is gone
        let _ = rx.changed().await;
        assert_eq!(rx.borrow().status, STATUS_FINISHED);
        assert!(rx.changed().await.is_err());
    }
}

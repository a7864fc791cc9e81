//! Training jobs end to end: queue, workers, progress, stop, durable record.

use anyhow::Result;
use dsrules::classifier::{
    default_factory, BeliefClassifier, ClassifierFactory, EpochReport, EpochStream, FitOptions,
};
use dsrules::config::ServiceConfig;
use dsrules::jobs::progress::STATUS_STOPPED;
use dsrules::jobs::{JobStatus, MemoryJobStore, ModelError, StopOutcome, TrainingRequest, TrainingService};
use dsrules::rules::{MassVector, Rule, RuleError};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn request(max_epochs: usize) -> TrainingRequest {
    let features: Vec<Vec<f64>> = (0..40).map(|i| vec![i as f64 / 4.0, (i % 3) as f64]).collect();
    let targets: Vec<String> = features.iter().map(|r| if r[0] > 5.0 { "high" } else { "low" }.to_string()).collect();
    serde_json::from_value(json!({
        "columns": ["level", "group"],
        "train": {"features": features, "targets": targets},
        "rules": [
            [{"left": {"base": "x", "index": "var0"}, "op": ">", "right": "var1"}, {"var0": "level", "var1": 5.0}],
            {"left": "level", "op": "<=", "right": 5.0}
        ],
        "maxEpochs": max_epochs,
        "minEpochs": 5,
        "batchSize": 16,
        "learningRate": 0.05
    }))
    .unwrap()
}

fn service(models_dir: &Path, factory: ClassifierFactory) -> TrainingService {
    let config = ServiceConfig { workers: 2, models_dir: models_dir.to_path_buf(), ..ServiceConfig::default() };
    TrainingService::start_with(config, Arc::new(MemoryJobStore::new()), factory)
}

#[tokio::test]
async fn test_training_job_completes_with_model_and_metrics() -> Result<()> {
    let dir = tempdir()?;
    let service = service(dir.path(), default_factory());

    let id = service.enqueue_training(request(60)).await?;
    let mut rx = service.subscribe(&id).expect("live progress entry");
    service.wait_idle().await;

    let job = service.job(&id).await?.expect("durable record");
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.started_at.is_some() && job.ended_at.is_some());

    let detail = job.detail.expect("detail");
    let model_path = detail["modelPath"].as_str().unwrap().to_string();
    assert!(Path::new(&model_path).exists());
    assert!(model_path.ends_with(&format!("model_{}.json", id)));
    assert_eq!(detail["labelEncoder"], json!(["high", "low"]));
    assert!(detail["metrics"]["accuracy"].as_f64().unwrap() > 0.5);
    assert_eq!(detail["rules"]["labels"][0], "level > 5.0");
    assert_eq!(detail["rules"]["masses"].as_array().unwrap().len(), 2);

    // the receiver keeps the terminal snapshot after the entry is gone
    let _ = rx.changed().await;
    assert!(rx.borrow().status.starts_with("Training finished"));
    assert!(service.progress(&id).is_none());
    assert_eq!(service.request_stop(&id), StopOutcome::NotFound);

    let mut model = dsrules::DempsterShaferClassifier::new(1, Vec::new());
    model.load(Path::new(&model_path))?;
    assert_eq!(model.preds().len(), 2);

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_completed_job_predicts_and_reads_back_rules() -> Result<()> {
    let dir = tempdir()?;
    let service = service(dir.path(), default_factory());
    let id = service.enqueue_training(request(60)).await?;
    service.wait_idle().await;

    let result = service.predict(&id, vec![vec![9.0, 0.0], vec![1.0, 2.0]]).await?.expect("known job");
    assert_eq!(result.labels, vec!["high", "low"]);
    assert_eq!(result.predictions.len(), 2);

    let high = &result.predictions[0];
    assert_eq!(high.label.as_deref(), Some("high"));
    assert_eq!(high.rules.len(), 1);
    assert_eq!(high.rules[0].rule, "level > 5.0");
    assert_eq!(high.rules[0].mass.len(), 3);
    assert!((high.probabilities.iter().sum::<f64>() - 1.0).abs() < 1e-9);

    let low = &result.predictions[1];
    assert_eq!(low.label.as_deref(), Some("low"));
    assert_eq!(low.rules[0].rule, "level <= 5.0");

    let saved = service.saved_rules(&id).await?.expect("known job");
    assert_eq!(saved.rules.labels, vec!["level > 5.0", "level <= 5.0"]);
    assert_eq!(saved.classes, vec!["high", "low"]);
    let params = saved.params.expect("recorded params");
    assert_eq!((params.max_epochs, params.batch_size), (60, 16));
    let bundle = serde_json::to_value(&saved.rules)?;
    for masses in bundle["masses"].as_array().unwrap() {
        let masses: Vec<f64> = serde_json::from_value(masses.clone())?;
        assert!(masses.iter().all(|m| (m * 1000.0).round() / 1000.0 == *m));
        assert!((masses.iter().sum::<f64>() - 1.0).abs() < 1e-6);
    }

    assert!(service.predict("never-submitted", vec![vec![1.0, 1.0]]).await?.is_none());
    let not_trained = service.submit(|_ctx| -> Result<dsrules::jobs::JobOutcome> { anyhow::bail!("no data") }).await?;
    service.wait_idle().await;
    let err = service.saved_rules(&not_trained).await.err().expect("failed job has no model");
    assert!(err.is::<ModelError>());

    let stats = service.stats().await?;
    assert_eq!((stats.completed, stats.error), (1, 1));

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_invalid_request_is_rejected_before_queueing() {
    let dir = tempdir().unwrap();
    let service = service(dir.path(), default_factory());
    let mut bad = request(5);
    bad.params.optim_function = "rmsprop".to_string();
    assert!(service.enqueue_training(bad).await.is_err());
    service.shutdown().await;
}

/// Classifier whose epochs take a fixed time and do nothing
struct SlowClassifier {
    n_classes: usize,
    rules: Vec<Rule>,
    epochs_run: Arc<AtomicUsize>,
}

impl BeliefClassifier for SlowClassifier {
    fn num_classes(&self) -> usize {
        self.n_classes
    }

    fn add_rule(&mut self, rule: Rule) -> Result<(), RuleError> {
        self.rules.push(rule);
        Ok(())
    }

    fn fit<'a>(&'a mut self, _features: &'a [Vec<f64>], _labels: &'a [usize], options: &FitOptions) -> Result<EpochStream<'a>> {
        let max_epochs = options.max_epochs;
        let counter = self.epochs_run.clone();
        Ok(Box::new((1..=max_epochs).map(move |epoch| {
            std::thread::sleep(Duration::from_millis(20));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(EpochReport { epoch, max_epochs, loss: 1.0 / epoch as f64, converged: false })
        })))
    }

    fn predict_proba(&self, features: &[Vec<f64>]) -> Vec<Vec<f64>> {
        vec![vec![1.0 / self.n_classes as f64; self.n_classes]; features.len()]
    }

    fn save(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    fn load(&mut self, _path: &Path) -> Result<()> {
        Ok(())
    }

    fn preds(&self) -> &[Rule] {
        &self.rules
    }

    fn params(&self) -> Vec<MassVector> {
        self.rules.iter().map(|_| MassVector::initial(self.n_classes)).collect()
    }
}

#[tokio::test]
async fn test_stop_is_observed_at_the_next_epoch_boundary() -> Result<()> {
    let dir = tempdir()?;
    let epochs_run = Arc::new(AtomicUsize::new(0));
    let counter = epochs_run.clone();
    let factory: ClassifierFactory = Arc::new(move |n_classes: usize, _columns: Vec<String>| {
        Box::new(SlowClassifier { n_classes, rules: Vec::new(), epochs_run: counter.clone() }) as Box<dyn BeliefClassifier>
    });
    let service = service(dir.path(), factory);

    let id = service.enqueue_training(request(10_000)).await?;
    let mut rx = service.subscribe(&id).expect("live progress entry");
    while rx.borrow_and_update().epoch < 2 {
        rx.changed().await?;
    }

    assert_eq!(service.request_stop(&id), StopOutcome::Requested);
    let at_stop = epochs_run.load(Ordering::SeqCst);

    service.wait_idle().await;
    assert!(epochs_run.load(Ordering::SeqCst) <= at_stop + 1);

    let job = service.job(&id).await?.expect("durable record");
    assert_eq!(job.status, JobStatus::Stopped);
    assert!(job.message.unwrap().contains("stopped by user"));

    let _ = rx.changed().await;
    assert_eq!(rx.borrow().status, STATUS_STOPPED);
    assert_eq!(service.request_stop(&id), StopOutcome::NotFound);

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_two_workers_run_three_jobs() -> Result<()> {
    let dir = tempdir()?;
    let service = service(dir.path(), default_factory());

    let ok_a = service.enqueue_training(request(5)).await?;
    let failing = service.submit(|_ctx| -> Result<dsrules::jobs::JobOutcome> { anyhow::bail!("dataset vanished") }).await?;
    let ok_b = service.enqueue_training(request(5)).await?;
    service.wait_idle().await;

    assert_eq!(service.job(&ok_a).await?.unwrap().status, JobStatus::Completed);
    assert_eq!(service.job(&ok_b).await?.unwrap().status, JobStatus::Completed);
    let failed = service.job(&failing).await?.unwrap();
    assert_eq!(failed.status, JobStatus::Error);
    assert_eq!(failed.message.as_deref(), Some("dataset vanished"));

    service.shutdown().await;
    Ok(())
}

//! Training job: request validation and the body run by a worker.

use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

use super::inference::trained_bundle;
use super::progress::{ProgressSnapshot, STATUS_EVALUATION, STATUS_INITIALIZING};
use super::service::JobContext;
use super::JobOutcome;
use crate::classifier::{ClassifierFactory, FitOptions};
use crate::dataset::{Dataset, LabelEncoder};
use crate::metrics::{self, EVALUATION_STAGES};
use crate::rules::{Rule, RuleBundle};

fn default_max_epochs() -> usize {
    100
}
fn default_min_epochs() -> usize {
    10
}
fn default_batch_size() -> usize {
    4000
}
fn default_loss_function() -> String {
    "MSE".to_string()
}
fn default_optim_function() -> String {
    "adam".to_string()
}
fn default_learning_rate() -> f64 {
    0.001
}
fn default_test_size() -> f64 {
    0.2
}
fn default_split_seed() -> u64 {
    42
}
fn default_shuffle() -> bool {
    true
}

/// Per-job hyperparameters, as sent by API clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingParams {
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    #[serde(default = "default_min_epochs")]
    pub min_epochs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_loss_function")]
    pub loss_function: String,
    #[serde(default = "default_optim_function")]
    pub optim_function: String,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_test_size")]
    pub test_size: f64,
    #[serde(default = "default_split_seed")]
    pub split_seed: u64,
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            max_epochs: default_max_epochs(),
            min_epochs: default_min_epochs(),
            batch_size: default_batch_size(),
            loss_function: default_loss_function(),
            optim_function: default_optim_function(),
            learning_rate: default_learning_rate(),
            test_size: default_test_size(),
            split_seed: default_split_seed(),
            shuffle: default_shuffle(),
        }
    }
}

impl TrainingParams {
    pub fn fit_options(&self) -> Result<FitOptions> {
        Ok(FitOptions {
            max_epochs: self.max_epochs,
            min_epochs: self.min_epochs,
            batch_size: self.batch_size,
            learning_rate: self.learning_rate,
            loss: self.loss_function.parse()?,
            optimizer: self.optim_function.parse()?,
            seed: self.split_seed,
            ..FitOptions::default()
        })
    }
}

/// Rows with their class labels as text
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDataset {
    pub features: Vec<Vec<f64>>,
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingRequest {
    pub columns: Vec<String>,
    pub train: RawDataset,
    /// Held-out rows; split off `train` when absent
    #[serde(default)]
    pub test: Option<RawDataset>,
    #[serde(flatten)]
    pub rules: RuleBundle,
    #[serde(flatten)]
    pub params: TrainingParams,
}

/// A validated request, ready to run on a worker
#[derive(Debug, Clone)]
pub struct TrainingPlan {
    pub columns: Vec<String>,
    pub encoder: LabelEncoder,
    pub rules: Vec<Rule>,
    pub train: Dataset,
    pub test: Dataset,
    pub options: FitOptions,
    pub params: TrainingParams,
}

fn check_rows(name: &str, data: &RawDataset, width: usize) -> Result<()> {
    ensure!(
        data.features.len() == data.targets.len(),
        "{} has {} rows but {} targets",
        name,
        data.features.len(),
        data.targets.len()
    );
    if let Some((i, row)) = data.features.iter().enumerate().find(|(_, row)| row.len() != width) {
        bail!("{} row {} has {} values, expected {}", name, i, row.len(), width);
    }
    Ok(())
}

impl TrainingPlan {
    /// Validates the request synchronously so that bad input is rejected
    /// before a job is queued
    pub fn prepare(request: TrainingRequest) -> Result<Self> {
        let width = request.columns.len();
        ensure!(!request.train.features.is_empty(), "training set is empty");
        check_rows("train", &request.train, width)?;
        if let Some(test) = &request.test {
            check_rows("test", test, width)?;
        }

        let mut all_targets: Vec<&str> = request.train.targets.iter().map(String::as_str).collect();
        if let Some(test) = &request.test {
            all_targets.extend(test.targets.iter().map(String::as_str));
        }
        let encoder = LabelEncoder::fit(&all_targets);

        let rules = request
            .rules
            .into_rules(&request.columns, Some(encoder.len()))
            .context("Failed to compile rules")?;
        ensure!(!rules.is_empty(), "no rules to train");

        let options = request.params.fit_options()?;
        let encode = |data: &RawDataset| -> Result<Dataset> {
            let labels = encoder.transform(&data.targets).context("unknown target label")?;
            Ok(Dataset::new(data.features.clone(), labels))
        };
        let train = encode(&request.train)?;
        let (train, test) = match &request.test {
            Some(test) => (train, encode(test)?),
            None => train.train_test_split(request.params.test_size, request.params.split_seed, request.params.shuffle),
        };

        Ok(Self { columns: request.columns, encoder, rules, train, test, options, params: request.params })
    }
}

pub fn model_path(models_dir: &Path, job_id: &str) -> PathBuf {
    models_dir.join(format!("model_{}.json", job_id))
}

/// Job body: fit, save, evaluate. Checks the stop flag before every epoch.
pub fn run_training(plan: TrainingPlan, ctx: &JobContext, factory: &ClassifierFactory, models_dir: &Path) -> Result<JobOutcome> {
    let job_id = ctx.job_id.as_str();
    ctx.progress.set_status(job_id, STATUS_INITIALIZING);

    let TrainingPlan { columns, encoder, rules, train, test, options, params } = plan;
    let mut model = factory(encoder.len(), columns.clone());
    for rule in rules {
        model.add_rule(rule)?;
    }
    info!(job_id, rules = model.preds().len(), rows = train.len(), "🧠 Training started");

    let started = Instant::now();
    let mut last_loss = None;
    {
        let mut epochs = model.fit(&train.features, &train.labels, &options)?;
        let mut next_epoch = 1;
        loop {
            if ctx.cancel.is_cancelled() {
                info!(job_id, epoch = next_epoch, "🛑 Training stopped by user");
                return Ok(JobOutcome::Stopped { epoch: next_epoch });
            }
            let Some(report) = epochs.next() else {
                break;
            };
            let report = report.with_context(|| format!("Epoch {} failed", next_epoch))?;

            let elapsed = started.elapsed().as_secs_f64();
            let remaining = if report.converged { 0 } else { report.max_epochs.saturating_sub(report.epoch) };
            let eta = elapsed / report.epoch as f64 * remaining as f64;
            ctx.progress.publish(
                job_id,
                ProgressSnapshot::epoch(report.epoch, report.max_epochs, report.loss, elapsed, eta),
            );
            debug!(job_id, epoch = report.epoch, loss = report.loss, "Epoch finished");
            last_loss = Some(report.loss);
            next_epoch = report.epoch + 1;
        }
    }

    let path = model_path(models_dir, job_id);
    model.save(&path).with_context(|| format!("Failed to save model for job {}", job_id))?;

    let elapsed = started.elapsed().as_secs_f64();
    let stage = |n: usize| {
        let mut snapshot = ProgressSnapshot::with_status(STATUS_EVALUATION);
        snapshot.epoch = n;
        snapshot.max_epochs = EVALUATION_STAGES;
        snapshot.time = elapsed;
        ctx.progress.publish(job_id, snapshot);
    };
    stage(0);
    let predicted = model.predict(&test.features);
    let probabilities = model.predict_proba(&test.features);
    let report = metrics::evaluate(&test.labels, &predicted, &probabilities, encoder.classes(), stage);

    Ok(JobOutcome::Completed {
        detail: json!({
            "modelPath": path,
            "labelEncoder": encoder.classes(),
            "columns": &columns,
            "params": params,
            "loss": last_loss,
            "metrics": report,
            "rules": trained_bundle(&*model, &columns),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request_json() -> serde_json::Value {
        json!({
            "columns": ["a", "b"],
            "train": {
                "features": [[0.0, 1.0], [1.0, 1.0], [2.0, 0.0], [3.0, 0.0], [4.0, 1.0]],
                "targets": ["no", "no", "yes", "yes", "yes"]
            },
            "rules": [{"left": "a", "op": ">", "right": 1.5}],
            "maxEpochs": 5,
            "optimFunction": "SGD"
        })
    }

    #[test]
    fn test_request_defaults() {
        let request: TrainingRequest = serde_json::from_value(request_json()).unwrap();
        assert_eq!(request.params.max_epochs, 5);
        assert_eq!(request.params.min_epochs, 10);
        assert_eq!(request.params.batch_size, 4000);
        assert_eq!(request.params.loss_function, "MSE");
        assert_eq!(request.rules.len(), 1);
        assert!(request.test.is_none());
    }

    #[test]
    fn test_prepare_splits_and_encodes() {
        let request: TrainingRequest = serde_json::from_value(request_json()).unwrap();
        let plan = TrainingPlan::prepare(request).unwrap();
        assert_eq!(plan.encoder.classes(), &["no", "yes"]);
        assert_eq!(plan.train.len() + plan.test.len(), 5);
        assert_eq!(plan.test.len(), 1);
        assert_eq!(plan.rules[0].masses().map(|m| m.as_slice().len()), Some(3));
        assert_eq!(plan.options.max_epochs, 5);
    }

    #[test]
    fn test_prepare_rejects_bad_input() {
        let mut value = request_json();
        value["train"]["features"][1] = json!([1.0]);
        let request: TrainingRequest = serde_json::from_value(value).unwrap();
        assert!(TrainingPlan::prepare(request).is_err());

        let mut value = request_json();
        value["rules"] = json!([{"left": "missing", "op": ">", "right": 1}]);
        let request: TrainingRequest = serde_json::from_value(value).unwrap();
        assert!(TrainingPlan::prepare(request).is_err());

        let mut value = request_json();
        value["lossFunction"] = json!("hinge");
        let request: TrainingRequest = serde_json::from_value(value).unwrap();
        assert!(TrainingPlan::prepare(request).is_err());
    }
}

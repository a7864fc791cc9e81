//! Dempster-Shafer rule classifier.
//!
//! Every rule carries masses over the singleton classes and the whole frame
//! (uncertainty). The masses of the rules that fire on a row are combined
//! with Dempster's rule through commonality products, and the combined
//! belief is turned into class probabilities with the pignistic transform:
//!
//! ```text
//! q_j = prod_r (m_rj + m_rT)    qt = prod_r m_rT
//! p_j = (q_j - (1 - 1/k) qt) / (sum_i q_i - (k - 1) qt)
//! ```
//!
//! A row no rule covers gets the uniform distribution.

use anyhow::{anyhow, bail, Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

use super::{BeliefClassifier, EpochReport, EpochStream, FitOptions, LossFunction, Optimizer};
use crate::rules::{MassVector, Rule, RuleBundle, RuleError};

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-8;
const MIN_NORMALIZER: f64 = 1e-12;

pub struct DempsterShaferClassifier {
    n_classes: usize,
    columns: Vec<String>,
    rules: Vec<Rule>,
    /// Trainable masses, `n_classes + 1` per rule
    masses: Vec<Vec<f64>>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SavedModel {
    n_classes: usize,
    columns: Vec<String>,
    rules: RuleBundle,
    masses: Vec<Vec<f64>>,
}

/// Combined belief of the rules firing on one row
struct Combination {
    fired: Vec<usize>,
    commonality: Vec<f64>,
    theta: f64,
    normalizer: f64,
    probabilities: Vec<f64>,
}

impl DempsterShaferClassifier {
    pub fn new(n_classes: usize, columns: Vec<String>) -> Self {
        Self { n_classes: n_classes.max(1), columns, rules: Vec::new(), masses: Vec::new() }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    fn uniform(&self) -> Vec<f64> {
        vec![1.0 / self.n_classes as f64; self.n_classes]
    }

    fn combine(&self, row: &[f64]) -> Combination {
        let k = self.n_classes;
        let fired: Vec<usize> = (0..self.rules.len()).filter(|&r| self.rules[r].matches(row)).collect();

        let mut commonality = vec![1.0; k];
        let mut theta = 1.0;
        for &r in &fired {
            let m = &self.masses[r];
            for (j, q) in commonality.iter_mut().enumerate() {
                *q *= m[j] + m[k];
            }
            theta *= m[k];
        }

        let spread = 1.0 - 1.0 / k as f64;
        let normalizer = commonality.iter().sum::<f64>() - (k as f64 - 1.0) * theta;
        let probabilities = if normalizer < MIN_NORMALIZER {
            self.uniform()
        } else {
            commonality.iter().map(|q| (q - spread * theta) / normalizer).collect()
        };
        Combination { fired, commonality, theta, normalizer, probabilities }
    }

    /// Adds `d loss / d mass` of one row to `grads`, returns the row loss
    fn accumulate(&self, row: &[f64], label: usize, loss_fn: LossFunction, scale: f64, grads: &mut [Vec<f64>]) -> f64 {
        let k = self.n_classes;
        let c = self.combine(row);
        let p = &c.probabilities;

        let (loss, g): (f64, Vec<f64>) = match loss_fn {
            LossFunction::Mse => {
                let loss = (0..k).map(|j| (p[j] - if j == label { 1.0 } else { 0.0 }).powi(2)).sum();
                let g = (0..k).map(|j| 2.0 * (p[j] - if j == label { 1.0 } else { 0.0 })).collect();
                (loss, g)
            }
            LossFunction::CrossEntropy => {
                let py = p[label].max(MIN_NORMALIZER);
                let mut g = vec![0.0; k];
                g[label] = -1.0 / py;
                (-py.ln(), g)
            }
        };

        if c.fired.is_empty() || c.normalizer < MIN_NORMALIZER {
            return loss;
        }

        let spread = 1.0 - 1.0 / k as f64;
        let z = c.normalizer;
        let s: f64 = (0..k).map(|j| g[j] * (c.commonality[j] - spread * c.theta)).sum();
        let g_total: f64 = g.iter().sum();
        let d_q: Vec<f64> = (0..k).map(|i| g[i] / z - s / (z * z)).collect();
        let d_theta = -spread * g_total / z + (k as f64 - 1.0) * s / (z * z);

        // leave-one-out products through prefix and suffix products
        let n = c.fired.len();
        for j in 0..=k {
            let factor = |r: usize| {
                let m = &self.masses[c.fired[r]];
                if j == k {
                    m[k]
                } else {
                    m[j] + m[k]
                }
            };
            let mut prefix = vec![1.0; n + 1];
            for r in 0..n {
                prefix[r + 1] = prefix[r] * factor(r);
            }
            let mut suffix = 1.0;
            for r in (0..n).rev() {
                let others = prefix[r] * suffix;
                let grad = &mut grads[c.fired[r]];
                if j == k {
                    grad[k] += scale * d_theta * others;
                } else {
                    grad[j] += scale * d_q[j] * others;
                    grad[k] += scale * d_q[j] * others;
                }
                suffix *= factor(r);
            }
        }
        loss
    }

    fn project(masses: &mut [f64]) {
        for v in masses.iter_mut() {
            if !v.is_finite() || *v < 0.0 {
                *v = 0.0;
            }
        }
        let total: f64 = masses.iter().sum();
        let last = masses.len() - 1;
        if total <= 0.0 {
            masses[last] = 1.0;
        } else {
            masses.iter_mut().for_each(|v| *v /= total);
        }
    }

    fn check_training_data(&self, features: &[Vec<f64>], labels: &[usize]) -> Result<()> {
        if features.is_empty() {
            bail!("no training rows");
        }
        if features.len() != labels.len() {
            bail!("{} training rows but {} labels", features.len(), labels.len());
        }
        if let Some(bad) = labels.iter().find(|l| **l >= self.n_classes) {
            bail!("label {} is outside the {} classes", bad, self.n_classes);
        }
        Ok(())
    }
}

impl BeliefClassifier for DempsterShaferClassifier {
    fn num_classes(&self) -> usize {
        self.n_classes
    }

    fn add_rule(&mut self, rule: Rule) -> Result<(), RuleError> {
        let masses = match rule.masses() {
            Some(m) if m.n_classes() != self.n_classes => {
                return Err(RuleError::MassArity { expected: self.n_classes + 1, found: m.as_slice().len() });
            }
            Some(m) => m.as_slice().to_vec(),
            None => MassVector::initial(self.n_classes).as_slice().to_vec(),
        };
        self.rules.push(rule);
        self.masses.push(masses);
        Ok(())
    }

    fn fit<'a>(
        &'a mut self,
        features: &'a [Vec<f64>],
        labels: &'a [usize],
        options: &FitOptions,
    ) -> Result<EpochStream<'a>> {
        self.check_training_data(features, labels)?;
        let slots = self.n_classes + 1;
        let n_rules = self.rules.len();
        debug!(rules = n_rules, rows = features.len(), "Starting Dempster-Shafer fit");
        Ok(Box::new(FitEpochs {
            options: options.clone(),
            features,
            labels,
            order: (0..features.len()).collect(),
            rng: StdRng::seed_from_u64(options.seed),
            epoch: 0,
            step: 0,
            previous_loss: None,
            done: false,
            first_moment: vec![vec![0.0; slots]; n_rules],
            second_moment: vec![vec![0.0; slots]; n_rules],
            model: self,
        }))
    }

    fn predict_proba(&self, features: &[Vec<f64>]) -> Vec<Vec<f64>> {
        features.iter().map(|row| self.combine(row).probabilities).collect()
    }

    fn save(&self, path: &Path) -> Result<()> {
        let saved = SavedModel {
            n_classes: self.n_classes,
            columns: self.columns.clone(),
            rules: RuleBundle::from_rules(&self.rules, &self.columns),
            masses: self.masses.clone(),
        };
        let json = serde_json::to_string_pretty(&saved).context("Failed to serialize model")?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("Failed to create model directory {:?}", dir))?;
        }
        fs::write(path, json).with_context(|| format!("Failed to write model file {:?}", path))?;
        Ok(())
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        let json = fs::read_to_string(path).with_context(|| format!("Failed to read model file {:?}", path))?;
        let saved: SavedModel = serde_json::from_str(&json).context("Failed to deserialize model")?;
        let mut bundle = saved.rules;
        bundle.masses.clear();
        let rules = bundle.into_rules(&saved.columns, None).context("Failed to recompile saved rules")?;
        if saved.masses.len() != rules.len() {
            bail!("{} rules but {} mass vectors in {:?}", rules.len(), saved.masses.len(), path);
        }
        if let Some(bad) = saved.masses.iter().find(|m| m.len() != saved.n_classes + 1) {
            return Err(anyhow!(RuleError::MassArity { expected: saved.n_classes + 1, found: bad.len() }));
        }
        self.n_classes = saved.n_classes;
        self.columns = saved.columns;
        self.rules = rules;
        self.masses = saved.masses;
        Ok(())
    }

    fn preds(&self) -> &[Rule] {
        &self.rules
    }

    fn params(&self) -> Vec<MassVector> {
        self.masses.iter().map(|m| MassVector::from_belief(m.clone())).collect()
    }
}

/// Epoch iterator returned by `fit`
struct FitEpochs<'a> {
    model: &'a mut DempsterShaferClassifier,
    options: FitOptions,
    features: &'a [Vec<f64>],
    labels: &'a [usize],
    order: Vec<usize>,
    rng: StdRng,
    epoch: usize,
    step: i32,
    previous_loss: Option<f64>,
    done: bool,
    first_moment: Vec<Vec<f64>>,
    second_moment: Vec<Vec<f64>>,
}

impl FitEpochs<'_> {
    fn apply(&mut self, grads: &[Vec<f64>]) {
        self.step += 1;
        let lr = self.options.learning_rate;
        for (r, grad) in grads.iter().enumerate() {
            let masses = &mut self.model.masses[r];
            match self.options.optimizer {
                Optimizer::Sgd => {
                    for (m, g) in masses.iter_mut().zip(grad) {
                        *m -= lr * g;
                    }
                }
                Optimizer::Adam => {
                    let (m1, m2) = (&mut self.first_moment[r], &mut self.second_moment[r]);
                    for i in 0..grad.len() {
                        m1[i] = ADAM_BETA1 * m1[i] + (1.0 - ADAM_BETA1) * grad[i];
                        m2[i] = ADAM_BETA2 * m2[i] + (1.0 - ADAM_BETA2) * grad[i] * grad[i];
                        let m_hat = m1[i] / (1.0 - ADAM_BETA1.powi(self.step));
                        let v_hat = m2[i] / (1.0 - ADAM_BETA2.powi(self.step));
                        masses[i] -= lr * m_hat / (v_hat.sqrt() + ADAM_EPS);
                    }
                }
            }
            DempsterShaferClassifier::project(masses);
        }
    }

    fn run_epoch(&mut self) -> f64 {
        self.order.shuffle(&mut self.rng);
        let batch_size = self.options.batch_size.max(1);
        let slots = self.model.n_classes + 1;
        let n_rules = self.model.rules.len();
        let mut total_loss = 0.0;

        let order = std::mem::take(&mut self.order);
        for batch in order.chunks(batch_size) {
            let scale = 1.0 / batch.len() as f64;
            let mut grads = vec![vec![0.0; slots]; n_rules];
            for &i in batch {
                total_loss += self.model.accumulate(
                    &self.features[i],
                    self.labels[i],
                    self.options.loss,
                    scale,
                    &mut grads,
                );
            }
            if n_rules > 0 {
                self.apply(&grads);
            }
        }
        self.order = order;
        total_loss / self.features.len() as f64
    }
}

impl Iterator for FitEpochs<'_> {
    type Item = Result<EpochReport>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        self.epoch += 1;
        let loss = self.run_epoch();
        if !loss.is_finite() {
            self.done = true;
            return Some(Err(anyhow!("loss diverged at epoch {}", self.epoch)));
        }

        let settled = self
            .previous_loss
            .map(|prev| (prev - loss).abs() < self.options.tolerance)
            .unwrap_or(false);
        let converged = self.epoch >= self.options.min_epochs && settled;
        if converged || self.epoch >= self.options.max_epochs {
            self.done = true;
        }
        self.previous_loss = Some(loss);
        Some(Ok(EpochReport { epoch: self.epoch, max_epochs: self.options.max_epochs, loss, converged }))
    }
}

//! Belief Classifier Contract
//!
//! The training pipeline only talks to `BeliefClassifier`. The crate ships
//! `DempsterShaferClassifier` as the reference model; tests and embedders
//! can plug in their own through a `ClassifierFactory`.

pub mod dempster_shafer;

pub use dempster_shafer::DempsterShaferClassifier;

use anyhow::{bail, Result};
use serde::Serialize;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use crate::rules::{MassVector, Rule, RuleError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Optimizer {
    Sgd,
    Adam,
}

impl FromStr for Optimizer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sgd" => Ok(Optimizer::Sgd),
            "adam" => Ok(Optimizer::Adam),
            other => bail!("unknown optimizer '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LossFunction {
    #[serde(rename = "MSE")]
    Mse,
    #[serde(rename = "CE")]
    CrossEntropy,
}

impl FromStr for LossFunction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "MSE" => Ok(LossFunction::Mse),
            "CE" | "CROSSENTROPY" | "CROSS_ENTROPY" => Ok(LossFunction::CrossEntropy),
            other => bail!("unknown loss function '{}'", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FitOptions {
    pub max_epochs: usize,
    pub min_epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub loss: LossFunction,
    pub optimizer: Optimizer,
    /// Training stops once past `min_epochs` and the loss moved less than this
    pub tolerance: f64,
    pub seed: u64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_epochs: 100,
            min_epochs: 10,
            batch_size: 4000,
            learning_rate: 0.001,
            loss: LossFunction::Mse,
            optimizer: Optimizer::Adam,
            tolerance: 1e-4,
            seed: 42,
        }
    }
}

/// One finished epoch
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochReport {
    pub epoch: usize,
    pub max_epochs: usize,
    pub loss: f64,
    pub converged: bool,
}

/// Lazy training: each `next` runs one epoch
pub type EpochStream<'a> = Box<dyn Iterator<Item = Result<EpochReport>> + Send + 'a>;

pub trait BeliefClassifier: Send {
    fn num_classes(&self) -> usize;

    fn add_rule(&mut self, rule: Rule) -> Result<(), RuleError>;

    fn fit<'a>(&'a mut self, features: &'a [Vec<f64>], labels: &'a [usize], options: &FitOptions)
        -> Result<EpochStream<'a>>;

    fn predict_proba(&self, features: &[Vec<f64>]) -> Vec<Vec<f64>>;

    fn predict(&self, features: &[Vec<f64>]) -> Vec<usize> {
        self.predict_proba(features)
            .iter()
            .map(|p| {
                p.iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(i, _)| i)
                    .unwrap_or(0)
            })
            .collect()
    }

    fn save(&self, path: &Path) -> Result<()>;

    fn load(&mut self, path: &Path) -> Result<()>;

    /// Rules in insertion order, with predicate and caption
    fn preds(&self) -> &[Rule];

    /// Current mass vector of every rule
    fn params(&self) -> Vec<MassVector>;
}

/// Builds a classifier from the class count and the ordered column names
pub type ClassifierFactory = Arc<dyn Fn(usize, Vec<String>) -> Box<dyn BeliefClassifier> + Send + Sync>;

pub fn default_factory() -> ClassifierFactory {
    Arc::new(|n_classes: usize, columns: Vec<String>| {
        Box::new(DempsterShaferClassifier::new(n_classes, columns)) as Box<dyn BeliefClassifier>
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_names_are_case_insensitive() {
        assert_eq!("ADAM".parse::<Optimizer>().unwrap(), Optimizer::Adam);
        assert_eq!("sgd".parse::<Optimizer>().unwrap(), Optimizer::Sgd);
        assert_eq!("mse".parse::<LossFunction>().unwrap(), LossFunction::Mse);
        assert_eq!("CE".parse::<LossFunction>().unwrap(), LossFunction::CrossEntropy);
        assert!("rmsprop".parse::<Optimizer>().is_err());
    }

    #[test]
    fn test_default_factory_builds_reference_model() {
        let classifier = default_factory()(3, vec!["a".into()]);
        assert_eq!(classifier.num_classes(), 3);
        assert!(classifier.preds().is_empty());
    }
}

//! Prediction and rule read-back from a trained model file.

use serde::Serialize;
use thiserror::Error;

use super::training::TrainingParams;
use super::JobStatus;
use crate::classifier::BeliefClassifier;
use crate::rules::{Rule, RuleBundle};

#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("job {id} has no trained model (status {status})")]
    NotTrained { id: String, status: JobStatus },

    #[error("no rows to predict")]
    NoRows,
}

/// Rule that fired on a row, with its trained masses
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FiredRule {
    pub rule: String,
    pub mass: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowPrediction {
    pub class: usize,
    pub label: Option<String>,
    pub probabilities: Vec<f64>,
    pub rules: Vec<FiredRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Predictions {
    pub predictions: Vec<RowPrediction>,
    /// Class labels, indexed by `RowPrediction::class`
    pub labels: Vec<String>,
}

/// Trained rules as an exchange bundle, plus what the job was trained with
#[derive(Debug, Clone, Serialize)]
pub struct SavedRules {
    #[serde(flatten)]
    pub rules: RuleBundle,
    pub classes: Vec<String>,
    pub params: Option<TrainingParams>,
}

/// Rules of `model` carrying their current masses, rounded
pub fn trained_bundle(model: &dyn BeliefClassifier, columns: &[String]) -> RuleBundle {
    let trained: Vec<Rule> = model
        .preds()
        .iter()
        .zip(model.params())
        .map(|(rule, masses)| rule.clone().with_masses(masses))
        .collect();
    RuleBundle::from_rules(&trained, columns)
}

/// A model read back from disk with what its job recorded about it
pub struct TrainedModel {
    pub model: Box<dyn BeliefClassifier>,
    pub classes: Vec<String>,
    pub columns: Vec<String>,
    pub params: Option<TrainingParams>,
}

impl TrainedModel {
    pub fn predict(&self, features: &[Vec<f64>]) -> Result<Predictions, ModelError> {
        if features.is_empty() {
            return Err(ModelError::NoRows);
        }
        let classes = self.model.predict(features);
        let probabilities = self.model.predict_proba(features);
        let masses = self.model.params();
        let rules = self.model.preds();

        let predictions = features
            .iter()
            .zip(classes)
            .zip(probabilities)
            .map(|((row, class), probabilities)| RowPrediction {
                class,
                label: self.classes.get(class).cloned(),
                probabilities,
                rules: rules
                    .iter()
                    .zip(&masses)
                    .filter(|(rule, _)| rule.matches(row))
                    .map(|(rule, mass)| FiredRule { rule: rule.caption().to_string(), mass: mass.as_slice().to_vec() })
                    .collect(),
            })
            .collect();
        Ok(Predictions { predictions, labels: self.classes.clone() })
    }

    pub fn saved_rules(&self) -> SavedRules {
        SavedRules {
            rules: trained_bundle(&*self.model, &self.columns),
            classes: self.classes.clone(),
            params: self.params.clone(),
        }
    }
}

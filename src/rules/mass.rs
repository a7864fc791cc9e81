use serde::{Deserialize, Serialize};

use super::RuleError;

const SUM_TOLERANCE: f64 = 1e-6;

pub(crate) fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Belief masses of one rule: one slot per class followed by the
/// uncertainty slot. Every slot is rounded to 3 decimals and the last slot
/// always closes the vector to 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct MassVector {
    values: Vec<f64>,
    uncertainty_fixed: bool,
}

impl MassVector {
    /// Validates and normalizes a user supplied vector
    pub fn normalize(raw: &[f64]) -> Result<Self, RuleError> {
        let invalid = |reason: &str| RuleError::InvalidMasses { values: raw.to_vec(), reason: reason.to_string() };
        if raw.len() < 2 {
            return Err(invalid("at least one class slot and the uncertainty slot are required"));
        }
        if raw.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(invalid("masses must be finite and non-negative"));
        }
        let uncertainty_fixed = (raw.iter().sum::<f64>() - 1.0).abs() <= SUM_TOLERANCE;

        let mut values: Vec<f64> = raw.iter().copied().map(round3).collect();
        let last = values.len() - 1;
        values[last] = round3(1.0 - values[..last].iter().sum::<f64>());
        if values[last] < 0.0 {
            return Err(invalid("class masses add up to more than 1"));
        }
        Ok(Self { values, uncertainty_fixed })
    }

    /// Starting masses for a new rule: most of the weight on uncertainty
    pub fn initial(n_classes: usize) -> Self {
        let k = n_classes.max(1);
        let mut raw = vec![0.2 / k as f64; k];
        raw.push(0.8);
        Self::from_belief(raw)
    }

    /// Builds a vector from model output. Never fails: any rounding excess
    /// is taken from the largest class mass.
    pub fn from_belief(mut values: Vec<f64>) -> Self {
        if values.is_empty() {
            values.push(1.0);
        }
        for v in values.iter_mut() {
            *v = if v.is_finite() { round3(v.max(0.0)) } else { 0.0 };
        }
        let last = values.len() - 1;
        let mut closing = round3(1.0 - values[..last].iter().sum::<f64>());
        if closing < 0.0 {
            let largest = values[..last]
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                .unwrap_or(0);
            values[largest] = round3((values[largest] + closing).max(0.0));
            closing = 0.0;
        }
        values[last] = closing.max(0.0);
        Self { values, uncertainty_fixed: true }
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    pub fn singletons(&self) -> &[f64] {
        &self.values[..self.values.len() - 1]
    }

    /// Uncertainty mass, when the input vector determined it (summed to 1)
    pub fn uncertainty(&self) -> Option<f64> {
        self.uncertainty_fixed.then(|| self.uncertainty_mass())
    }

    /// The closing slot, whether or not the input determined it
    pub fn uncertainty_mass(&self) -> f64 {
        self.values[self.values.len() - 1]
    }

    pub fn n_classes(&self) -> usize {
        self.values.len() - 1
    }
}

impl TryFrom<Vec<f64>> for MassVector {
    type Error = RuleError;

    fn try_from(values: Vec<f64>) -> Result<Self, Self::Error> {
        Self::normalize(&values)
    }
}

impl From<MassVector> for Vec<f64> {
    fn from(masses: MassVector) -> Self {
        masses.values
    }
}

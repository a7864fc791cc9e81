use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use super::{MassVector, Rule, RuleError};
use crate::condition::{Bindings, Comparator, Comparison, ConditionNode, Scalar, ValueExpression};

/// Builds statistics-driven starting rules from a feature matrix.
///
/// `encoders` maps a column name to its label encoding (original label ->
/// code) so that equality rules on categorical columns can be captioned
/// with the original label.
#[derive(Debug, Clone)]
pub struct RuleGenerator {
    breaks: usize,
    n_classes: usize,
    encoders: HashMap<String, BTreeMap<String, i64>>,
    categorical_limit: usize,
}

impl RuleGenerator {
    pub fn new(n_classes: usize) -> Self {
        Self { breaks: 3, n_classes, encoders: HashMap::new(), categorical_limit: 5 }
    }

    pub fn with_breaks(mut self, breaks: usize) -> Self {
        self.breaks = breaks.max(1);
        self
    }

    pub fn with_encoders(mut self, encoders: HashMap<String, BTreeMap<String, i64>>) -> Self {
        self.encoders = encoders;
        self
    }

    pub fn with_categorical_limit(mut self, limit: usize) -> Self {
        self.categorical_limit = limit;
        self
    }

    /// Single-rule and pair-rule generation; rules that cover no row are dropped
    pub fn generate(
        &self,
        features: &[Vec<f64>],
        columns: &[String],
        single: bool,
        pairs: bool,
    ) -> Result<Vec<Rule>, RuleError> {
        let mut rules = Vec::new();
        if single {
            rules.extend(self.single_rules(features, columns)?);
        }
        if pairs {
            rules.extend(self.pair_rules(features, columns)?);
        }
        let before = rules.len();
        rules.retain(|rule| features.iter().any(|row| rule.matches(row)));
        debug!(generated = before, kept = rules.len(), "Dropped rules without coverage");
        Ok(rules)
    }

    /// Per column: one equality rule per value of a low-cardinality integral
    /// column, otherwise `breaks + 1` intervals around normal quantiles.
    pub fn single_rules(&self, features: &[Vec<f64>], columns: &[String]) -> Result<Vec<Rule>, RuleError> {
        let mut rules = Vec::new();
        for (position, name) in columns.iter().enumerate() {
            let values = column_values(features, position);
            if values.is_empty() {
                continue;
            }
            let distinct: BTreeSet<i64> = values.iter().filter(|v| v.fract() == 0.0).map(|v| *v as i64).collect();
            let integral = values.iter().all(|v| v.fract() == 0.0);
            if integral && distinct.len() <= self.categorical_limit {
                for value in distinct {
                    rules.push(self.equality_rule(position, name, value, columns)?);
                }
            } else {
                rules.extend(self.interval_rules(position, name, &values, columns)?);
            }
        }
        Ok(rules)
    }

    /// For every pair of columns, the four quadrants around the column means
    pub fn pair_rules(&self, features: &[Vec<f64>], columns: &[String]) -> Result<Vec<Rule>, RuleError> {
        let means: Vec<Option<f64>> = (0..columns.len())
            .map(|position| {
                let values = column_values(features, position);
                (!values.is_empty()).then(|| mean(&values))
            })
            .collect();

        let mut rules = Vec::new();
        for i in 0..columns.len() {
            for j in (i + 1)..columns.len() {
                let (Some(mi), Some(mj)) = (means[i], means[j]) else {
                    continue;
                };
                for (op_i, op_j) in [
                    (Comparator::Gt, Comparator::Gt),
                    (Comparator::Gt, Comparator::Le),
                    (Comparator::Le, Comparator::Gt),
                    (Comparator::Le, Comparator::Le),
                ] {
                    let condition = ConditionNode::and(vec![
                        ConditionNode::Comparison(Comparison::new(indexed("var0"), op_i, bound("var1"))),
                        ConditionNode::Comparison(Comparison::new(indexed("var2"), op_j, bound("var3"))),
                    ]);
                    let bindings = bindings_of([
                        ("var0", Scalar::from(i)),
                        ("var1", Scalar::Float(mi)),
                        ("var2", Scalar::from(j)),
                        ("var3", Scalar::Float(mj)),
                    ]);
                    let caption = format!(
                        "{} {} {:.3}, {} {} {:.3}",
                        columns[i],
                        op_i.symbol(),
                        mi,
                        columns[j],
                        op_j.symbol(),
                        mj
                    );
                    rules.push(self.finish(condition, bindings, columns, caption)?);
                }
            }
        }
        Ok(rules)
    }

    fn equality_rule(&self, position: usize, name: &str, value: i64, columns: &[String]) -> Result<Rule, RuleError> {
        let condition = ConditionNode::Comparison(Comparison::new(indexed("var0"), Comparator::Eq, bound("var1")));
        let bindings = bindings_of([("var0", Scalar::from(position)), ("var1", Scalar::Int(value))]);
        let label = self
            .encoders
            .get(name)
            .and_then(|encoder| encoder.iter().find(|(_, code)| **code == value))
            .map(|(label, _)| label.clone())
            .unwrap_or_else(|| value.to_string());
        self.finish(condition, bindings, columns, format!("{} = {}", name, label))
    }

    fn interval_rules(
        &self,
        position: usize,
        name: &str,
        values: &[f64],
        columns: &[String],
    ) -> Result<Vec<Rule>, RuleError> {
        let mu = mean(values);
        let sigma = std_dev(values, mu);
        let cuts: Vec<f64> = (1..=self.breaks)
            .map(|i| mu + sigma * normal_quantile(i as f64 / (self.breaks + 1) as f64))
            .collect();

        let mut rules = Vec::with_capacity(cuts.len() + 1);
        let first = ConditionNode::Comparison(Comparison::new(indexed("var0"), Comparator::Le, bound("var1")));
        rules.push(self.finish(
            first,
            bindings_of([("var0", Scalar::from(position)), ("var1", Scalar::Float(cuts[0]))]),
            columns,
            format!("{} < {:.3}", name, cuts[0]),
        )?);

        for window in cuts.windows(2) {
            let (low, high) = (window[0], window[1]);
            let middle = ConditionNode::ChainedComparison(vec![
                Comparison::new(indexed("var0"), Comparator::Gt, bound("var1")),
                Comparison::new(indexed("var0"), Comparator::Le, bound("var2")),
            ]);
            rules.push(self.finish(
                middle,
                bindings_of([
                    ("var0", Scalar::from(position)),
                    ("var1", Scalar::Float(low)),
                    ("var2", Scalar::Float(high)),
                ]),
                columns,
                format!("{:.3} < {} < {:.3}", low, name, high),
            )?);
        }

        let last_cut = cuts[cuts.len() - 1];
        let last = ConditionNode::Comparison(Comparison::new(indexed("var0"), Comparator::Gt, bound("var1")));
        rules.push(self.finish(
            last,
            bindings_of([("var0", Scalar::from(position)), ("var1", Scalar::Float(last_cut))]),
            columns,
            format!("{} > {:.3}", name, last_cut),
        )?);
        Ok(rules)
    }

    fn finish(
        &self,
        condition: ConditionNode,
        bindings: Bindings,
        columns: &[String],
        caption: String,
    ) -> Result<Rule, RuleError> {
        Ok(Rule::compile(condition, bindings, columns, Some(caption))?.with_masses(MassVector::initial(self.n_classes)))
    }
}

fn indexed(var: &str) -> ValueExpression {
    ValueExpression::row_item(ValueExpression::variable(var))
}

fn bound(var: &str) -> ValueExpression {
    ValueExpression::variable(var)
}

fn bindings_of<const N: usize>(pairs: [(&str, Scalar); N]) -> Bindings {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn column_values(features: &[Vec<f64>], position: usize) -> Vec<f64> {
    features
        .iter()
        .filter_map(|row| row.get(position).copied())
        .filter(|v| v.is_finite())
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation
fn std_dev(values: &[f64], mean: f64) -> f64 {
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Inverse of the standard normal CDF (Acklam's rational approximation)
pub fn normal_quantile(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969683028665376e+01,
        2.209460984245205e+02,
        -2.759285104469687e+02,
        1.383577518672690e+02,
        -3.066479806614716e+01,
        2.506628277459239e+00,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e+01,
        1.615858368580409e+02,
        -1.556989798598866e+02,
        6.680131188771972e+01,
        -1.328068155288572e+01,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-03,
        -3.223964580411365e-01,
        -2.400758277161838e+00,
        -2.549732539343734e+00,
        4.374664141464968e+00,
        2.938163982698783e+00,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-03,
        3.224671290700398e-01,
        2.445134137142996e+00,
        3.754408661907416e+00,
    ];
    const P_LOW: f64 = 0.02425;

    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}

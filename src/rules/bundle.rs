use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use super::{MassVector, Rule, RuleError};
use crate::condition::{label_index_bindings, position_index_bindings, Bindings, ConditionNode};

/// One rule in exchange form: `[condition, bindings]`
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedRule {
    pub condition: ConditionNode,
    pub bindings: Bindings,
}

impl Serialize for EncodedRule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.condition, &self.bindings).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EncodedRule {
    /// Accepts `[condition, bindings]` or a bare condition. A two item list
    /// whose second item carries an `op` is a legacy chain, not a pair.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        if let Value::Array(items) = &value {
            if let [condition, Value::Object(bindings)] = items.as_slice() {
                if !bindings.contains_key("op") {
                    let condition = ConditionNode::from_canonical(condition).map_err(serde::de::Error::custom)?;
                    let bindings: Bindings = serde_json::from_value(Value::Object(bindings.clone()))
                        .map_err(serde::de::Error::custom)?;
                    return Ok(Self { condition, bindings });
                }
            }
        }
        let condition = ConditionNode::from_canonical(&value).map_err(serde::de::Error::custom)?;
        Ok(Self { condition, bindings: Bindings::new() })
    }
}

/// Rules as they cross the API: parallel lists of encoded rules, mass
/// vectors and captions. Index bindings travel as column names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleBundle {
    pub rules: Vec<EncodedRule>,
    #[serde(default)]
    pub masses: Vec<Vec<f64>>,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl RuleBundle {
    /// Exports compiled rules. Masses are included only when every rule
    /// has them.
    pub fn from_rules(rules: &[Rule], columns: &[String]) -> Self {
        let encoded = rules
            .iter()
            .map(|rule| EncodedRule {
                condition: rule.condition().clone(),
                bindings: label_index_bindings(rule.condition(), rule.bindings(), columns),
            })
            .collect();
        let masses = rules
            .iter()
            .map(|rule| rule.masses().map(|m| m.as_slice().to_vec()))
            .collect::<Option<Vec<_>>>()
            .unwrap_or_default();
        Self {
            rules: encoded,
            masses,
            labels: rules.iter().map(|rule| rule.caption().to_string()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Compiles every rule against `columns`. Missing masses default to
    /// `MassVector::initial` when the class count is known; missing labels
    /// are derived from the conditions.
    pub fn into_rules(&self, columns: &[String], n_classes: Option<usize>) -> Result<Vec<Rule>, RuleError> {
        let mismatched = |len: usize| len != 0 && len != self.rules.len();
        if mismatched(self.masses.len()) || mismatched(self.labels.len()) {
            return Err(RuleError::LengthMismatch {
                rules: self.rules.len(),
                masses: self.masses.len(),
                labels: self.labels.len(),
            });
        }

        let mut rules = Vec::with_capacity(self.rules.len());
        for (i, encoded) in self.rules.iter().enumerate() {
            let bindings = position_index_bindings(&encoded.condition, &encoded.bindings, columns);
            let caption = self.labels.get(i).cloned();
            let mut rule = Rule::compile(encoded.condition.clone(), bindings, columns, caption)?;

            let masses = match self.masses.get(i) {
                Some(raw) => Some(MassVector::normalize(raw)?),
                None => n_classes.map(MassVector::initial),
            };
            if let Some(masses) = masses {
                if let Some(k) = n_classes {
                    if masses.n_classes() != k {
                        return Err(RuleError::MassArity { expected: k + 1, found: masses.as_slice().len() });
                    }
                }
                rule = rule.with_masses(masses);
            }
            rules.push(rule);
        }
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Scalar;
    use serde_json::json;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn bundle_json() -> Value {
        json!({
            "rules": [
                [{"left": {"base": "x", "index": "var0"}, "op": ">", "right": "var1"}, {"var0": "petal", "var1": 1.5}],
                {"left": "sepal", "op": "<=", "right": 3}
            ],
            "masses": [[0.1, 0.2, 0.7], [0.3, 0.3, 0.1]],
            "labels": ["petal > 1.5", "sepal <= 3"]
        })
    }

    #[test]
    fn test_pairs_and_bare_conditions() {
        let bundle: RuleBundle = serde_json::from_value(bundle_json()).unwrap();
        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle.rules[0].bindings["var0"], Scalar::Text("petal".into()));
        assert!(bundle.rules[1].bindings.is_empty());
    }

    #[test]
    fn test_legacy_chain_is_not_mistaken_for_a_pair() {
        let encoded: EncodedRule = serde_json::from_value(json!([
            {"left": "x", "op": ">", "right": 0},
            {"left": "x", "op": "<", "right": 2}
        ]))
        .unwrap();
        assert!(matches!(encoded.condition, ConditionNode::ChainedComparison(ref items) if items.len() == 2));
        assert!(encoded.bindings.is_empty());
    }

    #[test]
    fn test_into_rules_positions_index_bindings() {
        let bundle: RuleBundle = serde_json::from_value(bundle_json()).unwrap();
        let columns = cols(&["sepal", "petal"]);
        let rules = bundle.into_rules(&columns, Some(2)).unwrap();
        assert_eq!(rules[0].bindings()["var0"], Scalar::Int(1));
        assert!(rules[0].matches(&[0.0, 2.0]));
        let masses = rules[1].masses().unwrap();
        assert!((masses.uncertainty_mass() - 0.4).abs() < 1e-9);
        assert_eq!(masses.uncertainty(), None);
        assert_eq!(rules[1].caption(), "sepal <= 3");

        let exported = RuleBundle::from_rules(&rules, &columns);
        assert_eq!(exported.rules[0].bindings["var0"], Scalar::Text("petal".into()));
        assert_eq!(exported.masses.len(), 2);
    }

    #[test]
    fn test_length_and_arity_checks() {
        let mut bundle: RuleBundle = serde_json::from_value(bundle_json()).unwrap();
        let columns = cols(&["sepal", "petal"]);
        assert!(matches!(bundle.into_rules(&columns, Some(3)), Err(RuleError::MassArity { expected: 4, found: 3 })));

        bundle.labels.pop();
        assert!(matches!(bundle.into_rules(&columns, None), Err(RuleError::LengthMismatch { rules: 2, .. })));
    }

    #[test]
    fn test_missing_masses_default_when_classes_are_known() {
        let bundle: RuleBundle = serde_json::from_value(json!({"rules": [{"left": "a", "op": ">", "right": 1}]})).unwrap();
        let rules = bundle.into_rules(&cols(&["a"]), Some(2)).unwrap();
        assert_eq!(rules[0].masses().unwrap().as_slice(), &[0.1, 0.1, 0.8]);
        assert_eq!(rules[0].caption(), "a > 1");
    }
}

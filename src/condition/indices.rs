use std::collections::BTreeSet;

use super::{Bindings, Comparison, ConditionNode, Scalar, ValueExpression};

/// Names of the free variables used as a subscript index anywhere in the tree
pub fn collect_index_variables(node: &ConditionNode) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    visit_node(node, &mut names);
    names
}

fn visit_node(node: &ConditionNode, names: &mut BTreeSet<String>) {
    match node {
        ConditionNode::Comparison(cmp) => visit_comparison(cmp, names),
        ConditionNode::ChainedComparison(items) => items.iter().for_each(|c| visit_comparison(c, names)),
        ConditionNode::BooleanCombination { children, .. } => children.iter().for_each(|c| visit_node(c, names)),
    }
}

fn visit_comparison(cmp: &Comparison, names: &mut BTreeSet<String>) {
    visit_value(&cmp.left, names);
    visit_value(&cmp.right, names);
}

fn visit_value(value: &ValueExpression, names: &mut BTreeSet<String>) {
    match value {
        ValueExpression::Subscript { base, index } => {
            if let ValueExpression::Variable(name) = index.as_ref() {
                names.insert(name.clone());
            }
            visit_value(base, names);
            visit_value(index, names);
        }
        ValueExpression::BinaryOp { left, right, .. } => {
            visit_value(left, names);
            visit_value(right, names);
        }
        ValueExpression::Variable(_) | ValueExpression::Constant(_) | ValueExpression::Opaque(_) => {}
    }
}

/// Rewrites positional index bindings to column names, e.g. `var0 = 2`
/// becomes `var0 = "petal"` for display. Positions outside `columns` stay.
pub fn label_index_bindings(node: &ConditionNode, bindings: &Bindings, columns: &[String]) -> Bindings {
    let mut labeled = bindings.clone();
    for name in collect_index_variables(node) {
        let Some(value) = labeled.get_mut(&name) else {
            continue;
        };
        let column = value
            .as_position()
            .and_then(|p| usize::try_from(p).ok())
            .and_then(|p| columns.get(p));
        if let Some(column) = column {
            *value = Scalar::Text(column.clone());
        }
    }
    labeled
}

/// Inverse of `label_index_bindings`: column names back to positions.
/// Unknown names stay as text.
pub fn position_index_bindings(node: &ConditionNode, bindings: &Bindings, columns: &[String]) -> Bindings {
    let mut positioned = bindings.clone();
    for name in collect_index_variables(node) {
        if let Some(value) = positioned.get_mut(&name) {
            if let Scalar::Text(text) = value {
                if let Some(p) = columns.iter().position(|c| c == text) {
                    *value = Scalar::from(p);
                }
            }
        }
    }
    positioned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::parse_expression;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_collects_only_index_variables() {
        let node = parse_expression("x[var0] > var1 and x[var0] <= var2 or y == 3").unwrap();
        let names = collect_index_variables(&node);
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["var0".to_string()]);
    }

    #[test]
    fn test_constant_index_is_not_collected() {
        let node = parse_expression("x[0] > 5 and y == 10").unwrap();
        assert!(collect_index_variables(&node).is_empty());
    }

    #[test]
    fn test_descends_into_arithmetic_and_nested_indices() {
        let node = parse_expression("(x[a] + 1) * 2 > x[x[b]]").unwrap();
        let names: Vec<_> = collect_index_variables(&node).into_iter().collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_label_and_position_are_inverse() {
        let node = parse_expression("x[var0] > var1").unwrap();
        let columns = cols(&["sepal", "petal"]);
        let mut bindings = Bindings::new();
        bindings.insert("var0".into(), Scalar::Int(1));
        bindings.insert("var1".into(), Scalar::Int(1));

        let labeled = label_index_bindings(&node, &bindings, &columns);
        assert_eq!(labeled["var0"], Scalar::Text("petal".into()));
        // thresholds are not indices
        assert_eq!(labeled["var1"], Scalar::Int(1));

        assert_eq!(position_index_bindings(&node, &labeled, &columns), bindings);
    }

    #[test]
    fn test_out_of_range_positions_are_left_alone() {
        let node = parse_expression("x[var0] > 1").unwrap();
        let mut bindings = Bindings::new();
        bindings.insert("var0".into(), Scalar::Int(7));
        assert_eq!(label_index_bindings(&node, &bindings, &cols(&["a"])), bindings);
    }
}

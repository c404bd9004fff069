//! Condition evaluation for `IfCondition` steps.

use crate::step_types::ConditionType;
use std::cmp::Ordering;

/// Numeric value of `s` when it parses as a finite number.
pub fn to_number(s: &str) -> Option<f64> {
    s.trim()
        .replace(',', "")
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
}

/// Orders two cell values numerically when both are numbers, otherwise as text.
pub fn compare_values(a: &str, b: &str) -> Ordering {
    match (to_number(a), to_number(b)) {
        (Some(av), Some(bv)) => av.partial_cmp(&bv).unwrap_or(Ordering::Equal),
        _ => a.cmp(b),
    }
}

/// Evaluates a variable condition. `left` is the variable's value, `right`
/// the substituted comparison value.
pub fn compare(kind: ConditionType, left: &str, right: &str) -> bool {
    match kind {
        ConditionType::VariableEquals => left == right,
        ConditionType::VariableNotEquals => left != right,
        ConditionType::VariableContains => left.contains(right),
        ConditionType::VariableGreater => compare_values(left, right) == Ordering::Greater,
        ConditionType::VariableLess => compare_values(left, right) == Ordering::Less,
        ConditionType::VariableNotEmpty => !left.trim().is_empty(),
        // Screen conditions are resolved by the executor.
        ConditionType::ImageExists | ConditionType::TextExists => false,
    }
}

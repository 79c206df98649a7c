//! Threshold rules shared by the JSON metrics and SSH executors.
//!
//! A rule addresses a value inside a JSON document by path, compares it
//! against an expected value and carries a severity. The path grammar is
//! deliberately small: `$`, `$.field`, `$.field.sub`, `$.items.0.value`
//! and the bracket spelling `$.items[0].value`. No wildcards, no escaped
//! dots.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub path: String,
    pub op: Op,
    pub value: Value,
    pub severity: Severity,
}

/// One rule that did not hold, reported in the result payload.
#[derive(Debug, Clone, Serialize)]
pub struct RuleFailure {
    pub path: String,
    pub op: Op,
    pub expected: Value,
    pub actual: Value,
    pub severity: Severity,
}

/// Evaluate all rules against a JSON document, returning the failures.
pub fn evaluate(payload: &Value, rules: &[ThresholdRule]) -> Vec<RuleFailure> {
    let mut failures = Vec::new();
    for rule in rules {
        let actual = resolve_path(payload, &rule.path);
        let holds = actual
            .map(|value| compare(rule.op, value, &rule.value))
            .unwrap_or(false);
        if !holds {
            failures.push(RuleFailure {
                path: rule.path.clone(),
                op: rule.op,
                expected: rule.value.clone(),
                actual: actual.cloned().unwrap_or(Value::Null),
                severity: rule.severity,
            });
        }
    }
    failures
}

/// True when at least one failure is critical.
pub fn has_critical(failures: &[RuleFailure]) -> bool {
    failures.iter().any(|f| f.severity == Severity::Critical)
}

/// Walk a dotted path into a JSON document.
pub fn resolve_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    if path == "$" {
        return Some(payload);
    }

    // `$.items[0].value` is spelled the same as `$.items.0.value`.
    let normalized = path.replace('[', ".").replace(']', "");
    let trimmed = normalized.strip_prefix("$.").unwrap_or(&normalized);

    let mut current = payload;
    for part in trimmed.split('.').filter(|p| !p.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn compare(op: Op, actual: &Value, expected: &Value) -> bool {
    match op {
        Op::Eq => json_eq(actual, expected),
        Op::Ne => !json_eq(actual, expected),
        ordering => match (actual.as_f64(), expected.as_f64()) {
            (Some(a), Some(e)) => match ordering {
                Op::Lt => a < e,
                Op::Le => a <= e,
                Op::Gt => a > e,
                Op::Ge => a >= e,
                _ => unreachable!(),
            },
            // Ordering comparisons are only defined for numbers.
            _ => false,
        },
    }
}

fn json_eq(actual: &Value, expected: &Value) -> bool {
    // Compare numerically first so 2 == 2.0 holds.
    if let (Some(a), Some(e)) = (actual.as_f64(), expected.as_f64()) {
        return a == e;
    }
    actual == expected
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(path: &str, op: Op, value: Value, severity: Severity) -> ThresholdRule {
        ThresholdRule {
            path: path.to_string(),
            op,
            value,
            severity,
        }
    }

    #[test]
    fn path_grammar() {
        let doc = json!({
            "load": 0.25,
            "disk": {"used_pct": 91},
            "items": [{"value": 7}, {"value": 9}]
        });

        assert_eq!(resolve_path(&doc, "$"), Some(&doc));
        assert_eq!(resolve_path(&doc, "$.load"), Some(&json!(0.25)));
        assert_eq!(resolve_path(&doc, "$.disk.used_pct"), Some(&json!(91)));
        assert_eq!(resolve_path(&doc, "$.items.0.value"), Some(&json!(7)));
        assert_eq!(resolve_path(&doc, "$.items[1].value"), Some(&json!(9)));
        assert_eq!(resolve_path(&doc, "$.missing"), None);
        assert_eq!(resolve_path(&doc, "$.items.5.value"), None);
        assert_eq!(resolve_path(&doc, "$.load.deeper"), None);
    }

    #[test]
    fn numeric_comparisons() {
        let doc = json!({"load": 2.5});
        let failures = evaluate(
            &doc,
            &[
                rule("$.load", Op::Lt, json!(5), Severity::Critical),
                rule("$.load", Op::Ge, json!(3), Severity::Warning),
            ],
        );
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].path, "$.load");
        assert_eq!(failures[0].severity, Severity::Warning);
        assert_eq!(failures[0].actual, json!(2.5));
    }

    #[test]
    fn equality_spans_integer_and_float() {
        let doc = json!({"workers": 2, "state": "running"});
        assert!(evaluate(
            &doc,
            &[rule("$.workers", Op::Eq, json!(2.0), Severity::Critical)]
        )
        .is_empty());
        assert!(evaluate(
            &doc,
            &[rule("$.state", Op::Eq, json!("running"), Severity::Critical)]
        )
        .is_empty());
        assert!(!evaluate(
            &doc,
            &[rule("$.state", Op::Ne, json!("running"), Severity::Critical)]
        )
        .is_empty());
    }

    #[test]
    fn missing_path_fails_the_rule() {
        let doc = json!({});
        let failures = evaluate(
            &doc,
            &[rule("$.absent", Op::Lt, json!(1), Severity::Critical)],
        );
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].actual, Value::Null);
        assert!(has_critical(&failures));
    }

    #[test]
    fn ordering_on_non_numbers_fails() {
        let doc = json!({"state": "running"});
        let failures = evaluate(
            &doc,
            &[rule("$.state", Op::Gt, json!(1), Severity::Warning)],
        );
        assert_eq!(failures.len(), 1);
        assert!(!has_critical(&failures));
    }
}

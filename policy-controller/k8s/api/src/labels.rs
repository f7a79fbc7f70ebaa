//! Label-selector evaluation and serialization.
//!
//! Watches are filtered server-side with the string form of a selector, while
//! in-process fakes and tests evaluate selectors locally; both forms live
//! here so they cannot drift apart.

use anyhow::{bail, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use std::collections::BTreeMap;

pub type Map = BTreeMap<String, String>;

/// Indicates whether the selector matches every object. An absent selector
/// and an empty selector are both match-all.
pub fn selects_all(selector: &LabelSelector) -> bool {
    selector
        .match_labels
        .as_ref()
        .map(|l| l.is_empty())
        .unwrap_or(true)
        && selector
            .match_expressions
            .as_ref()
            .map(|e| e.is_empty())
            .unwrap_or(true)
}

/// Evaluates the selector against an object's labels. `match_labels` and
/// `match_expressions` results are ANDed.
pub fn matches(selector: &LabelSelector, labels: &Map) -> bool {
    for (k, v) in selector.match_labels.iter().flatten() {
        if labels.get(k) != Some(v) {
            return false;
        }
    }
    selector
        .match_expressions
        .iter()
        .flatten()
        .all(|expr| expression_matches(expr, labels))
}

fn expression_matches(expr: &LabelSelectorRequirement, labels: &Map) -> bool {
    let values = expr.values.as_deref().unwrap_or(&[]);
    match expr.operator.as_str() {
        "In" => labels
            .get(&expr.key)
            .map(|v| values.contains(v))
            .unwrap_or(false),
        "NotIn" => labels
            .get(&expr.key)
            .map(|v| !values.contains(v))
            .unwrap_or(true),
        "Exists" => labels.contains_key(&expr.key),
        "DoesNotExist" => !labels.contains_key(&expr.key),
        operator => {
            tracing::warn!(%operator, key = %expr.key, "illegal match expression");
            false
        }
    }
}

/// Renders the selector in the query form accepted by the API server's
/// `labelSelector` parameter.
pub fn to_query(selector: &LabelSelector) -> Result<String> {
    let mut terms = Vec::new();
    for (k, v) in selector.match_labels.iter().flatten() {
        terms.push(format!("{}={}", k, v));
    }
    for expr in selector.match_expressions.iter().flatten() {
        let values = || {
            expr.values
                .as_deref()
                .unwrap_or(&[])
                .to_vec()
                .join(",")
        };
        match expr.operator.as_str() {
            "In" => terms.push(format!("{} in ({})", expr.key, values())),
            "NotIn" => terms.push(format!("{} notin ({})", expr.key, values())),
            "Exists" => terms.push(expr.key.clone()),
            "DoesNotExist" => terms.push(format!("!{}", expr.key)),
            operator => bail!("illegal match expression operator {:?}", operator),
        }
    }
    Ok(terms.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Map {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn expr(key: &str, operator: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: operator.to_string(),
            values: if values.is_empty() {
                None
            } else {
                Some(values.iter().map(|v| v.to_string()).collect())
            },
        }
    }

    #[test]
    fn match_labels_and_expressions_are_anded() {
        for (selector, labels, expected, msg) in &[
            (
                LabelSelector::default(),
                labels(&[("any", "thing")]),
                true,
                "empty selector matches all",
            ),
            (
                LabelSelector {
                    match_labels: Some(labels(&[("env", "prod")])),
                    ..Default::default()
                },
                labels(&[("env", "prod"), ("tier", "db")]),
                true,
                "sufficient label match",
            ),
            (
                LabelSelector {
                    match_labels: Some(labels(&[("env", "prod")])),
                    ..Default::default()
                },
                labels(&[("env", "dev")]),
                false,
                "label mismatch",
            ),
            (
                LabelSelector {
                    match_expressions: Some(vec![expr("env", "In", &["prod", "staging"])]),
                    ..Default::default()
                },
                labels(&[("env", "staging")]),
                true,
                "In expression match",
            ),
            (
                LabelSelector {
                    match_expressions: Some(vec![expr("env", "NotIn", &["prod"])]),
                    ..Default::default()
                },
                labels(&[]),
                true,
                "NotIn matches absent key",
            ),
            (
                LabelSelector {
                    match_expressions: Some(vec![expr("env", "Exists", &[])]),
                    ..Default::default()
                },
                labels(&[("tier", "db")]),
                false,
                "Exists non-match",
            ),
            (
                LabelSelector {
                    match_labels: Some(labels(&[("env", "prod")])),
                    match_expressions: Some(vec![expr("tier", "DoesNotExist", &[])]),
                    ..Default::default()
                },
                labels(&[("env", "prod"), ("tier", "db")]),
                false,
                "labels match but expression fails",
            ),
        ] {
            assert_eq!(matches(selector, labels), *expected, "{}", msg);
        }
    }

    #[test]
    fn selects_all_only_for_empty() {
        assert!(selects_all(&LabelSelector::default()));
        assert!(selects_all(&LabelSelector {
            match_labels: Some(Map::new()),
            match_expressions: Some(vec![]),
        }));
        assert!(!selects_all(&LabelSelector {
            match_labels: Some(labels(&[("env", "prod")])),
            ..Default::default()
        }));
    }

    #[test]
    fn query_form() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("env", "prod")])),
            match_expressions: Some(vec![
                expr("tier", "In", &["db", "cache"]),
                expr("canary", "DoesNotExist", &[]),
            ]),
        };
        assert_eq!(
            to_query(&selector).unwrap(),
            "env=prod,tier in (db,cache),!canary",
        );
        assert_eq!(to_query(&LabelSelector::default()).unwrap(), "");
    }
}

//! Normalization of volatile output before comparison.
//!
//! All functions here are pure: the same inputs always produce the same
//! normalized pair, which is what makes re-evaluating a captured record safe.

use crate::expected::{NormalizationRule, RuleKind};
use serde_json::{Map, Value};

/// Placeholder written in place of a redacted value.
pub const REDACTED: &str = "<redacted>";

/// Canonical token a pattern-matched value is replaced with.
pub fn match_token(pattern: &str) -> String {
    format!("<match:{}>", pattern)
}

/// Normalize a structured expected/actual pair according to `rules`.
///
/// Returns `(expected, actual)` with ignored fields removed, redacted and
/// pattern-matched fields canonicalized, and rewrites applied.
pub fn normalize_structured(
    expected: &Map<String, Value>,
    actual: &Value,
    rules: &[NormalizationRule],
) -> (Value, Value) {
    let mut expected = Value::Object(expected.clone());
    let mut actual = actual.clone();

    for rule in rules {
        let path = split_path(&rule.field);
        if path.is_empty() {
            continue;
        }

        match &rule.rule {
            RuleKind::Ignore => {
                remove_path(&mut expected, &path);
                remove_path(&mut actual, &path);
            }
            RuleKind::Redact => {
                set_path(&mut expected, &path, Value::String(REDACTED.to_string()));
                if let Some(value) = get_path_mut(&mut actual, &path) {
                    *value = Value::String(REDACTED.to_string());
                }
            }
            RuleKind::MatchPattern(pattern) => {
                let token = Value::String(match_token(pattern.as_str()));
                set_path(&mut expected, &path, token.clone());
                if let Some(value) = get_path_mut(&mut actual, &path)
                    && pattern.regex().is_match(&scalar_text(value))
                {
                    *value = token;
                }
            }
            RuleKind::Rewrite {
                pattern,
                replacement,
            } => {
                for side in [&mut expected, &mut actual] {
                    if let Some(Value::String(s)) = get_path_mut(side, &path) {
                        *s = pattern
                            .regex()
                            .replace_all(s, replacement.as_str())
                            .into_owned();
                    }
                }
            }
        }
    }

    (expected, actual)
}

/// Normalize golden text: unify line endings, trim trailing whitespace,
/// drop trailing blank lines, then apply every rewrite rule.
pub fn normalize_text(text: &str, rules: &[NormalizationRule]) -> String {
    let unified = text.replace("\r\n", "\n");
    let mut lines: Vec<&str> = unified.lines().map(str::trim_end).collect();
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    let mut out = lines.join("\n");

    for rule in rules {
        if let RuleKind::Rewrite {
            pattern,
            replacement,
        } = &rule.rule
        {
            out = pattern
                .regex()
                .replace_all(&out, replacement.as_str())
                .into_owned();
        }
    }

    out
}

/// Split a dotted field path; `$` or an empty string address nothing.
pub fn split_path(field: &str) -> Vec<&str> {
    if field.is_empty() || field == "$" {
        return Vec::new();
    }
    field.split('.').collect()
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn child_mut<'a>(value: &'a mut Value, segment: &str) -> Option<&'a mut Value> {
    match value {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
        _ => None,
    }
}

fn get_path_mut<'a>(value: &'a mut Value, path: &[&str]) -> Option<&'a mut Value> {
    path.iter().try_fold(value, |current, segment| child_mut(current, segment))
}

fn remove_path(value: &mut Value, path: &[&str]) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    match get_path_mut(value, parents) {
        Some(Value::Object(map)) => {
            map.remove(*last);
        }
        Some(Value::Array(items)) => {
            if let Ok(index) = last.parse::<usize>()
                && index < items.len()
            {
                items.remove(index);
            }
        }
        _ => {}
    }
}

/// Set a value, creating intermediate objects as needed.
fn set_path(value: &mut Value, path: &[&str], new_value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = value;
    for segment in parents {
        if !current.is_object() && !current.is_array() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            Value::Array(items) => match segment.parse::<usize>().ok() {
                Some(i) if i < items.len() => &mut items[i],
                _ => return,
            },
            _ => return,
        };
    }
    match current {
        Value::Object(map) => {
            map.insert(last.to_string(), new_value);
        }
        Value::Array(items) => {
            if let Ok(i) = last.parse::<usize>()
                && i < items.len()
            {
                items[i] = new_value;
            }
        }
        other => {
            let mut map = Map::new();
            map.insert(last.to_string(), new_value);
            *other = Value::Object(map);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expected::Pattern;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_ignore_removes_field_on_both_sides() {
        let rules = vec![NormalizationRule::new("ts", RuleKind::Ignore)];
        let (expected, actual) = normalize_structured(
            &obj(json!({"status": "checked_out", "item": 42})),
            &json!({"status": "checked_out", "item": 42, "ts": "2024-01-01T00:00:00Z"}),
            &rules,
        );
        assert_eq!(expected, actual);
    }

    #[test]
    fn test_nested_ignore() {
        let rules = vec![NormalizationRule::new("meta.ts", RuleKind::Ignore)];
        let (_, actual) = normalize_structured(
            &Map::new(),
            &json!({"meta": {"ts": 1, "host": "vm"}}),
            &rules,
        );
        assert_eq!(actual, json!({"meta": {"host": "vm"}}));
    }

    #[test]
    fn test_match_pattern_canonicalizes_matching_values() {
        let pattern = Pattern::new("^[0-9a-f]{8}$").unwrap();
        let rules = vec![NormalizationRule::new("id", RuleKind::MatchPattern(pattern))];

        let (expected, actual) =
            normalize_structured(&Map::new(), &json!({"id": "deadbeef"}), &rules);
        assert_eq!(expected, actual);

        let (expected, actual) =
            normalize_structured(&Map::new(), &json!({"id": "not-hex!"}), &rules);
        assert_ne!(expected, actual);
        assert_eq!(actual, json!({"id": "not-hex!"}));
    }

    #[test]
    fn test_match_pattern_on_numbers() {
        let pattern = Pattern::new(r"^\d+$").unwrap();
        let rules = vec![NormalizationRule::new("pid", RuleKind::MatchPattern(pattern))];
        let (expected, actual) = normalize_structured(&Map::new(), &json!({"pid": 4711}), &rules);
        assert_eq!(expected, actual);
    }

    #[test]
    fn test_redact_requires_presence() {
        let rules = vec![NormalizationRule::new("token", RuleKind::Redact)];
        let (expected, actual) =
            normalize_structured(&Map::new(), &json!({"token": "s3cr3t"}), &rules);
        assert_eq!(expected, actual);

        let (expected, actual) = normalize_structured(&Map::new(), &json!({}), &rules);
        assert_ne!(expected, actual);
    }

    #[test]
    fn test_normalize_text_line_endings_and_rewrites() {
        let rules = vec![NormalizationRule::new(
            "stdout",
            RuleKind::Rewrite {
                pattern: Pattern::new(r"pid=\d+").unwrap(),
                replacement: "pid=N".into(),
            },
        )];
        let text = "started pid=123   \r\nok\r\n\r\n";
        assert_eq!(normalize_text(text, &rules), "started pid=N\nok");
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let rules = vec![
            NormalizationRule::new("ts", RuleKind::Ignore),
            NormalizationRule::new(
                "id",
                RuleKind::MatchPattern(Pattern::new("^[a-z]+-[0-9]+$").unwrap()),
            ),
        ];
        let expected = obj(json!({"status": "ok"}));
        let actual = json!({"status": "ok", "ts": 5, "id": "item-7"});

        let first = normalize_structured(&expected, &actual, &rules);
        let second = normalize_structured(&expected, &actual, &rules);
        assert_eq!(first, second);

        let text = "a \r\nb\n";
        assert_eq!(normalize_text(text, &rules), normalize_text(text, &rules));
    }
}

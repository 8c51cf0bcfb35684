//! Comparison of execution records against expected results.
//!
//! The strategy is picked from the expected result's body: golden text or
//! structured key/value. Evaluation has no side effects.

use crate::expected::{ExpectedBody, ExpectedResult, FieldType};
use crate::normalize::{normalize_structured, normalize_text, split_path};
use crate::record::{AssertionOutcome, ExecutionRecord, FieldDiff};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// A comparison strategy.
pub trait Comparator: Send + Sync {
    /// Produce every difference between the record's output and the expectation.
    fn compare(&self, record: &ExecutionRecord, expected: &ExpectedResult) -> Vec<FieldDiff>;
}

/// Line-by-line comparison of normalized stdout.
pub struct GoldenComparator;

/// Field-by-field comparison of JSON stdout.
pub struct StructuredComparator;

/// Select the comparator for an expected result.
pub fn comparator_for(body: &ExpectedBody) -> &'static dyn Comparator {
    match body {
        ExpectedBody::Golden { .. } => &GoldenComparator,
        ExpectedBody::Structured { .. } => &StructuredComparator,
    }
}

/// Normalize and compare; the single entry point used by the harness.
pub fn evaluate(record: &ExecutionRecord, expected: &ExpectedResult) -> AssertionOutcome {
    let diffs = comparator_for(&expected.body).compare(record, expected);
    AssertionOutcome::from_diffs(diffs)
}

fn exit_code_diff(record: &ExecutionRecord, expected: &ExpectedResult) -> Option<FieldDiff> {
    if record.exit_code() == Some(expected.exit_code) {
        return None;
    }
    Some(FieldDiff::new(
        "exit_code",
        Value::from(expected.exit_code),
        record.exit_code().map(Value::from).unwrap_or(Value::Null),
    ))
}

impl Comparator for GoldenComparator {
    fn compare(&self, record: &ExecutionRecord, expected: &ExpectedResult) -> Vec<FieldDiff> {
        let mut diffs: Vec<FieldDiff> = exit_code_diff(record, expected).into_iter().collect();

        let ExpectedBody::Golden { stdout } = &expected.body else {
            return diffs;
        };

        let want = normalize_text(stdout, &expected.normalize);
        let got = normalize_text(record.stdout(), &expected.normalize);
        if want == got {
            return diffs;
        }

        let want_lines: Vec<&str> = want.lines().collect();
        let got_lines: Vec<&str> = got.lines().collect();
        let max = want_lines.len().max(got_lines.len());
        for i in 0..max {
            let w = want_lines.get(i).copied();
            let g = got_lines.get(i).copied();
            if w != g {
                diffs.push(FieldDiff::new(
                    format!("line:{}", i + 1),
                    w.map(Value::from).unwrap_or(Value::Null),
                    g.map(Value::from).unwrap_or(Value::Null),
                ));
            }
        }

        diffs
    }
}

impl Comparator for StructuredComparator {
    fn compare(&self, record: &ExecutionRecord, expected: &ExpectedResult) -> Vec<FieldDiff> {
        let mut diffs: Vec<FieldDiff> = exit_code_diff(record, expected).into_iter().collect();

        let ExpectedBody::Structured {
            fields,
            schema,
            allow_extra,
        } = &expected.body
        else {
            return diffs;
        };

        // Exit-code-only expectation: stdout is not inspected.
        if fields.is_empty() && schema.is_empty() && *allow_extra && expected.normalize.is_empty() {
            return diffs;
        }

        let actual: Value = match serde_json::from_str(record.stdout().trim()) {
            Ok(value) => value,
            Err(_) => {
                diffs.push(FieldDiff::new(
                    "$",
                    Value::from("<json document>"),
                    Value::from(record.stdout()),
                ));
                return diffs;
            }
        };

        let (want, got) = normalize_structured(fields, &actual, &expected.normalize);
        diff_values("", &want, &got, *allow_extra, &mut diffs);
        check_schema(schema, &actual, &mut diffs);

        diffs
    }
}

fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        "$".to_string()
    } else {
        path.to_string()
    }
}

fn diff_values(path: &str, want: &Value, got: &Value, allow_extra: bool, out: &mut Vec<FieldDiff>) {
    match (want, got) {
        (Value::Object(w), Value::Object(g)) => diff_objects(path, w, g, allow_extra, out),
        (Value::Array(w), Value::Array(g)) if w.len() == g.len() => {
            for (i, (wv, gv)) in w.iter().zip(g.iter()).enumerate() {
                diff_values(&join_path(path, &i.to_string()), wv, gv, allow_extra, out);
            }
        }
        (w, g) if w != g => out.push(FieldDiff::new(display_path(path), w.clone(), g.clone())),
        _ => {}
    }
}

fn diff_objects(
    path: &str,
    want: &Map<String, Value>,
    got: &Map<String, Value>,
    allow_extra: bool,
    out: &mut Vec<FieldDiff>,
) {
    let keys: BTreeSet<&String> = want.keys().chain(got.keys()).collect();
    for key in keys {
        let field = join_path(path, key);
        match (want.get(key), got.get(key)) {
            (Some(w), Some(g)) => diff_values(&field, w, g, allow_extra, out),
            (Some(w), None) => out.push(FieldDiff::new(field, w.clone(), Value::Null)),
            (None, Some(g)) if !allow_extra => {
                out.push(FieldDiff::new(field, Value::Null, g.clone()))
            }
            _ => {}
        }
    }
}

fn check_schema(schema: &BTreeMap<String, FieldType>, actual: &Value, out: &mut Vec<FieldDiff>) {
    for (field, ty) in schema {
        let value = split_path(field)
            .into_iter()
            .try_fold(actual, |current, segment| match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            });
        let expected = Value::from(format!("<type:{}>", ty.name()));
        match value {
            None => out.push(FieldDiff::new(field.clone(), expected, Value::Null)),
            Some(v) if !ty.matches(v) => out.push(FieldDiff::new(field.clone(), expected, v.clone())),
            Some(_) => {}
        }
    }
}

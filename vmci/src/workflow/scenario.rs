//! Scenario files.
//!
//! A scenario is a TOML file naming an ordered list of operations and the
//! JSON file holding their expected results:
//!
//! ```toml
//! name = "checkout-roundtrip"
//! expected = "checkout-roundtrip.expected.json"
//!
//! [[operations]]
//! id = "checkout"
//! kind = "check-out"
//! params = { item = 42 }
//!
//! [[operations]]
//! id = "checkin"
//! kind = "check-in"
//! params = { item = 42 }
//! ```
//!
//! Everything is resolved at load time (templates rendered, expectations
//! matched to operations) so a malformed scenario fails before any VM boots.

use crate::config::HarnessConfig;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use vmci_shared::{
    ExpectedResult, ExpectedSet, Identity, OperationKind, VmciError, VmciResult, render_template,
};

/// Scalar parameter value as written in the scenario file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::String(s) => f.write_str(s),
            ParamValue::Integer(i) => write!(f, "{}", i),
            ParamValue::Float(x) => write!(f, "{}", x),
            ParamValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OperationSpec {
    id: String,
    kind: OperationKind,
    #[serde(default)]
    identity: Identity,
    #[serde(default)]
    params: BTreeMap<String, ParamValue>,
    /// Command template overriding the configured one for this kind.
    command: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScenarioFile {
    name: String,
    /// Expected-results file, relative to the scenario file.
    expected: Option<PathBuf>,
    #[serde(default)]
    operations: Vec<OperationSpec>,
}

/// A fully resolved operation.
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: String,
    pub kind: OperationKind,
    pub identity: Identity,
    pub params: BTreeMap<String, String>,
    /// Unrendered template (handed to the guest-side harness).
    pub template: String,
    /// Rendered shell command.
    pub command: String,
    pub timeout: Duration,
    pub expected: ExpectedResult,
}

#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: String,
    pub source: PathBuf,
    pub operations: Vec<Operation>,
}

impl Scenario {
    /// Parse and resolve a scenario file.
    pub fn load(
        path: &Path,
        harness: &HarnessConfig,
        default_timeout: Duration,
    ) -> VmciResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            VmciError::Config(format!("cannot read scenario {}: {}", path.display(), e))
        })?;
        let file: ScenarioFile = toml::from_str(&text)
            .map_err(|e| VmciError::Config(format!("scenario {}: {}", path.display(), e)))?;

        let expected = match &file.expected {
            Some(rel) => {
                let base = path.parent().unwrap_or_else(|| Path::new("."));
                ExpectedSet::load(&base.join(rel))?
            }
            None => ExpectedSet::default(),
        };

        Self::resolve(file, path, &expected, harness, default_timeout)
    }

    fn resolve(
        file: ScenarioFile,
        path: &Path,
        expected: &ExpectedSet,
        harness: &HarnessConfig,
        default_timeout: Duration,
    ) -> VmciResult<Self> {
        let context = |msg: String| {
            VmciError::Config(format!(
                "scenario '{}' ({}): {}",
                file.name,
                path.display(),
                msg
            ))
        };

        if file.operations.is_empty() {
            return Err(context("no operations".to_string()));
        }

        let mut seen = BTreeSet::new();
        let mut operations = Vec::with_capacity(file.operations.len());

        for spec in &file.operations {
            if !seen.insert(spec.id.as_str()) {
                return Err(context(format!("duplicate operation id '{}'", spec.id)));
            }

            let template = match (&spec.command, harness.template(spec.kind)) {
                (Some(command), _) => command.clone(),
                (None, Some(template)) => template.to_string(),
                (None, None) => {
                    return Err(context(format!(
                        "operation '{}': no command template for kind '{}'",
                        spec.id, spec.kind
                    )));
                }
            };

            let params: BTreeMap<String, String> = spec
                .params
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect();
            let command = render_template(&template, &params)
                .map_err(|e| context(format!("operation '{}': {}", spec.id, e)))?;

            let expectation = match (expected.get(&spec.id), spec.identity) {
                (Some(exp), _) => exp.clone(),
                (None, Identity::Operator) => ExpectedResult::exit_only(0),
                (None, Identity::Validator) => {
                    return Err(context(format!(
                        "operation '{}' has no expected result",
                        spec.id
                    )));
                }
            };
            expectation
                .validate()
                .map_err(|e| context(format!("operation '{}': {}", spec.id, e)))?;

            let timeout = match spec.timeout_secs {
                Some(0) => return Err(context(format!("operation '{}': timeout must be > 0", spec.id))),
                Some(secs) => Duration::from_secs(secs),
                None => default_timeout,
            };

            operations.push(Operation {
                id: spec.id.clone(),
                kind: spec.kind,
                identity: spec.identity,
                params,
                template,
                command,
                timeout,
                expected: expectation,
            });
        }

        Ok(Self {
            name: file.name.clone(),
            source: path.to_path_buf(),
            operations,
        })
    }
}

/// Expand files and directories into scenario files.
///
/// Directories contribute their `*.toml` files in name order; explicitly
/// named files keep the order given.
pub fn discover(paths: &[PathBuf]) -> VmciResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found: Vec<PathBuf> = std::fs::read_dir(path)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "toml"))
                .collect();
            found.sort();
            files.extend(found);
        } else if path.is_file() {
            files.push(path.clone());
        } else {
            return Err(VmciError::Config(format!(
                "scenario path {} does not exist",
                path.display()
            )));
        }
    }
    if files.is_empty() {
        return Err(VmciError::Config("no scenario files found".to_string()));
    }
    Ok(files)
}

/// Discover and load every scenario, in order.
pub fn load_scenarios(
    paths: &[PathBuf],
    harness: &HarnessConfig,
    default_timeout: Duration,
) -> VmciResult<Vec<Scenario>> {
    let scenarios = discover(paths)?
        .iter()
        .map(|file| Scenario::load(file, harness, default_timeout))
        .collect::<VmciResult<Vec<_>>>()?;

    let mut names = BTreeSet::new();
    for scenario in &scenarios {
        if !names.insert(scenario.name.as_str()) {
            return Err(VmciError::Config(format!(
                "duplicate scenario name '{}'",
                scenario.name
            )));
        }
    }

    tracing::info!(
        scenarios = scenarios.len(),
        operations = scenarios.iter().map(|s| s.operations.len()).sum::<usize>(),
        "Loaded scenarios"
    );
    Ok(scenarios)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use vmci_shared::ExpectedBody;

    const EXPECTED: &str = r#"{
        "checkout": {
            "exit_code": 0,
            "structured": {"fields": {"status": "checked_out", "item": 42}},
            "normalize": ["ignore:ts"]
        },
        "checkin": {
            "structured": {"fields": {"status": "available", "item": 42}}
        }
    }"#;

    const SCENARIO: &str = r#"
        name = "checkout-roundtrip"
        expected = "roundtrip.expected.json"

        [[operations]]
        id = "seed"
        kind = "exec"
        identity = "operator"
        command = "inventory seed --item {item}"
        params = { item = 42 }

        [[operations]]
        id = "checkout"
        kind = "check-out"
        params = { item = 42 }

        [[operations]]
        id = "checkin"
        kind = "check-in"
        params = { item = 42 }
        timeout_secs = 5
    "#;

    fn write_scenario(dir: &Path, name: &str, scenario: &str) -> PathBuf {
        fs::write(dir.join("roundtrip.expected.json"), EXPECTED).unwrap();
        let path = dir.join(name);
        fs::write(&path, scenario).unwrap();
        path
    }

    #[test]
    fn test_load_resolves_operations() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_scenario(dir.path(), "roundtrip.toml", SCENARIO);

        let scenario =
            Scenario::load(&path, &HarnessConfig::default(), Duration::from_secs(60)).unwrap();

        assert_eq!(scenario.name, "checkout-roundtrip");
        let ids: Vec<&str> = scenario.operations.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["seed", "checkout", "checkin"]);

        let seed = &scenario.operations[0];
        assert_eq!(seed.identity, Identity::Operator);
        assert_eq!(seed.command, "inventory seed --item 42");
        assert_eq!(seed.expected, ExpectedResult::exit_only(0));

        let checkout = &scenario.operations[1];
        assert_eq!(checkout.identity, Identity::Validator);
        assert_eq!(checkout.command, "inventory checkout --item 42 --json");
        assert_eq!(checkout.params.get("item").map(String::as_str), Some("42"));
        assert_eq!(checkout.timeout, Duration::from_secs(60));
        assert!(matches!(checkout.expected.body, ExpectedBody::Structured { .. }));
        assert_eq!(checkout.expected.normalize.len(), 1);

        assert_eq!(scenario.operations[2].timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_validator_operation_requires_expectation() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_scenario(
            dir.path(),
            "status.toml",
            r#"
            name = "status"
            expected = "roundtrip.expected.json"

            [[operations]]
            id = "status-42"
            kind = "status"
            params = { item = 42 }
            "#,
        );
        let err = Scenario::load(&path, &HarnessConfig::default(), Duration::from_secs(60))
            .unwrap_err();
        assert!(err.to_string().contains("has no expected result"));
    }

    #[test]
    fn test_missing_parameter_fails_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_scenario(
            dir.path(),
            "bad.toml",
            r#"
            name = "bad"
            expected = "roundtrip.expected.json"

            [[operations]]
            id = "checkout"
            kind = "check-out"
            "#,
        );
        let err = Scenario::load(&path, &HarnessConfig::default(), Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(err, VmciError::Config(_)));
        assert!(err.to_string().contains("item"));
    }

    #[test]
    fn test_exec_requires_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_scenario(
            dir.path(),
            "exec.toml",
            r#"
            name = "exec"

            [[operations]]
            id = "raw"
            kind = "exec"
            identity = "operator"
            "#,
        );
        let err = Scenario::load(&path, &HarnessConfig::default(), Duration::from_secs(60))
            .unwrap_err();
        assert!(err.to_string().contains("no command template"));
    }

    #[test]
    fn test_duplicate_operation_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_scenario(
            dir.path(),
            "dup.toml",
            r#"
            name = "dup"
            expected = "roundtrip.expected.json"

            [[operations]]
            id = "checkout"
            kind = "check-out"
            params = { item = 1 }

            [[operations]]
            id = "checkout"
            kind = "check-out"
            params = { item = 2 }
            "#,
        );
        assert!(Scenario::load(&path, &HarnessConfig::default(), Duration::from_secs(60)).is_err());
    }

    #[test]
    fn test_discover_directory_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        write_scenario(dir.path(), "b.toml", &SCENARIO.replace("checkout-roundtrip", "b"));
        write_scenario(dir.path(), "a.toml", &SCENARIO.replace("checkout-roundtrip", "a"));
        fs::write(dir.path().join("notes.md"), "ignored").unwrap();

        let files = discover(&[dir.path().to_path_buf()]).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.toml", "b.toml"]);

        let scenarios = load_scenarios(
            &[dir.path().to_path_buf()],
            &HarnessConfig::default(),
            Duration::from_secs(60),
        )
        .unwrap();
        assert_eq!(scenarios[0].name, "a");
        assert_eq!(scenarios[1].name, "b");

        assert!(discover(&[dir.path().join("missing")]).is_err());
    }
}

//! Command templates per operation kind.
//!
//! Built-in templates can be overridden by a TOML file:
//!
//! ```toml
//! [commands]
//! check-out = "inventory checkout --item {item} --json"
//! ```

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use vmci_shared::OperationKind;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TemplateFile {
    #[serde(default)]
    commands: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
pub struct Templates {
    overrides: BTreeMap<OperationKind, String>,
}

impl Templates {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading template file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("template file {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let file: TemplateFile = toml::from_str(text)?;
        let mut overrides = BTreeMap::new();
        for (key, template) in file.commands {
            let kind = OperationKind::parse(&key)?;
            overrides.insert(kind, template);
        }
        Ok(Self { overrides })
    }

    /// Template for `kind`: explicit command, then file override, then built-in.
    pub fn resolve(&self, kind: OperationKind, command: Option<&str>) -> Result<String> {
        if let Some(command) = command {
            if command.trim().is_empty() {
                bail!("--command must not be empty");
            }
            return Ok(command.to_string());
        }
        self.overrides
            .get(&kind)
            .cloned()
            .or_else(|| kind.default_template().map(str::to_string))
            .ok_or_else(|| anyhow!("'{}' needs --command", kind))
    }
}

/// Parse a `key=value` parameter.
pub fn parse_param(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}

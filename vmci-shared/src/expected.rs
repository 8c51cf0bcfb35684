//! Expected result records and normalization rules.
//!
//! An expected result is either a golden text (stdout compared line by line)
//! or a structured key/value record with optional schema assertions. Each
//! carries the normalization rules for its volatile fields.

use crate::errors::{VmciError, VmciResult};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// A compiled regular expression that serializes as its source text.
#[derive(Clone)]
pub struct Pattern(Regex);

impl Pattern {
    pub fn new(source: &str) -> VmciResult<Self> {
        Regex::new(source)
            .map(Pattern)
            .map_err(|e| VmciError::Config(format!("invalid pattern '{}': {}", source, e)))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn regex(&self) -> &Regex {
        &self.0
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pattern({:?})", self.0.as_str())
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for Pattern {}

/// How a volatile field is treated before comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleKind {
    /// Drop the field from both sides.
    Ignore,
    /// Field must be present; its value is not compared.
    Redact,
    /// Actual value must match the regex; matching values compare equal.
    MatchPattern(Pattern),
    /// Regex replacement applied to both sides (string fields or golden text).
    Rewrite { pattern: Pattern, replacement: String },
}

impl RuleKind {
    /// Parse the rule spelling used in expected-result files.
    ///
    /// `ignore`, `redact`, `match-pattern:<regex>`, `rewrite:<regex>=><replacement>`.
    pub fn parse(s: &str) -> VmciResult<Self> {
        match s {
            "ignore" => return Ok(RuleKind::Ignore),
            "redact" => return Ok(RuleKind::Redact),
            _ => {}
        }

        if let Some(pattern) = s.strip_prefix("match-pattern:") {
            return Ok(RuleKind::MatchPattern(Pattern::new(pattern)?));
        }

        if let Some(body) = s.strip_prefix("rewrite:") {
            let (pattern, replacement) = body.split_once("=>").ok_or_else(|| {
                VmciError::Config(format!(
                    "rewrite rule '{}' must have the form rewrite:<regex>=><replacement>",
                    s
                ))
            })?;
            return Ok(RuleKind::Rewrite {
                pattern: Pattern::new(pattern)?,
                replacement: replacement.to_string(),
            });
        }

        Err(VmciError::Config(format!("unknown normalization rule '{}'", s)))
    }

    fn spelling(&self) -> String {
        match self {
            RuleKind::Ignore => "ignore".to_string(),
            RuleKind::Redact => "redact".to_string(),
            RuleKind::MatchPattern(p) => format!("match-pattern:{}", p.as_str()),
            RuleKind::Rewrite {
                pattern,
                replacement,
            } => format!("rewrite:{}=>{}", pattern.as_str(), replacement),
        }
    }
}

/// A rule bound to a (dotted) field path, e.g. `{field: "meta.ts", rule: "ignore"}`.
///
/// Also accepts the shorthand strings `"ignore:<field>"` and `"redact:<field>"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRule", into = "RawRule")]
pub struct NormalizationRule {
    pub field: String,
    pub rule: RuleKind,
}

impl NormalizationRule {
    pub fn new(field: impl Into<String>, rule: RuleKind) -> Self {
        Self {
            field: field.into(),
            rule,
        }
    }

    /// Shorthand form: `ignore:ts`, `redact:token`.
    pub fn parse_shorthand(s: &str) -> VmciResult<Self> {
        let (rule, field) = s.split_once(':').ok_or_else(|| {
            VmciError::Config(format!("normalization shorthand '{}' must be <rule>:<field>", s))
        })?;
        let rule = match rule {
            "ignore" => RuleKind::Ignore,
            "redact" => RuleKind::Redact,
            other => {
                return Err(VmciError::Config(format!(
                    "rule '{}' has no shorthand form; use {{field, rule}}",
                    other
                )));
            }
        };
        if field.is_empty() {
            return Err(VmciError::Config(format!("empty field in rule '{}'", s)));
        }
        Ok(Self::new(field, rule))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawRule {
    Shorthand(String),
    Full { field: String, rule: String },
}

impl TryFrom<RawRule> for NormalizationRule {
    type Error = VmciError;

    fn try_from(raw: RawRule) -> Result<Self, Self::Error> {
        match raw {
            RawRule::Shorthand(s) => NormalizationRule::parse_shorthand(&s),
            RawRule::Full { field, rule } => Ok(NormalizationRule {
                field,
                rule: RuleKind::parse(&rule)?,
            }),
        }
    }
}

impl From<NormalizationRule> for RawRule {
    fn from(rule: NormalizationRule) -> Self {
        RawRule::Full {
            field: rule.field,
            rule: rule.rule.spelling(),
        }
    }
}

/// JSON type names accepted by schema assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Null,
}

impl FieldType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Null => value.is_null(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Null => "null",
        }
    }
}

/// Comparison strategy, selected per expected result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedBody {
    /// Byte-for-byte stdout comparison after text normalization.
    Golden { stdout: String },
    /// Stdout parsed as JSON and compared field by field.
    Structured {
        #[serde(default)]
        fields: Map<String, Value>,
        /// Dotted path → required JSON type.
        #[serde(default)]
        schema: BTreeMap<String, FieldType>,
        /// Tolerate fields in the actual output that `fields` does not mention.
        #[serde(default)]
        allow_extra: bool,
    },
}

fn default_exit_code() -> i32 {
    0
}

/// Expected outcome of one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedResult {
    #[serde(default = "default_exit_code")]
    pub exit_code: i32,
    #[serde(flatten)]
    pub body: ExpectedBody,
    #[serde(default)]
    pub normalize: Vec<NormalizationRule>,
}

impl ExpectedResult {
    pub fn golden(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            body: ExpectedBody::Golden {
                stdout: stdout.into(),
            },
            normalize: Vec::new(),
        }
    }

    pub fn structured(fields: Map<String, Value>) -> Self {
        Self {
            exit_code: 0,
            body: ExpectedBody::Structured {
                fields,
                schema: BTreeMap::new(),
                allow_extra: false,
            },
            normalize: Vec::new(),
        }
    }

    /// Expectation used when an operation declares none: exit 0, any output.
    pub fn exit_only(exit_code: i32) -> Self {
        Self {
            exit_code,
            body: ExpectedBody::Structured {
                fields: Map::new(),
                schema: BTreeMap::new(),
                allow_extra: true,
            },
            normalize: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: NormalizationRule) -> Self {
        self.normalize.push(rule);
        self
    }

    /// Reject rule/strategy combinations that have no meaning.
    pub fn validate(&self) -> VmciResult<()> {
        if let ExpectedBody::Golden { .. } = self.body
            && let Some(rule) = self
                .normalize
                .iter()
                .find(|r| !matches!(r.rule, RuleKind::Rewrite { .. }))
        {
            return Err(VmciError::Config(format!(
                "golden expectations only support rewrite rules (field '{}')",
                rule.field
            )));
        }
        Ok(())
    }

    /// Encode for passing on a command line (guest-side harness).
    pub fn to_b64(&self) -> VmciResult<String> {
        Ok(BASE64.encode(serde_json::to_vec(self)?))
    }

    pub fn from_b64(encoded: &str) -> VmciResult<Self> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| VmciError::Config(format!("invalid base64 expectation: {}", e)))?;
        let expected: ExpectedResult = serde_json::from_slice(&bytes)?;
        expected.validate()?;
        Ok(expected)
    }

    pub fn load(path: &Path) -> VmciResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            VmciError::Config(format!("failed to read expectation {}: {}", path.display(), e))
        })?;
        let expected: ExpectedResult = serde_json::from_str(&text).map_err(|e| {
            VmciError::Config(format!("invalid expectation {}: {}", path.display(), e))
        })?;
        expected.validate()?;
        Ok(expected)
    }
}

/// Expected results of a scenario, keyed by operation id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExpectedSet(BTreeMap<String, ExpectedResult>);

impl ExpectedSet {
    pub fn new(entries: BTreeMap<String, ExpectedResult>) -> Self {
        Self(entries)
    }

    pub fn load(path: &Path) -> VmciResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            VmciError::Config(format!(
                "failed to read expected results {}: {}",
                path.display(),
                e
            ))
        })?;
        let set: ExpectedSet = serde_json::from_str(&text).map_err(|e| {
            VmciError::Config(format!(
                "invalid expected results {}: {}",
                path.display(),
                e
            ))
        })?;
        for (id, expected) in &set.0 {
            expected
                .validate()
                .map_err(|e| VmciError::Config(format!("expectation '{}': {}", id, e)))?;
        }
        Ok(set)
    }

    pub fn get(&self, operation_id: &str) -> Option<&ExpectedResult> {
        self.0.get(operation_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

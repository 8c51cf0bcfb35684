//! Operation model: what a scenario step does and who runs it.

use crate::errors::{VmciError, VmciResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Category of a guest-side operation.
///
/// Each kind maps to one harness subcommand and one default command template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    /// Take an item out (e.g. "check out item 42").
    CheckOut,
    /// Return a previously checked-out item.
    CheckIn,
    /// Query the current status of an item or the system.
    Status,
    /// Move an item to a named state.
    Transition,
    /// Arbitrary command; requires an explicit command template.
    Exec,
}

impl OperationKind {
    pub const ALL: [OperationKind; 5] = [
        OperationKind::CheckOut,
        OperationKind::CheckIn,
        OperationKind::Status,
        OperationKind::Transition,
        OperationKind::Exec,
    ];

    /// Subcommand / config key spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::CheckOut => "check-out",
            OperationKind::CheckIn => "check-in",
            OperationKind::Status => "status",
            OperationKind::Transition => "transition",
            OperationKind::Exec => "exec",
        }
    }

    /// Built-in command template for the stock inventory workflow tool.
    ///
    /// `exec` has none: it always needs an explicit command.
    pub fn default_template(&self) -> Option<&'static str> {
        match self {
            OperationKind::CheckOut => Some("inventory checkout --item {item} --json"),
            OperationKind::CheckIn => Some("inventory checkin --item {item} --json"),
            OperationKind::Status => Some("inventory status --item {item} --json"),
            OperationKind::Transition => {
                Some("inventory transition --item {item} --to {state} --json")
            }
            OperationKind::Exec => None,
        }
    }

    pub fn parse(s: &str) -> VmciResult<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| VmciError::Config(format!("unknown operation kind '{}'", s)))
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Guest identity an operation runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Identity {
    /// Privileged-enough account used for setup.
    Operator,
    /// Restricted account the validation harness runs as.
    #[default]
    Validator,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Operator => f.write_str("operator"),
            Identity::Validator => f.write_str("validator"),
        }
    }
}

/// Quote a string for a POSIX shell using single quotes.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r#"'\''"#))
}

/// Render a command template, replacing `{name}` with the shell-quoted parameter.
///
/// `{{` and `}}` produce literal braces. A placeholder without a matching
/// parameter is a configuration error.
pub fn render_template(template: &str, params: &BTreeMap<String, String>) -> VmciResult<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for n in chars.by_ref() {
                    if n == '}' {
                        closed = true;
                        break;
                    }
                    name.push(n);
                }
                if !closed {
                    return Err(VmciError::Config(format!(
                        "unterminated placeholder in template '{}'",
                        template
                    )));
                }
                let value = params.get(name.trim()).ok_or_else(|| {
                    VmciError::Config(format!(
                        "template '{}' references missing parameter '{}'",
                        template, name
                    ))
                })?;
                out.push_str(&shell_quote(value));
            }
            other => out.push(other),
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_substitutes_params() {
        let rendered =
            render_template("inventory checkout --item {item}", &params(&[("item", "42")]))
                .unwrap();
        assert_eq!(rendered, "inventory checkout --item 42");
    }

    #[test]
    fn test_render_quotes_unsafe_values() {
        let rendered = render_template("echo {msg}", &params(&[("msg", "it's; rm -rf /")])).unwrap();
        assert_eq!(rendered, r#"echo 'it'\''s; rm -rf /'"#);
    }

    #[test]
    fn test_render_escaped_braces() {
        let rendered = render_template("awk '{{print $1}}' {f}", &params(&[("f", "x")])).unwrap();
        assert_eq!(rendered, "awk '{print $1}' x");
    }

    #[test]
    fn test_render_missing_param_is_error() {
        let err = render_template("status {item}", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, VmciError::Config(_)));
    }

    #[test]
    fn test_render_unterminated_placeholder() {
        assert!(render_template("status {item", &params(&[("item", "1")])).is_err());
    }

    #[test]
    fn test_kind_roundtrips_through_str() {
        for kind in OperationKind::ALL {
            assert_eq!(OperationKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(OperationKind::parse("teleport").is_err());
    }

    #[test]
    fn test_shell_quote_empty() {
        assert_eq!(shell_quote(""), "''");
    }
}

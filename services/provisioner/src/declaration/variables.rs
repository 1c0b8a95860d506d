//! Variable value resolution.
//!
//! Precedence, later wins: declared default, `PROVISIONER_VAR_<name>`
//! environment variables, the `--var-file` object, `--var name=value` flags.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;
use tracing::debug;

use super::types::VarType;
use super::Declaration;
use crate::error::ConfigError;
use crate::schema::describe;

/// Resolved variable values by name.
pub type Variables = BTreeMap<String, Value>;

const ENV_PREFIX: &str = "PROVISIONER_VAR_";

/// Operator-supplied variable values, before type checking.
#[derive(Debug, Clone, Default)]
pub struct VariableSources {
    pub env: BTreeMap<String, String>,
    pub file: BTreeMap<String, Value>,
    pub cli: Vec<(String, String)>,
}

impl VariableSources {
    /// Collect `PROVISIONER_VAR_*` values from the process environment.
    pub fn from_env() -> Self {
        Self::from_env_iter(std::env::vars())
    }

    pub fn from_env_iter(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let env = vars
            .into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(ENV_PREFIX)
                    .map(|name| (name.to_string(), value))
            })
            .collect();
        Self {
            env,
            ..Self::default()
        }
    }

    /// Load a JSON object of variable values.
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.file = serde_json::from_str(&text)?;
        Ok(self)
    }

    pub fn with_cli(mut self, assignments: Vec<(String, String)>) -> Self {
        self.cli = assignments;
        self
    }
}

/// Parse a `name=value` assignment as given to `--var`.
pub fn parse_assignment(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got `{raw}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing variable name in `{raw}`"));
    }
    Ok((name.to_string(), value.to_string()))
}

/// Raw text values are JSON when they parse as JSON, otherwise strings.
/// String-typed variables always take the raw text.
fn coerce(raw: &str, ty: VarType) -> Value {
    if ty == VarType::String {
        return Value::String(raw.to_string());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

impl Declaration {
    pub fn resolve_variables(&self, sources: &VariableSources) -> Result<Variables, ConfigError> {
        for name in sources
            .file
            .keys()
            .chain(sources.cli.iter().map(|(name, _)| name))
        {
            if !self.variables.contains_key(name) {
                return Err(ConfigError::UnknownVariable { name: name.clone() });
            }
        }
        for name in sources.env.keys() {
            if !self.variables.contains_key(name) {
                debug!(variable = %name, "Ignoring environment value for undeclared variable");
            }
        }

        let mut resolved = Variables::new();
        for (name, decl) in &self.variables {
            let mut value = decl.default.clone();
            if let Some(raw) = sources.env.get(name) {
                value = Some(coerce(raw, decl.ty));
            }
            if let Some(from_file) = sources.file.get(name) {
                value = Some(from_file.clone());
            }
            if let Some((_, raw)) = sources.cli.iter().rev().find(|(n, _)| n == name) {
                value = Some(coerce(raw, decl.ty));
            }

            let value = value.ok_or_else(|| ConfigError::MissingVariable { name: name.clone() })?;
            if !value.is_null() && !decl.ty.accepts(&value) {
                return Err(ConfigError::VariableType {
                    name: name.clone(),
                    expected: decl.ty.to_string(),
                    found: describe(&value),
                });
            }
            resolved.insert(name.clone(), value);
        }
        Ok(resolved)
    }
}

//! JSON declaration loading and schema validation.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::expr::{parse_template, Expr, Reference};
use super::types::{is_identifier, Address, OrderingConstraint, OutputDecl, ResourceDecl, VariableDecl};
use super::Declaration;
use crate::error::ConfigError;
use crate::schema::{self, describe, KindSchema};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDeclaration {
    #[serde(default)]
    variables: BTreeMap<String, VariableDecl>,
    #[serde(default)]
    resources: Vec<RawResource>,
    #[serde(default)]
    outputs: BTreeMap<String, RawOutput>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResource {
    kind: String,
    name: String,
    #[serde(default)]
    condition: Option<Value>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    fields: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOutput {
    value: Value,
    #[serde(default)]
    sensitive: bool,
    #[serde(default)]
    description: Option<String>,
}

impl Declaration {
    /// Read and validate a declaration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let declaration = Self::from_json_str(&text)?;
        debug!(
            path = %path.display(),
            resources = declaration.resources.len(),
            variables = declaration.variables.len(),
            outputs = declaration.outputs.len(),
            "Loaded declaration"
        );
        Ok(declaration)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawDeclaration = serde_json::from_str(text)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawDeclaration) -> Result<Self, ConfigError> {
        for (name, decl) in &raw.variables {
            if !is_identifier(name) {
                return Err(ConfigError::InvalidName {
                    path: format!("variables.{name}"),
                    name: name.clone(),
                });
            }
            if let Some(default) = &decl.default {
                if !default.is_null() && !decl.ty.accepts(default) {
                    return Err(ConfigError::VariableType {
                        name: name.clone(),
                        expected: decl.ty.to_string(),
                        found: describe(default),
                    });
                }
            }
        }

        let mut resources = BTreeMap::new();
        for (index, resource) in raw.resources.into_iter().enumerate() {
            let parsed = parse_resource(index, resource, &raw.variables)?;
            if resources.contains_key(&parsed.address) {
                return Err(ConfigError::DuplicateAddress {
                    address: parsed.address,
                });
            }
            resources.insert(parsed.address.clone(), parsed);
        }

        let mut outputs = BTreeMap::new();
        for (name, output) in raw.outputs {
            let path = format!("outputs.{name}");
            let value = Expr::from_json(&output.value).map_err(|message| {
                ConfigError::Expression {
                    path: path.clone(),
                    message,
                }
            })?;
            check_expression(&value, &path, &raw.variables)?;
            outputs.insert(
                name,
                OutputDecl {
                    value,
                    sensitive: output.sensitive,
                    description: output.description,
                },
            );
        }

        Ok(Declaration {
            variables: raw.variables,
            resources,
            outputs,
        })
    }
}

fn parse_resource(
    index: usize,
    raw: RawResource,
    variables: &BTreeMap<String, VariableDecl>,
) -> Result<ResourceDecl, ConfigError> {
    let schema = schema::lookup(&raw.kind).ok_or_else(|| ConfigError::UnknownKind {
        path: format!("resources[{index}].kind"),
        kind: raw.kind.clone(),
    })?;
    if !is_identifier(&raw.name) {
        return Err(ConfigError::InvalidName {
            path: format!("resources[{index}].name"),
            name: raw.name,
        });
    }
    let address = Address::new(raw.kind, raw.name);

    let mut fields = BTreeMap::new();
    for (field, value) in raw.fields {
        let path = format!("{address}.fields.{field}");
        let spec = schema.field(&field).ok_or_else(|| ConfigError::UnknownField {
            path: path.clone(),
            kind: schema.kind.to_string(),
            field: field.clone(),
        })?;
        let expr = Expr::from_json(&value).map_err(|message| ConfigError::Expression {
            path: path.clone(),
            message,
        })?;
        if let Some(literal) = expr.as_literal() {
            if literal.is_null() {
                if !spec.nullable {
                    return Err(ConfigError::MissingField { path });
                }
            } else if !spec.ty.accepts(&literal) {
                return Err(ConfigError::TypeMismatch {
                    path,
                    expected: spec.ty.to_string(),
                    found: describe(&literal),
                });
            }
        }
        check_expression(&expr, &path, variables)?;
        fields.insert(field, expr);
    }

    for spec in schema.fields.iter().filter(|f| f.required) {
        if !fields.contains_key(spec.name) {
            return Err(ConfigError::MissingField {
                path: format!("{address}.fields.{}", spec.name),
            });
        }
    }

    let mut depends_on = Vec::with_capacity(raw.depends_on.len());
    for (i, target) in raw.depends_on.iter().enumerate() {
        let path = format!("{address}.depends_on[{i}]");
        let target = target
            .parse::<Address>()
            .map_err(|message| ConfigError::Expression {
                path: path.clone(),
                message,
            })?;
        depends_on.push(OrderingConstraint { target, path });
    }

    let condition = match raw.condition {
        None => None,
        Some(value) => {
            let path = format!("{address}.condition");
            let expr = match &value {
                Value::String(text) => parse_template(text),
                Value::Bool(_) => Ok(Expr::Literal(value.clone())),
                other => Err(format!("expected a bool or expression, found {}", describe(other))),
            }
            .map_err(|message| ConfigError::Expression {
                path: path.clone(),
                message,
            })?;
            check_expression(&expr, &path, variables)?;
            Some(expr)
        }
    };

    Ok(ResourceDecl {
        address,
        schema,
        condition,
        depends_on,
        fields,
    })
}

/// Check variable names and referenced attributes against the schema.
fn check_expression(
    expr: &Expr,
    path: &str,
    variables: &BTreeMap<String, VariableDecl>,
) -> Result<(), ConfigError> {
    for name in expr.variables() {
        if !variables.contains_key(&name) {
            return Err(ConfigError::UndeclaredVariable {
                path: path.to_string(),
                name,
            });
        }
    }

    let mut failure = None;
    expr.walk_references(path, &mut |reference: &Reference, at: &str| {
        if failure.is_none() {
            failure = check_reference(reference, at).err();
        }
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn check_reference(reference: &Reference, path: &str) -> Result<(), ConfigError> {
    let kind: &KindSchema =
        schema::lookup(reference.target.kind()).ok_or_else(|| ConfigError::UnknownKind {
            path: path.to_string(),
            kind: reference.target.kind().to_string(),
        })?;
    if kind.output(&reference.attribute).is_none() {
        return Err(ConfigError::UnknownAttribute {
            path: path.to_string(),
            kind: kind.kind.to_string(),
            attribute: reference.attribute.clone(),
        });
    }
    Ok(())
}

//! Expression evaluation.
//!
//! Plan-time evaluation may see producers that are not provisioned yet; their
//! attributes are [`PlanValue::Unknown`]. References to pruned resources are
//! [`PlanValue::Absent`] and only survive where the expression tolerates them:
//! the left side of `??`, an untaken conditional branch, or a whole field
//! value of a nullable field.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::declaration::{Address, Attributes, Expr, Reference, ResourceDecl, TemplatePart, Variables};
use crate::error::{ConfigError, EvalError};
use crate::schema::describe;

#[derive(Debug, Clone, PartialEq)]
pub enum PlanValue {
    Known(Value),
    /// Depends on a producer that has not been provisioned yet.
    Unknown,
    /// Refers to a resource whose condition is false.
    Absent(Address),
}

impl PlanValue {
    pub fn known(&self) -> Option<&Value> {
        match self {
            PlanValue::Known(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, PlanValue::Unknown)
    }

    fn is_nullish(&self) -> bool {
        matches!(self, PlanValue::Known(Value::Null) | PlanValue::Absent(_))
    }
}

/// What an expression can see while it is evaluated.
#[derive(Debug, Clone, Copy)]
pub struct EvalScope<'a> {
    variables: &'a Variables,
    attributes: Option<&'a BTreeMap<Address, Attributes>>,
    pending: Option<&'a BTreeSet<Address>>,
    pruned: Option<&'a BTreeSet<Address>>,
    strict: bool,
}

impl<'a> EvalScope<'a> {
    pub fn new(variables: &'a Variables) -> Self {
        Self {
            variables,
            attributes: None,
            pending: None,
            pruned: None,
            strict: false,
        }
    }

    /// Attributes of producers that are already provisioned.
    pub fn with_attributes(mut self, attributes: &'a BTreeMap<Address, Attributes>) -> Self {
        self.attributes = Some(attributes);
        self
    }

    /// Producers whose attributes will change in this run.
    pub fn with_pending(mut self, pending: &'a BTreeSet<Address>) -> Self {
        self.pending = Some(pending);
        self
    }

    pub fn with_pruned(mut self, pruned: &'a BTreeSet<Address>) -> Self {
        self.pruned = Some(pruned);
        self
    }

    pub fn evaluate(&self, expr: &Expr) -> Result<PlanValue, EvalError> {
        match expr {
            Expr::Literal(v) => Ok(PlanValue::Known(v.clone())),
            Expr::Variable(name) => self
                .variables
                .get(name)
                .cloned()
                .map(PlanValue::Known)
                .ok_or_else(|| EvalError::UndeclaredVariable(name.clone())),
            Expr::Reference(reference) => self.lookup(reference),
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                let mut unknown = false;
                for item in items {
                    match self.evaluate(item)? {
                        PlanValue::Known(v) => values.push(v),
                        PlanValue::Unknown => unknown = true,
                        PlanValue::Absent(address) => {
                            return Err(EvalError::AbsentValue { address })
                        }
                    }
                }
                Ok(if unknown {
                    PlanValue::Unknown
                } else {
                    PlanValue::Known(Value::Array(values))
                })
            }
            Expr::Map(entries) => {
                let mut values = serde_json::Map::new();
                let mut unknown = false;
                for (key, item) in entries {
                    match self.evaluate(item)? {
                        PlanValue::Known(v) => {
                            values.insert(key.clone(), v);
                        }
                        PlanValue::Unknown => unknown = true,
                        PlanValue::Absent(address) => {
                            return Err(EvalError::AbsentValue { address })
                        }
                    }
                }
                Ok(if unknown {
                    PlanValue::Unknown
                } else {
                    PlanValue::Known(Value::Object(values))
                })
            }
            Expr::Template(parts) => {
                let mut out = String::new();
                let mut unknown = false;
                for part in parts {
                    match part {
                        TemplatePart::Text(text) => out.push_str(text),
                        TemplatePart::Expr(inner) => match self.evaluate(inner)? {
                            PlanValue::Known(v) => out.push_str(&interpolate(&v)?),
                            PlanValue::Unknown => unknown = true,
                            PlanValue::Absent(address) => {
                                return Err(EvalError::AbsentValue { address })
                            }
                        },
                    }
                }
                Ok(if unknown {
                    PlanValue::Unknown
                } else {
                    PlanValue::Known(Value::String(out))
                })
            }
            Expr::Index { base, index } => match self.evaluate(base)? {
                PlanValue::Known(Value::Array(items)) => items
                    .get(*index)
                    .cloned()
                    .map(PlanValue::Known)
                    .ok_or(EvalError::IndexOutOfRange {
                        index: *index,
                        len: items.len(),
                    }),
                PlanValue::Known(other) => Err(EvalError::NotAList {
                    found: describe(&other),
                }),
                passthrough => Ok(passthrough),
            },
            Expr::Attribute { base, name } => match self.evaluate(base)? {
                PlanValue::Known(Value::Object(entries)) => entries
                    .get(name)
                    .cloned()
                    .map(PlanValue::Known)
                    .ok_or_else(|| EvalError::MissingKey(name.clone())),
                PlanValue::Known(other) => Err(EvalError::NotAnObject {
                    name: name.clone(),
                    found: describe(&other),
                }),
                passthrough => Ok(passthrough),
            },
            Expr::Conditional {
                condition,
                then,
                otherwise,
            } => match self.evaluate(condition)? {
                PlanValue::Known(Value::Bool(true)) => self.evaluate(then),
                PlanValue::Known(Value::Bool(false)) => self.evaluate(otherwise),
                PlanValue::Known(other) => Err(EvalError::NotABool {
                    found: describe(&other),
                }),
                PlanValue::Absent(address) => Err(EvalError::AbsentValue { address }),
                PlanValue::Unknown => {
                    // Either branch may be taken, so both must be valid and
                    // a disabled producer on either side taints the result.
                    let a = self.evaluate(then)?;
                    let b = self.evaluate(otherwise)?;
                    Ok(match (a, b) {
                        (PlanValue::Absent(address), _) | (_, PlanValue::Absent(address)) => {
                            PlanValue::Absent(address)
                        }
                        (PlanValue::Known(a), PlanValue::Known(b)) if a == b => PlanValue::Known(a),
                        _ => PlanValue::Unknown,
                    })
                }
            },
            Expr::Fallback { primary, fallback } => {
                let value = self.evaluate(primary)?;
                if value.is_nullish() {
                    self.evaluate(fallback)
                } else {
                    Ok(value)
                }
            }
        }
    }

    fn lookup(&self, reference: &Reference) -> Result<PlanValue, EvalError> {
        let target = &reference.target;
        if self.pruned.is_some_and(|p| p.contains(target)) {
            return Ok(PlanValue::Absent(target.clone()));
        }
        if self.pending.is_some_and(|p| p.contains(target)) {
            return Ok(PlanValue::Unknown);
        }
        match self.attributes.and_then(|a| a.get(target)) {
            Some(attributes) => Ok(PlanValue::Known(
                attributes
                    .get(&reference.attribute)
                    .cloned()
                    .unwrap_or(Value::Null),
            )),
            None if self.strict => Err(EvalError::Unresolved {
                address: target.clone(),
            }),
            None => Ok(PlanValue::Unknown),
        }
    }

    /// Evaluate with every producer provisioned. Absent values become null.
    pub fn evaluate_known(&self, expr: &Expr) -> Result<Value, EvalError> {
        let scope = Self {
            pending: None,
            strict: true,
            ..*self
        };
        match scope.evaluate(expr)? {
            PlanValue::Known(v) => Ok(v),
            PlanValue::Absent(_) => Ok(Value::Null),
            PlanValue::Unknown => Err(EvalError::TypeMismatch {
                expected: "a known value".to_string(),
                found: "unknown".to_string(),
            }),
        }
    }

    /// Plan-time values of every declared field of `resource`, type checked
    /// where known.
    pub fn plan_fields(
        &self,
        resource: &ResourceDecl,
    ) -> Result<BTreeMap<String, PlanValue>, ConfigError> {
        let mut out = BTreeMap::new();
        for (field, expr) in &resource.fields {
            let path = resource.field_path(field);
            let value = self
                .evaluate(expr)
                .map_err(|e| ConfigError::eval(path.clone(), e))?;
            let value = match value {
                PlanValue::Absent(_) => PlanValue::Known(Value::Null),
                other => other,
            };
            if let PlanValue::Known(v) = &value {
                check_field(resource, field, v)?;
            }
            out.insert(field.clone(), value);
        }
        Ok(out)
    }

    /// Apply-time inputs of `resource`. Every producer must be provisioned.
    pub fn resolve_inputs(&self, resource: &ResourceDecl) -> Result<Attributes, ConfigError> {
        let mut out = Attributes::new();
        for (field, expr) in &resource.fields {
            let value = self
                .evaluate_known(expr)
                .map_err(|e| ConfigError::eval(resource.field_path(field), e))?;
            check_field(resource, field, &value)?;
            out.insert(field.clone(), value);
        }
        Ok(out)
    }
}

fn check_field(resource: &ResourceDecl, field: &str, value: &Value) -> Result<(), ConfigError> {
    let Some(spec) = resource.schema.field(field) else {
        return Ok(());
    };
    let path = resource.field_path(field);
    if value.is_null() {
        if spec.nullable {
            return Ok(());
        }
        return Err(ConfigError::MissingField { path });
    }
    if !spec.ty.accepts(value) {
        return Err(ConfigError::TypeMismatch {
            path,
            expected: spec.ty.to_string(),
            found: describe(value),
        });
    }
    Ok(())
}

fn interpolate(value: &Value) -> Result<String, EvalError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(EvalError::NotInterpolable {
            found: describe(other),
        }),
    }
}

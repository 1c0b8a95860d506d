//! Configuration and evaluation errors.
//!
//! Everything here is raised before the first remote call. A run that fails
//! with a [`ConfigError`] has no side effects.

use std::path::PathBuf;

use thiserror::Error;

use crate::declaration::Address;

/// Errors in the declaration, its variables or the graph it induces.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read declaration {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed declaration: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("{path}: invalid expression: {message}")]
    Expression { path: String, message: String },

    #[error("{path}: unknown resource kind `{kind}`")]
    UnknownKind { path: String, kind: String },

    #[error("{path}: invalid resource name `{name}`")]
    InvalidName { path: String, name: String },

    #[error("duplicate resource address `{address}`")]
    DuplicateAddress { address: Address },

    #[error("{path}: unknown field `{field}` for kind `{kind}`")]
    UnknownField {
        path: String,
        kind: String,
        field: String,
    },

    #[error("{path}: missing required field")]
    MissingField { path: String },

    #[error("{path}: expected {expected}, found {found}")]
    TypeMismatch {
        path: String,
        expected: String,
        found: String,
    },

    #[error("{path}: reference to undeclared resource `{target}`")]
    DanglingReference { path: String, target: Address },

    #[error("{path}: kind `{kind}` has no output attribute `{attribute}`")]
    UnknownAttribute {
        path: String,
        kind: String,
        attribute: String,
    },

    #[error("{path}: a resource cannot depend on itself")]
    SelfReference { path: String },

    #[error("{path}: undeclared variable `{name}`")]
    UndeclaredVariable { path: String, name: String },

    #[error("variable `{name}` is required but has no value")]
    MissingVariable { name: String },

    #[error("a value was supplied for unknown variable `{name}`")]
    UnknownVariable { name: String },

    #[error("variable `{name}`: expected {expected}, found {found}")]
    VariableType {
        name: String,
        expected: String,
        found: String,
    },

    #[error("{path}: condition must be a bool known before apply")]
    InvalidCondition { path: String },

    #[error("dependency cycle: {}", render_cycle(.cycle))]
    Cycle { cycle: Vec<Address> },

    #[error("{path}: required dependency `{producer}` is disabled")]
    RequiredDependencyDisabled { path: String, producer: Address },

    #[error("{path}: {source}")]
    Eval {
        path: String,
        #[source]
        source: EvalError,
    },
}

impl ConfigError {
    pub fn eval(path: impl Into<String>, source: EvalError) -> Self {
        ConfigError::Eval {
            path: path.into(),
            source,
        }
    }
}

fn render_cycle(cycle: &[Address]) -> String {
    cycle
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Errors raised while evaluating an expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("undeclared variable `{0}`")]
    UndeclaredVariable(String),

    #[error("index {index} out of range for list of length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("cannot index into {found}")]
    NotAList { found: String },

    #[error("cannot read attribute `{name}` of {found}")]
    NotAnObject { name: String, found: String },

    #[error("object has no key `{0}`")]
    MissingKey(String),

    #[error("condition must be a bool, found {found}")]
    NotABool { found: String },

    #[error("cannot interpolate {found} into a string")]
    NotInterpolable { found: String },

    #[error("value for `{address}` is not known yet")]
    Unresolved { address: Address },

    #[error("`{address}` is disabled and its value cannot be used here")]
    AbsentValue { address: Address },

    #[error("expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },
}

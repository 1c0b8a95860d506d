//! Core declaration types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::expr::Expr;
use crate::schema::KindSchema;

/// Attribute map of a resource, either resolved inputs or remote outputs.
pub type Attributes = BTreeMap<String, Value>;

/// Stable identity of a resource: `kind.name`.
///
/// Changing an address is never a rename. The old address is destroyed and
/// the new one created.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    kind: String,
    name: String,
}

impl Address {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

/// Identifiers are `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((kind, name)) = s.split_once('.') else {
            return Err(format!("`{s}` is not a `kind.name` address"));
        };
        if !is_identifier(kind) || !is_identifier(name) {
            return Err(format!("`{s}` is not a `kind.name` address"));
        }
        Ok(Self::new(kind, name))
    }
}

impl TryFrom<String> for Address {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

/// Type constraint of a declared variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    String,
    Number,
    Bool,
    List,
    Map,
    #[default]
    Any,
}

impl VarType {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            VarType::String => value.is_string(),
            VarType::Number => value.is_number(),
            VarType::Bool => value.is_boolean(),
            VarType::List => value.is_array(),
            VarType::Map => value.is_object(),
            VarType::Any => true,
        }
    }
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VarType::String => "string",
            VarType::Number => "number",
            VarType::Bool => "bool",
            VarType::List => "list",
            VarType::Map => "map",
            VarType::Any => "any",
        };
        f.write_str(name)
    }
}

/// A declared input variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDecl {
    #[serde(rename = "type", default)]
    pub ty: VarType,
    /// `Some(Value::Null)` for an explicit `"default": null`.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub sensitive: bool,
}

/// A field that is present deserializes to `Some`, even when it is `null`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// An explicit ordering constraint and where it was declared.
#[derive(Debug, Clone)]
pub struct OrderingConstraint {
    pub target: Address,
    pub path: String,
}

/// A declared resource after parsing and schema validation.
#[derive(Debug, Clone)]
pub struct ResourceDecl {
    pub address: Address,
    pub schema: &'static KindSchema,
    pub condition: Option<Expr>,
    pub depends_on: Vec<OrderingConstraint>,
    pub fields: BTreeMap<String, Expr>,
}

impl ResourceDecl {
    /// Path used in diagnostics for one of this resource's fields.
    pub fn field_path(&self, field: &str) -> String {
        format!("{}.fields.{}", self.address, field)
    }

    pub fn condition_path(&self) -> String {
        format!("{}.condition", self.address)
    }
}

/// A declared output.
#[derive(Debug, Clone)]
pub struct OutputDecl {
    pub value: Expr,
    pub sensitive: bool,
    pub description: Option<String>,
}

/// Identifier of the field a diagnostic path points at, if any.
pub fn field_of_path(path: &str) -> Option<&str> {
    let (_, rest) = path.split_once(".fields.")?;
    let end = rest.find(['.', '[']).unwrap_or(rest.len());
    Some(&rest[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_round_trip() {
        let address: Address = "subnet.private".parse().unwrap();
        assert_eq!(address.kind(), "subnet");
        assert_eq!(address.name(), "private");
        assert_eq!(address.to_string(), "subnet.private");
    }

    #[test]
    fn test_address_rejects_garbage() {
        assert!("subnet".parse::<Address>().is_err());
        assert!("subnet.pri-vate".parse::<Address>().is_err());
        assert!("1subnet.private".parse::<Address>().is_err());
    }

    #[test]
    fn test_address_as_json_map_key() {
        let mut map = BTreeMap::new();
        map.insert(Address::new("key_vault", "main"), 1);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"key_vault.main":1}"#);

        let back: BTreeMap<Address, i32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get(&Address::new("key_vault", "main")), Some(&1));
    }

    #[test]
    fn test_field_of_path() {
        assert_eq!(
            field_of_path("subnet.private.fields.address_prefixes[0]"),
            Some("address_prefixes")
        );
        assert_eq!(
            field_of_path("linux_scale_set.backend.fields.environment.DB"),
            Some("environment")
        );
        assert_eq!(field_of_path("subnet.private.depends_on[0]"), None);
    }
}

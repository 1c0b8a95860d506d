//! Desired-state declaration: resources, variables and outputs.

mod expr;
mod parse;
mod types;
mod variables;

use std::collections::BTreeMap;

pub use expr::{parse_expression, parse_template, Expr, Reference, TemplatePart};
pub use types::{
    field_of_path, is_identifier, Address, Attributes, OrderingConstraint, OutputDecl,
    ResourceDecl, VarType, VariableDecl,
};
pub use variables::{parse_assignment, VariableSources, Variables};

/// A parsed and schema-checked declaration.
#[derive(Debug, Clone, Default)]
pub struct Declaration {
    pub variables: BTreeMap<String, VariableDecl>,
    pub resources: BTreeMap<Address, ResourceDecl>,
    pub outputs: BTreeMap<String, OutputDecl>,
}

impl Declaration {
    pub fn resource(&self, address: &Address) -> Option<&ResourceDecl> {
        self.resources.get(address)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.resources.keys()
    }
}

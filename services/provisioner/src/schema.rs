//! Typed schema per resource kind.
//!
//! Which fields are mutable and which force replacement is static metadata
//! here. The reconciler never guesses it from remote responses.

use std::fmt;

use serde_json::Value;

/// Type of an input field or output attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Bool,
    List(&'static FieldType),
    Map(&'static FieldType),
    /// Free-form nested block.
    Object,
    Any,
}

impl FieldType {
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (FieldType::Any, _) => true,
            (FieldType::String, Value::String(_)) => true,
            (FieldType::Number, Value::Number(_)) => true,
            (FieldType::Bool, Value::Bool(_)) => true,
            (FieldType::Object, Value::Object(_)) => true,
            (FieldType::List(inner), Value::Array(items)) => {
                items.iter().all(|item| item.is_null() || inner.accepts(item))
            }
            (FieldType::Map(inner), Value::Object(entries)) => {
                entries.values().all(|item| item.is_null() || inner.accepts(item))
            }
            _ => false,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::String => f.write_str("string"),
            FieldType::Number => f.write_str("number"),
            FieldType::Bool => f.write_str("bool"),
            FieldType::List(inner) => write!(f, "list<{inner}>"),
            FieldType::Map(inner) => write!(f, "map<{inner}>"),
            FieldType::Object => f.write_str("object"),
            FieldType::Any => f.write_str("any"),
        }
    }
}

/// Short description of a JSON value's type for diagnostics.
pub fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "bool".to_string(),
        Value::Number(_) => "number".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Array(_) => "list".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
    pub required: bool,
    pub nullable: bool,
    /// Changing this field destroys and recreates the resource.
    pub force_new: bool,
    pub sensitive: bool,
}

impl FieldSpec {
    pub const fn new(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            required: false,
            nullable: true,
            force_new: false,
            sensitive: false,
        }
    }

    /// Required fields must be declared and must not evaluate to null.
    pub const fn required(mut self) -> Self {
        self.required = true;
        self.nullable = false;
        self
    }

    pub const fn force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    pub const fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OutputSpec {
    pub name: &'static str,
    pub ty: FieldType,
    pub sensitive: bool,
    /// JSON pointer into the Resource Manager response body. Empty means
    /// `/properties/<camelCaseName>`.
    pub pointer: &'static str,
}

impl OutputSpec {
    pub const fn new(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            sensitive: false,
            pointer: "",
        }
    }

    pub const fn at(mut self, pointer: &'static str) -> Self {
        self.pointer = pointer;
        self
    }

    pub const fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }
}

/// How a kind maps onto an Azure Resource Manager resource.
#[derive(Debug, Clone, Copy)]
pub struct ArmBinding {
    /// Path template. `{field}` placeholders are filled from inputs. A path
    /// that starts with `/` after substitution is absolute; otherwise it is
    /// relative to `/subscriptions/{sub}/resourceGroups/{resource_group}/providers/`.
    /// An empty template addresses the resource group itself.
    pub path: &'static str,
    pub api_version: &'static str,
    /// Request a system-assigned managed identity.
    pub system_identity: bool,
}

#[derive(Debug)]
pub struct KindSchema {
    pub kind: &'static str,
    pub fields: &'static [FieldSpec],
    pub outputs: &'static [OutputSpec],
    /// Resolved in-process instead of against the cloud API.
    pub local: bool,
    /// Read-only: refreshed every run, never created or destroyed remotely.
    pub data_source: bool,
    pub arm: Option<ArmBinding>,
}

impl KindSchema {
    pub fn field(&self, name: &str) -> Option<&'static FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&'static OutputSpec> {
        self.outputs.iter().find(|o| o.name == name)
    }

    pub fn is_sensitive_output(&self, name: &str) -> bool {
        self.output(name).map(|o| o.sensitive).unwrap_or(false)
    }
}

const STRING: FieldType = FieldType::String;
const NUMBER: FieldType = FieldType::Number;
const BOOL: FieldType = FieldType::Bool;
const STRING_LIST: FieldType = FieldType::List(&FieldType::String);
const STRING_MAP: FieldType = FieldType::Map(&FieldType::String);

const NAME: FieldSpec = FieldSpec::new("name", STRING).required().force_new();
const RESOURCE_GROUP: FieldSpec = FieldSpec::new("resource_group", STRING)
    .required()
    .force_new();
const LOCATION: FieldSpec = FieldSpec::new("location", STRING).required().force_new();
const TAGS: FieldSpec = FieldSpec::new("tags", STRING_MAP);

const ID: OutputSpec = OutputSpec::new("id", STRING).at("/id");
const NAME_OUT: OutputSpec = OutputSpec::new("name", STRING).at("/name");

pub static RESOURCE_GROUP_KIND: KindSchema = KindSchema {
    kind: "resource_group",
    fields: &[NAME, LOCATION, TAGS],
    outputs: &[
        ID,
        NAME_OUT,
        OutputSpec::new("location", STRING).at("/location"),
    ],
    local: false,
    data_source: false,
    arm: Some(ArmBinding {
        path: "",
        api_version: "2022-09-01",
        system_identity: false,
    }),
};

pub static VIRTUAL_NETWORK: KindSchema = KindSchema {
    kind: "virtual_network",
    fields: &[
        NAME,
        RESOURCE_GROUP,
        LOCATION,
        FieldSpec::new("address_space", STRING_LIST).required(),
        FieldSpec::new("dns_servers", STRING_LIST),
        TAGS,
    ],
    outputs: &[ID, NAME_OUT, OutputSpec::new("guid", STRING).at("/properties/resourceGuid")],
    local: false,
    data_source: false,
    arm: Some(ArmBinding {
        path: "Microsoft.Network/virtualNetworks/{name}",
        api_version: "2023-09-01",
        system_identity: false,
    }),
};

pub static SUBNET: KindSchema = KindSchema {
    kind: "subnet",
    fields: &[
        NAME,
        RESOURCE_GROUP,
        FieldSpec::new("virtual_network", STRING).required().force_new(),
        FieldSpec::new("address_prefixes", STRING_LIST)
            .required()
            .force_new(),
        FieldSpec::new("delegation", STRING).force_new(),
        FieldSpec::new("service_endpoints", STRING_LIST),
    ],
    outputs: &[ID, NAME_OUT, OutputSpec::new("address_prefix", STRING)],
    local: false,
    data_source: false,
    arm: Some(ArmBinding {
        path: "Microsoft.Network/virtualNetworks/{virtual_network}/subnets/{name}",
        api_version: "2023-09-01",
        system_identity: false,
    }),
};

pub static PRIVATE_DNS_ZONE: KindSchema = KindSchema {
    kind: "private_dns_zone",
    fields: &[NAME, RESOURCE_GROUP, TAGS],
    outputs: &[ID, NAME_OUT],
    local: false,
    data_source: false,
    arm: Some(ArmBinding {
        path: "Microsoft.Network/privateDnsZones/{name}",
        api_version: "2020-06-01",
        system_identity: false,
    }),
};

pub static PRIVATE_DNS_ZONE_LINK: KindSchema = KindSchema {
    kind: "private_dns_zone_link",
    fields: &[
        NAME,
        RESOURCE_GROUP,
        FieldSpec::new("private_dns_zone", STRING).required().force_new(),
        FieldSpec::new("virtual_network_id", STRING)
            .required()
            .force_new(),
        FieldSpec::new("registration_enabled", BOOL),
    ],
    outputs: &[ID],
    local: false,
    data_source: false,
    arm: Some(ArmBinding {
        path: "Microsoft.Network/privateDnsZones/{private_dns_zone}/virtualNetworkLinks/{name}",
        api_version: "2020-06-01",
        system_identity: false,
    }),
};

pub static RANDOM_PASSWORD: KindSchema = KindSchema {
    kind: "random_password",
    fields: &[
        FieldSpec::new("length", NUMBER).required().force_new(),
        FieldSpec::new("special", BOOL).force_new(),
        FieldSpec::new("keepers", STRING_MAP).force_new(),
    ],
    outputs: &[ID, OutputSpec::new("result", STRING).sensitive()],
    local: true,
    data_source: false,
    arm: None,
};

pub static POSTGRESQL_SERVER: KindSchema = KindSchema {
    kind: "postgresql_server",
    fields: &[
        NAME,
        RESOURCE_GROUP,
        LOCATION,
        FieldSpec::new("version", STRING).required().force_new(),
        FieldSpec::new("sku_name", STRING).required(),
        FieldSpec::new("storage_mb", NUMBER),
        FieldSpec::new("administrator_login", STRING)
            .required()
            .force_new(),
        FieldSpec::new("administrator_password", STRING)
            .required()
            .sensitive(),
        FieldSpec::new("delegated_subnet_id", STRING).force_new(),
        FieldSpec::new("private_dns_zone_id", STRING).force_new(),
        FieldSpec::new("backup_retention_days", NUMBER),
        FieldSpec::new("high_availability", BOOL),
        TAGS,
    ],
    outputs: &[
        ID,
        NAME_OUT,
        OutputSpec::new("fqdn", STRING).at("/properties/fullyQualifiedDomainName"),
    ],
    local: false,
    data_source: false,
    arm: Some(ArmBinding {
        path: "Microsoft.DBforPostgreSQL/flexibleServers/{name}",
        api_version: "2022-12-01",
        system_identity: false,
    }),
};

pub static POSTGRESQL_DATABASE: KindSchema = KindSchema {
    kind: "postgresql_database",
    fields: &[
        NAME,
        RESOURCE_GROUP,
        FieldSpec::new("server_name", STRING).required().force_new(),
        FieldSpec::new("charset", STRING).force_new(),
        FieldSpec::new("collation", STRING).force_new(),
    ],
    outputs: &[ID, NAME_OUT],
    local: false,
    data_source: false,
    arm: Some(ArmBinding {
        path: "Microsoft.DBforPostgreSQL/flexibleServers/{server_name}/databases/{name}",
        api_version: "2022-12-01",
        system_identity: false,
    }),
};

pub static CLIENT_CONFIG: KindSchema = KindSchema {
    kind: "client_config",
    fields: &[],
    outputs: &[
        ID,
        OutputSpec::new("tenant_id", STRING),
        OutputSpec::new("object_id", STRING),
        OutputSpec::new("subscription_id", STRING),
    ],
    local: true,
    data_source: true,
    arm: None,
};

pub static KEY_VAULT: KindSchema = KindSchema {
    kind: "key_vault",
    fields: &[
        NAME,
        RESOURCE_GROUP,
        LOCATION,
        FieldSpec::new("tenant_id", STRING).required().force_new(),
        FieldSpec::new("sku_name", STRING).required(),
        FieldSpec::new("purge_protection", BOOL),
        FieldSpec::new("soft_delete_retention_days", NUMBER).force_new(),
        FieldSpec::new("network_acls", FieldType::Object),
        TAGS,
    ],
    outputs: &[
        ID,
        NAME_OUT,
        OutputSpec::new("vault_uri", STRING).at("/properties/vaultUri"),
        OutputSpec::new("purge_protection", BOOL),
    ],
    local: false,
    data_source: false,
    arm: Some(ArmBinding {
        path: "Microsoft.KeyVault/vaults/{name}",
        api_version: "2023-07-01",
        system_identity: false,
    }),
};

pub static KEY_VAULT_SECRET: KindSchema = KindSchema {
    kind: "key_vault_secret",
    fields: &[
        NAME,
        FieldSpec::new("key_vault_id", STRING).required().force_new(),
        FieldSpec::new("value", STRING).required().sensitive(),
        FieldSpec::new("content_type", STRING),
    ],
    outputs: &[
        ID,
        OutputSpec::new("version", STRING).at("/properties/secretUriWithVersion"),
    ],
    local: false,
    data_source: false,
    arm: Some(ArmBinding {
        path: "{key_vault_id}/secrets/{name}",
        api_version: "2023-07-01",
        system_identity: false,
    }),
};

pub static KEY_VAULT_ACCESS_POLICY: KindSchema = KindSchema {
    kind: "key_vault_access_policy",
    fields: &[
        FieldSpec::new("key_vault_id", STRING).required().force_new(),
        FieldSpec::new("tenant_id", STRING).required().force_new(),
        FieldSpec::new("object_id", STRING).required().force_new(),
        FieldSpec::new("secret_permissions", STRING_LIST).required(),
    ],
    outputs: &[ID],
    local: false,
    data_source: false,
    arm: Some(ArmBinding {
        path: "{key_vault_id}/accessPolicies/{object_id}",
        api_version: "2023-07-01",
        system_identity: false,
    }),
};

pub static LOAD_BALANCER: KindSchema = KindSchema {
    kind: "load_balancer",
    fields: &[
        NAME,
        RESOURCE_GROUP,
        LOCATION,
        FieldSpec::new("sku", STRING).force_new(),
        FieldSpec::new("subnet_id", STRING).required().force_new(),
        FieldSpec::new("private_ip_address", STRING),
        TAGS,
    ],
    outputs: &[
        ID,
        NAME_OUT,
        OutputSpec::new("private_ip_address", STRING)
            .at("/properties/frontendIPConfigurations/0/properties/privateIPAddress"),
        OutputSpec::new("backend_pool_id", STRING).at("/properties/backendAddressPools/0/id"),
    ],
    local: false,
    data_source: false,
    arm: Some(ArmBinding {
        path: "Microsoft.Network/loadBalancers/{name}",
        api_version: "2023-09-01",
        system_identity: false,
    }),
};

pub static LINUX_SCALE_SET: KindSchema = KindSchema {
    kind: "linux_scale_set",
    fields: &[
        NAME,
        RESOURCE_GROUP,
        LOCATION,
        FieldSpec::new("sku", STRING).required(),
        FieldSpec::new("instances", NUMBER).required(),
        FieldSpec::new("admin_username", STRING).required().force_new(),
        FieldSpec::new("ssh_public_key", STRING).force_new(),
        FieldSpec::new("subnet_id", STRING).required().force_new(),
        FieldSpec::new("load_balancer_backend_pool_ids", STRING_LIST),
        FieldSpec::new("container_image", STRING).required(),
        FieldSpec::new("environment", STRING_MAP),
        FieldSpec::new("key_vault_uri", STRING),
        FieldSpec::new("backend_url", STRING),
        TAGS,
    ],
    outputs: &[
        ID,
        NAME_OUT,
        OutputSpec::new("principal_id", STRING).at("/identity/principalId"),
    ],
    local: false,
    data_source: false,
    arm: Some(ArmBinding {
        path: "Microsoft.Compute/virtualMachineScaleSets/{name}",
        api_version: "2023-09-01",
        system_identity: true,
    }),
};

pub static PUBLIC_IP: KindSchema = KindSchema {
    kind: "public_ip",
    fields: &[
        NAME,
        RESOURCE_GROUP,
        LOCATION,
        FieldSpec::new("sku", STRING).force_new(),
        FieldSpec::new("allocation_method", STRING)
            .required()
            .force_new(),
        FieldSpec::new("domain_name_label", STRING),
        TAGS,
    ],
    outputs: &[
        ID,
        NAME_OUT,
        OutputSpec::new("ip_address", STRING).at("/properties/ipAddress"),
        OutputSpec::new("fqdn", STRING).at("/properties/dnsSettings/fqdn"),
    ],
    local: false,
    data_source: false,
    arm: Some(ArmBinding {
        path: "Microsoft.Network/publicIPAddresses/{name}",
        api_version: "2023-09-01",
        system_identity: false,
    }),
};

pub static APPLICATION_GATEWAY: KindSchema = KindSchema {
    kind: "application_gateway",
    fields: &[
        NAME,
        RESOURCE_GROUP,
        LOCATION,
        FieldSpec::new("sku_name", STRING).required(),
        FieldSpec::new("capacity", NUMBER),
        FieldSpec::new("subnet_id", STRING).required().force_new(),
        FieldSpec::new("public_ip_id", STRING).required(),
        FieldSpec::new("api_backend_address", STRING),
        FieldSpec::new("web_backend_id", STRING),
        FieldSpec::new("health_probe_path", STRING),
        FieldSpec::new("waf_enabled", BOOL),
        TAGS,
    ],
    outputs: &[ID, NAME_OUT],
    local: false,
    data_source: false,
    arm: Some(ArmBinding {
        path: "Microsoft.Network/applicationGateways/{name}",
        api_version: "2023-09-01",
        system_identity: false,
    }),
};

static KINDS: &[&KindSchema] = &[
    &RESOURCE_GROUP_KIND,
    &VIRTUAL_NETWORK,
    &SUBNET,
    &PRIVATE_DNS_ZONE,
    &PRIVATE_DNS_ZONE_LINK,
    &RANDOM_PASSWORD,
    &POSTGRESQL_SERVER,
    &POSTGRESQL_DATABASE,
    &CLIENT_CONFIG,
    &KEY_VAULT,
    &KEY_VAULT_SECRET,
    &KEY_VAULT_ACCESS_POLICY,
    &LOAD_BALANCER,
    &LINUX_SCALE_SET,
    &PUBLIC_IP,
    &APPLICATION_GATEWAY,
];

/// Look up the schema for a resource kind.
pub fn lookup(kind: &str) -> Option<&'static KindSchema> {
    KINDS.iter().copied().find(|k| k.kind == kind)
}

pub fn kinds() -> impl Iterator<Item = &'static KindSchema> {
    KINDS.iter().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_every_kind_exposes_id() {
        for kind in kinds() {
            assert!(kind.output("id").is_some(), "{} has no id output", kind.kind);
        }
    }

    #[test]
    fn test_kind_names_are_unique() {
        let mut names: Vec<_> = kinds().map(|k| k.kind).collect();
        let before = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), before);
    }

    #[test]
    fn test_required_fields_are_not_nullable() {
        for kind in kinds() {
            for field in kind.fields {
                if field.required {
                    assert!(!field.nullable, "{}.{}", kind.kind, field.name);
                }
            }
        }
    }

    #[test]
    fn test_field_type_accepts() {
        assert!(STRING_LIST.accepts(&json!(["10.0.0.0/24"])));
        assert!(!STRING_LIST.accepts(&json!([1])));
        assert!(STRING_MAP.accepts(&json!({"env": "prod"})));
        assert!(!NUMBER.accepts(&json!("2")));
        assert_eq!(STRING_LIST.to_string(), "list<string>");
    }

    #[test]
    fn test_lookup() {
        assert_eq!(lookup("subnet").map(|k| k.kind), Some("subnet"));
        assert!(lookup("azurerm_subnet").is_none());
        assert!(LINUX_SCALE_SET.field("instances").is_some());
        assert!(RANDOM_PASSWORD.is_sensitive_output("result"));
    }
}

//! Per-kind property schemas
//!
//! Every kind owns a static field table. Construction of a node checks its
//! property bag against that table; the mutability flags drive the
//! planner's in-place update versus replacement decision.

use crate::error::{Error, Result};
use crate::types::{Properties, ResourceKind, Value};
use regex::Regex;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("name pattern is valid")
});

/// Semantic type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Any string
    Str,
    /// DNS-label style name (lowercase, digits, hyphens)
    Name,
    /// IPv4 or IPv6 network in CIDR notation, host bits zero
    Cidr,
    Int,
    /// TCP/UDP port number
    Port,
    Bool,
    /// List of strings
    StrList,
    /// Free-form nested map
    Map,
    /// One of a fixed set of strings
    OneOf(&'static [&'static str]),
}

/// Schema entry for one field of a kind
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
    pub required: bool,
    /// Whether the provider can change this field in place
    pub mutable: bool,
}

impl FieldSpec {
    const fn required(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            required: true,
            mutable: true,
        }
    }

    const fn optional(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            required: false,
            mutable: true,
        }
    }

    const fn immutable(self) -> Self {
        Self {
            mutable: false,
            ..self
        }
    }
}

use FieldType::{Bool, Cidr, Int, Map, Name, OneOf, Port, Str, StrList};

const ENDPOINT_ACCESS: &[&str] = &["public", "private", "public_and_private"];
const EFFECTS: &[&str] = &["allow", "deny"];
const TAG_MUTABILITY: &[&str] = &["mutable", "immutable"];

const NETWORK: &[FieldSpec] = &[
    FieldSpec::required("cidr", Cidr).immutable(),
    FieldSpec::optional("max_azs", Int).immutable(),
    FieldSpec::optional("nat_gateways", Int),
    FieldSpec::optional("enable_dns", Bool),
    FieldSpec::optional("tags", Map),
];

const SUBNET: &[FieldSpec] = &[
    FieldSpec::required("network", Str).immutable(),
    FieldSpec::required("cidr", Cidr).immutable(),
    FieldSpec::required("zone", Str).immutable(),
    FieldSpec::optional("public", Bool),
    FieldSpec::optional("tags", Map),
];

const FIREWALL_RULE_SET: &[FieldSpec] = &[
    FieldSpec::required("network", Str).immutable(),
    FieldSpec::optional("description", Str),
    FieldSpec::optional("ingress", StrList),
    FieldSpec::optional("egress", StrList),
];

const CLUSTER: &[FieldSpec] = &[
    FieldSpec::required("name", Name).immutable(),
    FieldSpec::required("version", Str),
    FieldSpec::required("network", Str).immutable(),
    FieldSpec::optional("subnets", StrList),
    FieldSpec::optional("security_groups", StrList),
    FieldSpec::optional("endpoint_access", OneOf(ENDPOINT_ACCESS)),
    FieldSpec::optional("role", Str),
];

const COMPUTE_PROFILE: &[FieldSpec] = &[
    FieldSpec::required("cluster", Str).immutable(),
    FieldSpec::required("instance_type", Str).immutable(),
    FieldSpec::required("min_size", Int),
    FieldSpec::required("max_size", Int),
    FieldSpec::optional("desired_size", Int),
    FieldSpec::optional("subnets", StrList),
    FieldSpec::optional("labels", Map),
];

const REGISTRY: &[FieldSpec] = &[
    FieldSpec::required("name", Name).immutable(),
    FieldSpec::optional("scan_on_push", Bool),
    FieldSpec::optional("tag_mutability", OneOf(TAG_MUTABILITY)),
    FieldSpec::optional("keep_images", Int),
];

const ROLE: &[FieldSpec] = &[
    FieldSpec::required("name", Name).immutable(),
    FieldSpec::required("trust", Str),
    FieldSpec::optional("description", Str),
    FieldSpec::optional("service_account", Str),
];

const POLICY_STATEMENT: &[FieldSpec] = &[
    FieldSpec::required("principal", Str).immutable(),
    FieldSpec::required("effect", OneOf(EFFECTS)),
    FieldSpec::required("actions", StrList),
    FieldSpec::required("resources", StrList),
    FieldSpec::optional("conditions", Map),
];

const MANAGED_ADDON_RELEASE: &[FieldSpec] = &[
    FieldSpec::required("cluster", Str).immutable(),
    FieldSpec::required("chart", Str),
    FieldSpec::required("repository", Str),
    FieldSpec::required("version", Str),
    FieldSpec::required("namespace", Name).immutable(),
    FieldSpec::optional("service_account_role", Str),
    FieldSpec::optional("values", Map),
];

const MANIFEST_OBJECT: &[FieldSpec] = &[
    FieldSpec::required("cluster", Str).immutable(),
    FieldSpec::required("namespace", Name).immutable(),
    FieldSpec::required("kind", Str).immutable(),
    FieldSpec::required("name", Name).immutable(),
    FieldSpec::optional("image", Str),
    FieldSpec::optional("replicas", Int),
    FieldSpec::optional("port", Port),
    FieldSpec::optional("spec", Map),
];

const OUTPUT_BINDING: &[FieldSpec] = &[
    FieldSpec::required("name", Str).immutable(),
    FieldSpec::required("value", Str),
];

/// Field table for a kind
pub fn fields(kind: ResourceKind) -> &'static [FieldSpec] {
    match kind {
        ResourceKind::Network => NETWORK,
        ResourceKind::Subnet => SUBNET,
        ResourceKind::FirewallRuleSet => FIREWALL_RULE_SET,
        ResourceKind::Cluster => CLUSTER,
        ResourceKind::ComputeProfile => COMPUTE_PROFILE,
        ResourceKind::Registry => REGISTRY,
        ResourceKind::Role => ROLE,
        ResourceKind::PolicyStatement => POLICY_STATEMENT,
        ResourceKind::ManagedAddonRelease => MANAGED_ADDON_RELEASE,
        ResourceKind::ManifestObject => MANIFEST_OBJECT,
        ResourceKind::OutputBinding => OUTPUT_BINDING,
    }
}

/// Look up the schema entry for one field of a kind
pub fn field(kind: ResourceKind, name: &str) -> Option<&'static FieldSpec> {
    fields(kind).iter().find(|f| f.name == name)
}

/// Whether a field can be changed in place
///
/// Unknown fields are treated as mutable; validation rejects them anyway.
pub fn is_mutable(kind: ResourceKind, name: &str) -> bool {
    field(kind, name).is_none_or(|f| f.mutable)
}

/// Validate a property bag against its kind's schema
pub fn validate(node: &str, kind: ResourceKind, properties: &Properties) -> Result<()> {
    let table = fields(kind);

    for name in properties.keys() {
        if !table.iter().any(|f| f.name == name) {
            return Err(Error::schema(
                node,
                format!("unknown field '{name}' for kind {kind}"),
            ));
        }
    }

    for spec in table {
        match properties.get(spec.name) {
            None if spec.required => {
                return Err(Error::schema(
                    node,
                    format!("missing required field '{}'", spec.name),
                ));
            }
            None => {}
            Some(value) => check_value(spec.ty, value)
                .map_err(|msg| Error::schema(node, format!("field '{}': {msg}", spec.name)))?,
        }
    }

    check_cross_field(node, kind, properties)
}

fn check_value(ty: FieldType, value: &Value) -> std::result::Result<(), String> {
    // A deferred reference stands in for any scalar; it is checked once resolved.
    if matches!(value, Value::Ref(_)) && !matches!(ty, StrList | Map) {
        return Ok(());
    }

    match (ty, value) {
        (Str, Value::String(_)) | (Int, Value::Integer(_)) | (Bool, Value::Bool(_)) => Ok(()),
        (Map, Value::Map(_)) => Ok(()),
        (Name, Value::String(s)) => {
            if NAME_RE.is_match(s) {
                Ok(())
            } else {
                Err(format!("'{s}' is not a valid name"))
            }
        }
        (Cidr, Value::String(s)) => parse_cidr(s),
        (Port, Value::Integer(p)) => {
            if (1..=65535).contains(p) {
                Ok(())
            } else {
                Err(format!("port {p} out of range"))
            }
        }
        (OneOf(options), Value::String(s)) => {
            if options.contains(&s.as_str()) {
                Ok(())
            } else {
                Err(format!("'{s}' is not one of {}", options.join(", ")))
            }
        }
        (StrList, Value::List(items)) => {
            if items
                .iter()
                .all(|v| matches!(v, Value::String(_) | Value::Ref(_)))
            {
                Ok(())
            } else {
                Err("expected a list of strings".to_string())
            }
        }
        (ty, value) => Err(format!("expected {}, got {}", describe(ty), kind_of(value))),
    }
}

fn check_cross_field(node: &str, kind: ResourceKind, properties: &Properties) -> Result<()> {
    if kind == ResourceKind::ComputeProfile {
        let min = properties.get("min_size").and_then(Value::as_int);
        let max = properties.get("max_size").and_then(Value::as_int);
        let desired = properties.get("desired_size").and_then(Value::as_int);

        if let (Some(min), Some(max)) = (min, max) {
            if min > max {
                return Err(Error::schema(
                    node,
                    format!("min_size {min} exceeds max_size {max}"),
                ));
            }
            if let Some(d) = desired
                && !(min..=max).contains(&d)
            {
                return Err(Error::schema(
                    node,
                    format!("desired_size {d} outside {min}..={max}"),
                ));
            }
        }
    }
    Ok(())
}

/// Parse and check a CIDR block
pub fn parse_cidr(s: &str) -> std::result::Result<(), String> {
    let Some((addr, prefix)) = s.split_once('/') else {
        return Err(format!("'{s}' is not in CIDR notation"));
    };
    let prefix: u32 = prefix
        .parse()
        .map_err(|_| format!("'{s}' has an invalid prefix length"))?;

    if let Ok(v4) = addr.parse::<Ipv4Addr>() {
        if prefix > 32 {
            return Err(format!("'{s}' prefix exceeds 32"));
        }
        let bits = u32::from(v4);
        let host_mask = if prefix == 0 { u32::MAX } else { (1u32 << (32 - prefix)) - 1 };
        if bits & host_mask != 0 {
            return Err(format!("'{s}' has host bits set"));
        }
        return Ok(());
    }

    if let Ok(v6) = addr.parse::<Ipv6Addr>() {
        if prefix > 128 {
            return Err(format!("'{s}' prefix exceeds 128"));
        }
        let bits = u128::from(v6);
        let host_mask = if prefix == 0 { u128::MAX } else { (1u128 << (128 - prefix)) - 1 };
        if bits & host_mask != 0 {
            return Err(format!("'{s}' has host bits set"));
        }
        return Ok(());
    }

    Err(format!("'{s}' is not a valid network address"))
}

fn describe(ty: FieldType) -> &'static str {
    match ty {
        Str => "a string",
        Name => "a name",
        Cidr => "a CIDR block",
        Int => "an integer",
        Port => "a port number",
        Bool => "a boolean",
        StrList => "a list of strings",
        Map => "a map",
        OneOf(_) => "an enumerated string",
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::String(_) => "string",
        Value::Integer(_) => "integer",
        Value::Bool(_) => "boolean",
        Value::List(_) => "list",
        Value::Map(_) => "map",
        Value::Ref(_) => "reference",
    }
}

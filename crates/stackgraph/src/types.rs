//! Core value types shared by the node model, planner and executor

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Property bag of a resource node, keyed by field name
pub type Properties = BTreeMap<String, Value>;

/// Resolved output attributes reported by the provider
pub type Outputs = BTreeMap<String, String>;

/// The finite set of provisionable resource kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Network,
    Subnet,
    FirewallRuleSet,
    Cluster,
    ComputeProfile,
    Registry,
    Role,
    PolicyStatement,
    ManagedAddonRelease,
    ManifestObject,
    OutputBinding,
}

impl ResourceKind {
    pub const ALL: [Self; 11] = [
        Self::Network,
        Self::Subnet,
        Self::FirewallRuleSet,
        Self::Cluster,
        Self::ComputeProfile,
        Self::Registry,
        Self::Role,
        Self::PolicyStatement,
        Self::ManagedAddonRelease,
        Self::ManifestObject,
        Self::OutputBinding,
    ];

    /// Stable snake_case name used in declarations and state
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Subnet => "subnet",
            Self::FirewallRuleSet => "firewall_rule_set",
            Self::Cluster => "cluster",
            Self::ComputeProfile => "compute_profile",
            Self::Registry => "registry",
            Self::Role => "role",
            Self::PolicyStatement => "policy_statement",
            Self::ManagedAddonRelease => "managed_addon_release",
            Self::ManifestObject => "manifest_object",
            Self::OutputBinding => "output_binding",
        }
    }

    /// Parse a kind from its snake_case name
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }

    /// Whether the provider realises this kind
    ///
    /// Output bindings are resolved locally and never reach the provider.
    pub fn is_provisioned(&self) -> bool {
        !matches!(self, Self::OutputBinding)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Placeholder for output attribute `output` of node `node`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeferredRef {
    pub node: String,
    pub output: String,
}

impl DeferredRef {
    pub fn new(node: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            output: output.into(),
        }
    }
}

impl fmt::Display for DeferredRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}}}", self.node, self.output)
    }
}

/// A property value: a literal, or a deferred reference to another node's output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    String(String),
    Integer(i64),
    Bool(bool),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Ref(DeferredRef),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_deferred(&self) -> Option<&DeferredRef> {
        match self {
            Self::Ref(r) => Some(r),
            _ => None,
        }
    }

    /// Collect every deferred reference in this value, including nested ones
    pub fn collect_refs<'a>(&'a self, out: &mut BTreeSet<&'a DeferredRef>) {
        match self {
            Self::Ref(r) => {
                out.insert(r);
            }
            Self::List(items) => items.iter().for_each(|v| v.collect_refs(out)),
            Self::Map(entries) => entries.values().for_each(|v| v.collect_refs(out)),
            Self::String(_) | Self::Integer(_) | Self::Bool(_) => {}
        }
    }

    /// Whether the value contains no deferred references
    pub fn is_resolved(&self) -> bool {
        let mut refs = BTreeSet::new();
        self.collect_refs(&mut refs);
        refs.is_empty()
    }

    /// Render the value as a plain string for display and output export
    pub fn render(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Integer(i) => i.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::List(items) => items.iter().map(Self::render).collect::<Vec<_>>().join(","),
            Self::Map(entries) => {
                let body = entries
                    .iter()
                    .map(|(k, v)| format!("{k}={}", v.render()))
                    .collect::<Vec<_>>()
                    .join(",");
                format!("{{{body}}}")
            }
            Self::Ref(r) => r.to_string(),
        }
    }

    fn hash_into(&self, hasher: &mut blake3::Hasher) {
        match self {
            Self::String(s) => {
                hasher.update(b"s");
                hash_str(hasher, s);
            }
            Self::Integer(i) => {
                hasher.update(b"i");
                hasher.update(&i.to_le_bytes());
            }
            Self::Bool(b) => {
                hasher.update(if *b { b"t" } else { b"f" });
            }
            Self::List(items) => {
                hasher.update(b"l");
                hasher.update(&(items.len() as u64).to_le_bytes());
                for item in items {
                    item.hash_into(hasher);
                }
            }
            Self::Map(entries) => {
                hasher.update(b"m");
                hash_entries(hasher, entries);
            }
            Self::Ref(r) => {
                hasher.update(b"r");
                hash_str(hasher, &r.node);
                hash_str(hasher, &r.output);
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<DeferredRef> for Value {
    fn from(r: DeferredRef) -> Self {
        Self::Ref(r)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

fn hash_str(hasher: &mut blake3::Hasher, s: &str) {
    hasher.update(&(s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

fn hash_entries(hasher: &mut blake3::Hasher, entries: &BTreeMap<String, Value>) {
    hasher.update(&(entries.len() as u64).to_le_bytes());
    for (key, value) in entries {
        hash_str(hasher, key);
        value.hash_into(hasher);
    }
}

/// Content hash of a property bag
///
/// The encoding is length-prefixed and follows `BTreeMap` key order, so two
/// bags hash equal exactly when they are structurally equal.
pub fn content_hash(properties: &Properties) -> String {
    let mut hasher = blake3::Hasher::new();
    hash_entries(&mut hasher, properties);
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip_names() {
        for kind in ResourceKind::ALL {
            assert_eq!(ResourceKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ResourceKind::parse("bucket"), None);
    }

    #[test]
    fn test_collect_nested_refs() {
        let value = Value::List(vec![
            Value::from("a"),
            Value::Ref(DeferredRef::new("net", "id")),
            Value::Map(BTreeMap::from([(
                "inner".to_string(),
                Value::Ref(DeferredRef::new("role", "arn")),
            )])),
        ]);
        let mut refs = BTreeSet::new();
        value.collect_refs(&mut refs);
        let nodes: Vec<_> = refs.iter().map(|r| r.node.as_str()).collect();
        assert_eq!(nodes, vec!["net", "role"]);
        assert!(!value.is_resolved());
        assert!(Value::from("plain").is_resolved());
    }

    #[test]
    fn test_content_hash_is_structural() {
        let mut a = Properties::new();
        a.insert("cidr".into(), "10.0.0.0/16".into());
        a.insert("nat_gateways".into(), 1i64.into());

        let mut b = Properties::new();
        b.insert("nat_gateways".into(), 1i64.into());
        b.insert("cidr".into(), "10.0.0.0/16".into());

        assert_eq!(content_hash(&a), content_hash(&b));

        b.insert("nat_gateways".into(), 2i64.into());
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_hash_distinguishes_string_from_integer() {
        let mut a = Properties::new();
        a.insert("x".into(), "1".into());
        let mut b = Properties::new();
        b.insert("x".into(), 1i64.into());
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_render() {
        assert_eq!(Value::from(vec!["a", "b"]).render(), "a,b");
        assert_eq!(
            Value::Ref(DeferredRef::new("vpc", "id")).render(),
            "${vpc.id}"
        );
    }
}

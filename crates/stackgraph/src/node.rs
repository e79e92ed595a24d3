//! Resource nodes: one declared provisionable unit
//!
//! A node is plain data: logical id, kind, property bag and explicit
//! dependencies. Implicit dependencies are derived from the deferred
//! references found in its properties, so the graph never needs to call
//! into a node to discover its edges.

use crate::error::{Error, Result};
use crate::schema;
use crate::types::{DeferredRef, Properties, ResourceKind, Value, content_hash};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::LazyLock;

static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_-]{0,62}$").expect("id pattern is valid"));

/// One declared resource in the graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNode {
    id: String,
    kind: ResourceKind,
    properties: Properties,
    explicit_deps: BTreeSet<String>,
    implicit_deps: BTreeSet<String>,
}

impl ResourceNode {
    /// Create a node with no explicit dependencies
    pub fn new(id: impl Into<String>, kind: ResourceKind, properties: Properties) -> Result<Self> {
        Self::with_dependencies(id, kind, properties, std::iter::empty::<String>())
    }

    /// Create a node, validating its properties against the kind's schema
    pub fn with_dependencies<I, S>(
        id: impl Into<String>,
        kind: ResourceKind,
        properties: Properties,
        depends_on: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = id.into();
        if !ID_RE.is_match(&id) {
            return Err(Error::schema(
                &id,
                "logical id must be lowercase alphanumeric with '-' or '_', starting with a letter",
            ));
        }

        schema::validate(&id, kind, &properties)?;

        let implicit_deps = {
            let mut refs = BTreeSet::new();
            for value in properties.values() {
                value.collect_refs(&mut refs);
            }
            refs.into_iter().map(|r| r.node.clone()).collect()
        };

        Ok(Self {
            id,
            kind,
            properties,
            explicit_deps: depends_on.into_iter().map(Into::into).collect(),
            implicit_deps,
        })
    }

    /// Start building a node field by field
    pub fn builder(id: impl Into<String>, kind: ResourceKind) -> NodeBuilder {
        NodeBuilder {
            id: id.into(),
            kind,
            properties: Properties::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Dependencies declared explicitly
    pub fn explicit_dependencies(&self) -> &BTreeSet<String> {
        &self.explicit_deps
    }

    /// Dependencies inferred from deferred references
    pub fn implicit_dependencies(&self) -> &BTreeSet<String> {
        &self.implicit_deps
    }

    /// Union of explicit and implicit dependencies
    pub fn dependencies(&self) -> BTreeSet<&str> {
        self.explicit_deps
            .iter()
            .chain(self.implicit_deps.iter())
            .map(String::as_str)
            .collect()
    }

    /// Every deferred reference held by this node's properties
    pub fn references(&self) -> BTreeSet<&DeferredRef> {
        let mut refs = BTreeSet::new();
        for value in self.properties.values() {
            value.collect_refs(&mut refs);
        }
        refs
    }

    /// Content hash of the declared (unresolved) property bag
    pub fn content_hash(&self) -> String {
        content_hash(&self.properties)
    }

    /// Human-readable description
    pub fn description(&self) -> String {
        format!("{} {}", self.kind, self.id)
    }
}

/// Incremental constructor for [`ResourceNode`]
#[derive(Debug, Clone)]
pub struct NodeBuilder {
    id: String,
    kind: ResourceKind,
    properties: Properties,
    depends_on: Vec<String>,
}

impl NodeBuilder {
    /// Set a literal or pre-built property value
    pub fn prop(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(name.to_string(), value.into());
        self
    }

    /// Set a property to a deferred reference to `node`'s `output`
    pub fn reference(mut self, name: &str, node: &str, output: &str) -> Self {
        self.properties
            .insert(name.to_string(), Value::Ref(DeferredRef::new(node, output)));
        self
    }

    /// Add an explicit dependency
    pub fn depends_on(mut self, id: &str) -> Self {
        self.depends_on.push(id.to_string());
        self
    }

    pub fn build(self) -> Result<ResourceNode> {
        ResourceNode::with_dependencies(self.id, self.kind, self.properties, self.depends_on)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_implicit_dependencies_from_references() {
        let node = ResourceNode::builder("cluster", ResourceKind::Cluster)
            .prop("name", "app-cluster")
            .prop("version", "1.29")
            .reference("network", "vpc", "id")
            .prop(
                "subnets",
                Value::List(vec![
                    Value::Ref(DeferredRef::new("private-a", "id")),
                    Value::Ref(DeferredRef::new("private-b", "id")),
                ]),
            )
            .depends_on("nat")
            .build()
            .unwrap();

        let implicit: Vec<_> = node.implicit_dependencies().iter().cloned().collect();
        assert_eq!(implicit, vec!["private-a", "private-b", "vpc"]);
        assert!(node.explicit_dependencies().contains("nat"));
        assert_eq!(
            node.dependencies().into_iter().collect::<Vec<_>>(),
            vec!["nat", "private-a", "private-b", "vpc"]
        );
    }

    #[test]
    fn test_invalid_id_rejected() {
        let err = ResourceNode::builder("Bad Id", ResourceKind::Registry)
            .prop("name", "app")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::SchemaViolation { .. }));
    }

    #[test]
    fn test_schema_checked_on_construction() {
        let err = ResourceNode::builder("vpc", ResourceKind::Network)
            .prop("cidr", "10.0.0.5/16")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("host bits"));
    }

    #[test]
    fn test_hash_ignores_dependency_declaration() {
        let a = ResourceNode::builder("reg", ResourceKind::Registry)
            .prop("name", "app")
            .build()
            .unwrap();
        let b = ResourceNode::builder("reg", ResourceKind::Registry)
            .prop("name", "app")
            .depends_on("vpc")
            .build()
            .unwrap();
        assert_eq!(a.content_hash(), b.content_hash());
    }
}

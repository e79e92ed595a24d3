//! Policy statement aggregates
//!
//! A principal (a role) owns an append-only set of statements. Statements
//! are normalised on construction (sorted, de-duplicated action and
//! resource sets), so attaching the same statement twice, or the same
//! statement written in a different order, is a no-op.

use crate::error::Result;
use crate::node::ResourceNode;
use crate::types::{DeferredRef, Properties, ResourceKind, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Output attribute of the principal that statements reference
pub const PRINCIPAL_OUTPUT: &str = "id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Allow,
    Deny,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "allow" => Some(Self::Allow),
            "deny" => Some(Self::Deny),
            _ => None,
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single normalised policy statement
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyStatement {
    pub effect: Effect,
    pub actions: BTreeSet<String>,
    pub resources: BTreeSet<String>,
    #[serde(default)]
    pub conditions: BTreeMap<String, String>,
}

impl PolicyStatement {
    pub fn new<A, R>(effect: Effect, actions: A, resources: R) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        Self {
            effect,
            actions: actions.into_iter().map(Into::into).collect(),
            resources: resources.into_iter().map(Into::into).collect(),
            conditions: BTreeMap::new(),
        }
    }

    pub fn allow<A, R>(actions: A, resources: R) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        Self::new(Effect::Allow, actions, resources)
    }

    pub fn with_condition(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.conditions.insert(key.into(), value.into());
        self
    }

    /// Content-derived short digest, stable under reordering of the input lists
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.effect.as_str().as_bytes());
        for set in [&self.actions, &self.resources] {
            hasher.update(&(set.len() as u64).to_le_bytes());
            for item in set {
                hasher.update(&(item.len() as u64).to_le_bytes());
                hasher.update(item.as_bytes());
            }
        }
        hasher.update(&(self.conditions.len() as u64).to_le_bytes());
        for (k, v) in &self.conditions {
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
            hasher.update(b";");
        }
        hasher.finalize().to_hex()[..8].to_string()
    }

    fn to_properties(&self, principal: &str) -> Properties {
        let list = |set: &BTreeSet<String>| Value::List(set.iter().cloned().map(Value::String).collect());

        let mut props = Properties::new();
        props.insert(
            "principal".into(),
            Value::Ref(DeferredRef::new(principal, PRINCIPAL_OUTPUT)),
        );
        props.insert("effect".into(), Value::from(self.effect.as_str()));
        props.insert("actions".into(), list(&self.actions));
        props.insert("resources".into(), list(&self.resources));
        if !self.conditions.is_empty() {
            let conditions = self
                .conditions
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            props.insert("conditions".into(), Value::Map(conditions));
        }
        props
    }
}

/// All statements attached to one principal
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySet {
    principal: String,
    statements: Vec<PolicyStatement>,
}

impl PolicySet {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            statements: Vec::new(),
        }
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Statements in attach order
    pub fn statements(&self) -> &[PolicyStatement] {
        &self.statements
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn contains(&self, statement: &PolicyStatement) -> bool {
        self.statements.contains(statement)
    }

    /// Attach a statement; returns `false` if an equal one is already attached
    pub fn attach(&mut self, statement: PolicyStatement) -> bool {
        if self.contains(&statement) {
            return false;
        }
        self.statements.push(statement);
        true
    }

    /// Merge another set for the same principal, keeping existing order
    pub fn merge(&mut self, other: &Self) -> usize {
        other
            .statements
            .iter()
            .filter(|s| self.attach((*s).clone()))
            .count()
    }

    /// Logical id of the node realising `statement` under this principal
    pub fn statement_id(&self, statement: &PolicyStatement) -> String {
        format!("{}-stmt-{}", self.principal, statement.digest())
    }

    /// Expand the set into `PolicyStatement` graph nodes
    ///
    /// Ids derive from content, so reordering the declaration keeps every
    /// node's identity and yields a no-op plan.
    pub fn to_nodes(&self) -> Result<Vec<ResourceNode>> {
        self.statements
            .iter()
            .map(|s| {
                ResourceNode::new(
                    self.statement_id(s),
                    ResourceKind::PolicyStatement,
                    s.to_properties(&self.principal),
                )
            })
            .collect()
    }
}

/// Set equality: same principal, same statements regardless of attach order
pub fn equivalent(a: &PolicySet, b: &PolicySet) -> bool {
    a.principal == b.principal
        && a.statements.iter().collect::<BTreeSet<_>>() == b.statements.iter().collect::<BTreeSet<_>>()
}

//! Stack declaration loader
//!
//! A stack file lists `[[resource]]` blocks and `[[policy]]` blocks:
//!
//! ```toml
//! [[resource]]
//! id = "cluster"
//! kind = "cluster"
//! depends_on = ["alb-role"]
//! [resource.properties]
//! name = "app-cluster"
//! network = { ref = "vpc", output = "id" }
//!
//! [[policy]]
//! principal = "alb-role"
//! [[policy.statement]]
//! effect = "allow"
//! actions = ["elasticloadbalancing:*"]
//! resources = ["*"]
//! ```
//!
//! A table with exactly the keys `ref` and `output` is a deferred reference.

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use stackgraph::{
    DeferredRef, Effect, PolicySet, PolicyStatement, Properties, ResourceGraph, ResourceKind,
    ResourceNode, Value,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StackFile {
    #[serde(default, rename = "resource")]
    resources: Vec<ResourceDecl>,
    #[serde(default, rename = "policy")]
    policies: Vec<PolicyDecl>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResourceDecl {
    id: String,
    kind: String,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    properties: toml::Table,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyDecl {
    principal: String,
    #[serde(default, rename = "statement")]
    statements: Vec<StatementDecl>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StatementDecl {
    effect: String,
    actions: Vec<String>,
    resources: Vec<String>,
    #[serde(default)]
    conditions: BTreeMap<String, String>,
}

/// A parsed stack: resource nodes plus policy sets per principal
#[derive(Debug, Clone)]
pub struct Declaration {
    pub nodes: Vec<ResourceNode>,
    pub policies: Vec<PolicySet>,
}

impl Declaration {
    /// Expand policy sets into statement nodes and build the graph
    pub fn into_graph(self) -> Result<ResourceGraph> {
        let mut nodes = self.nodes;
        for set in &self.policies {
            nodes.extend(set.to_nodes()?);
        }
        Ok(ResourceGraph::build(nodes)?)
    }

    /// Number of statements across all principals
    pub fn statement_count(&self) -> usize {
        self.policies.iter().map(PolicySet::len).sum()
    }
}

/// Load a stack file
pub fn load(path: &Path) -> Result<Declaration> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Could not read stack file {}", path.display()))?;
    parse(&content).with_context(|| format!("Invalid stack file {}", path.display()))
}

/// Parse stack file content
pub fn parse(content: &str) -> Result<Declaration> {
    let file: StackFile = toml::from_str(content)?;

    let nodes = file
        .resources
        .into_iter()
        .map(|decl| {
            let id = decl.id.clone();
            to_node(decl).with_context(|| format!("In resource '{id}'"))
        })
        .collect::<Result<Vec<_>>>()?;

    // Blocks for the same principal merge into one set
    let mut sets: BTreeMap<String, PolicySet> = BTreeMap::new();
    for decl in file.policies {
        let set = sets
            .entry(decl.principal.clone())
            .or_insert_with(|| PolicySet::new(decl.principal.clone()));
        for statement in decl.statements {
            let statement = to_statement(statement)
                .with_context(|| format!("In policy for '{}'", decl.principal))?;
            if !set.attach(statement) {
                log::debug!("Duplicate statement for {} ignored", decl.principal);
            }
        }
    }

    Ok(Declaration {
        nodes,
        policies: sets.into_values().collect(),
    })
}

fn to_node(decl: ResourceDecl) -> Result<ResourceNode> {
    let kind = ResourceKind::parse(&decl.kind).ok_or_else(|| {
        let known: Vec<&str> = ResourceKind::ALL.iter().map(ResourceKind::as_str).collect();
        anyhow!("unknown kind '{}' (expected one of: {})", decl.kind, known.join(", "))
    })?;

    let properties = decl
        .properties
        .into_iter()
        .map(|(name, value)| {
            let value = to_value(value).with_context(|| format!("field '{name}'"))?;
            Ok((name, value))
        })
        .collect::<Result<Properties>>()?;

    Ok(ResourceNode::with_dependencies(
        decl.id,
        kind,
        properties,
        decl.depends_on,
    )?)
}

fn to_statement(decl: StatementDecl) -> Result<PolicyStatement> {
    let effect = Effect::parse(&decl.effect)
        .ok_or_else(|| anyhow!("effect must be 'allow' or 'deny', got '{}'", decl.effect))?;
    if decl.actions.is_empty() {
        bail!("statement has no actions");
    }
    Ok(decl
        .conditions
        .into_iter()
        .fold(PolicyStatement::new(effect, decl.actions, decl.resources), |s, (k, v)| {
            s.with_condition(k, v)
        }))
}

fn to_value(value: toml::Value) -> Result<Value> {
    Ok(match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Integer(i),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(d) => Value::String(d.to_string()),
        toml::Value::Float(f) => bail!("floating point values are not supported ({f})"),
        toml::Value::Array(items) => {
            Value::List(items.into_iter().map(to_value).collect::<Result<_>>()?)
        }
        toml::Value::Table(table) => {
            if let Some(reference) = as_reference(&table) {
                Value::Ref(reference)
            } else {
                Value::Map(
                    table
                        .into_iter()
                        .map(|(k, v)| Ok((k, to_value(v)?)))
                        .collect::<Result<_>>()?,
                )
            }
        }
    })
}

fn as_reference(table: &toml::Table) -> Option<DeferredRef> {
    if table.len() != 2 {
        return None;
    }
    let node = table.get("ref")?.as_str()?;
    let output = table.get("output")?.as_str()?;
    Some(DeferredRef::new(node, output))
}

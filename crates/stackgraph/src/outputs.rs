//! Output resolver: substitutes deferred references with realised outputs
//!
//! Outputs are published per logical id as operations succeed (or, for
//! no-ops, from the stored record). Output bindings are realised here
//! without touching the provider and populate the export map.

use crate::node::ResourceNode;
use crate::types::{DeferredRef, Outputs, Properties, ResourceKind, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Reasons a deferred reference cannot be substituted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The upstream node succeeded but does not produce this attribute
    #[error("'{}' produces no output '{}'", .0.node, .0.output)]
    MissingOutput(DeferredRef),

    /// The upstream node has not published outputs (yet)
    #[error("outputs of '{0}' are not available")]
    Unavailable(String),
}

/// Realised outputs of every node that has completed in this run
#[derive(Debug, Clone, Default)]
pub struct OutputResolver {
    outputs: BTreeMap<String, Outputs>,
    exports: BTreeMap<String, String>,
}

impl OutputResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `id`'s outputs visible to its dependents
    pub fn publish(&mut self, id: &str, outputs: Outputs) {
        log::debug!("Published {} output(s) for {id}", outputs.len());
        self.outputs.insert(id.to_string(), outputs);
    }

    pub fn get(&self, id: &str) -> Option<&Outputs> {
        self.outputs.get(id)
    }

    pub fn is_available(&self, id: &str) -> bool {
        self.outputs.contains_key(id)
    }

    /// Look up a single deferred reference
    pub fn lookup(&self, reference: &DeferredRef) -> Result<&str, ResolveError> {
        let outputs = self
            .outputs
            .get(&reference.node)
            .ok_or_else(|| ResolveError::Unavailable(reference.node.clone()))?;
        outputs
            .get(&reference.output)
            .map(String::as_str)
            .ok_or_else(|| ResolveError::MissingOutput(reference.clone()))
    }

    /// Substitute every deferred reference in `value`, including nested ones
    pub fn resolve_value(&self, value: &Value) -> Result<Value, ResolveError> {
        Ok(match value {
            Value::Ref(r) => Value::String(self.lookup(r)?.to_string()),
            Value::List(items) => Value::List(
                items
                    .iter()
                    .map(|v| self.resolve_value(v))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Map(entries) => Value::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), self.resolve_value(v)?)))
                    .collect::<Result<_, ResolveError>>()?,
            ),
            literal => literal.clone(),
        })
    }

    /// Fully resolve a property bag
    pub fn resolve(&self, properties: &Properties) -> Result<Properties, ResolveError> {
        properties
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.resolve_value(v)?)))
            .collect()
    }

    /// Realise an output binding node locally
    ///
    /// Adds `name = value` to the export map and publishes the binding's own
    /// outputs (`name`, `value`) so other bindings may reference it.
    pub fn bind(&mut self, node: &ResourceNode) -> Result<Outputs, ResolveError> {
        debug_assert_eq!(node.kind(), ResourceKind::OutputBinding);
        let resolved = self.resolve(node.properties())?;
        let name = resolved
            .get("name")
            .map_or_else(|| node.id().to_string(), Value::render);
        let value = resolved.get("value").map(Value::render).unwrap_or_default();

        self.exports.insert(name.clone(), value.clone());
        let outputs = Outputs::from([("name".to_string(), name), ("value".to_string(), value)]);
        self.publish(node.id(), outputs.clone());
        Ok(outputs)
    }

    /// Exported name/value pairs from output bindings
    pub fn exports(&self) -> &BTreeMap<String, String> {
        &self.exports
    }

    pub fn into_exports(self) -> BTreeMap<String, String> {
        self.exports
    }
}

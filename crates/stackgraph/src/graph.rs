//! Resource graph arena and dependency resolver
//!
//! Nodes are stored by logical id; edges are data (`depends-on` sets) rather
//! than object references. Resolution is a depth-first traversal with a
//! three-colour marker. Roots and neighbours are visited in id order, which
//! makes the resulting topological order deterministic.

use crate::error::{Error, Result};
use crate::node::ResourceNode;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Gray,
    Black,
}

/// Topologically order keys of a dependency map
///
/// `deps[k]` lists the keys `k` depends on; every dependency precedes its
/// dependents in the result. On a back-edge the full cycle path is returned
/// as the error, with the first key repeated at the end.
///
/// Keys referenced as dependencies but absent from the map are ignored.
pub fn topo_sort<K>(deps: &BTreeMap<K, BTreeSet<K>>) -> std::result::Result<Vec<K>, Vec<K>>
where
    K: Ord + Clone,
{
    let mut marks: BTreeMap<&K, Mark> = deps.keys().map(|k| (k, Mark::White)).collect();
    let mut order = Vec::with_capacity(deps.len());
    let mut path: Vec<&K> = Vec::new();

    for root in deps.keys() {
        if marks[root] == Mark::White {
            visit(root, deps, &mut marks, &mut path, &mut order)?;
        }
    }
    Ok(order)
}

fn visit<'a, K: Ord + Clone>(
    key: &'a K,
    deps: &'a BTreeMap<K, BTreeSet<K>>,
    marks: &mut BTreeMap<&'a K, Mark>,
    path: &mut Vec<&'a K>,
    order: &mut Vec<K>,
) -> std::result::Result<(), Vec<K>> {
    marks.insert(key, Mark::Gray);
    path.push(key);

    if let Some(children) = deps.get(key) {
        for child in children {
            match marks.get(child).copied() {
                None | Some(Mark::Black) => {}
                Some(Mark::Gray) => {
                    let start = path.iter().position(|k| *k == child).unwrap_or(0);
                    let mut cycle: Vec<K> = path[start..].iter().map(|k| (*k).clone()).collect();
                    cycle.push(child.clone());
                    return Err(cycle);
                }
                Some(Mark::White) => {
                    // `child` is a key of `deps`, so borrow it from the map
                    let (child_key, _) = deps
                        .get_key_value(child)
                        .ok_or_else(|| vec![child.clone()])?;
                    visit(child_key, deps, marks, path, order)?;
                }
            }
        }
    }

    path.pop();
    marks.insert(key, Mark::Black);
    order.push(key.clone());
    Ok(())
}

/// A validated, acyclic set of resource nodes
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: BTreeMap<String, ResourceNode>,
    order: Vec<String>,
}

impl ResourceGraph {
    /// Build a graph, rejecting duplicates, unknown dependencies and cycles
    pub fn build(nodes: impl IntoIterator<Item = ResourceNode>) -> Result<Self> {
        let mut arena = BTreeMap::new();
        for node in nodes {
            let id = node.id().to_string();
            if arena.insert(id.clone(), node).is_some() {
                return Err(Error::DuplicateNode(id));
            }
        }

        for node in arena.values() {
            if let Some(missing) = node
                .dependencies()
                .into_iter()
                .find(|d| !arena.contains_key(*d))
            {
                return Err(Error::UnknownDependency {
                    node: node.id().to_string(),
                    missing: missing.to_string(),
                });
            }
        }

        let deps: BTreeMap<String, BTreeSet<String>> = arena
            .values()
            .map(|n| {
                (
                    n.id().to_string(),
                    n.dependencies().into_iter().map(str::to_string).collect(),
                )
            })
            .collect();

        let order = topo_sort(&deps).map_err(|cycle| Error::CyclicDependency { cycle })?;
        log::debug!("Resolved {} nodes: {}", order.len(), order.join(", "));

        Ok(Self {
            nodes: arena,
            order,
        })
    }

    pub fn get(&self, id: &str) -> Option<&ResourceNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in id order
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    /// Logical ids in topological order (dependencies first)
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Nodes in topological order
    pub fn ordered_nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Nodes that directly depend on `id`
    pub fn dependents_of(&self, id: &str) -> BTreeSet<&str> {
        self.nodes
            .values()
            .filter(|n| n.dependencies().contains(id))
            .map(ResourceNode::id)
            .collect()
    }

    /// Every node that depends on `id`, directly or transitively
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            for dependent in self.dependents_of(&current) {
                if seen.insert(dependent.to_string()) {
                    stack.push(dependent.to_string());
                }
            }
        }
        seen
    }

    /// Every node `id` depends on, directly or transitively
    pub fn transitive_dependencies(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(&current) {
                for dep in node.dependencies() {
                    if seen.insert(dep.to_string()) {
                        stack.push(dep.to_string());
                    }
                }
            }
        }
        seen
    }

    /// Partition into weakly connected components
    ///
    /// Each component is sorted by id; components are ordered by their
    /// smallest member. Nodes in different components never constrain each
    /// other and can run fully in parallel.
    pub fn components(&self) -> Vec<Vec<String>> {
        let mut adjacency: BTreeMap<&str, BTreeSet<&str>> =
            self.nodes.keys().map(|k| (k.as_str(), BTreeSet::new())).collect();
        for node in self.nodes.values() {
            for dep in node.dependencies() {
                adjacency.entry(node.id()).or_default().insert(dep);
                adjacency.entry(dep).or_default().insert(node.id());
            }
        }

        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut components = Vec::new();
        for start in self.nodes.keys() {
            if !seen.insert(start.as_str()) {
                continue;
            }
            let mut component = vec![start.clone()];
            let mut stack = vec![start.as_str()];
            while let Some(current) = stack.pop() {
                for &next in &adjacency[current] {
                    if seen.insert(next) {
                        component.push(next.to_string());
                        stack.push(next);
                    }
                }
            }
            component.sort();
            components.push(component);
        }
        components
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceKind;

    fn network(id: &str) -> ResourceNode {
        ResourceNode::builder(id, ResourceKind::Network)
            .prop("cidr", "10.0.0.0/16")
            .build()
            .unwrap()
    }

    fn cluster(id: &str, net: &str) -> ResourceNode {
        ResourceNode::builder(id, ResourceKind::Cluster)
            .prop("name", id)
            .prop("version", "1.29")
            .reference("network", net, "id")
            .build()
            .unwrap()
    }

    fn registry(id: &str) -> ResourceNode {
        ResourceNode::builder(id, ResourceKind::Registry)
            .prop("name", id)
            .build()
            .unwrap()
    }

    fn position(order: &[String], id: &str) -> usize {
        order.iter().position(|x| x == id).unwrap()
    }

    #[test]
    fn test_order_respects_edges() {
        let graph =
            ResourceGraph::build(vec![cluster("c", "n"), network("n"), registry("r")]).unwrap();
        let order = graph.topological_order();
        assert_eq!(order.len(), 3);
        assert!(position(order, "n") < position(order, "c"));
    }

    #[test]
    fn test_order_is_deterministic() {
        let a = ResourceGraph::build(vec![registry("r"), cluster("c", "n"), network("n")]).unwrap();
        let b = ResourceGraph::build(vec![network("n"), registry("r"), cluster("c", "n")]).unwrap();
        assert_eq!(a.topological_order(), b.topological_order());
        assert_eq!(a.topological_order(), &["n", "c", "r"]);
    }

    #[test]
    fn test_cycle_reports_full_path() {
        let a = ResourceNode::builder("a", ResourceKind::Registry)
            .prop("name", "a")
            .depends_on("b")
            .build()
            .unwrap();
        let b = ResourceNode::builder("b", ResourceKind::Registry)
            .prop("name", "b")
            .depends_on("c")
            .build()
            .unwrap();
        let c = ResourceNode::builder("c", ResourceKind::Registry)
            .prop("name", "c")
            .depends_on("a")
            .build()
            .unwrap();

        match ResourceGraph::build(vec![a, b, c]) {
            Err(Error::CyclicDependency { cycle }) => {
                assert_eq!(cycle, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let a = ResourceNode::builder("a", ResourceKind::Registry)
            .prop("name", "a")
            .depends_on("a")
            .build()
            .unwrap();
        assert!(matches!(
            ResourceGraph::build(vec![a]),
            Err(Error::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_duplicate_and_unknown() {
        assert!(matches!(
            ResourceGraph::build(vec![registry("r"), registry("r")]),
            Err(Error::DuplicateNode(id)) if id == "r"
        ));
        assert!(matches!(
            ResourceGraph::build(vec![cluster("c", "missing")]),
            Err(Error::UnknownDependency { missing, .. }) if missing == "missing"
        ));
    }

    #[test]
    fn test_components() {
        let graph = ResourceGraph::build(vec![
            network("n"),
            cluster("c", "n"),
            registry("r"),
            network("m"),
        ])
        .unwrap();
        assert_eq!(
            graph.components(),
            vec![vec!["c".to_string(), "n".to_string()], vec!["m".to_string()], vec!["r".to_string()]]
        );
    }

    #[test]
    fn test_transitive_relations() {
        let graph = ResourceGraph::build(vec![
            network("n"),
            cluster("c", "n"),
            ResourceNode::builder("nodes", ResourceKind::ComputeProfile)
                .reference("cluster", "c", "name")
                .prop("instance_type", "t3.medium")
                .prop("min_size", 1i64)
                .prop("max_size", 2i64)
                .build()
                .unwrap(),
        ])
        .unwrap();

        let dependents: Vec<_> = graph.transitive_dependents("n").into_iter().collect();
        assert_eq!(dependents, vec!["c", "nodes"]);
        let deps: Vec<_> = graph.transitive_dependencies("nodes").into_iter().collect();
        assert_eq!(deps, vec!["c", "n"]);
    }

    #[test]
    fn test_generic_topo_sort() {
        let deps: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::from([
            (3, BTreeSet::from([1, 2])),
            (2, BTreeSet::from([1])),
            (1, BTreeSet::new()),
        ]);
        assert_eq!(topo_sort(&deps).unwrap(), vec![1, 2, 3]);
    }
}

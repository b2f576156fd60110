//! In-memory taxon hierarchy.
//!
//! [`TaxonGraph`] is built once per taxon harvest from a flat taxon list and a
//! flat list of parent/child edges, and is immutable afterwards. Edges are
//! tagged as *main* (the primary classification shown to users) or
//! *secondary* (cross-links that only widen underlying-taxa expansion).
//!
//! Building also computes each taxon's *effective* sensitivity attributes:
//! protection level and disturbance radius are inherited down main edges so a
//! subspecies is never less protected than the species it belongs to.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use thiserror::Error;
use tracing::debug;

pub type TaxonId = i32;

// ============================================================================
// Input Types
// ============================================================================

/// Flat taxon record as delivered by the taxon source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Taxon {
    pub id: TaxonId,
    pub scientific_name: String,
    pub rank: String,
    /// 0 is public, higher values are more sensitive.
    #[serde(default)]
    pub protection_level: u8,
    #[serde(default)]
    pub disturbance_radius_m: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaxonEdge {
    pub parent_id: TaxonId,
    pub child_id: TaxonId,
    pub is_main_relation: bool,
}

impl TaxonEdge {
    pub fn main(parent_id: TaxonId, child_id: TaxonId) -> Self {
        Self {
            parent_id,
            child_id,
            is_main_relation: true,
        }
    }

    pub fn secondary(parent_id: TaxonId, child_id: TaxonId) -> Self {
        Self {
            parent_id,
            child_id,
            is_main_relation: false,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("taxon graph contains a cycle involving {} taxa, first {:?}", .taxa.len(), .taxa.first())]
    Cycle { taxa: Vec<TaxonId> },

    #[error("edge {parent_id} -> {child_id} references unknown taxon {missing}")]
    UnknownTaxon {
        parent_id: TaxonId,
        child_id: TaxonId,
        missing: TaxonId,
    },

    #[error("taxon {0} is listed more than once")]
    DuplicateTaxon(TaxonId),
}

// ============================================================================
// Graph
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaxonRelation {
    pub taxon_id: TaxonId,
    pub is_main_relation: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaxonNode {
    pub id: TaxonId,
    pub scientific_name: String,
    pub rank: String,
    /// Protection level as delivered for this taxon alone.
    pub own_protection_level: u8,
    /// Disturbance radius as delivered for this taxon alone.
    pub own_disturbance_radius_m: Option<u32>,
    pub parents: Vec<TaxonRelation>,
    pub children: Vec<TaxonRelation>,
    protection_level: u8,
    disturbance_radius_m: Option<u32>,
}

impl TaxonNode {
    /// Effective protection level, inherited along main edges.
    pub fn protection_level(&self) -> u8 {
        self.protection_level
    }

    /// Effective disturbance radius, inherited along main edges.
    pub fn disturbance_radius_m(&self) -> Option<u32> {
        self.disturbance_radius_m
    }

    /// The main parent, if any. With several main parents the lowest id wins.
    pub fn main_parent(&self) -> Option<TaxonId> {
        self.parents
            .iter()
            .find(|r| r.is_main_relation)
            .map(|r| r.taxon_id)
    }
}

/// Immutable snapshot of the taxon hierarchy.
#[derive(Debug, Clone, Default)]
pub struct TaxonGraph {
    nodes: HashMap<TaxonId, TaxonNode>,
    /// Lowercased scientific name to id; `None` marks an ambiguous name.
    by_name: HashMap<String, Option<TaxonId>>,
    reverse_topological: Vec<TaxonId>,
}

impl TaxonGraph {
    /// Builds the graph, failing on unknown edge endpoints or cycles.
    ///
    /// Duplicate edges collapse into one; if any copy is a main relation the
    /// collapsed edge is main.
    pub fn build(taxa: Vec<Taxon>, edges: &[TaxonEdge]) -> Result<Self, GraphError> {
        let mut nodes: HashMap<TaxonId, TaxonNode> = HashMap::with_capacity(taxa.len());
        for taxon in taxa {
            if nodes.contains_key(&taxon.id) {
                return Err(GraphError::DuplicateTaxon(taxon.id));
            }
            nodes.insert(
                taxon.id,
                TaxonNode {
                    id: taxon.id,
                    scientific_name: taxon.scientific_name,
                    rank: taxon.rank,
                    own_protection_level: taxon.protection_level,
                    own_disturbance_radius_m: taxon.disturbance_radius_m,
                    parents: Vec::new(),
                    children: Vec::new(),
                    protection_level: taxon.protection_level,
                    disturbance_radius_m: taxon.disturbance_radius_m,
                },
            );
        }

        let mut collapsed: BTreeMap<(TaxonId, TaxonId), bool> = BTreeMap::new();
        for edge in edges {
            for endpoint in [edge.parent_id, edge.child_id] {
                if !nodes.contains_key(&endpoint) {
                    return Err(GraphError::UnknownTaxon {
                        parent_id: edge.parent_id,
                        child_id: edge.child_id,
                        missing: endpoint,
                    });
                }
            }
            *collapsed
                .entry((edge.parent_id, edge.child_id))
                .or_insert(false) |= edge.is_main_relation;
        }

        // BTreeMap iteration keeps adjacency lists sorted by id.
        for (&(parent_id, child_id), &is_main_relation) in &collapsed {
            if let Some(parent) = nodes.get_mut(&parent_id) {
                parent.children.push(TaxonRelation {
                    taxon_id: child_id,
                    is_main_relation,
                });
            }
            if let Some(child) = nodes.get_mut(&child_id) {
                child.parents.push(TaxonRelation {
                    taxon_id: parent_id,
                    is_main_relation,
                });
            }
        }

        let topological = topological_order(&nodes)?;
        inherit_sensitivity(&mut nodes, &topological);

        let mut by_name: HashMap<String, Option<TaxonId>> = HashMap::with_capacity(nodes.len());
        for node in nodes.values() {
            by_name
                .entry(node.scientific_name.trim().to_lowercase())
                .and_modify(|slot| *slot = None)
                .or_insert(Some(node.id));
        }

        debug!(
            taxa = nodes.len(),
            edges = collapsed.len(),
            "Taxon graph built"
        );

        let mut reverse_topological = topological;
        reverse_topological.reverse();

        Ok(Self {
            nodes,
            by_name,
            reverse_topological,
        })
    }

    /// O(1) lookup by id.
    pub fn get(&self, id: TaxonId) -> Option<&TaxonNode> {
        self.nodes.get(&id)
    }

    /// Case-insensitive lookup by scientific name. Ambiguous names resolve to
    /// `None`.
    pub fn get_by_name(&self, scientific_name: &str) -> Option<&TaxonNode> {
        self.by_name
            .get(&scientific_name.trim().to_lowercase())
            .copied()
            .flatten()
            .and_then(|id| self.nodes.get(&id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Leaves first, roots last.
    pub fn reverse_topological_order(&self) -> &[TaxonId] {
        &self.reverse_topological
    }

    /// Main-edge classification path from `id` up to its root, excluding
    /// `id` itself.
    pub fn ancestors(&self, id: TaxonId) -> Vec<&TaxonNode> {
        let mut path = Vec::new();
        let mut current = self.nodes.get(&id).and_then(TaxonNode::main_parent);
        while let Some(parent_id) = current {
            match self.nodes.get(&parent_id) {
                Some(node) => {
                    path.push(node);
                    current = node.main_parent();
                }
                None => break,
            }
        }
        path
    }

    /// Depth-first closure over child edges (main and secondary).
    ///
    /// Seed ids absent from the graph are passed through unchanged, so a
    /// filter on an unknown taxon narrows to that id alone instead of
    /// widening to everything. Because the result is the union of per-seed
    /// closures the operation is monotone in its input.
    pub fn underlying_taxa(&self, ids: &BTreeSet<TaxonId>, include_self: bool) -> BTreeSet<TaxonId> {
        let mut result = BTreeSet::new();
        let mut visited = BTreeSet::new();
        let mut stack = Vec::new();

        for &seed in ids {
            let Some(node) = self.nodes.get(&seed) else {
                result.insert(seed);
                continue;
            };
            if include_self {
                result.insert(seed);
            }
            stack.extend(node.children.iter().map(|r| r.taxon_id));
            while let Some(id) = stack.pop() {
                if !visited.insert(id) {
                    continue;
                }
                result.insert(id);
                if let Some(child) = self.nodes.get(&id) {
                    stack.extend(child.children.iter().map(|r| r.taxon_id));
                }
            }
        }

        result
    }
}

/// Kahn's algorithm, roots first. Ties are broken by ascending id so the
/// order is reproducible across builds.
fn topological_order(nodes: &HashMap<TaxonId, TaxonNode>) -> Result<Vec<TaxonId>, GraphError> {
    let mut in_degree: BTreeMap<TaxonId, usize> = nodes
        .iter()
        .map(|(&id, node)| (id, node.parents.len()))
        .collect();

    let mut ready: VecDeque<TaxonId> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(&id, _)| id)
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(id) = ready.pop_front() {
        order.push(id);
        for child in &nodes[&id].children {
            if let Some(deg) = in_degree.get_mut(&child.taxon_id) {
                *deg -= 1;
                if *deg == 0 {
                    ready.push_back(child.taxon_id);
                }
            }
        }
    }

    if order.len() < nodes.len() {
        let taxa = in_degree
            .into_iter()
            .filter(|(_, deg)| *deg > 0)
            .map(|(id, _)| id)
            .collect();
        return Err(GraphError::Cycle { taxa });
    }
    Ok(order)
}

fn inherit_sensitivity(nodes: &mut HashMap<TaxonId, TaxonNode>, roots_first: &[TaxonId]) {
    for id in roots_first {
        let node = &nodes[id];
        let mut level = node.own_protection_level;
        let mut radius = node.own_disturbance_radius_m;
        let mut parent_radius: Option<u32> = None;

        for parent in node.parents.iter().filter(|r| r.is_main_relation) {
            let parent = &nodes[&parent.taxon_id];
            level = level.max(parent.protection_level);
            parent_radius = parent_radius.max(parent.disturbance_radius_m);
        }
        if radius.is_none() {
            radius = parent_radius;
        }

        if let Some(node) = nodes.get_mut(id) {
            node.protection_level = level;
            node.disturbance_radius_m = radius;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn taxon(id: TaxonId, name: &str) -> Taxon {
        Taxon {
            id,
            scientific_name: name.to_string(),
            rank: "species".to_string(),
            protection_level: 0,
            disturbance_radius_m: None,
        }
    }

    fn taxa(ids: &[TaxonId]) -> Vec<Taxon> {
        ids.iter().map(|&id| taxon(id, &format!("Taxon {id}"))).collect()
    }

    fn set(ids: &[TaxonId]) -> BTreeSet<TaxonId> {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_underlying_taxa_follows_main_and_secondary_edges() {
        let graph = TaxonGraph::build(
            taxa(&[1, 2, 3]),
            &[TaxonEdge::main(1, 2), TaxonEdge::secondary(1, 3)],
        )
        .unwrap();

        assert_eq!(graph.underlying_taxa(&set(&[1]), false), set(&[2, 3]));
        assert_eq!(graph.underlying_taxa(&set(&[1]), true), set(&[1, 2, 3]));
    }

    #[test]
    fn test_unknown_taxon_passes_through() {
        let graph = TaxonGraph::build(taxa(&[1, 2]), &[TaxonEdge::main(1, 2)]).unwrap();
        assert_eq!(graph.underlying_taxa(&set(&[99999]), true), set(&[99999]));
        assert_eq!(graph.underlying_taxa(&set(&[99999]), false), set(&[99999]));
        assert_eq!(graph.underlying_taxa(&set(&[1, 99999]), false), set(&[2, 99999]));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let err = TaxonGraph::build(
            taxa(&[1, 2, 3, 4]),
            &[
                TaxonEdge::main(1, 2),
                TaxonEdge::main(2, 3),
                TaxonEdge::secondary(3, 2),
                TaxonEdge::main(1, 4),
            ],
        )
        .unwrap_err();
        assert_eq!(err, GraphError::Cycle { taxa: vec![2, 3] });
    }

    #[test]
    fn test_self_edge_is_a_cycle() {
        let err = TaxonGraph::build(taxa(&[1]), &[TaxonEdge::secondary(1, 1)]).unwrap_err();
        assert!(matches!(err, GraphError::Cycle { .. }));
    }

    #[test]
    fn test_unknown_endpoint_is_rejected() {
        let err = TaxonGraph::build(taxa(&[1]), &[TaxonEdge::main(1, 7)]).unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownTaxon {
                parent_id: 1,
                child_id: 7,
                missing: 7
            }
        );
    }

    #[test]
    fn test_reverse_topological_order_is_leaves_first() {
        let graph = TaxonGraph::build(
            taxa(&[1, 2, 3, 4]),
            &[
                TaxonEdge::main(1, 2),
                TaxonEdge::main(2, 3),
                TaxonEdge::secondary(1, 4),
                TaxonEdge::main(3, 4),
            ],
        )
        .unwrap();
        let order = graph.reverse_topological_order();
        let pos = |id| order.iter().position(|&x| x == id).unwrap();
        assert_eq!(order.len(), 4);
        assert!(pos(4) < pos(3));
        assert!(pos(3) < pos(2));
        assert!(pos(2) < pos(1));
    }

    #[test]
    fn test_sensitivity_is_inherited_along_main_edges() {
        let mut species = taxon(10, "Falco peregrinus");
        species.protection_level = 3;
        species.disturbance_radius_m = Some(2000);
        let subspecies = taxon(11, "Falco peregrinus peregrinus");
        let mut cross_linked = taxon(12, "Falco hybrid");
        cross_linked.protection_level = 1;

        let graph = TaxonGraph::build(
            vec![species, subspecies, cross_linked],
            &[TaxonEdge::main(10, 11), TaxonEdge::secondary(10, 12)],
        )
        .unwrap();

        let sub = graph.get(11).unwrap();
        assert_eq!(sub.protection_level(), 3);
        assert_eq!(sub.own_protection_level, 0);
        assert_eq!(sub.disturbance_radius_m(), Some(2000));

        // secondary edges do not carry sensitivity
        let linked = graph.get(12).unwrap();
        assert_eq!(linked.protection_level(), 1);
        assert_eq!(linked.disturbance_radius_m(), None);
    }

    #[test]
    fn test_lookup_by_name_and_ancestors() {
        let graph = TaxonGraph::build(
            vec![
                taxon(1, "Aves"),
                taxon(2, "Falco"),
                taxon(3, "Falco peregrinus"),
                taxon(4, "Duplicate"),
                taxon(5, "duplicate"),
            ],
            &[TaxonEdge::main(1, 2), TaxonEdge::main(2, 3)],
        )
        .unwrap();

        assert_eq!(graph.get_by_name("  falco PEREGRINUS ").unwrap().id, 3);
        assert!(graph.get_by_name("Duplicate").is_none());

        let path: Vec<TaxonId> = graph.ancestors(3).iter().map(|n| n.id).collect();
        assert_eq!(path, vec![2, 1]);
    }

    proptest! {
        #[test]
        fn underlying_taxa_is_monotone(
            edges in proptest::collection::vec((0_i32..20, 0_i32..20, any::<bool>()), 0..40),
            a in proptest::collection::btree_set(0_i32..25, 0..6),
            b in proptest::collection::btree_set(0_i32..25, 0..6),
            include_self in any::<bool>(),
        ) {
            // Only keep parent < child so the graph is acyclic.
            let edges: Vec<TaxonEdge> = edges
                .into_iter()
                .filter(|(p, c, _)| p < c)
                .map(|(p, c, main)| TaxonEdge { parent_id: p, child_id: c, is_main_relation: main })
                .collect();
            let graph = TaxonGraph::build(taxa(&(0..20).collect::<Vec<_>>()), &edges).unwrap();

            let union: BTreeSet<TaxonId> = a.union(&b).copied().collect();
            let small = graph.underlying_taxa(&a, include_self);
            let large = graph.underlying_taxa(&union, include_self);
            prop_assert!(small.is_subset(&large));
        }
    }
}

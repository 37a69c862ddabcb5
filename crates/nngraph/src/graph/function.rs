//! Function: an ordered arena of operator nodes forming one graph.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::graph::node::{Node, NodeId};

/// Index of a Function inside its Module's slot arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionId(pub(crate) u32);

impl FunctionId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One computation graph. Owns its Nodes; Variables live in the Module and
/// are only referenced from here.
///
/// Nodes sit in a slot arena: erasure vacates the slot, so a stale
/// [`NodeId`] resolves to `None` instead of dangling. Insertion order is
/// the traversal order.
#[derive(Debug)]
pub struct Function {
    name: String,
    nodes: Vec<Option<Node>>,
}

impl Function {
    pub(crate) fn new(name: String) -> Self {
        Function {
            name,
            nodes: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends a node and transfers ownership to this Function. No
    /// deduplication is performed.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Some(node));
        id
    }

    /// Resolves a node id; `None` for erased or foreign ids.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Removes and destroys a node. Destruction is dispatched through the
    /// closed [`NodeKind`](crate::graph::node::NodeKind) tag; the vacated
    /// slot makes any later lookup of `id` an explicit miss.
    ///
    /// Callers are expected to have rewired remaining references; a stale
    /// edge is caught by the verifier, not here.
    pub fn erase_node(&mut self, id: NodeId) -> Result<Node> {
        let Some(slot) = self.nodes.get_mut(id.index()) else {
            bail!("node id {} is not part of function '{}'", id.0, self.name);
        };
        match slot.take() {
            Some(node) => Ok(node),
            None => bail!(
                "node id {} in function '{}' was already erased",
                id.0,
                self.name
            ),
        }
    }

    /// Live nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|node| (NodeId(idx as u32), node)))
    }

    /// Number of live nodes.
    pub fn num_nodes(&self) -> usize {
        self.nodes.iter().filter(|slot| slot.is_some()).count()
    }
}

//! Structural cloning of a Function inside its Module.

use std::collections::HashMap;

use anyhow::{bail, ensure, Result};

use crate::graph::function::FunctionId;
use crate::graph::module::Module;
use crate::graph::node::{Node, NodeId, Origin};

impl Module {
    /// Clones `src` into a new Function named `new_name` in this Module.
    ///
    /// Nodes are shallow-copied in order, then every cloned node's
    /// node-origin inputs are rewritten through the old-to-new map.
    /// Variable edges are left untouched: Variables are shared, never
    /// duplicated. When `out_mapping` is supplied it must be empty and is
    /// filled with the old-to-new node ids.
    pub fn clone_function(
        &mut self,
        src: FunctionId,
        new_name: &str,
        mut out_mapping: Option<&mut HashMap<NodeId, NodeId>>,
    ) -> Result<FunctionId> {
        if let Some(map) = out_mapping.as_deref() {
            ensure!(map.is_empty(), "the clone out-mapping must be empty on entry");
        }
        let Some(source) = self.function(src) else {
            bail!("function id {} is not part of this module", src.index());
        };
        let source_count = source.num_nodes();
        let cloned: Vec<(NodeId, Node)> = source
            .nodes()
            .map(|(id, node)| (id, node.clone()))
            .collect();

        let dest = self.create_function(new_name)?;
        let mut curr_to_new: HashMap<NodeId, NodeId> = HashMap::with_capacity(cloned.len());

        let function = self.function_mut(dest).expect("function was just created");
        for (old_id, node) in cloned {
            let new_id = function.add_node(node);
            curr_to_new.insert(old_id, new_id);
        }

        // The fresh clones still point at nodes of the source function;
        // rewrite those edges through the map.
        let new_ids: Vec<NodeId> = function.nodes().map(|(id, _)| id).collect();
        for id in new_ids {
            let node = function.node_mut(id).expect("node was just cloned");
            for input in node.inputs_mut() {
                if let Origin::Node(old) = input.origin {
                    let Some(mapped) = curr_to_new.get(&old).copied() else {
                        bail!(
                            "an input of the cloned function references a node \
                             missing from the source function"
                        );
                    };
                    input.origin = Origin::Node(mapped);
                }
            }
        }

        assert_eq!(
            self.function(dest).expect("clone destination is live").num_nodes(),
            source_count,
            "clone changed the node count"
        );

        if let Some(map) = out_mapping.as_deref_mut() {
            map.extend(curr_to_new);
        }
        Ok(dest)
    }
}

//! Shape completeness checks over an inferred [`ShapeMap`]

use crate::analysis::shape_inference::ShapeMap;
use crate::error::{CompilerError, Result};
use crate::graph::{ComputeGraph, NodeId};

/// Verifies that shape inference produced what the rest of the pipeline needs
pub struct ShapeCompletionChecker<'a> {
    shapes: &'a ShapeMap,
}

impl<'a> ShapeCompletionChecker<'a> {
    pub fn new(shapes: &'a ShapeMap) -> Self {
        Self { shapes }
    }

    /// Every named output of every node must carry a shape.
    ///
    /// The first gap in topological order is reported with the node and tensor.
    pub fn check(&self, graph: &ComputeGraph) -> Result<()> {
        for node_id in graph.topological_order()? {
            let Some(node) = graph.node(node_id) else {
                continue;
            };
            if let Some(missing) = node
                .output_names
                .iter()
                .find(|name| !name.is_empty() && self.shapes.shape(name).is_none())
            {
                return Err(CompilerError::ShapeIncomplete {
                    node: graph.display_name(node_id),
                    op_type: node.op_type.clone(),
                    tensor: missing.clone(),
                });
            }
        }
        Ok(())
    }

    /// First incident tensor of `node_id` whose shape is missing or has an
    /// unresolved dimension
    pub fn first_unresolved(&self, graph: &ComputeGraph, node_id: NodeId) -> Option<String> {
        let node = graph.node(node_id)?;
        node.defs()
            .find(|name| match self.shapes.shape(name) {
                Some(shape) => !shape.is_fully_resolved(),
                None => true,
            })
            .map(str::to_string)
    }

    /// True when every incident tensor has a shape with only resolved dimensions
    pub fn node_shapes_resolved(&self, graph: &ComputeGraph, node_id: NodeId) -> bool {
        graph.node(node_id).is_some() && self.first_unresolved(graph, node_id).is_none()
    }
}

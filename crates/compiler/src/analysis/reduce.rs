//! Reduction attribute decoding shared by shape propagation and vectorization

use crate::graph::{ComputeGraph, GraphNode};
use crate::initializer::LiftedTensor;

/// Operators that reduce over a set of axes
pub const REDUCE_OPS: &[&str] = &[
    "ReduceSum",
    "ReduceMean",
    "ReduceMax",
    "ReduceMin",
    "ReduceProd",
    "ReduceL1",
    "ReduceL2",
    "ReduceLogSum",
    "ReduceLogSumExp",
    "ReduceSumSquare",
];

pub fn is_reduction(op_type: &str) -> bool {
    REDUCE_OPS.contains(&op_type)
}

/// Normalized reduction parameters of one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReduceSpec {
    /// Sorted, de-duplicated, non-negative axes. Empty means every axis.
    pub axes: Vec<usize>,
    pub keep_dims: bool,
    /// `noop_with_empty_axes` with no axes given: the node is an identity
    pub noop: bool,
}

impl ReduceSpec {
    /// Decode axes (attribute form or constant second operand) and keepdims
    /// for a reduction over an operand of rank `rank`.
    ///
    /// Returns `None` when the axes operand is not a constant initializer or an
    /// axis falls outside `[-rank, rank)`.
    pub fn from_node(graph: &ComputeGraph, node: &GraphNode, rank: usize) -> Option<Self> {
        let raw_axes = match node.input(1) {
            Some(axes_name) => {
                let proto = graph.constant_initializer(axes_name)?;
                LiftedTensor::from_proto(proto).ok()?.to_i64_vec()?
            }
            None => node.get_ints_attr("axes").unwrap_or_default(),
        };

        let keep_dims = node.get_int_attr("keepdims").unwrap_or(1) != 0;
        let noop = raw_axes.is_empty() && node.get_int_attr("noop_with_empty_axes").unwrap_or(0) != 0;

        let mut axes = raw_axes
            .into_iter()
            .map(|axis| normalize_axis(axis, rank))
            .collect::<Option<Vec<usize>>>()?;
        axes.sort_unstable();
        axes.dedup();

        Some(Self { axes, keep_dims, noop })
    }

    /// True when `axis` is reduced (an empty axis list reduces everything)
    pub fn reduces(&self, axis: usize) -> bool {
        self.axes.is_empty() || self.axes.binary_search(&axis).is_ok()
    }
}

/// Map a possibly negative axis into `[0, rank)`
pub fn normalize_axis(axis: i64, rank: usize) -> Option<usize> {
    let rank = rank as i64;
    let normalized = if axis < 0 { axis + rank } else { axis };
    if (0..rank).contains(&normalized) {
        Some(normalized as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{int_attr, ints_attr, ElementType};
    use crate::proto::TensorProto;

    #[test]
    fn test_attribute_axes_are_normalized() {
        let mut graph = ComputeGraph::new();
        let id = graph
            .add_op("ReduceSum")
            .input("x")
            .attribute(ints_attr("axes", &[-1, 0, -1]))
            .attribute(int_attr("keepdims", 0))
            .outputs(["y"])
            .finish();

        let spec = ReduceSpec::from_node(&graph, graph.node(id).unwrap(), 3).unwrap();
        assert_eq!(spec.axes, vec![0, 2]);
        assert!(!spec.keep_dims);
        assert!(!spec.noop);
        assert!(spec.reduces(2));
        assert!(!spec.reduces(1));
    }

    #[test]
    fn test_operand_axes_need_a_constant() {
        let mut graph = ComputeGraph::new();
        graph.add_initializer(TensorProto {
            name: "axes".into(),
            dims: vec![1],
            data_type: ElementType::Int64.to_onnx(),
            int64_data: vec![1],
            ..Default::default()
        });
        let constant = graph.add_op("ReduceSum").inputs(["x", "axes"]).outputs(["y"]).finish();
        let dynamic = graph.add_op("ReduceSum").inputs(["x", "runtime_axes"]).outputs(["z"]).finish();

        let spec = ReduceSpec::from_node(&graph, graph.node(constant).unwrap(), 2).unwrap();
        assert_eq!(spec.axes, vec![1]);
        assert!(spec.keep_dims);
        assert!(ReduceSpec::from_node(&graph, graph.node(dynamic).unwrap(), 2).is_none());
    }

    #[test]
    fn test_out_of_range_axis() {
        assert_eq!(normalize_axis(-3, 3), Some(0));
        assert_eq!(normalize_axis(3, 3), None);
        assert_eq!(normalize_axis(-4, 3), None);
    }
}

// Graph module
//
// Intermediate representation of an ONNX graph plus the shape and element
// type vocabulary the analysis passes share.

pub mod ir;
pub mod types;

pub use ir::{
    canonical_domain, int_attr, ints_attr, tensor_value_info, ComputeGraph, Dependency, GraphNode, GraphStatistics,
    NewOp, NodeId,
};
pub use types::{Dim, ElementType, TensorShape, TensorType};

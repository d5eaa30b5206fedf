// Analysis passes that run before partitioning: shape inference, shape
// completeness, and reduction attribute decoding.

pub mod completeness;
pub mod reduce;
pub mod shape_inference;

pub use completeness::ShapeCompletionChecker;
pub use reduce::{is_reduction, normalize_axis, ReduceSpec, REDUCE_OPS};
pub use shape_inference::{DeclaredShapeInference, ShapeInferencer, ShapeMap};

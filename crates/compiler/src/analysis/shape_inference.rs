//! Shape inference
//!
//! The capability pipeline consumes shapes through the [`ShapeInferencer`]
//! trait. [`DeclaredShapeInference`] is the built-in engine:
//!
//! 1. Seed the map from graph inputs, outputs, `value_info` annotations and
//!    initializer dims
//! 2. Traverse the graph in topological order
//! 3. For each node output with no annotation, derive a shape from the input
//!    shapes using operator-specific rules
//!
//! Outputs no rule covers stay absent; the completeness checker decides what
//! that means for the graph.
//!
//! ## Propagated operations
//!
//! - **Unary element-wise**: Relu, Sigmoid, Tanh, Exp, Log, Neg, Abs, Sqrt, Erf, Softmax, Identity, Cast
//! - **Binary element-wise**: Add, Sub, Mul, Div, Pow, Max, Min (broadcasting, symbolic-aware)
//! - **Layout**: Transpose
//! - **Reductions**: the Reduce* family

use crate::analysis::reduce::{is_reduction, ReduceSpec};
use crate::error::{CompilerError, Result};
use crate::graph::{ComputeGraph, Dim, ElementType, GraphNode, TensorShape, TensorType};
use crate::proto::AttributeProto;
use ahash::AHashMap;
use rustc_hash::FxHashMap;

/// Tensor name → inferred type
#[derive(Debug, Clone, Default)]
pub struct ShapeMap {
    types: FxHashMap<String, TensorType>,
}

impl ShapeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, ty: TensorType) {
        self.types.insert(name.into(), ty);
    }

    pub fn get(&self, name: &str) -> Option<&TensorType> {
        self.types.get(name)
    }

    /// Shape of `name`, if one was recorded
    pub fn shape(&self, name: &str) -> Option<&TensorShape> {
        self.types.get(name).and_then(|ty| ty.shape.as_ref())
    }

    pub fn elem_type(&self, name: &str) -> Option<ElementType> {
        self.types.get(name).and_then(|ty| ty.elem_type)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    fn has_shape(&self, name: &str) -> bool {
        self.shape(name).is_some()
    }
}

/// Graph-level shape inference collaborator
pub trait ShapeInferencer: Send + Sync {
    /// Infer a type for as many tensors as possible. An error means the graph
    /// is inconsistent and the provider should not claim any of it.
    fn infer(&self, graph: &ComputeGraph) -> Result<ShapeMap>;
}

/// Annotation-driven inference with light propagation
#[derive(Debug, Default, Clone)]
pub struct DeclaredShapeInference {
    propagate: bool,
}

impl DeclaredShapeInference {
    pub fn new() -> Self {
        Self { propagate: true }
    }

    /// Only trust annotations; never derive shapes from operator rules
    pub fn annotations_only() -> Self {
        Self { propagate: false }
    }

    fn seed(&self, graph: &ComputeGraph) -> ShapeMap {
        let mut shapes = ShapeMap::new();

        for (name, tensor) in graph.initializers_map() {
            shapes.insert(
                name.clone(),
                TensorType::new(ElementType::from_onnx(tensor.data_type), TensorShape::from_static(&tensor.dims)),
            );
        }

        let declared = graph
            .graph_inputs()
            .iter()
            .chain(graph.value_infos())
            .chain(graph.graph_outputs());
        for info in declared {
            let Some(ty) = info.r#type.as_ref().and_then(TensorType::from_proto) else {
                continue;
            };
            // A later annotation only replaces an entry that had no shape
            if ty.shape.is_some() || !shapes.has_shape(&info.name) {
                shapes.insert(info.name.clone(), ty);
            }
        }

        shapes
    }

    fn infer_op_output_shapes(
        &self,
        graph: &ComputeGraph,
        node: &GraphNode,
        input_types: &[&TensorType],
        attributes: &AHashMap<String, AttributeProto>,
    ) -> Result<Option<TensorType>> {
        let first_elem = input_types.first().and_then(|ty| ty.elem_type);
        let shapes: Vec<&TensorShape> = input_types.iter().filter_map(|ty| ty.shape.as_ref()).collect();
        if shapes.len() != input_types.len() || shapes.is_empty() {
            return Ok(None);
        }

        let op_type = node.op_type.as_str();
        let inferred = match op_type {
            "Relu" | "Sigmoid" | "Tanh" | "Exp" | "Log" | "Neg" | "Abs" | "Sqrt" | "Erf" | "Softmax"
            | "LogSoftmax" | "Identity" | "Reciprocal" => Some(TensorType::new(first_elem, shapes[0].clone())),

            "Cast" => {
                let to = get_int_attr(attributes, "to").and_then(|code| ElementType::from_onnx(code as i32));
                Some(TensorType::new(to, shapes[0].clone()))
            }

            "Add" | "Sub" | "Mul" | "Div" | "Pow" | "Max" | "Min" => {
                let mut out = shapes[0].clone();
                for shape in &shapes[1..] {
                    out = broadcast_shapes(&out, shape).map_err(|reason| {
                        CompilerError::ShapeInference(format!(
                            "{} '{}': {}",
                            op_type,
                            graph_label(node),
                            reason
                        ))
                    })?;
                }
                Some(TensorType::new(first_elem, out))
            }

            "Transpose" => {
                let dims = shapes[0].dims();
                let perm = get_ints_attr(attributes, "perm")
                    .unwrap_or_else(|| (0..dims.len() as i64).rev().collect::<Vec<_>>());
                let permuted = perm
                    .iter()
                    .map(|&p| usize::try_from(p).ok().and_then(|p| dims.get(p).cloned()))
                    .collect::<Option<Vec<Dim>>>();
                match permuted {
                    Some(out) if out.len() == dims.len() => Some(TensorType::new(first_elem, TensorShape::new(out))),
                    _ => {
                        return Err(CompilerError::ShapeInference(format!(
                            "Transpose '{}': perm {:?} does not match rank {}",
                            graph_label(node),
                            perm,
                            dims.len()
                        )))
                    }
                }
            }

            op if is_reduction(op) => {
                let dims = shapes[0].dims();
                ReduceSpec::from_node(graph, node, dims.len()).map(|spec| {
                    let out = if spec.noop {
                        dims.to_vec()
                    } else {
                        dims.iter()
                            .enumerate()
                            .filter_map(|(axis, dim)| match (spec.reduces(axis), spec.keep_dims) {
                                (true, true) => Some(Dim::Value(1)),
                                (true, false) => None,
                                (false, _) => Some(dim.clone()),
                            })
                            .collect()
                    };
                    TensorType::new(first_elem, TensorShape::new(out))
                })
            }

            _ => None,
        };

        Ok(inferred)
    }
}

impl ShapeInferencer for DeclaredShapeInference {
    fn infer(&self, graph: &ComputeGraph) -> Result<ShapeMap> {
        let mut shapes = self.seed(graph);
        if !self.propagate {
            return Ok(shapes);
        }

        for node_id in graph.topological_order()? {
            let Some(node) = graph.node(node_id) else {
                continue;
            };
            let Some(output) = node.output_names.first().filter(|name| !name.is_empty()) else {
                continue;
            };
            if node.output_names.len() != 1 || shapes.has_shape(output) {
                continue;
            }

            let input_types: Option<Vec<&TensorType>> = node
                .input_names
                .iter()
                .filter(|name| !name.is_empty())
                .map(|name| shapes.get(name))
                .collect();
            let Some(input_types) = input_types else {
                continue;
            };

            // Convert attributes Vec to HashMap for easier lookup
            let attributes: AHashMap<String, AttributeProto> = node
                .attributes
                .iter()
                .map(|attr| (attr.name.clone(), attr.clone()))
                .collect();

            if let Some(ty) = self.infer_op_output_shapes(graph, node, &input_types, &attributes)? {
                tracing::trace!(
                    node = %graph.display_name(node_id),
                    output = output.as_str(),
                    shape = %ty.shape.as_ref().map(ToString::to_string).unwrap_or_default(),
                    "propagated shape"
                );
                shapes.insert(output.clone(), ty);
            }
        }

        Ok(shapes)
    }
}

fn graph_label(node: &GraphNode) -> &str {
    if node.name.is_empty() {
        node.op_type.as_str()
    } else {
        node.name.as_str()
    }
}

/// Broadcast two shapes according to NumPy broadcasting rules
///
/// Equal symbolic names broadcast to themselves; a symbolic dim against a
/// static extent other than 1 yields that extent; differing names yield
/// `Unknown`.
fn broadcast_shapes(shape1: &TensorShape, shape2: &TensorShape) -> std::result::Result<TensorShape, String> {
    let (a, b) = (shape1.dims(), shape2.dims());
    let max_len = a.len().max(b.len());
    let one = Dim::Value(1);
    let mut output = Vec::with_capacity(max_len);

    for i in 0..max_len {
        let d1 = if i < a.len() { &a[a.len() - 1 - i] } else { &one };
        let d2 = if i < b.len() { &b[b.len() - 1 - i] } else { &one };

        let dim = match (d1, d2) {
            (x, y) if x == y => x.clone(),
            (Dim::Value(1), other) | (other, Dim::Value(1)) => other.clone(),
            (Dim::Value(x), Dim::Value(y)) => {
                return Err(format!("incompatible broadcast dimensions {} and {}", x, y));
            }
            (Dim::Value(v), _) | (_, Dim::Value(v)) => Dim::Value(*v),
            _ => Dim::Unknown,
        };
        output.push(dim);
    }

    output.reverse();
    Ok(TensorShape::new(output))
}

/// Get integer attribute value
fn get_int_attr(attrs: &AHashMap<String, AttributeProto>, name: &str) -> Option<i64> {
    attrs.get(name).and_then(|attr| {
        if attr.r#type == crate::proto::attribute_proto::AttributeType::Int as i32 {
            Some(attr.i)
        } else {
            None
        }
    })
}

/// Get integer array attribute value
fn get_ints_attr(attrs: &AHashMap<String, AttributeProto>, name: &str) -> Option<Vec<i64>> {
    attrs.get(name).and_then(|attr| {
        if attr.r#type == crate::proto::attribute_proto::AttributeType::Ints as i32 {
            Some(attr.ints.clone())
        } else {
            None
        }
    })
}

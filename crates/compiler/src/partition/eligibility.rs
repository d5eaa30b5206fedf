//! Per-node eligibility
//!
//! A node can be claimed when all of its tensors have resolved shapes, a
//! compiled kernel exists for its (domain, op, opset) and the operator's
//! structural rule accepts it.

use crate::analysis::{is_reduction, normalize_axis, ReduceSpec, ShapeCompletionChecker, ShapeMap};
use crate::graph::{canonical_domain, ComputeGraph, GraphNode, NodeId};
use crate::initializer::LiftedTensor;
use rustc_hash::FxHashMap;
use thiserror::Error;

/// Kernel lookup collaborator
pub trait KernelRegistry: Send + Sync {
    /// True when a compiled kernel exists for `op_type` in `domain` at opset `version`
    fn has_kernel(&self, domain: &str, op_type: &str, version: i64) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VersionRange {
    since: i64,
    until: Option<i64>,
}

impl VersionRange {
    fn contains(&self, version: i64) -> bool {
        version >= self.since && self.until.map_or(true, |until| version <= until)
    }
}

/// Table-driven registry keyed by (domain, op_type)
#[derive(Debug, Clone, Default)]
pub struct StaticKernelRegistry {
    entries: FxHashMap<(String, String), Vec<VersionRange>>,
}

const ONNX_KERNELS: &[(&str, i64)] = &[
    ("Abs", 6),
    ("Add", 7),
    ("Cast", 6),
    ("Concat", 4),
    ("Div", 7),
    ("Erf", 9),
    ("Exp", 6),
    ("Expand", 8),
    ("Flatten", 1),
    ("Gather", 1),
    ("Gemm", 7),
    ("Identity", 1),
    ("Log", 6),
    ("LogSoftmax", 1),
    ("MatMul", 1),
    ("Max", 8),
    ("Min", 8),
    ("Mul", 7),
    ("Neg", 6),
    ("Pow", 7),
    ("Reciprocal", 6),
    ("ReduceL1", 1),
    ("ReduceL2", 1),
    ("ReduceLogSum", 1),
    ("ReduceLogSumExp", 1),
    ("ReduceMax", 1),
    ("ReduceMean", 1),
    ("ReduceMin", 1),
    ("ReduceProd", 1),
    ("ReduceSum", 1),
    ("ReduceSumSquare", 1),
    ("Relu", 6),
    ("Reshape", 5),
    ("Sigmoid", 6),
    ("Slice", 1),
    ("Softmax", 1),
    ("Sqrt", 6),
    ("Squeeze", 1),
    ("Sub", 7),
    ("Tanh", 6),
    ("Tile", 6),
    ("Transpose", 1),
    ("Unsqueeze", 1),
];

const MS_DOMAIN: &str = "com.microsoft";
const MS_KERNELS: &[(&str, i64)] = &[("Gelu", 1), ("MatMulInteger16", 1)];

impl StaticKernelRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Kernels shipped with the provider
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for &(op, since) in ONNX_KERNELS {
            registry.register("", op, since, None);
        }
        for &(op, since) in MS_KERNELS {
            registry.register(MS_DOMAIN, op, since, None);
        }
        registry
    }

    /// Register a kernel valid from opset `since` through `until` (inclusive, open when `None`)
    pub fn register(&mut self, domain: &str, op_type: &str, since: i64, until: Option<i64>) -> &mut Self {
        self.entries
            .entry((canonical_domain(domain).to_string(), op_type.to_string()))
            .or_default()
            .push(VersionRange { since, until });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KernelRegistry for StaticKernelRegistry {
    fn has_kernel(&self, domain: &str, op_type: &str, version: i64) -> bool {
        self.entries
            .get(&(canonical_domain(domain).to_string(), op_type.to_string()))
            .is_some_and(|ranges| ranges.iter().any(|range| range.contains(version)))
    }
}

/// Why a node was left to the host engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Unsupported {
    #[error("tensor '{tensor}' has a missing or unresolved shape")]
    UnresolvedShape { tensor: String },

    #[error("graph imports no opset for domain '{domain}'")]
    NoOpset { domain: String },

    #[error("no kernel for '{op_type}' in domain '{domain}' at opset {version}")]
    NoKernel {
        domain: String,
        op_type: String,
        version: i64,
    },

    #[error("operand {slot} of {op_type} is missing")]
    MissingOperand { op_type: String, slot: usize },

    #[error("operand '{operand}' of {op_type} is not a constant initializer")]
    DynamicOperand { op_type: String, operand: String },

    #[error("Slice with a steps operand")]
    SliceSteps,

    #[error("sliced axis {axis} has no static extent")]
    UnknownSlicedAxis { axis: i64 },

    #[error("malformed {op_type} parameters: {reason}")]
    Malformed { op_type: String, reason: String },
}

/// Operator-specific structural rule, chosen by lookup on (domain, op, opset)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EligibilityRule {
    /// No constraints beyond shapes and kernel presence
    Generic,
    /// Repeats operand must be constant
    Tile,
    /// Opset < 10: starts/ends/axes are attributes
    SliceAttributes,
    /// Opset >= 10: starts/ends/axes are constant operands, steps are rejected
    SliceOperands,
    /// Reduce family: axes must decode from attributes or a constant operand
    Reduce,
}

impl EligibilityRule {
    pub fn lookup(domain: &str, op_type: &str, version: i64) -> Self {
        match (canonical_domain(domain), op_type) {
            ("", "Tile") => EligibilityRule::Tile,
            ("", "Slice") if version < 10 => EligibilityRule::SliceAttributes,
            ("", "Slice") => EligibilityRule::SliceOperands,
            ("", op) if is_reduction(op) => EligibilityRule::Reduce,
            _ => EligibilityRule::Generic,
        }
    }

    fn check(self, predicate: &EligibilityPredicate<'_>, node: &GraphNode) -> Result<(), Unsupported> {
        match self {
            EligibilityRule::Generic => Ok(()),
            EligibilityRule::Tile => predicate.constant_operand(node, 1).map(|_| ()),
            EligibilityRule::SliceAttributes => {
                let starts = node.get_ints_attr("starts").ok_or_else(|| Unsupported::Malformed {
                    op_type: node.op_type.clone(),
                    reason: "missing 'starts' attribute".to_string(),
                })?;
                let axes = node
                    .get_ints_attr("axes")
                    .unwrap_or_else(|| (0..starts.len() as i64).collect());
                predicate.check_sliced_axes(node, &axes)
            }
            EligibilityRule::SliceOperands => {
                if node.input(4).is_some() {
                    return Err(Unsupported::SliceSteps);
                }
                let starts = predicate.constant_operand(node, 1)?;
                predicate.constant_operand(node, 2)?;
                let axes = match node.input(3) {
                    Some(_) => predicate.constant_operand(node, 3)?,
                    None => (0..starts.len() as i64).collect(),
                };
                predicate.check_sliced_axes(node, &axes)
            }
            EligibilityRule::Reduce => {
                if node.input(1).is_some() {
                    predicate.constant_operand(node, 1)?;
                }
                let rank = predicate.operand_rank(node)?;
                ReduceSpec::from_node(predicate.graph, node, rank)
                    .map(|_| ())
                    .ok_or_else(|| Unsupported::Malformed {
                        op_type: node.op_type.clone(),
                        reason: format!("axes out of range for rank {}", rank),
                    })
            }
        }
    }
}

/// Boolean per-node capability test
pub struct EligibilityPredicate<'a> {
    graph: &'a ComputeGraph,
    shapes: &'a ShapeMap,
    registry: &'a dyn KernelRegistry,
}

impl<'a> EligibilityPredicate<'a> {
    pub fn new(graph: &'a ComputeGraph, shapes: &'a ShapeMap, registry: &'a dyn KernelRegistry) -> Self {
        Self {
            graph,
            shapes,
            registry,
        }
    }

    /// Evaluate `node_id`, returning the first reason it cannot be claimed
    pub fn evaluate(&self, node_id: NodeId) -> Result<(), Unsupported> {
        let Some(node) = self.graph.node(node_id) else {
            return Err(Unsupported::Malformed {
                op_type: String::new(),
                reason: format!("unknown node {}", node_id.index()),
            });
        };

        if let Some(tensor) = ShapeCompletionChecker::new(self.shapes).first_unresolved(self.graph, node_id) {
            return Err(Unsupported::UnresolvedShape { tensor });
        }

        let domain = canonical_domain(&node.domain);
        let version = self.graph.opset_version(domain).ok_or_else(|| Unsupported::NoOpset {
            domain: domain.to_string(),
        })?;
        if !self.registry.has_kernel(domain, &node.op_type, version) {
            return Err(Unsupported::NoKernel {
                domain: domain.to_string(),
                op_type: node.op_type.clone(),
                version,
            });
        }

        EligibilityRule::lookup(domain, &node.op_type, version).check(self, node)
    }

    /// [`evaluate`](Self::evaluate) collapsed to a boolean; rejections are logged at debug level
    pub fn is_supported(&self, node_id: NodeId) -> bool {
        match self.evaluate(node_id) {
            Ok(()) => true,
            Err(reason) => {
                tracing::debug!(
                    node = %self.graph.display_name(node_id),
                    op_type = self.graph.node(node_id).map(|n| n.op_type.as_str()).unwrap_or(""),
                    %reason,
                    "node not claimed"
                );
                false
            }
        }
    }

    /// Integer contents of the constant initializer feeding `slot`
    fn constant_operand(&self, node: &GraphNode, slot: usize) -> Result<Vec<i64>, Unsupported> {
        let operand = node.input(slot).ok_or_else(|| Unsupported::MissingOperand {
            op_type: node.op_type.clone(),
            slot,
        })?;
        let proto = self
            .graph
            .constant_initializer(operand)
            .ok_or_else(|| Unsupported::DynamicOperand {
                op_type: node.op_type.clone(),
                operand: operand.to_string(),
            })?;
        LiftedTensor::from_proto(proto)
            .ok()
            .and_then(|tensor| tensor.to_i64_vec())
            .ok_or_else(|| Unsupported::Malformed {
                op_type: node.op_type.clone(),
                reason: format!("operand '{}' is not a readable integer tensor", operand),
            })
    }

    fn operand_rank(&self, node: &GraphNode) -> Result<usize, Unsupported> {
        let data = node.input(0).ok_or_else(|| Unsupported::MissingOperand {
            op_type: node.op_type.clone(),
            slot: 0,
        })?;
        self.shapes
            .shape(data)
            .map(|shape| shape.rank())
            .ok_or_else(|| Unsupported::UnresolvedShape {
                tensor: data.to_string(),
            })
    }

    fn check_sliced_axes(&self, node: &GraphNode, axes: &[i64]) -> Result<(), Unsupported> {
        let data = node.input(0).ok_or_else(|| Unsupported::MissingOperand {
            op_type: node.op_type.clone(),
            slot: 0,
        })?;
        let shape = self.shapes.shape(data).ok_or_else(|| Unsupported::UnresolvedShape {
            tensor: data.to_string(),
        })?;

        for &axis in axes {
            let index = normalize_axis(axis, shape.rank()).ok_or_else(|| Unsupported::Malformed {
                op_type: node.op_type.clone(),
                reason: format!("axis {} out of range for rank {}", axis, shape.rank()),
            })?;
            if shape.static_extent(index).is_none() {
                return Err(Unsupported::UnknownSlicedAxis { axis });
            }
        }
        Ok(())
    }
}

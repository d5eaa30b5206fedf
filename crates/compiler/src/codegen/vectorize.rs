//! Vector width and axis-fusion depth for reduction-like operators
//!
//! The planner walks the reduced operand's dimensions from innermost to
//! outermost, multiplying the statically known extents of the contiguous run
//! that can be processed as one vector stream. The walk stops when the product
//! reaches the target's natural width or when the run breaks.

use crate::analysis::{is_reduction, ReduceSpec, ShapeMap};
use crate::codegen::target::TargetDescriptor;
use crate::graph::{ComputeGraph, Dim, ElementType, NodeId, TensorShape};
use serde::Serialize;
use std::ops::ControlFlow;

/// Extent of one dimension as seen by the planner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimStep {
    Known(u64),
    Unknown,
}

impl From<&Dim> for DimStep {
    fn from(dim: &Dim) -> Self {
        match dim.static_extent() {
            Some(extent) => DimStep::Known(extent as u64),
            None => DimStep::Unknown,
        }
    }
}

/// Which dimensions form the vectorizable run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReducePattern {
    /// No axes: every dimension is reduced
    All,
    /// The innermost dimension is reduced; the run is the reduced suffix
    Last,
    /// The innermost dimension is kept; the run is the kept suffix
    Other,
}

impl ReducePattern {
    pub fn classify(rank: usize, axes: &[usize]) -> Self {
        match axes.last() {
            None => ReducePattern::All,
            Some(&last) if rank > 0 && last == rank - 1 => ReducePattern::Last,
            Some(_) => ReducePattern::Other,
        }
    }

    fn in_run(self, axis: usize, axes: &[usize]) -> bool {
        match self {
            ReducePattern::All => true,
            ReducePattern::Last => axes.binary_search(&axis).is_ok(),
            ReducePattern::Other => axes.binary_search(&axis).is_err(),
        }
    }
}

/// Per-operator vectorization parameters handed to the code generator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VectorizationPlan {
    pub vector_width: u32,
    /// Outermost axis index of the fused contiguous run
    pub fuse_dim: usize,
    /// Innermost extent is static and a multiple of `vector_width`
    pub last_dim_aligned: bool,
}

/// Plan for one reduction node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReducePlan {
    pub axes: Vec<usize>,
    pub keep_dims: bool,
    pub pattern: ReducePattern,
    pub elem_type: ElementType,
    pub natural_width: u32,
    pub plan: VectorizationPlan,
}

/// Derives [`VectorizationPlan`]s from static shape knowledge
#[derive(Debug, Default, Clone, Copy)]
pub struct VectorizationPlanner;

impl VectorizationPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Plan a reduction of `shape` over sorted, normalized `axes`
    /// (empty means every axis) for a target lane count of `natural_width`.
    pub fn plan(&self, shape: &TensorShape, axes: &[usize], natural_width: u32) -> VectorizationPlan {
        let steps: Vec<DimStep> = shape.dims().iter().map(DimStep::from).collect();
        let rank = steps.len();
        if rank == 0 {
            return VectorizationPlan {
                vector_width: 1,
                fuse_dim: 0,
                last_dim_aligned: false,
            };
        }

        let natural = u64::from(natural_width.max(1));
        let pattern = ReducePattern::classify(rank, axes);

        let walk = (0..rank).rev().try_fold(1u64, |tail, axis| match (pattern.in_run(axis, axes), steps[axis]) {
            (true, DimStep::Known(extent)) => {
                let tail = tail.saturating_mul(extent);
                if tail >= natural {
                    ControlFlow::Break((natural, axis))
                } else {
                    ControlFlow::Continue(tail)
                }
            }
            // Run broken. At the outermost axis the natural width is kept even
            // though the known tail may be shorter.
            _ if axis > 0 => ControlFlow::Break((tail, axis - 1)),
            _ => ControlFlow::Break((natural, 0)),
        });

        let (width, fuse_dim) = match walk {
            ControlFlow::Break(result) => result,
            ControlFlow::Continue(tail) => (tail, 0),
        };
        let vector_width = u32::try_from(width).unwrap_or(u32::MAX);

        let last_dim_aligned = match steps[rank - 1] {
            DimStep::Known(extent) => extent % u64::from(vector_width.max(1)) == 0,
            DimStep::Unknown => false,
        };

        VectorizationPlan {
            vector_width,
            fuse_dim,
            last_dim_aligned,
        }
    }

    /// Plan the reduction node `node_id`, reading axes/keepdims from the node
    /// and the element width from its first operand.
    ///
    /// `None` for non-reductions, identity reductions, and operands with no
    /// recorded shape or element type.
    pub fn plan_reduction(
        &self,
        graph: &ComputeGraph,
        node_id: NodeId,
        shapes: &ShapeMap,
        target: &TargetDescriptor,
    ) -> Option<ReducePlan> {
        let node = graph.node(node_id)?;
        if !is_reduction(&node.op_type) {
            return None;
        }
        let operand = node.input(0)?;
        let shape = shapes.shape(operand)?;
        let elem_type = shapes.elem_type(operand)?;
        let spec = ReduceSpec::from_node(graph, node, shape.rank())?;
        if spec.noop {
            return None;
        }

        let natural_width = target.natural_vector_width(elem_type.bit_width());
        let plan = self.plan(shape, &spec.axes, natural_width);
        tracing::debug!(
            node = %graph.display_name(node_id),
            shape = %shape,
            axes = ?spec.axes,
            natural_width,
            vector_width = plan.vector_width,
            fuse_dim = plan.fuse_dim,
            "vectorization plan"
        );

        Some(ReducePlan {
            pattern: ReducePattern::classify(shape.rank(), &spec.axes),
            axes: spec.axes,
            keep_dims: spec.keep_dims,
            elem_type,
            natural_width,
            plan,
        })
    }
}

//! Code generator boundary
//!
//! Lowering a fused subgraph to machine code happens outside this crate. The
//! provider describes each subgraph in a [`CodegenRequest`] and receives an
//! opaque [`CompiledUnit`] back.

use crate::analysis::ShapeMap;
use crate::codegen::target::TargetDescriptor;
use crate::codegen::vectorize::ReducePlan;
use crate::graph::{ComputeGraph, NodeId};
use crate::initializer::LiftedTensor;
use crate::partition::SubgraphDescriptor;
use crate::runtime::{TensorView, TensorViewMut};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;

/// Per-pass subgraph identifier, dense from 0 within one compilation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubgraphId(pub u32);

impl std::fmt::Display for SubgraphId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Options forwarded verbatim to the generator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodegenOptions {
    pub enable_per_node_parallel: bool,
    pub allow_unaligned_buffers: bool,
}

/// Everything the generator needs to lower one subgraph
pub struct CodegenRequest<'a> {
    pub id: SubgraphId,
    pub name: &'a str,
    pub graph: &'a ComputeGraph,
    pub subgraph: &'a SubgraphDescriptor,
    pub shapes: &'a ShapeMap,
    /// Lifted constants the subgraph references, in first-use order
    pub initializers: &'a [(String, Arc<LiftedTensor>)],
    pub target: &'a TargetDescriptor,
    pub reduce_plans: &'a FxHashMap<NodeId, ReducePlan>,
    pub options: CodegenOptions,
}

/// Generator rejection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CodegenError {
    pub message: String,
}

impl CodegenError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Status returned by a compiled unit
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("compiled unit returned status {code}: {message}")]
pub struct UnitFailure {
    pub code: i32,
    pub message: String,
}

impl UnitFailure {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Lowers a subgraph to a callable artifact
pub trait CodeGenerator: Send + Sync {
    fn generate(&self, request: &CodegenRequest<'_>) -> Result<Arc<dyn CompiledUnit>, CodegenError>;
}

/// Opaque artifact implementing one fused subgraph
pub trait CompiledUnit: Send + Sync {
    /// Symbol or label of the entry point
    fn entry_point(&self) -> &str;

    /// Scratch bytes each kernel state must provide
    fn workspace_bytes(&self) -> usize {
        0
    }

    /// Run once over bound buffers
    fn invoke(
        &self,
        workspace: &mut [u8],
        inputs: &[TensorView<'_>],
        outputs: &mut [TensorViewMut<'_>],
    ) -> Result<(), UnitFailure>;
}

//! # vecfuse compiler
//!
//! Subgraph compilation pipeline for a SIMD-specialized ONNX execution
//! provider.
//!
//! ## Pipeline
//!
//! ```text
//! ModelProto (prost)
//!     ↓
//! ComputeGraph (petgraph)
//!     ↓ ShapeInferencer + ShapeCompletionChecker
//! ShapeMap
//!     ↓ EligibilityPredicate + GraphPartitioner
//! SubgraphDescriptors ──→ ConstantLifter → InitializerStore
//!     ↓ VectorizationPlanner + CodeGenerator
//! FusedKernel (create_state / compute / release_state)
//! ```
//!
//! The code generator and the host engine are external; they plug in through
//! [`CodeGenerator`], [`CompiledUnit`] and the [`FusedKernel`] lifecycle.

pub mod analysis;
pub mod codegen;
pub mod config;
pub mod error;
pub mod graph;
pub mod initializer;
pub mod partition;
pub mod proto;
pub mod provider;
pub mod runtime;

pub use analysis::{DeclaredShapeInference, ShapeCompletionChecker, ShapeInferencer, ShapeMap};
pub use codegen::{
    CodeGenerator, CodegenError, CodegenOptions, CodegenRequest, CompiledUnit, CpuFeatures, FeatureLevel,
    ReducePattern, ReducePlan, SubgraphId, TargetDescriptor, TargetProfile, TargetSelector, UnitFailure,
    VectorizationPlan, VectorizationPlanner,
};
pub use config::{ConfigError, ProviderConfig, ProviderOptions};
pub use error::{CompilerError, Result};
pub use graph::{ComputeGraph, Dim, ElementType, GraphNode, NodeId, TensorShape, TensorType};
pub use initializer::{ConstantLifter, InitializerStore, LiftOutcome, LiftSummary, LiftedTensor, TensorData};
pub use partition::{
    EligibilityPredicate, EligibilityRule, GraphPartitioner, KernelRegistry, StaticKernelRegistry, SubgraphDescriptor,
    Unsupported,
};
pub use provider::{CapabilityReport, CompilationSession, CompiledSubgraph, ExecutionProvider, SUBGRAPH_PREFIX};
pub use runtime::{CallContext, FusedKernel, InputSignature, KernelState, StatePhase, TensorView, TensorViewMut};

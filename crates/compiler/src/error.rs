//! Error types for the capability and compilation pipeline

use crate::codegen::{CodegenError, UnitFailure};
use std::io;
use thiserror::Error;

/// Result type for compiler operations
pub type Result<T> = std::result::Result<T, CompilerError>;

/// Errors that can occur while claiming, compiling or running fused subgraphs
#[derive(Debug, Error)]
pub enum CompilerError {
    #[error("Unknown target profile '{profile}' (expected one of: stackvm, llvm, avx2, avx512)")]
    Configuration { profile: String },

    #[error("Shape inference incomplete: node '{node}' ({op_type}) has no shape for output '{tensor}'")]
    ShapeIncomplete {
        node: String,
        op_type: String,
        tensor: String,
    },

    #[error("Shape inference failed: {0}")]
    ShapeInference(String),

    #[error("Corrupted initializer '{tensor}': {reason}")]
    DataCorruption { tensor: String, reason: String },

    #[error("Code generation failed for subgraph '{subgraph}' (first node '{node}'): {source}")]
    CompileFailure {
        subgraph: String,
        node: String,
        #[source]
        source: CodegenError,
    },

    #[error("Subgraph '{subgraph}' invocation failed: {source}")]
    InvocationFailure {
        subgraph: String,
        #[source]
        source: UnitFailure,
    },

    #[error("Kernel state creation failed for subgraph '{subgraph}': {reason}")]
    StateCreation { subgraph: String, reason: String },

    #[error("Subgraph '{subgraph}' is disabled after a failed state creation")]
    KernelDisabled { subgraph: String },

    #[error("Kernel lifecycle violation in subgraph '{subgraph}': {reason}")]
    Lifecycle { subgraph: String, reason: String },

    #[error("Invalid invocation of subgraph '{subgraph}': {reason}")]
    InvalidInvocation { subgraph: String, reason: String },

    #[error("Inconsistent opset for domain '{domain}': provider holds version {existing}, graph imports {requested}")]
    InconsistentOpset {
        domain: String,
        existing: i64,
        requested: i64,
    },

    #[error("Graph contains a cycle through node '{node}'")]
    GraphCycle { node: String },

    #[error("Invalid model structure: {0}")]
    InvalidModel(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Protobuf decode error: {0}")]
    DecodeError(#[from] prost::DecodeError),
}

impl CompilerError {
    pub(crate) fn corruption(tensor: &str, reason: impl Into<String>) -> Self {
        CompilerError::DataCorruption {
            tensor: tensor.to_string(),
            reason: reason.into(),
        }
    }
}

//! # vecfuse
//!
//! Fused-subgraph SIMD compilation for ONNX execution providers.
//!
//! ## CLI Usage
//!
//! ```bash
//! # Show which subgraphs the provider would claim, and their vectorization plans
//! vecfuse inspect --input model.onnx --target avx2
//!
//! # Same report as JSON
//! vecfuse inspect --input model.onnx --json
//!
//! # List target profiles and the one auto-selected for this host
//! vecfuse targets
//! ```
//!
//! ## Library Usage
//!
//! ```no_run
//! use vecfuse::{ComputeGraph, ExecutionProvider, ProviderOptions};
//!
//! let graph = ComputeGraph::load(std::path::Path::new("model.onnx"))?;
//! let mut provider = ExecutionProvider::new(ProviderOptions::default())?;
//! let report = provider.get_capability(&graph)?;
//! println!("claimed {} nodes", report.claimed_count());
//! # Ok::<(), vecfuse::CompilerError>(())
//! ```

// Re-export everything from the compiler crate
pub use vecfuse_compiler::*;

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

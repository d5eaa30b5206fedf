//! Execution provider: claims subgraphs and compiles them into fused kernels
//!
//! # Pipeline
//!
//! ```text
//! ComputeGraph
//!     ↓ get_capability
//! 1. Shape inference + completeness check
//! 2. Eligibility per node → GraphPartitioner
//! 3. Lift referenced constants into the InitializerStore
//!     ↓ compile
//! 4. ReducePlans per descriptor → CodeGenerator → FusedKernel
//! ```
//!
//! # Example
//!
//! ```no_run
//! use vecfuse_compiler::{CompilationSession, ComputeGraph, ExecutionProvider, ProviderOptions};
//! # fn generator() -> Box<dyn vecfuse_compiler::CodeGenerator> { unimplemented!() }
//!
//! let graph = ComputeGraph::load(std::path::Path::new("model.onnx"))?;
//! let mut provider = ExecutionProvider::new(ProviderOptions::with_target("avx2"))?;
//! let report = provider.get_capability(&graph)?;
//!
//! let mut session = CompilationSession::new();
//! let kernels = provider.compile(&graph, &report, &mut session, generator().as_ref())?;
//! # Ok::<(), vecfuse_compiler::CompilerError>(())
//! ```

use crate::analysis::{DeclaredShapeInference, ShapeCompletionChecker, ShapeInferencer, ShapeMap};
use crate::codegen::{
    CodeGenerator, CodegenOptions, CodegenRequest, ReducePlan, SubgraphId, TargetDescriptor, TargetSelector,
    VectorizationPlanner,
};
use crate::config::ProviderOptions;
use crate::error::{CompilerError, Result};
use crate::graph::{canonical_domain, ComputeGraph, NodeId};
use crate::initializer::{ConstantLifter, InitializerStore};
use crate::partition::{EligibilityPredicate, GraphPartitioner, KernelRegistry, StaticKernelRegistry, SubgraphDescriptor};
use crate::runtime::{FusedKernel, InputSignature};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Prefix of every compiled subgraph name
pub const SUBGRAPH_PREFIX: &str = "vecfuse_subgraph";

/// Caller-owned subgraph numbering for one compilation pass
#[derive(Debug, Default)]
pub struct CompilationSession {
    next_id: u32,
}

impl CompilationSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restart numbering at 0
    pub fn begin_pass(&mut self) {
        self.next_id = 0;
    }

    pub fn next_id(&mut self) -> SubgraphId {
        let id = SubgraphId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Ids handed out since the last `begin_pass`
    pub fn issued(&self) -> u32 {
        self.next_id
    }
}

/// Result of capability analysis over one graph
#[derive(Debug, Clone, Default)]
pub struct CapabilityReport {
    pub subgraphs: Vec<SubgraphDescriptor>,
    pub shapes: ShapeMap,
}

impl CapabilityReport {
    pub fn is_empty(&self) -> bool {
        self.subgraphs.is_empty()
    }

    /// Claimed node ids, one set per subgraph
    pub fn claimed_nodes(&self) -> Vec<&[NodeId]> {
        self.subgraphs.iter().map(|s| s.nodes()).collect()
    }

    pub fn claimed_count(&self) -> usize {
        self.subgraphs.iter().map(SubgraphDescriptor::len).sum()
    }
}

/// One compiled subgraph handed back to the host engine
#[derive(Debug, Clone)]
pub struct CompiledSubgraph {
    pub descriptor: SubgraphDescriptor,
    pub kernel: Arc<FusedKernel>,
}

/// Hardware-specialized execution provider
pub struct ExecutionProvider {
    target: TargetDescriptor,
    options: CodegenOptions,
    registry: Box<dyn KernelRegistry>,
    inferencer: Box<dyn ShapeInferencer>,
    initializers: InitializerStore,
    opsets: BTreeMap<String, i64>,
}

impl std::fmt::Debug for ExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionProvider")
            .field("target", &self.target)
            .field("options", &self.options)
            .field("initializers", &self.initializers.len())
            .field("opsets", &self.opsets)
            .finish()
    }
}

impl ExecutionProvider {
    /// Create a provider for the running host.
    ///
    /// The target is resolved here and fixed for the provider's lifetime.
    pub fn new(options: ProviderOptions) -> Result<Self> {
        Self::with_target_selector(options, TargetSelector::host())
    }

    /// Create a provider whose target is resolved by `selector`
    pub fn with_target_selector(options: ProviderOptions, selector: TargetSelector) -> Result<Self> {
        let target = selector.select(options.target.as_deref())?;
        Ok(Self {
            target,
            options: CodegenOptions {
                enable_per_node_parallel: options.enable_per_node_parallel,
                allow_unaligned_buffers: options.allow_unaligned_buffers,
            },
            registry: Box::new(StaticKernelRegistry::builtin()),
            inferencer: Box::new(DeclaredShapeInference::new()),
            initializers: InitializerStore::new(),
            opsets: BTreeMap::new(),
        })
    }

    pub fn with_kernel_registry(mut self, registry: impl KernelRegistry + 'static) -> Self {
        self.registry = Box::new(registry);
        self
    }

    pub fn with_shape_inference(mut self, inferencer: impl ShapeInferencer + 'static) -> Self {
        self.inferencer = Box::new(inferencer);
        self
    }

    pub fn target(&self) -> &TargetDescriptor {
        &self.target
    }

    pub fn codegen_options(&self) -> CodegenOptions {
        self.options
    }

    pub fn initializers(&self) -> &InitializerStore {
        &self.initializers
    }

    /// Decide which parts of `graph` this provider runs.
    ///
    /// Graphs whose shapes cannot be inferred or are incomplete are declined
    /// with an empty report rather than an error.
    #[tracing::instrument(skip_all, fields(nodes = graph.node_count(), target = self.target.name()))]
    pub fn get_capability(&mut self, graph: &ComputeGraph) -> Result<CapabilityReport> {
        let shapes = match self.inferencer.infer(graph) {
            Ok(shapes) => shapes,
            Err(e) => {
                tracing::warn!(error = %e, "shape inference failed; declining graph");
                return Ok(CapabilityReport::default());
            }
        };

        match ShapeCompletionChecker::new(&shapes).check(graph) {
            Ok(()) => {}
            Err(e @ CompilerError::ShapeIncomplete { .. }) => {
                tracing::info!(reason = %e, "shapes incomplete; declining graph");
                return Ok(CapabilityReport::default());
            }
            Err(e) => return Err(e),
        }

        self.record_opsets(graph)?;

        let predicate = EligibilityPredicate::new(graph, &shapes, self.registry.as_ref());
        let subgraphs = GraphPartitioner::new().partition(graph, |id| predicate.is_supported(id))?;

        let summary = ConstantLifter::lift_referenced(graph, &subgraphs, &mut self.initializers)?;
        if summary.conflicts > 0 {
            tracing::warn!(conflicts = summary.conflicts, "initializers with conflicting content kept their first value");
        }

        let report = CapabilityReport { subgraphs, shapes };
        if report.is_empty() {
            tracing::info!("no nodes claimed");
        } else {
            tracing::info!(
                subgraphs = report.subgraphs.len(),
                claimed = report.claimed_count(),
                lifted = summary.lifted,
                "capability analysis complete"
            );
        }
        Ok(report)
    }

    /// Compile every claimed subgraph, numbering them from 0 in `session`.
    ///
    /// The generator is called exactly once per subgraph; its first rejection
    /// aborts the pass.
    #[tracing::instrument(skip_all, fields(subgraphs = report.subgraphs.len(), target = self.target.name()))]
    pub fn compile(
        &self,
        graph: &ComputeGraph,
        report: &CapabilityReport,
        session: &mut CompilationSession,
        generator: &dyn CodeGenerator,
    ) -> Result<Vec<CompiledSubgraph>> {
        session.begin_pass();
        let mut compiled = Vec::with_capacity(report.subgraphs.len());

        for descriptor in &report.subgraphs {
            let id = session.next_id();
            let name = format!("{}_{}", SUBGRAPH_PREFIX, id);
            let reduce_plans = self.plan_reductions(graph, descriptor, &report.shapes);
            let initializers = self.initializers.referenced_by(graph, descriptor)?;

            let request = CodegenRequest {
                id,
                name: &name,
                graph,
                subgraph: descriptor,
                shapes: &report.shapes,
                initializers: &initializers,
                target: &self.target,
                reduce_plans: &reduce_plans,
                options: self.options,
            };

            let unit = generator.generate(&request).map_err(|source| CompilerError::CompileFailure {
                subgraph: name.clone(),
                node: descriptor
                    .first_node()
                    .map(|n| graph.display_name(n))
                    .unwrap_or_default(),
                source,
            })?;

            let inputs = descriptor
                .inputs()
                .iter()
                .filter(|tensor| !graph.is_constant_initializer(tensor))
                .map(|tensor| InputSignature {
                    name: tensor.clone(),
                    elem_type: report.shapes.elem_type(tensor),
                    shape: report.shapes.shape(tensor).cloned(),
                })
                .collect();

            tracing::debug!(
                subgraph = %name,
                nodes = descriptor.len(),
                entry_point = unit.entry_point(),
                reductions = reduce_plans.len(),
                "compiled subgraph"
            );

            let kernel = FusedKernel::new(id, name, unit, inputs, descriptor.outputs().to_vec(), self.options);
            compiled.push(CompiledSubgraph {
                descriptor: descriptor.clone(),
                kernel: Arc::new(kernel),
            });
        }

        tracing::info!(compiled = compiled.len(), "compilation pass complete");
        Ok(compiled)
    }

    /// Vectorization plans for every reduction node in `descriptor`
    pub fn plan_reductions(
        &self,
        graph: &ComputeGraph,
        descriptor: &SubgraphDescriptor,
        shapes: &ShapeMap,
    ) -> FxHashMap<NodeId, ReducePlan> {
        let planner = VectorizationPlanner::new();
        descriptor
            .nodes()
            .iter()
            .filter_map(|&id| planner.plan_reduction(graph, id, shapes, &self.target).map(|p| (id, p)))
            .collect()
    }

    fn record_opsets(&mut self, graph: &ComputeGraph) -> Result<()> {
        for (domain, &version) in graph.opset_imports() {
            let domain = canonical_domain(domain);
            match self.opsets.get(domain) {
                Some(&existing) if existing != version => {
                    return Err(CompilerError::InconsistentOpset {
                        domain: domain.to_string(),
                        existing,
                        requested: version,
                    });
                }
                Some(_) => {}
                None => {
                    self.opsets.insert(domain.to_string(), version);
                }
            }
        }
        Ok(())
    }
}

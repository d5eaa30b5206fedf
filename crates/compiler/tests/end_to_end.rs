//! Capability → compile → create/compute/release through the public API

mod common;

use common::*;
use std::sync::Arc;
use vecfuse_compiler::analysis::ShapeMap;
use vecfuse_compiler::codegen::UnitFailure;
use vecfuse_compiler::graph::tensor_value_info;
use vecfuse_compiler::runtime::{CallContext, TensorView, TensorViewMut};
use vecfuse_compiler::{
    CompilationSession, CompilerError, ComputeGraph, Dim, ElementType, ExecutionProvider, ProviderOptions,
    ReducePattern, ShapeInferencer,
};

fn provider(target: &str) -> ExecutionProvider {
    ExecutionProvider::with_target_selector(ProviderOptions::with_target(target), avx2_host()).unwrap()
}

#[test]
fn test_reduce_last_axis_single_subgraph() {
    let graph = reduce_sum_graph(&dims(&[4, 8]), &[1]);
    let mut provider = provider("avx2");

    let report = provider.get_capability(&graph).unwrap();
    assert_eq!(report.subgraphs.len(), 1);
    assert_eq!(report.subgraphs[0].inputs(), &["x".to_string(), "axes".to_string()]);
    assert_eq!(report.subgraphs[0].outputs(), &["y".to_string()]);
    assert!(provider.initializers().contains("axes"));

    let generator = MockGenerator::new();
    let mut session = CompilationSession::new();
    let compiled = provider.compile(&graph, &report, &mut session, &generator).unwrap();
    assert_eq!(compiled.len(), 1);
    assert_eq!(generator.calls(), 1);

    let seen = generator.seen();
    assert_eq!(seen[0].name, "vecfuse_subgraph_0");
    assert_eq!(seen[0].initializers, vec!["axes".to_string()]);
    assert_eq!(seen[0].vector_bits, 256);
    let plan = &seen[0].reduce_plans[0];
    assert_eq!(plan.axes, vec![1]);
    assert_eq!(plan.pattern, ReducePattern::Last);
    assert_eq!(plan.natural_width, 8);
    assert_eq!(plan.plan.vector_width, 8);
    assert_eq!(plan.plan.fuse_dim, 1);
    assert!(plan.plan.last_dim_aligned);
}

#[test]
fn test_lifecycle_returns_unit_result() {
    let graph = reduce_sum_graph(&dims(&[4, 8]), &[1]);
    let mut provider = provider("avx2");
    let report = provider.get_capability(&graph).unwrap();
    let generator = MockGenerator::new();
    let compiled = provider
        .compile(&graph, &report, &mut CompilationSession::new(), &generator)
        .unwrap();

    let kernel = Arc::clone(&compiled[0].kernel);
    assert_eq!(kernel.entry_point(), "vecfuse_subgraph_0_entry");
    assert_eq!(kernel.inputs().len(), 1);

    let mut state = kernel.create_state(&CallContext::new(vec![vec![4, 8]])).unwrap();
    let x: Vec<f32> = (0..32).map(|v| v as f32).collect();
    let mut y = [0.0f32; 4];
    let in_shape = [4i64, 8];
    let out_shape = [4i64];
    kernel
        .compute(
            &mut state,
            &[TensorView::from_f32(&in_shape, &x)],
            &mut [TensorViewMut::from_f32(&out_shape, &mut y)],
        )
        .unwrap();
    kernel.release_state(&mut state).unwrap();
    kernel.release_state(&mut state).unwrap();

    assert_eq!(y, [28.0, 92.0, 156.0, 220.0]);
}

#[test]
fn test_unit_failure_surfaces_verbatim() {
    let graph = reduce_sum_graph(&dims(&[4, 8]), &[1]);
    let mut provider = provider("avx2");
    let report = provider.get_capability(&graph).unwrap();
    let failure = UnitFailure::new(-14, "out of scratch memory");
    let generator = MockGenerator::failing_units(failure.clone());
    let compiled = provider
        .compile(&graph, &report, &mut CompilationSession::new(), &generator)
        .unwrap();
    let kernel = &compiled[0].kernel;

    let mut state = kernel.create_state(&CallContext::new(vec![vec![4, 8]])).unwrap();
    let x = vec![0.0f32; 32];
    let mut y = [0.0f32; 4];
    let err = kernel
        .compute(
            &mut state,
            &[TensorView::from_f32(&[4, 8], &x)],
            &mut [TensorViewMut::from_f32(&[4], &mut y)],
        )
        .unwrap_err();
    kernel.release_state(&mut state).unwrap();

    match err {
        CompilerError::InvocationFailure { subgraph, source } => {
            assert_eq!(subgraph, "vecfuse_subgraph_0");
            assert_eq!(source, failure);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_state_creation_failure_disables_kernel() {
    let graph = reduce_sum_graph(&dims(&[4, 8]), &[1]);
    let mut provider = provider("avx2");
    let report = provider.get_capability(&graph).unwrap();
    let compiled = provider
        .compile(&graph, &report, &mut CompilationSession::new(), &MockGenerator::new())
        .unwrap();
    let kernel = &compiled[0].kernel;

    let err = kernel.create_state(&CallContext::new(vec![vec![4, 9]])).unwrap_err();
    assert!(matches!(err, CompilerError::StateCreation { .. }));
    let err = kernel.create_state(&CallContext::new(vec![vec![4, 8]])).unwrap_err();
    assert!(matches!(err, CompilerError::KernelDisabled { .. }));
}

#[test]
fn test_generator_rejection_names_subgraph_and_node() {
    let graph = reduce_sum_graph(&dims(&[4, 8]), &[1]);
    let mut provider = provider("avx2");
    let report = provider.get_capability(&graph).unwrap();
    let generator = MockGenerator::rejecting("vecfuse_subgraph_0");

    let err = provider
        .compile(&graph, &report, &mut CompilationSession::new(), &generator)
        .unwrap_err();
    assert_eq!(generator.calls(), 1);
    match err {
        CompilerError::CompileFailure { subgraph, node, source } => {
            assert_eq!(subgraph, "vecfuse_subgraph_0");
            assert_eq!(node, "reduce");
            assert_eq!(source.message, "unsupported fusion pattern");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_sequential_compilations_restart_numbering() {
    // Relu -> Softsign (no kernel) -> Relu: two subgraphs
    let mut graph = unary_chain(&["Relu"]);
    graph.add_op("Softsign").name("host_only").input("t0").outputs(["mid"]).finish();
    graph.add_op("Relu").name("tail").input("mid").outputs(["out"]).finish();
    graph.add_value_info(tensor_value_info("mid", ElementType::Float, &dims(&[2, 4])));
    graph.add_value_info(tensor_value_info("out", ElementType::Float, &dims(&[2, 4])));

    let mut provider = provider("avx2");
    let report = provider.get_capability(&graph).unwrap();
    assert_eq!(report.subgraphs.len(), 2);

    let generator = MockGenerator::new();
    let mut session = CompilationSession::new();
    let first = provider.compile(&graph, &report, &mut session, &generator).unwrap();
    let second = provider.compile(&graph, &report, &mut session, &generator).unwrap();

    let ids = |c: &[vecfuse_compiler::CompiledSubgraph]| c.iter().map(|s| s.kernel.id().0).collect::<Vec<_>>();
    assert_eq!(ids(&first), vec![0, 1]);
    assert_eq!(ids(&second), vec![0, 1]);
    assert_eq!(second[1].kernel.name(), "vecfuse_subgraph_1");
}

#[test]
fn test_threads_number_independently() {
    let graph = reduce_sum_graph(&dims(&[4, 8]), &[1]);
    let mut provider = provider("avx2");
    let report = provider.get_capability(&graph).unwrap();
    let generator = MockGenerator::new();
    let (provider, graph, report, generator_ref) = (&provider, &graph, &report, &generator);

    let names: Vec<Vec<String>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(move || {
                    let mut session = CompilationSession::new();
                    let compiled = provider.compile(graph, report, &mut session, generator_ref).unwrap();
                    compiled.iter().map(|c| c.kernel.name().to_string()).collect::<Vec<String>>()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for thread_names in names {
        assert_eq!(thread_names, vec!["vecfuse_subgraph_0".to_string()]);
    }
    assert_eq!(generator.calls(), 4);
}

struct FailingInference;

impl ShapeInferencer for FailingInference {
    fn infer(&self, _graph: &ComputeGraph) -> vecfuse_compiler::Result<ShapeMap> {
        Err(CompilerError::ShapeInference("rank mismatch".into()))
    }
}

#[test]
fn test_inference_failure_declines_graph() {
    let graph = reduce_sum_graph(&dims(&[4, 8]), &[1]);
    let mut provider = provider("avx2").with_shape_inference(FailingInference);
    let report = provider.get_capability(&graph).unwrap();
    assert!(report.is_empty());
    assert!(provider.initializers().is_empty());
}

#[test]
fn test_incomplete_shapes_decline_graph() {
    let mut graph = ComputeGraph::new();
    graph.set_opset("", 13);
    graph.add_input(tensor_value_info("x", ElementType::Float, &dims(&[4, 8])));
    // No inference rule and no annotation for the NonZero output
    graph.add_op("NonZero").name("nz").input("x").outputs(["idx"]).finish();

    let mut provider = provider("avx2");
    assert!(provider.get_capability(&graph).unwrap().is_empty());
}

#[test]
fn test_symbolic_batch_is_claimed_and_bound_at_creation() {
    let graph = reduce_sum_graph(&[Dim::Param("batch".into()), Dim::Value(8)], &[-1]);
    let mut provider = provider("avx2");
    let report = provider.get_capability(&graph).unwrap();
    assert_eq!(report.subgraphs.len(), 1);

    let compiled = provider
        .compile(&graph, &report, &mut CompilationSession::new(), &MockGenerator::new())
        .unwrap();
    let kernel = &compiled[0].kernel;
    let mut state = kernel.create_state(&CallContext::new(vec![vec![3, 8]])).unwrap();
    assert_eq!(state.bindings().get("batch"), Some(&3));
    kernel.release_state(&mut state).unwrap();
}

#[test]
fn test_unknown_dim_leaves_node_to_host() {
    let graph = reduce_sum_graph(&[Dim::Unknown, Dim::Value(8)], &[1]);
    let mut provider = provider("avx2");
    let report = provider.get_capability(&graph).unwrap();
    assert!(report.is_empty());
}

#[test]
fn test_stackvm_plans_scalar_width() {
    let mut graph = reduce_sum_graph(&dims(&[4, 8]), &[1]);
    graph.add_op("Relu").name("post").input("y").outputs(["z"]).finish();
    graph.add_output(tensor_value_info("z", ElementType::Float, &dims(&[4])));

    let mut provider = provider("stackvm");
    let report = provider.get_capability(&graph).unwrap();
    assert_eq!(report.subgraphs.len(), 1);
    assert_eq!(report.subgraphs[0].len(), 2);

    let plans = provider.plan_reductions(&graph, &report.subgraphs[0], &report.shapes);
    let plan = plans.values().next().unwrap();
    assert_eq!(plan.natural_width, 1);
    assert_eq!(plan.plan.vector_width, 1);
}

#[test]
fn test_runtime_axes_leave_reduction_to_host() {
    let mut graph = ComputeGraph::new();
    graph.set_opset("", 13);
    graph.add_input(tensor_value_info("x", ElementType::Float, &dims(&[4, 8])));
    graph.add_input(tensor_value_info("axes", ElementType::Int64, &dims(&[1])));
    graph
        .add_op("ReduceSum")
        .name("reduce")
        .inputs(["x", "axes"])
        .outputs(["y"])
        .finish();
    graph.add_output(tensor_value_info("y", ElementType::Float, &dims(&[4])));

    let mut provider = provider("avx2");
    let report = provider.get_capability(&graph).unwrap();
    assert!(report.is_empty());
}

#[test]
fn test_every_claimed_reduction_has_a_plan() {
    let graph = reduce_sum_graph(&dims(&[4, 8]), &[1]);
    let mut provider = provider("avx2");
    let report = provider.get_capability(&graph).unwrap();

    for subgraph in &report.subgraphs {
        let plans = provider.plan_reductions(&graph, subgraph, &report.shapes);
        let reductions = subgraph
            .nodes()
            .iter()
            .filter(|&&id| graph.node(id).is_some_and(|n| n.op_type.starts_with("Reduce")))
            .count();
        assert_eq!(plans.len(), reductions);
    }
}

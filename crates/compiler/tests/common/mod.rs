//! Shared fixtures for the integration suites

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use vecfuse_compiler::codegen::{CodeGenerator, CodegenError, CodegenRequest, CompiledUnit, UnitFailure};
use vecfuse_compiler::graph::{int_attr, tensor_value_info};
use vecfuse_compiler::proto::{TensorProto, ValueInfoProto};
use vecfuse_compiler::runtime::{TensorView, TensorViewMut};
use vecfuse_compiler::{ComputeGraph, CpuFeatures, Dim, ElementType, ReducePlan, TargetSelector};

pub fn dims(extents: &[i64]) -> Vec<Dim> {
    extents.iter().map(|&e| Dim::Value(e)).collect()
}

pub fn avx2_host() -> TargetSelector {
    TargetSelector::with_features(CpuFeatures {
        avx512f: false,
        avx2: true,
        native_codegen: true,
    })
}

pub fn float_tensor(name: &str, shape: &[i64], values: &[f32]) -> TensorProto {
    TensorProto {
        name: name.to_string(),
        dims: shape.to_vec(),
        data_type: ElementType::Float.to_onnx(),
        raw_data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        ..Default::default()
    }
}

pub fn i64_tensor(name: &str, values: &[i64]) -> TensorProto {
    TensorProto {
        name: name.to_string(),
        dims: vec![values.len() as i64],
        data_type: ElementType::Int64.to_onnx(),
        int64_data: values.to_vec(),
        ..Default::default()
    }
}

/// `y = ReduceSum(x, axes)` at opset 13, keepdims 0
pub fn reduce_sum_graph(shape: &[Dim], axes: &[i64]) -> ComputeGraph {
    let mut graph = ComputeGraph::new();
    graph.set_opset("", 13);
    graph.add_input(tensor_value_info("x", ElementType::Float, shape));
    graph.add_initializer(i64_tensor("axes", axes));
    graph
        .add_op("ReduceSum")
        .name("reduce")
        .inputs(["x", "axes"])
        .attribute(int_attr("keepdims", 0))
        .outputs(["y"])
        .finish();
    graph.add_output(ValueInfoProto {
        name: "y".to_string(),
        ..Default::default()
    });
    graph
}

/// Linear chain `x -> op_0 -> t0 -> op_1 -> t1 ...` of unary ops over a [2, 4] tensor.
/// The last tensor is the graph output.
pub fn unary_chain(ops: &[&str]) -> ComputeGraph {
    let mut graph = ComputeGraph::new();
    graph.set_opset("", 13);
    graph.add_input(tensor_value_info("x", ElementType::Float, &dims(&[2, 4])));
    let mut prev = "x".to_string();
    for (i, op) in ops.iter().enumerate() {
        let out = format!("t{}", i);
        graph.add_op(*op).name(format!("n{}", i)).input(prev.clone()).outputs([out.clone()]).finish();
        prev = out;
    }
    graph.add_output(tensor_value_info(&prev, ElementType::Float, &dims(&[2, 4])));
    graph
}

/// What a generator saw for one subgraph
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub id: u32,
    pub name: String,
    pub nodes: usize,
    pub initializers: Vec<String>,
    pub reduce_plans: Vec<ReducePlan>,
    pub vector_bits: u32,
}

/// Generator that records requests and hands out [`RowSumUnit`]s
#[derive(Default)]
pub struct MockGenerator {
    calls: AtomicUsize,
    seen: Mutex<Vec<SeenRequest>>,
    /// Subgraph name to reject
    pub reject: Option<String>,
    /// Status every produced unit returns instead of computing
    pub unit_failure: Option<UnitFailure>,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(name: &str) -> Self {
        Self {
            reject: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn failing_units(failure: UnitFailure) -> Self {
        Self {
            unit_failure: Some(failure),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }
}

impl CodeGenerator for MockGenerator {
    fn generate(&self, request: &CodegenRequest<'_>) -> Result<Arc<dyn CompiledUnit>, CodegenError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut reduce_plans: Vec<_> = request.reduce_plans.iter().collect();
        reduce_plans.sort_by_key(|(id, _)| id.index());
        self.seen.lock().unwrap().push(SeenRequest {
            id: request.id.0,
            name: request.name.to_string(),
            nodes: request.subgraph.len(),
            initializers: request.initializers.iter().map(|(name, _)| name.clone()).collect(),
            reduce_plans: reduce_plans.into_iter().map(|(_, plan)| plan.clone()).collect(),
            vector_bits: request.target.vector_bits(),
        });

        if self.reject.as_deref() == Some(request.name) {
            return Err(CodegenError::new("unsupported fusion pattern"));
        }
        Ok(Arc::new(RowSumUnit {
            entry: format!("{}_entry", request.name),
            failure: self.unit_failure.clone(),
        }))
    }
}

/// Sums the innermost axis of input 0 into output 0 (f32)
pub struct RowSumUnit {
    entry: String,
    failure: Option<UnitFailure>,
}

impl CompiledUnit for RowSumUnit {
    fn entry_point(&self) -> &str {
        &self.entry
    }

    fn workspace_bytes(&self) -> usize {
        64
    }

    fn invoke(
        &self,
        _workspace: &mut [u8],
        inputs: &[TensorView<'_>],
        outputs: &mut [TensorViewMut<'_>],
    ) -> Result<(), UnitFailure> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        let row = inputs[0].shape.last().copied().unwrap_or(1).max(1) as usize;
        let src: &[f32] = bytemuck::cast_slice(inputs[0].data);
        let sums: Vec<f32> = src.chunks(row).map(|chunk| chunk.iter().sum()).collect();
        for (dst, sum) in outputs[0].data.chunks_mut(4).zip(sums) {
            dst.copy_from_slice(&sum.to_ne_bytes());
        }
        Ok(())
    }
}

//! Create/compute/release lifecycle around a compiled unit
//!
//! A [`FusedKernel`] is shared by every binding of one subgraph. Each binding
//! owns a [`KernelState`] holding its workspace and the symbolic dimension
//! values realized at creation time.

use crate::codegen::{CodegenOptions, CompiledUnit, SubgraphId};
use crate::error::{CompilerError, Result};
use crate::graph::{Dim, ElementType, TensorShape};
use crate::runtime::{TensorView, TensorViewMut};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_KERNEL_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Runtime operand expected by a kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSignature {
    pub name: String,
    pub elem_type: Option<ElementType>,
    pub shape: Option<TensorShape>,
}

/// Realized input shapes supplied by the host when binding a kernel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    pub input_shapes: Vec<Vec<i64>>,
}

impl CallContext {
    pub fn new(input_shapes: Vec<Vec<i64>>) -> Self {
        Self { input_shapes }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatePhase {
    Uninitialized,
    Ready,
    Released,
}

impl fmt::Display for StatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatePhase::Uninitialized => "uninitialized",
            StatePhase::Ready => "ready",
            StatePhase::Released => "released",
        };
        f.write_str(s)
    }
}

/// Per-binding runtime state
pub struct KernelState {
    phase: StatePhase,
    owner: u64,
    subgraph: String,
    workspace: Vec<u8>,
    bindings: BTreeMap<String, i64>,
    input_shapes: Vec<Vec<i64>>,
    unit: Option<Arc<dyn CompiledUnit>>,
}

impl Default for KernelState {
    fn default() -> Self {
        Self {
            phase: StatePhase::Uninitialized,
            owner: 0,
            subgraph: String::new(),
            workspace: Vec::new(),
            bindings: BTreeMap::new(),
            input_shapes: Vec::new(),
            unit: None,
        }
    }
}

impl KernelState {
    pub fn phase(&self) -> StatePhase {
        self.phase
    }

    pub fn is_ready(&self) -> bool {
        self.phase == StatePhase::Ready
    }

    /// Symbolic dimension values bound at creation
    pub fn bindings(&self) -> &BTreeMap<String, i64> {
        &self.bindings
    }

    pub fn workspace_len(&self) -> usize {
        self.workspace.len()
    }
}

impl fmt::Debug for KernelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelState")
            .field("phase", &self.phase)
            .field("subgraph", &self.subgraph)
            .field("workspace_len", &self.workspace.len())
            .field("bindings", &self.bindings)
            .finish()
    }
}

impl Drop for KernelState {
    fn drop(&mut self) {
        if self.phase == StatePhase::Ready && !std::thread::panicking() {
            tracing::error!(subgraph = %self.subgraph, "kernel state dropped while ready; release_state was never called");
            debug_assert!(false, "kernel state for '{}' dropped while ready", self.subgraph);
        }
    }
}

/// Shared handle for one compiled subgraph
pub struct FusedKernel {
    id: SubgraphId,
    name: String,
    serial: u64,
    unit: Arc<dyn CompiledUnit>,
    inputs: Vec<InputSignature>,
    outputs: Vec<String>,
    options: CodegenOptions,
    disabled: AtomicBool,
}

impl fmt::Debug for FusedKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FusedKernel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("entry_point", &self.unit.entry_point())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("disabled", &self.is_disabled())
            .finish()
    }
}

impl FusedKernel {
    pub fn new(
        id: SubgraphId,
        name: impl Into<String>,
        unit: Arc<dyn CompiledUnit>,
        inputs: Vec<InputSignature>,
        outputs: Vec<String>,
        options: CodegenOptions,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            serial: NEXT_KERNEL_SERIAL.fetch_add(1, Ordering::Relaxed),
            unit,
            inputs,
            outputs,
            options,
            disabled: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SubgraphId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry_point(&self) -> &str {
        self.unit.entry_point()
    }

    pub fn inputs(&self) -> &[InputSignature] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Bind the compiled unit for one set of realized input shapes.
    ///
    /// A failure disables the kernel for the rest of its lifetime.
    pub fn create_state(&self, ctx: &CallContext) -> Result<KernelState> {
        if self.is_disabled() {
            return Err(self.disabled_error());
        }

        let bindings = match self.bind_shapes(ctx) {
            Ok(bindings) => bindings,
            Err(reason) => {
                self.disabled.store(true, Ordering::Release);
                tracing::error!(subgraph = %self.name, %reason, "kernel state creation failed; subgraph disabled");
                return Err(CompilerError::StateCreation {
                    subgraph: self.name.clone(),
                    reason,
                });
            }
        };

        let workspace = vec![0u8; self.unit.workspace_bytes()];
        tracing::debug!(
            subgraph = %self.name,
            workspace_bytes = workspace.len(),
            bindings = bindings.len(),
            "kernel state created"
        );

        Ok(KernelState {
            phase: StatePhase::Ready,
            owner: self.serial,
            subgraph: self.name.clone(),
            workspace,
            bindings,
            input_shapes: ctx.input_shapes.clone(),
            unit: Some(Arc::clone(&self.unit)),
        })
    }

    /// Invoke the compiled unit once.
    ///
    /// Unit failures are returned as `InvocationFailure` carrying the unit's
    /// status unchanged.
    pub fn compute(
        &self,
        state: &mut KernelState,
        inputs: &[TensorView<'_>],
        outputs: &mut [TensorViewMut<'_>],
    ) -> Result<()> {
        if self.is_disabled() {
            return Err(self.disabled_error());
        }
        if state.phase != StatePhase::Ready {
            return Err(self.lifecycle(format!("compute called on a {} state", state.phase)));
        }
        self.check_owner(state)?;

        if inputs.len() != self.inputs.len() {
            return Err(self.invalid(format!("expected {} inputs, got {}", self.inputs.len(), inputs.len())));
        }
        if outputs.len() != self.outputs.len() {
            return Err(self.invalid(format!("expected {} outputs, got {}", self.outputs.len(), outputs.len())));
        }

        for (view, sig) in inputs.iter().zip(&self.inputs) {
            if let Some(expected) = sig.elem_type {
                if view.elem_type != expected {
                    return Err(self.invalid(format!(
                        "input '{}' has element type {}, expected {}",
                        sig.name, view.elem_type, expected
                    )));
                }
            }
        }

        for ((view, sig), bound) in inputs.iter().zip(&self.inputs).zip(&state.input_shapes) {
            if view.shape != bound.as_slice() {
                return Err(self.invalid(format!(
                    "input '{}' has shape {:?}, state was created for {:?}",
                    sig.name, view.shape, bound
                )));
            }
            check_extent(&sig.name, view.shape, view.data.len(), view.elem_type).map_err(|r| self.invalid(r))?;
        }
        for (view, name) in outputs.iter().zip(&self.outputs) {
            check_extent(name, view.shape, view.data.len(), view.elem_type).map_err(|r| self.invalid(r))?;
        }

        if !self.options.allow_unaligned_buffers {
            if let Some(sig) = inputs.iter().zip(&self.inputs).find(|(v, _)| !v.is_aligned()).map(|(_, s)| s) {
                return Err(self.invalid(format!("input '{}' is not element-aligned", sig.name)));
            }
            if let Some(name) = outputs.iter().zip(&self.outputs).find(|(v, _)| !v.is_aligned()).map(|(_, n)| n) {
                return Err(self.invalid(format!("output '{}' is not element-aligned", name)));
            }
        }

        let unit = match &state.unit {
            Some(unit) => Arc::clone(unit),
            None => return Err(self.lifecycle("state holds no compiled unit")),
        };
        unit.invoke(&mut state.workspace, inputs, outputs)
            .map_err(|source| CompilerError::InvocationFailure {
                subgraph: self.name.clone(),
                source,
            })
    }

    /// Release a state. Releasing twice is a no-op.
    pub fn release_state(&self, state: &mut KernelState) -> Result<()> {
        if state.phase == StatePhase::Released {
            return Ok(());
        }
        if state.phase == StatePhase::Ready {
            self.check_owner(state)?;
        }
        state.phase = StatePhase::Released;
        state.workspace = Vec::new();
        state.input_shapes = Vec::new();
        state.unit = None;
        Ok(())
    }

    fn bind_shapes(&self, ctx: &CallContext) -> std::result::Result<BTreeMap<String, i64>, String> {
        if ctx.input_shapes.len() != self.inputs.len() {
            return Err(format!(
                "expected {} input shapes, got {}",
                self.inputs.len(),
                ctx.input_shapes.len()
            ));
        }

        let mut bindings = BTreeMap::new();
        for (realized, sig) in ctx.input_shapes.iter().zip(&self.inputs) {
            if let Some(&extent) = realized.iter().find(|&&e| e < 0) {
                return Err(format!("input '{}' has negative extent {}", sig.name, extent));
            }
            let Some(shape) = &sig.shape else {
                continue;
            };
            if shape.rank() != realized.len() {
                return Err(format!(
                    "input '{}' has rank {}, expected {} ({})",
                    sig.name,
                    realized.len(),
                    shape.rank(),
                    shape
                ));
            }
            for (axis, (dim, &extent)) in shape.dims().iter().zip(realized).enumerate() {
                match dim {
                    Dim::Value(expected) if *expected > 0 && *expected != extent => {
                        return Err(format!(
                            "input '{}' axis {} has extent {}, expected {}",
                            sig.name, axis, extent, expected
                        ));
                    }
                    Dim::Param(param) if !param.is_empty() => match bindings.get(param) {
                        Some(&bound) if bound != extent => {
                            return Err(format!(
                                "dimension '{}' bound to {} but input '{}' axis {} is {}",
                                param, bound, sig.name, axis, extent
                            ));
                        }
                        Some(_) => {}
                        None => {
                            bindings.insert(param.clone(), extent);
                        }
                    },
                    _ => {}
                }
            }
        }
        Ok(bindings)
    }

    fn check_owner(&self, state: &KernelState) -> Result<()> {
        if state.owner != self.serial {
            return Err(self.lifecycle(format!("state belongs to another kernel ('{}')", state.subgraph)));
        }
        Ok(())
    }

    fn disabled_error(&self) -> CompilerError {
        CompilerError::KernelDisabled {
            subgraph: self.name.clone(),
        }
    }

    fn lifecycle(&self, reason: impl Into<String>) -> CompilerError {
        CompilerError::Lifecycle {
            subgraph: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> CompilerError {
        CompilerError::InvalidInvocation {
            subgraph: self.name.clone(),
            reason: reason.into(),
        }
    }
}

/// A buffer must hold at least the elements its shape describes
fn check_extent(name: &str, shape: &[i64], bytes: usize, elem_type: ElementType) -> std::result::Result<(), String> {
    let elements = shape
        .iter()
        .try_fold(1usize, |acc, &e| usize::try_from(e).ok().and_then(|e| acc.checked_mul(e)))
        .ok_or_else(|| format!("'{}' has an invalid shape {:?}", name, shape))?;
    let needed = elements.saturating_mul(elem_type.byte_size());
    if bytes < needed {
        return Err(format!(
            "'{}' holds {} bytes but shape {:?} needs {}",
            name, bytes, shape, needed
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::UnitFailure;

    struct Doubler;

    impl CompiledUnit for Doubler {
        fn entry_point(&self) -> &str {
            "doubler"
        }

        fn workspace_bytes(&self) -> usize {
            16
        }

        fn invoke(
            &self,
            workspace: &mut [u8],
            inputs: &[TensorView<'_>],
            outputs: &mut [TensorViewMut<'_>],
        ) -> std::result::Result<(), UnitFailure> {
            if workspace.len() != 16 {
                return Err(UnitFailure::new(-2, "workspace not provided"));
            }
            let src: &[f32] = bytemuck::cast_slice(inputs[0].data);
            let dst: &mut [f32] = bytemuck::cast_slice_mut(outputs[0].data);
            for (d, s) in dst.iter_mut().zip(src) {
                *d = s * 2.0;
            }
            Ok(())
        }
    }

    struct Failing;

    impl CompiledUnit for Failing {
        fn entry_point(&self) -> &str {
            "failing"
        }

        fn invoke(
            &self,
            _workspace: &mut [u8],
            _inputs: &[TensorView<'_>],
            _outputs: &mut [TensorViewMut<'_>],
        ) -> std::result::Result<(), UnitFailure> {
            Err(UnitFailure::new(7, "device lost"))
        }
    }

    fn kernel(unit: Arc<dyn CompiledUnit>) -> FusedKernel {
        let shape = TensorShape::new(vec![Dim::Param("batch".into()), Dim::Value(4)]);
        FusedKernel::new(
            SubgraphId(0),
            "vecfuse_subgraph_0",
            unit,
            vec![
                InputSignature {
                    name: "x".into(),
                    elem_type: Some(ElementType::Float),
                    shape: Some(shape.clone()),
                },
                InputSignature {
                    name: "y".into(),
                    elem_type: Some(ElementType::Float),
                    shape: Some(shape),
                },
            ],
            vec!["z".into()],
            CodegenOptions::default(),
        )
    }

    #[test]
    fn test_create_binds_symbolic_dims() {
        let k = kernel(Arc::new(Doubler));
        let mut state = k.create_state(&CallContext::new(vec![vec![3, 4], vec![3, 4]])).unwrap();
        assert!(state.is_ready());
        assert_eq!(state.bindings().get("batch"), Some(&3));
        assert_eq!(state.workspace_len(), 16);
        k.release_state(&mut state).unwrap();
        assert_eq!(state.phase(), StatePhase::Released);
    }

    #[test]
    fn test_inconsistent_binding_disables_kernel() {
        let k = kernel(Arc::new(Doubler));
        let err = k.create_state(&CallContext::new(vec![vec![3, 4], vec![5, 4]])).unwrap_err();
        assert!(matches!(err, CompilerError::StateCreation { .. }));
        assert!(k.is_disabled());

        let err = k.create_state(&CallContext::new(vec![vec![3, 4], vec![3, 4]])).unwrap_err();
        assert!(matches!(err, CompilerError::KernelDisabled { ref subgraph } if subgraph == "vecfuse_subgraph_0"));
    }

    #[test]
    fn test_static_extent_mismatch() {
        let k = kernel(Arc::new(Doubler));
        let err = k.create_state(&CallContext::new(vec![vec![3, 5], vec![3, 5]])).unwrap_err();
        assert!(err.to_string().contains("axis 1 has extent 5, expected 4"));
    }

    #[test]
    fn test_compute_runs_unit() {
        let k = kernel(Arc::new(Doubler));
        let mut state = k.create_state(&CallContext::new(vec![vec![1, 4], vec![1, 4]])).unwrap();
        let x = [1.0f32, 2.0, 3.0, 4.0];
        let y = [0.0f32; 4];
        let mut z = [0.0f32; 4];
        let shape = [1i64, 4];
        let inputs = [TensorView::from_f32(&shape, &x), TensorView::from_f32(&shape, &y)];
        let mut outputs = [TensorViewMut::from_f32(&shape, &mut z)];
        k.compute(&mut state, &inputs, &mut outputs).unwrap();
        k.release_state(&mut state).unwrap();
        assert_eq!(z, [2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_unit_failure_is_passed_through() {
        let k = kernel(Arc::new(Failing));
        let mut state = k.create_state(&CallContext::new(vec![vec![1, 4], vec![1, 4]])).unwrap();
        let x = [0.0f32; 4];
        let mut z = [0.0f32; 4];
        let shape = [1i64, 4];
        let inputs = [TensorView::from_f32(&shape, &x), TensorView::from_f32(&shape, &x)];
        let mut outputs = [TensorViewMut::from_f32(&shape, &mut z)];
        let err = k.compute(&mut state, &inputs, &mut outputs).unwrap_err();
        k.release_state(&mut state).unwrap();
        match err {
            CompilerError::InvocationFailure { source, .. } => assert_eq!(source, UnitFailure::new(7, "device lost")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_compute_after_release_is_lifecycle_error() {
        let k = kernel(Arc::new(Doubler));
        let mut state = k.create_state(&CallContext::new(vec![vec![1, 4], vec![1, 4]])).unwrap();
        k.release_state(&mut state).unwrap();
        k.release_state(&mut state).unwrap();

        let x = [0.0f32; 4];
        let mut z = [0.0f32; 4];
        let shape = [1i64, 4];
        let inputs = [TensorView::from_f32(&shape, &x), TensorView::from_f32(&shape, &x)];
        let mut outputs = [TensorViewMut::from_f32(&shape, &mut z)];
        let err = k.compute(&mut state, &inputs, &mut outputs).unwrap_err();
        assert!(matches!(err, CompilerError::Lifecycle { .. }));
    }

    #[test]
    fn test_state_from_other_kernel_rejected() {
        let a = kernel(Arc::new(Doubler));
        let b = kernel(Arc::new(Doubler));
        let mut state = a.create_state(&CallContext::new(vec![vec![1, 4], vec![1, 4]])).unwrap();
        let x = [0.0f32; 4];
        let mut z = [0.0f32; 4];
        let shape = [1i64, 4];
        let inputs = [TensorView::from_f32(&shape, &x), TensorView::from_f32(&shape, &x)];
        let mut outputs = [TensorViewMut::from_f32(&shape, &mut z)];
        let err = b.compute(&mut state, &inputs, &mut outputs).unwrap_err();
        assert!(matches!(err, CompilerError::Lifecycle { .. }));
        a.release_state(&mut state).unwrap();
    }

    #[test]
    fn test_operand_count_mismatch() {
        let k = kernel(Arc::new(Doubler));
        let mut state = k.create_state(&CallContext::new(vec![vec![1, 4], vec![1, 4]])).unwrap();
        let x = [0.0f32; 4];
        let shape = [1i64, 4];
        let inputs = [TensorView::from_f32(&shape, &x)];
        let err = k.compute(&mut state, &inputs, &mut []).unwrap_err();
        k.release_state(&mut state).unwrap();
        assert!(matches!(err, CompilerError::InvalidInvocation { .. }));
    }

    #[test]
    fn test_unaligned_output_rejected() {
        let k = kernel(Arc::new(Doubler));
        let mut state = k.create_state(&CallContext::new(vec![vec![1, 4], vec![1, 4]])).unwrap();
        let x = [0.0f32; 4];
        let shape = [1i64, 4];
        let mut backing = [0.0f32; 5];
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut backing);
        let inputs = [TensorView::from_f32(&shape, &x), TensorView::from_f32(&shape, &x)];
        let mut outputs = [TensorViewMut::new(ElementType::Float, &shape, &mut bytes[1..17])];
        let err = k.compute(&mut state, &inputs, &mut outputs).unwrap_err();
        k.release_state(&mut state).unwrap();
        assert!(err.to_string().contains("not element-aligned"));
    }

    #[test]
    fn test_default_state_is_uninitialized() {
        let k = kernel(Arc::new(Doubler));
        let mut state = KernelState::default();
        assert_eq!(state.phase(), StatePhase::Uninitialized);
        let err = k.compute(&mut state, &[], &mut []).unwrap_err();
        match err {
            CompilerError::Lifecycle { reason, .. } => {
                assert_eq!(reason, "compute called on a uninitialized state");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_input_shape_must_match_binding() {
        let k = kernel(Arc::new(Doubler));
        let mut state = k.create_state(&CallContext::new(vec![vec![2, 4], vec![2, 4]])).unwrap();
        let x = [0.0f32; 4];
        let mut z = [0.0f32; 8];
        let shape = [1i64, 4];
        let out_shape = [2i64, 4];
        let inputs = [TensorView::from_f32(&shape, &x), TensorView::from_f32(&shape, &x)];
        let mut outputs = [TensorViewMut::from_f32(&out_shape, &mut z)];
        let err = k.compute(&mut state, &inputs, &mut outputs).unwrap_err();
        k.release_state(&mut state).unwrap();
        assert!(matches!(err, CompilerError::InvalidInvocation { .. }));
        assert!(err.to_string().contains("state was created for [2, 4]"), "{err}");
    }

    #[test]
    fn test_short_buffers_rejected() {
        let k = kernel(Arc::new(Doubler));
        let mut state = k.create_state(&CallContext::new(vec![vec![2, 4], vec![2, 4]])).unwrap();
        let full = [0.0f32; 8];
        let short = [0.0f32; 4];
        let shape = [2i64, 4];

        let mut z = [0.0f32; 8];
        let inputs = [TensorView::from_f32(&shape, &full), TensorView::from_f32(&shape, &short)];
        let err = k
            .compute(&mut state, &inputs, &mut [TensorViewMut::from_f32(&shape, &mut z)])
            .unwrap_err();
        assert!(err.to_string().contains("'y' holds 16 bytes but shape [2, 4] needs 32"), "{err}");

        let mut small = [0.0f32; 4];
        let inputs = [TensorView::from_f32(&shape, &full), TensorView::from_f32(&shape, &full)];
        let err = k
            .compute(&mut state, &inputs, &mut [TensorViewMut::from_f32(&shape, &mut small)])
            .unwrap_err();
        k.release_state(&mut state).unwrap();
        assert!(err.to_string().contains("'z' holds 16 bytes"), "{err}");
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "dropped while ready")]
    fn test_dropping_ready_state_asserts() {
        let k = kernel(Arc::new(Doubler));
        let _state = k.create_state(&CallContext::new(vec![vec![1, 4], vec![1, 4]])).unwrap();
    }
}

//! Host-facing runtime: tensor views and the fused-kernel lifecycle

pub mod kernel;
pub mod tensor;

pub use kernel::{CallContext, FusedKernel, InputSignature, KernelState, StatePhase};
pub use tensor::{TensorView, TensorViewMut};

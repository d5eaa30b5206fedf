// Code generation inputs: target selection, vectorization planning and the
// generator/compiled-unit boundary.

pub mod generator;
pub mod target;
pub mod vectorize;

pub use generator::{
    CodeGenerator, CodegenError, CodegenOptions, CodegenRequest, CompiledUnit, SubgraphId, UnitFailure,
};
pub use target::{CpuFeatures, FeatureLevel, TargetDescriptor, TargetProfile, TargetSelector};
pub use vectorize::{DimStep, ReducePattern, ReducePlan, VectorizationPlan, VectorizationPlanner};

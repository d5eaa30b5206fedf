// Capability partitioning: which nodes the provider claims and how they are
// grouped into fused subgraphs.

pub mod eligibility;
pub mod partitioner;

pub use eligibility::{EligibilityPredicate, EligibilityRule, KernelRegistry, StaticKernelRegistry, Unsupported};
pub use partitioner::{GraphPartitioner, SubgraphDescriptor};

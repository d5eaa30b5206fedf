//! Hardware target selection
//!
//! One [`TargetDescriptor`] is resolved per provider instance and never
//! changes afterwards. The `llvm` profile probes the host CPU; the others are
//! taken at face value.

use crate::error::{CompilerError, Result};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

#[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
use std::arch::is_x86_feature_detected;
#[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
use std::sync::OnceLock;

// Cache SIMD capability detection
#[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
static HOST_FEATURES: OnceLock<CpuFeatures> = OnceLock::new();

/// Target profiles accepted in provider options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetProfile {
    /// Portable interpreter baseline, no SIMD assumptions
    StackVm,
    /// Native code generation for the host, features probed at startup
    Llvm,
    Avx2,
    Avx512,
}

impl TargetProfile {
    pub const DEFAULT: TargetProfile = TargetProfile::Llvm;

    pub fn as_str(self) -> &'static str {
        match self {
            TargetProfile::StackVm => "stackvm",
            TargetProfile::Llvm => "llvm",
            TargetProfile::Avx2 => "avx2",
            TargetProfile::Avx512 => "avx512",
        }
    }
}

impl FromStr for TargetProfile {
    type Err = CompilerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stackvm" => Ok(TargetProfile::StackVm),
            "llvm" => Ok(TargetProfile::Llvm),
            "avx2" => Ok(TargetProfile::Avx2),
            "avx512" => Ok(TargetProfile::Avx512),
            _ => Err(CompilerError::Configuration { profile: s.to_string() }),
        }
    }
}

impl fmt::Display for TargetProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instruction-set tier of a resolved target
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureLevel {
    Portable,
    Baseline,
    Avx2,
    Avx512,
}

/// Host CPU capabilities relevant to target selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuFeatures {
    pub avx512f: bool,
    pub avx2: bool,
    /// Whether a native code-generation path exists for this architecture
    pub native_codegen: bool,
}

impl CpuFeatures {
    /// Probe the running CPU (cached after the first call)
    pub fn detect() -> Self {
        #[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
        {
            *HOST_FEATURES.get_or_init(|| CpuFeatures {
                avx512f: is_x86_feature_detected!("avx512f"),
                avx2: is_x86_feature_detected!("avx2"),
                native_codegen: true,
            })
        }

        #[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
        {
            CpuFeatures::default()
        }
    }
}

/// Immutable description of the code-generation target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetDescriptor {
    profile: TargetProfile,
    vector_bits: u32,
    feature_level: FeatureLevel,
}

impl Serialize for TargetProfile {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl TargetDescriptor {
    pub fn stackvm() -> Self {
        Self {
            profile: TargetProfile::StackVm,
            vector_bits: 0,
            feature_level: FeatureLevel::Portable,
        }
    }

    /// Generic native target with 128-bit vectors
    pub fn generic_native() -> Self {
        Self {
            profile: TargetProfile::Llvm,
            vector_bits: 128,
            feature_level: FeatureLevel::Baseline,
        }
    }

    pub fn avx2() -> Self {
        Self {
            profile: TargetProfile::Avx2,
            vector_bits: 256,
            feature_level: FeatureLevel::Avx2,
        }
    }

    pub fn avx512() -> Self {
        Self {
            profile: TargetProfile::Avx512,
            vector_bits: 512,
            feature_level: FeatureLevel::Avx512,
        }
    }

    pub fn profile(&self) -> TargetProfile {
        self.profile
    }

    pub fn name(&self) -> &'static str {
        self.profile.as_str()
    }

    pub fn vector_bits(&self) -> u32 {
        self.vector_bits
    }

    pub fn feature_level(&self) -> FeatureLevel {
        self.feature_level
    }

    /// SIMD lanes per instruction for elements of `element_bits` bits, at least 1
    pub fn natural_vector_width(&self, element_bits: u32) -> u32 {
        if element_bits == 0 {
            return 1;
        }
        (self.vector_bits / element_bits).max(1)
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}-bit vectors)", self.profile, self.vector_bits)
    }
}

/// Resolves the target for a provider from its options and the host CPU
#[derive(Debug, Clone, Copy)]
pub struct TargetSelector {
    features: CpuFeatures,
}

impl TargetSelector {
    /// Selector for the running host
    pub fn host() -> Self {
        Self {
            features: CpuFeatures::detect(),
        }
    }

    /// Selector with injected CPU features
    pub fn with_features(features: CpuFeatures) -> Self {
        Self { features }
    }

    pub fn features(&self) -> CpuFeatures {
        self.features
    }

    /// Resolve `requested` (absent or blank means `llvm`).
    ///
    /// Unrecognized profile strings are a configuration error.
    pub fn select(&self, requested: Option<&str>) -> Result<TargetDescriptor> {
        let profile = match requested.map(str::trim).filter(|s| !s.is_empty()) {
            Some(name) => name.parse::<TargetProfile>()?,
            None => TargetProfile::DEFAULT,
        };

        let target = match profile {
            TargetProfile::StackVm => TargetDescriptor::stackvm(),
            TargetProfile::Avx2 => {
                if !self.features.avx2 {
                    tracing::warn!("avx2 target requested but the host does not report AVX2");
                }
                TargetDescriptor::avx2()
            }
            TargetProfile::Avx512 => {
                if !self.features.avx512f {
                    tracing::warn!("avx512 target requested but the host does not report AVX-512F");
                }
                TargetDescriptor::avx512()
            }
            TargetProfile::Llvm => self.probe(),
        };

        tracing::info!(
            requested = requested.unwrap_or(""),
            target = target.name(),
            vector_bits = target.vector_bits(),
            "Auto-selected code-generation target"
        );
        Ok(target)
    }

    fn probe(&self) -> TargetDescriptor {
        if self.features.avx512f {
            TargetDescriptor::avx512()
        } else if self.features.avx2 {
            TargetDescriptor::avx2()
        } else if self.features.native_codegen {
            TargetDescriptor::generic_native()
        } else {
            TargetDescriptor::stackvm()
        }
    }
}

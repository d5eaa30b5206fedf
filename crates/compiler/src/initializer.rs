//! Constant initializer lifting
//!
//! Compiled subgraphs never read initializer bytes out of the model: every
//! constant a claimed node touches is unpacked once into an owned, natively
//! typed buffer and kept in the provider-lifetime [`InitializerStore`].
//! Generated code shares those buffers through `Arc`.

use crate::error::{CompilerError, Result};
use crate::graph::{ComputeGraph, ElementType};
use crate::partition::SubgraphDescriptor;
use crate::proto::tensor_proto::DataLocation;
use crate::proto::TensorProto;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Natively typed element buffer
#[derive(Debug, Clone)]
pub enum TensorData {
    Float(Vec<f32>),
    Double(Vec<f64>),
    /// IEEE half bit patterns
    Float16(Vec<u16>),
    /// bfloat16 bit patterns
    Bfloat16(Vec<u16>),
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Uint8(Vec<u8>),
    Uint16(Vec<u16>),
    Uint32(Vec<u32>),
    Uint64(Vec<u64>),
    /// One byte per element, 0 or 1
    Bool(Vec<u8>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::Float(v) => v.len(),
            TensorData::Double(v) => v.len(),
            TensorData::Float16(v) | TensorData::Bfloat16(v) | TensorData::Uint16(v) => v.len(),
            TensorData::Int8(v) => v.len(),
            TensorData::Int16(v) => v.len(),
            TensorData::Int32(v) => v.len(),
            TensorData::Int64(v) => v.len(),
            TensorData::Uint8(v) | TensorData::Bool(v) => v.len(),
            TensorData::Uint32(v) => v.len(),
            TensorData::Uint64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Native-endian view of the buffer
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            TensorData::Float(v) => bytemuck::cast_slice(v),
            TensorData::Double(v) => bytemuck::cast_slice(v),
            TensorData::Float16(v) | TensorData::Bfloat16(v) | TensorData::Uint16(v) => bytemuck::cast_slice(v),
            TensorData::Int8(v) => bytemuck::cast_slice(v),
            TensorData::Int16(v) => bytemuck::cast_slice(v),
            TensorData::Int32(v) => bytemuck::cast_slice(v),
            TensorData::Int64(v) => bytemuck::cast_slice(v),
            TensorData::Uint8(v) | TensorData::Bool(v) => v,
            TensorData::Uint32(v) => bytemuck::cast_slice(v),
            TensorData::Uint64(v) => bytemuck::cast_slice(v),
        }
    }
}

/// Owned, unpacked copy of one constant initializer
#[derive(Debug, Clone)]
pub struct LiftedTensor {
    name: String,
    elem_type: ElementType,
    dims: Vec<i64>,
    data: TensorData,
}

macro_rules! decode_le {
    ($raw:expr, $ty:ty) => {{
        const SIZE: usize = std::mem::size_of::<$ty>();
        $raw.chunks_exact(SIZE)
            .map(|chunk| {
                let mut bytes = [0u8; SIZE];
                bytes.copy_from_slice(chunk);
                <$ty>::from_le_bytes(bytes)
            })
            .collect::<Vec<$ty>>()
    }};
}

impl LiftedTensor {
    /// Unpack an ONNX tensor into native storage.
    ///
    /// `raw_data` is little-endian on the wire; the typed repeated fields
    /// follow the ONNX packing rules (8/16-bit integers, bool and half
    /// precision bit patterns travel in `int32_data`, uint32/uint64 in
    /// `uint64_data`).
    pub fn from_proto(proto: &TensorProto) -> Result<Self> {
        let name = proto.name.as_str();
        let elem_type = ElementType::from_onnx(proto.data_type)
            .ok_or_else(|| CompilerError::corruption(name, format!("unsupported data type {}", proto.data_type)))?;

        if proto.data_location == DataLocation::External as i32 && proto.raw_data.is_empty() {
            return Err(CompilerError::corruption(name, "external data was not loaded"));
        }

        let count = element_count(name, &proto.dims)?;
        let data = if !proto.raw_data.is_empty() {
            Self::unpack_raw(name, elem_type, &proto.raw_data, count)?
        } else {
            Self::unpack_typed(name, elem_type, proto, count)?
        };

        Ok(Self {
            name: name.to_string(),
            elem_type,
            dims: proto.dims.clone(),
            data,
        })
    }

    fn unpack_raw(name: &str, elem_type: ElementType, raw: &[u8], count: usize) -> Result<TensorData> {
        let expected = count
            .checked_mul(elem_type.byte_size())
            .ok_or_else(|| CompilerError::corruption(name, "byte size overflows"))?;
        if raw.len() != expected {
            return Err(CompilerError::corruption(
                name,
                format!(
                    "raw_data holds {} bytes but {} {} elements need {}",
                    raw.len(),
                    count,
                    elem_type,
                    expected
                ),
            ));
        }

        Ok(match elem_type {
            ElementType::Float => TensorData::Float(decode_le!(raw, f32)),
            ElementType::Double => TensorData::Double(decode_le!(raw, f64)),
            ElementType::Float16 => TensorData::Float16(decode_le!(raw, u16)),
            ElementType::Bfloat16 => TensorData::Bfloat16(decode_le!(raw, u16)),
            ElementType::Int8 => TensorData::Int8(decode_le!(raw, i8)),
            ElementType::Int16 => TensorData::Int16(decode_le!(raw, i16)),
            ElementType::Int32 => TensorData::Int32(decode_le!(raw, i32)),
            ElementType::Int64 => TensorData::Int64(decode_le!(raw, i64)),
            ElementType::Uint8 => TensorData::Uint8(raw.to_vec()),
            ElementType::Uint16 => TensorData::Uint16(decode_le!(raw, u16)),
            ElementType::Uint32 => TensorData::Uint32(decode_le!(raw, u32)),
            ElementType::Uint64 => TensorData::Uint64(decode_le!(raw, u64)),
            ElementType::Bool => TensorData::Bool(raw.to_vec()),
        })
    }

    fn unpack_typed(name: &str, elem_type: ElementType, proto: &TensorProto, count: usize) -> Result<TensorData> {
        let check = |field: &str, len: usize| -> Result<()> {
            if len == count {
                Ok(())
            } else {
                Err(CompilerError::corruption(
                    name,
                    format!("{} holds {} values but dims imply {}", field, len, count),
                ))
            }
        };

        let data = match elem_type {
            ElementType::Float => {
                check("float_data", proto.float_data.len())?;
                TensorData::Float(proto.float_data.clone())
            }
            ElementType::Double => {
                check("double_data", proto.double_data.len())?;
                TensorData::Double(proto.double_data.clone())
            }
            ElementType::Int64 => {
                check("int64_data", proto.int64_data.len())?;
                TensorData::Int64(proto.int64_data.clone())
            }
            ElementType::Uint64 => {
                check("uint64_data", proto.uint64_data.len())?;
                TensorData::Uint64(proto.uint64_data.clone())
            }
            ElementType::Uint32 => {
                check("uint64_data", proto.uint64_data.len())?;
                TensorData::Uint32(proto.uint64_data.iter().map(|&v| v as u32).collect())
            }
            ElementType::Float16 | ElementType::Bfloat16 => {
                check("int32_data", proto.int32_data.len())?;
                let bits = proto
                    .int32_data
                    .iter()
                    .map(|&v| {
                        u16::try_from(v).map_err(|_| {
                            CompilerError::corruption(name, format!("half-precision value {} out of 0..=65535", v))
                        })
                    })
                    .collect::<Result<Vec<u16>>>()?;
                if elem_type == ElementType::Float16 {
                    TensorData::Float16(bits)
                } else {
                    TensorData::Bfloat16(bits)
                }
            }
            ElementType::Int32 => {
                check("int32_data", proto.int32_data.len())?;
                TensorData::Int32(proto.int32_data.clone())
            }
            ElementType::Int16 => {
                check("int32_data", proto.int32_data.len())?;
                TensorData::Int16(proto.int32_data.iter().map(|&v| v as i16).collect())
            }
            ElementType::Int8 => {
                check("int32_data", proto.int32_data.len())?;
                TensorData::Int8(proto.int32_data.iter().map(|&v| v as i8).collect())
            }
            ElementType::Uint16 => {
                check("int32_data", proto.int32_data.len())?;
                TensorData::Uint16(proto.int32_data.iter().map(|&v| v as u16).collect())
            }
            ElementType::Uint8 => {
                check("int32_data", proto.int32_data.len())?;
                TensorData::Uint8(proto.int32_data.iter().map(|&v| v as u8).collect())
            }
            ElementType::Bool => {
                check("int32_data", proto.int32_data.len())?;
                TensorData::Bool(proto.int32_data.iter().map(|&v| u8::from(v != 0)).collect())
            }
        };
        Ok(data)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn elem_type(&self) -> ElementType {
        self.elem_type
    }

    pub fn dims(&self) -> &[i64] {
        &self.dims
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }

    /// Integer contents widened to i64 (axes, repeats, slice bounds)
    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        match &self.data {
            TensorData::Int64(v) => Some(v.clone()),
            TensorData::Int32(v) => Some(v.iter().map(|&x| i64::from(x)).collect()),
            TensorData::Int16(v) => Some(v.iter().map(|&x| i64::from(x)).collect()),
            TensorData::Int8(v) => Some(v.iter().map(|&x| i64::from(x)).collect()),
            TensorData::Uint8(v) => Some(v.iter().map(|&x| i64::from(x)).collect()),
            TensorData::Uint16(v) => Some(v.iter().map(|&x| i64::from(x)).collect()),
            TensorData::Uint32(v) => Some(v.iter().map(|&x| i64::from(x)).collect()),
            _ => None,
        }
    }

    /// Bitwise content equality (NaN payloads compare equal to themselves)
    pub fn same_content(&self, other: &LiftedTensor) -> bool {
        self.elem_type == other.elem_type && self.dims == other.dims && self.as_bytes() == other.as_bytes()
    }
}

fn element_count(name: &str, dims: &[i64]) -> Result<usize> {
    dims.iter().try_fold(1usize, |acc, &d| {
        let d = usize::try_from(d).map_err(|_| CompilerError::corruption(name, format!("negative dimension {}", d)))?;
        acc.checked_mul(d)
            .ok_or_else(|| CompilerError::corruption(name, "element count overflows"))
    })
}

/// Result of lifting one name into the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiftOutcome {
    /// First time the name was seen; the tensor is now stored
    Lifted,
    /// The name was already stored with identical content
    AlreadyPresent,
    /// The name was already stored with different content; the first value is kept
    Conflict,
}

/// Provider-lifetime, append-only map of lifted constants
#[derive(Debug, Default)]
pub struct InitializerStore {
    tensors: FxHashMap<String, Arc<LiftedTensor>>,
}

impl InitializerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unpack and store `proto` under `name` unless the name is already present.
    ///
    /// Re-lifting an existing name never errors and never touches the stored
    /// bytes; differing content is reported as [`LiftOutcome::Conflict`].
    pub fn lift(&mut self, name: &str, proto: &TensorProto) -> Result<LiftOutcome> {
        if let Some(existing) = self.tensors.get(name) {
            let same = LiftedTensor::from_proto(proto)
                .map(|candidate| existing.same_content(&candidate))
                .unwrap_or(false);
            if same {
                return Ok(LiftOutcome::AlreadyPresent);
            }
            tracing::warn!(
                initializer = name,
                "constant re-lifted with different content; keeping the first value"
            );
            return Ok(LiftOutcome::Conflict);
        }

        let mut lifted = LiftedTensor::from_proto(proto)?;
        if lifted.name != name {
            lifted.name = name.to_string();
        }
        tracing::debug!(
            initializer = name,
            elem_type = %lifted.elem_type,
            elements = lifted.len(),
            "lifted constant initializer"
        );
        self.tensors.insert(name.to_string(), Arc::new(lifted));
        Ok(LiftOutcome::Lifted)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<LiftedTensor>> {
        self.tensors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Stored names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Lifted constants referenced by `subgraph`, in first-use order.
    ///
    /// Returns `InvalidModel` when a referenced constant was never lifted.
    pub fn referenced_by(
        &self,
        graph: &ComputeGraph,
        subgraph: &SubgraphDescriptor,
    ) -> Result<Vec<(String, Arc<LiftedTensor>)>> {
        let mut seen = rustc_hash::FxHashSet::default();
        let mut out = Vec::new();
        for name in constant_defs(graph, subgraph) {
            if !seen.insert(name) {
                continue;
            }
            let tensor = self.tensors.get(name).ok_or_else(|| {
                CompilerError::InvalidModel(format!("constant '{}' was not lifted before compilation", name))
            })?;
            out.push((name.to_string(), Arc::clone(tensor)));
        }
        Ok(out)
    }
}

fn constant_defs<'g>(graph: &'g ComputeGraph, subgraph: &'g SubgraphDescriptor) -> impl Iterator<Item = &'g str> {
    subgraph
        .nodes()
        .iter()
        .filter_map(move |&id| graph.node(id))
        .flat_map(|node| node.defs())
        .filter(move |name| graph.is_constant_initializer(name))
}

/// Counts from one lifting pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiftSummary {
    pub lifted: usize,
    pub already_present: usize,
    pub conflicts: usize,
}

/// Lifts the constants referenced by claimed subgraphs into a store
pub struct ConstantLifter;

impl ConstantLifter {
    /// Walk every node of every subgraph and lift each constant initializer it
    /// reads or writes.
    pub fn lift_referenced(
        graph: &ComputeGraph,
        subgraphs: &[SubgraphDescriptor],
        store: &mut InitializerStore,
    ) -> Result<LiftSummary> {
        let mut summary = LiftSummary::default();
        for subgraph in subgraphs {
            for name in constant_defs(graph, subgraph) {
                let Some(proto) = graph.initializer(name) else {
                    continue;
                };
                match store.lift(name, proto)? {
                    LiftOutcome::Lifted => summary.lifted += 1,
                    LiftOutcome::AlreadyPresent => summary.already_present += 1,
                    LiftOutcome::Conflict => summary.conflicts += 1,
                }
            }
        }
        Ok(summary)
    }
}

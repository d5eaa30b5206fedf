//! Tensor shape and element type vocabulary shared by every pipeline stage

use crate::proto::tensor_proto::DataType;
use crate::proto::tensor_shape_proto::dimension::Value as DimProtoValue;
use crate::proto::type_proto::Value as TypeProtoValue;
use crate::proto::{TensorShapeProto, TypeProto};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One dimension of a tensor shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dim {
    /// Concrete extent. Zero or negative extents are stored as-is and
    /// count as unresolved.
    Value(i64),
    /// Named symbolic extent, e.g. `batch`.
    Param(String),
    /// Neither an extent nor a name was recorded.
    Unknown,
}

impl Dim {
    /// A dimension is resolved when it is a positive extent or a named parameter.
    pub fn is_resolved(&self) -> bool {
        match self {
            Dim::Value(v) => *v > 0,
            Dim::Param(name) => !name.is_empty(),
            Dim::Unknown => false,
        }
    }

    /// Positive static extent, if any.
    pub fn static_extent(&self) -> Option<i64> {
        match self {
            Dim::Value(v) if *v > 0 => Some(*v),
            _ => None,
        }
    }

    fn from_proto(dim: &crate::proto::tensor_shape_proto::Dimension) -> Self {
        match &dim.value {
            Some(DimProtoValue::DimValue(v)) => Dim::Value(*v),
            Some(DimProtoValue::DimParam(p)) if !p.is_empty() => Dim::Param(p.clone()),
            _ => Dim::Unknown,
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Value(v) => write!(f, "{}", v),
            Dim::Param(p) => write!(f, "{}", p),
            Dim::Unknown => write!(f, "?"),
        }
    }
}

/// Ordered dimensions of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TensorShape {
    dims: Vec<Dim>,
}

impl TensorShape {
    pub fn new(dims: Vec<Dim>) -> Self {
        Self { dims }
    }

    /// Fully static shape from concrete extents.
    pub fn from_static(extents: &[i64]) -> Self {
        Self {
            dims: extents.iter().map(|&e| Dim::Value(e)).collect(),
        }
    }

    pub fn from_proto(shape: &TensorShapeProto) -> Self {
        Self {
            dims: shape.dim.iter().map(Dim::from_proto).collect(),
        }
    }

    pub fn dims(&self) -> &[Dim] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn is_fully_resolved(&self) -> bool {
        self.dims.iter().all(Dim::is_resolved)
    }

    /// Static extent of dimension `axis`, `None` when symbolic, unknown or out of range.
    pub fn static_extent(&self, axis: usize) -> Option<i64> {
        self.dims.get(axis).and_then(Dim::static_extent)
    }

    /// All extents when every dimension is static.
    pub fn as_static(&self) -> Option<Vec<i64>> {
        self.dims.iter().map(Dim::static_extent).collect()
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

/// Element types the pipeline can lift and vectorize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Float,
    Double,
    Float16,
    Bfloat16,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Bool,
}

impl ElementType {
    /// Map an ONNX `TensorProto.data_type` code. Strings, complex and
    /// undefined types have no counterpart.
    pub fn from_onnx(code: i32) -> Option<Self> {
        let dtype = DataType::try_from(code).ok()?;
        Some(match dtype {
            DataType::Float => ElementType::Float,
            DataType::Double => ElementType::Double,
            DataType::Float16 => ElementType::Float16,
            DataType::Bfloat16 => ElementType::Bfloat16,
            DataType::Int8 => ElementType::Int8,
            DataType::Int16 => ElementType::Int16,
            DataType::Int32 => ElementType::Int32,
            DataType::Int64 => ElementType::Int64,
            DataType::Uint8 => ElementType::Uint8,
            DataType::Uint16 => ElementType::Uint16,
            DataType::Uint32 => ElementType::Uint32,
            DataType::Uint64 => ElementType::Uint64,
            DataType::Bool => ElementType::Bool,
            DataType::Undefined | DataType::String | DataType::Complex64 | DataType::Complex128 => {
                return None
            }
        })
    }

    pub fn to_onnx(self) -> i32 {
        let dtype = match self {
            ElementType::Float => DataType::Float,
            ElementType::Double => DataType::Double,
            ElementType::Float16 => DataType::Float16,
            ElementType::Bfloat16 => DataType::Bfloat16,
            ElementType::Int8 => DataType::Int8,
            ElementType::Int16 => DataType::Int16,
            ElementType::Int32 => DataType::Int32,
            ElementType::Int64 => DataType::Int64,
            ElementType::Uint8 => DataType::Uint8,
            ElementType::Uint16 => DataType::Uint16,
            ElementType::Uint32 => DataType::Uint32,
            ElementType::Uint64 => DataType::Uint64,
            ElementType::Bool => DataType::Bool,
        };
        dtype as i32
    }

    /// Storage size of one element in bytes.
    pub fn byte_size(self) -> usize {
        match self {
            ElementType::Int8 | ElementType::Uint8 | ElementType::Bool => 1,
            ElementType::Float16 | ElementType::Bfloat16 | ElementType::Int16 | ElementType::Uint16 => 2,
            ElementType::Float | ElementType::Int32 | ElementType::Uint32 => 4,
            ElementType::Double | ElementType::Int64 | ElementType::Uint64 => 8,
        }
    }

    /// Width in bits, used to derive the natural SIMD lane count.
    pub fn bit_width(self) -> u32 {
        (self.byte_size() * 8) as u32
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::Float => "float32",
            ElementType::Double => "float64",
            ElementType::Float16 => "float16",
            ElementType::Bfloat16 => "bfloat16",
            ElementType::Int8 => "int8",
            ElementType::Int16 => "int16",
            ElementType::Int32 => "int32",
            ElementType::Int64 => "int64",
            ElementType::Uint8 => "uint8",
            ElementType::Uint16 => "uint16",
            ElementType::Uint32 => "uint32",
            ElementType::Uint64 => "uint64",
            ElementType::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// Element type plus (possibly absent) shape of one tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorType {
    pub elem_type: Option<ElementType>,
    pub shape: Option<TensorShape>,
}

impl TensorType {
    pub fn new(elem_type: Option<ElementType>, shape: TensorShape) -> Self {
        Self {
            elem_type,
            shape: Some(shape),
        }
    }

    /// Read a tensor type annotation. Non-tensor types yield `None`.
    pub fn from_proto(ty: &TypeProto) -> Option<Self> {
        match &ty.value {
            Some(TypeProtoValue::TensorType(tensor)) => Some(Self {
                elem_type: ElementType::from_onnx(tensor.elem_type),
                shape: tensor.shape.as_ref().map(TensorShape::from_proto),
            }),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dim_resolution() {
        assert!(Dim::Value(4).is_resolved());
        assert!(Dim::Param("batch".into()).is_resolved());
        assert!(!Dim::Value(0).is_resolved());
        assert!(!Dim::Value(-1).is_resolved());
        assert!(!Dim::Unknown.is_resolved());
    }

    #[test]
    fn test_shape_static_extents() {
        let shape = TensorShape::new(vec![Dim::Value(8), Dim::Param("n".into()), Dim::Value(4)]);
        assert_eq!(shape.static_extent(0), Some(8));
        assert_eq!(shape.static_extent(1), None);
        assert_eq!(shape.static_extent(5), None);
        assert_eq!(shape.as_static(), None);
        assert!(shape.is_fully_resolved());
        assert_eq!(shape.to_string(), "[8, n, 4]");
    }

    #[test]
    fn test_element_type_widths() {
        assert_eq!(ElementType::Float.bit_width(), 32);
        assert_eq!(ElementType::Float16.bit_width(), 16);
        assert_eq!(ElementType::Int64.byte_size(), 8);
        assert_eq!(ElementType::from_onnx(1), Some(ElementType::Float));
        assert_eq!(ElementType::from_onnx(8), None);
        assert_eq!(ElementType::from_onnx(99), None);
        assert_eq!(ElementType::from_onnx(ElementType::Uint32.to_onnx()), Some(ElementType::Uint32));
    }
}

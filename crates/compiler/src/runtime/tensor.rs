//! Borrowed tensor buffers passed across the host boundary

use crate::graph::ElementType;

/// Read-only operand
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a> {
    pub elem_type: ElementType,
    pub shape: &'a [i64],
    pub data: &'a [u8],
}

impl<'a> TensorView<'a> {
    pub fn new(elem_type: ElementType, shape: &'a [i64], data: &'a [u8]) -> Self {
        Self { elem_type, shape, data }
    }

    /// View an `f32` slice
    pub fn from_f32(shape: &'a [i64], values: &'a [f32]) -> Self {
        Self::new(ElementType::Float, shape, bytemuck::cast_slice(values))
    }

    pub fn element_count(&self) -> usize {
        self.data.len() / self.elem_type.byte_size()
    }

    pub(crate) fn is_aligned(&self) -> bool {
        self.data.as_ptr() as usize % self.elem_type.byte_size() == 0
    }
}

/// Writable result buffer
#[derive(Debug)]
pub struct TensorViewMut<'a> {
    pub elem_type: ElementType,
    pub shape: &'a [i64],
    pub data: &'a mut [u8],
}

impl<'a> TensorViewMut<'a> {
    pub fn new(elem_type: ElementType, shape: &'a [i64], data: &'a mut [u8]) -> Self {
        Self { elem_type, shape, data }
    }

    /// View a mutable `f32` slice
    pub fn from_f32(shape: &'a [i64], values: &'a mut [f32]) -> Self {
        Self::new(ElementType::Float, shape, bytemuck::cast_slice_mut(values))
    }

    pub fn element_count(&self) -> usize {
        self.data.len() / self.elem_type.byte_size()
    }

    pub(crate) fn is_aligned(&self) -> bool {
        self.data.as_ptr() as usize % self.elem_type.byte_size() == 0
    }
}

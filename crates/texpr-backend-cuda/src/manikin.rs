//! Storage manikins: logical tensors with no bytes of their own.
//!
//! A manikin pairs a concrete layout (dims, strides and offset, all in
//! elements) with a storage binding, which is either an internal recipe
//! allocation or an external caller-owned variable. View operations
//! (reshape, swap, broadcast, slice) only rewrite the layout.

use serde::{Deserialize, Serialize};

use texpr::{TypeName, VarSpec};

/// One device memory allocation owned by the recipe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemAlloc {
    pub id: usize,
    pub bytes: u64,
    pub dtype: TypeName,
}

/// What backs a manikin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ManikinStorage {
    /// Internal allocation by id.
    Alloc(usize),
    /// External variable owned by the caller.
    External(VarSpec),
}

/// Logical tensor descriptor used as the planner's currency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Manikin {
    pub dims: Vec<u64>,
    pub strides: Vec<u64>,
    pub offset: u64,
    pub dtype: TypeName,
    pub storage: ManikinStorage,
}

impl Manikin {
    /// Row-major dense layout over the whole storage.
    pub fn contiguous(dims: Vec<u64>, dtype: TypeName, storage: ManikinStorage) -> Self {
        let strides = contiguous_strides(&dims);
        Self {
            dims,
            strides,
            offset: 0,
            dtype,
            storage,
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn num_elems(&self) -> u64 {
        self.dims.iter().product()
    }

    pub fn is_contiguous(&self) -> bool {
        self.offset == 0 && self.strides == contiguous_strides(&self.dims)
    }

    /// Reinterprets a contiguous layout under new dims with the same
    /// element count. Returns `None` for non-contiguous sources, which need
    /// a compacting copy first.
    pub fn reshaped(&self, dims: Vec<u64>) -> Option<Manikin> {
        if !self.is_contiguous() {
            return None;
        }
        Some(Manikin {
            strides: contiguous_strides(&dims),
            dims,
            offset: self.offset,
            dtype: self.dtype.clone(),
            storage: self.storage.clone(),
        })
    }

    pub fn swapped(&self, a: usize, b: usize) -> Manikin {
        let mut view = self.clone();
        view.dims.swap(a, b);
        view.strides.swap(a, b);
        view
    }

    /// Broadcast view: pads on the left, then gives stride zero to every
    /// axis extended from extent one.
    pub fn broadcast_to(&self, target: &[u64]) -> Manikin {
        let pad = target.len() - self.dims.len();
        let mut dims = Vec::with_capacity(target.len());
        let mut strides = Vec::with_capacity(target.len());
        for (axis, &extent) in target.iter().enumerate() {
            if axis < pad {
                dims.push(extent);
                strides.push(0);
            } else {
                let src_dim = self.dims[axis - pad];
                let src_stride = self.strides[axis - pad];
                dims.push(extent);
                strides.push(if src_dim == 1 && extent != 1 { 0 } else { src_stride });
            }
        }
        Manikin {
            dims,
            strides,
            offset: self.offset,
            dtype: self.dtype.clone(),
            storage: self.storage.clone(),
        }
    }

    /// Window view starting at `starts` (leading axes) with the given
    /// extents; axes beyond `starts` keep their full extent.
    pub fn sliced(&self, starts: &[u64], lens: &[u64]) -> Manikin {
        let mut view = self.clone();
        for (axis, &start) in starts.iter().enumerate() {
            view.offset += start * self.strides[axis];
        }
        for (axis, &len) in lens.iter().enumerate() {
            view.dims[axis] = len;
        }
        view
    }

}

pub fn contiguous_strides(dims: &[u64]) -> Vec<u64> {
    let mut strides = vec![1u64; dims.len()];
    for axis in (0..dims.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * dims[axis + 1];
    }
    strides
}

//! Growable storage for one cached tensor (key or value) of one layer.
//!
//! Storage is laid out `[batch, heads, capacity, head_dim]`. Slots
//! `[0, length)` of every `(batch, head)` plane hold written rows; slots
//! `[length, capacity)` are zero-filled and carry no meaning.
//!
//! Every operation that replaces storage builds the new region completely
//! before swapping it in, so a failed allocation leaves the buffer untouched.

use serde::Serialize;
use tracing::debug;

use crate::cache::allocator::BlockAllocator;
use crate::cache::element::CacheElement;
use crate::cache::error::{CacheError, CacheResult};

/// Per-token tensor geometry shared by every buffer in a cache.
///
/// Only built through [`KvShape::new`]: every dimension is non-zero and a
/// token's element count fits in `usize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct KvShape {
    batch: usize,
    heads: usize,
    head_dim: usize,
}

impl KvShape {
    pub fn new(batch: usize, heads: usize, head_dim: usize) -> CacheResult<Self> {
        if batch == 0 || heads == 0 || head_dim == 0 {
            return Err(CacheError::invalid(format!(
                "shape dimensions must be non-zero (batch={batch}, heads={heads}, head_dim={head_dim})"
            )));
        }
        if batch
            .checked_mul(heads)
            .and_then(|planes| planes.checked_mul(head_dim))
            .is_none()
        {
            return Err(CacheError::invalid(format!(
                "token size overflows (batch={batch}, heads={heads}, head_dim={head_dim})"
            )));
        }
        Ok(Self {
            batch,
            heads,
            head_dim,
        })
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn heads(&self) -> usize {
        self.heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Number of `(batch, head)` planes.
    pub fn planes(&self) -> usize {
        self.batch * self.heads
    }

    /// Elements occupied by a single token across all planes.
    pub fn token_elements(&self) -> usize {
        self.planes() * self.head_dim
    }

    /// Number of tokens in a caller-supplied `[batch, heads, n, head_dim]` slice.
    pub fn tokens_in(&self, elements: usize) -> CacheResult<usize> {
        let width = self.token_elements();
        if elements % width != 0 {
            return Err(CacheError::invalid(format!(
                "{elements} elements is not a whole number of tokens (token width {width})"
            )));
        }
        Ok(elements / width)
    }
}

/// Copy `count` rows per plane between two plane-strided regions.
#[allow(clippy::too_many_arguments)]
fn copy_rows<T: CacheElement>(
    shape: &KvShape,
    src: &[T],
    src_capacity: usize,
    src_start: usize,
    dst: &mut [T],
    dst_capacity: usize,
    dst_start: usize,
    count: usize,
) {
    if count == 0 {
        return;
    }
    let d = shape.head_dim;
    for plane in 0..shape.planes() {
        let s = (plane * src_capacity + src_start) * d;
        let t = (plane * dst_capacity + dst_start) * d;
        dst[t..t + count * d].copy_from_slice(&src[s..s + count * d]);
    }
}

/// Storage for one tensor role (key or value) of one transformer layer.
#[derive(Debug, Clone)]
pub struct TensorBuffer<T: CacheElement> {
    shape: KvShape,
    capacity: usize,
    length: usize,
    storage: Vec<T>,
    allocator: BlockAllocator,
}

impl<T: CacheElement> TensorBuffer<T> {
    /// An empty buffer with no storage; the first append grows it.
    pub fn empty(shape: KvShape, allocator: BlockAllocator) -> Self {
        Self {
            shape,
            capacity: 0,
            length: 0,
            storage: Vec::new(),
            allocator,
        }
    }

    /// Allocate `initial_capacity` slots and copy in `initial_rows`
    /// (laid out `[batch, heads, n, head_dim]`).
    pub fn create(
        shape: KvShape,
        initial_rows: &[T],
        initial_capacity: usize,
        allocator: BlockAllocator,
    ) -> CacheResult<Self> {
        let initial_length = shape.tokens_in(initial_rows.len())?;
        if initial_capacity < initial_length {
            return Err(CacheError::invalid(format!(
                "initial_capacity {initial_capacity} < initial_length {initial_length}"
            )));
        }

        let mut storage: Vec<T> = allocator.allocate(initial_capacity, shape.token_elements())?;
        copy_rows(
            &shape,
            initial_rows,
            initial_length,
            0,
            &mut storage,
            initial_capacity,
            0,
            initial_length,
        );

        Ok(Self {
            shape,
            capacity: initial_capacity,
            length: initial_length,
            storage,
            allocator,
        })
    }

    pub fn shape(&self) -> KvShape {
        self.shape
    }

    /// Number of valid slots.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Allocated slots along the sequence axis.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots that can be appended without growing.
    pub fn free_slots(&self) -> usize {
        self.capacity - self.length
    }

    /// Bytes held by the storage region.
    pub fn bytes_allocated(&self) -> usize {
        self.storage.len() * T::DTYPE.size_bytes()
    }

    pub(crate) fn allocator(&self) -> BlockAllocator {
        self.allocator
    }

    /// A copy of this buffer with `new_capacity` slots and identical rows.
    pub(crate) fn grown(&self, new_capacity: usize) -> CacheResult<Self> {
        if new_capacity <= self.capacity {
            return Err(CacheError::invalid(format!(
                "grow target {new_capacity} must exceed current capacity {}",
                self.capacity
            )));
        }

        let mut storage: Vec<T> = self
            .allocator
            .allocate(new_capacity, self.shape.token_elements())?;
        copy_rows(
            &self.shape,
            &self.storage,
            self.capacity,
            0,
            &mut storage,
            new_capacity,
            0,
            self.length,
        );

        Ok(Self {
            shape: self.shape,
            capacity: new_capacity,
            length: self.length,
            storage,
            allocator: self.allocator,
        })
    }

    /// Grow to exactly `new_capacity` slots, preserving `[0, length)` bit for bit.
    pub fn grow(&mut self, new_capacity: usize) -> CacheResult<()> {
        let grown = self.grown(new_capacity)?;
        debug!(
            from = self.capacity,
            to = new_capacity,
            length = self.length,
            "Grew cache buffer"
        );
        *self = grown;
        Ok(())
    }

    /// Tokens in `rows`, checked against the free capacity.
    pub(crate) fn check_append(&self, rows: &[T]) -> CacheResult<usize> {
        let count = self.shape.tokens_in(rows.len())?;
        let required = self.length + count;
        if required > self.capacity {
            return Err(CacheError::CapacityExceeded {
                required,
                capacity: self.capacity,
            });
        }
        Ok(count)
    }

    /// Write `rows` (laid out `[batch, heads, n, head_dim]`) into
    /// `[length, length + n)`. The caller must have grown the buffer first.
    pub fn append(&mut self, rows: &[T]) -> CacheResult<()> {
        let count = self.check_append(rows)?;
        copy_rows(
            &self.shape,
            rows,
            count,
            0,
            &mut self.storage,
            self.capacity,
            self.length,
            count,
        );
        self.length += count;
        Ok(())
    }

    /// A compacted copy holding the first `keep_front` and last `keep_back` rows.
    pub(crate) fn compacted(&self, keep_front: usize, keep_back: usize) -> CacheResult<Self> {
        let kept = keep_front
            .checked_add(keep_back)
            .filter(|&kept| kept <= self.length)
            .ok_or_else(|| {
                CacheError::invalid(format!(
                    "cannot keep {keep_front} + {keep_back} rows of {}",
                    self.length
                ))
            })?;

        let mut storage: Vec<T> = self.allocator.allocate(kept, self.shape.token_elements())?;
        copy_rows(
            &self.shape,
            &self.storage,
            self.capacity,
            0,
            &mut storage,
            kept,
            0,
            keep_front,
        );
        copy_rows(
            &self.shape,
            &self.storage,
            self.capacity,
            self.length - keep_back,
            &mut storage,
            kept,
            keep_front,
            keep_back,
        );

        Ok(Self {
            shape: self.shape,
            capacity: kept,
            length: kept,
            storage,
            allocator: self.allocator,
        })
    }

    /// Keep the first `keep_front` and last `keep_back` rows, dropping the gap.
    ///
    /// Row `i` of the result is original row `i` for `i < keep_front`, else
    /// original row `length - keep_back + (i - keep_front)`.
    pub fn truncate_front_and_back(
        &mut self,
        keep_front: usize,
        keep_back: usize,
    ) -> CacheResult<()> {
        let compacted = self.compacted(keep_front, keep_back)?;
        debug!(
            before = self.length,
            keep_front,
            keep_back,
            "Compacted cache buffer"
        );
        *self = compacted;
        Ok(())
    }

    /// Read-only view of the valid rows.
    pub fn view(&self) -> TensorView<'_, T> {
        TensorView {
            storage: &self.storage,
            shape: self.shape,
            capacity: self.capacity,
            length: self.length,
        }
    }
}

/// Borrowed view of `[0, length)` of a [`TensorBuffer`].
///
/// Rows of one `(batch, head)` plane are contiguous; planes are strided by
/// the buffer's capacity.
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a, T: CacheElement> {
    storage: &'a [T],
    shape: KvShape,
    capacity: usize,
    length: usize,
}

impl<'a, T: CacheElement> TensorView<'a, T> {
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn shape(&self) -> KvShape {
        self.shape
    }

    /// Valid rows of one plane, `length * head_dim` elements.
    ///
    /// Panics if `batch` or `head` is out of range.
    pub fn plane(&self, batch: usize, head: usize) -> &'a [T] {
        assert!(batch < self.shape.batch && head < self.shape.heads);
        let d = self.shape.head_dim;
        let start = (batch * self.shape.heads + head) * self.capacity * d;
        let storage: &'a [T] = self.storage;
        &storage[start..start + self.length * d]
    }

    /// One row of `head_dim` elements.
    ///
    /// Panics if any index is out of range.
    pub fn row(&self, batch: usize, head: usize, pos: usize) -> &'a [T] {
        assert!(pos < self.length, "row {pos} out of range ({})", self.length);
        let d = self.shape.head_dim;
        &self.plane(batch, head)[pos * d..(pos + 1) * d]
    }

    /// Gather the rows into a dense `[batch, heads, length, head_dim]` vector.
    pub fn to_contiguous(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.length * self.shape.token_elements());
        for b in 0..self.shape.batch {
            for h in 0..self.shape.heads {
                out.extend_from_slice(self.plane(b, h));
            }
        }
        out
    }

    /// Raw bytes of the dense layout, for bit-exact comparison.
    pub fn to_bytes(&self) -> Vec<u8> {
        bytemuck::cast_slice(&self.to_contiguous()).to_vec()
    }
}

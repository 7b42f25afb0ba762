//! Physical memory owned by a single device.
//!
//! A [`MemoryBlock`] is a raw, vector-aligned byte range. A [`DeviceMemory`]
//! wraps one block together with the device it lives on, its locality kind and
//! the allocator it must be returned to.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Arc;

use lattice_dtype::{DType, Element};
use parking_lot::RwLock;

use crate::allocator::Allocator;

/// Widest vector register we pad allocations for (four `f64` lanes).
pub const VECTOR_ALIGNMENT: usize = 32;

/// Round `value` up to the next multiple of `multiple`.
pub const fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

/// Memory locality of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryType {
    /// Shares the host address space; the host can view it without a copy.
    Unified,
    /// Separate address space; contents move only through queue copies.
    Discrete,
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unified => f.write_str("unified"),
            Self::Discrete => f.write_str("discrete"),
        }
    }
}

/// Raw byte range backing a replica.
///
/// Owned blocks are allocated with [`VECTOR_ALIGNMENT`] and padded to a multiple of it.
/// Borrowed blocks wrap caller-supplied memory and are never deallocated here.
#[derive(Debug)]
pub struct MemoryBlock {
    ptr: NonNull<u8>,
    len: usize,
    layout: Option<Layout>,
}

// SAFETY: a block is a plain byte range. Concurrent access is coordinated by the
// queue ordering rules and the single-writer precondition of `StorageBuffer`.
unsafe impl Send for MemoryBlock {}
unsafe impl Sync for MemoryBlock {}

impl MemoryBlock {
    /// Allocate a zeroed block of at least `len` bytes. Returns `None` if the
    /// system allocator fails.
    pub fn allocate(len: usize) -> Option<Self> {
        let padded = round_up(len.max(1), VECTOR_ALIGNMENT);
        let layout = Layout::from_size_align(padded, VECTOR_ALIGNMENT).ok()?;
        // SAFETY: layout has a non-zero size.
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })?;
        Some(Self { ptr, len: padded, layout: Some(layout) })
    }

    /// Wrap externally owned memory.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as the
    /// block (and every `DeviceMemory` built from it) is alive, and must not be
    /// accessed through other paths while a queue or view uses it.
    pub unsafe fn borrowed(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len, layout: None }
    }

    /// A zero-length placeholder used when a block has been handed back.
    pub(crate) fn dangling() -> Self {
        Self { ptr: NonNull::dangling(), len: 0, layout: None }
    }

    /// Physical length in bytes, including padding.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_borrowed(&self) -> bool {
        self.layout.is_none()
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            // SAFETY: allocated in `allocate` with exactly this layout.
            unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

/// A physical allocation on one device.
///
/// The logical `byte_count` may be smaller than the padded block. Owned memory
/// is returned to its allocator when the last handle drops, so commands that are
/// still queued keep their operands alive.
#[derive(Debug)]
pub struct DeviceMemory {
    block: MemoryBlock,
    byte_count: usize,
    device_index: usize,
    memory_type: MemoryType,
    allocator: Option<Arc<dyn Allocator>>,
    name: RwLock<String>,
}

impl DeviceMemory {
    pub(crate) fn new(
        block: MemoryBlock,
        byte_count: usize,
        device_index: usize,
        memory_type: MemoryType,
        allocator: Arc<dyn Allocator>,
    ) -> Self {
        debug_assert!(block.len() >= byte_count);
        Self { block, byte_count, device_index, memory_type, allocator: Some(allocator), name: RwLock::default() }
    }

    /// Memory that wraps caller-owned bytes on the host device.
    pub(crate) fn reference(block: MemoryBlock, byte_count: usize) -> Self {
        Self {
            block,
            byte_count,
            device_index: 0,
            memory_type: MemoryType::Unified,
            allocator: None,
            name: RwLock::default(),
        }
    }

    /// Logical length in bytes.
    pub fn byte_count(&self) -> usize {
        self.byte_count
    }

    /// Physical length in bytes, including vector padding.
    pub fn capacity(&self) -> usize {
        self.block.len()
    }

    pub fn device_index(&self) -> usize {
        self.device_index
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    /// `true` if the bytes belong to the caller and are never freed here.
    pub fn is_reference(&self) -> bool {
        self.allocator.is_none()
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.block.as_ptr()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.block.as_ptr()
    }

    /// Number of `dtype` elements that fit in the logical range.
    pub fn count(&self, dtype: DType) -> usize {
        self.byte_count / dtype.bytes()
    }

    /// View the logical range as `[T]`.
    ///
    /// # Safety
    ///
    /// No other thread or queued command may write this memory while the slice is alive.
    pub unsafe fn as_slice<T: Element>(&self) -> &[T] {
        // SAFETY: the block is valid for `byte_count` bytes; exclusivity is the caller's contract.
        let bytes = unsafe { std::slice::from_raw_parts(self.as_ptr(), self.byte_count) };
        bytemuck::cast_slice(bytes)
    }

    /// View the logical range as `[T]` mutably.
    ///
    /// # Safety
    ///
    /// The caller must be the only accessor of this memory while the slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice<T: Element>(&self) -> &mut [T] {
        // SAFETY: the block is valid for `byte_count` bytes; exclusivity is the caller's contract.
        let bytes = unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), self.byte_count) };
        bytemuck::cast_slice_mut(bytes)
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        let block = std::mem::replace(&mut self.block, MemoryBlock::dangling());
        match &self.allocator {
            Some(allocator) => {
                tracing::trace!(
                    memory.name = %self.name.read(),
                    device.index = self.device_index,
                    memory.bytes = self.byte_count,
                    "release"
                );
                allocator.free(block);
            }
            // Reference memory: dropping a borrowed block does not deallocate.
            None => drop(block),
        }
    }
}

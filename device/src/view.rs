use std::sync::Arc;

use lattice_dtype::{DType, Element};

use crate::memory::{DeviceMemory, MemoryType};

/// Typed handle to a replica that has just been migrated for some queue.
///
/// Views are what kernels capture: they are cheap to clone and keep the replica
/// alive while queued work references it. Element access is `unsafe` because
/// ordering against other accessors is established by the queue, not the type system.
#[derive(Debug, Clone)]
pub struct BufferView {
    memory: Arc<DeviceMemory>,
    dtype: DType,
    count: usize,
}

impl BufferView {
    pub(crate) fn new(memory: Arc<DeviceMemory>, dtype: DType, count: usize) -> Self {
        debug_assert!(dtype.byte_count(count) <= memory.byte_count());
        Self { memory, dtype, count }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn device_index(&self) -> usize {
        self.memory.device_index()
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory.memory_type()
    }

    pub fn memory(&self) -> &Arc<DeviceMemory> {
        &self.memory
    }

    fn check<T: Element>(&self, offset: usize, count: usize) {
        assert_eq!(
            T::DTYPE,
            self.dtype,
            "view of {} elements accessed as {} on {}",
            self.dtype,
            T::DTYPE,
            self.memory.device_index()
        );
        assert!(
            offset.checked_add(count).is_some_and(|end| end <= self.count),
            "view range {offset}..{} out of bounds for {} elements",
            offset.saturating_add(count),
            self.count
        );
    }

    /// Elements `offset..offset + count`.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not the view's dtype or the range exceeds the view.
    ///
    /// # Safety
    ///
    /// No command or thread may write the replica while the slice is alive.
    pub unsafe fn as_slice<T: Element>(&self, offset: usize, count: usize) -> &[T] {
        self.check::<T>(offset, count);
        // SAFETY: forwarded to the caller.
        let all = unsafe { self.memory.as_slice::<T>() };
        &all[offset..offset + count]
    }

    /// Elements `offset..offset + count`, mutably.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not the view's dtype or the range exceeds the view.
    ///
    /// # Safety
    ///
    /// The caller must be the only reader or writer of the replica while the slice
    /// is alive. Kernels obtain this by running on the queue the view was migrated for.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice<T: Element>(&self, offset: usize, count: usize) -> &mut [T] {
        self.check::<T>(offset, count);
        // SAFETY: forwarded to the caller.
        let all = unsafe { self.memory.as_mut_slice::<T>() };
        &mut all[offset..offset + count]
    }
}

//! Logical tensor storage replicated across devices.
//!
//! A [`StorageBuffer`] owns up to one physical replica per device. Exactly one
//! replica (the *master*) holds the authoritative contents; the others are
//! refreshed lazily when a queue on their device next accesses the buffer.
//!
//! # Versioning
//!
//! The buffer keeps a `master_version` that starts at `-1` (uninitialized) and is
//! bumped once per write access. Each replica remembers the master version it last
//! observed. A replica whose version differs from `master_version` is stale and is
//! refreshed with one asynchronous copy from the master before use.
//!
//! # Ordering
//!
//! Every access names the queue it runs on. When the accessing queue differs from
//! the last one used and that one is asynchronous, an [`Event`](crate::Event) is
//! recorded on the old queue and waited on by the new one, so the access (and any
//! refresh copy) is ordered after all earlier work on the buffer.
//!
//! # Access
//!
//! ```ignore
//! let registry = DeviceRegistry::new(RegistryConfig::default())?;
//! let mut buffer = StorageBuffer::from_slice(&registry, &[1.0f32, 2.0, 3.0], "weights")?;
//!
//! // Kernel access on the accelerator
//! let queue = registry.device(1).unwrap().default_queue();
//! let view = buffer.migrate(DType::Float32, true, queue)?;
//! queue.dispatch("scale", move || {
//!     let values = unsafe { view.as_mut_slice::<f32>(0, view.len()) };
//!     values.iter_mut().for_each(|v| *v *= 2.0);
//!     Ok(())
//! })?;
//!
//! // Host access: migrates back and waits for the kernel
//! assert_eq!(buffer.read::<f32>(0, 3, registry.host_queue())?, &[2.0, 4.0, 6.0]);
//! ```

use std::ptr::NonNull;
use std::sync::Arc;

use lattice_dtype::{DType, Element};
use smallvec::SmallVec;

use crate::error::Result;
use crate::memory::{DeviceMemory, MemoryBlock};
use crate::queue::{DeviceQueue, QueueId};
use crate::registry::{BufferId, DeviceRegistry};
use crate::sync::EventOptions;
use crate::view::BufferView;

/// Physical copy of a buffer on one device.
#[derive(Debug, Clone)]
struct Replica {
    memory: Arc<DeviceMemory>,
    /// Master version this replica last observed.
    version: i64,
}

/// Storage for one tensor that may live on several devices at once.
///
/// Bookkeeping is mutated through `&mut self`; a single logical writer per buffer
/// at a time is a precondition.
#[derive(Debug)]
pub struct StorageBuffer {
    id: BufferId,
    name: String,
    registry: Arc<DeviceRegistry>,
    dtype: DType,
    count: usize,
    read_only: bool,
    reference: bool,
    /// Indexed by device index.
    replicas: SmallVec<[Option<Replica>; 4]>,
    master: Option<usize>,
    master_version: i64,
    last_queue: Option<QueueId>,
    last_access_copied: bool,
}

impl StorageBuffer {
    /// An uninitialized buffer of `count` elements. No memory is allocated until first access.
    pub fn new(registry: &Arc<DeviceRegistry>, dtype: DType, count: usize, name: impl Into<String>) -> Self {
        let buffer = Self {
            id: registry.next_buffer_id(),
            name: name.into(),
            registry: Arc::clone(registry),
            dtype,
            count,
            read_only: false,
            reference: false,
            replicas: std::iter::repeat_n(None, registry.devices().len()).collect(),
            master: None,
            master_version: -1,
            last_queue: None,
            last_access_copied: false,
        };
        tracing::trace!(buffer.id = buffer.id.0, buffer.name = %buffer.name, dtype = %dtype, count, "buffer created");
        buffer
    }

    /// A one-element buffer holding `value`.
    pub fn from_element<T: Element>(registry: &Arc<DeviceRegistry>, value: T, name: impl Into<String>) -> Result<Self> {
        Self::from_slice(registry, std::slice::from_ref(&value), name)
    }

    /// A buffer initialized with a copy of `values`, written through the host queue.
    pub fn from_slice<T: Element>(registry: &Arc<DeviceRegistry>, values: &[T], name: impl Into<String>) -> Result<Self> {
        let mut buffer = Self::new(registry, T::DTYPE, values.len(), name);
        buffer.read_write::<T>(0, values.len(), registry.host_queue())?.copy_from_slice(values);
        Ok(buffer)
    }

    /// A read-only buffer wrapping caller-owned host memory without copying.
    pub fn reference<T: Element>(registry: &Arc<DeviceRegistry>, values: &'static [T], name: impl Into<String>) -> Self {
        // SAFETY: the slice lives forever and the buffer never writes a read-only replica.
        unsafe { Self::from_raw_parts(registry, T::DTYPE, NonNull::from(values).cast(), values.len(), true, name) }
    }

    /// A writable buffer wrapping caller-owned host memory without copying.
    pub fn reference_mut<T: Element>(
        registry: &Arc<DeviceRegistry>,
        values: &'static mut [T],
        name: impl Into<String>,
    ) -> Self {
        let count = values.len();
        // SAFETY: the exclusive borrow lives forever and is handed to the buffer.
        unsafe { Self::from_raw_parts(registry, T::DTYPE, NonNull::from(values).cast(), count, false, name) }
    }

    /// Wrap host memory the buffer does not own.
    ///
    /// The wrapped memory becomes the master replica on the host device at version 0.
    ///
    /// # Safety
    ///
    /// `ptr` must be aligned for `dtype` and valid for `dtype.byte_count(count)` bytes of
    /// reads (and writes unless `read_only`) for the whole lifetime of the buffer, and must
    /// not be accessed through other paths while the buffer is alive.
    pub unsafe fn from_raw_parts(
        registry: &Arc<DeviceRegistry>,
        dtype: DType,
        ptr: NonNull<u8>,
        count: usize,
        read_only: bool,
        name: impl Into<String>,
    ) -> Self {
        let mut buffer = Self::new(registry, dtype, count, name);
        let byte_count = buffer.byte_count();

        // SAFETY: forwarded to the caller.
        let block = unsafe { MemoryBlock::borrowed(ptr, byte_count) };
        let memory = Arc::new(DeviceMemory::reference(block, byte_count));
        memory.set_name(buffer.name.clone());

        buffer.replicas[0] = Some(Replica { memory, version: 0 });
        buffer.master = Some(0);
        buffer.master_version = 0;
        buffer.read_only = read_only;
        buffer.reference = true;

        tracing::debug!(
            buffer.id = buffer.id.0,
            buffer.name = %buffer.name,
            bytes = byte_count,
            read_only,
            "wrapped reference memory"
        );
        buffer
    }

    /// A new buffer holding a copy of `other`'s current contents, made synchronously on `queue`.
    ///
    /// Duplicating an uninitialized buffer yields an uninitialized buffer.
    pub fn duplicate(other: &StorageBuffer, queue: &DeviceQueue) -> Result<Self> {
        let mut buffer = Self::new(&other.registry, other.dtype, other.count, other.name.clone());
        let Some(source) = other.master.and_then(|index| other.replicas[index].as_ref()) else {
            return Ok(buffer);
        };
        buffer.assert_queue_owned(queue, "duplicate");

        other.order_after_last_queue(queue)?;

        let index = queue.device_index();
        let memory = queue.allocate(other.byte_count())?;
        memory.set_name(buffer.name.clone());
        queue.copy(&source.memory, &memory)?;

        tracing::debug!(
            buffer.id = buffer.id.0,
            source.id = other.id.0,
            src.device = source.memory.device_index(),
            dst.device = index,
            "duplicated buffer"
        );

        buffer.replicas[index] = Some(Replica { memory, version: 0 });
        buffer.master = Some(index);
        buffer.master_version = 0;
        buffer.last_queue = Some(queue.id());
        buffer.last_access_copied = true;
        Ok(buffer)
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the buffer and every replica it owns.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        for replica in self.replicas.iter().flatten() {
            replica.memory.set_name(self.name.clone());
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
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

    /// Logical size in bytes.
    pub fn byte_count(&self) -> usize {
        self.dtype.byte_count(self.count)
    }

    pub fn alignment(&self) -> usize {
        self.dtype.alignment()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// `true` if the host replica wraps caller-owned memory.
    pub fn is_reference(&self) -> bool {
        self.reference
    }

    /// `-1` until the first write access.
    pub fn master_version(&self) -> i64 {
        self.master_version
    }

    /// Device index of the replica holding the authoritative contents.
    pub fn master_device(&self) -> Option<usize> {
        self.master
    }

    /// Physical replica on `device`, if one has been allocated.
    pub fn replica(&self, device: usize) -> Option<&Arc<DeviceMemory>> {
        self.replicas.get(device)?.as_ref().map(|replica| &replica.memory)
    }

    /// Master version the replica on `device` last observed.
    pub fn replica_version(&self, device: usize) -> Option<i64> {
        self.replicas.get(device)?.as_ref().map(|replica| replica.version)
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.iter().flatten().count()
    }

    pub fn last_queue(&self) -> Option<QueueId> {
        self.last_queue
    }

    /// `true` if the most recent migration refreshed its replica with a copy.
    pub fn last_access_copied(&self) -> bool {
        self.last_access_copied
    }

    /// Make the contents current on `queue`'s device and return a view of that replica.
    ///
    /// Any refresh copy is enqueued on `queue`, so work later submitted to `queue` sees
    /// current contents. With `will_mutate` the replica becomes the new master.
    ///
    /// # Panics
    ///
    /// Panics on a read of an uninitialized buffer, on a `dtype` other than the buffer's,
    /// on a write to a read-only buffer, or if `queue` belongs to another registry.
    pub fn migrate(&mut self, dtype: DType, will_mutate: bool, queue: &DeviceQueue) -> Result<BufferView> {
        self.assert_queue_owned(queue, "migrate");
        assert!(
            will_mutate || self.master.is_some(),
            "buffer {} ({}) read on {} before it was written",
            self.id,
            self.name,
            queue.device_name()
        );
        assert_eq!(
            dtype, self.dtype,
            "buffer {} ({}) of {} accessed as {} on {}",
            self.id, self.name, self.dtype, dtype, queue.device_name()
        );
        assert!(
            !(will_mutate && self.read_only),
            "buffer {} ({}) is read-only; write access requested on {}",
            self.id,
            self.name,
            queue.device_name()
        );

        self.order_after_last_queue(queue)?;

        let index = queue.device_index();
        if self.replicas[index].is_none() {
            let memory = queue.allocate(self.byte_count())?;
            memory.set_name(self.name.clone());
            tracing::debug!(
                buffer.id = self.id.0,
                buffer.name = %self.name,
                device = queue.device_name(),
                bytes = self.byte_count(),
                "allocated replica"
            );
            self.replicas[index] = Some(Replica { memory, version: -1 });
        }

        let master = self.master.and_then(|m| self.replicas[m].as_ref()).map(|replica| Arc::clone(&replica.memory));
        let master_version = self.master_version;
        let Some(replica) = self.replicas[index].as_mut() else {
            unreachable!("replica allocated above");
        };

        self.last_access_copied = false;
        if let Some(source) = master
            && replica.version != master_version
        {
            tracing::debug!(
                buffer.id = self.id.0,
                buffer.name = %self.name,
                src.device = source.device_index(),
                dst.device = index,
                queue.name = queue.name(),
                "refreshing stale replica"
            );
            queue.copy_async(&source, &replica.memory)?;
            self.last_access_copied = true;
        }

        if will_mutate {
            self.master_version += 1;
            self.master = Some(index);
        }
        replica.version = self.master_version;
        let memory = Arc::clone(&replica.memory);
        self.last_queue = Some(queue.id());

        tracing::trace!(
            buffer.id = self.id.0,
            device = index,
            will_mutate,
            version = self.master_version,
            "migrated"
        );

        Ok(BufferView::new(memory, self.dtype, self.count))
    }

    /// Host read access to `offset..offset + count` after migrating for `queue`.
    ///
    /// Blocks until `queue` has drained so the slice is never written by in-flight work.
    pub fn read<T: Element>(&mut self, offset: usize, count: usize, queue: &DeviceQueue) -> Result<&[T]> {
        let view = self.migrate(T::DTYPE, false, queue)?;
        if queue.is_async() {
            queue.wait_for_completion()?;
        }
        self.assert_in_bounds(offset, count);
        // SAFETY: `&mut self` excludes other host access and the queue is drained.
        let all = unsafe { self.host_memory(view.device_index()).as_slice::<T>() };
        Ok(&all[offset..offset + count])
    }

    /// Host read-write access to `offset..offset + count` after migrating for `queue`.
    ///
    /// The replica on `queue`'s device becomes the master.
    pub fn read_write<T: Element>(&mut self, offset: usize, count: usize, queue: &DeviceQueue) -> Result<&mut [T]> {
        let view = self.migrate(T::DTYPE, true, queue)?;
        if queue.is_async() {
            queue.wait_for_completion()?;
        }
        self.assert_in_bounds(offset, count);
        // SAFETY: `&mut self` excludes other host access and the queue is drained.
        let all = unsafe { self.host_memory(view.device_index()).as_mut_slice::<T>() };
        Ok(&mut all[offset..offset + count])
    }

    /// Block until the last queue that accessed this buffer has drained.
    pub fn wait_for_completion(&self) -> Result<()> {
        match self.last_queue.and_then(|id| self.registry.queue(id)) {
            Some(queue) => queue.wait_for_completion(),
            None => Ok(()),
        }
    }

    /// Order work on `queue` after everything pending on the last queue used.
    fn order_after_last_queue(&self, queue: &DeviceQueue) -> Result<()> {
        let Some(last) = self.last_queue else { return Ok(()) };
        if last == queue.id() {
            return Ok(());
        }
        let Some(previous) = self.registry.queue(last) else { return Ok(()) };
        if !previous.is_async() {
            return Ok(());
        }

        let event = previous.create_event(EventOptions::empty());
        previous.record(&event)?;
        queue.wait(&event)?;

        tracing::trace!(
            buffer.id = self.id.0,
            from = previous.name(),
            to = queue.name(),
            event.id = event.id().0,
            "cross-queue sync"
        );
        Ok(())
    }

    fn host_memory(&self, device: usize) -> &DeviceMemory {
        match &self.replicas[device] {
            Some(replica) => &replica.memory,
            None => unreachable!("migrated replica missing"),
        }
    }

    fn assert_queue_owned(&self, queue: &DeviceQueue, operation: &str) {
        assert!(
            self.registry.owns(queue),
            "buffer {} ({}): {operation} through queue {} of another registry",
            self.id,
            self.name,
            queue.name()
        );
    }

    fn assert_in_bounds(&self, offset: usize, count: usize) {
        assert!(
            offset.checked_add(count).is_some_and(|end| end <= self.count),
            "buffer {} ({}): range {offset}..{} out of bounds for {} elements",
            self.id,
            self.name,
            offset.saturating_add(count),
            self.count
        );
    }
}

impl Drop for StorageBuffer {
    fn drop(&mut self) {
        // Queued writes may still target our replicas. Failures belong to whoever drains next.
        if let Some(queue) = self.last_queue.and_then(|id| self.registry.queue(id)) {
            queue.wait_idle();
        }
        tracing::trace!(buffer.id = self.id.0, replicas = self.replica_count(), "buffer released");
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{OutOfMemorySnafu, Result};
use crate::memory::{MemoryBlock, MemoryType, VECTOR_ALIGNMENT, round_up};

pub trait Allocator: Send + Sync + std::fmt::Debug {
    /// Allocate at least `size` bytes. The returned block is padded to the vector width.
    fn alloc(&self, size: usize) -> Result<MemoryBlock>;
    fn free(&self, _block: MemoryBlock) {}
    fn memory_type(&self) -> MemoryType;
    fn name(&self) -> &str;
    /// Bytes currently held by this allocator (including cached blocks).
    fn bytes_in_use(&self) -> usize;
}

/// Allocator backed by the system heap with an optional capacity budget.
///
/// Host devices use it with [`MemoryType::Unified`]. Accelerator devices use it with
/// [`MemoryType::Discrete`] and a capacity that emulates the device's memory size.
#[derive(Debug)]
pub struct SystemAllocator {
    name: String,
    memory_type: MemoryType,
    capacity: Option<usize>,
    in_use: AtomicUsize,
}

impl SystemAllocator {
    pub fn new(name: impl Into<String>, memory_type: MemoryType, capacity: Option<usize>) -> Self {
        Self { name: name.into(), memory_type, capacity, in_use: AtomicUsize::new(0) }
    }

    pub fn unified(name: impl Into<String>) -> Self {
        Self::new(name, MemoryType::Unified, None)
    }

    pub fn discrete(name: impl Into<String>, capacity: Option<usize>) -> Self {
        Self::new(name, MemoryType::Discrete, capacity)
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn reserve(&self, padded: usize) -> Result<()> {
        let Some(capacity) = self.capacity else {
            self.in_use.fetch_add(padded, Ordering::AcqRel);
            return Ok(());
        };

        let reserved = self.in_use.fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
            used.checked_add(padded).filter(|&total| total <= capacity)
        });

        match reserved {
            Ok(_) => Ok(()),
            Err(used) => OutOfMemorySnafu {
                device: self.name.clone(),
                requested: padded,
                available: capacity.saturating_sub(used),
            }
            .fail(),
        }
    }
}

impl Allocator for SystemAllocator {
    fn alloc(&self, size: usize) -> Result<MemoryBlock> {
        let padded = round_up(size.max(1), VECTOR_ALIGNMENT);
        self.reserve(padded)?;

        match MemoryBlock::allocate(size) {
            Some(block) => Ok(block),
            None => {
                self.in_use.fetch_sub(padded, Ordering::AcqRel);
                OutOfMemorySnafu { device: self.name.clone(), requested: padded, available: 0usize }.fail()
            }
        }
    }

    fn free(&self, block: MemoryBlock) {
        if block.is_borrowed() {
            return;
        }
        self.in_use.fetch_sub(block.len(), Ordering::AcqRel);
    }

    fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn bytes_in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }
}

/// Allocator that caches freed blocks for reuse.
///
/// Blocks are keyed by their padded length. When the inner allocator is exhausted
/// the cache is released and the allocation retried once.
#[derive(Debug)]
pub struct CachingAllocator {
    inner: Box<dyn Allocator>,
    cache: Mutex<HashMap<usize, Vec<MemoryBlock>>>,
    max_blocks_per_size: usize,
    name: String,
}

impl CachingAllocator {
    pub fn new(inner: Box<dyn Allocator>) -> Self {
        Self::with_capacity(inner, 32)
    }

    pub fn with_capacity(inner: Box<dyn Allocator>, max_blocks_per_size: usize) -> Self {
        let name = inner.name().to_string();
        Self { inner, cache: Mutex::new(HashMap::new()), max_blocks_per_size, name }
    }

    /// Number of cached blocks able to serve a request of `size` bytes.
    pub fn cached_blocks(&self, size: usize) -> usize {
        let key = round_up(size.max(1), VECTOR_ALIGNMENT);
        self.cache.lock().get(&key).map_or(0, Vec::len)
    }

    /// Return every cached block to the inner allocator.
    pub fn clear(&self) {
        let drained: Vec<MemoryBlock> = self.cache.lock().drain().flat_map(|(_, blocks)| blocks).collect();
        if !drained.is_empty() {
            tracing::debug!(allocator = %self.name, blocks = drained.len(), "releasing cached blocks");
        }
        for block in drained {
            self.inner.free(block);
        }
    }
}

impl Allocator for CachingAllocator {
    fn alloc(&self, size: usize) -> Result<MemoryBlock> {
        let key = round_up(size.max(1), VECTOR_ALIGNMENT);

        // Try cache first
        {
            let mut cache = self.cache.lock();
            if let Some(blocks) = cache.get_mut(&key)
                && let Some(block) = blocks.pop()
            {
                if blocks.is_empty() {
                    cache.remove(&key);
                }
                return Ok(block);
            }
        } // Drop lock before expensive allocation

        match self.inner.alloc(size) {
            Ok(block) => Ok(block),
            Err(e) => {
                // On allocation failure, evict cache and retry
                self.clear();
                self.inner.alloc(size).map_err(|_| e)
            }
        }
    }

    fn free(&self, block: MemoryBlock) {
        if block.is_borrowed() {
            return;
        }

        let mut cache = self.cache.lock();
        let blocks = cache.entry(block.len()).or_default();
        if blocks.len() < self.max_blocks_per_size {
            blocks.push(block);
        } else {
            drop(cache);
            self.inner.free(block);
        }
    }

    fn memory_type(&self) -> MemoryType {
        self.inner.memory_type()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn bytes_in_use(&self) -> usize {
        self.inner.bytes_in_use()
    }
}

impl Drop for CachingAllocator {
    fn drop(&mut self) {
        self.clear();
    }
}

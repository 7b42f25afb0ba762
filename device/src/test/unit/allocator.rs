use crate::allocator::{Allocator, CachingAllocator, SystemAllocator};
use crate::memory::{MemoryType, VECTOR_ALIGNMENT};
use crate::Error;

#[test]
fn test_system_allocator_pads_to_vector_width() {
    let allocator = SystemAllocator::unified("CPU");
    let block = allocator.alloc(5).unwrap();

    assert_eq!(block.len(), VECTOR_ALIGNMENT);
    assert_eq!(block.as_ptr() as usize % VECTOR_ALIGNMENT, 0);
    assert_eq!(allocator.bytes_in_use(), VECTOR_ALIGNMENT);

    allocator.free(block);
    assert_eq!(allocator.bytes_in_use(), 0);
}

#[test]
fn test_zero_sized_allocation() {
    let allocator = SystemAllocator::unified("CPU");
    let block = allocator.alloc(0).unwrap();
    assert_eq!(block.len(), VECTOR_ALIGNMENT);
    allocator.free(block);
}

#[test]
fn test_system_allocator_capacity() {
    let allocator = SystemAllocator::discrete("ACC", Some(64));
    assert_eq!(allocator.memory_type(), MemoryType::Discrete);

    let a = allocator.alloc(32).unwrap();
    let b = allocator.alloc(32).unwrap();
    let err = allocator.alloc(1).unwrap_err();
    assert!(matches!(err, Error::OutOfMemory { requested: 32, available: 0, .. }));

    allocator.free(a);
    let c = allocator.alloc(1).unwrap();
    allocator.free(b);
    allocator.free(c);
    assert_eq!(allocator.bytes_in_use(), 0);
}

#[test]
fn test_caching_allocator_reuses_blocks() {
    let allocator = CachingAllocator::new(Box::new(SystemAllocator::unified("CPU")));

    let block = allocator.alloc(100).unwrap();
    let address = block.as_ptr();
    allocator.free(block);
    assert_eq!(allocator.cached_blocks(100), 1);

    // Same padded size class hits the cache
    let reused = allocator.alloc(128).unwrap();
    assert_eq!(reused.as_ptr(), address);
    assert_eq!(allocator.cached_blocks(100), 0);
    allocator.free(reused);
}

#[test]
fn test_caching_allocator_limit_per_size() {
    let allocator = CachingAllocator::with_capacity(Box::new(SystemAllocator::unified("CPU")), 2);
    let blocks: Vec<_> = (0..4).map(|_| allocator.alloc(64).unwrap()).collect();
    assert_eq!(allocator.bytes_in_use(), 256);

    for block in blocks {
        allocator.free(block);
    }
    assert_eq!(allocator.cached_blocks(64), 2);
    assert_eq!(allocator.bytes_in_use(), 128);

    allocator.clear();
    assert_eq!(allocator.cached_blocks(64), 0);
    assert_eq!(allocator.bytes_in_use(), 0);
}

#[test]
fn test_caching_allocator_evicts_and_retries() {
    let allocator = CachingAllocator::new(Box::new(SystemAllocator::discrete("ACC", Some(96))));

    // Fill the device with cached 32-byte blocks
    let small: Vec<_> = (0..3).map(|_| allocator.alloc(32).unwrap()).collect();
    for block in small {
        allocator.free(block);
    }
    assert_eq!(allocator.cached_blocks(32), 3);

    // A larger request only fits once the cache is released
    let large = allocator.alloc(64).unwrap();
    assert_eq!(large.len(), 64);
    assert_eq!(allocator.cached_blocks(32), 0);
    allocator.free(large);
}

#[test]
fn test_caching_allocator_reports_exhaustion() {
    let allocator = CachingAllocator::new(Box::new(SystemAllocator::discrete("ACC", Some(32))));
    let err = allocator.alloc(33).unwrap_err();
    assert!(matches!(err, Error::OutOfMemory { requested: 64, available: 32, .. }));
}

//! Compute devices and the queues they own.
//!
//! Device 0 is always the host CPU with [`MemoryType::Unified`] memory. Every
//! other device is an emulated accelerator with [`MemoryType::Discrete`] memory
//! whose contents are only reachable through its queues.

use std::sync::Arc;

use crate::allocator::Allocator;
use crate::memory::MemoryType;
use crate::queue::DeviceQueue;

/// What a device is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Accelerator,
}

/// A compute device with its allocator and execution queues.
///
/// Devices are created by the registry and live as long as it does.
#[derive(Debug)]
pub struct Device {
    index: usize,
    name: String,
    kind: DeviceKind,
    allocator: Arc<dyn Allocator>,
    queues: Vec<DeviceQueue>,
}

impl Device {
    pub(crate) fn new(index: usize, kind: DeviceKind, allocator: Arc<dyn Allocator>, queues: Vec<DeviceQueue>) -> Self {
        debug_assert!(!queues.is_empty(), "device {index} has no queues");
        Self { index, name: format!("dev:{index}"), kind, allocator, queues }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Diagnostic name, `dev:<index>`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn memory_type(&self) -> MemoryType {
        self.allocator.memory_type()
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    /// The first queue of the device.
    pub fn default_queue(&self) -> &DeviceQueue {
        &self.queues[0]
    }

    pub fn queue(&self, index: usize) -> Option<&DeviceQueue> {
        self.queues.get(index)
    }

    pub fn queues(&self) -> &[DeviceQueue] {
        &self.queues
    }

    /// Drain every queue of this device.
    pub fn wait_for_completion(&self) -> crate::Result<()> {
        self.queues.iter().try_for_each(DeviceQueue::wait_for_completion)
    }
}

//! Tensor storage that migrates coherently between heterogeneous devices.
//!
//! The entry point is a [`DeviceRegistry`] describing the host device and any
//! accelerators, each with one or more ordered [`DeviceQueue`]s. A
//! [`StorageBuffer`] keeps one replica per device it has been used on and copies
//! contents between them only when a replica is stale.

pub mod allocator;
pub mod config;
pub mod device;
pub mod error;
pub mod memory;
pub mod queue;
pub mod registry;
pub mod storage;
pub mod sync;
pub mod view;


pub use allocator::{Allocator, CachingAllocator, SystemAllocator};
pub use config::RegistryConfig;
pub use device::{Device, DeviceKind};
pub use error::{Error, Result};
pub use memory::{DeviceMemory, MemoryBlock, MemoryType};
pub use queue::{DeviceQueue, QueueId, QueueMode, TransferKind};
pub use registry::{BufferId, DeviceRegistry, DeviceSpec, IdGenerator};
pub use storage::StorageBuffer;
pub use sync::{Event, EventId, EventOption, EventOptions};
pub use view::BufferView;

pub use lattice_dtype::{DType, Element, HasDType};

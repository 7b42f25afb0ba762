//! Device and queue topology configuration.
//!
//! Supports both explicit configuration via bon builders and environment
//! variable fallbacks.

use bon::bon;

use crate::error::{InvalidConfigSnafu, Result};
use crate::queue::QueueMode;

/// Topology of a [`DeviceRegistry`](crate::DeviceRegistry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Asynchronous queues created on the host device.
    pub cpu_queues: usize,
    /// Emulated discrete accelerator devices.
    pub accelerators: usize,
    /// Queues created on each accelerator.
    pub accelerator_queues: usize,
    /// Execution mode of every device queue. The host interchange queue is always sync.
    pub queue_mode: QueueMode,
    /// Memory budget of each accelerator in bytes. `None` means unbounded.
    pub accelerator_memory: Option<usize>,
    /// Freed blocks kept per size class by each device's caching allocator.
    pub cache_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cpu_queues: 1,
            accelerators: 1,
            accelerator_queues: 1,
            queue_mode: QueueMode::Async,
            accelerator_memory: None,
            cache_capacity: 32,
        }
    }
}

#[bon]
impl RegistryConfig {
    /// Create a registry configuration with builder pattern.
    #[builder(finish_fn = build)]
    pub fn builder(
        #[builder(default = 1)] cpu_queues: usize,
        #[builder(default = 1)] accelerators: usize,
        #[builder(default = 1)] accelerator_queues: usize,
        #[builder(default)] queue_mode: QueueMode,
        accelerator_memory: Option<usize>,
        #[builder(default = 32)] cache_capacity: usize,
    ) -> Self {
        Self { cpu_queues, accelerators, accelerator_queues, queue_mode, accelerator_memory, cache_capacity }
    }

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `LATTICE_CPU_QUEUES` - Host device queues (default: 1)
    /// * `LATTICE_ACCELERATORS` - Emulated accelerators (default: 1)
    /// * `LATTICE_ACCELERATOR_QUEUES` - Queues per accelerator (default: 1)
    /// * `LATTICE_QUEUE_MODE` - `sync` or `async` (default: async)
    /// * `LATTICE_ACCELERATOR_MEMORY` - Accelerator memory budget in bytes (default: unbounded)
    /// * `LATTICE_CACHE_CAPACITY` - Cached blocks per size class (default: 32)
    pub fn from_env() -> Self {
        let cpu_queues = std::env::var("LATTICE_CPU_QUEUES").ok().and_then(|s| s.parse().ok()).unwrap_or(1);
        let accelerators = std::env::var("LATTICE_ACCELERATORS").ok().and_then(|s| s.parse().ok()).unwrap_or(1);
        let accelerator_queues =
            std::env::var("LATTICE_ACCELERATOR_QUEUES").ok().and_then(|s| s.parse().ok()).unwrap_or(1);
        let queue_mode = std::env::var("LATTICE_QUEUE_MODE").ok().and_then(|s| parse_queue_mode(&s)).unwrap_or_default();
        let accelerator_memory = std::env::var("LATTICE_ACCELERATOR_MEMORY").ok().and_then(|s| s.parse().ok());
        let cache_capacity = std::env::var("LATTICE_CACHE_CAPACITY").ok().and_then(|s| s.parse().ok()).unwrap_or(32);

        Self { cpu_queues, accelerators, accelerator_queues, queue_mode, accelerator_memory, cache_capacity }
    }

    /// Reject topologies that leave a device without queues.
    pub fn validate(&self) -> Result<()> {
        snafu::ensure!(
            self.cpu_queues > 0,
            InvalidConfigSnafu { reason: "the host device needs at least one queue" }
        );
        snafu::ensure!(
            self.accelerators == 0 || self.accelerator_queues > 0,
            InvalidConfigSnafu { reason: "accelerators need at least one queue each" }
        );
        Ok(())
    }

    /// Total number of devices, the host included.
    pub fn device_count(&self) -> usize {
        1 + self.accelerators
    }
}

fn parse_queue_mode(s: &str) -> Option<QueueMode> {
    match s.trim().to_ascii_lowercase().as_str() {
        "sync" => Some(QueueMode::Sync),
        "async" => Some(QueueMode::Async),
        _ => None,
    }
}

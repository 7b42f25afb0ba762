use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::allocator::{Allocator, CachingAllocator, SystemAllocator};
use crate::config::RegistryConfig;
use crate::device::{Device, DeviceKind};
use crate::error::{Error, InvalidDeviceSnafu, Result};
use crate::queue::{DeviceQueue, QueueId, QueueMode};
use crate::sync::EventId;

/// Unique buffer identifier issued by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic id source for buffers, queues and events.
#[derive(Debug, Default)]
pub struct IdGenerator {
    buffers: AtomicU64,
    queues: AtomicU64,
    events: AtomicU64,
}

impl IdGenerator {
    pub fn next_buffer_id(&self) -> BufferId {
        BufferId(self.buffers.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_queue_id(&self) -> QueueId {
        QueueId(self.queues.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_event_id(&self) -> EventId {
        EventId(self.events.fetch_add(1, Ordering::Relaxed))
    }
}

/// Parsed device selector.
///
/// Examples:
/// - "CPU" -> DeviceSpec::Cpu (device 0)
/// - "GPU:1" / "ACC:1" -> DeviceSpec::Accelerator(1) (device 2)
/// - "acc" -> DeviceSpec::Accelerator(0) (default to the first accelerator)
/// - "DEV:3" -> DeviceSpec::Index(3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceSpec {
    Cpu,
    Accelerator(usize),
    Index(usize),
}

impl DeviceSpec {
    /// Position of the selected device in the registry's device list.
    pub fn device_index(&self) -> usize {
        match self {
            Self::Cpu => 0,
            Self::Accelerator(ordinal) => ordinal + 1,
            Self::Index(index) => *index,
        }
    }
}

impl FromStr for DeviceSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_uppercase();
        let mut parts = upper.split(':');
        let kind = parts.next().unwrap_or_default();
        let ordinal = parts
            .next()
            .map(|n| n.parse::<usize>().map_err(|_| Error::InvalidDevice { device: s.to_string() }))
            .transpose()?;
        snafu::ensure!(parts.next().is_none(), InvalidDeviceSnafu { device: s });

        match (kind, ordinal) {
            ("CPU", None | Some(0)) => Ok(Self::Cpu),
            ("ACC" | "GPU", None) => Ok(Self::Accelerator(0)),
            ("ACC" | "GPU", Some(ordinal)) => Ok(Self::Accelerator(ordinal)),
            ("DEV", Some(index)) => Ok(Self::Index(index)),
            _ => InvalidDeviceSnafu { device: s }.fail(),
        }
    }
}

/// The set of devices available to storage buffers.
///
/// A registry is constructed explicitly and shared as `Arc<DeviceRegistry>`.
/// It owns every device (and therefore every device queue), a synchronous host
/// queue used for application data interchange, and the id generator.
#[derive(Debug)]
pub struct DeviceRegistry {
    config: RegistryConfig,
    devices: Vec<Device>,
    host_queue: DeviceQueue,
    ids: Arc<IdGenerator>,
}

impl DeviceRegistry {
    pub fn new(config: RegistryConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let ids = Arc::new(IdGenerator::default());

        let host_allocator = Self::create_allocator(&config, DeviceKind::Cpu, "dev:0");
        let mut devices = Vec::with_capacity(config.device_count());
        devices.push(Self::create_device(&config, &ids, 0, DeviceKind::Cpu, host_allocator.clone())?);

        for index in 1..config.device_count() {
            let allocator = Self::create_allocator(&config, DeviceKind::Accelerator, &format!("dev:{index}"));
            devices.push(Self::create_device(&config, &ids, index, DeviceKind::Accelerator, allocator)?);
        }

        let host_queue =
            DeviceQueue::new("host".to_string(), 0, "dev:0".to_string(), QueueMode::Sync, host_allocator, Arc::clone(&ids))?;

        tracing::debug!(
            devices = devices.len(),
            cpu_queues = config.cpu_queues,
            accelerator_queues = config.accelerator_queues,
            queue_mode = ?config.queue_mode,
            "device registry created"
        );

        Ok(Arc::new(Self { config, devices, host_queue, ids }))
    }

    /// Registry configured from `LATTICE_*` environment variables.
    pub fn from_env() -> Result<Arc<Self>> {
        Self::new(RegistryConfig::from_env())
    }

    fn create_allocator(config: &RegistryConfig, kind: DeviceKind, name: &str) -> Arc<dyn Allocator> {
        let base: Box<dyn Allocator> = match kind {
            DeviceKind::Cpu => Box::new(SystemAllocator::unified(name)),
            DeviceKind::Accelerator => Box::new(SystemAllocator::discrete(name, config.accelerator_memory)),
        };

        // Wrap with the reuse cache (already thread-safe via Mutex)
        Arc::new(CachingAllocator::with_capacity(base, config.cache_capacity))
    }

    fn create_device(
        config: &RegistryConfig,
        ids: &Arc<IdGenerator>,
        index: usize,
        kind: DeviceKind,
        allocator: Arc<dyn Allocator>,
    ) -> Result<Device> {
        let queue_count = match kind {
            DeviceKind::Cpu => config.cpu_queues,
            DeviceKind::Accelerator => config.accelerator_queues,
        };
        let device_name = format!("dev:{index}");

        let queues = (0..queue_count)
            .map(|q| {
                DeviceQueue::new(
                    format!("{device_name}:q{q}"),
                    index,
                    device_name.clone(),
                    config.queue_mode,
                    Arc::clone(&allocator),
                    Arc::clone(ids),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Device::new(index, kind, allocator, queues))
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, index: usize) -> Option<&Device> {
        self.devices.get(index)
    }

    /// The host CPU device (index 0).
    pub fn cpu(&self) -> &Device {
        &self.devices[0]
    }

    /// Look a device up by selector string such as `"CPU"` or `"GPU:1"`.
    pub fn get_device(&self, device: &str) -> Result<&Device> {
        let spec: DeviceSpec = device.parse()?;
        self.device(spec.device_index()).ok_or_else(|| Error::InvalidDevice { device: device.to_string() })
    }

    /// Synchronous host queue used to move application data in and out of buffers.
    pub fn host_queue(&self) -> &DeviceQueue {
        &self.host_queue
    }

    /// Find any queue of this registry by id.
    pub fn queue(&self, id: QueueId) -> Option<&DeviceQueue> {
        std::iter::once(&self.host_queue)
            .chain(self.devices.iter().flat_map(Device::queues))
            .find(|queue| queue.id() == id)
    }

    /// `true` if `queue` is owned by this registry.
    pub fn owns(&self, queue: &DeviceQueue) -> bool {
        self.queue(queue.id()).is_some_and(|owned| std::ptr::eq(owned, queue))
    }

    pub fn ids(&self) -> &IdGenerator {
        &self.ids
    }

    pub fn next_buffer_id(&self) -> BufferId {
        self.ids.next_buffer_id()
    }

    /// Drain every queue of every device.
    pub fn wait_for_completion(&self) -> Result<()> {
        self.host_queue.wait_for_completion()?;
        self.devices.iter().try_for_each(Device::wait_for_completion)
    }
}

//! Ordered command streams bound to one device.
//!
//! A [`DeviceQueue`] accepts copies, kernels and event operations and executes
//! them strictly in submission order. Two modes exist:
//!
//! - **Async**: a dedicated worker thread drains the stream. Submission returns
//!   immediately; failures are reported by the next [`DeviceQueue::wait_for_completion`].
//! - **Sync**: every command runs inline on the submitting thread. Used for the
//!   host data-interchange queue.
//!
//! Queues on different devices (or different queues on the same device) are not
//! ordered relative to each other unless connected by an [`Event`]:
//!
//! ```ignore
//! let event = producer.create_event(EventOptions::empty());
//! producer.record(&event)?;
//! consumer.wait(&event)?;
//! consumer.copy_async(&src, &dst)?;   // runs after all earlier producer work
//! ```

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};
use snafu::ResultExt;

use crate::allocator::Allocator;
use crate::error::{Error, KernelPanickedSnafu, QueueFailedSnafu, QueueShutdownSnafu, Result, SizeMismatchSnafu};
use crate::memory::{DeviceMemory, MemoryType};
use crate::registry::IdGenerator;
use crate::sync::{Event, EventOptions};

/// Unique queue identifier issued by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(pub u64);

/// Execution mode of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum QueueMode {
    /// Commands execute inline on the caller's thread.
    Sync,
    /// Commands execute on the queue's worker thread.
    #[default]
    Async,
}

/// Direction of a copy, derived from the locality of both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    HostToHost,
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
}

impl TransferKind {
    pub fn between(src: MemoryType, dst: MemoryType) -> Self {
        match (src, dst) {
            (MemoryType::Unified, MemoryType::Unified) => Self::HostToHost,
            (MemoryType::Unified, MemoryType::Discrete) => Self::HostToDevice,
            (MemoryType::Discrete, MemoryType::Unified) => Self::DeviceToHost,
            (MemoryType::Discrete, MemoryType::Discrete) => Self::DeviceToDevice,
        }
    }
}

/// Compute work submitted to a queue.
pub type Kernel = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

enum Command {
    Copy { src: Arc<DeviceMemory>, dst: Arc<DeviceMemory>, kind: TransferKind },
    Kernel { name: String, body: Kernel },
    Signal { event: Arc<Event>, generation: u64 },
    Wait { event: Arc<Event>, generation: u64 },
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Copy { src, kind, .. } => {
                f.debug_struct("Copy").field("kind", kind).field("bytes", &src.byte_count()).finish()
            }
            Self::Kernel { name, .. } => f.debug_struct("Kernel").field("name", name).finish(),
            Self::Signal { event, generation } => {
                f.debug_struct("Signal").field("event", &event.id()).field("generation", generation).finish()
            }
            Self::Wait { event, generation } => {
                f.debug_struct("Wait").field("event", &event.id()).field("generation", generation).finish()
            }
        }
    }
}

impl Command {
    fn execute(self) -> Result<()> {
        match self {
            Command::Copy { src, dst, .. } => {
                if !std::ptr::eq(src.as_ptr(), dst.as_ptr()) {
                    // SAFETY: sizes were validated at submission, the ranges belong to
                    // distinct allocations, and queue ordering gives this command
                    // exclusive access to `dst` while it runs.
                    unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_mut_ptr(), src.byte_count()) };
                }
                Ok(())
            }
            Command::Kernel { name, body } => match catch_unwind(AssertUnwindSafe(body)) {
                Ok(result) => result,
                Err(payload) => {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    KernelPanickedSnafu { name, message }.fail()
                }
            },
            Command::Signal { event, generation } => {
                event.complete(generation);
                Ok(())
            }
            Command::Wait { event, generation } => {
                event.wait_for(generation);
                Ok(())
            }
        }
    }
}

#[derive(Debug, Default)]
struct StreamState {
    pending: VecDeque<Command>,
    busy: bool,
    shutdown: bool,
    /// First failure since the last drain.
    error: Option<Error>,
}

/// The ordered command stream shared between a queue and its worker.
#[derive(Debug, Default)]
struct CommandStream {
    state: Mutex<StreamState>,
    work_ready: Condvar,
    idle: Condvar,
    /// Thread draining the stream, set once the worker starts.
    worker: OnceLock<ThreadId>,
}

impl CommandStream {
    fn push(&self, command: Command) -> bool {
        let mut state = self.state.lock();
        if state.shutdown {
            return false;
        }
        state.pending.push_back(command);
        self.work_ready.notify_one();
        true
    }

    /// Worker loop: pop commands in order until shut down and empty.
    fn run(&self, queue: &str) {
        let _ = self.worker.set(std::thread::current().id());
        loop {
            let command = {
                let mut state = self.state.lock();
                loop {
                    if let Some(command) = state.pending.pop_front() {
                        state.busy = true;
                        break command;
                    }
                    if state.shutdown {
                        return;
                    }
                    self.work_ready.wait(&mut state);
                }
            };

            tracing::trace!(queue.name = queue, command = ?command, "execute");
            let result = command.execute();

            let mut state = self.state.lock();
            state.busy = false;
            if let Err(error) = result {
                tracing::error!(queue.name = queue, %error, "queued command failed");
                state.error.get_or_insert(error);
            }
            if state.pending.is_empty() {
                self.idle.notify_all();
            }
        }
    }

    /// `true` when called from inside a command running on this stream.
    fn on_worker(&self) -> bool {
        self.worker.get().is_some_and(|id| *id == std::thread::current().id())
    }

    /// Block until every submitted command has run, leaving any failure in place.
    ///
    /// On the worker itself this returns at once: every command submitted before
    /// the running one has already finished.
    fn wait_idle(&self) {
        if self.on_worker() {
            return;
        }
        let mut state = self.state.lock();
        while state.busy || !state.pending.is_empty() {
            self.idle.wait(&mut state);
        }
    }

    /// Block until every submitted command has run; return the first failure.
    fn drain(&self) -> Result<(), Error> {
        self.wait_idle();
        match self.state.lock().error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.work_ready.notify_all();
    }
}

#[derive(Debug, Default)]
struct QueueStats {
    copies: AtomicUsize,
    bytes_copied: AtomicU64,
    kernels: AtomicUsize,
}

/// An ordered command stream bound to one device.
///
/// # Thread Safety
///
/// Queues are `Send + Sync`; submissions from several threads are serialized by
/// the stream lock, and their relative order is the order the lock was taken.
pub struct DeviceQueue {
    id: QueueId,
    name: String,
    device_index: usize,
    device_name: String,
    mode: QueueMode,
    allocator: Arc<dyn Allocator>,
    ids: Arc<IdGenerator>,
    stream: Arc<CommandStream>,
    worker: Option<JoinHandle<()>>,
    stats: QueueStats,
}

impl std::fmt::Debug for DeviceQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceQueue")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("device_index", &self.device_index)
            .field("mode", &self.mode)
            .finish()
    }
}

impl DeviceQueue {
    pub(crate) fn new(
        name: String,
        device_index: usize,
        device_name: String,
        mode: QueueMode,
        allocator: Arc<dyn Allocator>,
        ids: Arc<IdGenerator>,
    ) -> Result<Self> {
        let id = ids.next_queue_id();
        let stream = Arc::new(CommandStream::default());

        let worker = match mode {
            QueueMode::Sync => None,
            QueueMode::Async => {
                let stream = Arc::clone(&stream);
                let worker_name = name.clone();
                let handle = std::thread::Builder::new()
                    .name(name.clone())
                    .spawn(move || stream.run(&worker_name))
                    .context(crate::error::SpawnWorkerSnafu { queue: name.clone() })?;
                Some(handle)
            }
        };

        tracing::debug!(queue.id = id.0, queue.name = %name, device.index = device_index, mode = ?mode, "queue created");

        Ok(Self { id, name, device_index, device_name, mode, allocator, ids, stream, worker, stats: QueueStats::default() })
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_index(&self) -> usize {
        self.device_index
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn memory_type(&self) -> MemoryType {
        self.allocator.memory_type()
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    pub fn is_async(&self) -> bool {
        self.mode == QueueMode::Async
    }

    /// Copies submitted to this queue so far.
    pub fn copy_count(&self) -> usize {
        self.stats.copies.load(Ordering::Relaxed)
    }

    pub fn bytes_copied(&self) -> u64 {
        self.stats.bytes_copied.load(Ordering::Relaxed)
    }

    pub fn kernel_count(&self) -> usize {
        self.stats.kernels.load(Ordering::Relaxed)
    }

    /// Allocate `byte_count` bytes on this queue's device.
    pub fn allocate(&self, byte_count: usize) -> Result<Arc<DeviceMemory>> {
        let block = self.allocator.alloc(byte_count)?;
        Ok(Arc::new(DeviceMemory::new(
            block,
            byte_count,
            self.device_index,
            self.allocator.memory_type(),
            Arc::clone(&self.allocator),
        )))
    }

    /// Copy `src` into `dst`, blocking until the copy (and all earlier work) is done.
    pub fn copy(&self, src: &Arc<DeviceMemory>, dst: &Arc<DeviceMemory>) -> Result<()> {
        self.copy_async(src, dst)?;
        self.wait_for_completion()
    }

    /// Enqueue a copy of `src` into `dst`.
    pub fn copy_async(&self, src: &Arc<DeviceMemory>, dst: &Arc<DeviceMemory>) -> Result<()> {
        let expected = dst.byte_count();
        let actual = src.byte_count();
        snafu::ensure!(expected == actual, SizeMismatchSnafu { expected, actual });

        let kind = TransferKind::between(src.memory_type(), dst.memory_type());
        self.stats.copies.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_copied.fetch_add(actual as u64, Ordering::Relaxed);

        tracing::debug!(
            queue.name = %self.name,
            src.device = src.device_index(),
            dst.device = dst.device_index(),
            transfer = ?kind,
            bytes = actual,
            "copy"
        );

        self.submit(Command::Copy { src: Arc::clone(src), dst: Arc::clone(dst), kind })
    }

    /// Enqueue a compute kernel.
    ///
    /// On a sync queue the kernel runs before this returns and its result is returned
    /// directly. On an async queue failures surface at the next drain.
    pub fn dispatch<F>(&self, name: impl Into<String>, kernel: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let name = name.into();
        self.stats.kernels.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(queue.name = %self.name, kernel.name = %name, "dispatch");
        self.submit(Command::Kernel { name, body: Box::new(kernel) })
    }

    pub fn create_event(&self, options: EventOptions) -> Arc<Event> {
        Arc::new(Event::new(self.ids.next_event_id(), options))
    }

    /// Record `event` at the current end of this queue.
    ///
    /// The event is signaled once every command submitted before it has completed.
    pub fn record(&self, event: &Arc<Event>) -> Result<Arc<Event>> {
        let generation = event.arm();
        self.submit(Command::Signal { event: Arc::clone(event), generation })?;
        Ok(Arc::clone(event))
    }

    /// Make subsequent work on this queue wait for `event`'s current generation.
    ///
    /// On a sync queue this blocks the caller.
    pub fn wait(&self, event: &Arc<Event>) -> Result<()> {
        let generation = event.generation();
        self.submit(Command::Wait { event: Arc::clone(event), generation })
    }

    /// Block until every operation submitted to this queue has finished.
    pub fn wait_for_completion(&self) -> Result<()> {
        self.stream.drain().context(QueueFailedSnafu { queue: self.name.clone() })
    }

    /// Block until the queue is idle without consuming a pending failure.
    ///
    /// The failure stays queued for the next [`wait_for_completion`](Self::wait_for_completion).
    pub fn wait_idle(&self) {
        self.stream.wait_idle();
    }

    fn submit(&self, command: Command) -> Result<()> {
        match self.mode {
            QueueMode::Sync => {
                tracing::trace!(queue.name = %self.name, command = ?command, "execute");
                command.execute()
            }
            QueueMode::Async => {
                snafu::ensure!(self.stream.push(command), QueueShutdownSnafu { queue: self.name.clone() });
                Ok(())
            }
        }
    }
}

impl Drop for DeviceQueue {
    fn drop(&mut self) {
        self.stream.shutdown();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::error!(queue.name = %self.name, "queue worker panicked");
        }
    }
}

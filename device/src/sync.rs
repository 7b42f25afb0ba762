//! Cross-queue synchronization events.
//!
//! An [`Event`] is a broadcast completion token built on a monotonically
//! increasing generation counter, the same shape as a timeline signal:
//!
//! - `armed` is the newest generation anyone may wait for. A fresh event starts
//!   armed at generation 1, so it is unsignaled until someone signals it.
//! - `signaled` is the newest generation that has completed.
//!
//! Recording an event on a queue arms a new generation and enqueues its
//! completion. Waiters capture the armed generation when they start waiting and
//! return once `signaled` reaches it, so every current and late waiter of a
//! generation passes (broadcast), and re-recording for a new generation never
//! releases or strands waiters of an older one.
//!
//! # Example
//!
//! ```ignore
//! let event = producer.create_event(EventOptions::empty());
//! producer.record(&event)?;   // completes after all prior producer work
//! consumer.wait(&event)?;     // consumer work after this point is ordered
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use enumset::{EnumSet, EnumSetType};
use parking_lot::{Condvar, Mutex};

/// Unique event identifier issued by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u64);

#[derive(Debug, Hash, PartialOrd, Ord, EnumSetType)]
pub enum EventOption {
    /// Record the completion instant so elapsed time between events can be measured.
    Timing,
    /// Poll with `yield_now` instead of parking the waiting thread.
    SpinWait,
}

pub type EventOptions = EnumSet<EventOption>;

#[derive(Debug)]
pub struct Event {
    id: EventId,
    options: EventOptions,
    armed: AtomicU64,
    signaled: AtomicU64,
    /// Mutex for condvar waiting (protects nothing, just for condvar).
    mutex: Mutex<()>,
    condvar: Condvar,
    completed_at: Mutex<Option<Instant>>,
}

impl Event {
    pub fn new(id: EventId, options: EventOptions) -> Self {
        Self {
            id,
            options,
            armed: AtomicU64::new(1),
            signaled: AtomicU64::new(0),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
            completed_at: Mutex::new(None),
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn options(&self) -> EventOptions {
        self.options
    }

    /// `true` once the newest armed generation has been signaled.
    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire) >= self.armed.load(Ordering::Acquire)
    }

    /// Generation a waiter arriving now has to wait for.
    pub fn generation(&self) -> u64 {
        self.armed.load(Ordering::Acquire)
    }

    /// Arm the next generation. Called by a queue when the event is recorded.
    pub(crate) fn arm(&self) -> u64 {
        self.armed.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Signal the newest armed generation.
    ///
    /// Signaling an already signaled event is a no-op for its waiters.
    pub fn signal(&self) {
        self.complete(self.armed.load(Ordering::Acquire));
    }

    /// Mark `generation` (and every older one) as complete and wake all waiters.
    pub(crate) fn complete(&self, generation: u64) {
        if self.options.contains(EventOption::Timing) {
            *self.completed_at.lock() = Some(Instant::now());
        }

        let previous = self.signaled.fetch_max(generation, Ordering::AcqRel);
        if previous < generation {
            // Take the lock so a waiter between its check and `wait` cannot miss the wakeup.
            let _guard = self.mutex.lock();
            self.condvar.notify_all();
        }
    }

    /// Block until the generation armed at call time has been signaled.
    pub fn wait(&self) {
        self.wait_for(self.generation());
    }

    /// Block until `generation` has been signaled.
    pub(crate) fn wait_for(&self, generation: u64) {
        if self.signaled.load(Ordering::Acquire) >= generation {
            return;
        }

        if self.options.contains(EventOption::SpinWait) {
            while self.signaled.load(Ordering::Acquire) < generation {
                std::thread::yield_now();
            }
            return;
        }

        let mut guard = self.mutex.lock();
        while self.signaled.load(Ordering::Acquire) < generation {
            self.condvar.wait(&mut guard);
        }
    }

    /// Instant of the most recent completion, if this event records timing.
    pub fn completed_at(&self) -> Option<Instant> {
        *self.completed_at.lock()
    }

    /// Time between the completion of `earlier` and the completion of `self`.
    ///
    /// Returns `None` unless both events were created with [`EventOption::Timing`] and
    /// have completed.
    pub fn elapsed_since(&self, earlier: &Event) -> Option<Duration> {
        let end = self.completed_at()?;
        let start = earlier.completed_at()?;
        Some(end.saturating_duration_since(start))
    }
}

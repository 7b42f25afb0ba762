use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::test::registry;
use crate::{Error, EventOption, EventOptions, MemoryType, QueueMode, TransferKind};

#[test]
fn test_async_queue_preserves_program_order() {
    let registry = registry(0, QueueMode::Async);
    let queue = registry.cpu().default_queue();
    let log = Arc::new(Mutex::new(Vec::new()));

    for i in 0..64 {
        let log = Arc::clone(&log);
        queue
            .dispatch(format!("push{i}"), move || {
                if i % 7 == 0 {
                    std::thread::sleep(Duration::from_micros(200));
                }
                log.lock().push(i);
                Ok(())
            })
            .unwrap();
    }

    queue.wait_for_completion().unwrap();
    assert_eq!(*log.lock(), (0..64).collect::<Vec<_>>());
    assert_eq!(queue.kernel_count(), 64);
}

#[test]
fn test_sync_queue_executes_inline() {
    let registry = registry(0, QueueMode::Sync);
    let queue = registry.cpu().default_queue();
    let ran = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&ran);
    queue
        .dispatch("inline", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    // No drain needed
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert!(!queue.is_async());
}

#[test]
fn test_sync_queue_returns_kernel_error_directly() {
    let registry = registry(0, QueueMode::Sync);
    let err = registry
        .host_queue()
        .dispatch("fails", || crate::error::KernelSnafu { name: "fails", reason: "nope" }.fail())
        .unwrap_err();
    assert!(matches!(err, Error::Kernel { .. }));
}

#[test]
fn test_async_error_reported_once_at_drain() {
    let registry = registry(0, QueueMode::Async);
    let queue = registry.cpu().default_queue();

    queue.dispatch("fails", || crate::error::KernelSnafu { name: "fails", reason: "nope" }.fail()).unwrap();
    queue.dispatch("ok", || Ok(())).unwrap();

    let err = queue.wait_for_completion().unwrap_err();
    match err {
        Error::QueueFailed { source, .. } => assert!(matches!(*source, Error::Kernel { .. })),
        other => panic!("unexpected error: {other}"),
    }

    // The failure has been reported
    queue.wait_for_completion().unwrap();
}

#[test]
fn test_kernel_panic_is_caught() {
    let registry = registry(0, QueueMode::Async);
    let queue = registry.cpu().default_queue();

    queue.dispatch("explodes", || panic!("boom")).unwrap();
    let err = queue.wait_for_completion().unwrap_err();
    match err {
        Error::QueueFailed { source, .. } => match *source {
            Error::KernelPanicked { name, message } => {
                assert_eq!(name, "explodes");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected source: {other}"),
        },
        other => panic!("unexpected error: {other}"),
    }

    // Worker survives the panic
    queue.dispatch("after", || Ok(())).unwrap();
    queue.wait_for_completion().unwrap();
}

#[test]
fn test_copy_between_devices() {
    let registry = registry(1, QueueMode::Async);
    let host = registry.cpu().default_queue();
    let accelerator = registry.device(1).unwrap().default_queue();

    let src = host.allocate(16).unwrap();
    let dst = accelerator.allocate(16).unwrap();
    assert_eq!(src.memory_type(), MemoryType::Unified);
    assert_eq!(dst.memory_type(), MemoryType::Discrete);

    unsafe { src.as_mut_slice::<u32>() }.copy_from_slice(&[1, 2, 3, 4]);
    accelerator.copy(&src, &dst).unwrap();
    assert_eq!(unsafe { dst.as_slice::<u32>() }, &[1, 2, 3, 4]);

    assert_eq!(accelerator.copy_count(), 1);
    assert_eq!(accelerator.bytes_copied(), 16);
}

#[test]
fn test_copy_size_mismatch() {
    let registry = registry(0, QueueMode::Sync);
    let queue = registry.host_queue();
    let src = queue.allocate(8).unwrap();
    let dst = queue.allocate(16).unwrap();

    let err = queue.copy_async(&src, &dst).unwrap_err();
    assert!(matches!(err, Error::SizeMismatch { expected: 16, actual: 8 }));
    assert_eq!(queue.copy_count(), 0);
}

#[test]
fn test_transfer_kind() {
    use MemoryType::*;
    assert_eq!(TransferKind::between(Unified, Unified), TransferKind::HostToHost);
    assert_eq!(TransferKind::between(Unified, Discrete), TransferKind::HostToDevice);
    assert_eq!(TransferKind::between(Discrete, Unified), TransferKind::DeviceToHost);
    assert_eq!(TransferKind::between(Discrete, Discrete), TransferKind::DeviceToDevice);
}

#[test]
fn test_event_orders_queues() {
    let registry = crate::DeviceRegistry::new(crate::RegistryConfig::builder().accelerators(1).accelerator_queues(2).build())
        .unwrap();
    let device = registry.device(1).unwrap();
    let producer = device.queue(0).unwrap();
    let consumer = device.queue(1).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    {
        let log = Arc::clone(&log);
        producer
            .dispatch("slow", move || {
                std::thread::sleep(Duration::from_millis(20));
                log.lock().push("producer");
                Ok(())
            })
            .unwrap();
    }

    let event = producer.create_event(EventOptions::empty());
    producer.record(&event).unwrap();
    consumer.wait(&event).unwrap();

    {
        let log = Arc::clone(&log);
        consumer
            .dispatch("fast", move || {
                log.lock().push("consumer");
                Ok(())
            })
            .unwrap();
    }

    consumer.wait_for_completion().unwrap();
    assert_eq!(*log.lock(), vec!["producer", "consumer"]);
    assert!(event.is_signaled());
}

#[test]
fn test_recorded_event_timing() {
    let registry = registry(0, QueueMode::Async);
    let queue = registry.cpu().default_queue();

    let start = queue.create_event(EventOption::Timing.into());
    let end = queue.create_event(EventOption::Timing.into());
    assert_ne!(start.id(), end.id());

    queue.record(&start).unwrap();
    queue.dispatch("work", || {
        std::thread::sleep(Duration::from_millis(5));
        Ok(())
    })
    .unwrap();
    queue.record(&end).unwrap();
    queue.wait_for_completion().unwrap();

    assert!(end.elapsed_since(&start).unwrap() >= Duration::from_millis(4));
}

#[test]
fn test_event_rerecord_arms_new_generation() {
    let registry = registry(0, QueueMode::Async);
    let queue = registry.cpu().default_queue();
    let event = queue.create_event(EventOptions::empty());

    queue.record(&event).unwrap();
    queue.wait_for_completion().unwrap();
    assert!(event.is_signaled());

    let gate = Arc::new(crate::Event::new(crate::EventId(u64::MAX), EventOptions::empty()));
    queue.wait(&gate).unwrap();
    queue.record(&event).unwrap();
    assert!(!event.is_signaled());

    gate.signal();
    event.wait();
    assert!(event.is_signaled());
}

#[test]
fn test_drop_drains_pending_work() {
    let ran = Arc::new(AtomicUsize::new(0));
    {
        let registry = registry(0, QueueMode::Async);
        let queue = registry.cpu().default_queue();
        for _ in 0..8 {
            let ran = Arc::clone(&ran);
            queue
                .dispatch("count", move || {
                    std::thread::sleep(Duration::from_millis(1));
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }
    }
    assert_eq!(ran.load(Ordering::SeqCst), 8);
}

#[test]
fn test_wait_idle_keeps_failure() {
    let registry = registry(0, QueueMode::Async);
    let queue = registry.cpu().default_queue();

    queue.dispatch("fails", || crate::error::KernelSnafu { name: "fails", reason: "nope" }.fail()).unwrap();
    queue.wait_idle();
    queue.wait_idle();

    assert!(matches!(queue.wait_for_completion(), Err(Error::QueueFailed { .. })));
    queue.wait_for_completion().unwrap();
}

#[test]
fn test_wait_from_own_worker_returns() {
    let registry = registry(0, QueueMode::Async);
    let queue = registry.cpu().default_queue();
    let (tx, rx) = std::sync::mpsc::channel();

    // The kernel only needs a handle to the registry to reach its own queue.
    let inner = Arc::clone(&registry);
    queue
        .dispatch("self_wait", move || {
            let own = inner.cpu().default_queue();
            own.wait_idle();
            let drained = own.wait_for_completion();
            tx.send(drained.is_ok()).unwrap();
            Ok(())
        })
        .unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(true));
    queue.wait_for_completion().unwrap();
}

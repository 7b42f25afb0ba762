use test_case::test_case;

use crate::test::registry;
use crate::{DeviceKind, DeviceRegistry, DeviceSpec, Error, MemoryType, QueueMode, RegistryConfig};

#[test_case("CPU", DeviceSpec::Cpu; "cpu")]
#[test_case("cpu:0", DeviceSpec::Cpu; "cpu explicit ordinal")]
#[test_case("GPU", DeviceSpec::Accelerator(0); "gpu default ordinal")]
#[test_case("acc:2", DeviceSpec::Accelerator(2); "accelerator ordinal")]
#[test_case(" dev:3 ", DeviceSpec::Index(3); "device index")]
fn test_device_spec_parse(input: &str, expected: DeviceSpec) {
    assert_eq!(input.parse::<DeviceSpec>().unwrap(), expected);
}

#[test_case(""; "empty")]
#[test_case("TPU"; "unknown kind")]
#[test_case("GPU:x"; "bad ordinal")]
#[test_case("CPU:1"; "second cpu")]
#[test_case("DEV"; "missing index")]
#[test_case("GPU:0:1"; "too many parts")]
fn test_device_spec_parse_invalid(input: &str) {
    assert!(matches!(input.parse::<DeviceSpec>(), Err(Error::InvalidDevice { .. })));
}

#[test]
fn test_device_spec_index() {
    assert_eq!(DeviceSpec::Cpu.device_index(), 0);
    assert_eq!(DeviceSpec::Accelerator(0).device_index(), 1);
    assert_eq!(DeviceSpec::Index(4).device_index(), 4);
}

#[test]
fn test_registry_topology() {
    let config = RegistryConfig::builder().cpu_queues(2).accelerators(2).accelerator_queues(3).build();
    let registry = DeviceRegistry::new(config).unwrap();

    assert_eq!(registry.devices().len(), 3);

    let cpu = registry.cpu();
    assert_eq!(cpu.index(), 0);
    assert_eq!(cpu.name(), "dev:0");
    assert_eq!(cpu.kind(), DeviceKind::Cpu);
    assert_eq!(cpu.memory_type(), MemoryType::Unified);
    assert_eq!(cpu.queues().len(), 2);

    for index in 1..3 {
        let device = registry.device(index).unwrap();
        assert_eq!(device.kind(), DeviceKind::Accelerator);
        assert_eq!(device.memory_type(), MemoryType::Discrete);
        assert_eq!(device.queues().len(), 3);
        assert!(device.queues().iter().all(|q| q.device_index() == index && q.is_async()));
    }

    assert!(registry.device(3).is_none());
}

#[test]
fn test_host_queue_is_sync_on_cpu() {
    let registry = registry(1, QueueMode::Async);
    let host = registry.host_queue();

    assert_eq!(host.mode(), QueueMode::Sync);
    assert_eq!(host.device_index(), 0);
    assert_eq!(host.memory_type(), MemoryType::Unified);
    assert!(registry.owns(host));
}

#[test]
fn test_queue_ids_are_unique_and_resolvable() {
    let registry = DeviceRegistry::new(RegistryConfig::builder().cpu_queues(2).accelerators(2).build()).unwrap();

    let mut ids: Vec<_> = std::iter::once(registry.host_queue())
        .chain(registry.devices().iter().flat_map(|d| d.queues()))
        .map(|q| q.id())
        .collect();
    for &id in &ids {
        assert_eq!(registry.queue(id).unwrap().id(), id);
    }

    let total = ids.len();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), total);
}

#[test]
fn test_foreign_queue_not_owned() {
    let a = registry(0, QueueMode::Sync);
    let b = registry(0, QueueMode::Sync);

    // Same id, different registry
    assert_eq!(a.host_queue().id(), b.host_queue().id());
    assert!(!a.owns(b.host_queue()));
}

#[test]
fn test_get_device() {
    let registry = registry(2, QueueMode::Async);

    assert_eq!(registry.get_device("CPU").unwrap().index(), 0);
    assert_eq!(registry.get_device("GPU:1").unwrap().index(), 2);
    assert_eq!(registry.get_device("dev:1").unwrap().index(), 1);
    assert!(matches!(registry.get_device("GPU:2"), Err(Error::InvalidDevice { .. })));
}

#[test]
fn test_invalid_config_rejected() {
    let err = DeviceRegistry::new(RegistryConfig::builder().cpu_queues(0).build()).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig { .. }));
}

#[test]
fn test_registry_wait_for_completion() {
    let registry = registry(1, QueueMode::Async);
    for device in registry.devices() {
        device.default_queue().dispatch("noop", || Ok(())).unwrap();
    }
    registry.wait_for_completion().unwrap();
}

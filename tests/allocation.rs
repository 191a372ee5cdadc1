//! Allocation callback symmetry across create/destroy and failure paths.

mod common;

use std::sync::Arc;

use common::{init_logging, join_paths, write_driver_manifest, write_layer_manifest};
use vulkan_loader::allocation::{Allocator, TrackingAllocator};
use vulkan_loader::environment::{FixedEnv, VK_DRIVER_FILES, VK_LAYER_PATH};
use vulkan_loader::testing::{MockDriver, MockDriverLoader};
use vulkan_loader::{InstanceCreateInfo, Loader, LoaderError};

struct Fixture {
    _driver_dir: tempfile::TempDir,
    _explicit_dir: tempfile::TempDir,
    tracker: Arc<TrackingAllocator>,
    loader: Loader,
}

fn fixture() -> Fixture {
    init_logging();
    let driver_dir = tempfile::tempdir().unwrap();
    let explicit_dir = tempfile::tempdir().unwrap();
    let manifest = write_driver_manifest(driver_dir.path(), "driver.json", "libmock.so");
    write_layer_manifest(explicit_dir.path(), "a.json", "VK_LAYER_test_a", "");

    let env = FixedEnv::new()
        .set(VK_DRIVER_FILES, &join_paths(&[&manifest]))
        .set(VK_LAYER_PATH, &explicit_dir.path().display().to_string());
    let tracker = TrackingAllocator::new();
    let backend = MockDriver::builder()
        .physical_device(Default::default())
        .build_arc();
    let loader = Loader::builder()
        .env(env)
        .driver_loader(MockDriverLoader::new().register("libmock.so", backend))
        .allocator(tracker.clone() as Arc<dyn Allocator>)
        .build();
    Fixture {
        _driver_dir: driver_dir,
        _explicit_dir: explicit_dir,
        tracker,
        loader,
    }
}

fn create_info() -> InstanceCreateInfo {
    InstanceCreateInfo {
        enabled_layer_names: vec!["VK_LAYER_test_a".into()],
        ..Default::default()
    }
}

#[test]
fn test_instance_lifetime_is_symmetric() {
    let fx = fixture();
    let instance = fx.loader.create_instance(&create_info()).unwrap();
    assert!(fx.tracker.outstanding() > 0);
    drop(instance);
    assert_eq!(fx.tracker.outstanding(), 0);
}

#[test]
fn test_failure_at_every_allocation_index_leaks_nothing() {
    // Establish the allocation count of a successful creation, then fail
    // each index in turn; whatever the failure point, nothing may leak.
    let fx = fixture();
    let instance = fx.loader.create_instance(&create_info()).unwrap();
    drop(instance);
    let calls = fx.tracker.call_count();
    assert!(calls > 0);
    assert_eq!(fx.tracker.outstanding(), 0);

    for failing_index in 0..calls {
        let fx = fixture();
        fx.tracker.fail_on_call(failing_index);
        let result = fx.loader.create_instance(&create_info());
        assert!(
            matches!(result, Err(LoaderError::OutOfHostMemory)),
            "failure injected at allocation {failing_index} did not surface"
        );
        assert_eq!(
            fx.tracker.outstanding(),
            0,
            "allocations leaked when call {failing_index} failed"
        );
    }
}

#[test]
fn test_device_lifetime_is_symmetric() {
    let fx = fixture();
    let instance = fx.loader.create_instance(&create_info()).unwrap();
    let mut count = 0;
    instance.enumerate_physical_devices(&mut count, None);
    let mut handles = vec![vulkan_loader::physical_device::PhysicalDeviceHandle(0); count as usize];
    instance.enumerate_physical_devices(&mut count, Some(&mut handles));

    let after_instance = fx.tracker.outstanding();
    let device = instance
        .create_device(handles[0], &Default::default())
        .unwrap();
    assert!(fx.tracker.outstanding() > after_instance);
    drop(device);
    assert_eq!(fx.tracker.outstanding(), after_instance);
    drop(instance);
    assert_eq!(fx.tracker.outstanding(), 0);
}

#[test]
fn test_device_creation_failure_leaks_nothing() {
    let fx = fixture();
    let instance = fx.loader.create_instance(&create_info()).unwrap();
    let mut count = 0;
    instance.enumerate_physical_devices(&mut count, None);
    let mut handles = vec![vulkan_loader::physical_device::PhysicalDeviceHandle(0); count as usize];
    instance.enumerate_physical_devices(&mut count, Some(&mut handles));
    let baseline = fx.tracker.outstanding();

    fx.tracker.fail_on_call(fx.tracker.call_count());
    let result = instance.create_device(handles[0], &Default::default());
    assert!(matches!(result, Err(LoaderError::OutOfHostMemory)));
    assert_eq!(fx.tracker.outstanding(), baseline);
}

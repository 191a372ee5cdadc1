//! Logical device lifecycle
//!
//! A [`Device`] owns its dispatch chain, built once at creation from the
//! instance's active layers and the owning driver. The chain is immutable
//! for the device's lifetime; `get_device_proc_addr` answers from it
//! without taking any lock, so the pointer for a command never changes
//! while the device lives.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::allocation::{AllocationScope, Allocator, CommittedAllocations, ScopedAllocations};
use crate::chain::{DeviceChain, InstanceChain};
use crate::environment::EnvSource;
use crate::error::{LoaderError, Result};
use crate::icd::{DeviceToken, DriverBackend, ProcAddr};
use crate::physical_device::{DeviceKey, PhysicalDeviceHandle, PhysicalDeviceIndex};
use crate::terminator::Terminator;

/// What the application asks for at device creation.
#[derive(Debug, Clone, Default)]
pub struct DeviceCreateInfo {
    pub enabled_extension_names: Vec<String>,
    /// Device layers were removed from Vulkan; names given here are
    /// ignored, matching the deprecated-but-tolerated behavior.
    pub enabled_layer_names: Vec<String>,
}

/// One created logical device.
pub struct Device {
    chain: DeviceChain,
    backend: Arc<dyn DriverBackend>,
    token: DeviceToken,
    enabled_extensions: Vec<String>,
    allocations: CommittedAllocations,
}

impl Device {
    /// `vkGetDeviceProcAddr` for this device. Lock-free; stable for the
    /// device's lifetime.
    pub fn get_device_proc_addr(&self, name: &str) -> Option<ProcAddr> {
        self.chain.get_device_proc_addr(name)
    }

    pub fn enabled_extensions(&self) -> &[String] {
        &self.enabled_extensions
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.backend.destroy_device(self.token);
        self.allocations.release_all();
    }
}

pub(crate) fn create_device(
    chain: &InstanceChain,
    terminator: &Terminator,
    devices: &Mutex<PhysicalDeviceIndex>,
    allocator: Arc<dyn Allocator>,
    env: &dyn EnvSource,
    handle: PhysicalDeviceHandle,
    create_info: &DeviceCreateInfo,
) -> Result<Device> {
    if !create_info.enabled_layer_names.is_empty() {
        log::warn!(
            "Device layers are deprecated; ignoring {:?}",
            create_info.enabled_layer_names
        );
    }

    let key = {
        let mut index = devices.lock();
        if index.resolve(handle).is_none() {
            // Tolerate a handle from a previous enumeration cycle
            index.refresh(terminator.drivers(), chain.physical_device_hooks(), env);
        }
        index
            .resolve(handle)
            .map(|d| d.key.clone())
            .ok_or(LoaderError::InitializationFailed)?
    };

    let (driver_index, local) = match key {
        DeviceKey::Driver { driver, local } => (driver, local),
        DeviceKey::Layer { layer, .. } => {
            log::warn!("Physical device injected by layer \"{layer}\" cannot create a device");
            return Err(LoaderError::InitializationFailed);
        }
    };
    let driver = terminator
        .drivers()
        .get(driver_index)
        .ok_or(LoaderError::InitializationFailed)?;

    // Extension must exist on the driver or be provided by an active layer
    let driver_extensions = terminator.device_extensions(driver_index, local);
    for name in &create_info.enabled_extension_names {
        let from_driver = driver_extensions.iter().any(|e| &e.name == name);
        let from_layer = chain.layers().iter().any(|l| {
            l.record
                .device_extensions
                .iter()
                .any(|e| &e.name == name)
        });
        if !from_driver && !from_layer {
            return Err(LoaderError::ExtensionNotPresent(name.clone()));
        }
    }

    let mut staged = ScopedAllocations::new(allocator);
    staged.allocate(std::mem::size_of::<Device>(), AllocationScope::Device)?;
    for _ in &create_info.enabled_extension_names {
        staged.allocate(64, AllocationScope::Object)?;
    }

    // The driver only sees the extensions it implements itself
    let driver_requested: Vec<String> = create_info
        .enabled_extension_names
        .iter()
        .filter(|name| driver_extensions.iter().any(|e| &e.name == *name))
        .cloned()
        .collect();
    let token = driver.backend.create_device(local, &driver_requested)?;

    let device_chain = DeviceChain::build(
        chain.layers(),
        driver,
        token,
        &create_info.enabled_extension_names,
    );

    log::debug!(
        "Created device on driver {} local index {}",
        driver.manifest.library_path.display(),
        local
    );

    Ok(Device {
        chain: device_chain,
        backend: Arc::clone(&driver.backend),
        token,
        enabled_extensions: create_info.enabled_extension_names.clone(),
        allocations: staged.commit(),
    })
}

//! Terminator: the bottom of every call chain
//!
//! After the last layer, calls land here and fan out across the loaded
//! drivers in registration order. This module also owns the two-call
//! enumeration idiom every array-returning query goes through, and the
//! cross-driver aggregation of extension properties.

use crate::error::{LoaderError, Result, VkResult};
use crate::icd::DriverHandle;
use crate::manifest::ExtensionProperties;
use crate::ApiVersion;

/// The count-query / fill pattern shared by all enumeration entry points.
///
/// With no buffer the available count is written and the call succeeds.
/// With a buffer, at most `*count` elements are written, `*count` is
/// updated to the number actually written, and a partial write reports
/// [`VkResult::Incomplete`]. The source is never truncated on the loader
/// side; a caller looping count-then-fill always converges.
pub fn two_call<T: Clone>(available: &[T], count: &mut u32, buffer: Option<&mut [T]>) -> VkResult {
    match buffer {
        None => {
            *count = available.len() as u32;
            VkResult::Success
        }
        Some(buffer) => {
            let capacity = (*count as usize).min(buffer.len());
            let written = capacity.min(available.len());
            buffer[..written].clone_from_slice(&available[..written]);
            *count = written as u32;
            if written < available.len() {
                VkResult::Incomplete
            } else {
                VkResult::Success
            }
        }
    }
}

/// Merge extension lists, first occurrence of a name wins.
pub fn merge_extensions(
    mut base: Vec<ExtensionProperties>,
    extra: impl IntoIterator<Item = ExtensionProperties>,
) -> Vec<ExtensionProperties> {
    for ext in extra {
        if !base.iter().any(|e| e.name == ext.name) {
            base.push(ext);
        }
    }
    base
}

/// Fan-out endpoint over the drivers loaded for one instance.
pub struct Terminator {
    drivers: Vec<DriverHandle>,
    instance_live: bool,
}

impl Terminator {
    pub fn new(drivers: Vec<DriverHandle>) -> Self {
        Self {
            drivers,
            instance_live: false,
        }
    }

    /// Drivers that survived instance creation, registration order.
    pub fn drivers(&self) -> &[DriverHandle] {
        &self.drivers
    }

    /// Union of instance extensions across all drivers.
    pub fn instance_extensions(&self) -> Vec<ExtensionProperties> {
        let mut merged = Vec::new();
        for driver in &self.drivers {
            merged = merge_extensions(merged, driver.backend.enumerate_instance_extensions());
        }
        merged
    }

    /// Create the driver-side instances. Each driver is handed only the
    /// extensions it advertises itself; a driver that fails is dropped
    /// with a warning. Every driver failing fails the call.
    pub fn create_instances(
        &mut self,
        api_version: ApiVersion,
        extensions: &[String],
    ) -> Result<()> {
        let mut survivors = Vec::with_capacity(self.drivers.len());
        for driver in self.drivers.drain(..) {
            let advertised = driver.backend.enumerate_instance_extensions();
            let supported: Vec<String> = extensions
                .iter()
                .filter(|name| advertised.iter().any(|e| &e.name == *name))
                .cloned()
                .collect();
            match driver.backend.create_instance(api_version, &supported) {
                Ok(()) => survivors.push(driver),
                Err(e) => {
                    log::warn!(
                        "Driver {} failed instance creation: {e}",
                        driver.manifest.library_path.display()
                    );
                }
            }
        }
        if survivors.is_empty() {
            return Err(LoaderError::IncompatibleDriver);
        }
        self.drivers = survivors;
        self.instance_live = true;
        Ok(())
    }

    pub fn destroy_instances(&mut self) {
        if !self.instance_live {
            return;
        }
        for driver in &self.drivers {
            driver.backend.destroy_instance();
        }
        self.instance_live = false;
    }

    /// Device extensions of one driver-local physical device.
    pub fn device_extensions(
        &self,
        driver_index: usize,
        local_device: u32,
    ) -> Vec<ExtensionProperties> {
        self.drivers
            .get(driver_index)
            .map(|d| d.backend.enumerate_device_extensions(local_device))
            .unwrap_or_default()
    }
}

impl Drop for Terminator {
    fn drop(&mut self) {
        self.destroy_instances();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDriver;

    #[test]
    fn test_two_call_count_query() {
        let source = [1u32, 2, 3];
        let mut count = 0;
        assert_eq!(two_call(&source, &mut count, None), VkResult::Success);
        assert_eq!(count, 3);
    }

    #[test]
    fn test_two_call_short_buffer_is_incomplete() {
        let source = [1u32, 2, 3];
        let mut buffer = [0u32; 2];
        let mut count = 2;
        assert_eq!(
            two_call(&source, &mut count, Some(&mut buffer)),
            VkResult::Incomplete
        );
        assert_eq!(count, 2);
        assert_eq!(buffer, [1, 2]);
    }

    #[test]
    fn test_two_call_exact_and_oversized_buffers() {
        let source = [1u32, 2, 3];
        let mut buffer = [0u32; 5];
        let mut count = 5;
        assert_eq!(
            two_call(&source, &mut count, Some(&mut buffer)),
            VkResult::Success
        );
        assert_eq!(count, 3);
        assert_eq!(&buffer[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_instance_extensions_dedup_across_drivers() {
        let a = MockDriver::builder()
            .instance_extension("VK_KHR_surface", 25)
            .instance_extension("VK_KHR_xcb_surface", 6)
            .build_handle();
        let b = MockDriver::builder()
            .instance_extension("VK_KHR_surface", 24)
            .instance_extension("VK_EXT_debug_utils", 2)
            .build_handle();
        let terminator = Terminator::new(vec![a, b]);
        let merged = terminator.instance_extensions();
        let names: Vec<_> = merged.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            ["VK_KHR_surface", "VK_KHR_xcb_surface", "VK_EXT_debug_utils"]
        );
        // first driver's spec version wins for the shared name
        assert_eq!(merged[0].spec_version, 25);
    }

    #[test]
    fn test_failing_driver_is_dropped_not_fatal() {
        let good = MockDriver::builder().build_handle();
        let bad = MockDriver::builder().fail_create_instance().build_handle();
        let mut terminator = Terminator::new(vec![bad, good]);
        terminator
            .create_instances(ApiVersion::VK_1_1, &[])
            .unwrap();
        assert_eq!(terminator.drivers().len(), 1);
    }

    #[test]
    fn test_all_drivers_failing_is_incompatible() {
        let bad = MockDriver::builder().fail_create_instance().build_handle();
        let mut terminator = Terminator::new(vec![bad]);
        let err = terminator.create_instances(ApiVersion::VK_1_1, &[]);
        assert!(matches!(err, Err(LoaderError::IncompatibleDriver)));
    }
}

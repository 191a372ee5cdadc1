//! Physical device and device group aggregation
//!
//! The terminator reports devices per driver; this module merges them into
//! one loader-owned index space. Handles are stable for the lifetime of an
//! instance: re-enumerating (including after a layer hook adds, removes or
//! reorders devices) hands back the same handle for the same underlying
//! device. Groups are kept consistent with the device set: a group whose
//! members all disappear is dropped, and a device with no group becomes a
//! singleton group.

use std::collections::HashMap;

use crate::environment::{
    secure_var, EnvSource, VK_LOADER_DEVICE_ID_FILTER, VK_LOADER_DRIVER_ID_FILTER,
    VK_LOADER_VENDOR_ID_FILTER,
};
use crate::icd::{DriverHandle, PhysicalDeviceInfo};

/// Application-visible physical device handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysicalDeviceHandle(pub u64);

/// Identity of an aggregated device: where it actually lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceKey {
    /// Reported by a driver: (registration index, driver-local index).
    Driver { driver: usize, local: u32 },
    /// Injected by a layer's add hook.
    Layer { layer: String, index: u32 },
}

/// One merged physical device.
#[derive(Debug, Clone)]
pub struct AggregatedDevice {
    pub key: DeviceKey,
    pub info: PhysicalDeviceInfo,
}

/// Layer hook over the aggregated device list. Runs once per enumerate
/// call on the instance; must be deterministic for the order-stability
/// guarantee to hold.
pub trait PhysicalDeviceHook: Send + Sync {
    fn modify(&self, devices: Vec<AggregatedDevice>) -> Vec<AggregatedDevice>;
}

/// Loader-global device index for one instance.
#[derive(Debug, Default)]
pub struct PhysicalDeviceIndex {
    devices: Vec<(PhysicalDeviceHandle, AggregatedDevice)>,
    groups: Vec<Vec<PhysicalDeviceHandle>>,
    handles: HandleTable,
}

#[derive(Debug, Default)]
struct HandleTable {
    map: HashMap<DeviceKey, PhysicalDeviceHandle>,
    next: u64,
}

impl HandleTable {
    fn handle_for(&mut self, key: &DeviceKey) -> PhysicalDeviceHandle {
        if let Some(handle) = self.map.get(key) {
            return *handle;
        }
        self.next += 1;
        let handle = PhysicalDeviceHandle(self.next);
        self.map.insert(key.clone(), handle);
        handle
    }
}

impl PhysicalDeviceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-enumerate drivers and rebuild the index. Handles for devices
    /// already seen are preserved.
    pub fn refresh<'h>(
        &mut self,
        drivers: &[DriverHandle],
        hooks: impl Iterator<Item = &'h dyn PhysicalDeviceHook>,
        env: &dyn EnvSource,
    ) {
        let select = SelectFilters::from_env(env);

        let mut aggregated = Vec::new();
        let mut driver_groups: Vec<Vec<DeviceKey>> = Vec::new();
        for (driver_index, driver) in drivers.iter().enumerate() {
            let infos = driver.backend.enumerate_physical_devices();
            let mut kept_locals = Vec::new();
            for (local, info) in infos.iter().enumerate() {
                if !select.keeps(info) {
                    log::debug!(
                        "Physical device \"{}\" filtered out by id select filters",
                        info.name
                    );
                    continue;
                }
                let key = DeviceKey::Driver {
                    driver: driver_index,
                    local: local as u32,
                };
                kept_locals.push(local as u32);
                aggregated.push(AggregatedDevice {
                    key,
                    info: info.clone(),
                });
            }

            // Preserve the driver's grouping where it reports one;
            // otherwise every device is its own group
            let groups = driver
                .backend
                .enumerate_physical_device_groups()
                .unwrap_or_else(|| kept_locals.iter().map(|l| vec![*l]).collect());
            for group in groups {
                let members: Vec<DeviceKey> = group
                    .into_iter()
                    .filter(|l| kept_locals.contains(l))
                    .map(|local| DeviceKey::Driver {
                        driver: driver_index,
                        local,
                    })
                    .collect();
                if !members.is_empty() {
                    driver_groups.push(members);
                }
            }
        }

        // One modification opportunity per hook, in layer activation order
        for hook in hooks {
            aggregated = hook.modify(aggregated);
        }

        self.devices = aggregated
            .into_iter()
            .map(|device| (self.handles.handle_for(&device.key), device))
            .collect();

        // Group consistency: drop vanished members, drop emptied groups,
        // give ungrouped devices singleton groups, in device order
        let mut groups: Vec<Vec<PhysicalDeviceHandle>> = Vec::new();
        let mut grouped: Vec<PhysicalDeviceHandle> = Vec::new();
        for members in &driver_groups {
            let live: Vec<PhysicalDeviceHandle> = members
                .iter()
                .filter_map(|key| {
                    self.devices
                        .iter()
                        .find(|(_, d)| &d.key == key)
                        .map(|(h, _)| *h)
                })
                .collect();
            if !live.is_empty() {
                grouped.extend(&live);
                groups.push(live);
            }
        }
        for (handle, _) in &self.devices {
            if !grouped.contains(handle) {
                groups.push(vec![*handle]);
            }
        }
        self.groups = groups;
    }

    /// Devices in enumeration order.
    pub fn devices(&self) -> impl Iterator<Item = (PhysicalDeviceHandle, &AggregatedDevice)> {
        self.devices.iter().map(|(h, d)| (*h, d))
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn groups(&self) -> &[Vec<PhysicalDeviceHandle>] {
        &self.groups
    }

    pub fn resolve(&self, handle: PhysicalDeviceHandle) -> Option<&AggregatedDevice> {
        self.devices
            .iter()
            .find(|(h, _)| *h == handle)
            .map(|(_, d)| d)
    }
}

/// Parsed id select filters.
#[derive(Debug, Default)]
struct SelectFilters {
    vendor_ids: Option<Vec<u32>>,
    device_ids: Option<Vec<u32>>,
    driver_ids: Option<Vec<u32>>,
}

impl SelectFilters {
    fn from_env(env: &dyn EnvSource) -> Self {
        Self {
            vendor_ids: parse_id_list(env, VK_LOADER_VENDOR_ID_FILTER),
            device_ids: parse_id_list(env, VK_LOADER_DEVICE_ID_FILTER),
            driver_ids: parse_id_list(env, VK_LOADER_DRIVER_ID_FILTER),
        }
    }

    fn keeps(&self, info: &PhysicalDeviceInfo) -> bool {
        let matches = |filter: &Option<Vec<u32>>, value: u32| match filter {
            Some(ids) => ids.contains(&value),
            None => true,
        };
        matches(&self.vendor_ids, info.vendor_id)
            && matches(&self.device_ids, info.device_id)
            && matches(&self.driver_ids, info.driver_id)
    }
}

fn parse_id_list(env: &dyn EnvSource, var: &str) -> Option<Vec<u32>> {
    let value = secure_var(env, var)?;
    let ids: Vec<u32> = value
        .split(',')
        .filter(|t| !t.is_empty())
        .filter_map(|t| {
            let t = t.trim();
            if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
                u32::from_str_radix(hex, 16).ok()
            } else {
                t.parse().ok()
            }
        })
        .collect();
    if ids.is_empty() {
        None
    } else {
        Some(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::FixedEnv;
    use crate::icd::PhysicalDeviceType;
    use crate::testing::MockDriver;

    fn driver_with_devices(names: &[&str]) -> DriverHandle {
        let mut builder = MockDriver::builder();
        for (i, name) in names.iter().enumerate() {
            builder = builder.physical_device(PhysicalDeviceInfo {
                name: name.to_string(),
                vendor_id: 0x1000 + i as u32,
                device_id: 0x2000 + i as u32,
                device_type: PhysicalDeviceType::DiscreteGpu,
                ..Default::default()
            });
        }
        builder.build_handle()
    }

    fn no_hooks() -> std::iter::Empty<&'static dyn PhysicalDeviceHook> {
        std::iter::empty()
    }

    #[test]
    fn test_merge_preserves_driver_order() {
        let drivers = vec![
            driver_with_devices(&["a0", "a1"]),
            driver_with_devices(&["b0"]),
        ];
        let mut index = PhysicalDeviceIndex::new();
        index.refresh(&drivers, no_hooks(), &FixedEnv::new());
        let names: Vec<_> = index.devices().map(|(_, d)| d.info.name.clone()).collect();
        assert_eq!(names, ["a0", "a1", "b0"]);
    }

    #[test]
    fn test_handles_stable_across_refresh() {
        let drivers = vec![driver_with_devices(&["a0", "a1"])];
        let mut index = PhysicalDeviceIndex::new();
        index.refresh(&drivers, no_hooks(), &FixedEnv::new());
        let first: Vec<_> = index.devices().map(|(h, _)| h).collect();
        index.refresh(&drivers, no_hooks(), &FixedEnv::new());
        let second: Vec<_> = index.devices().map(|(h, _)| h).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_ungrouped_devices_become_singleton_groups() {
        let drivers = vec![driver_with_devices(&["a0", "a1", "a2"])];
        let mut index = PhysicalDeviceIndex::new();
        index.refresh(&drivers, no_hooks(), &FixedEnv::new());
        assert_eq!(index.groups().len(), 3);
        assert!(index.groups().iter().all(|g| g.len() == 1));
    }

    #[test]
    fn test_vendor_id_filter() {
        let drivers = vec![driver_with_devices(&["a0", "a1"])];
        let mut index = PhysicalDeviceIndex::new();
        let env = FixedEnv::new().set(VK_LOADER_VENDOR_ID_FILTER, "0x1001");
        index.refresh(&drivers, no_hooks(), &env);
        let names: Vec<_> = index.devices().map(|(_, d)| d.info.name.clone()).collect();
        assert_eq!(names, ["a1"]);
        // a filtered device loses its group as well
        assert_eq!(index.groups().len(), 1);
    }

    struct RemoveFirst;
    impl PhysicalDeviceHook for RemoveFirst {
        fn modify(&self, mut devices: Vec<AggregatedDevice>) -> Vec<AggregatedDevice> {
            if !devices.is_empty() {
                devices.remove(0);
            }
            devices
        }
    }

    #[test]
    fn test_remove_hook_drops_group() {
        let drivers = vec![driver_with_devices(&["a0", "a1"])];
        let mut index = PhysicalDeviceIndex::new();
        let hook = RemoveFirst;
        index.refresh(
            &drivers,
            std::iter::once(&hook as &dyn PhysicalDeviceHook),
            &FixedEnv::new(),
        );
        assert_eq!(index.device_count(), 1);
        assert_eq!(index.groups().len(), 1);
    }

    struct AddOne;
    impl PhysicalDeviceHook for AddOne {
        fn modify(&self, mut devices: Vec<AggregatedDevice>) -> Vec<AggregatedDevice> {
            devices.push(AggregatedDevice {
                key: DeviceKey::Layer {
                    layer: "VK_LAYER_test_inject".into(),
                    index: 0,
                },
                info: PhysicalDeviceInfo {
                    name: "injected".into(),
                    ..Default::default()
                },
            });
            devices
        }
    }

    #[test]
    fn test_added_device_becomes_singleton_group() {
        let drivers = vec![driver_with_devices(&["a0"])];
        let mut index = PhysicalDeviceIndex::new();
        let hook = AddOne;
        index.refresh(
            &drivers,
            std::iter::once(&hook as &dyn PhysicalDeviceHook),
            &FixedEnv::new(),
        );
        assert_eq!(index.device_count(), 2);
        assert_eq!(index.groups().len(), 2);
    }
}

//! Dispatch chain construction
//!
//! For every Vulkan command the loader builds an ordered chain:
//! application -> active layers (resolution order) -> loader trampoline ->
//! terminator -> driver. Layers participate as [`LayerInterceptor`]
//! objects; the chain is an explicit list built once at instance or device
//! creation and never mutated afterwards, so proc-addr queries read it
//! without locks and always observe the same pointer for a given
//! (handle, command) pair.
//!
//! `vkGetInstanceProcAddr` is deliberately generous for device-level
//! commands: it resolves them by extension existence, before any device is
//! created. `vkGetDeviceProcAddr` is strict: a device-extension command
//! resolves only on a device that enabled the extension.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::icd::{DeviceToken, DriverBackend, DriverHandle, IcdCommand, ProcAddr};
use crate::layer::LayerRecord;
use crate::physical_device::PhysicalDeviceHook;

/// Instance-level commands the loader itself implements.
pub const CORE_INSTANCE_COMMANDS: &[&str] = &[
    "vkCreateInstance",
    "vkDestroyInstance",
    "vkGetInstanceProcAddr",
    "vkEnumerateInstanceVersion",
    "vkEnumerateInstanceLayerProperties",
    "vkEnumerateInstanceExtensionProperties",
    "vkEnumeratePhysicalDevices",
    "vkEnumeratePhysicalDeviceGroups",
    "vkGetPhysicalDeviceProperties",
    "vkGetPhysicalDeviceProperties2",
    "vkGetPhysicalDeviceFeatures",
    "vkGetPhysicalDeviceFeatures2",
    "vkGetPhysicalDeviceFormatProperties",
    "vkGetPhysicalDeviceImageFormatProperties",
    "vkGetPhysicalDeviceQueueFamilyProperties",
    "vkGetPhysicalDeviceMemoryProperties",
    "vkGetPhysicalDeviceToolProperties",
    "vkEnumerateDeviceLayerProperties",
    "vkEnumerateDeviceExtensionProperties",
    "vkCreateDevice",
    "vkGetDeviceProcAddr",
];

/// Device-level commands always present in a driver.
pub const CORE_DEVICE_COMMANDS: &[&str] = &[
    "vkDestroyDevice",
    "vkGetDeviceQueue",
    "vkGetDeviceQueue2",
    "vkQueueSubmit",
    "vkQueueWaitIdle",
    "vkDeviceWaitIdle",
    "vkAllocateMemory",
    "vkFreeMemory",
    "vkMapMemory",
    "vkUnmapMemory",
    "vkCreateBuffer",
    "vkDestroyBuffer",
    "vkCreateImage",
    "vkDestroyImage",
    "vkCreateFence",
    "vkDestroyFence",
    "vkWaitForFences",
    "vkResetFences",
    "vkCreateSemaphore",
    "vkDestroySemaphore",
    "vkCreateCommandPool",
    "vkDestroyCommandPool",
    "vkAllocateCommandBuffers",
    "vkFreeCommandBuffers",
    "vkBeginCommandBuffer",
    "vkEndCommandBuffer",
    "vkCmdDraw",
    "vkCmdDispatch",
    "vkCmdCopyBuffer",
    "vkCmdPipelineBarrier",
];

/// A layer participating in a call chain.
///
/// One method per capability: command overrides for interception, and the
/// optional physical-device hook. A layer that does not override a command
/// passes it through to the next chain entry.
pub trait LayerInterceptor: Send + Sync {
    fn name(&self) -> &str;

    /// The layer's own implementation of a command, if it intercepts it.
    fn get_command(&self, name: &str) -> Option<ProcAddr>;

    fn physical_device_hook(&self) -> Option<&dyn PhysicalDeviceHook> {
        None
    }
}

/// Instantiates interceptors for resolved layer records.
pub trait LayerFactory: Send + Sync {
    fn instantiate(&self, record: &Arc<LayerRecord>) -> Option<Arc<dyn LayerInterceptor>>;
}

/// Default factory: drives the layer purely from its manifest. The layer
/// intercepts the entry points its manifest declares (device extension
/// entrypoints and pre-instance functions) at synthesized, stable
/// addresses.
#[derive(Debug, Default)]
pub struct ManifestLayerFactory;

impl LayerFactory for ManifestLayerFactory {
    fn instantiate(&self, record: &Arc<LayerRecord>) -> Option<Arc<dyn LayerInterceptor>> {
        Some(Arc::new(ManifestLayer {
            record: Arc::clone(record),
        }))
    }
}

struct ManifestLayer {
    record: Arc<LayerRecord>,
}

impl LayerInterceptor for ManifestLayer {
    fn name(&self) -> &str {
        &self.record.name
    }

    fn get_command(&self, name: &str) -> Option<ProcAddr> {
        let declared = self.record.device_entry_point(name).is_some()
            || self.record.pre_instance_functions.iter().any(|f| f == name);
        declared.then(|| synth_proc_addr(&self.record.name, name))
    }
}

/// One resolved layer with its live interceptor.
#[derive(Clone)]
pub struct ActiveLayer {
    pub record: Arc<LayerRecord>,
    pub interceptor: Arc<dyn LayerInterceptor>,
}

impl std::fmt::Debug for ActiveLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveLayer")
            .field("name", &self.record.name)
            .finish()
    }
}

/// Stable synthetic address for a loader- or layer-implemented command.
/// FNV-1a over the provider and command names; never zero.
pub fn synth_proc_addr(provider: &str, command: &str) -> ProcAddr {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in provider.bytes().chain([0u8]).chain(command.bytes()) {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    ProcAddr(hash.max(1) as usize)
}

fn trampoline_addr(command: &str) -> ProcAddr {
    synth_proc_addr("loader", command)
}

/// Per-instance dispatch chain, fixed at instance creation.
pub struct InstanceChain {
    layers: Vec<ActiveLayer>,
    commands: HashMap<String, ProcAddr>,
    drivers: Vec<Arc<dyn DriverBackend>>,
}

impl InstanceChain {
    /// Resolve every command reachable through this instance: loader core
    /// commands, driver-exported commands, layer overrides, and the
    /// device-level commands `vkGetInstanceProcAddr` must answer
    /// generically.
    pub fn build(layers: Vec<ActiveLayer>, drivers: &[DriverHandle]) -> Self {
        let mut commands = HashMap::new();

        let mut insert = |name: &str, fallback: Option<ProcAddr>, layers: &[ActiveLayer]| {
            let front = layers
                .iter()
                .find_map(|layer| layer.interceptor.get_command(name));
            if let Some(addr) = front.or(fallback) {
                commands.insert(name.to_string(), addr);
            }
        };

        for name in CORE_INSTANCE_COMMANDS {
            insert(name, Some(trampoline_addr(name)), &layers);
        }
        for command in IcdCommand::ALL {
            let serviced = drivers.iter().any(|d| d.dispatch.can_service(command));
            let fallback = serviced.then(|| trampoline_addr(command.name()));
            insert(command.name(), fallback, &layers);
        }
        for name in CORE_DEVICE_COMMANDS {
            // generic: resolvable before any device exists
            insert(name, Some(trampoline_addr(name)), &layers);
        }
        // Device-extension commands contributed by active layers resolve
        // generically here, by extension existence
        for layer in &layers {
            for extension in &layer.record.device_extensions {
                for entry in &extension.entry_points {
                    insert(entry, None, &layers);
                }
            }
        }

        Self {
            layers,
            commands,
            drivers: drivers.iter().map(|d| Arc::clone(&d.backend)).collect(),
        }
    }

    pub fn layers(&self) -> &[ActiveLayer] {
        &self.layers
    }

    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.record.name.as_str()).collect()
    }

    /// `vkGetInstanceProcAddr` against this instance. Device-extension
    /// commands a driver services beyond the core set resolve here too,
    /// generically, before any device exists.
    pub fn get_instance_proc_addr(&self, name: &str) -> Option<ProcAddr> {
        if let Some(addr) = self.commands.get(name) {
            return Some(*addr);
        }
        self.drivers
            .iter()
            .any(|d| d.get_device_proc_addr(None, name).is_some())
            .then(|| trampoline_addr(name))
    }

    pub fn physical_device_hooks(&self) -> impl Iterator<Item = &dyn PhysicalDeviceHook> {
        self.layers
            .iter()
            .filter_map(|l| l.interceptor.physical_device_hook())
    }
}

/// Per-device dispatch chain, fixed at device creation. Layer set is
/// inherited from the instance.
pub struct DeviceChain {
    commands: HashMap<String, ProcAddr>,
    driver: Arc<dyn DriverBackend>,
    device: DeviceToken,
    blocked: HashSet<String>,
}

impl DeviceChain {
    pub fn build(
        layers: &[ActiveLayer],
        driver: &DriverHandle,
        device: DeviceToken,
        enabled_extensions: &[String],
    ) -> Self {
        let mut commands = HashMap::new();
        let mut blocked = HashSet::new();

        for name in CORE_DEVICE_COMMANDS {
            let front = layers
                .iter()
                .find_map(|layer| layer.interceptor.get_command(name));
            let addr = front.or_else(|| driver.backend.get_device_proc_addr(Some(device), name));
            if let Some(addr) = addr {
                commands.insert(name.to_string(), addr);
            }
        }

        // Extension entry points a layer provides: callable only when the
        // device enabled that extension, otherwise pinned to null
        for layer in layers {
            for extension in &layer.record.device_extensions {
                let enabled = enabled_extensions.iter().any(|e| e == &extension.name);
                for entry in &extension.entry_points {
                    if enabled {
                        if let Some(addr) = layers
                            .iter()
                            .find_map(|l| l.interceptor.get_command(entry))
                        {
                            commands.entry(entry.clone()).or_insert(addr);
                        }
                    } else {
                        blocked.insert(entry.clone());
                    }
                }
            }
        }

        Self {
            commands,
            driver: Arc::clone(&driver.backend),
            device,
            blocked,
        }
    }

    /// `vkGetDeviceProcAddr` against this device. Unknown names fall
    /// through to the driver, which enforces its own extension rules.
    pub fn get_device_proc_addr(&self, name: &str) -> Option<ProcAddr> {
        if let Some(addr) = self.commands.get(name) {
            return Some(*addr);
        }
        if self.blocked.contains(name) {
            return None;
        }
        self.driver.get_device_proc_addr(Some(self.device), name)
    }
}

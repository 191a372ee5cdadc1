//! Loader front door and instance lifecycle
//!
//! [`Loader`] is the application-facing entry surface: the global
//! enumeration calls plus instance creation. Every top-level call starts
//! from a fresh manifest scan, so installing or removing a driver or layer
//! between calls is picked up without restarting the process.
//!
//! [`LoaderInstance`] owns one created instance: the resolved layer chain,
//! the terminator over the drivers that accepted creation, and the
//! aggregated physical-device index. The chain is immutable after
//! creation; proc-addr queries never take a lock.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::allocation::{
    AllocationScope, Allocator, CommittedAllocations, ScopedAllocations, SystemAllocator,
};
use crate::chain::{ActiveLayer, InstanceChain, LayerFactory, ManifestLayerFactory};
use crate::environment::{DebugLog, EnvSource, ProcessEnv};
use crate::error::{LoaderError, Result, VkResult};
use crate::icd::{load_drivers, DriverLoader, PhysicalDeviceInfo, ProcAddr};
use crate::layer::{implicit_layer_decision, LayerKind, LayerRecord};
use crate::library::DynamicDriverLoader;
use crate::locate::{scan, ScanSnapshot};
use crate::manifest::ExtensionProperties;
use crate::physical_device::{DeviceKey, PhysicalDeviceHandle, PhysicalDeviceIndex};
use crate::resolve::resolve_layers;
use crate::terminator::{merge_extensions, two_call, Terminator};
use crate::ApiVersion;

/// Highest instance version this loader implements.
pub const LOADER_VERSION: ApiVersion = ApiVersion::VK_1_3;

/// Log level requested through `VK_LOADER_DEBUG`. The variable carries a
/// comma-separated list of facilities; the noisiest one requested wins.
/// Embedders feed this into their logger setup.
pub fn debug_log_level(env: &dyn EnvSource) -> log::LevelFilter {
    let flags = DebugLog::from_env(env);
    if flags.is_empty() {
        return log::LevelFilter::Warn;
    }
    if flags.intersects(DebugLog::DEBUG | DebugLog::LAYER | DebugLog::DRIVER) {
        log::LevelFilter::Debug
    } else if flags.contains(DebugLog::INFO) {
        log::LevelFilter::Info
    } else if flags.intersects(DebugLog::WARN | DebugLog::PERF) {
        log::LevelFilter::Warn
    } else {
        log::LevelFilter::Error
    }
}

/// Application-visible layer properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerProperties {
    pub layer_name: String,
    pub spec_version: ApiVersion,
    pub implementation_version: u32,
    pub description: String,
}

impl LayerProperties {
    fn from_record(record: &LayerRecord) -> Self {
        Self {
            layer_name: record.name.clone(),
            spec_version: record.api_version,
            implementation_version: record.implementation_version,
            description: record.description.clone(),
        }
    }
}

/// What the application asks for at instance creation.
#[derive(Debug, Clone, Default)]
pub struct InstanceCreateInfo {
    /// `VkApplicationInfo::apiVersion`; zero-default means 1.0.
    pub api_version: Option<ApiVersion>,
    pub enabled_layer_names: Vec<String>,
    pub enabled_extension_names: Vec<String>,
}

/// The loader's global surface.
pub struct Loader {
    env: Arc<dyn EnvSource>,
    driver_loader: Arc<dyn DriverLoader>,
    layer_factory: Arc<dyn LayerFactory>,
    allocator: Arc<dyn Allocator>,
}

impl Default for Loader {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Loader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> LoaderBuilder {
        LoaderBuilder::default()
    }

    pub fn enumerate_instance_version(&self) -> ApiVersion {
        LOADER_VERSION
    }

    /// All layers discoverable right now, implicit and explicit, in
    /// registration order.
    pub fn enumerate_instance_layer_properties(&self) -> Vec<LayerProperties> {
        let snapshot = scan(self.env.as_ref());
        snapshot
            .layers
            .iter()
            .map(|record| LayerProperties::from_record(record))
            .collect()
    }

    /// Instance extensions: for a named layer, its manifest's list; for
    /// `None`, the union over drivers plus the extensions of implicit
    /// layers that would activate.
    pub fn enumerate_instance_extension_properties(
        &self,
        layer_name: Option<&str>,
    ) -> Result<Vec<ExtensionProperties>> {
        let snapshot = scan(self.env.as_ref());
        if let Some(name) = layer_name {
            let record = snapshot
                .layers
                .find_by_name(name)
                .ok_or_else(|| LoaderError::LayerNotPresent(name.to_string()))?;
            return Ok(record.instance_extensions.clone());
        }

        let mut merged = match load_drivers(&snapshot.drivers, self.driver_loader.as_ref()) {
            Ok(drivers) => {
                let mut merged = Vec::new();
                for driver in &drivers {
                    merged =
                        merge_extensions(merged, driver.backend.enumerate_instance_extensions());
                }
                merged
            }
            Err(e) => {
                log::warn!("No usable drivers during extension enumeration: {e}");
                Vec::new()
            }
        };
        for record in snapshot.layers.iter() {
            if record.kind == LayerKind::Implicit
                && implicit_layer_decision(record, self.env.as_ref())
            {
                merged = merge_extensions(merged, record.instance_extensions.iter().cloned());
            }
        }
        Ok(merged)
    }

    /// Create an instance: resolve layers, load drivers, build the chain,
    /// fan creation out across the drivers.
    pub fn create_instance(&self, create_info: &InstanceCreateInfo) -> Result<LoaderInstance> {
        log::debug!(
            "Instance creation, requested log level {}",
            debug_log_level(self.env.as_ref())
        );
        let snapshot = scan(self.env.as_ref());
        let resolved = resolve_layers(
            &snapshot,
            &create_info.enabled_layer_names,
            self.env.as_ref(),
        )?;

        let mut layers = Vec::with_capacity(resolved.len());
        for record in resolved.iter() {
            match self.layer_factory.instantiate(record) {
                Some(interceptor) => layers.push(ActiveLayer {
                    record: Arc::clone(record),
                    interceptor,
                }),
                None => log::warn!(
                    "Layer \"{}\" could not be instantiated, dropped from chain",
                    record.name
                ),
            }
        }

        let drivers = load_drivers(&snapshot.drivers, self.driver_loader.as_ref())?;

        self.check_instance_extensions(&create_info.enabled_extension_names, &drivers, &layers)?;

        let api_version = create_info.api_version.unwrap_or(ApiVersion::VK_1_0);

        // Everything from here on is staged: a failure below this point
        // unwinds the staged allocations before returning
        let mut staged = ScopedAllocations::new(Arc::clone(&self.allocator));
        staged.allocate(
            std::mem::size_of::<LoaderInstance>(),
            AllocationScope::Instance,
        )?;
        for _ in &layers {
            staged.allocate(64, AllocationScope::Object)?;
        }
        for _ in &drivers {
            staged.allocate(64, AllocationScope::Object)?;
        }

        let mut terminator = Terminator::new(drivers);
        terminator.create_instances(api_version, &create_info.enabled_extension_names)?;

        let chain = InstanceChain::build(layers, terminator.drivers());
        log::info!(
            "Created instance with {} driver(s), layer order {:?}",
            terminator.drivers().len(),
            chain.layer_names()
        );

        Ok(LoaderInstance {
            shared: Arc::new(InstanceShared {
                env: Arc::clone(&self.env),
                allocator: Arc::clone(&self.allocator),
                api_version,
                enabled_extensions: create_info.enabled_extension_names.clone(),
                snapshot,
                chain,
                terminator,
                devices: Mutex::new(PhysicalDeviceIndex::new()),
                allocations: Mutex::new(staged.commit()),
            }),
        })
    }

    fn check_instance_extensions(
        &self,
        requested: &[String],
        drivers: &[crate::icd::DriverHandle],
        layers: &[ActiveLayer],
    ) -> Result<()> {
        for name in requested {
            let from_driver = drivers.iter().any(|d| {
                d.backend
                    .enumerate_instance_extensions()
                    .iter()
                    .any(|e| &e.name == name)
            });
            let from_layer = layers.iter().any(|l| {
                l.record
                    .instance_extensions
                    .iter()
                    .any(|e| &e.name == name)
            });
            if !from_driver && !from_layer {
                return Err(LoaderError::ExtensionNotPresent(name.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct LoaderBuilder {
    env: Option<Arc<dyn EnvSource>>,
    driver_loader: Option<Arc<dyn DriverLoader>>,
    layer_factory: Option<Arc<dyn LayerFactory>>,
    allocator: Option<Arc<dyn Allocator>>,
}

impl LoaderBuilder {
    pub fn env(mut self, env: impl EnvSource + 'static) -> Self {
        self.env = Some(Arc::new(env));
        self
    }

    pub fn driver_loader(mut self, loader: impl DriverLoader + 'static) -> Self {
        self.driver_loader = Some(Arc::new(loader));
        self
    }

    pub fn layer_factory(mut self, factory: impl LayerFactory + 'static) -> Self {
        self.layer_factory = Some(Arc::new(factory));
        self
    }

    pub fn allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn build(self) -> Loader {
        Loader {
            env: self.env.unwrap_or_else(|| Arc::new(ProcessEnv)),
            driver_loader: self
                .driver_loader
                .unwrap_or_else(|| Arc::new(DynamicDriverLoader::new())),
            layer_factory: self
                .layer_factory
                .unwrap_or_else(|| Arc::new(ManifestLayerFactory)),
            allocator: self
                .allocator
                .unwrap_or_else(|| Arc::new(SystemAllocator::default())),
        }
    }
}

struct InstanceShared {
    env: Arc<dyn EnvSource>,
    allocator: Arc<dyn Allocator>,
    api_version: ApiVersion,
    enabled_extensions: Vec<String>,
    snapshot: ScanSnapshot,
    chain: InstanceChain,
    terminator: Terminator,
    devices: Mutex<PhysicalDeviceIndex>,
    allocations: Mutex<CommittedAllocations>,
}

/// One live instance.
pub struct LoaderInstance {
    shared: Arc<InstanceShared>,
}

impl std::fmt::Debug for LoaderInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderInstance")
            .field("api_version", &self.shared.api_version)
            .field("enabled_extensions", &self.shared.enabled_extensions)
            .finish_non_exhaustive()
    }
}

impl LoaderInstance {
    pub fn api_version(&self) -> ApiVersion {
        self.shared.api_version
    }

    pub fn enabled_extensions(&self) -> &[String] {
        &self.shared.enabled_extensions
    }

    /// Active layer names, chain order.
    pub fn layer_names(&self) -> Vec<&str> {
        self.shared.chain.layer_names()
    }

    /// `vkGetInstanceProcAddr` for this instance.
    pub fn get_instance_proc_addr(&self, name: &str) -> Option<ProcAddr> {
        self.shared.chain.get_instance_proc_addr(name)
    }

    /// `vkEnumeratePhysicalDevices`, two-call idiom over loader handles.
    pub fn enumerate_physical_devices(
        &self,
        count: &mut u32,
        buffer: Option<&mut [PhysicalDeviceHandle]>,
    ) -> VkResult {
        let handles = {
            let mut index = self.shared.devices.lock();
            self.refresh_devices(&mut index);
            index.devices().map(|(h, _)| h).collect::<Vec<_>>()
        };
        two_call(&handles, count, buffer)
    }

    /// `vkEnumeratePhysicalDeviceGroups`, groups as handle sets.
    pub fn enumerate_physical_device_groups(
        &self,
        count: &mut u32,
        buffer: Option<&mut [Vec<PhysicalDeviceHandle>]>,
    ) -> VkResult {
        let groups = {
            let mut index = self.shared.devices.lock();
            self.refresh_devices(&mut index);
            index.groups().to_vec()
        };
        two_call(&groups, count, buffer)
    }

    fn refresh_devices(&self, index: &mut PhysicalDeviceIndex) {
        index.refresh(
            self.shared.terminator.drivers(),
            self.shared.chain.physical_device_hooks(),
            self.shared.env.as_ref(),
        );
    }

    pub fn physical_device_info(
        &self,
        handle: PhysicalDeviceHandle,
    ) -> Option<PhysicalDeviceInfo> {
        self.shared
            .devices
            .lock()
            .resolve(handle)
            .map(|d| d.info.clone())
    }

    /// Device extensions of one physical device: the owning driver's list
    /// plus what active layers add.
    pub fn enumerate_device_extension_properties(
        &self,
        handle: PhysicalDeviceHandle,
    ) -> Result<Vec<ExtensionProperties>> {
        let key = self
            .shared
            .devices
            .lock()
            .resolve(handle)
            .map(|d| d.key.clone())
            .ok_or(LoaderError::InitializationFailed)?;
        let mut merged = match key {
            DeviceKey::Driver { driver, local } => {
                self.shared.terminator.device_extensions(driver, local)
            }
            DeviceKey::Layer { .. } => Vec::new(),
        };
        for layer in self.shared.chain.layers() {
            merged = merge_extensions(
                merged,
                layer.record.device_extensions.iter().map(|e| {
                    ExtensionProperties {
                        name: e.name.clone(),
                        spec_version: e.spec_version,
                    }
                }),
            );
        }
        Ok(merged)
    }

    /// `vkEnumerateDeviceLayerProperties`: kept for 1.0 compatibility, the
    /// device layer list is the instance's active layers.
    pub fn enumerate_device_layer_properties(&self) -> Vec<LayerProperties> {
        self.shared
            .chain
            .layers()
            .iter()
            .map(|l| LayerProperties::from_record(&l.record))
            .collect()
    }

    /// `vkCreateDevice` against one enumerated physical device.
    pub fn create_device(
        &self,
        handle: PhysicalDeviceHandle,
        create_info: &crate::device::DeviceCreateInfo,
    ) -> Result<crate::device::Device> {
        crate::device::create_device(
            &self.shared.chain,
            &self.shared.terminator,
            &self.shared.devices,
            Arc::clone(&self.shared.allocator),
            self.shared.env.as_ref(),
            handle,
            create_info,
        )
    }

    /// Settings discovered at creation, if a settings file applied.
    pub fn settings_applied(&self) -> bool {
        self.shared.snapshot.settings.is_some()
    }
}

impl Drop for InstanceShared {
    fn drop(&mut self) {
        self.terminator.destroy_instances();
        self.allocations.lock().release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{FixedEnv, VK_LOADER_DEBUG};

    #[test]
    fn test_debug_log_level_default_and_all() {
        assert_eq!(debug_log_level(&FixedEnv::new()), log::LevelFilter::Warn);
        let env = FixedEnv::new().set(VK_LOADER_DEBUG, "all");
        assert_eq!(debug_log_level(&env), log::LevelFilter::Debug);
        let env = FixedEnv::new().set(VK_LOADER_DEBUG, "error");
        assert_eq!(debug_log_level(&env), log::LevelFilter::Error);
        let env = FixedEnv::new().set(VK_LOADER_DEBUG, "error,info");
        assert_eq!(debug_log_level(&env), log::LevelFilter::Info);
        // unknown facilities fall back to the default
        let env = FixedEnv::new().set(VK_LOADER_DEBUG, "bogus");
        assert_eq!(debug_log_level(&env), log::LevelFilter::Warn);
    }
}

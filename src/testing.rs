//! In-process mock drivers and layers
//!
//! Everything the loader talks to through a trait seam has a mock here:
//! [`MockDriver`] stands in for a loaded ICD library, [`MockDriverLoader`]
//! for the dynamic-library loader, and [`MockLayer`] for a live layer
//! interceptor. The mocks answer proc-addr queries with the same stable
//! synthesized addresses real chains use, so pointer-identity assertions
//! hold across calls.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::chain::{synth_proc_addr, LayerInterceptor, CORE_DEVICE_COMMANDS};
use crate::error::{LoaderError, Result};
use crate::icd::{
    DeviceToken, DriverBackend, DriverHandle, DriverLoader, IcdCommand, IcdDispatch,
    PhysicalDeviceInfo, ProcAddr, LOADER_MAX_ICD_INTERFACE,
};
use crate::layer::{LayerKind, LayerRecord};
use crate::manifest::{DriverManifest, ExtensionProperties};
use crate::physical_device::PhysicalDeviceHook;
use crate::ApiVersion;

static NEXT_MOCK_ID: AtomicU64 = AtomicU64::new(1);

/// How a mock driver answers interface-version negotiation.
#[derive(Debug, Clone, Copy)]
pub enum Negotiation {
    /// Export present, answers with exactly this version.
    Version(u32),
    /// Export absent; the legacy probe applies.
    Absent,
}

/// Configurable in-process driver.
pub struct MockDriver {
    id: String,
    api_version: ApiVersion,
    negotiation: Negotiation,
    has_icd_gipa: bool,
    missing_commands: HashSet<&'static str>,
    instance_extensions: Vec<ExtensionProperties>,
    device_extensions: Vec<ExtensionProperties>,
    extra_device_commands: HashSet<String>,
    devices: Vec<PhysicalDeviceInfo>,
    groups: Option<Vec<Vec<u32>>>,
    fail_create_instance: bool,
    instance_created: AtomicBool,
    next_device: AtomicU64,
    live_devices: Mutex<HashSet<u64>>,
    create_device_calls: AtomicUsize,
    destroy_device_calls: AtomicUsize,
}

impl MockDriver {
    pub fn builder() -> MockDriverBuilder {
        MockDriverBuilder::default()
    }

    pub fn instance_created(&self) -> bool {
        self.instance_created.load(Ordering::SeqCst)
    }

    pub fn create_device_calls(&self) -> usize {
        self.create_device_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_device_calls(&self) -> usize {
        self.destroy_device_calls.load(Ordering::SeqCst)
    }

    /// Devices created and not yet destroyed.
    pub fn live_device_count(&self) -> usize {
        self.live_devices.lock().len()
    }
}

pub struct MockDriverBuilder {
    driver: MockDriver,
}

impl Default for MockDriverBuilder {
    fn default() -> Self {
        let id = NEXT_MOCK_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            driver: MockDriver {
                id: format!("mock-driver-{id}"),
                api_version: ApiVersion::VK_1_1,
                negotiation: Negotiation::Version(LOADER_MAX_ICD_INTERFACE),
                has_icd_gipa: true,
                missing_commands: HashSet::new(),
                instance_extensions: Vec::new(),
                device_extensions: Vec::new(),
                extra_device_commands: HashSet::new(),
                devices: Vec::new(),
                groups: None,
                fail_create_instance: false,
                instance_created: AtomicBool::new(false),
                next_device: AtomicU64::new(1),
                live_devices: Mutex::new(HashSet::new()),
                create_device_calls: AtomicUsize::new(0),
                destroy_device_calls: AtomicUsize::new(0),
            },
        }
    }
}

impl MockDriverBuilder {
    pub fn api_version(mut self, version: ApiVersion) -> Self {
        self.driver.api_version = version;
        self
    }

    pub fn negotiation(mut self, negotiation: Negotiation) -> Self {
        self.driver.negotiation = negotiation;
        self
    }

    pub fn without_icd_get_instance_proc_addr(mut self) -> Self {
        self.driver.has_icd_gipa = false;
        self
    }

    /// Make the driver not export one command.
    pub fn without_command(mut self, command: IcdCommand) -> Self {
        self.driver.missing_commands.insert(command.name());
        self
    }

    pub fn instance_extension(mut self, name: &str, spec_version: u32) -> Self {
        self.driver.instance_extensions.push(ExtensionProperties {
            name: name.to_string(),
            spec_version,
        });
        self
    }

    /// Device extension advertised for every physical device, with the
    /// commands it adds to `vkGetDeviceProcAddr`.
    pub fn device_extension(mut self, name: &str, spec_version: u32, commands: &[&str]) -> Self {
        self.driver.device_extensions.push(ExtensionProperties {
            name: name.to_string(),
            spec_version,
        });
        for command in commands {
            self.driver.extra_device_commands.insert(command.to_string());
        }
        self
    }

    pub fn physical_device(mut self, info: PhysicalDeviceInfo) -> Self {
        self.driver.devices.push(info);
        self
    }

    /// Report this grouping of driver-local device indices.
    pub fn device_group(mut self, members: Vec<u32>) -> Self {
        self.driver.groups.get_or_insert_with(Vec::new).push(members);
        self
    }

    pub fn fail_create_instance(mut self) -> Self {
        self.driver.fail_create_instance = true;
        self
    }

    pub fn build(self) -> MockDriver {
        self.driver
    }

    pub fn build_arc(self) -> Arc<MockDriver> {
        Arc::new(self.driver)
    }

    /// Finished [`DriverHandle`] with a synthetic manifest, skipping the
    /// load path entirely.
    pub fn build_handle(self) -> DriverHandle {
        let driver = Arc::new(self.driver);
        let dispatch = IcdDispatch::probe(driver.as_ref());
        DriverHandle {
            manifest: mock_manifest(&driver.id, driver.api_version),
            backend: driver,
            interface_version: LOADER_MAX_ICD_INTERFACE,
            dispatch,
        }
    }
}

fn mock_manifest(id: &str, api_version: ApiVersion) -> DriverManifest {
    DriverManifest {
        file_path: PathBuf::from(format!("/mock/{id}.json")),
        format_version: ApiVersion::new(1, 0, 0),
        library_path: PathBuf::from(format!("lib{id}.so")),
        api_version,
        is_portability_driver: false,
    }
}

impl DriverBackend for MockDriver {
    fn negotiate_interface_version(&self, _loader_max: u32) -> Option<u32> {
        // Answers with the configured version verbatim, so tests can pin
        // the loader's handling of out-of-range answers too
        match self.negotiation {
            Negotiation::Version(v) => Some(v),
            Negotiation::Absent => None,
        }
    }

    fn has_icd_get_instance_proc_addr(&self) -> bool {
        self.has_icd_gipa
    }

    fn api_version(&self) -> ApiVersion {
        self.api_version
    }

    fn get_instance_proc_addr(&self, name: &str) -> Option<ProcAddr> {
        if self.missing_commands.contains(name) {
            return None;
        }
        IcdCommand::from_name(name).map(|_| synth_proc_addr(&self.id, name))
    }

    fn create_instance(&self, _api_version: ApiVersion, _extensions: &[String]) -> Result<()> {
        if self.fail_create_instance {
            return Err(LoaderError::InitializationFailed);
        }
        self.instance_created.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn destroy_instance(&self) {
        self.instance_created.store(false, Ordering::SeqCst);
    }

    fn enumerate_instance_extensions(&self) -> Vec<ExtensionProperties> {
        self.instance_extensions.clone()
    }

    fn enumerate_physical_devices(&self) -> Vec<PhysicalDeviceInfo> {
        self.devices.clone()
    }

    fn enumerate_physical_device_groups(&self) -> Option<Vec<Vec<u32>>> {
        self.groups.clone()
    }

    fn enumerate_device_extensions(&self, _device_index: u32) -> Vec<ExtensionProperties> {
        self.device_extensions.clone()
    }

    /// Addresses are keyed by (driver, device, command), so a query routed
    /// through the wrong device token comes back observably different, and
    /// a destroyed device answers nothing at all.
    fn get_device_proc_addr(&self, device: Option<DeviceToken>, name: &str) -> Option<ProcAddr> {
        let known = CORE_DEVICE_COMMANDS.contains(&name)
            || self.extra_device_commands.contains(name);
        if !known {
            return None;
        }
        match device {
            Some(token) => {
                if !self.live_devices.lock().contains(&token.0) {
                    return None;
                }
                Some(synth_proc_addr(&format!("{}#{}", self.id, token.0), name))
            }
            None => Some(synth_proc_addr(&self.id, name)),
        }
    }

    fn create_device(&self, device_index: u32, _extensions: &[String]) -> Result<DeviceToken> {
        if device_index as usize >= self.devices.len() {
            return Err(LoaderError::InitializationFailed);
        }
        let token = self.next_device.fetch_add(1, Ordering::SeqCst);
        self.live_devices.lock().insert(token);
        self.create_device_calls.fetch_add(1, Ordering::SeqCst);
        Ok(DeviceToken(token))
    }

    fn destroy_device(&self, device: DeviceToken) {
        if self.live_devices.lock().remove(&device.0) {
            self.destroy_device_calls.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Driver loader backed by a path-to-backend map: the manifest's
/// `library_path` selects the backend, an unknown path fails the load the
/// way a missing shared object would.
#[derive(Default)]
pub struct MockDriverLoader {
    backends: HashMap<PathBuf, Arc<dyn DriverBackend>>,
}

impl MockDriverLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, library_path: impl Into<PathBuf>, backend: Arc<dyn DriverBackend>) -> Self {
        self.backends.insert(library_path.into(), backend);
        self
    }
}

impl DriverLoader for MockDriverLoader {
    fn load(&self, manifest: &DriverManifest) -> Result<Arc<dyn DriverBackend>> {
        self.backends
            .get(&manifest.library_path)
            .cloned()
            .ok_or_else(|| LoaderError::DriverLoadFailed {
                path: manifest.library_path.clone(),
                reason: "library not found".into(),
            })
    }
}

/// Minimal well-formed layer record for tests.
pub fn layer_record(name: &str, manifest_path: impl AsRef<Path>) -> LayerRecord {
    LayerRecord {
        name: name.to_string(),
        manifest_path: manifest_path.as_ref().to_path_buf(),
        kind: LayerKind::Explicit,
        api_version: ApiVersion::VK_1_1,
        implementation_version: 1,
        description: String::new(),
        library_path: Some(PathBuf::from(format!("lib{name}.so"))),
        enable_environment: None,
        disable_environment: None,
        component_layers: Vec::new(),
        blacklisted_layers: Vec::new(),
        override_paths: Vec::new(),
        app_keys: Vec::new(),
        instance_extensions: Vec::new(),
        device_extensions: Vec::new(),
        pre_instance_functions: Vec::new(),
        control: None,
    }
}

/// Layer interceptor with an explicit set of intercepted commands and an
/// optional physical-device hook.
pub struct MockLayer {
    record: LayerRecord,
    intercepted: HashSet<String>,
    hook: Option<Box<dyn PhysicalDeviceHook>>,
}

impl MockLayer {
    pub fn new(record: LayerRecord) -> Self {
        Self {
            record,
            intercepted: HashSet::new(),
            hook: None,
        }
    }

    pub fn intercepts(mut self, command: &str) -> Self {
        self.intercepted.insert(command.to_string());
        self
    }

    pub fn with_hook(mut self, hook: impl PhysicalDeviceHook + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn record(&self) -> &LayerRecord {
        &self.record
    }
}

impl LayerInterceptor for MockLayer {
    fn name(&self) -> &str {
        &self.record.name
    }

    fn get_command(&self, name: &str) -> Option<ProcAddr> {
        self.intercepted
            .contains(name)
            .then(|| synth_proc_addr(&self.record.name, name))
    }

    fn physical_device_hook(&self) -> Option<&dyn PhysicalDeviceHook> {
        self.hook.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_driver_proc_addrs_are_per_driver() {
        let a = MockDriver::builder().build();
        let b = MockDriver::builder().build();
        assert_ne!(
            a.get_instance_proc_addr("vkCreateInstance"),
            b.get_instance_proc_addr("vkCreateInstance")
        );
        assert_eq!(
            a.get_instance_proc_addr("vkCreateInstance"),
            a.get_instance_proc_addr("vkCreateInstance")
        );
    }

    #[test]
    fn test_mock_loader_unknown_path_fails() {
        let loader = MockDriverLoader::new();
        let manifest = mock_manifest("absent", ApiVersion::VK_1_0);
        assert!(matches!(
            loader.load(&manifest),
            Err(LoaderError::DriverLoadFailed { .. })
        ));
    }
}

//! Driver (ICD) registry
//!
//! Each candidate driver library is loaded through a [`DriverLoader`],
//! interface-version negotiated, and probed once per known entry point to
//! build its [`IcdDispatch`] capability table. A command the driver does
//! not export leaves its slot empty; that is not an error, the terminator
//! consults [`IcdDispatch::supports`] before routing. WSI entry points the
//! driver lacks are serviced by the loader itself, with the driver
//! preferred whenever it does export the symbol.

use std::sync::Arc;

use crate::error::{LoaderError, Result};
use crate::locate::DiscoveredDriver;
use crate::manifest::{DriverManifest, ExtensionProperties};
use crate::ApiVersion;

/// Lowest ICD interface version this loader can drive.
pub const LOADER_MIN_ICD_INTERFACE: u32 = 0;
/// Highest ICD interface version this loader understands.
pub const LOADER_MAX_ICD_INTERFACE: u32 = 6;

/// Opaque, non-null function pointer identity.
///
/// Stable for a given (driver, command) pair; equality is pointer
/// equality, which the proc-addr stability guarantees build on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcAddr(pub usize);

/// Identity of one driver-side logical device, issued by
/// [`DriverBackend::create_device`]. Sibling devices created through the
/// same driver carry distinct tokens and have independent lifetimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceToken(pub u64);

/// Commands the loader routes into drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum IcdCommand {
    CreateInstance,
    DestroyInstance,
    EnumerateInstanceExtensionProperties,
    EnumeratePhysicalDevices,
    EnumeratePhysicalDeviceGroups,
    GetPhysicalDeviceProperties,
    GetPhysicalDeviceProperties2,
    GetPhysicalDeviceFeatures,
    GetPhysicalDeviceFeatures2,
    GetPhysicalDeviceQueueFamilyProperties,
    GetPhysicalDeviceMemoryProperties,
    GetPhysicalDeviceToolProperties,
    EnumerateDeviceExtensionProperties,
    CreateDevice,
    DestroyDevice,
    GetDeviceProcAddr,
    DestroySurfaceKHR,
    GetPhysicalDeviceSurfaceSupportKHR,
    GetPhysicalDeviceSurfaceCapabilitiesKHR,
    GetPhysicalDeviceSurfaceFormatsKHR,
    GetPhysicalDeviceSurfacePresentModesKHR,
    CreateWin32SurfaceKHR,
    CreateXlibSurfaceKHR,
    CreateXcbSurfaceKHR,
    CreateWaylandSurfaceKHR,
    GetPhysicalDeviceWin32PresentationSupportKHR,
    GetPhysicalDeviceXlibPresentationSupportKHR,
    GetPhysicalDeviceXcbPresentationSupportKHR,
    GetPhysicalDeviceWaylandPresentationSupportKHR,
    CreateDebugUtilsMessengerEXT,
    DestroyDebugUtilsMessengerEXT,
}

impl IcdCommand {
    pub const ALL: [IcdCommand; 31] = [
        IcdCommand::CreateInstance,
        IcdCommand::DestroyInstance,
        IcdCommand::EnumerateInstanceExtensionProperties,
        IcdCommand::EnumeratePhysicalDevices,
        IcdCommand::EnumeratePhysicalDeviceGroups,
        IcdCommand::GetPhysicalDeviceProperties,
        IcdCommand::GetPhysicalDeviceProperties2,
        IcdCommand::GetPhysicalDeviceFeatures,
        IcdCommand::GetPhysicalDeviceFeatures2,
        IcdCommand::GetPhysicalDeviceQueueFamilyProperties,
        IcdCommand::GetPhysicalDeviceMemoryProperties,
        IcdCommand::GetPhysicalDeviceToolProperties,
        IcdCommand::EnumerateDeviceExtensionProperties,
        IcdCommand::CreateDevice,
        IcdCommand::DestroyDevice,
        IcdCommand::GetDeviceProcAddr,
        IcdCommand::DestroySurfaceKHR,
        IcdCommand::GetPhysicalDeviceSurfaceSupportKHR,
        IcdCommand::GetPhysicalDeviceSurfaceCapabilitiesKHR,
        IcdCommand::GetPhysicalDeviceSurfaceFormatsKHR,
        IcdCommand::GetPhysicalDeviceSurfacePresentModesKHR,
        IcdCommand::CreateWin32SurfaceKHR,
        IcdCommand::CreateXlibSurfaceKHR,
        IcdCommand::CreateXcbSurfaceKHR,
        IcdCommand::CreateWaylandSurfaceKHR,
        IcdCommand::GetPhysicalDeviceWin32PresentationSupportKHR,
        IcdCommand::GetPhysicalDeviceXlibPresentationSupportKHR,
        IcdCommand::GetPhysicalDeviceXcbPresentationSupportKHR,
        IcdCommand::GetPhysicalDeviceWaylandPresentationSupportKHR,
        IcdCommand::CreateDebugUtilsMessengerEXT,
        IcdCommand::DestroyDebugUtilsMessengerEXT,
    ];

    pub fn name(self) -> &'static str {
        match self {
            IcdCommand::CreateInstance => "vkCreateInstance",
            IcdCommand::DestroyInstance => "vkDestroyInstance",
            IcdCommand::EnumerateInstanceExtensionProperties => {
                "vkEnumerateInstanceExtensionProperties"
            }
            IcdCommand::EnumeratePhysicalDevices => "vkEnumeratePhysicalDevices",
            IcdCommand::EnumeratePhysicalDeviceGroups => "vkEnumeratePhysicalDeviceGroups",
            IcdCommand::GetPhysicalDeviceProperties => "vkGetPhysicalDeviceProperties",
            IcdCommand::GetPhysicalDeviceProperties2 => "vkGetPhysicalDeviceProperties2",
            IcdCommand::GetPhysicalDeviceFeatures => "vkGetPhysicalDeviceFeatures",
            IcdCommand::GetPhysicalDeviceFeatures2 => "vkGetPhysicalDeviceFeatures2",
            IcdCommand::GetPhysicalDeviceQueueFamilyProperties => {
                "vkGetPhysicalDeviceQueueFamilyProperties"
            }
            IcdCommand::GetPhysicalDeviceMemoryProperties => {
                "vkGetPhysicalDeviceMemoryProperties"
            }
            IcdCommand::GetPhysicalDeviceToolProperties => "vkGetPhysicalDeviceToolProperties",
            IcdCommand::EnumerateDeviceExtensionProperties => {
                "vkEnumerateDeviceExtensionProperties"
            }
            IcdCommand::CreateDevice => "vkCreateDevice",
            IcdCommand::DestroyDevice => "vkDestroyDevice",
            IcdCommand::GetDeviceProcAddr => "vkGetDeviceProcAddr",
            IcdCommand::DestroySurfaceKHR => "vkDestroySurfaceKHR",
            IcdCommand::GetPhysicalDeviceSurfaceSupportKHR => {
                "vkGetPhysicalDeviceSurfaceSupportKHR"
            }
            IcdCommand::GetPhysicalDeviceSurfaceCapabilitiesKHR => {
                "vkGetPhysicalDeviceSurfaceCapabilitiesKHR"
            }
            IcdCommand::GetPhysicalDeviceSurfaceFormatsKHR => {
                "vkGetPhysicalDeviceSurfaceFormatsKHR"
            }
            IcdCommand::GetPhysicalDeviceSurfacePresentModesKHR => {
                "vkGetPhysicalDeviceSurfacePresentModesKHR"
            }
            IcdCommand::CreateWin32SurfaceKHR => "vkCreateWin32SurfaceKHR",
            IcdCommand::CreateXlibSurfaceKHR => "vkCreateXlibSurfaceKHR",
            IcdCommand::CreateXcbSurfaceKHR => "vkCreateXcbSurfaceKHR",
            IcdCommand::CreateWaylandSurfaceKHR => "vkCreateWaylandSurfaceKHR",
            IcdCommand::GetPhysicalDeviceWin32PresentationSupportKHR => {
                "vkGetPhysicalDeviceWin32PresentationSupportKHR"
            }
            IcdCommand::GetPhysicalDeviceXlibPresentationSupportKHR => {
                "vkGetPhysicalDeviceXlibPresentationSupportKHR"
            }
            IcdCommand::GetPhysicalDeviceXcbPresentationSupportKHR => {
                "vkGetPhysicalDeviceXcbPresentationSupportKHR"
            }
            IcdCommand::GetPhysicalDeviceWaylandPresentationSupportKHR => {
                "vkGetPhysicalDeviceWaylandPresentationSupportKHR"
            }
            IcdCommand::CreateDebugUtilsMessengerEXT => "vkCreateDebugUtilsMessengerEXT",
            IcdCommand::DestroyDebugUtilsMessengerEXT => "vkDestroyDebugUtilsMessengerEXT",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.name() == name)
    }

    /// Window-system commands the loader implements itself when a driver
    /// does not export them.
    pub fn is_wsi(self) -> bool {
        matches!(
            self,
            IcdCommand::DestroySurfaceKHR
                | IcdCommand::GetPhysicalDeviceSurfaceSupportKHR
                | IcdCommand::GetPhysicalDeviceSurfaceCapabilitiesKHR
                | IcdCommand::GetPhysicalDeviceSurfaceFormatsKHR
                | IcdCommand::GetPhysicalDeviceSurfacePresentModesKHR
                | IcdCommand::CreateWin32SurfaceKHR
                | IcdCommand::CreateXlibSurfaceKHR
                | IcdCommand::CreateXcbSurfaceKHR
                | IcdCommand::CreateWaylandSurfaceKHR
                | IcdCommand::GetPhysicalDeviceWin32PresentationSupportKHR
                | IcdCommand::GetPhysicalDeviceXlibPresentationSupportKHR
                | IcdCommand::GetPhysicalDeviceXcbPresentationSupportKHR
                | IcdCommand::GetPhysicalDeviceWaylandPresentationSupportKHR
        )
    }
}

/// Per-driver capability table: which commands the driver exports, and at
/// which address. Populated once at load; read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct IcdDispatch {
    entries: Vec<(IcdCommand, ProcAddr)>,
}

impl IcdDispatch {
    /// Probe every known command through the driver's
    /// `vkGetInstanceProcAddr`.
    pub fn probe(backend: &dyn DriverBackend) -> Self {
        let mut entries = Vec::new();
        for command in IcdCommand::ALL {
            if let Some(addr) = backend.get_instance_proc_addr(command.name()) {
                entries.push((command, addr));
            }
        }
        Self { entries }
    }

    pub fn supports(&self, command: IcdCommand) -> bool {
        self.entries.iter().any(|(c, _)| *c == command)
    }

    pub fn get(&self, command: IcdCommand) -> Option<ProcAddr> {
        self.entries
            .iter()
            .find(|(c, _)| *c == command)
            .map(|(_, addr)| *addr)
    }

    /// Whether the command can be serviced for this driver at all, either
    /// by the driver or by the loader's own WSI implementation.
    pub fn can_service(&self, command: IcdCommand) -> bool {
        self.supports(command) || command.is_wsi()
    }
}

/// General classification of a physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysicalDeviceType {
    Other,
    IntegratedGpu,
    DiscreteGpu,
    VirtualGpu,
    Cpu,
}

/// What a driver reports for one of its physical devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDeviceInfo {
    pub name: String,
    pub api_version: ApiVersion,
    pub vendor_id: u32,
    pub device_id: u32,
    pub driver_id: u32,
    pub device_type: PhysicalDeviceType,
}

impl Default for PhysicalDeviceInfo {
    fn default() -> Self {
        Self {
            name: String::new(),
            api_version: ApiVersion::VK_1_0,
            vendor_id: 0,
            device_id: 0,
            driver_id: 0,
            device_type: PhysicalDeviceType::Other,
        }
    }
}

/// The driver side of the loader: what a loaded ICD library exposes.
///
/// Real drivers are reached through dynamically resolved entry points
/// (see [`crate::library`]); tests and embedders can supply in-process
/// implementations.
pub trait DriverBackend: Send + Sync {
    /// Run the driver's interface-version negotiation export. `None`
    /// means the export is absent and the legacy probe applies.
    fn negotiate_interface_version(&self, loader_max: u32) -> Option<u32>;

    /// Whether the legacy `vk_icdGetInstanceProcAddr` export exists.
    fn has_icd_get_instance_proc_addr(&self) -> bool {
        true
    }

    /// The driver's advertised instance api version.
    fn api_version(&self) -> ApiVersion;

    /// Resolve one command, as the driver's `vkGetInstanceProcAddr` would.
    fn get_instance_proc_addr(&self, name: &str) -> Option<ProcAddr>;

    /// Driver-side instance creation.
    fn create_instance(&self, api_version: ApiVersion, extensions: &[String]) -> Result<()>;

    fn destroy_instance(&self) {}

    fn enumerate_instance_extensions(&self) -> Vec<ExtensionProperties> {
        Vec::new()
    }

    fn enumerate_physical_devices(&self) -> Vec<PhysicalDeviceInfo>;

    /// Device groups as sets of driver-local device indices. `None` when
    /// the driver does not implement group enumeration; the loader then
    /// synthesizes singleton groups.
    fn enumerate_physical_device_groups(&self) -> Option<Vec<Vec<u32>>> {
        None
    }

    fn enumerate_device_extensions(&self, _device_index: u32) -> Vec<ExtensionProperties> {
        Vec::new()
    }

    /// Resolve a device-level command. `device` scopes the query to one
    /// created device; `None` asks generically, before any device exists.
    fn get_device_proc_addr(&self, device: Option<DeviceToken>, name: &str) -> Option<ProcAddr>;

    /// Driver-side device creation against one of its physical devices.
    /// The returned token names the created device in later calls.
    fn create_device(&self, _device_index: u32, _extensions: &[String]) -> Result<DeviceToken> {
        Ok(DeviceToken(0))
    }

    fn destroy_device(&self, _device: DeviceToken) {}
}

/// Loads driver libraries named by manifests.
pub trait DriverLoader: Send + Sync {
    fn load(&self, manifest: &DriverManifest) -> Result<Arc<dyn DriverBackend>>;
}

/// One usable driver: negotiated, probed, ready for the terminator.
pub struct DriverHandle {
    pub manifest: DriverManifest,
    pub backend: Arc<dyn DriverBackend>,
    pub interface_version: u32,
    pub dispatch: IcdDispatch,
}

impl std::fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverHandle")
            .field("manifest", &self.manifest.file_path)
            .field("interface_version", &self.interface_version)
            .finish()
    }
}

/// Load and negotiate one discovered driver.
pub fn load_driver(
    discovered: &DiscoveredDriver,
    loader: &dyn DriverLoader,
) -> Result<DriverHandle> {
    let manifest = &discovered.manifest;
    let backend = loader.load(manifest)?;

    let api_version = backend.api_version();
    if api_version.variant != 0 {
        return Err(LoaderError::DriverLoadFailed {
            path: manifest.library_path.clone(),
            reason: format!(
                "driver reports api_version {} with non-zero variant {}",
                api_version, api_version.variant
            ),
        });
    }

    let interface_version = match backend.negotiate_interface_version(LOADER_MAX_ICD_INTERFACE) {
        Some(version) => {
            if version > LOADER_MAX_ICD_INTERFACE {
                // A driver must never answer with a version above the
                // loader's offer; that is a protocol violation.
                debug_assert!(
                    version <= LOADER_MAX_ICD_INTERFACE,
                    "driver negotiated interface {version} above loader maximum"
                );
                return Err(LoaderError::DriverLoadFailed {
                    path: manifest.library_path.clone(),
                    reason: format!(
                        "negotiated interface version {version} exceeds loader maximum {LOADER_MAX_ICD_INTERFACE}"
                    ),
                });
            }
            version
        }
        // Legacy drivers: version 1 with vk_icdGetInstanceProcAddr,
        // version 0 with only a raw vkGetInstanceProcAddr export.
        None if backend.has_icd_get_instance_proc_addr() => 1,
        None => 0,
    };

    let dispatch = IcdDispatch::probe(backend.as_ref());
    if dispatch.get(IcdCommand::CreateInstance).is_none() {
        return Err(LoaderError::DriverLoadFailed {
            path: manifest.library_path.clone(),
            reason: "driver does not expose vkCreateInstance".into(),
        });
    }

    log::debug!(
        "Loaded driver {} (interface {}, api {})",
        manifest.library_path.display(),
        interface_version,
        manifest.api_version
    );

    Ok(DriverHandle {
        manifest: manifest.clone(),
        backend,
        interface_version,
        dispatch,
    })
}

/// Load every usable driver. Individual failures are logged and skipped;
/// only an empty result is an error, so a single bad driver can never mask
/// a good one.
pub fn load_drivers(
    discovered: &[DiscoveredDriver],
    loader: &dyn DriverLoader,
) -> Result<Vec<DriverHandle>> {
    let mut handles = Vec::new();
    for candidate in discovered {
        match load_driver(candidate, loader) {
            Ok(handle) => handles.push(handle),
            Err(e) => log::warn!("Skipping driver: {e}"),
        }
    }
    if handles.is_empty() {
        return Err(LoaderError::IncompatibleDriver);
    }
    Ok(handles)
}

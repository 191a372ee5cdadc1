//! Dynamic driver libraries
//!
//! Implements [`DriverBackend`] over a real ICD shared object: the library
//! is opened with `libloading`, the interface-negotiation and
//! `vk_icdGetInstanceProcAddr` exports are resolved, and every further
//! command goes through the driver's own proc-addr query. Structure
//! definitions here cover exactly the prefix of each Vulkan struct the
//! loader reads; output buffers are over-allocated past the real struct
//! sizes so a driver writing its full layout stays in bounds.

use std::collections::HashMap;
use std::ffi::CString;
use std::os::raw::{c_char, c_void};
use std::path::Path;

use libloading::Library;
use parking_lot::Mutex;

use crate::error::{LoaderError, Result};
use crate::icd::{
    DeviceToken, DriverBackend, DriverLoader, PhysicalDeviceInfo, PhysicalDeviceType, ProcAddr,
};
use crate::manifest::{DriverManifest, ExtensionProperties};
use crate::ApiVersion;

const VK_SUCCESS: i32 = 0;
const VK_INCOMPLETE: i32 = 5;
const VK_ERROR_OUT_OF_HOST_MEMORY: i32 = -1;
const VK_ERROR_INCOMPATIBLE_DRIVER: i32 = -9;

const VK_STRUCTURE_TYPE_APPLICATION_INFO: u32 = 0;
const VK_STRUCTURE_TYPE_INSTANCE_CREATE_INFO: u32 = 1;
const VK_STRUCTURE_TYPE_DEVICE_QUEUE_CREATE_INFO: u32 = 2;
const VK_STRUCTURE_TYPE_DEVICE_CREATE_INFO: u32 = 3;
const VK_STRUCTURE_TYPE_PHYSICAL_DEVICE_GROUP_PROPERTIES: u32 = 1000070000;

const VK_MAX_DEVICE_GROUP_SIZE: usize = 32;

type PfnVoidFunction = unsafe extern "system" fn();
type PfnGetInstanceProcAddr =
    unsafe extern "system" fn(usize, *const c_char) -> Option<PfnVoidFunction>;
type PfnNegotiateVersion = unsafe extern "system" fn(*mut u32) -> i32;
type PfnEnumerateInstanceVersion = unsafe extern "system" fn(*mut u32) -> i32;
type PfnCreateInstance =
    unsafe extern "system" fn(*const VkInstanceCreateInfo, *const c_void, *mut usize) -> i32;
type PfnDestroyInstance = unsafe extern "system" fn(usize, *const c_void);
type PfnEnumerateExtensionProperties =
    unsafe extern "system" fn(*const c_char, *mut u32, *mut VkExtensionProperties) -> i32;
type PfnEnumeratePhysicalDevices = unsafe extern "system" fn(usize, *mut u32, *mut usize) -> i32;
type PfnGetPhysicalDeviceProperties =
    unsafe extern "system" fn(usize, *mut VkPhysicalDeviceProperties);
type PfnEnumeratePhysicalDeviceGroups =
    unsafe extern "system" fn(usize, *mut u32, *mut VkPhysicalDeviceGroupProperties) -> i32;
type PfnEnumerateDeviceExtensionProperties = unsafe extern "system" fn(
    usize,
    *const c_char,
    *mut u32,
    *mut VkExtensionProperties,
) -> i32;
type PfnCreateDevice =
    unsafe extern "system" fn(usize, *const VkDeviceCreateInfo, *const c_void, *mut usize) -> i32;
type PfnDestroyDevice = unsafe extern "system" fn(usize, *const c_void);
type PfnGetDeviceProcAddr =
    unsafe extern "system" fn(usize, *const c_char) -> Option<PfnVoidFunction>;

#[repr(C)]
struct VkApplicationInfo {
    s_type: u32,
    p_next: *const c_void,
    p_application_name: *const c_char,
    application_version: u32,
    p_engine_name: *const c_char,
    engine_version: u32,
    api_version: u32,
}

#[repr(C)]
struct VkInstanceCreateInfo {
    s_type: u32,
    p_next: *const c_void,
    flags: u32,
    p_application_info: *const VkApplicationInfo,
    enabled_layer_count: u32,
    pp_enabled_layer_names: *const *const c_char,
    enabled_extension_count: u32,
    pp_enabled_extension_names: *const *const c_char,
}

#[repr(C)]
struct VkDeviceQueueCreateInfo {
    s_type: u32,
    p_next: *const c_void,
    flags: u32,
    queue_family_index: u32,
    queue_count: u32,
    p_queue_priorities: *const f32,
}

#[repr(C)]
struct VkDeviceCreateInfo {
    s_type: u32,
    p_next: *const c_void,
    flags: u32,
    queue_create_info_count: u32,
    p_queue_create_infos: *const VkDeviceQueueCreateInfo,
    enabled_layer_count: u32,
    pp_enabled_layer_names: *const *const c_char,
    enabled_extension_count: u32,
    pp_enabled_extension_names: *const *const c_char,
    p_enabled_features: *const c_void,
}

#[repr(C)]
struct VkExtensionProperties {
    extension_name: [u8; 256],
    spec_version: u32,
}

impl Default for VkExtensionProperties {
    fn default() -> Self {
        Self {
            extension_name: [0; 256],
            spec_version: 0,
        }
    }
}

/// Prefix layout of `VkPhysicalDeviceProperties`; the trailing byte arrays
/// oversize the limits and sparse-properties blocks so the driver's full
/// write fits.
#[repr(C, align(8))]
struct VkPhysicalDeviceProperties {
    api_version: u32,
    driver_version: u32,
    vendor_id: u32,
    device_id: u32,
    device_type: u32,
    device_name: [u8; 256],
    pipeline_cache_uuid: [u8; 16],
    limits: [u8; 512],
    sparse_properties: [u8; 40],
}

impl Default for VkPhysicalDeviceProperties {
    fn default() -> Self {
        Self {
            api_version: 0,
            driver_version: 0,
            vendor_id: 0,
            device_id: 0,
            device_type: 0,
            device_name: [0; 256],
            pipeline_cache_uuid: [0; 16],
            limits: [0; 512],
            sparse_properties: [0; 40],
        }
    }
}

#[repr(C)]
struct VkPhysicalDeviceGroupProperties {
    s_type: u32,
    p_next: *mut c_void,
    physical_device_count: u32,
    physical_devices: [usize; VK_MAX_DEVICE_GROUP_SIZE],
    subset_allocation: u32,
}

impl Default for VkPhysicalDeviceGroupProperties {
    fn default() -> Self {
        Self {
            s_type: VK_STRUCTURE_TYPE_PHYSICAL_DEVICE_GROUP_PROPERTIES,
            p_next: std::ptr::null_mut(),
            physical_device_count: 0,
            physical_devices: [0; VK_MAX_DEVICE_GROUP_SIZE],
            subset_allocation: 0,
        }
    }
}

fn map_vk_error(result: i32, context: &str) -> LoaderError {
    match result {
        VK_ERROR_OUT_OF_HOST_MEMORY => LoaderError::OutOfHostMemory,
        VK_ERROR_INCOMPATIBLE_DRIVER => LoaderError::IncompatibleDriver,
        _ => {
            log::warn!("Driver call {context} failed with VkResult {result}");
            LoaderError::InitializationFailed
        }
    }
}

fn c_string_array(names: &[String]) -> (Vec<CString>, Vec<*const c_char>) {
    let owned: Vec<CString> = names
        .iter()
        .filter_map(|n| CString::new(n.as_str()).ok())
        .collect();
    let pointers = owned.iter().map(|s| s.as_ptr()).collect();
    (owned, pointers)
}

fn string_from_c(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

struct DriverState {
    instance: usize,
    physical_devices: Vec<usize>,
    /// Live logical devices, keyed by the token handed to the loader.
    devices: HashMap<u64, usize>,
    next_device: u64,
}

impl Default for DriverState {
    fn default() -> Self {
        Self {
            instance: 0,
            physical_devices: Vec::new(),
            devices: HashMap::new(),
            next_device: 1,
        }
    }
}

/// One opened ICD shared object.
pub struct DynamicDriver {
    // Dropped last; every resolved pointer borrows from it
    _library: Library,
    gipa: PfnGetInstanceProcAddr,
    negotiate: Option<PfnNegotiateVersion>,
    has_icd_gipa: bool,
    state: Mutex<DriverState>,
}

// SAFETY: all raw entry points are immutable after open(); mutable driver
// state is behind the mutex, and ICDs are required to be thread-safe for
// the commands the loader calls concurrently.
unsafe impl Send for DynamicDriver {}
unsafe impl Sync for DynamicDriver {}

impl DynamicDriver {
    /// Open a driver library and resolve its loader-facing exports.
    pub fn open(path: &Path) -> Result<Self> {
        let failed = |reason: String| LoaderError::DriverLoadFailed {
            path: path.to_path_buf(),
            reason,
        };

        let library =
            unsafe { Library::new(path) }.map_err(|e| failed(format!("dlopen failed: {e}")))?;

        let mut has_icd_gipa = true;
        let gipa: PfnGetInstanceProcAddr = unsafe {
            match library.get::<PfnGetInstanceProcAddr>(b"vk_icdGetInstanceProcAddr\0") {
                Ok(symbol) => *symbol,
                Err(_) => {
                    has_icd_gipa = false;
                    *library
                        .get::<PfnGetInstanceProcAddr>(b"vkGetInstanceProcAddr\0")
                        .map_err(|e| failed(format!("no proc-addr export: {e}")))?
                }
            }
        };
        let negotiate = unsafe {
            library
                .get::<PfnNegotiateVersion>(b"vk_icdNegotiateLoaderICDInterfaceVersion\0")
                .ok()
                .map(|symbol| *symbol)
        };

        Ok(Self {
            _library: library,
            gipa,
            negotiate,
            has_icd_gipa,
            state: Mutex::new(DriverState::default()),
        })
    }

    fn resolve(&self, instance: usize, name: &str) -> Option<PfnVoidFunction> {
        let name = CString::new(name).ok()?;
        unsafe { (self.gipa)(instance, name.as_ptr()) }
    }

    fn resolve_typed<F: Copy>(&self, instance: usize, name: &str) -> Option<F> {
        debug_assert_eq!(
            std::mem::size_of::<F>(),
            std::mem::size_of::<PfnVoidFunction>()
        );
        self.resolve(instance, name)
            .map(|f| unsafe { std::mem::transmute_copy(&f) })
    }
}

impl DriverBackend for DynamicDriver {
    fn negotiate_interface_version(&self, loader_max: u32) -> Option<u32> {
        let negotiate = self.negotiate?;
        let mut version = loader_max;
        let result = unsafe { negotiate(&mut version) };
        if result != VK_SUCCESS {
            log::warn!("Driver rejected interface negotiation with VkResult {result}");
            // Reported above the loader's range so the load path skips it
            return Some(loader_max + 1);
        }
        Some(version)
    }

    fn has_icd_get_instance_proc_addr(&self) -> bool {
        self.has_icd_gipa
    }

    fn api_version(&self) -> ApiVersion {
        let Some(enumerate) =
            self.resolve_typed::<PfnEnumerateInstanceVersion>(0, "vkEnumerateInstanceVersion")
        else {
            return ApiVersion::VK_1_0;
        };
        let mut version = ApiVersion::VK_1_0.to_u32();
        if unsafe { enumerate(&mut version) } != VK_SUCCESS {
            return ApiVersion::VK_1_0;
        }
        ApiVersion::from_u32(version)
    }

    fn get_instance_proc_addr(&self, name: &str) -> Option<ProcAddr> {
        let instance = self.state.lock().instance;
        self.resolve(instance, name)
            .map(|f| ProcAddr(f as usize))
    }

    fn create_instance(&self, api_version: ApiVersion, extensions: &[String]) -> Result<()> {
        let create: PfnCreateInstance = self
            .resolve_typed(0, "vkCreateInstance")
            .ok_or(LoaderError::IncompatibleDriver)?;

        let application_info = VkApplicationInfo {
            s_type: VK_STRUCTURE_TYPE_APPLICATION_INFO,
            p_next: std::ptr::null(),
            p_application_name: std::ptr::null(),
            application_version: 0,
            p_engine_name: std::ptr::null(),
            engine_version: 0,
            api_version: api_version.to_u32(),
        };
        let (_extension_names, extension_pointers) = c_string_array(extensions);
        let create_info = VkInstanceCreateInfo {
            s_type: VK_STRUCTURE_TYPE_INSTANCE_CREATE_INFO,
            p_next: std::ptr::null(),
            flags: 0,
            p_application_info: &application_info,
            enabled_layer_count: 0,
            pp_enabled_layer_names: std::ptr::null(),
            enabled_extension_count: extension_pointers.len() as u32,
            pp_enabled_extension_names: extension_pointers.as_ptr(),
        };

        let mut instance = 0usize;
        let result = unsafe { create(&create_info, std::ptr::null(), &mut instance) };
        if result != VK_SUCCESS {
            return Err(map_vk_error(result, "vkCreateInstance"));
        }
        self.state.lock().instance = instance;
        Ok(())
    }

    fn destroy_instance(&self) {
        let mut state = self.state.lock();
        if state.instance == 0 {
            return;
        }
        if let Some(destroy) =
            self.resolve_typed::<PfnDestroyInstance>(state.instance, "vkDestroyInstance")
        {
            unsafe { destroy(state.instance, std::ptr::null()) };
        }
        state.instance = 0;
        state.physical_devices.clear();
        // Device handles are meaningless once their instance is gone
        state.devices.clear();
    }

    fn enumerate_instance_extensions(&self) -> Vec<ExtensionProperties> {
        let Some(enumerate) = self.resolve_typed::<PfnEnumerateExtensionProperties>(
            0,
            "vkEnumerateInstanceExtensionProperties",
        ) else {
            return Vec::new();
        };
        let mut count = 0u32;
        let result = unsafe { enumerate(std::ptr::null(), &mut count, std::ptr::null_mut()) };
        if result != VK_SUCCESS || count == 0 {
            return Vec::new();
        }
        let mut raw: Vec<VkExtensionProperties> =
            (0..count).map(|_| VkExtensionProperties::default()).collect();
        let result = unsafe { enumerate(std::ptr::null(), &mut count, raw.as_mut_ptr()) };
        if result != VK_SUCCESS && result != VK_INCOMPLETE {
            return Vec::new();
        }
        raw.truncate(count as usize);
        raw.iter()
            .map(|e| ExtensionProperties {
                name: string_from_c(&e.extension_name),
                spec_version: e.spec_version,
            })
            .collect()
    }

    fn enumerate_physical_devices(&self) -> Vec<PhysicalDeviceInfo> {
        let instance = self.state.lock().instance;
        if instance == 0 {
            return Vec::new();
        }
        let Some(enumerate) = self
            .resolve_typed::<PfnEnumeratePhysicalDevices>(instance, "vkEnumeratePhysicalDevices")
        else {
            return Vec::new();
        };
        let mut count = 0u32;
        if unsafe { enumerate(instance, &mut count, std::ptr::null_mut()) } != VK_SUCCESS {
            return Vec::new();
        }
        let mut handles = vec![0usize; count as usize];
        let result = unsafe { enumerate(instance, &mut count, handles.as_mut_ptr()) };
        if result != VK_SUCCESS && result != VK_INCOMPLETE {
            return Vec::new();
        }
        handles.truncate(count as usize);

        let get_properties = self.resolve_typed::<PfnGetPhysicalDeviceProperties>(
            instance,
            "vkGetPhysicalDeviceProperties",
        );
        let infos = handles
            .iter()
            .map(|&handle| {
                let mut properties = VkPhysicalDeviceProperties::default();
                if let Some(get_properties) = get_properties {
                    unsafe { get_properties(handle, &mut properties) };
                }
                PhysicalDeviceInfo {
                    name: string_from_c(&properties.device_name),
                    api_version: ApiVersion::from_u32(properties.api_version),
                    vendor_id: properties.vendor_id,
                    device_id: properties.device_id,
                    driver_id: 0,
                    device_type: match properties.device_type {
                        1 => PhysicalDeviceType::IntegratedGpu,
                        2 => PhysicalDeviceType::DiscreteGpu,
                        3 => PhysicalDeviceType::VirtualGpu,
                        4 => PhysicalDeviceType::Cpu,
                        _ => PhysicalDeviceType::Other,
                    },
                }
            })
            .collect();
        self.state.lock().physical_devices = handles;
        infos
    }

    fn enumerate_physical_device_groups(&self) -> Option<Vec<Vec<u32>>> {
        let state = self.state.lock();
        let instance = state.instance;
        if instance == 0 {
            return None;
        }
        let enumerate = self.resolve_typed::<PfnEnumeratePhysicalDeviceGroups>(
            instance,
            "vkEnumeratePhysicalDeviceGroups",
        )?;
        let mut count = 0u32;
        if unsafe { enumerate(instance, &mut count, std::ptr::null_mut()) } != VK_SUCCESS {
            return None;
        }
        let mut raw: Vec<VkPhysicalDeviceGroupProperties> = (0..count)
            .map(|_| VkPhysicalDeviceGroupProperties::default())
            .collect();
        let result = unsafe { enumerate(instance, &mut count, raw.as_mut_ptr()) };
        if result != VK_SUCCESS && result != VK_INCOMPLETE {
            return None;
        }
        raw.truncate(count as usize);

        // Translate raw device handles back to driver-local indices
        let groups = raw
            .iter()
            .map(|group| {
                group.physical_devices[..group.physical_device_count as usize]
                    .iter()
                    .filter_map(|handle| {
                        state
                            .physical_devices
                            .iter()
                            .position(|h| h == handle)
                            .map(|i| i as u32)
                    })
                    .collect()
            })
            .collect();
        Some(groups)
    }

    fn enumerate_device_extensions(&self, device_index: u32) -> Vec<ExtensionProperties> {
        let (instance, handle) = {
            let state = self.state.lock();
            match state.physical_devices.get(device_index as usize) {
                Some(&handle) => (state.instance, handle),
                None => return Vec::new(),
            }
        };
        let Some(enumerate) = self.resolve_typed::<PfnEnumerateDeviceExtensionProperties>(
            instance,
            "vkEnumerateDeviceExtensionProperties",
        ) else {
            return Vec::new();
        };
        let mut count = 0u32;
        let result =
            unsafe { enumerate(handle, std::ptr::null(), &mut count, std::ptr::null_mut()) };
        if result != VK_SUCCESS || count == 0 {
            return Vec::new();
        }
        let mut raw: Vec<VkExtensionProperties> =
            (0..count).map(|_| VkExtensionProperties::default()).collect();
        let result = unsafe { enumerate(handle, std::ptr::null(), &mut count, raw.as_mut_ptr()) };
        if result != VK_SUCCESS && result != VK_INCOMPLETE {
            return Vec::new();
        }
        raw.truncate(count as usize);
        raw.iter()
            .map(|e| ExtensionProperties {
                name: string_from_c(&e.extension_name),
                spec_version: e.spec_version,
            })
            .collect()
    }

    fn get_device_proc_addr(&self, device: Option<DeviceToken>, name: &str) -> Option<ProcAddr> {
        let Some(token) = device else {
            // Generic query: answer from the instance-level resolution
            return self.get_instance_proc_addr(name);
        };
        let (instance, handle) = {
            let state = self.state.lock();
            let handle = state.devices.get(&token.0).copied()?;
            (state.instance, handle)
        };
        let gdpa: PfnGetDeviceProcAddr = self.resolve_typed(instance, "vkGetDeviceProcAddr")?;
        let name = CString::new(name).ok()?;
        unsafe { gdpa(handle, name.as_ptr()) }.map(|f| ProcAddr(f as usize))
    }

    fn create_device(&self, device_index: u32, extensions: &[String]) -> Result<DeviceToken> {
        let (instance, handle) = {
            let state = self.state.lock();
            let handle = state
                .physical_devices
                .get(device_index as usize)
                .copied()
                .ok_or(LoaderError::InitializationFailed)?;
            (state.instance, handle)
        };
        let create: PfnCreateDevice = self
            .resolve_typed(instance, "vkCreateDevice")
            .ok_or(LoaderError::IncompatibleDriver)?;

        let priority = 1.0f32;
        let queue_info = VkDeviceQueueCreateInfo {
            s_type: VK_STRUCTURE_TYPE_DEVICE_QUEUE_CREATE_INFO,
            p_next: std::ptr::null(),
            flags: 0,
            queue_family_index: 0,
            queue_count: 1,
            p_queue_priorities: &priority,
        };
        let (_extension_names, extension_pointers) = c_string_array(extensions);
        let create_info = VkDeviceCreateInfo {
            s_type: VK_STRUCTURE_TYPE_DEVICE_CREATE_INFO,
            p_next: std::ptr::null(),
            flags: 0,
            queue_create_info_count: 1,
            p_queue_create_infos: &queue_info,
            enabled_layer_count: 0,
            pp_enabled_layer_names: std::ptr::null(),
            enabled_extension_count: extension_pointers.len() as u32,
            pp_enabled_extension_names: extension_pointers.as_ptr(),
            p_enabled_features: std::ptr::null(),
        };

        let mut device = 0usize;
        let result = unsafe { create(handle, &create_info, std::ptr::null(), &mut device) };
        if result != VK_SUCCESS {
            return Err(map_vk_error(result, "vkCreateDevice"));
        }
        let mut state = self.state.lock();
        let token = state.next_device;
        state.next_device += 1;
        state.devices.insert(token, device);
        Ok(DeviceToken(token))
    }

    fn destroy_device(&self, device: DeviceToken) {
        let (instance, handle) = {
            let mut state = self.state.lock();
            match state.devices.remove(&device.0) {
                Some(handle) => (state.instance, handle),
                None => return,
            }
        };
        if let Some(destroy) = self.resolve_typed::<PfnDestroyDevice>(instance, "vkDestroyDevice")
        {
            unsafe { destroy(handle, std::ptr::null()) };
        }
    }
}

impl Drop for DynamicDriver {
    fn drop(&mut self) {
        let tokens: Vec<u64> = self.state.lock().devices.keys().copied().collect();
        for token in tokens {
            self.destroy_device(DeviceToken(token));
        }
        self.destroy_instance();
    }
}

/// Default [`DriverLoader`]: opens the manifest's library with the dynamic
/// linker. Manifests naming the same object are deduplicated at scan time,
/// so each load maps a distinct library.
#[derive(Debug, Default)]
pub struct DynamicDriverLoader;

impl DynamicDriverLoader {
    pub fn new() -> Self {
        Self
    }
}

impl DriverLoader for DynamicDriverLoader {
    fn load(&self, manifest: &DriverManifest) -> Result<std::sync::Arc<dyn DriverBackend>> {
        let driver = DynamicDriver::open(&manifest.library_path)?;
        Ok(std::sync::Arc::new(driver))
    }
}

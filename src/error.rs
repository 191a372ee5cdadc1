//! Loader error taxonomy
//!
//! Internally the loader works with [`LoaderError`]; at the API boundary
//! every failure collapses to a Vulkan result code via
//! [`LoaderError::vk_result`]. Configuration problems (bad manifests,
//! unreadable files) never show up here at all: they are logged and the
//! offending record is skipped during the scan.

use std::path::PathBuf;

use thiserror::Error;

/// Vulkan result codes the loader core can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VkResult {
    Success,
    Incomplete,
    ErrorOutOfHostMemory,
    ErrorInitializationFailed,
    ErrorLayerNotPresent,
    ErrorExtensionNotPresent,
    ErrorIncompatibleDriver,
}

impl VkResult {
    pub fn is_success(self) -> bool {
        matches!(self, VkResult::Success | VkResult::Incomplete)
    }
}

/// Errors produced by the loader core.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// A layer explicitly requested by the application could not be resolved.
    #[error("layer \"{0}\" is not present")]
    LayerNotPresent(String),

    /// A requested extension is not provided by any active layer or driver.
    #[error("extension \"{0}\" is not present")]
    ExtensionNotPresent(String),

    /// No driver usable by this loader remained after the scan.
    #[error("no compatible Vulkan driver found")]
    IncompatibleDriver,

    /// The caller-provided allocator refused an allocation.
    #[error("out of host memory")]
    OutOfHostMemory,

    /// A driver library failed to load or negotiate.
    #[error("driver \"{path}\" failed to load: {reason}")]
    DriverLoadFailed { path: PathBuf, reason: String },

    /// A manifest failed parsing or validation.
    #[error("manifest \"{path}\": {reason}")]
    ManifestInvalid { path: PathBuf, reason: String },

    /// Instance or device level initialization failed in every driver.
    #[error("initialization failed")]
    InitializationFailed,
}

impl LoaderError {
    /// Map to the Vulkan result code surfaced to the application.
    pub fn vk_result(&self) -> VkResult {
        match self {
            LoaderError::LayerNotPresent(_) => VkResult::ErrorLayerNotPresent,
            LoaderError::ExtensionNotPresent(_) => VkResult::ErrorExtensionNotPresent,
            LoaderError::IncompatibleDriver => VkResult::ErrorIncompatibleDriver,
            LoaderError::OutOfHostMemory => VkResult::ErrorOutOfHostMemory,
            LoaderError::DriverLoadFailed { .. } => VkResult::ErrorIncompatibleDriver,
            LoaderError::ManifestInvalid { .. } => VkResult::ErrorInitializationFailed,
            LoaderError::InitializationFailed => VkResult::ErrorInitializationFailed,
        }
    }
}

pub type Result<T> = std::result::Result<T, LoaderError>;

//! Vulkan loader core
//!
//! This crate implements the part of a Vulkan loader that sits between an
//! application and one or more installed drivers (ICDs) plus optional layers:
//! manifest discovery, driver and layer registries, per-instance layer
//! resolution, dispatch-chain construction, and the terminator that fans
//! calls out across drivers and aggregates their results.
//!
//! The platform surface glue (window-system surface creation, DXGI shims)
//! is not part of this crate; drivers and layers reach the loader through
//! the [`icd::DriverBackend`] and [`chain::LayerInterceptor`] seams.

pub mod allocation;
pub mod chain;
pub mod device;
pub mod environment;
pub mod error;
pub mod icd;
pub mod instance;
pub mod layer;
pub mod library;
pub mod locate;
pub mod manifest;
pub mod physical_device;
pub mod resolve;
pub mod settings;
pub mod terminator;
pub mod testing;

pub use device::Device;
pub use error::{LoaderError, Result, VkResult};
pub use instance::{InstanceCreateInfo, Loader, LoaderInstance};

/// Packed Vulkan API version.
///
/// Layout matches `VK_MAKE_API_VERSION`: variant in the top 3 bits, then
/// 7 bits of major, 10 bits of minor, 12 bits of patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion {
    pub variant: u32,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ApiVersion {
    pub const VK_1_0: Self = Self::new(1, 0, 0);
    pub const VK_1_1: Self = Self::new(1, 1, 0);
    pub const VK_1_2: Self = Self::new(1, 2, 0);
    pub const VK_1_3: Self = Self::new(1, 3, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            variant: 0,
            major,
            minor,
            patch,
        }
    }

    pub fn to_u32(self) -> u32 {
        (self.variant << 29) | (self.major << 22) | (self.minor << 12) | self.patch
    }

    pub fn from_u32(version: u32) -> Self {
        Self {
            variant: version >> 29,
            major: (version >> 22) & 0x7F,
            minor: (version >> 12) & 0x3FF,
            patch: version & 0xFFF,
        }
    }

    /// Parse a manifest-style `"major.minor.patch"` string.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => 0,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            variant: 0,
            major,
            minor,
            patch,
        })
    }

    /// Compare ignoring the patch field, the way layer/driver compatibility
    /// checks do.
    pub fn major_minor(self) -> (u32, u32) {
        (self.major, self.minor)
    }
}

impl core::fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

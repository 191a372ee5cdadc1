//! Loader settings file
//!
//! A valid settings file is authoritative over layer activation: listed
//! layers obey their `control` value, and layers discovered outside the
//! file slot in at the `unordered_layer_location` marker. User-writable
//! locations are ignored for elevated processes; only `/etc` is trusted
//! then.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::environment::{secure_var, EnvSource};
use crate::error::LoaderError;
use crate::ApiVersion;

/// File name searched for in each settings directory.
pub const SETTINGS_FILE_NAME: &str = "vk_loader_settings.json";

/// Minimum file format version for settings files.
const SETTINGS_MIN_FORMAT: ApiVersion = ApiVersion::new(1, 0, 0);

/// Per-layer control from the settings file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerControl {
    /// Force-enabled, even against the layer's own disable variable.
    On,
    /// Removed, even if the application or an env var requests it.
    Off,
    /// Normal implicit/explicit activation semantics.
    Auto,
    /// Marker entry: layers not listed in the file activate here.
    UnorderedLayerLocation,
}

impl LayerControl {
    fn parse(text: &str) -> Option<Self> {
        match text {
            "on" => Some(LayerControl::On),
            "off" => Some(LayerControl::Off),
            "auto" => Some(LayerControl::Auto),
            "unordered_layer_location" => Some(LayerControl::UnorderedLayerLocation),
            _ => None,
        }
    }
}

/// One `layers` entry from the settings file.
#[derive(Debug, Clone)]
pub struct LayerConfiguration {
    pub name: String,
    pub path: PathBuf,
    pub control: LayerControl,
    pub treat_as_implicit_manifest: bool,
}

/// Parsed settings file.
#[derive(Debug, Clone, Default)]
pub struct LoaderSettings {
    pub file_path: PathBuf,
    pub layer_configurations: Vec<LayerConfiguration>,
    pub stderr_log: Vec<String>,
    pub app_keys: Vec<String>,
}

impl LoaderSettings {
    /// Whether the file contains an `unordered_layer_location` marker.
    pub fn unordered_position(&self) -> Option<usize> {
        self.layer_configurations
            .iter()
            .position(|c| c.control == LayerControl::UnorderedLayerLocation)
    }
}

#[derive(Deserialize)]
struct SettingsFileJson {
    file_format_version: String,
    settings: SettingsJson,
}

#[derive(Deserialize)]
struct SettingsJson {
    #[serde(default)]
    layers: Vec<LayerConfigurationJson>,
    #[serde(default)]
    stderr_log: Vec<String>,
    #[serde(default)]
    app_keys: Vec<String>,
}

#[derive(Deserialize)]
struct LayerConfigurationJson {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    path: Option<String>,
    control: String,
    #[serde(default)]
    treat_as_implicit_manifest: bool,
}

impl LoaderSettings {
    pub fn parse_file(path: &Path) -> Result<Self, LoaderError> {
        let text = fs::read_to_string(path).map_err(|e| LoaderError::ManifestInvalid {
            path: path.to_path_buf(),
            reason: format!("unreadable: {e}"),
        })?;
        Self::parse(path, &text)
    }

    pub fn parse(path: &Path, text: &str) -> Result<Self, LoaderError> {
        let invalid = |reason: String| LoaderError::ManifestInvalid {
            path: path.to_path_buf(),
            reason,
        };

        let json: SettingsFileJson =
            serde_json::from_str(text).map_err(|e| invalid(format!("malformed JSON: {e}")))?;

        let format_version = ApiVersion::parse(&json.file_format_version)
            .ok_or_else(|| invalid(format!("bad file_format_version \"{}\"", json.file_format_version)))?;
        if format_version < SETTINGS_MIN_FORMAT {
            return Err(invalid(format!(
                "settings format {format_version} below minimum {SETTINGS_MIN_FORMAT}"
            )));
        }

        let mut layer_configurations = Vec::with_capacity(json.settings.layers.len());
        for entry in json.settings.layers {
            let Some(control) = LayerControl::parse(&entry.control) else {
                log::warn!(
                    "Settings {}: unknown layer control \"{}\", entry dropped",
                    path.display(),
                    entry.control
                );
                continue;
            };
            if control == LayerControl::UnorderedLayerLocation {
                layer_configurations.push(LayerConfiguration {
                    name: String::new(),
                    path: PathBuf::new(),
                    control,
                    treat_as_implicit_manifest: false,
                });
                continue;
            }
            let (Some(name), Some(layer_path)) = (entry.name, entry.path) else {
                log::warn!(
                    "Settings {}: layer configuration missing name or path, entry dropped",
                    path.display()
                );
                continue;
            };
            layer_configurations.push(LayerConfiguration {
                name,
                path: PathBuf::from(layer_path),
                control,
                treat_as_implicit_manifest: entry.treat_as_implicit_manifest,
            });
        }

        Ok(Self {
            file_path: path.to_path_buf(),
            layer_configurations,
            stderr_log: json.settings.stderr_log,
            app_keys: json.settings.app_keys,
        })
    }

    /// Locate and parse the active settings file, most-trusted location
    /// last only for elevated processes: user locations are consulted
    /// first, then `/etc`.
    pub fn find(env: &dyn EnvSource) -> Option<Self> {
        for candidate in settings_search_paths(env) {
            if !candidate.is_file() {
                continue;
            }
            match Self::parse_file(&candidate) {
                Ok(settings) => {
                    log::info!("Using loader settings file {}", candidate.display());
                    return Some(settings);
                }
                Err(e) => {
                    log::warn!("Ignoring settings file: {e}");
                }
            }
        }
        None
    }
}

fn settings_search_paths(env: &dyn EnvSource) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    // user-writable locations are unsecure for elevated processes
    if let Some(home) = secure_var(env, "HOME") {
        paths.push(
            PathBuf::from(home)
                .join(".local/share/vulkan/loader_settings.d")
                .join(SETTINGS_FILE_NAME),
        );
    }
    if let Some(xdg) = secure_var(env, "XDG_DATA_HOME") {
        paths.push(
            PathBuf::from(xdg)
                .join("vulkan/loader_settings.d")
                .join(SETTINGS_FILE_NAME),
        );
    }
    paths.push(
        PathBuf::from("/etc/vulkan/loader_settings.d").join(SETTINGS_FILE_NAME),
    );
    paths
}

//! Manifest parsing and validation
//!
//! Driver manifests carry a single `ICD` object; layer manifests carry one
//! layer under `"layer"` or several under `"layers"`, with declaration
//! order preserved. Fields gated on the file format version are refused
//! when the declared version is too old to carry them. A non-zero variant
//! in a packed api version fails a driver manifest outright; for a layer
//! it only skips that layer, never the whole file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::LoaderError;
use crate::layer::{EnvCondition, LayerKind, LayerRecord};
use crate::ApiVersion;

/// Minimum format version allowing `component_layers`.
const FORMAT_COMPONENT_LAYERS: ApiVersion = ApiVersion::new(1, 1, 0);
/// Minimum format version allowing `override_paths` and
/// `pre_instance_functions`.
const FORMAT_OVERRIDE_PATHS: ApiVersion = ApiVersion::new(1, 1, 2);
/// Minimum format version allowing `app_keys`.
const FORMAT_APP_KEYS: ApiVersion = ApiVersion::new(1, 2, 0);

/// Instance-level extension advertised by a layer or driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionProperties {
    pub name: String,
    pub spec_version: u32,
}

/// Device-level extension advertised by a layer, with the entry points the
/// layer itself implements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceExtension {
    pub name: String,
    pub spec_version: u32,
    pub entry_points: Vec<String>,
}

/// Parsed driver manifest.
#[derive(Debug, Clone)]
pub struct DriverManifest {
    pub file_path: PathBuf,
    pub format_version: ApiVersion,
    pub library_path: PathBuf,
    pub api_version: ApiVersion,
    pub is_portability_driver: bool,
}

#[derive(Deserialize)]
struct DriverManifestJson {
    file_format_version: String,
    #[serde(rename = "ICD")]
    icd: IcdJson,
}

#[derive(Deserialize)]
struct IcdJson {
    library_path: String,
    api_version: String,
    #[serde(default)]
    is_portability_driver: bool,
}

impl DriverManifest {
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

        let json: DriverManifestJson =
            serde_json::from_str(text).map_err(|e| invalid(format!("malformed JSON: {e}")))?;

        let format_version = ApiVersion::parse(&json.file_format_version)
            .ok_or_else(|| invalid(format!("bad file_format_version \"{}\"", json.file_format_version)))?;

        let api_version = ApiVersion::parse(&json.icd.api_version)
            .ok_or_else(|| invalid(format!("bad api_version \"{}\"", json.icd.api_version)))?;
        if api_version.variant != 0 {
            return Err(invalid(format!(
                "driver api_version {} has non-zero variant {}",
                api_version, api_version.variant
            )));
        }

        let library_path = resolve_library_path(path, &json.icd.library_path);

        Ok(Self {
            file_path: path.to_path_buf(),
            format_version,
            library_path,
            api_version,
            is_portability_driver: json.icd.is_portability_driver,
        })
    }
}

#[derive(Deserialize)]
struct LayerManifestJson {
    file_format_version: String,
    #[serde(default)]
    layer: Option<LayerJson>,
    #[serde(default)]
    layers: Option<Vec<LayerJson>>,
}

#[derive(Deserialize)]
struct LayerJson {
    name: String,
    #[serde(rename = "type", default)]
    layer_type: Option<String>,
    #[serde(default)]
    library_path: Option<String>,
    api_version: String,
    #[serde(default)]
    implementation_version: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    enable_environment: Option<BTreeMap<String, String>>,
    #[serde(default)]
    disable_environment: Option<BTreeMap<String, String>>,
    #[serde(default)]
    component_layers: Vec<String>,
    #[serde(default)]
    blacklisted_layers: Vec<String>,
    #[serde(default)]
    override_paths: Vec<String>,
    #[serde(default)]
    app_keys: Vec<String>,
    #[serde(default)]
    instance_extensions: Vec<ExtensionJson>,
    #[serde(default)]
    device_extensions: Vec<DeviceExtensionJson>,
    #[serde(default)]
    pre_instance_functions: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize)]
struct ExtensionJson {
    name: String,
    #[serde(default)]
    spec_version: Option<String>,
}

#[derive(Deserialize)]
struct DeviceExtensionJson {
    name: String,
    #[serde(default)]
    spec_version: Option<String>,
    #[serde(default)]
    entrypoints: Vec<String>,
}

/// Parsed layer manifest: one file, one or more layers in declaration
/// order.
#[derive(Debug, Clone)]
pub struct LayerManifest {
    pub file_path: PathBuf,
    pub format_version: ApiVersion,
    pub layers: Vec<LayerRecord>,
}

impl LayerManifest {
    pub fn parse_file(path: &Path, kind: LayerKind) -> Result<Self, LoaderError> {
        let text = fs::read_to_string(path).map_err(|e| LoaderError::ManifestInvalid {
            path: path.to_path_buf(),
            reason: format!("unreadable: {e}"),
        })?;
        Self::parse(path, &text, kind)
    }

    /// Parse the manifest. `kind` is the discovery category (implicit vs
    /// explicit directory); individual layers can still upgrade themselves
    /// to meta layers via `component_layers`.
    pub fn parse(path: &Path, text: &str, kind: LayerKind) -> Result<Self, LoaderError> {
        let invalid = |reason: String| LoaderError::ManifestInvalid {
            path: path.to_path_buf(),
            reason,
        };

        let json: LayerManifestJson =
            serde_json::from_str(text).map_err(|e| invalid(format!("malformed JSON: {e}")))?;

        let format_version = ApiVersion::parse(&json.file_format_version)
            .ok_or_else(|| invalid(format!("bad file_format_version \"{}\"", json.file_format_version)))?;

        let declared: Vec<LayerJson> = match (json.layer, json.layers) {
            (Some(single), None) => vec![single],
            (None, Some(multi)) => multi,
            (Some(single), Some(mut multi)) => {
                // Tolerated: the single entry enumerates first
                multi.insert(0, single);
                multi
            }
            (None, None) => return Err(invalid("no \"layer\" or \"layers\" entry".into())),
        };

        let mut layers = Vec::with_capacity(declared.len());
        for layer_json in declared {
            match convert_layer(path, format_version, layer_json, kind) {
                Ok(record) => layers.push(record),
                Err(reason) => {
                    // A bad layer never fails the rest of the file
                    log::warn!("Manifest {}: skipping layer: {}", path.display(), reason);
                }
            }
        }

        Ok(Self {
            file_path: path.to_path_buf(),
            format_version,
            layers,
        })
    }
}

fn convert_layer(
    path: &Path,
    format_version: ApiVersion,
    json: LayerJson,
    kind: LayerKind,
) -> Result<LayerRecord, String> {
    if !json.name.starts_with("VK_LAYER_") {
        return Err(format!("layer name \"{}\" is not well formed", json.name));
    }
    if let Some(t) = &json.layer_type {
        if !matches!(t.as_str(), "INSTANCE" | "GLOBAL" | "DEVICE") {
            return Err(format!("layer \"{}\" has unknown type \"{}\"", json.name, t));
        }
    }

    let api_version = ApiVersion::parse(&json.api_version)
        .ok_or_else(|| format!("layer \"{}\" has bad api_version \"{}\"", json.name, json.api_version))?;
    if api_version.variant != 0 {
        return Err(format!(
            "layer \"{}\" declares api_version {} with non-zero variant {}",
            json.name, api_version, api_version.variant
        ));
    }

    if !json.component_layers.is_empty() && format_version < FORMAT_COMPONENT_LAYERS {
        return Err(format!(
            "layer \"{}\" uses component_layers but file format {} predates {}",
            json.name, format_version, FORMAT_COMPONENT_LAYERS
        ));
    }
    if !json.override_paths.is_empty() && format_version < FORMAT_OVERRIDE_PATHS {
        return Err(format!(
            "layer \"{}\" uses override_paths but file format {} predates {}",
            json.name, format_version, FORMAT_OVERRIDE_PATHS
        ));
    }
    if json.pre_instance_functions.is_some() && format_version < FORMAT_OVERRIDE_PATHS {
        return Err(format!(
            "layer \"{}\" uses pre_instance_functions but file format {} predates {}",
            json.name, format_version, FORMAT_OVERRIDE_PATHS
        ));
    }
    if !json.app_keys.is_empty() && format_version < FORMAT_APP_KEYS {
        return Err(format!(
            "layer \"{}\" uses app_keys but file format {} predates {}",
            json.name, format_version, FORMAT_APP_KEYS
        ));
    }

    let is_meta = !json.component_layers.is_empty();
    if is_meta && json.library_path.is_some() {
        return Err(format!(
            "meta layer \"{}\" must not declare a library_path",
            json.name
        ));
    }
    if !is_meta && json.library_path.is_none() {
        return Err(format!("layer \"{}\" declares no library_path", json.name));
    }
    if json.component_layers.iter().any(|c| c == &json.name) {
        return Err(format!("meta layer \"{}\" lists itself as a component", json.name));
    }

    let kind = if is_meta { LayerKind::Meta } else { kind };

    Ok(LayerRecord {
        name: json.name,
        manifest_path: path.to_path_buf(),
        kind,
        api_version,
        implementation_version: json
            .implementation_version
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        description: json.description.unwrap_or_default(),
        library_path: json
            .library_path
            .map(|lp| resolve_library_path(path, &lp)),
        enable_environment: json.enable_environment.and_then(first_condition),
        disable_environment: json.disable_environment.and_then(first_condition),
        component_layers: json.component_layers,
        blacklisted_layers: json.blacklisted_layers,
        override_paths: json.override_paths.into_iter().map(PathBuf::from).collect(),
        app_keys: json.app_keys,
        instance_extensions: json
            .instance_extensions
            .into_iter()
            .map(|e| ExtensionProperties {
                name: e.name,
                spec_version: e.spec_version.as_deref().and_then(|v| v.parse().ok()).unwrap_or(1),
            })
            .collect(),
        device_extensions: json
            .device_extensions
            .into_iter()
            .map(|e| DeviceExtension {
                name: e.name,
                spec_version: e.spec_version.as_deref().and_then(|v| v.parse().ok()).unwrap_or(1),
                entry_points: e.entrypoints,
            })
            .collect(),
        pre_instance_functions: json
            .pre_instance_functions
            .map(|m| m.into_keys().collect())
            .unwrap_or_default(),
        control: None,
    })
}

fn first_condition(map: BTreeMap<String, String>) -> Option<EnvCondition> {
    map.into_iter()
        .next()
        .map(|(var, value)| EnvCondition { var, value })
}

/// A manifest library path may be absolute, bare (resolved through the
/// system loader search) or relative to the manifest file.
fn resolve_library_path(manifest: &Path, library_path: &str) -> PathBuf {
    let lib = Path::new(library_path);
    if lib.is_absolute() || lib.components().count() == 1 {
        return lib.to_path_buf();
    }
    match manifest.parent() {
        Some(dir) => dir.join(lib),
        None => lib.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_manifest_parse() {
        let text = r#"{
            "file_format_version": "1.0.1",
            "ICD": { "library_path": "/drivers/libvk_test.so", "api_version": "1.2.0" }
        }"#;
        let manifest = DriverManifest::parse(Path::new("/icd/test.json"), text).unwrap();
        assert_eq!(manifest.api_version, ApiVersion::VK_1_2);
        assert_eq!(manifest.library_path, PathBuf::from("/drivers/libvk_test.so"));
        assert!(!manifest.is_portability_driver);
    }

    #[test]
    fn test_driver_manifest_rejects_variant() {
        // variant 1 packed into the version string is not expressible in
        // x.y.z form, so drivers declare it via a major above 0x7F mask;
        // model it directly through ApiVersion::parse failure paths
        let text = r#"{
            "file_format_version": "1.0.0",
            "ICD": { "library_path": "a.so", "api_version": "not-a-version" }
        }"#;
        assert!(DriverManifest::parse(Path::new("/icd/bad.json"), text).is_err());
    }

    #[test]
    fn test_relative_library_path_resolves_against_manifest() {
        let text = r#"{
            "file_format_version": "1.0.0",
            "ICD": { "library_path": "./sub/libvk.so", "api_version": "1.1.0" }
        }"#;
        let manifest = DriverManifest::parse(Path::new("/icd/d/test.json"), text).unwrap();
        assert_eq!(manifest.library_path, PathBuf::from("/icd/d/./sub/libvk.so"));

        let text = r#"{
            "file_format_version": "1.0.0",
            "ICD": { "library_path": "libvk.so", "api_version": "1.1.0" }
        }"#;
        let manifest = DriverManifest::parse(Path::new("/icd/d/test.json"), text).unwrap();
        // bare names go through the system library search
        assert_eq!(manifest.library_path, PathBuf::from("libvk.so"));
    }

    #[test]
    fn test_layer_manifest_single() {
        let text = r#"{
            "file_format_version": "1.1.0",
            "layer": {
                "name": "VK_LAYER_test_single",
                "type": "GLOBAL",
                "library_path": "/layers/libtest.so",
                "api_version": "1.1.0",
                "implementation_version": "2",
                "description": "test layer",
                "disable_environment": { "DISABLE_TEST": "1" }
            }
        }"#;
        let manifest =
            LayerManifest::parse(Path::new("/l/test.json"), text, LayerKind::Implicit).unwrap();
        assert_eq!(manifest.layers.len(), 1);
        let layer = &manifest.layers[0];
        assert_eq!(layer.name, "VK_LAYER_test_single");
        assert_eq!(layer.implementation_version, 2);
        assert_eq!(layer.kind, LayerKind::Implicit);
        assert_eq!(
            layer.disable_environment.as_ref().unwrap().var,
            "DISABLE_TEST"
        );
    }

    #[test]
    fn test_layer_manifest_multiple_preserves_order() {
        let text = r#"{
            "file_format_version": "1.0.1",
            "layers": [
                { "name": "VK_LAYER_first", "type": "GLOBAL", "library_path": "a.so", "api_version": "1.0.0" },
                { "name": "VK_LAYER_second", "type": "GLOBAL", "library_path": "b.so", "api_version": "1.0.0" },
                { "name": "VK_LAYER_third", "type": "GLOBAL", "library_path": "c.so", "api_version": "1.0.0" }
            ]
        }"#;
        let manifest =
            LayerManifest::parse(Path::new("/l/multi.json"), text, LayerKind::Explicit).unwrap();
        let names: Vec<_> = manifest.layers.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, ["VK_LAYER_first", "VK_LAYER_second", "VK_LAYER_third"]);
    }

    #[test]
    fn test_bad_layer_skipped_not_fatal() {
        let text = r#"{
            "file_format_version": "1.0.1",
            "layers": [
                { "name": "NOT_A_LAYER_NAME", "library_path": "a.so", "api_version": "1.0.0" },
                { "name": "VK_LAYER_good", "library_path": "b.so", "api_version": "1.0.0" }
            ]
        }"#;
        let manifest =
            LayerManifest::parse(Path::new("/l/mixed.json"), text, LayerKind::Explicit).unwrap();
        assert_eq!(manifest.layers.len(), 1);
        assert_eq!(manifest.layers[0].name, "VK_LAYER_good");
    }

    #[test]
    fn test_component_layers_need_format_version() {
        let text = r#"{
            "file_format_version": "1.0.0",
            "layer": {
                "name": "VK_LAYER_meta",
                "api_version": "1.1.0",
                "component_layers": [ "VK_LAYER_a", "VK_LAYER_b" ]
            }
        }"#;
        let manifest =
            LayerManifest::parse(Path::new("/l/meta.json"), text, LayerKind::Explicit).unwrap();
        assert!(manifest.layers.is_empty());

        let text = text.replace("1.0.0", "1.1.0");
        let manifest =
            LayerManifest::parse(Path::new("/l/meta.json"), &text, LayerKind::Explicit).unwrap();
        assert_eq!(manifest.layers.len(), 1);
        assert_eq!(manifest.layers[0].kind, LayerKind::Meta);
    }

    #[test]
    fn test_meta_layer_listing_itself_is_dropped() {
        let text = r#"{
            "file_format_version": "1.1.2",
            "layer": {
                "name": "VK_LAYER_meta",
                "api_version": "1.1.0",
                "component_layers": [ "VK_LAYER_meta" ]
            }
        }"#;
        let manifest =
            LayerManifest::parse(Path::new("/l/meta.json"), text, LayerKind::Explicit).unwrap();
        assert!(manifest.layers.is_empty());
    }

    #[test]
    fn test_device_extension_entry_points() {
        let text = r#"{
            "file_format_version": "1.1.0",
            "layer": {
                "name": "VK_LAYER_ext",
                "library_path": "ext.so",
                "api_version": "1.0.0",
                "device_extensions": [
                    { "name": "VK_EXT_debug_marker", "spec_version": "4",
                      "entrypoints": [ "vkDebugMarkerSetObjectTagEXT", "vkDebugMarkerSetObjectNameEXT" ] }
                ]
            }
        }"#;
        let manifest =
            LayerManifest::parse(Path::new("/l/ext.json"), text, LayerKind::Explicit).unwrap();
        let layer = &manifest.layers[0];
        assert!(layer.device_entry_point("vkDebugMarkerSetObjectTagEXT").is_some());
        assert!(layer.device_entry_point("vkCmdDraw").is_none());
    }
}

//! Layer records and the implicit-layer enable decision
//!
//! A layer is keyed by its (name, manifest path) pair: the same name
//! appearing in two different manifests yields two independent records,
//! and an application naming the ambiguous layer gets the first-registered
//! path. Meta-layers carry component layer names instead of a library and
//! expand transitively at resolution time.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::environment::EnvSource;
use crate::manifest::{DeviceExtension, ExtensionProperties};
use crate::settings::LayerControl;
use crate::ApiVersion;

/// How a layer participates in activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    /// Auto-activated unless disabled through its environment variables.
    Implicit,
    /// Activated only when named by the application, environment or settings.
    Explicit,
    /// Ordered union of component layers, no library of its own.
    Meta,
}

impl LayerKind {
    pub fn is_implicit(self) -> bool {
        matches!(self, LayerKind::Implicit)
    }
}

/// Environment variable condition from a layer manifest
/// (`enable_environment` / `disable_environment`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvCondition {
    pub var: String,
    pub value: String,
}

impl EnvCondition {
    /// Whether the variable is set to the manifest's expected value.
    pub fn is_satisfied(&self, env: &dyn EnvSource) -> bool {
        env.var(&self.var).map(|v| v == self.value).unwrap_or(false)
    }

    pub fn is_present(&self, env: &dyn EnvSource) -> bool {
        env.var(&self.var).is_some()
    }
}

/// One discovered layer.
#[derive(Debug, Clone)]
pub struct LayerRecord {
    pub name: String,
    /// Manifest file this layer came from; part of the identity key.
    pub manifest_path: PathBuf,
    pub kind: LayerKind,
    pub api_version: ApiVersion,
    pub implementation_version: u32,
    pub description: String,
    pub library_path: Option<PathBuf>,
    pub enable_environment: Option<EnvCondition>,
    pub disable_environment: Option<EnvCondition>,
    /// Component layer names, in expansion order (meta layers only).
    pub component_layers: Vec<String>,
    /// Layer names an active override layer refuses to activate.
    pub blacklisted_layers: Vec<String>,
    pub override_paths: Vec<PathBuf>,
    pub app_keys: Vec<String>,
    pub instance_extensions: Vec<ExtensionProperties>,
    pub device_extensions: Vec<DeviceExtension>,
    pub pre_instance_functions: Vec<String>,
    /// Control assigned by the loader settings file, if any.
    pub control: Option<LayerControl>,
}

impl LayerRecord {
    /// Identity for duplicate collapsing.
    pub fn key(&self) -> (&str, &Path) {
        (self.name.as_str(), self.manifest_path.as_path())
    }

    pub fn is_meta(&self) -> bool {
        self.kind == LayerKind::Meta || !self.component_layers.is_empty()
    }

    /// Whether this layer provides a device extension exposing the given
    /// entry point.
    pub fn device_entry_point(&self, command: &str) -> Option<&DeviceExtension> {
        self.device_extensions
            .iter()
            .find(|ext| ext.entry_points.iter().any(|e| e == command))
    }
}

/// Decide whether an implicit layer is enabled by its own environment
/// variables, before any loader-wide filter is applied.
///
/// When an enable variable is declared it fully governs: absent or not
/// matching the expected value disables, matching enables, and the disable
/// variable is not consulted. When only a disable variable is declared,
/// its mere presence disables the layer, whatever its value.
pub fn implicit_layer_decision(record: &LayerRecord, env: &dyn EnvSource) -> bool {
    match (&record.enable_environment, &record.disable_environment) {
        (Some(enable), _) => enable.is_satisfied(env),
        (None, Some(disable)) => !disable.is_present(env),
        (None, None) => true,
    }
}

/// All layers discovered in one scan, in registration order.
#[derive(Debug, Default, Clone)]
pub struct LayerRegistry {
    layers: Vec<Arc<LayerRecord>>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a layer, collapsing duplicate (name, path) pairs. The same
    /// name from a different path is registered as an independent layer.
    pub fn add(&mut self, record: LayerRecord) {
        if self.layers.iter().any(|l| l.key() == record.key()) {
            log::debug!(
                "Layer \"{}\" from {} already registered, skipping duplicate",
                record.name,
                record.manifest_path.display()
            );
            return;
        }
        self.layers.push(Arc::new(record));
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<LayerRecord>> {
        self.layers.iter()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// First-registered layer with the given name. When two paths provide
    /// the same name this is the one a by-name request activates.
    pub fn find_by_name(&self, name: &str) -> Option<&Arc<LayerRecord>> {
        self.layers.iter().find(|l| l.name == name)
    }

    /// Layer matching a settings-file configuration entry: both name and
    /// manifest path must agree.
    pub fn find_by_name_and_path(&self, name: &str, path: &Path) -> Option<&Arc<LayerRecord>> {
        self.layers
            .iter()
            .find(|l| l.name == name && l.manifest_path == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::FixedEnv;

    fn record(name: &str, path: &str) -> LayerRecord {
        LayerRecord {
            name: name.to_string(),
            manifest_path: PathBuf::from(path),
            kind: LayerKind::Implicit,
            api_version: ApiVersion::VK_1_1,
            implementation_version: 1,
            description: String::new(),
            library_path: Some(PathBuf::from("libtest.so")),
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

    #[test]
    fn test_duplicate_name_and_path_collapses() {
        let mut registry = LayerRegistry::new();
        registry.add(record("VK_LAYER_a", "/layers/a.json"));
        registry.add(record("VK_LAYER_a", "/layers/a.json"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_same_name_different_path_stays_independent() {
        let mut registry = LayerRegistry::new();
        let mut first = record("VK_LAYER_a", "/layers/one.json");
        first.description = "one".into();
        let mut second = record("VK_LAYER_a", "/layers/two.json");
        second.description = "two".into();
        registry.add(first);
        registry.add(second);
        assert_eq!(registry.len(), 2);
        // by-name lookup resolves to the first-registered path
        assert_eq!(registry.find_by_name("VK_LAYER_a").unwrap().description, "one");
    }

    #[test]
    fn test_implicit_no_vars_is_enabled() {
        let env = FixedEnv::new();
        assert!(implicit_layer_decision(&record("VK_LAYER_a", "/a.json"), &env));
    }

    #[test]
    fn test_enable_var_governs() {
        let mut rec = record("VK_LAYER_a", "/a.json");
        rec.enable_environment = Some(EnvCondition {
            var: "ENABLE_ME".into(),
            value: "1".into(),
        });
        rec.disable_environment = Some(EnvCondition {
            var: "DISABLE_ME".into(),
            value: "1".into(),
        });

        // enable var absent: disabled
        assert!(!implicit_layer_decision(&rec, &FixedEnv::new()));
        // enable=0: disabled
        let env = FixedEnv::new().set("ENABLE_ME", "0");
        assert!(!implicit_layer_decision(&rec, &env));
        // enable=1: enabled, disable var ignored even when set
        let env = FixedEnv::new().set("ENABLE_ME", "1").set("DISABLE_ME", "1");
        assert!(implicit_layer_decision(&rec, &env));
    }

    #[test]
    fn test_only_disable_var_presence_disables() {
        let mut rec = record("VK_LAYER_a", "/a.json");
        rec.disable_environment = Some(EnvCondition {
            var: "DISABLE_ME".into(),
            value: "1".into(),
        });

        assert!(implicit_layer_decision(&rec, &FixedEnv::new()));
        // presence disables, even at value "0"
        let env = FixedEnv::new().set("DISABLE_ME", "0");
        assert!(!implicit_layer_decision(&rec, &env));
        let env = FixedEnv::new().set("DISABLE_ME", "1");
        assert!(!implicit_layer_decision(&rec, &env));
    }
}

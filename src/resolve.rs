//! Layer resolution
//!
//! Turns the scan snapshot plus the application's request into the ordered
//! list of layers to activate for one instance. All precedence rules live
//! here, in one pass over an ordered candidate list, so that identical
//! inputs always produce the identical order:
//!
//! 1. A valid settings file is authoritative: listed layers activate in
//!    file order according to their `control`; unlisted layers slot in at
//!    the `unordered_layer_location` marker with normal rules.
//! 2. Without settings, implicit layers auto-enable per their own
//!    environment variables, then the `VK_LOADER_LAYERS_ENABLE` /
//!    `VK_LOADER_LAYERS_DISABLE` filters apply, enable winning for a layer
//!    matched by both.
//! 3. Explicit layers activate for the filter-forced set, then the
//!    application's list, then `VK_INSTANCE_LAYERS`.
//! 4. Meta layers expand transitively in place.

use std::collections::HashSet;
use std::sync::Arc;

use crate::environment::{
    split_paths, DisableLayerFilter, EnvSource, LayerFilter, VK_INSTANCE_LAYERS,
    VK_LOADER_LAYERS_ENABLE,
};
use crate::error::{LoaderError, Result};
use crate::layer::{implicit_layer_decision, LayerKind, LayerRecord, LayerRegistry};
use crate::locate::ScanSnapshot;
use crate::settings::{LayerControl, LoaderSettings};

/// Ordered activation list for one instance creation.
#[derive(Debug, Default, Clone)]
pub struct ResolvedLayerList {
    layers: Vec<Arc<LayerRecord>>,
    /// Names vetoed by active layers; meta layers contribute theirs during
    /// expansion, since the meta record itself never joins the list.
    blacklists: Vec<String>,
}

impl ResolvedLayerList {
    pub fn iter(&self) -> impl Iterator<Item = &Arc<LayerRecord>> {
        self.layers.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.layers.iter().any(|l| l.name == name)
    }

    fn push_unique(&mut self, record: Arc<LayerRecord>) {
        if !self.layers.iter().any(|l| l.key() == record.key()) {
            self.layers.push(record);
        }
    }

    fn is_blacklisted(&self, name: &str) -> bool {
        self.blacklists.iter().any(|b| b == name)
            || self
                .layers
                .iter()
                .any(|l| l.blacklisted_layers.iter().any(|b| b == name))
    }
}

struct Resolver<'a> {
    registry: &'a LayerRegistry,
    env: &'a dyn EnvSource,
    enable_filter: LayerFilter,
    disable_filter: DisableLayerFilter,
}

/// Resolve the active layer list.
///
/// `app_requested` is `ppEnabledLayerNames` in request order. Failure to
/// resolve an application-requested name is the only error path; every
/// other problem drops a single layer and continues.
pub fn resolve_layers(
    snapshot: &ScanSnapshot,
    app_requested: &[String],
    env: &dyn EnvSource,
) -> Result<ResolvedLayerList> {
    let resolver = Resolver {
        registry: &snapshot.layers,
        env,
        enable_filter: LayerFilter::from_env(env, VK_LOADER_LAYERS_ENABLE),
        disable_filter: DisableLayerFilter::from_env(env),
    };

    let env_requested: Vec<String> = env
        .var(VK_INSTANCE_LAYERS)
        .map(|v| split_paths(&v))
        .unwrap_or_default();

    let mut list = ResolvedLayerList::default();
    match &snapshot.settings {
        Some(settings) => {
            resolver.resolve_with_settings(settings, app_requested, &env_requested, &mut list)?
        }
        None => resolver.resolve_normal(app_requested, &env_requested, &mut list)?,
    }

    // An active override layer's blacklist vetoes application requests
    for name in app_requested {
        if list.is_blacklisted(name) {
            return Err(LoaderError::LayerNotPresent(name.clone()));
        }
    }

    log::debug!("Resolved layer order: {:?}", list.names());
    Ok(list)
}

impl<'a> Resolver<'a> {
    fn resolve_with_settings(
        &self,
        settings: &LoaderSettings,
        app_requested: &[String],
        env_requested: &[String],
        list: &mut ResolvedLayerList,
    ) -> Result<()> {
        let mut forbidden: Vec<&str> = Vec::new();
        let mut listed: Vec<(&str, &std::path::Path)> = Vec::new();
        for config in &settings.layer_configurations {
            if config.control != LayerControl::UnorderedLayerLocation {
                listed.push((config.name.as_str(), config.path.as_path()));
            }
        }

        for config in &settings.layer_configurations {
            if config.control == LayerControl::UnorderedLayerLocation {
                // Unlisted layers activate here, in registration order,
                // under normal rules
                for record in self.registry.iter() {
                    if listed.contains(&(record.name.as_str(), record.manifest_path.as_path())) {
                        continue;
                    }
                    self.activate_auto(record, app_requested, env_requested, list);
                }
                continue;
            }
            let Some(record) = self
                .registry
                .find_by_name_and_path(&config.name, &config.path)
            else {
                // Integrity check already logged at scan time
                continue;
            };
            match config.control {
                LayerControl::On => {
                    self.activate(record, list);
                }
                LayerControl::Off => forbidden.push(&record.name),
                LayerControl::Auto => {
                    self.activate_auto(record, app_requested, env_requested, list)
                }
                LayerControl::UnorderedLayerLocation => unreachable!(),
            }
        }

        if settings.unordered_position().is_none() {
            for record in self.registry.iter() {
                if listed.contains(&(record.name.as_str(), record.manifest_path.as_path())) {
                    continue;
                }
                self.activate_auto(record, app_requested, env_requested, list);
            }
        }

        for name in app_requested {
            if forbidden.iter().any(|f| f == name) {
                return Err(LoaderError::LayerNotPresent(name.clone()));
            }
            if !list.contains(name) {
                return Err(LoaderError::LayerNotPresent(name.clone()));
            }
        }
        Ok(())
    }

    fn resolve_normal(
        &self,
        app_requested: &[String],
        env_requested: &[String],
        list: &mut ResolvedLayerList,
    ) -> Result<()> {
        // Implicit layers first, in registration order
        for record in self.registry.iter() {
            if record.kind != LayerKind::Implicit {
                continue;
            }
            let mut active = implicit_layer_decision(record, self.env);
            if self.disable_filter.disables(&record.name, true) {
                active = false;
            }
            if self.enable_filter.matches(&record.name) {
                active = true;
            }
            if active {
                self.activate(record, list);
            }
        }

        // Explicit layers force-enabled by the enable filter
        for record in self.registry.iter() {
            if record.kind == LayerKind::Implicit {
                continue;
            }
            if self.enable_filter.matches(&record.name) {
                self.activate(record, list);
            }
        }

        // Application-requested names, then VK_INSTANCE_LAYERS; only the
        // application's own names can fail the call
        for name in app_requested {
            self.activate_requested(name, true, list)?;
        }
        for name in env_requested {
            self.activate_requested(name, false, list)?;
        }
        Ok(())
    }

    /// Normal-rules activation decision for one candidate (used for
    /// settings `auto` entries and unlisted layers).
    fn activate_auto(
        &self,
        record: &Arc<LayerRecord>,
        app_requested: &[String],
        env_requested: &[String],
        list: &mut ResolvedLayerList,
    ) {
        let requested = app_requested.iter().chain(env_requested).any(|n| {
            n == &record.name
                && self
                    .registry
                    .find_by_name(n)
                    .map(|first| first.key() == record.key())
                    .unwrap_or(false)
        });
        let mut active = if record.kind.is_implicit() {
            implicit_layer_decision(record, self.env)
        } else {
            requested
        };
        if self
            .disable_filter
            .disables(&record.name, record.kind.is_implicit())
        {
            active = false;
        }
        if self.enable_filter.matches(&record.name) {
            active = true;
        }
        if active {
            self.activate(record, list);
        }
    }

    fn activate_requested(
        &self,
        name: &str,
        from_app: bool,
        list: &mut ResolvedLayerList,
    ) -> Result<()> {
        if list.contains(name) {
            return Ok(());
        }
        let Some(record) = self.registry.find_by_name(name) else {
            if from_app {
                return Err(LoaderError::LayerNotPresent(name.to_string()));
            }
            log::warn!(
                "Layer \"{name}\" from {VK_INSTANCE_LAYERS} not found, ignoring",
                VK_INSTANCE_LAYERS = VK_INSTANCE_LAYERS
            );
            return Ok(());
        };
        if self
            .disable_filter
            .disables(name, record.kind.is_implicit())
            && !self.enable_filter.matches(name)
        {
            log::warn!("Layer \"{name}\" disabled by environment filter");
            return Ok(());
        }
        let activated = self.activate(record, list);
        if from_app && !activated {
            // A meta layer that failed validation is not activatable
            return Err(LoaderError::LayerNotPresent(name.to_string()));
        }
        Ok(())
    }

    /// Activate one record, expanding meta layers transitively in place.
    /// Returns false when a meta layer fails validation.
    fn activate(&self, record: &Arc<LayerRecord>, list: &mut ResolvedLayerList) -> bool {
        let mut visiting = HashSet::new();
        self.activate_inner(record, list, &mut visiting)
    }

    fn activate_inner(
        &self,
        record: &Arc<LayerRecord>,
        list: &mut ResolvedLayerList,
        visiting: &mut HashSet<String>,
    ) -> bool {
        if !record.is_meta() {
            list.push_unique(Arc::clone(record));
            return true;
        }
        if !visiting.insert(record.name.clone()) {
            // Transitive self-reference: prune this branch, the outer
            // expansion of the same meta layer proceeds
            log::warn!(
                "Meta layer \"{}\" references itself transitively, branch dropped",
                record.name
            );
            return true;
        }

        // A component running behind the meta layer's declared version
        // invalidates the whole meta layer
        let mut components = Vec::with_capacity(record.component_layers.len());
        for component_name in &record.component_layers {
            let Some(component) = self.registry.find_by_name(component_name) else {
                log::warn!(
                    "Meta layer \"{}\" component \"{}\" not found, meta layer dropped",
                    record.name,
                    component_name
                );
                visiting.remove(&record.name);
                return false;
            };
            if !component.is_meta()
                && component.api_version.major_minor() < record.api_version.major_minor()
            {
                log::warn!(
                    "Meta layer \"{}\" requires api {} but component \"{}\" only supports {}, meta layer dropped",
                    record.name,
                    record.api_version,
                    component_name,
                    component.api_version
                );
                visiting.remove(&record.name);
                return false;
            }
            components.push(Arc::clone(component));
        }
        list.blacklists
            .extend(record.blacklisted_layers.iter().cloned());
        for component in components {
            self.activate_inner(&component, list, visiting);
        }
        visiting.remove(&record.name);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{FixedEnv, VK_LOADER_LAYERS_DISABLE};
    use crate::layer::EnvCondition;
    use crate::ApiVersion;
    use std::path::PathBuf;

    fn explicit(name: &str) -> LayerRecord {
        LayerRecord {
            name: name.to_string(),
            manifest_path: PathBuf::from(format!("/l/{name}.json")),
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

    fn implicit(name: &str) -> LayerRecord {
        let mut record = explicit(name);
        record.kind = LayerKind::Implicit;
        record.disable_environment = Some(EnvCondition {
            var: format!("DISABLE_{name}"),
            value: "1".into(),
        });
        record
    }

    fn snapshot(records: Vec<LayerRecord>) -> ScanSnapshot {
        let mut snapshot = ScanSnapshot::default();
        for record in records {
            snapshot.layers.add(record);
        }
        snapshot
    }

    #[test]
    fn test_requested_explicit_layer_activates() {
        let snap = snapshot(vec![explicit("VK_LAYER_test_a")]);
        let list = resolve_layers(&snap, &["VK_LAYER_test_a".into()], &FixedEnv::new()).unwrap();
        assert_eq!(list.names(), ["VK_LAYER_test_a"]);
    }

    #[test]
    fn test_unknown_app_layer_fails() {
        let snap = snapshot(vec![]);
        let err = resolve_layers(&snap, &["VK_LAYER_missing".into()], &FixedEnv::new());
        assert!(matches!(err, Err(LoaderError::LayerNotPresent(_))));
    }

    #[test]
    fn test_unknown_env_layer_is_ignored() {
        let snap = snapshot(vec![explicit("VK_LAYER_test_a")]);
        let env = FixedEnv::new().set(VK_INSTANCE_LAYERS, "VK_LAYER_missing");
        let list = resolve_layers(&snap, &[], &env).unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn test_disable_filter_substring() {
        let snap = snapshot(vec![
            explicit("VK_LAYER_test_First_layer"),
            explicit("VK_LAYER_test_Second_layer"),
            explicit("VK_LAYER_test_Second_test_layer"),
        ]);
        let env = FixedEnv::new().set(VK_LOADER_LAYERS_DISABLE, "*Second*");
        let requested = vec![
            "VK_LAYER_test_First_layer".to_string(),
            "VK_LAYER_test_Second_layer".to_string(),
            "VK_LAYER_test_Second_test_layer".to_string(),
        ];
        let list = resolve_layers(&snap, &requested, &env).unwrap();
        assert_eq!(list.names(), ["VK_LAYER_test_First_layer"]);
    }

    #[test]
    fn test_enable_filter_overrides_disable() {
        let snap = snapshot(vec![implicit("VK_LAYER_test_tool")]);
        let env = FixedEnv::new()
            .set(VK_LOADER_LAYERS_DISABLE, "~all~")
            .set(VK_LOADER_LAYERS_ENABLE, "*tool*");
        let list = resolve_layers(&snap, &[], &env).unwrap();
        assert_eq!(list.names(), ["VK_LAYER_test_tool"]);
    }

    #[test]
    fn test_implicit_ordering_before_explicit() {
        let snap = snapshot(vec![
            explicit("VK_LAYER_test_explicit"),
            implicit("VK_LAYER_test_implicit"),
        ]);
        let list =
            resolve_layers(&snap, &["VK_LAYER_test_explicit".into()], &FixedEnv::new()).unwrap();
        assert_eq!(
            list.names(),
            ["VK_LAYER_test_implicit", "VK_LAYER_test_explicit"]
        );
    }

    #[test]
    fn test_meta_layer_expands_in_place() {
        let mut meta = explicit("VK_LAYER_test_meta");
        meta.kind = LayerKind::Meta;
        meta.library_path = None;
        meta.component_layers = vec![
            "VK_LAYER_test_comp_b".into(),
            "VK_LAYER_test_comp_a".into(),
        ];
        let snap = snapshot(vec![
            meta,
            explicit("VK_LAYER_test_comp_a"),
            explicit("VK_LAYER_test_comp_b"),
        ]);
        let list =
            resolve_layers(&snap, &["VK_LAYER_test_meta".into()], &FixedEnv::new()).unwrap();
        assert_eq!(
            list.names(),
            ["VK_LAYER_test_comp_b", "VK_LAYER_test_comp_a"]
        );
    }

    #[test]
    fn test_meta_layer_component_version_gate() {
        let mut meta = explicit("VK_LAYER_test_meta");
        meta.kind = LayerKind::Meta;
        meta.library_path = None;
        meta.api_version = ApiVersion::VK_1_2;
        meta.component_layers = vec!["VK_LAYER_test_old".into()];
        let mut old = explicit("VK_LAYER_test_old");
        old.api_version = ApiVersion::VK_1_0;
        let snap = snapshot(vec![meta, old]);
        let err = resolve_layers(&snap, &["VK_LAYER_test_meta".into()], &FixedEnv::new());
        assert!(matches!(err, Err(LoaderError::LayerNotPresent(_))));
    }

    #[test]
    fn test_meta_cycle_terminates() {
        let mut meta_a = explicit("VK_LAYER_test_meta_a");
        meta_a.kind = LayerKind::Meta;
        meta_a.library_path = None;
        meta_a.component_layers = vec!["VK_LAYER_test_meta_b".into(), "VK_LAYER_test_leaf".into()];
        let mut meta_b = explicit("VK_LAYER_test_meta_b");
        meta_b.kind = LayerKind::Meta;
        meta_b.library_path = None;
        meta_b.component_layers = vec!["VK_LAYER_test_meta_a".into(), "VK_LAYER_test_leaf".into()];
        let snap = snapshot(vec![meta_a, meta_b, explicit("VK_LAYER_test_leaf")]);
        let list =
            resolve_layers(&snap, &["VK_LAYER_test_meta_a".into()], &FixedEnv::new()).unwrap();
        // the self-referencing branch is dropped; the shared leaf survives once
        assert_eq!(list.names(), ["VK_LAYER_test_leaf"]);
    }

    #[test]
    fn test_active_layer_blacklist_vetoes_app_request() {
        let mut overlay = implicit("VK_LAYER_test_override");
        overlay.blacklisted_layers = vec!["VK_LAYER_test_banned".into()];
        let snap = snapshot(vec![overlay, explicit("VK_LAYER_test_banned")]);
        let err = resolve_layers(&snap, &["VK_LAYER_test_banned".into()], &FixedEnv::new());
        assert!(matches!(err, Err(LoaderError::LayerNotPresent(_))));
    }

    #[test]
    fn test_meta_layer_blacklist_survives_expansion() {
        let mut meta = explicit("VK_LAYER_test_bundle");
        meta.kind = LayerKind::Meta;
        meta.library_path = None;
        meta.component_layers = vec!["VK_LAYER_test_comp".into()];
        meta.blacklisted_layers = vec!["VK_LAYER_test_banned".into()];
        let snap = snapshot(vec![
            meta,
            explicit("VK_LAYER_test_comp"),
            explicit("VK_LAYER_test_banned"),
        ]);
        // the meta record expands away, but its blacklist still vetoes
        let err = resolve_layers(
            &snap,
            &["VK_LAYER_test_bundle".into(), "VK_LAYER_test_banned".into()],
            &FixedEnv::new(),
        );
        assert!(matches!(err, Err(LoaderError::LayerNotPresent(_))));

        // without the banned request the bundle activates normally
        let list =
            resolve_layers(&snap, &["VK_LAYER_test_bundle".into()], &FixedEnv::new()).unwrap();
        assert_eq!(list.names(), ["VK_LAYER_test_comp"]);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let snap = snapshot(vec![
            implicit("VK_LAYER_test_i1"),
            implicit("VK_LAYER_test_i2"),
            explicit("VK_LAYER_test_e1"),
        ]);
        let requested = vec!["VK_LAYER_test_e1".to_string()];
        let first = resolve_layers(&snap, &requested, &FixedEnv::new()).unwrap();
        for _ in 0..8 {
            let again = resolve_layers(&snap, &requested, &FixedEnv::new()).unwrap();
            assert_eq!(first.names(), again.names());
        }
    }
}

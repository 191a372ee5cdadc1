//! Manifest discovery
//!
//! Builds the ordered manifest lists for one enumeration or creation call.
//! Precedence, highest first: settings-file layer configurations, override
//! environment variables (`VK_DRIVER_FILES`, `VK_LAYER_PATH`,
//! `VK_IMPLICIT_LAYER_PATH`), additive environment variables, then the
//! default user and system directories. Every record keeps the source that
//! produced it. A missing or malformed manifest is logged and skipped,
//! never fatal to the scan.
//!
//! The scan result is an owned snapshot, rebuilt on every top-level call
//! so that manifest-file edits between calls are observed.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::environment::{
    driver_files_var, secure_var, split_paths, EnvSource, VK_ADD_DRIVER_FILES,
    VK_ADD_IMPLICIT_LAYER_PATH, VK_ADD_LAYER_PATH, VK_IMPLICIT_LAYER_PATH, VK_LAYER_PATH,
};
use crate::layer::{LayerKind, LayerRegistry};
use crate::manifest::{DriverManifest, LayerManifest};
use crate::settings::{LayerControl, LoaderSettings};

/// Which source produced a manifest record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryType {
    /// Listed by the loader settings file.
    Settings,
    /// Named by an override environment variable.
    EnvVarOverride,
    /// Named by an additive environment variable.
    EnvVarAdditive,
    /// Found through an override meta layer's `override_paths`.
    OverrideLayer,
    /// Found in a per-user default directory.
    UserDirectory,
    /// Found in a system default directory.
    SystemDirectory,
}

/// A manifest file candidate, pre-parse.
#[derive(Debug, Clone)]
pub struct ManifestSource {
    pub path: PathBuf,
    pub discovery: DiscoveryType,
}

/// A parsed driver manifest plus its provenance.
#[derive(Debug, Clone)]
pub struct DiscoveredDriver {
    pub manifest: DriverManifest,
    pub discovery: DiscoveryType,
}

/// Everything one top-level call needs: parsed driver manifests, the layer
/// registry in registration order, and the settings snapshot.
#[derive(Debug, Default, Clone)]
pub struct ScanSnapshot {
    pub drivers: Vec<DiscoveredDriver>,
    pub layers: LayerRegistry,
    pub settings: Option<LoaderSettings>,
}

/// Perform a full discovery pass.
pub fn scan(env: &dyn EnvSource) -> ScanSnapshot {
    let settings = LoaderSettings::find(env);
    let drivers = scan_drivers(env);
    let layers = scan_layers(env, settings.as_ref());
    ScanSnapshot {
        drivers,
        layers,
        settings,
    }
}

fn scan_drivers(env: &dyn EnvSource) -> Vec<DiscoveredDriver> {
    let mut sources = Vec::new();

    if let Some(value) = driver_files_var(env) {
        // Override variable suppresses default directories entirely
        collect_path_list(&value, DiscoveryType::EnvVarOverride, &mut sources);
    } else {
        for dir in default_directories(env, "icd.d") {
            collect_directory(&dir.0, dir.1, &mut sources);
        }
    }
    if let Some(value) = secure_var(env, VK_ADD_DRIVER_FILES) {
        collect_path_list(&value, DiscoveryType::EnvVarAdditive, &mut sources);
    }

    let mut seen = HashSet::new();
    let mut drivers = Vec::new();
    for source in sources {
        let canonical = canonical_key(&source.path);
        if !seen.insert(canonical) {
            continue;
        }
        match DriverManifest::parse_file(&source.path) {
            Ok(manifest) => drivers.push(DiscoveredDriver {
                manifest,
                discovery: source.discovery,
            }),
            Err(e) => log::warn!("Skipping driver manifest: {e}"),
        }
    }
    drivers
}

fn scan_layers(env: &dyn EnvSource, settings: Option<&LoaderSettings>) -> LayerRegistry {
    let mut registry = LayerRegistry::new();

    // Settings-file configurations register first so their manifest paths
    // win duplicate collapsing against the normal scan below.
    if let Some(settings) = settings {
        for config in &settings.layer_configurations {
            if config.control == LayerControl::UnorderedLayerLocation {
                continue;
            }
            let kind = if config.treat_as_implicit_manifest {
                LayerKind::Implicit
            } else {
                LayerKind::Explicit
            };
            match LayerManifest::parse_file(&config.path, kind) {
                Ok(manifest) => {
                    // A manifest whose layers don't include the configured
                    // name is stale; register nothing from it
                    if !manifest.layers.iter().any(|l| l.name == config.name) {
                        log::warn!(
                            "Settings entry \"{}\" does not match any layer in {}, entry dropped",
                            config.name,
                            config.path.display()
                        );
                        continue;
                    }
                    for mut record in manifest.layers {
                        if record.name == config.name {
                            record.control = Some(config.control);
                        }
                        registry.add(record);
                    }
                }
                Err(e) => log::warn!("Skipping settings-configured layer manifest: {e}"),
            }
        }
    }

    // Implicit layers register before explicit ones; an override meta
    // layer among them can redirect the explicit search below.
    register_sources(&mut registry, LayerKind::Implicit, implicit_layer_sources(env));

    let explicit_sources = match override_layer_paths(&registry, env) {
        Some(dirs) => {
            let mut sources = Vec::new();
            for dir in dirs {
                collect_directory(&dir, DiscoveryType::OverrideLayer, &mut sources);
            }
            sources
        }
        None => explicit_layer_sources(env),
    };
    register_sources(&mut registry, LayerKind::Explicit, explicit_sources);

    registry
}

fn register_sources(registry: &mut LayerRegistry, kind: LayerKind, sources: Vec<ManifestSource>) {
    let mut seen = HashSet::new();
    for source in sources {
        if !seen.insert(canonical_key(&source.path)) {
            continue;
        }
        match LayerManifest::parse_file(&source.path, kind) {
            Ok(manifest) => {
                for record in manifest.layers {
                    registry.add(record);
                }
            }
            Err(e) => log::warn!("Skipping layer manifest: {e}"),
        }
    }
}

/// An override meta layer carrying `override_paths` replaces the explicit
/// layer search entirely, provided its `app_keys` are empty or name the
/// running executable.
fn override_layer_paths(registry: &LayerRegistry, env: &dyn EnvSource) -> Option<Vec<PathBuf>> {
    let record = registry
        .iter()
        .find(|r| r.is_meta() && !r.override_paths.is_empty())?;
    if !record.app_keys.is_empty() {
        let exe = env.current_exe()?;
        let exe = canonical_key(&exe);
        if !record
            .app_keys
            .iter()
            .any(|key| canonical_key(Path::new(key)) == exe)
        {
            log::debug!(
                "Override layer \"{}\" does not list this executable, keeping normal paths",
                record.name
            );
            return None;
        }
    }
    log::info!(
        "Override layer \"{}\" redirects explicit layer search to {:?}",
        record.name,
        record.override_paths
    );
    Some(record.override_paths.clone())
}

fn explicit_layer_sources(env: &dyn EnvSource) -> Vec<ManifestSource> {
    layer_sources(env, VK_LAYER_PATH, VK_ADD_LAYER_PATH, "explicit_layer.d")
}

fn implicit_layer_sources(env: &dyn EnvSource) -> Vec<ManifestSource> {
    layer_sources(
        env,
        VK_IMPLICIT_LAYER_PATH,
        VK_ADD_IMPLICIT_LAYER_PATH,
        "implicit_layer.d",
    )
}

fn layer_sources(
    env: &dyn EnvSource,
    override_var: &str,
    add_var: &str,
    category_dir: &str,
) -> Vec<ManifestSource> {
    let mut sources = Vec::new();
    if let Some(value) = secure_var(env, override_var) {
        collect_path_list(&value, DiscoveryType::EnvVarOverride, &mut sources);
    } else {
        for (dir, discovery) in default_directories(env, category_dir) {
            collect_directory(&dir, discovery, &mut sources);
        }
    }
    if let Some(value) = secure_var(env, add_var) {
        collect_path_list(&value, DiscoveryType::EnvVarAdditive, &mut sources);
    }
    sources
}

/// Expand one environment value: each element names a manifest file or a
/// directory of manifests.
fn collect_path_list(value: &str, discovery: DiscoveryType, out: &mut Vec<ManifestSource>) {
    for element in split_paths(value) {
        let path = PathBuf::from(&element);
        if path.is_dir() {
            collect_directory(&path, discovery, out);
        } else if path.is_file() {
            out.push(ManifestSource { path, discovery });
        } else {
            log::warn!("Manifest path {} does not exist, skipping", path.display());
        }
    }
}

/// Gather `.json` manifests from one directory, name-sorted so the scan
/// order is stable across calls.
fn collect_directory(dir: &Path, discovery: DiscoveryType, out: &mut Vec<ManifestSource>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file() && p.extension().map(|ext| ext == "json").unwrap_or(false)
        })
        .collect();
    files.sort();
    out.extend(files.into_iter().map(|path| ManifestSource { path, discovery }));
}

/// Default per-user then system directories holding `vulkan/<category>`.
fn default_directories(env: &dyn EnvSource, category_dir: &str) -> Vec<(PathBuf, DiscoveryType)> {
    let mut dirs = Vec::new();
    if let Some(xdg) = secure_var(env, "XDG_DATA_HOME") {
        dirs.push((
            PathBuf::from(xdg).join("vulkan").join(category_dir),
            DiscoveryType::UserDirectory,
        ));
    } else if let Some(home) = secure_var(env, "HOME") {
        dirs.push((
            PathBuf::from(home)
                .join(".local/share/vulkan")
                .join(category_dir),
            DiscoveryType::UserDirectory,
        ));
    }
    for base in ["/etc/vulkan", "/usr/local/etc/vulkan", "/usr/local/share/vulkan", "/usr/share/vulkan"] {
        dirs.push((
            PathBuf::from(base).join(category_dir),
            DiscoveryType::SystemDirectory,
        ));
    }
    dirs
}

fn canonical_key(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{FixedEnv, PATH_SEPARATOR, VK_DRIVER_FILES};
    use std::io::Write;

    fn write_driver_manifest(dir: &Path, file: &str, library: &str) -> PathBuf {
        let path = dir.join(file);
        let mut f = fs::File::create(&path).unwrap();
        write!(
            f,
            r#"{{ "file_format_version": "1.0.0",
                 "ICD": {{ "library_path": "{library}", "api_version": "1.1.0" }} }}"#
        )
        .unwrap();
        path
    }

    fn write_layer_manifest(dir: &Path, file: &str, name: &str) -> PathBuf {
        let path = dir.join(file);
        let mut f = fs::File::create(&path).unwrap();
        write!(
            f,
            r#"{{ "file_format_version": "1.0.1",
                 "layer": {{ "name": "{name}", "type": "GLOBAL",
                             "library_path": "lib{name}.so", "api_version": "1.0.0" }} }}"#
        )
        .unwrap();
        path
    }

    #[test]
    fn test_driver_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_driver_manifest(dir.path(), "a_driver.json", "liba.so");
        let b = write_driver_manifest(dir.path(), "b_driver.json", "libb.so");

        let value = format!("{}{}{}", a.display(), PATH_SEPARATOR, b.display());
        let env = FixedEnv::new().set(VK_DRIVER_FILES, &value);
        let snapshot = scan(&env);
        assert_eq!(snapshot.drivers.len(), 2);
        assert!(snapshot
            .drivers
            .iter()
            .all(|d| d.discovery == DiscoveryType::EnvVarOverride));
    }

    #[test]
    fn test_driver_directory_scan_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write_driver_manifest(dir.path(), "z.json", "libz.so");
        write_driver_manifest(dir.path(), "a.json", "liba.so");

        let env = FixedEnv::new().set(VK_DRIVER_FILES, &dir.path().display().to_string());
        let snapshot = scan(&env);
        let libs: Vec<_> = snapshot
            .drivers
            .iter()
            .map(|d| d.manifest.library_path.clone())
            .collect();
        assert_eq!(libs, [PathBuf::from("liba.so"), PathBuf::from("libz.so")]);
    }

    #[test]
    fn test_duplicate_manifest_collapsed() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_driver_manifest(dir.path(), "a.json", "liba.so");
        let value = format!("{}{}{}", a.display(), PATH_SEPARATOR, a.display());
        let env = FixedEnv::new().set(VK_DRIVER_FILES, &value);
        assert_eq!(scan(&env).drivers.len(), 1);
    }

    #[test]
    fn test_bad_manifest_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.json");
        fs::write(&bad, "{ nope").unwrap();
        write_driver_manifest(dir.path(), "good.json", "libgood.so");

        let env = FixedEnv::new().set(VK_DRIVER_FILES, &dir.path().display().to_string());
        let snapshot = scan(&env);
        assert_eq!(snapshot.drivers.len(), 1);
        assert_eq!(
            snapshot.drivers[0].manifest.library_path,
            PathBuf::from("libgood.so")
        );
    }

    #[test]
    fn test_layer_env_paths() {
        let explicit = tempfile::tempdir().unwrap();
        let implicit = tempfile::tempdir().unwrap();
        write_layer_manifest(explicit.path(), "e.json", "VK_LAYER_test_explicit");
        write_layer_manifest(implicit.path(), "i.json", "VK_LAYER_test_implicit");

        let env = FixedEnv::new()
            .set(VK_LAYER_PATH, &explicit.path().display().to_string())
            .set(VK_IMPLICIT_LAYER_PATH, &implicit.path().display().to_string());
        let snapshot = scan(&env);
        let implicit_rec = snapshot.layers.find_by_name("VK_LAYER_test_implicit").unwrap();
        assert_eq!(implicit_rec.kind, LayerKind::Implicit);
        let explicit_rec = snapshot.layers.find_by_name("VK_LAYER_test_explicit").unwrap();
        assert_eq!(explicit_rec.kind, LayerKind::Explicit);
    }

    #[test]
    fn test_settings_name_mismatch_drops_manifest() {
        use crate::settings::LayerConfiguration;

        let dir = tempfile::tempdir().unwrap();
        let empty = tempfile::tempdir().unwrap();
        let manifest = write_layer_manifest(dir.path(), "actual.json", "VK_LAYER_test_actual");
        let settings = LoaderSettings {
            file_path: PathBuf::from("/settings.json"),
            layer_configurations: vec![LayerConfiguration {
                name: "VK_LAYER_test_wrong".into(),
                path: manifest,
                control: LayerControl::On,
                treat_as_implicit_manifest: false,
            }],
            stderr_log: Vec::new(),
            app_keys: Vec::new(),
        };
        let env = FixedEnv::new()
            .set(VK_LAYER_PATH, &empty.path().display().to_string())
            .set(VK_IMPLICIT_LAYER_PATH, &empty.path().display().to_string());
        let registry = scan_layers(&env, Some(&settings));
        // a stale entry registers nothing, not even under the real name
        assert!(registry.find_by_name("VK_LAYER_test_actual").is_none());
        assert!(registry.find_by_name("VK_LAYER_test_wrong").is_none());
    }

    fn write_override_manifest(
        dir: &Path,
        file: &str,
        override_dir: &Path,
        app_keys: &[&str],
    ) -> PathBuf {
        let path = dir.join(file);
        let keys: Vec<String> = app_keys.iter().map(|k| format!("\"{k}\"")).collect();
        let mut f = fs::File::create(&path).unwrap();
        write!(
            f,
            r#"{{ "file_format_version": "1.2.0",
                 "layer": {{ "name": "VK_LAYER_test_override", "type": "GLOBAL",
                             "api_version": "1.0.0",
                             "component_layers": [ "VK_LAYER_test_hidden" ],
                             "override_paths": [ "{}" ],
                             "app_keys": [ {} ],
                             "disable_environment": {{ "DISABLE_OVERRIDE": "1" }} }} }}"#,
            override_dir.display(),
            keys.join(", ")
        )
        .unwrap();
        path
    }

    #[test]
    fn test_override_layer_redirects_explicit_search() {
        let implicit = tempfile::tempdir().unwrap();
        let explicit = tempfile::tempdir().unwrap();
        let redirected = tempfile::tempdir().unwrap();
        write_override_manifest(implicit.path(), "override.json", redirected.path(), &[]);
        write_layer_manifest(explicit.path(), "n.json", "VK_LAYER_test_normal");
        write_layer_manifest(redirected.path(), "s.json", "VK_LAYER_test_special");

        let env = FixedEnv::new()
            .set(VK_IMPLICIT_LAYER_PATH, &implicit.path().display().to_string())
            .set(VK_LAYER_PATH, &explicit.path().display().to_string());
        let snapshot = scan(&env);
        // the override layer replaces the explicit search path wholesale
        let special = snapshot.layers.find_by_name("VK_LAYER_test_special").unwrap();
        assert_eq!(special.kind, LayerKind::Explicit);
        assert!(snapshot.layers.find_by_name("VK_LAYER_test_normal").is_none());
    }

    #[test]
    fn test_override_layer_app_keys_gate() {
        let implicit = tempfile::tempdir().unwrap();
        let explicit = tempfile::tempdir().unwrap();
        let redirected = tempfile::tempdir().unwrap();
        write_override_manifest(
            implicit.path(),
            "override.json",
            redirected.path(),
            &["/opt/games/chosen_app"],
        );
        write_layer_manifest(explicit.path(), "n.json", "VK_LAYER_test_normal");
        write_layer_manifest(redirected.path(), "s.json", "VK_LAYER_test_special");

        let env = FixedEnv::new()
            .set(VK_IMPLICIT_LAYER_PATH, &implicit.path().display().to_string())
            .set(VK_LAYER_PATH, &explicit.path().display().to_string());

        // an executable outside app_keys keeps the normal search path
        let other = env.clone().executable("/usr/bin/other_app");
        let snapshot = scan(&other);
        assert!(snapshot.layers.find_by_name("VK_LAYER_test_normal").is_some());
        assert!(snapshot.layers.find_by_name("VK_LAYER_test_special").is_none());

        // the listed executable gets the redirect
        let chosen = env.executable("/opt/games/chosen_app");
        let snapshot = scan(&chosen);
        assert!(snapshot.layers.find_by_name("VK_LAYER_test_special").is_some());
        assert!(snapshot.layers.find_by_name("VK_LAYER_test_normal").is_none());
    }

    #[test]
    fn test_elevated_ignores_env_paths() {
        let dir = tempfile::tempdir().unwrap();
        write_layer_manifest(dir.path(), "e.json", "VK_LAYER_test_explicit");
        let env = FixedEnv::new()
            .set(VK_LAYER_PATH, &dir.path().display().to_string())
            .elevated(true);
        let snapshot = scan(&env);
        assert!(snapshot.layers.find_by_name("VK_LAYER_test_explicit").is_none());
    }
}

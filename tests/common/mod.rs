//! Shared fixtures for the integration suites: manifest trees on disk plus
//! mock driver backends wired through the public builder surface.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use vulkan_loader::environment::{FixedEnv, PATH_SEPARATOR};

/// Route loader log output through the test harness. Safe to call from
/// every fixture; only the first call installs the logger.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn write_driver_manifest(dir: &Path, file: &str, library: &str) -> PathBuf {
    let path = dir.join(file);
    fs::write(
        &path,
        format!(
            r#"{{ "file_format_version": "1.0.0",
                 "ICD": {{ "library_path": "{library}", "api_version": "1.3.0" }} }}"#
        ),
    )
    .unwrap();
    path
}

/// Explicit or implicit layer manifest; `extra` is spliced into the layer
/// object verbatim (e.g. a disable_environment block).
pub fn write_layer_manifest(dir: &Path, file: &str, name: &str, extra: &str) -> PathBuf {
    let path = dir.join(file);
    let extra = if extra.is_empty() {
        String::new()
    } else {
        format!(", {extra}")
    };
    fs::write(
        &path,
        format!(
            r#"{{ "file_format_version": "1.2.0",
                 "layer": {{ "name": "{name}", "type": "GLOBAL",
                             "library_path": "lib{name}.so",
                             "api_version": "1.1.0",
                             "implementation_version": "1",
                             "description": "integration fixture"{extra} }} }}"#
        ),
    )
    .unwrap();
    path
}

/// Settings file at the location the loader searches under `$HOME`.
/// `layers_json` is the content of the `layers` array.
pub fn write_settings_file(home: &Path, layers_json: &str) -> PathBuf {
    let dir = home.join(".local/share/vulkan/loader_settings.d");
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join("vk_loader_settings.json");
    fs::write(
        &path,
        format!(
            r#"{{ "file_format_version": "1.0.0",
                 "settings": {{ "layers": [ {layers_json} ] }} }}"#
        ),
    )
    .unwrap();
    path
}

pub fn join_paths(paths: &[&Path]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(&PATH_SEPARATOR.to_string())
}

/// Environment with all default search directories pointed into an empty
/// sandbox so the host's real Vulkan installation never leaks in.
pub fn sandbox_env(home: &Path) -> FixedEnv {
    FixedEnv::new().set("HOME", &home.display().to_string())
}

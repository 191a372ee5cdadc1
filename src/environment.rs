//! Environment variable access and layer filter strings
//!
//! All environment reads go through the [`EnvSource`] trait so that scans
//! stay reproducible under test and so that "secure" reads can be refused
//! for elevated processes in one place. The filter-string grammar
//! (`VK_LOADER_LAYERS_ENABLE` / `VK_LOADER_LAYERS_DISABLE`) supports exact
//! names, `prefix*`, `*suffix`, `*substring*`, and the special identifiers
//! `~all~` (also `*` and `**`), `~implicit~` and `~explicit~`.

use std::collections::HashMap;
use std::path::PathBuf;

/// Driver manifest override list (current name).
pub const VK_DRIVER_FILES: &str = "VK_DRIVER_FILES";
/// Driver manifest override list (legacy alias of `VK_DRIVER_FILES`).
pub const VK_ICD_FILENAMES: &str = "VK_ICD_FILENAMES";
/// Additional driver manifests, appended after default discovery.
pub const VK_ADD_DRIVER_FILES: &str = "VK_ADD_DRIVER_FILES";
/// Explicit layer search path override.
pub const VK_LAYER_PATH: &str = "VK_LAYER_PATH";
/// Additional explicit layer search paths.
pub const VK_ADD_LAYER_PATH: &str = "VK_ADD_LAYER_PATH";
/// Implicit layer search path override.
pub const VK_IMPLICIT_LAYER_PATH: &str = "VK_IMPLICIT_LAYER_PATH";
/// Additional implicit layer search paths.
pub const VK_ADD_IMPLICIT_LAYER_PATH: &str = "VK_ADD_IMPLICIT_LAYER_PATH";
/// Layer names forced on, as if appended to the application's request list.
pub const VK_INSTANCE_LAYERS: &str = "VK_INSTANCE_LAYERS";
/// Glob filter of layers to force-enable.
pub const VK_LOADER_LAYERS_ENABLE: &str = "VK_LOADER_LAYERS_ENABLE";
/// Glob filter of layers to disable.
pub const VK_LOADER_LAYERS_DISABLE: &str = "VK_LOADER_LAYERS_DISABLE";
/// Physical device select filters.
pub const VK_LOADER_DEVICE_ID_FILTER: &str = "VK_LOADER_DEVICE_ID_FILTER";
pub const VK_LOADER_VENDOR_ID_FILTER: &str = "VK_LOADER_VENDOR_ID_FILTER";
pub const VK_LOADER_DRIVER_ID_FILTER: &str = "VK_LOADER_DRIVER_ID_FILTER";
/// Debug log severity selection.
pub const VK_LOADER_DEBUG: &str = "VK_LOADER_DEBUG";

/// Platform separator for multi-path environment values.
#[cfg(windows)]
pub const PATH_SEPARATOR: char = ';';
#[cfg(not(windows))]
pub const PATH_SEPARATOR: char = ':';

bitflags::bitflags! {
    /// Log facilities selected through `VK_LOADER_DEBUG`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DebugLog: u32 {
        const ERROR = 1 << 0;
        const WARN = 1 << 1;
        const PERF = 1 << 2;
        const INFO = 1 << 3;
        const DEBUG = 1 << 4;
        const LAYER = 1 << 5;
        const DRIVER = 1 << 6;
    }
}

impl DebugLog {
    /// Parse the comma-separated `VK_LOADER_DEBUG` value; unknown
    /// facilities are ignored, `all` selects everything.
    pub fn from_env(env: &dyn EnvSource) -> Self {
        let Some(value) = secure_var(env, VK_LOADER_DEBUG) else {
            return DebugLog::empty();
        };
        let mut flags = DebugLog::empty();
        for facility in value.split(',') {
            flags |= match facility.trim().to_ascii_lowercase().as_str() {
                "all" => DebugLog::all(),
                "error" => DebugLog::ERROR,
                "warn" => DebugLog::WARN,
                "perf" => DebugLog::PERF,
                "info" => DebugLog::INFO,
                "debug" => DebugLog::DEBUG,
                "layer" => DebugLog::LAYER,
                "driver" => DebugLog::DRIVER,
                _ => DebugLog::empty(),
            };
        }
        flags
    }
}

/// Source of environment variables.
pub trait EnvSource: Send + Sync {
    fn var(&self, name: &str) -> Option<String>;

    /// Whether the process runs with elevated privileges. Elevated
    /// processes must not honor user-writable configuration.
    fn is_elevated(&self) -> bool {
        false
    }

    /// Path of the running executable, for matching override layer
    /// `app_keys` entries.
    fn current_exe(&self) -> Option<PathBuf> {
        std::env::current_exe().ok()
    }
}

/// Reads the real process environment.
#[derive(Debug, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn is_elevated(&self) -> bool {
        // setuid/setgid processes must ignore user-controlled search paths
        #[cfg(unix)]
        {
            extern "C" {
                fn geteuid() -> u32;
                fn getuid() -> u32;
            }
            unsafe { geteuid() != getuid() }
        }
        #[cfg(not(unix))]
        {
            false
        }
    }
}

/// Fixed environment for embedding and tests.
#[derive(Debug, Default, Clone)]
pub struct FixedEnv {
    vars: HashMap<String, String>,
    elevated: bool,
    exe: Option<PathBuf>,
}

impl FixedEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &str, value: &str) -> Self {
        self.vars.insert(name.to_string(), value.to_string());
        self
    }

    pub fn elevated(mut self, elevated: bool) -> Self {
        self.elevated = elevated;
        self
    }

    pub fn executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.exe = Some(path.into());
        self
    }
}

impl EnvSource for FixedEnv {
    fn var(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }

    fn is_elevated(&self) -> bool {
        self.elevated
    }

    fn current_exe(&self) -> Option<PathBuf> {
        self.exe.clone()
    }
}

/// Read a variable, refusing user-controlled values for elevated processes.
pub fn secure_var(env: &dyn EnvSource, name: &str) -> Option<String> {
    if env.is_elevated() {
        if env.var(name).is_some() {
            log::info!(
                "Loader is running with elevated permissions. Environment variable {} will be ignored",
                name
            );
        }
        return None;
    }
    env.var(name)
}

/// Driver manifest override value: `VK_DRIVER_FILES` with fallback to the
/// legacy `VK_ICD_FILENAMES` name.
pub fn driver_files_var(env: &dyn EnvSource) -> Option<String> {
    secure_var(env, VK_DRIVER_FILES).or_else(|| secure_var(env, VK_ICD_FILENAMES))
}

/// Split a multi-path environment value on the platform separator,
/// dropping empty elements.
pub fn split_paths(value: &str) -> Vec<String> {
    value
        .split(PATH_SEPARATOR)
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect()
}

/// One parsed filter pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterPattern {
    /// `~all~`, `*` or `**`
    All,
    /// `~implicit~`
    AllImplicit,
    /// `~explicit~`
    AllExplicit,
    /// `*text*`
    Substring(String),
    /// `text*`
    Prefix(String),
    /// `*text`
    Suffix(String),
    /// `text`
    Exact(String),
}

impl FilterPattern {
    /// Classify a single comma-separated token. The token must already be
    /// lowercased.
    fn classify(token: &str) -> Self {
        if token.starts_with('~') {
            return match token {
                "~all~" => FilterPattern::All,
                "~implicit~" => FilterPattern::AllImplicit,
                "~explicit~" => FilterPattern::AllExplicit,
                // Unknown special identifiers match nothing
                other => FilterPattern::Exact(other.to_string()),
            };
        }
        if token == "*" || token == "**" {
            return FilterPattern::All;
        }
        let star_begin = token.starts_with('*');
        let star_end = token.ends_with('*');
        if star_begin && star_end {
            FilterPattern::Substring(token[1..token.len() - 1].to_string())
        } else if star_begin {
            FilterPattern::Suffix(token[1..].to_string())
        } else if star_end {
            FilterPattern::Prefix(token[..token.len() - 1].to_string())
        } else {
            FilterPattern::Exact(token.to_string())
        }
    }

    fn matches_name(&self, lower_name: &str) -> bool {
        match self {
            FilterPattern::All => true,
            // Kind-wide specials only act through the disable filter
            FilterPattern::AllImplicit | FilterPattern::AllExplicit => false,
            FilterPattern::Substring(s) => lower_name.contains(s.as_str()),
            FilterPattern::Prefix(p) => lower_name.starts_with(p.as_str()),
            FilterPattern::Suffix(s) => lower_name.ends_with(s.as_str()),
            FilterPattern::Exact(e) => lower_name == e,
        }
    }
}

/// Parsed contents of a layer filter environment variable.
///
/// Matching is case-insensitive: both patterns and candidate names are
/// lowercased.
#[derive(Debug, Clone, Default)]
pub struct LayerFilter {
    patterns: Vec<FilterPattern>,
}

impl LayerFilter {
    pub fn parse(value: &str) -> Self {
        let lowered = value.to_lowercase();
        let patterns = lowered
            .split(',')
            .filter(|t| !t.is_empty())
            .map(FilterPattern::classify)
            .collect();
        Self { patterns }
    }

    pub fn from_env(env: &dyn EnvSource, var: &str) -> Self {
        match secure_var(env, var) {
            Some(value) => Self::parse(&value),
            None => Self::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.patterns.iter().any(|p| p.matches_name(&lower))
    }
}

/// The disable filter additionally understands the kind-wide specials.
#[derive(Debug, Clone, Default)]
pub struct DisableLayerFilter {
    pub disable_all: bool,
    pub disable_all_implicit: bool,
    pub disable_all_explicit: bool,
    additional: LayerFilter,
}

impl DisableLayerFilter {
    pub fn parse(value: &str) -> Self {
        let mut filter = Self::default();
        let lowered = value.to_lowercase();
        for token in lowered.split(',').filter(|t| !t.is_empty()) {
            match FilterPattern::classify(token) {
                FilterPattern::All => filter.disable_all = true,
                FilterPattern::AllImplicit => filter.disable_all_implicit = true,
                FilterPattern::AllExplicit => filter.disable_all_explicit = true,
                other => filter.additional.patterns.push(other),
            }
        }
        filter
    }

    pub fn from_env(env: &dyn EnvSource) -> Self {
        match secure_var(env, VK_LOADER_LAYERS_DISABLE) {
            Some(value) => Self::parse(&value),
            None => Self::default(),
        }
    }

    /// Whether the filter disables a layer of the given kind.
    pub fn disables(&self, name: &str, is_implicit: bool) -> bool {
        if self.disable_all {
            return true;
        }
        if is_implicit && self.disable_all_implicit {
            return true;
        }
        if !is_implicit && self.disable_all_explicit {
            return true;
        }
        self.additional.matches(name)
    }
}

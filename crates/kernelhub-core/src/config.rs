//! Configuration resolution for kernelhub.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/kernelhub/settings.json)
//! 3. Project config (.kernelhub/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete kernelhub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub kernel: KernelConfig,
    pub file_server: FileServerConfig,
    pub router: RouterConfig,
    /// Upper bound for gathering system facts (seconds).
    pub system_facts_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kernel: KernelConfig::default(),
            file_server: FileServerConfig::default(),
            router: RouterConfig::default(),
            system_facts_timeout_secs: 120,
        }
    }
}

impl Config {
    pub const fn system_facts_timeout(&self) -> Duration {
        Duration::from_secs(self.system_facts_timeout_secs)
    }
}

/// Kernel process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Command used when a session is created without explicit options.
    pub default_cmd: String,
    /// Working directory used when a session is created without one.
    pub default_cwd: Option<PathBuf>,
    /// Extra arguments passed to every kernel command.
    pub args: Vec<String>,
    /// How long a kernel may take to report ready (seconds).
    pub startup_timeout_secs: u64,
    /// Deadline for auto-complete requests (seconds).
    pub autocomplete_timeout_secs: u64,
    /// Default deadline for every other request; `None` waits forever.
    pub request_timeout_secs: Option<u64>,
    /// Grace period between SIGTERM and SIGKILL (seconds).
    pub terminate_timeout_secs: u64,
    /// Buffered stdio lines between the host and a kernel process.
    pub channel_capacity: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            default_cmd: "python3".to_string(),
            default_cwd: None,
            args: Vec::new(),
            startup_timeout_secs: 60,
            autocomplete_timeout_secs: 5,
            request_timeout_secs: None,
            terminate_timeout_secs: 5,
            channel_capacity: 256,
        }
    }
}

impl KernelConfig {
    pub const fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub const fn autocomplete_timeout(&self) -> Duration {
        Duration::from_secs(self.autocomplete_timeout_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub const fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }
}

/// Display-data file server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileServerConfig {
    pub enabled: bool,
    pub host: String,
    /// First port of the random bind range (inclusive).
    pub port_range_start: u16,
    /// End of the random bind range (exclusive).
    pub port_range_end: u16,
    /// Random ports tried before giving up.
    pub bind_attempts: u32,
    /// Age after which a route and its file are swept (seconds).
    pub route_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// Where materialized files are written; system temp dir when unset.
    pub temp_dir: Option<PathBuf>,
}

impl Default for FileServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port_range_start: 8000,
            port_range_end: 10000,
            bind_attempts: 5,
            route_ttl_secs: 60 * 60,
            sweep_interval_secs: 60,
            temp_dir: None,
        }
    }
}

impl FileServerConfig {
    pub const fn route_ttl(&self) -> Duration {
        Duration::from_secs(self.route_ttl_secs)
    }

    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Event routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Target every new kernel's events are forwarded to.
    pub default_target: String,
    /// Queue depth of each consumer target.
    pub target_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_target: "mainWindow".to_string(),
            target_capacity: 256,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let project_path = project_dir.map(|dir| dir.join(".kernelhub").join("settings.json"));
    let mut config = load_layers(&[global_config_path(), project_path])?;

    // Apply environment overrides
    apply_env_overrides(&mut config);

    Ok(config)
}

/// Overlay every existing file in `layers`, lowest priority first, onto the
/// defaults. A layer only replaces the keys it sets.
fn load_layers(layers: &[Option<PathBuf>]) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;
    for path in layers.iter().flatten() {
        if path.exists() {
            merge_values(&mut merged, read_config_value(path)?);
        }
    }
    serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".kernelhub").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/kernelhub/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("kernelhub").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

pub fn load_config_file(path: &Path) -> Result<Config> {
    load_layers(&[Some(path.to_path_buf())])
}

fn read_config_value(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Deep-merge `overlay` into `base`: objects merge key by key, anything else
/// replaces.
fn merge_values(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("KERNELHUB_KERNEL_CMD") {
        config.kernel.default_cmd = val;
    }
    if let Ok(val) = std::env::var("KERNELHUB_KERNEL_CWD") {
        config.kernel.default_cwd = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("KERNELHUB_AUTOCOMPLETE_TIMEOUT")
        && let Ok(n) = val.parse()
    {
        config.kernel.autocomplete_timeout_secs = n;
    }
    if let Ok(val) = std::env::var("KERNELHUB_REQUEST_TIMEOUT")
        && let Ok(n) = val.parse()
    {
        config.kernel.request_timeout_secs = Some(n);
    }
    if let Ok(val) = std::env::var("KERNELHUB_ROUTE_TTL")
        && let Ok(n) = val.parse()
    {
        config.file_server.route_ttl_secs = n;
    }
    if let Ok(val) = std::env::var("KERNELHUB_DEFAULT_TARGET") {
        config.router.default_target = val;
    }
}

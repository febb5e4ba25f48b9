//! TOML-based configuration for vboxweb.
//!
//! Reads and writes [`AppConfig`] at the platform-appropriate location:
//! - Windows:  `%APPDATA%\vboxweb\config.toml`
//! - Linux:    `~/.config/vboxweb/config.toml`
//! - macOS:    `~/Library/Application Support/vboxweb/config.toml`
//!
//! or at an explicit path given with `--config`.
//!
//! ```toml
//! [endpoint]
//! url = "http://127.0.0.1:18083/"
//! username = "vbox"
//! password = "secret"
//! api_version = "auto"
//!
//! [operations]
//! wait_timeout = "30m"
//! auto_host_port_min = 20000
//! auto_host_port_max = 40000
//!
//! [logging]
//! log_level = "debug"
//! ```
//!
//! # Serde default values
//!
//! Every field carries `#[serde(default = "some_fn")]`, so a missing file, a
//! missing section, or a missing key all fall back to working defaults.
//! Command-line flags and `VBOXWEB_*` environment variables are applied on
//! top of the loaded file by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use vbox_core::{parse_wait_timeout, HostIpScope, PortAllocatorOptions};

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub operations: OperationsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How to reach and authenticate against vboxwebsrv.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointConfig {
    /// SOAP endpoint, e.g. `http://127.0.0.1:18083/`.
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// `"7.1"` or `"auto"` to ask the server at startup.
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// HTTP timeout for a single remote call.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

// Hand-written so the password never reaches a log line.
impl std::fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("api_version", &self.api_version)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl EndpointConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Defaults for long-running operations and host-port allocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationsConfig {
    /// Duration string such as `"20m"` or `"1h30m"`.  Unparsable or
    /// non-positive values fall back to 20 minutes.
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout: String,
    #[serde(default = "default_port_min")]
    pub auto_host_port_min: u16,
    #[serde(default = "default_port_max")]
    pub auto_host_port_max: u16,
    #[serde(default)]
    pub auto_host_ip_scope: HostIpScope,
    /// Treat NAT-network forwarding rules as used host ports.
    #[serde(default = "default_true")]
    pub include_nat_networks: bool,
}

impl OperationsConfig {
    /// The configured wait timeout, leniently parsed.
    pub fn wait_timeout(&self) -> Duration {
        parse_wait_timeout(&self.wait_timeout)
    }

    /// Allocation options for a new rule binding `host_ip`.
    pub fn allocator_options(&self, host_ip: &str) -> PortAllocatorOptions {
        PortAllocatorOptions {
            min_port: self.auto_host_port_min,
            max_port: self.auto_host_port_max,
            host_ip: host_ip.to_string(),
            scope: self.auto_host_ip_scope,
            include_nat_networks: self.include_nat_networks,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing` level used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_url() -> String {
    "http://127.0.0.1:18083/".to_string()
}
fn default_api_version() -> String {
    "7.1".to_string()
}
fn default_request_timeout_secs() -> u64 {
    60
}
fn default_wait_timeout() -> String {
    "20m".to_string()
}
fn default_port_min() -> u16 {
    20000
}
fn default_port_max() -> u16 {
    40000
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            username: String::new(),
            password: String::new(),
            api_version: default_api_version(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            wait_timeout: default_wait_timeout(),
            auto_host_port_min: default_port_min(),
            auto_host_port_max: default_port_max(),
            auto_host_ip_scope: HostIpScope::default(),
            include_nat_networks: default_true(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the default config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads the config from the platform location, returning defaults if the
/// file does not yet exist.
///
/// # Errors
///
/// See [`load_config_from`].
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Loads the config from `path`, returning `AppConfig::default()` if the file
/// does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolves the platform config base directory joined with `vboxweb`.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("vboxweb"))
    }

    #[cfg(target_os = "linux")]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("vboxweb"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("vboxweb")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("vboxweb_test_{}", Uuid::new_v4()))
    }

    // ── Defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn test_app_config_default_endpoint() {
        // Arrange / Act
        let cfg = AppConfig::default();

        // Assert
        assert_eq!(cfg.endpoint.url, "http://127.0.0.1:18083/");
        assert_eq!(cfg.endpoint.api_version, "7.1");
        assert_eq!(cfg.endpoint.request_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_operations_default_allocation_policy() {
        let ops = OperationsConfig::default();
        let opts = ops.allocator_options("127.0.0.1");
        assert_eq!((opts.min_port, opts.max_port), (20000, 40000));
        assert_eq!(opts.scope, HostIpScope::Any);
        assert_eq!(opts.host_ip, "127.0.0.1");
        assert!(opts.include_nat_networks);
        assert_eq!(ops.wait_timeout(), Duration::from_secs(20 * 60));
    }

    #[test]
    fn test_logging_default_level_is_info() {
        assert_eq!(LoggingConfig::default().log_level, "info");
    }

    // ── Parsing ───────────────────────────────────────────────────────────────

    #[test]
    fn test_deserialize_empty_toml_uses_defaults() {
        let cfg: AppConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_deserialize_partial_sections_override_defaults() {
        // Arrange
        let toml_str = r#"
[endpoint]
url = "http://vbox-host:18083/"
api_version = "auto"

[operations]
wait_timeout = "5m"
auto_host_ip_scope = "exact"
"#;

        // Act
        let cfg: AppConfig = toml::from_str(toml_str).expect("deserialize partial");

        // Assert
        assert_eq!(cfg.endpoint.url, "http://vbox-host:18083/");
        assert_eq!(cfg.endpoint.api_version, "auto");
        assert_eq!(cfg.endpoint.request_timeout_secs, 60);
        assert_eq!(cfg.operations.wait_timeout(), Duration::from_secs(300));
        assert_eq!(cfg.operations.auto_host_ip_scope, HostIpScope::Exact);
        assert_eq!(cfg.operations.auto_host_port_max, 40000);
    }

    #[test]
    fn test_unparsable_wait_timeout_falls_back_to_default() {
        let cfg: AppConfig =
            toml::from_str("[operations]\nwait_timeout = \"whenever\"\n").expect("deserialize");
        assert_eq!(cfg.operations.wait_timeout(), Duration::from_secs(20 * 60));
    }

    #[test]
    fn test_invalid_scope_is_a_parse_error() {
        let result: Result<AppConfig, _> =
            toml::from_str("[operations]\nauto_host_ip_scope = \"everything\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_debug_output_redacts_password() {
        let mut cfg = EndpointConfig::default();
        cfg.password = "hunter2".to_string();
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    // ── Load / save ───────────────────────────────────────────────────────────

    #[test]
    fn test_load_config_from_missing_file_returns_default() {
        let path = temp_dir().join("config.toml");
        let cfg = load_config_from(&path).expect("missing file is not an error");
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_save_and_load_config_round_trip_via_temp_dir() {
        // Arrange
        let dir = temp_dir();
        let path = dir.join("nested").join("config.toml");
        let mut cfg = AppConfig::default();
        cfg.endpoint.username = "vbox".to_string();
        cfg.operations.auto_host_port_min = 30000;
        cfg.logging.log_level = "debug".to_string();

        // Act
        save_config_to(&cfg, &path).expect("save");
        let loaded = load_config_from(&path).expect("load");

        // Assert
        assert_eq!(loaded, cfg);

        // Cleanup
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_config_from_malformed_file_is_parse_error() {
        let dir = temp_dir();
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[[[ not valid toml").unwrap();

        let err = load_config_from(&path).unwrap_err();

        assert!(matches!(err, ConfigError::Parse(_)));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_config_file_path_ends_with_config_toml() {
        if let Ok(path) = config_file_path() {
            assert!(
                path.ends_with("vboxweb/config.toml"),
                "unexpected config path {path:?}"
            );
        }
        // NoPlatformConfigDir in a stripped environment is also acceptable.
    }
}

//! Configuration Vault – reads/writes `~/.depthlink/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use depthlink_compute::ComputeConfig;
use depthlink_middleware::{BrokerUri, ConnectorConfig};
use depthlink_runtime::SessionConfig;

/// Persisted user configuration stored in `~/.depthlink/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Connect to the broker at all.  `false` runs capture and compute only.
    #[serde(default = "default_true")]
    pub broker_enabled: bool,

    /// `ws` or `wss`.
    #[serde(default = "default_scheme")]
    pub broker_scheme: String,

    #[serde(default = "default_host")]
    pub broker_host: String,

    /// rosbridge WebSocket port.
    #[serde(default = "default_port")]
    pub broker_port: u16,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Capture tick period.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,

    /// Point buffer capacity; must cover the sensor resolution.
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,

    #[serde(default = "default_num_threads")]
    pub num_threads: u32,

    #[serde(default = "default_kernel_name")]
    pub kernel_name: String,

    /// Empty disables publishing.
    #[serde(default = "default_publish_topic")]
    pub publish_topic: String,

    /// Empty disables the subscription.
    #[serde(default)]
    pub subscribe_topic: String,

    #[serde(default = "default_publish_every")]
    pub publish_every: u64,

    #[serde(default = "default_frame_id")]
    pub frame_id: String,

    #[serde(default = "default_diagnostic_points")]
    pub diagnostic_points: usize,
}

fn default_true() -> bool {
    true
}
fn default_scheme() -> String {
    "ws".to_string()
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    9090
}
fn default_connect_timeout_ms() -> u64 {
    3000
}
fn default_poll_interval_ms() -> u64 {
    33
}
fn default_stall_timeout_ms() -> u64 {
    2000
}
fn default_max_buffer_size() -> usize {
    512 * 512
}
fn default_num_threads() -> u32 {
    64
}
fn default_kernel_name() -> String {
    "CSMain".to_string()
}
fn default_publish_topic() -> String {
    "/depthlink/points".to_string()
}
fn default_publish_every() -> u64 {
    30
}
fn default_frame_id() -> String {
    "depth_camera".to_string()
}
fn default_diagnostic_points() -> usize {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_enabled: default_true(),
            broker_scheme: default_scheme(),
            broker_host: default_host(),
            broker_port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            stall_timeout_ms: default_stall_timeout_ms(),
            max_buffer_size: default_max_buffer_size(),
            num_threads: default_num_threads(),
            kernel_name: default_kernel_name(),
            publish_topic: default_publish_topic(),
            subscribe_topic: String::new(),
            publish_every: default_publish_every(),
            frame_id: default_frame_id(),
            diagnostic_points: default_diagnostic_points(),
        }
    }
}

impl Config {
    pub fn broker_uri(&self) -> BrokerUri {
        BrokerUri {
            scheme: self.broker_scheme.clone(),
            host: self.broker_host.clone(),
            port: self.broker_port,
        }
    }

    pub fn connector_config(&self) -> ConnectorConfig {
        ConnectorConfig {
            uri: self.broker_uri(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            compute: ComputeConfig {
                max_buffer_size: self.max_buffer_size,
                num_threads: self.num_threads,
                kernel_name: self.kernel_name.clone(),
            },
            publish_topic: non_empty(&self.publish_topic),
            subscribe_topic: non_empty(&self.subscribe_topic),
            publish_every: self.publish_every,
            frame_id: self.frame_id.clone(),
            diagnostic_points: self.diagnostic_points,
            stall_timeout: Duration::from_millis(self.stall_timeout_ms),
        }
    }
}

fn non_empty(topic: &str) -> Option<String> {
    let topic = topic.trim();
    (!topic.is_empty()).then(|| topic.to_string())
}

/// Return the path to `~/.depthlink/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".depthlink").join("config.toml")
}

/// Load the config from disk and apply `DEPTHLINK_*` overrides.  Returns
/// `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    let mut cfg = load_from(&config_path())?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `DEPTHLINK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `DEPTHLINK_BROKER_HOST` | `broker_host` |
/// | `DEPTHLINK_BROKER_PORT` | `broker_port` |
/// | `DEPTHLINK_POLL_INTERVAL_MS` | `poll_interval_ms` |
/// | `DEPTHLINK_MAX_BUFFER_SIZE` | `max_buffer_size` |
///
/// Unparseable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("DEPTHLINK_BROKER_HOST") {
        cfg.broker_host = v;
    }
    if let Ok(v) = std::env::var("DEPTHLINK_BROKER_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.broker_port = port;
    }
    if let Ok(v) = std::env::var("DEPTHLINK_POLL_INTERVAL_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.poll_interval_ms = ms;
    }
    if let Ok(v) = std::env::var("DEPTHLINK_MAX_BUFFER_SIZE")
        && let Ok(size) = v.parse::<usize>()
    {
        cfg.max_buffer_size = size;
    }
}

/// Save the config to disk, creating `~/.depthlink/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let dir_meta = std::fs::metadata(path.parent().expect("parent")).expect("dir metadata");
        assert_eq!(dir_meta.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.broker_port, 9090);
        assert_eq!(loaded.max_buffer_size, 262_144);
        assert_eq!(loaded.kernel_name, "CSMain");
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "broker_host = \"10.0.0.7\"\nnum_threads = 128\n").expect("write");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.broker_host, "10.0.0.7");
        assert_eq!(loaded.num_threads, 128);
        assert_eq!(loaded.poll_interval_ms, 33);
        assert!(loaded.broker_enabled);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "broker_port = \"not a number\"").expect("write");
        assert!(load_from(&path).is_err());
    }

    #[test]
    fn config_path_points_to_depthlink_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".depthlink"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn session_config_maps_fields() {
        let cfg = Config {
            subscribe_topic: "  ".to_string(),
            publish_topic: "/cloud".to_string(),
            broker_scheme: "wss".to_string(),
            ..Config::default()
        };
        let session = cfg.session_config();
        assert_eq!(session.publish_topic.as_deref(), Some("/cloud"));
        assert_eq!(session.subscribe_topic, None);
        assert_eq!(session.compute.groups_x(), 2048);
        assert_eq!(
            cfg.connector_config().uri.to_string(),
            "wss://127.0.0.1:9090"
        );
    }

    #[test]
    fn apply_env_overrides_changes_broker_host() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("DEPTHLINK_BROKER_HOST", "robot.local") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.broker_host, "robot.local");
        unsafe { std::env::remove_var("DEPTHLINK_BROKER_HOST") };
    }

    #[test]
    fn apply_env_overrides_changes_broker_port() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("DEPTHLINK_BROKER_PORT", "9999") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.broker_port, 9999);
        unsafe { std::env::remove_var("DEPTHLINK_BROKER_PORT") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_buffer_size() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("DEPTHLINK_MAX_BUFFER_SIZE", "lots") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.max_buffer_size, default_max_buffer_size());
        unsafe { std::env::remove_var("DEPTHLINK_MAX_BUFFER_SIZE") };
    }

    #[test]
    fn apply_env_overrides_changes_poll_interval() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("DEPTHLINK_POLL_INTERVAL_MS", "16") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.poll_interval_ms, 16);
        unsafe { std::env::remove_var("DEPTHLINK_POLL_INTERVAL_MS") };
    }
}

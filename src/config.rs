//! Config loading and persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::daemon::proto;
use crate::paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub socket_path: PathBuf,
    pub data_dir: PathBuf,
    /// Node identity when no mesh is configured.
    pub node_name: String,
    pub limits: Limits,
    pub logging: LoggingConfig,
    /// Absent means: no TLS listener, no replication driver.
    pub mesh: Option<MeshConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: paths::socket_path(),
            data_dir: paths::data_dir(),
            node_name: "local".to_string(),
            limits: Limits::default(),
            logging: LoggingConfig::default(),
            mesh: None,
        }
    }
}

impl Config {
    /// Mesh node name wins over the standalone default.
    pub fn effective_node_name(&self) -> String {
        self.mesh
            .as_ref()
            .map(|m| m.node_name.clone())
            .unwrap_or_else(|| self.node_name.clone())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("cortex.redb")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Per-connection frame buffer cap, clamped to [1 MiB, 16 MiB].
    pub max_frame_buffer_bytes: usize,
    /// Handler pool cap; saturated accepts are refused.
    pub max_connections: usize,
    /// 0 disables the idle timeout.
    pub idle_timeout_secs: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_buffer_bytes: proto::DEFAULT_BUFFER_CAP,
            max_connections: 1000,
            idle_timeout_secs: 300,
        }
    }
}

impl Limits {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub format: LogFormat,
    pub file_enabled: bool,
    pub file_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            format: LogFormat::Compact,
            file_enabled: false,
            file_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    pub node_name: String,
    pub tls_port: u16,
    pub ca_cert: PathBuf,
    pub node_cert: PathBuf,
    pub node_key: PathBuf,
    /// ADR-003 default: 5-element frames are rejected everywhere unless this
    /// is set, and even then only the TLS transport accepts them.
    #[serde(default)]
    pub accept_frame_metadata: bool,
    /// Shared HMAC key for federation claim tokens. Without it, tokens only
    /// verify on the issuing node.
    #[serde(default)]
    pub claim_secret: Option<String>,
    #[serde(default)]
    pub nodes: Vec<MeshNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshNode {
    pub name: String,
    pub host: String,
    pub port: u16,
}

pub fn config_path() -> PathBuf {
    paths::config_path()
}

pub fn load(path: &Path) -> crate::Result<Config> {
    let contents = std::fs::read_to_string(path).map_err(crate::Error::Io)?;
    let mut config: Config = toml::from_str(&contents)
        .map_err(|e| crate::Error::Config(format!("failed to parse {}: {e}", path.display())))?;
    apply_env_overrides(&mut config);
    config.limits.max_frame_buffer_bytes = config
        .limits
        .max_frame_buffer_bytes
        .clamp(proto::MIN_BUFFER_CAP, proto::MAX_BUFFER_CAP);
    Ok(config)
}

/// Load the config, falling back to defaults (with a warning) when the file
/// is missing or malformed.
pub fn load_or_default(path: Option<&Path>) -> Config {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config_path);
    match load(&path) {
        Ok(config) => config,
        Err(crate::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut config = Config::default();
            apply_env_overrides(&mut config);
            config
        }
        Err(e) => {
            tracing::warn!("config load failed, using defaults: {e}");
            let mut config = Config::default();
            apply_env_overrides(&mut config);
            config
        }
    }
}

pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(path) = std::env::var("CORTEX_SOCKET")
        && !path.trim().is_empty()
    {
        config.socket_path = PathBuf::from(path);
    }
    if let Ok(dir) = std::env::var("CORTEX_DATA_DIR")
        && !dir.trim().is_empty()
    {
        config.data_dir = PathBuf::from(dir);
    }
    if let Ok(node) = std::env::var("CORTEX_NODE_NAME")
        && !node.trim().is_empty()
    {
        config.node_name = node;
    }
}

pub fn write_config(path: &Path, config: &Config) -> crate::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(crate::Error::Io)?;
    }
    let contents = toml::to_string_pretty(config)
        .map_err(|e| crate::Error::Config(format!("failed to render config: {e}")))?;
    atomic_write(path, contents.as_bytes())
}

fn atomic_write(path: &Path, data: &[u8]) -> crate::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| crate::Error::Config("config path missing parent directory".into()))?;
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(crate::Error::Io)?;
    std::fs::write(temp.path(), data).map_err(crate::Error::Io)?;
    temp.persist(path)
        .map_err(|e| crate::Error::Config(format!("failed to persist config: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.node_name = "a".into();
        config.limits.max_connections = 7;
        config.mesh = Some(MeshConfig {
            node_name: "a".into(),
            tls_port: 4387,
            ca_cert: "/etc/cortex/ca.pem".into(),
            node_cert: "/etc/cortex/node.pem".into(),
            node_key: "/etc/cortex/node.key".into(),
            accept_frame_metadata: false,
            claim_secret: Some("shared".into()),
            nodes: vec![MeshNode {
                name: "b".into(),
                host: "b.internal".into(),
                port: 4387,
            }],
        });

        write_config(&path, &config).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.limits.max_connections, 7);
        assert_eq!(loaded.effective_node_name(), "a");
        let mesh = loaded.mesh.unwrap();
        assert_eq!(mesh.nodes[0].name, "b");
        assert!(!mesh.accept_frame_metadata);
    }

    #[test]
    fn buffer_cap_is_clamped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.limits.max_frame_buffer_bytes = 1; // far below the floor
        write_config(&path, &config).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.limits.max_frame_buffer_bytes, proto::MIN_BUFFER_CAP);
    }

    #[test]
    fn idle_timeout_zero_disables() {
        let mut limits = Limits::default();
        assert!(limits.idle_timeout().is_some());
        limits.idle_timeout_secs = 0;
        assert!(limits.idle_timeout().is_none());
    }
}

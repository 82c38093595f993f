//! Default filesystem locations for the daemon.

use std::path::PathBuf;

/// Listening socket. `CORTEX_SOCKET` overrides, otherwise the system path.
pub(crate) fn socket_path() -> PathBuf {
    if let Ok(path) = std::env::var("CORTEX_SOCKET")
        && !path.trim().is_empty()
    {
        return PathBuf::from(path);
    }
    PathBuf::from("/run/cortex/cortex.sock")
}

/// Persistent data (the record store). `CORTEX_DATA_DIR` overrides.
pub(crate) fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CORTEX_DATA_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }
    PathBuf::from("/var/lib/cortex")
}

/// Config file. `CORTEX_CONFIG` overrides.
pub(crate) fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("CORTEX_CONFIG")
        && !path.trim().is_empty()
    {
        return PathBuf::from(path);
    }
    PathBuf::from("/etc/cortex/config.toml")
}

/// Log files, when file logging is enabled without an explicit directory.
pub(crate) fn log_dir() -> PathBuf {
    PathBuf::from("/var/log/cortex")
}

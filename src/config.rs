//! Engine configuration.
//!
//! Defaults come from [`crate::constants`]. A config can be loaded from a JSON
//! file and then overridden from the environment:
//!
//! | Variable                        | Field                  |
//! |---------------------------------|------------------------|
//! | `SOCKBUS_SOCKET_PREFIX`         | `socket_prefix`        |
//! | `SOCKBUS_READ_BUFFER_SIZE`      | `read_buffer_size`     |
//! | `SOCKBUS_BACKLOG`               | `backlog`              |
//! | `SOCKBUS_RECONNECT_TIMEOUT_MS`  | `reconnect_timeout_ms` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BACKLOG, DEFAULT_READ_BUFFER_SIZE, DEFAULT_RECONNECT_TIMEOUT, DEFAULT_SOCKET_PREFIX,
    MAX_SOCKET_PATH,
};
use crate::error::IpcError;

/// Configuration shared by [`IpcServer`](crate::IpcServer) and
/// [`IpcClient`](crate::IpcClient).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct IpcConfig {
    /// String prepended to an endpoint name to form its socket path.
    pub socket_prefix: String,
    /// Scratch region size for each bounded read.
    pub read_buffer_size: usize,
    /// `listen(2)` backlog for the server socket.
    pub backlog: i32,
    /// Client reconnect interval in milliseconds.
    pub reconnect_timeout_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_prefix: DEFAULT_SOCKET_PREFIX.to_string(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            backlog: DEFAULT_BACKLOG,
            reconnect_timeout_ms: DEFAULT_RECONNECT_TIMEOUT.as_millis() as u64,
        }
    }
}

impl IpcConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Loads a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        Ok(config)
    }

    /// Overrides fields from `SOCKBUS_*` environment variables.
    ///
    /// Unparseable numeric values are logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(prefix) = std::env::var("SOCKBUS_SOCKET_PREFIX") {
            self.socket_prefix = prefix;
        }
        override_parsed("SOCKBUS_READ_BUFFER_SIZE", &mut self.read_buffer_size);
        override_parsed("SOCKBUS_BACKLOG", &mut self.backlog);
        override_parsed("SOCKBUS_RECONNECT_TIMEOUT_MS", &mut self.reconnect_timeout_ms);
    }

    /// Builder-style prefix override, handy for tests and temp directories.
    pub fn with_socket_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.socket_prefix = prefix.into();
        self
    }

    /// Builder-style reconnect interval override.
    pub fn with_reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Client reconnect interval.
    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    /// Scratch size, never zero.
    pub(crate) fn scratch_size(&self) -> usize {
        self.read_buffer_size.max(1)
    }

    /// Derives the socket path for an endpoint name.
    ///
    /// The path is `<socket_prefix><name>`. Names must be non-empty and must
    /// not contain `/` or NUL, and the result must fit in `sun_path`.
    pub fn socket_path(&self, name: &str) -> Result<PathBuf, IpcError> {
        if name.is_empty() || name.contains('/') || name.contains('\0') {
            return Err(IpcError::InvalidName(name.to_string()));
        }
        let path = format!("{}{}", self.socket_prefix, name);
        if path.len() >= MAX_SOCKET_PATH {
            return Err(IpcError::PathTooLong {
                len: path.len(),
                max: MAX_SOCKET_PATH - 1,
                path,
            });
        }
        Ok(PathBuf::from(path))
    }
}

fn override_parsed<T: std::str::FromStr>(var: &str, slot: &mut T) {
    let Ok(raw) = std::env::var(var) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *slot = value,
        Err(_) => log::warn!("Ignoring unparseable {var}={raw:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_constants() {
        let config = IpcConfig::default();
        assert_eq!(config.socket_prefix, "/tmp/sockbus.");
        assert_eq!(config.read_buffer_size, 4096);
        assert_eq!(config.backlog, 16);
        assert_eq!(config.reconnect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_socket_path_is_prefix_plus_name() {
        let config = IpcConfig::default();
        assert_eq!(
            config.socket_path("chat").unwrap(),
            PathBuf::from("/tmp/sockbus.chat")
        );
    }

    #[test]
    fn test_socket_path_rejects_bad_names() {
        let config = IpcConfig::default();
        for name in ["", "a/b", "nul\0"] {
            assert!(
                matches!(config.socket_path(name), Err(IpcError::InvalidName(_))),
                "name {name:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_socket_path_length_validation() {
        let config = IpcConfig::default();
        let err = config.socket_path(&"a".repeat(200)).unwrap_err();
        assert!(err.to_string().contains("too long"), "got: {err}");
    }

    #[test]
    fn test_load_partial_json_fills_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"backlog": 4, "reconnect_timeout_ms": 250}"#).unwrap();

        let config = IpcConfig::load(&path).unwrap();
        assert_eq!(config.backlog, 4);
        assert_eq!(config.reconnect_timeout(), Duration::from_millis(250));
        assert_eq!(config.read_buffer_size, 4096);
        assert_eq!(config.socket_prefix, "/tmp/sockbus.");
    }

    #[test]
    fn test_load_missing_file_errors() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(IpcConfig::load(&tmp.path().join("nope.json")).is_err());
    }

    #[test]
    fn test_builders() {
        let config = IpcConfig::default()
            .with_socket_prefix("/run/x.")
            .with_reconnect_timeout(Duration::from_millis(50));
        assert_eq!(config.socket_path("y").unwrap(), PathBuf::from("/run/x.y"));
        assert_eq!(config.reconnect_timeout_ms, 50);
    }

    #[test]
    fn test_scratch_size_never_zero() {
        let config = IpcConfig {
            read_buffer_size: 0,
            ..IpcConfig::default()
        };
        assert_eq!(config.scratch_size(), 1);
    }
}

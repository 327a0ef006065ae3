//! Server and client settings: defaults, optional TOML file, CLI overrides

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::{timeouts, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_CONNECTIONS, DEFAULT_PORT, MAX_PACKET_LEN, MIN_BUFFER_SIZE};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub read_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            data_dir: PathBuf::from("serverdata"),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            read_timeout_ms: timeouts::READ_MS,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        check_buffer_size(self.buffer_size)?;
        if self.max_connections == 0 {
            bail!("max_connections must be at least 1");
        }
        if self.read_timeout_ms == 0 {
            bail!("read_timeout_ms must be non-zero");
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub buffer_size: usize,
    pub connect_timeout_ms: u64,
    pub response_timeout_ms: u64,
    /// Transfer journal; none by default
    pub journal: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            data_dir: PathBuf::from("clientdata"),
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout_ms: timeouts::CONNECT_MS,
            response_timeout_ms: timeouts::RESPONSE_MS,
            journal: None,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        check_buffer_size(self.buffer_size)?;
        if self.port == 0 {
            bail!("port must be non-zero");
        }
        if self.host.is_empty() {
            bail!("host must not be empty");
        }
        if self.connect_timeout_ms == 0 || self.response_timeout_ms == 0 {
            bail!("timeouts must be non-zero");
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

fn check_buffer_size(size: usize) -> Result<()> {
    if !(MIN_BUFFER_SIZE..=MAX_PACKET_LEN).contains(&size) {
        bail!("buffer_size must be between {MIN_BUFFER_SIZE} and {MAX_PACKET_LEN}, got {size}");
    }
    Ok(())
}

/// Read a TOML settings file; `None` yields the defaults
pub fn load<T>(path: Option<&Path>) -> Result<T>
where
    T: Default + for<'de> Deserialize<'de>,
{
    let Some(path) = path else {
        return Ok(T::default());
    };
    let data = std::fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    toml::from_str(&data).with_context(|| format!("parse config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let server = ServerConfig::default();
        server.validate().unwrap();
        assert_eq!(server.port, 30450);
        assert_eq!(server.max_connections, 64);
        assert_eq!(server.buffer_size, 8192);
        ClientConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "port = 4000\ndata_dir = \"/srv/sync\"\n").unwrap();

        let cfg: ServerConfig = load(Some(&path)).unwrap();
        assert_eq!(cfg.port, 4000);
        assert_eq!(cfg.data_dir, PathBuf::from("/srv/sync"));
        assert_eq!(cfg.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(cfg.read_timeout_ms, timeouts::READ_MS);
    }

    #[test]
    fn test_client_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(&path, "host = \"sync.local\"\njournal = \"sync.log\"\n").unwrap();
        let cfg: ClientConfig = load(Some(&path)).unwrap();
        assert_eq!(cfg.address(), "sync.local:30450");
        assert_eq!(cfg.journal, Some(PathBuf::from("sync.log")));
    }

    #[test]
    fn test_bad_values_are_rejected() {
        let mut cfg = ServerConfig::default();
        cfg.buffer_size = 64;
        assert!(cfg.validate().is_err());
        cfg.buffer_size = 70_000;
        assert!(cfg.validate().is_err());
        cfg.buffer_size = MAX_PACKET_LEN;
        cfg.max_connections = 0;
        assert!(cfg.validate().is_err());

        let mut client = ClientConfig::default();
        client.port = 0;
        assert!(client.validate().is_err());
    }

    #[test]
    fn test_unparsable_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();
        assert!(load::<ServerConfig>(Some(&path)).is_err());
        assert!(load::<ServerConfig>(Some(&dir.path().join("missing.toml"))).is_err());
    }
}

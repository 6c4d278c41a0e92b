/* This file is part of cryptobak.
 *
 * cryptobak is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * cryptobak is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with cryptobak.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Server and client configuration. The server reads an optional TOML file
//! off a cascading search path; the client reads the three-line text file
//! spec §6 describes (deliberately not TOML).

use std::ffi::OsStr;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_derive::Deserialize;

use crate::error::ErrorKind;
use crate::proto_error;
use crate::wire::DEFAULT_TCP_PORT;

pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    pub shutdown_drain: Duration,
    pub storage_dir: PathBuf,
    pub registry_db_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_TCP_PORT)),
            max_sessions: 64,
            idle_timeout: Duration::from_secs(30),
            shutdown_drain: Duration::from_secs(10),
            storage_dir: PathBuf::from("data"),
            registry_db_path: PathBuf::from("data/registry.sqlite"),
        }
    }
}

#[derive(Deserialize, Default)]
struct StructuredServerConfig {
    listen_address: Option<String>,
    listen_port: Option<u16>,
    max_sessions: Option<usize>,
    idle_timeout_secs: Option<u64>,
    shutdown_drain_secs: Option<u64>,
    storage_dir: Option<String>,
    registry_db_path: Option<String>,
}

impl ServerConfig {
    /// Parses a `cryptobak.toml`-shaped file. Every field is optional;
    /// a present-but-empty file yields [`ServerConfig::default`].
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let parsed: StructuredServerConfig =
            toml::from_str(&text).context("parsing server config")?;

        let defaults = Self::default();
        let listen_address = parsed.listen_address.as_deref().unwrap_or("127.0.0.1");
        let listen_port = parsed.listen_port.unwrap_or(DEFAULT_TCP_PORT);
        let bind_addr = format!("{listen_address}:{listen_port}")
            .parse()
            .with_context(|| format!("invalid listen address '{listen_address}:{listen_port}'"))?;

        Ok(Self {
            bind_addr,
            max_sessions: parsed.max_sessions.unwrap_or(defaults.max_sessions),
            idle_timeout: parsed
                .idle_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            shutdown_drain: parsed
                .shutdown_drain_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_drain),
            storage_dir: parsed.storage_dir.map(PathBuf::from).unwrap_or(defaults.storage_dir),
            registry_db_path: parsed
                .registry_db_path
                .map(PathBuf::from)
                .unwrap_or(defaults.registry_db_path),
        })
    }

    /// Looks for `cryptobak.toml` at, in order: the executable's own
    /// directory; `../etc/` if the executable lives in a `bin/` directory;
    /// the current working directory (debug builds only); `/etc/`. Falls
    /// back to [`ServerConfig::default`] if none exist — unlike the
    /// teacher's binary, a missing file is not fatal here, since spec §6
    /// only requires reading a config "if present".
    pub fn load() -> Result<Self> {
        let config_file = Path::new("cryptobak.toml");
        let mut try_paths: Vec<PathBuf> = Vec::new();

        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                try_paths.push(exe_dir.join(config_file));
                if exe_dir.file_name() == Some(OsStr::new("bin")) {
                    if let Some(exe_parent) = exe_dir.parent() {
                        try_paths.push(exe_parent.join("etc").join(config_file));
                    }
                }
            }
        }

        #[cfg(debug_assertions)]
        try_paths.push(config_file.to_owned());

        #[cfg(not(windows))]
        try_paths.push(Path::new("/etc/cryptobak.toml").to_owned());

        for path in &try_paths {
            if path.exists() {
                return Self::from_file(path);
            }
        }

        Ok(Self::default())
    }
}

/// The client's local configuration (spec §6): a three-line text file of
/// `server endpoint`, `self-asserted name`, `absolute upload path`.
pub struct ClientConfig {
    pub server_addr: SocketAddr,
    pub name: String,
    pub file_path: PathBuf,
}

impl ClientConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut lines = text.lines();

        let endpoint = lines
            .next()
            .ok_or_else(|| anyhow!("client config missing the server endpoint line"))?
            .trim();
        let name = lines
            .next()
            .ok_or_else(|| anyhow!("client config missing the name line"))?
            .trim();
        let file_path = lines
            .next()
            .ok_or_else(|| anyhow!("client config missing the upload file path line"))?
            .trim();

        if name.is_empty() || name.as_bytes().len() > 254 {
            return Err(proto_error!(ErrorKind::Config, "name '{name}' must be 1..254 bytes"));
        }

        let server_addr = endpoint
            .to_socket_addrs()
            .with_context(|| format!("resolving server endpoint '{endpoint}'"))?
            .next()
            .ok_or_else(|| anyhow!("server endpoint '{endpoint}' resolved to no addresses"))?;

        Ok(Self { server_addr, name: name.to_string(), file_path: PathBuf::from(file_path) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_defaults_when_file_absent() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), DEFAULT_TCP_PORT);
        assert_eq!(config.max_sessions, 64);
    }

    #[test]
    fn server_config_parses_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cryptobak.toml");
        std::fs::write(
            &path,
            "listen_address = \"0.0.0.0\"\nlisten_port = 9000\nmax_sessions = 8\n",
        )
        .unwrap();
        let config = ServerConfig::from_file(&path).unwrap();
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.max_sessions, 8);
    }

    #[test]
    fn client_config_parses_three_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.conf");
        std::fs::write(&path, "127.0.0.1:1256\nalice\n/home/alice/backup.tar\n").unwrap();
        let config = ClientConfig::from_file(&path).unwrap();
        assert_eq!(config.server_addr.port(), 1256);
        assert_eq!(config.name, "alice");
        assert_eq!(config.file_path, PathBuf::from("/home/alice/backup.tar"));
    }

    #[test]
    fn client_config_tolerates_missing_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.conf");
        std::fs::write(&path, "127.0.0.1:1256\nbob\n/tmp/file.bin").unwrap();
        assert!(ClientConfig::from_file(&path).is_ok());
    }

    #[test]
    fn client_config_rejects_oversized_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.conf");
        let oversized_name = "x".repeat(300);
        std::fs::write(&path, format!("127.0.0.1:1256\n{oversized_name}\n/tmp/file.bin")).unwrap();
        assert!(ClientConfig::from_file(&path).is_err());
    }
}

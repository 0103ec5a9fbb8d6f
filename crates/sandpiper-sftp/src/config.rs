//! Server configuration.
//!
//! The on-disk shape is `config.json` with the keys `address`, `files`,
//! `port` and `readOnly`; everything else has built-in defaults. The `files`
//! path is the server base: host keys live under `<base>/.ssh` and the data
//! root exposed to local-backend sessions is `<base>/data`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listen address.
    #[serde(default = "default_address")]
    pub address: String,

    /// Base path for host keys and the local data root.
    #[serde(rename = "files", default)]
    pub base_path: PathBuf,

    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Refuse every mutating operation, regardless of user permissions.
    #[serde(rename = "readOnly", default)]
    pub read_only: bool,

    /// Directory under the base path holding key material.
    #[serde(default = "default_ssh_dir")]
    pub ssh_dir: String,

    /// Host key file names within `ssh_dir`.
    #[serde(default = "default_private_key")]
    pub private_key: String,
    #[serde(default = "default_public_key")]
    pub public_key: String,

    /// Emit notifications for filesystem events.
    #[serde(default = "default_notify")]
    pub notify: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: default_address(),
            base_path: PathBuf::new(),
            port: default_port(),
            read_only: false,
            ssh_dir: default_ssh_dir(),
            private_key: default_private_key(),
            public_key: default_public_key(),
            notify: default_notify(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))
    }

    /// The base path made absolute against the working directory.
    pub fn absolute_base_path(&self) -> PathBuf {
        if self.base_path.is_absolute() {
            return self.base_path.clone();
        }
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(&self.base_path),
            Err(_) => self.base_path.clone(),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    2022
}

fn default_ssh_dir() -> String {
    ".ssh".to_string()
}

fn default_private_key() -> String {
    "id_rsa".to_string()
}

fn default_public_key() -> String {
    "id_rsa.pub".to_string()
}

fn default_notify() -> bool {
    true
}

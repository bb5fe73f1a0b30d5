// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! User configuration (`~/.dlmgr/config.json`).
//!
//! ```json
//! {
//!   "aria2": {
//!     "rpc_secret": "secret123",
//!     "rpc_port": 6800,
//!     "binary": null,
//!     "alternate_ports": [6800, 6880, 6999],
//!     "keep_server_alive": true
//!   },
//!   "mega": { "email": null, "password": null, "binary": null },
//!   "download_dir": null,
//!   "direct_fallback": false
//! }
//! ```
//!
//! A missing or malformed file yields defaults. `ARIA2_DIRECT_FALLBACK`
//! overrides `direct_fallback` when set.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::aria2::{DEFAULT_ALTERNATE_PORTS, DEFAULT_RPC_PORT, DEFAULT_RPC_SECRET};
use crate::backend::{Aria2Config, MegaConfig};
use crate::utils::{self, mask_sensitive};

/// Environment toggle for the direct-fetch tier.
pub const DIRECT_FALLBACK_ENV: &str = "ARIA2_DIRECT_FALLBACK";

fn default_secret() -> String {
    DEFAULT_RPC_SECRET.to_string()
}

fn default_port() -> u16 {
    DEFAULT_RPC_PORT
}

fn default_alternates() -> Vec<u16> {
    DEFAULT_ALTERNATE_PORTS.to_vec()
}

fn default_keep_alive() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Aria2Section {
    #[serde(default = "default_secret")]
    pub rpc_secret: String,
    #[serde(default = "default_port")]
    pub rpc_port: u16,
    #[serde(default)]
    pub binary: Option<PathBuf>,
    #[serde(default = "default_alternates")]
    pub alternate_ports: Vec<u16>,
    #[serde(default = "default_keep_alive")]
    pub keep_server_alive: bool,
}

impl Default for Aria2Section {
    fn default() -> Self {
        Self {
            rpc_secret: default_secret(),
            rpc_port: default_port(),
            binary: None,
            alternate_ports: default_alternates(),
            keep_server_alive: default_keep_alive(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MegaSection {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub binary: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub aria2: Aria2Section,
    #[serde(default)]
    pub mega: MegaSection,
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
    #[serde(default)]
    pub direct_fallback: bool,
}

/// Truthy values accepted for environment toggles.
pub fn parse_env_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Reject port 0; everything else a `u16` holds is valid.
pub fn validate_port(port: u16) -> Result<u16> {
    if port == 0 {
        bail!("RPC port must be between 1 and 65535");
    }
    Ok(port)
}

impl Config {
    /// `~/.dlmgr`
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".dlmgr"))
            .unwrap_or_else(|| PathBuf::from(".dlmgr"))
    }

    pub fn default_path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load from the default location.
    pub fn load() -> Self {
        Self::load_from(&Self::default_path())
    }

    /// Load from `path`, falling back to defaults when the file is missing
    /// or unreadable.
    pub fn load_from(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                tracing::warn!("Cannot read config {:?} ({}), using defaults", path, e);
                return Self::default();
            }
        };

        let mut config: Config = match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Config {:?} is malformed ({}), using defaults", path, e);
                return Self::default();
            }
        };

        if validate_port(config.aria2.rpc_port).is_err() {
            tracing::warn!("Config rpc_port 0 is invalid, using {}", DEFAULT_RPC_PORT);
            config.aria2.rpc_port = DEFAULT_RPC_PORT;
        }
        config.aria2.alternate_ports.retain(|p| *p != 0);

        config
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Temp file + fsync + rename.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        validate_port(self.aria2.rpc_port)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize config to JSON")?;
        let temp_path = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
            file.write_all(content.as_bytes())
                .context("Failed to write config")?;
            file.sync_all().context("Failed to sync config to disk")?;
        }
        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to replace config file: {:?}", path))?;
        Ok(())
    }

    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(utils::default_download_dir)
    }

    /// Direct fallback setting after applying the environment override.
    pub fn direct_fallback_enabled(&self) -> bool {
        match std::env::var(DIRECT_FALLBACK_ENV) {
            Ok(value) => parse_env_flag(&value),
            Err(_) => self.direct_fallback,
        }
    }

    pub fn aria2_config(&self) -> Aria2Config {
        Aria2Config {
            rpc_port: self.aria2.rpc_port,
            rpc_secret: self.aria2.rpc_secret.clone(),
            alternate_ports: self.aria2.alternate_ports.clone(),
            binary: self.aria2.binary.clone(),
            keep_server_alive: self.aria2.keep_server_alive,
            download_dir: self.download_dir(),
            direct_fallback: self.direct_fallback_enabled(),
            ..Aria2Config::default()
        }
    }

    pub fn mega_config(&self) -> MegaConfig {
        MegaConfig {
            binary: self.mega.binary.clone(),
            email: self.mega.email.clone(),
            password: self.mega.password.clone(),
            download_dir: self.download_dir(),
        }
    }

    /// Copy with secrets masked, for display.
    pub fn masked(&self) -> Self {
        let mut shown = self.clone();
        shown.aria2.rpc_secret = mask_sensitive(&self.aria2.rpc_secret, 3);
        shown.mega.password = self.mega.password.as_deref().map(|p| mask_sensitive(p, 0));
        shown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("config.json"));
        assert_eq!(config, Config::default());
        assert_eq!(config.aria2.rpc_port, 6800);
        assert_eq!(config.aria2.rpc_secret, "secret123");
    }

    #[test]
    fn test_malformed_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(Config::load_from(&path), Config::default());

        // Out of range for u16
        fs::write(&path, r#"{"aria2": {"rpc_port": 70000}}"#).unwrap();
        assert_eq!(Config::load_from(&path).aria2.rpc_port, 6800);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"aria2": {"rpc_port": 7000}, "direct_fallback": true}"#).unwrap();

        let config = Config::load_from(&path);
        assert_eq!(config.aria2.rpc_port, 7000);
        assert_eq!(config.aria2.rpc_secret, "secret123");
        assert_eq!(config.aria2.alternate_ports, vec![6800, 6880, 6999]);
        assert!(config.direct_fallback);
    }

    #[test]
    fn test_port_zero_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"aria2": {"rpc_port": 0}}"#).unwrap();
        assert_eq!(Config::load_from(&path).aria2.rpc_port, 6800);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.aria2.rpc_secret = "hunter2".to_string();
        config.aria2.rpc_port = 6801;
        config.mega.email = Some("user@example.com".to_string());
        config.save_to(&path).unwrap();

        assert_eq!(Config::load_from(&path), config);
    }

    #[test]
    fn test_save_rejects_port_zero() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.aria2.rpc_port = 0;
        assert!(config.save_to(&dir.path().join("config.json")).is_err());
    }

    #[test]
    fn test_masked_hides_secrets() {
        let mut config = Config::default();
        config.mega.password = Some("p4ssw0rd".to_string());
        let shown = config.masked();
        assert_eq!(shown.aria2.rpc_secret, "sec...");
        assert_eq!(shown.mega.password.as_deref(), Some("..."));
    }

    #[test]
    fn test_env_flag_values() {
        for yes in ["1", "true", "YES", "on", " On "] {
            assert!(parse_env_flag(yes), "{yes}");
        }
        for no in ["", "0", "false", "off", "maybe"] {
            assert!(!parse_env_flag(no), "{no}");
        }
    }
}

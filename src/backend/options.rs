// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Typed per-backend download options.
//!
//! Each backend accepts a closed set of options. Unknown keys cannot be
//! expressed, and values are range-checked before anything is spawned.

use std::path::PathBuf;

use serde_json::{Map, Value};

use crate::error::DownloadError;

/// Upper bound aria2 accepts for `max-connection-per-server`.
pub const MAX_CONNECTIONS_PER_SERVER: u8 = 16;

/// Upper bound we accept for `split`.
pub const MAX_SPLIT: u8 = 64;

/// Options for the aria2 backend, shared by the RPC and standalone tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    /// Output file name (`out`)
    pub out: Option<String>,
    /// Target directory (`dir`); the backend download dir when `None`
    pub dir: Option<PathBuf>,
    /// Verify TLS certificates. aria2 is run with this off by default.
    pub check_certificate: bool,
    /// `max-connection-per-server`, 1..=16
    pub max_connection_per_server: Option<u8>,
    /// `split`, 1..=64
    pub split: Option<u8>,
    /// `max-download-limit` in bytes per second
    pub max_download_limit: Option<u64>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            out: None,
            dir: None,
            check_certificate: false,
            max_connection_per_server: None,
            split: None,
            max_download_limit: None,
        }
    }
}

impl TransferOptions {
    pub fn validate(&self) -> Result<(), DownloadError> {
        if let Some(out) = &self.out {
            if out.trim().is_empty() {
                return Err(DownloadError::Options("output name is empty".to_string()));
            }
            if out.contains('/') || out.contains('\\') {
                return Err(DownloadError::Options(format!(
                    "output name '{}' must not contain path separators; use --dir",
                    out
                )));
            }
        }
        if let Some(n) = self.max_connection_per_server {
            if n == 0 || n > MAX_CONNECTIONS_PER_SERVER {
                return Err(DownloadError::Options(format!(
                    "max connections per server must be 1..={}, got {}",
                    MAX_CONNECTIONS_PER_SERVER, n
                )));
            }
        }
        if let Some(n) = self.split {
            if n == 0 || n > MAX_SPLIT {
                return Err(DownloadError::Options(format!(
                    "split must be 1..={}, got {}",
                    MAX_SPLIT, n
                )));
            }
        }
        if self.max_download_limit == Some(0) {
            return Err(DownloadError::Options(
                "max download limit must be positive; omit it for unlimited".to_string(),
            ));
        }
        Ok(())
    }

    /// aria2 RPC option object. aria2 expects every value as a string.
    pub fn to_rpc_options(&self, default_dir: &std::path::Path) -> Map<String, Value> {
        let mut opts = Map::new();
        let dir = self.dir.as_deref().unwrap_or(default_dir);
        opts.insert("dir".into(), Value::String(dir.display().to_string()));
        opts.insert(
            "check-certificate".into(),
            Value::String(self.check_certificate.to_string()),
        );
        if let Some(out) = &self.out {
            opts.insert("out".into(), Value::String(out.clone()));
        }
        if let Some(n) = self.max_connection_per_server {
            opts.insert("max-connection-per-server".into(), Value::String(n.to_string()));
        }
        if let Some(n) = self.split {
            opts.insert("split".into(), Value::String(n.to_string()));
        }
        if let Some(limit) = self.max_download_limit {
            opts.insert("max-download-limit".into(), Value::String(limit.to_string()));
        }
        opts
    }

    /// Command-line flags for a standalone (non-RPC) aria2c run, excluding
    /// the URL.
    pub fn to_cli_args(&self, default_dir: &std::path::Path) -> Vec<String> {
        let dir = self.dir.as_deref().unwrap_or(default_dir);
        let mut args = vec![
            format!("--check-certificate={}", self.check_certificate),
            "--enable-rpc=false".to_string(),
            "-d".to_string(),
            dir.display().to_string(),
        ];
        if let Some(out) = &self.out {
            args.push("-o".to_string());
            args.push(out.clone());
        }
        if let Some(n) = self.max_connection_per_server {
            args.push(format!("--max-connection-per-server={}", n));
        }
        if let Some(n) = self.split {
            args.push(format!("--split={}", n));
        }
        if let Some(limit) = self.max_download_limit {
            args.push(format!("--max-download-limit={}", limit));
        }
        args
    }
}

/// Options for `mega-get`.
///
/// Mixes plain flags (`-m`, `-q`, `--ignore-quota-warn`) with a key/value
/// option (`--password=...`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MegaOptions {
    /// `-m`: merge a folder into an existing local folder
    pub merge: bool,
    /// `-q`: queue the transfer in the MEGAcmd server and return at once
    pub queue: bool,
    /// `--ignore-quota-warn`
    pub ignore_quota_warning: bool,
    /// `--password=`: password for a protected link
    pub link_password: Option<String>,
}

impl MegaOptions {
    pub fn validate(&self) -> Result<(), DownloadError> {
        if let Some(pw) = &self.link_password {
            if pw.is_empty() {
                return Err(DownloadError::Options("link password is empty".to_string()));
            }
        }
        Ok(())
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.merge {
            args.push("-m".to_string());
        }
        if self.queue {
            args.push("-q".to_string());
        }
        if self.ignore_quota_warning {
            args.push("--ignore-quota-warn".to_string());
        }
        if let Some(pw) = &self.link_password {
            args.push(format!("--password={}", pw));
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_default_rpc_options() {
        let opts = TransferOptions::default().to_rpc_options(Path::new("/tmp/dl"));
        assert_eq!(opts.get("dir"), Some(&Value::String("/tmp/dl".into())));
        assert_eq!(opts.get("check-certificate"), Some(&Value::String("false".into())));
        assert_eq!(opts.len(), 2);
    }

    #[test]
    fn test_overrides_in_rpc_options() {
        let opts = TransferOptions {
            out: Some("ubuntu.iso".into()),
            dir: Some(PathBuf::from("/srv/isos")),
            max_connection_per_server: Some(8),
            split: Some(8),
            max_download_limit: Some(1_048_576),
            ..Default::default()
        };
        let map = opts.to_rpc_options(Path::new("/tmp/dl"));
        assert_eq!(map["dir"], "/srv/isos");
        assert_eq!(map["out"], "ubuntu.iso");
        assert_eq!(map["max-connection-per-server"], "8");
        assert_eq!(map["split"], "8");
        assert_eq!(map["max-download-limit"], "1048576");
    }

    #[test]
    fn test_cli_args_match_standalone_invocation() {
        let opts = TransferOptions {
            out: Some("file.bin".into()),
            ..Default::default()
        };
        let args = opts.to_cli_args(Path::new("/tmp/dl"));
        assert_eq!(
            args,
            vec![
                "--check-certificate=false",
                "--enable-rpc=false",
                "-d",
                "/tmp/dl",
                "-o",
                "file.bin"
            ]
        );
    }

    #[test]
    fn test_validation_rejects_out_of_range() {
        let too_many = TransferOptions {
            max_connection_per_server: Some(17),
            ..Default::default()
        };
        assert!(too_many.validate().is_err());

        let zero_split = TransferOptions {
            split: Some(0),
            ..Default::default()
        };
        assert!(zero_split.validate().is_err());

        let path_out = TransferOptions {
            out: Some("../etc/passwd".into()),
            ..Default::default()
        };
        assert!(path_out.validate().is_err());

        assert!(TransferOptions::default().validate().is_ok());
    }

    #[test]
    fn test_mega_args() {
        let opts = MegaOptions {
            merge: true,
            ignore_quota_warning: true,
            link_password: Some("hunter2".into()),
            ..Default::default()
        };
        assert_eq!(opts.to_args(), vec!["-m", "--ignore-quota-warn", "--password=hunter2"]);
        assert!(MegaOptions::default().to_args().is_empty());
    }
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download backends and backend selection.
//!
//! Two backends implement the same capability set ([`Backend`]):
//!
//! ```text
//!              select(url, override)
//!                     │
//!        ┌────────────┴─────────────┐
//!        ▼                          ▼
//! ┌──────────────┐          ┌──────────────┐
//! │ Aria2Backend │          │ MegaBackend  │
//! │ RPC → spawn  │          │ mega-get per │
//! │ → direct     │          │ job          │
//! └──────────────┘          └──────────────┘
//! ```
//!
//! The chosen [`BackendKind`] is stored on the job record and never
//! re-derived.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::DownloadError;
use crate::progress::ProgressReport;

pub mod aria2;
pub mod locate;
pub mod mega;
pub mod options;

pub use aria2::{Aria2Backend, Aria2Config};
pub use mega::{MegaBackend, MegaConfig};
pub use options::{MegaOptions, TransferOptions};

/// `https://mega.nz/...`, `https://www.mega.co.nz/...`, `https://mega.io/...`
static CLOUD_URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^https?://(?:www\.)?mega\.(?:nz|co\.nz|io)(?:[/:?#]|$)")
        .expect("valid cloud URL pattern")
});

/// Which backend owns a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// aria2c over JSON-RPC, with standalone and direct fallbacks
    #[serde(alias = "Aria2Backend", alias = "Aria2")]
    Aria2,
    /// MEGAcmd `mega-get`
    #[serde(alias = "MegaBackend", alias = "Mega")]
    Mega,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Aria2 => "aria2",
            BackendKind::Mega => "mega",
        }
    }

    /// Parse a backend name, case-insensitive. Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "aria2" | "aria2c" => Some(BackendKind::Aria2),
            "mega" | "megacmd" => Some(BackendKind::Mega),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns true for URLs the cloud-storage CLI should handle.
pub fn is_cloud_url(url: &str) -> bool {
    let url = url.trim();
    url.get(..7)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("mega://"))
        || CLOUD_URL_PATTERN.is_match(url)
}

/// Pick the backend for a URL.
///
/// A recognized explicit backend always wins; otherwise cloud-storage URLs
/// go to [`BackendKind::Mega`] and everything else (magnet, http, https,
/// ftp) to [`BackendKind::Aria2`]. Pure: no I/O, no dependence on which
/// tools are installed.
pub fn select(url: &str, explicit_backend: Option<&str>) -> BackendKind {
    if let Some(name) = explicit_backend {
        match BackendKind::parse(name) {
            Some(kind) => return kind,
            None => tracing::warn!("Unknown backend '{}', selecting by URL", name),
        }
    }

    if is_cloud_url(url) {
        BackendKind::Mega
    } else {
        BackendKind::Aria2
    }
}

/// How a submitted job can be referred to later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handle {
    /// aria2-assigned GID
    Rpc(String),
    /// OS process id of a directly spawned downloader
    Process(u32),
    /// Bytes already fetched; nothing to poll
    DirectComplete,
}

/// Which fallback tier ended up carrying a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Submitted to an aria2 RPC server
    Rpc,
    /// aria2c spawned without RPC
    Standalone,
    /// Fetched by dlmgr itself
    Direct,
    /// Non-aria2 backend process
    Process,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Rpc => write!(f, "aria2 RPC"),
            Tier::Standalone => write!(f, "standalone aria2c"),
            Tier::Direct => write!(f, "direct download"),
            Tier::Process => write!(f, "process"),
        }
    }
}

/// Result of a successful `add`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub handle: Handle,
    pub tier: Tier,
}

impl Submission {
    pub fn new(handle: Handle, tier: Tier) -> Self {
        Self { handle, tier }
    }
}

/// What a backend needs to start one download.
#[derive(Debug, Clone, Default)]
pub struct AddRequest {
    pub url: String,
    /// Target directory; the backend default applies when `None`
    pub dir: Option<PathBuf>,
    pub transfer: TransferOptions,
    pub mega: MegaOptions,
}

impl AddRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Capability set shared by every backend.
///
/// `pause`/`resume`/`remove` act on backend-native handles only. Coarse
/// process suspension is the job manager's business, not the backend's.
pub trait Backend {
    fn kind(&self) -> BackendKind;

    /// Start a download. Blocks until the job is handed off (or, for the
    /// direct tier, finished).
    fn add(&mut self, request: &AddRequest) -> Result<Submission, DownloadError>;

    fn pause(&mut self, rpc_handle: &str) -> Result<(), DownloadError>;

    fn resume(&mut self, rpc_handle: &str) -> Result<(), DownloadError>;

    fn remove(&mut self, rpc_handle: &str) -> Result<(), DownloadError>;

    /// Poll a backend-native handle. `Ok(None)` when the backend has no
    /// status primitive.
    fn status(&mut self, rpc_handle: &str) -> Result<Option<ProgressReport>, DownloadError>;

    /// Liveness of a process this backend spawned, if it still owns the
    /// child handle. `None` means "not mine, ask the OS".
    fn owned_process_alive(&mut self, _pid: u32) -> Option<bool> {
        None
    }

    /// Release supervision state. Called once when the manager shuts down.
    fn shutdown(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_by_url() {
        assert_eq!(select("https://mega.nz/file/abc", None), BackendKind::Mega);
        assert_eq!(select("mega://folder/xyz", None), BackendKind::Mega);
        assert_eq!(select("https://mega.co.nz/#!abc", None), BackendKind::Mega);
        assert_eq!(select("http://example.com/file.zip", None), BackendKind::Aria2);
        assert_eq!(select("magnet:?xt=urn:btih:abc", None), BackendKind::Aria2);
        assert_eq!(select("ftp://example.com/file", None), BackendKind::Aria2);
        assert_eq!(select("https://example.com/file", None), BackendKind::Aria2);
        assert_eq!(select("https://notmega.nz/file", None), BackendKind::Aria2);
        assert_eq!(select("https://mega.nzz/file", None), BackendKind::Aria2);
    }

    #[test]
    fn test_explicit_backend_wins() {
        assert_eq!(select("https://mega.nz/file/abc", Some("aria2")), BackendKind::Aria2);
        assert_eq!(select("http://example.com/file.zip", Some("mega")), BackendKind::Mega);
        assert_eq!(select("http://example.com/file.zip", Some("MEGA")), BackendKind::Mega);
    }

    #[test]
    fn test_unknown_override_falls_back_to_url() {
        assert_eq!(select("https://mega.nz/file/abc", Some("curl")), BackendKind::Mega);
        assert_eq!(select("http://example.com/a", Some("")), BackendKind::Aria2);
    }

    #[test]
    fn test_select_is_deterministic() {
        let urls = ["https://mega.nz/file/abc", "magnet:?xt=urn:btih:1", "ftp://x/y"];
        for url in urls {
            let first = select(url, None);
            for _ in 0..10 {
                assert_eq!(select(url, None), first);
            }
        }
    }

    #[test]
    fn test_backend_kind_serde() {
        assert_eq!(serde_json::to_string(&BackendKind::Aria2).unwrap(), "\"aria2\"");
        let legacy: BackendKind = serde_json::from_str("\"MegaBackend\"").unwrap();
        assert_eq!(legacy, BackendKind::Mega);
    }
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! aria2 backend with a three-tier fallback chain.
//!
//! ```text
//! add(url)
//!   │ precheck (http/https only)
//!   ▼
//! ensure_endpoint ──ok──► aria2.addUri ──ok──► tellStatus probe ──► GID
//!   │                         │                     │
//!   │ socket permission       │ socket permission   │ permission errorMessage
//!   ▼                         ▼                     ▼
//! standalone aria2c (no RPC) ─────────────────────────────────────► PID
//!   │ spawn failed                │ other addUri failure
//!   ▼                             ▼
//! direct fetch (if enabled) ──────────────────────────────────────► "direct-download"
//! ```

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use super::locate;
use super::{AddRequest, Backend, BackendKind, Handle, Submission, Tier};
use crate::error::{DownloadError, EndpointError, FailureClass};
use crate::process::ChildRegistry;
use crate::progress::ProgressReport;
use crate::utils;

pub mod direct;
pub mod endpoint;
pub mod precheck;
pub mod rpc;

pub use endpoint::{candidate_ports, Aria2Session, EndpointState};
pub use rpc::{Aria2Status, RpcClient};

/// Shared secret used when none is configured.
pub const DEFAULT_RPC_SECRET: &str = "secret123";

/// Default RPC port.
pub const DEFAULT_RPC_PORT: u16 = 6800;

/// Ports tried after the configured one.
pub const DEFAULT_ALTERNATE_PORTS: [u16; 3] = [6800, 6880, 6999];

/// Runtime settings for the aria2 backend.
#[derive(Debug, Clone)]
pub struct Aria2Config {
    pub rpc_host: String,
    pub rpc_port: u16,
    pub rpc_secret: String,
    pub alternate_ports: Vec<u16>,
    /// Explicit aria2c path; located automatically when `None`
    pub binary: Option<PathBuf>,
    /// Leave a spawned RPC server running after this process exits
    pub keep_server_alive: bool,
    pub download_dir: PathBuf,
    /// Allow the in-process direct-fetch tier
    pub direct_fallback: bool,
}

impl Default for Aria2Config {
    fn default() -> Self {
        Self {
            rpc_host: "localhost".to_string(),
            rpc_port: DEFAULT_RPC_PORT,
            rpc_secret: DEFAULT_RPC_SECRET.to_string(),
            alternate_ports: DEFAULT_ALTERNATE_PORTS.to_vec(),
            binary: None,
            keep_server_alive: true,
            download_dir: utils::default_download_dir(),
            direct_fallback: false,
        }
    }
}

/// aria2c driven over JSON-RPC, with standalone and direct fallbacks.
#[derive(Debug)]
pub struct Aria2Backend {
    config: Aria2Config,
    session: Aria2Session,
    children: ChildRegistry,
}

impl Aria2Backend {
    pub fn new(config: Aria2Config) -> Self {
        let session = Aria2Session::new(&config);
        Self {
            config,
            session,
            children: ChildRegistry::new(),
        }
    }

    pub fn config(&self) -> &Aria2Config {
        &self.config
    }

    pub fn session(&self) -> &Aria2Session {
        &self.session
    }

    /// Progress of one GID. Errors only when the server cannot be asked.
    pub fn get_status(&mut self, gid: &str) -> Result<ProgressReport, DownloadError> {
        let client = self.session.connect_existing()?;
        let status = client.tell_status(gid)?;
        Ok(ProgressReport::from_status(gid, &status))
    }

    /// Every download the RPC server currently reports as active.
    pub fn list_active(&mut self) -> Result<Vec<ProgressReport>, DownloadError> {
        let client = self.session.connect_existing()?;
        let active = client.tell_active()?;
        Ok(active
            .iter()
            .map(|status| ProgressReport::from_status("", status))
            .collect())
    }

    fn target_dir(&self, request: &AddRequest) -> PathBuf {
        request
            .transfer
            .dir
            .clone()
            .or_else(|| request.dir.clone())
            .unwrap_or_else(|| self.config.download_dir.clone())
    }

    fn submit_rpc(
        &mut self,
        client: &RpcClient,
        request: &AddRequest,
        dir: &Path,
    ) -> Result<Submission, DownloadError> {
        let options = request.transfer.to_rpc_options(dir);
        let gid = match client.add_uri(&request.url, options) {
            Ok(gid) => gid,
            Err(e) => {
                let err = DownloadError::from(e);
                tracing::warn!("Failed to add download via RPC: {}", err);
                if err.is_socket_permission() {
                    tracing::info!("RPC call blocked by socket permissions, switching to standalone aria2c");
                    return self.spawn_standalone(request, dir);
                }
                if self.config.direct_fallback {
                    match self.direct(request, dir) {
                        Ok(submission) => return Ok(submission),
                        Err(direct_err) => {
                            tracing::warn!("Fallback direct download failed: {}", direct_err)
                        }
                    }
                }
                return Err(err);
            }
        };

        tracing::info!("Added download (GID: {}) via aria2 RPC on port {}", gid, client.port());

        // A blocked socket inside aria2 surfaces only as an errorMessage
        match client.tell_status(&gid) {
            Ok(status) => {
                let blocked = status
                    .error_message
                    .as_deref()
                    .is_some_and(|msg| FailureClass::from_diagnostic(msg) == FailureClass::SocketPermission);
                if blocked {
                    tracing::warn!("aria2 reports a socket permission block for {}, switching to standalone aria2c", gid);
                    if let Err(e) = client.remove(&gid) {
                        tracing::debug!("Could not cancel {}: {}", gid, e);
                    }
                    return self.spawn_standalone(request, dir);
                }
            }
            Err(e) => tracing::debug!("Status probe for {} failed: {}", gid, e),
        }

        Ok(Submission::new(Handle::Rpc(gid), Tier::Rpc))
    }

    /// aria2c without RPC, one process per download.
    fn spawn_standalone(&mut self, request: &AddRequest, dir: &Path) -> Result<Submission, DownloadError> {
        let spawned = self.resolve_binary().and_then(|binary| {
            Command::new(&binary)
                .args(request.transfer.to_cli_args(dir))
                .arg(&request.url)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|source| DownloadError::Spawn { binary, source })
        });

        match spawned {
            Ok(child) => {
                let pid = self.children.track(child);
                tracing::info!("Started standalone aria2c (no RPC), pid {}", pid);
                Ok(Submission::new(Handle::Process(pid), Tier::Standalone))
            }
            Err(e) => {
                tracing::warn!("Standalone aria2c failed: {}", e);
                if self.config.direct_fallback {
                    return self.direct(request, dir);
                }
                Err(e)
            }
        }
    }

    fn direct(&self, request: &AddRequest, dir: &Path) -> Result<Submission, DownloadError> {
        tracing::info!("Falling back to direct download for {}", request.url);
        direct::fetch(&request.url, dir, request.transfer.out.as_deref())?;
        Ok(Submission::new(Handle::DirectComplete, Tier::Direct))
    }

    fn resolve_binary(&self) -> Result<PathBuf, DownloadError> {
        locate::locate_aria2(self.config.binary.as_deref()).ok_or_else(|| DownloadError::BinaryNotFound {
            binary: self
                .config
                .binary
                .clone()
                .unwrap_or_else(|| PathBuf::from(locate::exe_name(locate::ARIA2_BINARY))),
        })
    }
}

impl Backend for Aria2Backend {
    fn kind(&self) -> BackendKind {
        BackendKind::Aria2
    }

    fn add(&mut self, request: &AddRequest) -> Result<Submission, DownloadError> {
        request.transfer.validate()?;
        precheck::check_url(&request.url)?;

        let dir = self.target_dir(request);
        utils::ensure_download_dir(&dir).map_err(|source| DownloadError::DownloadDir {
            dir: dir.clone(),
            source,
        })?;

        match self.session.ensure_endpoint(&dir) {
            Ok(client) => self.submit_rpc(&client, request, &dir),
            Err(e) if e.is_socket_permission() => {
                tracing::info!("RPC start blocked by socket permissions ({}), switching to standalone aria2c", e);
                self.spawn_standalone(request, &dir)
            }
            Err(EndpointError::BinaryNotFound { binary }) if self.config.direct_fallback => {
                tracing::warn!("{:?} not found", binary);
                self.direct(request, &dir)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn pause(&mut self, rpc_handle: &str) -> Result<(), DownloadError> {
        let client = self.session.connect_existing()?;
        client.pause(rpc_handle)?;
        Ok(())
    }

    fn resume(&mut self, rpc_handle: &str) -> Result<(), DownloadError> {
        let client = self.session.connect_existing()?;
        client.unpause(rpc_handle)?;
        Ok(())
    }

    fn remove(&mut self, rpc_handle: &str) -> Result<(), DownloadError> {
        let client = self.session.connect_existing()?;
        client.remove(rpc_handle)?;
        Ok(())
    }

    fn status(&mut self, rpc_handle: &str) -> Result<Option<ProgressReport>, DownloadError> {
        self.get_status(rpc_handle).map(Some)
    }

    fn owned_process_alive(&mut self, pid: u32) -> Option<bool> {
        self.children.poll(pid)
    }

    fn shutdown(&mut self) {
        self.session.shutdown();
    }
}

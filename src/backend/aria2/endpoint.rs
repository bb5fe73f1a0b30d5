// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! aria2 RPC endpoint supervision.
//!
//! An [`Aria2Session`] finds a healthy RPC server or starts one:
//!
//! ```text
//! Unstarted ──► Probing(port) ──healthy──────────────────► Ready(port)
//!                  │  │
//!                  │  └─unreachable─► Launching(port) ─ok─► Ready(port)
//!                  │                        │
//!                  └─auth rejected / busy ──┴─exit/timeout─► next port
//!
//! all ports tried ──► Failed (NoReachableServer)
//! socket permission denied on any port ──► Failed (SocketPermission)
//! ```
//!
//! The session owns the aria2c child it spawned. A child left behind on an
//! abandoned port is always killed; the child serving the Ready port is
//! either left running or killed at teardown, per `keep_server_alive`.

use std::fs::{self, File};
use std::io;
use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use super::rpc::RpcClient;
use super::Aria2Config;
use crate::backend::locate;
use crate::error::{EndpointError, FailureClass, RpcError};

/// Health checks after a launch.
const LAUNCH_POLL_ATTEMPTS: u32 = 10;

/// Delay between health checks after a launch.
const LAUNCH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Most child output kept for diagnostics.
const MAX_OUTPUT_CHARS: usize = 2000;

/// Where the session is in establishing an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Unstarted,
    Probing { port: u16 },
    Launching { port: u16 },
    Ready { port: u16 },
    Failed,
}

/// Candidate RPC ports: configured port, alternates, then the ephemeral
/// port. Duplicates and port 0 are dropped; order is preserved.
pub fn candidate_ports(configured: u16, alternates: &[u16], ephemeral: Option<u16>) -> Vec<u16> {
    let mut ports = Vec::with_capacity(alternates.len() + 2);
    for port in std::iter::once(configured)
        .chain(alternates.iter().copied())
        .chain(ephemeral)
    {
        if port != 0 && !ports.contains(&port) {
            ports.push(port);
        }
    }
    ports
}

/// Ask the OS for a free loopback port.
fn ephemeral_port() -> Option<u16> {
    match TcpListener::bind((Ipv4Addr::LOCALHOST, 0)) {
        Ok(listener) => listener.local_addr().ok().map(|a| a.port()),
        Err(e) => {
            tracing::debug!("Could not reserve an ephemeral port: {}", e);
            None
        }
    }
}

/// Result of one health probe.
#[derive(Debug)]
enum Probe {
    Healthy(String),
    AuthRejected,
    SocketPermission(String),
    /// Something answered, but not like aria2
    Foreign(String),
    Unreachable,
}

fn probe(client: &RpcClient) -> Probe {
    match client.get_version() {
        Ok(version) => Probe::Healthy(version),
        Err(e) => match e.class() {
            FailureClass::Unauthorized => Probe::AuthRejected,
            FailureClass::SocketPermission => Probe::SocketPermission(e.to_string()),
            _ => match e {
                RpcError::Transport { .. } => Probe::Unreachable,
                other => Probe::Foreign(other.to_string()),
            },
        },
    }
}

/// An aria2c child process owned by a session.
///
/// Killed on drop unless [`detach`](Self::detach)ed. stdout and stderr go
/// to a log file so a chatty child can never block on a full pipe.
#[derive(Debug)]
pub struct SupervisedChild {
    child: Option<Child>,
    port: u16,
    log_path: PathBuf,
}

impl SupervisedChild {
    fn spawn(binary: &Path, port: u16, secret: &str, dir: &Path) -> Result<Self, EndpointError> {
        let log_path = std::env::temp_dir().join(format!("dlmgr-aria2-{}.log", port));
        let log = File::create(&log_path).map_err(|source| EndpointError::Spawn {
            binary: binary.to_path_buf(),
            source,
        })?;
        let log_err = log.try_clone().map_err(|source| EndpointError::Spawn {
            binary: binary.to_path_buf(),
            source,
        })?;

        let child = Command::new(binary)
            .arg("--enable-rpc")
            .arg(format!("--rpc-listen-port={}", port))
            .arg("--rpc-listen-all=false")
            .arg("--check-certificate=false")
            .arg(format!("--rpc-secret={}", secret))
            .arg(format!("--dir={}", dir.display()))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|source| EndpointError::Spawn {
                binary: binary.to_path_buf(),
                source,
            })?;

        tracing::info!("Started aria2c RPC server on port {} (pid {})", port, child.id());

        Ok(Self {
            child: Some(child),
            port,
            log_path,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Exit status if the child has already exited.
    fn exit_status(&mut self) -> Option<String> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("unknown ({})", e)),
        }
    }

    /// Everything the child wrote so far, trimmed to the tail.
    fn output(&self) -> String {
        let text = fs::read_to_string(&self.log_path).unwrap_or_default();
        let text = text.trim();
        let count = text.chars().count();
        if count > MAX_OUTPUT_CHARS {
            text.chars().skip(count - MAX_OUTPUT_CHARS).collect()
        } else {
            text.to_string()
        }
    }

    /// Stop supervising and leave the process running.
    pub fn detach(mut self) -> Option<u32> {
        self.child.take().map(|child| child.id())
    }
}

impl Drop for SupervisedChild {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let pid = child.id();
            match child.try_wait() {
                Ok(Some(_)) => {}
                _ => {
                    if let Err(e) = child.kill() {
                        tracing::debug!("Failed to kill aria2c (pid {}): {}", pid, e);
                    }
                    let _ = child.wait();
                    tracing::debug!("Stopped aria2c on port {} (pid {})", self.port, pid);
                }
            }
            let _ = fs::remove_file(&self.log_path);
        }
    }
}

/// Process-local connection state for the aria2 backend.
#[derive(Debug)]
pub struct Aria2Session {
    host: String,
    secret: String,
    configured_port: u16,
    alternate_ports: Vec<u16>,
    binary: Option<PathBuf>,
    keep_server_alive: bool,
    state: EndpointState,
    client: Option<RpcClient>,
    child: Option<SupervisedChild>,
}

impl Aria2Session {
    pub fn new(config: &Aria2Config) -> Self {
        Self {
            host: config.rpc_host.clone(),
            secret: config.rpc_secret.clone(),
            configured_port: config.rpc_port,
            alternate_ports: config.alternate_ports.clone(),
            binary: config.binary.clone(),
            keep_server_alive: config.keep_server_alive,
            state: EndpointState::Unstarted,
            client: None,
            child: None,
        }
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    /// Port of the Ready endpoint, if any.
    pub fn port(&self) -> Option<u16> {
        match self.state {
            EndpointState::Ready { port } => Some(port),
            _ => None,
        }
    }

    /// PID of the aria2c server this session spawned, if any.
    pub fn child_pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(SupervisedChild::pid)
    }

    /// Return a client for a healthy endpoint, launching aria2c if needed.
    pub fn ensure_endpoint(&mut self, download_dir: &Path) -> Result<RpcClient, EndpointError> {
        if let Some(client) = self.ready_client() {
            return Ok(client);
        }

        let ports = candidate_ports(self.configured_port, &self.alternate_ports, ephemeral_port());
        let mut last: Option<EndpointError> = None;

        for &port in &ports {
            self.state = EndpointState::Probing { port };
            let client = RpcClient::new(&self.host, port, &self.secret);

            match probe(&client) {
                Probe::Healthy(version) => {
                    tracing::debug!("aria2 {} already serving on port {}", version, port);
                    self.adopt(client, None);
                    return self.current();
                }
                Probe::AuthRejected => {
                    tracing::warn!("Port {} runs aria2 with a different secret, skipping", port);
                    last = Some(EndpointError::AuthRejected { port });
                    continue;
                }
                Probe::SocketPermission(detail) => {
                    self.state = EndpointState::Failed;
                    return Err(EndpointError::SocketPermission { port, detail });
                }
                Probe::Foreign(detail) => {
                    tracing::debug!("Port {} answered like something else: {}", port, detail);
                    last = Some(EndpointError::PortBusy { port });
                    continue;
                }
                Probe::Unreachable => {}
            }

            match check_bindable(port) {
                Ok(()) => {}
                Err(err @ EndpointError::SocketPermission { .. }) => {
                    self.state = EndpointState::Failed;
                    return Err(err);
                }
                Err(err) => {
                    tracing::debug!("{}", err);
                    last = Some(err);
                    continue;
                }
            }

            self.state = EndpointState::Launching { port };
            let binary = match self.resolve_binary() {
                Ok(binary) => binary,
                Err(err) => {
                    self.state = EndpointState::Failed;
                    return Err(err);
                }
            };

            let mut child = match SupervisedChild::spawn(&binary, port, &self.secret, download_dir) {
                Ok(child) => child,
                Err(err) => {
                    self.state = EndpointState::Failed;
                    return Err(err);
                }
            };

            match await_ready(&client, &mut child) {
                Ok(()) => {
                    self.adopt(client, Some(child));
                    return self.current();
                }
                Err(err) if err.is_socket_permission() => {
                    self.state = EndpointState::Failed;
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!("{}", err);
                    last = Some(err);
                }
            }
        }

        self.state = EndpointState::Failed;
        Err(EndpointError::NoReachableServer {
            tried: ports,
            last: last.map(Box::new),
        })
    }

    /// Return a client for an already running endpoint. Never spawns.
    ///
    /// Used for pause/resume/remove/status, which only make sense against
    /// the server that holds the job.
    pub fn connect_existing(&mut self) -> Result<RpcClient, EndpointError> {
        if let Some(client) = self.ready_client() {
            return Ok(client);
        }

        let ports = candidate_ports(self.configured_port, &self.alternate_ports, None);
        let mut last: Option<EndpointError> = None;

        for &port in &ports {
            self.state = EndpointState::Probing { port };
            let client = RpcClient::new(&self.host, port, &self.secret);
            match probe(&client) {
                Probe::Healthy(_) => {
                    self.adopt(client, None);
                    return self.current();
                }
                Probe::AuthRejected => last = Some(EndpointError::AuthRejected { port }),
                Probe::SocketPermission(detail) => {
                    self.state = EndpointState::Failed;
                    return Err(EndpointError::SocketPermission { port, detail });
                }
                Probe::Foreign(_) => last = Some(EndpointError::PortBusy { port }),
                Probe::Unreachable => {}
            }
        }

        self.state = EndpointState::Unstarted;
        Err(EndpointError::NoReachableServer {
            tried: ports,
            last: last.map(Box::new),
        })
    }

    /// True for ports a later invocation probes again. The ephemeral port
    /// is never one of them.
    fn is_known_port(&self, port: u16) -> bool {
        port == self.configured_port || self.alternate_ports.contains(&port)
    }

    /// Release the endpoint. The Ready child keeps serving when
    /// `keep_server_alive` is set and it listens on a known port; anything
    /// else is killed.
    pub fn shutdown(&mut self) {
        let ready_port = self.port();
        if let Some(child) = self.child.take() {
            let port = child.port();
            if self.keep_server_alive && ready_port == Some(port) && self.is_known_port(port) {
                if let Some(pid) = child.detach() {
                    tracing::info!("Leaving aria2c RPC server running on port {} (pid {})", port, pid);
                }
            } else {
                if self.keep_server_alive && ready_port == Some(port) {
                    tracing::info!("Stopping aria2c on ephemeral port {}; it would be unreachable later", port);
                }
                drop(child);
            }
        }
        self.client = None;
        self.state = EndpointState::Unstarted;
    }

    /// Client for the Ready endpoint if it still answers.
    fn ready_client(&mut self) -> Option<RpcClient> {
        let EndpointState::Ready { port } = self.state else {
            return None;
        };
        let client = self.client.clone()?;
        if matches!(probe(&client), Probe::Healthy(_)) {
            return Some(client);
        }

        tracing::warn!("aria2 RPC on port {} stopped answering, renegotiating", port);
        self.client = None;
        if self.child.as_ref().is_some_and(|c| c.port() == port) {
            self.child = None;
        }
        self.state = EndpointState::Unstarted;
        None
    }

    fn current(&self) -> Result<RpcClient, EndpointError> {
        self.client
            .clone()
            .ok_or(EndpointError::NoReachableServer { tried: Vec::new(), last: None })
    }

    /// Make `client` the Ready endpoint. A previously spawned child on a
    /// different port is dropped, which kills it.
    fn adopt(&mut self, client: RpcClient, spawned: Option<SupervisedChild>) {
        let port = client.port();
        match spawned {
            Some(child) => self.child = Some(child),
            None => {
                if self.child.as_ref().is_some_and(|c| c.port() != port) {
                    self.child = None;
                }
            }
        }
        self.client = Some(client);
        self.state = EndpointState::Ready { port };
    }

    fn resolve_binary(&self) -> Result<PathBuf, EndpointError> {
        locate::locate_aria2(self.binary.as_deref()).ok_or_else(|| EndpointError::BinaryNotFound {
            binary: self
                .binary
                .clone()
                .unwrap_or_else(|| PathBuf::from(locate::exe_name(locate::ARIA2_BINARY))),
        })
    }
}

impl Drop for Aria2Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Refuse to launch on a port we cannot bind ourselves.
fn check_bindable(port: u16) -> Result<(), EndpointError> {
    match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
        Ok(_listener) => Ok(()),
        Err(e) if FailureClass::from_io(&e) == FailureClass::SocketPermission => {
            Err(EndpointError::SocketPermission {
                port,
                detail: e.to_string(),
            })
        }
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => Err(EndpointError::PortBusy { port }),
        Err(e) => {
            tracing::debug!("Bind check on port {} failed ({}), launching anyway", port, e);
            Ok(())
        }
    }
}

/// Poll the new child until it answers, exits, or the wait runs out.
fn await_ready(client: &RpcClient, child: &mut SupervisedChild) -> Result<(), EndpointError> {
    let port = child.port();
    for _ in 0..LAUNCH_POLL_ATTEMPTS {
        if let Some(status) = child.exit_status() {
            return Err(exited(port, status, child.output()));
        }
        match probe(client) {
            Probe::Healthy(_) => return Ok(()),
            Probe::AuthRejected => return Err(EndpointError::AuthRejected { port }),
            _ => thread::sleep(LAUNCH_POLL_INTERVAL),
        }
    }

    if let Some(status) = child.exit_status() {
        return Err(exited(port, status, child.output()));
    }
    Err(EndpointError::LaunchTimeout {
        port,
        waited: LAUNCH_POLL_INTERVAL * LAUNCH_POLL_ATTEMPTS,
        output: child.output(),
    })
}

fn exited(port: u16, status: String, output: String) -> EndpointError {
    if FailureClass::from_diagnostic(&output) == FailureClass::SocketPermission {
        EndpointError::SocketPermission { port, detail: output }
    } else {
        EndpointError::ChildExited { port, status, output }
    }
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error taxonomy and diagnostic formatting for dlmgr.
//!
//! Backend failures are typed so the fallback chain can branch on the
//! *kind* of failure ([`FailureClass`]) instead of on message text. The
//! CLI renders them with [`format_error`], which adds possible causes and
//! suggested fixes.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Windows `WSAEACCES`: socket access forbidden by policy.
const WSAEACCES: i32 = 10013;

/// Coarse classification of a failure, used to pick the next fallback tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The OS refused socket access (firewall, sandbox, reserved range)
    SocketPermission,
    /// Server reachable but rejected the shared secret
    Unauthorized,
    /// Nothing answered
    Unreachable,
    /// Anything else
    Other,
}

impl FailureClass {
    /// Classify an OS error from one of our own socket calls. Process spawn
    /// errors never go through here: EACCES on exec is not a socket block.
    pub fn from_io(err: &io::Error) -> Self {
        if err.kind() == io::ErrorKind::PermissionDenied || err.raw_os_error() == Some(WSAEACCES) {
            return FailureClass::SocketPermission;
        }
        match err.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::TimedOut => FailureClass::Unreachable,
            _ => FailureClass::Other,
        }
    }

    /// Classify a reqwest error by walking its source chain for an `io::Error`.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(err);
        while let Some(cause) = source {
            if let Some(io_err) = cause.downcast_ref::<io::Error>() {
                let class = Self::from_io(io_err);
                if class != FailureClass::Other {
                    return class;
                }
            }
            source = cause.source();
        }

        if err.status().map(|s| s.as_u16()) == Some(401) {
            FailureClass::Unauthorized
        } else if err.is_connect() || err.is_timeout() {
            FailureClass::Unreachable
        } else {
            FailureClass::Other
        }
    }

    /// Classify text that only exists as a diagnostic: child process output
    /// or an `errorMessage` reported by aria2 itself.
    pub fn from_diagnostic(text: &str) -> Self {
        let lower = text.to_lowercase();
        if lower.contains("forbidden by its access permissions")
            || lower.contains("winerror 10013")
            || lower.contains("error 10013")
            || (lower.contains("bind") && lower.contains("permission denied"))
        {
            FailureClass::SocketPermission
        } else if lower.contains("unauthorized") {
            FailureClass::Unauthorized
        } else {
            FailureClass::Other
        }
    }
}

/// Failures while establishing the aria2 RPC endpoint.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("aria2 RPC on port {port} is reachable but rejected the secret; check rpc-secret")]
    AuthRejected { port: u16 },

    #[error("socket access on port {port} is blocked by OS permissions: {detail}")]
    SocketPermission { port: u16, detail: String },

    #[error("aria2 RPC failed to start on port {port} ({status}). Output: {output}")]
    ChildExited {
        port: u16,
        status: String,
        output: String,
    },

    #[error("aria2 RPC on port {port} did not become healthy within {waited:?}. Output: {output}")]
    LaunchTimeout {
        port: u16,
        waited: Duration,
        output: String,
    },

    #[error("port {port} is in use by something that does not speak aria2 RPC")]
    PortBusy { port: u16 },

    #[error("aria2 RPC server not reachable after trying ports {tried:?}{}", last_failure(.last))]
    NoReachableServer {
        tried: Vec<u16>,
        last: Option<Box<EndpointError>>,
    },

    #[error("aria2c binary not found at {binary:?}")]
    BinaryNotFound { binary: PathBuf },

    #[error("failed to spawn {binary:?}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn last_failure(last: &Option<Box<EndpointError>>) -> String {
    match last {
        Some(err) => format!("; last failure: {}", err),
        None => String::new(),
    }
}

impl EndpointError {
    /// Returns true when the failure should escalate to the standalone tier.
    pub fn is_socket_permission(&self) -> bool {
        match self {
            EndpointError::SocketPermission { .. } => true,
            EndpointError::NoReachableServer { last: Some(last), .. } => last.is_socket_permission(),
            _ => false,
        }
    }
}

/// Failures of a single JSON-RPC call.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("{method}: transport error: {source}")]
    Transport {
        method: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method}: HTTP {status}: {body}")]
    Http {
        method: String,
        status: u16,
        body: String,
    },

    #[error("{method}: aria2 error {code}: {message}")]
    Remote {
        method: String,
        code: i64,
        message: String,
    },

    #[error("{method}: malformed response: {detail}")]
    Decode { method: String, detail: String },
}

impl RpcError {
    pub fn class(&self) -> FailureClass {
        match self {
            RpcError::Transport { source, .. } => FailureClass::from_reqwest(source),
            RpcError::Http { status: 401, .. } => FailureClass::Unauthorized,
            RpcError::Http { body, .. } => FailureClass::from_diagnostic(body),
            RpcError::Remote { message, .. } => FailureClass::from_diagnostic(message),
            RpcError::Decode { .. } => FailureClass::Other,
        }
    }
}

/// Everything a backend `add`/`pause`/`resume`/`remove`/`status` can fail with.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("URL precheck failed for {url}: {reason}")]
    Precheck { url: String, reason: String },

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error("aria2 RPC call failed: {0}")]
    Rpc(#[from] RpcError),

    #[error("invalid download options: {0}")]
    Options(String),

    #[error("{binary:?} not found")]
    BinaryNotFound { binary: PathBuf },

    #[error("failed to start {binary:?}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot prepare download directory {dir:?}: {source}")]
    DownloadDir {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("direct download of {url} failed: {reason}")]
    DirectFetch { url: String, reason: String },

    #[error("failed to {action} process {pid}: {reason}")]
    Process {
        pid: u32,
        action: &'static str,
        reason: String,
    },

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

impl DownloadError {
    /// Failure class used by the fallback chain.
    pub fn class(&self) -> FailureClass {
        match self {
            DownloadError::Endpoint(e) if e.is_socket_permission() => FailureClass::SocketPermission,
            DownloadError::Endpoint(EndpointError::AuthRejected { .. }) => FailureClass::Unauthorized,
            DownloadError::Rpc(e) => e.class(),
            _ => FailureClass::Other,
        }
    }

    pub fn is_socket_permission(&self) -> bool {
        self.class() == FailureClass::SocketPermission
    }
}

/// Formats an error message with title, causes, and fixes.
///
/// # Example
///
/// ```
/// use dlmgr::error::format_error;
///
/// let error = format_error(
///     "aria2c not found",
///     &["aria2 is not installed", "aria2c is not on PATH"],
///     &["Install aria2: sudo apt install aria2", "Point dlmgr at it: dlmgr config set-aria2 --binary /path/to/aria2c"],
/// );
/// println!("{}", error);
/// ```
pub fn format_error(title: &str, causes: &[&str], fixes: &[&str]) -> String {
    let mut output = String::new();

    output.push_str(&format!("[✗] {}\n", title));

    if !causes.is_empty() {
        output.push_str("\nPossible causes:\n");
        for cause in causes {
            output.push_str(&format!("  - {}\n", cause));
        }
    }

    if !fixes.is_empty() {
        output.push_str("\nTry these fixes:\n");
        for (i, fix) in fixes.iter().enumerate() {
            output.push_str(&format!("  {}. {}\n", i + 1, fix));
        }
    }

    output
}

/// Builder for constructing formatted error messages.
#[derive(Debug, Clone)]
pub struct ErrorBuilder {
    title: String,
    causes: Vec<String>,
    fixes: Vec<String>,
}

impl ErrorBuilder {
    /// Create a new error builder with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            causes: Vec::new(),
            fixes: Vec::new(),
        }
    }

    /// Add a possible cause.
    pub fn cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    /// Add a suggested fix.
    pub fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fixes.push(fix.into());
        self
    }

    /// Build the formatted error message.
    pub fn build(self) -> String {
        let causes: Vec<&str> = self.causes.iter().map(|s| s.as_str()).collect();
        let fixes: Vec<&str> = self.fixes.iter().map(|s| s.as_str()).collect();
        format_error(&self.title, &causes, &fixes)
    }
}

impl fmt::Display for ErrorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.clone().build())
    }
}

/// Build a diagnostic for a backend failure, with hints chosen by failure kind.
pub fn explain(err: &DownloadError) -> ErrorBuilder {
    let builder = ErrorBuilder::new(err.to_string());
    match err {
        DownloadError::Precheck { .. } => builder
            .cause("The URL is mistyped or the file was removed")
            .cause("The server is down or blocks automated requests")
            .fix("Open the URL in a browser to confirm it exists"),
        DownloadError::Endpoint(EndpointError::BinaryNotFound { .. })
        | DownloadError::BinaryNotFound { .. } => builder
            .cause("The download tool is not installed or not on PATH")
            .fix("Install aria2 (aria2c) or MEGAcmd (mega-get)")
            .fix("Or set the path: dlmgr config set-aria2 --binary /path/to/aria2c"),
        DownloadError::Endpoint(EndpointError::AuthRejected { .. }) => builder
            .cause("Another aria2 RPC server is running with a different secret")
            .fix("Set the matching secret: dlmgr config set-aria2 --secret <secret>"),
        DownloadError::Endpoint(_) => builder
            .cause("aria2c could not open its RPC port")
            .cause("A firewall or sandbox blocks local sockets")
            .fix("Pick another port: dlmgr config set-aria2 --port 6801")
            .fix("Enable the direct fallback: ARIA2_DIRECT_FALLBACK=1"),
        _ => builder,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_error() {
        let error = format_error("Test Error", &["Cause 1", "Cause 2"], &["Fix 1", "Fix 2"]);

        assert!(error.contains("[✗] Test Error"));
        assert!(error.contains("Possible causes:"));
        assert!(error.contains("  - Cause 1"));
        assert!(error.contains("Try these fixes:"));
        assert!(error.contains("  2. Fix 2"));
    }

    #[test]
    fn test_empty_causes_and_fixes() {
        let error = format_error("Empty test", &[], &[]);
        assert!(error.contains("[✗] Empty test"));
        assert!(!error.contains("Possible causes:"));
        assert!(!error.contains("Try these fixes:"));
    }

    #[test]
    fn test_io_permission_is_socket_permission() {
        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(FailureClass::from_io(&err), FailureClass::SocketPermission);

        let wsa = io::Error::from_raw_os_error(WSAEACCES);
        assert_eq!(FailureClass::from_io(&wsa), FailureClass::SocketPermission);

        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(FailureClass::from_io(&refused), FailureClass::Unreachable);
    }

    #[test]
    fn test_spawn_permission_denied_is_not_socket_permission() {
        let spawn = DownloadError::Spawn {
            binary: PathBuf::from("/opt/aria2c"),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        assert_eq!(spawn.class(), FailureClass::Other);
        assert!(!spawn.is_socket_permission());

        let launch = DownloadError::from(EndpointError::Spawn {
            binary: PathBuf::from("/opt/aria2c"),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        });
        assert!(!launch.is_socket_permission());
    }

    #[test]
    fn test_diagnostic_classification() {
        let windows = "Exception: [SocketCore.cc:312] errorCode=1 Failed to bind a socket, cause: \
                       An attempt was made to access a socket in a way forbidden by its access permissions.";
        assert_eq!(FailureClass::from_diagnostic(windows), FailureClass::SocketPermission);
        assert_eq!(
            FailureClass::from_diagnostic("bind: Permission denied"),
            FailureClass::SocketPermission
        );
        assert_eq!(FailureClass::from_diagnostic("Unauthorized"), FailureClass::Unauthorized);
        assert_eq!(FailureClass::from_diagnostic("No URI to download"), FailureClass::Other);
    }

    #[test]
    fn test_no_reachable_server_carries_last_failure() {
        let err = EndpointError::NoReachableServer {
            tried: vec![6800, 6880],
            last: Some(Box::new(EndpointError::ChildExited {
                port: 6880,
                status: "exit status: 1".to_string(),
                output: "port busy".to_string(),
            })),
        };
        let msg = err.to_string();
        assert!(msg.contains("[6800, 6880]"));
        assert!(msg.contains("last failure"));
        assert!(msg.contains("port busy"));
        assert!(!err.is_socket_permission());
    }

    #[test]
    fn test_permission_class_propagates_through_wrappers() {
        let inner = EndpointError::SocketPermission {
            port: 6800,
            detail: "forbidden".to_string(),
        };
        let err = DownloadError::from(inner);
        assert!(err.is_socket_permission());

        let rpc = DownloadError::from(RpcError::Remote {
            method: "aria2.addUri".to_string(),
            code: 1,
            message: "Unauthorized".to_string(),
        });
        assert_eq!(rpc.class(), FailureClass::Unauthorized);
    }
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Job record types persisted in the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;

/// Sentinel stored as `rpc_handle` when a job was fetched directly and
/// cannot be polled any further.
pub const DIRECT_DOWNLOAD_HANDLE: &str = "direct-download";

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Record written, backend not yet reached
    Queued,
    /// Handed to a backend
    Started,
    /// Suspended by the user
    Paused,
    /// Finished
    Completed,
    /// Backend refused or failed the job
    Error,
}

impl JobStatus {
    /// Returns true once the job can no longer change on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Started => "started",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One user-requested download.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    /// Unique identifier, stable for the job's lifetime
    pub id: String,
    /// URL exactly as requested
    pub url: String,
    /// Backend that owns the job
    pub backend: BackendKind,
    /// Current status
    pub status: JobStatus,
    /// OS process id for directly spawned downloads
    #[serde(default, alias = "pid")]
    pub process_handle: Option<u32>,
    /// aria2 GID, or [`DIRECT_DOWNLOAD_HANDLE`]
    #[serde(default, alias = "gid")]
    pub rpc_handle: Option<String>,
    /// Why the job entered `error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the job was created
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// When the status was last updated
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Create a queued record with no handle yet.
    pub fn queued(id: impl Into<String>, url: impl Into<String>, backend: BackendKind) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            url: url.into(),
            backend,
            status: JobStatus::Queued,
            process_handle: None,
            rpc_handle: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the status and timestamp.
    pub fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Move to `error`, keeping the reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.error = Some(reason.into());
        self.set_status(JobStatus::Error);
    }

    /// GID usable for RPC calls (the direct-download sentinel is not one).
    pub fn live_rpc_handle(&self) -> Option<&str> {
        self.rpc_handle
            .as_deref()
            .filter(|gid| *gid != DIRECT_DOWNLOAD_HANDLE)
    }

    /// Render the uniform one-line status used by `status` and `list`.
    pub fn status_line(&self) -> String {
        let gid_part = self
            .rpc_handle
            .as_ref()
            .map(|gid| format!(" GID={}", gid))
            .unwrap_or_default();
        let pid_part = self
            .process_handle
            .map(|pid| format!(" PID={}", pid))
            .unwrap_or_default();
        format!(
            "{}: {} [{}] {}{}{}",
            self.id, self.url, self.backend, self.status, gid_part, pid_part
        )
    }
}

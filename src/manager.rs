// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Job manager: owns the store and both backends, and drives each job
//! through its lifecycle.
//!
//! ```text
//!            add
//!             │
//!             ▼
//!          queued ──backend error──► error
//!             │
//!   GID / PID │            direct fetch
//!             ▼                 │
//!          started ◄──resume──┐ ▼
//!             │   └──pause──► paused        completed
//!             │                              ▲
//!             └──process gone / aria2 done───┘
//! ```
//!
//! Every mutation is a read-modify-write transaction on the store, so two
//! dlmgr invocations never lose each other's updates.

use anyhow::{anyhow, bail, Context, Result};

use crate::backend::{
    self, AddRequest, Aria2Backend, Backend, BackendKind, Handle, MegaBackend, Tier,
};
use crate::config::Config;
use crate::error::DownloadError;
use crate::process;
use crate::progress::ProgressReport;
use crate::store::{JobRecord, JobStatus, JobStore, DIRECT_DOWNLOAD_HANDLE};
use crate::utils;

/// What `add` produced.
#[derive(Debug)]
pub struct AddOutcome {
    /// The persisted record after the backend call
    pub job: JobRecord,
    /// Tier that carried the download, when it started
    pub tier: Option<Tier>,
    /// Why the job ended in `error`
    pub error: Option<DownloadError>,
}

pub struct JobManager {
    store: JobStore,
    aria2: Aria2Backend,
    mega: MegaBackend,
}

impl JobManager {
    pub fn new(store: JobStore, aria2: Aria2Backend, mega: MegaBackend) -> Self {
        Self { store, aria2, mega }
    }

    /// Manager over the default store, with backends built from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            JobStore::open_default(),
            Aria2Backend::new(config.aria2_config()),
            MegaBackend::new(config.mega_config()),
        )
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    fn backend_mut(&mut self, kind: BackendKind) -> &mut dyn Backend {
        match kind {
            BackendKind::Aria2 => &mut self.aria2,
            BackendKind::Mega => &mut self.mega,
        }
    }

    fn find(&self, id: &str) -> Result<JobRecord> {
        self.store
            .load()?
            .find(id)
            .cloned()
            .ok_or_else(|| anyhow!("No job with id {}", id))
    }

    /// Queue a download and hand it to its backend.
    ///
    /// The record is persisted as `queued` before the backend runs and
    /// updated afterwards. A backend failure is recorded on the job, not
    /// returned as `Err`.
    pub fn add(&mut self, request: AddRequest, backend_override: Option<&str>) -> Result<AddOutcome> {
        let kind = backend::select(&request.url, backend_override);
        let id = utils::uuid_v4();
        let mut job = JobRecord::queued(&id, &request.url, kind);

        let queued = job.clone();
        self.store
            .transaction(move |data| data.insert(queued))??;
        tracing::info!("Queued {} ({}) for {}", id, request.url, kind);

        let result = self.backend_mut(kind).add(&request);

        let (tier, error) = match result {
            Ok(submission) => {
                match submission.handle {
                    Handle::Rpc(gid) => {
                        job.rpc_handle = Some(gid);
                        job.set_status(JobStatus::Started);
                    }
                    Handle::Process(pid) => {
                        job.process_handle = Some(pid);
                        job.set_status(JobStatus::Started);
                    }
                    Handle::DirectComplete => {
                        job.rpc_handle = Some(DIRECT_DOWNLOAD_HANDLE.to_string());
                        job.set_status(JobStatus::Completed);
                    }
                }
                tracing::info!("Job {} started via {}", id, submission.tier);
                (Some(submission.tier), None)
            }
            Err(e) => {
                tracing::warn!("Failed to start download {}: {}", id, e);
                job.fail(e.to_string());
                (None, Some(e))
            }
        };

        let updated = job.clone();
        let still_queued = self.store.transaction(move |data| data.replace(updated))?;
        if !still_queued {
            tracing::warn!("Job {} was removed while starting; not re-adding it", id);
        }

        Ok(AddOutcome { job, tier, error })
    }

    /// Suspend a job. The record changes only if the suspend succeeded.
    pub fn pause(&mut self, id: &str) -> Result<JobRecord> {
        let job = self.find(id)?;
        if job.status.is_terminal() {
            bail!("Job {} is already {}", id, job.status);
        }

        let outcome = if let Some(pid) = job.process_handle {
            process::suspend(pid)
        } else if let Some(gid) = job.live_rpc_handle() {
            self.backend_mut(job.backend).pause(gid)
        } else {
            bail!("Job {} has no process or RPC handle to pause", id);
        };

        if let Err(e) = outcome {
            tracing::warn!("Failed to pause download {}: {}", id, e);
            return Err(anyhow::Error::new(e).context(format!("Failed to pause job {}", id)));
        }

        tracing::info!("Paused download {}", id);
        self.set_status(id, JobStatus::Paused)
    }

    /// Continue a paused job. The record changes only on success.
    pub fn resume(&mut self, id: &str) -> Result<JobRecord> {
        let job = self.find(id)?;
        if job.status.is_terminal() {
            bail!("Job {} is already {}", id, job.status);
        }

        let outcome = if let Some(pid) = job.process_handle {
            process::resume(pid)
        } else if let Some(gid) = job.live_rpc_handle() {
            self.backend_mut(job.backend).resume(gid)
        } else {
            bail!("Job {} has no process or RPC handle to resume", id);
        };

        if let Err(e) = outcome {
            tracing::warn!("Failed to resume download {}: {}", id, e);
            return Err(anyhow::Error::new(e).context(format!("Failed to resume job {}", id)));
        }

        tracing::info!("Resumed download {}", id);
        self.set_status(id, JobStatus::Started)
    }

    /// Stop a job (best effort) and drop it from the queue.
    ///
    /// Returns the removed record, or `None` if no queued job had that id.
    pub fn remove(&mut self, id: &str) -> Result<Option<JobRecord>> {
        let job = match self.store.load()?.find(id).cloned() {
            Some(job) => job,
            None => return Ok(None),
        };

        if !job.status.is_terminal() {
            if let Some(pid) = job.process_handle {
                match process::terminate(pid) {
                    Ok(()) => tracing::info!("Terminated download {} (PID: {})", id, pid),
                    Err(e) => tracing::warn!("Failed to terminate download {}: {}", id, e),
                }
            }
            if let Some(gid) = job.live_rpc_handle() {
                if let Err(e) = self.backend_mut(job.backend).remove(gid) {
                    tracing::warn!("Failed to cancel {} on the RPC server: {}", gid, e);
                }
            }
        }

        let id_owned = id.to_string();
        let removed = self.store.transaction(move |data| data.remove(&id_owned))?;
        Ok(removed.or(Some(job)))
    }

    /// Queued records, optionally narrowed to one id.
    pub fn jobs(&self, id: Option<&str>) -> Result<Vec<JobRecord>> {
        let data = self.store.load()?;
        Ok(data
            .queue
            .into_iter()
            .filter(|job| id.map_or(true, |id| job.id == id))
            .collect())
    }

    /// One status line per matching job; empty when nothing matches.
    pub fn status(&self, id: Option<&str>) -> Result<Vec<String>> {
        Ok(self.jobs(id)?.iter().map(JobRecord::status_line).collect())
    }

    /// Reconcile stored state with reality. Returns the records that changed.
    ///
    /// Started jobs whose process is gone become `completed`. RPC jobs take
    /// the state aria2 reports, when a server is already running.
    pub fn refresh(&mut self) -> Result<Vec<JobRecord>> {
        let snapshot = self.store.load()?;
        let mut updates: Vec<(String, JobStatus, JobStatus, Option<String>)> = Vec::new();
        let mut rpc_reachable = true;

        for job in &snapshot.queue {
            if job.status.is_terminal() || job.status == JobStatus::Queued {
                continue;
            }

            if let Some(pid) = job.process_handle {
                if job.status != JobStatus::Started {
                    continue;
                }
                let alive = self
                    .backend_mut(job.backend)
                    .owned_process_alive(pid)
                    .unwrap_or_else(|| process::is_alive(pid));
                if !alive {
                    tracing::info!("Process {} for job {} has exited", pid, job.id);
                    updates.push((job.id.clone(), job.status, JobStatus::Completed, None));
                }
                continue;
            }

            let Some(gid) = job.live_rpc_handle() else {
                continue;
            };
            if !rpc_reachable || job.backend != BackendKind::Aria2 {
                continue;
            }

            match self.aria2.get_status(gid) {
                Ok(report) => {
                    let next = match report.status.as_str() {
                        "complete" => Some(JobStatus::Completed),
                        "error" => Some(JobStatus::Error),
                        "paused" => Some(JobStatus::Paused),
                        "active" | "waiting" => Some(JobStatus::Started),
                        _ => None,
                    };
                    if let Some(next) = next.filter(|next| *next != job.status) {
                        let reason = (next == JobStatus::Error).then(|| {
                            report
                                .error_message
                                .clone()
                                .unwrap_or_else(|| "aria2 reported an error".to_string())
                        });
                        updates.push((job.id.clone(), job.status, next, reason));
                    }
                }
                Err(DownloadError::Endpoint(e)) => {
                    tracing::debug!("No aria2 RPC server to reconcile against: {}", e);
                    rpc_reachable = false;
                }
                Err(e) => tracing::debug!("Cannot reconcile {}: {}", gid, e),
            }
        }

        if updates.is_empty() {
            return Ok(Vec::new());
        }

        self.store.transaction(move |data| {
            let mut changed = Vec::new();
            for (id, seen, next, reason) in updates {
                let Some(job) = data.find_mut(&id) else {
                    continue;
                };
                // Someone else moved it since the snapshot
                if job.status != seen {
                    continue;
                }
                match reason {
                    Some(reason) => job.fail(reason),
                    None => job.set_status(next),
                }
                changed.push(job.clone());
            }
            changed
        })
    }

    /// Progress of an aria2 download by GID.
    pub fn progress(&mut self, gid: &str) -> Result<ProgressReport, DownloadError> {
        self.aria2.get_status(gid)
    }

    /// Downloads the aria2 server reports as active.
    pub fn active(&mut self) -> Result<Vec<ProgressReport>, DownloadError> {
        self.aria2.list_active()
    }

    /// Release backend supervision state.
    pub fn shutdown(&mut self) {
        self.aria2.shutdown();
        self.mega.shutdown();
    }

    fn set_status(&self, id: &str, status: JobStatus) -> Result<JobRecord> {
        let id_owned = id.to_string();
        self.store
            .transaction(move |data| {
                data.find_mut(&id_owned).map(|job| {
                    job.set_status(status);
                    job.clone()
                })
            })?
            .with_context(|| format!("Job {} disappeared from the store", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Aria2Config, MegaConfig};
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> JobManager {
        let store = JobStore::at(dir.path().join("queue.json"));
        let aria2 = Aria2Backend::new(Aria2Config {
            download_dir: dir.path().join("downloads"),
            alternate_ports: Vec::new(),
            keep_server_alive: false,
            ..Default::default()
        });
        let mega = MegaBackend::new(MegaConfig {
            download_dir: dir.path().join("downloads"),
            ..Default::default()
        });
        JobManager::new(store, aria2, mega)
    }

    #[test]
    fn test_status_empty_store() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        assert!(mgr.status(None).unwrap().is_empty());
        assert!(mgr.status(Some("nope")).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_options_record_error() {
        let dir = TempDir::new().unwrap();
        let mut mgr = manager(&dir);

        let mut request = AddRequest::new("magnet:?xt=urn:btih:abc");
        request.transfer.max_connection_per_server = Some(99);
        let outcome = mgr.add(request, None).unwrap();

        assert_eq!(outcome.job.status, JobStatus::Error);
        assert!(outcome.job.error.as_deref().unwrap().contains("max connections"));
        assert!(outcome.job.process_handle.is_none());
        assert!(outcome.job.rpc_handle.is_none());

        let stored = mgr.jobs(None).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, JobStatus::Error);
    }

    #[test]
    fn test_remove_unknown_is_none() {
        let dir = TempDir::new().unwrap();
        let mut mgr = manager(&dir);
        assert!(mgr.remove("missing").unwrap().is_none());
    }

    #[test]
    fn test_pause_without_handle_leaves_record() {
        let dir = TempDir::new().unwrap();
        let mut mgr = manager(&dir);
        let job = JobRecord::queued("j1", "magnet:?xt=urn:btih:abc", BackendKind::Aria2);
        mgr.store().transaction(|data| data.insert(job)).unwrap().unwrap();

        assert!(mgr.pause("j1").is_err());
        assert_eq!(mgr.jobs(Some("j1")).unwrap()[0].status, JobStatus::Queued);
    }

    #[test]
    fn test_pause_terminal_job_rejected() {
        let dir = TempDir::new().unwrap();
        let mut mgr = manager(&dir);
        let mut job = JobRecord::queued("done", "https://example.com/a", BackendKind::Aria2);
        job.rpc_handle = Some(DIRECT_DOWNLOAD_HANDLE.to_string());
        job.set_status(JobStatus::Completed);
        mgr.store().transaction(|data| data.insert(job)).unwrap().unwrap();

        let err = mgr.pause("done").unwrap_err();
        assert!(err.to_string().contains("already completed"));
    }

    #[test]
    fn test_refresh_marks_dead_process_completed() {
        let dir = TempDir::new().unwrap();
        let mut mgr = manager(&dir);

        let mut child = std::process::Command::new(if cfg!(windows) { "cmd" } else { "true" })
            .args(if cfg!(windows) { vec!["/C", "exit"] } else { vec![] })
            .spawn()
            .unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let mut job = JobRecord::queued("m1", "mega://folder/xyz", BackendKind::Mega);
        job.process_handle = Some(pid);
        job.set_status(JobStatus::Started);
        mgr.store().transaction(|data| data.insert(job)).unwrap().unwrap();

        let changed = mgr.refresh().unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].status, JobStatus::Completed);
        assert_eq!(mgr.jobs(Some("m1")).unwrap()[0].status, JobStatus::Completed);
    }
}

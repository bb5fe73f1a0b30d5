// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent queue/history store.
//!
//! The whole file is read and written on every mutation. Writers hold an
//! exclusive lock on a sibling `.lock` file for the full read-modify-write,
//! so two invocations against the same store cannot lose each other's
//! updates.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use super::types::JobRecord;

/// Default timeout for acquiring file locks (5 seconds)
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// In-memory image of the store file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoreData {
    /// Active jobs, in creation order
    #[serde(default)]
    pub queue: Vec<JobRecord>,
    /// Archived jobs
    #[serde(default)]
    pub history: Vec<JobRecord>,
}

impl StoreData {
    /// Returns true if `id` exists in either sequence.
    pub fn contains(&self, id: &str) -> bool {
        self.queue.iter().chain(self.history.iter()).any(|j| j.id == id)
    }

    /// Append a job to the queue. IDs are unique across queue and history.
    pub fn insert(&mut self, job: JobRecord) -> Result<()> {
        if self.contains(&job.id) {
            bail!("Job {} already exists in the store", job.id);
        }
        self.queue.push(job);
        Ok(())
    }

    /// Get a queued job by ID.
    pub fn find(&self, id: &str) -> Option<&JobRecord> {
        self.queue.iter().find(|j| j.id == id)
    }

    /// Get a mutable queued job by ID.
    pub fn find_mut(&mut self, id: &str) -> Option<&mut JobRecord> {
        self.queue.iter_mut().find(|j| j.id == id)
    }

    /// Replace the queued record with the same ID. Returns false if it is gone.
    pub fn replace(&mut self, job: JobRecord) -> bool {
        match self.find_mut(&job.id) {
            Some(slot) => {
                *slot = job;
                true
            }
            None => false,
        }
    }

    /// Drop a job from the queue without archiving it.
    pub fn remove(&mut self, id: &str) -> Option<JobRecord> {
        let pos = self.queue.iter().position(|j| j.id == id)?;
        Some(self.queue.remove(pos))
    }
}

/// File-backed store with locking and atomic writes.
#[derive(Debug, Clone)]
pub struct JobStore {
    path: PathBuf,
    lock_timeout: Duration,
}

impl JobStore {
    /// Store at the default location (`~/.dlmgr/queue.json`).
    pub fn open_default() -> Self {
        Self::at(Self::default_path())
    }

    /// Store at an explicit path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    /// Override how long to wait for the lock.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Get the default store file path.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".dlmgr").join("queue.json"))
            .unwrap_or_else(|| PathBuf::from(".dlmgr/queue.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Uses a separate .lock file so the lock survives the atomic rename.
    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    /// Acquire an exclusive lock with timeout.
    ///
    /// Returns the locked file handle on success, or an error if the timeout expires.
    fn acquire_exclusive_lock_with_timeout(path: &Path, timeout: Duration) -> Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory for lock file: {:?}", parent))?;
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {:?}", path))?;

        let start = Instant::now();

        loop {
            match FileExt::try_lock_exclusive(&lock_file) {
                Ok(()) => return Ok(lock_file),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        bail!(
                            "Timed out waiting for exclusive lock on {:?} after {:?}. \
                             Another dlmgr instance may be writing to the store.",
                            path,
                            timeout
                        );
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to acquire exclusive lock on {:?}", path)
                    });
                }
            }
        }
    }

    /// Acquire a shared lock with timeout.
    fn acquire_shared_lock_with_timeout(file: &File, timeout: Duration) -> Result<()> {
        let start = Instant::now();

        loop {
            match FileExt::try_lock_shared(file) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        bail!(
                            "Timed out waiting for shared lock after {:?}. \
                             Another dlmgr instance may be writing to the store.",
                            timeout
                        );
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(e).with_context(|| "Failed to acquire shared lock on store file");
                }
            }
        }
    }

    /// Load the store under a shared lock.
    ///
    /// A missing file yields an empty store. A malformed file is moved
    /// aside and also yields an empty store.
    pub fn load(&self) -> Result<StoreData> {
        if !self.path.exists() {
            return Ok(StoreData::default());
        }

        let lock_path = self.lock_path();
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file: {:?}", lock_path))?;

        Self::acquire_shared_lock_with_timeout(&lock_file, self.lock_timeout)?;
        self.read_unlocked()
    }

    /// Write the whole store under an exclusive lock.
    pub fn save(&self, data: &StoreData) -> Result<()> {
        let _lock_guard =
            Self::acquire_exclusive_lock_with_timeout(&self.lock_path(), self.lock_timeout)?;
        self.write_unlocked(data)
    }

    /// Read-modify-write under one exclusive lock.
    ///
    /// The closure sees the current file contents; whatever it leaves in
    /// `StoreData` is written back, even when it returns an error value.
    pub fn transaction<T>(&self, f: impl FnOnce(&mut StoreData) -> T) -> Result<T> {
        let _lock_guard =
            Self::acquire_exclusive_lock_with_timeout(&self.lock_path(), self.lock_timeout)?;
        let mut data = self.read_unlocked()?;
        let out = f(&mut data);
        self.write_unlocked(&data)?;
        Ok(out)
    }

    fn read_unlocked(&self) -> Result<StoreData> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StoreData::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read store file: {:?}", self.path))
            }
        };

        if content.trim().is_empty() {
            return Ok(StoreData::default());
        }

        match serde_json::from_str::<StoreData>(&content) {
            Ok(data) => Ok(data),
            Err(e) => {
                let aside = self.path.with_extension("corrupt");
                tracing::warn!(
                    "Store file {:?} is malformed ({}); moving it to {:?} and starting empty",
                    self.path,
                    e,
                    aside
                );
                if let Err(e) = fs::rename(&self.path, &aside) {
                    tracing::warn!("Failed to move malformed store aside: {}", e);
                }
                Ok(StoreData::default())
            }
        }
    }

    /// Temp file + fsync + atomic rename. Caller holds the exclusive lock.
    fn write_unlocked(&self, data: &StoreData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let temp_path = self.path.with_extension("tmp");
        let content =
            serde_json::to_string_pretty(data).with_context(|| "Failed to serialize store to JSON")?;

        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;

            temp_file
                .write_all(content.as_bytes())
                .with_context(|| "Failed to write to temp file")?;

            temp_file
                .sync_all()
                .with_context(|| "Failed to sync temp file to disk")?;
        }

        // Atomic on POSIX, best-effort on Windows
        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename temp file to store file: {:?} -> {:?}",
                temp_path, self.path
            )
        })?;

        Ok(())
    }
}

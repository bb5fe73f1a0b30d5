// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable job store for dlmgr
//!
//! One JSON file holds two ordered sequences:
//!
//! ```text
//! {
//!   "queue":   [ JobRecord, ... ],   active jobs
//!   "history": [ JobRecord, ... ]    archived jobs
//! }
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use dlmgr::store::{JobStore, JobRecord};
//! use dlmgr::backend::BackendKind;
//!
//! # fn example() -> anyhow::Result<()> {
//! let store = JobStore::open_default();
//! store.transaction(|data| {
//!     data.insert(JobRecord::queued("id-1", "magnet:?xt=urn:btih:abc", BackendKind::Aria2))
//! })??;
//! # Ok(())
//! # }
//! ```

pub mod types;
pub mod state;

pub use types::{JobRecord, JobStatus, DIRECT_DOWNLOAD_HANDLE};
pub use state::{JobStore, StoreData};

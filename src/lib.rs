// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! dlmgr - local download orchestration library
//!
//! aria2 first, direct fetch when nothing else works.
//!
//! dlmgr routes each URL to a download engine, keeps the aria2 JSON-RPC
//! server alive, falls back through simpler strategies when sockets are
//! blocked, and tracks every job in a persisted store:
//!
//! **aria2 RPC** -> **standalone aria2c** -> **direct fetch**
//!
//! # Core Modules
//!
//! - [`backend`] - Backend selection, aria2 supervision, MEGAcmd
//! - [`manager`] - Job lifecycle and OS-level pause/resume/kill
//! - [`store`] - Durable queue/history with locked transactions
//! - [`progress`] - Progress snapshots for RPC downloads
//! - [`config`] - `~/.dlmgr/config.json`
//! - [`error`] - Error taxonomy and diagnostic formatting

pub mod backend;
pub mod config;
pub mod error;
pub mod manager;
pub mod process;
pub mod progress;
pub mod store;
pub mod utils;

pub use backend::{select, AddRequest, Backend, BackendKind, Handle, Submission, Tier};
pub use config::Config;
pub use error::{DownloadError, EndpointError, FailureClass, RpcError};
pub use manager::{AddOutcome, JobManager};
pub use progress::ProgressReport;
pub use store::{JobRecord, JobStatus, JobStore};

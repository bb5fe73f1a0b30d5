//! Integration tests for the job lifecycle
//!
//! Drives `JobManager` end to end: add, pause, resume, refresh and remove,
//! against a mocked aria2 RPC server and a fake `mega-get`.
//!
//! Run with: cargo test --test job_lifecycle

use dlmgr::backend::{Aria2Backend, Aria2Config, MegaBackend, MegaConfig};
use dlmgr::store::DIRECT_DOWNLOAD_HANDLE;
use dlmgr::{AddRequest, BackendKind, JobManager, JobStatus, JobStore, Tier};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const GID: &str = "2089b05ecca3d829";

fn manager(dir: &TempDir, rpc_port: u16, mega_binary: Option<std::path::PathBuf>) -> JobManager {
    manager_with(dir, rpc_port, mega_binary, false)
}

fn manager_with(
    dir: &TempDir,
    rpc_port: u16,
    mega_binary: Option<std::path::PathBuf>,
    direct_fallback: bool,
) -> JobManager {
    let downloads = dir.path().join("downloads");
    let aria2 = Aria2Backend::new(Aria2Config {
        rpc_host: "127.0.0.1".to_string(),
        rpc_port,
        alternate_ports: Vec::new(),
        keep_server_alive: false,
        download_dir: downloads.clone(),
        binary: Some(dir.path().join("no-such-aria2c")),
        direct_fallback,
        ..Default::default()
    });
    let mega = MegaBackend::new(MegaConfig {
        binary: mega_binary,
        download_dir: downloads,
        ..Default::default()
    });
    JobManager::new(JobStore::at(dir.path().join("queue.json")), aria2, mega)
}

fn rpc_result(result: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "jsonrpc": "2.0",
        "id": "dlmgr-1",
        "result": result,
    }))
}

async fn mount_rpc(server: &MockServer, rpc_method: &str, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/jsonrpc"))
        .and(body_partial_json(json!({ "method": rpc_method })))
        .respond_with(response)
        .mount(server)
        .await;
}

// =============================================================================
// aria2 RPC Job Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_rpc_job_full_lifecycle() {
    let server = MockServer::start().await;
    mount_rpc(&server, "aria2.getVersion", rpc_result(json!({ "version": "1.37.0" }))).await;
    mount_rpc(&server, "aria2.addUri", rpc_result(json!(GID))).await;
    mount_rpc(&server, "aria2.pause", rpc_result(json!(GID))).await;
    mount_rpc(&server, "aria2.unpause", rpc_result(json!(GID))).await;
    // Active right after submission, complete on every later poll
    Mock::given(method("POST"))
        .and(path("/jsonrpc"))
        .and(body_partial_json(json!({ "method": "aria2.tellStatus" })))
        .respond_with(rpc_result(json!({ "gid": GID, "status": "active" })))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_rpc(
        &server,
        "aria2.tellStatus",
        rpc_result(json!({
            "gid": GID,
            "status": "complete",
            "totalLength": "10",
            "completedLength": "10",
        })),
    )
    .await;

    let dir = TempDir::new().unwrap();
    let port = server.address().port();

    tokio::task::spawn_blocking(move || {
        let mut mgr = manager(&dir, port, None);

        let outcome = mgr
            .add(AddRequest::new("magnet:?xt=urn:btih:abc"), None)
            .unwrap();
        assert!(outcome.error.is_none());
        assert_eq!(outcome.tier, Some(Tier::Rpc));
        let job = outcome.job;
        assert_eq!(job.status, JobStatus::Started);
        assert_eq!(job.backend, BackendKind::Aria2);
        assert_eq!(job.rpc_handle.as_deref(), Some(GID));
        assert_eq!(job.process_handle, None);

        let paused = mgr.pause(&job.id).unwrap();
        assert_eq!(paused.status, JobStatus::Paused);
        let resumed = mgr.resume(&job.id).unwrap();
        assert_eq!(resumed.status, JobStatus::Started);

        let changed = mgr.refresh().unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].status, JobStatus::Completed);

        let lines = mgr.status(Some(&job.id)).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("completed"));
        assert!(lines[0].contains(GID));

        let removed = mgr.remove(&job.id).unwrap().unwrap();
        assert_eq!(removed.id, job.id);
        assert!(mgr.jobs(None).unwrap().is_empty());
        assert!(mgr.remove(&job.id).unwrap().is_none());
        mgr.shutdown();
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_direct_fetch_job_recorded_completed() {
    let server = MockServer::start().await;
    mount_rpc(&server, "aria2.getVersion", rpc_result(json!({ "version": "1.37.0" }))).await;
    mount_rpc(
        &server,
        "aria2.addUri",
        ResponseTemplate::new(400).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": "dlmgr-1",
            "error": { "code": 1, "message": "No URI to download." },
        })),
    )
    .await;
    Mock::given(method("HEAD"))
        .and(path("/files/report.pdf"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/report.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF".to_vec()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let port = server.address().port();
    let url = format!("{}/files/report.pdf", server.uri());

    tokio::task::spawn_blocking(move || {
        let mut mgr = manager_with(&dir, port, None, true);

        let outcome = mgr.add(AddRequest::new(url), None).unwrap();
        assert!(outcome.error.is_none(), "{:?}", outcome.error);
        assert_eq!(outcome.tier, Some(Tier::Direct));
        let job = outcome.job;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.rpc_handle.as_deref(), Some(DIRECT_DOWNLOAD_HANDLE));
        assert_eq!(job.process_handle, None);
        assert!(dir.path().join("downloads").join("report.pdf").exists());

        let stored = mgr.jobs(Some(&job.id)).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, JobStatus::Completed);
        assert_eq!(stored[0].rpc_handle.as_deref(), Some("direct-download"));

        // Already finished: nothing to refresh, and no pause or resume
        assert!(mgr.refresh().unwrap().is_empty());
        assert!(mgr.pause(&job.id).is_err());
        assert!(mgr.resume(&job.id).is_err());
        assert_eq!(mgr.jobs(Some(&job.id)).unwrap()[0].status, JobStatus::Completed);
        mgr.shutdown();
    })
    .await
    .unwrap();
}

// =============================================================================
// MEGA Process Job Tests
// =============================================================================

#[cfg(unix)]
mod mega {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::time::Duration;

    static SCRIPT_LOCK: Mutex<()> = Mutex::new(());

    fn fake_mega_get(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("mega-get");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_process_job_pause_resume_remove() {
        let _guard = SCRIPT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = TempDir::new().unwrap();
        let script = fake_mega_get(dir.path(), "exec sleep 30");
        let mut mgr = manager(&dir, 1, Some(script));

        let outcome = mgr
            .add(AddRequest::new("https://mega.nz/file/abc#key"), None)
            .unwrap();
        assert!(outcome.error.is_none(), "{:?}", outcome.error);
        assert_eq!(outcome.tier, Some(Tier::Process));
        let job = outcome.job;
        assert_eq!(job.backend, BackendKind::Mega);
        assert_eq!(job.status, JobStatus::Started);
        assert_eq!(job.rpc_handle, None);
        let pid = job.process_handle.unwrap();
        assert!(dlmgr::process::is_alive(pid));

        assert_eq!(mgr.pause(&job.id).unwrap().status, JobStatus::Paused);
        // Paused processes are left alone by refresh
        assert!(mgr.refresh().unwrap().is_empty());
        assert_eq!(mgr.resume(&job.id).unwrap().status, JobStatus::Started);

        let removed = mgr.remove(&job.id).unwrap().unwrap();
        assert_eq!(removed.process_handle, Some(pid));
        assert!(mgr.jobs(Some(&job.id)).unwrap().is_empty());
    }

    #[test]
    fn test_finished_process_marked_completed() {
        let _guard = SCRIPT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = TempDir::new().unwrap();
        let script = fake_mega_get(dir.path(), "exit 0");
        let mut mgr = manager(&dir, 1, Some(script));

        let job = mgr
            .add(AddRequest::new("mega://folder/xyz"), None)
            .unwrap()
            .job;
        assert_eq!(job.status, JobStatus::Started);

        let mut changed = Vec::new();
        for _ in 0..50 {
            changed = mgr.refresh().unwrap();
            if !changed.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].id, job.id);
        assert_eq!(changed[0].status, JobStatus::Completed);

        // Completed jobs cannot be paused, and removing them sends no signal
        assert!(mgr.pause(&job.id).is_err());
        assert!(mgr.remove(&job.id).unwrap().is_some());
    }

    #[test]
    fn test_forced_backend_overrides_url() {
        let _guard = SCRIPT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = TempDir::new().unwrap();
        let script = fake_mega_get(dir.path(), "exit 0");
        let mut mgr = manager(&dir, 1, Some(script));

        let job = mgr
            .add(AddRequest::new("https://example.com/file.bin"), Some("mega"))
            .unwrap()
            .job;
        assert_eq!(job.backend, BackendKind::Mega);
        assert!(job.process_handle.is_some());
    }
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! OS process control for directly spawned downloads.
//!
//! Pause and resume are coarse: the whole process is stopped (SIGSTOP /
//! SIGCONT on Unix, every thread suspended on Windows). Network
//! connections may time out while a process is stopped.

use std::collections::HashMap;
use std::process::Child;

use crate::error::DownloadError;

/// Stop a process so it can be resumed later.
pub fn suspend(pid: u32) -> Result<(), DownloadError> {
    imp::suspend(pid)
}

/// Continue a process stopped by [`suspend`].
pub fn resume(pid: u32) -> Result<(), DownloadError> {
    imp::resume(pid)
}

/// Ask a process to exit.
pub fn terminate(pid: u32) -> Result<(), DownloadError> {
    imp::terminate(pid)
}

/// Returns true while `pid` refers to a running (non-zombie) process.
pub fn is_alive(pid: u32) -> bool {
    #[cfg(feature = "procinfo")]
    {
        inspect_alive(pid)
    }
    #[cfg(not(feature = "procinfo"))]
    {
        imp::signal_alive(pid)
    }
}

#[cfg(feature = "procinfo")]
fn inspect_alive(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessStatus, System};

    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    if !sys.refresh_process(pid) {
        return false;
    }
    match sys.process(pid) {
        Some(process) => !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        None => false,
    }
}

#[cfg(unix)]
mod imp {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    use crate::error::DownloadError;

    fn send(pid: u32, signal: Signal, action: &'static str) -> Result<(), DownloadError> {
        let raw = i32::try_from(pid).map_err(|_| DownloadError::Process {
            pid,
            action,
            reason: "pid out of range".to_string(),
        })?;
        kill(Pid::from_raw(raw), signal).map_err(|errno| DownloadError::Process {
            pid,
            action,
            reason: errno.desc().to_string(),
        })
    }

    pub fn suspend(pid: u32) -> Result<(), DownloadError> {
        send(pid, Signal::SIGSTOP, "suspend")
    }

    pub fn resume(pid: u32) -> Result<(), DownloadError> {
        send(pid, Signal::SIGCONT, "resume")
    }

    pub fn terminate(pid: u32) -> Result<(), DownloadError> {
        // A stopped process only acts on SIGTERM once continued
        let _ = send(pid, Signal::SIGCONT, "resume");
        send(pid, Signal::SIGTERM, "terminate")
    }

    #[cfg_attr(feature = "procinfo", allow(dead_code))]
    pub fn signal_alive(pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            // Exists but belongs to someone else
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

#[cfg(windows)]
mod imp {
    use windows_sys::Win32::Foundation::{CloseHandle, INVALID_HANDLE_VALUE, STILL_ACTIVE};
    use windows_sys::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
    };
    use windows_sys::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, OpenThread, ResumeThread, SuspendThread,
        PROCESS_QUERY_LIMITED_INFORMATION, THREAD_SUSPEND_RESUME,
    };

    use crate::error::DownloadError;

    /// Apply `op` to every thread owned by `pid`. Returns how many threads
    /// were touched.
    fn for_each_thread(
        pid: u32,
        action: &'static str,
        op: unsafe extern "system" fn(isize) -> u32,
    ) -> Result<usize, DownloadError> {
        let fail = |reason: String| DownloadError::Process { pid, action, reason };

        // SAFETY: plain Win32 calls; every handle opened here is closed below.
        unsafe {
            let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0);
            if snapshot == INVALID_HANDLE_VALUE {
                return Err(fail(std::io::Error::last_os_error().to_string()));
            }

            let mut entry: THREADENTRY32 = std::mem::zeroed();
            entry.dwSize = std::mem::size_of::<THREADENTRY32>() as u32;

            let mut touched = 0;
            let mut more = Thread32First(snapshot, &mut entry) != 0;
            while more {
                if entry.th32OwnerProcessID == pid {
                    let thread = OpenThread(THREAD_SUSPEND_RESUME, 0, entry.th32ThreadID);
                    if thread != 0 {
                        if op(thread) != u32::MAX {
                            touched += 1;
                        }
                        CloseHandle(thread);
                    }
                }
                more = Thread32Next(snapshot, &mut entry) != 0;
            }
            CloseHandle(snapshot);

            if touched == 0 {
                return Err(fail("no threads could be opened".to_string()));
            }
            Ok(touched)
        }
    }

    pub fn suspend(pid: u32) -> Result<(), DownloadError> {
        for_each_thread(pid, "suspend", SuspendThread).map(|_| ())
    }

    pub fn resume(pid: u32) -> Result<(), DownloadError> {
        for_each_thread(pid, "resume", ResumeThread).map(|_| ())
    }

    pub fn terminate(pid: u32) -> Result<(), DownloadError> {
        let status = std::process::Command::new("taskkill")
            .args(["/F", "/PID", &pid.to_string()])
            .output()
            .map_err(|e| DownloadError::Process {
                pid,
                action: "terminate",
                reason: e.to_string(),
            })?;

        if status.status.success() {
            Ok(())
        } else {
            Err(DownloadError::Process {
                pid,
                action: "terminate",
                reason: String::from_utf8_lossy(&status.stderr).trim().to_string(),
            })
        }
    }

    #[cfg_attr(feature = "procinfo", allow(dead_code))]
    pub fn signal_alive(pid: u32) -> bool {
        // SAFETY: the handle is checked and closed.
        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if handle == 0 {
                return false;
            }
            let mut code: u32 = 0;
            let ok = GetExitCodeProcess(handle, &mut code) != 0;
            CloseHandle(handle);
            ok && code == STILL_ACTIVE as u32
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod imp {
    use crate::error::DownloadError;

    pub fn suspend(_pid: u32) -> Result<(), DownloadError> {
        Err(DownloadError::Unsupported("process suspend"))
    }

    pub fn resume(_pid: u32) -> Result<(), DownloadError> {
        Err(DownloadError::Unsupported("process resume"))
    }

    pub fn terminate(_pid: u32) -> Result<(), DownloadError> {
        Err(DownloadError::Unsupported("process terminate"))
    }

    #[allow(dead_code)]
    pub fn signal_alive(_pid: u32) -> bool {
        false
    }
}

/// Child handles for processes this invocation spawned.
///
/// Holding the [`Child`] lets liveness checks reap an exited process
/// instead of seeing it linger as a zombie.
#[derive(Debug, Default)]
pub struct ChildRegistry {
    children: HashMap<u32, Child>,
}

impl ChildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a spawned child and return its PID.
    pub fn track(&mut self, child: Child) -> u32 {
        let pid = child.id();
        self.children.insert(pid, child);
        pid
    }

    /// `Some(alive)` for tracked children, `None` for unknown PIDs.
    pub fn poll(&mut self, pid: u32) -> Option<bool> {
        let child = self.children.get_mut(&pid)?;
        match child.try_wait() {
            Ok(None) => Some(true),
            Ok(Some(status)) => {
                tracing::debug!("Process {} exited with {}", pid, status);
                self.children.remove(&pid);
                Some(false)
            }
            Err(e) => {
                tracing::debug!("try_wait on {} failed: {}", pid, e);
                None
            }
        }
    }

}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};
    use std::thread;
    use std::time::Duration;

    fn sleeper() -> Child {
        Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn sleep")
    }

    #[test]
    fn test_suspend_resume_terminate() {
        let mut registry = ChildRegistry::new();
        let pid = registry.track(sleeper());

        assert!(is_alive(pid));
        suspend(pid).unwrap();
        resume(pid).unwrap();
        terminate(pid).unwrap();

        let mut exited = false;
        for _ in 0..50 {
            if registry.poll(pid) == Some(false) {
                exited = true;
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        assert!(exited, "terminated child should be reaped");
        // Reaped children are no longer tracked
        assert_eq!(registry.poll(pid), None);
    }

    #[test]
    fn test_signals_to_missing_process_fail() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        assert!(!is_alive(pid));
        let err = suspend(pid).unwrap_err();
        assert!(matches!(err, DownloadError::Process { action: "suspend", .. }));
    }

    #[test]
    fn test_unknown_pid_not_tracked() {
        let mut registry = ChildRegistry::new();
        assert_eq!(registry.poll(999_999), None);
    }
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Locating the external download tools.
//!
//! Search order for both tools: an explicitly configured path, a copy
//! bundled next to the dlmgr executable, known install locations, then
//! `PATH`.

use std::path::{Path, PathBuf};

/// Base name of the aria2 executable.
pub const ARIA2_BINARY: &str = "aria2c";

/// Base name of the MEGAcmd download command.
pub const MEGA_BINARY: &str = "mega-get";

/// Platform file name for an executable (`aria2c.exe` on Windows).
pub fn exe_name(base: &str) -> String {
    if cfg!(windows) {
        format!("{}.exe", base)
    } else {
        base.to_string()
    }
}

/// MEGAcmd ships its commands as batch wrappers on Windows.
fn mega_script_name() -> String {
    if cfg!(windows) {
        format!("{}.bat", MEGA_BINARY)
    } else {
        MEGA_BINARY.to_string()
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && (m.permissions().mode() & 0o111 != 0))
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

/// First directory in `dirs` that holds an executable called `name`.
pub fn find_in_dirs(name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    if name.trim().is_empty() {
        return None;
    }
    dirs.iter()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

/// Search `PATH` for `name`.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    let dirs: Vec<PathBuf> = std::env::split_paths(&path_var).collect();
    find_in_dirs(name, &dirs)
}

/// Directory holding the running executable.
fn exe_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

/// Resolve a configured binary setting, then fall back to `candidates`
/// and finally `PATH`.
///
/// A configured value containing a path separator must point at an
/// executable file; a bare name is looked up on `PATH`.
pub fn resolve(configured: Option<&Path>, candidates: &[PathBuf], name: &str) -> Option<PathBuf> {
    if let Some(configured) = configured.filter(|p| !p.as_os_str().is_empty()) {
        let text = configured.to_string_lossy();
        let found = if text.contains('/') || text.contains(std::path::MAIN_SEPARATOR) {
            is_executable(configured).then(|| configured.to_path_buf())
        } else {
            find_in_path(&text)
        };
        match found {
            Some(path) => return Some(path),
            None => tracing::warn!("Configured binary {:?} not found, searching defaults", configured),
        }
    }

    candidates
        .iter()
        .find(|c| is_executable(c))
        .cloned()
        .or_else(|| find_in_path(name))
}

/// Bundled aria2 locations: `<exe_dir>/aria2_portable/aria2c`, `<exe_dir>/aria2c`.
pub fn aria2_candidates() -> Vec<PathBuf> {
    let name = exe_name(ARIA2_BINARY);
    match exe_dir() {
        Some(dir) => vec![dir.join("aria2_portable").join(&name), dir.join(&name)],
        None => Vec::new(),
    }
}

/// Bundled and OS-installed `mega-get` locations.
pub fn mega_candidates() -> Vec<PathBuf> {
    let name = mega_script_name();
    let mut candidates = Vec::new();

    if let Some(dir) = exe_dir() {
        candidates.push(dir.join("mega_portable").join(&name));
        candidates.push(dir.join(&name));
    }

    if cfg!(windows) {
        if let Some(local) = dirs::data_local_dir() {
            candidates.push(local.join("MEGAcmd").join(&name));
        }
    } else if cfg!(target_os = "macos") {
        candidates.push(PathBuf::from("/Applications/MEGAcmd.app/Contents/MacOS").join(&name));
    } else {
        candidates.push(PathBuf::from("/usr/bin").join(&name));
        candidates.push(PathBuf::from("/usr/local/bin").join(&name));
    }

    candidates
}

/// Find aria2c, honoring a configured path.
pub fn locate_aria2(configured: Option<&Path>) -> Option<PathBuf> {
    resolve(configured, &aria2_candidates(), &exe_name(ARIA2_BINARY))
}

/// Find mega-get, honoring a configured path.
pub fn locate_mega(configured: Option<&Path>) -> Option<PathBuf> {
    resolve(configured, &mega_candidates(), &mega_script_name())
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Last-resort direct download, performed in-process.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::DownloadError;

/// File name used when the URL path has no basename.
pub const FALLBACK_FILE_NAME: &str = "download.bin";

/// Last path segment of a URL, ignoring query and fragment.
pub fn file_name_from_url(url: &str) -> String {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let path = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or_default();

    // Everything before the first '/' is the authority
    let name = match path.split_once('/') {
        Some((_, rest)) => rest.rsplit('/').next().unwrap_or_default(),
        None => "",
    };

    if name.is_empty() || name == "." || name == ".." {
        FALLBACK_FILE_NAME.to_string()
    } else {
        name.to_string()
    }
}

/// `file.zip`, then `file_1.zip`, `file_2.zip`, ...
fn candidate_names(name: &str) -> impl Iterator<Item = String> + '_ {
    let as_path = Path::new(name);
    let stem = as_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = as_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    std::iter::once(name.to_string())
        .chain((1u32..).map(move |n| format!("{}_{}{}", stem, n, ext)))
}

/// Create the first free `name` variant in `dir`.
///
/// Uses `create_new`, so a file another writer creates between attempts is
/// skipped rather than truncated.
pub fn create_unique(dir: &Path, name: &str) -> io::Result<(PathBuf, File)> {
    for candidate in candidate_names(name) {
        let path = dir.join(candidate);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free file name for {} in {:?}", name, dir),
    ))
}

/// Stream `url` into `dir`, blocking until the transfer finishes.
///
/// Returns the path written. A partial file is removed on failure.
pub fn fetch(url: &str, dir: &Path, out: Option<&str>) -> Result<PathBuf, DownloadError> {
    let fail = |reason: String| DownloadError::DirectFetch {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::blocking::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(None)
        .build()
        .map_err(|e| fail(format!("cannot build HTTP client: {}", e)))?;

    let mut response = client.get(url).send().map_err(|e| fail(e.to_string()))?;
    if !response.status().is_success() {
        return Err(fail(format!("HTTP {}", response.status().as_u16())));
    }

    let name = out
        .map(str::to_string)
        .unwrap_or_else(|| file_name_from_url(url));
    let (dest, mut file) = create_unique(dir, &name)
        .map_err(|e| fail(format!("create {:?}: {}", dir.join(&name), e)))?;
    tracing::info!("Direct download {} -> {:?}", url, dest);

    let written = response
        .copy_to(&mut file)
        .map_err(|e| e.to_string())
        .and_then(|n| file.sync_all().map(|_| n).map_err(|e| e.to_string()));

    match written {
        Ok(bytes) => {
            tracing::info!("Direct download complete: {:?} ({} bytes)", dest, bytes);
            Ok(dest)
        }
        Err(reason) => {
            drop(file);
            let _ = fs::remove_file(&dest);
            Err(fail(reason))
        }
    }
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Utility functions for dlmgr.

use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;

/// Mask a sensitive string (RPC secrets, passwords) for logging.
///
/// Shows only the first `visible_prefix` characters and replaces the rest with "...".
///
/// # Examples
///
/// ```
/// use dlmgr::utils::mask_sensitive;
///
/// assert_eq!(mask_sensitive("secret123", 3), "sec...");
/// ```
pub fn mask_sensitive(input: &str, visible_prefix: usize) -> String {
    if input.len() <= visible_prefix {
        // Still mask short values to avoid leaking length
        return format!("{}...", input);
    }

    let prefix: String = input.chars().take(visible_prefix).collect();
    format!("{}...", prefix)
}

/// Format a progress percentage with two decimals.
pub fn format_progress(percent: f64) -> String {
    format!("{:.2}%", percent)
}

/// Default download directory (`~/Downloads/dlmgr`, or `./downloads`).
pub fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .map(|d| d.join("dlmgr"))
        .unwrap_or_else(|| PathBuf::from("downloads"))
}

/// Create the download directory if missing and return its path.
pub fn ensure_download_dir(dir: &Path) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    Ok(dir.to_path_buf())
}

/// Generate a random RFC 4122 version 4 UUID in hyphenated form.
pub fn uuid_v4() -> String {
    let mut rng = rand::thread_rng();

    let mut bytes = [0u8; 16];
    rng.fill(&mut bytes);

    bytes[6] = (bytes[6] & 0x0f) | 0x40; // Version 4
    bytes[8] = (bytes[8] & 0x3f) | 0x80; // Variant RFC 4122

    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_sensitive() {
        assert_eq!(mask_sensitive("secret123", 3), "sec...");
        assert_eq!(mask_sensitive("ab", 3), "ab...");
        assert_eq!(mask_sensitive("", 3), "...");
    }

    #[test]
    fn test_format_progress() {
        assert_eq!(format_progress(0.0), "0.00%");
        assert_eq!(format_progress(12.3456), "12.35%");
        assert_eq!(format_progress(100.0), "100.00%");
    }

    #[test]
    fn test_uuid_v4_shape() {
        let id = uuid_v4();
        assert_eq!(id.len(), 36);
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.iter().map(|p| p.len()).collect::<Vec<_>>(), vec![8, 4, 4, 4, 12]);
        assert!(parts[2].starts_with('4'));
        assert_ne!(uuid_v4(), uuid_v4());
    }
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Progress snapshots for RPC-managed downloads.

use serde::{Deserialize, Serialize};

use crate::backend::aria2::rpc::Aria2Status;
use crate::utils::format_progress;

/// Numeric progress of one aria2 download, as reported by `tellStatus`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub gid: String,
    /// aria2 status: `active`, `waiting`, `paused`, `error`, `complete`, `removed`
    pub status: String,
    pub completed_bytes: u64,
    pub total_bytes: u64,
    pub speed_bps: u64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl ProgressReport {
    /// Build a report from a raw status. Unparseable numbers count as zero.
    pub fn from_status(gid: &str, status: &Aria2Status) -> Self {
        let number = |s: &Option<String>| {
            s.as_deref()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(0)
        };
        Self {
            gid: status.gid.clone().unwrap_or_else(|| gid.to_string()),
            status: status.status.clone().unwrap_or_else(|| "unknown".to_string()),
            completed_bytes: number(&status.completed_length),
            total_bytes: number(&status.total_length),
            speed_bps: number(&status.download_speed),
            error_code: status.error_code.clone().filter(|c| !c.is_empty() && c != "0"),
            error_message: status.error_message.clone().filter(|m| !m.trim().is_empty()),
        }
    }

    /// Completion in percent; 0 while the total size is unknown.
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            (self.completed_bytes as f64 / self.total_bytes as f64) * 100.0
        }
    }

    pub fn speed_string(&self) -> String {
        let bps = self.speed_bps;
        if bps >= 1_073_741_824 {
            format!("{:.1} GB/s", bps as f64 / 1_073_741_824.0)
        } else if bps >= 1_048_576 {
            format!("{:.1} MB/s", bps as f64 / 1_048_576.0)
        } else if bps >= 1024 {
            format!("{:.1} KB/s", bps as f64 / 1024.0)
        } else {
            format!("{} B/s", bps)
        }
    }

    /// Estimated time remaining, when both speed and size are known.
    pub fn eta_string(&self) -> Option<String> {
        if self.speed_bps == 0 || self.total_bytes <= self.completed_bytes {
            return None;
        }
        let secs = (self.total_bytes - self.completed_bytes) / self.speed_bps;
        Some(if secs >= 3600 {
            format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
        } else if secs >= 60 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else {
            format!("{}s", secs)
        })
    }

    pub fn is_finished(&self) -> bool {
        self.status == "complete"
    }

    /// One-line rendering used by `active` and `status`.
    pub fn render_line(&self) -> String {
        let mut line = format!(
            "GID: {} | Status: {} | Progress: {} ({}/{} bytes) | Speed: {}",
            self.gid,
            self.status,
            format_progress(self.percent()),
            self.completed_bytes,
            self.total_bytes,
            self.speed_string()
        );
        if let Some(msg) = &self.error_message {
            line.push_str(&format!(" | Error: {}", msg));
        }
        line
    }

    /// Multi-line rendering used by `progress <gid>`.
    pub fn render_detail(&self) -> String {
        let mut out = format!(
            "GID: {}\nStatus: {}\nProgress: {} ({}/{} bytes)\nSpeed: {}",
            self.gid,
            self.status,
            format_progress(self.percent()),
            self.completed_bytes,
            self.total_bytes,
            self.speed_string()
        );
        if let Some(eta) = self.eta_string() {
            out.push_str(&format!("\nETA: {}", eta));
        }
        if let Some(msg) = &self.error_message {
            out.push_str(&format!("\nError: {}", msg));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(completed: &str, total: &str, speed: &str) -> Aria2Status {
        Aria2Status {
            gid: Some("2089b05ecca3d829".into()),
            status: Some("active".into()),
            completed_length: Some(completed.into()),
            total_length: Some(total.into()),
            download_speed: Some(speed.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_percent_two_decimals() {
        let report = ProgressReport::from_status("x", &status("1", "3", "0"));
        assert_eq!(format_progress(report.percent()), "33.33%");
    }

    #[test]
    fn test_unknown_total_is_zero_percent() {
        let report = ProgressReport::from_status("x", &status("500", "0", "0"));
        assert_eq!(report.percent(), 0.0);
        assert!(report.render_line().contains("Progress: 0.00% (500/0 bytes)"));
    }

    #[test]
    fn test_speed_units() {
        let mut report = ProgressReport::default();
        report.speed_bps = 512;
        assert_eq!(report.speed_string(), "512 B/s");
        report.speed_bps = 2048;
        assert_eq!(report.speed_string(), "2.0 KB/s");
        report.speed_bps = 5 * 1_048_576;
        assert_eq!(report.speed_string(), "5.0 MB/s");
        report.speed_bps = 3 * 1_073_741_824;
        assert_eq!(report.speed_string(), "3.0 GB/s");
    }

    #[test]
    fn test_error_appended() {
        let mut raw = status("0", "100", "0");
        raw.status = Some("error".into());
        raw.error_code = Some("3".into());
        raw.error_message = Some("Resource not found".into());
        let report = ProgressReport::from_status("x", &raw);
        assert!(report.render_line().ends_with(" | Error: Resource not found"));
        assert!(report.render_detail().ends_with("\nError: Resource not found"));
    }

    #[test]
    fn test_eta() {
        let report = ProgressReport {
            completed_bytes: 0,
            total_bytes: 600,
            speed_bps: 10,
            ..Default::default()
        };
        assert_eq!(report.eta_string().as_deref(), Some("1m 0s"));
    }
}

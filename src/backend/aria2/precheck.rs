// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lightweight reachability check for http(s) URLs before anything is spawned.

use std::time::Duration;

use reqwest::header::RANGE;
use reqwest::StatusCode;

use crate::error::DownloadError;

/// Total time allowed for each precheck request.
pub const PRECHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// HEAD responses that only mean "ask differently".
fn head_refused(status: StatusCode) -> bool {
    matches!(status.as_u16(), 400 | 403 | 405)
}

fn is_http(url: &str) -> bool {
    let lower = url.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// HEAD the URL, falling back to a one-byte range GET when the server
/// refuses HEAD or the connection fails. Non-http(s) URLs pass unchecked.
///
/// Certificates are not verified, matching how aria2c is launched.
pub fn check_url(url: &str) -> Result<(), DownloadError> {
    if !is_http(url) {
        return Ok(());
    }

    let fail = |reason: String| DownloadError::Precheck {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::blocking::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(PRECHECK_TIMEOUT)
        .build()
        .map_err(|e| fail(format!("cannot build HTTP client: {}", e)))?;

    match client.head(url).send() {
        Ok(resp) if resp.status().is_success() => return Ok(()),
        Ok(resp) if head_refused(resp.status()) => {
            tracing::debug!("HEAD {} refused with {}, trying range GET", url, resp.status());
        }
        Ok(resp) => return Err(fail(format!("HTTP {}", resp.status().as_u16()))),
        Err(e) => {
            tracing::debug!("HEAD {} failed ({}), trying range GET", url, e);
        }
    }

    match client.get(url).header(RANGE, "bytes=0-0").send() {
        Ok(resp) if resp.status().is_success() => Ok(()),
        Ok(resp) => Err(fail(format!("HTTP {} (range GET)", resp.status().as_u16()))),
        Err(e) => Err(fail(format!("range GET: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_http_schemes_skip_precheck() {
        assert!(check_url("magnet:?xt=urn:btih:abc").is_ok());
        assert!(check_url("ftp://example.invalid/file").is_ok());
    }

    #[test]
    fn test_head_refusals() {
        assert!(head_refused(StatusCode::METHOD_NOT_ALLOWED));
        assert!(head_refused(StatusCode::FORBIDDEN));
        assert!(head_refused(StatusCode::BAD_REQUEST));
        assert!(!head_refused(StatusCode::NOT_FOUND));
    }
}

//! Remote update manifest: fetch, sanitize, validate, compare.
//!
//! The manifest is untrusted input. Decoding never fails outright, every
//! string field is stripped of control characters, and the download URL is
//! checked before anything is fetched from it.

mod decode;
mod version;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::UpdaterOptions;
use crate::error::UpdateError;
use crate::http::http_client;
use decode::{decode_text, narrow_to_safe, strip_control};
pub use version::{compare_versions, is_newer};

/// Categorized change notes for one version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
    #[serde(default)]
    pub bug_fixes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionManifest {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub release_date: String,
    #[serde(default)]
    pub download_url: String,
    #[serde(default)]
    pub file_hash_sha256: Option<String>,
    #[serde(default)]
    pub changelog: BTreeMap<String, ChangeSet>,
    #[serde(default = "zero_version")]
    pub minimum_required_version: String,
}

fn zero_version() -> String {
    "0.0.0".to_string()
}

impl VersionManifest {
    /// Strip control characters from every string, including changelog keys.
    fn sanitize(&mut self) {
        for s in [
            &mut self.version,
            &mut self.release_date,
            &mut self.download_url,
            &mut self.minimum_required_version,
        ] {
            *s = strip_control(s).trim().to_string();
        }
        if let Some(h) = self.file_hash_sha256.as_mut() {
            *h = strip_control(h).trim().to_string();
        }
        let changelog = std::mem::take(&mut self.changelog);
        self.changelog = changelog
            .into_iter()
            .map(|(k, mut cs)| {
                for list in [&mut cs.features, &mut cs.improvements, &mut cs.bug_fixes] {
                    for item in list.iter_mut() {
                        *item = strip_control(item);
                    }
                }
                (strip_control(&k).trim().to_string(), cs)
            })
            .collect();
    }

    fn validate(&self, allow_insecure: bool) -> Result<(), UpdateError> {
        if self.version.is_empty() {
            return Err(UpdateError::ManifestParse("missing version".into()));
        }
        validate_url(&self.download_url, allow_insecure)?;
        Ok(())
    }

    /// True when `current` is older than the minimum version this release
    /// still supports upgrading from in place.
    pub fn is_mandatory_for(&self, current: &str) -> bool {
        is_newer(&self.minimum_required_version, current)
    }

    /// Human-readable change notes for this manifest's own version.
    pub fn latest_changes(&self) -> String {
        let Some(cs) = self.changelog.get(&self.version) else {
            return "No change information available.".to_string();
        };
        let mut sections = Vec::new();
        for (title, items) in [
            ("New features", &cs.features),
            ("Improvements", &cs.improvements),
            ("Bug fixes", &cs.bug_fixes),
        ] {
            if items.is_empty() {
                continue;
            }
            let mut s = format!("{}:", title);
            for i in items {
                s.push_str(&format!("\n  • {}", i));
            }
            sections.push(s);
        }
        if sections.is_empty() {
            return "No change information available.".to_string();
        }
        sections.join("\n\n")
    }
}

/// Decode, parse, sanitize and validate a manifest body.
///
/// A first parse failure triggers exactly one retry on text narrowed to a
/// safe alphabet; only if that also fails is `ManifestParse` returned.
pub fn parse_manifest(body: &[u8], allow_insecure: bool) -> Result<VersionManifest, UpdateError> {
    let text = decode_text(body);
    let mut manifest: VersionManifest = match serde_json::from_str(&text) {
        Ok(m) => m,
        Err(first) => {
            debug!("manifest parse failed ({}), retrying on narrowed text", first);
            serde_json::from_str(&narrow_to_safe(&text)).map_err(|e| {
                UpdateError::ManifestParse(format!("{} (after sanitizing: {})", first, e))
            })?
        }
    };
    manifest.sanitize();
    manifest.validate(allow_insecure)?;
    Ok(manifest)
}

/// Accept only HTTPS URLs to public hosts, unless `allow_insecure`.
pub fn validate_url(raw: &str, allow_insecure: bool) -> Result<Url, UpdateError> {
    let url = Url::parse(raw)
        .map_err(|e| UpdateError::ManifestParse(format!("invalid url {:?}: {}", raw, e)))?;
    match url.scheme() {
        "https" => {}
        "http" if allow_insecure => {}
        other => {
            return Err(UpdateError::ManifestParse(format!(
                "url scheme {:?} not allowed: {}",
                other, raw
            )));
        }
    }
    let host = url
        .host_str()
        .ok_or_else(|| UpdateError::ManifestParse(format!("url has no host: {}", raw)))?;
    if !allow_insecure && is_local_host(host) {
        return Err(UpdateError::ManifestParse(format!(
            "url points at a local or private host: {}",
            raw
        )));
    }
    Ok(url)
}

fn is_local_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    match bare.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
        }
        Ok(IpAddr::V6(ip)) => {
            let first = ip.segments()[0];
            ip.is_loopback()
                || ip.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
        Err(_) => false,
    }
}

/// Fetches the remote manifest and compares it against the injected current version.
pub struct ManifestClient {
    client: reqwest::blocking::Client,
    current_version: String,
    allow_insecure: bool,
}

impl ManifestClient {
    pub fn new(
        current_version: &str,
        timeout: Duration,
        allow_insecure: bool,
    ) -> Result<Self, UpdateError> {
        Ok(ManifestClient {
            client: http_client(timeout, Some(timeout))?,
            current_version: current_version.to_string(),
            allow_insecure,
        })
    }

    pub fn from_options(opts: &UpdaterOptions) -> Result<Self, UpdateError> {
        Self::new(&opts.current_version, opts.timeout, opts.allow_insecure)
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    /// GET `url` with a bounded timeout and parse the body.
    ///
    /// # Errors
    /// - `Network` on connection failures, timeouts or non-2xx status.
    /// - `ManifestParse` when the body is not a usable manifest.
    pub fn fetch(&self, url: &str) -> Result<VersionManifest, UpdateError> {
        let url = validate_url(url, self.allow_insecure)?;
        let resp = self.client.get(url.clone()).send()?.error_for_status()?;
        let body = resp.bytes()?;
        let manifest = parse_manifest(&body, self.allow_insecure).inspect_err(|e| {
            warn!("manifest from {} rejected: {}", url, e);
        })?;
        debug!(version = %manifest.version, "manifest fetched");
        Ok(manifest)
    }

    pub fn is_newer(&self, manifest: &VersionManifest) -> bool {
        is_newer(&manifest.version, &self.current_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    const SAMPLE: &str = r#"{
        "version": "2.8.0",
        "release_date": "2026-09-30",
        "download_url": "https://example.com/releases/app-2.8.0.zip",
        "file_hash_sha256": "ABCDEF",
        "changelog": {
            "2.8.0": {
                "features": ["bulk import"],
                "improvements": [],
                "bug_fixes": ["crash on empty sheet"]
            }
        },
        "minimum_required_version": "2.0.0"
    }"#;

    #[test]
    fn parses_well_formed_manifest() {
        let m = parse_manifest(SAMPLE.as_bytes(), false).unwrap();
        assert_eq!(m.version, "2.8.0");
        assert_eq!(m.file_hash_sha256.as_deref(), Some("ABCDEF"));
        assert_eq!(m.changelog["2.8.0"].bug_fixes, vec!["crash on empty sheet"]);
        assert!(!m.is_mandatory_for("2.1.0"));
        assert!(m.is_mandatory_for("1.9"));
    }

    #[test]
    fn raw_control_characters_are_survived_and_stripped() {
        let body = SAMPLE.replace("bulk import", "bulk\u{1}\u{7} import");
        let m = parse_manifest(body.as_bytes(), false).unwrap();
        assert_eq!(m.changelog["2.8.0"].features, vec!["bulk import"]);
    }

    #[test]
    fn escaped_control_characters_are_stripped() {
        let body = SAMPLE.replace("2026-09-30", "2026-09-30\\u0000\\u001b");
        let m = parse_manifest(body.as_bytes(), false).unwrap();
        assert_eq!(m.release_date, "2026-09-30");
    }

    #[test]
    fn invalid_utf8_does_not_fail_parse() {
        let mut body = SAMPLE.replace("crash on empty sheet", "crash X").into_bytes();
        let pos = body.windows(7).position(|w| w == b"crash X").unwrap() + 6;
        body[pos] = 0xFF;
        let m = parse_manifest(&body, false).unwrap();
        let fix = &m.changelog["2.8.0"].bug_fixes[0];
        assert!(fix.starts_with("crash "));
        assert!(!fix.chars().any(|c| c.is_control()));
    }

    #[test]
    fn bom_prefixed_body_parses() {
        let mut body = vec![0xEF, 0xBB, 0xBF];
        body.extend_from_slice(SAMPLE.as_bytes());
        assert!(parse_manifest(&body, false).is_ok());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = parse_manifest(b"<html>502</html>", false).unwrap_err();
        assert_eq!(err.kind(), "ManifestParseError");
    }

    #[test]
    fn http_and_private_hosts_are_rejected_unless_insecure() {
        assert!(validate_url("http://example.com/a.zip", false).is_err());
        assert!(validate_url("https://127.0.0.1/a.zip", false).is_err());
        assert!(validate_url("https://10.1.2.3/a.zip", false).is_err());
        assert!(validate_url("https://[::1]/a.zip", false).is_err());
        assert!(validate_url("https://localhost/a.zip", false).is_err());
        assert!(validate_url("ftp://example.com/a.zip", true).is_err());
        assert!(validate_url("http://127.0.0.1:8080/a.zip", true).is_ok());
        assert!(validate_url("https://example.com/a.zip", false).is_ok());
    }

    #[test]
    fn latest_changes_formats_sections() {
        let m = parse_manifest(SAMPLE.as_bytes(), false).unwrap();
        let text = m.latest_changes();
        assert!(text.contains("New features:\n  • bulk import"));
        assert!(text.contains("Bug fixes:\n  • crash on empty sheet"));
        assert!(!text.contains("Improvements"));
    }

    #[test]
    fn fetch_reads_manifest_from_server() {
        let server = MockServer::start();
        let body = SAMPLE.replace(
            "https://example.com/releases/app-2.8.0.zip",
            &server.url("/app-2.8.0.zip"),
        );
        let m = server.mock(|when, then| {
            when.method(GET).path("/version.json");
            then.status(200).body(body.as_bytes());
        });

        let client = ManifestClient::new("2.7.1", Duration::from_secs(5), true).unwrap();
        let manifest = client.fetch(&server.url("/version.json")).unwrap();
        m.assert();
        assert!(client.is_newer(&manifest));
    }

    #[test]
    fn fetch_maps_http_errors_to_network() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/version.json");
            then.status(404);
        });
        let client = ManifestClient::new("2.7.1", Duration::from_secs(5), true).unwrap();
        let err = client.fetch(&server.url("/version.json")).unwrap_err();
        assert_eq!(err.kind(), "NetworkError");
    }
}

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::rules::RuleTable;

/// Top-level configuration loaded from `config.toml`.
///
/// Example TOML:
/// ```toml
/// manifest_url = "https://example.com/app/version.json"
/// product_name = "ItemTool"
/// protected    = ["*.sqlite"]
/// ```
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub manifest_url: String,
    #[serde(default)]
    pub current_version: Option<String>,
    #[serde(default = "default_product_name")]
    pub product_name: String,
    #[serde(default)]
    pub install_dir: Option<PathBuf>,
    #[serde(default)]
    pub executable: Option<PathBuf>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub allow_insecure: bool,
    #[serde(default)]
    pub require_digest: bool,
    #[serde(default)]
    pub protected: Vec<String>,
    #[serde(default)]
    pub critical_markers: Vec<String>,
    #[serde(default)]
    pub supporting_markers: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            manifest_url: String::new(),
            current_version: None,
            product_name: default_product_name(),
            install_dir: None,
            executable: None,
            timeout_secs: default_timeout_secs(),
            allow_insecure: false,
            require_digest: false,
            protected: Vec::new(),
            critical_markers: Vec::new(),
            supporting_markers: Vec::new(),
        }
    }
}

fn default_product_name() -> String {
    "updraft".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

/// What to do when a manifest carries no usable digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestPolicy {
    /// Pass verification, but warn loudly on every channel.
    Warn,
    /// Fail with a hash mismatch.
    Strict,
}

/// Fully resolved settings handed to the manifest client and the coordinator.
#[derive(Debug, Clone)]
pub struct UpdaterOptions {
    pub manifest_url: String,
    pub current_version: String,
    pub product_name: String,
    pub install_dir: PathBuf,
    pub executable: PathBuf,
    pub timeout: Duration,
    pub allow_insecure: bool,
    pub digest_policy: DigestPolicy,
    pub rules: RuleTable,
}

impl Config {
    /// Resolve defaults against the running binary.
    ///
    /// `running_version` is used when the file does not pin `current_version`;
    /// `running_exe` when it does not pin `executable`.
    pub fn into_options(self, running_version: &str, running_exe: &Path) -> Result<UpdaterOptions> {
        let executable = self
            .executable
            .unwrap_or_else(|| running_exe.to_path_buf());
        let install_dir = match self.install_dir {
            Some(d) => d,
            None => executable
                .parent()
                .map(Path::to_path_buf)
                .with_context(|| format!("executable has no parent: {}", executable.display()))?,
        };
        let rules = RuleTable::for_product(&self.product_name)
            .with_protected(&self.protected)
            .with_critical(&self.critical_markers)
            .with_supporting(&self.supporting_markers);
        Ok(UpdaterOptions {
            manifest_url: self.manifest_url,
            current_version: self
                .current_version
                .unwrap_or_else(|| running_version.to_string()),
            product_name: self.product_name,
            install_dir,
            executable,
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
            allow_insecure: self.allow_insecure,
            digest_policy: if self.require_digest {
                DigestPolicy::Strict
            } else {
                DigestPolicy::Warn
            },
            rules,
        })
    }
}

/// Load and parse `config.toml` from `path`.
///
/// # Errors
/// - The file cannot be read (the message includes the resolved path).
/// - The TOML is malformed or `manifest_url` is missing.
pub fn load_config(path: &Path) -> Result<Config> {
    let txt = fs::read_to_string(path)
        .with_context(|| format!("config not found: {}", path.display()))?;
    let cfg: Config = toml::from_str(&txt).context("failed to parse config.toml")?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg: Config = toml::from_str(r#"manifest_url = "https://e.com/v.json""#).unwrap();
        assert_eq!(cfg.product_name, "updraft");
        assert_eq!(cfg.timeout_secs, 10);
        assert!(!cfg.allow_insecure);
        assert!(cfg.protected.is_empty());
    }

    #[test]
    fn into_options_injects_running_values() {
        let cfg: Config = toml::from_str(
            r#"
            manifest_url = "https://e.com/v.json"
            product_name = "ItemTool"
            require_digest = true
            "#,
        )
        .unwrap();
        let opts = cfg
            .into_options("2.7.1", Path::new("/opt/itemtool/ItemTool"))
            .unwrap();
        assert_eq!(opts.current_version, "2.7.1");
        assert_eq!(opts.install_dir, PathBuf::from("/opt/itemtool"));
        assert_eq!(opts.digest_policy, DigestPolicy::Strict);
    }

    #[test]
    fn pinned_version_wins_over_running_version() {
        let cfg: Config = toml::from_str(
            r#"
            manifest_url = "https://e.com/v.json"
            current_version = "1.0"
            install_dir = "/srv/app"
            "#,
        )
        .unwrap();
        let opts = cfg.into_options("9.9.9", Path::new("/bin/x")).unwrap();
        assert_eq!(opts.current_version, "1.0");
        assert_eq!(opts.install_dir, PathBuf::from("/srv/app"));
    }

    #[test]
    fn load_config_reports_missing_path() {
        let td = tempdir().unwrap();
        let missing = td.path().join("config.toml");
        let err = load_config(&missing).unwrap_err();
        assert!(err.to_string().contains("config not found"));
    }
}

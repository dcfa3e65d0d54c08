//! Copy a located payload over the install directory.
//!
//! User data already present in the install dir is never overwritten, the
//! running executable is written next to itself as a marker file, and every
//! other file is replaced in place with a bounded retry on lock errors.

pub mod backup;
pub mod copy;

use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::error::UpdateError;
use crate::paths::marker_path;
use crate::rules::{Classification, RuleTable};

pub use copy::{LARGE_FILE_THRESHOLD, RetryPolicy};

/// What one replacement pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaceReport {
    /// Install-dir paths overwritten or created, in walk order.
    pub replaced: Vec<PathBuf>,
    /// Install-dir user data left untouched.
    pub skipped_protected: Vec<PathBuf>,
    /// Set when the running executable had a new version in the payload.
    pub marker: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
}

impl ReplaceReport {
    /// A marker was written, so the host has to restart to finish the swap.
    pub fn restart_required(&self) -> bool {
        self.marker.is_some()
    }
}

struct PayloadFile {
    src: PathBuf,
    rel: PathBuf,
    size: u64,
}

pub struct FileReplacementEngine<'a> {
    rules: &'a RuleTable,
    retry: RetryPolicy,
    large_file_threshold: u64,
}

impl<'a> FileReplacementEngine<'a> {
    pub fn new(rules: &'a RuleTable) -> Self {
        FileReplacementEngine {
            rules,
            retry: RetryPolicy::default(),
            large_file_threshold: LARGE_FILE_THRESHOLD,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_large_file_threshold(mut self, bytes: u64) -> Self {
        self.large_file_threshold = bytes;
        self
    }

    /// Mirror `payload_root` onto `install_dir`.
    ///
    /// `on_progress(done, total)` counts payload bytes, protected skips
    /// included, so it always ends at `total`. Cancellation is checked
    /// between files and between chunks of large files; callers that must
    /// not be interrupted pass a sealed token.
    ///
    /// # Errors
    /// The first copy that still fails after the retry budget. Files already
    /// replaced stay replaced.
    pub fn apply(
        &self,
        payload_root: &Path,
        install_dir: &Path,
        running_exe: &Path,
        on_progress: &mut dyn FnMut(u64, u64),
        cancel: &CancelToken,
    ) -> Result<ReplaceReport, UpdateError> {
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        for entry in WalkDir::new(payload_root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| UpdateError::Io {
                path: e.path().map(Path::to_path_buf).unwrap_or_default(),
                source: e.into(),
            })?;
            let Ok(rel) = entry.path().strip_prefix(payload_root) else {
                continue;
            };
            let rel = rel.to_path_buf();
            if entry.file_type().is_dir() {
                dirs.push(rel);
            } else if entry.file_type().is_file() {
                let size = entry
                    .metadata()
                    .map(|m| m.len())
                    .map_err(|e| UpdateError::Io {
                        path: entry.path().to_path_buf(),
                        source: e.into(),
                    })?;
                files.push(PayloadFile {
                    src: entry.into_path(),
                    rel,
                    size,
                });
            }
        }
        let total: u64 = files.iter().map(|f| f.size).sum();
        info!(files = files.len(), total, "replacing install files");

        let mut report = ReplaceReport {
            backup_dir: backup::backup_protected(
                install_dir,
                self.rules,
                &Local::now().format("%Y%m%d_%H%M%S").to_string(),
            ),
            ..Default::default()
        };

        for rel in &dirs {
            let d = install_dir.join(rel);
            fs::create_dir_all(&d).map_err(|e| UpdateError::from_io(&d, e))?;
        }

        let mut done = 0u64;
        for file in &files {
            cancel.check()?;
            let dest = install_dir.join(&file.rel);
            let target = match self.rules.classify(&file.rel, &dest, running_exe) {
                Classification::UserData if dest.exists() => {
                    debug!(path = %dest.display(), "keeping user data");
                    report.skipped_protected.push(dest);
                    done += file.size;
                    on_progress(done, total);
                    continue;
                }
                Classification::RunningExecutable => marker_path(running_exe),
                _ => dest.clone(),
            };

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| UpdateError::from_io(parent, e))?;
            }
            let base = done;
            self.retry.run(|| {
                copy::copy_file(
                    &file.src,
                    &target,
                    self.large_file_threshold,
                    &mut |n| on_progress(base + n, total),
                    cancel,
                )
            })?;
            done += file.size;
            on_progress(done, total);

            if target == dest {
                report.replaced.push(dest);
            } else {
                copy::make_executable(&target)?;
                info!(marker = %target.display(), "new executable staged next to the running one");
                report.marker = Some(target);
            }
        }

        info!(
            replaced = report.replaced.len(),
            protected = report.skipped_protected.len(),
            marker = report.marker.is_some(),
            "replacement finished"
        );
        Ok(report)
    }
}

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use super::probe::HostProbe;
use super::state::{UpdateState, WorkerEvent};
use crate::cancel::CancelToken;
use crate::config::{DigestPolicy, UpdaterOptions};
use crate::diag::DiagLog;
use crate::error::UpdateError;
use crate::extract::extract;
use crate::fetch::ArchiveFetcher;
use crate::locate::locate;
use crate::manifest::VersionManifest;
use crate::replace::{FileReplacementEngine, ReplaceReport, RetryPolicy};
use crate::rules::RuleTable;
use crate::verify::{Verified, verify_package};

/// Free space must cover the package this many times over
/// (archive, extracted tree, installed copy).
pub const FREE_SPACE_FACTOR: u64 = 3;

pub const ARCHIVE_NAME: &str = "package.bin";
pub const EXTRACT_DIR: &str = "extracted";

/// Inputs of one download/verify/extract/replace run.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub manifest: VersionManifest,
    /// Where the payload is copied; the install dir, or a staging dir.
    pub target_dir: PathBuf,
    pub executable: PathBuf,
    pub product_name: String,
    pub rules: RuleTable,
    pub digest_policy: DigestPolicy,
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
    /// Scratch space for the archive and the extracted tree.
    pub workspace: PathBuf,
}

impl Pipeline {
    pub fn new(opts: &UpdaterOptions, manifest: VersionManifest, workspace: &Path) -> Self {
        Pipeline {
            manifest,
            target_dir: opts.install_dir.clone(),
            executable: opts.executable.clone(),
            product_name: opts.product_name.clone(),
            rules: opts.rules.clone(),
            digest_policy: opts.digest_policy,
            connect_timeout: opts.timeout,
            retry: RetryPolicy::default(),
            workspace: workspace.to_path_buf(),
        }
    }

    pub fn archive_path(&self) -> PathBuf {
        self.workspace.join(ARCHIVE_NAME)
    }

    pub fn extract_dir(&self) -> PathBuf {
        self.workspace.join(EXTRACT_DIR)
    }

    /// Run every stage in order on the calling thread.
    ///
    /// Each stage announces itself through `emit` and the diag log. The
    /// cancel token is sealed on entering `Replacing`; from then on the run
    /// finishes or fails but is never cancelled.
    pub fn run(
        &self,
        probe: &dyn HostProbe,
        cancel: &CancelToken,
        diag: &DiagLog,
        emit: &mut dyn FnMut(WorkerEvent),
    ) -> Result<ReplaceReport, UpdateError> {
        let payload = self.prepare(probe, cancel, diag, emit)?;
        self.install(&payload, cancel, diag, emit)
    }

    /// Download, verify and extract; returns the located payload root.
    ///
    /// Nothing outside the workspace is touched, so every step here can be
    /// cancelled.
    pub fn prepare(
        &self,
        probe: &dyn HostProbe,
        cancel: &CancelToken,
        diag: &DiagLog,
        emit: &mut dyn FnMut(WorkerEvent),
    ) -> Result<PathBuf, UpdateError> {
        if !probe.network_available() {
            return Err(UpdateError::Network("host reports the network as unavailable".into()));
        }
        let fetcher = ArchiveFetcher::new(self.connect_timeout)?;
        let url = &self.manifest.download_url;
        status(
            diag,
            emit,
            UpdateState::Downloading,
            format!("downloading {} from {}", self.manifest.version, url),
        );
        if let Some(free) = probe.free_space(&self.target_dir)
            && let Some(size) = fetcher.content_length(url)
            && free < size.saturating_mul(FREE_SPACE_FACTOR)
        {
            return Err(UpdateError::DiskFull {
                path: self.target_dir.clone(),
                source: std::io::Error::other(format!(
                    "{} bytes free, package needs {} x {}",
                    free, size, FREE_SPACE_FACTOR
                )),
            });
        }
        let archive = self.archive_path();
        let written = fetcher.download(
            url,
            &archive,
            &mut |done, total| emit(WorkerEvent::Progress { done, total }),
            cancel,
        )?;
        diag.line("Downloading", &format!("{} bytes written to {}", written, archive.display()));
        self.unpack(cancel, diag, emit)
    }

    /// Verify and extract the archive already at [`Pipeline::archive_path`].
    pub fn unpack(
        &self,
        cancel: &CancelToken,
        diag: &DiagLog,
        emit: &mut dyn FnMut(WorkerEvent),
    ) -> Result<PathBuf, UpdateError> {
        let archive = self.archive_path();
        cancel.check()?;
        status(diag, emit, UpdateState::Verifying, "verifying package digest".into());
        match verify_package(
            &archive,
            self.manifest.file_hash_sha256.as_deref(),
            self.digest_policy,
        )? {
            Verified::Matched => diag.line("Verifying", "sha-256 matches the manifest"),
            Verified::Unchecked => {
                let msg = "WARNING: manifest carries no sha-256 digest; package integrity was NOT verified";
                warn!("{}", msg);
                status(diag, emit, UpdateState::Verifying, msg.into());
            }
        }

        cancel.check()?;
        status(diag, emit, UpdateState::Extracting, "extracting package".into());
        let root = extract(&archive, &self.extract_dir())?;
        let payload = locate(&root, &self.rules, &self.product_name);
        diag.line("Extracting", &format!("payload root {}", payload.display()));
        emit(WorkerEvent::PayloadLocated(payload.clone()));
        Ok(payload)
    }

    /// Seal `cancel`, announce `Replacing` and copy `payload` onto the target.
    pub fn install(
        &self,
        payload: &Path,
        cancel: &CancelToken,
        diag: &DiagLog,
        emit: &mut dyn FnMut(WorkerEvent),
    ) -> Result<ReplaceReport, UpdateError> {
        enter_replacing(
            cancel,
            diag,
            emit,
            format!("replacing files in {}", self.target_dir.display()),
        )?;
        self.copy_payload(payload, cancel, diag, emit)
    }

    /// The replacement itself; the caller has already entered `Replacing`.
    pub(super) fn copy_payload(
        &self,
        payload: &Path,
        cancel: &CancelToken,
        diag: &DiagLog,
        emit: &mut dyn FnMut(WorkerEvent),
    ) -> Result<ReplaceReport, UpdateError> {
        fs::create_dir_all(&self.target_dir)
            .map_err(|e| UpdateError::from_io(&self.target_dir, e))?;
        let report = FileReplacementEngine::new(&self.rules)
            .with_retry(self.retry)
            .apply(
                payload,
                &self.target_dir,
                &self.executable,
                &mut |done, total| {
                    emit(WorkerEvent::Progress {
                        done,
                        total: Some(total),
                    })
                },
                cancel,
            )?;

        let listed: Vec<String> = report
            .replaced
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        diag.line(
            "Replacing",
            &format!("replaced {} file(s): {}", listed.len(), listed.join(", ")),
        );
        if !report.skipped_protected.is_empty() {
            diag.line(
                "Replacing",
                &format!("kept {} protected file(s)", report.skipped_protected.len()),
            );
        }
        if let Some(m) = &report.marker {
            diag.line("Replacing", &format!("marker written: {}", m.display()));
        }
        Ok(report)
    }
}

/// Seal the token and announce `Replacing`; `Cancelled` if cancellation won.
pub(super) fn enter_replacing(
    cancel: &CancelToken,
    diag: &DiagLog,
    emit: &mut dyn FnMut(WorkerEvent),
    msg: String,
) -> Result<(), UpdateError> {
    if !cancel.seal() {
        return Err(UpdateError::Cancelled);
    }
    status(diag, emit, UpdateState::Replacing, msg);
    Ok(())
}

pub(super) fn status(diag: &DiagLog, emit: &mut dyn FnMut(WorkerEvent), state: UpdateState, msg: String) {
    diag.line(state.as_str(), &msg);
    emit(WorkerEvent::Status(state, msg));
}

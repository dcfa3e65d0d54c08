use std::fmt;
use std::path::PathBuf;

use crate::error::UpdateError;
use crate::replace::ReplaceReport;

/// Session states. `Failed` is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateState {
    Idle,
    CheckingManifest,
    AwaitingConsent,
    Downloading,
    Verifying,
    Extracting,
    Replacing,
    AwaitingRestart,
    Done,
    Failed,
}

impl UpdateState {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateState::Idle => "Idle",
            UpdateState::CheckingManifest => "CheckingManifest",
            UpdateState::AwaitingConsent => "AwaitingConsent",
            UpdateState::Downloading => "Downloading",
            UpdateState::Verifying => "Verifying",
            UpdateState::Extracting => "Extracting",
            UpdateState::Replacing => "Replacing",
            UpdateState::AwaitingRestart => "AwaitingRestart",
            UpdateState::Done => "Done",
            UpdateState::Failed => "Failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UpdateState::Done | UpdateState::Failed)
    }

    /// Up to and including `Extracting`; nothing installed has been touched yet.
    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            UpdateState::CheckingManifest
                | UpdateState::AwaitingConsent
                | UpdateState::Downloading
                | UpdateState::Verifying
                | UpdateState::Extracting
        )
    }

    /// Stages that run on the worker thread.
    pub fn is_background(self) -> bool {
        matches!(
            self,
            UpdateState::Downloading
                | UpdateState::Verifying
                | UpdateState::Extracting
                | UpdateState::Replacing
        )
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bookkeeping for one accepted update; owned by the coordinator.
#[derive(Debug, Clone)]
pub struct UpdateSession {
    pub id: String,
    pub state: UpdateState,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub temp_archive_path: Option<PathBuf>,
    pub temp_extract_dir: Option<PathBuf>,
    pub payload_root: Option<PathBuf>,
    pub last_error: Option<String>,
    pub cancelled: bool,
}

impl UpdateSession {
    pub(crate) fn new(id: String) -> Self {
        UpdateSession {
            id,
            state: UpdateState::AwaitingConsent,
            downloaded_bytes: 0,
            total_bytes: None,
            temp_archive_path: None,
            temp_extract_dir: None,
            payload_root: None,
            last_error: None,
            cancelled: false,
        }
    }
}

/// How a session ended (or paused, for `RestartRequired`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate,
    Declined,
    /// Every file was replaced in place; nothing waits on a restart.
    Installed(ReplaceReport),
    /// A marker was written next to the running executable.
    RestartRequired(ReplaceReport),
    /// The elevated helper did the work; it also launched the restart
    /// helper when a marker was produced.
    InstalledElevated { restart_scheduled: bool },
    /// The install dir was not writable; the new tree waits in `staging_dir`.
    Staged {
        staging_dir: PathBuf,
        report: ReplaceReport,
    },
}

impl UpdateOutcome {
    pub fn final_state(&self) -> UpdateState {
        match self {
            UpdateOutcome::RestartRequired(_)
            | UpdateOutcome::InstalledElevated {
                restart_scheduled: true,
            } => UpdateState::AwaitingRestart,
            _ => UpdateState::Done,
        }
    }

    pub fn report(&self) -> Option<&ReplaceReport> {
        match self {
            UpdateOutcome::Installed(r)
            | UpdateOutcome::RestartRequired(r)
            | UpdateOutcome::Staged { report: r, .. } => Some(r),
            _ => None,
        }
    }
}

/// Worker -> host messages. The worker never touches the session directly.
#[derive(Debug)]
pub enum WorkerEvent {
    Status(UpdateState, String),
    Progress { done: u64, total: Option<u64> },
    PayloadLocated(PathBuf),
    Finished(Result<UpdateOutcome, UpdateError>),
}

/// Result of [`shutdown`](super::UpdateCoordinator::shutdown).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    NoWorker,
    Joined,
    /// The timeout elapsed; the worker thread was left to finish on its own.
    StillFinishing,
}

/// Result of a manifest check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateCheck {
    UpToDate { current: String, remote: String },
    Available(crate::manifest::VersionManifest),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_window_ends_before_replacing() {
        assert!(UpdateState::Extracting.is_cancellable());
        assert!(!UpdateState::Replacing.is_cancellable());
        assert!(!UpdateState::AwaitingRestart.is_cancellable());
        assert!(!UpdateState::Idle.is_cancellable());
    }

    #[test]
    fn outcome_maps_to_final_state() {
        let r = ReplaceReport::default();
        assert_eq!(
            UpdateOutcome::RestartRequired(r.clone()).final_state(),
            UpdateState::AwaitingRestart
        );
        assert_eq!(UpdateOutcome::Installed(r).final_state(), UpdateState::Done);
        assert_eq!(
            UpdateOutcome::InstalledElevated {
                restart_scheduled: false
            }
            .final_state(),
            UpdateState::Done
        );
        assert_eq!(UpdateState::AwaitingRestart.to_string(), "AwaitingRestart");
    }
}

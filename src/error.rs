//! Error taxonomy shared by every update stage.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::coordinator::UpdateState;

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("network error: {0}")]
    Network(String),

    #[error("manifest could not be parsed: {0}")]
    ManifestParse(String),

    #[error("sha-256 mismatch (expected {expected}, got {actual})")]
    HashMismatch { expected: String, actual: String },

    #[error("archive is corrupt: {0}")]
    ArchiveCorrupt(String),

    #[error("archive rejected, entry {entry:?} {reason}")]
    PathTraversal { entry: String, reason: &'static str },

    #[error("incomplete payload for {}: expected {expected} bytes, got {actual}", path.display())]
    IncompletePayload {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("file is locked: {}", path.display())]
    FileLocked {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("permission denied: {}", path.display())]
    Permission {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("disk full while writing {}", path.display())]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not launch restart helper: {0}")]
    RestartLaunch(String),

    #[error("update cancelled")]
    Cancelled,

    #[error("cancellation refused: installed files are already being replaced")]
    CancelRefused,

    #[error("cannot {op} while {state}")]
    InvalidState { op: &'static str, state: UpdateState },

    #[error("i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl UpdateError {
    /// Classify an I/O error raised while touching `path`.
    ///
    /// Sharing violations and "text file busy" map to [`UpdateError::FileLocked`],
    /// `ENOSPC`/`ERROR_DISK_FULL` to [`UpdateError::DiskFull`].
    pub fn from_io(path: &Path, source: io::Error) -> Self {
        let path = path.to_path_buf();
        if cfg!(windows) {
            match source.raw_os_error() {
                // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION
                Some(32) | Some(33) => return UpdateError::FileLocked { path, source },
                // ERROR_HANDLE_DISK_FULL / ERROR_DISK_FULL
                Some(39) | Some(112) => return UpdateError::DiskFull { path, source },
                _ => {}
            }
        }
        match source.kind() {
            io::ErrorKind::PermissionDenied => UpdateError::Permission { path, source },
            io::ErrorKind::ResourceBusy | io::ErrorKind::ExecutableFileBusy => {
                UpdateError::FileLocked { path, source }
            }
            io::ErrorKind::StorageFull => UpdateError::DiskFull { path, source },
            _ => UpdateError::Io { path, source },
        }
    }

    /// Only lock and permission failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpdateError::FileLocked { .. } | UpdateError::Permission { .. }
        )
    }

    /// Short stable name used in status strings and the diag log.
    pub fn kind(&self) -> &'static str {
        match self {
            UpdateError::Network(_) => "NetworkError",
            UpdateError::ManifestParse(_) => "ManifestParseError",
            UpdateError::HashMismatch { .. } => "HashMismatchError",
            UpdateError::ArchiveCorrupt(_) => "ArchiveCorruptError",
            UpdateError::PathTraversal { .. } => "PathTraversalError",
            UpdateError::IncompletePayload { .. } => "IncompletePayloadError",
            UpdateError::FileLocked { .. } => "FileLockedError",
            UpdateError::Permission { .. } => "PermissionError",
            UpdateError::DiskFull { .. } => "DiskFullError",
            UpdateError::RestartLaunch(_) => "RestartLaunchError",
            UpdateError::Cancelled => "Cancelled",
            UpdateError::CancelRefused => "CancelRefused",
            UpdateError::InvalidState { .. } => "InvalidState",
            UpdateError::Io { .. } => "IoError",
            UpdateError::Config(_) => "ConfigError",
        }
    }
}

fn copy_io(e: &io::Error) -> io::Error {
    io::Error::new(e.kind(), e.to_string())
}

// io::Error is not Clone; copies keep the kind and the message.
impl Clone for UpdateError {
    fn clone(&self) -> Self {
        match self {
            UpdateError::Network(s) => UpdateError::Network(s.clone()),
            UpdateError::ManifestParse(s) => UpdateError::ManifestParse(s.clone()),
            UpdateError::HashMismatch { expected, actual } => UpdateError::HashMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            },
            UpdateError::ArchiveCorrupt(s) => UpdateError::ArchiveCorrupt(s.clone()),
            UpdateError::PathTraversal { entry, reason } => UpdateError::PathTraversal {
                entry: entry.clone(),
                reason: *reason,
            },
            UpdateError::IncompletePayload {
                path,
                expected,
                actual,
            } => UpdateError::IncompletePayload {
                path: path.clone(),
                expected: *expected,
                actual: *actual,
            },
            UpdateError::FileLocked { path, source } => UpdateError::FileLocked {
                path: path.clone(),
                source: copy_io(source),
            },
            UpdateError::Permission { path, source } => UpdateError::Permission {
                path: path.clone(),
                source: copy_io(source),
            },
            UpdateError::DiskFull { path, source } => UpdateError::DiskFull {
                path: path.clone(),
                source: copy_io(source),
            },
            UpdateError::RestartLaunch(s) => UpdateError::RestartLaunch(s.clone()),
            UpdateError::Cancelled => UpdateError::Cancelled,
            UpdateError::CancelRefused => UpdateError::CancelRefused,
            UpdateError::InvalidState { op, state } => UpdateError::InvalidState {
                op: *op,
                state: *state,
            },
            UpdateError::Io { path, source } => UpdateError::Io {
                path: path.clone(),
                source: copy_io(source),
            },
            UpdateError::Config(s) => UpdateError::Config(s.clone()),
        }
    }
}

impl From<reqwest::Error> for UpdateError {
    fn from(e: reqwest::Error) -> Self {
        UpdateError::Network(e.to_string())
    }
}

impl From<zip::result::ZipError> for UpdateError {
    fn from(e: zip::result::ZipError) -> Self {
        UpdateError::ArchiveCorrupt(e.to_string())
    }
}

/// What the user sees when a session fails: the stage, the error and
/// where the diagnostic log lives.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub state: UpdateState,
    pub error: UpdateError,
    pub diag_log: PathBuf,
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "update failed while {} ({}): {}\ndiagnostic log: {}",
            self.state,
            self.error.kind(),
            self.error,
            self.diag_log.display()
        )
    }
}

impl std::error::Error for FailureReport {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_is_retryable() {
        let e = UpdateError::from_io(
            Path::new("/x"),
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert_eq!(e.kind(), "PermissionError");
        assert!(e.is_retryable());
    }

    #[cfg(unix)]
    #[test]
    fn enospc_is_disk_full_and_fatal() {
        let e = UpdateError::from_io(Path::new("/x"), io::Error::from_raw_os_error(28));
        assert_eq!(e.kind(), "DiskFullError");
        assert!(!e.is_retryable());
    }

    #[cfg(unix)]
    #[test]
    fn text_file_busy_is_locked() {
        let e = UpdateError::from_io(Path::new("/x"), io::Error::from_raw_os_error(26));
        assert!(matches!(e, UpdateError::FileLocked { .. }));
    }

    #[test]
    fn clone_keeps_kind_and_message() {
        let e = UpdateError::from_io(
            Path::new("/x"),
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        let c = e.clone();
        assert_eq!(c.kind(), "PermissionError");
        assert_eq!(c.to_string(), e.to_string());
    }

    #[test]
    fn not_found_is_plain_io() {
        let e = UpdateError::from_io(Path::new("/x"), io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(e.kind(), "IoError");
        assert!(!e.is_retryable());
    }

    #[test]
    fn failure_report_names_diag_log() {
        let r = FailureReport {
            state: UpdateState::Verifying,
            error: UpdateError::HashMismatch {
                expected: "aa".into(),
                actual: "bb".into(),
            },
            diag_log: PathBuf::from("/tmp/updraft_update_1.log"),
        };
        let s = r.to_string();
        assert!(s.contains("Verifying"));
        assert!(s.contains("HashMismatchError"));
        assert!(s.contains("/tmp/updraft_update_1.log"));
    }
}

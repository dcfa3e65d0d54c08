//! Append-only diagnostic log written during an update attempt.
//!
//! Each line is written straight to the file (no buffering), so a crash in the
//! middle of an update still leaves every step on disk for the next launch.

use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::paths::diag_log_path;

#[derive(Debug)]
pub struct DiagLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl DiagLog {
    /// Open (or create) the log for the current process.
    pub fn for_current_process() -> Self {
        Self::open(diag_log_path(std::process::id()))
    }

    /// Open `path` for appending. Failure to open only disables the file
    /// sink; lines are still emitted through `tracing`.
    pub fn open(path: PathBuf) -> Self {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let file = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => Some(f),
            Err(e) => {
                warn!("diag log unavailable at {}: {}", path.display(), e);
                None
            }
        };
        DiagLog {
            path,
            file: Mutex::new(file),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one timestamped line tagged with `step`.
    pub fn line(&self, step: &str, message: &str) {
        info!(step, "{}", message);
        let stamp = Local::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, false);
        let text = format!("{} [{}] {}\n", stamp, step, message.replace('\n', " | "));
        if let Ok(mut guard) = self.file.lock()
            && let Some(f) = guard.as_mut()
        {
            let _ = f.write_all(text.as_bytes());
        }
    }
}

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

use crate::error::UpdateError;

/// Trial write into `dir`; the probe file is removed on drop.
pub fn probe_writable(dir: &Path) -> bool {
    match tempfile::Builder::new()
        .prefix(".updraft_probe")
        .tempfile_in(dir)
    {
        Ok(_) => true,
        Err(e) => {
            info!("install dir {} not writable: {}", dir.display(), e);
            false
        }
    }
}

/// Arguments of the hidden `apply` subcommand run with elevated rights.
#[derive(Debug, Clone)]
pub struct ElevatedRequest {
    pub manifest_file: PathBuf,
    pub install_dir: PathBuf,
    pub executable: PathBuf,
    pub host_pid: u32,
    /// Package already downloaded by the unprivileged side; the elevated run
    /// verifies it again before extracting. Without it, it downloads itself.
    pub archive: Option<PathBuf>,
}

impl ElevatedRequest {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "apply".to_string(),
            "--manifest".to_string(),
            self.manifest_file.to_string_lossy().into_owned(),
            "--install-dir".to_string(),
            self.install_dir.to_string_lossy().into_owned(),
            "--executable".to_string(),
            self.executable.to_string_lossy().into_owned(),
            "--host-pid".to_string(),
            self.host_pid.to_string(),
        ];
        if let Some(a) = &self.archive {
            args.push("--archive".to_string());
            args.push(a.to_string_lossy().into_owned());
        }
        args
    }
}

/// Runs the download/extract/replace sequence with higher privileges.
pub trait Elevator: Send + Sync {
    /// Block until the elevated run finishes. `Err` covers both a declined
    /// prompt and a failed run.
    fn run_elevated(&self, req: &ElevatedRequest) -> Result<(), UpdateError>;
}

/// Re-runs `program` through pkexec/sudo, or `Start-Process -Verb RunAs` on Windows.
#[derive(Debug, Clone)]
pub struct SystemElevator {
    program: PathBuf,
    config: Option<PathBuf>,
}

impl SystemElevator {
    pub fn new(program: PathBuf) -> Self {
        SystemElevator {
            program,
            config: None,
        }
    }

    /// Forward `--config <path>`; an elevated user has a different config home.
    pub fn with_config(mut self, config: &Path) -> Self {
        self.config = Some(config.to_path_buf());
        self
    }

    fn command_args(&self, req: &ElevatedRequest) -> Vec<String> {
        let mut args = req.args();
        if let Some(c) = &self.config {
            args.push("--config".to_string());
            args.push(c.to_string_lossy().into_owned());
        }
        args
    }

    /// Elevate the binary that is currently running.
    pub fn current() -> Result<Self, UpdateError> {
        let exe = std::env::current_exe()
            .map_err(|e| UpdateError::from_io(Path::new("current_exe"), e))?;
        Ok(Self::new(exe))
    }
}

fn failed(req: &ElevatedRequest, what: String) -> UpdateError {
    UpdateError::Permission {
        path: req.install_dir.clone(),
        source: io::Error::other(what),
    }
}

#[cfg(not(windows))]
impl Elevator for SystemElevator {
    fn run_elevated(&self, req: &ElevatedRequest) -> Result<(), UpdateError> {
        let args = self.command_args(req);
        for tool in ["pkexec", "sudo"] {
            info!("requesting elevation via {}", tool);
            match Command::new(tool).arg(&self.program).args(&args).status() {
                Ok(st) if st.success() => return Ok(()),
                Ok(st) => return Err(failed(req, format!("{} exited with {}", tool, st))),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!("{} not available", tool);
                    continue;
                }
                Err(e) => return Err(failed(req, format!("{}: {}", tool, e))),
            }
        }
        Err(failed(req, "no elevation tool (pkexec, sudo) found".to_string()))
    }
}

#[cfg(windows)]
impl Elevator for SystemElevator {
    fn run_elevated(&self, req: &ElevatedRequest) -> Result<(), UpdateError> {
        fn ps(s: &str) -> String {
            format!("'{}'", s.replace('\'', "''"))
        }
        let arg_list = self
            .command_args(req)
            .iter()
            .map(|a| ps(&format!("\"{}\"", a)))
            .collect::<Vec<_>>()
            .join(",");
        let script = format!(
            "$p = Start-Process -FilePath {} -ArgumentList {} -Verb RunAs -Wait -PassThru; exit $p.ExitCode",
            ps(&self.program.to_string_lossy()),
            arg_list
        );
        info!("requesting elevation via UAC");
        let st = Command::new("powershell")
            .args(["-NoProfile", "-NonInteractive", "-Command", &script])
            .status()
            .map_err(|e| failed(req, format!("powershell: {}", e)))?;
        if st.success() {
            Ok(())
        } else {
            Err(failed(req, format!("elevated run exited with {}", st)))
        }
    }
}

//! Hand the marker file to a detached helper that outlives the host.

pub mod elevate;
pub mod script;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::info;

use crate::error::UpdateError;
use crate::paths::{helper_script_path, marker_path};

pub use elevate::{ElevatedRequest, Elevator, SystemElevator, probe_writable};
pub use script::RestartPlan;

/// Write the helper script into the install dir and make it runnable.
pub fn write_helper(plan: &RestartPlan) -> Result<PathBuf, UpdateError> {
    let path = helper_script_path(&plan.install_dir);
    fs::write(&path, script::render(plan)).map_err(|e| UpdateError::from_io(&path, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .map_err(|e| UpdateError::from_io(&path, e))?;
    }
    Ok(path)
}

/// Command that runs `script` with no console and no inherited stdio, in its
/// own process group so the host's exit does not take it down.
pub fn helper_command(script: &Path) -> Command {
    #[cfg(windows)]
    let mut cmd = {
        use std::os::windows::process::CommandExt;
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        let mut c = Command::new("cmd");
        c.arg("/C")
            .arg(script)
            .creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
        c
    };
    #[cfg(not(windows))]
    let mut cmd = {
        use std::os::unix::process::CommandExt;
        let mut c = Command::new("/bin/sh");
        c.arg(script).process_group(0);
        c
    };
    if let Some(dir) = script.parent() {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd
}

/// Write and launch the helper, then return its path. The caller is
/// expected to exit promptly afterwards.
///
/// # Errors
/// `RestartLaunch` if there is no marker to swap or the helper cannot be
/// written or spawned. The marker is left in place either way.
pub fn schedule_restart(plan: &RestartPlan) -> Result<PathBuf, UpdateError> {
    if !plan.marker.is_file() {
        return Err(UpdateError::RestartLaunch(format!(
            "marker file missing: {}",
            plan.marker.display()
        )));
    }
    let script = write_helper(plan)
        .map_err(|e| UpdateError::RestartLaunch(format!("writing helper: {}", e)))?;
    let child = helper_command(&script).spawn().map_err(|e| {
        UpdateError::RestartLaunch(format!("spawning {}: {}", script.display(), e))
    })?;
    info!(
        helper = %script.display(),
        helper_pid = child.id(),
        host_pid = plan.host_pid,
        "restart helper launched"
    );
    Ok(script)
}

/// A marker left next to `exe` by a swap that never happened.
pub fn stranded_marker(exe: &Path) -> Option<PathBuf> {
    let m = marker_path(exe);
    m.is_file().then_some(m)
}

/// A helper script that never got to delete itself.
pub fn leftover_helper(install_dir: &Path) -> Option<PathBuf> {
    let p = helper_script_path(install_dir);
    p.is_file().then_some(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn refuses_without_marker() {
        let td = tempdir().unwrap();
        let plan = RestartPlan::new(
            td.path(),
            &td.path().join("app"),
            &td.path().join("app.new"),
            1,
        );
        let err = schedule_restart(&plan).unwrap_err();
        assert_eq!(err.kind(), "RestartLaunchError");
        assert!(leftover_helper(td.path()).is_none());
    }

    #[test]
    fn detects_stranded_marker_and_leftover_helper() {
        let td = tempdir().unwrap();
        let exe = td.path().join("app");
        assert!(stranded_marker(&exe).is_none());
        fs::write(td.path().join("app.new"), b"x").unwrap();
        assert_eq!(stranded_marker(&exe), Some(td.path().join("app.new")));

        let plan = RestartPlan::new(td.path(), &exe, &td.path().join("app.new"), 1);
        let script = write_helper(&plan).unwrap();
        assert_eq!(leftover_helper(td.path()), Some(script));
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::process::Command;
        use std::time::Duration;

        fn install_with_marker() -> (tempfile::TempDir, PathBuf, PathBuf) {
            let td = tempdir().unwrap();
            let exe = td.path().join("app");
            let marker = td.path().join("app.new");
            fs::write(&exe, "#!/bin/sh\nexit 0\n").unwrap();
            let flag = td.path().join("relaunched");
            fs::write(
                &marker,
                format!("#!/bin/sh\ntouch '{}'\n", flag.display()),
            )
            .unwrap();
            (td, exe, marker)
        }

        fn wait_for(p: &Path) -> bool {
            for _ in 0..50 {
                if p.exists() {
                    return true;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            false
        }

        #[test]
        fn helper_swaps_relaunches_and_deletes_itself() {
            let (td, exe, marker) = install_with_marker();
            let mut gone = Command::new("true").spawn().unwrap();
            let pid = gone.id();
            gone.wait().unwrap();

            let log = td.path().join("diag.log");
            let plan = RestartPlan::new(td.path(), &exe, &marker, pid).with_diag_log(&log);
            let script = write_helper(&plan).unwrap();
            let st = helper_command(&script).status().unwrap();

            assert!(st.success());
            assert!(!marker.exists());
            assert!(!script.exists());
            assert!(wait_for(&td.path().join("relaunched")));
            assert!(fs::read_to_string(&log).unwrap().contains("[restart] executable replaced"));
        }

        #[test]
        fn helper_kills_host_that_outstays_its_wait() {
            let (td, exe, marker) = install_with_marker();
            let mut host = Command::new("sleep").arg("30").spawn().unwrap();

            let mut plan = RestartPlan::new(td.path(), &exe, &marker, host.id());
            plan.host_wait_secs = 1;
            let script = write_helper(&plan).unwrap();
            let st = helper_command(&script).status().unwrap();
            let host_status = host.wait().unwrap();

            assert!(st.success());
            assert!(!host_status.success());
            assert!(!marker.exists());
        }

        #[test]
        fn helper_fails_and_keeps_itself_when_swap_is_impossible() {
            let td = tempdir().unwrap();
            let exe = td.path().join("missing_dir").join("app");
            let marker = td.path().join("app.new");
            fs::write(&marker, b"new").unwrap();
            let mut gone = Command::new("true").spawn().unwrap();
            let pid = gone.id();
            gone.wait().unwrap();

            let plan = RestartPlan::new(td.path(), &exe, &marker, pid);
            let script = write_helper(&plan).unwrap();
            let st = helper_command(&script).status().unwrap();

            assert_eq!(st.code(), Some(1));
            assert!(marker.exists());
            assert!(script.exists());
        }
    }
}

use anyhow::Result;
use std::{
    env,
    path::{Path, PathBuf},
};

/// Suffix appended to the running executable's file name for the marker file.
pub const MARKER_SUFFIX: &str = ".new";

/// Prefix of the timestamped backup directories created under the install dir.
pub const BACKUP_PREFIX: &str = "backup_before_update_";

#[cfg(windows)]
const HELPER_SCRIPT: &str = "update_restart.bat";
#[cfg(not(windows))]
const HELPER_SCRIPT: &str = "update_restart.sh";

/// Resolve the updraft configuration directory.
///
/// Uses `$XDG_CONFIG_HOME/updraft`, falling back to `$HOME/.config/updraft`.
pub fn updraft_home() -> Result<PathBuf> {
    let xdg = env::var_os("XDG_CONFIG_HOME");
    let base = xdg
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(env::var_os("HOME").unwrap_or_default()).join(".config"));
    Ok(base.join("updraft"))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(updraft_home()?.join("config.toml"))
}

/// Append-only diagnostic log for one process, under the OS temp dir.
pub fn diag_log_path(pid: u32) -> PathBuf {
    env::temp_dir().join(format!("updraft_update_{}.log", pid))
}

/// Sibling of `exe` that receives the new executable's bytes.
///
/// The suffix is appended rather than swapped in, so `app.exe` becomes
/// `app.exe.new`.
pub fn marker_path(exe: &Path) -> PathBuf {
    let mut name = exe.file_name().unwrap_or_default().to_os_string();
    name.push(MARKER_SUFFIX);
    exe.with_file_name(name)
}

pub fn backup_dir(install_dir: &Path, timestamp: &str) -> PathBuf {
    install_dir.join(format!("{}{}", BACKUP_PREFIX, timestamp))
}

pub fn helper_script_path(install_dir: &Path) -> PathBuf {
    install_dir.join(HELPER_SCRIPT)
}

/// Where the degraded path leaves a fully replaced copy of the install tree.
pub fn staging_dir(version: &str) -> PathBuf {
    let safe: String = version
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
        .collect();
    env::temp_dir().join(format!("updraft_staged_{}", safe))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn marker_path_appends_suffix() {
        assert_eq!(
            marker_path(Path::new("/opt/app/app.exe")),
            PathBuf::from("/opt/app/app.exe.new")
        );
        assert_eq!(
            marker_path(Path::new("/opt/app/app")),
            PathBuf::from("/opt/app/app.new")
        );
    }

    #[test]
    fn diag_log_is_per_pid() {
        let p = diag_log_path(4242);
        assert!(p.starts_with(env::temp_dir()));
        assert_eq!(p.file_name().unwrap(), "updraft_update_4242.log");
    }

    #[test]
    fn staging_dir_sanitizes_version() {
        let p = staging_dir("2.8.0/../x");
        assert_eq!(p.file_name().unwrap(), "updraft_staged_2.8.0_.._x");
    }

    #[test]
    #[serial]
    fn home_prefers_xdg_config_home() {
        let td = tempfile::tempdir().unwrap();
        let old = env::var_os("XDG_CONFIG_HOME");
        unsafe { env::set_var("XDG_CONFIG_HOME", td.path()) };
        let got = config_path().unwrap();
        match old {
            Some(v) => unsafe { env::set_var("XDG_CONFIG_HOME", v) },
            None => unsafe { env::remove_var("XDG_CONFIG_HOME") },
        }
        assert_eq!(got, td.path().join("updraft").join("config.toml"));
    }
}

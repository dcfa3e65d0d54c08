use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::paths::{BACKUP_PREFIX, backup_dir};
use crate::rules::RuleTable;

/// Protected files currently present under `install_dir`, relative to it.
///
/// Earlier backup directories are not descended into.
pub fn protected_files(install_dir: &Path, rules: &RuleTable) -> Vec<PathBuf> {
    WalkDir::new(install_dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir() && e.file_name().to_string_lossy().starts_with(BACKUP_PREFIX))
        })
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.path().strip_prefix(install_dir).ok().map(Path::to_path_buf))
        .filter(|rel| rules.is_protected(rel))
        .collect()
}

/// Copy every protected file into one fresh `backup_before_update_<ts>` dir.
///
/// Best effort: failures are logged and skipped. Returns the directory only
/// if at least one file landed in it.
pub fn backup_protected(install_dir: &Path, rules: &RuleTable, timestamp: &str) -> Option<PathBuf> {
    let files = protected_files(install_dir, rules);
    if files.is_empty() {
        return None;
    }

    let mut dir = backup_dir(install_dir, timestamp);
    let mut n = 1;
    while dir.exists() {
        dir = backup_dir(install_dir, &format!("{}_{}", timestamp, n));
        n += 1;
    }

    let mut copied = 0;
    for rel in &files {
        let src = install_dir.join(rel);
        let dest = dir.join(rel);
        let res = dest
            .parent()
            .map(fs::create_dir_all)
            .unwrap_or(Ok(()))
            .and_then(|_| fs::copy(&src, &dest));
        match res {
            Ok(_) => {
                info!("backed up {} -> {}", src.display(), dest.display());
                copied += 1;
            }
            Err(e) => warn!("backup of {} failed: {}", src.display(), e),
        }
    }

    if copied == 0 {
        let _ = fs::remove_dir_all(&dir);
        return None;
    }
    Some(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn backs_up_only_protected_files() {
        let td = tempdir().unwrap();
        let install = td.path();
        fs::write(install.join("config.ini"), b"[a]").unwrap();
        fs::write(install.join("app"), b"bin").unwrap();
        fs::create_dir_all(install.join("data")).unwrap();
        fs::write(install.join("data/my_user_sheet.csv"), b"1,2").unwrap();

        let rules = RuleTable::for_product("app");
        let dir = backup_protected(install, &rules, "20261019_101500").unwrap();

        assert_eq!(dir, install.join("backup_before_update_20261019_101500"));
        assert_eq!(fs::read(dir.join("config.ini")).unwrap(), b"[a]");
        assert_eq!(fs::read(dir.join("data/my_user_sheet.csv")).unwrap(), b"1,2");
        assert!(!dir.join("app").exists());
    }

    #[test]
    fn no_protected_files_means_no_directory() {
        let td = tempdir().unwrap();
        fs::write(td.path().join("app"), b"bin").unwrap();
        let rules = RuleTable::for_product("app");
        assert!(backup_protected(td.path(), &rules, "ts").is_none());
        assert_eq!(fs::read_dir(td.path()).unwrap().count(), 1);
    }

    #[test]
    fn same_timestamp_gets_a_fresh_directory_and_old_backups_are_skipped() {
        let td = tempdir().unwrap();
        fs::write(td.path().join("config.ini"), b"v1").unwrap();
        let rules = RuleTable::for_product("app");

        let first = backup_protected(td.path(), &rules, "ts").unwrap();
        fs::write(td.path().join("config.ini"), b"v2").unwrap();
        let second = backup_protected(td.path(), &rules, "ts").unwrap();

        assert_ne!(first, second);
        assert_eq!(fs::read(first.join("config.ini")).unwrap(), b"v1");
        assert_eq!(fs::read(second.join("config.ini")).unwrap(), b"v2");
        assert!(!second.join("backup_before_update_ts").exists());
    }
}

//! `updraft status`: what earlier update attempts left in the install dir.

use anyhow::Result;
use colored::Colorize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::UpdaterOptions;
use crate::paths::{BACKUP_PREFIX, diag_log_path};
use crate::restart::{leftover_helper, stranded_marker};

/// Leftovers found next to one installation.
#[derive(Debug, Default, PartialEq)]
pub struct InstallStatus {
    pub stranded_marker: Option<PathBuf>,
    pub leftover_helper: Option<PathBuf>,
    pub backups: Vec<PathBuf>,
}

/// Timestamped backup directories, oldest first.
pub fn list_backups(install_dir: &Path) -> Vec<PathBuf> {
    let Ok(rd) = fs::read_dir(install_dir) else {
        return Vec::new();
    };
    let mut out: Vec<PathBuf> = rd
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter(|e| e.file_name().to_string_lossy().starts_with(BACKUP_PREFIX))
        .map(|e| e.path())
        .collect();
    out.sort();
    out
}

pub fn inspect(install_dir: &Path, executable: &Path) -> InstallStatus {
    InstallStatus {
        stranded_marker: stranded_marker(executable),
        leftover_helper: leftover_helper(install_dir),
        backups: list_backups(install_dir),
    }
}

pub fn cmd_status(opts: UpdaterOptions) -> Result<()> {
    let st = inspect(&opts.install_dir, &opts.executable);
    println!("{} {}", "version:   ".bold(), opts.current_version);
    println!("{} {}", "install:   ".bold(), opts.install_dir.display());
    println!("{} {}", "executable:".bold(), opts.executable.display());
    println!(
        "{} {}",
        "diag log:  ".bold(),
        diag_log_path(std::process::id()).display()
    );

    match &st.stranded_marker {
        Some(m) => println!(
            "{} {} (the swap after the last update did not happen)",
            "marker:    ".bold(),
            m.display().to_string().yellow()
        ),
        None => println!("{} {}", "marker:    ".bold(), "none".green()),
    }
    if let Some(h) = &st.leftover_helper {
        println!(
            "{} {} (did not finish)",
            "helper:    ".bold(),
            h.display().to_string().yellow()
        );
    }
    if st.backups.is_empty() {
        println!("{} none", "backups:   ".bold());
    } else {
        println!("{}", "backups:".bold());
        for b in &st.backups {
            println!("  {}", b.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::{backup_dir, helper_script_path, marker_path};
    use tempfile::tempdir;

    #[test]
    fn clean_install_reports_nothing() {
        let td = tempdir().unwrap();
        let exe = td.path().join("app");
        fs::write(&exe, b"x").unwrap();
        assert_eq!(inspect(td.path(), &exe), InstallStatus::default());
    }

    #[test]
    fn finds_marker_helper_and_sorted_backups() {
        let td = tempdir().unwrap();
        let exe = td.path().join("app");
        fs::write(&exe, b"x").unwrap();
        fs::write(marker_path(&exe), b"y").unwrap();
        fs::write(helper_script_path(td.path()), b"#!/bin/sh").unwrap();
        let newer = backup_dir(td.path(), "20261002_090000");
        let older = backup_dir(td.path(), "20260901_120000");
        fs::create_dir_all(&newer).unwrap();
        fs::create_dir_all(&older).unwrap();
        fs::create_dir_all(td.path().join("lib")).unwrap();

        let st = inspect(td.path(), &exe);
        assert_eq!(st.stranded_marker, Some(marker_path(&exe)));
        assert_eq!(st.leftover_helper, Some(helper_script_path(td.path())));
        assert_eq!(st.backups, vec![older, newer]);
    }
}

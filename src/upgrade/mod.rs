use anyhow::{Context, Result, anyhow};
use colored::Colorize;
use indicatif::ProgressBar;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use std::{env, fs, time::Duration};
use tracing::warn;

use crate::cancel::CancelToken;
use crate::config::{Config, UpdaterOptions, load_config};
use crate::coordinator::{
    Pipeline, SystemProbe, UpdateCheck, UpdateCoordinator, UpdateObserver, UpdateOutcome,
    UpdateState, WorkerEvent,
};
use crate::diag::DiagLog;
use crate::error::UpdateError;
use crate::manifest::{ManifestClient, VersionManifest, parse_manifest};
use crate::progress::{BarObserver, err_style, ok_style, spinner};
use crate::restart::{RestartPlan, SystemElevator, leftover_helper, schedule_restart, stranded_marker};

/// How often the CLI drains worker events while an update runs.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Resolve options from `config` against the running binary.
pub fn options_from_config(config: &Path) -> Result<UpdaterOptions> {
    let cfg = load_config(config)?;
    let exe = env::current_exe().context("cannot locate the running executable")?;
    cfg.into_options(env!("CARGO_PKG_VERSION"), &exe)
}

/// Print the changelog of `m` and whether it is mandatory for `current`.
fn describe(m: &VersionManifest, current: &str) {
    println!("{} {}", "current:".bold(), current);
    println!("{} {} ({})", "latest: ".bold(), m.version.green(), m.release_date);
    if m.is_mandatory_for(current) {
        println!(
            "{}",
            format!(
                "this release requires at least {}; updating is mandatory",
                m.minimum_required_version
            )
            .yellow()
        );
    }
    println!("\n{}", m.latest_changes());
}

/// Check whether a newer version is published.
///
/// Prints current/remote versions and the remote changelog; never downloads.
pub fn cmd_check(opts: UpdaterOptions) -> Result<()> {
    let pb = spinner("fetching update manifest…");
    let client = ManifestClient::from_options(&opts)?;
    let manifest = match client.fetch(&opts.manifest_url) {
        Ok(m) => m,
        Err(e) => {
            pb.set_style(err_style());
            pb.finish_with_message(format!("{} ({})", e, e.kind()));
            return Err(e).context("failed to fetch the update manifest");
        }
    };

    pb.set_style(ok_style());
    if client.is_newer(&manifest) {
        pb.finish_with_message(format!("update available: {}", manifest.version));
        describe(&manifest, client.current_version());
    } else {
        pb.finish_with_message(format!(
            "already up to date ({})",
            client.current_version()
        ));
    }
    Ok(())
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

/// Warn about a swap that did not complete after the last update.
pub fn report_leftovers(opts: &UpdaterOptions) {
    if let Some(m) = stranded_marker(&opts.executable) {
        eprintln!(
            "{} the last update left {} behind; the new executable was never swapped in",
            "warning:".yellow().bold(),
            m.display()
        );
    }
    if let Some(h) = leftover_helper(&opts.install_dir) {
        eprintln!(
            "{} restart helper {} did not finish; see the diagnostic log",
            "warning:".yellow().bold(),
            h.display()
        );
    }
}

fn finish_failed(pb: &ProgressBar, coord: &UpdateCoordinator) -> anyhow::Error {
    pb.set_style(err_style());
    match coord.failure() {
        Some(report) => {
            pb.finish_with_message(format!("{} ({})", report.error, report.error.kind()));
            anyhow::Error::new(report.clone())
        }
        None => {
            pb.finish_with_message("update failed");
            anyhow!("update failed in state {}", coord.state())
        }
    }
}

/// Update the configured application to the latest published version.
///
/// Process:
/// 1. Report a stranded marker or helper left by a previous update.
/// 2. Fetch the manifest; stop if the running version is current.
/// 3. Show the changelog and ask for consent (skipped by `--yes`).
/// 4. If the install dir is not writable, offer to elevate.
/// 5. Run download → verify → extract → replace on the worker thread.
/// 6. If the running executable was replaced through a marker, launch the
///    restart helper and return so the process can exit.
pub fn cmd_update(
    opts: UpdaterOptions,
    config: &Path,
    assume_yes: bool,
    allow_elevation: bool,
) -> Result<()> {
    report_leftovers(&opts);

    let pb = spinner("checking for updates…");
    let elevator = SystemElevator::current()?.with_config(config);
    let mut coord = UpdateCoordinator::new(opts)?
        .with_observer(Box::new(BarObserver::new(pb.clone())))
        .with_probe(Arc::new(SystemProbe))
        .with_elevator(Arc::new(elevator));

    let manifest = match coord.check() {
        Ok(UpdateCheck::UpToDate { current, .. }) => {
            pb.set_style(ok_style());
            pb.finish_with_message(format!("already up to date ({})", current));
            return Ok(());
        }
        Ok(UpdateCheck::Available(m)) => m,
        Err(_) => return Err(finish_failed(&pb, &coord)),
    };
    let current = coord.options().current_version.clone();
    pb.suspend(|| describe(&manifest, &current));

    if !assume_yes && !pb.suspend(|| confirm(&format!("Install version {}?", manifest.version)))? {
        coord.decline()?;
        pb.set_style(ok_style());
        pb.finish_with_message("update declined");
        return Ok(());
    }

    let mut elevate = false;
    if coord.requires_elevation() {
        let dir = coord.options().install_dir.display().to_string();
        if allow_elevation {
            elevate = assume_yes
                || pb.suspend(|| {
                    confirm(&format!(
                        "{} is not writable. Retry with administrator rights?",
                        dir
                    ))
                })?;
        }
        if !elevate {
            pb.suspend(|| {
                eprintln!(
                    "{} {} is not writable; the update will be staged in a temporary folder",
                    "warning:".yellow().bold(),
                    dir
                )
            });
        }
    }

    coord.accept(elevate)?;
    let state = loop {
        let s = coord.wait(POLL_INTERVAL);
        if s.is_terminal() || s == UpdateState::AwaitingRestart {
            break s;
        }
    };
    if state == UpdateState::Failed {
        return Err(finish_failed(&pb, &coord));
    }

    let version = manifest.version;
    let staged = match coord.outcome() {
        Some(UpdateOutcome::Staged { staging_dir, .. }) => Some(staging_dir.clone()),
        _ => None,
    };
    if state == UpdateState::AwaitingRestart {
        if coord.restart().is_err() {
            return Err(finish_failed(&pb, &coord));
        }
        pb.set_style(ok_style());
        pb.finish_with_message(format!("updated to {}; restarting…", version));
        return Ok(());
    }

    pb.set_style(ok_style());
    match staged {
        Some(dir) => pb.finish_with_message(format!(
            "version {} staged in {}; copy it over {} with administrator rights",
            version,
            dir.display(),
            coord.options().install_dir.display()
        )),
        None => pb.finish_with_message(format!("updated to {}", version)),
    }
    Ok(())
}

/// Options for the elevated `apply` run.
///
/// The config is optional there: the elevated user may not be able to read
/// it, in which case the rules come from the executable's name.
pub fn apply_options(
    config: Option<Config>,
    install_dir: &Path,
    executable: &Path,
) -> Result<UpdaterOptions> {
    let cfg = match config {
        Some(c) => c,
        None => Config {
            product_name: executable
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "updraft".to_string()),
            ..Config::default()
        },
    };
    let mut opts = cfg.into_options(env!("CARGO_PKG_VERSION"), executable)?;
    opts.install_dir = install_dir.to_path_buf();
    opts.executable = executable.to_path_buf();
    Ok(opts)
}

/// Elevated helper entry point: install an already accepted manifest.
///
/// Runs every stage synchronously. With `archive`, the package downloaded by
/// the unprivileged side is copied into this run's own workspace and verified
/// again instead of being downloaded. When the running executable got a
/// marker and `host_pid` is known, the restart helper is launched from here
/// so it runs with the same rights.
pub fn cmd_apply(
    opts: UpdaterOptions,
    manifest_file: &Path,
    archive: Option<&Path>,
    host_pid: Option<u32>,
) -> Result<()> {
    let body = fs::read(manifest_file)
        .with_context(|| format!("cannot read manifest: {}", manifest_file.display()))?;
    let manifest = parse_manifest(&body, opts.allow_insecure).context("invalid manifest file")?;
    let workspace = tempfile::Builder::new()
        .prefix("updraft_apply_")
        .tempdir()
        .context("cannot create a temporary workspace")?;
    let pipeline = Pipeline::new(&opts, manifest, workspace.path());
    let diag = DiagLog::for_current_process();

    let pb = spinner("applying update…");
    let mut obs = BarObserver::new(pb.clone());
    let mut emit = |ev: WorkerEvent| match ev {
        WorkerEvent::Status(s, m) => obs.on_status(s, &m),
        WorkerEvent::Progress { done, total } => obs.on_progress(done, total),
        _ => {}
    };
    let cancel = CancelToken::new();
    let result = match archive {
        Some(a) => fs::copy(a, pipeline.archive_path())
            .map_err(|e| UpdateError::from_io(a, e))
            .and_then(|_| pipeline.unpack(&cancel, &diag, &mut emit))
            .and_then(|payload| pipeline.install(&payload, &cancel, &diag, &mut emit)),
        None => pipeline.run(&SystemProbe, &cancel, &diag, &mut emit),
    };
    let report = match result {
        Ok(r) => r,
        Err(e) => {
            pb.set_style(err_style());
            pb.finish_with_message(format!("{} ({})", e, e.kind()));
            return Err(e).with_context(|| format!("diagnostic log: {}", diag.path().display()));
        }
    };

    if let (Some(marker), Some(pid)) = (&report.marker, host_pid) {
        let plan = RestartPlan::new(&opts.install_dir, &opts.executable, marker, pid)
            .with_diag_log(diag.path());
        schedule_restart(&plan).context("failed to launch the restart helper")?;
    } else if report.marker.is_some() {
        warn!("marker written but no host pid given; the swap happens on the next restart helper run");
    }
    pb.set_style(ok_style());
    pb.finish_with_message(format!("{} file(s) replaced", report.replaced.len()));
    Ok(())
}

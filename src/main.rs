//! # updraft
//!
//! **updraft** keeps an installed application up to date.
//!
//! Features:
//! - `updraft check` compares the running version with the remote manifest
//! - `updraft update` downloads, verifies and installs the latest release
//! - `updraft status` reports leftovers of earlier updates (markers, backups)
//!
//! Settings live in `$XDG_CONFIG_HOME/updraft/config.toml` unless `--config`
//! points elsewhere. Set `UPDRAFT_LOG` to tune log output.
//!
//! This CLI is built with [clap](https://docs.rs/clap).

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use updraft::{
    apply_options, cmd_apply, cmd_check, cmd_status, cmd_update, config_path, load_config,
    options_from_config,
};

/// Command-line interface definition.
#[derive(Parser, Debug)]
#[command(
    name = "updraft",
    version,
    about = "updraft - self-update for installed applications",
    arg_required_else_help = true
)]
struct Cli {
    /// Path to config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Check whether a newer version is published
    Check,
    /// Download and install the latest version
    Update {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
        /// Stage the update instead of asking for administrator rights
        #[arg(long)]
        no_elevate: bool,
    },
    /// Install an accepted manifest; run with elevated rights by `update`
    #[command(hide = true)]
    Apply {
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long)]
        install_dir: PathBuf,
        #[arg(long)]
        executable: PathBuf,
        #[arg(long)]
        host_pid: Option<u32>,
        /// Already downloaded package; verified again before use
        #[arg(long)]
        archive: Option<PathBuf>,
    },
    /// Show leftovers of earlier updates
    Status,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("UPDRAFT_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = match cli.config {
        Some(p) => p,
        None => config_path()?,
    };

    match cli.cmd {
        Cmd::Check => cmd_check(options_from_config(&config)?),
        Cmd::Update { yes, no_elevate } => {
            cmd_update(options_from_config(&config)?, &config, yes, !no_elevate)
        }
        Cmd::Apply {
            manifest,
            install_dir,
            executable,
            host_pid,
            archive,
        } => {
            let cfg = load_config(&config)
                .inspect_err(|e| tracing::warn!("{:#}; using default rules", e))
                .ok();
            let opts = apply_options(cfg, &install_dir, &executable)?;
            cmd_apply(opts, &manifest, archive.as_deref(), host_pid)
        }
        Cmd::Status => cmd_status(options_from_config(&config)?),
    }
}

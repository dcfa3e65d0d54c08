//! Crate entry point for **updraft**.
//!
//! updraft keeps an installed desktop application current: it reads a remote
//! version manifest, downloads and verifies the release archive, extracts it
//! safely, copies it over the install dir while keeping user data, and hands
//! the running executable's swap to a detached restart helper.
//!
//! Each submodule owns one stage. [`UpdateCoordinator`] drives them on a
//! worker thread; the `cmd_*` functions are the CLI front-ends.

pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod diag;
pub mod error;
pub mod extract;
pub mod fetch;
mod http;
pub mod locate;
pub mod manifest;
pub mod paths;
mod progress;
pub mod replace;
pub mod restart;
pub mod rules;
mod status;
mod upgrade;
pub mod verify;

pub use cancel::CancelToken;
pub use config::{Config, DigestPolicy, UpdaterOptions, load_config};
pub use coordinator::{
    DefaultProbe, HostProbe, JoinOutcome, NoopObserver, SystemProbe, UpdateCheck,
    UpdateCoordinator, UpdateObserver, UpdateOutcome, UpdateSession, UpdateState,
};
pub use error::{FailureReport, UpdateError};
pub use manifest::{ManifestClient, VersionManifest};
pub use paths::{config_path, updraft_home};
pub use replace::{FileReplacementEngine, ReplaceReport, RetryPolicy};
pub use restart::{Elevator, RestartPlan, SystemElevator};
pub use rules::RuleTable;
pub use status::cmd_status;
pub use upgrade::{apply_options, cmd_apply, cmd_check, cmd_update, options_from_config};

//! The update state machine; the only part of the crate a host talks to.
//!
//! `check` runs on the calling thread with the manifest client's bounded
//! timeout. Everything after consent runs on one worker thread per session,
//! which reports back over a channel that the host drains with `poll` or
//! `wait`. The host never blocks on the worker except in `wait`/`shutdown`,
//! and both are bounded.

mod probe;
mod state;
mod worker;

use chrono::Local;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::cancel::CancelToken;
use crate::config::UpdaterOptions;
use crate::diag::DiagLog;
use crate::error::{FailureReport, UpdateError};
use crate::manifest::{ManifestClient, VersionManifest};
use crate::paths::{helper_script_path, marker_path, staging_dir};
use crate::replace::RetryPolicy;
use crate::restart::{ElevatedRequest, Elevator, RestartPlan, probe_writable, schedule_restart};

pub use probe::{DefaultProbe, HostProbe, NoopObserver, SystemProbe, UpdateObserver};
pub use state::{JoinOutcome, UpdateCheck, UpdateOutcome, UpdateSession, UpdateState, WorkerEvent};
pub use worker::Pipeline;

pub const MANIFEST_FILE: &str = "manifest.json";

enum Mode {
    Direct,
    Staged,
    Elevated {
        elevator: Arc<dyn Elevator>,
        request: ElevatedRequest,
    },
}

/// Everything the worker thread owns for one session.
struct Job {
    pipeline: Pipeline,
    mode: Mode,
    workspace: tempfile::TempDir,
    probe: Arc<dyn HostProbe>,
    cancel: CancelToken,
    diag: Arc<DiagLog>,
    tx: Sender<WorkerEvent>,
}

impl Job {
    fn run(self) {
        let Job {
            pipeline,
            mode,
            workspace,
            probe,
            cancel,
            diag,
            tx,
        } = self;
        let mut emit = |ev: WorkerEvent| {
            let _ = tx.send(ev);
        };
        let result = run_mode(pipeline, mode, probe.as_ref(), &cancel, &diag, &mut emit);

        // temp paths go away before the host hears the session is over
        if let Err(e) = workspace.close() {
            warn!("could not remove session workspace: {}", e);
        }
        let _ = tx.send(WorkerEvent::Finished(result));
    }
}

/// Download to extract stay on this thread and cancellable in every mode;
/// only the replacement step differs.
fn run_mode(
    pipeline: Pipeline,
    mode: Mode,
    probe: &dyn HostProbe,
    cancel: &CancelToken,
    diag: &DiagLog,
    emit: &mut dyn FnMut(WorkerEvent),
) -> Result<UpdateOutcome, UpdateError> {
    let payload = pipeline.prepare(probe, cancel, diag, emit)?;
    match mode {
        Mode::Direct => {
            let report = pipeline.install(&payload, cancel, diag, emit)?;
            Ok(if report.restart_required() {
                UpdateOutcome::RestartRequired(report)
            } else {
                UpdateOutcome::Installed(report)
            })
        }
        Mode::Staged => {
            worker::enter_replacing(cancel, diag, emit, "staging the new version".into())?;
            stage(pipeline, &payload, cancel, diag, emit)
        }
        Mode::Elevated {
            elevator,
            mut request,
        } => {
            worker::enter_replacing(
                cancel,
                diag,
                emit,
                "installing with elevated rights".into(),
            )?;
            request.archive = Some(pipeline.archive_path());
            match elevator.run_elevated(&request) {
                Ok(()) => Ok(UpdateOutcome::InstalledElevated {
                    restart_scheduled: marker_path(&request.executable).is_file(),
                }),
                Err(e) => {
                    diag.line("Replacing", &format!("elevation failed: {}", e));
                    stage(pipeline, &payload, cancel, diag, emit)
                }
            }
        }
    }
}

/// Degraded path: copy the full new tree into a staging dir instead.
///
/// Runs inside `Replacing`; the token is already sealed.
fn stage(
    mut pipeline: Pipeline,
    payload: &Path,
    cancel: &CancelToken,
    diag: &DiagLog,
    emit: &mut dyn FnMut(WorkerEvent),
) -> Result<UpdateOutcome, UpdateError> {
    let dir = staging_dir(&pipeline.manifest.version);
    if dir.exists() {
        fs::remove_dir_all(&dir).map_err(|e| UpdateError::from_io(&dir, e))?;
    }
    diag.line(
        "Replacing",
        &format!(
            "{} is not writable; staging the update in {}",
            pipeline.target_dir.display(),
            dir.display()
        ),
    );
    pipeline.target_dir = dir.clone();
    let report = pipeline.copy_payload(payload, cancel, diag, emit)?;
    Ok(UpdateOutcome::Staged {
        staging_dir: dir,
        report,
    })
}

struct Worker {
    handle: JoinHandle<()>,
    rx: Receiver<WorkerEvent>,
    cancel: CancelToken,
}

fn session_id() -> String {
    format!(
        "{}-{}",
        std::process::id(),
        Local::now().format("%Y%m%d%H%M%S%3f")
    )
}

pub struct UpdateCoordinator {
    opts: UpdaterOptions,
    client: ManifestClient,
    observer: Box<dyn UpdateObserver>,
    probe: Arc<dyn HostProbe>,
    elevator: Option<Arc<dyn Elevator>>,
    retry: RetryPolicy,
    diag: Arc<DiagLog>,
    state: UpdateState,
    manifest: Option<VersionManifest>,
    session: Option<UpdateSession>,
    worker: Option<Worker>,
    outcome: Option<UpdateOutcome>,
    failure: Option<FailureReport>,
}

impl UpdateCoordinator {
    pub fn new(opts: UpdaterOptions) -> Result<Self, UpdateError> {
        let client = ManifestClient::from_options(&opts)?;
        Ok(UpdateCoordinator {
            opts,
            client,
            observer: Box::new(NoopObserver),
            probe: Arc::new(DefaultProbe),
            elevator: None,
            retry: RetryPolicy::default(),
            diag: Arc::new(DiagLog::for_current_process()),
            state: UpdateState::Idle,
            manifest: None,
            session: None,
            worker: None,
            outcome: None,
            failure: None,
        })
    }

    pub fn with_observer(mut self, observer: Box<dyn UpdateObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn HostProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_elevator(mut self, elevator: Arc<dyn Elevator>) -> Self {
        self.elevator = Some(elevator);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_diag_log(mut self, diag: DiagLog) -> Self {
        self.diag = Arc::new(diag);
        self
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    pub fn options(&self) -> &UpdaterOptions {
        &self.opts
    }

    pub fn session(&self) -> Option<&UpdateSession> {
        self.session.as_ref()
    }

    /// The manifest of an update waiting for consent.
    pub fn manifest(&self) -> Option<&VersionManifest> {
        self.manifest.as_ref()
    }

    pub fn outcome(&self) -> Option<&UpdateOutcome> {
        self.outcome.as_ref()
    }

    pub fn failure(&self) -> Option<&FailureReport> {
        self.failure.as_ref()
    }

    pub fn diag_log(&self) -> &Path {
        self.diag.path()
    }

    /// Whether a direct install would fail the trial write.
    pub fn requires_elevation(&self) -> bool {
        !probe_writable(&self.opts.install_dir)
    }

    /// Fetch the manifest and decide whether an update is offered.
    ///
    /// Starts a fresh session from `Idle`, `Done` or `Failed`. Ends in
    /// `AwaitingConsent` when the remote version is newer, `Done` otherwise,
    /// and `Failed` on a network or parse error.
    pub fn check(&mut self) -> Result<UpdateCheck, UpdateError> {
        if self.worker.is_some() || !(self.state == UpdateState::Idle || self.state.is_terminal()) {
            return Err(UpdateError::InvalidState {
                op: "check",
                state: self.state,
            });
        }
        self.manifest = None;
        self.session = None;
        self.outcome = None;
        self.failure = None;

        let url = self.opts.manifest_url.clone();
        self.transition(UpdateState::CheckingManifest, &format!("checking {}", url));
        let fetched = if self.probe.network_available() {
            self.client.fetch(&url)
        } else {
            Err(UpdateError::Network(
                "host reports the network as unavailable".into(),
            ))
        };
        let manifest = match fetched {
            Ok(m) => m,
            Err(e) => return Err(self.fail(e)),
        };

        let current = self.client.current_version().to_string();
        if !self.client.is_newer(&manifest) {
            self.transition(
                UpdateState::Done,
                &format!("up to date ({} >= {})", current, manifest.version),
            );
            self.outcome = Some(UpdateOutcome::UpToDate);
            return Ok(UpdateCheck::UpToDate {
                current,
                remote: manifest.version,
            });
        }

        if manifest.is_mandatory_for(&current) {
            warn!(
                "version {} no longer supports updating from {} in place",
                manifest.minimum_required_version, current
            );
        }
        self.transition(
            UpdateState::AwaitingConsent,
            &format!("version {} is available (running {})", manifest.version, current),
        );
        self.manifest = Some(manifest.clone());
        Ok(UpdateCheck::Available(manifest))
    }

    /// Start the download/install worker for the offered update.
    ///
    /// When the install dir fails the trial write, the work goes to the
    /// elevator if `allow_elevation` and one is configured; otherwise (or if
    /// elevation fails) the new tree is staged under the temp dir.
    pub fn accept(&mut self, allow_elevation: bool) -> Result<(), UpdateError> {
        let manifest = match (&self.manifest, self.state, &self.worker) {
            (Some(m), UpdateState::AwaitingConsent, None) => m.clone(),
            _ => {
                return Err(UpdateError::InvalidState {
                    op: "accept",
                    state: self.state,
                });
            }
        };

        let workspace = match tempfile::Builder::new()
            .prefix("updraft_session_")
            .tempdir()
        {
            Ok(ws) => ws,
            Err(e) => return Err(self.fail(UpdateError::from_io(&std::env::temp_dir(), e))),
        };
        let mut pipeline = Pipeline::new(&self.opts, manifest.clone(), workspace.path());
        pipeline.retry = self.retry;

        let mut session = UpdateSession::new(session_id());
        session.temp_archive_path = Some(pipeline.archive_path());
        session.temp_extract_dir = Some(pipeline.extract_dir());
        let id = session.id.clone();
        self.session = Some(session);

        let mode = if probe_writable(&self.opts.install_dir) {
            Mode::Direct
        } else if allow_elevation && let Some(elevator) = self.elevator.clone() {
            let manifest_file = workspace.path().join(MANIFEST_FILE);
            let written = serde_json::to_vec_pretty(&manifest)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
                .and_then(|body| fs::write(&manifest_file, body));
            if let Err(e) = written {
                return Err(self.fail(UpdateError::from_io(&manifest_file, e)));
            }
            Mode::Elevated {
                elevator,
                request: ElevatedRequest {
                    manifest_file,
                    install_dir: self.opts.install_dir.clone(),
                    executable: self.opts.executable.clone(),
                    host_pid: std::process::id(),
                    archive: None,
                },
            }
        } else {
            Mode::Staged
        };

        let cancel = CancelToken::new();
        let (tx, rx) = mpsc::channel();
        let job = Job {
            pipeline,
            mode,
            workspace,
            probe: Arc::clone(&self.probe),
            cancel: cancel.clone(),
            diag: Arc::clone(&self.diag),
            tx,
        };
        let handle = match thread::Builder::new()
            .name("updraft-worker".into())
            .spawn(move || job.run())
        {
            Ok(h) => h,
            Err(e) => {
                return Err(self.fail(UpdateError::Io {
                    path: PathBuf::new(),
                    source: e,
                }));
            }
        };
        self.worker = Some(Worker { handle, rx, cancel });
        self.diag
            .line("AwaitingConsent", &format!("session {} accepted", id));
        info!(session = %id, "update accepted");
        Ok(())
    }

    /// Turn down the offered update; the session ends in `Done`.
    pub fn decline(&mut self) -> Result<(), UpdateError> {
        if self.state != UpdateState::AwaitingConsent || self.worker.is_some() {
            return Err(UpdateError::InvalidState {
                op: "decline",
                state: self.state,
            });
        }
        self.manifest = None;
        self.outcome = Some(UpdateOutcome::Declined);
        self.transition(UpdateState::Done, "update declined");
        Ok(())
    }

    /// Ask the session to stop.
    ///
    /// # Errors
    /// `CancelRefused` once installed files are being replaced;
    /// `InvalidState` when there is nothing to cancel.
    pub fn cancel(&mut self) -> Result<(), UpdateError> {
        if let Some(w) = &self.worker {
            w.cancel.cancel()?;
            if let Some(s) = self.session.as_mut() {
                s.cancelled = true;
            }
            self.diag.line(self.state.as_str(), "cancellation requested");
            return Ok(());
        }
        match self.state {
            UpdateState::AwaitingConsent => self.decline(),
            UpdateState::Replacing => Err(UpdateError::CancelRefused),
            state => Err(UpdateError::InvalidState {
                op: "cancel",
                state,
            }),
        }
    }

    /// Drain pending worker events without blocking.
    pub fn poll(&mut self) -> UpdateState {
        while let Some(w) = &self.worker {
            match w.rx.try_recv() {
                Ok(ev) => self.handle(ev),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.worker_vanished(),
            }
        }
        self.state
    }

    /// Process worker events until the session settles or `timeout` passes.
    pub fn wait(&mut self, timeout: Duration) -> UpdateState {
        let deadline = Instant::now() + timeout;
        while let Some(w) = &self.worker {
            let left = deadline.saturating_duration_since(Instant::now());
            match w.rx.recv_timeout(left) {
                Ok(ev) => self.handle(ev),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => self.worker_vanished(),
            }
        }
        self.state
    }

    /// Cancel if still allowed and wait up to `timeout` for the worker.
    ///
    /// A worker that does not finish in time is abandoned, never killed:
    /// it may be in the middle of writing an installed file.
    pub fn shutdown(&mut self, timeout: Duration) -> JoinOutcome {
        let Some(w) = &self.worker else {
            return JoinOutcome::NoWorker;
        };
        if let Err(e) = w.cancel.cancel() {
            info!("shutdown without cancelling: {}", e);
        }
        self.wait(timeout);
        if self.worker.take().is_none() {
            return JoinOutcome::Joined;
        }
        let msg = "update is still finishing in the background";
        warn!("{}", msg);
        self.diag.line(self.state.as_str(), msg);
        self.observer.on_status(self.state, msg);
        JoinOutcome::StillFinishing
    }

    /// Launch the restart helper for a session in `AwaitingRestart`.
    ///
    /// On success the session is `Done` and the host should exit promptly so
    /// the helper can swap the marker in. Returns the helper's path.
    pub fn restart(&mut self) -> Result<PathBuf, UpdateError> {
        self.poll();
        if self.state != UpdateState::AwaitingRestart {
            return Err(UpdateError::InvalidState {
                op: "restart",
                state: self.state,
            });
        }
        let marker = match &self.outcome {
            Some(UpdateOutcome::RestartRequired(report)) => report.marker.clone(),
            Some(UpdateOutcome::InstalledElevated { .. }) => {
                let helper = helper_script_path(&self.opts.install_dir);
                self.transition(
                    UpdateState::Done,
                    "restart helper was launched by the elevated run; exit now",
                );
                return Ok(helper);
            }
            _ => None,
        };
        let Some(marker) = marker else {
            return Err(UpdateError::InvalidState {
                op: "restart",
                state: self.state,
            });
        };

        let plan = RestartPlan::new(
            &self.opts.install_dir,
            &self.opts.executable,
            &marker,
            std::process::id(),
        )
        .with_diag_log(self.diag.path());
        match schedule_restart(&plan) {
            Ok(script) => {
                self.transition(
                    UpdateState::Done,
                    &format!("restart helper {} launched; exit now", script.display()),
                );
                Ok(script)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn handle(&mut self, ev: WorkerEvent) {
        match ev {
            WorkerEvent::Status(state, msg) => {
                self.state = state;
                if let Some(s) = self.session.as_mut() {
                    s.state = state;
                }
                self.observer.on_status(state, &msg);
            }
            WorkerEvent::Progress { done, total } => {
                if self.state == UpdateState::Downloading
                    && let Some(s) = self.session.as_mut()
                {
                    s.downloaded_bytes = done;
                    s.total_bytes = total;
                }
                self.observer.on_progress(done, total);
            }
            WorkerEvent::PayloadLocated(p) => {
                if let Some(s) = self.session.as_mut() {
                    s.payload_root = Some(p);
                }
            }
            WorkerEvent::Finished(result) => {
                if let Some(w) = self.worker.take()
                    && w.handle.join().is_err()
                {
                    error!("update worker panicked after reporting");
                }
                match result {
                    Ok(outcome) => {
                        let state = outcome.final_state();
                        let msg = match &outcome {
                            UpdateOutcome::RestartRequired(r) => format!(
                                "{} file(s) replaced; restart to finish installing",
                                r.replaced.len()
                            ),
                            UpdateOutcome::Staged { staging_dir, .. } => format!(
                                "install dir is not writable; the update was staged in {}",
                                staging_dir.display()
                            ),
                            UpdateOutcome::InstalledElevated { restart_scheduled } => {
                                if *restart_scheduled {
                                    "installed with elevated rights; restart to finish".to_string()
                                } else {
                                    "installed with elevated rights".to_string()
                                }
                            }
                            UpdateOutcome::Installed(r) => {
                                format!("{} file(s) replaced", r.replaced.len())
                            }
                            UpdateOutcome::UpToDate | UpdateOutcome::Declined => String::new(),
                        };
                        self.outcome = Some(outcome);
                        self.transition(state, &msg);
                    }
                    Err(e) => {
                        self.fail(e);
                    }
                }
            }
        }
    }

    fn worker_vanished(&mut self) {
        self.worker = None;
        self.fail(UpdateError::Io {
            path: PathBuf::new(),
            source: io::Error::other("update worker exited without reporting"),
        });
    }

    fn transition(&mut self, state: UpdateState, msg: &str) {
        self.state = state;
        if let Some(s) = self.session.as_mut() {
            s.state = state;
        }
        self.diag.line(state.as_str(), msg);
        self.observer.on_status(state, msg);
    }

    /// Record the failure against the current state and hand the error back.
    fn fail(&mut self, error: UpdateError) -> UpdateError {
        let report = FailureReport {
            state: self.state,
            error: error.clone(),
            diag_log: self.diag.path().to_path_buf(),
        };
        if let Some(s) = self.session.as_mut() {
            s.last_error = Some(error.to_string());
            s.cancelled |= matches!(error, UpdateError::Cancelled);
            s.state = UpdateState::Failed;
        }
        error!("{}", report);
        self.diag.line(UpdateState::Failed.as_str(), &report.to_string());
        self.state = UpdateState::Failed;
        self.observer
            .on_status(UpdateState::Failed, &report.to_string());
        self.failure = Some(report);
        error
    }
}

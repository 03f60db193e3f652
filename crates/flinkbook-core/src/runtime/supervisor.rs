use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeSettings;

use super::launch;
use super::logs::{LogBuffer, LogLine, OutputKind, attach_output};
use super::probe::{HttpLivenessCheck, LivenessCheck, ProbeFailure, ReadinessProbe};
use super::process::{
    ProcessControl, ProcessError, ProcessHost, TerminationSignal, TokioProcessHost,
};
use super::state::{ExitOutcome, RuntimeEvent, RuntimeInfo, RuntimeState};

const STARTUP_LOG_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{message}")]
    Configuration { message: String },

    #[error("Runtime is already {state}")]
    AlreadyActive { state: RuntimeState },

    #[error("Failed to launch runtime: {0}")]
    Spawn(#[from] ProcessError),

    #[error("Runtime did not become ready within {}s", .waited.as_secs())]
    StartupTimeout {
        waited: Duration,
        recent_output: String,
    },

    #[error("Runtime exited during startup ({outcome})")]
    ExitedDuringStartup {
        outcome: ExitOutcome,
        recent_output: String,
    },

    #[error("Runtime start was aborted by a stop request")]
    StartAborted,

    #[error("Runtime process did not exit after being killed")]
    KillFailed,
}

impl RuntimeError {
    /// Runtime output captured before the failure, if any.
    pub fn recent_output(&self) -> Option<&str> {
        match self {
            RuntimeError::StartupTimeout { recent_output, .. }
            | RuntimeError::ExitedDuringStartup { recent_output, .. } => {
                Some(recent_output.as_str())
            }
            _ => None,
        }
    }
}

enum StopAction {
    Done,
    WaitWhile(RuntimeState),
    Terminate {
        epoch: u64,
        control: Arc<dyn ProcessControl>,
        exit: watch::Receiver<Option<ExitOutcome>>,
    },
    /// Another stop is in flight. Give it `patience` to finish, then kill.
    Escalate {
        patience: Duration,
        epoch: u64,
        control: Arc<dyn ProcessControl>,
        exit: watch::Receiver<Option<ExitOutcome>>,
    },
}

struct ManagedProcess {
    epoch: u64,
    info: RuntimeInfo,
    control: Arc<dyn ProcessControl>,
    exit: watch::Receiver<Option<ExitOutcome>>,
    /// Set once a forceful kill went unanswered.
    kill_failed: bool,
}

#[derive(Default)]
struct Inner {
    process: Option<ManagedProcess>,
    epoch: u64,
    start_cancel: Option<CancellationToken>,
}

struct Shared {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<RuntimeState>,
    events: broadcast::Sender<RuntimeEvent>,
    logs: LogBuffer,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> RuntimeState {
        *self.state_tx.borrow()
    }

    /// Callers must hold the inner lock so transitions are serialized.
    fn transition(&self, _held: &Inner, to: RuntimeState) -> bool {
        let from = self.state();
        if !from.can_transition_to(to) {
            warn!(%from, %to, "Ignoring invalid runtime state transition");
            return false;
        }
        self.state_tx.send_replace(to);
        debug!(%from, %to, "Runtime state changed");
        let _ = self.events.send(RuntimeEvent::StateChanged { from, to });
        true
    }

    fn on_exit(&self, epoch: u64, outcome: ExitOutcome) {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return;
        }
        if inner.process.as_ref().is_some_and(|p| p.epoch == epoch) {
            inner.process = None;
        }

        match self.state() {
            RuntimeState::Running => {
                error!(%outcome, "Runtime exited unexpectedly");
                self.transition(&inner, RuntimeState::Errored);
                let _ = self.events.send(RuntimeEvent::Crashed {
                    code: outcome.code,
                    signal: outcome.signal,
                });
            }
            RuntimeState::Stopping => {
                info!(%outcome, "Runtime exited");
                self.transition(&inner, RuntimeState::Stopped);
            }
            RuntimeState::Starting => {
                debug!(%outcome, "Runtime exited while starting");
            }
            RuntimeState::Stopped | RuntimeState::Errored => {}
        }
    }
}

/// Owns the local Flink runtime process.
pub struct RuntimeSupervisor {
    settings: RuntimeSettings,
    host: Arc<dyn ProcessHost>,
    liveness: Arc<dyn LivenessCheck>,
    java: Option<PathBuf>,
    shared: Arc<Shared>,
}

pub struct RuntimeSupervisorBuilder {
    settings: RuntimeSettings,
    host: Option<Arc<dyn ProcessHost>>,
    liveness: Option<Arc<dyn LivenessCheck>>,
    java: Option<PathBuf>,
    log_capacity: usize,
}

impl RuntimeSupervisorBuilder {
    pub fn process_host(mut self, host: Arc<dyn ProcessHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn liveness_check(mut self, check: Arc<dyn LivenessCheck>) -> Self {
        self.liveness = Some(check);
        self
    }

    /// Use this java executable as-is instead of resolving one.
    pub fn java_executable(mut self, java: PathBuf) -> Self {
        self.java = Some(java);
        self
    }

    pub fn log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    pub fn build(self) -> RuntimeSupervisor {
        let liveness = self.liveness.unwrap_or_else(|| {
            Arc::new(HttpLivenessCheck::new(self.settings.readiness_url()))
        });
        let (state_tx, _) = watch::channel(RuntimeState::Stopped);
        let (events, _) = broadcast::channel(64);

        RuntimeSupervisor {
            host: self.host.unwrap_or_else(|| Arc::new(TokioProcessHost)),
            liveness,
            java: self.java,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                state_tx,
                events,
                logs: LogBuffer::new(self.log_capacity),
            }),
            settings: self.settings,
        }
    }
}

impl RuntimeSupervisor {
    pub fn builder(settings: RuntimeSettings) -> RuntimeSupervisorBuilder {
        RuntimeSupervisorBuilder {
            settings,
            host: None,
            liveness: None,
            java: None,
            log_capacity: super::logs::DEFAULT_LOG_CAPACITY,
        }
    }

    pub fn new(settings: RuntimeSettings) -> Self {
        Self::builder(settings).build()
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn status(&self) -> RuntimeState {
        self.shared.state()
    }

    /// Details of the running process. `None` once it has exited.
    pub fn info(&self) -> Option<RuntimeInfo> {
        self.shared.lock().process.as_ref().map(|p| p.info.clone())
    }

    pub fn state_watch(&self) -> watch::Receiver<RuntimeState> {
        self.shared.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.shared.events.subscribe()
    }

    /// Invoke `handler` with the exit code of every crash.
    pub fn on_crash<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn(Option<i32>) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(RuntimeEvent::Crashed { code, .. }) => handler(code),
                    Ok(RuntimeEvent::StateChanged { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(lagged = n, "Crash handler lagged behind runtime events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn recent_logs(&self) -> Vec<LogLine> {
        self.shared.logs.snapshot()
    }

    /// Start the runtime and wait until it accepts requests.
    pub async fn start(&self) -> Result<RuntimeInfo, RuntimeError> {
        let (epoch, cancel) = {
            let mut inner = self.shared.lock();
            let state = self.shared.state();
            if !state.can_transition_to(RuntimeState::Starting) {
                return Err(RuntimeError::AlreadyActive { state });
            }
            self.shared.transition(&inner, RuntimeState::Starting);
            inner.epoch += 1;
            let cancel = CancellationToken::new();
            inner.start_cancel = Some(cancel.clone());
            (inner.epoch, cancel)
        };

        let result = self.launch(epoch, &cancel).await;

        let mut inner = self.shared.lock();
        inner.start_cancel = None;
        match result {
            Ok(info) => {
                let exited = inner
                    .process
                    .as_ref()
                    .filter(|p| p.epoch == epoch)
                    .and_then(|p| *p.exit.borrow());
                match (exited, inner.process.is_some()) {
                    (None, true) => {
                        self.shared.transition(&inner, RuntimeState::Running);
                        info!(
                            pid = ?info.process_id,
                            gateway = %info.gateway_url,
                            "Runtime is running"
                        );
                        Ok(info)
                    }
                    (outcome, _) => {
                        inner.process = None;
                        self.shared.transition(&inner, RuntimeState::Errored);
                        Err(RuntimeError::ExitedDuringStartup {
                            outcome: outcome.unwrap_or_default(),
                            recent_output: self.shared.logs.tail(STARTUP_LOG_LINES),
                        })
                    }
                }
            }
            Err(e) => {
                if inner.process.as_ref().is_some_and(|p| p.epoch == epoch) {
                    inner.process = None;
                }
                self.shared.transition(&inner, RuntimeState::Errored);
                error!(error = %e, "Runtime failed to start");
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        epoch: u64,
        cancel: &CancellationToken,
    ) -> Result<RuntimeInfo, RuntimeError> {
        launch::validate(&self.settings)?;
        let java = match &self.java {
            Some(java) => java.clone(),
            None => launch::resolve_java(&self.settings)?,
        };
        let spec = launch::launch_spec(&self.settings, java);

        info!(
            program = %spec.program.display(),
            args = ?spec.args,
            "Launching runtime"
        );
        self.shared.logs.clear();

        let spawned = self.host.spawn(&spec)?;
        if let Some(stdout) = spawned.stdout {
            let _stdout_task = attach_output(stdout, OutputKind::Stdout, self.shared.logs.clone());
        }
        if let Some(stderr) = spawned.stderr {
            let _stderr_task = attach_output(stderr, OutputKind::Stderr, self.shared.logs.clone());
        }

        let info = RuntimeInfo::new(spawned.pid, &self.settings);
        let control: Arc<dyn ProcessControl> = Arc::from(spawned.control);
        let mut exit = spawned.exit;

        self.shared.lock().process = Some(ManagedProcess {
            epoch,
            info: info.clone(),
            control: control.clone(),
            exit: exit.clone(),
            kill_failed: false,
        });
        self.spawn_exit_observer(epoch, exit.clone());

        let probe = ReadinessProbe::new(
            self.settings.readiness_timeout(),
            self.settings.readiness_interval(),
        );
        match probe
            .wait_until_ready(self.liveness.as_ref(), &mut exit, cancel)
            .await
        {
            Ok(()) => Ok(info),
            Err(ProbeFailure::ProcessExited(outcome)) => Err(RuntimeError::ExitedDuringStartup {
                outcome,
                recent_output: self.shared.logs.tail(STARTUP_LOG_LINES),
            }),
            Err(ProbeFailure::TimedOut { waited }) => {
                warn!(?waited, "Runtime did not become ready, killing it");
                self.kill_and_wait(control.as_ref(), &mut exit).await?;
                Err(RuntimeError::StartupTimeout {
                    waited,
                    recent_output: self.shared.logs.tail(STARTUP_LOG_LINES),
                })
            }
            Err(ProbeFailure::Cancelled) => {
                info!("Runtime start cancelled, killing it");
                self.kill_and_wait(control.as_ref(), &mut exit).await?;
                Err(RuntimeError::StartAborted)
            }
        }
    }

    fn spawn_exit_observer(&self, epoch: u64, mut exit: watch::Receiver<Option<ExitOutcome>>) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let outcome = match exit.wait_for(Option::is_some).await {
                Ok(outcome) => *outcome,
                Err(_) => None,
            };
            shared.on_exit(epoch, outcome.unwrap_or_default());
        });
    }

    async fn kill_and_wait(
        &self,
        control: &dyn ProcessControl,
        exit: &mut watch::Receiver<Option<ExitOutcome>>,
    ) -> Result<(), RuntimeError> {
        if let Err(e) = control.signal(TerminationSignal::Forceful) {
            debug!(error = %e, "Forceful kill failed");
        }
        match tokio::time::timeout(self.settings.kill_timeout(), exit.wait_for(Option::is_some))
            .await
        {
            Ok(_) => Ok(()),
            Err(_) => {
                error!("Runtime process did not exit after SIGKILL");
                Err(RuntimeError::KillFailed)
            }
        }
    }

    /// Stop the runtime: graceful signal, then a forceful kill after the grace period.
    ///
    /// Calling this again after [`RuntimeError::KillFailed`] resends the kill.
    pub async fn stop(&self) -> Result<(), RuntimeError> {
        let action = {
            let inner = self.shared.lock();
            match self.shared.state() {
                RuntimeState::Stopped | RuntimeState::Errored => StopAction::Done,
                RuntimeState::Starting => {
                    if let Some(cancel) = &inner.start_cancel {
                        cancel.cancel();
                    }
                    StopAction::WaitWhile(RuntimeState::Starting)
                }
                RuntimeState::Stopping => match inner.process.as_ref() {
                    Some(process) => StopAction::Escalate {
                        patience: if process.kill_failed {
                            Duration::ZERO
                        } else {
                            self.settings.stop_grace() + self.settings.kill_timeout()
                        },
                        epoch: process.epoch,
                        control: process.control.clone(),
                        exit: process.exit.clone(),
                    },
                    None => StopAction::WaitWhile(RuntimeState::Stopping),
                },
                RuntimeState::Running => match inner.process.as_ref() {
                    Some(process) => {
                        let action = StopAction::Terminate {
                            epoch: process.epoch,
                            control: process.control.clone(),
                            exit: process.exit.clone(),
                        };
                        self.shared.transition(&inner, RuntimeState::Stopping);
                        action
                    }
                    None => StopAction::Done,
                },
            }
        };

        match action {
            StopAction::Done => Ok(()),
            StopAction::WaitWhile(state) => {
                self.wait_while(state).await;
                Ok(())
            }
            StopAction::Terminate {
                epoch,
                control,
                mut exit,
            } => {
                info!("Stopping runtime");
                if let Err(e) = control.signal(TerminationSignal::Graceful) {
                    debug!(error = %e, "Graceful termination signal failed");
                }

                let grace = self.settings.stop_grace();
                if tokio::time::timeout(grace, exit.wait_for(Option::is_some))
                    .await
                    .is_err()
                {
                    warn!(?grace, "Runtime did not exit within the grace period, killing it");
                    self.stop_kill(epoch, control.as_ref(), &mut exit).await?;
                }
                self.finish_stop(epoch);
                Ok(())
            }
            StopAction::Escalate {
                patience,
                epoch,
                control,
                mut exit,
            } => {
                if tokio::time::timeout(patience, self.wait_while(RuntimeState::Stopping))
                    .await
                    .is_ok()
                {
                    return Ok(());
                }
                warn!("Runtime is still stopping, killing it again");
                self.stop_kill(epoch, control.as_ref(), &mut exit).await?;
                self.finish_stop(epoch);
                Ok(())
            }
        }
    }

    async fn stop_kill(
        &self,
        epoch: u64,
        control: &dyn ProcessControl,
        exit: &mut watch::Receiver<Option<ExitOutcome>>,
    ) -> Result<(), RuntimeError> {
        let result = self.kill_and_wait(control, exit).await;
        if result.is_err() {
            let mut inner = self.shared.lock();
            if let Some(process) = inner.process.as_mut().filter(|p| p.epoch == epoch) {
                process.kill_failed = true;
            }
        }
        result
    }

    fn finish_stop(&self, epoch: u64) {
        let mut inner = self.shared.lock();
        if inner.epoch == epoch && self.shared.state() == RuntimeState::Stopping {
            inner.process = None;
            self.shared.transition(&inner, RuntimeState::Stopped);
        }
    }

    async fn wait_while(&self, state: RuntimeState) {
        let mut rx = self.shared.state_tx.subscribe();
        let _ = rx.wait_for(|s| *s != state).await;
    }
}

impl Drop for RuntimeSupervisor {
    fn drop(&mut self) {
        let inner = self.shared.lock();
        if let Some(process) = inner.process.as_ref() {
            warn!(pid = ?process.info.process_id, "Supervisor dropped with a live runtime, killing it");
            let _ = process.control.signal(TerminationSignal::Forceful);
        }
    }
}

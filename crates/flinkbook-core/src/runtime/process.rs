//! Process host abstraction.
//!
//! The supervisor never touches `tokio::process` directly; it goes through a
//! [`ProcessHost`] so tests can drive exits and signals deterministically.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::pin::Pin;

use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::state::ExitOutcome;

pub type OutputStream = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal process {pid}: {details}")]
    Signal { pid: u32, details: String },

    #[error("Process already exited")]
    AlreadyExited,
}

/// Everything needed to start a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    /// SIGTERM on unix. Lets the runner's shutdown hook close the cluster.
    Graceful,
    /// SIGKILL / TerminateProcess.
    Forceful,
}

/// Sends termination signals to a spawned process.
pub trait ProcessControl: Send + Sync {
    fn signal(&self, signal: TerminationSignal) -> Result<(), ProcessError>;
}

/// A freshly spawned process.
pub struct SpawnedProcess {
    pub pid: Option<u32>,
    pub control: Box<dyn ProcessControl>,
    /// Becomes `Some` exactly once, when the process has exited.
    pub exit: watch::Receiver<Option<ExitOutcome>>,
    pub stdout: Option<OutputStream>,
    pub stderr: Option<OutputStream>,
}

pub trait ProcessHost: Send + Sync {
    fn spawn(&self, spec: &LaunchSpec) -> Result<SpawnedProcess, ProcessError>;
}

/// Spawns real processes through `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct TokioProcessHost;

impl ProcessHost for TokioProcessHost {
    fn spawn(&self, spec: &LaunchSpec) -> Result<SpawnedProcess, ProcessError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            // If the supervisor itself goes away the runtime must not outlive it.
            .kill_on_drop(true);

        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.display().to_string(),
            source,
        })?;

        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .map(|s| Box::pin(s) as OutputStream);
        let stderr = child
            .stderr
            .take()
            .map(|s| Box::pin(s) as OutputStream);

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            let outcome = loop {
                tokio::select! {
                    status = child.wait() => {
                        break match status {
                            Ok(status) => ExitOutcome::from(status),
                            Err(e) => {
                                warn!(error = %e, "Failed to wait for runtime process");
                                ExitOutcome::default()
                            }
                        };
                    }
                    Some(()) = kill_rx.recv() => {
                        if let Err(e) = child.start_kill() {
                            debug!(error = %e, "Kill request for runtime process failed");
                        }
                    }
                }
            };
            let _ = exit_tx.send(Some(outcome));
        });

        Ok(SpawnedProcess {
            pid,
            control: Box::new(TokioProcessControl { pid, kill_tx }),
            exit: exit_rx,
            stdout,
            stderr,
        })
    }
}

struct TokioProcessControl {
    pid: Option<u32>,
    kill_tx: mpsc::UnboundedSender<()>,
}

impl TokioProcessControl {
    fn force(&self) -> Result<(), ProcessError> {
        self.kill_tx
            .send(())
            .map_err(|_| ProcessError::AlreadyExited)
    }
}

impl ProcessControl for TokioProcessControl {
    fn signal(&self, signal: TerminationSignal) -> Result<(), ProcessError> {
        match signal {
            TerminationSignal::Forceful => self.force(),
            TerminationSignal::Graceful => {
                #[cfg(unix)]
                {
                    use nix::sys::signal::{Signal, kill};
                    use nix::unistd::Pid;

                    let Some(pid) = self.pid else {
                        return Err(ProcessError::AlreadyExited);
                    };
                    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(|e| {
                        ProcessError::Signal {
                            pid,
                            details: e.to_string(),
                        }
                    })
                }
                #[cfg(not(unix))]
                {
                    // No graceful signal on this platform.
                    self.force()
                }
            }
        }
    }
}

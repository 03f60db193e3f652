//! Lifecycle of the local Flink runtime process.

pub mod launch;
pub mod logs;
pub mod probe;
pub mod process;
pub mod state;
pub mod supervisor;

pub use logs::{LogLine, OutputKind};
pub use probe::{HttpLivenessCheck, LivenessCheck, ProbeFailure, ReadinessProbe};
pub use process::{
    LaunchSpec, OutputStream, ProcessControl, ProcessError, ProcessHost, SpawnedProcess,
    TerminationSignal, TokioProcessHost,
};
pub use state::{ExitOutcome, RuntimeEvent, RuntimeInfo, RuntimeState};
pub use supervisor::{RuntimeError, RuntimeSupervisor, RuntimeSupervisorBuilder};

#[cfg(test)]
mod supervisor_tests;

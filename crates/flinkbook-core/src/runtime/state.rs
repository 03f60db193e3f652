use serde::Serialize;
use strum::Display;

use crate::config::RuntimeSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RuntimeState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Errored,
}

impl RuntimeState {
    /// Returns true if the supervisor may move from `self` to `next`.
    pub fn can_transition_to(self, next: RuntimeState) -> bool {
        use RuntimeState::{Errored, Running, Starting, Stopped, Stopping};
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Errored)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Running, Errored)
                | (Errored, Starting)
        )
    }
}

/// How the runtime process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn from_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn from_signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Details about the currently managed runtime process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeInfo {
    pub process_id: Option<u32>,
    pub readiness_url: String,
    pub gateway_url: String,
    pub web_ui_url: String,
    pub memory_mb: u32,
    pub parallelism: u32,
    pub task_slots: u32,
    pub gateway_port: u16,
}

impl RuntimeInfo {
    pub(crate) fn new(process_id: Option<u32>, settings: &RuntimeSettings) -> Self {
        Self {
            process_id,
            readiness_url: settings.readiness_url(),
            gateway_url: settings.gateway_url(),
            web_ui_url: format!("http://localhost:{}", settings.rest_port),
            memory_mb: settings.memory_mb,
            parallelism: settings.parallelism,
            task_slots: settings.task_slots,
            gateway_port: settings.gateway_port,
        }
    }
}

/// Events broadcast by the runtime supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    StateChanged {
        from: RuntimeState,
        to: RuntimeState,
    },
    /// The process ended while it was serving requests.
    Crashed {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(RuntimeState::Stopped, RuntimeState::Starting, true)]
    #[case(RuntimeState::Starting, RuntimeState::Running, true)]
    #[case(RuntimeState::Starting, RuntimeState::Errored, true)]
    #[case(RuntimeState::Running, RuntimeState::Stopping, true)]
    #[case(RuntimeState::Stopping, RuntimeState::Stopped, true)]
    #[case(RuntimeState::Running, RuntimeState::Errored, true)]
    #[case(RuntimeState::Errored, RuntimeState::Starting, true)]
    #[case(RuntimeState::Stopped, RuntimeState::Running, false)]
    #[case(RuntimeState::Running, RuntimeState::Starting, false)]
    #[case(RuntimeState::Stopping, RuntimeState::Running, false)]
    #[case(RuntimeState::Running, RuntimeState::Stopped, false)]
    fn test_transition_edges(
        #[case] from: RuntimeState,
        #[case] to: RuntimeState,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn test_exit_outcome_display() {
        assert_eq!(ExitOutcome::from_code(3).to_string(), "exit code 3");
        assert_eq!(ExitOutcome::from_signal(9).to_string(), "signal 9");
        assert_eq!(ExitOutcome::default().to_string(), "unknown exit status");
    }
}

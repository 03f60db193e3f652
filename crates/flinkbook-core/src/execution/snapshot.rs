use thiserror::Error;

use crate::gateway::Column;

use super::rows::ResultRows;
use super::subscription::StatementKey;

/// Why a statement failed. Carried inside the terminal snapshot.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("No SQL Gateway session: {0}")]
    SessionUnavailable(String),

    #[error("Failed to submit statement: {0}")]
    Submit(String),

    /// Error text reported by the gateway for the operation, verbatim.
    #[error("{0}")]
    Operation(String),

    #[error("Statement did not start within {attempts} status checks")]
    StatusTimeout { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalStatus {
    Finished,
    Canceled,
    Failed(ExecutionError),
}

/// Everything known about a statement's results at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSnapshot {
    pub key: StatementKey,
    pub columns: Vec<Column>,
    pub rows: ResultRows,
    /// `None` while more snapshots will follow.
    pub terminal: Option<TerminalStatus>,
    pub streaming: bool,
    pub job_id: Option<String>,
}

impl ResultSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    pub fn error(&self) -> Option<&ExecutionError> {
        match &self.terminal {
            Some(TerminalStatus::Failed(e)) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEvent {
    Paused {
        key: StatementKey,
    },
    Resumed {
        key: StatementKey,
    },
    Canceled {
        key: StatementKey,
        job_id: Option<String>,
    },
}

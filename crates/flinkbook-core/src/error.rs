use thiserror::Error;

use crate::execution::ExecutionError;
use crate::gateway::GatewayError;
use crate::runtime::RuntimeError;
use crate::session::SessionError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Configuration(String),
}

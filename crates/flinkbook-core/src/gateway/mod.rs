//! Request/response boundary with the Flink SQL Gateway.

use async_trait::async_trait;

mod client;
mod error;
mod types;

pub use client::{GatewayInfo, SqlGatewayClient};
pub use error::GatewayError;
pub use types::{
    Column, OpenSessionRequest, OperationHandle, OperationStatus, ResultKind, ResultPage, Row,
    RowKind, SessionHandle,
};

/// The control-plane operations the session registry and the execution
/// coordinator rely on.
#[async_trait]
pub trait GatewayApi: Send + Sync {
    async fn open_session(&self, request: &OpenSessionRequest)
    -> Result<SessionHandle, GatewayError>;

    /// Cheap existence check for a cached session.
    async fn session_exists(&self, session: &SessionHandle) -> Result<bool, GatewayError>;

    async fn close_session(&self, session: &SessionHandle) -> Result<(), GatewayError>;

    async fn submit_statement(
        &self,
        session: &SessionHandle,
        sql: &str,
    ) -> Result<OperationHandle, GatewayError>;

    async fn operation_status(
        &self,
        session: &SessionHandle,
        operation: &OperationHandle,
    ) -> Result<OperationStatus, GatewayError>;

    async fn fetch_results(
        &self,
        session: &SessionHandle,
        operation: &OperationHandle,
        cursor: u64,
    ) -> Result<ResultPage, GatewayError>;

    async fn cancel_operation(
        &self,
        session: &SessionHandle,
        operation: &OperationHandle,
    ) -> Result<OperationStatus, GatewayError>;

    async fn close_operation(
        &self,
        session: &SessionHandle,
        operation: &OperationHandle,
    ) -> Result<(), GatewayError>;
}

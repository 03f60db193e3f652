use async_trait::async_trait;

use super::subscription::StatementKey;

/// Decides whether a streaming statement may keep consuming rows once it
/// reaches the configured cap.
#[async_trait]
pub trait RowLimitPolicy: Send + Sync {
    async fn should_continue(&self, key: &StatementKey, rows: usize) -> bool;
}

/// Never stops a statement.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysContinue;

#[async_trait]
impl RowLimitPolicy for AlwaysContinue {
    async fn should_continue(&self, _key: &StatementKey, _rows: usize) -> bool {
        true
    }
}

/// Stops every statement at the cap.
#[derive(Debug, Default, Clone, Copy)]
pub struct StopAtLimit;

#[async_trait]
impl RowLimitPolicy for StopAtLimit {
    async fn should_continue(&self, _key: &StatementKey, _rows: usize) -> bool {
        false
    }
}

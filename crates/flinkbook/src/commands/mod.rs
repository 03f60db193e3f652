use async_trait::async_trait;
use eyre::Result;

pub mod config;
pub mod query;
pub mod render;
pub mod serve;

#[async_trait]
pub trait Command {
    async fn execute(&self) -> Result<()>;
}

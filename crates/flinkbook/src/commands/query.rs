use async_trait::async_trait;
use eyre::{Result, eyre};
use futures::StreamExt;
use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info};

use super::Command;
use super::render::result_table;
use crate::cli::LimitAction;
use flinkbook_core::ClusterContext;
use flinkbook_core::config::Settings;
use flinkbook_core::execution::{
    AlwaysContinue, RowLimitPolicy, StatementKey, StopAtLimit, TerminalStatus,
};

pub struct QueryCommand {
    pub settings: Settings,
    pub sql: String,
    pub gateway_url: Option<String>,
    pub key: Option<String>,
    pub on_limit: LimitAction,
}

#[async_trait]
impl Command for QueryCommand {
    async fn execute(&self) -> Result<()> {
        let builder =
            ClusterContext::builder(self.settings.clone()).row_limit_policy(policy(self.on_limit));
        let builder = match &self.gateway_url {
            Some(url) => builder.gateway_url(url.clone()),
            None => builder.local_runtime(),
        };
        let context = builder.build()?;

        if let Some(runtime_info) = context.start_runtime().await? {
            info!(gateway = %runtime_info.gateway_url, "Local runtime ready");
        }

        let key = self
            .key
            .clone()
            .map_or_else(StatementKey::generate, StatementKey::from);
        let mut stdout = std::io::stdout();
        let outcome = run_statement(&context, key, &self.sql, interrupted(), &mut stdout).await;

        context.shutdown().await?;
        outcome
    }
}

fn policy(action: LimitAction) -> Arc<dyn RowLimitPolicy> {
    match action {
        LimitAction::Prompt => Arc::new(PromptRowLimit),
        LimitAction::Continue => Arc::new(AlwaysContinue),
        LimitAction::Stop => Arc::new(StopAtLimit),
    }
}

/// Resolves on Ctrl+C. Never resolves if the handler cannot be installed.
async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Run `sql` to completion and print its final result. The first time
/// `interrupt` resolves the statement is canceled.
pub async fn run_statement<W, F>(
    context: &ClusterContext,
    key: StatementKey,
    sql: &str,
    interrupt: F,
    out: &mut W,
) -> Result<()>
where
    W: Write + Send,
    F: Future<Output = ()> + Send,
{
    let coordinator = context.coordinator();
    let mut run = coordinator.run_with_key(key, sql);
    let key = run.key().clone();
    tokio::pin!(interrupt);

    let mut canceling = false;
    let mut reported_rows = 0;
    let mut last = None;

    loop {
        tokio::select! {
            snapshot = run.next() => {
                let Some(snapshot) = snapshot else { break };
                if snapshot.streaming && !snapshot.is_terminal() && snapshot.rows.len() != reported_rows {
                    reported_rows = snapshot.rows.len();
                    writeln!(out, "... {reported_rows} rows")?;
                }
                let done = snapshot.is_terminal();
                last = Some(snapshot);
                if done {
                    break;
                }
            }
            () = &mut interrupt, if !canceling => {
                canceling = true;
                info!(key = %key, "Interrupted, canceling statement");
                let canceled = coordinator.cancel(&key).await?;
                debug!(key = %key, canceled, "Cancel requested");
            }
        }
    }

    let snapshot = last.ok_or_else(|| eyre!("Statement {key} ended without a result"))?;
    let rows = snapshot.rows.len();
    if !snapshot.columns.is_empty() {
        writeln!(out, "{}", result_table(&snapshot))?;
    }

    match snapshot.terminal {
        Some(TerminalStatus::Finished) => {
            writeln!(out, "{rows} row(s)")?;
            Ok(())
        }
        Some(TerminalStatus::Canceled) => {
            writeln!(out, "Canceled after {rows} row(s)")?;
            Ok(())
        }
        Some(TerminalStatus::Failed(e)) => Err(e.into()),
        None => Err(eyre!("Statement {key} ended before reaching a final state")),
    }
}

/// Asks on the terminal whether a streaming statement may keep going.
pub struct PromptRowLimit;

#[async_trait]
impl RowLimitPolicy for PromptRowLimit {
    async fn should_continue(&self, key: &StatementKey, rows: usize) -> bool {
        let prompt = format!("Statement {key} has returned {rows} rows. Keep streaming? [y/N] ");
        tokio::task::spawn_blocking(move || confirm(&prompt))
            .await
            .unwrap_or(false)
    }
}

fn confirm(prompt: &str) -> bool {
    let mut stderr = std::io::stderr();
    if write!(stderr, "{prompt}").and_then(|()| stderr.flush()).is_err() {
        return false;
    }
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    is_yes(&answer)
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

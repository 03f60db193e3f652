use async_trait::async_trait;
use eyre::{Result, eyre};
use std::io::Write;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::Command;
use super::render::runtime_table;
use flinkbook_core::config::Settings;
use flinkbook_core::runtime::RuntimeEvent;
use flinkbook_core::{ClusterContext, Error};

pub struct ServeCommand {
    pub settings: Settings,
}

#[async_trait]
impl Command for ServeCommand {
    async fn execute(&self) -> Result<()> {
        let context = ClusterContext::builder(self.settings.clone())
            .local_runtime()
            .build()?;
        let runtime = context
            .runtime()
            .ok_or_else(|| eyre!("No local runtime configured"))?
            .clone();
        let mut events = runtime.subscribe();

        info!("Starting local runtime");
        let runtime_info = match runtime.start().await {
            Ok(runtime_info) => runtime_info,
            Err(e) => {
                if let Some(output) = e.recent_output() {
                    writeln!(std::io::stderr(), "{output}")?;
                }
                return Err(Error::from(e).into());
            }
        };

        let mut stdout = std::io::stdout();
        writeln!(stdout, "{}", runtime_table(&runtime_info))?;
        writeln!(stdout, "Press Ctrl+C to shutdown")?;

        let crash = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Shutdown signal received");
                None
            }
            crash = wait_for_crash(&mut events) => crash,
        };

        context.shutdown().await?;
        info!("Runtime shutdown complete");

        match crash {
            Some((code, signal)) => {
                for line in runtime.recent_logs() {
                    writeln!(std::io::stderr(), "{}", line.line)?;
                }
                Err(eyre!(
                    "Runtime exited unexpectedly (code {code:?}, signal {signal:?})"
                ))
            }
            None => Ok(()),
        }
    }
}

/// Resolves with the exit details once the runtime crashes. Never resolves
/// if the event channel closes first.
async fn wait_for_crash(
    events: &mut broadcast::Receiver<RuntimeEvent>,
) -> Option<(Option<i32>, Option<i32>)> {
    loop {
        match events.recv().await {
            Ok(RuntimeEvent::Crashed { code, signal }) => return Some((code, signal)),
            Ok(RuntimeEvent::StateChanged { from, to }) => {
                info!(%from, %to, "Runtime state changed");
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(lagged = n, "Missed runtime events");
            }
            Err(broadcast::error::RecvError::Closed) => {
                std::future::pending::<()>().await;
            }
        }
    }
}

//! Explicit wiring of the runtime supervisor, session registry and execution
//! coordinator. Independent contexts share nothing.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::Result;
use crate::execution::{ExecutionCoordinator, RowLimitPolicy};
use crate::gateway::{GatewayApi, SqlGatewayClient};
use crate::runtime::{RuntimeEvent, RuntimeInfo, RuntimeSupervisor};
use crate::session::SessionRegistry;

pub struct ClusterContext {
    settings: Settings,
    runtime: Option<Arc<RuntimeSupervisor>>,
    gateway: Arc<dyn GatewayApi>,
    sessions: Arc<SessionRegistry>,
    coordinator: Arc<ExecutionCoordinator>,
    crash_watch: Option<JoinHandle<()>>,
}

pub struct ClusterContextBuilder {
    settings: Settings,
    gateway: Option<Arc<dyn GatewayApi>>,
    gateway_url: Option<String>,
    runtime: Option<RuntimeSupervisor>,
    row_limit: Option<Arc<dyn RowLimitPolicy>>,
}

impl ClusterContextBuilder {
    pub fn gateway(mut self, gateway: Arc<dyn GatewayApi>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Talk to a gateway at `url` instead of the local runtime's port.
    pub fn gateway_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_url = Some(url.into());
        self
    }

    /// Manage a local runtime. Sessions are refused until it is running.
    pub fn runtime(mut self, runtime: RuntimeSupervisor) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn local_runtime(self) -> Self {
        let runtime = RuntimeSupervisor::new(self.settings.runtime.clone());
        self.runtime(runtime)
    }

    pub fn row_limit_policy(mut self, policy: Arc<dyn RowLimitPolicy>) -> Self {
        self.row_limit = Some(policy);
        self
    }

    /// Must be called from within a tokio runtime when a local runtime is managed.
    pub fn build(self) -> Result<ClusterContext> {
        let gateway: Arc<dyn GatewayApi> = match self.gateway {
            Some(gateway) => gateway,
            None => {
                let url = self
                    .gateway_url
                    .unwrap_or_else(|| self.settings.runtime.gateway_url());
                Arc::new(SqlGatewayClient::new(&url)?)
            }
        };

        let mut sessions = SessionRegistry::new(
            gateway.clone(),
            self.settings.session.clone(),
            self.settings.runtime.parallelism,
        );
        if let Some(runtime) = &self.runtime {
            sessions = sessions.with_runtime_state(runtime.state_watch());
        }
        let sessions = Arc::new(sessions);

        let mut coordinator = ExecutionCoordinator::new(
            gateway.clone(),
            sessions.clone(),
            self.settings.execution.clone(),
        );
        if let Some(policy) = self.row_limit {
            coordinator = coordinator.with_row_limit_policy(policy);
        }

        let runtime = self.runtime.map(Arc::new);
        let crash_watch = runtime
            .as_ref()
            .map(|runtime| watch_crashes(runtime.subscribe(), sessions.clone()));

        Ok(ClusterContext {
            settings: self.settings,
            runtime,
            gateway,
            sessions,
            coordinator: Arc::new(coordinator),
            crash_watch,
        })
    }
}

fn watch_crashes(
    mut events: broadcast::Receiver<RuntimeEvent>,
    sessions: Arc<SessionRegistry>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RuntimeEvent::Crashed { code, signal }) => {
                    warn!(?code, ?signal, "Runtime crashed, dropping the cached session");
                    sessions.invalidate().await;
                }
                Ok(RuntimeEvent::StateChanged { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "Crash watcher lagged behind runtime events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

impl ClusterContext {
    pub fn builder(settings: Settings) -> ClusterContextBuilder {
        ClusterContextBuilder {
            settings,
            gateway: None,
            gateway_url: None,
            runtime: None,
            row_limit: None,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn runtime(&self) -> Option<&Arc<RuntimeSupervisor>> {
        self.runtime.as_ref()
    }

    pub fn gateway(&self) -> &Arc<dyn GatewayApi> {
        &self.gateway
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn coordinator(&self) -> &Arc<ExecutionCoordinator> {
        &self.coordinator
    }

    /// Start the managed runtime. Without one this is a no-op.
    pub async fn start_runtime(&self) -> Result<Option<RuntimeInfo>> {
        match &self.runtime {
            Some(runtime) => Ok(Some(runtime.start().await?)),
            None => Ok(None),
        }
    }

    /// Stop all statements, close the session and stop the managed runtime.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down cluster context");
        self.coordinator.cancel_all().await;
        if let Err(e) = self.sessions.close_session().await {
            warn!(error = %e, "Failed to close session during shutdown");
        }
        if let Some(runtime) = &self.runtime {
            runtime.stop().await?;
        }
        Ok(())
    }
}

impl Drop for ClusterContext {
    fn drop(&mut self) {
        if let Some(task) = self.crash_watch.take() {
            task.abort();
        }
    }
}

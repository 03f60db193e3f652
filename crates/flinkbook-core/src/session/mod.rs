//! At most one live SQL Gateway session, created lazily and revalidated on use.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::config::SessionSettings;
use crate::gateway::{GatewayApi, GatewayError, OpenSessionRequest, SessionHandle};
use crate::runtime::RuntimeState;

pub const RUNTIME_MODE_PROPERTY: &str = "execution.runtime-mode";
pub const PARALLELISM_PROPERTY: &str = "parallelism.default";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Flink runtime is not available: {details}")]
    RuntimeUnavailable { details: String },

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub handle: SessionHandle,
    pub created_at: DateTime<Utc>,
    pub properties: BTreeMap<String, String>,
}

pub struct SessionRegistry {
    gateway: Arc<dyn GatewayApi>,
    settings: SessionSettings,
    parallelism: u32,
    runtime: Option<watch::Receiver<RuntimeState>>,
    cached: Mutex<Option<Session>>,
}

impl SessionRegistry {
    pub fn new(gateway: Arc<dyn GatewayApi>, settings: SessionSettings, parallelism: u32) -> Self {
        Self {
            gateway,
            settings,
            parallelism,
            runtime: None,
            cached: Mutex::new(None),
        }
    }

    /// Refuse to create sessions unless the local runtime is running.
    pub fn with_runtime_state(mut self, runtime: watch::Receiver<RuntimeState>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Properties sent when opening a session: defaults, then user overrides.
    pub fn session_properties(&self) -> BTreeMap<String, String> {
        let mut properties = BTreeMap::from([
            (
                RUNTIME_MODE_PROPERTY.to_string(),
                self.settings.execution_mode.to_string(),
            ),
            (
                PARALLELISM_PROPERTY.to_string(),
                self.parallelism.to_string(),
            ),
        ]);
        properties.extend(
            self.settings
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        properties
    }

    /// The cached session, if any, without touching the gateway.
    pub async fn current(&self) -> Option<Session> {
        self.cached.lock().await.clone()
    }

    pub async fn get_or_create_session(&self) -> Result<Session, SessionError> {
        if let Some(runtime) = &self.runtime {
            let state = *runtime.borrow();
            if state != RuntimeState::Running {
                return Err(SessionError::RuntimeUnavailable {
                    details: format!("runtime is {state}"),
                });
            }
        }

        let mut cached = self.cached.lock().await;
        if let Some(session) = cached.as_ref() {
            match self.gateway.session_exists(&session.handle).await {
                Ok(true) => return Ok(session.clone()),
                Ok(false) => {
                    info!(session_id = %session.handle, "Cached session expired, creating a new one");
                }
                Err(e) => {
                    warn!(session_id = %session.handle, error = %e, "Session check failed, creating a new one");
                }
            }
            *cached = None;
        }

        let properties = self.session_properties();
        let request = OpenSessionRequest {
            name: self.settings.name.clone(),
            properties: properties.clone(),
        };
        let handle = self
            .gateway
            .open_session(&request)
            .await
            .map_err(|e| match e {
                GatewayError::Network(e) => SessionError::RuntimeUnavailable {
                    details: e.to_string(),
                },
                other => SessionError::Gateway(other),
            })?;

        info!(session_id = %handle, "Opened SQL Gateway session");
        let session = Session {
            handle,
            created_at: Utc::now(),
            properties,
        };
        *cached = Some(session.clone());
        Ok(session)
    }

    /// Drop the cached session without contacting the gateway.
    pub async fn invalidate(&self) {
        if let Some(session) = self.cached.lock().await.take() {
            debug!(session_id = %session.handle, "Invalidated cached session");
        }
    }

    /// Close the cached session. Idempotent; a session the gateway no longer
    /// knows about counts as closed.
    pub async fn close_session(&self) -> Result<(), SessionError> {
        let Some(session) = self.cached.lock().await.take() else {
            return Ok(());
        };
        match self.gateway.close_session(&session.handle).await {
            Ok(()) => {
                info!(session_id = %session.handle, "Closed SQL Gateway session");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(session_id = %session.handle, "Session already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::gateway::{OperationHandle, SessionHandle};

/// Stable identifier of one statement run, chosen by the caller or generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatementKey(String);

impl StatementKey {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StatementKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for StatementKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl fmt::Display for StatementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) type OperationTarget = (SessionHandle, OperationHandle);

/// Control record shared between a running statement and the coordinator.
pub(crate) struct Subscription {
    key: StatementKey,
    stop: AtomicBool,
    paused: AtomicBool,
    streaming: AtomicBool,
    paused_at: Mutex<Option<DateTime<Utc>>>,
    job_id: Mutex<Option<String>>,
    // Guards the handoff between a stop request and operation admission.
    operation: Mutex<Option<OperationTarget>>,
    wake: Notify,
}

impl Subscription {
    pub(crate) fn new(key: StatementKey) -> Self {
        Self {
            key,
            stop: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            streaming: AtomicBool::new(false),
            paused_at: Mutex::new(None),
            job_id: Mutex::new(None),
            operation: Mutex::new(None),
            wake: Notify::new(),
        }
    }

    pub(crate) fn key(&self) -> &StatementKey {
        &self.key
    }

    /// Record the admitted operation. Returns `true` if a stop was already
    /// requested, in which case the caller is responsible for the remote cancel.
    pub(crate) fn attach_operation(&self, target: OperationTarget) -> bool {
        let mut slot = lock(&self.operation);
        *slot = Some(target);
        self.stop.load(Ordering::SeqCst)
    }

    /// Returns the operation to cancel remotely, if one was already admitted.
    pub(crate) fn request_stop(&self) -> Option<OperationTarget> {
        let slot = lock(&self.operation);
        self.stop.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        slot.clone()
    }

    pub(crate) fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_streaming(&self) {
        self.streaming.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    /// Returns `false` if the flag already had this value.
    pub(crate) fn set_paused(&self, paused: bool) -> bool {
        if self.paused.swap(paused, Ordering::SeqCst) == paused {
            return false;
        }
        *lock(&self.paused_at) = paused.then(Utc::now);
        if !paused {
            self.wake.notify_one();
        }
        true
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub(crate) fn paused_at(&self) -> Option<DateTime<Utc>> {
        *lock(&self.paused_at)
    }

    pub(crate) fn set_job_id(&self, job_id: &str) {
        let mut current = lock(&self.job_id);
        if current.as_deref() != Some(job_id) {
            *current = Some(job_id.to_string());
        }
    }

    pub(crate) fn job_id(&self) -> Option<String> {
        lock(&self.job_id).clone()
    }

    /// Sleep for `duration`, returning early on a stop or resume.
    pub(crate) async fn wait(&self, duration: Duration) {
        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            () = self.wake.notified() => {}
        }
    }
}

/// Live statements by key.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: Mutex<HashMap<StatementKey, Arc<Subscription>>>,
}

impl SubscriptionRegistry {
    /// Returns the record previously registered under the same key.
    pub(crate) fn insert(&self, subscription: Arc<Subscription>) -> Option<Arc<Subscription>> {
        lock(&self.entries).insert(subscription.key().clone(), subscription)
    }

    pub(crate) fn get(&self, key: &StatementKey) -> Option<Arc<Subscription>> {
        lock(&self.entries).get(key).cloned()
    }

    pub(crate) fn take(&self, key: &StatementKey) -> Option<Arc<Subscription>> {
        lock(&self.entries).remove(key)
    }

    /// Remove `subscription` unless its key has since been reused.
    pub(crate) fn remove(&self, subscription: &Arc<Subscription>) {
        let mut entries = lock(&self.entries);
        if entries
            .get(subscription.key())
            .is_some_and(|current| Arc::ptr_eq(current, subscription))
        {
            entries.remove(subscription.key());
        }
    }

    pub(crate) fn with_job(&self, job_id: &str) -> Vec<Arc<Subscription>> {
        lock(&self.entries)
            .values()
            .filter(|s| s.job_id().as_deref() == Some(job_id))
            .cloned()
            .collect()
    }

    pub(crate) fn drain(&self) -> Vec<Arc<Subscription>> {
        lock(&self.entries).drain().map(|(_, s)| s).collect()
    }

    pub(crate) fn keys(&self) -> Vec<StatementKey> {
        lock(&self.entries).keys().cloned().collect()
    }
}

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, trace, warn};

use crate::config::ExecutionSettings;
use crate::gateway::{
    Column, GatewayApi, GatewayError, OperationStatus, ResultKind, ResultPage, SessionHandle,
};
use crate::session::SessionRegistry;

use super::cursor;
use super::row_limit::{AlwaysContinue, RowLimitPolicy};
use super::rows::ResultRows;
use super::snapshot::{ExecutionError, ExecutionEvent, ResultSnapshot, TerminalStatus};
use super::subscription::{OperationTarget, StatementKey, Subscription, SubscriptionRegistry};

const SNAPSHOT_BUFFER: usize = 64;

/// `Err` carries the terminal status of a statement that ended early.
type Flow<T> = Result<T, TerminalStatus>;

/// Snapshots of one statement, ending with a terminal snapshot.
pub struct StatementRun {
    key: StatementKey,
    snapshots: ReceiverStream<ResultSnapshot>,
}

impl StatementRun {
    pub fn key(&self) -> &StatementKey {
        &self.key
    }

    /// Drain the run and return its terminal snapshot.
    pub async fn finish(mut self) -> Option<ResultSnapshot> {
        let mut last = None;
        while let Some(snapshot) = self.snapshots.next().await {
            last = Some(snapshot);
        }
        last
    }
}

impl Stream for StatementRun {
    type Item = ResultSnapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.snapshots).poll_next(cx)
    }
}

/// Runs statements against the SQL Gateway and turns their results into
/// snapshot streams.
pub struct ExecutionCoordinator {
    gateway: Arc<dyn GatewayApi>,
    sessions: Arc<SessionRegistry>,
    settings: ExecutionSettings,
    row_limit: Arc<dyn RowLimitPolicy>,
    subscriptions: Arc<SubscriptionRegistry>,
    events: broadcast::Sender<ExecutionEvent>,
}

impl ExecutionCoordinator {
    pub fn new(
        gateway: Arc<dyn GatewayApi>,
        sessions: Arc<SessionRegistry>,
        settings: ExecutionSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            gateway,
            sessions,
            settings,
            row_limit: Arc::new(AlwaysContinue),
            subscriptions: Arc::new(SubscriptionRegistry::default()),
            events,
        }
    }

    pub fn with_row_limit_policy(mut self, policy: Arc<dyn RowLimitPolicy>) -> Self {
        self.row_limit = policy;
        self
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    pub fn run(&self, sql: impl Into<String>) -> StatementRun {
        self.run_with_key(StatementKey::generate(), sql)
    }

    /// Run `sql` under `key`. A statement still running under the same key is
    /// canceled first.
    pub fn run_with_key(&self, key: StatementKey, sql: impl Into<String>) -> StatementRun {
        let subscription = Arc::new(Subscription::new(key.clone()));
        if let Some(previous) = self.subscriptions.insert(subscription.clone()) {
            info!(key = %key, "Replacing statement still running under the same key");
            self.notify_canceled(&previous);
            if let Some(target) = previous.request_stop() {
                let gateway = self.gateway.clone();
                let _cancel_task = tokio::spawn(async move {
                    cancel_remote(gateway.as_ref(), &target).await;
                });
            }
        }

        let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);
        let driver = StatementDriver {
            gateway: self.gateway.clone(),
            sessions: self.sessions.clone(),
            settings: self.settings.clone(),
            row_limit: self.row_limit.clone(),
            registry: self.subscriptions.clone(),
            sub: subscription,
            tx,
            sql: sql.into(),
            columns: Vec::new(),
            rows: ResultRows::new(),
            streaming: false,
            orphaned: None,
        };
        let _driver_task = tokio::spawn(driver.drive());

        StatementRun {
            key,
            snapshots: ReceiverStream::new(rx),
        }
    }

    /// Keys of statements that have not reached a terminal state.
    pub fn active_statements(&self) -> Vec<StatementKey> {
        self.subscriptions.keys()
    }

    /// Stop polling a streaming statement. The remote job keeps running.
    pub fn pause(&self, key: &StatementKey) -> bool {
        let Some(sub) = self.subscriptions.get(key) else {
            return false;
        };
        if !sub.is_streaming() || !sub.set_paused(true) {
            return false;
        }
        debug!(key = %key, "Paused statement");
        let _ = self.events.send(ExecutionEvent::Paused { key: key.clone() });
        true
    }

    pub fn resume(&self, key: &StatementKey) -> bool {
        let Some(sub) = self.subscriptions.get(key) else {
            return false;
        };
        if !sub.set_paused(false) {
            return false;
        }
        debug!(key = %key, "Resumed statement");
        let _ = self.events.send(ExecutionEvent::Resumed { key: key.clone() });
        true
    }

    /// When the statement was paused, for display.
    pub fn paused_since(&self, key: &StatementKey) -> Option<DateTime<Utc>> {
        self.subscriptions.get(key).and_then(|s| s.paused_at())
    }

    /// Stop a statement and cancel its remote operation. Returns `false` if
    /// no statement runs under `key`.
    pub async fn cancel(&self, key: &StatementKey) -> Result<bool, GatewayError> {
        let Some(sub) = self.subscriptions.take(key) else {
            return Ok(false);
        };
        info!(key = %key, "Canceling statement");
        self.notify_canceled(&sub);
        if let Some((session, operation)) = sub.request_stop() {
            match self.gateway.cancel_operation(&session, &operation).await {
                Ok(status) => debug!(operation = %operation, %status, "Remote cancel issued"),
                Err(e) if e.is_not_found() => {
                    debug!(operation = %operation, "Operation already gone");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Stop every statement reading from job `job_id`. The job itself is not
    /// touched. Returns how many statements were stopped.
    pub fn cancel_by_job(&self, job_id: &str) -> usize {
        let matching = self.subscriptions.with_job(job_id);
        for sub in &matching {
            info!(key = %sub.key(), job_id, "Stopping statement for canceled job");
            sub.request_stop();
            self.notify_canceled(sub);
        }
        matching.len()
    }

    /// Stop every statement and cancel their remote operations.
    pub async fn cancel_all(&self) {
        for sub in self.subscriptions.drain() {
            self.notify_canceled(&sub);
            if let Some(target) = sub.request_stop() {
                cancel_remote(self.gateway.as_ref(), &target).await;
            }
        }
    }

    fn notify_canceled(&self, sub: &Subscription) {
        let _ = self.events.send(ExecutionEvent::Canceled {
            key: sub.key().clone(),
            job_id: sub.job_id(),
        });
    }
}

async fn cancel_remote(gateway: &dyn GatewayApi, (session, operation): &OperationTarget) {
    if let Err(e) = gateway.cancel_operation(session, operation).await {
        warn!(operation = %operation, error = %e, "Failed to cancel operation");
    }
}

/// Drives one statement from submission to its terminal snapshot.
struct StatementDriver {
    gateway: Arc<dyn GatewayApi>,
    sessions: Arc<SessionRegistry>,
    settings: ExecutionSettings,
    row_limit: Arc<dyn RowLimitPolicy>,
    registry: Arc<SubscriptionRegistry>,
    sub: Arc<Subscription>,
    tx: mpsc::Sender<ResultSnapshot>,
    sql: String,
    columns: Vec<Column>,
    rows: ResultRows,
    streaming: bool,
    // Set when the consumer went away while the operation was still live.
    orphaned: Option<OperationTarget>,
}

impl StatementDriver {
    async fn drive(mut self) {
        let terminal = match self.execute().await {
            Ok(()) | Err(TerminalStatus::Finished) => TerminalStatus::Finished,
            Err(other) => other,
        };
        if let Some(target) = self.orphaned.take() {
            debug!(key = %self.sub.key(), "Snapshot consumer dropped, canceling operation");
            cancel_remote(self.gateway.as_ref(), &target).await;
        }
        self.registry.remove(&self.sub);

        match &terminal {
            TerminalStatus::Finished => {
                info!(key = %self.sub.key(), rows = self.rows.len(), "Statement finished");
            }
            TerminalStatus::Canceled => info!(key = %self.sub.key(), "Statement canceled"),
            TerminalStatus::Failed(e) => warn!(key = %self.sub.key(), error = %e, "Statement failed"),
        }
        self.emit(Some(terminal)).await;
    }

    async fn execute(&mut self) -> Flow<()> {
        let target = self.admit().await?;
        let status = self.await_running(&target).await?;
        let (page, cursor) = self.first_page(&target).await?;

        let status = if status == OperationStatus::Running {
            self.gateway
                .operation_status(&target.0, &target.1)
                .await
                .unwrap_or(status)
        } else {
            status
        };
        let streaming = page.kind != ResultKind::EndOfStream
            && page.next_cursor.is_some()
            && status == OperationStatus::Running;
        let next = cursor::advance(cursor, &page);
        debug!(key = %self.sub.key(), streaming, ?next, "Classified statement");

        if streaming {
            self.streaming = true;
            self.sub.mark_streaming();
            self.append(page);
            self.emit(None).await;
            if let Some(next) = next {
                self.stream(&target, next).await?;
            }
            self.streaming = false;
        } else {
            self.append_with_progress(page).await;
            if let Some(next) = next {
                self.collect_batch(&target, next).await?;
            }
            if let Err(e) = self.gateway.close_operation(&target.0, &target.1).await {
                debug!(operation = %target.1, error = %e, "Failed to close operation");
            }
        }
        Ok(())
    }

    fn check_stop(&self) -> Flow<()> {
        if self.sub.is_stop_requested() {
            Err(TerminalStatus::Canceled)
        } else {
            Ok(())
        }
    }

    async fn admit(&mut self) -> Flow<OperationTarget> {
        self.check_stop()?;
        let session = self.open_session().await?;
        let (session, operation) =
            match self.gateway.submit_statement(&session, &self.sql).await {
                Ok(operation) => (session, operation),
                Err(e) if e.is_not_found() => {
                    warn!(session_id = %session, "Session vanished, retrying with a new one");
                    self.sessions.invalidate().await;
                    let session = self.open_session().await?;
                    let operation = self
                        .gateway
                        .submit_statement(&session, &self.sql)
                        .await
                        .map_err(submit_failure)?;
                    (session, operation)
                }
                Err(e) => return Err(submit_failure(e)),
            };

        info!(key = %self.sub.key(), session_id = %session, operation = %operation, "Statement submitted");
        let target = (session, operation);
        if self.sub.attach_operation(target.clone()) {
            cancel_remote(self.gateway.as_ref(), &target).await;
            return Err(TerminalStatus::Canceled);
        }
        Ok(target)
    }

    async fn open_session(&self) -> Flow<SessionHandle> {
        self.sessions
            .get_or_create_session()
            .await
            .map(|s| s.handle)
            .map_err(|e| {
                TerminalStatus::Failed(ExecutionError::SessionUnavailable(e.to_string()))
            })
    }

    async fn await_running(&mut self, target: &OperationTarget) -> Flow<OperationStatus> {
        let (session, operation) = target;
        let attempts = self.settings.status_max_attempts.max(1);
        for attempt in 1..=attempts {
            self.check_stop()?;
            match self.gateway.operation_status(session, operation).await {
                Ok(status) if status.is_fetchable() => return Ok(status),
                Ok(OperationStatus::Error) => return Err(self.operation_failure(target).await),
                Ok(OperationStatus::Canceled) => return Err(TerminalStatus::Canceled),
                Ok(_) => trace!(operation = %operation, attempt, "Operation pending"),
                Err(e) if e.is_not_found() => {
                    return Err(TerminalStatus::Failed(ExecutionError::Operation(
                        e.details(),
                    )));
                }
                Err(e) => warn!(operation = %operation, attempt, error = %e, "Status check failed"),
            }
            if attempt < attempts {
                self.sub.wait(self.settings.status_poll_interval()).await;
            }
        }
        warn!(operation = %operation, attempts, "Operation did not start running");
        Err(TerminalStatus::Failed(ExecutionError::StatusTimeout {
            attempts,
        }))
    }

    /// The gateway only reports why an operation failed through the result endpoint.
    async fn operation_failure(&self, (session, operation): &OperationTarget) -> TerminalStatus {
        let message = match self.gateway.fetch_results(session, operation, 0).await {
            Err(e) => e.details(),
            Ok(_) => "Statement failed".to_string(),
        };
        TerminalStatus::Failed(ExecutionError::Operation(message))
    }

    /// Fetch until the first page that carries rows or ends the stream.
    async fn first_page(&mut self, target: &OperationTarget) -> Flow<(ResultPage, u64)> {
        let (session, operation) = target;
        self.sub.wait(self.settings.settle_delay()).await;

        let mut cursor = 0;
        let attempts = self.settings.fetch_max_attempts.max(1);
        for attempt in 1..=attempts {
            self.check_stop()?;
            match self.gateway.fetch_results(session, operation, cursor).await {
                Ok(page) => {
                    self.observe_job(&page);
                    match &page.kind {
                        ResultKind::EndOfStream => return Ok((page, cursor)),
                        ResultKind::Payload if page.has_rows() => return Ok((page, cursor)),
                        ResultKind::Payload => {
                            if let Some(next) = page.next_cursor.filter(|n| *n > cursor) {
                                cursor = next;
                                continue;
                            }
                        }
                        ResultKind::NotReady => {
                            trace!(operation = %operation, cursor, "Results not ready");
                        }
                        ResultKind::Other(kind) => {
                            debug!(operation = %operation, kind = %kind, "Unexpected result kind, retrying");
                        }
                    }
                }
                Err(e) => {
                    warn!(operation = %operation, attempt, error = %e, "Result fetch failed, retrying");
                }
            }
            self.sub.wait(self.settings.fetch_retry_interval()).await;
        }

        warn!(operation = %operation, attempts, "No results within the fetch budget");
        Err(TerminalStatus::Finished)
    }

    async fn collect_batch(&mut self, target: &OperationTarget, mut cursor: u64) -> Flow<()> {
        let (session, operation) = target;
        let attempts = self.settings.fetch_max_attempts.max(1);
        let mut idle = 0;
        loop {
            self.check_stop()?;
            match self.gateway.fetch_results(session, operation, cursor).await {
                Ok(page) => {
                    self.observe_job(&page);
                    let next = cursor::advance(cursor, &page);
                    match &page.kind {
                        ResultKind::EndOfStream => return Ok(()),
                        ResultKind::Payload => {
                            let moved = page.has_rows() || next.is_some_and(|n| n > cursor);
                            self.append_with_progress(page).await;
                            match next {
                                None => return Ok(()),
                                Some(next) if moved => {
                                    cursor = next;
                                    idle = 0;
                                    continue;
                                }
                                Some(_) => {}
                            }
                        }
                        ResultKind::NotReady => {}
                        ResultKind::Other(kind) => {
                            debug!(operation = %operation, kind = %kind, "Unexpected result kind, retrying");
                        }
                    }
                }
                Err(e) => warn!(operation = %operation, error = %e, "Result fetch failed, retrying"),
            }

            idle += 1;
            if idle >= attempts {
                warn!(operation = %operation, rows = self.rows.len(), "Giving up on remaining results");
                return Ok(());
            }
            self.sub.wait(self.settings.fetch_retry_interval()).await;
        }
    }

    async fn stream(&mut self, target: &OperationTarget, mut cursor: u64) -> Flow<()> {
        let (session, operation) = target;
        let cap = self.settings.row_limit.filter(|cap| *cap > 0);
        let mut threshold = cap;
        self.check_row_limit(cap, &mut threshold).await?;

        loop {
            self.check_stop()?;
            if self.sub.is_paused() {
                self.sub.wait(self.settings.stream_poll_interval()).await;
                continue;
            }

            match self.gateway.fetch_results(session, operation, cursor).await {
                Ok(page) => {
                    self.observe_job(&page);
                    if page.kind == ResultKind::EndOfStream {
                        return Ok(());
                    }
                    let next = cursor::advance(cursor, &page);
                    if page.has_rows() {
                        trace!(key = %self.sub.key(), cursor, rows = page.rows.len(), "Received rows");
                        self.append(page);
                        self.emit(None).await;
                    }
                    match next {
                        Some(next) => cursor = next,
                        None => return Ok(()),
                    }
                    self.check_row_limit(cap, &mut threshold).await?;
                }
                Err(e) => {
                    warn!(
                        operation = %operation,
                        cursor,
                        transient = e.is_transient(),
                        error = %e,
                        "Streaming fetch failed"
                    );
                    match self.gateway.operation_status(session, operation).await {
                        Ok(OperationStatus::Error) => {
                            return Err(TerminalStatus::Failed(ExecutionError::Operation(
                                e.details(),
                            )));
                        }
                        Ok(OperationStatus::Canceled) | Err(_) => {
                            return Err(TerminalStatus::Canceled);
                        }
                        Ok(_) => {
                            self.sub.wait(self.settings.transient_retry()).await;
                            continue;
                        }
                    }
                }
            }
            self.sub.wait(self.settings.stream_poll_interval()).await;
        }
    }

    async fn check_row_limit(&mut self, cap: Option<usize>, threshold: &mut Option<usize>) -> Flow<()> {
        let (Some(cap), Some(limit)) = (cap, *threshold) else {
            return Ok(());
        };
        if self.rows.len() < limit {
            return Ok(());
        }
        if self
            .row_limit
            .should_continue(self.sub.key(), self.rows.len())
            .await
        {
            *threshold = Some(limit.saturating_add(cap));
            Ok(())
        } else {
            info!(key = %self.sub.key(), rows = self.rows.len(), "Row limit reached, stopping");
            Err(TerminalStatus::Canceled)
        }
    }

    fn observe_job(&mut self, page: &ResultPage) {
        if let Some(job_id) = &page.job_id {
            self.sub.set_job_id(job_id);
        }
    }

    fn append(&mut self, page: ResultPage) {
        if !page.columns.is_empty() {
            self.columns = page.columns;
        }
        self.rows.append(page.rows);
    }

    /// Append a batch page, emitting a snapshot each time another
    /// `progress_every_rows` rows have accumulated.
    async fn append_with_progress(&mut self, page: ResultPage) {
        let before = self.rows.len();
        self.append(page);
        let every = self.settings.progress_every_rows;
        if every > 0 && before / every != self.rows.len() / every {
            self.emit(None).await;
        }
    }

    async fn emit(&mut self, terminal: Option<TerminalStatus>) {
        let snapshot = ResultSnapshot {
            key: self.sub.key().clone(),
            columns: self.columns.clone(),
            rows: self.rows.clone(),
            terminal,
            streaming: self.streaming,
            job_id: self.sub.job_id(),
        };
        if self.tx.send(snapshot).await.is_err() && self.orphaned.is_none() {
            self.orphaned = self.sub.request_stop();
        }
    }
}

fn submit_failure(e: GatewayError) -> TerminalStatus {
    TerminalStatus::Failed(ExecutionError::Submit(e.details()))
}

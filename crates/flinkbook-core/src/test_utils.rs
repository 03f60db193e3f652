//! In-memory fakes for the process host, liveness endpoint and SQL Gateway.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::gateway::{
    GatewayApi, GatewayError, OpenSessionRequest, OperationHandle, OperationStatus, ResultPage,
    SessionHandle,
};
use crate::runtime::{
    ExitOutcome, LaunchSpec, LivenessCheck, ProcessControl, ProcessError, ProcessHost,
    SpawnedProcess, TerminationSignal,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Controls one fake process.
#[derive(Clone)]
pub struct FakeProcess {
    pid: u32,
    exit: Arc<watch::Sender<Option<ExitOutcome>>>,
    signals: Arc<Mutex<Vec<TerminationSignal>>>,
    ignore_graceful: bool,
    ignore_kill: bool,
}

impl FakeProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Make the process exit, as if it died on its own.
    pub fn exit(&self, outcome: ExitOutcome) {
        self.exit.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        });
    }

    pub fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    pub fn signals(&self) -> Vec<TerminationSignal> {
        lock(&self.signals).clone()
    }
}

impl ProcessControl for FakeProcess {
    fn signal(&self, signal: TerminationSignal) -> Result<(), ProcessError> {
        if !self.is_alive() {
            return Err(ProcessError::AlreadyExited);
        }
        lock(&self.signals).push(signal);
        match signal {
            TerminationSignal::Graceful if !self.ignore_graceful => {
                self.exit(ExitOutcome::from_signal(15));
            }
            TerminationSignal::Forceful if !self.ignore_kill => {
                self.exit(ExitOutcome::from_signal(9));
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Default)]
struct HostState {
    launches: Vec<LaunchSpec>,
    processes: Vec<FakeProcess>,
}

/// A [`ProcessHost`] whose processes only exit when told to or signalled.
#[derive(Clone, Default)]
pub struct FakeProcessHost {
    state: Arc<Mutex<HostState>>,
    ignore_graceful: bool,
    ignore_kill: bool,
    fail_spawn: bool,
}

impl FakeProcessHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes survive SIGTERM and need a forceful kill.
    pub fn ignoring_graceful(mut self) -> Self {
        self.ignore_graceful = true;
        self
    }

    /// Processes survive every signal.
    pub fn unkillable(mut self) -> Self {
        self.ignore_graceful = true;
        self.ignore_kill = true;
        self
    }

    pub fn failing_spawn(mut self) -> Self {
        self.fail_spawn = true;
        self
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        lock(&self.state).launches.clone()
    }

    pub fn processes(&self) -> Vec<FakeProcess> {
        lock(&self.state).processes.clone()
    }

    pub fn last(&self) -> Option<FakeProcess> {
        lock(&self.state).processes.last().cloned()
    }

    pub fn live_count(&self) -> usize {
        lock(&self.state)
            .processes
            .iter()
            .filter(|p| p.is_alive())
            .count()
    }
}

impl ProcessHost for FakeProcessHost {
    fn spawn(&self, spec: &LaunchSpec) -> Result<SpawnedProcess, ProcessError> {
        let mut state = lock(&self.state);
        state.launches.push(spec.clone());
        if self.fail_spawn {
            return Err(ProcessError::Spawn {
                program: spec.program.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            });
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let process = FakeProcess {
            pid: 1000 + state.processes.len() as u32,
            exit: Arc::new(exit_tx),
            signals: Arc::default(),
            ignore_graceful: self.ignore_graceful,
            ignore_kill: self.ignore_kill,
        };
        state.processes.push(process.clone());

        Ok(SpawnedProcess {
            pid: Some(process.pid),
            control: Box::new(process),
            exit: exit_rx,
            stdout: Some(Box::pin(&b"Starting MiniCluster\n"[..])),
            stderr: None,
        })
    }
}

/// Reports ready after a fixed number of failed checks.
pub struct FakeLiveness {
    ready_after: Option<usize>,
    calls: AtomicUsize,
}

impl FakeLiveness {
    pub fn ready_after(failed_checks: usize) -> Self {
        Self {
            ready_after: Some(failed_checks),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn never() -> Self {
        Self {
            ready_after: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LivenessCheck for FakeLiveness {
    async fn is_live(&self) -> bool {
        let previous = self.calls.fetch_add(1, Ordering::SeqCst);
        self.ready_after.is_some_and(|n| previous >= n)
    }
}

/// A scripted gateway failure. [`GatewayError`] is not `Clone`, so scripts hold these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedFailure {
    NotFound(String),
    Server(u16, String),
}

impl From<ScriptedFailure> for GatewayError {
    fn from(failure: ScriptedFailure) -> Self {
        match failure {
            ScriptedFailure::NotFound(details) => GatewayError::NotFound { details },
            ScriptedFailure::Server(status_code, details) => {
                GatewayError::Server {
                    status_code,
                    details,
                }
            }
        }
    }
}

pub type Scripted<T> = Result<T, ScriptedFailure>;

/// Responses for one submitted statement.
///
/// Status responses are consumed in order; the last one repeats. Result pages
/// are consumed in order; once exhausted every fetch returns an empty page
/// pointing back at the requested cursor.
#[derive(Debug, Clone)]
pub struct StatementScript {
    statuses: VecDeque<Scripted<OperationStatus>>,
    pages: VecDeque<Scripted<ResultPage>>,
}

impl Default for StatementScript {
    fn default() -> Self {
        Self {
            statuses: VecDeque::from([Ok(OperationStatus::Running)]),
            pages: VecDeque::new(),
        }
    }
}

impl StatementScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statuses(mut self, statuses: impl IntoIterator<Item = OperationStatus>) -> Self {
        self.statuses = statuses.into_iter().map(Ok).collect();
        self
    }

    pub fn status_results(mut self, statuses: impl IntoIterator<Item = Scripted<OperationStatus>>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn page(mut self, page: ResultPage) -> Self {
        self.pages.push_back(Ok(page));
        self
    }

    pub fn pages(mut self, pages: impl IntoIterator<Item = ResultPage>) -> Self {
        self.pages.extend(pages.into_iter().map(Ok));
        self
    }

    pub fn fetch_failure(mut self, failure: ScriptedFailure) -> Self {
        self.pages.push_back(Err(failure));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    OpenSession(OpenSessionRequest),
    SessionExists(SessionHandle),
    CloseSession(SessionHandle),
    Submit { session: SessionHandle, sql: String },
    Status(OperationHandle),
    Fetch { operation: OperationHandle, cursor: u64 },
    Cancel(OperationHandle),
    CloseOperation(OperationHandle),
}

#[derive(Default)]
struct GatewayState {
    calls: Vec<GatewayCall>,
    next_session: usize,
    live_sessions: HashSet<SessionHandle>,
    pending_scripts: VecDeque<StatementScript>,
    operations: HashMap<OperationHandle, StatementScript>,
    submit_failures: VecDeque<ScriptedFailure>,
    open_failures: VecDeque<ScriptedFailure>,
    next_operation: usize,
}

/// A [`GatewayApi`] that replays per-statement scripts and records every call.
#[derive(Clone, Default)]
pub struct ScriptedGateway {
    state: Arc<Mutex<GatewayState>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the script for the next submitted statement.
    pub fn script(&self, script: StatementScript) -> &Self {
        lock(&self.state).pending_scripts.push_back(script);
        self
    }

    pub fn fail_next_submit(&self, failure: ScriptedFailure) -> &Self {
        lock(&self.state).submit_failures.push_back(failure);
        self
    }

    pub fn fail_next_open(&self, failure: ScriptedFailure) -> &Self {
        lock(&self.state).open_failures.push_back(failure);
        self
    }

    /// Forget a session server-side, as if it had expired.
    pub fn expire_session(&self, session: &SessionHandle) {
        lock(&self.state).live_sessions.remove(session);
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        lock(&self.state).calls.clone()
    }

    pub fn fetch_cursors(&self, operation: &OperationHandle) -> Vec<u64> {
        lock(&self.state)
            .calls
            .iter()
            .filter_map(|call| match call {
                GatewayCall::Fetch { operation: op, cursor } if op == operation => Some(*cursor),
                _ => None,
            })
            .collect()
    }

    pub fn fetch_count(&self) -> usize {
        self.count(|call| matches!(call, GatewayCall::Fetch { .. }))
    }

    pub fn cancel_count(&self) -> usize {
        self.count(|call| matches!(call, GatewayCall::Cancel(_)))
    }

    pub fn count(&self, predicate: impl Fn(&GatewayCall) -> bool) -> usize {
        lock(&self.state).calls.iter().filter(|c| predicate(c)).count()
    }

    fn record(&self, call: GatewayCall) -> MutexGuard<'_, GatewayState> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        state
    }
}

#[async_trait]
impl GatewayApi for ScriptedGateway {
    async fn open_session(
        &self,
        request: &OpenSessionRequest,
    ) -> Result<SessionHandle, GatewayError> {
        let mut state = self.record(GatewayCall::OpenSession(request.clone()));
        if let Some(failure) = state.open_failures.pop_front() {
            return Err(failure.into());
        }
        state.next_session += 1;
        let session = SessionHandle::new(format!("session-{}", state.next_session));
        state.live_sessions.insert(session.clone());
        Ok(session)
    }

    async fn session_exists(&self, session: &SessionHandle) -> Result<bool, GatewayError> {
        let state = self.record(GatewayCall::SessionExists(session.clone()));
        Ok(state.live_sessions.contains(session))
    }

    async fn close_session(&self, session: &SessionHandle) -> Result<(), GatewayError> {
        let mut state = self.record(GatewayCall::CloseSession(session.clone()));
        if state.live_sessions.remove(session) {
            Ok(())
        } else {
            Err(GatewayError::NotFound {
                details: format!("Session '{session}' does not exist."),
            })
        }
    }

    async fn submit_statement(
        &self,
        session: &SessionHandle,
        sql: &str,
    ) -> Result<OperationHandle, GatewayError> {
        let mut state = self.record(GatewayCall::Submit {
            session: session.clone(),
            sql: sql.to_string(),
        });
        if let Some(failure) = state.submit_failures.pop_front() {
            return Err(failure.into());
        }
        if !state.live_sessions.contains(session) {
            return Err(GatewayError::NotFound {
                details: format!("Session '{session}' does not exist."),
            });
        }
        state.next_operation += 1;
        let operation = OperationHandle::new(format!("op-{}", state.next_operation));
        let script = state.pending_scripts.pop_front().unwrap_or_default();
        state.operations.insert(operation.clone(), script);
        Ok(operation)
    }

    async fn operation_status(
        &self,
        _session: &SessionHandle,
        operation: &OperationHandle,
    ) -> Result<OperationStatus, GatewayError> {
        let mut state = self.record(GatewayCall::Status(operation.clone()));
        let Some(script) = state.operations.get_mut(operation) else {
            return Err(GatewayError::NotFound {
                details: format!("Can not find the submitted operation {operation}"),
            });
        };
        let next = if script.statuses.len() > 1 {
            script.statuses.pop_front()
        } else {
            script.statuses.front().cloned()
        };
        next.unwrap_or(Ok(OperationStatus::Running))
            .map_err(GatewayError::from)
    }

    async fn fetch_results(
        &self,
        _session: &SessionHandle,
        operation: &OperationHandle,
        cursor: u64,
    ) -> Result<ResultPage, GatewayError> {
        let mut state = self.record(GatewayCall::Fetch {
            operation: operation.clone(),
            cursor,
        });
        let Some(script) = state.operations.get_mut(operation) else {
            return Err(GatewayError::NotFound {
                details: format!("Can not find the submitted operation {operation}"),
            });
        };
        match script.pages.pop_front() {
            Some(page) => page.map_err(GatewayError::from),
            None => Ok(ResultPage::payload(Vec::new(), Vec::new(), Some(cursor))),
        }
    }

    async fn cancel_operation(
        &self,
        _session: &SessionHandle,
        operation: &OperationHandle,
    ) -> Result<OperationStatus, GatewayError> {
        let mut state = self.record(GatewayCall::Cancel(operation.clone()));
        if let Some(script) = state.operations.get_mut(operation) {
            script.statuses = VecDeque::from([Ok(OperationStatus::Canceled)]);
        }
        Ok(OperationStatus::Canceled)
    }

    async fn close_operation(
        &self,
        _session: &SessionHandle,
        operation: &OperationHandle,
    ) -> Result<(), GatewayError> {
        let mut state = self.record(GatewayCall::CloseOperation(operation.clone()));
        state.operations.remove(operation);
        Ok(())
    }
}

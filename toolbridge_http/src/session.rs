//! JSON-RPC session with one provider process.
//!
//! ## Lifecycle
//!
//! ```text
//! Uninitialized ──ensure_ready()──▶ Initializing ──result frame──▶ Ready
//!                                       │                            │
//!                     timeout / error / exit                   child exits
//!                                       ▼                            ▼
//!                                    Failed                     Terminated
//! ```
//!
//! `Failed` and `Terminated` are not resumable: the next `ensure_ready()`
//! spawns a fresh process and runs the handshake from scratch. Concurrent
//! `ensure_ready()` calls made while a handshake is in flight all await that
//! one handshake, so a cold start spawns exactly one process.
//!
//! ## Correlation
//!
//! Every outbound request gets a fresh id from the session's counter, which
//! survives restarts, so an id is never reused. Responses are matched purely
//! by id; the order in which the child answers does not matter. A response
//! whose id has no pending call (already answered, timed out, or never
//! issued) is dropped with a diagnostic.

use crate::config::ProviderSpec;
use crate::error::{BridgeError, Result};
use crate::supervisor::{ChildProcess, ExitReason, FrameReceiver, ProcessSupervisor};
use dashmap::DashMap;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use serde::Serialize;
use serde_json::Value;
use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::sync::oneshot;
use toolbridge_common::message::{self, MessageKind, RequestId, RpcError};
use tracing::{debug, info, warn};

/// Client name sent in `clientInfo` during the handshake.
pub const CLIENT_NAME: &str = "toolbridge";

/// Externally visible lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
    Terminated,
}

/// Snapshot of a session, as reported by the health probe.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    /// A child process exists and has not exited.
    pub running: bool,
    /// The handshake completed and the child is still alive.
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub pending_calls: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// An in-flight request awaiting its response.
struct PendingCall {
    method: String,
    enqueued_at: Instant,
    responder: oneshot::Sender<Result<Value>>,
}

/// Drops the pending entry when the caller finishes or goes away.
struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Pending calls of one child, keyed by request id.
struct PendingCalls {
    provider: String,
    calls: DashMap<String, PendingCall>,
    closed: AtomicBool,
}

impl PendingCalls {
    fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            calls: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn register(&self, id: &RequestId, method: &str) -> Result<oneshot::Receiver<Result<Value>>> {
        let (tx, rx) = oneshot::channel();
        let key = id.correlation_key();
        self.calls.insert(
            key.clone(),
            PendingCall {
                method: method.to_string(),
                enqueued_at: Instant::now(),
                responder: tx,
            },
        );

        // close() sets the flag before draining, so either the drain sees
        // this entry or this check sees the flag.
        if self.closed.load(Ordering::SeqCst) {
            self.calls.remove(&key);
            return Err(BridgeError::NotReady {
                provider: self.provider.clone(),
            });
        }
        Ok(rx)
    }

    fn remove(&self, id: &RequestId) {
        self.calls.remove(&id.correlation_key());
    }

    /// Hand a response frame to its waiter. Returns false if nobody waits for it.
    fn resolve(&self, frame: Value) -> bool {
        let Some(id) = RequestId::from_message(&frame) else {
            debug!(provider = %self.provider, "Dropping response without usable id");
            return false;
        };

        match self.calls.remove(&id.correlation_key()) {
            Some((_, call)) => {
                debug!(
                    provider = %self.provider,
                    id = %id,
                    method = %call.method,
                    elapsed_ms = call.enqueued_at.elapsed().as_millis() as u64,
                    "Response matched pending call"
                );
                if call.responder.send(Ok(frame)).is_err() {
                    debug!(provider = %self.provider, id = %id, "Caller went away before the response arrived");
                }
                true
            }
            None => {
                debug!(
                    provider = %self.provider,
                    id = %id,
                    "Dropping response with no pending call (late, duplicate or never issued)"
                );
                false
            }
        }
    }

    /// Reject every pending call and refuse new ones.
    fn close(&self, error: &BridgeError) {
        self.closed.store(true, Ordering::SeqCst);
        let keys: Vec<String> = self.calls.iter().map(|entry| entry.key().clone()).collect();
        if !keys.is_empty() {
            warn!(
                provider = %self.provider,
                pending_count = keys.len(),
                "Rejecting pending calls: {}", error
            );
        }
        for key in keys {
            if let Some((_, call)) = self.calls.remove(&key) {
                let _ = call.responder.send(Err(error.clone()));
            }
        }
    }

    fn len(&self) -> usize {
        self.calls.len()
    }
}

/// A child that completed the handshake, plus its correlation table.
struct Connection {
    generation: u64,
    child: Arc<ChildProcess>,
    pending: PendingCalls,
}

impl Connection {
    fn is_alive(&self) -> bool {
        self.child.is_running() && !self.pending.closed.load(Ordering::SeqCst)
    }
}

type InitOutcome = Shared<BoxFuture<'static, Result<Arc<Connection>>>>;

enum Phase {
    Uninitialized,
    Initializing {
        generation: u64,
        outcome: InitOutcome,
    },
    Ready(Arc<Connection>),
    Failed(BridgeError),
    Terminated(ExitReason),
}

struct SessionInner {
    name: String,
    supervisor: ProcessSupervisor,
    phase: Mutex<Phase>,
    next_id: AtomicU64,
    generation: AtomicU64,
    init_timeout: Duration,
    call_timeout: Duration,
}

/// Handle to the JSON-RPC session of one provider. Cheap to clone.
#[derive(Clone)]
pub struct RpcSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSession")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl RpcSession {
    pub fn new(
        spec: ProviderSpec,
        init_timeout: Duration,
        call_timeout: Duration,
        colored_output: bool,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                name: spec.name.clone(),
                supervisor: ProcessSupervisor::new(spec, colored_output),
                phase: Mutex::new(Phase::Uninitialized),
                next_id: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                init_timeout,
                call_timeout,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> SessionState {
        match &*self.inner.lock_phase() {
            Phase::Uninitialized => SessionState::Uninitialized,
            Phase::Initializing { .. } => SessionState::Initializing,
            Phase::Ready(conn) if conn.is_alive() => SessionState::Ready,
            Phase::Ready(_) | Phase::Terminated(_) => SessionState::Terminated,
            Phase::Failed(_) => SessionState::Failed,
        }
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.state();
        let (pending_calls, last_error) = match &*self.inner.lock_phase() {
            Phase::Ready(conn) => (conn.pending.len(), None),
            Phase::Failed(e) => (0, Some(e.to_string())),
            Phase::Terminated(reason) => (0, Some(format!("process ended: {reason}"))),
            _ => (0, None),
        };
        let child = self.inner.supervisor.current();
        SessionStatus {
            state,
            running: child.is_some(),
            ready: state == SessionState::Ready,
            pid: child.and_then(|c| c.pid()),
            pending_calls,
            last_error,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Make sure the provider is spawned and initialized.
    ///
    /// Returns at once when already ready. Otherwise starts (or joins) the
    /// single in-flight handshake and waits for its outcome.
    pub async fn ensure_ready(&self) -> Result<()> {
        let outcome = {
            let mut phase = self.inner.lock_phase();
            match &*phase {
                Phase::Ready(conn) if conn.is_alive() => return Ok(()),
                Phase::Initializing { outcome, .. } => outcome.clone(),
                _ => {
                    let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    info!(provider = %self.inner.name, generation, "Initializing provider session");
                    // Runs to completion even if every waiter goes away.
                    let task = tokio::spawn(SessionInner::initialize(self.inner.clone(), generation));
                    let inner = self.inner.clone();
                    let outcome = async move {
                        task.await.unwrap_or_else(|e| {
                            let error = BridgeError::Communication(format!(
                                "initialization task failed: {e}"
                            ));
                            inner.fail_generation(generation, &error);
                            Err(error)
                        })
                    }
                    .boxed()
                    .shared();
                    *phase = Phase::Initializing {
                        generation,
                        outcome: outcome.clone(),
                    };
                    outcome
                }
            }
        };

        outcome.await.map(|_| ())
    }

    /// Send a request and wait for the response with the same id.
    ///
    /// The session must be ready. The request's own `id`, if any, is replaced
    /// by a fresh session id on the wire and restored on the returned frame.
    /// A JSON-RPC `error` answer is returned as-is: it is the call's outcome.
    pub async fn send(&self, mut message: Value) -> Result<Value> {
        let conn = self.inner.ready_connection()?;

        let Some(object) = message.as_object_mut() else {
            return Err(BridgeError::InvalidRequest(
                "JSON-RPC message must be an object".into(),
            ));
        };
        let method = object
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::InvalidRequest("missing method".into()))?
            .to_string();
        let caller_id = RequestId::from_message(&Value::Object(object.clone()));

        let id = RequestId::from(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        object.insert("jsonrpc".into(), Value::from(message::JSONRPC_VERSION));
        object.insert("id".into(), Value::from(id.clone()));

        let rx = conn.pending.register(&id, &method)?;
        let _pending = PendingGuard {
            pending: &conn.pending,
            id: id.clone(),
        };

        // One deadline covers the stdin write and the wait for the answer.
        let mut written = false;
        let exchange = async {
            conn.child.write(&message).await?;
            written = true;
            match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(BridgeError::Communication(
                    "Response channel closed".to_string(),
                )),
            }
        };
        let outcome = tokio::time::timeout(self.inner.call_timeout, exchange).await;

        let mut response = match outcome {
            Ok(outcome) => outcome?,
            Err(_) => {
                if !written {
                    // A partial line may be sitting in the pipe.
                    warn!(provider = %self.inner.name, id = %id, method = %method, "Provider stopped reading stdin");
                    conn.child.terminate();
                }
                warn!(provider = %self.inner.name, id = %id, method = %method, "Call timed out");
                return Err(BridgeError::CallTimeout {
                    provider: self.inner.name.clone(),
                    method,
                    timeout_secs: self.inner.call_timeout.as_secs(),
                });
            }
        };

        if let (Some(caller_id), Some(object)) = (caller_id, response.as_object_mut()) {
            object.insert("id".into(), Value::from(caller_id));
        }
        Ok(response)
    }

    /// Build and send a request for `method`.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        // send() assigns the id.
        self.send(message::notification(method, params)).await
    }

    /// Forward a notification; no response is expected.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let conn = self.inner.ready_connection()?;
        let notification = message::notification(method, params);
        match tokio::time::timeout(self.inner.call_timeout, conn.child.write(&notification)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(provider = %self.inner.name, method = %method, "Provider stopped reading stdin");
                conn.child.terminate();
                Err(BridgeError::CallTimeout {
                    provider: self.inner.name.clone(),
                    method: method.to_string(),
                    timeout_secs: self.inner.call_timeout.as_secs(),
                })
            }
        }
    }

    /// Request termination of the child, if any. Does not wait for it to exit.
    pub fn shutdown(&self) {
        self.inner.supervisor.terminate();
    }
}

impl SessionInner {
    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ready_connection(&self) -> Result<Arc<Connection>> {
        match &*self.lock_phase() {
            Phase::Ready(conn) if conn.is_alive() => Ok(conn.clone()),
            _ => Err(BridgeError::NotReady {
                provider: self.name.clone(),
            }),
        }
    }

    /// Record `error` unless a newer handshake has taken over.
    fn fail_generation(&self, generation: u64, error: &BridgeError) {
        let mut phase = self.lock_phase();
        if matches!(&*phase, Phase::Initializing { generation: g, .. } if *g == generation) {
            *phase = Phase::Failed(error.clone());
        }
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::from(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Run one handshake and record its outcome in the phase.
    async fn initialize(self: Arc<Self>, generation: u64) -> Result<Arc<Connection>> {
        let started = Instant::now();
        let result = self.handshake(generation).await;

        let mut phase = self.lock_phase();
        if matches!(&*phase, Phase::Initializing { generation: g, .. } if *g == generation) {
            *phase = match &result {
                Ok(conn) => {
                    info!(
                        provider = %self.name,
                        generation,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Provider session ready"
                    );
                    Phase::Ready(conn.clone())
                }
                Err(e) => {
                    warn!(provider = %self.name, generation, "Provider initialization failed: {}", e);
                    Phase::Failed(e.clone())
                }
            };
        }
        result
    }

    async fn handshake(self: &Arc<Self>, generation: u64) -> Result<Arc<Connection>> {
        let child = self.supervisor.start()?;
        let mut frames = child.take_frames().ok_or_else(|| {
            BridgeError::Communication(format!(
                "Frame stream of provider '{}' is already in use",
                self.name
            ))
        })?;

        let init = message::request(
            self.next_request_id(),
            "initialize",
            Some(message::initialize_params(CLIENT_NAME, env!("CARGO_PKG_VERSION"))),
        );

        let exchange = async {
            child.write(&init).await?;
            self.await_init_response(&child, &mut frames).await
        };

        match tokio::time::timeout(self.init_timeout, exchange).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                child.terminate();
                return Err(e);
            }
            Err(_) => {
                child.terminate();
                return Err(BridgeError::InitTimeout {
                    provider: self.name.clone(),
                    timeout_secs: self.init_timeout.as_secs(),
                });
            }
        }

        if let Err(e) = child
            .write(&message::notification("notifications/initialized", None))
            .await
        {
            child.terminate();
            return Err(e);
        }

        let conn = Arc::new(Connection {
            generation,
            child,
            pending: PendingCalls::new(&self.name),
        });
        tokio::spawn(self.clone().dispatch(conn.clone(), frames));
        Ok(conn)
    }

    /// Wait for the first frame carrying `result` (any id: only the
    /// initialize request is outstanding). An `error` frame fails the handshake.
    async fn await_init_response(
        &self,
        child: &ChildProcess,
        frames: &mut FrameReceiver,
    ) -> Result<()> {
        while let Some(frame) = frames.recv().await {
            if frame.get("result").is_some() {
                debug!(provider = %self.name, "Received initialize response");
                return Ok(());
            }
            if let Some(error) = RpcError::from_response(&frame) {
                return Err(BridgeError::Protocol {
                    provider: self.name.clone(),
                    code: error.code,
                    message: error.message,
                });
            }
            debug!(provider = %self.name, "Ignoring frame received before initialize response");
        }

        Err(BridgeError::ProcessExited {
            provider: self.name.clone(),
            reason: format!("{} before initialize completed", child.wait_exit().await),
        })
    }

    /// Route frames of a ready child to pending calls until its stdout ends,
    /// then fail everything still pending.
    async fn dispatch(self: Arc<Self>, conn: Arc<Connection>, mut frames: FrameReceiver) {
        while let Some(frame) = frames.recv().await {
            match frame {
                Value::Array(batch) => {
                    for item in batch {
                        self.route_frame(&conn, item);
                    }
                }
                frame => self.route_frame(&conn, frame),
            }
        }

        let reason = conn.child.wait_exit().await;
        if reason == ExitReason::Killed {
            info!(provider = %self.name, generation = conn.generation, "Provider session closed");
        } else {
            warn!(
                provider = %self.name,
                generation = conn.generation,
                reason = %reason,
                "Provider process exited unexpectedly"
            );
        }

        {
            let mut phase = self.lock_phase();
            if matches!(&*phase, Phase::Ready(current) if current.generation == conn.generation) {
                *phase = Phase::Terminated(reason.clone());
            }
        }

        conn.pending.close(&BridgeError::ProcessExited {
            provider: self.name.clone(),
            reason: reason.to_string(),
        });
    }

    fn route_frame(&self, conn: &Connection, frame: Value) {
        match MessageKind::of(&frame) {
            MessageKind::Response => {
                conn.pending.resolve(frame);
            }
            MessageKind::Request => {
                // Child-originated requests are not supported; they are inert.
                debug!(
                    provider = %self.name,
                    method = ?frame.get("method"),
                    "Ignoring request sent by provider"
                );
            }
            MessageKind::Notification => {
                debug!(
                    provider = %self.name,
                    method = ?frame.get("method"),
                    "Provider notification"
                );
            }
            MessageKind::Invalid => {
                debug!(provider = %self.name, "Dropping frame that is not a JSON-RPC message");
            }
        }
    }
}

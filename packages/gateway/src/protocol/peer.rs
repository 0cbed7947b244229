//! RPC peer over a child agent process: spawning, line framing,
//! request/response correlation, notification fan-out and reverse requests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flint_error::GatewayError;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, oneshot, Mutex};

use super::framing::FrameReader;
use super::mock::{handle_mock_payload, MockAgent};
use super::{
    request_timeout, ApprovalDecision, Notification, METHOD_AGENT_EXITED, METHOD_COMMAND_APPROVAL,
    METHOD_FILE_APPROVAL, METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_INVALID_STDOUT,
};

const NOTIFICATION_CAPACITY: usize = 512;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(200);
const STDERR_MAX_LINES: usize = 60;
const STDERR_MAX_BYTES: usize = 8 * 1024;

/// Command line and environment used to start an agent child.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Bounded ring of recent stderr lines, attached to errors when the child
/// exits unexpectedly. Never parsed.
#[derive(Debug, Default)]
struct StderrRing {
    lines: VecDeque<String>,
    bytes: usize,
}

impl StderrRing {
    fn push(&mut self, line: String) {
        self.bytes += line.len();
        self.lines.push_back(line);
        while self.lines.len() > STDERR_MAX_LINES
            || (self.bytes > STDERR_MAX_BYTES && self.lines.len() > 1)
        {
            if let Some(dropped) = self.lines.pop_front() {
                self.bytes -= dropped.len();
            }
        }
    }

    fn tail(&self) -> Option<String> {
        if self.lines.is_empty() {
            return None;
        }
        Some(self.lines.iter().cloned().collect::<Vec<_>>().join("\n"))
    }
}

#[derive(Debug)]
enum Backend {
    Process(ProcessBackend),
    Mock(MockAgent),
}

#[derive(Debug)]
struct ProcessBackend {
    stdin: Arc<Mutex<ChildStdin>>,
    child: Arc<Mutex<Child>>,
}

#[derive(Debug, Clone)]
struct ExitInfo {
    code: Option<i32>,
    stderr_tail: Option<String>,
}

#[derive(Debug)]
struct PeerInner {
    backend: Backend,
    approval_decision: ApprovalDecision,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, GatewayError>>>>,
    notifications: broadcast::Sender<Notification>,
    closed: AtomicBool,
    stderr: Mutex<StderrRing>,
    exit: Mutex<Option<ExitInfo>>,
}

/// One live JSON-RPC peer. Cloning shares the underlying child.
#[derive(Debug, Clone)]
pub struct AgentPeer {
    inner: Arc<PeerInner>,
}

impl AgentPeer {
    pub fn spawn(spec: &SpawnSpec, approval_decision: ApprovalDecision) -> Result<Self, GatewayError> {
        let program = spec
            .command
            .first()
            .ok_or_else(|| GatewayError::AgentSpawnFailed {
                command: String::new(),
                message: "agent command is empty".to_string(),
            })?;

        let mut command = Command::new(program);
        command
            .args(&spec.command[1..])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        tracing::info!(command = ?spec.command, "spawning agent process");
        let display = spec.command.join(" ");
        let mut child = command.spawn().map_err(|err| GatewayError::AgentSpawnFailed {
            command: display.clone(),
            message: err.to_string(),
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_pipe_error(&display, "stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_pipe_error(&display, "stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_pipe_error(&display, "stderr"))?;

        let peer = Self::new(Backend::Process(ProcessBackend {
            stdin: Arc::new(Mutex::new(stdin)),
            child: Arc::new(Mutex::new(child)),
        }), approval_decision);

        peer.spawn_stdout_loop(stdout);
        peer.spawn_stderr_loop(stderr);
        peer.spawn_exit_watcher();
        Ok(peer)
    }

    /// In-process peer used by the mock provider; no child is spawned.
    pub fn mock(approval_decision: ApprovalDecision) -> Self {
        Self::new(Backend::Mock(MockAgent::new()), approval_decision)
    }

    fn new(backend: Backend, approval_decision: ApprovalDecision) -> Self {
        let (notifications, _rx) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            inner: Arc::new(PeerInner {
                backend,
                approval_decision,
                next_id: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                notifications,
                closed: AtomicBool::new(false),
                stderr: Mutex::new(StderrRing::default()),
                exit: Mutex::new(None),
            }),
        }
    }

    /// `initialize` round-trip followed by the `initialized` notification;
    /// the peer is usable only after this resolves.
    pub async fn initialize(&self, client_name: &str, client_version: &str) -> Result<Value, GatewayError> {
        let result = self
            .request(
                METHOD_INITIALIZE,
                json!({
                    "clientInfo": {
                        "name": client_name,
                        "version": client_version,
                    }
                }),
            )
            .await?;
        self.notify(METHOD_INITIALIZED, json!({})).await?;
        Ok(result)
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        self.inner.check_open().await?;

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        let payload = json!({"id": id, "method": method, "params": params});
        if let Err(err) = self.send_payload(&payload).await {
            self.inner.pending.lock().await.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(request_timeout(method), rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(GatewayError::ClientClosed),
            Err(_) => {
                // The child may still answer later; a late response for a
                // removed id is dropped as an orphan.
                self.inner.pending.lock().await.remove(&id);
                Err(GatewayError::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<(), GatewayError> {
        self.inner.check_open().await?;
        self.send_payload(&json!({"method": method, "params": params}))
            .await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Ends stdin, kills the child and rejects every pending call.
    /// Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Backend::Process(process) = &self.inner.backend {
            let _ = process.stdin.lock().await.shutdown().await;
            let mut child = process.child.lock().await;
            match child.try_wait() {
                Ok(Some(_)) => {}
                _ => {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
            }
        }
        self.inner.fail_pending(|| GatewayError::ClientClosed).await;
    }

    fn spawn_stdout_loop(&self, stdout: tokio::process::ChildStdout) {
        let peer = self.clone();
        tokio::spawn(async move {
            let mut frames = FrameReader::new(stdout);
            loop {
                let frame = match frames.next_frame().await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "agent stdout: framing error");
                        break;
                    }
                };
                let payload = match serde_json::from_str::<Value>(&frame) {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::warn!(error = %err, "agent stdout: invalid JSON frame");
                        json!({
                            "method": METHOD_INVALID_STDOUT,
                            "params": {"error": err.to_string(), "raw": frame},
                        })
                    }
                };
                peer.dispatch(payload).await;
            }
            tracing::debug!("agent stdout: stream ended");
        });
    }

    fn spawn_stderr_loop(&self, stderr: tokio::process::ChildStderr) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!("agent stderr: {}", line);
                inner.stderr.lock().await.push(line);
            }
        });
    }

    fn spawn_exit_watcher(&self) {
        let inner = self.inner.clone();
        let Backend::Process(process) = &self.inner.backend else {
            return;
        };
        let child = process.child.clone();
        tokio::spawn(async move {
            let status = loop {
                let probe = {
                    let mut guard = child.lock().await;
                    guard.try_wait()
                };
                match probe {
                    Ok(Some(status)) => break Some(status),
                    Ok(None) => tokio::time::sleep(EXIT_POLL_INTERVAL).await,
                    Err(err) => {
                        tracing::error!(error = %err, "failed to poll agent process status");
                        break None;
                    }
                }
            };

            let code = status.and_then(|status| status.code());
            let stderr_tail = inner.stderr.lock().await.tail();
            let pending_count = inner.pending.lock().await.len();
            tracing::warn!(
                code = ?code,
                pending_requests = pending_count,
                "agent process exited"
            );

            *inner.exit.lock().await = Some(ExitInfo {
                code,
                stderr_tail: stderr_tail.clone(),
            });
            inner
                .fail_pending(|| GatewayError::AgentProcessExited {
                    exit_code: code,
                    stderr_tail: stderr_tail.clone(),
                })
                .await;
            let _ = inner.notifications.send(Notification {
                method: METHOD_AGENT_EXITED.to_string(),
                params: json!({"code": code, "stderrTail": stderr_tail}),
            });
        });
    }
}

async fn write_line(stdin: &mut ChildStdin, encoded: &[u8]) -> Result<(), GatewayError> {
    stdin.write_all(encoded).await.map_err(write_error)?;
    stdin.write_all(b"\n").await.map_err(write_error)?;
    stdin.flush().await.map_err(write_error)?;
    Ok(())
}

fn write_error(err: std::io::Error) -> GatewayError {
    GatewayError::AgentFailure {
        message: format!("failed to write to agent stdin: {err}"),
        details: None,
    }
}

fn spawn_pipe_error(command: &str, pipe: &str) -> GatewayError {
    GatewayError::AgentSpawnFailed {
        command: command.to_string(),
        message: format!("failed to capture subprocess {pipe}"),
    }
}

impl PeerInner {
    async fn check_open(&self) -> Result<(), GatewayError> {
        if let Some(exit) = self.exit.lock().await.clone() {
            return Err(GatewayError::AgentProcessExited {
                exit_code: exit.code,
                stderr_tail: exit.stderr_tail,
            });
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::ClientClosed);
        }
        Ok(())
    }

    async fn fail_pending<F>(&self, make_error: F)
    where
        F: Fn() -> GatewayError,
    {
        let pending: Vec<_> = self.pending.lock().await.drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(make_error()));
        }
    }
}

impl AgentPeer {
    async fn send_payload(&self, payload: &Value) -> Result<(), GatewayError> {
        match &self.inner.backend {
            Backend::Process(process) => {
                let encoded =
                    serde_json::to_vec(payload).map_err(|err| GatewayError::AgentFailure {
                        message: format!("failed to serialize outgoing message: {err}"),
                        details: None,
                    })?;
                let mut stdin = process.stdin.lock().await;
                write_line(&mut stdin, &encoded).await
            }
            Backend::Mock(mock) => {
                let peer = self.clone();
                handle_mock_payload(mock, payload, move |message| {
                    peer.clone().dispatch_boxed(message)
                })
                .await;
                Ok(())
            }
        }
    }

    /// Type-erased dispatch used by the mock backend; boxing keeps the
    /// mock -> dispatch -> mock cycle finite for the compiler.
    fn dispatch_boxed(
        self,
        payload: Value,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            self.dispatch(payload).await;
        })
    }

    /// Classifies an inbound line by the presence of `id` and `method`.
    async fn dispatch(&self, payload: Value) {
        let has_method = payload.get("method").is_some();
        let has_id = payload.get("id").is_some();

        if has_id && has_method {
            let id = payload.get("id").cloned().unwrap_or(Value::Null);
            let method = payload
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let params = payload.get("params").cloned().unwrap_or(Value::Null);
            self.handle_reverse_request(id, &method, params).await;
            return;
        }

        if has_id {
            let Some(id) = payload.get("id").and_then(Value::as_u64) else {
                tracing::warn!("agent response has a non-integer id; dropping");
                return;
            };
            let Some(tx) = self.inner.pending.lock().await.remove(&id) else {
                tracing::warn!(id, "agent response has no matching pending request");
                return;
            };
            let outcome = match payload.get("error") {
                Some(error) => Err(GatewayError::AgentFailure {
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("agent returned an error")
                        .to_string(),
                    details: Some(error.clone()),
                }),
                None => Ok(payload.get("result").cloned().unwrap_or(Value::Null)),
            };
            let _ = tx.send(outcome);
            return;
        }

        if has_method {
            let method = payload
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let params = payload.get("params").cloned().unwrap_or(Value::Null);
            let _ = self.inner.notifications.send(Notification { method, params });
        }
    }

    /// A message with both `id` and `method` is a server→client request and
    /// must be answered. Approval requests get the configured decision and a
    /// synthetic activity beat; anything else gets a method-not-supported
    /// error.
    async fn handle_reverse_request(&self, id: Value, method: &str, params: Value) {
        if method == METHOD_COMMAND_APPROVAL || method == METHOD_FILE_APPROVAL {
            let decision = self.inner.approval_decision.as_str();
            tracing::info!(method, decision, "auto-responding to approval request");
            let response = json!({"id": id, "result": {"decision": decision}});
            if let Err(err) = self.send_payload(&response).await {
                tracing::warn!(error = %err, "failed to answer approval request");
            }
            let _ = self.inner.notifications.send(Notification {
                method: method.to_string(),
                params,
            });
            return;
        }

        tracing::warn!(method, "unsupported server->client request");
        let response = json!({
            "id": id,
            "error": {"code": -32601, "message": format!("method not supported: {method}")},
        });
        if let Err(err) = self.send_payload(&response).await {
            tracing::warn!(error = %err, "failed to reject reverse request");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_ring_is_bounded_by_lines() {
        let mut ring = StderrRing::default();
        for index in 0..200 {
            ring.push(format!("line {index}"));
        }
        assert_eq!(ring.lines.len(), STDERR_MAX_LINES);
        let tail = ring.tail().unwrap();
        assert!(tail.ends_with("line 199"));
        assert!(!tail.contains("line 0\n"));
    }

    #[test]
    fn stderr_ring_is_bounded_by_bytes() {
        let mut ring = StderrRing::default();
        for _ in 0..10 {
            ring.push("x".repeat(2048));
        }
        assert!(ring.bytes <= STDERR_MAX_BYTES + 2048);
        assert!(ring.lines.len() < 10);
    }

    #[tokio::test]
    async fn mock_peer_handshakes() {
        let peer = AgentPeer::mock(ApprovalDecision::Accept);
        let result = peer.initialize("flint", "0.0.0-test").await.unwrap();
        assert!(result.get("agentInfo").is_some());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_late_requests() {
        let peer = AgentPeer::mock(ApprovalDecision::Accept);
        peer.close().await;
        peer.close().await;
        let err = peer.request("turn/start", json!({})).await.unwrap_err();
        assert!(matches!(err, GatewayError::ClientClosed));
    }
}

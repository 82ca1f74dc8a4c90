//! In-memory transports for tests.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::{
    sync::{Notify, mpsc},
    task::JoinHandle,
};

use crate::{
    connection::Connection,
    transport::{Transport, TransportError},
};

/// Transport backed by a pair of unbounded channels.
pub struct ChannelTransport {
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

/// The far end of a [`ChannelTransport`].
pub struct Remote {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl ChannelTransport {
    /// A connected transport and its remote end.
    #[must_use]
    pub fn pair() -> (Self, Remote) {
        let (to_remote, from_local) = mpsc::unbounded_channel();
        let (to_local, from_remote) = mpsc::unbounded_channel();
        (
            Self {
                outbound: Mutex::new(Some(to_remote)),
                inbound: tokio::sync::Mutex::new(from_remote),
            },
            Remote {
                tx: to_local,
                rx: from_local,
            },
        )
    }
}

impl Remote {
    /// Deliver a message to the local side.
    pub fn send(&self, message: String) {
        let _ = self.tx.send(message);
    }

    /// Next message sent by the local side; `None` once it closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// A sender that delivers to the local side.
    #[must_use]
    pub fn sender(&self) -> mpsc::UnboundedSender<String> {
        self.tx.clone()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: String) -> Result<(), TransportError> {
        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(TransportError::Closed)?;
        tx.send(message).map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<Option<String>, TransportError> {
        Ok(self.inbound.lock().await.recv().await)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.outbound.lock().take();
        Ok(())
    }
}

/// Scripted answer to one method.
#[derive(Debug, Clone)]
pub struct Reply {
    events: Vec<(String, Value)>,
    outcome: Result<Value, String>,
}

impl Default for Reply {
    fn default() -> Self {
        Self::result(json!({}))
    }
}

impl Reply {
    /// Answer with `result`.
    #[must_use]
    pub fn result(result: Value) -> Self {
        Self {
            events: Vec::new(),
            outcome: Ok(result),
        }
    }

    /// Answer with an error object carrying `message`.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            events: Vec::new(),
            outcome: Err(message.into()),
        }
    }

    /// Emit an event before the answer.
    #[must_use]
    pub fn with_event(mut self, method: impl Into<String>, params: Value) -> Self {
        self.events.push((method.into(), params));
        self
    }
}

/// A request the fake inspector received.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// Worker session the request was relayed to, `None` for the main session.
    pub session_id: Option<String>,
    pub method: String,
    pub params: Value,
}

struct State {
    replies: HashMap<String, Reply>,
    calls: Mutex<Vec<RecordedCall>>,
    notify: Notify,
    closed: AtomicBool,
}

impl State {
    fn record(&self, call: RecordedCall) -> Reply {
        let reply = self.replies.get(&call.method).cloned().unwrap_or_default();
        self.calls.lock().push(call);
        reply
    }
}

/// Inspector stand-in serving a [`Connection`] over a [`ChannelTransport`].
///
/// Every method is answered with `{}` unless a [`Reply`] was scripted for it.
/// Requests relayed through `NodeWorker.sendMessageToWorker` are unwrapped,
/// recorded with their session id and answered through
/// `NodeWorker.receivedMessageFromWorker`, so worker sessions can be tested
/// against the same script.
pub struct FakeInspector {
    state: Arc<State>,
    tx: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

/// Builder for [`FakeInspector`].
#[derive(Debug, Default)]
pub struct FakeInspectorBuilder {
    replies: HashMap<String, Reply>,
}

impl FakeInspectorBuilder {
    /// Script the answer to `method`.
    #[must_use]
    pub fn reply(mut self, method: impl Into<String>, reply: Reply) -> Self {
        self.replies.insert(method.into(), reply);
        self
    }

    /// Start serving and return the connection talking to it.
    ///
    /// Must be called inside a Tokio runtime.
    #[must_use]
    pub fn connect(self) -> (Arc<Connection>, FakeInspector) {
        let (transport, remote) = ChannelTransport::pair();
        let state = Arc::new(State {
            replies: self.replies,
            calls: Mutex::new(Vec::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        let tx = remote.sender();
        let task = tokio::spawn(serve(remote, Arc::clone(&state)));
        let connection = Connection::new(Arc::new(transport));
        (connection, FakeInspector { state, tx, task })
    }
}

impl FakeInspector {
    #[must_use]
    pub fn builder() -> FakeInspectorBuilder {
        FakeInspectorBuilder::default()
    }

    /// Emit an event on the main session.
    pub fn emit(&self, method: &str, params: Value) {
        let _ = self.tx.send(event(method, params));
    }

    /// Emit an event inside a worker session.
    pub fn emit_worker(&self, session_id: &str, method: &str, params: Value) {
        let _ = self.tx.send(relayed(session_id, &event(method, params)));
    }

    /// Every request received so far, main and worker sessions interleaved.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.calls.lock().clone()
    }

    /// Methods received on the main session, in order.
    #[must_use]
    pub fn methods(&self) -> Vec<String> {
        self.session_methods(None)
    }

    /// Methods received on one worker session, in order.
    #[must_use]
    pub fn worker_methods(&self, session_id: &str) -> Vec<String> {
        self.session_methods(Some(session_id))
    }

    fn session_methods(&self, session_id: Option<&str>) -> Vec<String> {
        self.state
            .calls
            .lock()
            .iter()
            .filter(|c| c.session_id.as_deref() == session_id)
            .map(|c| c.method.clone())
            .collect()
    }

    /// Number of times `method` was received on any session.
    #[must_use]
    pub fn count(&self, method: &str) -> usize {
        self.state.calls.lock().iter().filter(|c| c.method == method).count()
    }

    /// Wait until `method` has been received `times` times on any session.
    pub async fn wait_for(&self, method: &str, times: usize) {
        loop {
            let notified = self.state.notify.notified();
            if self.count(method) >= times {
                return;
            }
            notified.await;
        }
    }

    /// Whether the connection side closed its transport.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Wait for the connection side to close its transport.
    pub async fn closed(&self) {
        loop {
            let notified = self.state.notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for FakeInspector {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn event(method: &str, params: Value) -> String {
    json!({ "method": method, "params": params }).to_string()
}

fn relayed(session_id: &str, message: &str) -> String {
    event(
        "NodeWorker.receivedMessageFromWorker",
        json!({ "sessionId": session_id, "message": message }),
    )
}

fn answer(id: &Value, outcome: &Result<Value, String>) -> String {
    match outcome {
        Ok(result) => json!({ "id": id, "result": result }),
        Err(message) => json!({ "id": id, "error": { "code": -32000, "message": message } }),
    }
    .to_string()
}

fn split_request(raw: &str) -> Option<(Value, String, Value)> {
    let request: Value = serde_json::from_str(raw).ok()?;
    let id = request.get("id")?.clone();
    let method = request.get("method")?.as_str()?.to_string();
    let params = request.get("params").cloned().unwrap_or(Value::Null);
    Some((id, method, params))
}

async fn serve(mut remote: Remote, state: Arc<State>) {
    while let Some(raw) = remote.recv().await {
        let Some((id, method, params)) = split_request(&raw) else {
            continue;
        };

        if method == "NodeWorker.sendMessageToWorker" {
            let session_id = params["sessionId"].as_str().unwrap_or_default().to_string();
            let message = params["message"].as_str().unwrap_or_default();
            remote.send(answer(&id, &Ok(json!({}))));
            if let Some((inner_id, inner_method, inner_params)) = split_request(message) {
                let reply = state.record(RecordedCall {
                    session_id: Some(session_id.clone()),
                    method: inner_method,
                    params: inner_params,
                });
                for (m, p) in reply.events {
                    remote.send(relayed(&session_id, &event(&m, p)));
                }
                remote.send(relayed(&session_id, &answer(&inner_id, &reply.outcome)));
            }
        } else {
            let reply = state.record(RecordedCall {
                session_id: None,
                method,
                params,
            });
            for (m, p) in reply.events {
                remote.send(event(&m, p));
            }
            remote.send(answer(&id, &reply.outcome));
        }
        state.notify.notify_waiters();
    }
    state.closed.store(true, Ordering::SeqCst);
    state.notify.notify_waiters();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_inspector_scripted_replies() {
        let (conn, fake) = FakeInspector::builder()
            .reply("Profiler.stop", Reply::result(json!({"profile": {"nodes": []}})))
            .reply("Profiler.start", Reply::error("already started"))
            .connect();

        assert_eq!(conn.send("Profiler.enable", json!({})).await.unwrap(), json!({}));
        assert!(conn.send("Profiler.start", json!({})).await.is_err());
        assert_eq!(
            conn.send("Profiler.stop", json!({})).await.unwrap(),
            json!({"profile": {"nodes": []}})
        );
        assert_eq!(fake.methods(), vec!["Profiler.enable", "Profiler.start", "Profiler.stop"]);

        conn.close().await.unwrap();
        fake.closed().await;
    }
}

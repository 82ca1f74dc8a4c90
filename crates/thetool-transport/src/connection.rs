//! Request/response correlation and event fan-out over a [`Transport`].

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::{
    protocol::{Event, EventKind, Incoming, ProtocolError, Request},
    transport::{Transport, TransportError},
};

/// Connection failure.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Connection closed before {method} was answered")]
    Closed { method: String },
}

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<Result<Value, ConnectionError>>,
}

struct Subscriber {
    id: u64,
    kinds: Vec<EventKind>,
    tx: mpsc::UnboundedSender<Event>,
}

/// Events of the requested kinds, in arrival order.
///
/// Ends once the subscription is removed or the connection goes away; events
/// delivered before that are still yielded.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Subscription {
    /// Handle for [`Connection::unsubscribe`].
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the subscription has ended and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Next event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
    next_subscription: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    subscribers: Mutex<Vec<Subscriber>>,
    closed: AtomicBool,
}

impl Inner {
    fn dispatch(&self, message: &str) {
        let incoming: Incoming = match serde_json::from_str(message) {
            Ok(incoming) => incoming,
            Err(e) => {
                tracing::warn!("dropping unparseable message: {e}");
                return;
            }
        };

        if let Some(id) = incoming.id {
            let Some(pending) = self.pending.lock().remove(&id) else {
                tracing::debug!(id, "response without pending request");
                return;
            };
            let result: Result<Value, ConnectionError> = match incoming.error {
                Some(error) => Err(ProtocolError::new(pending.method.as_str(), error).into()),
                None => Ok(incoming.result.unwrap_or(Value::Null)),
            };
            tracing::debug!(id, method = %pending.method, ok = result.is_ok(), "response");
            let _ = pending.tx.send(result);
            return;
        }

        let Some(method) = incoming.method else {
            tracing::debug!("message without id or method");
            return;
        };
        match Event::from_notification(&method, incoming.params) {
            Ok(Some(event)) => self.publish(&event),
            Ok(None) => tracing::trace!(%method, "unhandled event"),
            Err(e) => tracing::warn!(%method, "dropping malformed event: {e}"),
        }
    }

    fn publish(&self, event: &Event) {
        let kind = event.kind();
        tracing::trace!(%kind, "event");
        self.subscribers
            .lock()
            .retain(|s| !s.kinds.contains(&kind) || s.tx.send(event.clone()).is_ok());
    }

    /// Fail every pending request and end every subscription.
    fn shut_down(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (id, request) in pending {
            tracing::debug!(id, method = %request.method, "abandoning request");
            let _ = request.tx.send(Err(ConnectionError::Closed {
                method: request.method,
            }));
        }
        self.subscribers.lock().clear();
    }
}

async fn read_loop(inner: Arc<Inner>) {
    loop {
        match inner.transport.recv().await {
            Ok(Some(message)) => inner.dispatch(&message),
            Ok(None) => {
                tracing::debug!("transport ended");
                break;
            }
            Err(e) => {
                tracing::warn!("transport failed: {e}");
                break;
            }
        }
    }
    inner.shut_down();
}

/// One logical inspector session over a transport.
///
/// Request ids start at 1 and increase by one per [`Connection::send`].
pub struct Connection {
    inner: Arc<Inner>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("pending", &self.inner.pending.lock().len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wrap a transport and start reading from it.
    ///
    /// Must be called inside a Tokio runtime.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        let inner = Arc::new(Inner {
            transport,
            next_id: AtomicU64::new(1),
            next_subscription: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        let reader = tokio::spawn(read_loop(Arc::clone(&inner)));
        Arc::new(Self {
            inner,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Issue `method` and wait for its result.
    pub async fn send(&self, method: &str, params: Value) -> Result<Value, ConnectionError> {
        let closed = || ConnectionError::Closed {
            method: method.to_string(),
        };
        if self.is_closed() {
            return Err(closed());
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let message = serde_json::to_string(&Request {
            id,
            method,
            params: &params,
        })?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(
            id,
            PendingRequest {
                method: method.to_string(),
                tx,
            },
        );
        if self.is_closed() {
            self.inner.pending.lock().remove(&id);
            return Err(closed());
        }

        tracing::debug!(id, method, "request");
        if let Err(e) = self.inner.transport.send(message).await {
            self.inner.pending.lock().remove(&id);
            return Err(e.into());
        }

        rx.await.unwrap_or_else(|_| Err(closed()))
    }

    /// [`Connection::send`] with the result deserialized into `T`.
    pub async fn send_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, ConnectionError> {
        let result = self.send(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Receive events of the given kinds from now on.
    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        if self.is_closed() {
            // Sender dropped right away: the subscription is already over.
            return Subscription { id, rx };
        }
        self.inner.subscribers.lock().push(Subscriber {
            id,
            kinds: kinds.to_vec(),
            tx,
        });
        Subscription { id, rx }
    }

    /// Stop delivering to a subscription. Already delivered events stay
    /// readable.
    pub fn unsubscribe(&self, id: u64) {
        self.inner.subscribers.lock().retain(|s| s.id != id);
    }

    /// Whether the reader loop has ended or [`Connection::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close the transport and stop reading.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        let result = self.inner.transport.close().await;
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.inner.shut_down();
        result.map_err(Into::into)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::testing::ChannelTransport;

    #[tokio::test]
    async fn test_ids_are_sequential_from_one() {
        let (transport, mut remote) = ChannelTransport::pair();
        let conn = Connection::new(Arc::new(transport));

        let calls: Vec<_> = (0..5)
            .map(|i| {
                let conn = Arc::clone(&conn);
                tokio::spawn(async move { conn.send(&format!("Test.m{i}"), json!({})).await })
            })
            .collect();

        let mut ids = Vec::new();
        for _ in 0..5 {
            let request: Value = serde_json::from_str(&remote.recv().await.unwrap()).unwrap();
            ids.push(request["id"].as_u64().unwrap());
        }
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![1, 2, 3, 4, 5]);

        for id in ids {
            remote.send(json!({"id": id, "result": {"echo": id}}).to_string());
        }
        for call in calls {
            call.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_response_resolves_matching_caller() {
        let (transport, mut remote) = ChannelTransport::pair();
        let conn = Connection::new(Arc::new(transport));

        let first = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.send("A.first", json!({})).await }
        });
        let req1: Value = serde_json::from_str(&remote.recv().await.unwrap()).unwrap();
        let second = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.send("B.second", json!({"x": 1})).await }
        });
        let req2: Value = serde_json::from_str(&remote.recv().await.unwrap()).unwrap();
        assert_eq!(req1["id"], 1);
        assert_eq!(req1["method"], "A.first");
        assert_eq!(req2["id"], 2);
        assert_eq!(req2["params"], json!({"x": 1}));

        // Answer out of order, plus a response nobody asked for.
        remote.send(json!({"id": 99, "result": {}}).to_string());
        remote.send(json!({"id": 2, "result": {"who": "second"}}).to_string());
        remote.send(json!({"id": 1, "result": {"who": "first"}}).to_string());

        assert_eq!(second.await.unwrap().unwrap(), json!({"who": "second"}));
        assert_eq!(first.await.unwrap().unwrap(), json!({"who": "first"}));
    }

    #[tokio::test]
    async fn test_error_response_is_protocol_error() {
        let (transport, mut remote) = ChannelTransport::pair();
        let conn = Connection::new(Arc::new(transport));

        let call = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.send("Profiler.start", json!({})).await }
        });
        remote.recv().await.unwrap();
        remote.send(
            json!({"id": 1, "error": {"code": -32000, "message": "not enabled", "data": "extra"}})
                .to_string(),
        );

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "Protocol error (Profiler.start): not enabled extra");
        assert!(matches!(err, ConnectionError::Protocol(p) if p.method == "Profiler.start"));
    }

    #[tokio::test]
    async fn test_events_fan_out_by_kind() {
        let (transport, remote) = ChannelTransport::pair();
        let conn = Connection::new(Arc::new(transport));

        let mut chunks = conn.subscribe(&[EventKind::AddHeapSnapshotChunk]);
        let mut both = conn.subscribe(&[
            EventKind::AddHeapSnapshotChunk,
            EventKind::ExecutionContextDestroyed,
        ]);

        remote.send(json!({"method": "Debugger.scriptParsed", "params": {}}).to_string());
        remote.send(json!({"method": "HeapProfiler.addHeapSnapshotChunk", "params": {"chunk": "a"}}).to_string());
        remote.send(json!({"method": "Runtime.executionContextDestroyed", "params": {"executionContextId": 1}}).to_string());
        remote.send(json!({"method": "HeapProfiler.addHeapSnapshotChunk", "params": {"nope": 1}}).to_string());
        remote.send(json!({"method": "HeapProfiler.addHeapSnapshotChunk", "params": {"chunk": "b"}}).to_string());

        let mut got = Vec::new();
        for _ in 0..2 {
            match chunks.recv().await.unwrap() {
                Event::AddHeapSnapshotChunk(c) => got.push(c.chunk),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(got, vec!["a", "b"]);

        let kinds: Vec<_> = [
            both.recv().await.unwrap(),
            both.recv().await.unwrap(),
            both.recv().await.unwrap(),
        ]
        .iter()
        .map(Event::kind)
        .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::AddHeapSnapshotChunk,
                EventKind::ExecutionContextDestroyed,
                EventKind::AddHeapSnapshotChunk
            ]
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_keeps_delivered_events() {
        let (transport, mut remote) = ChannelTransport::pair();
        let conn = Connection::new(Arc::new(transport));
        let mut sub = conn.subscribe(&[EventKind::TracingDataCollected]);

        remote.send(json!({"method": "NodeTracing.dataCollected", "params": {"value": [1]}}).to_string());
        // A round trip guarantees the event ahead of it was dispatched.
        let call = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.send("NodeTracing.stop", json!({})).await }
        });
        remote.recv().await.unwrap();
        remote.send(json!({"id": 1, "result": {}}).to_string());
        call.await.unwrap().unwrap();

        conn.unsubscribe(sub.id());
        remote.send(json!({"method": "NodeTracing.dataCollected", "params": {"value": [2]}}).to_string());

        assert!(matches!(sub.recv().await, Some(Event::TracingDataCollected(d)) if d.value == vec![json!(1)]));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_pending_fail_when_transport_ends() {
        let (transport, mut remote) = ChannelTransport::pair();
        let conn = Connection::new(Arc::new(transport));
        let mut sub = conn.subscribe(&[EventKind::ConsoleApiCalled]);

        let call = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.send("Runtime.evaluate", json!({"expression": "1"})).await }
        });
        remote.recv().await.unwrap();
        drop(remote);

        let err = tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Closed { method } if method == "Runtime.evaluate"));
        assert!(sub.recv().await.is_none());
        assert!(conn.is_closed());
        assert!(matches!(
            conn.send("Runtime.enable", json!({})).await,
            Err(ConnectionError::Closed { .. })
        ));
    }

    #[tokio::test]
    async fn test_send_as_typed() {
        #[derive(serde::Deserialize)]
        struct Categories {
            categories: Vec<String>,
        }

        let (transport, mut remote) = ChannelTransport::pair();
        let conn = Connection::new(Arc::new(transport));
        let call = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move {
                conn.send_as::<Categories>("NodeTracing.getCategories", json!({}))
                    .await
            }
        });
        remote.recv().await.unwrap();
        remote.send(json!({"id": 1, "result": {"categories": ["node", "v8"]}}).to_string());
        assert_eq!(call.await.unwrap().unwrap().categories, vec!["node", "v8"]);
    }

    #[tokio::test]
    async fn test_close_closes_transport() {
        let (transport, mut remote) = ChannelTransport::pair();
        let conn = Connection::new(Arc::new(transport));
        conn.close().await.unwrap();
        assert!(conn.is_closed());
        assert_eq!(remote.recv().await, None);
    }
}

//! Transport tunnelled through a parent connection to one worker session.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use crate::{
    connection::{Connection, Subscription},
    protocol::{Event, EventKind},
    transport::{Transport, TransportError},
};

/// Worker session relay.
///
/// Outbound messages become `NodeWorker.sendMessageToWorker` requests on the
/// parent; inbound messages are the parent's `receivedMessageFromWorker`
/// events for this session id. The stream ends when the parent reports the
/// worker detached. The parent's own transport is never touched.
pub struct RelayTransport {
    parent: Arc<Connection>,
    session_id: String,
    subscription_id: u64,
    inbound: Mutex<Subscription>,
}

impl std::fmt::Debug for RelayTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayTransport")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl RelayTransport {
    /// Relay for `session_id`. Subscribes on the parent right away so no
    /// message sent after this call is missed.
    #[must_use]
    pub fn new(parent: Arc<Connection>, session_id: impl Into<String>) -> Self {
        let inbound = parent.subscribe(&[
            EventKind::ReceivedMessageFromWorker,
            EventKind::DetachedFromWorker,
        ]);
        Self {
            parent,
            session_id: session_id.into(),
            subscription_id: inbound.id(),
            inbound: Mutex::new(inbound),
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[async_trait]
impl Transport for RelayTransport {
    async fn send(&self, message: String) -> Result<(), TransportError> {
        self.parent
            .send(
                "NodeWorker.sendMessageToWorker",
                json!({ "sessionId": self.session_id, "message": message }),
            )
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Relay(e.to_string()))
    }

    async fn recv(&self) -> Result<Option<String>, TransportError> {
        let mut inbound = self.inbound.lock().await;
        while let Some(event) = inbound.recv().await {
            match event {
                Event::ReceivedMessageFromWorker(m) if m.session_id == self.session_id => {
                    return Ok(Some(m.message));
                }
                Event::DetachedFromWorker(d) if d.session_id == self.session_id => {
                    tracing::info!(session_id = %self.session_id, "worker detached");
                    return Ok(None);
                }
                _ => {}
            }
        }
        Ok(None)
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.parent.unsubscribe(self.subscription_id);
    }
}

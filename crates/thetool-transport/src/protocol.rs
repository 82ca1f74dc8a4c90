//! JSON-RPC wire shapes and typed inspector events.

use std::fmt;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

/// Outbound request `{id, method, params}`.
#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub id: u64,
    pub method: &'a str,
    pub params: &'a Value,
}

/// Any inbound message: response (has `id`) or event (has `method`).
#[derive(Debug, Deserialize)]
pub struct Incoming {
    pub id: Option<u64>,
    pub method: Option<String>,
    pub params: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<RemoteError>,
}

/// The `error` object of a failed response.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// A request the remote rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub struct ProtocolError {
    pub method: String,
    pub message: String,
    pub data: Option<String>,
}

impl ProtocolError {
    #[must_use]
    pub fn new(method: impl Into<String>, error: RemoteError) -> Self {
        let data = error.data.map(|data| match data {
            Value::String(s) => s,
            other => other.to_string(),
        });
        Self {
            method: method.into(),
            message: error.message,
            data,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Protocol error ({}): {}", self.method, self.message)?;
        if let Some(data) = &self.data {
            write!(f, " {data}")?;
        }
        Ok(())
    }
}

/// Mirror of a remote value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub object_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl RemoteObject {
    /// The value as a string, if it is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.value.as_ref().and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleApiCalled {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub args: Vec<RemoteObject>,
    #[serde(default)]
    pub execution_context_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContextDestroyed {
    pub execution_context_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerInfo {
    pub worker_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedToWorker {
    pub session_id: String,
    #[serde(default)]
    pub worker_info: WorkerInfo,
    #[serde(default)]
    pub waiting_for_debugger: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachedFromWorker {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedMessageFromWorker {
    pub session_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AddHeapSnapshotChunk {
    pub chunk: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TracingDataCollected {
    pub value: Vec<Value>,
}

/// Event kinds a subscriber can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConsoleApiCalled,
    ExecutionContextDestroyed,
    AttachedToWorker,
    DetachedFromWorker,
    ReceivedMessageFromWorker,
    AddHeapSnapshotChunk,
    TracingDataCollected,
}

impl EventKind {
    /// Protocol method name.
    #[must_use]
    pub const fn method(self) -> &'static str {
        match self {
            Self::ConsoleApiCalled => "Runtime.consoleAPICalled",
            Self::ExecutionContextDestroyed => "Runtime.executionContextDestroyed",
            Self::AttachedToWorker => "NodeWorker.attachedToWorker",
            Self::DetachedFromWorker => "NodeWorker.detachedFromWorker",
            Self::ReceivedMessageFromWorker => "NodeWorker.receivedMessageFromWorker",
            Self::AddHeapSnapshotChunk => "HeapProfiler.addHeapSnapshotChunk",
            Self::TracingDataCollected => "NodeTracing.dataCollected",
        }
    }

    /// Kind for a protocol method name, if it is one we handle.
    #[must_use]
    pub fn from_method(method: &str) -> Option<Self> {
        Some(match method {
            "Runtime.consoleAPICalled" => Self::ConsoleApiCalled,
            "Runtime.executionContextDestroyed" => Self::ExecutionContextDestroyed,
            "NodeWorker.attachedToWorker" => Self::AttachedToWorker,
            "NodeWorker.detachedFromWorker" => Self::DetachedFromWorker,
            "NodeWorker.receivedMessageFromWorker" => Self::ReceivedMessageFromWorker,
            "HeapProfiler.addHeapSnapshotChunk" => Self::AddHeapSnapshotChunk,
            "NodeTracing.dataCollected" => Self::TracingDataCollected,
            _ => return None,
        })
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method())
    }
}

/// Unsolicited inspector notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ConsoleApiCalled(ConsoleApiCalled),
    ExecutionContextDestroyed(ExecutionContextDestroyed),
    AttachedToWorker(AttachedToWorker),
    DetachedFromWorker(DetachedFromWorker),
    ReceivedMessageFromWorker(ReceivedMessageFromWorker),
    AddHeapSnapshotChunk(AddHeapSnapshotChunk),
    TracingDataCollected(TracingDataCollected),
}

impl Event {
    /// Decode a notification. `Ok(None)` for methods that are not handled.
    pub fn from_notification(
        method: &str,
        params: Option<Value>,
    ) -> Result<Option<Self>, serde_json::Error> {
        let Some(kind) = EventKind::from_method(method) else {
            return Ok(None);
        };
        let params = params.unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        let event = match kind {
            EventKind::ConsoleApiCalled => Self::ConsoleApiCalled(parse(params)?),
            EventKind::ExecutionContextDestroyed => Self::ExecutionContextDestroyed(parse(params)?),
            EventKind::AttachedToWorker => Self::AttachedToWorker(parse(params)?),
            EventKind::DetachedFromWorker => Self::DetachedFromWorker(parse(params)?),
            EventKind::ReceivedMessageFromWorker => Self::ReceivedMessageFromWorker(parse(params)?),
            EventKind::AddHeapSnapshotChunk => Self::AddHeapSnapshotChunk(parse(params)?),
            EventKind::TracingDataCollected => Self::TracingDataCollected(parse(params)?),
        };
        Ok(Some(event))
    }

    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::ConsoleApiCalled(_) => EventKind::ConsoleApiCalled,
            Self::ExecutionContextDestroyed(_) => EventKind::ExecutionContextDestroyed,
            Self::AttachedToWorker(_) => EventKind::AttachedToWorker,
            Self::DetachedFromWorker(_) => EventKind::DetachedFromWorker,
            Self::ReceivedMessageFromWorker(_) => EventKind::ReceivedMessageFromWorker,
            Self::AddHeapSnapshotChunk(_) => EventKind::AddHeapSnapshotChunk,
            Self::TracingDataCollected(_) => EventKind::TracingDataCollected,
        }
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(params)
}

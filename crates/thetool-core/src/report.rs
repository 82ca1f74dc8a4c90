//! Report lifecycle: what a tool produces and what a collector consumes.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

/// Identifier of one captured artifact.
///
/// Unique across every session of a run (see [`crate::ReportSequence`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportId(u64);

impl ReportId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Report lifecycle event, emitted in order for one report id:
/// one `ReportStart`, zero or more `ReportChunk`, one `ReportFinish`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ReportEvent {
    #[serde(rename_all = "camelCase")]
    ReportStart {
        id: ReportId,
        suggested_file_extension: String,
        user_hint: String,
    },
    ReportChunk { id: ReportId, chunk: String },
    ReportFinish { id: ReportId },
}

impl ReportEvent {
    /// The report this event belongs to.
    #[must_use]
    pub const fn id(&self) -> ReportId {
        match self {
            Self::ReportStart { id, .. } | Self::ReportChunk { id, .. } | Self::ReportFinish { id } => {
                *id
            }
        }
    }
}

/// Consumer of report lifecycle events.
///
/// Events for a single report arrive in order; implementations must keep
/// chunk order since the concatenation is the byte-exact artifact.
pub trait ReportSink: Send + Sync {
    /// Handle one lifecycle event.
    fn on_event(&self, event: ReportEvent);

    /// Called once the target's debugging endpoint is known.
    fn attached(&self, _port: u16) {}
}

/// The handle a tool writes its artifact through.
pub trait Report: Send + Sync {
    /// Announce the artifact: file extension and a hint on how to open it.
    fn start(&self, suggested_file_extension: &str, user_hint: &str);

    /// Append one chunk of the artifact.
    fn chunk(&self, data: String);

    /// Seal the artifact.
    fn finish(&self);
}

/// [`Report`] bound to an allocated id, forwarding to a [`ReportSink`].
#[derive(Clone)]
pub struct ReportHandle {
    id: ReportId,
    sink: Arc<dyn ReportSink>,
}

impl ReportHandle {
    /// Create a handle for `id` writing into `sink`.
    #[must_use]
    pub fn new(id: ReportId, sink: Arc<dyn ReportSink>) -> Self {
        Self { id, sink }
    }

    /// The id this handle writes under.
    #[must_use]
    pub const fn id(&self) -> ReportId {
        self.id
    }
}

impl fmt::Debug for ReportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Report for ReportHandle {
    fn start(&self, suggested_file_extension: &str, user_hint: &str) {
        tracing::info!(report_id = %self.id, extension = suggested_file_extension, "report started");
        self.sink.on_event(ReportEvent::ReportStart {
            id: self.id,
            suggested_file_extension: suggested_file_extension.to_string(),
            user_hint: user_hint.to_string(),
        });
    }

    fn chunk(&self, data: String) {
        tracing::debug!(report_id = %self.id, bytes = data.len(), "report chunk");
        self.sink.on_event(ReportEvent::ReportChunk { id: self.id, chunk: data });
    }

    fn finish(&self) {
        tracing::info!(report_id = %self.id, "report finished");
        self.sink.on_event(ReportEvent::ReportFinish { id: self.id });
    }
}

//! Profiling kinds and their begin/end command sequences.

mod heap;
mod profiler;
mod trace;

use std::sync::Arc;

use serde_json::Value;
use thetool_core::{Report, ToolKind, ToolSpec};
use thetool_transport::{Connection, ConnectionError, Event, Subscription};
use thiserror::Error;
use tokio::task::JoinHandle;

pub use heap::{HeapSampler, HeapTimeline};
pub use profiler::{CoverageProfiler, CpuProfiler, TypeProfiler};
pub use trace::TraceRecorder;

pub const PERFORMANCE_HINT: &str =
    "You can use Chrome DevTools Performance tab to load and analyze it.";
pub const MEMORY_HINT: &str = "You can use Chrome DevTools Memory tab to load and analyze it.";
pub const COVERAGE_HINT: &str = "You can use c8 npm package to analyze this data, put file with data to ./coverage/tmp and run 'c8 report'";
pub const TYPE_PROFILE_HINT: &str =
    "Unfortunately there is no nice visualization tool yet. Please build one and add it here.";

/// Tool failure.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{method} returned no {field}")]
    MissingField {
        method: &'static str,
        field: &'static str,
    },
    #[error("Chunk forwarder failed: {0}")]
    Forwarder(String),
}

/// One profiling kind.
///
/// `begin` and `end` are called in pairs. Everything a tool produces goes
/// through the [`Report`] it is handed.
#[derive(Debug)]
pub enum Tool {
    Cpu(CpuProfiler),
    HeapSampling(HeapSampler),
    HeapTimeline(HeapTimeline),
    Coverage(CoverageProfiler),
    TypeProfile(TypeProfiler),
    Tracing(TraceRecorder),
}

impl Tool {
    /// Fresh tool instance for `spec`.
    #[must_use]
    pub fn new(spec: &ToolSpec) -> Self {
        let options = &spec.options;
        match spec.kind {
            ToolKind::Cpu => Self::Cpu(CpuProfiler),
            ToolKind::HeapSampling => Self::HeapSampling(HeapSampler::new(options.sampling_interval())),
            ToolKind::HeapTimeline => Self::HeapTimeline(HeapTimeline::new(options.track_allocations)),
            ToolKind::Coverage => Self::Coverage(CoverageProfiler),
            ToolKind::TypeProfile => Self::TypeProfile(TypeProfiler),
            ToolKind::Tracing => Self::Tracing(TraceRecorder::new(options)),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ToolKind {
        match self {
            Self::Cpu(_) => ToolKind::Cpu,
            Self::HeapSampling(_) => ToolKind::HeapSampling,
            Self::HeapTimeline(_) => ToolKind::HeapTimeline,
            Self::Coverage(_) => ToolKind::Coverage,
            Self::TypeProfile(_) => ToolKind::TypeProfile,
            Self::Tracing(_) => ToolKind::Tracing,
        }
    }

    /// Whether worker sessions must share the main thread's session.
    ///
    /// The trace agent is process wide, so a worker cannot run its own.
    #[must_use]
    pub const fn main_thread_only(&self) -> bool {
        matches!(self, Self::Tracing(_))
    }

    /// Issue the start commands.
    ///
    /// # Errors
    /// Returns error if the target rejects a command.
    pub async fn begin(
        &mut self,
        conn: &Connection,
        report: Arc<dyn Report>,
    ) -> Result<(), ToolError> {
        tracing::debug!(kind = %self.kind(), "tool begin");
        match self {
            Self::Cpu(tool) => tool.begin(conn, report.as_ref()).await,
            Self::HeapSampling(tool) => tool.begin(conn, report.as_ref()).await,
            Self::HeapTimeline(tool) => tool.begin(conn, report).await,
            Self::Coverage(tool) => tool.begin(conn, report.as_ref()).await,
            Self::TypeProfile(tool) => tool.begin(conn, report.as_ref()).await,
            Self::Tracing(tool) => tool.begin(conn, report).await,
        }
    }

    /// Issue the stop commands, emit the artifact and finish the report.
    ///
    /// # Errors
    /// Returns error if the target rejects a command.
    pub async fn end(&mut self, conn: &Connection, report: Arc<dyn Report>) -> Result<(), ToolError> {
        tracing::debug!(kind = %self.kind(), "tool end");
        match self {
            Self::Cpu(tool) => tool.end(conn, report.as_ref()).await,
            Self::HeapSampling(tool) => tool.end(conn, report.as_ref()).await,
            Self::HeapTimeline(tool) => tool.end(conn, report.as_ref()).await,
            Self::Coverage(tool) => tool.end(conn, report.as_ref()).await,
            Self::TypeProfile(tool) => tool.end(conn, report.as_ref()).await,
            Self::Tracing(tool) => tool.end(conn, report.as_ref()).await,
        }
    }
}

/// Serialize `result[field]` as one report chunk.
fn field_chunk(
    result: &Value,
    method: &'static str,
    field: &'static str,
) -> Result<String, ToolError> {
    let value = result
        .get(field)
        .ok_or(ToolError::MissingField { method, field })?;
    Ok(serde_json::to_string(value)?)
}

/// Background task feeding subscribed events into a report.
///
/// The task owns a piece of state `T` that is handed back by
/// [`ChunkForwarder::finish`] once every delivered event has been processed.
#[derive(Debug)]
struct ChunkForwarder<T> {
    subscription_id: u64,
    task: JoinHandle<T>,
}

impl<T: Send + 'static> ChunkForwarder<T> {
    fn spawn<F>(mut subscription: Subscription, mut state: T, mut on_event: F) -> Self
    where
        F: FnMut(&mut T, Event) + Send + 'static,
    {
        let subscription_id = subscription.id();
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                on_event(&mut state, event);
            }
            state
        });
        Self {
            subscription_id,
            task,
        }
    }

    /// Unsubscribe, drain what was already delivered and return the state.
    async fn finish(self, conn: &Connection) -> Result<T, ToolError> {
        conn.unsubscribe(self.subscription_id);
        self.task
            .await
            .map_err(|e| ToolError::Forwarder(e.to_string()))
    }
}

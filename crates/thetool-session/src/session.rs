//! Reference-counted tool session.

use std::sync::Arc;

use thetool_core::{Report, ReportHandle, ReportId, ReportSequence, ReportSink, ToolSpec};
use thetool_transport::Connection;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::tool::{Tool, ToolError};

/// Session failure.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),
}

#[derive(Debug)]
struct State {
    active: usize,
    report: Option<ReportHandle>,
    tool: Tool,
}

/// A tool bound to one connection, with nested start/stop.
///
/// Only the outermost `start`/`stop` pair reaches the tool. Each such pair
/// writes one report under an id drawn from the shared [`ReportSequence`].
pub struct ToolSession {
    connection: Arc<Connection>,
    spec: ToolSpec,
    sequence: Arc<ReportSequence>,
    sink: Arc<dyn ReportSink>,
    main_thread_only: bool,
    state: Mutex<State>,
}

impl std::fmt::Debug for ToolSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSession")
            .field("kind", &self.spec.kind)
            .finish_non_exhaustive()
    }
}

impl ToolSession {
    #[must_use]
    pub fn new(
        connection: Arc<Connection>,
        spec: ToolSpec,
        sequence: Arc<ReportSequence>,
        sink: Arc<dyn ReportSink>,
    ) -> Self {
        let tool = Tool::new(&spec);
        Self {
            connection,
            spec,
            sequence,
            sink,
            main_thread_only: tool.main_thread_only(),
            state: Mutex::new(State {
                active: 0,
                report: None,
                tool,
            }),
        }
    }

    #[must_use]
    pub const fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    #[must_use]
    pub const fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Whether worker sessions must share this session.
    #[must_use]
    pub const fn main_thread_only(&self) -> bool {
        self.main_thread_only
    }

    /// Current nesting depth.
    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active
    }

    /// Report written by the active bracket, if any.
    pub async fn current_report(&self) -> Option<ReportId> {
        self.state.lock().await.report.as_ref().map(ReportHandle::id)
    }

    fn report(&self, id: ReportId) -> ReportHandle {
        ReportHandle::new(id, Arc::clone(&self.sink))
    }

    /// Enter a bracket. The outermost call begins the tool.
    ///
    /// Returns the report id the bracket writes to.
    ///
    /// # Errors
    /// Returns error if the tool fails to begin; the session stays idle.
    pub async fn start(&self) -> Result<ReportId, SessionError> {
        let mut state = self.state.lock().await;
        if let Some(id) = state.report.as_ref().map(ReportHandle::id) {
            state.active += 1;
            tracing::debug!(report_id = %id, active = state.active, "nested start");
            return Ok(id);
        }

        let report = self.report(self.sequence.next_id());
        let id = report.id();
        tracing::info!(report_id = %id, kind = %self.spec.kind, "session start");
        let handle: Arc<dyn Report> = Arc::new(report.clone());
        state.tool.begin(&self.connection, handle).await?;
        state.active = 1;
        state.report = Some(report);
        Ok(id)
    }

    /// Leave a bracket. The outermost call ends the tool.
    ///
    /// Returns the finished report id when the tool was ended.
    ///
    /// # Errors
    /// Returns error if the tool fails to end; the bracket is closed anyway.
    pub async fn stop(&self) -> Result<Option<ReportId>, SessionError> {
        let mut state = self.state.lock().await;
        match state.active {
            0 => {
                tracing::warn!(kind = %self.spec.kind, "stop without start");
                Ok(None)
            }
            1 => {
                state.active = 0;
                let Some(report) = state.report.take() else {
                    return Ok(None);
                };
                let id = report.id();
                tracing::info!(report_id = %id, kind = %self.spec.kind, "session stop");
                let handle: Arc<dyn Report> = Arc::new(report);
                state.tool.end(&self.connection, handle).await?;
                Ok(Some(id))
            }
            _ => {
                state.active -= 1;
                tracing::debug!(active = state.active, "nested stop");
                Ok(None)
            }
        }
    }

    /// Take a point-in-time snapshot under its own report id.
    ///
    /// Profiling agents are per-connection singletons, so a second tool
    /// cannot run beside an active bracket. While Active, the bracket is
    /// rotated instead: its report is ended and returned as the snapshot,
    /// and recording continues into a new report. The nesting depth is left
    /// untouched. While Idle, a fresh tool runs begin then end.
    ///
    /// # Errors
    /// Returns error if the snapshot tool fails. A rotation that fails
    /// leaves the session Idle.
    pub async fn capture(&self) -> Result<ReportId, SessionError> {
        let mut state = self.state.lock().await;
        let Some(current) = state.report.take() else {
            drop(state);
            return self.capture_idle().await;
        };

        let id = current.id();
        tracing::info!(
            report_id = %id,
            kind = %self.spec.kind,
            active = state.active,
            "capture rotates bracket"
        );
        let ended = state.tool.end(&self.connection, Arc::new(current)).await;
        if let Err(e) = ended {
            state.active = 0;
            return Err(e.into());
        }

        let next = self.report(self.sequence.next_id());
        let handle: Arc<dyn Report> = Arc::new(next.clone());
        state.tool = Tool::new(&self.spec);
        if let Err(e) = state.tool.begin(&self.connection, handle).await {
            state.active = 0;
            return Err(e.into());
        }
        state.report = Some(next);
        Ok(id)
    }

    async fn capture_idle(&self) -> Result<ReportId, SessionError> {
        let mut tool = Tool::new(&self.spec);
        let report = self.report(self.sequence.next_id());
        let id = report.id();
        let report: Arc<dyn Report> = Arc::new(report);
        tracing::info!(report_id = %id, kind = %self.spec.kind, "capture");
        tool.begin(&self.connection, Arc::clone(&report)).await?;
        tool.end(&self.connection, report).await?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use thetool_core::{ReportStore, ToolKind};
    use thetool_transport::testing::{FakeInspector, Reply};

    use super::*;

    fn cpu_inspector() -> (Arc<Connection>, FakeInspector) {
        FakeInspector::builder()
            .reply("Profiler.stop", Reply::result(json!({"profile": {"nodes": []}})))
            .connect()
    }

    fn session(conn: &Arc<Connection>, seq: &Arc<ReportSequence>, store: &Arc<ReportStore>) -> ToolSession {
        ToolSession::new(
            Arc::clone(conn),
            ToolSpec::new(ToolKind::Cpu),
            Arc::clone(seq),
            Arc::clone(store) as Arc<dyn ReportSink>,
        )
    }

    #[tokio::test]
    async fn test_nested_brackets_begin_and_end_once() {
        for depth in 1..=4 {
            let (conn, fake) = cpu_inspector();
            let seq = Arc::new(ReportSequence::new());
            let store = Arc::new(ReportStore::new());
            let session = session(&conn, &seq, &store);

            let mut ids = Vec::new();
            for _ in 0..depth {
                ids.push(session.start().await.unwrap());
            }
            assert_eq!(session.active_count().await, depth);
            assert!(ids.iter().all(|id| *id == ReportId::new(1)));

            let mut finished = Vec::new();
            for _ in 0..depth {
                finished.push(session.stop().await.unwrap());
            }
            assert_eq!(finished.pop().unwrap(), Some(ReportId::new(1)));
            assert!(finished.iter().all(Option::is_none));

            assert_eq!(fake.count("Profiler.start"), 1, "depth {depth}");
            assert_eq!(fake.count("Profiler.stop"), 1, "depth {depth}");
            assert_eq!(store.reports().len(), 1);
            assert_eq!(store.finish_count(ReportId::new(1)), 1);
            assert_eq!(session.active_count().await, 0);
            assert_eq!(session.current_report().await, None);
        }
    }

    #[tokio::test]
    async fn test_each_bracket_gets_new_report() {
        let (conn, _fake) = cpu_inspector();
        let seq = Arc::new(ReportSequence::new());
        let store = Arc::new(ReportStore::new());
        let session = session(&conn, &seq, &store);

        for expected in 1..=3 {
            let id = session.start().await.unwrap();
            assert_eq!(id, ReportId::new(expected));
            assert_eq!(session.current_report().await, Some(id));
            session.stop().await.unwrap();
        }
        let reports = store.reports();
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|r| r.finished && r.data == r#"{"nodes":[]}"#));
    }

    #[tokio::test]
    async fn test_stop_while_idle_is_noop() {
        let (conn, fake) = cpu_inspector();
        let seq = Arc::new(ReportSequence::new());
        let store = Arc::new(ReportStore::new());
        let session = session(&conn, &seq, &store);

        assert_eq!(session.stop().await.unwrap(), None);
        assert!(fake.calls().is_empty());
        assert!(store.get_history().is_empty());
    }

    #[tokio::test]
    async fn test_ids_unique_across_sessions() {
        let (main_conn, _main) = cpu_inspector();
        let (worker_conn, _worker) = cpu_inspector();
        let seq = Arc::new(ReportSequence::new());
        let store = Arc::new(ReportStore::new());
        let main = session(&main_conn, &seq, &store);
        let worker = session(&worker_conn, &seq, &store);

        for _ in 0..5 {
            let (a, b) = tokio::join!(main.start(), worker.start());
            assert_ne!(a.unwrap(), b.unwrap());
            let (a, b) = tokio::join!(main.stop(), worker.stop());
            assert_ne!(a.unwrap(), b.unwrap());
        }
        let ids: std::collections::HashSet<_> = store.reports().iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), 10);
    }

    #[tokio::test]
    async fn test_failed_begin_stays_idle() {
        let (conn, fake) = FakeInspector::builder()
            .reply("Profiler.start", Reply::error("boom"))
            .connect();
        let seq = Arc::new(ReportSequence::new());
        let store = Arc::new(ReportStore::new());
        let session = session(&conn, &seq, &store);

        let err = session.start().await.unwrap_err();
        assert_eq!(err.to_string(), "Tool error: Protocol error (Profiler.start): boom");
        assert_eq!(session.active_count().await, 0);
        assert_eq!(session.current_report().await, None);
        assert!(store.get_history().is_empty());

        assert!(session.start().await.is_err());
        assert_eq!(fake.count("Profiler.enable"), 2);
    }

    #[tokio::test]
    async fn test_capture_while_idle_runs_fresh_tool() {
        let (conn, fake) = cpu_inspector();
        let seq = Arc::new(ReportSequence::new());
        let store = Arc::new(ReportStore::new());
        let session = session(&conn, &seq, &store);

        let snapshot = session.capture().await.unwrap();
        assert_eq!(snapshot, ReportId::new(1));
        assert_eq!(session.active_count().await, 0);
        assert!(store.report(snapshot).unwrap().finished);
        assert_eq!(
            fake.methods(),
            vec!["Profiler.enable", "Profiler.start", "Profiler.stop"]
        );
    }

    #[tokio::test]
    async fn test_capture_rotates_active_bracket() {
        let (conn, fake) = cpu_inspector();
        let seq = Arc::new(ReportSequence::new());
        let store = Arc::new(ReportStore::new());
        let session = session(&conn, &seq, &store);

        let outer = session.start().await.unwrap();
        session.start().await.unwrap();
        let snapshot = session.capture().await.unwrap();
        assert_eq!(snapshot, outer);
        assert!(store.report(snapshot).unwrap().finished);

        let continued = session.current_report().await.unwrap();
        assert_ne!(continued, snapshot);
        assert_eq!(session.active_count().await, 2);
        assert!(!store.report(continued).unwrap().finished);

        session.stop().await.unwrap();
        assert_eq!(session.stop().await.unwrap(), Some(continued));
        assert!(store.report(continued).unwrap().finished);

        // Never two profiles recording at once.
        assert_eq!(
            fake.methods(),
            vec![
                "Profiler.enable",
                "Profiler.start",
                "Profiler.stop",
                "Profiler.enable",
                "Profiler.start",
                "Profiler.stop",
            ]
        );
        assert_eq!(store.reports().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_rotation_leaves_session_idle() {
        let (conn, _fake) = FakeInspector::builder()
            .reply("Profiler.stop", Reply::error("No recording profiles found"))
            .connect();
        let seq = Arc::new(ReportSequence::new());
        let store = Arc::new(ReportStore::new());
        let session = session(&conn, &seq, &store);

        session.start().await.unwrap();
        assert!(session.capture().await.is_err());
        assert_eq!(session.active_count().await, 0);
        assert_eq!(session.current_report().await, None);
        assert_eq!(session.stop().await.unwrap(), None);
    }

    #[test]
    fn test_main_thread_only_follows_kind() {
        tokio_test::block_on(async {
            let (conn, _fake) = cpu_inspector();
            let seq = Arc::new(ReportSequence::new());
            let store: Arc<dyn ReportSink> = Arc::new(ReportStore::new());
            let tracing = ToolSession::new(
                Arc::clone(&conn),
                ToolSpec::new(ToolKind::Tracing),
                Arc::clone(&seq),
                Arc::clone(&store),
            );
            let cpu = ToolSession::new(conn, ToolSpec::new(ToolKind::Cpu), seq, store);
            assert!(tracing.main_thread_only());
            assert!(!cpu.main_thread_only());
        });
    }
}

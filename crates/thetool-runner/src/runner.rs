//! Target lifecycle: spawn, attach, drive the session, tear down.

use std::{process::ExitStatus, sync::Arc, time::Duration};

use command_group::AsyncCommandGroup;
use serde_json::json;
use thetool_core::{ReportSequence, ReportSink, ToolSpec};
use thetool_session::{SessionError, ToolSession};
use thetool_transport::{
    Connection, ConnectionError, Endpoint, EndpointError, Event, EventKind, TransportError,
    WebSocketTransport,
};
use thiserror::Error;
use tokio::{sync::oneshot, task::JoinSet};

use crate::{
    command::{CommandError, TargetCommand},
    diagnostics::scan_diagnostics,
    hook::{self, Trigger, TriggerCall},
    worker,
};

/// Execution context whose destruction ends the run.
pub const ROOT_CONTEXT_ID: i64 = 1;

/// How long teardown waits for worker sessions and trailing diagnostics.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Runner error.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// What to run and how to profile it.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub command: TargetCommand,
    pub spec: ToolSpec,
    pub on_demand: bool,
}

/// Result of a completed run.
#[derive(Debug)]
pub struct RunOutcome {
    pub status: ExitStatus,
    /// `None` when the target exited without announcing an endpoint.
    pub endpoint: Option<Endpoint>,
}

/// Everything needed to build sessions for one run.
#[derive(Clone)]
pub struct SessionContext {
    pub spec: ToolSpec,
    pub on_demand: bool,
    pub sequence: Arc<ReportSequence>,
    pub sink: Arc<dyn ReportSink>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("spec", &self.spec)
            .field("on_demand", &self.on_demand)
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    /// A session on `conn` drawing ids from the shared sequence.
    #[must_use]
    pub fn session(&self, conn: Arc<Connection>) -> ToolSession {
        ToolSession::new(
            conn,
            self.spec.clone(),
            Arc::clone(&self.sequence),
            Arc::clone(&self.sink),
        )
    }
}

/// Runs one target process under the inspector.
pub struct Runner {
    config: RunnerConfig,
    sink: Arc<dyn ReportSink>,
    sequence: Arc<ReportSequence>,
}

impl Runner {
    #[must_use]
    pub fn new(config: RunnerConfig, sink: Arc<dyn ReportSink>) -> Self {
        Self {
            config,
            sink,
            sequence: Arc::new(ReportSequence::new()),
        }
    }

    /// Use an existing id sequence.
    #[must_use]
    pub fn with_sequence(mut self, sequence: Arc<ReportSequence>) -> Self {
        self.sequence = sequence;
        self
    }

    fn context(&self) -> SessionContext {
        SessionContext {
            spec: self.config.spec.clone(),
            on_demand: self.config.on_demand,
            sequence: Arc::clone(&self.sequence),
            sink: Arc::clone(&self.sink),
        }
    }

    /// Spawn the target and profile it until it exits.
    ///
    /// # Errors
    /// Returns error if the target cannot be spawned or the session fails.
    /// On session failure the target's process group is killed first.
    pub async fn run(&self) -> Result<RunOutcome, RunnerError> {
        let target = &self.config.command;
        let executable = target.resolve().await?;
        let shown = target.display()?;
        tracing::info!(command = %shown, executable = %executable.display(), "spawning target");

        let mut child = target
            .to_command(&executable)
            .group_spawn()
            .map_err(|source| RunnerError::Spawn {
                program: target.program.clone(),
                source,
            })?;
        let stderr = child
            .inner()
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("target stderr was not captured"))?;

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let mut scanner = tokio::spawn(scan_diagnostics(stderr, tokio::io::stderr(), endpoint_tx));

        let announced = tokio::select! {
            url = endpoint_rx => url.ok(),
            status = child.wait() => {
                let status = status?;
                tracing::info!(%status, "target exited before announcing an endpoint");
                drain_scanner(&mut scanner).await;
                return Ok(RunOutcome { status, endpoint: None });
            }
        };
        let Some(url) = announced else {
            let status = child.wait().await?;
            tracing::info!(%status, "diagnostic stream closed without an endpoint");
            drain_scanner(&mut scanner).await;
            return Ok(RunOutcome {
                status,
                endpoint: None,
            });
        };

        let attached = match url.parse::<Endpoint>() {
            Ok(endpoint) => self.attach(&endpoint).await.map(|()| endpoint),
            Err(e) => Err(e.into()),
        };
        match attached {
            Ok(endpoint) => {
                let status = child.wait().await?;
                drain_scanner(&mut scanner).await;
                tracing::info!(%status, port = endpoint.port, "target finished");
                Ok(RunOutcome {
                    status,
                    endpoint: Some(endpoint),
                })
            }
            Err(e) => {
                tracing::error!(error = %e, "session failed, killing target");
                if let Err(kill) = child.start_kill() {
                    tracing::warn!(error = %kill, "failed to kill target process group");
                }
                let _ = child.wait().await;
                scanner.abort();
                Err(e)
            }
        }
    }

    async fn attach(&self, endpoint: &Endpoint) -> Result<(), RunnerError> {
        self.sink.attached(endpoint.port);
        let transport = WebSocketTransport::connect(endpoint).await?;
        tracing::info!(%endpoint, "connected to inspector");
        drive(Connection::new(Arc::new(transport)), self.context()).await
    }
}

async fn drain_scanner(scanner: &mut tokio::task::JoinHandle<std::io::Result<()>>) {
    match tokio::time::timeout(DRAIN_TIMEOUT, &mut *scanner).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::warn!(error = %e, "diagnostic forwarding failed"),
        Ok(Err(e)) => tracing::warn!(error = %e, "diagnostic scanner panicked"),
        Err(_) => {
            tracing::debug!("diagnostic stream still open, detaching");
            scanner.abort();
        }
    }
}

/// Drive the main session over an attached connection until the root
/// context is destroyed, then tear down. The connection is always closed.
///
/// # Errors
/// Returns error if a command or session operation fails.
pub async fn drive(conn: Arc<Connection>, ctx: SessionContext) -> Result<(), RunnerError> {
    let result = drive_session(&conn, &ctx).await;
    if let Err(e) = conn.close().await {
        tracing::debug!(error = %e, "closing inspector connection");
    }
    result
}

async fn drive_session(conn: &Arc<Connection>, ctx: &SessionContext) -> Result<(), RunnerError> {
    let main = Arc::new(ctx.session(Arc::clone(conn)));
    let mut events = conn.subscribe(&[
        EventKind::ConsoleApiCalled,
        EventKind::ExecutionContextDestroyed,
        EventKind::AttachedToWorker,
    ]);

    if ctx.on_demand {
        hook::install(conn).await?;
        conn.send(
            "NodeWorker.enable",
            json!({ "waitForDebuggerOnStart": true }),
        )
        .await?;
    } else {
        main.start().await?;
    }
    conn.send("Runtime.enable", json!({})).await?;
    conn.send("Runtime.runIfWaitingForDebugger", json!({}))
        .await?;

    let mut workers = JoinSet::new();
    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(Event::ConsoleApiCalled(call)) => {
                    let Some(trigger) = TriggerCall::from_console(&call) else {
                        continue;
                    };
                    if let Err(e) = handle_trigger(&main, conn, trigger).await {
                        break Err(e);
                    }
                }
                Some(Event::ExecutionContextDestroyed(destroyed))
                    if destroyed.execution_context_id == ROOT_CONTEXT_ID =>
                {
                    tracing::info!("root context destroyed");
                    break Ok(());
                }
                Some(Event::AttachedToWorker(attached)) => {
                    workers.spawn(worker::run_worker(
                        Arc::clone(conn),
                        Arc::clone(&main),
                        ctx.clone(),
                        attached,
                    ));
                }
                Some(_) => {}
                None => {
                    tracing::warn!("inspector connection ended before the root context");
                    break Ok(());
                }
            },
            Some(joined) = workers.join_next() => log_worker_exit(joined),
        }
    };

    let outcome = match outcome {
        Ok(()) if !ctx.on_demand => main.stop().await.map(drop).map_err(RunnerError::from),
        other => other,
    };

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while let Some(joined) = workers.join_next().await {
            log_worker_exit(joined);
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(remaining = workers.len(), "abandoning worker sessions");
        workers.abort_all();
    }
    outcome
}

fn log_worker_exit(joined: Result<Result<(), RunnerError>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "worker session failed"),
        Err(e) if e.is_cancelled() => {}
        Err(e) => tracing::error!(error = %e, "worker session panicked"),
    }
}

/// Run the session operation for `call`, then settle the trigger promise
/// on `conn`, the connection of the context that raised it.
///
/// The promise is settled even when the operation failed; the operation's
/// error takes precedence.
pub(crate) async fn handle_trigger(
    session: &ToolSession,
    conn: &Connection,
    call: TriggerCall,
) -> Result<(), RunnerError> {
    tracing::info!(trigger = ?call.trigger, token = ?call.token, kind = %session.spec().kind, "on-demand trigger");
    let outcome = match call.trigger {
        Trigger::Start => session.start().await.map(drop),
        Trigger::Stop => session.stop().await.map(drop),
        Trigger::Capture => session.capture().await.map(drop),
    };
    let resumed = match &call.continuation {
        Some(object_id) => hook::resolve(conn, object_id).await,
        None => Ok(()),
    };
    outcome?;
    resumed?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use thetool_core::{ReportId, ReportStore, ToolKind};
    use thetool_transport::testing::{FakeInspector, Reply};

    use super::*;

    fn context(kind: ToolKind, on_demand: bool, store: &Arc<ReportStore>) -> SessionContext {
        SessionContext {
            spec: ToolSpec::new(kind),
            on_demand,
            sequence: Arc::new(ReportSequence::new()),
            sink: Arc::clone(store) as Arc<dyn ReportSink>,
        }
    }

    fn cpu_inspector() -> (Arc<Connection>, FakeInspector) {
        FakeInspector::builder()
            .reply("Profiler.stop", Reply::result(json!({"profile": {"nodes": [1]}})))
            .connect()
    }

    fn trigger(command: &str, object_id: &str) -> Value {
        json!({
            "type": "debug",
            "executionContextId": 1,
            "args": [
                {"type": "string", "value": format!("thetool:v1:{command}")},
                {"type": "function", "objectId": object_id},
                {"type": "number", "value": 1}
            ]
        })
    }

    fn destroyed(id: i64) -> Value {
        json!({ "executionContextId": id })
    }

    #[tokio::test]
    async fn test_whole_run_profile() {
        let (conn, fake) = cpu_inspector();
        let store = Arc::new(ReportStore::new());
        let run = tokio::spawn(drive(conn, context(ToolKind::Cpu, false, &store)));

        fake.wait_for("Runtime.runIfWaitingForDebugger", 1).await;
        fake.emit("Runtime.executionContextDestroyed", destroyed(2));
        fake.emit("Runtime.executionContextDestroyed", destroyed(ROOT_CONTEXT_ID));
        run.await.unwrap().unwrap();

        assert_eq!(
            fake.methods(),
            vec![
                "Profiler.enable",
                "Profiler.start",
                "Runtime.enable",
                "Runtime.runIfWaitingForDebugger",
                "Profiler.stop",
            ]
        );
        let reports = store.reports();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].finished);
        assert_eq!(reports[0].data, r#"{"nodes":[1]}"#);
        assert_eq!(store.finish_count(ReportId::new(1)), 1);
        fake.closed().await;
    }

    #[tokio::test]
    async fn test_on_demand_nested_triggers() {
        let (conn, fake) = cpu_inspector();
        let store = Arc::new(ReportStore::new());
        let run = tokio::spawn(drive(conn, context(ToolKind::Cpu, true, &store)));

        fake.wait_for("Runtime.runIfWaitingForDebugger", 1).await;
        assert_eq!(
            fake.methods(),
            vec![
                "Runtime.evaluate",
                "NodeWorker.enable",
                "Runtime.enable",
                "Runtime.runIfWaitingForDebugger",
            ]
        );
        assert_eq!(fake.calls()[1].params["waitForDebuggerOnStart"], true);

        fake.emit("Runtime.consoleAPICalled", trigger("start", "c1"));
        fake.emit("Runtime.consoleAPICalled", trigger("start", "c2"));
        fake.emit("Runtime.consoleAPICalled", trigger("stop", "c3"));
        fake.emit("Runtime.consoleAPICalled", trigger("stop", "c4"));
        fake.wait_for("Runtime.callFunctionOn", 4).await;
        fake.emit("Runtime.executionContextDestroyed", destroyed(ROOT_CONTEXT_ID));
        run.await.unwrap().unwrap();

        assert_eq!(fake.count("Profiler.start"), 1);
        assert_eq!(fake.count("Profiler.stop"), 1);
        let resolved: Vec<Value> = fake
            .calls()
            .into_iter()
            .filter(|c| c.method == "Runtime.callFunctionOn")
            .map(|c| c.params["objectId"].clone())
            .collect();
        assert_eq!(resolved, vec!["c1", "c2", "c3", "c4"]);
        assert_eq!(store.reports().len(), 1);
        assert!(store.reports()[0].finished);
    }

    #[tokio::test]
    async fn test_on_demand_skips_final_stop() {
        let (conn, fake) = cpu_inspector();
        let store = Arc::new(ReportStore::new());
        let run = tokio::spawn(drive(conn, context(ToolKind::Cpu, true, &store)));

        fake.wait_for("Runtime.runIfWaitingForDebugger", 1).await;
        fake.emit("Runtime.consoleAPICalled", trigger("start", "c1"));
        fake.wait_for("Runtime.callFunctionOn", 1).await;
        fake.emit("Runtime.executionContextDestroyed", destroyed(ROOT_CONTEXT_ID));
        run.await.unwrap().unwrap();

        assert_eq!(fake.count("Profiler.stop"), 0);
        assert!(!store.reports()[0].finished);
    }

    #[tokio::test]
    async fn test_capture_trigger() {
        let (conn, fake) = FakeInspector::builder()
            .reply(
                "HeapProfiler.stopTrackingHeapObjects",
                Reply::result(json!({}))
                    .with_event("HeapProfiler.addHeapSnapshotChunk", json!({"chunk": "{\"snap"}))
                    .with_event("HeapProfiler.addHeapSnapshotChunk", json!({"chunk": "shot\":1}"})),
            )
            .connect();
        let store = Arc::new(ReportStore::new());
        let run = tokio::spawn(drive(conn, context(ToolKind::HeapTimeline, true, &store)));

        fake.wait_for("Runtime.runIfWaitingForDebugger", 1).await;
        fake.emit("Runtime.consoleAPICalled", trigger("capture", "c1"));
        fake.wait_for("Runtime.callFunctionOn", 1).await;
        fake.emit("Runtime.executionContextDestroyed", destroyed(ROOT_CONTEXT_ID));
        run.await.unwrap().unwrap();

        let reports = store.reports();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].finished);
        assert_eq!(reports[0].data, r#"{"snapshot":1}"#);
    }

    #[tokio::test]
    async fn test_failed_trigger_still_resolves() {
        let (conn, fake) = FakeInspector::builder()
            .reply("Profiler.start", Reply::error("not allowed"))
            .connect();
        let store = Arc::new(ReportStore::new());
        let run = tokio::spawn(drive(conn, context(ToolKind::Cpu, true, &store)));

        fake.wait_for("Runtime.runIfWaitingForDebugger", 1).await;
        fake.emit("Runtime.consoleAPICalled", trigger("start", "c1"));
        let err = run.await.unwrap().unwrap_err();

        assert!(err.to_string().contains("not allowed"), "{err}");
        assert_eq!(fake.count("Runtime.callFunctionOn"), 1);
        fake.closed().await;
    }

    #[tokio::test]
    async fn test_failed_start_closes_connection() {
        let (conn, fake) = FakeInspector::builder()
            .reply("Profiler.enable", Reply::error("no profiler"))
            .connect();
        let store = Arc::new(ReportStore::new());

        let err = drive(conn, context(ToolKind::Cpu, false, &store))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Session(_)));
        assert_eq!(fake.count("Runtime.runIfWaitingForDebugger"), 0);
        fake.closed().await;
    }

    #[tokio::test]
    async fn test_ordinary_console_output_ignored() {
        let (conn, fake) = cpu_inspector();
        let store = Arc::new(ReportStore::new());
        let run = tokio::spawn(drive(conn, context(ToolKind::Cpu, true, &store)));

        fake.wait_for("Runtime.runIfWaitingForDebugger", 1).await;
        fake.emit(
            "Runtime.consoleAPICalled",
            json!({"type": "log", "args": [{"type": "string", "value": "hello"}]}),
        );
        fake.emit("Runtime.executionContextDestroyed", destroyed(ROOT_CONTEXT_ID));
        run.await.unwrap().unwrap();

        assert_eq!(fake.count("Runtime.callFunctionOn"), 0);
        assert!(store.reports().is_empty());
    }
}

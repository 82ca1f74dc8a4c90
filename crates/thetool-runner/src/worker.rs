//! Worker thread sessions over the relay.

use std::sync::Arc;

use serde_json::json;
use thetool_session::ToolSession;
use thetool_transport::{Connection, Event, EventKind, RelayTransport, protocol::AttachedToWorker};

use crate::{
    hook::{self, TriggerCall},
    runner::{RunnerError, SessionContext, handle_trigger},
};

/// Arm one attached worker and serve its triggers until it detaches.
///
/// Main-thread-only tools run worker triggers on `main`; every other tool
/// gets a session of its own on the relayed connection.
pub(crate) async fn run_worker(
    parent: Arc<Connection>,
    main: Arc<ToolSession>,
    ctx: SessionContext,
    attached: AttachedToWorker,
) -> Result<(), RunnerError> {
    let session_id = attached.session_id;
    tracing::info!(
        session_id,
        url = attached.worker_info.url,
        waiting = attached.waiting_for_debugger,
        "worker attached"
    );

    let conn = Connection::new(Arc::new(RelayTransport::new(parent, session_id.clone())));
    let shared = main.main_thread_only();
    let session = if shared {
        main
    } else {
        Arc::new(ctx.session(Arc::clone(&conn)))
    };
    let mut events = conn.subscribe(&[EventKind::ConsoleApiCalled]);

    let served = async {
        hook::install(&conn).await?;
        conn.send("Runtime.enable", json!({})).await?;
        conn.send("Runtime.runIfWaitingForDebugger", json!({}))
            .await?;
        while let Some(event) = events.recv().await {
            let Event::ConsoleApiCalled(call) = event else {
                continue;
            };
            if let Some(trigger) = TriggerCall::from_console(&call) {
                handle_trigger(&session, &conn, trigger).await?;
            }
        }
        Ok::<(), RunnerError>(())
    }
    .await;

    if !shared {
        let active = session.active_count().await;
        if active > 0 {
            let report_id = session.current_report().await;
            tracing::warn!(
                session_id,
                active,
                ?report_id,
                "worker detached with an active session, abandoning it"
            );
        }
    }
    tracing::debug!(session_id, "worker session finished");
    if let Err(e) = conn.close().await {
        tracing::debug!(session_id, error = %e, "closing worker connection");
    }
    served
}

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use thetool_core::{ReportSequence, ReportSink, ReportStore, ToolKind, ToolSpec};
    use thetool_transport::testing::{FakeInspector, Reply};

    use super::*;
    use crate::runner::drive;

    fn attached(session_id: &str) -> Value {
        json!({
            "sessionId": session_id,
            "workerInfo": {
                "workerId": "1",
                "type": "worker",
                "title": "worker.js",
                "url": "file:///tmp/worker.js"
            },
            "waitingForDebugger": true
        })
    }

    fn trigger(command: &str, object_id: &str) -> Value {
        json!({
            "type": "debug",
            "executionContextId": 1,
            "args": [
                {"type": "string", "value": format!("thetool:v1:{command}")},
                {"type": "function", "objectId": object_id}
            ]
        })
    }

    fn context(kind: ToolKind, store: &Arc<ReportStore>) -> SessionContext {
        SessionContext {
            spec: ToolSpec::new(kind),
            on_demand: true,
            sequence: Arc::new(ReportSequence::new()),
            sink: Arc::clone(store) as Arc<dyn ReportSink>,
        }
    }

    #[tokio::test]
    async fn test_worker_gets_own_session() {
        let (conn, fake) = FakeInspector::builder()
            .reply("Profiler.stop", Reply::result(json!({"profile": {"worker": true}})))
            .connect();
        let store = Arc::new(ReportStore::new());
        let run = tokio::spawn(drive(conn, context(ToolKind::Cpu, &store)));

        fake.wait_for("Runtime.runIfWaitingForDebugger", 1).await;
        fake.emit("NodeWorker.attachedToWorker", attached("w1"));
        fake.wait_for("Runtime.runIfWaitingForDebugger", 2).await;
        assert_eq!(
            fake.worker_methods("w1"),
            vec!["Runtime.evaluate", "Runtime.enable", "Runtime.runIfWaitingForDebugger"]
        );

        fake.emit_worker("w1", "Runtime.consoleAPICalled", trigger("start", "w-c1"));
        fake.emit_worker("w1", "Runtime.consoleAPICalled", trigger("stop", "w-c2"));
        fake.wait_for("Runtime.callFunctionOn", 2).await;
        fake.emit("NodeWorker.detachedFromWorker", json!({"sessionId": "w1"}));
        fake.emit(
            "Runtime.executionContextDestroyed",
            json!({"executionContextId": 1}),
        );
        run.await.unwrap().unwrap();

        let worker = fake.worker_methods("w1");
        assert!(worker.contains(&"Profiler.start".to_string()));
        assert!(worker.contains(&"Profiler.stop".to_string()));
        assert!(!fake.methods().contains(&"Profiler.start".to_string()));
        let reports = store.reports();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].finished);
        assert_eq!(reports[0].data, r#"{"worker":true}"#);
    }

    #[tokio::test]
    async fn test_main_thread_only_tool_shares_main_session() {
        let (conn, fake) = FakeInspector::builder()
            .reply(
                "NodeTracing.stop",
                Reply::result(json!({}))
                    .with_event("NodeTracing.dataCollected", json!({"value": [{"ph": "X"}]})),
            )
            .connect();
        let store = Arc::new(ReportStore::new());
        let run = tokio::spawn(drive(conn, context(ToolKind::Tracing, &store)));

        fake.wait_for("Runtime.runIfWaitingForDebugger", 1).await;
        fake.emit("NodeWorker.attachedToWorker", attached("w1"));
        fake.wait_for("Runtime.runIfWaitingForDebugger", 2).await;

        fake.emit("Runtime.consoleAPICalled", trigger("start", "m-c1"));
        fake.wait_for("Runtime.callFunctionOn", 1).await;
        fake.emit_worker("w1", "Runtime.consoleAPICalled", trigger("start", "w-c1"));
        fake.emit_worker("w1", "Runtime.consoleAPICalled", trigger("stop", "w-c2"));
        fake.wait_for("Runtime.callFunctionOn", 3).await;
        fake.emit("Runtime.consoleAPICalled", trigger("stop", "m-c2"));
        fake.wait_for("Runtime.callFunctionOn", 4).await;
        fake.emit("NodeWorker.detachedFromWorker", json!({"sessionId": "w1"}));
        fake.emit(
            "Runtime.executionContextDestroyed",
            json!({"executionContextId": 1}),
        );
        run.await.unwrap().unwrap();

        assert_eq!(fake.count("NodeTracing.start"), 1);
        assert_eq!(fake.count("NodeTracing.stop"), 1);
        assert!(!fake.worker_methods("w1").iter().any(|m| m.starts_with("NodeTracing.")));
        let worker_resolves = fake
            .calls()
            .into_iter()
            .filter(|c| c.session_id.as_deref() == Some("w1") && c.method == "Runtime.callFunctionOn")
            .count();
        assert_eq!(worker_resolves, 2);
        assert_eq!(store.reports().len(), 1);
    }

    #[tokio::test]
    async fn test_worker_detach_ends_session() {
        let (conn, fake) = FakeInspector::builder().connect();
        let store = Arc::new(ReportStore::new());
        let main = Arc::new(context(ToolKind::Cpu, &store).session(Arc::clone(&conn)));
        let attached: AttachedToWorker = serde_json::from_value(attached("w9")).unwrap();

        let worker = tokio::spawn(run_worker(
            Arc::clone(&conn),
            main,
            context(ToolKind::Cpu, &store),
            attached,
        ));
        fake.wait_for("Runtime.runIfWaitingForDebugger", 1).await;
        fake.emit_worker("w9", "Runtime.consoleAPICalled", trigger("start", "c1"));
        fake.wait_for("Runtime.callFunctionOn", 1).await;
        fake.emit("NodeWorker.detachedFromWorker", json!({"sessionId": "w9"}));

        worker.await.unwrap().unwrap();
        assert_eq!(fake.count("Profiler.stop"), 0);
        assert!(!store.reports()[0].finished);
        assert!(!conn.is_closed());
    }
}

//! Trace event capture through the `NodeTracing` domain.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use thetool_core::{RecordMode, Report, ToolOptions};
use thetool_transport::{Connection, Event, EventKind};

use super::{ChunkForwarder, PERFORMANCE_HINT, ToolError};

const DISABLED_PREFIX: &str = "disabled-by-default-";

#[derive(Debug, Deserialize)]
struct Categories {
    categories: Vec<String>,
}

/// Position inside the JSON array being streamed.
#[derive(Debug, Default)]
struct ArrayFraming {
    groups: usize,
}

impl ArrayFraming {
    /// Chunks for one `dataCollected` group. Empty groups produce nothing.
    fn frame(&mut self, values: &[Value]) -> Vec<String> {
        if values.is_empty() {
            return Vec::new();
        }
        let separator = if self.groups == 0 { "[" } else { "," };
        self.groups += 1;
        let body = values
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join(",");
        vec![separator.to_string(), body]
    }

    /// Closing chunks.
    fn close(&self) -> Vec<String> {
        if self.groups == 0 {
            vec!["[".to_string(), "]".to_string()]
        } else {
            vec!["]".to_string()]
        }
    }
}

/// Trace events, written out as one JSON array.
#[derive(Debug)]
pub struct TraceRecorder {
    record_mode: RecordMode,
    categories: Vec<String>,
    list_categories: bool,
    forwarder: Option<ChunkForwarder<ArrayFraming>>,
}

impl TraceRecorder {
    #[must_use]
    pub fn new(options: &ToolOptions) -> Self {
        Self {
            record_mode: options.record_mode,
            categories: with_disabled_mirrors(options.categories()),
            list_categories: options.list_categories,
            forwarder: None,
        }
    }

    /// Categories sent to the trace agent.
    #[must_use]
    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub(super) async fn begin(
        &mut self,
        conn: &Connection,
        report: Arc<dyn Report>,
    ) -> Result<(), ToolError> {
        if self.list_categories {
            let Categories { categories } = conn
                .send_as("NodeTracing.getCategories", json!({}))
                .await?;
            println!("Available categories: {}", categories.join(", "));
            return Ok(());
        }

        let subscription = conn.subscribe(&[EventKind::TracingDataCollected]);
        let started = conn
            .send(
                "NodeTracing.start",
                json!({
                    "traceConfig": {
                        "recordMode": self.record_mode.as_str(),
                        "includedCategories": self.categories,
                    }
                }),
            )
            .await;
        if let Err(e) = started {
            conn.unsubscribe(subscription.id());
            return Err(e.into());
        }

        report.start("json", PERFORMANCE_HINT);
        self.forwarder = Some(ChunkForwarder::spawn(
            subscription,
            ArrayFraming::default(),
            move |framing, event| {
                if let Event::TracingDataCollected(data) = event {
                    for chunk in framing.frame(&data.value) {
                        report.chunk(chunk);
                    }
                }
            },
        ));
        Ok(())
    }

    pub(super) async fn end(&mut self, conn: &Connection, report: &dyn Report) -> Result<(), ToolError> {
        if self.list_categories {
            return Ok(());
        }

        conn.send("NodeTracing.stop", json!({})).await?;
        let framing = match self.forwarder.take() {
            Some(forwarder) => forwarder.finish(conn).await?,
            None => ArrayFraming::default(),
        };
        for chunk in framing.close() {
            report.chunk(chunk);
        }
        report.finish();
        Ok(())
    }
}

/// Add a `disabled-by-default-` twin for every category that is not one.
fn with_disabled_mirrors(mut categories: Vec<String>) -> Vec<String> {
    let mirrors: Vec<String> = categories
        .iter()
        .filter(|c| !c.starts_with(DISABLED_PREFIX))
        .map(|c| format!("{DISABLED_PREFIX}{c}"))
        .collect();
    categories.extend(mirrors);
    categories
}

//! Tools driven through the `HeapProfiler` domain.

use std::sync::Arc;

use serde_json::json;
use thetool_core::Report;
use thetool_transport::{Connection, Event, EventKind};

use super::{ChunkForwarder, MEMORY_HINT, ToolError, field_chunk};

/// Sampling heap profile.
#[derive(Debug)]
pub struct HeapSampler {
    sampling_interval: f64,
}

impl HeapSampler {
    #[must_use]
    pub const fn new(sampling_interval: f64) -> Self {
        Self { sampling_interval }
    }

    pub(super) async fn begin(&self, conn: &Connection, report: &dyn Report) -> Result<(), ToolError> {
        conn.send(
            "HeapProfiler.startSampling",
            json!({ "samplingInterval": self.sampling_interval }),
        )
        .await?;
        report.start("heapprofile", MEMORY_HINT);
        Ok(())
    }

    pub(super) async fn end(&self, conn: &Connection, report: &dyn Report) -> Result<(), ToolError> {
        let result = conn.send("HeapProfiler.stopSampling", json!({})).await?;
        report.chunk(field_chunk(&result, "HeapProfiler.stopSampling", "profile")?);
        report.finish();
        Ok(())
    }
}

/// Heap allocation timeline, streamed as snapshot chunks.
#[derive(Debug)]
pub struct HeapTimeline {
    track_allocations: bool,
    forwarder: Option<ChunkForwarder<()>>,
}

impl HeapTimeline {
    #[must_use]
    pub const fn new(track_allocations: bool) -> Self {
        Self {
            track_allocations,
            forwarder: None,
        }
    }

    pub(super) async fn begin(
        &mut self,
        conn: &Connection,
        report: Arc<dyn Report>,
    ) -> Result<(), ToolError> {
        let subscription = conn.subscribe(&[EventKind::AddHeapSnapshotChunk]);
        let started = conn
            .send(
                "HeapProfiler.startTrackingHeapObjects",
                json!({ "trackAllocations": self.track_allocations }),
            )
            .await;
        if let Err(e) = started {
            conn.unsubscribe(subscription.id());
            return Err(e.into());
        }

        // Chunks delivered so far wait in the subscription until the start
        // event is out.
        report.start("heaptimeline", MEMORY_HINT);
        self.forwarder = Some(ChunkForwarder::spawn(subscription, (), move |_, event| {
            if let Event::AddHeapSnapshotChunk(chunk) = event {
                report.chunk(chunk.chunk);
            }
        }));
        Ok(())
    }

    pub(super) async fn end(&mut self, conn: &Connection, report: &dyn Report) -> Result<(), ToolError> {
        conn.send("HeapProfiler.stopTrackingHeapObjects", json!({}))
            .await?;
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.finish(conn).await?;
        }
        report.finish();
        Ok(())
    }
}

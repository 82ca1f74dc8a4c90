//! History-keeping report collector.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::{ReportEvent, ReportId, ReportSink};

/// A report assembled from its lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedReport {
    pub id: ReportId,
    pub suggested_file_extension: String,
    pub user_hint: String,
    pub data: String,
    pub chunks: usize,
    pub finished: bool,
}

/// In-memory report sink.
///
/// Keeps every lifecycle event it has seen, in arrival order.
pub struct ReportStore {
    history: RwLock<Vec<ReportEvent>>,
}

impl Default for ReportStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            history: RwLock::new(Vec::with_capacity(32)),
        }
    }

    /// Record an event.
    pub fn push(&self, event: ReportEvent) {
        self.history.write().push(event);
    }

    /// Snapshot of every event seen so far.
    #[must_use]
    pub fn get_history(&self) -> Vec<ReportEvent> {
        self.history.read().clone()
    }

    /// Reports assembled from history, ordered by id.
    ///
    /// Chunks or finish events for ids that were never started are ignored.
    #[must_use]
    pub fn reports(&self) -> Vec<CollectedReport> {
        let history = self.history.read();
        let mut reports: BTreeMap<ReportId, CollectedReport> = BTreeMap::new();
        for event in history.iter() {
            match event {
                ReportEvent::ReportStart {
                    id,
                    suggested_file_extension,
                    user_hint,
                } => {
                    reports.insert(
                        *id,
                        CollectedReport {
                            id: *id,
                            suggested_file_extension: suggested_file_extension.clone(),
                            user_hint: user_hint.clone(),
                            data: String::new(),
                            chunks: 0,
                            finished: false,
                        },
                    );
                }
                ReportEvent::ReportChunk { id, chunk } => match reports.get_mut(id) {
                    Some(report) => {
                        report.data.push_str(chunk);
                        report.chunks += 1;
                    }
                    None => tracing::warn!(report_id = %id, "chunk for unknown report"),
                },
                ReportEvent::ReportFinish { id } => {
                    if let Some(report) = reports.get_mut(id) {
                        report.finished = true;
                    }
                }
            }
        }
        reports.into_values().collect()
    }

    /// Look up one assembled report.
    #[must_use]
    pub fn report(&self, id: ReportId) -> Option<CollectedReport> {
        self.reports().into_iter().find(|r| r.id == id)
    }

    /// Number of `ReportFinish` events seen for `id`.
    #[must_use]
    pub fn finish_count(&self, id: ReportId) -> usize {
        self.history
            .read()
            .iter()
            .filter(|e| matches!(e, ReportEvent::ReportFinish { id: finished } if *finished == id))
            .count()
    }
}

impl ReportSink for ReportStore {
    fn on_event(&self, event: ReportEvent) {
        self.push(event);
    }
}

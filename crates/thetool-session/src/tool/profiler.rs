//! Tools driven through the `Profiler` domain.

use serde_json::json;
use thetool_core::Report;
use thetool_transport::Connection;

use super::{COVERAGE_HINT, PERFORMANCE_HINT, TYPE_PROFILE_HINT, ToolError, field_chunk};

/// CPU sampling profile.
#[derive(Debug, Default)]
pub struct CpuProfiler;

impl CpuProfiler {
    pub(super) async fn begin(&self, conn: &Connection, report: &dyn Report) -> Result<(), ToolError> {
        conn.send("Profiler.enable", json!({})).await?;
        conn.send("Profiler.start", json!({})).await?;
        report.start("cpuprofile", PERFORMANCE_HINT);
        Ok(())
    }

    pub(super) async fn end(&self, conn: &Connection, report: &dyn Report) -> Result<(), ToolError> {
        let result = conn.send("Profiler.stop", json!({})).await?;
        report.chunk(field_chunk(&result, "Profiler.stop", "profile")?);
        report.finish();
        Ok(())
    }
}

/// Precise code coverage.
#[derive(Debug, Default)]
pub struct CoverageProfiler;

impl CoverageProfiler {
    pub(super) async fn begin(&self, conn: &Connection, report: &dyn Report) -> Result<(), ToolError> {
        conn.send("Profiler.enable", json!({})).await?;
        conn.send("Profiler.startPreciseCoverage", json!({})).await?;
        report.start("coverage", COVERAGE_HINT);
        Ok(())
    }

    pub(super) async fn end(&self, conn: &Connection, report: &dyn Report) -> Result<(), ToolError> {
        // Stopping first would discard the counters.
        let result = conn.send("Profiler.takePreciseCoverage", json!({})).await?;
        conn.send("Profiler.stopPreciseCoverage", json!({})).await?;
        report.chunk(serde_json::to_string(&result)?);
        report.finish();
        Ok(())
    }
}

/// Type profile.
#[derive(Debug, Default)]
pub struct TypeProfiler;

impl TypeProfiler {
    pub(super) async fn begin(&self, conn: &Connection, report: &dyn Report) -> Result<(), ToolError> {
        conn.send("Profiler.enable", json!({})).await?;
        conn.send("Profiler.startTypeProfile", json!({})).await?;
        report.start("typeprofile", TYPE_PROFILE_HINT);
        Ok(())
    }

    pub(super) async fn end(&self, conn: &Connection, report: &dyn Report) -> Result<(), ToolError> {
        let result = conn.send("Profiler.takeTypeProfile", json!({})).await?;
        conn.send("Profiler.stopTypeProfile", json!({})).await?;
        report.chunk(serde_json::to_string(&result)?);
        report.finish();
        Ok(())
    }
}

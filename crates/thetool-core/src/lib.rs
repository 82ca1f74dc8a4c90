//! Core abstractions shared by every thetool layer.
//!
//! This crate provides the fundamental building blocks:
//! - `Report` / `ReportSink` - Report lifecycle as seen by tools and collectors
//! - `ReportSequence` - Run-wide report id allocator
//! - `ReportStore` - In-memory collector that keeps event history
//! - `ToolKind` / `ToolOptions` / `ToolSpec` - What to profile and how

pub mod options;
pub mod report;
pub mod report_store;
pub mod sequence;

pub use options::{RecordMode, ToolKind, ToolOptions, ToolSpec, UnknownRecordMode, UnknownToolKind};
pub use report::{Report, ReportEvent, ReportHandle, ReportId, ReportSink};
pub use report_store::{CollectedReport, ReportStore};
pub use sequence::ReportSequence;

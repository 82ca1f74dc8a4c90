//! What to profile and how.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Profiling kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolKind {
    /// CPU sampling profile.
    Cpu,
    /// Sampling heap profile.
    HeapSampling,
    /// Heap allocation timeline.
    HeapTimeline,
    /// Precise code coverage.
    Coverage,
    /// Type profile.
    TypeProfile,
    /// Trace events.
    Tracing,
}

impl ToolKind {
    /// Every kind, in CLI listing order.
    pub const ALL: [Self; 6] = [
        Self::Cpu,
        Self::HeapSampling,
        Self::HeapTimeline,
        Self::Coverage,
        Self::TypeProfile,
        Self::Tracing,
    ];

    /// Name accepted on the command line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::HeapSampling => "memorysampling",
            Self::HeapTimeline => "memoryallocation",
            Self::Coverage => "coverage",
            Self::TypeProfile => "type",
            Self::Tracing => "tracing",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognised tool name.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown tool type: {0}")]
pub struct UnknownToolKind(pub String);

impl FromStr for ToolKind {
    type Err = UnknownToolKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownToolKind(s.to_string()))
    }
}

/// Trace buffer policy passed to the tracing agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordMode {
    #[default]
    RecordAsMuchAsPossible,
    RecordUntilFull,
    RecordContinuously,
}

impl RecordMode {
    /// Protocol spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RecordAsMuchAsPossible => "recordAsMuchAsPossible",
            Self::RecordUntilFull => "recordUntilFull",
            Self::RecordContinuously => "recordContinuously",
        }
    }
}

/// Parse error for [`RecordMode`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown record mode: {0}")]
pub struct UnknownRecordMode(pub String);

impl FromStr for RecordMode {
    type Err = UnknownRecordMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recordAsMuchAsPossible" => Ok(Self::RecordAsMuchAsPossible),
            "recordUntilFull" => Ok(Self::RecordUntilFull),
            "recordContinuously" => Ok(Self::RecordContinuously),
            other => Err(UnknownRecordMode(other.to_string())),
        }
    }
}

/// Default heap sampling interval in bytes.
pub const DEFAULT_SAMPLING_INTERVAL: f64 = 32768.0;

/// Tracing categories used when none are configured.
pub const DEFAULT_CATEGORIES: [&str; 3] = ["node", "node.async_hooks", "v8"];

/// Per-kind knobs. Options irrelevant to the chosen kind are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ToolOptions {
    /// Heap sampling interval in bytes.
    pub sampling_interval: Option<f64>,
    /// Record allocation stacks in the heap timeline.
    pub track_allocations: bool,
    /// Tracing record mode.
    pub record_mode: RecordMode,
    /// Tracing categories.
    pub included_categories: Vec<String>,
    /// Print the tracing category catalogue instead of capturing.
    pub list_categories: bool,
}

impl ToolOptions {
    /// Heap sampling interval, falling back to the default.
    #[must_use]
    pub fn sampling_interval(&self) -> f64 {
        self.sampling_interval
            .filter(|v| *v > 0.0)
            .unwrap_or(DEFAULT_SAMPLING_INTERVAL)
    }

    /// Set categories from a comma separated list, dropping empty entries.
    #[must_use]
    pub fn with_categories(mut self, list: &str) -> Self {
        self.included_categories = list
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(String::from)
            .collect();
        self
    }

    /// Configured categories, or the defaults when none are set.
    #[must_use]
    pub fn categories(&self) -> Vec<String> {
        if self.included_categories.is_empty() {
            DEFAULT_CATEGORIES.iter().map(|c| (*c).to_string()).collect()
        } else {
            self.included_categories.clone()
        }
    }
}

/// Everything needed to build a tool instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub kind: ToolKind,
    #[serde(default)]
    pub options: ToolOptions,
}

impl ToolSpec {
    /// Spec with default options.
    #[must_use]
    pub fn new(kind: ToolKind) -> Self {
        Self {
            kind,
            options: ToolOptions::default(),
        }
    }

    /// Spec with explicit options.
    #[must_use]
    pub const fn with_options(kind: ToolKind, options: ToolOptions) -> Self {
        Self { kind, options }
    }
}

//! Command line parsing and validation.

use std::path::PathBuf;

use clap::Parser;
use thetool_core::{RecordMode, ToolKind, ToolOptions, ToolSpec};
use thetool_runner::{CommandError, TargetCommand};
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(
    name = "thetool",
    version,
    about = "Capture CPU, memory, coverage, type and trace profiles of Node.js processes",
    override_usage = "thetool [options] <command to start node process, e.g. node index.js or npm run test>",
    after_help = "\
EXAMPLES:
    thetool -o . -t cpu node index.js
    thetool -o . -t memorysampling npm run test
    thetool -o . -t cpu --ondemand node server.js
    thetool -t tracing --list-categories node -e ''"
)]
pub struct Args {
    /// cpu, memorysampling, memoryallocation, coverage, type or tracing
    #[arg(short, long, value_name = "type")]
    pub tool: Option<String>,

    /// Folder for captured data
    #[arg(short, long, value_name = "existing folder")]
    pub output: Option<PathBuf>,

    /// Add startTheTool/stopTheTool/captureTheTool to the target for on-demand profiling
    #[arg(long)]
    pub ondemand: bool,

    /// Heap sampling interval
    #[arg(long, value_name = "bytes")]
    pub sampling_interval: Option<f64>,

    /// Record allocation stacks in the heap timeline
    #[arg(long)]
    pub track_allocations: bool,

    /// Tracing record mode
    #[arg(long, value_name = "mode")]
    pub record_mode: Option<String>,

    /// Comma separated tracing categories
    #[arg(long, value_name = "list")]
    pub categories: Option<String>,

    /// Print available tracing categories and exit
    #[arg(long)]
    pub list_categories: bool,

    /// Command to start the node process
    #[arg(
        value_name = "command",
        trailing_var_arg = true,
        allow_hyphen_values = true,
        num_args = 0..
    )]
    pub command: Vec<String>,
}

/// Rejected command line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UsageError {
    #[error("please specify how to start node process")]
    MissingCommand,
    #[error("please specify supported tool type using -t option")]
    MissingTool,
    #[error("please specify output folder")]
    MissingOutput,
    #[error("output folder does not exist")]
    OutputNotFound,
    #[error("passed output folder is not a folder")]
    OutputNotFolder,
    #[error("{0}")]
    InvalidOption(String),
}

/// A validated command line.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub command: TargetCommand,
    pub spec: ToolSpec,
    pub on_demand: bool,
    pub output: PathBuf,
}

impl Args {
    /// Check the arguments in the order they are reported to the user.
    ///
    /// # Errors
    /// Returns the first problem found.
    pub fn validate(self) -> Result<Invocation, UsageError> {
        let command = target_command(&self.command)?;
        let kind: ToolKind = self
            .tool
            .as_deref()
            .ok_or(UsageError::MissingTool)?
            .parse()
            .map_err(|_| UsageError::MissingTool)?;

        let listing = self.list_categories && kind == ToolKind::Tracing;
        let output = match self.output {
            Some(output) => {
                if !output.exists() {
                    return Err(UsageError::OutputNotFound);
                }
                if !output.is_dir() {
                    return Err(UsageError::OutputNotFolder);
                }
                output
            }
            None if listing => PathBuf::from("."),
            None => return Err(UsageError::MissingOutput),
        };

        let mut options = ToolOptions {
            sampling_interval: self.sampling_interval,
            track_allocations: self.track_allocations,
            list_categories: self.list_categories,
            ..ToolOptions::default()
        };
        if let Some(mode) = self.record_mode.as_deref() {
            options.record_mode = mode
                .parse::<RecordMode>()
                .map_err(|e| UsageError::InvalidOption(e.to_string()))?;
        }
        if let Some(list) = self.categories.as_deref() {
            options = options.with_categories(list);
        }

        Ok(Invocation {
            command,
            spec: ToolSpec::with_options(kind, options),
            on_demand: self.ondemand,
            output,
        })
    }
}

/// A single quoted word such as `"npm run test"` is split shell style.
fn target_command(words: &[String]) -> Result<TargetCommand, UsageError> {
    let parsed = match words {
        [] => return Err(UsageError::MissingCommand),
        [line] if line.contains(char::is_whitespace) => TargetCommand::parse(line),
        _ => TargetCommand::from_args(words.iter().cloned()),
    };
    parsed.map_err(|e| match e {
        CommandError::Empty => UsageError::MissingCommand,
        other => UsageError::InvalidOption(other.to_string()),
    })
}

//! The target command line.

use std::{
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    process::Stdio,
};

use thiserror::Error;
use tokio::process::Command;

/// Flag appended to `NODE_OPTIONS`: pause on start, OS-assigned port.
pub const INSPECT_FLAG: &str = "--inspect-brk=0";

/// Command error.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Command is empty")]
    Empty,
    #[error("Command cannot be parsed: {0}")]
    InvalidCommand(String),
    #[error("Executable not found: {0}")]
    NotFound(String),
    #[error("Failed to quote command: {0}")]
    Quote(#[from] shlex::QuoteError),
}

/// Program and arguments of the process to profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl TargetCommand {
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from an argv-style list; the first element is the program.
    ///
    /// # Errors
    /// Returns error if the list is empty.
    pub fn from_args<I>(argv: I) -> Result<Self, CommandError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut parts = argv.into_iter().map(Into::into);
        let program = parts.next().ok_or(CommandError::Empty)?;
        if program.trim().is_empty() {
            return Err(CommandError::Empty);
        }
        Ok(Self::new(program, parts.collect()))
    }

    /// Split a shell-style command line.
    ///
    /// # Errors
    /// Returns error if quoting is unbalanced or nothing remains.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let parts =
            shlex::split(line).ok_or_else(|| CommandError::InvalidCommand(line.to_string()))?;
        Self::from_args(parts)
    }

    /// Quoted form for logs.
    ///
    /// # Errors
    /// Returns error if an argument cannot be quoted.
    pub fn display(&self) -> Result<String, CommandError> {
        let words = std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str));
        Ok(shlex::try_join(words)?)
    }

    /// Locate the program on `PATH`.
    ///
    /// # Errors
    /// Returns error if the executable cannot be found.
    pub async fn resolve(&self) -> Result<PathBuf, CommandError> {
        resolve_executable_path(&self.program)
            .await
            .ok_or_else(|| CommandError::NotFound(self.program.clone()))
    }

    /// The spawnable command: debugging flag injected, stdio wired.
    #[must_use]
    pub fn to_command(&self, executable: &Path) -> Command {
        let mut command = Command::new(executable);
        command
            .args(&self.args)
            .env(
                "NODE_OPTIONS",
                node_options(std::env::var_os("NODE_OPTIONS").as_deref()),
            )
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

/// `NODE_OPTIONS` with [`INSPECT_FLAG`] appended.
#[must_use]
pub fn node_options(existing: Option<&OsStr>) -> OsString {
    let mut options = existing.map(OsStr::to_os_string).unwrap_or_default();
    options.push(" ");
    options.push(INSPECT_FLAG);
    options
}

/// Resolve an executable name to a path.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() && path.is_file() {
        return Some(path.to_path_buf());
    }

    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()?
        .ok()
}

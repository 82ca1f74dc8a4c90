//! Target process orchestration.
//!
//! Provides:
//! - `TargetCommand` - the command line to profile
//! - Diagnostic stream scanning (endpoint discovery, noise filtering)
//! - The on-demand trigger hook
//! - `Runner` - spawn, attach, drive the session, tear down

pub mod command;
pub mod diagnostics;
pub mod hook;
pub mod runner;
mod worker;

pub use command::{CommandError, TargetCommand};
pub use hook::{HOOK_SCRIPT, Trigger, TriggerCall};
pub use runner::{RunOutcome, Runner, RunnerConfig, RunnerError, SessionContext, drive};

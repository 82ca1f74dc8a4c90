//! Profiling tools and session orchestration.
//!
//! Provides:
//! - `Tool` - begin/end command sequence of one profiling kind
//! - `ToolSession` - reference-counted wrapper allocating report ids

pub mod session;
pub mod tool;

pub use session::{SessionError, ToolSession};
pub use tool::{Tool, ToolError};

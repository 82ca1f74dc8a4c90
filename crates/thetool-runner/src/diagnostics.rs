//! Target diagnostic stream scanning.

use std::sync::LazyLock;

use regex::Regex;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::oneshot,
};

static LISTENING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Debugger listening on (ws://.*)$").expect("constant regex pattern is valid")
});

/// Informational inspector lines that are never forwarded.
pub const BLACKLIST: [&str; 4] = [
    "Waiting for the debugger to disconnect...",
    "For help, see: https://nodejs.org/en/docs/inspector",
    "For help see: https://nodejs.org/en/docs/inspector",
    "Debugger attached.",
];

/// Endpoint URL announced by `line`, if it is the listening line.
#[must_use]
pub fn endpoint_in(line: &str) -> Option<&str> {
    LISTENING_RE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

#[must_use]
pub fn is_blacklisted(line: &str) -> bool {
    BLACKLIST.contains(&line)
}

/// Read `input` line by line until it closes.
///
/// The first listening line is reported through `endpoint` and swallowed,
/// as are blacklisted lines. Everything else is copied to `output`.
///
/// # Errors
/// Returns error if reading or forwarding fails.
pub async fn scan_diagnostics<R, W>(
    input: R,
    mut output: W,
    endpoint: oneshot::Sender<String>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut endpoint = Some(endpoint);
    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(url) = endpoint_in(&line) {
            match endpoint.take() {
                Some(tx) => {
                    tracing::info!(endpoint = url, "debugging endpoint detected");
                    let _ = tx.send(url.to_string());
                }
                None => tracing::debug!(endpoint = url, "additional listening line"),
            }
            continue;
        }
        if is_blacklisted(&line) {
            tracing::trace!(line, "swallowed inspector notice");
            continue;
        }
        output.write_all(line.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }
    tracing::debug!("diagnostic stream closed");
    Ok(())
}

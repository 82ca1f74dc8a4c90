//! Report files on disk.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use thetool_core::{ReportEvent, ReportId, ReportSink};
use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt, BufWriter},
    sync::mpsc,
    task::JoinHandle,
};

const GREEN: &str = "\x1b[32m";
const RESET: &str = "\x1b[0m";

#[derive(Debug)]
enum Command {
    Attached(u16),
    Event(ReportEvent),
    Shutdown,
}

/// Report sink writing one file per report.
///
/// Files are named `<port>_<id>_<unix-millis>.<extension>` inside the output
/// folder. All writes happen on a single background task, in event order.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    tx: mpsc::UnboundedSender<Command>,
}

/// What the writer task produced.
#[derive(Debug)]
pub struct Written<W> {
    /// Files of finished reports, in finish order.
    pub files: Vec<PathBuf>,
    pub console: W,
}

struct OpenReport {
    path: PathBuf,
    hint: String,
    file: BufWriter<File>,
}

impl ReportWriter {
    /// Start the writer task. Completion notices go to `console`.
    pub fn spawn<W>(output: PathBuf, console: W) -> (Self, JoinHandle<std::io::Result<Written<W>>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(write_reports(output, rx, console));
        (Self { tx }, task)
    }

    /// Stop the task once queued events are written.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

impl ReportSink for ReportWriter {
    fn on_event(&self, event: ReportEvent) {
        if self.tx.send(Command::Event(event)).is_err() {
            tracing::warn!("report writer stopped, dropping event");
        }
    }

    fn attached(&self, port: u16) {
        let _ = self.tx.send(Command::Attached(port));
    }
}

/// `<port>_<id>_<unix-millis>.<extension>`
#[must_use]
pub fn report_file_name(port: u16, id: ReportId, millis: u128, extension: &str) -> String {
    format!("{port}_{id}_{millis}.{extension}")
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

async fn open_report(output: &Path, port: u16, id: ReportId, extension: &str) -> std::io::Result<(PathBuf, File)> {
    let path = output.join(report_file_name(port, id, unix_millis(), extension));
    let file = File::create(&path).await?;
    Ok((path, file))
}

async fn write_reports<W>(
    output: PathBuf,
    mut rx: mpsc::UnboundedReceiver<Command>,
    mut console: W,
) -> std::io::Result<Written<W>>
where
    W: AsyncWrite + Unpin,
{
    let mut port = 0;
    let mut open: HashMap<ReportId, OpenReport> = HashMap::new();
    let mut files = Vec::new();

    while let Some(command) = rx.recv().await {
        match command {
            Command::Attached(p) => port = p,
            Command::Event(ReportEvent::ReportStart {
                id,
                suggested_file_extension,
                user_hint,
            }) => {
                let (path, file) = open_report(&output, port, id, &suggested_file_extension).await?;
                tracing::info!(report_id = %id, path = %path.display(), "report started");
                open.insert(
                    id,
                    OpenReport {
                        path,
                        hint: user_hint,
                        file: BufWriter::new(file),
                    },
                );
            }
            Command::Event(ReportEvent::ReportChunk { id, chunk }) => match open.get_mut(&id) {
                Some(report) => report.file.write_all(chunk.as_bytes()).await?,
                None => tracing::warn!(report_id = %id, "chunk for unknown report"),
            },
            Command::Event(ReportEvent::ReportFinish { id }) => {
                let Some(mut report) = open.remove(&id) else {
                    tracing::warn!(report_id = %id, "finish for unknown report");
                    continue;
                };
                report.file.flush().await?;
                tracing::info!(report_id = %id, path = %report.path.display(), "report finished");
                let notice = format!(
                    "{GREEN}thetool> Report captured in {}{RESET}\n{GREEN}thetool> {}{RESET}\n",
                    report.path.display(),
                    report.hint
                );
                console.write_all(notice.as_bytes()).await?;
                console.flush().await?;
                files.push(report.path);
            }
            Command::Shutdown => break,
        }
    }

    for (id, mut report) in open {
        report.file.flush().await?;
        tracing::warn!(report_id = %id, path = %report.path.display(), "report was not finished");
    }
    Ok(Written { files, console })
}

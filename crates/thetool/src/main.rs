//! thetool - profile Node.js processes through the inspector protocol.

mod args;
mod writer;

use std::{process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::{CommandFactory, Parser, error::ErrorKind};
use thetool_core::ReportSink;
use thetool_runner::{Runner, RunnerConfig};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    args::{Args, Invocation},
    writer::{ReportWriter, Written},
};

/// Exit code for argument errors (-1 as an unsigned byte).
const EXIT_USAGE: u8 = 255;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let invocation = match args.validate() {
        Ok(invocation) => invocation,
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!("{}", Args::command().render_help());
            return ExitCode::from(EXIT_USAGE);
        }
    };

    match run(invocation).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(invocation: Invocation) -> anyhow::Result<()> {
    let (writer, written) = ReportWriter::spawn(invocation.output.clone(), tokio::io::stdout());
    let sink: Arc<dyn ReportSink> = Arc::new(writer.clone());
    let runner = Runner::new(
        RunnerConfig {
            command: invocation.command,
            spec: invocation.spec,
            on_demand: invocation.on_demand,
        },
        sink,
    );

    let outcome = runner.run().await;
    drop(runner);
    writer.shutdown();
    let written = written.await.context("report writer panicked")?;

    let outcome = outcome.context("profiling session failed")?;
    let Written { files, mut console } = written.context("failed to write report")?;
    console.flush().await?;
    tracing::info!(
        status = %outcome.status,
        endpoint = ?outcome.endpoint.map(|e| e.to_string()),
        reports = files.len(),
        "done"
    );
    Ok(())
}

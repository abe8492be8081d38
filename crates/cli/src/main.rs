//! `gearman-submit` entry point.
//!
//! This binary is the composition root for the workspace. Responsibilities:
//!
//! 1. **Parse configuration**: either repeated `--server` flags or a JSON
//!    [`ClientConfig`] file given with `--config`.
//! 2. **Wire observability**: install `tracing-subscriber` (text or JSON) and,
//!    when `OTEL_EXPORTER_OTLP_ENDPOINT` is set, an OpenTelemetry OTLP exporter.
//!    All spans and events emitted by the `client` and `protocol` crates flow
//!    through it.
//! 3. **Submit one job** and report on it:
//!    - foreground: stream warnings and progress to stderr, write data chunks
//!      and the final result to stdout;
//!    - background: print the handle, and with `--poll` one status snapshot,
//!      as JSON.
//!
//! The client is always ended before exit, whatever the outcome.

mod observability;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use client::{Client, SubmittedJob};
use protocol::{ClientConfig, JobEvent, JobSpec, Priority, ServerAddress, StatusSnapshot};
use serde::Serialize;
use tracing::{info, warn};

const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Submit one job to a Gearman job server.
#[derive(Debug, Parser)]
#[command(name = "gearman-submit", version, about)]
struct Args {
    /// Job server as HOST[:PORT]; repeat for several servers.
    #[arg(long = "server", short = 's', value_name = "HOST:PORT")]
    servers: Vec<ServerAddress>,

    /// JSON client configuration file.
    #[arg(long, value_name = "FILE", conflicts_with = "servers")]
    config: Option<PathBuf>,

    /// Registered function name to run.
    #[arg(long, short = 'f')]
    function: String,

    /// Submit as a background job and return once it is queued.
    #[arg(long)]
    background: bool,

    #[arg(long, default_value_t = Priority::Normal)]
    priority: Priority,

    /// Unique id; the server coalesces submissions sharing one.
    #[arg(long)]
    unique: Option<String>,

    /// Request one status snapshot after queueing a background job.
    #[arg(long, requires = "background")]
    poll: bool,

    /// Emit logs as JSON lines.
    #[arg(long, env = "GEARMAN_JSON_LOGS")]
    json_logs: bool,

    /// Job payload.
    payload: String,
}

#[derive(Debug, Serialize)]
struct BackgroundReport {
    handle: String,
    session: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<StatusSnapshot>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let telemetry = observability::init(args.json_logs)?;
    let result = run(&args).await;
    telemetry.shutdown();
    result
}

async fn run(args: &Args) -> Result<()> {
    let config = load_config(args)?;
    let client = Client::new(config).context("invalid job server configuration")?;
    info!(client_id = %client.id(), sessions = client.sessions().len(), "Client ready");

    let outcome = submit(&client, args).await;
    client.end().await;
    outcome
}

fn load_config(args: &Args) -> Result<ClientConfig> {
    if let Some(path) = &args.config {
        return read_config(path);
    }
    if args.servers.is_empty() {
        Ok(ClientConfig::default())
    } else {
        Ok(ClientConfig::with_servers(args.servers.clone()))
    }
}

fn read_config(path: &Path) -> Result<ClientConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    ClientConfig::from_json_str(&text).with_context(|| format!("invalid config {}", path.display()))
}

fn job_spec(args: &Args) -> JobSpec {
    let mut spec =
        JobSpec::new(args.function.as_str(), args.payload.as_bytes()).with_priority(args.priority);
    if let Some(unique) = &args.unique {
        spec = spec.with_unique(unique.as_str());
    }
    if args.background {
        spec = spec.background();
    }
    spec
}

async fn submit(client: &Client, args: &Args) -> Result<()> {
    let submitted = client
        .submit_job(job_spec(args))
        .await
        .with_context(|| format!("failed to submit {}", args.function))?;
    info!(handle = %submitted.handle(), "Job accepted");

    if args.background {
        report_background(client, submitted, args.poll).await
    } else {
        follow_foreground(submitted).await
    }
}

async fn report_background(client: &Client, mut submitted: SubmittedJob, poll: bool) -> Result<()> {
    let status = if poll {
        client
            .get_status(submitted.job())
            .await
            .context("status request failed")?;
        tokio::time::timeout(POLL_TIMEOUT, next_status(&mut submitted))
            .await
            .context("timed out waiting for job status")??
    } else {
        None
    };

    let report = BackgroundReport {
        handle: submitted.handle().to_string(),
        session: submitted.job().session().map(|s| s.to_string()),
        status,
    };
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

async fn next_status(submitted: &mut SubmittedJob) -> Result<Option<StatusSnapshot>> {
    while let Some(event) = submitted.next_event().await {
        match event {
            JobEvent::Status(status) => return Ok(Some(status)),
            JobEvent::Failed(failure) => bail!("job failed: {failure}"),
            JobEvent::Closed => break,
            _ => {}
        }
    }
    Ok(None)
}

async fn follow_foreground(mut submitted: SubmittedJob) -> Result<()> {
    let mut stdout = std::io::stdout();
    // Bytes already written from WORK_DATA; the final result repeats them.
    let mut streamed = 0;
    while let Some(event) = submitted.next_event().await {
        match event {
            JobEvent::Progress(progress) => eprintln!("progress: {progress}"),
            JobEvent::Warning(message) => {
                warn!(handle = %submitted.handle(), "Worker warning");
                eprintln!("warning: {}", String::from_utf8_lossy(&message));
            }
            JobEvent::Data(chunk) => {
                stdout.write_all(&chunk)?;
                streamed += chunk.len();
            }
            JobEvent::Complete(result) => {
                stdout.write_all(result.get(streamed..).unwrap_or_default())?;
                stdout.flush()?;
                return Ok(());
            }
            JobEvent::Failed(failure) => bail!("job {} failed: {failure}", submitted.handle()),
            JobEvent::Closed => break,
            JobEvent::Created { .. } | JobEvent::Status(_) => {}
        }
    }
    bail!("job {} ended without a result", submitted.handle())
}

//! dropq CLI: run the ingestor and worker, inspect the queue.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dropq::config::Config;
use dropq::engine::{Ingestor, IngestorConfig, Shutdown, Worker, WorkerConfig};
use dropq::event::DirectoryWatcher;
use dropq::model::{TaskId, format_timestamp};
use dropq::store::QueueStore;
use dropq::telemetry::{SERVICE_NAME, TelemetryConfig, TelemetryGuard, init_telemetry};
use dropq::transform::InvertTransform;

#[derive(Parser)]
#[command(name = "dropq", about = "Drop-folder image queue")]
struct Cli {
    /// TOML config file; environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch the source directory and queue arriving images
    Ingest,
    /// Process queued images
    Work,
    /// Run the ingestor and the worker in one process
    Run,
    /// Show task counts per directory
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one task's descriptor
    Show {
        /// Task ID (payload file name without extension)
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Ingest => {
            let _guard = telemetry(&config)?;
            let shutdown = on_ctrl_c();
            run_ingestor(&config, shutdown).await
        }
        Command::Work => {
            let _guard = telemetry(&config)?;
            let shutdown = on_ctrl_c();
            run_worker(&config, shutdown).await
        }
        Command::Run => {
            let _guard = telemetry(&config)?;
            let shutdown = on_ctrl_c();
            let (ingested, worked) = tokio::join!(
                stop_on_error(run_ingestor(&config, shutdown.clone()), &shutdown),
                stop_on_error(run_worker(&config, shutdown.clone()), &shutdown),
            );
            ingested.and(worked)
        }
        Command::Status { json } => cmd_status(&config, json),
        Command::Show { id } => cmd_show(&config, id),
    }
}

fn telemetry(config: &Config) -> anyhow::Result<TelemetryGuard> {
    Ok(init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: SERVICE_NAME.to_string(),
        log_level: config.log_level.clone(),
    })?)
}

fn on_ctrl_c() -> Shutdown {
    let shutdown = Shutdown::new();
    let handle = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("interrupt received, stopping");
        handle.trigger();
    });
    shutdown
}

/// A loop that fails stops its sibling too.
async fn stop_on_error(
    run: impl Future<Output = anyhow::Result<()>>,
    shutdown: &Shutdown,
) -> anyhow::Result<()> {
    let result = run.await;
    if result.is_err() {
        shutdown.trigger();
    }
    result
}

fn store(config: &Config) -> QueueStore {
    QueueStore::new(config.layout.clone()).max_attempts(config.max_attempts)
}

async fn run_ingestor(config: &Config, shutdown: Shutdown) -> anyhow::Result<()> {
    config.layout.ensure()?;
    let (_watcher, events) = DirectoryWatcher::watch(&config.layout.source)?;
    let ingestor = Ingestor::new(
        store(config),
        IngestorConfig {
            extensions: config.extensions.clone(),
            settle_delay: config.settle_delay,
            rescan_interval: config.rescan_interval,
        },
        shutdown,
    );
    ingestor.run(events).await?;
    Ok(())
}

async fn run_worker(config: &Config, shutdown: Shutdown) -> anyhow::Result<()> {
    config.layout.ensure()?;
    let worker = Worker::new(
        store(config),
        InvertTransform::new(&config.layout.output, &config.output_prefix),
        WorkerConfig {
            poll_interval: config.poll_interval,
        },
        shutdown,
    );
    worker.run().await?;
    Ok(())
}

fn cmd_status(config: &Config, json: bool) -> anyhow::Result<()> {
    let counts = store(config).counts()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&counts)?);
        return Ok(());
    }

    let layout = &config.layout;
    println!("{:<12}  {:>6}  DIRECTORY", "STATE", "COUNT");
    println!("{}", "-".repeat(60));
    for (state, count, dir) in [
        ("queued", counts.queued, &layout.queue),
        ("claimed", counts.claimed, &layout.queue),
        ("completed", counts.completed, &layout.archive),
        ("failed", counts.failed, &layout.dead_letter),
        ("quarantined", counts.quarantined, &layout.quarantine),
    ] {
        println!("{state:<12}  {count:>6}  {}", dir.display());
    }
    Ok(())
}

fn cmd_show(config: &Config, id: String) -> anyhow::Result<()> {
    let id = TaskId::new(id);
    let Some((location, desc)) = store(config).find(&id)? else {
        anyhow::bail!("no task '{id}' in queue, archive or dead-letter directory");
    };

    println!("ID:         {}", desc.id);
    println!("Location:   {location}");
    println!("Status:     {}", desc.status);
    println!("Payload:    {}", desc.archived_payload_name());
    println!("Queued:     {} ({})", desc.queued_at, format_timestamp(desc.queued_at));
    if let Some(at) = desc.terminal_at {
        println!("Finished:   {at}");
    }
    if let Some(ref output) = desc.output_name {
        println!("Output:     {output}");
    }
    println!("Attempts:   {}", desc.attempts);
    if let Some(ref err) = desc.last_error {
        println!("Last Error: {err}");
    }
    if let Some(ref reason) = desc.reason {
        println!("Reason:     {reason}");
    }
    Ok(())
}

//! workrelay CLI: host bridge and operator interface.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};
use workrelay::config::{Config, RelaySettings};
use workrelay::db::Db;
use workrelay::host::Dispatcher;
use workrelay::job::{JobId, JobRequest, Payload};
use workrelay::processor::{ProcessorConfig, ProcessorQueue};
use workrelay::telemetry::{TelemetryConfig, init_telemetry};
use workrelay::transport::{FsBlobStore, PgmqTransport, PgmqTransportConfig};

#[derive(Parser)]
#[command(name = "workrelay", about = "Offload jobs to remote workers")]
struct Cli {
    /// TOML file with relay settings (env vars still override)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bridge host messages on stdin to workers, replies on stdout
    Serve,
    /// Submit one job and wait for its result
    Submit {
        /// Processor that runs the job
        processor: String,
        /// Input file
        #[arg(long)]
        file: Option<PathBuf>,
        /// JSON arguments
        #[arg(long)]
        args: Option<String>,
        /// Job ID (random if omitted)
        #[arg(long)]
        id: Option<String>,
    },
    /// Check database connectivity
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = match cli.config {
        Some(ref path) => RelaySettings::from_toml_file(path)?,
        None => RelaySettings::default(),
    };
    let config = Config::from_env_with(settings)?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "workrelay".to_string(),
        default_level: config.log_level.clone(),
    })?;

    let db = Db::connect(config.database_url.expose_secret()).await?;

    let outcome = match cli.command {
        Command::Serve => cmd_serve(&db, &config.relay).await,
        Command::Submit {
            processor,
            file,
            args,
            id,
        } => cmd_submit(&db, &config.relay, processor, file, args, id).await,
        Command::Health => {
            db.health_check().await?;
            println!("ok");
            Ok(())
        }
    };
    db.close().await;
    outcome
}

/// Connect a processor queue to its pgmq queues. Jobs carry the transport's
/// run-scoped reply topic so workers answer on this run's result queue.
async fn start_processor(
    db: &Db,
    relay: &RelaySettings,
    name: &str,
) -> anyhow::Result<(ProcessorQueue, Arc<PgmqTransport>)> {
    let transport = Arc::new(PgmqTransport::new(
        db.clone(),
        Arc::new(FsBlobStore::new(&relay.blob_dir)),
        PgmqTransportConfig::for_processor(name, relay),
    ));
    transport.initialize().await?;
    let config = ProcessorConfig {
        topic: transport.config().reply_topic.clone(),
        ..ProcessorConfig::from_settings(name, relay)
    };
    let processor = ProcessorQueue::new(transport.clone(), config);
    Ok((processor, transport))
}

async fn cmd_serve(db: &Db, relay: &RelaySettings) -> anyhow::Result<()> {
    if relay.processors.is_empty() {
        anyhow::bail!("no processors configured (set WORKRELAY_PROCESSORS)");
    }

    let mut dispatcher = Dispatcher::new();
    let mut transports = Vec::new();
    for name in &relay.processors {
        let (processor, transport) = start_processor(db, relay, name).await?;
        dispatcher.register(name.clone(), processor);
        transports.push(transport);
    }
    let dispatcher = Arc::new(dispatcher);
    info!(processors = ?relay.processors, "serving host messages on stdin");

    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(256);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = reply_rx.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut jobs = JoinSet::new();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, abandoning outstanding jobs");
                jobs.abort_all();
                break;
            }
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let message: serde_json::Value = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!("skipping unparseable host line: {e}");
                continue;
            }
        };

        let dispatcher = Arc::clone(&dispatcher);
        let reply_tx = reply_tx.clone();
        jobs.spawn(async move {
            if let Some(reply) = dispatcher.handle(message).await {
                match serde_json::to_string(&reply) {
                    Ok(line) => {
                        let _ = reply_tx.send(line).await;
                    }
                    Err(e) => warn!("cannot encode reply: {e}"),
                }
            }
        });
    }

    while jobs.join_next().await.is_some() {}
    drop(reply_tx);
    let written = writer.await;

    for transport in transports {
        transport.shutdown().await;
    }
    written??;
    Ok(())
}

async fn cmd_submit(
    db: &Db,
    relay: &RelaySettings,
    processor_name: String,
    file: Option<PathBuf>,
    args: Option<String>,
    id: Option<String>,
) -> anyhow::Result<()> {
    let args: serde_json::Value = match args {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };
    let id = id.map(JobId::from).unwrap_or_else(JobId::random);
    let payload = match file {
        Some(path) => Payload::File(path),
        None => Payload::Bytes(Vec::new()),
    };

    let (processor, transport) = start_processor(db, relay, &processor_name).await?;
    println!("Submitted: {id} → {processor_name}");

    let outcome = processor
        .process(JobRequest::new(id.clone(), payload).args(args))
        .await;
    transport.shutdown().await;

    let result = outcome?;
    println!("Completed: {id}");
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

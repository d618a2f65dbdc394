use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use seedkeeper_core::config::{config_schema_json, load_config, resolve_config};
use seedkeeper_core::fetch::{is_descriptor_url, DescriptorFetcher};
use seedkeeper_core::{
    human_size, Collaborators, ContentDescriptor, ContentManifest, PersistenceStore,
    SubmitRequest, Supervisor, TransferObserver, TransferOutcome, TransferPhase, TransferStatus,
};
use seedkeeper_engine::MagnetLink;
use seedkeeper_mock_engine::{SimulatedSession, SimulationConfig};

#[derive(Parser)]
#[command(name = "seedkeeper", version, about = "Seedkeeper transfer supervisor utilities")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a descriptor file, link or magnet and check it against policy
    Inspect(InspectArgs),
    /// Print the persisted active-transfer file
    State(StateArgs),
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
    /// Run a supervisor over the simulated engine, driven by commands on stdin
    Simulate(SimulateArgs),
}

#[derive(Args, Clone)]
struct ConfigArgs {
    /// Config file (defaults to SEEDKEEPER_CONFIG, then built-in defaults)
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct InspectArgs {
    /// Path to a descriptor file, an http(s) link to one, or a magnet URI
    input: String,
    #[command(flatten)]
    cfg: ConfigArgs,
}

#[derive(Args)]
struct StateArgs {
    #[command(flatten)]
    cfg: ConfigArgs,
    /// Print raw JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum ConfigCmd {
    /// Print the JSON schema of the config file
    Schema,
    /// Validate a config file
    Check { path: PathBuf },
}

#[derive(Args)]
struct SimulateArgs {
    #[command(flatten)]
    cfg: ConfigArgs,
    /// Bytes the simulated engine moves per status poll
    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    bytes_per_poll: u64,
    /// Status polls before a magnet's metadata appears
    #[arg(long, default_value_t = 3)]
    metadata_polls: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Inspect(args) => cmd_inspect(args).await,
        Commands::State(args) => cmd_state(args).await,
        Commands::Config { cmd } => cmd_config(cmd),
        Commands::Simulate(args) => cmd_simulate(args).await,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer().with_writer(std::io::stderr);
    let _ = tracing_subscriber::registry()
        .with(fmt_layer.with_filter(filter))
        .try_init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable; listening for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}

async fn cmd_inspect(args: InspectArgs) -> Result<()> {
    let cfg = resolve_config(args.cfg.config.as_deref())?;
    let input = args.input.trim();
    if MagnetLink::is_magnet(input) {
        let link = MagnetLink::parse(input)?;
        println!("magnet   {}", link.info_hash);
        if let Some(name) = &link.display_name {
            println!("name     {name}");
        }
        for tracker in &link.trackers {
            println!("tracker  {tracker}");
        }
        println!("file list is only known once peers deliver the metadata");
        return Ok(());
    }

    let bytes = if is_descriptor_url(input) {
        let spool = tempfile::tempdir().context("creating spool dir")?;
        let fetcher = DescriptorFetcher::new(&cfg.fetch, spool.path())?;
        fetcher.fetch(input, "inspect").await?.bytes
    } else {
        std::fs::read(input).with_context(|| format!("reading {input}"))?
    };

    let limit = cfg.policy.max_total_bytes;
    let supervisor = Supervisor::new(
        cfg,
        Arc::new(SimulatedSession::default()),
        Arc::new(seedkeeper_core::LoggingObserver),
        Collaborators::default(),
    )?;
    let (manifest, verdict) = supervisor.inspect(&ContentDescriptor::direct(bytes)).await?;
    print_manifest(&manifest);
    println!("limit    {}", human_size(limit));
    match verdict {
        None => {
            println!("verdict  accepted");
            Ok(())
        }
        Some(rejection) => bail!("rejected: {rejection}"),
    }
}

fn print_manifest(manifest: &ContentManifest) {
    println!("name     {}", manifest.display_name);
    println!("digest   {}", manifest.digest);
    println!("total    {}", human_size(manifest.total_size));
    for entry in &manifest.entries {
        println!("  {:>10}  {}", human_size(entry.size), entry.path);
    }
}

async fn cmd_state(args: StateArgs) -> Result<()> {
    let cfg = resolve_config(args.cfg.config.as_deref())?;
    let store = PersistenceStore::new(cfg.paths.persistence_path());
    let records = store.load().await;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("no active transfers in {}", store.path().display());
        return Ok(());
    }
    for (id, record) in &records {
        println!(
            "{id}\t{}\t{}\t{}\t{}",
            record.status.as_str(),
            record.descriptor.kind(),
            record.display_name,
            record.destination.display()
        );
    }
    Ok(())
}

fn cmd_config(cmd: ConfigCmd) -> Result<()> {
    match cmd {
        ConfigCmd::Schema => {
            println!("{}", serde_json::to_string_pretty(&config_schema_json())?);
        }
        ConfigCmd::Check { path } => {
            let cfg = load_config(&path)?;
            println!(
                "{} ok (state in {}, downloads to {})",
                path.display(),
                cfg.paths.state_dir.display(),
                cfg.paths.download_dir.display()
            );
        }
    }
    Ok(())
}

struct ConsoleObserver;

#[async_trait]
impl TransferObserver for ConsoleObserver {
    async fn progress(&self, session_id: &str, status: &TransferStatus) {
        println!("[{session_id}] {}", status.line());
    }

    async fn heartbeat(&self, session_id: &str, _phase: TransferPhase, elapsed: Duration) {
        println!("[{session_id}] fetching metadata ({}s)", elapsed.as_secs());
    }

    async fn finished(&self, session_id: &str, outcome: &TransferOutcome) {
        println!("[{session_id}] {outcome}");
    }
}

async fn cmd_simulate(args: SimulateArgs) -> Result<()> {
    let cfg = resolve_config(args.cfg.config.as_deref())?;
    let engine = Arc::new(SimulatedSession::new(SimulationConfig {
        bytes_per_poll: args.bytes_per_poll,
        metadata_polls: args.metadata_polls,
        ..SimulationConfig::default()
    }));
    let collaborators = Collaborators::from_config(&cfg.library);
    let supervisor = Arc::new(Supervisor::new(
        cfg,
        engine.clone(),
        Arc::new(ConsoleObserver),
        collaborators,
    )?);
    let resumed = supervisor.resume_persisted().await;
    if resumed > 0 {
        info!(resumed, "resumed persisted transfers");
    }
    println!("commands: seed <name> <bytes> | submit <session> <magnet|url|path> | cancel <session> | list | stall on|off | quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let signal = shutdown_signal();
    tokio::pin!(signal);
    loop {
        tokio::select! {
            _ = &mut signal => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !run_command(&supervisor, &engine, line.trim()).await {
                    break;
                }
            }
        }
    }
    supervisor.shutdown().await;
    Ok(())
}

/// Returns false when the session should end.
async fn run_command(supervisor: &Arc<Supervisor>, engine: &SimulatedSession, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (None, _, _) => {}
        (Some("quit" | "exit"), _, _) => return false,
        (Some("seed"), Some(name), Some(size)) => match size.parse::<u64>() {
            Ok(size) => println!("{}", engine.seed_content(name, &[(name, size)])),
            Err(_) => println!("size must be a byte count"),
        },
        (Some("submit"), Some(session), Some(input)) => {
            let supervisor = Arc::clone(supervisor);
            let session = session.to_string();
            let input = input.to_string();
            tokio::spawn(async move {
                match submit(&supervisor, &session, &input).await {
                    Ok(manifest) => println!("[{session}] accepted {}", manifest.summary()),
                    Err(err) => println!("[{session}] {err:#}"),
                }
            });
        }
        (Some("cancel"), Some(session), _) => {
            if !supervisor.cancel(session).await {
                println!("[{session}] nothing to cancel");
            }
        }
        (Some("list"), _, _) => {
            for id in supervisor.active_sessions().await {
                if let Some(record) = supervisor.record(&id).await {
                    println!("{id}\t{}\t{}", record.status.as_str(), record.display_name);
                }
            }
        }
        (Some("stall"), Some(mode), _) => engine.set_stalled(mode == "on"),
        _ => println!("unrecognised command: {line}"),
    }
    true
}

async fn submit(supervisor: &Supervisor, session: &str, input: &str) -> Result<ContentManifest> {
    let path = Path::new(input);
    let ticket = if !MagnetLink::is_magnet(input) && !is_descriptor_url(input) && path.is_file() {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        supervisor
            .submit(SubmitRequest::new(session, ContentDescriptor::direct(bytes)))
            .await?
    } else {
        supervisor.submit_input(session, input).await?
    };
    Ok(ticket.manifest)
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use common::Digest;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use steward::alert::SystemClock;
use steward::blobstore::{self, DigestBlobstore};
use steward::bundle::BundleCollection;
use steward::bus::GossipHandler;
use steward::dispatcher::TaskDispatcher;
use steward::platform::{BootMarker, SysinfoVitals};
use steward::settings::{AgentConfig, ConfigSettingsService, FileSpecService, SpecService};
use steward::supervisor::ProcessSupervisor;
use steward::Agent;

#[derive(Debug, Parser)]
#[command(name = "steward")]
#[command(about = "node agent for versioned bundles and supervised jobs", version)]
struct Cli {
    /// Config file (defaults to agent.toml in the data directory)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the agent (default mode when no subcommand specified)
    Agent,
    /// Install, enable and disable bundles on this node
    Bundle {
        #[command(subcommand)]
        command: BundleCommand,
    },
    /// Fetch, store and delete blobs through the configured blobstore
    Blob {
        #[command(subcommand)]
        command: BlobCommand,
    },
}

#[derive(Debug, Subcommand)]
enum BundleCommand {
    /// Create the install directory, optionally unpacking a zip archive into it
    Install {
        name: String,
        version: String,
        #[arg(long)]
        archive: Option<PathBuf>,
    },
    /// Point the bundle's enable link at this version
    Enable { name: String, version: String },
    /// Remove the enable link if it points at this version
    Disable { name: String, version: String },
    /// List installed versions and the enabled one
    List { name: String },
}

#[derive(Debug, Subcommand)]
enum BlobCommand {
    /// Fetch a blob, verify it and copy it to OUT
    Get {
        blob_id: String,
        /// Expected digest, e.g. sha256:<hex>
        #[arg(long)]
        digest: String,
        #[arg(long)]
        out: PathBuf,
    },
    /// Store a file as a new blob and print its id and digests
    Put { path: PathBuf },
    /// Delete a blob from the local tiers and the remote store
    Delete { blob_id: String },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = AgentConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Agent) {
        Commands::Agent => run_agent(config).await,
        Commands::Bundle { command } => bundle_command(&config, command),
        Commands::Blob { command } => blob_command(&config, command).await,
    }
}

async fn run_agent(config: AgentConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
    let agent_id = config.resolved_agent_id();

    let blobstore = blobstore::from_config(&config)?;
    blobstore.validate().await.context("Validating blobstore")?;

    let supervisor = Arc::new(ProcessSupervisor::new(config.jobs.clone(), &config.data_dir));
    let spec_service: Arc<dyn SpecService> = Arc::new(FileSpecService::new(&config.data_dir));
    let dispatcher = Arc::new(TaskDispatcher::new(
        agent_id.clone(),
        BundleCollection::from_config(&config),
        blobstore,
        supervisor.clone(),
        spec_service.clone(),
        &config.data_dir,
    ));
    let handler = Arc::new(
        GossipHandler::new(&config.bus, agent_id.clone(), &config.data_dir).context("Starting message bus")?,
    );
    info!(%agent_id, peer_id=%handler.local_peer_id(), data_dir=%config.data_dir.display(), "Agent configured");

    let agent = Agent::new(
        handler,
        dispatcher,
        supervisor.clone(),
        spec_service,
        Arc::new(SysinfoVitals::new()),
        Arc::new(ConfigSettingsService::new(&config)),
        Arc::new(SystemClock),
        Arc::new(BootMarker::new(&config.data_dir, config.reboot_protection)),
        config.heartbeat_interval(),
    );

    let shutdown = setup_shutdown_handler();
    let result = tokio::select! {
        result = agent.run() => result,
        _ = shutdown => {
            info!("Shutdown signal received, stopping agent gracefully");
            Ok(())
        }
    };
    supervisor.stop();
    result
}

fn bundle_command(config: &AgentConfig, command: BundleCommand) -> anyhow::Result<()> {
    let bundles = BundleCollection::from_config(config);
    match command {
        BundleCommand::Install { name, version, archive } => {
            let bundle = bundles.get(&name, &version)?;
            let path = match archive {
                Some(archive) => bundle.install_with_contents(&archive)?,
                None => bundle.install_without_contents()?,
            };
            println!("installed {name}/{version} at {}", path.display());
        }
        BundleCommand::Enable { name, version } => {
            let bundle = bundles.get(&name, &version)?;
            if let Some(current) = bundles.enabled_version(&name)? {
                if current != version {
                    bundles.get(&name, &current)?.disable()?;
                }
            }
            if bundles.enabled_version(&name)?.as_deref() != Some(version.as_str()) {
                bundle.enable()?;
            }
            println!("enabled {name}/{version} at {}", bundle.enable_path().display());
        }
        BundleCommand::Disable { name, version } => {
            bundles.get(&name, &version)?.disable()?;
            println!("disabled {name}/{version}");
        }
        BundleCommand::List { name } => {
            let enabled = bundles.enabled_version(&name)?;
            for version in bundles.installed_versions(&name)? {
                let marker = if enabled.as_deref() == Some(version.as_str()) { "*" } else { " " };
                println!("{marker} {name}/{version}");
            }
        }
    }
    Ok(())
}

async fn blob_command(config: &AgentConfig, command: BlobCommand) -> anyhow::Result<()> {
    let store = blobstore::from_config(config)?;
    match command {
        BlobCommand::Get { blob_id, digest, out } => {
            let digest: Digest = digest.parse().context("parsing --digest")?;
            let path = store.get(&blob_id, &digest).await?;
            let copied = tokio::fs::copy(&path, &out)
                .await
                .with_context(|| format!("copying blob to {}", out.display()));
            if let Err(e) = store.clean_up(&path).await {
                warn!(error=%format!("{e:#}"), "Failed to clean up fetched blob");
            }
            println!("{blob_id}: {} bytes -> {}", copied?, out.display());
        }
        BlobCommand::Put { path } => {
            let (blob_id, digests) = store.create(&path).await?;
            println!("{blob_id}");
            for d in digests.digests() {
                println!("  {d}");
            }
        }
        BlobCommand::Delete { blob_id } => {
            store.delete(&blob_id).await?;
            println!("deleted {blob_id}");
        }
    }
    Ok(())
}

async fn setup_shutdown_handler() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error=%e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error=%e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

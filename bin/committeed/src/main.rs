//! Data-availability committee node CLI.
//!
//! This binary runs the committee member that:
//! - Polls the operator's availability gateway for new batches
//! - Reconstructs and verifies the batch Merkle state
//! - Persists the state facts for later republication
//! - Signs and submits availability attestations

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use committee::{cursor_key, root_record_key, BatchRoots, Committee, CommitteeConfig};
use gateway::{AvailabilityGateway, AvailabilityGatewayClient, RetryPolicy};
use signer::AttestationSigner;
use state::Profile;
use storage::{MemoryStorage, RetryConfig, RetryingStorage, SledStorage, Storage};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "committeed")]
#[command(about = "Data-availability committee node")]
struct Cli {
    /// JSON configuration file; flags override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Availability gateway base URL
    #[arg(long)]
    endpoint: Option<String>,

    /// Account-state profile: stark_ex or perpetual
    #[arg(long)]
    profile: Option<String>,

    /// Directory for durable local storage; in-memory if omitted
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// File holding the member's hex private key
    #[arg(long)]
    private_key_path: Option<PathBuf>,

    /// Directory with user.crt, user.key and server.crt for mutual TLS
    #[arg(long)]
    certificates_path: Option<PathBuf>,

    /// Seconds between gateway polls
    #[arg(long)]
    polling_interval: Option<f64>,

    /// Height of the account-state tree (profile default if omitted)
    #[arg(long)]
    tree_height: Option<usize>,

    /// Height of the order tree (profile default if omitted)
    #[arg(long)]
    order_tree_height: Option<usize>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the polling and attestation loop
    Run,
    /// Show the local ingestion state
    Status,
    /// Probe the availability gateway
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = build_config(&cli)?;

    match cli.command {
        Commands::Run => match &config.data_dir {
            Some(dir) => {
                let storage = RetryingStorage::new(
                    SledStorage::open(dir).context("opening local storage")?,
                    RetryConfig::default(),
                );
                run_node(config.clone(), Arc::new(storage)).await
            }
            None => run_node(config.clone(), Arc::new(MemoryStorage::new())).await,
        },
        Commands::Status => match &config.data_dir {
            Some(dir) => {
                let storage = SledStorage::open(dir).context("opening local storage")?;
                show_status(&storage, config.profile).await
            }
            None => {
                println!("No data directory configured; nothing ingested locally.");
                Ok(())
            }
        },
        Commands::Check => check_gateway(&config).await,
    }
}

/// Assembles the configuration from the optional file, CLI flags and the
/// environment overrides the deployment images rely on.
fn build_config(cli: &Cli) -> Result<CommitteeConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            serde_json::from_str(&contents).context("parsing config file")?
        }
        None => {
            let profile_name = cli
                .profile
                .as_deref()
                .context("either --config or --profile is required")?;
            let profile = Profile::from_name(profile_name)
                .with_context(|| format!("unknown profile '{profile_name}'"))?;
            let endpoint = cli
                .endpoint
                .clone()
                .context("either --config or --endpoint is required")?;
            CommitteeConfig::for_profile(profile, endpoint)
        }
    };

    if let Some(endpoint) = &cli.endpoint {
        config.availability_gateway_endpoint = endpoint.clone();
    }
    if let Some(name) = &cli.profile {
        config.profile =
            Profile::from_name(name).with_context(|| format!("unknown profile '{name}'"))?;
    }
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    if let Some(path) = &cli.private_key_path {
        config.private_key_path = path.clone();
    }
    if let Some(dir) = &cli.certificates_path {
        config.certificates_path = Some(dir.clone());
    }
    if let Some(interval) = cli.polling_interval {
        config.polling_interval_seconds = interval;
    }
    if let Some(height) = cli.tree_height {
        config.tree_height = Some(height);
    }
    if let Some(height) = cli.order_tree_height {
        config.order_tree_height = Some(height);
    }

    if let Ok(endpoint) = std::env::var("AVAILABILITY_GW_ENDPOINT") {
        config.availability_gateway_endpoint = endpoint;
    }
    if let Ok(path) = std::env::var("PRIVATE_KEY_PATH") {
        config.private_key_path = PathBuf::from(path);
    }
    if let Ok(path) = std::env::var("CERTIFICATES_PATH") {
        config.certificates_path = Some(PathBuf::from(path));
    }

    Ok(config)
}

fn gateway_client(config: &CommitteeConfig) -> Result<AvailabilityGatewayClient> {
    Ok(AvailabilityGatewayClient::new(
        config.availability_gateway_endpoint.clone(),
        config.profile,
        config.request_timeout(),
        config.certificates_path.as_deref(),
        RetryPolicy::default(),
    )?)
}

async fn run_node<S: Storage + 'static>(
    config: CommitteeConfig,
    storage: Arc<S>,
) -> Result<()> {
    let signer = AttestationSigner::from_key_file(&config.private_key_path)
        .context("loading signing key")?;
    info!("Committee member key: {}", signer.member_key());

    let gateway = gateway_client(&config)?;
    let committee = Committee::new(&config, storage, gateway, signer);

    let stop = committee.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested; finishing the current batch");
            stop.stop();
        }
    });

    committee.run().await.context("committee loop failed")?;
    Ok(())
}

async fn show_status<S: Storage>(storage: &S, profile: Profile) -> Result<()> {
    let next_id = match storage.get(&cursor_key()).await? {
        Some(bytes) => String::from_utf8(bytes)?.parse::<i64>()?,
        None => 0,
    };

    println!("Committee node status:");
    println!("  Profile: {}", profile.name());
    println!("  Next batch: {next_id}");

    let last_committed = next_id - 1;
    match storage.get(&root_record_key(last_committed)).await? {
        Some(record) => {
            let roots = BatchRoots::from_record(profile, &record)?;
            println!("  Last committed batch: {last_committed}");
            println!("    {} root: {}", profile.state_tree_name(), hex::encode(roots.state_root));
            println!("    order root: {}", hex::encode(roots.order_root));
        }
        None => println!("  No committed batches."),
    }
    Ok(())
}

async fn check_gateway(config: &CommitteeConfig) -> Result<()> {
    let client = gateway_client(config)?;

    client.is_alive().await.context("gateway liveness probe")?;
    let head = client.get_last_batch_id().await?;

    println!("Gateway {} is alive", config.availability_gateway_endpoint);
    println!("Latest batch id: {head}");
    Ok(())
}

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use bitnun_sim::bots::BotKind;
use bitnun_sim::config::{load_config, ConfigFormat, StoreBackend};
use bitnun_sim::events::{EventKind, NodeEvent};
use bitnun_sim::{Session, SimConfig};
use clap::Parser;
use serde_json::json;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    name = "bitnun-node",
    version,
    about = "Runs one simulated BitnunEco node for a fixed duration and prints its stats"
)]
struct Cli {
    /// Path to a configuration file (TOML or YAML). Built-in sample config when omitted.
    #[arg(long, env = "BITNUN_CONFIG")]
    config: Option<PathBuf>,
    /// Explicit configuration format override.
    #[arg(long, value_enum, default_value_t = ConfigFormat::Auto)]
    config_format: ConfigFormat,
    /// How long to run before shutting down, in seconds.
    #[arg(long, default_value_t = 30)]
    duration_secs: u64,
    /// Override the mining difficulty.
    #[arg(long)]
    difficulty: Option<u32>,
    /// Override the store backend.
    #[arg(long, value_enum)]
    backend: Option<StoreBackend>,
    /// PostgREST project URL (implies the postgrest backend).
    #[arg(long, env = "SUPABASE_URL")]
    store_url: Option<String>,
    #[arg(long, env = "SUPABASE_ANON_KEY", hide_env_values = true)]
    store_key: Option<String>,
    /// Bots to start in addition to the configured ones.
    #[arg(long, value_enum, value_delimiter = ',')]
    bots: Vec<BotKind>,
    /// Do not start the miner even if the config enables it.
    #[arg(long)]
    no_mining: bool,
}

fn apply_overrides(config: &mut SimConfig, cli: &Cli) {
    if let Some(difficulty) = cli.difficulty {
        config.mining.difficulty = difficulty;
    }
    if let Some(backend) = cli.backend {
        config.store.backend = backend;
    }
    if let Some(url) = &cli.store_url {
        config.store.backend = StoreBackend::Postgrest;
        let pg = config.store.postgrest.get_or_insert_with(|| bitnun_sim::store::PostgrestConfig {
            url: String::new(),
            api_key: String::new(),
            request_timeout_ms: 10_000,
        });
        pg.url = url.clone();
        if let Some(key) = &cli.store_key {
            pg.api_key = key.clone();
        }
    }
    for kind in &cli.bots {
        if !config.bots.autostart.contains(kind) {
            config.bots.autostart.push(*kind);
        }
    }
    if cli.no_mining {
        config.mining.auto_start = false;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => load_config(path, cli.config_format)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SimConfig::sample(),
    };
    apply_overrides(&mut config, &cli);

    let session = Session::from_config(config).context("assembling session")?;
    session.events().on(EventKind::SyncError, |event| {
        if let NodeEvent::SyncError { operation, message } = event {
            warn!(%operation, %message, "store sync failed");
        }
    });
    session.start().context("starting session")?;

    let flush_every = Duration::from_millis(session.telemetry().flush_interval().max(1_000));
    let deadline = tokio::time::sleep(Duration::from_secs(cli.duration_secs));
    tokio::pin!(deadline);
    let mut report = tokio::time::interval(flush_every);
    report.tick().await;
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            _ = report.tick() => {
                let stats = session.node().get_network_stats();
                info!(
                    chain_length = stats.chain_length,
                    mempool = stats.mempool_length,
                    balance = stats.balance,
                    blocks_mined = stats.blocks_mined,
                    "progress"
                );
            }
        }
    }

    session.shutdown().await;
    let out = json!({
        "stats": session.node().get_network_stats(),
        "bots": session.bots().get_all_bots(),
        "telemetry": session.telemetry().flush(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

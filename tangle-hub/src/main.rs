//! Tangle Hub CLI
//!
//! Operator front end for a custodial tangle hub.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tangle_hub::{
    config::HubConfig,
    hub::{EngineConfig, HubEngine, WithdrawRequest},
    ledger::JsonRpcLedger,
    output::{create_handler, spawn_forwarder},
    store::MemoryStore,
    types::{AccountId, HubId, ScanKind},
};

#[derive(Parser)]
#[command(name = "tangle-hub")]
#[command(about = "Custodial deposit and withdrawal hub for tangle-based ledgers")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "hub.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new hub
    CreateHub {
        #[arg(long)]
        id: HubId,

        /// Seed the hub derives its deposit addresses from
        #[arg(long)]
        seed: String,

        /// Security level (1-3)
        #[arg(long, default_value = "2")]
        security: u8,

        #[arg(long, default_value = "")]
        name: String,
    },

    /// Register a customer account in a hub
    RegisterAccount {
        #[arg(long)]
        hub: HubId,

        #[arg(long, default_value = "")]
        name: String,
    },

    /// Issue a fresh deposit address for an account
    NewAddress {
        #[arg(long)]
        hub: HubId,

        #[arg(long)]
        account: AccountId,
    },

    /// Show a previously issued deposit address
    DepositAddress {
        #[arg(long)]
        hub: HubId,

        #[arg(long)]
        account: AccountId,

        /// Address index (defaults to the latest one)
        #[arg(long)]
        index: Option<u64>,
    },

    /// Show an account with its credit and balance on the tangle
    Account {
        #[arg(long)]
        hub: HubId,

        #[arg(long)]
        account: AccountId,
    },

    /// Credit an account off-chain
    Credit {
        #[arg(long)]
        hub: HubId,

        #[arg(long)]
        account: AccountId,

        #[arg(long)]
        value: u64,
    },

    /// Add fresh addresses to the hot-wallet input pool
    CreateInputs {
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,
    },

    /// Withdraw from an account's credit
    Withdraw {
        #[arg(long)]
        hub: HubId,

        #[arg(long)]
        account: AccountId,

        /// Destination address
        #[arg(long)]
        address: String,

        #[arg(long)]
        value: u64,

        /// Send the remainder here instead of a fresh hot-wallet input
        #[arg(long)]
        remainder_address: Option<String>,
    },

    /// Attach hubs and run deposit scans and confirmation syncs until ctrl-c
    Run {
        /// Hubs to attach
        #[arg(long = "hub", required = true)]
        hubs: Vec<HubId>,

        /// Run one cycle and exit
        #[arg(long)]
        once: bool,
    },

    /// Clear stuck process and sync flags of a hub
    ResetFlags {
        #[arg(long)]
        hub: HubId,
    },

    /// Show pending and failing sweeps and unsettled withdrawals of a hub
    Reconcile {
        #[arg(long)]
        hub: HubId,
    },

    /// Validate configuration file
    ValidateConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let config = match HubConfig::from_file(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            if matches!(cli.command, Commands::ValidateConfig) {
                eprintln!("Configuration validation failed: {}", e);
                std::process::exit(1);
            }
            anyhow::bail!("Failed to load config from {:?}: {}", cli.config, e);
        }
    };

    if let Commands::ValidateConfig = cli.command {
        println!("Configuration is valid.");
        println!("  RPC endpoints: {:?}", config.rpc_endpoints);
        println!("  Hot wallet security: {}", config.hot_wallet_security);
        println!("  State file: {:?}", config.state_file);
        println!("  Output mode: {:?}", config.output_mode);
        println!(
            "  Intervals: scan {}s, sync {}s",
            config.poll_interval_secs, config.sync_interval_secs
        );
        println!("  Limits: {:?}", config.limits);
        return Ok(());
    }

    let engine = open_engine(&config)?;

    match cli.command {
        Commands::CreateHub {
            id,
            seed,
            security,
            name,
        } => {
            let hub = engine.create(id, &seed, security, &name).await?;
            println!("Created hub #{} ({}), security {}", hub.id, hub.name, hub.security);
        }
        Commands::RegisterAccount { hub, name } => {
            print_json(&engine.register_account(hub, &name).await?)?;
        }
        Commands::NewAddress { hub, account } => {
            println!("{}", engine.get_new_deposit_address(hub, account).await?);
        }
        Commands::DepositAddress {
            hub,
            account,
            index,
        } => {
            println!("{}", engine.get_deposit_address(hub, account, index).await?);
        }
        Commands::Account { hub, account } => {
            print_json(&engine.get_account(hub, account).await?)?;
        }
        Commands::Credit {
            hub,
            account,
            value,
        } => {
            let credit = engine.credit(hub, account, value).await?;
            println!("Credit of account #{}: {}", account, credit);
        }
        Commands::CreateInputs { count } => {
            for _ in 0..count {
                let input = engine.create_hot_wallet_input().await?;
                println!("{} {}", input.key_index, input.address);
            }
        }
        Commands::Withdraw {
            hub,
            account,
            address,
            value,
            remainder_address,
        } => {
            engine.attach_by_id(hub).await?;
            let mut request = WithdrawRequest::new(address, value);
            if let Some(remainder) = remainder_address {
                request = request.with_remainder_address(remainder);
            }
            print_json(&engine.withdraw(hub, account, &request).await?)?;
        }
        Commands::Run { hubs, once } => run(engine, &config, &hubs, once).await?,
        Commands::ResetFlags { hub } => {
            engine.reset_process_flag(hub, ScanKind::Unused).await?;
            engine.reset_process_flag(hub, ScanKind::Used).await?;
            engine.reset_sync_flag(hub).await?;
            println!("Flags of hub #{} reset", hub);
        }
        Commands::Reconcile { hub } => {
            let pending = engine.pending_sweeps(hub).await?;
            let failing = engine.failing_sweeps(hub).await?;
            println!("Pending sweeps of hub #{}: {}", hub, pending.len());
            print_json(&pending)?;
            println!("Failing sweeps of hub #{}: {}", hub, failing.len());
            print_json(&failing)?;
            let unsettled = engine.unsettled_withdrawals(hub).await?;
            println!("Unsettled withdrawals of hub #{}: {}", hub, unsettled.len());
            print_json(&unsettled)?;
        }
        Commands::ValidateConfig => {}
    }

    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn open_engine(config: &HubConfig) -> Result<HubEngine> {
    let store = MemoryStore::open(&config.state_file)
        .with_context(|| format!("Failed to open state file {:?}", config.state_file))?;
    let ledger = JsonRpcLedger::new(config.rpc_config())?;
    let engine_config = EngineConfig::try_from(config)?;

    Ok(HubEngine::new(
        Arc::new(store),
        Arc::new(ledger),
        engine_config,
    )?)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(engine: HubEngine, config: &HubConfig, hubs: &[HubId], once: bool) -> Result<()> {
    tracing::info!("Starting tangle hub");

    for &hub in hubs {
        engine.attach_by_id(hub).await?;
    }

    let handler = create_handler(&config.output_mode, config.webhook_url.as_deref())?;
    let forwarder = spawn_forwarder(engine.subscribe(), handler);

    if once {
        scan_cycle(&engine, hubs).await;
        sync_cycle(&engine, hubs).await;
    } else {
        let mut scan_tick = tokio::time::interval(Duration::from_secs(config.poll_interval_secs));
        let mut sync_tick = tokio::time::interval(Duration::from_secs(config.sync_interval_secs));

        loop {
            tokio::select! {
                _ = scan_tick.tick() => scan_cycle(&engine, hubs).await,
                _ = sync_tick.tick() => sync_cycle(&engine, hubs).await,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutting down");
                    break;
                }
            }
        }
    }

    for &hub in hubs {
        if engine.is_not_even_with_db(hub) {
            tracing::error!(
                "Hub #{} has credited sweeps left in its pending list; reconcile before restarting",
                hub
            );
        }
    }

    // Dropping the engine closes the event bus and lets the forwarder drain.
    drop(engine);
    forwarder.await?;
    Ok(())
}

async fn scan_cycle(engine: &HubEngine, hubs: &[HubId]) {
    for &hub in hubs {
        match engine.process(hub).await {
            Ok(report) if !report.is_success() => {
                tracing::warn!("Deposit scan of hub #{} incomplete: {:?}", hub, report)
            }
            Ok(_) => {}
            Err(e) => tracing::error!("Deposit scan of hub #{} failed: {}", hub, e),
        }
        match engine.process_used(hub).await {
            Ok(report) if !report.is_success() => {
                tracing::warn!("Used-address scan of hub #{} incomplete: {:?}", hub, report)
            }
            Ok(_) => {}
            Err(e) => tracing::error!("Used-address scan of hub #{} failed: {}", hub, e),
        }
    }
}

async fn sync_cycle(engine: &HubEngine, hubs: &[HubId]) {
    for &hub in hubs {
        match engine.sync(hub).await {
            Ok(report) if !report.is_success() => {
                tracing::warn!("Sync of hub #{} incomplete: {:?}", hub, report)
            }
            Ok(report) if report.confirmed > 0 => tracing::info!(
                "Hub #{}: {} sweeps confirmed, {} credited",
                hub,
                report.confirmed,
                report.credited
            ),
            Ok(_) => {}
            Err(e) => tracing::error!("Sync of hub #{} failed: {}", hub, e),
        }
    }
}

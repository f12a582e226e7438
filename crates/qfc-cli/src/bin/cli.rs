use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use qfc_core::{units, Amount, ShardId, Transaction, DEFAULT_ASSET};
use qfc_exchange::OrderRequest;
use qfc_state::ShardRouter;
use quantumfuse::{LedgerConfig, OnRamp, PaymentProcessor, ShardedLedger};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "qfc-cli")]
#[command(about = "QuantumFuse ledger CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a local multi-shard simulation and print the final state
    Simulate {
        /// JSON ledger configuration (defaults when omitted)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Mining rounds across all shards
        #[arg(long, default_value_t = 3)]
        rounds: u32,

        #[arg(long, default_value = "miner")]
        miner: String,
    },

    /// Print the default configuration
    Config,

    /// Show which shard an account routes to
    Route {
        account: String,

        #[arg(long, default_value_t = 3)]
        shards: u32,
    },
}

/// Approves every payment; stands in for a real gateway.
struct LocalProcessor;

impl PaymentProcessor for LocalProcessor {
    fn process(&self, user: &str, fiat_amount: Amount, currency: &str) -> Result<(), String> {
        info!(user, %fiat_amount, currency, "payment approved");
        Ok(())
    }
}

fn load_config(path: Option<PathBuf>) -> Result<LedgerConfig> {
    match path {
        Some(path) => LedgerConfig::from_file(&path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(LedgerConfig::default()),
    }
}

async fn simulate(config: LedgerConfig, rounds: u32, miner: String) -> Result<()> {
    let ledger = Arc::new(ShardedLedger::new(config)?);
    let router = ledger.router();
    let last_shard = ShardId(router.num_shards() - 1);

    let alice = router.account_on("alice", ShardId(0))?;
    let bob = router.account_on("bob", last_shard)?;
    let carol = router.account_on("carol", ShardId(0))?;

    ledger.credit(&alice, DEFAULT_ASSET, units(100))?;
    ledger.credit(&bob, "USD", units(500))?;
    let onramp = OnRamp::new(Box::new(LocalProcessor));
    onramp.buy_qfc(&ledger, &carol, units(17), "EUR")?;

    for (to, amount) in [(&bob, 40), (&carol, 10)] {
        let tx = Transaction::new(&alice, to, units(amount), DEFAULT_ASSET)?;
        match ledger.submit_transaction(tx) {
            Ok(outcome) => info!(?outcome, "transfer admitted"),
            Err(err) => warn!(%err, "transfer rejected"),
        }
    }

    ledger.place_order(OrderRequest::sell(&carol, DEFAULT_ASSET, 5, units(10)))?;
    ledger.place_order(OrderRequest::buy(&bob, DEFAULT_ASSET, 5, units(12)))?;
    let trades = ledger.match_orders(DEFAULT_ASSET)?;
    info!(trades = trades.len(), "matched {} book", DEFAULT_ASSET);

    for round in 1..=rounds {
        let worker = Arc::clone(&ledger);
        let who = miner.clone();
        let results = tokio::task::spawn_blocking(move || worker.mine_all(&who)).await?;
        for (shard, result) in results {
            match result {
                Ok(Some(block)) => info!(round, %shard, index = block.index, hash = %block.hash, "mined"),
                Ok(None) => info!(round, %shard, "nothing to mine"),
                Err(err) => error!(round, %shard, %err, "mining failed"),
            }
        }
    }

    let credits = ledger.carbon_balance(&miner);
    if credits > 0 {
        let proceeds = ledger.sell_carbon_credits(&miner, credits / 2)?;
        info!(%proceeds, "sold half of the miner's carbon credits");
        ledger.adjust_carbon_price();
    }

    println!("{}", ledger.snapshot().to_json_pretty()?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate { config, rounds, miner } => {
            let config = load_config(config)?;
            simulate(config, rounds, miner).await?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&LedgerConfig::default())?);
        }
        Commands::Route { account, shards } => {
            let router = ShardRouter::new(shards)?;
            println!("{} -> {}", account, router.route(&account));
        }
    }

    Ok(())
}

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use cfg_if::cfg_if;
use clap::Parser;
use shared::{
    chain::RpcChainClient,
    hash::Keccak,
    journal::FailureLog,
    log::init_log,
    store::WalletStore,
    transaction::TxSender,
    utils::gwei_to_wei,
};
use tokio::signal;
use tracing::*;

use crate::{
    config::{load_config_file, AppConfig},
    miner::{FleetContext, MiningPolicy, Timings},
    orchestrator::Orchestrator,
};

mod config;
mod miner;
mod orchestrator;

cfg_if! {
    if #[cfg(feature = "build-version")] {
        include!(concat!(env!("OUT_DIR"), "/version.rs"));
    } else {
        pub const VERSION: &str = "unknown";
    }
}

#[derive(Parser, Debug)]
#[command(about, version)]
struct Args {
    #[arg(long, value_name = "PATH", help = "Config file", default_value = "./config.json")]
    config: PathBuf,

    #[arg(
        long,
        value_name = "GWEI",
        help = "Priority fee bid for mine transactions, overrides the config"
    )]
    mine_priority_fee: Option<f64>,

    #[arg(
        long,
        value_name = "GWEI",
        help = "Priority fee bid for transfers, overrides the config"
    )]
    transfer_priority_fee: Option<f64>,
}

/// Blocking threads beyond one per wallet, for file io and resolver work.
const BLOCKING_HEADROOM: usize = 16;

// every worker may hold one blocking thread for its nonce search
fn blocking_threads(max_wallets: usize) -> usize {
    max_wallets.saturating_add(BLOCKING_HEADROOM)
}

fn main() -> anyhow::Result<()> {
    init_log();

    info!("VERSION:{}", VERSION);

    let args = Args::parse();

    let cfg = load_config_file(&args.config)?;

    debug!("config: {cfg:?}");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(blocking_threads(cfg.max_wallets))
        .build()?
        .block_on(run(args, cfg))
}

async fn run(args: Args, cfg: AppConfig) -> anyhow::Result<()> {
    let treasury = cfg.treasury()?;
    let store = WalletStore::open(&cfg.wallets_file, cfg.max_wallets)?;
    info!("{} wallets loaded from {}", store.len(), cfg.wallets_file.display());

    let mut fees = cfg.fee_policy();
    for (fee, flag) in [
        (&mut fees.mine_priority_fee, args.mine_priority_fee),
        (&mut fees.transfer_priority_fee, args.transfer_priority_fee),
    ] {
        if let Some(gwei) = flag {
            if !gwei.is_finite() || gwei < 0.0 {
                anyhow::bail!("priority fee must not be negative, got {gwei}");
            }
            *fee = gwei_to_wei(gwei);
        }
    }

    let client = Arc::new(RpcChainClient::new(&cfg.rpc, cfg.contract_address)?);
    let shutdown = Arc::new(AtomicBool::new(false));

    let ctx = Arc::new(FleetContext {
        client: client.clone(),
        sender: TxSender::new(client, cfg.contract_address, cfg.chain_id, fees),
        hasher: Arc::new(Keccak),
        policy: MiningPolicy {
            gas_threshold: cfg.gas_threshold,
            withdrawal_multiplier: cfg.withdrawal_multiplier,
            treasury: cfg.treasury_address,
            fee_collector: cfg.fee_collector,
        },
        timings: Timings::default(),
        journal: FailureLog::new(&cfg.failure_log),
        shutdown: shutdown.clone(),
    });

    tokio::spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            error!("fail to listen for ctrl+c: {err}");
            return;
        }
        info!("ctrl+c received. start shutdown and wait for all miners to stop");
        shutdown.store(true, Ordering::Relaxed);
    });

    let mut orchestrator = Orchestrator::new(ctx, treasury, store);
    match orchestrator.bootstrap().await {
        Ok(created) => info!("bootstrap done, {created} new wallets"),
        Err(err) if err.is_cancelled() => return Ok(()),
        Err(err) => return Err(err.into()),
    }

    if orchestrator.store().is_empty() {
        anyhow::bail!("no funded wallet to mine with");
    }

    // block until every miner observed the shutdown flag
    let handlers = orchestrator.launch().await;
    for res in futures_util::future::join_all(handlers).await {
        if let Err(err) = res {
            error!("{err:?}");
        }
    }

    info!("all miners stopped");
    Ok(())
}

use std::sync::Arc;

use alloy_primitives::U256;
use colored::*;
use shared::{
    chain::ChainClient,
    errors::{MinerError, MinerResult},
    store::{Wallet, WalletStore},
    utils::{amount_wei_to_f64, check_shutdown, pause},
};
use tokio::task::JoinHandle;
use tracing::*;

use crate::miner::{FleetContext, Miner};

/// Bootstrap stops once the treasury holds no more than this many funding units.
const TREASURY_FLOOR_FACTOR: u64 = 2;

enum Funding {
    Funded,
    Reverted,
    TreasuryExhausted,
}

/// Fills the wallet store up to capacity from the treasury, then runs one worker per wallet.
pub struct Orchestrator<C> {
    ctx: Arc<FleetContext<C>>,
    treasury: Wallet,
    store: WalletStore,
}

impl<C: ChainClient + 'static> Orchestrator<C> {
    pub fn new(ctx: Arc<FleetContext<C>>, treasury: Wallet, store: WalletStore) -> Self {
        Self { ctx, treasury, store }
    }

    pub fn store(&self) -> &WalletStore {
        &self.store
    }

    /// Creates and funds wallets one at a time until the store is full or the treasury runs dry.
    ///
    /// A wallet is stored only after its funding confirmed. A wallet whose funding outcome is
    /// unknown (timeout, rpc error) is kept and retried; only a reverted funding discards it.
    /// Returns how many wallets were added.
    pub async fn bootstrap(&mut self) -> MinerResult<usize> {
        let mut created = 0;
        let mut pending: Option<Wallet> = None;
        while !self.store.is_full() {
            check_shutdown(&self.ctx.shutdown)?;

            let wallet = pending.take().unwrap_or_else(Wallet::random);
            let res = match self.fund(&wallet).await {
                Ok(Funding::Funded) => self.store.append(wallet.clone()),
                Ok(Funding::Reverted) => {
                    error!("funding of {} reverted, new wallet next", wallet.address());
                    pause(self.ctx.timings.backoff, &self.ctx.shutdown).await?;
                    continue;
                }
                Ok(Funding::TreasuryExhausted) => {
                    warn!(
                        "{} treasury at or below {} x gas threshold, fleet stays at {} of {}",
                        "WARNING".bold().yellow(),
                        TREASURY_FLOOR_FACTOR,
                        self.store.len(),
                        self.store.capacity()
                    );
                    break;
                }
                Err(err) => Err(err),
            };

            match res {
                Ok(()) => {
                    created += 1;
                    info!(
                        "wallet {} funded and stored ({}/{})",
                        wallet.address(),
                        self.store.len(),
                        self.store.capacity()
                    );
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    error!("setup of wallet {} failed: {err}", wallet.address());
                    pending = Some(wallet);
                    pause(self.ctx.timings.backoff, &self.ctx.shutdown).await?;
                }
            }
        }
        Ok(created)
    }

    async fn fund(&self, wallet: &Wallet) -> MinerResult<Funding> {
        let policy = &self.ctx.policy;

        // an earlier transfer whose receipt never showed up may have landed after all
        if self.ctx.client.get_balance(wallet.address()).await? >= policy.gas_threshold_wei() {
            return Ok(Funding::Funded);
        }

        let balance = self.ctx.client.get_balance(self.treasury.address()).await?;
        let floor = policy.gas_threshold_wei() * U256::from(TREASURY_FLOOR_FACTOR);
        if balance <= floor {
            return Ok(Funding::TreasuryExhausted);
        }

        let receipt = self
            .ctx
            .sender
            .submit_transfer(
                &self.treasury,
                wallet.address(),
                policy.gas_threshold_wei(),
                &self.ctx.shutdown,
            )
            .await
            .inspect_err(|err| journal_transfer_error(&self.ctx, "funding", err))?;

        if receipt.is_reverted() {
            self.ctx.journal.record("funding", "reverted", Some(receipt.tx_hash));
            return Ok(Funding::Reverted);
        }
        Ok(Funding::Funded)
    }

    /// Tops up and spawns a worker for every active wallet, one stagger interval apart.
    ///
    /// Stops spawning once shutdown is requested; already running workers are returned either way.
    pub async fn launch(self) -> Vec<JoinHandle<()>> {
        let mut handlers = vec![];
        for (index, wallet) in self.store.active().iter().enumerate() {
            if check_shutdown(&self.ctx.shutdown).is_err() {
                break;
            }

            if let Err(err) = self.top_up(wallet).await {
                if err.is_cancelled() {
                    break;
                }
                error!("{} >> top-up failed: {err}", wallet.address());
            }

            let miner = Miner::new(index, wallet.clone(), self.ctx.clone());
            handlers.push(tokio::spawn(miner.run()));

            if pause(self.ctx.timings.spawn_stagger, &self.ctx.shutdown).await.is_err() {
                break;
            }
        }
        info!("{} workers launched", handlers.len());
        handlers
    }

    async fn top_up(&self, wallet: &Wallet) -> MinerResult<()> {
        let threshold = self.ctx.policy.gas_threshold_wei();
        let balance = self.ctx.client.get_balance(wallet.address()).await?;
        if balance >= threshold {
            return Ok(());
        }

        info!(
            "{} >> balance {:.6} below gas threshold, topping up",
            wallet.address(),
            amount_wei_to_f64(balance)
        );
        let receipt = self
            .ctx
            .sender
            .submit_transfer(&self.treasury, wallet.address(), threshold, &self.ctx.shutdown)
            .await
            .inspect_err(|err| journal_transfer_error(&self.ctx, "top-up", err))?;

        if receipt.is_reverted() {
            self.ctx.journal.record("top-up", "reverted", Some(receipt.tx_hash));
        }
        Ok(())
    }
}

fn journal_transfer_error<C>(ctx: &FleetContext<C>, kind: &str, err: &MinerError) {
    match err {
        MinerError::Cancelled => {}
        MinerError::ReceiptTimeout(tx_hash, _) => {
            ctx.journal.record(kind, "timeout", Some(*tx_hash))
        }
        _ => ctx.journal.record(kind, "failed", None),
    }
}

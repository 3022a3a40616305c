use std::{
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use alloy_primitives::{Address, U256};
use colored::*;
use shared::{
    chain::ChainClient,
    errors::{MinerError, MinerResult},
    hash::{PowHasher, Work},
    journal::FailureLog,
    search::search_blocking,
    store::Wallet,
    transaction::TxSender,
    types::{MiningParams, PendingSubmission, ELIGIBILITY_WINDOW},
    utils::{
        amount_f64_to_wei,
        amount_wei_to_f64,
        pause,
        withdrawal_amounts,
        withdrawal_threshold,
    },
};
use tracing::*;

/// Accepted submissions a wallet needs before its proceeds are swept.
pub const WITHDRAW_MIN_MINED: u64 = 20;

#[derive(Debug, Clone, Copy)]
pub struct Timings {
    pub eligibility_poll: Duration,
    pub cooldown_poll: Duration,
    pub backoff: Duration,
    pub spawn_stagger: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            eligibility_poll: Duration::from_secs(5),
            cooldown_poll: Duration::from_secs(1),
            backoff: Duration::from_secs(10),
            spawn_stagger: Duration::from_secs(1),
        }
    }
}

/// Funding and sweep settings of the fleet.
#[derive(Debug, Clone, Copy)]
pub struct MiningPolicy {
    /// in whole native units
    pub gas_threshold: f64,
    pub withdrawal_multiplier: f64,
    pub treasury: Address,
    pub fee_collector: Address,
}

impl MiningPolicy {
    pub fn gas_threshold_wei(&self) -> U256 {
        amount_f64_to_wei(self.gas_threshold)
    }
}

/// Everything the orchestrator and the workers share. Read-only once built.
pub struct FleetContext<C> {
    pub client: Arc<C>,
    pub sender: TxSender<C>,
    pub hasher: Arc<dyn PowHasher>,
    pub policy: MiningPolicy,
    pub timings: Timings,
    pub journal: FailureLog,
    pub shutdown: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Copy)]
enum MiningStep {
    FetchParams,
    WaitEligible(MiningParams),
    Search(MiningParams),
    Submit(PendingSubmission),
    Cooldown { params: MiningParams, since: u64 },
    MaybeWithdraw(MiningParams),
    Backoff,
}

/// Drives one wallet through fetch, wait, search, submit, cooldown and withdraw until shutdown.
pub struct Miner<C> {
    tag: String,
    wallet: Wallet,
    ctx: Arc<FleetContext<C>>,
    step: MiningStep,
}

impl<C: ChainClient + 'static> Miner<C> {
    pub fn new(index: usize, wallet: Wallet, ctx: Arc<FleetContext<C>>) -> Self {
        let tag = format!("#{index} {}", wallet.address());
        Self { tag, wallet, ctx, step: MiningStep::FetchParams }
    }

    /// Never returns on its own; errors end the cycle in a backoff, shutdown ends the loop.
    pub async fn run(mut self) {
        info!("{} >> start mining", self.tag);
        loop {
            let next = match self.step {
                MiningStep::FetchParams => self.fetch_params().await,
                MiningStep::WaitEligible(params) => self.wait_eligible(params).await,
                MiningStep::Search(params) => self.search(params).await,
                MiningStep::Submit(pending) => self.submit(pending).await,
                MiningStep::Cooldown { params, since } => self.cooldown(params, since).await,
                MiningStep::MaybeWithdraw(params) => self.maybe_withdraw(params).await,
                MiningStep::Backoff => {
                    pause(self.ctx.timings.backoff, &self.ctx.shutdown)
                        .await
                        .map(|_| MiningStep::FetchParams)
                }
            };

            self.step = match next {
                Ok(step) => step,
                Err(err) if err.is_cancelled() => break,
                Err(err) => {
                    error!("{} >> {err}, retry in {:?}", self.tag, self.ctx.timings.backoff);
                    MiningStep::Backoff
                }
            };
        }
        info!("{} >> stopped", self.tag);
    }

    async fn fetch_params(&self) -> MinerResult<MiningStep> {
        let address = self.wallet.address();
        let params = MiningParams::from(self.ctx.client.call_miner_params(address).await?);
        let balance = self.ctx.client.get_balance(address).await?;

        info!(
            "{} >> difficulty: {:#x}, total mined: {}, balance: {:.6}",
            self.tag,
            params.current_difficulty,
            params.total_mined,
            amount_wei_to_f64(balance)
        );
        Ok(MiningStep::WaitEligible(params))
    }

    async fn wait_eligible(&self, params: MiningParams) -> MinerResult<MiningStep> {
        loop {
            let height = self.ctx.client.get_block_number().await?;
            if params.is_eligible(height) {
                return Ok(MiningStep::Search(params));
            }
            debug!(
                "{} >> height {height}, {} blocks until eligible",
                self.tag,
                params.blocks_until_eligible(height)
            );
            pause(self.ctx.timings.eligibility_poll, &self.ctx.shutdown).await?;
        }
    }

    async fn search(&self, params: MiningParams) -> MinerResult<MiningStep> {
        let work = Work::new(self.wallet.address(), &params);
        let solution =
            search_blocking(self.ctx.hasher.clone(), work, self.ctx.shutdown.clone()).await?;

        info!("{} >> nonce found after {} attempts", self.tag, solution.attempts);
        Ok(MiningStep::Submit(PendingSubmission { solution, params }))
    }

    async fn submit(&self, pending: PendingSubmission) -> MinerResult<MiningStep> {
        let result = self.ctx.sender.submit_mine(&self.wallet, &pending, &self.ctx.shutdown).await;
        let receipt = match result {
            Ok(receipt) => receipt,
            Err(err) => {
                self.journal_failure("mine", &err);
                return Err(err);
            }
        };

        if receipt.is_reverted() {
            self.ctx.journal.record("mine", "reverted", Some(receipt.tx_hash));
        }

        let since = self.ctx.client.get_block_number().await?;
        info!(
            "{} >> mine {} in block {}, cooldown from {since}",
            self.tag,
            receipt.status,
            receipt.block_number.map(|b| b.to_string()).unwrap_or_else(|| "?".into())
        );
        Ok(MiningStep::Cooldown { params: pending.params, since })
    }

    async fn cooldown(&self, params: MiningParams, since: u64) -> MinerResult<MiningStep> {
        loop {
            let height = self.ctx.client.get_block_number().await?;
            if height.saturating_sub(since) >= ELIGIBILITY_WINDOW {
                return Ok(MiningStep::MaybeWithdraw(params));
            }
            pause(self.ctx.timings.cooldown_poll, &self.ctx.shutdown).await?;
        }
    }

    async fn maybe_withdraw(&self, params: MiningParams) -> MinerResult<MiningStep> {
        let policy = &self.ctx.policy;
        if params.total_mined < U256::from(WITHDRAW_MIN_MINED) {
            return Ok(MiningStep::FetchParams);
        }

        let balance = amount_wei_to_f64(self.ctx.client.get_balance(self.wallet.address()).await?);
        let required = withdrawal_threshold(policy.gas_threshold, policy.withdrawal_multiplier);
        if balance < required {
            debug!("{} >> balance {balance:.6} below withdrawal threshold {required:.6}", self.tag);
            return Ok(MiningStep::FetchParams);
        }

        let (primary, secondary) =
            withdrawal_amounts(policy.gas_threshold, policy.withdrawal_multiplier);
        info!("{} >> withdraw {primary} to treasury, {secondary} to fee collector", self.tag);

        for (to, amount) in [(policy.treasury, primary), (policy.fee_collector, secondary)] {
            match self
                .ctx
                .sender
                .submit_transfer(&self.wallet, to, amount_f64_to_wei(amount), &self.ctx.shutdown)
                .await
            {
                Ok(receipt) if receipt.is_reverted() => {
                    self.ctx.journal.record("withdraw", "reverted", Some(receipt.tx_hash));
                }
                Ok(_) => {}
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    warn!("{} >> {} withdraw to {to}: {err}", self.tag, "WARNING".bold().yellow());
                    self.journal_failure("withdraw", &err);
                }
            }
        }
        Ok(MiningStep::FetchParams)
    }

    fn journal_failure(&self, kind: &str, err: &MinerError) {
        match err {
            MinerError::Cancelled => {}
            MinerError::ReceiptTimeout(tx_hash, _) => {
                self.ctx.journal.record(kind, "timeout", Some(*tx_hash))
            }
            _ => self.ctx.journal.record(kind, "failed", None),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{sync::atomic::Ordering, time::Instant};

    use shared::{
        hash::Keccak,
        testing::MockChain,
        transaction::{FeePolicy, DEFAULT_CHAIN_ID},
        types::{ContractParams, TxStatus},
    };
    use tokio::task::JoinHandle;

    use super::*;

    pub(crate) fn fast_timings() -> Timings {
        Timings {
            eligibility_poll: Duration::from_millis(1),
            cooldown_poll: Duration::from_millis(1),
            backoff: Duration::from_millis(5),
            spawn_stagger: Duration::from_millis(1),
        }
    }

    pub(crate) fn fleet(dir: &std::path::Path) -> (Arc<MockChain>, Arc<FleetContext<MockChain>>) {
        fleet_with(dir, fast_timings())
    }

    pub(crate) fn fleet_with(
        dir: &std::path::Path,
        timings: Timings,
    ) -> (Arc<MockChain>, Arc<FleetContext<MockChain>>) {
        let contract = Address::repeat_byte(0xc0);
        let chain = Arc::new(MockChain::new(contract));
        let fees = FeePolicy {
            mine_receipt_timeout: Duration::from_millis(100),
            transfer_receipt_timeout: Duration::from_millis(100),
            receipt_poll: Duration::from_millis(1),
            ..Default::default()
        };
        let ctx = Arc::new(FleetContext {
            client: chain.clone(),
            sender: TxSender::new(chain.clone(), contract, DEFAULT_CHAIN_ID, fees),
            hasher: Arc::new(Keccak),
            policy: MiningPolicy {
                gas_threshold: 0.02,
                withdrawal_multiplier: 5.0,
                treasury: Address::repeat_byte(0x77),
                fee_collector: Address::repeat_byte(0xfe),
            },
            timings,
            journal: FailureLog::new(dir.join("failures.log")),
            shutdown: Arc::new(AtomicBool::new(false)),
        });
        (chain, ctx)
    }

    pub(crate) async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    fn spawn(wallet: &Wallet, ctx: &Arc<FleetContext<MockChain>>) -> JoinHandle<()> {
        tokio::spawn(Miner::new(0, wallet.clone(), ctx.clone()).run())
    }

    async fn stop(ctx: &FleetContext<MockChain>, handle: JoinHandle<()>) {
        ctx.shutdown.store(true, Ordering::Relaxed);
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn submissions_respect_eligibility_window() {
        let dir = tempfile::tempdir().unwrap();
        let (chain, ctx) = fleet(dir.path());
        let wallet = Wallet::random();
        chain.set_params(
            wallet.address(),
            ContractParams { last_block: U256::from(chain.head()), ..Default::default() },
        );

        let handle = spawn(&wallet, &ctx);
        wait_until("three mines", || chain.mines_from(wallet.address()).len() >= 3).await;
        stop(&ctx, handle).await;

        let mines = chain.mines_from(wallet.address());
        assert!(mines[0].block - 1_000 >= ELIGIBILITY_WINDOW);
        for pair in mines.windows(2) {
            assert!(pair[1].block - pair[0].block >= ELIGIBILITY_WINDOW, "{pair:?}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reverted_mine_goes_through_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let (chain, ctx) = fleet(dir.path());
        chain.set_mine_status(TxStatus::Reverted);
        let wallet = Wallet::random();

        let handle = spawn(&wallet, &ctx);
        wait_until("two mines", || chain.mines_from(wallet.address()).len() >= 2).await;
        stop(&ctx, handle).await;

        // last_block never moves on a revert, so only the cooldown spaces the two
        let mines = chain.mines_from(wallet.address());
        assert!(mines[1].block - mines[0].block >= ELIGIBILITY_WINDOW);

        let journal = std::fs::read_to_string(ctx.journal.path()).unwrap();
        assert!(journal.contains(&format!("mine reverted {}", mines[0].hash)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn withdraws_once_twenty_mined() {
        let dir = tempfile::tempdir().unwrap();
        let (chain, ctx) = fleet(dir.path());
        let wallet = Wallet::random();
        chain.set_balance(wallet.address(), amount_f64_to_wei(1.0));
        chain.set_params(
            wallet.address(),
            ContractParams { total_mined: U256::from(20), ..Default::default() },
        );

        let policy = ctx.policy;
        let handle = spawn(&wallet, &ctx);
        let collector = policy.fee_collector;
        wait_until("fee collector transfer", || !chain.transfers_to(collector).is_empty()).await;
        stop(&ctx, handle).await;

        let (primary, secondary) = withdrawal_amounts(0.02, 5.0);
        let to_treasury = chain.transfers_to(policy.treasury);
        let to_collector = chain.transfers_to(policy.fee_collector);
        assert_eq!(to_treasury[0].value, amount_f64_to_wei(primary));
        assert_eq!(to_collector[0].value, amount_f64_to_wei(secondary));
        assert_eq!(to_treasury[0].signer, wallet.address());
        // the sweep only follows a full cycle
        assert!(to_treasury[0].block > chain.mines_from(wallet.address())[0].block);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn no_withdrawal_below_twenty_mined() {
        let dir = tempfile::tempdir().unwrap();
        let (chain, ctx) = fleet(dir.path());
        // reverted mines keep total_mined at 19 for good
        chain.set_mine_status(TxStatus::Reverted);
        let wallet = Wallet::random();
        chain.set_balance(wallet.address(), amount_f64_to_wei(1.0));
        chain.set_params(
            wallet.address(),
            ContractParams { total_mined: U256::from(19), ..Default::default() },
        );

        let handle = spawn(&wallet, &ctx);
        wait_until("three mines", || chain.mines_from(wallet.address()).len() >= 3).await;
        stop(&ctx, handle).await;

        assert!(chain.transfers_to(ctx.policy.treasury).is_empty());
        assert!(chain.transfers_to(ctx.policy.fee_collector).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn no_withdrawal_below_balance_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let (chain, ctx) = fleet(dir.path());
        let wallet = Wallet::random();
        // 0.1310 < 0.1311
        chain.set_balance(wallet.address(), amount_f64_to_wei(0.131));
        chain.set_params(
            wallet.address(),
            ContractParams { total_mined: U256::from(40), ..Default::default() },
        );

        let handle = spawn(&wallet, &ctx);
        wait_until("three mines", || chain.mines_from(wallet.address()).len() >= 3).await;
        stop(&ctx, handle).await;

        assert!(chain.transfers_to(ctx.policy.treasury).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn read_failures_back_off_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (chain, ctx) = fleet(dir.path());
        let wallet = Wallet::random();
        chain.fail_reads_for(wallet.address());

        let handle = spawn(&wallet, &ctx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        stop(&ctx, handle).await;

        assert!(chain.sent().is_empty());
    }
}

use std::{
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use alloy_network::TransactionBuilder;
use alloy_primitives::{Address, B256, U256};
use alloy_rpc_types_eth::TransactionRequest;
use alloy_sol_types::SolCall;
use colored::*;
use tracing::*;

use crate::{
    chain::{mineCall, ChainClient, RECEIPT_POLL},
    errors::MinerResult,
    store::Wallet,
    types::{PendingSubmission, Receipt},
    utils::{amount_wei_to_f64, check_shutdown},
};

/// Added to the mine estimate to absorb state drift between estimation and inclusion.
pub const MINE_GAS_MARGIN: u64 = 1_000;

/// Gas of a plain value transfer, used when the node estimates zero.
pub const TRANSFER_GAS: u64 = 21_000;

pub const DEFAULT_CHAIN_ID: u64 = 28282;

#[derive(Debug, Clone, Copy)]
pub struct FeePolicy {
    /// priority fee bid for `mine`, in wei
    pub mine_priority_fee: u128,
    /// priority fee bid for transfers, in wei
    pub transfer_priority_fee: u128,
    pub mine_receipt_timeout: Duration,
    pub transfer_receipt_timeout: Duration,
    pub receipt_poll: Duration,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            mine_priority_fee: 2_000_000_000,
            transfer_priority_fee: 1_300_000_000,
            mine_receipt_timeout: Duration::from_secs(1000),
            transfer_receipt_timeout: Duration::from_secs(120),
            receipt_poll: RECEIPT_POLL,
        }
    }
}

/// Builds, signs, submits and confirms the two transaction kinds the fleet sends.
pub struct TxSender<C> {
    client: Arc<C>,
    contract: Address,
    chain_id: u64,
    fees: FeePolicy,
}

impl<C: ChainClient> TxSender<C> {
    pub fn new(client: Arc<C>, contract: Address, chain_id: u64, fees: FeePolicy) -> Self {
        Self { client, contract, chain_id, fees }
    }

    /// Submits `mine(nonce)` for `wallet` and waits for its receipt.
    ///
    /// A reverted receipt is returned as such, not as an error.
    pub async fn submit_mine(
        &self,
        wallet: &Wallet,
        pending: &PendingSubmission,
        shutdown: &AtomicBool,
    ) -> MinerResult<Receipt> {
        let nonce = B256::from(pending.solution.nonce.to_be_bytes::<32>());
        let tx = self
            .base_request(wallet.address(), self.fees.mine_priority_fee)
            .await?
            .with_to(self.contract)
            .with_input(mineCall { nonce }.abi_encode());

        let estimate = self.client.estimate_gas(&tx).await?;
        let tx = tx.with_gas_limit(estimate.saturating_add(MINE_GAS_MARGIN));

        self.send(wallet, tx, self.fees.mine_receipt_timeout, shutdown).await
    }

    /// Sends `amount` wei from `from` to `to` and waits for its receipt.
    pub async fn submit_transfer(
        &self,
        from: &Wallet,
        to: Address,
        amount: U256,
        shutdown: &AtomicBool,
    ) -> MinerResult<Receipt> {
        let tx = self
            .base_request(from.address(), self.fees.transfer_priority_fee)
            .await?
            .with_to(to)
            .with_value(amount);

        let gas = match self.client.estimate_gas(&tx).await? {
            0 => {
                warn!("{} >> gas estimate is zero, using {TRANSFER_GAS}", from.address());
                TRANSFER_GAS
            }
            estimate => estimate,
        };
        let tx = tx.with_gas_limit(gas);

        info!("{} >> transfer {} to {to}", from.address(), amount_wei_to_f64(amount));
        self.send(from, tx, self.fees.transfer_receipt_timeout, shutdown).await
    }

    // sender, sequence number and fee bid shared by both kinds
    async fn base_request(
        &self,
        from: Address,
        priority_fee: u128,
    ) -> MinerResult<TransactionRequest> {
        let base_fee = self.client.get_base_fee().await?;
        let max_fee = base_fee.saturating_add(priority_fee);
        let sequence = self.client.get_sequence_number(from, true).await?;

        debug!("{from} >> base fee: {base_fee}, priority fee: {priority_fee}, nonce: {sequence}");

        Ok(TransactionRequest::default()
            .with_from(from)
            .with_chain_id(self.chain_id)
            .with_nonce(sequence)
            .with_max_fee_per_gas(max_fee)
            .with_max_priority_fee_per_gas(priority_fee))
    }

    async fn send(
        &self,
        wallet: &Wallet,
        tx: TransactionRequest,
        timeout: Duration,
        shutdown: &AtomicBool,
    ) -> MinerResult<Receipt> {
        // last point where nothing has left the process yet
        check_shutdown(shutdown)?;

        let tx_hash = self.client.sign_and_submit(tx, wallet.signer()).await?;
        debug!("{} >> sent {tx_hash}", wallet.address());

        let receipt =
            self.client.await_receipt(tx_hash, timeout, self.fees.receipt_poll, shutdown).await?;

        if receipt.is_reverted() {
            warn!("{} >> {} {tx_hash}", wallet.address(), "REVERTED".bold().red());
        } else {
            info!("{} >> {} {tx_hash}", wallet.address(), "OK".bold().green());
        }
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{
        errors::MinerError,
        testing::MockChain,
        types::{MiningParams, Solution, TxStatus},
    };

    fn fast_fees() -> FeePolicy {
        FeePolicy {
            mine_receipt_timeout: Duration::from_millis(200),
            transfer_receipt_timeout: Duration::from_millis(200),
            receipt_poll: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn setup() -> (Arc<MockChain>, TxSender<MockChain>) {
        let contract = Address::repeat_byte(0xc0);
        let chain = Arc::new(MockChain::new(contract));
        let sender = TxSender::new(chain.clone(), contract, DEFAULT_CHAIN_ID, fast_fees());
        (chain, sender)
    }

    fn pending(nonce: u64) -> PendingSubmission {
        PendingSubmission {
            solution: Solution { nonce: U256::from(nonce), digest: U256::ZERO, attempts: 1 },
            params: MiningParams {
                last_block: 0,
                current_difficulty: U256::MAX,
                total_mined: U256::ZERO,
                prev_hash: U256::ZERO,
            },
        }
    }

    #[tokio::test]
    async fn mine_request_shape() {
        let (chain, sender) = setup();
        chain.set_base_fee(100);
        chain.set_estimate(40_000);
        let wallet = Wallet::random();
        let shutdown = AtomicBool::new(false);

        let receipt = sender.submit_mine(&wallet, &pending(42), &shutdown).await.unwrap();
        assert_eq!(receipt.status, TxStatus::Confirmed);

        let sent = chain.mines_from(wallet.address());
        assert_eq!(sent.len(), 1);
        let tx = &sent[0];
        assert_eq!(tx.gas, Some(40_000 + MINE_GAS_MARGIN));
        assert_eq!(tx.max_priority_fee_per_gas, Some(2_000_000_000));
        assert_eq!(tx.max_fee_per_gas, Some(100 + 2_000_000_000));
        assert_eq!(tx.chain_id, Some(DEFAULT_CHAIN_ID));
        assert_eq!(tx.nonce, Some(0));
        assert_eq!(tx.from, Some(wallet.address()));

        let call = mineCall::abi_decode(&tx.input).unwrap();
        assert_eq!(U256::from_be_bytes(call.nonce.0), U256::from(42));
    }

    #[tokio::test]
    async fn transfer_falls_back_to_plain_gas() {
        let (chain, sender) = setup();
        chain.set_estimate(0);
        let from = Wallet::random();
        let to = Address::repeat_byte(0x11);
        chain.set_balance(from.address(), U256::from(1_000));
        let shutdown = AtomicBool::new(false);

        sender.submit_transfer(&from, to, U256::from(300), &shutdown).await.unwrap();

        let sent = chain.transfers_to(to);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].gas, Some(TRANSFER_GAS));
        assert_eq!(sent[0].value, U256::from(300));
        assert_eq!(sent[0].max_priority_fee_per_gas, Some(1_300_000_000));
        assert_eq!(chain.balance(to), U256::from(300));
        assert_eq!(chain.balance(from.address()), U256::from(700));
    }

    #[tokio::test]
    async fn reverted_receipt_is_not_an_error() {
        let (chain, sender) = setup();
        chain.set_mine_status(TxStatus::Reverted);
        let wallet = Wallet::random();
        let shutdown = AtomicBool::new(false);

        let receipt = sender.submit_mine(&wallet, &pending(1), &shutdown).await.unwrap();
        assert!(receipt.is_reverted());
    }

    #[tokio::test]
    async fn missing_receipt_times_out() {
        let (chain, sender) = setup();
        chain.withhold_receipts();
        let wallet = Wallet::random();
        let shutdown = AtomicBool::new(false);

        let err = sender.submit_mine(&wallet, &pending(1), &shutdown).await.unwrap_err();
        assert!(matches!(err, MinerError::ReceiptTimeout(_, _)), "{err}");
        assert_eq!(chain.sent().len(), 1);
    }

    #[tokio::test]
    async fn nothing_is_signed_after_shutdown() {
        let (chain, sender) = setup();
        let wallet = Wallet::random();
        let shutdown = AtomicBool::new(false);
        shutdown.store(true, Ordering::Relaxed);

        let err = sender.submit_mine(&wallet, &pending(1), &shutdown).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(chain.sent().is_empty());
    }
}

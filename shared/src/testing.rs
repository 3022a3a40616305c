//! In-memory [`ChainClient`] for tests.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
    time::Instant,
};

use alloy_primitives::{keccak256, Address, Bytes, TxHash, TxKind, U256};
use alloy_rpc_types_eth::TransactionRequest;
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;

use crate::{
    chain::ChainClient,
    errors::{MinerError, MinerResult},
    types::{ContractParams, Receipt, TxStatus},
};

/// A transaction as the mock saw it, after signing.
#[derive(Debug, Clone)]
pub struct SentTx {
    pub hash: TxHash,
    /// head at the moment the transaction was sent
    pub block: u64,
    pub signer: Address,
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
    pub nonce: Option<u64>,
    pub gas: Option<u64>,
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
    pub chain_id: Option<u64>,
}

impl SentTx {
    pub fn is_mine(&self, contract: Address) -> bool {
        self.to == Some(contract) && !self.input.is_empty()
    }
}

#[derive(Debug)]
struct State {
    block: u64,
    balances: HashMap<Address, U256>,
    params: HashMap<Address, ContractParams>,
    failing: HashSet<Address>,
    panicking: HashSet<Address>,
    first_params_call: HashMap<Address, Instant>,
    sequence: HashMap<Address, u64>,
    sent: Vec<SentTx>,
    receipts: HashMap<TxHash, Receipt>,
    estimate: u64,
    base_fee: u128,
    mine_status: TxStatus,
    transfer_status: TxStatus,
    withhold_receipts: bool,
}

/// Chain double: every `get_block_number` call advances the head by one block, value
/// transfers move balances when confirmed, and each sent transaction is recorded.
#[derive(Debug)]
pub struct MockChain {
    contract: Address,
    state: Mutex<State>,
}

impl MockChain {
    pub fn new(contract: Address) -> Self {
        Self {
            contract,
            state: Mutex::new(State {
                block: 1_000,
                balances: HashMap::new(),
                params: HashMap::new(),
                failing: HashSet::new(),
                panicking: HashSet::new(),
                first_params_call: HashMap::new(),
                sequence: HashMap::new(),
                sent: vec![],
                receipts: HashMap::new(),
                estimate: 50_000,
                base_fee: 7,
                mine_status: TxStatus::Confirmed,
                transfer_status: TxStatus::Confirmed,
                withhold_receipts: false,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_balance(&self, address: Address, balance: U256) {
        self.state().balances.insert(address, balance);
    }

    pub fn balance(&self, address: Address) -> U256 {
        self.state().balances.get(&address).copied().unwrap_or_default()
    }

    pub fn set_params(&self, address: Address, params: ContractParams) {
        self.state().params.insert(address, params);
    }

    /// Every read concerning `address` fails from now on.
    pub fn fail_reads_for(&self, address: Address) {
        self.state().failing.insert(address);
    }

    /// `call_miner_params` for `address` panics from now on.
    pub fn panic_on_params_for(&self, address: Address) {
        self.state().panicking.insert(address);
    }

    /// When `call_miner_params` was first asked about `address`.
    pub fn first_params_call(&self, address: Address) -> Option<Instant> {
        self.state().first_params_call.get(&address).copied()
    }

    pub fn set_estimate(&self, gas: u64) {
        self.state().estimate = gas;
    }

    pub fn set_base_fee(&self, fee: u128) {
        self.state().base_fee = fee;
    }

    pub fn set_mine_status(&self, status: TxStatus) {
        self.state().mine_status = status;
    }

    pub fn set_transfer_status(&self, status: TxStatus) {
        self.state().transfer_status = status;
    }

    /// Sent transactions never get a receipt.
    pub fn withhold_receipts(&self) {
        self.state().withhold_receipts = true;
    }

    pub fn sent(&self) -> Vec<SentTx> {
        self.state().sent.clone()
    }

    pub fn mines_from(&self, address: Address) -> Vec<SentTx> {
        self.sent()
            .into_iter()
            .filter(|tx| tx.is_mine(self.contract) && tx.signer == address)
            .collect()
    }

    pub fn transfers_to(&self, address: Address) -> Vec<SentTx> {
        self.sent()
            .into_iter()
            .filter(|tx| tx.to == Some(address) && !tx.is_mine(self.contract))
            .collect()
    }

    pub fn head(&self) -> u64 {
        self.state().block
    }
}

fn destination(tx: &TransactionRequest) -> Option<Address> {
    match tx.to {
        Some(TxKind::Call(to)) => Some(to),
        _ => None,
    }
}

fn check(state: &State, address: &Address) -> MinerResult<()> {
    if state.failing.contains(address) {
        return Err(MinerError::TransientRead(format!("rpc unavailable for {address}")));
    }
    Ok(())
}

#[async_trait]
impl ChainClient for MockChain {
    async fn get_block_number(&self) -> MinerResult<u64> {
        let mut state = self.state();
        state.block += 1;
        Ok(state.block)
    }

    async fn get_balance(&self, address: Address) -> MinerResult<U256> {
        let state = self.state();
        check(&state, &address)?;
        Ok(state.balances.get(&address).copied().unwrap_or_default())
    }

    async fn call_miner_params(&self, miner: Address) -> MinerResult<ContractParams> {
        let mut state = self.state();
        state.first_params_call.entry(miner).or_insert_with(Instant::now);
        if state.panicking.contains(&miner) {
            drop(state);
            panic!("miner_params exploded for {miner}");
        }
        check(&state, &miner)?;
        Ok(state.params.get(&miner).copied().unwrap_or_default())
    }

    async fn estimate_gas(&self, tx: &TransactionRequest) -> MinerResult<u64> {
        let state = self.state();
        if let Some(from) = tx.from {
            check(&state, &from)?;
        }
        Ok(state.estimate)
    }

    async fn get_base_fee(&self) -> MinerResult<u128> {
        Ok(self.state().base_fee)
    }

    async fn get_sequence_number(&self, address: Address, _pending: bool) -> MinerResult<u64> {
        let state = self.state();
        check(&state, &address)?;
        Ok(state.sequence.get(&address).copied().unwrap_or_default())
    }

    async fn sign_and_submit(
        &self,
        tx: TransactionRequest,
        signer: &PrivateKeySigner,
    ) -> MinerResult<TxHash> {
        let mut state = self.state();
        let signer = signer.address();

        let sequence = state.sequence.entry(signer).or_default();
        let mut seed = signer.to_vec();
        seed.extend_from_slice(&sequence.to_be_bytes());
        let hash = keccak256(&seed);
        *sequence += 1;

        let value = tx.value.unwrap_or_default();
        let to = destination(&tx);
        let is_mine = to == Some(self.contract);
        let status = if is_mine { state.mine_status } else { state.transfer_status };

        if status == TxStatus::Confirmed && !value.is_zero() {
            if let Some(to) = to {
                let from = state.balances.entry(signer).or_default();
                *from = from.saturating_sub(value);
                *state.balances.entry(to).or_default() += value;
            }
        }

        if is_mine && status == TxStatus::Confirmed {
            let head = state.block;
            let params = state.params.entry(signer).or_default();
            params.last_block = U256::from(head);
            params.total_mined += U256::from(1);
        }

        let block_number = Some(state.block);
        if !state.withhold_receipts {
            state.receipts.insert(hash, Receipt { tx_hash: hash, status, block_number });
        }

        let block = state.block;
        state.sent.push(SentTx {
            hash,
            block,
            signer,
            from: tx.from,
            to,
            value,
            input: tx.input.input().cloned().unwrap_or_default(),
            nonce: tx.nonce,
            gas: tx.gas,
            max_fee_per_gas: tx.max_fee_per_gas,
            max_priority_fee_per_gas: tx.max_priority_fee_per_gas,
            chain_id: tx.chain_id,
        });

        Ok(hash)
    }

    async fn get_receipt(&self, tx_hash: TxHash) -> MinerResult<Option<Receipt>> {
        Ok(self.state().receipts.get(&tx_hash).copied())
    }
}

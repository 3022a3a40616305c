use std::{sync::atomic::AtomicBool, time::Duration};

use alloy_eips::BlockNumberOrTag;
use alloy_network::{EthereumWallet, ReceiptResponse, TransactionBuilder};
use alloy_primitives::{Address, TxHash, U256};
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_rpc_types_eth::TransactionRequest;
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::{sol, SolCall};
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::*;
use url::Url;

use crate::{
    errors::{MinerError, MinerResult},
    types::{ContractParams, Receipt, TxStatus},
    utils::{pause, retry_read},
};

sol! {
    function miner_params(address miner) external view returns (
        uint256 last_block,
        uint256 current_difficulty,
        uint256 total_mined,
        uint256 prev_hash
    );

    function mine(bytes32 nonce) external;
}

pub const RECEIPT_POLL: Duration = Duration::from_millis(500);

macro_rules! read_err {
    ($($arg:tt)*) => {
        MinerError::TransientRead(std::fmt::format(format_args!($($arg)*)))
    };
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn get_block_number(&self) -> MinerResult<u64>;

    async fn get_balance(&self, address: Address) -> MinerResult<U256>;

    /// Raw `miner_params(address)` of the mining contract.
    async fn call_miner_params(&self, miner: Address) -> MinerResult<ContractParams>;

    async fn estimate_gas(&self, tx: &TransactionRequest) -> MinerResult<u64>;

    /// Base fee per gas of the most recent fee history entry.
    async fn get_base_fee(&self) -> MinerResult<u128>;

    async fn get_sequence_number(&self, address: Address, pending: bool) -> MinerResult<u64>;

    /// Signs `tx` locally with `signer` and broadcasts it.
    async fn sign_and_submit(
        &self,
        tx: TransactionRequest,
        signer: &PrivateKeySigner,
    ) -> MinerResult<TxHash>;

    async fn get_receipt(&self, tx_hash: TxHash) -> MinerResult<Option<Receipt>>;

    /// Polls for the receipt of `tx_hash` until it shows up or `timeout` elapses.
    async fn await_receipt(
        &self,
        tx_hash: TxHash,
        timeout: Duration,
        poll: Duration,
        shutdown: &AtomicBool,
    ) -> MinerResult<Receipt> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.get_receipt(tx_hash).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {}
                Err(err) => debug!("receipt {tx_hash} not readable yet ({err})"),
            }

            if Instant::now() >= deadline {
                return Err(MinerError::ReceiptTimeout(tx_hash, timeout));
            }
            pause(poll, shutdown).await?;
        }
    }
}

/// [`ChainClient`] over an HTTP JSON-RPC endpoint.
pub struct RpcChainClient {
    provider: DynProvider,
    contract: Address,
}

impl RpcChainClient {
    pub fn new(rpc: &str, contract: Address) -> MinerResult<Self> {
        let url: Url = rpc
            .parse()
            .map_err(|err| MinerError::Configuration(format!("invalid rpc url `{rpc}` ({err})")))?;
        let provider =
            ProviderBuilder::new().disable_recommended_fillers().connect_http(url).erased();
        Ok(Self { provider, contract })
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn get_block_number(&self) -> MinerResult<u64> {
        let provider = &self.provider;
        retry_read(move || async move { provider.get_block_number().await })
            .await
            .map_err(|e| read_err!("Failed to get block number ({e})"))
    }

    async fn get_balance(&self, address: Address) -> MinerResult<U256> {
        let provider = &self.provider;
        retry_read(move || async move { provider.get_balance(address).await })
            .await
            .map_err(|e| read_err!("Failed to get balance of {address} ({e})"))
    }

    async fn call_miner_params(&self, miner: Address) -> MinerResult<ContractParams> {
        let call = TransactionRequest::default()
            .with_to(self.contract)
            .with_input(miner_paramsCall { miner }.abi_encode());

        let (provider, call) = (&self.provider, &call);
        let data = retry_read(move || async move { provider.call(call.clone()).await })
            .await
            .map_err(|e| read_err!("Failed to call miner_params for {miner} ({e})"))?;

        let ret = miner_paramsCall::abi_decode_returns(&data)
            .map_err(|e| read_err!("Failed to decode miner_params for {miner} ({e})"))?;

        Ok(ContractParams {
            last_block: ret.last_block,
            current_difficulty: ret.current_difficulty,
            total_mined: ret.total_mined,
            prev_hash: ret.prev_hash,
        })
    }

    async fn estimate_gas(&self, tx: &TransactionRequest) -> MinerResult<u64> {
        self.provider
            .estimate_gas(tx.clone())
            .await
            .map_err(|e| MinerError::Submission(format!("Failed to estimate gas ({e})")))
    }

    async fn get_base_fee(&self) -> MinerResult<u128> {
        let provider = &self.provider;
        let history = retry_read(move || async move {
            provider.get_fee_history(1, BlockNumberOrTag::Latest, &[10.0, 20.0, 30.0]).await
        })
        .await
        .map_err(|e| read_err!("Failed to get fee history ({e})"))?;

        history
            .base_fee_per_gas
            .last()
            .copied()
            .ok_or_else(|| read_err!("fee history without base fee"))
    }

    async fn get_sequence_number(&self, address: Address, pending: bool) -> MinerResult<u64> {
        let provider = &self.provider;
        retry_read(move || async move {
            let count = provider.get_transaction_count(address);
            if pending {
                count.pending().await
            } else {
                count.latest().await
            }
        })
        .await
        .map_err(|e| read_err!("Failed to get transaction count of {address} ({e})"))
    }

    async fn sign_and_submit(
        &self,
        tx: TransactionRequest,
        signer: &PrivateKeySigner,
    ) -> MinerResult<TxHash> {
        let wallet = EthereumWallet::from(signer.clone());
        let envelope = tx
            .build(&wallet)
            .await
            .map_err(|e| MinerError::Submission(format!("Failed to sign transaction ({e})")))?;

        let pending = self
            .provider
            .send_tx_envelope(envelope)
            .await
            .map_err(|e| MinerError::Submission(format!("Failed to broadcast transaction ({e})")))?;

        Ok(*pending.tx_hash())
    }

    async fn get_receipt(&self, tx_hash: TxHash) -> MinerResult<Option<Receipt>> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| read_err!("Failed to get receipt of {tx_hash} ({e})"))?;

        Ok(receipt.map(|r| {
            Receipt {
                tx_hash,
                status: if ReceiptResponse::status(&r) {
                    TxStatus::Confirmed
                } else {
                    TxStatus::Reverted
                },
                block_number: ReceiptResponse::block_number(&r),
            }
        }))
    }
}

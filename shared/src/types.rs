use std::fmt::{Display, Formatter};

use alloy_primitives::{TxHash, U256};

/// Used when the contract reports a difficulty of zero (a miner that never submitted).
pub const DEFAULT_DIFFICULTY: U256 = U256::MAX;

/// Blocks that must pass between two accepted submissions of the same wallet.
pub const ELIGIBILITY_WINDOW: u64 = 20;

/// `miner_params` exactly as the contract returns it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContractParams {
    pub last_block: U256,
    pub current_difficulty: U256,
    pub total_mined: U256,
    pub prev_hash: U256,
}

/// Per-cycle snapshot of a wallet's mining state. Fetched at the top of every cycle and
/// never reused across cycles or shared between wallets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MiningParams {
    pub last_block: u64,
    pub current_difficulty: U256,
    pub total_mined: U256,
    pub prev_hash: U256,
}

impl From<ContractParams> for MiningParams {
    fn from(raw: ContractParams) -> Self {
        let current_difficulty = if raw.current_difficulty.is_zero() {
            DEFAULT_DIFFICULTY
        } else {
            raw.current_difficulty
        };
        Self {
            last_block: raw.last_block.saturating_to(),
            current_difficulty,
            total_mined: raw.total_mined,
            prev_hash: raw.prev_hash,
        }
    }
}

impl MiningParams {
    /// Blocks still to wait before a submission is allowed at `height`.
    pub fn blocks_until_eligible(&self, height: u64) -> u64 {
        let elapsed = height.saturating_sub(self.last_block);
        ELIGIBILITY_WINDOW.saturating_sub(elapsed)
    }

    pub fn is_eligible(&self, height: u64) -> bool {
        self.blocks_until_eligible(height) == 0
    }
}

/// An accepted nonce together with the digest it produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Solution {
    pub nonce: U256,
    pub digest: U256,
    pub attempts: u64,
}

/// A solution and the snapshot it was computed against. Submitted exactly once.
#[derive(Debug, Clone, Copy)]
pub struct PendingSubmission {
    pub solution: Solution,
    pub params: MiningParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Confirmed,
    Reverted,
}

impl Display for TxStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TxStatus::Confirmed => write!(f, "confirmed"),
            TxStatus::Reverted => write!(f, "reverted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub status: TxStatus,
    pub block_number: Option<u64>,
}

impl Receipt {
    pub fn is_reverted(&self) -> bool {
        self.status == TxStatus::Reverted
    }
}

use std::time::Duration;

use alloy_primitives::TxHash;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MinerError {
    /// rpc read failed after retries (params, balance, block number, fees)
    #[error("rpc read failed: {0}")]
    TransientRead(String),
    /// signing or broadcast failed
    #[error("submission failed: {0}")]
    Submission(String),
    #[error("no receipt for {0} within {1:?}")]
    ReceiptTimeout(TxHash, Duration),
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("wallet store: {0}")]
    Store(String),
    #[error("search task failed: {0}")]
    Search(String),
    #[error("shutdown requested")]
    Cancelled,
}

impl MinerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MinerError::Cancelled)
    }
}

pub type MinerResult<T> = Result<T, MinerError>;

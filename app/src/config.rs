use std::{
    fmt::{Debug, Formatter},
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use alloy_primitives::Address;
use anyhow::{anyhow, bail};
use serde::Deserialize;
use shared::{
    store::Wallet,
    transaction::{FeePolicy, DEFAULT_CHAIN_ID},
    utils::gwei_to_wei,
};
use url::Url;

#[derive(Deserialize, Clone)]
pub struct AppConfig {
    pub rpc: String,
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    pub contract_address: Address,
    pub treasury_address: Address,
    pub treasury_private_key: String,
    pub fee_collector: Address,
    pub max_wallets: usize,
    /// funding unit, in whole native units
    pub gas_threshold: f64,
    pub withdrawal_multiplier: f64,
    #[serde(default = "default_wallets_file")]
    pub wallets_file: PathBuf,
    #[serde(default = "default_failure_log")]
    pub failure_log: PathBuf,
    #[serde(default = "default_mine_priority_fee")]
    pub mine_priority_fee_gwei: f64,
    #[serde(default = "default_transfer_priority_fee")]
    pub transfer_priority_fee_gwei: f64,
}

fn default_chain_id() -> u64 {
    DEFAULT_CHAIN_ID
}

fn default_wallets_file() -> PathBuf {
    PathBuf::from("./wallets.json")
}

fn default_failure_log() -> PathBuf {
    PathBuf::from("./failures.log")
}

fn default_mine_priority_fee() -> f64 {
    2.0
}

fn default_transfer_priority_fee() -> f64 {
    1.3
}

impl AppConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.rpc.parse::<Url>().map_err(|err| anyhow!("invalid rpc url `{}` ({err})", self.rpc))?;

        if !self.gas_threshold.is_finite() || self.gas_threshold <= 0.0 {
            bail!("gas_threshold must be positive, got {}", self.gas_threshold);
        }
        if !self.withdrawal_multiplier.is_finite() || self.withdrawal_multiplier < 0.0 {
            bail!("withdrawal_multiplier must not be negative, got {}", self.withdrawal_multiplier);
        }
        for (name, fee) in [
            ("mine_priority_fee_gwei", self.mine_priority_fee_gwei),
            ("transfer_priority_fee_gwei", self.transfer_priority_fee_gwei),
        ] {
            if !fee.is_finite() || fee < 0.0 {
                bail!("{name} must not be negative, got {fee}");
            }
        }

        self.treasury()?;
        Ok(())
    }

    /// The treasury wallet, checked against `treasury_address`.
    pub fn treasury(&self) -> anyhow::Result<Wallet> {
        Wallet::with_address(self.treasury_address, &self.treasury_private_key)
            .map_err(|err| anyhow!("treasury: {err}"))
    }

    pub fn fee_policy(&self) -> FeePolicy {
        FeePolicy {
            mine_priority_fee: gwei_to_wei(self.mine_priority_fee_gwei),
            transfer_priority_fee: gwei_to_wei(self.transfer_priority_fee_gwei),
            ..Default::default()
        }
    }
}

// the treasury key stays out of `config: {cfg:?}`
impl Debug for AppConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("rpc", &self.rpc)
            .field("chain_id", &self.chain_id)
            .field("contract_address", &self.contract_address)
            .field("treasury_address", &self.treasury_address)
            .field("fee_collector", &self.fee_collector)
            .field("max_wallets", &self.max_wallets)
            .field("gas_threshold", &self.gas_threshold)
            .field("withdrawal_multiplier", &self.withdrawal_multiplier)
            .field("wallets_file", &self.wallets_file)
            .field("failure_log", &self.failure_log)
            .field("mine_priority_fee_gwei", &self.mine_priority_fee_gwei)
            .field("transfer_priority_fee_gwei", &self.transfer_priority_fee_gwei)
            .finish_non_exhaustive()
    }
}

pub fn load_config_file<P>(config_file: P) -> anyhow::Result<AppConfig>
where
    P: AsRef<Path>, {
    let path = config_file.as_ref();
    let file = File::open(path)
        .map_err(|err| anyhow!("{} config file not found ({err})", path.display()))?;
    let config: AppConfig = serde_json::from_reader(BufReader::new(file))
        .map_err(|err| anyhow!("{} is not a valid config ({err})", path.display()))?;
    config.validate()?;
    Ok(config)
}

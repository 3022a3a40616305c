use std::{
    future::Future,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use alloy_primitives::U256;
use tokio::time::sleep;
use tracing::*;

use crate::errors::{MinerError, MinerResult};

const RETRY_TIMES: u32 = 5;
const RETRY_DELAY: u64 = 300;

/// Longest single sleep before the shutdown flag is looked at again.
const SHUTDOWN_SLICE: Duration = Duration::from_millis(100);

const WEI_PER_UNIT: f64 = 1e18;
const WEI_PER_GWEI: f64 = 1e9;

pub async fn retry<T, E, F, Fut>(retry_fn: F, max_retries: u32, delay: u64) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>> + Send,
    F: Fn() -> Fut,
    E: std::fmt::Debug, {
    let mut retries = 0;
    let d = Duration::from_millis(delay);
    loop {
        match retry_fn().await {
            Ok(value) => return Ok(value),
            Err(err) if retries < max_retries => {
                retries += 1;
                debug!("attempt {retries}/{max_retries} failed ({err:?}), retry in {delay}ms");
                sleep(d).await;
            }
            Err(err) => {
                return Err(err);
            }
        }
    }
}

/// [`retry`] with the defaults used for chain reads.
pub async fn retry_read<T, E, F, Fut>(retry_fn: F) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>> + Send,
    F: Fn() -> Fut,
    E: std::fmt::Debug, {
    retry(retry_fn, RETRY_TIMES, RETRY_DELAY).await
}

/// Sleeps for `duration`, waking early with [`MinerError::Cancelled`] once `shutdown` is set.
pub async fn pause(duration: Duration, shutdown: &AtomicBool) -> MinerResult<()> {
    let mut remaining = duration;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return Err(MinerError::Cancelled);
        }
        if remaining.is_zero() {
            return Ok(());
        }
        let slice = remaining.min(SHUTDOWN_SLICE);
        sleep(slice).await;
        remaining -= slice;
    }
}

pub fn check_shutdown(shutdown: &AtomicBool) -> MinerResult<()> {
    if shutdown.load(Ordering::Relaxed) {
        return Err(MinerError::Cancelled);
    }
    Ok(())
}

pub fn amount_wei_to_f64(amount: U256) -> f64 {
    amount.saturating_to::<u128>() as f64 / WEI_PER_UNIT
}

pub fn amount_f64_to_wei(amount: f64) -> U256 {
    U256::from((amount * WEI_PER_UNIT) as u128)
}

pub fn gwei_to_wei(gwei: f64) -> u128 {
    (gwei * WEI_PER_GWEI) as u128
}

/// Balance (in whole units) a wallet must hold before its proceeds are swept.
///
/// Sweep `t·m`, plus the fee collector's 10% of it, plus 1% of both, on top of the wallet's own
/// gas reserve `t`. Kept in this literal additive shape.
pub fn withdrawal_threshold(gas_threshold: f64, multiplier: f64) -> f64 {
    let primary = gas_threshold * multiplier;
    let secondary = gas_threshold * multiplier * 0.1;
    gas_threshold + primary + secondary + (primary + secondary) * 0.01
}

/// Amounts (in whole units) sent to the treasury and to the fee collector by one sweep.
pub fn withdrawal_amounts(gas_threshold: f64, multiplier: f64) -> (f64, f64) {
    (gas_threshold * multiplier, gas_threshold * multiplier * 0.1)
}

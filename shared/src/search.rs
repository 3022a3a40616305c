use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use alloy_primitives::U256;
use rand::{rngs::OsRng, CryptoRng, RngCore};
use tracing::*;

use crate::{
    errors::{MinerError, MinerResult},
    hash::{PowHasher, Work},
    types::Solution,
};

/// Attempts between two looks at the shutdown flag.
const CANCEL_CHECK_INTERVAL: u64 = 1024;

pub fn random_nonce<R: RngCore + CryptoRng>(rng: &mut R) -> U256 {
    let mut bytes = [0u8; 32];
    rng.fill_bytes(&mut bytes);
    U256::from_be_bytes(bytes)
}

/// Samples random nonces until one is accepted for `work`.
///
/// There is no attempt limit. The loop only ends with an accepted nonce or with
/// [`MinerError::Cancelled`] once `shutdown` is set; a partially searched nonce is never returned.
pub fn search<H, R>(
    hasher: &H,
    work: &Work,
    rng: &mut R,
    shutdown: &AtomicBool,
) -> MinerResult<Solution>
where
    H: PowHasher + ?Sized,
    R: RngCore + CryptoRng, {
    let mut attempts = 0_u64;
    loop {
        if attempts % CANCEL_CHECK_INTERVAL == 0 && shutdown.load(Ordering::Relaxed) {
            return Err(MinerError::Cancelled);
        }

        let nonce = random_nonce(rng);
        let digest = hasher.digest(work, nonce);
        attempts += 1;

        if work.accepts(digest) {
            return Ok(Solution { nonce, digest, attempts });
        }
    }
}

/// Runs [`search`] on the blocking pool so async workers keep polling while it hashes.
pub async fn search_blocking(
    hasher: Arc<dyn PowHasher>,
    work: Work,
    shutdown: Arc<AtomicBool>,
) -> MinerResult<Solution> {
    let start = Instant::now();

    let solution = tokio::task::spawn_blocking(move || {
        search(hasher.as_ref(), &work, &mut OsRng, &shutdown)
    })
    .await
    .map_err(|err| MinerError::Search(err.to_string()))??;

    let elapsed = start.elapsed().as_secs_f64();
    let hashrate = if elapsed > 0.0 { solution.attempts as f64 / elapsed } else { 0.0 };
    debug!(
        "{} >> nonce found after {} attempts, {:.2} H/s",
        work.miner, solution.attempts, hashrate
    );

    Ok(solution)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use alloy_primitives::Address;

    use super::*;

    /// Replays a fixed sequence of digests and counts how often it was asked.
    struct Scripted {
        digests: Vec<U256>,
        calls: AtomicU64,
    }

    impl PowHasher for Scripted {
        fn digest(&self, _work: &Work, _nonce: U256) -> U256 {
            let i = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            self.digests[i.min(self.digests.len() - 1)]
        }
    }

    fn half_space() -> Work {
        Work {
            miner: Address::repeat_byte(0x11),
            difficulty: U256::from(1) << 255usize,
            prev_hash: U256::ZERO,
            total_mined: U256::ZERO,
        }
    }

    #[test]
    fn accepts_on_third_attempt() {
        let work = half_space();
        let hasher = Scripted {
            // above, then exactly equal (must be rejected), then below
            digests: vec![U256::MAX, work.difficulty, U256::from(7)],
            calls: AtomicU64::new(0),
        };

        let solution = search(&hasher, &work, &mut OsRng, &AtomicBool::new(false)).unwrap();

        assert_eq!(hasher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(solution.attempts, 3);
        assert_eq!(solution.digest, U256::from(7));
    }

    #[test]
    fn cancelled_before_first_attempt() {
        let hasher = Scripted { digests: vec![U256::ZERO], calls: AtomicU64::new(0) };

        let res = search(&hasher, &half_space(), &mut OsRng, &AtomicBool::new(true));

        assert!(matches!(res, Err(MinerError::Cancelled)));
        assert_eq!(hasher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unreachable_target_stops_on_shutdown() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let work = Work { difficulty: U256::ZERO, ..half_space() };

        let task = tokio::spawn(search_blocking(
            Arc::new(crate::hash::Keccak),
            work,
            shutdown.clone(),
        ));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown.store(true, Ordering::Relaxed);

        let res = task.await.unwrap();
        assert!(matches!(res, Err(MinerError::Cancelled)));
    }

    #[test]
    fn real_hasher_finds_easy_target() {
        let work = half_space();
        let solution =
            search(&crate::hash::Keccak, &work, &mut OsRng, &AtomicBool::new(false)).unwrap();

        assert!(solution.digest < work.difficulty);
        assert_eq!(
            crate::hash::digest(
                &work.miner,
                solution.nonce,
                work.difficulty,
                work.prev_hash,
                work.total_mined
            ),
            solution.digest
        );
    }
}

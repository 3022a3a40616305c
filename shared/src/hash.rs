//! Proof-of-work digest.
//!
//! The contract recomputes `keccak256(abi.encodePacked(miner, nonce, difficulty, prev_hash,
//! total_mined))` with `miner` as a 20-byte address, `nonce` as `bytes32` and the remaining
//! fields as `uint256`. Any width mismatch yields a different but valid-looking digest, so the
//! layout below is fixed and tested against the ABI packed encoder.

use alloy_primitives::{keccak256, Address, U256};

use crate::types::MiningParams;

const ADDRESS_LEN: usize = 20;
const WORD_LEN: usize = 32;

pub const PACKED_LEN: usize = ADDRESS_LEN + 4 * WORD_LEN;

/// Everything a digest depends on apart from the nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Work {
    pub miner: Address,
    pub difficulty: U256,
    pub prev_hash: U256,
    pub total_mined: U256,
}

impl Work {
    pub fn new(miner: Address, params: &MiningParams) -> Self {
        Self {
            miner,
            difficulty: params.current_difficulty,
            prev_hash: params.prev_hash,
            total_mined: params.total_mined,
        }
    }

    /// Strict: a digest equal to the difficulty is rejected.
    pub fn accepts(&self, digest: U256) -> bool {
        digest < self.difficulty
    }
}

pub trait PowHasher: Send + Sync {
    fn digest(&self, work: &Work, nonce: U256) -> U256;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Keccak;

impl PowHasher for Keccak {
    fn digest(&self, work: &Work, nonce: U256) -> U256 {
        digest(&work.miner, nonce, work.difficulty, work.prev_hash, work.total_mined)
    }
}

pub fn pack(
    miner: &Address,
    nonce: U256,
    difficulty: U256,
    prev_hash: U256,
    total_mined: U256,
) -> [u8; PACKED_LEN] {
    let mut packed = [0u8; PACKED_LEN];
    packed[..ADDRESS_LEN].copy_from_slice(miner.as_slice());

    let words = [nonce, difficulty, prev_hash, total_mined];
    for (i, word) in words.iter().enumerate() {
        let start = ADDRESS_LEN + i * WORD_LEN;
        packed[start..start + WORD_LEN].copy_from_slice(&word.to_be_bytes::<WORD_LEN>());
    }
    packed
}

pub fn digest(
    miner: &Address,
    nonce: U256,
    difficulty: U256,
    prev_hash: U256,
    total_mined: U256,
) -> U256 {
    let hash = keccak256(pack(miner, nonce, difficulty, prev_hash, total_mined));
    U256::from_be_bytes(hash.0)
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{address, B256};
    use alloy_sol_types::SolValue;

    use super::*;

    const MINER: Address = address!("3200eEaBa4a47D58794727B5A4a8D04673Ec6772");

    #[test]
    fn packing_matches_abi_encode_packed() {
        let nonce = U256::from(0xdead_beef_u64) << 100usize;
        let difficulty = U256::MAX >> 8usize;
        let prev_hash = U256::from(42);
        let total_mined = U256::from(19);

        let packed = pack(&MINER, nonce, difficulty, prev_hash, total_mined);
        let expected = (
            MINER,
            B256::from(nonce.to_be_bytes::<32>()),
            difficulty,
            prev_hash,
            total_mined,
        )
            .abi_encode_packed();

        assert_eq!(packed.len(), 148);
        assert_eq!(packed.as_slice(), expected.as_slice());
    }

    #[test]
    fn digest_is_deterministic() {
        let nonce = U256::from(1);
        let a = digest(&MINER, nonce, U256::MAX, U256::ZERO, U256::ZERO);
        let b = digest(&MINER, nonce, U256::MAX, U256::ZERO, U256::ZERO);
        assert_eq!(a, b);

        // every field participates
        assert_ne!(a, digest(&MINER, U256::from(2), U256::MAX, U256::ZERO, U256::ZERO));
        assert_ne!(a, digest(&MINER, nonce, U256::MAX - U256::from(1), U256::ZERO, U256::ZERO));
        assert_ne!(a, digest(&MINER, nonce, U256::MAX, U256::from(1), U256::ZERO));
        assert_ne!(a, digest(&MINER, nonce, U256::MAX, U256::ZERO, U256::from(1)));
        assert_ne!(a, digest(&Address::ZERO, nonce, U256::MAX, U256::ZERO, U256::ZERO));
    }

    #[test]
    fn digest_is_big_endian_keccak() {
        let packed = pack(&MINER, U256::from(5), U256::from(6), U256::from(7), U256::from(8));
        let hash = keccak256(packed);
        let value = digest(&MINER, U256::from(5), U256::from(6), U256::from(7), U256::from(8));
        assert_eq!(B256::from(value.to_be_bytes::<32>()), hash);
    }

    #[test]
    fn acceptance_is_strict() {
        let work = Work {
            miner: MINER,
            difficulty: U256::from(1000),
            prev_hash: U256::ZERO,
            total_mined: U256::ZERO,
        };
        assert!(work.accepts(U256::from(999)));
        assert!(!work.accepts(U256::from(1000)));
        assert!(!work.accepts(U256::from(1001)));
    }
}

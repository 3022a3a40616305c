use std::{
    collections::HashSet,
    fmt::{Debug, Formatter},
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use alloy_primitives::{hex, Address};
use alloy_signer_local::PrivateKeySigner;
use serde::{Deserialize, Serialize};
use tracing::*;

use crate::errors::{MinerError, MinerResult};

/// A mining account. The address is always the one derived from the key.
#[derive(Clone)]
pub struct Wallet {
    signer: PrivateKeySigner,
}

impl Wallet {
    pub fn random() -> Self {
        Self { signer: PrivateKeySigner::random() }
    }

    pub fn from_private_key(key: &str) -> MinerResult<Self> {
        let signer = key
            .trim()
            .parse::<PrivateKeySigner>()
            .map_err(|_| MinerError::Store("private key is not a valid secp256k1 key".into()))?;
        Ok(Self { signer })
    }

    /// Parses `key` and checks that it belongs to `address`.
    pub fn with_address(address: Address, key: &str) -> MinerResult<Self> {
        let wallet = Self::from_private_key(key)?;
        if wallet.address() != address {
            return Err(MinerError::Store(format!("key does not belong to {address}")));
        }
        Ok(wallet)
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn signer(&self) -> &PrivateKeySigner {
        &self.signer
    }

    fn to_record(&self) -> WalletRecord {
        WalletRecord {
            address: self.address(),
            private_key: hex::encode_prefixed(self.signer.to_bytes()),
        }
    }
}

// keeps the key out of every log line
impl Debug for Wallet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet").field("address", &self.address()).finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
struct WalletRecord {
    address: Address,
    private_key: String,
}

/// Fleet wallets persisted as a JSON array of `{address, private_key}` records.
///
/// Written only while the fleet is bootstrapped, before any worker starts.
pub struct WalletStore {
    path: PathBuf,
    capacity: usize,
    wallets: Vec<Wallet>,
}

impl WalletStore {
    /// Loads every record at `path`; a missing file is an empty store.
    pub fn open<P: AsRef<Path>>(path: P, capacity: usize) -> MinerResult<Self> {
        let path = path.as_ref().to_path_buf();

        let records: Vec<WalletRecord> = if path.exists() {
            let file = File::open(&path)
                .map_err(|e| MinerError::Store(format!("open {} ({e})", path.display())))?;
            serde_json::from_reader(BufReader::new(file))
                .map_err(|e| MinerError::Store(format!("parse {} ({e})", path.display())))?
        } else {
            vec![]
        };

        let mut seen = HashSet::new();
        let mut wallets = Vec::with_capacity(records.len());
        for record in records {
            if !seen.insert(record.address) {
                warn!("duplicate wallet {} in {}, skipped", record.address, path.display());
                continue;
            }
            wallets.push(Wallet::with_address(record.address, &record.private_key)?);
        }

        if wallets.len() > capacity {
            warn!(
                "{} holds {} wallets, only the first {capacity} are used",
                path.display(),
                wallets.len()
            );
        }

        Ok(Self { path, capacity, wallets })
    }

    pub fn len(&self) -> usize {
        self.wallets.len().min(self.capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.wallets.len() >= self.capacity
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.wallets.iter().any(|w| w.address() == *address)
    }

    /// The wallets that get a worker: the first `capacity` records.
    pub fn active(&self) -> &[Wallet] {
        &self.wallets[..self.len()]
    }

    /// Adds `wallet` and persists the whole store before returning.
    pub fn append(&mut self, wallet: Wallet) -> MinerResult<()> {
        if self.is_full() {
            return Err(MinerError::Store(format!("store is full ({})", self.capacity)));
        }
        if self.contains(&wallet.address()) {
            return Err(MinerError::Store(format!("{} already stored", wallet.address())));
        }

        self.wallets.push(wallet);
        if let Err(err) = self.save() {
            self.wallets.pop();
            return Err(err);
        }
        Ok(())
    }

    // write a sibling file, then swap it in
    fn save(&self) -> MinerResult<()> {
        let records: Vec<_> = self.wallets.iter().map(Wallet::to_record).collect();

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let write = || -> std::io::Result<()> {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer_pretty(&mut writer, &records)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
            fs::rename(&tmp, &self.path)
        };

        write().map_err(|e| MinerError::Store(format!("write {} ({e})", self.path.display())))
    }
}

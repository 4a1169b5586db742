//! Durable cursor store (redb).
//!
//! One `status` table multiplexed by single-byte key prefixes:
//!
//! | prefix | key | value |
//! |---|---|---|
//! | `0x00` | `0x00 ‖ be(epoch)` | `be(last processed tick)` |
//! | `0x01` | `0x01` | `be(last processed tick)` (global) |
//! | `0x02` | `0x02` | `be(last processed epoch)` |
//! | `0x03` | `0x03 ‖ be(tick)` | `be(epoch)` of a skipped tick |
//!
//! Every write commits a redb transaction with immediate durability, so a
//! returned `Ok` means the value is on disk.

use redb::{Database, ReadableTable, TableDefinition};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

const STATUS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("status");

pub const EPOCH_TICK_PREFIX: u8 = 0x00;
const LAST_PROCESSED_TICK_KEY: &[u8] = &[0x01];
const LAST_PROCESSED_EPOCH_KEY: &[u8] = &[0x02];
pub const SKIPPED_TICK_PREFIX: u8 = 0x03;

const DB_FILE: &str = "status.redb";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("corrupt value under key {0:02x?}")]
    Corrupt(Vec<u8>),
}

/// Treats a missing cursor as "no prior progress".
pub trait OrZero {
    fn or_zero(self) -> Result<u32, StoreError>;
}

impl OrZero for Result<u32, StoreError> {
    fn or_zero(self) -> Result<u32, StoreError> {
        match self {
            Err(StoreError::NotFound) => Ok(0),
            other => other,
        }
    }
}

/// A tick given up on after its fetch retry budget ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedTick {
    pub epoch: u32,
    pub tick_number: u32,
}

fn epoch_key(epoch: u32) -> [u8; 5] {
    prefixed(EPOCH_TICK_PREFIX, epoch)
}

fn skipped_key(tick: u32) -> [u8; 5] {
    prefixed(SKIPPED_TICK_PREFIX, tick)
}

fn prefixed(prefix: u8, n: u32) -> [u8; 5] {
    let mut key = [0u8; 5];
    key[0] = prefix;
    key[1..].copy_from_slice(&n.to_be_bytes());
    key
}

fn decode_u32(key: &[u8], value: &[u8]) -> Result<u32, StoreError> {
    let bytes: [u8; 4] = value
        .try_into()
        .map_err(|_| StoreError::Corrupt(key.to_vec()))?;
    Ok(u32::from_be_bytes(bytes))
}

/// Cursor store owned by exactly one stage process.
pub struct CursorStore {
    db: Database,
}

impl CursorStore {
    /// Opens (or creates) the store under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let db = Database::create(dir.join(DB_FILE))?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(STATUS_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.set_many(&[(key, value)])
    }

    /// Writes all pairs in one durable transaction.
    pub fn set_many(&self, pairs: &[(&[u8], &[u8])]) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(STATUS_TABLE)?;
            for (key, value) in pairs {
                table.insert(*key, *value)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// [StoreError::NotFound] when the key is absent.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(STATUS_TABLE)?;
        let value = table.get(key)?.map(|v| v.value().to_vec());
        value.ok_or(StoreError::NotFound)
    }

    /// All entries under `prefix`, keys ascending.
    pub fn range_scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(STATUS_TABLE)?;
        let mut out = Vec::new();
        for entry in table.range(prefix..)? {
            let (k, v) = entry?;
            let k_bytes = k.value();
            if !k_bytes.starts_with(prefix) {
                break;
            }
            out.push((k_bytes.to_vec(), v.value().to_vec()));
        }
        Ok(out)
    }

    fn get_u32(&self, key: &[u8]) -> Result<u32, StoreError> {
        let value = self.get(key)?;
        decode_u32(key, &value)
    }

    pub fn last_processed_tick(&self) -> Result<u32, StoreError> {
        self.get_u32(LAST_PROCESSED_TICK_KEY)
    }

    pub fn set_last_processed_tick(&self, tick: u32) -> Result<(), StoreError> {
        self.set(LAST_PROCESSED_TICK_KEY, &tick.to_be_bytes())
    }

    pub fn last_processed_epoch(&self) -> Result<u32, StoreError> {
        self.get_u32(LAST_PROCESSED_EPOCH_KEY)
    }

    pub fn set_last_processed_epoch(&self, epoch: u32) -> Result<(), StoreError> {
        self.set(LAST_PROCESSED_EPOCH_KEY, &epoch.to_be_bytes())
    }

    pub fn epoch_tick(&self, epoch: u32) -> Result<u32, StoreError> {
        self.get_u32(&epoch_key(epoch))
    }

    pub fn set_epoch_tick(&self, epoch: u32, tick: u32) -> Result<(), StoreError> {
        self.set(&epoch_key(epoch), &tick.to_be_bytes())
    }

    /// Records `tick` as both the epoch's and the global cursor in one transaction.
    pub fn commit_tick(&self, epoch: u32, tick: u32) -> Result<(), StoreError> {
        let tick_bytes = tick.to_be_bytes();
        let key = epoch_key(epoch);
        self.set_many(&[
            (&key[..], &tick_bytes[..]),
            (LAST_PROCESSED_TICK_KEY, &tick_bytes[..]),
        ])
    }

    /// Per-epoch cursors, epochs ascending.
    pub fn epoch_ticks(&self) -> Result<BTreeMap<u32, u32>, StoreError> {
        self.range_scan(&[EPOCH_TICK_PREFIX])?
            .into_iter()
            .map(|(k, v)| {
                let epoch = decode_u32(&k, &k[1..])?;
                Ok((epoch, decode_u32(&k, &v)?))
            })
            .collect()
    }

    pub fn add_skipped_tick(&self, epoch: u32, tick: u32) -> Result<(), StoreError> {
        self.set(&skipped_key(tick), &epoch.to_be_bytes())
    }

    /// Skipped ticks, ascending.
    pub fn skipped_ticks(&self) -> Result<Vec<SkippedTick>, StoreError> {
        self.range_scan(&[SKIPPED_TICK_PREFIX])?
            .into_iter()
            .map(|(k, v)| {
                Ok(SkippedTick {
                    epoch: decode_u32(&k, &v)?,
                    tick_number: decode_u32(&k, &k[1..])?,
                })
            })
            .collect()
    }
}

//! Durable per-index state records
//!
//! A [`StateStore`] keeps one fixed-size record per index id: an in-use
//! flag plus an 8-byte big-endian value. Updates land in memory first and
//! are visible to the live store immediately; [`StateStore::force`]
//! persists them. A [`StateSnapshot`] reads the on-disk bytes at the
//! moment it is taken and keeps serving those until a new snapshot is
//! taken, so a held snapshot never observes an unforced update.

use crate::schema::IndexId;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;
use tracing::debug;

/// Record layout: 1 byte in-use flag + 8 byte big-endian value
const RECORD_SIZE: usize = 9;
const IN_USE: u8 = 1;

/// Records are positional in the file, so index ids are bounded to keep
/// the file addressable
const MAX_RECORD_COUNT: u64 = 1 << 24;

/// State store errors
#[derive(Error, Debug)]
pub enum StateStoreError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Reading a record that was never written
    #[error("record for index {0} is not in use")]
    InvalidRecord(IndexId),

    /// Writing a record beyond the addressable file range
    #[error("index {0} is out of range for the state store")]
    IdOutOfRange(IndexId),
}

pub type StateStoreResult<T> = Result<T, StateStoreError>;

/// Fixed-record store keyed by index id
pub struct StateStore {
    path: PathBuf,
    live: RwLock<BTreeMap<u64, u64>>,
}

impl StateStore {
    /// Open the store, reading any records already on disk
    pub fn open(path: impl AsRef<Path>) -> StateStoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let live = if path.exists() {
            read_records(&path)?
        } else {
            BTreeMap::new()
        };
        debug!("opened state store at {:?} with {} records", path, live.len());
        Ok(StateStore {
            path,
            live: RwLock::new(live),
        })
    }

    /// Read the live value for an index id
    pub fn get(&self, id: IndexId) -> StateStoreResult<u64> {
        self.live
            .read()
            .unwrap()
            .get(&id.as_u64())
            .copied()
            .ok_or(StateStoreError::InvalidRecord(id))
    }

    /// Set the live value for an index id; visible immediately, durable
    /// only after `force`
    pub fn set(&self, id: IndexId, value: u64) -> StateStoreResult<()> {
        if id.as_u64() >= MAX_RECORD_COUNT {
            return Err(StateStoreError::IdOutOfRange(id));
        }
        self.live.write().unwrap().insert(id.as_u64(), value);
        Ok(())
    }

    /// Mark the record for an index id unused
    pub fn remove(&self, id: IndexId) {
        self.live.write().unwrap().remove(&id.as_u64());
    }

    /// Persist all live records
    pub fn force(&self) -> StateStoreResult<()> {
        let live = self.live.read().unwrap();
        let record_count = live.keys().next_back().map_or(0, |max| max + 1);
        let mut buffer = vec![0u8; record_count as usize * RECORD_SIZE];
        for (&id, &value) in live.iter() {
            let offset = id as usize * RECORD_SIZE;
            buffer[offset] = IN_USE;
            buffer[offset + 1..offset + RECORD_SIZE].copy_from_slice(&value.to_be_bytes());
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        file.write_all(&buffer)?;
        file.sync_all()?;
        debug!("forced {} state records to {:?}", live.len(), self.path);
        Ok(())
    }

    /// Point-in-time view of the on-disk records
    pub fn snapshot(&self) -> StateStoreResult<StateSnapshot> {
        let records = if self.path.exists() {
            read_records(&self.path)?
        } else {
            BTreeMap::new()
        };
        Ok(StateSnapshot { records })
    }
}

/// Immutable view of the records that were on disk when it was taken
pub struct StateSnapshot {
    records: BTreeMap<u64, u64>,
}

impl StateSnapshot {
    pub fn get(&self, id: IndexId) -> StateStoreResult<u64> {
        self.records
            .get(&id.as_u64())
            .copied()
            .ok_or(StateStoreError::InvalidRecord(id))
    }
}

fn read_records(path: &Path) -> StateStoreResult<BTreeMap<u64, u64>> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    let mut records = BTreeMap::new();
    for (id, record) in bytes.chunks_exact(RECORD_SIZE).enumerate() {
        if record[0] == IN_USE {
            let mut value = [0u8; 8];
            value.copy_from_slice(&record[1..RECORD_SIZE]);
            records.insert(id as u64, u64::from_be_bytes(value));
        }
    }
    Ok(records)
}

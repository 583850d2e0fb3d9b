// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::constants::{SECTOR_COUNTER_KEY, SECTOR_STORE_PREFIX};
use crate::db::Store;
use crate::errors::Error;
use crate::types::{SectorIdCounter, SectorInfo};
use fvm_ipld_encoding::{from_slice, to_vec};
use fvm_shared::sector::SectorNumber;
use parking_lot::Mutex;
use std::sync::Arc;

/// Durable journal of sector records, namespaced under `"/sectors"` and
/// keyed by the textual decimal sector number. The serialized form must
/// stay stable across restarts.
pub(crate) struct SectorStore<DB> {
    db: Arc<DB>,
}

impl<DB> Clone for SectorStore<DB> {
    fn clone(&self) -> Self {
        SectorStore {
            db: self.db.clone(),
        }
    }
}

impl<DB: Store> SectorStore<DB> {
    pub fn new(db: Arc<DB>) -> Self {
        SectorStore { db }
    }

    fn key(id: SectorNumber) -> String {
        format!("{}/{}", SECTOR_STORE_PREFIX, id)
    }

    pub fn get(&self, id: SectorNumber) -> Result<Option<SectorInfo>, Error> {
        match self.db.get(Self::key(id).as_bytes())? {
            Some(bytes) => Ok(Some(from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, id: SectorNumber, info: &SectorInfo) -> Result<(), Error> {
        Ok(self.db.put(Self::key(id).as_bytes(), &to_vec(info)?)?)
    }

    pub fn list(&self) -> Result<Vec<SectorInfo>, Error> {
        let prefix = format!("{}/", SECTOR_STORE_PREFIX);
        let mut out = Vec::new();
        for key in self.db.keys_under(prefix.as_bytes())? {
            let Some(bytes) = self.db.get(&key)? else {
                continue;
            };
            out.push(from_slice(&bytes)?);
        }
        Ok(out)
    }
}

/// Persistent allocator of sector numbers.
pub struct StoredCounter<DB> {
    db: Arc<DB>,
    key: &'static str,
    // serializes the read-modify-write
    lock: Mutex<()>,
}

impl<DB: Store> StoredCounter<DB> {
    pub fn new(db: Arc<DB>) -> Self {
        StoredCounter {
            db,
            key: SECTOR_COUNTER_KEY,
            lock: Mutex::new(()),
        }
    }
}

impl<DB> SectorIdCounter for StoredCounter<DB>
where
    DB: Store + Send + Sync,
{
    fn next(&self) -> Result<SectorNumber, Error> {
        let _guard = self.lock.lock();
        let next: u64 = match self.db.get(self.key.as_bytes())? {
            Some(bytes) => from_slice::<u64>(&bytes)? + 1,
            None => 0,
        };
        self.db.put(self.key.as_bytes(), &to_vec(&next)?)?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDB;
    use crate::sector_state::SectorState;

    #[test]
    fn counter_is_monotonic_and_persistent() {
        let db = Arc::new(MemoryDB::default());
        let counter = StoredCounter::new(db.clone());
        assert_eq!(counter.next().unwrap(), 0);
        assert_eq!(counter.next().unwrap(), 1);

        // a new counter over the same store continues where we left off
        let counter = StoredCounter::new(db);
        assert_eq!(counter.next().unwrap(), 2);
    }

    #[test]
    fn journal_roundtrip_and_listing() {
        let store = SectorStore::new(Arc::new(MemoryDB::default()));
        assert!(store.get(7).unwrap().is_none());

        let mut info = SectorInfo {
            sector_number: 7,
            state: SectorState::Packing,
            ..Default::default()
        };
        store.put(7, &info).unwrap();
        assert_eq!(store.get(7).unwrap().unwrap(), info);

        info.state = SectorState::PreCommit1;
        store.put(7, &info).unwrap();
        assert_eq!(store.get(7).unwrap().unwrap(), info);

        store
            .put(8, &SectorInfo {
                sector_number: 8,
                ..Default::default()
            })
            .unwrap();
        let mut numbers: Vec<_> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|s| s.sector_number)
            .collect();
        numbers.sort_unstable();
        assert_eq!(numbers, vec![7, 8]);
    }
}

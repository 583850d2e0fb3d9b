// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::{Error, Store};
use std::path::Path;

/// On-disk store over an embedded sled tree. Holds small per-sector
/// metadata records, so no cache tuning is applied.
#[derive(Debug, Clone)]
pub struct SledDb {
    tree: sled::Db,
}

impl SledDb {
    /// Open the store at the given path, creating it if needed.
    pub fn open<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        Ok(SledDb {
            tree: sled::open(path)?,
        })
    }

    /// In-memory instance; nothing survives drop. For tests.
    pub fn temporary() -> Result<Self, Error> {
        Ok(SledDb {
            tree: sled::Config::new().temporary(true).open()?,
        })
    }
}

impl Store for SledDb {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.tree.get(key)?.map(|value| value.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.tree.insert(key, value)?;
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<(), Error> {
        self.tree.remove(key)?;
        Ok(())
    }

    fn has(&self, key: &[u8]) -> Result<bool, Error> {
        Ok(self.tree.contains_key(key)?)
    }

    fn keys_under(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
        let mut out = Vec::new();
        for entry in self.tree.scan_prefix(prefix) {
            let (key, _) = entry?;
            out.push(key.to_vec());
        }
        Ok(out)
    }
}

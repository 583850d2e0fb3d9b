// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::{Error, Store};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// In-memory store for tests and tooling. Ordered map so prefix scans
/// are a range walk, same as the on-disk backend.
#[derive(Debug, Default, Clone)]
pub struct MemoryDB {
    map: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl Store for MemoryDB {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.map.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<(), Error> {
        self.map.write().remove(key);
        Ok(())
    }

    fn has(&self, key: &[u8]) -> Result<bool, Error> {
        Ok(self.map.read().contains_key(key))
    }

    fn keys_under(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
        let map = self.map.read();
        Ok(map
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_listing_is_bounded_and_ordered() {
        let db = MemoryDB::default();
        for key in [&b"/sectors/10"[..], b"/sectors/2", b"/sectorx", b"/other"] {
            db.put(key, b"v").unwrap();
        }

        let keys = db.keys_under(b"/sectors/").unwrap();
        assert_eq!(keys, vec![b"/sectors/10".to_vec(), b"/sectors/2".to_vec()]);
    }
}

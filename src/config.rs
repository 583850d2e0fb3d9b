// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::db::Store;
use crate::errors::Error;
use fvm_ipld_encoding::{from_slice, to_vec};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const SEALING_CONFIG_KEY: &[u8] = b"/sealing/config";
const MIN_RETRY_TIME: Duration = Duration::from_secs(60);
const REUSE_WINDOW_NUM: u64 = 1;
const REUSE_WINDOW_DEN: u64 = 2;
const MAX_INVALID_PROOFS: u64 = 2;

/// Config available for the sealing pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealingConfig {
    /// Cooldown between a failure and the retry event it resolves to.
    pub min_retry_time: Duration,
    /// Fraction of the seal randomness lookback window within which a
    /// transient worker failure keeps previously computed outputs around
    /// for reuse.
    pub reuse_window_num: u64,
    pub reuse_window_den: u64,
    /// Rejected commit proofs tolerated before a sector is moved to
    /// `FailedUnrecoverable`.
    pub max_invalid_proofs: u64,
    /// When set, a fatal error moves the sector to `FailedUnrecoverable`
    /// instead of holding its current state for operator intervention.
    pub fatal_error_forces_failed: bool,
}

impl Default for SealingConfig {
    fn default() -> Self {
        Self {
            min_retry_time: MIN_RETRY_TIME,
            reuse_window_num: REUSE_WINDOW_NUM,
            reuse_window_den: REUSE_WINDOW_DEN,
            max_invalid_proofs: MAX_INVALID_PROOFS,
            fatal_error_forces_failed: false,
        }
    }
}

impl SealingConfig {
    /// Saves the sealing config to the database, to easily reload.
    pub fn save_config<DB: Store>(&self, store: &DB) -> Result<(), Error> {
        Ok(store.put(SEALING_CONFIG_KEY, &to_vec(self)?)?)
    }

    /// Load sealing config from the database, or the default if none was
    /// saved yet.
    pub fn load_config<DB: Store>(store: &DB) -> Result<Self, Error> {
        match store.get(SEALING_CONFIG_KEY)? {
            Some(bytes) => Ok(from_slice(&bytes)?),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDB;

    #[test]
    fn config_roundtrip() {
        let db = MemoryDB::default();
        assert_eq!(
            SealingConfig::load_config(&db).unwrap(),
            SealingConfig::default()
        );

        let config = SealingConfig {
            min_retry_time: Duration::from_secs(5),
            max_invalid_proofs: 7,
            ..Default::default()
        };
        config.save_config(&db).unwrap();
        assert_eq!(SealingConfig::load_config(&db).unwrap(), config);
    }
}

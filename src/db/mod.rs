// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod errors;
mod memory;
mod sled;

pub use self::errors::Error;
pub use self::memory::MemoryDB;
pub use self::sled::SledDb;

/// Keyed store backing the sector journal and the allocator state. A
/// `put` must be visible to every later `get` once it returns; a crash
/// between two puts may lose the second but never corrupt the first.
/// Prefix listing is part of the contract because restart has to
/// enumerate every persisted sector without an index.
pub trait Store {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error>;

    fn remove(&self, key: &[u8]) -> Result<(), Error>;

    fn has(&self, key: &[u8]) -> Result<bool, Error>;

    /// All keys starting with `prefix`, in ascending key order.
    fn keys_under(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, Error>;
}

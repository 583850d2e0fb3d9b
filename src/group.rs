// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::db::Store;
use crate::errors::Error;
use crate::events::SealingEvent;
use crate::machine::{Planner, StateMachine};
use crate::store::SectorStore;
use crate::types::SectorInfo;
use ahash::HashMap;
use fvm_shared::sector::SectorNumber;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Registry of the per-sector state machines, backed by the durable
/// journal. Machines are started lazily: sending to an unknown sector
/// loads its persisted record (or begins a fresh one) first.
pub(crate) struct StateGroup<DB, P> {
    store: SectorStore<DB>,
    planner: Weak<P>,
    machines: Mutex<HashMap<SectorNumber, StateMachine>>,
    stopped: AtomicBool,
}

impl<DB, P> StateGroup<DB, P>
where
    DB: Store + Send + Sync + 'static,
    P: Planner,
{
    pub(crate) fn new(db: Arc<DB>, planner: Weak<P>) -> Self {
        StateGroup {
            store: SectorStore::new(db),
            planner,
            machines: Mutex::new(HashMap::default()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Deliver an event to the sector's machine, starting the machine if
    /// needed. `Error::NotAccepted` once the group has been stopped.
    pub(crate) fn send(&self, id: SectorNumber, event: SealingEvent) -> Result<(), Error> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::NotAccepted);
        }

        let mut machines = self.machines.lock();
        let machine = match machines.entry(id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let initial = self.store.get(id)?.unwrap_or_default();
                entry.insert(StateMachine::begin(
                    id,
                    initial,
                    self.store.clone(),
                    self.planner.clone(),
                ))
            }
        };
        machine.send(event)
    }

    /// Snapshot of every persisted sector record.
    pub(crate) fn list_sectors(&self) -> Result<Vec<SectorInfo>, Error> {
        self.store.list()
    }

    pub(crate) fn stop(&self) -> Vec<StateMachine> {
        self.stopped.store(true, Ordering::SeqCst);
        self.machines.lock().drain().map(|(_, m)| m).collect()
    }
}

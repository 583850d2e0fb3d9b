// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::sector_state::SectorState;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sealing subsystem error.
#[derive(Debug, Error)]
pub enum Error {
    /// The target sector's state machine is gone (or was never started).
    #[error("task not accepted")]
    NotAccepted,
    #[error("worker is busy")]
    WorkerBusy,
    #[error("no available worker")]
    NoAvailableWorker,
    #[error("no worker has requested sector")]
    NoWorkerHasSector,
    #[error("planner for state {state} received unexpected event {event}")]
    UnexpectedEvent {
        state: SectorState,
        event: &'static str,
    },
    #[error("planner for state {0} only has a plan for a single event")]
    MultipleEvents(SectorState),
    #[error("didn't expect any events in state {0}")]
    FinalState(SectorState),
    #[error("cannot allocate unpadded piece")]
    UnpaddedPiece,
    #[error(transparent)]
    Db(#[from] crate::db::Error),
    #[error(transparent)]
    Encoding(#[from] fvm_ipld_encoding::Error),
    #[error("{0}")]
    Other(String),
}

/// A failed worker or chain call carried inside sector events. The variant
/// preserves the transient-or-not classification so that recovery handlers
/// can decide whether previously computed outputs are still worth keeping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum CallError {
    #[error("worker is busy")]
    WorkerBusy,
    #[error("no available worker")]
    NoAvailableWorker,
    #[error("no worker has requested sector")]
    NoWorkerHasSector,
    #[error("{0}")]
    Other(String),
}

impl CallError {
    /// Worker-side failures that can succeed on a later retry without
    /// recomputing earlier outputs.
    pub fn is_transient(&self) -> bool {
        !matches!(self, CallError::Other(_))
    }
}

impl From<&anyhow::Error> for CallError {
    fn from(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<Error>() {
            Some(Error::WorkerBusy) => CallError::WorkerBusy,
            Some(Error::NoAvailableWorker) => CallError::NoAvailableWorker,
            Some(Error::NoWorkerHasSector) => CallError::NoWorkerHasSector,
            _ => CallError::Other(format!("{:#}", err)),
        }
    }
}

impl From<anyhow::Error> for CallError {
    fn from(err: anyhow::Error) -> Self {
        CallError::from(&err)
    }
}

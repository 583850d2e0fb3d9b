// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a single sector. Serialized by name so that persisted
/// records stay readable across restarts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SectorState {
    #[default]
    Undefined,

    // happy path
    /// Sector not in the seal store, and not on chain.
    Packing,
    PreCommit1,
    /// Waiting for the PreCommit1 output, computed out of process.
    FinishPreCommit1,
    PreCommit2,
    FinishPreCommit2,
    /// On-chain pre-commit.
    PreCommitting,
    /// Waiting for the pre-commit message to land on chain.
    PreCommitWait,
    /// Waiting for the interactive randomness seed.
    WaitSeed,
    Commit1,
    FinishCommit1,
    Commit2,
    FinishCommit2,
    Committing,
    /// Waiting for the prove-commit message to land on chain.
    CommitWait,
    FinalizeSector,
    Proving,

    // error modes
    FailedUnrecoverable,
    SealPreCommit1Failed,
    SealPreCommit2Failed,
    PreCommitFailed,
    ComputeProofFailed,
    CommitFailed,
    FinalizeFailed,
    PackingFailed,

    // faults
    /// Sector is corrupted or gone for some reason.
    Faulty,
    /// Sector has been declared as a fault on chain.
    FaultReported,
    FaultedFinal,
}

impl fmt::Display for SectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

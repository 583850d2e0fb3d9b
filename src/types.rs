// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::chain::TipSetToken;
use crate::constants::SECTOR_LOG_CAP;
use crate::sector_state::SectorState;
use cid::Cid;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::piece::{PieceInfo, UnpaddedPieceSize};
use fvm_shared::randomness::Randomness;
use fvm_shared::sector::{RegisteredSealProof, SectorNumber};
use serde::{Deserialize, Serialize};

/// Randomness gating the PreCommit phases.
pub type SealRandomness = Randomness;
/// Randomness gating the Commit phases, sampled after pre-commit landed.
pub type InteractiveSealRandomness = Randomness;

/// Opaque output of the PreCommit1 phase, input to PreCommit2.
pub type PreCommit1Out = Vec<u8>;
/// Opaque output of the Commit1 phase, input to Commit2.
pub type Commit1Out = Vec<u8>;
/// Aggregated seal proof bytes.
pub type Proof = Vec<u8>;

pub type UnpaddedByteIndex = u64;

/// Sealed and unsealed content commitments produced by PreCommit2.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorCids {
    pub sealed: Cid,
    pub unsealed: Cid,
}

/// Deal scheduling bounds from the market actor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealSchedule {
    pub start_epoch: ChainEpoch,
    pub end_epoch: ChainEpoch,
}

/// Links a piece to its on-chain storage deal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealInfo {
    pub deal_id: DealID,
    pub deal_schedule: DealSchedule,
}

/// A contiguous range of (user or filler) data within a sector. Insertion
/// order is the sealing order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Piece {
    pub piece: PieceInfo,
    /// Filler pieces don't have deals associated with them.
    pub deal_info: Option<DealInfo>,
}

/// Allocator of fresh sector numbers.
pub trait SectorIdCounter: Send + Sync {
    fn next(&self) -> Result<SectorNumber, crate::errors::Error>;
}

/// One entry of the per-sector audit trail.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorLog {
    /// Unix seconds.
    pub timestamp: u64,
    pub trace: String,
    pub message: String,
    /// `"event;<EventName>"` for planned events.
    pub kind: String,
}

/// The single durable record per sector. Exclusively owned by the sector's
/// state machine and persisted before every handler dispatch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SectorInfo {
    pub state: SectorState,
    pub sector_number: SectorNumber,
    pub sector_type: RegisteredSealProof,

    // packing
    pub pieces: Vec<Piece>,

    // pre-commit
    pub ticket_value: SealRandomness,
    pub ticket_epoch: ChainEpoch,
    #[serde(with = "serde_bytes")]
    pub pre_commit1_out: PreCommit1Out,
    /// The stored `pre_commit1_out` is still valid and a retry may reuse it
    /// instead of recomputing.
    pub previous_pre_commit1_out: bool,
    /// PreCommit2 failures since the last fresh ticket.
    pub pre_commit2_fails: u64,
    pub comm_d: Option<Cid>,
    pub comm_r: Option<Cid>,
    pub pre_commit_message: Option<Cid>,
    pub pre_commit_tipset: TipSetToken,

    // commit
    pub seed_value: InteractiveSealRandomness,
    pub seed_epoch: ChainEpoch,
    #[serde(with = "serde_bytes")]
    pub commit1_out: Commit1Out,
    pub previous_commit1_out: bool,
    #[serde(with = "serde_bytes")]
    pub proof: Proof,
    pub commit_message: Option<Cid>,
    /// Count of rejected commit proofs.
    pub invalid_proofs: u64,

    // faults
    pub fault_report_msg: Option<Cid>,

    pub log: Vec<SectorLog>,
}

impl Default for SectorInfo {
    fn default() -> Self {
        Self {
            state: SectorState::Undefined,
            sector_number: 0,
            sector_type: RegisteredSealProof::Invalid(0),
            pieces: Vec::new(),
            ticket_value: Randomness(Vec::new()),
            ticket_epoch: 0,
            pre_commit1_out: Vec::new(),
            previous_pre_commit1_out: false,
            pre_commit2_fails: 0,
            comm_d: None,
            comm_r: None,
            pre_commit_message: None,
            pre_commit_tipset: Vec::new(),
            seed_value: Randomness(Vec::new()),
            seed_epoch: 0,
            commit1_out: Vec::new(),
            previous_commit1_out: false,
            proof: Vec::new(),
            commit_message: None,
            invalid_proofs: 0,
            fault_report_msg: None,
            log: Vec::new(),
        }
    }
}

impl SectorInfo {
    pub fn piece_infos(&self) -> Vec<PieceInfo> {
        self.pieces.iter().map(|p| p.piece.clone()).collect()
    }

    pub fn deal_ids(&self) -> Vec<DealID> {
        self.pieces
            .iter()
            .filter_map(|p| p.deal_info.as_ref().map(|d| d.deal_id))
            .collect()
    }

    pub fn existing_piece_sizes(&self) -> Vec<UnpaddedPieceSize> {
        self.pieces
            .iter()
            .map(|p| p.piece.size.unpadded())
            .collect()
    }

    /// Append an entry to the audit trail, dropping the oldest entries past
    /// the cap.
    pub(crate) fn append_log(&mut self, entry: SectorLog) {
        self.log.push(entry);
        if self.log.len() > SECTOR_LOG_CAP {
            let excess = self.log.len() - SECTOR_LOG_CAP;
            self.log.drain(..excess);
        }
    }
}

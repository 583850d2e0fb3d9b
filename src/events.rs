// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Events driving the per-sector state machine. Events come in two
//! capability flavors: plain mutators, applied only when the current state
//! expects them, and global mutators (`SectorRestart`, `SectorForceState`,
//! `SectorFatalError`), evaluated before any per-state planning.

use crate::chain::TipSetToken;
use crate::config::SealingConfig;
use crate::constants::{seal_randomness_lookback_limit, EPOCH_DURATION_SECONDS};
use crate::errors::CallError;
use crate::sector_state::SectorState;
use crate::types::{
    Commit1Out, InteractiveSealRandomness, Piece, PreCommit1Out, Proof, SealRandomness, SectorInfo,
};
use cid::Cid;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::piece::PieceInfo;
use fvm_shared::sector::{RegisteredSealProof, SectorNumber};
use serde::{Deserialize, Serialize};
use tracing::error;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SealingEvent {
    // Global events
    /// No-op which nevertheless re-dispatches the handler of the current
    /// state. Injected for every known sector on restart.
    SectorRestart,
    /// Logged, interrupts the batch, does not change state unless the
    /// config says otherwise. The operator resolves it with a retry event
    /// or `SectorForceState`.
    SectorFatalError { error: CallError },
    SectorForceState { state: SectorState },

    // Normal path
    SectorStart {
        id: SectorNumber,
        sector_type: RegisteredSealProof,
        pieces: Vec<Piece>,
    },
    SectorPacked { filler_pieces: Vec<PieceInfo> },
    SectorPreCommit1 {
        ticket_value: SealRandomness,
        ticket_epoch: ChainEpoch,
    },
    SectorFinishPreCommit1 {
        #[serde(with = "serde_bytes")]
        pre_commit1_out: PreCommit1Out,
    },
    SectorPreCommit2,
    SectorFinishPreCommit2 { sealed: Cid, unsealed: Cid },
    SectorPreCommitted { message: Cid },
    SectorPreCommitLanded { tipset: TipSetToken },
    SectorSeedReady {
        seed_value: InteractiveSealRandomness,
        seed_epoch: ChainEpoch,
    },
    SectorCommit1,
    SectorFinishCommit1 {
        #[serde(with = "serde_bytes")]
        commit1_out: Commit1Out,
    },
    SectorCommit2,
    SectorFinishCommit2 {
        #[serde(with = "serde_bytes")]
        proof: Proof,
    },
    SectorCommitted { message: Cid },
    SectorProving,
    SectorFinalized,

    // Failures
    SectorPackingFailed { error: CallError },
    SectorSealPreCommit1Failed { error: CallError },
    SectorSealPreCommit2Failed { error: CallError },
    SectorChainPreCommitFailed { error: CallError },
    SectorComputeProofFailed { error: CallError },
    SectorCommitFailed { error: CallError },
    SectorFinalizeFailed { error: CallError },
    SectorFailedUnrecoverable { error: CallError },

    // Failed state recovery
    SectorRetrySealPreCommit1,
    SectorRetrySealPreCommit2,
    SectorRetryPreCommit,
    SectorRetryWaitSeed,
    SectorRetryComputeProof,
    SectorRetryInvalidProof,
    SectorRetryFinalize,

    // Faults
    SectorFaulty,
    SectorFaultReported { report_msg: Cid },
    SectorFaultedFinal,
}

impl SealingEvent {
    pub fn name(&self) -> &'static str {
        use SealingEvent::*;
        match self {
            SectorRestart => "SectorRestart",
            SectorFatalError { .. } => "SectorFatalError",
            SectorForceState { .. } => "SectorForceState",
            SectorStart { .. } => "SectorStart",
            SectorPacked { .. } => "SectorPacked",
            SectorPreCommit1 { .. } => "SectorPreCommit1",
            SectorFinishPreCommit1 { .. } => "SectorFinishPreCommit1",
            SectorPreCommit2 => "SectorPreCommit2",
            SectorFinishPreCommit2 { .. } => "SectorFinishPreCommit2",
            SectorPreCommitted { .. } => "SectorPreCommitted",
            SectorPreCommitLanded { .. } => "SectorPreCommitLanded",
            SectorSeedReady { .. } => "SectorSeedReady",
            SectorCommit1 => "SectorCommit1",
            SectorFinishCommit1 { .. } => "SectorFinishCommit1",
            SectorCommit2 => "SectorCommit2",
            SectorFinishCommit2 { .. } => "SectorFinishCommit2",
            SectorCommitted { .. } => "SectorCommitted",
            SectorProving => "SectorProving",
            SectorFinalized => "SectorFinalized",
            SectorPackingFailed { .. } => "SectorPackingFailed",
            SectorSealPreCommit1Failed { .. } => "SectorSealPreCommit1Failed",
            SectorSealPreCommit2Failed { .. } => "SectorSealPreCommit2Failed",
            SectorChainPreCommitFailed { .. } => "SectorChainPreCommitFailed",
            SectorComputeProofFailed { .. } => "SectorComputeProofFailed",
            SectorCommitFailed { .. } => "SectorCommitFailed",
            SectorFinalizeFailed { .. } => "SectorFinalizeFailed",
            SectorFailedUnrecoverable { .. } => "SectorFailedUnrecoverable",
            SectorRetrySealPreCommit1 => "SectorRetrySealPreCommit1",
            SectorRetrySealPreCommit2 => "SectorRetrySealPreCommit2",
            SectorRetryPreCommit => "SectorRetryPreCommit",
            SectorRetryWaitSeed => "SectorRetryWaitSeed",
            SectorRetryComputeProof => "SectorRetryComputeProof",
            SectorRetryInvalidProof => "SectorRetryInvalidProof",
            SectorRetryFinalize => "SectorRetryFinalize",
            SectorFaulty => "SectorFaulty",
            SectorFaultReported { .. } => "SectorFaultReported",
            SectorFaultedFinal => "SectorFaultedFinal",
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(
            self,
            SealingEvent::SectorRestart
                | SealingEvent::SectorFatalError { .. }
                | SealingEvent::SectorForceState { .. }
        )
    }

    /// The error carried by a failure event, if any.
    pub fn error(&self) -> Option<&CallError> {
        use SealingEvent::*;
        match self {
            SectorFatalError { error }
            | SectorPackingFailed { error }
            | SectorSealPreCommit1Failed { error }
            | SectorSealPreCommit2Failed { error }
            | SectorChainPreCommitFailed { error }
            | SectorComputeProofFailed { error }
            | SectorCommitFailed { error }
            | SectorFinalizeFailed { error }
            | SectorFailedUnrecoverable { error } => Some(error),
            _ => None,
        }
    }

    /// Applies a global mutator. Returns true if event processing should
    /// be interrupted.
    pub(crate) fn apply_global(&self, state: &mut SectorInfo, config: &SealingConfig) -> bool {
        match self {
            SealingEvent::SectorRestart => false,
            SealingEvent::SectorFatalError { error } => {
                error!(
                    sector = state.sector_number,
                    "Fatal error on sector: {}", error
                );
                if config.fatal_error_forces_failed {
                    state.state = SectorState::FailedUnrecoverable;
                }
                true
            }
            SealingEvent::SectorForceState { state: target } => {
                state.state = *target;
                true
            }
            _ => false,
        }
    }

    /// Applies the event's mutation to the sector record. Only called once
    /// the planner has matched the event against the current state.
    pub(crate) fn apply(&self, state: &mut SectorInfo, config: &SealingConfig) {
        use SealingEvent::*;
        match self {
            SectorStart {
                id,
                sector_type,
                pieces,
            } => {
                state.sector_number = *id;
                state.sector_type = *sector_type;
                state.pieces = pieces.clone();
            }
            SectorPacked { filler_pieces } => {
                state.pieces.extend(filler_pieces.iter().map(|p| Piece {
                    piece: p.clone(),
                    // filler pieces don't have deals associated with them
                    deal_info: None,
                }));
            }
            SectorPreCommit1 {
                ticket_value,
                ticket_epoch,
            } => {
                state.ticket_value = ticket_value.clone();
                state.ticket_epoch = *ticket_epoch;
                // fresh ticket, nothing derived from the old one survives
                state.pre_commit2_fails = 0;
                state.previous_pre_commit1_out = false;
            }
            SectorFinishPreCommit1 { pre_commit1_out } => {
                state.pre_commit1_out = pre_commit1_out.clone();
                state.previous_pre_commit1_out = false;
            }
            SectorFinishPreCommit2 { sealed, unsealed } => {
                state.comm_r = Some(*sealed);
                state.comm_d = Some(*unsealed);
            }
            SectorPreCommitted { message } => {
                state.pre_commit_message = Some(*message);
            }
            SectorPreCommitLanded { tipset } => {
                state.pre_commit_tipset = tipset.clone();
            }
            SectorSeedReady {
                seed_value,
                seed_epoch,
            } => {
                state.seed_value = seed_value.clone();
                state.seed_epoch = *seed_epoch;
            }
            SectorFinishCommit1 { commit1_out } => {
                state.commit1_out = commit1_out.clone();
                state.previous_commit1_out = false;
            }
            SectorCommit2 => {
                // the Commit1 output has been consumed, drop it to keep the
                // persisted record small
                state.commit1_out = Vec::new();
            }
            SectorFinishCommit2 { proof } => {
                state.proof = proof.clone();
            }
            SectorCommitted { message } => {
                state.commit_message = Some(*message);
            }
            SectorSealPreCommit1Failed { .. } => {
                state.invalid_proofs = 0;
                state.previous_pre_commit1_out = false;
                state.previous_commit1_out = false;
            }
            SectorSealPreCommit2Failed { error } => {
                state.pre_commit2_fails += 1;
                state.previous_pre_commit1_out = error.is_transient()
                    && !state.pre_commit1_out.is_empty()
                    && within_reuse_window(state, config);
            }
            SectorComputeProofFailed { error } => {
                state.previous_commit1_out = error.is_transient()
                    && !state.commit1_out.is_empty()
                    && within_reuse_window(state, config);
            }
            SectorRetryInvalidProof => {
                state.invalid_proofs += 1;
            }
            SectorFaultReported { report_msg } => {
                state.fault_report_msg = Some(*report_msg);
            }
            _ => {}
        }
    }

    /// Event serialized for the audit log, with the large opaque payloads
    /// elided.
    pub(crate) fn log_message(&self) -> String {
        let elided = match self {
            SealingEvent::SectorFinishPreCommit1 { .. } => SealingEvent::SectorFinishPreCommit1 {
                pre_commit1_out: b"ellipsis...".to_vec(),
            },
            SealingEvent::SectorFinishCommit1 { .. } => SealingEvent::SectorFinishCommit1 {
                commit1_out: b"ellipsis...".to_vec(),
            },
            other => other.clone(),
        };
        serde_json::to_string(&elided).unwrap_or_else(|e| format!("<marshaling event: {}>", e))
    }
}

/// True while a transient failure is still early enough within the ticket's
/// lookback window for outputs derived from that ticket to be worth keeping.
fn within_reuse_window(state: &SectorInfo, config: &SealingConfig) -> bool {
    let window = seal_randomness_lookback_limit(state.sector_type) as u64
        * EPOCH_DURATION_SECONDS as u64
        * config.reuse_window_num
        / config.reuse_window_den.max(1);
    state.pre_commit2_fails * config.min_retry_time.as_secs() < window
}

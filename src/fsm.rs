// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The planner: a pure transition function from `(state, events)` to the
//! next state. Handlers are dispatched separately, after the planned record
//! has been persisted.

use crate::config::SealingConfig;
use crate::errors::Error;
use crate::events::SealingEvent;
use crate::sector_state::SectorState;
use crate::types::{SectorInfo, SectorLog};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Plan a batch of events against the sector record, mutating it in place.
/// Every event is recorded in the audit log first; on a planning error the
/// record is left untouched apart from that log.
pub(crate) fn plan_events(
    config: &SealingConfig,
    events: &[SealingEvent],
    state: &mut SectorInfo,
) -> Result<(), Error> {
    for event in events {
        state.append_log(SectorLog {
            timestamp: unix_now(),
            kind: format!("event;{}", event.name()),
            message: event.log_message(),
            trace: event.error().map(|e| e.to_string()).unwrap_or_default(),
        });
    }

    match state.state {
        SectorState::Committing => plan_committing(config, events, state),
        SectorState::FaultedFinal | SectorState::FailedUnrecoverable => {
            Err(Error::FinalState(state.state))
        }
        _ => plan_one(config, events, state),
    }
}

/// The single-event planner used by every state except `Committing`:
/// global mutators first, then exactly one event matched against the
/// state's transition table.
fn plan_one(
    config: &SealingConfig,
    events: &[SealingEvent],
    state: &mut SectorInfo,
) -> Result<(), Error> {
    if events.len() != 1 {
        for event in events {
            if event.is_global() {
                event.apply_global(state, config);
                return Ok(());
            }
        }
        return Err(Error::MultipleEvents(state.state));
    }

    let event = &events[0];
    if event.is_global() {
        event.apply_global(state, config);
        return Ok(());
    }

    let Some(next) = transition(state.state, event) else {
        return Err(Error::UnexpectedEvent {
            state: state.state,
            event: event.name(),
        });
    };

    if let Some(err) = event.error() {
        warn!(
            sector = state.sector_number,
            "got error event {}: {}",
            event.name(),
            err
        );
    }

    event.apply(state, config);
    state.state = next;
    Ok(())
}

/// `Committing` is the single state which plans whole batches, because
/// pre-commit and seed notifications can race with commit completion.
fn plan_committing(
    config: &SealingConfig,
    events: &[SealingEvent],
    state: &mut SectorInfo,
) -> Result<(), Error> {
    use SealingEvent as E;

    for event in events {
        if event.is_global() {
            if event.apply_global(state, config) {
                return Ok(());
            }
            continue;
        }
        match event {
            // the normal case
            E::SectorCommitted { .. } => {
                event.apply(state, config);
                state.state = SectorState::CommitWait;
            }
            // seed changed :/
            E::SectorSeedReady {
                seed_value,
                seed_epoch,
            } => {
                if *seed_epoch == state.seed_epoch && seed_value.0 == state.seed_value.0 {
                    warn!(
                        sector = state.sector_number,
                        "planCommitting: got SectorSeedReady, but the seed didn't change"
                    );
                    continue; // or it didn't!
                }
                warn!(sector = state.sector_number, "planCommitting: commit seed changed");
                event.apply(state, config);
                state.state = SectorState::Commit1;
                return Ok(());
            }
            E::SectorComputeProofFailed { .. } => {
                state.state = SectorState::ComputeProofFailed;
            }
            E::SectorSealPreCommit1Failed { .. } | E::SectorCommitFailed { .. } => {
                state.state = SectorState::CommitFailed;
            }
            other => {
                return Err(Error::UnexpectedEvent {
                    state: SectorState::Committing,
                    event: other.name(),
                })
            }
        }
    }
    Ok(())
}

/// Per-state transition table: which event is accepted in which state, and
/// the state it leads to. `None` means the event is not planned for.
fn transition(state: SectorState, event: &SealingEvent) -> Option<SectorState> {
    use SealingEvent as E;
    use SectorState as S;

    Some(match (state, event) {
        // Happy path
        (S::Undefined, E::SectorStart { .. }) => S::Packing,
        (S::Packing, E::SectorPacked { .. }) => S::PreCommit1,

        (S::PreCommit1, E::SectorPreCommit1 { .. }) => S::FinishPreCommit1,
        // skip precommit1 and use the previous result
        (S::PreCommit1, E::SectorFinishPreCommit1 { .. }) => S::PreCommit2,
        (S::PreCommit1, E::SectorSealPreCommit1Failed { .. }) => S::SealPreCommit1Failed,
        (S::PreCommit1, E::SectorPackingFailed { .. }) => S::PackingFailed,

        // wait for external send
        (S::FinishPreCommit1, E::SectorFinishPreCommit1 { .. }) => S::PreCommit2,
        (S::FinishPreCommit1, E::SectorSealPreCommit1Failed { .. }) => S::SealPreCommit1Failed,

        (S::PreCommit2, E::SectorPreCommit2) => S::FinishPreCommit2,
        (S::PreCommit2, E::SectorSealPreCommit2Failed { .. }) => S::SealPreCommit2Failed,
        (S::PreCommit2, E::SectorPackingFailed { .. }) => S::PackingFailed,

        // wait for external send
        (S::FinishPreCommit2, E::SectorFinishPreCommit2 { .. }) => S::PreCommitting,
        (S::FinishPreCommit2, E::SectorSealPreCommit2Failed { .. }) => S::SealPreCommit2Failed,

        (S::PreCommitting, E::SectorSealPreCommit1Failed { .. }) => S::SealPreCommit1Failed,
        (S::PreCommitting, E::SectorPreCommitted { .. }) => S::PreCommitWait,
        (S::PreCommitting, E::SectorChainPreCommitFailed { .. }) => S::PreCommitFailed,
        (S::PreCommitting, E::SectorPreCommitLanded { .. }) => S::WaitSeed,

        (S::PreCommitWait, E::SectorChainPreCommitFailed { .. }) => S::PreCommitFailed,
        (S::PreCommitWait, E::SectorPreCommitLanded { .. }) => S::WaitSeed,

        (S::WaitSeed, E::SectorSeedReady { .. }) => S::Commit1,
        (S::WaitSeed, E::SectorChainPreCommitFailed { .. }) => S::PreCommitFailed,

        (S::Commit1, E::SectorCommit1) => S::FinishCommit1,
        // skip commit1 and use the previous result
        (S::Commit1, E::SectorFinishCommit1 { .. }) => S::Commit2,
        (S::Commit1, E::SectorComputeProofFailed { .. }) => S::ComputeProofFailed,

        // wait for external send
        (S::FinishCommit1, E::SectorFinishCommit1 { .. }) => S::Commit2,
        (S::FinishCommit1, E::SectorComputeProofFailed { .. }) => S::ComputeProofFailed,

        (S::Commit2, E::SectorCommit2) => S::FinishCommit2,
        (S::Commit2, E::SectorComputeProofFailed { .. }) => S::ComputeProofFailed,

        // wait for external send
        (S::FinishCommit2, E::SectorFinishCommit2 { .. }) => S::Committing,
        (S::FinishCommit2, E::SectorComputeProofFailed { .. }) => S::ComputeProofFailed,

        // `Committing` is handled by `plan_committing`

        (S::CommitWait, E::SectorProving) => S::FinalizeSector,
        (S::CommitWait, E::SectorCommitFailed { .. }) => S::CommitFailed,

        (S::FinalizeSector, E::SectorFinalized) => S::Proving,
        (S::FinalizeSector, E::SectorFinalizeFailed { .. }) => S::FinalizeFailed,

        (S::Proving, E::SectorFaultReported { .. }) => S::FaultReported,
        (S::Proving, E::SectorFaulty) => S::Faulty,

        // Handled failure modes
        (S::SealPreCommit1Failed, E::SectorRetrySealPreCommit1) => S::PreCommit1,

        (S::SealPreCommit2Failed, E::SectorRetrySealPreCommit1) => S::PreCommit1,
        (S::SealPreCommit2Failed, E::SectorRetrySealPreCommit2) => S::PreCommit2,

        (S::PreCommitFailed, E::SectorRetryPreCommit) => S::PreCommitting,
        (S::PreCommitFailed, E::SectorRetryWaitSeed) => S::WaitSeed,
        (S::PreCommitFailed, E::SectorSealPreCommit1Failed { .. }) => S::SealPreCommit1Failed,
        (S::PreCommitFailed, E::SectorPreCommitLanded { .. }) => S::WaitSeed,

        (S::ComputeProofFailed, E::SectorRetryComputeProof) => S::Commit1,
        (S::ComputeProofFailed, E::SectorSealPreCommit1Failed { .. }) => S::SealPreCommit1Failed,
        (S::ComputeProofFailed, E::SectorFailedUnrecoverable { .. }) => S::FailedUnrecoverable,

        (S::CommitFailed, E::SectorSealPreCommit1Failed { .. }) => S::SealPreCommit1Failed,
        (S::CommitFailed, E::SectorRetryWaitSeed) => S::WaitSeed,
        (S::CommitFailed, E::SectorRetryComputeProof) => S::Commit1,
        (S::CommitFailed, E::SectorRetryInvalidProof) => S::Commit1,
        // commit message already landed
        (S::CommitFailed, E::SectorProving) => S::FinalizeSector,
        (S::CommitFailed, E::SectorFailedUnrecoverable { .. }) => S::FailedUnrecoverable,

        (S::FinalizeFailed, E::SectorRetryFinalize) => S::FinalizeSector,

        // Faults
        (S::Faulty, E::SectorFaultReported { .. }) => S::FaultReported,
        (S::FaultReported, E::SectorFaultedFinal) => S::FaultedFinal,

        _ => return None,
    })
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

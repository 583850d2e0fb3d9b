// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Happy-path state handlers. A handler performs the I/O its state calls
//! for (sealing worker, chain RPC) and reports every outcome as a
//! follow-up event; it never returns an error itself. `Finish*` states
//! have no handler, they park the sector until an external completion
//! event arrives.

use crate::chain::{
    DeclareFaultsParams, DomainSeparationTag, FaultDeclaration, MinerMethod, ProveCommitSectorParams,
    SectorPreCommitInfo, TipSetToken,
};
use crate::checks::CheckSealingError;
use crate::constants::{
    seal_randomness_lookback_limit, INTERACTIVE_POREP_CONFIDENCE, MESSAGE_GAS_LIMIT,
    PRE_COMMIT_CHALLENGE_DELAY, SEAL_RANDOMNESS_LOOKBACK,
};
use crate::db::Store;
use crate::errors::CallError;
use crate::events::SealingEvent;
use crate::garbage::filler_sizes;
use crate::machine::Context;
use crate::sealing::Sealing;
use crate::types::{SectorCids, SectorInfo};
use anyhow::anyhow;
use futures::FutureExt;
use fvm_ipld_bitfield::BitField;
use fvm_ipld_encoding::to_vec;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::piece::{PaddedPieceSize, UnpaddedPieceSize};
use fvm_shared::MethodNum;
use num_traits::Zero;
use tracing::{error, info, warn};

/// Send an event to the sector's own mailbox; failure means the machine is
/// shutting down and the event would be re-derived on restart anyway.
macro_rules! send {
    ($ctx:expr, $event:expr) => {
        if $ctx.send($event).is_err() {
            warn!(sector = $ctx.sector(), "handler event dropped, machine stopped");
            return;
        }
    };
}

pub(crate) use send;

impl<DB> Sealing<DB>
where
    DB: Store + Send + Sync + 'static,
{
    pub(crate) async fn handle_packing(&self, ctx: Context, sector: SectorInfo) {
        info!(
            sector = sector.sector_number,
            pieces = sector.pieces.len(),
            "Performing filling up rest of the sector"
        );

        let allocated: u64 = sector
            .pieces
            .iter()
            .map(|p| p.piece.size.unpadded().0)
            .sum();
        let ubytes = PaddedPieceSize(self.sealer.sector_size() as u64).unpadded();

        if allocated > ubytes.0 {
            send!(
                ctx,
                SealingEvent::SectorPackingFailed {
                    error: CallError::Other(format!(
                        "too much data in sector: {} > {}",
                        allocated, ubytes.0
                    )),
                }
            );
            return;
        }

        let fillers = filler_sizes(UnpaddedPieceSize(ubytes.0 - allocated));
        if !fillers.is_empty() {
            warn!(
                sector = sector.sector_number,
                fillers = fillers.len(),
                "Creating filler pieces"
            );
        }

        match self
            .pledge_pieces(
                self.miner_sector(sector.sector_number),
                sector.existing_piece_sizes(),
                &fillers,
            )
            .await
        {
            Ok(filler_pieces) => send!(ctx, SealingEvent::SectorPacked { filler_pieces }),
            Err(e) => send!(
                ctx,
                SealingEvent::SectorPackingFailed {
                    error: CallError::from(&e),
                }
            ),
        }
    }

    pub(crate) async fn handle_pre_commit1(&self, ctx: Context, sector: SectorInfo) {
        if let Err(err) = self.check_pieces(&sector).await {
            match err {
                CheckSealingError::Api(e) => {
                    error!(
                        sector = sector.sector_number,
                        "handlePreCommit1: api error, not proceeding: {}", e
                    );
                    return;
                }
                e => {
                    send!(
                        ctx,
                        SealingEvent::SectorPackingFailed {
                            error: CallError::Other(e.to_string()),
                        }
                    );
                    return;
                }
            }
        }

        let (tok, epoch) = match self.api.chain_head().await {
            Ok(v) => v,
            Err(e) => {
                send!(
                    ctx,
                    SealingEvent::SectorSealPreCommit1Failed {
                        error: CallError::from(&e),
                    }
                );
                return;
            }
        };

        // a previous PreCommit1 output survived whatever brought us back
        // here; skip the expensive compute while its ticket is still valid
        if sector.previous_pre_commit1_out
            && !sector.pre_commit1_out.is_empty()
            && epoch - sector.ticket_epoch < seal_randomness_lookback_limit(sector.sector_type)
        {
            info!(sector = sector.sector_number, "Reusing PreCommit1 output");
            send!(
                ctx,
                SealingEvent::SectorFinishPreCommit1 {
                    pre_commit1_out: sector.pre_commit1_out.clone(),
                }
            );
            return;
        }

        let ticket_epoch = epoch - SEAL_RANDOMNESS_LOOKBACK;
        let entropy = match to_vec(&self.maddr) {
            Ok(v) => v,
            Err(e) => {
                send!(
                    ctx,
                    SealingEvent::SectorSealPreCommit1Failed {
                        error: CallError::Other(format!("marshaling miner address: {}", e)),
                    }
                );
                return;
            }
        };
        let ticket = match self
            .api
            .chain_get_randomness(&tok, DomainSeparationTag::SealRandomness, ticket_epoch, &entropy)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                send!(
                    ctx,
                    SealingEvent::SectorSealPreCommit1Failed {
                        error: CallError::from(&e),
                    }
                );
                return;
            }
        };

        send!(
            ctx,
            SealingEvent::SectorPreCommit1 {
                ticket_value: ticket.clone(),
                ticket_epoch,
            }
        );

        match self
            .sealer
            .seal_pre_commit1(
                self.miner_sector(sector.sector_number),
                &ticket,
                &sector.piece_infos(),
            )
            .await
        {
            Ok(Some(pc1out)) => send!(
                ctx,
                SealingEvent::SectorFinishPreCommit1 {
                    pre_commit1_out: pc1out,
                }
            ),
            // an external worker took the job and will deliver
            // SectorFinishPreCommit1 itself
            Ok(None) => {}
            Err(e) => send!(
                ctx,
                SealingEvent::SectorSealPreCommit1Failed {
                    error: CallError::from(&e),
                }
            ),
        }
    }

    pub(crate) async fn handle_pre_commit2(&self, ctx: Context, sector: SectorInfo) {
        if sector.pre_commit1_out.is_empty() {
            send!(
                ctx,
                SealingEvent::SectorSealPreCommit1Failed {
                    error: CallError::Other("PreCommit1 output missing".into()),
                }
            );
            return;
        }

        match self
            .sealer
            .seal_pre_commit2(
                self.miner_sector(sector.sector_number),
                sector.pre_commit1_out.clone(),
            )
            .await
        {
            Ok(Some(cids)) => {
                send!(ctx, SealingEvent::SectorPreCommit2);
                send!(
                    ctx,
                    SealingEvent::SectorFinishPreCommit2 {
                        sealed: cids.sealed,
                        unsealed: cids.unsealed,
                    }
                );
            }
            Ok(None) => send!(ctx, SealingEvent::SectorPreCommit2),
            Err(e) => send!(
                ctx,
                SealingEvent::SectorSealPreCommit2Failed {
                    error: CallError::from(&e),
                }
            ),
        }
    }

    pub(crate) async fn handle_pre_committing(&self, ctx: Context, sector: SectorInfo) {
        let (tok, epoch) = match self.api.chain_head().await {
            Ok(v) => v,
            Err(e) => {
                send!(
                    ctx,
                    SealingEvent::SectorChainPreCommitFailed {
                        error: CallError::from(&e),
                    }
                );
                return;
            }
        };

        match self.check_precommit(&sector, &tok, epoch).await {
            Err(CheckSealingError::Api(e)) => {
                error!(
                    sector = sector.sector_number,
                    "handlePreCommitting: api error, not proceeding: {}", e
                );
                return;
            }
            Err(e @ CheckSealingError::BadCommD(_))
            | Err(e @ CheckSealingError::ExpiredTicket(_)) => {
                send!(
                    ctx,
                    SealingEvent::SectorSealPreCommit1Failed {
                        error: CallError::Other(e.to_string()),
                    }
                );
                return;
            }
            Err(CheckSealingError::PrecommitOnChain) => {
                // our pre-commit is already there, the message must have
                // landed while we weren't looking
                send!(ctx, SealingEvent::SectorPreCommitLanded { tipset: tok });
                return;
            }
            Err(e) => {
                send!(
                    ctx,
                    SealingEvent::SectorChainPreCommitFailed {
                        error: CallError::Other(e.to_string()),
                    }
                );
                return;
            }
            Ok(()) => {}
        }

        let Some(comm_r) = sector.comm_r else {
            send!(
                ctx,
                SealingEvent::SectorSealPreCommit1Failed {
                    error: CallError::Other("sector had no CommR at pre-commit time".into()),
                }
            );
            return;
        };

        let expiration = match self.pcp.expiration(&sector.pieces).await {
            Ok(v) => v,
            Err(e) => {
                send!(
                    ctx,
                    SealingEvent::SectorChainPreCommitFailed {
                        error: CallError::from(&e),
                    }
                );
                return;
            }
        };

        let params = SectorPreCommitInfo {
            seal_proof: sector.sector_type,
            sector_number: sector.sector_number,
            sealed_cid: comm_r,
            seal_rand_epoch: sector.ticket_epoch,
            deal_ids: sector.deal_ids(),
            expiration,
        };
        let enc = match to_vec(&params) {
            Ok(v) => v,
            Err(e) => {
                send!(
                    ctx,
                    SealingEvent::SectorChainPreCommitFailed {
                        error: CallError::Other(format!("could not serialize precommit params: {}", e)),
                    }
                );
                return;
            }
        };

        let deposit = match self
            .api
            .state_miner_initial_pledge_collateral(&self.maddr, sector.sector_number, &tok)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                send!(
                    ctx,
                    SealingEvent::SectorChainPreCommitFailed {
                        error: CallError::from(&e),
                    }
                );
                return;
            }
        };
        let worker = match self.api.state_miner_worker_address(&self.maddr, &tok).await {
            Ok(v) => v,
            Err(e) => {
                send!(
                    ctx,
                    SealingEvent::SectorChainPreCommitFailed {
                        error: CallError::from(&e),
                    }
                );
                return;
            }
        };

        info!(sector = sector.sector_number, "submitting precommit");
        match self
            .api
            .send_msg(
                &worker,
                &self.maddr,
                MinerMethod::PreCommitSector as MethodNum,
                deposit,
                TokenAmount::zero(),
                MESSAGE_GAS_LIMIT,
                enc,
            )
            .await
        {
            Ok(mcid) => send!(ctx, SealingEvent::SectorPreCommitted { message: mcid }),
            Err(e) => send!(
                ctx,
                SealingEvent::SectorChainPreCommitFailed {
                    error: CallError::from(&e),
                }
            ),
        }
    }

    pub(crate) async fn handle_pre_commit_wait(&self, ctx: Context, sector: SectorInfo) {
        let Some(msg) = sector.pre_commit_message else {
            send!(
                ctx,
                SealingEvent::SectorChainPreCommitFailed {
                    error: CallError::Other("precommit message was nil".into()),
                }
            );
            return;
        };

        info!(
            sector = sector.sector_number,
            "Sector precommitted, waiting for the message to land"
        );
        let lookup = match self.api.state_wait_msg(&msg).await {
            Ok(v) => v,
            Err(e) => {
                send!(
                    ctx,
                    SealingEvent::SectorChainPreCommitFailed {
                        error: CallError::from(&e),
                    }
                );
                return;
            }
        };

        if lookup.receipt.exit_code != ExitCode::OK {
            send!(
                ctx,
                SealingEvent::SectorChainPreCommitFailed {
                    error: CallError::Other(format!(
                        "precommit message failed with exit code {:?}",
                        lookup.receipt.exit_code
                    )),
                }
            );
            return;
        }

        send!(
            ctx,
            SealingEvent::SectorPreCommitLanded {
                tipset: lookup.tipset_tok,
            }
        );
    }

    pub(crate) async fn handle_wait_seed(&self, ctx: Context, sector: SectorInfo) {
        let (tok, _) = match self.api.chain_head().await {
            Ok(v) => v,
            Err(e) => {
                send!(
                    ctx,
                    SealingEvent::SectorChainPreCommitFailed {
                        error: CallError::from(&e),
                    }
                );
                return;
            }
        };
        let pci = match self
            .api
            .state_sector_precommit_info(&self.maddr, sector.sector_number, &tok)
            .await
        {
            Ok(Some(pci)) => pci,
            Ok(None) => {
                send!(
                    ctx,
                    SealingEvent::SectorChainPreCommitFailed {
                        error: CallError::Other("precommit info not found on chain".into()),
                    }
                );
                return;
            }
            Err(e) => {
                send!(
                    ctx,
                    SealingEvent::SectorChainPreCommitFailed {
                        error: CallError::from(&e),
                    }
                );
                return;
            }
        };

        let rand_height = pci.pre_commit_epoch + PRE_COMMIT_CHALLENGE_DELAY;
        info!(
            sector = sector.sector_number,
            height = rand_height,
            "Waiting for the interactive seed"
        );

        let api = self.api.clone();
        let maddr = self.maddr;
        let seed_ctx = ctx.clone();
        let handler = Box::new(move |tok: TipSetToken, _cur: ChainEpoch| {
            async move {
                let entropy = to_vec(&maddr)?;
                let rand = api
                    .chain_get_randomness(
                        &tok,
                        DomainSeparationTag::InteractiveSealChallengeSeed,
                        rand_height,
                        &entropy,
                    )
                    .await
                    .map_err(|e| {
                        anyhow!("failed to get randomness for computing seal proof: {:#}", e)
                    })?;
                seed_ctx.send(SealingEvent::SectorSeedReady {
                    seed_value: rand,
                    seed_epoch: rand_height,
                })?;
                Ok(())
            }
            .boxed()
        });
        let revert_sector = sector.sector_number;
        let revert = Box::new(move |_tok: TipSetToken| {
            async move {
                warn!(
                    sector = revert_sector,
                    "revert in interactive commit sector step"
                );
                Ok(())
            }
            .boxed()
        });

        if let Err(e) = self
            .events
            .chain_at(handler, revert, INTERACTIVE_POREP_CONFIDENCE, rand_height)
            .await
        {
            send!(
                ctx,
                SealingEvent::SectorChainPreCommitFailed {
                    error: CallError::from(&e),
                }
            );
        }
    }

    pub(crate) async fn handle_commit1(&self, ctx: Context, sector: SectorInfo) {
        // a previous Commit1 output survived a transient failure
        if sector.previous_commit1_out && !sector.commit1_out.is_empty() {
            info!(sector = sector.sector_number, "Reusing Commit1 output");
            send!(
                ctx,
                SealingEvent::SectorFinishCommit1 {
                    commit1_out: sector.commit1_out.clone(),
                }
            );
            return;
        }

        let (Some(comm_r), Some(comm_d)) = (sector.comm_r, sector.comm_d) else {
            send!(
                ctx,
                SealingEvent::SectorComputeProofFailed {
                    error: CallError::Other("sector had no commitments at commit time".into()),
                }
            );
            return;
        };
        let cids = SectorCids {
            sealed: comm_r,
            unsealed: comm_d,
        };

        match self
            .sealer
            .seal_commit1(
                self.miner_sector(sector.sector_number),
                &sector.ticket_value,
                &sector.seed_value,
                &sector.piece_infos(),
                &cids,
            )
            .await
        {
            Ok(Some(c1out)) => {
                send!(ctx, SealingEvent::SectorCommit1);
                send!(
                    ctx,
                    SealingEvent::SectorFinishCommit1 {
                        commit1_out: c1out,
                    }
                );
            }
            Ok(None) => send!(ctx, SealingEvent::SectorCommit1),
            Err(e) => send!(
                ctx,
                SealingEvent::SectorComputeProofFailed {
                    error: CallError::from(&e),
                }
            ),
        }
    }

    pub(crate) async fn handle_commit2(&self, ctx: Context, sector: SectorInfo) {
        if sector.commit1_out.is_empty() {
            send!(
                ctx,
                SealingEvent::SectorComputeProofFailed {
                    error: CallError::Other("Commit1 output missing".into()),
                }
            );
            return;
        }

        match self
            .sealer
            .seal_commit2(
                self.miner_sector(sector.sector_number),
                sector.commit1_out.clone(),
            )
            .await
        {
            Ok(Some(proof)) => {
                send!(ctx, SealingEvent::SectorCommit2);
                send!(ctx, SealingEvent::SectorFinishCommit2 { proof });
            }
            Ok(None) => send!(ctx, SealingEvent::SectorCommit2),
            Err(e) => send!(
                ctx,
                SealingEvent::SectorComputeProofFailed {
                    error: CallError::from(&e),
                }
            ),
        }
    }

    pub(crate) async fn handle_committing(&self, ctx: Context, sector: SectorInfo) {
        info!(
            sector = sector.sector_number,
            seed_epoch = sector.seed_epoch,
            ticket_epoch = sector.ticket_epoch,
            "submitting sector proof"
        );

        let (tok, _) = match self.api.chain_head().await {
            Ok(v) => v,
            Err(e) => {
                send!(
                    ctx,
                    SealingEvent::SectorCommitFailed {
                        error: CallError::from(&e),
                    }
                );
                return;
            }
        };

        let pci = match self
            .api
            .state_sector_precommit_info(&self.maddr, sector.sector_number, &tok)
            .await
        {
            Ok(Some(pci)) => pci,
            Ok(None) => {
                send!(
                    ctx,
                    SealingEvent::SectorCommitFailed {
                        error: CallError::Other("precommit info not found on chain".into()),
                    }
                );
                return;
            }
            Err(e) => {
                send!(
                    ctx,
                    SealingEvent::SectorCommitFailed {
                        error: CallError::from(&e),
                    }
                );
                return;
            }
        };

        let pledge = match self
            .api
            .state_miner_initial_pledge_collateral(&self.maddr, sector.sector_number, &tok)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                send!(
                    ctx,
                    SealingEvent::SectorCommitFailed {
                        error: CallError::from(&e),
                    }
                );
                return;
            }
        };
        // the pre-commit deposit stays locked, only top up the difference
        let mut collateral = pledge - pci.pre_commit_deposit;
        if collateral < TokenAmount::zero() {
            collateral = TokenAmount::zero();
        }

        let params = ProveCommitSectorParams {
            sector_number: sector.sector_number,
            proof: sector.proof.clone(),
        };
        let enc = match to_vec(&params) {
            Ok(v) => v,
            Err(e) => {
                send!(
                    ctx,
                    SealingEvent::SectorCommitFailed {
                        error: CallError::Other(format!("could not serialize commit params: {}", e)),
                    }
                );
                return;
            }
        };
        let worker = match self.api.state_miner_worker_address(&self.maddr, &tok).await {
            Ok(v) => v,
            Err(e) => {
                send!(
                    ctx,
                    SealingEvent::SectorCommitFailed {
                        error: CallError::from(&e),
                    }
                );
                return;
            }
        };

        match self
            .api
            .send_msg(
                &worker,
                &self.maddr,
                MinerMethod::ProveCommitSector as MethodNum,
                collateral,
                TokenAmount::zero(),
                MESSAGE_GAS_LIMIT,
                enc,
            )
            .await
        {
            Ok(mcid) => send!(ctx, SealingEvent::SectorCommitted { message: mcid }),
            Err(e) => send!(
                ctx,
                SealingEvent::SectorCommitFailed {
                    error: CallError::from(&e),
                }
            ),
        }
    }

    pub(crate) async fn handle_commit_wait(&self, ctx: Context, sector: SectorInfo) {
        let Some(msg) = sector.commit_message else {
            send!(
                ctx,
                SealingEvent::SectorCommitFailed {
                    error: CallError::Other("commit message was nil".into()),
                }
            );
            return;
        };

        let lookup = match self.api.state_wait_msg(&msg).await {
            Ok(v) => v,
            Err(e) => {
                send!(
                    ctx,
                    SealingEvent::SectorCommitFailed {
                        error: CallError::from(&e),
                    }
                );
                return;
            }
        };

        if lookup.receipt.exit_code != ExitCode::OK {
            send!(
                ctx,
                SealingEvent::SectorCommitFailed {
                    error: CallError::Other(format!(
                        "submitting sector proof failed with exit code {:?}",
                        lookup.receipt.exit_code
                    )),
                }
            );
            return;
        }

        send!(ctx, SealingEvent::SectorProving);
    }

    pub(crate) async fn handle_finalize_sector(&self, ctx: Context, sector: SectorInfo) {
        match self
            .sealer
            .finalize_sector(self.miner_sector(sector.sector_number))
            .await
        {
            Ok(()) => send!(ctx, SealingEvent::SectorFinalized),
            Err(e) => send!(
                ctx,
                SealingEvent::SectorFinalizeFailed {
                    error: CallError::from(&e),
                }
            ),
        }
    }

    pub(crate) async fn handle_faulty(&self, ctx: Context, sector: SectorInfo) {
        let (tok, _) = match self.api.chain_head().await {
            Ok(v) => v,
            Err(e) => {
                error!(sector = sector.sector_number, "handleFaulty: {:#}", e);
                return;
            }
        };

        // find the proving deadline this sector is assigned to
        let deadlines = match self.api.state_miner_deadlines(&self.maddr, &tok).await {
            Ok(v) => v,
            Err(e) => {
                error!(sector = sector.sector_number, "handleFaulty: {:#}", e);
                return;
            }
        };
        let Some(deadline) = deadlines
            .iter()
            .position(|assigned| assigned.get(sector.sector_number))
        else {
            error!(
                sector = sector.sector_number,
                "handleFaulty: sector not found in any deadline"
            );
            return;
        };

        let mut sectors = BitField::new();
        sectors.set(sector.sector_number);
        let params = DeclareFaultsParams {
            faults: vec![FaultDeclaration {
                deadline: deadline as u64,
                sectors,
            }],
        };
        let enc = match to_vec(&params) {
            Ok(v) => v,
            Err(e) => {
                error!(
                    sector = sector.sector_number,
                    "could not serialize declare faults params: {}", e
                );
                return;
            }
        };
        let worker = match self.api.state_miner_worker_address(&self.maddr, &tok).await {
            Ok(v) => v,
            Err(e) => {
                error!(sector = sector.sector_number, "handleFaulty: {:#}", e);
                return;
            }
        };

        match self
            .api
            .send_msg(
                &worker,
                &self.maddr,
                MinerMethod::DeclareFaults as MethodNum,
                TokenAmount::zero(),
                TokenAmount::zero(),
                MESSAGE_GAS_LIMIT,
                enc,
            )
            .await
        {
            Ok(mcid) => send!(ctx, SealingEvent::SectorFaultReported { report_msg: mcid }),
            Err(e) => {
                // stay Faulty, restart or the operator gets another go
                error!(
                    sector = sector.sector_number,
                    "failed to declare fault on chain: {:#}", e
                );
            }
        }
    }

    pub(crate) async fn handle_fault_reported(&self, ctx: Context, sector: SectorInfo) {
        let Some(msg) = sector.fault_report_msg else {
            error!(
                sector = sector.sector_number,
                "entered FaultReported without a report message"
            );
            return;
        };

        match self.api.state_wait_msg(&msg).await {
            Ok(lookup) if lookup.receipt.exit_code == ExitCode::OK => {
                send!(ctx, SealingEvent::SectorFaultedFinal);
            }
            Ok(lookup) => error!(
                sector = sector.sector_number,
                "declaring sector fault failed with exit code {:?}", lookup.receipt.exit_code
            ),
            Err(e) => error!(
                sector = sector.sector_number,
                "waiting for fault declaration: {:#}", e
            ),
        }
    }
}

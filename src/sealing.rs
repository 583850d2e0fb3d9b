// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::api::{Events, SealingApi};
use crate::config::SealingConfig;
use crate::constants::seal_proof_from_sector_size;
use crate::db::Store;
use crate::errors::Error;
use crate::events::SealingEvent;
use crate::fsm;
use crate::group::StateGroup;
use crate::machine::{Context, Planner};
use crate::precommit_policy::PreCommitPolicy;
use crate::sealer::{PieceReader, SectorManager};
use crate::sector_state::SectorState;
use crate::types::{DealInfo, Piece, SectorIdCounter, SectorInfo};
use async_trait::async_trait;
use fvm_shared::address::Address;
use fvm_shared::piece::UnpaddedPieceSize;
use fvm_shared::sector::{RegisteredSealProof, SectorID, SectorNumber};
use fvm_shared::ActorID;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Drives the lifecycle of every storage sector of one miner: packing,
/// the multi-phase sealing pipeline, on-chain (pre-)commitment,
/// finalization and fault reporting. Construct with [`Sealing::new`], feed
/// it pieces via [`Sealing::seal_piece`] or [`Sealing::pledge_sector`] and
/// call [`Sealing::run`] after a restart to resume interrupted work.
pub struct Sealing<DB>
where
    DB: Store + Send + Sync + 'static,
{
    pub(crate) api: Arc<dyn SealingApi>,
    pub(crate) events: Arc<dyn Events>,

    pub(crate) maddr: Address,
    miner_id: ActorID,

    pub(crate) sealer: Arc<dyn SectorManager>,
    sectors: StateGroup<DB, Sealing<DB>>,
    pub(crate) sc: Arc<dyn SectorIdCounter>,

    pub(crate) pcp: Arc<dyn PreCommitPolicy>,
    pub(crate) config: SealingConfig,
}

impl<DB> Sealing<DB>
where
    DB: Store + Send + Sync + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn SealingApi>,
        events: Arc<dyn Events>,
        maddr: Address,
        ds: Arc<DB>,
        sealer: Arc<dyn SectorManager>,
        sc: Arc<dyn SectorIdCounter>,
        pcp: Arc<dyn PreCommitPolicy>,
        config: SealingConfig,
    ) -> Result<Arc<Self>, Error> {
        let miner_id = maddr
            .id()
            .map_err(|e| Error::Other(format!("miner address must be an ID address: {}", e)))?;

        Ok(Arc::new_cyclic(|weak| Sealing {
            api,
            events,
            maddr,
            miner_id,
            sealer,
            sectors: StateGroup::new(ds, weak.clone()),
            sc,
            pcp,
            config,
        }))
    }

    /// Resume every known sector: each one gets a `SectorRestart`, which
    /// re-dispatches the handler of the state it was persisted in.
    pub fn run(&self) -> Result<(), Error> {
        self.restart_sectors()
    }

    fn restart_sectors(&self) -> Result<(), Error> {
        for sector in self.list_sectors()? {
            if let Err(e) = self
                .sectors
                .send(sector.sector_number, SealingEvent::SectorRestart)
            {
                error!(
                    sector = sector.sector_number,
                    "restarting sector: {}", e
                );
            }
        }
        Ok(())
    }

    /// Stop all sector machines; in-flight handlers are cancelled.
    pub async fn stop(&self) {
        for machine in self.sectors.stop() {
            machine.stop().await;
        }
    }

    /// Deliver an event to a sector's state machine. External workers use
    /// this to hand back `SectorFinish*` completions.
    pub fn send(&self, id: SectorNumber, event: SealingEvent) -> Result<(), Error> {
        self.sectors.send(id, event)
    }

    pub fn list_sectors(&self) -> Result<Vec<SectorInfo>, Error> {
        self.sectors.list_sectors()
    }

    pub fn force_sector_state(&self, id: SectorNumber, state: SectorState) -> Result<(), Error> {
        self.sectors
            .send(id, SealingEvent::SectorForceState { state })
    }

    /// Start sealing a sector from a set of pieces, which either have a
    /// deal associated with them (storage deals) or none (pledge data).
    pub fn new_sector(
        &self,
        sid: SectorNumber,
        sector_type: RegisteredSealProof,
        pieces: Vec<Piece>,
    ) -> Result<(), Error> {
        info!(sector = sid, "Start sealing");
        self.sectors.send(
            sid,
            SealingEvent::SectorStart {
                id: sid,
                sector_type,
                pieces,
            },
        )
    }

    /// Write deal data into the given sector and start sealing it.
    pub async fn seal_piece(
        &self,
        size: UnpaddedPieceSize,
        data: PieceReader,
        sid: SectorNumber,
        deal: DealInfo,
    ) -> Result<(), Error> {
        info!(deal = deal.deal_id, "Seal piece for deal");

        let ppi = self
            .sealer
            .add_piece(self.miner_sector(sid), &[], size, data)
            .await
            .map_err(|e| Error::Other(format!("adding piece to sector: {:#}", e)))?;

        let rt = seal_proof_from_sector_size(self.sealer.sector_size());
        self.new_sector(
            sid,
            rt,
            vec![Piece {
                piece: ppi,
                deal_info: Some(deal),
            }],
        )
    }

    /// Reserve a sector for incoming deal data.
    pub async fn allocate_piece(
        &self,
        size: UnpaddedPieceSize,
    ) -> Result<(SectorNumber, u64), Error> {
        size.validate().map_err(|_| Error::UnpaddedPiece)?;

        let sid = self.sc.next()?;
        self.sealer
            .new_sector(self.miner_sector(sid))
            .await
            .map_err(|e| Error::Other(format!("initializing sector: {:#}", e)))?;

        // offset hard-coded to 0 since we only put one thing in a sector
        Ok((sid, 0))
    }

    pub fn miner_sector(&self, num: SectorNumber) -> SectorID {
        SectorID {
            miner: self.miner_id,
            number: num,
        }
    }

    pub fn address(&self) -> Address {
        self.maddr
    }
}

#[async_trait]
impl<DB> Planner for Sealing<DB>
where
    DB: Store + Send + Sync + 'static,
{
    fn plan(&self, events: &[SealingEvent], state: &mut SectorInfo) -> Result<(), Error> {
        fsm::plan_events(&self.config, events, state)
    }

    async fn dispatch(&self, ctx: Context, state: SectorInfo) {
        use SectorState as S;
        match state.state {
            // Happy path
            S::Packing => self.handle_packing(ctx, state).await,
            S::PreCommit1 => self.handle_pre_commit1(ctx, state).await,
            S::FinishPreCommit1 => {
                info!(sector = state.sector_number, "Start FinishPreCommit1")
            }
            S::PreCommit2 => self.handle_pre_commit2(ctx, state).await,
            S::FinishPreCommit2 => {
                info!(sector = state.sector_number, "Start FinishPreCommit2")
            }
            S::PreCommitting => self.handle_pre_committing(ctx, state).await,
            S::PreCommitWait => self.handle_pre_commit_wait(ctx, state).await,
            S::WaitSeed => self.handle_wait_seed(ctx, state).await,
            S::Commit1 => self.handle_commit1(ctx, state).await,
            S::FinishCommit1 => info!(sector = state.sector_number, "Start FinishCommit1"),
            S::Commit2 => self.handle_commit2(ctx, state).await,
            S::FinishCommit2 => info!(sector = state.sector_number, "Start FinishCommit2"),
            S::Committing => self.handle_committing(ctx, state).await,
            S::CommitWait => self.handle_commit_wait(ctx, state).await,
            S::FinalizeSector => self.handle_finalize_sector(ctx, state).await,
            // TODO: track sector health / expiration
            S::Proving => info!(sector = state.sector_number, "Proving sector"),

            // Handled failure modes
            S::SealPreCommit1Failed => self.handle_seal_precommit1_failed(ctx, state).await,
            S::SealPreCommit2Failed => self.handle_seal_precommit2_failed(ctx, state).await,
            S::PreCommitFailed => self.handle_pre_commit_failed(ctx, state).await,
            S::ComputeProofFailed => self.handle_compute_proof_failed(ctx, state).await,
            S::CommitFailed => self.handle_commit_failed(ctx, state).await,
            S::FinalizeFailed => self.handle_finalize_failed(ctx, state).await,
            S::PackingFailed => warn!(
                sector = state.sector_number,
                "sector packing failed, waiting for operator"
            ),

            // Faults
            S::Faulty => self.handle_faulty(ctx, state).await,
            S::FaultReported => self.handle_fault_reported(ctx, state).await,
            S::FaultedFinal => {}

            // Fatal errors
            S::Undefined => error!("sector update with undefined state!"),
            S::FailedUnrecoverable => {
                error!(sector = state.sector_number, "sector failed unrecoverably")
            }
        }
    }
}

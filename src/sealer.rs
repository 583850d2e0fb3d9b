// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::types::{
    Commit1Out, InteractiveSealRandomness, PreCommit1Out, Proof, SealRandomness, SectorCids,
    UnpaddedByteIndex,
};
use anyhow::Result;
use async_trait::async_trait;
use cid::Cid;
use fvm_shared::piece::{PieceInfo, UnpaddedPieceSize};
use fvm_shared::randomness::Randomness;
use fvm_shared::sector::{RegisteredSealProof, SectorID, SectorSize};
use tokio::io::AsyncRead;

/// Source of piece bytes fed to the worker.
pub type PieceReader = Box<dyn AsyncRead + Send + Unpin>;

/// The (possibly remote) sealing worker. The heavy phases return
/// `Some(output)` when computed in-process; `None` means the work was
/// accepted and an external worker will deliver the corresponding
/// `SectorFinish*` event itself once the output is ready.
///
/// Refusals surface as [`crate::Error::WorkerBusy`],
/// [`crate::Error::NoAvailableWorker`] or
/// [`crate::Error::NoWorkerHasSector`] inside the error chain; the
/// handlers downcast to classify them as transient.
#[async_trait]
pub trait SectorManager: Send + Sync + 'static {
    fn sector_size(&self) -> SectorSize;

    /// Prepare on-disk state for a new sector.
    async fn new_sector(&self, sector: SectorID) -> Result<()>;

    async fn add_piece(
        &self,
        sector: SectorID,
        existing_piece_sizes: &[UnpaddedPieceSize],
        size: UnpaddedPieceSize,
        data: PieceReader,
    ) -> Result<PieceInfo>;

    async fn seal_pre_commit1(
        &self,
        sector: SectorID,
        ticket: &SealRandomness,
        pieces: &[PieceInfo],
    ) -> Result<Option<PreCommit1Out>>;

    async fn seal_pre_commit2(
        &self,
        sector: SectorID,
        pc1out: PreCommit1Out,
    ) -> Result<Option<SectorCids>>;

    async fn seal_commit1(
        &self,
        sector: SectorID,
        ticket: &SealRandomness,
        seed: &InteractiveSealRandomness,
        pieces: &[PieceInfo],
        cids: &SectorCids,
    ) -> Result<Option<Commit1Out>>;

    async fn seal_commit2(&self, sector: SectorID, c1out: Commit1Out) -> Result<Option<Proof>>;

    /// Release unsealed data and move the sealed replica and cache to
    /// long-term storage.
    async fn finalize_sector(&self, sector: SectorID) -> Result<()>;

    async fn read_piece(
        &self,
        sector: SectorID,
        offset: UnpaddedByteIndex,
        size: UnpaddedPieceSize,
        ticket: &SealRandomness,
        unsealed_cid: &Cid,
    ) -> Result<Vec<u8>>;

    /// Returns the subset of the given sectors this provider can still
    /// prove over.
    async fn check_provable(
        &self,
        proof_type: RegisteredSealProof,
        sectors: &[SectorID],
    ) -> Result<Vec<SectorID>>;

    /// Embedded prover contract.
    async fn generate_window_post(
        &self,
        randomness: &Randomness,
        sectors: &[SectorID],
    ) -> Result<Vec<Proof>>;
}

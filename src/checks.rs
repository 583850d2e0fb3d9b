// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! On-chain consistency checks run before chain-facing steps and by the
//! recovery handlers to decide how far back a retry must go.

use crate::chain::TipSetToken;
use crate::constants::{seal_randomness_lookback_limit, PRE_COMMIT_CHALLENGE_DELAY};
use crate::db::Store;
use crate::sealing::Sealing;
use crate::types::SectorInfo;
use fvm_shared::clock::ChainEpoch;
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum CheckSealingError {
    /// The chain API itself failed; nothing can be concluded about the
    /// sector, the caller should hold its state.
    #[error("API error: {0}")]
    Api(String),
    #[error("invalid deal in sector: {0}")]
    InvalidDeal(String),
    #[error("expired deal in sector: {0}")]
    ExpiredDeal(String),
    #[error("bad CommD: {0}")]
    BadCommD(String),
    #[error("ticket expired: {0}")]
    ExpiredTicket(String),
    #[error("precommit for this sector already on chain")]
    PrecommitOnChain,
    #[error("this sector is already proven on chain")]
    SectorOnChain,
    #[error("bad interactive seed: {0}")]
    BadSeed(String),
}

impl<DB> Sealing<DB>
where
    DB: Store + Send + Sync + 'static,
{
    /// Confirm that the sector's deal-backed pieces still match live market
    /// deals.
    pub(crate) async fn check_pieces(&self, sector: &SectorInfo) -> Result<(), CheckSealingError> {
        let (tok, head) = self
            .api
            .chain_head()
            .await
            .map_err(|e| CheckSealingError::Api(format!("{:#}", e)))?;

        for (i, piece) in sector.pieces.iter().enumerate() {
            let Some(deal) = &piece.deal_info else {
                continue; // filler
            };

            let proposal = self
                .api
                .state_market_storage_deal(deal.deal_id, &tok)
                .await
                .map_err(|e| {
                    CheckSealingError::InvalidDeal(format!(
                        "getting deal {} for piece {}: {:#}",
                        deal.deal_id, i, e
                    ))
                })?;

            if proposal.provider != self.maddr {
                return Err(CheckSealingError::InvalidDeal(format!(
                    "piece {} of sector {} refers to deal {} with wrong provider {}",
                    i, sector.sector_number, deal.deal_id, proposal.provider
                )));
            }
            if proposal.piece_cid != piece.piece.cid {
                return Err(CheckSealingError::InvalidDeal(format!(
                    "piece {} of sector {} has CID {} but deal {} proposes {}",
                    i, sector.sector_number, piece.piece.cid, deal.deal_id, proposal.piece_cid
                )));
            }
            if proposal.piece_size != piece.piece.size {
                return Err(CheckSealingError::InvalidDeal(format!(
                    "piece {} of sector {} size mismatch against deal {}",
                    i, sector.sector_number, deal.deal_id
                )));
            }
            if head >= proposal.start_epoch {
                return Err(CheckSealingError::ExpiredDeal(format!(
                    "piece {} of sector {} cannot be sealed before deal {} starts (start {}, head {})",
                    i, sector.sector_number, deal.deal_id, proposal.start_epoch, head
                )));
            }
        }

        Ok(())
    }

    /// Confirm the computed unsealed commitment and the ticket would still
    /// be accepted by the chain at pre-commit time.
    pub(crate) async fn check_precommit(
        &self,
        sector: &SectorInfo,
        tok: &TipSetToken,
        head: ChainEpoch,
    ) -> Result<(), CheckSealingError> {
        let comm_d = self
            .api
            .state_compute_data_commitment(&self.maddr, sector.sector_type, &sector.deal_ids(), tok)
            .await
            .map_err(|e| CheckSealingError::Api(format!("calling state_compute_data_commitment: {:#}", e)))?;

        if sector.comm_d != Some(comm_d) {
            return Err(CheckSealingError::BadCommD(format!(
                "on chain CommD differs from sector: {} != {:?}",
                comm_d, sector.comm_d
            )));
        }

        if head - sector.ticket_epoch > seal_randomness_lookback_limit(sector.sector_type) {
            return Err(CheckSealingError::ExpiredTicket(format!(
                "ticket expired: seal height: {}, head: {}",
                sector.ticket_epoch + seal_randomness_lookback_limit(sector.sector_type),
                head
            )));
        }

        let pci = self
            .api
            .state_sector_precommit_info(&self.maddr, sector.sector_number, tok)
            .await
            .map_err(|e| CheckSealingError::Api(format!("{:#}", e)))?;
        if pci.is_some() {
            return Err(CheckSealingError::PrecommitOnChain);
        }

        Ok(())
    }

    /// Confirm the interactive seed matches the one the chain would expect
    /// for our pre-commit.
    pub(crate) async fn check_commit(
        &self,
        sector: &SectorInfo,
        tok: &TipSetToken,
    ) -> Result<(), CheckSealingError> {
        if sector.seed_epoch == 0 {
            return Err(CheckSealingError::BadSeed("seed epoch was not set".into()));
        }

        let pci = self
            .api
            .state_sector_precommit_info(&self.maddr, sector.sector_number, tok)
            .await
            .map_err(|e| CheckSealingError::Api(format!("{:#}", e)))?;

        let Some(pci) = pci else {
            // pre-commit gone: either it was never there, or the sector got
            // proven and the record was promoted
            let info = self
                .api
                .state_sector_get_info(&self.maddr, sector.sector_number, tok)
                .await
                .map_err(|e| CheckSealingError::Api(format!("{:#}", e)))?;
            return match info {
                Some(_) => Err(CheckSealingError::SectorOnChain),
                None => Err(CheckSealingError::Api(
                    "precommit info not found on chain".into(),
                )),
            };
        };

        if pci.pre_commit_epoch + PRE_COMMIT_CHALLENGE_DELAY != sector.seed_epoch {
            return Err(CheckSealingError::BadSeed(format!(
                "seed epoch doesn't match on chain info: {} != {}",
                pci.pre_commit_epoch + PRE_COMMIT_CHALLENGE_DELAY,
                sector.seed_epoch
            )));
        }

        Ok(())
    }
}

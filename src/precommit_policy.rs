// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::api::SealingApi;
use crate::types::Piece;
use anyhow::Result;
use async_trait::async_trait;
use fvm_shared::clock::ChainEpoch;
use std::sync::Arc;

/// Decides the on-chain expiration requested for a sector at pre-commit
/// time.
#[async_trait]
pub trait PreCommitPolicy: Send + Sync + 'static {
    async fn expiration(&self, pieces: &[Piece]) -> Result<ChainEpoch>;
}

/// Expiration is the latest deal end epoch among the sector's pieces, or a
/// fixed duration for deal-less (pledge) sectors, aligned to the end of
/// the proving period it falls into.
pub struct BasicPreCommitPolicy {
    api: Arc<dyn SealingApi>,
    proving_boundary: ChainEpoch,
    duration: ChainEpoch,
}

impl BasicPreCommitPolicy {
    pub fn new(
        api: Arc<dyn SealingApi>,
        proving_boundary: ChainEpoch,
        duration: ChainEpoch,
    ) -> Self {
        BasicPreCommitPolicy {
            api,
            proving_boundary,
            duration,
        }
    }
}

#[async_trait]
impl PreCommitPolicy for BasicPreCommitPolicy {
    async fn expiration(&self, pieces: &[Piece]) -> Result<ChainEpoch> {
        let (_, epoch) = self.api.chain_head().await?;

        let mut end: Option<ChainEpoch> = None;
        for piece in pieces {
            let Some(deal) = &piece.deal_info else {
                continue;
            };
            if deal.deal_schedule.end_epoch < epoch {
                continue; // deal already expired, it can't extend the sector
            }
            if deal.deal_schedule.end_epoch > end.unwrap_or(0) {
                end = Some(deal.deal_schedule.end_epoch);
            }
        }

        let end = end.unwrap_or(epoch + self.duration);
        // align to the end of the proving period the epoch falls into
        Ok(end + self.proving_boundary - (end % self.proving_boundary) - 1)
    }
}

// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Recovery handlers. Each one classifies what went wrong, consults
//! on-chain state where that settles the question, then emits the retry
//! event mapping back to the earliest step whose output is still valid.

use crate::checks::CheckSealingError;
use crate::constants::seal_randomness_lookback_limit;
use crate::db::Store;
use crate::errors::CallError;
use crate::events::SealingEvent;
use crate::machine::Context;
use crate::sealing::Sealing;
use crate::states::send;
use crate::types::SectorInfo;
use tracing::{error, info, warn};

impl<DB> Sealing<DB>
where
    DB: Store + Send + Sync + 'static,
{
    async fn failed_cooldown(&self) {
        tokio::time::sleep(self.config.min_retry_time).await;
    }

    pub(crate) async fn handle_seal_precommit1_failed(&self, ctx: Context, _sector: SectorInfo) {
        self.failed_cooldown().await;
        send!(ctx, SealingEvent::SectorRetrySealPreCommit1);
    }

    pub(crate) async fn handle_seal_precommit2_failed(&self, ctx: Context, sector: SectorInfo) {
        self.failed_cooldown().await;

        let (_, epoch) = match self.api.chain_head().await {
            Ok(v) => v,
            Err(e) => {
                error!(
                    sector = sector.sector_number,
                    "handleSealPrecommit2Failed: api error, not proceeding: {:#}", e
                );
                return;
            }
        };

        // only worth redoing PreCommit2 alone while the stored PreCommit1
        // output is both present and derived from a live ticket
        if sector.previous_pre_commit1_out
            && !sector.pre_commit1_out.is_empty()
            && epoch - sector.ticket_epoch < seal_randomness_lookback_limit(sector.sector_type)
        {
            send!(ctx, SealingEvent::SectorRetrySealPreCommit2);
        } else {
            send!(ctx, SealingEvent::SectorRetrySealPreCommit1);
        }
    }

    pub(crate) async fn handle_pre_commit_failed(&self, ctx: Context, sector: SectorInfo) {
        let (tok, epoch) = match self.api.chain_head().await {
            Ok(v) => v,
            Err(e) => {
                error!(
                    sector = sector.sector_number,
                    "handlePreCommitFailed: api error, not proceeding: {:#}", e
                );
                return;
            }
        };

        match self.check_precommit(&sector, &tok, epoch).await {
            Err(CheckSealingError::Api(e)) => {
                error!(
                    sector = sector.sector_number,
                    "handlePreCommitFailed: api error, not proceeding: {}", e
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
            // on-chain pre-commit is inspected below
            Err(CheckSealingError::PrecommitOnChain) => {}
            Err(e) => {
                warn!(
                    sector = sector.sector_number,
                    "handlePreCommitFailed: unexpected check result: {}", e
                );
            }
            Ok(()) => {}
        }

        let pci = match self
            .api
            .state_sector_precommit_info(&self.maddr, sector.sector_number, &tok)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                error!(
                    sector = sector.sector_number,
                    "handlePreCommitFailed: api error, not proceeding: {:#}", e
                );
                return;
            }
        };

        if let Some(pci) = pci {
            if pci.info.seal_rand_epoch != sector.ticket_epoch {
                // a pre-commit is on chain, but its ticket isn't ours; the
                // message we'd retry can never be accepted
                send!(
                    ctx,
                    SealingEvent::SectorSealPreCommit1Failed {
                        error: CallError::Other(format!(
                            "precommit on chain with different ticket epoch: {} != {}",
                            pci.info.seal_rand_epoch, sector.ticket_epoch
                        )),
                    }
                );
                return;
            }
            info!(
                sector = sector.sector_number,
                "our precommit appears to have landed after all"
            );
            send!(ctx, SealingEvent::SectorPreCommitLanded { tipset: tok });
            return;
        }

        if sector.pre_commit_message.is_some() {
            warn!(
                sector = sector.sector_number,
                "retrying precommit with a message still pending"
            );
        }

        self.failed_cooldown().await;
        send!(ctx, SealingEvent::SectorRetryPreCommit);
    }

    pub(crate) async fn handle_compute_proof_failed(&self, ctx: Context, sector: SectorInfo) {
        // an aged-out ticket invalidates everything derived from it; start
        // over from PreCommit1
        if let Ok((_, epoch)) = self.api.chain_head().await {
            if epoch - sector.ticket_epoch > seal_randomness_lookback_limit(sector.sector_type) {
                send!(
                    ctx,
                    SealingEvent::SectorSealPreCommit1Failed {
                        error: CallError::Other("ticket expired".into()),
                    }
                );
                return;
            }
        }

        if sector.invalid_proofs >= self.config.max_invalid_proofs {
            send!(
                ctx,
                SealingEvent::SectorFailedUnrecoverable {
                    error: CallError::Other("too many consecutive compute failures".into()),
                }
            );
            return;
        }

        self.failed_cooldown().await;
        send!(ctx, SealingEvent::SectorRetryComputeProof);
    }

    pub(crate) async fn handle_commit_failed(&self, ctx: Context, sector: SectorInfo) {
        let (tok, epoch) = match self.api.chain_head().await {
            Ok(v) => v,
            Err(e) => {
                error!(
                    sector = sector.sector_number,
                    "handleCommitFailed: api error, not proceeding: {:#}", e
                );
                return;
            }
        };

        match self.check_precommit(&sector, &tok, epoch).await {
            Err(CheckSealingError::Api(e)) => {
                error!(
                    sector = sector.sector_number,
                    "handleCommitFailed: api error, not proceeding: {}", e
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
            // expected: our pre-commit must be on chain to commit at all
            Err(CheckSealingError::PrecommitOnChain) | Ok(()) => {}
            Err(e) => {
                warn!(
                    sector = sector.sector_number,
                    "handleCommitFailed: unexpected check result: {}", e
                );
            }
        }

        match self.check_commit(&sector, &tok).await {
            Err(CheckSealingError::Api(e)) => {
                error!(
                    sector = sector.sector_number,
                    "handleCommitFailed: api error, not proceeding: {}", e
                );
                return;
            }
            Err(e @ CheckSealingError::BadSeed(_)) => {
                warn!(sector = sector.sector_number, "bad seed: {}", e);
                send!(ctx, SealingEvent::SectorRetryWaitSeed);
                return;
            }
            Err(CheckSealingError::SectorOnChain) => {
                // the commit message made it after all; skip straight to
                // finalization
                info!(
                    sector = sector.sector_number,
                    "sector already proven on chain"
                );
                send!(ctx, SealingEvent::SectorProving);
                return;
            }
            Err(e) => {
                warn!(
                    sector = sector.sector_number,
                    "handleCommitFailed: unexpected check result: {}", e
                );
            }
            Ok(()) => {}
        }

        if sector.commit_message.is_some() {
            // the message landed but was rejected, which points at the
            // proof itself
            if sector.invalid_proofs >= self.config.max_invalid_proofs {
                send!(
                    ctx,
                    SealingEvent::SectorFailedUnrecoverable {
                        error: CallError::Other("too many invalid proofs".into()),
                    }
                );
                return;
            }
            self.failed_cooldown().await;
            send!(ctx, SealingEvent::SectorRetryInvalidProof);
            return;
        }

        self.failed_cooldown().await;
        send!(ctx, SealingEvent::SectorRetryComputeProof);
    }

    pub(crate) async fn handle_finalize_failed(&self, ctx: Context, _sector: SectorInfo) {
        self.failed_cooldown().await;
        send!(ctx, SealingEvent::SectorRetryFinalize);
    }
}

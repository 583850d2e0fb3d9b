// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::chain::{
    DealProposal, DomainSeparationTag, MsgLookup, SectorOnChainInfo, SectorPreCommitOnChainInfo,
    TipSetToken,
};
use anyhow::Result;
use async_trait::async_trait;
use cid::Cid;
use futures::future::BoxFuture;
use fvm_ipld_bitfield::BitField;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::randomness::Randomness;
use fvm_shared::sector::{RegisteredSealProof, SectorNumber, SectorSize};
use fvm_shared::MethodNum;

/// Chain-side operations the sealing pipeline depends on. Implemented by
/// the node's RPC client; mocked in tests.
#[async_trait]
pub trait SealingApi: Send + Sync + 'static {
    /// Block until the message lands on chain and return its receipt.
    async fn state_wait_msg(&self, msg: &Cid) -> Result<MsgLookup>;

    async fn state_compute_data_commitment(
        &self,
        maddr: &Address,
        sector_type: RegisteredSealProof,
        deals: &[DealID],
        tok: &TipSetToken,
    ) -> Result<Cid>;

    async fn state_sector_precommit_info(
        &self,
        maddr: &Address,
        number: SectorNumber,
        tok: &TipSetToken,
    ) -> Result<Option<SectorPreCommitOnChainInfo>>;

    async fn state_sector_get_info(
        &self,
        maddr: &Address,
        number: SectorNumber,
        tok: &TipSetToken,
    ) -> Result<Option<SectorOnChainInfo>>;

    async fn state_miner_sector_size(&self, maddr: &Address, tok: &TipSetToken)
        -> Result<SectorSize>;

    async fn state_miner_worker_address(
        &self,
        maddr: &Address,
        tok: &TipSetToken,
    ) -> Result<Address>;

    /// Sectors assigned to each of the miner's proving deadlines.
    async fn state_miner_deadlines(
        &self,
        maddr: &Address,
        tok: &TipSetToken,
    ) -> Result<Vec<BitField>>;

    async fn state_miner_initial_pledge_collateral(
        &self,
        maddr: &Address,
        number: SectorNumber,
        tok: &TipSetToken,
    ) -> Result<TokenAmount>;

    async fn state_market_storage_deal(
        &self,
        deal: DealID,
        tok: &TipSetToken,
    ) -> Result<DealProposal>;

    #[allow(clippy::too_many_arguments)]
    async fn send_msg(
        &self,
        from: &Address,
        to: &Address,
        method: MethodNum,
        value: TokenAmount,
        gas_price: TokenAmount,
        gas_limit: i64,
        params: Vec<u8>,
    ) -> Result<Cid>;

    async fn chain_head(&self) -> Result<(TipSetToken, ChainEpoch)>;

    async fn chain_get_randomness(
        &self,
        tok: &TipSetToken,
        personalization: DomainSeparationTag,
        rand_epoch: ChainEpoch,
        entropy: &[u8],
    ) -> Result<Randomness>;

    async fn chain_read_obj(&self, obj: &Cid) -> Result<Vec<u8>>;
}

pub type HeightHandler =
    Box<dyn FnOnce(TipSetToken, ChainEpoch) -> BoxFuture<'static, Result<()>> + Send>;
pub type RevertHandler = Box<dyn FnOnce(TipSetToken) -> BoxFuture<'static, Result<()>> + Send>;

/// Chain notification subscription: invoke the handler once the chain
/// reaches the given height (with `confidence` epochs built on top), and
/// the revert handler if that part of the chain is reorged away.
#[async_trait]
pub trait Events: Send + Sync + 'static {
    async fn chain_at(
        &self,
        handler: HeightHandler,
        revert: RevertHandler,
        confidence: ChainEpoch,
        height: ChainEpoch,
    ) -> Result<()>;
}

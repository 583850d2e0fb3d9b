// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! End-to-end sealing scenarios over a mock chain and a mock sealing
//! worker: the full pipeline, worker-busy retries with output reuse,
//! recovery through on-chain state, restart resumption and fault
//! declaration.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use cid::Cid;
use forest_sealing::db::MemoryDB;
use fvm_ipld_bitfield::BitField;
use fvm_ipld_encoding::from_slice;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::piece::{PieceInfo, UnpaddedPieceSize};
use fvm_shared::randomness::Randomness;
use fvm_shared::sector::{RegisteredSealProof, SectorID, SectorNumber, SectorSize};
use fvm_shared::MethodNum;
use forest_sealing::{
    BasicPreCommitPolicy, Commit1Out, DealProposal, DomainSeparationTag, Error, Events,
    HeightHandler, InteractiveSealRandomness, MinerMethod, MsgLookup, MessageReceipt, Piece,
    PieceReader, PreCommit1Out, Proof, RevertHandler, SealRandomness, Sealing, SealingApi,
    SealingConfig, SealingEvent, SectorCids, SectorInfo, SectorManager, SectorOnChainInfo,
    SectorPreCommitInfo, SectorPreCommitOnChainInfo, SectorState, StoredCounter, TipSetToken,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MINER: u64 = 1000;
const HEAD_EPOCH: ChainEpoch = 5000;

fn test_cid(data: &[u8]) -> Cid {
    Cid::new_v1(0x55, cid::multihash::Multihash::wrap(0x0, data).unwrap())
}

fn commd_cid() -> Cid {
    test_cid(b"commd")
}

fn commr_cid() -> Cid {
    test_cid(b"commr")
}

#[derive(Default)]
struct MockChain {
    precommit_info: Mutex<Option<SectorPreCommitOnChainInfo>>,
    sector_info: Mutex<Option<SectorOnChainInfo>>,
    deals: Mutex<ahash::HashMap<DealID, DealProposal>>,
    sent: Mutex<Vec<(MethodNum, Vec<u8>)>>,
    /// Fail the next PreCommitSector send, while still registering the
    /// pre-commit on chain (the message raced us in).
    precommit_send_fails_landed: AtomicBool,
}

impl MockChain {
    fn sent_with_method(&self, method: MinerMethod) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|(m, _)| *m == method as MethodNum)
            .count()
    }

    fn register_precommit(&self, params: &[u8]) -> Result<()> {
        let info: SectorPreCommitInfo = from_slice(params)?;
        *self.precommit_info.lock() = Some(SectorPreCommitOnChainInfo {
            info,
            pre_commit_deposit: TokenAmount::from_atto(100),
            pre_commit_epoch: HEAD_EPOCH,
        });
        Ok(())
    }
}

#[async_trait]
impl SealingApi for MockChain {
    async fn state_wait_msg(&self, _msg: &Cid) -> Result<MsgLookup> {
        Ok(MsgLookup {
            receipt: MessageReceipt {
                exit_code: ExitCode::OK,
                return_data: Vec::new(),
                gas_used: 0,
            },
            tipset_tok: b"head".to_vec(),
            height: HEAD_EPOCH,
        })
    }

    async fn state_compute_data_commitment(
        &self,
        _maddr: &Address,
        _sector_type: RegisteredSealProof,
        _deals: &[DealID],
        _tok: &TipSetToken,
    ) -> Result<Cid> {
        Ok(commd_cid())
    }

    async fn state_sector_precommit_info(
        &self,
        _maddr: &Address,
        _number: SectorNumber,
        _tok: &TipSetToken,
    ) -> Result<Option<SectorPreCommitOnChainInfo>> {
        Ok(self.precommit_info.lock().clone())
    }

    async fn state_sector_get_info(
        &self,
        _maddr: &Address,
        _number: SectorNumber,
        _tok: &TipSetToken,
    ) -> Result<Option<SectorOnChainInfo>> {
        Ok(self.sector_info.lock().clone())
    }

    async fn state_miner_sector_size(
        &self,
        _maddr: &Address,
        _tok: &TipSetToken,
    ) -> Result<SectorSize> {
        Ok(SectorSize::_2KiB)
    }

    async fn state_miner_worker_address(
        &self,
        _maddr: &Address,
        _tok: &TipSetToken,
    ) -> Result<Address> {
        Ok(Address::new_id(100))
    }

    async fn state_miner_deadlines(
        &self,
        _maddr: &Address,
        _tok: &TipSetToken,
    ) -> Result<Vec<BitField>> {
        // every sector of this miner sits in deadline 3
        let mut all = BitField::new();
        for n in 0..16 {
            all.set(n);
        }
        Ok(vec![BitField::new(), BitField::new(), BitField::new(), all])
    }

    async fn state_miner_initial_pledge_collateral(
        &self,
        _maddr: &Address,
        _number: SectorNumber,
        _tok: &TipSetToken,
    ) -> Result<TokenAmount> {
        Ok(TokenAmount::from_atto(1000))
    }

    async fn state_market_storage_deal(
        &self,
        deal: DealID,
        _tok: &TipSetToken,
    ) -> Result<DealProposal> {
        self.deals
            .lock()
            .get(&deal)
            .cloned()
            .ok_or_else(|| anyhow!("no deal {} in mock market", deal))
    }

    async fn send_msg(
        &self,
        _from: &Address,
        _to: &Address,
        method: MethodNum,
        _value: TokenAmount,
        _gas_price: TokenAmount,
        _gas_limit: i64,
        params: Vec<u8>,
    ) -> Result<Cid> {
        if method == MinerMethod::PreCommitSector as MethodNum {
            self.register_precommit(&params)?;
            if self.precommit_send_fails_landed.swap(false, Ordering::SeqCst) {
                bail!("message push failed (but the message made it anyway)");
            }
            self.sent.lock().push((method, params));
            return Ok(test_cid(b"pcmsg"));
        }
        if method == MinerMethod::ProveCommitSector as MethodNum {
            let pci = self
                .precommit_info
                .lock()
                .clone()
                .ok_or_else(|| anyhow!("prove commit without precommit"))?;
            *self.sector_info.lock() = Some(SectorOnChainInfo {
                sector_number: pci.info.sector_number,
                seal_proof: pci.info.seal_proof,
                sealed_cid: pci.info.sealed_cid,
                deal_ids: pci.info.deal_ids.clone(),
                activation: HEAD_EPOCH,
                expiration: pci.info.expiration,
            });
            self.sent.lock().push((method, params));
            return Ok(test_cid(b"cmsg"));
        }
        self.sent.lock().push((method, params));
        Ok(test_cid(b"msg"))
    }

    async fn chain_head(&self) -> Result<(TipSetToken, ChainEpoch)> {
        Ok((b"head".to_vec(), HEAD_EPOCH))
    }

    async fn chain_get_randomness(
        &self,
        _tok: &TipSetToken,
        _personalization: DomainSeparationTag,
        rand_epoch: ChainEpoch,
        _entropy: &[u8],
    ) -> Result<Randomness> {
        Ok(Randomness(vec![(rand_epoch % 251) as u8; 32]))
    }

    async fn chain_read_obj(&self, _obj: &Cid) -> Result<Vec<u8>> {
        bail!("not used")
    }
}

/// Fires height subscriptions immediately; the mock chain never reorgs.
struct ImmediateEvents;

#[async_trait]
impl Events for ImmediateEvents {
    async fn chain_at(
        &self,
        handler: HeightHandler,
        _revert: RevertHandler,
        _confidence: ChainEpoch,
        height: ChainEpoch,
    ) -> Result<()> {
        handler(b"head".to_vec(), height).await
    }
}

#[derive(Default)]
struct MockSealer {
    pc1_calls: AtomicUsize,
    pc2_calls: AtomicUsize,
    /// Refuse the first PreCommit2 request with a busy worker.
    pc2_busy_once: AtomicBool,
    /// Accept PreCommit1 but deliver the output out-of-band (detached
    /// worker mode).
    pc1_detached: AtomicBool,
    /// Keep FinalizeSector hanging until cancelled.
    finalize_hangs: AtomicBool,
}

#[async_trait]
impl SectorManager for MockSealer {
    fn sector_size(&self) -> SectorSize {
        SectorSize::_2KiB
    }

    async fn new_sector(&self, _sector: SectorID) -> Result<()> {
        Ok(())
    }

    async fn add_piece(
        &self,
        _sector: SectorID,
        existing_piece_sizes: &[UnpaddedPieceSize],
        size: UnpaddedPieceSize,
        _data: PieceReader,
    ) -> Result<PieceInfo> {
        Ok(PieceInfo {
            size: size.padded(),
            cid: test_cid(format!("piece-{}", existing_piece_sizes.len()).as_bytes()),
        })
    }

    async fn seal_pre_commit1(
        &self,
        _sector: SectorID,
        _ticket: &SealRandomness,
        _pieces: &[PieceInfo],
    ) -> Result<Option<PreCommit1Out>> {
        self.pc1_calls.fetch_add(1, Ordering::SeqCst);
        if self.pc1_detached.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(b"pc1out".to_vec()))
    }

    async fn seal_pre_commit2(
        &self,
        _sector: SectorID,
        pc1out: PreCommit1Out,
    ) -> Result<Option<SectorCids>> {
        self.pc2_calls.fetch_add(1, Ordering::SeqCst);
        if self.pc2_busy_once.swap(false, Ordering::SeqCst) {
            return Err(Error::WorkerBusy.into());
        }
        assert_eq!(pc1out, b"pc1out".to_vec());
        Ok(Some(SectorCids {
            sealed: commr_cid(),
            unsealed: commd_cid(),
        }))
    }

    async fn seal_commit1(
        &self,
        _sector: SectorID,
        _ticket: &SealRandomness,
        _seed: &InteractiveSealRandomness,
        _pieces: &[PieceInfo],
        cids: &SectorCids,
    ) -> Result<Option<Commit1Out>> {
        assert_eq!(cids.sealed, commr_cid());
        Ok(Some(b"c1out".to_vec()))
    }

    async fn seal_commit2(&self, _sector: SectorID, c1out: Commit1Out) -> Result<Option<Proof>> {
        assert_eq!(c1out, b"c1out".to_vec());
        Ok(Some(b"proof".to_vec()))
    }

    async fn finalize_sector(&self, _sector: SectorID) -> Result<()> {
        if self.finalize_hangs.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn read_piece(
        &self,
        _sector: SectorID,
        _offset: u64,
        _size: UnpaddedPieceSize,
        _ticket: &SealRandomness,
        _unsealed_cid: &Cid,
    ) -> Result<Vec<u8>> {
        bail!("not used")
    }

    async fn check_provable(
        &self,
        _proof_type: RegisteredSealProof,
        sectors: &[SectorID],
    ) -> Result<Vec<SectorID>> {
        Ok(sectors.to_vec())
    }

    async fn generate_window_post(
        &self,
        _randomness: &Randomness,
        _sectors: &[SectorID],
    ) -> Result<Vec<Proof>> {
        bail!("not used")
    }
}

struct Harness {
    chain: Arc<MockChain>,
    sealer: Arc<MockSealer>,
    db: Arc<MemoryDB>,
    sealing: Arc<Sealing<MemoryDB>>,
}

fn harness() -> Harness {
    let chain = Arc::new(MockChain::default());
    let sealer = Arc::new(MockSealer::default());
    let db = Arc::new(MemoryDB::default());
    Harness {
        chain: chain.clone(),
        sealer: sealer.clone(),
        db: db.clone(),
        sealing: build_sealing(chain, sealer, db),
    }
}

fn build_sealing(
    chain: Arc<MockChain>,
    sealer: Arc<MockSealer>,
    db: Arc<MemoryDB>,
) -> Arc<Sealing<MemoryDB>> {
    let config = SealingConfig {
        min_retry_time: Duration::from_millis(10),
        ..Default::default()
    };
    let pcp = Arc::new(BasicPreCommitPolicy::new(chain.clone(), 2880, 10_000));
    Sealing::new(
        chain,
        Arc::new(ImmediateEvents),
        Address::new_id(MINER),
        db.clone(),
        sealer,
        Arc::new(StoredCounter::new(db)),
        pcp,
        config,
    )
    .unwrap()
}

fn deal_less_piece() -> Vec<Piece> {
    vec![Piece {
        piece: PieceInfo {
            size: UnpaddedPieceSize(1016).padded(),
            cid: test_cid(b"piece-0"),
        },
        deal_info: None,
    }]
}

async fn wait_for_state(
    sealing: &Sealing<MemoryDB>,
    id: SectorNumber,
    want: SectorState,
) -> SectorInfo {
    for _ in 0..500 {
        let sector = sealing
            .list_sectors()
            .unwrap()
            .into_iter()
            .find(|s| s.sector_number == id);
        if let Some(sector) = sector {
            if sector.state == want {
                return sector;
            }
            assert_ne!(
                sector.state,
                SectorState::FailedUnrecoverable,
                "sector went unrecoverable while waiting for {:?}",
                want
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for sector {} to reach {:?}", id, want);
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_seals_to_proving() {
    let h = harness();

    h.sealing
        .new_sector(
            42,
            RegisteredSealProof::StackedDRG2KiBV1P1,
            deal_less_piece(),
        )
        .unwrap();

    let sector = wait_for_state(&h.sealing, 42, SectorState::Proving).await;
    assert_eq!(sector.comm_d, Some(commd_cid()));
    assert_eq!(sector.comm_r, Some(commr_cid()));
    assert_eq!(sector.proof, b"proof".to_vec());
    assert_eq!(sector.commit_message, Some(test_cid(b"cmsg")));
    assert!(!sector.log.is_empty());

    // one message each
    assert_eq!(h.chain.sent_with_method(MinerMethod::PreCommitSector), 1);
    assert_eq!(h.chain.sent_with_method(MinerMethod::ProveCommitSector), 1);

    h.sealing.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn busy_worker_retry_reuses_precommit1_output() {
    let h = harness();
    h.sealer.pc2_busy_once.store(true, Ordering::SeqCst);

    h.sealing
        .new_sector(
            7,
            RegisteredSealProof::StackedDRG2KiBV1P1,
            deal_less_piece(),
        )
        .unwrap();

    let sector = wait_for_state(&h.sealing, 7, SectorState::Proving).await;

    // PreCommit2 ran twice, but the expensive PreCommit1 only once
    assert_eq!(h.sealer.pc2_calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.sealer.pc1_calls.load(Ordering::SeqCst), 1);

    // the retry was recorded in the audit trail
    assert!(sector
        .log
        .iter()
        .any(|l| l.kind == "event;SectorSealPreCommit2Failed"));
    assert!(sector
        .log
        .iter()
        .any(|l| l.kind == "event;SectorRetrySealPreCommit2"));

    h.sealing.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn precommit_send_failure_recovers_via_landed_message() {
    let h = harness();
    h.chain
        .precommit_send_fails_landed
        .store(true, Ordering::SeqCst);

    h.sealing
        .new_sector(
            3,
            RegisteredSealProof::StackedDRG2KiBV1P1,
            deal_less_piece(),
        )
        .unwrap();

    let sector = wait_for_state(&h.sealing, 3, SectorState::Proving).await;

    // the recovery handler noticed the landed pre-commit instead of
    // re-submitting
    assert_eq!(h.chain.sent_with_method(MinerMethod::PreCommitSector), 0);
    assert!(sector
        .log
        .iter()
        .any(|l| l.kind == "event;SectorChainPreCommitFailed"));
    assert!(sector
        .log
        .iter()
        .any(|l| l.kind == "event;SectorPreCommitLanded"));

    h.sealing.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_resumes_a_parked_finalize() {
    let h = harness();
    h.sealer.finalize_hangs.store(true, Ordering::SeqCst);

    h.sealing
        .new_sector(
            9,
            RegisteredSealProof::StackedDRG2KiBV1P1,
            deal_less_piece(),
        )
        .unwrap();

    // the planned state is persisted before the handler hangs
    wait_for_state(&h.sealing, 9, SectorState::FinalizeSector).await;
    h.sealing.stop().await;

    // "crash" over; bring up a fresh instance over the same store
    h.sealer.finalize_hangs.store(false, Ordering::SeqCst);
    let revived = build_sealing(h.chain.clone(), h.sealer.clone(), h.db.clone());
    revived.run().unwrap();

    wait_for_state(&revived, 9, SectorState::Proving).await;
    revived.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn detached_worker_completion_resumes_the_pipeline() {
    let h = harness();
    h.sealer.pc1_detached.store(true, Ordering::SeqCst);

    h.sealing
        .new_sector(
            5,
            RegisteredSealProof::StackedDRG2KiBV1P1,
            deal_less_piece(),
        )
        .unwrap();

    // the sector parks, waiting for the external completion
    wait_for_state(&h.sealing, 5, SectorState::FinishPreCommit1).await;

    h.sealing
        .send(
            5,
            SealingEvent::SectorFinishPreCommit1 {
                pre_commit1_out: b"pc1out".to_vec(),
            },
        )
        .unwrap();

    wait_for_state(&h.sealing, 5, SectorState::Proving).await;
    h.sealing.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn forced_fault_is_declared_on_chain() {
    let h = harness();

    h.sealing
        .new_sector(
            11,
            RegisteredSealProof::StackedDRG2KiBV1P1,
            deal_less_piece(),
        )
        .unwrap();
    wait_for_state(&h.sealing, 11, SectorState::Proving).await;

    h.sealing
        .force_sector_state(11, SectorState::Faulty)
        .unwrap();

    let sector = wait_for_state(&h.sealing, 11, SectorState::FaultedFinal).await;
    assert!(sector.fault_report_msg.is_some());
    assert_eq!(h.chain.sent_with_method(MinerMethod::DeclareFaults), 1);

    h.sealing.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pledged_sector_seals_null_data() {
    let h = harness();

    h.sealing.pledge_sector(false).unwrap();

    // the stored counter hands out 0 first
    let sector = wait_for_state(&h.sealing, 0, SectorState::Proving).await;
    assert_eq!(sector.pieces.len(), 1);
    assert!(sector.pieces[0].deal_info.is_none());

    h.sealing.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn deal_piece_seals_through_allocate_and_seal_piece() {
    use forest_sealing::{DealInfo, DealSchedule};

    let h = harness();

    let size = UnpaddedPieceSize(1016);
    let (sid, offset) = h.sealing.allocate_piece(size).await.unwrap();
    assert_eq!(offset, 0);

    // the deal the piece claims to be part of
    h.chain.deals.lock().insert(
        44,
        DealProposal {
            piece_cid: test_cid(b"piece-0"),
            piece_size: size.padded(),
            client: Address::new_id(777),
            provider: Address::new_id(MINER),
            start_epoch: HEAD_EPOCH + 100,
            end_epoch: HEAD_EPOCH + 10_000,
        },
    );

    h.sealing
        .seal_piece(
            size,
            Box::new(tokio::io::empty()),
            sid,
            DealInfo {
                deal_id: 44,
                deal_schedule: DealSchedule {
                    start_epoch: HEAD_EPOCH + 100,
                    end_epoch: HEAD_EPOCH + 10_000,
                },
            },
        )
        .await
        .unwrap();

    let sector = wait_for_state(&h.sealing, sid, SectorState::Proving).await;
    assert_eq!(sector.pieces[0].deal_info.as_ref().unwrap().deal_id, 44);

    h.sealing.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stopped_group_accepts_nothing() {
    let h = harness();
    h.sealing
        .new_sector(
            2,
            RegisteredSealProof::StackedDRG2KiBV1P1,
            deal_less_piece(),
        )
        .unwrap();
    wait_for_state(&h.sealing, 2, SectorState::Proving).await;

    h.sealing.stop().await;
    assert!(matches!(
        h.sealing.send(2, SealingEvent::SectorRestart),
        Err(Error::NotAccepted)
    ));
}

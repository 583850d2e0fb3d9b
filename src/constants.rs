// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::clock::ChainEpoch;
use fvm_shared::sector::{RegisteredSealProof, SectorSize};

/// Datastore namespace holding the per-sector records.
pub const SECTOR_STORE_PREFIX: &str = "/sectors";

/// Datastore key of the next-sector-number allocator.
pub const SECTOR_COUNTER_KEY: &str = "/storage/nextid";

/// Maximum number of entries retained in a sector's audit log.
pub const SECTOR_LOG_CAP: usize = 50;

/// Epochs after which chain state is final.
pub const CHAIN_FINALITY: ChainEpoch = 900;

/// Duration of a chain epoch, in seconds.
pub const EPOCH_DURATION_SECONDS: i64 = 30;

/// Lookback from the current head when drawing the pre-commit ticket.
pub const SEAL_RANDOMNESS_LOOKBACK: ChainEpoch = CHAIN_FINALITY;

/// Number of epochs between the pre-commit landing on chain and the
/// interactive challenge seed being drawn, so that the seed is not
/// predictable by the miner.
pub const PRE_COMMIT_CHALLENGE_DELAY: ChainEpoch = 150;

/// Confidence, in epochs, to wait past the seed height before drawing the
/// interactive randomness.
pub const INTERACTIVE_POREP_CONFIDENCE: ChainEpoch = 6;

/// Gas limit used for the pipeline's miner actor messages. Fee estimation
/// belongs to the node submitting the message.
pub const MESSAGE_GAS_LIMIT: i64 = 1_000_000;

/// Maximum duration to allow for the sealing process for seal algorithms.
/// One bound covers the whole stacked DRG family.
pub fn max_seal_duration(_proof: RegisteredSealProof) -> ChainEpoch {
    10_000
}

/// Maximum age, in epochs, of a ticket for which outputs derived from it
/// remain acceptable on chain.
pub fn seal_randomness_lookback_limit(proof: RegisteredSealProof) -> ChainEpoch {
    SEAL_RANDOMNESS_LOOKBACK + max_seal_duration(proof)
}

/// Seal proof variant used for new sectors of the given size.
pub fn seal_proof_from_sector_size(size: SectorSize) -> RegisteredSealProof {
    use RegisteredSealProof::*;
    match size {
        SectorSize::_2KiB => StackedDRG2KiBV1P1,
        SectorSize::_8MiB => StackedDRG8MiBV1P1,
        SectorSize::_512MiB => StackedDRG512MiBV1P1,
        SectorSize::_32GiB => StackedDRG32GiBV1P1,
        SectorSize::_64GiB => StackedDRG64GiBV1P1,
    }
}

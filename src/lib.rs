// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Sector sealing state machine for a proof-of-replication storage
//! provider. For every sector this crate coordinates packing, the
//! PreCommit1 → PreCommit2 → pre-commit → seed → Commit1 → Commit2 →
//! commit pipeline, finalization and fault declaration, persisting each
//! planned step so that any crash resumes exactly where the sector left
//! off. Heavy compute phases can run in-process or be handed to an
//! external worker which reports back with `SectorFinish*` events.

mod api;
mod chain;
mod checks;
mod config;
mod constants;
pub mod db;
mod errors;
mod events;
mod fsm;
mod garbage;
mod group;
mod machine;
mod precommit_policy;
mod sealer;
mod sealing;
mod sector_state;
mod states;
mod states_failed;
mod store;
mod types;

pub use api::{Events, HeightHandler, RevertHandler, SealingApi};
pub use chain::*;
pub use config::SealingConfig;
pub use constants::*;
pub use errors::{CallError, Error};
pub use events::SealingEvent;
pub use precommit_policy::{BasicPreCommitPolicy, PreCommitPolicy};
pub use sealer::{PieceReader, SectorManager};
pub use sealing::Sealing;
pub use sector_state::SectorState;
pub use store::StoredCounter;
pub use types::*;

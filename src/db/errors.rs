// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

/// Store backend error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Backend(#[from] sled::Error),
    #[error("{0}")]
    Other(String),
}

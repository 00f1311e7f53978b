use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    fmt::Display,
    ops::Range,
};

use bytes::Bytes;
use uuid::Uuid;

use crate::{bitfield::BitField, BLOCK_LENGTH};

/// Piece geometry of the torrent being swarmed.
#[derive(Debug, Clone, Copy)]
pub struct TorrentInfo {
    pub piece_length: u32,
    pub total_length: u64,
}

impl TorrentInfo {
    pub fn piece_count(&self) -> usize {
        self.total_length.div_ceil(self.piece_length as u64) as usize
    }

    /// Piece length with consideration of the short last piece.
    pub fn piece_size(&self, piece: u32) -> u32 {
        let start = piece as u64 * self.piece_length as u64;
        let end = std::cmp::min(start + self.piece_length as u64, self.total_length);
        (end - start) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl Block {
    pub fn range(&self) -> Range<usize> {
        let offset = self.offset as usize;
        offset..offset + self.length as usize
    }

    /// Integer identifying this block within its piece.
    pub fn ordinal(&self) -> u32 {
        self.offset / BLOCK_LENGTH
    }
}

impl Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Block in piece {} with offset {} and length {}",
            self.piece, self.offset, self.length
        )
    }
}

#[derive(Debug, Clone)]
pub struct DataBlock {
    pub piece: u32,
    pub offset: u32,
    pub block: Bytes,
}

impl DataBlock {
    pub fn new(piece: u32, offset: u32, block: Bytes) -> Self {
        Self {
            piece,
            offset,
            block,
        }
    }

    pub fn len(&self) -> usize {
        self.block.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block.is_empty()
    }

    pub fn block(&self) -> Block {
        Block {
            piece: self.piece,
            offset: self.offset,
            length: self.block.len() as u32,
        }
    }
}

impl Display for DataBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Block in piece {} with offset {} and length {}",
            self.piece,
            self.offset,
            self.block.len()
        )
    }
}

/// A piece we still lack: the queue of sub-pieces left to request plus the
/// peers currently usable as sources for it.
#[derive(Debug)]
pub struct Piece {
    index: u32,
    byte_length: u32,
    sub_pieces: VecDeque<u32>,
    available: HashSet<Uuid>,
}

impl Piece {
    pub fn new(index: u32, byte_length: u32) -> Self {
        Self {
            index,
            byte_length,
            sub_pieces: (0..byte_length.div_ceil(BLOCK_LENGTH)).collect(),
            available: HashSet::new(),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn byte_length(&self) -> u32 {
        self.byte_length
    }

    /// Next sub-piece ordinal to request, if any is left.
    pub fn pop_sub_piece(&mut self) -> Option<u32> {
        self.sub_pieces.pop_front()
    }

    /// Return a sub-piece to the head of the queue: retry fast.
    pub fn push_sub_piece(&mut self, ordinal: u32) {
        self.sub_pieces.push_front(ordinal);
    }

    /// Return a sub-piece to the tail of the queue: deprioritize.
    pub fn push_sub_piece_last(&mut self, ordinal: u32) {
        self.sub_pieces.push_back(ordinal);
    }

    pub fn have_available_sub_piece(&self) -> bool {
        !self.sub_pieces.is_empty()
    }

    pub fn add_available_peer(&mut self, peer: Uuid) -> bool {
        self.available.insert(peer)
    }

    pub fn remove_available_peer(&mut self, peer: &Uuid) -> bool {
        self.available.remove(peer)
    }

    pub fn is_available_to(&self, peer: &Uuid) -> bool {
        self.available.contains(peer)
    }

    /// Wire request for the given ordinal; the final sub-piece is truncated.
    pub fn block_at(&self, ordinal: u32) -> Block {
        let begin = ordinal * BLOCK_LENGTH;
        Block {
            piece: self.index,
            offset: begin,
            length: std::cmp::min(BLOCK_LENGTH, self.byte_length - begin),
        }
    }
}

/// Index-based accessor over the pieces still missing locally. Completed
/// pieces are removed, so lookups for them return `None`.
#[derive(Debug)]
pub struct PieceTable {
    pieces: BTreeMap<u32, Piece>,
    info: TorrentInfo,
}

impl PieceTable {
    /// Table holding every piece the local bitfield lacks.
    pub fn missing_from(info: TorrentInfo, bitfield: &BitField) -> Self {
        let pieces = bitfield
            .missing()
            .map(|i| {
                let index = i as u32;
                (index, Piece::new(index, info.piece_size(index)))
            })
            .collect();
        Self { pieces, info }
    }

    pub fn info(&self) -> TorrentInfo {
        self.info
    }

    pub fn get(&self, index: u32) -> Option<&Piece> {
        self.pieces.get(&index)
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut Piece> {
        self.pieces.get_mut(&index)
    }

    pub fn remove(&mut self, index: u32) -> Option<Piece> {
        self.pieces.remove(&index)
    }

    /// Incomplete pieces in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Piece> {
        self.pieces.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Piece> {
        self.pieces.values_mut()
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }
}

use std::collections::{HashMap, VecDeque};

use uuid::Uuid;

/// Remote requests waiting on a disk read, in submission order, plus the
/// per-peer in-flight counts the abuse cap is enforced against.
#[derive(Debug, Default)]
pub struct UploadQueue {
    entries: VecDeque<UploadEntry>,
    in_flight: HashMap<Uuid, usize>,
}

#[derive(Debug, Clone, Copy)]
struct UploadEntry {
    index: u32,
    begin: u32,
    peer: Uuid,
}

impl UploadQueue {
    pub fn count_for(&self, peer: &Uuid) -> usize {
        self.in_flight.get(peer).copied().unwrap_or(0)
    }

    /// Caller must have rejected the peer already if its count is at the cap.
    pub fn enqueue(&mut self, index: u32, begin: u32, peer: Uuid) {
        self.entries.push_back(UploadEntry { index, begin, peer });
        *self.in_flight.entry(peer).or_insert(0) += 1;
    }

    /// Consume the first entry matching `(index, begin)`, whichever peer it
    /// belongs to, and hand back that peer. Reads complete one-for-one with
    /// submissions, so first-match keeps the counts exact even when two
    /// peers requested the same offset.
    pub fn complete(&mut self, index: u32, begin: u32) -> Option<Uuid> {
        let position = self
            .entries
            .iter()
            .position(|e| e.index == index && e.begin == begin)?;
        let entry = self.entries.remove(position)?;
        match self.in_flight.get_mut(&entry.peer) {
            Some(count) if *count > 1 => *count -= 1,
            _ => {
                self.in_flight.remove(&entry.peer);
            }
        }
        Some(entry.peer)
    }

    /// Drop everything a disposed peer still had queued.
    pub fn remove_peer(&mut self, peer: &Uuid) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.peer != *peer);
        self.in_flight.remove(peer);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.in_flight.clear();
    }
}

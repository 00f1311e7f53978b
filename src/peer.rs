use std::{collections::VecDeque, net::SocketAddr};

use anyhow::Context;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    bitfield::BitField,
    piece::{Block, DataBlock},
    protocol::{Extension, ExtensionHandshake},
    PEER_CHANNEL_CAPACITY,
};

/// Everything a peer connection can tell the coordinator. The transport
/// layer owns the socket and the wire framing; the coordinator only ever
/// sees these events.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Transport-level connect succeeded.
    Connect,
    /// The BitTorrent handshake completed.
    Handshake,
    Bitfield(BitField),
    HaveAll,
    HaveNone,
    Have { index: u32 },
    Choke { choked: bool },
    Interest { interested: bool },
    Suggest { index: u32 },
    AllowFast { index: u32 },
    Piece { index: u32, begin: u32, block: Bytes },
    Request { index: u32, begin: u32, length: u32 },
    RequestTimeout { index: u32, begin: u32, length: u32 },
    RejectRequest { index: u32, begin: u32, length: u32 },
    ExtensionHandshake(Box<ExtensionHandshake>),
    Extension { extension_id: u8, payload: Bytes },
    Disposed { reason: String },
}

/// Send operations the coordinator can issue towards a peer connection.
#[derive(Debug, Clone)]
pub enum PeerCommand {
    Connect,
    Handshake,
    Bitfield(BitField),
    Interested(bool),
    Choke(bool),
    Have { index: u32 },
    Request(Block),
    Cancel(Block),
    Piece(DataBlock),
    KeepAlive,
    RegisterExtension(&'static str),
    Extension { extension_id: u8, payload: Bytes },
    Dispose { reason: String },
}

/// A peer connection as handed to the coordinator: the command pipe in, the
/// event pipe out. Built by the transport layer (or, in tests, by
/// [`Peer::channel_pair`]).
#[derive(Debug)]
pub struct Peer {
    pub uuid: Uuid,
    pub addr: SocketAddr,
    pub event_rx: flume::Receiver<PeerEvent>,
    pub command_tx: flume::Sender<PeerCommand>,
}

/// The transport-side halves of a [`Peer`]'s pipes.
#[derive(Debug)]
pub struct PeerWire {
    pub event_tx: flume::Sender<PeerEvent>,
    pub command_rx: flume::Receiver<PeerCommand>,
}

impl Peer {
    pub fn channel_pair(addr: SocketAddr) -> (Self, PeerWire) {
        Self::with_capacity(addr, PEER_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(addr: SocketAddr, capacity: usize) -> (Self, PeerWire) {
        let (event_tx, event_rx) = flume::bounded(capacity);
        let (command_tx, command_rx) = flume::bounded(capacity);
        let peer = Self {
            uuid: Uuid::new_v4(),
            addr,
            event_rx,
            command_tx,
        };
        let wire = PeerWire {
            event_tx,
            command_rx,
        };
        (peer, wire)
    }
}

/// Choke/interest flags for one direction of a peer pair.
#[derive(Debug, Clone, Copy)]
pub struct Status {
    choked: bool,
    interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            choked: true,
            interested: false,
        }
    }
}

impl Status {
    pub fn set_choke(&mut self, force: bool) {
        self.choked = force;
    }

    pub fn is_choked(&self) -> bool {
        self.choked
    }

    pub fn set_interest(&mut self, force: bool) {
        self.interested = force;
    }

    pub fn is_interested(&self) -> bool {
        self.interested
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct Performance {
    pub downloaded: u64,
    pub uploaded: u64,
}

impl Performance {
    pub fn new(downloaded: u64, uploaded: u64) -> Self {
        Self {
            downloaded,
            uploaded,
        }
    }
}

/// Sliding window of byte-counter deltas, one entry per rate tick.
#[derive(Debug, Clone)]
pub struct PerformanceHistory {
    history: VecDeque<Performance>,
    // Snapshot of latest measurements. Used to calculate new measurements
    snapshot: Performance,
}

impl PerformanceHistory {
    const MAX_CAPACITY: usize = 20;

    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(Self::MAX_CAPACITY),
            snapshot: Performance::default(),
        }
    }

    pub fn update(&mut self, new: Performance) {
        if self.history.len() == Self::MAX_CAPACITY {
            self.history.pop_back();
        }
        let perf = Performance::new(
            new.downloaded - self.snapshot.downloaded,
            new.uploaded - self.snapshot.uploaded,
        );
        self.snapshot = new;
        self.history.push_front(perf);
    }

    /// Average download rate over the window, bytes per tick.
    pub fn download_speed(&self) -> u64 {
        if self.history.is_empty() {
            return 0;
        }
        let total: u64 = self.history.iter().map(|m| m.downloaded).sum();
        total / self.history.len() as u64
    }

    /// Average upload rate over the window, bytes per tick.
    pub fn upload_speed(&self) -> u64 {
        if self.history.is_empty() {
            return 0;
        }
        let total: u64 = self.history.iter().map(|m| m.uploaded).sum();
        total / self.history.len() as u64
    }
}

impl Default for PerformanceHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Coordinator-owned state of a hooked peer. The coordinator holds the only
/// mutable reference; all sends go through the bounded command pipe, where a
/// full pipe reads as backpressure.
#[derive(Debug)]
pub struct PeerLink {
    pub uuid: Uuid,
    pub addr: SocketAddr,
    command_tx: flume::Sender<PeerCommand>,
    /// Pieces the remote claims to have.
    pub bitfield: BitField,
    /// Our status towards the peer
    pub out_status: Status,
    /// Peer's status towards us
    pub in_status: Status,
    /// Pieces the remote suggested we fetch from it (BEP 6).
    pub suggested: Vec<u32>,
    /// Sub-pieces requested from this peer and not yet received.
    pub request_buffer: Vec<Block>,
    /// Amount of bytes downloaded from peer
    pub downloaded: u64,
    /// Amount of bytes uploaded to peer
    pub uploaded: u64,
    pub performance_history: PerformanceHistory,
    pub extension_handshake: Option<Box<ExtensionHandshake>>,
    /// Transport-level connect has succeeded.
    pub connected: bool,
    pub disposed: bool,
    /// Child token driving this peer's event-forwarding task.
    pub cancellation_token: CancellationToken,
}

impl PeerLink {
    pub fn new(peer: &Peer, num_pieces: usize, cancellation_token: CancellationToken) -> Self {
        Self {
            uuid: peer.uuid,
            addr: peer.addr,
            command_tx: peer.command_tx.clone(),
            bitfield: BitField::empty(num_pieces),
            out_status: Status::default(),
            in_status: Status::default(),
            suggested: Vec::new(),
            request_buffer: Vec::new(),
            downloaded: 0,
            uploaded: 0,
            performance_history: PerformanceHistory::new(),
            extension_handshake: None,
            connected: false,
            disposed: false,
            cancellation_token,
        }
    }

    fn send(&self, command: PeerCommand) {
        if let Err(e) = self.command_tx.try_send(command) {
            tracing::warn!(addr = %self.addr, "Dropping peer command: {e}");
        }
    }

    pub fn connect(&self) {
        self.send(PeerCommand::Connect);
    }

    pub fn register_extension(&self, name: &'static str) {
        self.send(PeerCommand::RegisterExtension(name));
    }

    pub fn send_handshake(&self) {
        self.send(PeerCommand::Handshake);
    }

    pub fn send_bitfield(&self, bitfield: BitField) {
        self.send(PeerCommand::Bitfield(bitfield));
    }

    pub fn send_interested(&mut self, force: bool) {
        self.out_status.set_interest(force);
        self.send(PeerCommand::Interested(force));
    }

    pub fn send_choke(&mut self, force: bool) {
        self.out_status.set_choke(force);
        self.send(PeerCommand::Choke(force));
    }

    pub fn send_have(&self, index: u32) {
        self.send(PeerCommand::Have { index });
    }

    pub fn send_keep_alive(&self) {
        self.send(PeerCommand::KeepAlive);
    }

    /// Ask the remote for a sub-piece. `false` means the command pipe is
    /// backed up (or gone) and nothing was sent.
    pub fn send_request(&mut self, block: Block) -> bool {
        match self.command_tx.try_send(PeerCommand::Request(block)) {
            Ok(()) => {
                self.request_buffer.push(block);
                true
            }
            Err(_) => false,
        }
    }

    /// Ship a block to the remote. `false` means backpressure; the caller
    /// decides what to do with the data.
    pub fn send_piece(&self, data: DataBlock) -> bool {
        self.command_tx.try_send(PeerCommand::Piece(data)).is_ok()
    }

    pub fn remove_request(&self, block: Block) {
        self.send(PeerCommand::Cancel(block));
    }

    /// Drop a sub-piece from the request buffer. Returns whether it was there.
    pub fn take_request(&mut self, block: Block) -> bool {
        match self.request_buffer.iter().position(|b| *b == block) {
            Some(position) => {
                self.request_buffer.swap_remove(position);
                true
            }
            None => false,
        }
    }

    pub fn send_extension_message<'e, T: Extension<'e>>(&self, msg: T) -> anyhow::Result<()> {
        let handshake = self
            .extension_handshake
            .as_ref()
            .context("peer does not support extensions")?;
        let extension_id = *handshake
            .messages
            .get(T::NAME)
            .context("extension is not supported by peer")?;
        self.command_tx.try_send(PeerCommand::Extension {
            extension_id,
            payload: msg.into(),
        })?;
        Ok(())
    }

    pub fn supports_ut_pex(&self) -> bool {
        self.extension_handshake
            .as_ref()
            .is_some_and(|h| h.pex_id().is_some())
    }

    pub fn client_name(&self) -> Option<&str> {
        self.extension_handshake.as_ref()?.client_name()
    }

    pub fn is_seeder(&self) -> bool {
        self.bitfield.is_full()
    }

    pub fn update_performance(&mut self) {
        self.performance_history
            .update(Performance::new(self.downloaded, self.uploaded));
    }

    /// Tear the connection down. Idempotent; the dispose reason only travels
    /// on the first call.
    pub fn dispose(&mut self, reason: &str) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        tracing::debug!(addr = %self.addr, reason, "Disposing peer");
        let _ = self.command_tx.try_send(PeerCommand::Dispose {
            reason: reason.to_owned(),
        });
        self.cancellation_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

    use tokio_util::sync::CancellationToken;

    use super::{Peer, PeerCommand, PeerLink, Performance, PerformanceHistory};
    use crate::{piece::Block, BLOCK_LENGTH};

    fn addr() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 6881))
    }

    #[test]
    fn send_request_reports_backpressure() {
        let (peer, wire) = Peer::with_capacity(addr(), 2);
        let mut link = PeerLink::new(&peer, 4, CancellationToken::new());
        let block = Block {
            piece: 0,
            offset: 0,
            length: BLOCK_LENGTH,
        };
        assert!(link.send_request(block));
        assert!(link.send_request(Block {
            offset: BLOCK_LENGTH,
            ..block
        }));
        // pipe is full now
        assert!(!link.send_request(Block {
            offset: 2 * BLOCK_LENGTH,
            ..block
        }));
        assert_eq!(link.request_buffer.len(), 2);
        drop(wire.command_rx);
        assert!(!link.send_request(block));
    }

    #[test]
    fn dispose_is_idempotent() {
        let (peer, wire) = Peer::channel_pair(addr());
        let mut link = PeerLink::new(&peer, 4, CancellationToken::new());
        link.dispose("first");
        link.dispose("second");
        assert!(link.disposed);
        assert!(link.cancellation_token.is_cancelled());
        let mut reasons = Vec::new();
        while let Ok(command) = wire.command_rx.try_recv() {
            if let PeerCommand::Dispose { reason } = command {
                reasons.push(reason);
            }
        }
        assert_eq!(reasons, vec!["first".to_string()]);
    }

    #[test]
    fn performance_history_window() {
        let mut history = PerformanceHistory::new();
        assert_eq!(history.download_speed(), 0);
        history.update(Performance::new(100, 10));
        history.update(Performance::new(300, 10));
        // deltas are 100 and 200
        assert_eq!(history.download_speed(), 150);
        assert_eq!(history.upload_speed(), 5);
        for i in 0..40 {
            history.update(Performance::new(300 + i, 10));
        }
        // window stays bounded
        assert!(history.download_speed() <= 1);
    }
}

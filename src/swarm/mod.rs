use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use anyhow::Context;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use uuid::Uuid;

use crate::{
    bitfield::BitField,
    peer::{Peer, PeerEvent, PeerLink},
    piece::{Block, DataBlock, PieceTable, TorrentInfo},
    protocol::{pex, pex::PexMessage, Extension, ExtensionHandshake},
    requests::TimeoutTable,
    selector::PieceSelector,
    storage::{FileManagerHandle, StorageFeedback},
    upload::UploadQueue,
    SwarmConfig, MAX_ACTIVE_PEERS, MAX_INBOUND_REQUEST_LENGTH, MAX_PEER_PENDING_REQUESTS,
    RATE_INTERVAL,
};


const PEX_MESSAGE_INTERVAL: Duration = Duration::from_secs(60);
/// BitTorrent connections idle out after 120 seconds.
const KEEP_ALIVE_DELAY: Duration = Duration::from_secs(110);
const SWARM_COMMAND_CAPACITY: usize = 100;

/// Control surface of a running swarm.
#[derive(Debug)]
pub enum SwarmCommand {
    /// Adopt an externally constructed peer connection.
    Hook(Peer),
    Pause,
    Resume,
    DisposeSeeders {
        reason: String,
    },
    PostState {
        tx: oneshot::Sender<SwarmState>,
    },
    Shutdown,
}

/// Events the swarm surfaces to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmNotification {
    /// PEX gossip produced an address worth connecting to.
    NewPeerFound(SocketAddr),
    /// Every piece is downloaded, verified and flushed.
    AllComplete,
    /// The last peer left the active set.
    NoActivePeer,
}

/// Internal bus: peer events tagged with their origin, plus the swarm's own
/// deferred work. Re-entrant scheduling always goes through here so handler
/// stack depth stays bounded.
#[derive(Debug)]
enum SwarmEvent {
    Peer(Uuid, PeerEvent),
    RequestPieces { peer: Uuid, hint: Option<u32> },
    RemoteRequest { peer: Uuid, block: Block },
}

#[derive(Debug, Clone)]
pub struct SwarmHandle {
    pub command_tx: mpsc::Sender<SwarmCommand>,
    pub cancellation_token: CancellationToken,
}

impl SwarmHandle {
    pub async fn hook_peer(&self, peer: Peer) -> anyhow::Result<()> {
        self.command_tx.send(SwarmCommand::Hook(peer)).await?;
        Ok(())
    }

    pub async fn pause(&self) -> anyhow::Result<()> {
        self.command_tx.send(SwarmCommand::Pause).await?;
        Ok(())
    }

    pub async fn resume(&self) -> anyhow::Result<()> {
        self.command_tx.send(SwarmCommand::Resume).await?;
        Ok(())
    }

    pub async fn dispose_seeders(&self, reason: impl Into<String>) -> anyhow::Result<()> {
        self.command_tx
            .send(SwarmCommand::DisposeSeeders {
                reason: reason.into(),
            })
            .await?;
        Ok(())
    }

    pub async fn state(&self) -> anyhow::Result<SwarmState> {
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(SwarmCommand::PostState { tx }).await?;
        rx.await.context("swarm is gone")
    }

    /// Ask the swarm to tear down. Idempotent.
    pub fn shutdown(&self) {
        self.cancellation_token.cancel();
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PeerState {
    pub uuid: Uuid,
    pub addr: SocketAddr,
    pub client_name: Option<String>,
    pub downloaded: u64,
    pub uploaded: u64,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub is_seeder: bool,
    pub pending_blocks: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SwarmState {
    pub num_pieces: usize,
    pub completed_pieces: usize,
    pub uploaded_total: u64,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub paused: bool,
    pub peers: Vec<PeerState>,
}

/// The hub between peer connections, the piece selector and the file
/// manager. Runs as a single task; every shared structure below is touched
/// only from it.
#[derive(Debug)]
pub struct Swarm {
    config: SwarmConfig,
    info: TorrentInfo,
    /// Pieces we have, mirrored to the file manager's persisted view.
    bitfield: BitField,
    pieces: PieceTable,
    selector: Box<dyn PieceSelector>,
    peers: HashMap<Uuid, PeerLink>,
    storage: FileManagerHandle,
    storage_rx: mpsc::Receiver<StorageFeedback>,
    timeouts: TimeoutTable,
    uploads: UploadQueue,
    pex: pex::PexState,
    /// Our external address as reported by remotes; used to drop
    /// self-advertisements.
    local_external_ip: Option<IpAddr>,
    /// Completed pieces written but not yet synced.
    flush_buffer: HashSet<u32>,
    paused: bool,
    /// Outgoing-request triggers deferred while paused.
    deferred_requests: VecDeque<(Uuid, Option<u32>)>,
    /// Remote requests deferred while paused, capped per peer.
    deferred_remote: HashMap<Uuid, VecDeque<Block>>,
    uploaded_total: u64,
    uploaded_notify_delta: u64,
    keep_alive_at: Option<tokio::time::Instant>,
    event_tx: mpsc::UnboundedSender<SwarmEvent>,
    event_rx: mpsc::UnboundedReceiver<SwarmEvent>,
    notify_tx: mpsc::UnboundedSender<SwarmNotification>,
    cancellation_token: CancellationToken,
    disposed: bool,
}

impl Swarm {
    pub fn new(
        config: SwarmConfig,
        info: TorrentInfo,
        bitfield: BitField,
        selector: Box<dyn PieceSelector>,
        storage: FileManagerHandle,
        storage_rx: mpsc::Receiver<StorageFeedback>,
    ) -> (Self, mpsc::UnboundedReceiver<SwarmNotification>) {
        debug_assert_eq!(bitfield.num_pieces(), info.piece_count());
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let pieces = PieceTable::missing_from(info, &bitfield);
        let swarm = Self {
            config,
            info,
            bitfield,
            pieces,
            selector,
            peers: HashMap::new(),
            storage,
            storage_rx,
            timeouts: TimeoutTable::default(),
            uploads: UploadQueue::default(),
            pex: pex::PexState::default(),
            local_external_ip: None,
            flush_buffer: HashSet::new(),
            paused: false,
            deferred_requests: VecDeque::new(),
            deferred_remote: HashMap::new(),
            uploaded_total: 0,
            uploaded_notify_delta: 0,
            keep_alive_at: None,
            event_tx,
            event_rx,
            notify_tx,
            cancellation_token: CancellationToken::new(),
            disposed: false,
        };
        (swarm, notify_rx)
    }

    pub fn start(self, task_tracker: &TaskTracker) -> SwarmHandle {
        let (command_tx, commands_rx) = mpsc::channel(SWARM_COMMAND_CAPACITY);
        let handle = SwarmHandle {
            command_tx,
            cancellation_token: self.cancellation_token.clone(),
        };
        task_tracker.spawn(self.run(commands_rx));
        handle
    }

    async fn run(mut self, mut commands_rx: mpsc::Receiver<SwarmCommand>) {
        let token = self.cancellation_token.clone();
        let mut pex_interval = tokio::time::interval(PEX_MESSAGE_INTERVAL);
        pex_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut rate_interval = tokio::time::interval(RATE_INTERVAL);
        rate_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(pieces = self.bitfield.num_pieces(), "Started swarm");

        loop {
            let keep_alive_at = self.keep_alive_at;
            tokio::select! {
                Some(event) = self.event_rx.recv() => self.handle_event(event),
                Some(feedback) = self.storage_rx.recv() => self.handle_storage_feedback(feedback).await,
                Some(command) = commands_rx.recv() => self.handle_command(command).await,
                _ = pex_interval.tick() => self.pex_tick(),
                _ = rate_interval.tick() => self.register_performance(),
                _ = sleep_until(keep_alive_at), if keep_alive_at.is_some() => self.broadcast_keep_alive(),
                _ = token.cancelled() => self.dispose().await,
            }
            if self.disposed {
                break;
            }
        }
    }

    async fn handle_command(&mut self, command: SwarmCommand) {
        match command {
            SwarmCommand::Hook(peer) => self.hook_peer(peer),
            SwarmCommand::Pause => self.pause(),
            SwarmCommand::Resume => self.resume(),
            SwarmCommand::DisposeSeeders { reason } => self.dispose_all_seeders(&reason),
            SwarmCommand::PostState { tx } => {
                let _ = tx.send(self.state());
            }
            SwarmCommand::Shutdown => self.dispose().await,
        }
    }

    fn handle_event(&mut self, event: SwarmEvent) {
        match event {
            SwarmEvent::Peer(peer, event) => self.handle_peer_event(peer, event),
            SwarmEvent::RequestPieces { peer, hint } => self.request_pieces(peer, hint),
            SwarmEvent::RemoteRequest { peer, block } => self.handle_remote_request(peer, block),
        }
    }

    /// Adopt a peer connection: forward its events onto the bus, offer our
    /// extensions, start connecting. No-op for our own external address and
    /// for peers already hooked.
    fn hook_peer(&mut self, peer: Peer) {
        if self
            .local_external_ip
            .is_some_and(|ip| ip == peer.addr.ip())
        {
            tracing::debug!(addr = %peer.addr, "Refusing to hook ourselves");
            return;
        }
        if self.peers.contains_key(&peer.uuid)
            || self.peers.values().any(|link| link.addr == peer.addr)
        {
            return;
        }
        if self.peers.len() >= MAX_ACTIVE_PEERS {
            tracing::warn!(
                peers = self.peers.len(),
                "Hooked past the active peer cap"
            );
        }
        let token = self.cancellation_token.child_token();
        let link = PeerLink::new(&peer, self.bitfield.num_pieces(), token.clone());
        let uuid = peer.uuid;
        let event_rx = peer.event_rx;
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = event_rx.recv_async() => match event {
                        Ok(event) => {
                            if event_tx.send(SwarmEvent::Peer(uuid, event)).is_err() {
                                break;
                            }
                        }
                        // transport went away without a dispose event
                        Err(_) => {
                            let _ = event_tx.send(SwarmEvent::Peer(
                                uuid,
                                PeerEvent::Disposed {
                                    reason: "connection closed".into(),
                                },
                            ));
                            break;
                        }
                    }
                }
            }
        });
        link.register_extension(PexMessage::NAME);
        link.connect();
        tracing::debug!(addr = %link.addr, "Hooked peer");
        self.peers.insert(uuid, link);
    }

    fn handle_peer_event(&mut self, peer: Uuid, event: PeerEvent) {
        if !self.peers.contains_key(&peer) {
            return;
        }
        match event {
            PeerEvent::Connect => self.handle_connect(peer),
            PeerEvent::Handshake => self.handle_handshake(peer),
            PeerEvent::Bitfield(bitfield) => self.handle_bitfield(peer, bitfield),
            PeerEvent::HaveAll => self.handle_have_all(peer),
            PeerEvent::HaveNone => self.handle_have_none(peer),
            PeerEvent::Have { index } => self.handle_have(peer, index),
            PeerEvent::Choke { choked } => self.handle_choke_change(peer, choked),
            PeerEvent::Interest { interested } => self.handle_interest_change(peer, interested),
            PeerEvent::Suggest { index } => self.handle_suggest(peer, index),
            PeerEvent::AllowFast { index } => self.handle_allow_fast(peer, index),
            PeerEvent::Piece {
                index,
                begin,
                block,
            } => self.handle_piece(peer, index, begin, block),
            PeerEvent::Request {
                index,
                begin,
                length,
            } => self.handle_remote_request(
                peer,
                Block {
                    piece: index,
                    offset: begin,
                    length,
                },
            ),
            PeerEvent::RequestTimeout {
                index,
                begin,
                length,
            } => {
                let block = Block {
                    piece: index,
                    offset: begin,
                    length,
                };
                tracing::debug!(%block, "Request timed out, parking it");
                self.timeouts.add(block, peer);
            }
            PeerEvent::RejectRequest {
                index,
                begin,
                length,
            } => self.handle_reject(
                peer,
                Block {
                    piece: index,
                    offset: begin,
                    length,
                },
            ),
            PeerEvent::ExtensionHandshake(handshake) => {
                self.handle_extension_handshake(peer, handshake)
            }
            PeerEvent::Extension {
                extension_id,
                payload,
            } => self.handle_extension(peer, extension_id, payload),
            PeerEvent::Disposed { reason } => self.dispose_peer(peer, &reason),
        }
    }

    fn handle_connect(&mut self, peer: Uuid) {
        let Some(link) = self.peers.get_mut(&peer) else {
            return;
        };
        tracing::debug!(addr = %link.addr, "Peer connected");
        link.connected = true;
        link.send_handshake();
    }

    fn handle_handshake(&mut self, peer: Uuid) {
        let bitfield = self.bitfield.clone();
        if let Some(link) = self.peers.get_mut(&peer) {
            link.send_bitfield(bitfield);
        }
    }

    fn handle_bitfield(&mut self, peer: Uuid, bitfield: BitField) {
        if bitfield.num_pieces() != self.bitfield.num_pieces() {
            self.dispose_peer(peer, "invalid bitfield");
            return;
        }
        if let Some(link) = self.peers.get_mut(&peer) {
            link.bitfield = bitfield;
        }
        self.update_interest(peer);
    }

    fn handle_have_all(&mut self, peer: Uuid) {
        let full = BitField::full(self.bitfield.num_pieces());
        if let Some(link) = self.peers.get_mut(&peer) {
            link.bitfield = full;
        }
        self.update_interest(peer);
    }

    fn handle_have_none(&mut self, peer: Uuid) {
        let empty = BitField::empty(self.bitfield.num_pieces());
        if let Some(link) = self.peers.get_mut(&peer) {
            link.bitfield = empty;
        }
        self.update_interest(peer);
    }

    /// Tell the peer whether it has anything we lack.
    fn update_interest(&mut self, peer: Uuid) {
        let local = &self.bitfield;
        let Some(link) = self.peers.get_mut(&peer) else {
            return;
        };
        let wanted = link.bitfield.pieces().find(|&index| !local.has(index));
        link.send_interested(wanted.is_some());
    }

    fn handle_have(&mut self, peer: Uuid, index: u32) {
        let Some(link) = self.peers.get_mut(&peer) else {
            return;
        };
        if link.bitfield.add(index as usize).is_err() {
            tracing::warn!(addr = %link.addr, index, "Have for an unknown piece");
            return;
        }
        if self.bitfield.has(index as usize) {
            return;
        }
        if !link.out_status.is_interested() {
            link.send_interested(true);
        }
        if let Some(piece) = self.pieces.get_mut(index) {
            piece.add_available_peer(peer);
        }
        let _ = self.event_tx.send(SwarmEvent::RequestPieces { peer, hint: None });
    }

    /// An unchoke opens every piece the peer holds as a source; a choke
    /// closes them again. Requests already in flight are left alone: the
    /// remote may still deliver, and timeouts recover the rest.
    fn handle_choke_change(&mut self, peer: Uuid, choked: bool) {
        let Some(link) = self.peers.get_mut(&peer) else {
            return;
        };
        link.in_status.set_choke(choked);
        if choked {
            for piece in self.pieces.iter_mut() {
                piece.remove_available_peer(&peer);
            }
        } else {
            let bitfield = &link.bitfield;
            for piece in self.pieces.iter_mut() {
                if bitfield.has(piece.index() as usize) {
                    piece.add_available_peer(peer);
                }
            }
            let _ = self.event_tx.send(SwarmEvent::RequestPieces { peer, hint: None });
        }
    }

    fn handle_interest_change(&mut self, peer: Uuid, interested: bool) {
        let Some(link) = self.peers.get_mut(&peer) else {
            return;
        };
        link.in_status.set_interest(interested);
        // unchoke anyone who wants from us, no fairness algorithm
        link.send_choke(!interested);
    }

    fn handle_suggest(&mut self, peer: Uuid, index: u32) {
        if self.bitfield.has(index as usize) || (index as usize) >= self.bitfield.num_pieces() {
            return;
        }
        if let Some(link) = self.peers.get_mut(&peer) {
            if !link.suggested.contains(&index) {
                link.suggested.push(index);
            }
        }
    }

    /// BEP 6: the piece may be requested even while choked.
    fn handle_allow_fast(&mut self, peer: Uuid, index: u32) {
        let Some(piece) = self.pieces.get_mut(index) else {
            return;
        };
        if !piece.have_available_sub_piece() {
            return;
        }
        piece.add_available_peer(peer);
        let _ = self.event_tx.send(SwarmEvent::RequestPieces {
            peer,
            hint: Some(index),
        });
    }

    fn handle_piece(&mut self, peer: Uuid, index: u32, begin: u32, bytes: Bytes) {
        let block = Block {
            piece: index,
            offset: begin,
            length: bytes.len() as u32,
        };
        // a parked request resolved late; cancel the re-issue bookkeeping
        if let Some(stalled) = self.timeouts.remove(block) {
            if stalled.origin != peer {
                if let Some(origin) = self.peers.get(&stalled.origin) {
                    if !origin.disposed {
                        origin.remove_request(block);
                    }
                }
            }
        }
        let Some(link) = self.peers.get_mut(&peer) else {
            return;
        };
        link.take_request(block);
        link.downloaded += bytes.len() as u64;
        self.storage.write(DataBlock::new(index, begin, bytes));
        let hint =
            self.selector
                .select_piece_on_receive(peer, &link.bitfield, index, begin, &self.pieces);
        let _ = self.event_tx.send(SwarmEvent::RequestPieces { peer, hint });
    }

    /// A remote wants data. Oversized requests and over-cap peers are cut
    /// loose; while paused we buffer a handful per peer and replay on
    /// resume.
    fn handle_remote_request(&mut self, peer: Uuid, block: Block) {
        if !self.peers.contains_key(&peer) {
            return;
        }
        if block.length > MAX_INBOUND_REQUEST_LENGTH {
            self.dispose_peer(peer, "request too large");
            return;
        }
        if self.paused {
            let pending = self.deferred_remote.entry(peer).or_default().len();
            if pending >= MAX_PEER_PENDING_REQUESTS {
                self.dispose_peer(peer, "too many requests");
            } else if let Some(queue) = self.deferred_remote.get_mut(&peer) {
                queue.push_back(block);
            }
            return;
        }
        if self.uploads.count_for(&peer) >= MAX_PEER_PENDING_REQUESTS {
            self.dispose_peer(peer, "too many requests");
            return;
        }
        self.uploads.enqueue(block.piece, block.offset, peer);
        self.storage.read(block);
    }

    fn handle_reject(&mut self, peer: Uuid, block: Block) {
        if let Some(link) = self.peers.get_mut(&peer) {
            link.take_request(block);
        }
        // deprioritize, the peer refused it for now
        if let Some(piece) = self.pieces.get_mut(block.piece) {
            piece.push_sub_piece_last(block.ordinal());
        }
    }

    fn handle_extension_handshake(&mut self, peer: Uuid, handshake: Box<ExtensionHandshake>) {
        if let Some(ip) = handshake.your_ip() {
            self.local_external_ip = Some(ip);
        }
        if let Some(link) = self.peers.get_mut(&peer) {
            tracing::debug!(
                addr = %link.addr,
                client = link.client_name().unwrap_or("unknown"),
                "Stored extension handshake"
            );
            link.extension_handshake = Some(handshake);
        }
    }

    fn handle_extension(&mut self, peer: Uuid, extension_id: u8, payload: Bytes) {
        match extension_id {
            PexMessage::CLIENT_ID => {
                if let Err(e) = self.handle_pex_message(payload) {
                    tracing::warn!("Failed to process pex message: {e}");
                }
            }
            _ => {
                tracing::trace!(peer = %peer, extension_id, "Ignoring unknown extension message");
            }
        }
    }

    fn handle_pex_message(&mut self, payload: Bytes) -> anyhow::Result<()> {
        let message = PexMessage::from_bytes(&payload).context("parse pex message")?;
        tracing::debug!(added = message.added.len(), "Received pex message");
        for addr in message.added {
            if self.local_external_ip.is_some_and(|ip| ip == addr.ip()) {
                continue;
            }
            let _ = self.notify_tx.send(SwarmNotification::NewPeerFound(addr));
        }
        Ok(())
    }

    /// The request-issuing core: pick a piece (honoring the hint), pop its
    /// next sub-piece and ship the request. With nothing fresh to give,
    /// re-issue the oldest stalled request instead.
    fn request_pieces(&mut self, peer: Uuid, hint: Option<u32>) {
        if self.paused {
            self.deferred_requests.push_back((peer, hint));
            return;
        }
        if !self.peers.contains_key(&peer) {
            return;
        }
        let selected = match hint {
            Some(index) => self.pieces.get(index).map(|piece| piece.index()),
            None => {
                let link = &self.peers[&peer];
                self.selector
                    .select_piece(peer, &link.bitfield, &self.pieces, &link.suggested)
            }
        };
        let Some(index) = selected else {
            self.reissue_stalled(peer);
            return;
        };
        let Some(piece) = self.pieces.get_mut(index) else {
            return;
        };
        let Some(ordinal) = piece.pop_sub_piece() else {
            return;
        };
        let block = piece.block_at(ordinal);
        let link = self.peers.get_mut(&peer).expect("peer is present");
        if link.send_request(block) {
            tracing::trace!(addr = %link.addr, %block, "Requested block");
        } else if let Some(piece) = self.pieces.get_mut(index) {
            // transport backpressure, retry this one first
            piece.push_sub_piece(ordinal);
        }
    }

    fn reissue_stalled(&mut self, peer: Uuid) {
        let Some(stalled) = self.timeouts.pop_front() else {
            return;
        };
        // best-effort cancel towards the stalled origin
        if let Some(origin) = self.peers.get_mut(&stalled.origin) {
            if !origin.disposed {
                origin.remove_request(stalled.block);
                origin.take_request(stalled.block);
            }
        }
        let Some(link) = self.peers.get_mut(&peer) else {
            self.timeouts.push_front(stalled);
            return;
        };
        if link.send_request(stalled.block) {
            tracing::debug!(addr = %link.addr, block = %stalled.block, "Re-issued stalled request");
        } else {
            self.timeouts.push_front(stalled);
        }
    }

    async fn handle_storage_feedback(&mut self, feedback: StorageFeedback) {
        match feedback {
            StorageFeedback::WriteComplete {
                index,
                begin,
                length,
            } => {
                self.selector.sub_piece_write_complete(index, begin, length);
            }
            StorageFeedback::ReadComplete {
                index,
                begin,
                block,
            } => self.sub_piece_read_complete(index, begin, block),
            StorageFeedback::PieceComplete { index } => {
                if let Err(e) = self.piece_complete(index).await {
                    tracing::error!("Failed to finalize piece {index}: {e}");
                    self.dispose().await;
                }
            }
        }
    }

    /// A disk read came back; serve the oldest matching upload slot.
    fn sub_piece_read_complete(&mut self, index: u32, begin: u32, bytes: Bytes) {
        let Some(peer) = self.uploads.complete(index, begin) else {
            tracing::warn!(index, begin, "Read completion without a matching upload");
            return;
        };
        let Some(link) = self.peers.get_mut(&peer) else {
            return;
        };
        if link.disposed {
            return;
        }
        let length = bytes.len() as u64;
        if !link.send_piece(DataBlock::new(index, begin, bytes)) {
            tracing::warn!(addr = %link.addr, "Dropping block for a backed up peer");
            return;
        }
        link.uploaded += length;
        self.uploaded_total += length;
        self.uploaded_notify_delta += length;
        if self.uploaded_notify_delta >= self.config.upload_notify_threshold {
            self.uploaded_notify_delta = 0;
            self.storage.update_upload(self.uploaded_total);
        }
    }

    /// A piece was verified and written: advertise it, queue it for sync,
    /// and close out the download once the bitfield fills up.
    async fn piece_complete(&mut self, index: u32) -> anyhow::Result<()> {
        if self.bitfield.has(index as usize) {
            return Ok(());
        }
        self.bitfield
            .add(index as usize)
            .context("piece index out of range")?;
        // peers may request the piece as soon as they see HAVE, so the
        // persisted bitfield goes first
        self.storage
            .update_bitfield(index)
            .await
            .context("persist bitfield")?;
        for link in self.peers.values() {
            if !link.disposed {
                link.send_have(index);
            }
        }
        self.pieces.remove(index);
        self.flush_buffer.insert(index);
        let all_complete = self.bitfield.is_full();
        let buffered = self.flush_buffer.len() as u64 * self.info.piece_length as u64;
        if buffered >= self.config.max_write_buffer_size || all_complete {
            let indices = std::mem::take(&mut self.flush_buffer);
            tracing::debug!(pieces = indices.len(), "Flushing write buffer");
            self.storage.flush(indices).await.context("flush pieces")?;
        }
        if all_complete {
            tracing::info!("All pieces are complete");
            let _ = self.notify_tx.send(SwarmNotification::AllComplete);
            self.dispose_all_seeders("download complete");
        }
        Ok(())
    }

    fn pex_tick(&mut self) {
        let current: HashSet<SocketAddr> = self
            .peers
            .values()
            .filter(|link| link.connected && !link.disposed)
            .map(|link| link.addr)
            .collect();
        let Some(message) = self.pex.tick(&current) else {
            return;
        };
        tracing::debug!(
            added = message.added.len(),
            dropped = message.dropped.len(),
            "Broadcasting pex delta"
        );
        for link in self.peers.values() {
            if !link.supports_ut_pex() {
                continue;
            }
            if let Err(e) = link.send_extension_message(message.clone()) {
                tracing::warn!(addr = %link.addr, "Failed to send pex message: {e}");
            }
        }
    }

    fn register_performance(&mut self) {
        for link in self.peers.values_mut() {
            link.update_performance();
        }
    }

    /// Aggregate download rate over the active set, bytes per second.
    pub fn download_speed(&self) -> u64 {
        self.peers
            .values()
            .map(|link| link.performance_history.download_speed())
            .sum()
    }

    /// Aggregate upload rate over the active set, bytes per second.
    pub fn upload_speed(&self) -> u64 {
        self.peers
            .values()
            .map(|link| link.performance_history.upload_speed())
            .sum()
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded_total
    }

    fn pause(&mut self) {
        tracing::info!("Pausing swarm");
        self.paused = true;
        // one keep-alive timer at a time; re-pausing just reschedules it
        self.keep_alive_at = Some(tokio::time::Instant::now() + KEEP_ALIVE_DELAY);
    }

    fn resume(&mut self) {
        tracing::info!("Resuming swarm");
        self.paused = false;
        self.keep_alive_at = None;
        for (peer, hint) in self.deferred_requests.drain(..) {
            let _ = self.event_tx.send(SwarmEvent::RequestPieces { peer, hint });
        }
        for (peer, queue) in std::mem::take(&mut self.deferred_remote) {
            for block in queue {
                let _ = self.event_tx.send(SwarmEvent::RemoteRequest { peer, block });
            }
        }
    }

    fn broadcast_keep_alive(&mut self) {
        tracing::debug!("Broadcasting keep alive");
        for link in self.peers.values() {
            if !link.disposed {
                link.send_keep_alive();
            }
        }
        self.keep_alive_at = self
            .paused
            .then(|| tokio::time::Instant::now() + KEEP_ALIVE_DELAY);
    }

    /// Drop peers that can give us nothing anymore.
    fn dispose_all_seeders(&mut self, reason: &str) {
        let seeders: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, link)| link.is_seeder())
            .map(|(uuid, _)| *uuid)
            .collect();
        for peer in seeders {
            self.dispose_peer(peer, reason);
        }
    }

    /// Remove a peer and unwind every structure that references it. Its
    /// unreceived sub-pieces go back to the head of their piece queues.
    fn dispose_peer(&mut self, peer: Uuid, reason: &str) {
        let Some(mut link) = self.peers.remove(&peer) else {
            return;
        };
        link.dispose(reason);
        for block in std::mem::take(&mut link.request_buffer) {
            self.timeouts.remove(block);
            if let Some(piece) = self.pieces.get_mut(block.piece) {
                piece.push_sub_piece(block.ordinal());
            }
        }
        for piece in self.pieces.iter_mut() {
            piece.remove_available_peer(&peer);
        }
        self.uploads.remove_peer(&peer);
        self.deferred_remote.remove(&peer);
        self.deferred_requests.retain(|(p, _)| *p != peer);
        if self.peers.is_empty() && !self.disposed {
            let _ = self.notify_tx.send(SwarmNotification::NoActivePeer);
        }
    }

    /// Idempotent teardown: sync what is dirty, drop every peer, stop the
    /// timers and the adapter tasks.
    async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        tracing::info!("Disposing swarm");
        if !self.flush_buffer.is_empty() {
            let indices = std::mem::take(&mut self.flush_buffer);
            if let Err(e) = self.storage.flush(indices).await {
                tracing::warn!("Final flush failed: {e}");
            }
        }
        let peers: Vec<Uuid> = self.peers.keys().copied().collect();
        for peer in peers {
            self.dispose_peer(peer, "Peer Manager disposed");
        }
        self.timeouts.clear();
        self.uploads.clear();
        self.deferred_requests.clear();
        self.deferred_remote.clear();
        self.keep_alive_at = None;
        self.cancellation_token.cancel();
    }

    pub fn state(&self) -> SwarmState {
        let peers = self
            .peers
            .values()
            .map(|link| PeerState {
                uuid: link.uuid,
                addr: link.addr,
                client_name: link.client_name().map(str::to_owned),
                downloaded: link.downloaded,
                uploaded: link.uploaded,
                download_speed: link.performance_history.download_speed(),
                upload_speed: link.performance_history.upload_speed(),
                am_choking: link.out_status.is_choked(),
                am_interested: link.out_status.is_interested(),
                peer_choking: link.in_status.is_choked(),
                peer_interested: link.in_status.is_interested(),
                is_seeder: link.is_seeder(),
                pending_blocks: link.request_buffer.len(),
            })
            .collect();
        SwarmState {
            num_pieces: self.bitfield.num_pieces(),
            completed_pieces: self.bitfield.count(),
            uploaded_total: self.uploaded_total,
            download_speed: self.download_speed(),
            upload_speed: self.upload_speed(),
            paused: self.paused,
            peers,
        }
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
impl Swarm {
    /// Drain the self-posted event bus, test only.
    pub(crate) fn pump(&mut self) {
        while let Ok(event) = self.event_rx.try_recv() {
            self.handle_event(event);
        }
    }
}

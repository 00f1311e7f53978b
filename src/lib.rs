use std::time::Duration;

mod bitfield;
mod peer;
mod piece;
pub mod protocol;
mod requests;
mod selector;
mod storage;
mod swarm;
mod upload;

pub use bitfield::BitField;
pub use peer::Peer;
pub use peer::PeerCommand;
pub use peer::PeerEvent;
pub use peer::PeerWire;
pub use peer::Status;
pub use piece::Block;
pub use piece::DataBlock;
pub use piece::Piece;
pub use piece::PieceTable;
pub use piece::TorrentInfo;
pub use requests::OutstandingRequest;
pub use requests::TimeoutTable;
pub use selector::LinearSelector;
pub use selector::PieceSelector;
pub use storage::FileManagerHandle;
pub use storage::StorageFeedback;
pub use storage::StorageMessage;
pub use swarm::PeerState;
pub use swarm::Swarm;
pub use swarm::SwarmCommand;
pub use swarm::SwarmHandle;
pub use swarm::SwarmNotification;
pub use swarm::SwarmState;
pub use upload::UploadQueue;

/// Client name advertised in the extended handshake `v` field.
pub const CLIENT_NAME: &str = "swarm 0.1.0";

/// Size of a sub-piece, the unit of wire request/piece messages.
pub const BLOCK_LENGTH: u32 = 16 * 1024;

/// Inbound requests above this length terminate the connection.
pub const MAX_INBOUND_REQUEST_LENGTH: u32 = 128 * 1024;

/// Cap on concurrently connected peers. Enforced by whoever hands peers
/// to [`SwarmHandle::hook_peer`]; the coordinator only complains.
pub const MAX_ACTIVE_PEERS: usize = 50;

/// Per-peer cap on in-flight remote requests, and on remote requests
/// buffered while the swarm is paused.
pub const MAX_PEER_PENDING_REQUESTS: usize = 6;

/// Capacity of the per-peer command pipe. A full pipe is the backpressure
/// signal: `send_request`/`send_piece` return `false` instead of blocking.
pub const PEER_CHANNEL_CAPACITY: usize = 512;

pub const STORAGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Dirty completed pieces are flushed once they exceed this many bytes.
    pub max_write_buffer_size: u64,
    /// Persist the uploaded-bytes counter every time it grows by this much.
    pub upload_notify_threshold: u64,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_write_buffer_size: 10 * 1024 * 1024,
            upload_notify_threshold: 10 * 1024 * 1024,
        }
    }
}

pub(crate) const RATE_INTERVAL: Duration = Duration::from_secs(1);

use std::collections::HashSet;

use anyhow::Context;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::piece::{Block, DataBlock};

/// Work submitted to the file manager. Writes and reads are fire-and-forget;
/// their completions come back as [`StorageFeedback`]. Bitfield updates and
/// flushes are acknowledged so the coordinator can order HAVE broadcasts
/// after the on-disk state.
#[derive(Debug)]
pub enum StorageMessage {
    Write(DataBlock),
    Read(Block),
    UpdateBitfield {
        index: u32,
        ack: oneshot::Sender<anyhow::Result<()>>,
    },
    Flush {
        indices: HashSet<u32>,
        ack: oneshot::Sender<anyhow::Result<()>>,
    },
    UpdateUpload {
        total: u64,
    },
}

/// Completions the file manager reports back to the coordinator.
#[derive(Debug)]
pub enum StorageFeedback {
    WriteComplete { index: u32, begin: u32, length: u32 },
    ReadComplete { index: u32, begin: u32, block: Bytes },
    /// The piece is fully written and hash-verified.
    PieceComplete { index: u32 },
}

/// Submission side of the file manager's channel. The file manager itself
/// (disk layout, hashing, persisted bitfield) lives behind it, out of this
/// crate's scope.
#[derive(Debug, Clone)]
pub struct FileManagerHandle {
    message_tx: mpsc::Sender<StorageMessage>,
}

impl FileManagerHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StorageMessage>) {
        let (message_tx, message_rx) = mpsc::channel(capacity);
        (Self { message_tx }, message_rx)
    }

    pub fn write(&self, data: DataBlock) {
        if let Err(e) = self.message_tx.try_send(StorageMessage::Write(data)) {
            tracing::warn!("Dropping block write: {e}");
        }
    }

    pub fn read(&self, block: Block) {
        if let Err(e) = self.message_tx.try_send(StorageMessage::Read(block)) {
            tracing::warn!("Dropping block read: {e}");
        }
    }

    /// Mark a piece present in the persisted bitfield and wait for it.
    pub async fn update_bitfield(&self, index: u32) -> anyhow::Result<()> {
        let (ack, done) = oneshot::channel();
        self.message_tx
            .send(StorageMessage::UpdateBitfield { index, ack })
            .await
            .context("file manager is gone")?;
        done.await.context("file manager dropped the ack")?
    }

    /// Sync the given pieces to disk and wait for it.
    pub async fn flush(&self, indices: HashSet<u32>) -> anyhow::Result<()> {
        let (ack, done) = oneshot::channel();
        self.message_tx
            .send(StorageMessage::Flush { indices, ack })
            .await
            .context("file manager is gone")?;
        done.await.context("file manager dropped the ack")?
    }

    pub fn update_upload(&self, total: u64) {
        if let Err(e) = self
            .message_tx
            .try_send(StorageMessage::UpdateUpload { total })
        {
            tracing::warn!("Dropping upload counter update: {e}");
        }
    }
}

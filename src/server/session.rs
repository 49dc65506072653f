//! Everything the server writes on a client's control connection.
//!
//! One task per control session owns the write half and drains a queue, so
//! snapshot answers and pushed changes never interleave and a slow client
//! only ever delays itself.

use std::sync::Arc;
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::change::{self, Content};
use crate::error::{Result, SyncError};
use crate::protocol::{Message, MessageType};
use crate::snapshot::SnapshotTransfer;
use crate::watcher::ChangeEvent;
use crate::wire::WireCodec;

/// Depth of each client's outbound queue.
pub const PUSH_QUEUE: usize = 256;

const GOODBYE_TIMEOUT: Duration = Duration::from_secs(2);

/// A change applied on the server, on its way to the other clients.
#[derive(Debug)]
pub struct PushedChange {
    pub event: ChangeEvent,
    /// The file as committed, for creations and modifications.
    pub content: Option<Vec<u8>>,
}

#[derive(Debug)]
pub enum Outbound {
    Session(u64),
    Snapshot(NamedTempFile),
    Refused,
    Push(Arc<PushedChange>),
}

/// The sending end of one session's queue.
#[derive(Debug, Clone)]
pub struct SessionOutbox {
    pub tx: mpsc::Sender<Outbound>,
    /// Ends the session, e.g. when it fell behind.
    pub kick: CancellationToken,
}

impl SessionOutbox {
    pub fn queue(&self, item: Outbound) -> Result<()> {
        self.tx
            .try_send(item)
            .map_err(|_| SyncError::Transfer("client's outbound queue is not accepting".into()))
    }
}

/// Writes queued items in order until the queue closes or `kick` fires.
pub async fn deliver_all(
    codec: WireCodec,
    transfer: SnapshotTransfer,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Outbound>,
    kick: CancellationToken,
    id: u64,
) {
    loop {
        let item = tokio::select! {
            _ = kick.cancelled() => {
                let goodbye_msg = Message::new(MessageType::Disconnect);
                let goodbye = codec.write_message(&mut writer, &goodbye_msg);
                if tokio::time::timeout(GOODBYE_TIMEOUT, goodbye).await.is_err() {
                    debug!("Client {} did not take its DISCONNECT", id);
                }
                break;
            }
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        let delivered = tokio::select! {
            _ = kick.cancelled() => break,
            delivered = deliver(&codec, &transfer, &mut writer, item) => delivered,
        };
        if let Err(e) = delivered {
            warn!("Lost client {}: {}", id, e);
            kick.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn deliver(
    codec: &WireCodec,
    transfer: &SnapshotTransfer,
    writer: &mut OwnedWriteHalf,
    item: Outbound,
) -> Result<()> {
    match item {
        Outbound::Session(id) => {
            let payload = id.to_be_bytes().to_vec();
            codec
                .write_message(writer, &Message::with_payload(MessageType::Session, payload))
                .await
        }
        Outbound::Snapshot(archive) => {
            let len = transfer.send_archive(writer, archive).await?;
            info!("Sent snapshot ({} bytes)", len);
            Ok(())
        }
        Outbound::Refused => {
            codec
                .write_message(writer, &Message::new(MessageType::ErrorResponse))
                .await
        }
        Outbound::Push(change) => {
            let mut body = change.content.as_deref();
            let content: Option<Content<'_>> = body.as_mut().map(|bytes| {
                let len = bytes.len() as u64;
                let source: &mut (dyn AsyncRead + Unpin + Send) = bytes;
                (source, len)
            });
            change::write_change(codec, writer, &change.event, content).await?;
            debug!("Passed on {:?}", change.event);
            Ok(())
        }
    }
}

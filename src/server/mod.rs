//! The sync server: bootstrap snapshots and pushed changes on the control
//! port, one-shot change submissions on the change port.

mod registry;
mod session;

pub use registry::{ClientRegistry, Registration};
pub use session::PushedChange;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::change;
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::protocol::{Header, Message, MessageType};
use crate::snapshot::SnapshotTransfer;
use crate::tree::{DirectoryTree, StagedFile};
use crate::watcher::{ChangeEvent, ChangeKind};
use crate::wire::WireCodec;
use session::{Outbound, SessionOutbox, PUSH_QUEUE};

const REFUSAL_LINGER: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Port {
    Control,
    Changes,
}

enum Step {
    Continue,
    Close,
}

pub struct SyncServer {
    control: TcpListener,
    changes: TcpListener,
    state: Arc<ServerState>,
}

struct ServerState {
    codec: WireCodec,
    transfer: SnapshotTransfer,
    tree: DirectoryTree,
    registry: Arc<ClientRegistry>,
    first_read_timeout: Duration,
}

impl SyncServer {
    /// Binds the control and change ports named by `config`.
    pub async fn bind(config: Config) -> Result<Self> {
        let control_addr = config.control_bind_addr()?;
        let change_addr = config.change_bind_addr()?;
        let control = TcpListener::bind(control_addr).await.map_err(|e| {
            error!("Failed to bind control port {}: {}", control_addr, e);
            SyncError::Io(e)
        })?;
        let changes = TcpListener::bind(change_addr).await.map_err(|e| {
            error!("Failed to bind change port {}: {}", change_addr, e);
            SyncError::Io(e)
        })?;
        Self::from_listeners(config, control, changes).await
    }

    /// Serves on listeners bound by the caller.
    pub async fn from_listeners(
        config: Config,
        control: TcpListener,
        changes: TcpListener,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&config.directory)
            .await
            .map_err(|e| SyncError::fs(&config.directory, e))?;

        let codec = config.codec();
        let state = ServerState {
            transfer: SnapshotTransfer::new(codec.clone(), config.archiver(), &config.scratch_dir),
            codec,
            tree: DirectoryTree::new(config.directory.clone()),
            registry: ClientRegistry::new(config.max_clients),
            first_read_timeout: config.first_read_timeout,
        };
        Ok(Self {
            control,
            changes,
            state: Arc::new(state),
        })
    }

    pub fn control_addr(&self) -> Result<SocketAddr> {
        Ok(self.control.local_addr()?)
    }

    pub fn change_addr(&self) -> Result<SocketAddr> {
        Ok(self.changes.local_addr()?)
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        self.state.registry.clone()
    }

    /// Accepts connections until `cancel` fires, then waits for every
    /// worker to finish.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!(
            "Serving {:?} on {} (changes on {})",
            self.state.tree.root(),
            self.control_addr()?,
            self.change_addr()?
        );

        let mut workers = JoinSet::new();
        let mut next_id = 0u64;

        loop {
            let (accepted, port) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.control.accept() => (accepted, Port::Control),
                accepted = self.changes.accept() => (accepted, Port::Changes),
                Some(finished) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = finished {
                        error!("Connection worker panicked: {}", e);
                    }
                    continue;
                }
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            next_id += 1;
            let id = next_id;
            debug!("Accepted connection {} from {} on {:?} port", id, peer, port);

            let state = self.state.clone();
            let cancel = cancel.clone();
            match port {
                Port::Control => match self.state.registry.register(id, peer) {
                    Some(registration) => {
                        workers.spawn(async move {
                            if let Err(e) = state.serve_control(stream, registration, cancel).await {
                                error!("Client {} from {} failed: {}", id, peer, e);
                            }
                        });
                    }
                    None => {
                        warn!(
                            "Refusing {}: all {} client slots are taken",
                            peer,
                            self.state.registry.capacity()
                        );
                        workers.spawn(async move { state.refuse(stream).await });
                    }
                },
                Port::Changes => {
                    workers.spawn(async move {
                        if let Err(e) = state.serve_changes(stream, id, cancel).await {
                            error!("Connection {} from {} failed: {}", id, peer, e);
                        }
                    });
                }
            }
        }

        info!("Shutting down, waiting for {} connections", workers.len());
        while let Some(finished) = workers.join_next().await {
            if let Err(e) = finished {
                error!("Connection worker panicked: {}", e);
            }
        }
        info!("Server stopped");
        Ok(())
    }
}

impl ServerState {
    async fn refuse(&self, mut stream: TcpStream) {
        if let Err(e) = self
            .codec
            .write_message(&mut stream, &Message::new(MessageType::ErrorResponse))
            .await
        {
            debug!("Could not send refusal: {}", e);
        }
        let _ = stream.shutdown().await;
        // Closing with unread input would reset the connection and could
        // discard the refusal before the client reads it.
        let _ = tokio::time::timeout(
            REFUSAL_LINGER,
            tokio::io::copy(&mut stream, &mut tokio::io::sink()),
        )
        .await;
    }

    /// Serves one registered client: snapshot requests in, snapshots and
    /// pushed changes out through the session's queue.
    async fn serve_control(
        &self,
        stream: TcpStream,
        registration: Registration,
        cancel: CancellationToken,
    ) -> Result<()> {
        let id = registration.id();
        let (mut reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(PUSH_QUEUE);
        let kick = cancel.child_token();
        let outbox = SessionOutbox {
            tx,
            kick: kick.clone(),
        };
        let delivery = tokio::spawn(session::deliver_all(
            self.codec.clone(),
            self.transfer.clone(),
            writer,
            rx,
            kick.clone(),
            id,
        ));

        let mut first = true;
        let result = loop {
            let header = tokio::select! {
                _ = kick.cancelled() => break Ok(()),
                header = self.read_header(&mut reader, first) => header,
            };
            first = false;
            let header = match header {
                Ok(Some(header)) => header,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            debug!("Client {}: {} ({} bytes)", id, header.kind, header.payload_size);
            match header.kind {
                MessageType::GetSnapshot => {
                    if let Err(e) = self.bootstrap(id, &outbox).await {
                        break Err(e);
                    }
                }
                MessageType::Disconnect => {
                    info!("Client {} disconnected", id);
                    break Ok(());
                }
                other => {
                    break Err(SyncError::Protocol(format!(
                        "unexpected {other} on the control port"
                    )))
                }
            }
        };

        drop(registration);
        kick.cancel();
        if let Err(e) = delivery.await {
            error!("Delivery to client {} panicked: {}", id, e);
        }
        result
    }

    /// Packs a snapshot for session `id` and subscribes it to pushes.
    ///
    /// Both happen under the tree lock, so every change committed after the
    /// snapshot was taken is queued behind it.
    async fn bootstrap(&self, id: u64, outbox: &SessionOutbox) -> Result<()> {
        let tree = self.tree.lock().await;
        match tree.pack(&self.transfer).await {
            Ok(archive) => {
                outbox.queue(Outbound::Session(id))?;
                outbox.queue(Outbound::Snapshot(archive))?;
                self.registry.subscribe(id, outbox.clone());
            }
            Err(e) => {
                error!("Failed to archive {:?}: {}", self.tree.root(), e);
                outbox.queue(Outbound::Refused)?;
            }
        }
        Ok(())
    }

    /// Runs the dispatch loop for one change-port connection.
    async fn serve_changes(
        &self,
        mut stream: TcpStream,
        id: u64,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut origin = None;
        let mut first = true;
        loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = stream.shutdown().await;
                    return Ok(());
                }
                step = self.step(&mut stream, id, first, &mut origin) => step?,
            };
            first = false;
            if let Step::Close = step {
                debug!("Connection {} closed", id);
                return Ok(());
            }
        }
    }

    async fn read_header<R: AsyncRead + Unpin>(&self, reader: &mut R, first: bool) -> Result<Option<Header>> {
        if !first {
            return self.codec.read_message(reader).await;
        }
        tokio::time::timeout(self.first_read_timeout, self.codec.read_message(reader))
            .await
            .map_err(|_| SyncError::Timeout(self.first_read_timeout))?
    }

    async fn step(
        &self,
        stream: &mut TcpStream,
        id: u64,
        first: bool,
        origin: &mut Option<u64>,
    ) -> Result<Step> {
        let Some(header) = self.read_header(stream, first).await? else {
            return Ok(Step::Close);
        };
        debug!("Connection {}: {} ({} bytes)", id, header.kind, header.payload_size);

        match header.kind {
            MessageType::Session => {
                let payload = self.codec.read_payload(stream, &header, 8).await?;
                let session: [u8; 8] = payload.as_slice().try_into().map_err(|_| {
                    SyncError::Protocol(format!("session id of {} bytes", payload.len()))
                })?;
                *origin = Some(u64::from_be_bytes(session));
                Ok(Step::Continue)
            }
            kind if change::change_kind(kind).is_some() => {
                // Everything arriving from the peer is read before the tree
                // is locked, so a stalled sender only holds up itself.
                let head = change::read_change_head(&self.codec, stream, &header).await?;
                let staged = match head.content_len {
                    Some(len) => Some(self.tree.stage(&self.codec, stream, &head.event.path, len).await),
                    None => None,
                };
                let outcome = self.apply(head.event, staged, *origin).await;
                self.acknowledge(stream, header.kind, outcome).await
            }
            MessageType::Disconnect => {
                info!("Connection {} disconnected", id);
                Ok(Step::Close)
            }
            other => Err(SyncError::Protocol(format!(
                "unexpected {other} on the change port"
            ))),
        }
    }

    /// Applies a change under the tree lock, then queues it for every other
    /// subscribed client while still holding the lock.
    async fn apply(
        &self,
        event: ChangeEvent,
        staged: Option<Result<StagedFile>>,
        origin: Option<u64>,
    ) -> Result<()> {
        let tree = self.tree.lock().await;
        let content = match (event.kind, staged) {
            (ChangeKind::Created | ChangeKind::Modified, Some(staged)) => {
                tree.commit(staged?)?;
                if !self.registry.has_subscribers(origin) {
                    return Ok(());
                }
                match tree.read(&event.path).await {
                    Ok(content) => Some(content),
                    Err(e) => {
                        warn!("Not passing on {}: {}", event.path, e);
                        return Ok(());
                    }
                }
            }
            (ChangeKind::Deleted, None) => {
                tree.delete(&event.path).await?;
                None
            }
            (ChangeKind::Renamed, None) => {
                let from = event.old_path.as_deref().ok_or_else(|| {
                    SyncError::Protocol(format!("rename of {} has no old path", event.path))
                })?;
                tree.rename(from, &event.path).await?;
                None
            }
            (kind, _) => {
                return Err(SyncError::Protocol(format!(
                    "{kind:?} change with mismatched content"
                )))
            }
        };

        let pushed = self
            .registry
            .broadcast(origin, Arc::new(PushedChange { event, content }));
        if pushed > 0 {
            debug!("Passed the change on to {} clients", pushed);
        }
        Ok(())
    }

    /// Reports the outcome of a file action.
    ///
    /// Filesystem failures are answered and the connection stays open;
    /// anything else means the stream can no longer be trusted.
    async fn acknowledge(
        &self,
        stream: &mut TcpStream,
        kind: MessageType,
        outcome: Result<()>,
    ) -> Result<Step> {
        let reply = match outcome {
            Ok(()) => MessageType::ValidResponse,
            Err(e @ SyncError::Filesystem { .. }) => {
                warn!("Could not apply {}: {}", kind, e);
                MessageType::ErrorResponse
            }
            Err(e) => return Err(e),
        };
        self.codec.write_message(stream, &Message::new(reply)).await?;
        Ok(Step::Continue)
    }
}

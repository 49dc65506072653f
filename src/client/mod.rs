mod echo;

pub use echo::EchoFilter;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::change::{self, Content};
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::protocol::{Header, Message, MessageType};
use crate::snapshot::SnapshotTransfer;
use crate::tree::DirectoryTree;
use crate::watcher::{ChangeEvent, ChangeKind, DirectoryWatcher};
use crate::wire::WireCodec;

/// Connects and bootstraps, then forwards local changes until `cancel`
/// fires or the server hangs up.
pub async fn run(config: Config, cancel: CancellationToken) -> Result<()> {
    SyncClient::connect(config).await?.run(cancel).await
}

/// Opens a TCP connection, turning refusal and timeout into `Connect` errors.
pub async fn connect_to(addr: &str, limit: Duration) -> Result<TcpStream> {
    let stream = match tokio::time::timeout(limit, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(SyncError::Connect {
                addr: addr.to_string(),
                source,
            })
        }
        Err(_) => {
            return Err(SyncError::Connect {
                addr: addr.to_string(),
                source: io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no answer within {limit:?}"),
                ),
            })
        }
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// The client's side of the conversation with one server.
///
/// Watcher callbacks get this handle instead of reaching for shared state.
/// Its mutex covers the control writer and every change submission, so two
/// events never interleave on the wire and reach the server in the order
/// they were submitted.
#[derive(Debug)]
pub struct ClientSession {
    codec: WireCodec,
    tree: DirectoryTree,
    change_addr: String,
    connect_timeout: Duration,
    retry_attempts: u32,
    retry_delay: Duration,
    /// Control session id assigned by the server at bootstrap.
    session_id: Option<u64>,
    echoes: EchoFilter,
    outbound: Mutex<Option<OwnedWriteHalf>>,
}

impl ClientSession {
    fn new(config: &Config, writer: OwnedWriteHalf, session_id: Option<u64>) -> Self {
        Self {
            codec: config.codec(),
            tree: DirectoryTree::new(config.directory.clone()),
            change_addr: config.change_addr(),
            connect_timeout: config.connect_timeout,
            retry_attempts: config.retry_attempts.max(1),
            retry_delay: config.retry_delay,
            session_id,
            echoes: EchoFilter::default(),
            outbound: Mutex::new(Some(writer)),
        }
    }

    pub fn session_id(&self) -> Option<u64> {
        self.session_id
    }

    /// Sends one change to the server over its own connection and waits
    /// for the acknowledgement.
    pub async fn submit(&self, change: &ChangeEvent) -> Result<()> {
        let _outbound = self.outbound.lock().await;
        change::validate(change)?;
        let kind = change::message_type(change.kind);

        // Opened before connecting so an unreadable file costs no connection.
        let mut file = match change.kind {
            ChangeKind::Created | ChangeKind::Modified => {
                Some(self.open_when_ready(&change.path).await?)
            }
            _ => None,
        };

        let mut stream = connect_to(&self.change_addr, self.connect_timeout).await?;
        if let Some(id) = self.session_id {
            self.codec
                .write_message(
                    &mut stream,
                    &Message::with_payload(MessageType::Session, id.to_be_bytes().to_vec()),
                )
                .await?;
        }
        let content = match file.as_mut() {
            Some((file, len)) => {
                let source: &mut (dyn AsyncRead + Unpin + Send) = file;
                Some::<Content<'_>>((source, *len))
            }
            None => None,
        };
        change::write_change(&self.codec, &mut stream, change, content).await?;

        let ack = self
            .codec
            .read_message(&mut stream)
            .await
            .map_err(|e| e.into_transfer("acknowledgement"))?;
        let _ = stream.shutdown().await;

        match ack.map(|h| h.kind) {
            Some(MessageType::ValidResponse) => {
                info!("Server applied {} {}", kind, change.path);
                Ok(())
            }
            Some(MessageType::ErrorResponse) => Err(SyncError::Transfer(format!(
                "server could not apply {} {}",
                kind, change.path
            ))),
            Some(other) => Err(SyncError::Protocol(format!(
                "expected an acknowledgement, got {other}"
            ))),
            None => Err(SyncError::Transfer(format!(
                "server closed the connection before acknowledging {} {}",
                kind, change.path
            ))),
        }
    }

    /// Waits until the watcher's writer has let go of the file.
    ///
    /// A file that no longer exists fails at once; anything else is retried
    /// `retry_attempts` times.
    async fn open_when_ready(&self, path: &str) -> Result<(tokio::fs::File, u64)> {
        let full = self.tree.root().join(path);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let opened = match tokio::fs::File::open(&full).await {
                Ok(file) => file.metadata().await.map(|meta| (file, meta)),
                Err(e) => Err(e),
            };
            match opened {
                Ok((file, meta)) if meta.is_file() => return Ok((file, meta.len())),
                Ok(_) => {
                    return Err(SyncError::fs(
                        &full,
                        io::Error::new(io::ErrorKind::Other, "not a regular file"),
                    ))
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(SyncError::fs(&full, e))
                }
                Err(e) if attempt >= self.retry_attempts => {
                    return Err(SyncError::fs(&full, e))
                }
                Err(e) => {
                    debug!(
                        "{:?} not readable yet (attempt {}/{}): {}",
                        full, attempt, self.retry_attempts, e
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// Applies a change the server passed on from another client.
    ///
    /// Local filesystem failures are logged and skipped; an error means the
    /// control stream is out of step.
    async fn apply_push<R: AsyncRead + Unpin>(&self, reader: &mut R, header: &Header) -> Result<()> {
        let head = change::read_change_head(&self.codec, reader, header).await?;
        let staged = match head.content_len {
            Some(len) => match self.tree.stage(&self.codec, reader, &head.event.path, len).await {
                Ok(staged) => Some(staged),
                Err(e @ SyncError::Filesystem { .. }) => {
                    warn!("Could not apply pushed {:?}: {}", head.event, e);
                    return Ok(());
                }
                Err(e) => return Err(e),
            },
            None => None,
        };

        let tree = self.tree.lock().await;
        let applied = match (&head.event.kind, staged) {
            (_, Some(staged)) => tree.commit(staged),
            (ChangeKind::Deleted, None) => tree.delete(&head.event.path).await,
            (ChangeKind::Renamed, None) => match head.event.old_path.as_deref() {
                Some(from) => tree.rename(from, &head.event.path).await,
                None => Err(SyncError::Protocol("pushed rename has no old path".into())),
            },
            (kind, None) => Err(SyncError::Protocol(format!(
                "pushed {kind:?} arrived without content"
            ))),
        };
        match applied {
            Ok(()) => {
                self.echoes.record(self.tree.root(), &head.event);
                info!("Applied {} {} from the server", header.kind, head.event.path);
                Ok(())
            }
            Err(e @ SyncError::Filesystem { .. }) => {
                warn!("Could not apply pushed {:?}: {}", head.event, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Whether a watcher event only reflects a change pushed by the server.
    pub async fn is_echo(&self, change: &ChangeEvent) -> bool {
        // Pushes record what they left while holding the lock.
        let _tree = self.tree.lock().await;
        self.echoes.is_echo(self.tree.root(), change)
    }

    /// Says goodbye on the control connection and closes it.
    pub async fn disconnect(&self) {
        let mut outbound = self.outbound.lock().await;
        let Some(mut writer) = outbound.take() else {
            return;
        };
        if let Err(e) = self
            .codec
            .write_message(&mut writer, &Message::new(MessageType::Disconnect))
            .await
        {
            debug!("Could not send DISCONNECT: {}", e);
        }
        let _ = writer.shutdown().await;
        info!("Disconnected from server");
    }
}

/// A bootstrapped client, ready to forward changes.
pub struct SyncClient {
    config: Config,
    session: Arc<ClientSession>,
    control: OwnedReadHalf,
}

impl SyncClient {
    /// Connects to the control port and downloads the server's snapshot
    /// into the local directory.
    pub async fn connect(config: Config) -> Result<Self> {
        let addr = config.control_addr();
        let stream = connect_to(&addr, config.connect_timeout).await?;
        info!("Connected to {}", addr);

        let (mut reader, mut writer) = stream.into_split();
        let codec = config.codec();
        codec
            .write_message(&mut writer, &Message::new(MessageType::GetSnapshot))
            .await?;
        let session_id = read_session_id(&codec, &mut reader).await?;
        debug!("Server assigned session {}", session_id);

        let transfer = SnapshotTransfer::new(codec, config.archiver(), &config.scratch_dir);
        transfer
            .receive_snapshot(&mut reader, &config.directory)
            .await?;

        let session = Arc::new(ClientSession::new(&config, writer, Some(session_id)));
        Ok(Self {
            config,
            session,
            control: reader,
        })
    }

    pub fn session(&self) -> Arc<ClientSession> {
        self.session.clone()
    }

    /// Watches the local directory and forwards every change, while
    /// applying the changes the server passes on from other clients.
    ///
    /// Returns once `cancel` fires or the server sends `DISCONNECT`; a
    /// change that cannot be delivered is logged and dropped.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let Self {
            config,
            session,
            control,
        } = self;
        let cancel = cancel.child_token();

        let listener = tokio::spawn(listen_control(session.clone(), control, cancel.clone()));

        let result = match DirectoryWatcher::new(&config.directory, config.ignore.clone()) {
            Ok(mut watcher) => {
                watcher
                    .watch(&cancel, |change| {
                        let session = session.clone();
                        async move {
                            if session.is_echo(&change).await {
                                debug!("Not forwarding {:?}: it came from the server", change);
                            } else if let Err(e) = session.submit(&change).await {
                                error!("Dropping change {:?}: {}", change, e);
                            }
                            Ok(())
                        }
                    })
                    .await
            }
            Err(e) => Err(e),
        };

        cancel.cancel();
        session.disconnect().await;
        if let Err(e) = listener.await {
            warn!("Control listener ended abnormally: {}", e);
        }
        result
    }
}

/// Reads the `SESSION` message that opens the server's bootstrap answer.
async fn read_session_id(codec: &WireCodec, reader: &mut OwnedReadHalf) -> Result<u64> {
    let header = codec
        .read_message(reader)
        .await
        .map_err(|e| e.into_transfer("session header"))?
        .ok_or_else(|| SyncError::Transfer("connection closed before the snapshot".into()))?;
    match header.kind {
        MessageType::Session => {
            let payload = codec
                .read_payload(reader, &header, 8)
                .await
                .map_err(|e| e.into_transfer("session id"))?;
            let id: [u8; 8] = payload.as_slice().try_into().map_err(|_| {
                SyncError::Protocol(format!("session id of {} bytes", payload.len()))
            })?;
            Ok(u64::from_be_bytes(id))
        }
        MessageType::ErrorResponse => Err(SyncError::Protocol(
            "server refused the connection".into(),
        )),
        other => Err(SyncError::Protocol(format!("expected SESSION, got {other}"))),
    }
}

/// Reads server-initiated messages until the session ends.
async fn listen_control(
    session: Arc<ClientSession>,
    mut reader: OwnedReadHalf,
    cancel: CancellationToken,
) {
    let codec = &session.codec;
    loop {
        let header = tokio::select! {
            _ = cancel.cancelled() => return,
            header = codec.read_message(&mut reader) => header,
        };
        let handled = match header {
            Ok(Some(header)) if header.kind == MessageType::Disconnect => {
                info!("Server requested disconnect");
                cancel.cancel();
                return;
            }
            Ok(Some(header)) if change::change_kind(header.kind).is_some() => {
                session.apply_push(&mut reader, &header).await
            }
            Ok(Some(header)) => {
                info!("Ignoring {} from server", header.kind);
                codec
                    .receive_stream(&mut reader, &mut tokio::io::sink(), header.payload_size)
                    .await
            }
            Ok(None) => {
                warn!("Server closed the control connection");
                cancel.cancel();
                return;
            }
            Err(e) => Err(e),
        };
        if let Err(e) = handled {
            error!("Control connection broke: {}", e);
            cancel.cancel();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MAX_PATH_LEN;
    use std::path::Path;
    use tokio::net::TcpListener;

    fn config(dir: &Path, change_port: u16) -> Config {
        Config {
            directory: dir.to_path_buf(),
            password: "pw".into(),
            ip: "127.0.0.1".into(),
            port: 1,
            change_port: Some(change_port),
            retry_attempts: 2,
            retry_delay: Duration::from_millis(10),
            ..Config::default()
        }
    }

    /// A detached writer half for sessions whose control path is unused.
    async fn control_writer() -> OwnedWriteHalf {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, _server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        client.unwrap().into_split().1
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = connect_to(&addr, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, SyncError::Connect { .. }));
    }

    #[tokio::test]
    async fn vanished_file_fails_without_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let session = ClientSession::new(&config(dir.path(), port), control_writer().await, None);

        let err = session
            .submit(&ChangeEvent::created("missing.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Filesystem { .. }));

        let nothing = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn rename_sends_old_path_then_new_path() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cfg = config(dir.path(), port);
        let codec = cfg.codec();
        let session = ClientSession::new(&cfg, control_writer().await, None);

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let header = codec.read_message(&mut stream).await.unwrap().unwrap();
            let old = codec.read_payload(&mut stream, &header, MAX_PATH_LEN).await.unwrap();
            let new_len = codec.read_field(&mut stream).await.unwrap();
            let new = codec.read_frame(&mut stream, new_len as usize).await.unwrap();
            codec
                .write_message(&mut stream, &Message::new(MessageType::ValidResponse))
                .await
                .unwrap();
            (header, old, new)
        });

        session
            .submit(&ChangeEvent::renamed("dir/a.txt", "dir/b.txt"))
            .await
            .unwrap();

        let (header, old, new) = server.await.unwrap();
        assert_eq!(header, Header::new(MessageType::FileRenamed, 9));
        assert_eq!(old, b"dir/a.txt");
        assert_eq!(new, b"dir/b.txt");
    }

    #[tokio::test]
    async fn error_acknowledgement_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cfg = config(dir.path(), port);
        let codec = cfg.codec();
        let session = ClientSession::new(&cfg, control_writer().await, None);

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let header = codec.read_message(&mut stream).await.unwrap().unwrap();
            codec.read_payload(&mut stream, &header, MAX_PATH_LEN).await.unwrap();
            codec
                .write_message(&mut stream, &Message::new(MessageType::ErrorResponse))
                .await
                .unwrap();
        });

        let err = session
            .submit(&ChangeEvent::deleted("gone.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Transfer(_)));
    }

    #[tokio::test]
    async fn overlong_paths_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let session = ClientSession::new(&config(dir.path(), 9), control_writer().await, None);
        let long = "x".repeat(MAX_PATH_LEN as usize + 1);
        let err = session.submit(&ChangeEvent::deleted(long)).await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[tokio::test]
    async fn session_id_precedes_each_change() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cfg = config(dir.path(), port);
        let codec = cfg.codec();
        let session = ClientSession::new(&cfg, control_writer().await, Some(7));

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let first = codec.read_message(&mut stream).await.unwrap().unwrap();
            let id = codec.read_payload(&mut stream, &first, 8).await.unwrap();
            let second = codec.read_message(&mut stream).await.unwrap().unwrap();
            codec.read_payload(&mut stream, &second, MAX_PATH_LEN).await.unwrap();
            codec
                .write_message(&mut stream, &Message::new(MessageType::ValidResponse))
                .await
                .unwrap();
            (first.kind, id, second.kind)
        });

        session.submit(&ChangeEvent::deleted("x.txt")).await.unwrap();
        let (first, id, second) = server.await.unwrap();
        assert_eq!(first, MessageType::Session);
        assert_eq!(id, 7u64.to_be_bytes());
        assert_eq!(second, MessageType::FileDeleted);
    }

    #[tokio::test]
    async fn pushed_changes_are_applied_and_not_echoed() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), 9);
        let codec = cfg.codec();
        let session = Arc::new(ClientSession::new(&cfg, control_writer().await, Some(1)));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (reader, _writer) = client.unwrap().into_split();
        let (mut server, _) = server.unwrap();

        let mut body: &[u8] = b"from another client";
        let content: Content<'_> = (&mut body, 19);
        change::write_change(&codec, &mut server, &ChangeEvent::created("in/p.txt"), Some(content))
            .await
            .unwrap();
        let rename = ChangeEvent::renamed("in/p.txt", "in/q.txt");
        change::write_change(&codec, &mut server, &rename, None)
            .await
            .unwrap();
        codec
            .write_message(&mut server, &Message::new(MessageType::Disconnect))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        tokio::time::timeout(
            Duration::from_secs(10),
            listen_control(session.clone(), reader, cancel.clone()),
        )
        .await
        .expect("listener did not stop on DISCONNECT");
        assert!(cancel.is_cancelled());

        let moved = dir.path().join("in").join("q.txt");
        assert_eq!(std::fs::read(&moved).unwrap(), b"from another client");
        assert!(!dir.path().join("in").join("p.txt").exists());
        assert!(session.is_echo(&rename).await);
        assert!(session.is_echo(&ChangeEvent::created("in/q.txt")).await);

        std::fs::write(&moved, b"edited here").unwrap();
        assert!(!session.is_echo(&ChangeEvent::modified("in/q.txt")).await);
    }

    #[tokio::test]
    async fn refusal_before_the_session_id_is_a_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let codec = config(Path::new("."), 9).codec();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (mut reader, _writer) = client.unwrap().into_split();
        let (mut server, _) = server.unwrap();
        codec
            .write_message(&mut server, &Message::new(MessageType::ErrorResponse))
            .await
            .unwrap();

        let err = read_session_id(&codec, &mut reader).await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }
}

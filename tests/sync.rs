use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use dirsync::protocol::{Header, Message, MessageType};
use dirsync::watcher::ChangeEvent;
use dirsync::{Config, SyncClient, SyncError, SyncServer};

struct TestServer {
    control: SocketAddr,
    changes: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<dirsync::Result<()>>,
}

impl TestServer {
    async fn stop(self) {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

fn base_config(directory: &Path, scratch: &Path) -> Config {
    Config {
        directory: directory.to_path_buf(),
        password: "integration secret".into(),
        ip: "127.0.0.1".into(),
        chunk_size: 1024,
        retry_attempts: 5,
        retry_delay: Duration::from_millis(20),
        first_read_timeout: Duration::from_secs(5),
        scratch_dir: scratch.to_path_buf(),
        ..Config::default()
    }
}

async fn start_server(directory: &Path, scratch: &Path, max_clients: usize) -> TestServer {
    let mut config = base_config(directory, scratch);
    config.max_clients = max_clients;

    let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let changes = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = SyncServer::from_listeners(config, control, changes)
        .await
        .unwrap();
    let control = server.control_addr().unwrap();
    let changes = server.change_addr().unwrap();

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(server.run(cancel.clone()));
    TestServer {
        control,
        changes,
        cancel,
        handle,
    }
}

fn client_config(server: &TestServer, directory: &Path, scratch: &Path) -> Config {
    let mut config = base_config(directory, scratch);
    config.port = server.control.port();
    config.change_port = Some(server.changes.port());
    config
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn bootstrap_mirrors_the_server_directory() {
    let server_dir = tempfile::tempdir().unwrap();
    let client_dir = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();

    std::fs::create_dir_all(server_dir.path().join("docs").join("empty")).unwrap();
    std::fs::write(server_dir.path().join("readme.txt"), b"hello").unwrap();
    std::fs::write(server_dir.path().join("docs").join("a.md"), b"# A").unwrap();
    std::fs::write(client_dir.path().join("readme.txt"), b"stale").unwrap();

    let server = start_server(server_dir.path(), scratch.path(), 8).await;
    let client = SyncClient::connect(client_config(&server, client_dir.path(), scratch.path()))
        .await
        .unwrap();

    assert_eq!(
        std::fs::read(client_dir.path().join("readme.txt")).unwrap(),
        b"hello"
    );
    assert_eq!(
        std::fs::read(client_dir.path().join("docs").join("a.md")).unwrap(),
        b"# A"
    );
    assert!(client_dir.path().join("docs").join("empty").is_dir());
    eventually("temporary archives to be removed", || {
        std::fs::read_dir(scratch.path()).unwrap().count() == 0
    })
    .await;

    drop(client);
    server.stop().await;
}

#[tokio::test]
async fn create_rename_delete_reach_the_server() {
    let server_dir = tempfile::tempdir().unwrap();
    let client_dir = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let server = start_server(server_dir.path(), scratch.path(), 8).await;
    let client = SyncClient::connect(client_config(&server, client_dir.path(), scratch.path()))
        .await
        .unwrap();
    let session = client.session();

    std::fs::write(client_dir.path().join("a.txt"), b"hi").unwrap();
    session.submit(&ChangeEvent::created("a.txt")).await.unwrap();
    assert_eq!(std::fs::read(server_dir.path().join("a.txt")).unwrap(), b"hi");

    session
        .submit(&ChangeEvent::renamed("a.txt", "b.txt"))
        .await
        .unwrap();
    assert!(!server_dir.path().join("a.txt").exists());
    assert_eq!(std::fs::read(server_dir.path().join("b.txt")).unwrap(), b"hi");

    session.submit(&ChangeEvent::deleted("b.txt")).await.unwrap();
    assert!(!server_dir.path().join("b.txt").exists());

    drop(client);
    server.stop().await;
}

#[tokio::test]
async fn empty_and_multi_chunk_files_transfer_intact() {
    let server_dir = tempfile::tempdir().unwrap();
    let client_dir = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let server = start_server(server_dir.path(), scratch.path(), 8).await;
    let client = SyncClient::connect(client_config(&server, client_dir.path(), scratch.path()))
        .await
        .unwrap();
    let session = client.session();

    std::fs::write(client_dir.path().join("empty.bin"), b"").unwrap();
    session
        .submit(&ChangeEvent::created("empty.bin"))
        .await
        .unwrap();
    assert_eq!(
        std::fs::metadata(server_dir.path().join("empty.bin"))
            .unwrap()
            .len(),
        0
    );

    // Zero bytes are left alone by the obfuscation; make sure they survive too.
    let big: Vec<u8> = (0..50_000u32).map(|i| (i * 31 % 256) as u8).collect();
    std::fs::create_dir_all(client_dir.path().join("nested")).unwrap();
    std::fs::write(client_dir.path().join("nested").join("big.bin"), &big).unwrap();
    session
        .submit(&ChangeEvent::created("nested/big.bin"))
        .await
        .unwrap();
    assert_eq!(
        std::fs::read(server_dir.path().join("nested").join("big.bin")).unwrap(),
        big
    );

    drop(client);
    server.stop().await;
}

#[tokio::test]
async fn changes_apply_in_submission_order() {
    let server_dir = tempfile::tempdir().unwrap();
    let client_dir = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let server = start_server(server_dir.path(), scratch.path(), 8).await;
    let client = SyncClient::connect(client_config(&server, client_dir.path(), scratch.path()))
        .await
        .unwrap();
    let session = client.session();
    let path = client_dir.path().join("notes.txt");

    std::fs::write(&path, b"first").unwrap();
    session
        .submit(&ChangeEvent::created("notes.txt"))
        .await
        .unwrap();
    std::fs::write(&path, b"second draft").unwrap();
    session
        .submit(&ChangeEvent::modified("notes.txt"))
        .await
        .unwrap();

    assert_eq!(
        std::fs::read(server_dir.path().join("notes.txt")).unwrap(),
        b"second draft"
    );

    drop(client);
    server.stop().await;
}

#[tokio::test]
async fn registry_refuses_one_client_too_many() {
    let server_dir = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
    let server = start_server(server_dir.path(), scratch.path(), 2).await;

    let first = SyncClient::connect(client_config(&server, dirs[0].path(), scratch.path()))
        .await
        .unwrap();
    let _second = SyncClient::connect(client_config(&server, dirs[1].path(), scratch.path()))
        .await
        .unwrap();

    let refused = SyncClient::connect(client_config(&server, dirs[2].path(), scratch.path())).await;
    assert!(matches!(refused, Err(SyncError::Protocol(_))));

    // A departing client frees its slot.
    drop(first);
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match SyncClient::connect(client_config(&server, dirs[2].path(), scratch.path())).await {
            Ok(_) => break,
            Err(SyncError::Protocol(_)) if Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(50)).await
            }
            Err(e) => panic!("slot was never released: {e}"),
        }
    }

    server.stop().await;
}

#[tokio::test]
async fn paths_escaping_the_root_are_rejected() {
    let server_dir = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let server = start_server(server_dir.path(), scratch.path(), 8).await;
    let codec = base_config(server_dir.path(), scratch.path()).codec();

    let mut stream = TcpStream::connect(server.changes).await.unwrap();
    codec
        .write_message(
            &mut stream,
            &Message::with_payload(MessageType::FileDeleted, "../outside.txt"),
        )
        .await
        .unwrap();

    // No acknowledgement, just a closed connection.
    let reply = codec.read_message(&mut stream).await;
    assert!(!matches!(reply, Ok(Some(_))));

    server.stop().await;
}

#[tokio::test]
async fn watched_changes_are_forwarded() {
    let server_dir = tempfile::tempdir().unwrap();
    let client_dir = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let server = start_server(server_dir.path(), scratch.path(), 8).await;
    let client = SyncClient::connect(client_config(&server, client_dir.path(), scratch.path()))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let running = tokio::spawn(client.run(cancel.clone()));

    // The watcher starts inside `run`, so keep touching the file until it is seen.
    let local = client_dir.path().join("watched.txt");
    let remote = server_dir.path().join("watched.txt");
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        std::fs::write(&local, b"from the watcher").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        if std::fs::read(&remote).ok().as_deref() == Some(b"from the watcher".as_slice()) {
            break;
        }
        assert!(Instant::now() < deadline, "change never reached the server");
    }

    std::fs::remove_file(&local).unwrap();
    eventually("the deletion", || !remote.exists()).await;

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("client did not stop")
        .unwrap()
        .unwrap();
    server.stop().await;
}

#[tokio::test]
async fn watched_rename_moves_the_file_on_the_server() {
    let server_dir = tempfile::tempdir().unwrap();
    let client_dir = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let server = start_server(server_dir.path(), scratch.path(), 8).await;
    let client = SyncClient::connect(client_config(&server, client_dir.path(), scratch.path()))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let running = tokio::spawn(client.run(cancel.clone()));

    let local = client_dir.path().join("before.txt");
    let remote = server_dir.path().join("before.txt");
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        std::fs::write(&local, b"renamed later").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        if std::fs::read(&remote).ok().as_deref() == Some(b"renamed later".as_slice()) {
            break;
        }
        assert!(Instant::now() < deadline, "file never reached the server");
    }

    std::fs::rename(&local, client_dir.path().join("after.txt")).unwrap();
    let renamed = server_dir.path().join("after.txt");
    eventually("the rename", || renamed.exists() && !remote.exists()).await;
    assert_eq!(std::fs::read(&renamed).unwrap(), b"renamed later");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("client did not stop")
        .unwrap()
        .unwrap();
    server.stop().await;
}

#[tokio::test]
async fn stalled_sender_does_not_hold_up_other_clients() {
    let server_dir = tempfile::tempdir().unwrap();
    let client_dir = tempfile::tempdir().unwrap();
    let late_dir = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let server = start_server(server_dir.path(), scratch.path(), 8).await;
    let codec = base_config(server_dir.path(), scratch.path()).codec();
    let client = SyncClient::connect(client_config(&server, client_dir.path(), scratch.path()))
        .await
        .unwrap();

    // One peer goes quiet right after a header, another halfway through a file.
    let mut silent = TcpStream::connect(server.changes).await.unwrap();
    codec
        .write_header(&mut silent, Header::new(MessageType::FileCreated, 5))
        .await
        .unwrap();
    let mut halfway = TcpStream::connect(server.changes).await.unwrap();
    codec
        .write_message(
            &mut halfway,
            &Message::with_payload(MessageType::FileCreated, "half.txt"),
        )
        .await
        .unwrap();
    codec.write_field(&mut halfway, 1000).await.unwrap();
    codec.write_frame(&mut halfway, &[7u8; 10]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    std::fs::write(client_dir.path().join("a.txt"), b"still flowing").unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        client.session().submit(&ChangeEvent::created("a.txt")),
    )
    .await
    .expect("submission waited on a stalled peer")
    .unwrap();
    assert_eq!(
        std::fs::read(server_dir.path().join("a.txt")).unwrap(),
        b"still flowing"
    );

    let late = tokio::time::timeout(
        Duration::from_secs(5),
        SyncClient::connect(client_config(&server, late_dir.path(), scratch.path())),
    )
    .await
    .expect("bootstrap waited on a stalled peer")
    .unwrap();
    // The half-received file is neither visible nor part of the snapshot.
    let names: Vec<_> = std::fs::read_dir(late_dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(names, vec!["a.txt"]);
    assert!(!server_dir.path().join("half.txt").exists());

    drop((client, late));
    server.stop().await;
    drop((silent, halfway));
}

#[tokio::test]
async fn changes_are_passed_on_to_other_clients() {
    let server_dir = tempfile::tempdir().unwrap();
    let sender_dir = tempfile::tempdir().unwrap();
    let receiver_dir = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let server = start_server(server_dir.path(), scratch.path(), 8).await;
    let sender = SyncClient::connect(client_config(&server, sender_dir.path(), scratch.path()))
        .await
        .unwrap();
    let receiver =
        SyncClient::connect(client_config(&server, receiver_dir.path(), scratch.path()))
            .await
            .unwrap();
    let cancel = CancellationToken::new();
    let running = tokio::spawn(receiver.run(cancel.clone()));
    let session = sender.session();

    std::fs::write(sender_dir.path().join("shared.txt"), b"from the sender").unwrap();
    session
        .submit(&ChangeEvent::created("shared.txt"))
        .await
        .unwrap();
    let pushed = receiver_dir.path().join("shared.txt");
    eventually("the pushed file", || {
        std::fs::read(&pushed).ok().as_deref() == Some(b"from the sender".as_slice())
    })
    .await;

    session
        .submit(&ChangeEvent::renamed("shared.txt", "moved/shared.txt"))
        .await
        .unwrap();
    let moved = receiver_dir.path().join("moved").join("shared.txt");
    eventually("the pushed rename", || moved.exists() && !pushed.exists()).await;

    session
        .submit(&ChangeEvent::deleted("moved/shared.txt"))
        .await
        .unwrap();
    eventually("the pushed deletion", || !moved.exists()).await;

    // The receiver's watcher saw all of that; none of it may come back.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!server_dir.path().join("shared.txt").exists());
    assert!(!server_dir.path().join("moved").join("shared.txt").exists());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("client did not stop")
        .unwrap()
        .unwrap();
    drop(sender);
    server.stop().await;
}

#[tokio::test]
async fn server_shutdown_disconnects_clients() {
    let server_dir = tempfile::tempdir().unwrap();
    let client_dir = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let server = start_server(server_dir.path(), scratch.path(), 8).await;
    let client = SyncClient::connect(client_config(&server, client_dir.path(), scratch.path()))
        .await
        .unwrap();

    let running = tokio::spawn(client.run(CancellationToken::new()));
    server.stop().await;

    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("client ignored the server's DISCONNECT")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn unreachable_server_is_a_connect_error() {
    let dir = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut config = base_config(dir.path(), dir.path());
    config.port = port;
    let err = SyncClient::connect(config).await.err().unwrap();
    assert!(matches!(err, SyncError::Connect { .. }));
}

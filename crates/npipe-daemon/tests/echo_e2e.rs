//! End-to-end tests: a real `EchoServer` on a temporary socket, driven by
//! `npipe_cli::ChannelClient` and raw framed streams.
//!
//! # Tests
//!
//! - echo correctness for empty, small, binary and maximum-size messages
//! - isolation between concurrent sessions with distinct messages
//! - many concurrent clients completing without blocking each other
//! - cleanup after disconnect and continued availability of the channel
//! - access control through the security descriptor
//! - restart on the same channel, including after a crash left a stale socket
//! - the bounded session pool
//! - graceful and forced shutdown

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use npipe_cli::{ChannelClient, ClientConfig, RetryPolicy};
use npipe_core::error::MAX_ADMISSION_FRAME_SIZE;
use npipe_core::security::{Access, Principal};
use npipe_core::{
    Admission, ChannelError, FrameCodec, ProtocolError, SecurityDescriptor,
    DEFAULT_MAX_MESSAGE_SIZE,
};
use npipe_daemon::{EchoServer, ListenerConfig, StatsSnapshot};
use tempfile::TempDir;
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn socket_in(tmp: &TempDir) -> PathBuf {
    tmp.path().join("npipe").join("echo.sock")
}

fn start(path: &Path) -> EchoServer {
    start_with(ListenerConfig::new(path), SecurityDescriptor::owner_only())
}

fn start_with(config: ListenerConfig, descriptor: SecurityDescriptor) -> EchoServer {
    EchoServer::start(config, descriptor).expect("server should start")
}

fn quick() -> ClientConfig {
    ClientConfig::default()
        .with_connect_timeout(Duration::from_millis(300))
        .with_request_timeout(Duration::from_secs(5))
}

async fn connect(path: &Path) -> ChannelClient {
    tokio::time::timeout(TEST_TIMEOUT, ChannelClient::connect_with(path, &quick()))
        .await
        .expect("connect timed out")
        .expect("connect failed")
}

/// Poll the server counters until `done` holds.
async fn wait_for_stats(server: &EchoServer, done: impl Fn(&StatsSnapshot) -> bool) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !done(&server.stats()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("stats never converged: {:?}", server.stats()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn echo_returns_identical_bytes() {
    let tmp = TempDir::new().unwrap();
    let server = start(&socket_in(&tmp));
    let mut client = connect(server.socket_path()).await;
    assert_eq!(client.max_message_size(), DEFAULT_MAX_MESSAGE_SIZE);

    let binary: Vec<u8> = (0..=255u8).collect();
    let max = vec![0x5A; DEFAULT_MAX_MESSAGE_SIZE];
    for msg in [&b""[..], b"x", b"hello", &binary[..], &max[..]] {
        let reply = client.request(Bytes::copy_from_slice(msg)).await.unwrap();
        assert_eq!(&reply[..], msg, "echo of {} bytes differs", msg.len());
    }

    let err = client
        .request(vec![0u8; DEFAULT_MAX_MESSAGE_SIZE + 1])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ChannelError::Protocol(ProtocolError::FrameTooLarge { .. })
    ));

    client.close().await.unwrap();
    server.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sessions_are_isolated() {
    let tmp = TempDir::new().unwrap();
    let server = start(&socket_in(&tmp));

    let mut a = connect(server.socket_path()).await;
    let mut b = connect(server.socket_path()).await;
    assert_ne!(a.connection_id(), b.connection_id());

    let task_a = tokio::spawn(async move {
        for _ in 0..50 {
            assert_eq!(&a.request(&b"hello"[..]).await.unwrap()[..], b"hello");
        }
        a
    });
    let task_b = tokio::spawn(async move {
        for _ in 0..50 {
            assert_eq!(&b.request(&b"world"[..]).await.unwrap()[..], b"world");
        }
        b
    });

    let a = tokio::time::timeout(TEST_TIMEOUT, task_a).await.unwrap().unwrap();
    let b = tokio::time::timeout(TEST_TIMEOUT, task_b).await.unwrap().unwrap();
    a.close().await.unwrap();
    b.close().await.unwrap();

    wait_for_stats(&server, |s| s.active == 0 && s.completed == 2).await;
    assert_eq!(server.stats().messages_echoed, 100);
    server.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_clients_complete_concurrently() {
    const CLIENTS: usize = 32;
    const MESSAGES: usize = 10;

    let tmp = TempDir::new().unwrap();
    let server = start(&socket_in(&tmp));
    let path = server.socket_path().to_path_buf();

    let mut tasks = Vec::new();
    for i in 0..CLIENTS {
        let path = path.clone();
        tasks.push(tokio::spawn(async move {
            let mut client = connect(&path).await;
            for j in 0..MESSAGES {
                let msg = format!("client-{i}-message-{j}");
                let reply = client.request(msg.clone().into_bytes()).await.unwrap();
                assert_eq!(reply, msg.as_bytes());
            }
            client.close().await.unwrap();
        }));
    }
    for task in tasks {
        tokio::time::timeout(TEST_TIMEOUT, task).await.unwrap().unwrap();
    }

    wait_for_stats(&server, |s| s.active == 0).await;
    let stats = server.stats();
    assert_eq!(stats.admitted, CLIENTS as u64);
    assert_eq!(stats.messages_echoed, (CLIENTS * MESSAGES) as u64);
    assert_eq!(stats.failed, 0);
    server.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disconnect_releases_session_and_channel_stays_usable() {
    let tmp = TempDir::new().unwrap();
    let server = start(&socket_in(&tmp));

    for _ in 0..5 {
        let mut client = connect(server.socket_path()).await;
        client.request(&b"bye"[..]).await.unwrap();
        // Dropped without close(): an abrupt disconnect.
        drop(client);
    }
    wait_for_stats(&server, |s| s.active == 0 && s.completed == 5).await;

    let mut client = connect(server.socket_path()).await;
    assert_eq!(&client.request(&b"still here"[..]).await.unwrap()[..], b"still here");
    client.close().await.unwrap();
    server.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn protocol_violation_ends_only_that_session() {
    let tmp = TempDir::new().unwrap();
    let config = ListenerConfig::new(socket_in(&tmp)).with_max_message_size(32);
    let server = start_with(config, SecurityDescriptor::owner_only());

    let mut good = connect(server.socket_path()).await;

    let stream = UnixStream::connect(server.socket_path()).await.unwrap();
    let mut raw = Framed::new(stream, FrameCodec::new(1024));
    let admission = raw.next().await.unwrap().unwrap();
    assert!(matches!(
        Admission::from_frame(&admission).unwrap(),
        Admission::Accepted(_)
    ));
    raw.send(Bytes::from(vec![1u8; 33])).await.unwrap();
    let closed = tokio::time::timeout(TEST_TIMEOUT, raw.next()).await.unwrap();
    assert!(
        matches!(closed, None | Some(Err(_))),
        "server must close the offending session"
    );

    wait_for_stats(&server, |s| s.failed == 1).await;
    assert_eq!(&good.request(&b"unaffected"[..]).await.unwrap()[..], b"unaffected");
    good.close().await.unwrap();
    server.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn excluded_principal_is_denied() {
    let tmp = TempDir::new().unwrap();

    // Read-only grant: opening the bidirectional channel needs read and write.
    let read_only = SecurityDescriptor::builder()
        .allow(Principal::Owner, Access::READ)
        .build()
        .unwrap();
    let server = start_with(ListenerConfig::new(socket_in(&tmp)), read_only);

    let err = ChannelClient::connect_with(server.socket_path(), &quick())
        .await
        .unwrap_err();
    match err {
        ChannelError::AccessDenied { reason } => assert!(reason.contains("insufficient")),
        other => panic!("expected access denied, got {other}"),
    }

    // Denials are not retried.
    let err = ChannelClient::connect_with_retry(
        server.socket_path(),
        &quick(),
        &RetryPolicy::new(5, Duration::from_millis(10)),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ChannelError::AccessDenied { .. }));

    wait_for_stats(&server, |s| s.rejected == 2).await;
    assert_eq!(server.stats().admitted, 0);
    server.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn permitted_group_is_admitted() {
    let tmp = TempDir::new().unwrap();
    let me = npipe_core::PeerCredentials::current_process();
    let descriptor = SecurityDescriptor::builder()
        .allow(Principal::User(me.uid.wrapping_add(1)), Access::READ_WRITE)
        .allow(Principal::Group(me.gid), Access::READ_WRITE)
        .build()
        .unwrap();
    let server = start_with(ListenerConfig::new(socket_in(&tmp)), descriptor);

    let mut client = connect(server.socket_path()).await;
    assert_eq!(&client.request(&b"member"[..]).await.unwrap()[..], b"member");
    client.close().await.unwrap();
    server.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_on_same_name_needs_no_cleanup() {
    let tmp = TempDir::new().unwrap();
    let path = socket_in(&tmp);

    for round in 0..3 {
        let server = start(&path);
        let mut client = connect(&path).await;
        let msg = format!("round {round}");
        assert_eq!(client.request(msg.clone().into_bytes()).await.unwrap(), msg.as_bytes());
        client.close().await.unwrap();
        server.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(!path.exists());
    }

    // A crashed server leaves its socket file behind.
    drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
    assert!(path.exists());

    let server = start(&path);
    let mut client = connect(&path).await;
    assert_eq!(&client.request(&b"after crash"[..]).await.unwrap()[..], b"after crash");
    client.close().await.unwrap();
    server.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_server_on_live_channel_is_refused() {
    let tmp = TempDir::new().unwrap();
    let path = socket_in(&tmp);
    let server = start(&path);

    let err = EchoServer::start(ListenerConfig::new(&path), SecurityDescriptor::owner_only())
        .unwrap_err();
    assert!(matches!(err, ChannelError::Configuration { .. }));

    // The running server is unaffected.
    let mut client = connect(&path).await;
    assert_eq!(&client.request(&b"first"[..]).await.unwrap()[..], b"first");
    client.close().await.unwrap();
    server.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_pool_makes_server_unavailable() {
    let tmp = TempDir::new().unwrap();
    let config = ListenerConfig::new(socket_in(&tmp)).with_max_sessions(1);
    let server = start_with(config, SecurityDescriptor::owner_only());

    let mut first = connect(server.socket_path()).await;
    assert_eq!(&first.request(&b"one"[..]).await.unwrap()[..], b"one");

    let err = ChannelClient::connect_with(server.socket_path(), &quick())
        .await
        .unwrap_err();
    assert!(
        matches!(err, ChannelError::ServerUnavailable { .. }),
        "expected server unavailable, got {err}"
    );

    first.close().await.unwrap();

    let mut second = tokio::time::timeout(
        TEST_TIMEOUT,
        ChannelClient::connect_with_retry(
            server.socket_path(),
            &quick(),
            &RetryPolicy::new(20, Duration::from_millis(50)),
        ),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(&second.request(&b"two"[..]).await.unwrap()[..], b"two");
    second.close().await.unwrap();
    server.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn graceful_shutdown_wakes_idle_sessions() {
    let tmp = TempDir::new().unwrap();
    let server = start(&socket_in(&tmp));
    let path = server.socket_path().to_path_buf();

    let mut idle = Vec::new();
    for _ in 0..3 {
        idle.push(connect(&path).await);
    }
    wait_for_stats(&server, |s| s.active == 3).await;

    let report = tokio::time::timeout(TEST_TIMEOUT, server.shutdown(Duration::from_secs(5)))
        .await
        .unwrap()
        .unwrap();
    assert!(!report.forced, "idle sessions must end without force");
    assert_eq!(report.stats.active, 0);
    assert_eq!(report.stats.completed, 3);
    assert!(!path.exists());

    for client in &mut idle {
        let err = client.request(&b"anyone?"[..]).await.unwrap_err();
        assert!(matches!(err, ChannelError::PeerDisconnected), "got {err}");
    }

    let err = ChannelClient::connect_with(&path, &quick()).await.unwrap_err();
    assert!(matches!(err, ChannelError::ServerUnavailable { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stuck_writer_is_force_closed_after_grace() {
    const BIG: usize = 1024 * 1024;

    let tmp = TempDir::new().unwrap();
    let config = ListenerConfig::new(socket_in(&tmp)).with_max_message_size(BIG);
    let server = start_with(config, SecurityDescriptor::owner_only());

    // Send one large frame and never read the echo: the worker blocks in
    // its write once the socket buffers are full.
    let stream = UnixStream::connect(server.socket_path()).await.unwrap();
    let mut raw = Framed::new(stream, FrameCodec::new(MAX_ADMISSION_FRAME_SIZE.max(BIG)));
    raw.next().await.unwrap().unwrap();
    tokio::time::timeout(TEST_TIMEOUT, raw.send(Bytes::from(vec![7u8; BIG])))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let report = tokio::time::timeout(TEST_TIMEOUT, server.shutdown(Duration::from_millis(100)))
        .await
        .unwrap()
        .unwrap();
    assert!(report.forced);
    assert_eq!(report.stats.failed, 1);
    assert_eq!(report.stats.active, 0);
    drop(raw);
}

//! End-to-end tunnel tests
//!
//! Each test wires real endpoints over loopback TCP: an echo (or sink)
//! target, a tunnel server and a tunnel client, each with its own session
//! manager, then pushes application bytes through the forwarded port and
//! checks the byte-exact round trip -- including across a killed transport
//! connection.

use burrow::config::{CtrlMode, ForwardInfo, HostInfo, IpMask, TunnelMode, TunnelParam};
use burrow::crypto::random_bytes;
use burrow::service;
use burrow::tunnel::SessionManager;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

const TEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Reserve a loopback port.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Echo server on an ephemeral port.
async fn spawn_echo() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut rh, mut wh) = socket.split();
                let _ = tokio::io::copy(&mut rh, &mut wh).await;
            });
        }
    });
    port
}

/// Sink server: accepts and never reads.
async fn spawn_blackhole() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            held.push(socket);
        }
    });
    port
}

fn param(mode: TunnelMode, server_port: u16) -> TunnelParam {
    TunnelParam::new(
        Some("integration-pass".to_string()),
        mode,
        IpMask::default(),
        Some("integration-enc".to_string()),
        -1,
        2000,
        CtrlMode::Normal,
        HostInfo::new("", "127.0.0.1", server_port, "/"),
    )
}

fn forward(listen_port: u16, target_port: u16) -> ForwardInfo {
    ForwardInfo {
        src: HostInfo::new("", "127.0.0.1", listen_port, ""),
        dst: HostInfo::new("", "127.0.0.1", target_port, ""),
    }
}

/// Wait until something accepts on the port. The probe connection itself is
/// dropped immediately.
async fn wait_listening(port: u16) {
    for _ in 0..100 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("port {} never started listening", port);
}

/// Wait until the manager holds a live session.
async fn wait_session(mgr: &SessionManager) {
    for _ in 0..100 {
        if !mgr.sessions().is_empty() {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("no session established");
}

struct TunnelPair {
    server_mgr: Arc<SessionManager>,
    client_mgr: Arc<SessionManager>,
    forward_port: u16,
}

/// Start a server/client pair with the given modes and one or more
/// forwards on the client-visible side.
async fn start_pair(
    server_mode: TunnelMode,
    client_mode: TunnelMode,
    forwards: Vec<ForwardInfo>,
) -> TunnelPair {
    let server_port = free_port().await;
    let forward_port = forwards[0].src.port;

    let server_mgr = SessionManager::new();
    let server_param = param(server_mode, server_port);
    let server_forwards = if server_mode.hosts_forwards() {
        forwards.clone()
    } else {
        Vec::new()
    };
    {
        let mgr = server_mgr.clone();
        tokio::spawn(async move {
            let _ = service::run(server_param, server_forwards, mgr).await;
        });
    }
    wait_listening(server_port).await;

    let client_mgr = SessionManager::new();
    let client_param = param(client_mode, server_port);
    let client_forwards = if client_mode.hosts_forwards() {
        forwards
    } else {
        Vec::new()
    };
    {
        let mgr = client_mgr.clone();
        tokio::spawn(async move {
            let _ = service::run(client_param, client_forwards, mgr).await;
        });
    }
    wait_session(&server_mgr).await;
    wait_session(&client_mgr).await;
    if server_mode.hosts_forwards() {
        // Reverse mode binds the forwards only after the session is up.
        wait_listening(forward_port).await;
    }

    TunnelPair {
        server_mgr,
        client_mgr,
        forward_port,
    }
}

async fn echo_roundtrip(port: u16, payload: &[u8]) -> Vec<u8> {
    let mut socket = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    socket.set_nodelay(true).unwrap();

    let (mut rh, mut wh) = socket.split();
    let expected = payload.len();
    let write = async {
        wh.write_all(payload).await.unwrap();
    };
    let read = async {
        let mut received = vec![0u8; expected];
        rh.read_exact(&mut received).await.unwrap();
        received
    };
    let (_, received) = tokio::join!(write, read);
    received
}

#[tokio::test]
async fn test_forward_echo_roundtrip() {
    let echo_port = spawn_echo().await;
    let listen_port = free_port().await;
    let pair = start_pair(
        TunnelMode::Server,
        TunnelMode::Client,
        vec![forward(listen_port, echo_port)],
    )
    .await;

    let mut payload = vec![0u8; 1024 * 1024];
    random_bytes(&mut payload);

    let received = timeout(TEST_TIMEOUT, echo_roundtrip(pair.forward_port, &payload))
        .await
        .expect("echo round trip timed out");
    assert_eq!(received, payload);

    // One session on each side.
    assert_eq!(pair.server_mgr.sessions().len(), 1);
    assert_eq!(pair.client_mgr.sessions().len(), 1);
}

#[tokio::test]
async fn test_multiple_streams_isolated() {
    let echo_port = spawn_echo().await;
    let listen_port = free_port().await;
    let pair = start_pair(
        TunnelMode::Server,
        TunnelMode::Client,
        vec![forward(listen_port, echo_port)],
    )
    .await;

    let mut tasks = Vec::new();
    for lane in 0u8..4 {
        let port = pair.forward_port;
        tasks.push(tokio::spawn(async move {
            let payload = vec![lane; 256 * 1024];
            let received = echo_roundtrip(port, &payload).await;
            assert_eq!(received, payload, "lane {} corrupted", lane);
        }));
    }
    for task in tasks {
        timeout(TEST_TIMEOUT, task).await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_mid_stream_reconnect() {
    let echo_port = spawn_echo().await;
    let listen_port = free_port().await;
    let pair = start_pair(
        TunnelMode::Server,
        TunnelMode::Client,
        vec![forward(listen_port, echo_port)],
    )
    .await;

    let mut payload = vec![0u8; 1024 * 1024];
    random_bytes(&mut payload);

    let mut socket = TcpStream::connect(("127.0.0.1", pair.forward_port))
        .await
        .unwrap();
    let (mut rh, mut wh) = socket.split();

    let writer = async {
        // Paced chunks so the transport dies mid-transfer.
        for chunk in payload.chunks(16 * 1024) {
            wh.write_all(chunk).await.unwrap();
            sleep(Duration::from_millis(5)).await;
        }
    };
    let reader = async {
        let mut received = vec![0u8; payload.len()];
        rh.read_exact(&mut received).await.unwrap();
        received
    };
    let killer = async {
        sleep(Duration::from_millis(150)).await;
        // Kill the transport carrying the session, once.
        let session = pair.server_mgr.sessions().pop().expect("live session");
        let conn = pair.server_mgr.get_session_conn(&session).await;
        conn.close();
        drop(conn);
        session
    };

    let (_, received, session) = timeout(TEST_TIMEOUT, async {
        tokio::join!(writer, reader, killer)
    })
    .await
    .expect("transfer did not survive the reconnect");

    assert_eq!(received, payload);
    // Same logical session resumed; no replacement was created.
    assert_eq!(pair.server_mgr.sessions().len(), 1);
    assert_eq!(pair.server_mgr.sessions()[0].id(), session.id());
    assert!(session.write_no.load(Ordering::Relaxed) > 0);
}

#[tokio::test]
async fn test_idle_session_counters_stay_zero() {
    let echo_port = spawn_echo().await;
    let listen_port = free_port().await;
    let pair = start_pair(
        TunnelMode::Server,
        TunnelMode::Client,
        vec![forward(listen_port, echo_port)],
    )
    .await;

    // Several keepalive intervals (floored at 2 s) with no user traffic.
    sleep(Duration::from_secs(5)).await;

    for mgr in [&pair.server_mgr, &pair.client_mgr] {
        let session = &mgr.sessions()[0];
        assert_eq!(session.write_no.load(Ordering::Relaxed), 0);
        assert_eq!(session.read_no.load(Ordering::Relaxed), 0);
        assert_eq!(session.sent_count(), 0);
    }
}

#[tokio::test]
async fn test_reverse_dial() {
    let echo_port = spawn_echo().await;
    let listen_port = free_port().await;
    let pair = start_pair(
        TunnelMode::ReverseServer,
        TunnelMode::ReverseClient,
        vec![forward(listen_port, echo_port)],
    )
    .await;

    let mut tasks = Vec::new();
    for client in 0u8..10 {
        let port = pair.forward_port;
        tasks.push(tokio::spawn(async move {
            let mut payload = vec![0u8; 4096];
            random_bytes(&mut payload);
            payload[0] = client;
            let received = echo_roundtrip(port, &payload).await;
            assert_eq!(received, payload, "client {} corrupted", client);
        }));
    }
    for task in tasks {
        timeout(TEST_TIMEOUT, task).await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_websocket_forward_echo() {
    let echo_port = spawn_echo().await;
    let listen_port = free_port().await;
    let pair = start_pair(
        TunnelMode::WsServer,
        TunnelMode::WsClient,
        vec![forward(listen_port, echo_port)],
    )
    .await;

    let mut payload = vec![0u8; 64 * 1024];
    random_bytes(&mut payload);

    let received = timeout(TEST_TIMEOUT, echo_roundtrip(pair.forward_port, &payload))
        .await
        .expect("websocket echo timed out");
    assert_eq!(received, payload);
}

#[tokio::test]
async fn test_ip_mask_rejects_client() {
    let echo_port = spawn_echo().await;
    let listen_port = free_port().await;
    let server_port = free_port().await;

    // Only a network the loopback peer is not in.
    let server_mgr = SessionManager::new();
    let mut server_param = param(TunnelMode::Server, server_port);
    server_param.mask = IpMask::parse(&["10.0.0.0/8".to_string()]).unwrap();
    {
        let mgr = server_mgr.clone();
        tokio::spawn(async move {
            let _ = service::run(server_param, Vec::new(), mgr).await;
        });
    }
    wait_listening(server_port).await;

    let client_param = param(TunnelMode::Client, server_port);
    let result = timeout(
        TEST_TIMEOUT,
        service::run(
            client_param,
            vec![forward(listen_port, echo_port)],
            SessionManager::new(),
        ),
    )
    .await
    .expect("rejected client must fail fast");
    assert!(result.is_err());
    assert!(server_mgr.sessions().is_empty());
}

#[tokio::test]
async fn test_blocked_stream_does_not_stall_others() {
    let echo_port = spawn_echo().await;
    let sink_port = spawn_blackhole().await;
    let blocked_listen = free_port().await;
    let echo_listen = free_port().await;
    let _pair = start_pair(
        TunnelMode::Server,
        TunnelMode::Client,
        vec![
            forward(blocked_listen, sink_port),
            forward(echo_listen, echo_port),
        ],
    )
    .await;

    // Push far more than the credit window into the sink stream; the
    // sender must park instead of finishing.
    let blocked = tokio::spawn(async move {
        let mut socket = TcpStream::connect(("127.0.0.1", blocked_listen)).await.unwrap();
        let chunk = vec![0x42u8; 64 * 1024];
        for _ in 0..256 {
            if socket.write_all(&chunk).await.is_err() {
                return;
            }
        }
    });

    sleep(Duration::from_millis(500)).await;

    // The other stream on the same session still makes progress.
    let mut payload = vec![0u8; 128 * 1024];
    random_bytes(&mut payload);
    let received = timeout(TEST_TIMEOUT, echo_roundtrip(echo_listen, &payload))
        .await
        .expect("echo stream starved by the blocked stream");
    assert_eq!(received, payload);

    sleep(Duration::from_secs(2)).await;
    assert!(
        !blocked.is_finished(),
        "16 MiB into a never-reading peer must park on the credit window"
    );
    blocked.abort();
}

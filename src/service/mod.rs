//! Mode entry points
//!
//! Wires the transport, the handshake and the session pipe together for
//! each of the eight tunnel modes, and hosts the small side programs: the
//! echo/heavy/bot helpers, the frame-echo benchmark and the session-dump
//! console.

use crate::config::{CtrlMode, ForwardInfo, TunnelParam};
use crate::crypto::random_bytes;
use crate::transport::{accept_ws, connect_ws, dial_tcp, split_tcp, BoxedRead, BoxedWrite};
use crate::tunnel::frame::{self, PacketKind};
use crate::tunnel::handshake::{handshake_client, handshake_server, ServerHandshake};
use crate::tunnel::pipe::{Pipe, ReconnectFn, RECONNECT_BACKOFF_MS};
use crate::tunnel::relay::{
    bind_forwards, run_connector, spawn_listeners, wait_listener_session,
};
use crate::tunnel::session::{ConnInfo, Session};
use crate::tunnel::{SessionManager, TunnelError};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Run the mode selected in `param` until it finishes or fails.
pub async fn run(
    param: TunnelParam,
    forwards: Vec<ForwardInfo>,
    manager: Arc<SessionManager>,
) -> crate::Result<()> {
    if param.pass.as_deref().map_or(true, |p| p.is_empty()) {
        warn!("no handshake password set; any peer with the mode string can attach");
    }

    if param.mode.is_server_side() {
        start_server(param, forwards, manager).await
    } else if param.ctrl == CtrlMode::Bench {
        run_bench_client(&param).await
    } else if param.mode.hosts_forwards() {
        start_client(param, forwards, manager).await
    } else {
        start_reverse_client(param, manager).await
    }
}

/// Dial the tunnel server with the transport the mode asks for.
async fn dial_transport(param: &TunnelParam) -> crate::Result<(BoxedRead, BoxedWrite)> {
    if param.mode.is_websocket() {
        Ok(connect_ws(&param.server, &param.user_agent, param.proxy.as_deref()).await?)
    } else {
        Ok(dial_tcp(&param.server.to_addr()).await?)
    }
}

// --- server side ----------------------------------------------------------

async fn start_server(
    param: TunnelParam,
    forwards: Vec<ForwardInfo>,
    manager: Arc<SessionManager>,
) -> crate::Result<()> {
    let listener = TcpListener::bind(param.server.to_addr()).await?;
    info!(
        "{} listening on {}",
        param.mode,
        listener.local_addr()?
    );

    let param = Arc::new(param);
    let forwards = Arc::new(forwards);
    loop {
        let (socket, peer) = listener.accept().await?;
        debug!("tunnel connection from {}", peer);
        let param = param.clone();
        let forwards = forwards.clone();
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_server_conn(socket, peer, param, forwards, manager).await {
                debug!("connection from {} ended: {}", peer, err);
            }
        });
    }
}

async fn handle_server_conn(
    socket: TcpStream,
    peer: SocketAddr,
    param: Arc<TunnelParam>,
    forwards: Arc<Vec<ForwardInfo>>,
    manager: Arc<SessionManager>,
) -> crate::Result<()> {
    if !param.mask.allows(peer.ip()) {
        warn!("authmiss: {} outside the allow-list", peer);
        return Err(crate::Error::AuthenticationFailed);
    }

    let (mut rh, mut wh) = if param.mode.is_websocket() {
        accept_ws(socket).await?
    } else {
        split_tcp(socket)
    };

    let (session, is_new) =
        match handshake_server(rh.as_mut(), wh.as_mut(), &param, &manager).await? {
            ServerHandshake::Bench => {
                info!("bench peer {}", peer);
                return bench_echo(rh, wh).await;
            }
            ServerHandshake::Session { session, is_new } => (session, is_new),
        };

    let conn = ConnInfo::new(rh, wh, Some(&param));
    manager.set_session_conn(&session, &conn);
    info!(
        "session {} {} from {}",
        session.id(),
        if is_new { "established" } else { "resumed" },
        peer
    );

    if is_new {
        let reconnect = server_reconnect_fn(manager.clone());
        let pipe = Pipe::start(
            manager.clone(),
            conn.clone(),
            session.clone(),
            param.mode.hosts_forwards(),
            param.keepalive_interval_ms,
            reconnect,
        );

        if param.mode.hosts_forwards() {
            // Reverse mode: this side owns the forward listeners. The ports
            // stay bound for the life of the session.
            match bind_forwards(&forwards).await {
                Ok(group) => {
                    let handles = spawn_listeners(group, &pipe);
                    let pipe = pipe.clone();
                    tokio::spawn(async move {
                        wait_listener_session(pipe).await;
                        for handle in handles {
                            handle.abort();
                        }
                    });
                }
                Err(err) => {
                    error!("cannot bind forwards: {}", err);
                    conn.close();
                    return Err(err);
                }
            }
        } else {
            tokio::spawn(run_connector(pipe));
        }
    }

    // Keep the accept task attached until this transport dies, as its
    // lifetime is what the registry's alive flag tracks.
    manager.join_until_conn_close(&conn).await;
    Ok(())
}

/// Server-side reconnect: park until the client redials and the accept
/// loop binds a fresh transport to the session.
fn server_reconnect_fn(manager: Arc<SessionManager>) -> ReconnectFn {
    Arc::new(move |session: Arc<Session>| {
        let manager = manager.clone();
        Box::pin(async move { Some(manager.get_session_conn(&session).await) })
    })
}

// --- client side ----------------------------------------------------------

async fn connect_session(
    param: &TunnelParam,
    manager: &Arc<SessionManager>,
    session: &Arc<Session>,
) -> Result<Arc<ConnInfo>, TunnelError> {
    // Dial failures must stay retryable, so they surface as I/O errors
    // rather than handshake rejections.
    let (mut rh, mut wh) = dial_transport(param).await.map_err(|err| {
        TunnelError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            err.to_string(),
        ))
    })?;
    handshake_client(rh.as_mut(), wh.as_mut(), param, session).await?;
    let conn = ConnInfo::new(rh, wh, Some(param));
    manager.set_session_conn(session, &conn);
    Ok(conn)
}

/// Client-side reconnect: redial with backoff and re-handshake carrying the
/// session token. A handshake rejection is final; transport errors retry.
fn client_reconnect_fn(param: Arc<TunnelParam>, manager: Arc<SessionManager>) -> ReconnectFn {
    Arc::new(move |session: Arc<Session>| {
        let param = param.clone();
        let manager = manager.clone();
        Box::pin(async move {
            let mut index = 0;
            loop {
                info!(
                    "reconnecting session {} (next wait {} ms)",
                    session.id(),
                    RECONNECT_BACKOFF_MS[index]
                );
                match connect_session(&param, &manager, &session).await {
                    Ok(conn) => {
                        info!("reconnect ok for session {}", session.id());
                        return Some(conn);
                    }
                    Err(err @ (TunnelError::AuthenticationFailed | TunnelError::Handshake(_))) => {
                        warn!("reconnect rejected for session {}: {}", session.id(), err);
                        return None;
                    }
                    Err(err) => warn!("reconnect error for session {}: {}", session.id(), err),
                }
                tokio::time::sleep(Duration::from_millis(RECONNECT_BACKOFF_MS[index])).await;
                if index < RECONNECT_BACKOFF_MS.len() - 1 {
                    index += 1;
                }
            }
        })
    })
}

async fn start_client_session(
    param: Arc<TunnelParam>,
    manager: Arc<SessionManager>,
) -> crate::Result<Arc<Pipe>> {
    let session = Session::new(0, String::new(), param.mode.is_server_side());
    let conn = connect_session(&param, &manager, &session)
        .await
        .map_err(crate::Error::from)?;
    manager.register_session(&session);
    info!("session {} established to {}", session.id(), param.server);

    let reconnect = client_reconnect_fn(param.clone(), manager.clone());
    Ok(Pipe::start(
        manager.clone(),
        conn,
        session,
        param.mode.hosts_forwards(),
        param.keepalive_interval_ms,
        reconnect,
    ))
}

/// Forward client: listen locally, open streams across the tunnel.
async fn start_client(
    param: TunnelParam,
    forwards: Vec<ForwardInfo>,
    manager: Arc<SessionManager>,
) -> crate::Result<()> {
    let group = bind_forwards(&forwards).await?;
    let pipe = start_client_session(Arc::new(param), manager).await?;
    let handles = spawn_listeners(group, &pipe);
    wait_listener_session(pipe).await;
    for handle in handles {
        handle.abort();
    }
    Ok(())
}

/// Reverse client: service connect requests arriving from the server.
async fn start_reverse_client(
    param: TunnelParam,
    manager: Arc<SessionManager>,
) -> crate::Result<()> {
    let pipe = start_client_session(Arc::new(param), manager).await?;
    run_connector(pipe).await;
    Ok(())
}

// --- benchmark ------------------------------------------------------------

const BENCH_PACKETS: usize = 1000;
const BENCH_PAYLOAD: usize = 4096;

/// Server half of `-ctrl bench`: echo frames until the peer hangs up.
async fn bench_echo(mut rh: BoxedRead, mut wh: BoxedWrite) -> crate::Result<()> {
    let mut arena = BytesMut::new();
    let mut scratch = BytesMut::new();
    let mut none = None;
    loop {
        let packet = match frame::read_packet(rh.as_mut(), &mut arena, &mut none).await {
            Ok(packet) => packet,
            Err(_) => return Ok(()),
        };
        frame::write_packet(
            wh.as_mut(),
            &mut scratch,
            packet.kind,
            packet.stream_id,
            &packet.payload,
            None,
        )
        .await?;
    }
}

/// Client half of `-ctrl bench`: round-trip frames and report throughput.
async fn run_bench_client(param: &TunnelParam) -> crate::Result<()> {
    let (mut rh, mut wh) = dial_transport(param).await?;
    let session = Session::new(0, String::new(), false);
    handshake_client(rh.as_mut(), wh.as_mut(), param, &session)
        .await
        .map_err(crate::Error::from)?;

    let mut payload = vec![0u8; BENCH_PAYLOAD];
    random_bytes(&mut payload);
    let mut arena = BytesMut::new();
    let mut scratch = BytesMut::new();
    let mut none = None;

    let start = Instant::now();
    for _ in 0..BENCH_PACKETS {
        frame::write_packet(wh.as_mut(), &mut scratch, PacketKind::Normal, 1, &payload, None)
            .await?;
        let echoed = frame::read_packet(rh.as_mut(), &mut arena, &mut none).await?;
        if echoed.payload.len() != payload.len() {
            return Err(crate::Error::Tunnel(TunnelError::InvalidFrame(
                "bench echo size mismatch".to_string(),
            )));
        }
    }
    let elapsed = start.elapsed();

    let bytes = (BENCH_PACKETS * BENCH_PAYLOAD * 2) as f64;
    info!(
        "bench: {} round trips of {} B in {:?} ({:.1} Mbit/s, {:.2} ms/rt)",
        BENCH_PACKETS,
        BENCH_PAYLOAD,
        elapsed,
        bytes * 8.0 / elapsed.as_secs_f64() / 1e6,
        elapsed.as_secs_f64() * 1000.0 / BENCH_PACKETS as f64,
    );
    Ok(())
}

// --- side programs --------------------------------------------------------

/// Plain TCP echo server.
pub async fn start_echo_server(port: u16) -> crate::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("echo server on {}", listener.local_addr()?);
    loop {
        let (mut socket, peer) = listener.accept().await?;
        debug!("echo client {}", peer);
        tokio::spawn(async move {
            let (mut rh, mut wh) = socket.split();
            let _ = tokio::io::copy(&mut rh, &mut wh).await;
        });
    }
}

/// Load source: stream pseudo-random blocks to every client until it hangs
/// up.
pub async fn start_heavy_server(port: u16) -> crate::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("heavy server on {}", listener.local_addr()?);
    loop {
        let (mut socket, peer) = listener.accept().await?;
        info!("heavy client {}", peer);
        tokio::spawn(async move {
            let mut block = vec![0u8; 64 * 1024];
            random_bytes(&mut block);
            let mut sent: u64 = 0;
            while socket.write_all(&block).await.is_ok() {
                sent += block.len() as u64;
            }
            info!("heavy client {} done after {} bytes", peer, sent);
        });
    }
}

/// Soak client: push random bursts at an echo endpoint and verify them.
pub async fn run_bot(addr: &str) -> crate::Result<()> {
    const BURST: usize = 4096;
    let mut round: u64 = 0;
    loop {
        round += 1;
        let mut socket = match TcpStream::connect(addr).await {
            Ok(socket) => socket,
            Err(err) => {
                warn!("bot round {}: connect {} failed: {}", round, addr, err);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let mut sent = vec![0u8; BURST];
        random_bytes(&mut sent);
        let mut received = vec![0u8; BURST];

        let result = async {
            socket.write_all(&sent).await?;
            socket.read_exact(&mut received).await?;
            Ok::<_, std::io::Error>(())
        }
        .await;

        match result {
            Ok(()) if received == sent => info!("bot round {}: ok", round),
            Ok(()) => error!("bot round {}: payload mismatch", round),
            Err(err) => warn!("bot round {}: {}", round, err),
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Session-dump console: connecting to the port returns the registry state.
pub fn spawn_console(addr: String, manager: Arc<SessionManager>) {
    // Accept the `:port` shorthand.
    let addr = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr
    };
    tokio::spawn(async move {
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!("console bind {} failed: {}", addr, err);
                return;
            }
        };
        info!("console on {}", addr);
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let dump = manager.dump();
            tokio::spawn(async move {
                let _ = socket.write_all(dump.as_bytes()).await;
            });
        }
    });
}

//! Per-stream relays
//!
//! For every multiplexed stream two pumps run: `stream_to_tunnel` reads the
//! application socket and queues NORMAL packets under the credit window;
//! `tunnel_to_stream` drains the inbound queue to the socket and returns
//! SYNC credit at block boundaries. The relay owns the socket: the first
//! pump to finish hard-closes the other, matching the zero-length NORMAL
//! EOF handshake on the wire.
//!
//! The forward side binds TCP listeners and opens streams with a connect
//! request; the reverse side services those requests by dialing the
//! destination.

use super::ctrl::{ConnectRequest, ConnectResponse, CtrlMessage};
use super::frame::Packet;
use super::pipe::Pipe;
use super::session::{Session, SessionState};
use super::stream::TunnelStream;
use super::{CTRL_STREAM_ID, WINDOW_BLOCK_PACKETS};
use crate::config::{ForwardInfo, HostInfo};
use crate::MAX_PAYLOAD_SIZE;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Application socket to tunnel queue.
async fn stream_to_tunnel(session: Arc<Session>, stream: Arc<TunnelStream>, mut sock: OwnedReadHalf) {
    let pack_tx = session.pack_sender();
    let mut credit = stream
        .take_credit_queue()
        .expect("one stream-to-tunnel pump per stream");
    let credit_back = stream.credit_sender();
    let mut arena = BytesMut::new();

    loop {
        let no = stream.write_no.load(Ordering::Acquire);

        if no % WINDOW_BLOCK_PACKETS == 0 {
            // A new block needs a credit token; park until the peer has
            // acknowledged enough to keep every packet resendable.
            let start = Instant::now();
            if credit.recv().await.is_none() {
                break;
            }
            stream.wait_time.add_stream_to_tunnel(start.elapsed());
        }

        arena.reserve(MAX_PAYLOAD_SIZE);
        // Cap the read at the frame limit; the arena may hold more spare
        // capacity than one packet.
        let read = sock.read_buf(&mut (&mut arena).limit(MAX_PAYLOAD_SIZE)).await;
        let size = match read {
            Ok(0) | Err(_) => {
                // Application EOF travels as a zero-length NORMAL.
                debug!("stream {}: local eof", stream.stream_id);
                let _ = pack_tx
                    .send(Packet::normal(stream.stream_id, Bytes::new()))
                    .await;
                break;
            }
            Ok(size) => size,
        };
        stream.write_size.fetch_add(size as i64, Ordering::Relaxed);

        if no % WINDOW_BLOCK_PACKETS == WINDOW_BLOCK_PACKETS - 1 {
            // Last packet of the block: peek a token without consuming it,
            // so the next block cannot outrun the resend buffer.
            match credit.try_recv() {
                Ok(token) => {
                    let _ = credit_back.try_send(token);
                }
                Err(_) => {
                    let start = Instant::now();
                    match credit.recv().await {
                        Some(token) => {
                            let _ = credit_back.try_send(token);
                        }
                        None => break,
                    }
                    stream.wait_time.add_stream_to_tunnel(start.elapsed());
                }
            }
        }

        stream.write_no.store(no + 1, Ordering::Release);
        if pack_tx
            .send(Packet::normal(stream.stream_id, arena.split().freeze()))
            .await
            .is_err()
        {
            break;
        }
    }
}

/// Tunnel inbound queue to application socket.
async fn tunnel_to_stream(session: Arc<Session>, stream: Arc<TunnelStream>, mut sock: OwnedWriteHalf) {
    let pack_tx = session.pack_sender();
    let mut inbound = stream
        .take_read_queue()
        .expect("one tunnel-to-stream pump per stream");

    loop {
        let start = Instant::now();
        let Some(payload) = inbound.recv().await else {
            break;
        };
        stream.wait_time.add_tunnel_to_stream(start.elapsed());

        let no = stream.read_no.load(Ordering::Acquire);
        if no % WINDOW_BLOCK_PACKETS == WINDOW_BLOCK_PACKETS - 1 {
            // Block consumed: return credit to the sender.
            let _ = pack_tx.send(Packet::sync(stream.stream_id, no)).await;
            stream.note_sync_sent(no);
        }
        stream.read_no.store(no + 1, Ordering::Release);
        stream
            .read_size
            .fetch_add(payload.len() as i64, Ordering::Relaxed);

        if payload.is_empty() {
            debug!("stream {}: peer eof", stream.stream_id);
            break;
        }
        if let Err(err) = sock.write_all(&payload).await {
            warn!(
                "stream {}: write error at readNo {}: {}",
                stream.stream_id, no, err
            );
            break;
        }
    }

    session.del_stream(stream.stream_id);
}

/// Run both pumps for one stream until either side finishes, then
/// hard-close the other.
pub async fn relay_session(pipe: Arc<Pipe>, stream: Arc<TunnelStream>, socket: TcpStream) {
    socket.set_nodelay(true).ok();
    let session = pipe.session().clone();
    let (rh, wh) = socket.into_split();

    let mut to_tunnel = tokio::spawn(stream_to_tunnel(session.clone(), stream.clone(), rh));
    let mut to_stream = tokio::spawn(tunnel_to_stream(session.clone(), stream.clone(), wh));

    tokio::select! {
        _ = &mut to_tunnel => to_stream.abort(),
        _ = &mut to_stream => to_tunnel.abort(),
    }
    let _ = to_tunnel.await;
    let _ = to_stream.await;

    session.del_stream(stream.stream_id);
    info!(
        "stream {}-{} closed: read {} write {} ({})",
        session.id(),
        stream.stream_id,
        stream.read_size.load(Ordering::Relaxed),
        stream.write_size.load(Ordering::Relaxed),
        stream.wait_time.summary(),
    );
}

/// One bound forward listener.
pub struct ListenInfo {
    pub listener: TcpListener,
    pub forward: ForwardInfo,
}

/// All forward listeners of one endpoint.
pub struct ListenGroup {
    pub list: Vec<ListenInfo>,
}

/// Bind every forward's listen endpoint.
pub async fn bind_forwards(forwards: &[ForwardInfo]) -> Result<ListenGroup, crate::Error> {
    let mut list = Vec::with_capacity(forwards.len());
    for forward in forwards {
        let listener = TcpListener::bind(forward.src.to_addr()).await.map_err(|e| {
            crate::Error::Config(format!("cannot listen on {}: {}", forward.src, e))
        })?;
        info!("forwarding {} -> {}", forward.src, forward.dst);
        list.push(ListenInfo {
            listener,
            forward: forward.clone(),
        });
    }
    Ok(ListenGroup { list })
}

/// Accept loop for one forward listener.
async fn listen_loop(listen: ListenInfo, pipe: Arc<Pipe>) {
    loop {
        let (socket, peer) = match listen.listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("accept failed on {}: {}", listen.forward.src, err);
                break;
            }
        };
        debug!("accepted {} for {}", peer, listen.forward.dst);
        tokio::spawn(open_and_relay(
            pipe.clone(),
            listen.forward.dst.clone(),
            socket,
        ));
    }
}

/// Open a stream across the tunnel for one accepted socket.
async fn open_and_relay(pipe: Arc<Pipe>, dst: HostInfo, socket: TcpStream) {
    let session = pipe.session().clone();
    let stream = session.add_stream(CTRL_STREAM_ID);
    let resp_rx = stream.take_resp().expect("fresh stream has a response slot");

    let request = CtrlMessage::Connect(ConnectRequest {
        host: dst.clone(),
        stream_id: stream.stream_id,
    });
    let encoded = match request.encode() {
        Ok(encoded) => encoded,
        Err(err) => {
            warn!("connect request encode failed: {}", err);
            session.del_stream(stream.stream_id);
            return;
        }
    };
    if session
        .pack_sender()
        .send(Packet::normal(CTRL_STREAM_ID, encoded.into()))
        .await
        .is_err()
    {
        session.del_stream(stream.stream_id);
        return;
    }

    match resp_rx.await {
        Ok(resp) if resp.success => relay_session(pipe, stream, socket).await,
        Ok(resp) => {
            warn!("peer failed to connect {}: {}", dst, resp.message);
            session.del_stream(stream.stream_id);
        }
        Err(_) => {
            debug!("session ended before connect response for {}", dst);
            session.del_stream(stream.stream_id);
        }
    }
}

/// Launch the accept loops for every forward listener.
pub fn spawn_listeners(group: ListenGroup, pipe: &Arc<Pipe>) -> Vec<JoinHandle<()>> {
    group
        .list
        .into_iter()
        .map(|listen| tokio::spawn(listen_loop(listen, pipe.clone())))
        .collect()
}

/// Block until the session carrying the listeners is truly over. Released
/// transports during successful reconnects do not end it.
pub async fn wait_listener_session(pipe: Arc<Pipe>) {
    loop {
        let _ = pipe.session().wait_release().await;
        if pipe.is_ended() {
            break;
        }
    }
    pipe.session().set_state(SessionState::Disconnected);
    info!("session {}: disconnected", pipe.session().id());
}

/// Service connect requests from the peer: dial, answer, relay. Runs until
/// the session tears down.
pub async fn run_connector(pipe: Arc<Pipe>) {
    let session = pipe.session().clone();
    while let Some(request) = session.next_connect_request().await {
        tokio::spawn(connect_and_relay(pipe.clone(), request));
    }
    session.set_state(SessionState::Disconnected);
    info!("session {}: connector done", session.id());
}

async fn connect_and_relay(pipe: Arc<Pipe>, request: ConnectRequest) {
    let session = pipe.session().clone();
    let addr = request.host.to_addr();
    let dialed = TcpStream::connect(&addr).await;

    let stream = session.add_stream(request.stream_id);
    let response = CtrlMessage::ConnectResp(ConnectResponse {
        success: dialed.is_ok(),
        message: dialed.as_ref().err().map(|e| e.to_string()).unwrap_or_default(),
        stream_id: request.stream_id,
    });
    let encoded = match response.encode() {
        Ok(encoded) => encoded,
        Err(err) => {
            warn!("connect response encode failed: {}", err);
            session.del_stream(request.stream_id);
            return;
        }
    };
    if session
        .pack_sender()
        .send(Packet::normal(CTRL_STREAM_ID, encoded.into()))
        .await
        .is_err()
    {
        session.del_stream(request.stream_id);
        return;
    }

    match dialed {
        Ok(socket) => {
            info!("connected to {} for stream {}", addr, request.stream_id);
            relay_session(pipe, stream, socket).await;
        }
        Err(err) => {
            warn!("failed to connect {}: {}", addr, err);
            session.del_stream(request.stream_id);
        }
    }
}

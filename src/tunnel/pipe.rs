//! The per-session pipe
//!
//! Five concurrent tasks service one session: the packet reader, the packet
//! writer, the keepalive ticker, and one pump pair per stream (see
//! `relay`). The pipe owns the current transport connection and the
//! reconnect machinery: any transport I/O error closes the connection,
//! exactly one task redials (or waits for the peer to redial), and the
//! writer replays everything the peer has not acknowledged.

use super::ctrl::CtrlMessage;
use super::frame::{self, Packet, PacketKind};
use super::manager::{SessionManager, POLL_INTERVAL};
use super::session::{ConnInfo, Session, SessionState};
use super::{TunnelError, CTRL_STREAM_ID, PRE_ENCRYPT, WINDOW_BLOCK_PACKETS};
use bytes::BytesMut;
use futures_util::future::BoxFuture;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Supplied by the transport layer: produce a replacement connection for
/// the session, or `None` to give up. Retry policy lives inside.
pub type ReconnectFn =
    Arc<dyn Fn(Arc<Session>) -> BoxFuture<'static, Option<Arc<ConnInfo>>> + Send + Sync>;

/// Reconnect backoff schedule; the last entry repeats.
pub const RECONNECT_BACKOFF_MS: [u64; 4] = [500, 1000, 2000, 5000];

/// Keepalive wakeup granularity, bounding teardown latency.
const SLEEP_INTERVAL: Duration = Duration::from_millis(500);

struct PipeState {
    /// Connection revision, bumped on every reconnect.
    rev: u64,
    /// True while one task runs the reconnect exchange.
    connecting: bool,
    /// True once the session is beyond saving.
    end: bool,
    conn: Arc<ConnInfo>,
}

pub struct Pipe {
    session: Arc<Session>,
    manager: Arc<SessionManager>,
    state: StdMutex<PipeState>,
    reconnect_fn: ReconnectFn,
    /// True when this side hosts the forward listeners.
    listener_side: bool,
    fin_tx: mpsc::Sender<bool>,
    fin_rx: tokio::sync::Mutex<mpsc::Receiver<bool>>,
}

impl Pipe {
    /// Register the pipe for this session and launch its tasks. A session
    /// that already has a pipe (transport reconnect) keeps the running one.
    pub fn start(
        manager: Arc<SessionManager>,
        conn: Arc<ConnInfo>,
        session: Arc<Session>,
        listener_side: bool,
        keepalive_interval_ms: u64,
        reconnect_fn: ReconnectFn,
    ) -> Arc<Pipe> {
        let (fin_tx, fin_rx) = mpsc::channel(2);
        let pipe = Arc::new(Pipe {
            session: session.clone(),
            manager: manager.clone(),
            state: StdMutex::new(PipeState {
                rev: 0,
                connecting: false,
                end: false,
                conn,
            }),
            reconnect_fn,
            listener_side,
            fin_tx,
            fin_rx: tokio::sync::Mutex::new(fin_rx),
        });

        let (pipe, is_new) = manager.set_pipe(&session, pipe);
        session.set_state(SessionState::Connected);
        if !is_new {
            info!("session {}: pipe already running", session.id());
            return pipe;
        }

        tokio::spawn(packet_writer(pipe.clone()));
        tokio::spawn(packet_reader(pipe.clone()));
        if PRE_ENCRYPT {
            tokio::spawn(packet_encrypter(pipe.clone()));
        }
        tokio::spawn(keepalive(pipe.clone(), keepalive_interval_ms));
        pipe
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn get_conn(&self) -> (u64, Arc<ConnInfo>) {
        let state = self.state.lock().unwrap();
        (state.rev, state.conn.clone())
    }

    pub fn is_ended(&self) -> bool {
        self.state.lock().unwrap().end
    }

    pub fn is_connecting(&self) -> bool {
        self.state.lock().unwrap().connecting
    }

    pub fn set_end(&self) {
        self.state.lock().unwrap().end = true;
    }

    /// Wait for both the reader and the writer to exit.
    pub async fn wait_finished(&self) {
        let mut fin = self.fin_rx.lock().await;
        for _ in 0..2 {
            if fin.recv().await.is_none() {
                break;
            }
        }
    }

    /// Notify the listener side that a transport connection was released.
    fn send_release(&self) {
        if self.listener_side && !self.session.release_pending() {
            self.session.notify_release(true);
        }
    }

    /// Unbind and close the current transport connection.
    fn release_conn(&self) {
        let conn = self.state.lock().unwrap().conn.clone();
        debug!("releasing conn {} of session {}", conn.conn_id, self.session.id());
        self.manager.release_session_conn(&self.session, &conn);
        conn.close();
        self.send_release();
    }

    /// Unpark connector tasks waiting for connect requests during teardown.
    async fn prepare_close(&self) {
        while self.session.connect_waiters() > 0 {
            let count = self.session.connect_waiters();
            debug!("prepare_close: unparking {} connect waiter(s)", count);
            for _ in 0..count {
                self.session.push_connect_request(None).await;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Re-establish the transport after an I/O error.
    ///
    /// `rev` is the revision the caller was using. If another task already
    /// reconnected, the caller just adopts the newer connection; otherwise
    /// this task takes the `connecting` token and performs the exchange.
    /// Returns the connection to use, its revision, and the end flag.
    pub async fn reconnect(&self, cause: &str, rev: u64) -> (Arc<ConnInfo>, u64, bool) {
        let (mut work_rev, mut work_conn) = self.get_conn();
        self.session.enter_reconnect_wait();
        info!(
            "session {}: reconnect ({}) rev {} current {}",
            self.session.id(),
            cause,
            rev,
            work_rev
        );

        let mut req_connect = false;
        loop {
            let decided = {
                let mut state = self.state.lock().unwrap();
                if state.rev != rev {
                    if !state.connecting {
                        // Someone else already installed a newer connection.
                        work_rev = state.rev;
                        work_conn = state.conn.clone();
                        self.session.leave_reconnect_wait();
                        true
                    } else {
                        false
                    }
                } else {
                    state.connecting = true;
                    state.rev += 1;
                    req_connect = true;
                    true
                }
            };
            if decided {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        if req_connect {
            self.release_conn();

            if self.session.pack_queue_empty() {
                // Keep the writer from parking on an empty queue while the
                // transport is down.
                let _ = self.session.pack_sender().try_send(Packet::dummy());
            }

            let ended = self.is_ended();
            if !ended {
                self.session.set_state(SessionState::Reconnecting);
                let new_conn = (self.reconnect_fn)(self.session.clone()).await;

                {
                    let mut state = self.state.lock().unwrap();
                    match new_conn {
                        Some(conn) => {
                            info!("session {}: new conn {}", self.session.id(), conn.conn_id);
                            state.conn = conn;
                        }
                        None => {
                            info!("session {}: reconnect abandoned", self.session.id());
                            state.end = true;
                            state.conn = ConnInfo::dummy();
                        }
                    }
                    work_rev = state.rev;
                    work_conn = state.conn.clone();
                }

                if self.is_ended() {
                    self.prepare_close().await;
                } else {
                    self.session.set_state(SessionState::Connected);
                    self.reannounce_sync();
                }
            } else {
                let state = self.state.lock().unwrap();
                work_rev = state.rev;
                work_conn = state.conn.clone();
            }

            self.session.leave_reconnect_wait();
            self.state.lock().unwrap().connecting = false;
        }

        let end = self.is_ended();
        info!(
            "session {}: reconnect ({}) done, rev {}, end {}",
            self.session.id(),
            cause,
            work_rev,
            end
        );
        (work_conn, work_rev, end)
    }

    /// Queue a SYNC re-announcement for every live stream.
    ///
    /// SYNC is not in the resend buffer, so a credit token lost with the
    /// old transport would stall the peer; receivers deduplicate by the
    /// acknowledged number, so this is safe against double delivery.
    fn reannounce_sync(&self) {
        let session = self.session.clone();
        tokio::spawn(async move {
            let pack_tx = session.pack_sender();
            for stream in session.user_streams() {
                if let Some(ack_no) = stream.sync_to_reannounce() {
                    debug!("stream {}: re-announcing sync {}", stream.stream_id, ack_no);
                    let _ = pack_tx.send(Packet::sync(stream.stream_id, ack_no)).await;
                }
            }
        });
    }
}

/// Write one packet to the transport.
///
/// Returns `Ok(false)` when the packet is the EOS terminator. `record`
/// controls whether a tracked packet enters the resend buffer (replays pass
/// `false`).
async fn write_pack(
    packet: &Packet,
    conn: &ConnInfo,
    session: &Session,
    record: bool,
    scratch: &mut BytesMut,
) -> Result<bool, TunnelError> {
    if packet.kind == PacketKind::Eos {
        info!("session {}: eos", session.id());
        return Ok(false);
    }

    scratch.clear();
    {
        let mut enc = conn.crypt_enc.lock().await;
        let cipher = match packet.kind {
            PacketKind::Normal | PacketKind::NormalDirect if !PRE_ENCRYPT => enc.as_mut(),
            _ => None,
        };
        frame::encode_packet(scratch, packet.kind, packet.stream_id, &packet.payload, cipher)?;
    }
    conn.write_frame(scratch).await?;

    if record && packet.kind.is_tracked() {
        session.post_write_data(packet);
    }
    Ok(true)
}

async fn packet_reader(pipe: Arc<Pipe>) {
    let session = pipe.session().clone();
    let (mut rev, mut conn) = pipe.get_conn();
    let mut arena = BytesMut::new();

    'outer: loop {
        let mut touched: Option<Arc<super::stream::TunnelStream>> = None;
        let mut read_size: usize = 1;

        // Read until one NORMAL is handled, reconnecting as needed.
        loop {
            let result = conn.read_frame(&mut arena).await;
            let packet = match result {
                Err(err) => {
                    warn!(
                        "session {}: tunnel read error at readNo {}: {}",
                        session.id(),
                        session.read_no.load(Ordering::Relaxed),
                        err
                    );
                    conn.close();
                    let (new_conn, new_rev, end) = pipe.reconnect("read", rev).await;
                    conn = new_conn;
                    rev = new_rev;
                    if end {
                        read_size = 0;
                        break;
                    }
                    continue;
                }
                Ok(packet) => packet,
            };

            match packet.kind {
                PacketKind::Dummy => continue,
                PacketKind::Sync => {
                    match Packet::sync_read_no(&packet.payload) {
                        Ok(ack_no) => match session.get_stream(packet.stream_id) {
                            Some(stream) => stream.deposit_credit(ack_no),
                            None => debug!("sync for released stream {}", packet.stream_id),
                        },
                        Err(err) => warn!("dropping malformed sync: {}", err),
                    }
                    continue;
                }
                PacketKind::Normal => {
                    session.read_no.fetch_add(1, Ordering::AcqRel);

                    if packet.stream_id == CTRL_STREAM_ID {
                        if packet.payload.is_empty() {
                            // EOS from the peer ends the whole session.
                            read_size = 0;
                            pipe.set_end();
                        } else if let Err(err) = bin2ctrl(&session, &packet.payload).await {
                            warn!("session {}: control error: {}", session.id(), err);
                            conn.close();
                            let (new_conn, new_rev, end) = pipe.reconnect("ctrl", rev).await;
                            conn = new_conn;
                            rev = new_rev;
                            if end {
                                read_size = 0;
                            } else {
                                continue;
                            }
                        } else {
                            read_size = 1;
                        }
                    } else if let Some(stream) = session.get_stream(packet.stream_id) {
                        read_size = packet.payload.len();
                        session.add_read_size(read_size);
                        let start = Instant::now();
                        // The pump applies backpressure here; the peer's
                        // window bounds what can be in flight.
                        let _ = stream.read_pack_sender().send(packet.payload).await;
                        stream.wait_time.add_packet_reader(start.elapsed());
                        touched = Some(stream);
                    } else {
                        debug!("discarding packet for unknown stream {}", packet.stream_id);
                        read_size = 1;
                    }
                    break;
                }
                PacketKind::NormalDirect | PacketKind::Eos => {
                    warn!("queue-local kind {:?} on the wire", packet.kind);
                    read_size = 1;
                    break;
                }
            }
        }

        if read_size == 0 {
            if let Some(stream) = touched {
                stream.unblock_credit();
            }
            if pipe.is_ended() {
                pipe.send_release();
                for stream in session.user_streams() {
                    // Wake parked pumps: a zero credit token for senders, an
                    // EOF marker for receivers.
                    stream.unblock_credit();
                    let _ = stream.read_pack_sender().try_send(bytes::Bytes::new());
                }
                let _ = session.pack_sender().try_send(Packet::eos());
                info!("session {}: read end", session.id());
                break 'outer;
            }
        }
    }

    pipe.prepare_close().await;
    info!("session {}: packetReader end", session.id());
    let _ = pipe.fin_tx.send(true).await;
}

/// Dispatch one control-stream payload.
async fn bin2ctrl(session: &Arc<Session>, payload: &[u8]) -> Result<(), TunnelError> {
    match CtrlMessage::decode(payload)? {
        CtrlMessage::Connect(req) => {
            info!(
                "session {}: connect request for {} (stream {})",
                session.id(),
                req.host,
                req.stream_id
            );
            session.set_state(SessionState::Header);
            session.push_connect_request(Some(req)).await;
        }
        CtrlMessage::ConnectResp(resp) => {
            debug!(
                "session {}: connect response for stream {}: {}",
                session.id(),
                resp.stream_id,
                resp.success
            );
            session.set_state(SessionState::RespHeader);
            match session.get_stream(resp.stream_id) {
                Some(stream) => {
                    if !stream.deliver_resp(resp) {
                        debug!("connect response slot already used");
                    }
                }
                // The originator gave up; nothing to deliver to.
                None => debug!("connect response for unknown stream {}", resp.stream_id),
            }
        }
    }
    Ok(())
}

/// Replay `[rewrite_no, write_no)` from the resend buffer after a
/// reconnect. Returns `false` when the session is beyond saving.
async fn rewrite_to_tunnel(
    pipe: &Arc<Pipe>,
    conn: &mut Arc<ConnInfo>,
    rev: &mut u64,
    scratch: &mut BytesMut,
) -> bool {
    let session = pipe.session();
    if session.rewrite_no() == -1 {
        return true;
    }
    info!(
        "session {}: rewrite [{}, {})",
        session.id(),
        session.rewrite_no(),
        session.write_no.load(Ordering::Acquire)
    );

    while session.write_no.load(Ordering::Acquire) > session.rewrite_no() {
        let no = session.rewrite_no();
        let Some(packet) = session.find_sent(no) else {
            // The peer acknowledged less than the resend buffer still
            // covers; continuing would corrupt its stream state.
            tracing::error!("session {}: resend packet {} not buffered", session.id(), no);
            panic!("resend target missing");
        };

        match write_pack(&packet, conn, session, false, scratch).await {
            Ok(true) => {
                debug!("session {}: rewrote packet {}", session.id(), no);
                session.advance_rewrite();
            }
            Ok(false) => return false,
            Err(err) => {
                warn!("session {}: rewrite failed at {}: {}", session.id(), no, err);
                conn.close();
                let (new_conn, new_rev, end) = pipe.reconnect("rewrite", *rev).await;
                *conn = new_conn;
                *rev = new_rev;
                if end {
                    return false;
                }
            }
        }
    }
    session.clear_rewrite();
    true
}

async fn reconnect_and_rewrite(
    pipe: &Arc<Pipe>,
    conn: &mut Arc<ConnInfo>,
    rev: &mut u64,
    scratch: &mut BytesMut,
) -> bool {
    let (new_conn, new_rev, end) = pipe.reconnect("write", *rev).await;
    *conn = new_conn;
    *rev = new_rev;
    if end {
        return false;
    }
    rewrite_to_tunnel(pipe, conn, rev, scratch).await
}

/// Write the trailing packet of a writer pass, retrying through
/// reconnect+rewrite until it is on the wire.
async fn packet_writer_sub(
    pipe: &Arc<Pipe>,
    packet: &Packet,
    conn: &mut Arc<ConnInfo>,
    rev: &mut u64,
    scratch: &mut BytesMut,
) -> bool {
    let session = pipe.session();
    loop {
        match write_pack(packet, conn, session, true, scratch).await {
            Ok(true) => return true,
            Ok(false) => return false,
            Err(err) => {
                warn!(
                    "session {}: tunnel write error at writeNo {}: {}",
                    session.id(),
                    session.write_no.load(Ordering::Relaxed),
                    err
                );
                if !reconnect_and_rewrite(pipe, conn, rev, scratch).await {
                    return false;
                }
                debug!(
                    "session {}: retrying write of kind {:?}",
                    session.id(),
                    packet.kind
                );
            }
        }
    }
}

async fn packet_writer(pipe: Arc<Pipe>) {
    let session = pipe.session().clone();
    let mut rx = if PRE_ENCRYPT {
        session.take_enc_pack_queue()
    } else {
        session.take_pack_queue()
    }
    .expect("packet writer starts once per session");

    let (mut rev, mut conn) = pipe.get_conn();
    let mut batch = BytesMut::new();
    let mut scratch = BytesMut::new();

    'outer: loop {
        let start = Instant::now();
        let Some(mut packet) = rx.recv().await else {
            break;
        };
        let waited = start.elapsed();
        if waited > Duration::from_micros(500) {
            session
                .writer_wait_us
                .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
        }

        // Opportunistic batching: coalesce queued NORMALs into one
        // transport write while the batch stays small.
        batch.clear();
        while !rx.is_empty() && packet.kind == PacketKind::Normal {
            if batch.len() + packet.frame_len() > super::MAX_BATCH_SIZE {
                break;
            }
            {
                let mut enc = conn.crypt_enc.lock().await;
                let cipher = if PRE_ENCRYPT { None } else { enc.as_mut() };
                if let Err(err) = frame::encode_packet(
                    &mut batch,
                    PacketKind::NormalDirect,
                    packet.stream_id,
                    &packet.payload,
                    cipher,
                ) {
                    tracing::error!("batch encode failed: {}", err);
                    break 'outer;
                }
            }
            session.post_write_data(&Packet {
                kind: PacketKind::NormalDirect,
                stream_id: packet.stream_id,
                payload: packet.payload.clone(),
            });

            packet = match rx.recv().await {
                Some(next) => next,
                None => Packet::eos(),
            };
        }

        if !batch.is_empty() {
            if let Err(err) = conn.write_frame(&batch).await {
                warn!(
                    "session {}: batch write error at writeNo {}: {}",
                    session.id(),
                    session.write_no.load(Ordering::Relaxed),
                    err
                );
                // The batch was encrypted under the dead connection's
                // cipher state; resending those bytes after reconnect would
                // not decrypt. Recovery is reconnect + rewrite from the
                // resend buffer only.
                if !reconnect_and_rewrite(&pipe, &mut conn, &mut rev, &mut scratch).await {
                    break;
                }
            }
        }

        if !packet_writer_sub(&pipe, &packet, &mut conn, &mut rev, &mut scratch).await {
            break;
        }
    }

    info!("session {}: packetWriter end", session.id());
    let _ = pipe.fin_tx.send(true).await;
}

/// The optional encrypt-ahead stage between the plaintext queue and the
/// writer. Compiled in but not spawned while [`PRE_ENCRYPT`] is off.
async fn packet_encrypter(pipe: Arc<Pipe>) {
    let session = pipe.session().clone();
    let mut rx = session
        .take_pack_queue()
        .expect("encrypter starts once per session");
    let mut credit = session
        .take_enc_credit_queue()
        .expect("encrypter credit taken once");
    let enc_tx = session.enc_pack_sender();

    let mut enc_no: u64 = 0;
    while let Some(mut packet) = rx.recv().await {
        if packet.kind == PacketKind::Normal {
            if enc_no % WINDOW_BLOCK_PACKETS as u64 == 0 && credit.recv().await.is_none() {
                break;
            }
            enc_no += 1;

            let (_, conn) = pipe.get_conn();
            let mut enc = conn.crypt_enc.lock().await;
            if let Some(cipher) = enc.as_mut() {
                let mut buf = BytesMut::from(&packet.payload[..]);
                cipher.process(&mut buf);
                packet.payload = buf.freeze();
            }
        }
        if enc_tx.send(packet).await.is_err() {
            break;
        }
    }
}

/// Queue one DUMMY per interval so NAT state and idle timers stay warm.
/// Quiet while reconnecting; exits with the pipe.
async fn keepalive(pipe: Arc<Pipe>, interval_ms: u64) {
    let session = pipe.session().clone();
    while !pipe.is_ended() {
        let mut slept = Duration::ZERO;
        while slept < Duration::from_millis(interval_ms) {
            tokio::time::sleep(SLEEP_INTERVAL).await;
            slept += SLEEP_INTERVAL;
            if pipe.is_ended() {
                break;
            }
        }
        if !pipe.is_ended() && !pipe.is_connecting() {
            let _ = session.pack_sender().send(Packet::dummy()).await;
        }
    }
    info!("session {}: keepalive end", session.id());
}

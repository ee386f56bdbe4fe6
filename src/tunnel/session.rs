//! Session state
//!
//! A [`Session`] is the logical end-to-end relationship between two tunnel
//! peers. It owns the multiplexed streams, the outbound packet queue, the
//! sequence counters and the bounded resend buffer that makes reconnects
//! lossless. The physical transport lives in [`ConnInfo`] and is replaced
//! on every reconnect; the session survives.

use super::ctrl::ConnectRequest;
use super::frame::Packet;
use super::stream::TunnelStream;
use super::{CTRL_STREAM_ID, RESEND_BUF_PACKETS, USER_STREAM_START, WINDOW_BLOCKS};
use crate::config::TunnelParam;
use crate::crypto::PacketCipher;
use crate::transport::{BoxedRead, BoxedWrite, DummyStream};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info};

/// Session lifecycle states, advertised for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    None,
    AuthChallenge,
    AuthResponse,
    AuthResult,
    AuthMiss,
    Header,
    RespHeader,
    Connected,
    Reconnecting,
    Disconnected,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::None => "none",
            SessionState::AuthChallenge => "authchallenge",
            SessionState::AuthResponse => "authresponse",
            SessionState::AuthResult => "authresult",
            SessionState::AuthMiss => "authmiss",
            SessionState::Header => "header",
            SessionState::RespHeader => "respheader",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Disconnected => "disconnected",
        }
    }
}

/// A packet retained for possible retransmission.
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub no: i64,
    pub packet: Packet,
}

#[derive(Debug, Clone)]
struct SessionIdent {
    id: i32,
    token: String,
}

/// One physical transport connection carrying a session.
pub struct ConnInfo {
    pub conn_id: u64,
    pub reader: Mutex<BoxedRead>,
    pub writer: Mutex<BoxedWrite>,
    /// Cipher state for the outgoing direction of this connection.
    pub crypt_enc: Mutex<Option<PacketCipher>>,
    /// Cipher state for the incoming direction.
    pub crypt_dec: Mutex<Option<PacketCipher>>,
    closed_tx: watch::Sender<bool>,
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

impl ConnInfo {
    pub fn new(reader: BoxedRead, writer: BoxedWrite, param: Option<&TunnelParam>) -> Arc<Self> {
        let cipher = |param: Option<&TunnelParam>| {
            param
                .filter(|p| p.encrypts())
                .and_then(|p| PacketCipher::new(&p.session_key, p.enc_count))
        };
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            crypt_enc: Mutex::new(cipher(param)),
            crypt_dec: Mutex::new(cipher(param)),
            closed_tx,
        })
    }

    /// The sentinel installed when reconnecting is abandoned: every
    /// transport operation fails.
    pub fn dummy() -> Arc<Self> {
        Self::new(Box::new(DummyStream), Box::new(DummyStream), None)
    }

    /// Close this connection: abort in-flight reads and writes, then tear
    /// down the transport halves so the peer sees EOF promptly. The peer
    /// relies on that EOF to notice the loss and redial.
    pub fn close(self: &Arc<Self>) {
        let _ = self.closed_tx.send(true);
        let conn = self.clone();
        tokio::spawn(async move {
            // The closed signal unparks whoever holds the half locks.
            let mut reader = conn.reader.lock().await;
            *reader = Box::new(DummyStream);
            drop(reader);
            let mut writer = conn.writer.lock().await;
            let _ = writer.shutdown().await;
            *writer = Box::new(DummyStream);
        });
    }

    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    fn closed_error() -> super::TunnelError {
        super::TunnelError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "transport closed",
        ))
    }

    /// Read one framed packet, failing fast once the connection was closed
    /// from another task.
    pub async fn read_frame(&self, arena: &mut bytes::BytesMut) -> Result<Packet, super::TunnelError> {
        let mut closed = self.closed();
        if *closed.borrow() {
            return Err(Self::closed_error());
        }
        let mut reader = self.reader.lock().await;
        let mut dec = self.crypt_dec.lock().await;
        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => Err(Self::closed_error()),
            result = super::frame::read_packet(reader.as_mut(), arena, &mut dec) => result,
        }
    }

    /// Write pre-framed bytes, failing fast once the connection was closed
    /// from another task. The fail-fast matters: a write into a dead
    /// socket's kernel buffer would otherwise look successful and the
    /// writer would never enter reconnect+rewrite.
    pub async fn write_frame(&self, buf: &[u8]) -> Result<(), super::TunnelError> {
        let mut closed = self.closed();
        if *closed.borrow() {
            return Err(Self::closed_error());
        }
        let mut writer = self.writer.lock().await;
        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => Err(Self::closed_error()),
            result = writer.write_all(buf) => Ok(result?),
        }
    }
}

/// Per-session state shared by the pipe tasks and the relay pumps.
pub struct Session {
    ident: StdMutex<SessionIdent>,
    pub is_server: bool,
    state: StdMutex<SessionState>,

    /// NORMAL packets sent on this logical session, across reconnects.
    pub write_no: AtomicI64,
    /// NORMAL packets received on this logical session.
    pub read_no: AtomicI64,
    wrote_size: AtomicI64,
    read_size: AtomicI64,

    /// Next packet number to retransmit, -1 outside a resend phase.
    rewrite_no: AtomicI64,
    /// The most recent [`RESEND_BUF_PACKETS`] sent packets, verbatim.
    sent_packets: StdMutex<VecDeque<SentPacket>>,

    streams: StdMutex<HashMap<u32, Arc<TunnelStream>>>,
    next_stream_id: AtomicU32,

    /// Outbound plaintext queue consumed by the packet writer.
    pack_tx: mpsc::Sender<Packet>,
    pack_rx: StdMutex<Option<mpsc::Receiver<Packet>>>,

    /// Outbound queue behind the encrypter stage; unused while
    /// pre-encryption is disabled.
    pack_enc_tx: mpsc::Sender<Packet>,
    pack_enc_rx: StdMutex<Option<mpsc::Receiver<Packet>>>,
    enc_credit_tx: mpsc::Sender<()>,
    enc_credit_rx: StdMutex<Option<mpsc::Receiver<()>>>,

    /// Pending connect requests from the peer, consumed one at a time.
    ctrl_req_tx: mpsc::Sender<Option<ConnectRequest>>,
    ctrl_req_rx: Mutex<mpsc::Receiver<Option<ConnectRequest>>>,
    ctrl_waiters: AtomicI32,

    /// How many of the two pipe loops are parked in reconnect (0..=2).
    reconnect_wait: AtomicI32,

    release_tx: mpsc::Sender<bool>,
    release_rx: Mutex<mpsc::Receiver<bool>>,

    /// Accumulated time the packet writer spent blocked on its queue.
    pub writer_wait_us: AtomicU64,
}

impl Session {
    pub fn new(session_id: i32, token: String, is_server: bool) -> Arc<Self> {
        let (pack_tx, pack_rx) = mpsc::channel(RESEND_BUF_PACKETS);
        let (pack_enc_tx, pack_enc_rx) = mpsc::channel(RESEND_BUF_PACKETS);
        let (enc_credit_tx, enc_credit_rx) = mpsc::channel(WINDOW_BLOCKS);
        let (ctrl_req_tx, ctrl_req_rx) = mpsc::channel(1);
        let (release_tx, release_rx) = mpsc::channel(3);

        for _ in 0..WINDOW_BLOCKS {
            enc_credit_tx
                .try_send(())
                .expect("fresh encrypter credit channel can hold the preload");
        }

        let session = Self {
            ident: StdMutex::new(SessionIdent {
                id: session_id,
                token,
            }),
            is_server,
            state: StdMutex::new(SessionState::None),
            write_no: AtomicI64::new(0),
            read_no: AtomicI64::new(0),
            wrote_size: AtomicI64::new(0),
            read_size: AtomicI64::new(0),
            rewrite_no: AtomicI64::new(-1),
            sent_packets: StdMutex::new(VecDeque::with_capacity(RESEND_BUF_PACKETS)),
            streams: StdMutex::new(HashMap::new()),
            next_stream_id: AtomicU32::new(USER_STREAM_START),
            pack_tx,
            pack_rx: StdMutex::new(Some(pack_rx)),
            pack_enc_tx,
            pack_enc_rx: StdMutex::new(Some(pack_enc_rx)),
            enc_credit_tx,
            enc_credit_rx: StdMutex::new(Some(enc_credit_rx)),
            ctrl_req_tx,
            ctrl_req_rx: Mutex::new(ctrl_req_rx),
            ctrl_waiters: AtomicI32::new(0),
            reconnect_wait: AtomicI32::new(0),
            release_tx,
            release_rx: Mutex::new(release_rx),
            writer_wait_us: AtomicU64::new(0),
        };

        // The control stream exists from birth.
        session
            .streams
            .lock()
            .unwrap()
            .insert(CTRL_STREAM_ID, Arc::new(TunnelStream::new(CTRL_STREAM_ID)));

        Arc::new(session)
    }

    pub fn ident(&self) -> (i32, String) {
        let ident = self.ident.lock().unwrap();
        (ident.id, ident.token.clone())
    }

    pub fn id(&self) -> i32 {
        self.ident.lock().unwrap().id
    }

    /// Adopt the server-assigned identity after a new-session handshake.
    pub fn update_ident(&self, session_id: i32, token: &str) {
        let mut ident = self.ident.lock().unwrap();
        ident.id = session_id;
        ident.token = token.to_string();
    }

    pub fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    // --- outbound queue ---------------------------------------------------

    pub fn pack_sender(&self) -> mpsc::Sender<Packet> {
        self.pack_tx.clone()
    }

    /// The writer's end of the outbound queue; taken once.
    pub fn take_pack_queue(&self) -> Option<mpsc::Receiver<Packet>> {
        self.pack_rx.lock().unwrap().take()
    }

    /// True when no packet is waiting in the outbound queue.
    pub fn pack_queue_empty(&self) -> bool {
        self.pack_tx.capacity() == self.pack_tx.max_capacity()
    }

    pub fn enc_pack_sender(&self) -> mpsc::Sender<Packet> {
        self.pack_enc_tx.clone()
    }

    pub fn take_enc_pack_queue(&self) -> Option<mpsc::Receiver<Packet>> {
        self.pack_enc_rx.lock().unwrap().take()
    }

    pub fn take_enc_credit_queue(&self) -> Option<mpsc::Receiver<()>> {
        self.enc_credit_rx.lock().unwrap().take()
    }

    // --- sequence numbers and the resend buffer ---------------------------

    /// Record one tracked write: append to the resend buffer, advance the
    /// write counter. Only NORMAL packets come through here.
    pub fn post_write_data(&self, packet: &Packet) {
        let no = self.write_no.load(Ordering::Acquire);
        {
            let mut sent = self.sent_packets.lock().unwrap();
            sent.push_back(SentPacket {
                no,
                packet: packet.clone(),
            });
            if sent.len() > RESEND_BUF_PACKETS {
                sent.pop_front();
            }
        }
        if super::PRE_ENCRYPT && no % super::WINDOW_BLOCK_PACKETS == super::WINDOW_BLOCK_PACKETS - 1
        {
            // The encrypter may run ahead again once a block is on the wire.
            let _ = self.enc_credit_tx.try_send(());
        }
        self.write_no.store(no + 1, Ordering::Release);
        self.wrote_size
            .fetch_add(packet.payload.len() as i64, Ordering::Relaxed);
    }

    /// Set the resend start after a handshake told us the peer's read
    /// counter.
    pub fn set_rewrite(&self, peer_read_no: i64) {
        let write_no = self.write_no.load(Ordering::Acquire);
        if write_no > peer_read_no {
            // The peer missed packets; replay from its read counter.
            self.rewrite_no.store(peer_read_no, Ordering::Release);
        } else if write_no == peer_read_no {
            self.rewrite_no.store(-1, Ordering::Release);
        } else {
            // The peer claims more packets than were ever sent. Continuing
            // would corrupt its stream state.
            error!(
                "peer read_no {} ahead of write_no {} -- aborting",
                peer_read_no, write_no
            );
            panic!("session counter mismatch");
        }
    }

    pub fn rewrite_no(&self) -> i64 {
        self.rewrite_no.load(Ordering::Acquire)
    }

    pub fn advance_rewrite(&self) {
        self.rewrite_no.fetch_add(1, Ordering::AcqRel);
    }

    pub fn clear_rewrite(&self) {
        self.rewrite_no.store(-1, Ordering::Release);
    }

    /// Look up a retained packet by number.
    pub fn find_sent(&self, no: i64) -> Option<Packet> {
        self.sent_packets
            .lock()
            .unwrap()
            .iter()
            .find(|sent| sent.no == no)
            .map(|sent| sent.packet.clone())
    }

    pub fn sent_count(&self) -> usize {
        self.sent_packets.lock().unwrap().len()
    }

    pub fn add_read_size(&self, size: usize) {
        self.read_size.fetch_add(size as i64, Ordering::Relaxed);
    }

    // --- stream registry --------------------------------------------------

    /// Register a stream. `CTRL_STREAM_ID` means "allocate a fresh user id".
    pub fn add_stream(self: &Arc<Self>, stream_id: u32) -> Arc<TunnelStream> {
        let stream_id = if stream_id == CTRL_STREAM_ID {
            let id = self.next_stream_id.fetch_add(1, Ordering::AcqRel);
            if id < USER_STREAM_START {
                error!("stream id overflow on session {}", self.id());
                panic!("stream id overflow");
            }
            id
        } else {
            stream_id
        };

        let mut streams = self.streams.lock().unwrap();
        if let Some(existing) = streams.get(&stream_id) {
            debug!("session {}: stream {} already registered", self.id(), stream_id);
            return existing.clone();
        }
        let stream = Arc::new(TunnelStream::new(stream_id));
        streams.insert(stream_id, stream.clone());
        info!(
            "session {}: stream {} added ({} live)",
            self.id(),
            stream_id,
            streams.len()
        );
        stream
    }

    pub fn get_stream(&self, stream_id: u32) -> Option<Arc<TunnelStream>> {
        self.streams.lock().unwrap().get(&stream_id).cloned()
    }

    /// Drop a stream. Inbound packets still queued are discarded when the
    /// pump's receiver goes away.
    pub fn del_stream(&self, stream_id: u32) {
        let mut streams = self.streams.lock().unwrap();
        streams.remove(&stream_id);
        info!(
            "session {}: stream {} removed ({} live)",
            self.id(),
            stream_id,
            streams.len()
        );
    }

    pub fn user_streams(&self) -> Vec<Arc<TunnelStream>> {
        self.streams
            .lock()
            .unwrap()
            .iter()
            .filter(|(&id, _)| id >= USER_STREAM_START)
            .map(|(_, stream)| stream.clone())
            .collect()
    }

    // --- connect requests (control stream) --------------------------------

    /// Hand a peer connect request to the connector task. `None` is the
    /// teardown placeholder that unparks a waiting connector.
    pub async fn push_connect_request(&self, req: Option<ConnectRequest>) {
        let _ = self.ctrl_req_tx.send(req).await;
    }

    /// Wait for the next connect request from the peer.
    pub async fn next_connect_request(&self) -> Option<ConnectRequest> {
        self.ctrl_waiters.fetch_add(1, Ordering::AcqRel);
        let req = self.ctrl_req_rx.lock().await.recv().await.flatten();
        self.ctrl_waiters.fetch_sub(1, Ordering::AcqRel);
        req
    }

    pub fn connect_waiters(&self) -> i32 {
        self.ctrl_waiters.load(Ordering::Acquire)
    }

    // --- reconnect bookkeeping --------------------------------------------

    pub fn enter_reconnect_wait(&self) {
        self.reconnect_wait.fetch_add(1, Ordering::AcqRel);
    }

    pub fn leave_reconnect_wait(&self) {
        self.reconnect_wait.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn reconnect_wait_state(&self) -> i32 {
        self.reconnect_wait.load(Ordering::Acquire)
    }

    // --- release notifications --------------------------------------------

    pub fn notify_release(&self, value: bool) {
        let _ = self.release_tx.try_send(value);
    }

    pub fn release_pending(&self) -> bool {
        self.release_tx.capacity() < self.release_tx.max_capacity()
    }

    pub async fn wait_release(&self) -> bool {
        self.release_rx.lock().await.recv().await.unwrap_or(false)
    }

    // --- observability ----------------------------------------------------

    pub fn dump(&self) -> String {
        let (id, token) = self.ident();
        let mut out = String::new();
        out.push_str(&format!("sessionId: {}\n", id));
        out.push_str(&format!("token: {}\n", token));
        out.push_str(&format!("state: {}\n", self.state().as_str()));
        out.push_str(&format!(
            "writeNo, readNo: {} {}\n",
            self.write_no.load(Ordering::Relaxed),
            self.read_no.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "wroteSize, readSize: {} {}\n",
            self.wrote_size.load(Ordering::Relaxed),
            self.read_size.load(Ordering::Relaxed)
        ));
        out.push_str(&format!("rewriteNo: {}\n", self.rewrite_no()));
        out.push_str(&format!("sentPackets: {}\n", self.sent_count()));
        out.push_str(&format!(
            "packQueue: {}\n",
            self.pack_tx.max_capacity() - self.pack_tx.capacity()
        ));
        out.push_str(&format!("reconnectWait: {}\n", self.reconnect_wait_state()));
        let streams = self.streams.lock().unwrap();
        out.push_str(&format!("streams: {}\n", streams.len()));
        for (stream_id, stream) in streams.iter() {
            out.push_str(&format!(
                "  stream {}-{}: readNo {}, writeNo {}, readSize {}, writeSize {}\n",
                id,
                stream_id,
                stream.read_no.load(Ordering::Relaxed),
                stream.write_no.load(Ordering::Relaxed),
                stream.read_size.load(Ordering::Relaxed),
                stream.write_size.load(Ordering::Relaxed),
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn normal(no: u8) -> Packet {
        Packet::normal(1, Bytes::copy_from_slice(&[no]))
    }

    #[test]
    fn test_post_write_data_bounds() {
        let session = Session::new(1, "token".to_string(), false);

        for no in 0..(RESEND_BUF_PACKETS + 10) {
            session.post_write_data(&normal(no as u8));
        }

        assert_eq!(session.write_no.load(Ordering::Relaxed), (RESEND_BUF_PACKETS + 10) as i64);
        assert_eq!(session.sent_count(), RESEND_BUF_PACKETS);

        // The retained range is contiguous and ends just before write_no.
        let sent = session.sent_packets.lock().unwrap();
        let first = sent.front().unwrap().no;
        let last = sent.back().unwrap().no;
        assert_eq!(last, (RESEND_BUF_PACKETS + 10 - 1) as i64);
        assert_eq!(first, last - RESEND_BUF_PACKETS as i64 + 1);
    }

    #[test]
    fn test_set_rewrite() {
        let session = Session::new(1, "token".to_string(), false);
        for no in 0..10 {
            session.post_write_data(&normal(no));
        }

        // Peer behind: replay from its counter.
        session.set_rewrite(4);
        assert_eq!(session.rewrite_no(), 4);

        // Peer caught up: nothing to replay.
        session.set_rewrite(10);
        assert_eq!(session.rewrite_no(), -1);
    }

    #[test]
    #[should_panic(expected = "session counter mismatch")]
    fn test_set_rewrite_peer_ahead_panics() {
        let session = Session::new(1, "token".to_string(), false);
        session.set_rewrite(5);
    }

    #[test]
    fn test_find_sent() {
        let session = Session::new(1, "token".to_string(), false);
        for no in 0..5 {
            session.post_write_data(&normal(no));
        }
        assert_eq!(&session.find_sent(3).unwrap().payload[..], &[3u8]);
        assert!(session.find_sent(99).is_none());
    }

    #[test]
    fn test_stream_allocation() {
        let session = Session::new(1, "token".to_string(), true);
        // Control stream pre-registered.
        assert!(session.get_stream(CTRL_STREAM_ID).is_some());

        let first = session.add_stream(CTRL_STREAM_ID);
        let second = session.add_stream(CTRL_STREAM_ID);
        assert_eq!(first.stream_id, USER_STREAM_START);
        assert_eq!(second.stream_id, USER_STREAM_START + 1);

        // Explicit registration under the peer-chosen id.
        let fixed = session.add_stream(7);
        assert_eq!(fixed.stream_id, 7);
        assert_eq!(session.user_streams().len(), 3);

        session.del_stream(7);
        assert!(session.get_stream(7).is_none());
        assert_eq!(session.user_streams().len(), 2);
    }

    #[test]
    fn test_pack_queue_empty() {
        let session = Session::new(1, "token".to_string(), false);
        assert!(session.pack_queue_empty());
        session.pack_sender().try_send(Packet::dummy()).unwrap();
        assert!(!session.pack_queue_empty());
    }

    #[tokio::test]
    async fn test_connect_request_channel() {
        let session = Session::new(1, "token".to_string(), true);
        let req = ConnectRequest {
            host: crate::config::HostInfo::new("", "127.0.0.1", 7, ""),
            stream_id: 1,
        };
        session.push_connect_request(Some(req.clone())).await;
        assert_eq!(session.next_connect_request().await, Some(req));

        // The teardown placeholder unparks a waiter with None.
        session.push_connect_request(None).await;
        assert_eq!(session.next_connect_request().await, None);
    }
}

//! Per-stream state inside a session
//!
//! A [`TunnelStream`] is one multiplexed TCP stream: its inbound packet
//! queue, flow-control credit channel, sequence counters and the one-shot
//! slot for the peer's connect response. The relay pumps own the receiving
//! ends of the channels; the packet reader holds cloned senders.

use super::ctrl::ConnectResponse;
use super::{RESEND_BUF_PACKETS, WINDOW_BLOCKS};
use bytes::Bytes;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Accumulated blocking time per suspension point, for the close log.
#[derive(Debug, Default)]
pub struct WaitTimeInfo {
    stream_to_tunnel_us: AtomicU64,
    tunnel_to_stream_us: AtomicU64,
    packet_reader_us: AtomicU64,
}

impl WaitTimeInfo {
    pub fn add_stream_to_tunnel(&self, span: Duration) {
        self.stream_to_tunnel_us
            .fetch_add(span.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_tunnel_to_stream(&self, span: Duration) {
        self.tunnel_to_stream_us
            .fetch_add(span.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_packet_reader(&self, span: Duration) {
        self.packet_reader_us
            .fetch_add(span.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn summary(&self) -> String {
        format!(
            "stream2tunnel {:?}, tunnel2stream {:?}, packetReader {:?}",
            Duration::from_micros(self.stream_to_tunnel_us.load(Ordering::Relaxed)),
            Duration::from_micros(self.tunnel_to_stream_us.load(Ordering::Relaxed)),
            Duration::from_micros(self.packet_reader_us.load(Ordering::Relaxed)),
        )
    }
}

/// One multiplexed stream.
pub struct TunnelStream {
    pub stream_id: u32,

    /// Inbound payload queue, fed by the packet reader.
    read_pack_tx: mpsc::Sender<Bytes>,
    read_pack_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,

    /// Credit channel: each token buys one block of outgoing packets.
    /// Multi-sender (SYNC deposits, shutdown unblocking, peek put-back),
    /// single consumer (the stream-to-tunnel pump).
    credit_tx: mpsc::Sender<i64>,
    credit_rx: Mutex<Option<mpsc::Receiver<i64>>>,

    /// NORMAL packets delivered to the application socket.
    pub read_no: AtomicI64,
    /// NORMAL packets read from the application socket.
    pub write_no: AtomicI64,
    pub read_size: AtomicI64,
    pub write_size: AtomicI64,

    /// Highest SYNC value sent for this stream, re-announced after a
    /// reconnect; -1 before the first SYNC.
    last_sync_sent: AtomicI64,
    /// Highest SYNC value already credited, for deduplication; -1 before
    /// the first SYNC.
    last_sync_seen: AtomicI64,

    resp_tx: Mutex<Option<oneshot::Sender<ConnectResponse>>>,
    resp_rx: Mutex<Option<oneshot::Receiver<ConnectResponse>>>,

    pub wait_time: WaitTimeInfo,
}

impl TunnelStream {
    pub fn new(stream_id: u32) -> Self {
        let (read_pack_tx, read_pack_rx) = mpsc::channel(RESEND_BUF_PACKETS);
        let (credit_tx, credit_rx) = mpsc::channel(WINDOW_BLOCKS);
        let (resp_tx, resp_rx) = oneshot::channel();

        // Preload the full window so a fresh stream sends immediately.
        for _ in 0..WINDOW_BLOCKS {
            credit_tx
                .try_send(0)
                .expect("fresh credit channel can hold the preload");
        }

        Self {
            stream_id,
            read_pack_tx,
            read_pack_rx: Mutex::new(Some(read_pack_rx)),
            credit_tx,
            credit_rx: Mutex::new(Some(credit_rx)),
            read_no: AtomicI64::new(0),
            write_no: AtomicI64::new(0),
            read_size: AtomicI64::new(0),
            write_size: AtomicI64::new(0),
            last_sync_sent: AtomicI64::new(-1),
            last_sync_seen: AtomicI64::new(-1),
            resp_tx: Mutex::new(Some(resp_tx)),
            resp_rx: Mutex::new(Some(resp_rx)),
            wait_time: WaitTimeInfo::default(),
        }
    }

    /// Sender feeding the inbound queue (held by the packet reader).
    pub fn read_pack_sender(&self) -> mpsc::Sender<Bytes> {
        self.read_pack_tx.clone()
    }

    /// The inbound queue receiver; taken once by the tunnel-to-stream pump.
    pub fn take_read_queue(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.read_pack_rx.lock().unwrap().take()
    }

    /// The credit receiver; taken once by the stream-to-tunnel pump.
    pub fn take_credit_queue(&self) -> Option<mpsc::Receiver<i64>> {
        self.credit_rx.lock().unwrap().take()
    }

    pub fn credit_sender(&self) -> mpsc::Sender<i64> {
        self.credit_tx.clone()
    }

    /// Deposit a credit token for a received SYNC.
    ///
    /// Tokens are deduplicated by acknowledged read number so the
    /// re-announcement after a reconnect cannot over-credit the window.
    pub fn deposit_credit(&self, ack_no: i64) {
        let seen = self.last_sync_seen.load(Ordering::Acquire);
        if ack_no <= seen {
            debug!("stream {}: duplicate sync {} dropped", self.stream_id, ack_no);
            return;
        }
        self.last_sync_seen.store(ack_no, Ordering::Release);
        if self.credit_tx.try_send(ack_no).is_err() {
            // Full credit channel means the window math went wrong upstream.
            debug!("stream {}: credit channel full, sync {} dropped", self.stream_id, ack_no);
        }
    }

    /// Push one token regardless of the window, so a parked sender wakes up
    /// during teardown. No-op when credit is already available.
    pub fn unblock_credit(&self) {
        let _ = self.credit_tx.try_send(0);
    }

    /// Record the SYNC value announced to the peer.
    pub fn note_sync_sent(&self, ack_no: i64) {
        self.last_sync_sent.store(ack_no, Ordering::Release);
    }

    /// The SYNC value to re-announce after a reconnect, if any was sent.
    pub fn sync_to_reannounce(&self) -> Option<i64> {
        match self.last_sync_sent.load(Ordering::Acquire) {
            -1 => None,
            no => Some(no),
        }
    }

    /// Deliver the peer's connect response to the waiting opener.
    pub fn deliver_resp(&self, resp: ConnectResponse) -> bool {
        match self.resp_tx.lock().unwrap().take() {
            Some(tx) => tx.send(resp).is_ok(),
            None => false,
        }
    }

    /// The response receiver; taken once by the stream opener.
    pub fn take_resp(&self) -> Option<oneshot::Receiver<ConnectResponse>> {
        self.resp_rx.lock().unwrap().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credit_preloaded() {
        let stream = TunnelStream::new(1);
        let mut credit = stream.take_credit_queue().unwrap();

        // The full window is available up front.
        for _ in 0..WINDOW_BLOCKS {
            assert!(credit.try_recv().is_ok());
        }
        assert!(credit.try_recv().is_err());
    }

    #[test]
    fn test_deposit_credit_dedup() {
        let stream = TunnelStream::new(1);
        let mut credit = stream.take_credit_queue().unwrap();
        for _ in 0..WINDOW_BLOCKS {
            credit.try_recv().unwrap();
        }

        stream.deposit_credit(29);
        stream.deposit_credit(29); // replayed announcement
        assert_eq!(credit.try_recv().unwrap(), 29);
        assert!(credit.try_recv().is_err(), "duplicate sync must not credit");

        stream.deposit_credit(59);
        assert_eq!(credit.try_recv().unwrap(), 59);
    }

    #[test]
    fn test_sync_reannounce_state() {
        let stream = TunnelStream::new(4);
        assert_eq!(stream.sync_to_reannounce(), None);
        stream.note_sync_sent(29);
        assert_eq!(stream.sync_to_reannounce(), Some(29));
    }

    #[tokio::test]
    async fn test_resp_single_shot() {
        let stream = TunnelStream::new(2);
        let rx = stream.take_resp().unwrap();

        let resp = ConnectResponse {
            success: true,
            message: String::new(),
            stream_id: 2,
        };
        assert!(stream.deliver_resp(resp.clone()));
        assert!(!stream.deliver_resp(resp.clone()), "slot is single shot");

        assert_eq!(rx.await.unwrap(), resp);
    }

    #[tokio::test]
    async fn test_inbound_queue() {
        let stream = TunnelStream::new(3);
        let tx = stream.read_pack_sender();
        let mut rx = stream.take_read_queue().unwrap();

        tx.send(Bytes::from_static(b"payload")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"payload"));
    }
}

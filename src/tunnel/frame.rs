//! Frame encoding/decoding for the tunnel protocol
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+--------+--------+--------+
//! |   Payload Length (2B BE)  |  Kind  |     Stream ID (4B BE)   |
//! +--------+--------+--------+--------+--------+--------+--------+
//! |                          Payload                             |
//! +--------------------------------------------------------------+
//! ```
//!
//! Only `Normal`, `Sync` and `Dummy` appear on the wire. `NormalDirect` is a
//! queue-local tag for packets pre-framed during batch coalescing, and `Eos`
//! never leaves the process. NORMAL payloads of user streams pass through
//! the packet cipher; SYNC, DUMMY and control-stream payloads do not.

use super::{TunnelError, CTRL_STREAM_ID, USER_STREAM_START};
use crate::crypto::PacketCipher;
use crate::transport::{TunnelRead, TunnelWrite};
use crate::MAX_PAYLOAD_SIZE;
use bytes::{BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 7;

/// Packet kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    /// Stream data; the only kind that advances sequence numbers.
    Normal = 0x00,
    /// Flow-control credit token carrying the peer's acknowledged read
    /// counter.
    Sync = 0x01,
    /// Keepalive placeholder, never counted.
    Dummy = 0x02,
    /// Queue-local: a `Normal` recorded during batch coalescing. On the
    /// wire it is a `Normal`.
    NormalDirect = 0x03,
    /// Queue-local terminator for the packet writer.
    Eos = 0x04,
}

impl PacketKind {
    fn wire_byte(self) -> u8 {
        match self {
            PacketKind::Normal | PacketKind::NormalDirect => 0x00,
            PacketKind::Sync => 0x01,
            PacketKind::Dummy => 0x02,
            PacketKind::Eos => unreachable!("EOS never reaches the wire"),
        }
    }

    /// True for the kinds recorded in the resend buffer.
    pub fn is_tracked(self) -> bool {
        matches!(self, PacketKind::Normal | PacketKind::NormalDirect)
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(PacketKind::Normal),
            0x01 => Ok(PacketKind::Sync),
            0x02 => Ok(PacketKind::Dummy),
            other => Err(TunnelError::UnknownKind(other)),
        }
    }
}

/// One packet moving through the session queues.
#[derive(Debug, Clone)]
pub struct Packet {
    pub kind: PacketKind,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Packet {
    pub fn normal(stream_id: u32, payload: Bytes) -> Self {
        Self {
            kind: PacketKind::Normal,
            stream_id,
            payload,
        }
    }

    pub fn sync(stream_id: u32, read_no: i64) -> Self {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_i64(read_no);
        Self {
            kind: PacketKind::Sync,
            stream_id,
            payload: payload.freeze(),
        }
    }

    pub fn dummy() -> Self {
        Self {
            kind: PacketKind::Dummy,
            stream_id: CTRL_STREAM_ID,
            payload: Bytes::new(),
        }
    }

    pub fn eos() -> Self {
        Self {
            kind: PacketKind::Eos,
            stream_id: CTRL_STREAM_ID,
            payload: Bytes::new(),
        }
    }

    /// Decode a SYNC payload back into the acknowledged read counter.
    pub fn sync_read_no(payload: &[u8]) -> Result<i64, TunnelError> {
        let bytes: [u8; 8] = payload
            .try_into()
            .map_err(|_| TunnelError::InvalidFrame(format!("sync payload {} bytes", payload.len())))?;
        Ok(i64::from_be_bytes(bytes))
    }

    /// Framed size of this packet.
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

/// Append one framed packet to `dst`, encrypting a user-stream NORMAL
/// payload when a cipher is active.
///
/// This is the buffered writer entry point; the direct form is
/// [`write_packet`]. Batch coalescing calls this repeatedly on the same
/// scratch buffer before a single transport write.
pub fn encode_packet(
    dst: &mut BytesMut,
    kind: PacketKind,
    stream_id: u32,
    payload: &[u8],
    cipher: Option<&mut PacketCipher>,
) -> Result<(), TunnelError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(TunnelError::FrameTooLarge(payload.len(), MAX_PAYLOAD_SIZE));
    }

    dst.reserve(FRAME_HEADER_SIZE + payload.len());
    dst.put_u16(payload.len() as u16);
    dst.put_u8(kind.wire_byte());
    dst.put_u32(stream_id);

    let body = dst.len();
    dst.extend_from_slice(payload);

    if kind.is_tracked() && stream_id >= USER_STREAM_START {
        if let Some(cipher) = cipher {
            cipher.process(&mut dst[body..]);
        }
    }
    Ok(())
}

/// Frame one packet and write it to the transport in a single write.
pub async fn write_packet<W: TunnelWrite + ?Sized>(
    writer: &mut W,
    scratch: &mut BytesMut,
    kind: PacketKind,
    stream_id: u32,
    payload: &[u8],
    cipher: Option<&mut PacketCipher>,
) -> Result<(), TunnelError> {
    scratch.clear();
    encode_packet(scratch, kind, stream_id, payload, cipher)?;
    writer.write_all(scratch).await?;
    Ok(())
}

/// Read one framed packet.
///
/// `arena` is the reader's receive buffer: the payload is read into it and
/// split off as a `Bytes` handle, so the backing allocation is recycled once
/// downstream consumers drop the handle. User-stream NORMAL payloads are
/// decrypted in place before the split.
pub async fn read_packet<R: TunnelRead + ?Sized>(
    reader: &mut R,
    arena: &mut BytesMut,
    cipher: &mut Option<PacketCipher>,
) -> Result<Packet, TunnelError> {
    let mut head = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut head).await?;

    let len = u16::from_be_bytes([head[0], head[1]]) as usize;
    let kind = PacketKind::try_from(head[2])?;
    let stream_id = u32::from_be_bytes([head[3], head[4], head[5], head[6]]);

    arena.resize(len, 0);
    if len > 0 {
        reader.read_exact(&mut arena[..len]).await?;
    }

    if kind == PacketKind::Normal && stream_id >= USER_STREAM_START {
        if let Some(cipher) = cipher {
            cipher.process(&mut arena[..len]);
        }
    }

    Ok(Packet {
        kind,
        stream_id,
        payload: arena.split_to(len).freeze(),
    })
}

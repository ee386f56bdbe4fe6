//! Control-stream sub-protocol
//!
//! Payloads on stream 0 open streams across the tunnel: the forward side
//! sends a [`ConnectRequest`] naming the destination and the stream id it
//! allocated; the peer dials and answers with a [`ConnectResponse`] routed
//! to that stream's response slot.
//!
//! Encoding is one kind byte followed by JSON, as the wire traffic on the
//! control stream is a handful of messages per opened stream.

use super::TunnelError;
use crate::config::HostInfo;
use serde::{Deserialize, Serialize};

const CTRL_CONNECT: u8 = 0;
const CTRL_CONNECT_RESP: u8 = 1;

/// Ask the peer to dial `host` and bind the socket to `stream_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub host: HostInfo,
    pub stream_id: u32,
}

/// Outcome of a [`ConnectRequest`], delivered to the originating stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub success: bool,
    pub message: String,
    pub stream_id: u32,
}

/// A decoded control payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtrlMessage {
    Connect(ConnectRequest),
    ConnectResp(ConnectResponse),
}

impl CtrlMessage {
    pub fn encode(&self) -> Result<Vec<u8>, TunnelError> {
        let (kind, body) = match self {
            CtrlMessage::Connect(req) => (CTRL_CONNECT, serde_json::to_vec(req)?),
            CtrlMessage::ConnectResp(resp) => (CTRL_CONNECT_RESP, serde_json::to_vec(resp)?),
        };
        let mut buf = Vec::with_capacity(1 + body.len());
        buf.push(kind);
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TunnelError> {
        let (&kind, body) = buf
            .split_first()
            .ok_or_else(|| TunnelError::InvalidFrame("empty control payload".to_string()))?;
        match kind {
            CTRL_CONNECT => Ok(CtrlMessage::Connect(serde_json::from_slice(body)?)),
            CTRL_CONNECT_RESP => Ok(CtrlMessage::ConnectResp(serde_json::from_slice(body)?)),
            other => Err(TunnelError::InvalidFrame(format!(
                "unknown control kind {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_roundtrip() {
        let msg = CtrlMessage::Connect(ConnectRequest {
            host: HostInfo::new("", "example.com", 443, ""),
            stream_id: 3,
        });
        let decoded = CtrlMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_connect_resp_roundtrip() {
        let msg = CtrlMessage::ConnectResp(ConnectResponse {
            success: false,
            message: "connection refused".to_string(),
            stream_id: 9,
        });
        let decoded = CtrlMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_bad_payloads_rejected() {
        assert!(CtrlMessage::decode(&[]).is_err());
        assert!(CtrlMessage::decode(&[9, b'{', b'}']).is_err());
        assert!(CtrlMessage::decode(&[CTRL_CONNECT, b'n', b'o']).is_err());
    }
}

//! Tunnel configuration: endpoints, forwards, modes and session parameters.

use crate::crypto::kdf::derive_session_key;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Floor for the keepalive interval in milliseconds.
pub const MIN_KEEPALIVE_INTERVAL_MS: u64 = 2000;

/// Default keepalive interval in milliseconds.
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 20 * 1000;

/// One tunnel endpoint.
///
/// `scheme` and `path` only matter for the WebSocket transport; plain TCP
/// endpoints leave them empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub scheme: String,
    pub name: String,
    pub port: u16,
    pub path: String,
}

impl HostInfo {
    pub fn new(scheme: &str, name: &str, port: u16, path: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            name: name.to_string(),
            port,
            path: path.to_string(),
        }
    }

    /// Address form used for dialing and binding.
    pub fn to_addr(&self) -> String {
        format!("{}:{}", self.name, self.port)
    }
}

impl fmt::Display for HostInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.port)
    }
}

/// Parse `host:port` or `:port` into a [`HostInfo`].
///
/// A missing host means "all interfaces" for listeners and loopback makes no
/// sense for dialing, so the empty name is rendered as `0.0.0.0`.
pub fn parse_endpoint(text: &str) -> Result<HostInfo, crate::Error> {
    let (name, port) = text
        .rsplit_once(':')
        .ok_or_else(|| crate::Error::Config(format!("illegal endpoint '{}', want host:port", text)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| crate::Error::Config(format!("illegal port in '{}'", text)))?;
    let name = if name.is_empty() { "0.0.0.0" } else { name };
    Ok(HostInfo::new("", name, port, ""))
}

/// A forwarded port: listen at `src`, relay to `dst` on the peer side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardInfo {
    pub src: HostInfo,
    pub dst: HostInfo,
}

/// Parse `listen,dst` (each `host:port`) into a [`ForwardInfo`].
pub fn parse_forward(text: &str) -> Result<ForwardInfo, crate::Error> {
    let (src, dst) = text
        .split_once(',')
        .ok_or_else(|| crate::Error::Config(format!("illegal forward '{}', want listen,dst", text)))?;
    Ok(ForwardInfo {
        src: parse_endpoint(src)?,
        dst: parse_endpoint(dst)?,
    })
}

/// The eight tunnel modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelMode {
    Server,
    ReverseServer,
    WsServer,
    ReverseWsServer,
    Client,
    ReverseClient,
    WsClient,
    ReverseWsClient,
}

impl TunnelMode {
    /// True for the listening (accepting) end of the transport.
    pub fn is_server_side(&self) -> bool {
        matches!(
            self,
            TunnelMode::Server
                | TunnelMode::ReverseServer
                | TunnelMode::WsServer
                | TunnelMode::ReverseWsServer
        )
    }

    /// True when the transport is WebSocket rather than raw TCP.
    pub fn is_websocket(&self) -> bool {
        matches!(
            self,
            TunnelMode::WsServer
                | TunnelMode::ReverseWsServer
                | TunnelMode::WsClient
                | TunnelMode::ReverseWsClient
        )
    }

    /// True when the forward listeners live on this side.
    ///
    /// Forward modes listen on the client, reverse modes on the server.
    pub fn hosts_forwards(&self) -> bool {
        matches!(
            self,
            TunnelMode::Client
                | TunnelMode::WsClient
                | TunnelMode::ReverseServer
                | TunnelMode::ReverseWsServer
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelMode::Server => "server",
            TunnelMode::ReverseServer => "r-server",
            TunnelMode::WsServer => "wsserver",
            TunnelMode::ReverseWsServer => "r-wsserver",
            TunnelMode::Client => "client",
            TunnelMode::ReverseClient => "r-client",
            TunnelMode::WsClient => "wsclient",
            TunnelMode::ReverseWsClient => "r-wsclient",
        }
    }
}

impl fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control mode negotiated at handshake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlMode {
    /// Regular tunnel session.
    Normal,
    /// Frame echo benchmark instead of a session.
    Bench,
}

/// IP allow-list. An empty list allows everything.
#[derive(Debug, Clone, Default)]
pub struct IpMask {
    networks: Vec<IpNet>,
}

impl IpMask {
    pub fn parse(patterns: &[String]) -> Result<Self, crate::Error> {
        let mut networks = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let net: IpNet = pattern
                .parse()
                .map_err(|e| crate::Error::Config(format!("illegal CIDR '{}': {}", pattern, e)))?;
            networks.push(net);
        }
        Ok(Self { networks })
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    pub fn allows(&self, addr: IpAddr) -> bool {
        self.networks.is_empty() || self.networks.iter().any(|net| net.contains(&addr))
    }
}

/// Everything a tunnel endpoint needs to run one mode.
#[derive(Debug, Clone)]
pub struct TunnelParam {
    /// Shared handshake password. `None` is accepted but warned about.
    pub pass: Option<String>,
    pub mode: TunnelMode,
    /// Peers outside these networks are rejected before the handshake.
    pub mask: IpMask,
    /// Packet encryption password. Empty disables the crypt envelope.
    pub enc_pass: Option<String>,
    /// Packets to encrypt per transport connection: -1 always, 0 never,
    /// N a remaining budget.
    pub enc_count: i64,
    /// Keepalive interval in milliseconds, floored at
    /// [`MIN_KEEPALIVE_INTERVAL_MS`].
    pub keepalive_interval_ms: u64,
    /// Digest of `pass ‖ enc_pass`; authenticates the handshake and keys
    /// the packet cipher.
    pub session_key: [u8; 32],
    pub ctrl: CtrlMode,
    pub server: HostInfo,
    /// User-Agent for the WebSocket client handshake.
    pub user_agent: String,
    /// HTTP proxy for the WebSocket client, `host:port`.
    pub proxy: Option<String>,
}

impl TunnelParam {
    pub fn new(
        pass: Option<String>,
        mode: TunnelMode,
        mask: IpMask,
        enc_pass: Option<String>,
        enc_count: i64,
        keepalive_interval_ms: u64,
        ctrl: CtrlMode,
        server: HostInfo,
    ) -> Self {
        let session_key = derive_session_key(
            pass.as_deref().unwrap_or(""),
            enc_pass.as_deref().unwrap_or(""),
        );
        Self {
            pass,
            mode,
            mask,
            enc_pass,
            enc_count,
            keepalive_interval_ms: keepalive_interval_ms.max(MIN_KEEPALIVE_INTERVAL_MS),
            session_key,
            ctrl,
            server,
            user_agent: String::new(),
            proxy: None,
        }
    }

    /// True when packets on a fresh transport connection are encrypted.
    pub fn encrypts(&self) -> bool {
        self.enc_pass.as_deref().is_some_and(|p| !p.is_empty()) && self.enc_count != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        let info = parse_endpoint("example.com:1234").unwrap();
        assert_eq!(info.name, "example.com");
        assert_eq!(info.port, 1234);
        assert_eq!(info.to_addr(), "example.com:1234");

        let info = parse_endpoint(":9000").unwrap();
        assert_eq!(info.name, "0.0.0.0");
        assert_eq!(info.port, 9000);

        assert!(parse_endpoint("no-port").is_err());
        assert!(parse_endpoint("host:not-a-port").is_err());
    }

    #[test]
    fn test_parse_forward() {
        let fwd = parse_forward(":9001,127.0.0.1:7").unwrap();
        assert_eq!(fwd.src.port, 9001);
        assert_eq!(fwd.dst.name, "127.0.0.1");
        assert_eq!(fwd.dst.port, 7);

        assert!(parse_forward(":9001").is_err());
    }

    #[test]
    fn test_ip_mask() {
        let mask = IpMask::parse(&["10.0.0.0/8".to_string()]).unwrap();
        assert!(mask.allows("10.1.2.3".parse().unwrap()));
        assert!(!mask.allows("192.168.1.1".parse().unwrap()));

        // Empty mask allows everything.
        let open = IpMask::default();
        assert!(open.allows("192.168.1.1".parse().unwrap()));

        assert!(IpMask::parse(&["not-a-cidr".to_string()]).is_err());
    }

    #[test]
    fn test_keepalive_floor() {
        let param = TunnelParam::new(
            Some("pass".into()),
            TunnelMode::Server,
            IpMask::default(),
            None,
            0,
            500,
            CtrlMode::Normal,
            HostInfo::new("", "", 9000, ""),
        );
        assert_eq!(param.keepalive_interval_ms, MIN_KEEPALIVE_INTERVAL_MS);
    }

    #[test]
    fn test_encrypts() {
        let mk = |enc_pass: Option<&str>, count: i64| {
            TunnelParam::new(
                Some("p".into()),
                TunnelMode::Server,
                IpMask::default(),
                enc_pass.map(|s| s.to_string()),
                count,
                5000,
                CtrlMode::Normal,
                HostInfo::new("", "", 9000, ""),
            )
        };
        assert!(mk(Some("secret"), -1).encrypts());
        assert!(mk(Some("secret"), 100).encrypts());
        assert!(!mk(Some("secret"), 0).encrypts());
        assert!(!mk(None, -1).encrypts());
    }

    #[test]
    fn test_mode_queries() {
        assert!(TunnelMode::Server.is_server_side());
        assert!(!TunnelMode::Client.is_server_side());
        assert!(TunnelMode::WsClient.is_websocket());
        assert!(!TunnelMode::ReverseServer.is_websocket());
        assert!(TunnelMode::Client.hosts_forwards());
        assert!(TunnelMode::ReverseServer.hosts_forwards());
        assert!(!TunnelMode::Server.hosts_forwards());
        assert!(!TunnelMode::ReverseClient.hosts_forwards());
    }
}

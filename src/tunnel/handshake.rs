//! Session handshake
//!
//! Mutual challenge/response on the shared session key, run on the raw
//! transport before packet framing starts. Each message is a 2-byte
//! big-endian length followed by JSON.
//!
//! The exchange also negotiates session identity: a client without a token
//! gets a fresh session; a client presenting a token resumes the live
//! session it names. Both ends exchange their last received packet number
//! and seed the resend cursor from it, which is what makes a reconnect
//! lossless.

use super::manager::SessionManager;
use super::session::{Session, SessionState};
use super::TunnelError;
use crate::config::{CtrlMode, TunnelMode, TunnelParam};
use crate::crypto::kdf::{auth_digest, new_challenge};
use crate::transport::{TunnelRead, TunnelWrite};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize)]
struct AuthChallenge {
    challenge: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AuthResponse {
    /// Digest over the server challenge and the session key.
    digest: String,
    /// Counter-challenge for mutual proof.
    challenge: String,
    /// Session token when resuming, absent for a new session.
    token: Option<String>,
    /// NORMAL packets this side has received on the session so far.
    read_no: i64,
    /// 0 normal, 1 benchmark.
    ctrl: u8,
    mode: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AuthResult {
    success: bool,
    message: String,
    /// Digest over the client challenge, proving the server knows the key.
    proof: String,
    session_id: i32,
    token: String,
    read_no: i64,
}

async fn send_message<W, T>(writer: &mut W, message: &T) -> Result<(), TunnelError>
where
    W: TunnelWrite + ?Sized,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    let mut buf = Vec::with_capacity(2 + body.len());
    buf.extend_from_slice(&(body.len() as u16).to_be_bytes());
    buf.extend_from_slice(&body);
    writer.write_all(&buf).await?;
    Ok(())
}

async fn recv_message<R, T>(reader: &mut R) -> Result<T, TunnelError>
where
    R: TunnelRead + ?Sized,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// What the server side negotiated.
pub enum ServerHandshake {
    /// A tunnel session, fresh or resumed.
    Session { session: Arc<Session>, is_new: bool },
    /// The peer asked for the frame echo benchmark.
    Bench,
}

impl std::fmt::Debug for ServerHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerHandshake::Session { is_new, .. } => f
                .debug_struct("Session")
                .field("is_new", is_new)
                .finish(),
            ServerHandshake::Bench => write!(f, "Bench"),
        }
    }
}

/// Server side of the handshake.
///
/// The caller has already applied the IP allow-list; this function owns the
/// credential check and session attach.
pub async fn handshake_server<R, W>(
    reader: &mut R,
    writer: &mut W,
    param: &TunnelParam,
    manager: &SessionManager,
) -> Result<ServerHandshake, TunnelError>
where
    R: TunnelRead + ?Sized,
    W: TunnelWrite + ?Sized,
{
    let challenge = new_challenge();
    send_message(writer, &AuthChallenge {
        challenge: challenge.clone(),
    })
    .await?;

    let response: AuthResponse = recv_message(reader).await?;

    let reject = |message: &str| AuthResult {
        success: false,
        message: message.to_string(),
        proof: String::new(),
        session_id: 0,
        token: String::new(),
        read_no: 0,
    };

    if response.digest != auth_digest(&challenge, &param.session_key) {
        warn!("handshake rejected: bad credential");
        send_message(writer, &reject("authentication failed")).await?;
        return Err(TunnelError::AuthenticationFailed);
    }

    let expected_mode = param.mode.peer_mode().as_str();
    if response.mode != expected_mode {
        warn!(
            "handshake rejected: peer mode '{}', want '{}'",
            response.mode, expected_mode
        );
        send_message(writer, &reject("mode mismatch")).await?;
        return Err(TunnelError::Handshake(format!(
            "mode mismatch: {}",
            response.mode
        )));
    }

    let proof = auth_digest(&response.challenge, &param.session_key);

    if response.ctrl == ctrl_byte(CtrlMode::Bench) {
        send_message(writer, &AuthResult {
            success: true,
            message: String::new(),
            proof,
            session_id: 0,
            token: String::new(),
            read_no: 0,
        })
        .await?;
        return Ok(ServerHandshake::Bench);
    }

    let (session, is_new) = match &response.token {
        Some(token) => match manager.get_session(token) {
            Some(session) => {
                info!("session {} resuming", session.id());
                session.set_state(SessionState::Reconnecting);
                (session, false)
            }
            None => {
                warn!("handshake rejected: unknown session token");
                send_message(writer, &reject("unknown session")).await?;
                return Err(TunnelError::Handshake("unknown session token".to_string()));
            }
        },
        None => (manager.new_session(true), true),
    };

    session.set_rewrite(response.read_no);

    let (session_id, token) = session.ident();
    send_message(writer, &AuthResult {
        success: true,
        message: String::new(),
        proof,
        session_id,
        token,
        read_no: session.read_no.load(std::sync::atomic::Ordering::Acquire),
    })
    .await?;

    session.set_state(SessionState::AuthResult);
    Ok(ServerHandshake::Session { session, is_new })
}

/// Client side of the handshake.
///
/// `session` carries the token when resuming; a fresh client session (empty
/// token) adopts the server-assigned identity on success.
pub async fn handshake_client<R, W>(
    reader: &mut R,
    writer: &mut W,
    param: &TunnelParam,
    session: &Arc<Session>,
) -> Result<(), TunnelError>
where
    R: TunnelRead + ?Sized,
    W: TunnelWrite + ?Sized,
{
    session.set_state(SessionState::AuthChallenge);
    let challenge: AuthChallenge = recv_message(reader).await?;

    let my_challenge = new_challenge();
    let (_, token) = session.ident();
    session.set_state(SessionState::AuthResponse);
    send_message(writer, &AuthResponse {
        digest: auth_digest(&challenge.challenge, &param.session_key),
        challenge: my_challenge.clone(),
        token: (!token.is_empty()).then_some(token),
        read_no: session.read_no.load(std::sync::atomic::Ordering::Acquire),
        ctrl: ctrl_byte(param.ctrl),
        mode: param.mode.as_str().to_string(),
    })
    .await?;

    let result: AuthResult = recv_message(reader).await?;
    if !result.success {
        session.set_state(SessionState::AuthMiss);
        return Err(TunnelError::Handshake(result.message));
    }
    if result.proof != auth_digest(&my_challenge, &param.session_key) {
        // The server failed to prove the shared key; do not talk to it.
        session.set_state(SessionState::AuthMiss);
        return Err(TunnelError::AuthenticationFailed);
    }

    if param.ctrl == CtrlMode::Normal {
        let (_, current_token) = session.ident();
        if current_token.is_empty() {
            session.update_ident(result.session_id, &result.token);
        }
        session.set_rewrite(result.read_no);
    }

    session.set_state(SessionState::AuthResult);
    Ok(())
}

fn ctrl_byte(ctrl: CtrlMode) -> u8 {
    match ctrl {
        CtrlMode::Normal => 0,
        CtrlMode::Bench => 1,
    }
}

impl TunnelMode {
    /// The mode expected on the other end of the transport.
    pub fn peer_mode(&self) -> TunnelMode {
        match self {
            TunnelMode::Server => TunnelMode::Client,
            TunnelMode::Client => TunnelMode::Server,
            TunnelMode::ReverseServer => TunnelMode::ReverseClient,
            TunnelMode::ReverseClient => TunnelMode::ReverseServer,
            TunnelMode::WsServer => TunnelMode::WsClient,
            TunnelMode::WsClient => TunnelMode::WsServer,
            TunnelMode::ReverseWsServer => TunnelMode::ReverseWsClient,
            TunnelMode::ReverseWsClient => TunnelMode::ReverseWsServer,
        }
    }
}

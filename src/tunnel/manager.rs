//! Process-wide session registry
//!
//! Tracks live sessions, the transport connection currently serving each
//! session, the pipe driving it, and transport liveness. One mutex guards
//! the four maps; no caller holds it across a suspension point. Waiters
//! that need a transport to appear or disappear poll at 500 ms.
//!
//! The manager is created at startup and passed to components as a
//! collaborator rather than read from module scope, which keeps the core
//! testable against a private registry.

use super::pipe::Pipe;
use super::session::{ConnInfo, Session};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Poll interval for registry waiters.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Default)]
struct Registry {
    token2session: HashMap<String, Arc<Session>>,
    id2conn: HashMap<i32, Arc<ConnInfo>>,
    id2pipe: HashMap<i32, Arc<Pipe>>,
    conn_alive: HashMap<u64, bool>,
}

pub struct SessionManager {
    inner: Mutex<Registry>,
    next_session_id: AtomicI32,
}

impl SessionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Registry::default()),
            next_session_id: AtomicI32::new(1),
        })
    }

    /// Create a session with a fresh id and a 72-bit random token, and
    /// register it.
    pub fn new_session(&self, is_server: bool) -> Arc<Session> {
        let id = self.next_session_id.fetch_add(1, Ordering::AcqRel);

        let mut raw = [0u8; 9];
        crate::crypto::random_bytes(&mut raw);
        let token = BASE64.encode(raw);

        let session = Session::new(id, token.clone(), is_server);
        self.inner
            .lock()
            .unwrap()
            .token2session
            .insert(token, session.clone());
        info!("session {} created", id);
        session
    }

    /// Register a session under its (possibly updated) token.
    pub fn register_session(&self, session: &Arc<Session>) {
        let (_, token) = session.ident();
        self.inner
            .lock()
            .unwrap()
            .token2session
            .insert(token, session.clone());
    }

    pub fn get_session(&self, token: &str) -> Option<Arc<Session>> {
        self.inner.lock().unwrap().token2session.get(token).cloned()
    }

    /// Bind a transport connection to its session.
    pub fn set_session_conn(&self, session: &Session, conn: &Arc<ConnInfo>) {
        let id = session.id();
        debug!("set_session_conn: session {}", id);
        let mut inner = self.inner.lock().unwrap();
        inner.id2conn.insert(id, conn.clone());
        inner.conn_alive.insert(conn.conn_id, true);
    }

    /// Unbind a dead transport connection. A newer connection already bound
    /// to the session (the peer redialed before we noticed) stays bound.
    pub fn release_session_conn(&self, session: &Session, conn: &ConnInfo) {
        let id = session.id();
        debug!("release_session_conn: session {}", id);
        let mut inner = self.inner.lock().unwrap();
        inner.conn_alive.remove(&conn.conn_id);
        if inner
            .id2conn
            .get(&id)
            .is_some_and(|bound| bound.conn_id == conn.conn_id)
        {
            inner.id2conn.remove(&id);
        }
    }

    /// Wait until a transport connection is bound to the session.
    ///
    /// This is the passive half of a reconnect: the server side parks here
    /// until the client redials and re-handshakes.
    pub async fn get_session_conn(&self, session: &Session) -> Arc<ConnInfo> {
        let id = session.id();
        debug!("get_session_conn: waiting for session {}", id);
        loop {
            if let Some(conn) = self.inner.lock().unwrap().id2conn.get(&id).cloned() {
                debug!("get_session_conn: session {} has a connection", id);
                return conn;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Park until the given transport connection is released.
    pub async fn join_until_conn_close(&self, conn: &ConnInfo) {
        debug!("join start: conn {}", conn.conn_id);
        loop {
            let alive = self
                .inner
                .lock()
                .unwrap()
                .conn_alive
                .get(&conn.conn_id)
                .copied()
                .unwrap_or(false);
            if !alive {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        debug!("join end: conn {}", conn.conn_id);
    }

    /// Park until both pipe loops of the session sit in reconnect; used to
    /// quiesce a session before external surgery.
    pub async fn wait_pause_session(&self, session: &Session) {
        debug!("wait_pause_session: session {}", session.id());
        while session.reconnect_wait_state() != 2 {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        debug!("wait_pause_session done: session {}", session.id());
    }

    /// Register the pipe for a session. Returns the existing pipe and
    /// `false` when one is already running.
    pub fn set_pipe(&self, session: &Session, pipe: Arc<Pipe>) -> (Arc<Pipe>, bool) {
        let id = session.id();
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.id2pipe.get(&id) {
            return (existing.clone(), false);
        }
        inner.id2pipe.insert(id, pipe.clone());
        (pipe, true)
    }

    pub fn get_pipe(&self, session: &Session) -> Option<Arc<Pipe>> {
        self.inner.lock().unwrap().id2pipe.get(&session.id()).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner
            .lock()
            .unwrap()
            .token2session
            .values()
            .cloned()
            .collect()
    }

    /// Human-readable registry state for the console endpoint.
    pub fn dump(&self) -> String {
        let sessions = self.sessions();
        let mut out = String::from("------------\n");
        for session in sessions {
            out.push_str(&session.dump());
            out.push_str("------------\n");
        }
        out
    }
}

//! In-process driver.
//!
//! [`MemoryServer`] mimics the parts of a PostgreSQL server the pool and the
//! listener rely on: sessions, `LISTEN` / `UNLISTEN`, `NOTIFY` delivery,
//! out-of-band notices, dropped connections and a server that stops
//! answering. Useful for tests and for
//! running the listener without a database.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::driver::{subscribe_command, Connector, DriverConnection, DriverError, Notification};
use super::notice::NoticeHandler;

struct Session {
    channels: HashSet<String>,
    sender: mpsc::UnboundedSender<Notification>,
    alive: Arc<AtomicBool>,
}

struct ServerState {
    accepting: bool,
    rejecting_listen: bool,
    stalled: bool,
    next_process_id: u32,
    connections_opened: usize,
    sessions: HashMap<u32, Session>,
    notices: Option<NoticeHandler>,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            accepting: true,
            rejecting_listen: false,
            stalled: false,
            next_process_id: 1000,
            connections_opened: 0,
            sessions: HashMap::new(),
            notices: None,
        }
    }
}

/// Shared in-memory server. Clones refer to the same server.
#[derive(Clone, Default)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A connector opening sessions on this server.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            server: self.clone(),
        }
    }

    /// Refuse (or accept again) new connections.
    pub fn set_reachable(&self, reachable: bool) {
        self.state().accepting = reachable;
    }

    /// Make `LISTEN` fail as if the role lacked permission.
    pub fn reject_listen(&self, rejecting: bool) {
        self.state().rejecting_listen = rejecting;
    }

    /// Stop (or resume) answering statements. Stalled statements never
    /// complete.
    pub fn stall_commands(&self, stalled: bool) {
        self.state().stalled = stalled;
    }

    /// `NOTIFY channel, payload` from a fresh backend. Returns the number of
    /// sessions the notification was delivered to.
    pub fn notify(&self, channel: &str, payload: &str) -> usize {
        let mut state = self.state();
        state.next_process_id += 1;
        let sender_pid = state.next_process_id;

        state
            .sessions
            .values()
            .filter(|session| session.channels.contains(channel))
            .filter(|session| {
                session
                    .sender
                    .send(Notification::new(channel, payload, sender_pid))
                    .is_ok()
            })
            .count()
    }

    /// Push an out-of-band notice through the registered handler.
    /// Returns whether it was forwarded.
    pub fn send_notice(&self, message: &str) -> bool {
        let handler = self.state().notices.clone();
        handler.map(|h| h.handle(message)).unwrap_or(false)
    }

    /// Kill every open session, as a server restart would.
    pub fn terminate_sessions(&self) {
        for (_, session) in self.state().sessions.drain() {
            session.alive.store(false, Ordering::Release);
        }
    }

    pub fn open_sessions(&self) -> usize {
        self.state().sessions.len()
    }

    pub fn connections_opened(&self) -> usize {
        self.state().connections_opened
    }

    /// Number of sessions listening on `channel`.
    pub fn listeners(&self, channel: &str) -> usize {
        self.state()
            .sessions
            .values()
            .filter(|session| session.channels.contains(channel))
            .count()
    }

    pub fn has_notice_handler(&self) -> bool {
        self.state().notices.is_some()
    }
}

/// Connector for a [`MemoryServer`].
#[derive(Clone)]
pub struct MemoryConnector {
    server: MemoryServer,
}

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    fn bind_notices(&self, handler: NoticeHandler) {
        self.server.state().notices = Some(handler);
    }

    async fn connect(&self) -> Result<MemoryConnection, DriverError> {
        let mut state = self.server.state();
        if !state.accepting {
            return Err(DriverError::Unreachable(
                "memory server is not accepting connections".to_string(),
            ));
        }

        state.next_process_id += 1;
        state.connections_opened += 1;
        let process_id = state.next_process_id;

        let (sender, receiver) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        state.sessions.insert(
            process_id,
            Session {
                channels: HashSet::new(),
                sender,
                alive: alive.clone(),
            },
        );

        Ok(MemoryConnection {
            process_id,
            server: self.server.clone(),
            receiver,
            alive,
        })
    }
}

/// One session on a [`MemoryServer`].
pub struct MemoryConnection {
    process_id: u32,
    server: MemoryServer,
    receiver: mpsc::UnboundedReceiver<Notification>,
    alive: Arc<AtomicBool>,
}

impl MemoryConnection {
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    async fn stall_if_unresponsive(&self) {
        let stalled = self.server.state().stalled;
        if stalled {
            std::future::pending::<()>().await;
        }
    }

    /// Run a statement the way the server would.
    fn execute(&self, sql: &str) -> Result<(), DriverError> {
        let sql = sql.trim();
        let (command, rest) = sql.split_once(char::is_whitespace).unwrap_or((sql, ""));

        match command.to_ascii_uppercase().as_str() {
            "LISTEN" => {
                let channel = parse_identifier(rest).ok_or_else(|| {
                    DriverError::Command(format!("syntax error in \"{}\"", sql))
                })?;
                if self.server.state().rejecting_listen {
                    return Err(DriverError::Command(format!(
                        "permission denied to listen on \"{}\"",
                        channel
                    )));
                }
                self.with_session(|session| {
                    session.channels.insert(channel);
                })
            }
            "UNLISTEN" => {
                let target = rest.trim().trim_end_matches(';');
                if target == "*" {
                    return self.with_session(|session| session.channels.clear());
                }
                let channel = parse_identifier(target).ok_or_else(|| {
                    DriverError::Command(format!("syntax error in \"{}\"", sql))
                })?;
                self.with_session(|session| {
                    session.channels.remove(&channel);
                })
            }
            _ => Err(DriverError::Command(format!("unsupported statement \"{}\"", sql))),
        }
    }

    fn with_session<T>(&self, f: impl FnOnce(&mut Session) -> T) -> Result<T, DriverError> {
        self.server
            .state()
            .sessions
            .get_mut(&self.process_id)
            .map(f)
            .ok_or(DriverError::ConnectionClosed)
    }
}

/// Parse the identifier of a `LISTEN` statement the way the server does:
/// quoted identifiers keep their case and unescape `""`, bare ones fold to
/// lower case.
fn parse_identifier(raw: &str) -> Option<String> {
    let raw = raw.trim().trim_end_matches(';');
    if let Some(quoted) = raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        if quoted.is_empty() || quoted.replace("\"\"", "").contains('"') {
            return None;
        }
        return Some(quoted.replace("\"\"", "\""));
    }
    if raw.is_empty() || !raw.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }
    Some(raw.to_lowercase())
}

#[async_trait]
impl DriverConnection for MemoryConnection {
    async fn listen(&mut self, channel: &str) -> Result<(), DriverError> {
        self.stall_if_unresponsive().await;
        self.execute(&subscribe_command(channel))
    }

    async fn wait_for_notification(&mut self) -> Result<Notification, DriverError> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(DriverError::ConnectionClosed);
        }
        self.receiver.recv().await.ok_or(DriverError::ConnectionClosed)
    }

    async fn reset(&mut self) -> Result<(), DriverError> {
        self.stall_if_unresponsive().await;
        self.execute("UNLISTEN *")?;
        while self.receiver.try_recv().is_ok() {}
        Ok(())
    }

    fn is_broken(&self) -> bool {
        !self.alive.load(Ordering::Acquire)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.server.state().sessions.remove(&self.process_id);
    }
}

//! Driver abstraction consumed by the pool.
//!
//! The pool never talks to a database directly. It asks a [`Connector`] for
//! physical connections and hands them out as [`DriverConnection`]s, so the
//! PostgreSQL driver and the in-memory driver are interchangeable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use super::notice::NoticeHandler;

/// Errors reported by a driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// PostgreSQL driver error
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// The server closed the connection
    #[error("Connection closed by server")]
    ConnectionClosed,

    /// The target did not accept a connection
    #[error("Target unreachable: {0}")]
    Unreachable(String),

    /// The server rejected a command
    #[error("Command failed: {0}")]
    Command(String),

    /// The server did not answer in time
    #[error("Operation timed out")]
    Timeout,
}

/// Quote `name` as an SQL identifier: wrap in double quotes, double any
/// embedded quote.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `LISTEN` statement for `channel`.
pub fn subscribe_command(channel: &str) -> String {
    format!("LISTEN {}", quote_identifier(channel))
}

/// A notification received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    /// Channel the notification was sent on
    pub channel: String,

    /// Payload, empty when the sender passed none
    pub payload: String,

    /// Backend process id of the sender
    pub process_id: u32,

    /// When this process received the notification
    pub received_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>, process_id: u32) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
            process_id,
            received_at: Utc::now(),
        }
    }
}

/// Factory for physical connections to one database target.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: DriverConnection;

    /// Register the notice handler. Called exactly once, during pool init,
    /// before the first connection is opened.
    fn bind_notices(&self, handler: NoticeHandler);

    /// Open a new physical connection.
    async fn connect(&self) -> Result<Self::Connection, DriverError>;

    /// Release driver-level resources once the pool has shut down.
    async fn close(&self) {}
}

/// A single physical connection.
///
/// Implementations must keep `wait_for_notification` cancel-safe: the
/// listener drops the future when its deadline fires. `listen` and `reset`
/// may be dropped mid-flight too, after which the pool discards the
/// connection.
#[async_trait]
pub trait DriverConnection: Send + 'static {
    /// Subscribe the session to `channel`. The name is matched literally,
    /// case and quotes included.
    async fn listen(&mut self, channel: &str) -> Result<(), DriverError>;

    /// Block until a notification arrives on any subscribed channel.
    async fn wait_for_notification(&mut self) -> Result<Notification, DriverError>;

    /// Drop all subscriptions and any notifications already buffered.
    async fn reset(&mut self) -> Result<(), DriverError>;

    /// Whether the transport is known to be unusable.
    fn is_broken(&self) -> bool;
}

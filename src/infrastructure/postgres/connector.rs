//! PostgreSQL driver built on sqlx.
//!
//! Each pooled connection is a [`PgListener`] holding one socket from an
//! internal sqlx pool sized to the configured limit. Subscriptions go through
//! the listener's own `listen` / `unlisten_all`, which quote the channel and
//! keep its reconnect bookkeeping in step with the session.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};

use crate::config::DatabaseConfig;
use crate::pool::{Connector, DriverConnection, DriverError, NoticeHandler, Notification};

/// How long opening a socket may take before the target counts as unreachable.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Handler for notices sqlx reports through `tracing`. sqlx offers no
/// per-connection notice hook, so the last pool to bind owns the route.
static NOTICE_HANDLER: RwLock<Option<NoticeHandler>> = RwLock::new(None);

/// Route a server notice to the bound handler. Returns whether it was
/// forwarded.
pub fn route_notice(message: &str) -> bool {
    let handler = NOTICE_HANDLER
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    handler.map(|h| h.handle(message)).unwrap_or(false)
}

fn classify_connect_error(err: sqlx::Error) -> DriverError {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut => {
            DriverError::Unreachable(err.to_string())
        }
        other => DriverError::Postgres(other),
    }
}

fn is_transport_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::Protocol(_) | sqlx::Error::PoolClosed
    )
}

/// Opens [`PgChannelConnection`]s against one database.
pub struct PgConnector {
    pool: PgPool,
}

impl PgConnector {
    /// Build the connector. Sockets are opened lazily, on `connect`.
    /// Must be called from within a Tokio runtime.
    pub fn new(config: &DatabaseConfig) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(config.limit)
            .min_connections(0)
            .acquire_timeout(CONNECT_TIMEOUT)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_lazy_with(config.connect_options());

        Self { pool }
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Connection = PgChannelConnection;

    fn bind_notices(&self, handler: NoticeHandler) {
        *NOTICE_HANDLER.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    async fn connect(&self) -> Result<PgChannelConnection, DriverError> {
        let listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(classify_connect_error)?;

        Ok(PgChannelConnection {
            listener,
            broken: false,
        })
    }

    /// Waits for connections still leased to be released.
    async fn close(&self) {
        self.pool.close().await;
    }
}

/// One pooled PostgreSQL session.
pub struct PgChannelConnection {
    listener: PgListener,
    broken: bool,
}

impl PgChannelConnection {
    fn fail(&mut self, err: sqlx::Error) -> DriverError {
        if is_transport_error(&err) {
            self.broken = true;
        }
        DriverError::Postgres(err)
    }
}

#[async_trait]
impl DriverConnection for PgChannelConnection {
    async fn listen(&mut self, channel: &str) -> Result<(), DriverError> {
        let channel = channel.to_owned();
        match self.listener.listen(&channel).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn wait_for_notification(&mut self) -> Result<Notification, DriverError> {
        match self.listener.try_recv().await {
            Ok(Some(n)) => Ok(Notification::new(n.channel(), n.payload(), n.process_id())),
            Ok(None) => {
                // sqlx reports a lost connection as `None`
                self.broken = true;
                Err(DriverError::ConnectionClosed)
            }
            Err(e) => {
                self.broken = true;
                Err(DriverError::Postgres(e))
            }
        }
    }

    async fn reset(&mut self) -> Result<(), DriverError> {
        if let Err(e) = self.listener.unlisten_all().await {
            return Err(self.fail(e));
        }
        while self.listener.next_buffered().is_some() {}
        Ok(())
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}

//! Single-shot, timeout-bounded wait for a channel notification.
//!
//! Each [`ChannelListener::listen`] call borrows one pooled connection,
//! subscribes to the configured channel, waits for at most one notification
//! and returns the connection before handing back the outcome:
//!
//! ```text
//! START -> CONNECTED -> SUBSCRIBED -> { NOTIFIED | TIMED_OUT | FAILED } -> RELEASED
//! ```

use std::time::Duration;

use thiserror::Error;

use crate::config::DatabaseConfig;
use crate::context::{Context, ContextError};
use crate::metrics::ListenMetrics;
use crate::pool::{
    AcquireError, ConnectionPool, Connector, DriverConnection, DriverError, Notification,
    PooledConnection,
};

pub use crate::pool::{quote_identifier, subscribe_command};

/// Terminal outcome of a listen cycle that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenOutcome {
    /// A notification arrived before the deadline
    Notified(Notification),
    /// Nothing arrived within the timeout
    TimedOut,
}

impl ListenOutcome {
    pub fn notification(&self) -> Option<&Notification> {
        match self {
            ListenOutcome::Notified(n) => Some(n),
            ListenOutcome::TimedOut => None,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, ListenOutcome::TimedOut)
    }
}

/// A listen cycle failed.
#[derive(Debug, Error)]
pub enum ListenError {
    #[error("Failed to acquire connection: {0}")]
    Acquire(#[from] AcquireError),

    #[error("Failed to subscribe to channel {channel}: {source}")]
    Subscribe {
        channel: String,
        #[source]
        source: DriverError,
    },

    #[error("Wait for notification failed: {0}")]
    Wait(#[source] DriverError),

    #[error("Listen cancelled")]
    Cancelled,
}

impl ListenError {
    fn label(&self) -> &'static str {
        match self {
            ListenError::Acquire(_) => "acquire_error",
            ListenError::Subscribe { .. } => "subscribe_error",
            ListenError::Wait(_) => "wait_error",
            ListenError::Cancelled => "cancelled",
        }
    }
}

/// Upper bound on the session reset that follows every wait.
const MAX_RESET_TIME: Duration = Duration::from_secs(5);

/// Waits for notifications on one channel using connections from `pool`.
pub struct ChannelListener<C: Connector> {
    pool: ConnectionPool<C>,
    channel: String,
    timeout: Duration,
}

impl<C: Connector> ChannelListener<C> {
    pub fn new(pool: ConnectionPool<C>, channel: impl Into<String>, timeout: Duration) -> Self {
        Self {
            pool,
            channel: channel.into(),
            timeout,
        }
    }

    /// Listener for the channel and timeout in `config`.
    pub fn from_config(pool: ConnectionPool<C>, config: &DatabaseConfig) -> Self {
        Self::new(pool, config.channel.clone(), config.timeout_duration())
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one listen cycle. Subscribing and waiting are bounded by the
    /// configured timeout and by `ctx`; the borrowed connection is back in
    /// the pool when this returns. If the returned future is dropped early,
    /// the still-subscribed connection is closed rather than reused.
    #[tracing::instrument(name = "listen", skip_all, fields(channel = %self.channel))]
    pub async fn listen(&self, ctx: &Context) -> Result<ListenOutcome, ListenError> {
        let result = self.run_cycle(ctx).await;

        match &result {
            Ok(ListenOutcome::Notified(_)) => ListenMetrics::record_outcome("notified"),
            Ok(ListenOutcome::TimedOut) => ListenMetrics::record_outcome("timed_out"),
            Err(e) => {
                ListenMetrics::record_outcome(e.label());
                tracing::warn!(error = %e, "Listen cycle failed");
            }
        }

        result
    }

    async fn run_cycle(&self, ctx: &Context) -> Result<ListenOutcome, ListenError> {
        let mut conn = self.pool.acquire(ctx).await?;
        conn.mark_dirty();

        let wait_ctx = ctx.with_timeout(self.timeout);
        let result = self.subscribe_and_wait(&mut conn, &wait_ctx).await;

        self.finish(conn, ctx).await;
        result
    }

    /// Reset the session and hand the connection back. A connection that is
    /// broken, fails its reset, or does not finish it in time is closed by
    /// the pool instead.
    async fn finish(&self, mut conn: PooledConnection<C>, ctx: &Context) {
        if !conn.is_broken() {
            let reset_ctx =
                Context::with_token(ctx.token().clone()).with_timeout(self.reset_timeout());

            tokio::select! {
                biased;
                reset = conn.reset_session() => {
                    if let Err(e) = reset {
                        tracing::debug!(error = %e, "Failed to reset connection, discarding it");
                    }
                }
                done = reset_ctx.done() => {
                    tracing::debug!(reason = %done, "Connection reset interrupted, discarding it");
                }
            }
        }

        self.pool.release(conn);
    }

    fn reset_timeout(&self) -> Duration {
        self.timeout.min(MAX_RESET_TIME)
    }

    async fn subscribe_and_wait(
        &self,
        conn: &mut PooledConnection<C>,
        wait_ctx: &Context,
    ) -> Result<ListenOutcome, ListenError> {
        tokio::select! {
            biased;
            done = wait_ctx.done() => {
                return Err(match done {
                    ContextError::Cancelled => ListenError::Cancelled,
                    ContextError::DeadlineExceeded => ListenError::Subscribe {
                        channel: self.channel.clone(),
                        source: DriverError::Timeout,
                    },
                });
            }
            subscribed = conn.listen(&self.channel) => {
                subscribed.map_err(|source| ListenError::Subscribe {
                    channel: self.channel.clone(),
                    source,
                })?;
            }
        }

        tracing::info!(timeout = ?self.timeout, "Waiting for notification");

        tokio::select! {
            biased;
            done = wait_ctx.done() => match done {
                ContextError::DeadlineExceeded => {
                    tracing::info!("No notification before timeout");
                    Ok(ListenOutcome::TimedOut)
                }
                ContextError::Cancelled => Err(ListenError::Cancelled),
            },
            received = conn.wait_for_notification() => match received {
                Ok(notification) => {
                    tracing::info!(
                        notify_channel = %notification.channel,
                        payload = %notification.payload,
                        process_id = notification.process_id,
                        "Notification received"
                    );
                    Ok(ListenOutcome::Notified(notification))
                }
                Err(e) => Err(ListenError::Wait(e)),
            },
        }
    }
}

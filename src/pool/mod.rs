//! Bounded connection pool for one database target.
//!
//! Capacity is a semaphore with one permit per connection slot; idle
//! connections sit on a mutex-guarded free list. A caller owns a
//! [`PooledConnection`] exclusively until it is released, either explicitly
//! or by dropping the guard, so release happens exactly once on every exit
//! path. A guard whose session state was changed and not reset is closed
//! instead of returned, so an abandoned lease never leaks a subscription.

mod driver;
mod error;
pub mod memory;
mod notice;

pub use driver::{
    quote_identifier, subscribe_command, Connector, DriverConnection, DriverError, Notification,
};
pub use error::{AcquireError, ConnectError};
pub use memory::{MemoryConnection, MemoryConnector, MemoryServer};
pub use notice::{should_forward, NoticeHandler};

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::context::Context;
use crate::metrics::{PoolMetrics, POOL_CONNECTIONS, POOL_IN_USE};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Open physical connections (idle + in use)
    pub size: usize,
    /// Connections on the free list
    pub idle: usize,
    /// Connections currently leased
    pub in_use: usize,
    /// Configured connection limit
    pub max_size: usize,
}

struct IdleConnection<T> {
    id: Uuid,
    conn: T,
}

struct PoolInner<C: Connector> {
    connector: C,
    idle: Mutex<Vec<IdleConnection<C::Connection>>>,
    semaphore: Arc<Semaphore>,
    size: AtomicUsize,
    in_use: AtomicUsize,
    max_size: usize,
    closed: AtomicBool,
    /// Masked connect target for logging
    target: String,
}

impl<C: Connector> PoolInner<C> {
    fn idle(&self) -> MutexGuard<'_, Vec<IdleConnection<C::Connection>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pop the most recently returned healthy connection, closing broken
    /// ones on the way.
    fn pop_idle(&self) -> Option<IdleConnection<C::Connection>> {
        let mut idle = self.idle();
        while let Some(entry) = idle.pop() {
            if !entry.conn.is_broken() {
                return Some(entry);
            }
            self.forget_connection(entry.id);
        }
        None
    }

    fn forget_connection(&self, id: Uuid) {
        self.size.fetch_sub(1, Ordering::AcqRel);
        POOL_CONNECTIONS.dec();
        tracing::debug!(connection_id = %id, "Connection closed");
    }

    fn put_back(&self, id: Uuid, conn: C::Connection, reusable: bool) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        POOL_IN_USE.dec();

        if !reusable || self.closed.load(Ordering::Acquire) || conn.is_broken() {
            drop(conn);
            self.forget_connection(id);
            return;
        }

        self.idle().push(IdleConnection { id, conn });
        tracing::debug!(connection_id = %id, "Connection released");
    }
}

/// Shared handle to a connection pool. Cloning is cheap.
pub struct ConnectionPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Validate `config`, register the notice handler and open the first
    /// connection so an unreachable target fails here rather than on first
    /// use.
    pub async fn init(config: &DatabaseConfig, connector: C) -> Result<Self, ConnectError> {
        config.validate()?;

        let target = config.masked_url();
        connector.bind_notices(NoticeHandler::new(target.clone()));

        let conn = match connector.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!(database = %target, error = %e, "Failed to establish connection pool");
                connector.close().await;
                return Err(ConnectError::Unreachable(e));
            }
        };

        let max_size = config.limit as usize;
        let first = IdleConnection {
            id: Uuid::new_v4(),
            conn,
        };
        POOL_CONNECTIONS.inc();

        tracing::info!(database = %target, max_size, "Connection pool created");

        Ok(Self {
            inner: Arc::new(PoolInner {
                connector,
                idle: Mutex::new(vec![first]),
                semaphore: Arc::new(Semaphore::new(max_size)),
                size: AtomicUsize::new(1),
                in_use: AtomicUsize::new(0),
                max_size,
                closed: AtomicBool::new(false),
                target,
            }),
        })
    }

    /// Lease a connection, waiting for a free slot until `ctx` is done.
    pub async fn acquire(&self, ctx: &Context) -> Result<PooledConnection<C>, AcquireError> {
        let result = self.acquire_inner(ctx).await;
        PoolMetrics::record_acquire(&result);
        result
    }

    async fn acquire_inner(&self, ctx: &Context) -> Result<PooledConnection<C>, AcquireError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(AcquireError::PoolClosed);
        }
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }

        let permit = tokio::select! {
            biased;
            err = ctx.done() => return Err(err.into()),
            permit = self.inner.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| AcquireError::PoolClosed)?
            }
        };

        if let Some(entry) = self.inner.pop_idle() {
            return Ok(self.lease(entry, permit));
        }

        let conn = tokio::select! {
            biased;
            err = ctx.done() => return Err(err.into()),
            conn = self.inner.connector.connect() => conn?,
        };

        self.inner.size.fetch_add(1, Ordering::AcqRel);
        POOL_CONNECTIONS.inc();

        let entry = IdleConnection {
            id: Uuid::new_v4(),
            conn,
        };
        tracing::debug!(connection_id = %entry.id, "Opened new connection");

        Ok(self.lease(entry, permit))
    }

    fn lease(
        &self,
        entry: IdleConnection<C::Connection>,
        permit: OwnedSemaphorePermit,
    ) -> PooledConnection<C> {
        self.inner.in_use.fetch_add(1, Ordering::AcqRel);
        POOL_IN_USE.inc();
        tracing::debug!(connection_id = %entry.id, "Connection acquired");

        PooledConnection {
            id: entry.id,
            conn: Some(entry.conn),
            needs_reset: false,
            pool: self.inner.clone(),
            _permit: permit,
        }
    }

    /// Return a connection to the pool. Equivalent to dropping it.
    pub fn release(&self, conn: PooledConnection<C>) {
        drop(conn);
    }

    /// Close idle connections and refuse further acquires. Connections still
    /// leased are closed when they come back.
    pub async fn shutdown(&self) {
        let already_closed = self.inner.closed.swap(true, Ordering::AcqRel);
        self.inner.semaphore.close();

        let drained: Vec<_> = std::mem::take(&mut *self.inner.idle());
        for entry in drained {
            drop(entry.conn);
            self.inner.forget_connection(entry.id);
        }

        if already_closed {
            tracing::debug!(database = %self.inner.target, "Connection pool already closed");
            return;
        }

        self.inner.connector.close().await;
        tracing::info!(database = %self.inner.target, "Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.inner.size.load(Ordering::Acquire),
            idle: self.inner.idle().len(),
            in_use: self.inner.in_use.load(Ordering::Acquire),
            max_size: self.inner.max_size,
        }
    }

    /// Masked connect target.
    pub fn target(&self) -> &str {
        &self.inner.target
    }
}

/// A leased connection. Returned to the pool when dropped.
pub struct PooledConnection<C: Connector> {
    id: Uuid,
    conn: Option<C::Connection>,
    /// Session state changed since the lease began
    needs_reset: bool,
    pool: Arc<PoolInner<C>>,
    // Declared last: the slot frees only after the connection is back on the free list.
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("needs_reset", &self.needs_reset)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> PooledConnection<C> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Record that the session is about to change state. Until
    /// [`reset_session`](Self::reset_session) succeeds, dropping the guard
    /// closes the connection instead of returning it.
    pub fn mark_dirty(&mut self) {
        self.needs_reset = true;
    }

    pub fn needs_reset(&self) -> bool {
        self.needs_reset
    }

    /// Reset the session through the driver and make the connection
    /// reusable again.
    pub async fn reset_session(&mut self) -> Result<(), DriverError> {
        let conn = self.conn.as_mut().ok_or(DriverError::ConnectionClosed)?;
        conn.reset().await?;
        self.needs_reset = false;
        Ok(())
    }

    /// Return the connection to the pool, or close it if its session still
    /// needs a reset.
    pub fn release(self) {
        drop(self);
    }

    /// Close the connection instead of returning it, e.g. when its session
    /// state could not be reset.
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(self.id, conn, false);
        }
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until release")
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until release")
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(self.id, conn, !self.needs_reset);
        }
    }
}

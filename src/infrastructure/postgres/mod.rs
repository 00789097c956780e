//! PostgreSQL driver.
//!
//! Provides the sqlx-backed [`Connector`](crate::pool::Connector) and a
//! shortcut for building a pool from configuration.

mod connector;

pub use connector::{route_notice, PgChannelConnection, PgConnector};

use crate::config::DatabaseConfig;
use crate::pool::{ConnectError, ConnectionPool};

/// Pool backed by PostgreSQL.
pub type PgConnectionPool = ConnectionPool<PgConnector>;

/// Validate `config` and establish a PostgreSQL pool.
pub async fn connect(config: &DatabaseConfig) -> Result<PgConnectionPool, ConnectError> {
    config.validate()?;
    ConnectionPool::init(config, PgConnector::new(config)).await
}

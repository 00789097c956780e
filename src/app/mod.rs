//! One-shot run: establish the pool, wait once, shut down.

use crate::config::DatabaseConfig;
use crate::context::Context;
use crate::error::Result;
use crate::listener::{ChannelListener, ListenOutcome};
use crate::pool::{ConnectionPool, Connector};
use crate::postgres::PgConnector;

/// Run a single listen cycle against PostgreSQL.
pub async fn run_once(config: &DatabaseConfig, ctx: &Context) -> Result<ListenOutcome> {
    config.validate()?;
    listen_once(config, PgConnector::new(config), ctx).await
}

/// Run a single listen cycle with any driver. The pool is shut down before
/// returning, whatever the outcome.
pub async fn listen_once<C: Connector>(
    config: &DatabaseConfig,
    connector: C,
    ctx: &Context,
) -> Result<ListenOutcome> {
    let pool = ConnectionPool::init(config, connector).await?;
    let listener = ChannelListener::from_config(pool.clone(), config);

    let outcome = listener.listen(ctx).await;
    pool.shutdown().await;

    Ok(outcome?)
}

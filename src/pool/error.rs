use thiserror::Error;

use crate::context::ContextError;

use super::driver::DriverError;

/// Pool initialization failed. The pool cannot be used.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Invalid database configuration: {0}")]
    InvalidConfig(String),

    #[error("Database unreachable: {0}")]
    Unreachable(#[source] DriverError),
}

/// No connection could be handed out.
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("Acquire cancelled")]
    Cancelled,

    #[error("Acquire deadline exceeded")]
    DeadlineExceeded,

    #[error("Pool is shut down")]
    PoolClosed,

    #[error("Failed to open connection: {0}")]
    Connect(#[from] DriverError),
}

impl From<ContextError> for AcquireError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Cancelled => AcquireError::Cancelled,
            ContextError::DeadlineExceeded => AcquireError::DeadlineExceeded,
        }
    }
}

use thiserror::Error;

use crate::listener::ListenError;
use crate::pool::ConnectError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Connection error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Listen error: {0}")]
    Listen(#[from] ListenError),
}

impl AppError {
    /// Startup failures the process cannot recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::Config(_) | AppError::Connect(_))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::AcquireError;

    #[test]
    fn test_fatal_classification() {
        let err = AppError::from(ConnectError::InvalidConfig("limit must be at least 1".to_string()));
        assert!(err.is_fatal());
        assert!(format!("{}", err).contains("limit must be at least 1"));

        let err = AppError::from(ListenError::Acquire(AcquireError::Cancelled));
        assert!(!err.is_fatal());

        let err = AppError::from(config::ConfigError::Message("missing field".to_string()));
        assert!(err.is_fatal());
    }
}

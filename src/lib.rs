// Infrastructure layer (shared components)
pub mod infrastructure;

pub use infrastructure::config;
pub use infrastructure::error;
pub use infrastructure::metrics;
pub use infrastructure::postgres;

// Domain layer
pub mod context;
pub mod listener;
pub mod pool;

// Application layer
pub mod app;

// Supporting modules
pub mod telemetry;

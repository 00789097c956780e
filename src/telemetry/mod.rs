//! Tracing setup.
//!
//! Installs a console `fmt` layer filtered by `RUST_LOG` (default `info`) and
//! the [`NoticeLayer`], which picks server notices out of sqlx's own events
//! and hands them to the pool's notice handler.
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `RUST_LOG` | Console log filter | `info` |

use std::fmt;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Target sqlx uses for `NoticeResponse` messages.
pub const SQLX_NOTICE_TARGET: &str = "sqlx::postgres::notice";

/// Console filter used when `RUST_LOG` is unset. The raw sqlx notice events
/// are muted; the notice handler re-emits the ones worth reading.
const DEFAULT_FILTER: &str = "info,sqlx::postgres::notice=off";

/// Install the global subscriber.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(notice_layer())
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();
}

/// Notice layer routing to the PostgreSQL driver's bound handler.
pub fn notice_layer() -> NoticeLayer {
    NoticeLayer::new(crate::postgres::route_notice)
}

/// Layer forwarding the message of every sqlx notice event to a sink.
pub struct NoticeLayer {
    sink: Box<dyn Fn(&str) -> bool + Send + Sync>,
}

impl NoticeLayer {
    pub fn new(sink: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self {
            sink: Box::new(sink),
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" && self.message.is_none() {
            self.message = Some(format!("{:?}", value));
        }
    }
}

impl<S: Subscriber> Layer<S> for NoticeLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if event.metadata().target() != SQLX_NOTICE_TARGET {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        (self.sink)(visitor.message.as_deref().unwrap_or(""));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tracing_subscriber::layer::SubscriberExt;

    use super::*;

    #[test]
    fn test_notice_layer_picks_sqlx_notices_only() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            move |message: &str| {
                seen.lock().unwrap().push(message.to_string());
                true
            }
        };

        let subscriber = tracing_subscriber::registry().with(NoticeLayer::new(sink));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "sqlx::postgres::notice", message = "relation exists, skipping");
            tracing::warn!(target: "sqlx::postgres::notice", message = "");
            tracing::info!(target: "pg_channel_listener", "unrelated event");
        });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), ["relation exists, skipping", ""]);
    }
}

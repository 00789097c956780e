//! Listener and pool integration tests
//!
//! These tests run full listen cycles against the in-memory driver, so no
//! PostgreSQL server is needed.

use std::time::{Duration, Instant};

use pg_channel_listener::config::DatabaseConfig;
use pg_channel_listener::context::Context;
use pg_channel_listener::listener::{ChannelListener, ListenError, ListenOutcome};
use pg_channel_listener::pool::{
    AcquireError, ConnectionPool, DriverError, MemoryConnector, MemoryServer,
};

/// Create a pool on a fresh in-memory server
async fn create_test_environment(
    channel: &str,
    timeout: Duration,
    limit: u32,
) -> (MemoryServer, ConnectionPool<MemoryConnector>, ChannelListener<MemoryConnector>) {
    let server = MemoryServer::new();
    let config = DatabaseConfig {
        channel: channel.to_string(),
        limit,
        ..DatabaseConfig::default()
    };
    let pool = ConnectionPool::init(&config, server.connector())
        .await
        .expect("pool init");
    let listener = ChannelListener::new(pool.clone(), channel, timeout);
    (server, pool, listener)
}

/// Send `payload` on `channel` once a session is listening on it, after `delay`
fn notify_after(server: &MemoryServer, channel: &str, payload: &str, delay: Duration) {
    let server = server.clone();
    let channel = channel.to_string();
    let payload = payload.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        while server.listeners(&channel) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        server.notify(&channel, &payload);
    });
}

#[tokio::test]
async fn test_notification_within_timeout() {
    let (server, pool, listener) =
        create_test_environment("events", Duration::from_secs(2), 2).await;
    let before = pool.stats();

    notify_after(&server, "events", "ready", Duration::from_millis(500));

    let started = Instant::now();
    let outcome = listener.listen(&Context::background()).await.unwrap();
    let elapsed = started.elapsed();

    let notification = outcome.notification().expect("notified");
    assert_eq!(notification.channel, "events");
    assert_eq!(notification.payload, "ready");
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_millis(1500));

    assert_eq!(pool.stats(), before);
    assert_eq!(server.listeners("events"), 0);
}

#[tokio::test]
async fn test_timeout_without_notification() {
    let timeout = Duration::from_millis(400);
    let (server, pool, listener) = create_test_environment("events", timeout, 2).await;
    let before = pool.stats();

    let started = Instant::now();
    let outcome = listener.listen(&Context::background()).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(outcome, ListenOutcome::TimedOut);
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_secs(1));

    assert_eq!(pool.stats(), before);
    assert_eq!(server.listeners("events"), 0);
}

#[tokio::test]
async fn test_notification_on_other_channel_is_ignored() {
    let (server, _pool, listener) =
        create_test_environment("events", Duration::from_millis(300), 1).await;

    let other = server.clone();
    tokio::spawn(async move {
        while other.listeners("events") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        other.notify("other", "not for us");
    });

    let outcome = listener.listen(&Context::background()).await.unwrap();
    assert!(outcome.is_timed_out());
}

#[tokio::test]
async fn test_channel_name_is_quoted_literally() {
    let channel = "Mixed\"Case; DROP";
    let (server, _pool, listener) =
        create_test_environment(channel, Duration::from_secs(2), 1).await;

    notify_after(&server, channel, "exact", Duration::ZERO);

    let outcome = listener.listen(&Context::background()).await.unwrap();
    let notification = outcome.notification().unwrap();
    assert_eq!(notification.channel, channel);
    assert_eq!(notification.payload, "exact");
}

#[tokio::test]
async fn test_stale_notification_not_delivered_on_reuse() {
    let (server, pool, listener) =
        create_test_environment("events", Duration::from_millis(300), 1).await;

    notify_after(&server, "events", "first", Duration::ZERO);
    let outcome = listener.listen(&Context::background()).await.unwrap();
    assert_eq!(outcome.notification().unwrap().payload, "first");

    // The session is no longer subscribed, so this is never buffered.
    assert_eq!(server.notify("events", "late"), 0);

    let outcome = listener.listen(&Context::background()).await.unwrap();
    assert!(outcome.is_timed_out());
    assert_eq!(pool.stats().size, 1);
}

#[tokio::test]
async fn test_cancellation_interrupts_wait() {
    let (_server, pool, listener) =
        create_test_environment("events", Duration::from_secs(30), 1).await;
    let before = pool.stats();

    let ctx = Context::background();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let err = listener.listen(&ctx).await.unwrap_err();
    assert!(matches!(err, ListenError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(pool.stats(), before);
}

#[tokio::test]
async fn test_caller_deadline_bounds_the_wait() {
    let (_server, _pool, listener) =
        create_test_environment("events", Duration::from_secs(30), 1).await;

    let ctx = Context::background().with_timeout(Duration::from_millis(200));
    let started = Instant::now();
    let outcome = listener.listen(&ctx).await.unwrap();

    assert!(outcome.is_timed_out());
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_cancelled_context_fails_before_subscribing() {
    let (server, pool, listener) =
        create_test_environment("events", Duration::from_secs(30), 1).await;

    let ctx = Context::background();
    ctx.cancel();

    let err = listener.listen(&ctx).await.unwrap_err();
    assert!(matches!(err, ListenError::Acquire(AcquireError::Cancelled)));
    assert_eq!(server.listeners("events"), 0);
    assert_eq!(pool.stats().in_use, 0);
}

#[tokio::test]
async fn test_subscribe_failure_releases_connection() {
    let (server, pool, listener) =
        create_test_environment("events", Duration::from_secs(2), 1).await;
    let before = pool.stats();
    server.reject_listen(true);

    let err = listener.listen(&Context::background()).await.unwrap_err();
    match err {
        ListenError::Subscribe { channel, source } => {
            assert_eq!(channel, "events");
            assert!(matches!(source, DriverError::Command(_)));
        }
        other => panic!("expected subscribe error, got {:?}", other),
    }

    // Still reusable
    assert_eq!(pool.stats(), before);
    server.reject_listen(false);
    notify_after(&server, "events", "after", Duration::ZERO);
    let outcome = listener.listen(&Context::background()).await.unwrap();
    assert_eq!(outcome.notification().unwrap().payload, "after");
}

#[tokio::test]
async fn test_dropped_connection_fails_wait_and_is_discarded() {
    let (server, pool, listener) =
        create_test_environment("events", Duration::from_secs(5), 2).await;

    let killer = server.clone();
    tokio::spawn(async move {
        while killer.listeners("events") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        killer.terminate_sessions();
    });

    let started = Instant::now();
    let err = listener.listen(&Context::background()).await.unwrap_err();
    assert!(matches!(err, ListenError::Wait(DriverError::ConnectionClosed)));
    assert!(started.elapsed() < Duration::from_secs(1));

    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.size, 0);

    // The pool opens a fresh connection for the next cycle.
    notify_after(&server, "events", "recovered", Duration::ZERO);
    let outcome = listener.listen(&Context::background()).await.unwrap();
    assert_eq!(outcome.notification().unwrap().payload, "recovered");
}

#[tokio::test]
async fn test_listen_after_shutdown_fails() {
    let (_server, pool, listener) =
        create_test_environment("events", Duration::from_secs(1), 1).await;
    pool.shutdown().await;

    let err = listener.listen(&Context::background()).await.unwrap_err();
    assert!(matches!(err, ListenError::Acquire(AcquireError::PoolClosed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_listeners_share_the_pool() {
    let (server, pool, listener) =
        create_test_environment("events", Duration::from_secs(3), 3).await;
    let listener = std::sync::Arc::new(listener);

    let mut handles = Vec::new();
    for _ in 0..3 {
        let listener = listener.clone();
        handles.push(tokio::spawn(async move {
            listener.listen(&Context::background()).await
        }));
    }

    while server.listeners("events") < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(pool.stats().in_use, 3);
    assert_eq!(server.notify("events", "all"), 3);

    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.notification().unwrap().payload, "all");
    }

    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.idle, 3);
}

#[tokio::test]
async fn test_notices_are_filtered() {
    let (server, _pool, _listener) =
        create_test_environment("events", Duration::from_secs(1), 1).await;

    assert!(server.has_notice_handler());
    assert!(!server.send_notice(""));
    assert!(!server.send_notice("null"));
    assert!(!server.send_notice("no value"));
    assert!(server.send_notice("extension \"pgcrypto\" already exists, skipping"));
}

#[tokio::test]
async fn test_abandoned_listen_does_not_leak_subscription() {
    let timeout = Duration::from_millis(300);
    let (server, pool, listener) = create_test_environment("events", timeout, 1).await;

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        listener.listen(&Context::background()),
    )
    .await;
    assert!(abandoned.is_err());

    // The subscribed connection was closed, not returned.
    assert_eq!(server.listeners("events"), 0);
    assert_eq!(server.notify("events", "stale"), 0);
    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.size, 0);

    let started = Instant::now();
    let outcome = listener.listen(&Context::background()).await.unwrap();
    assert!(outcome.is_timed_out());
    assert!(started.elapsed() >= timeout);
    assert_eq!(pool.stats().idle, 1);
}

#[tokio::test]
async fn test_stalled_subscribe_is_bounded_by_timeout() {
    let (server, pool, listener) =
        create_test_environment("events", Duration::from_millis(200), 1).await;
    server.stall_commands(true);

    let started = Instant::now();
    let err = listener.listen(&Context::background()).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2));
    match err {
        ListenError::Subscribe { channel, source } => {
            assert_eq!(channel, "events");
            assert!(matches!(source, DriverError::Timeout));
        }
        other => panic!("expected subscribe error, got {:?}", other),
    }

    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.size, 0);

    server.stall_commands(false);
    notify_after(&server, "events", "back", Duration::ZERO);
    let outcome = listener.listen(&Context::background()).await.unwrap();
    assert_eq!(outcome.notification().unwrap().payload, "back");
}

#[tokio::test]
async fn test_stalled_reset_is_bounded_and_discards() {
    let (server, pool, listener) =
        create_test_environment("events", Duration::from_millis(200), 1).await;

    let stalling = server.clone();
    tokio::spawn(async move {
        while stalling.listeners("events") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stalling.stall_commands(true);
        stalling.notify("events", "last");
    });

    let started = Instant::now();
    let outcome = listener.listen(&Context::background()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(outcome.notification().unwrap().payload, "last");

    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.size, 0);
    assert_eq!(server.listeners("events"), 0);
}

#[tokio::test]
async fn test_cancellation_interrupts_stalled_subscribe() {
    let (server, pool, listener) =
        create_test_environment("events", Duration::from_secs(30), 1).await;
    server.stall_commands(true);

    let ctx = Context::background();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let err = listener.listen(&ctx).await.unwrap_err();
    assert!(matches!(err, ListenError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(pool.stats().in_use, 0);
}

//! End-to-end request flow through the dispatcher.

use std::time::Duration;
use bytes::Bytes;
use gateway_control::dispatch::{DispatchError, Outcome};
use gateway_control::pool::PoolHealth;
use gateway_control::resilience::BreakerState;
use gateway_control::Priority;

mod common;

use common::{dispatcher_with, gateway_config, server_config, tenant, ScriptedConnector};

#[tokio::test]
async fn test_success_echoes_payload() {
    let connector = ScriptedConnector::new();
    let dispatcher = dispatcher_with(gateway_config(vec![]), server_config("b1"), connector.clone());

    let outcome = dispatcher.dispatch("acme", "b1", Priority::Normal, Bytes::from("ping")).await;
    assert_eq!(outcome, Outcome::Success(Bytes::from("ping")));

    let snap = dispatcher.snapshot();
    let server = &snap.servers[0];
    assert_eq!(server.queue.total_processed, 1);
    assert_eq!(server.breaker.total_requests, 1);
    assert_eq!(server.pool.active, 0);
    assert_eq!(server.pool.idle, 1);
    assert_eq!(snap.tenants[0].tenant, "acme");
    assert_eq!(snap.tenants[0].admitted, 1);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_unknown_server_is_unavailable() {
    let dispatcher = dispatcher_with(gateway_config(vec![]), server_config("b1"), ScriptedConnector::new());
    let outcome = dispatcher.dispatch("acme", "nope", Priority::High, Bytes::new()).await;
    assert_eq!(outcome, Outcome::Unavailable);
    assert!(dispatcher.snapshot().tenants.is_empty());
}

#[tokio::test]
async fn test_rate_limited_with_retry_hint() {
    let connector = ScriptedConnector::new();
    let config = gateway_config(vec![tenant("slow", 2.0, 1.0)]);
    let dispatcher = dispatcher_with(config, server_config("b1"), connector.clone());

    for _ in 0..2 {
        let outcome = dispatcher.dispatch("slow", "b1", Priority::Normal, Bytes::from("x")).await;
        assert!(outcome.is_success(), "{:?}", outcome);
    }
    let outcome = dispatcher.dispatch("slow", "b1", Priority::Normal, Bytes::from("x")).await;
    let retry = outcome.retry_after().expect("rate limited");
    // One unit over a 2-per-minute budget.
    assert!((retry.as_secs_f64() - 30.0).abs() < 0.01, "{:?}", retry);
    assert_eq!(connector.calls(), 2);
    assert_eq!(dispatcher.snapshot().rate_limited_total, 1);
}

#[tokio::test]
async fn test_full_queue_is_overloaded_and_credited() {
    let connector = ScriptedConnector::with_delay(300);
    let mut server = server_config("b1");
    server.workers = Some(1);
    server.queue.max_size = 1;
    let dispatcher = dispatcher_with(gateway_config(vec![]), server, connector.clone());

    let first = {
        let d = dispatcher.clone();
        tokio::spawn(async move { d.dispatch("acme", "b1", Priority::Normal, Bytes::from("a")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = {
        let d = dispatcher.clone();
        tokio::spawn(async move { d.dispatch("acme", "b1", Priority::Normal, Bytes::from("b")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let third = dispatcher.dispatch("acme", "b1", Priority::High, Bytes::from("c")).await;
    assert_eq!(third, Outcome::Overloaded);

    let tenant = &dispatcher.snapshot().tenants[0];
    assert_eq!(tenant.admitted, 3);
    assert_eq!(tenant.credited, 1);
    assert_eq!(tenant.current_window, 2.0);

    assert!(first.await.unwrap().is_success());
    assert!(second.await.unwrap().is_success());
    assert_eq!(dispatcher.snapshot().servers[0].queue.total_rejected, 1);
}

#[tokio::test]
async fn test_queue_timeout_not_reported_to_breaker() {
    let connector = ScriptedConnector::with_delay(300);
    let mut server = server_config("b1");
    server.workers = Some(1);
    server.queue.processing_timeout_ms = 100;
    let dispatcher = dispatcher_with(gateway_config(vec![]), server, connector.clone());

    let first = {
        let d = dispatcher.clone();
        tokio::spawn(async move { d.dispatch("acme", "b1", Priority::Normal, Bytes::from("a")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = dispatcher.dispatch("acme", "b1", Priority::Normal, Bytes::from("b")).await;
    assert_eq!(second, Outcome::Timeout);
    assert!(first.await.unwrap().is_success());

    let server = &dispatcher.snapshot().servers[0];
    assert_eq!(server.breaker.total_requests, 1);
    assert_eq!(server.breaker.total_failures, 0);
    assert_eq!(server.queue.total_timeouts, 1);
    assert_eq!(connector.calls(), 1);
}

#[tokio::test]
async fn test_breaker_opens_after_consecutive_failures() {
    let connector = ScriptedConnector::new();
    connector.set_failing(true);
    let dispatcher = dispatcher_with(gateway_config(vec![]), server_config("b1"), connector.clone());

    for _ in 0..5 {
        let outcome = dispatcher.dispatch("acme", "b1", Priority::Normal, Bytes::from("x")).await;
        assert!(matches!(outcome, Outcome::DownstreamError(_)), "{:?}", outcome);
    }
    let outcome = dispatcher.dispatch("acme", "b1", Priority::Normal, Bytes::from("x")).await;
    assert_eq!(outcome, Outcome::CircuitOpen);

    let server = &dispatcher.snapshot().servers[0];
    assert_eq!(server.breaker.state, BreakerState::Open);
    assert_eq!(connector.calls(), 5);
    // The connection checked out for the rejected request went straight back.
    assert_eq!(server.pool.active, 0);
}

#[tokio::test]
async fn test_unhealthy_pool_short_circuits_before_admission() {
    let connector = ScriptedConnector::new();
    connector.set_refusing(true);
    let dispatcher = dispatcher_with(gateway_config(vec![]), server_config("b1"), connector.clone());

    for _ in 0..3 {
        let outcome = dispatcher.dispatch("acme", "b1", Priority::Normal, Bytes::from("x")).await;
        assert_eq!(outcome, Outcome::Unavailable);
    }
    let server = &dispatcher.snapshot().servers[0];
    assert_eq!(server.pool.health, PoolHealth::Unhealthy);
    assert_eq!(server.breaker.total_failures, 3);

    let outcome = dispatcher.dispatch("acme", "b1", Priority::Normal, Bytes::from("x")).await;
    assert_eq!(outcome, Outcome::CircuitOpen);
    assert_eq!(dispatcher.snapshot().tenants[0].admitted, 3);

    // The maintenance probe brings the pool back once connects succeed.
    connector.set_refusing(false);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(dispatcher.snapshot().servers[0].pool.health, PoolHealth::Healthy);
    let outcome = dispatcher.dispatch("acme", "b1", Priority::Normal, Bytes::from("x")).await;
    assert!(outcome.is_success(), "{:?}", outcome);
}

#[tokio::test]
async fn test_downstream_timeout() {
    let connector = ScriptedConnector::with_delay(300);
    let mut server = server_config("b1");
    server.request_timeout_ms = 100;
    let dispatcher = dispatcher_with(gateway_config(vec![]), server, connector.clone());

    let outcome = dispatcher.dispatch("acme", "b1", Priority::Normal, Bytes::from("x")).await;
    assert_eq!(outcome, Outcome::Timeout);

    let server = &dispatcher.snapshot().servers[0];
    assert_eq!(server.breaker.total_timeouts, 1);
    assert_eq!(server.breaker.consecutive_failures, 1);
    // A connection abandoned mid-call is never reused.
    assert_eq!(server.pool.total_errors, 1);
    assert_eq!(server.pool.idle, 0);
}

#[tokio::test]
async fn test_backlog_served_by_priority() {
    let connector = ScriptedConnector::with_delay(100);
    let mut server = server_config("b1");
    server.workers = Some(1);
    let dispatcher = dispatcher_with(gateway_config(vec![]), server, connector.clone());

    let mut handles = Vec::new();
    let plan = [
        ("blocker", Priority::Normal),
        ("low-1", Priority::Low),
        ("low-2", Priority::Low),
        ("high-1", Priority::High),
        ("normal-1", Priority::Normal),
    ];
    for (payload, priority) in plan {
        let d = dispatcher.clone();
        handles.push(tokio::spawn(async move {
            d.dispatch("acme", "b1", priority, Bytes::from(payload)).await
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_success());
    }

    let seen: Vec<_> = connector.seen().into_iter().map(|b| String::from_utf8(b.to_vec()).unwrap()).collect();
    assert_eq!(seen, vec!["blocker", "high-1", "normal-1", "low-1", "low-2"]);
}

#[tokio::test]
async fn test_priority_holds_with_more_workers_than_connections() {
    let connector = ScriptedConnector::with_delay(100);
    let mut server = server_config("b1");
    // Default worker count follows the ceiling, so four workers share one connection.
    server.workers = None;
    server.pool.max_size = 1;
    server.pool.ceiling = 4;
    server.pool.scale_up_samples = 1_000;
    let dispatcher = dispatcher_with(gateway_config(vec![]), server, connector.clone());

    let mut handles = Vec::new();
    let plan = [
        ("blocker", Priority::Normal),
        ("low-1", Priority::Low),
        ("low-2", Priority::Low),
        ("low-3", Priority::Low),
        ("high-1", Priority::High),
    ];
    for (payload, priority) in plan {
        let d = dispatcher.clone();
        handles.push(tokio::spawn(async move {
            d.dispatch("acme", "b1", priority, Bytes::from(payload)).await
        }));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(dispatcher.snapshot().servers[0].queue.depth, 4);
    for handle in handles {
        assert!(handle.await.unwrap().is_success());
    }

    let seen: Vec<_> = connector.seen().into_iter().map(|b| String::from_utf8(b.to_vec()).unwrap()).collect();
    assert_eq!(seen, vec!["blocker", "high-1", "low-1", "low-2", "low-3"]);
    assert_eq!(dispatcher.snapshot().servers[0].pool.max_size, 1);
}

#[tokio::test]
async fn test_deregister_answers_queued_requests() {
    let connector = ScriptedConnector::with_delay(200);
    let mut server = server_config("b1");
    server.workers = Some(1);
    let dispatcher = dispatcher_with(gateway_config(vec![]), server, connector.clone());

    let in_flight = {
        let d = dispatcher.clone();
        tokio::spawn(async move { d.dispatch("acme", "b1", Priority::Normal, Bytes::from("a")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let queued = {
        let d = dispatcher.clone();
        tokio::spawn(async move { d.dispatch("acme", "b1", Priority::Normal, Bytes::from("b")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    dispatcher.deregister_server("b1").await.unwrap();

    assert_eq!(queued.await.unwrap(), Outcome::Unavailable);
    assert!(in_flight.await.unwrap().is_success());
    assert!(dispatcher.server_ids().is_empty());
    assert_eq!(
        dispatcher.deregister_server("b1").await,
        Err(DispatchError::UnknownServer("b1".into()))
    );
    assert_eq!(
        dispatcher.dispatch("acme", "b1", Priority::Normal, Bytes::new()).await,
        Outcome::Unavailable
    );
}

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    let dispatcher = dispatcher_with(gateway_config(vec![]), server_config("b1"), ScriptedConnector::new());
    let err = dispatcher.register_server(server_config("b1"), ScriptedConnector::new()).unwrap_err();
    assert_eq!(err, DispatchError::DuplicateServer("b1".into()));
}

#[tokio::test]
async fn test_reconfigure_reports_server_changes() {
    let dispatcher = dispatcher_with(gateway_config(vec![]), server_config("b1"), ScriptedConnector::new());
    dispatcher.register_server(server_config("old"), ScriptedConnector::new()).unwrap();

    let mut config = gateway_config(vec![tenant("acme", 1.0, 1.0)]);
    let mut b1 = server_config("b1");
    b1.breaker.failure_threshold = 1;
    config.servers = vec![b1, server_config("b2")];

    let report = dispatcher.reconfigure(config);
    assert_eq!(report.updated, vec!["b1".to_string()]);
    assert_eq!(report.added.len(), 1);
    assert_eq!(report.added[0].id, "b2");
    assert_eq!(report.removed, vec!["old".to_string()]);

    let snap = dispatcher.snapshot();
    let b1 = snap.servers.iter().find(|s| s.id == "b1").unwrap();
    assert_eq!(b1.breaker.failure_threshold, 1);
    assert_eq!(dispatcher.limiter().quota("acme").rate, 1.0);
    assert_eq!(dispatcher.config().servers.len(), 2);
}

#[tokio::test]
async fn test_shutdown_rejects_new_work() {
    let dispatcher = dispatcher_with(gateway_config(vec![]), server_config("b1"), ScriptedConnector::new());
    dispatcher.shutdown().await;

    let outcome = dispatcher.dispatch("acme", "b1", Priority::Normal, Bytes::new()).await;
    assert_eq!(outcome, Outcome::Unavailable);
    assert_eq!(
        dispatcher.register_server(server_config("b2"), ScriptedConnector::new()),
        Err(DispatchError::ShuttingDown)
    );
}

#[tokio::test]
async fn test_snapshot_serializes() {
    let dispatcher = dispatcher_with(gateway_config(vec![]), server_config("b1"), ScriptedConnector::new());
    dispatcher.dispatch("acme", "b1", Priority::Low, Bytes::from("x")).await;

    let value = serde_json::to_value(dispatcher.snapshot()).unwrap();
    assert_eq!(value["servers"][0]["breaker"]["state"], "closed");
    assert_eq!(value["servers"][0]["pool"]["health"], "healthy");
    assert_eq!(value["tenants"][0]["tenant"], "acme");
}

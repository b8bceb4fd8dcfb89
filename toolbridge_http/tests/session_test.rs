//! RPC session behavior against a real provider process.

mod common;

use common::{SpawnLog, echo_spec, session};
use futures::future::join_all;
use serde_json::json;
use std::time::{Duration, Instant};
use toolbridge_http::{BridgeError, ProviderSpec, SessionState};

const SECS_10: Duration = Duration::from_secs(10);

#[tokio::test]
async fn concurrent_calls_are_correlated_by_id() {
    let session = session(echo_spec("xero"), SECS_10, SECS_10);
    session.ensure_ready().await.unwrap();

    // Later calls sleep less, so answers come back in reverse order.
    let calls = (0..8u64).map(|n| {
        let session = session.clone();
        async move {
            let response = session
                .call(
                    "tools/call",
                    Some(json!({"name": "sleep", "arguments": {"ms": (8 - n) * 40, "n": n}})),
                )
                .await
                .unwrap();
            (n, response)
        }
    });

    for (n, response) in join_all(calls).await {
        assert_eq!(response["result"]["arguments"]["n"], n, "{response}");
    }
    assert_eq!(session.status().pending_calls, 0);
}

#[tokio::test]
async fn caller_id_is_restored_on_the_response() {
    let session = session(echo_spec("xero"), SECS_10, SECS_10);
    session.ensure_ready().await.unwrap();

    let response = session
        .send(json!({
            "jsonrpc": "2.0",
            "id": "client-7",
            "method": "tools/call",
            "params": {"name": "echo", "arguments": {"k": "v"}}
        }))
        .await
        .unwrap();
    assert_eq!(response["id"], "client-7");
    assert_eq!(response["result"]["arguments"]["k"], "v");
}

#[tokio::test]
async fn timed_out_call_ignores_its_late_response() {
    let session = session(echo_spec("xero"), SECS_10, Duration::from_millis(300));
    session.ensure_ready().await.unwrap();

    let started = Instant::now();
    let err = session
        .call(
            "tools/call",
            Some(json!({"name": "sleep", "arguments": {"ms": 800, "late": true}})),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::CallTimeout { .. }), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(session.status().pending_calls, 0);

    // Let the late answer arrive; it must not be handed to anyone.
    tokio::time::sleep(Duration::from_millis(700)).await;
    let response = session
        .call("tools/call", Some(json!({"name": "echo", "arguments": {"fresh": true}})))
        .await
        .unwrap();
    assert_eq!(response["result"]["arguments"], json!({"fresh": true}));
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test]
async fn concurrent_ensure_ready_spawns_once() {
    let log = SpawnLog::new();
    let spec = log
        .attach(echo_spec("xero"))
        .with_env("ECHO_PROVIDER_INIT_DELAY_MS", "200");
    let session = session(spec, SECS_10, SECS_10);

    let results = join_all((0..10).map(|_| {
        let session = session.clone();
        async move { session.ensure_ready().await }
    }))
    .await;

    assert!(results.iter().all(Result::is_ok), "{results:?}");
    assert_eq!(log.count(), 1);
    assert_eq!(session.state(), SessionState::Ready);

    session.ensure_ready().await.unwrap();
    assert_eq!(log.count(), 1);
}

#[tokio::test]
async fn crashed_provider_is_respawned_on_next_use() {
    let log = SpawnLog::new();
    let session = session(log.attach(echo_spec("xero")), SECS_10, SECS_10);
    session.ensure_ready().await.unwrap();
    let first_pid = session.status().pid.unwrap();

    let err = session
        .call("tools/call", Some(json!({"name": "crash", "arguments": {"code": 3}})))
        .await
        .unwrap_err();
    match &err {
        BridgeError::ProcessExited { reason, .. } => assert!(reason.contains("exit code 3")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Terminated);

    session.ensure_ready().await.unwrap();
    let response = session
        .call("tools/call", Some(json!({"name": "whoami"})))
        .await
        .unwrap();
    assert_ne!(response["result"]["pid"], first_pid);
    assert_eq!(log.count(), 2);
}

#[tokio::test]
async fn request_ids_are_not_reused_across_restarts() {
    let session = session(echo_spec("xero"), SECS_10, SECS_10);
    session.ensure_ready().await.unwrap();
    let before = session.call("ping", None).await.unwrap()["id"].as_u64().unwrap();

    let _ = session
        .call("tools/call", Some(json!({"name": "crash"})))
        .await;
    session.ensure_ready().await.unwrap();

    let after = session.call("ping", None).await.unwrap()["id"].as_u64().unwrap();
    assert!(after > before, "{after} <= {before}");
}

#[tokio::test]
async fn duplicate_answers_reach_the_caller_once() {
    let session = session(echo_spec("xero"), SECS_10, SECS_10);
    session.ensure_ready().await.unwrap();

    let response = session
        .call("tools/call", Some(json!({"name": "duplicate", "arguments": {"n": 1}})))
        .await
        .unwrap();
    assert_eq!(response["result"]["arguments"]["n"], 1);

    let response = session
        .call("tools/call", Some(json!({"name": "echo", "arguments": {"n": 2}})))
        .await
        .unwrap();
    assert_eq!(response["result"]["arguments"]["n"], 2);
}

#[tokio::test]
async fn log_lines_notifications_and_batches_are_tolerated() {
    let session = session(echo_spec("xero"), SECS_10, SECS_10);
    session.ensure_ready().await.unwrap();

    let response = session
        .call("tools/call", Some(json!({"name": "log", "arguments": {"n": 1}})))
        .await
        .unwrap();
    assert_eq!(response["result"]["arguments"]["n"], 1);

    let response = session
        .call("tools/call", Some(json!({"name": "chatty", "arguments": {"n": 2}})))
        .await
        .unwrap();
    assert_eq!(response["result"]["arguments"]["n"], 2);
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test]
async fn provider_error_answer_is_returned_verbatim() {
    let session = session(echo_spec("xero"), SECS_10, SECS_10);
    session.ensure_ready().await.unwrap();

    let response = session
        .call("tools/call", Some(json!({"name": "error"})))
        .await
        .unwrap();
    assert_eq!(response["error"]["code"], -32000);
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test]
async fn notifications_are_written_without_waiting() {
    let session = session(echo_spec("xero"), SECS_10, SECS_10);
    session.ensure_ready().await.unwrap();
    session
        .notify("notifications/cancelled", Some(json!({"requestId": 1})))
        .await
        .unwrap();
    session.call("ping", None).await.unwrap();
}

#[tokio::test]
async fn initialize_error_fails_the_session() {
    let spec = echo_spec("xero").with_env("ECHO_PROVIDER_INIT_ERROR", "missing XERO_CLIENT_ID");
    let session = session(spec, SECS_10, SECS_10);

    let err = session.ensure_ready().await.unwrap_err();
    match err {
        BridgeError::Protocol { message, .. } => assert_eq!(message, "missing XERO_CLIENT_ID"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Failed);
    assert!(matches!(
        session.call("ping", None).await,
        Err(BridgeError::NotReady { .. })
    ));
}

#[tokio::test]
async fn slow_initialize_times_out() {
    let spec = echo_spec("xero").with_env("ECHO_PROVIDER_INIT_DELAY_MS", "3000");
    let session = session(spec, Duration::from_millis(300), SECS_10);

    let started = Instant::now();
    let err = session.ensure_ready().await.unwrap_err();
    assert!(matches!(err, BridgeError::InitTimeout { .. }), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(session.state(), SessionState::Failed);
}

#[tokio::test]
async fn shutdown_terminates_the_child() {
    let session = session(echo_spec("xero"), SECS_10, SECS_10);
    session.ensure_ready().await.unwrap();
    assert!(session.status().running);

    session.shutdown();
    assert!(
        common::wait_until(Duration::from_secs(5), || !session.status().running).await,
        "child still running after shutdown"
    );
    assert_ne!(session.state(), SessionState::Ready);
}

#[cfg(unix)]
#[tokio::test]
async fn call_to_provider_that_stopped_reading_stdin_times_out() {
    // Answers initialize, consumes the initialized notification, then never reads again.
    let script = r#"read line; echo '{"jsonrpc":"2.0","id":1,"result":{}}'; read line; exec sleep 60"#;
    let spec = ProviderSpec::new("stalled", "sh").with_args(["-c", script]);
    let session = session(spec, SECS_10, Duration::from_millis(500));
    session.ensure_ready().await.unwrap();

    // Far larger than a pipe buffer, so the write itself blocks.
    let blob = "x".repeat(2 * 1024 * 1024);
    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        session.call("tools/call", Some(json!({"name": "upload", "arguments": {"blob": blob}}))),
    )
    .await
    .expect("call blocked past its timeout");
    assert!(matches!(outcome, Err(BridgeError::CallTimeout { .. })), "{outcome:?}");
    assert_eq!(session.status().pending_calls, 0);

    // The half-written stream is unusable, so the child is replaced rather than reused.
    let outcome = tokio::time::timeout(Duration::from_secs(5), session.call("ping", None))
        .await
        .expect("follow-up call blocked behind the stuck write");
    assert!(outcome.is_err(), "{outcome:?}");
    assert!(
        common::wait_until(Duration::from_secs(5), || !session.status().running).await,
        "stalled child was not terminated"
    );
}

#[tokio::test]
async fn abandoned_call_releases_its_pending_entry() {
    let session = session(echo_spec("xero"), SECS_10, SECS_10);
    session.ensure_ready().await.unwrap();

    let caller = session.clone();
    let handle = tokio::spawn(async move {
        caller
            .call("tools/call", Some(json!({"name": "sleep", "arguments": {"ms": 60000}})))
            .await
    });
    assert!(
        common::wait_until(Duration::from_secs(5), || session.status().pending_calls == 1).await,
        "call never became pending"
    );

    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());
    assert_eq!(session.status().pending_calls, 0);

    // The session stays usable.
    session.call("ping", None).await.unwrap();
}

#[tokio::test]
async fn initialization_finishes_without_a_waiting_caller() {
    let log = SpawnLog::new();
    let spec = log.attach(echo_spec("xero")).with_env("ECHO_PROVIDER_INIT_DELAY_MS", "200");
    let session = session(spec, SECS_10, SECS_10);

    let waiter = session.clone();
    let handle = tokio::spawn(async move { waiter.ensure_ready().await });
    assert!(
        common::wait_until(Duration::from_secs(5), || {
            session.state() == SessionState::Initializing
        })
        .await
    );
    handle.abort();
    let _ = handle.await;

    assert!(
        common::wait_until(Duration::from_secs(5), || session.state() == SessionState::Ready).await,
        "handshake stalled once its only caller went away"
    );
    session.ensure_ready().await.unwrap();
    assert_eq!(log.count(), 1);
}

//! Providers in one registry must not affect each other.

mod common;

use common::{SpawnLog, config, echo_spec, registry};
use serde_json::json;
use std::time::{Duration, Instant};
use toolbridge_http::{BridgeError, SessionState};

#[tokio::test]
async fn slow_provider_does_not_block_another() {
    let registry = registry(&config(vec![
        echo_spec("slow").with_env("ECHO_PROVIDER_INIT_DELAY_MS", "1500"),
        echo_spec("fast"),
    ]));

    let slow = async { registry.ensure("slow").await.map(|_| Instant::now()) };
    let fast = async {
        let session = registry.ensure("fast").await?;
        session.call("ping", None).await?;
        Ok::<_, BridgeError>(Instant::now())
    };

    let (slow_done, fast_done) = tokio::join!(slow, fast);
    assert!(fast_done.unwrap() < slow_done.unwrap());
}

#[tokio::test]
async fn crash_in_one_provider_leaves_the_other_running() {
    let registry = registry(&config(vec![echo_spec("xero"), echo_spec("supabase")]));

    let supabase = registry.ensure("supabase").await.unwrap();
    let supabase_pid = supabase.status().pid;

    let xero = registry.ensure("xero").await.unwrap();
    let _ = xero
        .call("tools/call", Some(json!({"name": "crash"})))
        .await
        .unwrap_err();

    assert_eq!(registry.get("xero").unwrap().state(), SessionState::Terminated);
    assert_eq!(supabase.state(), SessionState::Ready);
    assert_eq!(supabase.status().pid, supabase_pid);

    let response = supabase
        .call("tools/call", Some(json!({"name": "whoami"})))
        .await
        .unwrap();
    assert_eq!(response["result"]["provider"], "supabase");
}

#[tokio::test]
async fn providers_start_lazily_and_independently() {
    let xero_log = SpawnLog::new();
    let supabase_log = SpawnLog::new();
    let registry = registry(&config(vec![
        xero_log.attach(echo_spec("xero")),
        supabase_log.attach(echo_spec("supabase")),
    ]));
    assert_eq!(xero_log.count() + supabase_log.count(), 0);

    registry.ensure("supabase").await.unwrap();
    assert_eq!(xero_log.count(), 0);
    assert_eq!(supabase_log.count(), 1);

    assert_eq!(
        registry.ensure("ghost").await.unwrap_err(),
        BridgeError::UnknownProvider("ghost".into())
    );
    assert_eq!(xero_log.count(), 0);
}

#[tokio::test]
async fn shutdown_all_terminates_every_child() {
    let registry = registry(&config(vec![echo_spec("xero"), echo_spec("supabase")]));
    registry.ensure("xero").await.unwrap();
    registry.ensure("supabase").await.unwrap();

    registry.shutdown_all();
    let stopped = common::wait_until(Duration::from_secs(5), || {
        registry.providers().iter().all(|s| !s.status().running)
    })
    .await;
    assert!(stopped);
}

//! End-to-end tests for the watch monitor and scope manager through the hub

mod common;

use common::{wait_for_event, wait_until, MockRemote, MockReply};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tic_remote::protocol::{decode_string, HELLO_BANNER};
use tic_remote::{RefreshEvent, RemoteConfig, RemoteHub};

fn quick_config() -> RemoteConfig {
    RemoteConfig {
        connect_timeout_ms: 1000,
        ..RemoteConfig::default()
    }
}

#[tokio::test]
async fn test_watch_results_flow_end_to_end() {
    let mock = MockRemote::spawn_cart().await;
    let (hub, refresh_rx) = RemoteHub::new(&quick_config());

    hub.connect(&mock.host(), mock.port()).await.unwrap();
    hub.subscribe_expression("score");

    wait_for_event(&refresh_rx, RefreshEvent::Watches).await;
    let results = hub.watch_results();
    let outcome = results.get("score").expect("watched expression present");
    // The mock answers with an incrementing counter
    assert!(outcome.value().unwrap().parse::<u64>().is_ok());

    hub.shutdown().await;
}

#[tokio::test]
async fn test_watch_errors_do_not_affect_other_expressions() {
    let mock = MockRemote::spawn(Arc::new(|command, args| match command {
        "hello" => MockReply::Ok(HELLO_BANNER.to_string()),
        "evalexpr" if decode_string(args) == "boom" => {
            MockReply::Err("\"attempt to index a nil value\"".to_string())
        }
        "evalexpr" => MockReply::Ok("7".to_string()),
        _ => MockReply::Err(String::new()),
    }))
    .await;
    let (hub, refresh_rx) = RemoteHub::new(&quick_config());

    hub.connect(&mock.host(), mock.port()).await.unwrap();
    hub.subscribe_expression("boom");
    hub.subscribe_expression("fine");

    wait_until(|| {
        while refresh_rx.try_recv().is_ok() {}
        hub.watch_results().len() == 2
    })
    .await;

    let results = hub.watch_results();
    assert_eq!(results["fine"].value(), Some("7"));
    assert_eq!(
        results["boom"].error(),
        Some("attempt to index a nil value")
    );

    hub.shutdown().await;
}

#[tokio::test]
async fn test_watch_disconnect_clears_results() {
    let mock = MockRemote::spawn_cart().await;
    let (hub, refresh_rx) = RemoteHub::new(&quick_config());

    hub.connect(&mock.host(), mock.port()).await.unwrap();
    hub.subscribe_expression("score");
    wait_for_event(&refresh_rx, RefreshEvent::Watches).await;
    assert!(!hub.watch_results().is_empty());

    hub.disconnect().await;
    // The next scan clears the results and signals one more refresh
    wait_for_event(&refresh_rx, RefreshEvent::Watches).await;
    assert!(hub.watch_results().is_empty());

    hub.shutdown().await;
}

#[tokio::test]
async fn test_scope_builds_a_numeric_series() {
    let mock = MockRemote::spawn_cart().await;
    let (hub, _refresh_rx) = RemoteHub::new(&quick_config());

    hub.connect(&mock.host(), mock.port()).await.unwrap();
    // 50 Hz with an 8-point window keeps the test short: the window spans
    // 160 ms, well inside the sampling time below
    hub.subscribe_plot_series("player_x", Some(50.0), Some(8));

    tokio::time::sleep(Duration::from_millis(600)).await;

    let snapshot = hub.plot_snapshot();
    let series = snapshot.get("50:player_x").expect("series present");
    assert_eq!(series.expression, "player_x");
    assert_eq!(series.values.len(), 8);
    assert!(series.end_time > series.start_time);
    // Samples cover the whole window, so there are no gaps
    assert!(series.values.iter().all(|v| v.is_finite()));

    hub.shutdown().await;
}

#[tokio::test]
async fn test_scope_skips_non_numeric_results() {
    // Alternate numeric and non-numeric answers; only numbers become samples
    let counter = Arc::new(AtomicU64::new(0));
    let mock = MockRemote::spawn(Arc::new(move |command, _| match command {
        "hello" => MockReply::Ok(HELLO_BANNER.to_string()),
        "evalexpr" => {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n % 2 == 0 {
                MockReply::Ok(n.to_string())
            } else {
                MockReply::Ok("\"a string\"".to_string())
            }
        }
        _ => MockReply::Err(String::new()),
    }))
    .await;
    let (hub, _refresh_rx) = RemoteHub::new(&quick_config());

    hub.connect(&mock.host(), mock.port()).await.unwrap();
    hub.subscribe_plot_series("mixed", Some(50.0), Some(8));

    tokio::time::sleep(Duration::from_millis(600)).await;

    let snapshot = hub.plot_snapshot();
    let series = snapshot.get("50:mixed").expect("series present");
    // Numeric samples still arrived despite the interleaved noise
    assert!(series.values.iter().any(|v| v.is_finite()));
    // Every recorded value is one of the even counter readings
    for v in series.values.iter().filter(|v| v.is_finite()) {
        assert_eq!(*v as u64 % 2, 0);
    }

    hub.shutdown().await;
}

#[tokio::test]
async fn test_scope_disconnect_clears_samples_but_keeps_series() {
    let mock = MockRemote::spawn_cart().await;
    let (hub, refresh_rx) = RemoteHub::new(&quick_config());

    hub.connect(&mock.host(), mock.port()).await.unwrap();
    hub.subscribe_plot_series("player_x", Some(50.0), Some(8));
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(hub.plot_snapshot()["50:player_x"]
        .values
        .iter()
        .any(|v| v.is_finite()));

    hub.disconnect().await;
    wait_for_event(&refresh_rx, RefreshEvent::Scope).await;

    // The series survives for reconnection, its data does not
    let snapshot = hub.plot_snapshot();
    let series = snapshot.get("50:player_x").expect("series kept");
    assert!(series.values.iter().all(|v| v.is_nan()));

    hub.shutdown().await;
}

#[tokio::test]
async fn test_paused_series_stops_sampling_and_freezes_window() {
    let mock = MockRemote::spawn_cart().await;
    let (hub, _refresh_rx) = RemoteHub::new(&quick_config());

    hub.connect(&mock.host(), mock.port()).await.unwrap();
    hub.subscribe_plot_series("player_x", Some(50.0), Some(8));
    tokio::time::sleep(Duration::from_millis(300)).await;

    hub.set_plot_paused("player_x", Some(50.0), true);
    // Let any in-flight evaluation settle before taking the reference view
    tokio::time::sleep(Duration::from_millis(100)).await;
    let frozen = hub.plot_snapshot()["50:player_x"].clone();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let later = hub.plot_snapshot()["50:player_x"].clone();
    assert_eq!(later.end_time, frozen.end_time);
    assert_eq!(later.values, frozen.values);

    hub.set_plot_paused("player_x", Some(50.0), false);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(hub.plot_snapshot()["50:player_x"].end_time > frozen.end_time);

    hub.shutdown().await;
}

//! End-to-end relay behavior against in-process fakes
//!
//! These tests drive the real relay loop, coordinator, connection manager,
//! stream adapter and player. Only the voice gateway, the upstream source and
//! the metadata edges are faked.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_settings, wait_until, FakeConnector, FakeGateway, FakeLabels, FakeTracks};
use relay_lib::connection::ConnectivityState;
use relay_lib::control::{execute, Command, CommandError, CommandReply, Invoker};
use relay_lib::player::PlaybackState;
use relay_lib::settings::RelaySettings;
use relay_lib::state_machine::RestartReason;
use relay_lib::{MetadataParts, RelayHandle, RelayParts};

fn start(
    settings: &RelaySettings,
    gateway: &Arc<FakeGateway>,
    connector: &Arc<FakeConnector>,
) -> RelayHandle {
    RelayHandle::start(
        settings,
        RelayParts {
            gateway: Arc::clone(gateway) as _,
            connector: Arc::clone(connector) as _,
            metadata: None,
        },
    )
}

async fn wait_healthy(relay: &RelayHandle) {
    wait_until("relay to be healthy", || async { relay.status().await.is_healthy() }).await;
}

#[tokio::test]
async fn relay_starts_and_plays() {
    let gateway = FakeGateway::new();
    let connector = FakeConnector::new();
    let relay = start(&fast_settings(), &gateway, &connector);

    wait_healthy(&relay).await;

    let status = relay.status().await;
    assert_eq!(status.connectivity, Some(ConnectivityState::Ready));
    assert_eq!(status.playback, PlaybackState::Playing);
    assert_eq!(status.stream_url.as_deref(), Some("http://radio.test/live"));
    assert_eq!(gateway.joins(), 1);
    assert_eq!(connector.connects(), 1);

    let session = gateway.latest();
    wait_until("audio to reach the session", || async {
        session.frames.load(std::sync::atomic::Ordering::SeqCst) > 0
    })
    .await;

    let snapshot = relay.coordinator();
    assert!(!snapshot.in_flight);
    assert_eq!(snapshot.last_reason, Some(RestartReason::Startup));
    assert_eq!(snapshot.stats.succeeded, 1);

    relay.shutdown().await;
}

#[tokio::test]
async fn stream_end_triggers_exactly_one_restart() {
    let gateway = FakeGateway::new();
    let connector = FakeConnector::new();
    let relay = start(&fast_settings(), &gateway, &connector);
    wait_healthy(&relay).await;

    // Ending the stream also idles the player; both signals land together
    connector.end_latest();

    wait_until("second session", || async { gateway.joins() == 2 }).await;
    wait_healthy(&relay).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(gateway.joins(), 2);
    assert_eq!(connector.connects(), 2);
    assert!(gateway.sessions()[0].is_destroyed());
    assert!(!gateway.latest().is_destroyed());
    assert_eq!(relay.coordinator().last_reason, Some(RestartReason::StreamEnded));

    relay.shutdown().await;
}

#[tokio::test]
async fn stream_error_restarts() {
    let gateway = FakeGateway::new();
    let connector = FakeConnector::new();
    let relay = start(&fast_settings(), &gateway, &connector);
    wait_healthy(&relay).await;

    connector.fail_latest();

    wait_until("restart after stream error", || async {
        connector.connects() == 2 && relay.status().await.is_healthy()
    })
    .await;
    assert_eq!(relay.coordinator().last_reason, Some(RestartReason::StreamError));

    relay.shutdown().await;
}

#[tokio::test]
async fn failed_restart_is_retried_after_delay() {
    let gateway = FakeGateway::new();
    gateway
        .fail_next
        .store(1, std::sync::atomic::Ordering::SeqCst);
    let connector = FakeConnector::new();
    let relay = start(&fast_settings(), &gateway, &connector);

    wait_healthy(&relay).await;

    let snapshot = relay.coordinator();
    assert_eq!(gateway.joins(), 2);
    assert_eq!(snapshot.stats.failed, 1);
    assert_eq!(snapshot.stats.succeeded, 1);
    assert_eq!(snapshot.stats.consecutive_failures, 0);
    assert_eq!(snapshot.last_reason, Some(RestartReason::ScheduledRetry));
    assert!(snapshot.last_error.unwrap().contains("bridge unreachable"));
    assert!(snapshot.pending_retry.is_none());

    relay.shutdown().await;
}

#[tokio::test]
async fn lost_connection_restarts_after_reacquire_window() {
    let gateway = FakeGateway::new();
    let connector = FakeConnector::new();
    let relay = start(&fast_settings(), &gateway, &connector);
    wait_healthy(&relay).await;

    gateway.latest().set_state(ConnectivityState::Disconnected);

    wait_until("replacement session", || async { gateway.joins() == 2 }).await;
    wait_healthy(&relay).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(gateway.joins(), 2);
    assert!(gateway.sessions()[0].is_destroyed());
    assert!(!gateway.latest().is_destroyed());
    assert_eq!(relay.coordinator().last_reason, Some(RestartReason::ConnectionLost));
    assert_eq!(relay.coordinator().stats.started, 2);

    relay.shutdown().await;
}

#[tokio::test]
async fn bridge_destroyed_session_restarts_promptly() {
    let gateway = FakeGateway::new();
    let connector = FakeConnector::new();
    let relay = start(&fast_settings(), &gateway, &connector);
    wait_healthy(&relay).await;

    // Watchdog is a minute away, so only the session monitor can notice
    gateway.latest().set_state(ConnectivityState::Destroyed);

    wait_until("replacement session", || async { gateway.joins() == 2 }).await;
    wait_healthy(&relay).await;
    assert_eq!(relay.coordinator().last_reason, Some(RestartReason::ConnectionLost));

    relay.shutdown().await;
}

#[tokio::test]
async fn transient_disconnect_recovers_without_restart() {
    let gateway = FakeGateway::new();
    let connector = FakeConnector::new();
    let relay = start(&fast_settings(), &gateway, &connector);
    wait_healthy(&relay).await;

    let session = gateway.latest();
    session.set_state(ConnectivityState::Disconnected);
    tokio::time::sleep(Duration::from_millis(20)).await;
    session.set_state(ConnectivityState::Signalling);
    session.set_state(ConnectivityState::Ready);

    // Longer than the reacquire window
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(gateway.joins(), 1);
    assert!(!session.is_destroyed());
    assert!(relay.status().await.is_healthy());

    relay.shutdown().await;
}

#[tokio::test]
async fn manual_restart_while_in_flight_is_dropped() {
    let gateway = FakeGateway::new();
    gateway
        .hang_next
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let connector = FakeConnector::new();
    let relay = start(&fast_settings(), &gateway, &connector);

    wait_until("stuck startup restart", || async {
        gateway.joins() == 1 && relay.coordinator().in_flight
    })
    .await;

    let operator = Invoker::local_operator();
    for _ in 0..2 {
        match execute(&relay, &operator, Command::Restart).await {
            Ok(CommandReply::Accepted { detail, .. }) => assert!(detail.contains("already")),
            Ok(other) => panic!("unexpected reply: {:?}", other),
            Err(e) => panic!("restart rejected: {}", e),
        }
    }

    wait_until("dropped requests to be counted", || async {
        relay.coordinator().stats.dropped == 2
    })
    .await;
    assert_eq!(gateway.joins(), 1);
    assert!(relay.coordinator().in_flight);

    relay.shutdown().await;
}

#[tokio::test]
async fn fix_recovers_a_stuck_restart() {
    let gateway = FakeGateway::new();
    gateway
        .hang_next
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let connector = FakeConnector::new();
    let relay = start(&fast_settings(), &gateway, &connector);

    wait_until("stuck startup restart", || async {
        gateway.joins() == 1 && relay.coordinator().in_flight
    })
    .await;
    assert!(!relay.status().await.is_healthy());

    let reply = execute(&relay, &Invoker::local_operator(), Command::Fix)
        .await
        .unwrap();
    assert!(matches!(reply, CommandReply::Accepted { command: "fix", .. }));

    wait_healthy(&relay).await;
    assert_eq!(gateway.joins(), 2);
    let snapshot = relay.coordinator();
    assert_eq!(snapshot.last_reason, Some(RestartReason::ManualFix));
    assert!(!snapshot.in_flight);

    relay.shutdown().await;
}

#[tokio::test]
async fn unprivileged_invoker_only_gets_status() {
    let gateway = FakeGateway::new();
    let connector = FakeConnector::new();
    let relay = start(&fast_settings(), &gateway, &connector);
    wait_healthy(&relay).await;

    let listener = Invoker {
        name: "listener".to_string(),
        can_manage_channels: false,
    };

    let reply = execute(&relay, &listener, Command::Status).await.unwrap();
    match reply {
        CommandReply::Status(status) => assert!(status.is_healthy()),
        other => panic!("unexpected reply: {:?}", other),
    }

    for command in [Command::Restart, Command::Debug, Command::Fix, Command::Refresh] {
        let result = execute(&relay, &listener, command).await;
        assert!(matches!(result, Err(CommandError::NotPermitted { .. })));
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(gateway.joins(), 1);

    relay.shutdown().await;
}

#[tokio::test]
async fn debug_report_describes_live_cycle() {
    let gateway = FakeGateway::new();
    let connector = FakeConnector::new();
    let relay = start(&fast_settings(), &gateway, &connector);
    wait_healthy(&relay).await;

    let reply = execute(&relay, &Invoker::local_operator(), Command::Debug)
        .await
        .unwrap();
    let report = match reply {
        CommandReply::Debug(report) => report,
        other => panic!("unexpected reply: {:?}", other),
    };

    let live = report.coordinator.live_cycle.unwrap();
    assert_eq!(report.session_cycle, Some(live));
    assert_eq!(report.playback_cycle, Some(live));
    assert_eq!(report.stream.as_ref().map(|s| s.cycle), Some(live));
    assert!(report.track.is_none());

    let json = serde_json::to_value(CommandReply::Debug(report)).unwrap();
    assert_eq!(json["reply"], "debug");

    relay.shutdown().await;
}

#[tokio::test]
async fn track_changes_relabel_the_channel() {
    let settings = RelaySettings {
        metadata_interval_ms: 20,
        label_prefix: "▶ ".to_string(),
        ..fast_settings()
    };
    let gateway = FakeGateway::new();
    let connector = FakeConnector::new();
    let tracks = FakeTracks::new("Artist - First");
    let labels = FakeLabels::new();

    let relay = RelayHandle::start(
        &settings,
        RelayParts {
            gateway: Arc::clone(&gateway) as _,
            connector: Arc::clone(&connector) as _,
            metadata: Some(MetadataParts {
                tracks: Arc::clone(&tracks) as _,
                labels: Arc::clone(&labels) as _,
            }),
        },
    );

    wait_until("first label", || async { labels.applied().len() == 1 }).await;
    assert_eq!(
        labels.applied()[0],
        ("voice".to_string(), "▶ Artist - First".to_string())
    );

    // Same title on later polls does not relabel
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(labels.applied().len(), 1);

    tracks.set("Artist - Second");
    wait_until("second label", || async { labels.applied().len() == 2 }).await;
    assert_eq!(
        relay.status().await.now_playing.as_deref(),
        Some("Artist - Second")
    );

    let reply = execute(&relay, &Invoker::local_operator(), Command::Refresh)
        .await
        .unwrap();
    assert!(matches!(reply, CommandReply::Accepted { command: "refresh", .. }));
    wait_until("forced relabel", || async { labels.applied().len() == 3 }).await;

    relay.shutdown().await;
}

#[tokio::test]
async fn shutdown_tears_everything_down() {
    let gateway = FakeGateway::new();
    let connector = FakeConnector::new();
    let relay = start(&fast_settings(), &gateway, &connector);
    wait_healthy(&relay).await;

    relay.shutdown().await;

    assert!(gateway.latest().is_destroyed());
    let status = relay.status().await;
    assert_eq!(status.connectivity, None);
    assert_eq!(status.playback, PlaybackState::Idle);
    assert!(status.stream_url.is_none());

    // Idempotent, and the loop is gone
    relay.shutdown().await;
    assert!(relay.request_restart().await.is_err());
    assert_eq!(gateway.joins(), 1);
}

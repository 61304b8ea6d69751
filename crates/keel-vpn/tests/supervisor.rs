mod common;

use common::*;
use keel_vpn::{BearerToken, ConnectionState, FailureReason, SessionLog, SessionStatus, SessionStore};
use std::time::{Duration, SystemTime};

#[tokio::test(start_paused = true)]
async fn test_connect_then_disconnect() {
    let h = harness(valid_token(), ControlMode::Ok, ConnectMode::Ok);
    let mut rx = h.supervisor.subscribe();

    assert_eq!(h.supervisor.connect("us-east-1").await, ConnectionState::Connecting);
    assert_eq!(next_event(&mut rx).await.state, ConnectionState::Connecting);
    assert_eq!(next_event(&mut rx).await.state, ConnectionState::Connected);

    let session = h.supervisor.session().expect("session after handshake");
    assert_eq!(session.server_id, "us-east-1");
    assert_eq!(session.user_id, USER);
    assert!(session.ended_at.is_none());

    h.supervisor.record_traffic(1200).await;
    assert_eq!(h.supervisor.disconnect().await, ConnectionState::Disconnecting);
    assert_eq!(next_event(&mut rx).await.state, ConnectionState::Disconnecting);
    assert_eq!(next_event(&mut rx).await.state, ConnectionState::Disconnected);

    assert!(h.supervisor.session().is_none());
    let history = h.supervisor.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, session.id);
    assert_eq!(history[0].bytes_transferred, 1200);
    assert_eq!(history[0].status, SessionStatus::Disconnected);
    assert!(history[0].ended_at.is_some());
    assert!(h.connector.last_link().is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_second_connect_is_noop() {
    let h = harness(valid_token(), ControlMode::Ok, ConnectMode::Ok);
    let mut rx = h.supervisor.subscribe();

    assert_eq!(h.supervisor.connect("us-east-1").await, ConnectionState::Connecting);
    assert_eq!(h.supervisor.connect("us-east-1").await, ConnectionState::Connecting);

    assert_eq!(next_event(&mut rx).await.state, ConnectionState::Connecting);
    assert_eq!(next_event(&mut rx).await.state, ConnectionState::Connected);
    assert_eq!(h.supervisor.connect("us-east-1").await, ConnectionState::Connected);

    assert_eq!(h.control.calls(), 1);
    assert_eq!(h.connector.links().len(), 1);
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_missed_keepalives_fail_link() {
    let h = harness(valid_token(), ControlMode::Ok, ConnectMode::Ok);
    let mut rx = h.supervisor.subscribe();

    h.supervisor.connect("us-east-1").await;
    next_event(&mut rx).await;
    assert_eq!(next_event(&mut rx).await.state, ConnectionState::Connected);

    let link = h.connector.last_link();
    link.kill();

    let failed = next_event(&mut rx).await;
    assert_eq!(failed.state, ConnectionState::Failed(FailureReason::LinkLost));
    assert_eq!(link.keepalives(), 3);
    assert!(link.is_closed());

    assert!(h.supervisor.session().is_none());
    let closed = &h.supervisor.history()[0];
    assert!(closed.ended_at.is_some());
    assert_eq!(closed.status, SessionStatus::Failed(FailureReason::LinkLost));
}

#[tokio::test(start_paused = true)]
async fn test_live_link_stays_connected() {
    let h = harness(valid_token(), ControlMode::Ok, ConnectMode::Ok);
    let mut rx = h.supervisor.subscribe();

    h.supervisor.connect("us-east-1").await;
    next_event(&mut rx).await;
    next_event(&mut rx).await;

    let link = h.connector.last_link();
    tokio::time::sleep(Duration::from_secs(25 * 4 + 1)).await;
    assert_eq!(link.keepalives(), 4);
    assert_eq!(h.supervisor.state().await, ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_samples_link_traffic() {
    let h = harness(valid_token(), ControlMode::Ok, ConnectMode::Ok);
    let mut rx = h.supervisor.subscribe();

    h.supervisor.connect("us-east-1").await;
    next_event(&mut rx).await;
    next_event(&mut rx).await;

    let link = h.connector.last_link();
    link.add_traffic(500);
    tokio::time::sleep(Duration::from_secs(26)).await;
    assert_eq!(h.supervisor.session().unwrap().bytes_transferred, 500);

    link.add_traffic(250);
    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(h.supervisor.session().unwrap().bytes_transferred, 750);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_counts_traffic_since_last_keepalive() {
    let h = harness(valid_token(), ControlMode::Ok, ConnectMode::Ok);
    let mut rx = h.supervisor.subscribe();

    h.supervisor.connect("us-east-1").await;
    next_event(&mut rx).await;
    next_event(&mut rx).await;

    // well before the first keepalive at 25s
    h.connector.last_link().add_traffic(500);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.supervisor.session().unwrap().bytes_transferred, 0);

    h.supervisor.disconnect().await;
    next_event(&mut rx).await;
    assert_eq!(next_event(&mut rx).await.state, ConnectionState::Disconnected);
    assert_eq!(h.supervisor.history()[0].bytes_transferred, 500);
}

#[tokio::test(start_paused = true)]
async fn test_final_sample_does_not_double_count() {
    let h = harness(valid_token(), ControlMode::Ok, ConnectMode::Ok);
    let mut rx = h.supervisor.subscribe();

    h.supervisor.connect("us-east-1").await;
    next_event(&mut rx).await;
    next_event(&mut rx).await;

    let link = h.connector.last_link();
    link.add_traffic(500);
    tokio::time::sleep(Duration::from_secs(26)).await;
    assert_eq!(h.supervisor.session().unwrap().bytes_transferred, 500);

    link.add_traffic(100);
    h.supervisor.record_traffic(40).await;
    h.supervisor.disconnect().await;
    next_event(&mut rx).await;
    next_event(&mut rx).await;
    assert_eq!(h.supervisor.history()[0].bytes_transferred, 640);
}

#[tokio::test(start_paused = true)]
async fn test_link_lost_counts_unsampled_traffic() {
    let h = harness(valid_token(), ControlMode::Ok, ConnectMode::Ok);
    let mut rx = h.supervisor.subscribe();

    h.supervisor.connect("us-east-1").await;
    next_event(&mut rx).await;
    next_event(&mut rx).await;

    let link = h.connector.last_link();
    link.add_traffic(300);
    link.kill();
    assert_eq!(
        next_event(&mut rx).await.state,
        ConnectionState::Failed(FailureReason::LinkLost)
    );
    assert_eq!(h.supervisor.history()[0].bytes_transferred, 300);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_while_connecting_cancels() {
    let h = harness(valid_token(), ControlMode::Slow(Duration::from_secs(60)), ConnectMode::Ok);
    let mut rx = h.supervisor.subscribe();

    h.supervisor.connect("us-east-1").await;
    assert_eq!(next_event(&mut rx).await.state, ConnectionState::Connecting);
    while h.control.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let started = tokio::time::Instant::now();
    assert_eq!(h.supervisor.disconnect().await, ConnectionState::Disconnecting);
    assert_eq!(next_event(&mut rx).await.state, ConnectionState::Disconnecting);
    assert_eq!(next_event(&mut rx).await.state, ConnectionState::Disconnected);
    assert!(started.elapsed() < Duration::from_secs(5));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.supervisor.state().await, ConnectionState::Disconnected);
    assert!(h.supervisor.session().is_none());
    assert!(h.supervisor.history().is_empty());
    assert!(h.connector.links().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_handshake_cancels() {
    let h = harness(valid_token(), ControlMode::Ok, ConnectMode::Timeout);
    let mut rx = h.supervisor.subscribe();

    h.supervisor.connect("us-east-1").await;
    assert_eq!(next_event(&mut rx).await.state, ConnectionState::Connecting);
    while h.connector.client_keys().is_empty() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    assert_eq!(h.supervisor.disconnect().await, ConnectionState::Disconnecting);
    assert_eq!(next_event(&mut rx).await.state, ConnectionState::Disconnecting);
    assert_eq!(next_event(&mut rx).await.state, ConnectionState::Disconnected);

    // the handshake timeout would have fired here
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(h.supervisor.state().await, ConnectionState::Disconnected);
    assert!(h.supervisor.session().is_none());
    assert!(h.supervisor.history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_sessions_reported_to_control_plane() {
    let h = harness(valid_token(), ControlMode::Ok, ConnectMode::Ok);
    let mut rx = h.supervisor.subscribe();

    h.supervisor.connect("us-east-1").await;
    next_event(&mut rx).await;
    next_event(&mut rx).await;

    h.supervisor.disconnect().await;
    next_event(&mut rx).await;
    assert_eq!(next_event(&mut rx).await.state, ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.reporter.started(), vec!["us-east-1".to_string()]);
    assert_eq!(h.reporter.ended(), vec!["remote-1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_lost_link_reported_as_ended() {
    let h = harness(valid_token(), ControlMode::Ok, ConnectMode::Ok);
    let mut rx = h.supervisor.subscribe();

    h.supervisor.connect("us-east-1").await;
    next_event(&mut rx).await;
    next_event(&mut rx).await;

    h.connector.last_link().kill();
    next_event(&mut rx).await;

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.reporter.ended(), vec!["remote-1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_reporting_failure_is_not_fatal() {
    let h = harness(valid_token(), ControlMode::Ok, ConnectMode::Ok);
    h.reporter.set_failing(true);
    let mut rx = h.supervisor.subscribe();

    h.supervisor.connect("us-east-1").await;
    next_event(&mut rx).await;
    assert_eq!(next_event(&mut rx).await.state, ConnectionState::Connected);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.supervisor.state().await, ConnectionState::Connected);

    h.supervisor.disconnect().await;
    next_event(&mut rx).await;
    assert_eq!(next_event(&mut rx).await.state, ConnectionState::Disconnected);
    assert_eq!(h.supervisor.history()[0].status, SessionStatus::Disconnected);
    assert!(h.reporter.started().is_empty());
    assert!(h.reporter.ended().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_lost_link_written_to_session_log() {
    let dir = tempfile::tempdir().unwrap();
    let log = SessionLog::new(dir.path().join("sessions.jsonl"));
    let h = harness_with_store(
        valid_token(),
        ControlMode::Ok,
        ConnectMode::Ok,
        SessionStore::with_log(log.clone()),
    );
    let mut rx = h.supervisor.subscribe();

    h.supervisor.connect("us-east-1").await;
    next_event(&mut rx).await;
    next_event(&mut rx).await;

    h.connector.last_link().kill();
    next_event(&mut rx).await;

    // the log write runs on the blocking pool after the state change
    let mut records = log.load().unwrap();
    for _ in 0..1000 {
        if !records.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        records = log.load().unwrap();
    }
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, SessionStatus::Failed(FailureReason::LinkLost));

    // state stays reachable while the write completes
    assert_eq!(
        h.supervisor.state().await,
        ConnectionState::Failed(FailureReason::LinkLost)
    );
}

#[tokio::test(start_paused = true)]
async fn test_failure_requires_acknowledge() {
    let h = harness(valid_token(), ControlMode::Ok, ConnectMode::Ok);
    let mut rx = h.supervisor.subscribe();

    assert_eq!(h.supervisor.acknowledge().await, ConnectionState::Disconnected);
    assert!(rx.try_recv().is_err());

    h.supervisor.connect("eu-west-1").await;
    next_event(&mut rx).await;
    let failed = next_event(&mut rx).await;
    assert_eq!(failed.state, ConnectionState::Failed(FailureReason::UnknownServer));

    let blocked = h.supervisor.connect("us-east-1").await;
    assert_eq!(blocked, ConnectionState::Failed(FailureReason::UnknownServer));

    assert_eq!(h.supervisor.acknowledge().await, ConnectionState::Disconnected);
    assert_eq!(next_event(&mut rx).await.state, ConnectionState::Disconnected);

    h.supervisor.connect("us-east-1").await;
    next_event(&mut rx).await;
    assert_eq!(next_event(&mut rx).await.state, ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_expired_token_is_unauthorized() {
    let expired = BearerToken::new("token", SystemTime::now() - Duration::from_secs(1));
    let h = harness(expired, ControlMode::Ok, ConnectMode::Ok);
    let mut rx = h.supervisor.subscribe();

    h.supervisor.connect("us-east-1").await;
    next_event(&mut rx).await;
    let failed = next_event(&mut rx).await;

    assert_eq!(failed.state, ConnectionState::Failed(FailureReason::Unauthorized));
    assert!(failed.reason.unwrap().contains("refresh"));
    assert_eq!(h.control.calls(), 0);
    assert!(h.supervisor.session().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_rejected_token_is_unauthorized() {
    let h = harness(valid_token(), ControlMode::Unauthorized, ConnectMode::Ok);
    let mut rx = h.supervisor.subscribe();

    h.supervisor.connect("us-east-1").await;
    next_event(&mut rx).await;
    assert_eq!(
        next_event(&mut rx).await.state,
        ConnectionState::Failed(FailureReason::Unauthorized)
    );
    assert_eq!(h.control.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_key_mismatch_is_protocol_error() {
    let h = harness(valid_token(), ControlMode::WrongKey, ConnectMode::Ok);
    let mut rx = h.supervisor.subscribe();

    h.supervisor.connect("us-east-1").await;
    next_event(&mut rx).await;
    assert_eq!(
        next_event(&mut rx).await.state,
        ConnectionState::Failed(FailureReason::ProtocolError)
    );
    assert!(h.connector.links().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_handshake_failures() {
    let h = harness(valid_token(), ControlMode::Ok, ConnectMode::Timeout);
    let mut rx = h.supervisor.subscribe();

    h.supervisor.connect("us-east-1").await;
    next_event(&mut rx).await;
    assert_eq!(
        next_event(&mut rx).await.state,
        ConnectionState::Failed(FailureReason::HandshakeTimeout)
    );
    assert!(h.supervisor.session().is_none());

    let forged = harness(valid_token(), ControlMode::Ok, ConnectMode::Forged);
    let mut rx = forged.supervisor.subscribe();
    forged.supervisor.connect("us-east-1").await;
    next_event(&mut rx).await;
    assert_eq!(
        next_event(&mut rx).await.state,
        ConnectionState::Failed(FailureReason::ProtocolError)
    );
}

#[tokio::test(start_paused = true)]
async fn test_fresh_keys_per_attempt() {
    let h = harness(valid_token(), ControlMode::Ok, ConnectMode::Ok);
    let mut rx = h.supervisor.subscribe();

    for _ in 0..2 {
        h.supervisor.connect("us-east-1").await;
        next_event(&mut rx).await;
        next_event(&mut rx).await;
        h.supervisor.disconnect().await;
        next_event(&mut rx).await;
        next_event(&mut rx).await;
    }

    let keys = h.connector.client_keys();
    assert_eq!(keys.len(), 2);
    assert_ne!(keys[0], keys[1]);
    assert_eq!(h.supervisor.history().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_record_traffic_ignored_when_not_connected() {
    let h = harness(valid_token(), ControlMode::Ok, ConnectMode::Ok);
    h.supervisor.record_traffic(100).await;
    assert!(h.supervisor.session().is_none());
    assert!(h.supervisor.history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_sequence_numbers_increase() {
    let h = harness(valid_token(), ControlMode::Ok, ConnectMode::Ok);
    let mut rx = h.supervisor.subscribe();

    h.supervisor.connect("us-east-1").await;
    let mut events = vec![next_event(&mut rx).await, next_event(&mut rx).await];
    h.supervisor.disconnect().await;
    events.push(next_event(&mut rx).await);
    events.push(next_event(&mut rx).await);

    for pair in events.windows(2) {
        assert_eq!(pair[1].sequence, pair[0].sequence + 1);
    }
    assert_eq!(events[0].sequence, 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_from_any_state() {
    let h = harness(valid_token(), ControlMode::Ok, ConnectMode::Ok);
    let mut rx = h.supervisor.subscribe();

    h.supervisor.shutdown().await;
    assert_eq!(h.supervisor.state().await, ConnectionState::Disconnected);

    h.supervisor.connect("us-east-1").await;
    next_event(&mut rx).await;
    next_event(&mut rx).await;
    h.supervisor.shutdown().await;
    assert_eq!(h.supervisor.state().await, ConnectionState::Disconnected);
    assert_eq!(h.supervisor.history().len(), 1);

    h.supervisor.connect("nowhere").await;
    while !h.supervisor.state().await.is_failed() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    h.supervisor.shutdown().await;
    assert_eq!(h.supervisor.state().await, ConnectionState::Disconnected);
}

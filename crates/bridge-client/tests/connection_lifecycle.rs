//! Connection state machine scenarios over an in-process channel.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bridge_client::connection::close_codes;
use bridge_client::{
    BridgeError, BridgeEvent, ConnectionStatus, Identity, OutboundFrame, OutboundWire,
    ReconnectConfig, ToolRegistry, ToolSchema,
};
use common::*;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::Notify;

fn tools(names: &[&str]) -> ToolRegistry {
    let registry = ToolRegistry::new();
    for name in names {
        registry.register_fn(
            ToolSchema::new(*name, format!("{name} tool"), json!({ "type": "object" })),
            |args| async move { Ok(args) },
        );
    }
    registry
}

#[tokio::test]
async fn test_connect_with_persisted_identity_advertises_tools() {
    let mut h = connected_harness(tools(&["draw", "roll"]));

    h.manager.connect().await.unwrap();
    let mut server = h.connector.accept().await;

    assert_eq!(server.url.as_str(), "ws://bridge.test/ws/app/u0?secret=s0");
    let advertisement = server.recv_json().await;
    assert_eq!(advertisement["type"], "tools-registration");
    let names: Vec<_> = advertisement["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|tool| tool["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["draw", "roll"]);
    assert!(advertisement["tools"][0].get("inputSchema").is_some());

    assert_eq!(h.manager.status(), ConnectionStatus::Connected);
    h.events.wait_for_status(ConnectionStatus::Connected).await;
    assert_eq!(
        h.events.statuses(),
        vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
    );
    assert_eq!(h.issuer.calls(), 0);
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    let h = connected_harness(ToolRegistry::new());

    h.manager.connect().await.unwrap();
    h.manager.connect().await.unwrap();
    assert_eq!(h.connector.attempts(), 1);
}

#[tokio::test]
async fn test_missing_identity_is_issued_before_connecting() {
    let h = harness(config(), Default::default(), ToolRegistry::new());
    h.issuer.push(Ok(Identity::with_user_key("u1", "s1")));

    h.manager.connect().await.unwrap();

    let url = &h.connector.urls()[0];
    assert_eq!(url.path(), "/ws/app/u1");
    assert_eq!(url.query(), Some("secret=s1"));

    let events = h.events.all();
    let ready = events
        .iter()
        .position(|e| *e == BridgeEvent::IdentityReady(Identity::with_user_key("u1", "s1")))
        .expect("identity-ready emitted");
    let connected = events
        .iter()
        .position(|e| {
            matches!(e, BridgeEvent::Status { status: ConnectionStatus::Connected, .. })
        })
        .expect("connected emitted");
    assert!(ready < connected);
    assert!(h.storage.get("bridge-identity.app").is_some());
    assert_eq!(h.manager.identity(), Some(Identity::with_user_key("u1", "s1")));
}

#[tokio::test]
async fn test_issuance_failure_never_opens_a_channel() {
    let h = harness(config(), Default::default(), ToolRegistry::new());
    h.issuer.push(Err(BridgeError::issuance(404, r#"{"error":"unknown app"}"#)));

    let err = h.manager.connect().await.unwrap_err();

    assert!(matches!(err, BridgeError::Issuance { status: Some(404), .. }));
    assert_eq!(h.connector.attempts(), 0);
    assert_eq!(h.manager.status(), ConnectionStatus::Disconnected);
    assert!(!h.manager.reconnect_state().pending);
    assert!(h.events.all().iter().any(|e| matches!(
        e,
        BridgeEvent::Error(err) if err.resettable && err.message.contains("404")
    )));
}

#[tokio::test]
async fn test_send_requires_open_channel() {
    let h = connected_harness(ToolRegistry::new());

    let err = h
        .manager
        .send(OutboundFrame::Message(json!({ "type": "hello" })))
        .await
        .unwrap_err();
    assert_eq!(err, BridgeError::NotConnected);

    h.manager.connect().await.unwrap();
    let mut server = h.connector.accept().await;
    server.recv_json().await;
    h.manager
        .send(OutboundFrame::Message(json!({ "type": "hello" })))
        .await
        .unwrap();
    assert_eq!(server.recv_json().await, json!({ "type": "hello" }));
}

#[tokio::test]
async fn test_bridged_transitions_follow_the_same_agent() {
    let mut h = connected_harness(ToolRegistry::new());
    h.manager.connect().await.unwrap();
    let server = h.connector.accept().await;

    server
        .send_json(json!({ "type": "agent-connected", "agentSessionId": "a1" }))
        .await;
    h.events.wait_for_status(ConnectionStatus::Bridged).await;
    assert_eq!(h.manager.bridged_peer().as_deref(), Some("a1"));

    server
        .send_json(json!({ "type": "agent-disconnected", "agentSessionId": "a2" }))
        .await;
    h.events
        .wait_for(|e| matches!(e, BridgeEvent::PeerDisconnected { .. }))
        .await;
    assert_eq!(h.manager.status(), ConnectionStatus::Bridged);

    server
        .send_json(json!({ "type": "agent-disconnected", "agentSessionId": "a1" }))
        .await;
    h.events.wait_for_status(ConnectionStatus::Connected).await;
    assert_eq!(h.manager.bridged_peer(), None);
}

#[tokio::test]
async fn test_generic_frames_are_republished() {
    let mut h = connected_harness(ToolRegistry::new());
    h.manager.connect().await.unwrap();
    let server = h.connector.accept().await;

    server.send_json(json!({ "type": "canvas-update", "shapes": [] })).await;
    let event = h
        .events
        .wait_for(|e| matches!(e, BridgeEvent::Message(_)))
        .await;
    assert_eq!(
        event,
        BridgeEvent::Message(json!({ "type": "canvas-update", "shapes": [] }))
    );
}

#[tokio::test]
async fn test_decode_failure_keeps_connection() {
    let mut h = connected_harness(ToolRegistry::new());
    h.manager.connect().await.unwrap();
    let server = h.connector.accept().await;

    server.send_text("{definitely not json").await;
    let event = h
        .events
        .wait_for(|e| matches!(e, BridgeEvent::Error(_)))
        .await;
    let BridgeEvent::Error(err) = event else {
        unreachable!()
    };
    assert!(!err.resettable);
    assert_eq!(h.manager.status(), ConnectionStatus::Connected);

    server
        .send_json(json!({ "type": "agent-connected", "agentSessionId": "a1" }))
        .await;
    h.events.wait_for_status(ConnectionStatus::Bridged).await;
}

#[tokio::test]
async fn test_disconnect_closes_normally() {
    let mut h = connected_harness(ToolRegistry::new());
    h.manager.connect().await.unwrap();
    let mut server = h.connector.accept().await;
    server.recv_json().await;

    h.manager.disconnect().await;

    assert_eq!(
        server.recv().await,
        OutboundWire::Close {
            code: close_codes::NORMAL,
            reason: "client disconnect".to_string()
        }
    );
    assert_eq!(h.manager.status(), ConnectionStatus::Disconnected);
    h.events.wait_for_status(ConnectionStatus::Disconnected).await;
    assert!(!h.manager.reconnect_state().pending);
}

#[tokio::test]
async fn test_normal_server_close_does_not_retry() {
    let mut h = connected_harness(ToolRegistry::new());
    h.manager.connect().await.unwrap();
    let server = h.connector.accept().await;

    server.close(close_codes::NORMAL, "bye").await;
    let error = h.events.wait_for_status(ConnectionStatus::Disconnected).await;
    assert_eq!(error, None);
    assert!(!h.manager.reconnect_state().pending);
}

#[tokio::test]
async fn test_policy_close_reports_resettable_error() {
    let mut h = connected_harness(ToolRegistry::new());
    h.manager.connect().await.unwrap();
    let server = h.connector.accept().await;

    server.close(close_codes::POLICY_VIOLATION, "invalid secret").await;
    h.events.wait_for_status(ConnectionStatus::Disconnected).await;
    let event = h
        .events
        .wait_for(|e| matches!(e, BridgeEvent::Error(_)))
        .await;
    assert!(matches!(event, BridgeEvent::Error(err) if err.resettable));
    assert!(!h.manager.reconnect_state().pending);
    assert_eq!(h.connector.attempts(), 1);
}

#[tokio::test]
async fn test_policy_close_with_auto_reset_reconnects_with_new_identity() {
    let mut h = harness(
        config().with_auto_reset_on_auth_failure(true),
        storage_with(&Identity::with_user_key("u0", "stale")),
        ToolRegistry::new(),
    );
    h.issuer.push(Ok(Identity::with_user_key("u9", "fresh")));
    h.manager.connect().await.unwrap();
    let server = h.connector.accept().await;

    server.close(close_codes::POLICY_VIOLATION, "invalid secret").await;
    h.events
        .wait_for(|e| matches!(e, BridgeEvent::IdentityReady(_)))
        .await;
    h.events.wait_for_status(ConnectionStatus::Connected).await;

    let second = h.connector.accept().await;
    assert_eq!(second.url.query(), Some("secret=fresh"));
}

#[tokio::test]
async fn test_reset_credentials_reconnects_with_new_identity() {
    let h = connected_harness(ToolRegistry::new());
    h.issuer.push(Ok(Identity::with_user_key("u5", "s5")));
    h.manager.connect().await.unwrap();
    let _first = h.connector.accept().await;

    let identity = h.manager.reset_credentials().await.unwrap();

    assert_eq!(identity, Identity::with_user_key("u5", "s5"));
    assert_eq!(h.manager.status(), ConnectionStatus::Connected);
    let second = h.connector.accept().await;
    assert_eq!(second.url.path(), "/ws/app/u5");
}

#[tokio::test]
async fn test_late_registration_is_readvertised() {
    let h = connected_harness(tools(&["draw"]));
    h.manager.connect().await.unwrap();
    let mut server = h.connector.accept().await;
    server.recv_json().await;

    h.manager
        .register_tool(bridge_client::ToolDescriptor::SchemaOnly(ToolSchema::new(
            "erase",
            "Erase the canvas",
            json!({}),
        )))
        .await
        .unwrap();

    let advertisement = server.recv_json().await;
    assert_eq!(advertisement["tools"][1]["name"], "erase");
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_rejects_and_schedules_retry() {
    let mut h = harness(
        config().with_connect_timeout(Duration::from_secs(10)),
        storage_with(&Identity::with_user_key("u0", "s0")),
        ToolRegistry::new(),
    );
    h.connector.push(OpenBehavior::Hang);

    let err = h.manager.connect().await.unwrap_err();

    assert_eq!(err, BridgeError::ConnectTimeout(Duration::from_secs(10)));
    let error = h.events.wait_for_status(ConnectionStatus::Disconnected).await;
    assert!(error.is_some());
    let state = h.manager.reconnect_state();
    assert!(state.pending);
    assert_eq!(state.attempt, 1);
    assert_eq!(state.delay, Some(Duration::from_secs(1)));
}

#[tokio::test(start_paused = true)]
async fn test_abnormal_close_backs_off_exponentially_then_gives_up() {
    let mut h = connected_harness(ToolRegistry::new());
    h.manager.connect().await.unwrap();
    let server = h.connector.accept().await;
    h.connector
        .set_default(OpenBehavior::Fail(BridgeError::Connect("refused".into())));

    let closed_at = tokio::time::Instant::now();
    server.close(close_codes::ABNORMAL, "").await;
    h.events
        .wait_for(|e| {
            matches!(e, BridgeEvent::Error(err) if err.message.contains("abandoned"))
        })
        .await;

    let times = h.connector.attempt_times();
    assert_eq!(times.len(), 1 + 5);
    let mut previous = closed_at;
    let gaps: Vec<Duration> = times[1..]
        .iter()
        .map(|at| {
            let gap = *at - previous;
            previous = *at;
            gap
        })
        .collect();
    assert_eq!(
        gaps,
        [1, 2, 4, 8, 16].map(Duration::from_secs).to_vec()
    );
    assert_eq!(h.manager.status(), ConnectionStatus::Disconnected);
    assert!(!h.manager.reconnect_state().pending);
}

#[tokio::test(start_paused = true)]
async fn test_delay_is_capped_at_max_delay() {
    let mut h = harness(
        config().with_reconnect_config(
            ReconnectConfig::default()
                .with_base_interval(Duration::from_secs(10))
                .with_max_attempts(3),
        ),
        storage_with(&Identity::with_user_key("u0", "s0")),
        ToolRegistry::new(),
    );
    h.manager.connect().await.unwrap();
    let server = h.connector.accept().await;
    h.connector
        .set_default(OpenBehavior::Fail(BridgeError::Connect("refused".into())));

    server.close(close_codes::ABNORMAL, "").await;
    h.events
        .wait_for(|e| {
            matches!(e, BridgeEvent::Error(err) if err.message.contains("abandoned"))
        })
        .await;

    let times = h.connector.attempt_times();
    assert_eq!(times[2] - times[1], Duration::from_secs(20));
    assert_eq!(times[3] - times[2], Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_attempt_counter_resets_after_reconnect() {
    let mut h = connected_harness(ToolRegistry::new());
    h.manager.connect().await.unwrap();
    let first = h.connector.accept().await;

    h.connector
        .push(OpenBehavior::Fail(BridgeError::Connect("refused".into())));
    first.close(close_codes::ABNORMAL, "").await;
    let second = h.connector.accept().await;
    // Initial connect, then the reconnect.
    h.events.wait_for_status(ConnectionStatus::Connected).await;
    h.events.wait_for_status(ConnectionStatus::Connected).await;
    assert_eq!(h.manager.reconnect_state().attempt, 0);

    let closed_at = tokio::time::Instant::now();
    second.close(close_codes::ABNORMAL, "").await;
    let _third = h.connector.accept().await;
    let times = h.connector.attempt_times();
    assert_eq!(*times.last().unwrap() - closed_at, Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_reconnect() {
    let mut h = connected_harness(ToolRegistry::new());
    h.manager.connect().await.unwrap();
    let server = h.connector.accept().await;

    server.close(close_codes::ABNORMAL, "").await;
    h.events.wait_for_status(ConnectionStatus::Disconnected).await;
    assert!(h.manager.reconnect_state().pending);

    h.manager.disconnect().await;
    assert!(!h.manager.reconnect_state().pending);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.connector.attempts(), 1);
    assert_eq!(h.manager.status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_reconnect_settles_disconnected() {
    let mut h = harness(
        config().with_reconnect_config(ReconnectConfig::disabled()),
        storage_with(&Identity::with_user_key("u0", "s0")),
        ToolRegistry::new(),
    );
    h.manager.connect().await.unwrap();
    let server = h.connector.accept().await;

    server.close(close_codes::ABNORMAL, "").await;
    h.events.wait_for_status(ConnectionStatus::Disconnected).await;
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.connector.attempts(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connected_is_reported_before_a_queued_agent_frame() {
    let mut h = connected_harness(ToolRegistry::new());
    h.connector
        .preload(json!({ "type": "agent-connected", "agentSessionId": "a1" }).to_string());

    h.manager.connect().await.unwrap();
    h.events.wait_for_status(ConnectionStatus::Bridged).await;

    assert_eq!(
        h.events.statuses(),
        vec![
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
            ConnectionStatus::Bridged
        ]
    );
    assert_eq!(h.manager.status(), ConnectionStatus::Bridged);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_open_abandons_the_attempt() {
    let h = connected_harness(ToolRegistry::new());
    h.connector.push(OpenBehavior::Hang);
    let manager = h.manager.clone();
    let connecting = tokio::spawn(async move { manager.connect().await });
    h.connector.wait_for_attempts(1).await;

    h.manager.disconnect().await;
    let err = connecting.await.unwrap().unwrap_err();

    assert_eq!(err, BridgeError::ConnectTimeout(Duration::from_secs(10)));
    assert_eq!(h.manager.status(), ConnectionStatus::Disconnected);
    assert!(!h.manager.reconnect_state().pending);
    assert!(
        !h.events
            .all()
            .iter()
            .any(|e| matches!(e, BridgeEvent::Error(_)))
    );

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.connector.attempts(), 1);
}

#[tokio::test]
async fn test_channel_opened_after_disconnect_is_closed() {
    let h = connected_harness(ToolRegistry::new());
    let gate = Arc::new(Notify::new());
    h.connector.push(OpenBehavior::Gated(gate.clone()));
    let manager = h.manager.clone();
    let connecting = tokio::spawn(async move { manager.connect().await });
    h.connector.wait_for_attempts(1).await;

    h.manager.disconnect().await;
    gate.notify_one();
    let err = connecting.await.unwrap().unwrap_err();

    assert!(matches!(err, BridgeError::Connect(_)), "{err:?}");
    let mut server = h.connector.accept().await;
    assert_eq!(
        server.recv().await,
        OutboundWire::Close {
            code: close_codes::NORMAL,
            reason: "client disconnect".to_string()
        }
    );
    assert_eq!(h.manager.status(), ConnectionStatus::Disconnected);
    assert!(!h.manager.reconnect_state().pending);
}

#[tokio::test(start_paused = true)]
async fn test_connect_after_giving_up_starts_a_new_backoff_series() {
    let mut h = harness(
        config().with_reconnect_config(ReconnectConfig::default().with_max_attempts(1)),
        storage_with(&Identity::with_user_key("u0", "s0")),
        ToolRegistry::new(),
    );
    h.manager.connect().await.unwrap();
    let server = h.connector.accept().await;
    h.connector
        .set_default(OpenBehavior::Fail(BridgeError::Connect("refused".into())));

    server.close(close_codes::ABNORMAL, "").await;
    h.events
        .wait_for(|e| matches!(e, BridgeEvent::Error(err) if err.message.contains("abandoned")))
        .await;
    assert!(!h.manager.reconnect_state().pending);

    let err = h.manager.connect().await.unwrap_err();

    assert!(matches!(err, BridgeError::Connect(_)), "{err:?}");
    let state = h.manager.reconnect_state();
    assert!(state.pending);
    assert_eq!(state.attempt, 1);
    assert_eq!(state.delay, Some(Duration::from_secs(1)));
}

#[tokio::test(start_paused = true)]
async fn test_lost_advertisement_fails_the_attempt() {
    let h = connected_harness(ToolRegistry::new());
    h.connector.push(OpenBehavior::AcceptClosed);

    let err = h.manager.connect().await.unwrap_err();

    assert!(
        matches!(err, BridgeError::Connect(ref message) if message.contains("advertised")),
        "{err:?}"
    );
    assert_eq!(
        h.events.statuses(),
        vec![ConnectionStatus::Connecting, ConnectionStatus::Disconnected]
    );
    assert!(h.manager.reconnect_state().pending);
}

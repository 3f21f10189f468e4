//! Integration tests for the arbitration authority over real WebSockets.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pinlock::prelude::*;
use tokio_tungstenite::tungstenite::Message;

// =========================================================================
// Helpers
// =========================================================================

type ClientWs = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

const QUIET: Duration = Duration::from_millis(150);

/// Starts an authority accepting `1234` and `5678` on a random port.
async fn start_authority() -> String {
    start_with(SessionConfig::default(), Duration::from_secs(5)).await
}

async fn start_with(config: SessionConfig, sweep: Duration) -> String {
    let authority = AuthorityBuilder::new()
        .bind("127.0.0.1:0")
        .session_config(config)
        .sweep_interval(sweep)
        .build(AllowList::new(["1234", "5678"]).expect("valid pins"))
        .await
        .expect("authority should build");

    let addr = authority
        .local_addr()
        .expect("should have local addr")
        .to_string();

    tokio::spawn(async move {
        let _ = authority.run().await;
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    addr
}

async fn connect(addr: &str) -> ClientWs {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .expect("should connect");
    ws
}

async fn send(ws: &mut ClientWs, message: ClientMessage) {
    let env = Envelope {
        seq: 1,
        timestamp: 0,
        message,
    };
    let bytes = serde_json::to_vec(&env).expect("encode");
    ws.send(Message::Binary(bytes.into())).await.expect("send");
}

async fn recv(ws: &mut ClientWs) -> ServerMessage {
    let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("authority should answer")
        .expect("stream open")
        .expect("frame");
    let env: Envelope<ServerMessage> =
        serde_json::from_slice(&msg.into_data()).expect("decode");
    env.message
}

/// Asserts nothing arrives for a short while.
async fn assert_quiet(ws: &mut ClientWs) {
    if let Ok(Some(Ok(msg))) = tokio::time::timeout(QUIET, ws.next()).await {
        panic!("expected silence, got {msg:?}");
    }
}

fn register(pin: &str, device: &str) -> ClientMessage {
    ClientMessage::RegisterSession {
        pin: serde_json::from_str(&format!("\"{pin}\"")).expect("pin"),
        device_id: DeviceId::new(device),
        device_label: format!("Desktop (Linux, {device})"),
    }
}

async fn registered(addr: &str, pin: &str, device: &str) -> (ClientWs, ServerMessage) {
    let mut ws = connect(addr).await;
    send(&mut ws, register(pin, device)).await;
    let reply = recv(&mut ws).await;
    (ws, reply)
}

// =========================================================================
// Registration
// =========================================================================

#[tokio::test]
async fn test_first_registration_is_new() {
    let addr = start_authority().await;

    let (_ws, reply) = registered(&addr, "1234", "dev-a").await;

    assert_eq!(
        reply,
        ServerMessage::SessionRegistered {
            is_new: true,
            is_same_device: false,
            previous_device: None,
        }
    );
}

#[tokio::test]
async fn test_takeover_notifies_both_devices() {
    let addr = start_authority().await;
    let (mut a, _) = registered(&addr, "1234", "dev-a").await;

    let (_b, reply) = registered(&addr, "1234", "dev-b").await;

    assert_eq!(
        reply,
        ServerMessage::SessionRegistered {
            is_new: false,
            is_same_device: false,
            previous_device: Some(DeviceSummary {
                device_id: DeviceId::new("dev-a"),
                device_label: "Desktop (Linux, dev-a)".into(),
            }),
        }
    );
    assert_eq!(
        recv(&mut a).await,
        ServerMessage::ForceLogout {
            reason: ForceLogoutReason::DifferentDevice,
            new_device_details: Some(DeviceSummary {
                device_id: DeviceId::new("dev-b"),
                device_label: "Desktop (Linux, dev-b)".into(),
            }),
        }
    );
}

#[tokio::test]
async fn test_reregister_on_same_connection_is_refresh_without_force_logout() {
    let addr = start_authority().await;
    let (mut a, _) = registered(&addr, "1234", "dev-a").await;

    send(&mut a, register("1234", "dev-a")).await;

    assert_eq!(
        recv(&mut a).await,
        ServerMessage::SessionRegistered {
            is_new: false,
            is_same_device: true,
            previous_device: None,
        }
    );
    assert_quiet(&mut a).await;
}

#[tokio::test]
async fn test_same_device_second_connection_displaces_first() {
    let addr = start_authority().await;
    let (mut first, _) = registered(&addr, "1234", "dev-a").await;

    let (_second, reply) = registered(&addr, "1234", "dev-a").await;

    assert!(matches!(
        reply,
        ServerMessage::SessionRegistered {
            is_new: false,
            is_same_device: true,
            ..
        }
    ));
    assert!(matches!(
        recv(&mut first).await,
        ServerMessage::ForceLogout {
            reason: ForceLogoutReason::SameDevice,
            ..
        }
    ));
}

#[tokio::test]
async fn test_bad_pin_is_refused_and_holder_kept() {
    let addr = start_authority().await;
    let (mut a, _) = registered(&addr, "1234", "dev-a").await;

    let (_b, reply) = registered(&addr, "9999", "dev-b").await;

    assert_eq!(
        reply,
        ServerMessage::SessionError {
            message: "Invalid PIN".into()
        }
    );
    assert_quiet(&mut a).await;
}

#[tokio::test]
async fn test_concurrent_registrations_leave_one_holder() {
    let addr = start_authority().await;
    let mut a = connect(&addr).await;
    let mut b = connect(&addr).await;

    let (_, _) = tokio::join!(
        send(&mut a, register("5678", "dev-a")),
        send(&mut b, register("5678", "dev-b")),
    );

    // Both get a registration answer; exactly one is then logged out.
    assert!(matches!(recv(&mut a).await, ServerMessage::SessionRegistered { .. }));
    assert!(matches!(recv(&mut b).await, ServerMessage::SessionRegistered { .. }));

    let a_next = tokio::time::timeout(QUIET, a.next()).await.is_ok();
    let b_next = tokio::time::timeout(QUIET, b.next()).await.is_ok();
    assert!(a_next ^ b_next, "exactly one device should be logged out");
}

// =========================================================================
// Logout
// =========================================================================

#[tokio::test]
async fn test_manual_logout_frees_pin() {
    let addr = start_authority().await;
    let (mut a, _) = registered(&addr, "1234", "dev-a").await;

    send(
        &mut a,
        ClientMessage::ManualLogout {
            device_id: DeviceId::new("dev-a"),
        },
    )
    .await;
    assert_quiet(&mut a).await;

    let (_b, reply) = registered(&addr, "1234", "dev-b").await;
    assert!(matches!(
        reply,
        ServerMessage::SessionRegistered { is_new: true, .. }
    ));
}

#[tokio::test]
async fn test_manual_logout_from_non_holder_is_noop() {
    let addr = start_authority().await;
    let (mut a, _) = registered(&addr, "1234", "dev-a").await;

    let mut intruder = connect(&addr).await;
    send(
        &mut intruder,
        ClientMessage::ManualLogout {
            device_id: DeviceId::new("dev-a"),
        },
    )
    .await;
    assert_quiet(&mut intruder).await;

    // dev-a still holds the PIN.
    let (_b, reply) = registered(&addr, "1234", "dev-b").await;
    assert!(matches!(
        reply,
        ServerMessage::SessionRegistered { is_new: false, .. }
    ));
    assert!(matches!(recv(&mut a).await, ServerMessage::ForceLogout { .. }));
}

// =========================================================================
// Heartbeats and expiry
// =========================================================================

#[tokio::test]
async fn test_heartbeat_is_acked() {
    let addr = start_authority().await;
    let mut ws = connect(&addr).await;

    send(&mut ws, ClientMessage::Heartbeat {}).await;

    assert_eq!(recv(&mut ws).await, ServerMessage::HeartbeatAck {});
}

#[tokio::test]
async fn test_silent_holder_expires_and_frees_pin() {
    let config = SessionConfig {
        heartbeat_timeout: Duration::from_millis(300),
        ..SessionConfig::default()
    };
    let addr = start_with(config, Duration::from_millis(50)).await;
    let (_a, _) = registered(&addr, "1234", "dev-a").await;

    tokio::time::sleep(Duration::from_millis(600)).await;

    let (_b, reply) = registered(&addr, "1234", "dev-b").await;
    assert!(matches!(
        reply,
        ServerMessage::SessionRegistered { is_new: true, .. }
    ));
}

#[tokio::test]
async fn test_silent_holder_is_told_session_expired_before_close() {
    let config = SessionConfig {
        heartbeat_timeout: Duration::from_millis(300),
        ..SessionConfig::default()
    };
    let addr = start_with(config, Duration::from_millis(50)).await;
    let (mut a, _) = registered(&addr, "1234", "dev-a").await;

    assert_eq!(
        recv(&mut a).await,
        ServerMessage::ForceLogout {
            reason: ForceLogoutReason::SessionExpired,
            new_device_details: None,
        }
    );
    let next = tokio::time::timeout(Duration::from_secs(2), a.next())
        .await
        .expect("authority should close the connection");
    assert!(matches!(next, None | Some(Ok(Message::Close(_))) | Some(Err(_))));

    let (_b, reply) = registered(&addr, "1234", "dev-b").await;
    assert!(matches!(
        reply,
        ServerMessage::SessionRegistered { is_new: true, .. }
    ));
}

#[tokio::test]
async fn test_idle_holder_is_told_session_expired_without_sweeper() {
    let config = SessionConfig {
        heartbeat_timeout: Duration::from_millis(300),
        ..SessionConfig::default()
    };
    let addr = start_with(config, Duration::from_secs(60)).await;
    let (mut a, _) = registered(&addr, "1234", "dev-a").await;

    assert!(matches!(
        recv(&mut a).await,
        ServerMessage::ForceLogout {
            reason: ForceLogoutReason::SessionExpired,
            ..
        }
    ));
}

#[tokio::test]
async fn test_heartbeating_holder_is_kept() {
    let config = SessionConfig {
        heartbeat_timeout: Duration::from_millis(400),
        ..SessionConfig::default()
    };
    let addr = start_with(config, Duration::from_millis(50)).await;
    let (mut a, _) = registered(&addr, "1234", "dev-a").await;

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        send(&mut a, ClientMessage::Heartbeat {}).await;
        assert_eq!(recv(&mut a).await, ServerMessage::HeartbeatAck {});
    }

    let (_b, reply) = registered(&addr, "1234", "dev-b").await;
    assert!(matches!(
        reply,
        ServerMessage::SessionRegistered { is_new: false, .. }
    ));
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let config = SessionConfig {
        heartbeat_timeout: Duration::from_millis(200),
        ..SessionConfig::default()
    };
    let addr = start_with(config, Duration::from_secs(5)).await;
    let mut ws = connect(&addr).await;

    let next = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("authority should close the idle connection");
    assert!(matches!(next, None | Some(Ok(Message::Close(_))) | Some(Err(_))));
}

// =========================================================================
// One-shot verification and malformed input
// =========================================================================

#[tokio::test]
async fn test_verify_pin_answers_without_creating_session() {
    let addr = start_authority().await;
    let mut ws = connect(&addr).await;

    send(
        &mut ws,
        ClientMessage::VerifyPin {
            pin: Pin::parse("1234").unwrap(),
        },
    )
    .await;
    assert_eq!(
        recv(&mut ws).await,
        ServerMessage::PinVerification {
            valid: true,
            message: None
        }
    );

    send(
        &mut ws,
        ClientMessage::VerifyPin {
            pin: Pin::parse("0000").unwrap(),
        },
    )
    .await;
    assert_eq!(
        recv(&mut ws).await,
        ServerMessage::PinVerification {
            valid: false,
            message: Some("Invalid PIN".into())
        }
    );

    let (_a, reply) = registered(&addr, "1234", "dev-a").await;
    assert!(matches!(
        reply,
        ServerMessage::SessionRegistered { is_new: true, .. }
    ));
}

#[tokio::test]
async fn test_repeated_garbage_closes_connection() {
    let addr = start_authority().await;
    let mut ws = connect(&addr).await;

    for _ in 0..3 {
        ws.send(Message::Text("not an envelope".into()))
            .await
            .expect("send");
    }

    let next = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("authority should close the connection");
    assert!(matches!(next, None | Some(Ok(Message::Close(_))) | Some(Err(_))));
}

#[tokio::test]
async fn test_run_until_stops_accepting() {
    let authority = AuthorityBuilder::new()
        .bind("127.0.0.1:0")
        .build(FormatOnly)
        .await
        .expect("authority should build");
    let addr = authority.local_addr().unwrap().to_string();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

    let server = tokio::spawn(authority.run_until(async {
        let _ = stop_rx.await;
    }));
    stop_tx.send(()).unwrap();

    server.await.unwrap().expect("clean shutdown");
    let refused = tokio_tungstenite::connect_async(format!("ws://{addr}")).await;
    assert!(refused.is_err());
}

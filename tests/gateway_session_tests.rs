//! Gateway session behaviour over an in-memory transport.
//!
//! Time is paused, so heartbeat and reconnect timings are exact.

use async_trait::async_trait;
use cordkit::core::config::SendCap;
use cordkit::core::kernel::{TransportEvent, WsConnection, WsConnector, WsPeer};
use cordkit::gateway::protocol::build_status_update;
use cordkit::{ClientConfig, ClientError, DispatchEvent, EventName, Session, SessionState};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

/// Hands every new connection's far end to the test
struct MockConnector {
    peers: mpsc::UnboundedSender<WsPeer>,
    attempts: AtomicUsize,
}

#[async_trait]
impl WsConnector for MockConnector {
    async fn connect(&self, _url: &str) -> Result<WsConnection, ClientError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let (conn, peer) = WsConnection::pair(64);
        self.peers
            .send(peer)
            .map_err(|_| ClientError::NetworkError("test finished".to_string()))?;
        Ok(conn)
    }
}

fn config() -> ClientConfig {
    ClientConfig::new("tok")
        .gateway_url("ws://gateway.test")
        .exit_on_fatal_close(false)
}

async fn start(
    config: ClientConfig,
) -> (Session, mpsc::UnboundedReceiver<WsPeer>, Arc<MockConnector>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connector = Arc::new(MockConnector {
        peers: tx,
        attempts: AtomicUsize::new(0),
    });
    let mut session = Session::new(config).unwrap();
    session.connect_with(connector.clone()).await.unwrap();
    (session, rx, connector)
}

async fn server_send(peer: &WsPeer, frame: Value) {
    peer.events
        .send(TransportEvent::Text(frame.to_string()))
        .await
        .unwrap();
}

async fn hello(peer: &WsPeer, interval_ms: u64) {
    server_send(peer, json!({"op": 10, "d": {"heartbeat_interval": interval_ms}})).await;
}

async fn ready(peer: &WsPeer, seq: u64, session_id: &str) {
    server_send(
        peer,
        json!({
            "op": 0, "s": seq, "t": "READY",
            "d": {
                "v": 6,
                "user": {"id": "100", "username": "bot"},
                "private_channels": [],
                "guilds": [],
                "session_id": session_id,
            }
        }),
    )
    .await;
}

async fn dispatch(peer: &WsPeer, seq: u64, name: &str, data: Value) {
    server_send(peer, json!({"op": 0, "s": seq, "t": name, "d": data})).await;
}

async fn next_text(peer: &mut WsPeer) -> Value {
    match peer.sent.recv().await {
        Some(Message::Text(text)) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected a text frame, got {:?}", other),
    }
}

async fn wait_for_state(session: &Session, state: SessionState) {
    let mut status = session.watch_status().unwrap();
    while status.borrow_and_update().state != state {
        status.changed().await.unwrap();
    }
}

/// Run the handshake up to READY; returns the connection's far end
async fn establish(peers: &mut mpsc::UnboundedReceiver<WsPeer>, seq: u64) -> WsPeer {
    let mut peer = peers.recv().await.unwrap();
    hello(&peer, 1000).await;
    let identify = next_text(&mut peer).await;
    assert_eq!(identify["op"], 2);
    ready(&peer, seq, "abc").await;
    peer
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_cadence_carries_latest_sequence() {
    let (mut session, mut peers, _connector) = start(config()).await;
    let mut peer = establish(&mut peers, 1).await;
    let t0 = Instant::now();

    dispatch(&peer, 2, "TYPING_START", json!({})).await;
    assert_eq!(next_text(&mut peer).await, json!({"op": 1, "d": 2}));
    assert_eq!(t0.elapsed(), Duration::from_millis(1000));

    dispatch(&peer, 3, "TYPING_START", json!({})).await;
    assert_eq!(next_text(&mut peer).await, json!({"op": 1, "d": 3}));
    assert_eq!(t0.elapsed(), Duration::from_millis(2000));

    assert_eq!(next_text(&mut peer).await, json!({"op": 1, "d": 3}));
    assert_eq!(t0.elapsed(), Duration::from_millis(3000));

    session.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_identify_payload_matches_config() {
    let (mut session, mut peers, _connector) = start(config().shards(1, 3).compress(false)).await;
    let mut peer = peers.recv().await.unwrap();
    hello(&peer, 45000).await;

    let identify = next_text(&mut peer).await;
    assert_eq!(identify["op"], 2);
    assert_eq!(identify["d"]["token"], "tok");
    assert_eq!(identify["d"]["shard"], json!([1, 3]));
    assert_eq!(identify["d"]["compress"], false);
    assert_eq!(identify["d"]["large_threshold"], 50);

    session.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_recoverable_close_resumes_with_same_session_and_seq() {
    let (mut session, mut peers, connector) = start(config()).await;
    let peer = establish(&mut peers, 1).await;
    for seq in 2..=4 {
        dispatch(&peer, seq, "TYPING_START", json!({})).await;
    }
    peer.events
        .send(TransportEvent::Closed {
            code: Some(4000),
            reason: "unknown error".to_string(),
        })
        .await
        .unwrap();
    let closed_at = Instant::now();

    let mut peer = peers.recv().await.unwrap();
    // Reconnect waits one heartbeat interval
    assert_eq!(closed_at.elapsed(), Duration::from_millis(1000));
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);

    hello(&peer, 1000).await;
    assert_eq!(
        next_text(&mut peer).await,
        json!({"op": 6, "d": {"token": "tok", "session_id": "abc", "seq": 4}})
    );

    dispatch(&peer, 5, "RESUMED", json!({})).await;
    assert_eq!(next_text(&mut peer).await, json!({"op": 1, "d": 5}));
    let status = session.status().unwrap();
    assert_eq!(status.state, SessionState::Connected);
    assert_eq!(status.session_id.as_deref(), Some("abc"));

    session.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_fatal_close_does_not_reconnect() {
    let (mut session, mut peers, connector) = start(config()).await;
    let mut peer = peers.recv().await.unwrap();
    hello(&peer, 1000).await;
    next_text(&mut peer).await;

    peer.events
        .send(TransportEvent::Closed {
            code: Some(4010),
            reason: String::new(),
        })
        .await
        .unwrap();

    let result = session.wait().await;
    assert!(matches!(result, Err(ClientError::FatalClose { code: 4010, .. })));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(peers.try_recv().is_err());
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sequence_tracks_maximum() {
    let (mut session, mut peers, _connector) = start(config()).await;
    let mut peer = establish(&mut peers, 1).await;
    for seq in 2..=20 {
        dispatch(&peer, seq, "TYPING_START", json!({})).await;
    }

    assert_eq!(next_text(&mut peer).await, json!({"op": 1, "d": 20}));
    assert_eq!(session.status().unwrap().seq, Some(20));

    session.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_bad_frames_are_dropped_and_callbacks_fire_in_order() {
    let (tx, mut rx) = mpsc::unbounded_channel::<DispatchEvent>();
    let (mut session, mut peers, _connector) = {
        let (ptx, prx) = mpsc::unbounded_channel();
        let connector = Arc::new(MockConnector {
            peers: ptx,
            attempts: AtomicUsize::new(0),
        });
        let mut session = Session::new(config()).unwrap();
        session
            .set_callback("MESSAGE_CREATE", move |_ctx, event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event);
                }
            })
            .unwrap();
        session.connect_with(connector.clone()).await.unwrap();
        (session, prx, connector)
    };
    let peer = establish(&mut peers, 1).await;

    peer.events
        .send(TransportEvent::Text("{not json".to_string()))
        .await
        .unwrap();
    peer.events
        .send(TransportEvent::Binary(vec![0xde, 0xad]))
        .await
        .unwrap();
    server_send(&peer, json!({"op": 42, "d": null})).await;
    dispatch(&peer, 2, "SOMETHING_NEW", json!({})).await;
    for seq in 3..=5 {
        dispatch(
            &peer,
            seq,
            "MESSAGE_CREATE",
            json!({"id": format!("m{}", seq), "channel_id": "1", "content": "hi"}),
        )
        .await;
    }

    for seq in 3..=5 {
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, EventName::MessageCreate);
        assert_eq!(event.seq, Some(seq));
    }
    assert_eq!(session.status().unwrap().state, SessionState::Connected);

    session.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_ready_populates_cache() {
    let (mut session, mut peers, _connector) = start(config()).await;
    let mut peer = establish(&mut peers, 1).await;
    dispatch(
        &peer,
        2,
        "GUILD_CREATE",
        json!({"id": "9", "name": "guild", "channels": [{"id": "7", "type": 0}]}),
    )
    .await;
    // A heartbeat proves both frames were processed
    next_text(&mut peer).await;

    let cache = session.cache().read();
    assert_eq!(cache.user.as_ref().unwrap().id, "100");
    assert_eq!(cache.session_id.as_deref(), Some("abc"));
    assert!(cache.channel("7").is_some());
    drop(cache);

    session.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_outbound_commands_respect_send_cap() {
    let config = config().gateway_send(SendCap::new(2, Duration::from_secs(60)));
    let (mut session, mut peers, _connector) = start(config).await;

    // Not connected yet
    assert!(session
        .update_status("online", None, None, false)
        .await
        .is_err());

    let mut peer = establish(&mut peers, 1).await;
    wait_for_state(&session, SessionState::Connected).await;

    session
        .update_status("idle", Some(1), None, true)
        .await
        .unwrap();
    session.request_guild_members("9", "", 0).await.unwrap();
    let err = session
        .update_voice_state("9", Some("7"), false, false)
        .await
        .unwrap_err();
    assert!(err.is_rate_limited());

    let status_frame = next_text(&mut peer).await;
    assert_eq!(status_frame["op"], 3);
    assert_eq!(status_frame["d"]["status"], "idle");
    assert_eq!(next_text(&mut peer).await["op"], 8);

    session.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_opcode_resumes_immediately() {
    let (mut session, mut peers, _connector) = start(config()).await;
    let mut peer = establish(&mut peers, 3).await;
    server_send(&peer, json!({"op": 7, "d": null})).await;

    match peer.sent.recv().await {
        Some(Message::Close(Some(frame))) => assert_eq!(u16::from(frame.code), 4000),
        other => panic!("expected close frame, got {:?}", other),
    }

    let started = Instant::now();
    let mut peer = peers.recv().await.unwrap();
    assert_eq!(started.elapsed(), Duration::ZERO);
    hello(&peer, 1000).await;
    assert_eq!(
        next_text(&mut peer).await,
        json!({"op": 6, "d": {"token": "tok", "session_id": "abc", "seq": 3}})
    );

    session.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_invalid_session_sends_fresh_identify() {
    let (mut session, mut peers, _connector) = start(config()).await;
    let mut peer = establish(&mut peers, 3).await;
    server_send(&peer, json!({"op": 9, "d": false})).await;

    let identify = next_text(&mut peer).await;
    assert_eq!(identify["op"], 2);
    wait_for_state(&session, SessionState::Reidentifying).await;
    let status = session.status().unwrap();
    assert_eq!(status.seq, None);
    assert_eq!(status.session_id, None);

    session.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_closes_normally_without_reconnect() {
    let (mut session, mut peers, connector) = start(config()).await;
    let mut peer = establish(&mut peers, 1).await;

    session.disconnect().await.unwrap();
    match peer.sent.recv().await {
        Some(Message::Close(Some(frame))) => assert_eq!(u16::from(frame.code), 1000),
        other => panic!("expected close frame, got {:?}", other),
    }

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    assert!(session.status().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_fails_sends_from_pending_callbacks() {
    let (tx, mut rx) = mpsc::unbounded_channel::<Result<(), ClientError>>();
    let (ptx, mut peers) = mpsc::unbounded_channel();
    let connector = Arc::new(MockConnector {
        peers: ptx,
        attempts: AtomicUsize::new(0),
    });
    let mut session = Session::new(config()).unwrap();
    session
        .set_callback("TYPING_START", move |ctx, _event| {
            let tx = tx.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let result = ctx
                    .gateway
                    .send(build_status_update("idle", None, None, false))
                    .await;
                let _ = tx.send(result);
            }
        })
        .unwrap();
    session.connect_with(connector).await.unwrap();

    let peer = establish(&mut peers, 1).await;
    dispatch(&peer, 2, "TYPING_START", json!({})).await;
    let mut status = session.watch_status().unwrap();
    while status.borrow_and_update().seq != Some(2) {
        status.changed().await.unwrap();
    }

    // The callback is still sleeping when the session stops
    let stopped = tokio::time::timeout(Duration::from_secs(30), session.disconnect()).await;
    assert!(matches!(stopped, Ok(Ok(()))));
    assert!(matches!(rx.recv().await, Some(Err(ClientError::SessionClosed))));
}

//! Integration tests for the duel relay and client stack
//!
//! These tests bind a real relay to an ephemeral port and talk to it over
//! real WebSocket connections.

use duel_client::local_bus::LocalBus;
use duel_client::session::DuelSession;
use duel_client::transport::{ChannelEvent, DuelChannel, NoticeLink};
use duel_server::network::RelayServer;
use duel_server::registry::RoomRegistry;
use duel_shared::duel::{DuelStatus, Player, Question, QuestionOption, RoomState};
use duel_shared::protocol::{self, ClientFrame, ServerFrame, UserProfile};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ServerSide = WebSocketStream<TcpStream>;

/// RELAY PROTOCOL TESTS
mod relay_protocol_tests {
    use super::*;

    /// Tests that every connection is greeted before anything else
    #[tokio::test]
    async fn connected_greeting_arrives_first() {
        let (url, _registry) = start_relay().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .unwrap();

        match next_frame(&mut ws).await {
            ServerFrame::Connected { ts } => assert!(ts > 1_672_531_200_000),
            other => panic!("expected CONNECTED, got {:?}", other),
        }
    }

    /// Tests the HELLO handshake in presence mode
    #[tokio::test]
    async fn hello_with_user_acks_then_snapshots() {
        let (url, _registry) = start_relay().await;
        let mut ws = connect(&url).await;

        send_frame(&mut ws, &hello("alpha", Some("u1"))).await;

        assert_eq!(
            next_frame(&mut ws).await,
            ServerFrame::Ack {
                room: "alpha".to_string()
            }
        );
        match next_frame(&mut ws).await {
            ServerFrame::Snapshot { room, users } => {
                assert_eq!(room, "alpha");
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].id, "u1");
                assert!(!users[0].ready);
            }
            other => panic!("expected SNAPSHOT, got {:?}", other),
        }
    }

    /// Tests that a READY toggle reaches the whole roster
    #[tokio::test]
    async fn ready_flag_fans_out_in_roster() {
        let (url, _registry) = start_relay().await;
        let mut a = connect(&url).await;
        let mut b = connect(&url).await;
        join_with_user(&mut a, "alpha", "u1").await;
        join_with_user(&mut b, "alpha", "u2").await;
        // a also sees the roster grow to two.
        next_frame(&mut a).await;

        send_frame(&mut a, &ClientFrame::Ready { ready: true }).await;

        for ws in [&mut a, &mut b] {
            match next_frame(ws).await {
                ServerFrame::Snapshot { users, .. } => {
                    let u1 = users.iter().find(|u| u.id == "u1").unwrap();
                    assert!(u1.ready);
                    let u2 = users.iter().find(|u| u.id == "u2").unwrap();
                    assert!(!u2.ready);
                }
                other => panic!("expected SNAPSHOT, got {:?}", other),
            }
        }
    }

    /// Tests LEAVE notification and roster shrink
    #[tokio::test]
    async fn leave_notifies_the_room() {
        let (url, registry) = start_relay().await;
        let mut a = connect(&url).await;
        let mut b = connect(&url).await;
        join_with_user(&mut a, "alpha", "u1").await;
        join_with_user(&mut b, "alpha", "u2").await;
        next_frame(&mut a).await;

        send_frame(&mut a, &ClientFrame::Leave).await;

        assert_eq!(
            next_frame(&mut b).await,
            ServerFrame::Left {
                room: "alpha".to_string(),
                user_id: "u1".to_string(),
            }
        );
        match next_frame(&mut b).await {
            ServerFrame::Snapshot { users, .. } => {
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].id, "u2");
            }
            other => panic!("expected SNAPSHOT, got {:?}", other),
        }
        // The connection itself survives its LEAVE.
        send_frame(&mut a, &ClientFrame::Ping).await;
        assert_eq!(next_frame(&mut a).await, ServerFrame::Pong);
        assert_eq!(registry.read().await.len(), 2);
    }

    /// Tests the application-level ping
    #[tokio::test]
    async fn ping_answers_pong() {
        let (url, _registry) = start_relay().await;
        let mut ws = connect(&url).await;

        send_frame(&mut ws, &ClientFrame::Ping).await;

        assert_eq!(next_frame(&mut ws).await, ServerFrame::Pong);
    }

    /// Tests that EVENT broadcast excludes the sender and other rooms
    #[tokio::test]
    async fn events_stay_inside_their_room() {
        let (url, _registry) = start_relay().await;
        let mut a = connect(&url).await;
        let mut b = connect(&url).await;
        let mut c = connect(&url).await;
        join_plain(&mut a, "alpha").await;
        join_plain(&mut b, "alpha").await;
        join_plain(&mut c, "beta").await;

        let event = ClientFrame::Event {
            room: "alpha".to_string(),
            payload: json!({"n": 1}),
        };
        send_frame(&mut a, &event).await;

        assert_eq!(
            next_frame(&mut b).await,
            ServerFrame::Event {
                room: "alpha".to_string(),
                payload: json!({"n": 1}),
            }
        );
        expect_silence(&mut c, 300).await;
        expect_silence(&mut a, 300).await;
    }

    /// Tests directed notification across rooms
    #[tokio::test]
    async fn notify_crosses_rooms_by_user_id() {
        let (url, _registry) = start_relay().await;
        let mut a = connect(&url).await;
        let mut b = connect(&url).await;
        join_with_user(&mut a, "alpha", "u1").await;
        send_frame(
            &mut b,
            &ClientFrame::HelloUser {
                user: user_profile("u2"),
            },
        )
        .await;
        assert_eq!(next_frame(&mut b).await, ServerFrame::AckUser);

        send_frame(
            &mut a,
            &ClientFrame::Notify {
                to_user_id: "u2".to_string(),
                event: "DUEL_INVITE".to_string(),
                payload: json!({"room": "alpha"}),
            },
        )
        .await;

        let raw = next_text(&mut b).await;
        let (event, payload) = protocol::decode_notice(&raw).unwrap();
        assert_eq!(event, "DUEL_INVITE");
        assert_eq!(payload, json!({"room": "alpha"}));
    }

    /// Tests cleanup when a socket vanishes without LEAVE
    #[tokio::test]
    async fn dropped_socket_is_cleaned_up() {
        let (url, registry) = start_relay().await;
        let mut a = connect(&url).await;
        let mut b = connect(&url).await;
        join_with_user(&mut a, "alpha", "u1").await;
        join_with_user(&mut b, "alpha", "u2").await;
        next_frame(&mut a).await;

        drop(a);

        assert_eq!(
            next_frame(&mut b).await,
            ServerFrame::Left {
                room: "alpha".to_string(),
                user_id: "u1".to_string(),
            }
        );
        match next_frame(&mut b).await {
            ServerFrame::Snapshot { users, .. } => assert_eq!(users.len(), 1),
            other => panic!("expected SNAPSHOT, got {:?}", other),
        }
        // The LEFT broadcast happens under the same lock as the removal, so
        // observing it means the registry entry is gone.
        assert_eq!(registry.read().await.len(), 1);
    }

    /// Tests that malformed frames are dropped without harming the relay
    #[tokio::test]
    async fn malformed_frames_do_not_stop_the_relay() {
        let (url, _registry) = start_relay().await;
        let mut a = connect(&url).await;
        let mut b = connect(&url).await;
        join_plain(&mut a, "alpha").await;
        join_plain(&mut b, "alpha").await;

        for garbage in [
            "not json",
            "[1,2,3]",
            "42",
            "{}",
            "{\"type\":\"NO_SUCH_FRAME\"}",
            "{\"type\":\"READY\"}",
            "{\"type\":\"HELLO\"}",
        ] {
            a.send(Message::Text(garbage.to_string())).await.unwrap();
        }

        send_frame(&mut a, &ClientFrame::Ping).await;
        assert_eq!(next_frame(&mut a).await, ServerFrame::Pong);
        expect_silence(&mut b, 200).await;
    }
}

/// DUAL-CHANNEL TRANSPORT TESTS
mod transport_tests {
    use super::*;

    /// Tests FIFO queue flush through a handshake we deliberately stall
    #[tokio::test]
    async fn queued_sends_flush_in_order_after_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let bus = Arc::new(LocalBus::new());
        let channel = DuelChannel::open(Arc::clone(&bus), &url, "alpha", None).await;
        for n in 1..=3 {
            channel.send(json!({"n": n})).await.unwrap();
        }

        // Only now let the handshake finish.
        let (stream, _) = listener.accept().await.unwrap();
        let mut server_side = tokio_tungstenite::accept_async(stream).await.unwrap();

        match next_client_frame(&mut server_side).await {
            ClientFrame::Hello { room, user } => {
                assert_eq!(room, "alpha");
                assert!(user.is_none());
            }
            other => panic!("expected HELLO, got {:?}", other),
        }
        for n in 1..=3 {
            match next_client_frame(&mut server_side).await {
                ClientFrame::Event { room, payload } => {
                    assert_eq!(room, "alpha");
                    assert_eq!(payload, json!({"n": n}));
                }
                other => panic!("expected EVENT, got {:?}", other),
            }
        }

        let leftover = channel.close().await;
        assert!(leftover.is_empty());
    }

    /// Tests the lifecycle events a consumer observes on a fresh channel
    #[tokio::test]
    async fn channel_surfaces_relay_lifecycle_events() {
        let (url, _registry) = start_relay().await;
        let bus = Arc::new(LocalBus::new());
        let mut channel =
            DuelChannel::open(Arc::clone(&bus), &url, "alpha", Some(user_profile("u1"))).await;

        assert!(matches!(
            channel_event(&mut channel).await,
            ChannelEvent::Connected { .. }
        ));
        assert_eq!(
            channel_event(&mut channel).await,
            ChannelEvent::Ack {
                room: "alpha".to_string()
            }
        );
        match channel_event(&mut channel).await {
            ChannelEvent::Snapshot { room, users } => {
                assert_eq!(room, "alpha");
                assert_eq!(users.len(), 1);
            }
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    /// Tests payload exchange between two channels on different devices
    #[tokio::test]
    async fn channels_exchange_payloads_through_the_relay() {
        let (url, _registry) = start_relay().await;
        // Separate buses: nothing may arrive over the local path here.
        let bus_a = Arc::new(LocalBus::new());
        let bus_b = Arc::new(LocalBus::new());
        let mut a = DuelChannel::open(Arc::clone(&bus_a), &url, "alpha", None).await;
        let mut b = DuelChannel::open(Arc::clone(&bus_b), &url, "alpha", None).await;
        wait_for_ack(&mut a).await;
        wait_for_ack(&mut b).await;

        a.send(json!({"from": "a"})).await.unwrap();

        assert_eq!(next_channel_message(&mut b).await, json!({"from": "a"}));
    }

    /// Tests directed notifications end to end over NoticeLink
    #[tokio::test]
    async fn notice_link_delivers_directed_notifications() {
        let (url, _registry) = start_relay().await;
        let sender = NoticeLink::open(&url, user_profile("u1"));
        let mut receiver = NoticeLink::open(&url, user_profile("u2"));

        // The receiver must be registered before the notice is routed.
        loop {
            match timeout(Duration::from_secs(2), receiver.recv())
                .await
                .unwrap()
                .unwrap()
            {
                ChannelEvent::AckUser => break,
                _ => continue,
            }
        }

        sender
            .notify("u2", "DUEL_INVITE", json!({"room": "r9"}))
            .unwrap();

        loop {
            match timeout(Duration::from_secs(2), receiver.recv())
                .await
                .unwrap()
                .unwrap()
            {
                ChannelEvent::Notice { event, payload } => {
                    assert_eq!(event, "DUEL_INVITE");
                    assert_eq!(payload, json!({"room": "r9"}));
                    break;
                }
                _ => continue,
            }
        }
    }
}

/// DUEL END-TO-END TESTS
mod duel_flow_tests {
    use super::*;

    /// Tests a complete duel between two remote sessions over the relay
    #[tokio::test]
    async fn two_remote_sessions_play_a_duel_to_completion() {
        let (url, _registry) = start_relay().await;
        let bus_a = Arc::new(LocalBus::new());
        let bus_b = Arc::new(LocalBus::new());
        let channel_a =
            DuelChannel::open(Arc::clone(&bus_a), &url, "duel-e2e", Some(user_profile("p1"))).await;
        let channel_b =
            DuelChannel::open(Arc::clone(&bus_b), &url, "duel-e2e", Some(user_profile("p2"))).await;

        let session_a = DuelSession::new(
            channel_a,
            "duel-e2e",
            1,
            rotation(),
            Player::new("p1", "Ada"),
        );
        let session_b = DuelSession::new(
            channel_b,
            "duel-e2e",
            1,
            rotation(),
            Player::new("p2", "Grace"),
        );

        // p1 answers correctly, p2 does not.
        let (state_a, state_b) = tokio::join!(play(session_a, "a"), play(session_b, "b"));

        for state in [&state_a, &state_b] {
            assert_eq!(state.status, DuelStatus::Completed);
            assert_eq!(state.round_number, 1);
            assert_eq!(state.players["p1"].score, 3);
            assert_eq!(state.players["p2"].score, 0);
        }
    }
}

/// LIVENESS TESTS
mod liveness_tests {
    use super::*;

    /// Tests that a silent connection is pruned and its room is told
    #[tokio::test]
    async fn silent_peer_is_pruned_and_room_told() {
        let (url, registry) = start_relay().await;
        let mut lost = connect(&url).await;
        let mut survivor = connect(&url).await;
        join_with_user(&mut lost, "alpha", "u1").await;
        join_with_user(&mut survivor, "alpha", "u2").await;
        next_frame(&mut lost).await;

        // First sweep probes both; only the survivor produces traffic.
        duel_server::liveness::sweep(&registry).await;
        send_frame(&mut survivor, &ClientFrame::Ping).await;
        assert_eq!(next_frame(&mut survivor).await, ServerFrame::Pong);
        duel_server::liveness::sweep(&registry).await;

        assert_eq!(registry.read().await.len(), 1);

        // The pruned side is force-closed by the relay.
        let ended = timeout(Duration::from_secs(2), async {
            loop {
                match lost.next().await {
                    None | Some(Ok(Message::Close(_))) | Some(Err(_)) => break,
                    _ => continue,
                }
            }
        })
        .await;
        assert!(ended.is_ok(), "pruned socket was not closed");

        // The room hears about the departure like a clean leave.
        assert_eq!(
            next_frame(&mut survivor).await,
            ServerFrame::Left {
                room: "alpha".to_string(),
                user_id: "u1".to_string(),
            }
        );
        match next_frame(&mut survivor).await {
            ServerFrame::Snapshot { users, .. } => assert_eq!(users.len(), 1),
            other => panic!("expected SNAPSHOT, got {:?}", other),
        }
    }
}

/// STRESS AND ERROR HANDLING TESTS
mod stress_tests {
    use super::*;

    /// Tests that a burst of events arrives complete and in order
    #[tokio::test]
    async fn event_burst_keeps_order() {
        let (url, _registry) = start_relay().await;
        let mut a = connect(&url).await;
        let mut b = connect(&url).await;
        join_plain(&mut a, "burst").await;
        join_plain(&mut b, "burst").await;

        for n in 0..50 {
            let event = ClientFrame::Event {
                room: "burst".to_string(),
                payload: json!({"seq": n}),
            };
            send_frame(&mut a, &event).await;
        }

        for n in 0..50 {
            match next_frame(&mut b).await {
                ServerFrame::Event { payload, .. } => {
                    assert_eq!(payload, json!({"seq": n}));
                }
                other => panic!("expected EVENT, got {:?}", other),
            }
        }
    }

    /// Tests that one connection's garbage does not disturb its room
    #[tokio::test]
    async fn garbage_flood_leaves_neighbors_unharmed() {
        let (url, _registry) = start_relay().await;
        let mut a = connect(&url).await;
        let mut b = connect(&url).await;
        join_plain(&mut a, "alpha").await;
        join_plain(&mut b, "alpha").await;

        for n in 0..20 {
            a.send(Message::Text(format!("garbage #{}", n)))
                .await
                .unwrap();
        }
        let event = ClientFrame::Event {
            room: "alpha".to_string(),
            payload: json!({"ok": true}),
        };
        send_frame(&mut a, &event).await;

        match next_frame(&mut b).await {
            ServerFrame::Event { payload, .. } => assert_eq!(payload, json!({"ok": true})),
            other => panic!("expected EVENT, got {:?}", other),
        }
        expect_silence(&mut b, 200).await;
    }
}

// HELPER FUNCTIONS

/// Binds a relay on an ephemeral port and runs it in the background.
async fn start_relay() -> (String, Arc<RwLock<RoomRegistry>>) {
    let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", server.local_addr().unwrap());
    let registry = server.registry();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    (url, registry)
}

/// Connects and swallows the CONNECTED greeting.
async fn connect(url: &str) -> Socket {
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    match next_frame(&mut ws).await {
        ServerFrame::Connected { .. } => ws,
        other => panic!("expected CONNECTED greeting, got {:?}", other),
    }
}

fn user_profile(id: &str) -> UserProfile {
    UserProfile {
        id: id.to_string(),
        name: id.to_uppercase(),
    }
}

fn hello(room: &str, user_id: Option<&str>) -> ClientFrame {
    ClientFrame::Hello {
        room: room.to_string(),
        user: user_id.map(user_profile),
    }
}

/// HELLO without identity; consumes the ACK.
async fn join_plain(ws: &mut Socket, room: &str) {
    send_frame(ws, &hello(room, None)).await;
    assert!(matches!(next_frame(ws).await, ServerFrame::Ack { .. }));
}

/// HELLO with identity; consumes the ACK and the roster snapshot.
async fn join_with_user(ws: &mut Socket, room: &str, user_id: &str) {
    send_frame(ws, &hello(room, Some(user_id))).await;
    assert!(matches!(next_frame(ws).await, ServerFrame::Ack { .. }));
    assert!(matches!(next_frame(ws).await, ServerFrame::Snapshot { .. }));
}

async fn send_frame(ws: &mut Socket, frame: &ClientFrame) {
    ws.send(Message::Text(frame.encode())).await.unwrap();
}

/// Next decodable protocol frame, skipping transport-level ping traffic.
async fn next_frame(ws: &mut Socket) -> ServerFrame {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket ended")
            .unwrap();
        if let Message::Text(text) = msg {
            if let Some(frame) = protocol::decode_server_frame(&text) {
                return frame;
            }
        }
    }
}

/// Next raw text frame, for deliveries outside the closed frame set.
async fn next_text(ws: &mut Socket) -> String {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket ended")
            .unwrap();
        if let Message::Text(text) = msg {
            return text;
        }
    }
}

async fn next_client_frame(ws: &mut ServerSide) -> ClientFrame {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket ended")
            .unwrap();
        if let Message::Text(text) = msg {
            if let Some(frame) = protocol::decode_client_frame(&text) {
                return frame;
            }
        }
    }
}

/// Asserts that no text frame shows up within the window.
async fn expect_silence(ws: &mut Socket, ms: u64) {
    let outcome = timeout(Duration::from_millis(ms), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return Some(text),
                Some(Ok(_)) => continue,
                _ => return None,
            }
        }
    })
    .await;
    if let Ok(Some(text)) = outcome {
        panic!("expected silence, got {}", text);
    }
}

async fn channel_event(channel: &mut DuelChannel) -> ChannelEvent {
    timeout(Duration::from_secs(2), channel.recv())
        .await
        .expect("timed out waiting for a channel event")
        .expect("channel ended")
}

async fn wait_for_ack(channel: &mut DuelChannel) {
    loop {
        if let ChannelEvent::Ack { .. } = channel_event(channel).await {
            return;
        }
    }
}

async fn next_channel_message(channel: &mut DuelChannel) -> Value {
    loop {
        if let ChannelEvent::Message(payload) = channel_event(channel).await {
            return payload;
        }
    }
}

fn rotation() -> Vec<Question> {
    vec![Question {
        id: "q1".to_string(),
        stem: "stem q1".to_string(),
        options: ["a", "b", "c"]
            .iter()
            .map(|o| QuestionOption {
                id: o.to_string(),
                text: o.to_uppercase(),
            })
            .collect(),
        correct_option_id: "a".to_string(),
        time_limit_seconds: 5,
    }]
}

/// Readies up, answers every round with `option`, and plays to completion.
async fn play(mut session: DuelSession, option: &str) -> RoomState {
    session.set_ready(true).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while session.state().status != DuelStatus::Completed
        && tokio::time::Instant::now() < deadline
    {
        if session.state().status == DuelStatus::Active && unanswered(&session) {
            session.pick(option).await.unwrap();
            session.confirm().await.unwrap();
            continue;
        }
        match timeout(Duration::from_millis(250), session.step()).await {
            Ok(Ok(true)) => {}
            Ok(_) => break,
            Err(_) => {}
        }
    }
    let state = session.state().clone();
    session.close().await;
    state
}

fn unanswered(session: &DuelSession) -> bool {
    session
        .my_player()
        .map_or(false, |p| p.answered_at_ms.is_none())
}

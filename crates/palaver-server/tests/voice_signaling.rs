//! End-to-end signaling tests.
//!
//! Each test boots the real axum app on an ephemeral port with in-memory
//! stores and drives it over WebSocket, asserting on the ServerMessage
//! sequences clients observe.
//!
//! Run with: cargo test -p palaver-server --test voice_signaling

use futures_util::{SinkExt, StreamExt};
use palaver_protocol::{
    ChannelType, ClientMessage, ErrorKind, GamepadState, Role, ServerMessage,
    VoiceSessionEndReason, VoiceStatePatch,
};
use palaver_server::state::Config;
use palaver_server::stores::{MemoryCommunityStore, MemoryMessageStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use uuid::Uuid;

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const JWT_SECRET: &str = "test-secret-key-for-testing-only";

/// Seeded world: one community with an owner, an admin and three members,
/// two voice channels and a text channel.
struct Fixture {
    #[allow(dead_code)]
    community: Uuid,
    owner: Uuid,
    admin: Uuid,
    alpha: Uuid,
    beta: Uuid,
    gamma: Uuid,
    voice1: Uuid,
    voice2: Uuid,
    text: Uuid,
}

struct TestServer {
    addr: std::net::SocketAddr,
    fixture: Fixture,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    async fn start() -> anyhow::Result<Self> {
        let communities = Arc::new(MemoryCommunityStore::new());
        let messages = Arc::new(MemoryMessageStore::new());

        let community = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let admin = Uuid::new_v4();
        let alpha = Uuid::new_v4();
        let beta = Uuid::new_v4();
        let gamma = Uuid::new_v4();

        communities.add_community(community, owner);
        communities.add_member(community, admin, Role::Admin);
        communities.add_member(community, alpha, Role::Member);
        communities.add_member(community, beta, Role::Member);
        communities.add_member(community, gamma, Role::Member);
        let voice1 = communities.add_channel(community, "Voice One", ChannelType::Voice);
        let voice2 = communities.add_channel(community, "Voice Two", ChannelType::Voice);
        let text = communities.add_channel(community, "general", ChannelType::Text);

        let config = Config {
            bind_address: "127.0.0.1:0".to_string(),
            jwt_secret: JWT_SECRET.to_string(),
            stun_servers: vec![],
            turn_servers: vec![],
            // Keep the watchdog out of the way; tests never complete ICE.
            ice_connect_timeout: Duration::from_secs(300),
        };

        let (router, _state) = palaver_server::create_app(config, communities, messages)?;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .ok();
        });

        Ok(Self {
            addr,
            fixture: Fixture {
                community,
                owner,
                admin,
                alpha,
                beta,
                gamma,
                voice1,
                voice2,
                text,
            },
            shutdown_tx: Some(shutdown_tx),
        })
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Connect a WebSocket and authenticate as the given user.
async fn connect(server: &TestServer, user_id: Uuid, name: &str) -> WsClient {
    let token = palaver_server::auth::create_token(user_id, name, JWT_SECRET).unwrap();
    let (mut ws, _) = connect_async(server.ws_url()).await.expect("ws connect");

    send(&mut ws, &ClientMessage::Authenticate { token }).await;
    let reply = recv_matching(&mut ws, |m| {
        matches!(m, ServerMessage::Authenticated { .. } | ServerMessage::Error { .. })
    })
    .await;
    match reply {
        ServerMessage::Authenticated { .. } => ws,
        other => panic!("authentication failed: {:?}", other),
    }
}

async fn send(ws: &mut WsClient, message: &ClientMessage) {
    ws.send(Message::Text(
        serde_json::to_string(message).unwrap().into(),
    ))
    .await
    .expect("ws send");
}

/// Read messages until one matches the predicate, skipping the rest
/// (presence chatter, ICE candidates). Panics after five seconds.
async fn recv_matching<F>(ws: &mut WsClient, pred: F) -> ServerMessage
where
    F: Fn(&ServerMessage) -> bool,
{
    let deadline = Duration::from_secs(5);
    timeout(deadline, async {
        loop {
            let frame = ws.next().await.expect("stream ended").expect("ws error");
            if let Message::Text(text) = frame {
                let message: ServerMessage = serde_json::from_str(&text).expect("parse");
                if pred(&message) {
                    return message;
                }
            }
        }
    })
    .await
    .expect("timed out waiting for message")
}

/// Read and collect every message until one matches the stop predicate
/// (inclusive). Panics after five seconds.
async fn collect_until<F>(ws: &mut WsClient, stop: F) -> Vec<ServerMessage>
where
    F: Fn(&ServerMessage) -> bool,
{
    let deadline = Duration::from_secs(5);
    timeout(deadline, async {
        let mut seen = vec![];
        loop {
            let frame = ws.next().await.expect("stream ended").expect("ws error");
            if let Message::Text(text) = frame {
                let message: ServerMessage = serde_json::from_str(&text).expect("parse");
                let done = stop(&message);
                seen.push(message);
                if done {
                    return seen;
                }
            }
        }
    })
    .await
    .expect("timed out collecting messages")
}

/// Assert that nothing matching the predicate arrives within a short window.
async fn expect_none_matching<F>(ws: &mut WsClient, pred: F)
where
    F: Fn(&ServerMessage) -> bool,
{
    let window = Duration::from_millis(400);
    let result = timeout(window, async {
        loop {
            let frame = ws.next().await.expect("stream ended").expect("ws error");
            if let Message::Text(text) = frame {
                let message: ServerMessage = serde_json::from_str(&text).expect("parse");
                if pred(&message) {
                    return message;
                }
            }
        }
    })
    .await;
    if let Ok(message) = result {
        panic!("unexpected message: {:?}", message);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn join_voice_sends_offer_and_announces_participant() {
    let server = TestServer::start().await.unwrap();
    let f = &server.fixture;

    let mut observer = connect(&server, f.owner, "owner").await;
    let mut alpha = connect(&server, f.alpha, "alpha").await;

    send(
        &mut alpha,
        &ClientMessage::JoinVoiceChannel {
            channel_id: f.voice1,
        },
    )
    .await;

    // The joining connection gets the server's offer with real m-lines.
    let offer = recv_matching(&mut alpha, |m| matches!(m, ServerMessage::SfuOffer { .. })).await;
    match offer {
        ServerMessage::SfuOffer { channel_id, sdp } => {
            assert_eq!(channel_id, f.voice1);
            assert!(sdp.contains("m=audio"), "offer has no audio m-line");
            assert!(sdp.contains("m=video"), "offer has no video m-line");
        }
        _ => unreachable!(),
    }

    // ...followed by the (empty) SSRC snapshot.
    let batch = recv_matching(&mut alpha, |m| {
        matches!(m, ServerMessage::SsrcMappingsBatch { .. })
    })
    .await;
    match batch {
        ServerMessage::SsrcMappingsBatch {
            channel_id,
            mappings,
        } => {
            assert_eq!(channel_id, f.voice1);
            assert!(mappings.is_empty());
        }
        _ => unreachable!(),
    }

    // A community member not in voice still sees the roster change.
    let joined = recv_matching(&mut observer, |m| {
        matches!(m, ServerMessage::VoiceParticipantJoined { .. })
    })
    .await;
    match joined {
        ServerMessage::VoiceParticipantJoined {
            channel_id,
            participant,
        } => {
            assert_eq!(channel_id, f.voice1);
            assert_eq!(participant.user_id, f.alpha);
            assert!(!participant.is_muted);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn second_device_join_displaces_first_with_leave_before_join() {
    let server = TestServer::start().await.unwrap();
    let f = &server.fixture;

    let mut observer = connect(&server, f.owner, "owner").await;
    let mut device_a = connect(&server, f.alpha, "alpha").await;
    let mut device_b = connect(&server, f.alpha, "alpha").await;

    send(
        &mut device_a,
        &ClientMessage::JoinVoiceChannel {
            channel_id: f.voice1,
        },
    )
    .await;
    recv_matching(&mut observer, |m| {
        matches!(m, ServerMessage::VoiceParticipantJoined { .. })
    })
    .await;

    send(
        &mut device_b,
        &ClientMessage::JoinVoiceChannel {
            channel_id: f.voice2,
        },
    )
    .await;

    // The displaced device is told exactly which channel it lost.
    let displaced = recv_matching(&mut device_a, |m| {
        matches!(m, ServerMessage::DisplacedByAnotherDevice { .. })
    })
    .await;
    match displaced {
        ServerMessage::DisplacedByAnotherDevice { channel_id } => {
            assert_eq!(channel_id, f.voice1);
        }
        _ => unreachable!(),
    }

    // Third parties observe the old membership end strictly before the new
    // one begins.
    let seen = collect_until(&mut observer, |m| {
        matches!(m, ServerMessage::VoiceParticipantJoined { channel_id, .. } if *channel_id == f.voice2)
    })
    .await;
    let left_at = seen.iter().position(|m| {
        matches!(m, ServerMessage::VoiceParticipantLeft { channel_id, user_id }
            if *channel_id == f.voice1 && *user_id == f.alpha)
    });
    let joined_at = seen.len() - 1;
    let left_at = left_at.expect("no VoiceParticipantLeft for the old channel");
    assert!(left_at < joined_at, "leave must precede join");

    // The roster never holds the user twice.
    let joins = seen
        .iter()
        .filter(|m| matches!(m, ServerMessage::VoiceParticipantJoined { .. }))
        .count();
    assert_eq!(joins, 1);
}

#[tokio::test]
async fn server_mute_blocks_self_unmute_until_lifted() {
    let server = TestServer::start().await.unwrap();
    let f = &server.fixture;

    let mut owner = connect(&server, f.owner, "owner").await;
    let mut beta = connect(&server, f.beta, "beta").await;

    send(
        &mut beta,
        &ClientMessage::JoinVoiceChannel {
            channel_id: f.voice1,
        },
    )
    .await;
    recv_matching(&mut owner, |m| {
        matches!(m, ServerMessage::VoiceParticipantJoined { .. })
    })
    .await;

    send(
        &mut owner,
        &ClientMessage::ServerMuteUser {
            channel_id: f.voice1,
            target_user_id: f.beta,
            value: true,
        },
    )
    .await;
    let muted = recv_matching(&mut owner, |m| {
        matches!(m, ServerMessage::ServerVoiceStateChanged { .. })
    })
    .await;
    match muted {
        ServerMessage::ServerVoiceStateChanged { participant, .. } => {
            assert!(participant.is_server_muted);
            assert!(participant.is_muted);
        }
        _ => unreachable!(),
    }

    // The muted member tries to lift it: typed rejection, no broadcast.
    send(
        &mut beta,
        &ClientMessage::UpdateVoiceState {
            channel_id: f.voice1,
            patch: VoiceStatePatch {
                is_muted: Some(false),
                ..Default::default()
            },
        },
    )
    .await;
    let error = recv_matching(&mut beta, |m| matches!(m, ServerMessage::Error { .. })).await;
    match error {
        ServerMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::Forbidden),
        _ => unreachable!(),
    }
    expect_none_matching(&mut owner, |m| {
        matches!(m, ServerMessage::VoiceStateChanged { .. })
    })
    .await;

    // The owner lifts the server mute; now the self-update goes through.
    send(
        &mut owner,
        &ClientMessage::ServerMuteUser {
            channel_id: f.voice1,
            target_user_id: f.beta,
            value: false,
        },
    )
    .await;
    recv_matching(&mut owner, |m| {
        matches!(m, ServerMessage::ServerVoiceStateChanged { .. })
    })
    .await;

    send(
        &mut beta,
        &ClientMessage::UpdateVoiceState {
            channel_id: f.voice1,
            patch: VoiceStatePatch {
                is_muted: Some(false),
                ..Default::default()
            },
        },
    )
    .await;
    let changed = recv_matching(&mut owner, |m| {
        matches!(m, ServerMessage::VoiceStateChanged { .. })
    })
    .await;
    match changed {
        ServerMessage::VoiceStateChanged { participant, .. } => {
            assert_eq!(participant.user_id, f.beta);
            assert!(!participant.is_muted);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn server_deafen_sets_both_flags() {
    let server = TestServer::start().await.unwrap();
    let f = &server.fixture;

    let mut owner = connect(&server, f.owner, "owner").await;
    let mut gamma = connect(&server, f.gamma, "gamma").await;

    send(
        &mut gamma,
        &ClientMessage::JoinVoiceChannel {
            channel_id: f.voice1,
        },
    )
    .await;
    recv_matching(&mut owner, |m| {
        matches!(m, ServerMessage::VoiceParticipantJoined { .. })
    })
    .await;

    send(
        &mut owner,
        &ClientMessage::ServerDeafenUser {
            channel_id: f.voice1,
            target_user_id: f.gamma,
            value: true,
        },
    )
    .await;
    let changed = recv_matching(&mut owner, |m| {
        matches!(m, ServerMessage::ServerVoiceStateChanged { .. })
    })
    .await;
    match changed {
        ServerMessage::ServerVoiceStateChanged { participant, .. } => {
            assert!(participant.is_server_deafened);
            assert!(participant.is_server_muted);
            assert!(participant.is_deafened);
            assert!(participant.is_muted);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn members_cannot_server_moderate() {
    let server = TestServer::start().await.unwrap();
    let f = &server.fixture;

    let mut beta = connect(&server, f.beta, "beta").await;
    let mut gamma = connect(&server, f.gamma, "gamma").await;

    send(
        &mut gamma,
        &ClientMessage::JoinVoiceChannel {
            channel_id: f.voice1,
        },
    )
    .await;
    recv_matching(&mut gamma, |m| matches!(m, ServerMessage::SfuOffer { .. })).await;

    send(
        &mut beta,
        &ClientMessage::ServerMuteUser {
            channel_id: f.voice1,
            target_user_id: f.gamma,
            value: true,
        },
    )
    .await;
    let error = recv_matching(&mut beta, |m| matches!(m, ServerMessage::Error { .. })).await;
    match error {
        ServerMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::Forbidden),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn admin_move_announces_leave_then_join_and_reoffers() {
    let server = TestServer::start().await.unwrap();
    let f = &server.fixture;

    let mut observer = connect(&server, f.owner, "owner").await;
    let mut admin = connect(&server, f.admin, "admin").await;
    let mut alpha = connect(&server, f.alpha, "alpha").await;

    send(
        &mut alpha,
        &ClientMessage::JoinVoiceChannel {
            channel_id: f.voice1,
        },
    )
    .await;
    recv_matching(&mut observer, |m| {
        matches!(m, ServerMessage::VoiceParticipantJoined { .. })
    })
    .await;
    // Consume alpha's own join traffic up to the first offer.
    recv_matching(&mut alpha, |m| matches!(m, ServerMessage::SfuOffer { .. })).await;

    send(
        &mut admin,
        &ClientMessage::MoveUser {
            target_user_id: f.alpha,
            to_channel_id: f.voice2,
        },
    )
    .await;

    let seen = collect_until(&mut observer, |m| {
        matches!(m, ServerMessage::VoiceParticipantJoined { channel_id, .. } if *channel_id == f.voice2)
    })
    .await;
    let left_at = seen
        .iter()
        .position(|m| {
            matches!(m, ServerMessage::VoiceParticipantLeft { channel_id, user_id }
                if *channel_id == f.voice1 && *user_id == f.alpha)
        })
        .expect("no leave for the source channel");
    assert!(left_at < seen.len() - 1, "leave must precede join");

    // The moved client hears about it and gets fresh media for the new room.
    let moved = recv_matching(&mut alpha, |m| matches!(m, ServerMessage::UserMoved { .. })).await;
    match moved {
        ServerMessage::UserMoved {
            user_id,
            from_channel_id,
            to_channel_id,
        } => {
            assert_eq!(user_id, f.alpha);
            assert_eq!(from_channel_id, f.voice1);
            assert_eq!(to_channel_id, f.voice2);
        }
        _ => unreachable!(),
    }
    let offer = recv_matching(&mut alpha, |m| matches!(m, ServerMessage::SfuOffer { .. })).await;
    match offer {
        ServerMessage::SfuOffer { channel_id, .. } => assert_eq!(channel_id, f.voice2),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn voice_connection_drop_cleans_up_exactly_once() {
    let server = TestServer::start().await.unwrap();
    let f = &server.fixture;

    let mut observer = connect(&server, f.owner, "owner").await;
    let mut voice_device = connect(&server, f.alpha, "alpha").await;
    let mut other_device = connect(&server, f.alpha, "alpha").await;

    send(
        &mut voice_device,
        &ClientMessage::JoinVoiceChannel {
            channel_id: f.voice1,
        },
    )
    .await;
    recv_matching(&mut observer, |m| {
        matches!(m, ServerMessage::VoiceParticipantJoined { .. })
    })
    .await;
    // The second device is told voice is active elsewhere on connect or via
    // roster broadcasts; drain its backlog before the drop.
    recv_matching(&mut other_device, |m| {
        matches!(m, ServerMessage::VoiceParticipantJoined { .. })
    })
    .await;

    // Ungraceful drop of the voice connection.
    drop(voice_device);

    let left = recv_matching(&mut observer, |m| {
        matches!(m, ServerMessage::VoiceParticipantLeft { .. })
    })
    .await;
    match left {
        ServerMessage::VoiceParticipantLeft {
            channel_id,
            user_id,
        } => {
            assert_eq!(channel_id, f.voice1);
            assert_eq!(user_id, f.alpha);
        }
        _ => unreachable!(),
    }
    // Exactly once: no second leave follows.
    expect_none_matching(&mut observer, |m| {
        matches!(m, ServerMessage::VoiceParticipantLeft { .. })
    })
    .await;

    // The user's surviving device learns why the session ended.
    let ended = recv_matching(&mut other_device, |m| {
        matches!(m, ServerMessage::VoiceSessionEnded { .. })
    })
    .await;
    match ended {
        ServerMessage::VoiceSessionEnded { reason } => {
            assert_eq!(reason, VoiceSessionEndReason::DeviceDisconnected);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn controller_passthrough_lifecycle_and_host_leave() {
    let server = TestServer::start().await.unwrap();
    let f = &server.fixture;

    let mut host = connect(&server, f.alpha, "alpha").await;
    let mut guest = connect(&server, f.beta, "beta").await;

    send(
        &mut host,
        &ClientMessage::JoinVoiceChannel {
            channel_id: f.voice1,
        },
    )
    .await;
    send(
        &mut guest,
        &ClientMessage::JoinVoiceChannel {
            channel_id: f.voice1,
        },
    )
    .await;
    recv_matching(&mut host, |m| matches!(m, ServerMessage::SfuOffer { .. })).await;
    recv_matching(&mut guest, |m| matches!(m, ServerMessage::SfuOffer { .. })).await;

    // request -> accept(slot 0)
    send(
        &mut guest,
        &ClientMessage::RequestControllerAccess {
            channel_id: f.voice1,
            host_user_id: f.alpha,
        },
    )
    .await;
    let requested = recv_matching(&mut host, |m| {
        matches!(m, ServerMessage::ControllerAccessRequested { .. })
    })
    .await;
    match requested {
        ServerMessage::ControllerAccessRequested { guest_user_id, .. } => {
            assert_eq!(guest_user_id, f.beta);
        }
        _ => unreachable!(),
    }

    send(
        &mut host,
        &ClientMessage::AcceptControllerAccess {
            channel_id: f.voice1,
            guest_user_id: f.beta,
            slot: 0,
        },
    )
    .await;
    let accepted = recv_matching(&mut guest, |m| {
        matches!(m, ServerMessage::ControllerAccessAccepted { .. })
    })
    .await;
    match accepted {
        ServerMessage::ControllerAccessAccepted { slot, .. } => assert_eq!(slot, 0),
        _ => unreachable!(),
    }

    // Gamepad state reaches the host's voice connection.
    send(
        &mut guest,
        &ClientMessage::SendControllerState {
            channel_id: f.voice1,
            host_user_id: f.alpha,
            state: GamepadState {
                buttons: 0b1010,
                ..Default::default()
            },
        },
    )
    .await;
    let received = recv_matching(&mut host, |m| {
        matches!(m, ServerMessage::ControllerStateReceived { .. })
    })
    .await;
    match received {
        ServerMessage::ControllerStateReceived {
            guest_user_id,
            slot,
            state,
            ..
        } => {
            assert_eq!(guest_user_id, f.beta);
            assert_eq!(slot, 0);
            assert_eq!(state.buttons, 0b1010);
        }
        _ => unreachable!(),
    }

    // Host leaves: the pairing collapses and the guest is told exactly once.
    send(
        &mut host,
        &ClientMessage::LeaveVoiceChannel {
            channel_id: f.voice1,
        },
    )
    .await;
    let stopped = recv_matching(&mut guest, |m| {
        matches!(m, ServerMessage::ControllerAccessStopped { .. })
    })
    .await;
    match stopped {
        ServerMessage::ControllerAccessStopped { reason, .. } => {
            assert_eq!(
                reason,
                palaver_protocol::ControllerStopReason::HostLeft
            );
        }
        _ => unreachable!(),
    }
    expect_none_matching(&mut guest, |m| {
        matches!(m, ServerMessage::ControllerAccessStopped { .. })
    })
    .await;

    // Stale gamepad state after the collapse: no error, no forwarding.
    send(
        &mut guest,
        &ClientMessage::SendControllerState {
            channel_id: f.voice1,
            host_user_id: f.alpha,
            state: GamepadState::default(),
        },
    )
    .await;
    expect_none_matching(&mut guest, |m| matches!(m, ServerMessage::Error { .. })).await;
    expect_none_matching(&mut host, |m| {
        matches!(m, ServerMessage::ControllerStateReceived { .. })
    })
    .await;
}

#[tokio::test]
async fn watching_requires_voice_participation() {
    let server = TestServer::start().await.unwrap();
    let f = &server.fixture;

    let mut alpha = connect(&server, f.alpha, "alpha").await;
    let mut gamma = connect(&server, f.gamma, "gamma").await;

    send(
        &mut alpha,
        &ClientMessage::JoinVoiceChannel {
            channel_id: f.voice1,
        },
    )
    .await;
    recv_matching(&mut alpha, |m| matches!(m, ServerMessage::SfuOffer { .. })).await;

    // gamma is connected but not in voice.
    send(
        &mut gamma,
        &ClientMessage::WatchScreenShare {
            channel_id: f.voice1,
            streamer_user_id: f.alpha,
        },
    )
    .await;
    let error = recv_matching(&mut gamma, |m| matches!(m, ServerMessage::Error { .. })).await;
    match error {
        ServerMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::Forbidden),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn screen_share_stop_emits_stream_stopped() {
    let server = TestServer::start().await.unwrap();
    let f = &server.fixture;

    let mut observer = connect(&server, f.owner, "owner").await;
    let mut alpha = connect(&server, f.alpha, "alpha").await;

    send(
        &mut alpha,
        &ClientMessage::JoinVoiceChannel {
            channel_id: f.voice1,
        },
    )
    .await;
    recv_matching(&mut observer, |m| {
        matches!(m, ServerMessage::VoiceParticipantJoined { .. })
    })
    .await;

    send(
        &mut alpha,
        &ClientMessage::UpdateVoiceState {
            channel_id: f.voice1,
            patch: VoiceStatePatch {
                is_screen_sharing: Some(true),
                screen_share_has_audio: Some(true),
                ..Default::default()
            },
        },
    )
    .await;
    let started = recv_matching(&mut observer, |m| {
        matches!(m, ServerMessage::VideoStreamStarted { .. })
    })
    .await;
    match started {
        ServerMessage::VideoStreamStarted { kind, user_id, .. } => {
            assert_eq!(kind, palaver_protocol::VideoKind::ScreenShare);
            assert_eq!(user_id, f.alpha);
        }
        _ => unreachable!(),
    }

    send(
        &mut alpha,
        &ClientMessage::UpdateVoiceState {
            channel_id: f.voice1,
            patch: VoiceStatePatch {
                is_screen_sharing: Some(false),
                ..Default::default()
            },
        },
    )
    .await;
    let stopped = recv_matching(&mut observer, |m| {
        matches!(m, ServerMessage::VideoStreamStopped { .. })
    })
    .await;
    match stopped {
        ServerMessage::VideoStreamStopped { kind, .. } => {
            assert_eq!(kind, palaver_protocol::VideoKind::ScreenShare);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn presence_transitions_emit_once_per_edge() {
    let server = TestServer::start().await.unwrap();
    let f = &server.fixture;

    let mut observer = connect(&server, f.owner, "owner").await;

    let first = connect(&server, f.alpha, "alpha").await;
    let online = recv_matching(&mut observer, |m| {
        matches!(m, ServerMessage::UserOnline { user_id } if *user_id == f.alpha)
    })
    .await;
    assert!(matches!(online, ServerMessage::UserOnline { .. }));

    // A second connection of the same user is not a new online edge.
    let second = connect(&server, f.alpha, "alpha").await;
    expect_none_matching(&mut observer, |m| {
        matches!(m, ServerMessage::UserOnline { user_id } if *user_id == f.alpha)
    })
    .await;

    // Closing one of two connections is not an offline edge.
    drop(second);
    expect_none_matching(&mut observer, |m| {
        matches!(m, ServerMessage::UserOffline { user_id } if *user_id == f.alpha)
    })
    .await;

    // Closing the last one is.
    drop(first);
    recv_matching(&mut observer, |m| {
        matches!(m, ServerMessage::UserOffline { user_id } if *user_id == f.alpha)
    })
    .await;
}

#[tokio::test]
async fn sfu_answer_without_session_is_bad_state() {
    let server = TestServer::start().await.unwrap();
    let f = &server.fixture;

    let mut alpha = connect(&server, f.alpha, "alpha").await;
    send(
        &mut alpha,
        &ClientMessage::SendSfuAnswer {
            channel_id: f.voice1,
            sdp: "v=0".to_string(),
        },
    )
    .await;
    let error = recv_matching(&mut alpha, |m| matches!(m, ServerMessage::Error { .. })).await;
    match error {
        ServerMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::BadState),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn joining_a_text_channel_for_voice_is_not_found() {
    let server = TestServer::start().await.unwrap();
    let f = &server.fixture;

    let mut alpha = connect(&server, f.alpha, "alpha").await;
    send(
        &mut alpha,
        &ClientMessage::JoinVoiceChannel {
            channel_id: f.text,
        },
    )
    .await;
    let error = recv_matching(&mut alpha, |m| matches!(m, ServerMessage::Error { .. })).await;
    match error {
        ServerMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::NotFound),
        _ => unreachable!(),
    }
}

use crate::auth::verify_token;
use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::ws::voice;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use palaver_protocol::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use uuid::Uuid;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // First message should be authentication
    let auth_msg = match receiver.next().await {
        Some(Ok(Message::Text(text))) => text,
        _ => {
            tracing::warn!("WebSocket closed before authentication");
            return;
        }
    };

    let auth: ClientMessage = match serde_json::from_str(&auth_msg) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!("Invalid auth message: {}", e);
            let _ = sender
                .send(Message::Text(
                    serde_json::to_string(&ServerMessage::Error {
                        kind: palaver_protocol::ErrorKind::BadInput,
                        message: "Invalid message format".to_string(),
                    })
                    .unwrap()
                    .into(),
                ))
                .await;
            return;
        }
    };

    let user_id = match auth {
        ClientMessage::Authenticate { token } => {
            match verify_token(&token, &state.config.jwt_secret) {
                Ok(claims) => claims.sub,
                Err(_) => {
                    let _ = sender
                        .send(Message::Text(
                            serde_json::to_string(&ServerMessage::Error {
                                kind: palaver_protocol::ErrorKind::Unauthorized,
                                message: "Invalid token".to_string(),
                            })
                            .unwrap()
                            .into(),
                        ))
                        .await;
                    return;
                }
            }
        }
        _ => {
            let _ = sender
                .send(Message::Text(
                    serde_json::to_string(&ServerMessage::Error {
                        kind: palaver_protocol::ErrorKind::Unauthorized,
                        message: "First message must be authentication".to_string(),
                    })
                    .unwrap()
                    .into(),
                ))
                .await;
            return;
        }
    };

    let connection_id = Uuid::new_v4();
    tracing::info!("User {} authenticated on WebSocket", user_id);

    // Outbound messages go through a channel so broadcasts never block on a
    // slow socket in the caller's path.
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    let first_connection = state
        .connections
        .add_connection(connection_id, user_id, tx)
        .await;

    // Subscribe to the user's community and conversation groups.
    let communities = state.communities.communities_of(user_id).await;
    for community_id in &communities {
        state
            .connections
            .subscribe_community(connection_id, *community_id)
            .await;
    }
    for conversation_id in state.communities.conversations_of(user_id).await {
        state
            .connections
            .subscribe_conversation(connection_id, conversation_id)
            .await;
    }

    // Acknowledge only once the connection is registered and subscribed, so
    // a client that saw `Authenticated` can rely on receiving broadcasts.
    state
        .connections
        .send_to_connection(connection_id, &ServerMessage::Authenticated { connection_id })
        .await;

    if first_connection {
        for community_id in &communities {
            state
                .connections
                .broadcast_to_community(*community_id, &ServerMessage::UserOnline { user_id })
                .await;
        }
    }

    // A second device connecting while voice is active elsewhere learns
    // about it, and only it does; no voice session is created here.
    if let Some(channel_id) = state.directory.current_channel_of(user_id).await {
        let channel_name = state
            .communities
            .get_channel(channel_id)
            .await
            .map(|c| c.name)
            .unwrap_or_default();
        state
            .connections
            .send_to_connection(
                connection_id,
                &ServerMessage::VoiceSessionActiveOnOtherDevice {
                    channel_id,
                    channel_name,
                },
            )
            .await;
    }

    // Handle incoming messages
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let client_msg: ClientMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!("Invalid message from {}: {}", user_id, e);
                        continue;
                    }
                };

                if let Err(e) =
                    handle_client_message(&state, user_id, connection_id, client_msg).await
                {
                    tracing::debug!(user = %user_id, "Request failed: {}", e);
                    state
                        .connections
                        .send_to_connection(
                            connection_id,
                            &ServerMessage::Error {
                                kind: e.kind(),
                                message: e.to_string(),
                            },
                        )
                        .await;
                }
            }
            Ok(Message::Ping(_)) => {
                state
                    .connections
                    .send_to_connection(connection_id, &ServerMessage::Pong)
                    .await;
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::error!("WebSocket error for user {}: {}", user_id, e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup on disconnect
    let cleanup = state.connections.remove_connection(connection_id).await;
    send_task.abort();

    if let Some(cleanup) = cleanup {
        // The voice connection dropping ends the voice session exactly as an
        // explicit leave would.
        if cleanup.was_voice_connection {
            voice::handle_voice_disconnect(&state, user_id).await;
        }

        if cleanup.was_last_connection {
            for community_id in state.communities.communities_of(user_id).await {
                state
                    .connections
                    .broadcast_to_community(community_id, &ServerMessage::UserOffline { user_id })
                    .await;
            }
        }
    }

    tracing::info!("User {} disconnected from WebSocket", user_id);
}

async fn handle_client_message(
    state: &AppState,
    user_id: Uuid,
    connection_id: Uuid,
    message: ClientMessage,
) -> Result<()> {
    match message {
        ClientMessage::Authenticate { .. } => {
            // Already authenticated
            Ok(())
        }
        ClientMessage::Ping => {
            state
                .connections
                .send_to_connection(connection_id, &ServerMessage::Pong)
                .await;
            Ok(())
        }
        ClientMessage::JoinServer { community_id } => {
            if !state.communities.is_member(user_id, community_id).await {
                return Err(AppError::Forbidden(
                    "Not a member of this community".to_string(),
                ));
            }
            state
                .connections
                .subscribe_community(connection_id, community_id)
                .await;
            Ok(())
        }
        ClientMessage::LeaveServer { community_id } => {
            state
                .connections
                .unsubscribe_community(connection_id, community_id)
                .await;
            Ok(())
        }
        ClientMessage::JoinChannel { channel_id } => {
            let channel = state
                .communities
                .get_channel(channel_id)
                .await
                .ok_or_else(|| AppError::NotFound("Channel not found".to_string()))?;
            if !state
                .communities
                .is_member(user_id, channel.community_id)
                .await
            {
                return Err(AppError::Forbidden(
                    "Not a member of this community".to_string(),
                ));
            }
            state
                .connections
                .subscribe_channel(connection_id, channel_id)
                .await;
            state
                .connections
                .send_to_connection(
                    connection_id,
                    &ServerMessage::ChannelSubscribed { channel_id },
                )
                .await;
            Ok(())
        }
        ClientMessage::LeaveChannel { channel_id } => {
            state
                .connections
                .unsubscribe_channel(connection_id, channel_id)
                .await;
            Ok(())
        }
        ClientMessage::SendTyping { channel_id } => {
            let channel = state
                .communities
                .get_channel(channel_id)
                .await
                .ok_or_else(|| AppError::NotFound("Channel not found".to_string()))?;
            if !state
                .communities
                .is_member(user_id, channel.community_id)
                .await
            {
                return Err(AppError::Forbidden(
                    "Not a member of this community".to_string(),
                ));
            }
            state
                .connections
                .broadcast_to_channel(
                    channel_id,
                    &ServerMessage::UserTyping {
                        channel_id,
                        user_id,
                    },
                )
                .await;
            Ok(())
        }
        ClientMessage::SendDmTyping { recipient_user_id } => {
            if !state
                .communities
                .share_community(user_id, recipient_user_id)
                .await
            {
                return Err(AppError::Forbidden(
                    "No shared community with that user".to_string(),
                ));
            }
            state
                .connections
                .send_to_user(recipient_user_id, &ServerMessage::DmUserTyping { user_id })
                .await;
            Ok(())
        }
        ClientMessage::SendConversationTyping { conversation_id } => {
            if !state
                .communities
                .is_conversation_member(conversation_id, user_id)
                .await
            {
                return Err(AppError::Forbidden(
                    "Not a member of that conversation".to_string(),
                ));
            }
            state
                .connections
                .broadcast_to_conversation(
                    conversation_id,
                    &ServerMessage::ConversationUserTyping {
                        conversation_id,
                        user_id,
                    },
                )
                .await;
            Ok(())
        }
        ClientMessage::JoinVoiceChannel { channel_id } => {
            voice::join_voice(state, user_id, connection_id, channel_id).await
        }
        ClientMessage::LeaveVoiceChannel { channel_id } => {
            voice::leave_voice(state, user_id, connection_id, channel_id).await
        }
        ClientMessage::SendSfuAnswer { channel_id, sdp } => {
            voice::apply_sfu_answer(state, user_id, channel_id, sdp).await
        }
        ClientMessage::SendSfuIceCandidate {
            channel_id,
            candidate,
            mid,
            mline_index,
        } => {
            voice::apply_sfu_ice_candidate(state, user_id, channel_id, candidate, mid, mline_index)
                .await
        }
        ClientMessage::UpdateVoiceState { channel_id, patch } => {
            voice::update_voice_state(state, user_id, channel_id, patch).await
        }
        ClientMessage::UpdateSpeakingState {
            channel_id,
            is_speaking,
        } => voice::update_speaking_state(state, user_id, channel_id, is_speaking).await,
        ClientMessage::ServerMuteUser {
            channel_id,
            target_user_id,
            value,
        } => voice::server_mute_user(state, user_id, channel_id, target_user_id, value).await,
        ClientMessage::ServerDeafenUser {
            channel_id,
            target_user_id,
            value,
        } => voice::server_deafen_user(state, user_id, channel_id, target_user_id, value).await,
        ClientMessage::MoveUser {
            target_user_id,
            to_channel_id,
        } => voice::move_user(state, user_id, target_user_id, to_channel_id).await,
        ClientMessage::WatchScreenShare {
            channel_id,
            streamer_user_id,
        } => {
            voice::watch_screen_share(state, user_id, connection_id, channel_id, streamer_user_id)
                .await
        }
        ClientMessage::StopWatchingScreenShare {
            channel_id,
            streamer_user_id,
        } => voice::stop_watching_screen_share(state, user_id, channel_id, streamer_user_id).await,
        ClientMessage::SendAnnotation {
            channel_id,
            sharer_user_id,
            payload,
        } => voice::send_annotation(state, user_id, channel_id, sharer_user_id, payload).await,
        ClientMessage::ClearAnnotations {
            channel_id,
            sharer_user_id,
        } => voice::clear_annotations(state, user_id, channel_id, sharer_user_id).await,
        ClientMessage::RequestControllerAccess {
            channel_id,
            host_user_id,
        } => voice::request_controller_access(state, user_id, channel_id, host_user_id).await,
        ClientMessage::AcceptControllerAccess {
            channel_id,
            guest_user_id,
            slot,
        } => {
            voice::accept_controller_access(state, user_id, channel_id, guest_user_id, slot).await
        }
        ClientMessage::DeclineControllerAccess {
            channel_id,
            guest_user_id,
        } => voice::decline_controller_access(state, user_id, channel_id, guest_user_id).await,
        ClientMessage::StopControllerAccess {
            channel_id,
            host_user_id,
            guest_user_id,
        } => {
            voice::stop_controller_access(state, user_id, channel_id, host_user_id, guest_user_id)
                .await
        }
        ClientMessage::SendControllerState {
            channel_id,
            host_user_id,
            state: gamepad,
        } => voice::send_controller_state(state, user_id, channel_id, host_user_id, gamepad).await,
        ClientMessage::SendControllerRumble {
            channel_id,
            guest_user_id,
            slot,
            low_frequency,
            high_frequency,
            duration_ms,
        } => {
            voice::send_controller_rumble(
                state,
                user_id,
                channel_id,
                guest_user_id,
                slot,
                low_frequency,
                high_frequency,
                duration_ms,
            )
            .await
        }
    }
}

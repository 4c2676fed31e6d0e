//! Voice signaling: the join/leave protocol, self and moderator state
//! changes, screen-share opt-in, annotations, and controller passthrough.
//!
//! Every function here is invoked from the socket dispatch loop with an
//! authenticated user and connection id. Failures bubble up as `AppError`
//! and are reported to the calling connection as typed `Error` messages.

use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::stores::ChannelInfo;
use palaver_protocol::{
    ChannelType, ControllerStopReason, GamepadState, ServerMessage, TrackLabel, VideoKind,
    VoiceSessionEndReason, VoiceStatePatch,
};
use uuid::Uuid;

/// Look up a channel and verify it is a voice channel.
async fn voice_channel(state: &AppState, channel_id: Uuid) -> Result<ChannelInfo> {
    let channel = state
        .communities
        .get_channel(channel_id)
        .await
        .ok_or_else(|| AppError::NotFound("Channel not found".to_string()))?;
    if channel.channel_type != ChannelType::Voice {
        return Err(AppError::NotFound("Not a voice channel".to_string()));
    }
    Ok(channel)
}

/// Send a message to the voice connection of every participant in a channel.
async fn broadcast_to_voice_participants(
    state: &AppState,
    channel_id: Uuid,
    message: &ServerMessage,
    except: Option<Uuid>,
) {
    for participant in state.directory.list(channel_id).await {
        if Some(participant.user_id) == except {
            continue;
        }
        state
            .connections
            .send_to_voice_connection(participant.user_id, message)
            .await;
    }
}

/// Announce a discovered SSRC mapping to everyone in voice in the channel.
pub async fn broadcast_ssrc_mapping(
    state: &AppState,
    channel_id: Uuid,
    message: &ServerMessage,
) {
    broadcast_to_voice_participants(state, channel_id, message, None).await;
}

/// Drop every per-channel trace of a user except the directory record:
/// SFU session, screen-share viewer entries, controller pairings (with
/// counterpart notifications).
async fn cleanup_channel_presence(state: &AppState, user_id: Uuid, channel_id: Uuid) {
    state.sfu.remove_session(channel_id, user_id).await;
    state.viewers.remove_user(channel_id, user_id);

    for pairing in state.controllers.remove_user(channel_id, user_id).await {
        let (counterpart, reason) = if pairing.host_id == user_id {
            (pairing.guest_id, ControllerStopReason::HostLeft)
        } else {
            (pairing.host_id, ControllerStopReason::GuestLeft)
        };
        state
            .connections
            .send_to_user(
                counterpart,
                &ServerMessage::ControllerAccessStopped {
                    channel_id,
                    host_user_id: pairing.host_id,
                    guest_user_id: pairing.guest_id,
                    reason,
                },
            )
            .await;
    }
}

/// Full voice teardown: SFU session, viewer sets, controller pairings,
/// directory record, roster broadcast, voice designation. Used by explicit
/// leaves, disconnects, displacement and failed-session reaping; idempotent.
pub async fn teardown_voice(
    state: &AppState,
    user_id: Uuid,
    channel_id: Uuid,
    end_reason: Option<VoiceSessionEndReason>,
    except_connection: Option<Uuid>,
) {
    // A leave naming a channel the user is not in must not disturb their
    // actual voice session; just make sure no stray SFU session lingers.
    let current = state.directory.current_channel_of(user_id).await;
    if current.is_some() && current != Some(channel_id) {
        state.sfu.remove_session(channel_id, user_id).await;
        return;
    }

    cleanup_channel_presence(state, user_id, channel_id).await;

    let left = state.directory.leave(channel_id, user_id).await;
    if left.is_some() {
        if let Some(channel) = state.communities.get_channel(channel_id).await {
            state
                .connections
                .broadcast_to_community(
                    channel.community_id,
                    &ServerMessage::VoiceParticipantLeft {
                        channel_id,
                        user_id,
                    },
                )
                .await;
        }
    }

    state.connections.clear_voice_connection(user_id).await;

    if let Some(reason) = end_reason.filter(|_| left.is_some()) {
        let message = ServerMessage::VoiceSessionEnded { reason };
        match except_connection {
            Some(connection_id) => {
                state
                    .connections
                    .send_to_user_except(user_id, connection_id, &message)
                    .await;
            }
            None => {
                state.connections.send_to_user(user_id, &message).await;
            }
        }
    }
}

/// The ungraceful path: the user's voice connection dropped.
pub async fn handle_voice_disconnect(state: &AppState, user_id: Uuid) {
    if let Some(channel_id) = state.directory.current_channel_of(user_id).await {
        tracing::info!(user = %user_id, channel = %channel_id, "Voice connection dropped, leaving channel");
        teardown_voice(
            state,
            user_id,
            channel_id,
            Some(VoiceSessionEndReason::DeviceDisconnected),
            None,
        )
        .await;
    }
}

/// `JoinVoiceChannel`: authorize, displace any existing voice session of
/// this user, build the SFU session, send the offer and the current SSRC
/// snapshot, then join the directory and announce the participant.
pub async fn join_voice(
    state: &AppState,
    user_id: Uuid,
    connection_id: Uuid,
    channel_id: Uuid,
) -> Result<()> {
    let channel = voice_channel(state, channel_id).await?;
    if !state
        .communities
        .is_member(user_id, channel.community_id)
        .await
    {
        return Err(AppError::Forbidden(
            "Not a member of this community".to_string(),
        ));
    }

    // Single-device voice: a join from this connection displaces any
    // session the user holds elsewhere. The old channel's leave must be
    // visible before the new join.
    if let Some(prior_channel) = state.directory.current_channel_of(user_id).await {
        state
            .connections
            .send_to_user_except(
                user_id,
                connection_id,
                &ServerMessage::DisplacedByAnotherDevice {
                    channel_id: prior_channel,
                },
            )
            .await;
        teardown_voice(state, user_id, prior_channel, None, None).await;
    }

    state
        .connections
        .set_voice_connection(user_id, connection_id)
        .await;

    let session = state.sfu.get_or_create_session(channel_id, user_id).await?;
    session.add_media_tracks().await?;
    let sdp = session.create_offer().await?;
    state
        .connections
        .send_to_connection(connection_id, &ServerMessage::SfuOffer { channel_id, sdp })
        .await;

    let mappings = state.sfu.ssrc_mapping_snapshot(channel_id).await;
    state
        .connections
        .send_to_connection(
            connection_id,
            &ServerMessage::SsrcMappingsBatch {
                channel_id,
                mappings,
            },
        )
        .await;

    let (participant, _) = state.directory.join(channel_id, user_id).await;
    state
        .connections
        .broadcast_to_community(
            channel.community_id,
            &ServerMessage::VoiceParticipantJoined {
                channel_id,
                participant,
            },
        )
        .await;
    Ok(())
}

/// `LeaveVoiceChannel`: idempotent, never waits on the network.
pub async fn leave_voice(
    state: &AppState,
    user_id: Uuid,
    connection_id: Uuid,
    channel_id: Uuid,
) -> Result<()> {
    teardown_voice(
        state,
        user_id,
        channel_id,
        Some(VoiceSessionEndReason::LeftVoiceChannel),
        Some(connection_id),
    )
    .await;
    Ok(())
}

pub async fn apply_sfu_answer(
    state: &AppState,
    user_id: Uuid,
    channel_id: Uuid,
    sdp: String,
) -> Result<()> {
    let session = state
        .sfu
        .get_session(channel_id, user_id)
        .await
        .ok_or_else(|| AppError::BadState("No voice session in that channel".to_string()))?;
    session.set_remote_answer(sdp).await
}

pub async fn apply_sfu_ice_candidate(
    state: &AppState,
    user_id: Uuid,
    channel_id: Uuid,
    candidate: String,
    mid: Option<String>,
    mline_index: Option<u16>,
) -> Result<()> {
    let session = state
        .sfu
        .get_session(channel_id, user_id)
        .await
        .ok_or_else(|| AppError::BadState("No voice session in that channel".to_string()))?;
    session.add_remote_ice(candidate, mid, mline_index).await
}

/// `UpdateVoiceState`: patch self flags and broadcast the result, plus
/// video stream start/stop transitions.
pub async fn update_voice_state(
    state: &AppState,
    user_id: Uuid,
    channel_id: Uuid,
    patch: VoiceStatePatch,
) -> Result<()> {
    let update = state
        .directory
        .update_self_state(channel_id, user_id, &patch)
        .await?;
    let channel = voice_channel(state, channel_id).await?;
    let previous = &update.previous;
    let current = &update.current;

    // Viewer sets must be gone before anyone hears the stream stopped, so a
    // stale viewer cannot keep receiving screen packets.
    if previous.is_screen_sharing && !current.is_screen_sharing {
        state.viewers.clear_for_streamer(channel_id, user_id);
    }

    state
        .connections
        .broadcast_to_community(
            channel.community_id,
            &ServerMessage::VoiceStateChanged {
                channel_id,
                participant: current.clone(),
            },
        )
        .await;

    let transitions = [
        (
            previous.is_camera_on,
            current.is_camera_on,
            VideoKind::Camera,
        ),
        (
            previous.is_screen_sharing,
            current.is_screen_sharing,
            VideoKind::ScreenShare,
        ),
    ];
    for (was, is, kind) in transitions {
        if !was && is {
            state
                .connections
                .broadcast_to_community(
                    channel.community_id,
                    &ServerMessage::VideoStreamStarted {
                        channel_id,
                        user_id,
                        kind,
                    },
                )
                .await;
        } else if was && !is {
            state
                .connections
                .broadcast_to_community(
                    channel.community_id,
                    &ServerMessage::VideoStreamStopped {
                        channel_id,
                        user_id,
                        kind,
                    },
                )
                .await;
        }
    }
    Ok(())
}

/// `UpdateSpeakingState`: broadcast only, never persisted.
pub async fn update_speaking_state(
    state: &AppState,
    user_id: Uuid,
    channel_id: Uuid,
    is_speaking: bool,
) -> Result<()> {
    if state.directory.get(channel_id, user_id).await.is_none() {
        return Err(AppError::Forbidden(
            "Not in that voice channel".to_string(),
        ));
    }
    let channel = voice_channel(state, channel_id).await?;
    state
        .connections
        .broadcast_to_community(
            channel.community_id,
            &ServerMessage::SpeakingStateChanged {
                channel_id,
                user_id,
                is_speaking,
            },
        )
        .await;
    Ok(())
}

pub async fn server_mute_user(
    state: &AppState,
    caller_id: Uuid,
    channel_id: Uuid,
    target_id: Uuid,
    value: bool,
) -> Result<()> {
    let channel = voice_channel(state, channel_id).await?;
    if !state
        .oracle
        .can_server_moderate(caller_id, channel.community_id)
        .await
    {
        return Err(AppError::Forbidden(
            "Requires Admin or Owner role".to_string(),
        ));
    }
    let participant = state
        .directory
        .set_server_mute(channel_id, target_id, value)
        .await?;
    state
        .connections
        .broadcast_to_community(
            channel.community_id,
            &ServerMessage::ServerVoiceStateChanged {
                channel_id,
                participant,
            },
        )
        .await;
    Ok(())
}

pub async fn server_deafen_user(
    state: &AppState,
    caller_id: Uuid,
    channel_id: Uuid,
    target_id: Uuid,
    value: bool,
) -> Result<()> {
    let channel = voice_channel(state, channel_id).await?;
    if !state
        .oracle
        .can_server_moderate(caller_id, channel.community_id)
        .await
    {
        return Err(AppError::Forbidden(
            "Requires Admin or Owner role".to_string(),
        ));
    }
    let participant = state
        .directory
        .set_server_deafen(channel_id, target_id, value)
        .await?;
    state
        .connections
        .broadcast_to_community(
            channel.community_id,
            &ServerMessage::ServerVoiceStateChanged {
                channel_id,
                participant,
            },
        )
        .await;
    Ok(())
}

/// `MoveUser`: dispose the target's old SFU session, move the directory
/// record, announce leave-then-join, and re-offer media in the new channel
/// on the target's voice connection.
pub async fn move_user(
    state: &AppState,
    caller_id: Uuid,
    target_id: Uuid,
    to_channel_id: Uuid,
) -> Result<()> {
    let to_channel = voice_channel(state, to_channel_id).await?;

    let from_channel_id = state
        .directory
        .current_channel_of(target_id)
        .await
        .ok_or_else(|| AppError::NotFound("Target is not in a voice channel".to_string()))?;
    let from_channel = state
        .communities
        .get_channel(from_channel_id)
        .await
        .ok_or_else(|| AppError::NotFound("Source channel not found".to_string()))?;

    if from_channel.community_id != to_channel.community_id {
        return Err(AppError::BadInput(
            "Cannot move between communities".to_string(),
        ));
    }
    if !state
        .oracle
        .can_server_moderate(caller_id, to_channel.community_id)
        .await
    {
        return Err(AppError::Forbidden(
            "Requires Admin or Owner role".to_string(),
        ));
    }

    cleanup_channel_presence(state, target_id, from_channel_id).await;
    let (participant, _) = state.directory.move_user(target_id, to_channel_id).await?;

    state
        .connections
        .broadcast_to_community(
            to_channel.community_id,
            &ServerMessage::VoiceParticipantLeft {
                channel_id: from_channel_id,
                user_id: target_id,
            },
        )
        .await;
    state
        .connections
        .broadcast_to_community(
            to_channel.community_id,
            &ServerMessage::VoiceParticipantJoined {
                channel_id: to_channel_id,
                participant,
            },
        )
        .await;
    state
        .connections
        .send_to_user(
            target_id,
            &ServerMessage::UserMoved {
                user_id: target_id,
                from_channel_id,
                to_channel_id,
            },
        )
        .await;

    // Fresh media session in the new channel, negotiated over the target's
    // existing voice connection.
    if let Some(voice_connection) = state.connections.voice_connection_of(target_id).await {
        let session = state
            .sfu
            .get_or_create_session(to_channel_id, target_id)
            .await?;
        session.add_media_tracks().await?;
        let sdp = session.create_offer().await?;
        state
            .connections
            .send_to_connection(
                voice_connection,
                &ServerMessage::SfuOffer {
                    channel_id: to_channel_id,
                    sdp,
                },
            )
            .await;
        let mappings = state.sfu.ssrc_mapping_snapshot(to_channel_id).await;
        state
            .connections
            .send_to_connection(
                voice_connection,
                &ServerMessage::SsrcMappingsBatch {
                    channel_id: to_channel_id,
                    mappings,
                },
            )
            .await;
    }
    Ok(())
}

/// `WatchScreenShare`: opt in, and hand the caller the streamer's screen
/// audio mapping so they can attach the track immediately.
pub async fn watch_screen_share(
    state: &AppState,
    user_id: Uuid,
    connection_id: Uuid,
    channel_id: Uuid,
    streamer_id: Uuid,
) -> Result<()> {
    if state.directory.get(channel_id, user_id).await.is_none() {
        return Err(AppError::Forbidden(
            "Not in that voice channel".to_string(),
        ));
    }
    if state.directory.get(channel_id, streamer_id).await.is_none() {
        return Err(AppError::NotFound(
            "Streamer is not in that channel".to_string(),
        ));
    }

    state.viewers.add(channel_id, streamer_id, user_id);

    let screen_audio = state
        .sfu
        .ssrc_mapping_snapshot(channel_id)
        .await
        .into_iter()
        .find(|m| m.user_id == streamer_id && m.label == TrackLabel::ScreenAudio);
    if let Some(mapping) = screen_audio {
        state
            .connections
            .send_to_connection(
                connection_id,
                &ServerMessage::UserScreenAudioSsrcMapped {
                    channel_id,
                    user_id: streamer_id,
                    ssrc: mapping.ssrc,
                },
            )
            .await;
    }
    Ok(())
}

pub async fn stop_watching_screen_share(
    state: &AppState,
    user_id: Uuid,
    channel_id: Uuid,
    streamer_id: Uuid,
) -> Result<()> {
    if state.directory.get(channel_id, user_id).await.is_none() {
        return Err(AppError::Forbidden(
            "Not in that voice channel".to_string(),
        ));
    }
    state.viewers.remove(channel_id, streamer_id, user_id);
    Ok(())
}

pub async fn send_annotation(
    state: &AppState,
    user_id: Uuid,
    channel_id: Uuid,
    sharer_id: Uuid,
    payload: String,
) -> Result<()> {
    if state.directory.get(channel_id, user_id).await.is_none() {
        return Err(AppError::Forbidden(
            "Not in that voice channel".to_string(),
        ));
    }
    broadcast_to_voice_participants(
        state,
        channel_id,
        &ServerMessage::ReceiveAnnotation {
            channel_id,
            sharer_user_id: sharer_id,
            from_user_id: user_id,
            payload,
        },
        Some(user_id),
    )
    .await;
    Ok(())
}

pub async fn clear_annotations(
    state: &AppState,
    user_id: Uuid,
    channel_id: Uuid,
    sharer_id: Uuid,
) -> Result<()> {
    if state.directory.get(channel_id, user_id).await.is_none() {
        return Err(AppError::Forbidden(
            "Not in that voice channel".to_string(),
        ));
    }
    broadcast_to_voice_participants(
        state,
        channel_id,
        &ServerMessage::AnnotationsCleared {
            channel_id,
            sharer_user_id: sharer_id,
        },
        Some(user_id),
    )
    .await;
    Ok(())
}

pub async fn request_controller_access(
    state: &AppState,
    guest_id: Uuid,
    channel_id: Uuid,
    host_id: Uuid,
) -> Result<()> {
    if state.directory.get(channel_id, guest_id).await.is_none() {
        return Err(AppError::Forbidden(
            "Not in that voice channel".to_string(),
        ));
    }
    if state.directory.get(channel_id, host_id).await.is_none() {
        return Err(AppError::NotFound(
            "Host is not in that channel".to_string(),
        ));
    }
    state
        .controllers
        .request(channel_id, host_id, guest_id)
        .await?;
    state
        .connections
        .send_to_user(
            host_id,
            &ServerMessage::ControllerAccessRequested {
                channel_id,
                guest_user_id: guest_id,
            },
        )
        .await;
    Ok(())
}

pub async fn accept_controller_access(
    state: &AppState,
    host_id: Uuid,
    channel_id: Uuid,
    guest_id: Uuid,
    slot: u8,
) -> Result<()> {
    state
        .controllers
        .accept(channel_id, host_id, guest_id, slot)
        .await?;
    state
        .connections
        .send_to_user(
            guest_id,
            &ServerMessage::ControllerAccessAccepted {
                channel_id,
                host_user_id: host_id,
                slot,
            },
        )
        .await;
    Ok(())
}

pub async fn decline_controller_access(
    state: &AppState,
    host_id: Uuid,
    channel_id: Uuid,
    guest_id: Uuid,
) -> Result<()> {
    if state.controllers.decline(channel_id, host_id, guest_id).await {
        state
            .connections
            .send_to_user(
                guest_id,
                &ServerMessage::ControllerAccessDeclined {
                    channel_id,
                    host_user_id: host_id,
                },
            )
            .await;
    }
    Ok(())
}

pub async fn stop_controller_access(
    state: &AppState,
    caller_id: Uuid,
    channel_id: Uuid,
    host_id: Uuid,
    guest_id: Uuid,
) -> Result<()> {
    if caller_id != host_id && caller_id != guest_id {
        return Err(AppError::Forbidden(
            "Only the host or the guest may stop a pairing".to_string(),
        ));
    }
    if state
        .controllers
        .stop(channel_id, host_id, guest_id)
        .await
        .is_some()
    {
        let (other, reason) = if caller_id == host_id {
            (guest_id, ControllerStopReason::StoppedByHost)
        } else {
            (host_id, ControllerStopReason::StoppedByGuest)
        };
        state
            .connections
            .send_to_user(
                other,
                &ServerMessage::ControllerAccessStopped {
                    channel_id,
                    host_user_id: host_id,
                    guest_user_id: guest_id,
                    reason,
                },
            )
            .await;
    }
    Ok(())
}

/// Gamepad state flows guest -> host, only while the pairing is active.
/// A stale send after the pairing collapsed succeeds without forwarding.
pub async fn send_controller_state(
    state: &AppState,
    guest_id: Uuid,
    channel_id: Uuid,
    host_id: Uuid,
    gamepad: GamepadState,
) -> Result<()> {
    let Some(slot) = state
        .controllers
        .authorized_slot(channel_id, host_id, guest_id)
        .await
    else {
        tracing::debug!(guest = %guest_id, host = %host_id, "Dropping controller state without active pairing");
        return Ok(());
    };
    state
        .connections
        .send_to_voice_connection(
            host_id,
            &ServerMessage::ControllerStateReceived {
                channel_id,
                guest_user_id: guest_id,
                slot,
                state: gamepad,
            },
        )
        .await;
    Ok(())
}

/// Rumble flows host -> guest, and only at the guest's actual slot.
pub async fn send_controller_rumble(
    state: &AppState,
    host_id: Uuid,
    channel_id: Uuid,
    guest_id: Uuid,
    slot: u8,
    low_frequency: f32,
    high_frequency: f32,
    duration_ms: u32,
) -> Result<()> {
    let active_slot = state
        .controllers
        .authorized_slot(channel_id, host_id, guest_id)
        .await
        .ok_or_else(|| {
            AppError::Forbidden("No active controller pairing with that guest".to_string())
        })?;
    if active_slot != slot {
        return Err(AppError::BadInput(format!(
            "Guest holds slot {active_slot}, not {slot}"
        )));
    }
    state
        .connections
        .send_to_voice_connection(
            guest_id,
            &ServerMessage::ControllerRumbleReceived {
                channel_id,
                host_user_id: host_id,
                slot,
                low_frequency,
                high_frequency,
                duration_ms,
            },
        )
        .await;
    Ok(())
}

//! Dispatcher for events bubbling up from the SFU: trickled ICE candidates,
//! session state changes, and SSRC discoveries.

use crate::sfu::SfuEvent;
use crate::state::AppState;
use crate::ws::voice;
use palaver_protocol::{ServerMessage, TrackLabel, VoiceSessionEndReason};
use tokio::sync::mpsc;

/// Consume the SFU event stream for the lifetime of the process. Spawned
/// once at startup, next to the HTTP server.
pub async fn run_sfu_events(state: AppState, mut events: mpsc::UnboundedReceiver<SfuEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SfuEvent::IceCandidate {
                channel_id: _,
                user_id,
                candidate,
            } => {
                // Server candidates go only to the designated voice
                // connection for the user.
                state
                    .connections
                    .send_to_voice_connection(
                        user_id,
                        &ServerMessage::SfuIceCandidate {
                            candidate: candidate.candidate,
                            mid: candidate.sdp_mid,
                            mline_index: candidate.sdp_mline_index,
                        },
                    )
                    .await;
            }
            SfuEvent::SessionState {
                channel_id,
                user_id,
                state: session_state,
            } => {
                tracing::debug!(user = %user_id, channel = %channel_id, ?session_state, "Session state changed");
                if session_state == crate::sfu::SessionState::Failed {
                    tracing::warn!(user = %user_id, channel = %channel_id, "Voice session failed, reaping");
                    voice::teardown_voice(
                        &state,
                        user_id,
                        channel_id,
                        Some(VoiceSessionEndReason::SessionFailed),
                        None,
                    )
                    .await;
                }
            }
            SfuEvent::SsrcDiscovered {
                channel_id,
                user_id,
                kind: _,
                label,
                ssrc,
            } => {
                // Screen video mappings are not announced on discovery; they
                // travel in join-time batches and watch responses only.
                let message = match label {
                    TrackLabel::Microphone => Some(ServerMessage::UserAudioSsrcMapped {
                        channel_id,
                        user_id,
                        ssrc,
                    }),
                    TrackLabel::ScreenAudio => Some(ServerMessage::UserScreenAudioSsrcMapped {
                        channel_id,
                        user_id,
                        ssrc,
                    }),
                    TrackLabel::CameraVideo => Some(ServerMessage::UserCameraVideoSsrcMapped {
                        channel_id,
                        user_id,
                        ssrc,
                    }),
                    TrackLabel::ScreenVideo => None,
                };
                if let Some(message) = message {
                    voice::broadcast_ssrc_mapping(&state, channel_id, &message).await;
                }
            }
        }
    }
}

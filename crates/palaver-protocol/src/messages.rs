use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{
    ControllerStopReason, ErrorKind, GamepadState, SsrcMapping, VideoKind, VoiceParticipant,
    VoiceSessionEndReason, VoiceStatePatch,
};

/// Messages sent from client to server via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate with the server. Must be the first message on the socket.
    Authenticate { token: String },

    /// Ping to keep connection alive
    Ping,

    /// Subscribe to a community's broadcast group
    JoinServer { community_id: Uuid },

    /// Unsubscribe from a community's broadcast group
    LeaveServer { community_id: Uuid },

    /// Subscribe to channel updates
    JoinChannel { channel_id: Uuid },

    /// Unsubscribe from channel updates
    LeaveChannel { channel_id: Uuid },

    /// Typing indicator in a channel
    SendTyping { channel_id: Uuid },

    /// Typing indicator in a direct message
    SendDmTyping { recipient_user_id: Uuid },

    /// Typing indicator in a group conversation
    SendConversationTyping { conversation_id: Uuid },

    /// Join a voice channel; the server responds with an `SfuOffer`
    JoinVoiceChannel { channel_id: Uuid },

    /// Leave a voice channel; always succeeds
    LeaveVoiceChannel { channel_id: Uuid },

    /// Answer to the server's SFU offer
    SendSfuAnswer { channel_id: Uuid, sdp: String },

    /// Trickled ICE candidate for the SFU peer connection
    SendSfuIceCandidate {
        channel_id: Uuid,
        candidate: String,
        mid: Option<String>,
        mline_index: Option<u16>,
    },

    /// Update self-controlled voice state flags
    UpdateVoiceState {
        channel_id: Uuid,
        patch: VoiceStatePatch,
    },

    /// Speaking indicator; broadcast only, never persisted
    UpdateSpeakingState {
        channel_id: Uuid,
        is_speaking: bool,
    },

    /// Server-mute a participant (Admin/Owner only)
    ServerMuteUser {
        channel_id: Uuid,
        target_user_id: Uuid,
        value: bool,
    },

    /// Server-deafen a participant (Admin/Owner only). Deafen implies mute.
    ServerDeafenUser {
        channel_id: Uuid,
        target_user_id: Uuid,
        value: bool,
    },

    /// Move a participant to another voice channel in the same community
    MoveUser {
        target_user_id: Uuid,
        to_channel_id: Uuid,
    },

    /// Opt in to a participant's screen share
    WatchScreenShare {
        channel_id: Uuid,
        streamer_user_id: Uuid,
    },

    /// Opt out of a participant's screen share
    StopWatchingScreenShare {
        channel_id: Uuid,
        streamer_user_id: Uuid,
    },

    /// Draw an annotation on someone's screen share
    SendAnnotation {
        channel_id: Uuid,
        sharer_user_id: Uuid,
        payload: String,
    },

    /// Clear all annotations on a screen share
    ClearAnnotations {
        channel_id: Uuid,
        sharer_user_id: Uuid,
    },

    /// Ask a screen-sharing host for a controller slot
    RequestControllerAccess {
        channel_id: Uuid,
        host_user_id: Uuid,
    },

    /// Host grants a pending controller request a slot (0..=3)
    AcceptControllerAccess {
        channel_id: Uuid,
        guest_user_id: Uuid,
        slot: u8,
    },

    /// Host declines a pending controller request
    DeclineControllerAccess {
        channel_id: Uuid,
        guest_user_id: Uuid,
    },

    /// Either party tears down an active controller pairing
    StopControllerAccess {
        channel_id: Uuid,
        host_user_id: Uuid,
        guest_user_id: Uuid,
    },

    /// Guest forwards gamepad state to the host
    SendControllerState {
        channel_id: Uuid,
        host_user_id: Uuid,
        state: GamepadState,
    },

    /// Host forwards a rumble effect to a guest's controller
    SendControllerRumble {
        channel_id: Uuid,
        guest_user_id: Uuid,
        slot: u8,
        low_frequency: f32,
        high_frequency: f32,
        duration_ms: u32,
    },
}

/// Messages sent from server to client via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication successful
    Authenticated { connection_id: Uuid },

    /// A request failed; `kind` follows the server's error taxonomy
    Error { kind: ErrorKind, message: String },

    /// Pong response to ping
    Pong,

    /// Subscribed to channel
    ChannelSubscribed { channel_id: Uuid },

    /// A user came online (first connection)
    UserOnline { user_id: Uuid },

    /// A user went offline (last connection closed)
    UserOffline { user_id: Uuid },

    /// The server's SDP offer for a voice session
    SfuOffer { channel_id: Uuid, sdp: String },

    /// Trickled ICE candidate from the server
    SfuIceCandidate {
        candidate: String,
        mid: Option<String>,
        mline_index: Option<u16>,
    },

    /// A participant joined a voice channel
    VoiceParticipantJoined {
        channel_id: Uuid,
        participant: VoiceParticipant,
    },

    /// A participant left a voice channel
    VoiceParticipantLeft { channel_id: Uuid, user_id: Uuid },

    /// A participant's self state changed
    VoiceStateChanged {
        channel_id: Uuid,
        participant: VoiceParticipant,
    },

    /// A participant's speaking indicator changed
    SpeakingStateChanged {
        channel_id: Uuid,
        user_id: Uuid,
        is_speaking: bool,
    },

    /// A moderator changed a participant's server mute/deafen flags
    ServerVoiceStateChanged {
        channel_id: Uuid,
        participant: VoiceParticipant,
    },

    /// The recipient was moved between voice channels by a moderator
    UserMoved {
        user_id: Uuid,
        from_channel_id: Uuid,
        to_channel_id: Uuid,
    },

    /// A participant started publishing video
    VideoStreamStarted {
        channel_id: Uuid,
        user_id: Uuid,
        kind: VideoKind,
    },

    /// A participant stopped publishing video
    VideoStreamStopped {
        channel_id: Uuid,
        user_id: Uuid,
        kind: VideoKind,
    },

    /// A participant's microphone SSRC was discovered
    UserAudioSsrcMapped {
        channel_id: Uuid,
        user_id: Uuid,
        ssrc: u32,
    },

    /// A participant's screen-share audio SSRC was discovered
    UserScreenAudioSsrcMapped {
        channel_id: Uuid,
        user_id: Uuid,
        ssrc: u32,
    },

    /// A participant's camera SSRC was discovered
    UserCameraVideoSsrcMapped {
        channel_id: Uuid,
        user_id: Uuid,
        ssrc: u32,
    },

    /// All currently known SSRC mappings for a channel, sent on join
    SsrcMappingsBatch {
        channel_id: Uuid,
        mappings: Vec<SsrcMapping>,
    },

    /// Sent to a fresh connection when the user already has voice elsewhere
    VoiceSessionActiveOnOtherDevice {
        channel_id: Uuid,
        channel_name: String,
    },

    /// The user's voice session ended, delivered to their other devices
    VoiceSessionEnded { reason: VoiceSessionEndReason },

    /// This device's voice session was taken over by another device
    DisplacedByAnotherDevice { channel_id: Uuid },

    /// An annotation drawn on a screen share
    ReceiveAnnotation {
        channel_id: Uuid,
        sharer_user_id: Uuid,
        from_user_id: Uuid,
        payload: String,
    },

    /// All annotations on a screen share were cleared
    AnnotationsCleared {
        channel_id: Uuid,
        sharer_user_id: Uuid,
    },

    /// A guest asked the recipient (host) for controller access
    ControllerAccessRequested {
        channel_id: Uuid,
        guest_user_id: Uuid,
    },

    /// The host granted the recipient (guest) a controller slot
    ControllerAccessAccepted {
        channel_id: Uuid,
        host_user_id: Uuid,
        slot: u8,
    },

    /// The host declined the recipient's controller request
    ControllerAccessDeclined {
        channel_id: Uuid,
        host_user_id: Uuid,
    },

    /// A controller pairing ended
    ControllerAccessStopped {
        channel_id: Uuid,
        host_user_id: Uuid,
        guest_user_id: Uuid,
        reason: ControllerStopReason,
    },

    /// Gamepad state from an active guest, delivered to the host
    ControllerStateReceived {
        channel_id: Uuid,
        guest_user_id: Uuid,
        slot: u8,
        state: GamepadState,
    },

    /// Rumble effect from the host, delivered to the guest
    ControllerRumbleReceived {
        channel_id: Uuid,
        host_user_id: Uuid,
        slot: u8,
        low_frequency: f32,
        high_frequency: f32,
        duration_ms: u32,
    },

    /// A user is typing in a channel
    UserTyping { channel_id: Uuid, user_id: Uuid },

    /// A user is typing in a direct message with the recipient
    DmUserTyping { user_id: Uuid },

    /// A user is typing in a group conversation
    ConversationUserTyping {
        conversation_id: Uuid,
        user_id: Uuid,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MediaKind, TrackLabel};

    /// Wire tags are snake_case of the variant name; clients depend on this.
    #[test]
    fn client_message_tags_are_snake_case() {
        let msg = ClientMessage::JoinVoiceChannel {
            channel_id: Uuid::nil(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "join_voice_channel");

        let msg = ClientMessage::SendSfuIceCandidate {
            channel_id: Uuid::nil(),
            candidate: "candidate:1".into(),
            mid: Some("0".into()),
            mline_index: Some(0),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "send_sfu_ice_candidate");
        assert_eq!(json["mline_index"], 0);
    }

    #[test]
    fn server_message_tags_are_snake_case() {
        let msg = ServerMessage::VoiceParticipantLeft {
            channel_id: Uuid::nil(),
            user_id: Uuid::nil(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "voice_participant_left");

        let msg = ServerMessage::VoiceSessionEnded {
            reason: VoiceSessionEndReason::DeviceDisconnected,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["reason"], "device_disconnected");
    }

    #[test]
    fn track_labels_match_wire_names() {
        assert_eq!(
            serde_json::to_string(&TrackLabel::Microphone).unwrap(),
            r#""microphone""#
        );
        assert_eq!(
            serde_json::to_string(&TrackLabel::ScreenAudio).unwrap(),
            r#""screen_audio""#
        );
        assert_eq!(
            serde_json::to_string(&TrackLabel::CameraVideo).unwrap(),
            r#""camera_video""#
        );
        assert_eq!(
            serde_json::to_string(&TrackLabel::ScreenVideo).unwrap(),
            r#""screen_video""#
        );
        assert_eq!(TrackLabel::ScreenAudio.kind(), MediaKind::Audio);
        assert_eq!(TrackLabel::ScreenVideo.kind(), MediaKind::Video);
    }

    /// A patch with absent fields must deserialize and leave the rest `None`.
    #[test]
    fn voice_state_patch_partial_fields() {
        let patch: VoiceStatePatch = serde_json::from_str(r#"{"is_muted": true}"#).unwrap();
        assert_eq!(patch.is_muted, Some(true));
        assert_eq!(patch.is_deafened, None);
        assert_eq!(patch.is_screen_sharing, None);

        // Round-trip drops absent fields entirely.
        let json = serde_json::to_string(&patch).unwrap();
        assert_eq!(json, r#"{"is_muted":true}"#);
    }

    #[test]
    fn update_voice_state_round_trip() {
        let msg = ClientMessage::UpdateVoiceState {
            channel_id: Uuid::new_v4(),
            patch: VoiceStatePatch {
                is_screen_sharing: Some(true),
                screen_share_has_audio: Some(true),
                ..Default::default()
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: ClientMessage = serde_json::from_str(&json).unwrap();
        match back {
            ClientMessage::UpdateVoiceState { patch, .. } => {
                assert_eq!(patch.is_screen_sharing, Some(true));
                assert_eq!(patch.screen_share_has_audio, Some(true));
                assert_eq!(patch.is_muted, None);
            }
            other => panic!("unexpected round trip result: {:?}", other),
        }
    }
}

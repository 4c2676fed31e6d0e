use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Channel kinds. Only `Voice` channels accept voice sessions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Text,
    Voice,
    DirectMessage,
    GroupDm,
}

/// Role of a user within a community.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Admin,
    Member,
}

/// RTP media kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Which stream within a voice session an SSRC belongs to.
///
/// A participant publishes up to four streams: their microphone, their
/// camera, and (while screen sharing) the screen video plus optional
/// system audio.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TrackLabel {
    Microphone,
    ScreenAudio,
    CameraVideo,
    ScreenVideo,
}

impl TrackLabel {
    pub fn kind(self) -> MediaKind {
        match self {
            TrackLabel::Microphone | TrackLabel::ScreenAudio => MediaKind::Audio,
            TrackLabel::CameraVideo | TrackLabel::ScreenVideo => MediaKind::Video,
        }
    }
}

/// One participant of a voice channel, as visible in the roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceParticipant {
    pub user_id: Uuid,
    pub channel_id: Uuid,
    pub joined_at: DateTime<Utc>,
    pub is_muted: bool,
    pub is_deafened: bool,
    pub is_server_muted: bool,
    pub is_server_deafened: bool,
    pub is_camera_on: bool,
    pub is_screen_sharing: bool,
    pub screen_share_has_audio: bool,
}

/// Partial update of a participant's self-controlled flags.
///
/// Absent fields are left unchanged. Server-imposed flags cannot be lifted
/// through this patch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoiceStatePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_muted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_deafened: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_camera_on: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_screen_sharing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_share_has_audio: Option<bool>,
}

/// An SSRC -> (user, stream) mapping entry, used by clients to route decoded
/// media to the right tile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SsrcMapping {
    pub user_id: Uuid,
    pub kind: MediaKind,
    pub label: TrackLabel,
    pub ssrc: u32,
}

/// Video stream kinds announced via `VideoStreamStarted` / `VideoStreamStopped`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VideoKind {
    Camera,
    ScreenShare,
}

/// Gamepad snapshot forwarded between controller-passthrough peers.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct GamepadState {
    pub buttons: u32,
    pub left_stick_x: f32,
    pub left_stick_y: f32,
    pub right_stick_x: f32,
    pub right_stick_y: f32,
    pub left_trigger: f32,
    pub right_trigger: f32,
}

/// Error taxonomy surfaced to clients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    BadState,
    BadInput,
    Transient,
    SessionFailed,
}

/// Why a voice session ended, delivered to the user's other devices.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VoiceSessionEndReason {
    LeftVoiceChannel,
    DeviceDisconnected,
    SessionFailed,
}

/// Why a controller-passthrough pairing ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControllerStopReason {
    StoppedByHost,
    StoppedByGuest,
    HostLeft,
    GuestLeft,
}

/// ICE server configuration for WebRTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

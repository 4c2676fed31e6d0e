//! Process-wide registry of rooms.
//!
//! Rooms are created lazily on the first join into a channel and removed
//! when their last session leaves. Both paths run under the same lock, so a
//! join can never race a cleanup into a half-dead room.

use super::room::Room;
use super::session::{Session, SessionState};
use crate::error::Result;
use crate::voice::ScreenShareViewerSet;
use palaver_protocol::{MediaKind, SsrcMapping, TrackLabel};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{
    MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_PCMA, MIME_TYPE_PCMU, MediaEngine,
};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};

/// Events the SFU bubbles up to the hub.
#[derive(Debug)]
pub enum SfuEvent {
    /// A local ICE candidate for a user's voice connection.
    IceCandidate {
        channel_id: Uuid,
        user_id: Uuid,
        candidate: RTCIceCandidateInit,
    },
    /// A session's connection state advanced.
    SessionState {
        channel_id: Uuid,
        user_id: Uuid,
        state: SessionState,
    },
    /// A session discovered one of its streams' SSRC.
    SsrcDiscovered {
        channel_id: Uuid,
        user_id: Uuid,
        kind: MediaKind,
        label: TrackLabel,
        ssrc: u32,
    },
}

/// Build the shared WebRTC API: Opus (with PCMU/PCMA for interop) and H.264
/// (hardware accelerated on clients), default interceptors.
pub(crate) fn build_media_api() -> Result<API> {
    let mut media_engine = MediaEngine::default();

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                channels: 0,
                // Baseline profile, level 3.1; packetization-mode=1 keeps
                // FU-A fragmentation intact through the forwarder.
                sdp_fmtp_line:
                    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                        .to_string(),
                rtcp_feedback: vec![],
            },
            payload_type: 96,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_string(),
                clock_rate: 8000,
                channels: 1,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            payload_type: 0,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMA.to_string(),
                clock_rate: 8000,
                channels: 1,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            payload_type: 8,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(SettingEngine::default())
        .build();

    Ok(api)
}

pub struct SfuRegistry {
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
    ice_timeout: Duration,
    rooms: Mutex<HashMap<Uuid, Arc<Room>>>,
    viewers: Arc<ScreenShareViewerSet>,
    events: mpsc::UnboundedSender<SfuEvent>,
}

impl SfuRegistry {
    /// Create the registry and the event stream the hub consumes.
    pub fn new(
        stun_servers: Vec<String>,
        turn_servers: Vec<(String, String, String)>,
        ice_timeout: Duration,
        viewers: Arc<ScreenShareViewerSet>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SfuEvent>)> {
        let api = Arc::new(build_media_api()?);

        let mut ice_servers = vec![];
        for stun_url in stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url],
                ..Default::default()
            });
        }
        for (url, username, credential) in turn_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![url],
                username,
                credential,
                ..Default::default()
            });
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            api,
            ice_servers,
            ice_timeout,
            rooms: Mutex::new(HashMap::new()),
            viewers,
            events: events_tx,
        });
        Ok((registry, events_rx))
    }

    /// Create (or displace into) a session for a user in a channel, creating
    /// the room on first join.
    pub async fn get_or_create_session(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
    ) -> Result<Arc<Session>> {
        let mut rooms = self.rooms.lock().await;
        let room = rooms
            .entry(channel_id)
            .or_insert_with(|| {
                tracing::info!(channel = %channel_id, "Created room");
                Arc::new(Room::new(
                    channel_id,
                    self.api.clone(),
                    self.ice_servers.clone(),
                    self.ice_timeout,
                    self.viewers.clone(),
                    self.events.clone(),
                ))
            })
            .clone();
        // Still under the registry lock: a concurrent empty-room cleanup
        // cannot observe this room between creation and first session.
        room.create_session(user_id).await
    }

    pub async fn get_session(&self, channel_id: Uuid, user_id: Uuid) -> Option<Arc<Session>> {
        self.rooms
            .lock()
            .await
            .get(&channel_id)?
            .get_session(user_id)
    }

    /// Remove a user's session, and the room itself once it is empty. The
    /// emptiness check runs under the same lock that guards creation.
    pub async fn remove_session(&self, channel_id: Uuid, user_id: Uuid) {
        let mut rooms = self.rooms.lock().await;
        if let Some(room) = rooms.get(&channel_id).cloned() {
            room.remove_session(user_id).await;
            if room.is_empty() {
                rooms.remove(&channel_id);
                tracing::info!(channel = %channel_id, "Room empty, removed");
            }
        }
    }

    /// All known (user, kind, label, ssrc) mappings for a channel.
    pub async fn ssrc_mapping_snapshot(&self, channel_id: Uuid) -> Vec<SsrcMapping> {
        self.rooms
            .lock()
            .await
            .get(&channel_id)
            .map(|room| room.snapshot_mappings())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sfu::room::SsrcEntry;

    fn test_registry() -> Arc<SfuRegistry> {
        let (registry, _events) = SfuRegistry::new(
            vec![],
            vec![],
            Duration::from_secs(300),
            Arc::new(ScreenShareViewerSet::new()),
        )
        .unwrap();
        registry
    }

    #[tokio::test]
    async fn rooms_are_created_lazily_and_removed_when_empty() {
        let registry = test_registry();
        let channel = Uuid::new_v4();
        let user = Uuid::new_v4();

        assert!(registry.get_session(channel, user).await.is_none());

        registry.get_or_create_session(channel, user).await.unwrap();
        assert!(registry.get_session(channel, user).await.is_some());

        registry.remove_session(channel, user).await;
        assert!(registry.get_session(channel, user).await.is_none());
        assert!(registry.ssrc_mapping_snapshot(channel).await.is_empty());

        // idempotent removal of an unknown session
        registry.remove_session(channel, user).await;
    }

    #[tokio::test]
    async fn late_join_gets_a_fresh_room() {
        let registry = test_registry();
        let channel = Uuid::new_v4();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        registry.get_or_create_session(channel, first).await.unwrap();
        {
            let rooms = registry.rooms.lock().await;
            rooms.get(&channel).unwrap().record_ssrc(
                111,
                SsrcEntry {
                    user_id: first,
                    kind: MediaKind::Audio,
                    label: TrackLabel::Microphone,
                },
            );
        }
        registry.remove_session(channel, first).await;

        // The replacement room carries nothing over from the old one.
        registry.get_or_create_session(channel, second).await.unwrap();
        assert!(registry.ssrc_mapping_snapshot(channel).await.is_empty());
        registry.remove_session(channel, second).await;
    }

    #[tokio::test]
    async fn room_survives_while_other_sessions_remain() {
        let registry = test_registry();
        let channel = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        registry.get_or_create_session(channel, a).await.unwrap();
        registry.get_or_create_session(channel, b).await.unwrap();

        registry.remove_session(channel, a).await;
        assert!(registry.get_session(channel, b).await.is_some());

        registry.remove_session(channel, b).await;
        assert!(registry.get_session(channel, b).await.is_none());
    }
}

//! A single SFU peer connection: one user in one voice channel.
//!
//! The session terminates WebRTC for its user (ICE, DTLS/SRTP), discovers
//! the SSRC of each published stream, and re-emits raw RTP handed to it by
//! the room. Everything it learns flows out through a typed event channel;
//! the session never calls back into the room that owns it.

use crate::error::{AppError, Result};
use palaver_protocol::{MediaKind, TrackLabel};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;
use webrtc::api::API;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

/// Connection lifecycle. Transitions are monotonic: `Failed` and `Closed`
/// are absorbing (except `Failed -> Closed`), a session never resurrects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// Events a session raises toward its room.
#[derive(Debug)]
pub enum SessionEvent {
    /// Trickled local ICE candidate for the client.
    IceCandidate(RTCIceCandidateInit),
    /// Connection state advanced.
    StateChanged(SessionState),
    /// An inbound audio RTP packet from the client.
    AudioRtp(webrtc::rtp::packet::Packet),
    /// An inbound video RTP packet from the client.
    VideoRtp(webrtc::rtp::packet::Packet),
    /// First sighting of a (kind, label) stream; emitted exactly once each.
    SsrcDiscovered {
        kind: MediaKind,
        label: TrackLabel,
        ssrc: u32,
    },
}

struct OutboundTracks {
    audio: Arc<TrackLocalStaticRTP>,
    camera: Arc<TrackLocalStaticRTP>,
    screen: Arc<TrackLocalStaticRTP>,
}

pub struct Session {
    pub user_id: Uuid,
    pub channel_id: Uuid,
    pc: Arc<RTCPeerConnection>,
    state: Arc<RwLock<SessionState>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    outbound: RwLock<Option<OutboundTracks>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Session {
    /// Build the peer connection and register all handlers. The returned
    /// receiver carries every event the session will ever raise.
    pub async fn create(
        api: &Arc<API>,
        user_id: Uuid,
        channel_id: Uuid,
        ice_servers: Vec<RTCIceServer>,
        ice_timeout: Duration,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>)> {
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(SessionState::New));

        // ICE candidates trickle up to the hub, which relays them to the
        // user's voice connection.
        let tx = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = tx.send(SessionEvent::IceCandidate(init));
                        }
                        Err(e) => {
                            tracing::warn!("Failed to serialize ICE candidate: {}", e);
                        }
                    }
                }
            })
        }));

        let tx = events_tx.clone();
        let state_for_pc = state.clone();
        pc.on_peer_connection_state_change(Box::new(move |pc_state| {
            let tx = tx.clone();
            let state = state_for_pc.clone();
            Box::pin(async move {
                let mapped = match pc_state {
                    RTCPeerConnectionState::New => Some(SessionState::New),
                    RTCPeerConnectionState::Connecting => Some(SessionState::Connecting),
                    RTCPeerConnectionState::Connected => Some(SessionState::Connected),
                    // Disconnected may recover; treat it as renegotiating.
                    RTCPeerConnectionState::Disconnected => Some(SessionState::Connecting),
                    RTCPeerConnectionState::Failed => Some(SessionState::Failed),
                    RTCPeerConnectionState::Closed => Some(SessionState::Closed),
                    RTCPeerConnectionState::Unspecified => None,
                };
                if let Some(mapped) = mapped {
                    apply_state(&state, &tx, mapped);
                }
            })
        }));

        // Receive side: each remote track gets a reader that resolves its
        // label, announces the SSRC once, and streams packets upward.
        let tx = events_tx.clone();
        let audio_order = Arc::new(AtomicUsize::new(0));
        let video_order = Arc::new(AtomicUsize::new(0));
        let seen_labels = Arc::new(Mutex::new(HashMap::<TrackLabel, u32>::new()));
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            let audio_order = audio_order.clone();
            let video_order = video_order.clone();
            let seen_labels = seen_labels.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    RTPCodecType::Video => MediaKind::Video,
                    RTPCodecType::Unspecified => {
                        tracing::warn!("Ignoring track of unspecified kind");
                        return;
                    }
                };
                let order = match kind {
                    MediaKind::Audio => audio_order.fetch_add(1, Ordering::SeqCst),
                    MediaKind::Video => video_order.fetch_add(1, Ordering::SeqCst),
                };
                let label = resolve_label(kind, &track.stream_id(), &track.id(), order);
                let ssrc = track.ssrc();

                let announce = {
                    let mut seen = seen_labels.lock().unwrap();
                    if seen.contains_key(&label) {
                        false
                    } else {
                        seen.insert(label, ssrc);
                        true
                    }
                };
                if announce {
                    tracing::info!(?kind, ?label, ssrc, "Discovered remote stream");
                    let _ = tx.send(SessionEvent::SsrcDiscovered { kind, label, ssrc });
                } else {
                    tracing::warn!(?label, ssrc, "Duplicate track for label; keeping first SSRC");
                }

                pump_remote_track(track, kind, tx).await;
            })
        }));

        let session = Arc::new(Self {
            user_id,
            channel_id,
            pc,
            state: state.clone(),
            events: events_tx.clone(),
            outbound: RwLock::new(None),
            watchdog: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        // Sessions that never complete ICE get failed so the hub reaps them.
        let watchdog = tokio::spawn({
            let state = state.clone();
            let tx = events_tx.clone();
            async move {
                tokio::time::sleep(ice_timeout).await;
                let stuck = matches!(
                    *state.read().unwrap(),
                    SessionState::New | SessionState::Connecting
                );
                if stuck {
                    tracing::warn!(user = %user_id, channel = %channel_id, "ICE negotiation timed out");
                    apply_state(&state, &tx, SessionState::Failed);
                }
            }
        });
        *session.watchdog.lock().unwrap() = Some(watchdog);

        tracing::info!(user = %user_id, channel = %channel_id, "Created SFU session");
        Ok((session, events_rx))
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap()
    }

    /// Attach the send-side tracks: one audio writer and two video writers
    /// (camera, screen). Must run before `create_offer` so the m-lines are
    /// in the offer.
    pub async fn add_media_tracks(&self) -> Result<()> {
        if self.outbound.read().unwrap().is_some() {
            return Err(AppError::BadState("Media tracks already added".to_string()));
        }

        let audio = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            format!("audio-{}", self.user_id),
            "microphone".to_string(),
        ));

        let h264 = RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                .to_string(),
            rtcp_feedback: vec![],
        };
        let camera = Arc::new(TrackLocalStaticRTP::new(
            h264.clone(),
            format!("camera-{}", self.user_id),
            "camera_video".to_string(),
        ));
        let screen = Arc::new(TrackLocalStaticRTP::new(
            h264,
            format!("screen-{}", self.user_id),
            "screen_video".to_string(),
        ));

        self.pc
            .add_track(Arc::clone(&audio) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        self.pc
            .add_track(Arc::clone(&camera) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        self.pc
            .add_track(Arc::clone(&screen) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        *self.outbound.write().unwrap() = Some(OutboundTracks {
            audio,
            camera,
            screen,
        });
        Ok(())
    }

    /// Generate the server's offer and install it as the local description.
    pub async fn create_offer(&self) -> Result<String> {
        if self.pc.remote_description().await.is_some() {
            return Err(AppError::BadState(
                "Remote description already set".to_string(),
            ));
        }
        let offer = self.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await?;
        Ok(sdp)
    }

    /// Apply the client's answer to our outstanding offer.
    pub async fn set_remote_answer(&self, sdp: String) -> Result<()> {
        if self.pc.signaling_state() != RTCSignalingState::HaveLocalOffer {
            return Err(AppError::BadState("No outstanding local offer".to_string()));
        }
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| AppError::BadInput(format!("Unparseable SDP: {e}")))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| AppError::BadInput(format!("Rejected SDP answer: {e}")))?;
        Ok(())
    }

    /// Append a trickled remote candidate.
    pub async fn add_remote_ice(
        &self,
        candidate: String,
        mid: Option<String>,
        mline_index: Option<u16>,
    ) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate,
            sdp_mid: mid,
            sdp_mline_index: mline_index,
            ..Default::default()
        };
        match self.pc.add_ice_candidate(init).await {
            Ok(()) => Ok(()),
            // Late candidates after the pair is nailed down are harmless.
            Err(e) if self.state() == SessionState::Connected => {
                tracing::debug!("Ignoring late ICE candidate: {}", e);
                Ok(())
            }
            Err(e) => Err(AppError::BadInput(format!("Bad ICE candidate: {e}"))),
        }
    }

    /// Re-emit an audio RTP packet to this peer. No-op unless connected;
    /// payload, timestamp and marker pass through untouched.
    pub async fn forward_audio_rtp(&self, packet: &webrtc::rtp::packet::Packet) -> Result<()> {
        if self.state() != SessionState::Connected {
            return Ok(());
        }
        let Some(track) = self
            .outbound
            .read()
            .unwrap()
            .as_ref()
            .map(|out| out.audio.clone())
        else {
            return Ok(());
        };
        track.write_rtp(packet).await?;
        Ok(())
    }

    /// Re-emit a video RTP packet to this peer on the writer matching the
    /// label the room resolved for it.
    pub async fn forward_video_rtp(
        &self,
        packet: &webrtc::rtp::packet::Packet,
        label: TrackLabel,
    ) -> Result<()> {
        if self.state() != SessionState::Connected {
            return Ok(());
        }
        let Some(track) = self.outbound.read().unwrap().as_ref().map(|out| {
            if label == TrackLabel::ScreenVideo {
                out.screen.clone()
            } else {
                out.camera.clone()
            }
        }) else {
            return Ok(());
        };
        track.write_rtp(packet).await?;
        Ok(())
    }

    /// Tear the peer connection down; idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(watchdog) = self.watchdog.lock().unwrap().take() {
            watchdog.abort();
        }
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Error closing peer connection: {}", e);
        }
        apply_state(&self.state, &self.events, SessionState::Closed);
        tracing::info!(user = %self.user_id, channel = %self.channel_id, "Closed SFU session");
    }
}

/// Advance the session state, honoring monotonicity, and emit the change.
fn apply_state(
    state: &RwLock<SessionState>,
    events: &mpsc::UnboundedSender<SessionEvent>,
    new: SessionState,
) {
    let changed = {
        let mut guard = state.write().unwrap();
        let allowed = match *guard {
            SessionState::Closed => false,
            SessionState::Failed => new == SessionState::Closed,
            _ => true,
        };
        if allowed && *guard != new {
            *guard = new;
            true
        } else {
            false
        }
    };
    if changed {
        let _ = events.send(SessionEvent::StateChanged(new));
    }
}

/// Decide which stream a remote track carries. The negotiated identifiers
/// win; otherwise arrival order within the kind decides (first audio is the
/// microphone, first video the camera).
fn resolve_label(kind: MediaKind, stream_id: &str, track_id: &str, order: usize) -> TrackLabel {
    let screen_hint = stream_id.contains("screen") || track_id.contains("screen");
    match kind {
        MediaKind::Audio => {
            if screen_hint {
                TrackLabel::ScreenAudio
            } else if stream_id.contains("mic") || track_id.contains("mic") || order == 0 {
                TrackLabel::Microphone
            } else {
                TrackLabel::ScreenAudio
            }
        }
        MediaKind::Video => {
            if screen_hint {
                TrackLabel::ScreenVideo
            } else if stream_id.contains("camera") || track_id.contains("camera") || order == 0 {
                TrackLabel::CameraVideo
            } else {
                TrackLabel::ScreenVideo
            }
        }
    }
}

/// Read RTP from a remote track until it closes, forwarding each packet as
/// an event. Runs on the delivery task webrtc hands us.
async fn pump_remote_track(
    track: Arc<TrackRemote>,
    kind: MediaKind,
    tx: mpsc::UnboundedSender<SessionEvent>,
) {
    loop {
        match track.read_rtp().await {
            Ok((packet, _attributes)) => {
                let event = match kind {
                    MediaKind::Audio => SessionEvent::AudioRtp(packet),
                    MediaKind::Video => SessionEvent::VideoRtp(packet),
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
            Err(e) => {
                let message = e.to_string();
                if message.contains("closed") {
                    tracing::debug!("Remote track closed");
                } else {
                    tracing::warn!("Error reading RTP from remote track: {}", e);
                }
                break;
            }
        }
    }
}

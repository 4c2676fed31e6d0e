//! Voice membership directory: the authoritative record of who is in which
//! voice channel and their per-user state flags.
//!
//! A user is in at most one voice channel globally. Self-updates cannot lift
//! an active server-imposed mute or deafen; those are cleared only by a
//! moderator. All flags reset when a user joins a channel.

use crate::error::{AppError, Result};
use chrono::Utc;
use palaver_protocol::{VoiceParticipant, VoiceStatePatch};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Outcome of a self-state update; the hub compares the two to detect
/// camera/screen transitions.
#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub previous: VoiceParticipant,
    pub current: VoiceParticipant,
}

#[derive(Default)]
struct DirectoryInner {
    /// user_id -> participant (quick "where is this user?")
    by_user: HashMap<Uuid, VoiceParticipant>,
    /// channel_id -> [user_id] (quick "who's in this channel?")
    by_channel: HashMap<Uuid, Vec<Uuid>>,
}

impl DirectoryInner {
    fn insert(&mut self, participant: VoiceParticipant) {
        self.by_channel
            .entry(participant.channel_id)
            .or_default()
            .push(participant.user_id);
        self.by_user.insert(participant.user_id, participant);
    }

    fn remove(&mut self, user_id: Uuid) -> Option<VoiceParticipant> {
        let participant = self.by_user.remove(&user_id)?;
        if let Some(members) = self.by_channel.get_mut(&participant.channel_id) {
            members.retain(|u| *u != user_id);
            if members.is_empty() {
                self.by_channel.remove(&participant.channel_id);
            }
        }
        Some(participant)
    }
}

/// Canonical membership and per-user state for all voice channels.
pub struct VoiceDirectory {
    // The write guard doubles as the per-user critical section; join/leave
    // run entirely under it so the single-channel invariant holds.
    inner: RwLock<DirectoryInner>,
}

impl VoiceDirectory {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(DirectoryInner::default()),
        }
    }

    /// Join a voice channel. If the user was in another channel that
    /// membership is dropped atomically; its channel id is returned so the
    /// caller can broadcast the leave first.
    pub async fn join(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
    ) -> (VoiceParticipant, Option<Uuid>) {
        let mut inner = self.inner.write().await;
        let prior = inner.remove(user_id).map(|p| p.channel_id);

        let participant = VoiceParticipant {
            user_id,
            channel_id,
            joined_at: Utc::now(),
            is_muted: false,
            is_deafened: false,
            is_server_muted: false,
            is_server_deafened: false,
            is_camera_on: false,
            is_screen_sharing: false,
            screen_share_has_audio: false,
        };
        inner.insert(participant.clone());

        tracing::info!(user = %user_id, channel = %channel_id, "User joined voice channel");
        (participant, prior)
    }

    /// Leave a specific channel; idempotent. Returns the removed record.
    pub async fn leave(&self, channel_id: Uuid, user_id: Uuid) -> Option<VoiceParticipant> {
        let mut inner = self.inner.write().await;
        if inner.by_user.get(&user_id).map(|p| p.channel_id) != Some(channel_id) {
            return None;
        }
        let removed = inner.remove(user_id);
        if removed.is_some() {
            tracing::info!(user = %user_id, channel = %channel_id, "User left voice channel");
        }
        removed
    }

    /// Leave whatever channel the user is in; idempotent. Used on disconnect.
    pub async fn leave_all(&self, user_id: Uuid) -> Option<VoiceParticipant> {
        let removed = self.inner.write().await.remove(user_id);
        if let Some(ref p) = removed {
            tracing::info!(user = %user_id, channel = %p.channel_id, "User left voice channel");
        }
        removed
    }

    /// Patch the user's self-controlled flags.
    ///
    /// Attempts to clear `is_muted` while server-muted (or `is_deafened`
    /// while server-deafened) are rejected wholesale; no field of the patch
    /// is applied.
    pub async fn update_self_state(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
        patch: &VoiceStatePatch,
    ) -> Result<StateUpdate> {
        let mut inner = self.inner.write().await;
        let participant = inner
            .by_user
            .get_mut(&user_id)
            .filter(|p| p.channel_id == channel_id)
            .ok_or_else(|| AppError::NotFound("Not in that voice channel".to_string()))?;

        if patch.is_muted == Some(false) && participant.is_server_muted {
            return Err(AppError::Forbidden(
                "Cannot unmute while server-muted".to_string(),
            ));
        }
        if patch.is_deafened == Some(false) && participant.is_server_deafened {
            return Err(AppError::Forbidden(
                "Cannot undeafen while server-deafened".to_string(),
            ));
        }

        let previous = participant.clone();
        if let Some(muted) = patch.is_muted {
            participant.is_muted = muted;
        }
        if let Some(deafened) = patch.is_deafened {
            participant.is_deafened = deafened;
        }
        if let Some(camera) = patch.is_camera_on {
            participant.is_camera_on = camera;
        }
        if let Some(sharing) = patch.is_screen_sharing {
            participant.is_screen_sharing = sharing;
            if !sharing {
                participant.screen_share_has_audio = false;
            }
        }
        if let Some(share_audio) = patch.screen_share_has_audio {
            participant.screen_share_has_audio = share_audio && participant.is_screen_sharing;
        }

        Ok(StateUpdate {
            previous,
            current: participant.clone(),
        })
    }

    /// Moderator action. Server mute also forces the self flag on; clearing
    /// it clears an active server deafen too (deafen implies mute).
    pub async fn set_server_mute(
        &self,
        channel_id: Uuid,
        target: Uuid,
        value: bool,
    ) -> Result<VoiceParticipant> {
        let mut inner = self.inner.write().await;
        let participant = inner
            .by_user
            .get_mut(&target)
            .filter(|p| p.channel_id == channel_id)
            .ok_or_else(|| AppError::NotFound("Target not in that voice channel".to_string()))?;

        participant.is_server_muted = value;
        if value {
            participant.is_muted = true;
        } else {
            participant.is_server_deafened = false;
        }
        Ok(participant.clone())
    }

    /// Moderator action. Server deafen implies server mute, applied atomically.
    pub async fn set_server_deafen(
        &self,
        channel_id: Uuid,
        target: Uuid,
        value: bool,
    ) -> Result<VoiceParticipant> {
        let mut inner = self.inner.write().await;
        let participant = inner
            .by_user
            .get_mut(&target)
            .filter(|p| p.channel_id == channel_id)
            .ok_or_else(|| AppError::NotFound("Target not in that voice channel".to_string()))?;

        participant.is_server_deafened = value;
        if value {
            participant.is_deafened = true;
            participant.is_server_muted = true;
            participant.is_muted = true;
        }
        Ok(participant.clone())
    }

    /// Move a user to another voice channel. Same-community validation is the
    /// hub's; here this is an atomic leave+join, so all flags reset.
    pub async fn move_user(
        &self,
        target: Uuid,
        to_channel: Uuid,
    ) -> Result<(VoiceParticipant, Uuid)> {
        let mut inner = self.inner.write().await;
        let from_channel = inner
            .remove(target)
            .map(|p| p.channel_id)
            .ok_or_else(|| AppError::NotFound("Target not in a voice channel".to_string()))?;

        let participant = VoiceParticipant {
            user_id: target,
            channel_id: to_channel,
            joined_at: Utc::now(),
            is_muted: false,
            is_deafened: false,
            is_server_muted: false,
            is_server_deafened: false,
            is_camera_on: false,
            is_screen_sharing: false,
            screen_share_has_audio: false,
        };
        inner.insert(participant.clone());

        tracing::info!(user = %target, from = %from_channel, to = %to_channel, "User moved between voice channels");
        Ok((participant, from_channel))
    }

    pub async fn get(&self, channel_id: Uuid, user_id: Uuid) -> Option<VoiceParticipant> {
        self.inner
            .read()
            .await
            .by_user
            .get(&user_id)
            .filter(|p| p.channel_id == channel_id)
            .cloned()
    }

    pub async fn list(&self, channel_id: Uuid) -> Vec<VoiceParticipant> {
        let inner = self.inner.read().await;
        inner
            .by_channel
            .get(&channel_id)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|uid| inner.by_user.get(uid).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn current_channel_of(&self, user_id: Uuid) -> Option<Uuid> {
        self.inner
            .read()
            .await
            .by_user
            .get(&user_id)
            .map(|p| p.channel_id)
    }
}

impl Default for VoiceDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn user_is_in_at_most_one_channel() {
        let directory = VoiceDirectory::new();
        let user = Uuid::new_v4();
        let k1 = Uuid::new_v4();
        let k2 = Uuid::new_v4();

        let (_, prior) = directory.join(k1, user).await;
        assert_eq!(prior, None);

        let (participant, prior) = directory.join(k2, user).await;
        assert_eq!(prior, Some(k1));
        assert_eq!(participant.channel_id, k2);
        assert_eq!(directory.current_channel_of(user).await, Some(k2));
        assert!(directory.list(k1).await.is_empty());
        assert_eq!(directory.list(k2).await.len(), 1);
    }

    #[tokio::test]
    async fn leave_is_idempotent() {
        let directory = VoiceDirectory::new();
        let user = Uuid::new_v4();
        let channel = Uuid::new_v4();

        directory.join(channel, user).await;
        assert!(directory.leave(channel, user).await.is_some());
        assert!(directory.leave(channel, user).await.is_none());
        assert!(directory.leave_all(user).await.is_none());
    }

    #[tokio::test]
    async fn leave_requires_matching_channel() {
        let directory = VoiceDirectory::new();
        let user = Uuid::new_v4();
        let channel = Uuid::new_v4();

        directory.join(channel, user).await;
        assert!(directory.leave(Uuid::new_v4(), user).await.is_none());
        assert_eq!(directory.current_channel_of(user).await, Some(channel));
    }

    #[tokio::test]
    async fn self_unmute_rejected_while_server_muted() {
        let directory = VoiceDirectory::new();
        let user = Uuid::new_v4();
        let channel = Uuid::new_v4();
        directory.join(channel, user).await;

        directory.set_server_mute(channel, user, true).await.unwrap();

        let patch = VoiceStatePatch {
            is_muted: Some(false),
            ..Default::default()
        };
        let err = directory
            .update_self_state(channel, user, &patch)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let state = directory.get(channel, user).await.unwrap();
        assert!(state.is_muted);
        assert!(state.is_server_muted);

        // Lift the server mute and the self-update goes through.
        directory.set_server_mute(channel, user, false).await.unwrap();
        let update = directory
            .update_self_state(channel, user, &patch)
            .await
            .unwrap();
        assert!(!update.current.is_muted);
    }

    #[tokio::test]
    async fn server_deafen_implies_server_mute() {
        let directory = VoiceDirectory::new();
        let user = Uuid::new_v4();
        let channel = Uuid::new_v4();
        directory.join(channel, user).await;

        let state = directory
            .set_server_deafen(channel, user, true)
            .await
            .unwrap();
        assert!(state.is_server_deafened);
        assert!(state.is_server_muted);
        assert!(state.is_deafened);
        assert!(state.is_muted);

        // Clearing the mute clears the deafen too, preserving deaf implies mute.
        let state = directory.set_server_mute(channel, user, false).await.unwrap();
        assert!(!state.is_server_muted);
        assert!(!state.is_server_deafened);
    }

    #[tokio::test]
    async fn flags_reset_across_joins() {
        let directory = VoiceDirectory::new();
        let user = Uuid::new_v4();
        let k1 = Uuid::new_v4();
        let k2 = Uuid::new_v4();

        directory.join(k1, user).await;
        directory.set_server_mute(k1, user, true).await.unwrap();

        let (participant, _) = directory.join(k2, user).await;
        assert!(!participant.is_server_muted);
        assert!(!participant.is_muted);
    }

    #[tokio::test]
    async fn screen_share_stop_clears_share_audio() {
        let directory = VoiceDirectory::new();
        let user = Uuid::new_v4();
        let channel = Uuid::new_v4();
        directory.join(channel, user).await;

        let patch = VoiceStatePatch {
            is_screen_sharing: Some(true),
            screen_share_has_audio: Some(true),
            ..Default::default()
        };
        let update = directory
            .update_self_state(channel, user, &patch)
            .await
            .unwrap();
        assert!(update.current.is_screen_sharing);
        assert!(update.current.screen_share_has_audio);

        let stop = VoiceStatePatch {
            is_screen_sharing: Some(false),
            ..Default::default()
        };
        let update = directory
            .update_self_state(channel, user, &stop)
            .await
            .unwrap();
        assert!(!update.current.is_screen_sharing);
        assert!(!update.current.screen_share_has_audio);
    }

    #[tokio::test]
    async fn move_resets_flags_and_reports_source() {
        let directory = VoiceDirectory::new();
        let user = Uuid::new_v4();
        let k1 = Uuid::new_v4();
        let k2 = Uuid::new_v4();

        directory.join(k1, user).await;
        directory.set_server_mute(k1, user, true).await.unwrap();

        let (state, from) = directory.move_user(user, k2).await.unwrap();
        assert_eq!(from, k1);
        assert_eq!(state.channel_id, k2);
        assert!(!state.is_server_muted);
        assert!(directory.list(k1).await.is_empty());

        let err = directory.move_user(Uuid::new_v4(), k2).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}

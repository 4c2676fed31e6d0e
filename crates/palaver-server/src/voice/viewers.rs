//! Screen-share viewer sets.
//!
//! Screen media is opt-in: the fan-out path forwards a streamer's screen
//! video/audio only to users present in their viewer set. Shared between the
//! hub (mutations) and every room (per-packet `is_watching` reads).

use dashmap::DashMap;
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Default)]
pub struct ScreenShareViewerSet {
    /// (channel_id, streamer_user_id) -> viewer user ids
    viewers: DashMap<(Uuid, Uuid), HashSet<Uuid>>,
}

impl ScreenShareViewerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, channel_id: Uuid, streamer_id: Uuid, viewer_id: Uuid) {
        self.viewers
            .entry((channel_id, streamer_id))
            .or_default()
            .insert(viewer_id);
    }

    pub fn remove(&self, channel_id: Uuid, streamer_id: Uuid, viewer_id: Uuid) {
        if let Some(mut set) = self.viewers.get_mut(&(channel_id, streamer_id)) {
            set.remove(&viewer_id);
        }
    }

    pub fn is_watching(&self, channel_id: Uuid, streamer_id: Uuid, viewer_id: Uuid) -> bool {
        self.viewers
            .get(&(channel_id, streamer_id))
            .map(|set| set.contains(&viewer_id))
            .unwrap_or(false)
    }

    /// The streamer stopped sharing; drop their whole viewer set. Must run
    /// before the corresponding `VideoStreamStopped` broadcast so a stale
    /// viewer cannot keep receiving packets.
    pub fn clear_for_streamer(&self, channel_id: Uuid, streamer_id: Uuid) {
        self.viewers.remove(&(channel_id, streamer_id));
    }

    /// Drop every trace of a user in a channel: their own viewer set and
    /// their membership in everyone else's.
    pub fn remove_user(&self, channel_id: Uuid, user_id: Uuid) {
        self.viewers.remove(&(channel_id, user_id));
        for mut entry in self.viewers.iter_mut() {
            if entry.key().0 == channel_id {
                entry.value_mut().remove(&user_id);
            }
        }
    }
}

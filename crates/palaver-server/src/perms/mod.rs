//! Role resolution and the permission predicates gating moderator actions.

use crate::stores::{CommunityStore, MessageStore};
use palaver_protocol::Role;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct PermissionOracle {
    communities: Arc<dyn CommunityStore>,
    messages: Arc<dyn MessageStore>,
}

impl PermissionOracle {
    pub fn new(communities: Arc<dyn CommunityStore>, messages: Arc<dyn MessageStore>) -> Self {
        Self {
            communities,
            messages,
        }
    }

    pub async fn role_of(&self, user_id: Uuid, community_id: Uuid) -> Option<Role> {
        self.communities.role_of(user_id, community_id).await
    }

    /// Server mute, server deafen and forced moves require Admin or Owner.
    pub async fn can_server_moderate(&self, user_id: Uuid, community_id: Uuid) -> bool {
        matches!(
            self.role_of(user_id, community_id).await,
            Some(Role::Owner) | Some(Role::Admin)
        )
    }

    /// Message author, or Admin/Owner of the message's community.
    pub async fn can_pin(&self, user_id: Uuid, message_id: Uuid) -> bool {
        let Some(message) = self.messages.get_message(message_id).await else {
            return false;
        };
        message.author_id == user_id
            || self.can_server_moderate(user_id, message.community_id).await
    }

    pub async fn can_delete(&self, user_id: Uuid, message_id: Uuid) -> bool {
        self.can_pin(user_id, message_id).await
    }

    /// As `can_pin`, plus whoever pinned the message may unpin it.
    pub async fn can_unpin(&self, user_id: Uuid, message_id: Uuid) -> bool {
        let Some(message) = self.messages.get_message(message_id).await else {
            return false;
        };
        message.pinned_by == Some(user_id) || self.can_pin(user_id, message_id).await
    }
}

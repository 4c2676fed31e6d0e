//! Collaborator interfaces.
//!
//! The media plane does not own durable storage. Community membership, roles
//! and message metadata live in external services, consumed here through
//! narrow traits. The in-memory implementations back the dev binary and the
//! test suite.

use async_trait::async_trait;
use palaver_protocol::{ChannelType, Role};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

/// The slice of channel metadata the hub needs for authorization.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub id: Uuid,
    pub community_id: Uuid,
    pub name: String,
    pub channel_type: ChannelType,
}

/// The slice of message metadata the permission oracle needs.
#[derive(Debug, Clone)]
pub struct MessageRef {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub community_id: Uuid,
    pub author_id: Uuid,
    pub pinned_by: Option<Uuid>,
}

/// Membership and role lookups.
#[async_trait]
pub trait CommunityStore: Send + Sync {
    async fn get_channel(&self, channel_id: Uuid) -> Option<ChannelInfo>;
    async fn is_member(&self, user_id: Uuid, community_id: Uuid) -> bool;
    async fn role_of(&self, user_id: Uuid, community_id: Uuid) -> Option<Role>;
    async fn communities_of(&self, user_id: Uuid) -> Vec<Uuid>;
    async fn conversations_of(&self, user_id: Uuid) -> Vec<Uuid>;
    async fn is_conversation_member(&self, conversation_id: Uuid, user_id: Uuid) -> bool;

    /// Whether two users share at least one community.
    async fn share_community(&self, a: Uuid, b: Uuid) -> bool {
        let mine = self.communities_of(a).await;
        for community_id in self.communities_of(b).await {
            if mine.contains(&community_id) {
                return true;
            }
        }
        false
    }
}

/// Message metadata lookups, consumed only by the permission oracle.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn get_message(&self, message_id: Uuid) -> Option<MessageRef>;
}

#[derive(Default)]
struct CommunityTables {
    channels: HashMap<Uuid, ChannelInfo>,
    roles: HashMap<(Uuid, Uuid), Role>,
    memberships: HashMap<Uuid, Vec<Uuid>>,
    conversations: HashMap<Uuid, Vec<Uuid>>,
}

/// In-memory `CommunityStore` for development and tests.
#[derive(Default)]
pub struct MemoryCommunityStore {
    tables: RwLock<CommunityTables>,
}

impl MemoryCommunityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_community(&self, community_id: Uuid, owner_id: Uuid) {
        let mut tables = self.tables.write().unwrap();
        tables.roles.insert((owner_id, community_id), Role::Owner);
        tables.memberships.entry(owner_id).or_default().push(community_id);
    }

    pub fn add_member(&self, community_id: Uuid, user_id: Uuid, role: Role) {
        let mut tables = self.tables.write().unwrap();
        tables.roles.insert((user_id, community_id), role);
        let memberships = tables.memberships.entry(user_id).or_default();
        if !memberships.contains(&community_id) {
            memberships.push(community_id);
        }
    }

    pub fn add_channel(
        &self,
        community_id: Uuid,
        name: &str,
        channel_type: ChannelType,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.tables.write().unwrap().channels.insert(
            id,
            ChannelInfo {
                id,
                community_id,
                name: name.to_string(),
                channel_type,
            },
        );
        id
    }

    pub fn add_conversation(&self, members: Vec<Uuid>) -> Uuid {
        let id = Uuid::new_v4();
        self.tables.write().unwrap().conversations.insert(id, members);
        id
    }
}

#[async_trait]
impl CommunityStore for MemoryCommunityStore {
    async fn get_channel(&self, channel_id: Uuid) -> Option<ChannelInfo> {
        self.tables.read().unwrap().channels.get(&channel_id).cloned()
    }

    async fn is_member(&self, user_id: Uuid, community_id: Uuid) -> bool {
        self.tables
            .read()
            .unwrap()
            .roles
            .contains_key(&(user_id, community_id))
    }

    async fn role_of(&self, user_id: Uuid, community_id: Uuid) -> Option<Role> {
        self.tables
            .read()
            .unwrap()
            .roles
            .get(&(user_id, community_id))
            .copied()
    }

    async fn communities_of(&self, user_id: Uuid) -> Vec<Uuid> {
        self.tables
            .read()
            .unwrap()
            .memberships
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn conversations_of(&self, user_id: Uuid) -> Vec<Uuid> {
        self.tables
            .read()
            .unwrap()
            .conversations
            .iter()
            .filter(|(_, members)| members.contains(&user_id))
            .map(|(id, _)| *id)
            .collect()
    }

    async fn is_conversation_member(&self, conversation_id: Uuid, user_id: Uuid) -> bool {
        self.tables
            .read()
            .unwrap()
            .conversations
            .get(&conversation_id)
            .map(|members| members.contains(&user_id))
            .unwrap_or(false)
    }
}

/// In-memory `MessageStore` for development and tests.
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: RwLock<HashMap<Uuid, MessageRef>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_message(
        &self,
        channel_id: Uuid,
        community_id: Uuid,
        author_id: Uuid,
        pinned_by: Option<Uuid>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.messages.write().unwrap().insert(
            id,
            MessageRef {
                id,
                channel_id,
                community_id,
                author_id,
                pinned_by,
            },
        );
        id
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn get_message(&self, message_id: Uuid) -> Option<MessageRef> {
        self.messages.read().unwrap().get(&message_id).cloned()
    }
}

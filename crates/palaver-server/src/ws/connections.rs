//! Connection registry: who is connected, on which sockets, subscribed to
//! what, and which single connection carries each user's voice session.

use palaver_protocol::ServerMessage;
use std::collections::{HashMap, HashSet};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

#[derive(Debug, Default, Clone)]
struct ConnectionGroups {
    communities: HashSet<Uuid>,
    conversations: HashSet<Uuid>,
    channels: HashSet<Uuid>,
}

/// What `remove_connection` observed, so the handler can finish the job
/// (presence broadcast, synthesized voice leave).
#[derive(Debug, Clone, Copy)]
pub struct DisconnectCleanup {
    pub user_id: Uuid,
    pub was_last_connection: bool,
    pub was_voice_connection: bool,
}

pub struct ConnectionManager {
    /// Map from connection ID to outbound message sender
    senders: RwLock<HashMap<Uuid, mpsc::UnboundedSender<String>>>,
    /// Map from connection ID to its user
    connection_users: RwLock<HashMap<Uuid, Uuid>>,
    /// Map from connection ID to its subscription groups
    connection_groups: RwLock<HashMap<Uuid, ConnectionGroups>>,
    /// Map from user ID to connection IDs (a user may have multiple connections)
    user_connections: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
    /// Broadcast groups
    community_subscribers: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
    conversation_subscribers: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
    channel_subscribers: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
    /// The single connection carrying each user's voice session
    voice_connections: RwLock<HashMap<Uuid, Uuid>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            connection_users: RwLock::new(HashMap::new()),
            connection_groups: RwLock::new(HashMap::new()),
            user_connections: RwLock::new(HashMap::new()),
            community_subscribers: RwLock::new(HashMap::new()),
            conversation_subscribers: RwLock::new(HashMap::new()),
            channel_subscribers: RwLock::new(HashMap::new()),
            voice_connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a connection. Returns true when this is the user's first
    /// connection (the offline->online transition).
    pub async fn add_connection(
        &self,
        connection_id: Uuid,
        user_id: Uuid,
        sender: mpsc::UnboundedSender<String>,
    ) -> bool {
        self.senders.write().await.insert(connection_id, sender);
        self.connection_users
            .write()
            .await
            .insert(connection_id, user_id);
        self.connection_groups
            .write()
            .await
            .insert(connection_id, ConnectionGroups::default());

        let mut users = self.user_connections.write().await;
        let connections = users.entry(user_id).or_default();
        let first = connections.is_empty();
        connections.insert(connection_id);

        tracing::info!(
            "User {} connected with connection ID {}",
            user_id,
            connection_id
        );
        first
    }

    /// Deregister a connection and drop all of its subscriptions. Returns
    /// what the caller needs for presence and voice cleanup.
    pub async fn remove_connection(&self, connection_id: Uuid) -> Option<DisconnectCleanup> {
        self.senders.write().await.remove(&connection_id);
        let user_id = self.connection_users.write().await.remove(&connection_id)?;

        if let Some(groups) = self.connection_groups.write().await.remove(&connection_id) {
            let mut communities = self.community_subscribers.write().await;
            for community_id in groups.communities {
                if let Some(subs) = communities.get_mut(&community_id) {
                    subs.remove(&connection_id);
                }
            }
            drop(communities);
            let mut conversations = self.conversation_subscribers.write().await;
            for conversation_id in groups.conversations {
                if let Some(subs) = conversations.get_mut(&conversation_id) {
                    subs.remove(&connection_id);
                }
            }
            drop(conversations);
            let mut channels = self.channel_subscribers.write().await;
            for channel_id in groups.channels {
                if let Some(subs) = channels.get_mut(&channel_id) {
                    subs.remove(&connection_id);
                }
            }
        }

        let was_last_connection = {
            let mut users = self.user_connections.write().await;
            if let Some(connections) = users.get_mut(&user_id) {
                connections.remove(&connection_id);
                let empty = connections.is_empty();
                if empty {
                    users.remove(&user_id);
                }
                empty
            } else {
                true
            }
        };

        let was_voice_connection = {
            let mut voice = self.voice_connections.write().await;
            if voice.get(&user_id) == Some(&connection_id) {
                voice.remove(&user_id);
                true
            } else {
                false
            }
        };

        tracing::info!(
            "User {} disconnected (connection ID {})",
            user_id,
            connection_id
        );
        Some(DisconnectCleanup {
            user_id,
            was_last_connection,
            was_voice_connection,
        })
    }

    pub async fn subscribe_community(&self, connection_id: Uuid, community_id: Uuid) {
        if let Some(groups) = self.connection_groups.write().await.get_mut(&connection_id) {
            groups.communities.insert(community_id);
        }
        self.community_subscribers
            .write()
            .await
            .entry(community_id)
            .or_default()
            .insert(connection_id);
    }

    pub async fn unsubscribe_community(&self, connection_id: Uuid, community_id: Uuid) {
        if let Some(groups) = self.connection_groups.write().await.get_mut(&connection_id) {
            groups.communities.remove(&community_id);
        }
        if let Some(subs) = self
            .community_subscribers
            .write()
            .await
            .get_mut(&community_id)
        {
            subs.remove(&connection_id);
        }
    }

    pub async fn subscribe_conversation(&self, connection_id: Uuid, conversation_id: Uuid) {
        if let Some(groups) = self.connection_groups.write().await.get_mut(&connection_id) {
            groups.conversations.insert(conversation_id);
        }
        self.conversation_subscribers
            .write()
            .await
            .entry(conversation_id)
            .or_default()
            .insert(connection_id);
    }

    pub async fn subscribe_channel(&self, connection_id: Uuid, channel_id: Uuid) {
        if let Some(groups) = self.connection_groups.write().await.get_mut(&connection_id) {
            groups.channels.insert(channel_id);
        }
        self.channel_subscribers
            .write()
            .await
            .entry(channel_id)
            .or_default()
            .insert(connection_id);
    }

    pub async fn unsubscribe_channel(&self, connection_id: Uuid, channel_id: Uuid) {
        if let Some(groups) = self.connection_groups.write().await.get_mut(&connection_id) {
            groups.channels.remove(&channel_id);
        }
        if let Some(subs) = self.channel_subscribers.write().await.get_mut(&channel_id) {
            subs.remove(&connection_id);
        }
    }

    /// Designate a connection as the user's voice connection, replacing any
    /// previous designation.
    pub async fn set_voice_connection(&self, user_id: Uuid, connection_id: Uuid) {
        self.voice_connections
            .write()
            .await
            .insert(user_id, connection_id);
    }

    pub async fn voice_connection_of(&self, user_id: Uuid) -> Option<Uuid> {
        self.voice_connections.read().await.get(&user_id).copied()
    }

    pub async fn clear_voice_connection(&self, user_id: Uuid) {
        self.voice_connections.write().await.remove(&user_id);
    }

    fn serialize(message: &ServerMessage) -> Option<String> {
        match serde_json::to_string(message) {
            Ok(json) => Some(json),
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                None
            }
        }
    }

    async fn send_raw(&self, connection_id: Uuid, json: &str) {
        if let Some(sender) = self.senders.read().await.get(&connection_id) {
            if sender.send(json.to_string()).is_err() {
                tracing::debug!("Connection {} is gone", connection_id);
            }
        }
    }

    pub async fn send_to_connection(&self, connection_id: Uuid, message: &ServerMessage) {
        let Some(json) = Self::serialize(message) else {
            return;
        };
        self.send_raw(connection_id, &json).await;
    }

    pub async fn send_to_user(&self, user_id: Uuid, message: &ServerMessage) {
        let Some(json) = Self::serialize(message) else {
            return;
        };
        let connections: Vec<Uuid> = self
            .user_connections
            .read()
            .await
            .get(&user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for connection_id in connections {
            self.send_raw(connection_id, &json).await;
        }
    }

    /// Send to every connection of a user except one (the "other devices"
    /// notifications).
    pub async fn send_to_user_except(
        &self,
        user_id: Uuid,
        excluded: Uuid,
        message: &ServerMessage,
    ) {
        let Some(json) = Self::serialize(message) else {
            return;
        };
        let connections: Vec<Uuid> = self
            .user_connections
            .read()
            .await
            .get(&user_id)
            .map(|set| set.iter().copied().filter(|c| *c != excluded).collect())
            .unwrap_or_default();
        for connection_id in connections {
            self.send_raw(connection_id, &json).await;
        }
    }

    /// Send to the user's designated voice connection, if any.
    pub async fn send_to_voice_connection(&self, user_id: Uuid, message: &ServerMessage) {
        let Some(connection_id) = self.voice_connection_of(user_id).await else {
            return;
        };
        self.send_to_connection(connection_id, message).await;
    }

    pub async fn broadcast_to_community(&self, community_id: Uuid, message: &ServerMessage) {
        let Some(json) = Self::serialize(message) else {
            return;
        };
        let subscribers: Vec<Uuid> = self
            .community_subscribers
            .read()
            .await
            .get(&community_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for connection_id in subscribers {
            self.send_raw(connection_id, &json).await;
        }
    }

    pub async fn broadcast_to_channel(&self, channel_id: Uuid, message: &ServerMessage) {
        let Some(json) = Self::serialize(message) else {
            return;
        };
        let subscribers: Vec<Uuid> = self
            .channel_subscribers
            .read()
            .await
            .get(&channel_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for connection_id in subscribers {
            self.send_raw(connection_id, &json).await;
        }
    }

    pub async fn broadcast_to_conversation(&self, conversation_id: Uuid, message: &ServerMessage) {
        let Some(json) = Self::serialize(message) else {
            return;
        };
        let subscribers: Vec<Uuid> = self
            .conversation_subscribers
            .read()
            .await
            .get(&conversation_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for connection_id in subscribers {
            self.send_raw(connection_id, &json).await;
        }
    }

    pub async fn is_user_online(&self, user_id: Uuid) -> bool {
        self.user_connections
            .read()
            .await
            .get(&user_id)
            .map(|connections| !connections.is_empty())
            .unwrap_or(false)
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

use crate::error::Result;
use crate::perms::PermissionOracle;
use crate::sfu::{SfuEvent, SfuRegistry};
use crate::stores::{CommunityStore, MessageStore};
use crate::voice::{ControllerSessions, ScreenShareViewerSet, VoiceDirectory};
use crate::ws::connections::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct Config {
    pub bind_address: String,
    pub jwt_secret: String,
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
    pub ice_connect_timeout: Duration,
}

#[derive(Clone)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let jwt_secret = std::env::var("JWT_SECRET").unwrap_or_else(|_| {
            tracing::warn!("JWT_SECRET not set, using default (insecure for production!)");
            "dev-secret-change-in-production".to_string()
        });

        let stun_servers = std::env::var("STUN_SERVERS")
            .map(|s| s.split(',').map(String::from).collect())
            .unwrap_or_else(|_| {
                vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(),
                ]
            });

        // TURN_SERVERS is a comma list of url|username|credential entries.
        let turn_servers = std::env::var("TURN_SERVERS")
            .map(|s| {
                s.split(',')
                    .filter_map(|entry| {
                        let mut parts = entry.splitn(3, '|');
                        Some(TurnServer {
                            url: parts.next()?.to_string(),
                            username: parts.next()?.to_string(),
                            credential: parts.next()?.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let ice_connect_timeout = std::env::var("ICE_CONNECT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(30));

        Ok(Config {
            bind_address,
            jwt_secret,
            stun_servers,
            turn_servers,
            ice_connect_timeout,
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub connections: Arc<ConnectionManager>,
    pub directory: Arc<VoiceDirectory>,
    pub viewers: Arc<ScreenShareViewerSet>,
    pub controllers: Arc<ControllerSessions>,
    pub oracle: PermissionOracle,
    pub communities: Arc<dyn CommunityStore>,
    pub sfu: Arc<SfuRegistry>,
}

impl AppState {
    /// Assemble the process-wide components. The returned receiver is the
    /// SFU event stream; `ws::events::run_sfu_events` must consume it.
    pub fn new(
        config: Config,
        communities: Arc<dyn CommunityStore>,
        messages: Arc<dyn MessageStore>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SfuEvent>)> {
        let viewers = Arc::new(ScreenShareViewerSet::new());

        let turn_servers: Vec<(String, String, String)> = config
            .turn_servers
            .iter()
            .map(|t| (t.url.clone(), t.username.clone(), t.credential.clone()))
            .collect();
        let (sfu, sfu_events) = SfuRegistry::new(
            config.stun_servers.clone(),
            turn_servers,
            config.ice_connect_timeout,
            viewers.clone(),
        )?;

        let oracle = PermissionOracle::new(communities.clone(), messages);

        Ok((
            Self {
                config,
                connections: Arc::new(ConnectionManager::new()),
                directory: Arc::new(VoiceDirectory::new()),
                viewers,
                controllers: Arc::new(ControllerSessions::new()),
                oracle,
                communities,
                sfu,
            },
            sfu_events,
        ))
    }
}

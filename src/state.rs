use crate::{
    config::Config,
    repository::ConversationRepository,
    services::{ConversationService, IdentityVerifier, TransactionPolicies},
    websocket::{
        bridge::{BridgeEvent, EventBridge},
        dispatcher::BroadcastDispatcher,
        presence::PresenceTracker,
        ConnectionRegistry,
    },
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Heartbeat settings for realtime sessions
#[derive(Debug, Clone, Copy)]
pub struct WsSettings {
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
}

impl Default for WsSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            client_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&Config> for WsSettings {
    fn from(config: &Config) -> Self {
        Self {
            heartbeat_interval: config.ws_heartbeat_interval,
            client_timeout: config.ws_client_timeout,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ConversationService>,
    pub registry: ConnectionRegistry,
    pub dispatcher: BroadcastDispatcher,
    pub presence: PresenceTracker,
    pub identity: Arc<dyn IdentityVerifier>,
    pub ws: WsSettings,
}

impl AppState {
    /// Wire the service graph. The returned receiver is the bridge's only
    /// subscriber and must be handed to `BroadcastDispatcher::spawn_relay`.
    pub fn new(
        repo: Arc<dyn ConversationRepository>,
        identity: Arc<dyn IdentityVerifier>,
        policies: TransactionPolicies,
        ws: WsSettings,
    ) -> (Self, UnboundedReceiver<BridgeEvent>) {
        let (bridge, rx) = EventBridge::channel();
        let service = Arc::new(ConversationService::new(repo, bridge, policies));
        let registry = ConnectionRegistry::new();
        let dispatcher = BroadcastDispatcher::new(registry.clone(), service.access().clone());
        let presence = PresenceTracker::new(registry.clone());

        let state = Self {
            service,
            registry,
            dispatcher,
            presence,
            identity,
            ws,
        };
        (state, rx)
    }
}

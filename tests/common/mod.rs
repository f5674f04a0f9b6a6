//! Shared fixtures: in-memory store, wired service and channel-backed connections

#![allow(dead_code)]

use clinic_messaging_service::repository::InMemoryRepository;
use clinic_messaging_service::services::{
    ConversationService, JwtIdentityVerifier, TransactionPolicies, TransactionPolicy,
};
use clinic_messaging_service::state::{AppState, WsSettings};
use clinic_messaging_service::websocket::bridge::{BridgeEvent, EventBridge};
use clinic_messaging_service::websocket::ConnectionId;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use uuid::Uuid;

pub const TEST_SECRET: &str = "test-signing-secret";

pub fn fast_policies() -> TransactionPolicies {
    let policy = TransactionPolicy {
        timeout: Duration::from_secs(2),
        max_retries: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        jitter: false,
    };
    TransactionPolicies {
        group: policy.clone(),
        initial_message: policy,
    }
}

pub struct Fixture {
    pub repo: InMemoryRepository,
    pub service: ConversationService,
    pub events: UnboundedReceiver<BridgeEvent>,
}

impl Fixture {
    pub fn new() -> Self {
        let repo = InMemoryRepository::new();
        let (bridge, events) = EventBridge::channel();
        let service = ConversationService::new(Arc::new(repo.clone()), bridge, fast_policies());
        Self {
            repo,
            service,
            events,
        }
    }

    /// Register `n` fresh users
    pub async fn users(&self, n: usize) -> Vec<Uuid> {
        let ids: Vec<Uuid> = (0..n).map(|_| Uuid::new_v4()).collect();
        self.repo.register_users(&ids).await;
        ids
    }

    pub fn drain_events(&mut self) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Application state over a fresh in-memory store with HS256 test tokens
pub fn app_state() -> (AppState, InMemoryRepository, UnboundedReceiver<BridgeEvent>) {
    let repo = InMemoryRepository::new();
    let identity = Arc::new(JwtIdentityVerifier::hs256(TEST_SECRET, None));
    let (state, rx) = AppState::new(
        Arc::new(repo.clone()),
        identity,
        fast_policies(),
        WsSettings::default(),
    );
    (state, repo, rx)
}

pub fn token_for(user_id: Uuid) -> String {
    let claims = serde_json::json!({
        "sub": user_id.to_string(),
        "exp": chrono::Utc::now().timestamp() + 3600,
    });
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .unwrap()
}

/// A registered connection whose outbound frames can be inspected
pub struct TestClient {
    pub user_id: Uuid,
    pub connection_id: ConnectionId,
    pub rx: UnboundedReceiver<String>,
}

impl TestClient {
    pub async fn connect(state: &AppState, user_id: Uuid) -> Self {
        let (tx, rx) = unbounded_channel();
        let connection_id = state.registry.connect(user_id, tx).await;
        Self {
            user_id,
            connection_id,
            rx,
        }
    }

    pub fn frames(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    /// Frames of one event kind, discarding the rest
    pub fn take(&mut self, event: &str) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|f| f["event"] == event)
            .collect()
    }

    pub async fn send(&self, state: &AppState, text: &str) {
        state
            .dispatcher
            .handle_frame(self.connection_id, self.user_id, text)
            .await;
    }
}

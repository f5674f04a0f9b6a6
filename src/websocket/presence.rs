//! Online/offline state derived from the connection registry

use super::events::ServerEvent;
use super::ConnectionRegistry;
use uuid::Uuid;

/// Frame announcing a presence change to every connection
pub(crate) fn presence_frame(user_id: Uuid, online: bool) -> Option<String> {
    let event = if online {
        ServerEvent::UserOnline { user_id }
    } else {
        ServerEvent::UserOffline { user_id }
    };
    match event.to_frame() {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::error!(error = %e, %user_id, "failed to encode presence event");
            None
        }
    }
}

#[derive(Clone)]
pub struct PresenceTracker {
    registry: ConnectionRegistry,
}

impl PresenceTracker {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.registry.is_online(user_id).await
    }

    pub async fn online_users(&self) -> Vec<Uuid> {
        self.registry.online_users().await
    }

    /// Subset of `user_ids` currently connected, in input order
    pub async fn online_among(&self, user_ids: &[Uuid]) -> Vec<Uuid> {
        let mut online = Vec::new();
        for user_id in user_ids {
            if self.registry.is_online(*user_id).await {
                online.push(*user_id);
            }
        }
        online
    }
}

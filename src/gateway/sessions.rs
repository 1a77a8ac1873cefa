//! Registered agent sessions, keyed by instance id.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::AgentIdentity;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub identity: AgentIdentity,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Registration>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or refresh a session. Returns true if the instance was new.
    pub fn register(&self, identity: AgentIdentity) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let instance_id = identity.instance_id.clone();
        let registration = Registration {
            identity,
            registered_at: Utc::now(),
        };
        sessions.insert(instance_id, registration).is_none()
    }

    pub fn unregister(&self, instance_id: &str) -> Option<Registration> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(instance_id)
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(instance_id)
    }

    pub fn get(&self, instance_id: &str) -> Option<Registration> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instance_id)
            .cloned()
    }

    /// All registrations, ordered by instance id.
    pub fn list(&self) -> Vec<Registration> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<_> = sessions.values().cloned().collect();
        list.sort_by(|a, b| a.identity.instance_id.cmp(&b.identity.instance_id));
        list
    }

    /// Broadcast fan-out set: every registered instance except the sender.
    pub fn broadcast_targets(&self, sender_instance: &str) -> Vec<String> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut targets: Vec<_> = sessions
            .keys()
            .filter(|id| id.as_str() != sender_instance)
            .cloned()
            .collect();
        targets.sort();
        targets
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type BackendName = String;
pub type ConversationId = String;

/// A conversation pinned to one backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub begin_time: DateTime<Utc>,
    pub latest_time: DateTime<Utc>,
}

impl Conversation {
    pub fn new<I>(id: I, now: DateTime<Utc>) -> Self
    where
        I: Into<ConversationId>,
    {
        Conversation {
            id: id.into(),
            begin_time: now,
            latest_time: now,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.latest_time = now;
    }
}

/// The backend that currently holds a conversation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Owner {
    pub name: BackendName,
    pub online: bool,
}

/// Serializable view of one backend entry. Locks and derived values are not part of it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSnapshot {
    pub name: BackendName,
    pub online: bool,
    #[serde(default)]
    pub conversations: BTreeMap<ConversationId, Conversation>,
}

impl BackendSnapshot {
    pub fn weight(&self) -> usize {
        self.conversations.len()
    }
}

/// Serializable view of the whole registry, used for persistence and the admin API.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(default)]
    pub endpoints: BTreeMap<BackendName, BackendSnapshot>,
}

impl RegistrySnapshot {
    pub fn conversation_count(&self) -> usize {
        self.endpoints.values().map(BackendSnapshot::weight).sum()
    }
}

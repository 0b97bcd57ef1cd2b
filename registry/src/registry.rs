use crate::metrics_defs::{BACKENDS_ONLINE, BACKENDS_TOTAL};
use crate::types::{
    BackendName, BackendSnapshot, Conversation, ConversationId, Owner, RegistrySnapshot,
};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use shared::gauge;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// One member of the backend pool and the conversations pinned to it.
struct Backend {
    name: BackendName,
    online: AtomicBool,
    conversations: Mutex<HashMap<ConversationId, Conversation>>,
}

impl Backend {
    fn new(name: BackendName, online: bool) -> Self {
        Backend {
            name,
            online: AtomicBool::new(online),
            conversations: Mutex::new(HashMap::new()),
        }
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    /// Returns the previous value.
    fn set_online(&self, online: bool) -> bool {
        self.online.swap(online, Ordering::Relaxed)
    }

    fn weight(&self) -> usize {
        self.conversations.lock().len()
    }

    fn holds(&self, conversation: &str) -> bool {
        self.conversations.lock().contains_key(conversation)
    }

    /// Refreshes `latest_time` if the conversation is already here.
    fn touch(&self, conversation: &str, now: DateTime<Utc>) -> bool {
        match self.conversations.lock().get_mut(conversation) {
            Some(existing) => {
                existing.touch(now);
                true
            }
            None => false,
        }
    }

    fn insert(&self, conversation: &str, now: DateTime<Utc>) {
        self.conversations.lock().insert(
            conversation.to_string(),
            Conversation::new(conversation, now),
        );
    }

    fn remove(&self, conversation: &str) -> bool {
        self.conversations.lock().remove(conversation).is_some()
    }

    fn snapshot(&self) -> BackendSnapshot {
        let conversations = self.conversations.lock();
        BackendSnapshot {
            name: self.name.clone(),
            online: self.is_online(),
            conversations: conversations
                .iter()
                .map(|(id, c)| (id.clone(), c.clone()))
                .collect(),
        }
    }
}

/// Result of recording an assignment learned from a backend response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Assignment {
    Created,
    Refreshed,
    /// The conversation was held by another backend and now lives here.
    Moved { from: BackendName },
    /// The backend is not in the registry. Nothing was recorded.
    UnknownBackend,
}

/// Changes made by one membership reconciliation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub added: Vec<BackendName>,
    pub came_online: Vec<BackendName>,
    pub went_offline: Vec<BackendName>,
}

impl ReconcileSummary {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.came_online.is_empty() && self.went_offline.is_empty()
    }
}

/// The backend pool and the conversation affinity table.
///
/// The map itself is guarded by a registry-wide lock which is only taken for writing
/// when entries are created, when the registry is restored, or when a conversation has
/// to be created in (or moved to) a backend. Each backend guards its own conversation
/// table so concurrent updates on different backends do not contend.
pub struct ServiceRegistry {
    endpoints: RwLock<HashMap<BackendName, Backend>>,
    // Set once the first membership snapshot has been applied.
    membership_known: AtomicBool,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        ServiceRegistry {
            endpoints: RwLock::new(HashMap::new()),
            membership_known: AtomicBool::new(false),
        }
    }

    /// Pins `conversation` to `backend`, or refreshes the pin if it already exists.
    /// Unknown backends are ignored.
    pub fn set_assignment(&self, backend: &str, conversation: &str) -> Assignment {
        {
            let endpoints = self.endpoints.read();
            let Some(entry) = endpoints.get(backend) else {
                return Assignment::UnknownBackend;
            };
            if entry.touch(conversation, Utc::now()) {
                return Assignment::Refreshed;
            }
        }

        // Creating a conversation runs under the write lock so the same id can never be
        // inserted into two tables by concurrent responses.
        let endpoints = self.endpoints.write();
        let Some(entry) = endpoints.get(backend) else {
            return Assignment::UnknownBackend;
        };
        let now = Utc::now();
        if entry.touch(conversation, now) {
            return Assignment::Refreshed;
        }

        let mut moved_from = None;
        for other in endpoints.values().filter(|e| e.name != backend) {
            if other.remove(conversation) {
                moved_from = Some(other.name.clone());
            }
        }
        entry.insert(conversation, now);

        match moved_from {
            Some(from) => Assignment::Moved { from },
            None => Assignment::Created,
        }
    }

    pub fn find_owner(&self, conversation: &str) -> Option<Owner> {
        let endpoints = self.endpoints.read();
        endpoints
            .values()
            .find(|entry| entry.holds(conversation))
            .map(|entry| Owner {
                name: entry.name.clone(),
                online: entry.is_online(),
            })
    }

    /// Removes the conversation from whichever backend holds it. Returns false if no
    /// backend held it.
    pub fn remove_conversation(&self, conversation: &str) -> bool {
        let endpoints = self.endpoints.read();
        let mut removed = false;
        for entry in endpoints.values() {
            removed |= entry.remove(conversation);
        }
        removed
    }

    pub fn is_online(&self, backend: &str) -> bool {
        self.endpoints
            .read()
            .get(backend)
            .is_some_and(Backend::is_online)
    }

    /// The online backend with the fewest conversations. Ties go to the
    /// lexicographically smallest name.
    pub fn least_loaded_online(&self) -> Option<BackendName> {
        let endpoints = self.endpoints.read();
        endpoints
            .values()
            .filter(|entry| entry.is_online())
            .map(|entry| (entry.weight(), &entry.name))
            .min()
            .map(|(_, name)| name.clone())
    }

    pub fn weight(&self, backend: &str) -> Option<usize> {
        self.endpoints.read().get(backend).map(Backend::weight)
    }

    /// Applies a full membership snapshot. Backends are never removed, only marked
    /// offline, so their conversations survive a restart of the backend.
    pub fn reconcile_membership(&self, current: &BTreeSet<BackendName>) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let mut endpoints = self.endpoints.write();

        for name in current {
            match endpoints.get(name) {
                Some(entry) => {
                    if !entry.set_online(true) {
                        summary.came_online.push(name.clone());
                    }
                }
                None => {
                    endpoints.insert(name.clone(), Backend::new(name.clone(), true));
                    summary.added.push(name.clone());
                }
            }
        }

        for entry in endpoints.values() {
            if !current.contains(&entry.name) && entry.set_online(false) {
                summary.went_offline.push(entry.name.clone());
            }
        }
        summary.came_online.sort();
        summary.went_offline.sort();

        let online = endpoints.values().filter(|e| e.is_online()).count();
        gauge!(BACKENDS_ONLINE).set(online as f64);
        gauge!(BACKENDS_TOTAL).set(endpoints.len() as f64);
        self.membership_known.store(true, Ordering::Relaxed);

        summary
    }

    /// True once a membership snapshot has been applied since startup.
    pub fn has_membership(&self) -> bool {
        self.membership_known.load(Ordering::Relaxed)
    }

    pub fn backend_count(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn online_count(&self) -> usize {
        self.endpoints
            .read()
            .values()
            .filter(|e| e.is_online())
            .count()
    }

    /// Drops conversations that have not been used for longer than `max_idle`.
    /// Returns how many were removed.
    pub fn prune_idle(&self, max_idle: Duration) -> usize {
        let Some(cutoff) = TimeDelta::from_std(max_idle)
            .ok()
            .and_then(|idle| Utc::now().checked_sub_signed(idle))
        else {
            return 0;
        };

        let endpoints = self.endpoints.read();
        let mut pruned = 0;
        for entry in endpoints.values() {
            let mut conversations = entry.conversations.lock();
            let before = conversations.len();
            conversations.retain(|_, c| c.latest_time >= cutoff);
            pruned += before - conversations.len();
        }
        pruned
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let endpoints = self.endpoints.read();
        RegistrySnapshot {
            endpoints: endpoints
                .iter()
                .map(|(name, entry)| (name.clone(), entry.snapshot()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    /// Replaces the registry contents with `snapshot`. Locks are created fresh. A
    /// conversation listed under several backends is kept only under the first one
    /// in name order.
    pub fn restore(&self, snapshot: RegistrySnapshot) {
        let mut seen: HashSet<ConversationId> = HashSet::new();
        let mut restored = HashMap::with_capacity(snapshot.endpoints.len());

        for (name, backend) in snapshot.endpoints {
            let entry = Backend::new(name.clone(), backend.online);
            {
                let mut conversations = entry.conversations.lock();
                for (id, conversation) in backend.conversations {
                    if !seen.insert(id.clone()) {
                        tracing::warn!(
                            backend = %name,
                            conversation = %id,
                            "dropping duplicate conversation from snapshot"
                        );
                        continue;
                    }
                    conversations.insert(id, conversation);
                }
            }
            restored.insert(name, entry);
        }

        *self.endpoints.write() = restored;
    }
}

use serde::Deserialize;
use std::time::Duration;

const DEFAULT_SHUTDOWN_FLUSH_TIMEOUT_SECS: u64 = 10;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("discovery service name cannot be empty")]
    EmptyServiceName,

    #[error("static discovery needs at least one member")]
    NoStaticMembers,

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

/// Where the backend membership comes from.
#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "source")]
pub enum DiscoverySource {
    /// Watch the Endpoints objects of the namespace using the in-cluster service account.
    Kubernetes,
    /// A fixed member list, announced once at startup.
    Static { members: Vec<String> },
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Discovery {
    /// Name of the backend service. Membership events for other services are ignored.
    pub service: String,
    /// Namespace to watch. Defaults to the namespace of the service account.
    pub namespace: Option<String>,
    #[serde(flatten)]
    pub source: DiscoverySource,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum SnapshotStoreType {
    Filesystem { path: String },
    None,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct SnapshotStore {
    #[serde(flatten)]
    pub r#type: SnapshotStoreType,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        SnapshotStore {
            r#type: SnapshotStoreType::Filesystem {
                path: "/cache/.registry_cache".into(),
            },
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Config {
    pub discovery: Discovery,
    #[serde(default)]
    pub snapshot_store: SnapshotStore,
    /// Also write the snapshot periodically, not only on shutdown.
    pub flush_interval_secs: Option<u64>,
    /// Forget conversations that have not been used for this long. Unset keeps them
    /// forever.
    pub idle_conversation_ttl_secs: Option<u64>,
    #[serde(default = "default_shutdown_flush_timeout_secs")]
    pub shutdown_flush_timeout_secs: u64,
}

fn default_shutdown_flush_timeout_secs() -> u64 {
    DEFAULT_SHUTDOWN_FLUSH_TIMEOUT_SECS
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.discovery.service.is_empty() {
            return Err(ValidationError::EmptyServiceName);
        }

        if let DiscoverySource::Static { members } = &self.discovery.source
            && members.is_empty()
        {
            return Err(ValidationError::NoStaticMembers);
        }

        if self.flush_interval_secs == Some(0) {
            return Err(ValidationError::ZeroInterval("flush_interval_secs"));
        }
        if self.idle_conversation_ttl_secs == Some(0) {
            return Err(ValidationError::ZeroInterval("idle_conversation_ttl_secs"));
        }
        if self.shutdown_flush_timeout_secs == 0 {
            return Err(ValidationError::ZeroInterval("shutdown_flush_timeout_secs"));
        }

        Ok(())
    }

    pub fn flush_interval(&self) -> Option<Duration> {
        self.flush_interval_secs.map(Duration::from_secs)
    }

    pub fn idle_conversation_ttl(&self) -> Option<Duration> {
        self.idle_conversation_ttl_secs.map(Duration::from_secs)
    }

    pub fn shutdown_flush_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_flush_timeout_secs)
    }
}

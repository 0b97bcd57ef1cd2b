//! Snapshot providers let conversation affinity survive a restart of the router.
//! The registry is written out on shutdown (and optionally on an interval) and read
//! back at startup.
use crate::config::SnapshotStoreType;
use crate::metrics_defs::{CONVERSATIONS_EVICTED, SNAPSHOT_FLUSH_DURATION};
use crate::registry::ServiceRegistry;
use crate::types::RegistrySnapshot;
use async_trait::async_trait;
use shared::{counter, histogram};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(thiserror::Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("snapshot flush timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Returns `None` when no snapshot has been stored yet.
    async fn load(&self) -> Result<Option<RegistrySnapshot>, PersistenceError>;
    async fn store(&self, snapshot: &RegistrySnapshot) -> Result<(), PersistenceError>;
}

pub fn get_provider(store_type: &SnapshotStoreType) -> Arc<dyn SnapshotProvider> {
    match store_type {
        SnapshotStoreType::Filesystem { path } => Arc::new(FilesystemSnapshotProvider::new(path)),
        SnapshotStoreType::None => Arc::new(NoopSnapshotProvider {}),
    }
}

// Keeps nothing. Affinity is lost on restart.
pub struct NoopSnapshotProvider {}

#[async_trait]
impl SnapshotProvider for NoopSnapshotProvider {
    async fn load(&self) -> Result<Option<RegistrySnapshot>, PersistenceError> {
        tracing::warn!("snapshot store disabled, conversation affinity will not survive restarts");
        Ok(None)
    }

    async fn store(&self, _snapshot: &RegistrySnapshot) -> Result<(), PersistenceError> {
        Ok(())
    }
}

/// Stores the snapshot as JSON in a single file.
pub struct FilesystemSnapshotProvider {
    path: PathBuf,
}

impl FilesystemSnapshotProvider {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FilesystemSnapshotProvider {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl SnapshotProvider for FilesystemSnapshotProvider {
    async fn load(&self) -> Result<Option<RegistrySnapshot>, PersistenceError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn store(&self, snapshot: &RegistrySnapshot) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec(snapshot)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write next to the target and rename so a crash mid-write leaves the old file.
        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        tracing::debug!(path = ?self.path, bytes = bytes.len(), "stored registry snapshot");
        Ok(())
    }
}

/// Moves registry state between memory and a snapshot provider.
#[derive(Clone)]
pub struct PersistenceGateway {
    registry: Arc<ServiceRegistry>,
    provider: Arc<dyn SnapshotProvider>,
}

impl PersistenceGateway {
    pub fn new(registry: Arc<ServiceRegistry>, provider: Arc<dyn SnapshotProvider>) -> Self {
        PersistenceGateway { registry, provider }
    }

    /// Restores the last stored snapshot into the registry. A missing or unreadable
    /// snapshot leaves the registry empty; membership discovery fills it in.
    /// Returns true if a snapshot was restored.
    pub async fn load(&self) -> bool {
        match self.provider.load().await {
            Ok(Some(snapshot)) => {
                let backends = snapshot.endpoints.len();
                let conversations = snapshot.conversation_count();
                self.registry.restore(snapshot);
                tracing::info!(backends, conversations, "restored registry snapshot");
                true
            }
            Ok(None) => {
                tracing::info!("no registry snapshot found, starting empty");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not load registry snapshot, starting empty");
                false
            }
        }
    }

    /// Writes the current registry state, replacing the previous snapshot.
    pub async fn flush(&self) -> Result<(), PersistenceError> {
        let start = Instant::now();
        let snapshot = self.registry.snapshot();
        let result = self.provider.store(&snapshot).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        histogram!(SNAPSHOT_FLUSH_DURATION, "status" => status)
            .record(start.elapsed().as_secs_f64());

        result
    }

    /// Flush used on shutdown. Never waits longer than `timeout` and only logs failures,
    /// so it cannot hold up process exit.
    pub async fn flush_on_shutdown(&self, timeout: Duration) {
        let result = match tokio::time::timeout(timeout, self.flush()).await {
            Ok(result) => result,
            Err(_) => Err(PersistenceError::Timeout(timeout)),
        };

        match result {
            Ok(()) => tracing::info!("registry snapshot flushed"),
            Err(e) => tracing::error!(error = %e, "failed to flush registry snapshot"),
        }
    }

    /// Periodic flushing and idle conversation pruning. Returns immediately if neither
    /// is configured, otherwise runs until `shutdown`.
    pub async fn run_maintenance(
        &self,
        flush_interval: Option<Duration>,
        idle_ttl: Option<Duration>,
        shutdown: CancellationToken,
    ) {
        if flush_interval.is_none() && idle_ttl.is_none() {
            return;
        }

        let period = flush_interval.unwrap_or(MAINTENANCE_INTERVAL);
        let mut ticker = tokio::time::interval(period);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }

            if let Some(ttl) = idle_ttl {
                let pruned = self.registry.prune_idle(ttl);
                if pruned > 0 {
                    counter!(CONVERSATIONS_EVICTED, "reason" => "idle").increment(pruned as u64);
                    tracing::info!(pruned, "pruned idle conversations");
                }
            }

            if flush_interval.is_some()
                && let Err(e) = self.flush().await
            {
                tracing::error!(error = %e, "periodic registry snapshot flush failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn populated_registry() -> Arc<ServiceRegistry> {
        let registry = Arc::new(ServiceRegistry::new());
        registry.reconcile_membership(&BTreeSet::from(["a".to_string(), "b".to_string()]));
        registry.set_assignment("a", "x");
        registry.set_assignment("a", "y");
        registry.set_assignment("b", "z");
        registry
    }

    #[tokio::test]
    async fn test_filesystem_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FilesystemSnapshotProvider::new(dir.path().join("registry.json"));
        assert!(provider.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_filesystem_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("registry.json");
        let provider = FilesystemSnapshotProvider::new(&path);
        let snapshot = populated_registry().snapshot();

        provider.store(&snapshot).await.unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("nested").join("registry.json.tmp").exists());
        assert_eq!(provider.load().await.unwrap(), Some(snapshot.clone()));

        // overwrite with a smaller snapshot
        provider.store(&RegistrySnapshot::default()).await.unwrap();
        assert_eq!(
            provider.load().await.unwrap(),
            Some(RegistrySnapshot::default())
        );
    }

    #[tokio::test]
    async fn test_filesystem_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, b"{not json").unwrap();

        let provider = FilesystemSnapshotProvider::new(&path);
        assert!(matches!(
            provider.load().await,
            Err(PersistenceError::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_gateway_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStoreType::Filesystem {
            path: dir.path().join("registry.json").to_str().unwrap().into(),
        };

        let registry = populated_registry();
        let gateway = PersistenceGateway::new(registry.clone(), get_provider(&store));
        gateway.flush().await.unwrap();

        let restored = Arc::new(ServiceRegistry::new());
        let gateway = PersistenceGateway::new(restored.clone(), get_provider(&store));
        assert!(gateway.load().await);

        assert_eq!(restored.snapshot(), registry.snapshot());
        assert_eq!(restored.weight("a"), Some(2));
        assert_eq!(restored.find_owner("z").unwrap().name, "b");
    }

    #[tokio::test]
    async fn test_gateway_load_failures_start_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, b"garbage").unwrap();

        let registry = Arc::new(ServiceRegistry::new());
        let gateway = PersistenceGateway::new(
            registry.clone(),
            Arc::new(FilesystemSnapshotProvider::new(&path)),
        );
        assert!(!gateway.load().await);
        assert_eq!(registry.backend_count(), 0);

        let gateway = PersistenceGateway::new(registry.clone(), get_provider(&SnapshotStoreType::None));
        assert!(!gateway.load().await);
        assert!(gateway.flush().await.is_ok());
    }

    #[tokio::test]
    async fn test_flush_on_shutdown_does_not_fail() {
        let dir = tempfile::tempdir().unwrap();
        // a directory where the file should be makes the rename fail
        let path = dir.path().join("registry.json");
        std::fs::create_dir(&path).unwrap();

        let gateway = PersistenceGateway::new(
            populated_registry(),
            Arc::new(FilesystemSnapshotProvider::new(&path)),
        );
        assert!(gateway.flush().await.is_err());
        gateway.flush_on_shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_maintenance_flushes_periodically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let gateway = PersistenceGateway::new(
            populated_registry(),
            Arc::new(FilesystemSnapshotProvider::new(&path)),
        );

        let shutdown = CancellationToken::new();
        let task = {
            let gateway = gateway.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                gateway
                    .run_maintenance(Some(Duration::from_millis(20)), None, shutdown)
                    .await
            })
        };

        for _ in 0..50 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(path.exists());

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_maintenance_disabled() {
        let gateway = PersistenceGateway::new(
            populated_registry(),
            get_provider(&SnapshotStoreType::None),
        );
        // returns without waiting for shutdown
        gateway
            .run_maintenance(None, None, CancellationToken::new())
            .await;
    }
}

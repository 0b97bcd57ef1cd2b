mod admin_service;
pub mod affinity;
pub mod config;
pub mod errors;
pub mod metrics_defs;
mod proxy_service;
pub mod routing;
mod upstreams;

use admin_service::AdminService;
use errors::ProxyError;
use proxy_service::ProxyService;
use registry::discovery::{FeedItem, spawn_feed};
use registry::{MembershipReconciler, PersistenceGateway, ServiceRegistry, get_provider};
use shared::http::run_http_service;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use upstreams::Upstreams;

const FEED_BUFFER: usize = 16;

/// Runs the router until `shutdown` is cancelled or a component fails.
///
/// The registry is restored from the snapshot store before the listeners start and
/// flushed back to it on the way out, whichever way that is.
pub async fn run(config: config::Config, shutdown: CancellationToken) -> Result<(), ProxyError> {
    config.validate()?;

    // Cancelled on shutdown, and also when one component fails so the others stop.
    let tasks = shutdown.child_token();

    let (tx, rx) = mpsc::channel(FEED_BUFFER);
    let feed = spawn_feed(&config.registry.discovery, tx, tasks.clone())?;

    serve(config, rx, feed, tasks).await
}

/// Serves traffic with membership taken from `rx`. A feed error or a closed feed is
/// fatal: everything under `tasks` is stopped and the registry is flushed before the
/// error is returned.
async fn serve(
    config: config::Config,
    rx: mpsc::Receiver<FeedItem>,
    feed: JoinHandle<()>,
    tasks: CancellationToken,
) -> Result<(), ProxyError> {
    let registry_config = &config.registry;
    let service = registry_config.discovery.service.clone();

    let registry = Arc::new(ServiceRegistry::new());
    let gateway = PersistenceGateway::new(
        registry.clone(),
        get_provider(&registry_config.snapshot_store.r#type),
    );

    let proxy_service = match Upstreams::try_new(&config.backend, &service)
        .and_then(|upstreams| ProxyService::new(registry.clone(), upstreams))
    {
        Ok(proxy_service) => proxy_service,
        Err(e) => {
            tasks.cancel();
            let _ = feed.await;
            return Err(e);
        }
    };

    gateway.load().await;

    let maintenance = {
        let gateway = gateway.clone();
        let flush_interval = registry_config.flush_interval();
        let idle_ttl = registry_config.idle_conversation_ttl();
        let tasks = tasks.clone();
        tokio::spawn(async move {
            gateway
                .run_maintenance(flush_interval, idle_ttl, tasks)
                .await
        })
    };

    let reconciler = MembershipReconciler::new(registry.clone(), service);
    let proxy_task = run_http_service(
        &config.listener.host,
        config.listener.port,
        proxy_service,
        tasks.clone(),
    );
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        AdminService::new(registry.clone()),
        tasks.clone(),
    );

    let result = tokio::select! {
        result = reconciler.run(rx, tasks.clone()) => result.map_err(ProxyError::from),
        result = async { tokio::try_join!(proxy_task, admin_task) } => result.map(|_| ()),
    };
    if let Err(e) = &result {
        tracing::error!(error = %e, "router stopped");
    }

    tasks.cancel();
    if let Err(e) = feed.await {
        tracing::warn!(error = %e, "membership feed task failed");
    }
    if let Err(e) = maintenance.await {
        tracing::warn!(error = %e, "maintenance task failed");
    }
    gateway
        .flush_on_shutdown(registry_config.shutdown_flush_timeout())
        .await;

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry::discovery::{DiscoveryError, DiscoveryEvent};
    use registry::types::RegistrySnapshot;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn config_yaml(snapshot_path: &str) -> String {
        format!(
            r#"
listener:
    host: 127.0.0.1
    port: {}
admin_listener:
    host: 127.0.0.1
    port: {}
backend:
    port: 8080
registry:
    discovery:
        service: chatapi
        source: static
        members: [chat-0, chat-1]
    snapshot_store:
        type: filesystem
        path: {snapshot_path}
"#,
            free_port(),
            free_port(),
        )
    }

    #[tokio::test]
    async fn test_run_flushes_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let config: config::Config =
            serde_yaml::from_str(&config_yaml(path.to_str().unwrap())).unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(config, shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        assert!(handle.await.unwrap().is_ok());

        let snapshot: RegistrySnapshot =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(snapshot.endpoints.len(), 2);
        assert!(snapshot.endpoints["chat-0"].online);
    }

    #[tokio::test]
    async fn test_run_rejects_invalid_config() {
        let mut config: config::Config =
            serde_yaml::from_str(&config_yaml("/nonexistent/registry.json")).unwrap();
        config.listener.port = 0;

        let result = run(config, CancellationToken::new()).await;
        assert!(matches!(result, Err(ProxyError::Config(_))));
    }

    fn read_snapshot(path: &std::path::Path) -> RegistrySnapshot {
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_feed_error_stops_router() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let config: config::Config =
            serde_yaml::from_str(&config_yaml(path.to_str().unwrap())).unwrap();

        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        tx.send(Ok(DiscoveryEvent {
            service: "chatapi".into(),
            members: BTreeSet::from(["chat-0".to_string()]),
        }))
        .await
        .unwrap();
        tx.send(Err(DiscoveryError::Watch("endpoints watch gone".into())))
            .await
            .unwrap();

        let tasks = CancellationToken::new();
        let feed = tokio::spawn(async {});
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            serve(config, rx, feed, tasks.clone()),
        )
        .await
        .expect("router should stop on a feed error");

        assert!(matches!(
            result,
            Err(ProxyError::Discovery(DiscoveryError::Watch(_)))
        ));
        assert!(tasks.is_cancelled());

        // membership applied before the failure was flushed on the way out
        let snapshot = read_snapshot(&path);
        assert_eq!(snapshot.endpoints.len(), 1);
        assert!(snapshot.endpoints["chat-0"].online);
    }

    #[tokio::test]
    async fn test_closed_feed_stops_router() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let config: config::Config =
            serde_yaml::from_str(&config_yaml(path.to_str().unwrap())).unwrap();

        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        drop(tx);

        let tasks = CancellationToken::new();
        let feed = tokio::spawn(async {});
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            serve(config, rx, feed, tasks.clone()),
        )
        .await
        .expect("router should stop when the feed closes");

        assert!(matches!(
            result,
            Err(ProxyError::Discovery(DiscoveryError::FeedClosed))
        ));
        assert!(tasks.is_cancelled());
        assert!(read_snapshot(&path).endpoints.is_empty());
    }
}

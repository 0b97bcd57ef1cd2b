use crate::discovery::{DiscoveryError, DiscoveryEvent, FeedItem};
use crate::metrics_defs::MEMBERSHIP_SNAPSHOTS;
use crate::registry::{ReconcileSummary, ServiceRegistry};
use shared::counter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Applies membership snapshots for one backend service to the registry.
pub struct MembershipReconciler {
    registry: Arc<ServiceRegistry>,
    service: String,
}

impl MembershipReconciler {
    pub fn new(registry: Arc<ServiceRegistry>, service: String) -> Self {
        MembershipReconciler { registry, service }
    }

    /// Applies `event` if it belongs to the watched service.
    pub fn apply(&self, event: DiscoveryEvent) -> Option<ReconcileSummary> {
        if event.service != self.service {
            return None;
        }

        let summary = self.registry.reconcile_membership(&event.members);
        let changed = !summary.is_empty();
        counter!(MEMBERSHIP_SNAPSHOTS, "changed" => if changed { "true" } else { "false" })
            .increment(1);

        if changed {
            tracing::info!(
                service = %self.service,
                added = ?summary.added,
                came_online = ?summary.came_online,
                went_offline = ?summary.went_offline,
                "membership changed"
            );
        } else {
            tracing::debug!(service = %self.service, members = event.members.len(), "membership unchanged");
        }

        Some(summary)
    }

    /// Consumes the feed until `shutdown` fires. A feed error or the feed going away
    /// while not shutting down is returned to the caller; routing against a membership
    /// that can no longer be refreshed is not an option.
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<FeedItem>,
        shutdown: CancellationToken,
    ) -> Result<(), DiscoveryError> {
        loop {
            let item = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                item = rx.recv() => item,
            };

            match item {
                Some(Ok(event)) => {
                    self.apply(event);
                }
                Some(Err(e)) => return Err(e),
                None => return Err(DiscoveryError::FeedClosed),
            }
        }
    }
}

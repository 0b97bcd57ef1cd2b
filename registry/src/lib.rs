pub mod config;
pub mod discovery;
pub mod metrics_defs;
pub mod persistence;
pub mod reconciler;
pub mod registry;
pub mod types;

pub use persistence::{PersistenceGateway, get_provider};
pub use reconciler::MembershipReconciler;
pub use registry::ServiceRegistry;

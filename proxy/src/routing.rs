use crate::metrics_defs::{ROUTING_DECISIONS, ROUTING_FAILURES};
use registry::ServiceRegistry;
use registry::metrics_defs::CONVERSATIONS_EVICTED;
use shared::counter;

/// Query parameter naming a backend the client wants to talk to.
pub const INSTANCE_PARAM: &str = "instance";
/// Query parameter carrying the conversation the request belongs to.
pub const CONVERSATION_PARAM: &str = "conversationId";

/// Routing hints taken from the request target.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestHints {
    pub instance: Option<String>,
    pub conversation_id: Option<String>,
}

impl RequestHints {
    pub fn from_query(query: Option<&str>) -> Self {
        let mut hints = RequestHints::default();
        let Some(query) = query else {
            return hints;
        };

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                INSTANCE_PARAM if hints.instance.is_none() => {
                    hints.instance = Some(value.into_owned())
                }
                CONVERSATION_PARAM if hints.conversation_id.is_none() => {
                    hints.conversation_id = Some(value.into_owned())
                }
                _ => {}
            }
        }
        hints
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteReason {
    Override,
    Affinity,
    LeastLoaded,
}

impl RouteReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            RouteReason::Override => "override",
            RouteReason::Affinity => "affinity",
            RouteReason::LeastLoaded => "least_loaded",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub backend: String,
    pub reason: RouteReason,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RoutingError {
    #[error("no online backend available")]
    NoBackendAvailable,
}

/// Picks the backend for a request.
///
/// An override naming an online backend wins. Otherwise a known conversation stays on
/// its backend while that backend is online; a conversation whose backend went offline
/// is evicted and handled like a new one. New conversations go to the least loaded
/// online backend.
pub fn route(registry: &ServiceRegistry, hints: &RequestHints) -> Result<Route, RoutingError> {
    let route = select(registry, hints);

    match &route {
        Ok(route) => {
            counter!(ROUTING_DECISIONS, "reason" => route.reason.as_str()).increment(1);
        }
        Err(_) => {
            counter!(ROUTING_FAILURES).increment(1);
        }
    }
    route
}

fn select(registry: &ServiceRegistry, hints: &RequestHints) -> Result<Route, RoutingError> {
    if let Some(instance) = &hints.instance
        && registry.is_online(instance)
    {
        return Ok(Route {
            backend: instance.clone(),
            reason: RouteReason::Override,
        });
    }

    if let Some(conversation) = &hints.conversation_id
        && let Some(owner) = registry.find_owner(conversation)
    {
        if owner.online {
            return Ok(Route {
                backend: owner.name,
                reason: RouteReason::Affinity,
            });
        }

        // Not atomic with find_owner. Keep it that way: both take the registry read
        // lock, which is not reentrant once a writer is queued. A conversation
        // reassigned in between is evicted too and re-learned from the next response.
        if registry.remove_conversation(conversation) {
            counter!(CONVERSATIONS_EVICTED, "reason" => "offline").increment(1);
            tracing::info!(
                conversation = %conversation,
                backend = %owner.name,
                "backend offline, conversation evicted"
            );
        }
    }

    registry
        .least_loaded_online()
        .map(|backend| Route {
            backend,
            reason: RouteReason::LeastLoaded,
        })
        .ok_or(RoutingError::NoBackendAvailable)
}

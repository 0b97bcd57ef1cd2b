use crate::metrics_defs::ASSIGNMENTS;
use http::HeaderMap;
use registry::ServiceRegistry;
use registry::registry::Assignment;
use shared::counter;

/// Response header in which a backend names itself.
pub const INSTANCE_HEADER: &str = "instance";
/// Response header carrying the conversation the backend created or continued.
pub const CONVERSATION_HEADER: &str = "conversationid";
// Some clients send this literal instead of leaving the conversation out.
const UNDEFINED_CONVERSATION: &str = "undefined";

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Records the conversation the backend reports in its response headers. The backend,
/// not the client, decides which conversation a request belongs to, so this is the
/// only place new affinity is created.
pub fn learn(registry: &ServiceRegistry, headers: &HeaderMap) -> Option<Assignment> {
    let backend = header_value(headers, INSTANCE_HEADER)?;
    let conversation = header_value(headers, CONVERSATION_HEADER)?;
    if conversation == UNDEFINED_CONVERSATION {
        return None;
    }

    let assignment = registry.set_assignment(backend, conversation);
    let outcome = match &assignment {
        Assignment::Created => "created",
        Assignment::Refreshed => "refreshed",
        Assignment::Moved { .. } => "moved",
        Assignment::UnknownBackend => "unknown_backend",
    };
    counter!(ASSIGNMENTS, "outcome" => outcome).increment(1);

    match &assignment {
        Assignment::Created => {
            tracing::debug!(backend, conversation, "conversation assigned");
        }
        Assignment::Moved { from } => {
            tracing::info!(backend, conversation, from = %from, "conversation moved");
        }
        Assignment::UnknownBackend => {
            tracing::debug!(backend, conversation, "response names an unknown backend, ignoring");
        }
        Assignment::Refreshed => {}
    }

    Some(assignment)
}

//! Fans a prompt payload out to every live session of a configuration.

use serde_json::Value;

use mcp_gateway_error::GatewayError;

use crate::registry::ConnectionRegistry;

pub(crate) struct RouteOutcome {
    /// Sessions whose input stream accepted the payload.
    pub delivered: usize,
    /// Sessions that were live for the configuration when routing began.
    pub candidates: usize,
}

/// Delivery is best-effort per target: a failed write to one session is
/// logged and does not abort delivery to the others. Zero successes among
/// a non-empty candidate set is a delivery failure, distinct from "no
/// session found".
pub(crate) async fn route(
    registry: &ConnectionRegistry,
    config_id: i64,
    prompt: &Value,
) -> Result<RouteOutcome, GatewayError> {
    let sessions = registry.list_by_config(config_id);
    if sessions.is_empty() {
        return Err(GatewayError::NoActiveConnections);
    }

    let mut delivered = 0;
    for session in &sessions {
        match session.send_prompt(prompt).await {
            Ok(()) => {
                tracing::debug!(
                    connection_id = %session.connection_id(),
                    "prompt delivered"
                );
                delivered += 1;
            }
            Err(err) => {
                tracing::warn!(
                    connection_id = %session.connection_id(),
                    error = %err,
                    "failed to deliver prompt"
                );
            }
        }
    }

    if delivered == 0 {
        return Err(GatewayError::PromptDeliveryFailed);
    }

    Ok(RouteOutcome {
        delivered,
        candidates: sessions.len(),
    })
}

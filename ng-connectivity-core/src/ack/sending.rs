//! Turns the result of a physical publish into the acknowledgement it stands for.
//!
//! A publish resolves to
//! - nothing, when the target neither issues an acknowledgement nor answers,
//! - a live response, which acts as the acknowledgement of a live command,
//! - a command response or acknowledgement produced by the connector,
//! - or an error, which becomes a negative acknowledgement.

use ng_connectivity_models::{ConnectionId, Target};
use ng_connectivity_sdk::{
    Acknowledgement, AcknowledgementLabel, ConnectivityError, EntityId, ErrorResponse, PublishError, Signal,
};
use serde_json::json;
use tracing::warn;

/// Acknowledgement label a publish to `target` answers for, if the signal requested one.
pub fn expected_ack_label(signal: &Signal, target: &Target, connection_id: &ConnectionId) -> Option<AcknowledgementLabel> {
    let requested = signal.acknowledgement_requests().unwrap_or_default();
    if let Some(issued) = &target.issued_acknowledgement_label {
        let issued = issued.resolve_connection_id(connection_id.as_str());
        if requested.contains(&issued) {
            return Some(issued);
        }
    }
    None
}

/// Converts a publish result into the signal to send back upstream.
///
/// `None` means nothing has to be reported.
pub fn to_acknowledgement(
    result: Result<Option<Signal>, PublishError>,
    signal: &Signal,
    ack_label: Option<&AcknowledgementLabel>,
) -> Option<Signal> {
    let entity_id = signal.entity_id().cloned().unwrap_or_else(EntityId::unknown);
    let headers = signal.headers().clone();
    match result {
        Ok(Some(response)) => Some(response),
        Ok(None) => ack_label.map(|label| {
            warn!(
                label = %label,
                correlation_id = ?signal.correlation_id(),
                "Publish terminated without expected acknowledgement"
            );
            let ack = Acknowledgement::new(label.clone(), entity_id, 500, headers).with_payload(json!({
                "message": format!("Message sending terminated without the expected acknowledgement '{label}'."),
                "description": "Please contact the service team.",
            }));
            Signal::Acknowledgement(ack)
        }),
        Err(error) => {
            let (status, message, description) = match error.root_cause() {
                PublishError::Connectivity(e) => (e.status(), e.to_string(), e.description()),
                PublishError::Other { kind, message } => (500, format!("{kind}: {message}"), None),
                PublishError::Completion(inner) => (500, inner.to_string(), None),
            };
            let payload = json!({
                "message": message,
                "description": description,
            });
            let label = match ack_label {
                Some(label) => Some(label.clone()),
                None if signal.is_live_command() => Some(AcknowledgementLabel::live_response()),
                None => None,
            };
            match label {
                Some(label) => Some(Signal::Acknowledgement(
                    Acknowledgement::new(label, entity_id, status, headers).with_payload(payload),
                )),
                None if signal.headers().is_response_required() && matches!(signal, Signal::Command(_)) => {
                    let error = match error.root_cause() {
                        PublishError::Connectivity(e) => e.clone(),
                        _ => ConnectivityError::Internal { message },
                    };
                    Some(Signal::Error(ErrorResponse::new(entity_id, error, headers)))
                }
                None => None,
            }
        }
    }
}

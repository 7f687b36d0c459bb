//! The webhook endpoint.
//!
//! Thin translation layer: extract the three headers and the raw body,
//! hand them to the intake, and map the error taxonomy onto status
//! codes. Signature and payload failures are the caller's fault (4xx,
//! no retry); anything after the signature is 5xx so the platform
//! redelivers.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{debug, warn};

use crate::common::{ErrorCode, OrchestratorError};
use crate::kernel::intake::WebhookHeaders;

use super::super::app::AppState;

const EVENT_HEADER: &str = "x-github-event";
const DELIVERY_HEADER: &str = "x-github-delivery";
const SIGNATURE_HEADER: &str = "x-hub-signature-256";

pub async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let webhook_headers = WebhookHeaders {
        event: header(&headers, EVENT_HEADER),
        delivery: header(&headers, DELIVERY_HEADER),
        signature: header(&headers, SIGNATURE_HEADER),
    };

    match state
        .orchestrator
        .intake
        .ingest(&webhook_headers, &body)
        .await
    {
        Ok((ack, outcome)) => {
            debug!(?outcome, "delivery processed");
            (StatusCode::OK, Json(ack)).into_response()
        }
        Err(e) => error_response(e),
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn error_response(error: OrchestratorError) -> Response {
    let code = error.code();
    let status = match &error {
        OrchestratorError::Validation(reason) if reason == "bad_signature" => {
            StatusCode::UNAUTHORIZED
        }
        OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::Security(_) => StatusCode::UNAUTHORIZED,
        OrchestratorError::Conflict(_) => StatusCode::CONFLICT,
        OrchestratorError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        OrchestratorError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        warn!(code = code.as_str(), error = %error, "delivery failed, platform will retry");
    } else {
        debug!(code = code.as_str(), error = %error, "delivery rejected");
    }

    let message = match &error {
        // Validation reasons are safe, stable strings (`bad_signature`,
        // `bad_payload`, `missing_event`).
        OrchestratorError::Validation(reason) => reason.clone(),
        other => other.code().as_str().to_string(),
    };

    (
        status,
        Json(json!({ "error": message, "code": code.as_str() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(error: OrchestratorError) -> StatusCode {
        error_response(error).status()
    }

    #[test]
    fn bad_signature_is_401() {
        assert_eq!(
            status_of(OrchestratorError::Validation("bad_signature".into())),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn other_validation_failures_are_400() {
        assert_eq!(
            status_of(OrchestratorError::Validation("bad_payload".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(OrchestratorError::Validation("missing_event".into())),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn transient_failures_are_5xx_for_redelivery() {
        let status = status_of(OrchestratorError::transient(anyhow::anyhow!("db down")));
        assert!(status.is_server_error());
    }

    #[test]
    fn code_header_extraction_tolerates_missing() {
        let headers = HeaderMap::new();
        assert_eq!(header(&headers, EVENT_HEADER), None);
    }
}

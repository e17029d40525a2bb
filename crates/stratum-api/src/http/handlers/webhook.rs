//! Webhook receiver handler for the REST API.
//!
//! Finds the enabled workflow listening on the identifier, verifies the
//! request (HMAC-SHA256 signature or bearer token, if configured) and starts
//! a run with the JSON body as its initial context.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use serde_json::json;

use stratum_infra::workflow::webhook_handler::{SIGNATURE_HEADER, WebhookRequest, authenticate};
use stratum_types::workflow::TriggerSource;

use crate::http::error::AppError;
use crate::http::handlers::workflow::parse_payload;
use crate::http::response::RequestMeta;
use crate::state::AppState;

/// POST /api/v1/webhooks/{identifier} - Receive an incoming webhook.
///
/// - **HMAC-SHA256**: `X-Signature-256: sha256=<hex>` over the raw body
/// - **Bearer token**: `Authorization: Bearer <token>`
/// - **None**: no authentication required
///
/// Responds 202 with the run id; the run itself executes in the background.
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let meta = RequestMeta::start();

    let (def, auth) = state.dispatcher.find_webhook(&identifier).await?;

    let request = WebhookRequest {
        body: &body,
        signature: headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()),
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok()),
    };
    if let Err(e) = authenticate(auth.as_ref(), &request) {
        tracing::warn!(webhook = %identifier, workflow = %def.name, error = %e, "webhook rejected");
        return Err(e.into());
    }

    let payload = parse_payload(&body)?;
    let run_id = state
        .dispatcher
        .start_run(def.id, TriggerSource::Webhook, payload)
        .await?;

    tracing::info!(webhook = %identifier, workflow = %def.name, %run_id, "webhook triggered workflow");

    let resp = meta
        .success(json!({
            "run_id": run_id.to_string(),
            "workflow_id": def.id.to_string(),
            "workflow_name": def.name,
            "trigger": TriggerSource::Webhook.as_str(),
        }))
        .with_link("run", &format!("/api/v1/runs/{run_id}"))
        .with_link("workflow", &format!("/api/v1/workflows/{}", def.id));
    Ok(resp.into_response_with(StatusCode::ACCEPTED))
}

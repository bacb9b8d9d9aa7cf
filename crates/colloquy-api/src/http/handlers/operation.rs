//! Operation lifecycle endpoints.
//!
//! Start an agent execution, inspect it, cancel it, and release
//! human-in-the-loop pauses.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use colloquy_core::driver::CreateOperationParams;
use colloquy_types::agent::HumanIntervention;

use crate::http::error::AppError;
use crate::state::AppState;

/// Request body for starting an agent execution.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOperationRequest {
    pub session_id: String,
    pub topic_id: Option<String>,
    pub agent_id: Option<String>,
    pub message: String,
    pub max_steps: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOperationResponse {
    pub operation_id: String,
    pub auto_started: bool,
    pub success: bool,
}

/// POST /api/v1/agent/operations -- create and start an agent execution.
///
/// The run itself proceeds in the background; progress is observed through
/// the stream endpoint.
pub async fn create_operation(
    State(state): State<AppState>,
    Json(body): Json<CreateOperationRequest>,
) -> Result<Json<CreateOperationResponse>, AppError> {
    if body.session_id.is_empty() {
        return Err(AppError::Validation("sessionId is required".to_string()));
    }

    let handle = state
        .driver
        .create_operation(CreateOperationParams {
            session_id: body.session_id.clone(),
            topic_id: body.topic_id.clone(),
            agent_id: body.agent_id.clone(),
            user_id: None,
            user_message: body.message.clone(),
            placeholder_message_id: None,
            max_steps: body.max_steps,
        })
        .await?;

    info!(operation_id = %handle.operation_id, session_id = %body.session_id, "operation started");

    let driver = state.driver.clone();
    let operation_id = handle.operation_id.clone();
    tokio::spawn(async move {
        if let Err(e) = driver.run_to_completion(&operation_id).await {
            warn!(operation_id = %operation_id, error = %e, "run failed to start");
        }
    });

    Ok(Json(CreateOperationResponse {
        operation_id: handle.operation_id,
        auto_started: true,
        success: true,
    }))
}

/// GET /api/v1/agent/operations/{id} -- status snapshot.
pub async fn get_operation(
    State(state): State<AppState>,
    Path(operation_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let snapshot = state
        .driver
        .operation_status(&operation_id)
        .ok_or_else(|| AppError::NotFound(format!("operation {operation_id} not found")))?;

    Ok(Json(json!({
        "operationId": operation_id,
        "status": snapshot.operation.status,
        "type": snapshot.operation.op_type,
        "context": snapshot.operation.context,
        "metadata": snapshot.operation.metadata,
        "currentState": {
            "status": snapshot.state.status,
            "stepCount": snapshot.state.step_count,
            "maxSteps": snapshot.state.max_steps,
            "pendingToolsCalling": snapshot.state.pending_tools_calling,
            "error": snapshot.state.error,
            "lastModified": snapshot.state.last_modified,
        },
        "needsHumanInput": snapshot.operation.metadata.needs_human_input.unwrap_or(false),
    })))
}

/// Request body for cancelling an operation.
#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

/// POST /api/v1/agent/operations/{id}/cancel -- cancel an operation and its
/// children.
pub async fn cancel_operation(
    State(state): State<AppState>,
    Path(operation_id): Path<String>,
    Json(body): Json<CancelRequest>,
) -> Result<Json<Value>, AppError> {
    if state.registry.get(&operation_id).is_none() {
        return Err(AppError::NotFound(format!("operation {operation_id} not found")));
    }

    let reason = body.reason.as_deref().unwrap_or("user cancelled");
    state.registry.cancel_operation(&operation_id, reason);
    info!(operation_id = %operation_id, reason, "operation cancelled");

    Ok(Json(json!({ "operationId": operation_id, "success": true })))
}

/// POST /api/v1/agent/operations/{id}/intervention -- release a
/// waiting-for-human pause (approve / reject / input).
pub async fn intervene(
    State(state): State<AppState>,
    Path(operation_id): Path<String>,
    Json(intervention): Json<HumanIntervention>,
) -> Result<Json<Value>, AppError> {
    // Validate the state transition synchronously so the caller gets a
    // meaningful error; the continued run proceeds in the background.
    let snapshot = state
        .driver
        .operation_status(&operation_id)
        .ok_or_else(|| AppError::NotFound(format!("operation {operation_id} not found")))?;
    if snapshot.state.status != colloquy_types::agent::RuntimeStatus::WaitingForHuman {
        return Err(AppError::Validation(format!(
            "operation {operation_id} is not waiting for human input"
        )));
    }

    let driver = state.driver.clone();
    let id = operation_id.clone();
    tokio::spawn(async move {
        if let Err(e) = driver.resume_with_intervention(&id, intervention).await {
            warn!(operation_id = %id, error = %e, "intervention failed");
        }
    });

    Ok(Json(json!({ "operationId": operation_id, "success": true })))
}

/// GET /api/v1/agent/interventions -- operations parked for human input.
pub async fn pending_interventions(
    State(state): State<AppState>,
) -> Result<Json<Value>, AppError> {
    let pending: Vec<Value> = state
        .driver
        .pending_interventions()
        .into_iter()
        .map(|snapshot| {
            json!({
                "operationId": snapshot.operation.id,
                "stepCount": snapshot.state.step_count,
                "pendingToolsCalling": snapshot.state.pending_tools_calling,
                "lastModified": snapshot.state.last_modified,
            })
        })
        .collect();

    Ok(Json(json!({
        "totalCount": pending.len(),
        "pendingInterventions": pending,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    use colloquy_types::operation::OperationStatus;

    use crate::http::router::build_router;
    use crate::state::AppState;

    async fn test_state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("api.db").display());
        let state = AppState::init_with(&url, Duration::from_secs(60)).await.unwrap();
        (state, dir)
    }

    async fn post_json(
        state: &AppState,
        uri: &str,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let response = build_router(state.clone())
            .oneshot(
                Request::post(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    async fn get_json(state: &AppState, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = build_router(state.clone())
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn create_runs_to_completion_in_background() {
        let (state, _dir) = test_state().await;

        let (status, json) = post_json(
            &state,
            "/api/v1/agent/operations",
            serde_json::json!({ "sessionId": "sess-1", "message": "hello there" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["autoStarted"], true);
        let operation_id = json["operationId"].as_str().unwrap().to_string();

        // The echo-provider run finishes quickly in the background.
        let mut completed = false;
        for _ in 0..50 {
            if state.registry.get(&operation_id).map(|op| op.status)
                == Some(OperationStatus::Completed)
            {
                completed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(completed, "operation never completed");

        let (status, snapshot) =
            get_json(&state, &format!("/api/v1/agent/operations/{operation_id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snapshot["status"], "completed");
        assert_eq!(snapshot["currentState"]["status"], "done");
    }

    #[tokio::test]
    async fn cancel_unknown_operation_is_404() {
        let (state, _dir) = test_state().await;
        let (status, _) = post_json(
            &state,
            "/api/v1/agent/operations/op_missing/cancel",
            serde_json::json!({ "reason": "test" }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn intervene_on_non_waiting_operation_is_400() {
        let (state, _dir) = test_state().await;

        let (_, json) = post_json(
            &state,
            "/api/v1/agent/operations",
            serde_json::json!({ "sessionId": "sess-1", "message": "hi" }),
        )
        .await;
        let operation_id = json["operationId"].as_str().unwrap();

        let (status, _) = post_json(
            &state,
            &format!("/api/v1/agent/operations/{operation_id}/intervention"),
            serde_json::json!({ "action": "input", "content": "more" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_session_id_is_rejected() {
        let (state, _dir) = test_state().await;
        let (status, _) = post_json(
            &state,
            "/api/v1/agent/operations",
            serde_json::json!({ "sessionId": "", "message": "hi" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}

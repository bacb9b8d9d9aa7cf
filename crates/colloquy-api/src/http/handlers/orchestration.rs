//! Group orchestration trigger endpoints.
//!
//! POST /api/v1/groups/{group_id}/speak | broadcast | delegate
//!
//! Each request starts a fresh orchestration loop at the named phase,
//! driving the member agents through the execution driver. Loops run to
//! completion before responding; their per-agent streaming progress is
//! observable live on the session's stream.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use colloquy_core::group::{FinishInvoker, GroupCoordinator, GroupScope};
use colloquy_types::orchestration::OrchestrationState;

use crate::executors::driver_executors;
use crate::http::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakRequest {
    pub supervisor_agent_id: String,
    pub agent_id: String,
    pub instruction: String,
    pub session_id: String,
    pub topic_id: Option<String>,
    pub max_rounds: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastRequest {
    pub supervisor_agent_id: String,
    pub agent_ids: Vec<String>,
    pub instruction: String,
    pub session_id: String,
    pub topic_id: Option<String>,
    pub max_rounds: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateRequest {
    pub supervisor_agent_id: String,
    pub agent_id: String,
    pub reason: String,
    pub session_id: String,
    pub topic_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationResponse {
    pub operation_id: String,
    pub status: String,
    pub rounds: u32,
}

impl From<OrchestrationState> for OrchestrationResponse {
    fn from(state: OrchestrationState) -> Self {
        Self {
            operation_id: state.operation_id,
            status: state.status.to_string(),
            rounds: state.orchestration_round,
        }
    }
}

fn coordinator(
    state: &AppState,
    group_id: String,
    session_id: String,
    topic_id: Option<String>,
    max_rounds: Option<u32>,
) -> GroupCoordinator<colloquy_infra::sqlite::SqliteEventLog> {
    let scope = GroupScope {
        group_id,
        session_id,
        topic_id,
    };
    let mut coordinator = GroupCoordinator::new(
        state.registry.clone(),
        state.event_log.clone(),
        Arc::new(driver_executors(state.driver.clone(), &scope)),
        Arc::new(FinishInvoker),
        scope,
    );
    if let Some(max_rounds) = max_rounds {
        coordinator = coordinator.with_max_rounds(max_rounds);
    }
    coordinator
}

/// POST /api/v1/groups/{group_id}/speak
pub async fn trigger_speak(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(body): Json<SpeakRequest>,
) -> Result<Json<OrchestrationResponse>, AppError> {
    info!(group_id = %group_id, agent_id = %body.agent_id, "speak triggered");
    let result = coordinator(
        &state,
        group_id,
        body.session_id,
        body.topic_id,
        body.max_rounds,
    )
    .trigger_speak(&body.supervisor_agent_id, &body.agent_id, &body.instruction)
    .await;
    Ok(Json(result.into()))
}

/// POST /api/v1/groups/{group_id}/broadcast
pub async fn trigger_broadcast(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(body): Json<BroadcastRequest>,
) -> Result<Json<OrchestrationResponse>, AppError> {
    if body.agent_ids.is_empty() {
        return Err(AppError::Validation("agentIds must not be empty".to_string()));
    }
    info!(group_id = %group_id, agents = body.agent_ids.len(), "broadcast triggered");
    let result = coordinator(
        &state,
        group_id,
        body.session_id,
        body.topic_id,
        body.max_rounds,
    )
    .trigger_broadcast(&body.supervisor_agent_id, &body.agent_ids, &body.instruction)
    .await;
    Ok(Json(result.into()))
}

/// POST /api/v1/groups/{group_id}/delegate
pub async fn trigger_delegate(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(body): Json<DelegateRequest>,
) -> Result<Json<OrchestrationResponse>, AppError> {
    info!(group_id = %group_id, agent_id = %body.agent_id, "delegate triggered");
    let result = coordinator(&state, group_id, body.session_id, body.topic_id, None)
        .trigger_delegate(&body.supervisor_agent_id, &body.agent_id, &body.reason)
        .await;
    Ok(Json(result.into()))
}

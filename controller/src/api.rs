//! # REST API Endpoints
//!
//! Read-only HTTP endpoints for querying controller state. The operator
//! surface proper lives outside this process; these exist for dashboards
//! and health tooling.

use crate::state::AppState;
use crate::store::AgentStatus;
use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Response item for a single known agent.
#[derive(Serialize)]
pub struct AgentListItem {
    pub id: String,
    pub status: AgentStatus,
    /// Live view from the registry; may lead the stored status by up to
    /// one heartbeat during transitions.
    pub online: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// `GET /api/agents` — every known agent with its stored status and the
/// registry's live view.
pub async fn list_agents(
    State(state): State<AppState>,
) -> Result<Json<Vec<AgentListItem>>, StatusCode> {
    let agents = state
        .store
        .list_agents()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let items = agents
        .into_iter()
        .map(|agent| {
            let online = state.registry.is_online(&agent.id);
            let last_seen_at = state.registry.last_seen(&agent.id).or(agent.last_seen_at);
            AgentListItem {
                id: agent.id,
                status: agent.status,
                online,
                last_seen_at,
            }
        })
        .collect();
    Ok(Json(items))
}

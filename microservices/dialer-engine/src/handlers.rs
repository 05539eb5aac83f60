//! HTTP handlers for the Dialer Engine API
//!
//! Thin delegation layer: every handler validates its inputs, calls the
//! engine facade and maps the outcome through the shared error type.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use dialhub_core::domain::{AgentId, AgentStatus, CallId, CampaignId, LeadId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

use crate::engine::DialerEngine;
use crate::error::{Error, Result};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DialerEngine>,
    pub started: Instant,
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub degraded: bool,
    pub uptime_seconds: u64,
}

/// Ready check response
#[derive(Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub database: bool,
    pub ami: bool,
}

#[derive(Deserialize)]
pub struct ManualCallRequest {
    pub campaign_id: i64,
    pub lead_id: i64,
    pub agent_id: i64,
}

#[derive(Deserialize)]
pub struct AgentStatusRequest {
    pub status: String,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: if state.engine.is_degraded() {
            "degraded".to_string()
        } else {
            "healthy".to_string()
        },
        service: "dialer-engine".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        degraded: state.engine.is_degraded(),
        uptime_seconds: state.started.elapsed().as_secs(),
    })
}

pub async fn ready(State(state): State<AppState>) -> Json<ReadyResponse> {
    let database = state.engine.repo_ping().await;
    let ami = state.engine.session_connected().await;
    Json(ReadyResponse {
        ready: database && ami,
        database,
        ami,
    })
}

pub async fn start_dialer(
    State(state): State<AppState>,
    Path(campaign_id): Path<i64>,
) -> Result<Json<Value>> {
    state.engine.start(CampaignId(campaign_id)).await?;
    Ok(Json(json!({
        "campaign_id": campaign_id,
        "message": "Dialer started",
        "started_at": Utc::now(),
    })))
}

pub async fn stop_dialer(
    State(state): State<AppState>,
    Path(campaign_id): Path<i64>,
) -> Result<Json<Value>> {
    state.engine.stop(CampaignId(campaign_id)).await?;
    Ok(Json(json!({
        "campaign_id": campaign_id,
        "message": "Dialer stopped",
        "stopped_at": Utc::now(),
    })))
}

pub async fn dialer_status(
    State(state): State<AppState>,
    Path(campaign_id): Path<i64>,
) -> Result<Json<Value>> {
    let campaign_id = CampaignId(campaign_id);
    let campaign = state
        .engine
        .campaign(campaign_id)
        .await?
        .ok_or(Error::CampaignNotFound(campaign_id))?;

    let assigned = state.engine.assigned_agents(campaign_id).await?;
    let mut agent_statuses = serde_json::Map::new();
    let mut available = 0usize;
    for agent_id in &assigned {
        let entry = match state.engine.agent_status(*agent_id) {
            Some(agent) => {
                if agent.status == AgentStatus::Available {
                    available += 1;
                }
                json!({
                    "status": agent.status,
                    "current_call_id": agent.current_call_id,
                    "calls_today": agent.calls_today,
                    "talk_time_today": agent.talk_time_today,
                })
            }
            None => json!({
                "status": AgentStatus::Offline,
                "current_call_id": null,
                "calls_today": 0,
                "talk_time_today": 0,
            }),
        };
        agent_statuses.insert(agent_id.to_string(), entry);
    }

    let stats = state.engine.stats(campaign_id).await?;
    Ok(Json(json!({
        "campaign_id": campaign_id,
        "dialer_mode": campaign.dialer_mode,
        "is_running": state.engine.running(campaign_id),
        "available_agents_count": available,
        "agent_statuses": agent_statuses,
        "statistics": stats,
    })))
}

pub async fn manual_call(
    State(state): State<AppState>,
    Json(request): Json<ManualCallRequest>,
) -> Result<Json<Value>> {
    let call_id = state
        .engine
        .manual_call(
            CampaignId(request.campaign_id),
            LeadId(request.lead_id),
            AgentId(request.agent_id),
        )
        .await?;
    Ok(Json(json!({
        "call_id": call_id,
        "message": "Call initiated",
    })))
}

pub async fn hangup_call(
    State(state): State<AppState>,
    Path(call_id): Path<i64>,
) -> Result<Json<Value>> {
    state.engine.hangup(CallId(call_id)).await?;
    Ok(Json(json!({
        "call_id": call_id,
        "message": "Hangup requested",
    })))
}

pub async fn get_agent_status(
    State(state): State<AppState>,
    Path(agent_id): Path<i64>,
) -> Result<Json<Value>> {
    let agent_id = AgentId(agent_id);
    match state.engine.agent_status(agent_id) {
        Some(agent) => Ok(Json(json!({
            "agent_id": agent_id,
            "status": agent.status,
            "current_call_id": agent.current_call_id,
            "last_call_end": agent.last_call_end,
            "calls_today": agent.calls_today,
            "talk_time_today": agent.talk_time_today,
        }))),
        None => Ok(Json(json!({
            "agent_id": agent_id,
            "status": AgentStatus::Offline,
            "current_call_id": null,
            "last_call_end": null,
            "calls_today": 0,
            "talk_time_today": 0,
        }))),
    }
}

pub async fn update_agent_status(
    State(state): State<AppState>,
    Path(agent_id): Path<i64>,
    Json(request): Json<AgentStatusRequest>,
) -> Result<Json<Value>> {
    let status = AgentStatus::parse(&request.status)
        .ok_or_else(|| Error::Validation(format!("unknown agent status: {}", request.status)))?;
    state.engine.update_agent_status(AgentId(agent_id), status)?;
    Ok(Json(json!({
        "agent_id": agent_id,
        "status": status,
    })))
}

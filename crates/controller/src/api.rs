use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use branchforge_common::{AgentStatus, BranchHash, Metric};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::reconcile::RECONCILE_BUDGET;
use crate::webhook::{EVENT_HEADER, PushEvent, PushPayload};
use crate::{Controller, ControllerError, unix_now};

type AppState = Arc<Controller>;

pub fn router(controller: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook/git", post(webhook_generic))
        .route("/webhook/git/push", post(webhook_push))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/manual-trigger", post(manual_trigger))
        .route("/api/agents/check-recovery", get(check_recovery).post(check_recovery))
        .route("/api/agents/restart-all", post(restart_all))
        .route("/api/agents/{id}", get(get_agent))
        .route("/api/agents/{id}/restart", post(restart_by_id))
        .route("/api/agents/branch/{branch_hash}/restart", post(restart_by_branch))
        .route("/api/secrets", post(put_secret))
        .route("/api/secrets/check/{branch_hash}", get(check_secrets))
        .route("/api/metrics", post(ingest_metric))
        .route("/api/metrics/{branch_hash}", get(get_metrics))
        .route("/api/stats/{branch_hash}", get(get_stats))
        .route("/api/trades/{branch_hash}", get(get_trades))
        .route("/api/logs/{branch_hash}", get(get_logs))
        .layer(CorsLayer::permissive())
        .with_state(controller)
}

/// Binds and serves until ctrl-c.
pub async fn serve(controller: AppState) -> std::io::Result<()> {
    let addr = controller.config.bind_address();
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "control plane listening");
    axum::serve(listener, router(controller))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

// ---------------------------------------------------------------------------
// health & webhooks
// ---------------------------------------------------------------------------

async fn health(State(controller): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "ok", "uptime_secs": controller.uptime_secs() }))
}

async fn webhook_push(
    State(controller): State<AppState>,
    Json(payload): Json<PushPayload>,
) -> Result<Json<Value>, ControllerError> {
    let event = PushEvent::from_payload(&payload)?;
    Ok(acknowledge_push(controller, event))
}

/// Routes by the provider's event header: pushes deploy, pings pong, and
/// everything else is acknowledged so the provider does not retry.
async fn webhook_generic(
    State(controller): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ControllerError> {
    let event_name = headers
        .get(EVENT_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    match event_name {
        "ping" => Ok(Json(json!({ "message": "pong" })).into_response()),
        "push" => {
            let payload: PushPayload = serde_json::from_value(body)
                .map_err(|err| ControllerError::Validation(format!("bad push payload: {err}")))?;
            let event = PushEvent::from_payload(&payload)?;
            Ok(acknowledge_push(controller, event).into_response())
        }
        other => {
            Ok(Json(json!({ "message": format!("event {other:?} ignored") })).into_response())
        }
    }
}

/// Detaches the push pipeline and acknowledges at once: the provider gets
/// its 200 before any chain, git or supervisor work starts, so a slow
/// deployment can never stall the delivery into a retry. Outcomes land on
/// the agent row and in the logs, never in this exchange.
fn acknowledge_push(controller: AppState, event: PushEvent) -> Json<Value> {
    let branch_hash = event.branch_hash;
    tokio::spawn(async move { controller.process_push_logged(event).await });
    Json(json!({
        "message": "push accepted, deployment in progress",
        "branch_hash": branch_hash,
    }))
}

// ---------------------------------------------------------------------------
// agents
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct AgentListParams {
    repo_url: Option<String>,
}

async fn list_agents(
    State(controller): State<AppState>,
    Query(params): Query<AgentListParams>,
) -> Result<Json<Value>, ControllerError> {
    let agents = match params.repo_url.as_deref() {
        Some(repo_url) => controller.store.list_agents_by_repo(repo_url).await?,
        None => controller.store.list_agents().await?,
    };

    // Liveness reconciliation runs as a side effect, bounded so a wedged
    // supervisor cannot stall the listing.
    let reconciled = match tokio::time::timeout(
        RECONCILE_BUDGET,
        controller.reconcile_agents(agents.clone()),
    )
    .await
    {
        Ok(reconciled) => reconciled,
        Err(_) => {
            warn!("reconcile pass exceeded its budget; serving stored statuses");
            agents
        }
    };
    Ok(Json(json!({ "agents": reconciled })))
}

async fn get_agent(
    State(controller): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ControllerError> {
    let agent = controller
        .store
        .get_agent(id)
        .await?
        .ok_or_else(|| ControllerError::NotFound(format!("no agent with id {id}")))?;
    Ok(Json(json!({ "agent": agent })))
}

async fn restart_by_id(
    State(controller): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ControllerError> {
    let agent = controller
        .store
        .get_agent(id)
        .await?
        .ok_or_else(|| ControllerError::NotFound(format!("no agent with id {id}")))?;
    let pid = controller.restart_agent(&agent).await?;
    Ok(Json(json!({
        "branch_hash": agent.branch_hash,
        "status": AgentStatus::Running,
        "pid": pid,
    })))
}

async fn restart_by_branch(
    State(controller): State<AppState>,
    Path(branch_hash): Path<String>,
) -> Result<Json<Value>, ControllerError> {
    let branch_hash = parse_branch_hash(&branch_hash)?;
    let agent = controller
        .store
        .get_agent_by_branch_hash(&branch_hash)
        .await?
        .ok_or_else(|| ControllerError::NotFound(format!("no agent for branch {branch_hash}")))?;
    let pid = controller.restart_agent(&agent).await?;
    Ok(Json(json!({
        "branch_hash": branch_hash,
        "status": AgentStatus::Running,
        "pid": pid,
    })))
}

async fn restart_all(State(controller): State<AppState>) -> Result<Json<Value>, ControllerError> {
    let agents = controller.store.list_agents().await?;
    let mut results = Vec::with_capacity(agents.len());
    for agent in agents {
        let outcome = match controller.restart_agent(&agent).await {
            Ok(pid) => json!({ "branch_hash": agent.branch_hash, "restarted": true, "pid": pid }),
            Err(err) => {
                json!({ "branch_hash": agent.branch_hash, "restarted": false, "error": err.to_string() })
            }
        };
        results.push(outcome);
    }
    Ok(Json(json!({ "results": results })))
}

#[derive(Deserialize)]
struct ManualTriggerPayload {
    repo_url: String,
    branch_name: String,
}

async fn manual_trigger(
    State(controller): State<AppState>,
    Json(payload): Json<ManualTriggerPayload>,
) -> Result<Json<Value>, ControllerError> {
    let event = PushEvent::new(payload.repo_url, payload.branch_name)?;
    Ok(acknowledge_push(controller, event))
}

async fn check_recovery(State(controller): State<AppState>) -> Json<Value> {
    let report = controller.run_recovery().await;
    Json(json!({ "recovery": report }))
}

// ---------------------------------------------------------------------------
// secrets
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SecretPayload {
    repo_url: String,
    branch_name: String,
    key: String,
    value: String,
}

async fn put_secret(
    State(controller): State<AppState>,
    Json(payload): Json<SecretPayload>,
) -> Result<Json<Value>, ControllerError> {
    if payload.key.is_empty() {
        return Err(ControllerError::Validation("secret key is empty".to_string()));
    }
    let branch_hash = BranchHash::derive(&payload.repo_url, &payload.branch_name);
    let agent = controller
        .store
        .get_agent_by_branch_hash(&branch_hash)
        .await?
        .ok_or_else(|| {
            ControllerError::NotFound(format!(
                "no agent for {}#{}; push the branch first",
                payload.repo_url, payload.branch_name
            ))
        })?;

    let ciphertext = controller.cipher()?.encrypt(payload.value.as_bytes())?;
    controller
        .store
        .put_secret(agent.id, &branch_hash, &payload.key, &ciphertext)
        .await?;
    info!(branch = %branch_hash, key = %payload.key, "secret stored");
    Ok(Json(json!({
        "branch_hash": branch_hash,
        "key": payload.key,
        "stored": true,
    })))
}

async fn check_secrets(
    State(controller): State<AppState>,
    Path(branch_hash): Path<String>,
) -> Result<Json<Value>, ControllerError> {
    let branch_hash = parse_branch_hash(&branch_hash)?;
    let rows = controller
        .store
        .list_secrets_by_branch_hash(&branch_hash)
        .await?;
    let stored: Vec<&str> = rows.iter().map(|row| row.key.as_str()).collect();

    let present: Vec<&String> = controller
        .config
        .required_secrets
        .iter()
        .filter(|key| stored.contains(&key.as_str()))
        .collect();
    let missing: Vec<&String> = controller
        .config
        .required_secrets
        .iter()
        .filter(|key| !stored.contains(&key.as_str()))
        .collect();

    Ok(Json(json!({
        "branch_hash": branch_hash,
        "present": present,
        "missing": missing,
        "all_set": missing.is_empty(),
    })))
}

// ---------------------------------------------------------------------------
// metrics
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct MetricPayload {
    repo_url: String,
    branch_name: String,
    decision: String,
    price: Option<f64>,
    #[serde(default)]
    trade_executed: bool,
    trade_tx_hash: Option<String>,
    trade_amount: Option<f64>,
}

async fn ingest_metric(
    State(controller): State<AppState>,
    Json(payload): Json<MetricPayload>,
) -> Result<Json<Value>, ControllerError> {
    if payload.decision.is_empty() {
        return Err(ControllerError::Validation("decision is empty".to_string()));
    }
    let event = PushEvent::new(payload.repo_url.clone(), payload.branch_name.clone())?;
    let branch_hash = event.branch_hash;

    // Self-heal: a metric from a branch the database forgot is legitimate
    // as long as the chain knows the branch.
    let agent = match controller.store.get_agent_by_branch_hash(&branch_hash).await? {
        Some(agent) => agent,
        None => {
            let registry = controller.registry().map_err(|_| {
                ControllerError::NotFound(format!(
                    "no agent for branch {branch_hash} and chain is unavailable"
                ))
            })?;
            match registry.lookup(&branch_hash).await {
                Ok(Some(address)) => {
                    warn!(branch = %branch_hash, "metric for unknown agent; recreating row from chain");
                    controller
                        .store
                        .upsert_agent(
                            &branch_hash,
                            &event.repo_url,
                            &event.branch_name,
                            Some(address),
                            AgentStatus::Deploying,
                        )
                        .await?;
                    controller
                        .store
                        .get_agent_by_branch_hash(&branch_hash)
                        .await?
                        .ok_or_else(|| {
                            ControllerError::NotFound("agent row vanished after self-heal".to_string())
                        })?
                }
                Ok(None) => {
                    return Err(ControllerError::NotFound(format!(
                        "branch {branch_hash} is not registered"
                    )));
                }
                Err(err) => return Err(err.into()),
            }
        }
    };

    controller
        .store
        .insert_metric(&Metric {
            agent_id: agent.id,
            timestamp: unix_now(),
            decision: payload.decision,
            price: payload.price,
            trade_executed: payload.trade_executed,
            trade_tx_hash: payload.trade_tx_hash,
            trade_amount: payload.trade_amount,
        })
        .await?;
    Ok(Json(json!({ "recorded": true, "agent_id": agent.id })))
}

#[derive(Deserialize)]
struct LimitParams {
    limit: Option<u32>,
}

impl LimitParams {
    fn capped(&self) -> u32 {
        self.limit.unwrap_or(50).min(500)
    }
}

async fn get_metrics(
    State(controller): State<AppState>,
    Path(branch_hash): Path<String>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Value>, ControllerError> {
    let agent = agent_by_branch(&controller, &branch_hash).await?;
    let metrics = controller
        .store
        .recent_metrics(agent.id, params.capped())
        .await?;
    Ok(Json(json!({ "branch_hash": agent.branch_hash, "metrics": metrics })))
}

async fn get_stats(
    State(controller): State<AppState>,
    Path(branch_hash): Path<String>,
) -> Result<Json<Value>, ControllerError> {
    let agent = agent_by_branch(&controller, &branch_hash).await?;
    let stats = controller.store.aggregate_metrics(agent.id).await?;
    Ok(Json(json!({ "branch_hash": agent.branch_hash, "stats": stats })))
}

async fn get_trades(
    State(controller): State<AppState>,
    Path(branch_hash): Path<String>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Value>, ControllerError> {
    let agent = agent_by_branch(&controller, &branch_hash).await?;
    let trades = controller.store.trades(agent.id, params.capped()).await?;
    Ok(Json(json!({ "branch_hash": agent.branch_hash, "trades": trades })))
}

async fn get_logs(
    State(controller): State<AppState>,
    Path(branch_hash): Path<String>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Value>, ControllerError> {
    let agent = agent_by_branch(&controller, &branch_hash).await?;
    let logs = controller.synthesize_logs(&agent, params.capped()).await?;
    Ok(Json(json!({ "branch_hash": agent.branch_hash, "logs": logs })))
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn parse_branch_hash(raw: &str) -> Result<BranchHash, ControllerError> {
    BranchHash::from_hex(raw)
        .map_err(|err| ControllerError::Validation(format!("bad branch hash: {err}")))
}

async fn agent_by_branch(
    controller: &Controller,
    raw_hash: &str,
) -> Result<branchforge_common::Agent, ControllerError> {
    let branch_hash = parse_branch_hash(raw_hash)?;
    controller
        .store
        .get_agent_by_branch_hash(&branch_hash)
        .await?
        .ok_or_else(|| ControllerError::NotFound(format!("no agent for branch {branch_hash}")))
}

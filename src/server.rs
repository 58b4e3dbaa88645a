use std::sync::Arc;

use axum::extract::{FromRequestParts, Path, State};
use axum::http::{request::Parts, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{async_trait, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::db::RuntimeDb;
use crate::dispatcher::Dispatcher;
use crate::domain::{OutputStatus, Principal, RoutingPreference, Task, TaskStatus};
use crate::error::ApiError;
use crate::ledger::Ledger;
use crate::budget_gate::{BudgetGate, TaskCreateRequest as GateRequest};
use crate::schema_registry::SchemaRegistry;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub ledger: Arc<Ledger>,
    pub budget_gate: Arc<BudgetGate>,
    pub schema_registry: Arc<SchemaRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub db: Option<Arc<RuntimeDb>>,
}

/// Resolves `Authorization: Bearer agent:<agent_id>` into a `Principal`, the
/// stand-in auth scheme from §3. Real signature verification is out of
/// scope; every request just names the agent it claims to act as.
pub struct AuthenticatedAgent(pub Principal);

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedAgent {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;
        let token = header.strip_prefix("Bearer ").ok_or(ApiError::Unauthorized)?;
        let agent_id_str = token.strip_prefix("agent:").ok_or(ApiError::Unauthorized)?;
        let agent_id: Uuid = agent_id_str.parse().map_err(|_| ApiError::Unauthorized)?;
        let agent = state
            .store
            .get_agent(agent_id)
            .await
            .map_err(|_| ApiError::Unauthorized)?;
        Ok(Self(Principal {
            account_id: agent.account_id,
            agent_id: agent.agent_id,
        }))
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/v1/capabilities", get(list_capabilities))
        .route("/v1/tasks", post(create_task).get(list_tasks))
        .route("/v1/tasks/:task_id", get(get_task))
        .route("/v1/tasks/:task_id/result", post(submit_result))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz(State(state): State<AppState>) -> Response {
    match &state.db {
        Some(db) => match db.ping().await {
            Ok(()) => StatusCode::OK.into_response(),
            Err(error) => {
                tracing::warn!(%error, "readyz: database ping failed");
                StatusCode::SERVICE_UNAVAILABLE.into_response()
            }
        },
        None => StatusCode::OK.into_response(),
    }
}

/// ListCapabilities() per §4.3: `{name, price, deadline}` for every compiled
/// capability, `price` the minimum currently-quoted price among online,
/// non-system workers offering it, or `null` if none are.
async fn list_capabilities(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let mut capabilities = Vec::new();
    for name in state.schema_registry.capability_names() {
        let candidates = state
            .store
            .list_worker_candidates(name)
            .await
            .map_err(ApiError::from_store)?;
        let price = candidates
            .iter()
            .filter_map(|agent| agent.capability_prices.get(name).copied())
            .min();
        let deadline = state
            .schema_registry
            .deadline_for(name, &json!({}))
            .map_err(ApiError::from_schema)?
            .as_secs();
        capabilities.push(json!({ "name": name, "price": price, "deadline": deadline }));
    }
    Ok(Json(json!({ "capabilities": capabilities })))
}

#[derive(Deserialize)]
struct CreateTaskRequest {
    capability: String,
    input_payload: Value,
    budget: i64,
    #[serde(default)]
    routing_preference: Option<String>,
}

fn task_to_json(task: &Task) -> Value {
    json!({
        "task_id": task.task_id,
        "requester_agent_id": task.requester_agent_id,
        "worker_agent_id": task.worker_agent_id,
        "capability": task.capability,
        "input_payload": task.input_payload,
        "output_payload": task.output_payload,
        "budget": task.budget,
        "actual_cost": task.actual_cost,
        "platform_fee": task.platform_fee,
        "routing_preference": task.routing_preference.as_str(),
        "deadline": task.deadline,
        "retry_count": task.retry_count,
        "status": task.status.as_str(),
        "created_at": task.created_at,
        "updated_at": task.updated_at,
    })
}

async fn create_task(
    State(state): State<AppState>,
    AuthenticatedAgent(principal): AuthenticatedAgent,
    Json(body): Json<CreateTaskRequest>,
) -> Result<Response, ApiError> {
    let routing_preference = match body.routing_preference.as_deref() {
        Some(raw) => RoutingPreference::from_str(raw)
            .ok_or_else(|| ApiError::BadRequest(format!("unknown routing_preference: {raw}")))?,
        None => RoutingPreference::default(),
    };

    let account = state
        .store
        .get_account(principal.account_id)
        .await
        .map_err(ApiError::from_store)?;
    let gate_request = GateRequest {
        requester_agent_id: principal.agent_id,
        capability_required: body.capability.clone(),
        input_payload: body.input_payload.clone(),
        budget: body.budget,
        routing_preference: body.routing_preference.clone(),
    };
    state
        .budget_gate
        .check(&account, &gate_request)
        .await
        .map_err(|error| match error {
            crate::budget_gate::BudgetGateError::BadRequest(message) => ApiError::BadRequest(message),
            crate::budget_gate::BudgetGateError::Forbidden(message) => ApiError::Forbidden(message),
            crate::budget_gate::BudgetGateError::Store(inner) => ApiError::from_store(inner),
        })?;

    state
        .schema_registry
        .validate_input(&body.capability, &body.input_payload)
        .map_err(ApiError::from_schema)?;

    let now = chrono::Utc::now();
    let task = Task {
        task_id: Uuid::new_v4(),
        requester_agent_id: principal.agent_id,
        worker_agent_id: None,
        capability: body.capability,
        input_payload: body.input_payload,
        output_payload: None,
        budget: body.budget,
        actual_cost: None,
        platform_fee: None,
        routing_preference,
        deadline: None,
        retry_count: 0,
        status: TaskStatus::Matching,
        created_at: now,
        updated_at: now,
    };

    let admitted = state
        .ledger
        .lock_credits_and_admit(task)
        .await
        .map_err(ApiError::from_ledger)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "task_id": admitted.task_id, "status": admitted.status.as_str() })),
    )
        .into_response())
}

async fn get_task(
    State(state): State<AppState>,
    AuthenticatedAgent(principal): AuthenticatedAgent,
    Path(task_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let task = state.store.get_task(task_id).await.map_err(ApiError::from_store)?;
    authorize_task_access(&state, &principal, &task).await?;
    Ok(Json(task_to_json(&task)))
}

async fn list_tasks(
    State(state): State<AppState>,
    AuthenticatedAgent(principal): AuthenticatedAgent,
) -> Result<Json<Value>, ApiError> {
    let tasks = state
        .store
        .list_tasks_for_account(principal.account_id)
        .await
        .map_err(ApiError::from_store)?;
    let tasks: Vec<Value> = tasks.iter().map(task_to_json).collect();
    Ok(Json(json!({ "tasks": tasks })))
}

async fn authorize_task_access(
    state: &AppState,
    principal: &Principal,
    task: &Task,
) -> Result<(), ApiError> {
    if Some(principal.agent_id) == task.worker_agent_id {
        return Ok(());
    }
    let requester = state
        .store
        .get_agent(task.requester_agent_id)
        .await
        .map_err(ApiError::from_store)?;
    if requester.account_id == principal.account_id {
        return Ok(());
    }
    Err(ApiError::NotFound)
}

#[derive(Deserialize)]
struct SubmitResultRequest {
    output_status: String,
    #[serde(default)]
    output_payload: Value,
    #[serde(default)]
    actual_cost: i64,
}

/// SettleResult(task, output_payload, output_status, actual_cost) per §4.6,
/// reachable only by the worker the task was dispatched to.
async fn submit_result(
    State(state): State<AppState>,
    AuthenticatedAgent(principal): AuthenticatedAgent,
    Path(task_id): Path<Uuid>,
    Json(body): Json<SubmitResultRequest>,
) -> Result<Json<Value>, ApiError> {
    let task = state.store.get_task(task_id).await.map_err(ApiError::from_store)?;
    if task.worker_agent_id != Some(principal.agent_id) {
        return Err(ApiError::Forbidden(
            "only the dispatched worker may submit a result".to_string(),
        ));
    }
    let output_status = OutputStatus::from_str(&body.output_status)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown output_status: {}", body.output_status)))?;

    let mut output_payload = body.output_payload;
    if let Some(object) = output_payload.as_object_mut() {
        object.insert("status".to_string(), json!(body.output_status));
    } else {
        output_payload = json!({ "status": body.output_status });
    }

    if let Some(diagnostic) = state
        .schema_registry
        .validate_output(&task.capability, &output_payload)
    {
        tracing::warn!(%task_id, diagnostic, "output failed soft validation");
    }

    let updated = if output_status.pays_worker() {
        let effective_cost = if body.actual_cost > 0 { body.actual_cost } else { task.budget }
            .clamp(0, task.budget);
        state
            .ledger
            .settle_task(
                task_id,
                principal.agent_id,
                output_payload,
                effective_cost,
                task.budget,
                state.dispatcher.platform_account_id(),
            )
            .await
            .map_err(ApiError::from_ledger)?
    } else {
        state
            .ledger
            .refund_task(task_id, &[TaskStatus::InProgress], Some(output_payload))
            .await
            .map_err(ApiError::from_ledger)?
    };

    match updated {
        Some(task) => Ok(Json(task_to_json(&task))),
        None => Err(ApiError::Conflict(
            "task was no longer in_progress when the result arrived".to_string(),
        )),
    }
}

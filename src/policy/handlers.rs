use super::PolicyError;
use super::compiler::PolicyCompiler;
use super::engine::parse_model;
use super::registry::EnforcerRegistry;
use crate::extract::{ApiJson, ApiQuery};
use crate::store::{Adapter, EnforcerRecord, Model, Permission};
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct PolicyAppState {
    pub registry: Arc<EnforcerRegistry>,
    pub compiler: Arc<PolicyCompiler>,
}

pub fn policy_routes() -> Router<PolicyAppState> {
    Router::new()
        .route("/api/enforce", post(enforce_handler))
        .route("/api/add-permission", post(add_permission_handler))
        .route("/api/update-permission", post(update_permission_handler))
        .route("/api/delete-permission", post(delete_permission_handler))
        .route("/api/get-permission-rules", get(get_permission_rules_handler))
        .route("/api/update-model", post(update_model_handler))
        .route("/api/update-adapter", post(update_adapter_handler))
        .route("/api/update-enforcer", post(update_enforcer_handler))
}

fn ok<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(json!({ "status": "ok", "data": data }))).into_response()
}

fn respond<T: Serialize>(result: Result<T, PolicyError>) -> Response {
    match result {
        Ok(data) => ok(data),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnforceQuery {
    #[serde(default)]
    pub enforcer_id: String,
}

#[derive(Debug, Deserialize)]
pub struct IdQuery {
    #[serde(default)]
    pub id: String,
}

/// Handler for POST /api/enforce?enforcerId=owner/name, body is the request tuple
pub async fn enforce_handler(
    State(state): State<PolicyAppState>,
    ApiQuery(query): ApiQuery<EnforceQuery>,
    ApiJson(request): ApiJson<Vec<String>>,
) -> Response {
    if query.enforcer_id.is_empty() {
        return PolicyError::BadRequest("missing parameter: enforcerId".to_string())
            .into_response();
    }
    let result = state.registry.enforce(&query.enforcer_id, &request).await;
    if let Ok(allowed) = &result {
        tracing::debug!(
            "enforce {} {:?} -> {}",
            query.enforcer_id,
            request,
            allowed
        );
    }
    respond(result)
}

/// Handler for POST /api/add-permission
pub async fn add_permission_handler(
    State(state): State<PolicyAppState>,
    ApiJson(permission): ApiJson<Permission>,
) -> Response {
    respond(state.compiler.add_permission(permission).await)
}

/// Handler for POST /api/update-permission?id=owner/name
pub async fn update_permission_handler(
    State(state): State<PolicyAppState>,
    ApiQuery(query): ApiQuery<IdQuery>,
    ApiJson(permission): ApiJson<Permission>,
) -> Response {
    match require_id(&query) {
        Ok(id) => respond(state.compiler.update_permission(id, permission).await),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct PermissionRef {
    pub owner: String,
    pub name: String,
}

/// Handler for POST /api/delete-permission; accepts the permission (or just its owner and name)
pub async fn delete_permission_handler(
    State(state): State<PolicyAppState>,
    ApiJson(permission): ApiJson<PermissionRef>,
) -> Response {
    let id = format!("{}/{}", permission.owner, permission.name);
    respond(state.compiler.delete_permission(&id).await)
}

/// Handler for GET /api/get-permission-rules?id=owner/name
pub async fn get_permission_rules_handler(
    State(state): State<PolicyAppState>,
    ApiQuery(query): ApiQuery<IdQuery>,
) -> Response {
    respond(
        state
            .compiler
            .get_permission_rules(&query.id)
            .await
            .map(|rules| {
                rules
                    .into_iter()
                    .map(|rule| {
                        let mut row = vec![rule.ptype];
                        row.extend(rule.values);
                        row
                    })
                    .collect::<Vec<_>>()
            }),
    )
}

fn require_id(query: &IdQuery) -> Result<&str, PolicyError> {
    if query.id.is_empty() {
        Err(PolicyError::BadRequest("missing parameter: id".to_string()))
    } else {
        Ok(&query.id)
    }
}

/// Handler for POST /api/update-model?id=owner/name; cached engines using it are rebuilt
pub async fn update_model_handler(
    State(state): State<PolicyAppState>,
    ApiQuery(query): ApiQuery<IdQuery>,
    ApiJson(model): ApiJson<Model>,
) -> Response {
    let id = match require_id(&query) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = parse_model(&model.model_text).await {
        return e.into_response();
    }
    respond(state.registry.update_model(id, model).await)
}

/// Handler for POST /api/update-adapter?id=owner/name
pub async fn update_adapter_handler(
    State(state): State<PolicyAppState>,
    ApiQuery(query): ApiQuery<IdQuery>,
    ApiJson(adapter): ApiJson<Adapter>,
) -> Response {
    match require_id(&query) {
        Ok(id) => respond(state.registry.update_adapter(id, adapter).await),
        Err(e) => e.into_response(),
    }
}

/// Handler for POST /api/update-enforcer?id=owner/name
pub async fn update_enforcer_handler(
    State(state): State<PolicyAppState>,
    ApiQuery(query): ApiQuery<IdQuery>,
    ApiJson(enforcer): ApiJson<EnforcerRecord>,
) -> Response {
    match require_id(&query) {
        Ok(id) => respond(state.registry.update_enforcer(id, enforcer).await),
        Err(e) => e.into_response(),
    }
}

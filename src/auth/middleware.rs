use super::credentials::{ClientValidator, bearer_token};
use crate::policy::{AUTHZ_ENFORCER_ID, EnforcerRegistry};
use crate::store::split_id;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;

const ANONYMOUS: &str = "anonymous";

#[derive(Clone)]
pub struct AuthzConfig {
    pub validator: ClientValidator,
    pub registry: Arc<EnforcerRegistry>,
}

/// Who is asking: the owner of a live first-party access token, or anonymous/anonymous
async fn subject(config: &AuthzConfig, bearer: Option<String>) -> (String, String) {
    let anonymous = || (ANONYMOUS.to_string(), ANONYMOUS.to_string());
    let Some(bearer) = bearer else {
        return anonymous();
    };
    match config.validator.resolve_session(&bearer).await {
        Ok(Some(session)) => (session.user.owner, session.user.name),
        Ok(None) => {
            tracing::debug!("bearer token does not resolve to a session, treating as anonymous");
            anonymous()
        }
        Err(e) => {
            tracing::warn!("session lookup failed, treating caller as anonymous: {}", e);
            anonymous()
        }
    }
}

/// Object the request targets, taken from an `id=owner/name` query parameter
fn object(req: &Request) -> (String, String) {
    let id = req
        .uri()
        .query()
        .and_then(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .find(|(key, _)| key == "id")
                .map(|(_, value)| value.into_owned())
        })
        .unwrap_or_default();
    match split_id(&id) {
        Some((owner, name)) => (owner.to_string(), name.to_string()),
        None => (String::new(), String::new()),
    }
}

/// Evaluates (subOwner, subName, method, urlPath, objOwner, objName) against the built-in
/// authz enforcer and rejects the request with 403 when it is not allowed.
pub async fn authz_middleware(
    State(config): State<AuthzConfig>,
    req: Request,
    next: Next,
) -> Response {
    // the request body is not Sync, so nothing borrowed from `req` may live across an await
    let bearer = bearer_token(req.headers()).map(str::to_string);
    let (obj_owner, obj_name) = object(&req);
    let (sub_owner, sub_name) = subject(&config, bearer).await;
    let method = req.method().to_string();
    let path = req.uri().path().to_string();

    let request = vec![
        sub_owner,
        sub_name,
        method,
        path,
        obj_owner,
        obj_name,
    ];
    match config.registry.enforce(AUTHZ_ENFORCER_ID, &request).await {
        Ok(true) => next.run(req).await,
        Ok(false) => {
            tracing::warn!(
                "denied {} {} for {}/{}",
                request[2],
                request[3],
                request[0],
                request[1]
            );
            (
                StatusCode::FORBIDDEN,
                Json(json!({
                    "status": "error",
                    "msg": format!("Unauthorized operation for {}/{}", request[0], request[1]),
                })),
            )
                .into_response()
        }
        Err(e) => e.into_response(),
    }
}

use super::OAuthService;
use super::authorization_code::CodeRequest;
use super::credentials::{ClientCredentials, bearer_token, resolve_client_credentials};
use super::error::TokenError;
use super::issuer::TokenRequest;
use super::token::issuer_origin;
use super::traits::{GrantType, TokenWrapper};
use axum::{
    Router,
    body::Bytes,
    extract::{Query, State, rejection::QueryRejection},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use crate::extract::{ApiJson, ApiQuery};
use crate::store::{StoreError, split_id};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use std::sync::Arc;

/// Combined OAuth state for all handlers
#[derive(Clone)]
pub struct OAuthAppState {
    pub oauth_service: Arc<OAuthService>,
}

/// Client-authenticated endpoints. These get the stricter rate limit.
pub fn token_routes() -> Router<OAuthAppState> {
    Router::new()
        .route("/login/oauth/access_token", post(oauth_token_handler))
        .route("/login/oauth/refresh_token", post(refresh_token_handler))
        .route("/login/oauth/introspect", post(introspect_handler))
}

/// Endpoints acting for a signed-in user; these sit behind the authorization middleware.
pub fn session_routes() -> Router<OAuthAppState> {
    Router::new().route("/login/oauth/code", post(authorization_code_handler))
}

/// Token administration; behind the authorization middleware like the session routes.
pub fn admin_routes() -> Router<OAuthAppState> {
    Router::new()
        .route("/api/get-tokens", get(get_tokens_handler))
        .route("/api/get-token", get(get_token_handler))
        .route("/api/delete-token", post(delete_token_handler))
}

pub fn discovery_routes() -> Router<OAuthAppState> {
    Router::new().route("/.well-known/openid-configuration", get(discovery_handler))
}

fn request_host(headers: &HeaderMap) -> &str {
    headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost")
}

/// Parses a form or JSON body, picked by Content-Type. An empty body yields defaults.
fn parse_body<T: DeserializeOwned + Default>(
    headers: &HeaderMap,
    body: &[u8],
) -> Result<T, TokenError> {
    if body.is_empty() {
        return Ok(T::default());
    }
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    if is_json {
        serde_json::from_slice(body)
            .map_err(|e| TokenError::InvalidRequest(format!("malformed JSON body: {}", e)))
    } else {
        serde_urlencoded::from_bytes(body)
            .map_err(|e| TokenError::InvalidRequest(format!("malformed form body: {}", e)))
    }
}

fn or(primary: String, fallback: String) -> String {
    if primary.is_empty() { fallback } else { primary }
}

/// Body wins over query string, field by field; Basic auth wins over both for client credentials.
fn merge_token_request(headers: &HeaderMap, body: TokenRequest, query: TokenRequest) -> TokenRequest {
    let credentials = resolve_client_credentials(
        headers,
        &ClientCredentials::new(Some(&body.client_id), Some(&body.client_secret)),
        &ClientCredentials::new(Some(&query.client_id), Some(&query.client_secret)),
    );
    TokenRequest {
        grant_type: or(body.grant_type, query.grant_type),
        client_id: credentials.client_id,
        client_secret: credentials.client_secret,
        code: or(body.code, query.code),
        code_verifier: or(body.code_verifier, query.code_verifier),
        refresh_token: or(body.refresh_token, query.refresh_token),
        scope: or(body.scope, query.scope),
        username: or(body.username, query.username),
        password: or(body.password, query.password),
        tag: or(body.tag, query.tag),
        avatar: or(body.avatar, query.avatar),
    }
}

fn token_response(result: Result<TokenWrapper, TokenError>) -> Response {
    match result {
        Ok(wrapper) => (
            StatusCode::OK,
            [(header::CACHE_CONTROL, "no-store")],
            Json(wrapper),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// Handler for POST /login/oauth/access_token
pub async fn oauth_token_handler(
    State(state): State<OAuthAppState>,
    query: Result<Query<TokenRequest>, QueryRejection>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(e) => return TokenError::from(e).into_response(),
    };
    let body = match parse_body::<TokenRequest>(&headers, &body) {
        Ok(b) => b,
        Err(e) => return e.into_response(),
    };
    let req = merge_token_request(&headers, body, query);
    token_response(
        state
            .oauth_service
            .issuer()
            .grant(&req, request_host(&headers))
            .await,
    )
}

/// Handler for POST /login/oauth/refresh_token; always a refresh_token grant
pub async fn refresh_token_handler(
    State(state): State<OAuthAppState>,
    query: Result<Query<TokenRequest>, QueryRejection>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(e) => return TokenError::from(e).into_response(),
    };
    let body = match parse_body::<TokenRequest>(&headers, &body) {
        Ok(b) => b,
        Err(e) => return e.into_response(),
    };
    let mut req = merge_token_request(&headers, body, query);
    req.grant_type = GrantType::RefreshToken.as_str().to_string();
    token_response(
        state
            .oauth_service
            .issuer()
            .grant(&req, request_host(&headers))
            .await,
    )
}

#[derive(Debug, Default, Deserialize)]
pub struct IntrospectRequest {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub token_type_hint: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
}

/// Handler for POST /login/oauth/introspect (RFC 7662)
pub async fn introspect_handler(
    State(state): State<OAuthAppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req = match parse_body::<IntrospectRequest>(&headers, &body) {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };
    let credentials = resolve_client_credentials(
        &headers,
        &ClientCredentials::new(Some(&req.client_id), Some(&req.client_secret)),
        &ClientCredentials::default(),
    );
    tracing::debug!(
        "introspection by client_id={} (hint: {:?})",
        credentials.client_id,
        req.token_type_hint
    );

    match state
        .oauth_service
        .introspector()
        .introspect(&req.token, &credentials.client_id, &credentials.client_secret)
        .await
    {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(e) => e.into_response(),
    }
}

fn merge_code_request(body: CodeRequest, query: CodeRequest) -> CodeRequest {
    CodeRequest {
        client_id: or(body.client_id, query.client_id),
        response_type: or(body.response_type, query.response_type),
        redirect_uri: or(body.redirect_uri, query.redirect_uri),
        scope: or(body.scope, query.scope),
        state: or(body.state, query.state),
        nonce: or(body.nonce, query.nonce),
        code_challenge: or(body.code_challenge, query.code_challenge),
        code_challenge_method: or(body.code_challenge_method, query.code_challenge_method),
    }
}

/// Handler for POST /login/oauth/code. The signed-in user is whoever owns the bearer token.
pub async fn authorization_code_handler(
    State(state): State<OAuthAppState>,
    query: Result<Query<CodeRequest>, QueryRejection>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(e) => return TokenError::from(e).into_response(),
    };
    let body = match parse_body::<CodeRequest>(&headers, &body) {
        Ok(b) => b,
        Err(e) => return e.into_response(),
    };
    let req = merge_code_request(body, query);

    let service = &state.oauth_service;
    let session = match bearer_token(&headers) {
        Some(bearer) => match service.validator().resolve_session(bearer).await {
            Ok(session) => session,
            Err(e) => return TokenError::from(e).into_response(),
        },
        None => None,
    };
    let Some(session) = session else {
        return TokenError::InvalidRequest("please sign in first".to_string()).into_response();
    };

    match service.issuer().issue_code(&req, &session.user).await {
        Ok(code) => (StatusCode::OK, Json(code)).into_response(),
        Err(e) => e.into_response(),
    }
}

fn admin_error(status: StatusCode, msg: String) -> Response {
    (status, Json(json!({ "status": "error", "msg": msg }))).into_response()
}

fn admin_response<T: Serialize>(result: Result<T, StoreError>) -> Response {
    match result {
        Ok(data) => (StatusCode::OK, Json(json!({ "status": "ok", "data": data }))).into_response(),
        Err(e) => {
            tracing::error!("token administration failed: {}", e);
            admin_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TokensQuery {
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub application: String,
}

/// Handler for GET /api/get-tokens?owner=..., optionally narrowed to one application
pub async fn get_tokens_handler(
    State(state): State<OAuthAppState>,
    ApiQuery(query): ApiQuery<TokensQuery>,
) -> Response {
    let tokens = state.oauth_service.tokens();
    if query.owner.is_empty() && query.application.is_empty() {
        return admin_error(
            StatusCode::BAD_REQUEST,
            "missing parameter: owner".to_string(),
        );
    }
    let result = if query.application.is_empty() {
        tokens.get_tokens(&query.owner).await
    } else {
        tokens
            .get_tokens_by_application(&query.application)
            .await
            .map(|found| {
                found
                    .into_iter()
                    .filter(|t| query.owner.is_empty() || t.owner == query.owner)
                    .collect::<Vec<_>>()
            })
    };
    admin_response(result)
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenIdQuery {
    #[serde(default)]
    pub id: String,
}

/// Handler for GET /api/get-token?id=owner/name; `data` is null when there is no such token
pub async fn get_token_handler(
    State(state): State<OAuthAppState>,
    ApiQuery(query): ApiQuery<TokenIdQuery>,
) -> Response {
    let Some((owner, name)) = split_id(&query.id) else {
        return admin_error(
            StatusCode::BAD_REQUEST,
            format!("invalid token id '{}'", query.id),
        );
    };
    admin_response(state.oauth_service.tokens().get_token(owner, name).await)
}

#[derive(Debug, Deserialize)]
pub struct TokenRef {
    pub owner: String,
    pub name: String,
}

/// Handler for POST /api/delete-token; the body is the token (or just its owner and name)
pub async fn delete_token_handler(
    State(state): State<OAuthAppState>,
    ApiJson(token): ApiJson<TokenRef>,
) -> Response {
    let result = state
        .oauth_service
        .tokens()
        .delete_token(&token.owner, &token.name)
        .await;
    if let Ok(true) = result {
        tracing::info!("token {}/{} revoked", token.owner, token.name);
    }
    admin_response(result)
}

/// OpenID Provider metadata
#[derive(Debug, Serialize)]
pub struct OidcDiscovery {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub introspection_endpoint: String,
    pub response_types_supported: Vec<String>,
    pub grant_types_supported: Vec<String>,
    pub subject_types_supported: Vec<String>,
    pub scopes_supported: Vec<String>,
    pub claims_supported: Vec<String>,
    pub token_endpoint_auth_methods_supported: Vec<String>,
    pub introspection_endpoint_auth_methods_supported: Vec<String>,
    pub code_challenge_methods_supported: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Handler for GET /.well-known/openid-configuration
pub async fn discovery_handler(
    State(state): State<OAuthAppState>,
    headers: HeaderMap,
) -> Response {
    let origin = issuer_origin(request_host(&headers), state.oauth_service.public_url());
    let metadata = OidcDiscovery {
        authorization_endpoint: format!("{}/login/oauth/code", origin),
        token_endpoint: format!("{}/login/oauth/access_token", origin),
        introspection_endpoint: format!("{}/login/oauth/introspect", origin),
        issuer: origin,
        response_types_supported: strings(&["code"]),
        grant_types_supported: GrantType::ALL
            .iter()
            .map(|g| g.as_str().to_string())
            .collect(),
        subject_types_supported: strings(&["public"]),
        scopes_supported: strings(&["openid", "profile", "email"]),
        claims_supported: strings(&[
            "iss", "sub", "aud", "exp", "iat", "nbf", "jti", "owner", "name", "nonce", "tag",
            "avatar",
        ]),
        token_endpoint_auth_methods_supported: strings(&[
            "client_secret_basic",
            "client_secret_post",
            "none",
        ]),
        introspection_endpoint_auth_methods_supported: strings(&[
            "client_secret_basic",
            "client_secret_post",
        ]),
        code_challenge_methods_supported: strings(&["S256"]),
    };

    tracing::debug!("Serving OpenID provider metadata");
    (StatusCode::OK, Json(metadata)).into_response()
}

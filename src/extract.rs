//! Extractors for the `/api` routes. A body or query string that fails to decode is
//! answered with the same `{status, msg}` envelope as every other API error.

use axum::{
    Json,
    extract::{
        FromRequest, FromRequestParts, Query, Request,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use serde_json::json;

#[derive(Debug)]
pub struct Rejected {
    status: StatusCode,
    msg: String,
}

impl IntoResponse for Rejected {
    fn into_response(self) -> Response {
        tracing::debug!("rejected malformed request: {}", self.msg);
        (
            self.status,
            Json(json!({ "status": "error", "msg": self.msg })),
        )
            .into_response()
    }
}

impl From<JsonRejection> for Rejected {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            msg: rejection.body_text(),
        }
    }
}

impl From<QueryRejection> for Rejected {
    fn from(rejection: QueryRejection) -> Self {
        Self {
            status: rejection.status(),
            msg: rejection.body_text(),
        }
    }
}

/// JSON request body
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = Rejected;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

/// Query string parameters
pub struct ApiQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    Query<T>: FromRequestParts<S, Rejection = QueryRejection>,
    S: Send + Sync,
{
    type Rejection = Rejected;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

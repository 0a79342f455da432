mod bootstrap;
mod compiler;
mod enforcer;
mod engine;
mod handlers;
mod registry;

pub use bootstrap::{AUTHZ_ENFORCER_ID, CertKeys, init_built_in_data};
pub use compiler::PolicyCompiler;
pub use handlers::{PolicyAppState, policy_routes};
pub use registry::EnforcerRegistry;

use crate::store::StoreError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error;

/// Policy engine and compiler failures. Messages name the offending model/adapter/enforcer.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("the {kind}: {id} does not exist")]
    NotFound { kind: &'static str, id: String },

    #[error("failed to initialise enforcer {id}: {reason}")]
    Init { id: String, reason: String },

    #[error("invalid model: {0}")]
    InvalidModel(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("policy evaluation failed: {0}")]
    Eval(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PolicyError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        PolicyError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            PolicyError::NotFound { .. } => StatusCode::NOT_FOUND,
            PolicyError::BadRequest(_) | PolicyError::InvalidModel(_) => StatusCode::BAD_REQUEST,
            PolicyError::Store(StoreError::Conflict { .. }) => StatusCode::BAD_REQUEST,
            PolicyError::Init { .. } | PolicyError::Eval(_) | PolicyError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<casbin::Error> for PolicyError {
    fn from(e: casbin::Error) -> Self {
        match e {
            casbin::Error::RequestError(_) => PolicyError::BadRequest(e.to_string()),
            casbin::Error::ModelError(_) => PolicyError::InvalidModel(e.to_string()),
            _ => PolicyError::Eval(e.to_string()),
        }
    }
}

impl IntoResponse for PolicyError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("policy request failed: {}", self);
        }
        (status, Json(json!({ "status": "error", "msg": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            PolicyError::not_found("enforcer", "a/b").status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            PolicyError::not_found("enforcer", "a/b").to_string(),
            "the enforcer: a/b does not exist"
        );
        assert_eq!(
            PolicyError::Init {
                id: "a/b".into(),
                reason: "x".into()
            }
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            PolicyError::Store(StoreError::Conflict {
                kind: "permission",
                id: "a/b".into()
            })
            .status(),
            StatusCode::BAD_REQUEST
        );
    }
}

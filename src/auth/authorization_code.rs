use super::error::TokenError;
use super::issuer::TokenIssuer;
use super::traits::GrantType;
use crate::store::{Token, User};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// how long an issued code stays redeemable
pub const CODE_LIFETIME_MINUTES: i64 = 5;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodeRequest {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub response_type: String,
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub code_challenge: String,
    #[serde(default)]
    pub code_challenge_method: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CodeResponse {
    pub code: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub state: String,
}

/// PKCE verification - S256 only (as per OAuth 2.1)
pub fn verify_pkce(code_verifier: &str, code_challenge: &str) -> bool {
    URL_SAFE_NO_PAD.encode(Sha256::digest(code_verifier.as_bytes())) == code_challenge
}

impl TokenIssuer {
    /// Issues an authorization code bound to {user, application, scope, redirect_uri,
    /// code_challenge, nonce}. Every check runs before the code row is written.
    pub async fn issue_code(&self, req: &CodeRequest, user: &User) -> Result<CodeResponse, TokenError> {
        self.validator()
            .validate_challenge_method(&req.code_challenge_method)?;

        if req.response_type != "code" {
            return Err(TokenError::InvalidRequest(format!(
                "response_type: {} is not supported",
                req.response_type
            )));
        }

        let application = self.validator().get_client(&req.client_id).await?;
        self.validator()
            .check_grant_allowed(&application, GrantType::AuthorizationCode)?;
        self.validator()
            .validate_redirect_uri(&application, &req.redirect_uri)?;

        let now = Utc::now();
        let code = Uuid::new_v4().simple().to_string();
        let token = Token {
            owner: application.owner.clone(),
            name: Uuid::new_v4().to_string(),
            created_time: now,
            application: application.name.clone(),
            organization: user.owner.clone(),
            user: user.name.clone(),
            code: code.clone(),
            access_token: String::new(),
            refresh_token: String::new(),
            expires_in: 0,
            refresh_expires_in: 0,
            scope: req.scope.clone(),
            token_type: "Bearer".to_string(),
            redirect_uri: req.redirect_uri.clone(),
            code_challenge: req.code_challenge.clone(),
            code_is_used: false,
            code_expire_in: now + Duration::minutes(CODE_LIFETIME_MINUTES),
            nonce: req.nonce.clone(),
        };
        self.tokens().add_token(token).await?;

        tracing::info!(
            "Issued authorization code for user {} via client_id={}",
            user.get_id(),
            application.client_id
        );

        Ok(CodeResponse {
            code,
            state: req.state.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_pkce_rfc7636_vector() {
        // RFC 7636 appendix B
        let verifier = "dBjftJeZ4CVP-mJ92ZoW1KG8YIFh8pIT2Z43mOx4Fwc";
        let challenge = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";
        assert!(verify_pkce(verifier, challenge));
        assert!(!verify_pkce("something-else", challenge));
        assert!(!verify_pkce(verifier, ""));
    }
}

use super::credentials::ClientValidator;
use super::error::TokenError;
use super::traits::IntrospectionResponse;
use crate::store::TokenStore;
use std::sync::Arc;

/// RFC 7662 token introspection for the calling client's own tokens.
#[derive(Clone)]
pub struct Introspector {
    validator: ClientValidator,
    tokens: Arc<dyn TokenStore>,
}

impl Introspector {
    pub fn new(validator: ClientValidator, tokens: Arc<dyn TokenStore>) -> Self {
        Self { validator, tokens }
    }

    /// Client authentication failures are errors; anything wrong with the token itself is
    /// reported as `{"active": false}`. Tokens of other applications look exactly like
    /// unknown ones.
    pub async fn introspect(
        &self,
        token: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<IntrospectionResponse, TokenError> {
        if client_id.is_empty() || client_secret.is_empty() {
            return Err(TokenError::InvalidRequest(
                "client_id and client_secret are required".to_string(),
            ));
        }
        let application = self.validator.validate(client_id, client_secret).await?;

        if token.is_empty() {
            return Ok(IntrospectionResponse::inactive());
        }
        let Some(row) = self
            .tokens
            .get_token_by_value_and_application(token, &application.name)
            .await?
        else {
            return Ok(IntrospectionResponse::inactive());
        };
        if row.owner != application.owner {
            return Ok(IntrospectionResponse::inactive());
        }

        let signer = self.validator.signer_for(&application).await?;
        let claims = match signer.verify(token, &application.client_id) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::debug!("introspected token {} is not valid: {}", row.get_id(), e);
                return Ok(IntrospectionResponse::inactive());
            }
        };

        Ok(IntrospectionResponse {
            active: true,
            scope: Some(claims.scope),
            client_id: Some(application.client_id),
            username: Some(row.user),
            token_type: Some(row.token_type),
            exp: Some(claims.exp),
            iat: Some(claims.iat),
            nbf: Some(claims.nbf),
            sub: Some(claims.sub),
            aud: Some(claims.aud),
            iss: Some(claims.iss),
            jti: Some(claims.jti),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::issuer::tests::{code_request, fixture};
    use crate::auth::issuer::TokenRequest;
    use crate::auth::token::tests::test_user;
    use crate::store::{Application, Directory};
    use chrono::Utc;

    async fn issued() -> (Introspector, Arc<crate::store::MemoryStore>, String, String) {
        let (issuer, store) = fixture().await;
        let code = issuer
            .issue_code(&code_request("https://a.test/cb"), &test_user())
            .await
            .unwrap();
        let req = TokenRequest {
            grant_type: "authorization_code".into(),
            client_id: "client-a".into(),
            client_secret: "secret-a".into(),
            code: code.code,
            ..Default::default()
        };
        let wrapper = issuer.grant(&req, "localhost").await.unwrap();
        let validator = ClientValidator::new(store.clone(), store.clone());
        (
            Introspector::new(validator, store.clone()),
            store,
            wrapper.access_token,
            wrapper.refresh_token,
        )
    }

    #[tokio::test]
    async fn test_active_token() {
        let (introspector, _, access, refresh) = issued().await;
        let resp = introspector
            .introspect(&access, "client-a", "secret-a")
            .await
            .unwrap();
        assert!(resp.active);
        assert_eq!(resp.username.as_deref(), Some("alice"));
        assert_eq!(resp.client_id.as_deref(), Some("client-a"));
        assert_eq!(resp.token_type.as_deref(), Some("Bearer"));
        assert_eq!(resp.scope.as_deref(), Some("read write"));

        let resp = introspector
            .introspect(&refresh, "client-a", "secret-a")
            .await
            .unwrap();
        assert!(resp.active);
    }

    #[tokio::test]
    async fn test_unknown_and_tampered_tokens_inactive() {
        let (introspector, _, access, _) = issued().await;
        let resp = introspector
            .introspect("not-a-token", "client-a", "secret-a")
            .await
            .unwrap();
        assert_eq!(resp, IntrospectionResponse::inactive());

        let mut tampered = access.clone();
        tampered.push('x');
        let resp = introspector
            .introspect(&tampered, "client-a", "secret-a")
            .await
            .unwrap();
        assert!(!resp.active);
    }

    #[tokio::test]
    async fn test_expired_token_inactive() {
        use crate::auth::token::tests::{hmac_cert, test_application};
        use crate::auth::token::{ClaimsInput, JwtSigner, build_claims};
        use crate::auth::traits::token_use;
        use crate::store::{Token, TokenStore};
        use chrono::Duration;

        let (introspector, store, _, _) = issued().await;
        let user = test_user();
        let app = test_application();
        let issued_at = Utc::now() - Duration::hours(2);
        let stale = JwtSigner::from_cert(&hmac_cert("test-secret"))
            .unwrap()
            .sign(&build_claims(ClaimsInput {
                issuer: "http://localhost",
                user: &user,
                application: &app,
                scope: "read",
                token_use: token_use::ACCESS,
                issued_at,
                lifetime: Duration::hours(1),
                skew: 0,
                nonce: "",
                tag: "",
                avatar: "",
            }))
            .unwrap();
        store
            .add_token(Token {
                owner: "admin".into(),
                name: "expired".into(),
                created_time: issued_at,
                application: "app-a".into(),
                organization: "built-in".into(),
                user: "alice".into(),
                code: String::new(),
                access_token: stale.clone(),
                refresh_token: String::new(),
                expires_in: 3600,
                refresh_expires_in: 0,
                scope: "read".into(),
                token_type: "Bearer".into(),
                redirect_uri: String::new(),
                code_challenge: String::new(),
                code_is_used: true,
                code_expire_in: issued_at,
                nonce: String::new(),
            })
            .await
            .unwrap();

        let resp = introspector
            .introspect(&stale, "client-a", "secret-a")
            .await
            .unwrap();
        assert_eq!(resp, IntrospectionResponse::inactive());
    }

    #[tokio::test]
    async fn test_other_application_sees_inactive() {
        let (introspector, store, access, _) = issued().await;
        store
            .add_application(Application {
                name: "app-b".into(),
                client_id: "client-b".into(),
                client_secret: "secret-b".into(),
                created_time: Utc::now(),
                ..crate::auth::token::tests::test_application()
            })
            .await
            .unwrap();

        let resp = introspector
            .introspect(&access, "client-b", "secret-b")
            .await
            .unwrap();
        assert!(!resp.active);
    }

    #[tokio::test]
    async fn test_client_authentication_required() {
        let (introspector, _, access, _) = issued().await;
        assert_eq!(
            introspector
                .introspect(&access, "client-a", "")
                .await
                .unwrap_err()
                .code(),
            "invalid_request"
        );
        assert_eq!(
            introspector
                .introspect(&access, "client-a", "wrong")
                .await
                .unwrap_err()
                .code(),
            "invalid_client"
        );
    }
}

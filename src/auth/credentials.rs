use super::error::TokenError;
use super::token::JwtSigner;
use super::traits::{CodeChallengeMethod, GrantType, token_use};
use crate::store::{Application, Directory, StoreResult, TokenStore, User, split_id};
use axum::http::{HeaderMap, header};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Client id/secret pair as presented by the caller. Empty strings mean "not sent".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl ClientCredentials {
    pub fn new(client_id: Option<&str>, client_secret: Option<&str>) -> Self {
        Self {
            client_id: client_id.unwrap_or_default().to_string(),
            client_secret: client_secret.unwrap_or_default().to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.client_id.is_empty() && self.client_secret.is_empty()
    }
}

/// Decodes `Authorization: Basic` client credentials (RFC 6749 §2.3.1 form-encodes both halves)
pub fn basic_auth(headers: &HeaderMap) -> Option<ClientCredentials> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value
        .strip_prefix("Basic ")
        .or_else(|| value.strip_prefix("basic "))?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (id, secret) = decoded.split_once(':')?;

    let id = urlencoding::decode(id).ok()?.into_owned();
    let secret = urlencoding::decode(secret).ok()?.into_owned();
    if id.is_empty() {
        return None;
    }
    Some(ClientCredentials {
        client_id: id,
        client_secret: secret,
    })
}

/// Picks the caller's client credentials: HTTP Basic, then request body, then query string.
pub fn resolve_client_credentials(
    headers: &HeaderMap,
    body: &ClientCredentials,
    query: &ClientCredentials,
) -> ClientCredentials {
    if let Some(basic) = basic_auth(headers) {
        return basic;
    }
    if !body.is_empty() {
        return body.clone();
    }
    query.clone()
}

/// Extracts a bearer token from the Authorization header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

pub fn secret_matches(application: &Application, presented: &str) -> bool {
    presented
        .as_bytes()
        .ct_eq(application.client_secret.as_bytes())
        .into()
}

/// Signed-in user behind a bearer access token issued by this server
#[derive(Debug, Clone)]
pub struct Session {
    pub user: User,
}

/// Resolves client identity and validates the request-shape parameters tied to it.
/// Never mutates anything.
#[derive(Clone)]
pub struct ClientValidator {
    directory: Arc<dyn Directory>,
    tokens: Arc<dyn TokenStore>,
}

impl ClientValidator {
    pub fn new(directory: Arc<dyn Directory>, tokens: Arc<dyn TokenStore>) -> Self {
        Self { directory, tokens }
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    /// Looks the client up without checking a secret
    pub async fn get_client(&self, client_id: &str) -> Result<Application, TokenError> {
        if client_id.is_empty() {
            return Err(TokenError::InvalidClient("client_id is empty".to_string()));
        }
        match self.directory.get_application_by_client_id(client_id).await? {
            Some(application) => Ok(application),
            None => {
                tracing::warn!("unknown client_id presented: {}", client_id);
                Err(TokenError::InvalidClient(format!(
                    "client_id: {} is invalid",
                    client_id
                )))
            }
        }
    }

    /// Looks the client up and requires an exact secret match
    pub async fn validate(
        &self,
        client_id: &str,
        client_secret: &str,
    ) -> Result<Application, TokenError> {
        let application = self.get_client(client_id).await?;
        if !secret_matches(&application, client_secret) {
            tracing::warn!(
                "Invalid client credentials attempted for client_id: {}",
                client_id
            );
            return Err(TokenError::InvalidClient(
                "client_secret is invalid".to_string(),
            ));
        }
        Ok(application)
    }

    pub fn validate_redirect_uri(
        &self,
        application: &Application,
        redirect_uri: &str,
    ) -> Result<(), TokenError> {
        if application.redirect_uris.iter().any(|uri| uri == redirect_uri) {
            return Ok(());
        }
        tracing::warn!(
            "rejected redirect_uri '{}' for application '{}'",
            redirect_uri,
            application.get_id()
        );
        Err(TokenError::InvalidRequest(format!(
            "redirect URI: {} doesn't exist in the allowed Redirect URI list",
            redirect_uri
        )))
    }

    pub fn validate_challenge_method(
        &self,
        method: &str,
    ) -> Result<CodeChallengeMethod, TokenError> {
        CodeChallengeMethod::parse(method)
    }

    /// Rejects grant types the application has not been enabled for
    pub fn check_grant_allowed(
        &self,
        application: &Application,
        grant_type: GrantType,
    ) -> Result<(), TokenError> {
        let allowed = if application.grant_types.is_empty() {
            matches!(
                grant_type,
                GrantType::AuthorizationCode | GrantType::RefreshToken
            )
        } else {
            application
                .grant_types
                .iter()
                .any(|g| g == grant_type.as_str())
        };
        if allowed {
            Ok(())
        } else {
            Err(TokenError::UnauthorizedClient(format!(
                "grant_type: {} is not enabled for application {}",
                grant_type,
                application.get_id()
            )))
        }
    }

    /// Builds the signer for the certificate bound to `application`. The cert is named
    /// either as `owner/name` or by bare name under the application's owner.
    pub async fn signer_for(&self, application: &Application) -> Result<JwtSigner, TokenError> {
        let (owner, name) =
            split_id(&application.cert).unwrap_or((&application.owner, &application.cert));
        let cert = self
            .directory
            .get_cert(owner, name)
            .await?
            .ok_or_else(|| {
                tracing::error!(
                    "application {} is bound to missing cert '{}'",
                    application.get_id(),
                    application.cert
                );
                TokenError::Server("application has no signing certificate".to_string())
            })?;
        JwtSigner::from_cert(&cert).map_err(|e| {
            tracing::error!("unusable cert for {}: {}", application.get_id(), e);
            TokenError::Server("application signing certificate is unusable".to_string())
        })
    }

    /// First-party session: a live access token issued by this server, whose user still exists.
    pub async fn resolve_session(&self, bearer: &str) -> StoreResult<Option<Session>> {
        let Some(token) = self.tokens.get_token_by_access_token(bearer).await? else {
            return Ok(None);
        };
        let Some(application) = self
            .directory
            .get_application(&token.owner, &token.application)
            .await?
        else {
            return Ok(None);
        };
        let Ok(signer) = self.signer_for(&application).await else {
            return Ok(None);
        };
        match signer.verify(bearer, &application.client_id) {
            Ok(claims) if claims.token_type == token_use::ACCESS => {}
            Ok(_) => return Ok(None),
            Err(e) => {
                tracing::debug!("session token rejected: {}", e);
                return Ok(None);
            }
        }
        let Some(user) = self
            .directory
            .get_user(&token.organization, &token.user)
            .await?
        else {
            return Ok(None);
        };
        if user.is_forbidden {
            return Ok(None);
        }
        Ok(Some(Session { user }))
    }
}

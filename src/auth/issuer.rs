use super::authorization_code::verify_pkce;
use super::credentials::{ClientValidator, secret_matches};
use super::error::TokenError;
use super::token::{ClaimsInput, JwtSigner, build_claims, issuer_origin};
use super::traits::{GrantType, TokenWrapper, scope_contains, scope_is_subset, token_use};
use crate::store::{Application, CodeRedemption, Token, TokenStore, User};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct IssuerSettings {
    /// Overrides the request-host derived `iss`
    pub public_url: Option<String>,
    /// Seconds `nbf` is backdated
    pub clock_skew: i64,
}

/// Token endpoint parameters after merging Basic auth, body and query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenRequest {
    #[serde(default)]
    pub grant_type: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub code_verifier: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub avatar: String,
}

struct Minted {
    access_token: String,
    refresh_token: String,
    id_token: Option<String>,
    expires_in: i64,
    refresh_expires_in: i64,
    issued_at: DateTime<Utc>,
}

/// Grant-type dispatcher. Holds no mutable state of its own; every transition of a code or
/// refresh token goes through a compare-and-set on the token store.
#[derive(Clone)]
pub struct TokenIssuer {
    validator: ClientValidator,
    tokens: Arc<dyn TokenStore>,
    settings: IssuerSettings,
}

impl TokenIssuer {
    pub fn new(
        validator: ClientValidator,
        tokens: Arc<dyn TokenStore>,
        settings: IssuerSettings,
    ) -> Self {
        Self {
            validator,
            tokens,
            settings,
        }
    }

    pub(super) fn validator(&self) -> &ClientValidator {
        &self.validator
    }

    pub(super) fn tokens(&self) -> &Arc<dyn TokenStore> {
        &self.tokens
    }

    pub async fn grant(&self, req: &TokenRequest, host: &str) -> Result<TokenWrapper, TokenError> {
        let grant_type: GrantType = req.grant_type.parse()?;
        tracing::info!(
            "Token request: grant_type={}, client_id={}",
            grant_type,
            req.client_id
        );

        let application = self.validator.get_client(&req.client_id).await?;
        match grant_type {
            // public clients may omit the secret, but a presented one has to be right
            GrantType::AuthorizationCode | GrantType::RefreshToken => {
                if !req.client_secret.is_empty() && !secret_matches(&application, &req.client_secret)
                {
                    tracing::warn!(
                        "Invalid client credentials attempted for client_id: {}",
                        req.client_id
                    );
                    return Err(TokenError::InvalidClient(
                        "client_secret is invalid".to_string(),
                    ));
                }
            }
            GrantType::Password | GrantType::ClientCredentials => {
                self.validator
                    .validate(&req.client_id, &req.client_secret)
                    .await?;
            }
        }
        self.validator.check_grant_allowed(&application, grant_type)?;

        let issuer = issuer_origin(host, self.settings.public_url.as_deref());
        match grant_type {
            GrantType::AuthorizationCode => {
                self.authorization_code_grant(&application, req, &issuer).await
            }
            GrantType::RefreshToken => self.refresh_token_grant(&application, req, &issuer).await,
            GrantType::Password => self.password_grant(&application, req, &issuer).await,
            GrantType::ClientCredentials => {
                self.client_credentials_grant(&application, req, &issuer)
                    .await
            }
        }
    }

    async fn authorization_code_grant(
        &self,
        application: &Application,
        req: &TokenRequest,
        issuer: &str,
    ) -> Result<TokenWrapper, TokenError> {
        if req.code.is_empty() {
            return Err(TokenError::InvalidRequest(
                "Missing required parameter: code".to_string(),
            ));
        }

        let Some(pending) = self.tokens.get_token_by_code(&req.code).await? else {
            tracing::warn!("Invalid or expired authorization code");
            return Err(TokenError::InvalidGrant(
                "authorization code is invalid".to_string(),
            ));
        };
        if pending.code_is_used {
            tracing::warn!(
                "replayed authorization code for token {} (client_id={})",
                pending.get_id(),
                application.client_id
            );
            return Err(TokenError::InvalidGrant(
                "authorization code has been used".to_string(),
            ));
        }
        if pending.owner != application.owner || pending.application != application.name {
            return Err(TokenError::InvalidGrant(
                "authorization code was issued to another client".to_string(),
            ));
        }
        if req.client_secret.is_empty() && pending.code_challenge.is_empty() {
            return Err(TokenError::InvalidClient(
                "client_secret is required when the code carries no PKCE challenge".to_string(),
            ));
        }
        if !pending.code_challenge.is_empty() && !verify_pkce(&req.code_verifier, &pending.code_challenge) {
            tracing::warn!(
                "PKCE verification failed for client {}",
                application.client_id
            );
            return Err(TokenError::InvalidGrant(
                "PKCE verification failed".to_string(),
            ));
        }
        if Utc::now() >= pending.code_expire_in {
            return Err(TokenError::InvalidGrant(
                "authorization code has expired".to_string(),
            ));
        }

        let user = self.load_user(&pending.organization, &pending.user).await?;
        let minted = self
            .mint(application, &user, &pending.scope, &pending.nonce, req, issuer, true)
            .await?;

        let redemption = CodeRedemption {
            access_token: minted.access_token.clone(),
            refresh_token: minted.refresh_token.clone(),
            expires_in: minted.expires_in,
            refresh_expires_in: minted.refresh_expires_in,
            issued_at: minted.issued_at,
        };
        let Some(redeemed) = self.tokens.redeem_code(&req.code, redemption).await? else {
            // lost the race against a concurrent redemption of the same code
            tracing::warn!("authorization code redeemed concurrently: {}", pending.get_id());
            return Err(TokenError::InvalidGrant(
                "authorization code has been used".to_string(),
            ));
        };

        tracing::info!(
            "Issued token via authorization_code for user {}/{} (client_id={})",
            redeemed.organization,
            redeemed.user,
            application.client_id
        );
        Ok(wrap(&redeemed, minted))
    }

    async fn refresh_token_grant(
        &self,
        application: &Application,
        req: &TokenRequest,
        issuer: &str,
    ) -> Result<TokenWrapper, TokenError> {
        if req.refresh_token.is_empty() {
            return Err(TokenError::InvalidRequest(
                "Missing required parameter: refresh_token".to_string(),
            ));
        }

        let invalid = || {
            TokenError::InvalidGrant("refresh token is invalid, expired or revoked".to_string())
        };
        let Some(current) = self
            .tokens
            .get_token_by_refresh_token(&req.refresh_token)
            .await?
        else {
            return Err(invalid());
        };
        if current.owner != application.owner || current.application != application.name {
            return Err(invalid());
        }

        let signer = self.validator.signer_for(application).await?;
        match signer.verify(&req.refresh_token, &application.client_id) {
            Ok(claims) if claims.token_type == token_use::REFRESH => {}
            Ok(_) => return Err(invalid()),
            Err(e) => {
                tracing::debug!("refresh token rejected: {}", e);
                return Err(invalid());
            }
        }

        let scope = if req.scope.is_empty() {
            current.scope.clone()
        } else if scope_is_subset(&req.scope, &current.scope) {
            req.scope.clone()
        } else {
            return Err(TokenError::InvalidScope(format!(
                "scope '{}' exceeds the originally granted '{}'",
                req.scope, current.scope
            )));
        };

        let user = self.load_user(&current.organization, &current.user).await?;
        let minted = self
            .mint_with(&signer, application, &user, &scope, "", req, issuer, true)?;
        let successor = self.token_row(application, &user, &scope, &minted);

        if !self
            .tokens
            .rotate_refresh_token(&req.refresh_token, successor.clone())
            .await?
        {
            tracing::warn!(
                "refresh token for {} was rotated concurrently",
                current.get_id()
            );
            return Err(invalid());
        }

        tracing::info!(
            "Rotated refresh token {} -> {} (client_id={})",
            current.get_id(),
            successor.get_id(),
            application.client_id
        );
        Ok(wrap(&successor, minted))
    }

    async fn password_grant(
        &self,
        application: &Application,
        req: &TokenRequest,
        issuer: &str,
    ) -> Result<TokenWrapper, TokenError> {
        if req.username.is_empty() {
            return Err(TokenError::InvalidRequest(
                "Missing required parameter: username".to_string(),
            ));
        }

        let rejected = || TokenError::InvalidGrant("invalid username or password".to_string());
        let Some(user) = self
            .validator
            .directory()
            .get_user(&application.organization, &req.username)
            .await?
        else {
            return Err(rejected());
        };
        if user.is_forbidden || !user.check_password(&req.password) {
            tracing::warn!("password grant rejected for {}", user.get_id());
            return Err(rejected());
        }

        let minted = self
            .mint(application, &user, &req.scope, "", req, issuer, true)
            .await?;
        let row = self.token_row(application, &user, &req.scope, &minted);
        self.tokens.add_token(row.clone()).await?;

        tracing::info!(
            "Issued token via password for user {} (client_id={})",
            user.get_id(),
            application.client_id
        );
        Ok(wrap(&row, minted))
    }

    async fn client_credentials_grant(
        &self,
        application: &Application,
        req: &TokenRequest,
        issuer: &str,
    ) -> Result<TokenWrapper, TokenError> {
        // the application acts on its own behalf
        let principal = User {
            owner: application.owner.clone(),
            name: application.name.clone(),
            id: application.get_id(),
            created_time: application.created_time,
            display_name: application.display_name.clone(),
            password: String::new(),
            password_type: "plain".to_string(),
            email: String::new(),
            avatar: String::new(),
            tag: "application".to_string(),
            is_admin: false,
            is_forbidden: false,
        };

        let minted = self
            .mint(application, &principal, &req.scope, "", req, issuer, false)
            .await?;
        let mut row = self.token_row(application, &principal, &req.scope, &minted);
        row.organization = application.organization.clone();
        self.tokens.add_token(row.clone()).await?;

        tracing::info!(
            "Issued token via client_credentials for client: {}",
            application.client_id
        );
        Ok(wrap(&row, minted))
    }

    async fn load_user(&self, owner: &str, name: &str) -> Result<User, TokenError> {
        match self.validator.directory().get_user(owner, name).await? {
            Some(user) if !user.is_forbidden => Ok(user),
            _ => Err(TokenError::InvalidGrant(format!(
                "user {}/{} is unavailable",
                owner, name
            ))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn mint(
        &self,
        application: &Application,
        user: &User,
        scope: &str,
        nonce: &str,
        req: &TokenRequest,
        issuer: &str,
        with_refresh: bool,
    ) -> Result<Minted, TokenError> {
        let signer = self.validator.signer_for(application).await?;
        self.mint_with(&signer, application, user, scope, nonce, req, issuer, with_refresh)
    }

    /// Signs the access token, the refresh token (when asked) and, for `openid` scopes,
    /// an id_token, all from the same issuance instant.
    #[allow(clippy::too_many_arguments)]
    fn mint_with(
        &self,
        signer: &JwtSigner,
        application: &Application,
        user: &User,
        scope: &str,
        nonce: &str,
        req: &TokenRequest,
        issuer: &str,
        with_refresh: bool,
    ) -> Result<Minted, TokenError> {
        let issued_at = Utc::now();
        let expires_in = application.expire_in_hours * 3600;
        let sign = |token_use: &str, lifetime: Duration, nonce: &str| {
            let claims = build_claims(ClaimsInput {
                issuer,
                user,
                application,
                scope,
                token_use,
                issued_at,
                lifetime,
                skew: self.settings.clock_skew,
                nonce,
                tag: &req.tag,
                avatar: &req.avatar,
            });
            signer.sign(&claims).map_err(|e| {
                tracing::error!("Failed to issue token: {}", e);
                TokenError::Server("Failed to issue token".to_string())
            })
        };

        let access_token = sign(token_use::ACCESS, Duration::seconds(expires_in), "")?;
        let (refresh_token, refresh_expires_in) = if with_refresh {
            let lifetime = Duration::hours(application.refresh_expire_in_hours);
            (
                sign(token_use::REFRESH, lifetime, "")?,
                lifetime.num_seconds(),
            )
        } else {
            (String::new(), 0)
        };
        let id_token = if with_refresh && scope_contains(scope, "openid") {
            Some(sign(token_use::ID, Duration::seconds(expires_in), nonce)?)
        } else {
            None
        };

        Ok(Minted {
            access_token,
            refresh_token,
            id_token,
            expires_in,
            refresh_expires_in,
            issued_at,
        })
    }

    fn token_row(&self, application: &Application, user: &User, scope: &str, minted: &Minted) -> Token {
        Token {
            owner: application.owner.clone(),
            name: Uuid::new_v4().to_string(),
            created_time: minted.issued_at,
            application: application.name.clone(),
            organization: user.owner.clone(),
            user: user.name.clone(),
            code: String::new(),
            access_token: minted.access_token.clone(),
            refresh_token: minted.refresh_token.clone(),
            expires_in: minted.expires_in,
            refresh_expires_in: minted.refresh_expires_in,
            scope: scope.to_string(),
            token_type: "Bearer".to_string(),
            redirect_uri: String::new(),
            code_challenge: String::new(),
            code_is_used: true,
            code_expire_in: minted.issued_at,
            nonce: String::new(),
        }
    }
}

fn wrap(token: &Token, minted: Minted) -> TokenWrapper {
    TokenWrapper {
        access_token: minted.access_token,
        id_token: minted.id_token,
        refresh_token: minted.refresh_token,
        token_type: token.token_type.clone(),
        expires_in: minted.expires_in,
        scope: token.scope.clone(),
    }
}

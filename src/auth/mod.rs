mod authorization_code;
mod credentials;
mod error;
mod handlers;
mod introspection;
mod issuer;
mod middleware;
mod token;
mod traits;

pub use handlers::{OAuthAppState, admin_routes, discovery_routes, session_routes, token_routes};
pub use issuer::IssuerSettings;
pub use middleware::{AuthzConfig, authz_middleware};

use crate::store::{Directory, TokenStore};
use credentials::ClientValidator;
use introspection::Introspector;
use issuer::TokenIssuer;
use std::sync::Arc;

/// Complete OAuth service that combines validation, issuing, and introspection
#[derive(Clone)]
pub struct OAuthService {
    validator: ClientValidator,
    issuer: TokenIssuer,
    introspector: Introspector,
    tokens: Arc<dyn TokenStore>,
    public_url: Option<String>,
}

impl OAuthService {
    pub fn new(
        directory: Arc<dyn Directory>,
        tokens: Arc<dyn TokenStore>,
        settings: IssuerSettings,
    ) -> Self {
        let validator = ClientValidator::new(directory, tokens.clone());
        let public_url = settings.public_url.clone();
        let issuer = TokenIssuer::new(validator.clone(), tokens.clone(), settings);
        let introspector = Introspector::new(validator.clone(), tokens.clone());

        Self {
            validator,
            issuer,
            introspector,
            tokens,
            public_url,
        }
    }

    pub fn validator(&self) -> &ClientValidator {
        &self.validator
    }

    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    pub fn introspector(&self) -> &Introspector {
        &self.introspector
    }

    pub fn tokens(&self) -> &Arc<dyn TokenStore> {
        &self.tokens
    }

    pub fn public_url(&self) -> Option<&str> {
        self.public_url.as_deref()
    }
}

use super::error::TokenError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantType {
    AuthorizationCode,
    RefreshToken,
    Password,
    ClientCredentials,
}

impl GrantType {
    pub const ALL: [GrantType; 4] = [
        GrantType::AuthorizationCode,
        GrantType::RefreshToken,
        GrantType::Password,
        GrantType::ClientCredentials,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GrantType::AuthorizationCode => "authorization_code",
            GrantType::RefreshToken => "refresh_token",
            GrantType::Password => "password",
            GrantType::ClientCredentials => "client_credentials",
        }
    }
}

impl fmt::Display for GrantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GrantType {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GrantType::ALL
            .into_iter()
            .find(|g| g.as_str() == s)
            .ok_or_else(|| {
                TokenError::UnsupportedGrantType(format!("grant_type: {} is not supported", s))
            })
    }
}

/// PKCE challenge method. Only S256 digests are ever verified; "null" and an empty
/// value are accepted for clients that send the parameter without using PKCE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodeChallengeMethod {
    S256,
    #[default]
    Absent,
}

impl CodeChallengeMethod {
    pub fn parse(method: &str) -> Result<Self, TokenError> {
        match method {
            "S256" => Ok(CodeChallengeMethod::S256),
            "null" | "" => Ok(CodeChallengeMethod::Absent),
            other => Err(TokenError::InvalidRequest(format!(
                "challenge method should be S256, got: {}",
                other
            ))),
        }
    }
}

/// The `token_type` claim distinguishing what a signed JWT is for
pub mod token_use {
    pub const ACCESS: &str = "access-token";
    pub const REFRESH: &str = "refresh-token";
    pub const ID: &str = "id-token";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenWrapper {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64, // seconds
    pub scope: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub iss: String,
    pub sub: String, // user id
    pub aud: String, // client id
    pub exp: i64,
    pub iat: i64,
    pub nbf: i64,
    pub jti: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub token_type: String,
    pub owner: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nonce: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub avatar: String,
}

/// RFC 7662 response. Inactive tokens serialise as just `{"active":false}`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct IntrospectionResponse {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

impl IntrospectionResponse {
    pub fn inactive() -> Self {
        Self::default()
    }
}

/// Space-delimited scope handling
pub fn scope_items(scope: &str) -> impl Iterator<Item = &str> {
    scope.split_whitespace()
}

pub fn scope_contains(scope: &str, item: &str) -> bool {
    scope_items(scope).any(|s| s == item)
}

/// True when every item of `requested` appears in `granted`
pub fn scope_is_subset(requested: &str, granted: &str) -> bool {
    scope_items(requested).all(|item| scope_contains(granted, item))
}

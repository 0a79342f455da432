use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Table compiled permissions land in when a permission names no adapter.
pub const DEFAULT_RULE_TABLE: &str = "permission_rule";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub owner: String,
    pub name: String,
    pub created_time: DateTime<Utc>,
    pub display_name: String,
    pub website_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub owner: String,
    pub name: String,
    /// Stable identifier used as the `sub` claim
    pub id: String,
    pub created_time: DateTime<Utc>,
    pub display_name: String,
    #[serde(skip_serializing)]
    pub password: String,
    /// "plain" or "sha256"
    pub password_type: String,
    pub email: String,
    pub avatar: String,
    pub tag: String,
    pub is_admin: bool,
    pub is_forbidden: bool,
}

impl User {
    pub fn get_id(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// Constant-time check of a presented password against the stored one
    pub fn check_password(&self, presented: &str) -> bool {
        let candidate = match self.password_type.as_str() {
            "sha256" => hex_sha256(presented),
            _ => presented.to_string(),
        };
        candidate.as_bytes().ct_eq(self.password.as_bytes()).into()
    }
}

fn hex_sha256(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub owner: String,
    pub name: String,
    pub created_time: DateTime<Utc>,
    pub display_name: String,
    pub organization: String,
    pub client_id: String,
    #[serde(skip_serializing)]
    pub client_secret: String,
    /// Exact-match allow list, order preserved
    pub redirect_uris: Vec<String>,
    /// Grant types this client may use. Empty means authorization_code + refresh_token.
    pub grant_types: Vec<String>,
    pub expire_in_hours: i64,
    pub refresh_expire_in_hours: i64,
    /// Name of the signing certificate (owner is always "admin")
    pub cert: String,
    /// Names of the identity providers bound to this application
    pub providers: Vec<String>,
}

impl Application {
    pub fn get_id(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cert {
    pub owner: String,
    pub name: String,
    pub created_time: DateTime<Utc>,
    pub display_name: String,
    pub scope: String,
    #[serde(rename = "type")]
    pub cert_type: String,
    /// JWS algorithm name, e.g. "RS256" or "HS256"
    pub crypto_algorithm: String,
    pub bit_size: u32,
    pub expire_in_years: u32,
    /// Public key PEM (asymmetric algorithms) or empty for HMAC
    pub certificate: String,
    /// Private key PEM, or the shared secret for HMAC algorithms
    #[serde(skip_serializing)]
    pub private_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub owner: String,
    pub name: String,
    pub created_time: DateTime<Utc>,
    pub application: String,
    pub organization: String,
    pub user: String,
    pub code: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds, counted from `created_time`
    pub expires_in: i64,
    /// Refresh token lifetime in seconds; zero when no refresh token was issued
    #[serde(default)]
    pub refresh_expires_in: i64,
    pub scope: String,
    pub token_type: String,
    pub redirect_uri: String,
    pub code_challenge: String,
    pub code_is_used: bool,
    pub code_expire_in: DateTime<Utc>,
    pub nonce: String,
}

impl Token {
    pub fn get_id(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        (now - self.created_time).num_seconds() >= self.expires_in
    }

    /// Nothing left in the row can be redeemed or presented any more
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        if !self.code.is_empty() && !self.code_is_used {
            return self.code_expire_in <= now;
        }
        self.is_expired(now)
            && (self.refresh_token.is_empty()
                || (now - self.created_time).num_seconds() >= self.refresh_expires_in)
    }
}

/// Tokens written onto a code row the moment it is redeemed.
#[derive(Debug, Clone)]
pub struct CodeRedemption {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub refresh_expires_in: i64,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub owner: String,
    pub name: String,
    #[serde(default = "Utc::now")]
    pub created_time: DateTime<Utc>,
    #[serde(default)]
    pub display_name: String,
    pub model_text: String,
    #[serde(default)]
    pub is_enabled: bool,
}

impl Model {
    pub fn get_id(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Adapter {
    pub owner: String,
    pub name: String,
    #[serde(default = "Utc::now")]
    pub created_time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub adapter_type: String,
    #[serde(default)]
    pub database_type: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub is_enabled: bool,
}

impl Adapter {
    pub fn get_id(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Persisted half of an enforcer; the runtime engine lives in `policy::Enforcer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnforcerRecord {
    pub owner: String,
    pub name: String,
    #[serde(default = "Utc::now")]
    pub created_time: DateTime<Utc>,
    #[serde(default)]
    pub display_name: String,
    /// Model id ("owner/name")
    pub model: String,
    /// Adapter id ("owner/name")
    pub adapter: String,
    #[serde(default)]
    pub is_enabled: bool,
}

impl EnforcerRecord {
    pub fn get_id(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub owner: String,
    pub name: String,
    #[serde(default = "Utc::now")]
    pub created_time: DateTime<Utc>,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub domains: Vec<String>,
    /// Model id ("owner/name"), may be empty
    #[serde(default)]
    pub model: String,
    /// Adapter id ("owner/name"), empty means the shared default table
    #[serde(default)]
    pub adapter: String,
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub effect: String,
    #[serde(default)]
    pub is_enabled: bool,
}

impl Permission {
    pub fn get_id(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// One compiled row in an adapter table: `ptype, v0..v5` plus the owning permission id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub ptype: String,
    pub values: Vec<String>,
    /// Permission id this row was compiled from, empty for hand-written rows
    #[serde(default)]
    pub id: String,
}

impl PolicyRule {
    pub const MAX_VALUES: usize = 6;

    pub fn new(ptype: &str, values: Vec<String>, id: &str) -> Self {
        Self {
            ptype: ptype.to_string(),
            values,
            id: id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(password: &str, password_type: &str) -> User {
        User {
            owner: "built-in".into(),
            name: "alice".into(),
            id: "u-1".into(),
            created_time: Utc::now(),
            display_name: "Alice".into(),
            password: password.into(),
            password_type: password_type.into(),
            email: String::new(),
            avatar: String::new(),
            tag: String::new(),
            is_admin: false,
            is_forbidden: false,
        }
    }

    #[test]
    fn test_plain_password() {
        let u = user("123", "plain");
        assert!(u.check_password("123"));
        assert!(!u.check_password("1234"));
    }

    #[test]
    fn test_sha256_password() {
        let u = user(&hex_sha256("hunter2"), "sha256");
        assert!(u.check_password("hunter2"));
        assert!(!u.check_password(&hex_sha256("hunter2")));
    }

    #[test]
    fn test_token_expiry_boundary() {
        let now = Utc::now();
        let token = Token {
            owner: "admin".into(),
            name: "t".into(),
            created_time: now - chrono::Duration::seconds(3600),
            application: "app".into(),
            organization: "org".into(),
            user: "alice".into(),
            code: String::new(),
            access_token: String::new(),
            refresh_token: String::new(),
            expires_in: 3600,
            refresh_expires_in: 0,
            scope: String::new(),
            token_type: "Bearer".into(),
            redirect_uri: String::new(),
            code_challenge: String::new(),
            code_is_used: true,
            code_expire_in: now,
            nonce: String::new(),
        };
        assert!(token.is_expired(now));
        assert!(!token.is_expired(now - chrono::Duration::seconds(1)));
        assert!(token.is_stale(now));

        // a live refresh token keeps the row around after the access token lapses
        let refreshable = Token {
            refresh_token: "r".into(),
            refresh_expires_in: 7200,
            ..token
        };
        assert!(refreshable.is_expired(now));
        assert!(!refreshable.is_stale(now));
    }
}

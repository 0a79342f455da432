mod memory;
mod models;

pub use memory::MemoryStore;
pub use models::{
    Adapter, Application, Cert, CodeRedemption, DEFAULT_RULE_TABLE, EnforcerRecord, Model,
    Organization, Permission, PolicyRule, Token, User,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} '{id}' already exists")]
    Conflict { kind: &'static str, id: String },

    #[error("storage backend failure: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Splits an "owner/name" id. Both halves must be non-empty.
pub fn split_id(id: &str) -> Option<(&str, &str)> {
    match id.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() => Some((owner, name)),
        _ => None,
    }
}

/// Organizations, users, applications and certificates
#[async_trait]
pub trait Directory: Send + Sync {
    async fn get_organization(&self, owner: &str, name: &str) -> StoreResult<Option<Organization>>;
    async fn has_organizations(&self) -> StoreResult<bool>;
    async fn add_organization(&self, organization: Organization) -> StoreResult<()>;

    async fn get_user(&self, owner: &str, name: &str) -> StoreResult<Option<User>>;
    async fn add_user(&self, user: User) -> StoreResult<()>;

    async fn get_application(&self, owner: &str, name: &str) -> StoreResult<Option<Application>>;
    async fn get_application_by_client_id(&self, client_id: &str)
    -> StoreResult<Option<Application>>;
    async fn add_application(&self, application: Application) -> StoreResult<()>;

    async fn get_cert(&self, owner: &str, name: &str) -> StoreResult<Option<Cert>>;
    async fn add_cert(&self, cert: Cert) -> StoreResult<()>;
}

/// Issued codes and tokens. The two mutating lookups are compare-and-set:
/// concurrent callers racing on the same code or refresh token see exactly one winner.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn add_token(&self, token: Token) -> StoreResult<()>;
    async fn get_token(&self, owner: &str, name: &str) -> StoreResult<Option<Token>>;
    async fn get_tokens(&self, owner: &str) -> StoreResult<Vec<Token>>;
    async fn get_tokens_by_application(&self, application: &str) -> StoreResult<Vec<Token>>;
    async fn delete_token(&self, owner: &str, name: &str) -> StoreResult<bool>;

    async fn get_token_by_code(&self, code: &str) -> StoreResult<Option<Token>>;

    /// Marks the code used and attaches the issued tokens, only if nobody did so first.
    async fn redeem_code(
        &self,
        code: &str,
        redemption: CodeRedemption,
    ) -> StoreResult<Option<Token>>;

    async fn get_token_by_access_token(&self, access_token: &str) -> StoreResult<Option<Token>>;
    async fn get_token_by_refresh_token(&self, refresh_token: &str) -> StoreResult<Option<Token>>;

    /// Matches either the access or the refresh token value, restricted to one application.
    async fn get_token_by_value_and_application(
        &self,
        value: &str,
        application: &str,
    ) -> StoreResult<Option<Token>>;

    /// Removes the row owning `old_refresh_token` and inserts `successor` in one step.
    /// Returns false when the old row was already gone.
    async fn rotate_refresh_token(
        &self,
        old_refresh_token: &str,
        successor: Token,
    ) -> StoreResult<bool>;

    async fn delete_expired(&self, now: DateTime<Utc>) -> StoreResult<usize>;
}

/// Models, adapters, enforcers, permissions and the adapter-backed rule tables
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get_model(&self, id: &str) -> StoreResult<Option<Model>>;
    async fn get_models(&self) -> StoreResult<Vec<Model>>;
    async fn add_model(&self, model: Model) -> StoreResult<()>;
    async fn update_model(&self, id: &str, model: Model) -> StoreResult<bool>;

    async fn get_adapter(&self, id: &str) -> StoreResult<Option<Adapter>>;
    async fn add_adapter(&self, adapter: Adapter) -> StoreResult<()>;
    async fn update_adapter(&self, id: &str, adapter: Adapter) -> StoreResult<bool>;

    async fn get_enforcer(&self, id: &str) -> StoreResult<Option<EnforcerRecord>>;
    async fn add_enforcer(&self, enforcer: EnforcerRecord) -> StoreResult<()>;
    async fn update_enforcer(&self, id: &str, enforcer: EnforcerRecord) -> StoreResult<bool>;

    async fn get_permission(&self, id: &str) -> StoreResult<Option<Permission>>;
    /// Newest first; an empty owner lists every permission
    async fn get_permissions(&self, owner: &str) -> StoreResult<Vec<Permission>>;
    async fn add_permission(&self, permission: Permission) -> StoreResult<()>;
    async fn update_permission(&self, id: &str, permission: Permission) -> StoreResult<bool>;
    async fn delete_permission(&self, id: &str) -> StoreResult<bool>;

    async fn load_rules(&self, table: &str) -> StoreResult<Vec<PolicyRule>>;
    async fn add_rules(&self, table: &str, rules: Vec<PolicyRule>) -> StoreResult<()>;
    /// Deletes every row tagged with `permission_id`, then inserts `rules`, atomically.
    async fn replace_rules(
        &self,
        table: &str,
        permission_id: &str,
        rules: Vec<PolicyRule>,
    ) -> StoreResult<()>;
    async fn remove_rules(&self, table: &str, permission_id: &str) -> StoreResult<usize>;
    /// Tables holding at least one row tagged with `permission_id`, sorted by name
    async fn tables_with_rules(&self, permission_id: &str) -> StoreResult<Vec<String>>;
    /// Applies `rewrite` to every row of the table; returns how many rows it changed.
    async fn rewrite_rules(
        &self,
        table: &str,
        rewrite: &(dyn for<'r> Fn(&'r mut PolicyRule) -> bool + Send + Sync),
    ) -> StoreResult<usize>;
    async fn ensure_table(&self, table: &str) -> StoreResult<()>;
    async fn is_table_empty(&self, table: &str) -> StoreResult<bool>;
    async fn drop_table(&self, table: &str) -> StoreResult<()>;

    async fn schema_version(&self, key: &str) -> StoreResult<u32>;
    async fn set_schema_version(&self, key: &str, version: u32) -> StoreResult<()>;
}

use super::models::{
    Adapter, Application, Cert, CodeRedemption, EnforcerRecord, Model, Organization, Permission,
    PolicyRule, Token, User,
};
use super::{Directory, PolicyStore, StoreError, StoreResult, TokenStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

type Key = (String, String);

fn key(owner: &str, name: &str) -> Key {
    (owner.to_string(), name.to_string())
}

fn key_from_id(id: &str) -> Option<Key> {
    super::split_id(id).map(|(owner, name)| key(owner, name))
}

#[derive(Default)]
struct DirectoryTables {
    organizations: HashMap<Key, Organization>,
    users: HashMap<Key, User>,
    applications: HashMap<Key, Application>,
    certs: HashMap<Key, Cert>,
}

#[derive(Default)]
struct PolicyTables {
    models: HashMap<Key, Model>,
    adapters: HashMap<Key, Adapter>,
    enforcers: HashMap<Key, EnforcerRecord>,
    permissions: HashMap<Key, Permission>,
    /// table name -> rows, in insertion order
    rules: HashMap<String, Vec<PolicyRule>>,
    versions: HashMap<String, u32>,
}

/// In-process store behind async RwLocks. Every compare-and-set operation runs under a
/// single write guard, which is what makes code redemption and refresh rotation atomic.
#[derive(Clone, Default)]
pub struct MemoryStore {
    directory: Arc<RwLock<DirectoryTables>>,
    tokens: Arc<RwLock<HashMap<Key, Token>>>,
    policy: Arc<RwLock<PolicyTables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn insert_new<V>(
    map: &mut HashMap<Key, V>,
    k: Key,
    value: V,
    kind: &'static str,
) -> StoreResult<()> {
    if map.contains_key(&k) {
        return Err(StoreError::Conflict {
            kind,
            id: format!("{}/{}", k.0, k.1),
        });
    }
    map.insert(k, value);
    Ok(())
}

/// Replaces the value at `id`, re-keying it if the new value carries a different owner/name.
fn replace_at<V>(map: &mut HashMap<Key, V>, id: &str, new_key: Key, value: V) -> bool {
    let Some(old_key) = key_from_id(id) else {
        return false;
    };
    if map.remove(&old_key).is_none() {
        return false;
    }
    map.insert(new_key, value);
    true
}

#[async_trait]
impl Directory for MemoryStore {
    async fn get_organization(&self, owner: &str, name: &str) -> StoreResult<Option<Organization>> {
        let tables = self.directory.read().await;
        Ok(tables.organizations.get(&key(owner, name)).cloned())
    }

    async fn has_organizations(&self) -> StoreResult<bool> {
        Ok(!self.directory.read().await.organizations.is_empty())
    }

    async fn add_organization(&self, organization: Organization) -> StoreResult<()> {
        let k = key(&organization.owner, &organization.name);
        let mut tables = self.directory.write().await;
        insert_new(&mut tables.organizations, k, organization, "organization")
    }

    async fn get_user(&self, owner: &str, name: &str) -> StoreResult<Option<User>> {
        let tables = self.directory.read().await;
        Ok(tables.users.get(&key(owner, name)).cloned())
    }

    async fn add_user(&self, user: User) -> StoreResult<()> {
        let k = key(&user.owner, &user.name);
        let mut tables = self.directory.write().await;
        insert_new(&mut tables.users, k, user, "user")
    }

    async fn get_application(&self, owner: &str, name: &str) -> StoreResult<Option<Application>> {
        let tables = self.directory.read().await;
        Ok(tables.applications.get(&key(owner, name)).cloned())
    }

    async fn get_application_by_client_id(
        &self,
        client_id: &str,
    ) -> StoreResult<Option<Application>> {
        let tables = self.directory.read().await;
        Ok(tables
            .applications
            .values()
            .find(|app| app.client_id == client_id)
            .cloned())
    }

    async fn add_application(&self, application: Application) -> StoreResult<()> {
        let k = key(&application.owner, &application.name);
        let mut tables = self.directory.write().await;
        if tables
            .applications
            .values()
            .any(|app| app.client_id == application.client_id)
        {
            return Err(StoreError::Conflict {
                kind: "client_id",
                id: application.client_id,
            });
        }
        insert_new(&mut tables.applications, k, application, "application")
    }

    async fn get_cert(&self, owner: &str, name: &str) -> StoreResult<Option<Cert>> {
        let tables = self.directory.read().await;
        Ok(tables.certs.get(&key(owner, name)).cloned())
    }

    async fn add_cert(&self, cert: Cert) -> StoreResult<()> {
        let k = key(&cert.owner, &cert.name);
        let mut tables = self.directory.write().await;
        insert_new(&mut tables.certs, k, cert, "cert")
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn add_token(&self, token: Token) -> StoreResult<()> {
        let k = key(&token.owner, &token.name);
        let mut tokens = self.tokens.write().await;
        insert_new(&mut tokens, k, token, "token")
    }

    async fn get_token(&self, owner: &str, name: &str) -> StoreResult<Option<Token>> {
        Ok(self.tokens.read().await.get(&key(owner, name)).cloned())
    }

    async fn get_tokens(&self, owner: &str) -> StoreResult<Vec<Token>> {
        let tokens = self.tokens.read().await;
        let mut found: Vec<Token> = tokens.values().filter(|t| t.owner == owner).cloned().collect();
        found.sort_by(|a, b| b.created_time.cmp(&a.created_time));
        Ok(found)
    }

    async fn get_tokens_by_application(&self, application: &str) -> StoreResult<Vec<Token>> {
        let tokens = self.tokens.read().await;
        let mut found: Vec<Token> = tokens
            .values()
            .filter(|t| t.application == application)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_time.cmp(&a.created_time));
        Ok(found)
    }

    async fn delete_token(&self, owner: &str, name: &str) -> StoreResult<bool> {
        Ok(self.tokens.write().await.remove(&key(owner, name)).is_some())
    }

    async fn get_token_by_code(&self, code: &str) -> StoreResult<Option<Token>> {
        if code.is_empty() {
            return Ok(None);
        }
        let tokens = self.tokens.read().await;
        Ok(tokens.values().find(|t| t.code == code).cloned())
    }

    async fn redeem_code(
        &self,
        code: &str,
        redemption: CodeRedemption,
    ) -> StoreResult<Option<Token>> {
        if code.is_empty() {
            return Ok(None);
        }
        let mut tokens = self.tokens.write().await;
        let Some(token) = tokens
            .values_mut()
            .find(|t| t.code == code && !t.code_is_used)
        else {
            return Ok(None);
        };

        token.code_is_used = true;
        token.access_token = redemption.access_token;
        token.refresh_token = redemption.refresh_token;
        token.expires_in = redemption.expires_in;
        token.refresh_expires_in = redemption.refresh_expires_in;
        token.created_time = redemption.issued_at;
        Ok(Some(token.clone()))
    }

    async fn get_token_by_access_token(&self, access_token: &str) -> StoreResult<Option<Token>> {
        if access_token.is_empty() {
            return Ok(None);
        }
        let tokens = self.tokens.read().await;
        Ok(tokens
            .values()
            .find(|t| t.access_token == access_token)
            .cloned())
    }

    async fn get_token_by_refresh_token(&self, refresh_token: &str) -> StoreResult<Option<Token>> {
        if refresh_token.is_empty() {
            return Ok(None);
        }
        let tokens = self.tokens.read().await;
        Ok(tokens
            .values()
            .find(|t| t.refresh_token == refresh_token)
            .cloned())
    }

    async fn get_token_by_value_and_application(
        &self,
        value: &str,
        application: &str,
    ) -> StoreResult<Option<Token>> {
        if value.is_empty() {
            return Ok(None);
        }
        let tokens = self.tokens.read().await;
        Ok(tokens
            .values()
            .find(|t| {
                t.application == application
                    && (t.access_token == value || t.refresh_token == value)
            })
            .cloned())
    }

    async fn rotate_refresh_token(
        &self,
        old_refresh_token: &str,
        successor: Token,
    ) -> StoreResult<bool> {
        if old_refresh_token.is_empty() {
            return Ok(false);
        }
        let mut tokens = self.tokens.write().await;
        let Some(old_key) = tokens
            .iter()
            .find(|(_, t)| t.refresh_token == old_refresh_token)
            .map(|(k, _)| k.clone())
        else {
            return Ok(false);
        };

        let new_key = key(&successor.owner, &successor.name);
        if new_key != old_key && tokens.contains_key(&new_key) {
            return Err(StoreError::Conflict {
                kind: "token",
                id: successor.get_id(),
            });
        }
        tokens.remove(&old_key);
        tokens.insert(new_key, successor);
        Ok(true)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, t| !t.is_stale(now));
        Ok(before - tokens.len())
    }
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn get_model(&self, id: &str) -> StoreResult<Option<Model>> {
        let Some(k) = key_from_id(id) else {
            return Ok(None);
        };
        Ok(self.policy.read().await.models.get(&k).cloned())
    }

    async fn get_models(&self) -> StoreResult<Vec<Model>> {
        Ok(self.policy.read().await.models.values().cloned().collect())
    }

    async fn add_model(&self, model: Model) -> StoreResult<()> {
        let k = key(&model.owner, &model.name);
        let mut tables = self.policy.write().await;
        insert_new(&mut tables.models, k, model, "model")
    }

    async fn update_model(&self, id: &str, model: Model) -> StoreResult<bool> {
        let k = key(&model.owner, &model.name);
        let mut tables = self.policy.write().await;
        Ok(replace_at(&mut tables.models, id, k, model))
    }

    async fn get_adapter(&self, id: &str) -> StoreResult<Option<Adapter>> {
        let Some(k) = key_from_id(id) else {
            return Ok(None);
        };
        Ok(self.policy.read().await.adapters.get(&k).cloned())
    }

    async fn add_adapter(&self, adapter: Adapter) -> StoreResult<()> {
        let k = key(&adapter.owner, &adapter.name);
        let mut tables = self.policy.write().await;
        insert_new(&mut tables.adapters, k, adapter, "adapter")
    }

    async fn update_adapter(&self, id: &str, adapter: Adapter) -> StoreResult<bool> {
        let k = key(&adapter.owner, &adapter.name);
        let mut tables = self.policy.write().await;
        Ok(replace_at(&mut tables.adapters, id, k, adapter))
    }

    async fn get_enforcer(&self, id: &str) -> StoreResult<Option<EnforcerRecord>> {
        let Some(k) = key_from_id(id) else {
            return Ok(None);
        };
        Ok(self.policy.read().await.enforcers.get(&k).cloned())
    }

    async fn add_enforcer(&self, enforcer: EnforcerRecord) -> StoreResult<()> {
        let k = key(&enforcer.owner, &enforcer.name);
        let mut tables = self.policy.write().await;
        insert_new(&mut tables.enforcers, k, enforcer, "enforcer")
    }

    async fn update_enforcer(&self, id: &str, enforcer: EnforcerRecord) -> StoreResult<bool> {
        let k = key(&enforcer.owner, &enforcer.name);
        let mut tables = self.policy.write().await;
        Ok(replace_at(&mut tables.enforcers, id, k, enforcer))
    }

    async fn get_permission(&self, id: &str) -> StoreResult<Option<Permission>> {
        let Some(k) = key_from_id(id) else {
            return Ok(None);
        };
        Ok(self.policy.read().await.permissions.get(&k).cloned())
    }

    async fn get_permissions(&self, owner: &str) -> StoreResult<Vec<Permission>> {
        let tables = self.policy.read().await;
        let mut found: Vec<Permission> = tables
            .permissions
            .values()
            .filter(|p| owner.is_empty() || p.owner == owner)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_time.cmp(&a.created_time));
        Ok(found)
    }

    async fn add_permission(&self, permission: Permission) -> StoreResult<()> {
        let k = key(&permission.owner, &permission.name);
        let mut tables = self.policy.write().await;
        insert_new(&mut tables.permissions, k, permission, "permission")
    }

    async fn update_permission(&self, id: &str, permission: Permission) -> StoreResult<bool> {
        let k = key(&permission.owner, &permission.name);
        let mut tables = self.policy.write().await;
        Ok(replace_at(&mut tables.permissions, id, k, permission))
    }

    async fn delete_permission(&self, id: &str) -> StoreResult<bool> {
        let Some(k) = key_from_id(id) else {
            return Ok(false);
        };
        Ok(self.policy.write().await.permissions.remove(&k).is_some())
    }

    async fn load_rules(&self, table: &str) -> StoreResult<Vec<PolicyRule>> {
        let tables = self.policy.read().await;
        Ok(tables.rules.get(table).cloned().unwrap_or_default())
    }

    async fn add_rules(&self, table: &str, rules: Vec<PolicyRule>) -> StoreResult<()> {
        let mut tables = self.policy.write().await;
        tables.rules.entry(table.to_string()).or_default().extend(rules);
        Ok(())
    }

    async fn replace_rules(
        &self,
        table: &str,
        permission_id: &str,
        rules: Vec<PolicyRule>,
    ) -> StoreResult<()> {
        let mut tables = self.policy.write().await;
        let rows = tables.rules.entry(table.to_string()).or_default();
        rows.retain(|rule| rule.id != permission_id);
        rows.extend(rules);
        Ok(())
    }

    async fn remove_rules(&self, table: &str, permission_id: &str) -> StoreResult<usize> {
        let mut tables = self.policy.write().await;
        let Some(rows) = tables.rules.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|rule| rule.id != permission_id);
        Ok(before - rows.len())
    }

    async fn tables_with_rules(&self, permission_id: &str) -> StoreResult<Vec<String>> {
        let tables = self.policy.read().await;
        let mut found: Vec<String> = tables
            .rules
            .iter()
            .filter(|(_, rows)| rows.iter().any(|rule| rule.id == permission_id))
            .map(|(table, _)| table.clone())
            .collect();
        found.sort();
        Ok(found)
    }

    async fn rewrite_rules(
        &self,
        table: &str,
        rewrite: &(dyn for<'r> Fn(&'r mut PolicyRule) -> bool + Send + Sync),
    ) -> StoreResult<usize> {
        let mut tables = self.policy.write().await;
        let Some(rows) = tables.rules.get_mut(table) else {
            return Ok(0);
        };
        Ok(rows.iter_mut().map(|rule| rewrite(rule)).filter(|changed| *changed).count())
    }

    async fn ensure_table(&self, table: &str) -> StoreResult<()> {
        if table.is_empty() {
            return Err(StoreError::Backend("table name must not be empty".into()));
        }
        let mut tables = self.policy.write().await;
        tables.rules.entry(table.to_string()).or_default();
        Ok(())
    }

    async fn is_table_empty(&self, table: &str) -> StoreResult<bool> {
        let tables = self.policy.read().await;
        Ok(tables.rules.get(table).is_none_or(|rows| rows.is_empty()))
    }

    async fn drop_table(&self, table: &str) -> StoreResult<()> {
        self.policy.write().await.rules.remove(table);
        Ok(())
    }

    async fn schema_version(&self, key: &str) -> StoreResult<u32> {
        Ok(self.policy.read().await.versions.get(key).copied().unwrap_or(0))
    }

    async fn set_schema_version(&self, key: &str, version: u32) -> StoreResult<()> {
        self.policy
            .write()
            .await
            .versions
            .insert(key.to_string(), version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn code_row(name: &str, code: &str) -> Token {
        let now = Utc::now();
        Token {
            owner: "admin".into(),
            name: name.into(),
            created_time: now,
            application: "app".into(),
            organization: "org".into(),
            user: "alice".into(),
            code: code.into(),
            access_token: String::new(),
            refresh_token: String::new(),
            expires_in: 3600,
            refresh_expires_in: 0,
            scope: "read".into(),
            token_type: "Bearer".into(),
            redirect_uri: "https://a.test/cb".into(),
            code_challenge: String::new(),
            code_is_used: false,
            code_expire_in: now + Duration::minutes(5),
            nonce: String::new(),
        }
    }

    fn redemption(tag: &str) -> CodeRedemption {
        CodeRedemption {
            access_token: format!("access-{tag}"),
            refresh_token: format!("refresh-{tag}"),
            expires_in: 3600,
            refresh_expires_in: 7200,
            issued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_redeem_code_only_once() {
        let store = MemoryStore::new();
        store.add_token(code_row("t1", "c1")).await.unwrap();

        let first = store.redeem_code("c1", redemption("a")).await.unwrap();
        assert_eq!(first.unwrap().access_token, "access-a");

        let second = store.redeem_code("c1", redemption("b")).await.unwrap();
        assert!(second.is_none());

        let stored = store.get_token("admin", "t1").await.unwrap().unwrap();
        assert_eq!(stored.access_token, "access-a");
    }

    #[tokio::test]
    async fn test_concurrent_redeem_has_one_winner() {
        let store = MemoryStore::new();
        store.add_token(code_row("t1", "c1")).await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.redeem_code("c1", redemption(&i.to_string())).await })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_rotate_refresh_token() {
        let store = MemoryStore::new();
        let mut old = code_row("t1", "");
        old.refresh_token = "r1".into();
        store.add_token(old).await.unwrap();

        let mut next = code_row("t2", "");
        next.refresh_token = "r2".into();
        assert!(store.rotate_refresh_token("r1", next.clone()).await.unwrap());

        assert!(store.get_token_by_refresh_token("r1").await.unwrap().is_none());
        assert!(store.get_token_by_refresh_token("r2").await.unwrap().is_some());

        next.name = "t3".into();
        assert!(!store.rotate_refresh_token("r1", next).await.unwrap());
    }

    #[tokio::test]
    async fn test_lookup_scoped_to_application() {
        let store = MemoryStore::new();
        let mut row = code_row("t1", "");
        row.access_token = "at".into();
        store.add_token(row).await.unwrap();

        assert!(
            store
                .get_token_by_value_and_application("at", "app")
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            store
                .get_token_by_value_and_application("at", "other")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_delete_expired_keeps_live_codes() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let mut stale = code_row("stale", "");
        stale.code_is_used = true;
        stale.created_time = now - Duration::hours(2);
        store.add_token(stale).await.unwrap();
        store.add_token(code_row("pending", "c1")).await.unwrap();

        assert_eq!(store.delete_expired(now).await.unwrap(), 1);
        assert!(store.get_token("admin", "pending").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_replace_rules_is_full_regeneration() {
        let store = MemoryStore::new();
        store
            .add_rules(
                "t",
                vec![
                    PolicyRule::new("p", vec!["alice".into(), "doc".into()], "o/p1"),
                    PolicyRule::new("p", vec!["bob".into(), "doc".into()], "o/p2"),
                ],
            )
            .await
            .unwrap();

        store
            .replace_rules(
                "t",
                "o/p1",
                vec![PolicyRule::new("p", vec!["alice".into(), "img".into()], "o/p1")],
            )
            .await
            .unwrap();

        let rows = store.load_rules("t").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.values[1] != "doc" || r.id == "o/p2"));
    }

    #[tokio::test]
    async fn test_rewrite_rules_counts_changes() {
        let store = MemoryStore::new();
        store
            .add_rules(
                "t",
                vec![
                    PolicyRule::new("p", vec!["o/p1".into(), "alice".into()], ""),
                    PolicyRule::new("p", vec!["bob".into()], ""),
                ],
            )
            .await
            .unwrap();

        let strip = |rule: &mut PolicyRule| {
            let legacy = rule.values.first().is_some_and(|v| v.contains('/'));
            if legacy {
                rule.id = rule.values.remove(0);
            }
            legacy
        };
        assert_eq!(store.rewrite_rules("t", &strip).await.unwrap(), 1);
        assert_eq!(store.rewrite_rules("missing", &strip).await.unwrap(), 0);

        let rows = store.load_rules("t").await.unwrap();
        assert_eq!(rows[0].values, vec!["alice".to_string()]);
        assert_eq!(rows[0].id, "o/p1");
        assert_eq!(store.tables_with_rules("o/p1").await.unwrap(), vec!["t".to_string()]);
        assert!(store.tables_with_rules("o/p2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_client_id_rejected() {
        let store = MemoryStore::new();
        let app = Application {
            owner: "admin".into(),
            name: "a".into(),
            created_time: Utc::now(),
            display_name: String::new(),
            organization: "org".into(),
            client_id: "cid".into(),
            client_secret: "s".into(),
            redirect_uris: vec![],
            grant_types: vec![],
            expire_in_hours: 1,
            refresh_expire_in_hours: 1,
            cert: String::new(),
            providers: vec![],
        };
        store.add_application(app.clone()).await.unwrap();

        let mut other = app;
        other.name = "b".into();
        assert!(matches!(
            store.add_application(other).await,
            Err(StoreError::Conflict { .. })
        ));
    }
}

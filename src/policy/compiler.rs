use super::PolicyError;
use super::bootstrap::AUTHZ_ENFORCER_ID;
use super::enforcer::adapter_table;
use super::engine::definition_fields;
use super::registry::EnforcerRegistry;
use crate::store::{DEFAULT_RULE_TABLE, Permission, PolicyRule, PolicyStore, split_id};
use std::collections::HashSet;
use std::sync::Arc;

/// Schema-version key guarding the one-time permission rule migration
pub const PERMISSION_RULE_SCHEMA: &str = "permission_rule";

const LEGACY_PERMISSION_TOKEN: &str = "permission,";

/// Keeps adapter rule tables in step with Permission records. Every write regenerates the
/// permission's rows in full, then pushes the table into any cached engine reading it.
#[derive(Clone)]
pub struct PolicyCompiler {
    store: Arc<dyn PolicyStore>,
    registry: Arc<EnforcerRegistry>,
}

fn dedup(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| !item.is_empty() && seen.insert(item.clone()))
        .collect()
}

fn validate(permission: &Permission) -> Result<(), PolicyError> {
    if permission.owner.is_empty() || permission.name.is_empty() {
        return Err(PolicyError::BadRequest(
            "permission owner and name must not be empty".to_string(),
        ));
    }
    if permission.name.contains('/') {
        return Err(PolicyError::BadRequest(format!(
            "permission name '{}' must not contain '/'",
            permission.name
        )));
    }
    Ok(())
}

impl PolicyCompiler {
    pub fn new(store: Arc<dyn PolicyStore>, registry: Arc<EnforcerRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &Arc<dyn PolicyStore> {
        &self.store
    }

    /// Table the authorization middleware reads its rules from
    async fn authz_table(&self) -> Result<Option<String>, PolicyError> {
        let Some(enforcer) = self.store.get_enforcer(AUTHZ_ENFORCER_ID).await? else {
            return Ok(None);
        };
        let adapter = self.store.get_adapter(&enforcer.adapter).await?;
        Ok(adapter.map(|a| adapter_table(&a).to_string()))
    }

    /// Table the permission's rules go to. Only registered adapters are accepted, and
    /// never the one backing the authorization rules.
    async fn table_for(&self, permission: &Permission) -> Result<String, PolicyError> {
        let table = if permission.adapter.is_empty() {
            DEFAULT_RULE_TABLE.to_string()
        } else {
            if split_id(&permission.adapter).is_none() {
                return Err(PolicyError::BadRequest(format!(
                    "adapter '{}' is not an owner/name id",
                    permission.adapter
                )));
            }
            let adapter = self
                .store
                .get_adapter(&permission.adapter)
                .await?
                .ok_or_else(|| PolicyError::not_found("adapter", &permission.adapter))?;
            adapter_table(&adapter).to_string()
        };
        if self.authz_table().await?.as_deref() == Some(table.as_str()) {
            tracing::warn!(
                "refused permission {} targeting the authorization rule table",
                permission.get_id()
            );
            return Err(PolicyError::BadRequest(format!(
                "permission {} cannot write to the authorization rule table",
                permission.get_id()
            )));
        }
        Ok(table)
    }

    /// Column layout for compiled rows, taken from the bound model's policy definition
    async fn layout_for(&self, permission: &Permission) -> Result<Vec<String>, PolicyError> {
        let fallback = || {
            let mut layout = vec!["sub".to_string()];
            if !permission.domains.is_empty() {
                layout.push("dom".to_string());
            }
            layout.extend(["obj", "act", "eft"].map(String::from));
            layout
        };
        if permission.model.is_empty() {
            return Ok(fallback());
        }
        let Some(model) = self.store.get_model(&permission.model).await? else {
            return Ok(fallback());
        };
        match definition_fields(&model.model_text, "p") {
            Some(layout) if !layout.is_empty() => {
                let denies =
                    !permission.effect.is_empty() && !permission.effect.eq_ignore_ascii_case("allow");
                if denies && !layout.iter().any(|f| f == "eft") {
                    tracing::warn!(
                        "model {} has no p.eft, permission {} is compiled as allow",
                        permission.model,
                        permission.get_id()
                    );
                }
                Ok(layout)
            }
            _ => {
                tracing::warn!(
                    "model {} for permission {} has no policy definition, using the default layout",
                    permission.model,
                    permission.get_id()
                );
                Ok(fallback())
            }
        }
    }

    /// Expands (Users ∪ Roles) × Domains × Resources × Actions into rule rows
    pub async fn compile(&self, permission: &Permission) -> Result<Vec<PolicyRule>, PolicyError> {
        if !permission.is_enabled {
            return Ok(Vec::new());
        }
        let layout = self.layout_for(permission).await?;
        let id = permission.get_id();

        let subjects = dedup(permission.users.iter().chain(&permission.roles).cloned());
        let domains = if permission.domains.is_empty() {
            vec![String::new()]
        } else {
            dedup(permission.domains.iter().cloned())
        };
        let resources = dedup(permission.resources.iter().cloned());
        let actions = dedup(permission.actions.iter().map(|a| a.to_lowercase()));
        let effect = if permission.effect.is_empty() {
            "allow".to_string()
        } else {
            permission.effect.to_lowercase()
        };

        let mut rules = Vec::new();
        for subject in &subjects {
            for domain in &domains {
                for resource in &resources {
                    for action in &actions {
                        let values = layout
                            .iter()
                            .take(PolicyRule::MAX_VALUES)
                            .map(|field| match field.as_str() {
                                "sub" => subject.clone(),
                                "dom" => domain.clone(),
                                "obj" => resource.clone(),
                                "act" => action.clone(),
                                "eft" => effect.clone(),
                                _ => String::new(),
                            })
                            .collect();
                        rules.push(PolicyRule::new("p", values, &id));
                    }
                }
            }
        }
        Ok(rules)
    }

    async fn write_rules(&self, table: &str, permission: &Permission) -> Result<(), PolicyError> {
        let rules = self.compile(permission).await?;
        tracing::info!(
            "compiled permission {} into {} rule(s) in table {}",
            permission.get_id(),
            rules.len(),
            table
        );
        self.store.ensure_table(table).await?;
        self.store
            .replace_rules(table, &permission.get_id(), rules)
            .await?;
        Ok(())
    }

    /// Drops a dedicated table once nothing references it any more
    async fn drop_if_unused(&self, table: &str) -> Result<(), PolicyError> {
        if table != DEFAULT_RULE_TABLE && self.store.is_table_empty(table).await? {
            self.store.drop_table(table).await?;
            tracing::info!("dropped empty rule table {}", table);
        }
        Ok(())
    }

    pub async fn add_permission(&self, permission: Permission) -> Result<bool, PolicyError> {
        validate(&permission)?;
        // resolve the target first so a bad adapter leaves nothing behind
        let table = self.table_for(&permission).await?;
        self.store.add_permission(permission.clone()).await?;

        self.write_rules(&table, &permission).await?;
        self.registry.reload_table(&table).await?;
        Ok(true)
    }

    /// Old rows are found by the permission id they carry, so a renamed or removed
    /// adapter never strands them.
    pub async fn update_permission(
        &self,
        id: &str,
        permission: Permission,
    ) -> Result<bool, PolicyError> {
        validate(&permission)?;
        let Some(old) = self.store.get_permission(id).await? else {
            return Ok(false);
        };
        let table = self.table_for(&permission).await?;
        let old_id = old.get_id();
        let old_tables = self.store.tables_with_rules(&old_id).await?;

        if !self.store.update_permission(id, permission.clone()).await? {
            return Ok(false);
        }

        let renamed = old_id != permission.get_id();
        for old_table in &old_tables {
            if renamed || *old_table != table {
                let removed = self.store.remove_rules(old_table, &old_id).await?;
                tracing::debug!("removed {} stale rule(s) of {} from {}", removed, old_id, old_table);
            }
        }
        self.write_rules(&table, &permission).await?;
        for old_table in old_tables.iter().filter(|t| **t != table) {
            self.drop_if_unused(old_table).await?;
            self.registry.reload_table(old_table).await?;
        }
        self.registry.reload_table(&table).await?;
        Ok(true)
    }

    pub async fn delete_permission(&self, id: &str) -> Result<bool, PolicyError> {
        let Some(permission) = self.store.get_permission(id).await? else {
            return Ok(false);
        };
        let permission_id = permission.get_id();
        let tables = self.store.tables_with_rules(&permission_id).await?;
        if !self.store.delete_permission(id).await? {
            return Ok(false);
        }

        for table in &tables {
            self.store.remove_rules(table, &permission_id).await?;
            self.drop_if_unused(table).await?;
            self.registry.reload_table(table).await?;
        }
        tracing::info!("deleted permission {}", id);
        Ok(true)
    }

    /// Rows currently stored for one permission, across every table holding them
    pub async fn get_permission_rules(&self, id: &str) -> Result<Vec<PolicyRule>, PolicyError> {
        let permission = self
            .store
            .get_permission(id)
            .await?
            .ok_or_else(|| PolicyError::not_found("permission", id))?;
        let permission_id = permission.get_id();
        let mut rules = Vec::new();
        for table in self.store.tables_with_rules(&permission_id).await? {
            rules.extend(
                self.store
                    .load_rules(&table)
                    .await?
                    .into_iter()
                    .filter(|rule| rule.id == permission_id),
            );
        }
        Ok(rules)
    }

    /// One-time repair of rule tables written when the permission id was stored as the
    /// first rule column. Models whose text still declares a `permission` field lose it,
    /// and rows whose first value is a permission id are shifted left, with that id moved
    /// to the rule's tag. Returns whether the migration ran.
    pub async fn migrate_permission_rules(&self) -> Result<bool, PolicyError> {
        if self.store.schema_version(PERMISSION_RULE_SCHEMA).await? >= 1 {
            return Ok(false);
        }

        let mut hit = false;
        for mut model in self.store.get_models().await? {
            if !model.model_text.contains("permission") {
                continue;
            }
            let id = model.get_id();
            model.model_text = model.model_text.replace(LEGACY_PERMISSION_TOKEN, "");
            self.registry.update_model(&id, model).await?;
            hit = true;
        }

        if hit {
            let ids: HashSet<String> = self
                .store
                .get_permissions("")
                .await?
                .iter()
                .map(Permission::get_id)
                .collect();
            let shift = move |rule: &mut PolicyRule| {
                let is_legacy = rule.values.first().is_some_and(|v| ids.contains(v));
                if is_legacy {
                    rule.id = rule.values.remove(0);
                }
                is_legacy
            };
            let shifted = self
                .store
                .rewrite_rules(DEFAULT_RULE_TABLE, &shift)
                .await?;
            self.registry.reload_table(DEFAULT_RULE_TABLE).await?;
            tracing::info!("migrated {} legacy permission rule(s)", shifted);
        }

        self.store.set_schema_version(PERMISSION_RULE_SCHEMA, 1).await?;
        Ok(hit)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::{Adapter, MemoryStore, Model};
    use chrono::Utc;

    pub(crate) fn permission(name: &str) -> Permission {
        Permission {
            owner: "org".into(),
            name: name.into(),
            created_time: Utc::now(),
            display_name: String::new(),
            users: vec!["org/alice".into()],
            roles: vec![],
            domains: vec![],
            model: String::new(),
            adapter: String::new(),
            resource_type: "Application".into(),
            resources: vec!["app-1".into(), "app-2".into()],
            actions: vec!["Read".into(), "Write".into()],
            effect: "Allow".into(),
            is_enabled: true,
        }
    }

    fn compiler() -> (PolicyCompiler, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(EnforcerRegistry::new(store.clone()));
        (PolicyCompiler::new(store.clone(), registry), store)
    }

    fn row(rule: &PolicyRule) -> Vec<&str> {
        rule.values.iter().map(String::as_str).collect()
    }

    #[tokio::test]
    async fn test_add_compiles_cross_product() {
        let (compiler, _) = compiler();
        let mut p = permission("p1");
        p.roles = vec!["org/editors".into()];
        compiler.add_permission(p).await.unwrap();

        let rules = compiler.get_permission_rules("org/p1").await.unwrap();
        // 2 subjects x 2 resources x 2 actions
        assert_eq!(rules.len(), 8);
        assert!(rules.iter().all(|r| r.ptype == "p" && r.id == "org/p1"));
        assert!(
            rules
                .iter()
                .any(|r| row(r) == ["org/editors", "app-2", "write", "allow"])
        );
    }

    #[tokio::test]
    async fn test_update_leaves_only_new_rows() {
        let (compiler, _) = compiler();
        compiler.add_permission(permission("p1")).await.unwrap();
        compiler.add_permission(permission("p2")).await.unwrap();

        let mut changed = permission("p1");
        changed.resources = vec!["app-9".into()];
        changed.actions = vec!["Admin".into()];
        changed.effect = "Deny".into();
        assert!(compiler.update_permission("org/p1", changed).await.unwrap());

        let rules = compiler.get_permission_rules("org/p1").await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(row(&rules[0]), ["org/alice", "app-9", "admin", "deny"]);
        // other permissions untouched
        assert_eq!(compiler.get_permission_rules("org/p2").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_disabled_permission_has_no_rows() {
        let (compiler, _) = compiler();
        compiler.add_permission(permission("p1")).await.unwrap();
        let mut disabled = permission("p1");
        disabled.is_enabled = false;
        compiler.update_permission("org/p1", disabled).await.unwrap();
        assert!(compiler.get_permission_rules("org/p1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_domains_and_model_layout() {
        let (compiler, store) = compiler();
        store
            .add_model(Model {
                owner: "org".into(),
                name: "rbac-dom".into(),
                created_time: Utc::now(),
                display_name: String::new(),
                model_text: "[request_definition]\nr = sub, dom, obj, act\n\
                    [policy_definition]\np = sub, dom, obj, act, eft\n\
                    [policy_effect]\ne = some(where (p.eft == allow))\n\
                    [matchers]\nm = r.sub == p.sub && r.dom == p.dom && r.obj == p.obj && r.act == p.act\n"
                    .into(),
                is_enabled: true,
            })
            .await
            .unwrap();

        let mut p = permission("p1");
        p.model = "org/rbac-dom".into();
        p.domains = vec!["tenant-a".into(), "tenant-b".into()];
        p.resources = vec!["app-1".into()];
        p.actions = vec!["Read".into()];
        compiler.add_permission(p).await.unwrap();

        let rules = compiler.get_permission_rules("org/p1").await.unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(row(&rules[0]), ["org/alice", "tenant-a", "app-1", "read", "allow"]);
    }

    #[tokio::test]
    async fn test_dedicated_table_dropped_when_empty() {
        let (compiler, store) = compiler();
        store.add_adapter(dedicated_adapter("dedicated")).await.unwrap();

        let mut p = permission("p1");
        p.adapter = "org/dedicated".into();
        compiler.add_permission(p).await.unwrap();
        assert!(!store.is_table_empty("dedicated_rule").await.unwrap());

        // moving the permission to the shared table empties and drops the dedicated one
        assert!(
            compiler
                .update_permission("org/p1", permission("p1"))
                .await
                .unwrap()
        );
        assert!(store.load_rules("dedicated_rule").await.unwrap().is_empty());
        assert_eq!(
            compiler.get_permission_rules("org/p1").await.unwrap().len(),
            4
        );

        assert!(compiler.delete_permission("org/p1").await.unwrap());
        assert!(store.is_table_empty(DEFAULT_RULE_TABLE).await.unwrap());
        assert!(!compiler.delete_permission("org/p1").await.unwrap());
    }

    fn dedicated_adapter(name: &str) -> Adapter {
        Adapter {
            owner: "org".into(),
            name: name.into(),
            created_time: Utc::now(),
            adapter_type: "Database".into(),
            database_type: String::new(),
            database: String::new(),
            table: "dedicated_rule".into(),
            is_enabled: true,
        }
    }

    #[tokio::test]
    async fn test_rules_survive_adapter_rename() {
        let (compiler, store) = compiler();
        store.add_adapter(dedicated_adapter("dedicated")).await.unwrap();
        let mut p = permission("p1");
        p.adapter = "org/dedicated".into();
        compiler.add_permission(p).await.unwrap();

        assert!(
            compiler
                .registry
                .update_adapter("org/dedicated", dedicated_adapter("moved"))
                .await
                .unwrap()
        );

        // the old adapter id no longer resolves, the stored rows are still found
        assert_eq!(compiler.get_permission_rules("org/p1").await.unwrap().len(), 4);
        let mut stale = permission("p1");
        stale.adapter = "org/dedicated".into();
        assert!(matches!(
            compiler.update_permission("org/p1", stale).await,
            Err(PolicyError::NotFound { kind: "adapter", .. })
        ));
        assert!(store.get_permission("org/p1").await.unwrap().is_some());

        let mut moved = permission("p1");
        moved.adapter = "org/moved".into();
        moved.actions = vec!["Read".into()];
        assert!(compiler.update_permission("org/p1", moved).await.unwrap());
        assert_eq!(store.load_rules("dedicated_rule").await.unwrap().len(), 2);

        compiler
            .registry
            .update_adapter("org/moved", dedicated_adapter("renamed"))
            .await
            .unwrap();
        assert!(compiler.delete_permission("org/p1").await.unwrap());
        assert!(store.get_permission("org/p1").await.unwrap().is_none());
        assert!(store.load_rules("dedicated_rule").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_adapter_must_be_registered() {
        let (compiler, store) = compiler();
        let mut p = permission("p1");
        p.adapter = "casbin_authz_rule".into();
        assert!(matches!(
            compiler.add_permission(p).await,
            Err(PolicyError::BadRequest(_))
        ));
        assert!(store.get_permission("org/p1").await.unwrap().is_none());
        assert!(store.load_rules("casbin_authz_rule").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_adapter_rejected_before_write() {
        let (compiler, store) = compiler();
        let mut p = permission("p1");
        p.adapter = "org/missing".into();
        assert!(matches!(
            compiler.add_permission(p).await,
            Err(PolicyError::NotFound { kind: "adapter", .. })
        ));
        assert!(store.get_permission("org/p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_migration_runs_once() {
        let (compiler, store) = compiler();
        store
            .add_model(Model {
                owner: "org".into(),
                name: "legacy".into(),
                created_time: Utc::now(),
                display_name: String::new(),
                model_text: "[request_definition]\nr = sub, obj, act\n\
                    [policy_definition]\np = permission, sub, obj, act\n\
                    [policy_effect]\ne = some(where (p.eft == allow))\n\
                    [matchers]\nm = r.sub == p.sub && r.obj == p.obj && r.act == p.act\n"
                    .into(),
                is_enabled: true,
            })
            .await
            .unwrap();
        store.add_permission(permission("p1")).await.unwrap();
        store
            .add_rules(
                DEFAULT_RULE_TABLE,
                vec![
                    PolicyRule::new(
                        "p",
                        vec!["org/p1".into(), "org/alice".into(), "app-1".into(), "read".into()],
                        "",
                    ),
                    PolicyRule::new("p", vec!["bob".into(), "app-1".into(), "read".into()], ""),
                ],
            )
            .await
            .unwrap();

        assert!(compiler.migrate_permission_rules().await.unwrap());
        let model = store.get_model("org/legacy").await.unwrap().unwrap();
        assert!(!model.model_text.contains("permission"));

        let rules = store.load_rules(DEFAULT_RULE_TABLE).await.unwrap();
        assert_eq!(row(&rules[0]), ["org/alice", "app-1", "read"]);
        assert_eq!(rules[0].id, "org/p1");
        assert_eq!(row(&rules[1]), ["bob", "app-1", "read"]);

        assert!(!compiler.migrate_permission_rules().await.unwrap());
        assert_eq!(store.schema_version(PERMISSION_RULE_SCHEMA).await.unwrap(), 1);
    }
}

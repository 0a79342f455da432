use super::compiler::PolicyCompiler;
use crate::store::{
    Adapter, Application, Cert, Directory, EnforcerRecord, Model, Organization, Permission,
    PolicyRule, User,
};
use anyhow::{Context, Result};
use chrono::Utc;
use rand::Rng;
use uuid::Uuid;

pub const BUILT_IN_ORG: &str = "built-in";
pub const AUTHZ_ENFORCER_ID: &str = "built-in/authz-enforcer-built-in";
pub const PERMISSION_ENFORCER_ID: &str = "built-in/permission-enforcer-built-in";

const AUTHZ_TABLE: &str = "casbin_authz_rule";
const DEFAULT_ADMIN_PASSWORD: &str = "123";
const PERMISSION_TABLE: &str = "casbin_user_rule";

/// Request: who is calling, which route, which object (from `?id=owner/name`).
/// A signed-in caller may always read or update its own user object.
const AUTHZ_MODEL: &str = r#"
[request_definition]
r = subOwner, subName, method, urlPath, objOwner, objName

[policy_definition]
p = subOwner, subName, method, urlPath, objOwner, objName

[role_definition]
g = _, _

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = (r.subOwner == p.subOwner || p.subOwner == "*") && (r.subName == p.subName || p.subName == "*" || g(r.subName, p.subName) || r.subName != "anonymous" && p.subName == "!anonymous") && (r.method == p.method || p.method == "*") && (r.urlPath == p.urlPath || p.urlPath == "*") && (r.objOwner == p.objOwner || p.objOwner == "*") && (r.objName == p.objName || p.objName == "*") || (r.subName != "anonymous" && r.subOwner == r.objOwner && r.subName == r.objName && (r.urlPath == "/api/get-user" || r.urlPath == "/api/update-user"))
"#;

const PERMISSION_MODEL: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = r.sub == p.sub && r.obj == p.obj && r.act == p.act
"#;

/// Key material for the seeded signing certificate. Without a PEM pair an HMAC secret is generated.
#[derive(Debug, Clone, Default)]
pub struct CertKeys {
    pub public_pem: Option<String>,
    pub private_pem: Option<String>,
}

fn random_string(len: usize) -> String {
    const CHARSET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

fn built_in_cert(keys: &CertKeys) -> Cert {
    let (crypto_algorithm, bit_size, certificate, private_key) =
        match (&keys.public_pem, &keys.private_pem) {
            (Some(public), Some(private)) => ("RS256", 4096, public.clone(), private.clone()),
            _ => {
                tracing::warn!("no certificate key pair configured, generating an HS256 secret");
                ("HS256", 256, String::new(), random_string(48))
            }
        };
    Cert {
        owner: "admin".into(),
        name: "cert-built-in".into(),
        created_time: Utc::now(),
        display_name: "Built-in Cert".into(),
        scope: "JWT".into(),
        cert_type: "x509".into(),
        crypto_algorithm: crypto_algorithm.into(),
        bit_size,
        expire_in_years: 20,
        certificate,
        private_key,
    }
}

fn authz_rules() -> Vec<PolicyRule> {
    let row = |values: [&str; 6]| {
        PolicyRule::new("p", values.iter().map(|v| v.to_string()).collect(), "")
    };
    vec![
        row([BUILT_IN_ORG, "*", "*", "*", "*", "*"]),
        row(["*", "!anonymous", "*", "/login/oauth/code", "*", "*"]),
        row(["*", "!anonymous", "*", "/api/enforce", "*", "*"]),
    ]
}

async fn seed_directory(directory: &dyn Directory, keys: &CertKeys) -> Result<()> {
    if directory.get_organization("admin", BUILT_IN_ORG).await?.is_none() {
        directory
            .add_organization(Organization {
                owner: "admin".into(),
                name: BUILT_IN_ORG.into(),
                created_time: Utc::now(),
                display_name: "Built-in Organization".into(),
                website_url: "https://example.com".into(),
            })
            .await?;
    }

    if directory.get_user(BUILT_IN_ORG, "admin").await?.is_none() {
        directory
            .add_user(User {
                owner: BUILT_IN_ORG.into(),
                name: "admin".into(),
                id: Uuid::new_v4().to_string(),
                created_time: Utc::now(),
                display_name: "Admin".into(),
                password: DEFAULT_ADMIN_PASSWORD.into(),
                password_type: "plain".into(),
                email: "admin@example.com".into(),
                avatar: String::new(),
                tag: "staff".into(),
                is_admin: true,
                is_forbidden: false,
            })
            .await?;
    }

    if directory.get_application("admin", "app-built-in").await?.is_none() {
        let client_id = random_string(20);
        directory
            .add_application(Application {
                owner: "admin".into(),
                name: "app-built-in".into(),
                created_time: Utc::now(),
                display_name: "Warden".into(),
                organization: BUILT_IN_ORG.into(),
                client_id: client_id.clone(),
                client_secret: random_string(40),
                redirect_uris: vec![],
                grant_types: vec![
                    "authorization_code".into(),
                    "password".into(),
                    "refresh_token".into(),
                ],
                expire_in_hours: 168,
                refresh_expire_in_hours: 168,
                cert: "cert-built-in".into(),
                providers: vec![],
            })
            .await?;
        tracing::info!("seeded application admin/app-built-in with client_id {}", client_id);
    }

    if directory.get_cert("admin", "cert-built-in").await?.is_none() {
        directory.add_cert(built_in_cert(keys)).await?;
    }
    Ok(())
}

async fn seed_policy(compiler: &PolicyCompiler) -> Result<()> {
    let store = compiler.store();
    let now = Utc::now();

    for (name, display_name, text) in [
        ("authz-model-built-in", "Authz Model", AUTHZ_MODEL),
        ("permission-model-built-in", "Built-in Model", PERMISSION_MODEL),
    ] {
        if store.get_model(&format!("{}/{}", BUILT_IN_ORG, name)).await?.is_none() {
            store
                .add_model(Model {
                    owner: BUILT_IN_ORG.into(),
                    name: name.into(),
                    created_time: now,
                    display_name: display_name.into(),
                    model_text: text.trim_start().into(),
                    is_enabled: true,
                })
                .await?;
        }
    }

    for (name, table) in [
        ("authz-adapter-built-in", AUTHZ_TABLE),
        ("permission-adapter-built-in", PERMISSION_TABLE),
    ] {
        if store.get_adapter(&format!("{}/{}", BUILT_IN_ORG, name)).await?.is_none() {
            store
                .add_adapter(Adapter {
                    owner: BUILT_IN_ORG.into(),
                    name: name.into(),
                    created_time: now,
                    adapter_type: "Database".into(),
                    database_type: String::new(),
                    database: String::new(),
                    table: table.into(),
                    is_enabled: true,
                })
                .await?;
            store.ensure_table(table).await?;
        }
    }

    for (id, display_name, model, adapter) in [
        (AUTHZ_ENFORCER_ID, "Authz Enforcer", "authz-model-built-in", "authz-adapter-built-in"),
        (
            PERMISSION_ENFORCER_ID,
            "Permission Enforcer",
            "permission-model-built-in",
            "permission-adapter-built-in",
        ),
    ] {
        if store.get_enforcer(id).await?.is_some() {
            continue;
        }
        let name = id.trim_start_matches("built-in/");
        store
            .add_enforcer(EnforcerRecord {
                owner: BUILT_IN_ORG.into(),
                name: name.into(),
                created_time: now,
                display_name: display_name.into(),
                model: format!("{}/{}", BUILT_IN_ORG, model),
                adapter: format!("{}/{}", BUILT_IN_ORG, adapter),
                is_enabled: true,
            })
            .await?;
    }

    if store.is_table_empty(AUTHZ_TABLE).await? {
        store.add_rules(AUTHZ_TABLE, authz_rules()).await?;
    }

    if store.get_permission("built-in/permission-built-in").await?.is_none() {
        compiler
            .add_permission(Permission {
                owner: BUILT_IN_ORG.into(),
                name: "permission-built-in".into(),
                created_time: now,
                display_name: "Built-in Permission".into(),
                users: vec!["built-in/*".into()],
                roles: vec![],
                domains: vec![],
                model: format!("{}/permission-model-built-in", BUILT_IN_ORG),
                adapter: format!("{}/permission-adapter-built-in", BUILT_IN_ORG),
                resource_type: "Application".into(),
                resources: vec!["app-built-in".into()],
                actions: vec!["Read".into(), "Write".into(), "Admin".into()],
                effect: "Allow".into(),
                is_enabled: true,
            })
            .await
            .context("failed to compile the built-in permission")?;
    }
    Ok(())
}

/// Warns while built-in/admin still signs in with the seeded password
async fn check_default_admin_password(directory: &dyn Directory) -> Result<bool> {
    let in_use = directory
        .get_user(BUILT_IN_ORG, "admin")
        .await?
        .is_some_and(|admin| admin.check_password(DEFAULT_ADMIN_PASSWORD));
    if in_use {
        tracing::warn!(
            "built-in/admin still uses the default password, change it before exposing this server"
        );
    }
    Ok(in_use)
}

/// Seeds the built-in organization, admin user, application, certificate and policy
/// records on a fresh store. Does nothing once any organization exists.
/// Returns whether anything was seeded.
pub async fn init_built_in_data(
    directory: &dyn Directory,
    compiler: &PolicyCompiler,
    keys: &CertKeys,
) -> Result<bool> {
    if directory.has_organizations().await? {
        tracing::debug!("organizations already present, skipping built-in seeding");
        check_default_admin_password(directory).await?;
        return Ok(false);
    }

    seed_directory(directory, keys).await?;
    seed_policy(compiler).await?;
    tracing::info!("seeded built-in organization, application and policy records");
    check_default_admin_password(directory).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::EnforcerRegistry;
    use crate::store::{MemoryStore, PolicyStore};
    use std::sync::Arc;

    fn setup() -> (Arc<MemoryStore>, PolicyCompiler, Arc<EnforcerRegistry>) {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(EnforcerRegistry::new(store.clone()));
        let compiler = PolicyCompiler::new(store.clone(), registry.clone());
        (store, compiler, registry)
    }

    fn req(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    async fn allowed(registry: &EnforcerRegistry, values: &[&str]) -> bool {
        registry.enforce(AUTHZ_ENFORCER_ID, &req(values)).await.unwrap()
    }

    #[tokio::test]
    async fn test_seeds_once() {
        let (store, compiler, _) = setup();
        let keys = CertKeys::default();
        assert!(init_built_in_data(store.as_ref(), &compiler, &keys).await.unwrap());

        let cert = store.get_cert("admin", "cert-built-in").await.unwrap().unwrap();
        assert_eq!(cert.crypto_algorithm, "HS256");
        assert!(!cert.private_key.is_empty());
        let app = store.get_application("admin", "app-built-in").await.unwrap().unwrap();

        // a second run leaves everything alone
        assert!(!init_built_in_data(store.as_ref(), &compiler, &keys).await.unwrap());
        let again = store.get_application("admin", "app-built-in").await.unwrap().unwrap();
        assert_eq!(app.client_id, again.client_id);
        assert_eq!(store.load_rules(AUTHZ_TABLE).await.unwrap().len(), 3);
        assert_eq!(store.get_permissions("").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pem_pair_selects_rs256() {
        let (store, compiler, _) = setup();
        let keys = CertKeys {
            public_pem: Some("public".into()),
            private_pem: Some("private".into()),
        };
        init_built_in_data(store.as_ref(), &compiler, &keys).await.unwrap();
        let cert = store.get_cert("admin", "cert-built-in").await.unwrap().unwrap();
        assert_eq!(cert.crypto_algorithm, "RS256");
        assert_eq!(cert.private_key, "private");
    }

    #[tokio::test]
    async fn test_seeded_authz_rules() {
        let (store, compiler, registry) = setup();
        init_built_in_data(store.as_ref(), &compiler, &CertKeys::default())
            .await
            .unwrap();

        assert!(allowed(&registry, &["built-in", "admin", "POST", "/api/add-permission", "", ""]).await);
        assert!(allowed(&registry, &["acme", "bob", "POST", "/login/oauth/code", "", ""]).await);
        assert!(allowed(&registry, &["acme", "bob", "POST", "/api/enforce", "", ""]).await);
        assert!(!allowed(&registry, &["acme", "bob", "POST", "/api/add-permission", "", ""]).await);
        assert!(!allowed(&registry, &["anonymous", "anonymous", "POST", "/api/enforce", "", ""]).await);
        // a user may always act on its own user object, and only that
        assert!(allowed(&registry, &["acme", "bob", "GET", "/api/get-user", "acme", "bob"]).await);
        for route in ["/api/add-permission", "/api/update-model", "/api/get-tokens"] {
            assert!(!allowed(&registry, &["acme", "bob", "POST", route, "acme", "bob"]).await);
        }
        assert!(
            !allowed(
                &registry,
                &["anonymous", "anonymous", "GET", "/api/get-user", "anonymous", "anonymous"]
            )
            .await
        );
    }

    #[tokio::test]
    async fn test_authz_table_refuses_permissions() {
        let (store, compiler, registry) = setup();
        init_built_in_data(store.as_ref(), &compiler, &CertKeys::default())
            .await
            .unwrap();

        let permission = Permission {
            owner: "acme".into(),
            name: "everything".into(),
            created_time: Utc::now(),
            display_name: String::new(),
            users: vec!["*".into()],
            roles: vec![],
            domains: vec![],
            model: String::new(),
            adapter: "built-in/authz-adapter-built-in".into(),
            resource_type: String::new(),
            resources: vec!["*".into()],
            actions: vec!["*".into()],
            effect: "*".into(),
            is_enabled: true,
        };
        assert!(compiler.add_permission(permission.clone()).await.is_err());
        let mut raw = permission;
        raw.adapter = AUTHZ_TABLE.into();
        assert!(compiler.add_permission(raw).await.is_err());

        assert_eq!(store.load_rules(AUTHZ_TABLE).await.unwrap().len(), 3);
        assert!(store.get_permissions("acme").await.unwrap().is_empty());
        assert!(!allowed(&registry, &["anonymous", "anonymous", "POST", "/api/add-permission", "", ""]).await);
    }

    #[tokio::test]
    async fn test_default_password_flagged() {
        let (store, compiler, _) = setup();
        init_built_in_data(store.as_ref(), &compiler, &CertKeys::default())
            .await
            .unwrap();
        assert!(check_default_admin_password(store.as_ref()).await.unwrap());

        let changed = MemoryStore::new();
        let mut admin = store.get_user(BUILT_IN_ORG, "admin").await.unwrap().unwrap();
        admin.password = "a-real-password".into();
        changed.add_user(admin).await.unwrap();
        assert!(!check_default_admin_password(&changed).await.unwrap());
    }

    #[tokio::test]
    async fn test_built_in_permission_compiled() {
        let (store, compiler, registry) = setup();
        init_built_in_data(store.as_ref(), &compiler, &CertKeys::default())
            .await
            .unwrap();

        let rules = store.load_rules(PERMISSION_TABLE).await.unwrap();
        assert_eq!(rules.len(), 3);
        assert!(rules.iter().all(|r| r.id == "built-in/permission-built-in"));
        assert!(
            registry
                .enforce(
                    PERMISSION_ENFORCER_ID,
                    &req(&["built-in/*", "app-built-in", "admin"])
                )
                .await
                .unwrap()
        );
    }
}

use super::PolicyError;
use super::engine::Engine;
use super::enforcer::Enforcer;
use crate::store::{Adapter, EnforcerRecord, Model, PolicyStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

type Slot = Arc<AsyncMutex<Option<Enforcer>>>;

/// Process-wide cache of initialised enforcers keyed by enforcer id.
///
/// The map lock is only held to find or create a slot; construction happens under the
/// slot's own lock, so concurrent first calls for one id build a single engine while
/// unrelated ids proceed in parallel.
pub struct EnforcerRegistry {
    store: Arc<dyn PolicyStore>,
    slots: Mutex<HashMap<String, Slot>>,
    constructions: AtomicUsize,
}

impl EnforcerRegistry {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self {
            store,
            slots: Mutex::new(HashMap::new()),
            constructions: AtomicUsize::new(0),
        }
    }

    /// How many engines have been built since startup
    #[cfg(test)]
    pub fn construction_count(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    fn slot(&self, id: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.entry(id.to_string()).or_default().clone()
    }

    fn snapshot(&self) -> Vec<(String, Slot)> {
        let slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Removes the slot for `id` if it is still the one `slot` points at
    fn forget(&self, id: &str, slot: &Slot) {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        if slots.get(id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(id);
        }
    }

    #[cfg(test)]
    pub fn slot_count(&self) -> usize {
        self.slots.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    async fn construct(&self, id: &str) -> Result<Enforcer, PolicyError> {
        let record = self
            .store
            .get_enforcer(id)
            .await?
            .ok_or_else(|| PolicyError::not_found("enforcer", id))?;
        let mut enforcer = Enforcer::new(record);
        if enforcer.init(&self.store).await? {
            self.constructions.fetch_add(1, Ordering::SeqCst);
        }
        Ok(enforcer)
    }

    /// Returns the ready engine for `id`, building it on first use. A failed build
    /// leaves no slot behind.
    pub async fn get_inited_enforcer(&self, id: &str) -> Result<Arc<Engine>, PolicyError> {
        let slot = self.slot(id);
        let mut guard = slot.lock().await;

        if let Some(engine) = guard.as_ref().and_then(Enforcer::engine) {
            return Ok(engine.clone());
        }

        let built = self.construct(id).await.and_then(|enforcer| {
            let engine = enforcer.engine().cloned().ok_or_else(|| PolicyError::Init {
                id: id.to_string(),
                reason: "engine missing after initialisation".to_string(),
            })?;
            Ok((enforcer, engine))
        });
        match built {
            Ok((enforcer, engine)) => {
                *guard = Some(enforcer);
                Ok(engine)
            }
            Err(e) => {
                self.forget(id, &slot);
                Err(e)
            }
        }
    }

    pub async fn enforce(&self, id: &str, request: &[String]) -> Result<bool, PolicyError> {
        self.get_inited_enforcer(id).await?.enforce(request).await
    }

    /// Drops the cached enforcer `id` and any cached enforcer bound to model/adapter `id`
    pub async fn invalidate(&self, id: &str) -> usize {
        let mut stale = Vec::new();
        for (key, slot) in self.snapshot() {
            let guard = slot.lock().await;
            let depends = guard.as_ref().is_some_and(|e| e.depends_on(id));
            if key == id || depends {
                stale.push(key);
            }
        }
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        for key in &stale {
            slots.remove(key);
        }
        if !stale.is_empty() {
            tracing::info!("invalidated cached enforcers {:?} after change to {}", stale, id);
        }
        stale.len()
    }

    /// Pushes the current contents of `table` into every cached engine reading from it.
    /// Engines are reloaded in place, never rebuilt.
    pub async fn reload_table(&self, table: &str) -> Result<usize, PolicyError> {
        let mut engines = Vec::new();
        for (_, slot) in self.snapshot() {
            let guard = slot.lock().await;
            let bound = guard
                .as_ref()
                .and_then(Enforcer::engine)
                .filter(|engine| engine.table() == table);
            if let Some(engine) = bound {
                engines.push(engine.clone());
            }
        }
        for engine in &engines {
            engine.reload().await?;
        }
        tracing::debug!("reloaded {} engine(s) from table {}", engines.len(), table);
        Ok(engines.len())
    }

    pub async fn update_model(&self, id: &str, model: Model) -> Result<bool, PolicyError> {
        let new_id = model.get_id();
        let updated = self.store.update_model(id, model).await?;
        if updated {
            self.invalidate(id).await;
            if new_id != id {
                self.invalidate(&new_id).await;
            }
        }
        Ok(updated)
    }

    pub async fn update_adapter(&self, id: &str, adapter: Adapter) -> Result<bool, PolicyError> {
        let new_id = adapter.get_id();
        let updated = self.store.update_adapter(id, adapter).await?;
        if updated {
            self.invalidate(id).await;
            if new_id != id {
                self.invalidate(&new_id).await;
            }
        }
        Ok(updated)
    }

    pub async fn update_enforcer(
        &self,
        id: &str,
        enforcer: EnforcerRecord,
    ) -> Result<bool, PolicyError> {
        let new_id = enforcer.get_id();
        let updated = self.store.update_enforcer(id, enforcer).await?;
        if updated {
            self.invalidate(id).await;
            if new_id != id {
                self.invalidate(&new_id).await;
            }
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::enforcer::tests::{ACL, record, seed};
    use crate::store::{MemoryStore, PolicyRule};
    use chrono::Utc;

    async fn registry() -> (Arc<EnforcerRegistry>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        seed(&store, ACL).await;
        store.add_enforcer(record()).await.unwrap();
        store
            .add_rules(
                "acl_rule",
                vec![PolicyRule::new(
                    "p",
                    vec!["alice".into(), "doc".into(), "read".into()],
                    "",
                )],
            )
            .await
            .unwrap();
        (Arc::new(EnforcerRegistry::new(store.clone())), store)
    }

    fn req(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_engine_built_once() {
        let (registry, _) = registry().await;
        let a = registry.get_inited_enforcer("org/enf").await.unwrap();
        let b = registry.get_inited_enforcer("org/enf").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.construction_count(), 1);
        assert!(
            registry
                .enforce("org/enf", &req(&["alice", "doc", "read"]))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_concurrent_first_access_converges() {
        let (registry, _) = registry().await;
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_inited_enforcer("org/enf").await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(registry.construction_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_enforcer_is_not_found() {
        let (registry, _) = registry().await;
        let err = registry.get_inited_enforcer("org/nope").await.unwrap_err();
        assert!(matches!(err, PolicyError::NotFound { kind: "enforcer", .. }));
        assert_eq!(registry.construction_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_lookups_leave_no_slots() {
        let (registry, store) = registry().await;
        for i in 0..100 {
            let id = format!("org/missing-{}", i);
            assert!(registry.enforce(&id, &req(&["a", "b", "c"])).await.is_err());
        }
        assert_eq!(registry.slot_count(), 0);

        // a record whose model is gone fails init and is not cached either
        let mut broken = record();
        broken.name = "broken".into();
        broken.model = "org/gone".into();
        store.add_enforcer(broken).await.unwrap();
        assert!(registry.get_inited_enforcer("org/broken").await.is_err());
        assert_eq!(registry.slot_count(), 0);

        registry.get_inited_enforcer("org/enf").await.unwrap();
        assert_eq!(registry.slot_count(), 1);
    }

    #[tokio::test]
    async fn test_reload_keeps_engine_identity() {
        let (registry, store) = registry().await;
        let engine = registry.get_inited_enforcer("org/enf").await.unwrap();

        store
            .add_rules(
                "acl_rule",
                vec![PolicyRule::new(
                    "p",
                    vec!["bob".into(), "doc".into(), "read".into()],
                    "",
                )],
            )
            .await
            .unwrap();
        assert_eq!(registry.reload_table("acl_rule").await.unwrap(), 1);
        assert_eq!(registry.reload_table("other").await.unwrap(), 0);

        let again = registry.get_inited_enforcer("org/enf").await.unwrap();
        assert!(Arc::ptr_eq(&engine, &again));
        assert_eq!(registry.construction_count(), 1);
        assert!(engine.enforce(&req(&["bob", "doc", "read"])).await.unwrap());
    }

    #[tokio::test]
    async fn test_model_update_invalidates() {
        let (registry, store) = registry().await;
        registry.get_inited_enforcer("org/enf").await.unwrap();

        let mut model = store.get_model("org/model").await.unwrap().unwrap();
        model.model_text = ACL.replace("r.act == p.act", "true");
        model.created_time = Utc::now();
        assert!(registry.update_model("org/model", model).await.unwrap());

        registry.get_inited_enforcer("org/enf").await.unwrap();
        assert_eq!(registry.construction_count(), 2);
        assert!(
            registry
                .enforce("org/enf", &req(&["alice", "doc", "write"]))
                .await
                .unwrap()
        );
    }
}

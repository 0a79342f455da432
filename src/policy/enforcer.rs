use super::PolicyError;
use super::engine::Engine;
use crate::store::{Adapter, DEFAULT_RULE_TABLE, EnforcerRecord, PolicyStore};
use std::sync::Arc;

/// Rule table an adapter points at; adapters without one share the default table
pub fn adapter_table(adapter: &Adapter) -> &str {
    if adapter.table.is_empty() {
        DEFAULT_RULE_TABLE
    } else {
        &adapter.table
    }
}

/// An enforcer record together with its runtime engine, which stays `None` until
/// [`Enforcer::init`] has fully succeeded.
#[derive(Debug)]
pub struct Enforcer {
    pub record: EnforcerRecord,
    engine: Option<Arc<Engine>>,
}

impl Enforcer {
    pub fn new(record: EnforcerRecord) -> Self {
        Self {
            record,
            engine: None,
        }
    }

    #[cfg(test)]
    pub fn is_initialized(&self) -> bool {
        self.engine.is_some()
    }

    pub fn engine(&self) -> Option<&Arc<Engine>> {
        self.engine.as_ref()
    }

    pub fn depends_on(&self, id: &str) -> bool {
        self.record.model == id || self.record.adapter == id
    }

    /// Builds the engine unless one is already attached. Model and adapter are each
    /// resolved first; nothing is attached if any step fails. Returns whether a new
    /// engine was constructed.
    pub async fn init(&mut self, store: &Arc<dyn PolicyStore>) -> Result<bool, PolicyError> {
        if self.engine.is_some() {
            return Ok(false);
        }
        let id = self.record.get_id();
        for (kind, value) in [("model", &self.record.model), ("adapter", &self.record.adapter)] {
            if value.is_empty() {
                return Err(PolicyError::Init {
                    id: id.clone(),
                    reason: format!("the {} for enforcer: {} should not be empty", kind, id),
                });
            }
        }

        let model = store
            .get_model(&self.record.model)
            .await?
            .ok_or_else(|| PolicyError::not_found("model", &self.record.model))?;
        let adapter = store
            .get_adapter(&self.record.adapter)
            .await?
            .ok_or_else(|| PolicyError::not_found("adapter", &self.record.adapter))?;
        let table = adapter_table(&adapter);
        store.ensure_table(table).await.map_err(|e| PolicyError::Init {
            id: id.clone(),
            reason: format!("adapter {}: {}", self.record.adapter, e),
        })?;

        let engine = Engine::build(&model.model_text, store.clone(), table)
            .await
            .map_err(|e| PolicyError::Init {
                id: id.clone(),
                reason: format!("model {}: {}", self.record.model, e),
            })?;
        tracing::info!(
            "built engine for enforcer {} (model {}, table {}, {} rules)",
            id,
            self.record.model,
            table,
            engine.policy_count().await
        );
        self.engine = Some(Arc::new(engine));
        Ok(true)
    }
}

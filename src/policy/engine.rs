use super::PolicyError;
use crate::store::{PolicyRule, PolicyStore, StoreError};
use async_trait::async_trait;
use casbin::error::AdapterError;
use casbin::{Adapter, CoreApi, DefaultModel, Filter, MgmtApi, Model};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

const REQUIRED_SECTIONS: [(&str, &str); 4] = [
    ("r", "request_definition"),
    ("p", "policy_definition"),
    ("e", "policy_effect"),
    ("m", "matchers"),
];

/// Effects the evaluator knows how to combine
const SUPPORTED_EFFECTS: [&str; 4] = [
    "some(where(p.eft==allow))",
    "!some(where(p.eft==deny))",
    "some(where(p.eft==allow))&&!some(where(p.eft==deny))",
    "priority(p.eft)||deny",
];

/// Value of the `key = ...` definition line in model text
fn definition<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    text.lines().find_map(|line| {
        let (k, v) = line.trim().split_once('=')?;
        (k.trim() == key).then(|| v.trim())
    })
}

/// Field names of a request or policy definition (`r`, `p`) in model text
pub fn definition_fields(text: &str, key: &str) -> Option<Vec<String>> {
    definition(text, key).map(|value| {
        value
            .split(',')
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect()
    })
}

/// Parses model text and rejects models an enforcer could not run.
pub async fn parse_model(text: &str) -> Result<DefaultModel, PolicyError> {
    let model = DefaultModel::from_str(text)
        .await
        .map_err(|e| PolicyError::InvalidModel(e.to_string()))?;
    for (key, section) in REQUIRED_SECTIONS {
        if !model.get_model().contains_key(key) {
            return Err(PolicyError::InvalidModel(format!("missing [{}]", section)));
        }
    }
    let effect: String = definition(text, "e")
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if !SUPPORTED_EFFECTS.contains(&effect.as_str()) {
        return Err(PolicyError::InvalidModel(format!(
            "unsupported policy effect '{}'",
            definition(text, "e").unwrap_or_default()
        )));
    }
    Ok(model)
}

fn load_rule(model: &mut dyn Model, rule: PolicyRule) {
    let sec = if rule.ptype.starts_with('g') { "g" } else { "p" };
    model.add_policy(sec, &rule.ptype, rule.values);
}

fn adapter_error(e: StoreError) -> casbin::Error {
    AdapterError(Box::new(e)).into()
}

/// casbin adapter over one rule table of a [`PolicyStore`].
/// Rows are owned by permissions, so every write through casbin is refused.
pub struct RuleTableAdapter {
    store: Arc<dyn PolicyStore>,
    table: String,
    filtered: bool,
}

impl RuleTableAdapter {
    pub fn new(store: Arc<dyn PolicyStore>, table: &str) -> Self {
        Self {
            store,
            table: table.to_string(),
            filtered: false,
        }
    }

    fn read_only(&self) -> casbin::Error {
        adapter_error(StoreError::Backend(format!(
            "rule table {} is written through permissions only",
            self.table
        )))
    }
}

#[async_trait]
impl Adapter for RuleTableAdapter {
    async fn load_policy(&mut self, m: &mut dyn Model) -> casbin::Result<()> {
        let rules = self.store.load_rules(&self.table).await.map_err(adapter_error)?;
        for rule in rules {
            load_rule(m, rule);
        }
        self.filtered = false;
        Ok(())
    }

    async fn load_filtered_policy<'a>(
        &mut self,
        m: &mut dyn Model,
        f: Filter<'a>,
    ) -> casbin::Result<()> {
        let rules = self.store.load_rules(&self.table).await.map_err(adapter_error)?;
        for rule in rules {
            let wanted = if rule.ptype.starts_with('g') { &f.g } else { &f.p };
            let keep = wanted
                .iter()
                .zip(&rule.values)
                .all(|(w, v)| w.is_empty() || *w == v.as_str());
            if keep {
                load_rule(m, rule);
            }
        }
        self.filtered = true;
        Ok(())
    }

    async fn save_policy(&mut self, _m: &mut dyn Model) -> casbin::Result<()> {
        Err(self.read_only())
    }

    async fn clear_policy(&mut self) -> casbin::Result<()> {
        Err(self.read_only())
    }

    fn is_filtered(&self) -> bool {
        self.filtered
    }

    async fn add_policy(&mut self, _sec: &str, _ptype: &str, _rule: Vec<String>) -> casbin::Result<bool> {
        Err(self.read_only())
    }

    async fn add_policies(
        &mut self,
        _sec: &str,
        _ptype: &str,
        _rules: Vec<Vec<String>>,
    ) -> casbin::Result<bool> {
        Err(self.read_only())
    }

    async fn remove_policy(
        &mut self,
        _sec: &str,
        _ptype: &str,
        _rule: Vec<String>,
    ) -> casbin::Result<bool> {
        Err(self.read_only())
    }

    async fn remove_policies(
        &mut self,
        _sec: &str,
        _ptype: &str,
        _rules: Vec<Vec<String>>,
    ) -> casbin::Result<bool> {
        Err(self.read_only())
    }

    async fn remove_filtered_policy(
        &mut self,
        _sec: &str,
        _ptype: &str,
        _field_index: usize,
        _field_values: Vec<String>,
    ) -> casbin::Result<bool> {
        Err(self.read_only())
    }
}

/// A casbin enforcer bound to one rule table. Rules are reloaded in place, so holders
/// of an `Arc<Engine>` see every reload.
pub struct Engine {
    table: String,
    request: Vec<String>,
    enforcer: RwLock<casbin::Enforcer>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("table", &self.table)
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub async fn build(
        model_text: &str,
        store: Arc<dyn PolicyStore>,
        table: &str,
    ) -> Result<Self, PolicyError> {
        let model = parse_model(model_text).await?;
        let request = definition_fields(model_text, "r").unwrap_or_default();
        let enforcer = casbin::Enforcer::new(model, RuleTableAdapter::new(store, table)).await?;
        Ok(Self {
            table: table.to_string(),
            request,
            enforcer: RwLock::new(enforcer),
        })
    }

    /// Adapter table the rules were loaded from
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Re-reads the table into the same enforcer
    pub async fn reload(&self) -> Result<(), PolicyError> {
        self.enforcer.write().await.load_policy().await?;
        Ok(())
    }

    pub async fn policy_count(&self) -> usize {
        self.enforcer.read().await.get_policy().len()
    }

    pub async fn enforce(&self, request: &[String]) -> Result<bool, PolicyError> {
        if request.len() != self.request.len() {
            return Err(PolicyError::BadRequest(format!(
                "invalid request size: expected {} values ({}), got {}",
                self.request.len(),
                self.request.join(", "),
                request.len()
            )));
        }
        Ok(self.enforcer.read().await.enforce(request.to_vec())?)
    }
}

//! In-memory reference implementation of the policy store traits.
//!
//! This store is deterministic and test-friendly: it mirrors the
//! PostgreSQL adapter's semantics (content-addressed rows, insert-or-ignore
//! dedup, all-or-nothing batches) over a plain map. Production deployments
//! should use the transactional backend for source-of-truth data.

use crate::model::{validate_window, Filter, PolicyModel, RuleRow};
use crate::traits::{BatchPolicyStore, FilteredPolicyStore, PolicyStore, UpdatablePolicyStore};
use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// In-memory policy store keyed by content identifier.
#[derive(Default)]
pub struct InMemoryPolicyStore {
    rows: RwLock<BTreeMap<String, RuleRow>>,
    filtered: AtomicBool,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic snapshot of every stored row, ordered by identifier.
    pub fn snapshot(&self) -> StoreResult<Vec<RuleRow>> {
        let guard = self
            .rows
            .read()
            .map_err(|_| StoreError::Backend("rows lock poisoned".to_string()))?;
        Ok(guard.values().cloned().collect())
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn load_policy(&self, model: &mut PolicyModel) -> StoreResult<()> {
        let guard = self
            .rows
            .read()
            .map_err(|_| StoreError::Backend("rows lock poisoned".to_string()))?;
        for row in guard.values() {
            model.load_line(&row.to_line()?)?;
        }
        self.filtered.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn save_policy(&self, model: &PolicyModel) -> StoreResult<()> {
        // Encode every rule before touching the table so a bad rule leaves
        // prior contents untouched.
        let mut rows = Vec::new();
        for section in ["p", "g"] {
            for (ptype, values) in model.rules(section) {
                rows.push(RuleRow::from_parts(ptype, values)?);
            }
        }

        let mut guard = self
            .rows
            .write()
            .map_err(|_| StoreError::Backend("rows lock poisoned".to_string()))?;
        guard.clear();
        for row in rows {
            guard.entry(row.id.clone()).or_insert(row);
        }
        Ok(())
    }

    async fn add_policy(&self, ptype: &str, rule: Vec<String>) -> StoreResult<()> {
        let row = RuleRow::from_parts(ptype, &rule)?;
        let mut guard = self
            .rows
            .write()
            .map_err(|_| StoreError::Backend("rows lock poisoned".to_string()))?;
        guard.entry(row.id.clone()).or_insert(row);
        Ok(())
    }

    async fn remove_policy(&self, ptype: &str, rule: Vec<String>) -> StoreResult<()> {
        let row = RuleRow::from_parts(ptype, &rule)?;
        let mut guard = self
            .rows
            .write()
            .map_err(|_| StoreError::Backend("rows lock poisoned".to_string()))?;
        guard.remove(&row.id);
        Ok(())
    }

    async fn remove_filtered_policy(
        &self,
        ptype: &str,
        field_index: usize,
        field_values: Vec<String>,
    ) -> StoreResult<()> {
        validate_window(field_index, field_values.len())?;
        let mut guard = self
            .rows
            .write()
            .map_err(|_| StoreError::Backend("rows lock poisoned".to_string()))?;
        guard.retain(|_, row| row.ptype != ptype || !row.matches(field_index, &field_values));
        Ok(())
    }
}

#[async_trait]
impl BatchPolicyStore for InMemoryPolicyStore {
    async fn add_policies(&self, ptype: &str, rules: Vec<Vec<String>>) -> StoreResult<()> {
        let mut rows = Vec::with_capacity(rules.len());
        for rule in &rules {
            rows.push(RuleRow::from_parts(ptype, rule)?);
        }

        let mut guard = self
            .rows
            .write()
            .map_err(|_| StoreError::Backend("rows lock poisoned".to_string()))?;
        for row in rows {
            guard.entry(row.id.clone()).or_insert(row);
        }
        Ok(())
    }

    async fn remove_policies(&self, ptype: &str, rules: Vec<Vec<String>>) -> StoreResult<()> {
        let mut ids = Vec::with_capacity(rules.len());
        for rule in &rules {
            ids.push(RuleRow::from_parts(ptype, rule)?.id);
        }

        let mut guard = self
            .rows
            .write()
            .map_err(|_| StoreError::Backend("rows lock poisoned".to_string()))?;
        for id in ids {
            guard.remove(&id);
        }
        Ok(())
    }
}

#[async_trait]
impl FilteredPolicyStore for InMemoryPolicyStore {
    async fn load_filtered_policy(
        &self,
        model: &mut PolicyModel,
        filter: Option<&Filter>,
    ) -> StoreResult<()> {
        let Some(filter) = filter else {
            return self.load_policy(model).await;
        };

        for values in [filter.p.as_ref(), filter.g.as_ref()].into_iter().flatten() {
            validate_window(0, values.len())?;
        }

        let guard = self
            .rows
            .read()
            .map_err(|_| StoreError::Backend("rows lock poisoned".to_string()))?;
        for (tag, values) in [("p", filter.p.as_ref()), ("g", filter.g.as_ref())] {
            let Some(values) = values else { continue };
            for row in guard.values() {
                if row.ptype == tag && row.matches(0, values) {
                    model.load_line(&row.to_line()?)?;
                }
            }
        }
        drop(guard);

        self.filtered.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_filtered(&self) -> bool {
        self.filtered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpdatablePolicyStore for InMemoryPolicyStore {
    async fn update_policies(
        &self,
        ptype: &str,
        old_rules: Vec<Vec<String>>,
        new_rules: Vec<Vec<String>>,
    ) -> StoreResult<()> {
        if old_rules.len() != new_rules.len() {
            return Err(StoreError::InvalidInput(format!(
                "update batch mismatch: {} old rules, {} new rules",
                old_rules.len(),
                new_rules.len()
            )));
        }

        let mut pairs = Vec::with_capacity(old_rules.len());
        for (old, new) in old_rules.iter().zip(&new_rules) {
            let old_id = RuleRow::from_parts(ptype, old)?.id;
            let new_row = RuleRow::from_parts(ptype, new)?;
            pairs.push((old_id, new_row));
        }

        let mut guard = self
            .rows
            .write()
            .map_err(|_| StoreError::Backend("rows lock poisoned".to_string()))?;

        // Stage the whole batch so a failing pair leaves the table as it was.
        let mut staged = guard.clone();
        for (old_id, new_row) in pairs {
            if staged.remove(&old_id).is_none() {
                // No row with the old content: zero rows affected is success.
                continue;
            }
            if staged.contains_key(&new_row.id) {
                return Err(StoreError::Backend(format!(
                    "duplicate rule id {}",
                    new_row.id
                )));
            }
            staged.insert(new_row.id.clone(), new_row);
        }
        *guard = staged;
        Ok(())
    }

    async fn update_filtered_policies(
        &self,
        ptype: &str,
        new_rules: Vec<Vec<String>>,
        field_index: usize,
        field_values: Vec<String>,
    ) -> StoreResult<Vec<Vec<String>>> {
        validate_window(field_index, field_values.len())?;
        let mut rows = Vec::with_capacity(new_rules.len());
        for rule in &new_rules {
            rows.push(RuleRow::from_parts(ptype, rule)?);
        }

        let mut guard = self
            .rows
            .write()
            .map_err(|_| StoreError::Backend("rows lock poisoned".to_string()))?;

        let mut staged = guard.clone();
        let mut replaced = Vec::new();
        for row in rows {
            let matching = staged
                .values()
                .filter(|r| r.ptype == ptype && r.matches(field_index, &field_values))
                .map(|r| r.id.clone())
                .collect::<Vec<_>>();
            for id in matching {
                if let Some(removed) = staged.remove(&id) {
                    replaced.push(removed.to_rule().values);
                }
            }
            staged.entry(row.id.clone()).or_insert(row);
        }
        *guard = staged;
        Ok(replaced)
    }
}

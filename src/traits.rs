use crate::model::{Filter, PolicyModel};
use crate::StoreResult;
use async_trait::async_trait;

/// Core persistence surface for a policy model.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Load every stored rule into the model, in store-returned order.
    async fn load_policy(&self, model: &mut PolicyModel) -> StoreResult<()>;

    /// Replace the entire stored rule set with the model's current rules,
    /// as a single all-or-nothing transaction.
    async fn save_policy(&self, model: &PolicyModel) -> StoreResult<()>;

    /// Insert one rule. Inserting a content-duplicate is a no-op.
    async fn add_policy(&self, ptype: &str, rule: Vec<String>) -> StoreResult<()>;

    /// Delete one rule by its content identifier. Zero rows affected is
    /// success.
    async fn remove_policy(&self, ptype: &str, rule: Vec<String>) -> StoreResult<()>;

    /// Delete every rule of `ptype` matching the positional predicate built
    /// from `field_values` starting at column `v{field_index}`.
    async fn remove_filtered_policy(
        &self,
        ptype: &str,
        field_index: usize,
        field_values: Vec<String>,
    ) -> StoreResult<()>;
}

/// Batched inserts and deletes, each batch one transaction.
#[async_trait]
pub trait BatchPolicyStore: Send + Sync {
    async fn add_policies(&self, ptype: &str, rules: Vec<Vec<String>>) -> StoreResult<()>;
    async fn remove_policies(&self, ptype: &str, rules: Vec<Vec<String>>) -> StoreResult<()>;
}

/// Partial loads restricted by a per-section positional filter.
#[async_trait]
pub trait FilteredPolicyStore: Send + Sync {
    /// Load only the rules matching `filter`. An absent filter behaves as a
    /// full [`PolicyStore::load_policy`].
    async fn load_filtered_policy(
        &self,
        model: &mut PolicyModel,
        filter: Option<&Filter>,
    ) -> StoreResult<()>;

    /// Whether the last successful load was a filtered one.
    fn is_filtered(&self) -> bool;
}

/// Targeted and filtered rewrites of stored rules.
#[async_trait]
pub trait UpdatablePolicyStore: Send + Sync {
    /// Rewrite the rule identified by `old_rule`'s content to `new_rule`.
    async fn update_policy(
        &self,
        ptype: &str,
        old_rule: Vec<String>,
        new_rule: Vec<String>,
    ) -> StoreResult<()> {
        self.update_policies(ptype, vec![old_rule], vec![new_rule])
            .await
    }

    /// Pairwise rewrite of `old_rules` to `new_rules`, one transaction for
    /// the whole batch. The two batches must have equal length.
    async fn update_policies(
        &self,
        ptype: &str,
        old_rules: Vec<Vec<String>>,
        new_rules: Vec<Vec<String>>,
    ) -> StoreResult<()>;

    /// Replace every rule matching the positional predicate with the given
    /// new rules, in one transaction. Returns the value tuples of the rules
    /// actually deleted.
    async fn update_filtered_policies(
        &self,
        ptype: &str,
        new_rules: Vec<Vec<String>>,
        field_index: usize,
        field_values: Vec<String>,
    ) -> StoreResult<Vec<Vec<String>>>;
}

/// Full persistence bundle expected by the policy engine.
pub trait FullPolicyStore:
    PolicyStore + BatchPolicyStore + FilteredPolicyStore + UpdatablePolicyStore + Send + Sync
{
}

impl<T> FullPolicyStore for T where
    T: PolicyStore + BatchPolicyStore + FilteredPolicyStore + UpdatablePolicyStore + Send + Sync
{
}

//! PostgreSQL adapter for policy persistence.
//!
//! Rows are content-addressed: the primary key is the BLAKE3 identifier of
//! the rule's content, so targeted updates and deletes need no surrogate
//! key and duplicate inserts collapse through `ON CONFLICT (id) DO
//! NOTHING`. The table name is the only textual substitution in any
//! statement; every value travels as a bound parameter.

use crate::model::{
    last_non_empty_index, validate_window, Filter, PolicyModel, RuleRow, MAX_RULE_ARITY,
};
use crate::traits::{BatchPolicyStore, FilteredPolicyStore, PolicyStore, UpdatablePolicyStore};
use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use sqlx::postgres::{PgExecutor, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Table used when no explicit table name is configured.
pub const DEFAULT_TABLE_NAME: &str = "policy_rules";

const VALUE_COLUMNS: [&str; MAX_RULE_ARITY] = ["v0", "v1", "v2", "v3", "v4", "v5"];

/// PostgreSQL-backed policy store.
///
/// Holds no mutable state beyond the pool handle, the table name, and the
/// filtered flag, so clones share one view and operations may run
/// concurrently from multiple tasks. Consistency across concurrent writers
/// is the database's transaction isolation: the last committed transaction
/// wins, with no application-level mutual exclusion.
#[derive(Clone)]
pub struct PostgresPolicyStore {
    pool: PgPool,
    table: String,
    filtered: Arc<AtomicBool>,
}

impl PostgresPolicyStore {
    /// Connect to PostgreSQL and ensure the rule table exists.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        acquire_timeout_secs: u64,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(acquire_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to connect postgres: {e}")))?;
        Self::from_pool(pool).await
    }

    /// Create the store from an existing pool, using the default table.
    pub async fn from_pool(pool: PgPool) -> StoreResult<Self> {
        Self::from_pool_with_table(pool, DEFAULT_TABLE_NAME).await
    }

    /// Create the store from an existing pool and table name, ensuring the
    /// table exists.
    pub async fn from_pool_with_table(pool: PgPool, table: &str) -> StoreResult<Self> {
        let store = Self::new_unchecked(pool, table)?;
        store.ensure_table().await?;
        Ok(store)
    }

    /// Create the store against a pre-provisioned table, skipping DDL.
    pub fn from_existing_table(pool: PgPool, table: &str) -> StoreResult<Self> {
        Self::new_unchecked(pool, table)
    }

    fn new_unchecked(pool: PgPool, table: &str) -> StoreResult<Self> {
        validate_table_name(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
            filtered: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    async fn ensure_table(&self) -> StoreResult<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                ptype TEXT NOT NULL,
                v0 TEXT NOT NULL,
                v1 TEXT NOT NULL,
                v2 TEXT NOT NULL,
                v3 TEXT NOT NULL,
                v4 TEXT NOT NULL,
                v5 TEXT NOT NULL
            )",
            self.table
        );
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("schema init failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl PolicyStore for PostgresPolicyStore {
    async fn load_policy(&self, model: &mut PolicyModel) -> StoreResult<()> {
        let sql = format!(
            "SELECT id, ptype, v0, v1, v2, v3, v4, v5 FROM {}",
            self.table
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let count = rows.len();
        for row in rows {
            let rule = row_to_rule_row(&row)?;
            model.load_line(&rule.to_line()?)?;
        }

        self.filtered.store(false, Ordering::SeqCst);
        debug!(table = %self.table, rows = count, "policy loaded");
        Ok(())
    }

    async fn save_policy(&self, model: &PolicyModel) -> StoreResult<()> {
        let mut rows = Vec::new();
        for section in ["p", "g"] {
            for (ptype, values) in model.rules(section) {
                rows.push(RuleRow::from_parts(ptype, values)?);
            }
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let sql = format!("DELETE FROM {}", self.table);
        sqlx::query(&sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        for row in &rows {
            insert_rule_row(&mut *tx, &self.table, row).await?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        debug!(table = %self.table, rules = rows.len(), "policy saved");
        Ok(())
    }

    async fn add_policy(&self, ptype: &str, rule: Vec<String>) -> StoreResult<()> {
        let row = RuleRow::from_parts(ptype, &rule)?;
        insert_rule_row(&self.pool, &self.table, &row).await
    }

    async fn remove_policy(&self, ptype: &str, rule: Vec<String>) -> StoreResult<()> {
        let row = RuleRow::from_parts(ptype, &rule)?;
        let sql = format!("DELETE FROM {} WHERE id = $1", self.table);
        sqlx::query(&sql)
            .bind(row.id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn remove_filtered_policy(
        &self,
        ptype: &str,
        field_index: usize,
        field_values: Vec<String>,
    ) -> StoreResult<()> {
        let (clause, args) = where_clause(field_index, &field_values)?;
        let sql = format!("DELETE FROM {} WHERE {}", self.table, clause);
        let mut query = sqlx::query(&sql).bind(ptype);
        for arg in args {
            query = query.bind(arg);
        }
        query
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl BatchPolicyStore for PostgresPolicyStore {
    async fn add_policies(&self, ptype: &str, rules: Vec<Vec<String>>) -> StoreResult<()> {
        let mut rows = Vec::with_capacity(rules.len());
        for rule in &rules {
            rows.push(RuleRow::from_parts(ptype, rule)?);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        for row in &rows {
            insert_rule_row(&mut *tx, &self.table, row).await?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn remove_policies(&self, ptype: &str, rules: Vec<Vec<String>>) -> StoreResult<()> {
        let mut ids = Vec::with_capacity(rules.len());
        for rule in &rules {
            ids.push(RuleRow::from_parts(ptype, rule)?.id);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let sql = format!("DELETE FROM {} WHERE id = $1", self.table);
        for id in ids {
            sqlx::query(&sql)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl FilteredPolicyStore for PostgresPolicyStore {
    async fn load_filtered_policy(
        &self,
        model: &mut PolicyModel,
        filter: Option<&Filter>,
    ) -> StoreResult<()> {
        let Some(filter) = filter else {
            return self.load_policy(model).await;
        };

        // Validate both windows before any statement runs.
        for values in [filter.p.as_ref(), filter.g.as_ref()].into_iter().flatten() {
            validate_window(0, values.len())?;
        }

        for (tag, values) in [("p", filter.p.as_ref()), ("g", filter.g.as_ref())] {
            let Some(values) = values else { continue };
            let (clause, args) = where_clause(0, values)?;
            let sql = format!(
                "SELECT id, ptype, v0, v1, v2, v3, v4, v5 FROM {} WHERE {}",
                self.table, clause
            );
            let mut query = sqlx::query(&sql).bind(tag);
            for arg in args {
                query = query.bind(arg);
            }
            let rows = query
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;

            for row in rows {
                let rule = row_to_rule_row(&row)?;
                model.load_line(&rule.to_line()?)?;
            }
        }

        self.filtered.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_filtered(&self) -> bool {
        self.filtered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpdatablePolicyStore for PostgresPolicyStore {
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

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let sql = format!(
            "UPDATE {} SET id = $1, ptype = $2, v0 = $3, v1 = $4, v2 = $5, \
             v3 = $6, v4 = $7, v5 = $8 WHERE id = $9",
            self.table
        );
        for (old_id, new_row) in &pairs {
            sqlx::query(&sql)
                .bind(new_row.id.clone())
                .bind(new_row.ptype.clone())
                .bind(new_row.values[0].clone())
                .bind(new_row.values[1].clone())
                .bind(new_row.values[2].clone())
                .bind(new_row.values[3].clone())
                .bind(new_row.values[4].clone())
                .bind(new_row.values[5].clone())
                .bind(old_id.clone())
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn update_filtered_policies(
        &self,
        ptype: &str,
        new_rules: Vec<Vec<String>>,
        field_index: usize,
        field_values: Vec<String>,
    ) -> StoreResult<Vec<Vec<String>>> {
        let (clause, args) = where_clause(field_index, &field_values)?;
        let mut rows = Vec::with_capacity(new_rules.len());
        for rule in &new_rules {
            rows.push(RuleRow::from_parts(ptype, rule)?);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let delete_sql = format!(
            "DELETE FROM {} WHERE {} RETURNING v0, v1, v2, v3, v4, v5",
            self.table, clause
        );
        let mut replaced = Vec::new();
        for row in &rows {
            let mut query = sqlx::query(&delete_sql).bind(ptype);
            for arg in &args {
                query = query.bind(arg.clone());
            }
            let deleted = query
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            for deleted_row in &deleted {
                replaced.push(row_to_tuple(deleted_row)?);
            }

            insert_rule_row(&mut *tx, &self.table, row).await?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        debug!(
            table = %self.table,
            replaced = replaced.len(),
            inserted = rows.len(),
            "filtered policies updated"
        );
        Ok(replaced)
    }
}

async fn insert_rule_row<'c, E>(executor: E, table: &str, row: &RuleRow) -> StoreResult<()>
where
    E: PgExecutor<'c>,
{
    let sql = format!(
        "INSERT INTO {table} (id, ptype, v0, v1, v2, v3, v4, v5) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) ON CONFLICT (id) DO NOTHING"
    );
    sqlx::query(&sql)
        .bind(row.id.clone())
        .bind(row.ptype.clone())
        .bind(row.values[0].clone())
        .bind(row.values[1].clone())
        .bind(row.values[2].clone())
        .bind(row.values[3].clone())
        .bind(row.values[4].clone())
        .bind(row.values[5].clone())
        .execute(executor)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    Ok(())
}

/// Parameterized conjunctive predicate over the value columns.
///
/// The clause always begins with `ptype = $1`; the returned arguments bind
/// from `$2` onward. Positions holding the empty string impose no
/// constraint.
fn where_clause(field_index: usize, field_values: &[String]) -> StoreResult<(String, Vec<String>)> {
    validate_window(field_index, field_values.len())?;
    let mut clause = String::from("ptype = $1");
    let mut args = Vec::new();
    for (i, value) in field_values.iter().enumerate() {
        if value.is_empty() {
            continue;
        }
        args.push(value.clone());
        clause.push_str(&format!(
            " AND {} = ${}",
            VALUE_COLUMNS[field_index + i],
            args.len() + 1
        ));
    }
    Ok((clause, args))
}

fn row_to_rule_row(row: &PgRow) -> StoreResult<RuleRow> {
    let mut values: [String; MAX_RULE_ARITY] = Default::default();
    for (slot, column) in values.iter_mut().zip(VALUE_COLUMNS) {
        *slot = row
            .try_get(column)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
    }
    Ok(RuleRow {
        id: row
            .try_get("id")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        ptype: row
            .try_get("ptype")
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        values,
    })
}

fn row_to_tuple(row: &PgRow) -> StoreResult<Vec<String>> {
    let mut values: [String; MAX_RULE_ARITY] = Default::default();
    for (slot, column) in values.iter_mut().zip(VALUE_COLUMNS) {
        *slot = row
            .try_get(column)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
    }
    let len = last_non_empty_index(&values).map_or(0, |i| i + 1);
    Ok(values[..len].to_vec())
}

fn validate_table_name(table: &str) -> StoreResult<()> {
    let valid = !table.is_empty()
        && table
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(StoreError::InvalidInput(format!(
            "invalid table name `{table}`"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn predicate_binds_only_constrained_positions() {
        let (clause, args) = where_clause(1, &strings(&["data1", "", "read"])).unwrap();
        assert_eq!(clause, "ptype = $1 AND v1 = $2 AND v3 = $3");
        assert_eq!(args, strings(&["data1", "read"]));
    }

    #[test]
    fn predicate_without_constraints_covers_the_whole_section() {
        let (clause, args) = where_clause(0, &[]).unwrap();
        assert_eq!(clause, "ptype = $1");
        assert!(args.is_empty());
    }

    #[test]
    fn predicate_rejects_out_of_range_window() {
        let result = where_clause(4, &strings(&["a", "b", "c"]));
        assert!(matches!(result, Err(StoreError::InvalidInput(_))));
    }

    #[test]
    fn table_names_are_restricted_to_identifiers() {
        assert!(validate_table_name(DEFAULT_TABLE_NAME).is_ok());
        assert!(validate_table_name("_rules2").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("policy rules").is_err());
        assert!(validate_table_name("rules;drop").is_err());
        assert!(validate_table_name("2fast").is_err());
    }
}

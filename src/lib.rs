//! Relational persistence for authorization policy models.
//!
//! This crate reconciles an in-memory policy model — access-control and
//! role-inheritance rules, each an ordered tuple of strings under a named
//! rule-type — with rows of a single shared relational table, through full
//! loads, full saves, incremental add/remove/update, and partial (filtered)
//! loads.
//!
//! Design stance:
//! - Rows are content-addressed: a rule's storage key is a deterministic
//!   hash of its full content, so targeted operations need no surrogate key
//!   and duplicate inserts are silent no-ops.
//! - PostgreSQL is the transactional source of truth; the in-memory store
//!   mirrors its semantics for tests and embedding.
//! - Rule evaluation belongs to the policy engine consuming the loaded
//!   model, not to this crate.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod error;
pub mod memory;
mod model;
#[cfg(feature = "postgres")]
pub mod postgres;
mod traits;

pub use error::{StoreError, StoreResult};
pub use model::{rule_id, Filter, PolicyModel, PolicyRule, RuleRow, MAX_RULE_ARITY};
pub use traits::{
    BatchPolicyStore, FilteredPolicyStore, FullPolicyStore, PolicyStore, UpdatablePolicyStore,
};

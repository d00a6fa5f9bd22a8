//! Storage port for the Brew POS engine.
//!
//! Every component (catalog, stock ledger, cash-flow ledger, order commit
//! pipeline, migration importer) is written against [`StorageBackend`]. Two
//! implementations exist:
//!
//! - [`sqlite::SqliteBackend`]: the embedded relational store used
//!   on-device. Uniqueness, CHECK constraints, and cascade deletes are
//!   enforced by the schema, and `run_unit_of_work` executes inside a real
//!   database transaction.
//! - [`local::LocalBackend`]: the key-value fallback used when no embedded
//!   database is available. Each collection is a whole-file JSON document
//!   (read, mutate in memory, write back); `run_unit_of_work` has **no**
//!   atomicity guarantee and an interruption between steps leaves partial
//!   state.

pub mod local;
pub mod sqlite;

use crate::error::StorageResult;
use crate::models::{
    CashFlowTransaction, CatalogRecord, EntityKind, Order, OrderFilter, OrderStatus, StockItemType,
    StockRecord, TransactionType,
};

/// Persistence port. Object-safe so components hold `Arc<dyn StorageBackend>`.
pub trait StorageBackend: Send + Sync {
    /// Short backend name for logs ("sqlite" / "local").
    fn kind_name(&self) -> &'static str;

    // -- catalog ----------------------------------------------------------

    fn insert_catalog(&self, record: &CatalogRecord) -> StorageResult<()>;

    fn catalog_by_id(&self, kind: EntityKind, id: &str) -> StorageResult<Option<CatalogRecord>>;

    /// Lookup by the normalized (trimmed, lowercased) name key, the dedup
    /// index.
    fn catalog_by_name_key(
        &self,
        kind: EntityKind,
        key: &str,
    ) -> StorageResult<Option<CatalogRecord>>;

    /// Overwrite an existing record. Returns `false` when the id is unknown.
    fn update_catalog(&self, record: &CatalogRecord) -> StorageResult<bool>;

    /// Returns `false` when the id was already gone (idempotent delete).
    fn delete_catalog(&self, kind: EntityKind, id: &str) -> StorageResult<bool>;

    /// All entities of a kind, ordered by name (case-insensitive).
    fn list_catalog(&self, kind: EntityKind) -> StorageResult<Vec<CatalogRecord>>;

    // -- stock ------------------------------------------------------------

    fn stock_for(
        &self,
        item_type: StockItemType,
        item_id: &str,
    ) -> StorageResult<Option<StockRecord>>;

    /// Upsert keyed on `(item_type, item_id)`.
    fn put_stock(&self, record: &StockRecord) -> StorageResult<()>;

    fn delete_stock_for(&self, item_type: StockItemType, item_id: &str) -> StorageResult<bool>;

    fn list_stock(&self) -> StorageResult<Vec<StockRecord>>;

    // -- orders -----------------------------------------------------------

    fn insert_order(&self, order: &Order) -> StorageResult<()>;

    fn order_by_id(&self, id: &str) -> StorageResult<Option<Order>>;

    /// Status-only mutation. Returns `false` when the id is unknown.
    fn set_order_status(&self, id: &str, status: OrderStatus) -> StorageResult<bool>;

    /// Newest first.
    fn list_orders(&self, filter: OrderFilter) -> StorageResult<Vec<Order>>;

    // -- cash flow --------------------------------------------------------

    /// Append-only: transactions are never updated or deleted.
    fn append_transaction(&self, tx: &CashFlowTransaction) -> StorageResult<()>;

    /// Newest first, optionally limited.
    fn list_transactions(&self, limit: Option<usize>) -> StorageResult<Vec<CashFlowTransaction>>;

    /// Sum of amounts for one direction: the aggregate half of the
    /// derived drawer balance.
    fn sum_transactions(&self, tx_type: TransactionType) -> StorageResult<f64>;

    // -- settings / meta --------------------------------------------------

    fn get_flag(&self, key: &str) -> StorageResult<Option<String>>;

    fn set_flag(&self, key: &str, value: &str) -> StorageResult<()>;

    // -- migration support ------------------------------------------------

    /// True when any catalog entity, stock record, order, or transaction
    /// exists.
    fn has_data(&self) -> StorageResult<bool>;

    /// Remove all data (used to clear the fallback store after a successful
    /// migration). Settings flags survive.
    fn clear_all(&self) -> StorageResult<()>;

    // -- unit of work -----------------------------------------------------

    /// Run `work` as one logical unit. The SQLite backend brackets it in a
    /// `BEGIN IMMEDIATE` transaction so the steps all apply or none do; the
    /// fallback backend executes the steps as independent read-mutate-write
    /// operations with no rollback on partial failure.
    fn run_unit_of_work(
        &self,
        work: &mut dyn FnMut(&dyn StorageBackend) -> StorageResult<()>,
    ) -> StorageResult<()>;
}

// ===========================================================================
// Contract tests: the same assertions run against both backends
// ===========================================================================

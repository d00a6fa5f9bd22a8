//! One-shot migration from the fallback key-value store to the embedded
//! relational store.
//!
//! Entities move in dependency order: flavors, materials, ingredients, and
//! add-ons first (no dependencies), then products (whose recipes and flavor
//! links are re-pointed at the migrated ids), then stock, cash-flow history,
//! and orders last (informational history, no referential requirement).
//! Every catalog entity goes through the dedup-aware create, so running the
//! migration twice produces no duplicates. A persisted `migration_completed`
//! flag on the target keeps the importer from re-doing the work across
//! process restarts; the idempotent creates make repeated partial runs safe
//! even without it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::CatalogStore;
use crate::error::EngineResult;
use crate::models::{CatalogRecord, EntityKind, StockRecord};
use crate::storage::StorageBackend;

/// Settings key guarding repeat runs.
const MIGRATION_FLAG: &str = "migration_completed";

/// What `check_data_exists` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPresence {
    pub fallback: bool,
    pub transactional: bool,
}

/// Per-kind tallies of migrated (or dedup-reused) records.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationCounts {
    pub flavors: usize,
    pub materials: usize,
    pub ingredients: usize,
    pub addons: usize,
    pub products: usize,
    pub stock_records: usize,
    pub transactions: usize,
    pub orders: usize,
}

#[derive(Debug)]
pub struct MigrationReport {
    pub success: bool,
    /// True when the guard flag short-circuited the run.
    pub already_completed: bool,
    pub counts: MigrationCounts,
    pub errors: Vec<String>,
}

pub struct MigrationImporter {
    source: Arc<dyn StorageBackend>,
    target: Arc<dyn StorageBackend>,
    catalog: CatalogStore,
}

impl MigrationImporter {
    /// `source` is the fallback store, `target` the transactional one.
    pub fn new(source: Arc<dyn StorageBackend>, target: Arc<dyn StorageBackend>) -> Self {
        let catalog = CatalogStore::new(target.clone());
        MigrationImporter {
            source,
            target,
            catalog,
        }
    }

    /// Whether either side holds data. The caller runs the migration when
    /// the fallback has data and the transactional store does not.
    pub fn check_data_exists(&self) -> EngineResult<DataPresence> {
        Ok(DataPresence {
            fallback: self.source.has_data()?,
            transactional: self.target.has_data()?,
        })
    }

    /// Transfer everything from the fallback store into the transactional
    /// store. Per-entity failures are collected, not fatal. On full success
    /// the fallback store is cleared and the guard flag is set; on partial
    /// failure the fallback data is retained for retry.
    pub fn migrate_all(&self) -> EngineResult<MigrationReport> {
        if self.target.get_flag(MIGRATION_FLAG)?.as_deref() == Some("true") {
            info!("migration already completed, skipping");
            return Ok(MigrationReport {
                success: true,
                already_completed: true,
                counts: MigrationCounts::default(),
                errors: Vec::new(),
            });
        }

        let mut counts = MigrationCounts::default();
        let mut errors = Vec::new();
        // source id -> migrated id, per flat entity kind
        let mut id_map: HashMap<(EntityKind, String), String> = HashMap::new();

        // Flat entities first (no dependencies)
        for kind in [
            EntityKind::Flavor,
            EntityKind::Material,
            EntityKind::Ingredient,
            EntityKind::Addon,
        ] {
            self.migrate_flat(kind, &mut counts, &mut errors, &mut id_map)?;
        }

        // Products: re-point flavor links and recipes at migrated ids
        match self.source.list_catalog(EntityKind::Product) {
            Ok(products) => {
                for record in products {
                    let source_id = record.id().to_string();
                    let name = record.name().to_string();
                    let remapped = remap_product(record, &id_map);
                    match self.catalog.create(remapped) {
                        Ok(created) => {
                            id_map.insert(
                                (EntityKind::Product, source_id),
                                created.id().to_string(),
                            );
                            counts.products += 1;
                        }
                        Err(e) => errors.push(format!("product {name}: {e}")),
                    }
                }
            }
            Err(e) => errors.push(format!("product listing: {e}")),
        }

        self.migrate_stock(&mut counts, &mut errors, &id_map)?;
        self.migrate_transactions(&mut counts, &mut errors)?;
        self.migrate_orders(&mut counts, &mut errors)?;

        let success = errors.is_empty();
        if success {
            self.source.clear_all()?;
            self.target.set_flag(MIGRATION_FLAG, "true")?;
            info!(
                products = counts.products,
                orders = counts.orders,
                transactions = counts.transactions,
                "migration completed, fallback store cleared"
            );
        } else {
            warn!(
                errors = errors.len(),
                "migration finished with errors, fallback store retained"
            );
        }

        Ok(MigrationReport {
            success,
            already_completed: false,
            counts,
            errors,
        })
    }

    fn migrate_flat(
        &self,
        kind: EntityKind,
        counts: &mut MigrationCounts,
        errors: &mut Vec<String>,
        id_map: &mut HashMap<(EntityKind, String), String>,
    ) -> EngineResult<()> {
        let records = match self.source.list_catalog(kind) {
            Ok(records) => records,
            Err(e) => {
                errors.push(format!("{kind} listing: {e}"));
                return Ok(());
            }
        };
        for record in records {
            let source_id = record.id().to_string();
            let name = record.name().to_string();
            match self.catalog.create(record) {
                Ok(created) => {
                    id_map.insert((kind, source_id), created.id().to_string());
                    match kind {
                        EntityKind::Flavor => counts.flavors += 1,
                        EntityKind::Material => counts.materials += 1,
                        EntityKind::Ingredient => counts.ingredients += 1,
                        EntityKind::Addon => counts.addons += 1,
                        EntityKind::Product => {}
                    }
                }
                Err(e) => errors.push(format!("{kind} {name}: {e}")),
            }
        }
        Ok(())
    }

    fn migrate_stock(
        &self,
        counts: &mut MigrationCounts,
        errors: &mut Vec<String>,
        id_map: &HashMap<(EntityKind, String), String>,
    ) -> EngineResult<()> {
        let records = match self.source.list_stock() {
            Ok(records) => records,
            Err(e) => {
                errors.push(format!("stock listing: {e}"));
                return Ok(());
            }
        };
        for record in records {
            let kind = match record.item_type {
                crate::models::StockItemType::Addon => EntityKind::Addon,
                crate::models::StockItemType::Ingredient => EntityKind::Ingredient,
                crate::models::StockItemType::Material => EntityKind::Material,
            };
            let item_id = match id_map.get(&(kind, record.item_id.clone())) {
                Some(mapped) => mapped.clone(),
                None => {
                    errors.push(format!(
                        "stock {}/{}: no migrated entity for this record",
                        record.item_type, record.item_id
                    ));
                    continue;
                }
            };
            // Idempotent: an existing target record wins over the import
            match self.target.stock_for(record.item_type, &item_id) {
                Ok(Some(_)) => {
                    counts.stock_records += 1;
                }
                Ok(None) => {
                    let result = self.target.put_stock(&StockRecord {
                        id: Uuid::new_v4().to_string(),
                        item_type: record.item_type,
                        item_id,
                        quantity: record.quantity,
                        updated_at: record.updated_at.clone(),
                    });
                    match result {
                        Ok(()) => counts.stock_records += 1,
                        Err(e) => errors.push(format!(
                            "stock {}/{}: {e}",
                            record.item_type, record.item_id
                        )),
                    }
                }
                Err(e) => errors.push(format!(
                    "stock {}/{}: {e}",
                    record.item_type, record.item_id
                )),
            }
        }
        Ok(())
    }

    fn migrate_transactions(
        &self,
        counts: &mut MigrationCounts,
        errors: &mut Vec<String>,
    ) -> EngineResult<()> {
        let existing: HashSet<String> = match self.target.list_transactions(None) {
            Ok(txs) => txs.into_iter().map(|t| t.id).collect(),
            Err(e) => {
                errors.push(format!("transaction listing: {e}"));
                return Ok(());
            }
        };
        let transactions = match self.source.list_transactions(None) {
            Ok(txs) => txs,
            Err(e) => {
                errors.push(format!("transaction listing: {e}"));
                return Ok(());
            }
        };
        // Original ids are preserved so re-runs cannot double-count money
        for tx in transactions {
            if existing.contains(&tx.id) {
                counts.transactions += 1;
                continue;
            }
            match self.target.append_transaction(&tx) {
                Ok(()) => counts.transactions += 1,
                Err(e) => errors.push(format!("transaction {}: {e}", tx.id)),
            }
        }
        Ok(())
    }

    fn migrate_orders(
        &self,
        counts: &mut MigrationCounts,
        errors: &mut Vec<String>,
    ) -> EngineResult<()> {
        let orders = match self.source.list_orders(crate::models::OrderFilter::All) {
            Ok(orders) => orders,
            Err(e) => {
                errors.push(format!("order listing: {e}"));
                return Ok(());
            }
        };
        // Snapshots move verbatim: order history is informational and the
        // ids inside it intentionally keep pointing at the old store's
        // entities
        for order in orders {
            match self.target.order_by_id(&order.id) {
                Ok(Some(_)) => {
                    counts.orders += 1;
                }
                Ok(None) => match self.target.insert_order(&order) {
                    Ok(()) => counts.orders += 1,
                    Err(e) => errors.push(format!("order {}: {e}", order.id)),
                },
                Err(e) => errors.push(format!("order {}: {e}", order.id)),
            }
        }
        Ok(())
    }
}

/// Re-point a product's flavor links and size recipes at migrated ids.
/// Unmapped references are kept as-is and logged; the product itself still
/// migrates.
fn remap_product(
    record: CatalogRecord,
    id_map: &HashMap<(EntityKind, String), String>,
) -> CatalogRecord {
    let mut product = match record {
        CatalogRecord::Product(p) => p,
        other => return other,
    };

    for flavor_id in product.flavor_ids.iter_mut() {
        match id_map.get(&(EntityKind::Flavor, flavor_id.clone())) {
            Some(mapped) => *flavor_id = mapped.clone(),
            None => warn!(flavor_id = %flavor_id, "product flavor link has no migrated flavor"),
        }
    }
    for size in product.sizes.iter_mut() {
        for entry in size.materials.iter_mut() {
            match id_map.get(&(EntityKind::Material, entry.item_id.clone())) {
                Some(mapped) => entry.item_id = mapped.clone(),
                None => warn!(material_id = %entry.item_id, "recipe entry has no migrated material"),
            }
        }
        for entry in size.ingredients.iter_mut() {
            match id_map.get(&(EntityKind::Ingredient, entry.item_id.clone())) {
                Some(mapped) => entry.item_id = mapped.clone(),
                None => {
                    warn!(ingredient_id = %entry.item_id, "recipe entry has no migrated ingredient")
                }
            }
        }
    }

    CatalogRecord::Product(product)
}

// ===========================================================================
// Tests
// ===========================================================================

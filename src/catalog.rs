//! Catalog of named entities (products, flavors, materials, ingredients,
//! add-ons) with case-insensitive uniqueness.
//!
//! Creation resolves duplicates by silent reuse: creating an entity whose
//! name matches an existing one of the same type (ignoring case) returns
//! the stored record unchanged instead of erroring or duplicating. That is
//! what makes bulk imports and the fallback-to-SQLite migration idempotent.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::models::{
    derived_unit_price, name_key, CatalogRecord, EntityKind, Flavor, StockItemType,
};
use crate::storage::StorageBackend;

/// Flavors seeded by `import_default_flavors`.
const DEFAULT_FLAVORS: &[&str] = &[
    "Vanilla",
    "Caramel",
    "Hazelnut",
    "Mocha",
    "Matcha",
    "Strawberry",
    "Dark Chocolate",
];

#[derive(Clone)]
pub struct CatalogStore {
    backend: Arc<dyn StorageBackend>,
}

impl CatalogStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        CatalogStore { backend }
    }

    /// Create an entity, deduplicating by case-insensitive name.
    ///
    /// When an entity of the same kind already holds the name, it is
    /// returned unchanged, with no error and no duplicate. Otherwise the record is
    /// inserted under a freshly generated id (the incoming id is ignored)
    /// with derived prices recomputed.
    pub fn create(&self, record: CatalogRecord) -> EngineResult<CatalogRecord> {
        let kind = record.kind();
        let key = name_key(record.name());

        if let Some(existing) = self.backend.catalog_by_name_key(kind, &key)? {
            info!(
                kind = %kind,
                name = %record.name(),
                id = %existing.id(),
                "catalog create reused existing entity"
            );
            return Ok(existing);
        }

        let mut record = record;
        record.set_id(Uuid::new_v4().to_string());
        recompute_derived(&mut record);
        self.backend.insert_catalog(&record)?;
        info!(kind = %kind, name = %record.name(), id = %record.id(), "catalog entity created");
        Ok(record)
    }

    /// Overwrite an entity's attributes. Derived prices are recomputed from
    /// the submitted lot price and size, never trusted from input. Returns
    /// `None` when the id is unknown.
    pub fn update(&self, record: CatalogRecord) -> EngineResult<Option<CatalogRecord>> {
        let mut record = record;
        recompute_derived(&mut record);
        if self.backend.update_catalog(&record)? {
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }

    /// Delete an entity and any stock record keyed to it. Historical order
    /// snapshots referencing the id are left alone. Returns `false` when the
    /// entity was already gone.
    pub fn delete(&self, kind: EntityKind, id: &str) -> EngineResult<bool> {
        let deleted = self.backend.delete_catalog(kind, id)?;
        if let Some(item_type) = stock_type_for(kind) {
            let _ = self.backend.delete_stock_for(item_type, id)?;
        }
        if deleted {
            info!(kind = %kind, id = %id, "catalog entity deleted");
        }
        Ok(deleted)
    }

    /// All entities of a kind, ordered by name.
    pub fn list(&self, kind: EntityKind) -> EngineResult<Vec<CatalogRecord>> {
        Ok(self.backend.list_catalog(kind)?)
    }

    pub fn get(&self, kind: EntityKind, id: &str) -> EngineResult<Option<CatalogRecord>> {
        Ok(self.backend.catalog_by_id(kind, id)?)
    }

    /// Seed the built-in flavor set. Dedup-aware creates make repeated
    /// imports a no-op for flavors that already exist.
    pub fn import_default_flavors(&self) -> EngineResult<Vec<CatalogRecord>> {
        let mut imported = Vec::with_capacity(DEFAULT_FLAVORS.len());
        for name in DEFAULT_FLAVORS {
            let flavor = self.create(CatalogRecord::Flavor(Flavor {
                id: String::new(),
                name: (*name).to_string(),
            }))?;
            imported.push(flavor);
        }
        Ok(imported)
    }
}

/// Which inventory slot (if any) an entity kind occupies.
pub(crate) fn stock_type_for(kind: EntityKind) -> Option<StockItemType> {
    match kind {
        EntityKind::Addon => Some(StockItemType::Addon),
        EntityKind::Ingredient => Some(StockItemType::Ingredient),
        EntityKind::Material => Some(StockItemType::Material),
        EntityKind::Product | EntityKind::Flavor => None,
    }
}

fn recompute_derived(record: &mut CatalogRecord) {
    match record {
        CatalogRecord::Material(m) => {
            m.price_per_unit = derived_unit_price(m.price_per_purchase, m.units_per_purchase);
        }
        CatalogRecord::Ingredient(i) => {
            i.price_per_unit = derived_unit_price(i.price_per_purchase, i.units_per_purchase);
        }
        _ => {}
    }
}

// ===========================================================================
// Tests
// ===========================================================================

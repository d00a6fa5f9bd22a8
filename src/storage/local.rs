//! Fallback key-value storage backend.
//!
//! Used when no embedded database is available. Each "table" is one JSON
//! document in the data directory; every mutation is a whole-collection
//! read, an in-memory change, and a whole-file write-back. There is no
//! transaction support: `run_unit_of_work` simply runs the steps in order,
//! and an interruption between steps leaves partial state behind. That is
//! the supported-but-weaker mode the engine documents, not a bug to paper
//! over here.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::StorageResult;
use crate::models::{
    name_key, CashFlowTransaction, CatalogRecord, EntityKind, Order, OrderFilter, OrderStatus,
    StockItemType, StockRecord, TransactionType,
};
use crate::storage::StorageBackend;

const META_FILE: &str = "meta.json";

/// File-per-collection implementation of the storage port.
pub struct LocalBackend {
    dir: PathBuf,
}

impl LocalBackend {
    /// Open (or create) the store rooted at `dir`.
    pub fn new(dir: &Path) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;
        info!("Opened local store at {}", dir.display());
        Ok(LocalBackend {
            dir: dir.to_path_buf(),
        })
    }

    fn collection_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Read a whole collection. A missing file is an empty collection; an
    /// unreadable one is logged and treated as empty.
    fn read_collection<T: DeserializeOwned>(&self, name: &str) -> StorageResult<Vec<T>> {
        let path = self.collection_path(name);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path)?;
        match serde_json::from_str(&raw) {
            Ok(items) => Ok(items),
            Err(e) => {
                warn!(collection = %name, error = %e, "local store: unreadable collection, treating as empty");
                Ok(Vec::new())
            }
        }
    }

    /// Write a whole collection back.
    fn write_collection<T: Serialize>(&self, name: &str, items: &[T]) -> StorageResult<()> {
        let path = self.collection_path(name);
        fs::write(&path, serde_json::to_string(items)?)?;
        Ok(())
    }

    fn read_meta(&self) -> StorageResult<BTreeMap<String, String>> {
        let path = self.dir.join(META_FILE);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read_to_string(&path)?;
        match serde_json::from_str(&raw) {
            Ok(map) => Ok(map),
            Err(e) => {
                warn!(error = %e, "local store: unreadable meta, treating as empty");
                Ok(BTreeMap::new())
            }
        }
    }

    fn write_meta(&self, meta: &BTreeMap<String, String>) -> StorageResult<()> {
        fs::write(self.dir.join(META_FILE), serde_json::to_string(meta)?)?;
        Ok(())
    }
}

fn collection_name(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Product => "products",
        EntityKind::Flavor => "flavors",
        EntityKind::Material => "materials",
        EntityKind::Ingredient => "ingredients",
        EntityKind::Addon => "addons",
    }
}

const ALL_COLLECTIONS: &[&str] = &[
    "products",
    "flavors",
    "materials",
    "ingredients",
    "addons",
    "stock",
    "orders",
    "cash_flow",
];

impl StorageBackend for LocalBackend {
    fn kind_name(&self) -> &'static str {
        "local"
    }

    fn insert_catalog(&self, record: &CatalogRecord) -> StorageResult<()> {
        let name = collection_name(record.kind());
        let mut items: Vec<CatalogRecord> = self.read_collection(name)?;
        items.push(record.clone());
        self.write_collection(name, &items)
    }

    fn catalog_by_id(&self, kind: EntityKind, id: &str) -> StorageResult<Option<CatalogRecord>> {
        let items: Vec<CatalogRecord> = self.read_collection(collection_name(kind))?;
        Ok(items.into_iter().find(|r| r.id() == id))
    }

    fn catalog_by_name_key(
        &self,
        kind: EntityKind,
        key: &str,
    ) -> StorageResult<Option<CatalogRecord>> {
        let items: Vec<CatalogRecord> = self.read_collection(collection_name(kind))?;
        Ok(items.into_iter().find(|r| name_key(r.name()) == key))
    }

    fn update_catalog(&self, record: &CatalogRecord) -> StorageResult<bool> {
        let name = collection_name(record.kind());
        let mut items: Vec<CatalogRecord> = self.read_collection(name)?;
        match items.iter_mut().find(|r| r.id() == record.id()) {
            Some(slot) => {
                *slot = record.clone();
                self.write_collection(name, &items)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_catalog(&self, kind: EntityKind, id: &str) -> StorageResult<bool> {
        let name = collection_name(kind);
        let mut items: Vec<CatalogRecord> = self.read_collection(name)?;
        let before = items.len();
        items.retain(|r| r.id() != id);
        if items.len() == before {
            return Ok(false);
        }
        self.write_collection(name, &items)?;
        Ok(true)
    }

    fn list_catalog(&self, kind: EntityKind) -> StorageResult<Vec<CatalogRecord>> {
        let mut items: Vec<CatalogRecord> = self.read_collection(collection_name(kind))?;
        items.sort_by_key(|r| name_key(r.name()));
        Ok(items)
    }

    fn stock_for(
        &self,
        item_type: StockItemType,
        item_id: &str,
    ) -> StorageResult<Option<StockRecord>> {
        let items: Vec<StockRecord> = self.read_collection("stock")?;
        Ok(items
            .into_iter()
            .find(|r| r.item_type == item_type && r.item_id == item_id))
    }

    fn put_stock(&self, record: &StockRecord) -> StorageResult<()> {
        let mut items: Vec<StockRecord> = self.read_collection("stock")?;
        match items
            .iter_mut()
            .find(|r| r.item_type == record.item_type && r.item_id == record.item_id)
        {
            Some(slot) => {
                slot.quantity = record.quantity;
                slot.updated_at = record.updated_at.clone();
            }
            None => items.push(record.clone()),
        }
        self.write_collection("stock", &items)
    }

    fn delete_stock_for(&self, item_type: StockItemType, item_id: &str) -> StorageResult<bool> {
        let mut items: Vec<StockRecord> = self.read_collection("stock")?;
        let before = items.len();
        items.retain(|r| !(r.item_type == item_type && r.item_id == item_id));
        if items.len() == before {
            return Ok(false);
        }
        self.write_collection("stock", &items)?;
        Ok(true)
    }

    fn list_stock(&self) -> StorageResult<Vec<StockRecord>> {
        let mut items: Vec<StockRecord> = self.read_collection("stock")?;
        items.sort_by(|a, b| {
            (a.item_type.as_str(), &a.item_id).cmp(&(b.item_type.as_str(), &b.item_id))
        });
        Ok(items)
    }

    fn insert_order(&self, order: &Order) -> StorageResult<()> {
        let mut items: Vec<Order> = self.read_collection("orders")?;
        items.push(order.clone());
        self.write_collection("orders", &items)
    }

    fn order_by_id(&self, id: &str) -> StorageResult<Option<Order>> {
        let items: Vec<Order> = self.read_collection("orders")?;
        Ok(items.into_iter().find(|o| o.id == id))
    }

    fn set_order_status(&self, id: &str, status: OrderStatus) -> StorageResult<bool> {
        let mut items: Vec<Order> = self.read_collection("orders")?;
        match items.iter_mut().find(|o| o.id == id) {
            Some(order) => {
                order.order_status = status;
                self.write_collection("orders", &items)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn list_orders(&self, filter: OrderFilter) -> StorageResult<Vec<Order>> {
        let mut items: Vec<Order> = self.read_collection("orders")?;
        if filter == OrderFilter::Today {
            let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
            items.retain(|o| o.created_at.starts_with(&today));
        }
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(items)
    }

    fn append_transaction(&self, tx: &CashFlowTransaction) -> StorageResult<()> {
        let mut items: Vec<CashFlowTransaction> = self.read_collection("cash_flow")?;
        items.push(tx.clone());
        self.write_collection("cash_flow", &items)
    }

    fn list_transactions(&self, limit: Option<usize>) -> StorageResult<Vec<CashFlowTransaction>> {
        let mut items: Vec<CashFlowTransaction> = self.read_collection("cash_flow")?;
        // Appended in order; newest last on disk, newest first out
        items.reverse();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(n) = limit {
            items.truncate(n);
        }
        Ok(items)
    }

    fn sum_transactions(&self, tx_type: TransactionType) -> StorageResult<f64> {
        let items: Vec<CashFlowTransaction> = self.read_collection("cash_flow")?;
        Ok(items
            .iter()
            .filter(|t| t.tx_type == tx_type)
            .map(|t| t.amount)
            .sum())
    }

    fn get_flag(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.read_meta()?.get(key).cloned())
    }

    fn set_flag(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut meta = self.read_meta()?;
        meta.insert(key.to_string(), value.to_string());
        self.write_meta(&meta)
    }

    fn has_data(&self) -> StorageResult<bool> {
        for name in ALL_COLLECTIONS {
            let items: Vec<serde_json::Value> = self.read_collection(name)?;
            if !items.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn clear_all(&self) -> StorageResult<()> {
        for name in ALL_COLLECTIONS {
            self.write_collection::<serde_json::Value>(name, &[])?;
        }
        info!("Local store cleared");
        Ok(())
    }

    fn run_unit_of_work(
        &self,
        work: &mut dyn FnMut(&dyn StorageBackend) -> StorageResult<()>,
    ) -> StorageResult<()> {
        // No transaction support: steps apply one by one and stay applied
        // if a later step fails.
        work(self)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Addon;
    use crate::storage::testutil::unique_temp_dir;

    fn backend() -> (LocalBackend, PathBuf) {
        let dir = unique_temp_dir();
        (LocalBackend::new(&dir).expect("open local backend"), dir)
    }

    fn addon(id: &str, name: &str) -> CatalogRecord {
        CatalogRecord::Addon(Addon {
            id: id.into(),
            name: name.into(),
            price: 15.0,
        })
    }

    #[test]
    fn test_data_survives_reopen() {
        let (store, dir) = backend();
        store.insert_catalog(&addon("a1", "Extra Shot")).unwrap();
        drop(store);

        let reopened = LocalBackend::new(&dir).unwrap();
        let found = reopened
            .catalog_by_id(EntityKind::Addon, "a1")
            .unwrap()
            .expect("addon after reopen");
        assert_eq!(found.name(), "Extra Shot");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_unreadable_collection_treated_as_empty() {
        let (store, dir) = backend();
        fs::write(dir.join("addons.json"), b"{not json").unwrap();

        assert!(store.list_catalog(EntityKind::Addon).unwrap().is_empty());

        // Writes still work afterwards
        store.insert_catalog(&addon("a1", "Extra Shot")).unwrap();
        assert_eq!(store.list_catalog(EntityKind::Addon).unwrap().len(), 1);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_whole_collection_write_back() {
        let (store, dir) = backend();
        store.insert_catalog(&addon("a1", "Extra Shot")).unwrap();
        store.insert_catalog(&addon("a2", "Whipped Cream")).unwrap();

        // The file holds the entire collection, not a delta
        let raw = fs::read_to_string(dir.join("addons.json")).unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.len(), 2);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_files_mean_empty_store() {
        let (store, dir) = backend();
        assert!(!store.has_data().unwrap());
        assert!(store.list_stock().unwrap().is_empty());
        assert!(store.order_by_id("missing").unwrap().is_none());

        let _ = fs::remove_dir_all(&dir);
    }
}

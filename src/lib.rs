//! Brew POS - cafe point-of-sale order and inventory engine.
//!
//! The core that sits under the POS screens: it expands a shopping cart
//! into raw-material/ingredient/add-on consumption, deducts stock without
//! ever going negative, appends immutable cash-flow transactions, derives
//! the one authoritative drawer balance from that history, and keeps the
//! catalog free of case-insensitive duplicates, across two storage
//! backends with very different atomicity guarantees (embedded SQLite and
//! a key-value file fallback), including the one-time migration between
//! them.
//!
//! Everything hangs off [`PosEngine`], constructed once at process start
//! over the active [`storage::StorageBackend`] and passed by reference to
//! whatever hosts it. There are no module-level singletons and no per-call
//! "initialized" checks.

use std::sync::Arc;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod catalog;
mod cashflow;
mod error;
mod migration;
mod models;
mod orders;
mod stock;
pub mod storage;

pub use catalog::CatalogStore;
pub use cashflow::{CashFlowLedger, CashFlowSummary, CategoryTotal};
pub use error::{EngineError, EngineResult, StorageError, StorageResult};
pub use migration::{DataPresence, MigrationCounts, MigrationImporter, MigrationReport};
pub use models::*;
pub use orders::{CommittedOrder, OrderCommitPipeline};
pub use stock::{
    LowStockAlert, LowStockListener, StockDeduction, StockLedger, StockShortfall, ALLOW_OVERSELL,
};

use storage::StorageBackend;

/// Install the global tracing subscriber. Call once from the embedding
/// application; respects `RUST_LOG`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

/// The engine facade the presentation layer talks to.
///
/// Owns one of each component, all sharing the active backend. Construct it
/// once at startup; catalog admin screens, checkout, and the dashboard all
/// call through it.
pub struct PosEngine {
    backend: Arc<dyn StorageBackend>,
    catalog: CatalogStore,
    stock: StockLedger,
    cashflow: CashFlowLedger,
    orders: OrderCommitPipeline,
}

impl PosEngine {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        let stock = StockLedger::new(backend.clone());
        Self::assemble(backend, stock)
    }

    /// Same as [`PosEngine::new`] with a low-stock listener wired into the
    /// stock ledger (alerting UI hook).
    pub fn with_low_stock_listener(
        backend: Arc<dyn StorageBackend>,
        listener: LowStockListener,
    ) -> Self {
        let stock = StockLedger::new(backend.clone()).with_low_stock_listener(listener);
        Self::assemble(backend, stock)
    }

    fn assemble(backend: Arc<dyn StorageBackend>, stock: StockLedger) -> Self {
        let catalog = CatalogStore::new(backend.clone());
        let cashflow = CashFlowLedger::new(backend.clone());
        let orders = OrderCommitPipeline::new(backend.clone(), stock.clone());
        PosEngine {
            backend,
            catalog,
            stock,
            cashflow,
            orders,
        }
    }

    /// The backend this engine runs on ("sqlite" or "local").
    pub fn backend_kind(&self) -> &'static str {
        self.backend.kind_name()
    }

    // -- catalog: products ------------------------------------------------

    pub fn create_product(&self, product: Product) -> EngineResult<Product> {
        self.catalog
            .create(CatalogRecord::Product(product))
            .map(into_product)
    }

    pub fn update_product(&self, product: Product) -> EngineResult<Option<Product>> {
        Ok(self
            .catalog
            .update(CatalogRecord::Product(product))?
            .map(into_product))
    }

    pub fn delete_product(&self, id: &str) -> EngineResult<bool> {
        self.catalog.delete(EntityKind::Product, id)
    }

    pub fn list_products(&self) -> EngineResult<Vec<Product>> {
        Ok(self
            .catalog
            .list(EntityKind::Product)?
            .into_iter()
            .map(into_product)
            .collect())
    }

    // -- catalog: flavors -------------------------------------------------

    pub fn create_flavor(&self, flavor: Flavor) -> EngineResult<Flavor> {
        self.catalog
            .create(CatalogRecord::Flavor(flavor))
            .map(into_flavor)
    }

    pub fn update_flavor(&self, flavor: Flavor) -> EngineResult<Option<Flavor>> {
        Ok(self
            .catalog
            .update(CatalogRecord::Flavor(flavor))?
            .map(into_flavor))
    }

    pub fn delete_flavor(&self, id: &str) -> EngineResult<bool> {
        self.catalog.delete(EntityKind::Flavor, id)
    }

    pub fn list_flavors(&self) -> EngineResult<Vec<Flavor>> {
        Ok(self
            .catalog
            .list(EntityKind::Flavor)?
            .into_iter()
            .map(into_flavor)
            .collect())
    }

    /// Bulk seed of the built-in flavor set; idempotent.
    pub fn import_default_flavor_set(&self) -> EngineResult<Vec<Flavor>> {
        Ok(self
            .catalog
            .import_default_flavors()?
            .into_iter()
            .map(into_flavor)
            .collect())
    }

    // -- catalog: materials -----------------------------------------------

    pub fn create_material(&self, material: Material) -> EngineResult<Material> {
        self.catalog
            .create(CatalogRecord::Material(material))
            .map(into_material)
    }

    pub fn update_material(&self, material: Material) -> EngineResult<Option<Material>> {
        Ok(self
            .catalog
            .update(CatalogRecord::Material(material))?
            .map(into_material))
    }

    pub fn delete_material(&self, id: &str) -> EngineResult<bool> {
        self.catalog.delete(EntityKind::Material, id)
    }

    pub fn list_materials(&self) -> EngineResult<Vec<Material>> {
        Ok(self
            .catalog
            .list(EntityKind::Material)?
            .into_iter()
            .map(into_material)
            .collect())
    }

    // -- catalog: ingredients ---------------------------------------------

    pub fn create_ingredient(&self, ingredient: Ingredient) -> EngineResult<Ingredient> {
        self.catalog
            .create(CatalogRecord::Ingredient(ingredient))
            .map(into_ingredient)
    }

    pub fn update_ingredient(&self, ingredient: Ingredient) -> EngineResult<Option<Ingredient>> {
        Ok(self
            .catalog
            .update(CatalogRecord::Ingredient(ingredient))?
            .map(into_ingredient))
    }

    pub fn delete_ingredient(&self, id: &str) -> EngineResult<bool> {
        self.catalog.delete(EntityKind::Ingredient, id)
    }

    pub fn list_ingredients(&self) -> EngineResult<Vec<Ingredient>> {
        Ok(self
            .catalog
            .list(EntityKind::Ingredient)?
            .into_iter()
            .map(into_ingredient)
            .collect())
    }

    // -- catalog: add-ons -------------------------------------------------

    pub fn create_addon(&self, addon: Addon) -> EngineResult<Addon> {
        self.catalog
            .create(CatalogRecord::Addon(addon))
            .map(into_addon)
    }

    pub fn update_addon(&self, addon: Addon) -> EngineResult<Option<Addon>> {
        Ok(self
            .catalog
            .update(CatalogRecord::Addon(addon))?
            .map(into_addon))
    }

    pub fn delete_addon(&self, id: &str) -> EngineResult<bool> {
        self.catalog.delete(EntityKind::Addon, id)
    }

    pub fn list_addons(&self) -> EngineResult<Vec<Addon>> {
        Ok(self
            .catalog
            .list(EntityKind::Addon)?
            .into_iter()
            .map(into_addon)
            .collect())
    }

    // -- stock ------------------------------------------------------------

    pub fn set_stock_quantity(
        &self,
        item_type: StockItemType,
        item_id: &str,
        quantity: f64,
    ) -> EngineResult<StockRecord> {
        self.stock.set_quantity(item_type, item_id, quantity)
    }

    pub fn stock_level(
        &self,
        item_type: StockItemType,
        item_id: &str,
    ) -> EngineResult<Option<StockRecord>> {
        self.stock.level(item_type, item_id)
    }

    pub fn list_stock(&self) -> EngineResult<Vec<StockRecord>> {
        self.stock.list()
    }

    // -- orders -----------------------------------------------------------

    pub fn create_order(&self, cart: &Cart) -> EngineResult<CommittedOrder> {
        self.orders.commit(cart)
    }

    pub fn update_order_status(&self, id: &str, status: OrderStatus) -> EngineResult<bool> {
        self.orders.update_status(id, status)
    }

    pub fn get_order(&self, id: &str) -> EngineResult<Option<Order>> {
        self.orders.get(id)
    }

    pub fn list_orders(&self, filter: OrderFilter) -> EngineResult<Vec<Order>> {
        self.orders.list(filter)
    }

    // -- cash flow ---------------------------------------------------------

    pub fn record_inflow(
        &self,
        amount: f64,
        category: CashFlowCategory,
        order_id: Option<&str>,
        description: &str,
        created_by: Option<&str>,
    ) -> EngineResult<CashFlowTransaction> {
        self.cashflow
            .record_inflow(amount, category, order_id, description, created_by)
    }

    pub fn record_expense(
        &self,
        amount: f64,
        description: &str,
        items: Option<&[String]>,
        created_by: Option<&str>,
    ) -> EngineResult<CashFlowTransaction> {
        self.cashflow
            .record_expense(amount, description, items, created_by)
    }

    pub fn record_stock_purchase(
        &self,
        amount: f64,
        description: &str,
        created_by: Option<&str>,
    ) -> EngineResult<CashFlowTransaction> {
        self.cashflow
            .record_stock_purchase(amount, description, created_by)
    }

    pub fn record_refund(
        &self,
        amount: f64,
        order_id: Option<&str>,
        description: &str,
        created_by: Option<&str>,
    ) -> EngineResult<CashFlowTransaction> {
        self.cashflow
            .record_refund(amount, order_id, description, created_by)
    }

    pub fn get_drawer_balance(&self) -> EngineResult<f64> {
        self.cashflow.balance()
    }

    pub fn set_drawer_balance(
        &self,
        target: f64,
        reason: &str,
        created_by: Option<&str>,
    ) -> EngineResult<Option<CashFlowTransaction>> {
        self.cashflow.set_balance(target, reason, created_by)
    }

    pub fn get_summary(&self, period: SummaryPeriod) -> EngineResult<CashFlowSummary> {
        self.cashflow.summary(period)
    }

    pub fn list_transactions(
        &self,
        limit: Option<usize>,
    ) -> EngineResult<Vec<CashFlowTransaction>> {
        self.cashflow.list(limit)
    }
}

fn into_product(record: CatalogRecord) -> Product {
    match record {
        CatalogRecord::Product(p) => p,
        other => unreachable!("catalog returned {} for product", other.kind()),
    }
}

fn into_flavor(record: CatalogRecord) -> Flavor {
    match record {
        CatalogRecord::Flavor(f) => f,
        other => unreachable!("catalog returned {} for flavor", other.kind()),
    }
}

fn into_material(record: CatalogRecord) -> Material {
    match record {
        CatalogRecord::Material(m) => m,
        other => unreachable!("catalog returned {} for material", other.kind()),
    }
}

fn into_ingredient(record: CatalogRecord) -> Ingredient {
    match record {
        CatalogRecord::Ingredient(i) => i,
        other => unreachable!("catalog returned {} for ingredient", other.kind()),
    }
}

fn into_addon(record: CatalogRecord) -> Addon {
    match record {
        CatalogRecord::Addon(a) => a,
        other => unreachable!("catalog returned {} for addon", other.kind()),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

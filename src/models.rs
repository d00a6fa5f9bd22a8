//! Typed records for the Brew POS engine.
//!
//! Catalog entities, stock records, orders (with their immutable item
//! snapshots), cash-flow transactions, and the cart payload accepted by the
//! commit pipeline. Everything crossing the engine boundary is an explicit
//! struct validated before it enters the pipeline; enums are stored as the
//! lowercase strings the SQLite CHECK constraints enforce.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Catalog entities
// ---------------------------------------------------------------------------

/// Discriminant for the five catalog entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Product,
    Flavor,
    Material,
    Ingredient,
    Addon,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Product => "product",
            EntityKind::Flavor => "flavor",
            EntityKind::Material => "material",
            EntityKind::Ingredient => "ingredient",
            EntityKind::Addon => "addon",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-unit consumption entry in a size's recipe: `quantity_per_unit` of the
/// referenced material/ingredient is consumed for each unit ordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeEntry {
    pub item_id: String,
    pub quantity_per_unit: f64,
}

/// A product's size variant, owning its price and consumption recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Size {
    pub id: String,
    pub name: String,
    pub price: f64,
    #[serde(default)]
    pub materials: Vec<RecipeEntry>,
    #[serde(default)]
    pub ingredients: Vec<RecipeEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub sizes: Vec<Size>,
    #[serde(default)]
    pub flavor_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flavor {
    pub id: String,
    pub name: String,
}

/// Raw material (cups, lids, ...). Purchased in lots; the derived
/// `price_per_unit` is recomputed from the lot price whenever the entity is
/// created or updated, never trusted from input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Material {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub unit: Option<String>,
    pub price_per_purchase: f64,
    pub units_per_purchase: f64,
    #[serde(default)]
    pub price_per_unit: f64,
}

/// Ingredient (coffee beans, milk, syrup, ...). Same lot-pricing shape as
/// [`Material`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ingredient {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub unit: Option<String>,
    pub price_per_purchase: f64,
    pub units_per_purchase: f64,
    #[serde(default)]
    pub price_per_unit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Addon {
    pub id: String,
    pub name: String,
    pub price: f64,
}

/// Tagged union over the five catalog entity types, used by the storage
/// port's generic catalog operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CatalogRecord {
    Product(Product),
    Flavor(Flavor),
    Material(Material),
    Ingredient(Ingredient),
    Addon(Addon),
}

impl CatalogRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            CatalogRecord::Product(_) => EntityKind::Product,
            CatalogRecord::Flavor(_) => EntityKind::Flavor,
            CatalogRecord::Material(_) => EntityKind::Material,
            CatalogRecord::Ingredient(_) => EntityKind::Ingredient,
            CatalogRecord::Addon(_) => EntityKind::Addon,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            CatalogRecord::Product(p) => &p.id,
            CatalogRecord::Flavor(f) => &f.id,
            CatalogRecord::Material(m) => &m.id,
            CatalogRecord::Ingredient(i) => &i.id,
            CatalogRecord::Addon(a) => &a.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            CatalogRecord::Product(p) => &p.name,
            CatalogRecord::Flavor(f) => &f.name,
            CatalogRecord::Material(m) => &m.name,
            CatalogRecord::Ingredient(i) => &i.name,
            CatalogRecord::Addon(a) => &a.name,
        }
    }

    pub(crate) fn set_id(&mut self, id: String) {
        match self {
            CatalogRecord::Product(p) => p.id = id,
            CatalogRecord::Flavor(f) => f.id = id,
            CatalogRecord::Material(m) => m.id = id,
            CatalogRecord::Ingredient(i) => i.id = id,
            CatalogRecord::Addon(a) => a.id = id,
        }
    }
}

/// Normalized uniqueness key for catalog names: trimmed and lowercased.
/// Maintained alongside the display name and enforced by `UNIQUE(name_key)`
/// on the SQLite side.
pub fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// `price_per_unit = price_per_purchase / units_per_purchase`, 0 when the
/// lot size is zero or not finite.
pub fn derived_unit_price(price_per_purchase: f64, units_per_purchase: f64) -> f64 {
    if units_per_purchase > 0.0 && units_per_purchase.is_finite() {
        price_per_purchase / units_per_purchase
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Stock
// ---------------------------------------------------------------------------

/// Which catalog entity types participate in inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StockItemType {
    Addon,
    Ingredient,
    Material,
}

impl StockItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StockItemType::Addon => "addon",
            StockItemType::Ingredient => "ingredient",
            StockItemType::Material => "material",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "addon" => Some(StockItemType::Addon),
            "ingredient" => Some(StockItemType::Ingredient),
            "material" => Some(StockItemType::Material),
            _ => None,
        }
    }
}

impl std::fmt::Display for StockItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current on-hand quantity for one `(item_type, item_id)` pair.
/// Invariant: `quantity >= 0` always.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockRecord {
    pub id: String,
    pub item_type: StockItemType,
    pub item_id: String,
    pub quantity: f64,
    pub updated_at: String,
}

/// One expanded consumption entry produced from a cart line.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumptionEntry {
    pub item_type: StockItemType,
    pub item_id: String,
    pub quantity: f64,
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    DineIn,
    TakeOut,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::DineIn => "dine_in",
            OrderType::TakeOut => "take_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dine_in" => Some(OrderType::DineIn),
            "take_out" => Some(OrderType::TakeOut),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Queuing,
    Served,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Queuing => "queuing",
            OrderStatus::Served => "served",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queuing" => Some(OrderStatus::Queuing),
            "served" => Some(OrderStatus::Served),
            "cancelled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }
}

/// Add-on line inside an order item snapshot. Name and price are copied at
/// commit time so later catalog edits never change historical orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemAddon {
    pub addon_id: String,
    pub name: String,
    pub price: f64,
    pub quantity: f64,
}

/// Immutable snapshot of one cart line as it existed at order time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub product_id: String,
    pub product_name: String,
    #[serde(default)]
    pub flavor_id: Option<String>,
    #[serde(default)]
    pub flavor_name: Option<String>,
    pub size_id: String,
    pub size_name: String,
    pub size_price: f64,
    pub quantity: f64,
    #[serde(default)]
    pub addons: Vec<OrderItemAddon>,
}

impl OrderItem {
    /// Line total: size price x quantity plus each add-on's price x its
    /// own quantity.
    pub fn line_total(&self) -> f64 {
        let addons: f64 = self.addons.iter().map(|a| a.price * a.quantity).sum();
        self.size_price * self.quantity + addons
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub order_type: OrderType,
    pub order_status: OrderStatus,
    pub total: f64,
    pub paid: f64,
    pub change: f64,
    pub items: Vec<OrderItem>,
    pub created_at: String,
}

/// Filter for order listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderFilter {
    All,
    Today,
}

// ---------------------------------------------------------------------------
// Cart (commit pipeline input)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartAddon {
    pub addon_id: String,
    pub quantity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub product_id: String,
    pub size_id: String,
    #[serde(default)]
    pub flavor_id: Option<String>,
    pub quantity: f64,
    #[serde(default)]
    pub addons: Vec<CartAddon>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cart {
    pub order_type: OrderType,
    pub lines: Vec<CartLine>,
    pub paid: f64,
    /// Counter-service flows pay in full at commit; set to `false` for
    /// flows that settle later.
    #[serde(default = "default_true")]
    pub require_full_payment: bool,
}

// ---------------------------------------------------------------------------
// Cash flow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Inflow,
    Outflow,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Inflow => "inflow",
            TransactionType::Outflow => "outflow",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inflow" => Some(TransactionType::Inflow),
            "outflow" => Some(TransactionType::Outflow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CashFlowCategory {
    OrderPayment,
    CashDeposit,
    StockPurchase,
    Expense,
    Refund,
    CashAdjustment,
}

impl CashFlowCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            CashFlowCategory::OrderPayment => "order_payment",
            CashFlowCategory::CashDeposit => "cash_deposit",
            CashFlowCategory::StockPurchase => "stock_purchase",
            CashFlowCategory::Expense => "expense",
            CashFlowCategory::Refund => "refund",
            CashFlowCategory::CashAdjustment => "cash_adjustment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "order_payment" => Some(CashFlowCategory::OrderPayment),
            "cash_deposit" => Some(CashFlowCategory::CashDeposit),
            "stock_purchase" => Some(CashFlowCategory::StockPurchase),
            "expense" => Some(CashFlowCategory::Expense),
            "refund" => Some(CashFlowCategory::Refund),
            "cash_adjustment" => Some(CashFlowCategory::CashAdjustment),
            _ => None,
        }
    }

    pub const ALL: [CashFlowCategory; 6] = [
        CashFlowCategory::OrderPayment,
        CashFlowCategory::CashDeposit,
        CashFlowCategory::StockPurchase,
        CashFlowCategory::Expense,
        CashFlowCategory::Refund,
        CashFlowCategory::CashAdjustment,
    ];
}

/// Immutable cash-flow ledger entry. `amount` is always stored non-negative;
/// the direction is carried by `tx_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashFlowTransaction {
    pub id: String,
    pub tx_type: TransactionType,
    pub amount: f64,
    pub category: CashFlowCategory,
    #[serde(default)]
    pub order_id: Option<String>,
    pub description: String,
    #[serde(default)]
    pub created_by: Option<String>,
    pub created_at: String,
}

/// Time window for cash-flow summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryPeriod {
    Today,
    Week,
    Month,
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_key_normalizes_case_and_whitespace() {
        assert_eq!(name_key("  Iced Coffee "), "iced coffee");
        assert_eq!(name_key("ICED COFFEE"), name_key("iced coffee"));
    }

    #[test]
    fn test_derived_unit_price() {
        assert_eq!(derived_unit_price(250.0, 1000.0), 0.25);
        assert_eq!(derived_unit_price(250.0, 0.0), 0.0);
        assert_eq!(derived_unit_price(250.0, f64::NAN), 0.0);
    }

    #[test]
    fn test_order_item_line_total_includes_addons() {
        let item = OrderItem {
            product_id: "p1".into(),
            product_name: "Iced Coffee".into(),
            flavor_id: None,
            flavor_name: None,
            size_id: "s1".into(),
            size_name: "Large".into(),
            size_price: 120.0,
            quantity: 1.0,
            addons: vec![OrderItemAddon {
                addon_id: "a1".into(),
                name: "Extra Shot".into(),
                price: 15.0,
                quantity: 1.0,
            }],
        };
        assert_eq!(item.line_total(), 135.0);
    }

    #[test]
    fn test_catalog_record_roundtrips_as_tagged_json() {
        let rec = CatalogRecord::Addon(Addon {
            id: "a1".into(),
            name: "Extra Shot".into(),
            price: 15.0,
        });
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"kind\":\"addon\""));
        let back: CatalogRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn test_cart_defaults_require_full_payment() {
        let cart: Cart = serde_json::from_str(
            r#"{"orderType":"dine_in","lines":[],"paid":0.0}"#,
        )
        .unwrap();
        assert!(cart.require_full_payment);
    }
}

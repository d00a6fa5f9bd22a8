//! Order commit pipeline.
//!
//! Takes a validated cart through consumption expansion, stock deduction,
//! order persistence, and payment recording as one logical unit of work:
//! `DRAFT → (validate) → COMMITTED | REJECTED`. Rejected carts have no side
//! effects. Under the SQLite backend the unit of work is a real database
//! transaction; under the fallback backend the steps run as independent
//! read-mutate-write operations with no rollback on partial failure: a
//! crash between stock deduction and order persistence leaves stock
//! decremented with no corresponding order. That limitation is part of the
//! fallback contract and is pinned down by the tests at the bottom of this
//! file.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cashflow::CashFlowLedger;
use crate::error::{EngineError, EngineResult, StorageError};
use crate::models::{
    Cart, CartLine, CashFlowCategory, CashFlowTransaction, CatalogRecord, ConsumptionEntry,
    EntityKind, Order, OrderFilter, OrderItem, OrderItemAddon, OrderStatus, StockItemType,
};
use crate::stock::{StockDeduction, StockLedger};
use crate::storage::StorageBackend;

/// Tolerance when comparing paid against total (float sums).
const PAYMENT_EPSILON: f64 = 0.001;

/// A committed order plus what its stock deduction reported.
#[derive(Debug)]
pub struct CommittedOrder {
    pub order: Order,
    pub stock: StockDeduction,
    pub payment: Option<CashFlowTransaction>,
}

#[derive(Clone)]
pub struct OrderCommitPipeline {
    backend: Arc<dyn StorageBackend>,
    stock: StockLedger,
    cashflow: CashFlowLedger,
}

impl OrderCommitPipeline {
    pub fn new(backend: Arc<dyn StorageBackend>, stock: StockLedger) -> Self {
        let cashflow = CashFlowLedger::new(backend.clone());
        OrderCommitPipeline {
            backend,
            stock,
            cashflow,
        }
    }

    /// Commit a cart: validate, expand consumption, deduct stock, persist
    /// the order with its immutable item snapshot, and record the payment.
    ///
    /// Stock deduction, order persistence, and the payment append run inside
    /// one unit of work on the active backend. Returns the persisted order
    /// with its generated id.
    pub fn commit(&self, cart: &Cart) -> EngineResult<CommittedOrder> {
        if cart.lines.is_empty() {
            return Err(EngineError::EmptyCart);
        }
        if !cart.paid.is_finite() || cart.paid < 0.0 {
            return Err(EngineError::InvalidAmount);
        }

        // Resolve snapshots and expand consumption before any write so a
        // rejected cart touches nothing.
        let mut items = Vec::with_capacity(cart.lines.len());
        let mut consumption = Vec::new();
        for line in &cart.lines {
            let (item, entries) = self.expand_line(line)?;
            items.push(item);
            consumption.extend(entries);
        }

        let total: f64 = items.iter().map(OrderItem::line_total).sum();
        if cart.require_full_payment && cart.paid + PAYMENT_EPSILON < total {
            return Err(EngineError::InsufficientPayment {
                paid: cart.paid,
                total,
            });
        }
        let change = (cart.paid - total).max(0.0);

        let order = Order {
            id: Uuid::new_v4().to_string(),
            order_type: cart.order_type,
            order_status: OrderStatus::Queuing,
            total,
            paid: cart.paid,
            change,
            items,
            created_at: Utc::now().to_rfc3339(),
        };

        let mut stock_outcome = None;
        let mut payment = None;
        self.backend.run_unit_of_work(&mut |_| {
            let outcome = self.stock.deduct(&consumption).map_err(into_storage)?;
            self.backend.insert_order(&order)?;
            if cart.paid > 0.0 {
                let tx = self
                    .cashflow
                    .record_inflow(
                        cart.paid,
                        CashFlowCategory::OrderPayment,
                        Some(&order.id),
                        "order payment",
                        None,
                    )
                    .map_err(into_storage)?;
                payment = Some(tx);
            }
            stock_outcome = Some(outcome);
            Ok(())
        })?;

        let stock = stock_outcome.unwrap_or_default();
        if !stock.shortfalls.is_empty() {
            warn!(
                order_id = %order.id,
                shortfalls = stock.shortfalls.len(),
                "order committed with oversold items"
            );
        }
        info!(
            order_id = %order.id,
            total = %order.total,
            paid = %order.paid,
            change = %order.change,
            "Order committed"
        );

        Ok(CommittedOrder {
            order,
            stock,
            payment,
        })
    }

    /// Status-only transition (QUEUING → SERVED, …). Never re-runs stock
    /// deduction or ledger appends; those happen exactly once, at commit.
    /// Returns `false` when the order id is unknown.
    pub fn update_status(&self, id: &str, status: OrderStatus) -> EngineResult<bool> {
        let changed = self.backend.set_order_status(id, status)?;
        if changed {
            info!(order_id = %id, status = %status.as_str(), "order status updated");
        }
        Ok(changed)
    }

    pub fn get(&self, id: &str) -> EngineResult<Option<Order>> {
        Ok(self.backend.order_by_id(id)?)
    }

    /// Orders, newest first.
    pub fn list(&self, filter: OrderFilter) -> EngineResult<Vec<Order>> {
        Ok(self.backend.list_orders(filter)?)
    }

    /// Resolve one cart line into its immutable snapshot and consumption
    /// entries. Each ordered unit consumes the size's recipe; each selected
    /// add-on consumes its own quantity directly, no recipe multiplier.
    fn expand_line(&self, line: &CartLine) -> EngineResult<(OrderItem, Vec<ConsumptionEntry>)> {
        if !line.quantity.is_finite() || line.quantity < 1.0 {
            return Err(EngineError::InvalidQuantity);
        }

        let product = match self
            .backend
            .catalog_by_id(EntityKind::Product, &line.product_id)?
        {
            Some(CatalogRecord::Product(p)) => p,
            _ => {
                return Err(EngineError::UnknownReference {
                    kind: "product",
                    id: line.product_id.clone(),
                })
            }
        };

        let size = product
            .sizes
            .iter()
            .find(|s| s.id == line.size_id)
            .ok_or_else(|| EngineError::UnknownReference {
                kind: "size",
                id: line.size_id.clone(),
            })?;

        let flavor_name = match &line.flavor_id {
            Some(flavor_id) => {
                let flavor = self
                    .backend
                    .catalog_by_id(EntityKind::Flavor, flavor_id)?
                    .ok_or_else(|| EngineError::UnknownReference {
                        kind: "flavor",
                        id: flavor_id.clone(),
                    })?;
                Some(flavor.name().to_string())
            }
            None => None,
        };

        let mut entries = Vec::new();
        for recipe in &size.materials {
            entries.push(ConsumptionEntry {
                item_type: StockItemType::Material,
                item_id: recipe.item_id.clone(),
                quantity: recipe.quantity_per_unit * line.quantity,
            });
        }
        for recipe in &size.ingredients {
            entries.push(ConsumptionEntry {
                item_type: StockItemType::Ingredient,
                item_id: recipe.item_id.clone(),
                quantity: recipe.quantity_per_unit * line.quantity,
            });
        }

        let mut addons = Vec::with_capacity(line.addons.len());
        for cart_addon in &line.addons {
            if !cart_addon.quantity.is_finite() || cart_addon.quantity <= 0.0 {
                return Err(EngineError::InvalidQuantity);
            }
            let addon = match self
                .backend
                .catalog_by_id(EntityKind::Addon, &cart_addon.addon_id)?
            {
                Some(CatalogRecord::Addon(a)) => a,
                _ => {
                    return Err(EngineError::UnknownReference {
                        kind: "addon",
                        id: cart_addon.addon_id.clone(),
                    })
                }
            };
            entries.push(ConsumptionEntry {
                item_type: StockItemType::Addon,
                item_id: addon.id.clone(),
                quantity: cart_addon.quantity,
            });
            addons.push(OrderItemAddon {
                addon_id: addon.id,
                name: addon.name,
                price: addon.price,
                quantity: cart_addon.quantity,
            });
        }

        let item = OrderItem {
            product_id: product.id,
            product_name: product.name,
            flavor_id: line.flavor_id.clone(),
            flavor_name,
            size_id: size.id.clone(),
            size_name: size.name.clone(),
            size_price: size.price,
            quantity: line.quantity,
            addons,
        };
        Ok((item, entries))
    }
}

fn into_storage(e: EngineError) -> StorageError {
    match e {
        EngineError::Storage(s) => s,
        other => StorageError::Backend(other.to_string()),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogStore;
    use crate::models::{
        Addon, CartAddon, Ingredient, Material, OrderType, Product, RecipeEntry, Size,
        TransactionType,
    };
    use crate::storage::local::LocalBackend;
    use crate::storage::sqlite::SqliteBackend;
    use crate::storage::testutil::{all_backends, unique_temp_dir, FailingOrderInsert};

    /// A catalog with the worked example from the dashboard team:
    /// Iced Coffee / Large at 120 consuming one 12oz cup and 10g of beans,
    /// plus an Extra Shot add-on at 15.
    struct Fixture {
        backend: Arc<dyn StorageBackend>,
        pipeline: OrderCommitPipeline,
        product_id: String,
        size_id: String,
        cup_id: String,
        beans_id: String,
        shot_id: String,
    }

    fn fixture(backend: Arc<dyn StorageBackend>) -> Fixture {
        let catalog = CatalogStore::new(backend.clone());
        let stock = StockLedger::new(backend.clone());

        let cup = catalog
            .create(CatalogRecord::Material(Material {
                id: String::new(),
                name: "12oz Cup".into(),
                unit: Some("pc".into()),
                price_per_purchase: 500.0,
                units_per_purchase: 100.0,
                price_per_unit: 0.0,
            }))
            .unwrap();
        let beans = catalog
            .create(CatalogRecord::Ingredient(Ingredient {
                id: String::new(),
                name: "Coffee Beans".into(),
                unit: Some("g".into()),
                price_per_purchase: 250.0,
                units_per_purchase: 1000.0,
                price_per_unit: 0.0,
            }))
            .unwrap();
        let shot = catalog
            .create(CatalogRecord::Addon(Addon {
                id: String::new(),
                name: "Extra Shot".into(),
                price: 15.0,
            }))
            .unwrap();

        let size_id = Uuid::new_v4().to_string();
        let product = catalog
            .create(CatalogRecord::Product(Product {
                id: String::new(),
                name: "Iced Coffee".into(),
                category: Some("coffee".into()),
                image_url: None,
                sizes: vec![Size {
                    id: size_id.clone(),
                    name: "Large".into(),
                    price: 120.0,
                    materials: vec![RecipeEntry {
                        item_id: cup.id().to_string(),
                        quantity_per_unit: 1.0,
                    }],
                    ingredients: vec![RecipeEntry {
                        item_id: beans.id().to_string(),
                        quantity_per_unit: 10.0,
                    }],
                }],
                flavor_ids: vec![],
            }))
            .unwrap();

        stock
            .set_quantity(StockItemType::Material, cup.id(), 300.0)
            .unwrap();
        stock
            .set_quantity(StockItemType::Ingredient, beans.id(), 1000.0)
            .unwrap();
        stock
            .set_quantity(StockItemType::Addon, shot.id(), 50.0)
            .unwrap();

        Fixture {
            pipeline: OrderCommitPipeline::new(backend.clone(), stock),
            backend,
            product_id: product.id().to_string(),
            size_id,
            cup_id: cup.id().to_string(),
            beans_id: beans.id().to_string(),
            shot_id: shot.id().to_string(),
        }
    }

    fn cart(fx: &Fixture, quantity: f64, paid: f64, with_shot: bool) -> Cart {
        Cart {
            order_type: OrderType::DineIn,
            lines: vec![CartLine {
                product_id: fx.product_id.clone(),
                size_id: fx.size_id.clone(),
                flavor_id: None,
                quantity,
                addons: if with_shot {
                    vec![CartAddon {
                        addon_id: fx.shot_id.clone(),
                        quantity: 1.0,
                    }]
                } else {
                    vec![]
                },
            }],
            paid,
            require_full_payment: true,
        }
    }

    fn stock_qty(fx: &Fixture, item_type: StockItemType, id: &str) -> f64 {
        fx.backend
            .stock_for(item_type, id)
            .unwrap()
            .map(|r| r.quantity)
            .unwrap_or(0.0)
    }

    #[test]
    fn test_commit_worked_example() {
        for backend in all_backends() {
            let fx = fixture(Arc::from(backend));
            let committed = fx.pipeline.commit(&cart(&fx, 1.0, 150.0, true)).unwrap();

            let order = &committed.order;
            assert_eq!(order.total, 135.0);
            assert_eq!(order.change, 15.0);
            assert_eq!(order.order_status, OrderStatus::Queuing);
            assert_eq!(order.items.len(), 1);
            assert_eq!(order.items[0].size_price, 120.0);
            assert_eq!(order.items[0].addons[0].price, 15.0);

            assert_eq!(stock_qty(&fx, StockItemType::Material, &fx.cup_id), 299.0);
            assert_eq!(stock_qty(&fx, StockItemType::Ingredient, &fx.beans_id), 990.0);
            assert_eq!(stock_qty(&fx, StockItemType::Addon, &fx.shot_id), 49.0);

            // One inflow of the full paid amount, referencing the order
            let txs = fx.backend.list_transactions(None).unwrap();
            assert_eq!(txs.len(), 1);
            assert_eq!(txs[0].tx_type, TransactionType::Inflow);
            assert_eq!(txs[0].amount, 150.0);
            assert_eq!(txs[0].order_id.as_deref(), Some(order.id.as_str()));

            // Drawer balance rose by the payment
            let ledger = CashFlowLedger::new(fx.backend.clone());
            assert_eq!(ledger.balance().unwrap(), 150.0);

            // And the order is queryable with its snapshot intact
            let stored = fx.pipeline.get(&order.id).unwrap().expect("stored order");
            assert_eq!(&stored, order);
        }
    }

    #[test]
    fn test_order_total_matches_line_sum() {
        for backend in all_backends() {
            let fx = fixture(Arc::from(backend));
            let committed = fx.pipeline.commit(&cart(&fx, 3.0, 500.0, true)).unwrap();
            // 3 x 120 + 1 x 15
            assert_eq!(committed.order.total, 375.0);
            assert_eq!(committed.order.change, 125.0);
            // Recipe scales with quantity, add-on does not
            assert_eq!(stock_qty(&fx, StockItemType::Material, &fx.cup_id), 297.0);
            assert_eq!(stock_qty(&fx, StockItemType::Ingredient, &fx.beans_id), 970.0);
            assert_eq!(stock_qty(&fx, StockItemType::Addon, &fx.shot_id), 49.0);
        }
    }

    #[test]
    fn test_empty_cart_rejected_without_side_effects() {
        for backend in all_backends() {
            let fx = fixture(Arc::from(backend));
            let empty = Cart {
                order_type: OrderType::TakeOut,
                lines: vec![],
                paid: 100.0,
                require_full_payment: true,
            };
            assert!(matches!(
                fx.pipeline.commit(&empty),
                Err(EngineError::EmptyCart)
            ));
            assert!(fx.pipeline.list(OrderFilter::All).unwrap().is_empty());
            assert!(fx.backend.list_transactions(None).unwrap().is_empty());
        }
    }

    #[test]
    fn test_insufficient_payment_rejected_without_side_effects() {
        for backend in all_backends() {
            let fx = fixture(Arc::from(backend));
            let result = fx.pipeline.commit(&cart(&fx, 1.0, 100.0, true));
            match result {
                Err(EngineError::InsufficientPayment { paid, total }) => {
                    assert_eq!(paid, 100.0);
                    assert_eq!(total, 135.0);
                }
                other => panic!("expected InsufficientPayment, got {other:?}"),
            }
            // No deduction, no order, no transaction
            assert_eq!(stock_qty(&fx, StockItemType::Material, &fx.cup_id), 300.0);
            assert!(fx.pipeline.list(OrderFilter::All).unwrap().is_empty());
            assert!(fx.backend.list_transactions(None).unwrap().is_empty());
        }
    }

    #[test]
    fn test_partial_payment_allowed_when_not_required_up_front() {
        for backend in all_backends() {
            let fx = fixture(Arc::from(backend));
            let mut c = cart(&fx, 1.0, 50.0, false);
            c.require_full_payment = false;
            let committed = fx.pipeline.commit(&c).unwrap();
            assert_eq!(committed.order.total, 120.0);
            assert_eq!(committed.order.paid, 50.0);
            assert_eq!(committed.order.change, 0.0);
            // Partial payment still recorded
            let txs = fx.backend.list_transactions(None).unwrap();
            assert_eq!(txs.len(), 1);
            assert_eq!(txs[0].amount, 50.0);
        }
    }

    #[test]
    fn test_zero_payment_appends_no_transaction() {
        for backend in all_backends() {
            let fx = fixture(Arc::from(backend));
            let mut c = cart(&fx, 1.0, 0.0, false);
            c.require_full_payment = false;
            let committed = fx.pipeline.commit(&c).unwrap();
            assert!(committed.payment.is_none());
            assert!(fx.backend.list_transactions(None).unwrap().is_empty());
        }
    }

    #[test]
    fn test_unknown_references_rejected() {
        for backend in all_backends() {
            let fx = fixture(Arc::from(backend));

            let mut bad_product = cart(&fx, 1.0, 200.0, false);
            bad_product.lines[0].product_id = "missing".into();
            assert!(matches!(
                fx.pipeline.commit(&bad_product),
                Err(EngineError::UnknownReference { kind: "product", .. })
            ));

            let mut bad_size = cart(&fx, 1.0, 200.0, false);
            bad_size.lines[0].size_id = "missing".into();
            assert!(matches!(
                fx.pipeline.commit(&bad_size),
                Err(EngineError::UnknownReference { kind: "size", .. })
            ));

            let mut bad_addon = cart(&fx, 1.0, 200.0, true);
            bad_addon.lines[0].addons[0].addon_id = "missing".into();
            assert!(matches!(
                fx.pipeline.commit(&bad_addon),
                Err(EngineError::UnknownReference { kind: "addon", .. })
            ));

            assert!(fx.pipeline.list(OrderFilter::All).unwrap().is_empty());
        }
    }

    #[test]
    fn test_oversell_clamps_stock_and_still_commits() {
        for backend in all_backends() {
            let fx = fixture(Arc::from(backend));
            let stock = StockLedger::new(fx.backend.clone());
            stock
                .set_quantity(StockItemType::Material, &fx.cup_id, 2.0)
                .unwrap();

            let committed = fx.pipeline.commit(&cart(&fx, 5.0, 600.0, false)).unwrap();
            assert_eq!(stock_qty(&fx, StockItemType::Material, &fx.cup_id), 0.0);
            assert_eq!(committed.stock.shortfalls.len(), 1);
            assert_eq!(committed.stock.shortfalls[0].requested, 5.0);
            assert_eq!(committed.stock.shortfalls[0].available, 2.0);
            // The sale went through regardless
            assert_eq!(fx.pipeline.list(OrderFilter::All).unwrap().len(), 1);
        }
    }

    #[test]
    fn test_same_ingredient_across_lines_is_summed() {
        for backend in all_backends() {
            let fx = fixture(Arc::from(backend));
            let c = Cart {
                order_type: OrderType::DineIn,
                lines: vec![
                    CartLine {
                        product_id: fx.product_id.clone(),
                        size_id: fx.size_id.clone(),
                        flavor_id: None,
                        quantity: 1.0,
                        addons: vec![],
                    },
                    CartLine {
                        product_id: fx.product_id.clone(),
                        size_id: fx.size_id.clone(),
                        flavor_id: None,
                        quantity: 2.0,
                        addons: vec![],
                    },
                ],
                paid: 400.0,
                require_full_payment: true,
            };
            fx.pipeline.commit(&c).unwrap();
            assert_eq!(stock_qty(&fx, StockItemType::Ingredient, &fx.beans_id), 970.0);
            assert_eq!(stock_qty(&fx, StockItemType::Material, &fx.cup_id), 297.0);
        }
    }

    #[test]
    fn test_update_status_does_not_rerun_deduction_or_payment() {
        for backend in all_backends() {
            let fx = fixture(Arc::from(backend));
            let committed = fx.pipeline.commit(&cart(&fx, 1.0, 150.0, true)).unwrap();

            assert!(fx
                .pipeline
                .update_status(&committed.order.id, OrderStatus::Served)
                .unwrap());

            assert_eq!(stock_qty(&fx, StockItemType::Material, &fx.cup_id), 299.0);
            assert_eq!(fx.backend.list_transactions(None).unwrap().len(), 1);
            let stored = fx.pipeline.get(&committed.order.id).unwrap().unwrap();
            assert_eq!(stored.order_status, OrderStatus::Served);

            assert!(!fx
                .pipeline
                .update_status("missing", OrderStatus::Served)
                .unwrap());
        }
    }

    #[test]
    fn test_snapshot_survives_catalog_edits() {
        for backend in all_backends() {
            let fx = fixture(Arc::from(backend));
            let committed = fx.pipeline.commit(&cart(&fx, 1.0, 150.0, true)).unwrap();

            // Delete the add-on and the material after the sale
            let catalog = CatalogStore::new(fx.backend.clone());
            catalog.delete(EntityKind::Addon, &fx.shot_id).unwrap();
            catalog.delete(EntityKind::Material, &fx.cup_id).unwrap();

            let stored = fx.pipeline.get(&committed.order.id).unwrap().unwrap();
            assert_eq!(stored.items[0].addons[0].name, "Extra Shot");
            assert_eq!(stored.items[0].addons[0].price, 15.0);
            assert_eq!(stored.total, 135.0);
        }
    }

    // ------------------------------------------------------------------
    // Atomicity divergence between the two backends
    // ------------------------------------------------------------------

    #[test]
    fn test_sqlite_commit_failure_rolls_back_stock_deduction() {
        let inner: Arc<dyn StorageBackend> =
            Arc::new(SqliteBackend::open_in_memory().unwrap());
        let fx = fixture(inner.clone());

        let failing: Arc<dyn StorageBackend> =
            Arc::new(FailingOrderInsert { inner });
        let stock = StockLedger::new(failing.clone());
        let pipeline = OrderCommitPipeline::new(failing.clone(), stock);

        let result = pipeline.commit(&cart(&fx, 1.0, 150.0, true));
        assert!(result.is_err());

        // Transactional backend: the deduction rolled back with the order
        assert_eq!(stock_qty(&fx, StockItemType::Material, &fx.cup_id), 300.0);
        assert!(failing.list_transactions(None).unwrap().is_empty());
        assert!(failing.list_orders(OrderFilter::All).unwrap().is_empty());
    }

    #[test]
    fn test_fallback_commit_failure_leaves_stock_deducted() {
        let dir = unique_temp_dir();
        let inner: Arc<dyn StorageBackend> = Arc::new(LocalBackend::new(&dir).unwrap());
        let fx = fixture(inner.clone());

        let failing: Arc<dyn StorageBackend> =
            Arc::new(FailingOrderInsert { inner });
        let stock = StockLedger::new(failing.clone());
        let pipeline = OrderCommitPipeline::new(failing.clone(), stock);

        let result = pipeline.commit(&cart(&fx, 1.0, 150.0, true));
        assert!(result.is_err());

        // Fallback backend: no rollback. Stock stays decremented with no
        // corresponding order. This is the documented partial-commit risk.
        assert_eq!(stock_qty(&fx, StockItemType::Material, &fx.cup_id), 299.0);
        assert!(failing.list_orders(OrderFilter::All).unwrap().is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }
}

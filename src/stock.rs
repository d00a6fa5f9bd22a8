//! Stock ledger: per-item on-hand quantities.
//!
//! Deduction clamps at zero instead of rejecting the order. That is the
//! `ALLOW_OVERSELL` policy: a sale is never blocked by missing stock, and
//! the shortfall is reported to the caller and to the low-stock listener
//! instead of failing the commit. Low-stock crossings are fire-and-forget
//! signals for the surrounding alerting UI and take no part in the commit's
//! atomicity contract.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::{ConsumptionEntry, StockItemType, StockRecord};
use crate::storage::StorageBackend;

/// Named policy: deductions exceeding available stock floor at zero and the
/// order still commits.
pub const ALLOW_OVERSELL: bool = true;

/// Settings key for the low-stock alert threshold.
const LOW_STOCK_THRESHOLD_KEY: &str = "low_stock_threshold";

/// Default alert threshold when none is configured.
const DEFAULT_LOW_STOCK_THRESHOLD: f64 = 10.0;

/// A deduction request that exceeded available stock. Reported, never fatal.
#[derive(Debug, Clone, PartialEq)]
pub struct StockShortfall {
    pub item_type: StockItemType,
    pub item_id: String,
    pub requested: f64,
    pub available: f64,
}

/// Emitted when a deduction takes an item from above the threshold to at or
/// below it.
#[derive(Debug, Clone, PartialEq)]
pub struct LowStockAlert {
    pub item_type: StockItemType,
    pub item_id: String,
    pub quantity: f64,
    pub threshold: f64,
}

/// Outcome of one deduction pass.
#[derive(Debug, Default)]
pub struct StockDeduction {
    /// `(item_type, item_id, new_quantity)` for every record written back.
    pub applied: Vec<(StockItemType, String, f64)>,
    pub shortfalls: Vec<StockShortfall>,
    pub low_stock: Vec<LowStockAlert>,
}

pub type LowStockListener = Arc<dyn Fn(&LowStockAlert) + Send + Sync>;

#[derive(Clone)]
pub struct StockLedger {
    backend: Arc<dyn StorageBackend>,
    listener: Option<LowStockListener>,
}

impl StockLedger {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        StockLedger {
            backend,
            listener: None,
        }
    }

    /// Register a fire-and-forget low-stock listener (alerting UI hook).
    pub fn with_low_stock_listener(mut self, listener: LowStockListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Deduct consumption entries from stock.
    ///
    /// Entries are grouped by `(item_type, item_id)` with quantities summed
    /// (a cart can reach the same ingredient through several lines), then
    /// each group is written back as `max(0, current − used)`. Items without
    /// a stock record are skipped; there is nothing to deduct from.
    pub fn deduct(&self, entries: &[ConsumptionEntry]) -> EngineResult<StockDeduction> {
        let threshold = self.threshold()?;
        let now = Utc::now().to_rfc3339();

        // BTreeMap for a deterministic write order
        let mut grouped: BTreeMap<(&'static str, String), (StockItemType, f64)> = BTreeMap::new();
        for entry in entries {
            let slot = grouped
                .entry((entry.item_type.as_str(), entry.item_id.clone()))
                .or_insert((entry.item_type, 0.0));
            slot.1 += entry.quantity;
        }

        let mut outcome = StockDeduction::default();
        for ((_, item_id), (item_type, used)) in grouped {
            let record = match self.backend.stock_for(item_type, &item_id)? {
                Some(r) => r,
                None => {
                    warn!(item_type = %item_type, item_id = %item_id, "no stock record, skipping deduction");
                    continue;
                }
            };

            let current = record.quantity;
            let new_quantity = (current - used).max(0.0);
            if used > current {
                outcome.shortfalls.push(StockShortfall {
                    item_type,
                    item_id: item_id.clone(),
                    requested: used,
                    available: current,
                });
                warn!(
                    item_type = %item_type,
                    item_id = %item_id,
                    requested = %used,
                    available = %current,
                    "stock shortfall clamped to zero"
                );
            }

            self.backend.put_stock(&StockRecord {
                id: record.id,
                item_type,
                item_id: item_id.clone(),
                quantity: new_quantity,
                updated_at: now.clone(),
            })?;

            if new_quantity <= threshold && current > threshold {
                let alert = LowStockAlert {
                    item_type,
                    item_id: item_id.clone(),
                    quantity: new_quantity,
                    threshold,
                };
                warn!(
                    item_type = %item_type,
                    item_id = %item_id,
                    quantity = %new_quantity,
                    threshold = %threshold,
                    "stock fell to low level"
                );
                if let Some(listener) = &self.listener {
                    listener(&alert);
                }
                outcome.low_stock.push(alert);
            }

            outcome.applied.push((item_type, item_id, new_quantity));
        }

        Ok(outcome)
    }

    /// Unconditional administrative override (stock-adjustment UI). Creates
    /// the record when absent. Negative or non-finite quantities are
    /// rejected before touching storage.
    pub fn set_quantity(
        &self,
        item_type: StockItemType,
        item_id: &str,
        quantity: f64,
    ) -> EngineResult<StockRecord> {
        if !quantity.is_finite() || quantity < 0.0 {
            return Err(EngineError::InvalidQuantity);
        }

        let id = match self.backend.stock_for(item_type, item_id)? {
            Some(existing) => existing.id,
            None => Uuid::new_v4().to_string(),
        };
        let record = StockRecord {
            id,
            item_type,
            item_id: item_id.to_string(),
            quantity,
            updated_at: Utc::now().to_rfc3339(),
        };
        self.backend.put_stock(&record)?;
        info!(item_type = %item_type, item_id = %item_id, quantity = %quantity, "stock quantity set");
        Ok(record)
    }

    /// Current quantity, 0 when no record exists.
    pub fn quantity(&self, item_type: StockItemType, item_id: &str) -> EngineResult<f64> {
        Ok(self
            .backend
            .stock_for(item_type, item_id)?
            .map(|r| r.quantity)
            .unwrap_or(0.0))
    }

    pub fn level(
        &self,
        item_type: StockItemType,
        item_id: &str,
    ) -> EngineResult<Option<StockRecord>> {
        Ok(self.backend.stock_for(item_type, item_id)?)
    }

    pub fn list(&self) -> EngineResult<Vec<StockRecord>> {
        Ok(self.backend.list_stock()?)
    }

    fn threshold(&self) -> EngineResult<f64> {
        let configured = self
            .backend
            .get_flag(LOW_STOCK_THRESHOLD_KEY)?
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|t| t.is_finite() && *t >= 0.0);
        Ok(configured.unwrap_or(DEFAULT_LOW_STOCK_THRESHOLD))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

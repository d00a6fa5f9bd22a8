//! Append-only cash-flow ledger and the derived drawer balance.
//!
//! Transactions are immutable once appended; there is no update or delete
//! path. The drawer balance is never stored as mutable state. It is always
//! the fold `Σ inflow − Σ outflow` over the full history, so it cannot
//! drift. A manual "set balance" is itself a transaction: the requested
//! delta is appended as a `cash_adjustment` entry, which keeps the fold
//! invariant intact.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::info;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::{
    CashFlowCategory, CashFlowTransaction, SummaryPeriod, TransactionType,
};
use crate::storage::StorageBackend;

/// Transactions shown in a summary.
const RECENT_LIMIT: usize = 50;

/// Tolerance for "the balance already matches the target".
const BALANCE_EPSILON: f64 = 0.001;

/// Per-category totals within a summary window.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryTotal {
    pub category: CashFlowCategory,
    pub inflow: f64,
    pub outflow: f64,
}

#[derive(Debug, Clone)]
pub struct CashFlowSummary {
    pub period: SummaryPeriod,
    pub total_inflow: f64,
    pub total_outflow: f64,
    pub net: f64,
    /// Categories that appear in the window, in declaration order.
    pub by_category: Vec<CategoryTotal>,
    /// Most recent transactions in the window, newest first, capped.
    pub recent: Vec<CashFlowTransaction>,
}

#[derive(Clone)]
pub struct CashFlowLedger {
    backend: Arc<dyn StorageBackend>,
}

impl CashFlowLedger {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        CashFlowLedger { backend }
    }

    /// Append an inflow transaction.
    pub fn record_inflow(
        &self,
        amount: f64,
        category: CashFlowCategory,
        order_id: Option<&str>,
        description: &str,
        created_by: Option<&str>,
    ) -> EngineResult<CashFlowTransaction> {
        self.append(TransactionType::Inflow, amount, category, order_id, description, created_by)
    }

    /// Append an expense (outflow, category `expense`). An optional list of
    /// purchased items is folded into the description, since the ledger row
    /// itself carries a single description field.
    pub fn record_expense(
        &self,
        amount: f64,
        description: &str,
        items: Option<&[String]>,
        created_by: Option<&str>,
    ) -> EngineResult<CashFlowTransaction> {
        let description = match items.filter(|items| !items.is_empty()) {
            Some(items) => format!("{description} [{}]", items.join(", ")),
            None => description.to_string(),
        };
        self.append(
            TransactionType::Outflow,
            amount,
            CashFlowCategory::Expense,
            None,
            &description,
            created_by,
        )
    }

    /// Append a stock purchase (outflow, category `stock_purchase`).
    pub fn record_stock_purchase(
        &self,
        amount: f64,
        description: &str,
        created_by: Option<&str>,
    ) -> EngineResult<CashFlowTransaction> {
        self.append(
            TransactionType::Outflow,
            amount,
            CashFlowCategory::StockPurchase,
            None,
            description,
            created_by,
        )
    }

    /// Append a refund (outflow, category `refund`).
    pub fn record_refund(
        &self,
        amount: f64,
        order_id: Option<&str>,
        description: &str,
        created_by: Option<&str>,
    ) -> EngineResult<CashFlowTransaction> {
        self.append(
            TransactionType::Outflow,
            amount,
            CashFlowCategory::Refund,
            order_id,
            description,
            created_by,
        )
    }

    fn append(
        &self,
        tx_type: TransactionType,
        amount: f64,
        category: CashFlowCategory,
        order_id: Option<&str>,
        description: &str,
        created_by: Option<&str>,
    ) -> EngineResult<CashFlowTransaction> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(EngineError::InvalidAmount);
        }
        let tx = CashFlowTransaction {
            id: Uuid::new_v4().to_string(),
            tx_type,
            amount,
            category,
            order_id: order_id.map(str::to_string),
            description: description.to_string(),
            created_by: created_by.map(str::to_string),
            created_at: Utc::now().to_rfc3339(),
        };
        self.backend.append_transaction(&tx)?;
        info!(
            id = %tx.id,
            tx_type = %tx.tx_type.as_str(),
            category = %tx.category.as_str(),
            amount = %tx.amount,
            "cash flow transaction appended"
        );
        Ok(tx)
    }

    /// The drawer balance: always recomputed from the transaction history,
    /// never cached.
    pub fn balance(&self) -> EngineResult<f64> {
        let inflow = self.backend.sum_transactions(TransactionType::Inflow)?;
        let outflow = self.backend.sum_transactions(TransactionType::Outflow)?;
        Ok(inflow - outflow)
    }

    /// Drive the balance to `target` by appending one synthetic
    /// `cash_adjustment` transaction equal to the delta. A zero delta
    /// appends nothing and returns `None`.
    pub fn set_balance(
        &self,
        target: f64,
        reason: &str,
        created_by: Option<&str>,
    ) -> EngineResult<Option<CashFlowTransaction>> {
        if !target.is_finite() {
            return Err(EngineError::InvalidAmount);
        }
        let delta = target - self.balance()?;
        if delta.abs() < BALANCE_EPSILON {
            info!(target = %target, "set_balance is a no-op, balance already matches");
            return Ok(None);
        }
        let tx_type = if delta > 0.0 {
            TransactionType::Inflow
        } else {
            TransactionType::Outflow
        };
        let tx = self.append(
            tx_type,
            delta.abs(),
            CashFlowCategory::CashAdjustment,
            None,
            reason,
            created_by,
        )?;
        Ok(Some(tx))
    }

    /// Totals per direction and per category over the period, plus the most
    /// recent transactions in the window for display.
    pub fn summary(&self, period: SummaryPeriod) -> EngineResult<CashFlowSummary> {
        let cutoff = period_start(period);
        let mut in_window: Vec<CashFlowTransaction> = self
            .backend
            .list_transactions(None)?
            .into_iter()
            .filter(|tx| within(&tx.created_at, &cutoff))
            .collect();

        let mut total_inflow = 0.0;
        let mut total_outflow = 0.0;
        let mut per_category: BTreeMap<&'static str, CategoryTotal> = BTreeMap::new();
        for tx in &in_window {
            let slot = per_category
                .entry(tx.category.as_str())
                .or_insert(CategoryTotal {
                    category: tx.category,
                    inflow: 0.0,
                    outflow: 0.0,
                });
            match tx.tx_type {
                TransactionType::Inflow => {
                    total_inflow += tx.amount;
                    slot.inflow += tx.amount;
                }
                TransactionType::Outflow => {
                    total_outflow += tx.amount;
                    slot.outflow += tx.amount;
                }
            }
        }

        // Stable category order regardless of map key order
        let by_category = CashFlowCategory::ALL
            .iter()
            .filter_map(|c| per_category.remove(c.as_str()))
            .collect();

        in_window.truncate(RECENT_LIMIT);

        Ok(CashFlowSummary {
            period,
            total_inflow,
            total_outflow,
            net: total_inflow - total_outflow,
            by_category,
            recent: in_window,
        })
    }

    /// Recent transactions, newest first.
    pub fn list(&self, limit: Option<usize>) -> EngineResult<Vec<CashFlowTransaction>> {
        Ok(self.backend.list_transactions(limit)?)
    }
}

fn period_start(period: SummaryPeriod) -> DateTime<Utc> {
    let now = Utc::now();
    match period {
        SummaryPeriod::Today => now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|naive| naive.and_utc())
            .unwrap_or(now),
        SummaryPeriod::Week => now - Duration::days(7),
        SummaryPeriod::Month => now - Duration::days(30),
    }
}

/// True when the RFC3339 timestamp falls at or after the cutoff. Rows with
/// unparseable timestamps are kept: better to over-report than to hide
/// money movements.
fn within(created_at: &str, cutoff: &DateTime<Utc>) -> bool {
    match DateTime::parse_from_rfc3339(created_at) {
        Ok(ts) => ts.with_timezone(&Utc) >= *cutoff,
        Err(_) => true,
    }
}

// ===========================================================================
// Tests
// ===========================================================================

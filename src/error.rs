//! Error types for the Brew POS engine.
//!
//! Two layers: [`StorageError`] for backend faults (SQLite, file I/O, JSON)
//! and [`EngineError`] for the validation taxonomy surfaced to callers.
//! "Not found" is not an error anywhere in the engine (reads return
//! `Option`, deletes return `bool`), and "already exists" never raises
//! because the catalog resolves duplicates by silent reuse.

use thiserror::Error;

/// Unexpected backend failures. These propagate to the caller unchanged;
/// partial-commit risk under the fallback backend is documented, not
/// auto-recovered.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage lock poisoned")]
    LockPoisoned,

    #[error("{0}")]
    Backend(String),
}

/// Validation and orchestration errors. Commits rejected with one of the
/// validation variants have no side effects.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cart is empty")]
    EmptyCart,

    #[error("payment {paid:.2} is less than order total {total:.2}")]
    InsufficientPayment { paid: f64, total: f64 },

    #[error("unknown {kind} id: {id}")]
    UnknownReference { kind: &'static str, id: String },

    #[error("quantity must be a non-negative finite number")]
    InvalidQuantity,

    #[error("amount must be a positive finite number")]
    InvalidAmount,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type StorageResult<T> = Result<T, StorageError>;
pub type EngineResult<T> = Result<T, EngineError>;

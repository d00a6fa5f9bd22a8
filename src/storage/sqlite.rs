//! Transactional storage backend on embedded SQLite.
//!
//! Uses rusqlite with WAL mode. Schema enforces what the engine promises:
//! `UNIQUE(name_key)` per catalog table (case-folded names), CHECK
//! constraints on prices/quantities, and foreign-key cascade deletes for
//! product-owned rows. Provides versioned migrations tracked in a
//! `schema_version` table and a `local_settings` category/key/value store
//! for engine flags.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{error, info, warn};

use crate::error::{StorageError, StorageResult};
use crate::models::{
    Addon, CashFlowTransaction, CashFlowCategory, CatalogRecord, EntityKind, Flavor, Ingredient,
    Material, Order, OrderFilter, OrderItem, OrderStatus, OrderType, Product, RecipeEntry, Size,
    StockItemType, StockRecord, TransactionType, name_key,
};
use crate::storage::StorageBackend;

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Settings category holding engine flags (migration guard, thresholds).
const FLAG_CATEGORY: &str = "system";

/// SQLite-backed implementation of the storage port.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl SqliteBackend {
    /// Open (or create) the database at `{data_dir}/pos.db`.
    ///
    /// Creates the directory if needed, opens the connection, sets pragmas,
    /// and runs any pending migrations. On corruption or open failure,
    /// deletes the file and retries once.
    pub fn open(data_dir: &Path) -> StorageResult<Self> {
        fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("pos.db");
        info!("Opening database at {}", db_path.display());

        let conn = match open_and_configure(&db_path) {
            Ok(c) => c,
            Err(first_err) => {
                warn!(
                    "Database open failed ({}), deleting and retrying once",
                    first_err
                );
                if db_path.exists() {
                    let _ = fs::remove_file(&db_path);
                    let _ = fs::remove_file(db_path.with_extension("db-wal"));
                    let _ = fs::remove_file(db_path.with_extension("db-shm"));
                }
                open_and_configure(&db_path)?
            }
        };

        run_migrations(&conn)?;

        info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

        Ok(SqliteBackend {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    /// In-memory database with migrations applied (tests, throwaway use).
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )?;
        run_migrations(&conn)?;
        Ok(SqliteBackend {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> StorageResult<Connection> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: catalog tables, stock, and local settings.
fn migrate_v1(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- catalog: products and their owned variants
        CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            name_key TEXT NOT NULL UNIQUE,
            category TEXT,
            image_url TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sizes (
            id TEXT PRIMARY KEY,
            product_id TEXT NOT NULL,
            name TEXT NOT NULL,
            price REAL NOT NULL CHECK (price >= 0),
            position INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(product_id) REFERENCES products(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS size_materials (
            size_id TEXT NOT NULL,
            material_id TEXT NOT NULL,
            qty REAL NOT NULL CHECK (qty >= 0),
            FOREIGN KEY(size_id) REFERENCES sizes(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS size_ingredients (
            size_id TEXT NOT NULL,
            ingredient_id TEXT NOT NULL,
            qty REAL NOT NULL CHECK (qty >= 0),
            FOREIGN KEY(size_id) REFERENCES sizes(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS product_flavors (
            product_id TEXT NOT NULL,
            flavor_id TEXT NOT NULL,
            PRIMARY KEY(product_id, flavor_id),
            FOREIGN KEY(product_id) REFERENCES products(id) ON DELETE CASCADE
        );

        -- catalog: flat entities
        CREATE TABLE IF NOT EXISTS flavors (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            name_key TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS materials (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            name_key TEXT NOT NULL UNIQUE,
            unit TEXT,
            price_per_purchase REAL NOT NULL DEFAULT 0 CHECK (price_per_purchase >= 0),
            units_per_purchase REAL NOT NULL DEFAULT 0 CHECK (units_per_purchase >= 0),
            price_per_unit REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ingredients (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            name_key TEXT NOT NULL UNIQUE,
            unit TEXT,
            price_per_purchase REAL NOT NULL DEFAULT 0 CHECK (price_per_purchase >= 0),
            units_per_purchase REAL NOT NULL DEFAULT 0 CHECK (units_per_purchase >= 0),
            price_per_unit REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS addons (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            name_key TEXT NOT NULL UNIQUE,
            price REAL NOT NULL DEFAULT 0 CHECK (price >= 0),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- stock: exactly one row per (item_type, item_id)
        CREATE TABLE IF NOT EXISTS stock (
            id TEXT PRIMARY KEY,
            item_type TEXT NOT NULL CHECK (item_type IN ('addon', 'ingredient', 'material')),
            item_id TEXT NOT NULL,
            quantity REAL NOT NULL DEFAULT 0 CHECK (quantity >= 0),
            updated_at TEXT NOT NULL,
            UNIQUE(item_type, item_id)
        );

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        StorageError::from(e)
    })?;

    info!("Applied migration v1 (catalog + stock tables)");
    Ok(())
}

/// Migration v2: orders and the append-only cash-flow ledger.
fn migrate_v2(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "
        -- orders (items_json is the immutable item snapshot)
        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            order_type TEXT NOT NULL CHECK (order_type IN ('dine_in', 'take_out')),
            order_status TEXT NOT NULL DEFAULT 'queuing'
                CHECK (order_status IN ('queuing', 'served', 'cancelled')),
            total REAL NOT NULL CHECK (total >= 0),
            paid REAL NOT NULL DEFAULT 0 CHECK (paid >= 0),
            change_due REAL NOT NULL DEFAULT 0 CHECK (change_due >= 0),
            items_json TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- cash_flow_transactions (append-only; never updated or deleted)
        CREATE TABLE IF NOT EXISTS cash_flow_transactions (
            id TEXT PRIMARY KEY,
            tx_type TEXT NOT NULL CHECK (tx_type IN ('inflow', 'outflow')),
            amount REAL NOT NULL CHECK (amount >= 0),
            category TEXT NOT NULL CHECK (category IN (
                'order_payment', 'cash_deposit', 'stock_purchase',
                'expense', 'refund', 'cash_adjustment')),
            order_id TEXT,
            description TEXT NOT NULL DEFAULT '',
            created_by TEXT,
            created_at TEXT NOT NULL
        );

        -- Record migration
        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        StorageError::from(e)
    })?;

    info!("Applied migration v2 (orders + cash flow ledger)");
    Ok(())
}

/// Migration v3: indexes for the hot query paths.
fn migrate_v3(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_orders_created_at ON orders(created_at);
        CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(order_status);
        CREATE INDEX IF NOT EXISTS idx_cash_flow_created_at
            ON cash_flow_transactions(created_at);
        CREATE INDEX IF NOT EXISTS idx_cash_flow_category
            ON cash_flow_transactions(category);
        CREATE INDEX IF NOT EXISTS idx_stock_item ON stock(item_type, item_id);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        StorageError::from(e)
    })?;

    info!("Applied migration v3 (indexes)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Catalog row mapping
// ---------------------------------------------------------------------------

fn catalog_table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Product => "products",
        EntityKind::Flavor => "flavors",
        EntityKind::Material => "materials",
        EntityKind::Ingredient => "ingredients",
        EntityKind::Addon => "addons",
    }
}

/// Read a product with its sizes, recipes, and flavor associations.
fn read_product(conn: &Connection, id: &str) -> StorageResult<Option<Product>> {
    let head = conn
        .query_row(
            "SELECT id, name, category, image_url FROM products WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            },
        )
        .optional()?;

    let (id, name, category, image_url) = match head {
        Some(h) => h,
        None => return Ok(None),
    };

    let mut size_stmt = conn.prepare(
        "SELECT id, name, price FROM sizes WHERE product_id = ?1 ORDER BY position, rowid",
    )?;
    let size_rows: Vec<(String, String, f64)> = size_stmt
        .query_map(params![id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<Result<_, _>>()?;

    let mut sizes = Vec::with_capacity(size_rows.len());
    for (size_id, size_name, price) in size_rows {
        let materials = read_recipe(conn, "size_materials", "material_id", &size_id)?;
        let ingredients = read_recipe(conn, "size_ingredients", "ingredient_id", &size_id)?;
        sizes.push(Size {
            id: size_id,
            name: size_name,
            price,
            materials,
            ingredients,
        });
    }

    let mut flavor_stmt =
        conn.prepare("SELECT flavor_id FROM product_flavors WHERE product_id = ?1 ORDER BY rowid")?;
    let flavor_ids: Vec<String> = flavor_stmt
        .query_map(params![id], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    Ok(Some(Product {
        id,
        name,
        category,
        image_url,
        sizes,
        flavor_ids,
    }))
}

fn read_recipe(
    conn: &Connection,
    table: &str,
    id_col: &str,
    size_id: &str,
) -> StorageResult<Vec<RecipeEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {id_col}, qty FROM {table} WHERE size_id = ?1 ORDER BY rowid"
    ))?;
    let entries = stmt
        .query_map(params![size_id], |row| {
            Ok(RecipeEntry {
                item_id: row.get(0)?,
                quantity_per_unit: row.get(1)?,
            })
        })?
        .collect::<Result<_, _>>()?;
    Ok(entries)
}

/// Write a product's owned rows (sizes, recipes, flavor links). The caller
/// has already written or cleared the products row itself.
fn write_product_children(conn: &Connection, product: &Product) -> StorageResult<()> {
    for (position, size) in product.sizes.iter().enumerate() {
        conn.execute(
            "INSERT INTO sizes (id, product_id, name, price, position)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![size.id, product.id, size.name, size.price, position as i64],
        )?;
        for entry in &size.materials {
            conn.execute(
                "INSERT INTO size_materials (size_id, material_id, qty) VALUES (?1, ?2, ?3)",
                params![size.id, entry.item_id, entry.quantity_per_unit],
            )?;
        }
        for entry in &size.ingredients {
            conn.execute(
                "INSERT INTO size_ingredients (size_id, ingredient_id, qty) VALUES (?1, ?2, ?3)",
                params![size.id, entry.item_id, entry.quantity_per_unit],
            )?;
        }
    }
    for flavor_id in &product.flavor_ids {
        conn.execute(
            "INSERT OR IGNORE INTO product_flavors (product_id, flavor_id) VALUES (?1, ?2)",
            params![product.id, flavor_id],
        )?;
    }
    Ok(())
}

fn read_flat_catalog(
    conn: &Connection,
    kind: EntityKind,
    where_clause: &str,
    param: &str,
) -> StorageResult<Vec<CatalogRecord>> {
    let table = catalog_table(kind);
    let records = match kind {
        EntityKind::Flavor => {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, name FROM {table} {where_clause} ORDER BY name COLLATE NOCASE"
            ))?;
            let rows = stmt.query_map(params![param], |row| {
                Ok(CatalogRecord::Flavor(Flavor {
                    id: row.get(0)?,
                    name: row.get(1)?,
                }))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
        EntityKind::Material | EntityKind::Ingredient => {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, name, unit, price_per_purchase, units_per_purchase, price_per_unit
                 FROM {table} {where_clause} ORDER BY name COLLATE NOCASE"
            ))?;
            let is_material = kind == EntityKind::Material;
            let rows = stmt.query_map(params![param], move |row| {
                let id: String = row.get(0)?;
                let name: String = row.get(1)?;
                let unit: Option<String> = row.get(2)?;
                let price_per_purchase: f64 = row.get(3)?;
                let units_per_purchase: f64 = row.get(4)?;
                let price_per_unit: f64 = row.get(5)?;
                Ok(if is_material {
                    CatalogRecord::Material(Material {
                        id,
                        name,
                        unit,
                        price_per_purchase,
                        units_per_purchase,
                        price_per_unit,
                    })
                } else {
                    CatalogRecord::Ingredient(Ingredient {
                        id,
                        name,
                        unit,
                        price_per_purchase,
                        units_per_purchase,
                        price_per_unit,
                    })
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
        EntityKind::Addon => {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, name, price FROM {table} {where_clause} ORDER BY name COLLATE NOCASE"
            ))?;
            let rows = stmt.query_map(params![param], |row| {
                Ok(CatalogRecord::Addon(Addon {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    price: row.get(2)?,
                }))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
        EntityKind::Product => unreachable!("products are read via read_product"),
    };
    Ok(records)
}

fn insert_flat_catalog(conn: &Connection, record: &CatalogRecord, now: &str) -> StorageResult<()> {
    match record {
        CatalogRecord::Flavor(f) => {
            conn.execute(
                "INSERT INTO flavors (id, name, name_key, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![f.id, f.name, name_key(&f.name), now],
            )?;
        }
        CatalogRecord::Material(m) => {
            conn.execute(
                "INSERT INTO materials (id, name, name_key, unit, price_per_purchase,
                                        units_per_purchase, price_per_unit, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    m.id,
                    m.name,
                    name_key(&m.name),
                    m.unit,
                    m.price_per_purchase,
                    m.units_per_purchase,
                    m.price_per_unit,
                    now
                ],
            )?;
        }
        CatalogRecord::Ingredient(i) => {
            conn.execute(
                "INSERT INTO ingredients (id, name, name_key, unit, price_per_purchase,
                                          units_per_purchase, price_per_unit, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    i.id,
                    i.name,
                    name_key(&i.name),
                    i.unit,
                    i.price_per_purchase,
                    i.units_per_purchase,
                    i.price_per_unit,
                    now
                ],
            )?;
        }
        CatalogRecord::Addon(a) => {
            conn.execute(
                "INSERT INTO addons (id, name, name_key, price, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![a.id, a.name, name_key(&a.name), a.price, now],
            )?;
        }
        CatalogRecord::Product(_) => unreachable!("products are inserted via insert_catalog"),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Order row mapping
// ---------------------------------------------------------------------------

fn row_to_order(row: &rusqlite::Row) -> rusqlite::Result<Order> {
    let order_type_raw: String = row.get(1)?;
    let status_raw: String = row.get(2)?;
    let items_json: String = row.get(6)?;
    let items: Vec<OrderItem> = serde_json::from_str(&items_json).unwrap_or_default();
    Ok(Order {
        id: row.get(0)?,
        order_type: OrderType::parse(&order_type_raw).unwrap_or(OrderType::DineIn),
        order_status: OrderStatus::parse(&status_raw).unwrap_or(OrderStatus::Queuing),
        total: row.get(3)?,
        paid: row.get(4)?,
        change: row.get(5)?,
        items,
        created_at: row.get(7)?,
    })
}

fn row_to_transaction(row: &rusqlite::Row) -> rusqlite::Result<CashFlowTransaction> {
    let tx_type_raw: String = row.get(1)?;
    let category_raw: String = row.get(3)?;
    Ok(CashFlowTransaction {
        id: row.get(0)?,
        tx_type: TransactionType::parse(&tx_type_raw).unwrap_or(TransactionType::Inflow),
        amount: row.get(2)?,
        category: CashFlowCategory::parse(&category_raw).unwrap_or(CashFlowCategory::CashAdjustment),
        order_id: row.get(4)?,
        description: row.get(5)?,
        created_by: row.get(6)?,
        created_at: row.get(7)?,
    })
}

// ---------------------------------------------------------------------------
// StorageBackend impl
// ---------------------------------------------------------------------------

impl StorageBackend for SqliteBackend {
    fn kind_name(&self) -> &'static str {
        "sqlite"
    }

    fn insert_catalog(&self, record: &CatalogRecord) -> StorageResult<()> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        match record {
            CatalogRecord::Product(p) => {
                conn.execute(
                    "INSERT INTO products (id, name, name_key, category, image_url, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    params![p.id, p.name, name_key(&p.name), p.category, p.image_url, now],
                )?;
                write_product_children(&conn, p)?;
            }
            flat => insert_flat_catalog(&conn, flat, &now)?,
        }
        Ok(())
    }

    fn catalog_by_id(&self, kind: EntityKind, id: &str) -> StorageResult<Option<CatalogRecord>> {
        let conn = self.lock()?;
        if kind == EntityKind::Product {
            return Ok(read_product(&conn, id)?.map(CatalogRecord::Product));
        }
        let mut found = read_flat_catalog(&conn, kind, "WHERE id = ?1", id)?;
        Ok(found.pop())
    }

    fn catalog_by_name_key(
        &self,
        kind: EntityKind,
        key: &str,
    ) -> StorageResult<Option<CatalogRecord>> {
        let conn = self.lock()?;
        if kind == EntityKind::Product {
            let id: Option<String> = conn
                .query_row(
                    "SELECT id FROM products WHERE name_key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            return match id {
                Some(id) => Ok(read_product(&conn, &id)?.map(CatalogRecord::Product)),
                None => Ok(None),
            };
        }
        let mut found = read_flat_catalog(&conn, kind, "WHERE name_key = ?1", key)?;
        Ok(found.pop())
    }

    fn update_catalog(&self, record: &CatalogRecord) -> StorageResult<bool> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        let changed = match record {
            CatalogRecord::Product(p) => {
                let n = conn.execute(
                    "UPDATE products SET name = ?1, name_key = ?2, category = ?3,
                            image_url = ?4, updated_at = ?5
                     WHERE id = ?6",
                    params![p.name, name_key(&p.name), p.category, p.image_url, now, p.id],
                )?;
                if n > 0 {
                    // Owned rows are rewritten wholesale
                    conn.execute("DELETE FROM sizes WHERE product_id = ?1", params![p.id])?;
                    conn.execute(
                        "DELETE FROM product_flavors WHERE product_id = ?1",
                        params![p.id],
                    )?;
                    write_product_children(&conn, p)?;
                }
                n
            }
            CatalogRecord::Flavor(f) => conn.execute(
                "UPDATE flavors SET name = ?1, name_key = ?2, updated_at = ?3 WHERE id = ?4",
                params![f.name, name_key(&f.name), now, f.id],
            )?,
            CatalogRecord::Material(m) => conn.execute(
                "UPDATE materials SET name = ?1, name_key = ?2, unit = ?3,
                        price_per_purchase = ?4, units_per_purchase = ?5,
                        price_per_unit = ?6, updated_at = ?7
                 WHERE id = ?8",
                params![
                    m.name,
                    name_key(&m.name),
                    m.unit,
                    m.price_per_purchase,
                    m.units_per_purchase,
                    m.price_per_unit,
                    now,
                    m.id
                ],
            )?,
            CatalogRecord::Ingredient(i) => conn.execute(
                "UPDATE ingredients SET name = ?1, name_key = ?2, unit = ?3,
                        price_per_purchase = ?4, units_per_purchase = ?5,
                        price_per_unit = ?6, updated_at = ?7
                 WHERE id = ?8",
                params![
                    i.name,
                    name_key(&i.name),
                    i.unit,
                    i.price_per_purchase,
                    i.units_per_purchase,
                    i.price_per_unit,
                    now,
                    i.id
                ],
            )?,
            CatalogRecord::Addon(a) => conn.execute(
                "UPDATE addons SET name = ?1, name_key = ?2, price = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![a.name, name_key(&a.name), a.price, now, a.id],
            )?,
        };
        Ok(changed > 0)
    }

    fn delete_catalog(&self, kind: EntityKind, id: &str) -> StorageResult<bool> {
        let conn = self.lock()?;
        let table = catalog_table(kind);
        // Cascades remove sizes/recipes/flavor links for products
        let n = conn.execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![id])?;
        Ok(n > 0)
    }

    fn list_catalog(&self, kind: EntityKind) -> StorageResult<Vec<CatalogRecord>> {
        let conn = self.lock()?;
        if kind == EntityKind::Product {
            let mut stmt =
                conn.prepare("SELECT id FROM products ORDER BY name COLLATE NOCASE")?;
            let ids: Vec<String> = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<_, _>>()?;
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(p) = read_product(&conn, &id)? {
                    out.push(CatalogRecord::Product(p));
                }
            }
            return Ok(out);
        }
        // "WHERE ?1 = ?1" keeps the single-parameter query shape shared
        read_flat_catalog(&conn, kind, "WHERE ?1 = ?1", "1")
    }

    fn stock_for(
        &self,
        item_type: StockItemType,
        item_id: &str,
    ) -> StorageResult<Option<StockRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT id, item_type, item_id, quantity, updated_at
                 FROM stock WHERE item_type = ?1 AND item_id = ?2",
                params![item_type.as_str(), item_id],
                |row| {
                    let raw_type: String = row.get(1)?;
                    Ok(StockRecord {
                        id: row.get(0)?,
                        item_type: StockItemType::parse(&raw_type)
                            .unwrap_or(StockItemType::Material),
                        item_id: row.get(2)?,
                        quantity: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn put_stock(&self, record: &StockRecord) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO stock (id, item_type, item_id, quantity, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(item_type, item_id) DO UPDATE SET
                quantity = excluded.quantity,
                updated_at = excluded.updated_at",
            params![
                record.id,
                record.item_type.as_str(),
                record.item_id,
                record.quantity,
                record.updated_at
            ],
        )?;
        Ok(())
    }

    fn delete_stock_for(&self, item_type: StockItemType, item_id: &str) -> StorageResult<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "DELETE FROM stock WHERE item_type = ?1 AND item_id = ?2",
            params![item_type.as_str(), item_id],
        )?;
        Ok(n > 0)
    }

    fn list_stock(&self) -> StorageResult<Vec<StockRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, item_type, item_id, quantity, updated_at
             FROM stock ORDER BY item_type, item_id",
        )?;
        let records = stmt
            .query_map([], |row| {
                let raw_type: String = row.get(1)?;
                Ok(StockRecord {
                    id: row.get(0)?,
                    item_type: StockItemType::parse(&raw_type).unwrap_or(StockItemType::Material),
                    item_id: row.get(2)?,
                    quantity: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(records)
    }

    fn insert_order(&self, order: &Order) -> StorageResult<()> {
        let conn = self.lock()?;
        let items_json = serde_json::to_string(&order.items)?;
        conn.execute(
            "INSERT INTO orders (id, order_type, order_status, total, paid, change_due,
                                 items_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                order.id,
                order.order_type.as_str(),
                order.order_status.as_str(),
                order.total,
                order.paid,
                order.change,
                items_json,
                order.created_at
            ],
        )?;
        Ok(())
    }

    fn order_by_id(&self, id: &str) -> StorageResult<Option<Order>> {
        let conn = self.lock()?;
        let order = conn
            .query_row(
                "SELECT id, order_type, order_status, total, paid, change_due, items_json, created_at
                 FROM orders WHERE id = ?1",
                params![id],
                row_to_order,
            )
            .optional()?;
        Ok(order)
    }

    fn set_order_status(&self, id: &str, status: OrderStatus) -> StorageResult<bool> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        let n = conn.execute(
            "UPDATE orders SET order_status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now, id],
        )?;
        Ok(n > 0)
    }

    fn list_orders(&self, filter: OrderFilter) -> StorageResult<Vec<Order>> {
        let conn = self.lock()?;
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let where_clause = match filter {
            OrderFilter::All => "WHERE ?1 = ?1",
            OrderFilter::Today => "WHERE substr(created_at, 1, 10) = ?1",
        };
        let mut stmt = conn.prepare(&format!(
            "SELECT id, order_type, order_status, total, paid, change_due, items_json, created_at
             FROM orders {where_clause}
             ORDER BY created_at DESC, rowid DESC"
        ))?;
        let orders = stmt
            .query_map(params![today], row_to_order)?
            .collect::<Result<_, _>>()?;
        Ok(orders)
    }

    fn append_transaction(&self, tx: &CashFlowTransaction) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO cash_flow_transactions
                (id, tx_type, amount, category, order_id, description, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                tx.id,
                tx.tx_type.as_str(),
                tx.amount,
                tx.category.as_str(),
                tx.order_id,
                tx.description,
                tx.created_by,
                tx.created_at
            ],
        )?;
        Ok(())
    }

    fn list_transactions(&self, limit: Option<usize>) -> StorageResult<Vec<CashFlowTransaction>> {
        let conn = self.lock()?;
        let limit = limit.map(|n| n as i64).unwrap_or(-1);
        let mut stmt = conn.prepare(
            "SELECT id, tx_type, amount, category, order_id, description, created_by, created_at
             FROM cash_flow_transactions
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?1",
        )?;
        let txs = stmt
            .query_map(params![limit], row_to_transaction)?
            .collect::<Result<_, _>>()?;
        Ok(txs)
    }

    fn sum_transactions(&self, tx_type: TransactionType) -> StorageResult<f64> {
        let conn = self.lock()?;
        let sum: f64 = conn.query_row(
            "SELECT COALESCE(SUM(amount), 0.0) FROM cash_flow_transactions WHERE tx_type = ?1",
            params![tx_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(sum)
    }

    fn get_flag(&self, key: &str) -> StorageResult<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT setting_value FROM local_settings
                 WHERE setting_category = ?1 AND setting_key = ?2",
                params![FLAG_CATEGORY, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_flag(&self, key: &str, value: &str) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
             VALUES (?1, ?2, ?3, datetime('now'))
             ON CONFLICT(setting_category, setting_key) DO UPDATE SET
                setting_value = excluded.setting_value,
                updated_at = excluded.updated_at",
            params![FLAG_CATEGORY, key, value],
        )?;
        Ok(())
    }

    fn has_data(&self) -> StorageResult<bool> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT (SELECT COUNT(*) FROM products)
                  + (SELECT COUNT(*) FROM flavors)
                  + (SELECT COUNT(*) FROM materials)
                  + (SELECT COUNT(*) FROM ingredients)
                  + (SELECT COUNT(*) FROM addons)
                  + (SELECT COUNT(*) FROM stock)
                  + (SELECT COUNT(*) FROM orders)
                  + (SELECT COUNT(*) FROM cash_flow_transactions)",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn clear_all(&self) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "DELETE FROM product_flavors;
             DELETE FROM size_materials;
             DELETE FROM size_ingredients;
             DELETE FROM sizes;
             DELETE FROM products;
             DELETE FROM flavors;
             DELETE FROM materials;
             DELETE FROM ingredients;
             DELETE FROM addons;
             DELETE FROM stock;
             DELETE FROM orders;
             DELETE FROM cash_flow_transactions;",
        )?;
        Ok(())
    }

    fn run_unit_of_work(
        &self,
        work: &mut dyn FnMut(&dyn StorageBackend) -> StorageResult<()>,
    ) -> StorageResult<()> {
        // The lock is taken per statement, never across the closure, so the
        // closure's own calls can re-acquire it. Single-terminal sequential
        // calls keep the transaction private to this unit of work.
        {
            let conn = self.lock()?;
            conn.execute_batch("BEGIN IMMEDIATE")?;
        }

        let result = work(self);

        let conn = self.lock()?;
        match result {
            Ok(()) => {
                conn.execute_batch("COMMIT")?;
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Addon, Flavor};

    fn backend() -> SqliteBackend {
        SqliteBackend::open_in_memory().expect("open in-memory backend")
    }

    /// Helper: list table names in the database.
    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_create_all_tables() {
        let backend = backend();
        let conn = backend.conn.lock().unwrap();
        let tables = table_names(&conn);

        for table in [
            "local_settings",
            "products",
            "sizes",
            "size_materials",
            "size_ingredients",
            "product_flavors",
            "flavors",
            "materials",
            "ingredients",
            "addons",
            "stock",
            "orders",
            "cash_flow_transactions",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .expect("read schema version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let backend = backend();
        let conn = backend.conn.lock().unwrap();
        run_migrations(&conn).expect("second run should succeed");

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .expect("read schema version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_unique_name_key_rejects_case_variant_insert() {
        let backend = backend();
        backend
            .insert_catalog(&CatalogRecord::Flavor(Flavor {
                id: "f1".into(),
                name: "Vanilla".into(),
            }))
            .unwrap();

        // Same name, different case: the schema itself refuses it
        let dup = backend.insert_catalog(&CatalogRecord::Flavor(Flavor {
            id: "f2".into(),
            name: "VANILLA".into(),
        }));
        assert!(dup.is_err(), "UNIQUE(name_key) should reject the duplicate");
    }

    #[test]
    fn test_check_constraint_rejects_negative_stock() {
        let backend = backend();
        let conn = backend.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO stock (id, item_type, item_id, quantity, updated_at)
             VALUES ('st-1', 'material', 'cup-12', -5.0, datetime('now'))",
            [],
        );
        assert!(result.is_err(), "CHECK (quantity >= 0) should reject");
    }

    #[test]
    fn test_check_constraint_rejects_negative_transaction_amount() {
        let backend = backend();
        let conn = backend.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO cash_flow_transactions
                (id, tx_type, amount, category, description, created_at)
             VALUES ('tx-1', 'inflow', -10.0, 'order_payment', '', datetime('now'))",
            [],
        );
        assert!(result.is_err(), "CHECK (amount >= 0) should reject");
    }

    #[test]
    fn test_product_children_cascade_on_delete() {
        let backend = backend();
        let product = Product {
            id: "p1".into(),
            name: "Iced Coffee".into(),
            category: Some("coffee".into()),
            image_url: None,
            sizes: vec![Size {
                id: "s1".into(),
                name: "Large".into(),
                price: 120.0,
                materials: vec![RecipeEntry {
                    item_id: "m1".into(),
                    quantity_per_unit: 1.0,
                }],
                ingredients: vec![RecipeEntry {
                    item_id: "i1".into(),
                    quantity_per_unit: 10.0,
                }],
            }],
            flavor_ids: vec!["f1".into()],
        };
        backend
            .insert_catalog(&CatalogRecord::Product(product))
            .unwrap();

        assert!(backend
            .delete_catalog(EntityKind::Product, "p1")
            .unwrap());

        let conn = backend.conn.lock().unwrap();
        for table in ["sizes", "size_materials", "size_ingredients", "product_flavors"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get(0)
                })
                .unwrap();
            assert_eq!(count, 0, "{table} rows should cascade-delete");
        }
    }

    #[test]
    fn test_product_roundtrip_preserves_recipe_order() {
        let backend = backend();
        let product = Product {
            id: "p1".into(),
            name: "Iced Coffee".into(),
            category: None,
            image_url: None,
            sizes: vec![
                Size {
                    id: "s1".into(),
                    name: "Small".into(),
                    price: 90.0,
                    materials: vec![],
                    ingredients: vec![],
                },
                Size {
                    id: "s2".into(),
                    name: "Large".into(),
                    price: 120.0,
                    materials: vec![
                        RecipeEntry {
                            item_id: "m-cup".into(),
                            quantity_per_unit: 1.0,
                        },
                        RecipeEntry {
                            item_id: "m-straw".into(),
                            quantity_per_unit: 1.0,
                        },
                    ],
                    ingredients: vec![RecipeEntry {
                        item_id: "i-beans".into(),
                        quantity_per_unit: 10.0,
                    }],
                },
            ],
            flavor_ids: vec!["f-hazelnut".into(), "f-caramel".into()],
        };
        backend
            .insert_catalog(&CatalogRecord::Product(product.clone()))
            .unwrap();

        let back = backend
            .catalog_by_id(EntityKind::Product, "p1")
            .unwrap()
            .expect("product back");
        assert_eq!(back, CatalogRecord::Product(product));
    }

    #[test]
    fn test_unit_of_work_rolls_back_on_error() {
        let backend = backend();
        let result = backend.run_unit_of_work(&mut |s| {
            s.insert_catalog(&CatalogRecord::Addon(Addon {
                id: "a1".into(),
                name: "Extra Shot".into(),
                price: 15.0,
            }))?;
            Err(StorageError::Backend("injected".into()))
        });
        assert!(result.is_err());
        assert!(backend
            .catalog_by_id(EntityKind::Addon, "a1")
            .unwrap()
            .is_none());

        // The connection must be usable again after the rollback
        backend
            .insert_catalog(&CatalogRecord::Addon(Addon {
                id: "a2".into(),
                name: "Whipped Cream".into(),
                price: 10.0,
            }))
            .unwrap();
    }

    #[test]
    fn test_open_retries_after_corruption() {
        let dir = std::env::temp_dir()
            .join("brew_pos_test")
            .join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(&dir).unwrap();
        let db_path = dir.join("pos.db");
        std::fs::write(&db_path, b"this is not a sqlite file").unwrap();

        let backend = SqliteBackend::open(&dir).expect("open should recover from corruption");
        backend
            .insert_catalog(&CatalogRecord::Flavor(Flavor {
                id: "f1".into(),
                name: "Vanilla".into(),
            }))
            .unwrap();

        drop(backend);
        let _ = std::fs::remove_dir_all(&dir);
    }
}

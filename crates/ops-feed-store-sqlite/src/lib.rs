use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ops_feed_core::{
    ApplicationId, Customer, Dataset, GoodsKind, LineItem, Order, OrderId, Rental, RentalId,
    ServiceApplication, User, UserId, DRAFT_STATUS,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

// Cross-collection pointers (linked_application_id, order_id, rental_id, user_id) carry no
// foreign keys: the collections are written independently and the feed audits them.
const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS orders (
  id TEXT PRIMARY KEY,
  created_at TEXT,
  status TEXT NOT NULL,
  payment_status TEXT NOT NULL,
  total_amount INTEGER NOT NULL CHECK (total_amount >= 0),
  customer_name TEXT,
  customer_email TEXT,
  linked_application_id TEXT,
  service_claimed_applied INTEGER NOT NULL DEFAULT 0 CHECK (service_claimed_applied IN (0, 1))
);

CREATE TABLE IF NOT EXISTS order_items (
  order_id TEXT NOT NULL,
  position INTEGER NOT NULL,
  name TEXT NOT NULL,
  goods_kind TEXT NOT NULL CHECK (goods_kind IN ('racket','string','accessory','other')),
  quantity INTEGER NOT NULL CHECK (quantity >= 1),
  unit_price INTEGER NOT NULL CHECK (unit_price >= 0),
  PRIMARY KEY (order_id, position),
  FOREIGN KEY (order_id) REFERENCES orders(id)
);

CREATE TABLE IF NOT EXISTS rentals (
  id TEXT PRIMARY KEY,
  created_at TEXT,
  status TEXT NOT NULL,
  fee INTEGER NOT NULL CHECK (fee >= 0),
  deposit INTEGER NOT NULL DEFAULT 0 CHECK (deposit >= 0),
  days INTEGER NOT NULL CHECK (days >= 1),
  user_id TEXT,
  linked_application_id TEXT,
  service_requested INTEGER NOT NULL DEFAULT 0 CHECK (service_requested IN (0, 1))
);

CREATE TABLE IF NOT EXISTS stringing_applications (
  id TEXT PRIMARY KEY,
  created_at TEXT,
  status TEXT NOT NULL,
  payment_status TEXT,
  total_price INTEGER NOT NULL CHECK (total_price >= 0),
  order_id TEXT,
  rental_id TEXT,
  customer_name TEXT,
  customer_email TEXT
);

CREATE TABLE IF NOT EXISTS users (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  email TEXT NOT NULL
);
";

const MIGRATION_002_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_orders_created_at ON orders(created_at);
CREATE INDEX IF NOT EXISTS idx_rentals_created_at ON rentals(created_at);
CREATE INDEX IF NOT EXISTS idx_applications_order_id ON stringing_applications(order_id);
CREATE INDEX IF NOT EXISTS idx_applications_rental_id ON stringing_applications(rental_id);
CREATE INDEX IF NOT EXISTS idx_applications_status_created_at ON stringing_applications(status, created_at);
";

const ORDER_COLUMNS: &str = "id, created_at, status, payment_status, total_amount, customer_name, \
     customer_email, linked_application_id, service_claimed_applied";
const RENTAL_COLUMNS: &str =
    "id, created_at, status, fee, deposit, days, user_id, linked_application_id, service_requested";
const APPLICATION_COLUMNS: &str = "id, created_at, status, payment_status, total_price, order_id, \
     rental_id, customer_name, customer_email";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_orders: usize,
    pub imported_rentals: usize,
    pub imported_applications: usize,
    pub imported_users: usize,
    pub skipped_existing_records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed record store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        // busy_timeout goes first so that concurrent openers wait on the WAL switch.
        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations. Read-only.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        let (inferred, _) = detect_effective_schema_version(&self.conn)?;
        if inferred == 0 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        // Tables were created outside the migration runner; record what is already there.
        for version in 1..=inferred {
            record_schema_version(&self.conn, version)?;
        }
        Ok(inferred)
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;
        tx.execute_batch(MIGRATION_002_SQL).context("failed to create v2 indexes")?;
        record_schema_version(&tx, 2)?;
        tx.commit().context("failed to commit migration v2")?;
        Ok(())
    }

    /// Newest orders first, at most `limit` of them, with their line items.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_recent_orders(&self, limit: usize) -> Result<Vec<Order>> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders ORDER BY created_at DESC, id ASC LIMIT ?1"
        );
        let orders = self.query_orders(&sql, [sql_limit(limit)?])?;
        tracing::debug!(limit, fetched = orders.len(), "listed recent orders");
        Ok(orders)
    }

    /// Newest rentals first, at most `limit` of them.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_recent_rentals(&self, limit: usize) -> Result<Vec<Rental>> {
        let sql = format!(
            "SELECT {RENTAL_COLUMNS} FROM rentals ORDER BY created_at DESC, id ASC LIMIT ?1"
        );
        let rentals = self.query_rentals(&sql, [sql_limit(limit)?])?;
        tracing::debug!(limit, fetched = rentals.len(), "listed recent rentals");
        Ok(rentals)
    }

    /// Newest submitted applications first, at most `limit` of them. Drafts are excluded.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_recent_applications(&self, limit: usize) -> Result<Vec<ServiceApplication>> {
        let sql = format!(
            "SELECT {APPLICATION_COLUMNS} FROM stringing_applications
             WHERE lower(status) <> ?1
             ORDER BY created_at DESC, id ASC
             LIMIT ?2"
        );
        let applications =
            self.query_applications(&sql, params![DRAFT_STATUS, sql_limit(limit)?])?;
        tracing::debug!(limit, fetched = applications.len(), "listed recent applications");
        Ok(applications)
    }

    /// Applications of any status that point at one of `order_ids` or `rental_ids`, or
    /// whose id is in `application_ids`.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn find_applications_linked_to(
        &self,
        order_ids: &[OrderId],
        rental_ids: &[RentalId],
        application_ids: &[ApplicationId],
    ) -> Result<Vec<ServiceApplication>> {
        let mut clauses = Vec::new();
        let mut values: Vec<&str> = Vec::new();
        for (column, ids) in [
            ("order_id", order_ids.iter().map(OrderId::as_str).collect::<Vec<_>>()),
            ("rental_id", rental_ids.iter().map(RentalId::as_str).collect::<Vec<_>>()),
            ("id", application_ids.iter().map(ApplicationId::as_str).collect::<Vec<_>>()),
        ] {
            if ids.is_empty() {
                continue;
            }
            clauses.push(format!("{column} IN ({})", placeholders(values.len() + 1, ids.len())));
            values.extend(ids);
        }

        if clauses.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {APPLICATION_COLUMNS} FROM stringing_applications
             WHERE {}
             ORDER BY created_at DESC, id ASC",
            clauses.join(" OR ")
        );
        self.query_applications(&sql, params_from_iter(values))
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn find_orders_by_ids(&self, ids: &[OrderId]) -> Result<Vec<Order>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id IN ({}) ORDER BY id ASC",
            placeholders(1, ids.len())
        );
        self.query_orders(&sql, params_from_iter(ids.iter().map(OrderId::as_str)))
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn find_rentals_by_ids(&self, ids: &[RentalId]) -> Result<Vec<Rental>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {RENTAL_COLUMNS} FROM rentals WHERE id IN ({}) ORDER BY id ASC",
            placeholders(1, ids.len())
        );
        self.query_rentals(&sql, params_from_iter(ids.iter().map(RentalId::as_str)))
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn find_users_by_ids(&self, ids: &[UserId]) -> Result<Vec<User>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id, name, email FROM users WHERE id IN ({}) ORDER BY id ASC",
            placeholders(1, ids.len())
        );
        let mut stmt = self.conn.prepare(&sql).context("failed to prepare user lookup")?;
        let rows = stmt.query_map(params_from_iter(ids.iter().map(UserId::as_str)), |row| {
            Ok(User {
                id: UserId::new(row.get::<_, String>(0)?),
                name: row.get(1)?,
                email: row.get(2)?,
            })
        })?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row.context("failed to read user row")?);
        }
        Ok(users)
    }

    /// Validate and load a dataset. Records whose id already exists are skipped, never
    /// overwritten.
    ///
    /// # Errors
    /// Returns an error when validation fails or any write in the transaction fails.
    pub fn import_dataset(&mut self, dataset: &Dataset) -> Result<ImportSummary> {
        dataset.validate().map_err(|err| anyhow!("dataset validation failed: {err}"))?;

        let tx = self.conn.transaction().context("failed to start import transaction")?;
        let mut summary = ImportSummary::default();

        for order in &dataset.orders {
            if exists(&tx, "orders", order.id.as_str())? {
                summary.skipped_existing_records += 1;
                continue;
            }
            insert_order(&tx, order)?;
            summary.imported_orders += 1;
        }

        for rental in &dataset.rentals {
            if exists(&tx, "rentals", rental.id.as_str())? {
                summary.skipped_existing_records += 1;
                continue;
            }
            insert_rental(&tx, rental)?;
            summary.imported_rentals += 1;
        }

        for application in &dataset.applications {
            if exists(&tx, "stringing_applications", application.id.as_str())? {
                summary.skipped_existing_records += 1;
                continue;
            }
            insert_application(&tx, application)?;
            summary.imported_applications += 1;
        }

        for user in &dataset.users {
            if exists(&tx, "users", user.id.as_str())? {
                summary.skipped_existing_records += 1;
                continue;
            }
            tx.execute(
                "INSERT INTO users(id, name, email) VALUES (?1, ?2, ?3)",
                params![user.id.as_str(), user.name, user.email],
            )
            .with_context(|| format!("failed to insert user {}", user.id))?;
            summary.imported_users += 1;
        }

        tx.commit().context("failed to commit import transaction")?;
        tracing::info!(
            orders = summary.imported_orders,
            rentals = summary.imported_rentals,
            applications = summary.imported_applications,
            users = summary.imported_users,
            skipped = summary.skipped_existing_records,
            "imported dataset"
        );
        Ok(summary)
    }

    /// Run quick-check, foreign-key-check, and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    fn query_orders(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Order>> {
        let mut stmt = self.conn.prepare(sql).context("failed to prepare order query")?;
        let mut rows = stmt.query(params).context("failed to query orders")?;
        let mut orders = Vec::new();
        while let Some(row) = rows.next()? {
            orders.push(decode_order(row)?);
        }
        drop(rows);

        for order in &mut orders {
            order.items = self.load_order_items(&order.id)?;
        }
        Ok(orders)
    }

    fn load_order_items(&self, order_id: &OrderId) -> Result<Vec<LineItem>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT name, goods_kind, quantity, unit_price FROM order_items
                 WHERE order_id = ?1
                 ORDER BY position ASC",
            )
            .context("failed to prepare order item query")?;
        let mut rows = stmt.query(params![order_id.as_str()])?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            let goods_kind: String = row.get(1)?;
            let quantity: i64 = row.get(2)?;
            items.push(LineItem {
                name: row.get(0)?,
                kind: GoodsKind::parse(&goods_kind),
                quantity: u32::try_from(quantity)
                    .with_context(|| format!("invalid quantity {quantity} on order {order_id}"))?,
                unit_price: row.get(3)?,
            });
        }
        Ok(items)
    }

    fn query_rentals(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Rental>> {
        let mut stmt = self.conn.prepare(sql).context("failed to prepare rental query")?;
        let mut rows = stmt.query(params).context("failed to query rentals")?;
        let mut rentals = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let days: i64 = row.get(5)?;
            rentals.push(Rental {
                created_at: optional_timestamp(row, 1)?,
                status: row.get(2)?,
                fee: row.get(3)?,
                deposit: row.get(4)?,
                days: u32::try_from(days)
                    .with_context(|| format!("invalid rental days {days} on rental {id}"))?,
                user_id: row.get::<_, Option<String>>(6)?.map(UserId::new),
                linked_application_id: row.get::<_, Option<String>>(7)?.map(ApplicationId::new),
                service_requested: row.get(8)?,
                id: RentalId::new(id),
            });
        }
        Ok(rentals)
    }

    fn query_applications(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<ServiceApplication>> {
        let mut stmt = self.conn.prepare(sql).context("failed to prepare application query")?;
        let mut rows = stmt.query(params).context("failed to query applications")?;
        let mut applications = Vec::new();
        while let Some(row) = rows.next()? {
            applications.push(ServiceApplication {
                id: ApplicationId::new(row.get::<_, String>(0)?),
                created_at: optional_timestamp(row, 1)?,
                status: row.get(2)?,
                payment_status: row.get(3)?,
                total_price: row.get(4)?,
                order_id: row.get::<_, Option<String>>(5)?.map(OrderId::new),
                rental_id: row.get::<_, Option<String>>(6)?.map(RentalId::new),
                customer: Customer { name: row.get(7)?, email: row.get(8)? },
            });
        }
        Ok(applications)
    }

    #[cfg(test)]
    fn insert_raw(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql).context("failed to run raw fixture sql")
    }
}

fn decode_order(row: &Row<'_>) -> Result<Order> {
    Ok(Order {
        id: OrderId::new(row.get::<_, String>(0)?),
        created_at: optional_timestamp(row, 1)?,
        status: row.get(2)?,
        payment_status: row.get(3)?,
        total_amount: row.get(4)?,
        items: Vec::new(),
        customer: Customer { name: row.get(5)?, email: row.get(6)? },
        linked_application_id: row.get::<_, Option<String>>(7)?.map(ApplicationId::new),
        service_claimed_applied: row.get(8)?,
    })
}

fn insert_order(tx: &Transaction<'_>, order: &Order) -> Result<()> {
    tx.execute(
        "INSERT INTO orders(
            id, created_at, status, payment_status, total_amount,
            customer_name, customer_email, linked_application_id, service_claimed_applied
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            order.id.as_str(),
            order.created_at.map(rfc3339).transpose()?,
            order.status,
            order.payment_status,
            order.total_amount,
            order.customer.name,
            order.customer.email,
            order.linked_application_id.as_ref().map(ApplicationId::as_str),
            order.service_claimed_applied,
        ],
    )
    .with_context(|| format!("failed to insert order {}", order.id))?;

    for (position, item) in order.items.iter().enumerate() {
        tx.execute(
            "INSERT INTO order_items(order_id, position, name, goods_kind, quantity, unit_price)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                order.id.as_str(),
                i64::try_from(position).context("line item position overflow")?,
                item.name,
                item.kind.as_str(),
                i64::from(item.quantity),
                item.unit_price,
            ],
        )
        .with_context(|| format!("failed to insert line item {position} of order {}", order.id))?;
    }
    Ok(())
}

fn insert_rental(tx: &Transaction<'_>, rental: &Rental) -> Result<()> {
    tx.execute(
        "INSERT INTO rentals(
            id, created_at, status, fee, deposit, days,
            user_id, linked_application_id, service_requested
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            rental.id.as_str(),
            rental.created_at.map(rfc3339).transpose()?,
            rental.status,
            rental.fee,
            rental.deposit,
            i64::from(rental.days),
            rental.user_id.as_ref().map(UserId::as_str),
            rental.linked_application_id.as_ref().map(ApplicationId::as_str),
            rental.service_requested,
        ],
    )
    .with_context(|| format!("failed to insert rental {}", rental.id))?;
    Ok(())
}

fn insert_application(tx: &Transaction<'_>, application: &ServiceApplication) -> Result<()> {
    tx.execute(
        "INSERT INTO stringing_applications(
            id, created_at, status, payment_status, total_price,
            order_id, rental_id, customer_name, customer_email
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            application.id.as_str(),
            application.created_at.map(rfc3339).transpose()?,
            application.status,
            application.payment_status,
            application.total_price,
            application.order_id.as_ref().map(OrderId::as_str),
            application.rental_id.as_ref().map(RentalId::as_str),
            application.customer.name,
            application.customer.email,
        ],
    )
    .with_context(|| format!("failed to insert application {}", application.id))?;
    Ok(())
}

fn exists(conn: &Connection, table: &str, id: &str) -> Result<bool> {
    let found = conn
        .query_row(&format!("SELECT 1 FROM {table} WHERE id = ?1"), params![id], |row| {
            row.get::<_, i64>(0)
        })
        .optional()
        .with_context(|| format!("failed to check {table} for id {id}"))?;
    Ok(found.is_some())
}

fn placeholders(first: usize, count: usize) -> String {
    (first..first + count).map(|index| format!("?{index}")).collect::<Vec<_>>().join(", ")
}

fn sql_limit(limit: usize) -> Result<i64> {
    i64::try_from(limit.max(1)).with_context(|| format!("fetch limit {limit} is out of range"))
}

fn optional_timestamp(row: &Row<'_>, index: usize) -> Result<Option<OffsetDateTime>> {
    row.get::<_, Option<String>>(index)?.as_deref().map(parse_rfc3339).transpose()
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn index_exists(conn: &Connection, index_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?1)",
            params![index_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if index exists: {index_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    if !table_exists(conn, "schema_migrations")? {
        return Ok(0);
    }
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "orders")? {
        return Ok((0, false));
    }

    if !table_has_column(conn, "orders", "linked_application_id")? {
        return Err(anyhow!("database schema is invalid: orders has no linked_application_id"));
    }

    if index_exists(conn, "idx_applications_order_id")? {
        return Ok((2, true));
    }

    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

// Stored timestamps are UTC so that text order is time order.
fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

use std::path::PathBuf;
use std::thread;
use std::time::Instant;

use anyhow::{anyhow, bail, Result};
use ops_feed_core::{reconcile, Dataset, FeedPage, FeedQuery, RecordSet};
use ops_feed_store_sqlite::{ImportSummary, IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};

pub const API_CONTRACT_VERSION: &str = "api.v1";

pub const DEFAULT_FETCH_LIMIT: usize = 500;

/// Upper bounds on the three primary fetches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchLimits {
    pub orders: usize,
    pub rentals: usize,
    pub applications: usize,
}

impl Default for FetchLimits {
    fn default() -> Self {
        Self {
            orders: DEFAULT_FETCH_LIMIT,
            rentals: DEFAULT_FETCH_LIMIT,
            applications: DEFAULT_FETCH_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct OperationsApi {
    db_path: PathBuf,
    limits: FetchLimits,
}

impl OperationsApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path, limits: FetchLimits::default() }
    }

    #[must_use]
    pub fn with_limits(mut self, limits: FetchLimits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub fn limits(&self) -> FetchLimits {
        self.limits
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when the database cannot be opened or an integrity check fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// Load a dataset into the store, skipping ids that already exist.
    ///
    /// # Errors
    /// Returns an error when the dataset is invalid or any write fails.
    pub fn import_dataset(&self, dataset: &Dataset) -> Result<ImportSummary> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.import_dataset(dataset)
    }

    /// Fetch, repair and back-fill the working set for one feed request.
    ///
    /// The three primary fetches run concurrently on their own connections. The repair
    /// query, counterpart back-fill and user lookup depend on their results and run after.
    ///
    /// Feed requests never migrate; `db migrate` and `data import` own schema changes.
    ///
    /// # Errors
    /// Returns an error when the schema is not at the latest version or any store read
    /// fails; no partial working set is returned.
    pub fn working_set(&self) -> Result<RecordSet> {
        let store = self.open_store()?;
        let status = store.schema_status()?;
        if !status.pending_versions.is_empty() {
            bail!(
                "database schema is at version {} but version {} is required; run `db migrate`",
                status.current_version,
                status.target_version
            );
        }

        let limits = self.limits;
        let (orders, rentals, applications) = thread::scope(|scope| -> Result<_> {
            let orders = scope.spawn(|| self.open_store()?.list_recent_orders(limits.orders));
            let rentals = scope.spawn(|| self.open_store()?.list_recent_rentals(limits.rentals));
            let applications =
                scope.spawn(|| self.open_store()?.list_recent_applications(limits.applications));

            let orders = orders.join().map_err(|_| anyhow!("order fetch thread panicked"))??;
            let rentals = rentals.join().map_err(|_| anyhow!("rental fetch thread panicked"))??;
            let applications = applications
                .join()
                .map_err(|_| anyhow!("application fetch thread panicked"))??;
            Ok((orders, rentals, applications))
        })?;
        tracing::debug!(
            orders = orders.len(),
            rentals = rentals.len(),
            applications = applications.len(),
            "primary fetch complete"
        );

        let mut records = RecordSet::new(orders, rentals, applications);

        let repair = records.repair_request();
        if !repair.is_empty() {
            let fetched = store.find_applications_linked_to(
                &repair.order_ids,
                &repair.rental_ids,
                &repair.application_ids,
            )?;
            let stats = records.merge_repaired(fetched);
            tracing::debug!(
                merged = stats.merged_applications,
                drafts = stats.indexed_drafts,
                already_known = stats.already_known,
                "truncation repair merged"
            );
        }

        let backfill = records.backfill_request();
        if !backfill.is_empty() {
            let orders = store.find_orders_by_ids(&backfill.order_ids)?;
            let rentals = store.find_rentals_by_ids(&backfill.rental_ids)?;
            tracing::debug!(
                requested_orders = backfill.order_ids.len(),
                requested_rentals = backfill.rental_ids.len(),
                found_orders = orders.len(),
                found_rentals = rentals.len(),
                "counterpart back-fill"
            );
            records.merge_backfill(orders, rentals);
        }

        let user_ids = records.rental_user_ids();
        if !user_ids.is_empty() {
            let users = store.find_users_by_ids(&user_ids)?;
            records.set_users(users);
        }

        Ok(records)
    }

    /// Run one reconciled, filtered and paginated feed request.
    ///
    /// # Errors
    /// Returns an error when the schema is not current or any store read fails.
    pub fn operations_feed(&self, query: &FeedQuery) -> Result<FeedPage> {
        let started = Instant::now();
        let records = self.working_set()?;
        let page = reconcile(&records, query);
        tracing::info!(
            total = page.total,
            returned = page.items.len(),
            page = query.page,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "operations feed served"
        );
        Ok(page)
    }
}

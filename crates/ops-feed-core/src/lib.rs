//! Reconciliation of orders, rentals and stringing-service applications into one
//! audited, classified operations feed.
//!
//! The pipeline runs leaves first: [`LinkIndex`] over the applications, repair merges on
//! [`RecordSet`], [`audit`], [`classify_flow`], [`build_feed`] and [`group_items`], then
//! [`run_query`]. Nothing in this crate performs I/O.

pub mod audit;
pub mod classify;
pub mod feed;
pub mod labels;
pub mod links;
pub mod model;
pub mod query;

pub use audit::{audit, reasons, AuditReport, Findings};
pub use classify::{classify_flow, settlement_anchor, Flow, FlowInputs, SettlementAnchor};
pub use feed::{build_feed, group_items, GroupKey, OperationGroup, OperationItem, RelatedItem};
pub use links::{
    BackfillRequest, DraftIndex, Link, LinkIndex, RecordRef, RecordSet, RepairRequest, RepairStats,
};
pub use model::{
    ApplicationId, Customer, Dataset, GoodsKind, LineItem, Order, OrderId, RecordKind, Rental,
    RentalId, ServiceApplication, User, UserId, DRAFT_STATUS,
};
pub use query::{
    run_query, FeedPage, FeedQuery, IntegrationFilter, RawFeedParams, DEFAULT_PAGE_SIZE,
    MAX_PAGE_SIZE,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum OpsError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("query error: {0}")]
    Query(String),
}

/// Build, filter and paginate the feed for an already-repaired working set.
#[must_use]
pub fn reconcile(records: &RecordSet, query: &FeedQuery) -> FeedPage {
    run_query(build_feed(records), query)
}

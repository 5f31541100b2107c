use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::model::{
    ApplicationId, Order, OrderId, RecordKind, Rental, RentalId, ServiceApplication, User, UserId,
};

/// A typed pointer to one record of any kind.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordRef {
    pub kind: RecordKind,
    pub id: String,
}

impl RecordRef {
    #[must_use]
    pub fn order(id: &OrderId) -> Self {
        Self { kind: RecordKind::Order, id: id.0.clone() }
    }

    #[must_use]
    pub fn rental(id: &RentalId) -> Self {
        Self { kind: RecordKind::Rental, id: id.0.clone() }
    }

    #[must_use]
    pub fn application(id: &ApplicationId) -> Self {
        Self { kind: RecordKind::StringingApplication, id: id.0.clone() }
    }
}

/// The state of a record's cross-collection link, resolved once per request.
///
/// The forward link is an application's own `orderId`/`rentalId`; the reverse pointer is
/// the order's or rental's `linkedApplicationId`.
///
/// - `Claimed`: an unconfirmed pointer. Either a reverse pointer no application answers, or
///   a forward pointer at a record that is not in the store.
/// - `Discovered`: a verified forward link (the application names an existing record) whose
///   reverse pointer is missing or names someone else. Integrated; the audit warns.
/// - `Bidirectional`: both pointers exist and agree.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "state", content = "target", rename_all = "snake_case")]
pub enum Link {
    Absent,
    Claimed(RecordRef),
    Discovered(RecordRef),
    Bidirectional(RecordRef),
}

impl Link {
    #[must_use]
    pub fn target(&self) -> Option<&RecordRef> {
        match self {
            Self::Absent => None,
            Self::Claimed(target) | Self::Discovered(target) | Self::Bidirectional(target) => {
                Some(target)
            }
        }
    }

    #[must_use]
    pub fn is_integrated(&self) -> bool {
        matches!(self, Self::Discovered(_) | Self::Bidirectional(_))
    }
}

/// Forward/reverse maps from orders and rentals to the applications that point at them.
///
/// Only non-draft applications are indexed, each list in encounter order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkIndex {
    pub applications_by_order: BTreeMap<OrderId, Vec<ApplicationId>>,
    pub applications_by_rental: BTreeMap<RentalId, Vec<ApplicationId>>,
}

impl LinkIndex {
    #[must_use]
    pub fn build(applications: &[ServiceApplication]) -> Self {
        let mut index = Self::default();
        for application in applications.iter().filter(|application| !application.is_draft()) {
            index.insert(application);
        }
        index
    }

    fn insert(&mut self, application: &ServiceApplication) {
        if let Some(order_id) = &application.order_id {
            let linked = self.applications_by_order.entry(order_id.clone()).or_default();
            if !linked.contains(&application.id) {
                linked.push(application.id.clone());
            }
        }

        if let Some(rental_id) = &application.rental_id {
            let linked = self.applications_by_rental.entry(rental_id.clone()).or_default();
            if !linked.contains(&application.id) {
                linked.push(application.id.clone());
            }
        }
    }

    #[must_use]
    pub fn applications_for_order(&self, order_id: &OrderId) -> &[ApplicationId] {
        self.applications_by_order.get(order_id).map(Vec::as_slice).unwrap_or_default()
    }

    #[must_use]
    pub fn applications_for_rental(&self, rental_id: &RentalId) -> &[ApplicationId] {
        self.applications_by_rental.get(rental_id).map(Vec::as_slice).unwrap_or_default()
    }
}

/// Draft applications keyed by id.
///
/// Consulted only to tell "claimed application exists but was never submitted" apart
/// from "claimed application is missing". Drafts never become feed items and never
/// contribute to classification or amounts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DraftIndex {
    by_id: BTreeMap<ApplicationId, ServiceApplication>,
}

impl DraftIndex {
    pub fn insert(&mut self, application: ServiceApplication) {
        self.by_id.entry(application.id.clone()).or_insert(application);
    }

    #[must_use]
    pub fn contains(&self, id: &ApplicationId) -> bool {
        self.by_id.contains_key(id)
    }

    #[must_use]
    pub fn get(&self, id: &ApplicationId) -> Option<&ServiceApplication> {
        self.by_id.get(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Ids to look up in the second, targeted application query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairRequest {
    pub order_ids: Vec<OrderId>,
    pub rental_ids: Vec<RentalId>,
    pub application_ids: Vec<ApplicationId>,
}

impl RepairRequest {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order_ids.is_empty() && self.rental_ids.is_empty() && self.application_ids.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepairStats {
    pub merged_applications: usize,
    pub indexed_drafts: usize,
    pub already_known: usize,
}

/// Orders and rentals referenced by working-set applications but outside the fetch window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillRequest {
    pub order_ids: Vec<OrderId>,
    pub rental_ids: Vec<RentalId>,
}

impl BackfillRequest {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order_ids.is_empty() && self.rental_ids.is_empty()
    }
}

/// The working set for one feed request.
///
/// `orders`, `rentals` and `applications` are the records that become feed items.
/// `reference_orders` and `reference_rentals` are counterparts fetched only so that
/// applications pointing outside the window can be audited and classified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordSet {
    pub orders: Vec<Order>,
    pub rentals: Vec<Rental>,
    pub applications: Vec<ServiceApplication>,
    pub drafts: DraftIndex,
    pub reference_orders: Vec<Order>,
    pub reference_rentals: Vec<Rental>,
    pub users: BTreeMap<UserId, User>,
}

impl RecordSet {
    /// Assemble the primary window. Drafts that slipped into `applications` move to the
    /// draft index.
    #[must_use]
    pub fn new(
        orders: Vec<Order>,
        rentals: Vec<Rental>,
        applications: Vec<ServiceApplication>,
    ) -> Self {
        let mut set = Self { orders, rentals, ..Self::default() };
        let mut known = BTreeSet::new();
        for application in applications {
            if application.is_draft() {
                set.drafts.insert(application);
            } else if known.insert(application.id.clone()) {
                set.applications.push(application);
            }
        }
        set
    }

    /// Ids for the repair query: every windowed order and rental, plus every application
    /// id claimed by one of them.
    #[must_use]
    pub fn repair_request(&self) -> RepairRequest {
        let order_ids = self.orders.iter().map(|order| order.id.clone()).collect::<Vec<_>>();
        let rental_ids = self.rentals.iter().map(|rental| rental.id.clone()).collect::<Vec<_>>();

        let mut claimed = BTreeSet::new();
        for order in &self.orders {
            if let Some(id) = &order.linked_application_id {
                claimed.insert(id.clone());
            }
        }
        for rental in &self.rentals {
            if let Some(id) = &rental.linked_application_id {
                claimed.insert(id.clone());
            }
        }

        RepairRequest { order_ids, rental_ids, application_ids: claimed.into_iter().collect() }
    }

    /// Merge the repair query's result. Unseen non-draft applications are appended after
    /// the primary window in the order returned; drafts go to the draft index.
    pub fn merge_repaired(&mut self, fetched: Vec<ServiceApplication>) -> RepairStats {
        let mut known =
            self.applications.iter().map(|application| application.id.clone()).collect::<BTreeSet<_>>();
        let mut stats = RepairStats::default();

        for application in fetched {
            if application.is_draft() {
                if !self.drafts.contains(&application.id) {
                    stats.indexed_drafts += 1;
                }
                self.drafts.insert(application);
                continue;
            }

            if known.insert(application.id.clone()) {
                self.applications.push(application);
                stats.merged_applications += 1;
            } else {
                stats.already_known += 1;
            }
        }

        stats
    }

    /// Counterparts named by working-set applications that are not in the window.
    #[must_use]
    pub fn backfill_request(&self) -> BackfillRequest {
        let window_orders = self.orders.iter().map(|order| &order.id).collect::<BTreeSet<_>>();
        let window_rentals = self.rentals.iter().map(|rental| &rental.id).collect::<BTreeSet<_>>();

        let mut order_ids = BTreeSet::new();
        let mut rental_ids = BTreeSet::new();
        for application in &self.applications {
            if let Some(order_id) = &application.order_id {
                if !window_orders.contains(order_id) {
                    order_ids.insert(order_id.clone());
                }
            }
            if let Some(rental_id) = &application.rental_id {
                if !window_rentals.contains(rental_id) {
                    rental_ids.insert(rental_id.clone());
                }
            }
        }

        BackfillRequest {
            order_ids: order_ids.into_iter().collect(),
            rental_ids: rental_ids.into_iter().collect(),
        }
    }

    pub fn merge_backfill(&mut self, orders: Vec<Order>, rentals: Vec<Rental>) {
        let mut known_orders = self
            .orders
            .iter()
            .chain(&self.reference_orders)
            .map(|order| order.id.clone())
            .collect::<BTreeSet<_>>();
        for order in orders {
            if known_orders.insert(order.id.clone()) {
                self.reference_orders.push(order);
            }
        }

        let mut known_rentals = self
            .rentals
            .iter()
            .chain(&self.reference_rentals)
            .map(|rental| rental.id.clone())
            .collect::<BTreeSet<_>>();
        for rental in rentals {
            if known_rentals.insert(rental.id.clone()) {
                self.reference_rentals.push(rental);
            }
        }
    }

    #[must_use]
    pub fn rental_user_ids(&self) -> Vec<UserId> {
        self.rentals
            .iter()
            .filter_map(|rental| rental.user_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn set_users(&mut self, users: Vec<User>) {
        for user in users {
            self.users.insert(user.id.clone(), user);
        }
    }

    /// Window and reference orders by id; window entries win.
    #[must_use]
    pub fn order_lookup(&self) -> BTreeMap<&OrderId, &Order> {
        let mut lookup = BTreeMap::new();
        for order in self.orders.iter().chain(&self.reference_orders) {
            lookup.entry(&order.id).or_insert(order);
        }
        lookup
    }

    /// Window and reference rentals by id; window entries win.
    #[must_use]
    pub fn rental_lookup(&self) -> BTreeMap<&RentalId, &Rental> {
        let mut lookup = BTreeMap::new();
        for rental in self.rentals.iter().chain(&self.reference_rentals) {
            lookup.entry(&rental.id).or_insert(rental);
        }
        lookup
    }
}

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::audit::{audit, AuditReport};
use crate::classify::{classify_flow, settlement_anchor, Flow, FlowInputs, SettlementAnchor};
use crate::labels;
use crate::links::{LinkIndex, RecordRef, RecordSet};
use crate::model::{Customer, OrderId, RecordKind};

pub const PAYMENT_DIFFERS_FROM_ANCHOR: &str = "payment state differs from anchor";
pub const MEMBERS_DISAGREE_ON_PAYMENT: &str = "members disagree on payment state";
pub const MEMBERS_DISAGREE_ON_STATUS: &str = "members disagree on status";

/// The unit of filter preservation: `order:<id>`, `rental:<id>` or `app:<id>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct GroupKey(pub String);

impl GroupKey {
    #[must_use]
    pub fn of(record: &RecordRef) -> Self {
        let prefix = match record.kind {
            RecordKind::Order => "order",
            RecordKind::Rental => "rental",
            RecordKind::StringingApplication => "app",
        };
        Self(format!("{prefix}:{}", record.id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for GroupKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RelatedItem {
    pub kind: RecordKind,
    pub id: String,
    pub href: String,
}

impl RelatedItem {
    fn to(record: &RecordRef) -> Self {
        Self { kind: record.kind, id: record.id.clone(), href: labels::href(record.kind, &record.id) }
    }
}

/// One row of the unified operations feed.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationItem {
    pub id: String,
    pub kind: RecordKind,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    pub customer: Customer,
    pub title: String,
    pub status_label: String,
    pub payment_label: Option<String>,
    pub amount: i64,
    pub flow: Flow,
    pub flow_label: String,
    pub settlement_anchor: SettlementAnchor,
    pub settlement_label: String,
    pub href: String,
    pub related: Option<RelatedItem>,
    pub is_integrated: bool,
    pub warn_reasons: Vec<String>,
    pub pending_reasons: Vec<String>,
    #[serde(skip)]
    pub group_key: GroupKey,
}

impl OperationItem {
    #[must_use]
    pub fn is_warned(&self) -> bool {
        !self.warn_reasons.is_empty()
    }
}

/// Per-kind display fields, before audit and classification are folded in.
struct Basics {
    me: RecordRef,
    created_at: Option<OffsetDateTime>,
    customer: Customer,
    title: String,
    status_label: String,
    payment_label: Option<String>,
    amount: i64,
}

fn assemble(basics: Basics, report: &AuditReport, has_racket: bool) -> OperationItem {
    let Basics { me, created_at, customer, title, status_label, payment_label, amount } = basics;
    let link = report.link(&me);
    let flow = classify_flow(FlowInputs {
        kind: me.kind,
        integrated: link.is_integrated(),
        counterpart: link.target().map(|target| target.kind),
        has_racket,
    });
    let settlement = settlement_anchor(me.kind, link);

    let related = link.target().map(RelatedItem::to);

    let group_key = match (me.kind, link.target()) {
        (RecordKind::StringingApplication, Some(target)) => GroupKey::of(target),
        _ => GroupKey::of(&me),
    };

    let findings = report.findings(&me).cloned().unwrap_or_default();
    OperationItem {
        href: labels::href(me.kind, &me.id),
        is_integrated: link.is_integrated(),
        kind: me.kind,
        id: me.id,
        created_at,
        customer,
        title,
        status_label,
        payment_label,
        amount,
        flow,
        flow_label: flow.label().to_string(),
        settlement_anchor: settlement,
        settlement_label: settlement.label().to_string(),
        related,
        warn_reasons: findings.warn_reasons,
        pending_reasons: findings.pending_reasons,
        group_key,
    }
}

/// Audit, classify and flatten the working set into feed items: window orders, then
/// window rentals, then applications. Reference records never become items.
#[must_use]
pub fn build_feed(records: &RecordSet) -> Vec<OperationItem> {
    let index = LinkIndex::build(&records.applications);
    let report = audit(records, &index);
    let orders = records.order_lookup();
    let mut items =
        Vec::with_capacity(records.orders.len() + records.rentals.len() + records.applications.len());

    for order in &records.orders {
        let basics = Basics {
            me: RecordRef::order(&order.id),
            created_at: order.created_at,
            customer: order.customer.clone(),
            title: labels::order_title(order),
            status_label: labels::status_label(&order.status),
            payment_label: Some(labels::payment_label(&order.payment_status)),
            amount: order.total_amount,
        };
        items.push(assemble(basics, &report, order.has_racket_item()));
    }

    for rental in &records.rentals {
        let customer = rental
            .user_id
            .as_ref()
            .and_then(|user_id| records.users.get(user_id))
            .map(|user| Customer::new(user.name.clone(), user.email.clone()))
            .unwrap_or_default();
        let basics = Basics {
            me: RecordRef::rental(&rental.id),
            created_at: rental.created_at,
            customer,
            title: labels::rental_title(rental),
            status_label: labels::status_label(&rental.status),
            payment_label: None,
            amount: rental.amount(),
        };
        items.push(assemble(basics, &report, false));
    }

    for application in &records.applications {
        let me = RecordRef::application(&application.id);
        let link = report.link(&me);
        let has_racket = match link.target() {
            Some(target) if link.is_integrated() && target.kind == RecordKind::Order => orders
                .get(&OrderId::new(target.id.clone()))
                .is_some_and(|order| order.has_racket_item()),
            _ => false,
        };
        let basics = Basics {
            me,
            created_at: application.created_at,
            customer: application.customer.clone(),
            title: labels::APPLICATION_TITLE.to_string(),
            status_label: labels::status_label(&application.status),
            payment_label: application.payment_status.as_deref().map(labels::payment_label),
            amount: application.total_price,
        };
        items.push(assemble(basics, &report, has_racket));
    }

    items
}

/// A group key with its anchor and every member, in feed order.
#[derive(Debug, Clone)]
pub struct OperationGroup<'a> {
    pub key: &'a GroupKey,
    pub anchor: &'a OperationItem,
    pub members: Vec<&'a OperationItem>,
    /// Cross-member consistency findings; member warnings stay on the members.
    pub warn_reasons: Vec<String>,
}

impl OperationGroup<'_> {
    #[must_use]
    pub fn is_warned(&self) -> bool {
        !self.warn_reasons.is_empty() || self.members.iter().any(|member| member.is_warned())
    }

    #[must_use]
    pub fn is_integrated(&self) -> bool {
        self.members.iter().any(|member| member.is_integrated)
    }

    #[must_use]
    pub fn latest(&self) -> Option<OffsetDateTime> {
        self.members.iter().filter_map(|member| member.created_at).max()
    }

    /// Members ordered by kind priority, feed order within a kind.
    #[must_use]
    pub fn flattened(&self) -> Vec<&OperationItem> {
        let mut members = self.members.clone();
        members.sort_by_key(|member| member.kind.priority());
        members
    }
}

/// Group items by key, keeping groups in first-seen order.
#[must_use]
pub fn group_items(items: &[OperationItem]) -> Vec<OperationGroup<'_>> {
    let mut order: Vec<&GroupKey> = Vec::new();
    let mut members: BTreeMap<&GroupKey, Vec<&OperationItem>> = BTreeMap::new();
    for item in items {
        let slot = members.entry(&item.group_key).or_insert_with(|| {
            order.push(&item.group_key);
            Vec::new()
        });
        slot.push(item);
    }

    order
        .into_iter()
        .filter_map(|key| {
            let members = members.remove(key)?;
            let anchor = *members.iter().min_by_key(|member| member.kind.priority())?;
            let warn_reasons = consistency_findings(anchor, &members);
            Some(OperationGroup { key, anchor, members, warn_reasons })
        })
        .collect()
}

fn consistency_findings(anchor: &OperationItem, members: &[&OperationItem]) -> Vec<String> {
    let children = members
        .iter()
        .filter(|member| !std::ptr::eq(**member, anchor))
        .collect::<Vec<_>>();
    let mut findings = Vec::new();

    if let Some(anchor_payment) = &anchor.payment_label {
        for child in &children {
            if let Some(payment) = &child.payment_label {
                if payment != anchor_payment {
                    findings.push(format!(
                        "{PAYMENT_DIFFERS_FROM_ANCHOR}: {} {} is {payment}, {} {} is {anchor_payment}",
                        child.kind.as_str(),
                        child.id,
                        anchor.kind.as_str(),
                        anchor.id
                    ));
                }
            }
        }
    }

    let payments = children
        .iter()
        .filter_map(|child| child.payment_label.as_deref())
        .collect::<BTreeSet<_>>();
    if payments.len() > 1 {
        findings.push(format!(
            "{MEMBERS_DISAGREE_ON_PAYMENT}: {}",
            payments.into_iter().collect::<Vec<_>>().join(", ")
        ));
    }

    for kind in RecordKind::PRIORITY {
        let statuses = children
            .iter()
            .filter(|child| child.kind == kind)
            .map(|child| child.status_label.as_str())
            .collect::<BTreeSet<_>>();
        if statuses.len() > 1 {
            findings.push(format!(
                "{MEMBERS_DISAGREE_ON_STATUS}: {} {}",
                kind.as_str(),
                statuses.into_iter().collect::<Vec<_>>().join(", ")
            ));
        }
    }

    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::reasons;
    use crate::model::{
        ApplicationId, GoodsKind, LineItem, Order, Rental, RentalId, ServiceApplication, User, UserId,
    };

    fn order(id: &str, linked: Option<&str>, racket: bool) -> Order {
        Order {
            id: OrderId::from(id),
            created_at: None,
            status: "paid".to_string(),
            payment_status: "paid".to_string(),
            total_amount: 180_000,
            items: vec![LineItem {
                name: if racket { "Pro Staff 97" } else { "Poly Tour 1.25" }.to_string(),
                kind: if racket { GoodsKind::Racket } else { GoodsKind::String },
                quantity: 1,
                unit_price: 180_000,
            }],
            customer: Customer::new("Kim", "kim@example.com"),
            linked_application_id: linked.map(ApplicationId::from),
            service_claimed_applied: linked.is_some(),
        }
    }

    fn application(id: &str, order_id: Option<&str>, rental_id: Option<&str>) -> ServiceApplication {
        ServiceApplication {
            id: ApplicationId::from(id),
            created_at: None,
            status: "received".to_string(),
            payment_status: Some("paid".to_string()),
            total_price: 25_000,
            order_id: order_id.map(OrderId::from),
            rental_id: rental_id.map(RentalId::from),
            customer: Customer::new("Kim", "kim@example.com"),
        }
    }

    fn find<'a>(items: &'a [OperationItem], id: &str) -> &'a OperationItem {
        items
            .iter()
            .find(|item| item.id == id)
            .unwrap_or_else(|| panic!("item {id} should be in the feed"))
    }

    #[test]
    fn standalone_racket_order_is_pending_flow_four() {
        let records = RecordSet::new(vec![order("O1", None, true)], vec![], vec![]);
        let items = build_feed(&records);
        let o1 = find(&items, "O1");

        assert_eq!(o1.flow.code(), 4);
        assert!(!o1.is_integrated);
        assert_eq!(o1.pending_reasons, vec![reasons::SERVICE_NOT_YET_REQUESTED.to_string()]);
        assert!(o1.warn_reasons.is_empty());
        assert!(o1.related.is_none());
        assert_eq!(o1.group_key.as_str(), "order:O1");
    }

    #[test]
    fn integrated_order_and_application_share_group_and_settlement() {
        let records = RecordSet::new(
            vec![order("O2", Some("A1"), false)],
            vec![],
            vec![application("A1", Some("O2"), None)],
        );
        let items = build_feed(&records);
        let o2 = find(&items, "O2");
        let a1 = find(&items, "A1");

        assert_eq!(o2.flow.code(), 2);
        assert_eq!(a1.flow.code(), 2);
        assert!(o2.is_integrated && a1.is_integrated);
        assert_eq!(o2.settlement_anchor, SettlementAnchor::Order);
        assert_eq!(a1.settlement_anchor, SettlementAnchor::Order);
        assert_eq!(a1.group_key, o2.group_key);
        assert_eq!(
            a1.related.as_ref().map(|related| related.href.as_str()),
            Some("/admin/orders/O2")
        );
        assert!(o2.warn_reasons.is_empty() && a1.warn_reasons.is_empty());
        assert!(o2.pending_reasons.is_empty() && a1.pending_reasons.is_empty());
    }

    #[test]
    fn application_linked_to_racket_order_outside_window_uses_reference_order() {
        let mut records = RecordSet::new(vec![], vec![], vec![application("A1", Some("O9"), None)]);
        records.merge_backfill(vec![order("O9", Some("A1"), true)], vec![]);
        let items = build_feed(&records);

        assert_eq!(items.len(), 1);
        let a1 = find(&items, "A1");
        assert_eq!(a1.flow.code(), 5);
        assert_eq!(a1.settlement_anchor, SettlementAnchor::Order);
        assert!(a1.warn_reasons.is_empty());
    }

    #[test]
    fn forward_link_from_repaired_application_integrates_without_order_claim() {
        let mut records = RecordSet::new(vec![order("O3", None, true)], vec![], vec![]);
        let stats = records.merge_repaired(vec![application("A3", Some("O3"), None)]);
        assert_eq!(stats.merged_applications, 1);
        let items = build_feed(&records);
        let o3 = find(&items, "O3");
        let a3 = find(&items, "A3");

        assert!(o3.is_integrated && a3.is_integrated);
        assert_eq!(o3.flow.code(), 5);
        assert_eq!(a3.flow.code(), 5);
        assert_eq!(a3.settlement_anchor, SettlementAnchor::Order);
        assert_eq!(a3.group_key, o3.group_key);
        assert_eq!(o3.related.as_ref().map(|related| related.id.as_str()), Some("A3"));
        assert!(o3
            .warn_reasons
            .iter()
            .any(|reason| reason.starts_with(reasons::REVERSE_POINTER_MISSING)));
        assert!(o3.pending_reasons.is_empty());
        assert!(a3
            .warn_reasons
            .iter()
            .any(|reason| reason.starts_with(reasons::ORDER_DOES_NOT_POINT_BACK)));
    }

    #[test]
    fn rental_customer_resolves_through_users() {
        let rental = Rental {
            id: RentalId::from("R1"),
            created_at: None,
            status: "out".to_string(),
            fee: 15_000,
            deposit: 100_000,
            days: 7,
            user_id: Some(UserId::from("U1")),
            linked_application_id: None,
            service_requested: false,
        };
        let mut orphan = rental.clone();
        orphan.id = RentalId::from("R2");
        orphan.user_id = Some(UserId::from("U404"));

        let mut records = RecordSet::new(vec![], vec![rental, orphan], vec![]);
        records.set_users(vec![User {
            id: UserId::from("U1"),
            name: "Lee".to_string(),
            email: "lee@example.com".to_string(),
        }]);
        let items = build_feed(&records);

        let r1 = find(&items, "R1");
        assert_eq!(r1.customer.name.as_deref(), Some("Lee"));
        assert_eq!(r1.amount, 115_000);
        assert_eq!(r1.payment_label, None);
        assert_eq!(r1.title, "Racket rental (7 days)");
        assert_eq!(r1.status_label, "Out on rental");
        assert_eq!(find(&items, "R2").customer, Customer::default());
    }

    #[test]
    fn group_anchor_prefers_order_and_flags_payment_contradiction() {
        let mut unpaid = application("A1", Some("O1"), None);
        unpaid.payment_status = Some("unpaid".to_string());
        let records =
            RecordSet::new(vec![order("O1", Some("A1"), false)], vec![], vec![unpaid]);
        let items = build_feed(&records);
        let groups = group_items(&items);

        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.anchor.id, "O1");
        assert!(group.members.iter().all(|member| !member.is_warned()));
        assert!(group.is_warned());
        assert!(group.warn_reasons[0].starts_with(PAYMENT_DIFFERS_FROM_ANCHOR));
    }

    #[test]
    fn multiply_linked_order_flags_sibling_status_disagreement() {
        let mut second = application("A2", Some("O1"), None);
        second.status = "completed".to_string();
        let records = RecordSet::new(
            vec![order("O1", Some("A1"), false)],
            vec![],
            vec![application("A1", Some("O1"), None), second],
        );
        let items = build_feed(&records);
        let groups = group_items(&items);

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members.len(), 3);
        assert!(groups[0]
            .warn_reasons
            .iter()
            .any(|reason| reason.starts_with(MEMBERS_DISAGREE_ON_STATUS)));
        let o1 = find(&items, "O1");
        assert_eq!(o1.related.as_ref().map(|related| related.id.as_str()), Some("A1"));
    }

    #[test]
    fn flattened_group_orders_members_by_kind_priority() {
        let records = RecordSet::new(
            vec![order("O1", Some("A1"), false)],
            vec![],
            vec![application("A1", Some("O1"), None)],
        );
        let mut items = build_feed(&records);
        items.reverse();
        let groups = group_items(&items);
        let flattened = groups[0].flattened();

        assert_eq!(flattened.first().map(|item| item.kind), Some(RecordKind::Order));
        assert_eq!(groups[0].anchor.kind, RecordKind::Order);
    }
}

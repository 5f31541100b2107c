use std::collections::BTreeMap;

use crate::links::{DraftIndex, Link, LinkIndex, RecordRef, RecordSet};
use crate::model::{ApplicationId, OrderId, RecordKind, RentalId, ServiceApplication};

pub mod reasons {
    pub const MULTIPLE_LINKED_APPLICATIONS: &str = "multiple linked applications";
    pub const REVERSE_POINTER_MISSING: &str = "reverse pointer missing";
    pub const CLAIMED_APPLICATION_NOT_FOUND: &str = "claimed application not found in store";
    pub const CLAIMED_ORDER_ID_MISMATCH: &str = "claimed application's orderId mismatch";
    pub const CLAIMED_RENTAL_ID_MISMATCH: &str = "claimed application's rentalId mismatch";
    pub const ORDER_ID_MISMATCH_WITH_CLAIMING_ORDER: &str = "orderId mismatch with claiming order";
    pub const RENTAL_ID_MISMATCH_WITH_CLAIMING_RENTAL: &str =
        "rentalId mismatch with claiming rental";
    pub const CLAIM_AND_DISCOVERY_DISAGREE: &str =
        "claimed pointer and discovered links disagree";
    pub const SERVICE_CLAIMED_WITHOUT_APPLICATION: &str =
        "service marked as applied but no application found";
    pub const LINKED_ORDER_NOT_FOUND: &str = "linked order not found";
    pub const LINKED_RENTAL_NOT_FOUND: &str = "linked rental not found";
    pub const ORDER_DOES_NOT_POINT_BACK: &str = "order does not point back to this application";
    pub const RENTAL_DOES_NOT_POINT_BACK: &str = "rental does not point back to this application";
    pub const LINKED_TO_ORDER_AND_RENTAL: &str = "linked to both an order and a rental";

    pub const SERVICE_NOT_YET_REQUESTED: &str = "service not yet requested";
    pub const APPLICATION_NOT_SUBMITTED: &str = "application exists but not yet submitted";
}

/// Warning and pending annotations for one record. Reasons are de-duplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Findings {
    pub warn_reasons: Vec<String>,
    pub pending_reasons: Vec<String>,
}

impl Findings {
    fn warn(&mut self, reason: impl Into<String>) {
        push_unique(&mut self.warn_reasons, reason.into());
    }

    fn pending(&mut self, reason: impl Into<String>) {
        push_unique(&mut self.pending_reasons, reason.into());
    }
}

fn push_unique(reasons: &mut Vec<String>, reason: String) {
    if !reasons.contains(&reason) {
        reasons.push(reason);
    }
}

/// Result of one audit pass over the working set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub links: BTreeMap<RecordRef, Link>,
    pub findings: BTreeMap<RecordRef, Findings>,
}

impl AuditReport {
    #[must_use]
    pub fn link(&self, record: &RecordRef) -> &Link {
        self.links.get(record).unwrap_or(&Link::Absent)
    }

    #[must_use]
    pub fn findings(&self, record: &RecordRef) -> Option<&Findings> {
        self.findings.get(record)
    }

    fn findings_mut(&mut self, record: RecordRef) -> &mut Findings {
        self.findings.entry(record).or_default()
    }
}

/// An order or rental seen from the audit's side: the pointer it stores, whether it
/// asserts the service was applied, and which applications point back at it.
struct AnchorSubject<'a> {
    kind: RecordKind,
    id: &'a str,
    claimed: Option<&'a ApplicationId>,
    claims_completion: bool,
    discovered: &'a [ApplicationId],
}

impl AnchorSubject<'_> {
    fn record_ref(&self) -> RecordRef {
        RecordRef { kind: self.kind, id: self.id.to_string() }
    }

    fn back_pointer<'b>(&self, application: &'b ServiceApplication) -> Option<&'b str> {
        match self.kind {
            RecordKind::Order => application.order_id.as_ref().map(OrderId::as_str),
            RecordKind::Rental => application.rental_id.as_ref().map(RentalId::as_str),
            RecordKind::StringingApplication => None,
        }
    }

    fn subject_mismatch(&self) -> &'static str {
        match self.kind {
            RecordKind::Rental => reasons::CLAIMED_RENTAL_ID_MISMATCH,
            _ => reasons::CLAIMED_ORDER_ID_MISMATCH,
        }
    }

    fn application_mismatch(&self) -> &'static str {
        match self.kind {
            RecordKind::Rental => reasons::RENTAL_ID_MISMATCH_WITH_CLAIMING_RENTAL,
            _ => reasons::ORDER_ID_MISMATCH_WITH_CLAIMING_ORDER,
        }
    }

    /// A verified forward link outranks an unconfirmed claim; the claim's
    /// disagreement is reported separately.
    fn link(&self) -> Link {
        match (self.claimed, self.discovered.first()) {
            (Some(claimed), _) if self.discovered.contains(claimed) => {
                Link::Bidirectional(RecordRef::application(claimed))
            }
            (_, Some(first)) => Link::Discovered(RecordRef::application(first)),
            (Some(claimed), None) => Link::Claimed(RecordRef::application(claimed)),
            (None, None) => Link::Absent,
        }
    }
}

/// Compare every record's claimed links against the link index and annotate the
/// contradictions (warnings) and the normal, expected absences (pending).
#[must_use]
pub fn audit(records: &RecordSet, index: &LinkIndex) -> AuditReport {
    let applications = records
        .applications
        .iter()
        .map(|application| (&application.id, application))
        .collect::<BTreeMap<_, _>>();
    let mut report = AuditReport::default();

    for order in &records.orders {
        let subject = AnchorSubject {
            kind: RecordKind::Order,
            id: order.id.as_str(),
            claimed: order.linked_application_id.as_ref(),
            claims_completion: order.service_claimed_applied,
            discovered: index.applications_for_order(&order.id),
        };
        audit_anchor(&subject, &applications, &records.drafts, &mut report);
    }

    for rental in &records.rentals {
        let subject = AnchorSubject {
            kind: RecordKind::Rental,
            id: rental.id.as_str(),
            claimed: rental.linked_application_id.as_ref(),
            claims_completion: rental.service_requested,
            discovered: index.applications_for_rental(&rental.id),
        };
        audit_anchor(&subject, &applications, &records.drafts, &mut report);
    }

    audit_applications(records, &mut report);
    report
}

fn audit_anchor(
    subject: &AnchorSubject<'_>,
    applications: &BTreeMap<&ApplicationId, &ServiceApplication>,
    drafts: &DraftIndex,
    report: &mut AuditReport,
) {
    let mut findings = Findings::default();
    let discovered = subject.discovered;

    if discovered.len() > 1 {
        let ids = discovered.iter().map(ApplicationId::as_str).collect::<Vec<_>>();
        findings.warn(format!(
            "{}: {} applications ({})",
            reasons::MULTIPLE_LINKED_APPLICATIONS,
            discovered.len(),
            ids.join(", ")
        ));
    }

    match subject.claimed {
        None => {
            if let Some(first) = discovered.first() {
                findings.warn(format!(
                    "{}: application {first} points here but no linked application is recorded",
                    reasons::REVERSE_POINTER_MISSING
                ));
            } else if subject.claims_completion {
                findings.warn(reasons::SERVICE_CLAIMED_WITHOUT_APPLICATION);
            } else {
                findings.pending(reasons::SERVICE_NOT_YET_REQUESTED);
            }
        }
        Some(claimed) => {
            match applications.get(claimed) {
                None if drafts.contains(claimed) => {
                    findings.pending(reasons::APPLICATION_NOT_SUBMITTED);
                }
                None if !subject.claims_completion && discovered.is_empty() => {
                    findings.pending(reasons::SERVICE_NOT_YET_REQUESTED);
                }
                None => {
                    findings
                        .warn(format!("{}: {claimed}", reasons::CLAIMED_APPLICATION_NOT_FOUND));
                }
                Some(application) => {
                    let back_pointer = subject.back_pointer(application);
                    if back_pointer != Some(subject.id) {
                        findings.warn(format!(
                            "{}: application {claimed} points to {}",
                            subject.subject_mismatch(),
                            back_pointer.unwrap_or("nothing")
                        ));
                        report.findings_mut(RecordRef::application(claimed)).warn(format!(
                            "{}: {} {} claims this application",
                            subject.application_mismatch(),
                            subject.kind.as_str(),
                            subject.id
                        ));
                    }
                }
            }

            if !discovered.is_empty() && !discovered.contains(claimed) {
                let ids = discovered.iter().map(ApplicationId::as_str).collect::<Vec<_>>();
                findings.warn(format!(
                    "{}: claims {claimed}, discovered {}",
                    reasons::CLAIM_AND_DISCOVERY_DISAGREE,
                    ids.join(", ")
                ));
            }
        }
    }

    report.links.insert(subject.record_ref(), subject.link());
    let slot = report.findings_mut(subject.record_ref());
    for reason in findings.warn_reasons {
        slot.warn(reason);
    }
    for reason in findings.pending_reasons {
        slot.pending(reason);
    }
}

fn audit_applications(records: &RecordSet, report: &mut AuditReport) {
    let orders = records.order_lookup();
    let rentals = records.rental_lookup();

    let mut claimers: BTreeMap<&ApplicationId, RecordRef> = BTreeMap::new();
    for order in &records.orders {
        if let Some(id) = &order.linked_application_id {
            claimers.entry(id).or_insert_with(|| RecordRef::order(&order.id));
        }
    }
    for rental in &records.rentals {
        if let Some(id) = &rental.linked_application_id {
            claimers.entry(id).or_insert_with(|| RecordRef::rental(&rental.id));
        }
    }

    for application in &records.applications {
        let me = RecordRef::application(&application.id);
        let mut findings = Findings::default();

        if application.order_id.is_some() && application.rental_id.is_some() {
            findings.warn(reasons::LINKED_TO_ORDER_AND_RENTAL);
        }

        let order_link = application.order_id.as_ref().map(|order_id| {
            let target = RecordRef::order(order_id);
            match orders.get(order_id) {
                None => {
                    findings.warn(format!("{}: {order_id}", reasons::LINKED_ORDER_NOT_FOUND));
                    Link::Claimed(target)
                }
                Some(order) if order.linked_application_id.as_ref() == Some(&application.id) => {
                    Link::Bidirectional(target)
                }
                Some(order) => {
                    findings.warn(format!(
                        "{}: order {order_id} points to {}",
                        reasons::ORDER_DOES_NOT_POINT_BACK,
                        order.linked_application_id.as_ref().map_or("nothing", ApplicationId::as_str)
                    ));
                    Link::Discovered(target)
                }
            }
        });

        let rental_link = application.rental_id.as_ref().map(|rental_id| {
            let target = RecordRef::rental(rental_id);
            match rentals.get(rental_id) {
                None => {
                    findings.warn(format!("{}: {rental_id}", reasons::LINKED_RENTAL_NOT_FOUND));
                    Link::Claimed(target)
                }
                Some(rental) if rental.linked_application_id.as_ref() == Some(&application.id) => {
                    Link::Bidirectional(target)
                }
                Some(rental) => {
                    findings.warn(format!(
                        "{}: rental {rental_id} points to {}",
                        reasons::RENTAL_DOES_NOT_POINT_BACK,
                        rental.linked_application_id.as_ref().map_or("nothing", ApplicationId::as_str)
                    ));
                    Link::Discovered(target)
                }
            }
        });

        // The order pointer wins when both are set.
        let link = order_link
            .or(rental_link)
            .or_else(|| claimers.get(&application.id).cloned().map(Link::Claimed))
            .unwrap_or(Link::Absent);

        report.links.insert(me.clone(), link);
        let slot = report.findings_mut(me);
        for reason in findings.warn_reasons {
            slot.warn(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Customer, Order, Rental};

    fn order(id: &str, linked: Option<&str>, claims: bool) -> Order {
        Order {
            id: OrderId::from(id),
            created_at: None,
            status: "paid".to_string(),
            payment_status: "paid".to_string(),
            total_amount: 50_000,
            items: Vec::new(),
            customer: Customer::new("Kim", "kim@example.com"),
            linked_application_id: linked.map(ApplicationId::from),
            service_claimed_applied: claims,
        }
    }

    fn rental(id: &str, linked: Option<&str>) -> Rental {
        Rental {
            id: RentalId::from(id),
            created_at: None,
            status: "out".to_string(),
            fee: 15_000,
            deposit: 100_000,
            days: 7,
            user_id: None,
            linked_application_id: linked.map(ApplicationId::from),
            service_requested: false,
        }
    }

    fn application(
        id: &str,
        order_id: Option<&str>,
        rental_id: Option<&str>,
        status: &str,
    ) -> ServiceApplication {
        ServiceApplication {
            id: ApplicationId::from(id),
            created_at: None,
            status: status.to_string(),
            payment_status: Some("paid".to_string()),
            total_price: 25_000,
            order_id: order_id.map(OrderId::from),
            rental_id: rental_id.map(RentalId::from),
            customer: Customer::new("Kim", "kim@example.com"),
        }
    }

    fn run(records: &RecordSet) -> AuditReport {
        audit(records, &LinkIndex::build(&records.applications))
    }

    fn warns(report: &AuditReport, record: &RecordRef) -> Vec<String> {
        report.findings(record).map(|findings| findings.warn_reasons.clone()).unwrap_or_default()
    }

    fn pendings(report: &AuditReport, record: &RecordRef) -> Vec<String> {
        report.findings(record).map(|findings| findings.pending_reasons.clone()).unwrap_or_default()
    }

    #[test]
    fn absent_link_without_claim_is_pending() {
        let records = RecordSet::new(vec![order("O1", None, false)], vec![], vec![]);
        let report = run(&records);
        let me = RecordRef::order(&OrderId::from("O1"));

        assert_eq!(pendings(&report, &me), vec![reasons::SERVICE_NOT_YET_REQUESTED.to_string()]);
        assert!(warns(&report, &me).is_empty());
        assert_eq!(report.link(&me), &Link::Absent);
    }

    #[test]
    fn completion_claim_without_any_application_is_a_warning() {
        let records = RecordSet::new(vec![order("O1", None, true)], vec![], vec![]);
        let report = run(&records);
        let me = RecordRef::order(&OrderId::from("O1"));

        assert_eq!(warns(&report, &me), vec![reasons::SERVICE_CLAIMED_WITHOUT_APPLICATION.to_string()]);
        assert!(pendings(&report, &me).is_empty());
    }

    #[test]
    fn bidirectional_link_is_clean_on_both_sides() {
        let records = RecordSet::new(
            vec![order("O2", Some("A1"), true)],
            vec![],
            vec![application("A1", Some("O2"), None, "received")],
        );
        let report = run(&records);
        let order_ref = RecordRef::order(&OrderId::from("O2"));
        let app_ref = RecordRef::application(&ApplicationId::from("A1"));

        assert!(report.link(&order_ref).is_integrated());
        assert!(report.link(&app_ref).is_integrated());
        assert!(warns(&report, &order_ref).is_empty());
        assert!(warns(&report, &app_ref).is_empty());
        assert!(pendings(&report, &order_ref).is_empty());
    }

    #[test]
    fn mismatched_claim_warns_both_sides() {
        let records = RecordSet::new(
            vec![order("O3", Some("A2"), true)],
            vec![],
            vec![application("A2", Some("O9"), None, "received")],
        );
        let report = run(&records);
        let order_ref = RecordRef::order(&OrderId::from("O3"));
        let app_ref = RecordRef::application(&ApplicationId::from("A2"));

        assert!(warns(&report, &order_ref)
            .iter()
            .any(|reason| reason.starts_with(reasons::CLAIMED_ORDER_ID_MISMATCH)));
        assert!(warns(&report, &app_ref)
            .iter()
            .any(|reason| reason.starts_with(reasons::ORDER_ID_MISMATCH_WITH_CLAIMING_ORDER)));
        assert!(warns(&report, &app_ref)
            .iter()
            .any(|reason| reason.starts_with(reasons::LINKED_ORDER_NOT_FOUND)));
        assert_eq!(report.link(&order_ref), &Link::Claimed(app_ref.clone()));
        assert_eq!(report.link(&app_ref), &Link::Claimed(RecordRef::order(&OrderId::from("O9"))));
        assert!(!report.link(&app_ref).is_integrated());
    }

    #[test]
    fn forward_only_rental_link_reports_missing_reverse_pointer() {
        let records = RecordSet::new(
            vec![],
            vec![rental("R1", None)],
            vec![application("A3", None, Some("R1"), "received")],
        );
        let report = run(&records);
        let rental_ref = RecordRef::rental(&RentalId::from("R1"));
        let app_ref = RecordRef::application(&ApplicationId::from("A3"));

        assert!(warns(&report, &rental_ref)
            .iter()
            .any(|reason| reason.starts_with(reasons::REVERSE_POINTER_MISSING)));
        assert!(pendings(&report, &rental_ref).is_empty());
        assert_eq!(report.link(&rental_ref), &Link::Discovered(app_ref.clone()));
        assert_eq!(report.link(&app_ref), &Link::Discovered(rental_ref.clone()));
        assert!(report.link(&rental_ref).is_integrated());
        assert!(report.link(&app_ref).is_integrated());
        assert!(warns(&report, &app_ref)
            .iter()
            .any(|reason| reason.starts_with(reasons::RENTAL_DOES_NOT_POINT_BACK)));
    }

    #[test]
    fn claim_on_draft_application_is_pending() {
        let records = RecordSet::new(
            vec![order("O4", Some("A5"), true)],
            vec![],
            vec![application("A5", Some("O4"), None, "draft")],
        );
        let report = run(&records);
        let me = RecordRef::order(&OrderId::from("O4"));

        assert_eq!(pendings(&report, &me), vec![reasons::APPLICATION_NOT_SUBMITTED.to_string()]);
        assert!(warns(&report, &me).is_empty());
        assert!(!report.link(&me).is_integrated());
    }

    #[test]
    fn missing_claimed_application_depends_on_completion_claim() {
        let unclaimed = RecordSet::new(vec![order("O5", Some("A404"), false)], vec![], vec![]);
        let report = run(&unclaimed);
        let me = RecordRef::order(&OrderId::from("O5"));
        assert_eq!(pendings(&report, &me), vec![reasons::SERVICE_NOT_YET_REQUESTED.to_string()]);
        assert!(warns(&report, &me).is_empty());

        let claimed = RecordSet::new(vec![order("O5", Some("A404"), true)], vec![], vec![]);
        let report = run(&claimed);
        assert!(warns(&report, &me)
            .iter()
            .any(|reason| reason.starts_with(reasons::CLAIMED_APPLICATION_NOT_FOUND)));
        assert!(pendings(&report, &me).is_empty());
    }

    #[test]
    fn multiple_discovered_applications_warn_and_keep_claimed_link() {
        let records = RecordSet::new(
            vec![order("O6", Some("A7"), true)],
            vec![],
            vec![
                application("A6", Some("O6"), None, "received"),
                application("A7", Some("O6"), None, "received"),
            ],
        );
        let report = run(&records);
        let me = RecordRef::order(&OrderId::from("O6"));

        assert!(warns(&report, &me)
            .iter()
            .any(|reason| reason.starts_with(reasons::MULTIPLE_LINKED_APPLICATIONS)));
        assert_eq!(
            report.link(&me),
            &Link::Bidirectional(RecordRef::application(&ApplicationId::from("A7")))
        );
    }

    #[test]
    fn claim_outside_discovered_set_disagrees() {
        let records = RecordSet::new(
            vec![order("O7", Some("A9"), true)],
            vec![],
            vec![application("A8", Some("O7"), None, "received")],
        );
        let report = run(&records);
        let me = RecordRef::order(&OrderId::from("O7"));

        let reasons_for_order = warns(&report, &me);
        assert!(reasons_for_order
            .iter()
            .any(|reason| reason.starts_with(reasons::CLAIM_AND_DISCOVERY_DISAGREE)));
        assert!(reasons_for_order
            .iter()
            .any(|reason| reason.starts_with(reasons::CLAIMED_APPLICATION_NOT_FOUND)));
        assert_eq!(
            report.link(&me),
            &Link::Discovered(RecordRef::application(&ApplicationId::from("A8")))
        );
    }

    #[test]
    fn application_claimed_by_order_without_its_own_pointer_is_not_integrated() {
        let records = RecordSet::new(
            vec![order("O8", Some("A10"), true)],
            vec![],
            vec![application("A10", None, None, "received")],
        );
        let report = run(&records);
        let app_ref = RecordRef::application(&ApplicationId::from("A10"));

        assert_eq!(report.link(&app_ref), &Link::Claimed(RecordRef::order(&OrderId::from("O8"))));
        assert!(!report.link(&app_ref).is_integrated());
        assert!(warns(&report, &app_ref)
            .iter()
            .any(|reason| reason.starts_with(reasons::ORDER_ID_MISMATCH_WITH_CLAIMING_ORDER)));
    }

    #[test]
    fn mismatched_rental_claim_warns_both_sides() {
        let records = RecordSet::new(
            vec![],
            vec![rental("R2", Some("A11")), rental("R3", None)],
            vec![application("A11", None, Some("R3"), "received")],
        );
        let report = run(&records);
        let claiming = RecordRef::rental(&RentalId::from("R2"));
        let app_ref = RecordRef::application(&ApplicationId::from("A11"));

        assert!(warns(&report, &claiming)
            .iter()
            .any(|reason| reason.starts_with(reasons::CLAIMED_RENTAL_ID_MISMATCH)));
        assert!(warns(&report, &app_ref)
            .iter()
            .any(|reason| reason.starts_with(reasons::RENTAL_ID_MISMATCH_WITH_CLAIMING_RENTAL)));
        assert_eq!(report.link(&claiming), &Link::Claimed(app_ref.clone()));
        assert_eq!(report.link(&app_ref), &Link::Discovered(RecordRef::rental(&RentalId::from("R3"))));
    }

    #[test]
    fn rental_claiming_a_missing_application() {
        let mut requested = rental("R4", Some("A404"));
        requested.service_requested = true;
        let report = run(&RecordSet::new(vec![], vec![requested], vec![]));
        let me = RecordRef::rental(&RentalId::from("R4"));
        assert!(warns(&report, &me)
            .iter()
            .any(|reason| reason.starts_with(reasons::CLAIMED_APPLICATION_NOT_FOUND)));
        assert!(pendings(&report, &me).is_empty());
        assert!(!report.link(&me).is_integrated());

        let report = run(&RecordSet::new(vec![], vec![rental("R4", Some("A404"))], vec![]));
        assert_eq!(pendings(&report, &me), vec![reasons::SERVICE_NOT_YET_REQUESTED.to_string()]);
        assert!(warns(&report, &me).is_empty());
    }

    #[test]
    fn application_pointing_at_unknown_rental_is_not_integrated() {
        let records =
            RecordSet::new(vec![], vec![], vec![application("A12", None, Some("R404"), "received")]);
        let report = run(&records);
        let me = RecordRef::application(&ApplicationId::from("A12"));

        assert_eq!(warns(&report, &me), vec![format!("{}: R404", reasons::LINKED_RENTAL_NOT_FOUND)]);
        assert_eq!(report.link(&me), &Link::Claimed(RecordRef::rental(&RentalId::from("R404"))));
        assert!(!report.link(&me).is_integrated());
    }

    #[test]
    fn application_linked_to_order_and_rental_warns_and_follows_the_order() {
        let records = RecordSet::new(
            vec![order("O10", Some("A13"), true)],
            vec![rental("R5", None)],
            vec![application("A13", Some("O10"), Some("R5"), "received")],
        );
        let report = run(&records);
        let me = RecordRef::application(&ApplicationId::from("A13"));
        let rental_ref = RecordRef::rental(&RentalId::from("R5"));

        let reasons_for_app = warns(&report, &me);
        assert!(reasons_for_app.iter().any(|reason| reason == reasons::LINKED_TO_ORDER_AND_RENTAL));
        assert!(reasons_for_app
            .iter()
            .any(|reason| reason.starts_with(reasons::RENTAL_DOES_NOT_POINT_BACK)));
        assert_eq!(report.link(&me), &Link::Bidirectional(RecordRef::order(&OrderId::from("O10"))));
        assert_eq!(report.link(&rental_ref), &Link::Discovered(me.clone()));
    }
}

//! Display strings for feed items.

use crate::model::{Order, RecordKind, Rental};

#[must_use]
pub fn status_label(status: &str) -> String {
    let label = match status.trim().to_ascii_lowercase().as_str() {
        "pending" => "Pending",
        "paid" => "Paid",
        "shipped" => "Shipped",
        "delivered" => "Delivered",
        "cancelled" => "Cancelled",
        "refunded" => "Refunded",
        "received" => "Received",
        "in_progress" => "In progress",
        "completed" => "Completed",
        "returned" => "Returned",
        "out" => "Out on rental",
        _ => return status.to_string(),
    };
    label.to_string()
}

/// Fold the different stores' payment vocabularies onto one set of labels so group
/// members can be compared.
#[must_use]
pub fn payment_label(payment_status: &str) -> String {
    let label = match payment_status.trim().to_ascii_lowercase().as_str() {
        "paid" | "completed" => "Paid",
        "pending" | "unpaid" | "awaiting" | "ready" => "Unpaid",
        "refunded" => "Refunded",
        "failed" | "cancelled" | "canceled" => "Failed",
        _ => return payment_status.to_string(),
    };
    label.to_string()
}

#[must_use]
pub fn order_title(order: &Order) -> String {
    match order.items.split_first() {
        None => "Order".to_string(),
        Some((first, [])) => first.name.clone(),
        Some((first, rest)) => format!("{} and {} more", first.name, rest.len()),
    }
}

#[must_use]
pub fn rental_title(rental: &Rental) -> String {
    format!("Racket rental ({} days)", rental.days)
}

pub const APPLICATION_TITLE: &str = "Stringing service";

#[must_use]
pub fn href(kind: RecordKind, id: &str) -> String {
    match kind {
        RecordKind::Order => format!("/admin/orders/{id}"),
        RecordKind::Rental => format!("/admin/rentals/{id}"),
        RecordKind::StringingApplication => format!("/admin/applications/stringing/{id}"),
    }
}

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::OpsError;

/// Application status that marks a form which was started but never submitted.
pub const DRAFT_STATUS: &str = "draft";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Opaque order identifier as issued by the orders store.
    OrderId
);
string_id!(
    /// Opaque rental identifier as issued by the rentals store.
    RentalId
);
string_id!(
    /// Opaque stringing-application identifier.
    ApplicationId
);
string_id!(UserId);

/// The three record kinds the feed unifies.
///
/// Declaration order is the kind priority used everywhere a group is flattened or an
/// anchor is chosen: orders first, then rentals, then applications.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Order,
    Rental,
    StringingApplication,
}

impl RecordKind {
    pub const PRIORITY: [Self; 3] = [Self::Order, Self::Rental, Self::StringingApplication];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Order => "order",
            Self::Rental => "rental",
            Self::StringingApplication => "stringing_application",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "order" => Some(Self::Order),
            "rental" => Some(Self::Rental),
            "stringing_application" => Some(Self::StringingApplication),
            _ => None,
        }
    }

    /// Position in the kind priority; lower sorts first.
    #[must_use]
    pub fn priority(self) -> u8 {
        match self {
            Self::Order => 0,
            Self::Rental => 1,
            Self::StringingApplication => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GoodsKind {
    Racket,
    String,
    Accessory,
    #[serde(other)]
    Other,
}

impl GoodsKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Racket => "racket",
            Self::String => "string",
            Self::Accessory => "accessory",
            Self::Other => "other",
        }
    }

    /// Lenient decoding: unknown store values fold into [`GoodsKind::Other`].
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "racket" => Self::Racket,
            "string" => Self::String,
            "accessory" => Self::Accessory,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Customer {
    pub name: Option<String>,
    pub email: Option<String>,
}

impl Customer {
    #[must_use]
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self { name: Some(name.into()), email: Some(email.into()) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub name: String,
    pub kind: GoodsKind,
    pub quantity: u32,
    pub unit_price: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    pub status: String,
    pub payment_status: String,
    pub total_amount: i64,
    #[serde(default)]
    pub items: Vec<LineItem>,
    #[serde(default)]
    pub customer: Customer,
    #[serde(default)]
    pub linked_application_id: Option<ApplicationId>,
    #[serde(default)]
    pub service_claimed_applied: bool,
}

impl Order {
    #[must_use]
    pub fn has_racket_item(&self) -> bool {
        self.items.iter().any(|item| item.kind == GoodsKind::Racket)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rental {
    pub id: RentalId,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    pub status: String,
    pub fee: i64,
    #[serde(default)]
    pub deposit: i64,
    pub days: u32,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub linked_application_id: Option<ApplicationId>,
    #[serde(default)]
    pub service_requested: bool,
}

impl Rental {
    /// Amount collected at lease start: rental fee plus refundable deposit.
    #[must_use]
    pub fn amount(&self) -> i64 {
        self.fee.saturating_add(self.deposit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceApplication {
    pub id: ApplicationId,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    pub status: String,
    #[serde(default)]
    pub payment_status: Option<String>,
    pub total_price: i64,
    #[serde(default)]
    pub order_id: Option<OrderId>,
    #[serde(default)]
    pub rental_id: Option<RentalId>,
    #[serde(default)]
    pub customer: Customer,
}

impl ServiceApplication {
    #[must_use]
    pub fn is_draft(&self) -> bool {
        self.status.eq_ignore_ascii_case(DRAFT_STATUS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
}

/// A bundle of store records, used to seed or bulk-load a store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Dataset {
    #[serde(default)]
    pub orders: Vec<Order>,
    #[serde(default)]
    pub rentals: Vec<Rental>,
    #[serde(default)]
    pub applications: Vec<ServiceApplication>,
    #[serde(default)]
    pub users: Vec<User>,
}

impl Dataset {
    /// Check the shape of every record before it reaches a store.
    ///
    /// Cross-record pointers are not checked here; dangling links are reported by the audit.
    ///
    /// # Errors
    /// Returns [`OpsError::Validation`] for empty identifiers, negative amounts,
    /// zero-quantity line items, or zero-day rentals.
    pub fn validate(&self) -> Result<(), OpsError> {
        for order in &self.orders {
            require_id("order", order.id.as_str())?;
            require_amount("order total_amount", order.id.as_str(), order.total_amount)?;
            for item in &order.items {
                if item.quantity == 0 {
                    return Err(OpsError::Validation(format!(
                        "order {} line item `{}` MUST have quantity >= 1",
                        order.id, item.name
                    )));
                }
                require_amount("line item unit_price", order.id.as_str(), item.unit_price)?;
            }
        }

        for rental in &self.rentals {
            require_id("rental", rental.id.as_str())?;
            require_amount("rental fee", rental.id.as_str(), rental.fee)?;
            require_amount("rental deposit", rental.id.as_str(), rental.deposit)?;
            if rental.days == 0 {
                return Err(OpsError::Validation(format!(
                    "rental {} MUST last at least one day",
                    rental.id
                )));
            }
        }

        for application in &self.applications {
            require_id("application", application.id.as_str())?;
            require_amount("application total_price", application.id.as_str(), application.total_price)?;
        }

        for user in &self.users {
            require_id("user", user.id.as_str())?;
        }

        Ok(())
    }
}

fn require_id(kind: &str, id: &str) -> Result<(), OpsError> {
    if id.trim().is_empty() {
        return Err(OpsError::Validation(format!("{kind} id MUST be non-empty")));
    }
    Ok(())
}

fn require_amount(field: &str, id: &str, value: i64) -> Result<(), OpsError> {
    if value < 0 {
        return Err(OpsError::Validation(format!("{field} MUST be >= 0 (record {id})")));
    }
    Ok(())
}

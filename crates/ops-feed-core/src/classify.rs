use serde::{Deserialize, Serialize};

use crate::links::Link;
use crate::model::RecordKind;
use crate::OpsError;

/// The seven fixed transaction shapes a feed item can belong to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(into = "u8", try_from = "u8")]
pub enum Flow {
    SingleItemPurchase,
    PurchaseWithService,
    ServiceOnly,
    EquipmentPurchase,
    EquipmentPurchaseWithService,
    RentalOnly,
    RentalWithService,
}

impl Flow {
    pub const ALL: [Self; 7] = [
        Self::SingleItemPurchase,
        Self::PurchaseWithService,
        Self::ServiceOnly,
        Self::EquipmentPurchase,
        Self::EquipmentPurchaseWithService,
        Self::RentalOnly,
        Self::RentalWithService,
    ];

    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::SingleItemPurchase => 1,
            Self::PurchaseWithService => 2,
            Self::ServiceOnly => 3,
            Self::EquipmentPurchase => 4,
            Self::EquipmentPurchaseWithService => 5,
            Self::RentalOnly => 6,
            Self::RentalWithService => 7,
        }
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|flow| flow.code() == code)
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::SingleItemPurchase => "single-item purchase",
            Self::PurchaseWithService => "purchase + integrated service",
            Self::ServiceOnly => "service only",
            Self::EquipmentPurchase => "equipment item purchase",
            Self::EquipmentPurchaseWithService => {
                "equipment purchase + selection + integrated service"
            }
            Self::RentalOnly => "rental only",
            Self::RentalWithService => "rental + selection + integrated service",
        }
    }
}

impl From<Flow> for u8 {
    fn from(flow: Flow) -> Self {
        flow.code()
    }
}

impl TryFrom<u8> for Flow {
    type Error = OpsError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::from_code(code)
            .ok_or_else(|| OpsError::Query(format!("flow MUST be in 1..=7, got {code}")))
    }
}

/// Everything flow classification is allowed to look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowInputs {
    pub kind: RecordKind,
    pub integrated: bool,
    /// Kind of the link target, when there is one.
    pub counterpart: Option<RecordKind>,
    /// Racket goods on the order itself, or on the order an application is linked to.
    pub has_racket: bool,
}

#[must_use]
pub fn classify_flow(inputs: FlowInputs) -> Flow {
    let purchase = |integrated: bool| match (integrated, inputs.has_racket) {
        (false, false) => Flow::SingleItemPurchase,
        (true, false) => Flow::PurchaseWithService,
        (false, true) => Flow::EquipmentPurchase,
        (true, true) => Flow::EquipmentPurchaseWithService,
    };

    match inputs.kind {
        RecordKind::Order => purchase(inputs.integrated),
        RecordKind::Rental if inputs.integrated => Flow::RentalWithService,
        RecordKind::Rental => Flow::RentalOnly,
        RecordKind::StringingApplication => match (inputs.integrated, inputs.counterpart) {
            (true, Some(RecordKind::Order)) => purchase(true),
            (true, Some(RecordKind::Rental)) => Flow::RentalWithService,
            _ => Flow::ServiceOnly,
        },
    }
}

/// Which record is billed for the transaction an item belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SettlementAnchor {
    Order,
    Rental,
    Application,
}

impl SettlementAnchor {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Order => "settled on order",
            Self::Rental => "settled on rental",
            Self::Application => "settled on application",
        }
    }

    fn of_kind(kind: RecordKind) -> Self {
        match kind {
            RecordKind::Order => Self::Order,
            RecordKind::Rental => Self::Rental,
            RecordKind::StringingApplication => Self::Application,
        }
    }
}

/// An integrated application settles on its counterpart; every other record settles on itself.
#[must_use]
pub fn settlement_anchor(kind: RecordKind, link: &Link) -> SettlementAnchor {
    match (kind, link.target()) {
        (RecordKind::StringingApplication, Some(target)) if link.is_integrated() => {
            SettlementAnchor::of_kind(target.kind)
        }
        _ => SettlementAnchor::of_kind(kind),
    }
}

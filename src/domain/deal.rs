//! The deal aggregate: one escrow transaction between buyer and seller.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DealId, UserId};

/// Lifecycle status of a deal. Exactly one holds at any time.
///
/// `Completed`, `Cancelled`, and `Disputed` are terminal: records in those
/// states are retained for audit and accept no further actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealStatus {
    /// Created by the buyer; awaiting the seller's accept/reject.
    Created,
    /// Accepted by the seller; awaiting payment into escrow.
    Accepted,
    /// Guarantor confirmed the buyer's funds arrived.
    PaymentConfirmed,
    /// Both sides confirmed and (if applicable) the payout went through.
    Completed,
    /// Guarantor could not reconcile the parties' claims.
    Disputed,
    /// Rejected, cancelled, or otherwise abandoned before completion.
    Cancelled,
}

impl DealStatus {
    /// Stable string form used in persisted rows.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Accepted => "accepted",
            Self::PaymentConfirmed => "payment_confirmed",
            Self::Completed => "completed",
            Self::Disputed => "disputed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parses the persisted string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "accepted" => Some(Self::Accepted),
            "payment_confirmed" => Some(Self::PaymentConfirmed),
            "completed" => Some(Self::Completed),
            "disputed" => Some(Self::Disputed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Returns `true` for the absorbing states.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Disputed | Self::Cancelled)
    }
}

impl std::fmt::Display for DealStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One escrow transaction record.
///
/// Mutated exclusively through `DealService` transitions; never physically
/// deleted. The progress flags are monotonic — once `true` they are only
/// ever cleared by the guarantor's explicit payment rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    /// Row id assigned by the store.
    pub id: DealId,
    /// Globally unique external token for deep-linking.
    pub token: Uuid,
    /// The party who initiated the deal and pays into escrow.
    pub buyer: UserId,
    /// The party who delivers and receives the payout. Never equals `buyer`.
    pub seller: UserId,
    /// Agreed amount; strictly positive.
    pub amount: Decimal,
    /// Currency code (e.g. `"RUB"`).
    pub currency: String,
    /// Free-text description of what is being sold; non-empty.
    pub description: String,
    /// Current lifecycle status.
    pub status: DealStatus,
    /// Buyer claims funds were sent to the guarantor.
    pub buyer_paid: bool,
    /// Guarantor confirmed the funds arrived.
    pub guarantor_confirmed: bool,
    /// Buyer confirmed receipt of the goods.
    pub buyer_done: bool,
    /// Seller confirmed shipment/delivery.
    pub seller_done: bool,
    /// Guarantor disbursed the payout to the seller.
    pub guarantor_paid: bool,
    /// Payout transaction reference; set only when `guarantor_paid`.
    pub payout_txn_ref: Option<String>,
    /// Proof-of-payment attachment reference; set only when `guarantor_paid`.
    pub payout_proof_ref: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Expiry horizon. Stored for an external scheduler; the engine itself
    /// runs no sweep.
    pub expires_at: DateTime<Utc>,
    /// Set once when the deal reaches a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

/// A well-formed deal creation request, as handed in by the conversation
/// layer once its multi-step input flow (seller, amount, description,
/// confirmation) has finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateDealRequest {
    /// The initiating buyer.
    pub buyer: UserId,
    /// The counterparty seller.
    pub seller: UserId,
    /// Agreed amount; must be strictly positive.
    pub amount: Decimal,
    /// Currency code; must be non-empty.
    pub currency: String,
    /// Deal description; must be non-empty.
    pub description: String,
}

/// Input record for [`crate::persistence::DealStore::insert_deal`].
///
/// Everything except the row id, which the store assigns.
#[derive(Debug, Clone)]
pub struct NewDeal {
    /// External deep-link token.
    pub token: Uuid,
    /// Buyer identity.
    pub buyer: UserId,
    /// Seller identity.
    pub seller: UserId,
    /// Agreed amount.
    pub amount: Decimal,
    /// Currency code.
    pub currency: String,
    /// Deal description.
    pub description: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Expiry horizon.
    pub expires_at: DateTime<Utc>,
}

impl NewDeal {
    /// Materializes the full record with a store-assigned id. Fresh deals
    /// start in [`DealStatus::Created`] with all progress flags clear.
    #[must_use]
    pub fn into_deal(self, id: DealId) -> Deal {
        Deal {
            id,
            token: self.token,
            buyer: self.buyer,
            seller: self.seller,
            amount: self.amount,
            currency: self.currency,
            description: self.description,
            status: DealStatus::Created,
            buyer_paid: false,
            guarantor_confirmed: false,
            buyer_done: false,
            seller_done: false,
            guarantor_paid: false,
            payout_txn_ref: None,
            payout_proof_ref: None,
            created_at: self.created_at,
            expires_at: self.expires_at,
            completed_at: None,
        }
    }
}

/// Compare-and-set predicate for a deal update.
///
/// An update writes the full row derived from a loaded snapshot, so the
/// guard must pin every flag that write copies — otherwise a stale writer
/// could pass its own check and silently erase a concurrent writer's flag.
/// [`DealGuard::snapshot`] builds that full pin; an update only lands if
/// the stored record still matches, so two concurrent actions on the same
/// deal cannot both win.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DealGuard {
    /// Expected current status.
    pub status: DealStatus,
    /// Expected `buyer_paid` flag, if the guard consulted it.
    pub buyer_paid: Option<bool>,
    /// Expected `buyer_done` flag, if the guard consulted it.
    pub buyer_done: Option<bool>,
    /// Expected `seller_done` flag, if the guard consulted it.
    pub seller_done: Option<bool>,
    /// Expected `guarantor_paid` flag, if the guard consulted it.
    pub guarantor_paid: Option<bool>,
}

impl DealGuard {
    /// Guard on status alone.
    #[must_use]
    pub const fn on_status(status: DealStatus) -> Self {
        Self {
            status,
            buyer_paid: None,
            buyer_done: None,
            seller_done: None,
            guarantor_paid: None,
        }
    }

    /// Guard pinning the record exactly as it was loaded.
    ///
    /// This is what transitions use: the update they commit is the full
    /// row derived from `deal`, so any concurrent flag change must fail
    /// the write rather than be copied over.
    #[must_use]
    pub const fn snapshot(deal: &Deal) -> Self {
        Self {
            status: deal.status,
            buyer_paid: Some(deal.buyer_paid),
            buyer_done: Some(deal.buyer_done),
            seller_done: Some(deal.seller_done),
            guarantor_paid: Some(deal.guarantor_paid),
        }
    }

    /// Returns `true` if the stored record still satisfies this predicate.
    #[must_use]
    pub fn matches(&self, deal: &Deal) -> bool {
        deal.status == self.status
            && self.buyer_paid.is_none_or(|v| deal.buyer_paid == v)
            && self.buyer_done.is_none_or(|v| deal.buyer_done == v)
            && self.seller_done.is_none_or(|v| deal.seller_done == v)
            && self.guarantor_paid.is_none_or(|v| deal.guarantor_paid == v)
    }
}

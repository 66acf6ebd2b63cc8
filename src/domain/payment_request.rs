//! Payout request records: the guarantor's disbursement to the seller.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{DealId, UserId};

/// Status of a payout request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentRequestStatus {
    /// Created by the guarantor; awaiting the disbursement.
    Pending,
    /// Disbursement executed and a transaction reference recorded.
    Paid,
}

impl PaymentRequestStatus {
    /// Stable string form used in persisted rows.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
        }
    }

    /// Parses the persisted string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "paid" => Some(Self::Paid),
            _ => None,
        }
    }
}

/// One payout cycle for a deal.
///
/// The destination `payment_details` are a snapshot of the seller's profile
/// at request time: later profile changes must not retroactively alter an
/// in-flight payout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// Row id assigned by the store.
    pub id: i64,
    /// The deal this payout belongs to.
    pub deal_id: DealId,
    /// The seller receiving the payout.
    pub seller: UserId,
    /// Amount snapshot taken from the deal.
    pub amount: Decimal,
    /// Currency snapshot taken from the deal.
    pub currency: String,
    /// Destination payment details snapshotted from the seller's profile.
    pub payment_details: String,
    /// Pending until the transaction reference is supplied.
    pub status: PaymentRequestStatus,
    /// Disbursement transaction reference; set when paid.
    pub txn_ref: Option<String>,
    /// Proof-of-payment attachment reference; set when paid.
    pub proof_ref: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the disbursement.
    pub paid_at: Option<DateTime<Utc>>,
}

/// Input record for [`crate::persistence::DealStore::insert_payment_request`].
#[derive(Debug, Clone)]
pub struct NewPaymentRequest {
    /// The deal this payout belongs to.
    pub deal_id: DealId,
    /// The seller receiving the payout.
    pub seller: UserId,
    /// Amount snapshot.
    pub amount: Decimal,
    /// Currency snapshot.
    pub currency: String,
    /// Destination payment details snapshot.
    pub payment_details: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl NewPaymentRequest {
    /// Materializes the full record with a store-assigned id.
    #[must_use]
    pub fn into_request(self, id: i64) -> PaymentRequest {
        PaymentRequest {
            id,
            deal_id: self.deal_id,
            seller: self.seller,
            amount: self.amount,
            currency: self.currency,
            payment_details: self.payment_details,
            status: PaymentRequestStatus::Pending,
            txn_ref: None,
            proof_ref: None,
            created_at: self.created_at,
            paid_at: None,
        }
    }
}

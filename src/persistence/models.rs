//! Database row models and their domain conversions.
//!
//! Statuses are persisted as text; parsing back is fallible, so the row →
//! domain conversions go through `TryFrom` and surface unknown strings as
//! persistence errors rather than panicking.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::domain::{
    Deal, DealId, DealMessage, DealStatus, PaymentRequest, PaymentRequestStatus, UserId,
};
use crate::error::EscrowError;

/// A row from the `deals` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DealRow {
    /// Auto-increment row id.
    pub id: i64,
    /// External deep-link token.
    pub token: Uuid,
    /// Buyer identity.
    pub buyer_id: i64,
    /// Seller identity.
    pub seller_id: i64,
    /// Agreed amount.
    pub amount: Decimal,
    /// Currency code.
    pub currency: String,
    /// Deal description.
    pub description: String,
    /// Status discriminator string.
    pub status: String,
    /// Buyer claims funds were sent.
    pub buyer_paid: bool,
    /// Guarantor confirmed funds arrived.
    pub guarantor_confirmed: bool,
    /// Buyer confirmed receipt.
    pub buyer_done: bool,
    /// Seller confirmed shipment.
    pub seller_done: bool,
    /// Guarantor disbursed the payout.
    pub guarantor_paid: bool,
    /// Payout transaction reference.
    pub payout_txn_ref: Option<String>,
    /// Proof-of-payment reference.
    pub payout_proof_ref: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Expiry horizon.
    pub expires_at: DateTime<Utc>,
    /// Terminal-state timestamp.
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<DealRow> for Deal {
    type Error = EscrowError;

    fn try_from(row: DealRow) -> Result<Self, Self::Error> {
        let status = DealStatus::parse(&row.status).ok_or_else(|| {
            EscrowError::Persistence(format!("unknown deal status in row {}: {}", row.id, row.status))
        })?;
        Ok(Self {
            id: DealId::new(row.id),
            token: row.token,
            buyer: UserId::new(row.buyer_id),
            seller: UserId::new(row.seller_id),
            amount: row.amount,
            currency: row.currency,
            description: row.description,
            status,
            buyer_paid: row.buyer_paid,
            guarantor_confirmed: row.guarantor_confirmed,
            buyer_done: row.buyer_done,
            seller_done: row.seller_done,
            guarantor_paid: row.guarantor_paid,
            payout_txn_ref: row.payout_txn_ref,
            payout_proof_ref: row.payout_proof_ref,
            created_at: row.created_at,
            expires_at: row.expires_at,
            completed_at: row.completed_at,
        })
    }
}

/// A row from the `payment_requests` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PaymentRequestRow {
    /// Auto-increment row id.
    pub id: i64,
    /// Parent deal row id.
    pub deal_id: i64,
    /// Seller identity.
    pub seller_id: i64,
    /// Amount snapshot.
    pub amount: Decimal,
    /// Currency snapshot.
    pub currency: String,
    /// Destination payment details snapshot.
    pub payment_details: String,
    /// Status discriminator string.
    pub status: String,
    /// Disbursement transaction reference.
    pub txn_ref: Option<String>,
    /// Proof-of-payment reference.
    pub proof_ref: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Disbursement timestamp.
    pub paid_at: Option<DateTime<Utc>>,
}

impl TryFrom<PaymentRequestRow> for PaymentRequest {
    type Error = EscrowError;

    fn try_from(row: PaymentRequestRow) -> Result<Self, Self::Error> {
        let status = PaymentRequestStatus::parse(&row.status).ok_or_else(|| {
            EscrowError::Persistence(format!(
                "unknown payment request status in row {}: {}",
                row.id, row.status
            ))
        })?;
        Ok(Self {
            id: row.id,
            deal_id: DealId::new(row.deal_id),
            seller: UserId::new(row.seller_id),
            amount: row.amount,
            currency: row.currency,
            payment_details: row.payment_details,
            status,
            txn_ref: row.txn_ref,
            proof_ref: row.proof_ref,
            created_at: row.created_at,
            paid_at: row.paid_at,
        })
    }
}

/// A row from the `deal_messages` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DealMessageRow {
    /// Auto-increment row id.
    pub id: i64,
    /// Parent deal row id.
    pub deal_id: i64,
    /// Author identity (`0` for system entries).
    pub author_id: i64,
    /// Author display label.
    pub author_label: String,
    /// Message text.
    pub text: String,
    /// `true` for engine-generated entries.
    pub is_system: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl From<DealMessageRow> for DealMessage {
    fn from(row: DealMessageRow) -> Self {
        Self {
            id: row.id,
            deal_id: DealId::new(row.deal_id),
            author: UserId::new(row.author_id),
            author_label: row.author_label,
            text: row.text,
            is_system: row.is_system,
            created_at: row.created_at,
        }
    }
}

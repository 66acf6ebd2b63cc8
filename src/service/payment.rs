//! Payout request coordination.

use std::sync::Arc;

use chrono::Utc;

use crate::domain::{Deal, DealId, NewPaymentRequest, PaymentRequest};
use crate::error::EscrowError;
use crate::persistence::DealStore;

/// Tracks payout requests separately from the deal's own flags.
///
/// A request snapshots the seller's currently-registered payment details at
/// creation time: later changes to the seller's profile must not
/// retroactively alter an in-flight payout.
#[derive(Debug, Clone)]
pub struct PaymentRequestManager {
    store: Arc<dyn DealStore>,
}

impl PaymentRequestManager {
    /// Creates a manager over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn DealStore>) -> Self {
        Self { store }
    }

    /// Creates a pending payout request for the deal, snapshotting the
    /// seller's payment details.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::InvalidTransition`] if the deal already has a
    /// pending request.
    pub async fn create_request(
        &self,
        deal: &Deal,
        seller_payment_details: String,
    ) -> Result<PaymentRequest, EscrowError> {
        self.store
            .insert_payment_request(NewPaymentRequest {
                deal_id: deal.id,
                seller: deal.seller,
                amount: deal.amount,
                currency: deal.currency.clone(),
                payment_details: seller_payment_details,
                created_at: Utc::now(),
            })
            .await
    }

    /// Returns the deal's pending request, if any.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::Persistence`] on storage failure.
    pub async fn pending_for(&self, deal_id: DealId) -> Result<Option<PaymentRequest>, EscrowError> {
        self.store.pending_payment_request(deal_id).await
    }

    /// Marks a pending request as paid with the disbursement references.
    ///
    /// Re-submission after a request is already paid is treated as an
    /// error, not a silent success.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::InvalidTransition`] if already paid, or
    /// [`EscrowError::PaymentRequestNotFound`] if absent.
    pub async fn mark_paid(
        &self,
        request_id: i64,
        txn_ref: &str,
        proof_ref: Option<&str>,
    ) -> Result<PaymentRequest, EscrowError> {
        self.store
            .mark_payment_request_paid(request_id, txn_ref, proof_ref)
            .await
    }
}

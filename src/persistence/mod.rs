//! Persistence layer: the `DealStore` trait and its backends.
//!
//! A single repository interface with independent backend implementations
//! chosen by configuration — never by inspecting connection strings at call
//! time. [`MemoryStore`] backs tests and demos; [`PostgresStore`] is the
//! production backend.

pub mod memory;
pub mod models;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::{EscrowConfig, StoreBackend};
use crate::domain::{
    Deal, DealGuard, DealId, DealMessage, NewDeal, NewDealMessage, NewPaymentRequest,
    PaymentRequest, UserId,
};
use crate::error::EscrowError;

pub use memory::{MemoryDirectory, MemoryStore};
pub use postgres::PostgresStore;

/// Repository interface for deals and their sub-records.
///
/// All mutations of an existing deal go through [`DealStore::update_deal`],
/// whose compare-and-set guard is the engine's defense against concurrent
/// actions on the same deal.
#[async_trait]
pub trait DealStore: Send + Sync + std::fmt::Debug {
    /// Inserts a new deal, assigning its row id.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::Persistence`] on storage failure.
    async fn insert_deal(&self, new: NewDeal) -> Result<Deal, EscrowError>;

    /// Loads a deal by row id.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::DealNotFound`] if absent.
    async fn deal(&self, id: DealId) -> Result<Deal, EscrowError>;

    /// Loads a deal by its external deep-link token.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::DealTokenNotFound`] if absent.
    async fn deal_by_token(&self, token: Uuid) -> Result<Deal, EscrowError>;

    /// Lists deals where the user is buyer or seller, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::Persistence`] on storage failure.
    async fn deals_for_user(&self, user: UserId, limit: i64) -> Result<Vec<Deal>, EscrowError>;

    /// Writes `update` over the stored record if and only if the stored
    /// record still satisfies `guard`.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::ConcurrentModification`] if the guard no
    /// longer matches (the caller lost a race), or
    /// [`EscrowError::DealNotFound`] if the deal vanished.
    async fn update_deal(&self, update: &Deal, guard: &DealGuard) -> Result<Deal, EscrowError>;

    /// Records a payout disbursement as one atomic unit: writes `update`
    /// over the deal if `guard` still holds, and marks the pending request
    /// paid with the disbursement references. Either both writes land or
    /// neither does — a completed deal can never be left with its request
    /// stuck pending.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::ConcurrentModification`] if the deal guard no
    /// longer matches, [`EscrowError::InvalidTransition`] if the request is
    /// already paid, or [`EscrowError::PaymentRequestNotFound`] /
    /// [`EscrowError::DealNotFound`] if either record is absent. No partial
    /// write occurs in any error case.
    async fn complete_payout(
        &self,
        update: &Deal,
        guard: &DealGuard,
        request_id: i64,
        txn_ref: &str,
        proof_ref: Option<&str>,
    ) -> Result<(Deal, PaymentRequest), EscrowError>;

    /// Inserts a payout request, assigning its row id.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::InvalidTransition`] if the deal already has a
    /// pending request (one payout cycle at a time).
    async fn insert_payment_request(
        &self,
        new: NewPaymentRequest,
    ) -> Result<PaymentRequest, EscrowError>;

    /// Returns the deal's pending payout request, if any.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::Persistence`] on storage failure.
    async fn pending_payment_request(
        &self,
        deal_id: DealId,
    ) -> Result<Option<PaymentRequest>, EscrowError>;

    /// Marks a pending request as paid, recording the transaction and
    /// optional proof references.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::InvalidTransition`] if the request is already
    /// paid (re-submission is an error, not a silent success), or
    /// [`EscrowError::PaymentRequestNotFound`] if absent.
    async fn mark_payment_request_paid(
        &self,
        request_id: i64,
        txn_ref: &str,
        proof_ref: Option<&str>,
    ) -> Result<PaymentRequest, EscrowError>;

    /// Appends an entry to a deal's message thread.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::Persistence`] on storage failure.
    async fn append_message(&self, new: NewDealMessage) -> Result<DealMessage, EscrowError>;

    /// Reads a deal's thread in chronological order, restartable via
    /// offset/limit.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::Persistence`] on storage failure.
    async fn messages(
        &self,
        deal_id: DealId,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<DealMessage>, EscrowError>;
}

/// Read-only view onto the out-of-scope profile layer.
///
/// `create_payout` snapshots the seller's registered payment details through
/// this seam; a missing entry degrades to a request-for-details
/// notification rather than a hard failure.
#[async_trait]
pub trait PaymentProfileDirectory: Send + Sync + std::fmt::Debug {
    /// Returns the user's registered payment details, if any.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::Persistence`] if the profile layer is
    /// unavailable.
    async fn payment_details(&self, user: UserId) -> Result<Option<String>, EscrowError>;
}

/// Constructs the store named by the configuration.
///
/// For [`StoreBackend::Postgres`] this connects the pool and runs pending
/// migrations.
///
/// # Errors
///
/// Returns [`EscrowError::Persistence`] if the database cannot be reached
/// or migrated.
pub async fn build_store(config: &EscrowConfig) -> Result<Arc<dyn DealStore>, EscrowError> {
    match config.store_backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Postgres => {
            let store = PostgresStore::connect(config).await?;
            Ok(Arc::new(store))
        }
    }
}

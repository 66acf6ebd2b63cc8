//! In-memory implementation of the persistence layer.
//!
//! Backs unit tests and demos with the same compare-and-set semantics the
//! PostgreSQL store expresses in SQL: an update only lands if the stored
//! record still satisfies the caller's [`DealGuard`].

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{DealStore, PaymentProfileDirectory};
use crate::domain::{
    Deal, DealGuard, DealId, DealMessage, NewDeal, NewDealMessage, NewPaymentRequest,
    PaymentRequest, PaymentRequestStatus, UserId,
};
use crate::error::EscrowError;

#[derive(Debug, Default)]
struct Tables {
    deals: HashMap<DealId, Deal>,
    payment_requests: HashMap<i64, PaymentRequest>,
    messages: Vec<DealMessage>,
    next_deal_id: i64,
    next_request_id: i64,
    next_message_id: i64,
}

/// Volatile `HashMap`-backed store.
///
/// A single `RwLock` over all tables keeps the compare-and-set check and
/// the subsequent write atomic, which is the property the guard exists to
/// provide.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DealStore for MemoryStore {
    async fn insert_deal(&self, new: NewDeal) -> Result<Deal, EscrowError> {
        let mut tables = self.tables.write().await;
        tables.next_deal_id += 1;
        let deal = new.into_deal(DealId::new(tables.next_deal_id));
        tables.deals.insert(deal.id, deal.clone());
        Ok(deal)
    }

    async fn deal(&self, id: DealId) -> Result<Deal, EscrowError> {
        let tables = self.tables.read().await;
        tables.deals.get(&id).cloned().ok_or(EscrowError::DealNotFound(id))
    }

    async fn deal_by_token(&self, token: Uuid) -> Result<Deal, EscrowError> {
        let tables = self.tables.read().await;
        tables
            .deals
            .values()
            .find(|d| d.token == token)
            .cloned()
            .ok_or(EscrowError::DealTokenNotFound(token))
    }

    async fn deals_for_user(&self, user: UserId, limit: i64) -> Result<Vec<Deal>, EscrowError> {
        let tables = self.tables.read().await;
        let mut deals: Vec<Deal> = tables
            .deals
            .values()
            .filter(|d| d.buyer == user || d.seller == user)
            .cloned()
            .collect();
        deals.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        deals.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(deals)
    }

    async fn update_deal(&self, update: &Deal, guard: &DealGuard) -> Result<Deal, EscrowError> {
        let mut tables = self.tables.write().await;
        let Some(current) = tables.deals.get(&update.id) else {
            return Err(EscrowError::DealNotFound(update.id));
        };
        if !guard.matches(current) {
            return Err(EscrowError::ConcurrentModification(update.id));
        }
        tables.deals.insert(update.id, update.clone());
        Ok(update.clone())
    }

    async fn complete_payout(
        &self,
        update: &Deal,
        guard: &DealGuard,
        request_id: i64,
        txn_ref: &str,
        proof_ref: Option<&str>,
    ) -> Result<(Deal, PaymentRequest), EscrowError> {
        let mut tables = self.tables.write().await;
        let Some(current) = tables.deals.get(&update.id) else {
            return Err(EscrowError::DealNotFound(update.id));
        };
        if !guard.matches(current) {
            return Err(EscrowError::ConcurrentModification(update.id));
        }
        // Validate the request before touching either record, so a bad
        // request leaves the deal untouched.
        match tables.payment_requests.get(&request_id) {
            None => return Err(EscrowError::PaymentRequestNotFound(request_id)),
            Some(r) if r.status == PaymentRequestStatus::Paid => {
                return Err(EscrowError::InvalidTransition(format!(
                    "payment request {request_id} is already paid"
                )));
            }
            Some(_) => {}
        }

        tables.deals.insert(update.id, update.clone());
        let Some(request) = tables.payment_requests.get_mut(&request_id) else {
            return Err(EscrowError::PaymentRequestNotFound(request_id));
        };
        request.status = PaymentRequestStatus::Paid;
        request.txn_ref = Some(txn_ref.to_string());
        request.proof_ref = proof_ref.map(str::to_string);
        request.paid_at = Some(chrono::Utc::now());
        Ok((update.clone(), request.clone()))
    }

    async fn insert_payment_request(
        &self,
        new: NewPaymentRequest,
    ) -> Result<PaymentRequest, EscrowError> {
        let mut tables = self.tables.write().await;
        let pending_exists = tables
            .payment_requests
            .values()
            .any(|r| r.deal_id == new.deal_id && r.status == PaymentRequestStatus::Pending);
        if pending_exists {
            return Err(EscrowError::InvalidTransition(format!(
                "deal {} already has a pending payout request",
                new.deal_id
            )));
        }
        tables.next_request_id += 1;
        let request = new.into_request(tables.next_request_id);
        tables.payment_requests.insert(request.id, request.clone());
        Ok(request)
    }

    async fn pending_payment_request(
        &self,
        deal_id: DealId,
    ) -> Result<Option<PaymentRequest>, EscrowError> {
        let tables = self.tables.read().await;
        Ok(tables
            .payment_requests
            .values()
            .find(|r| r.deal_id == deal_id && r.status == PaymentRequestStatus::Pending)
            .cloned())
    }

    async fn mark_payment_request_paid(
        &self,
        request_id: i64,
        txn_ref: &str,
        proof_ref: Option<&str>,
    ) -> Result<PaymentRequest, EscrowError> {
        let mut tables = self.tables.write().await;
        let Some(request) = tables.payment_requests.get_mut(&request_id) else {
            return Err(EscrowError::PaymentRequestNotFound(request_id));
        };
        if request.status == PaymentRequestStatus::Paid {
            return Err(EscrowError::InvalidTransition(format!(
                "payment request {request_id} is already paid"
            )));
        }
        request.status = PaymentRequestStatus::Paid;
        request.txn_ref = Some(txn_ref.to_string());
        request.proof_ref = proof_ref.map(str::to_string);
        request.paid_at = Some(chrono::Utc::now());
        Ok(request.clone())
    }

    async fn append_message(&self, new: NewDealMessage) -> Result<DealMessage, EscrowError> {
        let mut tables = self.tables.write().await;
        tables.next_message_id += 1;
        let message = new.into_message(tables.next_message_id);
        tables.messages.push(message.clone());
        Ok(message)
    }

    async fn messages(
        &self,
        deal_id: DealId,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<DealMessage>, EscrowError> {
        let tables = self.tables.read().await;
        let mut thread: Vec<DealMessage> = tables
            .messages
            .iter()
            .filter(|m| m.deal_id == deal_id)
            .cloned()
            .collect();
        thread.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(thread
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(0))
            .take(usize::try_from(limit).unwrap_or(0))
            .collect())
    }
}

/// In-memory payment-details directory for tests and demos.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    entries: RwLock<HashMap<UserId, String>>,
}

impl MemoryDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers payment details for a user, replacing any previous value.
    pub async fn register(&self, user: UserId, details: impl Into<String>) {
        self.entries.write().await.insert(user, details.into());
    }
}

#[async_trait]
impl PaymentProfileDirectory for MemoryDirectory {
    async fn payment_details(&self, user: UserId) -> Result<Option<String>, EscrowError> {
        Ok(self.entries.read().await.get(&user).cloned())
    }
}

//! Append-only per-deal message thread.

use std::sync::Arc;

use chrono::Utc;

use crate::domain::{DealId, DealMessage, NewDealMessage, UserId};
use crate::error::EscrowError;
use crate::persistence::DealStore;

/// Coordinator for a deal's message thread.
///
/// Entries are never mutated or deleted; reads are chronological and
/// restartable via offset/limit.
#[derive(Debug, Clone)]
pub struct DealMessageLog {
    store: Arc<dyn DealStore>,
}

impl DealMessageLog {
    /// Creates a log over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn DealStore>) -> Self {
        Self { store }
    }

    /// Appends a user-authored entry.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::Validation`] if the author is the system
    /// sentinel — system entries go through [`Self::append_system`] so
    /// they are never attributable to a real user, and vice versa.
    pub async fn append(
        &self,
        deal_id: DealId,
        author: UserId,
        author_label: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<DealMessage, EscrowError> {
        if author.is_system() {
            return Err(EscrowError::Validation(
                "user entries must not carry the system author".to_string(),
            ));
        }
        self.store
            .append_message(NewDealMessage {
                deal_id,
                author,
                author_label: author_label.into(),
                text: text.into(),
                is_system: false,
                created_at: Utc::now(),
            })
            .await
    }

    /// Appends a system entry with the sentinel author.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::Persistence`] on storage failure.
    pub async fn append_system(
        &self,
        deal_id: DealId,
        text: impl Into<String>,
    ) -> Result<DealMessage, EscrowError> {
        self.store
            .append_message(NewDealMessage::system(deal_id, text))
            .await
    }

    /// Reads the thread in chronological order.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::Persistence`] on storage failure.
    pub async fn read(
        &self,
        deal_id: DealId,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<DealMessage>, EscrowError> {
        self.store.messages(deal_id, offset, limit).await
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::NewDeal;
    use crate::persistence::MemoryStore;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    async fn log_with_deal() -> (DealMessageLog, DealId) {
        let store = Arc::new(MemoryStore::new());
        let deal = store
            .insert_deal(NewDeal {
                token: Uuid::new_v4(),
                buyer: UserId::new(1),
                seller: UserId::new(2),
                amount: Decimal::new(1000, 0),
                currency: "RUB".to_string(),
                description: "item".to_string(),
                created_at: Utc::now(),
                expires_at: Utc::now(),
            })
            .await;
        let Ok(deal) = deal else {
            panic!("insert failed");
        };
        (DealMessageLog::new(store), deal.id)
    }

    #[tokio::test]
    async fn user_and_system_entries_interleave_chronologically() {
        let (log, deal_id) = log_with_deal().await;

        let first = log.append_system(deal_id, "deal created").await;
        assert!(first.is_ok());
        let second = log.append(deal_id, UserId::new(1), "buyer", "hello").await;
        assert!(second.is_ok());

        let thread = log.read(deal_id, 0, 10).await;
        let Ok(thread) = thread else {
            panic!("read failed");
        };
        assert_eq!(thread.len(), 2);
        assert!(thread.first().is_some_and(|m| m.is_system));
        assert!(thread.get(1).is_some_and(|m| !m.is_system));
    }

    #[tokio::test]
    async fn user_entry_with_sentinel_author_is_rejected() {
        let (log, deal_id) = log_with_deal().await;
        let result = log.append(deal_id, UserId::SYSTEM, "system", "spoof").await;
        assert!(matches!(result, Err(EscrowError::Validation(_))));
    }
}

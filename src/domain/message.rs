//! Append-only per-deal message thread entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DealId, UserId};

/// Author label attached to system-generated entries.
pub const SYSTEM_AUTHOR_LABEL: &str = "system";

/// One entry in a deal's message thread.
///
/// Never mutated or deleted. System entries carry the [`UserId::SYSTEM`]
/// sentinel author and are never attributable to a real user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealMessage {
    /// Row id assigned by the store.
    pub id: i64,
    /// The deal this entry belongs to.
    pub deal_id: DealId,
    /// Author identity; [`UserId::SYSTEM`] for system entries.
    pub author: UserId,
    /// Display label of the author at write time.
    pub author_label: String,
    /// Message text.
    pub text: String,
    /// `true` for engine-generated entries.
    pub is_system: bool,
    /// Creation timestamp; reads are ordered by it ascending.
    pub created_at: DateTime<Utc>,
}

/// Input record for [`crate::persistence::DealStore::append_message`].
#[derive(Debug, Clone)]
pub struct NewDealMessage {
    /// The deal this entry belongs to.
    pub deal_id: DealId,
    /// Author identity.
    pub author: UserId,
    /// Display label of the author.
    pub author_label: String,
    /// Message text.
    pub text: String,
    /// `true` for engine-generated entries.
    pub is_system: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl NewDealMessage {
    /// Builds a system entry with the sentinel author.
    #[must_use]
    pub fn system(deal_id: DealId, text: impl Into<String>) -> Self {
        Self {
            deal_id,
            author: UserId::SYSTEM,
            author_label: SYSTEM_AUTHOR_LABEL.to_string(),
            text: text.into(),
            is_system: true,
            created_at: Utc::now(),
        }
    }

    /// Materializes the full record with a store-assigned id.
    #[must_use]
    pub fn into_message(self, id: i64) -> DealMessage {
        DealMessage {
            id,
            deal_id: self.deal_id,
            author: self.author,
            author_label: self.author_label,
            text: self.text,
            is_system: self.is_system,
            created_at: self.created_at,
        }
    }
}

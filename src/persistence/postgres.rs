//! PostgreSQL implementation of the persistence layer.
//!
//! Every guarded mutation is a single `UPDATE ... WHERE <guard>` so that
//! the compare-and-set happens inside the database; a zero-row update means
//! the caller lost a race, never a silent merge.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use super::models::{DealMessageRow, DealRow, PaymentRequestRow};
use super::DealStore;
use crate::config::EscrowConfig;
use crate::domain::{
    Deal, DealGuard, DealId, DealMessage, NewDeal, NewDealMessage, NewPaymentRequest,
    PaymentRequest, UserId,
};
use crate::error::EscrowError;

const DEAL_COLUMNS: &str = "id, token, buyer_id, seller_id, amount, currency, description, \
     status, buyer_paid, guarantor_confirmed, buyer_done, seller_done, guarantor_paid, \
     payout_txn_ref, payout_proof_ref, created_at, expires_at, completed_at";

const REQUEST_COLUMNS: &str =
    "id, deal_id, seller_id, amount, currency, payment_details, status, txn_ref, proof_ref, \
     created_at, paid_at";

/// PostgreSQL-backed store using `sqlx::PgPool`.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a store over an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a pool from the configuration and runs pending migrations.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::Persistence`] if the database cannot be
    /// reached or migrated.
    pub async fn connect(config: &EscrowConfig) -> Result<Self, EscrowError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connect_timeout_secs))
            .connect(&config.database_url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| EscrowError::Persistence(e.to_string()))?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl DealStore for PostgresStore {
    async fn insert_deal(&self, new: NewDeal) -> Result<Deal, EscrowError> {
        let row = sqlx::query_as::<_, DealRow>(&format!(
            "INSERT INTO deals \
               (token, buyer_id, seller_id, amount, currency, description, status, created_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, 'created', $7, $8) \
             RETURNING {DEAL_COLUMNS}"
        ))
        .bind(new.token)
        .bind(new.buyer.get())
        .bind(new.seller.get())
        .bind(new.amount)
        .bind(&new.currency)
        .bind(&new.description)
        .bind(new.created_at)
        .bind(new.expires_at)
        .fetch_one(&self.pool)
        .await?;

        Deal::try_from(row)
    }

    async fn deal(&self, id: DealId) -> Result<Deal, EscrowError> {
        let row = sqlx::query_as::<_, DealRow>(&format!(
            "SELECT {DEAL_COLUMNS} FROM deals WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(EscrowError::DealNotFound(id))?;

        Deal::try_from(row)
    }

    async fn deal_by_token(&self, token: Uuid) -> Result<Deal, EscrowError> {
        let row = sqlx::query_as::<_, DealRow>(&format!(
            "SELECT {DEAL_COLUMNS} FROM deals WHERE token = $1"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(EscrowError::DealTokenNotFound(token))?;

        Deal::try_from(row)
    }

    async fn deals_for_user(&self, user: UserId, limit: i64) -> Result<Vec<Deal>, EscrowError> {
        let rows = sqlx::query_as::<_, DealRow>(&format!(
            "SELECT {DEAL_COLUMNS} FROM deals \
             WHERE buyer_id = $1 OR seller_id = $1 \
             ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(user.get())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Deal::try_from).collect()
    }

    async fn update_deal(&self, update: &Deal, guard: &DealGuard) -> Result<Deal, EscrowError> {
        let row = sqlx::query_as::<_, DealRow>(&format!(
            "UPDATE deals SET \
               status = $2, buyer_paid = $3, guarantor_confirmed = $4, buyer_done = $5, \
               seller_done = $6, guarantor_paid = $7, payout_txn_ref = $8, \
               payout_proof_ref = $9, completed_at = $10 \
             WHERE id = $1 \
               AND status = $11 \
               AND ($12::boolean IS NULL OR buyer_paid = $12) \
               AND ($13::boolean IS NULL OR buyer_done = $13) \
               AND ($14::boolean IS NULL OR seller_done = $14) \
               AND ($15::boolean IS NULL OR guarantor_paid = $15) \
             RETURNING {DEAL_COLUMNS}"
        ))
        .bind(update.id.get())
        .bind(update.status.as_str())
        .bind(update.buyer_paid)
        .bind(update.guarantor_confirmed)
        .bind(update.buyer_done)
        .bind(update.seller_done)
        .bind(update.guarantor_paid)
        .bind(update.payout_txn_ref.as_deref())
        .bind(update.payout_proof_ref.as_deref())
        .bind(update.completed_at)
        .bind(guard.status.as_str())
        .bind(guard.buyer_paid)
        .bind(guard.buyer_done)
        .bind(guard.seller_done)
        .bind(guard.guarantor_paid)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Deal::try_from(row),
            None => {
                // Zero rows: either the guard no longer matches or the deal
                // is gone. Distinguish so callers can retry the former.
                let exists = sqlx::query_scalar::<_, bool>(
                    "SELECT EXISTS(SELECT 1 FROM deals WHERE id = $1)",
                )
                .bind(update.id.get())
                .fetch_one(&self.pool)
                .await?;
                if exists {
                    Err(EscrowError::ConcurrentModification(update.id))
                } else {
                    Err(EscrowError::DealNotFound(update.id))
                }
            }
        }
    }

    async fn complete_payout(
        &self,
        update: &Deal,
        guard: &DealGuard,
        request_id: i64,
        txn_ref: &str,
        proof_ref: Option<&str>,
    ) -> Result<(Deal, PaymentRequest), EscrowError> {
        // Both writes run in one transaction: a completed deal must never
        // be committed with its request left pending.
        let mut tx = self.pool.begin().await?;

        let deal_row = sqlx::query_as::<_, DealRow>(&format!(
            "UPDATE deals SET \
               status = $2, buyer_paid = $3, guarantor_confirmed = $4, buyer_done = $5, \
               seller_done = $6, guarantor_paid = $7, payout_txn_ref = $8, \
               payout_proof_ref = $9, completed_at = $10 \
             WHERE id = $1 \
               AND status = $11 \
               AND ($12::boolean IS NULL OR buyer_paid = $12) \
               AND ($13::boolean IS NULL OR buyer_done = $13) \
               AND ($14::boolean IS NULL OR seller_done = $14) \
               AND ($15::boolean IS NULL OR guarantor_paid = $15) \
             RETURNING {DEAL_COLUMNS}"
        ))
        .bind(update.id.get())
        .bind(update.status.as_str())
        .bind(update.buyer_paid)
        .bind(update.guarantor_confirmed)
        .bind(update.buyer_done)
        .bind(update.seller_done)
        .bind(update.guarantor_paid)
        .bind(update.payout_txn_ref.as_deref())
        .bind(update.payout_proof_ref.as_deref())
        .bind(update.completed_at)
        .bind(guard.status.as_str())
        .bind(guard.buyer_paid)
        .bind(guard.buyer_done)
        .bind(guard.seller_done)
        .bind(guard.guarantor_paid)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(deal_row) = deal_row else {
            tx.rollback().await?;
            let exists = sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS(SELECT 1 FROM deals WHERE id = $1)",
            )
            .bind(update.id.get())
            .fetch_one(&self.pool)
            .await?;
            return Err(if exists {
                EscrowError::ConcurrentModification(update.id)
            } else {
                EscrowError::DealNotFound(update.id)
            });
        };

        let request_row = sqlx::query_as::<_, PaymentRequestRow>(&format!(
            "UPDATE payment_requests \
             SET status = 'paid', txn_ref = $2, proof_ref = $3, paid_at = NOW() \
             WHERE id = $1 AND status = 'pending' \
             RETURNING {REQUEST_COLUMNS}"
        ))
        .bind(request_id)
        .bind(txn_ref)
        .bind(proof_ref)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(request_row) = request_row else {
            tx.rollback().await?;
            let exists = sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS(SELECT 1 FROM payment_requests WHERE id = $1)",
            )
            .bind(request_id)
            .fetch_one(&self.pool)
            .await?;
            return Err(if exists {
                EscrowError::InvalidTransition(format!(
                    "payment request {request_id} is already paid"
                ))
            } else {
                EscrowError::PaymentRequestNotFound(request_id)
            });
        };

        tx.commit().await?;
        Ok((Deal::try_from(deal_row)?, PaymentRequest::try_from(request_row)?))
    }

    async fn insert_payment_request(
        &self,
        new: NewPaymentRequest,
    ) -> Result<PaymentRequest, EscrowError> {
        // A partial unique index on (deal_id) WHERE status = 'pending'
        // enforces one payout cycle at a time.
        let result = sqlx::query_as::<_, PaymentRequestRow>(&format!(
            "INSERT INTO payment_requests \
               (deal_id, seller_id, amount, currency, payment_details, status, created_at) \
             VALUES ($1, $2, $3, $4, $5, 'pending', $6) \
             RETURNING {REQUEST_COLUMNS}"
        ))
        .bind(new.deal_id.get())
        .bind(new.seller.get())
        .bind(new.amount)
        .bind(&new.currency)
        .bind(&new.payment_details)
        .bind(new.created_at)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => PaymentRequest::try_from(row),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(EscrowError::InvalidTransition(format!(
                    "deal {} already has a pending payout request",
                    new.deal_id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn pending_payment_request(
        &self,
        deal_id: DealId,
    ) -> Result<Option<PaymentRequest>, EscrowError> {
        let row = sqlx::query_as::<_, PaymentRequestRow>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM payment_requests \
             WHERE deal_id = $1 AND status = 'pending'"
        ))
        .bind(deal_id.get())
        .fetch_optional(&self.pool)
        .await?;

        row.map(PaymentRequest::try_from).transpose()
    }

    async fn mark_payment_request_paid(
        &self,
        request_id: i64,
        txn_ref: &str,
        proof_ref: Option<&str>,
    ) -> Result<PaymentRequest, EscrowError> {
        let row = sqlx::query_as::<_, PaymentRequestRow>(&format!(
            "UPDATE payment_requests \
             SET status = 'paid', txn_ref = $2, proof_ref = $3, paid_at = NOW() \
             WHERE id = $1 AND status = 'pending' \
             RETURNING {REQUEST_COLUMNS}"
        ))
        .bind(request_id)
        .bind(txn_ref)
        .bind(proof_ref)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => PaymentRequest::try_from(row),
            None => {
                let exists = sqlx::query_scalar::<_, bool>(
                    "SELECT EXISTS(SELECT 1 FROM payment_requests WHERE id = $1)",
                )
                .bind(request_id)
                .fetch_one(&self.pool)
                .await?;
                if exists {
                    Err(EscrowError::InvalidTransition(format!(
                        "payment request {request_id} is already paid"
                    )))
                } else {
                    Err(EscrowError::PaymentRequestNotFound(request_id))
                }
            }
        }
    }

    async fn append_message(&self, new: NewDealMessage) -> Result<DealMessage, EscrowError> {
        let row = sqlx::query_as::<_, DealMessageRow>(
            "INSERT INTO deal_messages \
               (deal_id, author_id, author_label, text, is_system, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING id, deal_id, author_id, author_label, text, is_system, created_at",
        )
        .bind(new.deal_id.get())
        .bind(new.author.get())
        .bind(&new.author_label)
        .bind(&new.text)
        .bind(new.is_system)
        .bind(new.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(DealMessage::from(row))
    }

    async fn messages(
        &self,
        deal_id: DealId,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<DealMessage>, EscrowError> {
        let rows = sqlx::query_as::<_, DealMessageRow>(
            "SELECT id, deal_id, author_id, author_label, text, is_system, created_at \
             FROM deal_messages WHERE deal_id = $1 \
             ORDER BY created_at ASC, id ASC OFFSET $2 LIMIT $3",
        )
        .bind(deal_id.get())
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(DealMessage::from).collect())
    }
}

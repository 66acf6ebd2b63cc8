//! Deal service: the escrow state machine.
//!
//! Every mutation follows the same pattern: load the deal, resolve the
//! actor's role, validate the action against the transition table, commit
//! the new state with a compare-and-set write, then append system messages
//! and publish notifications. A failed guard returns an error with zero
//! side effects — nothing is written and nothing is sent.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::config::EscrowConfig;
use crate::domain::{
    CreateDealRequest, Deal, DealAction, DealGuard, DealId, DealMessage, DealStatus, NewDeal,
    Notification, NotificationBus, Role, UserId, resolve,
};
use crate::error::EscrowError;
use crate::persistence::{DealStore, PaymentProfileDirectory};
use crate::service::{DealMessageLog, PaymentRequestManager};

/// A validated, not-yet-committed transition.
///
/// The side-effect lists are carried alongside the update so that nothing
/// is sent before the compare-and-set write lands.
#[derive(Debug)]
struct TransitionPlan {
    update: Deal,
    guard: DealGuard,
    system_notes: Vec<String>,
    notifications: Vec<Notification>,
}

/// Orchestration layer for the deal lifecycle.
///
/// Stateless coordinator: owns the store, the profile directory seam, and
/// the notification bus. Deals are independent; concurrent actions on the
/// same deal are serialized by the store's compare-and-set, and the loser
/// receives [`EscrowError::ConcurrentModification`].
#[derive(Debug, Clone)]
pub struct DealService {
    store: Arc<dyn DealStore>,
    directory: Arc<dyn PaymentProfileDirectory>,
    notifications: NotificationBus,
    payments: PaymentRequestManager,
    message_log: DealMessageLog,
    guarantor: UserId,
    deal_ttl: chrono::Duration,
}

impl DealService {
    /// Creates a new `DealService`.
    #[must_use]
    pub fn new(
        store: Arc<dyn DealStore>,
        directory: Arc<dyn PaymentProfileDirectory>,
        notifications: NotificationBus,
        config: &EscrowConfig,
    ) -> Self {
        Self {
            payments: PaymentRequestManager::new(Arc::clone(&store)),
            message_log: DealMessageLog::new(Arc::clone(&store)),
            store,
            directory,
            notifications,
            guarantor: config.guarantor,
            deal_ttl: chrono::Duration::hours(config.deal_ttl_hours),
        }
    }

    /// Returns a reference to the outbound [`NotificationBus`].
    #[must_use]
    pub fn notifications(&self) -> &NotificationBus {
        &self.notifications
    }

    /// Returns a reference to the [`DealMessageLog`].
    #[must_use]
    pub fn message_log(&self) -> &DealMessageLog {
        &self.message_log
    }

    /// Returns a reference to the [`PaymentRequestManager`].
    #[must_use]
    pub fn payments(&self) -> &PaymentRequestManager {
        &self.payments
    }

    /// Resolves the caller's role for a deal.
    #[must_use]
    pub fn role_of(&self, actor: UserId, deal: &Deal) -> Role {
        resolve(actor, deal, self.guarantor)
    }

    /// Validates and persists a new deal in [`DealStatus::Created`].
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::Validation`] for same-party deals,
    /// non-positive amounts, or empty currency/description — rejected
    /// before anything is persisted.
    pub async fn create_deal(&self, request: CreateDealRequest) -> Result<Deal, EscrowError> {
        if request.buyer == request.seller {
            return Err(EscrowError::Validation(
                "buyer and seller must be different users".to_string(),
            ));
        }
        if request.amount <= Decimal::ZERO {
            return Err(EscrowError::Validation(format!(
                "amount must be positive, got {}",
                request.amount
            )));
        }
        if request.currency.trim().is_empty() {
            return Err(EscrowError::Validation("currency must not be empty".to_string()));
        }
        if request.description.trim().is_empty() {
            return Err(EscrowError::Validation(
                "description must not be empty".to_string(),
            ));
        }

        let now = Utc::now();
        let deal = self
            .store
            .insert_deal(NewDeal {
                token: Uuid::new_v4(),
                buyer: request.buyer,
                seller: request.seller,
                amount: request.amount,
                currency: request.currency,
                description: request.description,
                created_at: now,
                expires_at: now + self.deal_ttl,
            })
            .await?;

        tracing::info!(deal_id = %deal.id, buyer = %deal.buyer, seller = %deal.seller, "deal created");

        self.record_and_notify(
            deal.id,
            vec![format!(
                "Deal created: {} for {} {}.",
                deal.description, deal.amount, deal.currency
            )],
            vec![Notification::new(
                deal.seller,
                format!(
                    "Deal #{}: new escrow deal for {} {} — accept or reject it.",
                    deal.id, deal.amount, deal.currency
                ),
            )],
        )
        .await;

        Ok(deal)
    }

    /// Loads a deal by id.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::DealNotFound`] if absent.
    pub async fn get_deal(&self, deal_id: DealId) -> Result<Deal, EscrowError> {
        self.store.deal(deal_id).await
    }

    /// Loads a deal by its external deep-link token.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::DealTokenNotFound`] if absent.
    pub async fn get_deal_by_token(&self, token: Uuid) -> Result<Deal, EscrowError> {
        self.store.deal_by_token(token).await
    }

    /// Lists deals where the user participates, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::Persistence`] on storage failure.
    pub async fn list_deals_for_user(
        &self,
        user: UserId,
        limit: i64,
    ) -> Result<Vec<Deal>, EscrowError> {
        self.store.deals_for_user(user, limit).await
    }

    /// Reads a deal's message thread, chronological.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::Persistence`] on storage failure.
    pub async fn list_messages(
        &self,
        deal_id: DealId,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<DealMessage>, EscrowError> {
        self.message_log.read(deal_id, offset, limit).await
    }

    /// Applies an action to a deal on behalf of `actor`.
    ///
    /// # Errors
    ///
    /// - [`EscrowError::PermissionDenied`] — the actor's role may not
    ///   perform this action.
    /// - [`EscrowError::InvalidTransition`] — not legal from the current
    ///   status/flags.
    /// - [`EscrowError::ConcurrentModification`] — lost the write race;
    ///   reload and retry.
    /// - [`EscrowError::DependencyMissing`] — payout requested but the
    ///   seller has no payment details on file (the seller is asked to
    ///   supply them).
    pub async fn apply(
        &self,
        deal_id: DealId,
        actor: UserId,
        action: DealAction,
    ) -> Result<Deal, EscrowError> {
        let deal = self.store.deal(deal_id).await?;
        let role = self.role_of(actor, &deal);

        match action {
            DealAction::CreatePayout => self.create_payout(deal, role).await,
            DealAction::ConfirmPayout { txn_ref, proof_ref } => {
                self.confirm_payout(deal, role, txn_ref, proof_ref).await
            }
            other => {
                let plan = plan_transition(&deal, role, &other, self.guarantor)?;
                self.commit(plan, other.name()).await
            }
        }
    }

    /// Guarantor initiates the payout cycle. The deal record itself is
    /// unchanged; the side effect is a pending payout request.
    async fn create_payout(&self, deal: Deal, role: Role) -> Result<Deal, EscrowError> {
        if role != Role::Guarantor {
            return Err(EscrowError::PermissionDenied(format!(
                "{role} may not create_payout"
            )));
        }
        // Both confirmations auto-advance the deal to completed, so the
        // payout cycle runs against either status as long as the flags hold.
        if !matches!(
            deal.status,
            DealStatus::PaymentConfirmed | DealStatus::Completed
        ) || !deal.buyer_done
            || !deal.seller_done
            || deal.guarantor_paid
        {
            return Err(EscrowError::InvalidTransition(format!(
                "payout requires both confirmations on an undisbursed deal, got {} \
                 (buyer_done={}, seller_done={}, guarantor_paid={})",
                deal.status, deal.buyer_done, deal.seller_done, deal.guarantor_paid
            )));
        }

        let Some(details) = self.directory.payment_details(deal.seller).await? else {
            // Degraded path: ask the seller for details instead of failing
            // the guarantor hard. No payout request is created.
            let sent = self.notifications.publish(Notification::new(
                deal.seller,
                format!(
                    "Deal #{}: please register your payment details to receive the payout.",
                    deal.id
                ),
            ));
            if sent == 0 {
                tracing::debug!(deal_id = %deal.id, "details request published with no subscribers");
            }
            return Err(EscrowError::DependencyMissing(format!(
                "seller {} has no payment details on file",
                deal.seller
            )));
        };

        let request = self.payments.create_request(&deal, details).await?;
        tracing::info!(deal_id = %deal.id, request_id = request.id, "payout request created");

        self.record_and_notify(
            deal.id,
            vec![format!(
                "Payout of {} {} requested for the seller.",
                request.amount, request.currency
            )],
            Vec::new(),
        )
        .await;

        Ok(deal)
    }

    /// Guarantor records the executed disbursement: the deal completes and
    /// the pending payout request is marked paid.
    async fn confirm_payout(
        &self,
        deal: Deal,
        role: Role,
        txn_ref: String,
        proof_ref: Option<String>,
    ) -> Result<Deal, EscrowError> {
        if role != Role::Guarantor {
            return Err(EscrowError::PermissionDenied(format!(
                "{role} may not confirm_payout"
            )));
        }
        if !matches!(
            deal.status,
            DealStatus::PaymentConfirmed | DealStatus::Completed
        ) || deal.guarantor_paid
        {
            return Err(EscrowError::InvalidTransition(format!(
                "cannot confirm a payout from {} (guarantor_paid={})",
                deal.status, deal.guarantor_paid
            )));
        }
        let Some(request) = self.payments.pending_for(deal.id).await? else {
            return Err(EscrowError::InvalidTransition(format!(
                "deal {} has no open payout request",
                deal.id
            )));
        };

        let mut update = deal.clone();
        update.status = DealStatus::Completed;
        update.guarantor_paid = true;
        update.payout_txn_ref = Some(txn_ref.clone());
        update.payout_proof_ref = proof_ref.clone();
        update.completed_at = update.completed_at.or_else(|| Some(Utc::now()));

        // One atomic store operation: the deal completes and the request is
        // settled together, so a persistence failure cannot strand a
        // completed deal with its request still pending.
        let (committed, _) = self
            .store
            .complete_payout(
                &update,
                &DealGuard::snapshot(&deal),
                request.id,
                &txn_ref,
                proof_ref.as_deref(),
            )
            .await?;

        tracing::info!(deal_id = %committed.id, request_id = request.id, "payout confirmed, deal completed");

        self.record_and_notify(
            committed.id,
            vec![format!("Payout sent (ref {txn_ref}). Deal completed.")],
            vec![Notification::new(
                committed.seller,
                format!(
                    "Deal #{}: the payout of {} {} was sent (ref {}).",
                    committed.id, committed.amount, committed.currency, txn_ref
                ),
            )],
        )
        .await;

        Ok(committed)
    }

    /// Commits a planned transition and, only after the write lands, emits
    /// its side effects.
    async fn commit(&self, plan: TransitionPlan, action: &str) -> Result<Deal, EscrowError> {
        let committed = self.store.update_deal(&plan.update, &plan.guard).await?;
        tracing::info!(
            deal_id = %committed.id,
            status = %committed.status,
            action,
            "deal transition committed"
        );
        self.record_and_notify(committed.id, plan.system_notes, plan.notifications)
            .await;
        Ok(committed)
    }

    /// Appends system messages and publishes notifications for a committed
    /// change. Both are best-effort: the state is already durable, so
    /// failures here are logged, never propagated.
    async fn record_and_notify(
        &self,
        deal_id: DealId,
        system_notes: Vec<String>,
        notifications: Vec<Notification>,
    ) {
        for note in system_notes {
            if let Err(e) = self.message_log.append_system(deal_id, note).await {
                tracing::warn!(%deal_id, error = %e, "failed to append system message");
            }
        }
        for notification in notifications {
            if self.notifications.publish(notification) == 0 {
                tracing::debug!(%deal_id, "notification published with no subscribers");
            }
        }
    }
}

/// Checks the actor's role against the action's required role.
fn require_role(role: Role, allowed: &[Role], action: &DealAction) -> Result<(), EscrowError> {
    if allowed.contains(&role) {
        Ok(())
    } else {
        Err(EscrowError::PermissionDenied(format!(
            "{role} may not {}",
            action.name()
        )))
    }
}

/// Pure transition planner for the single-record actions.
///
/// Validates the action against the deal's status and flags and produces
/// the updated record, a compare-and-set guard pinning the snapshot the
/// update was derived from, and the side effects to emit after commit.
/// The full pin matters: the committed update copies every flag from the
/// snapshot, so a guard covering only the actor's own flag would let a
/// stale write erase a concurrent writer's committed flag.
fn plan_transition(
    deal: &Deal,
    role: Role,
    action: &DealAction,
    guarantor: UserId,
) -> Result<TransitionPlan, EscrowError> {
    let mut update = deal.clone();
    let mut system_notes = Vec::new();
    let mut notifications = Vec::new();

    match action {
        DealAction::Accept => {
            require_role(role, &[Role::Seller], action)?;
            if deal.status != DealStatus::Created {
                return Err(EscrowError::InvalidTransition(format!(
                    "cannot accept a deal in {}",
                    deal.status
                )));
            }
            update.status = DealStatus::Accepted;
            system_notes.push("Seller accepted the deal.".to_string());
            notifications.push(Notification::new(
                deal.buyer,
                format!(
                    "Deal #{}: the seller accepted. Send {} {} to the guarantor.",
                    deal.id, deal.amount, deal.currency
                ),
            ));
        }

        DealAction::Reject => {
            require_role(role, &[Role::Seller], action)?;
            if deal.status != DealStatus::Created {
                return Err(EscrowError::InvalidTransition(format!(
                    "cannot reject a deal in {}",
                    deal.status
                )));
            }
            update.status = DealStatus::Cancelled;
            update.completed_at = Some(Utc::now());
            system_notes.push("Seller rejected the deal.".to_string());
            notifications.push(Notification::new(
                deal.buyer,
                format!("Deal #{}: the seller rejected the deal.", deal.id),
            ));
        }

        DealAction::Cancel => {
            require_role(role, &[Role::Buyer, Role::Seller], action)?;
            if !matches!(deal.status, DealStatus::Created | DealStatus::Accepted) {
                return Err(EscrowError::InvalidTransition(format!(
                    "cannot cancel a deal in {}",
                    deal.status
                )));
            }
            update.status = DealStatus::Cancelled;
            update.completed_at = Some(Utc::now());
            let (who, other) = if role == Role::Buyer {
                ("buyer", deal.seller)
            } else {
                ("seller", deal.buyer)
            };
            system_notes.push(format!("Deal cancelled by the {who}."));
            notifications.push(Notification::new(
                other,
                format!("Deal #{}: cancelled by the {who}.", deal.id),
            ));
        }

        DealAction::BuyerMarkPaid => {
            require_role(role, &[Role::Buyer], action)?;
            if deal.status != DealStatus::Accepted {
                return Err(EscrowError::InvalidTransition(format!(
                    "cannot mark paid a deal in {}",
                    deal.status
                )));
            }
            if deal.buyer_paid {
                return Err(EscrowError::InvalidTransition(
                    "payment is already marked".to_string(),
                ));
            }
            update.buyer_paid = true;
            system_notes.push("Buyer reports the funds were sent.".to_string());
            notifications.push(Notification::new(
                guarantor,
                format!(
                    "Deal #{}: the buyer reports payment of {} {} — please confirm receipt.",
                    deal.id, deal.amount, deal.currency
                ),
            ));
        }

        DealAction::GuarantorConfirm => {
            require_role(role, &[Role::Guarantor], action)?;
            if deal.status != DealStatus::Accepted {
                return Err(EscrowError::InvalidTransition(format!(
                    "cannot confirm payment on a deal in {}",
                    deal.status
                )));
            }
            if !deal.buyer_paid {
                return Err(EscrowError::InvalidTransition(
                    "buyer has not marked the deal as paid".to_string(),
                ));
            }
            update.status = DealStatus::PaymentConfirmed;
            update.guarantor_confirmed = true;
            system_notes.push("Guarantor confirmed the funds arrived.".to_string());
            notifications.push(Notification::new(
                deal.buyer,
                format!("Deal #{}: the guarantor confirmed your payment.", deal.id),
            ));
            notifications.push(Notification::new(
                deal.seller,
                format!(
                    "Deal #{}: funds are in escrow — you can ship now.",
                    deal.id
                ),
            ));
        }

        DealAction::GuarantorRejectPayment => {
            require_role(role, &[Role::Guarantor], action)?;
            if deal.status != DealStatus::Accepted {
                return Err(EscrowError::InvalidTransition(format!(
                    "cannot reject payment on a deal in {}",
                    deal.status
                )));
            }
            if !deal.buyer_paid {
                return Err(EscrowError::InvalidTransition(
                    "buyer has not marked the deal as paid".to_string(),
                ));
            }
            update.buyer_paid = false;
            system_notes.push("Guarantor rejected the payment claim.".to_string());
            notifications.push(Notification::new(
                deal.buyer,
                format!(
                    "Deal #{}: the guarantor did not receive your payment. Please check and retry.",
                    deal.id
                ),
            ));
        }

        DealAction::BuyerConfirmReceipt => {
            require_role(role, &[Role::Buyer], action)?;
            if deal.status != DealStatus::PaymentConfirmed {
                return Err(EscrowError::InvalidTransition(format!(
                    "cannot confirm receipt on a deal in {}",
                    deal.status
                )));
            }
            if deal.buyer_done {
                return Err(EscrowError::InvalidTransition(
                    "receipt is already confirmed".to_string(),
                ));
            }
            update.buyer_done = true;
            system_notes.push("Buyer confirmed receipt.".to_string());
            if deal.seller_done {
                update.status = DealStatus::Completed;
                update.completed_at = Some(Utc::now());
                system_notes.push("Both sides confirmed. Deal completed.".to_string());
                notifications.push(Notification::new(
                    deal.seller,
                    format!("Deal #{}: completed — awaiting the payout.", deal.id),
                ));
            }
        }

        DealAction::SellerConfirmShipped => {
            require_role(role, &[Role::Seller], action)?;
            if deal.status != DealStatus::PaymentConfirmed {
                return Err(EscrowError::InvalidTransition(format!(
                    "cannot confirm shipment on a deal in {}",
                    deal.status
                )));
            }
            if deal.seller_done {
                return Err(EscrowError::InvalidTransition(
                    "shipment is already confirmed".to_string(),
                ));
            }
            update.seller_done = true;
            system_notes.push("Seller confirmed shipment.".to_string());
            if deal.buyer_done {
                update.status = DealStatus::Completed;
                update.completed_at = Some(Utc::now());
                system_notes.push("Both sides confirmed. Deal completed.".to_string());
                notifications.push(Notification::new(
                    deal.buyer,
                    format!("Deal #{}: completed.", deal.id),
                ));
            }
        }

        DealAction::OpenDispute => {
            require_role(role, &[Role::Guarantor], action)?;
            if deal.status != DealStatus::PaymentConfirmed {
                return Err(EscrowError::InvalidTransition(format!(
                    "cannot open a dispute on a deal in {}",
                    deal.status
                )));
            }
            update.status = DealStatus::Disputed;
            update.completed_at = Some(Utc::now());
            system_notes.push("Guarantor opened a dispute.".to_string());
            for party in [deal.buyer, deal.seller] {
                notifications.push(Notification::new(
                    party,
                    format!(
                        "Deal #{}: the guarantor opened a dispute. The deal is frozen.",
                        deal.id
                    ),
                ));
            }
        }

        DealAction::CreatePayout | DealAction::ConfirmPayout { .. } => {
            // Payout actions carry sub-record side effects and are handled
            // directly by the service, not by the planner.
            return Err(EscrowError::InvalidTransition(format!(
                "{} is not a plain transition",
                action.name()
            )));
        }
    }

    Ok(TransitionPlan {
        update,
        guard: DealGuard::snapshot(deal),
        system_notes,
        notifications,
    })
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::config::StoreBackend;
    use crate::persistence::{MemoryDirectory, MemoryStore};

    const BUYER: UserId = UserId::new(10);
    const SELLER: UserId = UserId::new(20);
    const GUARANTOR: UserId = UserId::new(99);
    const STRANGER: UserId = UserId::new(7);

    fn test_config() -> EscrowConfig {
        EscrowConfig {
            guarantor: GUARANTOR,
            deal_ttl_hours: 48,
            store_backend: StoreBackend::Memory,
            database_url: String::new(),
            database_max_connections: 1,
            database_min_connections: 1,
            database_connect_timeout_secs: 1,
            notification_capacity: 100,
        }
    }

    fn make_service() -> (DealService, Arc<MemoryDirectory>) {
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(MemoryDirectory::new());
        let seam = Arc::clone(&directory) as Arc<dyn PaymentProfileDirectory>;
        let bus = NotificationBus::new(100);
        let service = DealService::new(store, seam, bus, &test_config());
        (service, directory)
    }

    fn request() -> CreateDealRequest {
        CreateDealRequest {
            buyer: BUYER,
            seller: SELLER,
            amount: Decimal::new(1000, 0),
            currency: "RUB".to_string(),
            description: "game account".to_string(),
        }
    }

    async fn created_deal(service: &DealService) -> Deal {
        let deal = service.create_deal(request()).await;
        let Ok(deal) = deal else {
            panic!("create_deal failed");
        };
        deal
    }

    /// Drives a deal to `PaymentConfirmed` with both done flags clear.
    async fn confirmed_deal(service: &DealService) -> Deal {
        let deal = created_deal(service).await;
        let steps = [
            (SELLER, DealAction::Accept),
            (BUYER, DealAction::BuyerMarkPaid),
            (GUARANTOR, DealAction::GuarantorConfirm),
        ];
        let mut current = deal;
        for (actor, action) in steps {
            let applied = service.apply(current.id, actor, action).await;
            let Ok(applied) = applied else {
                panic!("setup step failed");
            };
            current = applied;
        }
        current
    }

    #[tokio::test]
    async fn create_rejects_same_party_deal() {
        let (service, _) = make_service();
        let mut req = request();
        req.seller = BUYER;
        let result = service.create_deal(req).await;
        assert!(matches!(result, Err(EscrowError::Validation(_))));
    }

    #[tokio::test]
    async fn create_rejects_bad_terms() {
        let (service, _) = make_service();

        let mut req = request();
        req.amount = Decimal::ZERO;
        assert!(matches!(
            service.create_deal(req).await,
            Err(EscrowError::Validation(_))
        ));

        let mut req = request();
        req.description = "   ".to_string();
        assert!(matches!(
            service.create_deal(req).await,
            Err(EscrowError::Validation(_))
        ));

        let mut req = request();
        req.currency = String::new();
        assert!(matches!(
            service.create_deal(req).await,
            Err(EscrowError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn create_sets_expiry_horizon_and_notifies_seller() {
        let (service, _) = make_service();
        let mut rx = service.notifications().subscribe();

        let deal = created_deal(&service).await;
        assert_eq!(deal.status, DealStatus::Created);
        assert_eq!(deal.expires_at - deal.created_at, chrono::Duration::hours(48));

        let notification = rx.recv().await;
        let Ok(notification) = notification else {
            panic!("expected seller notification");
        };
        assert_eq!(notification.recipient, SELLER);
    }

    #[tokio::test]
    async fn happy_path_runs_to_completed() {
        // Scenario: create → accept → mark paid → confirm → both done.
        let (service, _) = make_service();
        let deal = created_deal(&service).await;
        assert_eq!(deal.status, DealStatus::Created);

        let deal = service.apply(deal.id, SELLER, DealAction::Accept).await;
        let Ok(deal) = deal else {
            panic!("accept failed");
        };
        assert_eq!(deal.status, DealStatus::Accepted);

        let deal = service.apply(deal.id, BUYER, DealAction::BuyerMarkPaid).await;
        let Ok(deal) = deal else {
            panic!("mark paid failed");
        };
        assert_eq!(deal.status, DealStatus::Accepted);
        assert!(deal.buyer_paid);

        let deal = service
            .apply(deal.id, GUARANTOR, DealAction::GuarantorConfirm)
            .await;
        let Ok(deal) = deal else {
            panic!("guarantor confirm failed");
        };
        assert_eq!(deal.status, DealStatus::PaymentConfirmed);
        assert!(deal.guarantor_confirmed);

        let deal = service
            .apply(deal.id, SELLER, DealAction::SellerConfirmShipped)
            .await;
        let Ok(deal) = deal else {
            panic!("seller confirm failed");
        };
        assert_eq!(deal.status, DealStatus::PaymentConfirmed);
        assert!(deal.seller_done);

        let deal = service
            .apply(deal.id, BUYER, DealAction::BuyerConfirmReceipt)
            .await;
        let Ok(deal) = deal else {
            panic!("buyer confirm failed");
        };
        assert_eq!(deal.status, DealStatus::Completed);
        assert!(deal.buyer_done);
        assert!(deal.completed_at.is_some());
    }

    #[tokio::test]
    async fn rejected_deal_is_terminal() {
        // Scenario: reject, then a late accept must fail.
        let (service, _) = make_service();
        let deal = created_deal(&service).await;

        let rejected = service.apply(deal.id, SELLER, DealAction::Reject).await;
        let Ok(rejected) = rejected else {
            panic!("reject failed");
        };
        assert_eq!(rejected.status, DealStatus::Cancelled);
        assert!(rejected.completed_at.is_some());

        let late = service.apply(deal.id, SELLER, DealAction::Accept).await;
        assert!(matches!(late, Err(EscrowError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn cancel_notifies_the_other_party() {
        let (service, _) = make_service();
        let deal = created_deal(&service).await;
        let accepted = service.apply(deal.id, SELLER, DealAction::Accept).await;
        assert!(accepted.is_ok());

        let mut rx = service.notifications().subscribe();
        let cancelled = service.apply(deal.id, BUYER, DealAction::Cancel).await;
        let Ok(cancelled) = cancelled else {
            panic!("cancel failed");
        };
        assert_eq!(cancelled.status, DealStatus::Cancelled);

        let notification = rx.recv().await;
        let Ok(notification) = notification else {
            panic!("expected notification");
        };
        assert_eq!(notification.recipient, SELLER);
    }

    #[tokio::test]
    async fn cancel_after_payment_confirmed_is_rejected() {
        let (service, _) = make_service();
        let deal = confirmed_deal(&service).await;
        let result = service.apply(deal.id, BUYER, DealAction::Cancel).await;
        assert!(matches!(result, Err(EscrowError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn wrong_role_is_permission_denied() {
        let (service, _) = make_service();
        let deal = created_deal(&service).await;

        // Buyer cannot accept their own deal.
        let result = service.apply(deal.id, BUYER, DealAction::Accept).await;
        assert!(matches!(result, Err(EscrowError::PermissionDenied(_))));

        // A stranger resolves to viewer and can transition nothing.
        let result = service.apply(deal.id, STRANGER, DealAction::Cancel).await;
        assert!(matches!(result, Err(EscrowError::PermissionDenied(_))));

        // The guard failure left the record untouched.
        let loaded = service.get_deal(deal.id).await;
        let Ok(loaded) = loaded else {
            panic!("load failed");
        };
        assert_eq!(loaded.status, DealStatus::Created);
    }

    #[tokio::test]
    async fn guarantor_confirm_requires_buyer_paid() {
        let (service, _) = make_service();
        let deal = created_deal(&service).await;
        let accepted = service.apply(deal.id, SELLER, DealAction::Accept).await;
        assert!(accepted.is_ok());

        let result = service
            .apply(deal.id, GUARANTOR, DealAction::GuarantorConfirm)
            .await;
        assert!(matches!(result, Err(EscrowError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn guarantor_reject_clears_the_paid_flag() {
        let (service, _) = make_service();
        let deal = created_deal(&service).await;
        for (actor, action) in [(SELLER, DealAction::Accept), (BUYER, DealAction::BuyerMarkPaid)] {
            let step = service.apply(deal.id, actor, action).await;
            assert!(step.is_ok());
        }

        let mut rx = service.notifications().subscribe();
        let rejected = service
            .apply(deal.id, GUARANTOR, DealAction::GuarantorRejectPayment)
            .await;
        let Ok(rejected) = rejected else {
            panic!("reject payment failed");
        };
        assert_eq!(rejected.status, DealStatus::Accepted);
        assert!(!rejected.buyer_paid);

        let notification = rx.recv().await;
        let Ok(notification) = notification else {
            panic!("expected buyer notification");
        };
        assert_eq!(notification.recipient, BUYER);

        // The buyer can mark paid again after the rejection.
        let retried = service.apply(deal.id, BUYER, DealAction::BuyerMarkPaid).await;
        assert!(retried.is_ok());
    }

    #[tokio::test]
    async fn repeated_receipt_confirmation_is_rejected() {
        let (service, _) = make_service();
        let deal = confirmed_deal(&service).await;

        let first = service
            .apply(deal.id, BUYER, DealAction::BuyerConfirmReceipt)
            .await;
        assert!(first.is_ok());

        let second = service
            .apply(deal.id, BUYER, DealAction::BuyerConfirmReceipt)
            .await;
        assert!(matches!(second, Err(EscrowError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn dispute_freezes_the_deal() {
        let (service, _) = make_service();
        let deal = confirmed_deal(&service).await;

        let disputed = service.apply(deal.id, GUARANTOR, DealAction::OpenDispute).await;
        let Ok(disputed) = disputed else {
            panic!("dispute failed");
        };
        assert_eq!(disputed.status, DealStatus::Disputed);
        assert!(disputed.completed_at.is_some());

        let late = service
            .apply(deal.id, BUYER, DealAction::BuyerConfirmReceipt)
            .await;
        assert!(matches!(late, Err(EscrowError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn payout_without_details_degrades_to_a_request() {
        // Scenario: create_payout with no payment details on file.
        let (service, _) = make_service();
        let deal = confirmed_deal(&service).await;
        for (actor, action) in [
            (SELLER, DealAction::SellerConfirmShipped),
            (BUYER, DealAction::BuyerConfirmReceipt),
        ] {
            let step = service.apply(deal.id, actor, action).await;
            assert!(step.is_ok());
        }

        let mut rx = service.notifications().subscribe();
        let result = service.apply(deal.id, GUARANTOR, DealAction::CreatePayout).await;
        assert!(matches!(result, Err(EscrowError::DependencyMissing(_))));

        // No payout request was created, but the seller was asked to
        // register details.
        let pending = service.payments().pending_for(deal.id).await;
        assert!(matches!(pending, Ok(None)));
        let notification = rx.recv().await;
        let Ok(notification) = notification else {
            panic!("expected seller notification");
        };
        assert_eq!(notification.recipient, SELLER);
        assert!(notification.text.contains("payment details"));
    }

    #[tokio::test]
    async fn payout_before_both_confirmations_is_rejected() {
        let (service, directory) = make_service();
        directory.register(SELLER, "card 1234").await;
        let deal = confirmed_deal(&service).await;

        let result = service.apply(deal.id, GUARANTOR, DealAction::CreatePayout).await;
        assert!(matches!(result, Err(EscrowError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn full_payout_cycle_disburses_and_records_refs() {
        let (service, directory) = make_service();
        directory.register(SELLER, "card 1234 5678").await;
        let deal = confirmed_deal(&service).await;
        for (actor, action) in [
            (SELLER, DealAction::SellerConfirmShipped),
            (BUYER, DealAction::BuyerConfirmReceipt),
        ] {
            let step = service.apply(deal.id, actor, action).await;
            assert!(step.is_ok());
        }

        let requested = service.apply(deal.id, GUARANTOR, DealAction::CreatePayout).await;
        let Ok(requested) = requested else {
            panic!("create payout failed");
        };
        // The deal record itself is unchanged by the request.
        assert!(!requested.guarantor_paid);
        let pending = service.payments().pending_for(deal.id).await;
        let Ok(Some(pending)) = pending else {
            panic!("expected a pending payout request");
        };
        assert_eq!(pending.payment_details, "card 1234 5678");

        let mut rx = service.notifications().subscribe();
        let paid = service
            .apply(
                deal.id,
                GUARANTOR,
                DealAction::ConfirmPayout {
                    txn_ref: "txn-42".to_string(),
                    proof_ref: Some("proof-42".to_string()),
                },
            )
            .await;
        let Ok(paid) = paid else {
            panic!("confirm payout failed");
        };
        assert_eq!(paid.status, DealStatus::Completed);
        assert!(paid.guarantor_paid);
        assert_eq!(paid.payout_txn_ref.as_deref(), Some("txn-42"));
        assert_eq!(paid.payout_proof_ref.as_deref(), Some("proof-42"));

        // The request was settled and the seller was told.
        let still_pending = service.payments().pending_for(deal.id).await;
        assert!(matches!(still_pending, Ok(None)));
        let notification = rx.recv().await;
        let Ok(notification) = notification else {
            panic!("expected seller notification");
        };
        assert_eq!(notification.recipient, SELLER);

        // A second disbursement attempt is rejected.
        let again = service.apply(deal.id, GUARANTOR, DealAction::CreatePayout).await;
        assert!(matches!(again, Err(EscrowError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn confirm_payout_without_open_request_is_rejected() {
        let (service, _) = make_service();
        let deal = confirmed_deal(&service).await;

        let result = service
            .apply(
                deal.id,
                GUARANTOR,
                DealAction::ConfirmPayout {
                    txn_ref: "txn-1".to_string(),
                    proof_ref: None,
                },
            )
            .await;
        assert!(matches!(result, Err(EscrowError::InvalidTransition(_))));
    }

    #[test]
    fn transition_guard_pins_every_flag_of_the_snapshot() {
        // The committed update copies all flags from the loaded record, so
        // the guard must pin all of them — a partial guard would let a
        // stale write erase a concurrent writer's flag.
        let mut deal = NewDeal {
            token: uuid::Uuid::new_v4(),
            buyer: BUYER,
            seller: SELLER,
            amount: Decimal::new(1000, 0),
            currency: "RUB".to_string(),
            description: "item".to_string(),
            created_at: Utc::now(),
            expires_at: Utc::now(),
        }
        .into_deal(DealId::new(1));
        deal.status = DealStatus::PaymentConfirmed;
        deal.buyer_paid = true;
        deal.guarantor_confirmed = true;
        deal.seller_done = true;

        let plan = plan_transition(&deal, Role::Buyer, &DealAction::BuyerConfirmReceipt, GUARANTOR);
        let Ok(plan) = plan else {
            panic!("planning failed");
        };
        assert_eq!(plan.guard, DealGuard::snapshot(&deal));
        assert_eq!(plan.guard.seller_done, Some(true));
        assert_eq!(plan.guard.buyer_paid, Some(true));
    }

    #[tokio::test]
    async fn concurrent_confirmations_are_never_silently_merged() {
        // Buyer and seller confirm near-simultaneously. Whatever the
        // interleaving, an action that returned Ok must keep its flag in
        // the stored record; a loser surfaces a conflict.
        let (service, _) = make_service();
        let deal = confirmed_deal(&service).await;

        let ship = service.apply(deal.id, SELLER, DealAction::SellerConfirmShipped);
        let receive = service.apply(deal.id, BUYER, DealAction::BuyerConfirmReceipt);
        let (a, b) = tokio::join!(ship, receive);

        let stored = service.get_deal(deal.id).await;
        let Ok(stored) = stored else {
            panic!("load failed");
        };
        if a.is_ok() {
            assert!(stored.seller_done);
        }
        if b.is_ok() {
            assert!(stored.buyer_done);
        }
        if a.is_ok() && b.is_ok() {
            assert_eq!(stored.status, DealStatus::Completed);
        }
        for result in [&a, &b] {
            if let Err(e) = result {
                assert!(matches!(e, EscrowError::ConcurrentModification(_)));
            }
        }
    }

    #[tokio::test]
    async fn concurrent_guarantor_actions_have_one_winner() {
        // Two near-simultaneous guarantor actions on the same deal: at most
        // one commits; the other surfaces a conflict, never a silent merge.
        let (service, _) = make_service();
        let deal = created_deal(&service).await;
        for (actor, action) in [(SELLER, DealAction::Accept), (BUYER, DealAction::BuyerMarkPaid)] {
            let step = service.apply(deal.id, actor, action).await;
            assert!(step.is_ok());
        }

        let confirm = service.apply(deal.id, GUARANTOR, DealAction::GuarantorConfirm);
        let reject = service.apply(deal.id, GUARANTOR, DealAction::GuarantorRejectPayment);
        let (a, b) = tokio::join!(confirm, reject);

        let successes = usize::from(a.is_ok()) + usize::from(b.is_ok());
        assert_eq!(successes, 1);
        let loser = if a.is_ok() { b } else { a };
        assert!(matches!(
            loser,
            Err(EscrowError::ConcurrentModification(_) | EscrowError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn failed_action_emits_no_side_effects() {
        let (service, _) = make_service();
        let deal = created_deal(&service).await;
        let before = service.list_messages(deal.id, 0, 100).await;
        let Ok(before) = before else {
            panic!("read failed");
        };

        let mut rx = service.notifications().subscribe();
        let denied = service.apply(deal.id, STRANGER, DealAction::Accept).await;
        assert!(denied.is_err());

        let after = service.list_messages(deal.id, 0, 100).await;
        let Ok(after) = after else {
            panic!("read failed");
        };
        assert_eq!(before.len(), after.len());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn transitions_append_system_messages() {
        let (service, _) = make_service();
        let deal = created_deal(&service).await;
        let accepted = service.apply(deal.id, SELLER, DealAction::Accept).await;
        assert!(accepted.is_ok());

        let thread = service.list_messages(deal.id, 0, 100).await;
        let Ok(thread) = thread else {
            panic!("read failed");
        };
        assert!(thread.iter().all(|m| m.is_system && m.author.is_system()));
        assert!(thread.iter().any(|m| m.text.contains("accepted")));
    }

    #[tokio::test]
    async fn token_lookup_and_user_listing() {
        let (service, _) = make_service();
        let deal = created_deal(&service).await;

        let by_token = service.get_deal_by_token(deal.token).await;
        let Ok(by_token) = by_token else {
            panic!("token lookup failed");
        };
        assert_eq!(by_token.id, deal.id);

        for user in [BUYER, SELLER] {
            let deals = service.list_deals_for_user(user, 10).await;
            let Ok(deals) = deals else {
                panic!("list failed");
            };
            assert_eq!(deals.len(), 1);
        }
        let none = service.list_deals_for_user(STRANGER, 10).await;
        assert!(matches!(none.as_deref(), Ok([])));
    }
}

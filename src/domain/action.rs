//! Actions a participant can request against a deal.

use serde::{Deserialize, Serialize};

/// A requested state transition, as handed to `DealService::apply`.
///
/// The conversation layer is responsible for producing a well-formed action
/// from chat input; the engine only validates it against the deal's current
/// role assignments, status, and flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DealAction {
    /// Seller accepts a freshly created deal.
    Accept,
    /// Seller rejects a freshly created deal.
    Reject,
    /// Either party backs out before payment is confirmed.
    Cancel,
    /// Buyer claims funds were sent to the guarantor.
    BuyerMarkPaid,
    /// Guarantor confirms the buyer's funds arrived in escrow.
    GuarantorConfirm,
    /// Guarantor rejects the buyer's payment claim, clearing the flag.
    GuarantorRejectPayment,
    /// Buyer confirms receipt of the goods.
    BuyerConfirmReceipt,
    /// Seller confirms shipment/delivery.
    SellerConfirmShipped,
    /// Guarantor escalates an unreconcilable deal.
    OpenDispute,
    /// Guarantor initiates the payout to the seller.
    CreatePayout,
    /// Guarantor records the executed payout transaction.
    ConfirmPayout {
        /// Transaction reference of the disbursement.
        txn_ref: String,
        /// Optional proof-of-payment attachment reference.
        proof_ref: Option<String>,
    },
}

impl DealAction {
    /// Stable name used in logs and error messages.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::Cancel => "cancel",
            Self::BuyerMarkPaid => "buyer_mark_paid",
            Self::GuarantorConfirm => "guarantor_confirm",
            Self::GuarantorRejectPayment => "guarantor_reject_payment",
            Self::BuyerConfirmReceipt => "buyer_confirm_receipt",
            Self::SellerConfirmShipped => "seller_confirm_shipped",
            Self::OpenDispute => "open_dispute",
            Self::CreatePayout => "create_payout",
            Self::ConfirmPayout { .. } => "confirm_payout",
        }
    }
}

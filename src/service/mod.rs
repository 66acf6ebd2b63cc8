//! Service layer: the deal state machine and its supporting coordinators.
//!
//! [`DealService`] is the only entry point for mutating deals. It owns the
//! [`PaymentRequestManager`] for the payout cycle and the [`DealMessageLog`]
//! for the per-deal audit thread.

pub mod deal_service;
pub mod message_log;
pub mod payment;

pub use deal_service::DealService;
pub use message_log::DealMessageLog;
pub use payment::PaymentRequestManager;

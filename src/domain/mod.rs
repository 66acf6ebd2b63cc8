//! Domain layer: deal aggregate, actions, roles, and the notification bus.
//!
//! This module contains the pure domain model: identifiers, the deal record
//! with its lifecycle status and progress flags, requested actions, role
//! resolution, payout requests, message-thread entries, and the outbound
//! notification channel.

pub mod action;
pub mod deal;
pub mod ids;
pub mod message;
pub mod notification;
pub mod payment_request;
pub mod role;

pub use action::DealAction;
pub use deal::{CreateDealRequest, Deal, DealGuard, DealStatus, NewDeal};
pub use ids::{DealId, UserId};
pub use message::{DealMessage, NewDealMessage, SYSTEM_AUTHOR_LABEL};
pub use notification::{Notification, NotificationBus};
pub use payment_request::{NewPaymentRequest, PaymentRequest, PaymentRequestStatus};
pub use role::{Role, resolve};

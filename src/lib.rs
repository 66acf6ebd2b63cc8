//! # escrow-engine
//!
//! Deal state machine and persistence core for a guarantor-mediated escrow
//! service.
//!
//! A buyer and a seller transact under the supervision of a single trusted
//! guarantor who confirms receipt of funds and later disburses payment to
//! the seller. This crate owns the deal lifecycle — validation, guarded
//! state transitions, compare-and-set persistence, the per-deal message
//! thread, and payout requests. It renders no UI and speaks no chat
//! protocol: the surrounding bot layer resolves users, calls into
//! [`service::DealService`], and subscribes to the outbound
//! [`domain::NotificationBus`].
//!
//! ## Architecture
//!
//! ```text
//! Bot / conversation layer (external)
//!     │
//!     ├── DealService (service/)          — the state machine
//!     │     ├── PaymentRequestManager
//!     │     └── DealMessageLog
//!     │
//!     ├── NotificationBus (domain/)       — fire-and-forget outbound text
//!     │
//!     └── DealStore (persistence/)
//!           ├── MemoryStore
//!           └── PostgresStore
//! ```

pub mod config;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod service;

//! Role resolution: who is the caller with respect to a given deal.

use serde::{Deserialize, Serialize};

use super::{Deal, UserId};

/// The caller's relationship to a deal.
///
/// Resolved deterministically from the deal's stored parties plus the
/// single configured guarantor identity. `Viewer` is permitted read-only
/// access and never a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The deal's buyer.
    Buyer,
    /// The deal's seller.
    Seller,
    /// The configured guarantor identity.
    Guarantor,
    /// Anyone else; read-only.
    Viewer,
}

impl Role {
    /// Stable name used in logs and error messages.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Buyer => "buyer",
            Self::Seller => "seller",
            Self::Guarantor => "guarantor",
            Self::Viewer => "viewer",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a caller identity to its [`Role`] for the given deal.
///
/// The guarantor check wins over party checks so that a misconfigured
/// guarantor id colliding with a party id fails loudly in permission
/// checks rather than silently acting as a party.
#[must_use]
pub fn resolve(actor: UserId, deal: &Deal, guarantor: UserId) -> Role {
    if actor == guarantor {
        Role::Guarantor
    } else if actor == deal.buyer {
        Role::Buyer
    } else if actor == deal.seller {
        Role::Seller
    } else {
        Role::Viewer
    }
}

//! Type-safe deal and user identifiers.
//!
//! Both are newtype wrappers around `i64` so that deal row ids cannot be
//! confused with user identities (or with each other). Row ids are assigned
//! by the store; user ids are the opaque integer identities handed in by
//! the chat platform.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a [`super::Deal`].
///
/// Assigned by the store at insert time and immutable thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DealId(i64);

impl DealId {
    /// Wraps a raw row id.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the inner row id.
    #[must_use]
    pub const fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for DealId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque user identity as assigned by the chat platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(i64);

impl UserId {
    /// Sentinel author for system-generated messages. Never a real user.
    pub const SYSTEM: Self = Self(0);

    /// Wraps a raw user id.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the inner user id.
    #[must_use]
    pub const fn get(&self) -> i64 {
        self.0
    }

    /// Returns `true` for the system sentinel.
    #[must_use]
    pub const fn is_system(&self) -> bool {
        self.0 == Self::SYSTEM.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

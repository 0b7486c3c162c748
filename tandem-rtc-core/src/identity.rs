//! Participant identity
//!
//! Participant identity is owned by the membership feed; the orchestrator only
//! needs a stable, totally ordered key. Ordering matters: both glare
//! resolution and room offer initiation compare ids lexicographically.

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};

/// Stable participant/connection identifier
///
/// Comparison is plain byte-wise string ordering, so two participants that
/// agree on the pair of ids always agree on which one sorts first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Create a new participant id
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert the identity to its wire representation
    pub fn to_string_repr(&self) -> String {
        self.0.clone()
    }

    /// Parse an identity from its wire representation
    ///
    /// # Errors
    ///
    /// Returns error if the string is empty or contains whitespace
    pub fn from_string_repr(s: &str) -> anyhow::Result<Self> {
        if s.is_empty() {
            anyhow::bail!("participant id cannot be empty");
        }
        if s.chars().any(char::is_whitespace) {
            anyhow::bail!("participant id cannot contain whitespace: {s:?}");
        }
        Ok(Self(s.to_string()))
    }

    /// Whether this side wins the initiator role against `other`
    ///
    /// The lexicographically smaller id initiates.
    #[must_use]
    pub fn initiates_against(&self, other: &ParticipantId) -> bool {
        self < other
    }
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

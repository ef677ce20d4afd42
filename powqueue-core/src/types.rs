// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Newtype wrappers for validated inputs.
//!
//! All types validate their invariants at creation time.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::HardValidationError;

/// Longest accepted queue name. `shm_open` names live under NAME_MAX (255)
/// including the leading slash.
const MAX_NAME_LEN: usize = 200;

/// Validated shared-memory queue name.
/// Alphanumeric with hyphens/underscores; the leading `/` is added internally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    pub const DEFAULT: &'static str = "powqueue";

    /// Create a new QueueName with validation.
    pub fn new(name: impl Into<String>) -> Result<Self, HardValidationError> {
        let name = name.into();

        if name.is_empty() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "queue.name",
                value: name,
                reason: "Queue name cannot be empty".to_string(),
            });
        }

        if name.len() > MAX_NAME_LEN {
            return Err(HardValidationError::InvalidFieldValue {
                field: "queue.name",
                value: name.clone(),
                reason: format!("Queue name too long: {} chars (max {})", name.len(), MAX_NAME_LEN),
            });
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(HardValidationError::InvalidFieldValue {
                field: "queue.name",
                value: name,
                reason: "Queue name must contain only ASCII alphanumerics, hyphens, and underscores"
                    .to_string(),
            });
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for QueueName {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for QueueName {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QueueName> for String {
    fn from(name: QueueName) -> Self {
        name.0
    }
}

/// Validated ring capacity (slot count of both rings).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct Capacity(usize);

impl Capacity {
    pub const MIN: usize = 1;
    pub const MAX: usize = 1024;
    /// Kept small on purpose: it bounds in-flight requests.
    pub const DEFAULT: usize = 16;

    /// Create a new Capacity with validation.
    pub fn new(slots: usize) -> Result<Self, HardValidationError> {
        if !(Self::MIN..=Self::MAX).contains(&slots) {
            return Err(HardValidationError::CapacityOutOfBounds {
                capacity: slots,
                min: Self::MIN,
                max: Self::MAX,
            });
        }
        Ok(Self(slots))
    }

    pub fn get(&self) -> usize {
        self.0
    }
}

impl Default for Capacity {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<usize> for Capacity {
    type Error = HardValidationError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Capacity> for usize {
    fn from(capacity: Capacity) -> Self {
        capacity.0
    }
}

/// What a producer does when every slot is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Fail the submission with `CapacityExceeded`.
    #[default]
    Reject,
    /// Wait for a slot to be retired, up to the client timeout.
    Block,
}

impl OverflowPolicy {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Reject => "reject",
            Self::Block => "block",
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for OverflowPolicy {
    type Err = HardValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reject" => Ok(Self::Reject),
            "block" => Ok(Self::Block),
            other => Err(HardValidationError::InvalidFieldValue {
                field: "queue.overflow",
                value: other.to_string(),
                reason: "expected 'reject' or 'block'".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_name_validation() {
        assert!(QueueName::new("powqueue").is_ok());
        assert!(QueueName::new("pow_queue-2").is_ok());
        assert!(QueueName::new("").is_err());
        assert!(QueueName::new("has/slash").is_err());
        assert!(QueueName::new("a".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_capacity_bounds() {
        assert!(Capacity::new(0).is_err());
        assert!(Capacity::new(Capacity::MAX + 1).is_err());
        assert_eq!(Capacity::new(4).unwrap().get(), 4);
        assert_eq!(Capacity::default().get(), Capacity::DEFAULT);
    }

    #[test]
    fn test_overflow_policy_parse() {
        assert_eq!("reject".parse::<OverflowPolicy>().unwrap(), OverflowPolicy::Reject);
        assert_eq!("block".parse::<OverflowPolicy>().unwrap(), OverflowPolicy::Block);
        assert!("drop-oldest".parse::<OverflowPolicy>().is_err());
    }
}

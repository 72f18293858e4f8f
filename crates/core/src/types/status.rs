//! Status enums for checkouts, orders and payment transactions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Progress of a single checkout run.
///
/// Stages only move forward, one step at a time:
///
/// ```text
/// Started -> Created -> Paid -> Confirmed -> Fulfilled
/// ```
///
/// - `Started`: record persisted, no order exists yet
/// - `Created`: order exists on the commerce platform, unpaid
/// - `Paid`: payment accepted (and confirmed with the processor when required)
/// - `Confirmed`: the commerce platform has confirmed the transaction
/// - `Fulfilled`: consumed cart cleared and a fresh cart issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStage {
    #[default]
    Started,
    Created,
    Paid,
    Confirmed,
    Fulfilled,
}

/// A stage transition that skips or rewinds the sequence.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid checkout transition from {from} to {to}")]
pub struct StageTransitionError {
    pub from: CheckoutStage,
    pub to: CheckoutStage,
}

impl CheckoutStage {
    /// All stages in order.
    pub const ALL: [Self; 5] = [
        Self::Started,
        Self::Created,
        Self::Paid,
        Self::Confirmed,
        Self::Fulfilled,
    ];

    /// The stage that follows this one, if any.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Started => Some(Self::Created),
            Self::Created => Some(Self::Paid),
            Self::Paid => Some(Self::Confirmed),
            Self::Confirmed => Some(Self::Fulfilled),
            Self::Fulfilled => None,
        }
    }

    /// Whether the run has nothing left to do.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Fulfilled)
    }

    /// Whether an order has been created for this run.
    #[must_use]
    pub const fn has_order(self) -> bool {
        !matches!(self, Self::Started)
    }

    /// Validate a move to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`StageTransitionError`] unless `to` is exactly the next stage.
    pub fn advance_to(self, to: Self) -> Result<Self, StageTransitionError> {
        if self.next() == Some(to) {
            Ok(to)
        } else {
            Err(StageTransitionError { from: self, to })
        }
    }

    /// Storage name of the stage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Created => "created",
            Self::Paid => "paid",
            Self::Confirmed => "confirmed",
            Self::Fulfilled => "fulfilled",
        }
    }
}

impl fmt::Display for CheckoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckoutStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("invalid checkout stage: {s}"))
    }
}

/// Payment status of an order on the commerce platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderPaymentStatus {
    #[default]
    Unpaid,
    Authorized,
    PartiallyAuthorized,
    Paid,
    PartiallyPaid,
    Refunded,
    #[serde(other)]
    Unknown,
}

/// Status of a payment transaction against an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    #[default]
    Pending,
    Complete,
    Failed,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl TransactionStatus {
    /// Whether the gateway rejected the payment outright.
    #[must_use]
    pub const fn is_declined(self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_sequence() {
        let mut stage = CheckoutStage::Started;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            stage = stage.advance_to(next).unwrap();
            seen.push(stage);
        }
        assert_eq!(seen, CheckoutStage::ALL.to_vec());
        assert!(stage.is_terminal());
    }

    #[test]
    fn test_stage_cannot_skip_or_rewind() {
        assert!(CheckoutStage::Started.advance_to(CheckoutStage::Paid).is_err());
        assert!(CheckoutStage::Paid.advance_to(CheckoutStage::Created).is_err());
        assert!(CheckoutStage::Fulfilled.advance_to(CheckoutStage::Fulfilled).is_err());
    }

    #[test]
    fn test_stage_string_roundtrip() {
        for stage in CheckoutStage::ALL {
            assert_eq!(stage.as_str().parse::<CheckoutStage>().unwrap(), stage);
        }
        assert!("shipped".parse::<CheckoutStage>().is_err());
    }

    #[test]
    fn test_unknown_statuses_deserialize() {
        let status: TransactionStatus = serde_json::from_str("\"requires_review\"").unwrap();
        assert_eq!(status, TransactionStatus::Unknown);

        let payment: OrderPaymentStatus = serde_json::from_str("\"paid\"").unwrap();
        assert_eq!(payment, OrderPaymentStatus::Paid);
    }

    #[test]
    fn test_declined_statuses() {
        assert!(TransactionStatus::Failed.is_declined());
        assert!(!TransactionStatus::Complete.is_declined());
    }
}

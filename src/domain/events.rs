//! Domain Events
//!
//! Event definitions for the account ledger. Events are immutable facts;
//! the closed set below is the only thing the log ever stores. A transfer
//! is not an event type of its own: it is a withdrawal on the source and a
//! deposit on the destination, committed in one atomic batch.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Aggregate type tag carried by every envelope.
pub const ACCOUNT_AGGREGATE: &str = "account";

/// Kind of ledger account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Checking,
    Savings,
}

impl std::fmt::Display for AccountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountType::Checking => write!(f, "checking"),
            AccountType::Savings => write!(f, "savings"),
        }
    }
}

impl std::str::FromStr for AccountType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "checking" => Ok(AccountType::Checking),
            "savings" => Ok(AccountType::Savings),
            other => Err(format!("unknown account type '{other}'")),
        }
    }
}

/// Account events
///
/// Adjacent tagging puts the variant name under `event_type` and the fields
/// under `payload`, which is exactly the wire layout of a stored event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload")]
pub enum AccountEvent {
    /// Account was opened with an initial (possibly zero) balance
    AccountOpened {
        holder: String,
        account_type: AccountType,
        opening_balance: Decimal,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        created_at: DateTime<Utc>,
    },

    /// Funds were deposited (balance increased)
    FundsDeposited { amount: Decimal },

    /// Funds were withdrawn (balance decreased)
    FundsWithdrawn { amount: Decimal },

    /// Account was closed; no further operations succeed
    AccountClosed,
}

impl AccountEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            AccountEvent::AccountOpened { .. } => "AccountOpened",
            AccountEvent::FundsDeposited { .. } => "FundsDeposited",
            AccountEvent::FundsWithdrawn { .. } => "FundsWithdrawn",
            AccountEvent::AccountClosed => "AccountClosed",
        }
    }

    /// The amount this event moves, if any
    pub fn amount(&self) -> Option<Decimal> {
        match self {
            AccountEvent::AccountOpened {
                opening_balance, ..
            } => Some(*opening_balance),
            AccountEvent::FundsDeposited { amount } => Some(*amount),
            AccountEvent::FundsWithdrawn { amount } => Some(*amount),
            AccountEvent::AccountClosed => None,
        }
    }
}

/// The stored form of an event: identity, stream position and payload.
///
/// Field declaration order is the canonical wire order; `event` flattens to
/// the trailing `event_type` and `payload` keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    pub version: i64,
    #[serde(flatten)]
    pub event: AccountEvent,
}

impl EventEnvelope {
    /// Wrap an account event at the given stream position with a fresh id.
    pub fn for_account(aggregate_id: Uuid, version: i64, event: AccountEvent) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: now_millis(),
            aggregate_id,
            aggregate_type: ACCOUNT_AGGREGATE.to_string(),
            version,
            event,
        }
    }

    /// Get the event type tag without serializing.
    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }
}

/// Current instant truncated to millisecond precision, the resolution the
/// wire format carries. Constructing at this precision keeps encode/decode
/// round trips exact.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::<Utc>::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

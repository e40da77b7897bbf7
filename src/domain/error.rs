//! Domain Error Types
//!
//! Business-rule violations, independent of storage and transport. Each
//! variant carries the offending rule's values so callers see exactly what
//! was rejected. Domain errors are never retried.

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Command validation failures
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DomainError {
    /// Withdrawal or transfer exceeds the available balance
    #[error("Insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: Decimal, requested: Decimal },

    /// The account has been closed; only observation is allowed
    #[error("Account {account_id} is closed")]
    AccountClosed { account_id: Uuid },

    /// No events exist for the referenced account
    #[error("Account not found: {account_id}")]
    AccountNotFound { account_id: Uuid },

    /// An open command targeted an aggregate that already has history
    #[error("Account already exists: {account_id}")]
    AccountAlreadyExists { account_id: Uuid },

    /// Deposits and withdrawals must move a strictly positive amount
    #[error("Amount must be positive (got {amount})")]
    NonPositiveAmount { amount: Decimal },

    /// Opening balance may be zero but never negative
    #[error("Opening balance may not be negative (got {amount})")]
    NegativeOpeningBalance { amount: Decimal },

    /// Amount failed representational validation (scale, bound)
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Crediting would push the balance past the representable maximum
    #[error("Depositing {amount} would overflow the balance {balance}")]
    BalanceOverflow { balance: Decimal, amount: Decimal },

    /// Closing requires the balance to be exactly zero
    #[error("Account {account_id} still holds {balance}; close requires a zero balance")]
    BalanceNotZero { account_id: Uuid, balance: Decimal },

    /// A transfer must reference two distinct accounts
    #[error("Cannot transfer from account {account_id} to itself")]
    SameAccountTransfer { account_id: Uuid },
}

impl DomainError {
    /// Create an insufficient funds error
    pub fn insufficient_funds(balance: Decimal, requested: Decimal) -> Self {
        Self::InsufficientFunds { balance, requested }
    }

    /// True when retrying the same command against fresher state could
    /// still succeed. Domain rejections are final by definition, but a
    /// not-found can race with a concurrent open, which is why the command
    /// service re-reads before re-validating.
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::AccountNotFound { .. })
    }
}

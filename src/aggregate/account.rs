//! Account Aggregate
//!
//! The consistency boundary of the ledger. State is derived from events,
//! never directly mutated; decision methods validate a command against
//! current state and return the event to persist.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    now_millis, AccountEvent, AccountType, Amount, Balance, DomainError, ACCOUNT_AGGREGATE,
};

use super::Aggregate;

/// Account lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Closed,
}

impl Default for AccountStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountStatus::Active => write!(f, "active"),
            AccountStatus::Closed => write!(f, "closed"),
        }
    }
}

/// Ledger account state, reconstituted on demand from the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    id: Uuid,
    holder: String,
    account_type: AccountType,
    balance: Balance,
    status: AccountStatus,
    version: i64,
    created_at: Option<DateTime<Utc>>,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            id: Uuid::nil(),
            holder: String::new(),
            account_type: AccountType::Checking,
            balance: Balance::zero(),
            status: AccountStatus::Active,
            version: 0,
            created_at: None,
        }
    }
}

impl Account {
    /// Decide an open: validates the opening balance and produces the
    /// creation event. Existence is the command service's check; this
    /// method only knows the rules of a fresh account.
    pub fn open(
        holder: impl Into<String>,
        account_type: AccountType,
        opening_balance: Decimal,
    ) -> Result<AccountEvent, DomainError> {
        use crate::domain::AmountError;

        let opening = Balance::new(opening_balance).map_err(|e| match e {
            AmountError::NegativeBalance(value) => {
                DomainError::NegativeOpeningBalance { amount: value }
            }
            other => DomainError::InvalidAmount(other.to_string()),
        })?;

        Ok(AccountEvent::AccountOpened {
            holder: holder.into(),
            account_type,
            opening_balance: opening.value(),
            created_at: now_millis(),
        })
    }

    /// Decide a deposit into this account.
    pub fn deposit(&self, amount: Decimal) -> Result<AccountEvent, DomainError> {
        self.ensure_active()?;
        let amount = validated_amount(amount)?;

        // The credited balance must stay representable; rejecting here
        // keeps every committed event replayable.
        self.balance
            .credit(&amount)
            .map_err(|_| DomainError::BalanceOverflow {
                balance: self.balance.value(),
                amount: amount.value(),
            })?;

        Ok(AccountEvent::FundsDeposited {
            amount: amount.value(),
        })
    }

    /// Decide a withdrawal from this account.
    pub fn withdraw(&self, amount: Decimal) -> Result<AccountEvent, DomainError> {
        self.ensure_active()?;
        let amount = validated_amount(amount)?;

        if !self.balance.is_sufficient_for(&amount) {
            return Err(DomainError::InsufficientFunds {
                balance: self.balance.value(),
                requested: amount.value(),
            });
        }

        Ok(AccountEvent::FundsWithdrawn {
            amount: amount.value(),
        })
    }

    /// Decide a close. Only a drained account can close.
    pub fn close(&self) -> Result<AccountEvent, DomainError> {
        self.ensure_active()?;

        if !self.balance.is_zero() {
            return Err(DomainError::BalanceNotZero {
                account_id: self.id,
                balance: self.balance.value(),
            });
        }

        Ok(AccountEvent::AccountClosed)
    }

    fn ensure_active(&self) -> Result<(), DomainError> {
        match self.status {
            AccountStatus::Active => Ok(()),
            AccountStatus::Closed => Err(DomainError::AccountClosed {
                account_id: self.id,
            }),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn account_type(&self) -> AccountType {
        self.account_type
    }

    pub fn balance(&self) -> &Balance {
        &self.balance
    }

    pub fn status(&self) -> AccountStatus {
        self.status
    }

    pub fn is_closed(&self) -> bool {
        self.status == AccountStatus::Closed
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    /// Bind the aggregate id after reconstitution. The id lives in the
    /// envelope, not the payload, so the fold cannot learn it on its own.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }
}

/// Validate a raw command amount into the domain's terms.
fn validated_amount(amount: Decimal) -> Result<Amount, DomainError> {
    use crate::domain::AmountError;

    Amount::new(amount).map_err(|e| match e {
        AmountError::NotPositive(value) => DomainError::NonPositiveAmount { amount: value },
        other => DomainError::InvalidAmount(other.to_string()),
    })
}

impl Aggregate for Account {
    type Event = AccountEvent;

    fn aggregate_type() -> &'static str {
        ACCOUNT_AGGREGATE
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn apply(mut self, event: Self::Event) -> Self {
        match event {
            AccountEvent::AccountOpened {
                holder,
                account_type,
                opening_balance,
                created_at,
            } => {
                self.holder = holder;
                self.account_type = account_type;
                self.balance =
                    Balance::new(opening_balance).expect("invalid opening balance in event");
                self.status = AccountStatus::Active;
                self.created_at = Some(created_at);
            }

            AccountEvent::FundsDeposited { amount } => {
                let amount = Amount::new(amount).expect("invalid amount in event");
                self.balance = self.balance.credit(&amount).expect("balance overflow");
            }

            AccountEvent::FundsWithdrawn { amount } => {
                let amount = Amount::new(amount).expect("invalid amount in event");
                self.balance = self.balance.debit(&amount).expect("balance underflow");
            }

            AccountEvent::AccountClosed => {
                self.status = AccountStatus::Closed;
            }
        }

        self.version += 1;
        self
    }
}

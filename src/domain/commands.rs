//! Command definitions
//!
//! Commands represent intentions to change ledger state. Amounts arrive as
//! raw decimals; validation happens when the aggregate decides, so the
//! rejection carries the offending values.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AccountType;

/// The closed set of ledger commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum AccountCommand {
    /// Open a new account with an initial (possibly zero) balance
    Open {
        account_id: Uuid,
        holder: String,
        account_type: AccountType,
        opening_balance: Decimal,
    },

    /// Deposit funds into an active account
    Deposit { account_id: Uuid, amount: Decimal },

    /// Withdraw funds from an active account
    Withdraw { account_id: Uuid, amount: Decimal },

    /// Close an active account with a zero balance
    Close { account_id: Uuid },

    /// Move funds between two active accounts in one atomic commit
    Transfer {
        from_account_id: Uuid,
        to_account_id: Uuid,
        amount: Decimal,
    },
}

impl AccountCommand {
    /// The aggregates this command reads and writes
    pub fn aggregate_ids(&self) -> Vec<Uuid> {
        match self {
            AccountCommand::Open { account_id, .. }
            | AccountCommand::Deposit { account_id, .. }
            | AccountCommand::Withdraw { account_id, .. }
            | AccountCommand::Close { account_id } => vec![*account_id],
            AccountCommand::Transfer {
                from_account_id,
                to_account_id,
                ..
            } => vec![*from_account_id, *to_account_id],
        }
    }

    pub fn open(
        account_id: Uuid,
        holder: impl Into<String>,
        account_type: AccountType,
        opening_balance: Decimal,
    ) -> Self {
        Self::Open {
            account_id,
            holder: holder.into(),
            account_type,
            opening_balance,
        }
    }

    pub fn deposit(account_id: Uuid, amount: Decimal) -> Self {
        Self::Deposit { account_id, amount }
    }

    pub fn withdraw(account_id: Uuid, amount: Decimal) -> Self {
        Self::Withdraw { account_id, amount }
    }

    pub fn close(account_id: Uuid) -> Self {
        Self::Close { account_id }
    }

    pub fn transfer(from_account_id: Uuid, to_account_id: Uuid, amount: Decimal) -> Self {
        Self::Transfer {
            from_account_id,
            to_account_id,
            amount,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_account_commands_reference_one_aggregate() {
        let id = Uuid::new_v4();
        assert_eq!(AccountCommand::close(id).aggregate_ids(), vec![id]);
        assert_eq!(
            AccountCommand::deposit(id, Decimal::new(10, 0)).aggregate_ids(),
            vec![id]
        );
    }

    #[test]
    fn test_transfer_references_both_aggregates() {
        let from = Uuid::new_v4();
        let to = Uuid::new_v4();
        let cmd = AccountCommand::transfer(from, to, Decimal::new(40, 0));
        assert_eq!(cmd.aggregate_ids(), vec![from, to]);
    }
}

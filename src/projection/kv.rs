//! Key-value projection
//!
//! Point-lookup read model: one balance row per account plus a
//! transaction-history row per balance-moving event, queryable newest
//! first. Idempotency rides on two guards: balance rows remember the last
//! applied version, and transaction inserts key on the event id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::aggregate::AccountStatus;
use crate::domain::{AccountEvent, AccountType, EventEnvelope};

use super::{ProjectionError, ProjectionTarget};

/// Current state of one account, as the KV store sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceRow {
    pub account_id: Uuid,
    pub balance: Decimal,
    pub status: AccountStatus,
    pub holder: String,
    pub account_type: AccountType,
    pub last_updated: DateTime<Utc>,
    /// Version of the last event folded into this row; events at or below
    /// it are replays and skipped.
    pub last_version: i64,
}

/// Kind of history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    OpeningDeposit,
    Deposit,
    Withdrawal,
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionKind::OpeningDeposit => write!(f, "OPENING_DEPOSIT"),
            TransactionKind::Deposit => write!(f, "DEPOSIT"),
            TransactionKind::Withdrawal => write!(f, "WITHDRAWAL"),
        }
    }
}

/// One history entry, keyed by the event that caused it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRow {
    pub transaction_id: Uuid,
    pub account_id: Uuid,
    pub transaction_type: TransactionKind,
    pub amount: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Seam over the external key-value service. The store must offer a
/// conditional put (write only when absent), which both idempotency guards
/// lean on.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get_balance(&self, account_id: Uuid) -> Result<Option<BalanceRow>, ProjectionError>;

    async fn put_balance(&self, row: BalanceRow) -> Result<(), ProjectionError>;

    /// Write the row only when the account has none yet. Returns whether
    /// the write happened.
    async fn put_balance_if_absent(&self, row: BalanceRow) -> Result<bool, ProjectionError>;

    /// Insert keyed on the transaction id; a duplicate is a no-op.
    /// Returns whether the row was new.
    async fn insert_transaction(&self, row: TransactionRow) -> Result<bool, ProjectionError>;

    /// History for one account, newest first.
    async fn recent_transactions(
        &self,
        account_id: Uuid,
        limit: usize,
    ) -> Result<Vec<TransactionRow>, ProjectionError>;
}

/// The key-value half of the projection service.
pub struct KvProjection<S> {
    store: Arc<S>,
}

impl<S> KvProjection<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S: KvStore> KvProjection<S> {
    async fn apply_opened(
        &self,
        envelope: &EventEnvelope,
        holder: &str,
        account_type: AccountType,
        opening_balance: Decimal,
    ) -> Result<(), ProjectionError> {
        let row = BalanceRow {
            account_id: envelope.aggregate_id,
            balance: opening_balance,
            status: AccountStatus::Active,
            holder: holder.to_string(),
            account_type,
            last_updated: envelope.timestamp,
            last_version: envelope.version,
        };
        self.store.put_balance_if_absent(row).await?;

        // Unconditional: keyed on the event id, so replays are no-ops even
        // when the balance write above was skipped.
        if opening_balance > Decimal::ZERO {
            self.store
                .insert_transaction(TransactionRow {
                    transaction_id: envelope.event_id,
                    account_id: envelope.aggregate_id,
                    transaction_type: TransactionKind::OpeningDeposit,
                    amount: opening_balance,
                    timestamp: envelope.timestamp,
                })
                .await?;
        }

        Ok(())
    }

    async fn apply_movement(
        &self,
        envelope: &EventEnvelope,
        amount: Decimal,
        kind: TransactionKind,
    ) -> Result<(), ProjectionError> {
        let mut row = self
            .store
            .get_balance(envelope.aggregate_id)
            .await?
            .ok_or(ProjectionError::MissingState {
                account_id: envelope.aggregate_id,
            })?;

        if envelope.version <= row.last_version {
            tracing::debug!(
                event_id = %envelope.event_id,
                version = envelope.version,
                applied = row.last_version,
                "skipping replayed event"
            );
            return Ok(());
        }

        self.store
            .insert_transaction(TransactionRow {
                transaction_id: envelope.event_id,
                account_id: envelope.aggregate_id,
                transaction_type: kind,
                amount,
                timestamp: envelope.timestamp,
            })
            .await?;

        row.balance = match kind {
            TransactionKind::Withdrawal => row.balance - amount,
            _ => row.balance + amount,
        };
        row.last_updated = envelope.timestamp;
        row.last_version = envelope.version;
        self.store.put_balance(row).await
    }

    async fn apply_closed(&self, envelope: &EventEnvelope) -> Result<(), ProjectionError> {
        let mut row = self
            .store
            .get_balance(envelope.aggregate_id)
            .await?
            .ok_or(ProjectionError::MissingState {
                account_id: envelope.aggregate_id,
            })?;

        if envelope.version <= row.last_version {
            return Ok(());
        }

        row.status = AccountStatus::Closed;
        row.last_updated = envelope.timestamp;
        row.last_version = envelope.version;
        self.store.put_balance(row).await
    }
}

#[async_trait]
impl<S: KvStore> ProjectionTarget for KvProjection<S> {
    fn name(&self) -> &'static str {
        "key_value"
    }

    async fn apply(&self, envelope: &EventEnvelope) -> Result<(), ProjectionError> {
        match &envelope.event {
            AccountEvent::AccountOpened {
                holder,
                account_type,
                opening_balance,
                ..
            } => {
                self.apply_opened(envelope, holder, *account_type, *opening_balance)
                    .await
            }
            AccountEvent::FundsDeposited { amount } => {
                self.apply_movement(envelope, *amount, TransactionKind::Deposit)
                    .await
            }
            AccountEvent::FundsWithdrawn { amount } => {
                self.apply_movement(envelope, *amount, TransactionKind::Withdrawal)
                    .await
            }
            AccountEvent::AccountClosed => self.apply_closed(envelope).await,
        }
    }
}

/// In-process key-value store on concurrent maps. Serves the tests and
/// single-process deployments; a networked store plugs in through the same
/// trait.
#[derive(Debug, Default)]
pub struct MemoryKv {
    balances: DashMap<Uuid, BalanceRow>,
    transactions: DashMap<Uuid, TransactionRow>,
    history: DashMap<Uuid, Vec<Uuid>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored history rows, across all accounts.
    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get_balance(&self, account_id: Uuid) -> Result<Option<BalanceRow>, ProjectionError> {
        Ok(self.balances.get(&account_id).map(|row| row.clone()))
    }

    async fn put_balance(&self, row: BalanceRow) -> Result<(), ProjectionError> {
        self.balances.insert(row.account_id, row);
        Ok(())
    }

    async fn put_balance_if_absent(&self, row: BalanceRow) -> Result<bool, ProjectionError> {
        match self.balances.entry(row.account_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(row);
                Ok(true)
            }
        }
    }

    async fn insert_transaction(&self, row: TransactionRow) -> Result<bool, ProjectionError> {
        match self.transactions.entry(row.transaction_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                self.history
                    .entry(row.account_id)
                    .or_default()
                    .push(row.transaction_id);
                entry.insert(row);
                Ok(true)
            }
        }
    }

    async fn recent_transactions(
        &self,
        account_id: Uuid,
        limit: usize,
    ) -> Result<Vec<TransactionRow>, ProjectionError> {
        let ids = match self.history.get(&account_id) {
            Some(ids) => ids.clone(),
            None => return Ok(Vec::new()),
        };

        Ok(ids
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| self.transactions.get(id).map(|row| row.clone()))
            .collect())
    }
}

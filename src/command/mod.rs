//! Command Service
//!
//! Orchestrates the write path: read history, reconstitute, decide, append
//! atomically. A conflict means someone else committed first; the service
//! re-reads and re-decides against the fresh state, bounded by the retry
//! budget. The service returns as soon as the append commits and never
//! writes projections; those follow through the change stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use uuid::Uuid;

use crate::aggregate::{load_from_history, Account, Aggregate};
use crate::domain::{AccountCommand, AccountType, DomainError, EventEnvelope};
use crate::error::{AppError, AppResult};
use crate::event_log::{EventLog, EventLogError};

/// Tuning knobs for the command path.
#[derive(Debug, Clone)]
pub struct CommandOptions {
    /// Retries after an append conflict
    pub retry_max: u32,
    /// Deadline for each event-log call
    pub call_timeout: Duration,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            retry_max: 3,
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// What a successful command leaves behind.
#[derive(Debug, Clone)]
pub struct CommandReceipt {
    /// Ids of the committed events, in batch order
    pub event_ids: Vec<Uuid>,
    /// Conflict retries it took to commit
    pub retries: u32,
}

/// The write-path entry point, generic over the log backend.
pub struct CommandService<L> {
    log: Arc<L>,
    options: CommandOptions,
}

impl<L: EventLog> CommandService<L> {
    pub fn new(log: Arc<L>) -> Self {
        Self::with_options(log, CommandOptions::default())
    }

    pub fn with_options(log: Arc<L>, options: CommandOptions) -> Self {
        Self { log, options }
    }

    /// Execute one command end to end. Returns once the atomic append has
    /// committed; projections catch up through the stream.
    pub async fn execute(&self, command: AccountCommand) -> AppResult<CommandReceipt> {
        let mut attempt: u32 = 0;

        loop {
            match self.try_execute(&command).await {
                Err(error) if error.is_conflict() && attempt < self.options.retry_max => {
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        max = self.options.retry_max,
                        "append conflict, re-reading history and retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
                }
                Ok(mut receipt) => {
                    receipt.retries = attempt;
                    return Ok(receipt);
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// One attempt: reconstitute, decide, append.
    async fn try_execute(&self, command: &AccountCommand) -> AppResult<CommandReceipt> {
        let events = match command {
            AccountCommand::Open {
                account_id,
                holder,
                account_type,
                opening_balance,
            } => {
                self.decide_open(*account_id, holder, *account_type, *opening_balance)
                    .await?
            }

            AccountCommand::Deposit { account_id, amount } => {
                let account = self.load_account(*account_id).await?;
                let event = account.deposit(*amount)?;
                vec![EventEnvelope::for_account(
                    *account_id,
                    account.version() + 1,
                    event,
                )]
            }

            AccountCommand::Withdraw { account_id, amount } => {
                let account = self.load_account(*account_id).await?;
                let event = account.withdraw(*amount)?;
                vec![EventEnvelope::for_account(
                    *account_id,
                    account.version() + 1,
                    event,
                )]
            }

            AccountCommand::Close { account_id } => {
                let account = self.load_account(*account_id).await?;
                let event = account.close()?;
                vec![EventEnvelope::for_account(
                    *account_id,
                    account.version() + 1,
                    event,
                )]
            }

            AccountCommand::Transfer {
                from_account_id,
                to_account_id,
                amount,
            } => {
                self.decide_transfer(*from_account_id, *to_account_id, *amount)
                    .await?
            }
        };

        let event_ids = events.iter().map(|e| e.event_id).collect();
        self.append(events).await?;

        Ok(CommandReceipt {
            event_ids,
            retries: 0,
        })
    }

    async fn decide_open(
        &self,
        account_id: Uuid,
        holder: &str,
        account_type: AccountType,
        opening_balance: rust_decimal::Decimal,
    ) -> AppResult<Vec<EventEnvelope>> {
        let history = self.read_stream(account_id).await?;
        if !history.is_empty() {
            return Err(DomainError::AccountAlreadyExists { account_id }.into());
        }

        let event = Account::open(holder, account_type, opening_balance)?;
        Ok(vec![EventEnvelope::for_account(account_id, 1, event)])
    }

    /// A transfer is one batch: the withdrawal and the deposit either both
    /// commit or neither does.
    async fn decide_transfer(
        &self,
        from_account_id: Uuid,
        to_account_id: Uuid,
        amount: rust_decimal::Decimal,
    ) -> AppResult<Vec<EventEnvelope>> {
        if from_account_id == to_account_id {
            return Err(DomainError::SameAccountTransfer {
                account_id: from_account_id,
            }
            .into());
        }

        let from_account = self.load_account(from_account_id).await?;
        let to_account = self.load_account(to_account_id).await?;

        let withdrawal = from_account.withdraw(amount)?;
        let deposit = to_account.deposit(amount)?;

        Ok(vec![
            EventEnvelope::for_account(from_account_id, from_account.version() + 1, withdrawal),
            EventEnvelope::for_account(to_account_id, to_account.version() + 1, deposit),
        ])
    }

    async fn load_account(&self, account_id: Uuid) -> AppResult<Account> {
        let history = self.read_stream(account_id).await?;
        let events = history.into_iter().map(|envelope| envelope.event);

        load_from_history::<Account, _>(events)
            .map(|account| account.with_id(account_id))
            .ok_or_else(|| DomainError::AccountNotFound { account_id }.into())
    }

    async fn read_stream(&self, account_id: Uuid) -> AppResult<Vec<EventEnvelope>> {
        let events = timeout(self.options.call_timeout, self.log.read_stream(account_id))
            .await
            .map_err(|_| EventLogError::Timeout(self.options.call_timeout))??;
        Ok(events)
    }

    async fn append(&self, events: Vec<EventEnvelope>) -> AppResult<()> {
        timeout(self.options.call_timeout, self.log.append_atomic(events))
            .await
            .map_err(|_| EventLogError::Timeout(self.options.call_timeout))??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::MemoryEventLog;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn service() -> (Arc<MemoryEventLog>, CommandService<MemoryEventLog>) {
        let log = Arc::new(MemoryEventLog::new(4));
        let service = CommandService::new(Arc::clone(&log));
        (log, service)
    }

    async fn open(
        service: &CommandService<MemoryEventLog>,
        balance: rust_decimal::Decimal,
    ) -> Uuid {
        let account_id = Uuid::new_v4();
        service
            .execute(AccountCommand::open(
                account_id,
                "Jane",
                AccountType::Checking,
                balance,
            ))
            .await
            .unwrap();
        account_id
    }

    #[tokio::test]
    async fn test_open_then_deposit_versions_are_contiguous() {
        let (log, service) = service();
        let account_id = open(&service, dec!(50)).await;

        let receipt = service
            .execute(AccountCommand::deposit(account_id, dec!(30)))
            .await
            .unwrap();
        assert_eq!(receipt.event_ids.len(), 1);
        assert_eq!(receipt.retries, 0);

        let events = log.read_stream(account_id).await.unwrap();
        let versions: Vec<i64> = events.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_duplicate_open_rejected() {
        let (_, service) = service();
        let account_id = open(&service, dec!(0)).await;

        let result = service
            .execute(AccountCommand::open(
                account_id,
                "Jane",
                AccountType::Checking,
                dec!(10),
            ))
            .await;
        assert!(matches!(
            result,
            Err(AppError::Domain(DomainError::AccountAlreadyExists { .. }))
        ));
    }

    #[tokio::test]
    async fn test_open_with_unrepresentable_balance_commits_nothing() {
        let (log, service) = service();

        let account_id = Uuid::new_v4();
        let result = service
            .execute(AccountCommand::open(
                account_id,
                "Jane",
                AccountType::Checking,
                dec!(0.00001),
            ))
            .await;
        assert!(matches!(
            result,
            Err(AppError::Domain(DomainError::InvalidAmount(_)))
        ));
        assert!(log.read_stream(account_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deposit_overflowing_balance_commits_nothing() {
        let (log, service) = service();
        let account_id = open(&service, dec!(600000000000)).await;

        let result = service
            .execute(AccountCommand::deposit(account_id, dec!(600000000000)))
            .await;
        assert!(matches!(
            result,
            Err(AppError::Domain(DomainError::BalanceOverflow { .. }))
        ));
        assert_eq!(log.read_stream(account_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_command_against_unknown_account_rejected() {
        let (_, service) = service();
        let result = service
            .execute(AccountCommand::deposit(Uuid::new_v4(), dec!(10)))
            .await;
        assert!(matches!(
            result,
            Err(AppError::Domain(DomainError::AccountNotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_log_untouched() {
        let (log, service) = service();
        let account_id = open(&service, dec!(10)).await;

        let result = service
            .execute(AccountCommand::withdraw(account_id, dec!(20)))
            .await;
        match result {
            Err(AppError::Domain(DomainError::InsufficientFunds { balance, requested })) => {
                assert_eq!(balance, dec!(10));
                assert_eq!(requested, dec!(20));
            }
            other => panic!("unexpected result: {other:?}"),
        }

        assert_eq!(log.read_stream(account_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transfer_commits_two_events_atomically() {
        let (log, service) = service();
        let from = open(&service, dec!(100)).await;
        let to = open(&service, dec!(0)).await;

        let receipt = service
            .execute(AccountCommand::transfer(from, to, dec!(40)))
            .await
            .unwrap();
        assert_eq!(receipt.event_ids.len(), 2);

        let from_events = log.read_stream(from).await.unwrap();
        let to_events = log.read_stream(to).await.unwrap();
        assert_eq!(from_events.len(), 2);
        assert_eq!(to_events.len(), 2);
        assert_eq!(from_events[1].event_type(), "FundsWithdrawn");
        assert_eq!(to_events[1].event_type(), "FundsDeposited");
    }

    #[tokio::test]
    async fn test_transfer_to_self_rejected() {
        let (_, service) = service();
        let account_id = open(&service, dec!(100)).await;

        let result = service
            .execute(AccountCommand::transfer(account_id, account_id, dec!(10)))
            .await;
        assert!(matches!(
            result,
            Err(AppError::Domain(DomainError::SameAccountTransfer { .. }))
        ));
    }

    #[tokio::test]
    async fn test_transfer_with_insufficient_funds_commits_nothing() {
        let (log, service) = service();
        let from = open(&service, dec!(10)).await;
        let to = open(&service, dec!(0)).await;

        let result = service
            .execute(AccountCommand::transfer(from, to, dec!(40)))
            .await;
        assert!(matches!(
            result,
            Err(AppError::Domain(DomainError::InsufficientFunds { .. }))
        ));

        assert_eq!(log.read_stream(from).await.unwrap().len(), 1);
        assert_eq!(log.read_stream(to).await.unwrap().len(), 1);
    }

    /// Log wrapper that fails the first `failures` appends with a conflict.
    struct FlakyLog {
        inner: MemoryEventLog,
        failures: AtomicU32,
    }

    #[async_trait]
    impl EventLog for FlakyLog {
        async fn append_atomic(&self, events: Vec<EventEnvelope>) -> Result<(), EventLogError> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then(|| n - 1)
            })
            .is_ok()
            {
                return Err(EventLogError::Conflict {
                    aggregate_id: events[0].aggregate_id,
                    version: events[0].version,
                });
            }
            self.inner.append_atomic(events).await
        }

        async fn read_stream(&self, id: Uuid) -> Result<Vec<EventEnvelope>, EventLogError> {
            self.inner.read_stream(id).await
        }

        async fn highest_version(&self, id: Uuid) -> Result<i64, EventLogError> {
            self.inner.highest_version(id).await
        }
    }

    #[tokio::test]
    async fn test_conflict_is_retried_with_fresh_reads() {
        let log = Arc::new(FlakyLog {
            inner: MemoryEventLog::new(4),
            failures: AtomicU32::new(2),
        });
        let service = CommandService::new(Arc::clone(&log));

        let account_id = Uuid::new_v4();
        let receipt = service
            .execute(AccountCommand::open(
                account_id,
                "Jane",
                AccountType::Savings,
                dec!(5),
            ))
            .await
            .unwrap();

        assert_eq!(receipt.retries, 2);
        assert_eq!(log.read_stream(account_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_conflicts_beyond_budget_surface() {
        let log = Arc::new(FlakyLog {
            inner: MemoryEventLog::new(4),
            failures: AtomicU32::new(10),
        });
        let service = CommandService::new(Arc::clone(&log));

        let result = service
            .execute(AccountCommand::open(
                Uuid::new_v4(),
                "Jane",
                AccountType::Savings,
                dec!(5),
            ))
            .await;
        assert!(matches!(
            result,
            Err(AppError::EventLog(EventLogError::Conflict { .. }))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_deposits_both_land() {
        let (log, service) = service();
        let service = Arc::new(service);
        let account_id = open(&service, dec!(0)).await;

        let a = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .execute(AccountCommand::deposit(account_id, dec!(10)))
                    .await
            })
        };
        let b = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .execute(AccountCommand::deposit(account_id, dec!(10)))
                    .await
            })
        };

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let events = log.read_stream(account_id).await.unwrap();
        let versions: Vec<i64> = events.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }
}

//! Relational projection
//!
//! The analytical read model: account master, transaction ledger, running
//! summary and per-day rollups, all updated in one SQL transaction per
//! event. Idempotency keys on the event id: the transaction ledger's
//! primary key is the event id, and every balance-moving handler checks it
//! before touching the other tables.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::domain::{AccountEvent, AccountType, EventEnvelope};

use super::{ProjectionError, ProjectionTarget};

/// The relational half of the projection service.
#[derive(Debug, Clone)]
pub struct PgRelationalProjection {
    pool: PgPool,
}

impl PgRelationalProjection {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn apply_opened(
        &self,
        envelope: &EventEnvelope,
        holder: &str,
        account_type: AccountType,
        opening_balance: Decimal,
    ) -> Result<(), ProjectionError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO accounts (account_id, holder, type, balance, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'active', $5, $5)
            ON CONFLICT (account_id) DO NOTHING
            "#,
        )
        .bind(envelope.aggregate_id)
        .bind(holder)
        .bind(account_type.to_string())
        .bind(opening_balance)
        .bind(envelope.timestamp)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            // Replay: the account row already exists, and so does
            // everything else this handler would write.
            tx.commit().await?;
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO account_summary (
                account_id, holder, type, current_balance,
                total_deposits, total_withdrawals, transaction_count,
                last_transaction_date, account_age_days, status
            )
            VALUES ($1, $2, $3, $4, $5, 0, $6, $7, 0, 'active')
            ON CONFLICT (account_id) DO NOTHING
            "#,
        )
        .bind(envelope.aggregate_id)
        .bind(holder)
        .bind(account_type.to_string())
        .bind(opening_balance)
        .bind(if opening_balance > Decimal::ZERO {
            opening_balance
        } else {
            Decimal::ZERO
        })
        .bind(if opening_balance > Decimal::ZERO { 1i32 } else { 0 })
        .bind(if opening_balance > Decimal::ZERO {
            Some(envelope.timestamp)
        } else {
            None
        })
        .execute(&mut *tx)
        .await?;

        if opening_balance > Decimal::ZERO {
            insert_transaction(
                &mut tx,
                envelope,
                "OPENING_DEPOSIT",
                opening_balance,
                opening_balance,
                "Account opened",
            )
            .await?;
            upsert_daily_balance(
                &mut tx,
                envelope.aggregate_id,
                envelope.timestamp.date_naive(),
                opening_balance,
                opening_balance,
                Decimal::ZERO,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn apply_movement(
        &self,
        envelope: &EventEnvelope,
        amount: Decimal,
        is_deposit: bool,
    ) -> Result<(), ProjectionError> {
        let mut tx = self.pool.begin().await?;

        let already_applied: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM transactions WHERE transaction_id = $1")
                .bind(envelope.event_id)
                .fetch_optional(&mut *tx)
                .await?;

        if already_applied.is_some() {
            tx.commit().await?;
            return Ok(());
        }

        let delta = if is_deposit { amount } else { -amount };
        let balance_after: Option<Decimal> = sqlx::query_scalar(
            r#"
            UPDATE accounts
            SET balance = balance + $2, updated_at = $3
            WHERE account_id = $1
            RETURNING balance
            "#,
        )
        .bind(envelope.aggregate_id)
        .bind(delta)
        .bind(envelope.timestamp)
        .fetch_optional(&mut *tx)
        .await?;

        let balance_after = balance_after.ok_or(ProjectionError::MissingState {
            account_id: envelope.aggregate_id,
        })?;

        let (kind, description) = if is_deposit {
            ("DEPOSIT", "Deposit")
        } else {
            ("WITHDRAWAL", "Withdrawal")
        };
        insert_transaction(&mut tx, envelope, kind, amount, balance_after, description).await?;

        let (deposit_delta, withdrawal_delta) = if is_deposit {
            (amount, Decimal::ZERO)
        } else {
            (Decimal::ZERO, amount)
        };

        sqlx::query(
            r#"
            UPDATE account_summary s
            SET current_balance = $2,
                total_deposits = s.total_deposits + $3,
                total_withdrawals = s.total_withdrawals + $4,
                transaction_count = s.transaction_count + 1,
                last_transaction_date = $5,
                account_age_days = GREATEST(0, CURRENT_DATE - a.created_at::date)
            FROM accounts a
            WHERE s.account_id = $1 AND a.account_id = $1
            "#,
        )
        .bind(envelope.aggregate_id)
        .bind(balance_after)
        .bind(deposit_delta)
        .bind(withdrawal_delta)
        .bind(envelope.timestamp)
        .execute(&mut *tx)
        .await?;

        upsert_daily_balance(
            &mut tx,
            envelope.aggregate_id,
            envelope.timestamp.date_naive(),
            balance_after,
            deposit_delta,
            withdrawal_delta,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn apply_closed(&self, envelope: &EventEnvelope) -> Result<(), ProjectionError> {
        let mut tx = self.pool.begin().await?;

        // Naturally idempotent: a second close finds status already set.
        sqlx::query(
            r#"
            UPDATE accounts
            SET status = 'closed', closed_at = $2, updated_at = $2
            WHERE account_id = $1 AND status <> 'closed'
            "#,
        )
        .bind(envelope.aggregate_id)
        .bind(envelope.timestamp)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE account_summary SET status = 'closed' WHERE account_id = $1")
            .bind(envelope.aggregate_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

async fn insert_transaction(
    tx: &mut Transaction<'_, Postgres>,
    envelope: &EventEnvelope,
    kind: &str,
    amount: Decimal,
    balance_after: Decimal,
    description: &str,
) -> Result<(), ProjectionError> {
    sqlx::query(
        r#"
        INSERT INTO transactions (
            transaction_id, account_id, type, amount,
            balance_after, timestamp, description
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (transaction_id) DO NOTHING
        "#,
    )
    .bind(envelope.event_id)
    .bind(envelope.aggregate_id)
    .bind(kind)
    .bind(amount)
    .bind(balance_after)
    .bind(envelope.timestamp)
    .bind(description)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn upsert_daily_balance(
    tx: &mut Transaction<'_, Postgres>,
    account_id: Uuid,
    balance_date: NaiveDate,
    closing_balance: Decimal,
    deposit_delta: Decimal,
    withdrawal_delta: Decimal,
) -> Result<(), ProjectionError> {
    sqlx::query(
        r#"
        INSERT INTO daily_balances (
            account_id, balance_date, closing_balance,
            daily_deposits, daily_withdrawals, transaction_count
        )
        VALUES ($1, $2, $3, $4, $5, 1)
        ON CONFLICT (account_id, balance_date)
        DO UPDATE SET
            closing_balance = EXCLUDED.closing_balance,
            daily_deposits = daily_balances.daily_deposits + EXCLUDED.daily_deposits,
            daily_withdrawals = daily_balances.daily_withdrawals + EXCLUDED.daily_withdrawals,
            transaction_count = daily_balances.transaction_count + 1
        "#,
    )
    .bind(account_id)
    .bind(balance_date)
    .bind(closing_balance)
    .bind(deposit_delta)
    .bind(withdrawal_delta)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

#[async_trait::async_trait]
impl ProjectionTarget for PgRelationalProjection {
    fn name(&self) -> &'static str {
        "relational"
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
                self.apply_movement(envelope, *amount, true).await
            }
            AccountEvent::FundsWithdrawn { amount } => {
                self.apply_movement(envelope, *amount, false).await
            }
            AccountEvent::AccountClosed => self.apply_closed(envelope).await,
        }
    }
}

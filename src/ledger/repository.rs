use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::BigDecimal;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::models::*;
use super::store::{BatchPricer, LedgerStore};
use crate::error::{AppError, AppResult};

/// Ledger repository - THE source of truth for payments, transactions and settlements
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin_tx(&self) -> AppResult<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }
}

pub(crate) fn to_big(amount: Decimal) -> AppResult<BigDecimal> {
    BigDecimal::from_str(&amount.to_string())
        .map_err(|e| AppError::InvalidInput(format!("Invalid decimal {}: {}", amount, e)))
}

pub(crate) fn from_big(amount: &BigDecimal) -> AppResult<Decimal> {
    let s = amount.to_string();
    Decimal::from_str(&s)
        .or_else(|_| Decimal::from_scientific(&s))
        .map_err(|_| AppError::Internal(format!("Stored amount out of range: {}", s)))
}

// ========== ROW MAPPING ==========

const PAYMENT_COLUMNS: &str = r#"
    id, merchant_id, external_id, amount, currency, network, status,
    deposit_address, payment_url, qr_code_data, description,
    customer_email, customer_phone, metadata,
    expires_at, created_at, updated_at, completed_at, cancelled_at
"#;

const TRANSACTION_COLUMNS: &str = r#"
    id, transaction_hash, network, payment_id, from_address, to_address,
    amount, block_number, confirmation_count, status,
    created_at, confirmed_at, failed_at
"#;

const SETTLEMENT_COLUMNS: &str = r#"
    id, merchant_id, period_start, period_end,
    gross_amount, fee_amount, net_amount, transaction_count,
    status, payout_network, payout_hash, error_message,
    created_at, processed_at, completed_at
"#;

#[derive(FromRow)]
struct PaymentRow {
    id: Uuid,
    merchant_id: Uuid,
    external_id: Option<String>,
    amount: BigDecimal,
    currency: Currency,
    network: Network,
    status: PaymentStatus,
    deposit_address: String,
    payment_url: Option<String>,
    qr_code_data: Option<String>,
    description: Option<String>,
    customer_email: Option<String>,
    customer_phone: Option<String>,
    metadata: Option<serde_json::Value>,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = AppError;

    fn try_from(row: PaymentRow) -> AppResult<Self> {
        Ok(Payment {
            id: row.id,
            merchant_id: row.merchant_id,
            external_id: row.external_id,
            amount: from_big(&row.amount)?,
            currency: row.currency,
            network: row.network,
            status: row.status,
            deposit_address: row.deposit_address,
            payment_url: row.payment_url,
            qr_code_data: row.qr_code_data,
            description: row.description,
            customer_email: row.customer_email,
            customer_phone: row.customer_phone,
            metadata: row.metadata,
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
            cancelled_at: row.cancelled_at,
        })
    }
}

#[derive(FromRow)]
struct TransactionRow {
    id: Uuid,
    transaction_hash: String,
    network: Network,
    payment_id: Option<Uuid>,
    from_address: String,
    to_address: String,
    amount: BigDecimal,
    block_number: Option<i64>,
    confirmation_count: i64,
    status: TransactionStatus,
    created_at: DateTime<Utc>,
    confirmed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TransactionRow> for ChainTransaction {
    type Error = AppError;

    fn try_from(row: TransactionRow) -> AppResult<Self> {
        Ok(ChainTransaction {
            id: row.id,
            transaction_hash: row.transaction_hash,
            network: row.network,
            payment_id: row.payment_id,
            from_address: row.from_address,
            to_address: row.to_address,
            amount: from_big(&row.amount)?,
            block_number: row.block_number,
            confirmation_count: row.confirmation_count,
            status: row.status,
            created_at: row.created_at,
            confirmed_at: row.confirmed_at,
            failed_at: row.failed_at,
        })
    }
}

#[derive(FromRow)]
struct SettlementRow {
    id: Uuid,
    merchant_id: Uuid,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    gross_amount: BigDecimal,
    fee_amount: BigDecimal,
    net_amount: BigDecimal,
    transaction_count: i32,
    status: SettlementStatus,
    payout_network: Network,
    payout_hash: Option<String>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<SettlementRow> for Settlement {
    type Error = AppError;

    fn try_from(row: SettlementRow) -> AppResult<Self> {
        Ok(Settlement {
            id: row.id,
            merchant_id: row.merchant_id,
            period_start: row.period_start,
            period_end: row.period_end,
            gross_amount: from_big(&row.gross_amount)?,
            fee_amount: from_big(&row.fee_amount)?,
            net_amount: from_big(&row.net_amount)?,
            transaction_count: row.transaction_count,
            status: row.status,
            payout_network: row.payout_network,
            payout_hash: row.payout_hash,
            error_message: row.error_message,
            created_at: row.created_at,
            processed_at: row.processed_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(FromRow)]
struct EligiblePaymentRow {
    id: Uuid,
    amount: BigDecimal,
}

#[async_trait]
impl LedgerStore for LedgerRepository {
    // ========== PAYMENT OPERATIONS ==========

    async fn insert_payment(&self, payment: NewPayment) -> AppResult<Payment> {
        let query = format!(
            r#"
            INSERT INTO payments (
                id, merchant_id, external_id, amount, currency, network, status,
                deposit_address, description, customer_email, customer_phone,
                metadata, expires_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8, $9, $10, $11, $12, $13, $13)
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        );

        let row = sqlx::query_as::<_, PaymentRow>(&query)
            .bind(payment.id)
            .bind(payment.merchant_id)
            .bind(payment.external_id)
            .bind(to_big(payment.amount)?)
            .bind(payment.currency)
            .bind(payment.network)
            .bind(payment.deposit_address)
            .bind(payment.description)
            .bind(payment.customer_email)
            .bind(payment.customer_phone)
            .bind(payment.metadata)
            .bind(payment.expires_at)
            .bind(payment.created_at)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn get_payment(&self, payment_id: Uuid) -> AppResult<Option<Payment>> {
        let query = format!("SELECT {} FROM payments WHERE id = $1", PAYMENT_COLUMNS);

        sqlx::query_as::<_, PaymentRow>(&query)
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Payment::try_from)
            .transpose()
    }

    async fn set_checkout_details(
        &self,
        payment_id: Uuid,
        payment_url: &str,
        qr_code_data: &str,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE payments
            SET payment_url = $2, qr_code_data = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(payment_id)
        .bind(payment_url)
        .bind(qr_code_data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_payment_status(
        &self,
        payment_id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let completed_at = (to == PaymentStatus::Completed).then_some(at);
        let cancelled_at = matches!(
            to,
            PaymentStatus::Cancelled | PaymentStatus::Expired | PaymentStatus::Failed
        )
        .then_some(at);

        let result = sqlx::query(
            r#"
            UPDATE payments
            SET status = $3,
                updated_at = $4,
                completed_at = COALESCE($5, completed_at),
                cancelled_at = COALESCE($6, cancelled_at)
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(payment_id)
        .bind(from)
        .bind(to)
        .bind(at)
        .bind(completed_at)
        .bind(cancelled_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn expire_pending_payments(&self, now: DateTime<Utc>) -> AppResult<Vec<Payment>> {
        let query = format!(
            r#"
            UPDATE payments
            SET status = 'expired', cancelled_at = $1, updated_at = $1
            WHERE status = 'pending' AND expires_at <= $1
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        );

        sqlx::query_as::<_, PaymentRow>(&query)
            .bind(now)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Payment::try_from)
            .collect()
    }

    async fn list_payments_by_merchant(
        &self,
        merchant_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<Payment>> {
        let query = format!(
            r#"
            SELECT {} FROM payments
            WHERE merchant_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
            PAYMENT_COLUMNS
        );

        sqlx::query_as::<_, PaymentRow>(&query)
            .bind(merchant_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Payment::try_from)
            .collect()
    }

    async fn count_payments_by_merchant(&self, merchant_id: Uuid) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM payments WHERE merchant_id = $1")
            .bind(merchant_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    // ========== TRANSACTION OPERATIONS ==========

    async fn find_transaction_by_hash(&self, hash: &str) -> AppResult<Option<ChainTransaction>> {
        let query = format!(
            "SELECT {} FROM transactions WHERE transaction_hash = $1",
            TRANSACTION_COLUMNS
        );

        sqlx::query_as::<_, TransactionRow>(&query)
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?
            .map(ChainTransaction::try_from)
            .transpose()
    }

    async fn insert_transaction(&self, tx: NewTransaction) -> AppResult<ChainTransaction> {
        let query = format!(
            r#"
            INSERT INTO transactions (
                transaction_hash, network, payment_id, from_address, to_address,
                amount, block_number, confirmation_count, status, confirmed_at, failed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9,
                    CASE WHEN $9 = 'confirmed'::transaction_status THEN NOW() END,
                    CASE WHEN $9 = 'failed'::transaction_status THEN NOW() END)
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        );

        let row = sqlx::query_as::<_, TransactionRow>(&query)
            .bind(&tx.transaction_hash)
            .bind(tx.network)
            .bind(tx.payment_id)
            .bind(&tx.from_address)
            .bind(&tx.to_address)
            .bind(to_big(tx.amount)?)
            .bind(tx.block_number)
            .bind(tx.confirmation_count)
            .bind(tx.status)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn update_transaction_confirmations(
        &self,
        hash: &str,
        confirmations: i64,
        status: TransactionStatus,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let confirmed_at = (status == TransactionStatus::Confirmed).then_some(at);
        let failed_at = (status == TransactionStatus::Failed).then_some(at);

        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET confirmation_count = $2,
                status = $3,
                confirmed_at = COALESCE($4, confirmed_at),
                failed_at = COALESCE($5, failed_at)
            WHERE transaction_hash = $1 AND status = 'pending'
            "#,
        )
        .bind(hash)
        .bind(confirmations)
        .bind(status)
        .bind(confirmed_at)
        .bind(failed_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_pending_transactions(&self, limit: i64) -> AppResult<Vec<ChainTransaction>> {
        let query = format!(
            r#"
            SELECT {} FROM transactions
            WHERE status = 'pending' AND payment_id IS NOT NULL
            ORDER BY created_at ASC
            LIMIT $1
            "#,
            TRANSACTION_COLUMNS
        );

        sqlx::query_as::<_, TransactionRow>(&query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(ChainTransaction::try_from)
            .collect()
    }

    // ========== SETTLEMENT OPERATIONS ==========

    async fn create_settlement_batch(
        &self,
        merchant_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        payout_network: Network,
        pricer: BatchPricer<'_>,
    ) -> AppResult<BatchOutcome> {
        let mut tx = self.begin_tx().await?;

        // Rows locked by an overlapping run are skipped; the unique link
        // constraint rejects anything that slips through.
        let eligible = sqlx::query_as::<_, EligiblePaymentRow>(
            r#"
            SELECT p.id, p.amount
            FROM payments p
            WHERE p.merchant_id = $1
              AND p.status = 'completed'
              AND p.completed_at >= $2
              AND p.completed_at < $3
              AND NOT EXISTS (
                  SELECT 1 FROM settlement_payments sp WHERE sp.payment_id = p.id
              )
            ORDER BY p.completed_at
            FOR UPDATE OF p SKIP LOCKED
            "#,
        )
        .bind(merchant_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_all(&mut *tx)
        .await?;

        if eligible.is_empty() {
            tx.rollback().await?;
            return Ok(BatchOutcome::NothingToSettle);
        }

        let mut gross = Decimal::ZERO;
        for row in &eligible {
            gross += from_big(&row.amount)?;
        }

        let totals = pricer(gross)?;
        if totals.net_amount <= Decimal::ZERO {
            tx.rollback().await?;
            return Ok(BatchOutcome::NonPositiveNet {
                gross_amount: totals.gross_amount,
                net_amount: totals.net_amount,
            });
        }

        let query = format!(
            r#"
            INSERT INTO settlements (
                merchant_id, period_start, period_end,
                gross_amount, fee_amount, net_amount, transaction_count,
                status, payout_network
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8)
            RETURNING {}
            "#,
            SETTLEMENT_COLUMNS
        );

        let settlement: Settlement = sqlx::query_as::<_, SettlementRow>(&query)
            .bind(merchant_id)
            .bind(period_start)
            .bind(period_end)
            .bind(to_big(totals.gross_amount)?)
            .bind(to_big(totals.fee_amount)?)
            .bind(to_big(totals.net_amount)?)
            .bind(eligible.len() as i32)
            .bind(payout_network)
            .fetch_one(&mut *tx)
            .await?
            .try_into()?;

        let payment_ids: Vec<Uuid> = eligible.iter().map(|row| row.id).collect();
        let linked = sqlx::query(
            r#"
            INSERT INTO settlement_payments (settlement_id, payment_id)
            SELECT $1, UNNEST($2::uuid[])
            "#,
        )
        .bind(settlement.id)
        .bind(&payment_ids)
        .execute(&mut *tx)
        .await;

        if let Err(e) = linked {
            warn!(
                "Settlement link insert rejected for merchant {}: {:?}",
                merchant_id, e
            );
            tx.rollback().await?;
            return Err(e.into());
        }

        tx.commit().await?;

        info!(
            settlement_id = %settlement.id,
            merchant_id = %merchant_id,
            payments = payment_ids.len(),
            "Settlement batch written"
        );
        Ok(BatchOutcome::Created(settlement))
    }

    async fn get_settlement(&self, settlement_id: Uuid) -> AppResult<Option<Settlement>> {
        let query = format!("SELECT {} FROM settlements WHERE id = $1", SETTLEMENT_COLUMNS);

        sqlx::query_as::<_, SettlementRow>(&query)
            .bind(settlement_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Settlement::try_from)
            .transpose()
    }

    async fn settlement_payment_ids(&self, settlement_id: Uuid) -> AppResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT payment_id FROM settlement_payments WHERE settlement_id = $1",
        )
        .bind(settlement_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn update_settlement_status(
        &self,
        settlement_id: Uuid,
        from: SettlementStatus,
        to: SettlementStatus,
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let processed_at = (to == SettlementStatus::Processing).then_some(at);
        let completed_at = matches!(to, SettlementStatus::Completed | SettlementStatus::Failed)
            .then_some(at);

        let result = sqlx::query(
            r#"
            UPDATE settlements
            SET status = $3,
                processed_at = COALESCE($4, processed_at),
                completed_at = COALESCE($5, completed_at),
                error_message = COALESCE($6, error_message)
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(settlement_id)
        .bind(from)
        .bind(to)
        .bind(processed_at)
        .bind(completed_at)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_settlement_payout_hash(&self, settlement_id: Uuid, hash: &str) -> AppResult<()> {
        sqlx::query("UPDATE settlements SET payout_hash = $2 WHERE id = $1")
            .bind(settlement_id)
            .bind(hash)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list_settlements_by_status(
        &self,
        status: SettlementStatus,
    ) -> AppResult<Vec<Settlement>> {
        let query = format!(
            "SELECT {} FROM settlements WHERE status = $1 ORDER BY created_at ASC",
            SETTLEMENT_COLUMNS
        );

        sqlx::query_as::<_, SettlementRow>(&query)
            .bind(status)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Settlement::try_from)
            .collect()
    }

    async fn release_settlement_links(&self, settlement_id: Uuid) -> AppResult<u64> {
        let mut tx = self.begin_tx().await?;

        // Lock the batch row so a concurrent release sees the same state
        let status = sqlx::query_scalar::<_, SettlementStatus>(
            "SELECT status FROM settlements WHERE id = $1 FOR UPDATE",
        )
        .bind(settlement_id)
        .fetch_optional(&mut *tx)
        .await?;

        if status != Some(SettlementStatus::Failed) {
            tx.rollback().await?;
            return Ok(0);
        }

        let result = sqlx::query("DELETE FROM settlement_payments WHERE settlement_id = $1")
            .bind(settlement_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(
            "Released {} payment links from settlement {}",
            result.rows_affected(),
            settlement_id
        );
        Ok(result.rows_affected())
    }

    // ========== WEBHOOK DELIVERIES ==========

    async fn insert_webhook_event(
        &self,
        merchant_id: Uuid,
        event_type: WebhookEventType,
        resource_id: Option<Uuid>,
        payload: &serde_json::Value,
    ) -> AppResult<Uuid> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO webhook_events (merchant_id, event_type, resource_id, payload, status)
            VALUES ($1, $2, $3, $4, 'pending')
            RETURNING id
            "#,
        )
        .bind(merchant_id)
        .bind(event_type.as_str())
        .bind(resource_id)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn finish_webhook_event(
        &self,
        event_id: Uuid,
        status: DeliveryStatus,
        response_code: Option<i32>,
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        let delivered_at = (status == DeliveryStatus::Delivered).then_some(at);

        sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = $2, response_code = $3, error_message = $4, delivered_at = $5
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(event_id)
        .bind(status)
        .bind(response_code)
        .bind(error_message)
        .bind(delivered_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

use async_trait::async_trait;
use sqlx::types::BigDecimal;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::ledger::models::{Merchant, MerchantStatus, SettlementSchedule};
use crate::ledger::repository::from_big;

/// Read-only view of the merchant directory owned by onboarding
#[async_trait]
pub trait MerchantDirectory: Send + Sync {
    async fn find_by_id(&self, merchant_id: Uuid) -> AppResult<Option<Merchant>>;

    async fn list_active_by_schedule(
        &self,
        schedule: SettlementSchedule,
    ) -> AppResult<Vec<Merchant>>;
}

pub struct MerchantRepository {
    pool: PgPool,
}

impl MerchantRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct MerchantRow {
    id: Uuid,
    status: MerchantStatus,
    fee_rate: Option<BigDecimal>,
    settlement_address: Option<String>,
    settlement_schedule: SettlementSchedule,
    webhook_url: Option<String>,
    webhook_secret: Option<String>,
}

impl TryFrom<MerchantRow> for Merchant {
    type Error = AppError;

    fn try_from(row: MerchantRow) -> AppResult<Self> {
        Ok(Merchant {
            id: row.id,
            status: row.status,
            fee_rate: row.fee_rate.as_ref().map(from_big).transpose()?,
            settlement_address: row.settlement_address,
            settlement_schedule: row.settlement_schedule,
            webhook_url: row.webhook_url,
            webhook_secret: row.webhook_secret,
        })
    }
}

#[async_trait]
impl MerchantDirectory for MerchantRepository {
    async fn find_by_id(&self, merchant_id: Uuid) -> AppResult<Option<Merchant>> {
        sqlx::query_as::<_, MerchantRow>(
            r#"
            SELECT id, status, fee_rate, settlement_address, settlement_schedule,
                   webhook_url, webhook_secret
            FROM merchants
            WHERE id = $1
            "#,
        )
        .bind(merchant_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Merchant::try_from)
        .transpose()
    }

    async fn list_active_by_schedule(
        &self,
        schedule: SettlementSchedule,
    ) -> AppResult<Vec<Merchant>> {
        sqlx::query_as::<_, MerchantRow>(
            r#"
            SELECT id, status, fee_rate, settlement_address, settlement_schedule,
                   webhook_url, webhook_secret
            FROM merchants
            WHERE status = 'active' AND settlement_schedule = $1
            ORDER BY created_at
            "#,
        )
        .bind(schedule)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Merchant::try_from)
        .collect()
    }
}

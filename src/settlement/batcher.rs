use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult, PaymentError};
use crate::fees::compute_fee;
use crate::ledger::models::{BatchOutcome, BatchTotals, Network, Settlement, SettlementSchedule};
use crate::ledger::LedgerStore;
use crate::merchants::MerchantDirectory;

/// Half-open window `[start, end)` a schedule settles when run at `now`.
///
/// daily: yesterday midnight to today midnight; weekly: the trailing seven
/// days up to today midnight; monthly: the previous calendar month.
pub fn period_bounds(
    schedule: SettlementSchedule,
    now: DateTime<Utc>,
) -> AppResult<(DateTime<Utc>, DateTime<Utc>)> {
    let midnight = |date: NaiveDate| {
        date.and_hms_opt(0, 0, 0)
            .map(|dt| Utc.from_utc_datetime(&dt))
            .ok_or_else(|| AppError::Internal(format!("Invalid settlement date {}", date)))
    };
    let today = midnight(now.date_naive())?;

    match schedule {
        SettlementSchedule::Daily => Ok((today - Duration::days(1), today)),
        SettlementSchedule::Weekly => Ok((today - Duration::days(7), today)),
        SettlementSchedule::Monthly => {
            let this_month = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
                .ok_or_else(|| AppError::Internal("Invalid month start".into()))?;
            let last_month = if now.month() == 1 {
                NaiveDate::from_ymd_opt(now.year() - 1, 12, 1)
            } else {
                NaiveDate::from_ymd_opt(now.year(), now.month() - 1, 1)
            }
            .ok_or_else(|| AppError::Internal("Invalid month start".into()))?;

            Ok((midnight(last_month)?, midnight(this_month)?))
        }
    }
}

/// Summary of one schedule run
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct ScheduleReport {
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub created: Vec<Settlement>,
    pub nothing_to_settle: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Aggregates completed, unsettled payments into settlement batches
pub struct SettlementBatcher {
    store: Arc<dyn LedgerStore>,
    merchants: Arc<dyn MerchantDirectory>,
    payout_network: Network,
}

impl SettlementBatcher {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        merchants: Arc<dyn MerchantDirectory>,
        payout_network: Network,
    ) -> Self {
        Self {
            store,
            merchants,
            payout_network,
        }
    }

    /// Create one batch for a merchant over `[period_start, period_end)`.
    /// Selection, pricing and linking happen as a single atomic unit.
    #[instrument(skip(self))]
    pub async fn create_batch(
        &self,
        merchant_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> AppResult<BatchOutcome> {
        if period_start >= period_end {
            return Err(AppError::InvalidInput(format!(
                "Empty settlement period {} - {}",
                period_start, period_end
            )));
        }

        let merchant = self
            .merchants
            .find_by_id(merchant_id)
            .await?
            .ok_or(PaymentError::MerchantNotFound(merchant_id))?;

        let fee_rate = merchant.fee_rate;
        let pricer = move |gross: Decimal| compute_fee(gross, fee_rate).map(BatchTotals::from);

        let outcome = self
            .store
            .create_settlement_batch(
                merchant_id,
                period_start,
                period_end,
                self.payout_network,
                &pricer,
            )
            .await?;

        match &outcome {
            BatchOutcome::Created(settlement) => info!(
                settlement_id = %settlement.id,
                "📦 Settlement batch created for merchant {}: gross {} fee {} net {} ({} payments)",
                merchant_id,
                settlement.gross_amount,
                settlement.fee_amount,
                settlement.net_amount,
                settlement.transaction_count
            ),
            BatchOutcome::NothingToSettle => {
                info!("No payments to settle for merchant {}", merchant_id)
            }
            BatchOutcome::NonPositiveNet {
                gross_amount,
                net_amount,
            } => warn!(
                "Net settlement for merchant {} is {} (gross {}); no batch created",
                merchant_id, net_amount, gross_amount
            ),
        }

        Ok(outcome)
    }

    /// Create batches for every active merchant on `schedule`.
    /// A failure for one merchant is logged and does not stop the others.
    pub async fn run_schedule(
        &self,
        schedule: SettlementSchedule,
        now: DateTime<Utc>,
    ) -> AppResult<ScheduleReport> {
        let (period_start, period_end) = period_bounds(schedule, now)?;
        let merchants = self.merchants.list_active_by_schedule(schedule).await?;

        info!(
            "🔄 Running {} settlements for {} merchants over [{}, {})",
            schedule,
            merchants.len(),
            period_start,
            period_end
        );

        let mut report = ScheduleReport {
            period_start: Some(period_start),
            period_end: Some(period_end),
            ..Default::default()
        };

        for merchant in merchants {
            if merchant
                .settlement_address
                .as_deref()
                .map_or(true, str::is_empty)
            {
                warn!("Merchant {} has no settlement address; skipped", merchant.id);
                report.skipped += 1;
                continue;
            }

            match self.create_batch(merchant.id, period_start, period_end).await {
                Ok(BatchOutcome::Created(settlement)) => report.created.push(settlement),
                Ok(BatchOutcome::NothingToSettle) => report.nothing_to_settle += 1,
                Ok(BatchOutcome::NonPositiveNet { .. }) => report.skipped += 1,
                Err(e) => {
                    error!("❌ Settlement batch for merchant {} failed: {:?}", merchant.id, e);
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }
}

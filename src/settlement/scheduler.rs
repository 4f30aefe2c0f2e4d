// Background jobs
//
// - Settlement cut once a day at the configured UTC hour:
//   daily merchants every day, weekly on Mondays, monthly on the 1st
// - Expiry sweep, pending-transaction refresh and payout reconcile
//   run on fixed intervals

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc, Weekday};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{error, info};

use crate::config::JobSettings;
use crate::error::{AppError, AppResult};
use crate::ledger::models::SettlementSchedule;
use crate::payments::service::PaymentService;

const REFRESH_BATCH: i64 = 100;
const REFRESH_CONCURRENCY: usize = 8;

pub struct SettlementScheduler {
    jobs: JobSettings,
    service: Arc<PaymentService>,
}

impl SettlementScheduler {
    pub fn new(jobs: JobSettings, service: Arc<PaymentService>) -> Self {
        Self { jobs, service }
    }

    /// Start every background loop
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.start_settlement_loop()];

        let service = self.service.clone();
        handles.push(Self::every(self.jobs.expiry_sweep_secs, "expiry sweep", move || {
            let service = service.clone();
            async move {
                let swept = service.sweep_expired_payments().await?;
                if swept > 0 {
                    info!("⌛ Expired {} payments", swept);
                }
                Ok::<_, AppError>(())
            }
        }));

        let service = self.service.clone();
        handles.push(Self::every(self.jobs.pending_refresh_secs, "pending refresh", move || {
            let service = service.clone();
            async move {
                let resolved = service
                    .matcher()
                    .refresh_pending(REFRESH_BATCH, REFRESH_CONCURRENCY)
                    .await?;
                if resolved > 0 {
                    info!("🔗 Resolved {} pending transactions", resolved);
                }
                Ok::<_, AppError>(())
            }
        }));

        let service = self.service.clone();
        handles.push(Self::every(self.jobs.payout_reconcile_secs, "payout reconcile", move || {
            let service = service.clone();
            async move {
                service.payouts().reconcile_processing_payouts().await?;
                Ok::<_, AppError>(())
            }
        }));

        handles
    }

    fn every<F, Fut>(secs: u64, name: &'static str, job: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = AppResult<()>> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(secs.max(1)));
            loop {
                interval.tick().await;
                if let Err(e) = job().await {
                    error!("❌ {} failed: {:?}", name, e);
                }
            }
        })
    }

    fn start_settlement_loop(&self) -> JoinHandle<()> {
        let hour = self.jobs.settlement_hour;
        let service = self.service.clone();

        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let Some(next_execution) = Self::calculate_next_daily_execution(now, hour) else {
                    error!("❌ Settlement hour {} is not a valid UTC hour; settlement loop stopped", hour);
                    return;
                };
                info!(
                    "⏰ Next settlement scheduled for: {} UTC",
                    next_execution.format("%Y-%m-%d %H:%M:%S")
                );
                tokio::time::sleep(Self::delay_until(now, next_execution)).await;

                info!("🔄 Starting settlement cycle");
                for schedule in Self::schedules_due(next_execution.date_naive()) {
                    if let Err(e) = service
                        .run_settlement_schedule(schedule, next_execution)
                        .await
                    {
                        error!("❌ {} settlement failed: {:?}", schedule, e);
                    }
                }
                info!("✓ Settlement cycle completed");
            }
        })
    }

    /// Full wait from `now` until `at`, zero if `at` has passed
    fn delay_until(now: DateTime<Utc>, at: DateTime<Utc>) -> Duration {
        at.signed_duration_since(now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Which schedules close on `day`
    pub fn schedules_due(day: NaiveDate) -> Vec<SettlementSchedule> {
        let mut due = vec![SettlementSchedule::Daily];
        if day.weekday() == Weekday::Mon {
            due.push(SettlementSchedule::Weekly);
        }
        if day.day() == 1 {
            due.push(SettlementSchedule::Monthly);
        }
        due
    }

    /// Next occurrence of `execution_hour`:00 UTC strictly after `now`
    fn calculate_next_daily_execution(
        now: DateTime<Utc>,
        execution_hour: u32,
    ) -> Option<DateTime<Utc>> {
        let today = Utc.from_utc_datetime(&now.date_naive().and_hms_opt(execution_hour, 0, 0)?);

        if today <= now {
            let tomorrow = (now.date_naive() + chrono::Duration::days(1))
                .and_hms_opt(execution_hour, 0, 0)?;
            Some(Utc.from_utc_datetime(&tomorrow))
        } else {
            Some(today)
        }
    }
}

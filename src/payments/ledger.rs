use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::PaymentSettings;
use crate::error::{AppError, AppResult, PaymentError};
use crate::ledger::models::{
    expiry_for, CreatePaymentRequest, Network, NewPayment, Payment, PaymentPage, PaymentStatus,
};
use crate::ledger::LedgerStore;
use crate::merchants::MerchantDirectory;

/// Largest page a merchant listing returns
pub const MAX_PAGE_SIZE: u32 = 100;

/// Result of a transition request
#[derive(Debug, Clone)]
pub struct Transitioned {
    pub payment: Payment,
    /// False when the payment was already in the requested status
    pub applied: bool,
}

/// Owns payment records and their state machine.
///
/// Every write is guarded by the status it was read in, so two triggers
/// racing on the same payment cannot both win.
pub struct PaymentLedger {
    store: Arc<dyn LedgerStore>,
    merchants: Arc<dyn MerchantDirectory>,
    settings: PaymentSettings,
    network: Network,
    deposit_address: String,
}

impl PaymentLedger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        merchants: Arc<dyn MerchantDirectory>,
        settings: PaymentSettings,
        network: Network,
        deposit_address: String,
    ) -> Self {
        Self {
            store,
            merchants,
            settings,
            network,
            deposit_address,
        }
    }

    pub fn settings(&self) -> &PaymentSettings {
        &self.settings
    }

    fn validate_amount(&self, amount: Decimal) -> AppResult<()> {
        let too_precise = amount.normalize().scale() > self.network.token_decimals();
        if amount <= Decimal::ZERO || amount > self.settings.max_amount || too_precise {
            return Err(PaymentError::InvalidAmount {
                amount: amount.to_string(),
                ceiling: self.settings.max_amount.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Persist a new pending payment for an active merchant
    #[instrument(skip(self, request), fields(amount = %request.amount))]
    pub async fn create(
        &self,
        merchant_id: Uuid,
        request: CreatePaymentRequest,
    ) -> AppResult<Payment> {
        let merchant = self
            .merchants
            .find_by_id(merchant_id)
            .await?
            .ok_or(PaymentError::MerchantNotFound(merchant_id))?;

        if !merchant.is_active() {
            return Err(PaymentError::MerchantNotActive(merchant_id).into());
        }

        self.validate_amount(request.amount)?;

        let created_at = Utc::now();
        let expires_at = expiry_for(
            created_at,
            request.expires_in,
            self.settings.default_expiry_minutes,
            self.settings.min_expiry_minutes,
            self.settings.max_expiry_minutes,
        )
        .ok_or(PaymentError::InvalidExpiry {
            minutes: request.expires_in.unwrap_or(self.settings.default_expiry_minutes),
            min: self.settings.min_expiry_minutes,
            max: self.settings.max_expiry_minutes,
        })?;

        let payment = self
            .store
            .insert_payment(NewPayment {
                id: Uuid::new_v4(),
                merchant_id,
                external_id: request.external_id,
                amount: request.amount,
                currency: request.currency,
                network: self.network,
                deposit_address: self.deposit_address.clone(),
                description: request.description,
                customer_email: request.customer_email,
                customer_phone: request.customer_phone,
                metadata: request.metadata,
                expires_at,
                created_at,
            })
            .await?;

        info!(
            payment_id = %payment.id,
            merchant_id = %merchant_id,
            "✅ Payment created: {} {} expires {}",
            payment.amount,
            payment.currency,
            payment.expires_at
        );
        Ok(payment)
    }

    pub async fn get(&self, payment_id: Uuid) -> AppResult<Payment> {
        self.store
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(payment_id).into())
    }

    /// Move a payment to `to`. Requesting the status it already has is a
    /// successful no-op.
    pub async fn transition(&self, payment_id: Uuid, to: PaymentStatus) -> AppResult<Transitioned> {
        let payment = self.get(payment_id).await?;

        if payment.status == to {
            debug!("Payment {} already {}", payment_id, to);
            return Ok(Transitioned {
                payment,
                applied: false,
            });
        }

        if !payment.status.can_transition_to(to) {
            return Err(PaymentError::InvalidTransition {
                id: payment_id,
                from: payment.status,
                to,
            }
            .into());
        }

        let updated = self
            .store
            .update_payment_status(payment_id, payment.status, to, Utc::now())
            .await?;

        // Lost the race: judge against whatever won
        let current = self.get(payment_id).await?;
        if !updated {
            if current.status == to {
                return Ok(Transitioned {
                    payment: current,
                    applied: false,
                });
            }
            warn!(
                "Payment {} moved to {} before {} could apply",
                payment_id, current.status, to
            );
            return Err(PaymentError::InvalidTransition {
                id: payment_id,
                from: current.status,
                to,
            }
            .into());
        }

        info!(payment_id = %payment_id, "Payment {} -> {}", payment.status, to);
        Ok(Transitioned {
            payment: current,
            applied: true,
        })
    }

    /// Page through a merchant's payments. `page` is 1-based.
    pub async fn list_for_merchant(
        &self,
        merchant_id: Uuid,
        page: u32,
        limit: u32,
    ) -> AppResult<PaymentPage> {
        if page == 0 || limit == 0 || limit > MAX_PAGE_SIZE {
            return Err(AppError::InvalidInput(format!(
                "page must be at least 1 and limit between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }

        self.merchants
            .find_by_id(merchant_id)
            .await?
            .ok_or(PaymentError::MerchantNotFound(merchant_id))?;

        let offset = i64::from(page - 1) * i64::from(limit);
        let payments = self
            .store
            .list_payments_by_merchant(merchant_id, i64::from(limit), offset)
            .await?;
        let total = self.store.count_payments_by_merchant(merchant_id).await?;

        Ok(PaymentPage {
            payments,
            total,
            page,
            limit,
        })
    }

    /// Cancel a pending payment on behalf of its owning merchant
    pub async fn cancel(&self, merchant_id: Uuid, payment_id: Uuid) -> AppResult<Transitioned> {
        let payment = self.get(payment_id).await?;
        if payment.merchant_id != merchant_id {
            return Err(PaymentError::NotFound(payment_id).into());
        }
        self.transition(payment_id, PaymentStatus::Cancelled).await
    }

    /// Expire every pending payment past its expiry in one guarded pass
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> AppResult<Vec<Payment>> {
        let expired = self.store.expire_pending_payments(now).await?;
        if !expired.is_empty() {
            info!("🗑️  Expired {} pending payments", expired.len());
        }
        Ok(expired)
    }
}

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{EntitlementError, StoreResult};

use super::catalog::CreditType;
use super::models::{AccountId, CreditBatch, CreditOrigin, NewCreditBatch};
use super::period::Clock;
use super::store::CreditStore;

/// Longest expiry a single grant may carry.
pub const MAX_GRANT_EXPIRY_DAYS: i64 = 3650;

/// Request to add a batch of credits, as sent by the payment webhook.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreditGrant {
    pub account_id: AccountId,
    pub credit_type: CreditType,
    pub quantity: i64,
    pub expires_in_days: i64,
    pub origin: CreditOrigin,
    #[serde(default)]
    pub unit_price: Option<i64>,
}

impl CreditGrant {
    pub fn into_new_batch(self, now: DateTime<Utc>) -> Result<NewCreditBatch, EntitlementError> {
        if self.quantity <= 0 {
            return Err(EntitlementError::InvalidGrant(format!(
                "quantity must be positive, got {}",
                self.quantity
            )));
        }
        if self.expires_in_days <= 0 {
            return Err(EntitlementError::InvalidGrant(format!(
                "expiry must be at least one day, got {}",
                self.expires_in_days
            )));
        }
        if self.expires_in_days > MAX_GRANT_EXPIRY_DAYS {
            return Err(EntitlementError::InvalidGrant(format!(
                "expiry cannot exceed {MAX_GRANT_EXPIRY_DAYS} days, got {}",
                self.expires_in_days
            )));
        }
        if matches!(self.unit_price, Some(price) if price < 0) {
            return Err(EntitlementError::InvalidGrant(
                "unit price cannot be negative".to_string(),
            ));
        }

        let expires_at = now
            .checked_add_signed(Duration::days(self.expires_in_days))
            .ok_or_else(|| {
                EntitlementError::InvalidGrant(format!(
                    "expiry of {} days is out of range",
                    self.expires_in_days
                ))
            })?;

        Ok(NewCreditBatch {
            account_id: self.account_id,
            credit_type: self.credit_type,
            quantity: self.quantity,
            expires_at,
            origin: self.origin,
            unit_price: self.unit_price,
        })
    }
}

/// key: credit-ledger -> batches consumed soonest-expiry first
#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn CreditStore>,
    clock: Arc<dyn Clock>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn CreditStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn available_balance(
        &self,
        account_id: AccountId,
        credit_type: CreditType,
    ) -> StoreResult<i64> {
        let batches = self
            .store
            .consumable_batches(account_id, credit_type, self.clock.now())
            .await?;
        Ok(batches.iter().map(CreditBatch::remaining).sum())
    }

    /// Draws one unit and returns the batch it came from, or `None` when nothing is left.
    pub async fn consume_one(
        &self,
        account_id: AccountId,
        credit_type: CreditType,
    ) -> StoreResult<Option<CreditBatch>> {
        let batch = self
            .store
            .consume_one(account_id, credit_type, self.clock.now())
            .await?;
        if let Some(batch) = &batch {
            debug!(
                %account_id,
                %credit_type,
                batch = %batch.id,
                remaining = batch.remaining(),
                "credit consumed"
            );
        }
        Ok(batch)
    }

    pub async fn grant(&self, grant: CreditGrant) -> Result<CreditBatch, EntitlementError> {
        let now = self.clock.now();
        let batch = self
            .store
            .insert_batch(grant.into_new_batch(now)?, now)
            .await?;

        info!(
            account_id = %batch.account_id,
            credit_type = %batch.credit_type,
            batch = %batch.id,
            quantity = batch.quantity,
            origin = batch.origin.as_str(),
            expires_at = %batch.expires_at,
            "credit batch granted"
        );
        Ok(batch)
    }

    /// Best effort: partially consumed batches are kept for audit.
    pub async fn cleanup_expired(&self) -> StoreResult<u64> {
        let removed = self.store.delete_expired_unused(self.clock.now()).await?;
        if removed > 0 {
            info!(removed, "removed expired unused credit batches");
        }
        Ok(removed)
    }

    pub async fn batches(&self, account_id: AccountId) -> StoreResult<Vec<CreditBatch>> {
        self.store.batches_for(account_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn grant(quantity: i64, expires_in_days: i64) -> CreditGrant {
        CreditGrant {
            account_id: Uuid::new_v4(),
            credit_type: CreditType::Normal,
            quantity,
            expires_in_days,
            origin: CreditOrigin::Purchase,
            unit_price: Some(500),
        }
    }

    #[test]
    fn grant_sets_expiry_from_now() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let batch = grant(3, 30).into_new_batch(now).unwrap();
        assert_eq!(batch.expires_at, now + Duration::days(30));
        assert_eq!(batch.quantity, 3);
    }

    #[test]
    fn grant_rejects_empty_or_instantly_expired_batches() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        assert!(matches!(
            grant(0, 30).into_new_batch(now),
            Err(EntitlementError::InvalidGrant(_))
        ));
        assert!(matches!(
            grant(2, 0).into_new_batch(now),
            Err(EntitlementError::InvalidGrant(_))
        ));
    }

    #[test]
    fn grant_rejects_expiry_beyond_the_cap() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        assert!(grant(1, MAX_GRANT_EXPIRY_DAYS).into_new_batch(now).is_ok());
        for days in [MAX_GRANT_EXPIRY_DAYS + 1, 200_000_000, i64::MAX] {
            assert!(matches!(
                grant(1, days).into_new_batch(now),
                Err(EntitlementError::InvalidGrant(_))
            ));
        }
    }
}

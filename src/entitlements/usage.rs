use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{EntitlementError, StoreResult};

use super::catalog::{Metric, Plan, PlanCatalog, Quota};
use super::models::{AccountId, CounterState, UsagePeriod, UsageSnapshot};
use super::period::{BillingPeriod, Clock};
use super::store::{AccountDirectory, UsageStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementOutcome {
    pub applied: bool,
    pub usage: UsageSnapshot,
}

/// key: usage-counter-store -> monthly counters with an atomic increment-if-under
#[derive(Clone)]
pub struct UsageCounterStore {
    store: Arc<dyn UsageStore>,
    accounts: Arc<dyn AccountDirectory>,
    catalog: Arc<PlanCatalog>,
    clock: Arc<dyn Clock>,
}

impl UsageCounterStore {
    pub fn new(
        store: Arc<dyn UsageStore>,
        accounts: Arc<dyn AccountDirectory>,
        catalog: Arc<PlanCatalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            accounts,
            catalog,
            clock,
        }
    }

    async fn limit_for(&self, account_id: AccountId, metric: Metric) -> StoreResult<Quota> {
        let account = self.accounts.account(account_id).await?;
        Ok(account
            .as_ref()
            .and_then(|account| self.catalog.resolve(account))
            .map(|plan| plan.quota(metric))
            .unwrap_or(Quota::Limited(0)))
    }

    /// Live counter for the current period. Accounts without a resolvable plan
    /// report a zero limit.
    pub async fn current_usage(
        &self,
        account_id: AccountId,
        metric: Metric,
    ) -> Result<UsageSnapshot, EntitlementError> {
        let limit = self.limit_for(account_id, metric).await?;
        let now = self.clock.now();
        let period = self
            .store
            .current_period(account_id, now, BillingPeriod::containing(now))
            .await?;

        Ok(UsageSnapshot::new(
            metric,
            limit,
            CounterState {
                period_start: period.period_start,
                period_end: period.period_end,
                used: period.used(metric),
            },
        ))
    }

    pub async fn try_increment(
        &self,
        account_id: AccountId,
        metric: Metric,
    ) -> StoreResult<IncrementOutcome> {
        let limit = self.limit_for(account_id, metric).await?;
        self.increment_under(account_id, metric, limit).await
    }

    /// Same as [`try_increment`](Self::try_increment) for a caller that already resolved the plan.
    pub async fn try_increment_for_plan(
        &self,
        account_id: AccountId,
        plan: &Plan,
        metric: Metric,
    ) -> StoreResult<IncrementOutcome> {
        self.increment_under(account_id, metric, plan.quota(metric))
            .await
    }

    async fn increment_under(
        &self,
        account_id: AccountId,
        metric: Metric,
        limit: Quota,
    ) -> StoreResult<IncrementOutcome> {
        let now = self.clock.now();
        let update = self
            .store
            .increment_if_under(account_id, metric, now, BillingPeriod::containing(now), limit)
            .await?;

        debug!(
            %account_id,
            %metric,
            used = update.counter.used,
            limit = limit.as_raw(),
            applied = update.applied,
            "usage increment"
        );

        Ok(IncrementOutcome {
            applied: update.applied,
            usage: UsageSnapshot::new(metric, limit, update.counter),
        })
    }

    /// Starts a fresh period at `now` so the new plan's quotas apply immediately.
    /// The superseded period stays in history.
    pub async fn reset_for_plan_change(
        &self,
        account_id: AccountId,
        new_plan_id: &str,
    ) -> Result<UsagePeriod, EntitlementError> {
        if self.catalog.plan(new_plan_id).is_none() {
            return Err(EntitlementError::UnknownPlan(new_plan_id.to_string()));
        }

        let now = self.clock.now();
        let period_end = BillingPeriod::containing(now).end;
        let period = self
            .store
            .supersede_period(account_id, now, period_end)
            .await?;

        info!(
            %account_id,
            plan = %new_plan_id,
            period_start = %period.period_start,
            period_end = %period.period_end,
            "usage period reset after plan change"
        );
        Ok(period)
    }

    pub async fn history(&self, account_id: AccountId) -> StoreResult<Vec<UsagePeriod>> {
        self.store.usage_history(account_id).await
    }
}

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{EntitlementError, StoreResult};

use super::catalog::{CreditType, Metric, PlanCatalog, Quota};
use super::ledger::CreditLedger;
use super::models::{
    AccountId, Decision, Denial, DenialReason, Remediation, UsagePeriod, UsageSnapshot,
};
use super::store::AccountDirectory;
use super::usage::UsageCounterStore;

/// Bounded retry for storage conflicts, doubling the backoff after each attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(25),
        }
    }
}

impl RetryPolicy {
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_backoff.saturating_mul(1u32 << exponent)
    }
}

/// key: entitlement-resolver -> quota first, then credit, otherwise a structured denial
///
/// Consumption is charged on attempt. A downstream failure after an allowed
/// decision does not refund the quota unit or credit.
#[derive(Clone)]
pub struct EntitlementResolver {
    accounts: Arc<dyn AccountDirectory>,
    usage: UsageCounterStore,
    ledger: CreditLedger,
    catalog: Arc<PlanCatalog>,
    retry: RetryPolicy,
}

impl EntitlementResolver {
    pub fn new(
        accounts: Arc<dyn AccountDirectory>,
        usage: UsageCounterStore,
        ledger: CreditLedger,
        catalog: Arc<PlanCatalog>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            accounts,
            usage,
            ledger,
            catalog,
            retry,
        }
    }

    /// Decides whether the account may perform `metric` and commits the unit it
    /// spends. Storage failures are errors, never an allowed decision.
    pub async fn authorize(
        &self,
        account_id: AccountId,
        metric: Metric,
        credit_type: Option<CreditType>,
    ) -> Result<Decision, EntitlementError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.authorize_once(account_id, metric, credit_type).await {
                Ok(decision) => {
                    log_decision(account_id, metric, &decision);
                    return Ok(decision);
                }
                Err(err) if err.is_conflict() && attempt < max_attempts => {
                    let backoff = self.retry.backoff_for(attempt);
                    warn!(
                        %account_id,
                        %metric,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "entitlement storage conflict, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) if err.is_conflict() => {
                    return Err(EntitlementError::RetriesExhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn authorize_once(
        &self,
        account_id: AccountId,
        metric: Metric,
        credit_type: Option<CreditType>,
    ) -> StoreResult<Decision> {
        let account = self.accounts.account(account_id).await?;
        let Some(plan) = account
            .as_ref()
            .and_then(|account| self.catalog.resolve(account))
        else {
            return Ok(Decision::Denied(Denial {
                reason: DenialReason::AccountNotEligible,
                metric,
                usage: None,
                required_credit_type: credit_type,
                credit_price: credit_type.and_then(|ct| self.catalog.price_for(ct).cloned()),
                remediation: vec![Remediation::Upgrade],
            }));
        };

        let outcome = self
            .usage
            .try_increment_for_plan(account_id, plan, metric)
            .await?;
        if outcome.applied {
            return Ok(Decision::AllowedByQuota {
                usage: outcome.usage,
            });
        }

        let usage = outcome.usage;
        let Some(credit_type) = credit_type else {
            return Ok(Decision::Denied(self.denial(
                DenialReason::QuotaExhaustedNoPlan,
                metric,
                usage,
                None,
            )));
        };

        match self.ledger.consume_one(account_id, credit_type).await? {
            Some(batch) => Ok(Decision::AllowedByCredit {
                usage,
                credit_type,
                batch_id: batch.id,
                credits_remaining: batch.remaining(),
            }),
            None => Ok(Decision::Denied(self.denial(
                DenialReason::QuotaExhaustedNeedsCredit,
                metric,
                usage,
                Some(credit_type),
            ))),
        }
    }

    fn denial(
        &self,
        reason: DenialReason,
        metric: Metric,
        usage: UsageSnapshot,
        credit_type: Option<CreditType>,
    ) -> Denial {
        let mut remediation = Vec::new();
        if credit_type.is_some() {
            remediation.push(Remediation::PurchaseCredit);
        }
        if credit_type.is_none() || self.catalog.has_upgrade_for(metric, usage.limit) {
            remediation.push(Remediation::Upgrade);
        }
        if matches!(usage.limit, Quota::Limited(limit) if limit > 0) {
            remediation.push(Remediation::WaitForReset);
        }

        Denial {
            reason,
            metric,
            credit_price: credit_type.and_then(|ct| self.catalog.price_for(ct).cloned()),
            required_credit_type: credit_type,
            usage: Some(usage),
            remediation,
        }
    }

    /// Plan-change hook: counters restart at zero under the new plan.
    pub async fn plan_changed(
        &self,
        account_id: AccountId,
        new_plan_id: &str,
    ) -> Result<UsagePeriod, EntitlementError> {
        self.usage
            .reset_for_plan_change(account_id, new_plan_id)
            .await
    }
}

fn log_decision(account_id: AccountId, metric: Metric, decision: &Decision) {
    match decision {
        Decision::AllowedByQuota { usage } => info!(
            %account_id,
            %metric,
            used = usage.used,
            "authorized by quota"
        ),
        Decision::AllowedByCredit {
            credit_type,
            batch_id,
            ..
        } => info!(
            %account_id,
            %metric,
            %credit_type,
            batch = %batch_id,
            "authorized by credit"
        ),
        Decision::Denied(denial) => debug!(
            %account_id,
            %metric,
            reason = denial.reason.code(),
            "authorization denied"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_backoff: Duration::from_millis(10),
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(20));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(40));
    }
}

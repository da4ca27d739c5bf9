use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::catalog::{CreditPrice, CreditType, Metric, PlanCatalog, Quota};

pub type AccountId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Canceled,
    PastDue,
    Incomplete,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Incomplete => "incomplete",
        }
    }

    /// Unrecognised provider states are treated as not paid for.
    pub fn from_str(value: &str) -> Self {
        match value {
            "active" => SubscriptionStatus::Active,
            "canceled" | "cancelled" => SubscriptionStatus::Canceled,
            "past_due" => SubscriptionStatus::PastDue,
            _ => SubscriptionStatus::Incomplete,
        }
    }
}

/// key: account -> read-only view owned by the auth collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub plan_id: Option<String>,
    pub subscription_status: SubscriptionStatus,
}

impl Account {
    /// Active subscription on a plan the catalog marks as paid.
    pub fn is_paid_active(&self, catalog: &PlanCatalog) -> bool {
        self.subscription_status == SubscriptionStatus::Active
            && self
                .plan_id
                .as_deref()
                .and_then(|id| catalog.plan(id))
                .map_or(false, |plan| plan.paid)
    }
}

/// key: usage-period -> one row per account and billing window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsagePeriod {
    pub id: Uuid,
    pub account_id: AccountId,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub counters: BTreeMap<Metric, i64>,
    pub created_at: DateTime<Utc>,
}

impl UsagePeriod {
    pub fn used(&self, metric: Metric) -> i64 {
        self.counters.get(&metric).copied().unwrap_or(0)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.period_start <= at && at < self.period_end
    }
}

/// Counter value for one metric inside one period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterState {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub used: i64,
}

/// Result of a conditional increment. `applied` is false when the limit was reached,
/// in which case `counter` carries the untouched value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterUpdate {
    pub counter: CounterState,
    pub applied: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub metric: Metric,
    pub used: i64,
    pub limit: Quota,
    pub remaining: Option<i64>,
    pub period_start: DateTime<Utc>,
    pub resets_at: DateTime<Utc>,
}

impl UsageSnapshot {
    pub fn new(metric: Metric, limit: Quota, counter: CounterState) -> Self {
        Self {
            metric,
            used: counter.used,
            limit,
            remaining: limit.remaining(counter.used),
            period_start: counter.period_start,
            resets_at: counter.period_end,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditOrigin {
    Purchase,
    ReferralGrant,
}

impl CreditOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditOrigin::Purchase => "purchase",
            CreditOrigin::ReferralGrant => "referral_grant",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "purchase" => Some(CreditOrigin::Purchase),
            "referral_grant" => Some(CreditOrigin::ReferralGrant),
            _ => None,
        }
    }
}

/// key: credit-batch -> one purchase or grant, consumed one unit at a time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreditBatch {
    pub id: Uuid,
    pub account_id: AccountId,
    pub credit_type: CreditType,
    pub quantity: i64,
    pub consumed: i64,
    pub expires_at: DateTime<Utc>,
    pub origin: CreditOrigin,
    pub unit_price: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl CreditBatch {
    pub fn remaining(&self) -> i64 {
        (self.quantity - self.consumed).max(0)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_consumable(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && self.consumed < self.quantity
    }
}

/// Batch about to be written; `consumed` always starts at zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCreditBatch {
    pub account_id: AccountId,
    pub credit_type: CreditType,
    pub quantity: i64,
    pub expires_at: DateTime<Utc>,
    pub origin: CreditOrigin,
    pub unit_price: Option<i64>,
}

impl NewCreditBatch {
    pub fn into_batch(self, id: Uuid, created_at: DateTime<Utc>) -> CreditBatch {
        CreditBatch {
            id,
            account_id: self.account_id,
            credit_type: self.credit_type,
            quantity: self.quantity,
            consumed: 0,
            expires_at: self.expires_at,
            origin: self.origin,
            unit_price: self.unit_price,
            created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralStatus {
    Pending,
    Completed,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferralEvent {
    Redeemed,
    Lapsed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("referral code cannot go from {from:?} on {event:?}")]
pub struct InvalidTransition {
    pub from: ReferralStatus,
    pub event: ReferralEvent,
}

impl ReferralStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferralStatus::Pending => "pending",
            ReferralStatus::Completed => "completed",
            ReferralStatus::Expired => "expired",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ReferralStatus::Pending),
            "completed" => Some(ReferralStatus::Completed),
            "expired" => Some(ReferralStatus::Expired),
            _ => None,
        }
    }

    /// pending -> completed on redemption, pending -> expired once lapsed. Terminal otherwise.
    pub fn transition(self, event: ReferralEvent) -> Result<ReferralStatus, InvalidTransition> {
        match (self, event) {
            (ReferralStatus::Pending, ReferralEvent::Redeemed) => Ok(ReferralStatus::Completed),
            (ReferralStatus::Pending, ReferralEvent::Lapsed) => Ok(ReferralStatus::Expired),
            (from, event) => Err(InvalidTransition { from, event }),
        }
    }
}

/// key: referral-code -> single-use, time-boxed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferralCode {
    pub code: String,
    pub referrer_id: AccountId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ReferralStatus,
    pub referee_id: Option<AccountId>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ReferralCode {
    pub fn new(
        code: String,
        referrer_id: AccountId,
        created_at: DateTime<Utc>,
        validity: Duration,
    ) -> Self {
        Self {
            code,
            referrer_id,
            created_at,
            expires_at: created_at + validity,
            status: ReferralStatus::Pending,
            referee_id: None,
            completed_at: None,
        }
    }

    pub fn has_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status == ReferralStatus::Pending && !self.has_lapsed(now)
    }

    pub fn redeem(
        &mut self,
        referee_id: AccountId,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.status = self.status.transition(ReferralEvent::Redeemed)?;
        self.referee_id = Some(referee_id);
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn lapse(&mut self) -> Result<(), InvalidTransition> {
        self.status = self.status.transition(ReferralEvent::Lapsed)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    QuotaExhaustedNeedsCredit,
    QuotaExhaustedNoPlan,
    AccountNotEligible,
}

impl DenialReason {
    pub fn code(&self) -> &'static str {
        match self {
            DenialReason::QuotaExhaustedNeedsCredit => "quota_exhausted_needs_credit",
            DenialReason::QuotaExhaustedNoPlan => "quota_exhausted_no_plan",
            DenialReason::AccountNotEligible => "account_not_eligible",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Remediation {
    Upgrade,
    PurchaseCredit,
    WaitForReset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Denial {
    pub reason: DenialReason,
    pub metric: Metric,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_credit_type: Option<CreditType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credit_price: Option<CreditPrice>,
    pub remediation: Vec<Remediation>,
}

/// key: entitlement-decision -> transient, never persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Decision {
    AllowedByQuota {
        usage: UsageSnapshot,
    },
    AllowedByCredit {
        usage: UsageSnapshot,
        credit_type: CreditType,
        batch_id: Uuid,
        /// Units left in the batch the credit was drawn from.
        credits_remaining: i64,
    },
    Denied(Denial),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Decision::Denied(_))
    }

    pub fn denial(&self) -> Option<&Denial> {
        match self {
            Decision::Denied(denial) => Some(denial),
            _ => None,
        }
    }

    pub fn usage(&self) -> Option<&UsageSnapshot> {
        match self {
            Decision::AllowedByQuota { usage } | Decision::AllowedByCredit { usage, .. } => {
                Some(usage)
            }
            Decision::Denied(denial) => denial.usage.as_ref(),
        }
    }
}

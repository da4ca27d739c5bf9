//! Storage seams. Every mutating method here is a single atomic step against the
//! backing store; callers never hold a lock across two of them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreResult;

use super::catalog::{CreditType, Metric, Quota};
use super::models::{
    Account, AccountId, CounterUpdate, CreditBatch, NewCreditBatch, ReferralCode, UsagePeriod,
};
use super::period::BillingPeriod;

/// Read-only view of accounts owned by the authentication collaborator.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn account(&self, account_id: AccountId) -> StoreResult<Option<Account>>;
    async fn completed_analyses(&self, account_id: AccountId) -> StoreResult<i64>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Period containing `now`, materialising `fresh` with zeroed counters when none does.
    async fn current_period(
        &self,
        account_id: AccountId,
        now: DateTime<Utc>,
        fresh: BillingPeriod,
    ) -> StoreResult<UsagePeriod>;

    /// Increments `metric` by one only while `limit` allows it.
    async fn increment_if_under(
        &self,
        account_id: AccountId,
        metric: Metric,
        now: DateTime<Utc>,
        fresh: BillingPeriod,
        limit: Quota,
    ) -> StoreResult<CounterUpdate>;

    /// Closes the period containing `now` at `now` and opens `[now, period_end)` with zeroed counters.
    async fn supersede_period(
        &self,
        account_id: AccountId,
        now: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> StoreResult<UsagePeriod>;

    async fn usage_history(&self, account_id: AccountId) -> StoreResult<Vec<UsagePeriod>>;
}

#[async_trait]
pub trait CreditStore: Send + Sync {
    async fn insert_batch(&self, batch: NewCreditBatch, now: DateTime<Utc>)
        -> StoreResult<CreditBatch>;

    /// Unexpired batches with remaining units, soonest expiry first.
    async fn consumable_batches(
        &self,
        account_id: AccountId,
        credit_type: CreditType,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<CreditBatch>>;

    /// Consumes one unit from the soonest-expiring consumable batch and returns it.
    async fn consume_one(
        &self,
        account_id: AccountId,
        credit_type: CreditType,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<CreditBatch>>;

    /// Removes expired batches that were never drawn from.
    async fn delete_expired_unused(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    async fn batches_for(&self, account_id: AccountId) -> StoreResult<Vec<CreditBatch>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertCodeOutcome {
    Inserted(ReferralCode),
    /// The random token collided with an existing code.
    CodeTaken,
    /// Another request minted a code for this referrer first.
    ReferrerHasActive(ReferralCode),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferralCompletion {
    pub code: ReferralCode,
    pub grants: Vec<CreditBatch>,
}

#[async_trait]
pub trait ReferralStore: Send + Sync {
    async fn active_code_for(
        &self,
        referrer_id: AccountId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ReferralCode>>;

    async fn insert_code(&self, code: ReferralCode) -> StoreResult<InsertCodeOutcome>;

    async fn find_code(&self, code: &str) -> StoreResult<Option<ReferralCode>>;

    /// Moves lapsed pending codes to expired, optionally only for one referrer.
    async fn expire_lapsed(
        &self,
        now: DateTime<Utc>,
        referrer_id: Option<AccountId>,
    ) -> StoreResult<u64>;

    /// Completes the code and writes every grant as one unit. Returns `None`, with
    /// nothing written, when the code is no longer pending and unexpired.
    async fn complete_with_grants(
        &self,
        code: &str,
        referee_id: AccountId,
        now: DateTime<Utc>,
        grants: Vec<NewCreditBatch>,
    ) -> StoreResult<Option<ReferralCompletion>>;
}

pub trait EntitlementStore: AccountDirectory + UsageStore + CreditStore + ReferralStore {}

impl<T> EntitlementStore for T where T: AccountDirectory + UsageStore + CreditStore + ReferralStore
{}

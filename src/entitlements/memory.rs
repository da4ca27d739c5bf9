use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreResult;

use super::catalog::{CreditType, Metric, Quota};
use super::models::{
    Account, AccountId, CounterState, CounterUpdate, CreditBatch, NewCreditBatch, ReferralCode,
    ReferralStatus, UsagePeriod,
};
use super::period::BillingPeriod;
use super::store::{
    AccountDirectory, CreditStore, InsertCodeOutcome, ReferralCompletion, ReferralStore,
    UsageStore,
};

#[derive(Debug, Default)]
struct MemoryState {
    accounts: HashMap<AccountId, Account>,
    completed_analyses: HashMap<AccountId, i64>,
    periods: Vec<UsagePeriod>,
    batches: Vec<CreditBatch>,
    codes: HashMap<String, ReferralCode>,
}

impl MemoryState {
    fn period_index(
        &mut self,
        account_id: AccountId,
        now: DateTime<Utc>,
        fresh: BillingPeriod,
    ) -> usize {
        let existing = self
            .periods
            .iter()
            .enumerate()
            .filter(|(_, period)| period.account_id == account_id && period.contains(now))
            .max_by_key(|(_, period)| period.period_start)
            .map(|(idx, _)| idx);

        if let Some(idx) = existing {
            return idx;
        }

        self.periods.push(UsagePeriod {
            id: Uuid::new_v4(),
            account_id,
            period_start: fresh.start,
            period_end: fresh.end,
            counters: BTreeMap::new(),
            created_at: now,
        });
        self.periods.len() - 1
    }

    fn next_consumable(
        &self,
        account_id: AccountId,
        credit_type: CreditType,
        now: DateTime<Utc>,
    ) -> Option<usize> {
        self.batches
            .iter()
            .enumerate()
            .filter(|(_, batch)| {
                batch.account_id == account_id
                    && batch.credit_type == credit_type
                    && batch.is_consumable(now)
            })
            .min_by_key(|(_, batch)| (batch.expires_at, batch.created_at))
            .map(|(idx, _)| idx)
    }
}

/// Process-local store. Every operation runs under one lock, which makes each
/// primitive atomic the same way a row-level conditional update is in Postgres.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert_account(&self, account: Account) {
        self.state
            .lock()
            .await
            .accounts
            .insert(account.id, account);
    }

    pub async fn set_completed_analyses(&self, account_id: AccountId, count: i64) {
        self.state
            .lock()
            .await
            .completed_analyses
            .insert(account_id, count);
    }

    pub async fn record_completed_analysis(&self, account_id: AccountId) {
        *self
            .state
            .lock()
            .await
            .completed_analyses
            .entry(account_id)
            .or_insert(0) += 1;
    }
}

#[async_trait]
impl AccountDirectory for InMemoryStore {
    async fn account(&self, account_id: AccountId) -> StoreResult<Option<Account>> {
        Ok(self.state.lock().await.accounts.get(&account_id).cloned())
    }

    async fn completed_analyses(&self, account_id: AccountId) -> StoreResult<i64> {
        Ok(self
            .state
            .lock()
            .await
            .completed_analyses
            .get(&account_id)
            .copied()
            .unwrap_or(0))
    }
}

#[async_trait]
impl UsageStore for InMemoryStore {
    async fn current_period(
        &self,
        account_id: AccountId,
        now: DateTime<Utc>,
        fresh: BillingPeriod,
    ) -> StoreResult<UsagePeriod> {
        let mut state = self.state.lock().await;
        let idx = state.period_index(account_id, now, fresh);
        Ok(state.periods[idx].clone())
    }

    async fn increment_if_under(
        &self,
        account_id: AccountId,
        metric: Metric,
        now: DateTime<Utc>,
        fresh: BillingPeriod,
        limit: Quota,
    ) -> StoreResult<CounterUpdate> {
        let mut state = self.state.lock().await;
        let idx = state.period_index(account_id, now, fresh);
        let period = &mut state.periods[idx];
        let used = period.used(metric);
        let applied = limit.allows(used);
        let used = if applied {
            period.counters.insert(metric, used + 1);
            used + 1
        } else {
            used
        };

        Ok(CounterUpdate {
            counter: CounterState {
                period_start: period.period_start,
                period_end: period.period_end,
                used,
            },
            applied,
        })
    }

    async fn supersede_period(
        &self,
        account_id: AccountId,
        now: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> StoreResult<UsagePeriod> {
        let mut state = self.state.lock().await;
        let current = state
            .periods
            .iter()
            .enumerate()
            .filter(|(_, period)| period.account_id == account_id && period.contains(now))
            .max_by_key(|(_, period)| period.period_start)
            .map(|(idx, _)| idx);

        if let Some(idx) = current {
            let period = &mut state.periods[idx];
            if period.period_start == now {
                // Opened at this very instant; nothing to keep for history.
                period.counters.clear();
                period.period_end = period_end;
                return Ok(period.clone());
            }
            period.period_end = now;
        }

        let replacement = UsagePeriod {
            id: Uuid::new_v4(),
            account_id,
            period_start: now,
            period_end,
            counters: BTreeMap::new(),
            created_at: now,
        };
        state.periods.push(replacement.clone());
        Ok(replacement)
    }

    async fn usage_history(&self, account_id: AccountId) -> StoreResult<Vec<UsagePeriod>> {
        let state = self.state.lock().await;
        let mut periods: Vec<UsagePeriod> = state
            .periods
            .iter()
            .filter(|period| period.account_id == account_id)
            .cloned()
            .collect();
        periods.sort_by_key(|period| period.period_start);
        Ok(periods)
    }
}

#[async_trait]
impl CreditStore for InMemoryStore {
    async fn insert_batch(
        &self,
        batch: NewCreditBatch,
        now: DateTime<Utc>,
    ) -> StoreResult<CreditBatch> {
        let batch = batch.into_batch(Uuid::new_v4(), now);
        self.state.lock().await.batches.push(batch.clone());
        Ok(batch)
    }

    async fn consumable_batches(
        &self,
        account_id: AccountId,
        credit_type: CreditType,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<CreditBatch>> {
        let state = self.state.lock().await;
        let mut batches: Vec<CreditBatch> = state
            .batches
            .iter()
            .filter(|batch| {
                batch.account_id == account_id
                    && batch.credit_type == credit_type
                    && batch.is_consumable(now)
            })
            .cloned()
            .collect();
        batches.sort_by_key(|batch| (batch.expires_at, batch.created_at));
        Ok(batches)
    }

    async fn consume_one(
        &self,
        account_id: AccountId,
        credit_type: CreditType,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<CreditBatch>> {
        let mut state = self.state.lock().await;
        let Some(idx) = state.next_consumable(account_id, credit_type, now) else {
            return Ok(None);
        };
        let batch = &mut state.batches[idx];
        batch.consumed += 1;
        Ok(Some(batch.clone()))
    }

    async fn delete_expired_unused(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.batches.len();
        state
            .batches
            .retain(|batch| !(batch.is_expired(now) && batch.consumed == 0));
        Ok((before - state.batches.len()) as u64)
    }

    async fn batches_for(&self, account_id: AccountId) -> StoreResult<Vec<CreditBatch>> {
        let state = self.state.lock().await;
        Ok(state
            .batches
            .iter()
            .filter(|batch| batch.account_id == account_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ReferralStore for InMemoryStore {
    async fn active_code_for(
        &self,
        referrer_id: AccountId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ReferralCode>> {
        let state = self.state.lock().await;
        Ok(state
            .codes
            .values()
            .find(|code| code.referrer_id == referrer_id && code.is_active(now))
            .cloned())
    }

    async fn insert_code(&self, code: ReferralCode) -> StoreResult<InsertCodeOutcome> {
        let mut state = self.state.lock().await;
        if state.codes.contains_key(&code.code) {
            return Ok(InsertCodeOutcome::CodeTaken);
        }
        if let Some(existing) = state.codes.values().find(|existing| {
            existing.referrer_id == code.referrer_id && existing.status == ReferralStatus::Pending
        }) {
            return Ok(InsertCodeOutcome::ReferrerHasActive(existing.clone()));
        }
        state.codes.insert(code.code.clone(), code.clone());
        Ok(InsertCodeOutcome::Inserted(code))
    }

    async fn find_code(&self, code: &str) -> StoreResult<Option<ReferralCode>> {
        Ok(self.state.lock().await.codes.get(code).cloned())
    }

    async fn expire_lapsed(
        &self,
        now: DateTime<Utc>,
        referrer_id: Option<AccountId>,
    ) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let mut expired = 0;
        for code in state.codes.values_mut() {
            if referrer_id.map_or(false, |referrer| referrer != code.referrer_id) {
                continue;
            }
            if code.status == ReferralStatus::Pending && code.has_lapsed(now) && code.lapse().is_ok()
            {
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn complete_with_grants(
        &self,
        code: &str,
        referee_id: AccountId,
        now: DateTime<Utc>,
        grants: Vec<NewCreditBatch>,
    ) -> StoreResult<Option<ReferralCompletion>> {
        let mut state = self.state.lock().await;
        let Some(record) = state.codes.get_mut(code) else {
            return Ok(None);
        };
        if !record.is_active(now) || record.redeem(referee_id, now).is_err() {
            return Ok(None);
        }
        let completed = record.clone();

        let grants: Vec<CreditBatch> = grants
            .into_iter()
            .map(|grant| grant.into_batch(Uuid::new_v4(), now))
            .collect();
        state.batches.extend(grants.iter().cloned());

        Ok(Some(ReferralCompletion {
            code: completed,
            grants,
        }))
    }
}

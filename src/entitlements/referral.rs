use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand_core::{OsRng, RngCore};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ReferralError, StoreError, StoreResult};

use super::catalog::{CreditType, PlanCatalog};
use super::models::{
    AccountId, CreditBatch, CreditOrigin, NewCreditBatch, ReferralCode, ReferralStatus,
};
use super::period::Clock;
use super::store::{AccountDirectory, InsertCodeOutcome, ReferralStore};

const CODE_ALPHABET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
// Largest multiple of the alphabet size that fits in a byte; keeps the draw uniform.
const CODE_BYTE_CEILING: u8 = 252;

/// Rewards and limits of the referral program.
#[derive(Debug, Clone)]
pub struct ReferralPolicy {
    pub code_validity: Duration,
    pub code_length: usize,
    pub max_mint_attempts: u32,
    pub reward_credit_type: CreditType,
    pub referrer_reward: i64,
    pub referee_reward: i64,
    pub reward_expiry: Duration,
    pub min_completed_analyses: i64,
}

impl Default for ReferralPolicy {
    fn default() -> Self {
        Self {
            code_validity: Duration::days(7),
            code_length: 8,
            max_mint_attempts: 5,
            reward_credit_type: CreditType::Normal,
            referrer_reward: 3,
            referee_reward: 5,
            reward_expiry: Duration::days(90),
            min_completed_analyses: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferralRedemption {
    pub code: ReferralCode,
    pub referrer_grant: CreditBatch,
    pub referee_grant: CreditBatch,
}

/// Uniform random code over `[A-Z0-9]`.
pub fn generate_code(length: usize) -> String {
    let mut code = String::with_capacity(length);
    let mut buf = [0u8; 16];
    while code.len() < length {
        OsRng.fill_bytes(&mut buf);
        for byte in buf {
            if byte >= CODE_BYTE_CEILING {
                continue;
            }
            code.push(CODE_ALPHABET[(byte % 36) as usize] as char);
            if code.len() == length {
                break;
            }
        }
    }
    code
}

fn normalize_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// key: referral-program -> single active code per referrer, dual grant on redemption
#[derive(Clone)]
pub struct ReferralProgram {
    store: Arc<dyn ReferralStore>,
    accounts: Arc<dyn AccountDirectory>,
    catalog: Arc<PlanCatalog>,
    clock: Arc<dyn Clock>,
    policy: ReferralPolicy,
}

impl ReferralProgram {
    pub fn new(
        store: Arc<dyn ReferralStore>,
        accounts: Arc<dyn AccountDirectory>,
        catalog: Arc<PlanCatalog>,
        clock: Arc<dyn Clock>,
        policy: ReferralPolicy,
    ) -> Self {
        Self {
            store,
            accounts,
            catalog,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &ReferralPolicy {
        &self.policy
    }

    /// Returns the referrer's active code, minting one when there is none.
    pub async fn issue(&self, referrer_id: AccountId) -> Result<ReferralCode, ReferralError> {
        let now = self.clock.now();
        self.store.expire_lapsed(now, Some(referrer_id)).await?;

        if let Some(existing) = self.store.active_code_for(referrer_id, now).await? {
            debug!(%referrer_id, code = %existing.code, "returning active referral code");
            return Ok(existing);
        }

        self.ensure_eligible(referrer_id).await?;

        for attempt in 1..=self.policy.max_mint_attempts {
            let candidate = ReferralCode::new(
                generate_code(self.policy.code_length),
                referrer_id,
                now,
                self.policy.code_validity,
            );
            match self.store.insert_code(candidate).await? {
                InsertCodeOutcome::Inserted(code) => {
                    info!(
                        %referrer_id,
                        code = %code.code,
                        expires_at = %code.expires_at,
                        "referral code issued"
                    );
                    return Ok(code);
                }
                InsertCodeOutcome::ReferrerHasActive(code) => return Ok(code),
                InsertCodeOutcome::CodeTaken => {
                    warn!(%referrer_id, attempt, "referral code collision, minting again");
                }
            }
        }

        Err(ReferralError::Storage(StoreError::Conflict(format!(
            "no unique referral code after {} attempts",
            self.policy.max_mint_attempts
        ))))
    }

    pub async fn redeem(
        &self,
        raw_code: &str,
        referee_id: AccountId,
    ) -> Result<ReferralRedemption, ReferralError> {
        let code = normalize_code(raw_code);
        let now = self.clock.now();

        let record = self
            .store
            .find_code(&code)
            .await?
            .ok_or(ReferralError::InvalidCode)?;

        if record.referrer_id == referee_id {
            return Err(ReferralError::SelfReferral);
        }
        match record.status {
            ReferralStatus::Completed => return Err(ReferralError::AlreadyUsed),
            ReferralStatus::Expired => return Err(ReferralError::Expired),
            ReferralStatus::Pending if record.has_lapsed(now) => {
                self.store
                    .expire_lapsed(now, Some(record.referrer_id))
                    .await?;
                return Err(ReferralError::Expired);
            }
            ReferralStatus::Pending => {}
        }

        // Plan and history can change after issuance.
        self.ensure_eligible(record.referrer_id).await?;

        let grants = vec![
            self.reward(record.referrer_id, self.policy.referrer_reward, now),
            self.reward(referee_id, self.policy.referee_reward, now),
        ];
        let Some(completion) = self
            .store
            .complete_with_grants(&code, referee_id, now, grants)
            .await?
        else {
            return Err(self.explain_lost_race(&code, now).await?);
        };

        let mut grants = completion.grants.into_iter();
        let (Some(referrer_grant), Some(referee_grant)) = (grants.next(), grants.next()) else {
            return Err(ReferralError::Storage(StoreError::Corrupt(format!(
                "referral {code} completed without both grants"
            ))));
        };

        info!(
            code = %code,
            referrer_id = %record.referrer_id,
            %referee_id,
            referrer_units = referrer_grant.quantity,
            referee_units = referee_grant.quantity,
            "referral redeemed"
        );

        Ok(ReferralRedemption {
            code: completion.code,
            referrer_grant,
            referee_grant,
        })
    }

    /// Transitions every lapsed pending code to expired.
    pub async fn expire_lapsed(&self) -> StoreResult<u64> {
        self.store.expire_lapsed(self.clock.now(), None).await
    }

    async fn ensure_eligible(&self, referrer_id: AccountId) -> Result<(), ReferralError> {
        let Some(account) = self.accounts.account(referrer_id).await? else {
            return Err(ReferralError::ReferrerIneligible);
        };
        if !account.is_paid_active(&self.catalog) {
            debug!(%referrer_id, "referrer has no active paid plan");
            return Err(ReferralError::ReferrerIneligible);
        }
        let completed = self.accounts.completed_analyses(referrer_id).await?;
        if completed < self.policy.min_completed_analyses {
            debug!(%referrer_id, completed, "referrer has no completed analyses");
            return Err(ReferralError::ReferrerIneligible);
        }
        Ok(())
    }

    fn reward(&self, account_id: AccountId, quantity: i64, now: DateTime<Utc>) -> NewCreditBatch {
        NewCreditBatch {
            account_id,
            credit_type: self.policy.reward_credit_type,
            quantity,
            expires_at: now + self.policy.reward_expiry,
            origin: CreditOrigin::ReferralGrant,
            unit_price: None,
        }
    }

    /// The code left pending between our read and the completion; report why.
    async fn explain_lost_race(
        &self,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<ReferralError, ReferralError> {
        let current = self.store.find_code(code).await?;
        Ok(match current {
            None => ReferralError::InvalidCode,
            Some(record) if record.status == ReferralStatus::Completed => {
                ReferralError::AlreadyUsed
            }
            Some(record) if record.status == ReferralStatus::Expired || record.has_lapsed(now) => {
                ReferralError::Expired
            }
            Some(_) => ReferralError::Storage(StoreError::Conflict(format!(
                "referral {code} changed during redemption"
            ))),
        })
    }
}

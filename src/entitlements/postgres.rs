use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

use super::catalog::{CreditType, Metric, Quota};
use super::models::{
    Account, AccountId, CounterState, CounterUpdate, CreditBatch, CreditOrigin, NewCreditBatch,
    ReferralCode, ReferralStatus, SubscriptionStatus, UsagePeriod,
};
use super::period::BillingPeriod;
use super::store::{
    AccountDirectory, CreditStore, InsertCodeOutcome, ReferralCompletion, ReferralStore,
    UsageStore,
};

const UNIQUE_VIOLATION: &str = "23505";

/// key: entitlement-store-postgres -> conditional updates, one statement per primitive
#[derive(Clone)]
pub struct PgEntitlementStore {
    pool: PgPool,
}

impl PgEntitlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct AccountRow {
    id: Uuid,
    plan_id: Option<String>,
    subscription_status: String,
}

#[derive(Debug, FromRow)]
struct UsagePeriodRow {
    id: Uuid,
    account_id: Uuid,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct CounterRow {
    metric: String,
    used: i64,
}

#[derive(Debug, FromRow)]
struct CreditBatchRow {
    id: Uuid,
    account_id: Uuid,
    credit_type: String,
    quantity: i64,
    consumed: i64,
    expires_at: DateTime<Utc>,
    origin: String,
    unit_price: Option<i64>,
    created_at: DateTime<Utc>,
}

impl TryFrom<CreditBatchRow> for CreditBatch {
    type Error = StoreError;

    fn try_from(row: CreditBatchRow) -> Result<Self, Self::Error> {
        let credit_type = CreditType::from_str(&row.credit_type).ok_or_else(|| {
            StoreError::Corrupt(format!("credit batch {} has type `{}`", row.id, row.credit_type))
        })?;
        let origin = CreditOrigin::from_str(&row.origin).ok_or_else(|| {
            StoreError::Corrupt(format!("credit batch {} has origin `{}`", row.id, row.origin))
        })?;
        Ok(CreditBatch {
            id: row.id,
            account_id: row.account_id,
            credit_type,
            quantity: row.quantity,
            consumed: row.consumed,
            expires_at: row.expires_at,
            origin,
            unit_price: row.unit_price,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ReferralCodeRow {
    code: String,
    referrer_id: Uuid,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    status: String,
    referee_id: Option<Uuid>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ReferralCodeRow> for ReferralCode {
    type Error = StoreError;

    fn try_from(row: ReferralCodeRow) -> Result<Self, Self::Error> {
        let status = ReferralStatus::from_str(&row.status).ok_or_else(|| {
            StoreError::Corrupt(format!("referral code {} has status `{}`", row.code, row.status))
        })?;
        Ok(ReferralCode {
            code: row.code,
            referrer_id: row.referrer_id,
            created_at: row.created_at,
            expires_at: row.expires_at,
            status,
            referee_id: row.referee_id,
            completed_at: row.completed_at,
        })
    }
}

const BATCH_COLUMNS: &str =
    "id, account_id, credit_type, quantity, consumed, expires_at, origin, unit_price, created_at";

const CODE_COLUMNS: &str =
    "code, referrer_id, created_at, expires_at, status, referee_id, completed_at";

fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(UNIQUE_VIOLATION),
        _ => false,
    }
}

async fn find_period_row(
    conn: &mut PgConnection,
    account_id: AccountId,
    now: DateTime<Utc>,
) -> StoreResult<Option<UsagePeriodRow>> {
    let row = sqlx::query_as::<_, UsagePeriodRow>(
        r#"
        SELECT id, account_id, period_start, period_end, created_at
        FROM usage_periods
        WHERE account_id = $1
          AND period_start <= $2
          AND period_end > $2
        ORDER BY period_start DESC
        LIMIT 1
        "#,
    )
    .bind(account_id)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

async fn materialize_period(
    conn: &mut PgConnection,
    account_id: AccountId,
    now: DateTime<Utc>,
    fresh: BillingPeriod,
) -> StoreResult<UsagePeriodRow> {
    if let Some(row) = find_period_row(conn, account_id, now).await? {
        return Ok(row);
    }

    sqlx::query(
        r#"
        INSERT INTO usage_periods (id, account_id, period_start, period_end, created_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (account_id, period_start) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(account_id)
    .bind(fresh.start)
    .bind(fresh.end)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    find_period_row(conn, account_id, now)
        .await?
        .ok_or_else(|| StoreError::Conflict(format!("usage period for {account_id} not materialised")))
}

async fn load_period(conn: &mut PgConnection, row: UsagePeriodRow) -> StoreResult<UsagePeriod> {
    let counters = sqlx::query_as::<_, CounterRow>(
        "SELECT metric, used FROM usage_counters WHERE period_id = $1",
    )
    .bind(row.id)
    .fetch_all(&mut *conn)
    .await?;

    let mut by_metric = BTreeMap::new();
    for counter in counters {
        let metric = Metric::from_str(&counter.metric).ok_or_else(|| {
            StoreError::Corrupt(format!(
                "usage period {} has counter `{}`",
                row.id, counter.metric
            ))
        })?;
        by_metric.insert(metric, counter.used);
    }

    Ok(UsagePeriod {
        id: row.id,
        account_id: row.account_id,
        period_start: row.period_start,
        period_end: row.period_end,
        counters: by_metric,
        created_at: row.created_at,
    })
}

async fn insert_batch_on(
    conn: &mut PgConnection,
    batch: NewCreditBatch,
    now: DateTime<Utc>,
) -> StoreResult<CreditBatch> {
    let row = sqlx::query_as::<_, CreditBatchRow>(&format!(
        r#"
        INSERT INTO credit_batches (
            id, account_id, credit_type, quantity, consumed, expires_at, origin, unit_price, created_at
        ) VALUES ($1, $2, $3, $4, 0, $5, $6, $7, $8)
        RETURNING {BATCH_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(batch.account_id)
    .bind(batch.credit_type.as_str())
    .bind(batch.quantity)
    .bind(batch.expires_at)
    .bind(batch.origin.as_str())
    .bind(batch.unit_price)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    CreditBatch::try_from(row)
}

#[async_trait]
impl AccountDirectory for PgEntitlementStore {
    async fn account(&self, account_id: AccountId) -> StoreResult<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT id, plan_id, subscription_status FROM accounts WHERE id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Account {
            id: row.id,
            plan_id: row.plan_id,
            subscription_status: SubscriptionStatus::from_str(&row.subscription_status),
        }))
    }

    async fn completed_analyses(&self, account_id: AccountId) -> StoreResult<i64> {
        let count: Option<i64> =
            sqlx::query_scalar("SELECT completed_analyses FROM accounts WHERE id = $1")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(count.unwrap_or(0))
    }
}

#[async_trait]
impl UsageStore for PgEntitlementStore {
    async fn current_period(
        &self,
        account_id: AccountId,
        now: DateTime<Utc>,
        fresh: BillingPeriod,
    ) -> StoreResult<UsagePeriod> {
        let mut conn = self.pool.acquire().await?;
        let row = materialize_period(&mut conn, account_id, now, fresh).await?;
        load_period(&mut conn, row).await
    }

    async fn increment_if_under(
        &self,
        account_id: AccountId,
        metric: Metric,
        now: DateTime<Utc>,
        fresh: BillingPeriod,
        limit: Quota,
    ) -> StoreResult<CounterUpdate> {
        let mut tx = self.pool.begin().await?;
        let period = materialize_period(&mut *tx, account_id, now, fresh).await?;

        // Holds off a concurrent plan change until this increment commits. A
        // period closed while we waited is left alone.
        let open: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM usage_periods WHERE id = $1 AND period_end > $2 FOR SHARE",
        )
        .bind(period.id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        if open.is_none() {
            return Err(StoreError::Conflict(format!(
                "usage period {} closed before increment",
                period.id
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO usage_counters (period_id, metric, used)
            VALUES ($1, $2, 0)
            ON CONFLICT (period_id, metric) DO NOTHING
            "#,
        )
        .bind(period.id)
        .bind(metric.as_str())
        .execute(&mut *tx)
        .await?;

        // The row lock taken by UPDATE re-evaluates `used < limit` after any
        // concurrent writer commits, so the check and the write cannot split.
        let incremented: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE usage_counters
            SET used = used + 1,
                updated_at = NOW()
            WHERE period_id = $1
              AND metric = $2
              AND ($3::BIGINT IS NULL OR used < $3)
            RETURNING used
            "#,
        )
        .bind(period.id)
        .bind(metric.as_str())
        .bind(limit.as_limit())
        .fetch_optional(&mut *tx)
        .await?;

        let (used, applied) = match incremented {
            Some(used) => (used, true),
            None => {
                let used: i64 = sqlx::query_scalar(
                    "SELECT used FROM usage_counters WHERE period_id = $1 AND metric = $2",
                )
                .bind(period.id)
                .bind(metric.as_str())
                .fetch_one(&mut *tx)
                .await?;
                (used, false)
            }
        };

        tx.commit().await?;

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
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, UsagePeriodRow>(
            r#"
            SELECT id, account_id, period_start, period_end, created_at
            FROM usage_periods
            WHERE account_id = $1
              AND period_start <= $2
              AND period_end > $2
            ORDER BY period_start DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(account_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = current {
            if row.period_start == now {
                sqlx::query("DELETE FROM usage_counters WHERE period_id = $1")
                    .bind(row.id)
                    .execute(&mut *tx)
                    .await?;
                let reopened = sqlx::query_as::<_, UsagePeriodRow>(
                    r#"
                    UPDATE usage_periods SET period_end = $2
                    WHERE id = $1
                    RETURNING id, account_id, period_start, period_end, created_at
                    "#,
                )
                .bind(row.id)
                .bind(period_end)
                .fetch_one(&mut *tx)
                .await?;
                tx.commit().await?;
                return Ok(UsagePeriod {
                    id: reopened.id,
                    account_id: reopened.account_id,
                    period_start: reopened.period_start,
                    period_end: reopened.period_end,
                    counters: BTreeMap::new(),
                    created_at: reopened.created_at,
                });
            }

            sqlx::query("UPDATE usage_periods SET period_end = $2 WHERE id = $1")
                .bind(row.id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }

        let row = sqlx::query_as::<_, UsagePeriodRow>(
            r#"
            INSERT INTO usage_periods (id, account_id, period_start, period_end, created_at)
            VALUES ($1, $2, $3, $4, $3)
            RETURNING id, account_id, period_start, period_end, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(now)
        .bind(period_end)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(UsagePeriod {
            id: row.id,
            account_id: row.account_id,
            period_start: row.period_start,
            period_end: row.period_end,
            counters: BTreeMap::new(),
            created_at: row.created_at,
        })
    }

    async fn usage_history(&self, account_id: AccountId) -> StoreResult<Vec<UsagePeriod>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query_as::<_, UsagePeriodRow>(
            r#"
            SELECT id, account_id, period_start, period_end, created_at
            FROM usage_periods
            WHERE account_id = $1
            ORDER BY period_start ASC
            "#,
        )
        .bind(account_id)
        .fetch_all(&mut *conn)
        .await?;

        let mut periods = Vec::with_capacity(rows.len());
        for row in rows {
            periods.push(load_period(&mut conn, row).await?);
        }
        Ok(periods)
    }
}

#[async_trait]
impl CreditStore for PgEntitlementStore {
    async fn insert_batch(
        &self,
        batch: NewCreditBatch,
        now: DateTime<Utc>,
    ) -> StoreResult<CreditBatch> {
        let mut conn = self.pool.acquire().await?;
        insert_batch_on(&mut conn, batch, now).await
    }

    async fn consumable_batches(
        &self,
        account_id: AccountId,
        credit_type: CreditType,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<CreditBatch>> {
        let rows = sqlx::query_as::<_, CreditBatchRow>(&format!(
            r#"
            SELECT {BATCH_COLUMNS}
            FROM credit_batches
            WHERE account_id = $1
              AND credit_type = $2
              AND expires_at > $3
              AND consumed < quantity
            ORDER BY expires_at ASC, created_at ASC
            "#
        ))
        .bind(account_id)
        .bind(credit_type.as_str())
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CreditBatch::try_from).collect()
    }

    async fn consume_one(
        &self,
        account_id: AccountId,
        credit_type: CreditType,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<CreditBatch>> {
        let consumed = sqlx::query_as::<_, CreditBatchRow>(&format!(
            r#"
            UPDATE credit_batches
            SET consumed = consumed + 1
            WHERE id = (
                SELECT id
                FROM credit_batches
                WHERE account_id = $1
                  AND credit_type = $2
                  AND expires_at > $3
                  AND consumed < quantity
                ORDER BY expires_at ASC, created_at ASC
                LIMIT 1
                FOR UPDATE
            )
              AND consumed < quantity
            RETURNING {BATCH_COLUMNS}
            "#
        ))
        .bind(account_id)
        .bind(credit_type.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = consumed {
            return CreditBatch::try_from(row).map(Some);
        }

        // The locked candidate may have been drained by a concurrent consumer while
        // other batches still hold units; report that as a retryable conflict.
        let still_available: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM credit_batches
                WHERE account_id = $1
                  AND credit_type = $2
                  AND expires_at > $3
                  AND consumed < quantity
            )
            "#,
        )
        .bind(account_id)
        .bind(credit_type.as_str())
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        if still_available {
            Err(StoreError::Conflict(format!(
                "credit batch for {account_id}/{credit_type} drained concurrently"
            )))
        } else {
            Ok(None)
        }
    }

    async fn delete_expired_unused(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result =
            sqlx::query("DELETE FROM credit_batches WHERE expires_at <= $1 AND consumed = 0")
                .bind(now)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn batches_for(&self, account_id: AccountId) -> StoreResult<Vec<CreditBatch>> {
        let rows = sqlx::query_as::<_, CreditBatchRow>(&format!(
            "SELECT {BATCH_COLUMNS} FROM credit_batches WHERE account_id = $1 ORDER BY created_at ASC"
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CreditBatch::try_from).collect()
    }
}

#[async_trait]
impl ReferralStore for PgEntitlementStore {
    async fn active_code_for(
        &self,
        referrer_id: AccountId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ReferralCode>> {
        let row = sqlx::query_as::<_, ReferralCodeRow>(&format!(
            r#"
            SELECT {CODE_COLUMNS}
            FROM referral_codes
            WHERE referrer_id = $1
              AND status = 'pending'
              AND expires_at > $2
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(referrer_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ReferralCode::try_from).transpose()
    }

    async fn insert_code(&self, code: ReferralCode) -> StoreResult<InsertCodeOutcome> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO referral_codes (code, referrer_id, created_at, expires_at, status)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&code.code)
        .bind(code.referrer_id)
        .bind(code.created_at)
        .bind(code.expires_at)
        .bind(code.status.as_str())
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(InsertCodeOutcome::Inserted(code)),
            Err(err) if is_unique_violation(&err) => {
                // Either the token collided or the one-pending-per-referrer index fired.
                let pending = sqlx::query_as::<_, ReferralCodeRow>(&format!(
                    "SELECT {CODE_COLUMNS} FROM referral_codes WHERE referrer_id = $1 AND status = 'pending' LIMIT 1"
                ))
                .bind(code.referrer_id)
                .fetch_optional(&self.pool)
                .await?;
                match pending {
                    Some(row) => Ok(InsertCodeOutcome::ReferrerHasActive(
                        ReferralCode::try_from(row)?,
                    )),
                    None => Ok(InsertCodeOutcome::CodeTaken),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn find_code(&self, code: &str) -> StoreResult<Option<ReferralCode>> {
        let row = sqlx::query_as::<_, ReferralCodeRow>(&format!(
            "SELECT {CODE_COLUMNS} FROM referral_codes WHERE code = $1"
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ReferralCode::try_from).transpose()
    }

    async fn expire_lapsed(
        &self,
        now: DateTime<Utc>,
        referrer_id: Option<AccountId>,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE referral_codes
            SET status = 'expired'
            WHERE status = 'pending'
              AND expires_at <= $1
              AND ($2::UUID IS NULL OR referrer_id = $2)
            "#,
        )
        .bind(now)
        .bind(referrer_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn complete_with_grants(
        &self,
        code: &str,
        referee_id: AccountId,
        now: DateTime<Utc>,
        grants: Vec<NewCreditBatch>,
    ) -> StoreResult<Option<ReferralCompletion>> {
        let mut tx = self.pool.begin().await?;

        let completed = sqlx::query_as::<_, ReferralCodeRow>(&format!(
            r#"
            UPDATE referral_codes
            SET status = 'completed',
                referee_id = $2,
                completed_at = $3
            WHERE code = $1
              AND status = 'pending'
              AND expires_at > $3
            RETURNING {CODE_COLUMNS}
            "#
        ))
        .bind(code)
        .bind(referee_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(completed) = completed else {
            tx.rollback().await?;
            return Ok(None);
        };

        let mut written = Vec::with_capacity(grants.len());
        for grant in grants {
            written.push(insert_batch_on(&mut *tx, grant, now).await?);
        }

        tx.commit().await?;

        Ok(Some(ReferralCompletion {
            code: ReferralCode::try_from(completed)?,
            grants: written,
        }))
    }
}

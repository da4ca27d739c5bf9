use chrono::{DateTime, Duration, SubsecRound, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use entitlement_engine::entitlements::models::NewCreditBatch;
use entitlement_engine::entitlements::store::{
    AccountDirectory, CreditStore, InsertCodeOutcome, ReferralStore, UsageStore,
};
use entitlement_engine::entitlements::{
    BillingPeriod, CreditOrigin, CreditType, Metric, PgEntitlementStore, Quota, ReferralCode,
    ReferralStatus, SubscriptionStatus,
};

fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn batch(account_id: Uuid, quantity: i64, expires_in: Duration) -> NewCreditBatch {
    NewCreditBatch {
        account_id,
        credit_type: CreditType::Normal,
        quantity,
        expires_at: now() + expires_in,
        origin: CreditOrigin::Purchase,
        unit_price: Some(500),
    }
}

// key: postgres-store-tests -> account read model
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn accounts_are_read_from_the_directory_table(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgEntitlementStore::new(pool.clone());

    let account_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO accounts (id, plan_id, subscription_status, completed_analyses) VALUES ($1, $2, $3, $4)",
    )
    .bind(account_id)
    .bind("standard")
    .bind("past_due")
    .bind(2_i64)
    .execute(&pool)
    .await
    .unwrap();

    let account = store.account(account_id).await.unwrap().unwrap();
    assert_eq!(account.plan_id.as_deref(), Some("standard"));
    assert_eq!(account.subscription_status, SubscriptionStatus::PastDue);
    assert_eq!(store.completed_analyses(account_id).await.unwrap(), 2);
    assert!(store.account(Uuid::new_v4()).await.unwrap().is_none());
}

// key: postgres-store-tests -> conditional increment
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn concurrent_increments_stop_at_the_limit(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgEntitlementStore::new(pool);
    let account_id = Uuid::new_v4();
    let now = now();
    let period = BillingPeriod::containing(now);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .increment_if_under(
                    account_id,
                    Metric::AnalysisClarity,
                    now,
                    period,
                    Quota::Limited(4),
                )
                .await
                .unwrap()
        }));
    }

    let mut applied = 0;
    for handle in handles {
        let update = handle.await.unwrap();
        assert!(update.counter.used <= 4);
        if update.applied {
            applied += 1;
        }
    }
    assert_eq!(applied, 4);

    let current = store.current_period(account_id, now, period).await.unwrap();
    assert_eq!(current.used(Metric::AnalysisClarity), 4);
    assert_eq!(current.period_start, period.start);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn increment_never_lands_on_a_period_closed_while_waiting(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgEntitlementStore::new(pool.clone());
    let account_id = Uuid::new_v4();
    let now = now();
    let period = BillingPeriod::containing(now);
    let open = store.current_period(account_id, now, period).await.unwrap();

    // Close the period the way a plan change does, holding the row lock.
    let mut tx = pool.begin().await.unwrap();
    sqlx::query("SELECT id FROM usage_periods WHERE id = $1 FOR UPDATE")
        .bind(open.id)
        .execute(&mut *tx)
        .await
        .unwrap();
    sqlx::query("UPDATE usage_periods SET period_end = $2 WHERE id = $1")
        .bind(open.id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .unwrap();

    let racing = store.clone();
    let increment = tokio::spawn(async move {
        racing
            .increment_if_under(
                account_id,
                Metric::AnalysisClarity,
                now,
                period,
                Quota::Limited(5),
            )
            .await
    });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    tx.commit().await.unwrap();

    let err = increment.await.unwrap().unwrap_err();
    assert!(err.is_conflict());

    let counted: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM usage_counters WHERE period_id = $1 AND used > 0")
            .bind(open.id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(counted, 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn superseded_period_is_kept_in_history(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgEntitlementStore::new(pool);
    let account_id = Uuid::new_v4();
    let now = now();
    let period = BillingPeriod::containing(now);

    store
        .increment_if_under(account_id, Metric::AnalysisRoadmap, now, period, Quota::Unlimited)
        .await
        .unwrap();

    let later = now + Duration::seconds(1);
    let fresh = store
        .supersede_period(account_id, later, period.end)
        .await
        .unwrap();
    assert_eq!(fresh.used(Metric::AnalysisRoadmap), 0);

    let history = store.usage_history(account_id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].period_end, later);
    assert_eq!(history[0].used(Metric::AnalysisRoadmap), 1);

    let current = store
        .current_period(account_id, later, BillingPeriod::containing(later))
        .await
        .unwrap();
    assert_eq!(current.id, fresh.id);
}

// key: postgres-store-tests -> soonest expiry consumption
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn consumption_prefers_soonest_expiry_and_never_overspends(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgEntitlementStore::new(pool);
    let account_id = Uuid::new_v4();
    let now = now();

    let long = store
        .insert_batch(batch(account_id, 5, Duration::days(30)), now)
        .await
        .unwrap();
    let short = store
        .insert_batch(batch(account_id, 3, Duration::days(2)), now)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..12 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            loop {
                match store.consume_one(account_id, CreditType::Normal, now).await {
                    Ok(batch) => return batch,
                    Err(err) if err.is_conflict() => continue,
                    Err(err) => panic!("consume failed: {err}"),
                }
            }
        }));
    }

    let mut drawn = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            drawn += 1;
        }
    }
    assert_eq!(drawn, 8);

    let batches = store.batches_for(account_id).await.unwrap();
    for stored in &batches {
        assert_eq!(stored.consumed, stored.quantity);
    }
    assert!(batches.iter().any(|b| b.id == long.id));
    assert!(batches.iter().any(|b| b.id == short.id));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn expired_unused_batches_are_deleted(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgEntitlementStore::new(pool);
    let account_id = Uuid::new_v4();
    let now = now();

    store
        .insert_batch(batch(account_id, 2, Duration::hours(1)), now)
        .await
        .unwrap();
    let partial = store
        .insert_batch(batch(account_id, 2, Duration::minutes(30)), now)
        .await
        .unwrap();
    store
        .consume_one(account_id, CreditType::Normal, now)
        .await
        .unwrap();

    let removed = store
        .delete_expired_unused(now + Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    let remaining = store.batches_for(account_id).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, partial.id);
}

// key: postgres-store-tests -> referral uniqueness and completion
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn one_pending_code_per_referrer(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgEntitlementStore::new(pool);
    let referrer = Uuid::new_v4();
    let now = now();

    let first = ReferralCode::new("PGCODE01".into(), referrer, now, Duration::days(7));
    assert!(matches!(
        store.insert_code(first.clone()).await.unwrap(),
        InsertCodeOutcome::Inserted(_)
    ));

    let second = ReferralCode::new("PGCODE02".into(), referrer, now, Duration::days(7));
    match store.insert_code(second).await.unwrap() {
        InsertCodeOutcome::ReferrerHasActive(existing) => assert_eq!(existing.code, "PGCODE01"),
        other => panic!("expected existing code, got {other:?}"),
    }

    let clash = ReferralCode::new("PGCODE01".into(), Uuid::new_v4(), now, Duration::days(7));
    assert_eq!(
        store.insert_code(clash).await.unwrap(),
        InsertCodeOutcome::CodeTaken
    );

    let active = store.active_code_for(referrer, now).await.unwrap().unwrap();
    assert_eq!(active.code, first.code);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn completion_writes_both_grants_exactly_once(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgEntitlementStore::new(pool);
    let referrer = Uuid::new_v4();
    let referee = Uuid::new_v4();
    let now = now();

    let code = ReferralCode::new("PGCODE03".into(), referrer, now, Duration::days(7));
    store.insert_code(code).await.unwrap();

    let grants = vec![
        batch(referrer, 3, Duration::days(90)),
        batch(referee, 5, Duration::days(90)),
    ];
    let completion = store
        .complete_with_grants("PGCODE03", referee, now, grants.clone())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completion.code.status, ReferralStatus::Completed);
    assert_eq!(completion.code.referee_id, Some(referee));
    assert_eq!(completion.grants.len(), 2);

    let again = store
        .complete_with_grants("PGCODE03", Uuid::new_v4(), now, grants)
        .await
        .unwrap();
    assert!(again.is_none());
    assert_eq!(store.batches_for(referrer).await.unwrap().len(), 1);

    let lapsed = ReferralCode::new(
        "PGCODE04".into(),
        Uuid::new_v4(),
        now - Duration::days(8),
        Duration::days(7),
    );
    store.insert_code(lapsed).await.unwrap();
    assert_eq!(store.expire_lapsed(now, None).await.unwrap(), 1);
    let expired = store.find_code("PGCODE04").await.unwrap().unwrap();
    assert_eq!(expired.status, ReferralStatus::Expired);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn failed_grant_rolls_back_the_whole_redemption(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgEntitlementStore::new(pool);
    let referrer = Uuid::new_v4();
    let referee = Uuid::new_v4();
    let now = now();

    let code = ReferralCode::new("PGCODE05".into(), referrer, now, Duration::days(7));
    store.insert_code(code).await.unwrap();

    // The second grant violates `quantity > 0`.
    let grants = vec![
        batch(referrer, 3, Duration::days(90)),
        batch(referee, 0, Duration::days(90)),
    ];
    let result = store
        .complete_with_grants("PGCODE05", referee, now, grants)
        .await;
    assert!(result.is_err());

    let code = store.find_code("PGCODE05").await.unwrap().unwrap();
    assert_eq!(code.status, ReferralStatus::Pending);
    assert!(code.referee_id.is_none());
    assert!(store.batches_for(referrer).await.unwrap().is_empty());
    assert!(store.batches_for(referee).await.unwrap().is_empty());
}

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Extension, Path};
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::{Json, Router};
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tower::ServiceExt; // for `oneshot`
use uuid::Uuid;

use entitlement_engine::entitlements::api::{self, AuthorizeRequest};
use entitlement_engine::entitlements::{
    Account, Decision, EngineSettings, EntitlementEngine, InMemoryStore, ManualClock, Metric,
    PlanCatalog, SubscriptionStatus,
};
use entitlement_engine::routes::api_routes;

async fn engine_with_account(plan: &str) -> (EntitlementEngine, Arc<InMemoryStore>, Uuid) {
    let store = Arc::new(InMemoryStore::new());
    let account = Uuid::new_v4();
    store
        .upsert_account(Account {
            id: account,
            plan_id: Some(plan.to_string()),
            subscription_status: SubscriptionStatus::Active,
        })
        .await;
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 4, 10, 9, 0, 0).unwrap(),
    ));
    let engine = EntitlementEngine::new(
        store.clone(),
        Arc::new(PlanCatalog::builtin()),
        clock,
        EngineSettings::default(),
    );
    (engine, store, account)
}

fn app(engine: EntitlementEngine) -> Router {
    api_routes().layer(Extension(engine))
}

async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let request = match body {
        Some(body) => request.body(Body::from(body.to_string())).unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

// key: entitlements-api-tests -> authorize status codes
#[tokio::test]
async fn authorize_answers_payment_required_once_quota_is_spent() {
    let (engine, _, account) = engine_with_account("free").await;
    let uri = format!("/api/entitlements/{account}/authorize");

    let (status, body) = send(
        app(engine.clone()),
        "POST",
        &uri,
        Some(json!({"metric": "analysis_clarity"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "allowed_by_quota");
    assert_eq!(body["usage"]["used"], 1);

    let (status, body) = send(
        app(engine),
        "POST",
        &uri,
        Some(json!({"metric": "analysis_clarity"})),
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["outcome"], "denied");
    assert_eq!(body["reason"], "quota_exhausted_needs_credit");
    assert_eq!(body["required_credit_type"], "normal");
    assert_eq!(body["credit_price"]["amount"], 500);
    assert_eq!(body["usage"]["limit"], 1);
    assert_eq!(body["usage"]["resets_at"], "2024-05-01T00:00:00Z");
}

#[tokio::test]
async fn purchased_credits_unlock_the_action() {
    let (engine, _, account) = engine_with_account("free").await;

    let (status, batch) = send(
        app(engine.clone()),
        "POST",
        &format!("/api/entitlements/{account}/credits"),
        Some(json!({"credit_type": "premium_persona", "quantity": 2, "expires_in_days": 30})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(batch["origin"], "purchase");
    assert_eq!(batch["unit_price"], 1500);

    let (status, balance) = send(
        app(engine.clone()),
        "GET",
        &format!("/api/entitlements/{account}/credits/premium_persona"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(balance["available"], 2);

    let (status, body) = send(
        app(engine),
        "POST",
        &format!("/api/entitlements/{account}/authorize"),
        Some(json!({"metric": "analysis_persona"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "allowed_by_credit");
    assert_eq!(body["credits_remaining"], 1);
}

#[tokio::test]
async fn invalid_grants_and_unknown_metrics_are_bad_requests() {
    let (engine, _, account) = engine_with_account("free").await;

    let (status, body) = send(
        app(engine.clone()),
        "POST",
        &format!("/api/entitlements/{account}/credits"),
        Some(json!({"credit_type": "normal", "quantity": -1, "expires_in_days": 30})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_grant");

    let (status, body) = send(
        app(engine.clone()),
        "POST",
        &format!("/api/entitlements/{account}/credits"),
        Some(json!({"credit_type": "normal", "quantity": 1, "expires_in_days": 200_000_000})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_grant");

    let (status, body) = send(
        app(engine),
        "GET",
        &format!("/api/entitlements/{account}/usage/analysis_horoscope"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");
}

#[tokio::test]
async fn plan_change_endpoint_resets_usage() {
    let (engine, store, account) = engine_with_account("free").await;
    engine
        .resolver()
        .authorize(account, Metric::AnalysisClarity, None)
        .await
        .unwrap();

    store
        .upsert_account(Account {
            id: account,
            plan_id: Some("standard".into()),
            subscription_status: SubscriptionStatus::Active,
        })
        .await;
    let (status, _) = send(
        app(engine.clone()),
        "POST",
        &format!("/api/entitlements/{account}/plan"),
        Some(json!({"plan_id": "standard"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, usage) = send(
        app(engine.clone()),
        "GET",
        &format!("/api/entitlements/{account}/usage/analysis_clarity"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(usage["used"], 0);
    assert_eq!(usage["limit"], 5);

    let (status, body) = send(
        app(engine),
        "POST",
        &format!("/api/entitlements/{account}/plan"),
        Some(json!({"plan_id": "enterprise"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "unknown_plan");
}

// key: referrals-api-tests -> issue and redeem over http
#[tokio::test]
async fn referral_endpoints_issue_and_redeem() {
    let (engine, store, referrer) = engine_with_account("standard").await;
    store.record_completed_analysis(referrer).await;
    let referee = Uuid::new_v4();

    let (status, issued) = send(
        app(engine.clone()),
        "POST",
        &format!("/api/referrals/{referrer}/issue"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let code = issued["code"].as_str().unwrap().to_string();

    let (status, body) = send(
        app(engine.clone()),
        "POST",
        "/api/referrals/redeem",
        Some(json!({"code": code, "referee_id": referrer})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "referral_self");

    let (status, body) = send(
        app(engine.clone()),
        "POST",
        "/api/referrals/redeem",
        Some(json!({"code": code, "referee_id": referee})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"]["status"], "completed");
    assert_eq!(body["referee_grant"]["quantity"], 5);

    let (status, body) = send(
        app(engine),
        "POST",
        "/api/referrals/redeem",
        Some(json!({"code": code, "referee_id": Uuid::new_v4()})),
    )
    .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["error"], "referral_already_used");
}

#[tokio::test]
async fn unknown_referral_code_is_not_found() {
    let (engine, _, _) = engine_with_account("free").await;
    let (status, body) = send(
        app(engine),
        "POST",
        "/api/referrals/redeem",
        Some(json!({"code": "NOPE0000", "referee_id": Uuid::new_v4()})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "referral_invalid_code");
}

#[tokio::test]
async fn authorize_handler_defaults_credit_type_from_metric() {
    let (engine, _, account) = engine_with_account("free").await;
    // Free carries no persona allowance, so the first call is already a denial.
    let response = api::authorize(
        Extension(engine),
        Path(account),
        Json(AuthorizeRequest {
            metric: Metric::AnalysisPersona,
            credit_type: None,
        }),
    )
    .await
    .unwrap();
    let (status, Json(decision)) = response;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    let Decision::Denied(denial) = decision else {
        panic!("free plan has no persona allowance");
    };
    assert_eq!(
        denial.required_credit_type,
        Metric::AnalysisPersona.default_credit_type()
    );
}

#[tokio::test]
async fn redeem_handler_rejects_blank_codes() {
    let (engine, _, _) = engine_with_account("free").await;
    let err = api::redeem_referral(
        Extension(engine),
        Json(api::RedeemReferralRequest {
            code: "   ".into(),
            referee_id: Uuid::new_v4(),
        }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
}

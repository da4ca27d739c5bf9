use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

use super::catalog::{CreditPrice, CreditType, Metric};
use super::ledger::CreditGrant;
use super::models::{CreditBatch, CreditOrigin, Decision, ReferralCode, UsagePeriod, UsageSnapshot};
use super::referral::ReferralRedemption;
use super::EntitlementEngine;

#[derive(Debug, Deserialize)]
pub struct AuthorizeRequest {
    pub metric: Metric,
    /// Defaults to the metric's own credit type when omitted.
    #[serde(default)]
    pub credit_type: Option<CreditType>,
}

#[derive(Debug, Serialize)]
pub struct CreditBalanceResponse {
    pub credit_type: CreditType,
    pub available: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<CreditPrice>,
}

#[derive(Debug, Deserialize)]
pub struct GrantCreditsRequest {
    pub credit_type: CreditType,
    pub quantity: i64,
    pub expires_in_days: i64,
    #[serde(default)]
    pub origin: Option<CreditOrigin>,
    #[serde(default)]
    pub unit_price: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct PlanChangeRequest {
    pub plan_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RedeemReferralRequest {
    pub code: String,
    pub referee_id: Uuid,
}

fn parse_metric(raw: &str) -> AppResult<Metric> {
    Metric::from_str(raw).ok_or_else(|| AppError::BadRequest(format!("unknown metric `{raw}`")))
}

fn parse_credit_type(raw: &str) -> AppResult<CreditType> {
    CreditType::from_str(raw)
        .ok_or_else(|| AppError::BadRequest(format!("unknown credit type `{raw}`")))
}

/// key: entitlements-api -> authorize a metered action; denials answer 402
pub async fn authorize(
    Extension(engine): Extension<EntitlementEngine>,
    Path(account_id): Path<Uuid>,
    Json(payload): Json<AuthorizeRequest>,
) -> AppResult<(StatusCode, Json<Decision>)> {
    let credit_type = payload
        .credit_type
        .or_else(|| payload.metric.default_credit_type());
    let decision = engine
        .resolver()
        .authorize(account_id, payload.metric, credit_type)
        .await?;

    let status = if decision.is_allowed() {
        StatusCode::OK
    } else {
        StatusCode::PAYMENT_REQUIRED
    };
    Ok((status, Json(decision)))
}

pub async fn usage(
    Extension(engine): Extension<EntitlementEngine>,
    Path((account_id, metric)): Path<(Uuid, String)>,
) -> AppResult<Json<UsageSnapshot>> {
    let metric = parse_metric(&metric)?;
    let snapshot = engine.usage().current_usage(account_id, metric).await?;
    Ok(Json(snapshot))
}

pub async fn usage_history(
    Extension(engine): Extension<EntitlementEngine>,
    Path(account_id): Path<Uuid>,
) -> AppResult<Json<Vec<UsagePeriod>>> {
    let periods = engine.usage().history(account_id).await?;
    Ok(Json(periods))
}

pub async fn credit_balance(
    Extension(engine): Extension<EntitlementEngine>,
    Path((account_id, credit_type)): Path<(Uuid, String)>,
) -> AppResult<Json<CreditBalanceResponse>> {
    let credit_type = parse_credit_type(&credit_type)?;
    let available = engine
        .ledger()
        .available_balance(account_id, credit_type)
        .await?;
    Ok(Json(CreditBalanceResponse {
        credit_type,
        available,
        price: engine.catalog().price_for(credit_type).cloned(),
    }))
}

pub async fn list_credit_batches(
    Extension(engine): Extension<EntitlementEngine>,
    Path(account_id): Path<Uuid>,
) -> AppResult<Json<Vec<CreditBatch>>> {
    let batches = engine.ledger().batches(account_id).await?;
    Ok(Json(batches))
}

/// key: entitlements-api -> payment completion webhook
pub async fn grant_credits(
    Extension(engine): Extension<EntitlementEngine>,
    Path(account_id): Path<Uuid>,
    Json(payload): Json<GrantCreditsRequest>,
) -> AppResult<(StatusCode, Json<CreditBatch>)> {
    let unit_price = payload.unit_price.or_else(|| {
        engine
            .catalog()
            .price_for(payload.credit_type)
            .map(|price| price.amount)
    });
    let batch = engine
        .ledger()
        .grant(CreditGrant {
            account_id,
            credit_type: payload.credit_type,
            quantity: payload.quantity,
            expires_in_days: payload.expires_in_days,
            origin: payload.origin.unwrap_or(CreditOrigin::Purchase),
            unit_price,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(batch)))
}

pub async fn change_plan(
    Extension(engine): Extension<EntitlementEngine>,
    Path(account_id): Path<Uuid>,
    Json(payload): Json<PlanChangeRequest>,
) -> AppResult<Json<UsagePeriod>> {
    let period = engine
        .resolver()
        .plan_changed(account_id, payload.plan_id.trim())
        .await?;
    Ok(Json(period))
}

/// key: referrals-api -> issue or return the active code
pub async fn issue_referral(
    Extension(engine): Extension<EntitlementEngine>,
    Path(account_id): Path<Uuid>,
) -> AppResult<Json<ReferralCode>> {
    let code = engine.referrals().issue(account_id).await?;
    Ok(Json(code))
}

pub async fn redeem_referral(
    Extension(engine): Extension<EntitlementEngine>,
    Json(payload): Json<RedeemReferralRequest>,
) -> AppResult<Json<ReferralRedemption>> {
    if payload.code.trim().is_empty() {
        return Err(AppError::BadRequest("referral code is required".into()));
    }
    let redemption = engine
        .referrals()
        .redeem(&payload.code, payload.referee_id)
        .await?;
    Ok(Json(redemption))
}

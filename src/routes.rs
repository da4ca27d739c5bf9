use axum::{
    routing::{get, post},
    Router,
};

use crate::entitlements::api;

pub fn api_routes() -> Router {
    Router::new()
        .route(
            "/api/entitlements/:account_id/authorize",
            post(api::authorize),
        )
        .route(
            "/api/entitlements/:account_id/usage",
            get(api::usage_history),
        )
        .route(
            "/api/entitlements/:account_id/usage/:metric",
            get(api::usage),
        )
        .route(
            "/api/entitlements/:account_id/credits",
            get(api::list_credit_batches).post(api::grant_credits),
        )
        .route(
            "/api/entitlements/:account_id/credits/:credit_type",
            get(api::credit_balance),
        )
        .route(
            "/api/entitlements/:account_id/plan",
            post(api::change_plan),
        )
        .route(
            "/api/referrals/:account_id/issue",
            post(api::issue_referral),
        )
        .route("/api/referrals/redeem", post(api::redeem_referral))
}

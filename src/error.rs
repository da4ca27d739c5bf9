use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failures raised by the storage primitives behind the engine.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    /// A concurrent mutation won the race. Raised only when nothing was applied,
    /// so the caller may retry the whole step.
    #[error("storage conflict: {0}")]
    Conflict(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum EntitlementError {
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("storage unavailable after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: StoreError },
    #[error("unknown plan `{0}`")]
    UnknownPlan(String),
    #[error("invalid credit grant: {0}")]
    InvalidGrant(String),
}

impl EntitlementError {
    pub fn code(&self) -> &'static str {
        match self {
            EntitlementError::Storage(StoreError::Conflict(_)) => "storage_conflict",
            EntitlementError::Storage(_) | EntitlementError::RetriesExhausted { .. } => {
                "storage_unavailable"
            }
            EntitlementError::UnknownPlan(_) => "unknown_plan",
            EntitlementError::InvalidGrant(_) => "invalid_grant",
        }
    }
}

#[derive(Debug, Error)]
pub enum ReferralError {
    #[error("referral code not found")]
    InvalidCode,
    #[error("referral code has expired")]
    Expired,
    #[error("referral code cannot be redeemed by its own referrer")]
    SelfReferral,
    #[error("referral code was already redeemed")]
    AlreadyUsed,
    #[error("referrer does not meet the referral requirements")]
    ReferrerIneligible,
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl ReferralError {
    pub fn code(&self) -> &'static str {
        match self {
            ReferralError::InvalidCode => "referral_invalid_code",
            ReferralError::Expired => "referral_expired",
            ReferralError::SelfReferral => "referral_self",
            ReferralError::AlreadyUsed => "referral_already_used",
            ReferralError::ReferrerIneligible => "referral_referrer_ineligible",
            ReferralError::Storage(StoreError::Conflict(_)) => "storage_conflict",
            ReferralError::Storage(_) => "storage_unavailable",
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Entitlement(#[from] EntitlementError),
    #[error(transparent)]
    Referral(#[from] ReferralError),
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl From<StoreError> for AppError {
    fn from(error: StoreError) -> Self {
        AppError::Entitlement(EntitlementError::Storage(error))
    }
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Entitlement(error) => error.code(),
            AppError::Referral(error) => error.code(),
            AppError::NotFound => "not_found",
            AppError::BadRequest(_) => "bad_request",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Entitlement(EntitlementError::UnknownPlan(_))
            | AppError::Entitlement(EntitlementError::InvalidGrant(_)) => StatusCode::BAD_REQUEST,
            AppError::Entitlement(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Referral(ReferralError::InvalidCode) => StatusCode::NOT_FOUND,
            AppError::Referral(ReferralError::Expired)
            | AppError::Referral(ReferralError::AlreadyUsed) => StatusCode::GONE,
            AppError::Referral(ReferralError::SelfReferral)
            | AppError::Referral(ReferralError::ReferrerIneligible) => StatusCode::FORBIDDEN,
            AppError::Referral(ReferralError::Storage(_)) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(?self);
        } else {
            tracing::debug!(?self, "request rejected");
        }
        let body = json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referral_errors_expose_stable_codes() {
        assert_eq!(ReferralError::SelfReferral.code(), "referral_self");
        assert_eq!(ReferralError::Expired.code(), "referral_expired");
        assert_eq!(
            ReferralError::Storage(StoreError::Conflict("race".into())).code(),
            "storage_conflict"
        );
    }

    #[test]
    fn exhausted_retries_surface_as_unavailable() {
        let error = AppError::from(EntitlementError::RetriesExhausted {
            attempts: 3,
            last: StoreError::Conflict("batch".into()),
        });
        assert_eq!(error.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error.code(), "storage_unavailable");
    }
}

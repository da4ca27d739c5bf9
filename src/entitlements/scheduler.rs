use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

use super::ledger::CreditLedger;
use super::referral::ReferralProgram;
use super::EntitlementEngine;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired_batches_removed: u64,
    pub referral_codes_expired: u64,
}

/// key: entitlement-maintenance-scheduler -> credit cleanup and referral expiry
pub fn spawn(engine: EntitlementEngine, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(err) = process_tick(engine.ledger(), engine.referrals()).await {
                warn!(?err, "entitlement maintenance tick failed");
            }
        }
    })
}

/// key: entitlement-maintenance-scheduler -> tick handler
pub async fn process_tick(
    ledger: &CreditLedger,
    referrals: &ReferralProgram,
) -> Result<MaintenanceReport> {
    let mut report = MaintenanceReport::default();

    // Each step runs even when the other fails; the first error is reported.
    let mut first_error = None;

    match ledger.cleanup_expired().await {
        Ok(removed) => report.expired_batches_removed = removed,
        Err(err) => {
            warn!(?err, "failed to clean up expired credit batches");
            first_error = first_error.or(Some(anyhow::Error::new(err)));
        }
    }

    match referrals.expire_lapsed().await {
        Ok(expired) => {
            if expired > 0 {
                info!(expired, "expired lapsed referral codes");
            }
            report.referral_codes_expired = expired;
        }
        Err(err) => {
            warn!(?err, "failed to expire lapsed referral codes");
            first_error = first_error.or(Some(anyhow::Error::new(err)));
        }
    }

    if let Some(err) = first_error {
        return Err(err);
    }

    debug!(
        removed = report.expired_batches_removed,
        expired = report.referral_codes_expired,
        "entitlement maintenance tick complete"
    );
    Ok(report)
}

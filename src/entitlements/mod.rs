pub mod api;
pub mod catalog;
pub mod ledger;
pub mod memory;
pub mod models;
pub mod period;
pub mod postgres;
pub mod referral;
pub mod resolver;
pub mod scheduler;
pub mod store;
pub mod usage;

use std::sync::Arc;

pub use catalog::{CatalogError, CreditPrice, CreditType, Metric, Plan, PlanCatalog, Quota};
pub use ledger::{CreditGrant, CreditLedger};
pub use memory::InMemoryStore;
pub use models::{
    Account, AccountId, CreditBatch, CreditOrigin, Decision, Denial, DenialReason,
    ReferralCode, ReferralStatus, Remediation, SubscriptionStatus, UsagePeriod, UsageSnapshot,
};
pub use period::{BillingPeriod, Clock, ManualClock, SystemClock};
pub use postgres::PgEntitlementStore;
pub use referral::{ReferralPolicy, ReferralProgram, ReferralRedemption};
pub use resolver::{EntitlementResolver, RetryPolicy};
pub use scheduler::MaintenanceReport;
pub use store::EntitlementStore;
pub use usage::{IncrementOutcome, UsageCounterStore};

#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub retry: RetryPolicy,
    pub referral: ReferralPolicy,
}

/// key: entitlement-engine -> every component wired to one store, catalog and clock
#[derive(Clone)]
pub struct EntitlementEngine {
    resolver: EntitlementResolver,
    referrals: ReferralProgram,
    ledger: CreditLedger,
    usage: UsageCounterStore,
    catalog: Arc<PlanCatalog>,
}

impl EntitlementEngine {
    pub fn new<S>(
        store: Arc<S>,
        catalog: Arc<PlanCatalog>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self
    where
        S: EntitlementStore + 'static,
    {
        let usage = UsageCounterStore::new(
            store.clone(),
            store.clone(),
            catalog.clone(),
            clock.clone(),
        );
        let ledger = CreditLedger::new(store.clone(), clock.clone());
        let resolver = EntitlementResolver::new(
            store.clone(),
            usage.clone(),
            ledger.clone(),
            catalog.clone(),
            settings.retry,
        );
        let referrals =
            ReferralProgram::new(store.clone(), store, catalog.clone(), clock, settings.referral);

        Self {
            resolver,
            referrals,
            ledger,
            usage,
            catalog,
        }
    }

    pub fn resolver(&self) -> &EntitlementResolver {
        &self.resolver
    }

    pub fn referrals(&self) -> &ReferralProgram {
        &self.referrals
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    pub fn usage(&self) -> &UsageCounterStore {
        &self.usage
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }
}

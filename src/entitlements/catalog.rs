use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::models::{Account, SubscriptionStatus};

/// Metered actions. Closed set: a plan can only carry quotas for these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    AnalysisClarity,
    AnalysisPersona,
    AnalysisRoadmap,
}

impl Metric {
    pub const ALL: [Metric; 3] = [
        Metric::AnalysisClarity,
        Metric::AnalysisPersona,
        Metric::AnalysisRoadmap,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::AnalysisClarity => "analysis_clarity",
            Metric::AnalysisPersona => "analysis_persona",
            Metric::AnalysisRoadmap => "analysis_roadmap",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|metric| metric.as_str() == value.trim())
    }

    /// Credit type that unlocks this action once the monthly quota is spent.
    pub fn default_credit_type(&self) -> Option<CreditType> {
        match self {
            Metric::AnalysisClarity | Metric::AnalysisRoadmap => Some(CreditType::Normal),
            Metric::AnalysisPersona => Some(CreditType::PremiumPersona),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditType {
    Normal,
    PremiumPersona,
}

impl CreditType {
    pub const ALL: [CreditType; 2] = [CreditType::Normal, CreditType::PremiumPersona];

    pub fn as_str(&self) -> &'static str {
        match self {
            CreditType::Normal => "normal",
            CreditType::PremiumPersona => "premium_persona",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|credit_type| credit_type.as_str() == value.trim())
    }
}

impl fmt::Display for CreditType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monthly allowance for one metric. Serialized as an integer where `-1` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum Quota {
    Limited(i64),
    Unlimited,
}

impl Quota {
    pub const UNLIMITED_SENTINEL: i64 = -1;

    pub fn from_raw(raw: i64) -> Result<Self, CatalogError> {
        match raw {
            Self::UNLIMITED_SENTINEL => Ok(Quota::Unlimited),
            value if value >= 0 => Ok(Quota::Limited(value)),
            value => Err(CatalogError::InvalidQuota(value)),
        }
    }

    pub fn as_raw(&self) -> i64 {
        match self {
            Quota::Limited(limit) => *limit,
            Quota::Unlimited => Self::UNLIMITED_SENTINEL,
        }
    }

    /// `None` is the storage encoding of unlimited.
    pub fn as_limit(&self) -> Option<i64> {
        match self {
            Quota::Limited(limit) => Some(*limit),
            Quota::Unlimited => None,
        }
    }

    pub fn allows(&self, used: i64) -> bool {
        match self {
            Quota::Limited(limit) => used < *limit,
            Quota::Unlimited => true,
        }
    }

    pub fn remaining(&self, used: i64) -> Option<i64> {
        self.as_limit().map(|limit| (limit - used).max(0))
    }
}

impl TryFrom<i64> for Quota {
    type Error = CatalogError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Quota::from_raw(value)
    }
}

impl From<Quota> for i64 {
    fn from(value: Quota) -> Self {
        value.as_raw()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditPrice {
    pub amount: i64,
    pub currency: String,
}

impl CreditPrice {
    pub fn new(amount: i64, currency: impl Into<String>) -> Self {
        Self {
            amount,
            currency: currency.into(),
        }
    }
}

/// key: plan-catalog-entry -> immutable per-metric quotas
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub paid: bool,
    pub quotas: BTreeMap<Metric, Quota>,
}

impl Plan {
    pub fn new(id: impl Into<String>, name: impl Into<String>, paid: bool) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            paid,
            quotas: BTreeMap::new(),
        }
    }

    pub fn with_quota(mut self, metric: Metric, quota: Quota) -> Self {
        self.quotas.insert(metric, quota);
        self
    }

    /// Metrics the plan does not list get no allowance.
    pub fn quota(&self, metric: Metric) -> Quota {
        self.quotas
            .get(&metric)
            .copied()
            .unwrap_or(Quota::Limited(0))
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read plan catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse plan catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unknown metric `{0}` in plan catalog")]
    UnknownMetric(String),
    #[error("unknown credit type `{0}` in plan catalog")]
    UnknownCreditType(String),
    #[error("quota {0} is invalid; use a non-negative count or -1 for unlimited")]
    InvalidQuota(i64),
    #[error("plan `{0}` is declared more than once")]
    DuplicatePlan(String),
    #[error("fallback plan `{0}` is not part of the catalog")]
    UnknownFallback(String),
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    plans: Vec<PlanFile>,
    #[serde(default)]
    credit_prices: HashMap<String, CreditPrice>,
    #[serde(default)]
    fallback_plan: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlanFile {
    id: String,
    name: String,
    #[serde(default)]
    paid: bool,
    #[serde(default)]
    quotas: HashMap<String, i64>,
}

/// key: plan-catalog -> quota lookup, fails closed
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: HashMap<String, Plan>,
    prices: BTreeMap<CreditType, CreditPrice>,
    fallback_plan: Option<String>,
}

impl PlanCatalog {
    pub fn new(
        plans: Vec<Plan>,
        prices: BTreeMap<CreditType, CreditPrice>,
    ) -> Result<Self, CatalogError> {
        let mut by_id = HashMap::with_capacity(plans.len());
        for plan in plans {
            if by_id.contains_key(&plan.id) {
                return Err(CatalogError::DuplicatePlan(plan.id));
            }
            by_id.insert(plan.id.clone(), plan);
        }
        Ok(Self {
            plans: by_id,
            prices,
            fallback_plan: None,
        })
    }

    pub fn with_fallback_plan(mut self, plan_id: Option<String>) -> Result<Self, CatalogError> {
        if let Some(id) = plan_id.as_deref() {
            if !self.plans.contains_key(id) {
                return Err(CatalogError::UnknownFallback(id.to_string()));
            }
        }
        self.fallback_plan = plan_id;
        Ok(self)
    }

    /// Catalog shipped with the service: a free tier, a standard tier and an unlimited tier.
    pub fn builtin() -> Self {
        let plans = vec![
            Plan::new("free", "Free", false)
                .with_quota(Metric::AnalysisClarity, Quota::Limited(1))
                .with_quota(Metric::AnalysisPersona, Quota::Limited(0))
                .with_quota(Metric::AnalysisRoadmap, Quota::Limited(0)),
            Plan::new("standard", "Standard", true)
                .with_quota(Metric::AnalysisClarity, Quota::Limited(5))
                .with_quota(Metric::AnalysisPersona, Quota::Limited(1))
                .with_quota(Metric::AnalysisRoadmap, Quota::Limited(3)),
            Plan::new("premium", "Premium", true)
                .with_quota(Metric::AnalysisClarity, Quota::Unlimited)
                .with_quota(Metric::AnalysisPersona, Quota::Unlimited)
                .with_quota(Metric::AnalysisRoadmap, Quota::Unlimited),
        ];
        let prices = BTreeMap::from([
            (CreditType::Normal, CreditPrice::new(500, "JPY")),
            (CreditType::PremiumPersona, CreditPrice::new(1500, "JPY")),
        ]);
        let plans = plans
            .into_iter()
            .map(|plan| (plan.id.clone(), plan))
            .collect();
        Self {
            plans,
            prices,
            fallback_plan: Some("free".to_string()),
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(raw)?;

        let mut plans = Vec::with_capacity(file.plans.len());
        for entry in file.plans {
            let mut plan = Plan::new(entry.id, entry.name, entry.paid);
            for (name, raw_quota) in entry.quotas {
                let metric = Metric::from_str(&name).ok_or(CatalogError::UnknownMetric(name))?;
                plan.quotas.insert(metric, Quota::from_raw(raw_quota)?);
            }
            plans.push(plan);
        }

        let mut prices = BTreeMap::new();
        for (name, price) in file.credit_prices {
            let credit_type =
                CreditType::from_str(&name).ok_or(CatalogError::UnknownCreditType(name))?;
            prices.insert(credit_type, price);
        }

        Self::new(plans, prices)?.with_fallback_plan(file.fallback_plan)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn plan(&self, plan_id: &str) -> Option<&Plan> {
        self.plans.get(plan_id)
    }

    pub fn plans(&self) -> impl Iterator<Item = &Plan> {
        self.plans.values()
    }

    pub fn fallback_plan(&self) -> Option<&Plan> {
        self.fallback_plan
            .as_deref()
            .and_then(|id| self.plans.get(id))
    }

    /// Unknown plans and unlisted metrics resolve to a zero quota.
    pub fn quota_for(&self, plan_id: &str, metric: Metric) -> Quota {
        self.plan(plan_id)
            .map(|plan| plan.quota(metric))
            .unwrap_or(Quota::Limited(0))
    }

    pub fn price_for(&self, credit_type: CreditType) -> Option<&CreditPrice> {
        self.prices.get(&credit_type)
    }

    /// Plan the account is metered under right now. Accounts without an active
    /// subscription fall back to the fallback plan, if one is configured. An
    /// active subscription on a plan the catalog does not know resolves to
    /// nothing.
    pub fn resolve(&self, account: &Account) -> Option<&Plan> {
        if account.subscription_status == SubscriptionStatus::Active {
            return account.plan_id.as_deref().and_then(|id| self.plan(id));
        }
        self.fallback_plan()
    }

    /// Whether any plan offers more of `metric` than `current`.
    pub fn has_upgrade_for(&self, metric: Metric, current: Quota) -> bool {
        self.plans.values().any(|plan| match (plan.quota(metric), current) {
            (Quota::Unlimited, Quota::Limited(_)) => true,
            (Quota::Limited(offered), Quota::Limited(limit)) => offered > limit,
            (_, Quota::Unlimited) => false,
        })
    }
}

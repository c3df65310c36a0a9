//! Traits for the external collaborators the engine consumes.

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;

use tradeguard_core::types::{RiskAssessment, UserId};
use tradeguard_core::Result;

/// Source of risk scores and risk-derived limits.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RiskAssessmentProvider: Send + Sync {
    /// Latest assessment for the user, or `None` when none exists yet.
    async fn assessment(&self, user: &UserId) -> Result<Option<RiskAssessment>>;
}

/// Source of live portfolio valuations and per-symbol position sizes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PortfolioProvider: Send + Sync {
    async fn total_value(&self, user: &UserId) -> Result<Decimal>;

    /// Current share count held in `symbol`, zero when flat.
    async fn position_size(&self, user: &UserId, symbol: &str) -> Result<Decimal>;
}

/// In-memory assessment provider for tests and paper deployments.
#[derive(Default)]
pub struct StaticAssessmentProvider {
    assessments: DashMap<UserId, RiskAssessment>,
}

impl StaticAssessmentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, assessment: RiskAssessment) {
        self.assessments.insert(assessment.user.clone(), assessment);
    }
}

#[async_trait]
impl RiskAssessmentProvider for StaticAssessmentProvider {
    async fn assessment(&self, user: &UserId) -> Result<Option<RiskAssessment>> {
        Ok(self.assessments.get(user).map(|a| a.clone()))
    }
}

/// In-memory portfolio provider for tests and paper deployments.
pub struct StaticPortfolioProvider {
    default_value: Decimal,
    values: DashMap<UserId, Decimal>,
    positions: DashMap<(UserId, String), Decimal>,
}

impl StaticPortfolioProvider {
    pub fn new(default_value: Decimal) -> Self {
        Self {
            default_value,
            values: DashMap::new(),
            positions: DashMap::new(),
        }
    }

    pub fn set_value(&self, user: UserId, value: Decimal) {
        self.values.insert(user, value);
    }

    pub fn set_position(&self, user: UserId, symbol: impl Into<String>, shares: Decimal) {
        self.positions.insert((user, symbol.into()), shares);
    }
}

#[async_trait]
impl PortfolioProvider for StaticPortfolioProvider {
    async fn total_value(&self, user: &UserId) -> Result<Decimal> {
        Ok(self
            .values
            .get(user)
            .map(|v| *v)
            .unwrap_or(self.default_value))
    }

    async fn position_size(&self, user: &UserId, symbol: &str) -> Result<Decimal> {
        Ok(self
            .positions
            .get(&(user.clone(), symbol.to_string()))
            .map(|v| *v)
            .unwrap_or(Decimal::ZERO))
    }
}

//! Trading risk control engine.
//!
//! Admission control for order submission: per-user loss limits across
//! overlapping time windows, circuit breakers, trading halts with operator
//! override, and risk-score-derived position sizing, all behind a single
//! [`RiskControlGateway`].

pub mod breakers;
pub mod gateway;
pub mod halts;
pub mod limit_store;
pub mod loss_processor;
pub mod persistence;
pub mod providers;
pub mod sizing;

pub use breakers::{BreakerRegistry, BreakerTrip};
pub use gateway::RiskControlGateway;
pub use halts::HaltRegistry;
pub use limit_store::LimitStore;
pub use loss_processor::{LossEventProcessor, LossOutcome};
pub use persistence::{BreakerStorage, HaltStorage, LimitStorage};
pub use providers::{
    PortfolioProvider, RiskAssessmentProvider, StaticAssessmentProvider, StaticPortfolioProvider,
};

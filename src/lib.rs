//! Trading risk control engine.
//!
//! Convenience facade over the workspace crates. Most integrations only need
//! [`RiskControlGateway`] plus the shared types:
//!
//! - `tradeguard-core`: shared types, errors, configuration
//! - `tradeguard-engine`: loss limits, circuit breakers, halts, the gateway

pub use tradeguard_core::config::{
    BreakerConfig, EngineConfig, LimitConfig, PositionCheckMode, SizingConfig,
};
pub use tradeguard_core::types::{
    BreakerState, CircuitBreaker, HaltKind, LimitStatus, LossLimit, PeriodKind, PositionSizeLimit,
    RiskAssessment, RiskEvent, RiskLevel, RiskLimits, RiskSignal, Side, TradeDecision, TradingHalt,
    TriggerKind, UserId, UserStatus,
};
pub use tradeguard_core::{Error, Result};
pub use tradeguard_engine::{
    BreakerRegistry, BreakerStorage, BreakerTrip, HaltRegistry, HaltStorage, LimitStorage,
    LimitStore, LossEventProcessor, LossOutcome, PortfolioProvider, RiskAssessmentProvider,
    RiskControlGateway, StaticAssessmentProvider, StaticPortfolioProvider,
};

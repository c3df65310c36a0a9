//! Domain types for loss limits, circuit breakers, and trading halts.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier for a trading user/account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Accounting period a loss limit covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodKind {
    Session,
    Daily,
    Weekly,
    Monthly,
}

impl PeriodKind {
    /// All period kinds, in escalation reporting order: the daily limit is
    /// the canonical one, so its breach reason wins when several periods
    /// breach on the same loss.
    pub const ALL: [PeriodKind; 4] = [
        PeriodKind::Daily,
        PeriodKind::Weekly,
        PeriodKind::Monthly,
        PeriodKind::Session,
    ];

    /// Display label used in deny reasons and warnings.
    pub fn label(&self) -> &'static str {
        match self {
            PeriodKind::Session => "Session",
            PeriodKind::Daily => "Daily",
            PeriodKind::Weekly => "Weekly",
            PeriodKind::Monthly => "Monthly",
        }
    }
}

impl fmt::Display for PeriodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A capped amount of realized loss permitted within one period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossLimit {
    pub user: UserId,
    pub period: PeriodKind,
    /// Maximum loss allowed in the period (absolute value).
    pub limit_amount: Decimal,
    /// Loss accumulated since the last reset. Never negative.
    pub accumulated_loss: Decimal,
    /// Percentage of the limit at which a warning fires (e.g. 80 = 80%).
    pub warning_threshold_pct: Decimal,
    /// Percentage of the limit at which trading halts (e.g. 95 = 95%).
    pub halt_threshold_pct: Decimal,
    pub last_reset: DateTime<Utc>,
    pub next_reset: DateTime<Utc>,
    /// Number of times the halt threshold has been crossed.
    pub breach_count: u32,
}

impl LossLimit {
    pub fn new(
        user: UserId,
        period: PeriodKind,
        limit_amount: Decimal,
        warning_threshold_pct: Decimal,
        halt_threshold_pct: Decimal,
        now: DateTime<Utc>,
        next_reset: DateTime<Utc>,
    ) -> Self {
        Self {
            user,
            period,
            limit_amount,
            accumulated_loss: Decimal::ZERO,
            warning_threshold_pct,
            halt_threshold_pct,
            last_reset: now,
            next_reset,
            breach_count: 0,
        }
    }

    /// Percentage of the limit consumed so far (e.g. 96 = 96%).
    pub fn pct_used(&self) -> Decimal {
        if self.limit_amount <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.accumulated_loss / self.limit_amount * Decimal::ONE_HUNDRED
    }

    /// Whether the halt threshold is currently met.
    pub fn is_breached(&self) -> bool {
        self.pct_used() >= self.halt_threshold_pct
    }
}

/// Per-limit result of applying a loss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitStatus {
    pub period: PeriodKind,
    pub limit_amount: Decimal,
    pub accumulated_loss: Decimal,
    pub pct_used: Decimal,
    /// The warning threshold was crossed by this application (edge-triggered).
    pub warning_crossed: bool,
    /// The halt threshold was crossed by this application (edge-triggered).
    pub halt_crossed: bool,
}

/// What condition a circuit breaker watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    LossLimit,
    Drawdown,
    Velocity,
    Manual,
}

/// Lifecycle state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Armed,
    Triggered,
    CoolingDown,
    Disabled,
}

/// A stateful guard that trips on a defined condition and restricts trading
/// until it cools down or an operator re-arms it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub id: Uuid,
    pub user: UserId,
    pub trigger: TriggerKind,
    /// Human-readable condition, suitable for deny reasons.
    pub condition: String,
    pub state: BreakerState,
    pub triggered_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Re-arms automatically once the cooldown expires.
    pub auto_reset: bool,
    /// Stays in cooldown until an operator re-arms it.
    pub manual_reset_required: bool,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl CircuitBreaker {
    pub fn new(
        user: UserId,
        trigger: TriggerKind,
        condition: impl Into<String>,
        auto_reset: bool,
        manual_reset_required: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user,
            trigger,
            condition: condition.into(),
            state: BreakerState::Armed,
            triggered_at: None,
            cooldown_until: None,
            auto_reset,
            manual_reset_required,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    /// Whether this breaker currently blocks trading.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self.state,
            BreakerState::Triggered | BreakerState::CoolingDown
        )
    }
}

/// Category of a trading halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltKind {
    Emergency,
    RiskLimit,
    Compliance,
    Manual,
}

/// An explicit block on order submission for a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingHalt {
    pub id: Uuid,
    pub user: UserId,
    pub kind: HaltKind,
    /// Short display string, e.g. "Daily loss limit exceeded".
    pub reason: String,
    pub halted_at: DateTime<Utc>,
    pub lifted_at: Option<DateTime<Utc>>,
    pub active: bool,
    /// Only `override_halt` by an authorized operator can lift this halt.
    pub override_required: bool,
    pub overridden_by: Option<String>,
    /// Non-override halts are lifted automatically past this instant.
    pub expires_at: Option<DateTime<Utc>>,
    /// Context of the trigger that opened the halt.
    pub payload: serde_json::Value,
    /// Stable fingerprint of the trigger, used for duplicate suppression.
    pub signature: String,
}

impl TradingHalt {
    pub fn new(
        user: UserId,
        kind: HaltKind,
        reason: impl Into<String>,
        override_required: bool,
        payload: serde_json::Value,
    ) -> Self {
        let signature = payload_signature(&payload);
        Self {
            id: Uuid::new_v4(),
            user,
            kind,
            reason: reason.into(),
            halted_at: Utc::now(),
            lifted_at: None,
            active: true,
            override_required,
            overridden_by: None,
            expires_at: None,
            payload,
            signature,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

/// Stable fingerprint of a halt trigger payload.
///
/// serde_json maps serialize with sorted keys, so equal payloads always
/// produce equal signatures.
pub fn payload_signature(payload: &serde_json::Value) -> String {
    payload.to_string()
}

/// Order side for a trade admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

/// Coarse risk classification from the assessment provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Moderate,
    Elevated,
    High,
}

/// Hard limits configured by the risk assessment provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Base daily loss limit; other periods derive from it.
    pub max_daily_loss: Decimal,
    /// Maximum value of a single position before risk adjustment.
    pub max_position_size: Decimal,
    /// Maximum portfolio concentration in one symbol (percentage, e.g. 25 = 25%).
    pub max_portfolio_concentration: Decimal,
}

/// Risk assessment consumed from the external provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub user: UserId,
    /// Risk score in [0, 100]; higher means riskier.
    pub risk_score: Decimal,
    pub risk_level: RiskLevel,
    pub limits: RiskLimits,
    pub assessed_at: DateTime<Utc>,
}

/// Derived per-call position size limit. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSizeLimit {
    pub symbol: String,
    pub max_shares: Decimal,
    pub max_portfolio_pct: Decimal,
    pub current_shares: Decimal,
    pub current_portfolio_pct: Decimal,
    pub risk_adjustment_factor: Decimal,
}

/// Structured outcome of a trade admission check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub warnings: Vec<String>,
    pub restrictions: Vec<String>,
}

impl TradeDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            warnings: Vec::new(),
            restrictions: Vec::new(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            warnings: Vec::new(),
            restrictions: Vec::new(),
        }
    }
}

/// Typed input to breaker evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "signal")]
pub enum RiskSignal {
    /// A loss limit crossed its halt threshold.
    LossBreach {
        period: PeriodKind,
        pct_used: Decimal,
    },
    /// A fresh portfolio valuation sample.
    DrawdownSample {
        portfolio_value: Decimal,
        at: DateTime<Utc>,
    },
    /// An order was executed for the user.
    TradeExecuted { symbol: String, at: DateTime<Utc> },
}

/// Events emitted by the engine for collaborators to record.
///
/// The event stream is an immutable side-effect record, never the source of
/// truth for engine state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum RiskEvent {
    LimitWarning {
        user: UserId,
        period: PeriodKind,
        pct_used: Decimal,
    },
    LimitBreach {
        user: UserId,
        period: PeriodKind,
        pct_used: Decimal,
    },
    BreakerTripped {
        user: UserId,
        breaker_id: Uuid,
        trigger: TriggerKind,
        condition: String,
    },
    BreakerRearmed {
        user: UserId,
        breaker_id: Uuid,
        by: String,
    },
    HaltOpened {
        user: UserId,
        halt_id: Uuid,
        kind: HaltKind,
        reason: String,
    },
    HaltLifted {
        user: UserId,
        halt_id: Uuid,
        by: String,
    },
    /// Command to the external session collaborator: mark the user's active
    /// sessions halted.
    SessionsHalted {
        user: UserId,
        session_id: Option<String>,
        reason: String,
    },
}

/// Snapshot returned by the gateway's `status` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStatus {
    pub user: UserId,
    pub limits: Vec<LimitStatus>,
    pub active_breakers: Vec<CircuitBreaker>,
    pub active_halts: Vec<TradingHalt>,
    pub can_trade: bool,
}

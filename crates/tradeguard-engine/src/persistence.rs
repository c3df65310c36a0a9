//! Storage backends for loss limits, circuit breakers, and halts.
//!
//! Each entity has its own keyed table. The stores write through on every
//! mutation and rehydrate from storage on first access after a restart; in
//! between, memory is authoritative.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use tradeguard_core::types::{
    BreakerState, CircuitBreaker, HaltKind, LossLimit, PeriodKind, TradingHalt, TriggerKind,
    UserId,
};

/// Storage backend for per-user per-period loss limits.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LimitStorage: Send + Sync {
    async fn save(&self, limit: &LossLimit) -> Result<()>;
    async fn load_for_user(&self, user: &UserId) -> Result<Vec<LossLimit>>;
}

/// Storage backend for circuit breaker state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BreakerStorage: Send + Sync {
    async fn save(&self, breaker: &CircuitBreaker) -> Result<()>;
    async fn load_for_user(&self, user: &UserId) -> Result<Vec<CircuitBreaker>>;
}

/// Storage backend for trading halts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HaltStorage: Send + Sync {
    async fn save(&self, halt: &TradingHalt) -> Result<()>;
    async fn load_active_for_user(&self, user: &UserId) -> Result<Vec<TradingHalt>>;
}

/// Postgres repository for loss limits.
pub struct LimitRepository {
    pool: PgPool,
}

impl LimitRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LimitStorage for LimitRepository {
    /// Upsert one limit, keyed by `(user_id, period)`.
    async fn save(&self, limit: &LossLimit) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO loss_limits (
                user_id, period, limit_amount, accumulated_loss,
                warning_threshold_pct, halt_threshold_pct,
                last_reset, next_reset, breach_count, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (user_id, period) DO UPDATE SET
                limit_amount = $3,
                accumulated_loss = $4,
                warning_threshold_pct = $5,
                halt_threshold_pct = $6,
                last_reset = $7,
                next_reset = $8,
                breach_count = $9,
                updated_at = NOW()
            "#,
        )
        .bind(limit.user.as_str())
        .bind(period_to_string(limit.period))
        .bind(limit.limit_amount)
        .bind(limit.accumulated_loss)
        .bind(limit.warning_threshold_pct)
        .bind(limit.halt_threshold_pct)
        .bind(limit.last_reset)
        .bind(limit.next_reset)
        .bind(limit.breach_count as i32)
        .execute(&self.pool)
        .await?;

        debug!(user = %limit.user, period = %limit.period, "saved loss limit");
        Ok(())
    }

    /// Load all limits for a user.
    async fn load_for_user(&self, user: &UserId) -> Result<Vec<LossLimit>> {
        let rows = sqlx::query(
            r#"
            SELECT period, limit_amount, accumulated_loss,
                   warning_threshold_pct, halt_threshold_pct,
                   last_reset, next_reset, breach_count
            FROM loss_limits
            WHERE user_id = $1
            "#,
        )
        .bind(user.as_str())
        .fetch_all(&self.pool)
        .await?;

        let limits = rows
            .into_iter()
            .filter_map(|r| {
                let period = parse_period(r.get::<String, _>("period").as_str())?;
                Some(LossLimit {
                    user: user.clone(),
                    period,
                    limit_amount: r.get("limit_amount"),
                    accumulated_loss: r.get("accumulated_loss"),
                    warning_threshold_pct: r.get("warning_threshold_pct"),
                    halt_threshold_pct: r.get("halt_threshold_pct"),
                    last_reset: r.get("last_reset"),
                    next_reset: r.get("next_reset"),
                    breach_count: r.get::<i32, _>("breach_count") as u32,
                })
            })
            .collect();
        Ok(limits)
    }
}

/// Postgres repository for circuit breaker state.
pub struct BreakerRepository {
    pool: PgPool,
}

impl BreakerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BreakerStorage for BreakerRepository {
    async fn save(&self, breaker: &CircuitBreaker) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO circuit_breakers (
                id, user_id, trigger_kind, condition, state,
                triggered_at, cooldown_until, auto_reset,
                manual_reset_required, metadata, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
            ON CONFLICT (id) DO UPDATE SET
                state = $5,
                triggered_at = $6,
                cooldown_until = $7,
                metadata = $10,
                updated_at = NOW()
            "#,
        )
        .bind(breaker.id)
        .bind(breaker.user.as_str())
        .bind(trigger_to_string(breaker.trigger))
        .bind(&breaker.condition)
        .bind(state_to_string(breaker.state))
        .bind(breaker.triggered_at)
        .bind(breaker.cooldown_until)
        .bind(breaker.auto_reset)
        .bind(breaker.manual_reset_required)
        .bind(&breaker.metadata)
        .bind(breaker.created_at)
        .execute(&self.pool)
        .await?;

        debug!(breaker_id = %breaker.id, "saved circuit breaker");
        Ok(())
    }

    async fn load_for_user(&self, user: &UserId) -> Result<Vec<CircuitBreaker>> {
        let rows = sqlx::query(
            r#"
            SELECT id, trigger_kind, condition, state, triggered_at,
                   cooldown_until, auto_reset, manual_reset_required,
                   metadata, created_at
            FROM circuit_breakers
            WHERE user_id = $1
            "#,
        )
        .bind(user.as_str())
        .fetch_all(&self.pool)
        .await?;

        let breakers = rows
            .into_iter()
            .filter_map(|r| {
                let trigger = parse_trigger(r.get::<String, _>("trigger_kind").as_str())?;
                let state = parse_state(r.get::<String, _>("state").as_str())?;
                Some(CircuitBreaker {
                    id: r.get("id"),
                    user: user.clone(),
                    trigger,
                    condition: r.get("condition"),
                    state,
                    triggered_at: r.get("triggered_at"),
                    cooldown_until: r.get("cooldown_until"),
                    auto_reset: r.get("auto_reset"),
                    manual_reset_required: r.get("manual_reset_required"),
                    metadata: r.get("metadata"),
                    created_at: r.get("created_at"),
                })
            })
            .collect();
        Ok(breakers)
    }
}

/// Postgres repository for trading halts.
pub struct HaltRepository {
    pool: PgPool,
}

impl HaltRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HaltStorage for HaltRepository {
    async fn save(&self, halt: &TradingHalt) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trading_halts (
                id, user_id, kind, reason, halted_at, lifted_at, active,
                override_required, overridden_by, expires_at, payload,
                signature, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW())
            ON CONFLICT (id) DO UPDATE SET
                lifted_at = $6,
                active = $7,
                overridden_by = $9,
                updated_at = NOW()
            "#,
        )
        .bind(halt.id)
        .bind(halt.user.as_str())
        .bind(halt_kind_to_string(halt.kind))
        .bind(&halt.reason)
        .bind(halt.halted_at)
        .bind(halt.lifted_at)
        .bind(halt.active)
        .bind(halt.override_required)
        .bind(&halt.overridden_by)
        .bind(halt.expires_at)
        .bind(&halt.payload)
        .bind(&halt.signature)
        .execute(&self.pool)
        .await?;

        debug!(halt_id = %halt.id, active = halt.active, "saved trading halt");
        Ok(())
    }

    async fn load_active_for_user(&self, user: &UserId) -> Result<Vec<TradingHalt>> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, reason, halted_at, lifted_at, active,
                   override_required, overridden_by, expires_at, payload,
                   signature
            FROM trading_halts
            WHERE user_id = $1 AND active = TRUE
            "#,
        )
        .bind(user.as_str())
        .fetch_all(&self.pool)
        .await?;

        let halts = rows
            .into_iter()
            .filter_map(|r| {
                let kind = parse_halt_kind(r.get::<String, _>("kind").as_str())?;
                Some(TradingHalt {
                    id: r.get::<Uuid, _>("id"),
                    user: user.clone(),
                    kind,
                    reason: r.get("reason"),
                    halted_at: r.get("halted_at"),
                    lifted_at: r.get("lifted_at"),
                    active: r.get("active"),
                    override_required: r.get("override_required"),
                    overridden_by: r.get("overridden_by"),
                    expires_at: r.get("expires_at"),
                    payload: r.get("payload"),
                    signature: r.get("signature"),
                })
            })
            .collect();
        Ok(halts)
    }
}

fn period_to_string(period: PeriodKind) -> &'static str {
    match period {
        PeriodKind::Session => "session",
        PeriodKind::Daily => "daily",
        PeriodKind::Weekly => "weekly",
        PeriodKind::Monthly => "monthly",
    }
}

fn parse_period(s: &str) -> Option<PeriodKind> {
    match s {
        "session" => Some(PeriodKind::Session),
        "daily" => Some(PeriodKind::Daily),
        "weekly" => Some(PeriodKind::Weekly),
        "monthly" => Some(PeriodKind::Monthly),
        _ => None,
    }
}

fn trigger_to_string(trigger: TriggerKind) -> &'static str {
    match trigger {
        TriggerKind::LossLimit => "loss_limit",
        TriggerKind::Drawdown => "drawdown",
        TriggerKind::Velocity => "velocity",
        TriggerKind::Manual => "manual",
    }
}

fn parse_trigger(s: &str) -> Option<TriggerKind> {
    match s {
        "loss_limit" => Some(TriggerKind::LossLimit),
        "drawdown" => Some(TriggerKind::Drawdown),
        "velocity" => Some(TriggerKind::Velocity),
        "manual" => Some(TriggerKind::Manual),
        _ => None,
    }
}

fn state_to_string(state: BreakerState) -> &'static str {
    match state {
        BreakerState::Armed => "armed",
        BreakerState::Triggered => "triggered",
        BreakerState::CoolingDown => "cooling_down",
        BreakerState::Disabled => "disabled",
    }
}

fn parse_state(s: &str) -> Option<BreakerState> {
    match s {
        "armed" => Some(BreakerState::Armed),
        "triggered" => Some(BreakerState::Triggered),
        "cooling_down" => Some(BreakerState::CoolingDown),
        "disabled" => Some(BreakerState::Disabled),
        _ => None,
    }
}

fn halt_kind_to_string(kind: HaltKind) -> &'static str {
    match kind {
        HaltKind::Emergency => "emergency",
        HaltKind::RiskLimit => "risk_limit",
        HaltKind::Compliance => "compliance",
        HaltKind::Manual => "manual",
    }
}

fn parse_halt_kind(s: &str) -> Option<HaltKind> {
    match s {
        "emergency" => Some(HaltKind::Emergency),
        "risk_limit" => Some(HaltKind::RiskLimit),
        "compliance" => Some(HaltKind::Compliance),
        "manual" => Some(HaltKind::Manual),
        _ => None,
    }
}

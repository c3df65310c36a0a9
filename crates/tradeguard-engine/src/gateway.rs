//! The single admission gateway in front of order submission.
//!
//! Every trade passes through [`RiskControlGateway::check_trade`]; every
//! realized loss passes through [`RiskControlGateway::process_loss`]. The
//! gateway owns the stores and serializes all state changes for one user
//! behind a per-user scope, so concurrent losses and checks can never
//! interleave mid-update.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use tradeguard_core::config::{EngineConfig, PositionCheckMode};
use tradeguard_core::types::{
    HaltKind, LossLimit, RiskEvent, RiskSignal, Side, TradeDecision, TradingHalt, UserId,
    UserStatus,
};
use tradeguard_core::{Error, Result};

use crate::breakers::{BreakerRegistry, BreakerTrip};
use crate::halts::HaltRegistry;
use crate::limit_store::LimitStore;
use crate::loss_processor::{LossEventProcessor, LossOutcome};
use crate::providers::{PortfolioProvider, RiskAssessmentProvider};
use crate::sizing;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Risk control engine facade.
pub struct RiskControlGateway {
    config: EngineConfig,
    limits: Arc<LimitStore>,
    breakers: Arc<BreakerRegistry>,
    halts: Arc<HaltRegistry>,
    processor: LossEventProcessor,
    assessments: Arc<dyn RiskAssessmentProvider>,
    portfolio: Arc<dyn PortfolioProvider>,
    /// Per-user serialization scopes. Entries are created on first use and
    /// never removed.
    scopes: DashMap<UserId, Arc<Mutex<()>>>,
    events_tx: mpsc::Sender<RiskEvent>,
    events_rx: std::sync::Mutex<Option<mpsc::Receiver<RiskEvent>>>,
}

impl RiskControlGateway {
    pub fn new(
        config: EngineConfig,
        assessments: Arc<dyn RiskAssessmentProvider>,
        portfolio: Arc<dyn PortfolioProvider>,
    ) -> Self {
        let limits = Arc::new(LimitStore::new(config.limits.clone()));
        let breakers = Arc::new(BreakerRegistry::new(config.breakers.clone()));
        let halts = Arc::new(HaltRegistry::new(config.operators.clone()));
        Self::from_parts(config, limits, breakers, halts, assessments, portfolio)
    }

    /// Gateway with write-through persistence for limits, breakers, and
    /// halts.
    pub fn with_persistence(
        config: EngineConfig,
        pool: PgPool,
        assessments: Arc<dyn RiskAssessmentProvider>,
        portfolio: Arc<dyn PortfolioProvider>,
    ) -> Self {
        let limits = Arc::new(LimitStore::with_persistence(
            config.limits.clone(),
            pool.clone(),
        ));
        let breakers = Arc::new(BreakerRegistry::with_persistence(
            config.breakers.clone(),
            pool.clone(),
        ));
        let halts = Arc::new(HaltRegistry::with_persistence(
            config.operators.clone(),
            pool,
        ));
        Self::from_parts(config, limits, breakers, halts, assessments, portfolio)
    }

    /// Gateway over pre-built stores, for callers wiring their own storage
    /// backends.
    pub fn from_parts(
        config: EngineConfig,
        limits: Arc<LimitStore>,
        breakers: Arc<BreakerRegistry>,
        halts: Arc<HaltRegistry>,
        assessments: Arc<dyn RiskAssessmentProvider>,
        portfolio: Arc<dyn PortfolioProvider>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let processor = LossEventProcessor::new(
            limits.clone(),
            breakers.clone(),
            halts.clone(),
            events_tx.clone(),
        );
        Self {
            config,
            limits,
            breakers,
            halts,
            processor,
            assessments,
            portfolio,
            scopes: DashMap::new(),
            events_tx,
            events_rx: std::sync::Mutex::new(Some(events_rx)),
        }
    }

    /// Take the risk event receiver. Can only be taken once.
    pub fn take_event_receiver(&self) -> Option<mpsc::Receiver<RiskEvent>> {
        self.events_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Set up loss limits and default circuit breakers for a user from their
    /// current risk assessment. Idempotent.
    pub async fn initialize_user(&self, user: &UserId) -> Result<Vec<LossLimit>> {
        let assessment = self
            .assessments
            .assessment(user)
            .await?
            .ok_or_else(|| Error::MissingRiskAssessment {
                user: user.to_string(),
            })?;

        let _scope = self.scope(user).await?;
        self.hydrate(user).await;
        let limits = self.limits.initialize(&assessment, Utc::now()).await?;
        self.breakers.initialize(user).await;
        Ok(limits)
    }

    /// Admission check for a proposed trade.
    ///
    /// Deny reasons are checked in precedence order: active halts, blocking
    /// breakers, breached limits, then the position-size check. An allowed
    /// decision may still carry soft warnings and restrictions.
    pub async fn check_trade(
        &self,
        user: &UserId,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<TradeDecision> {
        if quantity <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "trade quantity must be positive, got {quantity}"
            )));
        }
        let _scope = self.scope(user).await?;
        self.hydrate(user).await;
        if !self.limits.is_initialized(user) {
            return Err(Error::UserNotInitialized(user.to_string()));
        }

        // Housekeeping before judging: expire boundaries, cooldowns, and
        // timed halts so a stale block never outlives its window. The scope
        // is held, so only this user's state is touched.
        self.limits.maybe_reset(user, now).await;
        self.breakers.tick_user(user, now).await;
        self.halts.tick_user(user, now).await;

        let active_halts = self.halts.active_halts(user);
        if let Some(halt) = active_halts.first() {
            info!(
                user = %user,
                symbol = %symbol,
                halt_id = %halt.id,
                reason = %halt.reason,
                "trade denied by active halt"
            );
            return Ok(TradeDecision::deny(halt.reason.clone()));
        }

        let blocking = self.breakers.blocking(user);
        if let Some(breaker) = blocking.first() {
            info!(
                user = %user,
                symbol = %symbol,
                breaker_id = %breaker.id,
                "trade denied by circuit breaker"
            );
            return Ok(TradeDecision::deny(format!(
                "Circuit breaker: {}",
                breaker.condition
            )));
        }

        if let Some(period) = self.limits.any_breached(user) {
            return Ok(TradeDecision::deny(format!(
                "{} loss limit exceeded",
                period.label()
            )));
        }

        let mut decision = TradeDecision::allow();

        // Sells reduce exposure and skip the sizing check.
        if side == Side::Buy {
            match self.position_violation(user, symbol, quantity, price).await {
                Ok(Some(violation)) => match self.config.sizing.position_check_mode {
                    PositionCheckMode::Deny => return Ok(TradeDecision::deny(violation)),
                    PositionCheckMode::Warn => decision.restrictions.push(violation),
                },
                Ok(None) => {}
                Err(e) => {
                    // Fail closed: an unreachable provider means we cannot
                    // prove the trade is safe.
                    error!(
                        user = %user,
                        symbol = %symbol,
                        error = %e,
                        "risk data unavailable, denying trade"
                    );
                    let mut denied = TradeDecision::deny("Risk system unavailable");
                    denied
                        .restrictions
                        .push("risk system unavailable".to_string());
                    return Ok(denied);
                }
            }
        }

        for status in self.limits.statuses(user) {
            if status.pct_used >= self.config.limits.soft_warning_pct {
                decision.warnings.push(format!(
                    "{} loss limit at {}% usage",
                    status.period,
                    status.pct_used.round_dp(1)
                ));
            }
        }

        Ok(decision)
    }

    /// Apply a realized loss and run the escalation pipeline.
    pub async fn process_loss(
        &self,
        user: &UserId,
        session_id: Option<&str>,
        amount: Decimal,
        symbol: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<LossOutcome> {
        let _scope = self.scope(user).await?;
        self.hydrate(user).await;
        self.processor.process(user, session_id, amount, symbol, now).await
    }

    /// Feed an executed trade into the velocity breaker.
    pub async fn record_trade_executed(
        &self,
        user: &UserId,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let _scope = self.scope(user).await?;
        self.hydrate(user).await;
        let signal = RiskSignal::TradeExecuted {
            symbol: symbol.to_string(),
            at: now,
        };
        let trips = self.breakers.evaluate(user, &signal, now).await;
        self.handle_trips(trips).await;
        Ok(())
    }

    /// Feed a portfolio valuation sample into the drawdown breaker.
    pub async fn record_portfolio_value(
        &self,
        user: &UserId,
        portfolio_value: Decimal,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let _scope = self.scope(user).await?;
        self.hydrate(user).await;
        let signal = RiskSignal::DrawdownSample {
            portfolio_value,
            at: now,
        };
        let trips = self.breakers.evaluate(user, &signal, now).await;
        self.handle_trips(trips).await;
        Ok(())
    }

    /// Open a manual or compliance halt for a user. The payload identifies
    /// the trigger for duplicate suppression.
    pub async fn trigger_halt(
        &self,
        user: &UserId,
        kind: HaltKind,
        reason: &str,
        override_required: bool,
        payload: serde_json::Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<TradingHalt> {
        let _scope = self.scope(user).await?;
        self.hydrate(user).await;
        let halt = self
            .halts
            .open_halt(user, kind, reason, override_required, payload, expires_at)
            .await;
        self.emit(RiskEvent::HaltOpened {
            user: user.clone(),
            halt_id: halt.id,
            kind: halt.kind,
            reason: halt.reason.clone(),
        });
        self.emit(RiskEvent::SessionsHalted {
            user: user.clone(),
            session_id: None,
            reason: halt.reason.clone(),
        });
        Ok(halt)
    }

    /// Lift an override-required halt as an authorized operator.
    pub async fn override_halt(
        &self,
        halt_id: Uuid,
        operator: &str,
        reason: Option<&str>,
    ) -> Result<TradingHalt> {
        let halt = self.halts.override_halt(halt_id, operator, reason).await?;
        if !halt.active {
            self.emit(RiskEvent::HaltLifted {
                user: halt.user.clone(),
                halt_id: halt.id,
                by: operator.to_string(),
            });
        }
        Ok(halt)
    }

    /// Lift a halt that does not require an override.
    pub async fn close_halt(&self, halt_id: Uuid, by: &str) -> Result<TradingHalt> {
        let halt = self.halts.close_halt(halt_id, by).await?;
        if !halt.active {
            self.emit(RiskEvent::HaltLifted {
                user: halt.user.clone(),
                halt_id: halt.id,
                by: by.to_string(),
            });
        }
        Ok(halt)
    }

    /// Operator re-arm of a tripped or disabled breaker.
    pub async fn rearm_breaker(&self, breaker_id: Uuid, operator: &str) -> Result<()> {
        let breaker = self.breakers.rearm(breaker_id, operator).await?;
        self.emit(RiskEvent::BreakerRearmed {
            user: breaker.user.clone(),
            breaker_id,
            by: operator.to_string(),
        });
        Ok(())
    }

    /// Take a breaker out of service until re-armed.
    pub async fn disable_breaker(&self, breaker_id: Uuid, operator: &str) -> Result<()> {
        self.breakers.disable(breaker_id, operator).await?;
        Ok(())
    }

    /// Operator reset of every loss counter for a user, regardless of
    /// schedule.
    pub async fn reset_limits(&self, user: &UserId, operator: &str) -> Result<()> {
        let _scope = self.scope(user).await?;
        self.hydrate(user).await;
        self.limits.force_reset(user, Utc::now()).await?;
        warn!(user = %user, operator = %operator, "loss limits reset by operator");
        Ok(())
    }

    /// Snapshot of everything currently constraining a user.
    pub async fn status(&self, user: &UserId) -> Result<UserStatus> {
        self.hydrate(user).await;
        if !self.limits.is_initialized(user) {
            return Err(Error::UserNotInitialized(user.to_string()));
        }
        let active_halts = self.halts.active_halts(user);
        let active_breakers = self.breakers.blocking(user);
        let limits = self.limits.statuses(user);
        let can_trade = active_halts.is_empty()
            && active_breakers.is_empty()
            && self.limits.any_breached(user).is_none();
        Ok(UserStatus {
            user: user.clone(),
            limits,
            active_breakers,
            active_halts,
            can_trade,
        })
    }

    /// Pull the user's limits, breakers, and halts out of storage if this is
    /// the first time the process sees them. No-op without storage or once
    /// memory holds state for the user.
    async fn hydrate(&self, user: &UserId) {
        self.limits.hydrate(user).await;
        self.breakers.hydrate(user).await;
        self.halts.hydrate(user).await;
    }

    /// Acquire the user's serialization scope, bounded by the configured
    /// timeout.
    async fn scope(&self, user: &UserId) -> Result<OwnedMutexGuard<()>> {
        let lock = self
            .scopes
            .entry(user.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        timeout(
            Duration::from_millis(self.config.lock_timeout_ms),
            lock.lock_owned(),
        )
        .await
        .map_err(|_| {
            Error::ConcurrencyConflict(format!(
                "timed out waiting for risk scope of user {user}"
            ))
        })
    }

    /// Open the halt mirroring each breaker trip.
    ///
    /// Manual-reset breakers get an override-required halt; auto-reset
    /// breakers get a halt expiring with the cooldown, so both lift together.
    async fn handle_trips(&self, trips: Vec<BreakerTrip>) {
        for trip in trips {
            self.emit(RiskEvent::BreakerTripped {
                user: trip.user.clone(),
                breaker_id: trip.breaker_id,
                trigger: trip.trigger,
                condition: trip.condition.clone(),
            });

            let reason = format!("Circuit breaker: {}", trip.condition);
            let payload = json!({
                "trigger": "circuit_breaker",
                "breaker_id": trip.breaker_id,
            });
            let expires_at = if trip.manual_reset_required {
                None
            } else {
                Some(trip.cooldown_until)
            };
            let halt = self
                .halts
                .open_halt(
                    &trip.user,
                    HaltKind::RiskLimit,
                    &reason,
                    trip.manual_reset_required,
                    payload,
                    expires_at,
                )
                .await;
            self.emit(RiskEvent::HaltOpened {
                user: trip.user.clone(),
                halt_id: halt.id,
                kind: halt.kind,
                reason: halt.reason.clone(),
            });
            self.emit(RiskEvent::SessionsHalted {
                user: trip.user.clone(),
                session_id: None,
                reason: halt.reason,
            });
        }
    }

    /// Buy-side position sizing check. `Ok(Some(..))` describes a violation.
    async fn position_violation(
        &self,
        user: &UserId,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<Option<String>> {
        let assessment = self.assessments.assessment(user).await?.ok_or_else(|| {
            Error::MissingRiskAssessment {
                user: user.to_string(),
            }
        })?;
        let portfolio_value = self.portfolio.total_value(user).await?;
        let current_shares = self.portfolio.position_size(user, symbol).await?;

        let limit = sizing::position_size_limit(
            symbol,
            assessment.risk_score,
            &assessment.limits,
            portfolio_value,
            price,
            current_shares,
            self.config.sizing.default_lot_size,
        );

        let projected = current_shares + quantity;
        if projected > limit.max_shares {
            return Ok(Some(format!(
                "Position size limited to {} shares of {} (risk adjustment {})",
                limit.max_shares, symbol, limit.risk_adjustment_factor
            )));
        }
        Ok(None)
    }

    fn emit(&self, event: RiskEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            error!(error = %e, "dropping risk event, channel unavailable");
        }
    }
}

//! Per-user circuit breakers with trigger rules and lifecycle state.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::PgPool;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use tradeguard_core::config::BreakerConfig;
use tradeguard_core::types::{
    BreakerState, CircuitBreaker, PeriodKind, RiskSignal, TriggerKind, UserId,
};
use tradeguard_core::{Error, Result};

use crate::persistence::{BreakerRepository, BreakerStorage};

/// A breaker that tripped during an evaluation pass.
#[derive(Debug, Clone)]
pub struct BreakerTrip {
    pub breaker_id: Uuid,
    pub user: UserId,
    pub trigger: TriggerKind,
    pub condition: String,
    /// The tripped breaker requires a manual re-arm by an operator.
    pub manual_reset_required: bool,
    pub cooldown_until: DateTime<Utc>,
}

/// Registry of circuit breakers, keyed by breaker id with a per-user index.
pub struct BreakerRegistry {
    breakers: DashMap<Uuid, CircuitBreaker>,
    by_user: DashMap<UserId, Vec<Uuid>>,
    /// Rolling portfolio value samples for drawdown measurement.
    drawdown_samples: DashMap<UserId, VecDeque<(DateTime<Utc>, Decimal)>>,
    /// Rolling trade timestamps for velocity counting.
    trade_times: DashMap<UserId, VecDeque<DateTime<Utc>>>,
    config: BreakerConfig,
    repo: Option<Arc<dyn BreakerStorage>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            by_user: DashMap::new(),
            drawdown_samples: DashMap::new(),
            trade_times: DashMap::new(),
            config,
            repo: None,
        }
    }

    pub fn with_persistence(config: BreakerConfig, pool: PgPool) -> Self {
        Self::with_storage(config, Arc::new(BreakerRepository::new(pool)))
    }

    pub fn with_storage(config: BreakerConfig, storage: Arc<dyn BreakerStorage>) -> Self {
        Self {
            repo: Some(storage),
            ..Self::new(config)
        }
    }

    /// Load the user's breakers from storage if they are not in memory yet.
    /// Returns whether anything was loaded.
    pub async fn hydrate(&self, user: &UserId) -> bool {
        if self.by_user.contains_key(user) {
            return false;
        }
        let Some(repo) = &self.repo else {
            return false;
        };
        match repo.load_for_user(user).await {
            Ok(loaded) if !loaded.is_empty() => {
                let ids: Vec<Uuid> = loaded.iter().map(|b| b.id).collect();
                info!(
                    user = %user,
                    breakers = ids.len(),
                    "rehydrated circuit breakers from storage"
                );
                for breaker in loaded {
                    self.breakers.insert(breaker.id, breaker);
                }
                self.by_user.insert(user.clone(), ids);
                true
            }
            Ok(_) => false,
            Err(e) => {
                error!(user = %user, error = %e, "failed to load circuit breakers");
                false
            }
        }
    }

    /// Arm the three default breakers for a user. Idempotent.
    pub async fn initialize(&self, user: &UserId) -> Vec<Uuid> {
        if let Some(existing) = self.by_user.get(user) {
            return existing.clone();
        }

        let mut loss = CircuitBreaker::new(
            user.clone(),
            TriggerKind::LossLimit,
            "daily loss limit reached",
            false,
            true,
        );
        loss.metadata = json!({ "trigger_pct": self.config.loss_limit_trigger_pct });

        let mut drawdown = CircuitBreaker::new(
            user.clone(),
            TriggerKind::Drawdown,
            "excessive portfolio drawdown",
            false,
            true,
        );
        drawdown.metadata = json!({
            "max_drawdown_pct": self.config.max_drawdown_pct,
            "window_hours": self.config.drawdown_window_hours,
        });

        let mut velocity = CircuitBreaker::new(
            user.clone(),
            TriggerKind::Velocity,
            "high velocity trading",
            true,
            false,
        );
        velocity.metadata = json!({
            "max_trades": self.config.velocity_max_trades,
            "window_minutes": self.config.velocity_window_minutes,
        });

        let mut ids = Vec::with_capacity(3);
        for breaker in [loss, drawdown, velocity] {
            ids.push(breaker.id);
            self.persist(&breaker).await;
            self.breakers.insert(breaker.id, breaker);
        }
        self.by_user.insert(user.clone(), ids.clone());

        info!(user = %user, "armed default circuit breakers");
        ids
    }

    /// Run the evaluators matching the signal's trigger kind and trip any
    /// armed breaker whose condition holds.
    pub async fn evaluate(
        &self,
        user: &UserId,
        signal: &RiskSignal,
        now: DateTime<Utc>,
    ) -> Vec<BreakerTrip> {
        let condition_holds = match signal {
            RiskSignal::LossBreach { period, pct_used } => {
                self.evaluate_loss_breach(*period, *pct_used)
            }
            RiskSignal::DrawdownSample {
                portfolio_value,
                at,
            } => self.evaluate_drawdown(user, *portfolio_value, *at),
            RiskSignal::TradeExecuted { at, .. } => self.evaluate_velocity(user, *at),
        };

        if !condition_holds {
            return Vec::new();
        }

        let kind = match signal {
            RiskSignal::LossBreach { .. } => TriggerKind::LossLimit,
            RiskSignal::DrawdownSample { .. } => TriggerKind::Drawdown,
            RiskSignal::TradeExecuted { .. } => TriggerKind::Velocity,
        };

        let ids = self
            .by_user
            .get(user)
            .map(|e| e.clone())
            .unwrap_or_default();

        let mut trips = Vec::new();
        for id in ids {
            let tripped = {
                let mut entry = match self.breakers.get_mut(&id) {
                    Some(e) => e,
                    None => continue,
                };
                let breaker = entry.value_mut();
                if breaker.trigger != kind || breaker.state != BreakerState::Armed {
                    continue;
                }

                // Armed -> Triggered, then immediately into cooldown.
                breaker.state = BreakerState::Triggered;
                breaker.triggered_at = Some(now);
                let cooldown_until = now + Duration::minutes(self.config.cooldown_minutes);
                breaker.cooldown_until = Some(cooldown_until);
                breaker.state = BreakerState::CoolingDown;

                error!(
                    user = %user,
                    breaker_id = %breaker.id,
                    trigger = ?breaker.trigger,
                    cooldown_until = %cooldown_until,
                    "circuit breaker TRIPPED"
                );

                BreakerTrip {
                    breaker_id: breaker.id,
                    user: user.clone(),
                    trigger: breaker.trigger,
                    condition: breaker.condition.clone(),
                    manual_reset_required: breaker.manual_reset_required,
                    cooldown_until,
                }
            };
            self.persist_by_id(tripped.breaker_id).await;
            trips.push(tripped);
        }
        trips
    }

    /// Move expired auto-reset breakers from cooldown back to armed, across
    /// all users. Breakers requiring a manual reset stay in cooldown.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut rearmed = Vec::new();
        for mut entry in self.breakers.iter_mut() {
            if rearm_if_cooled(entry.value_mut(), now) {
                rearmed.push(*entry.key());
            }
        }
        for id in &rearmed {
            self.persist_by_id(*id).await;
        }
        rearmed
    }

    /// Per-user [`tick`](Self::tick), for callers already holding that
    /// user's scope. Touches no other user's state.
    pub async fn tick_user(&self, user: &UserId, now: DateTime<Utc>) -> Vec<Uuid> {
        let ids = self
            .by_user
            .get(user)
            .map(|e| e.clone())
            .unwrap_or_default();
        let mut rearmed = Vec::new();
        for id in ids {
            let mut entry = match self.breakers.get_mut(&id) {
                Some(e) => e,
                None => continue,
            };
            if rearm_if_cooled(entry.value_mut(), now) {
                rearmed.push(id);
            }
        }
        for id in &rearmed {
            self.persist_by_id(*id).await;
        }
        rearmed
    }

    /// Operator re-arm of a cooling-down or disabled breaker.
    pub async fn rearm(&self, breaker_id: Uuid, operator: &str) -> Result<CircuitBreaker> {
        let snapshot = {
            let mut entry = self
                .breakers
                .get_mut(&breaker_id)
                .ok_or(Error::BreakerNotFound(breaker_id))?;
            let breaker = entry.value_mut();

            match breaker.state {
                BreakerState::Armed => {}
                BreakerState::Triggered | BreakerState::CoolingDown | BreakerState::Disabled => {
                    breaker.state = BreakerState::Armed;
                    breaker.triggered_at = None;
                    breaker.cooldown_until = None;
                    info!(
                        user = %breaker.user,
                        breaker_id = %breaker_id,
                        operator = %operator,
                        "circuit breaker re-armed by operator"
                    );
                }
            }
            breaker.clone()
        };
        self.persist(&snapshot).await;
        Ok(snapshot)
    }

    /// Take a breaker out of service until an operator re-arms it.
    pub async fn disable(&self, breaker_id: Uuid, operator: &str) -> Result<CircuitBreaker> {
        let snapshot = {
            let mut entry = self
                .breakers
                .get_mut(&breaker_id)
                .ok_or(Error::BreakerNotFound(breaker_id))?;
            let breaker = entry.value_mut();
            breaker.state = BreakerState::Disabled;
            warn!(
                user = %breaker.user,
                breaker_id = %breaker_id,
                operator = %operator,
                "circuit breaker disabled"
            );
            breaker.clone()
        };
        self.persist(&snapshot).await;
        Ok(snapshot)
    }

    /// Breakers currently blocking trading for a user.
    pub fn blocking(&self, user: &UserId) -> Vec<CircuitBreaker> {
        self.breakers_for(user)
            .into_iter()
            .filter(|b| b.is_blocking())
            .collect()
    }

    pub fn breakers_for(&self, user: &UserId) -> Vec<CircuitBreaker> {
        self.by_user
            .get(user)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.breakers.get(id).map(|b| b.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get(&self, breaker_id: Uuid) -> Option<CircuitBreaker> {
        self.breakers.get(&breaker_id).map(|b| b.clone())
    }

    // Evaluators, one per trigger kind. Manual breakers have no signal and
    // only change state through operator calls.

    /// Only the canonical daily limit trips the loss breaker; the wider and
    /// narrower periods open halts without one.
    fn evaluate_loss_breach(&self, period: PeriodKind, pct_used: Decimal) -> bool {
        period == PeriodKind::Daily && pct_used >= self.config.loss_limit_trigger_pct
    }

    fn evaluate_drawdown(&self, user: &UserId, value: Decimal, at: DateTime<Utc>) -> bool {
        let window = Duration::hours(self.config.drawdown_window_hours);
        let mut samples = self.drawdown_samples.entry(user.clone()).or_default();
        samples.push_back((at, value));
        while let Some((ts, _)) = samples.front() {
            if *ts < at - window {
                samples.pop_front();
            } else {
                break;
            }
        }

        let peak = samples
            .iter()
            .map(|(_, v)| *v)
            .max()
            .unwrap_or(Decimal::ZERO);
        if peak <= Decimal::ZERO {
            return false;
        }

        let drawdown_pct = (peak - value) / peak * Decimal::ONE_HUNDRED;
        drawdown_pct >= self.config.max_drawdown_pct
    }

    fn evaluate_velocity(&self, user: &UserId, at: DateTime<Utc>) -> bool {
        let window = Duration::minutes(self.config.velocity_window_minutes);
        let mut times = self.trade_times.entry(user.clone()).or_default();
        times.push_back(at);
        while let Some(ts) = times.front() {
            if *ts < at - window {
                times.pop_front();
            } else {
                break;
            }
        }
        times.len() > self.config.velocity_max_trades
    }

    async fn persist_by_id(&self, id: Uuid) {
        if self.repo.is_some() {
            if let Some(breaker) = self.get(id) {
                self.persist(&breaker).await;
            }
        }
    }

    async fn persist(&self, breaker: &CircuitBreaker) {
        if let Some(repo) = &self.repo {
            if let Err(e) = repo.save(breaker).await {
                error!(
                    breaker_id = %breaker.id,
                    error = %e,
                    "failed to persist circuit breaker"
                );
            }
        }
    }
}

fn rearm_if_cooled(breaker: &mut CircuitBreaker, now: DateTime<Utc>) -> bool {
    if breaker.state != BreakerState::CoolingDown {
        return false;
    }
    if breaker.manual_reset_required || !breaker.auto_reset {
        return false;
    }
    if breaker.cooldown_until.map(|t| t <= now).unwrap_or(false) {
        breaker.state = BreakerState::Armed;
        breaker.triggered_at = None;
        breaker.cooldown_until = None;
        info!(
            user = %breaker.user,
            breaker_id = %breaker.id,
            "circuit breaker auto re-armed after cooldown"
        );
        true
    } else {
        false
    }
}
